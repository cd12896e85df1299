//! The protocol engine: ties the session, reliability, routing, pub/sub, and
//! OTA machinery to the host's platform
//!
//! The engine performs no I/O of its own and has no threads. The host calls
//! [`Engine::process`] regularly (every few milliseconds to every few hundred,
//! depending on latency goals); each call flushes queued acknowledgements,
//! pulls at most one datagram from the transport, services timers, and drives
//! retransmission. Host-facing notifications accumulate internally and are
//! drained with [`Engine::poll`].

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::{
    config::{ConfigError, EngineConfig},
    error::ProtocolError,
    events::HostEvent,
    message::{EventDelivery, EventFlags, Message, MessageKind, Payload, SubscriptionScope, Token},
    ota::Ota,
    platform::{BlobKind, Platform},
    pubsub::{EventHandler, PubSub, SubscriptionHandle},
    reliability::{Reliability, SendPurpose},
    router::{FunctionHandler, Router, VariableReader},
    session::{self, HandshakeStep, ResumeBlob, Session, SessionState},
    timer::{Timer, TimerTable},
    MAX_EVENT_DATA_LENGTH, MAX_EVENT_NAME_LENGTH, MAX_EVENT_TTL,
};

/// Message ids feed the AEAD nonce, so the id space must never wrap while one
/// set of session keys is live. Rekeying this far ahead leaves room for the
/// resume skip on top of traffic sent since the last blob save.
const ID_REKEY_THRESHOLD: u16 = u16::MAX - 2 * session::ID_RESUME_SKIP;

/// Device-side protocol engine, generic over the host [`Platform`]
pub struct Engine<P: Platform> {
    config: EngineConfig,
    platform: P,
    session: Session,
    reliability: Reliability,
    router: Router,
    pubsub: PubSub,
    ota: Ota,
    timers: TimerTable,
    events: VecDeque<HostEvent>,
    /// Receive scratch, sized to `protocol_buffer_size`
    buf: Vec<u8>,
    token_counter: u16,
    auto_reconnect: bool,
    backoff: u64,
}

impl<P: Platform> Engine<P> {
    /// Build an engine over the host platform; fails on inconsistent limits
    pub fn new(config: EngineConfig, mut platform: P) -> Result<Self, ConfigError> {
        // A maximum-size chunk must fit the scratch buffer with room for
        // framing and the AEAD tag
        if config.max_chunk_size as usize + 64 > config.protocol_buffer_size {
            return Err(ConfigError::OutOfBounds);
        }
        let now = platform.millis();
        Ok(Self {
            buf: vec![0; config.protocol_buffer_size],
            session: Session::new(),
            reliability: Reliability::new(now),
            router: Router::new(config.max_functions, config.max_variables),
            pubsub: PubSub::new(
                config.max_subscriptions,
                config.publish_burst,
                config.publish_refill_interval,
                now,
            ),
            ota: Ota::new(config.max_chunk_size),
            timers: TimerTable::default(),
            events: VecDeque::new(),
            token_counter: 0,
            auto_reconnect: false,
            backoff: config.reconnect_backoff_min,
            config,
            platform,
        })
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Begin connecting; completion is reported via [`HostEvent::Connected`]
    ///
    /// Subsequent disconnections reconnect automatically (with backoff) until
    /// [`Engine::disconnect`] is called.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        match self.session.state() {
            SessionState::Handshaking | SessionState::Established | SessionState::Resumed => {
                return Err(ProtocolError::InvalidState);
            }
            _ => {}
        }
        self.auto_reconnect = true;
        let now = self.platform.millis();
        self.start_handshake(now)
    }

    /// Send a goodbye, persist resumable state, and stop reconnecting
    pub fn disconnect(&mut self) {
        self.auto_reconnect = false;
        if self.session.state().is_active() {
            let now = self.platform.millis();
            // Best effort on the way out
            let _ = self.send_payload(
                MessageKind::NonConfirmable,
                Token::EMPTY,
                &Payload::Goodbye,
                None,
                now,
            );
            self.save_session_blob();
        }
        self.ota.peer_abort(&mut self.platform, &mut self.events);
        info!("disconnected");
        self.session.reset();
        self.reliability.clear();
        self.timers.reset();
    }

    /// Run one iteration of the protocol loop
    pub fn process(&mut self) {
        let now = self.platform.millis();
        self.flush_acks();
        self.receive_one(now);
        self.rekey_if_needed(now);
        self.service_timers(now);
        self.service_retransmits(now);
    }

    /// Drain the next host notification
    pub fn poll(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }

    /// Publish an event to the cloud
    ///
    /// With `AckRequired` delivery, the outcome arrives later as
    /// `PublishAcked` or `PublishFailed`; `NoAck` publishes succeed as soon
    /// as the datagram is handed to the transport.
    pub fn publish(
        &mut self,
        name: &str,
        data: &str,
        ttl: u32,
        flags: EventFlags,
    ) -> Result<(), ProtocolError> {
        if name.is_empty()
            || name.len() > MAX_EVENT_NAME_LENGTH
            || data.len() > MAX_EVENT_DATA_LENGTH
            || ttl > MAX_EVENT_TTL
        {
            return Err(ProtocolError::MalformedMessage);
        }
        if !self.session.state().is_active() {
            return Err(ProtocolError::InvalidState);
        }
        let now = self.platform.millis();
        self.pubsub.take_publish_token(now)?;
        let payload = Payload::Event {
            name: name.into(),
            data: data.into(),
            ttl,
            flags,
        };
        let (kind, purpose) = match flags.delivery {
            EventDelivery::AckRequired => (
                MessageKind::Confirmable,
                Some(SendPurpose::Publish(name.into())),
            ),
            EventDelivery::NoAck => (MessageKind::NonConfirmable, None),
        };
        self.send_payload(kind, Token::EMPTY, &payload, purpose, now)
    }

    /// Subscribe to events whose name starts with `filter`
    ///
    /// The subscription is stored locally and announced to the peer now (if
    /// connected) and again after every session establishment.
    pub fn subscribe(
        &mut self,
        filter: &str,
        scope: SubscriptionScope,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle, ProtocolError> {
        let handle = self.pubsub.subscribe(filter, scope, None, handler)?;
        if self.session.state().is_active() {
            let now = self.platform.millis();
            let payload = Payload::Subscribe {
                filter: filter.into(),
                scope,
                device_id: None,
            };
            self.send_payload(
                MessageKind::Confirmable,
                Token::EMPTY,
                &payload,
                Some(SendPurpose::Subscribe(filter.into())),
                now,
            )?;
        }
        Ok(handle)
    }

    /// Remove one subscription; peer-side state ages out on its own
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        self.pubsub.unsubscribe(handle);
    }

    /// Remove every subscription
    pub fn unsubscribe_all(&mut self) {
        self.pubsub.unsubscribe_all();
    }

    /// Expose a function callable from the cloud
    pub fn register_function(
        &mut self,
        key: &str,
        handler: FunctionHandler,
    ) -> Result<(), ProtocolError> {
        self.router.register_function(key, handler)
    }

    /// Expose a variable readable from the cloud
    pub fn register_variable(
        &mut self,
        key: &str,
        reader: VariableReader,
    ) -> Result<(), ProtocolError> {
        self.router.register_variable(key, reader)
    }

    fn start_handshake(&mut self, now: u64) -> Result<(), ProtocolError> {
        let device_secret = self
            .platform
            .restore(BlobKind::DeviceSecret)?
            .ok_or(ProtocolError::Authentication)?;
        let server_public = self
            .platform
            .restore(BlobKind::ServerPublic)?
            .ok_or(ProtocolError::Authentication)?;
        let link = session::derive_link_secret(&device_secret, &server_public);
        let resume = self
            .platform
            .restore(BlobKind::Session)?
            .and_then(|blob| ResumeBlob::decode(&blob));

        self.reliability.clear();
        self.reliability.set_next_id(0);
        let (nonce, resume_id) = self.session.begin_handshake(link, resume);
        self.timers.set(Timer::Handshake, now + self.config.handshake_timeout);
        let hello = Payload::HelloDevice {
            device_id: self.config.device_id,
            nonce,
            resume_id,
        };
        self.send_payload(MessageKind::Handshake, Token::EMPTY, &hello, None, now)
    }

    fn flush_acks(&mut self) {
        while let Some((id, token)) = self.reliability.take_ack() {
            let message = Message {
                kind: MessageKind::Acknowledgement,
                id,
                token,
                payload: Bytes::new(),
            };
            if self.send_message(&message).is_err() {
                break;
            }
        }
    }

    fn receive_one(&mut self, now: u64) {
        match self.platform.receive(&mut self.buf) {
            Ok(0) => {}
            Ok(n) => {
                let datagram = self.buf[..n].to_vec();
                self.handle_datagram(&datagram, now);
            }
            Err(_) => {
                // Datagram semantics: the offending datagram is lost, the
                // session continues and retransmission recovers confirmables
                warn!(error = %ProtocolError::Io, "transport receive failed, datagram dropped");
            }
        }
    }

    /// Negotiate fresh keys before the message id space wraps
    ///
    /// The per-message AEAD nonce folds the id into the base IV, so reusing
    /// an id under the same keys would reuse a nonce. A fresh full handshake
    /// restarts the id space under new keys; the saved blob is cleared first
    /// so the peer cannot resume the exhausted session.
    fn rekey_if_needed(&mut self, now: u64) {
        if !self.session.state().is_active()
            || self.reliability.current_next_id() < ID_REKEY_THRESHOLD
        {
            return;
        }
        info!("message id space nearly exhausted, negotiating fresh keys");
        if self.platform.save(BlobKind::Session, &[]).is_err() {
            warn!("failed to clear saved session state");
        }
        self.session.reset();
        self.reliability.clear();
        self.timers.reset();
        if self.start_handshake(now).is_err() {
            self.schedule_reconnect(now);
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], now: u64) {
        let message = match Message::decode(datagram, self.config.protocol_buffer_size) {
            Ok(message) => message,
            Err(_) => {
                trace!(
                    len = datagram.len(),
                    error = %ProtocolError::MalformedMessage,
                    "dropping undecodable datagram"
                );
                return;
            }
        };
        match message.kind {
            MessageKind::Handshake => self.handle_handshake(&message, now),
            MessageKind::Acknowledgement => {
                // Only an ack matching an in-flight id counts as liveness;
                // anyone can forge the rest
                match self.reliability.on_ack(message.id) {
                    Some(purpose) => {
                        self.reliability.note_inbound(now);
                        self.handle_ack(purpose);
                    }
                    None => trace!(
                        id = %message.id,
                        error = %ProtocolError::MissingMessageId,
                        "late or duplicate acknowledgement"
                    ),
                }
            }
            MessageKind::Reset => {
                debug!("peer sent reset");
                self.fail_session(ProtocolError::MessageReset, now);
            }
            MessageKind::Confirmable | MessageKind::NonConfirmable => {
                if message.kind == MessageKind::Confirmable {
                    // Always re-acknowledge, even duplicates, and do it before
                    // any response traffic this datagram provokes
                    self.reliability.queue_ack(message.id, message.token);
                    self.flush_acks();
                }
                if !self.reliability.accept(message.id) {
                    trace!(id = %message.id, "duplicate message suppressed");
                    return;
                }
                if message.payload.is_empty() {
                    // Keepalive; the acknowledgement is all it wanted
                    return;
                }
                if !self.session.state().is_active() {
                    trace!("application message outside an active session dropped");
                    return;
                }
                let mut ciphertext = message.payload.to_vec();
                let plain = match self
                    .session
                    .open(message.id.0, &message.aad(), &mut ciphertext)
                {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!("inbound payload failed authentication");
                        self.fail_session(e, now);
                        return;
                    }
                };
                self.reliability.note_inbound(now);
                match Payload::decode(&plain) {
                    Ok(payload) => self.dispatch(payload, message.token, now),
                    Err(_) => trace!(
                        error = %ProtocolError::MalformedMessage,
                        "dropping undecodable payload"
                    ),
                }
            }
        }
    }

    fn handle_handshake(&mut self, message: &Message, now: u64) {
        if self.session.state() != SessionState::Handshaking {
            // Redelivered or spoofed; handshake traffic is plaintext and must
            // not be able to disturb a live session
            trace!("handshake datagram outside a handshake dropped");
            return;
        }
        let payload = match Payload::decode(&message.payload) {
            Ok(payload) => payload,
            Err(_) => {
                trace!("dropping undecodable handshake payload");
                return;
            }
        };
        let result = match payload {
            Payload::HelloCloud { nonce, resume_ok } => {
                match self.session.on_hello_cloud(nonce, resume_ok) {
                    Ok(HandshakeStep::SendFinish { hmac }) => self.send_payload(
                        MessageKind::Handshake,
                        Token::EMPTY,
                        &Payload::HandshakeFinish { hmac },
                        None,
                        now,
                    ),
                    Ok(HandshakeStep::Resumed { next_id }) => {
                        self.reliability.set_next_id(next_id);
                        self.establish(true, now);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Payload::HandshakeFinish { hmac } => match self.session.on_handshake_finish(&hmac) {
                Ok(()) => {
                    self.establish(false, now);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            other => {
                trace!(?other, "unexpected handshake payload dropped");
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail_session(e, now);
        }
    }

    /// The session just became active
    fn establish(&mut self, resumed: bool, now: u64) {
        info!(resumed, "session active");
        self.reliability.note_inbound(now);
        self.backoff = self.config.reconnect_backoff_min;
        self.timers.stop(Timer::Handshake);
        self.timers.stop(Timer::Reconnect);
        self.timers.set(Timer::Ping, now + self.config.ping_interval);
        self.timers
            .set(Timer::BlobSave, now + self.config.blob_save_interval);
        if let Some(at) = self.ota.last_activity() {
            self.timers
                .set(Timer::OtaInactivity, at + self.config.ota_inactivity_timeout);
        }
        self.events.push_back(HostEvent::Connected { resumed });
        self.save_session_blob();
        if let Err(e) = self.post_establish_sends(now) {
            self.fail_session(e, now);
        }
    }

    /// Time sync and subscription announcements after establishment
    fn post_establish_sends(&mut self, now: u64) -> Result<(), ProtocolError> {
        if self.session.take_time_sync() {
            let token = self.next_token();
            self.send_payload(
                MessageKind::Confirmable,
                token,
                &Payload::TimeRequest,
                Some(SendPurpose::TimeRequest),
                now,
            )?;
        }
        for announce in self.pubsub.announcements() {
            let filter = match &announce {
                Payload::Subscribe { filter, .. } => filter.clone(),
                _ => String::new(),
            };
            self.send_payload(
                MessageKind::Confirmable,
                Token::EMPTY,
                &announce,
                Some(SendPurpose::Subscribe(filter)),
                now,
            )?;
        }
        Ok(())
    }

    fn dispatch(&mut self, payload: Payload, token: Token, now: u64) {
        let reply = match payload {
            Payload::FunctionCall { key, arg } => Some(self.router.call(&key, &arg)),
            Payload::VariableRequest { key } => Some(self.router.read(&key)),
            Payload::Describe => Some(self.router.describe()),
            Payload::Time { unix_seconds } => {
                debug!(unix_seconds, "clock corrected from peer");
                self.platform.set_time(unix_seconds);
                None
            }
            Payload::Event {
                name, data, ..
            } => {
                self.pubsub.dispatch(&name, &data);
                None
            }
            Payload::UpdateBegin { desc, dry_run } => {
                let reply =
                    self.ota
                        .begin(&mut self.platform, desc, dry_run, now, &mut self.events);
                self.arm_ota_timer();
                Some(reply)
            }
            Payload::UpdateChunk { index, data } => {
                let reply =
                    self.ota
                        .chunk(&mut self.platform, index, &data, now, &mut self.events);
                self.arm_ota_timer();
                reply
            }
            Payload::UpdateFinish => {
                let reply = self.ota.finish_request(&mut self.platform, &mut self.events);
                self.arm_ota_timer();
                Some(reply)
            }
            Payload::UpdateAbort => {
                self.ota.peer_abort(&mut self.platform, &mut self.events);
                self.timers.stop(Timer::OtaInactivity);
                None
            }
            Payload::Goodbye => {
                debug!("peer said goodbye");
                self.fail_session(ProtocolError::MessageReset, now);
                None
            }
            Payload::Error { code } => {
                warn!(code, "peer reported an application error");
                None
            }
            other => {
                trace!(?other, "unexpected application payload dropped");
                None
            }
        };
        if let Some(reply) = reply {
            if let Err(e) = self.send_payload(
                MessageKind::Confirmable,
                token,
                &reply,
                Some(SendPurpose::Response),
                now,
            ) {
                self.fail_session(e, now);
            }
        }
    }

    fn arm_ota_timer(&mut self) {
        match self.ota.last_activity() {
            Some(at) => self
                .timers
                .set(Timer::OtaInactivity, at + self.config.ota_inactivity_timeout),
            None => self.timers.stop(Timer::OtaInactivity),
        }
    }

    fn handle_ack(&mut self, purpose: SendPurpose) {
        match purpose {
            SendPurpose::Ping => trace!("keepalive acknowledged"),
            SendPurpose::Publish(name) => {
                self.events.push_back(HostEvent::PublishAcked { name });
            }
            SendPurpose::TimeRequest
            | SendPurpose::Subscribe(_)
            | SendPurpose::Response
            | SendPurpose::Update => {}
        }
    }

    fn service_timers(&mut self, now: u64) {
        let expired: Vec<Timer> = self.timers.expired(now).collect();
        for timer in expired {
            match timer {
                Timer::Handshake => {
                    debug!("handshake timed out");
                    self.fail_session(ProtocolError::MessageTimeout, now);
                }
                Timer::Ping => self.service_ping(now),
                Timer::OtaInactivity => {
                    self.ota.on_inactivity(&mut self.platform, &mut self.events);
                }
                Timer::Reconnect => {
                    if self.auto_reconnect {
                        debug!("attempting reconnect");
                        if self.start_handshake(now).is_err() {
                            self.schedule_reconnect(now);
                        }
                    }
                }
                Timer::BlobSave => {
                    self.save_session_blob();
                    self.timers
                        .set(Timer::BlobSave, now + self.config.blob_save_interval);
                }
            }
        }
    }

    fn service_ping(&mut self, now: u64) {
        if !self.session.state().is_active() {
            return;
        }
        let silence = now.saturating_sub(self.reliability.last_inbound_at());
        if silence >= self.config.ping_interval && !self.reliability.ping_in_flight() {
            trace!("sending keepalive");
            self.send_ping(now);
            self.timers.set(Timer::Ping, now + self.config.ping_interval);
        } else {
            // Recent traffic; wait out the remainder of the quiet period
            self.timers.set(
                Timer::Ping,
                self.reliability.last_inbound_at() + self.config.ping_interval,
            );
        }
    }

    fn service_retransmits(&mut self, now: u64) {
        let (resend, expired) = self.reliability.poll_retransmits(
            now,
            self.config.ack_timeout,
            self.config.max_retries,
        );
        for datagram in resend {
            if self.platform.send(&datagram).is_err() {
                // A dropped retransmission; the next retry interval covers it
                debug!("retransmit send failed, deferred to the next retry");
            }
        }
        for purpose in expired {
            match purpose {
                SendPurpose::Ping => {
                    warn!("keepalive went unacknowledged");
                    self.fail_session(ProtocolError::PingTimeout, now);
                }
                SendPurpose::Publish(name) => {
                    self.events.push_back(HostEvent::PublishFailed {
                        name,
                        reason: ProtocolError::MessageTimeout,
                    });
                }
                SendPurpose::TimeRequest => warn!("time request timed out"),
                SendPurpose::Subscribe(filter) => {
                    warn!(filter, "subscription announcement timed out");
                }
                SendPurpose::Response | SendPurpose::Update => {
                    debug!(
                        error = %ProtocolError::MessageTimeout,
                        "confirmable send abandoned"
                    );
                }
            }
        }
    }

    fn fail_session(&mut self, reason: ProtocolError, now: u64) {
        if self.session.state() == SessionState::Failed {
            self.schedule_reconnect(now);
            return;
        }
        warn!(%reason, "session failed");
        self.session.fail();
        self.reliability.clear();
        self.timers.reset();
        self.events.push_back(HostEvent::ConnectionLost { reason });
        self.schedule_reconnect(now);
    }

    fn schedule_reconnect(&mut self, now: u64) {
        if !self.auto_reconnect {
            return;
        }
        self.timers.set(Timer::Reconnect, now + self.backoff);
        self.backoff = (self.backoff * 2).min(self.config.reconnect_backoff_max);
    }

    fn save_session_blob(&mut self) {
        if let Some(blob) = self.session.make_blob(self.reliability.current_next_id()) {
            if self.platform.save(BlobKind::Session, &blob).is_err() {
                warn!("failed to persist session state");
            }
        }
    }

    fn next_token(&mut self) -> Token {
        self.token_counter = self.token_counter.wrapping_add(1);
        Token::from_counter(self.token_counter)
    }

    /// Encode, protect, and transmit one payload-bearing message
    ///
    /// Non-empty payloads outside the handshake ride encrypted on a freshly
    /// allocated message id; the same id keys the AEAD nonce, so the encoded
    /// datagram is remembered verbatim for retransmission.
    fn send_payload(
        &mut self,
        kind: MessageKind,
        token: Token,
        payload: &Payload,
        purpose: Option<SendPurpose>,
        now: u64,
    ) -> Result<(), ProtocolError> {
        let id = self.reliability.next_id();
        let mut message = Message {
            kind,
            id,
            token,
            payload: Bytes::new(),
        };
        let mut body = payload.to_bytes();
        if kind != MessageKind::Handshake {
            self.session.seal(id.0, &message.aad(), &mut body)?;
        }
        message.payload = Bytes::from(body);
        let datagram = self.send_message(&message)?;
        if kind == MessageKind::Confirmable {
            if let Some(purpose) = purpose {
                self.reliability.on_sent(id, datagram, purpose, now);
            }
        }
        Ok(())
    }

    /// Keepalives are empty confirmables and carry no ciphertext
    fn send_ping(&mut self, now: u64) {
        let id = self.reliability.next_id();
        let message = Message {
            kind: MessageKind::Confirmable,
            id,
            token: Token::EMPTY,
            payload: Bytes::new(),
        };
        match self.send_message(&message) {
            Ok(datagram) => self.reliability.on_sent(id, datagram, SendPurpose::Ping, now),
            Err(e) => self.fail_session(e, now),
        }
    }

    fn send_message(&mut self, message: &Message) -> Result<Bytes, ProtocolError> {
        let mut buf = Vec::with_capacity(16 + message.payload.len());
        message.encode(&mut buf);
        if buf.len() > self.config.protocol_buffer_size {
            return Err(ProtocolError::MalformedMessage);
        }
        let n = self.platform.send(&buf)?;
        if n < buf.len() {
            // Datagram semantics again: a partial write is a dropped datagram
            debug!(written = n, len = buf.len(), "short transport write, datagram dropped");
        }
        Ok(Bytes::from(buf))
    }

    #[cfg(test)]
    pub(crate) fn skip_message_ids(&mut self, next_id: u16) {
        self.reliability.set_next_id(next_id);
    }
}
