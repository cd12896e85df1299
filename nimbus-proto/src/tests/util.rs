//! Shared harness: an in-memory platform and a scripted cloud peer

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::RngCore;
use tracing::subscriber::DefaultGuard;

use crate::{
    config::EngineConfig,
    engine::Engine,
    events::HostEvent,
    message::{Message, MessageId, MessageKind, Payload, Token},
    platform::{
        BlobKind, Clock, FirmwareSink, IoError, KeyStore, SinkError, TransferDescriptor, Transport,
    },
    session::{derive_link_secret, derive_session_keys, handshake_hmac, SessionKeys},
    KEY_LEN, NONCE_LEN, SESSION_ID_LEN,
};

pub const DEVICE_ID: &str = "24a9f3b80c1d";
pub const CLOUD_TIME: u64 = 1_700_000_000;
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn subscribe() -> DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

type Queue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Simulated flash behind the firmware sink
#[derive(Default)]
pub struct Flash {
    pub image: Vec<u8>,
    pub finished: Option<bool>,
    pub fail_prepare: Option<SinkError>,
}

/// Host platform backed by in-memory queues; clones share all state
#[derive(Clone)]
pub struct TestPlatform {
    pub to_cloud: Queue,
    pub to_device: Queue,
    pub time: Rc<Cell<u64>>,
    pub blobs: Rc<RefCell<HashMap<BlobKind, Vec<u8>>>>,
    pub set_time_calls: Rc<RefCell<Vec<u64>>>,
    pub flash: Rc<RefCell<Flash>>,
    pub fail_send: Rc<Cell<bool>>,
    pub fail_receive: Rc<Cell<bool>>,
    /// Report half the bytes written and drop the datagram
    pub short_send: Rc<Cell<bool>>,
}

impl TestPlatform {
    pub fn new() -> Self {
        let blobs = HashMap::from([
            (BlobKind::DeviceSecret, vec![7; KEY_LEN]),
            (BlobKind::ServerPublic, vec![9; KEY_LEN]),
        ]);
        Self {
            to_cloud: Default::default(),
            to_device: Default::default(),
            time: Default::default(),
            blobs: Rc::new(RefCell::new(blobs)),
            set_time_calls: Default::default(),
            flash: Default::default(),
            fail_send: Default::default(),
            fail_receive: Default::default(),
            short_send: Default::default(),
        }
    }
}

impl Transport for TestPlatform {
    fn send(&mut self, data: &[u8]) -> Result<usize, IoError> {
        if self.fail_send.get() {
            return Err(IoError);
        }
        if self.short_send.get() {
            return Ok(data.len() / 2);
        }
        self.to_cloud.borrow_mut().push_back(data.to_vec());
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.fail_receive.get() {
            return Err(IoError);
        }
        match self.to_device.borrow_mut().pop_front() {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

impl Clock for TestPlatform {
    fn millis(&mut self) -> u64 {
        self.time.get()
    }

    fn set_time(&mut self, unix_seconds: u64) {
        self.set_time_calls.borrow_mut().push(unix_seconds);
    }
}

impl KeyStore for TestPlatform {
    fn save(&mut self, kind: BlobKind, blob: &[u8]) -> Result<(), IoError> {
        self.blobs.borrow_mut().insert(kind, blob.to_vec());
        Ok(())
    }

    fn restore(&mut self, kind: BlobKind) -> Result<Option<Vec<u8>>, IoError> {
        Ok(self.blobs.borrow().get(&kind).cloned())
    }
}

impl FirmwareSink for TestPlatform {
    fn prepare(&mut self, desc: &TransferDescriptor, dry_run: bool) -> Result<(), SinkError> {
        let mut flash = self.flash.borrow_mut();
        if let Some(e) = flash.fail_prepare {
            return Err(e);
        }
        if !dry_run {
            flash.image = vec![0; desc.file_length as usize];
        }
        Ok(())
    }

    fn save_chunk(
        &mut self,
        desc: &TransferDescriptor,
        index: u32,
        data: &[u8],
    ) -> Result<(), SinkError> {
        let mut flash = self.flash.borrow_mut();
        let start = index as usize * desc.chunk_size as usize;
        flash.image[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn finish(&mut self, _desc: &TransferDescriptor, applied: bool) -> Result<(), SinkError> {
        self.flash.borrow_mut().finished = Some(applied);
        Ok(())
    }

    fn crc32(&mut self, _desc: &TransferDescriptor) -> Result<u32, SinkError> {
        Ok(CRC32.checksum(&self.flash.borrow().image))
    }
}

/// Scripted cloud endpoint sharing the platform's queues
pub struct TestCloud {
    to_cloud: Queue,
    to_device: Queue,
    link: [u8; KEY_LEN],
    keys: Option<SessionKeys>,
    device_nonce: [u8; NONCE_LEN],
    cloud_nonce: [u8; NONCE_LEN],
    next_id: u16,
    pub auto_ack: bool,
    pub accept_resume: bool,
    pub corrupt_finish: bool,
    /// Decrypted application payloads received from the device
    pub inbox: Vec<Payload>,
    /// Message ids the device has acknowledged
    pub acks: Vec<u16>,
    /// Device hellos seen, counting reconnects
    pub handshakes: usize,
    /// Empty confirmables received from the device
    pub pings: usize,
}

impl TestCloud {
    pub fn new(to_cloud: Queue, to_device: Queue) -> Self {
        Self {
            to_cloud,
            to_device,
            link: derive_link_secret(&[7; KEY_LEN], &[9; KEY_LEN]),
            keys: None,
            device_nonce: [0; NONCE_LEN],
            cloud_nonce: [0; NONCE_LEN],
            next_id: 0,
            auto_ack: true,
            accept_resume: false,
            corrupt_finish: false,
            inbox: Vec::new(),
            acks: Vec::new(),
            handshakes: 0,
            pings: 0,
        }
    }

    /// Redeliver the key-confirmation message of the current handshake
    pub fn resend_finish(&mut self) {
        let finish = handshake_hmac(&self.link, &self.cloud_nonce, &self.device_nonce);
        let datagram = self.encode(
            MessageKind::Handshake,
            Token::EMPTY,
            &Payload::HandshakeFinish { hmac: finish },
        );
        self.push_raw(datagram);
    }

    pub fn peek_next_id(&self) -> u16 {
        self.next_id
    }

    /// Process every datagram the device has sent
    pub fn service(&mut self) {
        loop {
            let Some(datagram) = self.to_cloud.borrow_mut().pop_front() else {
                break;
            };
            let message = Message::decode(&datagram, 4096).expect("device sent garbage");
            match message.kind {
                MessageKind::Handshake => self.handle_handshake(&message),
                MessageKind::Acknowledgement => self.acks.push(message.id.0),
                MessageKind::Reset => {}
                MessageKind::Confirmable | MessageKind::NonConfirmable => {
                    if message.kind == MessageKind::Confirmable && self.auto_ack {
                        self.send_ack(message.id, message.token);
                    }
                    if message.payload.is_empty() {
                        // Keepalive
                        if message.kind == MessageKind::Confirmable {
                            self.pings += 1;
                        }
                        continue;
                    }
                    let keys = self.keys.as_ref().expect("application message before keys");
                    let mut data = message.payload.to_vec();
                    let plain = keys
                        .d2c
                        .open(message.id.0, &message.aad(), &mut data)
                        .expect("device payload failed to decrypt");
                    let payload = Payload::decode(&plain).expect("device payload malformed");
                    if payload == Payload::TimeRequest {
                        self.send(
                            MessageKind::Confirmable,
                            message.token,
                            &Payload::Time {
                                unix_seconds: CLOUD_TIME,
                            },
                        );
                    }
                    self.inbox.push(payload);
                }
            }
        }
    }

    fn handle_handshake(&mut self, message: &Message) {
        match Payload::decode(&message.payload).expect("handshake payload malformed") {
            Payload::HelloDevice {
                nonce, resume_id, ..
            } => {
                self.device_nonce = nonce;
                self.handshakes += 1;
                let resume = self.accept_resume
                    && resume_id != [0; SESSION_ID_LEN]
                    && self.keys.is_some();
                rand::thread_rng().fill_bytes(&mut self.cloud_nonce);
                let hello = Payload::HelloCloud {
                    nonce: self.cloud_nonce,
                    resume_ok: resume,
                };
                let datagram = self.encode(MessageKind::Handshake, Token::EMPTY, &hello);
                self.push_raw(datagram);
            }
            Payload::HandshakeFinish { hmac } => {
                let expected = handshake_hmac(&self.link, &self.device_nonce, &self.cloud_nonce);
                assert_eq!(hmac, expected, "device key confirmation mismatch");
                self.keys = Some(
                    derive_session_keys(&self.link, &self.device_nonce, &self.cloud_nonce)
                        .expect("key derivation failed"),
                );
                let mut finish = handshake_hmac(&self.link, &self.cloud_nonce, &self.device_nonce);
                if self.corrupt_finish {
                    finish[0] ^= 0xff;
                }
                let datagram = self.encode(
                    MessageKind::Handshake,
                    Token::EMPTY,
                    &Payload::HandshakeFinish { hmac: finish },
                );
                self.push_raw(datagram);
            }
            other => panic!("unexpected handshake payload {other:?}"),
        }
    }

    /// Encode one cloud-to-device message, sealing non-handshake payloads
    pub fn encode(&mut self, kind: MessageKind, token: Token, payload: &Payload) -> Vec<u8> {
        let id = self.next_id;
        self.next_id += 1;
        let mut message = Message {
            kind,
            id: MessageId(id),
            token,
            payload: Bytes::new(),
        };
        let mut body = payload.to_bytes();
        if kind != MessageKind::Handshake {
            let keys = self.keys.as_ref().expect("no session keys yet");
            keys.c2d
                .seal(id, &message.aad(), &mut body)
                .expect("seal failed");
        }
        message.payload = Bytes::from(body);
        let mut buf = Vec::new();
        message.encode(&mut buf);
        buf
    }

    pub fn push_raw(&self, datagram: Vec<u8>) {
        self.to_device.borrow_mut().push_back(datagram);
    }

    pub fn send(&mut self, kind: MessageKind, token: Token, payload: &Payload) {
        let datagram = self.encode(kind, token, payload);
        self.push_raw(datagram);
    }

    pub fn send_reset(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let message = Message {
            kind: MessageKind::Reset,
            id: MessageId(id),
            token: Token::EMPTY,
            payload: Bytes::new(),
        };
        let mut buf = Vec::new();
        message.encode(&mut buf);
        self.push_raw(buf);
    }

    fn send_ack(&mut self, id: MessageId, token: Token) {
        let message = Message {
            kind: MessageKind::Acknowledgement,
            id,
            token,
            payload: Bytes::new(),
        };
        let mut buf = Vec::new();
        message.encode(&mut buf);
        self.push_raw(buf);
    }
}

/// An engine wired to a scripted cloud through shared queues
pub struct Pair {
    pub engine: Engine<TestPlatform>,
    pub cloud: TestCloud,
    pub platform: TestPlatform,
}

impl Pair {
    pub fn new() -> Self {
        let platform = TestPlatform::new();
        let cloud = TestCloud::new(platform.to_cloud.clone(), platform.to_device.clone());
        let engine = Engine::new(EngineConfig::new(DEVICE_ID).unwrap(), platform.clone()).unwrap();
        Self {
            engine,
            cloud,
            platform,
        }
    }

    /// Replace the engine, as if the device had rebooted; persisted blobs and
    /// the cloud peer survive
    pub fn restart_engine(&mut self) {
        self.engine =
            Engine::new(EngineConfig::new(DEVICE_ID).unwrap(), self.platform.clone()).unwrap();
    }

    pub fn advance(&mut self, millis: u64) {
        self.platform.time.set(self.platform.time.get() + millis);
    }

    /// Run both sides until traffic settles
    pub fn drive(&mut self) {
        for _ in 0..100 {
            self.engine.process();
            self.cloud.service();
        }
    }

    pub fn connect(&mut self) {
        self.engine.connect().unwrap();
        self.drive();
    }

    /// Drain all pending host notifications
    pub fn events(&mut self) -> Vec<HostEvent> {
        std::iter::from_fn(|| self.engine.poll()).collect()
    }
}
