//! Event subscriptions and the publish rate limiter
//!
//! Subscriptions live locally and are announced to the peer on every session
//! (re)establishment, which makes them resilient to reconnection. Inbound
//! events are dispatched to every subscription whose filter is a prefix of
//! the event name, in registration order, each handler behind its own panic
//! boundary.

use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::{
    error::ProtocolError,
    message::{Payload, SubscriptionScope},
    MAX_EVENT_NAME_LENGTH,
};

/// Callback invoked with `(event_name, data)` for each matching event
pub type EventHandler = Box<dyn FnMut(&str, &str) + Send>;

/// Identifies a subscription for [`Engine::unsubscribe`](crate::Engine::unsubscribe)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    handle: SubscriptionHandle,
    filter: String,
    scope: SubscriptionScope,
    device_id: Option<String>,
    handler: EventHandler,
}

/// Subscription registry and publish bookkeeping
pub(crate) struct PubSub {
    subscriptions: Vec<Subscription>,
    next_handle: u64,
    max_subscriptions: usize,
    /// Token bucket for outbound publishes
    tokens: u32,
    burst: u32,
    refill_interval: u64,
    last_refill: u64,
}

impl PubSub {
    pub fn new(max_subscriptions: usize, burst: u32, refill_interval: u64, now: u64) -> Self {
        Self {
            subscriptions: Vec::new(),
            next_handle: 0,
            max_subscriptions,
            tokens: burst,
            burst,
            refill_interval,
            last_refill: now,
        }
    }

    /// Store a subscription; fails only when local storage is exhausted
    pub fn subscribe(
        &mut self,
        filter: &str,
        scope: SubscriptionScope,
        device_id: Option<&str>,
        handler: EventHandler,
    ) -> Result<SubscriptionHandle, ProtocolError> {
        if filter.is_empty() || filter.len() > MAX_EVENT_NAME_LENGTH {
            return Err(ProtocolError::InsufficientStorage);
        }
        if self.subscriptions.len() >= self.max_subscriptions {
            return Err(ProtocolError::InsufficientStorage);
        }
        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;
        self.subscriptions.push(Subscription {
            handle,
            filter: filter.into(),
            scope,
            device_id: device_id.map(Into::into),
            handler,
        });
        Ok(handle)
    }

    /// Remove one subscription; a stale handle is a no-op
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        self.subscriptions.retain(|sub| sub.handle != handle);
    }

    /// Remove every subscription
    pub fn unsubscribe_all(&mut self) {
        self.subscriptions.clear();
    }

    /// Announcements to (re)send to the peer after session establishment
    pub fn announcements(&self) -> Vec<Payload> {
        self.subscriptions
            .iter()
            .map(|sub| Payload::Subscribe {
                filter: sub.filter.clone(),
                scope: sub.scope,
                device_id: sub.device_id.clone(),
            })
            .collect()
    }

    /// Dispatch an inbound event to every matching subscription
    pub fn dispatch(&mut self, name: &str, data: &str) {
        for sub in &mut self.subscriptions {
            if !name.starts_with(&sub.filter) {
                continue;
            }
            let handler = &mut sub.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(name, data))).is_err() {
                warn!(filter = %sub.filter, "event handler panicked");
            }
        }
    }

    /// Take one publish token; `BandwidthExceeded` when the bucket is empty
    pub fn take_publish_token(&mut self, now: u64) -> Result<(), ProtocolError> {
        if self.refill_interval > 0 {
            let elapsed = now.saturating_sub(self.last_refill);
            let refill = elapsed / self.refill_interval;
            if refill > 0 {
                self.tokens = (self.tokens + refill.min(u64::from(self.burst)) as u32)
                    .min(self.burst);
                self.last_refill = now;
            }
        }
        if self.tokens == 0 {
            return Err(ProtocolError::BandwidthExceeded);
        }
        self.tokens -= 1;
        Ok(())
    }

    #[cfg(test)]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
