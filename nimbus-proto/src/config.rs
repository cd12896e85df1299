use std::fmt;

use thiserror::Error;

use crate::{DEVICE_ID_LEN, MIN_PROTOCOL_BUFFER_SIZE};

/// Parameters governing the protocol engine
///
/// Defaults suit a typical cellular or WiFi device link. None of these values
/// are negotiated with the peer; they bound local behavior only.
pub struct EngineConfig {
    pub(crate) device_id: [u8; DEVICE_ID_LEN],
    pub(crate) protocol_buffer_size: usize,
    pub(crate) handshake_timeout: u64,
    pub(crate) ping_interval: u64,
    pub(crate) ack_timeout: u64,
    pub(crate) max_retries: u8,
    pub(crate) ota_inactivity_timeout: u64,
    pub(crate) reconnect_backoff_min: u64,
    pub(crate) reconnect_backoff_max: u64,
    pub(crate) blob_save_interval: u64,
    pub(crate) max_functions: usize,
    pub(crate) max_variables: usize,
    pub(crate) max_subscriptions: usize,
    pub(crate) max_chunk_size: u16,
    pub(crate) publish_burst: u32,
    pub(crate) publish_refill_interval: u64,
}

impl EngineConfig {
    /// Configuration for the device identified by `device_id` (12 hex chars)
    pub fn new(device_id: &str) -> Result<Self, ConfigError> {
        let bytes = device_id.as_bytes();
        if bytes.len() != DEVICE_ID_LEN || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(ConfigError::InvalidDeviceId);
        }
        let mut id = [0; DEVICE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self {
            device_id: id,
            protocol_buffer_size: 1024,
            handshake_timeout: 15_000,
            ping_interval: 30_000,
            ack_timeout: 4_000,
            max_retries: 3,
            ota_inactivity_timeout: 30_000,
            reconnect_backoff_min: 5_000,
            reconnect_backoff_max: 180_000,
            blob_save_interval: 60_000,
            max_functions: 4,
            max_variables: 10,
            max_subscriptions: 8,
            max_chunk_size: 512,
            publish_burst: 4,
            publish_refill_interval: 1_000,
        })
    }

    /// Size of the datagram scratch buffer; at least 640 bytes
    pub fn protocol_buffer_size(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value < MIN_PROTOCOL_BUFFER_SIZE {
            return Err(ConfigError::OutOfBounds);
        }
        self.protocol_buffer_size = value;
        Ok(self)
    }

    /// How long a handshake may run before the session is failed
    pub fn handshake_timeout(&mut self, millis: u64) -> &mut Self {
        self.handshake_timeout = millis;
        self
    }

    /// Inbound silence after which a keepalive ping is sent
    pub fn ping_interval(&mut self, millis: u64) -> &mut Self {
        self.ping_interval = millis;
        self
    }

    /// How long a confirmable message waits for acknowledgement before retry
    pub fn ack_timeout(&mut self, millis: u64) -> &mut Self {
        self.ack_timeout = millis;
        self
    }

    /// Retries before a confirmable send fails with `MessageTimeout`
    pub fn max_retries(&mut self, value: u8) -> &mut Self {
        self.max_retries = value;
        self
    }

    /// Chunk silence after which an in-progress OTA transfer is aborted
    ///
    /// Bounds how long a stalled transfer can hold device flash in a
    /// half-written state.
    pub fn ota_inactivity_timeout(&mut self, millis: u64) -> &mut Self {
        self.ota_inactivity_timeout = millis;
        self
    }

    /// Reconnect backoff bounds; the delay doubles per consecutive failure
    pub fn reconnect_backoff(&mut self, min_millis: u64, max_millis: u64) -> &mut Self {
        self.reconnect_backoff_min = min_millis;
        self.reconnect_backoff_max = max_millis.max(min_millis);
        self
    }

    /// How often the resumable session blob is re-persisted while connected
    pub fn blob_save_interval(&mut self, millis: u64) -> &mut Self {
        self.blob_save_interval = millis;
        self
    }

    /// Capacity of the function registry
    pub fn max_functions(&mut self, value: usize) -> &mut Self {
        self.max_functions = value;
        self
    }

    /// Capacity of the variable registry
    pub fn max_variables(&mut self, value: usize) -> &mut Self {
        self.max_variables = value;
        self
    }

    /// Capacity of the subscription registry
    pub fn max_subscriptions(&mut self, value: usize) -> &mut Self {
        self.max_subscriptions = value;
        self
    }

    /// Largest acceptable OTA chunk; must fit the protocol buffer
    pub fn max_chunk_size(&mut self, value: u16) -> &mut Self {
        self.max_chunk_size = value;
        self
    }

    /// Publish rate limit: burst size and refill interval per token
    pub fn publish_rate(&mut self, burst: u32, refill_interval_millis: u64) -> &mut Self {
        self.publish_burst = burst.max(1);
        self.publish_refill_interval = refill_interval_millis;
        self
    }

    pub(crate) fn device_id_str(&self) -> &str {
        // Validated as ASCII hex in `new`
        std::str::from_utf8(&self.device_id).unwrap_or("")
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("device_id", &self.device_id_str())
            .field("protocol_buffer_size", &self.protocol_buffer_size)
            .field("ping_interval", &self.ping_interval)
            .field("ack_timeout", &self.ack_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Errors in host-supplied configuration
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// The device id is not 12 hex characters
    #[error("device id must be 12 hex characters")]
    InvalidDeviceId,
    /// A numeric value is outside its permitted range
    #[error("configuration value out of bounds")]
    OutOfBounds,
}
