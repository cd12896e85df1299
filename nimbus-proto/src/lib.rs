//! Device-side cloud communication protocol engine
//!
//! This crate implements the device half of a datagram-based device/cloud
//! protocol: an authenticated-encryption session with resumption, confirmable
//! messaging with retransmission and duplicate suppression, cloud-callable
//! functions and readable variables, event publish/subscribe, and chunked
//! firmware transfer.
//!
//! The [`Engine`] performs no I/O and creates no threads or tasks of its own.
//! The host supplies a [`Platform`] (transport, clock, key store, and
//! firmware sink), calls [`Engine::process`] from its own loop, and drains
//! notifications with [`Engine::poll`]. This keeps the crate portable from
//! embedded Linux gateways to test harnesses that simulate the cloud
//! in-process.

#![warn(missing_docs)]

mod coding;
mod config;
mod coverage;
mod engine;
mod error;
mod events;
mod message;
mod ota;
mod platform;
mod pubsub;
mod reliability;
mod router;
mod session;
mod timer;

pub use crate::config::{ConfigError, EngineConfig};
pub use crate::engine::Engine;
pub use crate::error::ProtocolError;
pub use crate::events::HostEvent;
pub use crate::message::{
    EventDelivery, EventFlags, EventVisibility, MessageId, MessageKind, SubscriptionScope, Token,
    Value,
};
pub use crate::platform::{
    BlobKind, Clock, FirmwareSink, FirmwareStore, IoError, KeyStore, Platform, SinkError,
    TransferDescriptor, Transport,
};
pub use crate::pubsub::{EventHandler, SubscriptionHandle};
pub use crate::router::{FunctionHandler, VariableReader};
pub use crate::session::SessionState;

#[cfg(test)]
mod tests;

/// Longest registrable function or variable key, in bytes
pub const MAX_KEY_LENGTH: usize = 12;
/// Longest argument accepted by a cloud-initiated function call, in bytes
pub const MAX_FUNCTION_ARG_LENGTH: usize = 64;
/// Longest event name, in bytes
pub const MAX_EVENT_NAME_LENGTH: usize = 64;
/// Longest event data, in bytes
pub const MAX_EVENT_DATA_LENGTH: usize = 64;
/// Largest event time-to-live, in seconds (24 bits on the wire)
pub const MAX_EVENT_TTL: u32 = 16_777_215;
/// Longest correlation token, in bytes
pub const MAX_TOKEN_LENGTH: usize = 8;
/// Smallest permitted datagram scratch buffer, in bytes
pub const MIN_PROTOCOL_BUFFER_SIZE: usize = 640;
/// Most chunks a single firmware transfer may comprise
pub const MAX_CHUNKS: u32 = 65_535;
/// Most chunk indices reported in one missing-chunks response
pub const MISSED_CHUNKS_TO_SEND: usize = 50;

/// Handshake nonce length
pub(crate) const NONCE_LEN: usize = 32;
/// Symmetric key length
pub(crate) const KEY_LEN: usize = 32;
/// Key-confirmation MAC length
pub(crate) const HMAC_LEN: usize = 32;
/// Session identifier length
pub(crate) const SESSION_ID_LEN: usize = 16;
/// Device identifier length (hex characters)
pub(crate) const DEVICE_ID_LEN: usize = 12;
