use crate::{error::ProtocolError, platform::FirmwareStore};

/// Host-facing notifications drained via [`Engine::poll`](crate::Engine::poll)
///
/// The host never needs to poll error codes to notice a broken session: a
/// `ConnectionLost` event is always followed by automatic reconnection
/// attempts (with backoff) on subsequent `process()` calls, unless the host
/// called `disconnect()`.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// The session reached `Established` (or `Resumed`, with `resumed` set)
    Connected {
        /// Whether a saved session blob was restored instead of a full
        /// handshake
        resumed: bool,
    },
    /// The session failed; reconnection is scheduled automatically
    ConnectionLost {
        /// The session-level error that forced the failure
        reason: ProtocolError,
    },
    /// An acknowledged publish was confirmed by the peer
    PublishAcked {
        /// Event name as passed to `publish`
        name: String,
    },
    /// An acknowledged publish exhausted its retries
    PublishFailed {
        /// Event name as passed to `publish`
        name: String,
        /// Why the publish failed
        reason: ProtocolError,
    },
    /// An OTA transfer was accepted and is receiving chunks
    UpdateStarted {
        /// Destination store of the image
        store: FirmwareStore,
        /// Total image length in bytes
        file_length: u32,
    },
    /// OTA chunk coverage advanced
    UpdateProgress {
        /// Distinct chunks received so far
        chunks_received: u32,
        /// Total chunks in the image
        chunk_count: u32,
    },
    /// The OTA image was validated and committed; the host should schedule a
    /// reset so the new image takes effect
    UpdateApplied,
    /// The OTA transfer was abandoned and its storage released
    UpdateAborted {
        /// Why the transfer was abandoned
        reason: ProtocolError,
    },
}
