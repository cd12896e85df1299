use thiserror::Error;

use crate::platform::{IoError, SinkError};

/// Protocol-level failure conditions
///
/// Variants are grouped by recovery policy rather than by subsystem:
/// transport/codec errors are recovered locally by dropping the offending
/// datagram, session errors force the session to `Failed` and trigger a fresh
/// handshake after backoff, application errors are returned synchronously to
/// the caller, and OTA errors abort only the in-progress transfer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum ProtocolError {
    /// A keepalive ping went unacknowledged past its retry budget
    #[error("keepalive ping went unacknowledged")]
    PingTimeout,
    /// The transport or a persistence collaborator reported a failure
    #[error("transport i/o failure")]
    Io,
    /// The requested operation is not valid in the current state
    #[error("operation invalid in the current state")]
    InvalidState,
    /// A fixed-capacity registry or storage reservation is exhausted
    #[error("insufficient storage")]
    InsufficientStorage,
    /// A datagram or payload failed structural validation
    #[error("malformed message")]
    MalformedMessage,
    /// An inbound payload failed authenticated decryption
    #[error("payload decryption failed")]
    Decryption,
    /// An outbound payload could not be encrypted
    #[error("payload encryption failed")]
    Encryption,
    /// The peer failed handshake authentication, or key material is absent
    #[error("authentication failed")]
    Authentication,
    /// The local publish rate limit was exceeded
    #[error("bandwidth limit exceeded")]
    BandwidthExceeded,
    /// A confirmable message exhausted its retries without acknowledgement
    #[error("message timed out awaiting acknowledgement")]
    MessageTimeout,
    /// A correlated response arrived without a matching in-flight request
    ///
    /// Only ever logged; late responses are not a failure of the session.
    #[error("no in-flight message with that id")]
    MissingMessageId,
    /// The peer sent a Reset, or otherwise terminated the exchange
    #[error("peer reset the session")]
    MessageReset,
    /// Informational: the session was restored from a saved blob rather than
    /// a full handshake. Not a failure.
    #[error("session resumed from saved state")]
    SessionResumed,
}

impl From<IoError> for ProtocolError {
    fn from(_: IoError) -> Self {
        Self::Io
    }
}

impl From<SinkError> for ProtocolError {
    fn from(x: SinkError) -> Self {
        match x {
            SinkError::InsufficientStorage => Self::InsufficientStorage,
            SinkError::Io => Self::Io,
        }
    }
}
