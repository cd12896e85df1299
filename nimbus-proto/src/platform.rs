//! Collaborator traits supplied by the host
//!
//! The engine performs no I/O and no persistence of its own. Everything it
//! needs from the outside world — a datagram transport, a monotonic clock, a
//! key/session store, and a firmware-chunk sink — is reached through the
//! traits in this module. The host implements all four on one platform type
//! and hands it to [`Engine::new`](crate::Engine::new).
//!
//! All calls are expected to be non-blocking. The engine issues at most one
//! call at a time into any collaborator; if the host platform is
//! multi-threaded it must serialize entry into the engine itself.

use std::fmt;

use thiserror::Error;

/// Failure of a transport or persistence operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("platform i/o failure")]
pub struct IoError;

/// Failure of a firmware-sink operation
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum SinkError {
    /// The sink cannot reserve space for the requested image
    #[error("insufficient storage for firmware image")]
    InsufficientStorage,
    /// The underlying flash operation failed
    #[error("firmware storage i/o failure")]
    Io,
}

/// Opaque byte-oriented datagram transport
pub trait Transport {
    /// Send one datagram; partial writes are treated as a dropped datagram
    fn send(&mut self, data: &[u8]) -> Result<usize, IoError>;
    /// Receive one datagram into `buf`; returns 0 when no data is ready
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;
}

/// Time source and best-effort wall-clock sink
pub trait Clock {
    /// Monotonic milliseconds; wrapping is acceptable over device uptime
    fn millis(&mut self) -> u64;
    /// Correct the device wall clock from the cloud's time
    fn set_time(&mut self, unix_seconds: u64);
}

/// Identifies a blob in the key/session store
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BlobKind {
    /// The device's private key material
    DeviceSecret,
    /// The cloud endpoint's public key material
    ServerPublic,
    /// The resumable session state
    Session,
}

/// Persists key material and resumable session state across resets
pub trait KeyStore {
    /// Persist `blob` under `kind`, replacing any previous value
    fn save(&mut self, kind: BlobKind, blob: &[u8]) -> Result<(), IoError>;
    /// Restore the blob stored under `kind`, if any
    fn restore(&mut self, kind: BlobKind) -> Result<Option<Vec<u8>>, IoError>;
}

/// Target store for an OTA image
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FirmwareStore {
    /// Main firmware image
    Firmware,
    /// System/bootloader region
    System,
    /// Application region
    Application,
}

impl FirmwareStore {
    pub(crate) fn from_byte(x: u8) -> Option<Self> {
        Some(match x {
            0 => Self::Firmware,
            1 => Self::System,
            2 => Self::Application,
            _ => return None,
        })
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Firmware => 0,
            Self::System => 1,
            Self::Application => 2,
        }
    }
}

impl fmt::Display for FirmwareStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Firmware => "firmware",
            Self::System => "system",
            Self::Application => "application",
        })
    }
}

/// Parameters of one OTA transfer, fixed at `UpdateBegin`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransferDescriptor {
    /// Which store the image is destined for
    pub store: FirmwareStore,
    /// Total image length in bytes
    pub file_length: u32,
    /// Size of every chunk except possibly the last
    pub chunk_size: u16,
    /// CRC32 of the complete image, checked before apply
    pub crc: u32,
}

impl TransferDescriptor {
    /// Number of chunks the image divides into
    pub fn chunk_count(&self) -> u32 {
        let size = u32::from(self.chunk_size);
        self.file_length.div_ceil(size)
    }

    /// Expected length of the chunk at `index`
    pub fn chunk_len(&self, index: u32) -> u32 {
        let size = u32::from(self.chunk_size);
        let start = index * size;
        (self.file_length - start).min(size)
    }
}

/// Receives and commits OTA firmware images chunk by chunk
pub trait FirmwareSink {
    /// Reserve and validate storage for an image; `dry_run` validates without
    /// committing the reservation
    fn prepare(&mut self, desc: &TransferDescriptor, dry_run: bool) -> Result<(), SinkError>;
    /// Store one chunk; must be idempotent for duplicate deliveries
    fn save_chunk(
        &mut self,
        desc: &TransferDescriptor,
        index: u32,
        data: &[u8],
    ) -> Result<(), SinkError>;
    /// Commit (`applied`) or discard the transfer and release storage
    fn finish(&mut self, desc: &TransferDescriptor, applied: bool) -> Result<(), SinkError>;
    /// CRC32 of the accumulated image
    fn crc32(&mut self, desc: &TransferDescriptor) -> Result<u32, SinkError>;
}

/// The full set of host collaborators the engine is generic over
pub trait Platform: Transport + Clock + KeyStore + FirmwareSink {}

impl<T: Transport + Clock + KeyStore + FirmwareSink> Platform for T {}
