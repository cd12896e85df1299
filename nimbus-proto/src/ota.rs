//! Chunked, resumable firmware transfer
//!
//! The cloud drives the transfer: `UpdateBegin` fixes the descriptor,
//! `UpdateChunk`s arrive in any order and may be redelivered, `UpdateFinish`
//! asks whether anything is still missing. The transfer applies as soon as
//! coverage is complete and the image checksum matches, without waiting for
//! an explicit finish. Duplicate chunks are idempotent, but a redelivered
//! chunk whose content differs from the first delivery aborts the transfer:
//! the image can no longer be trusted.

use std::collections::VecDeque;

use crc::{Crc, CRC_32_ISO_HDLC};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::{
    coverage::ChunkCoverage,
    error::ProtocolError,
    events::HostEvent,
    message::{app_error, Payload},
    platform::{FirmwareSink, SinkError, TransferDescriptor},
    MAX_CHUNKS, MISSED_CHUNKS_TO_SEND,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One in-progress transfer
struct Transfer {
    desc: TransferDescriptor,
    coverage: ChunkCoverage,
    /// Checksum of each received chunk, for detecting content drift on
    /// redelivery
    chunk_crcs: FxHashMap<u32, u32>,
    last_chunk_at: u64,
}

enum OtaState {
    Idle,
    Receiving(Transfer),
    Applied,
    Aborted,
}

/// OTA transfer state machine
pub(crate) struct Ota {
    state: OtaState,
    max_chunk_size: u16,
}

impl Ota {
    pub fn new(max_chunk_size: u16) -> Self {
        Self {
            state: OtaState::Idle,
            max_chunk_size,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, OtaState::Receiving(_))
    }

    /// Handle `UpdateBegin`, producing the reply to send
    pub fn begin<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        desc: TransferDescriptor,
        dry_run: bool,
        now: u64,
        events: &mut VecDeque<HostEvent>,
    ) -> Payload {
        if self.is_active() {
            return Payload::Error {
                code: app_error::INVALID_STATE,
            };
        }
        if desc.file_length == 0
            || desc.chunk_size == 0
            || desc.chunk_size > self.max_chunk_size
            || desc.chunk_count() > MAX_CHUNKS
        {
            return Payload::Error {
                code: app_error::BAD_REQUEST,
            };
        }
        if let Err(e) = sink.prepare(&desc, dry_run) {
            warn!(store = %desc.store, "firmware sink rejected transfer: {e}");
            return Payload::Error {
                code: match e {
                    SinkError::InsufficientStorage => app_error::INSUFFICIENT_STORAGE,
                    SinkError::Io => app_error::INVALID_STATE,
                },
            };
        }
        if !dry_run {
            info!(
                store = %desc.store,
                file_length = desc.file_length,
                chunks = desc.chunk_count(),
                "firmware transfer started"
            );
            events.push_back(HostEvent::UpdateStarted {
                store: desc.store,
                file_length: desc.file_length,
            });
            self.state = OtaState::Receiving(Transfer {
                desc,
                coverage: ChunkCoverage::new(),
                chunk_crcs: FxHashMap::default(),
                last_chunk_at: now,
            });
        }
        Payload::UpdateReady
    }

    /// Handle `UpdateChunk`; `Some` when a reply or progress report is due
    pub fn chunk<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        index: u32,
        data: &[u8],
        now: u64,
        events: &mut VecDeque<HostEvent>,
    ) -> Option<Payload> {
        let OtaState::Receiving(transfer) = &mut self.state else {
            return Some(Payload::Error {
                code: app_error::INVALID_STATE,
            });
        };
        if index >= transfer.desc.chunk_count() {
            // Redeliveries from stale descriptors; acknowledged and ignored
            debug!(index, "chunk index out of range ignored");
            return None;
        }
        if data.len() as u32 != transfer.desc.chunk_len(index) {
            return Some(Payload::Error {
                code: app_error::BAD_REQUEST,
            });
        }
        transfer.last_chunk_at = now;
        let crc = CRC32.checksum(data);
        if transfer.coverage.contains(index) {
            if transfer.chunk_crcs.get(&index) == Some(&crc) {
                // Benign redelivery
                debug!(index, "duplicate chunk ignored");
                return None;
            }
            // Same index, different bytes: the image is no longer coherent
            warn!(index, "redelivered chunk content differs, aborting transfer");
            self.abort_inner(sink, ProtocolError::MalformedMessage, events);
            return Some(Payload::UpdateAbort);
        }
        if let Err(e) = sink.save_chunk(&transfer.desc, index, data) {
            warn!(index, "firmware sink failed to store chunk: {e}");
            self.abort_inner(sink, e.into(), events);
            return Some(Payload::UpdateAbort);
        }
        transfer.coverage.insert(index);
        transfer.chunk_crcs.insert(index, crc);
        events.push_back(HostEvent::UpdateProgress {
            chunks_received: transfer.coverage.received(),
            chunk_count: transfer.desc.chunk_count(),
        });
        if transfer.coverage.is_complete(transfer.desc.chunk_count()) {
            return Some(self.apply(sink, events));
        }
        None
    }

    /// Handle `UpdateFinish`: either apply or report what is still missing
    pub fn finish_request<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        events: &mut VecDeque<HostEvent>,
    ) -> Payload {
        let OtaState::Receiving(transfer) = &mut self.state else {
            return Payload::Error {
                code: app_error::INVALID_STATE,
            };
        };
        let chunk_count = transfer.desc.chunk_count();
        if !transfer.coverage.is_complete(chunk_count) {
            let indices = transfer.coverage.missing(chunk_count, MISSED_CHUNKS_TO_SEND);
            debug!(missing = indices.len(), "transfer incomplete at finish");
            return Payload::MissingChunks { indices };
        }
        self.apply(sink, events)
    }

    /// Handle `UpdateAbort` from the peer
    pub fn peer_abort<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        events: &mut VecDeque<HostEvent>,
    ) {
        if self.is_active() {
            self.abort_inner(sink, ProtocolError::MessageReset, events);
        }
    }

    /// Abort a stalled transfer; called when the inactivity timer fires
    pub fn on_inactivity<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        events: &mut VecDeque<HostEvent>,
    ) {
        if self.is_active() {
            warn!("firmware transfer stalled, aborting");
            self.abort_inner(sink, ProtocolError::MessageTimeout, events);
        }
    }

    /// Milliseconds of the most recent chunk, for inactivity scheduling
    pub fn last_activity(&self) -> Option<u64> {
        match &self.state {
            OtaState::Receiving(transfer) => Some(transfer.last_chunk_at),
            _ => None,
        }
    }

    /// Validate the accumulated image and commit it
    fn apply<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        events: &mut VecDeque<HostEvent>,
    ) -> Payload {
        let OtaState::Receiving(transfer) = &self.state else {
            unreachable!("apply is only reached while receiving");
        };
        let desc = transfer.desc;
        match sink.crc32(&desc) {
            Ok(crc) if crc == desc.crc => {}
            Ok(crc) => {
                warn!(
                    "image checksum mismatch: expected {:08x}, got {crc:08x}",
                    desc.crc
                );
                self.abort_inner(sink, ProtocolError::MalformedMessage, events);
                return Payload::Error {
                    code: app_error::CHECKSUM_MISMATCH,
                };
            }
            Err(e) => {
                self.abort_inner(sink, e.into(), events);
                return Payload::UpdateAbort;
            }
        }
        if let Err(e) = sink.finish(&desc, true) {
            self.abort_inner(sink, e.into(), events);
            return Payload::UpdateAbort;
        }
        info!(store = %desc.store, "firmware image applied");
        self.state = OtaState::Applied;
        events.push_back(HostEvent::UpdateApplied);
        Payload::UpdateDone
    }

    fn abort_inner<S: FirmwareSink>(
        &mut self,
        sink: &mut S,
        reason: ProtocolError,
        events: &mut VecDeque<HostEvent>,
    ) {
        if let OtaState::Receiving(transfer) = &self.state {
            // Best effort; the transfer is already lost
            let _ = sink.finish(&transfer.desc, false);
        }
        self.state = OtaState::Aborted;
        events.push_back(HostEvent::UpdateAborted { reason });
    }
}
