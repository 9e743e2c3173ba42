//! Transfer receiver: reassembles inbound frames into a payload and reports progress.
//!
//! Identity policy: a new metadata frame always wins (any partial transfer is discarded);
//! a completion frame must name the tracked transfer; out-of-protocol frames are ignored.

use tracing::{debug, info, warn};

use crate::chunk::{self, chunk_count, ChunkBuffer};
use crate::protocol::{ControlFrame, TransferId, TransferMetadata};
use crate::wire::{self, Frame};

/// Observable receiver events, in the order they fire for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// Metadata frame accepted; fired once per transfer.
    Metadata(TransferMetadata),
    /// floor(received / total * 100), once per chunk.
    Progress(u8),
    /// Completion frame accepted; the payload is every chunk concatenated in arrival order.
    Complete {
        payload: Vec<u8>,
        meta: TransferMetadata,
    },
}

struct Incoming {
    meta: TransferMetadata,
    buffer: ChunkBuffer,
}

/// One inbound transfer at a time; idle between transfers.
#[derive(Default)]
pub struct TransferReceiver {
    active: Option<Incoming>,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving(&self) -> bool {
        self.active.is_some()
    }

    /// Chunks buffered for the in-flight transfer.
    pub fn received_chunks(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.buffer.received())
    }

    /// Feed one frame from the channel.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<ReceiverEvent> {
        match frame {
            Frame::Text(text) => match wire::decode_control(&text) {
                Ok(ControlFrame::FileInfo { meta }) => self.on_metadata(meta),
                Ok(ControlFrame::FileComplete { file_id }) => self.on_complete(file_id),
                Err(e) => {
                    debug!(error = %e, "ignoring malformed control frame");
                    vec![]
                }
            },
            Frame::Binary(bytes) => self.on_chunk(bytes),
        }
    }

    /// Drop any in-flight transfer and return to idle.
    pub fn reset(&mut self) -> Option<TransferId> {
        self.active.take().map(|a| {
            debug!(
                transfer_id = %a.meta.transfer_id,
                received = a.buffer.received(),
                total = a.meta.chunk_count,
                "inbound transfer abandoned"
            );
            a.meta.transfer_id
        })
    }

    fn on_metadata(&mut self, meta: TransferMetadata) -> Vec<ReceiverEvent> {
        if meta.chunk_count != chunk_count(meta.byte_size) {
            warn!(
                transfer_id = %meta.transfer_id,
                size = meta.byte_size,
                chunks = meta.chunk_count,
                "ignoring metadata with inconsistent chunk count"
            );
            return vec![];
        }
        if let Some(prev) = self.active.take() {
            warn!(
                previous = %prev.meta.transfer_id,
                next = %meta.transfer_id,
                received = prev.buffer.received(),
                "new transfer before completion, discarding partial transfer"
            );
        }
        info!(
            transfer_id = %meta.transfer_id,
            name = %meta.name,
            size = meta.byte_size,
            chunks = meta.chunk_count,
            "receiving transfer"
        );
        self.active = Some(Incoming {
            buffer: ChunkBuffer::new(&meta),
            meta: meta.clone(),
        });
        vec![ReceiverEvent::Metadata(meta)]
    }

    fn on_chunk(&mut self, bytes: Vec<u8>) -> Vec<ReceiverEvent> {
        let Some(active) = self.active.as_mut() else {
            debug!(len = bytes.len(), "ignoring chunk with no transfer in progress");
            return vec![];
        };
        match active.buffer.push(bytes) {
            Ok(received) => vec![ReceiverEvent::Progress(chunk::percent(
                received,
                active.meta.chunk_count,
            ))],
            Err(e) => {
                warn!(transfer_id = %active.meta.transfer_id, error = %e, "ignoring chunk");
                vec![]
            }
        }
    }

    fn on_complete(&mut self, file_id: TransferId) -> Vec<ReceiverEvent> {
        match &self.active {
            None => {
                warn!(transfer_id = %file_id, "ignoring completion with no transfer in progress");
                return vec![];
            }
            Some(a) if a.meta.transfer_id != file_id => {
                warn!(
                    expected = %a.meta.transfer_id,
                    got = %file_id,
                    "ignoring completion for another transfer"
                );
                return vec![];
            }
            Some(_) => {}
        }
        let Some(Incoming { meta, buffer }) = self.active.take() else {
            return vec![];
        };
        if !buffer.is_complete() {
            warn!(
                transfer_id = %meta.transfer_id,
                received = buffer.received(),
                total = meta.chunk_count,
                received_bytes = buffer.received_bytes(),
                size = meta.byte_size,
                "completion before all data arrived, dropping transfer"
            );
            return vec![];
        }
        info!(transfer_id = %meta.transfer_id, size = meta.byte_size, "transfer received");
        let mut events = Vec::with_capacity(2);
        if meta.chunk_count == 0 {
            // no chunk frames, so 100 has not been reported yet
            events.push(ReceiverEvent::Progress(100));
        }
        events.push(ReceiverEvent::Complete {
            payload: buffer.into_bytes(),
            meta,
        });
        events
    }
}
