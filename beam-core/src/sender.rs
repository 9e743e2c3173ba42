//! Transfer sender: metadata frame, chunk frames in index order, completion frame.
//! Flow control is driven by the buffered amount the host reports for the channel.
//! File bytes never live here: the sender asks the host for one chunk at a time.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chunk::{self, chunk_count, chunk_range};
use crate::protocol::{ControlFrame, TransferId, TransferMetadata};
use crate::scheduler::{Timer, Watermarks};
use crate::wire::{self, Frame, FrameEncodeError};

/// Sender progress through one transfer. Advanced only by `on_chunk_read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCursor {
    pub transfer_id: TransferId,
    pub next_chunk_index: u64,
    pub total_chunks: u64,
}

/// Work for the host produced by the sender.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderOutput {
    /// Hand this frame to the channel, in order.
    Frame(Frame),
    /// Read `len` bytes at `offset` from the source and pass them to `on_chunk_read`.
    ReadChunk {
        transfer_id: TransferId,
        offset: u64,
        len: usize,
    },
    /// Outbound progress, 0..=100.
    Progress(u8),
    /// Arm a timer (drain polling while paused).
    Schedule(Timer, Duration),
    /// Completion frame queued; the transfer is over on this side.
    Finished(TransferId),
    /// Transfer dropped before completion (source read failed or came back short).
    Aborted(TransferId),
}

/// Why a send request was refused. Never fatal; the session logs and ignores it.
#[derive(Debug, thiserror::Error)]
pub enum SendRejected {
    #[error("transfer {0} already in flight")]
    Busy(TransferId),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
}

struct Outgoing {
    meta: TransferMetadata,
    cursor: SendCursor,
    paused: bool,
    /// A `ReadChunk` is out and its bytes have not come back yet.
    reading: bool,
}

/// One outbound transfer at a time.
pub struct TransferSender {
    watermarks: Watermarks,
    poll_interval: Duration,
    active: Option<Outgoing>,
    /// A drain poll is scheduled on the host and has not fired yet.
    poll_armed: bool,
}

impl TransferSender {
    pub fn new(watermarks: Watermarks, poll_interval: Duration) -> Self {
        Self {
            watermarks,
            poll_interval,
            active: None,
            poll_armed: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.paused)
    }

    pub fn cursor(&self) -> Option<&SendCursor> {
        self.active.as_ref().map(|a| &a.cursor)
    }

    /// Begin a transfer of `byte_size` bytes: emits the metadata frame, then the first chunk
    /// read if the buffer allows. `buffered` is the channel's outstanding unsent byte count.
    pub fn start(
        &mut self,
        byte_size: u64,
        name: &str,
        media_type: &str,
        buffered: u64,
    ) -> Result<(TransferMetadata, Vec<SenderOutput>), SendRejected> {
        if let Some(a) = &self.active {
            return Err(SendRejected::Busy(a.meta.transfer_id.clone()));
        }
        let meta = TransferMetadata {
            transfer_id: TransferId::generate(),
            name: name.to_string(),
            byte_size,
            media_type: media_type.to_string(),
            chunk_count: chunk_count(byte_size),
        };
        let info = wire::encode_control(&ControlFrame::FileInfo { meta: meta.clone() })?;
        info!(
            transfer_id = %meta.transfer_id,
            name = %meta.name,
            size = meta.byte_size,
            chunks = meta.chunk_count,
            "starting transfer"
        );
        let buffered = buffered + info.len() as u64;
        self.active = Some(Outgoing {
            cursor: SendCursor {
                transfer_id: meta.transfer_id.clone(),
                next_chunk_index: 0,
                total_chunks: meta.chunk_count,
            },
            meta: meta.clone(),
            paused: false,
            reading: false,
        });
        let mut out = vec![SenderOutput::Frame(info)];
        out.extend(self.pump(buffered));
        Ok((meta, out))
    }

    /// Ask for the next chunk unless the buffer is above the high watermark, in which case
    /// pause and wait for a drain. Once every chunk is out the completion frame follows.
    pub fn pump(&mut self, buffered: u64) -> Vec<SenderOutput> {
        let Some(active) = self.active.as_mut() else {
            return vec![];
        };
        if active.paused || active.reading {
            return vec![];
        }
        if active.cursor.next_chunk_index >= active.cursor.total_chunks {
            return self.finish();
        }
        if self.watermarks.should_pause(buffered) {
            debug!(
                transfer_id = %active.cursor.transfer_id,
                buffered,
                next_chunk = active.cursor.next_chunk_index,
                "send buffer full, pausing"
            );
            active.paused = true;
            return self.arm_poll();
        }
        let range = chunk_range(active.cursor.next_chunk_index, active.meta.byte_size);
        active.reading = true;
        vec![SenderOutput::ReadChunk {
            transfer_id: active.cursor.transfer_id.clone(),
            offset: range.start as u64,
            len: range.len(),
        }]
    }

    /// Bytes for the outstanding `ReadChunk` arrived. Emits the chunk frame and moves on.
    /// A read of the wrong length aborts the transfer.
    pub fn on_chunk_read(&mut self, transfer_id: &TransferId, bytes: Vec<u8>, buffered: u64) -> Vec<SenderOutput> {
        let Some(active) = self.active.as_mut() else {
            return vec![];
        };
        if active.cursor.transfer_id != *transfer_id || !active.reading {
            debug!(%transfer_id, "chunk read for no pending request, dropping");
            return vec![];
        }
        active.reading = false;
        let expected = chunk_range(active.cursor.next_chunk_index, active.meta.byte_size).len();
        if bytes.len() != expected {
            warn!(
                %transfer_id,
                chunk = active.cursor.next_chunk_index,
                expected,
                got = bytes.len(),
                "source read returned the wrong length, aborting transfer"
            );
            return self.abort().map(SenderOutput::Aborted).into_iter().collect();
        }
        let len = bytes.len() as u64;
        active.cursor.next_chunk_index += 1;
        // 100 is reserved for the queued completion frame.
        let p = chunk::percent(active.cursor.next_chunk_index, active.cursor.total_chunks).min(99);
        let mut out = vec![SenderOutput::Frame(Frame::Binary(bytes)), SenderOutput::Progress(p)];
        out.extend(self.pump(buffered + len));
        out
    }

    /// Channel reported its buffer drained. Resumes only at or below the low watermark.
    pub fn on_drained(&mut self, buffered: u64) -> Vec<SenderOutput> {
        match self.active.as_mut() {
            Some(a) if a.paused && self.watermarks.may_resume(buffered) => {
                debug!(transfer_id = %a.cursor.transfer_id, buffered, "send buffer drained, resuming");
                a.paused = false;
                self.pump(buffered)
            }
            _ => vec![],
        }
    }

    /// Drain poll fired: resume if at or below the low watermark, otherwise poll again.
    pub fn on_poll(&mut self, buffered: u64) -> Vec<SenderOutput> {
        self.poll_armed = false;
        if !self.is_paused() {
            return vec![];
        }
        if self.watermarks.may_resume(buffered) {
            self.on_drained(buffered)
        } else {
            self.arm_poll()
        }
    }

    /// Abandon the in-flight transfer. Returns its id, if any.
    pub fn abort(&mut self) -> Option<TransferId> {
        self.active.take().map(|a| {
            debug!(
                transfer_id = %a.cursor.transfer_id,
                sent = a.cursor.next_chunk_index,
                total = a.cursor.total_chunks,
                "outbound transfer abandoned"
            );
            a.cursor.transfer_id
        })
    }

    fn arm_poll(&mut self) -> Vec<SenderOutput> {
        if self.poll_armed {
            return vec![];
        }
        self.poll_armed = true;
        vec![SenderOutput::Schedule(Timer::DrainPoll, self.poll_interval)]
    }

    fn finish(&mut self) -> Vec<SenderOutput> {
        let Some(active) = self.active.take() else {
            return vec![];
        };
        let id = active.cursor.transfer_id;
        let complete = ControlFrame::FileComplete {
            file_id: id.clone(),
        };
        match wire::encode_control(&complete) {
            Ok(frame) => {
                info!(transfer_id = %id, "transfer sent");
                vec![
                    SenderOutput::Frame(frame),
                    SenderOutput::Progress(100),
                    SenderOutput::Finished(id),
                ]
            }
            Err(e) => {
                warn!(transfer_id = %id, error = %e, "failed to encode completion frame");
                vec![SenderOutput::Aborted(id)]
            }
        }
    }
}
