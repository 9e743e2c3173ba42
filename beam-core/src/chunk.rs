//! Chunk arithmetic, progress math, and the receiver-side chunk buffer.

use std::ops::Range;

use crate::protocol::TransferMetadata;

/// Chunk size in bytes. Stays well under typical data channel message limits.
pub const CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Cap on up-front buffer reservation; the buffer still grows to any declared chunk count.
const MAX_PREALLOCATED_CHUNKS: u64 = 1024;

/// Number of chunks for a payload of `byte_size` bytes: ceil(byte_size / CHUNK_SIZE).
pub fn chunk_count(byte_size: u64) -> u64 {
    byte_size.div_ceil(CHUNK_SIZE as u64)
}

/// Byte range of chunk `index` within a payload of `byte_size` bytes.
/// Empty range if `index` is past the end.
pub fn chunk_range(index: u64, byte_size: u64) -> Range<usize> {
    let start = index.saturating_mul(CHUNK_SIZE as u64).min(byte_size);
    let end = start.saturating_add(CHUNK_SIZE as u64).min(byte_size);
    start as usize..end as usize
}

/// floor(done * 100 / total), clamped to 100. Zero total counts as done.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let p = (done.min(total) as u128 * 100) / total as u128;
    p as u8
}

/// Chunk that could not be stored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkRejected {
    #[error("all {0} chunks already received")]
    Overflow(u64),
    #[error("chunk would exceed declared size {0}")]
    TooLong(u64),
}

/// Receiver-side reassembly buffer: index-addressable, filled append-only in arrival order
/// (the channel delivers in order).
#[derive(Debug)]
pub struct ChunkBuffer {
    expected_chunks: u64,
    byte_size: u64,
    chunks: Vec<Vec<u8>>,
    received_bytes: u64,
}

impl ChunkBuffer {
    pub fn new(meta: &TransferMetadata) -> Self {
        Self {
            expected_chunks: meta.chunk_count,
            byte_size: meta.byte_size,
            chunks: Vec::with_capacity(meta.chunk_count.min(MAX_PREALLOCATED_CHUNKS) as usize),
            received_bytes: 0,
        }
    }

    /// Append the next chunk. Returns the number of chunks received so far.
    pub fn push(&mut self, bytes: Vec<u8>) -> Result<u64, ChunkRejected> {
        if self.received() >= self.expected_chunks {
            return Err(ChunkRejected::Overflow(self.expected_chunks));
        }
        if self.received_bytes + bytes.len() as u64 > self.byte_size {
            return Err(ChunkRejected::TooLong(self.byte_size));
        }
        self.received_bytes += bytes.len() as u64;
        self.chunks.push(bytes);
        Ok(self.received())
    }

    pub fn received(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// All declared chunks present and byte count matches the declared size.
    pub fn is_complete(&self) -> bool {
        self.received() == self.expected_chunks && self.received_bytes == self.byte_size
    }

    /// Concatenate chunks in arrival order, consuming the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(byte_size: u64) -> TransferMetadata {
        TransferMetadata {
            transfer_id: "t".into(),
            name: "f".to_string(),
            byte_size,
            media_type: String::new(),
            chunk_count: chunk_count(byte_size),
        }
    }

    #[test]
    fn count_for_example_file() {
        assert_eq!(chunk_count(40000), 3);
        assert_eq!(chunk_range(0, 40000), 0..16384);
        assert_eq!(chunk_range(1, 40000), 16384..32768);
        assert_eq!(chunk_range(2, 40000), 32768..40000);
        assert_eq!(chunk_range(2, 40000).len(), 7232);
    }

    #[test]
    fn count_exact_multiple() {
        assert_eq!(chunk_count(CHUNK_SIZE as u64 * 4), 4);
        assert_eq!(chunk_range(3, CHUNK_SIZE as u64 * 4).len(), CHUNK_SIZE);
    }

    #[test]
    fn count_small_and_zero() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert!(chunk_range(0, 0).is_empty());
        assert!(chunk_range(5, 10).is_empty());
    }

    #[test]
    fn percent_floors() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(999, 1000), 99);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(5, 3), 100);
    }

    #[test]
    fn buffer_reassembles_in_arrival_order() {
        let m = meta(40000);
        let payload: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        let mut buf = ChunkBuffer::new(&m);
        for i in 0..m.chunk_count {
            let n = buf.push(payload[chunk_range(i, 40000)].to_vec()).unwrap();
            assert_eq!(n, i + 1);
        }
        assert!(buf.is_complete());
        assert_eq!(buf.received_bytes(), 40000);
        assert_eq!(buf.into_bytes(), payload);
    }

    #[test]
    fn buffer_rejects_extra_chunk() {
        let m = meta(10);
        let mut buf = ChunkBuffer::new(&m);
        buf.push(vec![0u8; 10]).unwrap();
        assert_eq!(buf.push(vec![0u8; 1]), Err(ChunkRejected::Overflow(1)));
    }

    #[test]
    fn buffer_rejects_oversized_bytes() {
        let m = meta(20000);
        let mut buf = ChunkBuffer::new(&m);
        buf.push(vec![0u8; CHUNK_SIZE]).unwrap();
        assert_eq!(
            buf.push(vec![0u8; CHUNK_SIZE]),
            Err(ChunkRejected::TooLong(20000))
        );
        assert!(!buf.is_complete());
    }

    #[test]
    fn short_chunks_leave_buffer_incomplete() {
        let m = meta(40000);
        let mut buf = ChunkBuffer::new(&m);
        for _ in 0..3 {
            buf.push(vec![0u8; 100]).unwrap();
        }
        assert_eq!(buf.received(), 3);
        assert!(!buf.is_complete());
    }
}
