//! Property-based tests for the transfer protocol.

use std::collections::VecDeque;
use std::time::Duration;

use beam_core::chunk::{chunk_count, CHUNK_SIZE};
use beam_core::receiver::{ReceiverEvent, TransferReceiver};
use beam_core::scheduler::Watermarks;
use beam_core::sender::{SenderOutput, TransferSender};
use beam_core::Frame;
use proptest::prelude::*;

/// Answer chunk reads from `payload` on a channel that never drains: every frame stays buffered.
fn drive(sender: &mut TransferSender, first: Vec<SenderOutput>, payload: &[u8], mut buffered: u64) -> Vec<SenderOutput> {
    let mut queue = VecDeque::from(first);
    let mut all = Vec::new();
    while let Some(o) = queue.pop_front() {
        match &o {
            SenderOutput::Frame(f) => buffered += f.len() as u64,
            SenderOutput::ReadChunk {
                transfer_id,
                offset,
                len,
            } => {
                let start = *offset as usize;
                let bytes = payload[start..start + len].to_vec();
                queue.extend(sender.on_chunk_read(transfer_id, bytes, buffered));
            }
            _ => {}
        }
        all.push(o);
    }
    all
}

fn run_transfer(payload: Vec<u8>) -> (Vec<SenderOutput>, Vec<ReceiverEvent>) {
    let mut sender = TransferSender::new(
        Watermarks {
            low: 0,
            high: u64::MAX,
        },
        Duration::from_millis(20),
    );
    let (_, out) = sender.start(payload.len() as u64, "f.bin", "", 0).unwrap();
    let out = drive(&mut sender, out, &payload, 0);
    let mut receiver = TransferReceiver::new();
    let events = out
        .iter()
        .filter_map(|o| match o {
            SenderOutput::Frame(f) => Some(f.clone()),
            _ => None,
        })
        .flat_map(|f| receiver.on_frame(f))
        .collect();
    (out, events)
}

fn is_monotonic(values: &[u8]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

proptest! {
    /// Any payload reassembles byte-for-byte from ceil(size / CHUNK_SIZE) chunk frames.
    #[test]
    fn reconstruction(len in 0usize..(CHUNK_SIZE * 6), seed in any::<u8>()) {
        let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(seed).wrapping_add(seed)).collect();
        let (out, events) = run_transfer(payload.clone());

        let chunks = out
            .iter()
            .filter(|o| matches!(o, SenderOutput::Frame(Frame::Binary(_))))
            .count() as u64;
        prop_assert_eq!(chunks, chunk_count(len as u64));
        prop_assert_eq!(chunks, (len as u64).div_ceil(CHUNK_SIZE as u64));

        let complete: Vec<&Vec<u8>> = events
            .iter()
            .filter_map(|e| match e {
                ReceiverEvent::Complete { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        prop_assert_eq!(complete, vec![&payload]);
    }

    /// Progress never goes backwards and ends at exactly 100, on both sides.
    #[test]
    fn progress_monotonic(len in 0usize..(CHUNK_SIZE * 8)) {
        let (out, events) = run_transfer(vec![7u8; len]);
        let sent: Vec<u8> = out
            .iter()
            .filter_map(|o| match o {
                SenderOutput::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        let received: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ReceiverEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        prop_assert!(is_monotonic(&sent));
        prop_assert!(is_monotonic(&received));
        prop_assert_eq!(sent.last().copied(), Some(100));
        prop_assert_eq!(received.last().copied(), Some(100));
        prop_assert_eq!(sent.iter().filter(|p| **p == 100).count(), 1);
        prop_assert_eq!(received.iter().filter(|p| **p == 100).count(), 1);
    }

    /// Without a drain, the sender never overshoots the high watermark by more than one chunk.
    #[test]
    fn pump_respects_high_watermark(
        chunks in 1usize..40,
        high_chunks in 1u64..8,
        initial in 0u64..(CHUNK_SIZE as u64 * 4),
    ) {
        let high = high_chunks * CHUNK_SIZE as u64;
        let mut sender = TransferSender::new(
            Watermarks { low: 0, high },
            Duration::from_millis(20),
        );
        let payload = vec![1u8; chunks * CHUNK_SIZE];
        let (_, out) = sender.start(payload.len() as u64, "f", "", initial).unwrap();
        let out = drive(&mut sender, out, &payload, initial);
        let mut frames = out.iter().filter_map(|o| match o {
            SenderOutput::Frame(f) => Some(f.len() as u64),
            _ => None,
        });
        let metadata = frames.next().unwrap_or(0);
        let total = initial + metadata + frames.sum::<u64>();
        let bound = (initial + metadata).max(high + CHUNK_SIZE as u64);
        // completion frame is small and only follows the last chunk
        prop_assert!(total <= bound + 256);
    }
}
