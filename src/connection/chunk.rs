//! Chunk framing for oversized data payloads.
//!
//! Encoded payloads larger than the configured threshold are split into
//! sequentially numbered chunks sharing a transfer id. Each chunk travels as
//! a marker-prefixed frame; unmarked payloads pass through untouched. The
//! receiving side records ranges by index and reconstitutes the payload once
//! every index of a transfer has arrived, regardless of arrival order.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// First byte of every chunk frame. The default codec's output never starts
/// with this value, so marked and unmarked payloads cannot be confused.
pub const CHUNK_MARKER: u8 = 0xCD;

/// marker + transfer id + index + total, all big-endian u32s.
const HEADER_LEN: usize = 1 + 4 + 4 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
}

/// One bounded slice of an oversized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer_id: u32,
    pub index: u32,
    pub total: u32,
    pub payload: Bytes,
}

/// Splits `payload` into `ceil(len / threshold)` frames of at most
/// `threshold` payload bytes each, all tagged with `transfer_id`.
pub fn split_payload(payload: &[u8], threshold: usize, transfer_id: u32) -> Vec<ChunkFrame> {
    debug_assert!(threshold > 0);
    let total = payload.len().div_ceil(threshold) as u32;
    payload
        .chunks(threshold)
        .enumerate()
        .map(|(index, slice)| ChunkFrame {
            transfer_id,
            index: index as u32,
            total,
            payload: Bytes::copy_from_slice(slice),
        })
        .collect()
}

pub fn encode_chunk(frame: &ChunkFrame) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.push(CHUNK_MARKER);
    buf.extend_from_slice(&frame.transfer_id.to_be_bytes());
    buf.extend_from_slice(&frame.index.to_be_bytes());
    buf.extend_from_slice(&frame.total.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Bytes::from(buf)
}

/// Returns `Ok(None)` for unmarked payloads, which flow through the normal
/// inbound path whole.
pub fn decode_chunk(bytes: &[u8]) -> Result<Option<ChunkFrame>, ChunkError> {
    if bytes.first().copied() != Some(CHUNK_MARKER) {
        return Ok(None);
    }
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("frame shorter than header"));
    }
    let transfer_id = u32::from_be_bytes(bytes[1..5].try_into().expect("4-byte slice"));
    let index = u32::from_be_bytes(bytes[5..9].try_into().expect("4-byte slice"));
    let total = u32::from_be_bytes(bytes[9..13].try_into().expect("4-byte slice"));
    if total == 0 {
        return Err(ChunkError::Malformed("total cannot be zero"));
    }
    if index >= total {
        return Err(ChunkError::Malformed("index out of range"));
    }
    Ok(Some(ChunkFrame {
        transfer_id,
        index,
        total,
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    }))
}

#[derive(Debug)]
struct Partial {
    slots: Vec<Option<Bytes>>,
    received: u32,
    total: u32,
}

/// Reassembly table keyed by transfer id. Entries exist only while a
/// transfer is incomplete; completion removes the entry in the same step.
/// Completed ids are remembered so a straggler cannot reopen its transfer.
#[derive(Debug, Default)]
pub struct Reassembler {
    table: HashMap<u32, Partial>,
    completed: HashSet<u32>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one chunk; returns the reconstituted payload when this chunk
    /// completes its transfer. Duplicate indices are ignored.
    pub fn ingest(&mut self, frame: ChunkFrame) -> Result<Option<Bytes>, ChunkError> {
        if frame.index >= frame.total || frame.total == 0 {
            return Err(ChunkError::Malformed("index out of range"));
        }
        if self.completed.contains(&frame.transfer_id) {
            return Ok(None);
        }
        let entry = self.table.entry(frame.transfer_id).or_insert_with(|| Partial {
            slots: vec![None; frame.total as usize],
            received: 0,
            total: frame.total,
        });
        if entry.total != frame.total {
            self.table.remove(&frame.transfer_id);
            return Err(ChunkError::Malformed("total changed mid-transfer"));
        }
        let slot = &mut entry.slots[frame.index as usize];
        if slot.is_none() {
            *slot = Some(frame.payload);
            entry.received += 1;
        }
        if entry.received < entry.total {
            return Ok(None);
        }

        let entry = self
            .table
            .remove(&frame.transfer_id)
            .expect("entry present: just completed");
        self.completed.insert(frame.transfer_id);
        let size = entry.slots.iter().map(|s| s.as_ref().map_or(0, |b| b.len())).sum();
        let mut combined = Vec::with_capacity(size);
        for slot in entry.slots {
            let chunk = slot.ok_or(ChunkError::Malformed("missing range at completion"))?;
            combined.extend_from_slice(&chunk);
        }
        Ok(Some(Bytes::from(combined)))
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    #[test]
    fn split_counts_match_ceil_division() {
        // 800 KiB at the production threshold: ceil(819200 / 16300) = 51,
        // with a short final chunk.
        let payload = vec![0x5Au8; 800 * 1024];
        let frames = split_payload(&payload, 16_300, 9);
        assert_eq!(frames.len(), 51);
        assert!(frames[..50].iter().all(|f| f.payload.len() == 16_300));
        assert_eq!(frames[50].payload.len(), 819_200 - 50 * 16_300);
        assert!(frames.iter().all(|f| f.total == 51));
    }

    #[test]
    fn empty_payload_splits_to_nothing() {
        assert!(split_payload(&[], 16_300, 1).is_empty());
    }

    #[test]
    fn reassembly_is_arrival_order_independent() {
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let mut frames = split_payload(&payload, 64, 42);
        frames.shuffle(&mut thread_rng());
        // duplicate one frame to confirm dedupe
        frames.push(frames[0].clone());

        let mut reassembler = Reassembler::new();
        let mut recovered = None;
        for frame in frames {
            if let Some(done) = reassembler.ingest(frame).expect("ingest") {
                recovered = Some(done);
            }
        }
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn completion_waits_for_every_index() {
        let payload = vec![1u8; 300];
        let frames = split_payload(&payload, 100, 7);
        assert_eq!(frames.len(), 3);

        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.ingest(frames[0].clone()).unwrap(), None);
        assert_eq!(reassembler.ingest(frames[2].clone()).unwrap(), None);
        assert_eq!(reassembler.pending(), 1);
        let done = reassembler.ingest(frames[1].clone()).unwrap();
        assert_eq!(done.as_deref(), Some(payload.as_slice()));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn stragglers_after_completion_are_dropped() {
        let payload = vec![9u8; 200];
        let frames = split_payload(&payload, 100, 5);
        let mut reassembler = Reassembler::new();
        assert!(reassembler.ingest(frames[0].clone()).unwrap().is_none());
        assert!(reassembler.ingest(frames[1].clone()).unwrap().is_some());

        // A late duplicate must not reopen the finished transfer.
        assert_eq!(reassembler.ingest(frames[1].clone()).unwrap(), None);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn frame_encoding_round_trips() {
        let frame = ChunkFrame {
            transfer_id: 0xDEAD,
            index: 3,
            total: 8,
            payload: Bytes::from_static(b"range"),
        };
        let wire = encode_chunk(&frame);
        assert_eq!(wire[0], CHUNK_MARKER);
        let back = decode_chunk(&wire).expect("decode").expect("marked frame");
        assert_eq!(back, frame);
    }

    #[test]
    fn unmarked_payloads_pass_through() {
        assert_eq!(decode_chunk(b"plain payload").unwrap(), None);
        assert_eq!(decode_chunk(&[]).unwrap(), None);
    }

    #[test]
    fn header_violations_are_malformed() {
        assert!(decode_chunk(&[CHUNK_MARKER, 0, 0]).is_err());
        let mut bad = encode_chunk(&ChunkFrame {
            transfer_id: 1,
            index: 0,
            total: 1,
            payload: Bytes::new(),
        })
        .to_vec();
        bad[9..13].copy_from_slice(&0u32.to_be_bytes());
        assert!(decode_chunk(&bad).is_err());
    }
}
