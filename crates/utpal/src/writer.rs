//! Outbound payload chunking and send-state tracking.

use crate::protocol::MAX_DATA_PAYLOAD;
use bytes::Bytes;
use std::collections::BTreeSet;

/// Streams one payload as fixed-size `DATA` frames.
///
/// The payload is chunked once at construction; chunk `k` is permanently
/// bound to sequence number `first_seq + k` (mod 2^16), so a retransmit
/// re-uses the original number. The transfer is complete when every
/// sequence number handed out has been acknowledged.
#[derive(Debug)]
pub struct ContentWriter {
    chunks: Vec<Bytes>,
    first_seq: u16,
    /// Sequence numbers sent at least once, in send order.
    data_nrs: Vec<u16>,
    /// Sequence numbers the peer has acknowledged.
    ack_nrs: BTreeSet<u16>,
}

impl ContentWriter {
    pub fn new(payload: Bytes, first_seq: u16) -> Self {
        let mut chunks = Vec::with_capacity(payload.len().div_ceil(MAX_DATA_PAYLOAD));
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + MAX_DATA_PAYLOAD).min(payload.len());
            chunks.push(payload.slice(offset..end));
            offset = end;
        }
        Self {
            chunks,
            first_seq,
            data_nrs: Vec::new(),
            ack_nrs: BTreeSet::new(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Sequence number the closing `FIN` will carry: one past the last
    /// data frame.
    pub fn fin_seq(&self) -> u16 {
        self.first_seq.wrapping_add(self.chunks.len() as u16)
    }

    /// Hands out the next never-sent chunk with its sequence number.
    pub fn next_unsent(&mut self) -> Option<(u16, Bytes)> {
        let index = self.data_nrs.len();
        let chunk = self.chunks.get(index)?.clone();
        let seq = self.first_seq.wrapping_add(index as u16);
        self.data_nrs.push(seq);
        Some((seq, chunk))
    }

    /// Chunk bound to an already-sent sequence number, for retransmission.
    pub fn chunk_for(&self, seq: u16) -> Option<Bytes> {
        let index = seq.wrapping_sub(self.first_seq) as usize;
        if index < self.data_nrs.len() {
            Some(self.chunks[index].clone())
        } else {
            None
        }
    }

    /// Records an acknowledgement. Returns true when `seq` is one of our
    /// data frames and was not already acknowledged.
    pub fn mark_acked(&mut self, seq: u16) -> bool {
        let index = seq.wrapping_sub(self.first_seq) as usize;
        if index >= self.data_nrs.len() {
            return false;
        }
        self.ack_nrs.insert(seq)
    }

    /// True when `seq` was sent and is still unacknowledged.
    pub fn is_unacked(&self, seq: u16) -> bool {
        let index = seq.wrapping_sub(self.first_seq) as usize;
        index < self.data_nrs.len() && !self.ack_nrs.contains(&seq)
    }

    /// Sent-but-unacknowledged sequence numbers, in send order.
    pub fn unacked(&self) -> Vec<u16> {
        self.data_nrs
            .iter()
            .copied()
            .filter(|seq| !self.ack_nrs.contains(seq))
            .collect()
    }

    /// True when every chunk has been handed out.
    pub fn all_sent(&self) -> bool {
        self.data_nrs.len() == self.chunks.len()
    }

    /// True when every chunk was sent and acknowledged.
    pub fn is_complete(&self) -> bool {
        self.all_sent() && self.ack_nrs.len() == self.data_nrs.len()
    }

    /// Sequence numbers handed out so far.
    pub fn data_nrs(&self) -> &[u16] {
        &self.data_nrs
    }
}
