//! Inbound payload reassembly.

use crate::error::{Result, UtpError};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Reassembles one content payload from `DATA` packets that may arrive
/// out of order or duplicated.
///
/// `start_seq` is fixed at construction (the sequence number following
/// the handshake). After the peer's `FIN` names the end of the stream,
/// [`ContentReader::run`] walks `start_seq .. fin_nr` in modular order
/// and yields the contiguous payload.
#[derive(Debug)]
pub struct ContentReader {
    start_seq: u16,
    received: BTreeMap<u16, Bytes>,
    bytes_buffered: usize,
}

impl ContentReader {
    pub fn new(start_seq: u16) -> Self {
        Self {
            start_seq,
            received: BTreeMap::new(),
            bytes_buffered: 0,
        }
    }

    /// First data sequence number of the stream.
    pub fn start_seq(&self) -> u16 {
        self.start_seq
    }

    /// Total payload bytes buffered so far.
    pub fn bytes_buffered(&self) -> usize {
        self.bytes_buffered
    }

    /// Buffers a data packet. Duplicates are ignored.
    pub fn add_packet(&mut self, seq: u16, payload: Bytes) {
        if self.received.contains_key(&seq) {
            return;
        }
        self.bytes_buffered += payload.len();
        self.received.insert(seq, payload);
    }

    /// True when `seq` has been buffered.
    pub fn contains(&self, seq: u16) -> bool {
        self.received.contains_key(&seq)
    }

    /// Assembles the stream: every sequence number from `start_seq` up to
    /// (excluding) `fin_nr`, concatenated in modular order.
    ///
    /// Called exactly once, after `FIN` is observed. A missing sequence
    /// number fails the whole stream.
    pub fn run(mut self, fin_nr: u16) -> Result<Bytes> {
        let mut assembled = BytesMut::with_capacity(self.bytes_buffered);
        let mut seq = self.start_seq;
        while seq != fin_nr {
            let chunk = self
                .received
                .remove(&seq)
                .ok_or(UtpError::IncompleteStream { missing: seq })?;
            assembled.extend_from_slice(&chunk);
            seq = seq.wrapping_add(1);
        }
        Ok(assembled.freeze())
    }
}
