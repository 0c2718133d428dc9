//! Per-connection state machine.
//!
//! A socket is one side of one transfer: a writer streams a payload, a
//! reader reassembles it. Handlers are synchronous; outbound packets pile
//! up in a queue the transport drains after every event, and the single
//! timer a socket may own (RTO for writers, idle for readers) is armed by
//! the transport from [`UtpSocket::timer`].

use crate::congestion::{CongestionController, MAX_CONSECUTIVE_TIMEOUTS};
use crate::error::{Result, UtpError};
use crate::outgoing::OutgoingBuffer;
use crate::protocol::{Packet, PacketType, SelectiveAck, seq_le};
use crate::reader::ContentReader;
use crate::time::wrapping_elapsed;
use crate::writer::ContentWriter;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::net::SocketAddr;
use std::time::Duration;

/// Receive window advertised in every outgoing packet.
pub const RECEIVE_WINDOW: u32 = 1024 * 1024;

/// A reader with no inbound traffic for this long resolves empty and
/// resets the connection.
pub const READER_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// The id pair a connection speaks with. Every packet we emit carries
/// `send`; every packet addressed to us carries `recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub send: u16,
    pub recv: u16,
}

impl ConnectionId {
    /// Initiator side: picks `recv` and advertises `send = recv + 1`.
    pub fn initiator(recv: u16) -> Self {
        Self { send: recv.wrapping_add(1), recv }
    }

    /// Accepting side of an advertised id: `recv` is the advertised
    /// value, replies carry `send = recv - 1`.
    pub fn acceptor(recv: u16) -> Self {
        Self { send: recv.wrapping_sub(1), recv }
    }
}

/// Whether this side sources or sinks the payload. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Reader,
    Writer,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Nothing on the wire yet (a registered reader waiting for SYN).
    None,
    /// Writer sent SYN, waiting for the handshake STATE.
    SynSent,
    /// Reader saw SYN, about to confirm.
    SynRecv,
    /// Transfer in progress.
    Connected,
    /// Reader observed FIN.
    GotFin,
    /// Finished cleanly.
    Closed,
    /// Torn down (local cancel, timeout escalation, or peer RESET).
    Reset,
}

impl SocketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Reset)
    }
}

/// Terminal outcome surfaced to the transport, at most one per socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// Reader finished (or idled out with empty content).
    Delivered(Bytes),
    /// Writer's FIN was acknowledged.
    SendComplete,
    /// The transfer failed.
    Failed(UtpError),
}

/// One μTP connection.
#[derive(Debug)]
pub struct UtpSocket {
    remote: SocketAddr,
    cid: ConnectionId,
    role: SocketRole,
    state: SocketState,
    /// Next sequence number to assign locally.
    seq_nr: u16,
    /// Highest contiguous sequence number received from the peer.
    ack_nr: u16,
    /// Sequence number of the FIN we sent (writer) or observed (reader).
    fin_nr: Option<u16>,
    /// Delay measured against the last inbound packet, echoed outbound.
    reply_micros: u32,
    /// Peer's advertised receive window, for diagnostics.
    remote_window: u32,
    congestion: CongestionController,
    out_buffer: OutgoingBuffer,
    reader: Option<ContentReader>,
    writer: Option<ContentWriter>,
    outbound: Vec<Packet>,
    event: Option<SocketEvent>,
}

impl UtpSocket {
    /// Initiating writer: queues the SYN and binds the payload chunks to
    /// the sequence numbers after `initial_seq`.
    pub fn new_writer(
        remote: SocketAddr,
        cid: ConnectionId,
        payload: Bytes,
        initial_seq: u16,
        now: u32,
    ) -> Self {
        let mut socket = Self {
            remote,
            cid,
            role: SocketRole::Writer,
            state: SocketState::SynSent,
            seq_nr: initial_seq.wrapping_add(1),
            ack_nr: 0,
            fin_nr: None,
            reply_micros: 0,
            remote_window: 0,
            congestion: CongestionController::new(),
            out_buffer: OutgoingBuffer::new(),
            reader: None,
            writer: Some(ContentWriter::new(payload, initial_seq.wrapping_add(1))),
            outbound: Vec::new(),
            event: None,
        };
        socket.out_buffer.record_send(initial_seq, now);
        socket.send_packet(Packet::new(PacketType::Syn, cid.send, initial_seq, 0), now);
        socket
    }

    /// Accepting reader: sits in `None` until the peer's SYN arrives.
    pub fn new_reader(remote: SocketAddr, cid: ConnectionId) -> Self {
        Self {
            remote,
            cid,
            role: SocketRole::Reader,
            state: SocketState::None,
            seq_nr: 0,
            ack_nr: 0,
            fin_nr: None,
            reply_micros: 0,
            remote_window: 0,
            congestion: CongestionController::new(),
            out_buffer: OutgoingBuffer::new(),
            reader: None,
            writer: None,
            outbound: Vec::new(),
            event: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.cid
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// In-flight byte count, always `|out_buffer| · MTU`.
    pub fn cur_window(&self) -> u32 {
        self.out_buffer.current_window()
    }

    pub fn max_window(&self) -> u32 {
        self.congestion.max_window()
    }

    pub fn rto(&self) -> Duration {
        self.congestion.rto()
    }

    /// Packets queued since the last drain.
    pub fn take_outbound(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbound)
    }

    /// Terminal outcome, if one fired since the last call.
    pub fn take_event(&mut self) -> Option<SocketEvent> {
        self.event.take()
    }

    /// The single timer this socket wants: RTO while a writer has packets
    /// in flight, the idle timeout for readers, nothing once terminal.
    pub fn timer(&self) -> Option<Duration> {
        if self.state.is_terminal() {
            return None;
        }
        match self.role {
            SocketRole::Reader => Some(READER_IDLE_TIMEOUT),
            SocketRole::Writer => {
                (!self.out_buffer.is_empty()).then(|| self.congestion.rto())
            }
        }
    }

    /// Inbound dispatch. Events are processed in receipt order; terminal
    /// sockets reject everything.
    pub fn on_packet(&mut self, packet: &Packet, now: u32) -> Result<()> {
        if self.state.is_terminal() {
            return Err(UtpError::StaleConnection {
                remote: self.remote,
                conn_id: self.cid.recv,
            });
        }

        self.reply_micros = wrapping_elapsed(now, packet.timestamp_micros);
        self.remote_window = packet.wnd_size;
        trace!(
            "[{}:{}] {:?} seq {} ack {} (peer window {})",
            self.remote,
            self.cid.recv,
            packet.packet_type,
            packet.seq_nr,
            packet.ack_nr,
            self.remote_window
        );
        self.congestion
            .on_delay_sample(packet.timestamp_micros, now, self.out_buffer.current_window());

        match packet.packet_type {
            PacketType::Syn => self.handle_syn(packet, now),
            PacketType::State => self.handle_state(packet, now),
            PacketType::Data => self.handle_data(packet, now),
            PacketType::Fin => self.handle_fin(packet, now),
            PacketType::Reset => self.handle_reset(),
        }
        Ok(())
    }

    /// RTO expiry (writers): throttle, retransmit, and give up after too
    /// many consecutive failures.
    pub fn on_timeout(&mut self, now: u32) {
        if self.state.is_terminal() {
            return;
        }
        self.congestion.throttle();
        debug!(
            "[{}:{}] retransmission timeout, window collapsed, rto {:?}",
            self.remote, self.cid.recv, self.congestion.rto()
        );

        if self.congestion.consecutive_timeouts() >= MAX_CONSECUTIVE_TIMEOUTS {
            warn!(
                "[{}:{}] no progress after {} timeouts, resetting",
                self.remote, self.cid.recv, MAX_CONSECUTIVE_TIMEOUTS
            );
            self.send_reset(now);
            self.teardown(SocketEvent::Failed(UtpError::Timeout));
            return;
        }

        match self.state {
            SocketState::SynSent => {
                if let Some(seq) = self.out_buffer.sequence_numbers().first().copied() {
                    self.out_buffer.record_send(seq, now);
                    self.send_packet(Packet::new(PacketType::Syn, self.cid.send, seq, 0), now);
                }
            }
            SocketState::Connected => {
                let oldest = self
                    .writer
                    .as_ref()
                    .and_then(|writer| writer.unacked().first().copied());
                if let Some(seq) = oldest {
                    self.retransmit_data(seq, now);
                } else if let Some(fin) = self.fin_nr {
                    if self.out_buffer.contains(fin) {
                        self.out_buffer.record_send(fin, now);
                        self.send_packet(
                            Packet::new(PacketType::Fin, self.cid.send, fin, self.ack_nr),
                            now,
                        );
                    }
                }
                self.start_writing(now);
            }
            _ => {}
        }
    }

    /// Idle expiry (readers): nothing heard for the whole window, resolve
    /// the fetch empty and reset.
    pub fn on_idle(&mut self, now: u32) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            "[{}:{}] reader idle for {:?}, giving up",
            self.remote, self.cid.recv, READER_IDLE_TIMEOUT
        );
        self.send_reset(now);
        self.teardown(SocketEvent::Delivered(Bytes::new()));
    }

    /// Local cancellation: RESET on the wire, `Cancelled` to the caller.
    pub fn cancel(&mut self, now: u32) {
        if self.state.is_terminal() {
            return;
        }
        self.send_reset(now);
        self.teardown(SocketEvent::Failed(UtpError::Cancelled));
    }

    fn handle_syn(&mut self, packet: &Packet, now: u32) {
        if self.role != SocketRole::Reader {
            warn!("[{}:{}] writer got SYN, dropping", self.remote, self.cid.recv);
            return;
        }
        match self.state {
            SocketState::None => {
                self.ack_nr = packet.seq_nr;
                self.seq_nr = rand::random::<u16>();
                self.reader = Some(ContentReader::new(packet.seq_nr.wrapping_add(1)));
                self.state = SocketState::SynRecv;
                trace!(
                    "[{}:{}] accepted SYN seq {}",
                    self.remote, self.cid.recv, packet.seq_nr
                );
                self.send_ack(now);
                self.state = SocketState::Connected;
            }
            SocketState::SynRecv | SocketState::Connected => {
                // Our handshake STATE was lost; answer it again.
                self.send_ack(now);
            }
            _ => {
                warn!(
                    "[{}:{}] SYN in state {:?}, dropping",
                    self.remote, self.cid.recv, self.state
                );
            }
        }
    }

    fn handle_state(&mut self, packet: &Packet, now: u32) {
        // A STATE acking our FIN finishes the transfer.
        if self.role == SocketRole::Writer
            && self.fin_nr.is_some_and(|fin| packet.ack_nr == fin)
        {
            self.out_buffer.clear();
            self.state = SocketState::Closed;
            self.emit(SocketEvent::SendComplete);
            return;
        }

        match self.state {
            SocketState::SynSent => {
                if let Some(sent) = self.out_buffer.ack(packet.ack_nr) {
                    if sent.transmissions == 1 {
                        self.congestion
                            .on_rtt_sample(wrapping_elapsed(now, sent.sent_at_micros) as u64);
                    }
                    self.ack_nr = packet.seq_nr;
                    self.state = SocketState::Connected;
                    trace!(
                        "[{}:{}] handshake complete, streaming",
                        self.remote, self.cid.recv
                    );
                    self.start_writing(now);
                } else {
                    warn!(
                        "[{}:{}] STATE ack {} does not match our SYN",
                        self.remote, self.cid.recv, packet.ack_nr
                    );
                }
            }
            SocketState::Connected => {
                self.process_acks(packet, now);
                self.start_writing(now);
            }
            _ => {
                trace!(
                    "[{}:{}] STATE in state {:?}, ignoring",
                    self.remote, self.cid.recv, self.state
                );
            }
        }
    }

    fn handle_data(&mut self, packet: &Packet, now: u32) {
        if self.role != SocketRole::Reader || self.state != SocketState::Connected {
            warn!(
                "[{}:{}] DATA unexpected in state {:?}, dropping",
                self.remote, self.cid.recv, self.state
            );
            return;
        }
        let reader = self.reader.as_mut().expect("connected reader has a buffer");
        let seq = packet.seq_nr;

        if seq_le(seq, self.ack_nr) || reader.contains(seq) {
            // Duplicate: our ack was lost, repeat it.
            trace!("[{}:{}] duplicate DATA {}", self.remote, self.cid.recv, seq);
            self.send_ack(now);
            return;
        }

        reader.add_packet(seq, packet.payload.clone());
        if seq == self.ack_nr.wrapping_add(1) {
            // In order: advance the contiguous frontier over anything
            // already buffered.
            let mut ack = seq;
            while reader.contains(ack.wrapping_add(1)) {
                ack = ack.wrapping_add(1);
            }
            self.ack_nr = ack;
        } else {
            trace!(
                "[{}:{}] out-of-order DATA {} (frontier {})",
                self.remote, self.cid.recv, seq, self.ack_nr
            );
        }
        self.send_ack(now);
    }

    fn handle_fin(&mut self, packet: &Packet, now: u32) {
        if self.role != SocketRole::Reader {
            warn!("[{}:{}] writer got FIN, dropping", self.remote, self.cid.recv);
            return;
        }
        self.fin_nr = Some(packet.seq_nr);
        self.state = SocketState::GotFin;

        let result = match self.reader.take() {
            Some(reader) => reader.run(packet.seq_nr),
            None => Ok(Bytes::new()),
        };

        self.ack_nr = packet.seq_nr;
        self.send_ack(now);
        self.state = SocketState::Closed;
        match result {
            Ok(content) => {
                debug!(
                    "[{}:{}] stream complete, {} bytes",
                    self.remote, self.cid.recv, content.len()
                );
                self.emit(SocketEvent::Delivered(content));
            }
            Err(err) => {
                warn!(
                    "[{}:{}] stream failed at FIN: {}",
                    self.remote, self.cid.recv, err
                );
                self.emit(SocketEvent::Failed(err));
            }
        }
    }

    fn handle_reset(&mut self) {
        debug!("[{}:{}] peer reset", self.remote, self.cid.recv);
        self.teardown(SocketEvent::Failed(UtpError::PeerReset));
    }

    /// Ack bookkeeping for a writer: cumulative ack, selective-ack bits,
    /// and immediate retransmission of sequence numbers the bits expose
    /// as lost.
    fn process_acks(&mut self, packet: &Packet, now: u32) {
        for seq in self.out_buffer.sequence_numbers() {
            if !seq_le(seq, packet.ack_nr) {
                continue;
            }
            if let Some(sent) = self.out_buffer.ack(seq) {
                if seq == packet.ack_nr && sent.transmissions == 1 {
                    self.congestion
                        .on_rtt_sample(wrapping_elapsed(now, sent.sent_at_micros) as u64);
                }
                if let Some(writer) = self.writer.as_mut() {
                    writer.mark_acked(seq);
                }
            }
        }

        if let Some(sack) = packet.selective_ack {
            let acked = sack.acked_seqs(packet.ack_nr);
            for &seq in &acked {
                if self.out_buffer.ack(seq).is_some() {
                    if let Some(writer) = self.writer.as_mut() {
                        writer.mark_acked(seq);
                    }
                }
            }
            // Every in-flight number below the highest selectively-acked
            // one was overtaken: treat as lost and resend right away.
            if let Some(&highest) = acked.last() {
                let mut lost = Vec::new();
                let mut seq = packet.ack_nr.wrapping_add(1);
                while seq != highest {
                    if self.out_buffer.contains(seq) {
                        lost.push(seq);
                    }
                    seq = seq.wrapping_add(1);
                }
                for seq in lost {
                    debug!(
                        "[{}:{}] seq {} lost per selective ack, retransmitting",
                        self.remote, self.cid.recv, seq
                    );
                    self.retransmit_data(seq, now);
                }
            }
        }
    }

    /// Writer pump: emit unsent chunks while the window has room, then
    /// close with FIN once everything is acknowledged.
    fn start_writing(&mut self, now: u32) {
        if self.writer.is_none() || self.state != SocketState::Connected {
            return;
        }
        loop {
            if !self.congestion.window_allows(self.out_buffer.current_window()) {
                break;
            }
            let next = self
                .writer
                .as_mut()
                .and_then(|writer| writer.next_unsent());
            let Some((seq, chunk)) = next else { break };
            self.out_buffer.record_send(seq, now);
            self.seq_nr = seq.wrapping_add(1);
            let mut packet = Packet::new(PacketType::Data, self.cid.send, seq, self.ack_nr);
            packet.payload = chunk;
            self.send_packet(packet, now);
        }

        let complete = self.writer.as_ref().is_some_and(ContentWriter::is_complete);
        if complete && self.fin_nr.is_none() {
            let fin = self.writer.as_ref().expect("writer checked above").fin_seq();
            self.fin_nr = Some(fin);
            self.seq_nr = fin.wrapping_add(1);
            self.out_buffer.record_send(fin, now);
            self.send_packet(Packet::new(PacketType::Fin, self.cid.send, fin, self.ack_nr), now);
        }
    }

    fn retransmit_data(&mut self, seq: u16, now: u32) {
        let Some(chunk) = self.writer.as_ref().and_then(|writer| writer.chunk_for(seq))
        else {
            return;
        };
        self.out_buffer.record_send(seq, now);
        let mut packet = Packet::new(PacketType::Data, self.cid.send, seq, self.ack_nr);
        packet.payload = chunk;
        self.send_packet(packet, now);
    }

    /// STATE for the current frontier; carries a selective-ack mask
    /// whenever out-of-order data is buffered beyond it.
    fn send_ack(&mut self, now: u32) {
        let sack = self
            .reader
            .as_ref()
            .map(|reader| {
                SelectiveAck::from_received(self.ack_nr, |seq| reader.contains(seq))
            })
            .filter(|sack| !sack.is_empty());
        let mut packet = Packet::new(PacketType::State, self.cid.send, self.seq_nr, self.ack_nr);
        packet.selective_ack = sack;
        self.send_packet(packet, now);
    }

    fn send_reset(&mut self, now: u32) {
        self.send_packet(
            Packet::new(PacketType::Reset, self.cid.send, self.seq_nr, self.ack_nr),
            now,
        );
    }

    fn send_packet(&mut self, mut packet: Packet, now: u32) {
        packet.timestamp_micros = now;
        packet.timestamp_diff_micros = self.reply_micros;
        packet.wnd_size = RECEIVE_WINDOW;
        self.outbound.push(packet);
    }

    fn teardown(&mut self, event: SocketEvent) {
        self.state = SocketState::Reset;
        self.out_buffer.clear();
        self.emit(event);
    }

    fn emit(&mut self, event: SocketEvent) {
        if self.event.is_none() {
            self.event = Some(event);
        }
    }
}
