//! Connection multiplexing over the host session.
//!
//! One [`UtpTransport`] task owns every socket for a host instance. The
//! session layer delivers raw datagrams through [`UtpHandle::on_datagram`];
//! outbound datagrams leave on an unbounded channel the host drains. All
//! socket mutation happens on the transport task, so events for one
//! connection are processed strictly in receipt order.

use crate::error::{Result, UtpError};
use crate::protocol::Packet;
use crate::socket::{ConnectionId, SocketEvent, SocketRole, UtpSocket};
use crate::time::now_micros;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A socket is addressed by the remote endpoint and the connection id its
/// inbound packets carry.
pub type ConnectionKey = (SocketAddr, u16);

/// Datagram handed to the host session for transmission.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub remote: SocketAddr,
    pub payload: Bytes,
}

/// Completion handle for an outbound transfer; resolves when the closing
/// FIN is acknowledged.
#[derive(Debug)]
pub struct Transfer {
    done: oneshot::Receiver<Result<()>>,
}

impl Transfer {
    pub async fn wait(self) -> Result<()> {
        self.done.await.map_err(|_| UtpError::TransportClosed)?
    }
}

enum Command {
    Inbound {
        remote: SocketAddr,
        payload: Bytes,
    },
    Write {
        remote: SocketAddr,
        conn_id: Option<u16>,
        payload: Bytes,
        registered: oneshot::Sender<u16>,
        done: oneshot::Sender<Result<()>>,
    },
    Read {
        remote: SocketAddr,
        conn_id: u16,
        done: oneshot::Sender<Result<Bytes>>,
    },
    Cancel {
        remote: SocketAddr,
        conn_id: u16,
    },
    Timer {
        key: ConnectionKey,
        generation: u64,
    },
}

struct SocketEntry {
    socket: UtpSocket,
    /// The socket's single pending timer task, if armed.
    timer: Option<JoinHandle<()>>,
    /// Discards firings of timers that were since re-armed.
    generation: u64,
    write_done: Option<oneshot::Sender<Result<()>>>,
    read_done: Option<oneshot::Sender<Result<Bytes>>>,
}

/// Cheap cloneable entry point into a transport task.
#[derive(Debug, Clone)]
pub struct UtpHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl UtpHandle {
    /// Feeds one inbound datagram from the host session.
    pub fn on_datagram(&self, remote: SocketAddr, payload: Bytes) {
        let _ = self.tx.send(Command::Inbound { remote, payload });
    }

    /// Opens an initiating writer with a freshly allocated connection id.
    /// Returns the id to advertise to the peer and the completion handle.
    pub async fn create_writer(
        &self,
        remote: SocketAddr,
        payload: Bytes,
    ) -> Result<(u16, Transfer)> {
        let (registered_tx, registered_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Write {
                remote,
                conn_id: None,
                payload,
                registered: registered_tx,
                done: done_tx,
            })
            .map_err(|_| UtpError::TransportClosed)?;
        let conn_id = registered_rx.await.map_err(|_| UtpError::TransportClosed)?;
        Ok((conn_id, Transfer { done: done_rx }))
    }

    /// Opens a writer on an id the peer negotiated out of band.
    pub async fn create_writer_on(
        &self,
        remote: SocketAddr,
        conn_id: u16,
        payload: Bytes,
    ) -> Result<Transfer> {
        let (registered_tx, registered_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Write {
                remote,
                conn_id: Some(conn_id),
                payload,
                registered: registered_tx,
                done: done_tx,
            })
            .map_err(|_| UtpError::TransportClosed)?;
        registered_rx.await.map_err(|_| UtpError::TransportClosed)?;
        Ok(Transfer { done: done_rx })
    }

    /// Registers a reader under a pre-negotiated connection id and waits
    /// for the peer's transfer to assemble.
    pub async fn read(&self, remote: SocketAddr, conn_id: u16) -> Result<Bytes> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Read { remote, conn_id, done: done_tx })
            .map_err(|_| UtpError::TransportClosed)?;
        done_rx.await.map_err(|_| UtpError::TransportClosed)?
    }

    /// Cancels a pending transfer: the socket resets and its promise
    /// resolves with `Cancelled`.
    pub fn cancel(&self, remote: SocketAddr, conn_id: u16) {
        let _ = self.tx.send(Command::Cancel { remote, conn_id });
    }
}

/// The per-host multiplexer task.
pub struct UtpTransport {
    sockets: HashMap<ConnectionKey, SocketEntry>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl UtpTransport {
    /// Builds a transport that emits datagrams on `outbound`. Call
    /// [`UtpTransport::run`] on a task to start it.
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> (Self, UtpHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let transport = Self {
            sockets: HashMap::new(),
            commands,
            command_tx: command_tx.clone(),
            outbound,
        };
        (transport, UtpHandle { tx: command_tx })
    }

    /// Event loop; returns when every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Inbound { remote, payload } => self.handle_inbound(remote, payload),
                Command::Write { remote, conn_id, payload, registered, done } => {
                    self.handle_write(remote, conn_id, payload, registered, done)
                }
                Command::Read { remote, conn_id, done } => {
                    self.handle_read(remote, conn_id, done)
                }
                Command::Cancel { remote, conn_id } => self.handle_cancel(remote, conn_id),
                Command::Timer { key, generation } => self.handle_timer(key, generation),
            }
        }
        for (_, entry) in self.sockets.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }

    fn handle_inbound(&mut self, remote: SocketAddr, payload: Bytes) {
        let packet = match Packet::decode(payload) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("dropping undecodable datagram from {remote}: {err}");
                return;
            }
        };
        let key = (remote, packet.connection_id);
        trace!(
            "inbound {:?} seq {} ack {} for {:?}",
            packet.packet_type, packet.seq_nr, packet.ack_nr, key
        );

        let Some(entry) = self.sockets.get_mut(&key) else {
            // Only a SYN under a registered accepting id binds a socket,
            // and registration already created it; everything else here
            // has nowhere to go.
            debug!(
                "dropping packet: {}",
                UtpError::UnknownConnection { remote, conn_id: packet.connection_id }
            );
            return;
        };
        if let Err(err) = entry.socket.on_packet(&packet, now_micros()) {
            debug!("dropping packet: {err}");
        }
        self.service(key);
    }

    fn handle_write(
        &mut self,
        remote: SocketAddr,
        conn_id: Option<u16>,
        payload: Bytes,
        registered: oneshot::Sender<u16>,
        done: oneshot::Sender<Result<()>>,
    ) {
        let cid = match conn_id {
            // Negotiated id: the peer expects our data under it.
            Some(id) => ConnectionId::initiator(id.wrapping_sub(1)),
            // Fresh id, re-rolled on collision with a live connection.
            None => loop {
                let recv = rand::random::<u16>();
                if !self.sockets.contains_key(&(remote, recv)) {
                    break ConnectionId::initiator(recv);
                }
            },
        };
        let key = (remote, cid.recv);
        if let Some(mut stale) = self.sockets.remove(&key) {
            warn!("replacing existing connection {key:?}");
            if let Some(timer) = stale.timer.take() {
                timer.abort();
            }
        }

        debug!(
            "opening writer to {remote}, id {} ({} bytes)",
            cid.send,
            payload.len()
        );
        let socket =
            UtpSocket::new_writer(remote, cid, payload, rand::random::<u16>(), now_micros());
        let _ = registered.send(cid.send);
        self.sockets.insert(
            key,
            SocketEntry {
                socket,
                timer: None,
                generation: 0,
                write_done: Some(done),
                read_done: None,
            },
        );
        self.service(key);
    }

    fn handle_read(
        &mut self,
        remote: SocketAddr,
        conn_id: u16,
        done: oneshot::Sender<Result<Bytes>>,
    ) {
        let key = (remote, conn_id);
        if let Some(mut stale) = self.sockets.remove(&key) {
            warn!("replacing existing connection {key:?}");
            if let Some(timer) = stale.timer.take() {
                timer.abort();
            }
        }

        debug!("accepting reader from {remote}, id {conn_id}");
        let socket = UtpSocket::new_reader(remote, ConnectionId::acceptor(conn_id));
        self.sockets.insert(
            key,
            SocketEntry {
                socket,
                timer: None,
                generation: 0,
                write_done: None,
                read_done: Some(done),
            },
        );
        self.service(key);
    }

    fn handle_cancel(&mut self, remote: SocketAddr, conn_id: u16) {
        let key = (remote, conn_id);
        if let Some(entry) = self.sockets.get_mut(&key) {
            entry.socket.cancel(now_micros());
            self.service(key);
        }
    }

    fn handle_timer(&mut self, key: ConnectionKey, generation: u64) {
        let Some(entry) = self.sockets.get_mut(&key) else {
            return;
        };
        if entry.generation != generation {
            // A newer timer superseded this firing.
            return;
        }
        entry.timer = None;
        match entry.socket.role() {
            SocketRole::Writer => entry.socket.on_timeout(now_micros()),
            SocketRole::Reader => entry.socket.on_idle(now_micros()),
        }
        self.service(key);
    }

    /// Post-event housekeeping for one socket: flush queued packets to
    /// the host session, resolve a finished promise, re-arm or cancel the
    /// timer, and drop terminal sockets.
    fn service(&mut self, key: ConnectionKey) {
        let Some(entry) = self.sockets.get_mut(&key) else {
            return;
        };

        for packet in entry.socket.take_outbound() {
            let _ = self.outbound.send(Outbound {
                remote: key.0,
                payload: packet.encode(),
            });
        }

        if let Some(event) = entry.socket.take_event() {
            match event {
                SocketEvent::Delivered(content) => {
                    if let Some(done) = entry.read_done.take() {
                        let _ = done.send(Ok(content));
                    }
                }
                SocketEvent::SendComplete => {
                    if let Some(done) = entry.write_done.take() {
                        let _ = done.send(Ok(()));
                    }
                }
                SocketEvent::Failed(err) => {
                    if let Some(done) = entry.read_done.take() {
                        // A broken stream resolves the fetch empty; real
                        // failures propagate.
                        let result = match err {
                            UtpError::IncompleteStream { .. } => Ok(Bytes::new()),
                            other => Err(other),
                        };
                        let _ = done.send(result);
                    } else if let Some(done) = entry.write_done.take() {
                        let _ = done.send(Err(err));
                    }
                }
            }
        }

        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        if entry.socket.is_terminal() {
            trace!("removing socket {key:?}");
            self.sockets.remove(&key);
        } else if let Some(delay) = entry.socket.timer() {
            entry.generation += 1;
            let generation = entry.generation;
            let tx = self.command_tx.clone();
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Command::Timer { key, generation });
            }));
        }
    }
}
