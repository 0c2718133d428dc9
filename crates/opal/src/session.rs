//! UDP host session: the unreliable datagram bus the transport rides on.

use bytes::Bytes;
use log::{error, info, trace};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use utpal::{Outbound, UtpHandle};

const MAX_DATAGRAM_SIZE: usize = 1500;

/// Bridges a UDP socket to a transport: inbound datagrams go to the
/// handle, outbound records go on the wire.
pub struct UdpSession {
    socket: Arc<UdpSocket>,
}

impl UdpSession {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("session bound to {}", socket.local_addr()?);
        Ok(Self { socket: Arc::new(socket) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Pumps datagrams both ways. Returns when the transport side closes
    /// its outbound channel.
    pub async fn run(
        &self,
        handle: UtpHandle,
        mut outbound: UnboundedReceiver<Outbound>,
    ) -> io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => {
                            trace!("{} bytes from {}", len, src);
                            handle.on_datagram(src, Bytes::copy_from_slice(&buf[..len]));
                        }
                        Err(err) => {
                            // Transient receive errors are not fatal for UDP.
                            error!("failed to receive datagram: {err}");
                        }
                    }
                }
                queued = outbound.recv() => {
                    match queued {
                        Some(Outbound { remote, payload }) => {
                            trace!("{} bytes to {}", payload.len(), remote);
                            self.socket.send_to(&payload, remote).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
