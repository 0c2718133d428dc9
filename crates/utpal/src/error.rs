use opal_binary::BinaryError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the transport.
///
/// Decode failures and packets for unknown or dead connections are handled
/// locally (logged and dropped); the remaining variants escalate to the
/// coordinator and resolve pending transfers.
#[derive(Error, Debug)]
pub enum UtpError {
    /// A header or extension chain could not be parsed.
    #[error("packet decode error: {0}")]
    Binary(#[from] BinaryError),

    /// The packet type nibble is not one of the five defined types.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// The version nibble is not 1.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Inbound packet with no matching socket and not an acceptable SYN.
    #[error("no connection for id {conn_id} from {remote}")]
    UnknownConnection { remote: SocketAddr, conn_id: u16 },

    /// Inbound packet for a socket that already reached a terminal state.
    #[error("connection {conn_id} from {remote} is closed")]
    StaleConnection { remote: SocketAddr, conn_id: u16 },

    /// FIN observed but the reassembly buffer still has gaps.
    #[error("incomplete stream: missing seq {missing}")]
    IncompleteStream { missing: u16 },

    /// No progress within repeated retransmission timeouts.
    #[error("connection timed out")]
    Timeout,

    /// The transfer was cancelled locally.
    #[error("transfer cancelled")]
    Cancelled,

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    PeerReset,

    /// The transport task is gone; no transfer can be started or finished.
    #[error("transport closed")]
    TransportClosed,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, UtpError>;
