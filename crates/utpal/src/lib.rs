//! # utpal
//!
//! A reliable, delay-based congestion-controlled stream transport layered
//! over an unreliable datagram session, in the style of uTP (BEP-29).
//!
//! The session layer underneath has no notion of connection: it delivers
//! `(remote, payload)` datagrams and accepts them for sending. This crate
//! multiplexes any number of one-shot content transfers over that bus,
//! each identified by `(remote, connection_id)`.
//!
//! ## Architecture
//!
//! - **Reliability**: cumulative ACKs plus a 32-bit selective-ACK
//!   extension for targeted retransmission.
//! - **Congestion control**: one-way-delay (LEDBAT style) window scaling
//!   with an RTO fallback that collapses the window on timeout.
//! - **Concurrency**: a single [`UtpTransport`] task owns every socket;
//!   packet handlers are synchronous and all I/O crosses typed channels.
//! - **Transfers**: a writer streams one payload and closes with `FIN`;
//!   a reader reassembles it and resolves a pending fetch.

pub mod congestion;
pub mod coordinator;
pub mod error;
pub mod outgoing;
pub mod protocol;
pub mod reader;
pub mod socket;
pub mod time;
pub mod transport;
pub mod writer;

pub use coordinator::{ContentCoordinator, ContentResponse, ContentStore, NetworkId};
pub use error::{Result, UtpError};
pub use protocol::{Packet, PacketType, SelectiveAck};
pub use socket::{ConnectionId, SocketState, UtpSocket};
pub use transport::{Outbound, Transfer, UtpHandle, UtpTransport};
