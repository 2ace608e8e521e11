//! # scribe-net: Peer networking for `scribe`
//!
//! This crate provides the transport pieces under the mutual-exclusion
//! subsystem and the client fan-out:
//!
//! - [`NetSocket`]: a non-blocking TCP stream with input/output byte queues
//!   and a readiness poll with a configurable timeout
//! - [`MessageStream`]: framed message read/write over a [`NetSocket`]
//! - [`Location`]: a resolved `(host, port)` with any-port equality
//! - [`handshake`]: the three-step peer identity handshake
//! - [`PeerNetwork`]: full-mesh bring-up (one inbound and one outbound
//!   connection per peer), signalling once every peer is connected
//!
//! # Threading Model
//!
//! Blocking `accept` runs on a dedicated thread. Everything else is
//! non-blocking: a socket waits for readiness with its own poll, so each
//! stream can be owned outright by a single reader or writer thread.

pub mod handshake;
mod location;
mod peer;
mod socket;
mod stream;

pub use location::{Location, PORT_ANY};
pub use peer::{PeerLink, PeerNetwork, PeerNetworkConfig, MAX_CONNECT_ATTEMPTS};
pub use socket::NetSocket;
pub use stream::MessageStream;

use scribe_wire::{Opcode, WireError};
use thiserror::Error;

/// Result type for networking operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in the peer network layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// Failed socket syscall.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error on the stream; fatal to the link.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The readiness poll timed out.
    #[error("{operation} timed out")]
    Expire { operation: &'static str },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A hostname did not resolve to an IPv4 address.
    #[error("cannot resolve host {host:?}")]
    Resolve { host: String },

    /// A `host:port` entry could not be parsed.
    #[error("malformed location {entry:?}")]
    BadLocation { entry: String },

    /// The peer rejected or broke the handshake.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    /// A message with the wrong opcode arrived for the current step.
    #[error("expected {expected}, received {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: Opcode,
    },

    /// Every connect attempt to a peer failed.
    #[error("failed to connect to {location} after {attempts} attempts")]
    ConnectFailed {
        location: Location,
        attempts: usize,
    },

    /// The mesh was torn down while a bring-up step was in flight.
    #[error("peer network shut down")]
    Shutdown,
}
