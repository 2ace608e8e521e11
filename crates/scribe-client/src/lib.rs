//! # scribe-client: The client role
//!
//! Drives the random read/write workload against the server fleet:
//!
//! ```text
//! ConnectToServers ──▶ SendEnquiry ──▶ ReceiveEnquiryResponse
//!                                             │
//!              ┌──────────────────────────────▼─┐
//!              │              Wait              │◀───────────────┐
//!              └──────┬──────────────────┬──────┘                │
//!                     ▼                  ▼                       │
//!                 SendRead           SendWrite                   │
//!                     │                  │ (fan-out to all)      │
//!                     ▼                  ▼                       │
//!           ReceiveReadResponse  ReceiveWriteResponse ───────────┘
//!                     └──────────────────┴──▶ Stop (on error)
//! ```
//!
//! Reads and writes run inside the distributed critical section for the
//! chosen filename. A write is fanned out to every server replica and
//! completes only when every server acknowledges with `Ok`; a failed
//! fan-out send is fatal without releasing the lock, because the replicas
//! are no longer consistent for that filename.

mod driver;

pub use driver::{ClientConfig, Driver};

use scribe_mutex::MutexError;
use scribe_net::NetError;
use scribe_wire::Opcode;
use thiserror::Error;

/// Result type for the client role.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client workload.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure on a server connection.
    #[error(transparent)]
    Net(#[from] NetError),

    /// The mutual exclusion subsystem failed or rejected the request.
    #[error(transparent)]
    Mutex(#[from] MutexError),

    /// A uniform random pick was attempted on an empty list.
    #[error("cannot pick from an empty list")]
    EmptyList,

    /// The server enumerated zero filenames.
    #[error("server responded to enquiry with 0 file names")]
    NoFiles,

    /// A response arrived with the wrong opcode for the current step.
    #[error("expected {expected}, received {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: Opcode,
    },
}
