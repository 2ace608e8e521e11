//! # scribe-server: The server role
//!
//! Serves the text files under a root directory to remote clients:
//!
//! - `Enquiry`: list the non-hidden regular files
//! - `Read`: return the last line of one file
//! - `Write`: append a line to one file
//!
//! The server is a single-threaded `mio` poll loop; each accepted
//! connection runs the dispatcher state machine (await a message, handle
//! it, reply, await the next). Handler errors are answered with an `Error`
//! message and close the connection.
//!
//! Per-filename write serialization is the clients' job (they hold the
//! distributed lock); the server relies on append-mode opens only.

mod config;
mod connection;
mod dispatch;
mod files;
mod server;

pub use config::ServerConfig;
pub use dispatch::{Disposition, Dispatcher};
pub use files::FileStore;
pub use server::Server;

use scribe_wire::WireError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server role.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed socket or filesystem syscall.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error on a client connection.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Could not bind the listening socket.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    /// The served root directory does not exist.
    #[error("served root {path:?} does not exist")]
    RootMissing { path: String },

    /// The served root directory has no files.
    #[error("served root {path:?} contains no files")]
    RootEmpty { path: String },

    /// The requested name escapes the served root or is hidden.
    #[error("Invalid file access")]
    InvalidFileAccess,

    /// A served file could not be opened.
    #[error("failed to open file {name}")]
    OpenFailed {
        name: String,
        source: std::io::Error,
    },
}
