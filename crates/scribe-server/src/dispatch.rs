//! Per-connection request dispatch.
//!
//! Each accepted connection cycles: await a message, handle it, reply,
//! await the next. Enquiry, Read, and Write return to awaiting; any other
//! opcode or handler error is answered and the connection is closed.

use scribe_wire::Message;
use tracing::{info, warn};

use crate::files::FileStore;
use crate::ServerResult;

/// What to do with the connection after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Await the next message.
    Continue,
    /// Flush the reply, then close.
    Close,
}

/// Maps client messages onto the file store.
#[derive(Debug)]
pub struct Dispatcher {
    files: FileStore,
}

impl Dispatcher {
    /// Creates a dispatcher over the store.
    pub fn new(files: FileStore) -> Self {
        Self { files }
    }

    /// Handles one client message, producing the reply to send.
    pub fn handle(&self, message: Message, peer: &str) -> (Message, Disposition) {
        match message {
            Message::Enquiry => {
                info!(%peer, "received Enquiry");
                self.reply(self.files.list().map(|files| files.join(", ")))
            }
            Message::Read { file_name } => {
                info!(%peer, file = %file_name, "received Read");
                self.reply(self.files.read_last_line(&file_name))
            }
            Message::Write { file_name, line } => {
                info!(%peer, file = %file_name, "received Write");
                match self.files.append_line(&file_name, &line) {
                    Ok(()) => (Message::Ok, Disposition::Continue),
                    Err(err) => self.error(err),
                }
            }
            other => {
                warn!(%peer, opcode = ?other.opcode(), "received invalid opcode");
                (
                    Message::Error {
                        message: "Invalid opcode".to_string(),
                    },
                    Disposition::Close,
                )
            }
        }
    }

    fn reply(&self, result: ServerResult<String>) -> (Message, Disposition) {
        match result {
            Ok(text) => (Message::Response { text }, Disposition::Continue),
            Err(err) => self.error(err),
        }
    }

    fn error(&self, err: crate::ServerError) -> (Message, Disposition) {
        (
            Message::Error {
                message: err.to_string(),
            },
            Disposition::Close,
        )
    }
}
