//! Wire protocol error types.

use thiserror::Error;

use crate::message::Opcode;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while framing or parsing messages.
///
/// Every framing error is fatal to the link it occurred on.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error while staging or reading a transfer payload.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The opcode byte does not name a known message.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// Body exceeds the protocol maximum.
    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: u64 },

    /// The body bytes do not match the opcode's layout.
    #[error("invalid {opcode:?} body: {reason}")]
    InvalidBody {
        opcode: Opcode,
        reason: &'static str,
    },

    /// Message text was not valid UTF-8.
    #[error("invalid utf-8 in message body")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// An opcode other than `TransmitData` / `Finished` arrived inside a
    /// file transfer.
    #[error("unexpected {0:?} inside a file transfer")]
    BadCompoundFrame(Opcode),

    /// The stream closed cleanly in the middle of a frame.
    #[error("truncated frame at end of stream")]
    Truncated,

    /// The referenced file could not be opened for a transfer send.
    #[error("cannot open {path} for transfer: {source}")]
    TransferSource {
        path: String,
        source: std::io::Error,
    },
}
