//! # scribe-wire: Binary wire protocol for `scribe`
//!
//! This crate defines the framed message protocol spoken on every `scribe`
//! connection: between peer nodes (mutual-exclusion traffic) and between a
//! client and the server fleet (file traffic).
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────┬──────────────┬──────────────────┐
//! │ Opcode  │ Body length  │      Body        │
//! │ (1 B)   │ (4 B, LE)    │      (var)       │
//! └─────────┴──────────────┴──────────────────┘
//! ```
//!
//! The body layout is per-opcode; multibyte integers are little-endian and
//! all text is raw UTF-8.
//!
//! ## Compound messages
//!
//! A `FileTransfer` frame opens a compound: the following `TransmitData`
//! frames carry chunks of the file payload and a `Finished` frame closes it.
//! The decoder stages the payload into a file under its temp directory and
//! delivers a single `FileTransfer` message whose body is the staging path.
//! Senders split the payload into role-dependent chunks (200 bytes for the
//! server role, 100 for the client role).

mod error;
mod frame;
mod message;

pub use error::{WireError, WireResult};
pub use frame::{FrameDecoder, FrameEncoder, HEADER_SIZE, MAX_BODY_SIZE};
pub use message::{Message, NodeId, Opcode, Role, STRING_DELIMITER};
