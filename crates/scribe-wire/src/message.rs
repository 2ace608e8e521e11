//! Typed messages and their body layouts.

use std::fmt::{self, Display};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{WireError, WireResult};

/// Delimiter between the filename and the line in a `Write` body.
pub const STRING_DELIMITER: &[u8] = b"\r\n";

/// Unique identifier for a node in the cluster.
///
/// Node IDs are small integers assigned by the operator; the wire form is
/// the raw byte (inside `EstablishConnection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

impl NodeId {
    /// Creates a new node ID.
    pub fn new(id: u8) -> Self {
        Self(id)
    }

    /// Returns the node ID as a `u8`.
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// Which end of a connection this node plays.
///
/// The role decides the chunk size used when splitting a file payload into
/// `TransmitData` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Chunk size for compound file-transfer sends.
    pub fn chunk_size(self) -> usize {
        match self {
            Role::Server => 200,
            Role::Client => 100,
        }
    }
}

/// Message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ok = 0,
    Error = 1,
    EstablishConnection = 2,
    Response = 3,
    FileTransfer = 4,
    TransmitData = 5,
    Finished = 6,
    Enquiry = 7,
    Read = 8,
    Write = 9,
    Request = 100,
    Reply = 101,
}

impl Opcode {
    /// Parses an opcode byte.
    pub fn from_u8(byte: u8) -> WireResult<Self> {
        match byte {
            0 => Ok(Opcode::Ok),
            1 => Ok(Opcode::Error),
            2 => Ok(Opcode::EstablishConnection),
            3 => Ok(Opcode::Response),
            4 => Ok(Opcode::FileTransfer),
            5 => Ok(Opcode::TransmitData),
            6 => Ok(Opcode::Finished),
            7 => Ok(Opcode::Enquiry),
            8 => Ok(Opcode::Read),
            9 => Ok(Opcode::Write),
            100 => Ok(Opcode::Request),
            101 => Ok(Opcode::Reply),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }

    /// Returns true if this opcode opens a compound message.
    pub fn starts_compound(self) -> bool {
        matches!(self, Opcode::FileTransfer)
    }
}

/// A parsed protocol message.
///
/// Decoding a `FileTransfer` yields the staging path the payload was
/// written to, not the sender's filename; see [`crate::FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ok,
    Error { message: String },
    EstablishConnection { id: NodeId, text: String },
    Response { text: String },
    FileTransfer { file_name: String },
    TransmitData { data: Vec<u8> },
    Finished,
    Enquiry,
    Read { file_name: String },
    Write { file_name: String, line: String },
    Request { timestamp: u64, file_name: String },
    Reply { timestamp: u64, file_name: String },
}

impl Message {
    /// Returns the opcode of this message.
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Ok => Opcode::Ok,
            Message::Error { .. } => Opcode::Error,
            Message::EstablishConnection { .. } => Opcode::EstablishConnection,
            Message::Response { .. } => Opcode::Response,
            Message::FileTransfer { .. } => Opcode::FileTransfer,
            Message::TransmitData { .. } => Opcode::TransmitData,
            Message::Finished => Opcode::Finished,
            Message::Enquiry => Opcode::Enquiry,
            Message::Read { .. } => Opcode::Read,
            Message::Write { .. } => Opcode::Write,
            Message::Request { .. } => Opcode::Request,
            Message::Reply { .. } => Opcode::Reply,
        }
    }

    /// Serializes the body for this message.
    pub(crate) fn encode_body(&self, body: &mut BytesMut) {
        match self {
            Message::Ok | Message::Finished | Message::Enquiry => {}
            Message::Error { message } => body.put_slice(message.as_bytes()),
            Message::EstablishConnection { id, text } => {
                body.put_u8(id.as_u8());
                body.put_slice(text.as_bytes());
            }
            Message::Response { text } => body.put_slice(text.as_bytes()),
            Message::FileTransfer { file_name } => body.put_slice(file_name.as_bytes()),
            Message::TransmitData { data } => body.put_slice(data),
            Message::Read { file_name } => body.put_slice(file_name.as_bytes()),
            Message::Write { file_name, line } => {
                body.put_slice(file_name.as_bytes());
                body.put_slice(STRING_DELIMITER);
                body.put_slice(line.as_bytes());
            }
            Message::Request {
                timestamp,
                file_name,
            }
            | Message::Reply {
                timestamp,
                file_name,
            } => {
                body.put_u64_le(*timestamp);
                body.put_slice(file_name.as_bytes());
            }
        }
    }

    /// Parses a body for the given opcode.
    pub(crate) fn decode_body(opcode: Opcode, body: &[u8]) -> WireResult<Self> {
        match opcode {
            Opcode::Ok => Ok(Message::Ok),
            Opcode::Error => Ok(Message::Error {
                message: text(body)?,
            }),
            Opcode::EstablishConnection => {
                let Some((&id, rest)) = body.split_first() else {
                    return Err(WireError::InvalidBody {
                        opcode,
                        reason: "missing node id byte",
                    });
                };
                Ok(Message::EstablishConnection {
                    id: NodeId::new(id),
                    text: text(rest)?,
                })
            }
            Opcode::Response => Ok(Message::Response { text: text(body)? }),
            Opcode::FileTransfer => Ok(Message::FileTransfer {
                file_name: text(body)?,
            }),
            Opcode::TransmitData => Ok(Message::TransmitData {
                data: body.to_vec(),
            }),
            Opcode::Finished => Ok(Message::Finished),
            Opcode::Enquiry => Ok(Message::Enquiry),
            Opcode::Read => Ok(Message::Read {
                file_name: text(body)?,
            }),
            Opcode::Write => {
                let split = find_delimiter(body).ok_or(WireError::InvalidBody {
                    opcode,
                    reason: "missing filename delimiter",
                })?;
                Ok(Message::Write {
                    file_name: text(&body[..split])?,
                    line: text(&body[split + STRING_DELIMITER.len()..])?,
                })
            }
            Opcode::Request => {
                let (timestamp, file_name) = clocked(opcode, body)?;
                Ok(Message::Request {
                    timestamp,
                    file_name,
                })
            }
            Opcode::Reply => {
                let (timestamp, file_name) = clocked(opcode, body)?;
                Ok(Message::Reply {
                    timestamp,
                    file_name,
                })
            }
        }
    }
}

fn text(bytes: &[u8]) -> WireResult<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn find_delimiter(body: &[u8]) -> Option<usize> {
    body.windows(STRING_DELIMITER.len())
        .position(|window| window == STRING_DELIMITER)
}

/// Parses an 8-byte LE timestamp followed by a filename.
fn clocked(opcode: Opcode, body: &[u8]) -> WireResult<(u64, String)> {
    if body.len() < 8 {
        return Err(WireError::InvalidBody {
            opcode,
            reason: "short timestamp",
        });
    }
    let mut head = &body[..8];
    let timestamp = head.get_u64_le();
    Ok((timestamp, text(&body[8..])?))
}
