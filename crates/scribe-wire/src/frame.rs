//! Incremental frame encoding and decoding.
//!
//! The decoder is written for non-blocking I/O: feed it whatever bytes the
//! socket produced and call [`FrameDecoder::decode`] until it returns
//! `Ok(None)`. Partial frames are held across calls. Compound file
//! transfers are consumed whole: the decoder stages chunk payloads into a
//! file and only surfaces a message once the `Finished` frame arrives.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::error::{WireError, WireResult};
use crate::message::{Message, Opcode, Role};

/// Size of the frame header in bytes (opcode + body length).
pub const HEADER_SIZE: usize = 5;

/// Maximum body size the 4-byte length field can carry.
pub const MAX_BODY_SIZE: u64 = u32::MAX as u64;

/// Process-wide counter used to name transfer staging files.
static TRANSFER_COUNT: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Encoder
// ============================================================================

/// Encodes messages into framed bytes.
///
/// The role decides the chunk size for compound file-transfer sends.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    role: Role,
}

impl FrameEncoder {
    /// Creates an encoder for the given role.
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Encodes a message into the output buffer.
    ///
    /// A `FileTransfer` message expands into the full compound sequence:
    /// the transfer header, one `TransmitData` frame per chunk of the named
    /// file, and a terminating `Finished` frame.
    pub fn encode(&self, message: &Message, out: &mut BytesMut) -> WireResult<()> {
        if let Message::FileTransfer { file_name } = message {
            self.encode_transfer(file_name, out)
        } else {
            put_frame(message, out)
        }
    }

    fn encode_transfer(&self, file_name: &str, out: &mut BytesMut) -> WireResult<()> {
        let mut file = File::open(file_name).map_err(|source| WireError::TransferSource {
            path: file_name.to_string(),
            source,
        })?;

        put_frame(
            &Message::FileTransfer {
                file_name: file_name.to_string(),
            },
            out,
        )?;

        let mut chunk = vec![0u8; self.role.chunk_size()];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            debug!(bytes = n, "sending file transfer chunk");
            put_frame(
                &Message::TransmitData {
                    data: chunk[..n].to_vec(),
                },
                out,
            )?;
        }

        put_frame(&Message::Finished, out)
    }
}

/// Writes a single frame (opcode, length, body) into the output buffer.
fn put_frame(message: &Message, out: &mut BytesMut) -> WireResult<()> {
    let mut body = BytesMut::new();
    message.encode_body(&mut body);

    if body.len() as u64 > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge {
            size: body.len(),
            max: MAX_BODY_SIZE,
        });
    }

    out.reserve(HEADER_SIZE + body.len());
    out.put_u8(message.opcode() as u8);
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
    Ok(())
}

// ============================================================================
// Decoder
// ============================================================================

/// Phase of the frame parser.
#[derive(Debug, Clone, Copy)]
enum DecoderState {
    ReadingOpcode,
    ReadingLength { opcode: Opcode },
    ReadingBody { opcode: Opcode, length: usize },
}

/// An in-progress compound file transfer on this link.
#[derive(Debug)]
struct Transfer {
    staging_path: PathBuf,
    staging: File,
}

/// Decodes framed bytes into messages.
///
/// At most one read may be in flight per link, so a decoder is owned by a
/// single reader. Call [`extend`](Self::extend) with received bytes, then
/// [`decode`](Self::decode) until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecoderState,
    transfer: Option<Transfer>,
    temp_dir: PathBuf,
}

impl FrameDecoder {
    /// Creates a decoder staging transfer payloads under `temp_dir`.
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: DecoderState::ReadingOpcode,
            transfer: None,
            temp_dir: temp_dir.into(),
        }
    }

    /// Appends received bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns true if a partial frame or open compound is pending.
    ///
    /// A clean stream close while this is true is a truncation error.
    pub fn in_progress(&self) -> bool {
        !self.buffer.is_empty()
            || self.transfer.is_some()
            || !matches!(self.state, DecoderState::ReadingOpcode)
    }

    /// Attempts to decode one message from the buffered bytes.
    ///
    /// Returns `Ok(Some(message))` for a complete message, `Ok(None)` when
    /// more bytes are needed, and an error on a malformed frame. Errors are
    /// fatal to the link.
    pub fn decode(&mut self) -> WireResult<Option<Message>> {
        loop {
            match self.state {
                DecoderState::ReadingOpcode => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let opcode = Opcode::from_u8(self.buffer.get_u8())?;
                    self.state = DecoderState::ReadingLength { opcode };
                }
                DecoderState::ReadingLength { opcode } => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let length = self.buffer.get_u32_le() as usize;
                    self.state = DecoderState::ReadingBody { opcode, length };
                }
                DecoderState::ReadingBody { opcode, length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(length);
                    self.state = DecoderState::ReadingOpcode;

                    if let Some(message) = self.complete_frame(opcode, &body)? {
                        return Ok(Some(message));
                    }
                    // A compound frame was consumed; keep parsing.
                }
            }
        }
    }

    /// Handles one whole frame, tracking compound transfers.
    fn complete_frame(&mut self, opcode: Opcode, body: &[u8]) -> WireResult<Option<Message>> {
        if self.transfer.is_some() {
            return match opcode {
                Opcode::TransmitData => {
                    let transfer = self.transfer.as_mut().expect("transfer checked above");
                    transfer.staging.write_all(body)?;
                    Ok(None)
                }
                Opcode::Finished => {
                    let transfer = self.transfer.take().expect("transfer checked above");
                    transfer.staging.sync_all()?;
                    debug!(path = %transfer.staging_path.display(), "file transfer complete");
                    Ok(Some(Message::FileTransfer {
                        file_name: transfer.staging_path.to_string_lossy().into_owned(),
                    }))
                }
                other => Err(WireError::BadCompoundFrame(other)),
            };
        }

        if opcode.starts_compound() {
            self.transfer = Some(self.open_staging()?);
            return Ok(None);
        }

        Message::decode_body(opcode, body).map(Some)
    }

    /// Opens a fresh staging file for an incoming transfer.
    fn open_staging(&self) -> WireResult<Transfer> {
        fs::create_dir_all(&self.temp_dir)?;
        let id = TRANSFER_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        let staging_path = self.temp_dir.join(format!("transfer_{id}.data"));
        let staging = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging_path)?;
        Ok(Transfer {
            staging_path,
            staging,
        })
    }

    /// Returns the directory transfer payloads are staged under.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}
