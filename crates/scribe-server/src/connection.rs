//! Client connection state for the server event loop.

use std::io::{self, Read, Write};
use std::path::Path;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};
use scribe_wire::{FrameDecoder, FrameEncoder, Message, Role};

use crate::ServerResult;

/// One accepted client connection.
pub struct Connection {
    pub token: Token,
    pub stream: TcpStream,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    write_buf: BytesMut,
    read_buffer_size: usize,
    /// Drop the connection as soon as possible.
    pub closing: bool,
    /// Finish flushing replies, then close.
    pub close_after_flush: bool,
    peer: String,
}

impl Connection {
    /// Wraps an accepted stream.
    pub fn new(token: Token, stream: TcpStream, temp_dir: &Path, read_buffer_size: usize) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            token,
            stream,
            decoder: FrameDecoder::new(temp_dir),
            encoder: FrameEncoder::new(Role::Server),
            write_buf: BytesMut::with_capacity(read_buffer_size),
            read_buffer_size,
            closing: false,
            close_after_flush: false,
            peer,
        }
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Reads available bytes into the frame decoder.
    ///
    /// Returns `true` while the connection is open.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut chunk = vec![0u8; self.read_buffer_size];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Flushes queued replies. Returns `true` once everything is written.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Attempts to decode the next whole request.
    pub fn try_decode(&mut self) -> ServerResult<Option<Message>> {
        Ok(self.decoder.decode()?)
    }

    /// Queues a reply for sending.
    pub fn queue_reply(&mut self, message: &Message) -> ServerResult<()> {
        self.encoder.encode(message, &mut self.write_buf)?;
        Ok(())
    }

    /// Current interest set for poll registration.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Returns true once this connection can be dropped.
    pub fn done(&self) -> bool {
        self.closing || (self.close_after_flush && self.write_buf.is_empty())
    }
}
