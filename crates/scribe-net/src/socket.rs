//! Non-blocking socket adaptor.
//!
//! A [`NetSocket`] pairs a non-blocking TCP stream with an input queue, an
//! output queue, and a private readiness poll. Callers drive it with
//! `wait_readable` / `recv` and `wait_writable` / `send`; each queue drains
//! to `WouldBlock` so edge-triggered readiness never goes stale.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::{NetError, NetResult};

const SOCKET_TOKEN: Token = Token(0);
const READ_CHUNK: usize = 4096;
const MAX_EVENTS: usize = 8;

/// A non-blocking TCP stream with byte queues and a readiness poll.
///
/// Owned by exactly one reader and one writer; the per-direction
/// single-flight contract of the protocol is the caller's to keep.
#[derive(Debug)]
pub struct NetSocket {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    input: BytesMut,
    output: BytesMut,
    timeout: Duration,
}

impl NetSocket {
    /// Connects to the address, waiting up to `timeout` for completion.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> NetResult<Self> {
        let stream = TcpStream::connect(addr)?;
        let mut socket = Self::register(stream, timeout)?;
        socket.finish_connect()?;
        Ok(socket)
    }

    /// Wraps an accepted blocking stream.
    pub fn from_std(stream: std::net::TcpStream, timeout: Duration) -> NetResult<Self> {
        stream.set_nonblocking(true)?;
        Self::register(TcpStream::from_std(stream), timeout)
    }

    fn register(mut stream: TcpStream, timeout: Duration) -> NetResult<Self> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut stream,
            SOCKET_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            input: BytesMut::with_capacity(READ_CHUNK),
            output: BytesMut::with_capacity(READ_CHUNK),
            timeout,
        })
    }

    /// Completes a non-blocking connect.
    fn finish_connect(&mut self) -> NetResult<()> {
        self.wait(Interest::WRITABLE, "connect")?;
        if let Some(err) = self.stream.take_error()? {
            return Err(err.into());
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Blocks until the socket is ready for the given interest.
    ///
    /// Returns [`NetError::Expire`] once the poll timeout elapses.
    fn wait(&mut self, interest: Interest, operation: &'static str) -> NetResult<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return Err(NetError::Expire { operation });
            };

            match self.poll.poll(&mut self.events, Some(remaining)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            for event in self.events.iter() {
                if event.token() != SOCKET_TOKEN {
                    continue;
                }
                let ready = (interest.is_readable() && event.is_readable())
                    || (interest.is_writable() && event.is_writable())
                    || event.is_read_closed()
                    || event.is_write_closed()
                    || event.is_error();
                if ready {
                    return Ok(());
                }
            }
        }
    }

    /// Waits for read readiness.
    pub fn wait_readable(&mut self, operation: &'static str) -> NetResult<()> {
        self.wait(Interest::READABLE, operation)
    }

    /// Waits for write readiness.
    pub fn wait_writable(&mut self, operation: &'static str) -> NetResult<()> {
        self.wait(Interest::WRITABLE, operation)
    }

    /// Drains the socket into the input queue.
    ///
    /// Returns the number of bytes read (zero on a spurious wakeup).
    /// A clean close with nothing buffered is [`NetError::Closed`].
    pub fn recv(&mut self) -> NetResult<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if total == 0 {
                        return Err(NetError::Closed);
                    }
                    return Ok(total);
                }
                Ok(n) => {
                    self.input.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Flushes the output queue to the socket.
    ///
    /// Returns true once the queue is empty; false means the socket is not
    /// ready and the caller should wait for write readiness.
    pub fn send(&mut self) -> NetResult<bool> {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => {
                    return Err(NetError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    )));
                }
                Ok(n) => {
                    let _ = self.output.split_to(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// Takes everything currently in the input queue.
    pub fn take_input(&mut self) -> BytesMut {
        self.input.split()
    }

    /// The output queue, for encoders to append frames to.
    pub fn output_mut(&mut self) -> &mut BytesMut {
        &mut self.output
    }

    /// Returns true if unsent bytes remain queued.
    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Remote address of this socket.
    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}
