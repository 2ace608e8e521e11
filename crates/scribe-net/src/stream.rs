//! Framed message I/O over a [`NetSocket`].

use std::net::SocketAddr;
use std::path::PathBuf;

use scribe_wire::{FrameDecoder, FrameEncoder, Message, Role, WireError};
use tracing::trace;

use crate::socket::NetSocket;
use crate::{NetError, NetResult};

/// Reads and writes whole messages on one stream.
///
/// At most one read and one write may be in flight per link; a
/// `MessageStream` enforces that naturally by taking `&mut self`.
#[derive(Debug)]
pub struct MessageStream {
    socket: NetSocket,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
}

impl MessageStream {
    /// Wraps a socket with framing for the given role.
    ///
    /// `temp_dir` is where incoming file-transfer payloads are staged.
    pub fn new(socket: NetSocket, role: Role, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket,
            decoder: FrameDecoder::new(temp_dir),
            encoder: FrameEncoder::new(role),
        }
    }

    /// Reads the next whole message, suspending on readiness waits.
    ///
    /// A compound file transfer is consumed entirely and delivered as one
    /// message. A clean close mid-frame is a truncation error; a clean
    /// close between frames is [`NetError::Closed`].
    pub fn read_message(&mut self) -> NetResult<Message> {
        loop {
            let pending = self.socket.take_input();
            if !pending.is_empty() {
                self.decoder.extend(&pending);
            }
            if let Some(message) = self.decoder.decode()? {
                trace!(opcode = ?message.opcode(), "received message");
                return Ok(message);
            }

            self.socket.wait_readable("message read")?;
            match self.socket.recv() {
                Ok(_) => {}
                Err(NetError::Closed) if self.decoder.in_progress() => {
                    return Err(NetError::Wire(WireError::Truncated));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes one whole message and flushes it.
    pub fn write_message(&mut self, message: &Message) -> NetResult<()> {
        trace!(opcode = ?message.opcode(), "sending message");
        self.encoder.encode(message, self.socket.output_mut())?;
        self.flush()
    }

    /// Flushes any queued output bytes.
    pub fn flush(&mut self) -> NetResult<()> {
        while !self.socket.send()? {
            self.socket.wait_writable("message write")?;
        }
        Ok(())
    }

    /// Remote address of the underlying socket.
    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        self.socket.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    use scribe_wire::NodeId;

    fn stream_pair() -> (MessageStream, MessageStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let timeout = Duration::from_secs(5);

        let connecting = NetSocket::connect(addr, timeout).expect("connect");
        let (accepted, _) = listener.accept().expect("accept");
        let accepted = NetSocket::from_std(accepted, timeout).expect("wrap");

        let dir = std::env::temp_dir();
        (
            MessageStream::new(connecting, Role::Client, &dir),
            MessageStream::new(accepted, Role::Server, &dir),
        )
    }

    #[test]
    fn message_roundtrip_over_tcp() {
        let (mut client, mut server) = stream_pair();

        client
            .write_message(&Message::Request {
                timestamp: 9,
                file_name: "f.txt".to_string(),
            })
            .expect("write");

        let received = server.read_message().expect("read");
        assert_eq!(
            received,
            Message::Request {
                timestamp: 9,
                file_name: "f.txt".to_string(),
            }
        );
    }

    #[test]
    fn several_messages_keep_order() {
        let (mut client, mut server) = stream_pair();

        for timestamp in 0..5u64 {
            client
                .write_message(&Message::Reply {
                    timestamp,
                    file_name: "f".to_string(),
                })
                .expect("write");
        }
        for timestamp in 0..5u64 {
            let message = server.read_message().expect("read");
            assert_eq!(
                message,
                Message::Reply {
                    timestamp,
                    file_name: "f".to_string(),
                }
            );
        }
    }

    #[test]
    fn close_between_frames_reports_closed() {
        let (client, mut server) = stream_pair();
        drop(client);
        assert!(matches!(server.read_message(), Err(NetError::Closed)));
    }

    #[test]
    fn handshake_shaped_exchange() {
        let (mut client, mut server) = stream_pair();

        client
            .write_message(&Message::EstablishConnection {
                id: NodeId::new(1),
                text: "pw".to_string(),
            })
            .expect("write");

        let Message::EstablishConnection { id, text } = server.read_message().expect("read")
        else {
            panic!("wrong message");
        };
        assert_eq!(id, NodeId::new(1));
        assert_eq!(text, "pw");
    }
}
