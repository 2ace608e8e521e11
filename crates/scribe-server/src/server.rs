//! The server event loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatch::{Dispatcher, Disposition};
use crate::files::FileStore;
use crate::{ServerError, ServerResult};

/// Token for the listener socket.
const LISTENER_TOKEN: Token = Token(0);

/// Maximum events per poll iteration.
const MAX_EVENTS: usize = 1024;

/// Poll-based TCP server for the file service.
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    dispatcher: Dispatcher,
    next_token: usize,
}

impl Server {
    /// Binds the listener and opens the served root.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let files = FileStore::open(&config.root_dir)?;

        let poll = Poll::new()?;
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let mut listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            port: config.port,
            source,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(port = config.port, root = %files.root().display(), "server listening");

        Ok(Self {
            config,
            poll,
            listener,
            connections: HashMap::new(),
            dispatcher: Dispatcher::new(files),
            next_token: 1,
        })
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the event loop until `running` goes false.
    pub fn run(&mut self, running: &AtomicBool) -> ServerResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while running.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, Some(self.config.poll_interval)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for event in &events {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections()?,
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                        self.update_interest(token);
                    }
                }
            }

            self.cleanup_done();
        }

        info!("server stopped");
        Ok(())
    }

    fn accept_connections(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;

                    let conn = Connection::new(
                        token,
                        stream,
                        &self.config.temp_dir,
                        self.config.read_buffer_size,
                    );
                    self.connections.insert(token, conn);
                    debug!(%addr, ?token, "accepted connection");
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(error = %err, "accept failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        match conn.read() {
            Ok(true) => self.process_requests(token),
            Ok(false) => {
                debug!(?token, "connection closed by client");
                conn.closing = true;
            }
            Err(err) => {
                warn!(?token, error = %err, "read failed");
                conn.closing = true;
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        if let Err(err) = conn.write() {
            warn!(?token, error = %err, "write failed");
            conn.closing = true;
        }
    }

    /// Decodes and answers every complete request on a connection.
    fn process_requests(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            if conn.close_after_flush || conn.closing {
                return;
            }

            match conn.try_decode() {
                Ok(Some(request)) => {
                    let peer = conn.peer().to_string();
                    let (reply, disposition) = self.dispatcher.handle(request, &peer);

                    let Some(conn) = self.connections.get_mut(&token) else {
                        return;
                    };
                    if let Err(err) = conn.queue_reply(&reply) {
                        error!(?token, error = %err, "failed to encode reply");
                        conn.closing = true;
                        return;
                    }
                    if disposition == Disposition::Close {
                        conn.close_after_flush = true;
                    }
                    // Opportunistic flush; leftovers wait for writability.
                    let _ = conn.write();
                }
                Ok(None) => return,
                Err(err) => {
                    // Framing errors are fatal to the link; answer with the
                    // reason and stop reading.
                    warn!(?token, error = %err, "bad frame from client");
                    let _ = conn.queue_reply(&scribe_wire::Message::Error {
                        message: err.to_string(),
                    });
                    conn.close_after_flush = true;
                    let _ = conn.write();
                    return;
                }
            }
        }
    }

    fn update_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let interest = conn.interest();
        if let Err(err) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, interest)
        {
            warn!(?token, error = %err, "reregister failed");
            conn.closing = true;
        }
    }

    fn cleanup_done(&mut self) {
        let done: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.done())
            .map(|(&token, _)| token)
            .collect();

        for token in done {
            if let Some(mut conn) = self.connections.remove(&token) {
                debug!(?token, "closing connection");
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use scribe_net::{MessageStream, NetSocket};
    use scribe_wire::{Message, Role};

    /// Starts a server over a seeded root and returns a connected client.
    fn start_server(
        files: &[(&str, &str)],
    ) -> (tempfile::TempDir, Arc<AtomicBool>, thread::JoinHandle<()>, MessageStream) {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, content) in files {
            fs::write(dir.path().join(name), content).expect("seed");
        }

        let config = ServerConfig::new(0, dir.path()).with_temp_dir(dir.path().join("tmp"));
        let mut server = Server::new(config).expect("server");
        let addr = server.local_addr().expect("addr");

        let running = Arc::new(AtomicBool::new(true));
        let server_running = Arc::clone(&running);
        let handle = thread::spawn(move || {
            server.run(&server_running).expect("server run");
        });

        let addr: std::net::SocketAddr = ([127, 0, 0, 1], addr.port()).into();
        let socket =
            NetSocket::connect(addr, Duration::from_secs(5)).expect("connect");
        let stream = MessageStream::new(socket, Role::Client, std::env::temp_dir());
        (dir, running, handle, stream)
    }

    fn stop(running: &AtomicBool, handle: thread::JoinHandle<()>) {
        running.store(false, Ordering::SeqCst);
        handle.join().expect("server thread");
    }

    #[test]
    fn enquiry_read_write_cycle() {
        let (dir, running, handle, mut client) =
            start_server(&[("a.txt", "x\ny\n"), (".hidden", "z")]);

        client.write_message(&Message::Enquiry).expect("send");
        let Message::Response { text } = client.read_message().expect("recv") else {
            panic!("expected Response");
        };
        assert_eq!(text, "a.txt");

        client
            .write_message(&Message::Read {
                file_name: "a.txt".to_string(),
            })
            .expect("send");
        assert_eq!(
            client.read_message().expect("recv"),
            Message::Response {
                text: "y".to_string()
            }
        );

        client
            .write_message(&Message::Write {
                file_name: "a.txt".to_string(),
                line: "(1, 5)".to_string(),
            })
            .expect("send");
        assert_eq!(client.read_message().expect("recv"), Message::Ok);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).expect("read"),
            "x\ny\n(1, 5)\n"
        );

        stop(&running, handle);
    }

    #[test]
    fn traversal_is_rejected_then_closed() {
        let (_dir, running, handle, mut client) = start_server(&[("a.txt", "x")]);

        client
            .write_message(&Message::Read {
                file_name: "../etc/passwd".to_string(),
            })
            .expect("send");
        assert_eq!(
            client.read_message().expect("recv"),
            Message::Error {
                message: "Invalid file access".to_string()
            }
        );

        // The server closes after the error reply.
        assert!(client.read_message().is_err());

        stop(&running, handle);
    }

    #[test]
    fn invalid_opcode_is_rejected_then_closed() {
        let (_dir, running, handle, mut client) = start_server(&[("a.txt", "x")]);

        client
            .write_message(&Message::Reply {
                timestamp: 1,
                file_name: "a.txt".to_string(),
            })
            .expect("send");
        assert_eq!(
            client.read_message().expect("recv"),
            Message::Error {
                message: "Invalid opcode".to_string()
            }
        );
        assert!(client.read_message().is_err());

        stop(&running, handle);
    }
}
