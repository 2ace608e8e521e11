//! The workload driver state machine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scribe_mutex::{Held, LockService};
use scribe_net::{Location, MessageStream, NetSocket};
use scribe_wire::{Message, NodeId, Role};
use tracing::{debug, error, info};

use crate::{ClientError, ClientResult};

/// Configuration for the client role.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This node's ID; written into every appended line.
    pub id: NodeId,
    /// Every server replica to issue Enquiry / Read / Write against.
    pub servers: Vec<Location>,
    /// Socket readiness-poll timeout.
    pub poll_timeout: Duration,
    /// Staging directory for received file transfers.
    pub temp_dir: PathBuf,
    /// Wait-state sleep bounds in milliseconds, inclusive.
    pub wait_ms: (u64, u64),
    /// Stop cleanly after this many completed operations. Useful for
    /// tests; production runs leave it unset.
    pub op_limit: Option<u64>,
}

impl ClientConfig {
    /// Creates a configuration with the production wait range.
    pub fn new(id: NodeId, servers: Vec<Location>) -> Self {
        Self {
            id,
            servers,
            poll_timeout: Duration::from_millis(60_000),
            temp_dir: PathBuf::from(".proj2_temp"),
            wait_ms: (500, 5000),
            op_limit: None,
        }
    }
}

/// One connected server replica.
struct ServerConnection {
    location: Location,
    stream: MessageStream,
}

/// Driver states; the successor of each step is data, not control flow.
enum DriverState {
    ConnectToServers,
    SendEnquiry,
    ReceiveEnquiryResponse,
    Wait,
    SendRead,
    ReceiveReadResponse { held: Held },
    SendWrite,
    ReceiveWriteResponse { held: Held },
    Stop,
}

/// The client workload driver.
pub struct Driver {
    config: ClientConfig,
    lock: LockService,
    running: Arc<AtomicBool>,
    servers: Vec<ServerConnection>,
    file_names: Vec<String>,
    current_server: usize,
    current_file: usize,
    completed_ops: u64,
    rng: StdRng,
}

impl Driver {
    /// Creates a driver over an already-started lock service.
    pub fn new(config: ClientConfig, lock: LockService, running: Arc<AtomicBool>) -> Self {
        Self {
            config,
            lock,
            running,
            servers: Vec::new(),
            file_names: Vec::new(),
            current_server: 0,
            current_file: 0,
            completed_ops: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Runs the workload until `Stop`.
    ///
    /// Returns `Ok(())` on a clean stop (shutdown signal, op limit, or a
    /// server-reported error) and `Err` on a protocol or transport
    /// failure.
    pub fn run(mut self) -> ClientResult<()> {
        let mut state = DriverState::ConnectToServers;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                state = DriverState::Stop;
            }

            state = match state {
                DriverState::ConnectToServers => self.connect_to_servers()?,
                DriverState::SendEnquiry => self.send_enquiry()?,
                DriverState::ReceiveEnquiryResponse => self.receive_enquiry_response()?,
                DriverState::Wait => self.wait(),
                DriverState::SendRead => self.send_read()?,
                DriverState::ReceiveReadResponse { held } => {
                    self.receive_read_response(held)?
                }
                DriverState::SendWrite => self.send_write()?,
                DriverState::ReceiveWriteResponse { held } => {
                    self.receive_write_response(held)?
                }
                DriverState::Stop => {
                    info!("client stopping");
                    return Ok(());
                }
            };
        }
    }

    fn connect_to_servers(&mut self) -> ClientResult<DriverState> {
        if self.config.servers.is_empty() {
            return Err(ClientError::EmptyList);
        }

        for location in self.config.servers.clone() {
            info!(%location, "connecting to server");
            let socket = NetSocket::connect(location.socket_addr(), self.config.poll_timeout)?;
            let stream = MessageStream::new(socket, Role::Client, &self.config.temp_dir);
            info!(%location, "connected to server");
            self.servers.push(ServerConnection { location, stream });
        }
        Ok(DriverState::SendEnquiry)
    }

    fn send_enquiry(&mut self) -> ClientResult<DriverState> {
        self.change_server()?;
        info!("fetching file names");
        self.current_stream().write_message(&Message::Enquiry)?;
        Ok(DriverState::ReceiveEnquiryResponse)
    }

    fn receive_enquiry_response(&mut self) -> ClientResult<DriverState> {
        match self.current_stream().read_message()? {
            Message::Response { text } => {
                self.file_names = parse_file_names(&text);
                if self.file_names.is_empty() {
                    return Err(ClientError::NoFiles);
                }
                debug!(count = self.file_names.len(), "received file names");
                Ok(DriverState::Wait)
            }
            Message::Error { message } => {
                error!(%message, "error from server");
                Ok(DriverState::Stop)
            }
            other => Err(ClientError::UnexpectedMessage {
                expected: "Response",
                got: other.opcode(),
            }),
        }
    }

    fn wait(&mut self) -> DriverState {
        let (low, high) = self.config.wait_ms;
        let sleep_ms = self.rng.random_range(low..=high);
        thread::sleep(Duration::from_millis(sleep_ms));

        if let Some(limit) = self.config.op_limit {
            if self.completed_ops >= limit {
                return DriverState::Stop;
            }
        }

        let next = if self.rng.random_bool(0.5) {
            DriverState::SendWrite
        } else {
            DriverState::SendRead
        };

        if let Err(err) = self.change_server().and_then(|()| self.change_file()) {
            error!(error = %err, "cannot pick the next target");
            return DriverState::Stop;
        }
        next
    }

    fn send_read(&mut self) -> ClientResult<DriverState> {
        let file_name = self.current_file().to_string();
        debug!(file = %file_name, "beginning mutually exclusive read");

        let held = self.lock.acquire(&file_name)?;
        self.current_stream()
            .write_message(&Message::Read { file_name })?;
        Ok(DriverState::ReceiveReadResponse { held })
    }

    fn receive_read_response(&mut self, held: Held) -> ClientResult<DriverState> {
        match self.current_stream().read_message()? {
            Message::Response { text } => {
                info!(file = %held.file_name(), last_line = %text, "read last line");
                held.release()?;
                self.completed_ops += 1;
                Ok(DriverState::Wait)
            }
            Message::Error { message } => {
                error!(%message, "error from server on read");
                Ok(DriverState::Stop)
            }
            other => Err(ClientError::UnexpectedMessage {
                expected: "Response",
                got: other.opcode(),
            }),
        }
    }

    fn send_write(&mut self) -> ClientResult<DriverState> {
        let file_name = self.current_file().to_string();
        debug!(file = %file_name, "beginning mutually exclusive write");

        let held = self.lock.acquire(&file_name)?;
        let line = write_line(self.config.id, self.lock.timestamp());
        info!(file = %file_name, %line, "appending");

        // Fan out to every replica. A failed send leaves the replicas
        // inconsistent for this filename, so the lock is not released;
        // the error takes the whole node down.
        for server in &mut self.servers {
            server.stream.write_message(&Message::Write {
                file_name: file_name.clone(),
                line: line.clone(),
            })?;
        }
        Ok(DriverState::ReceiveWriteResponse { held })
    }

    fn receive_write_response(&mut self, held: Held) -> ClientResult<DriverState> {
        for server in &mut self.servers {
            match server.stream.read_message()? {
                Message::Ok => {}
                Message::Error { message } => {
                    error!(server = %server.location, %message, "error from server on write");
                    return Ok(DriverState::Stop);
                }
                other => {
                    return Err(ClientError::UnexpectedMessage {
                        expected: "Ok",
                        got: other.opcode(),
                    });
                }
            }
        }

        held.release()?;
        self.completed_ops += 1;
        Ok(DriverState::Wait)
    }

    /// Picks a new uniformly random target server.
    fn change_server(&mut self) -> ClientResult<()> {
        self.current_server = pick_index(&mut self.rng, self.servers.len())?;
        Ok(())
    }

    /// Picks a new uniformly random target filename.
    fn change_file(&mut self) -> ClientResult<()> {
        self.current_file = pick_index(&mut self.rng, self.file_names.len())?;
        Ok(())
    }

    fn current_stream(&mut self) -> &mut MessageStream {
        &mut self.servers[self.current_server].stream
    }

    fn current_file(&self) -> &str {
        &self.file_names[self.current_file]
    }
}

/// Uniform random index into a list; empty lists fail.
fn pick_index(rng: &mut StdRng, len: usize) -> ClientResult<usize> {
    if len == 0 {
        return Err(ClientError::EmptyList);
    }
    Ok(rng.random_range(0..len))
}

/// The line appended on a write: `(id, T)` with the engine's clock.
fn write_line(id: NodeId, timestamp: u64) -> String {
    format!("({}, {})", id.as_u8(), timestamp)
}

/// Splits a comma-separated enquiry response into trimmed names.
fn parse_file_names(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    use scribe_server::{Server, ServerConfig};

    #[test]
    fn write_line_format() {
        assert_eq!(write_line(NodeId::new(1), 7), "(1, 7)");
        assert_eq!(write_line(NodeId::new(12), 10_000), "(12, 10000)");
    }

    #[test]
    fn parse_file_names_trims_and_drops_empties() {
        assert_eq!(
            parse_file_names("a.txt, b.txt,c.txt"),
            vec!["a.txt".to_string(), "b.txt".to_string(), "c.txt".to_string()]
        );
        assert!(parse_file_names("").is_empty());
        assert!(parse_file_names(" , ").is_empty());
    }

    #[test]
    fn picking_from_an_empty_list_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            pick_index(&mut rng, 0),
            Err(ClientError::EmptyList)
        ));
    }

    #[test]
    fn picks_are_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(pick_index(&mut rng, 3).expect("pick") < 3);
        }
    }

    /// Single-node cluster: one server, no peers, a handful of random
    /// operations end to end.
    #[test]
    fn single_node_workload_runs_to_its_op_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), "seed\n").expect("seed");
        fs::write(dir.path().join("b.txt"), "start\n").expect("seed");

        let server_config =
            ServerConfig::new(0, dir.path()).with_temp_dir(dir.path().join("tmp"));
        let mut server = Server::new(server_config).expect("server");
        let addr = server.local_addr().expect("addr");

        let running = Arc::new(AtomicBool::new(true));
        let server_running = Arc::clone(&running);
        let server_thread = thread::spawn(move || {
            server.run(&server_running).expect("server run");
        });

        let mut config = ClientConfig::new(
            NodeId::new(1),
            vec![Location::resolve("127.0.0.1", addr.port()).expect("resolve")],
        );
        config.poll_timeout = Duration::from_secs(5);
        config.temp_dir = dir.path().join("tmp");
        config.wait_ms = (1, 5);
        config.op_limit = Some(4);

        // No peers: the critical section is always immediately available.
        let lock = LockService::start(NodeId::new(1), Vec::new());
        let driver = Driver::new(config, lock, Arc::clone(&running));
        driver.run().expect("workload");

        running.store(false, Ordering::SeqCst);
        server_thread.join().expect("server thread");

        // Any writes that happened appended "(1, T)" lines.
        for name in ["a.txt", "b.txt"] {
            let content = fs::read_to_string(dir.path().join(name)).expect("read");
            for line in content.lines().skip(1) {
                assert!(
                    line.starts_with("(1, ") && line.ends_with(')'),
                    "unexpected appended line {line:?} in {name}"
                );
            }
        }
    }
}
