//! Full-mesh peer network bring-up.
//!
//! Every node holds one inbound and one outbound connection to each peer
//! (2N(N−1) one-directional connections across the cluster). The outbound
//! side dials and initiates the handshake, retrying on a timed backoff;
//! the inbound side is accepted only from allow-listed peer addresses and
//! runs the responder handshake. [`PeerNetwork::establish`] returns once
//! both directions are up for every peer.
//!
//! There is no recovery: any bring-up failure aborts the whole mesh.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, TcpListener};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use scribe_wire::{NodeId, Role};
use tracing::{debug, info, warn};

use crate::handshake;
use crate::location::{local_address, Location};
use crate::socket::NetSocket;
use crate::stream::MessageStream;
use crate::{NetError, NetResult};

/// Connect attempts per peer before the bring-up is declared failed.
pub const MAX_CONNECT_ATTEMPTS: usize = 10;

/// Configuration for bringing up the peer mesh.
#[derive(Debug, Clone)]
pub struct PeerNetworkConfig {
    /// This node's ID.
    pub id: NodeId,
    /// Port this node listens on for inbound peer connections.
    pub port: u16,
    /// The other peers (self already filtered out).
    pub peers: Vec<Location>,
    /// Shared handshake secret.
    pub password: String,
    /// Socket readiness-poll timeout.
    pub poll_timeout: Duration,
    /// Backoff between connect attempts.
    pub retry_timeout: Duration,
    /// Staging directory for received file transfers.
    pub temp_dir: PathBuf,
}

impl PeerNetworkConfig {
    /// Resolves a comma-separated `host[:port]` peer list, defaulting
    /// omitted ports to this node's own port and filtering out entries
    /// that name this node itself (`localhost` or the local address).
    pub fn resolve_peers(entries: &str, my_port: u16) -> NetResult<Vec<Location>> {
        let localhost = Location::resolve("localhost", my_port)?;
        let my_address = local_address().map(|addr| Location::new(addr, my_port));

        let mut peers = Vec::new();
        for entry in entries.split(',') {
            let target = Location::parse(entry, Some(my_port))?;
            if target == localhost || my_address.as_ref() == Some(&target) {
                debug!(%target, "skipping self in peer list");
                continue;
            }
            peers.push(target);
        }
        Ok(peers)
    }
}

/// The two connections this node holds to one peer.
#[derive(Debug)]
pub struct PeerLink {
    /// The peer's node ID, learned during the handshake.
    pub id: NodeId,
    /// The peer's dialed location.
    pub location: Location,
    /// Connection the peer originated; this node only reads it.
    pub inbound: MessageStream,
    /// Connection this node originated; this node only writes it.
    pub outbound: MessageStream,
}

/// One bring-up step finishing, reported to the rendezvous loop.
enum MeshEvent {
    Inbound { id: NodeId, stream: MessageStream },
    Outbound {
        id: NodeId,
        location: Location,
        stream: MessageStream,
    },
    Failed(NetError),
}

/// Shared stop flag with a condvar so backoff sleeps wake on shutdown.
#[derive(Debug, Default)]
struct ShutdownSignal {
    triggered: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    fn trigger(&self) {
        *self.triggered.lock().expect("shutdown lock") = true;
        self.condvar.notify_all();
    }

    fn is_triggered(&self) -> bool {
        *self.triggered.lock().expect("shutdown lock")
    }

    /// Sleeps up to `timeout`; returns true if shutdown was triggered.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.triggered.lock().expect("shutdown lock");
        let (guard, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .expect("shutdown wait");
        *guard
    }
}

/// Brings up the full peer mesh.
pub struct PeerNetwork;

impl PeerNetwork {
    /// Connects to every peer and accepts a connection from every peer,
    /// returning once the mesh is complete.
    ///
    /// Any accept, connect (after [`MAX_CONNECT_ATTEMPTS`]), or handshake
    /// failure fails the whole bring-up.
    pub fn establish(config: PeerNetworkConfig) -> NetResult<Vec<PeerLink>> {
        if config.peers.is_empty() {
            return Ok(Vec::new());
        }

        info!(port = config.port, peers = config.peers.len(), "starting peer network");
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;

        let shutdown = Arc::new(ShutdownSignal::default());
        let (event_tx, event_rx) = mpsc::channel();

        let allowed: HashSet<Location> =
            config.peers.iter().map(Location::any_port).collect();
        spawn_acceptor(listener, allowed, config.clone(), event_tx.clone(), Arc::clone(&shutdown));

        for location in config.peers.clone() {
            spawn_connector(location, config.clone(), event_tx.clone(), Arc::clone(&shutdown));
        }
        drop(event_tx);

        let expected = config.peers.len();
        let mut inbound: HashMap<NodeId, MessageStream> = HashMap::new();
        let mut outbound: HashMap<NodeId, (Location, MessageStream)> = HashMap::new();

        while inbound.len() < expected || outbound.len() < expected {
            match event_rx.recv() {
                Ok(MeshEvent::Inbound { id, stream }) => {
                    debug!(peer = %id, "inbound connection verified");
                    inbound.insert(id, stream);
                }
                Ok(MeshEvent::Outbound {
                    id,
                    location,
                    stream,
                }) => {
                    debug!(peer = %id, %location, "outbound connection verified");
                    outbound.insert(id, (location, stream));
                }
                Ok(MeshEvent::Failed(err)) => {
                    shutdown.trigger();
                    return Err(err);
                }
                Err(_) => {
                    shutdown.trigger();
                    return Err(NetError::Shutdown);
                }
            }
        }

        let mut links = Vec::with_capacity(expected);
        for (id, (location, out_stream)) in outbound {
            let in_stream = inbound.remove(&id).ok_or_else(|| NetError::HandshakeRejected {
                reason: format!("peer {id} never connected back"),
            })?;
            links.push(PeerLink {
                id,
                location,
                inbound: in_stream,
                outbound: out_stream,
            });
        }
        links.sort_by_key(|link| link.id);

        info!(peers = links.len(), "peer network connected");
        Ok(links)
    }
}

/// Accepts inbound peer connections and runs responder handshakes.
fn spawn_acceptor(
    listener: TcpListener,
    allowed: HashSet<Location>,
    config: PeerNetworkConfig,
    event_tx: Sender<MeshEvent>,
    shutdown: Arc<ShutdownSignal>,
) {
    // One handshake at a time per source address; re-accepts while one is
    // in progress are ignored.
    let pending: Arc<Mutex<HashSet<IpAddr>>> = Arc::new(Mutex::new(HashSet::new()));

    let builder = thread::Builder::new().name("peer-accept".to_string());
    builder
        .spawn(move || {
            for accepted in listener.incoming() {
                if shutdown.is_triggered() {
                    return;
                }

                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = event_tx.send(MeshEvent::Failed(err.into()));
                        return;
                    }
                };
                let Ok(source) = stream.peer_addr() else {
                    continue;
                };
                let location = Location::from_addr(source);

                if !allowed.contains(&location) {
                    debug!(%location, "rejecting connection from unknown address");
                    continue;
                }
                if !pending.lock().expect("pending lock").insert(location.addr()) {
                    debug!(%location, "handshake already in progress; ignoring re-accept");
                    continue;
                }

                let config = config.clone();
                let event_tx = event_tx.clone();
                let pending = Arc::clone(&pending);
                let builder = thread::Builder::new().name("peer-handshake".to_string());
                builder
                    .spawn(move || {
                        let result = respond_to_peer(stream, &config);
                        pending.lock().expect("pending lock").remove(&location.addr());
                        let event = match result {
                            Ok((id, stream)) => MeshEvent::Inbound { id, stream },
                            Err(err) => MeshEvent::Failed(err),
                        };
                        let _ = event_tx.send(event);
                    })
                    .expect("spawn peer-handshake thread");
            }
        })
        .expect("spawn peer-accept thread");
}

fn respond_to_peer(
    stream: std::net::TcpStream,
    config: &PeerNetworkConfig,
) -> NetResult<(NodeId, MessageStream)> {
    let socket = NetSocket::from_std(stream, config.poll_timeout)?;
    let mut stream = MessageStream::new(socket, Role::Client, &config.temp_dir);
    let id = handshake::respond(&mut stream, config.id, &config.password)?;
    Ok((id, stream))
}

/// Dials one peer with retry, then runs the initiator handshake.
fn spawn_connector(
    location: Location,
    config: PeerNetworkConfig,
    event_tx: Sender<MeshEvent>,
    shutdown: Arc<ShutdownSignal>,
) {
    let builder = thread::Builder::new().name(format!("peer-connect-{location}"));
    builder
        .spawn(move || {
            let mut attempts = 0;
            let socket = loop {
                if shutdown.is_triggered() {
                    return;
                }
                attempts += 1;
                match NetSocket::connect(location.socket_addr(), config.poll_timeout) {
                    Ok(socket) => break socket,
                    Err(err) if attempts < MAX_CONNECT_ATTEMPTS => {
                        warn!(%location, attempt = attempts, error = %err, "connect failed; retrying");
                        if shutdown.wait_timeout(config.retry_timeout) {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = event_tx.send(MeshEvent::Failed(NetError::ConnectFailed {
                            location,
                            attempts,
                        }));
                        return;
                    }
                }
            };

            let mut stream = MessageStream::new(socket, Role::Client, &config.temp_dir);
            let event = match handshake::initiate(&mut stream, config.id, &config.password) {
                Ok(id) => MeshEvent::Outbound {
                    id,
                    location,
                    stream,
                },
                Err(err) => MeshEvent::Failed(err),
            };
            let _ = event_tx.send(event);
        })
        .expect("spawn peer-connect thread");
}
