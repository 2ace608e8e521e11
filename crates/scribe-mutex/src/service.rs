//! The lock service: the engine wired to real peer links.
//!
//! One reader thread per peer link feeds `Request` / `Reply` messages into
//! the engine; one writer thread per link drains an mpsc channel to the
//! outbound connection. The engine lock guards only state transitions;
//! actions (sends, waking the acquirer) happen after it is dropped.
//!
//! Any link error marks the whole service failed: pending and future
//! `acquire` calls return [`MutexError::Failed`] and the node is expected
//! to shut down. Recovery is not implemented.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use scribe_net::PeerLink;
use scribe_wire::{Message, NodeId};
use tracing::{debug, error, info};

use crate::engine::{Action, Engine, MutexState};
use crate::{MutexError, MutexResult};

struct EngineSlot {
    engine: Engine,
    failed: Option<String>,
}

struct Shared {
    slot: Mutex<EngineSlot>,
    entered: Condvar,
    senders: HashMap<NodeId, Sender<Message>>,
}

impl Shared {
    /// Runs one engine input under the lock, then performs its actions.
    fn handle(&self, input: impl FnOnce(&mut Engine) -> Vec<Action>) {
        let actions = {
            let mut slot = self.slot.lock().expect("engine lock");
            if slot.failed.is_some() {
                return;
            }
            input(&mut slot.engine)
        };
        self.perform(actions);
    }

    fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, message } => {
                    let delivered = self
                        .senders
                        .get(&to)
                        .is_some_and(|sender| sender.send(message).is_ok());
                    if !delivered {
                        self.fail(format!("writer for peer {to} is gone"));
                        return;
                    }
                }
                Action::Enter => self.entered.notify_all(),
            }
        }
    }

    fn fail(&self, reason: String) {
        {
            let mut slot = self.slot.lock().expect("engine lock");
            if slot.failed.is_none() {
                error!(reason = %reason, "mutual exclusion service failed");
                slot.failed = Some(reason);
            }
        }
        self.entered.notify_all();
    }
}

/// Distributed lock service over the peer mesh.
///
/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct LockService {
    shared: Arc<Shared>,
}

/// A held critical section for one filename.
///
/// Release is explicit: dropping a `Held` without calling
/// [`release`](Held::release) leaves the lock held, which matches the
/// fatal-error policy (a node that bails mid-section must not hand the
/// filename to anyone else).
#[must_use = "the critical section stays held until release() is called"]
pub struct Held {
    shared: Arc<Shared>,
    file_name: String,
    timestamp: u64,
}

impl LockService {
    /// Wires the engine to the peer links and starts the link threads.
    pub fn start(id: NodeId, links: Vec<PeerLink>) -> Self {
        let engine = Engine::new(id, links.iter().map(|link| link.id));

        let mut senders = HashMap::new();
        let mut link_parts = Vec::with_capacity(links.len());
        for link in links {
            let (tx, rx) = mpsc::channel::<Message>();
            senders.insert(link.id, tx);
            link_parts.push((link.id, link.inbound, link.outbound, rx));
        }

        let shared = Arc::new(Shared {
            slot: Mutex::new(EngineSlot {
                engine,
                failed: None,
            }),
            entered: Condvar::new(),
            senders,
        });

        for (peer, mut inbound, mut outbound, rx) in link_parts {
            let writer_shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("mutex-write-{peer}"))
                .spawn(move || {
                    while let Ok(message) = rx.recv() {
                        if let Err(err) = outbound.write_message(&message) {
                            writer_shared.fail(format!("send to peer {peer} failed: {err}"));
                            return;
                        }
                    }
                })
                .expect("spawn mutex writer thread");

            let reader_shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("mutex-read-{peer}"))
                .spawn(move || loop {
                    match inbound.read_message() {
                        Ok(Message::Request {
                            timestamp,
                            file_name,
                        }) => reader_shared
                            .handle(|engine| engine.on_request(peer, timestamp, &file_name)),
                        Ok(Message::Reply {
                            timestamp,
                            file_name,
                        }) => reader_shared
                            .handle(|engine| engine.on_reply(peer, timestamp, &file_name)),
                        Ok(Message::Error { message }) => {
                            reader_shared.fail(format!("peer {peer} reported: {message}"));
                            return;
                        }
                        Ok(other) => {
                            // Stray opcodes on a peer link are ignored.
                            debug!(peer = %peer, opcode = ?other.opcode(), "ignoring message");
                        }
                        Err(err) => {
                            reader_shared.fail(format!("peer link {peer} failed: {err}"));
                            return;
                        }
                    }
                })
                .expect("spawn mutex reader thread");
        }

        info!(node = %id, "mutual exclusion service started");
        Self { shared }
    }

    /// Enters the critical section for `file_name`, blocking until every
    /// peer's permission is held.
    ///
    /// Fails immediately with [`MutexError::AlreadyInProgress`] if a
    /// request is already outstanding, and with [`MutexError::Failed`]
    /// once any peer link has broken.
    pub fn acquire(&self, file_name: &str) -> MutexResult<Held> {
        let actions = {
            let mut slot = self.shared.slot.lock().expect("engine lock");
            if let Some(reason) = &slot.failed {
                return Err(MutexError::Failed(reason.clone()));
            }
            slot.engine.acquire(file_name)?
        };
        self.shared.perform(actions);

        let mut slot = self.shared.slot.lock().expect("engine lock");
        loop {
            if let Some(reason) = &slot.failed {
                return Err(MutexError::Failed(reason.clone()));
            }
            if slot.engine.state() == MutexState::InCriticalSection {
                return Ok(Held {
                    shared: Arc::clone(&self.shared),
                    file_name: file_name.to_string(),
                    timestamp: slot.engine.timestamp(),
                });
            }
            slot = self.shared.entered.wait(slot).expect("engine lock");
        }
    }

    /// Current logical clock value.
    pub fn timestamp(&self) -> u64 {
        self.shared.slot.lock().expect("engine lock").engine.timestamp()
    }

    /// Returns true once a peer link has broken.
    pub fn is_failed(&self) -> bool {
        self.shared.slot.lock().expect("engine lock").failed.is_some()
    }
}

impl Held {
    /// The filename this critical section covers.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// The logical clock value at entry.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Leaves the critical section and answers deferred requests.
    pub fn release(self) -> MutexResult<()> {
        let actions = {
            let mut slot = self.shared.slot.lock().expect("engine lock");
            if let Some(reason) = &slot.failed {
                return Err(MutexError::Failed(reason.clone()));
            }
            slot.engine.release()?
        };
        self.shared.perform(actions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use scribe_net::{Location, PeerNetwork, PeerNetworkConfig};

    fn mesh_config(id: u8, port: u16, peer_port: u16, dir: &std::path::Path) -> PeerNetworkConfig {
        PeerNetworkConfig {
            id: NodeId::new(id),
            port,
            peers: vec![Location::resolve("127.0.0.1", peer_port).expect("resolve")],
            password: "mesh-secret".to_string(),
            poll_timeout: Duration::from_secs(10),
            retry_timeout: Duration::from_millis(100),
            temp_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn lock_hands_over_between_two_real_nodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_a = mesh_config(1, 47321, 47322, dir.path());
        let config_b = mesh_config(2, 47322, 47321, dir.path());

        let mesh_b = thread::spawn(move || PeerNetwork::establish(config_b));
        let links_a = PeerNetwork::establish(config_a).expect("mesh a");
        let links_b = mesh_b.join().expect("join").expect("mesh b");

        let service_a = LockService::start(NodeId::new(1), links_a);
        let service_b = LockService::start(NodeId::new(2), links_b);

        let held = service_a.acquire("f.txt").expect("acquire on a");

        // A second request while one is outstanding is rejected.
        assert!(matches!(
            service_a.acquire("other.txt"),
            Err(MutexError::AlreadyInProgress)
        ));

        // B blocks until A releases.
        let b_thread = thread::spawn(move || {
            let held = service_b.acquire("f.txt").expect("acquire on b");
            held.release().expect("release on b");
        });

        thread::sleep(Duration::from_millis(100));
        held.release().expect("release on a");
        b_thread.join().expect("b entered and released");

        // A can immediately re-enter a file B never asked about.
        let held = service_a.acquire("other.txt").expect("reacquire");
        held.release().expect("release");
    }
}
