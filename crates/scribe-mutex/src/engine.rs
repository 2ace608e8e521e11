//! The Ricart–Agrawala state machine.
//!
//! [`Engine`] holds all mutual-exclusion state for one node and no I/O.
//! Every input returns the [`Action`]s to perform once the caller drops
//! its lock: messages to send, and whether the critical section was
//! entered. This keeps the protocol deterministic and testable without a
//! network.

use std::collections::{HashMap, HashSet, VecDeque};

use scribe_wire::{Message, NodeId};
use tracing::debug;

use crate::clock::LamportClock;
use crate::{MutexError, MutexResult};

/// Local mutual-exclusion state.
///
/// A node holds at most one outstanding request, so the state is global
/// to the engine rather than per filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    /// Not requesting and not in the critical section.
    Waiting,
    /// A request is outstanding.
    Requesting,
    /// Inside the critical section.
    InCriticalSection,
}

/// The one outstanding local request.
#[derive(Debug, Clone)]
struct Outstanding {
    file_name: String,
    timestamp: u64,
}

/// A request that arrived while it could not be answered.
#[derive(Debug, Clone)]
struct DelayedRequest {
    from: NodeId,
    timestamp: u64,
    file_name: String,
}

/// What the caller must do after an engine input, outside the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message to a peer.
    Send { to: NodeId, message: Message },
    /// The critical section was entered; wake the waiting acquirer.
    Enter,
}

/// Pure Ricart–Agrawala engine with retained permissions.
#[derive(Debug)]
pub struct Engine {
    id: NodeId,
    clock: LamportClock,
    state: MutexState,
    outstanding: Option<Outstanding>,
    /// Per peer, the filenames this node holds a standing permission for.
    have_permission_for: HashMap<NodeId, HashSet<String>>,
    delayed: VecDeque<DelayedRequest>,
}

impl Engine {
    /// Creates an engine for `id` with the given peers.
    pub fn new(id: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            id,
            clock: LamportClock::new(),
            state: MutexState::Waiting,
            outstanding: None,
            have_permission_for: peers.into_iter().map(|p| (p, HashSet::new())).collect(),
            delayed: VecDeque::new(),
        }
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current logical clock value.
    pub fn timestamp(&self) -> u64 {
        self.clock.now()
    }

    /// Current local state.
    pub fn state(&self) -> MutexState {
        self.state
    }

    /// The filename of the outstanding request, if any.
    pub fn outstanding_file(&self) -> Option<&str> {
        self.outstanding.as_ref().map(|o| o.file_name.as_str())
    }

    /// Returns true if this node holds `peer`'s permission for `file_name`.
    pub fn has_permission_from(&self, peer: NodeId, file_name: &str) -> bool {
        self.have_permission_for
            .get(&peer)
            .is_some_and(|files| files.contains(file_name))
    }

    /// Number of requests currently deferred.
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Starts a request for the critical section on `file_name`.
    ///
    /// Fails with [`MutexError::AlreadyInProgress`] unless the node is in
    /// `Waiting` with no outstanding request. Sends a `Request` to every
    /// peer whose permission is not already retained; if permissions are
    /// retained from every peer the returned actions include
    /// [`Action::Enter`] immediately.
    pub fn acquire(&mut self, file_name: &str) -> MutexResult<Vec<Action>> {
        if self.outstanding.is_some() || self.state != MutexState::Waiting {
            return Err(MutexError::AlreadyInProgress);
        }

        let timestamp = self.clock.tick();
        self.outstanding = Some(Outstanding {
            file_name: file_name.to_string(),
            timestamp,
        });
        self.state = MutexState::Requesting;
        debug!(node = %self.id, file = file_name, timestamp, "requesting mutual exclusion");

        let mut actions = Vec::new();
        for (&peer, files) in &self.have_permission_for {
            if !files.contains(file_name) {
                actions.push(Action::Send {
                    to: peer,
                    message: Message::Request {
                        timestamp,
                        file_name: file_name.to_string(),
                    },
                });
            }
        }

        // Permissions may be fully retained from an earlier run.
        self.check_entry(&mut actions);
        Ok(actions)
    }

    /// Handles a `Reply` from a peer.
    pub fn on_reply(&mut self, from: NodeId, timestamp: u64, file_name: &str) -> Vec<Action> {
        self.clock.observe(timestamp);
        debug!(node = %self.id, peer = %from, file = file_name, "received reply");

        self.have_permission_for
            .entry(from)
            .or_default()
            .insert(file_name.to_string());

        let mut actions = Vec::new();
        if self.state == MutexState::Requesting {
            self.check_entry(&mut actions);
        }
        actions
    }

    /// Handles a `Request` from a peer.
    pub fn on_request(&mut self, from: NodeId, timestamp: u64, file_name: &str) -> Vec<Action> {
        self.clock.observe(timestamp);
        debug!(node = %self.id, peer = %from, file = file_name, timestamp, "received request");
        self.dispatch_request(from, timestamp, file_name)
    }

    fn dispatch_request(&mut self, from: NodeId, timestamp: u64, file_name: &str) -> Vec<Action> {
        match self.state {
            MutexState::Waiting => {
                // Not competing: surrender the permission and reply.
                self.surrender_and_reply(from, file_name)
            }
            MutexState::InCriticalSection => {
                self.defer(from, timestamp, file_name);
                Vec::new()
            }
            MutexState::Requesting => {
                let mine = self
                    .outstanding
                    .clone()
                    .expect("requesting state always has an outstanding request");

                if mine.file_name != file_name {
                    // Different file: no conflict with my request.
                    self.surrender_and_reply(from, file_name)
                } else if (mine.timestamp, self.id) < (timestamp, from) {
                    // My request has priority; answer after my turn.
                    self.defer(from, timestamp, file_name);
                    Vec::new()
                } else {
                    // Their request has priority. The permission set is left
                    // alone: my outstanding request will be answered by a
                    // later Reply from them.
                    self.reply_to(from, file_name)
                }
            }
        }
    }

    /// Leaves the critical section and answers everything deferred.
    pub fn release(&mut self) -> MutexResult<Vec<Action>> {
        if self.state != MutexState::InCriticalSection {
            return Err(MutexError::NotHeld);
        }
        debug!(node = %self.id, "releasing mutual exclusion");

        self.outstanding = None;
        self.state = MutexState::Waiting;

        let mut actions = Vec::new();
        while let Some(delayed) = self.delayed.pop_front() {
            actions.extend(self.on_request(delayed.from, delayed.timestamp, &delayed.file_name));
        }
        Ok(actions)
    }

    /// Enters the critical section once every peer's permission is held.
    fn check_entry(&mut self, actions: &mut Vec<Action>) {
        let Some(mine) = &self.outstanding else {
            return;
        };

        let all_held = self
            .have_permission_for
            .values()
            .all(|files| files.contains(&mine.file_name));
        if all_held {
            debug!(node = %self.id, file = %mine.file_name, "entering the critical section");
            self.state = MutexState::InCriticalSection;
            actions.push(Action::Enter);
        }
    }

    fn surrender_and_reply(&mut self, to: NodeId, file_name: &str) -> Vec<Action> {
        if let Some(files) = self.have_permission_for.get_mut(&to) {
            files.remove(file_name);
        }
        self.reply_to(to, file_name)
    }

    fn reply_to(&mut self, to: NodeId, file_name: &str) -> Vec<Action> {
        vec![Action::Send {
            to,
            message: Message::Reply {
                timestamp: self.clock.now(),
                file_name: file_name.to_string(),
            },
        }]
    }

    fn defer(&mut self, from: NodeId, timestamp: u64, file_name: &str) {
        self.delayed.push_back(DelayedRequest {
            from,
            timestamp,
            file_name: file_name.to_string(),
        });
    }
}

#[cfg(test)]
mod tests;
