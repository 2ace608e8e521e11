//! Engine unit tests and a deterministic multi-node simulation.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scribe_wire::{Message, NodeId};

use super::{Action, Engine, MutexState};
use crate::MutexError;

fn engine(id: u8, peers: &[u8]) -> Engine {
    Engine::new(NodeId::new(id), peers.iter().copied().map(NodeId::new))
}

/// Extracts the sent messages from a batch of actions.
fn sends(actions: &[Action]) -> Vec<(NodeId, Message)> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Send { to, message } => Some((*to, message.clone())),
            Action::Enter => None,
        })
        .collect()
}

fn entered(actions: &[Action]) -> bool {
    actions.iter().any(|action| matches!(action, Action::Enter))
}

#[test]
fn two_node_request_reply_enter_release() {
    let mut a = engine(1, &[2]);
    let mut b = engine(2, &[1]);

    // A requests: one Request{1} to B.
    let actions = a.acquire("file.txt").expect("acquire");
    let requests = sends(&actions);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0],
        (
            NodeId::new(2),
            Message::Request {
                timestamp: 1,
                file_name: "file.txt".to_string(),
            }
        )
    );
    assert!(!entered(&actions));
    assert_eq!(a.state(), MutexState::Requesting);

    // B is waiting, so it replies with its advanced clock.
    let actions = b.on_request(NodeId::new(1), 1, "file.txt");
    let replies = sends(&actions);
    assert_eq!(
        replies,
        vec![(
            NodeId::new(1),
            Message::Reply {
                timestamp: 2,
                file_name: "file.txt".to_string(),
            }
        )]
    );

    // A collects the reply and enters.
    let actions = a.on_reply(NodeId::new(2), 2, "file.txt");
    assert!(entered(&actions));
    assert_eq!(a.state(), MutexState::InCriticalSection);
    assert!(a.has_permission_from(NodeId::new(2), "file.txt"));

    // Release with nothing deferred sends nothing.
    let actions = a.release().expect("release");
    assert!(actions.is_empty());
    assert_eq!(a.state(), MutexState::Waiting);
}

#[test]
fn symmetric_race_lower_id_enters_first() {
    let mut a = engine(1, &[2]);
    let mut b = engine(2, &[1]);

    // Both request the same file before seeing each other; equal clocks.
    let a_requests = sends(&a.acquire("f").expect("acquire"));
    let b_requests = sends(&b.acquire("f").expect("acquire"));
    assert_eq!(a_requests.len(), 1);
    assert_eq!(b_requests.len(), 1);

    // B's request reaches A: A has priority (same timestamp, lower id)
    // and defers.
    let actions = a.on_request(NodeId::new(2), 1, "f");
    assert!(actions.is_empty());
    assert_eq!(a.delayed_len(), 1);

    // A's request reaches B: B loses the tie-break and replies.
    let actions = b.on_request(NodeId::new(1), 1, "f");
    let replies = sends(&actions);
    assert_eq!(replies.len(), 1);
    let (to, Message::Reply { timestamp, .. }) = replies[0].clone() else {
        panic!("expected a reply");
    };
    assert_eq!(to, NodeId::new(1));

    // A enters; B is still shut out.
    assert!(entered(&a.on_reply(NodeId::new(2), timestamp, "f")));
    assert_eq!(b.state(), MutexState::Requesting);

    // A releases, which drains the deferred request into a reply.
    let actions = a.release().expect("release");
    let replies = sends(&actions);
    assert_eq!(replies.len(), 1);
    let (to, Message::Reply { timestamp, .. }) = replies[0].clone() else {
        panic!("expected a reply");
    };
    assert_eq!(to, NodeId::new(2));

    assert!(entered(&b.on_reply(NodeId::new(1), timestamp, "f")));
}

#[test]
fn different_files_are_independent() {
    let mut a = engine(1, &[2]);
    let mut b = engine(2, &[1]);

    a.acquire("x").expect("acquire");
    b.acquire("y").expect("acquire");

    // Each request is for a file the other is not competing on, so both
    // reply immediately and both enter.
    let reply_from_b = sends(&b.on_request(NodeId::new(1), 1, "x"));
    let reply_from_a = sends(&a.on_request(NodeId::new(2), 1, "y"));
    assert_eq!(reply_from_b.len(), 1);
    assert_eq!(reply_from_a.len(), 1);

    let Message::Reply { timestamp: tb, .. } = reply_from_b[0].1.clone() else {
        panic!("expected reply")
    };
    let Message::Reply { timestamp: ta, .. } = reply_from_a[0].1.clone() else {
        panic!("expected reply")
    };

    assert!(entered(&a.on_reply(NodeId::new(2), tb, "x")));
    assert!(entered(&b.on_reply(NodeId::new(1), ta, "y")));
    assert_eq!(a.state(), MutexState::InCriticalSection);
    assert_eq!(b.state(), MutexState::InCriticalSection);
}

#[test]
fn retained_permissions_skip_the_request_round() {
    let mut a = engine(1, &[2, 3]);

    a.acquire("f").expect("acquire");
    a.on_reply(NodeId::new(2), 1, "f");
    let actions = a.on_reply(NodeId::new(3), 2, "f");
    assert!(entered(&actions));
    a.release().expect("release");

    // Nobody asked for the permissions back, so re-entry is immediate and
    // sends zero Requests.
    let actions = a.acquire("f").expect("acquire");
    assert!(sends(&actions).is_empty());
    assert!(entered(&actions));
}

#[test]
fn second_acquire_fails_while_busy() {
    let mut a = engine(1, &[2]);

    a.acquire("f").expect("acquire");
    assert!(matches!(a.acquire("f"), Err(MutexError::AlreadyInProgress)));
    assert!(matches!(a.acquire("g"), Err(MutexError::AlreadyInProgress)));

    // Still rejected once inside the critical section.
    a.on_reply(NodeId::new(2), 1, "f");
    assert_eq!(a.state(), MutexState::InCriticalSection);
    assert!(matches!(a.acquire("f"), Err(MutexError::AlreadyInProgress)));
}

#[test]
fn release_without_holding_fails() {
    let mut a = engine(1, &[2]);
    assert!(matches!(a.release(), Err(MutexError::NotHeld)));

    a.acquire("f").expect("acquire");
    assert!(matches!(a.release(), Err(MutexError::NotHeld)));
}

#[test]
fn request_while_in_critical_section_is_deferred() {
    let mut a = engine(1, &[2]);

    a.acquire("f").expect("acquire");
    a.on_reply(NodeId::new(2), 1, "f");
    assert_eq!(a.state(), MutexState::InCriticalSection);

    assert!(a.on_request(NodeId::new(2), 5, "f").is_empty());
    assert_eq!(a.delayed_len(), 1);

    let actions = a.release().expect("release");
    let replies = sends(&actions);
    assert_eq!(replies.len(), 1);
    assert_eq!(a.delayed_len(), 0);
    assert!(!a.has_permission_from(NodeId::new(2), "f"));
}

#[test]
fn request_for_other_file_while_requesting_surrenders_permission() {
    let mut a = engine(1, &[2]);

    // A retains B's permission for "y" from an earlier run.
    a.acquire("y").expect("acquire");
    a.on_reply(NodeId::new(2), 1, "y");
    a.release().expect("release");

    // Now requesting "x", B asks for "y" back: reply and surrender.
    a.acquire("x").expect("acquire");
    assert!(a.has_permission_from(NodeId::new(2), "y"));
    let actions = a.on_request(NodeId::new(2), 9, "y");
    assert_eq!(sends(&actions).len(), 1);
    assert!(!a.has_permission_from(NodeId::new(2), "y"));
}

#[test]
fn losing_the_tiebreak_does_not_touch_the_permission_set() {
    let mut a = engine(5, &[3]);

    a.acquire("f").expect("acquire");
    assert!(!a.has_permission_from(NodeId::new(3), "f"));

    // Peer 3 requests "f" with the same timestamp and a lower id: they
    // have priority, A replies, and the permission set is untouched.
    let actions = a.on_request(NodeId::new(3), 1, "f");
    assert_eq!(sends(&actions).len(), 1);
    assert!(!a.has_permission_from(NodeId::new(3), "f"));
    assert_eq!(a.delayed_len(), 0);
}

#[test]
fn clock_is_monotonic_and_causal() {
    let mut a = engine(1, &[2]);

    let mut last = a.timestamp();
    a.acquire("f").expect("acquire");
    assert!(a.timestamp() > last);
    last = a.timestamp();

    // Receiving a far-future request jumps strictly past it.
    a.on_request(NodeId::new(2), 100, "g");
    assert!(a.timestamp() > 100);
    assert!(a.timestamp() > last);
    last = a.timestamp();

    // A stale reply still advances the clock.
    a.on_reply(NodeId::new(2), 1, "f");
    assert!(a.timestamp() > last);
}

#[test]
fn permission_accounting_after_an_exchange() {
    let mut a = engine(1, &[2]);
    let mut b = engine(2, &[1]);

    a.acquire("f").expect("acquire");
    let replies = sends(&b.on_request(NodeId::new(1), 1, "f"));
    let Message::Reply { timestamp, .. } = replies[0].1.clone() else {
        panic!("expected reply")
    };
    a.on_reply(NodeId::new(2), timestamp, "f");

    // Exactly one side holds the permission.
    assert!(a.has_permission_from(NodeId::new(2), "f"));
    assert!(!b.has_permission_from(NodeId::new(1), "f"));
}

// ============================================================================
// Deterministic multi-node simulation
// ============================================================================

/// In-process cluster delivering engine messages over per-link FIFOs.
struct Sim {
    engines: Vec<Engine>,
    /// Message queues keyed by (from, to) engine index. Per-link order is
    /// preserved, matching TCP delivery on a peer link.
    queues: HashMap<(usize, usize), VecDeque<Message>>,
    /// Current critical-section holder per filename.
    holders: HashMap<String, usize>,
    /// Critical-section entries per node.
    entries: Vec<usize>,
}

impl Sim {
    fn new(n: usize) -> Self {
        let ids: Vec<NodeId> = (1..=n as u8).map(NodeId::new).collect();
        let engines = ids
            .iter()
            .map(|&id| {
                Engine::new(id, ids.iter().copied().filter(move |&peer| peer != id))
            })
            .collect();

        let mut queues = HashMap::new();
        for from in 0..n {
            for to in 0..n {
                if from != to {
                    queues.insert((from, to), VecDeque::new());
                }
            }
        }

        Self {
            engines,
            queues,
            holders: HashMap::new(),
            entries: vec![0; n],
        }
    }

    fn index_of(&self, id: NodeId) -> usize {
        (id.as_u8() - 1) as usize
    }

    fn apply(&mut self, from: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, message } => {
                    let to = self.index_of(to);
                    self.queues
                        .get_mut(&(from, to))
                        .expect("link exists")
                        .push_back(message);
                }
                Action::Enter => {
                    let file = self.engines[from]
                        .outstanding_file()
                        .expect("entering node has an outstanding request")
                        .to_string();
                    // The safety property: one holder per filename.
                    if let Some(&holder) = self.holders.get(&file) {
                        panic!(
                            "mutual exclusion violated on {file:?}: node {holder} and node {from}"
                        );
                    }
                    self.holders.insert(file, from);
                    self.entries[from] += 1;
                }
            }
        }
    }

    /// Delivers the oldest message on the (from, to) link.
    fn deliver(&mut self, from: usize, to: usize) {
        let Some(message) = self
            .queues
            .get_mut(&(from, to))
            .and_then(VecDeque::pop_front)
        else {
            return;
        };

        let before = self.engines[to].timestamp();
        let sender = NodeId::new(from as u8 + 1);
        let actions = match message {
            Message::Request {
                timestamp,
                file_name,
            } => self.engines[to].on_request(sender, timestamp, &file_name),
            Message::Reply {
                timestamp,
                file_name,
            } => self.engines[to].on_reply(sender, timestamp, &file_name),
            other => panic!("unexpected message on a peer link: {other:?}"),
        };
        assert!(self.engines[to].timestamp() > before, "clock causality");
        self.apply(to, actions);
    }

    fn release(&mut self, node: usize) {
        let file = self
            .holders
            .iter()
            .find(|(_, &holder)| holder == node)
            .map(|(file, _)| file.clone())
            .expect("node holds a critical section");
        let actions = self.engines[node].release().expect("release");
        self.holders.remove(&file);
        self.apply(node, actions);
    }

    fn pending_links(&self) -> Vec<(usize, usize)> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(&link, _)| link)
            .collect()
    }

    /// Delivers everything and releases every holder until quiescent.
    fn drain(&mut self) {
        for _ in 0..100_000 {
            let links = self.pending_links();
            if links.is_empty() {
                let holder = self.holders.values().next().copied();
                match holder {
                    Some(node) => self.release(node),
                    None => {
                        let requesting = self
                            .engines
                            .iter()
                            .any(|e| e.state() == MutexState::Requesting);
                        if !requesting {
                            return;
                        }
                        panic!("requesting node starved with no messages in flight");
                    }
                }
            } else {
                for (from, to) in links {
                    self.deliver(from, to);
                }
            }
        }
        panic!("simulation failed to quiesce");
    }
}

#[test]
fn randomized_three_node_schedules_preserve_mutual_exclusion() {
    let files = ["alpha.txt", "beta.txt"];

    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sim = Sim::new(3);

        for _ in 0..2500 {
            match rng.random_range(0..4u8) {
                0 => {
                    let node = rng.random_range(0..3);
                    if sim.engines[node].state() == MutexState::Waiting {
                        let file = files[rng.random_range(0..files.len())];
                        let actions = sim.engines[node].acquire(file).expect("acquire");
                        sim.apply(node, actions);
                    }
                }
                1 | 2 => {
                    let links = sim.pending_links();
                    if !links.is_empty() {
                        let (from, to) = links[rng.random_range(0..links.len())];
                        sim.deliver(from, to);
                    }
                }
                _ => {
                    let holders: Vec<usize> = sim.holders.values().copied().collect();
                    if !holders.is_empty() {
                        sim.release(holders[rng.random_range(0..holders.len())]);
                    }
                }
            }
        }

        sim.drain();

        // Progress: with thousands of steps every node got in.
        for (node, &entries) in sim.entries.iter().enumerate() {
            assert!(entries > 0, "seed {seed}: node {node} never entered");
        }

        // Permission accounting at quiescence: a permission is never held
        // on both sides of a pair.
        for i in 0..3 {
            for j in 0..3 {
                if i == j {
                    continue;
                }
                for file in files {
                    let id_i = NodeId::new(i as u8 + 1);
                    let id_j = NodeId::new(j as u8 + 1);
                    assert!(
                        !(sim.engines[i].has_permission_from(id_j, file)
                            && sim.engines[j].has_permission_from(id_i, file)),
                        "seed {seed}: {file} held on both sides of ({i},{j})"
                    );
                }
            }
        }
    }
}
