//! # scribe-mutex: Distributed mutual exclusion
//!
//! Ricart–Agrawala mutual exclusion with the Roucairol–Carvalho retained
//! permissions optimization, keyed by filename, over the peer mesh.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       LockService                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  acquire() ──┐                                           │
//! │              ▼                                           │
//! │      ┌──────────────┐   actions    ┌──────────────────┐  │
//! │      │    Engine    │ ───────────▶ │ per-peer writer  │  │
//! │      │ (pure state) │              │ threads (mpsc)   │  │
//! │      └──────────────┘              └──────────────────┘  │
//! │              ▲                                           │
//! │   per-peer reader threads (Request / Reply)              │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Engine`] is a pure state machine: every input mutates state under the
//! service's single lock and returns [`Action`]s that are performed after
//! the lock is released, so the lock is never held across I/O.
//!
//! A node runs at most one outstanding request at a time; a second
//! [`LockService::acquire`] while one is pending fails with
//! [`MutexError::AlreadyInProgress`]. Any peer-link error is fatal to the
//! service; recovery is not implemented.

mod clock;
mod engine;
mod service;

pub use clock::LamportClock;
pub use engine::{Action, Engine, MutexState};
pub use service::{Held, LockService};

use thiserror::Error;

/// Result type for mutual exclusion operations.
pub type MutexResult<T> = Result<T, MutexError>;

/// Errors that can occur in the mutual exclusion subsystem.
#[derive(Debug, Error)]
pub enum MutexError {
    /// `acquire` was called while a request was already outstanding.
    #[error("operation already in progress")]
    AlreadyInProgress,

    /// A peer link broke; the whole service is down.
    #[error("mutual exclusion service failed: {0}")]
    Failed(String),

    /// Released a critical section that was not held.
    #[error("not in a critical section")]
    NotHeld,
}
