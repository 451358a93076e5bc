/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The two-phase shutdown protocol: drain, then terminate.
//!
//! A session ended because the whole process is shutting down must be distinguishable from one ended
//! because its client disconnected voluntarily; business logic gated on "proper shutdown" (e.g.
//! granting offline compensation) depends on the distinction. The protocol:
//!
//! 1. [`ShutdownCoordinator::begin_shutdown`] moves the process to `Draining`. No new sessions are
//!    admitted. Each live session owner observes the phase change, stops admitting work for its
//!    session, ends it, and thereby acknowledges the drain.
//! 2. Once every registered owner has acknowledged (or the drain timeout elapses), the coordinator
//!    moves to `Terminating`.
//!
//! The [session manager](crate::manager) consults the coordinator when finalizing a disconnect: at
//! `Draining` or later, the recorded end reason is upgraded to
//! [`EndReason::Shutdown`](crate::types::EndReason), so the save-completion side of the store sees
//! the same distinction the old single-scheduler-tick delay used to provide, without the delay.

use std::collections::HashSet;
use std::fmt::{self, Display};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Process-wide shutdown phase. Strictly monotone: `Running → Draining → Terminating`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Terminating,
}

impl Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "Running"),
            ShutdownPhase::Draining => write!(f, "Draining"),
            ShutdownPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

struct CoordinatorState {
    phase: Mutex<ShutdownPhase>,
    phase_changed: Condvar,
    // Owner ids registered and not yet acknowledged. An owner acknowledges the drain by calling
    // `ack_drain`, or implicitly by dropping its handle.
    pending: Mutex<PendingOwners>,
    pending_changed: Condvar,
}

struct PendingOwners {
    next_id: u64,
    unacked: HashSet<u64>,
}

/// Coordinates the drain-then-terminate protocol across all live session owners in the process.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<CoordinatorState>,
}

impl ShutdownCoordinator {
    pub fn new() -> ShutdownCoordinator {
        ShutdownCoordinator {
            state: Arc::new(CoordinatorState {
                phase: Mutex::new(ShutdownPhase::Running),
                phase_changed: Condvar::new(),
                pending: Mutex::new(PendingOwners {
                    next_id: 0,
                    unacked: HashSet::new(),
                }),
                pending_changed: Condvar::new(),
            }),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.state.phase.lock().unwrap()
    }

    /// Register a new session owner. The coordinator will not move from `Draining` to `Terminating`
    /// until this owner acknowledges (or the drain timeout elapses).
    pub fn register(&self) -> SessionOwnerHandle {
        let mut pending = self.state.pending.lock().unwrap();
        let id = pending.next_id;
        pending.next_id += 1;
        pending.unacked.insert(id);
        SessionOwnerHandle {
            state: self.state.clone(),
            id,
            acked: false,
        }
    }

    /// Broadcast `Draining`, wait for all registered owners to acknowledge (bounded by
    /// `drain_timeout`), then broadcast `Terminating`. Idempotent: a second call returns once the
    /// process is `Terminating`.
    pub fn begin_shutdown(&self, drain_timeout: Duration) {
        {
            let mut phase = self.state.phase.lock().unwrap();
            if *phase == ShutdownPhase::Terminating {
                return;
            }
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                self.state.phase_changed.notify_all();
            }
        }

        let deadline = Instant::now() + drain_timeout;
        let mut pending = self.state.pending.lock().unwrap();
        while !pending.unacked.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "drain timeout elapsed with {} session owner(s) unacknowledged; terminating",
                    pending.unacked.len()
                );
                break;
            }
            let (guard, _) = self
                .state
                .pending_changed
                .wait_timeout(pending, deadline - now)
                .unwrap();
            pending = guard;
        }
        drop(pending);

        let mut phase = self.state.phase.lock().unwrap();
        *phase = ShutdownPhase::Terminating;
        self.state.phase_changed.notify_all();
    }

    /// Block until the phase is at least `target` or `timeout` elapses. Returns the phase current
    /// at return.
    pub fn wait_phase_at_least(&self, target: ShutdownPhase, timeout: Duration) -> ShutdownPhase {
        let phase = self.state.phase.lock().unwrap();
        let (phase, _) = self
            .state
            .phase_changed
            .wait_timeout_while(phase, timeout, |phase| *phase < target)
            .unwrap();
        *phase
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> ShutdownCoordinator {
        ShutdownCoordinator::new()
    }
}

/// One live session's registration with the coordinator. Dropping the handle counts as
/// acknowledging the drain.
pub struct SessionOwnerHandle {
    state: Arc<CoordinatorState>,
    id: u64,
    acked: bool,
}

impl SessionOwnerHandle {
    pub fn phase(&self) -> ShutdownPhase {
        *self.state.phase.lock().unwrap()
    }

    /// Acknowledge the drain: this owner's session no longer admits work. Idempotent.
    pub fn ack_drain(&mut self) {
        if self.acked {
            return;
        }
        self.acked = true;
        let mut pending = self.state.pending.lock().unwrap();
        pending.unacked.remove(&self.id);
        self.state.pending_changed.notify_all();
    }
}

impl Drop for SessionOwnerHandle {
    fn drop(&mut self) {
        self.ack_drain();
    }
}
