/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable session persistence.
//!
//! SessionKeeper does not implement durable storage itself. Library users provide an implementation
//! of [`SessionStore`]: a durable key-value store of [session snapshots](crate::types::SessionSnapshot)
//! with optimistic per-key leasing and asynchronous save confirmation. The [session
//! manager](crate::manager) acquires exactly one [lease](StoreLease) per session and releases it
//! exactly once, on teardown.
//!
//! ## Leasing
//!
//! [`SessionStore::acquire_lease`] must block while the lease for `key` is held elsewhere and not yet
//! released, retrying until it is free. The caller passes a [`CancelProbe`]; implementations must
//! re-check it between attempts and abort with [`AcquireError::Cancelled`] promptly once it reports
//! the requesting client gone. An implementation must never hand out two live leases for the same key.
//!
//! ## Save confirmation
//!
//! [`StoreLease::save`] triggers an asynchronous durable write and returns without waiting for it.
//! Once a write is durably confirmed, the implementation updates [`StoreLease::last_saved`] and bumps
//! the lease's [`SaveSignal`]. The [transaction ledger](crate::ledger) blocks on that signal when it
//! needs durability before acknowledging an external event.

use std::fmt::{self, Display};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::types::{SessionKey, SessionSnapshot};

/// A durable store of session snapshots with per-key leasing.
pub trait SessionStore: Clone + Send + 'static {
    type Lease: StoreLease;

    /// Acquire the lease for `key`, blocking and retrying while it is contested. Returns
    /// [`AcquireError::Cancelled`] as soon as `cancel` fires, and
    /// [`AcquireError::StoreUnreachable`] if the store cannot be reached at all.
    fn acquire_lease(&self, key: &SessionKey, cancel: &CancelProbe)
        -> Result<Self::Lease, AcquireError>;
}

/// An exclusively held lease on one session key. Dropping a lease without calling
/// [`release`](StoreLease::release) is an implementation-defined fault; the session manager always
/// releases explicitly.
pub trait StoreLease: Send + 'static {
    /// The snapshot read from storage at acquisition time. `None` for a key that has never been
    /// saved.
    fn loaded(&self) -> Result<Option<SessionSnapshot>, StoreError>;

    /// Trigger an asynchronous durable write of `snapshot`. Completion is observable through
    /// [`last_saved`](StoreLease::last_saved) and the [`SaveSignal`].
    fn save(&mut self, snapshot: &SessionSnapshot) -> Result<(), StoreError>;

    /// The most recent durably confirmed snapshot, if any write has completed yet.
    fn last_saved(&self) -> Option<SessionSnapshot>;

    /// The signal bumped each time a write of this lease is durably confirmed.
    fn save_signal(&self) -> SaveSignal;

    /// Release the lease. Idempotent: releasing an already released lease is a no-op.
    fn release(&mut self);
}

/// A monotone save-completion counter paired with a condition variable. Store implementations bump
/// it once per durably confirmed write; waiters block until the counter moves past a generation they
/// have already observed, or a timeout elapses. This replaces re-check polling loops on the waiter
/// side.
#[derive(Clone)]
pub struct SaveSignal {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl SaveSignal {
    pub fn new() -> SaveSignal {
        SaveSignal {
            inner: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// The current save generation.
    pub fn observed(&self) -> u64 {
        let (counter, _) = &*self.inner;
        *counter.lock().unwrap()
    }

    /// Record one more durably confirmed save and wake all waiters.
    pub fn notify(&self) {
        let (counter, condvar) = &*self.inner;
        let mut generation = counter.lock().unwrap();
        *generation += 1;
        condvar.notify_all();
    }

    /// Block until the generation exceeds `seen` or `timeout` elapses, whichever comes first.
    /// Returns the generation current at return, which equals `seen` if the wait timed out.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
        let (counter, condvar) = &*self.inner;
        let guard = counter.lock().unwrap();
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |generation| *generation <= seen)
            .unwrap();
        *guard
    }
}

impl Default for SaveSignal {
    fn default() -> SaveSignal {
        SaveSignal::new()
    }
}

/// A jittered pause for pacing contested-lease retry loops. Store implementations are expected to
/// sleep roughly this long between [acquisition attempts](SessionStore::acquire_lease) so that two
/// nodes fighting over the same key do not retry in lockstep. Uniform over [base/2, 3*base/2).
pub fn contested_retry_interval(base: Duration) -> Duration {
    use rand::Rng;
    let base_millis = base.as_millis() as u64;
    if base_millis == 0 {
        return Duration::from_millis(0);
    }
    let jittered = rand::thread_rng().gen_range(base_millis / 2, base_millis + base_millis / 2 + 1);
    Duration::from_millis(jittered)
}

/// A liveness predicate for the client a lease is being acquired for. Returns `true` once the client
/// is gone and the acquisition attempt should be abandoned.
#[derive(Clone)]
pub struct CancelProbe {
    probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl CancelProbe {
    pub fn new<F: Fn() -> bool + Send + Sync + 'static>(probe: F) -> CancelProbe {
        CancelProbe {
            probe: Arc::new(probe),
        }
    }

    /// A probe that never fires. Useful for callers whose client cannot disconnect (e.g. tests).
    pub fn never() -> CancelProbe {
        CancelProbe::new(|| false)
    }

    pub fn fired(&self) -> bool {
        (self.probe)()
    }
}

/// Error when acquiring a lease.
#[derive(Debug)]
pub enum AcquireError {
    /// The cancel probe fired before the lease could be acquired.
    Cancelled,
    /// The store could not be reached.
    StoreUnreachable { source: StoreError },
}

impl Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::Cancelled => {
                write!(f, "lease acquisition cancelled: requesting client disconnected")
            }
            AcquireError::StoreUnreachable { source } => {
                write!(f, "lease acquisition failed: store unreachable: {}", source)
            }
        }
    }
}

/// Error reported by a store implementation for a single read or write.
#[derive(Debug)]
pub enum StoreError {
    /// The store rejected or lost the operation. Transient; saves are retried while the session
    /// remains active.
    Unavailable { detail: String },
    /// A stored snapshot could not be deserialized.
    CorruptSnapshot { source: std::io::Error },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable { detail } => write!(f, "store unavailable: {}", detail),
            StoreError::CorruptSnapshot { source } => {
                write!(f, "stored snapshot could not be deserialized: {}", source)
            }
        }
    }
}
