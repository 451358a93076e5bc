/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The session: authoritative per-client state bound to a store lease.
//!
//! A [`Session`] is created by [`SessionManager::begin_session`](crate::manager::SessionManager::begin_session)
//! and owns, for its lifetime, the client's [`StateTree`], the [`DedupeCache`] of recently processed
//! transaction ids, and the [store lease](crate::store::StoreLease) arbitrating exclusive ownership
//! of the key.
//!
//! A session is a single-writer value: all mutations go through `&mut self` and the caller is
//! expected to serialize them through one logical execution context per session. The library adds no
//! internal locking within a session.

use std::collections::VecDeque;
use std::fmt::{self, Display};

use crate::shutdown::SessionOwnerHandle;
use crate::store::{SaveSignal, StoreError, StoreLease};
use crate::tree::StateTree;
use crate::types::{SessionKey, SessionSnapshot, SessionStatus, TxId};

/// Bounded, eviction-ordered record of recently processed transaction ids. Short-circuits
/// redelivered transactions without consulting durable storage. Persisted as part of the session
/// snapshot so it survives process restarts.
pub struct DedupeCache {
    capacity: usize,
    entries: VecDeque<TxId>,
}

impl DedupeCache {
    /// Rebuild a cache from the ids recorded in a loaded snapshot, keeping the most recent
    /// `capacity` of them.
    pub(crate) fn restore(ids: Vec<TxId>, capacity: usize) -> DedupeCache {
        let mut entries: VecDeque<TxId> = ids.into();
        while entries.len() > capacity {
            entries.pop_front();
        }
        DedupeCache { capacity, entries }
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.entries.iter().any(|id| id == tx_id)
    }

    /// Append `tx_id`, evicting the oldest entries until the cache is within capacity. An evicted
    /// id becomes eligible for re-processing on redelivery; this boundary is part of the documented
    /// contract. A capacity of zero records nothing, so every redelivery re-processes.
    pub(crate) fn record(&mut self, tx_id: TxId) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(tx_id);
    }

    pub fn ids(&self) -> Vec<TxId> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Authoritative state for one client, exclusively owning its tree, dedupe cache, and store lease.
pub struct Session<L: StoreLease> {
    key: SessionKey,
    status: SessionStatus,
    tree: StateTree,
    dedupe: DedupeCache,
    lease: L,
    owner_handle: Option<SessionOwnerHandle>,
    queued_messages: Vec<Vec<u8>>,
}

impl<L: StoreLease> Session<L> {
    pub(crate) fn new(
        key: SessionKey,
        tree: StateTree,
        dedupe: DedupeCache,
        lease: L,
        owner_handle: SessionOwnerHandle,
        queued_messages: Vec<Vec<u8>>,
    ) -> Session<L> {
        Session {
            key,
            status: SessionStatus::Pending,
            tree,
            dedupe,
            lease,
            owner_handle: Some(owner_handle),
            queued_messages,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Read-only view of the session's state tree. Available in every status; observers may read
    /// state while the session is ending.
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Mutable access to the state tree. Fails with a closed-session error once the session has
    /// entered `Ending`.
    pub fn tree_mut(&mut self) -> Result<&mut StateTree, SessionError> {
        if self.status.is_closed() {
            return Err(SessionError::Closed {
                status: self.status,
            });
        }
        Ok(&mut self.tree)
    }

    pub fn dedupe_cache(&self) -> &DedupeCache {
        &self.dedupe
    }

    pub(crate) fn dedupe_cache_mut(&mut self) -> &mut DedupeCache {
        &mut self.dedupe
    }

    /// Assemble the snapshot the store persists: the current tree plus the dedupe record.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(self.tree.root().clone(), self.dedupe.ids())
    }

    /// Trigger an asynchronous durable save of the current snapshot. A failing save leaves the
    /// session degraded but alive; it is not torn down purely because a save failed.
    pub fn save(&mut self) -> Result<(), SessionError> {
        if self.status == SessionStatus::Ended {
            return Err(SessionError::Closed {
                status: self.status,
            });
        }
        let snapshot = self.snapshot();
        self.tree.take_dirty();
        self.lease
            .save(&snapshot)
            .map_err(|source| SessionError::Save { source })
    }

    /// Trigger a save only if the tree has been mutated since the last one. Returns whether a save
    /// was triggered. Intended for host-driven periodic save cycles.
    pub fn save_if_dirty(&mut self) -> Result<bool, SessionError> {
        if !self.tree.is_dirty() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// The most recent durably confirmed snapshot.
    pub fn last_saved(&self) -> Option<SessionSnapshot> {
        self.lease.last_saved()
    }

    pub(crate) fn save_signal(&self) -> SaveSignal {
        self.lease.save_signal()
    }

    pub(crate) fn set_active(&mut self) {
        debug_assert_eq!(self.status, SessionStatus::Pending);
        self.status = SessionStatus::Active;
    }

    /// Move `Active → Ending`. Returns false if the session is already closed, which makes teardown
    /// idempotent at the manager level.
    pub(crate) fn begin_ending(&mut self) -> bool {
        if self.status.is_closed() {
            return false;
        }
        self.status = SessionStatus::Ending;
        true
    }

    pub(crate) fn set_ended(&mut self) {
        self.status = SessionStatus::Ended;
    }

    pub(crate) fn release_lease(&mut self) {
        self.lease.release();
    }

    /// Acknowledge the shutdown coordinator's drain and drop the registration. Called once, during
    /// teardown.
    pub(crate) fn ack_drain(&mut self) {
        if let Some(mut handle) = self.owner_handle.take() {
            handle.ack_drain();
        }
    }

    /// Payloads the message channel queued for this key while the session was closed, delivered on
    /// this activation. Arrival order; empties on first call.
    pub fn take_queued_messages(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.queued_messages)
    }
}

/// Error when operating on a session.
#[derive(Debug)]
pub enum SessionError {
    /// The operation was attempted on a session in `Ending` or `Ended` state.
    Closed { status: SessionStatus },
    /// The durable write could not be triggered. Transient; the session stays alive.
    Save { source: StoreError },
}

impl Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Closed { status } => {
                write!(f, "operation attempted on a closed session (status: {})", status)
            }
            SessionError::Save { source } => write!(f, "save could not be triggered: {}", source),
        }
    }
}
