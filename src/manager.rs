/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Session Manager: acquisition, reconciliation, and teardown of sessions.
//!
//! One [`SessionManager`] serves the whole process. Each client connection calls
//! [`begin_session`](SessionManager::begin_session) from its own execution context and exclusively
//! owns the returned [`Session`] until it calls [`end_session`](SessionManager::end_session); the
//! manager itself keeps no per-session state, so sessions on different keys never contend on
//! anything except the store's own per-key lease arbitration.
//!
//! ## Acquisition
//!
//! `begin_session` acquires the store lease for the client's key, retrying while the lease is
//! contested and abandoning promptly once the [`CancelProbe`] reports the requesting client gone.
//! On success the loaded state is reconciled against a template of defaults: keys present in the
//! template but absent in the loaded data are deep-copied in; existing keys are never overwritten.
//!
//! ## Teardown
//!
//! `end_session` is idempotent. It triggers the final durable save, waits (bounded) for its
//! confirmation, releases the lease exactly once, and fires a single
//! [`SessionEnded`](crate::events::SessionEndedEvent) notification. If the process has entered the
//! [drain phase](crate::shutdown) by the time a disconnect is finalized, the recorded reason is
//! upgraded to [`EndReason::Shutdown`].

use std::fmt::{self, Display};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::events::{Event, SaveCompletedEvent, SessionActiveEvent, SessionEndedEvent};
use crate::messaging::Mailbox;
use crate::session::{DedupeCache, Session};
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::store::{AcquireError, CancelProbe, SessionStore, StoreError, StoreLease};
use crate::tree::{ReplicationScope, StateTree};
use crate::types::{EndReason, Path, SessionKey, StateMap, Value};

/// Manager-level configuration. Extracted from [`Configuration`](crate::host::Configuration) by the
/// host when it builds the manager.
#[derive(Clone)]
pub(crate) struct ManagerConfiguration {
    pub(crate) dedupe_capacity: usize,
    pub(crate) save_confirm_timeout: std::time::Duration,
}

/// Owns the lifecycle of one session per client key.
pub struct SessionManager<S: SessionStore> {
    store: S,
    config: ManagerConfiguration,
    coordinator: ShutdownCoordinator,
    mailbox: Mailbox,
    event_publisher: Option<Sender<Event>>,
}

impl<S: SessionStore> SessionManager<S> {
    pub(crate) fn new(
        store: S,
        config: ManagerConfiguration,
        coordinator: ShutdownCoordinator,
        mailbox: Mailbox,
        event_publisher: Option<Sender<Event>>,
    ) -> SessionManager<S> {
        SessionManager {
            store,
            config,
            coordinator,
            mailbox,
            event_publisher,
        }
    }

    /// Acquire a session for `key`, reconciling loaded state against `template`.
    ///
    /// Blocks while the lease is contested. Fails with [`SessionLoadError::Cancelled`] as soon as
    /// `cancel` fires, and with the other variants on store failure or malformed template; in every
    /// failure case the caller is expected to terminate the client connection with a reason
    /// distinguishable from an ordinary disconnect.
    pub fn begin_session(
        &self,
        key: SessionKey,
        template: &StateMap,
        scope: ReplicationScope,
        cancel: CancelProbe,
    ) -> Result<Session<S::Lease>, SessionLoadError> {
        if self.coordinator.phase() != ShutdownPhase::Running {
            return Err(SessionLoadError::ShuttingDown);
        }
        validate_template(template, &Path::new(Vec::new()))
            .map_err(|source| SessionLoadError::InvalidTemplate { source })?;

        let mut lease = self
            .store
            .acquire_lease(&key, &cancel)
            .map_err(|err| match err {
                AcquireError::Cancelled => SessionLoadError::Cancelled,
                AcquireError::StoreUnreachable { source } => {
                    SessionLoadError::StoreUnreachable { source }
                }
            })?;
        log::debug!("lease acquired for session {}", key);

        // The lease is already held here, so a failed load must release it before surfacing the
        // error; otherwise the key stays locked in the store with no session owning it.
        let loaded = match lease.loaded() {
            Ok(snapshot) => snapshot,
            Err(source) => {
                lease.release();
                return Err(match source {
                    source @ StoreError::CorruptSnapshot { .. } => {
                        SessionLoadError::CorruptSnapshot { source }
                    }
                    source => SessionLoadError::StoreUnreachable { source },
                });
            }
        };

        let (mut state, processed_txs) = match loaded {
            Some(snapshot) => (snapshot.state, snapshot.processed_txs),
            None => (StateMap::new(), Vec::new()),
        };
        reconcile(&mut state, template);

        let tree = StateTree::new(key, state, scope, self.event_publisher.clone());
        let dedupe = DedupeCache::restore(processed_txs, self.config.dedupe_capacity);
        let owner_handle = self.coordinator.register();
        let queued_messages = self.mailbox.drain(&key);
        let mut session = Session::new(key, tree, dedupe, lease, owner_handle, queued_messages);
        session.set_active();

        Event::publish(
            &self.event_publisher,
            Event::SessionActive(SessionActiveEvent {
                timestamp: SystemTime::now(),
                key,
            }),
        );
        Ok(session)
    }

    /// End `session` with `reason`. Idempotent: a second call on an already ending or ended session
    /// is a no-op and returns `None`. Otherwise returns the reason actually recorded, which is
    /// `EndReason::Shutdown` if the process had begun draining by the time a disconnect was
    /// finalized.
    pub fn end_session(
        &self,
        session: &mut Session<S::Lease>,
        reason: EndReason,
    ) -> Option<EndReason> {
        if !session.begin_ending() {
            log::debug!(
                "end_session called on session {} in status {}; ignoring",
                session.key(),
                session.status()
            );
            return None;
        }

        // Finalization point of the two-phase protocol: a disconnect that races the start of a
        // process shutdown is recorded as shutdown-triggered.
        let reason = if reason != EndReason::Shutdown
            && self.coordinator.phase() >= ShutdownPhase::Draining
        {
            EndReason::Shutdown
        } else {
            reason
        };

        self.final_save(session);
        session.release_lease();
        session.set_ended();
        session.ack_drain();

        Event::publish(
            &self.event_publisher,
            Event::SessionEnded(SessionEndedEvent {
                timestamp: SystemTime::now(),
                key: session.key(),
                reason,
            }),
        );
        Some(reason)
    }

    /// Trigger the final save and wait (bounded) for its durable confirmation. Best effort: a save
    /// that cannot be triggered or confirmed is logged and teardown proceeds, since holding the
    /// lease forever would be worse than losing the final delta.
    fn final_save(&self, session: &mut Session<S::Lease>) {
        let signal = session.save_signal();
        let seen = signal.observed();
        if let Err(err) = session.save() {
            log::error!("final save for session {} failed: {}", session.key(), err);
            return;
        }
        let confirmed = signal.wait_newer(seen, self.config.save_confirm_timeout);
        if confirmed > seen {
            Event::publish(
                &self.event_publisher,
                Event::SaveCompleted(SaveCompletedEvent {
                    timestamp: SystemTime::now(),
                    key: session.key(),
                    generation: confirmed,
                }),
            );
        } else {
            log::warn!(
                "final save for session {} not confirmed within {:?}; releasing lease anyway",
                session.key(),
                self.config.save_confirm_timeout
            );
        }
    }
}

/// Fill keys present in `template` but absent in `state`, recursively; never overwrite an existing
/// key. Where both sides hold a nested map, reconciliation descends; where the existing value has a
/// different kind than the template's, the existing value wins.
fn reconcile(state: &mut StateMap, template: &StateMap) {
    for (key, template_value) in template {
        match (state.get_mut(key), template_value) {
            (None, _) => {
                state.insert(key.clone(), template_value.clone());
            }
            (Some(Value::Map(existing)), Value::Map(template_inner)) => {
                reconcile(existing, template_inner)
            }
            (Some(_), _) => (),
        }
    }
}

/// A template must be addressable: every key at every depth must be a non-empty string, since an
/// empty component can never be resolved by a path.
fn validate_template(template: &StateMap, at: &Path) -> Result<(), ReconcileError> {
    for (key, value) in template {
        if key.is_empty() {
            return Err(ReconcileError::EmptyKey { path: at.clone() });
        }
        if let Value::Map(inner) = value {
            validate_template(inner, &at.child(key))?;
        }
    }
    Ok(())
}

/// Error when beginning a session. Non-retryable by this layer; the caller terminates the client
/// connection with a distinguishable reason.
#[derive(Debug)]
pub enum SessionLoadError {
    /// The requesting client disconnected before acquisition completed.
    Cancelled,
    /// The store could not be reached.
    StoreUnreachable { source: StoreError },
    /// The stored snapshot could not be deserialized.
    CorruptSnapshot { source: StoreError },
    /// The template of defaults is malformed. Fatal at process startup, not per-session.
    InvalidTemplate { source: ReconcileError },
    /// The process has begun shutting down; no new sessions are admitted.
    ShuttingDown,
}

impl Display for SessionLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionLoadError::Cancelled => {
                write!(f, "session load cancelled: client disconnected during acquisition")
            }
            SessionLoadError::StoreUnreachable { source } => {
                write!(f, "session load failed: {}", source)
            }
            SessionLoadError::CorruptSnapshot { source } => {
                write!(f, "session load failed: {}", source)
            }
            SessionLoadError::InvalidTemplate { source } => {
                write!(f, "session load failed: {}", source)
            }
            SessionLoadError::ShuttingDown => {
                write!(f, "session load refused: process is shutting down")
            }
        }
    }
}

/// Error in the template of defaults.
#[derive(Debug)]
pub enum ReconcileError {
    /// The template contains an empty key name at the given path.
    EmptyKey { path: Path },
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::EmptyKey { path } => {
                write!(f, "malformed template: empty key name under path \"{}\"", path)
            }
        }
    }
}
