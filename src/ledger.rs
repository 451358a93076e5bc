/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Transaction Ledger: idempotent, durably confirmed processing of redeliverable external
//! events.
//!
//! The upstream channel delivers monetary/transaction events at least once: anything not
//! acknowledged is redelivered. [`TransactionLedger::process_transaction`] turns that into
//! effectively-exactly-once processing of each transaction id against a session, by recording
//! processed ids in the session's [dedupe cache](crate::session::DedupeCache) and only returning
//! [`Verdict::Granted`] once the record is durably saved.
//!
//! ## The `effect` contract
//!
//! `Granted` promises that the transaction's effect was applied and its id durably recorded: it is
//! safe for the caller to acknowledge the upstream delivery. The converse does not hold perfectly:
//! if the process crashes strictly between applying `effect` and persisting the cache entry, the
//! redelivered transaction will run `effect` again. The ledger therefore guarantees
//! at-least-once-application, not exactly-once — **`effect` functions must themselves be idempotent
//! or side-effect-tolerant of at-most-double application.**
//!
//! The same boundary applies to dedupe-cache eviction: once an id has been evicted (capacity
//! overflow), a redelivery of it will run `effect` again. Capacity should comfortably exceed the
//! upstream channel's redelivery horizon.

use std::fmt::{self, Display};
use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::events::{
    Event, SaveCompletedEvent, TransactionDeferredEvent, TransactionGrantedEvent,
};
use crate::session::Session;
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::store::StoreLease;
use crate::tree::{StateTree, TreeError};
use crate::types::TxId;

/// The outcome of processing one transaction delivery.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// The effect is applied and the id durably recorded. The caller should acknowledge the
    /// upstream delivery.
    Granted,
    /// Nothing to acknowledge. The caller relies on upstream redelivery once the key's session is
    /// next active.
    NotProcessed,
}

/// Per-process transaction processor. Holds no per-session state; sessions are passed in by their
/// owner, which serializes all processing for a given session.
pub struct TransactionLedger {
    save_confirm_timeout: Duration,
    coordinator: ShutdownCoordinator,
    event_publisher: Option<Sender<Event>>,
}

impl TransactionLedger {
    pub(crate) fn new(
        save_confirm_timeout: Duration,
        coordinator: ShutdownCoordinator,
        event_publisher: Option<Sender<Event>>,
    ) -> TransactionLedger {
        TransactionLedger {
            save_confirm_timeout,
            coordinator,
            event_publisher,
        }
    }

    /// Process one delivery of the transaction identified by `tx_id` against `session`.
    ///
    /// - Returns `NotProcessed` without invoking `effect` if the session is not `Active`, or if the
    ///   session stops admitting work (teardown, or the process draining) before the dedupe record
    ///   is durably confirmed.
    /// - Invokes `effect` exactly once per unseen id. A failing `effect` propagates as
    ///   [`LedgerError::EffectFailed`] and leaves the dedupe cache untouched, so the redelivered
    ///   transaction retries cleanly.
    /// - Returns `Granted` only once the id is present in a durably saved snapshot.
    pub fn process_transaction<L, F>(
        &self,
        session: &mut Session<L>,
        tx_id: TxId,
        effect: F,
    ) -> Result<Verdict, LedgerError>
    where
        L: StoreLease,
        F: FnOnce(&mut StateTree) -> Result<(), EffectError>,
    {
        if !self.admitting(session) {
            return Ok(self.defer(session, tx_id));
        }

        if session.dedupe_cache().contains(&tx_id) {
            if self.durably_recorded(session, &tx_id) {
                // The redelivery raced a delivery that already completed; re-acknowledge without
                // touching the effect.
                return Ok(self.grant(session, tx_id));
            }
            // Seen, but the save that would record it is still pending. Confirm without
            // re-invoking the effect.
        } else {
            effect(session.tree_mut().map_err(|_| LedgerError::SessionClosed)?)
                .map_err(|source| LedgerError::EffectFailed { source })?;
            session.dedupe_cache_mut().record(tx_id.clone());
        }

        self.confirm_durable(session, tx_id)
    }

    /// Trigger saves and wait on the lease's save signal until the saved
    /// snapshot contains `tx_id`, the session stops admitting work, or each wait's timeout paces
    /// another retry.
    fn confirm_durable<L: StoreLease>(
        &self,
        session: &mut Session<L>,
        tx_id: TxId,
    ) -> Result<Verdict, LedgerError> {
        let signal = session.save_signal();
        loop {
            if !self.admitting(session) {
                return Ok(self.defer(session, tx_id));
            }
            if self.durably_recorded(session, &tx_id) {
                Event::publish(
                    &self.event_publisher,
                    Event::SaveCompleted(SaveCompletedEvent {
                        timestamp: SystemTime::now(),
                        key: session.key(),
                        generation: signal.observed(),
                    }),
                );
                return Ok(self.grant(session, tx_id));
            }
            let seen = signal.observed();
            if let Err(err) = session.save() {
                // Transient per the store contract; the wait below paces the retry.
                log::warn!(
                    "save for session {} could not be triggered ({}); retrying",
                    session.key(),
                    err
                );
            }
            signal.wait_newer(seen, self.save_confirm_timeout);
        }
    }

    /// Whether `session` still admits transaction work: it is `Active` and the process has not
    /// begun draining. The drain phase is the cross-context signal that every session is about to
    /// leave `Active`; deferring immediately hands the transaction back to upstream redelivery.
    fn admitting<L: StoreLease>(&self, session: &Session<L>) -> bool {
        session.status().is_active() && self.coordinator.phase() == ShutdownPhase::Running
    }

    fn durably_recorded<L: StoreLease>(&self, session: &Session<L>, tx_id: &TxId) -> bool {
        session
            .last_saved()
            .map_or(false, |snapshot| snapshot.contains_tx(tx_id))
    }

    fn grant<L: StoreLease>(&self, session: &Session<L>, tx_id: TxId) -> Verdict {
        Event::publish(
            &self.event_publisher,
            Event::TransactionGranted(TransactionGrantedEvent {
                timestamp: SystemTime::now(),
                key: session.key(),
                tx_id,
            }),
        );
        Verdict::Granted
    }

    fn defer<L: StoreLease>(&self, session: &Session<L>, tx_id: TxId) -> Verdict {
        Event::publish(
            &self.event_publisher,
            Event::TransactionDeferred(TransactionDeferredEvent {
                timestamp: SystemTime::now(),
                key: session.key(),
                tx_id,
            }),
        );
        Verdict::NotProcessed
    }
}

/// Failure reported by an `effect` callback. The transaction is left unacknowledged and not added
/// to the dedupe cache; upstream redelivery retries it cleanly.
#[derive(Debug)]
pub struct EffectError {
    pub detail: String,
}

impl EffectError {
    pub fn new<S: Into<String>>(detail: S) -> EffectError {
        EffectError {
            detail: detail.into(),
        }
    }
}

impl Display for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction effect failed: {}", self.detail)
    }
}

impl From<TreeError> for EffectError {
    fn from(err: TreeError) -> EffectError {
        EffectError::new(err.to_string())
    }
}

/// Error when processing a transaction.
#[derive(Debug)]
pub enum LedgerError {
    /// The `effect` callback failed. Safe to redeliver.
    EffectFailed { source: EffectError },
    /// The session closed between the admission check and the effect. Safe to redeliver.
    SessionClosed,
}

impl Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::EffectFailed { source } => write!(f, "{}", source),
            LedgerError::SessionClosed => {
                write!(f, "transaction not processed: session closed during processing")
            }
        }
    }
}
