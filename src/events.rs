//! Definitions of sessionkeeper events for event handling and logging.
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::tree::ReplicationScope;
use crate::types::{EndReason, Path, SessionKey, TxId, Value};

pub enum Event {
    // Session lifecycle events.
    SessionActive(SessionActiveEvent),
    SessionEnded(SessionEndedEvent),
    // State tree events. Consumed by the replication sink.
    StateChanged(StateChangedEvent),
    // Transaction ledger events.
    TransactionGranted(TransactionGrantedEvent),
    TransactionDeferred(TransactionDeferredEvent),
    // Persistence events.
    SaveCompleted(SaveCompletedEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            event_publisher.send(event).unwrap()
        }
    }
}

pub struct SessionActiveEvent {
    pub timestamp: SystemTime,
    pub key: SessionKey,
}

pub struct SessionEndedEvent {
    pub timestamp: SystemTime,
    pub key: SessionKey,
    pub reason: EndReason,
}

/// Fired once per successful `set`/`increment`/`decrement` on a session's state tree. Carries the
/// tree's replication scope so that the sink can decide which observers receive the update.
pub struct StateChangedEvent {
    pub timestamp: SystemTime,
    pub key: SessionKey,
    pub scope: ReplicationScope,
    pub path: Path,
    pub new_value: Value,
    pub old_value: Value,
}

pub struct TransactionGrantedEvent {
    pub timestamp: SystemTime,
    pub key: SessionKey,
    pub tx_id: TxId,
}

/// Fired when `process_transaction` returned `NotProcessed`: the upstream channel is expected to
/// redeliver the transaction later.
pub struct TransactionDeferredEvent {
    pub timestamp: SystemTime,
    pub key: SessionKey,
    pub tx_id: TxId,
}

pub struct SaveCompletedEvent {
    pub timestamp: SystemTime,
    pub key: SessionKey,
    pub generation: u64,
}
