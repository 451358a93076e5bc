/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the host's
//! [config](crate::host::Configuration).
//!
//! SessionKeeper logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The first seven characters of the Base64 encoding of the session key the event concerns.
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [StateChanged](crate::events::StateChangedEvent) is printed:
//!
//! ```text
//! StateChanged, 1701329264, Id5u7f6, Cash, Int(50), Int(0)
//! ```

use std::time::SystemTime;

use log;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const SESSION_ACTIVE: &str = "SessionActive";
pub const SESSION_ENDED: &str = "SessionEnded";

pub const STATE_CHANGED: &str = "StateChanged";

pub const TRANSACTION_GRANTED: &str = "TransactionGranted";
pub const TRANSACTION_DEFERRED: &str = "TransactionDeferred";

pub const SAVE_COMPLETED: &str = "SaveCompleted";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for SessionActiveEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |session_active_event: &SessionActiveEvent| {
            log::info!(
                "{}, {}, {}",
                SESSION_ACTIVE,
                secs_since_unix_epoch(session_active_event.timestamp),
                session_active_event.key
            )
        };
        Box::new(logger)
    }
}

impl Logger for SessionEndedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |session_ended_event: &SessionEndedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SESSION_ENDED,
                secs_since_unix_epoch(session_ended_event.timestamp),
                session_ended_event.key,
                session_ended_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for StateChangedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |state_changed_event: &StateChangedEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}, {:?}",
                STATE_CHANGED,
                secs_since_unix_epoch(state_changed_event.timestamp),
                state_changed_event.key,
                state_changed_event.path,
                state_changed_event.new_value,
                state_changed_event.old_value
            )
        };
        Box::new(logger)
    }
}

impl Logger for TransactionGrantedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |transaction_granted_event: &TransactionGrantedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                TRANSACTION_GRANTED,
                secs_since_unix_epoch(transaction_granted_event.timestamp),
                transaction_granted_event.key,
                transaction_granted_event.tx_id
            )
        };
        Box::new(logger)
    }
}

impl Logger for TransactionDeferredEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |transaction_deferred_event: &TransactionDeferredEvent| {
            log::info!(
                "{}, {}, {}, {}",
                TRANSACTION_DEFERRED,
                secs_since_unix_epoch(transaction_deferred_event.timestamp),
                transaction_deferred_event.key,
                transaction_deferred_event.tx_id
            )
        };
        Box::new(logger)
    }
}

impl Logger for SaveCompletedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |save_completed_event: &SaveCompletedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SAVE_COMPLETED,
                secs_since_unix_epoch(save_completed_event.timestamp),
                save_completed_event.key,
                save_completed_event.generation
            )
        };
        Box::new(logger)
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occurred before the Unix Epoch.")
        .as_secs()
}
