/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and tear down a sessionkeeper host.
//!
//! A 'host' is one process's instance of the session system: the [session
//! manager](crate::manager::SessionManager), the [transaction
//! ledger](crate::ledger::TransactionLedger), the [mailbox](crate::messaging::Mailbox), the
//! [shutdown coordinator](crate::shutdown::ShutdownCoordinator), and (if any event handler is
//! registered) the event bus thread that dispatches [events](crate::events) to user handlers and
//! loggers.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the host](HostSpec) with:
//!   1. `HostSpec::builder` to construct a `HostSpecBuilder`,
//!   2. The setters of the `HostSpecBuilder`, and
//!   3. The `HostSpecBuilder::build` method to construct a [HostSpec],
//! - The function to [start](HostSpec::start) a [Host] given its specification,
//! - [The type](Host) which keeps the host alive.
//!
//! ## Starting a host
//!
//! ```ignore
//! let host = HostSpec::builder()
//!     .store(store)
//!     .messages(channel)
//!     .configuration(configuration)
//!     .on_session_ended(ended_handler)
//!     .build()
//!     .start();
//!
//! let manager = host.session_manager();
//! ```
//!
//! ### Required setters
//!
//! - `.store(...)` — the [SessionStore](crate::store::SessionStore) implementation.
//! - `.messages(...)` — the [MessageChannel](crate::messaging::MessageChannel) implementation.
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! - `.mailbox(...)` — pass a pre-built [Mailbox](crate::messaging::Mailbox) if the message channel
//!   implementation needs it before the host exists.
//!
//! The rest register user-defined handlers for events from [crate::events]:
//! - `.on_session_active(...)`
//! - `.on_session_ended(...)`
//! - `.on_state_changed(...)`
//! - `.on_transaction_granted(...)`
//! - `.on_transaction_deferred(...)`
//! - `.on_save_completed(...)`

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::ledger::TransactionLedger;
use crate::manager::{ManagerConfiguration, SessionManager};
use crate::messaging::{Mailbox, MessageChannel};
use crate::shutdown::ShutdownCoordinator;
use crate::store::SessionStore;
use crate::types::SessionKey;

/// Stores the user-defined parameters required to run the host.
///
/// ## Save confirmation timeout
///
/// Bounds each wait on the store's save-completion signal in the [transaction
/// ledger](crate::ledger) and in session teardown. The ledger re-checks and waits again while the
/// session remains active, so this paces retries rather than capping total time.
///
/// ## Log Events
///
/// SessionKeeper logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.log_events(...)`

    Defaulted:
    - `.dedupe_capacity(...)` (default 100)
    - `.save_confirm_timeout(...)` (default 10 seconds)
    - `.drain_timeout(...)` (default 30 seconds)
"))]
pub struct Configuration {
    #[builder(default = 100, setter(doc = "Set the capacity of each session's dedupe cache. Defaults to 100."))]
    pub dedupe_capacity: usize,
    #[builder(default = Duration::from_secs(10), setter(doc = "Set the bound on each wait for a save-completion signal. Defaults to 10 seconds."))]
    pub save_confirm_timeout: Duration,
    #[builder(default = Duration::from_secs(30), setter(doc = "Set how long shutdown waits for session owners to acknowledge the drain. Defaults to 30 seconds."))]
    pub drain_timeout: Duration,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run a [Host].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [HostSpec]. On the builder call the following methods to construct a valid [HostSpec].

    Required:
    - `.store(...)`
    - `.messages(...)`
    - `.configuration(...)`

    Optional:
    - `.mailbox(...)`
    - `.on_session_active(...)`
    - `.on_session_ended(...)`
    - `.on_state_changed(...)`
    - `.on_transaction_granted(...)`
    - `.on_transaction_deferred(...)`
    - `.on_save_completed(...)`
"))]
pub struct HostSpec<S: SessionStore, M: MessageChannel> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of durable session storage. The argument must implement the [SessionStore](crate::store::SessionStore) trait. Required."))]
    store: S,
    #[builder(setter(doc = "Set the implementation of the cross-node message channel. The argument must implement the [MessageChannel](crate::messaging::MessageChannel) trait. Required."))]
    messages: M,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a host. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default = Mailbox::new(), setter(doc = "Set the [Mailbox](crate::messaging::Mailbox) the message channel delivers into. Defaults to a fresh one; pass a pre-built mailbox if the channel implementation needs it before the host exists. Optional."))]
    mailbox: Mailbox,
    #[builder(default, setter(transform = |handler: impl Fn(&SessionActiveEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SessionActiveEvent>),
    doc = "Register a handler closure to be invoked after a session becomes active. Optional."))]
    on_session_active: Option<HandlerPtr<SessionActiveEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SessionEndedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SessionEndedEvent>),
    doc = "Register a handler closure to be invoked after a session is ended, with the recorded reason. Optional."))]
    on_session_ended: Option<HandlerPtr<SessionEndedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StateChangedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StateChangedEvent>),
    doc = "Register a handler closure to be invoked after a session's state tree changes. This is where a replication sink attaches. Optional."))]
    on_state_changed: Option<HandlerPtr<StateChangedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TransactionGrantedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TransactionGrantedEvent>),
    doc = "Register a handler closure to be invoked after a transaction is granted. Optional."))]
    on_transaction_granted: Option<HandlerPtr<TransactionGrantedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TransactionDeferredEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TransactionDeferredEvent>),
    doc = "Register a handler closure to be invoked after a transaction is deferred to upstream redelivery. Optional."))]
    on_transaction_deferred: Option<HandlerPtr<TransactionDeferredEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SaveCompletedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SaveCompletedEvent>),
    doc = "Register a handler closure to be invoked after a durable save is observed complete. Optional."))]
    on_save_completed: Option<HandlerPtr<SaveCompletedEvent>>,
}

impl<S: SessionStore, M: MessageChannel> HostSpec<S, M> {
    /// Starts the threads and channels associated with running a host, and returns the handles to
    /// them in a [Host] struct.
    pub fn start(self) -> Host<S, M> {
        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_session_active,
            self.on_session_ended,
            self.on_state_changed,
            self.on_transaction_granted,
            self.on_transaction_deferred,
            self.on_save_completed,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let event_bus = if !event_handlers.is_empty() {
            Some(start_event_bus(
                event_handlers,
                event_subscriber.unwrap(), // Safety: should be Some(...).
                event_bus_shutdown_receiver.unwrap(), // Safety: should be Some(...).
            ))
        } else {
            None
        };

        let coordinator = ShutdownCoordinator::new();
        let mailbox = self.mailbox;

        let session_manager = SessionManager::new(
            self.store,
            ManagerConfiguration {
                dedupe_capacity: self.configuration.dedupe_capacity,
                save_confirm_timeout: self.configuration.save_confirm_timeout,
            },
            coordinator.clone(),
            mailbox.clone(),
            event_publisher.clone(),
        );

        let ledger = TransactionLedger::new(
            self.configuration.save_confirm_timeout,
            coordinator.clone(),
            event_publisher,
        );

        Host {
            session_manager,
            ledger,
            mailbox,
            messages: self.messages,
            coordinator,
            drain_timeout: self.configuration.drain_timeout,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to a running sessionkeeper host. When this value is dropped, the two-phase shutdown
/// protocol runs and the background event bus thread is gracefully shut down.
pub struct Host<S: SessionStore, M: MessageChannel> {
    session_manager: SessionManager<S>,
    ledger: TransactionLedger,
    mailbox: Mailbox,
    messages: M,
    coordinator: ShutdownCoordinator,
    drain_timeout: Duration,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<S: SessionStore, M: MessageChannel> Host<S, M> {
    pub fn session_manager(&self) -> &SessionManager<S> {
        &self.session_manager
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    /// The drain point the message channel implementation delivers into.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Send a payload to a session key through the external channel. Best effort; queued for
    /// delivery even if the target session is currently closed.
    pub fn send_message(&self, key: &SessionKey, payload: Vec<u8>) -> bool {
        self.messages.send_message(key, payload)
    }

    /// The process-wide shutdown coordinator. Session owners observe it to learn when to stop
    /// admitting work and end their sessions.
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        self.coordinator.clone()
    }

    /// Run the two-phase shutdown protocol: broadcast the drain, wait (bounded) for session owners
    /// to acknowledge, then terminate. Idempotent; also run on drop.
    pub fn begin_shutdown(&self) {
        self.coordinator.begin_shutdown(self.drain_timeout);
    }
}

impl<S: SessionStore, M: MessageChannel> Drop for Host<S, M> {
    fn drop(&mut self) {
        // Sessions finalize (and publish their last events) during the drain, so the event bus must
        // outlive the shutdown broadcast.
        self.begin_shutdown();

        self.event_bus_shutdown
            .iter()
            .for_each(|shutdown| shutdown.send(()).unwrap());
        if self.event_bus.is_some() {
            self.event_bus.take().unwrap().join().unwrap();
        }
    }
}
