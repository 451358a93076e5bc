/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! SessionKeeper manages authoritative, per-client session state backed by a remote durable store,
//! exposes a live replicated view of that state to interested observers, and processes
//! externally-delivered transaction events effectively-exactly-once despite an at-least-once
//! delivery guarantee from the upstream channel.
//!
//! ## Subsystems
//!
//! - The [session manager](manager): acquires a store lease per client key, reconciles loaded state
//!   against a template of defaults, and tears sessions down through the [two-phase shutdown
//!   protocol](shutdown).
//! - The [replicated state tree](tree): path-addressed mutable state with change notification and
//!   scoped visibility.
//! - The [transaction ledger](ledger): idempotent, durably-confirmed processing of redeliverable
//!   external events.
//!
//! Durable storage and cross-node transport are not implemented here; library users plug them in
//! through the traits in [store] and [messaging]. A host is assembled and started through the
//! builder in [host].
//!
//! ## Concurrency model
//!
//! Each session is an independent unit of concurrent work; many sessions run in parallel with no
//! cross-session locking beyond the store's own per-key lease arbitration. Within one session a
//! single-writer discipline applies: all mutations of that session's tree and all
//! `process_transaction` calls for it must be serialized through one logical execution context —
//! the [`Session`](session::Session) API takes `&mut self` and the library adds no internal mutual
//! exclusion within a session.

pub mod types;

pub mod store;

pub mod tree;

pub mod session;

pub mod manager;

pub mod ledger;

pub mod shutdown;

pub mod messaging;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod host;
