/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The boundary to the external cross-node message channel.
//!
//! Transport is not implemented here. Library users provide a [`MessageChannel`]: best-effort,
//! persistently queued delivery of opaque payloads to a session key, including keys whose session is
//! currently closed. Payloads queued for a key are handed to this process through the [`Mailbox`],
//! and the [session manager](crate::manager) drains them into the session on its next activation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::SessionKey;

/// Best-effort cross-node payload delivery, keyed by session. `send_message` reports whether the
/// payload was accepted for queued delivery, not whether it arrived.
pub trait MessageChannel: Clone + Send + 'static {
    fn send_message(&self, key: &SessionKey, payload: Vec<u8>) -> bool;
}

/// The local drain point for payloads the channel has delivered to this process. The channel
/// implementation enqueues; the session manager drains on session activation.
#[derive(Clone)]
pub struct Mailbox {
    queues: Arc<Mutex<HashMap<SessionKey, Vec<Vec<u8>>>>>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue a payload for `key`. Called by the channel implementation; payloads survive here until
    /// the key's session next activates, even if it is currently closed.
    pub fn enqueue(&self, key: SessionKey, payload: Vec<u8>) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(key).or_default().push(payload);
    }

    /// Remove and return everything queued for `key`, in arrival order.
    pub(crate) fn drain(&self, key: &SessionKey) -> Vec<Vec<u8>> {
        let mut queues = self.queues.lock().unwrap();
        queues.remove(key).unwrap_or_default()
    }
}

impl Default for Mailbox {
    fn default() -> Mailbox {
        Mailbox::new()
    }
}
