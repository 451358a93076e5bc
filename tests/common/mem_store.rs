//! A simple, volatile, in-memory implementation of [`SessionStore`] with controllable failure
//! modes.
//!
//! Durable writes are simulated by a short-lived writer thread per save, delayed by a configurable
//! latency, so the asynchronous save-confirmation path through [`SaveSignal`] is exercised for
//! real. Leases are arbitrated by a shared set of held keys; acquiring a held key blocks and
//! retries exactly like a store backed by optimistic leasing would.
//!
//! Knobs:
//! - [`MemStore::set_save_latency`]: delay between triggering a save and its durable confirmation.
//! - [`MemStore::set_saves_failing`]: make `save` return `StoreError::Unavailable`.
//! - [`MemStore::set_loads_corrupt`]: make `loaded` return `StoreError::CorruptSnapshot`.
//! - [`MemStore::set_unreachable`]: make lease acquisition fail outright.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sessionkeeper::store::{
    contested_retry_interval, AcquireError, CancelProbe, SaveSignal, SessionStore, StoreError,
    StoreLease,
};
use sessionkeeper::types::{SessionKey, SessionSnapshot};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

struct MemStoreInner {
    records: Mutex<HashMap<SessionKey, SessionSnapshot>>,
    held: Mutex<HashSet<SessionKey>>,
    save_latency: Mutex<Duration>,
    saves_failing: AtomicBool,
    loads_corrupt: AtomicBool,
    unreachable: AtomicBool,
}

/// An in-memory implementation of [`SessionStore`].
#[derive(Clone)]
pub(crate) struct MemStore(Arc<MemStoreInner>);

impl MemStore {
    pub(crate) fn new() -> MemStore {
        MemStore(Arc::new(MemStoreInner {
            records: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            save_latency: Mutex::new(Duration::from_millis(5)),
            saves_failing: AtomicBool::new(false),
            loads_corrupt: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }))
    }

    pub(crate) fn set_save_latency(&self, latency: Duration) {
        *self.0.save_latency.lock().unwrap() = latency;
    }

    pub(crate) fn set_saves_failing(&self, failing: bool) {
        self.0.saves_failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_loads_corrupt(&self, corrupt: bool) {
        self.0.loads_corrupt.store(corrupt, Ordering::SeqCst);
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.0.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The durably stored snapshot for `key`, as a store administrator would read it.
    pub(crate) fn durable_record(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        self.0.records.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn is_held(&self, key: &SessionKey) -> bool {
        self.0.held.lock().unwrap().contains(key)
    }
}

impl SessionStore for MemStore {
    type Lease = MemLease;

    fn acquire_lease(
        &self,
        key: &SessionKey,
        cancel: &CancelProbe,
    ) -> Result<MemLease, AcquireError> {
        if self.0.unreachable.load(Ordering::SeqCst) {
            return Err(AcquireError::StoreUnreachable {
                source: StoreError::Unavailable {
                    detail: "mem store marked unreachable".to_string(),
                },
            });
        }
        loop {
            if cancel.fired() {
                return Err(AcquireError::Cancelled);
            }
            {
                let mut held = self.0.held.lock().unwrap();
                if !held.contains(key) {
                    held.insert(*key);
                    break;
                }
            }
            thread::sleep(contested_retry_interval(RETRY_INTERVAL));
        }

        let loaded = self.0.records.lock().unwrap().get(key).cloned();
        Ok(MemLease {
            store: self.0.clone(),
            key: *key,
            loaded: loaded.clone(),
            last_saved: Arc::new(Mutex::new(loaded)),
            signal: SaveSignal::new(),
            released: false,
        })
    }
}

pub(crate) struct MemLease {
    store: Arc<MemStoreInner>,
    key: SessionKey,
    loaded: Option<SessionSnapshot>,
    last_saved: Arc<Mutex<Option<SessionSnapshot>>>,
    signal: SaveSignal,
    released: bool,
}

impl StoreLease for MemLease {
    fn loaded(&self) -> Result<Option<SessionSnapshot>, StoreError> {
        if self.store.loads_corrupt.load(Ordering::SeqCst) {
            return Err(StoreError::CorruptSnapshot {
                source: io::Error::new(io::ErrorKind::InvalidData, "unknown value kind tag: 9"),
            });
        }
        Ok(self.loaded.clone())
    }

    fn save(&mut self, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        if self.store.saves_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                detail: "mem store saves failing".to_string(),
            });
        }
        let store = self.store.clone();
        let key = self.key;
        let snapshot = snapshot.clone();
        let last_saved = self.last_saved.clone();
        let signal = self.signal.clone();
        let latency = *self.store.save_latency.lock().unwrap();
        thread::spawn(move || {
            thread::sleep(latency);
            store.records.lock().unwrap().insert(key, snapshot.clone());
            *last_saved.lock().unwrap() = Some(snapshot);
            signal.notify();
        });
        Ok(())
    }

    fn last_saved(&self) -> Option<SessionSnapshot> {
        self.last_saved.lock().unwrap().clone()
    }

    fn save_signal(&self) -> SaveSignal {
        self.signal.clone()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.store.held.lock().unwrap().remove(&self.key);
    }
}
