/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Replicated State Tree: path-addressed mutable state with change notification and scoped
//! visibility.
//!
//! A [`StateTree`] wraps the [`StateMap`] loaded for a session and is the only way session state is
//! read or mutated after activation. Every successful mutation:
//! 1. notifies local [subscribers](StateTree::subscribe) whose registered path is a prefix of the
//!    mutated path, with the new and the old value,
//! 2. publishes a [`StateChangedEvent`](crate::events::StateChangedEvent) carrying the tree's
//!    [`ReplicationScope`], which the replication sink uses to decide which remote observers receive
//!    the update, and
//! 3. marks the tree dirty so the owning session's next save cycle picks the change up.
//!
//! ## No implicit key creation
//!
//! `set` never creates a path: it may only mutate a key that already exists somewhere in the tree.
//! A multi-key path is resolved fully qualified, each component matched exactly. A single-key path is
//! resolved by a depth-first search that returns the first matching key name regardless of nesting
//! depth; when the match lands below the root, a warning names the fully qualified path that was
//! actually mutated, since duplicate key names at different depths make the single-key form
//! ambiguous.
//!
//! ## Single-writer discipline
//!
//! The tree provides no internal mutual exclusion for concurrent writers. All mutations of one
//! session's tree are expected to be serialized through that session's one logical execution
//! context; see the crate-level documentation.

use std::fmt::{self, Display};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::events::{Event, StateChangedEvent};
use crate::types::{Path, SessionKey, StateMap, Value};

/// Opaque visibility tag attached to a tree at creation. The replication sink uses it to decide
/// which observers receive which tree's updates; this library only carries it on change events.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ReplicationScope {
    /// Replicated to every connected observer.
    Everyone,
    /// Replicated only to the session's owning client.
    OwnerOnly,
    /// Replicated to observers holding the given tag.
    Tagged(String),
}

/// Handle returned by [`StateTree::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

pub(crate) type SubscriberPtr = Arc<dyn Fn(&Path, &Value, &Value) + Send + Sync>;

struct SubscriberTable {
    next_id: u64,
    entries: Vec<(SubscriptionId, Path, SubscriberPtr)>,
}

/// A cloneable handle onto a tree's subscriber table. Lets a handler unsubscribe (itself or another
/// subscription) without holding a reference to the tree, which the single-writer discipline makes
/// impossible from inside a handler.
#[derive(Clone)]
pub struct Subscriptions {
    table: Arc<Mutex<SubscriberTable>>,
}

impl Subscriptions {
    /// Register `handler` to be invoked with `(path, new_value, old_value)` on every change whose
    /// path has `prefix` as a prefix.
    pub fn subscribe<F: Fn(&Path, &Value, &Value) + Send + Sync + 'static>(
        &self,
        prefix: Path,
        handler: F,
    ) -> SubscriptionId {
        let mut table = self.table.lock().unwrap();
        let id = SubscriptionId(table.next_id);
        table.next_id += 1;
        table.entries.push((id, prefix, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Safe to call from inside a handler: registration is re-checked
    /// before each handler invocation, so a removed handler receives no further deliveries, not
    /// even later handlers of the delivery that removed it.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut table = self.table.lock().unwrap();
        table.entries.retain(|(entry_id, _, _)| *entry_id != id);
    }

    fn contains(&self, id: SubscriptionId) -> bool {
        let table = self.table.lock().unwrap();
        table.entries.iter().any(|(entry_id, _, _)| *entry_id == id)
    }

    fn matching(&self, path: &Path) -> Vec<(SubscriptionId, SubscriberPtr)> {
        let table = self.table.lock().unwrap();
        table
            .entries
            .iter()
            .filter(|(_, prefix, _)| prefix.is_prefix_of(path))
            .map(|(id, _, handler)| (*id, handler.clone()))
            .collect()
    }
}

/// Path-addressed mutable session state, mirrored to remote observers.
pub struct StateTree {
    key: SessionKey,
    scope: ReplicationScope,
    root: StateMap,
    subscribers: Subscriptions,
    dirty: bool,
    event_publisher: Option<Sender<Event>>,
}

impl StateTree {
    pub(crate) fn new(
        key: SessionKey,
        root: StateMap,
        scope: ReplicationScope,
        event_publisher: Option<Sender<Event>>,
    ) -> StateTree {
        StateTree {
            key,
            scope,
            root,
            subscribers: Subscriptions {
                table: Arc::new(Mutex::new(SubscriberTable {
                    next_id: 0,
                    entries: Vec::new(),
                })),
            },
            dirty: false,
            event_publisher,
        }
    }

    pub fn scope(&self) -> &ReplicationScope {
        &self.scope
    }

    /// The current state map. Read-only; mutation goes through [`set`](StateTree::set) and friends
    /// so that change notification and the dirty flag stay correct.
    pub fn root(&self) -> &StateMap {
        &self.root
    }

    /// Read the value at `path`.
    pub fn get(&self, path: &Path) -> Result<Value, TreeError> {
        let resolved = self.resolve(path)?;
        Ok(value_at(&self.root, resolved.keys())
            .expect("resolve returned a path that is no longer present")
            .clone())
    }

    /// Replace the value at `path`. Never creates a key: if `path` does not resolve to an existing
    /// key the tree is left unchanged and `TreeError::NotFound` is returned.
    pub fn set(&mut self, path: &Path, value: Value) -> Result<(), TreeError> {
        let resolved = self.resolve(path)?;
        let slot = value_at_mut(&mut self.root, resolved.keys())
            .expect("resolve returned a path that is no longer present");
        let old_value = std::mem::replace(slot, value.clone());
        self.dirty = true;
        self.notify_subscribers(&resolved, &value, &old_value);
        Event::publish(
            &self.event_publisher,
            Event::StateChanged(StateChangedEvent {
                timestamp: SystemTime::now(),
                key: self.key,
                scope: self.scope.clone(),
                path: resolved,
                new_value: value,
                old_value,
            }),
        );
        Ok(())
    }

    /// Add `delta` to the integer at `path`. The result is floored at zero: a sum that would go
    /// negative stores 0 instead. This is a domain policy baked into the primitive and is not
    /// overridable per call.
    pub fn increment(&mut self, path: &Path, delta: i64) -> Result<(), TreeError> {
        self.add_clamped(path, delta)
    }

    /// Subtract `delta` from the integer at `path`, flooring the result at zero.
    pub fn decrement(&mut self, path: &Path, delta: i64) -> Result<(), TreeError> {
        // i64::MIN has no negation; saturate instead of overflowing.
        self.add_clamped(path, delta.checked_neg().unwrap_or(i64::MAX))
    }

    fn add_clamped(&mut self, path: &Path, delta: i64) -> Result<(), TreeError> {
        let current = self.get(path)?;
        let current = current.as_int().ok_or(TreeError::WrongKind {
            path: path.clone(),
        })?;
        let next = current.saturating_add(delta).max(0);
        self.set(path, Value::Int(next))
    }

    /// Register `handler` to be invoked with `(path, new_value, old_value)` on every change whose
    /// path has `prefix` as a prefix. Registering on the empty path observes every change.
    pub fn subscribe<F: Fn(&Path, &Value, &Value) + Send + Sync + 'static>(
        &self,
        prefix: Path,
        handler: F,
    ) -> SubscriptionId {
        self.subscribers.subscribe(prefix, handler)
    }

    /// Remove a subscription. Safe to call from inside a handler; see [`Subscriptions::unsubscribe`].
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.unsubscribe(id)
    }

    /// A cloneable handle onto this tree's subscriber table.
    pub fn subscriptions(&self) -> Subscriptions {
        self.subscribers.clone()
    }

    /// Whether the tree has been mutated since the flag was last taken. Consumed by the owning
    /// session's save cycle.
    pub(crate) fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn notify_subscribers(&self, path: &Path, new_value: &Value, old_value: &Value) {
        // Snapshot matching subscribers before invoking any: handlers may subscribe or unsubscribe,
        // and the table lock must not be held across handler invocations.
        for (id, handler) in self.subscribers.matching(path) {
            if self.subscribers.contains(id) {
                handler(path, new_value, old_value)
            }
        }
    }

    /// Resolve `path` to the fully qualified path of an existing key, per the module-level rules.
    fn resolve(&self, path: &Path) -> Result<Path, TreeError> {
        if path.is_empty() {
            return Err(TreeError::NotFound { path: path.clone() });
        }
        if path.len() > 1 {
            return if value_at(&self.root, path.keys()).is_some() {
                Ok(path.clone())
            } else {
                Err(TreeError::NotFound { path: path.clone() })
            };
        }
        let target = &path.keys()[0];
        match dfs_locate(&self.root, target, Path::new(Vec::new())) {
            Some(found) => {
                if found.len() > 1 {
                    log::warn!(
                        "state tree key name {} resolved below the root, to {}; use a fully \
                         qualified path if another key of the same name exists elsewhere",
                        target,
                        found
                    );
                }
                Ok(found)
            }
            None => Err(TreeError::NotFound { path: path.clone() }),
        }
    }
}

/// Walk `keys` down from `map`, matching each component exactly.
fn value_at<'a>(map: &'a StateMap, keys: &[String]) -> Option<&'a Value> {
    let (first, rest) = keys.split_first()?;
    let value = map.get(first)?;
    if rest.is_empty() {
        Some(value)
    } else {
        match value {
            Value::Map(inner) => value_at(inner, rest),
            _ => None,
        }
    }
}

fn value_at_mut<'a>(map: &'a mut StateMap, keys: &[String]) -> Option<&'a mut Value> {
    let (first, rest) = keys.split_first()?;
    let value = map.get_mut(first)?;
    if rest.is_empty() {
        Some(value)
    } else {
        match value {
            Value::Map(inner) => value_at_mut(inner, rest),
            _ => None,
        }
    }
}

/// Depth-first search for the first key named `target`, at any depth. Each sibling is checked for a
/// name match before being descended into; siblings are visited in the map's deterministic order.
fn dfs_locate(map: &StateMap, target: &str, prefix: Path) -> Option<Path> {
    for (key, value) in map {
        if key == target {
            return Some(prefix.child(key));
        }
        if let Value::Map(inner) = value {
            if let Some(found) = dfs_locate(inner, target, prefix.child(key)) {
                return Some(found);
            }
        }
    }
    None
}

/// Error when reading or mutating a [`StateTree`].
#[derive(Debug)]
pub enum TreeError {
    /// The path does not resolve to an existing key. The tree is unchanged.
    NotFound { path: Path },
    /// The path resolves to a value of the wrong kind for the operation (e.g. incrementing a
    /// non-integer).
    WrongKind { path: Path },
}

impl Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::NotFound { path } => write!(f, "no existing key at path {}", path),
            TreeError::WrongKind { path } => {
                write!(f, "value at path {} has the wrong kind for this operation", path)
            }
        }
    }
}
