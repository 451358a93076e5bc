/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for 'inert' types, i.e., those that are sent around and inspected, but have no active
//! behavior: session keys, transaction ids, tree paths and values, session statuses, and the snapshot
//! type that crosses the [store](crate::store) boundary.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::io;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

pub use sha2::Sha256 as KeyHasher;

/// Stable identifier of a session, derived from the owning client's identity. At most one session with
/// [`SessionStatus::Active`] exists per key at any time; this is arbitrated by the store's lease, not
/// by this library.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize, Debug)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Derive the session key for a client identity string. The same identity always maps to the same
    /// key, across processes and restarts.
    pub fn derive(client_identity: &str) -> SessionKey {
        let mut hasher = KeyHasher::new();
        hasher.update(client_identity.as_bytes());
        SessionKey(hasher.finalize().into())
    }

    pub const fn new(bytes: [u8; 32]) -> SessionKey {
        SessionKey(bytes)
    }

    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        write!(f, "{}", &encoded[0..7])
    }
}

/// Identifier of an externally delivered transaction. Assigned by the upstream event source; opaque
/// to this library beyond equality.
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Debug)]
pub struct TxId(String);

impl TxId {
    pub fn new<S: Into<String>>(id: S) -> TxId {
        TxId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered sequence of string keys addressing a node in a [`StateMap`].
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Debug)]
pub struct Path(Vec<String>);

impl Path {
    pub fn new(keys: Vec<String>) -> Path {
        Path(keys)
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is a (non-strict) prefix of `other`. Used to match subscriptions against the
    /// paths of change events.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        other.0.len() >= self.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    pub(crate) fn child(&self, key: &str) -> Path {
        let mut keys = self.0.clone();
        keys.push(key.to_string());
        Path(keys)
    }
}

impl<S: AsRef<str>> From<&[S]> for Path {
    fn from(keys: &[S]) -> Path {
        Path(keys.iter().map(|k| k.as_ref().to_string()).collect())
    }
}

impl<S: AsRef<str>, const N: usize> From<[S; N]> for Path {
    fn from(keys: [S; N]) -> Path {
        Path(keys.iter().map(|k| k.as_ref().to_string()).collect())
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// A mapping from string keys to [`Value`]s. `BTreeMap` keeps iteration order deterministic, which
/// makes the depth-first key search in [the tree](crate::tree) deterministic too.
pub type StateMap = BTreeMap<String, Value>;

/// A value stored at a key of a [`StateMap`]: a scalar, or a nested map.
///
/// Serialization is hand-written because the borsh derive cannot discharge the cyclic obligation
/// `Value: BorshSerialize ⇐ BTreeMap<String, Value>: BorshSerialize`. The encoding matches what the
/// derive would produce: a variant tag byte, then the payload, with maps as a `u32` length followed
/// by key-sorted entries.
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    Map(StateMap),
}

impl BorshSerialize for Value {
    fn serialize<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Value::Bool(b) => {
                0u8.serialize(writer)?;
                b.serialize(writer)
            }
            Value::Int(i) => {
                1u8.serialize(writer)?;
                i.serialize(writer)
            }
            Value::Str(s) => {
                2u8.serialize(writer)?;
                s.serialize(writer)
            }
            Value::Map(map) => {
                3u8.serialize(writer)?;
                (map.len() as u32).serialize(writer)?;
                for (key, value) in map {
                    key.serialize(writer)?;
                    value.serialize(writer)?;
                }
                Ok(())
            }
        }
    }
}

impl BorshDeserialize for Value {
    fn deserialize(buf: &mut &[u8]) -> io::Result<Value> {
        match u8::deserialize(buf)? {
            0 => Ok(Value::Bool(bool::deserialize(buf)?)),
            1 => Ok(Value::Int(i64::deserialize(buf)?)),
            2 => Ok(Value::Str(String::deserialize(buf)?)),
            3 => {
                let len = u32::deserialize(buf)?;
                let mut map = StateMap::new();
                for _ in 0..len {
                    let key = String::deserialize(buf)?;
                    let value = Value::deserialize(buf)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            tag => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown value kind tag: {}", tag),
            )),
        }
    }

    fn deserialize_reader<R: io::Read>(reader: &mut R) -> io::Result<Value> {
        match u8::deserialize_reader(reader)? {
            0 => Ok(Value::Bool(bool::deserialize_reader(reader)?)),
            1 => Ok(Value::Int(i64::deserialize_reader(reader)?)),
            2 => Ok(Value::Str(String::deserialize_reader(reader)?)),
            3 => {
                let len = u32::deserialize_reader(reader)?;
                let mut map = StateMap::new();
                for _ in 0..len {
                    let key = String::deserialize_reader(reader)?;
                    let value = Value::deserialize_reader(reader)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            tag => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown value kind tag: {}", tag),
            )),
        }
    }
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// The lifecycle state of a session. Transitions are strictly
/// `Pending → Active → Ending → Ended`; `Ended` is terminal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionStatus {
    /// Lease acquisition and reconciliation in progress.
    Pending,
    /// Lease held, state reconciled, session open for work.
    Active,
    /// First `end_session` call observed; final save and release in progress.
    Ending,
    /// Lease released. All further operations fail with a closed-session error.
    Ended,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionStatus::Ending | SessionStatus::Ended)
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "Pending"),
            SessionStatus::Active => write!(f, "Active"),
            SessionStatus::Ending => write!(f, "Ending"),
            SessionStatus::Ended => write!(f, "Ended"),
        }
    }
}

/// Why a session was ended. Carried on the `SessionEnded` notification so that business logic gated
/// on "proper shutdown" can distinguish a whole-process termination from an individual disconnect.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndReason {
    /// The owning client disconnected voluntarily.
    Disconnect,
    /// The owning client was removed by the host.
    Kick,
    /// The whole process is shutting down.
    Shutdown,
}

impl Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Disconnect => write!(f, "Disconnect"),
            EndReason::Kick => write!(f, "Kick"),
            EndReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The unit of durable persistence: the session's state tree together with its record of processed
/// transaction ids. The two are saved together so that the dedupe record survives process restarts
/// in lockstep with the effects it vouches for.
#[derive(Clone, PartialEq, BorshSerialize, BorshDeserialize, Debug)]
pub struct SessionSnapshot {
    pub state: StateMap,
    pub processed_txs: Vec<TxId>,
}

impl SessionSnapshot {
    pub fn new(state: StateMap, processed_txs: Vec<TxId>) -> SessionSnapshot {
        SessionSnapshot {
            state,
            processed_txs,
        }
    }

    pub fn contains_tx(&self, tx_id: &TxId) -> bool {
        self.processed_txs.iter().any(|id| id == tx_id)
    }
}
