//! Integration tests for the replicated state tree as seen through a live host: change events on
//! the bus carry the session's replication scope, counters floor at zero, and the dirty flag
//! drives the save cycle.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::LevelFilter;

use sessionkeeper::host::HostSpec;
use sessionkeeper::messaging::Mailbox;
use sessionkeeper::store::CancelProbe;
use sessionkeeper::tree::{ReplicationScope, TreeError};
use sessionkeeper::types::{EndReason, Path, SessionKey, StateMap, Value};

use common::channel::LoopbackChannel;
use common::harness::{cash_template, fast_configuration};
use common::logging::setup_logger;
use common::mem_store::MemStore;

/// A nested template: `{Cash: 0, Inventory: {Potions: 3}}`.
fn nested_template() -> StateMap {
    let mut inventory = StateMap::new();
    inventory.insert("Potions".to_string(), Value::Int(3));
    let mut template = cash_template();
    template.insert("Inventory".to_string(), Value::Map(inventory));
    template
}

#[test]
fn change_events_carry_the_session_scope() {
    setup_logger(LevelFilter::Debug);
    let replicated = Arc::new(Mutex::new(Vec::new()));
    let sink = replicated.clone();
    let host = HostSpec::builder()
        .store(MemStore::new())
        .messages(LoopbackChannel::new(Mailbox::new()))
        .configuration(fast_configuration())
        .on_state_changed(move |event| {
            sink.lock()
                .unwrap()
                .push((event.scope.clone(), event.path.clone(), event.new_value.clone()));
        })
        .build()
        .start();
    let key = SessionKey::derive("t1");

    let mut session = host
        .session_manager()
        .begin_session(
            key,
            &nested_template(),
            ReplicationScope::Tagged("party".to_string()),
            CancelProbe::never(),
        )
        .unwrap();

    let potions: Path = ["Inventory", "Potions"].into();
    session.tree_mut().unwrap().set(&potions, Value::Int(5)).unwrap();

    // The replication sink drains the bus asynchronously.
    let deadline = Instant::now() + Duration::from_secs(2);
    while replicated.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        replicated.lock().unwrap().as_slice(),
        &[(
            ReplicationScope::Tagged("party".to_string()),
            potions.clone(),
            Value::Int(5)
        )]
    );

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn counters_floor_at_zero_under_overdraw() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = common::harness::start_host(store, fast_configuration());

    let mut session = host
        .session_manager()
        .begin_session(
            SessionKey::derive("t2"),
            &cash_template(),
            ReplicationScope::OwnerOnly,
            CancelProbe::never(),
        )
        .unwrap();

    let cash: Path = ["Cash"].into();
    let tree = session.tree_mut().unwrap();
    tree.increment(&cash, 30).unwrap();
    tree.decrement(&cash, 1000).unwrap();
    assert_eq!(session.tree().get(&cash).unwrap(), Value::Int(0));

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn writes_never_create_keys() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = common::harness::start_host(store, fast_configuration());

    let mut session = host
        .session_manager()
        .begin_session(
            SessionKey::derive("t3"),
            &nested_template(),
            ReplicationScope::OwnerOnly,
            CancelProbe::never(),
        )
        .unwrap();

    let err = session
        .tree_mut()
        .unwrap()
        .set(&["Inventory", "Swords"].into(), Value::Int(1))
        .unwrap_err();
    assert!(matches!(err, TreeError::NotFound { .. }));
    assert!(session.tree().get(&["Inventory", "Swords"].into()).is_err());

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn dirty_flag_drives_the_save_cycle() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    store.set_save_latency(Duration::from_millis(20));
    let (host, _) = common::harness::start_host(store.clone(), fast_configuration());
    let key = SessionKey::derive("t4");

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();

    // Nothing written yet: the periodic save tick has nothing to do.
    assert!(!session.save_if_dirty().unwrap());

    session
        .tree_mut()
        .unwrap()
        .set(&["Cash"].into(), Value::Int(75))
        .unwrap();
    assert!(session.save_if_dirty().unwrap());
    assert!(!session.save_if_dirty().unwrap());

    // The triggered save lands durably (the in-memory store applies a short write latency).
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(record) = store.durable_record(&key) {
            assert_eq!(record.state.get("Cash"), Some(&Value::Int(75)));
            break;
        }
        assert!(Instant::now() < deadline, "save never landed");
        std::thread::sleep(Duration::from_millis(5));
    }

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}
