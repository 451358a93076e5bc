//! Integration tests for session acquisition, reconciliation, and teardown.
//!
//! The sessions in this suite use the in-memory [`MemStore`](common::mem_store::MemStore) and the
//! loopback message channel from `common`. These simulate persistence and cross-node delivery with
//! shared maps and channels, and thus never leave any artifacts.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::LevelFilter;

use sessionkeeper::manager::SessionLoadError;
use sessionkeeper::session::SessionError;
use sessionkeeper::shutdown::ShutdownPhase;
use sessionkeeper::store::CancelProbe;
use sessionkeeper::tree::ReplicationScope;
use sessionkeeper::types::{EndReason, SessionKey, StateMap, Value};

use common::harness::{cash_template, fast_configuration, start_host};
use common::logging::setup_logger;
use common::mem_store::MemStore;

#[test]
fn begin_set_and_observe_change_events() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store, fast_configuration());
    let key = SessionKey::derive("u1");

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();
    assert!(session.status().is_active());

    let cash = ["Cash"].into();
    assert_eq!(session.tree().get(&cash).unwrap(), Value::Int(0));

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    session.tree().subscribe(["Cash"].into(), move |_, new_value, old_value| {
        seen_in_handler
            .lock()
            .unwrap()
            .push((new_value.clone(), old_value.clone()));
    });

    session.tree_mut().unwrap().set(&cash, Value::Int(50)).unwrap();
    assert_eq!(session.tree().get(&cash).unwrap(), Value::Int(50));
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[(Value::Int(50), Value::Int(0))]
    );

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn reconciliation_fills_defaults_without_overwriting() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store, fast_configuration());
    let key = SessionKey::derive("u2");

    // First lifetime: earn some cash and end properly so it is durably saved.
    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();
    session
        .tree_mut()
        .unwrap()
        .set(&["Cash"].into(), Value::Int(250))
        .unwrap();
    host.session_manager().end_session(&mut session, EndReason::Disconnect);

    // Second lifetime with a richer template: the saved value survives, the new key appears.
    let mut template = cash_template();
    template.insert("Gems".to_string(), Value::Int(5));
    let mut session = host
        .session_manager()
        .begin_session(key, &template, ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();
    assert_eq!(session.tree().get(&["Cash"].into()).unwrap(), Value::Int(250));
    assert_eq!(session.tree().get(&["Gems"].into()).unwrap(), Value::Int(5));

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn teardown_is_idempotent() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, recorder) = start_host(store.clone(), fast_configuration());
    let key = SessionKey::derive("u3");

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();

    let first = host.session_manager().end_session(&mut session, EndReason::Disconnect);
    let second = host.session_manager().end_session(&mut session, EndReason::Disconnect);
    assert_eq!(first, Some(EndReason::Disconnect));
    assert_eq!(second, None);
    assert!(!store.is_held(&key));

    // Exactly one SessionEnded notification reaches the event bus.
    let entries = recorder.wait_for(1, Duration::from_secs(2));
    assert_eq!(entries, vec![(key, EndReason::Disconnect)]);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.entries().len(), 1);
}

#[test]
fn contested_lease_blocks_until_released() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store.clone(), fast_configuration());
    let key = SessionKey::derive("u4");

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();

    // A second acquisition for the same key must not proceed while the first lease is held.
    let contender_store = MemStore::clone(&store);
    let contender = thread::spawn(move || {
        let (host2, _) = start_host(contender_store, fast_configuration());
        let session2 = host2
            .session_manager()
            .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
            .unwrap();
        let mut session2 = session2;
        assert!(session2.status().is_active());
        host2.session_manager().end_session(&mut session2, EndReason::Disconnect);
    });

    thread::sleep(Duration::from_millis(100));
    host.session_manager().end_session(&mut session, EndReason::Disconnect);
    contender.join().unwrap();
}

#[test]
fn acquisition_cancelled_when_client_leaves() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store.clone(), fast_configuration());
    let key = SessionKey::derive("u5");

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();

    let client_gone = Arc::new(AtomicBool::new(false));
    let probe_flag = client_gone.clone();
    let contender_store = MemStore::clone(&store);
    let contender = thread::spawn(move || {
        let (host2, _) = start_host(contender_store, fast_configuration());
        host2
            .session_manager()
            .begin_session(
                key,
                &cash_template(),
                ReplicationScope::OwnerOnly,
                CancelProbe::new(move || probe_flag.load(Ordering::SeqCst)),
            )
            .err()
    });

    thread::sleep(Duration::from_millis(100));
    client_gone.store(true, Ordering::SeqCst);
    let err = contender.join().unwrap();
    assert!(matches!(err, Some(SessionLoadError::Cancelled)));

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn unreachable_store_fails_the_load() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    store.set_unreachable(true);
    let (host, _) = start_host(store, fast_configuration());

    let err = host.session_manager().begin_session(
        SessionKey::derive("u6"),
        &cash_template(),
        ReplicationScope::OwnerOnly,
        CancelProbe::never(),
    );
    assert!(matches!(err, Err(SessionLoadError::StoreUnreachable { .. })));
}

#[test]
fn corrupt_snapshot_fails_the_load_and_frees_the_lease() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    store.set_loads_corrupt(true);
    let (host, _) = start_host(store.clone(), fast_configuration());
    let key = SessionKey::derive("u11");

    let err = host.session_manager().begin_session(
        key,
        &cash_template(),
        ReplicationScope::OwnerOnly,
        CancelProbe::never(),
    );
    assert!(matches!(err, Err(SessionLoadError::CorruptSnapshot { .. })));
    // The failed load must not leave the key locked in the store.
    assert!(!store.is_held(&key));

    // Once the stored data is readable again, the key is acquirable as normal.
    store.set_loads_corrupt(false);
    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();
    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn mutations_on_a_closed_session_are_refused() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store, fast_configuration());

    let mut session = host
        .session_manager()
        .begin_session(
            SessionKey::derive("u12"),
            &cash_template(),
            ReplicationScope::OwnerOnly,
            CancelProbe::never(),
        )
        .unwrap();
    host.session_manager().end_session(&mut session, EndReason::Disconnect);

    assert!(matches!(
        session.tree_mut(),
        Err(SessionError::Closed { .. })
    ));
    assert!(matches!(session.save(), Err(SessionError::Closed { .. })));
    // Reads stay available on the ended session.
    assert_eq!(session.tree().get(&["Cash"].into()).unwrap(), Value::Int(0));
}

#[test]
fn draining_process_refuses_new_sessions() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store, fast_configuration());

    host.begin_shutdown();
    let err = host.session_manager().begin_session(
        SessionKey::derive("u7"),
        &cash_template(),
        ReplicationScope::OwnerOnly,
        CancelProbe::never(),
    );
    assert!(matches!(err, Err(SessionLoadError::ShuttingDown)));
}

#[test]
fn disconnect_during_drain_is_recorded_as_shutdown() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, recorder) = start_host(store, fast_configuration());
    let key = SessionKey::derive("u8");

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();

    // Shutdown begins on another thread and blocks in the drain, waiting for this session owner.
    let coordinator = host.shutdown_coordinator();
    let shutdown_thread = {
        let coordinator = coordinator.clone();
        thread::spawn(move || coordinator.begin_shutdown(Duration::from_secs(5)))
    };
    assert_eq!(
        coordinator.wait_phase_at_least(ShutdownPhase::Draining, Duration::from_secs(5)),
        ShutdownPhase::Draining
    );

    // The client's disconnect races the shutdown; the recorded reason must be Shutdown.
    let recorded = host.session_manager().end_session(&mut session, EndReason::Disconnect);
    assert_eq!(recorded, Some(EndReason::Shutdown));

    shutdown_thread.join().unwrap();
    assert_eq!(coordinator.phase(), ShutdownPhase::Terminating);
    let entries = recorder.wait_for(1, Duration::from_secs(2));
    assert_eq!(entries, vec![(key, EndReason::Shutdown)]);
}

#[test]
fn queued_messages_are_delivered_on_activation() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store, fast_configuration());
    let key = SessionKey::derive("u9");

    // Sent while no session for the key exists anywhere.
    assert!(host.send_message(&key, b"welcome back".to_vec()));

    let mut session = host
        .session_manager()
        .begin_session(key, &cash_template(), ReplicationScope::OwnerOnly, CancelProbe::never())
        .unwrap();
    assert_eq!(session.take_queued_messages(), vec![b"welcome back".to_vec()]);
    assert!(session.take_queued_messages().is_empty());

    host.session_manager().end_session(&mut session, EndReason::Disconnect);
}

#[test]
fn malformed_template_is_rejected() {
    setup_logger(LevelFilter::Debug);
    let store = MemStore::new();
    let (host, _) = start_host(store, fast_configuration());

    let mut template = StateMap::new();
    template.insert(String::new(), Value::Int(0));
    let err = host.session_manager().begin_session(
        SessionKey::derive("u10"),
        &template,
        ReplicationScope::OwnerOnly,
        CancelProbe::never(),
    );
    assert!(matches!(err, Err(SessionLoadError::InvalidTemplate { .. })));
}
