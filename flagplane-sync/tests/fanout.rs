use std::sync::Arc;

use flagplane_core::{Flag, FlagMap, FlagStore, MemoryStore, Metadata};
use flagplane_sync::{Multiplexer, Payload, SyncError, EMPTY_SNAPSHOT};
use serde_json::Value;
use tokio::sync::mpsc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn flag(variant: &str) -> Flag {
    Flag::new(
        "ENABLED",
        variant,
        [
            ("on".to_string(), true.into()),
            ("off".to_string(), false.into()),
        ],
    )
}

fn one(key: &str, variant: &str) -> FlagMap {
    [(key.to_string(), flag(variant))].into_iter().collect()
}

fn flags_of(payload: &Payload) -> Value {
    let v: Value = serde_json::from_str(&payload.flags).expect("payload is json");
    v["flags"].clone()
}

fn setup() -> (Arc<MemoryStore>, Multiplexer) {
    init_logging();
    let store = Arc::new(MemoryStore::new(vec!["fileA".into(), "fileB".into()]));
    let mux = Multiplexer::new(store.clone()).expect("mux");
    (store, mux)
}

// ---------------------------------------------------------------------------
// 1. Selector cache fidelity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_sees_updates_committed_before_it_without_a_publish() {
    let (store, mux) = setup();
    store
        .update("fileA", "fileA", one("x", "on"), Metadata::new())
        .unwrap();

    let (tx, _rx) = mpsc::channel(4);
    let initial = mux.register("w".into(), "fileA", tx).expect("register");
    assert_eq!(flags_of(&initial)["x"]["defaultVariant"], "on");

    // The cache itself is still stale until the next publish.
    assert_eq!(mux.get_all_flags("fileA").unwrap(), EMPTY_SNAPSHOT);
}

#[tokio::test]
async fn selector_subscriber_receives_its_source_after_publish() {
    let (store, mux) = setup();
    let (tx, mut rx) = mpsc::channel(4);
    let initial = mux.register("w".into(), "fileA", tx).expect("register");
    assert_eq!(initial.flags, EMPTY_SNAPSHOT);

    store
        .update("fileA", "fileA", one("x", "off"), Metadata::new())
        .unwrap();
    store
        .update("fileB", "fileB", one("y", "on"), Metadata::new())
        .unwrap();
    mux.publish().expect("publish");

    let payload = rx.recv().await.expect("payload");
    let flags = flags_of(&payload);
    assert_eq!(flags["x"]["defaultVariant"], "off");
    assert!(flags.get("y").is_none(), "fileB flags must not leak into fileA view");
}

#[tokio::test]
async fn every_publish_is_a_full_broadcast() {
    let (_, mux) = setup();
    let (global_tx, mut global_rx) = mpsc::channel(4);
    let (scoped_tx, mut scoped_rx) = mpsc::channel(4);
    mux.register("g".into(), "", global_tx).unwrap();
    mux.register("s".into(), "fileB", scoped_tx).unwrap();

    mux.publish().unwrap();
    mux.publish().unwrap();

    for _ in 0..2 {
        assert!(global_rx.try_recv().is_ok());
        assert_eq!(scoped_rx.try_recv().unwrap().flags, EMPTY_SNAPSHOT);
    }
    assert!(global_rx.try_recv().is_err());
}

#[test]
fn unconfigured_source_is_an_error() {
    let (_, mux) = setup();
    assert!(matches!(
        mux.get_all_flags("fileC"),
        Err(SyncError::UnknownSource(ref s)) if s == "fileC"
    ));
}

// ---------------------------------------------------------------------------
// 2. Bounded delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_subscriber_does_not_stall_others() {
    let (store, mux) = setup();
    let (slow_tx, _slow_rx) = mpsc::channel(1);
    let (fast_tx, mut fast_rx) = mpsc::channel(8);
    mux.register("slow".into(), "", slow_tx).unwrap();
    mux.register("fast".into(), "", fast_tx).unwrap();

    for variant in ["on", "off", "on", "off"] {
        store
            .update("fileA", "fileA", one("x", variant), Metadata::new())
            .unwrap();
        mux.publish().unwrap();
    }

    let mut last = None;
    let mut received = 0;
    while let Ok(payload) = fast_rx.try_recv() {
        received += 1;
        last = Some(payload);
    }
    assert_eq!(received, 4);
    assert_eq!(flags_of(&last.expect("payload"))["x"]["defaultVariant"], "off");
    assert_eq!(mux.subscriber_count(), 2);
}

#[tokio::test]
async fn watcher_task_sees_latest_state() {
    let (store, mux) = setup();
    let mux = Arc::new(mux);
    let (tx, mut rx) = mpsc::channel(4);
    mux.register("task".into(), "", tx).unwrap();

    let watcher = tokio::spawn(async move { rx.recv().await });

    store
        .update("fileB", "fileB", one("z", "on"), Metadata::new())
        .unwrap();
    mux.publish().unwrap();

    let payload = watcher.await.expect("join").expect("payload");
    assert_eq!(flags_of(&payload)["z"]["source"], "fileB");
}

// ---------------------------------------------------------------------------
// 3. End-to-end
// ---------------------------------------------------------------------------

#[test]
fn flag_moves_between_source_snapshots() {
    let (store, mux) = setup();
    store
        .update("fileA", "sel1", one("flagX", "on"), Metadata::new())
        .unwrap();
    mux.publish().unwrap();
    let a: Value = serde_json::from_str(&mux.get_all_flags("fileA").unwrap()).unwrap();
    assert_eq!(a["flags"]["flagX"]["selector"], "sel1");

    store
        .update("fileB", "sel2", one("flagX", "off"), Metadata::new())
        .unwrap();
    mux.publish().unwrap();

    let global: Value = serde_json::from_str(&mux.get_all_flags("").unwrap()).unwrap();
    let flags = global["flags"].as_object().expect("flags object");
    assert_eq!(flags.len(), 1);
    assert_eq!(flags["flagX"]["source"], "fileB");
    assert_eq!(mux.get_all_flags("fileA").unwrap(), EMPTY_SNAPSHOT);
}
