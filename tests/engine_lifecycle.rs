//! Engine behavior across scan cycles, restarts and concurrent commands.

mod common;

use common::{engine_parts, wait_until, FakeProbe, FlakyPersistence, NodeBehavior, ScriptedResolver};
use nodemux::engine::Engine;
use nodemux::inventory::{ErrorKind, InventoryStore, LiveStatus, NoteMap, SessionIdentity, StoreError};
use nodemux::persist::{JsonFileStore, MemoryStore, Persistence};
use nodemux::refresh::{RefreshRequest, RefreshState};
use nodemux::remote::CommandError;
use std::sync::Arc;
use std::time::{Duration, Instant};

const GRACE: Duration = Duration::from_secs(2);

fn id(node: &str, name: &str) -> SessionIdentity {
    SessionIdentity::new(node, name)
}

async fn refresh_and_wait(engine: &Engine, cycles: u64) {
    engine.force_refresh();
    assert!(
        wait_until(|| engine.refresh_cycles() >= cycles).await,
        "refresh cycle {cycles} never finished"
    );
}

#[tokio::test]
async fn start_runs_one_scan_before_returning() {
    let resolver = ScriptedResolver::new(&["n1", "n2"]);
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    probe.set_sessions("n2", &["train", "eval"]);

    let engine = Engine::start(engine_parts(
        resolver.clone(),
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;

    let snapshot = engine.snapshot();
    assert_eq!(resolver.calls(), 1);
    assert_eq!(snapshot.active().count(), 3);
    assert!(snapshot.scanned_at.is_some());
    assert_eq!(snapshot.time_left(&"n2".into()), Some("1:00:00"));
    assert_eq!(engine.refresh_state(), RefreshState::Idle);
    assert_eq!(engine.refresh_cycles(), 0);

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn note_survives_its_node_leaving_the_allocation() {
    let resolver = ScriptedResolver::new(&["n1", "n2"]);
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    probe.set_sessions("n2", &["train"]);
    let engine = Engine::start(engine_parts(
        resolver.clone(),
        probe,
        Arc::new(MemoryStore::new()),
    ))
    .await;

    engine.set_note(&id("n2", "train"), "experiment A").unwrap();
    resolver.set_nodes(&["n1"]);
    refresh_and_wait(&engine, 1).await;

    let snapshot = engine.snapshot();
    let train = snapshot.get(&id("n2", "train")).unwrap();
    assert_eq!(train.status, LiveStatus::Stale);
    assert_eq!(train.note.as_deref(), Some("experiment A"));
    assert!(snapshot.get(&id("n1", "main")).unwrap().is_active());
    // Active first, then stale.
    assert_eq!(snapshot.records.last().unwrap().identity, id("n2", "train"));

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn vanished_session_without_user_data_is_dropped() {
    let resolver = ScriptedResolver::new(&["n1"]);
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main", "scratch"]);
    let engine = Engine::start(engine_parts(
        resolver,
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;
    assert_eq!(engine.snapshot().records.len(), 2);

    probe.set_sessions("n1", &["main"]);
    refresh_and_wait(&engine, 1).await;

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.records.len(), 1);
    assert!(snapshot.get(&id("n1", "scratch")).is_none());

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn note_is_durable_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let files = || {
        Arc::new(JsonFileStore::new(
            dir.path().join("notes.json"),
            dir.path().join("snapshots.json"),
        ))
    };

    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&["n1"]),
        probe,
        files(),
    ))
    .await;
    engine.set_note(&id("n1", "main"), "experiment A").unwrap();
    engine.stop(GRACE).await.unwrap();
    drop(engine);

    // Reload with no live scan yet.
    let store = InventoryStore::new(files());
    let snapshot = store.load();
    let record = snapshot.get(&id("n1", "main")).unwrap();
    assert_eq!(record.status, LiveStatus::Stale);
    assert_eq!(record.note.as_deref(), Some("experiment A"));

    // And through a full restart whose scheduler reports nothing.
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&[]),
        FakeProbe::new(),
        files(),
    ))
    .await;
    let record = engine.snapshot().get(&id("n1", "main")).cloned().unwrap();
    assert!(!record.is_active());
    assert_eq!(record.note.as_deref(), Some("experiment A"));
    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn unreadable_state_file_does_not_cost_the_notes() {
    let dir = tempfile::tempdir().unwrap();
    let notes_path = dir.path().join("notes.json");
    let snapshots_path = dir.path().join("snapshots.json");
    std::fs::write(&notes_path, r#"{"gpu-01:train": "experiment A"}"#).unwrap();
    std::fs::create_dir(&snapshots_path).unwrap();

    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&[]),
        FakeProbe::new(),
        Arc::new(JsonFileStore::new(&notes_path, &snapshots_path)),
    ))
    .await;

    let record = engine.snapshot().get(&id("gpu-01", "train")).cloned().unwrap();
    assert_eq!(record.status, LiveStatus::Stale);
    assert_eq!(record.note.as_deref(), Some("experiment A"));
    assert!(engine
        .errors()
        .iter()
        .any(|e| e.kind == ErrorKind::Persistence));

    // The unreadable file is refused; the notes file keeps its content.
    assert!(engine.stop(GRACE).await.is_err());
    let notes = std::fs::read_to_string(&notes_path).unwrap();
    assert!(notes.contains("experiment A"), "{notes}");
    assert!(snapshots_path.is_dir());
}

#[tokio::test]
async fn back_to_back_requests_from_idle_run_one_cycle() {
    let resolver = ScriptedResolver::new(&["n1"]);
    let engine = Engine::start(engine_parts(
        resolver.clone(),
        FakeProbe::new(),
        Arc::new(MemoryStore::new()),
    ))
    .await;

    assert_eq!(engine.force_refresh(), RefreshRequest::Scheduled);
    assert_eq!(engine.force_refresh(), RefreshRequest::Coalesced);
    assert!(wait_until(|| engine.refresh_cycles() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(engine.refresh_cycles(), 1);
    assert_eq!(resolver.calls(), 2);
    assert_eq!(engine.force_refresh(), RefreshRequest::Scheduled);

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn note_set_during_an_in_flight_scan_is_kept() {
    let resolver = ScriptedResolver::new(&["a", "b"]);
    let probe = FakeProbe::new();
    probe.set_sessions("a", &["main"]);
    probe.set_sessions("b", &["work"]);
    let engine = Engine::start(engine_parts(
        resolver,
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;

    probe.close_gate();
    assert_eq!(engine.force_refresh(), RefreshRequest::Scheduled);
    assert!(wait_until(|| probe.in_flight() == 2).await);
    assert_eq!(engine.refresh_state(), RefreshState::Scanning);

    engine.set_note(&id("a", "main"), "keep me").unwrap();
    engine.set_note(&id("b", "work"), "me too").unwrap();
    // The store is readable while the scan is blocked.
    assert_eq!(
        engine.snapshot().get(&id("a", "main")).unwrap().note.as_deref(),
        Some("keep me")
    );

    probe.open_gate();
    assert!(wait_until(|| engine.refresh_cycles() == 1).await);

    let snapshot = engine.snapshot();
    let main = snapshot.get(&id("a", "main")).unwrap();
    assert!(main.is_active());
    assert_eq!(main.note.as_deref(), Some("keep me"));
    assert_eq!(
        snapshot.get(&id("b", "work")).unwrap().note.as_deref(),
        Some("me too")
    );

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn refresh_requests_during_a_scan_coalesce_into_one() {
    let resolver = ScriptedResolver::new(&["n1"]);
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let engine = Engine::start(engine_parts(
        resolver.clone(),
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;
    assert_eq!(resolver.calls(), 1);

    probe.close_gate();
    assert_eq!(engine.force_refresh(), RefreshRequest::Scheduled);
    assert!(wait_until(|| probe.in_flight() == 1).await);
    assert_eq!(engine.refresh_state(), RefreshState::Scanning);

    assert_eq!(engine.force_refresh(), RefreshRequest::Coalesced);
    assert_eq!(engine.force_refresh(), RefreshRequest::Coalesced);

    probe.open_gate();
    assert!(wait_until(|| engine.refresh_cycles() == 2).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(engine.refresh_cycles(), 2);
    assert_eq!(resolver.calls(), 3);
    assert_eq!(engine.refresh_state(), RefreshState::Idle);

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn scheduler_outage_is_logged_and_recovered_from() {
    let resolver = ScriptedResolver::new(&["n1"]);
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main", "scratch"]);
    let engine = Engine::start(engine_parts(
        resolver.clone(),
        probe,
        Arc::new(MemoryStore::new()),
    ))
    .await;
    engine.set_note(&id("n1", "main"), "long run").unwrap();

    resolver.fail("slurm_load_jobs error: Unable to contact slurm controller");
    refresh_and_wait(&engine, 1).await;

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.records[0].status, LiveStatus::Stale);
    assert!(snapshot.nodes.is_empty());
    let error = snapshot.errors.last().unwrap();
    assert_eq!(error.kind, ErrorKind::Scheduler);
    assert!(error.node.is_none());
    assert!(error.message.contains("slurm controller"));
    assert_eq!(engine.refresh_state(), RefreshState::Idle);

    resolver.set_nodes(&["n1"]);
    refresh_and_wait(&engine, 2).await;
    let main = engine.snapshot().get(&id("n1", "main")).cloned().unwrap();
    assert!(main.is_active());
    assert_eq!(main.note.as_deref(), Some("long run"));

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn unreachable_scheduler_at_start_still_yields_a_view() {
    let resolver = ScriptedResolver::new(&[]);
    resolver.fail("squeue: not found");
    let mut notes = NoteMap::new();
    notes.insert(id("n7", "old"), "from last week".into());

    let engine = Engine::start(engine_parts(
        resolver,
        FakeProbe::new(),
        Arc::new(MemoryStore::with_notes(notes)),
    ))
    .await;

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.records.len(), 1);
    assert!(!snapshot.records[0].is_active());
    assert_eq!(engine.errors().len(), 1);

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn failed_save_keeps_the_note_in_memory() {
    let persistence = FlakyPersistence::failing();
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&["n1"]),
        probe,
        persistence.clone(),
    ))
    .await;

    let err = engine.set_note(&id("n1", "main"), "unsaved").unwrap_err();
    assert!(matches!(err, StoreError::Persistence(_)));

    let snapshot = engine.snapshot();
    assert_eq!(
        snapshot.get(&id("n1", "main")).unwrap().note.as_deref(),
        Some("unsaved")
    );
    assert!(snapshot
        .errors
        .iter()
        .any(|e| e.kind == ErrorKind::Persistence));
    assert!(persistence.notes().is_empty());

    // Once the disk is back, the stop-time flush writes it out.
    persistence.set_failing(false);
    engine.stop(GRACE).await.unwrap();
    assert_eq!(
        persistence.notes().get(&id("n1", "main")).map(String::as_str),
        Some("unsaved")
    );
}

#[tokio::test]
async fn probe_failure_marks_only_that_node_stale() {
    let resolver = ScriptedResolver::new(&["n1", "n2"]);
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    probe.set_sessions("n2", &["train"]);
    let engine = Engine::start(engine_parts(
        resolver,
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;
    engine.set_note(&id("n2", "train"), "watch loss").unwrap();

    probe.set_behavior("n2", NodeBehavior::Fail("Connection refused".into()));
    refresh_and_wait(&engine, 1).await;

    let snapshot = engine.snapshot();
    assert!(snapshot.get(&id("n1", "main")).unwrap().is_active());
    let train = snapshot.get(&id("n2", "train")).unwrap();
    assert!(!train.is_active());
    assert!(!train.attached);
    let probe_errors: Vec<_> = snapshot
        .errors
        .iter()
        .filter(|e| e.kind == ErrorKind::Probe)
        .collect();
    assert_eq!(probe_errors.len(), 1);
    assert_eq!(probe_errors[0].node.as_ref().map(|n| n.as_str()), Some("n2"));

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn commands_on_offline_sessions_are_refused() {
    let mut notes = NoteMap::new();
    notes.insert(id("gone", "train"), "finished?".into());
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&[]),
        FakeProbe::new(),
        Arc::new(MemoryStore::with_notes(notes)),
    ))
    .await;

    let err = engine.attach(&id("gone", "train")).await.unwrap_err();
    assert!(matches!(err, CommandError::SessionOffline(_)));
    let err = engine.kill(&id("gone", "missing")).await.unwrap_err();
    assert!(matches!(err, CommandError::SessionOffline(_)));
    assert!(engine.capture(&id("gone", "train")).await.is_err());

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn forget_drops_stale_records_only() {
    let mut notes = NoteMap::new();
    notes.insert(id("gone", "train"), "done".into());
    let persistence = Arc::new(MemoryStore::with_notes(notes));
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&["n1"]),
        probe,
        persistence.clone(),
    ))
    .await;

    assert!(matches!(
        engine.forget(&id("n1", "main")),
        Err(StoreError::SessionActive(_))
    ));
    engine.forget(&id("gone", "train")).unwrap();
    assert!(engine.snapshot().get(&id("gone", "train")).is_none());
    assert!(persistence.load().unwrap().notes.is_empty());

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn on_demand_capture_is_stored_as_snapshot() {
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let persistence = Arc::new(MemoryStore::new());
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&["n1"]),
        probe,
        persistence.clone(),
    ))
    .await;

    let text = engine.capture(&id("n1", "main")).await.unwrap();
    assert_eq!(text, "output of main");
    let record = engine.snapshot().get(&id("n1", "main")).cloned().unwrap();
    assert_eq!(record.snapshot.map(|s| s.text).as_deref(), Some("output of main"));
    assert_eq!(persistence.snapshots().len(), 1);

    engine.stop(GRACE).await.unwrap();
}

#[tokio::test]
async fn stop_abandons_a_stuck_scan_after_grace() {
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&["n1"]),
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;

    probe.close_gate();
    engine.force_refresh();
    assert!(wait_until(|| engine.refresh_state() == RefreshState::Scanning).await);

    let started = Instant::now();
    engine.stop(Duration::from_millis(100)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.refresh_state(), RefreshState::Stopped);
    assert_eq!(engine.force_refresh(), RefreshRequest::Ignored);
}

#[tokio::test]
async fn subscribers_see_each_published_snapshot() {
    let probe = FakeProbe::new();
    probe.set_sessions("n1", &["main"]);
    let engine = Engine::start(engine_parts(
        ScriptedResolver::new(&["n1"]),
        probe.clone(),
        Arc::new(MemoryStore::new()),
    ))
    .await;
    let mut updates = engine.subscribe();
    updates.borrow_and_update();

    probe.set_sessions("n1", &["main", "second"]);
    engine.force_refresh();
    tokio::time::timeout(Duration::from_secs(5), updates.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(wait_until(|| engine.snapshot().records.len() == 2).await);

    engine.stop(GRACE).await.unwrap();
}
