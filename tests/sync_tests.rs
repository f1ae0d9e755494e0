//! Integration tests for the sync engine against the in-process remote.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use devlife::auth::SessionAuth;
use devlife::kv::MemoryKv;
use devlife::model::{Collection, FinanceEntry, Patch, Project, SyncStatus, Task};
use devlife::remote::{MemoryRemote, RemoteError};
use devlife::store::{LocalStore, Origin};
use devlife::sync::{SkipReason, SyncEngine, SyncError, SyncOutcome, SyncReport};

type Engine = SyncEngine<MemoryRemote, SessionAuth>;

fn device(remote: &MemoryRemote, principal: &str) -> Arc<Engine> {
    let store = Arc::new(LocalStore::open(MemoryKv::new()));
    Arc::new(SyncEngine::new(
        store,
        remote.clone(),
        SessionAuth::signed_in(principal),
    ))
}

fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        SyncOutcome::Skipped(reason) => panic!("sweep skipped: {reason:?}"),
    }
}

async fn wait_for_outcome(
    rx: &mut tokio::sync::watch::Receiver<Option<Arc<SyncOutcome>>>,
) -> Arc<SyncOutcome> {
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("no sweep within 5s")
        .expect("sync task ended");
    rx.borrow_and_update().clone().expect("outcome published")
}

#[tokio::test]
async fn push_pull_round_trip_keeps_records_synced() {
    let remote = MemoryRemote::new();
    let engine = device(&remote, "u1");
    let created: Task = engine
        .store()
        .upsert(Patch::new("t1").set("title", "Ship spec"), Origin::Local)
        .unwrap();

    let report = completed(engine.sync_all().await);
    assert!(report.is_clean());
    assert_eq!(report.pushed(), 1);

    let row = remote.row(Collection::Tasks, "t1").unwrap();
    assert_eq!(row["user_id"], json!("u1"));
    assert_eq!(row["title"], json!("Ship spec"));
    let sent_at = row["updated_at"].as_u64().unwrap();
    assert!(sent_at >= created.meta.updated_at);

    // The pull in the same sweep brought back the server's timestamp.
    let task = engine.store().get::<Task>("t1").unwrap();
    assert_eq!(task.meta.sync_status, SyncStatus::Synced);
    assert_eq!(task.meta.updated_at, sent_at);

    // The server copy coming back must not flip the record to pending.
    engine
        .store()
        .upsert_in(Collection::Tasks, Patch::from_json(row).unwrap(), Origin::Remote)
        .unwrap();
    let report = completed(engine.sync_all().await);
    assert_eq!(report.pushed(), 0);
    assert_eq!(report.pulled(), 0);
    assert_eq!(engine.store().pending_count(), 0);
    assert_eq!(engine.store().list::<Task>().len(), 1);
}

#[tokio::test]
async fn edits_travel_between_devices() {
    let remote = MemoryRemote::new();
    let laptop = device(&remote, "u1");
    let phone = device(&remote, "u1");

    laptop
        .store()
        .upsert::<Project>(
            Patch::new("p1").set("name", "Atlas").set("progress", 10),
            Origin::Local,
        )
        .unwrap();
    completed(laptop.sync_all().await);

    let report = completed(phone.sync_all().await);
    assert_eq!(report.pulled(), 1);
    let on_phone = phone.store().get::<Project>("p1").unwrap();
    assert_eq!(on_phone.name, "Atlas");
    assert_eq!(on_phone.meta.sync_status, SyncStatus::Synced);

    tokio::time::sleep(Duration::from_millis(5)).await;
    phone
        .store()
        .upsert::<Project>(Patch::new("p1").set("progress", 80), Origin::Local)
        .unwrap();
    completed(phone.sync_all().await);
    completed(laptop.sync_all().await);

    let on_laptop = laptop.store().get::<Project>("p1").unwrap();
    assert_eq!(on_laptop.progress, 80);
    assert_eq!(on_laptop.name, "Atlas");
    assert_eq!(on_laptop.meta.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn later_local_edit_does_not_hide_earlier_edit_pushed_late() {
    let remote = MemoryRemote::new();
    let laptop = device(&remote, "u1");
    let phone = device(&remote, "u1");

    laptop
        .store()
        .upsert::<Task>(Patch::new("y").set("title", "from laptop"), Origin::Local)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    phone
        .store()
        .upsert::<Task>(Patch::new("x").set("title", "from phone"), Origin::Local)
        .unwrap();

    completed(laptop.sync_all().await);
    completed(phone.sync_all().await);
    completed(phone.sync_all().await);
    completed(laptop.sync_all().await);

    let mut on_phone: Vec<String> = phone
        .store()
        .list::<Task>()
        .into_iter()
        .map(|t| t.meta.id)
        .collect();
    on_phone.sort();
    assert_eq!(on_phone, vec!["x", "y"]);
    assert_eq!(phone.store().get::<Task>("y").unwrap().title, "from laptop");
    assert!(laptop.store().get::<Task>("x").is_some());
    assert_eq!(phone.store().pending_count(), 0);
}

#[tokio::test]
async fn offline_edit_does_not_hide_rows_pushed_meanwhile() {
    let remote = MemoryRemote::new();
    let laptop = device(&remote, "u1");
    let phone = device(&remote, "u1");

    laptop
        .store()
        .upsert::<Project>(Patch::new("p1").set("name", "Atlas"), Origin::Local)
        .unwrap();
    completed(laptop.sync_all().await);

    // The phone edits while offline, after the laptop's push.
    tokio::time::sleep(Duration::from_millis(5)).await;
    phone
        .store()
        .upsert::<Project>(Patch::new("p2").set("name", "Borealis"), Origin::Local)
        .unwrap();

    let report = completed(phone.sync_all().await);
    assert!(report.is_clean());
    assert_eq!(phone.store().get::<Project>("p1").unwrap().name, "Atlas");
    assert_eq!(phone.store().list::<Project>().len(), 2);
    assert_eq!(phone.store().pending_count(), 0);
}

#[tokio::test]
async fn soft_deletes_propagate() {
    let remote = MemoryRemote::new();
    let a = device(&remote, "u1");
    let b = device(&remote, "u1");

    a.store()
        .upsert::<Task>(Patch::new("t1").set("title", "temp"), Origin::Local)
        .unwrap();
    completed(a.sync_all().await);
    completed(b.sync_all().await);
    assert!(b.store().get::<Task>("t1").is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    a.store().delete(Collection::Tasks, "t1").unwrap();
    completed(a.sync_all().await);
    completed(b.sync_all().await);

    assert!(b.store().state().tasks.is_empty());
    let raw = b.store().raw();
    assert_eq!(raw.tasks.len(), 1);
    assert!(raw.tasks[0].meta.deleted_at.is_some());
}

#[tokio::test]
async fn back_to_back_sweeps_make_one_set_of_calls() {
    let remote = MemoryRemote::new();
    remote.set_latency(Duration::from_millis(20));
    let engine = device(&remote, "u1");
    engine
        .store()
        .upsert::<Task>(Patch::new("t1"), Origin::Local)
        .unwrap();

    let (first, second) = tokio::join!(engine.sync_all(), engine.sync_all());
    assert!(matches!(
        second,
        SyncOutcome::Skipped(SkipReason::AlreadySyncing)
    ));
    assert_eq!(completed(first).pushed(), 1);
    // one push (tasks) and four pulls
    assert_eq!(remote.push_calls(), 1);
    assert_eq!(remote.pull_calls(), 4);
}

#[tokio::test]
async fn failures_are_isolated_per_collection() {
    let remote = MemoryRemote::new();
    remote.set_failing(Collection::Tasks, true);
    let engine = device(&remote, "u1");
    let store = engine.store();
    store
        .upsert::<Project>(Patch::new("p1").set("name", "ok"), Origin::Local)
        .unwrap();
    store
        .upsert::<Task>(Patch::new("t1").set("title", "stuck"), Origin::Local)
        .unwrap();
    store
        .upsert::<FinanceEntry>(Patch::new("f1").set("amount", 12.5), Origin::Local)
        .unwrap();

    let report = completed(engine.sync_all().await);
    let failed: Vec<Collection> = report.failures().into_iter().map(|(c, _)| c).collect();
    assert_eq!(failed, vec![Collection::Tasks, Collection::Tasks]);
    assert!(matches!(
        report.collection(Collection::Tasks).unwrap().pushed,
        Err(SyncError::Remote(RemoteError::Status { code: 503, .. }))
    ));
    assert_eq!(report.pushed(), 2);
    assert!(!store.get::<Project>("p1").unwrap().meta.is_pending());
    assert!(store.get::<Task>("t1").unwrap().meta.is_pending());
    // vault was still swept after the failure
    assert!(report.collection(Collection::Vault).unwrap().pulled.is_ok());

    remote.set_failing(Collection::Tasks, false);
    let report = completed(engine.sync_all().await);
    assert!(report.is_clean());
    assert_eq!(store.pending_count(), 0);
    assert!(remote.row(Collection::Tasks, "t1").is_some());
}

#[tokio::test]
async fn offline_sweep_keeps_everything_pending() {
    let remote = MemoryRemote::new();
    remote.set_offline(true);
    let engine = device(&remote, "u1");
    engine
        .store()
        .upsert::<Task>(Patch::new("t1"), Origin::Local)
        .unwrap();

    let report = completed(engine.sync_all().await);
    assert_eq!(report.failures().len(), 5);
    assert_eq!(engine.store().pending_count(), 1);
    assert!(!engine.is_syncing());

    remote.set_offline(false);
    completed(engine.sync_all().await);
    assert_eq!(engine.store().pending_count(), 0);
}

#[tokio::test]
async fn sweeps_wait_for_sign_in() {
    let remote = MemoryRemote::new();
    let store = Arc::new(LocalStore::open(MemoryKv::new()));
    let auth = SessionAuth::default();
    let engine = SyncEngine::new(Arc::clone(&store), remote.clone(), auth.clone());
    store.upsert::<Task>(Patch::new("t1"), Origin::Local).unwrap();

    assert!(matches!(
        engine.sync_all().await,
        SyncOutcome::Skipped(SkipReason::Unauthenticated)
    ));
    assert_eq!(remote.network_calls(), 0);

    auth.sign_in("u1");
    assert_eq!(completed(engine.sync_all().await).pushed(), 1);
}

#[tokio::test]
async fn principals_only_see_their_own_rows() {
    let remote = MemoryRemote::new();
    remote
        .seed(
            Collection::Vault,
            "someone-else",
            vec![json!({"id": "v1", "service_name": "theirs", "updated_at": 50})],
        )
        .unwrap();
    let engine = device(&remote, "u1");

    let report = completed(engine.sync_all().await);
    assert_eq!(report.pulled(), 0);
    assert!(engine.store().raw().is_empty());

    // Pushing a row with a foreign id is refused and stays pending.
    engine
        .store()
        .upsert::<devlife::model::VaultEntry>(Patch::new("v1"), Origin::Local)
        .unwrap();
    let report = completed(engine.sync_all().await);
    assert!(matches!(
        report.collection(Collection::Vault).unwrap().pushed,
        Err(SyncError::Remote(RemoteError::Forbidden(_)))
    ));
    assert_eq!(engine.store().pending_count(), 1);
    assert_eq!(
        remote.row(Collection::Vault, "v1").unwrap()["service_name"],
        json!("theirs")
    );
}

#[tokio::test]
async fn edit_during_push_stays_pending() {
    let remote = MemoryRemote::new();
    remote.set_latency(Duration::from_millis(100));
    let engine = device(&remote, "u1");
    engine
        .store()
        .upsert::<Project>(Patch::new("p1").set("name", "v1"), Origin::Local)
        .unwrap();

    let sweep = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.sync_all().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine
        .store()
        .upsert::<Project>(Patch::new("p1").set("name", "v2"), Origin::Local)
        .unwrap();
    completed(sweep.await.unwrap());

    assert!(engine.store().get::<Project>("p1").unwrap().meta.is_pending());
    assert_eq!(remote.row(Collection::Projects, "p1").unwrap()["name"], json!("v1"));

    remote.set_latency(Duration::ZERO);
    completed(engine.sync_all().await);
    assert!(!engine.store().get::<Project>("p1").unwrap().meta.is_pending());
    assert_eq!(remote.row(Collection::Projects, "p1").unwrap()["name"], json!("v2"));
}

#[tokio::test]
async fn background_sync_runs_on_start_and_reconnect() {
    let remote = MemoryRemote::new();
    let engine = device(&remote, "u1");
    let handle = engine.start(Duration::from_secs(3600)).unwrap();
    assert!(engine.start(Duration::from_secs(3600)).is_none());

    let mut outcomes = handle.outcomes();
    let first = wait_for_outcome(&mut outcomes).await;
    assert!(first.report().is_some());

    engine
        .store()
        .upsert::<Task>(Patch::new("t1"), Origin::Local)
        .unwrap();
    handle.notify_reconnected();
    let second = wait_for_outcome(&mut outcomes).await;
    assert_eq!(second.report().unwrap().pushed(), 1);
    assert_eq!(engine.store().pending_count(), 0);
    assert!(handle.latest().is_some());

    handle.shutdown().await;
    let restarted = engine.start(Duration::from_secs(3600)).unwrap();
    restarted.shutdown().await;
}
