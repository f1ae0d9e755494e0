//! Integration tests for the local store: last-write-wins upserts, soft
//! deletes, persistence, subscriptions, and recovery from a bad snapshot.

use std::sync::{Arc, Mutex};

use serde_json::json;

use devlife::clock::now_millis;
use devlife::kv::{KvStore, MemoryKv, SqliteKv};
use devlife::model::{Collection, Patch, Priority, Project, SyncStatus, Task};
use devlife::store::{LocalStore, Origin, StoreEvent, STORAGE_KEY};

fn remote_task(id: &str, title: &str, updated_at: u64) -> Patch {
    Patch::from_json(json!({
        "id": id,
        "user_id": "u1",
        "title": title,
        "priority": "Medium",
        "updated_at": updated_at,
    }))
    .unwrap()
}

#[test]
fn remote_upsert_is_idempotent() {
    let store = LocalStore::open(MemoryKv::new());
    let first: Task = store
        .upsert(remote_task("t1", "from remote", 1_000), Origin::Remote)
        .unwrap();
    let second: Task = store
        .upsert(remote_task("t1", "from remote", 1_000), Origin::Remote)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.meta.updated_at, 1_000);
    assert_eq!(second.meta.sync_status, SyncStatus::Synced);
    assert_eq!(store.raw().tasks.len(), 1);
}

#[test]
fn last_write_wins_by_updated_at() {
    let store = LocalStore::open(MemoryKv::new());
    store
        .upsert::<Task>(remote_task("t1", "at T2", 2_000), Origin::Remote)
        .unwrap();

    // Older and equal timestamps lose to the stored copy.
    for stale in [1_000, 2_000] {
        let kept: Task = store
            .upsert(remote_task("t1", "stale", stale), Origin::Remote)
            .unwrap();
        assert_eq!(kept.title, "at T2");
        assert_eq!(kept.meta.updated_at, 2_000);
    }

    let newer: Task = store
        .upsert(remote_task("t1", "at T3", 3_000), Origin::Remote)
        .unwrap();
    assert_eq!(newer.title, "at T3");
    assert_eq!(newer.meta.updated_at, 3_000);
    assert_eq!(newer.meta.sync_status, SyncStatus::Synced);
}

#[test]
fn remote_row_without_timestamp_is_stamped_now() {
    let store = LocalStore::open(MemoryKv::new());
    let before = now_millis();
    let task: Task = store
        .upsert(Patch::new("t1").set("title", "no clock"), Origin::Remote)
        .unwrap();
    assert!(task.meta.updated_at >= before);
    assert_eq!(task.meta.sync_status, SyncStatus::Synced);
}

#[test]
fn local_edit_after_pull_is_pending_again() {
    let store = LocalStore::open(MemoryKv::new());
    store
        .upsert::<Task>(remote_task("t1", "pulled", 1_000), Origin::Remote)
        .unwrap();

    let edited: Task = store
        .upsert(Patch::new("t1").set("completed", true), Origin::Local)
        .unwrap();
    assert_eq!(edited.meta.sync_status, SyncStatus::Pending);
    assert!(edited.meta.updated_at > 1_000);
    assert_eq!(edited.title, "pulled");
    assert!(edited.completed);
}

#[test]
fn local_stamp_never_moves_backwards() {
    let store = LocalStore::open(MemoryKv::new());
    let future = now_millis() + 60_000;
    store
        .upsert::<Task>(remote_task("t1", "from a fast clock", future), Origin::Remote)
        .unwrap();

    let edited: Task = store
        .upsert(Patch::new("t1").set("title", "local"), Origin::Local)
        .unwrap();
    assert!(edited.meta.updated_at >= future);
}

#[test]
fn soft_delete_is_visible_only_in_raw_view() {
    let store = LocalStore::open(MemoryKv::new());
    store
        .upsert::<Project>(Patch::new("p1").set("name", "Atlas"), Origin::Local)
        .unwrap();
    store.mark_synced(Collection::Projects, "p1").unwrap();

    assert!(store.delete(Collection::Projects, "p1").unwrap());

    assert!(store.state().projects.is_empty());
    assert!(store.get::<Project>("p1").is_none());
    let raw = store.raw();
    assert_eq!(raw.projects.len(), 1);
    assert!(raw.projects[0].meta.deleted_at.is_some());
    assert_eq!(raw.projects[0].meta.sync_status, SyncStatus::Pending);
    assert_eq!(raw.projects[0].name, "Atlas");
}

#[test]
fn ship_spec_scenario() {
    let store = LocalStore::open(MemoryKv::new());
    store
        .upsert::<Task>(
            Patch::new("t1")
                .set("title", "Ship spec")
                .set("due_date", "2024-01-01")
                .set("priority", Priority::High),
            Origin::Local,
        )
        .unwrap();

    let state = store.state();
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].meta.sync_status, SyncStatus::Pending);

    let row = json!({
        "id": "t1",
        "title": "Ship spec",
        "updated_at": now_millis() + 10_000,
        "priority": "High",
    });
    store
        .upsert_in(Collection::Tasks, Patch::from_json(row).unwrap(), Origin::Remote)
        .unwrap();

    let state = store.state();
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].meta.sync_status, SyncStatus::Synced);
    assert_eq!(state.tasks[0].due_date, "2024-01-01");
}

#[test]
fn corrupt_snapshot_falls_back_to_empty() {
    let kv = MemoryKv::new();
    kv.put_raw(STORAGE_KEY, b"\x00\xffnot json at all");

    let store = LocalStore::open(kv.clone());
    let state = store.state();
    assert!(state.projects.is_empty());
    assert!(state.finances.is_empty());
    assert!(state.tasks.is_empty());
    assert!(state.vault.is_empty());
    assert!(kv.get_raw(STORAGE_KEY).is_none());

    // The store is usable afterwards.
    store.upsert::<Task>(Patch::new("t1"), Origin::Local).unwrap();
    assert!(kv.get_raw(STORAGE_KEY).is_some());
}

#[test]
fn snapshot_survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("devlife.db");

    {
        let store = LocalStore::open(SqliteKv::open(&path).unwrap());
        store
            .upsert::<Task>(Patch::new("t1").set("title", "persisted"), Origin::Local)
            .unwrap();
        store.upsert::<Task>(Patch::new("t2"), Origin::Local).unwrap();
        store.delete(Collection::Tasks, "t2").unwrap();
    }

    let store = LocalStore::open(SqliteKv::open(&path).unwrap());
    assert_eq!(store.get::<Task>("t1").unwrap().title, "persisted");
    assert_eq!(store.state().tasks.len(), 1);
    assert_eq!(store.raw().tasks.len(), 2);
    assert_eq!(store.pending_count(), 2);
}

#[test]
fn corrupt_snapshot_on_disk_is_wiped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devlife.db");
    SqliteKv::open(&path)
        .unwrap()
        .save(STORAGE_KEY, b"{\"tasks\": [")
        .unwrap();

    let store = LocalStore::open(SqliteKv::open(&path).unwrap());
    assert!(store.raw().is_empty());
    assert!(SqliteKv::open(&path).unwrap().load(STORAGE_KEY).unwrap().is_none());
}

#[test]
fn subscribers_see_persisted_state() {
    let kv = MemoryKv::new();
    let store = Arc::new(LocalStore::open(kv.clone()));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sub = {
        let seen = Arc::clone(&seen);
        let kv = kv.clone();
        store.subscribe(move |event| {
            // The snapshot is already written when callbacks run.
            let persisted = kv.get_raw(STORAGE_KEY).is_some();
            seen.lock().unwrap().push((event.clone(), persisted));
        })
    };
    let other = store.subscribe(|_| {});

    store
        .upsert::<Task>(Patch::new("t1").set("title", "a"), Origin::Local)
        .unwrap();
    store.delete(Collection::Tasks, "t1").unwrap();
    store.clear().unwrap();
    other.unsubscribe();
    sub.unsubscribe();
    store.upsert::<Task>(Patch::new("t2"), Origin::Local).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (
                StoreEvent::Upserted {
                    collection: Collection::Tasks,
                    id: "t1".into()
                },
                true
            ),
            (
                StoreEvent::Deleted {
                    collection: Collection::Tasks,
                    id: "t1".into()
                },
                true
            ),
            (StoreEvent::Cleared, false),
        ]
    );
}

#[test]
fn clear_resets_everything() {
    let kv = MemoryKv::new();
    let store = LocalStore::open(kv.clone());
    store.upsert::<Task>(Patch::new("t1"), Origin::Local).unwrap();
    store
        .upsert::<Project>(Patch::new("p1"), Origin::Local)
        .unwrap();

    store.clear().unwrap();
    assert!(store.raw().is_empty());
    assert_eq!(store.pending_count(), 0);
    assert!(kv.get_raw(STORAGE_KEY).is_none());

    let reopened = LocalStore::open(kv);
    assert!(reopened.raw().is_empty());
}
