//! The local store: four record collections held in memory and persisted as
//! one JSON snapshot after every mutation.
//!
//! Every mutation takes the data lock, computes the new state, writes the
//! snapshot, and only then releases the lock and notifies subscribers.  A
//! failed write rolls the in-memory change back and is returned to the caller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Map, Value};

use crate::clock::{now_millis, Millis};
use crate::kv::{KvError, KvStore};
use crate::logging::record_id;
use crate::model::{
    AppState, Collection, FinanceEntry, Patch, Project, Record, RecordMeta, SyncStatus, Task,
    VaultEntry,
};

/// Key under which the whole-state snapshot is saved.
pub const STORAGE_KEY: &str = "devlife_offline_db";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Kv(KvError),
    Serde(serde_json::Error),
    InvalidRecord {
        collection: Collection,
        id: String,
        reason: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Kv(e) => write!(f, "storage error: {e}"),
            StoreError::Serde(e) => write!(f, "serialization error: {e}"),
            StoreError::InvalidRecord {
                collection,
                id,
                reason,
            } => write!(f, "invalid {collection} record {id}: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<KvError> for StoreError {
    fn from(e: KvError) -> Self {
        StoreError::Kv(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Mutation metadata
// ---------------------------------------------------------------------------

/// Where an upsert comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A user edit: always stamped now and flagged for push.
    Local,
    /// A row pulled from the remote: last-write-wins, flagged synced.
    Remote,
}

/// Passed to subscribers after each persisted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Upserted { collection: Collection, id: String },
    Deleted { collection: Collection, id: String },
    Cleared,
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Handle returned by [`LocalStore::subscribe`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Remove the callback. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

pub struct LocalStore {
    kv: Box<dyn KvStore>,
    data: Mutex<AppState>,
    listeners: Arc<Mutex<Listeners>>,
}

impl LocalStore {
    /// Load the snapshot from `kv`.
    ///
    /// Never fails: a snapshot that cannot be read or parsed (or that holds
    /// duplicate ids) is logged, erased, and replaced by an empty store.
    pub fn open(kv: impl KvStore + 'static) -> Self {
        let kv: Box<dyn KvStore> = Box::new(kv);
        let data = match kv.load(STORAGE_KEY) {
            Ok(None) => AppState::default(),
            Ok(Some(bytes)) => match serde_json::from_slice::<AppState>(&bytes) {
                Ok(state) => match state.find_duplicate_id() {
                    None => state,
                    Some((collection, id)) => {
                        crate::tlog!(
                            "store: corrupt snapshot (duplicate {} id {}), resetting store",
                            collection,
                            record_id(&id)
                        );
                        wipe(kv.as_ref())
                    }
                },
                Err(e) => {
                    crate::tlog!("store: corrupt snapshot, resetting store: {}", e);
                    wipe(kv.as_ref())
                }
            },
            Err(e) => {
                crate::tlog!("store: snapshot unreadable, resetting store: {}", e);
                wipe(kv.as_ref())
            }
        };
        Self {
            kv,
            data: Mutex::new(data),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The four collections without soft-deleted records.
    pub fn state(&self) -> AppState {
        lock(&self.data).live()
    }

    /// Full snapshot including soft-deleted records and sync status.
    pub fn raw(&self) -> AppState {
        lock(&self.data).clone()
    }

    /// Run `f` against the unfiltered snapshot without cloning it.
    pub fn with_raw<T>(&self, f: impl FnOnce(&AppState) -> T) -> T {
        f(&lock(&self.data))
    }

    /// A live (not soft-deleted) record by id.
    pub fn get<R: Record>(&self, id: &str) -> Option<R> {
        let data = lock(&self.data);
        R::rows(&data)
            .iter()
            .find(|r| r.id() == id && !r.meta().is_deleted())
            .cloned()
    }

    pub fn list<R: Record>(&self) -> Vec<R> {
        let data = lock(&self.data);
        R::rows(&data)
            .iter()
            .filter(|r| !r.meta().is_deleted())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.data).pending_count()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert or shallow-merge a record.
    ///
    /// With [`Origin::Remote`], a stored record whose `updated_at` is at least
    /// the incoming one wins and is returned unchanged.
    pub fn upsert<R: Record>(&self, patch: Patch, origin: Origin) -> Result<R, StoreError> {
        let id = patch.id().to_string();
        let record = {
            let mut data = lock(&self.data);
            let rows = R::rows_mut(&mut data);
            let index = rows.iter().position(|r| r.id() == id);
            let existing = index.map(|i| &rows[i]);

            if origin == Origin::Remote {
                if let (Some(current), Some(incoming)) = (existing, patch.updated_at()) {
                    if current.meta().updated_at >= incoming {
                        return Ok(current.clone());
                    }
                }
            }

            let merged: R = merge(existing, patch, origin, now_millis())?;
            let previous = match index {
                Some(i) => Some(std::mem::replace(&mut rows[i], merged.clone())),
                None => {
                    rows.push(merged.clone());
                    None
                }
            };

            if let Err(e) = self.persist(&data) {
                let rows = R::rows_mut(&mut data);
                match (index, previous) {
                    (Some(i), Some(prev)) => rows[i] = prev,
                    _ => {
                        rows.pop();
                    }
                }
                return Err(e);
            }
            merged
        };

        self.notify(&StoreEvent::Upserted {
            collection: R::COLLECTION,
            id,
        });
        Ok(record)
    }

    /// [`LocalStore::upsert`] for a collection chosen at runtime.
    pub fn upsert_in(
        &self,
        collection: Collection,
        patch: Patch,
        origin: Origin,
    ) -> Result<RecordMeta, StoreError> {
        Ok(match collection {
            Collection::Projects => self.upsert::<Project>(patch, origin)?.meta,
            Collection::Finances => self.upsert::<FinanceEntry>(patch, origin)?.meta,
            Collection::Tasks => self.upsert::<Task>(patch, origin)?.meta,
            Collection::Vault => self.upsert::<VaultEntry>(patch, origin)?.meta,
        })
    }

    /// Soft-delete: stamp `deleted_at` and flag for push.
    ///
    /// Returns `false` when no record has that id.
    pub fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        {
            let mut data = lock(&self.data);
            let Some(meta) = data.meta_mut(collection, id) else {
                return Ok(false);
            };
            let previous = meta.clone();
            let now = now_millis();
            meta.deleted_at = Some(now);
            meta.updated_at = now.max(previous.updated_at);
            meta.sync_status = SyncStatus::Pending;

            if let Err(e) = self.persist(&data) {
                if let Some(meta) = data.meta_mut(collection, id) {
                    *meta = previous;
                }
                return Err(e);
            }
        }

        self.notify(&StoreEvent::Deleted {
            collection,
            id: id.to_string(),
        });
        Ok(true)
    }

    /// Flag a record as accepted by the remote. Persists without notifying.
    pub fn mark_synced(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        self.set_synced(collection, id, None)
    }

    /// Like [`LocalStore::mark_synced`], but only while the record still has
    /// the `updated_at` that was pushed. A record edited in the meantime
    /// stays pending and is left untouched (`Ok(false)`).
    pub fn mark_synced_if_unchanged(
        &self,
        collection: Collection,
        id: &str,
        pushed_updated_at: Millis,
    ) -> Result<bool, StoreError> {
        self.set_synced(collection, id, Some(pushed_updated_at))
    }

    fn set_synced(
        &self,
        collection: Collection,
        id: &str,
        expected_updated_at: Option<Millis>,
    ) -> Result<bool, StoreError> {
        let mut data = lock(&self.data);
        let Some(meta) = data.meta_mut(collection, id) else {
            return Ok(false);
        };
        if expected_updated_at.is_some_and(|t| t != meta.updated_at) {
            return Ok(false);
        }
        let previous = meta.sync_status;
        meta.sync_status = SyncStatus::Synced;

        if let Err(e) = self.persist(&data) {
            if let Some(meta) = data.meta_mut(collection, id) {
                meta.sync_status = previous;
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Drop every record and erase the persisted snapshot.
    ///
    /// The in-memory state is emptied even if erasing storage fails.
    pub fn clear(&self) -> Result<(), StoreError> {
        let result = {
            let mut data = lock(&self.data);
            *data = AppState::default();
            self.kv.remove(STORAGE_KEY)
        };
        self.notify(&StoreEvent::Cleared);
        result.map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Subscribers
    // -----------------------------------------------------------------------

    /// Register a callback run after every persisted upsert, delete, or clear.
    pub fn subscribe(&self, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Subscription {
        let mut listeners = lock(&self.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(callback)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn notify(&self, event: &StoreEvent) {
        // Snapshot first so callbacks may (un)subscribe or read the store.
        let callbacks: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn persist(&self, data: &AppState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(data)?;
        self.kv.save(STORAGE_KEY, &bytes)?;
        Ok(())
    }
}

fn wipe(kv: &dyn KvStore) -> AppState {
    if let Err(e) = kv.remove(STORAGE_KEY) {
        crate::tlog!("store: failed to erase snapshot: {}", e);
    }
    AppState::default()
}

/// Build the post-upsert record from the stored one (if any) and the patch.
fn merge<R: Record>(
    existing: Option<&R>,
    patch: Patch,
    origin: Origin,
    now: Millis,
) -> Result<R, StoreError> {
    let id = patch.id().to_string();
    let incoming_updated = patch.updated_at();
    let incoming_created = patch.created_at();
    let invalid = |reason: String| StoreError::InvalidRecord {
        collection: R::COLLECTION,
        id: id.clone(),
        reason,
    };

    let (mut object, created_at, previous_updated) = match existing {
        Some(record) => (
            to_object(record)?,
            record.meta().created_at,
            record.meta().updated_at,
        ),
        None => {
            let created = match origin {
                Origin::Remote => incoming_created.unwrap_or(now),
                Origin::Local => now,
            };
            (to_object(&R::default())?, created, 0)
        }
    };

    for (key, value) in patch.into_fields() {
        match key.as_str() {
            "id" | "created_at" | "updated_at" | "sync_status" => {}
            _ => {
                object.insert(key, value);
            }
        }
    }

    let (updated_at, sync_status) = match origin {
        Origin::Remote => (incoming_updated.unwrap_or(now), SyncStatus::Synced),
        Origin::Local => (now.max(previous_updated), SyncStatus::Pending),
    };

    let mut record: R =
        serde_json::from_value(Value::Object(object)).map_err(|e| invalid(e.to_string()))?;
    let meta = record.meta_mut();
    meta.id = id.clone();
    meta.created_at = created_at;
    meta.updated_at = updated_at;
    meta.sync_status = sync_status;
    record.validate().map_err(invalid)?;
    Ok(record)
}

fn to_object<R: Record>(record: &R) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{Priority, ProjectStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_store() -> (LocalStore, MemoryKv) {
        let kv = MemoryKv::new();
        (LocalStore::open(kv.clone()), kv)
    }

    #[test]
    fn test_new_record_gets_defaults_and_timestamps() {
        let (store, _) = test_store();
        let project: Project = store
            .upsert(Patch::new("p1").set("name", "Atlas"), Origin::Local)
            .unwrap();
        assert_eq!(project.name, "Atlas");
        assert_eq!(project.progress, 0);
        assert_eq!(project.status, ProjectStatus::Planning);
        assert_eq!(project.github_url, "");
        assert!(project.meta.created_at > 0);
        assert_eq!(project.meta.created_at, project.meta.updated_at);
        assert_eq!(project.meta.sync_status, SyncStatus::Pending);
        assert!(project.meta.deleted_at.is_none());
    }

    #[test]
    fn test_partial_update_preserves_absent_fields() {
        let (store, _) = test_store();
        store
            .upsert::<Task>(
                Patch::new("t1")
                    .set("title", "Write tests")
                    .set("priority", Priority::High),
                Origin::Local,
            )
            .unwrap();
        let task: Task = store
            .upsert(Patch::new("t1").set("completed", true), Origin::Local)
            .unwrap();
        assert!(task.completed);
        assert_eq!(task.title, "Write tests");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(store.list::<Task>().len(), 1);
    }

    #[test]
    fn test_local_upsert_ignores_caller_timestamps() {
        let (store, _) = test_store();
        let task: Task = store
            .upsert(
                Patch::new("t1")
                    .set("updated_at", 5u64)
                    .set("created_at", 5u64)
                    .set("sync_status", "synced"),
                Origin::Local,
            )
            .unwrap();
        assert!(task.meta.updated_at > 5);
        assert!(task.meta.created_at > 5);
        assert_eq!(task.meta.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_created_at_is_never_rewritten() {
        let (store, _) = test_store();
        let first: Task = store.upsert(Patch::new("t1"), Origin::Local).unwrap();
        let later: Task = store
            .upsert(
                Patch::new("t1")
                    .set("created_at", 1u64)
                    .set("updated_at", first.meta.updated_at + 1_000),
                Origin::Remote,
            )
            .unwrap();
        assert_eq!(later.meta.created_at, first.meta.created_at);
    }

    #[test]
    fn test_invalid_record_is_rejected_without_side_effects() {
        let (store, kv) = test_store();
        let err = store
            .upsert::<Project>(Patch::new("p1").set("progress", 150), Origin::Local)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));

        let err = store
            .upsert::<Task>(Patch::new("t1").set("priority", "Urgent"), Origin::Local)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord { .. }));

        assert!(store.raw().is_empty());
        assert!(kv.get_raw(STORAGE_KEY).is_none());
    }

    #[test]
    fn test_explicit_deleted_at_overwrites() {
        let (store, _) = test_store();
        store.upsert::<Task>(Patch::new("t1"), Origin::Local).unwrap();
        store.delete(Collection::Tasks, "t1").unwrap();
        assert!(store.get::<Task>("t1").is_none());

        // Absent deleted_at keeps the tombstone
        store
            .upsert::<Task>(Patch::new("t1").set("title", "still gone"), Origin::Local)
            .unwrap();
        assert!(store.get::<Task>("t1").is_none());

        // Explicit null resurrects
        let task: Task = store
            .upsert(Patch::new("t1").set("deleted_at", Value::Null), Origin::Local)
            .unwrap();
        assert!(task.meta.deleted_at.is_none());
        assert_eq!(store.get::<Task>("t1").unwrap().title, "still gone");
    }

    #[test]
    fn test_delete_missing_record_is_noop() {
        let (store, _) = test_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!store.delete(Collection::Vault, "nope").unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mark_synced_touches_only_status_and_does_not_notify() {
        let (store, _) = test_store();
        let before: Task = store
            .upsert(Patch::new("t1").set("title", "x"), Origin::Local)
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.mark_synced(Collection::Tasks, "t1").unwrap());
        let after = store.get::<Task>("t1").unwrap();
        assert_eq!(after.meta.sync_status, SyncStatus::Synced);
        assert_eq!(after.meta.updated_at, before.meta.updated_at);
        assert_eq!(after.title, before.title);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!store.mark_synced(Collection::Tasks, "other").unwrap());
    }

    #[test]
    fn test_mark_synced_if_unchanged_skips_newer_edits() {
        let (store, _) = test_store();
        let pushed: Task = store.upsert(Patch::new("t1"), Origin::Local).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let edited: Task = store
            .upsert(Patch::new("t1").set("title", "edited mid-push"), Origin::Local)
            .unwrap();
        assert!(edited.meta.updated_at > pushed.meta.updated_at);

        assert!(!store
            .mark_synced_if_unchanged(Collection::Tasks, "t1", pushed.meta.updated_at)
            .unwrap());
        assert!(store.get::<Task>("t1").unwrap().meta.is_pending());
        assert!(store
            .mark_synced_if_unchanged(Collection::Tasks, "t1", edited.meta.updated_at)
            .unwrap());
        assert!(!store.get::<Task>("t1").unwrap().meta.is_pending());
    }

    #[test]
    fn test_failed_write_rolls_back_and_propagates() {
        let (store, kv) = test_store();
        store
            .upsert::<Task>(Patch::new("t1").set("title", "kept"), Origin::Local)
            .unwrap();

        kv.set_fail_writes(true);
        let err = store
            .upsert::<Task>(Patch::new("t1").set("title", "lost"), Origin::Local)
            .unwrap_err();
        assert!(matches!(err, StoreError::Kv(_)));
        assert!(store
            .upsert::<Task>(Patch::new("t2"), Origin::Local)
            .is_err());
        assert!(store.delete(Collection::Tasks, "t1").is_err());

        let state = store.state();
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].title, "kept");
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let (store, _) = test_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        store.upsert::<Task>(Patch::new("t1"), Origin::Local).unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        store.upsert::<Task>(Patch::new("t2"), Origin::Local).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_ids_in_snapshot_reset_the_store() {
        let kv = MemoryKv::new();
        let row = json!({"id": "t1", "title": "a"});
        let snapshot = json!({"tasks": [row.clone(), row]});
        kv.put_raw(STORAGE_KEY, snapshot.to_string().as_bytes());

        let store = LocalStore::open(kv.clone());
        assert!(store.raw().is_empty());
        assert!(kv.get_raw(STORAGE_KEY).is_none());
    }
}
