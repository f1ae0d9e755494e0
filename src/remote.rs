//! The remote replica: the [`RemoteStore`] seam the sync engine talks to,
//! an HTTP implementation for the `devlife-backend` server, and an
//! in-process implementation.
//!
//! Rows travel as JSON objects keyed by `id`. Every row is owned by the
//! principal that first wrote it (`user_id`); other principals can neither
//! read nor overwrite it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{now_millis, Millis};
use crate::model::Collection;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    Transport(String),
    Status { code: u16, body: String },
    Unauthorized,
    Forbidden(String),
    Malformed(String),
    Decode(String),
    Offline,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Transport(e) => write!(f, "transport error: {e}"),
            RemoteError::Status { code, body } => write!(f, "remote returned {code}: {body}"),
            RemoteError::Unauthorized => write!(f, "remote rejected credentials"),
            RemoteError::Forbidden(id) => write!(f, "row {id} belongs to another principal"),
            RemoteError::Malformed(msg) => write!(f, "malformed row: {msg}"),
            RemoteError::Decode(e) => write!(f, "invalid response body: {e}"),
            RemoteError::Offline => write!(f, "remote is offline"),
        }
    }
}

impl std::error::Error for RemoteError {}

// ---------------------------------------------------------------------------
// Interface
// ---------------------------------------------------------------------------

pub trait RemoteStore: Send + Sync + 'static {
    /// Insert-or-replace `rows` by `id` as one batch.
    fn upsert_batch(
        &self,
        collection: Collection,
        principal: &str,
        rows: Vec<Value>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Rows owned by `principal` with `updated_at` strictly after `updated_after`.
    fn query_newer_than(
        &self,
        collection: Collection,
        principal: &str,
        updated_after: Millis,
    ) -> impl Future<Output = Result<Vec<Value>, RemoteError>> + Send;
}

// ---------------------------------------------------------------------------
// Row table shared by the in-process remote and the HTTP backend
// ---------------------------------------------------------------------------

/// Rows per collection keyed by id. Serializes as
/// `{"tasks": {"<id>": {...}}, ...}` for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTable {
    rows: HashMap<Collection, HashMap<String, Value>>,
}

/// Rows overwritten by one applied batch, in the order they were written.
#[derive(Debug)]
pub struct BatchUndo {
    collection: Collection,
    previous: Vec<(String, Option<Value>)>,
}

impl BatchUndo {
    /// Number of rows the batch wrote.
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

fn owner(row: &Value) -> Option<&str> {
    row.get("user_id").and_then(Value::as_str)
}

fn updated_at(row: &Value) -> Option<Millis> {
    row.get("updated_at").and_then(Value::as_u64)
}

impl RemoteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch atomically: either every row is stored or none is.
    ///
    /// Rows are stamped with `principal` as owner and lose any `sync_status`.
    /// A row without a numeric `updated_at` is stamped with the current time.
    pub fn upsert_batch(
        &mut self,
        collection: Collection,
        principal: &str,
        rows: Vec<Value>,
    ) -> Result<usize, RemoteError> {
        let undo = self.apply_batch(collection, principal, rows)?;
        Ok(undo.len())
    }

    /// [`RemoteTable::upsert_batch`], returning what the batch overwrote so
    /// it can be reverted with [`RemoteTable::revert`].
    pub fn apply_batch(
        &mut self,
        collection: Collection,
        principal: &str,
        rows: Vec<Value>,
    ) -> Result<BatchUndo, RemoteError> {
        let table = self.rows.entry(collection).or_default();
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let Value::Object(mut fields) = row else {
                return Err(RemoteError::Malformed("row is not a JSON object".to_string()));
            };
            let id = match fields.get("id") {
                Some(Value::String(id)) if !id.is_empty() => id.clone(),
                _ => return Err(RemoteError::Malformed("row has no string id".to_string())),
            };
            if let Some(existing) = table.get(&id) {
                if owner(existing) != Some(principal) {
                    return Err(RemoteError::Forbidden(id));
                }
            }
            fields.remove("sync_status");
            fields.insert("user_id".to_string(), Value::from(principal));
            if !fields.get("updated_at").is_some_and(Value::is_u64) {
                fields.insert("updated_at".to_string(), Value::from(now_millis()));
            }
            prepared.push((id, Value::Object(fields)));
        }
        let previous = prepared
            .into_iter()
            .map(|(id, row)| {
                let old = table.insert(id.clone(), row);
                (id, old)
            })
            .collect();
        Ok(BatchUndo {
            collection,
            previous,
        })
    }

    /// Put back the rows a batch replaced and drop the ones it created.
    pub fn revert(&mut self, undo: BatchUndo) {
        let table = self.rows.entry(undo.collection).or_default();
        // Newest first, so an id repeated within the batch ends at its
        // value from before the batch.
        for (id, old) in undo.previous.into_iter().rev() {
            match old {
                Some(row) => {
                    table.insert(id, row);
                }
                None => {
                    table.remove(&id);
                }
            }
        }
    }

    /// Rows owned by `principal` newer than `updated_after`, oldest first.
    pub fn newer_than(
        &self,
        collection: Collection,
        principal: &str,
        updated_after: Millis,
    ) -> Vec<Value> {
        let mut rows: Vec<Value> = self
            .rows
            .get(&collection)
            .into_iter()
            .flat_map(|table| table.values())
            .filter(|row| owner(row) == Some(principal))
            .filter(|row| updated_at(row).is_some_and(|t| t > updated_after))
            .cloned()
            .collect();
        rows.sort_by_key(|row| updated_at(row).unwrap_or(0));
        rows
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<&Value> {
        self.rows.get(&collection).and_then(|table| table.get(id))
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.rows.get(&collection).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.values().all(HashMap::is_empty)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// In-process remote
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryRemoteInner {
    table: Mutex<RemoteTable>,
    offline: AtomicBool,
    failing: Mutex<HashSet<Collection>>,
    latency_ms: AtomicU64,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

/// A remote living in the current process. Clones share the same rows.
///
/// Can be switched offline, made to fail for single collections, and given
/// artificial latency; it counts every call it receives.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<MemoryRemoteInner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_failing(&self, collection: Collection, failing: bool) {
        let mut set = lock(&self.inner.failing);
        if failing {
            set.insert(collection);
        } else {
            set.remove(&collection);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn push_calls(&self) -> usize {
        self.inner.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.inner.pull_calls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.push_calls() + self.pull_calls()
    }

    /// Write rows directly, as another device of `principal` would.
    pub fn seed(
        &self,
        collection: Collection,
        principal: &str,
        rows: Vec<Value>,
    ) -> Result<usize, RemoteError> {
        lock(&self.inner.table).upsert_batch(collection, principal, rows)
    }

    pub fn row(&self, collection: Collection, id: &str) -> Option<Value> {
        lock(&self.inner.table).get(collection, id).cloned()
    }

    pub fn len(&self, collection: Collection) -> usize {
        lock(&self.inner.table).len(collection)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.table).is_empty()
    }

    async fn simulate(&self, collection: Collection) -> Result<(), RemoteError> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Offline);
        }
        let failing = lock(&self.inner.failing).contains(&collection);
        if failing {
            return Err(RemoteError::Status {
                code: 503,
                body: format!("{collection} unavailable"),
            });
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemote {
    async fn upsert_batch(
        &self,
        collection: Collection,
        principal: &str,
        rows: Vec<Value>,
    ) -> Result<(), RemoteError> {
        self.inner.push_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate(collection).await?;
        lock(&self.inner.table).upsert_batch(collection, principal, rows)?;
        Ok(())
    }

    async fn query_newer_than(
        &self,
        collection: Collection,
        principal: &str,
        updated_after: Millis,
    ) -> Result<Vec<Value>, RemoteError> {
        self.inner.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate(collection).await?;
        let rows = lock(&self.inner.table).newer_than(collection, principal, updated_after);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// HTTP remote
// ---------------------------------------------------------------------------

/// Talks JSON to a `devlife-backend` server.
///
/// The principal id is sent as the bearer token.
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/rest/{}", self.base_url, collection)
    }
}

fn map_ureq_error(error: ureq::Error) -> RemoteError {
    match error {
        ureq::Error::Status(401, _) => RemoteError::Unauthorized,
        ureq::Error::Status(403, response) => {
            RemoteError::Forbidden(response.into_string().unwrap_or_default())
        }
        ureq::Error::Status(code, response) => RemoteError::Status {
            code,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => RemoteError::Transport(transport.to_string()),
    }
}

/// ureq is blocking; keep it off the async workers.
async fn run_blocking<T, F>(request: F) -> Result<T, RemoteError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
{
    tokio::task::spawn_blocking(request)
        .await
        .map_err(|e| RemoteError::Transport(format!("request task failed: {e}")))?
}

impl RemoteStore for HttpRemoteStore {
    async fn upsert_batch(
        &self,
        collection: Collection,
        principal: &str,
        rows: Vec<Value>,
    ) -> Result<(), RemoteError> {
        let url = self.collection_url(collection);
        let agent = self.agent.clone();
        let auth = format!("Bearer {principal}");
        run_blocking(move || {
            agent
                .post(&url)
                .set("Authorization", &auth)
                .send_json(Value::Array(rows))
                .map_err(map_ureq_error)?;
            Ok(())
        })
        .await
    }

    async fn query_newer_than(
        &self,
        collection: Collection,
        principal: &str,
        updated_after: Millis,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = self.collection_url(collection);
        let agent = self.agent.clone();
        let auth = format!("Bearer {principal}");
        run_blocking(move || {
            agent
                .get(&url)
                .set("Authorization", &auth)
                .query("updated_after", &updated_after.to_string())
                .call()
                .map_err(map_ureq_error)?
                .into_json::<Vec<Value>>()
                .map_err(|e| RemoteError::Decode(e.to_string()))
        })
        .await
    }
}
