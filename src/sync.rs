//! Reconciling the local store with the remote store.
//!
//! A sweep walks [`Collection::ALL`] in order and, per collection, pushes
//! pending records and then pulls rows newer than the newest record the
//! remote had already confirmed before the push.
//! Failures stay inside the collection they happened in and are reported in
//! the returned [`SyncReport`]; records that failed to push stay pending and
//! are retried by the next sweep.
//!
//! At most one sweep runs at a time.  [`SyncEngine::sync_all`] claims the
//! guard when it is *called*, not when its future is first polled, so a
//! second call made before the first is awaited is skipped without touching
//! the network.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::auth::AuthProvider;
use crate::clock::{now_millis, Millis};
use crate::config::EPOCH_FLOOR;
use crate::logging::record_id;
use crate::model::{Collection, Patch, RecordMeta};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{LocalStore, Origin, StoreError};

// ---------------------------------------------------------------------------
// Error and report types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SyncError {
    Remote(RemoteError),
    Store(StoreError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Remote(e) => write!(f, "{e}"),
            SyncError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Remote(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Store(StoreError::Serde(e))
    }
}

/// What one sweep did to one collection.
#[derive(Debug)]
pub struct CollectionReport {
    pub collection: Collection,
    /// Records accepted by the remote.
    pub pushed: Result<usize, SyncError>,
    /// Rows received from the remote and offered to the store.
    pub pulled: Result<usize, SyncError>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub collections: Vec<CollectionReport>,
}

impl SyncReport {
    pub fn pushed(&self) -> usize {
        self.collections
            .iter()
            .filter_map(|c| c.pushed.as_ref().ok())
            .sum()
    }

    pub fn pulled(&self) -> usize {
        self.collections
            .iter()
            .filter_map(|c| c.pulled.as_ref().ok())
            .sum()
    }

    pub fn failures(&self) -> Vec<(Collection, &SyncError)> {
        let mut failures = Vec::new();
        for report in &self.collections {
            if let Err(e) = &report.pushed {
                failures.push((report.collection, e));
            }
            if let Err(e) = &report.pulled {
                failures.push((report.collection, e));
            }
        }
        failures
    }

    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn collection(&self, collection: Collection) -> Option<&CollectionReport> {
        self.collections.iter().find(|c| c.collection == collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Unauthenticated,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Releases the sweep flag when the sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine<R, A> {
    store: Arc<LocalStore>,
    remote: R,
    auth: A,
    syncing: AtomicBool,
    started: AtomicBool,
}

impl<R: RemoteStore, A: AuthProvider> SyncEngine<R, A> {
    pub fn new(store: Arc<LocalStore>, remote: R, auth: A) -> Self {
        Self {
            store,
            remote,
            auth,
            syncing: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// One push-then-pull pass over every collection.
    pub fn sync_all(&self) -> impl Future<Output = SyncOutcome> + Send + '_ {
        let guard = SweepGuard::acquire(&self.syncing);
        async move {
            let Some(_guard) = guard else {
                crate::tdebug!("sync: sweep already running, skipping");
                return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
            };
            let Some(principal) = self.auth.current_principal().await else {
                crate::tdebug!("sync: no signed-in principal, skipping sweep");
                return SyncOutcome::Skipped(SkipReason::Unauthenticated);
            };

            let mut report = SyncReport::default();
            for collection in Collection::ALL {
                // Before the push: pushed records turn synced while still
                // holding their local edit stamps.
                let since = self.last_sync(collection);
                let pushed = self.push_pending(collection, &principal).await;
                let pulled = self.pull_since(collection, &principal, since).await;
                report.collections.push(CollectionReport {
                    collection,
                    pushed,
                    pulled,
                });
            }
            crate::tdebug!(
                "sync: sweep done, pushed {} pulled {} ({} failure(s))",
                report.pushed(),
                report.pulled(),
                report.failures().len()
            );
            SyncOutcome::Completed(report)
        }
    }

    /// Send every pending record of `collection` as one batch.
    ///
    /// Rows are stamped with the time they are sent, so they sort after
    /// everything other devices have already pulled. After the remote
    /// accepts the batch, each record is marked synced unless it was edited
    /// again while the request was in flight.
    pub async fn push_pending(
        &self,
        collection: Collection,
        principal: &str,
    ) -> Result<usize, SyncError> {
        let (rows, versions) = self.pending_rows(collection, principal)?;
        if rows.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.remote.upsert_batch(collection, principal, rows).await {
            crate::tlog!(
                "sync: push {} failed, {} record(s) stay pending: {}",
                collection,
                versions.len(),
                e
            );
            return Err(e.into());
        }

        for (id, updated_at) in &versions {
            if !self
                .store
                .mark_synced_if_unchanged(collection, id, *updated_at)?
            {
                crate::tdebug!(
                    "sync: {} {} changed during push, left pending",
                    collection,
                    record_id(id)
                );
            }
        }
        crate::tdebug!("sync: pushed {} {} record(s)", versions.len(), collection);
        Ok(versions.len())
    }

    /// Apply remote rows newer than the newest synced record of `collection`.
    pub async fn pull_updates(
        &self,
        collection: Collection,
        principal: &str,
    ) -> Result<usize, SyncError> {
        let since = self.last_sync(collection);
        self.pull_since(collection, principal, since).await
    }

    fn last_sync(&self, collection: Collection) -> Millis {
        self.store
            .with_raw(|state| state.last_synced_at(collection))
            .unwrap_or(EPOCH_FLOOR)
    }

    async fn pull_since(
        &self,
        collection: Collection,
        principal: &str,
        since: Millis,
    ) -> Result<usize, SyncError> {
        let rows = match self
            .remote
            .query_newer_than(collection, principal, since)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                crate::tlog!("sync: pull {} failed: {}", collection, e);
                return Err(e.into());
            }
        };

        let received = rows.len();
        for row in rows {
            let patch = match Patch::from_json(row) {
                Ok(patch) => patch,
                Err(e) => {
                    crate::tlog!("sync: skipping malformed {} row: {}", collection, e);
                    continue;
                }
            };
            match self.store.upsert_in(collection, patch, Origin::Remote) {
                Ok(_) => {}
                Err(e @ StoreError::InvalidRecord { .. }) => {
                    crate::tlog!("sync: skipping remote row: {}", e);
                }
                Err(e) => {
                    crate::tlog!("sync: pull {} could not be stored: {}", collection, e);
                    return Err(e.into());
                }
            }
        }
        if received > 0 {
            crate::tdebug!("sync: pulled {} {} row(s)", received, collection);
        }
        Ok(received)
    }

    /// Pending rows in wire form, stamped for transmission, paired with the
    /// local `updated_at` of each record.
    fn pending_rows(
        &self,
        collection: Collection,
        principal: &str,
    ) -> Result<(Vec<Value>, Vec<(String, Millis)>), SyncError> {
        let sent_at = now_millis();
        self.store.with_raw(|state| {
            let rows = state.rows_json(collection, RecordMeta::is_pending)?;
            let mut versions = Vec::with_capacity(rows.len());
            let mut stamped = Vec::with_capacity(rows.len());
            for row in rows {
                let Value::Object(mut fields) = row else {
                    continue;
                };
                let id = fields.get("id").and_then(Value::as_str).unwrap_or_default();
                let local = fields.get("updated_at").and_then(Value::as_u64).unwrap_or(0);
                versions.push((id.to_string(), local));
                // At or after the local stamp.
                fields.insert("updated_at".to_string(), Value::from(sent_at.max(local)));
                fields.remove("sync_status");
                fields.insert("user_id".to_string(), Value::from(principal));
                stamped.push(Value::Object(fields));
            }
            Ok((stamped, versions))
        })
    }

    /// Run a sweep now, then every `every`, and whenever
    /// [`SyncHandle::notify_reconnected`] is called.
    ///
    /// Returns `None` if background sync is already running for this engine.
    pub fn start(self: &Arc<Self>, every: Duration) -> Option<SyncHandle> {
        if self.started.swap(true, Ordering::AcqRel) {
            crate::tlog!("sync: background sync already running");
            return None;
        }

        let reconnect = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let engine = Arc::clone(self);
        let wake = Arc::clone(&reconnect);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // The first tick completes immediately.
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {
                        crate::tdebug!("sync: reconnected, sweeping");
                    }
                }
                let outcome = engine.sync_all().await;
                outcome_tx.send_replace(Some(Arc::new(outcome)));
            }
            engine.started.store(false, Ordering::Release);
        });

        Some(SyncHandle {
            reconnect,
            shutdown: shutdown_tx,
            outcomes: outcome_rx,
            task,
        })
    }
}

/// Owns the background sync task started by [`SyncEngine::start`].
///
/// Dropping the handle also stops the task after its current sweep.
pub struct SyncHandle {
    reconnect: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    outcomes: watch::Receiver<Option<Arc<SyncOutcome>>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Request a sweep because connectivity came back.
    ///
    /// Requests made while a sweep is running collapse into one more sweep.
    pub fn notify_reconnected(&self) {
        self.reconnect.notify_one();
    }

    /// Outcome of the most recent background sweep.
    pub fn latest(&self) -> Option<Arc<SyncOutcome>> {
        self.outcomes.borrow().clone()
    }

    /// A receiver that changes after every background sweep.
    pub fn outcomes(&self) -> watch::Receiver<Option<Arc<SyncOutcome>>> {
        self.outcomes.clone()
    }

    /// Stop the task and wait for it. A sweep in flight runs to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            crate::tlog!("sync: background task ended abnormally: {}", e);
        }
    }
}
