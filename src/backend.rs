//! Reference remote backend: a small axum service storing rows per
//! collection with per-principal ownership.
//!
//! Routes:
//!
//! - `GET  /health`
//! - `POST /rest/:collection` with a JSON array body: batch upsert by id
//! - `GET  /rest/:collection?updated_after=<ms>`: the caller's newer rows
//!
//! The principal is taken from `Authorization: Bearer <principal>`.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;

use crate::clock::Millis;
use crate::config::EPOCH_FLOOR;
use crate::kv::KvStore;
use crate::model::Collection;
use crate::remote::{RemoteError, RemoteTable};

/// Key under which a persistent backend saves its rows.
pub const BACKEND_SNAPSHOT_KEY: &str = "devlife_backend_rows";

#[derive(Clone)]
pub struct BackendState {
    table: Arc<Mutex<RemoteTable>>,
    kv: Option<Arc<dyn KvStore>>,
}

#[derive(Deserialize)]
struct RowsQuery {
    updated_after: Option<Millis>,
}

impl BackendState {
    pub fn in_memory() -> Self {
        Self {
            table: Arc::new(Mutex::new(RemoteTable::new())),
            kv: None,
        }
    }

    /// Rows are loaded from `kv` now and saved back after every accepted batch.
    pub fn persistent(kv: impl KvStore + 'static) -> Self {
        let table = match kv.load(BACKEND_SNAPSHOT_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                crate::tlog!("backend: stored rows unreadable, starting empty: {}", e);
                RemoteTable::new()
            }),
            Ok(None) => RemoteTable::new(),
            Err(e) => {
                crate::tlog!("backend: failed to load rows, starting empty: {}", e);
                RemoteTable::new()
            }
        };
        Self {
            table: Arc::new(Mutex::new(table)),
            kv: Some(Arc::new(kv)),
        }
    }

    fn table(&self) -> MutexGuard<'_, RemoteTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, table: &RemoteTable) -> Result<(), String> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(table).map_err(|e| e.to_string())?;
        kv.save(BACKEND_SNAPSHOT_KEY, &bytes).map_err(|e| e.to_string())
    }
}

pub fn app(state: BackendState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/rest/:collection", get(query_rows).post(upsert_rows))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

fn principal_from(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let principal = value.strip_prefix("Bearer ")?.trim();
    (!principal.is_empty()).then(|| principal.to_string())
}

/// Resolve the caller and the collection or produce the error response.
fn scope(headers: &HeaderMap, collection: &str) -> Result<(String, Collection), Response> {
    let principal = principal_from(headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer principal").into_response())?;
    let collection = collection
        .parse::<Collection>()
        .map_err(|e| (StatusCode::NOT_FOUND, e).into_response())?;
    Ok((principal, collection))
}

async fn upsert_rows(
    State(state): State<BackendState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(rows): Json<Vec<Value>>,
) -> impl IntoResponse {
    let (principal, collection) = match scope(&headers, &collection) {
        Ok(scope) => scope,
        Err(response) => return response,
    };

    let mut table = state.table();
    let undo = match table.apply_batch(collection, &principal, rows) {
        Ok(undo) => undo,
        Err(RemoteError::Forbidden(id)) => {
            crate::tlog!("backend: {} denied write to {} {}", principal, collection, id);
            return (StatusCode::FORBIDDEN, id).into_response();
        }
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    if let Err(e) = state.save(&table) {
        crate::tlog!("backend: failed to save rows: {}", e);
        table.revert(undo);
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
    }

    (StatusCode::OK, Json(serde_json::json!({ "upserted": undo.len() }))).into_response()
}

async fn query_rows(
    State(state): State<BackendState>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Query(query): Query<RowsQuery>,
) -> impl IntoResponse {
    let (principal, collection) = match scope(&headers, &collection) {
        Ok(scope) => scope,
        Err(response) => return response,
    };
    let updated_after = query.updated_after.unwrap_or(EPOCH_FLOOR);
    let rows = state.table().newer_than(collection, &principal, updated_after);
    (StatusCode::OK, Json(rows)).into_response()
}
