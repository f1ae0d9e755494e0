//! Record types for the four collections and the shared envelope they carry.
//!
//! Field names on the wire match the remote schema (`github_url`, `type`,
//! `due_date`, ...), so a record serializes to exactly the JSON row the
//! remote store keeps, plus the local-only `sync_status`.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::Millis;

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// The closed set of record collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Projects,
    Finances,
    Tasks,
    Vault,
}

impl Collection {
    /// Sweep order used by the sync engine.
    pub const ALL: [Collection; 4] = [
        Collection::Projects,
        Collection::Finances,
        Collection::Tasks,
        Collection::Vault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Finances => "finances",
            Collection::Tasks => "tasks",
            Collection::Vault => "vault",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown collection: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local changes not yet accepted by the remote.
    #[default]
    Pending,
    Synced,
}

/// Fields every persisted record carries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: String,
    /// Ownership key attached by the remote; absent on purely local records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Millis,
    #[serde(default)]
    pub updated_at: Millis,
    #[serde(default)]
    pub deleted_at: Option<Millis>,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl RecordMeta {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Field enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProjectStatus {
    #[default]
    Planning,
    #[serde(rename = "In Progress")]
    InProgress,
    Completed,
    #[serde(rename = "On Hold")]
    OnHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinanceKind {
    #[default]
    Income,
    Expense,
    Loan,
    Repayment,
    BusinessDelivery,
    BusinessPayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatRule {
    #[default]
    None,
    Daily,
    Weekly,
}

/// Parses the wire spelling of a field enum (`"In Progress"`, `"business_payment"`).
fn parse_wire<T: DeserializeOwned>(s: &str) -> Result<T, String> {
    serde_json::from_value(Value::String(s.to_string())).map_err(|_| format!("invalid value: {s}"))
}

macro_rules! wire_enum {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Value {
            fn from(v: $ty) -> Value {
                serde_json::to_value(v).unwrap_or(Value::Null)
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_wire(s)
            }
        }
    )*};
}

wire_enum!(ProjectStatus, FinanceKind, Priority, RepeatRule);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub name: String,
    pub github_url: String,
    pub live_url: String,
    pub status: ProjectStatus,
    /// Percentage in `[0, 100]`.
    pub progress: u32,
    pub deadline: String,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinanceEntry {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(rename = "type")]
    pub kind: FinanceKind,
    pub amount: f64,
    pub client_name: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_date: String,
    pub reminder_time: Option<Millis>,
    pub repeat_type: RepeatRule,
    pub completed: bool,
}

/// A stored API key. `encrypted_key` is ciphertext the store never reads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultEntry {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub service_name: String,
    pub encrypted_key: String,
    pub expiry_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Whole-store snapshot: the four collections in insertion order.
///
/// This is also the persisted format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub finances: Vec<FinanceEntry>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub vault: Vec<VaultEntry>,
}

/// A record type bound to one collection.
pub trait Record:
    Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const COLLECTION: Collection;

    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    fn rows(state: &AppState) -> &Vec<Self>;
    fn rows_mut(state: &mut AppState) -> &mut Vec<Self>;

    /// Domain checks beyond what the type system enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn id(&self) -> &str {
        &self.meta().id
    }
}

impl Record for Project {
    const COLLECTION: Collection = Collection::Projects;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
    fn rows(state: &AppState) -> &Vec<Self> {
        &state.projects
    }
    fn rows_mut(state: &mut AppState) -> &mut Vec<Self> {
        &mut state.projects
    }

    fn validate(&self) -> Result<(), String> {
        if self.progress > 100 {
            return Err(format!("progress {} is outside 0..=100", self.progress));
        }
        Ok(())
    }
}

impl Record for FinanceEntry {
    const COLLECTION: Collection = Collection::Finances;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
    fn rows(state: &AppState) -> &Vec<Self> {
        &state.finances
    }
    fn rows_mut(state: &mut AppState) -> &mut Vec<Self> {
        &mut state.finances
    }

    fn validate(&self) -> Result<(), String> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(format!("amount {} must be a non-negative number", self.amount));
        }
        Ok(())
    }
}

impl Record for Task {
    const COLLECTION: Collection = Collection::Tasks;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
    fn rows(state: &AppState) -> &Vec<Self> {
        &state.tasks
    }
    fn rows_mut(state: &mut AppState) -> &mut Vec<Self> {
        &mut state.tasks
    }
}

impl Record for VaultEntry {
    const COLLECTION: Collection = Collection::Vault;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }
    fn rows(state: &AppState) -> &Vec<Self> {
        &state.vault
    }
    fn rows_mut(state: &mut AppState) -> &mut Vec<Self> {
        &mut state.vault
    }
}

fn live<R: Record>(rows: &[R]) -> Vec<R> {
    rows.iter().filter(|r| !r.meta().is_deleted()).cloned().collect()
}

fn rows_to_json<R: Record>(
    rows: &[R],
    keep: impl Fn(&RecordMeta) -> bool,
) -> Result<Vec<Value>, serde_json::Error> {
    rows.iter()
        .filter(|r| keep(r.meta()))
        .map(serde_json::to_value)
        .collect()
}

fn first_duplicate<R: Record>(rows: &[R]) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .find(|r| !seen.insert(r.id()))
        .map(|r| r.id().to_string())
}

impl AppState {
    /// The same snapshot with soft-deleted records removed.
    pub fn live(&self) -> AppState {
        AppState {
            projects: live(&self.projects),
            finances: live(&self.finances),
            tasks: live(&self.tasks),
            vault: live(&self.vault),
        }
    }

    pub fn metas(&self, collection: Collection) -> Vec<&RecordMeta> {
        match collection {
            Collection::Projects => self.projects.iter().map(|r| &r.meta).collect(),
            Collection::Finances => self.finances.iter().map(|r| &r.meta).collect(),
            Collection::Tasks => self.tasks.iter().map(|r| &r.meta).collect(),
            Collection::Vault => self.vault.iter().map(|r| &r.meta).collect(),
        }
    }

    pub fn meta_mut(&mut self, collection: Collection, id: &str) -> Option<&mut RecordMeta> {
        match collection {
            Collection::Projects => self.projects.iter_mut().map(|r| &mut r.meta).find(|m| m.id == id),
            Collection::Finances => self.finances.iter_mut().map(|r| &mut r.meta).find(|m| m.id == id),
            Collection::Tasks => self.tasks.iter_mut().map(|r| &mut r.meta).find(|m| m.id == id),
            Collection::Vault => self.vault.iter_mut().map(|r| &mut r.meta).find(|m| m.id == id),
        }
    }

    /// Number of records (including soft-deleted ones) in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.metas(collection).len()
    }

    pub fn is_empty(&self) -> bool {
        Collection::ALL.iter().all(|c| self.len(*c) == 0)
    }

    /// Records across all collections still waiting to be pushed.
    pub fn pending_count(&self) -> usize {
        Collection::ALL
            .iter()
            .map(|c| self.metas(*c).into_iter().filter(|m| m.is_pending()).count())
            .sum()
    }

    /// Largest `updated_at` among records the remote has confirmed,
    /// soft-deleted records included.
    ///
    /// Pending records carry local edit stamps the remote has never seen, so
    /// they cannot say anything about which remote rows are already here.
    pub fn last_synced_at(&self, collection: Collection) -> Option<Millis> {
        self.metas(collection)
            .into_iter()
            .filter(|m| !m.is_pending())
            .map(|m| m.updated_at)
            .max()
    }

    /// JSON rows of a collection whose envelope satisfies `keep`.
    pub fn rows_json(
        &self,
        collection: Collection,
        keep: impl Fn(&RecordMeta) -> bool,
    ) -> Result<Vec<Value>, serde_json::Error> {
        match collection {
            Collection::Projects => rows_to_json(&self.projects, keep),
            Collection::Finances => rows_to_json(&self.finances, keep),
            Collection::Tasks => rows_to_json(&self.tasks, keep),
            Collection::Vault => rows_to_json(&self.vault, keep),
        }
    }

    /// First id that appears twice within a collection, if any.
    pub fn find_duplicate_id(&self) -> Option<(Collection, String)> {
        let found = [
            first_duplicate(&self.projects),
            first_duplicate(&self.finances),
            first_duplicate(&self.tasks),
            first_duplicate(&self.vault),
        ];
        Collection::ALL
            .into_iter()
            .zip(found)
            .find_map(|(c, dup)| dup.map(|id| (c, id)))
    }
}

// ---------------------------------------------------------------------------
// Partial records
// ---------------------------------------------------------------------------

/// A partial record: an `id` plus any subset of fields.
///
/// Merging is shallow and keyed on presence: a field present in the patch
/// overwrites the stored value (including an explicit `null`), a field absent
/// from the patch is left alone.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    id: String,
    fields: Map<String, Value>,
}

impl Patch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// A patch for a brand-new record with a fresh random id.
    pub fn with_new_id() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Build a patch from a JSON row. The row must be an object with a string `id`.
    pub fn from_json(value: Value) -> Result<Self, String> {
        let Value::Object(mut fields) = value else {
            return Err("record is not a JSON object".to_string());
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => return Err("record id must be a non-empty string".to_string()),
            None => return Err("record has no id".to_string()),
        };
        Ok(Self { id, fields })
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn updated_at(&self) -> Option<Millis> {
        self.fields.get("updated_at").and_then(Value::as_u64)
    }

    pub fn created_at(&self) -> Option<Millis> {
        self.fields.get("created_at").and_then(Value::as_u64)
    }

    pub(crate) fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}
