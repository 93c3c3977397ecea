//! # Domain Types
//!
//! Core domain types used throughout Ward Sync.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Record       │   │    Mutation     │   │   Collection    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (opaque)    │   │  id (UUID)      │   │  Patients       │       │
//! │  │  unitId (FK)    │   │  doc_id         │   │  Tasks          │       │
//! │  │  createdAt      │   │  operation      │   │  Units          │       │
//! │  │  updatedAt      │   │  payload        │   └─────────────────┘       │
//! │  │  deletedAt      │   │  status         │                             │
//! │  │  fields {...}   │   │  retry_count    │   ┌─────────────────┐       │
//! │  └─────────────────┘   └─────────────────┘   │   SyncState     │       │
//! │                                              │  Connected      │       │
//! │  MutationOp:     Add | Update | Delete       │  Syncing        │       │
//! │  MutationStatus: Pending → Synced            │  Offline        │       │
//! │                  Pending → FailedFatal       │  Error          │       │
//! │                                              └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! A mutation's `id` is independent of the document it targets (`doc_id`):
//! two edits of the same patient are two outbox entries with one `doc_id`.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// A JSON object carrying record fields.
pub type Payload = Map<String, Value>;

// =============================================================================
// Collection
// =============================================================================

/// The remote collections mirrored by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Patients,
    Tasks,
    Units,
}

impl Collection {
    /// Every collection, in store order.
    pub const ALL: [Collection; 3] = [Collection::Patients, Collection::Tasks, Collection::Units];

    /// Returns the wire/database name of the collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Patients => "patients",
            Collection::Tasks => "tasks",
            Collection::Units => "units",
        }
    }

    /// Returns true if records of this collection belong to a unit.
    ///
    /// Unit-scoped collections are the ones the inbound listeners filter by
    /// the selected unit.
    pub fn is_unit_scoped(&self) -> bool {
        matches!(self, Collection::Patients | Collection::Tasks)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Collection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patients" => Ok(Collection::Patients),
            "tasks" => Ok(Collection::Tasks),
            "units" => Ok(Collection::Units),
            other => Err(CoreError::UnknownCollection(other.to_string())),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// A document as the UI sees it.
///
/// Timestamps and the unit reference are typed; every other domain field
/// lives in `fields` untouched. On the wire the record is one flat JSON
/// object (`{"id": .., "unitId": .., "name": ..}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Opaque identifier, immutable once created.
    pub id: String,

    /// Unit this record belongs to (application-level foreign key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Set when the record is soft-deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Remaining domain fields.
    #[serde(flatten)]
    pub fields: Payload,
}

impl Record {
    /// Creates an empty record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            unit_id: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            fields: Payload::new(),
        }
    }

    /// Builds a record from a flat document.
    ///
    /// The `id` argument always wins over an `id` key inside the document.
    pub fn from_document(id: &str, mut document: Payload) -> CoreResult<Self> {
        document.insert("id".to_string(), Value::String(id.to_string()));
        serde_json::from_value(Value::Object(document))
            .map_err(|e| CoreError::invalid_record(id, e))
    }

    /// Flattens the record back into a document.
    pub fn to_document(&self) -> CoreResult<Payload> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(CoreError::invalid_record(
                &self.id,
                format!("serialized to {other}, expected an object"),
            )),
            Err(e) => Err(CoreError::invalid_record(&self.id, e)),
        }
    }

    /// Returns a copy with `patch` merged over the current fields.
    ///
    /// Keys present in the patch replace existing ones; the id never changes.
    pub fn merged(&self, patch: &Payload) -> CoreResult<Self> {
        let mut document = self.to_document()?;
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            document.insert(key.clone(), value.clone());
        }
        Record::from_document(&self.id, document)
    }

    /// Returns a domain field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a domain field as a string slice.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Returns true if the record is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// =============================================================================
// Mutation Operation
// =============================================================================

/// What a mutation does to its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Create the document with the full payload.
    Add,
    /// Merge the payload into the existing document.
    Update,
    /// Remove the document.
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Add => "add",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }
}

impl std::fmt::Display for MutationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationOp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(MutationOp::Add),
            "update" => Ok(MutationOp::Update),
            "delete" => Ok(MutationOp::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Mutation Status
// =============================================================================

/// Lifecycle state of an outbox entry.
///
/// ```text
///            push ok
///  Pending ──────────► Synced        (terminal, pruned on cleanup)
///     │
///     │ fatal rejection / retry ceiling reached
///     ▼
///  FailedFatal                       (terminal, pruned after retention)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Synced,
    FailedFatal,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Synced => "synced",
            MutationStatus::FailedFatal => "failed_fatal",
        }
    }

    /// Returns true for statuses the entry never leaves.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MutationStatus::Pending)
    }
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "synced" => Ok(MutationStatus::Synced),
            "failed_fatal" => Ok(MutationStatus::FailedFatal),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Mutation (Outbox Entry)
// =============================================================================

/// An entry in the durable outbox.
///
/// Mirrors exactly one optimistic change applied to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Entry id (UUID v4), also used as the remote delivery token.
    pub id: String,
    pub collection: Collection,
    pub operation: MutationOp,
    /// Id of the document the change targets.
    pub doc_id: String,
    /// Fields written (empty for deletes).
    pub payload: Payload,
    /// When the change was applied locally. Flush order follows this.
    pub enqueued_at: DateTime<Utc>,
    pub status: MutationStatus,
    /// Number of failed delivery attempts.
    pub retry_count: u32,
    /// Last delivery error, if any.
    pub last_error: Option<String>,
    /// Last status or retry change.
    pub updated_at: DateTime<Utc>,
}

impl Mutation {
    /// Creates a fresh pending entry stamped with the current time.
    pub fn new(
        collection: Collection,
        operation: MutationOp,
        doc_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        // Millisecond precision, matching what the outbox table stores.
        let now = Utc::now().trunc_subsecs(3);
        Mutation {
            id: Uuid::new_v4().to_string(),
            collection,
            operation,
            doc_id: doc_id.into(),
            payload,
            enqueued_at: now,
            status: MutationStatus::Pending,
            retry_count: 0,
            last_error: None,
            updated_at: now,
        }
    }

    /// Overrides the enqueue timestamp (used when replaying or backdating).
    pub fn enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at.trunc_subsecs(3);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

// =============================================================================
// Outbox Statistics
// =============================================================================

/// Outbox entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub synced: u64,
    pub failed_fatal: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.synced + self.failed_fatal
    }
}

// =============================================================================
// Sync State (badge)
// =============================================================================

/// The sync badge shown by the UI at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Connected,
    Syncing,
    #[default]
    Offline,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Connected => write!(f, "connected"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Offline => write!(f, "offline"),
            SyncState::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// View Filter
// =============================================================================

/// Task list filter held in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewFilter {
    #[default]
    All,
    Open,
    Completed,
}

impl ViewFilter {
    /// Returns true if the record passes the filter.
    ///
    /// Records without a `completed` flag count as open.
    pub fn matches(&self, record: &Record) -> bool {
        let completed = record
            .get("completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        match self {
            ViewFilter::All => true,
            ViewFilter::Open => !completed,
            ViewFilter::Completed => completed,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
