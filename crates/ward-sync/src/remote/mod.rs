//! # Remote Document Store
//!
//! The seam between the sync service and the shared document store.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      RemoteStore                                        │
//! │                                                                         │
//! │  write(RemoteWrite)                                                    │
//! │  ├── Create(fields)  full document, createdAt + updatedAt stamped      │
//! │  ├── Merge(fields)   merged into existing, updatedAt stamped           │
//! │  └── Delete          document removed                                  │
//! │                                                                         │
//! │  Every write carries `mutation_id`. A store that has already applied   │
//! │  that id acknowledges without applying it again.                       │
//! │                                                                         │
//! │  subscribe(RemoteQuery) → RemoteSubscription                           │
//! │  ├── first item: current snapshot of the query                         │
//! │  ├── then: a full snapshot after every change                          │
//! │  └── Err(..) ends the subscription                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RemoteResult;
use ward_core::{Collection, Mutation, MutationOp, Payload, Record};

pub use memory::MemoryRemote;

// =============================================================================
// Writes
// =============================================================================

/// What a write does to the target document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum WriteKind {
    Create(Payload),
    Merge(Payload),
    Delete,
}

/// Timestamps the remote store assigns when applying a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStamps {
    /// Set `createdAt` to the server time.
    pub created: bool,
    /// Set `updatedAt` to the server time.
    pub updated: bool,
}

impl ServerStamps {
    pub fn for_operation(op: MutationOp) -> Self {
        match op {
            MutationOp::Add => ServerStamps {
                created: true,
                updated: true,
            },
            MutationOp::Update => ServerStamps {
                created: false,
                updated: true,
            },
            MutationOp::Delete => ServerStamps::default(),
        }
    }
}

/// A single document write sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWrite {
    /// Delivery token; the outbox entry id.
    pub mutation_id: String,
    /// Device that produced the write.
    pub origin: String,
    pub collection: Collection,
    pub doc_id: String,
    pub kind: WriteKind,
    pub stamps: ServerStamps,
}

impl RemoteWrite {
    /// Translates an outbox entry into the matching remote write.
    pub fn from_mutation(mutation: &Mutation, origin: &str) -> Self {
        let kind = match mutation.operation {
            MutationOp::Add => WriteKind::Create(mutation.payload.clone()),
            MutationOp::Update => WriteKind::Merge(mutation.payload.clone()),
            MutationOp::Delete => WriteKind::Delete,
        };

        RemoteWrite {
            mutation_id: mutation.id.clone(),
            origin: origin.to_string(),
            collection: mutation.collection,
            doc_id: mutation.doc_id.clone(),
            kind,
            stamps: ServerStamps::for_operation(mutation.operation),
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// A live query: one collection, optionally filtered by unit membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteQuery {
    pub collection: Collection,
    pub unit_id: Option<String>,
}

impl RemoteQuery {
    /// Every document of the collection.
    pub fn all(collection: Collection) -> Self {
        RemoteQuery {
            collection,
            unit_id: None,
        }
    }

    /// Documents whose `unitId` equals `unit_id`.
    pub fn for_unit(collection: Collection, unit_id: impl Into<String>) -> Self {
        RemoteQuery {
            collection,
            unit_id: Some(unit_id.into()),
        }
    }

    /// Returns true if the record belongs to this query's result set.
    pub fn matches(&self, record: &Record) -> bool {
        match &self.unit_id {
            Some(unit) => record.unit_id.as_deref() == Some(unit.as_str()),
            None => true,
        }
    }
}

/// Stream of snapshots for a [`RemoteQuery`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct RemoteSubscription {
    rx: mpsc::UnboundedReceiver<RemoteResult<Vec<Record>>>,
}

impl RemoteSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<RemoteResult<Vec<Record>>>) -> Self {
        RemoteSubscription { rx }
    }

    /// Waits for the next snapshot. `None` once the store closed the stream.
    pub async fn next(&mut self) -> Option<RemoteResult<Vec<Record>>> {
        self.rx.recv().await
    }
}

// =============================================================================
// Remote Store Trait
// =============================================================================

/// A shared, real-time document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Applies a write. Timeouts surface as transient errors.
    async fn write(&self, write: RemoteWrite) -> RemoteResult<()>;

    /// Opens a live query.
    async fn subscribe(&self, query: RemoteQuery) -> RemoteResult<RemoteSubscription>;
}
