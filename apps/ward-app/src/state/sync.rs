//! # Sync Bridge
//!
//! Feeds sync service events into the store and the event bus.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncService ──► StoreSyncEmitter                                       │
//! │                                                                         │
//! │  emit_state(status)       ──► store.set(sync_state, online)            │
//! │                               bus: SyncStateChanged                    │
//! │  emit_snapshot(c, recs)   ──► store.set(collection c = recs)           │
//! │  emit_rejection(m, err)   ──► bus: Toast("Save failed")                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use ward_core::{Collection, Mutation, Record};
use ward_sync::{RemoteError, SyncEventEmitter, SyncStatus};

use super::bus::{AppEvent, EventBus, Toast};
use super::store::{StatePatch, Store};

/// Sync status as the UI badge renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusDto {
    /// connected / syncing / offline / error
    pub state: String,

    pub sync_mode: String,

    /// Last successful delivery (RFC 3339)
    pub last_sync_at: Option<String>,

    pub pending_outbox_count: u64,

    /// Connected with nothing failing
    pub is_healthy: bool,

    pub error_message: Option<String>,
}

impl From<SyncStatus> for SyncStatusDto {
    fn from(status: SyncStatus) -> Self {
        Self {
            state: status.state.to_string(),
            sync_mode: status.mode.to_string(),
            last_sync_at: status.last_sync,
            pending_outbox_count: status.pending_count,
            is_healthy: status.state == ward_core::SyncState::Connected && status.is_online,
            error_message: status.last_error,
        }
    }
}

/// [`SyncEventEmitter`] that writes into the store.
#[derive(Clone)]
pub struct StoreSyncEmitter {
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl StoreSyncEmitter {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }
}

impl SyncEventEmitter for StoreSyncEmitter {
    fn emit_state(&self, status: &SyncStatus) {
        self.store.set(
            StatePatch::new()
                .sync_state(status.state)
                .online(status.is_online),
        );
        self.bus
            .emit(AppEvent::SyncStateChanged { state: status.state });
        debug!(state = %status.state, "Sync state published");
    }

    fn emit_snapshot(&self, collection: Collection, records: &[Record]) {
        self.store
            .set(StatePatch::new().collection(collection, records.to_vec()));
    }

    fn emit_rejection(&self, mutation: &Mutation, error: &RemoteError) {
        warn!(
            id = %mutation.id,
            collection = %mutation.collection,
            doc_id = %mutation.doc_id,
            error = %error,
            "Change rejected by remote store"
        );
        self.bus.emit(AppEvent::Toast(Toast::error(format!(
            "Save failed: {}",
            error.message
        ))));
    }
}
