//! # Application Context
//!
//! Owns every long-lived component and wires them together.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         AppContext                                      │
//! │                                                                         │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────────────────────────────┐    │
//! │  │ EventBus │◄──│  Store   │◄──│ StoreSyncEmitter (state, snaps)  │    │
//! │  └──────────┘   └──────────┘   └──────────────────────────────────┘    │
//! │        ▲             ▲                          ▲                       │
//! │        │             │                          │                       │
//! │  ┌─────┴─────────────┴──────┐          ┌────────┴────────┐             │
//! │  │  MutationOrchestrator    │─push_now►│   SyncService   │──► remote   │
//! │  │  (Data facade)           │          │                 │             │
//! │  └──────────────────────────┘          └─────────────────┘             │
//! │        │                                        │                       │
//! │        ▼                                        ▼                       │
//! │  ┌──────────────────────────────────────────────────────────────┐      │
//! │  │  Database: outbox (WAL) + record cache                       │      │
//! │  └──────────────────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Startup Sequence
//! 1. Hydrate the store from the record cache
//! 2. Replay pending outbox entries on top (`store = cache ⊕ pending`)
//! 3. Start the sync service (cleanup, initial state, background loop)
//! 4. Subscribe to the unit list, and to the selected unit if any

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ward_core::validation::{validate_doc_id, validate_search_query};
use ward_core::{Collection, Record, ViewFilter};
use ward_db::{Database, DbConfig};
use ward_sync::{Connectivity, FlushOutcome, RemoteStore, SyncConfig, SyncService};

use crate::data::{replay, Data, MutationOrchestrator};
use crate::error::AppResult;
use crate::state::{AppEvent, EventBus, StatePatch, Store, StoreSyncEmitter, SyncStatusDto};

pub struct AppContext {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    db: Database,
    sync: Arc<SyncService>,
    data: Data,
    connectivity: Connectivity,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AppContext {
    /// Opens the database at the configured path and builds the context.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
    ) -> AppResult<Self> {
        let path = config.database_path()?;
        info!(path = %path.display(), "Opening local database");
        let db = Database::new(DbConfig::new(path)).await?;
        Self::new(config, db, remote, connectivity)
    }

    /// Builds the context over an open database.
    ///
    /// Spawns the push worker, so it must be called from within a Tokio
    /// runtime. Nothing talks to the remote store until [`start`](Self::start).
    pub fn new(
        config: SyncConfig,
        db: Database,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
    ) -> AppResult<Self> {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::new(bus.clone()));
        store.set(StatePatch::new().online(connectivity.is_online()));

        let emitter = Arc::new(StoreSyncEmitter::new(store.clone(), bus.clone()));
        let sync = Arc::new(
            SyncService::builder(config)
                .with_database(db.clone())
                .with_remote(remote)
                .with_emitter(emitter)
                .with_connectivity(connectivity.clone())
                .build()?,
        );

        let orchestrator = Arc::new(MutationOrchestrator::start(
            store.clone(),
            bus.clone(),
            db.clone(),
            sync.clone(),
        ));

        let watcher = tokio::spawn(forward_connectivity(
            connectivity.subscribe(),
            store.clone(),
            bus.clone(),
        ));

        Ok(AppContext {
            bus,
            store,
            db,
            sync,
            data: Data::new(orchestrator),
            connectivity,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Collection write wrappers.
    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn sync(&self) -> &Arc<SyncService> {
        &self.sync
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn sync_status(&self) -> SyncStatusDto {
        self.sync.status().into()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Hydrates the store and starts syncing.
    pub async fn start(&self) -> AppResult<()> {
        let replayed = self.hydrate_from_cache().await?;
        info!(replayed, "Store hydrated from local cache");

        self.sync.start().await?;
        self.sync.subscribe_to_units().await?;
        if let Some(unit) = self.store.selected_unit() {
            self.sync.subscribe_to_unit(&unit).await?;
        }
        Ok(())
    }

    /// Loads cached collections into the store, then re-applies every
    /// pending outbox entry in enqueue order.
    ///
    /// Returns the number of entries replayed.
    pub async fn hydrate_from_cache(&self) -> AppResult<usize> {
        let mut patch = StatePatch::new();
        for collection in Collection::ALL {
            let records = self.db.records().get_all(collection).await?;
            debug!(collection = %collection, count = records.len(), "Loaded cached records");
            patch = patch.collection(collection, records);
        }
        self.store.set(patch);

        let pending = self.db.outbox().get_pending().await?;
        let mut replayed = 0;
        for mutation in &pending {
            match replay(&self.store, mutation) {
                Ok(()) => replayed += 1,
                Err(e) => warn!(
                    id = %mutation.id,
                    doc_id = %mutation.doc_id,
                    error = %e,
                    "Skipping pending change that cannot be replayed"
                ),
            }
        }
        Ok(replayed)
    }

    /// Stops the push worker, the sync service and the connectivity watcher,
    /// then closes the database. Pending changes stay in the outbox.
    pub async fn shutdown(&self) -> AppResult<()> {
        info!("Shutting down application context");

        self.data.orchestrator().shutdown().await;
        self.sync.shutdown().await?;

        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        self.db.close().await;
        Ok(())
    }

    // =========================================================================
    // UI State
    // =========================================================================

    /// Selects a unit and moves the patient and task subscriptions to it.
    pub async fn select_unit(&self, unit_id: &str) -> AppResult<()> {
        validate_doc_id(unit_id)?;
        self.store
            .set(StatePatch::new().selected_unit(Some(unit_id.to_string())));
        self.sync.subscribe_to_unit(unit_id).await?;
        Ok(())
    }

    pub fn set_search_query(&self, query: &str) -> AppResult<()> {
        let query = validate_search_query(query)?;
        self.store.set(StatePatch::new().search_query(query));
        Ok(())
    }

    pub fn set_filter(&self, filter: ViewFilter) {
        self.store.set(StatePatch::new().filter(filter));
    }

    pub fn navigate(&self, route: impl Into<String>) {
        self.bus.emit(AppEvent::RouteChanged {
            route: route.into(),
        });
    }

    /// Feeds a platform connectivity change into the sync service.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Flushes the outbox now, regardless of sync mode.
    pub async fn flush_now(&self) -> AppResult<FlushOutcome> {
        Ok(self.sync.flush_outbox().await?)
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Admitted patients of the selected unit matching the search query.
    pub fn visible_patients(&self) -> Vec<Record> {
        let snapshot = self.store.snapshot();
        let query = snapshot.search_query.to_lowercase();
        snapshot
            .patients
            .iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| in_unit(r, snapshot.selected_unit.as_deref()))
            .filter(|r| matches_query(r, "name", &query))
            .cloned()
            .collect()
    }

    /// Tasks of the selected unit passing the filter and the search query.
    pub fn visible_tasks(&self) -> Vec<Record> {
        let snapshot = self.store.snapshot();
        let query = snapshot.search_query.to_lowercase();
        snapshot
            .tasks
            .iter()
            .filter(|r| in_unit(r, snapshot.selected_unit.as_deref()))
            .filter(|r| snapshot.filter.matches(r))
            .filter(|r| matches_query(r, "title", &query))
            .cloned()
            .collect()
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

fn in_unit(record: &Record, unit: Option<&str>) -> bool {
    match unit {
        Some(unit) => record.unit_id.as_deref() == Some(unit),
        None => true,
    }
}

fn matches_query(record: &Record, field: &str, query: &str) -> bool {
    query.is_empty()
        || record
            .get_str(field)
            .is_some_and(|value| value.to_lowercase().contains(query))
}

async fn forward_connectivity(
    mut rx: watch::Receiver<bool>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
) {
    while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        store.set(StatePatch::new().online(online));
        bus.emit(AppEvent::ConnectivityChanged { online });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ward_core::Payload;
    use ward_sync::{MemoryRemote, SyncMode};

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn context() -> (AppContext, Arc<MemoryRemote>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let mut config = SyncConfig::default();
        config.sync.mode = SyncMode::Offline;
        let ctx = AppContext::new(config, db, remote.clone(), Connectivity::new(true)).unwrap();
        (ctx, remote)
    }

    #[tokio::test]
    async fn test_visible_patients_follow_unit_and_query() {
        let (ctx, _remote) = context().await;
        ctx.select_unit("icu").await.unwrap();

        for (name, unit) in [("Ada", "icu"), ("Bob", "icu"), ("Cy", "ward-2")] {
            ctx.data()
                .patients()
                .add(payload(json!({"name": name, "unitId": unit})))
                .await
                .unwrap();
        }
        assert_eq!(ctx.visible_patients().len(), 2);

        ctx.set_search_query("  ad ").unwrap();
        let visible = ctx.visible_patients();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].get_str("name"), Some("Ada"));
    }

    #[tokio::test]
    async fn test_discharged_patients_are_hidden() {
        let (ctx, _remote) = context().await;
        let receipt = ctx
            .data()
            .patients()
            .add(payload(json!({"name": "Ada"})))
            .await
            .unwrap();
        ctx.data().patients().discharge(&receipt.id).await.unwrap();

        assert!(ctx.visible_patients().is_empty());
        let record = ctx.store().find(Collection::Patients, &receipt.id).unwrap();
        assert!(record.is_deleted());
    }

    #[tokio::test]
    async fn test_task_filter() {
        let (ctx, _remote) = context().await;
        let open = ctx
            .data()
            .tasks()
            .add(payload(json!({"title": "Obs"})))
            .await
            .unwrap();
        let done = ctx
            .data()
            .tasks()
            .add(payload(json!({"title": "Meds"})))
            .await
            .unwrap();
        ctx.data().tasks().set_completed(&done.id, true).await.unwrap();

        ctx.set_filter(ViewFilter::Open);
        let visible = ctx.visible_tasks();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, open.id);
    }

    #[tokio::test]
    async fn test_add_defaults_unit_to_selection() {
        let (ctx, _remote) = context().await;
        ctx.select_unit("icu").await.unwrap();

        let receipt = ctx
            .data()
            .tasks()
            .add(payload(json!({"title": "Obs"})))
            .await
            .unwrap();
        let task = ctx.store().find(Collection::Tasks, &receipt.id).unwrap();
        assert_eq!(task.unit_id.as_deref(), Some("icu"));
        assert_eq!(task.get("completed"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_invalid_unit_and_query_rejected() {
        let (ctx, _remote) = context().await;
        assert!(ctx.select_unit("a/b").await.is_err());
        assert!(ctx.set_search_query(&"x".repeat(200)).is_err());
        assert_eq!(ctx.store().selected_unit(), None);
    }

    #[tokio::test]
    async fn test_connectivity_reaches_store() {
        let (ctx, _remote) = context().await;
        ctx.set_online(false);

        for _ in 0..50 {
            if !ctx.store().snapshot().online {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!ctx.store().snapshot().online);
    }
}
