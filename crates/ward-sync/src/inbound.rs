//! # Inbound Handler
//!
//! Keeps live queries open against the remote store and hands every snapshot
//! to the application and to the local record cache.
//!
//! ## Subscription Lifecycle
//! ```text
//! subscribe_to_unit("icu")
//!   │
//!   ├── abort previous patient/task listeners, bump generation
//!   ├── spawn listener: patients where unitId == "icu"
//!   └── spawn listener: tasks    where unitId == "icu"
//!
//! listener loop
//!   subscribe ──► snapshot ──► emit_snapshot + record cache replace
//!       ▲            │
//!       │            └── error / closed ──► state Error, wait (backoff)
//!       └────────────────────────────────────────────────────┘
//! ```
//!
//! A snapshot is the full result set of the query; it replaces whatever the
//! application held for that collection. Unit-scoped listeners carry the
//! generation they were spawned under and drop snapshots once it is stale,
//! so an aborted listener that was mid-delivery cannot leak the old unit.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ward_core::validation::validate_doc_id;
use ward_core::{Collection, Record, SyncState};
use ward_db::Database;

use crate::agent::StatusTracker;
use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{RemoteQuery, RemoteStore};

/// Generation check for unit-scoped listeners.
#[derive(Clone)]
struct Scope {
    current: Arc<Mutex<u64>>,
    /// `None` for listeners that outlive unit switches.
    generation: Option<u64>,
}

impl Scope {
    /// Runs `f` while holding the generation, unless this scope is stale.
    fn run_if_current<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match self.generation {
            Some(generation) if generation != *current => None,
            _ => Some(f()),
        }
    }

    fn is_current(&self) -> bool {
        self.run_if_current(|| ()).is_some()
    }
}

#[derive(Default)]
struct Listeners {
    unit_id: Option<String>,
    unit_scoped: Vec<JoinHandle<()>>,
    units: Option<JoinHandle<()>>,
}

impl Listeners {
    fn abort_unit_scoped(&mut self) {
        for task in self.unit_scoped.drain(..) {
            task.abort();
        }
    }
}

/// Owns the live queries for the selected unit.
pub struct InboundHandler {
    db: Database,
    remote: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    tracker: Arc<StatusTracker>,
    listeners: Mutex<Listeners>,
    generation: Arc<Mutex<u64>>,
}

impl InboundHandler {
    pub(crate) fn new(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        config: Arc<SyncConfig>,
        tracker: Arc<StatusTracker>,
    ) -> Self {
        InboundHandler {
            db,
            remote,
            config,
            tracker,
            listeners: Mutex::new(Listeners::default()),
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Invalidates every unit-scoped listener spawned so far.
    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        *generation
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unit the patient and task listeners currently follow.
    pub fn current_unit(&self) -> Option<String> {
        self.listeners().unit_id.clone()
    }

    /// Replaces the patient and task listeners with ones scoped to `unit_id`.
    pub async fn subscribe_to_unit(&self, unit_id: &str) -> SyncResult<()> {
        validate_doc_id(unit_id)
            .map_err(|e| SyncError::InvalidConfig(format!("unit id: {e}")))?;

        let mut listeners = self.listeners();
        listeners.abort_unit_scoped();
        let generation = self.next_generation();
        listeners.unit_id = Some(unit_id.to_string());

        if !self.config.is_sync_enabled() {
            debug!(unit_id, "Sync disabled, not opening live queries");
            return Ok(());
        }

        info!(unit_id, generation, "Subscribing to unit");
        for collection in [Collection::Patients, Collection::Tasks] {
            let query = RemoteQuery::for_unit(collection, unit_id);
            listeners
                .unit_scoped
                .push(self.spawn_listener(query, Some(generation)));
        }
        Ok(())
    }

    /// Opens the unit list query if it is not already open.
    pub async fn subscribe_to_units(&self) -> SyncResult<()> {
        if !self.config.is_sync_enabled() {
            return Ok(());
        }

        let mut listeners = self.listeners();
        if listeners.units.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        listeners.units = Some(self.spawn_listener(RemoteQuery::all(Collection::Units), None));
        Ok(())
    }

    /// Aborts every listener.
    pub fn unsubscribe_all(&self) {
        let mut listeners = self.listeners();
        listeners.abort_unit_scoped();
        self.next_generation();
        if let Some(task) = listeners.units.take() {
            task.abort();
        }
        listeners.unit_id = None;
    }

    fn spawn_listener(&self, query: RemoteQuery, generation: Option<u64>) -> JoinHandle<()> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.sync.initial_backoff_ms),
            max_interval: Duration::from_secs(self.config.sync.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let scope = Scope {
            current: self.generation.clone(),
            generation,
        };
        tokio::spawn(listen(
            query,
            scope,
            self.remote.clone(),
            self.db.clone(),
            self.tracker.clone(),
            backoff,
        ))
    }
}

impl Drop for InboundHandler {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// Listener loop for one query. Runs until aborted or superseded.
async fn listen(
    query: RemoteQuery,
    scope: Scope,
    remote: Arc<dyn RemoteStore>,
    db: Database,
    tracker: Arc<StatusTracker>,
    mut backoff: ExponentialBackoff,
) {
    let collection = query.collection;

    loop {
        let failure = match remote.subscribe(query.clone()).await {
            Ok(mut subscription) => loop {
                match subscription.next().await {
                    Some(Ok(records)) => {
                        backoff.reset();
                        if !apply_snapshot(collection, &records, &scope, &db, &tracker).await {
                            debug!(collection = %collection, "Listener superseded, stopping");
                            return;
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break RemoteError::unavailable("subscription closed"),
                }
            },
            Err(e) => e,
        };

        let reported = scope.run_if_current(|| {
            warn!(
                collection = %collection,
                unit_id = ?query.unit_id,
                error = %failure,
                "Live query failed"
            );
            tracker.record_error(failure.to_string());
            tracker.set_state(SyncState::Error);
        });
        if reported.is_none() {
            return;
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or_else(|| Duration::from_secs(60));
        debug!(collection = %collection, ?delay, "Waiting before resubscribe");
        tokio::time::sleep(delay).await;
    }
}

/// Hands a snapshot to the application and the cache.
///
/// Returns false, delivering nothing, when the listener's scope is stale.
async fn apply_snapshot(
    collection: Collection,
    records: &[Record],
    scope: &Scope,
    db: &Database,
    tracker: &StatusTracker,
) -> bool {
    debug!(collection = %collection, count = records.len(), "Snapshot received");

    let delivered = scope.run_if_current(|| {
        if tracker.state() == SyncState::Error {
            tracker.set_state(SyncState::Connected);
        }
        tracker.emit_snapshot(collection, records);
    });
    if delivered.is_none() || !scope.is_current() {
        return false;
    }

    if let Err(e) = db.records().replace_collection(collection, records).await {
        warn!(collection = %collection, error = %e, "Failed to cache snapshot");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SyncEventEmitter;
    use crate::agent::SyncStatus;
    use crate::config::SyncMode;
    use crate::remote::MemoryRemote;
    use serde_json::json;
    use ward_core::{Mutation, Payload};
    use ward_db::DbConfig;

    #[derive(Default)]
    struct SnapshotLog {
        snapshots: std::sync::Mutex<Vec<(Collection, Vec<String>)>>,
    }

    impl SyncEventEmitter for SnapshotLog {
        fn emit_state(&self, _status: &SyncStatus) {}
        fn emit_snapshot(&self, collection: Collection, records: &[Record]) {
            let ids = records.iter().map(|r| r.id.clone()).collect();
            self.snapshots.lock().unwrap().push((collection, ids));
        }
        fn emit_rejection(&self, _mutation: &Mutation, _error: &RemoteError) {}
    }

    fn doc(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn handler(
        mode: SyncMode,
    ) -> (InboundHandler, Arc<MemoryRemote>, Arc<SnapshotLog>, Arc<StatusTracker>, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let log = Arc::new(SnapshotLog::default());
        let tracker = Arc::new(StatusTracker::new(log.clone()));
        let mut config = SyncConfig::default();
        config.sync.mode = mode;
        config.sync.initial_backoff_ms = 10;
        config.sync.max_backoff_secs = 1;

        let handler = InboundHandler::new(db.clone(), remote.clone(), Arc::new(config), tracker.clone());
        (handler, remote, log, tracker, db)
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_snapshots_reach_emitter_and_cache() {
        let (handler, remote, log, _tracker, db) = handler(SyncMode::Manual).await;
        remote.seed(Collection::Patients, "p-1", doc(json!({"unitId": "icu", "name": "A"})));
        remote.seed(Collection::Patients, "p-2", doc(json!({"unitId": "ward-b", "name": "B"})));

        handler.subscribe_to_unit("icu").await.unwrap();
        assert_eq!(handler.current_unit().as_deref(), Some("icu"));

        eventually(|| {
            log.snapshots
                .lock()
                .unwrap()
                .iter()
                .any(|(c, ids)| *c == Collection::Patients && ids == &vec!["p-1".to_string()])
        })
        .await;

        for _ in 0..200 {
            if db.records().count(Collection::Patients).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let cached = db.records().get_all(Collection::Patients).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "p-1");
    }

    #[tokio::test]
    async fn test_switching_unit_replaces_listeners() {
        let (handler, remote, _log, _tracker, _db) = handler(SyncMode::Manual).await;

        handler.subscribe_to_unit("icu").await.unwrap();
        eventually(|| remote.subscriber_count() == 2).await;

        handler.subscribe_to_unit("ward-b").await.unwrap();
        assert_eq!(handler.current_unit().as_deref(), Some("ward-b"));
        eventually(|| remote.subscriber_count() == 2).await;

        handler.subscribe_to_units().await.unwrap();
        eventually(|| remote.subscriber_count() == 3).await;

        handler.unsubscribe_all();
        eventually(|| remote.subscriber_count() == 0).await;
        assert!(handler.current_unit().is_none());
    }

    #[tokio::test]
    async fn test_listener_recovers_after_error() {
        let (handler, remote, log, tracker, _db) = handler(SyncMode::Manual).await;
        handler.subscribe_to_unit("icu").await.unwrap();
        eventually(|| remote.subscriber_count() == 2).await;

        remote.set_online(false);
        remote.break_subscriptions(RemoteError::unavailable("connection reset"));
        eventually(|| tracker.state() == SyncState::Error).await;
        assert!(tracker.snapshot().last_error.is_some());

        let before = log.snapshots.lock().unwrap().len();
        remote.set_online(true);
        eventually(|| tracker.state() == SyncState::Connected).await;
        assert!(log.snapshots.lock().unwrap().len() > before);
    }

    #[tokio::test]
    async fn test_offline_mode_opens_no_queries() {
        let (handler, remote, _log, _tracker, _db) = handler(SyncMode::Offline).await;
        handler.subscribe_to_unit("icu").await.unwrap();
        handler.subscribe_to_units().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(remote.subscriber_count(), 0);
        assert_eq!(handler.current_unit().as_deref(), Some("icu"));
    }

    #[tokio::test]
    async fn test_stale_listener_delivers_nothing() {
        // no live queries, so nothing else delivers
        let (handler, _remote, log, tracker, db) = handler(SyncMode::Offline).await;
        handler.subscribe_to_unit("icu").await.unwrap();
        let stale = Scope {
            current: handler.generation.clone(),
            generation: Some(*handler.generation.lock().unwrap()),
        };
        handler.subscribe_to_unit("ward-b").await.unwrap();
        assert!(!stale.is_current());

        let old_unit = vec![Record::new("p-icu")];
        let before = log.snapshots.lock().unwrap().len();
        assert!(!apply_snapshot(Collection::Patients, &old_unit, &stale, &db, &tracker).await);

        assert_eq!(log.snapshots.lock().unwrap().len(), before);
        assert_eq!(db.records().count(Collection::Patients).await.unwrap(), 0);

        // the unit list listener is never superseded
        let units = Scope {
            current: handler.generation.clone(),
            generation: None,
        };
        handler.unsubscribe_all();
        assert!(apply_snapshot(Collection::Units, &[Record::new("icu")], &units, &db, &tracker).await);
        assert_eq!(db.records().count(Collection::Units).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_unit_id() {
        let (handler, _remote, _log, _tracker, _db) = handler(SyncMode::Manual).await;
        assert!(handler.subscribe_to_unit("").await.is_err());
        assert!(handler.subscribe_to_unit("a/b").await.is_err());
    }
}
