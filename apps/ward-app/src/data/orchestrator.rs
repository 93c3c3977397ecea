//! # Mutation Orchestrator
//!
//! The only path UI code may use to change domain data.
//!
//! ## Write Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  mutate(collection, op, payload, doc_id)                                │
//! │                                                                         │
//! │  1. store.mutate(..)            ── fails? ──► Err(LocalApply)          │
//! │     history: record change (base captured on the first one)           │
//! │     bus: RecordChanged                                                 │
//! │  2. outbox.add(mutation)        ── fails? ──► discard(change),         │
//! │                                               Err(Storage)             │
//! │  3. queue PushJob (bounded)     ── full?  ──► completion = Pending     │
//! │  4. return MutationReceipt      (caller does not wait for the push)    │
//! │                                                                         │
//! │  push worker                                                            │
//! │  ─────────────                                                          │
//! │  SyncService::push_now(mutation)                                       │
//! │    Synced     ──► history: fold into base, completion = Synced         │
//! │    Rejected   ──► discard(change), bus: MutationRolledBack + Toast,    │
//! │                   completion = RolledBack       (entry: failed_fatal)  │
//! │    Failed     ──► completion = Pending          (entry stays pending)  │
//! │    Deferred   ──► completion = Pending          (flush loop owns it)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Discarding a change rebuilds the document from its base with every other
//! unconfirmed change replayed in order, so one rejection never resurrects
//! another rejected value nor drops a later pending one.
//!
//! Transient failures never roll back. Entries demoted at the retry ceiling
//! by the flush loop are not rolled back either.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ward_core::validation::validate_doc_id;
use ward_core::{Collection, Mutation, MutationOp, MutationStatus, Payload, Record};
use ward_db::Database;
use ward_sync::{DeferReason, PushAttempt, RemoteError, SyncService};

use crate::error::{MutationError, MutationResult, StoreError};
use crate::state::{AppEvent, EventBus, RecordSnapshot, Store, StoreOp, Toast};

// =============================================================================
// Receipts
// =============================================================================

/// Why a change is still waiting for the flush loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingReason {
    /// The sync service chose not to push right away.
    Deferred(DeferReason),
    /// The push failed and will be retried.
    Transient(RemoteError),
    /// The push queue was full.
    QueueFull,
    /// The orchestrator shut down before the push ran.
    WorkerStopped,
    /// Local storage failed while recording the push result.
    Error(String),
}

/// Final result of the immediate push attempt for one change.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Synced,
    /// Permanently rejected; the store was restored.
    RolledBack { error: RemoteError },
    /// Still durable in the outbox; the flush loop will deliver it.
    Pending { reason: PendingReason },
}

impl PushOutcome {
    fn pending(reason: PendingReason) -> Self {
        PushOutcome::Pending { reason }
    }
}

/// Resolves once the push worker is done with a change.
#[derive(Debug)]
pub struct PushCompletion {
    rx: oneshot::Receiver<PushOutcome>,
}

impl PushCompletion {
    fn resolved(outcome: PushOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        PushCompletion { rx }
    }

    /// Waits for the outcome.
    pub async fn wait(self) -> PushOutcome {
        self.rx
            .await
            .unwrap_or(PushOutcome::pending(PendingReason::WorkerStopped))
    }
}

/// Returned as soon as a change is applied and durable.
#[derive(Debug)]
pub struct MutationReceipt {
    /// Document id.
    pub id: String,
    /// Outbox entry id.
    pub mutation_id: String,
    pub completion: PushCompletion,
}

// =============================================================================
// Change History
// =============================================================================

/// Unconfirmed changes to one document over the value it had before them.
struct DocHistory {
    base: Option<Record>,
    /// Where the document sat when the history started.
    position: Option<usize>,
    /// Oldest first.
    changes: Vec<Mutation>,
}

/// Per-document record of changes the remote store has not confirmed.
#[derive(Default)]
struct Histories {
    docs: Mutex<HashMap<(Collection, String), DocHistory>>,
}

impl Histories {
    fn lock(&self) -> MutexGuard<'_, HashMap<(Collection, String), DocHistory>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a change to the store and records it.
    fn apply(&self, store: &Store, mutation: &Mutation, op: StoreOp) -> Result<(), StoreError> {
        let collection = mutation.collection;
        let doc_id = mutation.doc_id.as_str();

        let mut docs = self.lock();
        let before = store.get_snapshot(collection, doc_id);
        store.mutate(collection, doc_id, op)?;

        docs.entry((collection, doc_id.to_string()))
            .or_insert_with(|| DocHistory {
                position: before.as_ref().map(|s| s.position),
                base: before.map(|s| s.record),
                changes: Vec::new(),
            })
            .changes
            .push(mutation.clone());
        Ok(())
    }

    /// Folds `mutation` and every older change into the base.
    fn confirm(&self, mutation: &Mutation) {
        let key = (mutation.collection, mutation.doc_id.clone());
        let mut docs = self.lock();
        let Some(history) = docs.get_mut(&key) else {
            return;
        };
        let Some(at) = history.changes.iter().position(|m| m.id == mutation.id) else {
            return;
        };

        let settled: Vec<Mutation> = history.changes.drain(..=at).collect();
        history.base = replayed(history.base.take(), &settled);
        if history.changes.is_empty() {
            docs.remove(&key);
        }
    }

    /// Drops `mutation` and puts the document back to its base with the
    /// remaining changes replayed.
    ///
    /// Returns false if the change was not recorded.
    fn discard(&self, store: &Store, mutation: &Mutation) -> bool {
        let collection = mutation.collection;
        let doc_id = mutation.doc_id.as_str();
        let key = (collection, doc_id.to_string());

        let mut docs = self.lock();
        let Some(history) = docs.get_mut(&key) else {
            return false;
        };
        let Some(at) = history.changes.iter().position(|m| m.id == mutation.id) else {
            return false;
        };
        history.changes.remove(at);

        let rebuilt = replayed(history.base.clone(), &history.changes).map(|record| {
            let position = store
                .get_snapshot(collection, doc_id)
                .map(|s| s.position)
                .or(history.position)
                .unwrap_or(usize::MAX);
            RecordSnapshot { record, position }
        });
        store.restore(collection, doc_id, rebuilt);

        if history.changes.is_empty() {
            docs.remove(&key);
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Applies changes to a document value the way [`Store::mutate`] would.
fn replayed(mut doc: Option<Record>, changes: &[Mutation]) -> Option<Record> {
    for change in changes {
        doc = match (change.operation, doc) {
            (MutationOp::Delete, _) => None,
            (MutationOp::Update, None) => None,
            (MutationOp::Add, None) => {
                match Record::from_document(&change.doc_id, change.payload.clone()) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(id = %change.id, error = %e, "Skipping change that no longer builds a record");
                        None
                    }
                }
            }
            (MutationOp::Add | MutationOp::Update, Some(record)) => {
                match record.merged(&change.payload) {
                    Ok(merged) => Some(merged),
                    Err(e) => {
                        warn!(id = %change.id, error = %e, "Skipping change that no longer merges");
                        Some(record)
                    }
                }
            }
        };
    }
    doc
}

// =============================================================================
// Push Worker
// =============================================================================

struct PushJob {
    mutation: Mutation,
    done: oneshot::Sender<PushOutcome>,
}

struct PushWorker {
    store: Arc<Store>,
    histories: Arc<Histories>,
    bus: Arc<EventBus>,
    db: Database,
    sync: Arc<SyncService>,
    jobs: mpsc::Receiver<PushJob>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl PushWorker {
    async fn run(mut self) {
        info!("Push worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    debug!("Push worker received shutdown");
                    break;
                }

                job = self.jobs.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
            }
        }

        // queued changes stay durable; the flush loop delivers them later
        self.jobs.close();
        let mut abandoned = 0usize;
        while let Ok(job) = self.jobs.try_recv() {
            let _ = job.done.send(PushOutcome::pending(PendingReason::WorkerStopped));
            abandoned += 1;
        }

        info!(abandoned, "Push worker stopped");
    }

    async fn process(&self, job: PushJob) {
        let mutation = &job.mutation;

        let outcome = match self.sync.push_now(mutation).await {
            Ok(PushAttempt::Synced) => PushOutcome::Synced,
            Ok(PushAttempt::Rejected(error)) => {
                self.roll_back(mutation, &error);
                PushOutcome::RolledBack { error }
            }
            Ok(PushAttempt::Failed(error)) => PushOutcome::pending(PendingReason::Transient(error)),
            Ok(PushAttempt::Deferred(DeferReason::NotPending)) => self.settled(mutation).await,
            Ok(PushAttempt::Deferred(reason)) => {
                PushOutcome::pending(PendingReason::Deferred(reason))
            }
            Err(e) => {
                error!(id = %mutation.id, error = %e, "Immediate push failed locally");
                PushOutcome::pending(PendingReason::Error(e.to_string()))
            }
        };

        if outcome == PushOutcome::Synced {
            self.histories.confirm(mutation);
        }
        debug!(id = %mutation.id, doc_id = %mutation.doc_id, ?outcome, "Push finished");
        let _ = job.done.send(outcome);
    }

    /// The flush loop got to the entry first.
    async fn settled(&self, mutation: &Mutation) -> PushOutcome {
        match self.db.outbox().get(&mutation.id).await {
            Ok(Some(entry)) if entry.status == MutationStatus::Synced => PushOutcome::Synced,
            Ok(_) => PushOutcome::pending(PendingReason::Deferred(DeferReason::NotPending)),
            Err(e) => PushOutcome::pending(PendingReason::Error(e.to_string())),
        }
    }

    fn roll_back(&self, mutation: &Mutation, error: &RemoteError) {
        warn!(
            id = %mutation.id,
            collection = %mutation.collection,
            doc_id = %mutation.doc_id,
            error = %error,
            "Rolling back rejected change"
        );

        if !self.histories.discard(&self.store, mutation) {
            warn!(id = %mutation.id, "Rejected change has no local history, store left as is");
        }
        self.bus.emit(AppEvent::MutationRolledBack {
            collection: mutation.collection,
            id: mutation.doc_id.clone(),
            mutation_id: mutation.id.clone(),
            error: error.to_string(),
        });
        self.bus.emit(AppEvent::Toast(Toast::error(format!(
            "Save failed: {}",
            error.message
        ))));
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Sequences optimistic apply, durable log and asynchronous push.
pub struct MutationOrchestrator {
    store: Arc<Store>,
    histories: Arc<Histories>,
    bus: Arc<EventBus>,
    db: Database,
    jobs_tx: Mutex<Option<mpsc::Sender<PushJob>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MutationOrchestrator {
    /// Creates the orchestrator and spawns its push worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        db: Database,
        sync: Arc<SyncService>,
    ) -> Self {
        let capacity = sync.config().sync.push_queue_capacity.max(1);
        let (jobs_tx, jobs) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let histories = Arc::new(Histories::default());

        let worker = PushWorker {
            store: store.clone(),
            histories: histories.clone(),
            bus: bus.clone(),
            db: db.clone(),
            sync,
            jobs,
            shutdown_rx,
        };
        let handle = tokio::spawn(worker.run());

        MutationOrchestrator {
            store,
            histories,
            bus,
            db,
            jobs_tx: Mutex::new(Some(jobs_tx)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a change locally, logs it durably and schedules the push.
    ///
    /// Returns once the change is visible in the store and persisted in the
    /// outbox. The push outcome arrives on the receipt's completion.
    pub async fn mutate(
        &self,
        collection: Collection,
        operation: MutationOp,
        payload: Payload,
        doc_id: &str,
    ) -> MutationResult<MutationReceipt> {
        validate_doc_id(doc_id)?;
        let jobs = Self::lock(&self.jobs_tx)
            .clone()
            .ok_or(MutationError::ShuttingDown)?;

        let op = match operation {
            MutationOp::Add => StoreOp::Add(
                Record::from_document(doc_id, payload.clone()).map_err(StoreError::from)?,
            ),
            MutationOp::Update => StoreOp::Update(payload.clone()),
            MutationOp::Delete => StoreOp::Delete,
        };

        let payload = match operation {
            MutationOp::Delete => Payload::new(),
            _ => payload,
        };
        let change = Mutation::new(collection, operation, doc_id, payload);

        if let Err(e) = self.histories.apply(&self.store, &change, op) {
            debug!(collection = %collection, doc_id, error = %e, "Local apply failed");
            return Err(e.into());
        }
        self.bus.emit(AppEvent::RecordChanged {
            collection,
            id: doc_id.to_string(),
            operation,
        });

        let mutation = match self.db.outbox().add(&change).await {
            Ok(mutation) => mutation,
            Err(e) => {
                error!(collection = %collection, doc_id, error = %e, "Outbox append failed, rolling back");
                self.histories.discard(&self.store, &change);
                self.bus.emit(AppEvent::MutationRolledBack {
                    collection,
                    id: doc_id.to_string(),
                    mutation_id: change.id.clone(),
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        debug!(
            id = %mutation.id,
            collection = %collection,
            doc_id,
            operation = %operation,
            "Change applied and logged"
        );

        let (done, rx) = oneshot::channel();
        let job = PushJob {
            mutation: mutation.clone(),
            done,
        };

        let completion = match jobs.try_send(job) {
            Ok(()) => PushCompletion { rx },
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(id = %mutation.id, "Push queue full, leaving change to the flush loop");
                PushCompletion::resolved(PushOutcome::pending(PendingReason::QueueFull))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                PushCompletion::resolved(PushOutcome::pending(PendingReason::WorkerStopped))
            }
        };

        Ok(MutationReceipt {
            id: doc_id.to_string(),
            mutation_id: mutation.id,
            completion,
        })
    }

    /// Stops the push worker. Changes still queued resolve as pending.
    pub async fn shutdown(&self) {
        let shutdown = Self::lock(&self.shutdown_tx).take();
        if let Some(tx) = shutdown {
            let _ = tx.send(()).await;
        }
        Self::lock(&self.jobs_tx).take();

        let worker = Self::lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Push worker task failed");
            }
        }
    }
}

impl Drop for MutationOrchestrator {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Re-applies a pending outbox entry on top of the store.
///
/// Used after a reload, when the store was hydrated from the record cache.
/// Entries that no longer apply cleanly (the cached snapshot already reflects
/// them, or the document is gone) are skipped.
pub(crate) fn replay(store: &Store, mutation: &Mutation) -> Result<(), StoreError> {
    let collection = mutation.collection;
    let doc_id = mutation.doc_id.as_str();

    let result = match mutation.operation {
        MutationOp::Add if store.find(collection, doc_id).is_some() => store.mutate(
            collection,
            doc_id,
            StoreOp::Update(mutation.payload.clone()),
        ),
        MutationOp::Add => store.mutate(
            collection,
            doc_id,
            StoreOp::Add(Record::from_document(doc_id, mutation.payload.clone())?),
        ),
        MutationOp::Update => store.mutate(
            collection,
            doc_id,
            StoreOp::Update(mutation.payload.clone()),
        ),
        MutationOp::Delete => store.mutate(collection, doc_id, StoreOp::Delete),
    };

    match result {
        Err(StoreError::NotFound { .. }) => {
            debug!(id = %mutation.id, doc_id, "Replayed change no longer applies");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EventKind;
    use serde_json::json;
    use ward_db::DbConfig;
    use ward_sync::{Connectivity, MemoryRemote, SyncConfig, SyncMode};

    struct Harness {
        store: Arc<Store>,
        bus: Arc<EventBus>,
        db: Database,
        remote: Arc<MemoryRemote>,
        connectivity: Connectivity,
        orchestrator: MutationOrchestrator,
    }

    async fn harness(capacity: usize) -> Harness {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::new(bus.clone()));
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Connectivity::new(true);

        let mut config = SyncConfig::default();
        config.sync.mode = SyncMode::Manual;
        config.sync.push_queue_capacity = capacity;
        let sync = Arc::new(
            SyncService::builder(config)
                .with_database(db.clone())
                .with_remote(remote.clone())
                .with_connectivity(connectivity.clone())
                .build()
                .unwrap(),
        );

        let orchestrator = MutationOrchestrator::start(store.clone(), bus.clone(), db.clone(), sync);
        Harness {
            store,
            bus,
            db,
            remote,
            connectivity,
            orchestrator,
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_add_is_visible_before_push_completes() {
        let h = harness(8).await;
        let receipt = h
            .orchestrator
            .mutate(
                Collection::Patients,
                MutationOp::Add,
                payload(json!({"name": "Doe", "unitId": "icu"})),
                "p-1",
            )
            .await
            .unwrap();

        assert!(h.store.find(Collection::Patients, "p-1").is_some());
        assert!(h.db.outbox().get(&receipt.mutation_id).await.unwrap().is_some());

        assert_eq!(receipt.completion.wait().await, PushOutcome::Synced);
        assert!(h.remote.document(Collection::Patients, "p-1").is_some());
        let entry = h.db.outbox().get(&receipt.mutation_id).await.unwrap().unwrap();
        assert_eq!(entry.status, MutationStatus::Synced);
    }

    #[tokio::test]
    async fn test_fatal_rejection_restores_previous_value() {
        let h = harness(8).await;
        h.orchestrator
            .mutate(
                Collection::Tasks,
                MutationOp::Add,
                payload(json!({"title": "Obs", "completed": false})),
                "t-1",
            )
            .await
            .unwrap()
            .completion
            .wait()
            .await;
        let before = h.store.select(Collection::Tasks);

        let rolled_back = Arc::new(Mutex::new(Vec::new()));
        let sink = rolled_back.clone();
        h.bus.on(EventKind::MutationRolledBack, move |e| {
            sink.lock().unwrap().push(e.clone())
        });

        h.remote.deny(Collection::Tasks);
        let receipt = h
            .orchestrator
            .mutate(
                Collection::Tasks,
                MutationOp::Update,
                payload(json!({"completed": true})),
                "t-1",
            )
            .await
            .unwrap();

        let outcome = receipt.completion.wait().await;
        assert!(matches!(outcome, PushOutcome::RolledBack { .. }));
        assert_eq!(h.store.select(Collection::Tasks), before);
        assert_eq!(rolled_back.lock().unwrap().len(), 1);

        let entry = h.db.outbox().get(&receipt.mutation_id).await.unwrap().unwrap();
        assert_eq!(entry.status, MutationStatus::FailedFatal);
    }

    #[tokio::test]
    async fn test_consecutive_rejections_leave_original_value() {
        let h = harness(8).await;
        h.orchestrator
            .mutate(
                Collection::Tasks,
                MutationOp::Add,
                payload(json!({"title": "Obs", "completed": false})),
                "t-1",
            )
            .await
            .unwrap()
            .completion
            .wait()
            .await;
        let before = h.store.select(Collection::Tasks);

        h.remote.deny(Collection::Tasks);
        let first = h
            .orchestrator
            .mutate(
                Collection::Tasks,
                MutationOp::Update,
                payload(json!({"completed": true})),
                "t-1",
            )
            .await
            .unwrap();
        let second = h
            .orchestrator
            .mutate(
                Collection::Tasks,
                MutationOp::Update,
                payload(json!({"note": "x"})),
                "t-1",
            )
            .await
            .unwrap();

        assert!(matches!(first.completion.wait().await, PushOutcome::RolledBack { .. }));
        assert!(matches!(second.completion.wait().await, PushOutcome::RolledBack { .. }));
        assert_eq!(h.store.select(Collection::Tasks), before);
        assert_eq!(h.orchestrator.histories.len(), 0);
    }

    #[test]
    fn test_discard_replays_remaining_changes_over_base() {
        let store = Store::new(Arc::new(EventBus::new()));
        let histories = Histories::default();
        let base = Record::from_document("t-1", payload(json!({"title": "Obs", "completed": false})))
            .unwrap();
        store
            .mutate(Collection::Tasks, "t-0", StoreOp::Add(Record::new("t-0")))
            .unwrap();
        store
            .mutate(Collection::Tasks, "t-1", StoreOp::Add(base.clone()))
            .unwrap();

        let update = |patch: serde_json::Value| {
            Mutation::new(Collection::Tasks, MutationOp::Update, "t-1", payload(patch))
        };
        let rejected = update(json!({"completed": true}));
        let pending = update(json!({"note": "x"}));
        for change in [&rejected, &pending] {
            let op = StoreOp::Update(change.payload.clone());
            histories.apply(&store, change, op).unwrap();
        }

        assert!(histories.discard(&store, &rejected));
        let current = store.find(Collection::Tasks, "t-1").unwrap();
        assert_eq!(current.get("completed"), Some(&json!(false)));
        assert_eq!(current.get_str("note"), Some("x"));
        assert_eq!(store.get_snapshot(Collection::Tasks, "t-1").unwrap().position, 1);

        assert!(histories.discard(&store, &pending));
        assert_eq!(store.find(Collection::Tasks, "t-1").unwrap(), base);
        assert_eq!(histories.len(), 0);
        assert!(!histories.discard(&store, &pending));
    }

    #[test]
    fn test_confirmed_change_becomes_new_base() {
        let store = Store::new(Arc::new(EventBus::new()));
        let histories = Histories::default();

        let add = Mutation::new(
            Collection::Patients,
            MutationOp::Add,
            "p-1",
            payload(json!({"name": "Doe"})),
        );
        let op = StoreOp::Add(Record::from_document("p-1", add.payload.clone()).unwrap());
        histories.apply(&store, &add, op).unwrap();
        histories.confirm(&add);
        assert_eq!(histories.len(), 0);

        let rename = Mutation::new(
            Collection::Patients,
            MutationOp::Update,
            "p-1",
            payload(json!({"name": "Roe"})),
        );
        histories
            .apply(&store, &rename, StoreOp::Update(rename.payload.clone()))
            .unwrap();
        let delete = Mutation::new(Collection::Patients, MutationOp::Delete, "p-1", Payload::new());
        histories.apply(&store, &delete, StoreOp::Delete).unwrap();
        assert!(store.find(Collection::Patients, "p-1").is_none());

        // rejecting the rename keeps the later delete
        assert!(histories.discard(&store, &rename));
        assert!(store.find(Collection::Patients, "p-1").is_none());

        assert!(histories.discard(&store, &delete));
        let restored = store.find(Collection::Patients, "p-1").unwrap();
        assert_eq!(restored.get_str("name"), Some("Doe"));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_optimistic_value() {
        let h = harness(8).await;
        h.remote.set_online(false);

        let receipt = h
            .orchestrator
            .mutate(
                Collection::Patients,
                MutationOp::Add,
                payload(json!({"name": "Doe"})),
                "p-1",
            )
            .await
            .unwrap();

        let outcome = receipt.completion.wait().await;
        assert!(matches!(
            outcome,
            PushOutcome::Pending {
                reason: PendingReason::Transient(_)
            }
        ));
        assert!(h.store.find(Collection::Patients, "p-1").is_some());
        assert_eq!(h.db.outbox().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_defers_push() {
        let h = harness(8).await;
        h.connectivity.set_online(false);

        let receipt = h
            .orchestrator
            .mutate(
                Collection::Patients,
                MutationOp::Add,
                payload(json!({"name": "Doe"})),
                "p-1",
            )
            .await
            .unwrap();

        assert_eq!(
            receipt.completion.wait().await,
            PushOutcome::pending(PendingReason::Deferred(DeferReason::Offline))
        );
        assert!(h.remote.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_local_apply_failure_propagates_and_logs_nothing() {
        let h = harness(8).await;
        let err = h
            .orchestrator
            .mutate(
                Collection::Patients,
                MutationOp::Update,
                payload(json!({"name": "Ghost"})),
                "missing",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::LocalApply(StoreError::NotFound { .. })));
        assert_eq!(h.db.outbox().get_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_rolls_back() {
        let h = harness(8).await;
        h.db.close().await;

        let err = h
            .orchestrator
            .mutate(
                Collection::Patients,
                MutationOp::Add,
                payload(json!({"name": "Doe"})),
                "p-1",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Storage(_)));
        assert!(h.store.find(Collection::Patients, "p-1").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_changes() {
        let h = harness(8).await;
        h.orchestrator.shutdown().await;

        let err = h
            .orchestrator
            .mutate(
                Collection::Patients,
                MutationOp::Add,
                payload(json!({"name": "Doe"})),
                "p-1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::ShuttingDown));
        assert!(h.store.find(Collection::Patients, "p-1").is_none());
    }

    #[test]
    fn test_replay_skips_changes_that_no_longer_apply() {
        let store = Store::new(Arc::new(EventBus::new()));
        let add = Mutation::new(
            Collection::Patients,
            MutationOp::Add,
            "p-1",
            payload(json!({"name": "Doe"})),
        );
        replay(&store, &add).unwrap();
        // cached snapshot already had it: merged instead of failing
        replay(&store, &add).unwrap();
        assert_eq!(store.select(Collection::Patients).len(), 1);

        let delete = Mutation::new(Collection::Patients, MutationOp::Delete, "p-9", Payload::new());
        replay(&store, &delete).unwrap();
    }
}
