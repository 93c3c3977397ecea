//! # Outbox Flusher
//!
//! Delivers outbox entries to the remote store.
//!
//! ## Flush Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    flush_outbox()                                       │
//! │                                                                         │
//! │  single-flight guard ── already running? ──► AlreadyRunning            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  get_pending()   (oldest first)                                        │
//! │       │                                                                 │
//! │       ▼  for each entry, sequentially                                  │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  earlier entry for same doc failed/in flight? ──► defer         │   │
//! │  │  retry_count >= max_retries?  ──► failed_fatal (demoted)        │   │
//! │  │  push(entry)                                                    │   │
//! │  │    ok         ──► synced                                        │   │
//! │  │    fatal      ──► failed_fatal + emit_rejection                 │   │
//! │  │    transient  ──► increment_retry, defer rest of this doc       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Immediate Pushes
//! The mutation orchestrator pushes fresh entries through
//! [`push_now`](OutboxFlusher::push_now) without waiting for the next flush.
//! Both paths claim an entry in the in-flight set before delivering it, so
//! one entry is never pushed by both at once, and `push_now` steps aside
//! whenever an older entry for the same document is still pending.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use ward_core::{Collection, Mutation, MutationStatus, SyncState};
use ward_db::Database;

use crate::agent::StatusTracker;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{RemoteError, RemoteResult, SyncResult};
use crate::remote::{RemoteStore, RemoteWrite};

// =============================================================================
// Outcomes
// =============================================================================

/// Counters for one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries sent to the remote store.
    pub attempted: usize,
    /// Entries confirmed and marked synced.
    pub synced: usize,
    /// Entries that failed transiently and stay pending.
    pub retried: usize,
    /// Entries demoted to failed_fatal at the retry ceiling.
    pub demoted: usize,
    /// Entries rejected fatally by the remote store.
    pub rejected: usize,
    /// Entries skipped because an immediate push held them.
    pub skipped_in_flight: usize,
    /// Entries held back behind an earlier entry for the same document.
    pub deferred: usize,
}

/// Why a flush did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    SyncDisabled,
}

/// Result of [`OutboxFlusher::flush_outbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Completed(FlushReport),
    AlreadyRunning,
    Skipped(SkipReason),
}

impl FlushOutcome {
    /// Returns the report if the flush ran.
    pub fn report(&self) -> Option<&FlushReport> {
        match self {
            FlushOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Why an immediate push was left to the flush loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    Offline,
    SyncDisabled,
    /// An older entry for the same document is still pending.
    OlderPending,
    /// The flush loop is delivering this entry right now.
    InFlight,
    /// The entry is no longer pending.
    NotPending,
}

/// Result of [`OutboxFlusher::push_now`].
#[derive(Debug, Clone, PartialEq)]
pub enum PushAttempt {
    /// Delivered and marked synced.
    Synced,
    /// Fatally rejected; already marked failed_fatal.
    Rejected(RemoteError),
    /// Transient failure; retry count incremented, entry stays pending.
    Failed(RemoteError),
    /// Not attempted; entry stays pending.
    Deferred(DeferReason),
}

// =============================================================================
// In-flight Tracking
// =============================================================================

#[derive(Debug, Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn try_claim(self: &Arc<Self>, id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if ids.insert(id.to_string()) {
            Some(InFlightGuard {
                owner: Arc::clone(self),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// Releases the claim on drop.
struct InFlightGuard {
    owner: Arc<InFlight>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Delivery {
    Synced,
    Rejected(RemoteError),
    Failed(RemoteError),
}

// =============================================================================
// Outbox Flusher
// =============================================================================

/// Pushes outbox entries to the remote store.
pub struct OutboxFlusher {
    db: Database,
    remote: Arc<dyn RemoteStore>,
    config: Arc<SyncConfig>,
    connectivity: Connectivity,
    tracker: Arc<StatusTracker>,
    flushing: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl OutboxFlusher {
    pub(crate) fn new(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        config: Arc<SyncConfig>,
        connectivity: Connectivity,
        tracker: Arc<StatusTracker>,
    ) -> Self {
        OutboxFlusher {
            db,
            remote,
            config,
            connectivity,
            tracker,
            flushing: AtomicBool::new(false),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    fn skip_reason(&self) -> Option<SkipReason> {
        if !self.config.is_sync_enabled() {
            Some(SkipReason::SyncDisabled)
        } else if !self.connectivity.is_online() {
            Some(SkipReason::Offline)
        } else {
            None
        }
    }

    /// Returns true while a flush pass is running.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Delivers every pending entry, oldest first. Single-flight.
    pub async fn flush_outbox(&self) -> SyncResult<FlushOutcome> {
        if let Some(reason) = self.skip_reason() {
            debug!(?reason, "Skipping outbox flush");
            return Ok(FlushOutcome::Skipped(reason));
        }

        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Outbox flush already running");
            return Ok(FlushOutcome::AlreadyRunning);
        }
        let _guard = FlushGuard(&self.flushing);

        self.tracker.set_state(SyncState::Syncing);
        let result = self.flush_pending().await;

        match &result {
            Ok(report) if report.retried == 0 => {
                self.tracker.record_sync();
                self.tracker.set_state(SyncState::Connected);
            }
            Ok(report) => {
                warn!(retried = report.retried, "Outbox flush left entries pending");
                self.tracker.set_state(SyncState::Error);
            }
            Err(e) => {
                error!(error = %e, "Outbox flush failed");
                self.tracker.record_error(e.to_string());
                self.tracker.set_state(SyncState::Error);
            }
        }

        result.map(FlushOutcome::Completed)
    }

    async fn flush_pending(&self) -> SyncResult<FlushReport> {
        let outbox = self.db.outbox();
        let mut pending = outbox.get_pending().await?;
        // stable: equal timestamps keep insertion order
        pending.sort_by_key(|m| m.enqueued_at);

        let mut report = FlushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        info!(count = pending.len(), "Flushing outbox");
        let max_retries = self.config.sync.max_retries;
        let mut blocked: HashSet<(Collection, String)> = HashSet::new();

        for mutation in pending {
            let key = (mutation.collection, mutation.doc_id.clone());
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }

            if self.in_flight.contains(&mutation.id) {
                report.skipped_in_flight += 1;
                blocked.insert(key);
                continue;
            }

            if mutation.retry_count >= max_retries {
                warn!(
                    id = %mutation.id,
                    doc_id = %mutation.doc_id,
                    retry_count = mutation.retry_count,
                    last_error = ?mutation.last_error,
                    "Demoting outbox entry after retry ceiling"
                );
                outbox
                    .update_status(&mutation.id, MutationStatus::FailedFatal)
                    .await?;
                report.demoted += 1;
                continue;
            }

            let Some(_claim) = self.in_flight.try_claim(&mutation.id) else {
                report.skipped_in_flight += 1;
                blocked.insert(key);
                continue;
            };

            // an immediate push may have settled it since the pending read
            match outbox.get(&mutation.id).await? {
                Some(current) if current.is_pending() => {}
                _ => continue,
            }

            report.attempted += 1;
            match self.deliver(&mutation).await? {
                Delivery::Synced => report.synced += 1,
                Delivery::Rejected(e) => {
                    report.rejected += 1;
                    self.tracker.emit_rejection(&mutation, &e);
                }
                Delivery::Failed(_) => {
                    report.retried += 1;
                    blocked.insert(key);
                }
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            retried = report.retried,
            demoted = report.demoted,
            rejected = report.rejected,
            "Outbox flush complete"
        );
        Ok(report)
    }

    /// Delivers one freshly-enqueued entry right away.
    ///
    /// Never delivers out of order: if an older entry for the same document
    /// is pending, or the entry is already being delivered, it is left to
    /// the flush loop.
    pub async fn push_now(&self, mutation: &Mutation) -> SyncResult<PushAttempt> {
        match self.skip_reason() {
            Some(SkipReason::SyncDisabled) => {
                return Ok(PushAttempt::Deferred(DeferReason::SyncDisabled))
            }
            Some(SkipReason::Offline) => return Ok(PushAttempt::Deferred(DeferReason::Offline)),
            None => {}
        }

        let outbox = self.db.outbox();
        if outbox.has_pending_before(mutation).await? {
            debug!(id = %mutation.id, doc_id = %mutation.doc_id, "Older entry pending, deferring push");
            return Ok(PushAttempt::Deferred(DeferReason::OlderPending));
        }

        let Some(_claim) = self.in_flight.try_claim(&mutation.id) else {
            return Ok(PushAttempt::Deferred(DeferReason::InFlight));
        };

        match outbox.get(&mutation.id).await? {
            Some(current) if current.is_pending() => {}
            _ => return Ok(PushAttempt::Deferred(DeferReason::NotPending)),
        }

        let attempt = match self.deliver(mutation).await? {
            Delivery::Synced => {
                self.tracker.record_sync();
                PushAttempt::Synced
            }
            Delivery::Rejected(e) => PushAttempt::Rejected(e),
            Delivery::Failed(e) => PushAttempt::Failed(e),
        };
        Ok(attempt)
    }

    /// Sends one entry and records the outcome in the outbox.
    async fn deliver(&self, mutation: &Mutation) -> SyncResult<Delivery> {
        let outbox = self.db.outbox();

        match self.push(mutation).await {
            Ok(()) => {
                outbox
                    .update_status(&mutation.id, MutationStatus::Synced)
                    .await?;
                debug!(id = %mutation.id, doc_id = %mutation.doc_id, "Outbox entry synced");
                Ok(Delivery::Synced)
            }
            Err(e) if e.is_fatal() => {
                warn!(
                    id = %mutation.id,
                    doc_id = %mutation.doc_id,
                    error = %e,
                    "Remote store rejected mutation"
                );
                outbox
                    .update_status(&mutation.id, MutationStatus::FailedFatal)
                    .await?;
                outbox.record_error(&mutation.id, &e.to_string()).await?;
                self.tracker.record_error(e.to_string());
                Ok(Delivery::Rejected(e))
            }
            Err(e) => {
                let retries = outbox.increment_retry(&mutation.id).await?;
                outbox.record_error(&mutation.id, &e.to_string()).await?;
                self.tracker.record_error(e.to_string());
                debug!(
                    id = %mutation.id,
                    retries,
                    error = %e,
                    "Transient push failure"
                );
                Ok(Delivery::Failed(e))
            }
        }
    }

    /// Translates an outbox entry into a remote write and sends it.
    pub async fn push(&self, mutation: &Mutation) -> RemoteResult<()> {
        let write = RemoteWrite::from_mutation(mutation, self.config.device_id());
        self.remote.write(write).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoOpEmitter;
    use crate::config::SyncMode;
    use crate::remote::MemoryRemote;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use ward_core::{MutationOp, Payload};
    use ward_db::DbConfig;

    struct Fixture {
        db: Database,
        remote: Arc<MemoryRemote>,
        connectivity: Connectivity,
        flusher: OutboxFlusher,
    }

    async fn fixture(max_retries: u32) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Connectivity::new(true);
        let mut config = SyncConfig::default();
        config.sync.mode = SyncMode::Manual;
        config.sync.max_retries = max_retries;
        let config = Arc::new(config);
        let tracker = Arc::new(StatusTracker::new(Arc::new(NoOpEmitter)));

        let flusher = OutboxFlusher::new(
            db.clone(),
            remote.clone(),
            config,
            connectivity.clone(),
            tracker,
        );
        Fixture {
            db,
            remote,
            connectivity,
            flusher,
        }
    }

    fn add_patient(id: &str, name: &str) -> Mutation {
        let payload: Payload = json!({"name": name, "unitId": "icu"})
            .as_object()
            .cloned()
            .unwrap();
        Mutation::new(Collection::Patients, MutationOp::Add, id, payload)
    }

    fn rename(id: &str, name: &str) -> Mutation {
        let payload: Payload = json!({"name": name}).as_object().cloned().unwrap();
        Mutation::new(Collection::Patients, MutationOp::Update, id, payload)
    }

    #[tokio::test]
    async fn test_flush_delivers_in_enqueue_order() {
        let f = fixture(5).await;
        let base = Utc::now();
        let first = add_patient("p-1", "First").enqueued_at(base);
        let second = rename("p-1", "Second").enqueued_at(base + Duration::milliseconds(5));

        // inserted out of order on purpose
        f.db.outbox().add(&second).await.unwrap();
        f.db.outbox().add(&first).await.unwrap();

        let outcome = f.flusher.flush_outbox().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.synced, 2);

        let log = f.remote.write_log();
        assert_eq!(log[0].mutation_id, first.id);
        assert_eq!(log[1].mutation_id, second.id);

        let doc = f.remote.document(Collection::Patients, "p-1").unwrap();
        assert_eq!(doc.get("name"), Some(&json!("Second")));
        assert_eq!(f.db.outbox().get_stats().await.unwrap().synced, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_blocks_later_entries_for_same_doc() {
        let f = fixture(5).await;
        let base = Utc::now();
        let first = add_patient("p-1", "First").enqueued_at(base);
        let second = rename("p-1", "Second").enqueued_at(base + Duration::milliseconds(5));
        let other = add_patient("p-2", "Other").enqueued_at(base + Duration::milliseconds(10));
        for m in [&first, &second, &other] {
            f.db.outbox().add(m).await.unwrap();
        }

        f.remote.fail_next(RemoteError::unavailable("blip"));
        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(f.db.outbox().get(&first.id).await.unwrap().unwrap().retry_count, 1);
        assert!(f.remote.document(Collection::Patients, "p-1").is_none());

        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(f.db.outbox().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_demotion_at_retry_ceiling_happens_once() {
        let f = fixture(2).await;
        let m = add_patient("p-1", "Doe");
        f.db.outbox().add(&m).await.unwrap();

        f.remote.set_online(false);
        for _ in 0..2 {
            let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
            assert_eq!(report.retried, 1);
        }

        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
        assert_eq!(report.demoted, 1);
        assert_eq!(report.attempted, 0);

        let stats = f.db.outbox().get_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed_fatal, 1);

        // never retried again, even once the remote is back
        f.remote.set_online(true);
        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
        assert_eq!(report, FlushReport::default());
        assert!(f.remote.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_rejection_in_flush() {
        let f = fixture(5).await;
        let m = add_patient("p-1", "Doe");
        f.db.outbox().add(&m).await.unwrap();
        f.remote.deny(Collection::Patients);

        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
        assert_eq!(report.rejected, 1);

        let stored = f.db.outbox().get(&m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MutationStatus::FailedFatal);
        assert!(stored.last_error.unwrap().contains("permission-denied"));
    }

    #[tokio::test]
    async fn test_flush_skipped_while_offline() {
        let f = fixture(5).await;
        f.db.outbox().add(&add_patient("p-1", "Doe")).await.unwrap();
        f.connectivity.set_online(false);

        assert_eq!(
            f.flusher.flush_outbox().await.unwrap(),
            FlushOutcome::Skipped(SkipReason::Offline)
        );
        assert_eq!(f.db.outbox().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_flush_is_single_flight() {
        let f = fixture(5).await;
        f.flusher.flushing.store(true, Ordering::Release);
        assert_eq!(
            f.flusher.flush_outbox().await.unwrap(),
            FlushOutcome::AlreadyRunning
        );
        f.flusher.flushing.store(false, Ordering::Release);
        assert!(matches!(
            f.flusher.flush_outbox().await.unwrap(),
            FlushOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_push_now_defers_behind_older_pending() {
        let f = fixture(5).await;
        let base = Utc::now();
        let first = add_patient("p-1", "First").enqueued_at(base);
        let second = rename("p-1", "Second").enqueued_at(base + Duration::milliseconds(5));
        f.db.outbox().add(&first).await.unwrap();
        f.db.outbox().add(&second).await.unwrap();

        assert_eq!(
            f.flusher.push_now(&second).await.unwrap(),
            PushAttempt::Deferred(DeferReason::OlderPending)
        );
        assert_eq!(f.flusher.push_now(&first).await.unwrap(), PushAttempt::Synced);
        assert_eq!(f.flusher.push_now(&second).await.unwrap(), PushAttempt::Synced);
        assert_eq!(
            f.flusher.push_now(&second).await.unwrap(),
            PushAttempt::Deferred(DeferReason::NotPending)
        );
    }

    #[tokio::test]
    async fn test_flush_skips_entry_held_by_immediate_push() {
        let f = fixture(5).await;
        let m = add_patient("p-1", "Doe");
        f.db.outbox().add(&m).await.unwrap();

        let claim = f.flusher.in_flight.try_claim(&m.id).unwrap();
        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
        assert_eq!(report.skipped_in_flight, 1);
        assert_eq!(report.attempted, 0);
        drop(claim);

        let report = *f.flusher.flush_outbox().await.unwrap().report().unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_redelivery_of_synced_entry_is_noop() {
        let f = fixture(5).await;
        let m = add_patient("p-1", "Doe");
        f.db.outbox().add(&m).await.unwrap();
        assert_eq!(f.flusher.push_now(&m).await.unwrap(), PushAttempt::Synced);

        f.remote
            .seed(Collection::Patients, "p-1", json!({"name": "Edited elsewhere"}).as_object().cloned().unwrap());
        f.flusher.push(&m).await.unwrap();

        let doc = f.remote.document(Collection::Patients, "p-1").unwrap();
        assert_eq!(doc.get("name"), Some(&json!("Edited elsewhere")));
        assert_eq!(f.remote.write_log().len(), 1);
    }
}
