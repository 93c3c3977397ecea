//! # Sync Service
//!
//! Owns the connection to the remote store and keeps the device and the
//! shared document store converging.
//!
//! ## Service Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncService                                      │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  background loop (Auto mode only)                                │  │
//! │  │                                                                  │  │
//! │  │  • startup delay ──► first flush                                 │  │
//! │  │  • every flush_interval ──► flush                                │  │
//! │  │  • every cleanup_interval ──► retention cleanup                  │  │
//! │  │  • offline → online ──► flush immediately                        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┴─────────────────────┐                  │
//! │         ▼                                           ▼                   │
//! │  ┌────────────────┐                        ┌────────────────────────┐  │
//! │  │ OutboxFlusher  │                        │   InboundHandler       │  │
//! │  │ local → remote │                        │   remote → local       │  │
//! │  └────────────────┘                        └────────────────────────┘  │
//! │                                                                         │
//! │  EVENTS (SyncEventEmitter):                                            │
//! │  • emit_state     - sync state changed                                 │
//! │  • emit_snapshot  - a live query delivered a full snapshot             │
//! │  • emit_rejection - the remote store permanently rejected a mutation  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{SecondsFormat, Utc};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use ward_core::{Collection, Mutation, Record, SyncState};
use ward_db::Database;

use crate::config::{SyncConfig, SyncMode};
use crate::connectivity::Connectivity;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::inbound::InboundHandler;
use crate::outbox::{FlushOutcome, OutboxFlusher, PushAttempt};
use crate::remote::RemoteStore;

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Current sync state.
    pub state: SyncState,

    /// Whether the platform reports network connectivity.
    pub is_online: bool,

    /// Number of pending outbox entries.
    pub pending_count: u64,

    /// Last successful delivery timestamp (RFC 3339).
    pub last_sync: Option<String>,

    /// Last error message (if any).
    pub last_error: Option<String>,

    /// Sync mode.
    pub mode: SyncMode,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            state: SyncState::Offline,
            is_online: false,
            pending_count: 0,
            last_sync: None,
            last_error: None,
            mode: SyncMode::Auto,
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync events (implemented by the application layer).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync state change.
    fn emit_state(&self, status: &SyncStatus);

    /// Emits a full snapshot delivered by a live query.
    fn emit_snapshot(&self, collection: Collection, records: &[Record]);

    /// Emits a permanent rejection of an outbox entry.
    fn emit_rejection(&self, mutation: &Mutation, error: &RemoteError);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_state(&self, _status: &SyncStatus) {}
    fn emit_snapshot(&self, _collection: Collection, _records: &[Record]) {}
    fn emit_rejection(&self, _mutation: &Mutation, _error: &RemoteError) {}
}

// =============================================================================
// Status Tracker
// =============================================================================

/// Shared status plus the emitter it reports to.
pub(crate) struct StatusTracker {
    status: RwLock<SyncStatus>,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl StatusTracker {
    pub(crate) fn new(emitter: Arc<dyn SyncEventEmitter>) -> Self {
        StatusTracker {
            status: RwLock::new(SyncStatus::default()),
            emitter,
        }
    }

    fn with_status(status: SyncStatus, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        StatusTracker {
            status: RwLock::new(status),
            emitter,
        }
    }

    pub(crate) fn snapshot(&self) -> SyncStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update<F: FnOnce(&mut SyncStatus)>(&self, f: F) -> SyncStatus {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
        status.clone()
    }

    pub(crate) fn state(&self) -> SyncState {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Changes the state, emitting only on an actual transition.
    pub(crate) fn set_state(&self, state: SyncState) {
        let mut changed = false;
        let status = self.update(|s| {
            if s.state != state {
                s.state = state;
                changed = true;
            }
        });

        if changed {
            debug!(state = %state, "Sync state changed");
            self.emitter.emit_state(&status);
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.update(|s| s.is_online = online);
    }

    pub(crate) fn set_pending(&self, pending: u64) {
        self.update(|s| s.pending_count = pending);
    }

    pub(crate) fn record_sync(&self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.update(|s| s.last_sync = Some(now));
    }

    pub(crate) fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| s.last_error = Some(message));
    }

    pub(crate) fn emit_snapshot(&self, collection: Collection, records: &[Record]) {
        self.emitter.emit_snapshot(collection, records);
    }

    pub(crate) fn emit_rejection(&self, mutation: &Mutation, error: &RemoteError) {
        self.emitter.emit_rejection(mutation, error);
    }
}

// =============================================================================
// Sync Service
// =============================================================================

/// Runs outbox delivery and inbound subscriptions for one device.
pub struct SyncService {
    config: Arc<SyncConfig>,
    db: Database,
    connectivity: Connectivity,
    tracker: Arc<StatusTracker>,
    flusher: Arc<OutboxFlusher>,
    inbound: InboundHandler,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Creates a sync service with a no-op emitter and an online signal.
    pub fn new(
        config: SyncConfig,
        db: Database,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncResult<Self> {
        SyncServiceBuilder::new(config)
            .with_database(db)
            .with_remote(remote)
            .build()
    }

    /// Returns the builder.
    pub fn builder(config: SyncConfig) -> SyncServiceBuilder {
        SyncServiceBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Returns the current sync status.
    pub fn status(&self) -> SyncStatus {
        self.tracker.snapshot()
    }

    /// Returns true once `start` has spawned the background loop.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts the service.
    ///
    /// Runs a retention cleanup, publishes the initial state and, in
    /// [`SyncMode::Auto`], spawns the background loop. Calling it again
    /// while running does nothing.
    pub async fn start(&self) -> SyncResult<()> {
        if self.is_running() {
            debug!("Sync service already running");
            return Ok(());
        }

        info!(
            device_id = %self.config.device_id(),
            mode = %self.config.mode(),
            "Starting sync service"
        );

        match self.auto_cleanup().await {
            Ok(removed) if removed > 0 => info!(removed, "Startup outbox cleanup"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Startup outbox cleanup failed"),
        }
        self.refresh_pending().await;

        let online = self.connectivity.is_online();
        self.tracker.set_online(online);
        let initial = if self.config.is_sync_enabled() && online {
            SyncState::Connected
        } else {
            SyncState::Offline
        };
        self.tracker.set_state(initial);

        if !self.config.mode().runs_background_loop() {
            info!(mode = %self.config.mode(), "Background sync loop disabled");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_loop(
            self.config.clone(),
            self.db.clone(),
            self.connectivity.clone(),
            self.tracker.clone(),
            self.flusher.clone(),
            shutdown_rx,
        ));

        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
        *self.loop_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!("Sync service started");
        Ok(())
    }

    /// Stops the background loop and all live subscriptions.
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!("Shutting down sync service");

        let tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let task = self
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Sync loop task failed");
                }
            }
        }

        self.inbound.unsubscribe_all();
        self.tracker.set_state(SyncState::Offline);

        info!("Sync service stopped");
        Ok(())
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Delivers every pending outbox entry, oldest first.
    pub async fn flush_outbox(&self) -> SyncResult<FlushOutcome> {
        let outcome = self.flusher.flush_outbox().await;
        self.refresh_pending().await;
        outcome
    }

    /// Delivers one freshly-enqueued entry without waiting for the loop.
    pub async fn push_now(&self, mutation: &Mutation) -> SyncResult<PushAttempt> {
        let attempt = self.flusher.push_now(mutation).await;
        self.refresh_pending().await;
        attempt
    }

    /// Deletes synced entries and settled entries past the retention window.
    pub async fn auto_cleanup(&self) -> SyncResult<u64> {
        let removed = self
            .db
            .outbox()
            .clear_synced(self.config.retention())
            .await?;
        Ok(removed)
    }

    async fn refresh_pending(&self) {
        refresh_pending(&self.db, &self.tracker).await;
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Replaces the live patient and task subscriptions with ones for `unit_id`.
    pub async fn subscribe_to_unit(&self, unit_id: &str) -> SyncResult<()> {
        self.inbound.subscribe_to_unit(unit_id).await
    }

    /// Subscribes to the unit list.
    pub async fn subscribe_to_units(&self) -> SyncResult<()> {
        self.inbound.subscribe_to_units().await
    }

    /// Unit the patient and task subscriptions currently follow.
    pub fn current_unit(&self) -> Option<String> {
        self.inbound.current_unit()
    }

    /// Drops every live subscription.
    pub fn unsubscribe_all(&self) {
        self.inbound.unsubscribe_all();
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if let Some(task) = self
            .loop_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn refresh_pending(db: &Database, tracker: &StatusTracker) {
    match db.outbox().count_pending().await {
        Ok(pending) => tracker.set_pending(pending),
        Err(e) => warn!(error = %e, "Failed to count pending outbox entries"),
    }
}

async fn run_flush(db: &Database, tracker: &StatusTracker, flusher: &OutboxFlusher) {
    match flusher.flush_outbox().await {
        Ok(FlushOutcome::Completed(report)) => {
            debug!(?report, "Scheduled flush finished");
        }
        Ok(other) => debug!(?other, "Scheduled flush did not run"),
        Err(e) => error!(error = %e, "Scheduled flush failed"),
    }
    refresh_pending(db, tracker).await;
}

/// Background loop for [`SyncMode::Auto`].
async fn run_loop(
    config: Arc<SyncConfig>,
    db: Database,
    connectivity: Connectivity,
    tracker: Arc<StatusTracker>,
    flusher: Arc<OutboxFlusher>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let start = Instant::now();
    let startup = tokio::time::sleep(config.startup_delay());
    tokio::pin!(startup);
    let mut started = false;

    let mut flush_tick = interval_at(
        start + config.startup_delay() + config.flush_interval(),
        config.flush_interval(),
    );
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cleanup_tick = interval_at(start + config.cleanup_interval(), config.cleanup_interval());
    cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut online_rx = connectivity.subscribe();
    online_rx.borrow_and_update();

    info!("Sync loop started");

    loop {
        tokio::select! {
            _ = &mut startup, if !started => {
                started = true;
                debug!("Startup delay elapsed");
                run_flush(&db, &tracker, &flusher).await;
            }

            _ = flush_tick.tick() => {
                run_flush(&db, &tracker, &flusher).await;
            }

            _ = cleanup_tick.tick() => {
                match db.outbox().clear_synced(config.retention()).await {
                    Ok(removed) => debug!(removed, "Periodic outbox cleanup"),
                    Err(e) => warn!(error = %e, "Periodic outbox cleanup failed"),
                }
            }

            changed = online_rx.changed() => {
                if changed.is_err() {
                    warn!("Connectivity signal closed");
                    break;
                }
                let online = *online_rx.borrow_and_update();
                tracker.set_online(online);

                if online {
                    info!("Back online, flushing outbox");
                    tracker.set_state(SyncState::Connected);
                    run_flush(&db, &tracker, &flusher).await;
                } else {
                    tracker.set_state(SyncState::Offline);
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Sync loop received shutdown");
                break;
            }
        }
    }

    info!("Sync loop stopped");
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SyncService`].
pub struct SyncServiceBuilder {
    config: SyncConfig,
    db: Option<Database>,
    remote: Option<Arc<dyn RemoteStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    connectivity: Option<Connectivity>,
}

impl SyncServiceBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncServiceBuilder {
            config,
            db: None,
            remote: None,
            emitter: None,
            connectivity: None,
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Validates the configuration and builds the service.
    pub fn build(self) -> SyncResult<SyncService> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote store required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let connectivity = self.connectivity.unwrap_or_default();

        let config = Arc::new(self.config);
        let tracker = Arc::new(StatusTracker::with_status(
            SyncStatus {
                mode: config.mode(),
                is_online: connectivity.is_online(),
                ..Default::default()
            },
            emitter,
        ));

        let flusher = Arc::new(OutboxFlusher::new(
            db.clone(),
            remote.clone(),
            config.clone(),
            connectivity.clone(),
            tracker.clone(),
        ));
        let inbound = InboundHandler::new(db.clone(), remote, config.clone(), tracker.clone());

        Ok(SyncService {
            config,
            db,
            connectivity,
            tracker,
            flusher,
            inbound,
            shutdown_tx: Mutex::new(None),
            loop_task: Mutex::new(None),
        })
    }
}
