//! Ward Sync demo.
//!
//! Runs the offline-first flow against the in-memory remote store:
//! an offline admission, a reconnect that flushes it, and a change the
//! remote rejects.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use ward_app::{init_tracing, AppContext, AppError, EventKind, PushOutcome};
use ward_core::{Collection, Payload};
use ward_db::{Database, DbConfig};
use ward_sync::{Connectivity, MemoryRemote, SyncConfig, SyncMode};

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let mut config = SyncConfig::load_or_default(None);
    config.sync.mode = SyncMode::Auto;
    config.sync.flush_interval_secs = 1;
    config.sync.startup_delay_ms = 100;

    let db = Database::new(DbConfig::in_memory()).await?;
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(Collection::Units, "icu", payload(json!({"name": "ICU"})));

    let connectivity = Connectivity::new(false);
    let ctx = AppContext::new(config, db, remote.clone(), connectivity)?;

    ctx.bus().on(EventKind::Toast, |event| info!(?event, "Toast"));
    ctx.bus().on(EventKind::SyncStateChanged, |event| {
        info!(?event, "Sync badge")
    });

    ctx.start().await?;
    ctx.select_unit("icu").await?;

    // offline: applied and logged, not delivered
    let admitted = ctx
        .data()
        .patients()
        .add(payload(json!({"name": "Ada Lovelace"})))
        .await?;
    info!(id = %admitted.id, outcome = ?admitted.completion.wait().await, "Admitted while offline");
    info!(status = ?ctx.sync_status(), "Before reconnect");

    ctx.set_online(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!(
        remote_patients = remote.document_count(Collection::Patients),
        status = ?ctx.sync_status(),
        "After reconnect"
    );

    remote.deny(Collection::Tasks);
    let task = ctx
        .data()
        .tasks()
        .add(payload(json!({"title": "Hourly obs"})))
        .await?;
    if let PushOutcome::RolledBack { error } = task.completion.wait().await {
        info!(%error, tasks = ctx.store().select(Collection::Tasks).len(), "Task rolled back");
    }

    ctx.shutdown().await?;
    Ok(())
}
