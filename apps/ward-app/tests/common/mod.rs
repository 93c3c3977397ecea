#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use ward_app::{AppContext, AppEvent, EventKind};
use ward_core::Payload;
use ward_db::{Database, DbConfig};
use ward_sync::{Connectivity, MemoryRemote, SyncConfig, SyncMode};

pub struct TestApp {
    pub ctx: AppContext,
    pub remote: Arc<MemoryRemote>,
}

pub fn config(mode: SyncMode) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.sync.mode = mode;
    config.sync.startup_delay_ms = 10;
    config
}

pub async fn app(mode: SyncMode, online: bool) -> TestApp {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    app_with(config(mode), db, Arc::new(MemoryRemote::new()), online).await
}

pub async fn app_with(
    config: SyncConfig,
    db: Database,
    remote: Arc<MemoryRemote>,
    online: bool,
) -> TestApp {
    let ctx = AppContext::new(config, db, remote.clone(), Connectivity::new(online)).unwrap();
    ctx.start().await.unwrap();
    TestApp { ctx, remote }
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

/// Collects every event of one kind.
pub fn record_events(ctx: &AppContext, kind: EventKind) -> Arc<Mutex<Vec<AppEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    ctx.bus().on(kind, move |e| sink.lock().unwrap().push(e.clone()));
    events
}

/// Polls `check` until it returns true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
