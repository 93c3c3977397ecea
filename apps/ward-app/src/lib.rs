//! # Ward App Library
//!
//! Application root of the offline-first ward client: the reactive store,
//! the event bus and the only write path to domain data.
//!
//! ## Module Organization
//! ```text
//! ward_app/
//! ├── lib.rs          ◄─── You are here (exports & tracing setup)
//! ├── context.rs      ◄─── AppContext: owns and wires every component
//! ├── state/
//! │   ├── bus.rs      ◄─── Typed event bus
//! │   ├── store.rs    ◄─── Reactive store (Arc snapshot swap)
//! │   └── sync.rs     ◄─── SyncService emitter feeding the store
//! ├── data/
//! │   ├── orchestrator.rs ◄─── optimistic apply → WAL → push → rollback
//! │   ├── patients.rs ◄─── Patient wrappers
//! │   ├── tasks.rs    ◄─── Task wrappers
//! │   └── units.rs    ◄─── Unit wrappers
//! └── error.rs        ◄─── StoreError, MutationError, AppError
//! ```
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use ward_app::AppContext;
//! use ward_sync::{Connectivity, MemoryRemote, SyncConfig};
//!
//! # async fn run() -> Result<(), ward_app::AppError> {
//! let ctx = AppContext::open(
//!     SyncConfig::load_or_default(None),
//!     Arc::new(MemoryRemote::new()),
//!     Connectivity::new(true),
//! )
//! .await?;
//! ctx.start().await?;
//!
//! let payload = json!({"name": "Ada"}).as_object().cloned().unwrap_or_default();
//! let receipt = ctx.data().patients().add(payload).await?;
//! let _outcome = receipt.completion.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod data;
pub mod error;
pub mod state;

use tracing_subscriber::EnvFilter;

pub use context::AppContext;
pub use data::{
    Data, MutationOrchestrator, MutationReceipt, Patients, PendingReason, PushCompletion,
    PushOutcome, Tasks, Units,
};
pub use error::{AppError, AppResult, ErrorCode, MutationError, MutationResult, StoreError};
pub use state::{
    AppEvent, EventBus, EventKind, StateKey, StatePatch, Store, StoreOp, StoreSnapshot,
    SyncStatusDto, Toast, ToastLevel,
};

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=ward_sync=trace` - Trace the sync service only
/// - Default: `info,ward=debug,sqlx=warn`
///
/// Calling it more than once is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ward=debug,sqlx=warn"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
