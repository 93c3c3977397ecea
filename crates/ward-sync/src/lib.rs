//! # ward-sync: Sync Service for Ward Sync
//!
//! The only bridge between the device and the shared remote document store.
//! Local mutations leave the device through the outbox; remote changes
//! arrive as live query snapshots.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Service Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncService (agent.rs)                        │  │
//! │  │                                                                  │  │
//! │  │  Background loop in Auto mode, status + events, cleanup          │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OutboxFlusher  │  │  RemoteStore   │  │  InboundHandler        │    │
//! │  │                │  │  (trait)       │  │                        │    │
//! │  │ Ordered,       │  │                │  │ Unit-scoped live       │    │
//! │  │ idempotent     │  │ write()        │  │ queries → snapshots    │    │
//! │  │ delivery with  │  │ subscribe()    │  │ → emitter + cache      │    │
//! │  │ retry ceiling  │  │                │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  Connectivity (watch) feeds the loop: offline → online flushes.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncService`, status and the event emitter trait
//! - [`config`] - Sync configuration (mode, device ID, intervals)
//! - [`connectivity`] - Online/offline signal
//! - [`error`] - Sync and remote error types
//! - [`inbound`] - Live query listeners
//! - [`outbox`] - Outbox flusher and immediate pushes
//! - [`remote`] - Remote store trait and the in-memory store
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ward_sync::{MemoryRemote, SyncConfig, SyncService};
//!
//! let config = SyncConfig::load_or_default(None);
//! let service = SyncService::new(config, database, Arc::new(MemoryRemote::new()))?;
//! service.start().await?;
//! service.subscribe_to_unit("icu").await?;
//!
//! let status = service.status();
//! println!("State: {}", status.state);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod inbound;
pub mod outbox;
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{NoOpEmitter, SyncEventEmitter, SyncService, SyncServiceBuilder, SyncStatus};
pub use config::{SyncConfig, SyncMode};
pub use connectivity::Connectivity;
pub use error::{RemoteError, RemoteErrorCode, RemoteResult, SyncError, SyncResult};
pub use outbox::{DeferReason, FlushOutcome, FlushReport, PushAttempt, SkipReason};
pub use remote::{
    MemoryRemote, RemoteQuery, RemoteStore, RemoteSubscription, RemoteWrite, ServerStamps,
    WriteKind,
};
