//! # ward-core: Pure Domain Types for Ward Sync
//!
//! This crate holds the vocabulary of the offline-first sync engine: the
//! records the clinician sees, the mutations queued for the remote store,
//! and the validation rules applied before anything is written.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ward Sync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    UI layer (external)                          │   │
//! │  │    Store::subscribe / select          Data::patients().add     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        ward-app: Store, EventBus, MutationOrchestrator          │   │
//! │  └──────────────┬──────────────────────────────┬───────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────┐  ┌────────────▼──────────────────┐   │
//! │  │  ward-db: outbox + cache    │  │  ward-sync: flush + listeners │   │
//! │  └──────────────┬──────────────┘  └────────────┬──────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────────────────────▼───────────────────┐   │
//! │  │               ★ ward-core (THIS CRATE) ★                         │   │
//! │  │   Record • Mutation • Collection • SyncState • validation       │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Record, Mutation, Collection, ...)
//! - [`error`] - Domain error types
//! - [`validation`] - Payload validation for the mutation wrappers

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Number of failed deliveries after which a pending outbox entry is demoted
/// to `failed_fatal` by the flush loop.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// How long terminal (non-pending) outbox entries are kept before cleanup.
pub const OUTBOX_RETENTION_HOURS: i64 = 24;

/// Fields owned by the remote store. Update payloads never carry them.
pub const SERVER_MANAGED_FIELDS: &[&str] = &["id", "createdAt", "createdBy"];

/// Maximum length of the search box query kept in the store.
pub const MAX_SEARCH_QUERY_LEN: usize = 100;
