//! # ward-db: Durable Local Storage for Ward Sync
//!
//! This crate owns everything that must survive a process restart: the
//! outbox of not-yet-confirmed mutations and the cached server snapshot
//! used as the read path while offline.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ward Sync Data Flow                              │
//! │                                                                         │
//! │  MutationOrchestrator            InboundHandler                        │
//! │       │ outbox().add()                │ records().replace_collection() │
//! │       ▼                               ▼                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     ward-db (THIS CRATE)                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────────┐  ┌─────────────┐  │   │
//! │  │   │   Database    │    │  Repositories     │  │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│  OutboxRepository │  │ (embedded)  │  │   │
//! │  │   │  SqlitePool   │    │  RecordCacheRepo  │  │ 001_init    │  │   │
//! │  │   └───────────────┘    └───────────────────┘  └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (or `:memory:` in tests)                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ward_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("ward.db")).await?;
//! let pending = db.outbox().get_pending().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::outbox::OutboxRepository;
pub use repository::records::RecordCacheRepository;
