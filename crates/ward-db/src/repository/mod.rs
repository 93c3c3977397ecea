//! # Repository Module
//!
//! Repository implementations for Ward Sync's local storage.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories                                         │
//! │                                                                         │
//! │  db.outbox()                          db.records()                     │
//! │       │                                    │                            │
//! │       ▼                                    ▼                            │
//! │  OutboxRepository                     RecordCacheRepository            │
//! │  ├── add / get / get_pending          ├── get / get_all                │
//! │  ├── update_status / increment_retry  ├── put / delete / clear         │
//! │  ├── has_pending_before               └── replace_collection           │
//! │  └── clear_synced / get_stats                                          │
//! │       │                                    │                            │
//! │       ▼                                    ▼                            │
//! │  outbox table (idx on status)         records table                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`OutboxRepository`](outbox::OutboxRepository) - Durable mutation queue
//! - [`RecordCacheRepository`](records::RecordCacheRepository) - Offline read path

pub mod outbox;
pub mod records;

/// Current time as stored in INTEGER timestamp columns.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
