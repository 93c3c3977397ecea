//! # State Module
//!
//! In-memory application state and the notifications around it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    State Architecture                                   │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────────────────┐  │
//! │  │   EventBus   │◄─│      Store       │◄─│    StoreSyncEmitter      │  │
//! │  │              │  │                  │  │                          │  │
//! │  │ typed events │  │ Arc<Snapshot>    │  │ sync state + inbound     │  │
//! │  │ per kind     │  │ swapped per write│  │ snapshots from ward-sync │  │
//! │  └──────────────┘  └──────────────────┘  └──────────────────────────┘  │
//! │                                                                         │
//! │  THREAD SAFETY:                                                        │
//! │  • Store: one Mutex around an Arc swap; readers clone the Arc          │
//! │  • EventBus: RwLock over the handler table; handlers run unlocked      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod store;
mod sync;

pub use bus::{AppEvent, EventBus, EventKind, HandlerId, Toast, ToastLevel};
pub use store::{
    ListenerId, RecordSnapshot, StateKey, StatePatch, Store, StoreOp, StoreSnapshot,
};
pub use sync::{StoreSyncEmitter, SyncStatusDto};
