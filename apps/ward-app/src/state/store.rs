//! # Reactive Store
//!
//! Single in-memory snapshot of domain and UI state. Every write produces a
//! new immutable snapshot, notifies subscribers, then publishes one
//! `StateChanged` event per changed top-level key.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Store write                                         │
//! │                                                                         │
//! │  set(StatePatch) ─────────────┐                                        │
//! │  mutate(collection, id, op) ──┼──► lock ─► clone current ─► apply      │
//! │  restore(collection, id, ..) ─┘        │                     │         │
//! │                                        │        error? ◄─────┤         │
//! │                                        │   (snapshot kept)   │         │
//! │                                        ▼                     ▼         │
//! │                                  swap Arc<StoreSnapshot> ◄── ok        │
//! │                                  enqueue for delivery                  │
//! │                                        │                               │
//! │                                   unlock                               │
//! │                                        │                               │
//! │                                        ▼                               │
//! │        drain queue (one thread at a time, in commit order)             │
//! │                   listeners(&snapshot)  (panics caught)                │
//! │                   bus: StateChanged { key } per changed key            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers never see a half-applied write: they hold an `Arc` to a complete
//! snapshot. Subscribers see snapshots in commit order, so the last one a
//! listener receives is always the current state. A write that lands while
//! another thread is delivering is handed to that thread and delivered after
//! the ones before it; the writer returns without waiting.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

use ward_core::{Collection, Payload, Record, SyncState, ViewFilter};

use super::bus::{AppEvent, EventBus};
use crate::error::StoreError;

// =============================================================================
// Snapshot
// =============================================================================

/// Top-level keys of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    Patients,
    Tasks,
    Units,
    SelectedUnit,
    SearchQuery,
    Filter,
    SyncState,
    Online,
}

impl From<Collection> for StateKey {
    fn from(collection: Collection) -> Self {
        match collection {
            Collection::Patients => StateKey::Patients,
            Collection::Tasks => StateKey::Tasks,
            Collection::Units => StateKey::Units,
        }
    }
}

/// Immutable view of everything the UI renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub patients: Vec<Record>,
    pub tasks: Vec<Record>,
    pub units: Vec<Record>,
    pub selected_unit: Option<String>,
    pub search_query: String,
    pub filter: ViewFilter,
    pub sync_state: SyncState,
    pub online: bool,
}

impl StoreSnapshot {
    pub fn collection(&self, collection: Collection) -> &[Record] {
        match collection {
            Collection::Patients => &self.patients,
            Collection::Tasks => &self.tasks,
            Collection::Units => &self.units,
        }
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut Vec<Record> {
        match collection {
            Collection::Patients => &mut self.patients,
            Collection::Tasks => &mut self.tasks,
            Collection::Units => &mut self.units,
        }
    }

    fn position(&self, collection: Collection, id: &str) -> Option<usize> {
        self.collection(collection).iter().position(|r| r.id == id)
    }

    fn value(&self, key: StateKey) -> Result<Value, serde_json::Error> {
        match key {
            StateKey::Patients => serde_json::to_value(&self.patients),
            StateKey::Tasks => serde_json::to_value(&self.tasks),
            StateKey::Units => serde_json::to_value(&self.units),
            StateKey::SelectedUnit => serde_json::to_value(&self.selected_unit),
            StateKey::SearchQuery => serde_json::to_value(&self.search_query),
            StateKey::Filter => serde_json::to_value(self.filter),
            StateKey::SyncState => serde_json::to_value(self.sync_state),
            StateKey::Online => serde_json::to_value(self.online),
        }
    }
}

// =============================================================================
// Patches and Operations
// =============================================================================

/// Partial update for [`Store::set`]. `None` leaves a key untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub patients: Option<Vec<Record>>,
    pub tasks: Option<Vec<Record>>,
    pub units: Option<Vec<Record>>,
    pub selected_unit: Option<Option<String>>,
    pub search_query: Option<String>,
    pub filter: Option<ViewFilter>,
    pub sync_state: Option<SyncState>,
    pub online: Option<bool>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces one collection.
    pub fn collection(mut self, collection: Collection, records: Vec<Record>) -> Self {
        match collection {
            Collection::Patients => self.patients = Some(records),
            Collection::Tasks => self.tasks = Some(records),
            Collection::Units => self.units = Some(records),
        }
        self
    }

    pub fn selected_unit(mut self, unit_id: Option<String>) -> Self {
        self.selected_unit = Some(unit_id);
        self
    }

    pub fn search_query(mut self, query: impl Into<String>) -> Self {
        self.search_query = Some(query.into());
        self
    }

    pub fn filter(mut self, filter: ViewFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sync_state(mut self, state: SyncState) -> Self {
        self.sync_state = Some(state);
        self
    }

    pub fn online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }

    /// Applies the patch, returning the keys whose value actually changed.
    fn apply(self, snapshot: &mut StoreSnapshot) -> Vec<StateKey> {
        fn assign<T: PartialEq>(
            slot: &mut T,
            value: Option<T>,
            key: StateKey,
            changed: &mut Vec<StateKey>,
        ) {
            if let Some(value) = value {
                if *slot != value {
                    *slot = value;
                    changed.push(key);
                }
            }
        }

        let mut changed = Vec::new();
        assign(&mut snapshot.patients, self.patients, StateKey::Patients, &mut changed);
        assign(&mut snapshot.tasks, self.tasks, StateKey::Tasks, &mut changed);
        assign(&mut snapshot.units, self.units, StateKey::Units, &mut changed);
        assign(
            &mut snapshot.selected_unit,
            self.selected_unit,
            StateKey::SelectedUnit,
            &mut changed,
        );
        assign(
            &mut snapshot.search_query,
            self.search_query,
            StateKey::SearchQuery,
            &mut changed,
        );
        assign(&mut snapshot.filter, self.filter, StateKey::Filter, &mut changed);
        assign(
            &mut snapshot.sync_state,
            self.sync_state,
            StateKey::SyncState,
            &mut changed,
        );
        assign(&mut snapshot.online, self.online, StateKey::Online, &mut changed);
        changed
    }
}

/// A change to one record of one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert a new record. Fails if the id exists.
    Add(Record),
    /// Merge fields into an existing record. Fails if the id is missing.
    Update(Payload),
    /// Remove an existing record. Fails if the id is missing.
    Delete,
    /// Insert or overwrite.
    Replace(Record),
}

/// Deep copy of one record plus where it sat, for rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub record: Record,
    pub position: usize,
}

// =============================================================================
// Store
// =============================================================================

type Listener = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

/// Committed snapshots waiting to reach listeners.
#[derive(Default)]
struct Delivery {
    queue: VecDeque<(Arc<StoreSnapshot>, Vec<StateKey>)>,
    draining: bool,
}

/// Handle returned by [`Store::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Exclusive owner of UI-visible state.
pub struct Store {
    state: Mutex<Arc<StoreSnapshot>>,
    delivery: Mutex<Delivery>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    bus: Arc<EventBus>,
}

impl Store {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_snapshot(StoreSnapshot::default(), bus)
    }

    pub fn with_snapshot(snapshot: StoreSnapshot, bus: Arc<EventBus>) -> Self {
        Store {
            state: Mutex::new(Arc::new(snapshot)),
            delivery: Mutex::new(Delivery::default()),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            bus,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns one top-level key as JSON.
    pub fn get(&self, key: StateKey) -> Value {
        self.snapshot().value(key).unwrap_or(Value::Null)
    }

    /// Copy of every record in a collection.
    pub fn select(&self, collection: Collection) -> Vec<Record> {
        self.snapshot().collection(collection).to_vec()
    }

    /// Copy of the records matching `predicate`.
    pub fn select_where<F>(&self, collection: Collection, predicate: F) -> Vec<Record>
    where
        F: Fn(&Record) -> bool,
    {
        self.snapshot()
            .collection(collection)
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    pub fn find(&self, collection: Collection, id: &str) -> Option<Record> {
        self.snapshot()
            .collection(collection)
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Independent copy of a record for a later [`restore`](Self::restore).
    pub fn get_snapshot(&self, collection: Collection, id: &str) -> Option<RecordSnapshot> {
        let snapshot = self.snapshot();
        let position = snapshot.position(collection, id)?;
        Some(RecordSnapshot {
            record: snapshot.collection(collection)[position].clone(),
            position,
        })
    }

    pub fn selected_unit(&self) -> Option<String> {
        self.snapshot().selected_unit.clone()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Merges a patch and republishes.
    pub fn set(&self, patch: StatePatch) {
        // a patch cannot fail
        let _ = self.commit(|snapshot| Ok(patch.apply(snapshot)));
    }

    /// Applies one record operation. All or nothing.
    pub fn mutate(&self, collection: Collection, id: &str, op: StoreOp) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            let mut records = snapshot.collection(collection).to_vec();
            let position = records.iter().position(|r| r.id == id);

            match (op, position) {
                (StoreOp::Add(_), Some(_)) => {
                    return Err(StoreError::AlreadyExists {
                        collection,
                        id: id.to_string(),
                    })
                }
                (StoreOp::Add(mut record), None) => {
                    record.id = id.to_string();
                    records.push(record);
                }
                (StoreOp::Update(patch), Some(i)) => {
                    records[i] = records[i].merged(&patch)?;
                }
                (StoreOp::Delete, Some(i)) => {
                    records.remove(i);
                }
                (StoreOp::Update(_) | StoreOp::Delete, None) => {
                    return Err(StoreError::NotFound {
                        collection,
                        id: id.to_string(),
                    })
                }
                (StoreOp::Replace(mut record), position) => {
                    record.id = id.to_string();
                    match position {
                        Some(i) => records[i] = record,
                        None => records.push(record),
                    }
                }
            }

            Ok(StatePatch::new()
                .collection(collection, records)
                .apply(snapshot))
        })
    }

    /// Puts a record back as captured, or removes the id when there was
    /// nothing to capture. Used only for rollback.
    pub fn restore(&self, collection: Collection, id: &str, snapshot: Option<RecordSnapshot>) {
        let _ = self.commit(|state| {
            let mut records = state.collection(collection).to_vec();
            let current = records.iter().position(|r| r.id == id);

            match (snapshot, current) {
                (Some(saved), Some(i)) => {
                    records.remove(i);
                    let at = saved.position.min(records.len());
                    records.insert(at, saved.record);
                }
                (Some(saved), None) => {
                    let at = saved.position.min(records.len());
                    records.insert(at, saved.record);
                }
                (None, Some(i)) => {
                    records.remove(i);
                }
                (None, None) => {}
            }

            Ok(StatePatch::new()
                .collection(collection, records)
                .apply(state))
        });
        debug!(collection = %collection, id, "Record restored");
    }

    fn commit<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreSnapshot) -> Result<Vec<StateKey>, StoreError>,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut next = StoreSnapshot::clone(&state);
            let changed = f(&mut next)?;
            if changed.is_empty() {
                return Ok(());
            }
            let next = Arc::new(next);
            *state = Arc::clone(&next);
            // queued under the state lock so delivery order matches commit order
            self.delivery().queue.push_back((next, changed));
        }

        self.deliver();
        Ok(())
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drains the delivery queue unless another thread already is.
    fn deliver(&self) {
        {
            let mut delivery = self.delivery();
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        loop {
            let next = {
                let mut delivery = self.delivery();
                match delivery.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };

            let (snapshot, changed) = next;
            self.notify(&snapshot);
            for key in changed {
                self.bus.emit(AppEvent::StateChanged { key });
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers a listener called with every new snapshot.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreSnapshot) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    fn notify(&self, snapshot: &StoreSnapshot) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                error!("Store listener panicked");
            }
        }
    }
}
