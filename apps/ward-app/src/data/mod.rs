//! # Data Layer
//!
//! Typed collection wrappers over the [`MutationOrchestrator`].
//!
//! ```text
//!   ctx.data().patients().add(payload)
//!        │
//!        ├── strip server-managed fields, validate     (ward-core)
//!        ├── default unitId to the selected unit
//!        ▼
//!   MutationOrchestrator::mutate ──► Store ──► Outbox ──► push worker
//! ```
//!
//! UI code changes domain data only through these wrappers.

mod orchestrator;
mod patients;
mod tasks;
mod units;

use std::sync::Arc;

use serde_json::Value;
use ward_core::Payload;

use crate::state::Store;

pub use orchestrator::{
    MutationOrchestrator, MutationReceipt, PendingReason, PushCompletion, PushOutcome,
};
pub(crate) use orchestrator::replay;
pub use patients::Patients;
pub use tasks::Tasks;
pub use units::Units;

/// Entry point to the collection wrappers.
#[derive(Clone)]
pub struct Data {
    orchestrator: Arc<MutationOrchestrator>,
}

impl Data {
    pub fn new(orchestrator: Arc<MutationOrchestrator>) -> Self {
        Data { orchestrator }
    }

    pub fn patients(&self) -> Patients<'_> {
        Patients::new(&self.orchestrator)
    }

    pub fn tasks(&self) -> Tasks<'_> {
        Tasks::new(&self.orchestrator)
    }

    pub fn units(&self) -> Units<'_> {
        Units::new(&self.orchestrator)
    }

    pub fn orchestrator(&self) -> &Arc<MutationOrchestrator> {
        &self.orchestrator
    }
}

/// Fills in `unitId` from the selected unit when the caller left it out.
fn default_unit(store: &Store, payload: &mut Payload) {
    let missing = matches!(payload.get("unitId"), None | Some(Value::Null));
    if missing {
        if let Some(unit) = store.selected_unit() {
            payload.insert("unitId".to_string(), Value::String(unit));
        }
    }
}

fn new_doc_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time as stored in document timestamps.
fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
