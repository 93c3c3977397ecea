//! Patient mutations.

use serde_json::Value;
use tracing::debug;

use ward_core::validation::{strip_server_managed, validate_patient_payload};
use ward_core::{Collection, MutationOp, Payload, ValidationError};

use super::{default_unit, new_doc_id, now_rfc3339, MutationOrchestrator, MutationReceipt};
use crate::error::MutationResult;

pub struct Patients<'a> {
    orchestrator: &'a MutationOrchestrator,
}

impl<'a> Patients<'a> {
    pub(crate) fn new(orchestrator: &'a MutationOrchestrator) -> Self {
        Patients { orchestrator }
    }

    /// Admits a patient. `unitId` defaults to the selected unit.
    pub async fn add(&self, payload: Payload) -> MutationResult<MutationReceipt> {
        let mut payload = strip_server_managed(&payload);
        default_unit(self.orchestrator.store(), &mut payload);
        validate_patient_payload(&payload, false)?;

        let id = new_doc_id();
        debug!(id = %id, "Adding patient");
        self.orchestrator
            .mutate(Collection::Patients, MutationOp::Add, payload, &id)
            .await
    }

    pub async fn update(&self, id: &str, patch: Payload) -> MutationResult<MutationReceipt> {
        let patch = strip_server_managed(&patch);
        if patch.is_empty() {
            return Err(ValidationError::Empty {
                field: "patient".to_string(),
            }
            .into());
        }
        validate_patient_payload(&patch, true)?;

        self.orchestrator
            .mutate(Collection::Patients, MutationOp::Update, patch, id)
            .await
    }

    pub async fn delete(&self, id: &str) -> MutationResult<MutationReceipt> {
        self.orchestrator
            .mutate(Collection::Patients, MutationOp::Delete, Payload::new(), id)
            .await
    }

    /// Discharges a patient by stamping `deletedAt`. The record is kept.
    pub async fn discharge(&self, id: &str) -> MutationResult<MutationReceipt> {
        let mut patch = Payload::new();
        patch.insert("deletedAt".to_string(), Value::String(now_rfc3339()));

        self.orchestrator
            .mutate(Collection::Patients, MutationOp::Update, patch, id)
            .await
    }
}
