//! Unit mutations.

use ward_core::validation::{strip_server_managed, validate_unit_payload};
use ward_core::{Collection, MutationOp, Payload, ValidationError};

use super::{new_doc_id, MutationOrchestrator, MutationReceipt};
use crate::error::MutationResult;

pub struct Units<'a> {
    orchestrator: &'a MutationOrchestrator,
}

impl<'a> Units<'a> {
    pub(crate) fn new(orchestrator: &'a MutationOrchestrator) -> Self {
        Units { orchestrator }
    }

    pub async fn add(&self, payload: Payload) -> MutationResult<MutationReceipt> {
        let payload = strip_server_managed(&payload);
        validate_unit_payload(&payload, false)?;

        self.orchestrator
            .mutate(Collection::Units, MutationOp::Add, payload, &new_doc_id())
            .await
    }

    pub async fn update(&self, id: &str, patch: Payload) -> MutationResult<MutationReceipt> {
        let patch = strip_server_managed(&patch);
        if patch.is_empty() {
            return Err(ValidationError::Empty {
                field: "unit".to_string(),
            }
            .into());
        }
        validate_unit_payload(&patch, true)?;

        self.orchestrator
            .mutate(Collection::Units, MutationOp::Update, patch, id)
            .await
    }

    pub async fn delete(&self, id: &str) -> MutationResult<MutationReceipt> {
        self.orchestrator
            .mutate(Collection::Units, MutationOp::Delete, Payload::new(), id)
            .await
    }
}
