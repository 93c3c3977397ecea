//! Task mutations.

use serde_json::Value;

use ward_core::validation::{strip_server_managed, validate_task_patch, validate_task_payload};
use ward_core::{Collection, MutationOp, Payload, ValidationError};

use super::{default_unit, new_doc_id, MutationOrchestrator, MutationReceipt};
use crate::error::MutationResult;

pub struct Tasks<'a> {
    orchestrator: &'a MutationOrchestrator,
}

impl<'a> Tasks<'a> {
    pub(crate) fn new(orchestrator: &'a MutationOrchestrator) -> Self {
        Tasks { orchestrator }
    }

    /// Creates a task. New tasks start open unless `completed` is given.
    pub async fn add(&self, payload: Payload) -> MutationResult<MutationReceipt> {
        let mut payload = strip_server_managed(&payload);
        default_unit(self.orchestrator.store(), &mut payload);
        payload
            .entry("completed".to_string())
            .or_insert(Value::Bool(false));
        validate_task_payload(&payload)?;

        self.orchestrator
            .mutate(Collection::Tasks, MutationOp::Add, payload, &new_doc_id())
            .await
    }

    pub async fn update(&self, id: &str, patch: Payload) -> MutationResult<MutationReceipt> {
        let patch = strip_server_managed(&patch);
        if patch.is_empty() {
            return Err(ValidationError::Empty {
                field: "task".to_string(),
            }
            .into());
        }
        validate_task_patch(&patch)?;

        self.orchestrator
            .mutate(Collection::Tasks, MutationOp::Update, patch, id)
            .await
    }

    pub async fn set_completed(&self, id: &str, completed: bool) -> MutationResult<MutationReceipt> {
        let mut patch = Payload::new();
        patch.insert("completed".to_string(), Value::Bool(completed));
        self.update(id, patch).await
    }

    pub async fn delete(&self, id: &str) -> MutationResult<MutationReceipt> {
        self.orchestrator
            .mutate(Collection::Tasks, MutationOp::Delete, Payload::new(), id)
            .await
    }
}
