//! Operator-facing writes: approving the gate, pausing and discarding runs.
//!
//! Unlike the orchestrator, these never re-merge on a version conflict. The
//! operator decided against a specific version, so a conflict goes back to
//! them with the current state attached.

use crate::core::consistency::ConsistencyManager;
use crate::core::error::PipelineError;
use crate::core::state::{GateEdits, PipelineStage, RunState, RunStatus};
use crate::core::store::RunStore;
use chrono::Utc;
use log::info;
use std::sync::Arc;

pub struct Review {
    store: Arc<RunStore>,
}

impl Review {
    pub fn new(store: Arc<RunStore>) -> Self {
        Self { store }
    }

    pub async fn state(&self, run_id: &str) -> Result<RunState, PipelineError> {
        Ok(self.store.load(run_id).await?)
    }

    /// Approve the open gate, applying `edits` in the same save.
    pub async fn approve(
        &self,
        run_id: &str,
        expected_version: u64,
        edits: Option<GateEdits>,
        approver: &str,
    ) -> Result<RunState, PipelineError> {
        let mut state = self.store.load(run_id).await?;
        if state.status.is_terminal() {
            return Err(PipelineError::InvalidStatus {
                run_id: run_id.to_string(),
                status: state.status,
                expected: "awaiting approval",
            });
        }
        if state.stage_cursor != PipelineStage::AwaitingApproval
            || state.current_gate().map_or(true, |g| g.approved)
        {
            return Err(PipelineError::NoOpenGate {
                run_id: run_id.to_string(),
                cursor: state.stage_cursor,
            });
        }

        let edits = edits.filter(|e| !e.is_empty());
        if let Some(edits) = &edits {
            for (panel_id, description) in &edits.panel_descriptions {
                let Some(panel) = state.script.panel_mut(*panel_id) else {
                    return Err(PipelineError::UnknownPanel {
                        run_id: run_id.to_string(),
                        panel_id: *panel_id,
                    });
                };
                panel.description = description.trim().to_string();
            }
            let mut cm = ConsistencyManager::new(&mut state);
            for (name, descriptor) in &edits.character_descriptors {
                let outcome = cm.propose_profile(name, descriptor.trim(), None);
                info!("Operator revised {} to profile version {}", name, outcome.version());
            }
        }

        if let Some(gate) = state.current_gate_mut() {
            gate.approved = true;
            gate.approved_by = Some(approver.to_string());
            gate.approved_at = Some(Utc::now());
            gate.edits = edits;
        }
        if state.status != RunStatus::Paused {
            state.status = state.resting_status();
        }

        let saved = self.store.save(&state, expected_version).await?;
        info!("Run {} approved by {} (version {})", run_id, approver, saved.version);
        Ok(saved)
    }

    /// Ask a run to stop at its next step. In-flight work still lands.
    pub async fn pause(&self, run_id: &str, expected_version: u64) -> Result<RunState, PipelineError> {
        let mut state = self.store.load(run_id).await?;
        if state.status.is_terminal() {
            return Err(PipelineError::InvalidStatus {
                run_id: run_id.to_string(),
                status: state.status,
                expected: "running or awaiting approval",
            });
        }
        if state.status == RunStatus::Paused {
            return Ok(state);
        }
        state.status = RunStatus::Paused;
        let saved = self.store.save(&state, expected_version).await?;
        info!("Run {} paused at {}", run_id, saved.stage_cursor);
        Ok(saved)
    }

    pub async fn discard(&self, run_id: &str, expected_version: u64) -> Result<(), PipelineError> {
        self.store.discard(run_id, expected_version).await?;
        info!("Run {} discarded", run_id);
        Ok(())
    }
}
