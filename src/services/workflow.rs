//! Drives a run through its stages.
//!
//! Every step follows the same shape: read the stored run, pick the next
//! unit of work from it, call the stage without holding any lock, then merge
//! the result into the run and save it against the version that was read.
//! If someone else saved in between, the merge is replayed on their version.

use crate::core::config::Config;
use crate::core::consistency::{compose_prompt, ConsistencyManager, ConsistencyView, ProfileSnapshot};
use crate::core::error::{PipelineError, StageError, StoreError};
use crate::core::state::{
    ApprovalGate, FailureKind, GenerationStatus, MasterScript, PanelId, Phase, PipelineStage, RunState,
    RunStatus, Scene, SceneId,
};
use crate::core::store::RunStore;
use crate::services::ingest::{chunk_text, normalize_text, run_id_for};
use crate::services::layout::assign_layout;
use crate::services::narrative::merge_script_part;
use crate::services::stage::{PanelDirection, Stage, StageContext, StageOutput, StageSet, WorkUnit};
use crate::utils::retry::RetryPolicy;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Approver recorded when the gate is passed without an operator.
pub const UNATTENDED_APPROVER: &str = "unattended";

struct StageFailure {
    error: StageError,
    attempts: u32,
}

impl StageFailure {
    fn kind(&self) -> FailureKind {
        if self.error.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        }
    }
}

pub struct WorkflowManager {
    config: Config,
    stages: StageSet,
    store: Arc<RunStore>,
    retry: RetryPolicy,
}

impl WorkflowManager {
    pub fn new(config: Config, stages: StageSet, store: Arc<RunStore>) -> Self {
        let retry = RetryPolicy::from_config(&config.pipeline);
        Self {
            config,
            stages,
            store,
            retry,
        }
    }

    pub fn store(&self) -> Arc<RunStore> {
        self.store.clone()
    }

    /// Create the run for `text`, or return the one that already exists.
    pub async fn ingest(&self, text: &str) -> Result<RunState, PipelineError> {
        let normalized = normalize_text(text);
        if normalized.trim().is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let run_id = run_id_for(&normalized);

        match self.store.load(&run_id).await {
            Ok(existing) => {
                info!("Input already ingested as run {}", run_id);
                return Ok(existing);
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let chunks = chunk_text(&normalized, self.config.pipeline.max_words_per_chunk);
        info!("Split input into {} chunk(s)", chunks.len());
        match self.store.save(&RunState::new(run_id, chunks), 0).await {
            Ok(saved) => {
                info!("Created run {}", saved.run_id);
                Ok(saved)
            }
            // Someone ingested the same text at the same moment.
            Err(StoreError::VersionConflict { current, .. }) => Ok(*current),
            Err(e) => Err(e.into()),
        }
    }

    /// Run (or resume) `run_id` until it completes, fails, pauses or reaches
    /// a gate it may not pass in `phase`.
    pub async fn run(&self, run_id: &str, phase: Phase) -> Result<RunState, PipelineError> {
        let mut state = self.store.load(run_id).await?;
        if state.status.is_terminal() {
            info!("Run {} is already {}", run_id, state.status);
            return Ok(state);
        }
        if phase == Phase::Plan && state.stage_cursor >= PipelineStage::AwaitingApproval {
            info!("Run {} is past planning ({}); nothing to do", run_id, state.stage_cursor);
            return Ok(state);
        }

        if state.phase != phase || state.status == RunStatus::Paused {
            state = self
                .commit(state, |s| {
                    if s.status.is_terminal() {
                        return Ok(false);
                    }
                    s.phase = phase;
                    if s.status == RunStatus::Paused {
                        s.status = s.resting_status();
                    }
                    Ok(true)
                })
                .await?;
            info!(
                "Run {} resumed in {} phase at {} ({})",
                run_id, phase, state.stage_cursor, state.status
            );
        }

        let mut progress: Option<ProgressBar> = None;
        loop {
            if state.status == RunStatus::Paused {
                info!("Run {} paused at {}", run_id, state.stage_cursor);
                break;
            }
            if state.status.is_terminal() {
                break;
            }
            if phase == Phase::Plan && state.stage_cursor >= PipelineStage::AwaitingApproval {
                info!("Run {} planned; awaiting approval", run_id);
                break;
            }

            state = match state.stage_cursor {
                PipelineStage::Chunked => self.write_next_chunk(state).await?,
                PipelineStage::Scripted => self.critique_script(state).await?,
                PipelineStage::Critiqued => self.design_next_character(state).await?,
                PipelineStage::CharacterDesigned => self.direct_next_scene(state).await?,
                PipelineStage::Directed => self.open_gate(state).await?,
                PipelineStage::AwaitingApproval => {
                    if !state.gate_approved() && !self.config.unattended {
                        info!("Run {} is waiting for approval before drawing", run_id);
                        break;
                    }
                    self.pass_gate(state).await?
                }
                PipelineStage::Drawing => {
                    let pb = progress.get_or_insert_with(|| drawing_progress(&state.script));
                    let next = state.script.panels().find(|p| p.generation_status == GenerationStatus::Pending);
                    match next.map(|p| p.id) {
                        Some(panel_id) => {
                            let state = self.draw_panel(state, panel_id).await?;
                            pb.inc(1);
                            log_drawing_progress(&state);
                            state
                        }
                        None => self.finish_drawing(state).await?,
                    }
                }
                PipelineStage::Complete => break,
            };
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Drawing pass done");
        }
        if state.status == RunStatus::Complete {
            info!("Run {} complete", run_id);
        }
        Ok(state)
    }

    /// Redraw one panel of a complete run against the current profiles.
    pub async fn regenerate_panel(&self, run_id: &str, panel_id: PanelId) -> Result<RunState, PipelineError> {
        let state = self.load_complete(run_id).await?;
        if state.script.panel(panel_id).is_none() {
            return Err(PipelineError::UnknownPanel {
                run_id: run_id.to_string(),
                panel_id,
            });
        }
        info!("Regenerating panel {} of run {}", panel_id, run_id);
        self.draw_panel(state, panel_id).await
    }

    pub async fn retry_failed_panels(&self, run_id: &str) -> Result<RunState, PipelineError> {
        let state = self.load_complete(run_id).await?;
        let ids = state.panels_with_status(GenerationStatus::Failed);
        info!("Retrying {} failed panel(s) of run {}", ids.len(), run_id);
        self.redraw(state, ids).await
    }

    pub async fn refresh_stale_panels(&self, run_id: &str) -> Result<RunState, PipelineError> {
        let state = self.load_complete(run_id).await?;
        let ids = ConsistencyView::new(&state).stale_panels();
        info!("Refreshing {} stale panel(s) of run {}", ids.len(), run_id);
        self.redraw(state, ids).await
    }

    async fn redraw(&self, mut state: RunState, ids: Vec<PanelId>) -> Result<RunState, PipelineError> {
        for panel_id in ids {
            if state.status != RunStatus::Complete {
                warn!("Run {} left complete state ({}); stopping", state.run_id, state.status);
                break;
            }
            state = self.draw_panel(state, panel_id).await?;
        }
        Ok(state)
    }

    async fn load_complete(&self, run_id: &str) -> Result<RunState, PipelineError> {
        let state = self.store.load(run_id).await?;
        if state.status != RunStatus::Complete {
            return Err(PipelineError::InvalidStatus {
                run_id: run_id.to_string(),
                status: state.status,
                expected: "complete",
            });
        }
        Ok(state)
    }

    // --- planning steps ---

    async fn write_next_chunk(&self, state: RunState) -> Result<RunState, PipelineError> {
        let index = state.scripted_chunks;
        let total = state.chunks.len();
        let Some(chunk) = state.chunks.get(index).cloned() else {
            return self
                .commit(state, |s| {
                    if s.stage_cursor != PipelineStage::Chunked {
                        return Ok(false);
                    }
                    s.advance(PipelineStage::Scripted);
                    Ok(true)
                })
                .await;
        };

        info!("[PROGRESS] Scripting chunk {}/{}", index + 1, total);
        let unit = WorkUnit::Script { index, total, chunk };
        let ctx = plain_context(&state);
        let result = self
            .invoke(self.stages.script.as_ref(), &unit, &ctx, StageOutput::into_script)
            .await;
        drop(ctx);

        match result {
            Ok(part) => {
                self.commit(state, |s| {
                    if s.stage_cursor != PipelineStage::Chunked || s.scripted_chunks != index {
                        return Ok(false);
                    }
                    merge_script_part(&mut s.script, &part);
                    s.scripted_chunks += 1;
                    if s.scripted_chunks >= s.chunks.len() {
                        info!(
                            "Script ready: {} scene(s), {} panel(s)",
                            s.script.scenes.len(),
                            s.script.panel_count()
                        );
                        s.advance(PipelineStage::Scripted);
                    }
                    Ok(true)
                })
                .await
            }
            Err(failure) => self.fail_run(state, "script_writer", &unit, failure).await,
        }
    }

    async fn critique_script(&self, state: RunState) -> Result<RunState, PipelineError> {
        let unit = WorkUnit::Critique;
        let ctx = plain_context(&state);
        let result = self
            .invoke(self.stages.critique.as_ref(), &unit, &ctx, StageOutput::into_critique)
            .await;
        drop(ctx);

        match result {
            Ok(notes) => {
                if notes.passed {
                    info!("Critique passed (score {:.1})", notes.score);
                } else {
                    warn!("Critique flagged the script (score {:.1}): {}", notes.score, notes.feedback);
                }
                self.commit(state, |s| {
                    if s.stage_cursor != PipelineStage::Scripted {
                        return Ok(false);
                    }
                    s.critiques.push(notes.clone());
                    s.advance(PipelineStage::Critiqued);
                    Ok(true)
                })
                .await
            }
            Err(failure) => self.fail_run(state, "script_critic", &unit, failure).await,
        }
    }

    async fn design_next_character(&self, state: RunState) -> Result<RunState, PipelineError> {
        let Some(name) = next_undesigned(&state) else {
            return self.critique_characters(state).await;
        };

        info!("Designing character {}", name);
        let unit = WorkUnit::Character { name: name.clone() };
        let profiles = ConsistencyView::new(&state).snapshot([&name]);
        let seen_version = profiles.get(&name).map_or(0, |p| p.profile_version);
        let ctx = StageContext {
            profiles,
            ..plain_context(&state)
        };
        let result = self
            .invoke(self.stages.character.as_ref(), &unit, &ctx, StageOutput::into_profile)
            .await;
        drop(ctx);

        match result {
            Ok(proposal) => {
                self.commit(state, |s| {
                    if s.stage_cursor != PipelineStage::Critiqued {
                        return Ok(false);
                    }
                    let current = ConsistencyView::new(s).get_profile(&name).profile_version;
                    if current > seen_version {
                        warn!(
                            "Character {} was edited to version {} during design; keeping the edit",
                            name, current
                        );
                        return Ok(false);
                    }
                    ConsistencyManager::new(s).propose_profile(
                        &name,
                        &proposal.descriptor,
                        proposal.personality.as_deref(),
                    );
                    Ok(true)
                })
                .await
            }
            Err(failure) => self.fail_run(state, "character_designer", &unit, failure).await,
        }
    }

    /// Review the finished lineup. The verdict is advisory, and a failed call
    /// is recorded without failing the run.
    async fn critique_characters(&self, state: RunState) -> Result<RunState, PipelineError> {
        let names = state.script.character_names();
        if names.is_empty() {
            return self
                .commit(state, |s| {
                    if s.stage_cursor != PipelineStage::Critiqued {
                        return Ok(false);
                    }
                    s.advance(PipelineStage::CharacterDesigned);
                    Ok(true)
                })
                .await;
        }

        let unit = WorkUnit::CharacterCritique;
        let profiles = ConsistencyView::new(&state).snapshot(&names);
        let ctx = StageContext {
            profiles,
            ..plain_context(&state)
        };
        let result = self
            .invoke(
                self.stages.character_critique.as_ref(),
                &unit,
                &ctx,
                StageOutput::into_critique,
            )
            .await;
        drop(ctx);

        match &result {
            Ok(notes) if notes.passed => info!("Character lineup passed review (score {:.1})", notes.score),
            Ok(notes) => warn!(
                "Character lineup flagged (score {:.1}): {}",
                notes.score, notes.feedback
            ),
            Err(failure) => warn!(
                "Character review failed after {} attempt(s), continuing: {}",
                failure.attempts, failure.error
            ),
        }

        self.commit(state, |s| {
            if s.stage_cursor != PipelineStage::Critiqued {
                return Ok(false);
            }
            match &result {
                Ok(notes) => s.character_critiques.push(notes.clone()),
                Err(failure) => s.record_failure(
                    "character_critic",
                    &unit.to_string(),
                    failure.kind(),
                    failure.error.message(),
                    failure.attempts,
                ),
            }
            s.advance(PipelineStage::CharacterDesigned);
            Ok(true)
        })
        .await
    }

    async fn direct_next_scene(&self, state: RunState) -> Result<RunState, PipelineError> {
        let Some(scene_id) = state.script.scenes.iter().find(|s| !s.directed).map(|s| s.id) else {
            return self
                .commit(state, |s| {
                    if s.stage_cursor != PipelineStage::CharacterDesigned {
                        return Ok(false);
                    }
                    s.advance(PipelineStage::Directed);
                    Ok(true)
                })
                .await;
        };

        info!("Directing scene {}", scene_id);
        let unit = WorkUnit::Direction { scene_id };
        let names = scene_characters(&state.script, scene_id);
        let profiles = ConsistencyView::new(&state).snapshot(&names);
        let ctx = StageContext {
            profiles,
            ..plain_context(&state)
        };
        let result = self
            .invoke(self.stages.director.as_ref(), &unit, &ctx, StageOutput::into_direction)
            .await;
        drop(ctx);

        match result {
            Ok(directions) => {
                self.commit(state, |s| {
                    if s.stage_cursor != PipelineStage::CharacterDesigned {
                        return Ok(false);
                    }
                    let Some(scene) = s.script.scene_mut(scene_id) else {
                        return Ok(false);
                    };
                    apply_direction(scene, &directions);
                    if s.script.scenes.iter().all(|sc| sc.directed) {
                        s.advance(PipelineStage::Directed);
                    }
                    Ok(true)
                })
                .await
            }
            Err(failure) => self.fail_run(state, "director", &unit, failure).await,
        }
    }

    async fn open_gate(&self, state: RunState) -> Result<RunState, PipelineError> {
        let columns = self.config.pipeline.layout_columns;
        let per_page = self.config.pipeline.panels_per_page;
        self.commit(state, |s| {
            if s.stage_cursor != PipelineStage::Directed {
                return Ok(false);
            }
            assign_layout(&mut s.script, columns, per_page);
            if s.current_gate().is_none() {
                s.gates.push(ApprovalGate::open(PipelineStage::Directed));
            }
            s.advance(PipelineStage::AwaitingApproval);
            Ok(true)
        })
        .await
    }

    async fn pass_gate(&self, state: RunState) -> Result<RunState, PipelineError> {
        let unattended = self.config.unattended;
        self.commit(state, |s| {
            if s.stage_cursor != PipelineStage::AwaitingApproval {
                return Ok(false);
            }
            if !s.gate_approved() {
                if !unattended {
                    return Ok(false);
                }
                let Some(gate) = s.current_gate_mut() else {
                    return Err(PipelineError::NoOpenGate {
                        run_id: s.run_id.clone(),
                        cursor: s.stage_cursor,
                    });
                };
                gate.approved = true;
                gate.approved_by = Some(UNATTENDED_APPROVER.to_string());
                gate.approved_at = Some(Utc::now());
                info!("Run {}: gate approved automatically", s.run_id);
            }
            s.advance(PipelineStage::Drawing);
            Ok(true)
        })
        .await
    }

    // --- drawing ---

    async fn finish_drawing(&self, state: RunState) -> Result<RunState, PipelineError> {
        self.commit(state, |s| {
            if s.stage_cursor != PipelineStage::Drawing {
                return Ok(false);
            }
            let failed = s.panels_with_status(GenerationStatus::Failed).len();
            if failed > 0 {
                warn!("Run {} finished with {} failed panel(s)", s.run_id, failed);
            }
            s.advance(PipelineStage::Complete);
            Ok(true)
        })
        .await
    }

    async fn draw_panel(&self, state: RunState, panel_id: PanelId) -> Result<RunState, PipelineError> {
        let Some(panel) = state.script.panel(panel_id).cloned() else {
            return Err(PipelineError::UnknownPanel {
                run_id: state.run_id.clone(),
                panel_id,
            });
        };

        let style = state
            .script
            .style_guide
            .clone()
            .or_else(|| self.config.image.style_preset.clone());
        let (bindings, profiles) = {
            let view = ConsistencyView::new(&state);
            (view.bind_panel(panel_id), view.snapshot(&panel.character_refs))
        };
        let prompt = compose_prompt(&panel, &profiles, style.as_deref().unwrap_or(""));
        debug!("Panel {} bound to {:?}", panel_id, bindings);

        let unit = WorkUnit::Panel { panel_id };
        let ctx = StageContext {
            profiles,
            style_guide: style,
            prompt: Some(prompt.clone()),
            ..plain_context(&state)
        };
        let result = self
            .invoke(self.stages.illustrator.as_ref(), &unit, &ctx, StageOutput::into_image)
            .await;
        drop(ctx);

        match result {
            Ok(artifact) => {
                self.commit(state, |s| {
                    let Some(p) = s.script.panel_mut(panel_id) else {
                        return Ok(false);
                    };
                    p.image_path = Some(artifact.path.clone());
                    p.image_prompt = Some(artifact.prompt.clone());
                    p.generation_status = GenerationStatus::Generated;
                    p.last_error = None;
                    p.attempts += 1;
                    if ConsistencyManager::new(s).record_generated(panel_id, &bindings) {
                        warn!("Panel {} drawn against a superseded profile; marked stale", panel_id);
                    }
                    Ok(true)
                })
                .await
            }
            Err(failure) => {
                error!(
                    "Panel {} failed after {} attempt(s): {}",
                    panel_id, failure.attempts, failure.error
                );
                self.commit(state, |s| {
                    let Some(p) = s.script.panel_mut(panel_id) else {
                        return Ok(false);
                    };
                    // A redraw that fails leaves the existing image in place.
                    let keeps_image =
                        p.generation_status == GenerationStatus::Generated && p.image_path.is_some();
                    if keeps_image {
                        warn!("Panel {} keeps its previous image", panel_id);
                    } else {
                        p.generation_status = GenerationStatus::Failed;
                        p.image_prompt = Some(prompt.clone());
                    }
                    p.last_error = Some(failure.error.message().to_string());
                    p.attempts += failure.attempts;
                    s.record_failure(
                        "illustrator",
                        &unit.to_string(),
                        failure.kind(),
                        failure.error.message(),
                        failure.attempts,
                    );
                    Ok(true)
                })
                .await
            }
        }
    }

    // --- plumbing ---

    /// Call a stage, retrying transient failures with backoff.
    async fn invoke<T>(
        &self,
        stage: &dyn Stage,
        unit: &WorkUnit,
        ctx: &StageContext<'_>,
        extract: fn(StageOutput) -> Result<T, StageError>,
    ) -> Result<T, StageFailure> {
        let timeout = self.config.pipeline.stage_timeout();
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, stage.run(unit, ctx)).await {
                Ok(result) => result.and_then(extract),
                Err(_) => Err(StageError::transient(format!(
                    "{} timed out after {:?}",
                    stage.name(),
                    timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        "{} failed on {} (attempt {}/{}): {}. Retrying in {:?}",
                        stage.name(),
                        unit,
                        attempt,
                        max_attempts,
                        e.message(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(StageFailure {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    /// Apply `merge` and save, replaying it on the stored run after a
    /// version conflict. `merge` returns false when there is nothing to save.
    async fn commit<F>(&self, mut state: RunState, mut merge: F) -> Result<RunState, PipelineError>
    where
        F: FnMut(&mut RunState) -> Result<bool, PipelineError>,
    {
        let mut conflicts = 0;
        loop {
            let expected = state.version;
            if !merge(&mut state)? {
                return Ok(state);
            }
            match self.store.save(&state, expected).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::VersionConflict { current, .. }) => {
                    conflicts += 1;
                    if conflicts > self.config.pipeline.max_save_retries {
                        return Err(PipelineError::ConcurrentEditConflict {
                            run_id: current.run_id.clone(),
                            attempts: conflicts,
                        });
                    }
                    warn!(
                        "Run {} changed underneath (stored version {}); re-applying",
                        current.run_id, current.version
                    );
                    state = *current;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fail_run(
        &self,
        state: RunState,
        stage: &str,
        unit: &WorkUnit,
        failure: StageFailure,
    ) -> Result<RunState, PipelineError> {
        error!(
            "Run {} failed in {} on {} after {} attempt(s): {}",
            state.run_id, stage, unit, failure.attempts, failure.error
        );
        let cursor = state.stage_cursor;
        self.commit(state, |s| {
            if s.status.is_terminal() || s.stage_cursor != cursor {
                return Ok(false);
            }
            s.record_failure(
                stage,
                &unit.to_string(),
                failure.kind(),
                failure.error.message(),
                failure.attempts,
            );
            s.status = RunStatus::Failed;
            Ok(true)
        })
        .await
    }
}

fn plain_context(state: &RunState) -> StageContext<'_> {
    StageContext {
        run_id: &state.run_id,
        script: &state.script,
        profiles: ProfileSnapshot::new(),
        style_guide: state.script.style_guide.clone(),
        prompt: None,
    }
}

fn apply_direction(scene: &mut Scene, directions: &[PanelDirection]) {
    for d in directions {
        let Some(panel) = scene.panels.iter_mut().find(|p| p.id == d.panel_id) else {
            debug!("Ignoring direction for panel {} outside scene {}", d.panel_id, scene.id);
            continue;
        };
        if d.camera_angle.is_some() {
            panel.camera_angle = d.camera_angle.clone();
        }
        if d.shot_type.is_some() {
            panel.shot_type = d.shot_type.clone();
        }
        if d.lighting.is_some() {
            panel.lighting = d.lighting.clone();
        }
    }
    scene.directed = true;
}

fn next_undesigned(state: &RunState) -> Option<String> {
    state.script.character_names().into_iter().find(|name| {
        !state
            .characters
            .profiles
            .get(name)
            .is_some_and(|p| p.is_versioned())
    })
}

fn scene_characters(script: &MasterScript, scene_id: SceneId) -> Vec<String> {
    let mut names: Vec<String> = script
        .scene(scene_id)
        .map(|s| s.panels.iter().flat_map(|p| p.character_refs.iter().cloned()).collect())
        .unwrap_or_default();
    names.sort();
    names.dedup();
    names
}

fn drawing_progress(script: &MasterScript) -> ProgressBar {
    let total = script.panel_count() as u64;
    let done = script
        .panels()
        .filter(|p| p.generation_status != GenerationStatus::Pending)
        .count() as u64;
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} panels ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_position(done);
    pb
}

fn log_drawing_progress(state: &RunState) {
    let total = state.script.panel_count().max(1);
    let done = state
        .script
        .panels()
        .filter(|p| p.generation_status != GenerationStatus::Pending)
        .count();
    info!(
        "[PROGRESS] {}% - Drawing panel {}/{}",
        done * 100 / total,
        done,
        total
    );
}
