use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub type PanelId = u32;
pub type SceneId = u32;

/// Last stage that completed successfully for a run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Chunked,
    Scripted,
    Critiqued,
    CharacterDesigned,
    Directed,
    AwaitingApproval,
    Drawing,
    Complete,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Chunked => "chunked",
            PipelineStage::Scripted => "scripted",
            PipelineStage::Critiqued => "critiqued",
            PipelineStage::CharacterDesigned => "character_designed",
            PipelineStage::Directed => "directed",
            PipelineStage::AwaitingApproval => "awaiting_approval",
            PipelineStage::Drawing => "drawing",
            PipelineStage::Complete => "complete",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Plan,
    Draw,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Plan => f.write_str("plan"),
            Phase::Draw => f.write_str("draw"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingApproval,
    Paused,
    Failed,
    Complete,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Complete)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Paused => "paused",
            RunStatus::Failed => "failed",
            RunStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Pending,
    Generated,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DialogueLine {
    #[serde(alias = "character")]
    pub speaker: String,
    #[serde(alias = "line")]
    pub text: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Panel {
    pub id: PanelId,
    pub description: String,
    #[serde(default)]
    pub dialogue: Vec<DialogueLine>,
    #[serde(default)]
    pub character_refs: BTreeSet<String>,
    #[serde(default)]
    pub camera_angle: Option<String>,
    #[serde(default)]
    pub shot_type: Option<String>,
    #[serde(default)]
    pub lighting: Option<String>,
    #[serde(default)]
    pub image_prompt: Option<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub generation_status: GenerationStatus,
    /// Profile version of each character this panel was drawn against.
    #[serde(default)]
    pub profile_bindings: BTreeMap<String, u32>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    /// Slot on the page, assigned when the plan is complete.
    #[serde(default)]
    pub layout: Option<PanelLayout>,
}

/// Grid slot of a panel on its page. `x`, `y`, `width` and `height` give the
/// frame as fractions of the page.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PanelLayout {
    pub page: u32,
    pub row: u32,
    pub column: u32,
    pub rows: u32,
    pub columns: u32,
}

impl PanelLayout {
    pub fn x(&self) -> f32 {
        self.column as f32 / self.columns.max(1) as f32
    }

    pub fn y(&self) -> f32 {
        self.row as f32 / self.rows.max(1) as f32
    }

    pub fn width(&self) -> f32 {
        1.0 / self.columns.max(1) as f32
    }

    pub fn height(&self) -> f32 {
        1.0 / self.rows.max(1) as f32
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Scene {
    pub id: SceneId,
    pub location: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub directed: bool,
    #[serde(default)]
    pub panels: Vec<Panel>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterScript {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub style_guide: Option<String>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

impl MasterScript {
    pub fn panels(&self) -> impl Iterator<Item = &Panel> {
        self.scenes.iter().flat_map(|s| s.panels.iter())
    }

    pub fn panels_mut(&mut self) -> impl Iterator<Item = &mut Panel> {
        self.scenes.iter_mut().flat_map(|s| s.panels.iter_mut())
    }

    pub fn panel(&self, id: PanelId) -> Option<&Panel> {
        self.panels().find(|p| p.id == id)
    }

    pub fn panel_mut(&mut self, id: PanelId) -> Option<&mut Panel> {
        self.panels_mut().find(|p| p.id == id)
    }

    pub fn scene(&self, id: SceneId) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }

    pub fn scene_mut(&mut self, id: SceneId) -> Option<&mut Scene> {
        self.scenes.iter_mut().find(|s| s.id == id)
    }

    /// Every character name referenced by any panel, sorted.
    pub fn character_names(&self) -> BTreeSet<String> {
        self.panels()
            .flat_map(|p| p.character_refs.iter().cloned())
            .collect()
    }

    pub fn panel_count(&self) -> usize {
        self.panels().count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CharacterProfile {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub personality: Option<String>,
    /// 0 means the character has no canonical profile yet.
    pub profile_version: u32,
    /// Panels generated against each profile version.
    #[serde(default)]
    pub generated_panels: BTreeMap<u32, BTreeSet<PanelId>>,
}

impl CharacterProfile {
    pub fn unversioned(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_versioned(&self) -> bool {
        self.profile_version > 0
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CharacterRegistry {
    #[serde(default)]
    pub profiles: BTreeMap<String, CharacterProfile>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CritiqueNotes {
    pub passed: bool,
    pub score: f32,
    pub feedback: String,
}

/// Operator edits applied atomically with a gate approval.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GateEdits {
    #[serde(default)]
    pub panel_descriptions: BTreeMap<PanelId, String>,
    #[serde(default)]
    pub character_descriptors: BTreeMap<String, String>,
}

impl GateEdits {
    pub fn is_empty(&self) -> bool {
        self.panel_descriptions.is_empty() && self.character_descriptors.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ApprovalGate {
    pub after: PipelineStage,
    pub approved: bool,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edits: Option<GateEdits>,
}

impl ApprovalGate {
    pub fn open(after: PipelineStage) -> Self {
        Self {
            after,
            approved: false,
            approved_by: None,
            approved_at: None,
            edits: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    pub stage: String,
    pub unit: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunState {
    pub run_id: String,
    pub version: u64,
    pub stage_cursor: PipelineStage,
    pub phase: Phase,
    pub status: RunStatus,
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Chunks already folded into `script`, in order.
    #[serde(default)]
    pub scripted_chunks: usize,
    #[serde(default)]
    pub script: MasterScript,
    #[serde(default)]
    pub characters: CharacterRegistry,
    #[serde(default)]
    pub critiques: Vec<CritiqueNotes>,
    #[serde(default)]
    pub character_critiques: Vec<CritiqueNotes>,
    #[serde(default)]
    pub gates: Vec<ApprovalGate>,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, chunks: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            version: 0,
            stage_cursor: PipelineStage::Chunked,
            phase: Phase::Plan,
            status: RunStatus::Running,
            chunks,
            scripted_chunks: 0,
            script: MasterScript::default(),
            characters: CharacterRegistry::default(),
            critiques: Vec::new(),
            character_critiques: Vec::new(),
            gates: Vec::new(),
            failures: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The gate guarding the current cursor, if one was opened.
    pub fn current_gate(&self) -> Option<&ApprovalGate> {
        self.gates.iter().rev().find(|g| g.after == PipelineStage::Directed)
    }

    pub fn current_gate_mut(&mut self) -> Option<&mut ApprovalGate> {
        self.gates
            .iter_mut()
            .rev()
            .find(|g| g.after == PipelineStage::Directed)
    }

    pub fn gate_approved(&self) -> bool {
        self.current_gate().is_some_and(|g| g.approved)
    }

    /// Status a run settles into when it is not paused or failed.
    pub fn resting_status(&self) -> RunStatus {
        match self.stage_cursor {
            PipelineStage::AwaitingApproval if !self.gate_approved() => RunStatus::AwaitingApproval,
            PipelineStage::Complete => RunStatus::Complete,
            _ => RunStatus::Running,
        }
    }

    /// Move the cursor forward, keeping an operator pause in place.
    pub fn advance(&mut self, stage: PipelineStage) {
        self.stage_cursor = stage;
        if self.status != RunStatus::Paused && self.status != RunStatus::Failed {
            self.status = self.resting_status();
        }
    }

    pub fn record_failure(
        &mut self,
        stage: &str,
        unit: &str,
        kind: FailureKind,
        message: &str,
        attempts: u32,
    ) {
        self.failures.push(FailureRecord {
            stage: stage.to_string(),
            unit: unit.to_string(),
            kind,
            message: message.to_string(),
            attempts,
            at: Utc::now(),
        });
    }

    pub fn panels_with_status(&self, status: GenerationStatus) -> Vec<PanelId> {
        self.script
            .panels()
            .filter(|p| p.generation_status == status)
            .map(|p| p.id)
            .collect()
    }
}
