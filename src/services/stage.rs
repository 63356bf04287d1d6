//! The contract between the orchestrator and its generation steps.

use crate::core::config::Config;
use crate::core::consistency::ProfileSnapshot;
use crate::core::error::StageError;
use crate::core::io::Storage;
use crate::core::state::{CritiqueNotes, DialogueLine, MasterScript, PanelId, SceneId};
use crate::services::illustrator::{create_image_generator, IllustrationStage};
use crate::services::llm::create_llm;
use crate::services::narrative::{ScriptCriticStage, ScriptWriterStage};
use crate::services::visual::{CharacterCriticStage, CharacterDesignerStage, DirectorStage};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One unit of outstanding work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    /// One chunk of the input, scripted on top of what earlier chunks produced.
    Script { index: usize, total: usize, chunk: String },
    Critique,
    Character { name: String },
    /// Review of the whole character lineup.
    CharacterCritique,
    Direction { scene_id: SceneId },
    Panel { panel_id: PanelId },
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnit::Script { index, total, .. } => write!(f, "script chunk {}/{}", index + 1, total),
            WorkUnit::Critique => f.write_str("script critique"),
            WorkUnit::Character { name } => write!(f, "character {}", name),
            WorkUnit::CharacterCritique => f.write_str("character critique"),
            WorkUnit::Direction { scene_id } => write!(f, "scene {}", scene_id),
            WorkUnit::Panel { panel_id } => write!(f, "panel {}", panel_id),
        }
    }
}

/// Read-only view handed to a stage.
pub struct StageContext<'a> {
    pub run_id: &'a str,
    pub script: &'a MasterScript,
    /// Canonical profiles of the characters the unit touches.
    pub profiles: ProfileSnapshot,
    pub style_guide: Option<String>,
    /// Illustration prompt composed by the orchestrator.
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PanelDraft {
    pub description: String,
    #[serde(default)]
    pub dialogue: Vec<DialogueLine>,
    #[serde(default, alias = "character_refs", alias = "characters_present")]
    pub characters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDraft {
    #[serde(default)]
    pub location: String,
    #[serde(default, alias = "narrative_summary")]
    pub summary: String,
    #[serde(default)]
    pub panels: Vec<PanelDraft>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub style_guide: Option<String>,
    #[serde(default)]
    pub scenes: Vec<SceneDraft>,
}

impl ScriptDraft {
    pub fn validate(&self) -> Result<(), StageError> {
        if self.scenes.is_empty() {
            return Err(StageError::permanent("script has no scenes"));
        }
        for (i, scene) in self.scenes.iter().enumerate() {
            if scene.panels.is_empty() {
                return Err(StageError::permanent(format!("scene {} has no panels", i + 1)));
            }
            if scene.panels.iter().any(|p| p.description.trim().is_empty()) {
                return Err(StageError::permanent(format!(
                    "scene {} has a panel without description",
                    i + 1
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileProposal {
    #[serde(default)]
    pub name: String,
    #[serde(alias = "description", alias = "visual_descriptor")]
    pub descriptor: String,
    #[serde(default)]
    pub personality: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelDirection {
    #[serde(alias = "id")]
    pub panel_id: PanelId,
    #[serde(default, alias = "camera")]
    pub camera_angle: Option<String>,
    #[serde(default, alias = "shot")]
    pub shot_type: Option<String>,
    #[serde(default)]
    pub lighting: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub path: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Script(ScriptDraft),
    Critique(CritiqueNotes),
    Profile(ProfileProposal),
    Direction(Vec<PanelDirection>),
    Image(ImageArtifact),
}

impl StageOutput {
    fn variant(&self) -> &'static str {
        match self {
            StageOutput::Script(_) => "script",
            StageOutput::Critique(_) => "critique",
            StageOutput::Profile(_) => "profile",
            StageOutput::Direction(_) => "direction",
            StageOutput::Image(_) => "image",
        }
    }

    fn mismatch(self, expected: &str) -> StageError {
        StageError::permanent(format!(
            "expected {} output, stage returned {}",
            expected,
            self.variant()
        ))
    }

    pub fn into_script(self) -> Result<ScriptDraft, StageError> {
        match self {
            StageOutput::Script(draft) => {
                draft.validate()?;
                Ok(draft)
            }
            other => Err(other.mismatch("script")),
        }
    }

    pub fn into_critique(self) -> Result<CritiqueNotes, StageError> {
        match self {
            StageOutput::Critique(notes) => Ok(notes),
            other => Err(other.mismatch("critique")),
        }
    }

    pub fn into_profile(self) -> Result<ProfileProposal, StageError> {
        match self {
            StageOutput::Profile(p) if p.descriptor.trim().is_empty() => {
                Err(StageError::permanent("profile proposal has an empty descriptor"))
            }
            StageOutput::Profile(p) => Ok(p),
            other => Err(other.mismatch("profile")),
        }
    }

    pub fn into_direction(self) -> Result<Vec<PanelDirection>, StageError> {
        match self {
            StageOutput::Direction(d) => Ok(d),
            other => Err(other.mismatch("direction")),
        }
    }

    pub fn into_image(self) -> Result<ImageArtifact, StageError> {
        match self {
            StageOutput::Image(a) => Ok(a),
            other => Err(other.mismatch("image")),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError>;
}

/// The concrete stages a run is driven with.
#[derive(Clone)]
pub struct StageSet {
    pub script: Arc<dyn Stage>,
    pub critique: Arc<dyn Stage>,
    pub character: Arc<dyn Stage>,
    pub character_critique: Arc<dyn Stage>,
    pub director: Arc<dyn Stage>,
    pub illustrator: Arc<dyn Stage>,
}

pub fn create_stages(config: &Config, storage: Arc<dyn Storage>) -> Result<StageSet> {
    let llm = create_llm(&config.llm)?;
    let generator = create_image_generator(&config.image)?;

    Ok(StageSet {
        script: Arc::new(ScriptWriterStage::new(llm.clone())),
        critique: Arc::new(ScriptCriticStage::new(llm.clone())),
        character: Arc::new(CharacterDesignerStage::new(llm.clone())),
        character_critique: Arc::new(CharacterCriticStage::new(llm.clone())),
        director: Arc::new(DirectorStage::new(llm)),
        illustrator: Arc::new(IllustrationStage::new(
            generator,
            storage,
            &config.output_folder,
            &config.image,
        )),
    })
}
