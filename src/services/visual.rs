//! Visual planning stages: character design and cinematic direction.

use crate::core::error::StageError;
use crate::services::llm::{classify_error, LlmClient};
use crate::services::narrative::CritiqueResponse;
use crate::services::stage::{PanelDirection, ProfileProposal, Stage, StageContext, StageOutput, WorkUnit};
use crate::utils::json::parse_lenient;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::sync::Arc;

/// Panels quoted to the designer as evidence for one character.
const MAX_APPEARANCES: usize = 12;

const DESIGNER_SYSTEM_PROMPT: &str = "You are a master character designer for comics. \
Write the canonical visual profile an illustrator will reuse for every panel: \
physical traits, default outfit, and how personality shows in posture and expression. \
Respond with a single valid JSON object only.";

const ART_DIRECTOR_SYSTEM_PROMPT: &str = "You are the art director of a comic. \
Review a character lineup for visual distinctiveness, enough physical detail to \
draw each character the same way every time, and whether the looks match the \
personalities. Respond with a single valid JSON object only.";

const DIRECTOR_SYSTEM_PROMPT: &str = "You are a film director and cinematographer. \
For each panel suggest a camera angle (low angle, bird's eye, dutch angle...), \
a shot type (close-up, medium shot, long shot...) and lighting. \
Respond with a single valid JSON object only.";

pub struct CharacterDesignerStage {
    llm: Arc<dyn LlmClient>,
}

impl CharacterDesignerStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Stage for CharacterDesignerStage {
    fn name(&self) -> &'static str {
        "character_designer"
    }

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let WorkUnit::Character { name } = unit else {
            return Err(StageError::permanent(format!("character designer cannot handle {}", unit)));
        };

        let appearances: Vec<String> = ctx
            .script
            .panels()
            .filter(|p| p.character_refs.contains(name))
            .take(MAX_APPEARANCES)
            .map(|p| {
                let lines: Vec<String> = p
                    .dialogue
                    .iter()
                    .filter(|d| &d.speaker == name)
                    .map(|d| format!("\"{}\"", d.text))
                    .collect();
                if lines.is_empty() {
                    format!("- {}", p.description)
                } else {
                    format!("- {} (says {})", p.description, lines.join(" "))
                }
            })
            .collect();

        let mut prompt = format!(
            "Design the character \"{}\" for the comic \"{}\".\nSynopsis: {}\n",
            name, ctx.script.title, ctx.script.synopsis
        );
        if let Some(style) = &ctx.style_guide {
            prompt.push_str(&format!("Art direction: {}\n", style));
        }
        if let Some(current) = ctx.profiles.get(name).filter(|p| p.is_versioned()) {
            prompt.push_str(&format!("Current profile to refine: {}\n", current.descriptor));
        }
        prompt.push_str(&format!(
            "\nPanels featuring {}:\n{}\n\n\
            Return JSON: {{\"name\": \"{}\", \"descriptor\": \"...\", \"personality\": \"...\"}}",
            name,
            appearances.join("\n"),
            name
        ));

        let raw = self
            .llm
            .chat(DESIGNER_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(classify_error)?;
        let mut proposal: ProfileProposal =
            parse_lenient(&raw).map_err(|e| StageError::permanent(format!("{:#}", e)))?;

        if proposal.name != *name {
            debug!("Designer answered as {:?}, keeping {}", proposal.name, name);
            proposal.name = name.clone();
        }
        Ok(StageOutput::Profile(proposal))
    }
}

/// Reviews the designed lineup as a whole. Advisory: the verdict is recorded,
/// never enforced.
pub struct CharacterCriticStage {
    llm: Arc<dyn LlmClient>,
}

impl CharacterCriticStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Stage for CharacterCriticStage {
    fn name(&self) -> &'static str {
        "character_critic"
    }

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        if !matches!(unit, WorkUnit::CharacterCritique) {
            return Err(StageError::permanent(format!("character critic cannot handle {}", unit)));
        }
        if ctx.profiles.is_empty() {
            return Err(StageError::permanent("no characters to review"));
        }

        let lineup: Vec<String> = ctx
            .profiles
            .values()
            .map(|p| match p.personality.as_deref() {
                Some(personality) if !personality.is_empty() => {
                    format!("- {}: {} (Personality: {})", p.name, p.descriptor, personality)
                }
                _ => format!("- {}: {}", p.name, p.descriptor),
            })
            .collect();
        let prompt = format!(
            "Review the character lineup of \"{}\":\n{}\n\n\
            Are these descriptions robust enough for consistent generation?\n\
            Return JSON: {{\"passed\": true/false, \"score\": 0-10, \"feedback\": \"...\"}}",
            ctx.script.title,
            lineup.join("\n")
        );

        let raw = self
            .llm
            .chat(ART_DIRECTOR_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(classify_error)?;
        let resp: CritiqueResponse =
            parse_lenient(&raw).map_err(|e| StageError::permanent(format!("{:#}", e)))?;
        Ok(StageOutput::Critique(resp.into_notes()))
    }
}

pub struct DirectorStage {
    llm: Arc<dyn LlmClient>,
}

impl DirectorStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[derive(Deserialize)]
struct DirectionResponse {
    #[serde(default)]
    panels: Vec<PanelDirection>,
}

#[async_trait]
impl Stage for DirectorStage {
    fn name(&self) -> &'static str {
        "director"
    }

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let WorkUnit::Direction { scene_id } = unit else {
            return Err(StageError::permanent(format!("director cannot handle {}", unit)));
        };
        let scene = ctx
            .script
            .scene(*scene_id)
            .ok_or_else(|| StageError::permanent(format!("scene {} not in script", scene_id)))?;

        let panels: Vec<String> = scene
            .panels
            .iter()
            .map(|p| format!("Panel {}: {}", p.id, p.description))
            .collect();
        let prompt = format!(
            "Add cinematic direction to this scene.\nScene: {}. Summary: {}\n\nPanels:\n{}\n\n\
            Return JSON: {{\"panels\": [{{\"id\": <panel id>, \"camera_angle\": \"...\", \
            \"shot_type\": \"...\", \"lighting\": \"...\"}}]}}",
            scene.location,
            scene.summary,
            panels.join("\n")
        );

        let raw = self
            .llm
            .chat(DIRECTOR_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(classify_error)?;
        let resp: DirectionResponse =
            parse_lenient(&raw).map_err(|e| StageError::permanent(format!("{:#}", e)))?;

        if resp.panels.len() != scene.panels.len() {
            warn!(
                "Director returned {} panel(s) for scene {}, expected {}",
                resp.panels.len(),
                scene_id,
                scene.panels.len()
            );
        }
        Ok(StageOutput::Direction(resp.panels))
    }
}
