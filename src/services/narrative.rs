//! Text stages: turning chunks into a script and reviewing it.

use crate::core::error::StageError;
use crate::core::state::{CritiqueNotes, MasterScript, Panel, Scene};
use crate::services::llm::{classify_error, LlmClient};
use crate::services::stage::{ScriptDraft, Stage, StageContext, StageOutput, WorkUnit};
use crate::utils::json::parse_lenient;
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use std::sync::Arc;

const WRITER_SYSTEM_PROMPT: &str = "You are an expert comic book writer. \
Adapt the story text you are given into a comic script. Show, don't tell: \
break the text into scenes and panels, keep dialogue short, and refer to each \
character by one consistent name. Respond with a single valid JSON object only.";

const WRITER_SCHEMA: &str = r#"{
  "title": "Story title",
  "synopsis": "Two or three sentences",
  "style_guide": "Optional art direction, e.g. 'ink wash, muted palette'",
  "scenes": [
    {
      "location": "Harbor at dusk",
      "summary": "What happens in this scene",
      "panels": [
        {
          "description": "What the reader sees",
          "dialogue": [{"speaker": "Ava", "text": "It's late."}],
          "characters": ["Ava"]
        }
      ]
    }
  ]
}"#;

const CRITIC_SYSTEM_PROMPT: &str = "You are a harsh but fair comic book editor. \
Review a comic script for visual feasibility, pacing and dialogue. \
Respond with a single valid JSON object only.";

/// Scripts one chunk at a time. Earlier chunks reach it through the
/// persisted partial script in the context.
pub struct ScriptWriterStage {
    llm: Arc<dyn LlmClient>,
}

impl ScriptWriterStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn chunk_prompt(chunk: &str, index: usize, total: usize, so_far: &MasterScript) -> String {
        let mut prompt = format!(
            "Adapt part {} of {} of the story into comic scenes.\n",
            index + 1,
            total
        );
        let known = so_far.character_names();
        if !known.is_empty() {
            let names: Vec<&str> = known.iter().map(String::as_str).collect();
            prompt.push_str(&format!(
                "Characters introduced so far (reuse these exact names): {}\n",
                names.join(", ")
            ));
        }
        if let Some(last) = so_far.scenes.last() {
            prompt.push_str(&format!(
                "The previous scene was at {}: {}\n",
                last.location, last.summary
            ));
        }
        prompt.push_str(&format!(
            "\nReturn JSON shaped like:\n{}\n\nText:\n{}",
            WRITER_SCHEMA, chunk
        ));
        prompt
    }
}

/// Fold one chunk's script into the run's script.
///
/// The first chunk names the story; later chunks only add scenes, and fill in
/// title, synopsis or style guide if earlier chunks left them blank. Scene and
/// panel ids continue from the highest ones present and never change after.
pub fn merge_script_part(script: &mut MasterScript, part: &ScriptDraft) {
    if script.title.trim().is_empty() {
        script.title = part.title.trim().to_string();
    }
    if script.synopsis.trim().is_empty() {
        script.synopsis = part.synopsis.trim().to_string();
    }
    if script.style_guide.is_none() {
        script.style_guide = part.style_guide.clone().filter(|s| !s.trim().is_empty());
    }

    let mut next_scene = script.scenes.iter().map(|s| s.id).max().unwrap_or(0);
    let mut next_panel = script.panels().map(|p| p.id).max().unwrap_or(0);
    for sd in &part.scenes {
        next_scene += 1;
        let panels = sd
            .panels
            .iter()
            .map(|pd| {
                next_panel += 1;
                Panel {
                    id: next_panel,
                    description: pd.description.trim().to_string(),
                    dialogue: pd.dialogue.clone(),
                    character_refs: pd
                        .characters
                        .iter()
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect(),
                    ..Default::default()
                }
            })
            .collect();
        script.scenes.push(Scene {
            id: next_scene,
            location: sd.location.clone(),
            summary: sd.summary.clone(),
            directed: false,
            panels,
        });
    }
}

#[async_trait]
impl Stage for ScriptWriterStage {
    fn name(&self) -> &'static str {
        "script_writer"
    }

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let WorkUnit::Script { index, total, chunk } = unit else {
            return Err(StageError::permanent(format!("script writer cannot handle {}", unit)));
        };

        let prompt = Self::chunk_prompt(chunk, *index, *total, ctx.script);
        let raw = self
            .llm
            .chat(WRITER_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(classify_error)?;
        let part: ScriptDraft = parse_lenient(&raw)
            .map_err(|e| StageError::permanent(format!("chunk {}: {:#}", index + 1, e)))?;

        info!(
            "Chunk {}/{} drafted with {} scene(s)",
            index + 1,
            total,
            part.scenes.len()
        );
        Ok(StageOutput::Script(part))
    }
}

pub struct ScriptCriticStage {
    llm: Arc<dyn LlmClient>,
}

impl ScriptCriticStage {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[derive(Deserialize)]
pub(crate) struct CritiqueResponse {
    #[serde(default)]
    passed: bool,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    feedback: String,
}

impl CritiqueResponse {
    pub(crate) fn into_notes(self) -> CritiqueNotes {
        CritiqueNotes {
            passed: self.passed,
            score: self.score.clamp(0.0, 10.0),
            feedback: self.feedback,
        }
    }
}

#[async_trait]
impl Stage for ScriptCriticStage {
    fn name(&self) -> &'static str {
        "script_critic"
    }

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        if !matches!(unit, WorkUnit::Critique) {
            return Err(StageError::permanent(format!("script critic cannot handle {}", unit)));
        }

        let script_json = serde_json::to_string_pretty(&ctx.script.scenes)
            .map_err(|e| StageError::permanent(e.to_string()))?;
        let prompt = format!(
            "Review this comic script.\nTitle: {}\nSynopsis: {}\n\nScenes:\n{}\n\n\
            Return JSON: {{\"passed\": true/false, \"score\": 0-10, \"feedback\": \"...\"}}",
            ctx.script.title, ctx.script.synopsis, script_json
        );

        let raw = self
            .llm
            .chat(CRITIC_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(classify_error)?;
        let resp: CritiqueResponse =
            parse_lenient(&raw).map_err(|e| StageError::permanent(format!("{:#}", e)))?;

        Ok(StageOutput::Critique(resp.into_notes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::stage::{PanelDraft, SceneDraft};
    use anyhow::Result;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLlmClient {
        responses: Mutex<Vec<String>>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl MockLlmClient {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no more responses"))
        }
    }

    fn ctx(script: &MasterScript) -> StageContext<'_> {
        StageContext {
            run_id: "run",
            script,
            profiles: BTreeMap::new(),
            style_guide: None,
            prompt: None,
        }
    }

    fn unit(index: usize, total: usize, chunk: &str) -> WorkUnit {
        WorkUnit::Script {
            index,
            total,
            chunk: chunk.to_string(),
        }
    }

    #[tokio::test]
    async fn test_later_chunk_sees_names_and_previous_scene() {
        let llm = Arc::new(MockLlmClient::new(&[
            r#"{"script_title": "Ignored", "story_synopsis": "Ava sails.", "scenes": [{"location_name": "Ship", "panels": [{"visual_description": "Ava at the helm", "characters": ["Ava"]},]}]}"#,
        ]));
        let prompts = llm.prompts.clone();
        let stage = ScriptWriterStage::new(llm);

        let mut script = MasterScript::default();
        let first = ScriptDraft {
            title: "Harbor".into(),
            scenes: vec![SceneDraft {
                location: "Dock".into(),
                summary: "Waiting".into(),
                panels: vec![PanelDraft {
                    description: "Ava waits".into(),
                    characters: vec!["Ava".into()],
                    ..Default::default()
                }],
            }],
            ..Default::default()
        };
        merge_script_part(&mut script, &first);

        let part = stage
            .run(&unit(1, 2, "part two"), &ctx(&script))
            .await
            .unwrap()
            .into_script()
            .unwrap();
        assert_eq!(part.synopsis, "Ava sails.");
        assert_eq!(part.scenes[0].location, "Ship");
        assert_eq!(part.scenes[0].panels[0].description, "Ava at the helm");

        let prompts = prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].starts_with("Adapt part 2 of 2"));
        assert!(prompts[0].contains("reuse these exact names): Ava"));
        assert!(prompts[0].contains("previous scene was at Dock: Waiting"));
        assert!(prompts[0].ends_with("part two"));
    }

    #[tokio::test]
    async fn test_first_chunk_has_no_carryover() {
        let llm = Arc::new(MockLlmClient::new(&[
            r#"```json
{"title": "Harbor", "scenes": [{"location": "Dock", "panels": [{"description": "Ava waits", "characters": ["Ava"]}]}]}
```"#,
        ]));
        let prompts = llm.prompts.clone();
        let stage = ScriptWriterStage::new(llm);
        let script = MasterScript::default();

        let part = stage
            .run(&unit(0, 1, "part one"), &ctx(&script))
            .await
            .unwrap()
            .into_script()
            .unwrap();
        assert_eq!(part.title, "Harbor");
        let prompts = prompts.lock().unwrap();
        assert!(!prompts[0].contains("reuse these exact names"));
        assert!(!prompts[0].contains("previous scene"));
    }

    #[tokio::test]
    async fn test_unparseable_chunk_is_permanent() {
        let llm = Arc::new(MockLlmClient::new(&["I cannot do that."]));
        let stage = ScriptWriterStage::new(llm);
        let script = MasterScript::default();
        let err = stage.run(&unit(2, 3, "text"), &ctx(&script)).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().starts_with("chunk 3"));
    }

    #[tokio::test]
    async fn test_writer_rejects_foreign_units() {
        let stage = ScriptWriterStage::new(Arc::new(MockLlmClient::new(&[])));
        let script = MasterScript::default();
        let err = stage.run(&WorkUnit::Critique, &ctx(&script)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_critique_score_is_clamped() {
        let llm = Arc::new(MockLlmClient::new(&[
            r#"{"passed": false, "score": 14, "feedback": "Panel 2 is cluttered"}"#,
        ]));
        let stage = ScriptCriticStage::new(llm);
        let script = MasterScript {
            title: "Harbor".into(),
            ..Default::default()
        };
        let notes = stage
            .run(&WorkUnit::Critique, &ctx(&script))
            .await
            .unwrap()
            .into_critique()
            .unwrap();
        assert!(!notes.passed);
        assert_eq!(notes.score, 10.0);
        assert_eq!(notes.feedback, "Panel 2 is cluttered");
    }

    #[test]
    fn test_merge_continues_ids_and_keeps_first_style_guide() {
        let first = ScriptDraft {
            title: "A".into(),
            style_guide: Some("ink".into()),
            scenes: vec![SceneDraft {
                location: "Dock".into(),
                panels: vec![
                    PanelDraft {
                        description: " Ava waits ".into(),
                        characters: vec![" Ava ".into(), "".into()],
                        ..Default::default()
                    },
                    PanelDraft {
                        description: "Bo runs".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let second = ScriptDraft {
            title: "B".into(),
            style_guide: Some("watercolor".into()),
            scenes: vec![SceneDraft {
                location: "Ship".into(),
                panels: vec![PanelDraft {
                    description: "The ship leaves".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut script = MasterScript::default();
        merge_script_part(&mut script, &first);
        merge_script_part(&mut script, &second);

        assert_eq!(script.title, "A");
        assert_eq!(script.style_guide.as_deref(), Some("ink"));
        let scene_ids: Vec<_> = script.scenes.iter().map(|s| s.id).collect();
        assert_eq!(scene_ids, vec![1, 2]);
        let panel_ids: Vec<_> = script.panels().map(|p| p.id).collect();
        assert_eq!(panel_ids, vec![1, 2, 3]);

        let p1 = script.panel(1).unwrap();
        assert_eq!(p1.description, "Ava waits");
        assert_eq!(p1.character_refs, BTreeSet::from(["Ava".to_string()]));
        assert_eq!(script.panel(3).unwrap().description, "The ship leaves");
    }
}
