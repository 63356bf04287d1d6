use crate::core::config::Config;
use crate::core::consistency::ConsistencyView;
use crate::core::state::{GenerationStatus, RunState};
use crate::services::llm::{GeminiConfig, OllamaConfig, OpenAIConfig};
use anyhow::Result;
use inquire::{Confirm, Select, Text};
use std::path::Path;

/// Ask for the LLM settings the config is missing, then save it.
pub fn run_setup(config: &mut Config, path: &Path) -> Result<()> {
    let llm = &mut config.llm;
    let needs_setup = match llm.provider.as_str() {
        "gemini" => llm.gemini.is_none(),
        "ollama" => llm.ollama.is_none(),
        "openai" => llm.openai.is_none(),
        _ => true,
    };
    if !needs_setup {
        return Ok(());
    }

    println!("No settings found for LLM provider {:?}.", llm.provider);
    let providers = vec!["gemini", "ollama", "openai"];
    let provider = Select::new("Select LLM provider:", providers).prompt()?;
    llm.provider = provider.to_string();

    match provider {
        "gemini" => {
            let api_key = Text::new("Gemini API key:").prompt()?;
            let model = Text::new("Model:").with_default("gemini-2.5-flash").prompt()?;
            llm.gemini = Some(GeminiConfig { api_key, model });
        }
        "ollama" => {
            let base_url = Text::new("Ollama URL:")
                .with_default("http://localhost:11434")
                .prompt()?;
            let model = Text::new("Model:").with_default("llama3").prompt()?;
            llm.ollama = Some(OllamaConfig { base_url, model });
        }
        _ => {
            let api_key = Text::new("API key:").prompt()?;
            let model = Text::new("Model:").with_default("gpt-4o-mini").prompt()?;
            let base_url = Text::new("Base URL (empty for api.openai.com):").prompt()?;
            llm.openai = Some(OpenAIConfig {
                api_key,
                model,
                base_url: Some(base_url).filter(|u| !u.trim().is_empty()),
            });
        }
    }

    config.save(path)?;
    println!("Configuration saved.");
    Ok(())
}

/// Show the plan and ask whether drawing may start.
pub fn confirm_approval(state: &RunState) -> Result<bool> {
    println!("\n{}", state.script.title);
    for scene in &state.script.scenes {
        println!("Scene {} - {}", scene.id, scene.location);
        for panel in &scene.panels {
            println!("  [{}] {}", panel.id, panel.description);
        }
    }
    for profile in state.characters.profiles.values() {
        println!("{} (v{}): {}", profile.name, profile.profile_version, profile.descriptor);
    }
    if let Some(review) = state.character_critiques.last().filter(|r| !r.passed) {
        println!("Art director ({:.1}/10): {}", review.score, review.feedback);
    }

    let approved = Confirm::new("Approve this plan and start drawing?")
        .with_default(false)
        .prompt()?;
    Ok(approved)
}

pub fn select_run(run_ids: Vec<String>) -> Result<String> {
    Ok(Select::new("Select a run:", run_ids).prompt()?)
}

pub fn summary_lines(state: &RunState) -> Vec<String> {
    let mut lines = vec![
        format!("Run:      {}", state.run_id),
        format!(
            "Stage:    {} ({}, {} phase)",
            state.stage_cursor, state.status, state.phase
        ),
        format!("Version:  {}", state.version),
    ];
    if !state.script.title.is_empty() {
        lines.push(format!("Title:    {}", state.script.title));
    }

    let total = state.script.panel_count();
    if total > 0 {
        let generated = state.panels_with_status(GenerationStatus::Generated).len();
        let failed = state.panels_with_status(GenerationStatus::Failed);
        lines.push(format!(
            "Panels:   {}/{} drawn, {} failed",
            generated,
            total,
            failed.len()
        ));
        if !failed.is_empty() {
            lines.push(format!("Failed:   {:?}", failed));
        }
        if let Some(pages) = state.script.panels().filter_map(|p| p.layout).map(|l| l.page).max() {
            lines.push(format!("Pages:    {}", pages));
        }
    }

    let stale = ConsistencyView::new(state).stale_panels();
    if !stale.is_empty() {
        lines.push(format!("Stale:    {:?}", stale));
    }
    if let Some(last) = state.failures.last() {
        lines.push(format!(
            "Last failure: {} on {} ({:?}, {} attempt(s)): {}",
            last.stage, last.unit, last.kind, last.attempts, last.message
        ));
    }
    lines
}

pub fn print_summary(state: &RunState) {
    for line in summary_lines(state) {
        println!("{}", line);
    }
}
