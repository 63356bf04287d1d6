use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::illustrator::ImageConfig;
use crate::services::llm::LlmConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    /// Auto-approve the plan gate when a draw run reaches it.
    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_words_per_chunk")]
    pub max_words_per_chunk: usize,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_max_save_retries")]
    pub max_save_retries: u32,
    #[serde(default = "default_stage_timeout_seconds")]
    pub stage_timeout_seconds: u64,
    #[serde(default = "default_layout_columns")]
    pub layout_columns: u32,
    #[serde(default = "default_panels_per_page")]
    pub panels_per_page: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_words_per_chunk: default_max_words_per_chunk(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_save_retries: default_max_save_retries(),
            stage_timeout_seconds: default_stage_timeout_seconds(),
            layout_columns: default_layout_columns(),
            panels_per_page: default_panels_per_page(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_max_words_per_chunk() -> usize {
    2000
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}
fn default_max_save_retries() -> u32 {
    5
}
fn default_stage_timeout_seconds() -> u64 {
    600
}
fn default_layout_columns() -> u32 {
    2
}
fn default_panels_per_page() -> u32 {
    6
}

impl Config {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }

    /// Directory holding one JSON document per run.
    pub fn runs_folder(&self) -> std::path::PathBuf {
        Path::new(&self.build_folder).join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let yaml = r#"
llm:
  provider: ollama
  ollama:
    base_url: http://localhost:11434
    model: llama3.1
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.build_folder, "build");
        assert!(!config.unattended);
        assert_eq!(config.pipeline.retry_count, 3);
        assert_eq!(config.pipeline.max_words_per_chunk, 2000);
        assert_eq!(config.pipeline.max_save_retries, 5);
        assert_eq!(config.pipeline.layout_columns, 2);
        assert_eq!(config.pipeline.panels_per_page, 6);
        assert_eq!(config.image.provider, "mock");
        assert_eq!(config.runs_folder(), Path::new("build").join("runs"));
    }

    #[test]
    fn test_save_and_load_round_trip_on_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        let yaml = r#"
unattended: true
llm:
  provider: openai
  openai:
    api_key: sk-test
    model: gpt-4o
pipeline:
  retry_count: 1
  stage_timeout_seconds: 5
"#;
        let config: Config = serde_yaml_ng::from_str(yaml)?;
        config.save(&path)?;

        let loaded = Config::load_from(&path)?;
        assert!(loaded.unattended);
        assert_eq!(loaded.pipeline.retry_count, 1);
        assert_eq!(loaded.pipeline.stage_timeout(), Duration::from_secs(5));
        assert_eq!(loaded.llm.provider, "openai");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = Config::load_from("does/not/exist.yml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
