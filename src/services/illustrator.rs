//! Panel illustration and the image backends behind it.

use crate::core::consistency::compose_prompt;
use crate::core::error::StageError;
use crate::core::io::Storage;
use crate::services::llm::{classify_error, status_error};
use crate::services::stage::{ImageArtifact, Stage, StageContext, StageOutput, WorkUnit};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String, // "mock" or "http"
    /// Used when the script carries no style guide of its own.
    #[serde(default)]
    pub style_preset: Option<String>,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_size")]
    pub width: u32,
    #[serde(default = "default_size")]
    pub height: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    pub http: Option<HttpImageConfig>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            style_preset: None,
            negative_prompt: default_negative_prompt(),
            width: default_size(),
            height: default_size(),
            seed: None,
            http: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpImageConfig {
    /// Endpoint receiving the JSON generation request.
    pub endpoint: String,
    pub api_key: Option<String>,
}

fn default_image_provider() -> String {
    "mock".to_string()
}
fn default_negative_prompt() -> String {
    "text, watermark, blurry, deformed hands".to_string()
}
fn default_size() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub extension: String,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage>;
}

pub fn create_image_generator(config: &ImageConfig) -> Result<Arc<dyn ImageGenerator>> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockImageGenerator)),
        "http" => {
            let cfg = config.http.as_ref().context("Image http config missing")?;
            Ok(Arc::new(HttpImageGenerator::new(&cfg.endpoint, cfg.api_key.as_deref())?))
        }
        _ => Err(anyhow!("Unknown image provider: {}", config.provider)),
    }
}

pub(crate) fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    digest.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Draws a labelled placeholder card. Same request, same bytes.
pub struct MockImageGenerator;

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        debug!("Mock generating image for prompt: {:.50}", request.prompt);
        let caption: String = request.prompt.chars().take(120).collect();
        let svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\">\
            <rect width=\"100%\" height=\"100%\" fill=\"#496d89\"/>\
            <text x=\"10\" y=\"30\" fill=\"#ffff00\">Mock Image {hash}</text>\
            <text x=\"10\" y=\"60\" fill=\"#ffffff\">{caption}</text></svg>",
            w = request.width,
            h = request.height,
            hash = prompt_hash(&request.prompt),
            caption = escape_xml(&caption),
        );
        Ok(GeneratedImage {
            bytes: svg.into_bytes(),
            extension: "svg".to_string(),
        })
    }
}

/// Posts the request as JSON and expects raw image bytes back.
pub struct HttpImageGenerator {
    endpoint: Url,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpImageGenerator {
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("Invalid image endpoint: {}", endpoint))?;
        Ok(Self {
            endpoint,
            api_key: api_key.map(str::to_string),
            client: reqwest::Client::new(),
        })
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("image/jpeg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/svg+xml") => "svg",
        _ => "png",
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        let mut req = self.client.post(self.endpoint.clone()).json(request);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await?;
            return Err(status_error("Image", status, &error_text));
        }

        let extension = extension_for(
            resp.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        )
        .to_string();
        let bytes = resp.bytes().await?.to_vec();
        if bytes.is_empty() {
            return Err(anyhow!("Image backend returned an empty body"));
        }
        Ok(GeneratedImage { bytes, extension })
    }
}

/// Draws one panel and stores it under `<output>/<run_id>/`.
pub struct IllustrationStage {
    generator: Arc<dyn ImageGenerator>,
    storage: Arc<dyn Storage>,
    output_folder: String,
    config: ImageConfig,
}

impl IllustrationStage {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        storage: Arc<dyn Storage>,
        output_folder: &str,
        config: &ImageConfig,
    ) -> Self {
        Self {
            generator,
            storage,
            output_folder: output_folder.to_string(),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Stage for IllustrationStage {
    fn name(&self) -> &'static str {
        "illustrator"
    }

    async fn run(&self, unit: &WorkUnit, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
        let WorkUnit::Panel { panel_id } = unit else {
            return Err(StageError::permanent(format!("illustrator cannot handle {}", unit)));
        };
        let panel = ctx
            .script
            .panel(*panel_id)
            .ok_or_else(|| StageError::permanent(format!("panel {} not in script", panel_id)))?;

        let prompt = match &ctx.prompt {
            Some(p) => p.clone(),
            None => {
                let style = ctx
                    .style_guide
                    .as_deref()
                    .or(self.config.style_preset.as_deref())
                    .unwrap_or("");
                compose_prompt(panel, &ctx.profiles, style)
            }
        };

        let request = ImageRequest {
            prompt: prompt.clone(),
            negative_prompt: self.config.negative_prompt.clone(),
            width: self.config.width,
            height: self.config.height,
            seed: self.config.seed,
        };
        let image = self.generator.generate(&request).await.map_err(classify_error)?;

        let path = Path::new(&self.output_folder)
            .join(ctx.run_id)
            .join(format!(
                "panel_{:03}_{}.{}",
                panel_id,
                prompt_hash(&prompt),
                image.extension
            ));
        let path = path.to_string_lossy().to_string();
        self.storage
            .write(&path, &image.bytes)
            .await
            .map_err(|e| StageError::transient(format!("failed to store {}: {:#}", path, e)))?;

        info!("Panel {} illustrated: {}", panel_id, path);
        Ok(StageOutput::Image(ImageArtifact { path, prompt }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::{CharacterProfile, MasterScript, Panel, Scene};
    use std::collections::BTreeMap;

    fn script() -> MasterScript {
        MasterScript {
            scenes: vec![Scene {
                id: 1,
                location: "Dock".into(),
                panels: vec![Panel {
                    id: 7,
                    description: "Ava on the pier".into(),
                    character_refs: ["Ava".to_string()].into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_generator_is_deterministic() -> Result<()> {
        let request = ImageRequest {
            prompt: "ink wash, <Ava> & Bo".into(),
            negative_prompt: String::new(),
            width: 64,
            height: 32,
            seed: None,
        };
        let a = MockImageGenerator.generate(&request).await?;
        let b = MockImageGenerator.generate(&request).await?;
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.extension, "svg");
        let svg = String::from_utf8(a.bytes)?;
        assert!(svg.contains("&lt;Ava&gt; &amp; Bo"));
        assert!(svg.contains("width=\"64\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_stage_composes_prompt_and_writes_under_run_folder() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("output");
        let config = ImageConfig {
            style_preset: Some("manga".into()),
            ..ImageConfig::default()
        };
        let stage = IllustrationStage::new(
            Arc::new(MockImageGenerator),
            Arc::new(NativeStorage::new()),
            output.to_str().unwrap(),
            &config,
        );

        let script = script();
        let mut profile = CharacterProfile::unversioned("Ava");
        profile.descriptor = "red coat".into();
        profile.profile_version = 1;
        let ctx = StageContext {
            run_id: "abc",
            script: &script,
            profiles: BTreeMap::from([("Ava".to_string(), profile)]),
            style_guide: None,
            prompt: None,
        };

        let artifact = stage
            .run(&WorkUnit::Panel { panel_id: 7 }, &ctx)
            .await
            .unwrap()
            .into_image()
            .unwrap();
        assert_eq!(artifact.prompt, "manga, Ava on the pier, (Ava: red coat)");
        assert!(artifact.path.starts_with(output.join("abc").to_str().unwrap()));
        assert!(artifact.path.ends_with(".svg"));
        assert!(Path::new(&artifact.path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_supplied_prompt_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stage = IllustrationStage::new(
            Arc::new(MockImageGenerator),
            Arc::new(NativeStorage::new()),
            dir.path().to_str().unwrap(),
            &ImageConfig::default(),
        );
        let script = script();
        let ctx = StageContext {
            run_id: "abc",
            script: &script,
            profiles: BTreeMap::new(),
            style_guide: Some("noir".into()),
            prompt: Some("given prompt".into()),
        };
        let artifact = stage
            .run(&WorkUnit::Panel { panel_id: 7 }, &ctx)
            .await
            .unwrap()
            .into_image()
            .unwrap();
        assert_eq!(artifact.prompt, "given prompt");

        let err = stage
            .run(&WorkUnit::Panel { panel_id: 8 }, &ctx)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        Ok(())
    }

    #[test]
    fn test_content_type_to_extension() {
        assert_eq!(extension_for(Some("image/jpeg")), "jpg");
        assert_eq!(extension_for(Some("image/webp; q=1")), "webp");
        assert_eq!(extension_for(None), "png");
    }

    #[test]
    fn test_http_provider_requires_valid_endpoint() {
        let config = ImageConfig {
            provider: "http".into(),
            http: Some(HttpImageConfig {
                endpoint: "not a url".into(),
                api_key: None,
            }),
            ..ImageConfig::default()
        };
        assert!(create_image_generator(&config).is_err());

        let config = ImageConfig {
            provider: "http".into(),
            http: Some(HttpImageConfig {
                endpoint: "http://localhost:7860/generate".into(),
                api_key: None,
            }),
            ..ImageConfig::default()
        };
        assert!(create_image_generator(&config).is_ok());
    }
}
