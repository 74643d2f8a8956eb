//! Base model components from the HuggingFace Hub
//!
//! Every epoch pipeline is built from the same base components. They are
//! resolved once per worker process; hf-hub keeps them in its local cache so
//! later runs don't download them again.
//!
//! - transformer: FLUX.1-dev full precision (~24GB)
//! - VAE: FLUX.1-dev autoencoder (~350MB)
//! - T5-XXL encoder + config (~9GB) and its tokenizer
//! - CLIP ViT-L text encoder + tokenizer (~1.7GB)

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;
use tracing::info;

/// A single file of a hub repository
#[derive(Debug, Clone, Copy)]
pub struct ModelComponent {
    pub repo: &'static str,
    pub revision: Option<&'static str>,
    pub file: &'static str,
}

impl ModelComponent {
    const fn new(repo: &'static str, file: &'static str) -> Self {
        Self {
            repo,
            revision: None,
            file,
        }
    }

    const fn at_revision(repo: &'static str, revision: &'static str, file: &'static str) -> Self {
        Self {
            repo,
            revision: Some(revision),
            file,
        }
    }
}

pub const TRANSFORMER: ModelComponent =
    ModelComponent::new("black-forest-labs/FLUX.1-dev", "flux1-dev.safetensors");
pub const VAE: ModelComponent = ModelComponent::new("black-forest-labs/FLUX.1-dev", "ae.safetensors");
pub const T5_MODEL: ModelComponent =
    ModelComponent::at_revision("google/t5-v1_1-xxl", "refs/pr/2", "model.safetensors");
pub const T5_CONFIG: ModelComponent =
    ModelComponent::at_revision("google/t5-v1_1-xxl", "refs/pr/2", "config.json");
pub const T5_TOKENIZER: ModelComponent =
    ModelComponent::new("lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json");
pub const CLIP_MODEL: ModelComponent =
    ModelComponent::new("openai/clip-vit-large-patch14", "model.safetensors");
pub const CLIP_TOKENIZER: ModelComponent =
    ModelComponent::new("openai/clip-vit-large-patch14", "tokenizer.json");

/// Fetches base components through the hub cache
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    /// Create a new downloader
    ///
    /// Uses the HF_TOKEN environment variable if set (FLUX.1-dev is gated)
    pub fn new() -> Result<Self> {
        let api = ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false)
            .build()
            .context("Failed to create HuggingFace API client")?;
        Ok(Self { api })
    }

    /// Resolve all base components, downloading whatever isn't cached yet
    pub async fn download_all(&self) -> Result<ModelPaths> {
        info!("Resolving base model components");

        let (transformer, vae, t5_model, t5_config, t5_tokenizer, clip_model, clip_tokenizer) = tokio::try_join!(
            self.fetch(TRANSFORMER),
            self.fetch(VAE),
            self.fetch(T5_MODEL),
            self.fetch(T5_CONFIG),
            self.fetch(T5_TOKENIZER),
            self.fetch(CLIP_MODEL),
            self.fetch(CLIP_TOKENIZER),
        )?;

        info!("✓ Base model components ready");

        Ok(ModelPaths {
            transformer,
            vae,
            t5_model,
            t5_config,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
        })
    }

    /// Fetch one component (cache hit or download)
    pub async fn fetch(&self, component: ModelComponent) -> Result<PathBuf> {
        let repo = match component.revision {
            Some(revision) => Repo::with_revision(
                component.repo.to_string(),
                RepoType::Model,
                revision.to_string(),
            ),
            None => Repo::model(component.repo.to_string()),
        };

        let path = self
            .api
            .repo(repo)
            .get(component.file)
            .await
            .with_context(|| format!("Failed to download {}/{}", component.repo, component.file))?;

        info!("  ✓ {}/{}: {}", component.repo, component.file, path.display());
        Ok(path)
    }
}

/// Local paths of the resolved base components
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub transformer: PathBuf,
    pub vae: PathBuf,
    pub t5_model: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_model: PathBuf,
    pub clip_tokenizer: PathBuf,
}
