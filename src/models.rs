//! Model components of the generation pipeline
//!
//! - T5-XXL text encoder (main text conditioning)
//! - CLIP ViT-L text encoder (pooled vector conditioning)
//! - FLUX autoencoder (control image -> latents, latents -> RGB)
//! - FLUX transformer, with an epoch adapter fused into its weights

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{clip, flux, t5};
use image::{DynamicImage, RgbImage};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::adapter::EpochAdapter;

/// FLUX uses 256 T5 tokens
const T5_MAX_LENGTH: usize = 256;

/// T5 text encoder
pub struct T5TextEncoder {
    model: t5::T5EncoderModel,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
}

impl T5TextEncoder {
    /// Load the T5 encoder from safetensors + config.json + tokenizer.json
    pub fn load(
        model_path: &Path,
        config_path: &Path,
        tokenizer_path: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        info!(path = %model_path.display(), "Loading T5-XXL encoder");

        let config = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read T5 config: {}", config_path.display()))?;
        let config: t5::Config = serde_json::from_str(&config)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load T5 tokenizer from {:?}: {}", tokenizer_path, e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };
        let model = t5::T5EncoderModel::load(vb, &config)?;

        info!("✓ T5 encoder loaded");

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
            dtype,
        })
    }

    /// Encode a prompt to T5 embeddings [1, 256, 4096]
    pub fn encode(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec();
        tokens.resize(T5_MAX_LENGTH, 0);

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?.to_dtype(self.dtype)?)
    }
}

/// CLIP text encoder
pub struct ClipTextEncoder {
    model: clip::text_model::ClipTextTransformer,
    tokenizer: Tokenizer,
    max_length: usize,
    device: Device,
    dtype: DType,
}

impl ClipTextEncoder {
    /// Load CLIP ViT-L from model.safetensors + tokenizer.json
    pub fn load(model_path: &Path, tokenizer_path: &Path, device: &Device, dtype: DType) -> Result<Self> {
        info!(path = %model_path.display(), "Loading CLIP encoder");

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load CLIP tokenizer from {:?}: {}", tokenizer_path, e))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };

        let config = clip::text_model::ClipTextConfig {
            vocab_size: 49408,
            embed_dim: 768,
            activation: clip::text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            projection_dim: 768,
        };
        let encoder = Self::from_parts(vb, &config, tokenizer, device, dtype)?;

        info!("✓ CLIP encoder loaded");
        Ok(encoder)
    }

    pub fn from_parts(
        vb: VarBuilder,
        config: &clip::text_model::ClipTextConfig,
        tokenizer: Tokenizer,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let model = clip::text_model::ClipTextTransformer::new(vb.pp("text_model"), config)?;
        Ok(Self {
            model,
            tokenizer,
            max_length: config.max_position_embeddings,
            device: device.clone(),
            dtype,
        })
    }

    /// Encode a prompt to the pooled CLIP vector [1, 768]
    ///
    /// Tokens past CLIP's position limit are dropped.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_length {
            debug!(tokens = tokens.len(), kept = self.max_length, "Truncating CLIP prompt");
            tokens.truncate(self.max_length);
        }

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?.to_dtype(self.dtype)?)
    }
}

/// FLUX autoencoder
pub struct Autoencoder {
    model: flux::autoencoder::AutoEncoder,
    device: Device,
    dtype: DType,
}

impl Autoencoder {
    /// Load from ae.safetensors
    pub fn load(model_path: &Path, device: &Device, dtype: DType) -> Result<Self> {
        info!(path = %model_path.display(), "Loading VAE");

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };
        let config = flux::autoencoder::Config::dev();
        let model = flux::autoencoder::AutoEncoder::new(&config, vb)?;

        info!("✓ VAE loaded");

        Ok(Self {
            model,
            device: device.clone(),
            dtype,
        })
    }

    /// Encode an RGB image to latents [1, 16, H/8, W/8]
    pub fn encode_image(&self, image: &DynamicImage) -> Result<Tensor> {
        let pixels = image_to_tensor(image, &self.device)?.to_dtype(self.dtype)?;
        let latents = self.model.encode(&pixels)?;
        debug!(shape = ?latents.dims(), "Control latents");
        Ok(latents)
    }

    /// Decode latents back to an RGB image
    pub fn decode_image(&self, latents: &Tensor) -> Result<DynamicImage> {
        let decoded = self.model.decode(&latents.to_dtype(self.dtype)?)?;
        tensor_to_image(&decoded)
    }
}

/// RGB image -> [1, 3, H, W] tensor in [-1, 1]
pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// [1, 3, H, W] tensor in [-1, 1] -> RGB image
pub fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let (_, _, height, width) = tensor.dims4()?;
    let pixels = tensor
        .to_dtype(DType::F32)?
        .clamp(-1f32, 1f32)?
        .affine(127.5, 127.5)?
        .to_dtype(DType::U8)?
        .squeeze(0)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;

    let image = RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;
    Ok(DynamicImage::ImageRgb8(image))
}

/// Load the FLUX transformer with an epoch adapter fused into its weights
pub fn load_transformer(
    model_path: &Path,
    adapter: &EpochAdapter,
    device: &Device,
    dtype: DType,
) -> Result<flux::model::Flux> {
    info!(
        path = %model_path.display(),
        adapter = %adapter.name,
        "Loading FLUX transformer"
    );

    let mut weights = candle_core::safetensors::load(model_path, device)
        .with_context(|| format!("Failed to load transformer weights: {}", model_path.display()))?;

    let fused = adapter.fuse_into(&mut weights)?;
    info!(fused, total = adapter.weight_count(), "Adapter fused into transformer");

    let vb = VarBuilder::from_tensors(weights, dtype, device);
    let model = flux::model::Flux::new(&flux::model::Config::dev(), vb)?;

    info!("✓ FLUX transformer ready");
    Ok(model)
}
