//! Control-image guided FLUX generation
//!
//! This is the concrete [`ControlPipeline`] used by the sweep:
//! 1. Encode the prompt (T5 + CLIP)
//! 2. Encode the control image into latents with the VAE
//! 3. Start from those latents partially noised and denoise with the
//!    epoch-fused transformer (rectified-flow image-to-image)
//! 4. VAE decode to RGB

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::flux;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;
use tracing::{debug, info};

use crate::adapter::EpochAdapter;
use crate::download::ModelPaths;
use crate::models::{load_transformer, Autoencoder, ClipTextEncoder, T5TextEncoder};
use crate::runner::{ControlPipeline, PipelineLoader};

/// Sampling settings shared by every generation call
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub steps: usize,
    pub guidance: f64,
    /// How far the control latents are pushed back toward noise (0..=1)
    pub strength: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            steps: 28,
            guidance: 3.5,
            strength: 0.8,
        }
    }
}

impl SamplingParams {
    /// Trim a full noise schedule to the part image-to-image sampling runs.
    ///
    /// At least one step is always kept.
    pub fn truncate_schedule<'a>(&self, schedule: &'a [f64]) -> &'a [f64] {
        let steps = schedule.len().saturating_sub(1);
        let strength = self.strength.clamp(0.0, 1.0);
        let start = ((1.0 - strength) * steps as f64).round() as usize;
        &schedule[start.min(steps.saturating_sub(1))..]
    }
}

/// Standard normal latent noise for an image of `height` x `width`.
///
/// Drawn on the host from `seed` so every backend sees the same values.
pub fn seeded_noise(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let shape = (1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2);
    let len = shape.1 * shape.2 * shape.3;

    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();

    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}

/// Builds one pipeline per epoch checkpoint on a fixed device
pub struct FluxControlLoader {
    paths: ModelPaths,
    device: Device,
    dtype: DType,
    params: SamplingParams,
}

impl FluxControlLoader {
    /// Bind to CUDA device `ordinal`, falling back to the CPU
    pub fn new(paths: ModelPaths, ordinal: usize) -> Result<Self> {
        let device = Device::cuda_if_available(ordinal)?;
        if device.is_cpu() {
            info!(ordinal, "⚠️  CUDA not available, using CPU (will be very slow!)");
        } else {
            info!(ordinal, "Using CUDA device {}", ordinal);
        }

        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };

        Ok(Self {
            paths,
            device,
            dtype,
            params: SamplingParams::default(),
        })
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl PipelineLoader for FluxControlLoader {
    type Pipeline = FluxControlPipeline;

    fn load(&self, checkpoint: &Path) -> Result<FluxControlPipeline> {
        info!(checkpoint = %checkpoint.display(), "Initializing pipeline");

        let adapter = EpochAdapter::load(checkpoint)?;

        let t5 = T5TextEncoder::load(
            &self.paths.t5_model,
            &self.paths.t5_config,
            &self.paths.t5_tokenizer,
            &self.device,
            self.dtype,
        )?;
        let clip = ClipTextEncoder::load(
            &self.paths.clip_model,
            &self.paths.clip_tokenizer,
            &self.device,
            self.dtype,
        )?;
        let vae = Autoencoder::load(&self.paths.vae, &self.device, self.dtype)?;
        let transformer = load_transformer(&self.paths.transformer, &adapter, &self.device, self.dtype)?;

        info!("✓ Pipeline initialized");

        Ok(FluxControlPipeline {
            t5,
            clip,
            vae,
            transformer,
            device: self.device.clone(),
            dtype: self.dtype,
            params: self.params,
        })
    }
}

/// A loaded pipeline for one epoch. Dropping it frees its device memory.
pub struct FluxControlPipeline {
    t5: T5TextEncoder,
    clip: ClipTextEncoder,
    vae: Autoencoder,
    transformer: flux::model::Flux,
    device: Device,
    dtype: DType,
    params: SamplingParams,
}

impl FluxControlPipeline {
    fn initial_latents(&self, control: &DynamicImage, seed: u64, t0: f64) -> Result<Tensor> {
        let control_latents = self.vae.encode_image(control)?.to_dtype(self.dtype)?;

        let (height, width) = (control.height() as usize, control.width() as usize);
        let noise = seeded_noise(seed, height, width, &self.device)?.to_dtype(self.dtype)?;

        Ok(((noise * t0)? + (control_latents * (1.0 - t0))?)?)
    }
}

impl ControlPipeline for FluxControlPipeline {
    fn generate(&mut self, prompt: &str, control: &DynamicImage, seed: u64) -> Result<DynamicImage> {
        let (height, width) = (control.height() as usize, control.width() as usize);
        debug!(height, width, seed, "Starting generation");

        let t5_emb = self.t5.encode(prompt)?;
        let clip_emb = self.clip.encode(prompt)?;

        let packed_len = height.div_ceil(16) * width.div_ceil(16);
        let schedule = flux::sampling::get_schedule(self.params.steps, Some((packed_len, 0.5, 1.15)));
        let timesteps = self.params.truncate_schedule(&schedule);

        let latents = self.initial_latents(control, seed, timesteps[0])?;
        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &latents)?;

        let denoised = flux::sampling::denoise(
            &self.transformer,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            timesteps,
            self.params.guidance,
        )?;
        let latents = flux::sampling::unpack(&denoised, height, width)?;

        let image = self.vae.decode_image(&latents)?;
        debug!(steps = timesteps.len() - 1, "Generation complete");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_schedule() {
        let schedule: Vec<f64> = (0..=10).map(|i| 1.0 - i as f64 / 10.0).collect();

        let full = SamplingParams { strength: 1.0, ..Default::default() };
        assert_eq!(full.truncate_schedule(&schedule).len(), 11);

        let partial = SamplingParams { strength: 0.8, ..Default::default() };
        let trimmed = partial.truncate_schedule(&schedule);
        assert_eq!(trimmed.len(), 9);
        assert!((trimmed[0] - 0.8).abs() < 1e-9);

        let none = SamplingParams { strength: 0.0, ..Default::default() };
        assert_eq!(none.truncate_schedule(&schedule).len(), 2);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let first = seeded_noise(0, 32, 32, &Device::Cpu).unwrap();
        let second = seeded_noise(0, 32, 32, &Device::Cpu).unwrap();
        assert_eq!(first.dims(), &[1, 16, 4, 4]);

        let first = first.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let second = second.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, second);

        let other = seeded_noise(1, 32, 32, &Device::Cpu)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_ne!(first, other);
    }
}
