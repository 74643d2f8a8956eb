//! Per-slot worker
//!
//! [`run_worker`] is the only generation path. It runs either directly in the
//! sweep process (`--in-process`) or inside a `worker` process launched by the
//! [`ProcessPool`](crate::pool::ProcessPool).
//!
//! For each assigned epoch:
//! 1. Skip it if the checkpoint file is missing
//! 2. Build a pipeline for the checkpoint
//! 3. Create `output_epoch_<N>/`
//! 4. Generate every image × prompt pair
//! 5. Drop the pipeline before moving on
//!
//! Failures are contained per epoch. A broken epoch never stops the ones after it.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::assign::WorkerAssignment;
use crate::config::SweepConfig;
use crate::inputs::{
    checkpoint_path, discover_images, epoch_output_dir, output_file_name, prompt_preview,
    read_prompts,
};

/// An image generator conditioned on one control image
pub trait ControlPipeline {
    fn generate(&mut self, prompt: &str, control: &DynamicImage, seed: u64) -> Result<DynamicImage>;
}

/// Builds a pipeline for one epoch checkpoint, on the loader's device
pub trait PipelineLoader {
    type Pipeline: ControlPipeline;

    fn load(&self, checkpoint: &Path) -> Result<Self::Pipeline>;
}

/// What happens when a single (image, prompt) pair fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PairFailure {
    /// Abandon the rest of the epoch
    #[default]
    AbortEpoch,
    /// Log it, leave that output absent and carry on with the next pair
    SkipPair,
}

impl PairFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbortEpoch => "abort-epoch",
            Self::SkipPair => "skip-pair",
        }
    }
}

/// Summary of one worker's run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub slot: usize,
    /// Epochs whose cross-product ran to the end
    pub completed: Vec<u32>,
    /// Epochs with no checkpoint file
    pub skipped: Vec<u32>,
    /// Epochs abandoned because of an error
    pub failed: Vec<u32>,
    pub files_written: usize,
    pub pairs_failed: usize,
}

impl WorkerReport {
    /// The terminal status line printed for this worker
    pub fn status_line(&self) -> String {
        format!(
            "GPU {} finished: {} completed, {} skipped, {} failed, {} images written",
            self.slot,
            self.completed.len(),
            self.skipped.len(),
            self.failed.len(),
            self.files_written
        )
    }
}

#[derive(Debug, Default)]
struct EpochOutcome {
    written: usize,
    pairs_failed: usize,
}

/// Run one slot's share of the sweep.
///
/// Returns an error only when the shared inputs can't be read. Per-epoch
/// failures end up in the report.
pub fn run_worker<L: PipelineLoader>(
    loader: &L,
    assignment: &WorkerAssignment,
    config: &SweepConfig,
) -> Result<WorkerReport> {
    let slot = assignment.slot;
    info!(slot, epochs = ?assignment.epochs, "GPU {} starting", slot);

    let images = discover_images(&config.image_folder);
    let prompts = read_prompts(&config.prompt_file)?;
    info!(
        slot,
        images = images.len(),
        prompts = prompts.len(),
        "Inputs loaded"
    );

    let mut report = WorkerReport {
        slot,
        ..Default::default()
    };

    for &epoch in &assignment.epochs {
        info!(slot, epoch, "GPU {} processing epoch {}", slot, epoch);

        let checkpoint = checkpoint_path(&config.model_base, epoch);
        if !checkpoint.exists() {
            warn!(
                slot,
                epoch,
                path = %checkpoint.display(),
                "Checkpoint not found, skipping epoch"
            );
            report.skipped.push(epoch);
            continue;
        }

        match run_epoch(loader, slot, epoch, &checkpoint, &images, &prompts, config) {
            Ok(outcome) => {
                info!(slot, epoch, written = outcome.written, "GPU {} finished epoch {}", slot, epoch);
                report.completed.push(epoch);
                report.files_written += outcome.written;
                report.pairs_failed += outcome.pairs_failed;
            }
            Err(e) => {
                error!(slot, epoch, "GPU {} failed on epoch {}: {:#}", slot, epoch, e);
                report.failed.push(epoch);
            }
        }
    }

    info!(slot, epochs = ?assignment.epochs, "GPU {} done with all assigned epochs", slot);
    Ok(report)
}

fn run_epoch<L: PipelineLoader>(
    loader: &L,
    slot: usize,
    epoch: u32,
    checkpoint: &Path,
    images: &[PathBuf],
    prompts: &[String],
    config: &SweepConfig,
) -> Result<EpochOutcome> {
    let mut pipeline = loader
        .load(checkpoint)
        .with_context(|| format!("Failed to build pipeline for epoch {}", epoch))?;

    let output_dir = epoch_output_dir(&config.output_root, epoch);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let mut outcome = EpochOutcome::default();

    for (i, image_path) in images.iter().enumerate() {
        info!(
            "GPU {} - Epoch {} - Processing image {}/{}: {}",
            slot,
            epoch,
            i + 1,
            images.len(),
            image_path.file_name().unwrap_or_default().to_string_lossy()
        );

        let control = match load_control_image(image_path, config.resolution) {
            Ok(control) => control,
            Err(e) if config.on_error == PairFailure::SkipPair => {
                warn!(slot, epoch, path = %image_path.display(), "Skipping image: {:#}", e);
                outcome.pairs_failed += prompts.len();
                continue;
            }
            Err(e) => return Err(e),
        };

        for (j, prompt) in prompts.iter().enumerate() {
            info!(
                "  GPU {} - Epoch {} - Using prompt {}/{}: {}...",
                slot,
                epoch,
                j + 1,
                prompts.len(),
                prompt_preview(prompt)
            );

            let target = output_dir.join(output_file_name(epoch, image_path, j));
            let result = pipeline
                .generate(prompt, &control, config.seed)
                .and_then(|generated| save_output(&generated, &target));

            match result {
                Ok(()) => {
                    info!("    GPU {} - Saved: {}", slot, target.display());
                    outcome.written += 1;
                }
                Err(e) if config.on_error == PairFailure::SkipPair => {
                    warn!(slot, epoch, prompt = j + 1, path = %target.display(), "Pair failed: {:#}", e);
                    outcome.pairs_failed += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "image {} prompt {}",
                        image_path.display(),
                        j + 1
                    )))
                }
            }
        }
    }

    drop(pipeline);
    info!(slot, epoch, "Pipeline released");

    Ok(outcome)
}

/// Load a control image and resize it to a `side`×`side` square
pub fn load_control_image(path: &Path, side: u32) -> Result<DynamicImage> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open control image: {}", path.display()))?;
    Ok(image.resize_exact(side, side, FilterType::CatmullRom))
}

fn save_output(image: &DynamicImage, path: &Path) -> Result<()> {
    DynamicImage::ImageRgb8(image.to_rgb8())
        .save_with_format(path, ImageFormat::Jpeg)
        .with_context(|| format!("Failed to save {}", path.display()))
}
