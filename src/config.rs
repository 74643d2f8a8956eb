//! Run configuration
//!
//! The sweep and bootstrap commands are meant to run without arguments, so
//! every knob has an in-file default here. CLI flags only override them.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::runner::PairFailure;

/// Number of GPU slots (one worker process each)
pub const NUM_GPUS: usize = 8;

/// Epochs are numbered `1..=TOTAL_EPOCHS`
pub const TOTAL_EPOCHS: u32 = 20;

/// Directory holding `epoch-<N>.safetensors` checkpoints
pub const MODEL_BASE_PATH: &str = "models/train/Qwen-Image-Blockwise-ControlNet-Qr_full";

/// Root of the control images (searched recursively)
pub const IMAGE_FOLDER: &str = "data/example_image_dataset/canny";

/// One prompt per line, blank lines ignored
pub const PROMPT_FILE: &str = "prompts.txt";

/// Control images are resized to a square of this side before generation
pub const CONTROL_RESOLUTION: u32 = 1328;

/// Fixed seed for every generation call
pub const SEED: u64 = 0;

/// Dataset pulled by the bootstrap command
pub const DATASET_ID: &str = "shichen/qr-blip3o";

/// Local directory the dataset is stored in
pub const DATA_DIR: &str = "./qr-blip3o";

/// Env file read before looking up the hub token
pub const ENV_FILE: &str = ".env";

/// Environment variable holding the hub token
pub const TOKEN_VAR: &str = "HF_TOKEN";

/// Everything a sweep (and each of its workers) needs to know
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub num_gpus: usize,
    pub total_epochs: u32,
    pub model_base: PathBuf,
    pub image_folder: PathBuf,
    pub prompt_file: PathBuf,
    /// Parent of the `output_epoch_<N>` directories
    pub output_root: PathBuf,
    pub resolution: u32,
    pub seed: u64,
    pub on_error: PairFailure,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            num_gpus: NUM_GPUS,
            total_epochs: TOTAL_EPOCHS,
            model_base: PathBuf::from(MODEL_BASE_PATH),
            image_folder: PathBuf::from(IMAGE_FOLDER),
            prompt_file: PathBuf::from(PROMPT_FILE),
            output_root: PathBuf::from("."),
            resolution: CONTROL_RESOLUTION,
            seed: SEED,
            on_error: PairFailure::default(),
        }
    }
}

impl SweepConfig {
    /// Check the inputs every worker relies on. Workers never re-check them.
    pub fn check_inputs(&self) -> Result<()> {
        if !self.image_folder.is_dir() {
            bail!("image folder {} does not exist", self.image_folder.display());
        }
        if !self.prompt_file.is_file() {
            bail!("prompt file {} does not exist", self.prompt_file.display());
        }
        Ok(())
    }
}

/// Settings for the dataset bootstrap
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub dataset: String,
    pub data_dir: PathBuf,
    pub env_file: PathBuf,
    pub token_var: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            dataset: DATASET_ID.to_string(),
            data_dir: PathBuf::from(DATA_DIR),
            env_file: PathBuf::from(ENV_FILE),
            token_var: TOKEN_VAR.to_string(),
        }
    }
}
