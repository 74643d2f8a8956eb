//! Sweep inputs and naming conventions
//!
//! - control images: discovered recursively under a root, filtered by extension
//! - prompts: one per line, trimmed, blank lines dropped
//! - checkpoints: `<base>/epoch-<N>.safetensors`
//! - outputs: `output_epoch_<N>/epoch_<N>_<image>_prompt_<j>.jpg`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions accepted as control images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "webp"];

/// Prompts are shortened to this many characters in progress lines
const PROMPT_PREVIEW_CHARS: usize = 50;

/// Find every control image below `root`, sorted by path
pub fn discover_images(root: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| has_image_extension(path))
        .collect();

    images.sort();
    images
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Read the prompt file
pub fn read_prompts(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
    Ok(parse_prompts(&text))
}

/// Split prompt text into trimmed, non-empty lines, keeping their order
pub fn parse_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Checkpoint file for an epoch
pub fn checkpoint_path(model_base: &Path, epoch: u32) -> PathBuf {
    model_base.join(format!("epoch-{}.safetensors", epoch))
}

/// Per-epoch output directory
pub fn epoch_output_dir(output_root: &Path, epoch: u32) -> PathBuf {
    output_root.join(format!("output_epoch_{}", epoch))
}

/// Output file name for one (epoch, image, prompt) task.
///
/// `prompt_index` is 0-based; the name carries it 1-based.
pub fn output_file_name(epoch: u32, image: &Path, prompt_index: usize) -> String {
    let image_name = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("epoch_{}_{}_prompt_{}.jpg", epoch, image_name, prompt_index + 1)
}

/// First few characters of a prompt, for log lines
pub fn prompt_preview(prompt: &str) -> &str {
    match prompt.char_indices().nth(PROMPT_PREVIEW_CHARS) {
        Some((idx, _)) => &prompt[..idx],
        None => prompt,
    }
}
