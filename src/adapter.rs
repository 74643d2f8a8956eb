//! Epoch checkpoint loading
//!
//! Each `epoch-<N>.safetensors` holds low-rank weight pairs trained against the
//! base transformer. They are fused directly into the base weights:
//! W' = W + (alpha / rank) * (up @ down)
//!
//! Both kohya-style (`lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight`)
//! and dotted (`transformer.double_blocks.0.img_attn.qkv.lora_A.weight`) key
//! layouts are accepted.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// One low-rank pair for a single transformer layer
#[derive(Debug)]
pub struct AdapterWeight {
    /// Down projection [rank, in_features]
    pub down: Tensor,
    /// Up projection [out_features, rank]
    pub up: Tensor,
    pub alpha: f32,
    pub rank: usize,
}

impl AdapterWeight {
    pub fn scale(&self) -> f64 {
        self.alpha as f64 / self.rank as f64
    }
}

/// All low-rank pairs of one epoch checkpoint, keyed by transformer tensor name
#[derive(Debug)]
pub struct EpochAdapter {
    pub name: String,
    pub weights: HashMap<String, AdapterWeight>,
}

impl EpochAdapter {
    /// Load a checkpoint onto the CPU
    pub fn load(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Loading epoch checkpoint");

        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to parse safetensors: {}", path.display()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());

        let adapter = Self::from_tensors(name, tensors)?;
        if adapter.weight_count() == 0 {
            anyhow::bail!("No low-rank weight pairs in checkpoint: {}", path.display());
        }

        info!(
            path = %path.display(),
            weight_pairs = adapter.weight_count(),
            "✓ Epoch checkpoint loaded"
        );

        Ok(adapter)
    }

    /// Pair up raw checkpoint tensors
    pub fn from_tensors(name: String, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut alphas: HashMap<String, f32> = HashMap::new();
        let mut downs: HashMap<String, Tensor> = HashMap::new();
        let mut ups: HashMap<String, Tensor> = HashMap::new();

        for (key, tensor) in tensors {
            if let Some(base) = key.strip_suffix(".alpha") {
                // stored either as a scalar or as a one-element vector
                let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                match values.first() {
                    Some(&alpha) => {
                        alphas.insert(tensor_name(base), alpha);
                    }
                    None => warn!(key = %key, "Empty alpha tensor"),
                }
            } else if key.contains(".lora_down.") || key.contains(".lora_A.") {
                downs.insert(tensor_name(&base_name(&key)), tensor);
            } else if key.contains(".lora_up.") || key.contains(".lora_B.") {
                ups.insert(tensor_name(&base_name(&key)), tensor);
            } else {
                debug!(key = %key, "Ignoring non-adapter tensor");
            }
        }

        let mut weights = HashMap::new();
        for (layer, down) in downs {
            let Some(up) = ups.remove(&layer) else {
                warn!(layer = %layer, "Down projection without matching up projection");
                continue;
            };
            let rank = down.dim(0)?;
            let alpha = alphas.get(&layer).copied().unwrap_or(rank as f32);
            weights.insert(layer, AdapterWeight { down, up, alpha, rank });
        }

        for layer in ups.keys() {
            warn!(layer = %layer, "Up projection without matching down projection");
        }

        Ok(Self { name, weights })
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// Add every pair's delta to the matching base weight.
    ///
    /// Returns how many base tensors were updated. Pairs with no matching
    /// tensor or a mismatched shape are logged and left out; if that leaves
    /// nothing applied, the base model would run unchanged, which is an error.
    pub fn fuse_into(&self, base: &mut HashMap<String, Tensor>) -> Result<usize> {
        let mut fused = 0;

        for (layer, weight) in &self.weights {
            let Some(target) = base.get(layer) else {
                warn!(layer = %layer, "No base tensor for adapter layer");
                continue;
            };

            let device = target.device();
            let delta = weight
                .up
                .to_dtype(DType::F32)?
                .to_device(device)?
                .matmul(&weight.down.to_dtype(DType::F32)?.to_device(device)?)?
                .affine(weight.scale(), 0.0)?;

            if delta.dims() != target.dims() {
                warn!(
                    layer = %layer,
                    base = ?target.dims(),
                    delta = ?delta.dims(),
                    "Adapter shape does not match base tensor"
                );
                continue;
            }

            let updated = (target.to_dtype(DType::F32)? + delta)?.to_dtype(target.dtype())?;
            base.insert(layer.clone(), updated);
            fused += 1;
        }

        if fused == 0 {
            anyhow::bail!(
                "Adapter {} matched none of the base weights ({} pairs)",
                self.name,
                self.weight_count()
            );
        }
        Ok(fused)
    }
}

/// Strip the `.lora_down.weight` style suffix from a key
fn base_name(key: &str) -> String {
    let key = key.strip_suffix(".weight").unwrap_or(key);
    for marker in [".lora_down", ".lora_up", ".lora_A", ".lora_B"] {
        if let Some(pos) = key.rfind(marker) {
            return key[..pos].to_string();
        }
    }
    key.to_string()
}

/// Map an adapter layer name to the transformer's weight tensor name
///
/// - `lora_unet_double_blocks_0_img_attn_qkv` -> `double_blocks.0.img_attn.qkv.weight`
/// - `lora_unet_single_blocks_3_modulation_lin` -> `single_blocks.3.modulation.lin.weight`
/// - `transformer.double_blocks.0.img_mlp.0` -> `double_blocks.0.img_mlp.0.weight`
pub fn tensor_name(layer: &str) -> String {
    let mut name = layer;
    for prefix in ["lora_unet_", "diffusion_model.", "transformer."] {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
        }
    }

    let mut mapped = if name.contains('.') {
        name.to_string()
    } else {
        underscored_to_dotted(name)
    };

    if !mapped.ends_with(".weight") && !mapped.ends_with(".bias") {
        mapped.push_str(".weight");
    }
    mapped
}

/// Module names that themselves contain an underscore
const COMPOUND_MODULES: [&str; 19] = [
    "double_blocks",
    "single_blocks",
    "img_attn",
    "txt_attn",
    "img_mlp",
    "txt_mlp",
    "img_mod",
    "txt_mod",
    "query_norm",
    "key_norm",
    "img_in",
    "txt_in",
    "time_in",
    "vector_in",
    "guidance_in",
    "final_layer",
    "in_layer",
    "out_layer",
    "adaLN_modulation",
];

/// `double_blocks_0_img_attn_qkv` -> `double_blocks.0.img_attn.qkv`
fn underscored_to_dotted(name: &str) -> String {
    let parts: Vec<&str> = name.split('_').collect();
    let mut out: Vec<String> = Vec::with_capacity(parts.len());

    let mut i = 0;
    while i < parts.len() {
        if i + 1 < parts.len() {
            let pair = format!("{}_{}", parts[i], parts[i + 1]);
            if COMPOUND_MODULES.contains(&pair.as_str()) {
                out.push(pair);
                i += 2;
                continue;
            }
        }
        out.push(parts[i].to_string());
        i += 1;
    }

    out.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_name() {
        assert_eq!(
            tensor_name("lora_unet_double_blocks_0_img_attn_qkv"),
            "double_blocks.0.img_attn.qkv.weight"
        );
        assert_eq!(
            tensor_name("lora_unet_double_blocks_12_txt_mlp_2"),
            "double_blocks.12.txt_mlp.2.weight"
        );
        assert_eq!(
            tensor_name("lora_unet_single_blocks_3_modulation_lin"),
            "single_blocks.3.modulation.lin.weight"
        );
        assert_eq!(
            tensor_name("lora_unet_single_blocks_5_linear1"),
            "single_blocks.5.linear1.weight"
        );
        assert_eq!(
            tensor_name("transformer.double_blocks.0.img_mlp.0"),
            "double_blocks.0.img_mlp.0.weight"
        );
        assert_eq!(tensor_name("final_layer.linear.weight"), "final_layer.linear.weight");
        assert_eq!(tensor_name("lora_unet_final_layer_linear"), "final_layer.linear.weight");
        assert_eq!(
            tensor_name("lora_unet_final_layer_adaLN_modulation_1"),
            "final_layer.adaLN_modulation.1.weight"
        );
        assert_eq!(tensor_name("lora_unet_img_in"), "img_in.weight");
        assert_eq!(tensor_name("lora_unet_txt_in"), "txt_in.weight");
        assert_eq!(tensor_name("lora_unet_time_in_in_layer"), "time_in.in_layer.weight");
        assert_eq!(tensor_name("lora_unet_vector_in_out_layer"), "vector_in.out_layer.weight");
        assert_eq!(tensor_name("lora_unet_guidance_in_in_layer"), "guidance_in.in_layer.weight");
        assert_eq!(
            tensor_name("lora_unet_double_blocks_1_img_mod_lin"),
            "double_blocks.1.img_mod.lin.weight"
        );
    }

    #[test]
    fn test_base_name() {
        assert_eq!(
            base_name("lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight"),
            "lora_unet_double_blocks_0_img_attn_qkv"
        );
        assert_eq!(base_name("some_layer.lora_up.weight"), "some_layer");
        assert_eq!(base_name("layer.lora_A.weight"), "layer");
        assert_eq!(base_name("layer.lora_B.weight"), "layer");
    }

    fn pair_tensors(alpha: Option<f32>) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        // rank 1: up [2, 1], down [1, 3]
        tensors.insert(
            "lora_unet_single_blocks_0_linear1.lora_down.weight".to_string(),
            Tensor::new(&[[1f32, 2., 3.]], &dev).unwrap(),
        );
        tensors.insert(
            "lora_unet_single_blocks_0_linear1.lora_up.weight".to_string(),
            Tensor::new(&[[1f32], [2.]], &dev).unwrap(),
        );
        if let Some(alpha) = alpha {
            tensors.insert(
                "lora_unet_single_blocks_0_linear1.alpha".to_string(),
                Tensor::new(alpha, &dev).unwrap(),
            );
        }
        tensors
    }

    #[test]
    fn test_pairs_and_alpha_default() {
        let adapter = EpochAdapter::from_tensors("epoch-1".into(), pair_tensors(None)).unwrap();
        assert_eq!(adapter.weight_count(), 1);
        let weight = &adapter.weights["single_blocks.0.linear1.weight"];
        assert_eq!(weight.rank, 1);
        assert_eq!(weight.alpha, 1.0);
    }

    #[test]
    fn test_orphan_projection_is_dropped() {
        let mut tensors = pair_tensors(None);
        tensors.remove("lora_unet_single_blocks_0_linear1.lora_up.weight");
        let adapter = EpochAdapter::from_tensors("epoch-1".into(), tensors).unwrap();
        assert_eq!(adapter.weight_count(), 0);
    }

    #[test]
    fn test_fuse_into_base_weights() {
        let adapter = EpochAdapter::from_tensors("epoch-1".into(), pair_tensors(Some(0.5))).unwrap();

        let mut base = HashMap::new();
        base.insert(
            "single_blocks.0.linear1.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        base.insert(
            "single_blocks.0.linear2.weight".to_string(),
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );

        let fused = adapter.fuse_into(&mut base).unwrap();
        assert_eq!(fused, 1);

        // 0.5 * [[1],[2]] @ [[1,2,3]]
        let updated = base["single_blocks.0.linear1.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(updated, vec![vec![0.5, 1.0, 1.5], vec![1.0, 2.0, 3.0]]);
        let untouched = base["single_blocks.0.linear2.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(untouched, vec![vec![1.0; 3]; 2]);
    }

    #[test]
    fn test_fuse_skips_mismatched_shapes() {
        let adapter = EpochAdapter::from_tensors("epoch-1".into(), pair_tensors(None)).unwrap();
        let mut base = HashMap::new();
        base.insert(
            "single_blocks.0.linear1.weight".to_string(),
            Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(adapter.fuse_into(&mut base).is_err());

        base.insert(
            "single_blocks.0.linear1.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        assert_eq!(adapter.fuse_into(&mut base).unwrap(), 1);
    }

    #[test]
    fn test_checkpoint_without_pairs_is_rejected() {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "controlnet_blocks.0.weight".to_string(),
            Tensor::zeros((4, 4), DType::F32, &dev).unwrap(),
        );

        let adapter = EpochAdapter::from_tensors("epoch-1".into(), tensors.clone()).unwrap();
        assert_eq!(adapter.weight_count(), 0);
        assert!(adapter.fuse_into(&mut HashMap::new()).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epoch-1.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();
        assert!(EpochAdapter::load(&path).is_err());
    }

    #[test]
    fn test_fuse_with_unknown_layers_fails() {
        let adapter = EpochAdapter::from_tensors("epoch-1".into(), pair_tensors(None)).unwrap();
        let mut base = HashMap::new();
        base.insert(
            "double_blocks.0.img_attn.qkv.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(adapter.fuse_into(&mut base).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epoch-4.safetensors");
        candle_core::safetensors::save(&pair_tensors(Some(2.0)), &path).unwrap();

        let adapter = EpochAdapter::load(&path).unwrap();
        assert_eq!(adapter.name, "epoch-4");
        assert_eq!(adapter.weights["single_blocks.0.linear1.weight"].alpha, 2.0);

        std::fs::write(dir.path().join("epoch-5.safetensors"), b"garbage").unwrap();
        assert!(EpochAdapter::load(&dir.path().join("epoch-5.safetensors")).is_err());
    }
}
