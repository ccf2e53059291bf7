//! Model and codebook configuration.
//!
//! Defaults match the d16 ImageNet-256 VAR checkpoint. Every field has a
//! serde default so partial JSON files work.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How the class conditioning reaches the transformer blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningMode {
    /// Plain pre-norm blocks; the class only enters through the start token.
    Plain,
    /// Per-block `SiLU → Linear(D, 6C)` adaptive layer norm.
    AdaLn,
    /// One `SiLU → Linear(D, 6C)` shared by all blocks, plus a learned
    /// per-block `[1, 1, 6, C]` table.
    SharedAdaLn,
}

impl ConditioningMode {
    pub fn is_adaptive(self) -> bool {
        !matches!(self, ConditioningMode::Plain)
    }
}

/// Attention similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// `q·kᵀ / √d`.
    DotProduct,
    /// Cosine similarity times a learned per-head scale initialised to `tau`.
    ScaledCosine,
}

/// Configuration for [`crate::model::VarModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarConfig {
    /// Number of classes (the unconditional row is extra).
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Codebook size `V` (logit width).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Codebook feature width `Cvae`.
    #[serde(default = "default_codebook_dim")]
    pub codebook_dim: usize,

    /// Side length of every stage, coarse to fine.
    #[serde(default = "default_patch_nums")]
    pub patch_nums: Vec<usize>,

    /// Number of transformer blocks.
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Hidden width `C` (also the conditioning width `D`).
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Number of attention heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// FFN expansion ratio.
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    /// LayerNorm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,

    #[serde(default = "default_conditioning")]
    pub conditioning: ConditioningMode,

    /// Probability of replacing a training label with the unconditional class.
    #[serde(default = "default_cond_drop_rate")]
    pub cond_drop_rate: f64,

    /// Dropout after the attention projection and the FFN.
    #[serde(default)]
    pub drop_rate: f64,

    /// Dropout on attention probabilities.
    #[serde(default)]
    pub attn_drop_rate: f64,

    /// Stochastic depth rate of the deepest block (linear from 0).
    #[serde(default)]
    pub drop_path_rate: f64,

    /// Initial layer-scale gain for plain blocks. `None` disables layer scale.
    #[serde(default)]
    pub layer_scale: Option<f64>,

    #[serde(default = "default_attention")]
    pub attention: AttentionKind,

    /// Initial cosine-attention temperature.
    #[serde(default = "default_tau")]
    pub tau: f64,

    /// Keep the last plain block's FFN residual unsummed and let the head
    /// reconcile it. No numerical effect.
    #[serde(default)]
    pub fused_add_norm: bool,

    /// Add an inert `0·w` term so word-embedding parameters get a gradient
    /// when progressive training only covers the first stage.
    #[serde(default = "default_keep_unused_params_alive")]
    pub keep_unused_params_alive: bool,
}

impl Default for VarConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            vocab_size: default_vocab_size(),
            codebook_dim: default_codebook_dim(),
            patch_nums: default_patch_nums(),
            depth: default_depth(),
            embed_dim: default_embed_dim(),
            num_heads: default_num_heads(),
            mlp_ratio: default_mlp_ratio(),
            norm_eps: default_norm_eps(),
            conditioning: default_conditioning(),
            cond_drop_rate: default_cond_drop_rate(),
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            drop_path_rate: 0.0,
            layer_scale: None,
            attention: default_attention(),
            tau: default_tau(),
            fused_add_norm: false,
            keep_unused_params_alive: default_keep_unused_params_alive(),
        }
    }
}

impl VarConfig {
    /// Depth-scaled preset: `C = 64·depth`, `heads = depth`,
    /// `drop_path = 0.1·depth/24`.
    pub fn for_depth(depth: usize) -> Self {
        Self {
            depth,
            embed_dim: depth * 64,
            num_heads: depth,
            drop_path_rate: 0.1 * depth as f64 / 24.0,
            ..Self::default()
        }
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Width of one attention head.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Hidden width of the FFN.
    pub fn mlp_hidden(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio).round() as usize
    }

    /// Stochastic depth rate of each block, `linspace(0, drop_path_rate, depth)`.
    pub fn drop_path_schedule(&self) -> Vec<f64> {
        match self.depth {
            0 => Vec::new(),
            1 => vec![0.0],
            n => (0..n)
                .map(|i| self.drop_path_rate * i as f64 / (n - 1) as f64)
                .collect(),
        }
    }

    /// Reject configurations that cannot build a model.
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::config("depth must be at least 1"));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(Error::config(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.num_classes == 0 || self.vocab_size == 0 || self.codebook_dim == 0 {
            return Err(Error::config(
                "num_classes, vocab_size and codebook_dim must be positive",
            ));
        }
        for (name, p) in [
            ("cond_drop_rate", self.cond_drop_rate),
            ("drop_rate", self.drop_rate),
            ("attn_drop_rate", self.attn_drop_rate),
            ("drop_path_rate", self.drop_path_rate),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        if self.attention == AttentionKind::ScaledCosine && self.tau <= 0.0 {
            return Err(Error::config(format!("tau must be positive, got {}", self.tau)));
        }
        // Stage list checks live with the layout.
        crate::model::StageLayout::new(&self.patch_nums).map(|_| ())
    }
}

/// Configuration for [`crate::codebook::VectorQuantizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodebookConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    #[serde(default = "default_codebook_dim")]
    pub codebook_dim: usize,

    /// Must match the model's stage list.
    #[serde(default = "default_patch_nums")]
    pub patch_nums: Vec<usize>,

    /// Residual ratio of the `phi` refinement convolutions.
    #[serde(default = "default_quant_resi")]
    pub quant_resi: f64,

    /// Number of partially shared `phi` convolutions.
    #[serde(default = "default_share_quant_resi")]
    pub share_quant_resi: usize,
}

impl Default for CodebookConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            codebook_dim: default_codebook_dim(),
            patch_nums: default_patch_nums(),
            quant_resi: default_quant_resi(),
            share_quant_resi: default_share_quant_resi(),
        }
    }
}

impl CodebookConfig {
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn default_num_classes() -> usize {
    1000
}
fn default_vocab_size() -> usize {
    4096
}
fn default_codebook_dim() -> usize {
    32
}
fn default_patch_nums() -> Vec<usize> {
    vec![1, 2, 3, 4, 5, 6, 8, 10, 13, 16]
}
fn default_depth() -> usize {
    16
}
fn default_embed_dim() -> usize {
    1024
}
fn default_num_heads() -> usize {
    16
}
fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_norm_eps() -> f64 {
    1e-6
}
fn default_conditioning() -> ConditioningMode {
    ConditioningMode::AdaLn
}
fn default_cond_drop_rate() -> f64 {
    0.1
}
fn default_attention() -> AttentionKind {
    AttentionKind::DotProduct
}
fn default_tau() -> f64 {
    4.0
}
fn default_keep_unused_params_alive() -> bool {
    true
}
fn default_quant_resi() -> f64 {
    0.5
}
fn default_share_quant_resi() -> usize {
    4
}
