//! Stage-by-stage class-conditional sampling.
//!
//! ```text
//! labels ─▶ [cond | uncond] (2B) ─▶ enable KV cache
//!   for each stage:
//!     stack (incremental) ─▶ head ─▶ guided merge (1+t)·c − t·u
//!     ─▶ top-k/top-p ─▶ sample (or Gumbel blend) ─▶ codebook patch
//!     ─▶ next_stage_input ─▶ word_embed + lvl_pos ─▶ duplicate to 2B
//! ─▶ disable KV cache
//! ```

use candle_core::{DType, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::VarModel;
use crate::codebook::Codebook;
use crate::sampling::{
    VarRng, categorical_index, gumbel_softmax, restrict_top_k_top_p, rng_from_seed,
    sample_categorical,
};
use crate::{Error, Result};

/// Which classes to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSpec {
    /// Uniform over all classes, drawn per sample.
    Random,
    /// Drawn per sample from a prior over the classes.
    Weighted(Vec<f64>),
    /// One class for the whole batch; negative means unconditional.
    Class(i64),
    /// One class per sample.
    PerSample(Vec<u32>),
}

/// What each stage records in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// `[B, pn²]` u32 code indices.
    Indices,
    /// `[B, Cvae, pn, pn]` codebook features.
    Features,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default = "default_label")]
    pub label: LabelSpec,
    /// `None` draws a fresh seed from the thread RNG.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Classifier-free guidance scale reached at the last stage.
    #[serde(default = "default_cfg")]
    pub cfg: f64,
    /// `0` disables top-k.
    #[serde(default)]
    pub top_k: usize,
    /// `0` disables nucleus sampling.
    #[serde(default)]
    pub top_p: f64,
    #[serde(default = "default_output")]
    pub output: OutputMode,
    /// Gumbel-softmax blend strength; `0` samples hard indices.
    #[serde(default)]
    pub gumbel: f64,
    /// Logit temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            batch: default_batch(),
            label: default_label(),
            seed: None,
            cfg: default_cfg(),
            top_k: 0,
            top_p: 0.0,
            output: default_output(),
            gumbel: 0.0,
            temperature: default_temperature(),
        }
    }
}

fn default_batch() -> usize {
    1
}
fn default_label() -> LabelSpec {
    LabelSpec::Random
}
fn default_cfg() -> f64 {
    1.5
}
fn default_output() -> OutputMode {
    OutputMode::Indices
}
fn default_temperature() -> f64 {
    1.0
}

/// One generated pyramid.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Class of each sample (`num_classes` = unconditional).
    pub labels: Vec<u32>,
    /// Per-stage output, coarse to fine, as selected by [`OutputMode`].
    pub stages: Vec<Tensor>,
}

impl Generation {
    /// Per-sample, per-stage indices. Only meaningful for [`OutputMode::Indices`].
    pub fn indices(&self) -> Result<Vec<Vec<Vec<u32>>>> {
        let b = self.labels.len();
        let mut out = vec![Vec::with_capacity(self.stages.len()); b];
        for stage in &self.stages {
            let rows: Vec<Vec<u32>> = stage.to_dtype(DType::U32)?.to_vec2()?;
            for (sample, row) in out.iter_mut().zip(rows) {
                sample.push(row);
            }
        }
        Ok(out)
    }
}

/// `(1 + t)·logits[:B] − t·logits[B:]`.
pub(crate) fn merge_guidance(logits: &Tensor, b: usize, t: f64) -> Result<Tensor> {
    let cond = logits.narrow(0, 0, b)?;
    let uncond = logits.narrow(0, b, b)?;
    Ok(((cond * (1.0 + t))? - (uncond * t)?)?)
}

/// Gumbel temperature at progress `ratio` through the pyramid.
fn gumbel_tau(ratio: f64) -> f64 {
    (0.27 * (1.0 - ratio * 0.95)).max(0.005)
}

impl VarModel {
    /// Generate one pyramid per batch element.
    pub fn generate(&mut self, codebook: &dyn Codebook, params: &GenerationParams) -> Result<Generation> {
        let mut rng = rng_from_seed(params.seed);
        self.generate_with_rng(codebook, params, &mut rng)
    }

    /// [`Self::generate`] with a caller-owned RNG. `params.seed` is ignored.
    ///
    /// The KV cache is enabled for the duration of the call and disabled again
    /// on every exit path.
    pub fn generate_with_rng(
        &mut self,
        codebook: &dyn Codebook,
        params: &GenerationParams,
        rng: &mut VarRng,
    ) -> Result<Generation> {
        if params.batch == 0 {
            return Err(Error::shape("batch must be at least 1"));
        }
        if params.gumbel < 0.0 {
            return Err(Error::config(format!(
                "gumbel must be non-negative, got {}",
                params.gumbel
            )));
        }
        if codebook.vocab_size() != self.config.vocab_size
            || codebook.dim() != self.config.codebook_dim
        {
            return Err(Error::config(format!(
                "codebook is {}x{}, model expects {}x{}",
                codebook.vocab_size(),
                codebook.dim(),
                self.config.vocab_size,
                self.config.codebook_dim
            )));
        }

        let labels = self.resolve_labels(&params.label, params.batch, rng)?;
        self.enable_kv_cache()?;
        let result = self.run_stages(codebook, params, &labels, rng);
        self.disable_kv_cache();
        Ok(Generation {
            labels,
            stages: result?,
        })
    }

    fn resolve_labels(&self, spec: &LabelSpec, batch: usize, rng: &mut VarRng) -> Result<Vec<u32>> {
        let num_classes = self.conditioning.num_classes();
        match spec {
            LabelSpec::Random => Ok((0..batch)
                .map(|_| rng.random_range(0..num_classes) as u32)
                .collect()),
            LabelSpec::Weighted(prior) => {
                if prior.len() != num_classes {
                    return Err(Error::shape(format!(
                        "class prior has {} entries, expected {num_classes}",
                        prior.len()
                    )));
                }
                (0..batch)
                    .map(|_| categorical_index(prior, rng).map(|i| i as u32))
                    .collect()
            }
            LabelSpec::Class(c) if *c < 0 => {
                Ok(vec![self.conditioning.unconditional_class(); batch])
            }
            LabelSpec::Class(c) => {
                if *c as usize >= num_classes {
                    return Err(Error::shape(format!(
                        "class {c} out of range for {num_classes} classes"
                    )));
                }
                Ok(vec![*c as u32; batch])
            }
            LabelSpec::PerSample(labels) => {
                if labels.len() != batch {
                    return Err(Error::shape(format!(
                        "{} labels for a batch of {batch}",
                        labels.len()
                    )));
                }
                if let Some(bad) = labels.iter().find(|&&l| l as usize > num_classes) {
                    return Err(Error::shape(format!(
                        "label {bad} out of range for {num_classes} classes"
                    )));
                }
                Ok(labels.clone())
            }
        }
    }

    fn run_stages(
        &mut self,
        codebook: &dyn Codebook,
        params: &GenerationParams,
        labels: &[u32],
        rng: &mut VarRng,
    ) -> Result<Vec<Tensor>> {
        let b = labels.len();
        let num_stages = self.layout.num_stages();
        let patch_nums = self.layout.patch_nums().to_vec();
        let c_vae = codebook.dim();
        let r = self.layout.max_side();

        // Conditional half first, unconditional half second.
        let mut both = labels.to_vec();
        both.extend(std::iter::repeat_n(self.conditioning.unconditional_class(), b));
        let label_t = Tensor::new(both, &self.device)?;
        let cond = self.conditioning.embed(&label_t)?;
        let block_cond = self.block_conditioning(&cond)?;
        let lvl_pos = self.positions.lvl_pos()?;

        let first_l = self.layout.first_len();
        let mut token_map = self
            .conditioning
            .start_tokens(&cond)?
            .broadcast_add(&lvl_pos.narrow(1, 0, first_l)?)?;
        let mut f_hat = Tensor::zeros((b, c_vae, r, r), codebook.embedding().dtype(), &self.device)?;
        let mut outputs = Vec::with_capacity(num_stages);

        for (si, &pn) in patch_nums.iter().enumerate() {
            let ratio = self.layout.ratio(si);
            let t = self.layout.guidance_ratio(params.cfg, si);

            let hidden = self.stack.forward(&token_map, &block_cond, None, None)?;
            let hidden = self.stack.materialize(hidden, None)?;
            let logits = self
                .head
                .forward(&hidden, &cond, params.temperature)?
                .to_dtype(DType::F32)?;
            let logits = merge_guidance(&logits, b, t)?;
            let logits = restrict_top_k_top_p(&logits, params.top_k, params.top_p)?;

            let indices = sample_categorical(&logits, 1, rng)?.squeeze(2)?;
            let features = if params.gumbel != 0.0 {
                let scaled = (&logits * (1.0 + ratio * params.gumbel))?;
                let probs = gumbel_softmax(&scaled, gumbel_tau(ratio), false, rng)?;
                codebook.embed_soft(&probs)?
            } else {
                codebook.embed(&indices)?
            };
            let patch = features
                .transpose(1, 2)?
                .reshape((b, c_vae, pn, pn))?
                .to_dtype(f_hat.dtype())?;

            tracing::debug!(stage = si, side = pn, guidance = t, "sampled stage");
            outputs.push(match params.output {
                OutputMode::Indices => indices,
                OutputMode::Features => patch.clone(),
            });

            if si + 1 < num_stages {
                let (next_f_hat, next) =
                    codebook.next_stage_input(si, num_stages, &f_hat, &patch)?;
                f_hat = next_f_hat;
                let pn_next = patch_nums[si + 1];
                let next = next
                    .reshape((b, c_vae, pn_next * pn_next))?
                    .transpose(1, 2)?;
                let (bg, ed) = self.layout.range(si + 1);
                let tokens = self
                    .embed_tokens(&next)?
                    .broadcast_add(&lvl_pos.narrow(1, bg, ed - bg)?)?;
                token_map = Tensor::cat(&[&tokens, &tokens], 0)?;
            }
        }
        Ok(outputs)
    }
}
