//! The multi-scale autoregressive model.
//!
//! Holds every learned component plus the derived buffers (stage layout,
//! level index, causal mask). Two entry points:
//! - [`VarModel::forward`] — teacher forcing over the whole (or a prefix of the) pyramid
//! - [`VarModel::generate`] — stage-by-stage sampling with a KV cache

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::embed::{ConditioningEmbedder, PositionalScheme};
use super::head::ConditionalHead;
use super::transformer::{CausalStageMask, SharedAdaLin, TransformerStack};
use super::StageLayout;
use crate::config::{ConditioningMode, VarConfig};
use crate::sampling::VarRng;
use crate::{Error, Result};

/// Class-conditional next-scale prediction transformer.
pub struct VarModel {
    pub(super) config: VarConfig,
    pub(super) layout: StageLayout,
    /// `Linear(Cvae, C)` shared by every stage after the first.
    pub(super) word_embed: Linear,
    pub(super) conditioning: ConditioningEmbedder,
    pub(super) positions: PositionalScheme,
    pub(super) shared_ada_lin: Option<SharedAdaLin>,
    pub(super) stack: TransformerStack,
    pub(super) mask: CausalStageMask,
    pub(super) head: ConditionalHead,
    progressive_stage: Option<usize>,
    pub(super) device: Device,
    pub(super) dtype: DType,
}

impl VarModel {
    /// Build from a `VarBuilder` (fresh `VarMap` or loaded weights).
    pub fn new(config: VarConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let layout = StageLayout::new(&config.patch_nums)?;
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let word_embed =
            candle_nn::linear(config.codebook_dim, config.embed_dim, vb.pp("word_embed"))?;
        let conditioning = ConditioningEmbedder::new(&config, &layout, vb.clone())?;
        let positions = PositionalScheme::new(&config, &layout, vb.clone())?;
        let shared_ada_lin = match config.conditioning {
            ConditioningMode::SharedAdaLn => {
                Some(SharedAdaLin::new(&config, vb.pp("shared_ada_lin"))?)
            }
            _ => None,
        };
        let stack = TransformerStack::new(&config, vb.clone())?;
        let mask = CausalStageMask::new(&layout, &device)?;
        let head = ConditionalHead::new(&config, vb)?;

        tracing::info!(
            depth = config.depth,
            embed_dim = config.embed_dim,
            heads = config.num_heads,
            stages = layout.num_stages(),
            seq_len = layout.total_len(),
            conditioning = ?config.conditioning,
            attention = ?config.attention,
            "built VAR model"
        );

        Ok(Self {
            config,
            layout,
            word_embed,
            conditioning,
            positions,
            shared_ada_lin,
            stack,
            mask,
            head,
            progressive_stage: None,
            device,
            dtype,
        })
    }

    /// Load weights from one or more safetensors files.
    pub fn load(
        config: VarConfig,
        weights: &[impl AsRef<Path>],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let paths: Vec<&Path> = weights.iter().map(AsRef::as_ref).collect();
        tracing::info!("Loading VAR weights from {:?}", paths);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&paths, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("VAR weights: {e}")))?
        };
        Self::new(config, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("VAR model init: {e}")),
            other => other,
        })
    }

    pub fn config(&self) -> &VarConfig {
        &self.config
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn progressive_stage(&self) -> Option<usize> {
        self.progressive_stage
    }

    /// Restrict teacher forcing to stages `0..=si`. `None` covers the whole pyramid.
    pub fn set_progressive_stage(&mut self, si: Option<usize>) -> Result<()> {
        if let Some(si) = si
            && si >= self.layout.num_stages()
        {
            return Err(Error::config(format!(
                "progressive stage {si} out of range for {} stages",
                self.layout.num_stages()
            )));
        }
        self.progressive_stage = si;
        Ok(())
    }

    /// Turn on the KV cache of every block.
    ///
    /// Errors if caching is already on, i.e. another generation is in flight
    /// or a previous one was not closed.
    pub fn enable_kv_cache(&mut self) -> Result<()> {
        if self.stack.is_caching() {
            return Err(Error::state("KV cache is already enabled"));
        }
        self.stack.set_kv_caching(true);
        Ok(())
    }

    /// Turn off and clear the KV cache of every block.
    pub fn disable_kv_cache(&mut self) {
        self.stack.set_kv_caching(false);
    }

    pub fn is_caching(&self) -> bool {
        self.stack.is_caching()
    }

    /// Conditioning fed to the blocks: `[B, D]`, or `[B, 1, 6, C]` in shared mode.
    pub(super) fn block_conditioning(&self, cond: &Tensor) -> Result<Tensor> {
        match &self.shared_ada_lin {
            Some(shared) => shared.forward(cond),
            None => Ok(cond.clone()),
        }
    }

    /// `[B, l, Cvae]` codebook features → `[B, l, C]` tokens.
    pub(super) fn embed_tokens(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.word_embed.forward(&x.to_dtype(self.dtype)?)?)
    }

    /// Teacher-forcing forward.
    ///
    /// - `labels`: `[B]` class indices (`num_classes` = unconditional)
    /// - `x_wo_first_l`: `[B, ≥ ed - first_l, Cvae]` ground-truth inputs for
    ///   every stage after the first
    /// - `rng`: training randomness; `None` runs deterministically
    ///
    /// Returns `[B, ed, V]` logits, `ed` being the end of the progressive stage.
    pub fn forward(
        &mut self,
        labels: &Tensor,
        x_wo_first_l: &Tensor,
        mut rng: Option<&mut VarRng>,
    ) -> Result<Tensor> {
        if self.stack.is_caching() {
            return Err(Error::state(
                "teacher forcing while the KV cache is enabled",
            ));
        }
        let first_l = self.layout.first_len();
        let ed = match self.progressive_stage {
            Some(si) => self.layout.range(si).1,
            None => self.layout.total_len(),
        };

        let b = labels.dims1()?;
        let (xb, xl, xc) = x_wo_first_l.dims3()?;
        if xb != b || xc != self.config.codebook_dim || xl < ed - first_l {
            return Err(Error::shape(format!(
                "teacher input is [{xb}, {xl}, {xc}], expected [{b}, >= {}, {}]",
                ed - first_l,
                self.config.codebook_dim
            )));
        }

        let labels = self
            .conditioning
            .prepare_labels(labels, rng.as_deref_mut())?;
        let cond = self.conditioning.embed(&labels)?;
        let sos = self.conditioning.start_tokens(&cond)?;

        let x = if ed == first_l {
            sos
        } else {
            let teacher = self.embed_tokens(&x_wo_first_l.narrow(1, 0, ed - first_l)?)?;
            Tensor::cat(&[&sos, &teacher], 1)?
        };
        let x = x.broadcast_add(&self.positions.lvl_pos()?.narrow(1, 0, ed)?)?;

        let bias = self.mask.prefix(ed)?;
        let block_cond = self.block_conditioning(&cond)?;
        let hidden = self
            .stack
            .forward(&x, &block_cond, Some(&bias), rng.as_deref_mut())?;
        let hidden = self.stack.materialize(hidden, rng)?;
        let logits = self.head.forward(&hidden, &cond, 1.0)?;

        if self.progressive_stage == Some(0) && self.config.keep_unused_params_alive {
            return self.touch_word_embed(&logits);
        }
        Ok(logits)
    }

    /// Add `0·w[0, 0] + 0·b[0]` so the word embedding appears in the graph.
    ///
    /// The zeros are tensors: a scalar `* 0.0` becomes an affine op that
    /// backprop prunes.
    fn touch_word_embed(&self, logits: &Tensor) -> Result<Tensor> {
        let w = self.word_embed.weight().narrow(0, 0, 1)?.narrow(1, 0, 1)?; // [1, 1]
        let mut inert = w.mul(&w.zeros_like()?)?;
        if let Some(bias) = self.word_embed.bias() {
            let b = bias.narrow(0, 0, 1)?; // [1]
            inert = inert.broadcast_add(&b.mul(&b.zeros_like()?)?)?;
        }
        let inert = inert.reshape((1, 1, 1))?.to_dtype(logits.dtype())?;
        Ok(logits.broadcast_add(&inert)?)
    }
}
