//! Class conditioning and positional embeddings.
//!
//! - [`ConditioningEmbedder`] — label → conditioning vector and start tokens
//! - [`PositionalScheme`] — absolute position + stage level embeddings

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};
use rand::Rng;

use super::StageLayout;
use crate::config::VarConfig;
use crate::sampling::VarRng;
use crate::{Error, Result};

/// Standard deviation used for every learned embedding table.
pub(crate) fn embed_init(embed_dim: usize) -> Init {
    Init::Randn {
        mean: 0.0,
        stdev: (1.0 / embed_dim as f64 / 3.0).sqrt(),
    }
}

fn embedding(rows: usize, dim: usize, name: &str, vb: &VarBuilder) -> Result<Embedding> {
    let weight = vb.get_with_hints((rows, dim), name, embed_init(dim))?;
    Ok(Embedding::new(weight, dim))
}

/// Class embedding table plus the learned start-token bias.
///
/// Row `num_classes` is the unconditional class used for guidance.
#[derive(Debug, Clone)]
pub struct ConditioningEmbedder {
    class_emb: Embedding,
    /// `[1, first_l, C]`
    pos_start: Tensor,
    num_classes: usize,
    cond_drop_rate: f64,
}

impl ConditioningEmbedder {
    pub fn new(cfg: &VarConfig, layout: &StageLayout, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        let class_emb = embedding(cfg.num_classes + 1, c, "class_emb.weight", &vb)?;
        let pos_start =
            vb.get_with_hints((1, layout.first_len(), c), "pos_start", embed_init(c))?;
        Ok(Self {
            class_emb,
            pos_start,
            num_classes: cfg.num_classes,
            cond_drop_rate: cfg.cond_drop_rate,
        })
    }

    /// Index of the unconditional row.
    pub fn unconditional_class(&self) -> u32 {
        self.num_classes as u32
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Validate `[B]` labels and, when an RNG is given, replace each one with
    /// the unconditional class with probability `cond_drop_rate`.
    pub fn prepare_labels(&self, labels: &Tensor, rng: Option<&mut VarRng>) -> Result<Tensor> {
        let values: Vec<u32> = labels.to_dtype(DType::U32)?.to_vec1()?;
        if let Some(&bad) = values.iter().find(|&&l| l as usize > self.num_classes) {
            return Err(Error::shape(format!(
                "label {bad} out of range for {} classes",
                self.num_classes
            )));
        }

        let Some(rng) = rng else {
            return Ok(Tensor::new(values, labels.device())?);
        };
        let uncond = self.unconditional_class();
        let dropped: Vec<u32> = values
            .into_iter()
            .map(|l| {
                if rng.random::<f64>() < self.cond_drop_rate {
                    uncond
                } else {
                    l
                }
            })
            .collect();
        Ok(Tensor::new(dropped, labels.device())?)
    }

    /// `[B]` labels → `[B, D]` conditioning vectors.
    pub fn embed(&self, labels: &Tensor) -> Result<Tensor> {
        Ok(self.class_emb.forward(labels)?)
    }

    /// `[B, D]` conditioning → `[B, first_l, C]` first-stage tokens.
    pub fn start_tokens(&self, cond: &Tensor) -> Result<Tensor> {
        Ok(cond.unsqueeze(1)?.broadcast_add(&self.pos_start)?)
    }
}

/// Learned absolute positions plus one learned vector per stage.
#[derive(Debug, Clone)]
pub struct PositionalScheme {
    /// `[1, L, C]`
    positions: Tensor,
    lvl_embed: Embedding,
    /// `[1, L]` u32
    levels: Tensor,
}

impl PositionalScheme {
    pub fn new(cfg: &VarConfig, layout: &StageLayout, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        let positions = vb.get_with_hints((1, layout.total_len(), c), "pos_1LC", embed_init(c))?;
        let lvl_embed = embedding(layout.num_stages(), c, "lvl_embed.weight", &vb)?;
        let levels = layout.level_tensor(vb.device())?;
        Ok(Self {
            positions,
            lvl_embed,
            levels,
        })
    }

    /// `[1, L, C]` level + position embedding for the whole sequence.
    pub fn lvl_pos(&self) -> Result<Tensor> {
        let lvl = self.lvl_embed.forward(&self.levels)?;
        Ok((lvl + &self.positions)?)
    }
}
