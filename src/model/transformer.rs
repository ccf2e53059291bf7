//! Transformer stack shared by generation and teacher forcing.
//!
//! Two modes:
//! - full sequence: every position at once under a [`CausalStageMask`]
//! - incremental: one stage per call, keys/values cached in each block
//!
//! The block variant (plain or AdaLN) is picked once from the config.

pub mod attention;
pub mod layers;
pub mod mask;

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{ConditioningMode, VarConfig};
use crate::sampling::VarRng;
use crate::{Error, Result};
use layers::{AdaLnSaBlock, Block, SaBlock};

pub use mask::CausalStageMask;

/// Output of the stack.
///
/// With `fused_add_norm` the last plain block leaves its FFN branch unsummed;
/// [`TransformerStack::materialize`] reconciles it.
#[derive(Debug, Clone)]
pub enum HiddenState {
    Plain(Tensor),
    Fused { residual: Tensor, delta: Tensor },
}

/// `SiLU → Linear(D, 6C)` computed once per forward and shared by all blocks.
#[derive(Debug, Clone)]
pub struct SharedAdaLin {
    lin: Linear,
    embed_dim: usize,
}

impl SharedAdaLin {
    pub fn new(cfg: &VarConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        Ok(Self {
            lin: candle_nn::linear(c, 6 * c, vb.pp("1"))?,
            embed_dim: c,
        })
    }

    /// `[B, D]` → `[B, 1, 6, C]`.
    pub fn forward(&self, cond: &Tensor) -> Result<Tensor> {
        let (b, d) = cond.dims2()?;
        if d != self.embed_dim {
            return Err(Error::config(format!(
                "conditioning width {d} does not match embed_dim {}",
                self.embed_dim
            )));
        }
        Ok(self
            .lin
            .forward(&cond.silu()?)?
            .reshape((b, 1, 6, self.embed_dim))?)
    }
}

/// `depth` blocks applied in order.
#[derive(Debug, Clone)]
pub struct TransformerStack {
    blocks: Vec<Block>,
    fuse_last: bool,
}

impl TransformerStack {
    pub fn new(cfg: &VarConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("blocks");
        let schedule = cfg.drop_path_schedule();
        let mut blocks = Vec::with_capacity(cfg.depth);
        for (i, &dp) in schedule.iter().enumerate() {
            let vb = vb.pp(i.to_string());
            let block = match cfg.conditioning {
                ConditioningMode::Plain => Block::Plain(SaBlock::new(cfg, dp, vb)?),
                ConditioningMode::AdaLn => Block::AdaLn(AdaLnSaBlock::new(cfg, false, dp, vb)?),
                ConditioningMode::SharedAdaLn => {
                    Block::AdaLn(AdaLnSaBlock::new(cfg, true, dp, vb)?)
                }
            };
            blocks.push(block);
        }
        let fuse_last = cfg.fused_add_norm && cfg.conditioning == ConditioningMode::Plain;
        Ok(Self { blocks, fuse_last })
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Run every block.
    ///
    /// - `x`: `[B, l, C]`
    /// - `cond`: `[B, D]`, or the shared `[B, 1, 6, C]` modulation
    /// - `bias`: stage mask for full-sequence mode, `None` when caching
    pub fn forward(
        &mut self,
        x: &Tensor,
        cond: &Tensor,
        bias: Option<&Tensor>,
        mut rng: Option<&mut VarRng>,
    ) -> Result<HiddenState> {
        let last = self.blocks.len().saturating_sub(1);
        let mut x = x.clone();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if i == last && self.fuse_last {
                if let Block::Plain(block) = block {
                    let (residual, delta) = block.forward_split(&x, bias, rng.as_deref_mut())?;
                    return Ok(HiddenState::Fused { residual, delta });
                }
            }
            x = block.forward(&x, cond, bias, rng.as_deref_mut())?;
        }
        Ok(HiddenState::Plain(x))
    }

    /// Collapse a [`HiddenState`] into `[B, l, C]`.
    pub fn materialize(&self, hidden: HiddenState, rng: Option<&mut VarRng>) -> Result<Tensor> {
        match hidden {
            HiddenState::Plain(x) => Ok(x),
            HiddenState::Fused { residual, delta } => match self.blocks.last() {
                Some(Block::Plain(block)) => block.finish(&residual, &delta, rng),
                _ => Err(Error::state("fused hidden state without a plain last block")),
            },
        }
    }

    /// Turn every block's cache on or off. Caches start empty either way.
    pub fn set_kv_caching(&mut self, enabled: bool) {
        for block in &mut self.blocks {
            block.attn_mut().set_caching(enabled);
        }
    }

    pub fn is_caching(&self) -> bool {
        self.blocks.iter().any(|b| b.attn().is_caching())
    }

    /// Positions held in the first block's cache.
    pub fn cached_len(&self) -> usize {
        self.blocks.first().map_or(0, |b| b.attn().cached_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn cfg(conditioning: ConditioningMode) -> VarConfig {
        VarConfig {
            embed_dim: 16,
            num_heads: 2,
            depth: 3,
            conditioning,
            patch_nums: vec![1, 2],
            ..VarConfig::default()
        }
    }

    fn cond_for(stack_cfg: &VarConfig, varmap: &VarMap, cond: &Tensor) -> Tensor {
        match stack_cfg.conditioning {
            ConditioningMode::SharedAdaLn => {
                let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
                SharedAdaLin::new(stack_cfg, vb.pp("shared_ada_lin"))
                    .unwrap()
                    .forward(cond)
                    .unwrap()
            }
            _ => cond.clone(),
        }
    }

    #[test]
    fn every_variant_keeps_shape_and_matches_incremental() {
        let layout = crate::model::StageLayout::new(&[1, 2]).unwrap();
        let mask = CausalStageMask::new(&layout, &Device::Cpu).unwrap();
        for mode in [
            ConditioningMode::Plain,
            ConditioningMode::AdaLn,
            ConditioningMode::SharedAdaLn,
        ] {
            let cfg = cfg(mode);
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let mut stack = TransformerStack::new(&cfg, vb).unwrap();
            assert_eq!(stack.depth(), 3);

            let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
            let cond = Tensor::randn(0f32, 1.0, (2, 16), &Device::Cpu).unwrap();
            let cond = cond_for(&cfg, &varmap, &cond);

            let full = stack.forward(&x, &cond, Some(mask.full()), None).unwrap();
            let full = stack.materialize(full, None).unwrap();
            assert_eq!(full.dims(), &[2, 5, 16]);

            stack.set_kv_caching(true);
            let a = stack.forward(&x.narrow(1, 0, 1).unwrap(), &cond, None, None).unwrap();
            let b = stack.forward(&x.narrow(1, 1, 4).unwrap(), &cond, None, None).unwrap();
            assert_eq!(stack.cached_len(), 5);
            stack.set_kv_caching(false);
            assert!(!stack.is_caching());
            assert_eq!(stack.cached_len(), 0);

            let a = stack.materialize(a, None).unwrap();
            let b = stack.materialize(b, None).unwrap();
            let inc = Tensor::cat(&[&a, &b], 1).unwrap();
            let diff: f32 = (full - inc)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-4, "{mode:?}: incremental diverges by {diff}");
        }
    }

    #[test]
    fn fused_last_block_materializes_to_plain_output() {
        let plain_cfg = cfg(ConditioningMode::Plain);
        let fused_cfg = VarConfig {
            fused_add_norm: true,
            ..plain_cfg.clone()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut plain = TransformerStack::new(&plain_cfg, vb.clone()).unwrap();
        // Same VarMap: the second stack reuses the first one's weights.
        let mut fused = TransformerStack::new(&fused_cfg, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 5, 16), &Device::Cpu).unwrap();
        let cond = Tensor::zeros((1, 16), DType::F32, &Device::Cpu).unwrap();

        let a = plain.forward(&x, &cond, None, None).unwrap();
        let b = fused.forward(&x, &cond, None, None).unwrap();
        assert!(matches!(a, HiddenState::Plain(_)));
        assert!(matches!(b, HiddenState::Fused { .. }));

        let a = plain.materialize(a, None).unwrap();
        let b = fused.materialize(b, None).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }
}
