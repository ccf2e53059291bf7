//! Output head: final normalization + vocabulary projection.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::transformer::layers::{LayerNorm, modulate};
use crate::config::VarConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum HeadNorm {
    /// Affine LayerNorm.
    Plain(LayerNorm),
    /// `LN(x)·(1 + scale) + shift`, `(scale, shift)` from `SiLU → Linear(D, 2C)`.
    AdaLn { ln: LayerNorm, ada_lin: Linear },
}

/// Maps hidden states to logits over the codebook.
#[derive(Debug, Clone)]
pub struct ConditionalHead {
    norm: HeadNorm,
    proj: Linear,
    embed_dim: usize,
}

impl ConditionalHead {
    pub fn new(cfg: &VarConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        let norm = if cfg.conditioning.is_adaptive() {
            HeadNorm::AdaLn {
                ln: LayerNorm::no_affine(cfg.norm_eps),
                ada_lin: candle_nn::linear(c, 2 * c, vb.pp("head_nm.ada_lin.1"))?,
            }
        } else {
            HeadNorm::Plain(LayerNorm::new(c, cfg.norm_eps, vb.pp("head_nm"))?)
        };
        let proj = candle_nn::linear(c, cfg.vocab_size, vb.pp("head"))?;
        Ok(Self {
            norm,
            proj,
            embed_dim: c,
        })
    }

    /// `[B, l, C]` hidden + `[B, D]` conditioning → `[B, l, V]` logits / `tau`.
    pub fn forward(&self, hidden: &Tensor, cond: &Tensor, tau: f64) -> Result<Tensor> {
        let h = match &self.norm {
            HeadNorm::Plain(ln) => ln.forward(hidden)?,
            HeadNorm::AdaLn { ln, ada_lin } => {
                let (b, d) = cond.dims2()?;
                if d != self.embed_dim {
                    return Err(Error::config(format!(
                        "conditioning width {d} does not match head width {}",
                        self.embed_dim
                    )));
                }
                let table = ada_lin
                    .forward(&cond.silu()?)?
                    .reshape((b, 1, 2, self.embed_dim))?;
                let scale = table.narrow(2, 0, 1)?.squeeze(2)?;
                let shift = table.narrow(2, 1, 1)?.squeeze(2)?;
                modulate(&ln.forward(hidden)?, &scale, &shift)?
            }
        };
        let logits = self.proj.forward(&h)?;
        if tau == 1.0 {
            Ok(logits)
        } else {
            Ok((logits / tau)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConditioningMode;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn cfg(conditioning: ConditioningMode) -> VarConfig {
        VarConfig {
            embed_dim: 8,
            num_heads: 2,
            vocab_size: 12,
            depth: 1,
            conditioning,
            ..VarConfig::default()
        }
    }

    #[test]
    fn logits_shape_for_both_variants() {
        for mode in [ConditioningMode::Plain, ConditioningMode::AdaLn] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let head = ConditionalHead::new(&cfg(mode), vb).unwrap();
            let h = Tensor::randn(0f32, 1.0, (2, 4, 8), &Device::Cpu).unwrap();
            let cond = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu).unwrap();
            let logits = head.forward(&h, &cond, 1.0).unwrap();
            assert_eq!(logits.dims(), &[2, 4, 12]);
        }
    }

    #[test]
    fn temperature_divides_logits() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ConditionalHead::new(&cfg(ConditioningMode::AdaLn), vb).unwrap();
        let h = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let cond = Tensor::randn(0f32, 1.0, (1, 8), &Device::Cpu).unwrap();

        let a = head.forward(&h, &cond, 1.0).unwrap();
        let b = (head.forward(&h, &cond, 2.0).unwrap() * 2.0).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5);
    }
}
