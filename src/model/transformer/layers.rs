//! Transformer blocks.
//!
//! - [`SaBlock`] — pre-norm self-attention + FFN with optional layer scale
//! - [`AdaLnSaBlock`] — class-modulated (AdaLN) self-attention + FFN
//! - [`Block`] — the variant chosen at construction

use candle_core::{D, Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};
use rand::Rng;

use super::attention::SelfAttention;
use crate::config::VarConfig;
use crate::sampling::VarRng;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Stochastic regularizers
// ---------------------------------------------------------------------------

/// Element-wise dropout. Identity without an RNG or with `p = 0`.
pub(crate) fn dropout(x: &Tensor, p: f64, rng: Option<&mut VarRng>) -> Result<Tensor> {
    let Some(rng) = rng else {
        return Ok(x.clone());
    };
    if p <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - p;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| {
            if rng.random::<f64>() < keep {
                (1.0 / keep) as f32
            } else {
                0.0
            }
        })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    Ok((x * mask)?)
}

/// Stochastic depth: zero the whole residual branch of a sample with
/// probability `p`, scale survivors by `1 / (1 - p)`.
pub(crate) fn drop_path(x: &Tensor, p: f64, rng: Option<&mut VarRng>) -> Result<Tensor> {
    let Some(rng) = rng else {
        return Ok(x.clone());
    };
    if p <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - p;
    let b = x.dim(0)?;
    let mask: Vec<f32> = (0..b)
        .map(|_| {
            if rng.random::<f64>() < keep {
                (1.0 / keep) as f32
            } else {
                0.0
            }
        })
        .collect();
    let mut shape = vec![1usize; x.rank()];
    shape[0] = b;
    let mask = Tensor::from_vec(mask, shape, x.device())?.to_dtype(x.dtype())?;
    Ok(x.broadcast_mul(&mask)?)
}

// ---------------------------------------------------------------------------
// Norm + FFN
// ---------------------------------------------------------------------------

/// LayerNorm over the last dimension, with or without affine parameters.
///
/// Written out in primitive ops so gradients flow through it.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight: Some(weight),
            bias: Some(bias),
            eps,
        })
    }

    pub fn no_affine(eps: f64) -> Self {
        Self {
            weight: None,
            bias: None,
            eps,
        }
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let mut y = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        if let Some(w) = &self.weight {
            y = y.broadcast_mul(w)?;
        }
        if let Some(b) = &self.bias {
            y = y.broadcast_add(b)?;
        }
        Ok(y)
    }
}

/// `fc1 → GELU(tanh) → fc2 → dropout`.
#[derive(Debug, Clone)]
pub struct Ffn {
    fc1: Linear,
    fc2: Linear,
    drop: f64,
}

impl Ffn {
    pub fn new(cfg: &VarConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.mlp_hidden();
        Ok(Self {
            fc1: candle_nn::linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
            drop: cfg.drop_rate,
        })
    }

    pub fn forward(&self, x: &Tensor, rng: Option<&mut VarRng>) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu()?;
        let h = self.fc2.forward(&h)?;
        dropout(&h, self.drop, rng)
    }
}

// ---------------------------------------------------------------------------
// Plain block
// ---------------------------------------------------------------------------

/// Pre-norm block; the class only reaches it through the start tokens.
#[derive(Debug, Clone)]
pub struct SaBlock {
    ln1: LayerNorm,
    attn: SelfAttention,
    ln2: LayerNorm,
    ffn: Ffn,
    gamma1: Option<Tensor>,
    gamma2: Option<Tensor>,
    drop_path: f64,
}

impl SaBlock {
    pub fn new(cfg: &VarConfig, drop_path: f64, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        let (gamma1, gamma2) = match cfg.layer_scale {
            Some(ls) => (
                Some(vb.get_with_hints(c, "gamma1", Init::Const(ls))?),
                Some(vb.get_with_hints(c, "gamma2", Init::Const(ls))?),
            ),
            None => (None, None),
        };
        Ok(Self {
            ln1: LayerNorm::new(c, cfg.norm_eps, vb.pp("ln1"))?,
            attn: SelfAttention::new(cfg, vb.pp("attn"))?,
            ln2: LayerNorm::new(c, cfg.norm_eps, vb.pp("ln2"))?,
            ffn: Ffn::new(cfg, vb.pp("ffn"))?,
            gamma1,
            gamma2,
            drop_path,
        })
    }

    /// Run attention fully and the FFN up to its raw output.
    ///
    /// Returns `(residual, delta)`; [`Self::finish`] adds them.
    pub fn forward_split(
        &mut self,
        x: &Tensor,
        bias: Option<&Tensor>,
        mut rng: Option<&mut VarRng>,
    ) -> Result<(Tensor, Tensor)> {
        let h = self
            .attn
            .forward(&self.ln1.forward(x)?, bias, rng.as_deref_mut())?;
        let h = scale(&h, self.gamma1.as_ref())?;
        let x = (x + drop_path(&h, self.drop_path, rng.as_deref_mut())?)?;

        let delta = self.ffn.forward(&self.ln2.forward(&x)?, rng)?;
        Ok((x, delta))
    }

    /// `residual + drop_path(γ2 ⊙ delta)`.
    pub fn finish(&self, residual: &Tensor, delta: &Tensor, rng: Option<&mut VarRng>) -> Result<Tensor> {
        let h = scale(delta, self.gamma2.as_ref())?;
        Ok((residual + drop_path(&h, self.drop_path, rng)?)?)
    }

    pub fn forward(
        &mut self,
        x: &Tensor,
        bias: Option<&Tensor>,
        mut rng: Option<&mut VarRng>,
    ) -> Result<Tensor> {
        let (residual, delta) = self.forward_split(x, bias, rng.as_deref_mut())?;
        self.finish(&residual, &delta, rng)
    }
}

fn scale(x: &Tensor, gamma: Option<&Tensor>) -> Result<Tensor> {
    match gamma {
        Some(g) => Ok(x.broadcast_mul(g)?),
        None => Ok(x.clone()),
    }
}

// ---------------------------------------------------------------------------
// Adaptive block
// ---------------------------------------------------------------------------

/// Source of the six modulation vectors of an adaptive block.
#[derive(Debug, Clone)]
pub enum Modulation {
    /// `SiLU → Linear(D, 6C)` owned by the block.
    PerBlock(Linear),
    /// Learned `[1, 1, 6, C]` table added to the model's shared projection.
    Shared(Tensor),
}

/// Self-attention + FFN modulated by the class conditioning.
///
/// ```text
/// x += drop_path(attn(LN(x)·(1+s1)+b1) ⊙ γ1)
/// x += drop_path(ffn(LN(x)·(1+s2)+b2) ⊙ γ2)
/// ```
#[derive(Debug, Clone)]
pub struct AdaLnSaBlock {
    ln: LayerNorm,
    attn: SelfAttention,
    ffn: Ffn,
    modulation: Modulation,
    embed_dim: usize,
    drop_path: f64,
}

impl AdaLnSaBlock {
    pub fn new(cfg: &VarConfig, shared: bool, drop_path: f64, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        let modulation = if shared {
            let std = 1.0 / (c as f64).sqrt();
            Modulation::Shared(vb.get_with_hints(
                (1, 1, 6, c),
                "ada_gss",
                Init::Randn {
                    mean: 0.0,
                    stdev: std,
                },
            )?)
        } else {
            Modulation::PerBlock(candle_nn::linear(c, 6 * c, vb.pp("ada_lin.1"))?)
        };
        Ok(Self {
            ln: LayerNorm::no_affine(cfg.norm_eps),
            attn: SelfAttention::new(cfg, vb.pp("attn"))?,
            ffn: Ffn::new(cfg, vb.pp("ffn"))?,
            modulation,
            embed_dim: c,
            drop_path,
        })
    }

    /// `[B, 1, 6, C]` modulation table for this block.
    ///
    /// `cond` is `[B, D]` for per-block modulation and the shared
    /// `[B, 1, 6, C]` projection otherwise.
    fn modulation(&self, cond: &Tensor) -> Result<Tensor> {
        let c = self.embed_dim;
        match &self.modulation {
            Modulation::PerBlock(ada_lin) => {
                let (b, d) = cond.dims2()?;
                if d != c {
                    return Err(Error::config(format!(
                        "conditioning width {d} does not match block width {c}"
                    )));
                }
                Ok(ada_lin.forward(&cond.silu()?)?.reshape((b, 1, 6, c))?)
            }
            Modulation::Shared(ada_gss) => {
                let dims = cond.dims();
                if dims.len() != 4 || dims[2] != 6 || dims[3] != c {
                    return Err(Error::config(format!(
                        "shared modulation {dims:?} does not match block width {c}"
                    )));
                }
                Ok(cond.broadcast_add(ada_gss)?)
            }
        }
    }

    pub fn forward(
        &mut self,
        x: &Tensor,
        cond: &Tensor,
        bias: Option<&Tensor>,
        mut rng: Option<&mut VarRng>,
    ) -> Result<Tensor> {
        let table = self.modulation(cond)?;
        // Each chunk: [B, 1, C]
        let chunk = |i: usize| -> Result<Tensor> { Ok(table.narrow(2, i, 1)?.squeeze(2)?) };
        let (gamma1, gamma2) = (chunk(0)?, chunk(1)?);
        let (scale1, scale2) = (chunk(2)?, chunk(3)?);
        let (shift1, shift2) = (chunk(4)?, chunk(5)?);

        let h = modulate(&self.ln.forward(x)?, &scale1, &shift1)?;
        let h = self.attn.forward(&h, bias, rng.as_deref_mut())?;
        let h = h.broadcast_mul(&gamma1)?;
        let x = (x + drop_path(&h, self.drop_path, rng.as_deref_mut())?)?;

        let h = modulate(&self.ln.forward(&x)?, &scale2, &shift2)?;
        let h = self.ffn.forward(&h, rng.as_deref_mut())?;
        let h = h.broadcast_mul(&gamma2)?;
        Ok((&x + drop_path(&h, self.drop_path, rng)?)?)
    }
}

/// `x·(1 + scale) + shift`.
pub(crate) fn modulate(x: &Tensor, scale: &Tensor, shift: &Tensor) -> Result<Tensor> {
    Ok(x.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(shift)?)
}

// ---------------------------------------------------------------------------
// Block variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Block {
    Plain(SaBlock),
    AdaLn(AdaLnSaBlock),
}

impl Block {
    pub fn forward(
        &mut self,
        x: &Tensor,
        cond: &Tensor,
        bias: Option<&Tensor>,
        rng: Option<&mut VarRng>,
    ) -> Result<Tensor> {
        match self {
            Block::Plain(block) => block.forward(x, bias, rng),
            Block::AdaLn(block) => block.forward(x, cond, bias, rng),
        }
    }

    pub fn attn_mut(&mut self) -> &mut SelfAttention {
        match self {
            Block::Plain(block) => &mut block.attn,
            Block::AdaLn(block) => &mut block.attn,
        }
    }

    pub fn attn(&self) -> &SelfAttention {
        match self {
            Block::Plain(block) => &block.attn,
            Block::AdaLn(block) => &block.attn,
        }
    }
}
