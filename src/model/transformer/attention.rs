//! Self-attention with an optional incremental key/value cache.
//!
//! Two similarity kernels, picked by [`AttentionKind`]:
//! - dot product: `softmax(q·kᵀ / √d + bias)`
//! - scaled cosine: `softmax(q̂·k̂ᵀ + bias)` with `q̂ = normalize(q)·exp(min(s, ln 100))`

use candle_core::{D, Module, Tensor};
use candle_nn::kv_cache::KvCache;
use candle_nn::{Init, Linear, VarBuilder};

use super::layers::dropout;
use crate::config::{AttentionKind, VarConfig};
use crate::sampling::VarRng;
use crate::Result;

/// Upper bound of the learned cosine log-scale.
const MAX_LOG_SCALE: f64 = 4.605_170_185_988_091; // ln(100)

/// Multi-head self-attention.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    /// `Linear(C, 3C)` without bias.
    mat_qkv: Linear,
    q_bias: Tensor,
    v_bias: Tensor,
    zero_k_bias: Tensor,
    /// `[1, H, 1, 1]` learned log-scale, cosine kernel only.
    scale_mul: Option<Tensor>,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    attn_drop: f64,
    proj_drop: f64,
    caching: bool,
    /// Keys and values concatenated along the sequence axis, `[B, H, S, hd]`.
    kv_cache: KvCache,
}

impl SelfAttention {
    pub fn new(cfg: &VarConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.embed_dim;
        let mat_qkv = candle_nn::linear_no_bias(c, 3 * c, vb.pp("mat_qkv"))?;
        let q_bias = vb.get_with_hints(c, "q_bias", Init::Const(0.0))?;
        let v_bias = vb.get_with_hints(c, "v_bias", Init::Const(0.0))?;
        let zero_k_bias = Tensor::zeros(c, vb.dtype(), vb.device())?;
        let scale_mul = match cfg.attention {
            AttentionKind::ScaledCosine => Some(vb.get_with_hints(
                (1, cfg.num_heads, 1, 1),
                "scale_mul_1H11",
                Init::Const(cfg.tau.ln()),
            )?),
            AttentionKind::DotProduct => None,
        };
        let proj = candle_nn::linear(c, c, vb.pp("proj"))?;
        let seq_len = cfg.patch_nums.iter().map(|pn| pn * pn).sum::<usize>().max(1);
        Ok(Self {
            mat_qkv,
            q_bias,
            v_bias,
            zero_k_bias,
            scale_mul,
            proj,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
            attn_drop: cfg.attn_drop_rate,
            proj_drop: cfg.drop_rate,
            caching: false,
            kv_cache: KvCache::new(2, seq_len),
        })
    }

    /// Switch incremental mode on or off. Either way the cache starts empty.
    pub fn set_caching(&mut self, enabled: bool) {
        self.caching = enabled;
        self.kv_cache.reset();
    }

    pub fn is_caching(&self) -> bool {
        self.caching
    }

    /// Number of cached positions.
    pub fn cached_len(&self) -> usize {
        self.kv_cache.current_seq_len()
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, l, C]`
    /// - `bias`: additive `[1, 1, l, l]` mask (full-sequence mode only)
    ///
    /// In caching mode the new keys/values are appended and the queries
    /// attend to everything cached so far.
    pub fn forward(
        &mut self,
        x: &Tensor,
        bias: Option<&Tensor>,
        mut rng: Option<&mut VarRng>,
    ) -> Result<Tensor> {
        let (b, l, c) = x.dims3()?;

        let qkv_bias = Tensor::cat(&[&self.q_bias, &self.zero_k_bias, &self.v_bias], 0)?;
        let qkv = self
            .mat_qkv
            .forward(x)?
            .broadcast_add(&qkv_bias)?
            .reshape((b, l, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?; // [3, B, H, l, hd]
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let (q, k, scale) = match &self.scale_mul {
            Some(scale_mul) => {
                let scale_mul = scale_mul.minimum(MAX_LOG_SCALE)?.exp()?;
                let q = l2_normalize(&q)?.broadcast_mul(&scale_mul)?;
                (q, l2_normalize(&k)?, 1.0)
            }
            None => (q, k, 1.0 / (self.head_dim as f64).sqrt()),
        };

        let (k, v) = if self.caching {
            let (k, v) = self.kv_cache.append(&k.contiguous()?, &v.contiguous()?)?;
            (k, v.contiguous()?)
        } else {
            (k, v)
        };

        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = match bias {
            Some(bias) => scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?,
            None => scores,
        };
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = dropout(&attn, self.attn_drop, rng.as_deref_mut())?;

        let out = attn
            .matmul(&v)? // [B, H, l, hd]
            .transpose(1, 2)?
            .reshape((b, l, c))?;
        let out = self.proj.forward(&out)?;
        dropout(&out, self.proj_drop, rng)
    }
}

/// Normalize the last dimension to unit length (norm clamped at 1e-12).
fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    Ok(x.broadcast_div(&norm)?)
}
