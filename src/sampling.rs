//! Token sampling with an explicit random source.
//!
//! Every stochastic call takes a [`VarRng`] owned by the caller, so a seeded
//! generation call is reproducible end to end.
//!
//! - [`restrict_top_k_top_p`] — mask logits outside the top-k / nucleus with `-inf`
//! - [`sample_categorical`] — softmax + CDF walk per position
//! - [`gumbel_softmax`] — differentiable soft one-hot with Gumbel noise

use candle_core::{D, DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Random source used across the crate.
pub type VarRng = ChaCha8Rng;

/// Seeded RNG, or one drawn from the thread RNG when no seed is given.
pub fn rng_from_seed(seed: Option<u64>) -> VarRng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

/// Mask logits outside the top-k and/or top-p set with `-inf`.
///
/// - `top_k > 0`: keep logits `>=` the k-th largest of their row (ties survive).
/// - `top_p > 0`: drop the smallest logits whose cumulative probability
///   (ascending order) stays `<= 1 - top_p`. The largest logit always survives.
///
/// `top_k = 0, top_p = 0` leaves the logits untouched.
pub fn restrict_top_k_top_p(logits: &Tensor, top_k: usize, top_p: f64) -> Result<Tensor> {
    let (b, l, v) = logits.dims3()?;
    let top_k_active = top_k > 0 && top_k < v;
    let top_p_active = top_p > 0.0;
    if !top_k_active && !top_p_active {
        return Ok(logits.clone());
    }

    let mut data = flat_f32(logits)?;
    for row in data.chunks_mut(v) {
        if top_k_active {
            restrict_top_k(row, top_k);
        }
        if top_p_active {
            restrict_top_p(row, top_p);
        }
    }
    Ok(Tensor::from_vec(data, (b, l, v), logits.device())?)
}

fn restrict_top_k(row: &mut [f32], top_k: usize) {
    let mut sorted = row.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[top_k - 1];
    for x in row.iter_mut() {
        if *x < threshold {
            *x = f32::NEG_INFINITY;
        }
    }
}

fn restrict_top_p(row: &mut [f32], top_p: f64) {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));

    let probs = softmax_f64(row);
    let last = order.len() - 1;
    let mut cumulative = 0.0f64;
    let mut removed = Vec::new();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if rank != last && cumulative <= 1.0 - top_p {
            removed.push(i);
        }
    }
    for i in removed {
        row[i] = f32::NEG_INFINITY;
    }
}

/// Draw `num_samples` indices per position, with replacement.
///
/// `logits`: `[B, l, V]` → `[B, l, num_samples]` u32.
pub fn sample_categorical(logits: &Tensor, num_samples: usize, rng: &mut VarRng) -> Result<Tensor> {
    let (b, l, v) = logits.dims3()?;
    let data = flat_f32(logits)?;

    let mut out = Vec::with_capacity(b * l * num_samples);
    for row in data.chunks(v) {
        let probs = softmax_f64(row);
        for _ in 0..num_samples {
            out.push(categorical_index(&probs, rng)? as u32);
        }
    }
    Ok(Tensor::from_vec(out, (b, l, num_samples), logits.device())?)
}

/// Pick an index proportionally to non-negative `weights` by walking the CDF.
pub fn categorical_index(weights: &[f64], rng: &mut VarRng) -> Result<usize> {
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(Error::shape(format!(
            "cannot sample from weights summing to {total}"
        )));
    }

    let target = rng.random::<f64>() * total;
    let mut cumulative = 0.0f64;
    for (i, &w) in weights.iter().enumerate() {
        cumulative += w;
        if target < cumulative {
            return Ok(i);
        }
    }
    // Rounding: fall back to the last index with mass.
    Ok(weights.iter().rposition(|&w| w > 0.0).unwrap_or(0))
}

/// Gumbel-softmax over the last dimension.
///
/// `softmax((logits + g) / tau)` with `g = -ln(Exp(1))` drawn from `rng`.
/// With `hard`, the forward value is the one-hot argmax while gradients
/// follow the soft sample.
pub fn gumbel_softmax(logits: &Tensor, tau: f64, hard: bool, rng: &mut VarRng) -> Result<Tensor> {
    let dims = logits.dims().to_vec();
    let n = logits.elem_count();
    let gumbels: Vec<f32> = (0..n)
        .map(|_| {
            let u: f64 = rng.random();
            let exponential = -(1.0 - u).ln();
            -(exponential.max(f64::MIN_POSITIVE).ln()) as f32
        })
        .collect();
    let gumbels = Tensor::from_vec(gumbels, dims.as_slice(), logits.device())?;

    let logits = logits.to_dtype(DType::F32)?;
    let y_soft = candle_nn::ops::softmax(&((logits + gumbels)? / tau)?, D::Minus1)?;
    if !hard {
        return Ok(y_soft);
    }

    let index = y_soft.argmax_keepdim(D::Minus1)?;
    let classes = *dims.last().unwrap_or(&1);
    let y_hard = one_hot(&index, classes, y_soft.device())?;
    Ok(((y_hard - y_soft.detach())? + &y_soft)?)
}

/// One-hot encode `[.., 1]` u32 indices into `[.., classes]` f32.
fn one_hot(index: &Tensor, classes: usize, device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = index.flatten_all()?.to_vec1()?;
    let mut data = vec![0f32; idx.len() * classes];
    for (row, &i) in idx.iter().enumerate() {
        data[row * classes + i as usize] = 1.0;
    }
    let mut dims = index.dims().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = classes;
    }
    Ok(Tensor::from_vec(data, dims.as_slice(), device)?)
}

fn flat_f32(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
}

fn softmax_f64(row: &[f32]) -> Vec<f64> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exp: Vec<f64> = row.iter().map(|&x| (x as f64 - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}
