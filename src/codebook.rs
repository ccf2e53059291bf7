//! Codebook collaborator: index ↔ feature lookup and next-stage synthesis.
//!
//! The model never owns a codebook. Generation and teacher forcing take one
//! through the [`Codebook`] trait; [`VectorQuantizer`] is the multi-scale
//! residual quantizer the pretrained checkpoints ship with.

pub mod quantizer;
pub mod resample;

use candle_core::Tensor;

use crate::{Error, Result};

pub use quantizer::VectorQuantizer;

/// Discrete feature table plus the coarse-to-fine accumulation rule.
pub trait Codebook {
    /// Number of codes `V`.
    fn vocab_size(&self) -> usize;

    /// Feature width `Cvae`.
    fn dim(&self) -> usize;

    /// `[V, Cvae]` code table.
    fn embedding(&self) -> &Tensor;

    /// `[B, l]` indices → `[B, l, Cvae]` features.
    fn embed(&self, indices: &Tensor) -> Result<Tensor> {
        let (b, l) = indices.dims2()?;
        let flat = indices.flatten_all()?;
        Ok(self
            .embedding()
            .index_select(&flat, 0)?
            .reshape((b, l, self.dim()))?)
    }

    /// `[B, l, V]` probabilities → `[B, l, Cvae]` expected features.
    fn embed_soft(&self, probs: &Tensor) -> Result<Tensor> {
        let (b, l, v) = probs.dims3()?;
        let table = self.embedding().to_dtype(probs.dtype())?;
        Ok(probs
            .reshape((b * l, v))?
            .matmul(&table)?
            .reshape((b, l, self.dim()))?)
    }

    /// Fold stage `si`'s feature patch `[B, Cvae, pn, pn]` into the
    /// accumulated map `f_hat` `[B, Cvae, R, R]`.
    ///
    /// Returns `(f_hat', next)` where `next` is the input for stage `si + 1`
    /// at that stage's resolution (`f_hat'` itself after the last stage).
    fn next_stage_input(
        &self,
        si: usize,
        num_stages: usize,
        f_hat: &Tensor,
        patch: &Tensor,
    ) -> Result<(Tensor, Tensor)>;
}

/// Build the teacher-forcing input from ground-truth indices of every stage.
///
/// `gt_indices[si]` is `[B, pn_si²]`. Returns `[B, L - first_l, Cvae]`: the
/// accumulated features resampled to each stage after the first.
pub fn teacher_forcing_input(
    codebook: &dyn Codebook,
    gt_indices: &[Tensor],
    patch_nums: &[usize],
) -> Result<Tensor> {
    if gt_indices.len() != patch_nums.len() {
        return Err(Error::shape(format!(
            "expected indices for {} stages, got {}",
            patch_nums.len(),
            gt_indices.len()
        )));
    }
    let first = gt_indices
        .first()
        .ok_or_else(|| Error::shape("no stages given"))?;
    let b = first.dim(0)?;
    for (si, (indices, &pn)) in gt_indices.iter().zip(patch_nums).enumerate() {
        let (ib, il) = indices.dims2()?;
        if ib != b || il != pn * pn {
            return Err(Error::shape(format!(
                "stage {si} indices are [{ib}, {il}], expected [{b}, {}]",
                pn * pn
            )));
        }
    }
    let num_stages = patch_nums.len();
    let c = codebook.dim();
    let r = patch_nums[num_stages - 1];

    let mut f_hat = Tensor::zeros((b, c, r, r), codebook.embedding().dtype(), first.device())?;
    let mut inputs = Vec::with_capacity(num_stages.saturating_sub(1));
    for si in 0..num_stages - 1 {
        let pn = patch_nums[si];
        let patch = codebook
            .embed(&gt_indices[si])?
            .transpose(1, 2)?
            .reshape((b, c, pn, pn))?;
        let (next_f_hat, next) = codebook.next_stage_input(si, num_stages, &f_hat, &patch)?;
        f_hat = next_f_hat;
        let pn_next = patch_nums[si + 1];
        inputs.push(next.reshape((b, c, pn_next * pn_next))?.transpose(1, 2)?);
    }

    if inputs.is_empty() {
        return Ok(Tensor::zeros((b, 0, c), f_hat.dtype(), f_hat.device())?);
    }
    Ok(Tensor::cat(&inputs, 1)?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodebookConfig;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn quantizer(patch_nums: Vec<usize>) -> (VarMap, VectorQuantizer) {
        let cfg = CodebookConfig {
            vocab_size: 16,
            codebook_dim: 4,
            patch_nums,
            ..CodebookConfig::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let vq = VectorQuantizer::new(&cfg, vb).unwrap();
        (varmap, vq)
    }

    #[test]
    fn embed_looks_up_rows() {
        let (_varmap, vq) = quantizer(vec![1, 2]);
        let idx = Tensor::new(&[[3u32, 7]], &Device::Cpu).unwrap();
        let feats = vq.embed(&idx).unwrap();
        assert_eq!(feats.dims(), &[1, 2, 4]);
        let row7: Vec<f32> = vq.embedding().get(7).unwrap().to_vec1().unwrap();
        let got: Vec<f32> = feats.get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        assert_eq!(row7, got);
    }

    #[test]
    fn embed_soft_of_one_hot_equals_embed() {
        let (_varmap, vq) = quantizer(vec![1, 2]);
        let mut probs = vec![0f32; 16];
        probs[5] = 1.0;
        let probs = Tensor::from_vec(probs, (1, 1, 16), &Device::Cpu).unwrap();
        let soft = vq.embed_soft(&probs).unwrap();
        let hard = vq.embed(&Tensor::new(&[[5u32]], &Device::Cpu).unwrap()).unwrap();
        let diff: f32 = (soft - hard).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn teacher_forcing_input_covers_later_stages() {
        let (_varmap, vq) = quantizer(vec![1, 2, 3]);
        let gt = vec![
            Tensor::new(&[[1u32], [2]], &Device::Cpu).unwrap(),
            Tensor::new(&[[0u32, 1, 2, 3], [4, 5, 6, 7]], &Device::Cpu).unwrap(),
            Tensor::zeros((2, 9), DType::U32, &Device::Cpu).unwrap(),
        ];
        let x = teacher_forcing_input(&vq, &gt, &[1, 2, 3]).unwrap();
        assert_eq!(x.dims(), &[2, 4 + 9, 4]);
    }

    #[test]
    fn teacher_forcing_input_rejects_wrong_lengths() {
        let (_varmap, vq) = quantizer(vec![1, 2]);
        let gt = vec![
            Tensor::new(&[[1u32]], &Device::Cpu).unwrap(),
            Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap(),
        ];
        assert!(matches!(
            teacher_forcing_input(&vq, &gt, &[1, 2]),
            Err(Error::Shape(_))
        ));
        assert!(matches!(
            teacher_forcing_input(&vq, &gt[..1], &[1, 2]),
            Err(Error::Shape(_))
        ));
    }
}
