//! Stage-causal attention bias for teacher forcing.
//!
//! `M[p, q] = 0` when `stage(q) <= stage(p)`, `-inf` otherwise. Positions
//! inside one stage see each other because a stage is produced jointly.
//! Inference uses the KV cache instead and needs no mask.

use candle_core::{Device, Tensor};

use crate::Result;
use crate::model::StageLayout;

/// Precomputed `[1, 1, L, L]` additive bias.
#[derive(Debug, Clone)]
pub struct CausalStageMask {
    bias: Tensor,
    len: usize,
}

impl CausalStageMask {
    /// Build the full bias from a stage layout.
    pub fn new(layout: &StageLayout, device: &Device) -> Result<Self> {
        let levels = layout.levels();
        let len = levels.len();

        let mut data = vec![0f32; len * len];
        for (p, &lp) in levels.iter().enumerate() {
            for (q, &lq) in levels.iter().enumerate() {
                if lq > lp {
                    data[p * len + q] = f32::NEG_INFINITY;
                }
            }
        }

        let bias = Tensor::from_vec(data, (1, 1, len, len), device)?;
        Ok(Self { bias, len })
    }

    /// Full bias, `[1, 1, L, L]`.
    pub fn full(&self) -> &Tensor {
        &self.bias
    }

    /// Bias for the first `ed` positions, `[1, 1, ed, ed]`.
    pub fn prefix(&self, ed: usize) -> Result<Tensor> {
        if ed == self.len {
            return Ok(self.bias.clone());
        }
        Ok(self.bias.narrow(2, 0, ed)?.narrow(3, 0, ed)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_matches_stage_order() {
        let layout = StageLayout::new(&[1, 2, 3]).unwrap();
        let mask = CausalStageMask::new(&layout, &Device::Cpu).unwrap();
        assert_eq!(mask.full().dims(), &[1, 1, 14, 14]);

        let vals: Vec<Vec<f32>> = mask
            .full()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();
        for p in 0..14 {
            for q in 0..14 {
                let visible = layout.level_of(q) <= layout.level_of(p);
                if visible {
                    assert_eq!(vals[p][q], 0.0, "({p},{q}) should be visible");
                } else {
                    assert_eq!(vals[p][q], f32::NEG_INFINITY, "({p},{q}) should be masked");
                }
            }
        }
    }

    #[test]
    fn same_stage_positions_see_each_other() {
        let layout = StageLayout::new(&[1, 2]).unwrap();
        let mask = CausalStageMask::new(&layout, &Device::Cpu).unwrap();
        let vals: Vec<f32> = mask.full().flatten_all().unwrap().to_vec1().unwrap();
        // Row 1 (first position of stage 1) sees position 4 (last of stage 1).
        assert_eq!(vals[5 + 4], 0.0);
        // Row 0 (stage 0) does not see stage 1.
        assert_eq!(vals[1], f32::NEG_INFINITY);
    }

    #[test]
    fn prefix_slices_top_left() {
        let layout = StageLayout::new(&[1, 2, 3]).unwrap();
        let mask = CausalStageMask::new(&layout, &Device::Cpu).unwrap();
        let prefix = mask.prefix(5).unwrap();
        assert_eq!(prefix.dims(), &[1, 1, 5, 5]);
        // Nothing in the first two stages is masked against each other's past.
        let vals: Vec<f32> = prefix.flatten_all().unwrap().to_vec1().unwrap();
        let masked = vals.iter().filter(|v| v.is_infinite()).count();
        // Only row 0 masks the four stage-1 columns.
        assert_eq!(masked, 4);
    }
}
