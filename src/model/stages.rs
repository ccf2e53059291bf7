//! Stage descriptor: how the flattened sequence splits into resolutions.
//!
//! Stage `i` has side `pn_i` and owns positions `[begin_i, end_i)` with
//! `end_i - begin_i = pn_i²`. All stages together cover `[0, L)`.

use candle_core::{Device, Tensor};

use crate::{Error, Result};

/// Precomputed stage bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    patch_nums: Vec<usize>,
    begin_ends: Vec<(usize, usize)>,
    levels: Vec<u32>,
}

impl StageLayout {
    /// Build from the stage side lengths.
    ///
    /// The list must be non-empty, all sides positive and non-decreasing.
    pub fn new(patch_nums: &[usize]) -> Result<Self> {
        if patch_nums.is_empty() {
            return Err(Error::config("stage list is empty"));
        }
        if patch_nums.contains(&0) {
            return Err(Error::config(format!(
                "stage sides must be positive: {patch_nums:?}"
            )));
        }
        if patch_nums.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::config(format!(
                "stage sides must be non-decreasing: {patch_nums:?}"
            )));
        }

        let mut begin_ends = Vec::with_capacity(patch_nums.len());
        let mut levels = Vec::new();
        let mut cur = 0;
        for (si, &pn) in patch_nums.iter().enumerate() {
            begin_ends.push((cur, cur + pn * pn));
            levels.extend(std::iter::repeat_n(si as u32, pn * pn));
            cur += pn * pn;
        }

        Ok(Self {
            patch_nums: patch_nums.to_vec(),
            begin_ends,
            levels,
        })
    }

    pub fn patch_nums(&self) -> &[usize] {
        &self.patch_nums
    }

    pub fn num_stages(&self) -> usize {
        self.patch_nums.len()
    }

    /// Total sequence length `L`.
    pub fn total_len(&self) -> usize {
        self.levels.len()
    }

    /// Positions of the first stage.
    pub fn first_len(&self) -> usize {
        self.patch_nums[0] * self.patch_nums[0]
    }

    /// Finest side length `R`.
    pub fn max_side(&self) -> usize {
        self.patch_nums[self.patch_nums.len() - 1]
    }

    pub fn begin_ends(&self) -> &[(usize, usize)] {
        &self.begin_ends
    }

    /// `[begin, end)` of stage `si`.
    pub fn range(&self, si: usize) -> (usize, usize) {
        self.begin_ends[si]
    }

    /// Stage index of every position.
    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    /// Stage index of one position.
    pub fn level_of(&self, pos: usize) -> usize {
        self.levels[pos] as usize
    }

    /// Progress through the pyramid, `si / (num_stages - 1)`.
    ///
    /// A single-stage pyramid is treated as the first stage (0).
    pub fn ratio(&self, si: usize) -> f64 {
        match self.num_stages() {
            1 => 0.0,
            n => si as f64 / (n - 1) as f64,
        }
    }

    /// Classifier-free guidance strength at stage `si`: ramps from 0 at the
    /// first stage to `cfg_scale` at the last.
    pub fn guidance_ratio(&self, cfg_scale: f64, si: usize) -> f64 {
        cfg_scale * self.ratio(si)
    }

    /// Level index as a `[1, L]` u32 tensor.
    pub fn level_tensor(&self, device: &Device) -> Result<Tensor> {
        let len = self.levels.len();
        Ok(Tensor::from_vec(self.levels.clone(), (1, len), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pyramid_length() {
        let layout = StageLayout::new(&[1, 2, 3, 4, 5, 6, 8, 10, 13, 16]).unwrap();
        assert_eq!(layout.total_len(), 680);
        assert_eq!(layout.first_len(), 1);
        assert_eq!(layout.max_side(), 16);
    }

    #[test]
    fn begin_ends_partition_sequence() {
        for pns in [vec![1], vec![1, 2, 3], vec![2, 2, 4], vec![1, 2, 3, 4, 5, 6, 8]] {
            let layout = StageLayout::new(&pns).unwrap();
            let total: usize = pns.iter().map(|p| p * p).sum();
            assert_eq!(layout.total_len(), total);

            let mut expected_begin = 0;
            for (si, &(bg, ed)) in layout.begin_ends().iter().enumerate() {
                assert_eq!(bg, expected_begin, "gap or overlap at stage {si}");
                assert_eq!(ed - bg, pns[si] * pns[si]);
                expected_begin = ed;
            }
            assert_eq!(expected_begin, total);
        }
    }

    #[test]
    fn levels_follow_stages() {
        let layout = StageLayout::new(&[1, 2, 3]).unwrap();
        let expected: Vec<u32> = [0].into_iter().chain([1; 4]).chain([2; 9]).collect();
        assert_eq!(layout.levels(), expected.as_slice());
        assert_eq!(layout.level_of(0), 0);
        assert_eq!(layout.level_of(4), 1);
        assert_eq!(layout.level_of(5), 2);
    }

    #[test]
    fn guidance_ramps_from_zero_to_full() {
        let layout = StageLayout::new(&[1, 2, 3, 4]).unwrap();
        assert_eq!(layout.guidance_ratio(1.5, 0), 0.0);
        assert_eq!(layout.guidance_ratio(1.5, 3), 1.5);
        assert!((layout.guidance_ratio(1.5, 1) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_stage_lists() {
        assert!(matches!(StageLayout::new(&[]), Err(Error::Config(_))));
        assert!(matches!(StageLayout::new(&[1, 0]), Err(Error::Config(_))));
        assert!(matches!(StageLayout::new(&[2, 1]), Err(Error::Config(_))));
        // Equal neighbours are allowed.
        assert!(StageLayout::new(&[2, 2]).is_ok());
    }

    #[test]
    fn level_tensor_shape() {
        let layout = StageLayout::new(&[1, 2]).unwrap();
        let t = layout.level_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 5]);
        assert_eq!(t.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 1, 1, 1]]);
    }
}
