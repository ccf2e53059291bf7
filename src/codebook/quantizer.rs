//! Multi-scale residual vector quantizer.
//!
//! A `[B, Cvae, R, R]` feature map is explained coarse to fine: each stage
//! quantizes the area-downsampled residual at its resolution, upsamples the
//! chosen codes back to `R`, refines them with a `phi` convolution and
//! subtracts them from the residual.

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

use super::Codebook;
use super::resample::{area, bicubic};
use crate::config::CodebookConfig;
use crate::model::StageLayout;
use crate::{Error, Result};

/// `phi(h) = (1 - r)·h + r·conv3x3(h)`, or the identity when `r ≈ 0`.
#[derive(Debug, Clone)]
struct Phi {
    conv: Option<Conv2d>,
    ratio: f64,
}

impl Phi {
    fn new(dim: usize, ratio: f64, vb: VarBuilder) -> Result<Self> {
        let ratio = ratio.abs();
        if ratio <= 1e-6 {
            return Ok(Self { conv: None, ratio });
        }
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: Some(candle_nn::conv2d(dim, dim, 3, cfg, vb)?),
            ratio,
        })
    }

    fn forward(&self, h: &Tensor) -> Result<Tensor> {
        match &self.conv {
            None => Ok(h.clone()),
            Some(conv) => {
                let refined = (conv.forward(h)? * self.ratio)?;
                Ok(((h * (1.0 - self.ratio))? + refined)?)
            }
        }
    }
}

/// Tick positions along `[0, 1]` for `k` partially shared convolutions.
fn phi_ticks(k: usize) -> Vec<f64> {
    let spread = if k == 4 { 1.0 / 3.0 } else { 0.5 };
    let margin = spread / k as f64;
    match k {
        1 => vec![0.5],
        _ => (0..k)
            .map(|i| margin + (1.0 - 2.0 * margin) * i as f64 / (k - 1) as f64)
            .collect(),
    }
}

/// Residual quantizer with `V` codes of width `Cvae`.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    /// `[V, Cvae]`
    embedding: Tensor,
    phis: Vec<Phi>,
    ticks: Vec<f64>,
    layout: StageLayout,
}

impl VectorQuantizer {
    /// Weight names follow the checkpoint layout: `embedding.weight` and
    /// `quant_resi.{k}` (one conv per stage), `quant_resi.qresi` (one shared
    /// conv) or `quant_resi.qresi_ls.{k}` (partially shared).
    pub fn new(cfg: &CodebookConfig, vb: VarBuilder) -> Result<Self> {
        let layout = StageLayout::new(&cfg.patch_nums)?;
        if cfg.vocab_size == 0 || cfg.codebook_dim == 0 {
            return Err(Error::config("codebook size and width must be positive"));
        }
        let embedding = vb.get_with_hints(
            (cfg.vocab_size, cfg.codebook_dim),
            "embedding.weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;

        let vb_resi = vb.pp("quant_resi");
        let dim = cfg.codebook_dim;
        let phis = match cfg.share_quant_resi {
            0 => (0..layout.num_stages())
                .map(|k| Phi::new(dim, cfg.quant_resi, vb_resi.pp(k.to_string())))
                .collect::<Result<Vec<_>>>()?,
            1 => vec![Phi::new(dim, cfg.quant_resi, vb_resi.pp("qresi"))?],
            k => (0..k)
                .map(|i| Phi::new(dim, cfg.quant_resi, vb_resi.pp("qresi_ls").pp(i.to_string())))
                .collect::<Result<Vec<_>>>()?,
        };
        let ticks = phi_ticks(phis.len());

        tracing::debug!(
            vocab = cfg.vocab_size,
            dim,
            phis = phis.len(),
            stages = layout.num_stages(),
            "built vector quantizer"
        );
        Ok(Self {
            embedding,
            phis,
            ticks,
            layout,
        })
    }

    /// Load the quantizer from one or more safetensors files.
    pub fn load(
        cfg: &CodebookConfig,
        weights: &[impl AsRef<Path>],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let paths: Vec<&Path> = weights.iter().map(AsRef::as_ref).collect();
        tracing::info!("Loading codebook weights from {:?}", paths);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&paths, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("codebook weights: {e}")))?
        };
        Self::new(cfg, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("codebook init: {e}")),
            other => other,
        })
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    /// Refinement for stage `si`: the conv whose tick is nearest `si / (SN - 1)`.
    fn phi(&self, si: usize, num_stages: usize) -> &Phi {
        let at = if num_stages > 1 {
            si as f64 / (num_stages - 1) as f64
        } else {
            0.0
        };
        let (best, _) = self.ticks.iter().enumerate().fold(
            (0usize, f64::INFINITY),
            |(best, dist), (i, &t)| {
                let d = (t - at).abs();
                if d < dist { (i, d) } else { (best, dist) }
            },
        );
        &self.phis[best]
    }

    /// Nearest code per row of `[N, Cvae]` features → `[N]` u32.
    fn nearest(&self, z: &Tensor) -> Result<Tensor> {
        let emb = self.embedding.to_dtype(DType::F32)?;
        let z = z.to_dtype(DType::F32)?;
        let z_sq = z.sqr()?.sum_keepdim(1)?; // [N, 1]
        let e_sq = emb.sqr()?.sum(1)?.unsqueeze(0)?; // [1, V]
        let cross = z.matmul(&emb.t()?)?; // [N, V]
        let dist = z_sq.broadcast_add(&e_sq)?.broadcast_sub(&(cross * 2.0)?)?;
        Ok(dist.argmin(D::Minus1)?)
    }

    /// Quantize `[B, Cvae, R, R]` features into per-stage `[B, pn²]` indices.
    pub fn encode(&self, f: &Tensor) -> Result<Vec<Tensor>> {
        let (b, c, h, w) = f.dims4()?;
        let r = self.layout.max_side();
        if c != self.dim() || h != r || w != r {
            return Err(Error::shape(format!(
                "expected [B, {}, {r}, {r}] features, got {:?}",
                self.dim(),
                f.dims()
            )));
        }

        let num_stages = self.layout.num_stages();
        let mut f_rest = f.detach();
        let mut out = Vec::with_capacity(num_stages);
        for (si, &pn) in self.layout.patch_nums().iter().enumerate() {
            let z = area(&f_rest, (pn, pn))?
                .permute((0, 2, 3, 1))?
                .reshape((b * pn * pn, c))?;
            let idx = self.nearest(&z)?;
            let codes = self
                .embedding
                .index_select(&idx, 0)?
                .reshape((b, pn, pn, c))?
                .permute((0, 3, 1, 2))?
                .contiguous()?;
            let h = self.phi(si, num_stages).forward(&bicubic(&codes, (r, r))?)?;
            f_rest = (f_rest - h)?;
            out.push(idx.reshape((b, pn * pn))?);
        }
        Ok(out)
    }
}

impl Codebook for VectorQuantizer {
    fn vocab_size(&self) -> usize {
        self.embedding.dims()[0]
    }

    fn dim(&self) -> usize {
        self.embedding.dims()[1]
    }

    fn embedding(&self) -> &Tensor {
        &self.embedding
    }

    fn next_stage_input(
        &self,
        si: usize,
        num_stages: usize,
        f_hat: &Tensor,
        patch: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (_, _, r, _) = f_hat.dims4()?;
        let (_, _, ph, pw) = patch.dims4()?;
        if num_stages != self.layout.num_stages()
            || si >= num_stages
            || r != self.layout.max_side()
            || (ph, pw) != (self.layout.patch_nums()[si], self.layout.patch_nums()[si])
        {
            return Err(Error::shape(format!(
                "stage {si}/{num_stages} with a {ph}x{pw} patch and {r}x{r} features does not fit stages {:?}",
                self.layout.patch_nums()
            )));
        }
        let phi = self.phi(si, num_stages);
        if si + 1 < num_stages {
            let h = phi.forward(&bicubic(patch, (r, r))?)?;
            let f_hat = (f_hat + h)?;
            let pn_next = self.layout.patch_nums()[si + 1];
            let next = area(&f_hat, (pn_next, pn_next))?;
            Ok((f_hat, next))
        } else {
            let f_hat = (f_hat + phi.forward(patch)?)?;
            Ok((f_hat.clone(), f_hat))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn build(patch_nums: Vec<usize>, share: usize, quant_resi: f64) -> (VarMap, VectorQuantizer) {
        let cfg = CodebookConfig {
            vocab_size: 16,
            codebook_dim: 4,
            patch_nums,
            quant_resi,
            share_quant_resi: share,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let vq = VectorQuantizer::new(&cfg, vb).unwrap();
        (varmap, vq)
    }

    #[test]
    fn ticks_match_sharing_layouts() {
        let t4 = phi_ticks(4);
        assert!((t4[0] - 1.0 / 12.0).abs() < 1e-12);
        assert!((t4[3] - 11.0 / 12.0).abs() < 1e-12);
        let t3 = phi_ticks(3);
        assert!((t3[0] - 1.0 / 6.0).abs() < 1e-12);
        assert!((t3[1] - 0.5).abs() < 1e-12);
        assert_eq!(phi_ticks(1), vec![0.5]);
    }

    #[test]
    fn weight_names_follow_sharing_mode() {
        let (varmap, _) = build(vec![1, 2, 3], 4, 0.5);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"embedding.weight".to_string()));
        assert!(names.contains(&"quant_resi.qresi_ls.3.weight".to_string()));

        let (varmap, _) = build(vec![1, 2, 3], 0, 0.5);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"quant_resi.2.bias".to_string()));

        let (varmap, _) = build(vec![1, 2, 3], 1, 0.5);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"quant_resi.qresi.weight".to_string()));
    }

    #[test]
    fn load_reads_saved_weights() {
        let (varmap, vq) = build(vec![1, 2], 1, 0.5);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vq.safetensors");
        varmap.save(&path).unwrap();

        let cfg = CodebookConfig {
            vocab_size: 16,
            codebook_dim: 4,
            patch_nums: vec![1, 2],
            quant_resi: 0.5,
            share_quant_resi: 1,
        };
        let loaded = VectorQuantizer::load(&cfg, &[&path], &Device::Cpu, DType::F32).unwrap();
        let a: Vec<Vec<f32>> = vq.embedding().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = loaded.embedding().to_vec2().unwrap();
        assert_eq!(a, b);

        let missing = dir.path().join("missing.safetensors");
        assert!(matches!(
            VectorQuantizer::load(&cfg, &[&missing], &Device::Cpu, DType::F32),
            Err(Error::WeightLoad(_))
        ));
    }

    #[test]
    fn phi_selection_spans_stages() {
        let (_varmap, vq) = build(vec![1, 2, 3, 4, 5, 6, 8, 10, 13, 16], 4, 0.5);
        assert!(std::ptr::eq(vq.phi(0, 10), &vq.phis[0]));
        assert!(std::ptr::eq(vq.phi(9, 10), &vq.phis[3]));
    }

    #[test]
    fn encode_recovers_codebook_rows() {
        let (_varmap, vq) = build(vec![1], 4, 0.5);
        for code in [0u32, 5, 15] {
            let row = vq.embedding().get(code as usize).unwrap();
            let f = row.reshape((1, 4, 1, 1)).unwrap();
            let idx = vq.encode(&f).unwrap();
            assert_eq!(idx.len(), 1);
            assert_eq!(idx[0].to_vec2::<u32>().unwrap(), vec![vec![code]]);
        }
    }

    #[test]
    fn encode_first_stage_of_constant_map() {
        let (_varmap, vq) = build(vec![1, 2, 3], 4, 0.5);
        let row = vq.embedding().get(9).unwrap();
        let f = row
            .reshape((1, 4, 1, 1))
            .unwrap()
            .broadcast_as((1, 4, 3, 3))
            .unwrap()
            .contiguous()
            .unwrap();
        let idx = vq.encode(&f).unwrap();
        assert_eq!(idx.len(), 3);
        assert_eq!(idx[0].to_vec2::<u32>().unwrap(), vec![vec![9]]);
        assert_eq!(idx[1].dims(), &[1, 4]);
        assert_eq!(idx[2].dims(), &[1, 9]);
    }

    #[test]
    fn next_stage_input_shapes() {
        let (_varmap, vq) = build(vec![1, 2, 3], 4, 0.5);
        let f_hat = Tensor::zeros((2, 4, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let patch = Tensor::randn(0f32, 1.0, (2, 4, 1, 1), &Device::Cpu).unwrap();
        let (f_hat, next) = vq.next_stage_input(0, 3, &f_hat, &patch).unwrap();
        assert_eq!(f_hat.dims(), &[2, 4, 3, 3]);
        assert_eq!(next.dims(), &[2, 4, 2, 2]);

        let patch = Tensor::randn(0f32, 1.0, (2, 4, 3, 3), &Device::Cpu).unwrap();
        let (f_hat, next) = vq.next_stage_input(2, 3, &f_hat, &patch).unwrap();
        let diff: f32 = (f_hat - next).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn next_stage_input_rejects_other_pyramids() {
        let (_varmap, vq) = build(vec![1, 2], 4, 0.5);
        let f_hat = Tensor::zeros((1, 4, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let patch = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        // A three-stage caller at its second stage.
        assert!(matches!(
            vq.next_stage_input(1, 3, &f_hat, &patch),
            Err(Error::Shape(_))
        ));

        let f_hat = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let wrong_patch = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            vq.next_stage_input(0, 2, &f_hat, &wrong_patch),
            Err(Error::Shape(_))
        ));
        assert!(matches!(
            vq.next_stage_input(2, 2, &f_hat, &wrong_patch),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn identity_phi_accumulates_patches() {
        // r = 0: phi is the identity, so the last stage just adds the patch.
        let (_varmap, vq) = build(vec![1, 2], 4, 0.0);
        let f_hat = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let patch = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let (f_hat, _) = vq.next_stage_input(1, 2, &f_hat, &patch).unwrap();
        let vals: Vec<f32> = f_hat.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn encode_rejects_wrong_resolution() {
        let (_varmap, vq) = build(vec![1, 2], 4, 0.5);
        let f = Tensor::zeros((1, 4, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(vq.encode(&f), Err(Error::Shape(_))));
    }
}
