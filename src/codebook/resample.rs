//! Separable 2-D resampling of `[B, C, H, W]` feature maps.
//!
//! Each axis is a dense `[out, in]` weight matrix, so a resize is two
//! matmuls: `Mh · x · Mwᵀ`.
//!
//! - bicubic: cubic convolution, `A = -0.75`, half-pixel centres, border taps clamped
//! - area: adaptive average pooling

use candle_core::{Device, Tensor};

use crate::Result;

const CUBIC_A: f64 = -0.75;

fn cubic_near(t: f64) -> f64 {
    ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
}

fn cubic_far(t: f64) -> f64 {
    ((CUBIC_A * t - 5.0 * CUBIC_A) * t + 8.0 * CUBIC_A) * t - 4.0 * CUBIC_A
}

/// `[out, in]` bicubic interpolation weights.
pub fn bicubic_weights(in_len: usize, out_len: usize) -> Vec<f32> {
    let mut w = vec![0f32; out_len * in_len];
    let scale = in_len as f64 / out_len as f64;
    let last = in_len as i64 - 1;
    for i in 0..out_len {
        let src = (i as f64 + 0.5) * scale - 0.5;
        let floor = src.floor();
        let t = src - floor;
        let base = floor as i64;
        let taps = [
            (base - 1, cubic_far(t + 1.0)),
            (base, cubic_near(t)),
            (base + 1, cubic_near(1.0 - t)),
            (base + 2, cubic_far(2.0 - t)),
        ];
        for (j, coeff) in taps {
            let j = j.clamp(0, last) as usize;
            w[i * in_len + j] += coeff as f32;
        }
    }
    w
}

/// `[out, in]` adaptive average pooling weights.
pub fn area_weights(in_len: usize, out_len: usize) -> Vec<f32> {
    let mut w = vec![0f32; out_len * in_len];
    for i in 0..out_len {
        let start = (i * in_len) / out_len;
        let end = ((i + 1) * in_len).div_ceil(out_len);
        let norm = 1.0 / (end - start) as f32;
        for j in start..end {
            w[i * in_len + j] = norm;
        }
    }
    w
}

fn apply(x: &Tensor, rows: Vec<f32>, cols: Vec<f32>, out: (usize, usize)) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let (oh, ow) = out;
    let device: &Device = x.device();
    // [in, out] so each axis is a plain 2-D matmul.
    let mh = Tensor::from_vec(rows, (oh, h), device)?.to_dtype(x.dtype())?.t()?.contiguous()?;
    let mw = Tensor::from_vec(cols, (ow, w), device)?.to_dtype(x.dtype())?.t()?.contiguous()?;

    let y = x.contiguous()?.reshape((b * c * h, w))?.matmul(&mw)?; // [BCh, ow]
    let y = y
        .reshape((b * c, h, ow))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b * c * ow, h))?
        .matmul(&mh)?; // [BC·ow, oh]
    Ok(y
        .reshape((b * c, ow, oh))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, c, oh, ow))?)
}

/// Bicubic resize of `[B, C, H, W]` to `[B, C, oh, ow]`.
pub fn bicubic(x: &Tensor, out: (usize, usize)) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if (h, w) == out {
        return Ok(x.clone());
    }
    apply(x, bicubic_weights(h, out.0), bicubic_weights(w, out.1), out)
}

/// Area (average) resize of `[B, C, H, W]` to `[B, C, oh, ow]`.
pub fn area(x: &Tensor, out: (usize, usize)) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if (h, w) == out {
        return Ok(x.clone());
    }
    apply(x, area_weights(h, out.0), area_weights(w, out.1), out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn bicubic_same_size_weights_are_identity() {
        let w = bicubic_weights(5, 5);
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((w[i * 5 + j] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn bicubic_rows_sum_to_one() {
        for (inp, out) in [(1, 4), (2, 16), (3, 7), (13, 16)] {
            let w = bicubic_weights(inp, out);
            for row in w.chunks(inp) {
                let s: f32 = row.iter().sum();
                assert!((s - 1.0).abs() < 1e-5, "{inp}->{out}: row sums to {s}");
            }
        }
    }

    #[test]
    fn area_of_constant_map_is_constant() {
        let x = (Tensor::ones((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap() * 2.5).unwrap();
        for pn in [1, 3, 5, 10, 13] {
            let y = area(&x, (pn, pn)).unwrap();
            assert_eq!(y.dims(), &[2, 3, pn, pn]);
            let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
            assert!(vals.iter().all(|v| (v - 2.5).abs() < 1e-5));
        }
    }

    #[test]
    fn area_averages_blocks() {
        let x = Tensor::new(&[[[[1f32, 2.0], [3.0, 4.0]]]], &Device::Cpu).unwrap();
        let y: f32 = area(&x, (1, 1))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!((y - 2.5).abs() < 1e-6);
    }

    #[test]
    fn bicubic_upsamples_single_pixel_to_constant() {
        let x = Tensor::new(&[[[[7f32]]]], &Device::Cpu).unwrap();
        let y = bicubic(&x, (4, 4)).unwrap();
        assert_eq!(y.dims(), &[1, 1, 4, 4]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| (v - 7.0).abs() < 1e-5));
    }
}
