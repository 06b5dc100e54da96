//! Dense spatial refiner
//!
//! Fully connected CRF with Gaussian pairwise potentials (Krähenbühl & Koltun
//! 2011) used to sharpen coarse class probabilities along image edges. Two
//! kernels are combined under a Potts compatibility:
//!
//! - appearance-free smoothness on pixel position `(x/σxy, y/σxy)`
//! - bilateral on position and colour `(x/σxy, y/σxy, r/σrgb, g/σrgb, b/σrgb)`
//!
//! Mean-field inference runs on the CPU; kernels are evaluated with a
//! [`Permutohedral`] lattice.

pub mod lattice;

use candle_core::{DType, Device, Tensor};

use crate::config::CrfConfig;
use crate::error::{Result, StegoError};
use crate::preprocess::to_rgb8;

pub use lattice::Permutohedral;

/// Lower clip applied to probabilities before taking the negative log.
pub const UNARY_MIN_PROB: f32 = 1e-5;

/// Unary energies `-ln(clamp(p, 1e-5, 1))`.
pub fn unary_from_probs(probs: &[f32]) -> Vec<f32> {
    probs
        .iter()
        .map(|&p| -p.clamp(UNARY_MIN_PROB, 1.0).ln())
        .collect()
}

/// In-place softmax over consecutive rows of `c` values.
fn softmax_rows(x: &mut [f32], c: usize) {
    for row in x.chunks_exact_mut(c) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// Gaussian kernel with symmetric normalization:
/// `K(Q) = n ⊙ lattice(n ⊙ Q)` where `n = 1 / sqrt(lattice(1))`.
struct NormalizedKernel {
    lattice: Permutohedral,
    norm: Vec<f32>,
    weight: f32,
}

impl NormalizedKernel {
    fn new(features: &[f32], d: usize, weight: f32) -> Result<Self> {
        let lattice = Permutohedral::new(features, d)?;
        let mass = lattice.compute(&vec![1.0; lattice.n_points()], 1)?;
        let norm = mass.iter().map(|m| 1.0 / (m + 1e-20).sqrt()).collect();
        Ok(Self {
            lattice,
            norm,
            weight,
        })
    }

    /// Add `weight * K(q)` to `energy`.
    fn accumulate(&self, q: &[f32], c: usize, energy: &mut [f32]) -> Result<()> {
        let mut scaled = q.to_vec();
        for (row, n) in scaled.chunks_exact_mut(c).zip(&self.norm) {
            row.iter_mut().for_each(|v| *v *= n);
        }
        let filtered = self.lattice.compute(&scaled, c)?;
        for ((e_row, f_row), n) in energy
            .chunks_exact_mut(c)
            .zip(filtered.chunks_exact(c))
            .zip(&self.norm)
        {
            for (e, f) in e_row.iter_mut().zip(f_row) {
                *e += self.weight * n * f;
            }
        }
        Ok(())
    }
}

/// Dense CRF postprocessor.
#[derive(Debug, Clone)]
pub struct DenseCrf {
    config: CrfConfig,
}

impl DenseCrf {
    pub fn new(config: CrfConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    /// Mean-field inference on raw buffers.
    ///
    /// # Arguments
    /// * `rgb` - Interleaved 8-bit RGB, `h * w * 3` bytes
    /// * `probs` - Pixel-major class probabilities, `h * w * c` values
    ///
    /// # Returns
    /// Pixel-major marginals `Q`, `h * w * c` values, each row summing to 1
    pub fn inference(
        &self,
        rgb: &[u8],
        probs: &[f32],
        h: usize,
        w: usize,
        c: usize,
    ) -> Result<Vec<f32>> {
        let n = h * w;
        if rgb.len() != n * 3 {
            return Err(StegoError::shape_mismatch(n * 3, rgb.len()));
        }
        if probs.len() != n * c {
            return Err(StegoError::shape_mismatch(n * c, probs.len()));
        }
        let cfg = &self.config;

        let mut gaussian = Vec::with_capacity(n * 2);
        let mut bilateral = Vec::with_capacity(n * 5);
        for y in 0..h {
            for x in 0..w {
                gaussian.push(x as f32 / cfg.pos_xy_std);
                gaussian.push(y as f32 / cfg.pos_xy_std);

                bilateral.push(x as f32 / cfg.bi_xy_std);
                bilateral.push(y as f32 / cfg.bi_xy_std);
                let p = &rgb[(y * w + x) * 3..(y * w + x) * 3 + 3];
                bilateral.extend(p.iter().map(|&v| v as f32 / cfg.bi_rgb_std));
            }
        }
        let kernels = [
            NormalizedKernel::new(&gaussian, 2, cfg.pos_w)?,
            NormalizedKernel::new(&bilateral, 5, cfg.bi_w)?,
        ];

        let unary = unary_from_probs(probs);
        let mut q: Vec<f32> = unary.iter().map(|u| -u).collect();
        softmax_rows(&mut q, c);

        for _ in 0..cfg.crf_max_iter {
            let mut energy: Vec<f32> = unary.iter().map(|u| -u).collect();
            for kernel in &kernels {
                kernel.accumulate(&q, c, &mut energy)?;
            }
            softmax_rows(&mut energy, c);
            q = energy;
        }
        Ok(q)
    }

    /// Refined marginals for one image.
    ///
    /// # Arguments
    /// * `image` - ImageNet-normalized image [3, H, W]
    /// * `probs` - Class probabilities [C, h, w], bilinearly upsampled to H×W
    ///
    /// # Returns
    /// Marginals [C, H, W] (f32, CPU)
    pub fn refine_probs(&self, image: &Tensor, probs: &Tensor) -> Result<Tensor> {
        let (rgb, h, w) = to_rgb8(image)?;
        let (c, _, _) = probs.dims3()?;

        let probs = probs
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .unsqueeze(0)?
            .upsample_bilinear2d(h, w, false)?
            .squeeze(0)?;
        let pixel_major: Vec<f32> = probs
            .permute((1, 2, 0))?
            .flatten_all()?
            .to_vec1()?;

        let q = self.inference(&rgb, &pixel_major, h, w, c)?;
        let q = Tensor::from_vec(q, (h, w, c), &Device::Cpu)?.permute((2, 0, 1))?;
        Ok(q.contiguous()?)
    }

    /// Refined per-pixel labels [H, W] (u32) for one image.
    pub fn refine(&self, image: &Tensor, probs: &Tensor) -> Result<Tensor> {
        Ok(self.refine_probs(image, probs)?.argmax(0)?)
    }

    /// [`DenseCrf::refine`] over a batch: images [B, 3, H, W] and
    /// probabilities [B, C, h, w] give labels [B, H, W].
    pub fn refine_batch(&self, images: &Tensor, probs: &Tensor) -> Result<Tensor> {
        let (b, _, _, _) = images.dims4()?;
        let (b2, _, _, _) = probs.dims4()?;
        if b != b2 {
            return Err(StegoError::precondition(format!(
                "CRF got {b} images but {b2} probability maps"
            )));
        }
        let labels = (0..b)
            .map(|i| self.refine(&images.get(i)?, &probs.get(i)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&labels, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::normalize;

    fn flat_image(h: usize, w: usize) -> Tensor {
        normalize(&Tensor::full(0.5f32, (3, h, w), &Device::Cpu).unwrap()).unwrap()
    }

    /// Left half black, right half white.
    fn split_image(h: usize, w: usize) -> Tensor {
        let mut data = vec![0f32; 3 * h * w];
        for c in 0..3 {
            for y in 0..h {
                for x in w / 2..w {
                    data[c * h * w + y * w + x] = 1.0;
                }
            }
        }
        normalize(&Tensor::from_vec(data, (3, h, w), &Device::Cpu).unwrap()).unwrap()
    }

    fn labels(t: &Tensor) -> Vec<u32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_unary_is_finite_for_zero_probabilities() {
        let unary = unary_from_probs(&[0.0, 1.0, 0.5]);
        assert!(unary.iter().all(|u| u.is_finite()));
        assert!((unary[0] - 11.512925).abs() < 1e-4);
        assert_eq!(unary[1], 0.0);
    }

    #[test]
    fn test_uniform_probabilities_give_valid_labels() {
        let crf = DenseCrf::new(CrfConfig::default()).unwrap();
        let probs = Tensor::full(0.25f32, (4, 3, 3), &Device::Cpu).unwrap();
        let out = crf.refine(&flat_image(12, 10), &probs).unwrap();
        assert_eq!(out.dims(), &[12, 10]);
        assert!(labels(&out).iter().all(|&l| l < 4));
    }

    #[test]
    fn test_marginals_are_distributions() {
        let crf = DenseCrf::new(CrfConfig::default()).unwrap();
        let probs = candle_nn::ops::softmax(
            &Tensor::randn(0f32, 1.0, (3, 4, 4), &Device::Cpu).unwrap(),
            0,
        )
        .unwrap();
        let q = crf.refine_probs(&split_image(8, 8), &probs).unwrap();
        assert_eq!(q.dims(), &[3, 8, 8]);
        let sums: Vec<f32> = q.sum(0).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_confident_segmentation_is_preserved() {
        let crf = DenseCrf::new(CrfConfig::default()).unwrap();
        let (h, w) = (8, 8);
        // Class 0 on the left, class 1 on the right, matching the image edge
        let mut data = vec![0f32; 2 * h * w];
        for y in 0..h {
            for x in 0..w {
                let left = x < w / 2;
                data[y * w + x] = if left { 0.95 } else { 0.05 };
                data[h * w + y * w + x] = if left { 0.05 } else { 0.95 };
            }
        }
        let probs = Tensor::from_vec(data, (2, h, w), &Device::Cpu).unwrap();
        let out = labels(&crf.refine(&split_image(h, w), &probs).unwrap());
        for y in 0..h {
            for x in 0..w {
                let expected = u32::from(x >= w / 2);
                assert_eq!(out[y * w + x], expected, "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_zero_iterations_is_argmax() {
        let config = CrfConfig {
            crf_max_iter: 0,
            ..CrfConfig::default()
        };
        let crf = DenseCrf::new(config).unwrap();
        let probs = candle_nn::ops::softmax(
            &Tensor::randn(0f32, 2.0, (5, 6, 6), &Device::Cpu).unwrap(),
            0,
        )
        .unwrap();
        let refined = labels(&crf.refine(&flat_image(6, 6), &probs).unwrap());
        let argmax = labels(&probs.argmax(0).unwrap());
        assert_eq!(refined, argmax);
    }

    #[test]
    fn test_one_hot_input_survives() {
        let crf = DenseCrf::new(CrfConfig::default()).unwrap();
        let mut data = vec![0f32; 3 * 4 * 4];
        data[2 * 16..].iter_mut().for_each(|v| *v = 1.0);
        let probs = Tensor::from_vec(data, (3, 4, 4), &Device::Cpu).unwrap();
        let out = labels(&crf.refine(&flat_image(4, 4), &probs).unwrap());
        assert!(out.iter().all(|&l| l == 2));
    }

    #[test]
    fn test_batch() {
        let crf = DenseCrf::new(CrfConfig::default()).unwrap();
        let images = Tensor::stack(&[flat_image(8, 8), split_image(8, 8)], 0).unwrap();
        let probs = Tensor::full(0.5f32, (2, 2, 2, 2), &Device::Cpu).unwrap();
        let out = crf.refine_batch(&images, &probs).unwrap();
        assert_eq!(out.dims(), &[2, 8, 8]);

        let probs = Tensor::full(0.5f32, (3, 2, 2, 2), &Device::Cpu).unwrap();
        assert!(matches!(
            crf.refine_batch(&images, &probs),
            Err(StegoError::Precondition { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CrfConfig {
            bi_rgb_std: 0.0,
            ..CrfConfig::default()
        };
        assert!(DenseCrf::new(config).is_err());
    }
}
