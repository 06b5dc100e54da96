//! Correlation sampler
//!
//! Draws random normalized coordinates per image and bilinearly samples dense
//! maps at those coordinates. The same coordinate set is used for the feature
//! map and the code map of an image so that both describe identical locations.

use candle_core::{DType, Device, IndexOp, Tensor};
use rand::Rng;

use crate::error::{Result, StegoError};

/// Draw a `[batch, samples, samples, 2]` grid of `(x, y)` coordinates,
/// uniform in `[-1, 1)` on both axes.
pub fn random_coords<R: Rng + ?Sized>(
    batch: usize,
    samples: usize,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let n = batch * samples * samples * 2;
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Ok(Tensor::from_vec(data, (batch, samples, samples, 2), device)?)
}

/// Bilinearly sample `input` at `coords`.
///
/// # Arguments
/// * `input` - Dense map [N, C, H, W]
/// * `coords` - Grid [N, S_h, S_w, 2] holding `(x, y)` in [-1, 1]
///
/// # Returns
/// Sampled vectors [N, C, S_h, S_w]
///
/// Coordinates follow `align_corners=True` semantics: -1 and 1 land on the
/// centers of the first and last pixel. Out-of-range coordinates are clamped
/// to the edge (border padding), so every output is a convex combination of
/// in-bounds pixels. Gradients flow into `input`, not into `coords`.
pub fn sample(input: &Tensor, coords: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (n_grid, s_h, s_w, two) = coords.dims4()?;
    if n_grid != n {
        return Err(StegoError::shape_mismatch(n, n_grid));
    }
    if two != 2 {
        return Err(StegoError::shape_mismatch(2, two));
    }
    let dtype = input.dtype();
    let coords = coords.to_dtype(DType::F32)?;

    // [-1, 1] -> [0, W-1] and [0, H-1], clamped to the border
    let x = ((coords.i((.., .., .., 0))? + 1.0)? * ((w - 1) as f64 / 2.0))?
        .clamp(0.0, (w - 1) as f64)?;
    let y = ((coords.i((.., .., .., 1))? + 1.0)? * ((h - 1) as f64 / 2.0))?
        .clamp(0.0, (h - 1) as f64)?;

    let x0 = x.floor()?;
    let y0 = y.floor()?;
    let x1 = (&x0 + 1.0)?.clamp(0.0, (w - 1) as f64)?;
    let y1 = (&y0 + 1.0)?.clamp(0.0, (h - 1) as f64)?;

    // Fractional offsets; at the last pixel x == x0 so the far corner gets no weight
    let fx = (&x - &x0)?;
    let fy = (&y - &y0)?;
    let gx = fx.affine(-1.0, 1.0)?;
    let gy = fy.affine(-1.0, 1.0)?;

    let wa = (&gx * &gy)?;
    let wb = (&fx * &gy)?;
    let wc = (&gx * &fy)?;
    let wd = (&fx * &fy)?;

    let input_flat = input.reshape((n, c, h * w))?;
    let gather = |yy: &Tensor, xx: &Tensor| -> Result<Tensor> {
        let idx = ((yy * w as f64)? + xx)?
            .to_dtype(DType::I64)?
            .reshape((n, 1, s_h * s_w))?
            .repeat((1, c, 1))?;
        Ok(input_flat.gather(&idx, 2)?.reshape((n, c, s_h, s_w))?)
    };

    let va = gather(&y0, &x0)?;
    let vb = gather(&y0, &x1)?;
    let vc = gather(&y1, &x0)?;
    let vd = gather(&y1, &x1)?;

    let weight = |t: &Tensor| -> Result<Tensor> { Ok(t.unsqueeze(1)?.to_dtype(dtype)?) };

    let result = va
        .broadcast_mul(&weight(&wa)?)?
        .add(&vb.broadcast_mul(&weight(&wb)?)?)?
        .add(&vc.broadcast_mul(&weight(&wc)?)?)?
        .add(&vd.broadcast_mul(&weight(&wd)?)?)?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_one(input: &Tensor, x: f32, y: f32) -> f32 {
        let grid = Tensor::from_vec(vec![x, y], (1, 1, 1, 2), &Device::Cpu).unwrap();
        sample(input, &grid)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0]
    }

    #[test]
    fn test_sample_align_corners_true() {
        // 4x4 image with values 0-15
        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let input = Tensor::from_vec(data, (1, 1, 4, 4), &Device::Cpu).unwrap();

        // Corners map exactly onto corner pixels
        assert!((sample_one(&input, -1.0, -1.0) - 0.0).abs() < 1e-5);
        assert!((sample_one(&input, 1.0, -1.0) - 3.0).abs() < 1e-5);
        assert!((sample_one(&input, -1.0, 1.0) - 12.0).abs() < 1e-5);
        assert!((sample_one(&input, 1.0, 1.0) - 15.0).abs() < 1e-5);

        // Center (1.5, 1.5) averages pixels 5, 6, 9, 10
        assert!((sample_one(&input, 0.0, 0.0) - 7.5).abs() < 1e-5);
    }

    #[test]
    fn test_sample_clamps_to_edge() {
        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let input = Tensor::from_vec(data, (1, 1, 4, 4), &Device::Cpu).unwrap();

        assert!((sample_one(&input, -3.0, -3.0) - 0.0).abs() < 1e-5);
        assert!((sample_one(&input, 5.0, 5.0) - 15.0).abs() < 1e-5);
        // x beyond the right edge, y on row 1
        let y_row1 = -1.0 + 2.0 / 3.0;
        assert!((sample_one(&input, 2.0, y_row1) - 7.0).abs() < 1e-4);
    }

    #[test]
    fn test_sample_shapes_and_channels() {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (2, 5, 8, 8), &device).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let coords = random_coords(2, 3, &device, &mut rng).unwrap();
        assert_eq!(coords.dims(), &[2, 3, 3, 2]);

        let sampled = sample(&input, &coords).unwrap();
        assert_eq!(sampled.dims(), &[2, 5, 3, 3]);

        let values: Vec<f32> = coords.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn test_sample_constant_map() {
        let device = Device::Cpu;
        let input = Tensor::full(0.25f32, (1, 3, 6, 6), &device).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let coords = random_coords(1, 4, &device, &mut rng).unwrap();
        let sampled = sample(&input, &coords).unwrap();
        let values: Vec<f32> = sampled.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_sample_batch_mismatch() {
        let device = Device::Cpu;
        let input = Tensor::zeros((2, 3, 4, 4), DType::F32, &device).unwrap();
        let coords = Tensor::zeros((3, 2, 2, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            sample(&input, &coords),
            Err(StegoError::ShapeMismatch { expected: 2, actual: 3 })
        ));
    }
}
