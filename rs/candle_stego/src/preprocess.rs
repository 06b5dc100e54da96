//! Image Preprocessing for STEGO
//!
//! This module handles the conversions between images and tensors:
//! 1. Load image and convert to tensor (RGB, CHW format, values in [0, 1])
//! 2. Normalize using ImageNet mean and std
//! 3. Resize to a resolution the backbone's patch size divides
//! 4. Undo the normalization to recover 8-bit RGB for the CRF and for output

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;

use crate::error::{Result, StegoError};

/// Tensor statistics for debugging and validation
#[derive(Debug)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mean = data.iter().sum::<f32>() / data.len().max(1) as f32;

        Ok(Self {
            shape,
            min,
            max,
            mean,
        })
    }

    /// Emit the statistics as a debug event
    pub fn trace(&self, name: &str) {
        tracing::debug!(
            name,
            shape = ?self.shape,
            min = self.min,
            max = self.max,
            mean = self.mean,
            "tensor stats"
        );
    }
}

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Load an image from disk
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
///
/// # Returns
/// Tensor of shape [3, H, W] with values in [0.0, 1.0]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let (h, w) = (height as usize, width as usize);

    // Raw bytes are HWC; convert to CHW in one permute
    let hwc = Tensor::from_vec(img.into_raw(), (h, w, 3), device)?;
    let chw = (hwc.permute((2, 0, 1))?.to_dtype(DType::F32)? / 255.0)?;
    Ok(chw)
}

fn channel_constants(device: &Device) -> Result<(Tensor, Tensor)> {
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    Ok((mean, std))
}

/// Normalize a [3, H, W] tensor: `(input - mean) / std`
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let _ = tensor.dims3()?;
    let (mean, std) = channel_constants(tensor.device())?;
    Ok(tensor.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// Invert [`normalize`]: `input * std + mean`
pub fn unnormalize(tensor: &Tensor) -> Result<Tensor> {
    let _ = tensor.dims3()?;
    let (mean, std) = channel_constants(tensor.device())?;
    Ok(tensor.broadcast_mul(&std)?.broadcast_add(&mean)?)
}

/// Convert an ImageNet-normalized [3, H, W] tensor to interleaved RGB bytes.
///
/// Values are clamped to [0, 255] and truncated.
///
/// # Returns
/// `(bytes, height, width)` with `bytes` in HWC order
pub fn to_rgb8(tensor: &Tensor) -> Result<(Vec<u8>, usize, usize)> {
    let (c, h, w) = tensor.dims3()?;
    if c != 3 {
        return Err(StegoError::shape_mismatch(3, c));
    }
    let bytes = (unnormalize(&tensor.to_dtype(DType::F32)?)? * 255.0)?
        .clamp(0.0, 255.0)?
        .permute((1, 2, 0))?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    Ok((bytes, h, w))
}

/// Resize a [3, H, W] tensor with bilinear interpolation (align_corners=false)
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (target_h, target_w) = target_size;
    let _ = tensor.dims3()?;
    let resized = tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(target_h, target_w, false)?
        .squeeze(0)?;
    Ok(resized)
}

/// Mirror a tensor along its last (width) axis
pub fn flip_horizontal(tensor: &Tensor) -> Result<Tensor> {
    let w = tensor.dim(candle_core::D::Minus1)?;
    let idx: Vec<u32> = (0..w as u32).rev().collect();
    let idx = Tensor::from_vec(idx, w, tensor.device())?;
    Ok(tensor.index_select(&idx, tensor.rank() - 1)?)
}

/// Largest size not above `size` that `multiple` divides, at least `multiple`.
pub fn round_to_multiple(size: usize, multiple: usize) -> usize {
    ((size / multiple) * multiple).max(multiple)
}

/// Load, convert, normalize and resize an image for the backbone.
///
/// The short side is scaled to `resolution`, then both sides are rounded
/// down to a multiple of `patch_size`.
///
/// # Returns
/// Tuple of (normalized tensor [1, 3, H', W'], original height, original width)
pub fn preprocess_image(
    image_path: impl AsRef<Path>,
    resolution: usize,
    patch_size: usize,
    device: &Device,
) -> Result<(Tensor, usize, usize)> {
    let img = load_image(image_path)?;
    let tensor = image_to_tensor(&img, device)?;
    let (_, h_orig, w_orig) = tensor.dims3()?;
    TensorStats::from_tensor(&tensor)?.trace("input_image_raw");

    let normalized = normalize(&tensor)?;

    let scale = resolution as f64 / h_orig.min(w_orig) as f64;
    let target_h = round_to_multiple((h_orig as f64 * scale).round() as usize, patch_size);
    let target_w = round_to_multiple((w_orig as f64 * scale).round() as usize, patch_size);
    let resized = resize(&normalized, (target_h, target_w))?;
    TensorStats::from_tensor(&resized)?.trace("input_image_resized");

    Ok((resized.unsqueeze(0)?, h_orig, w_orig))
}
