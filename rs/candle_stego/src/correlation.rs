//! Pairwise correlation computer
//!
//! Cosine-similarity structure between two sets of sampled per-pixel vectors.
//! Feature correlations are a fixed target and are computed on detached
//! tensors; code correlations keep the autograd graph.

use candle_core::Tensor;

use crate::error::{Result, StegoError};

/// Smallest norm used when normalizing, matches `F.normalize`'s default epsilon.
pub const NORM_EPS: f64 = 1e-10;

/// Unit-normalize along the channel axis (dim 1).
pub fn normalize_channels(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(NORM_EPS)?;
    Ok(t.broadcast_div(&norm)?)
}

/// Compute einsum `nchw,ncij->nhwij`.
///
/// # Arguments
/// * `a` - Sampled vectors [N, C, H, W]
/// * `b` - Sampled vectors [N, C, I, J]
///
/// # Returns
/// Correlation tensor [N, H, W, I, J] of channel dot products. Inputs are
/// expected to be unit-normalized already.
pub fn tensor_correlation(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = a.dims4()?;
    let (n2, c2, i, j) = b.dims4()?;
    if n != n2 {
        return Err(StegoError::shape_mismatch(n, n2));
    }
    if c != c2 {
        return Err(StegoError::shape_mismatch(c, c2));
    }

    // [N, C, H*W] -> [N, H*W, C]
    let a_flat = a.reshape((n, c, h * w))?.transpose(1, 2)?.contiguous()?;
    let b_flat = b.reshape((n, c, i * j))?.contiguous()?;

    // [N, H*W, C] @ [N, C, I*J] -> [N, H*W, I*J]
    let corr = a_flat.matmul(&b_flat)?;
    Ok(corr.reshape((n, h, w, i, j))?)
}

/// Target-side correlation of two feature samples. No gradient flows back
/// into the inputs.
pub fn feature_correlation(f1: &Tensor, f2: &Tensor) -> Result<Tensor> {
    let f1 = normalize_channels(&f1.detach())?;
    let f2 = normalize_channels(&f2.detach())?;
    tensor_correlation(&f1, &f2)
}

/// Trainable correlation of two code samples; the graph back to the codes is kept.
pub fn code_correlation(c1: &Tensor, c2: &Tensor) -> Result<Tensor> {
    let c1 = normalize_channels(c1)?;
    let c2 = normalize_channels(c2)?;
    tensor_correlation(&c1, &c2)
}
