//! Cluster lookup
//!
//! A learned set of prototype vectors. Per-pixel codes are compared to the
//! prototypes by cosine similarity to produce soft or hard cluster
//! assignments and an unsupervised clustering loss.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::correlation::normalize_channels;
use crate::error::{Result, StegoError};

/// Cosine similarity between every pixel code and every prototype.
///
/// Compute einsum `bchw,nc->bnhw` on unit-normalized operands.
///
/// # Arguments
/// * `code` - Code map [B, C, H, W]
/// * `prototypes` - Prototype vectors [N, C]
///
/// # Returns
/// Similarities [B, N, H, W]
pub fn cosine_inner_products(code: &Tensor, prototypes: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = code.dims4()?;
    let (n, c2) = prototypes.dims2()?;
    if c != c2 {
        return Err(StegoError::shape_mismatch(c2, c));
    }
    let normed_code = normalize_channels(code)?.reshape((b, c, h * w))?;
    let normed_protos = normalize_channels(prototypes)?;

    // [N, C] @ [B, C, H*W] -> [B, N, H*W]
    let inner = normed_protos.broadcast_matmul(&normed_code)?;
    Ok(inner.reshape((b, n, h, w))?)
}

/// [n, dim] standard-normal prototypes drawn from `rng`
fn random_prototypes<R: Rng + ?Sized>(
    n: usize,
    dim: usize,
    device: &Device,
    rng: &mut R,
) -> Result<Var> {
    let values: Vec<f32> = (0..n * dim).map(|_| StandardNormal.sample(&mut *rng)).collect();
    Ok(Var::from_tensor(&Tensor::from_vec(values, (n, dim), device)?)?)
}

/// One-hot encode the argmax over the cluster axis: [B, N, H, W] -> [B, N, H, W].
fn one_hot_argmax(inner: &Tensor) -> Result<Tensor> {
    let n = inner.dim(1)?;
    let best = inner.argmax_keepdim(1)?;
    let ids = Tensor::arange(0u32, n as u32, inner.device())?.reshape((1, n, 1, 1))?;
    Ok(best.broadcast_eq(&ids)?.to_dtype(inner.dtype())?)
}

/// Soft assignment of a code map to externally supplied cluster centers
/// (e.g. per-image k-means): softmax over centers of `similarity * temperature`.
///
/// # Returns
/// Cluster probabilities [B, N, H, W]
pub fn assign_to_centers(code: &Tensor, centers: &Tensor, temperature: f64) -> Result<Tensor> {
    let inner = cosine_inner_products(code, &centers.to_dtype(code.dtype())?)?;
    Ok(candle_nn::ops::softmax(&(inner * temperature)?, 1)?)
}

/// STEGO's clustering module: cosine-distance k-means on learned prototypes.
#[derive(Debug)]
pub struct ClusterLookup {
    dim: usize,
    clusters: Var,
}

impl ClusterLookup {
    /// Fresh prototypes drawn from a standard normal distribution.
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        n_classes: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        if n_classes == 0 {
            return Err(StegoError::config("cluster probe needs at least one cluster"));
        }
        let clusters = random_prototypes(n_classes, dim, device, rng)?;
        Ok(Self { dim, clusters })
    }

    /// Load checkpointed prototypes stored under `clusters`. Backends that
    /// create variables draw them from a standard normal.
    pub fn load(vb: VarBuilder, dim: usize, n_classes: usize) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let clusters = vb.get_with_hints((n_classes, dim), "clusters", init)?;
        Ok(Self {
            dim,
            clusters: Var::from_tensor(&clusters)?,
        })
    }

    /// Wrap an explicit [N, dim] prototype tensor.
    pub fn from_prototypes(prototypes: &Tensor) -> Result<Self> {
        let (_, dim) = prototypes.dims2()?;
        Ok(Self {
            dim,
            clusters: Var::from_tensor(prototypes)?,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of prototypes (classes plus extra clusters).
    pub fn n_clusters(&self) -> usize {
        self.clusters.dims()[0]
    }

    /// Trainable prototype tensor, for an external optimizer.
    ///
    /// Replaced wholesale by [`ClusterLookup::reset`]; optimizers holding the
    /// old variable must be rebuilt.
    pub fn var(&self) -> &Var {
        &self.clusters
    }

    pub fn prototypes(&self) -> &Tensor {
        self.clusters.as_tensor()
    }

    /// Cosine similarities [B, N, H, W] between the code map and every prototype.
    pub fn inner_products(&self, code: &Tensor) -> Result<Tensor> {
        let c = code.dim(1)?;
        if c != self.dim {
            return Err(StegoError::shape_mismatch(self.dim, c));
        }
        cosine_inner_products(code, self.clusters.as_tensor())
    }

    /// Assign every pixel to the prototypes.
    ///
    /// With `temperature == None` the assignment is hard (one-hot at the most
    /// similar prototype); otherwise it is `softmax(similarity * temperature)`.
    ///
    /// # Returns
    /// `(cluster_loss, cluster_probs)` where `cluster_loss` is the negative
    /// mean over pixels of `Σ_n probs * similarity` and `cluster_probs` is
    /// [B, N, H, W].
    pub fn assign(&self, code: &Tensor, temperature: Option<f64>) -> Result<(Tensor, Tensor)> {
        let inner = self.inner_products(code)?;
        let probs = match temperature {
            None => one_hot_argmax(&inner)?,
            Some(alpha) => candle_nn::ops::softmax(&(&inner * alpha)?, 1)?,
        };
        let loss = (&probs * &inner)?.sum(1)?.mean_all()?.neg()?;
        Ok((loss, probs))
    }

    /// Log-probabilities `log_softmax(similarity * temperature)` over prototypes.
    pub fn log_assign(&self, code: &Tensor, temperature: f64) -> Result<Tensor> {
        let inner = self.inner_products(code)?;
        Ok(candle_nn::ops::log_softmax(&(inner * temperature)?, 1)?)
    }

    /// Replace all prototypes with `n_classes + extra_clusters` fresh random vectors.
    pub fn reset<R: Rng + ?Sized>(
        &mut self,
        n_classes: usize,
        extra_clusters: usize,
        rng: &mut R,
    ) -> Result<()> {
        let n = n_classes + extra_clusters;
        if n == 0 {
            return Err(StegoError::config("cluster probe needs at least one cluster"));
        }
        let device = self.clusters.device().clone();
        self.clusters = random_prototypes(n, self.dim, &device, rng)?;
        tracing::info!(n_classes, extra_clusters, "cluster prototypes reset");
        Ok(())
    }
}

/// Per-pixel argmax over the class axis: [B, N, H, W] -> [B, H, W] (u32).
pub fn argmax_labels(probs: &Tensor) -> Result<Tensor> {
    Ok(probs.argmax(1)?.to_dtype(DType::U32)?)
}
