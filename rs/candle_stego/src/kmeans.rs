//! Per-image k-means over unit-normalized pixel codes.
//!
//! Used by postprocessing when per-image clustering replaces the learned
//! cluster probe. Points are L2-normalized before clustering, so Euclidean
//! k-means ranks neighbours the same way cosine similarity does.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, StegoError};

/// Tuning knobs for [`kmeans`].
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansConfig {
    pub n_clusters: usize,
    pub max_iterations: usize,
    /// Relative tolerance on the total squared center shift, scaled by the
    /// mean per-dimension variance of the data.
    pub tolerance: f32,
    /// Independent k-means++ starts; the fit with the lowest inertia wins.
    pub n_init: usize,
    pub seed: u64,
}

impl KMeansConfig {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            max_iterations: 100,
            tolerance: 0.01,
            n_init: 10,
            seed: 0,
        }
    }
}

/// Result of a k-means fit.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    /// Row-major [k, dim] centers.
    pub centers: Vec<Vec<f32>>,
    pub assignments: Vec<usize>,
    /// Iterations of the winning start.
    pub iterations: usize,
    /// Sum of squared distances from each point to its center.
    pub inertia: f32,
}

impl KMeansFit {
    /// Centers as an L2-normalized [k, dim] tensor.
    pub fn normalized_centers(&self, device: &Device) -> Result<Tensor> {
        let k = self.centers.len();
        let dim = self.centers.first().map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(k * dim);
        for c in &self.centers {
            let norm = c.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-10);
            flat.extend(c.iter().map(|v| v / norm));
        }
        Ok(Tensor::from_vec(flat, (k, dim), device)?)
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(point: &[f32], centers: &[Vec<f32>]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centers.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// k-means++ seeding: the first center uniformly, the rest proportional to
/// squared distance from the closest chosen center.
fn init_plus_plus(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())].clone());

    let mut dist: Vec<f32> = points
        .iter()
        .map(|p| squared_distance(p, &centers[0]))
        .collect();

    while centers.len() < k {
        let total: f32 = dist.iter().sum();
        let idx = if total <= 0.0 {
            rng.gen_range(0..points.len())
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = points.len() - 1;
            for (i, d) in dist.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };
        centers.push(points[idx].clone());
        let newest = &centers[centers.len() - 1];
        for (d, p) in dist.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, newest));
        }
    }
    centers
}

fn mean_variance(points: &[Vec<f32>]) -> f32 {
    let n = points.len() as f32;
    let dim = points[0].len();
    let mut total = 0.0;
    for j in 0..dim {
        let mean = points.iter().map(|p| p[j]).sum::<f32>() / n;
        total += points.iter().map(|p| (p[j] - mean).powi(2)).sum::<f32>() / n;
    }
    total / dim as f32
}

/// Lloyd iterations from `centers` until the squared center shift drops to `tol`.
fn lloyd(
    points: &[Vec<f32>],
    mut centers: Vec<Vec<f32>>,
    tol: f32,
    max_iterations: usize,
) -> KMeansFit {
    let k = centers.len();
    let dim = points[0].len();
    let mut assignments = vec![0; points.len()];
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        for (a, p) in assignments.iter_mut().zip(points) {
            *a = nearest(p, &centers).0;
        }

        let mut sums = vec![vec![0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (p, &a) in points.iter().zip(&assignments) {
            counts[a] += 1;
            for (s, v) in sums[a].iter_mut().zip(p) {
                *s += v;
            }
        }

        let mut shift = 0.0;
        for ((center, sum), count) in centers.iter_mut().zip(sums).zip(counts) {
            if count == 0 {
                continue;
            }
            let updated: Vec<f32> = sum.iter().map(|s| s / count as f32).collect();
            shift += squared_distance(center, &updated);
            *center = updated;
        }

        if shift <= tol {
            break;
        }
    }

    // Final labels against the converged centers
    let mut inertia = 0.0;
    for (a, p) in assignments.iter_mut().zip(points) {
        let (best, d) = nearest(p, &centers);
        *a = best;
        inertia += d;
    }

    KMeansFit {
        centers,
        assignments,
        iterations,
        inertia,
    }
}

/// Lloyd's k-means with k-means++ seeding, restarted `config.n_init` times.
///
/// Deterministic for a fixed `config.seed`: every start draws from one
/// generator seeded with it. Empty clusters keep their previous center.
pub fn kmeans(points: &[Vec<f32>], config: &KMeansConfig) -> Result<KMeansFit> {
    let k = config.n_clusters;
    if k == 0 {
        return Err(StegoError::config("k-means needs at least one cluster"));
    }
    if config.n_init == 0 {
        return Err(StegoError::config("k-means needs at least one start"));
    }
    if points.is_empty() {
        return Err(StegoError::precondition("k-means needs at least one point"));
    }
    if k > points.len() {
        // Surplus centers duplicate existing points and stay empty
        tracing::warn!(
            k,
            n_points = points.len(),
            "k-means asked for more clusters than points"
        );
    }
    let dim = points[0].len();
    if let Some(bad) = points.iter().find(|p| p.len() != dim) {
        return Err(StegoError::shape_mismatch(dim, bad.len()));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let tol = config.tolerance * mean_variance(points);
    let mut best: Option<KMeansFit> = None;
    for _ in 0..config.n_init {
        let centers = init_plus_plus(points, k, &mut rng);
        let fit = lloyd(points, centers, tol, config.max_iterations);
        if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
            best = Some(fit);
        }
    }
    let best = best.ok_or_else(|| StegoError::config("k-means needs at least one start"))?;

    tracing::debug!(
        k,
        iterations = best.iterations,
        inertia = best.inertia,
        n_points = points.len(),
        "k-means converged"
    );
    Ok(best)
}

/// Cluster the pixels of a single code map [C, H, W].
///
/// Pixel codes are L2-normalized along C before clustering.
pub fn kmeans_code_map(code: &Tensor, config: &KMeansConfig) -> Result<KMeansFit> {
    let (c, h, w) = code.dims3()?;
    let pixels: Vec<f32> = code
        .to_dtype(DType::F32)?
        .reshape((c, h * w))?
        .t()?
        .contiguous()?
        .flatten_all()?
        .to_vec1()?;

    let points: Vec<Vec<f32>> = pixels
        .chunks(c)
        .map(|p| {
            let norm = p.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-10);
            p.iter().map(|v| v / norm).collect()
        })
        .collect();
    kmeans(&points, config)
}
