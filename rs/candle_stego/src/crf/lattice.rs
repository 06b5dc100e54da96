//! Permutohedral lattice
//!
//! Approximate high-dimensional Gaussian filtering in time linear in the
//! number of points (Adams, Baek & Davis 2010). Points are embedded in a
//! `d`-dimensional hyperplane of Z^(d+1), splatted onto the vertices of their
//! enclosing simplex, blurred along each of the `d + 1` lattice axes with a
//! `[1/2, 1, 1/2]` kernel, and sliced back with the same barycentric weights.
//!
//! The filter is unnormalized: `compute(ones)` gives each point's kernel mass.

use std::collections::HashMap;

use crate::error::{Result, StegoError};

/// A lattice built once for a fixed set of feature vectors, reusable for any
/// number of value channels.
#[derive(Debug, Clone)]
pub struct Permutohedral {
    n_points: usize,
    d: usize,
    n_vertices: usize,
    /// Vertex index + 1 for each (point, simplex corner); 0 is the empty slot.
    offsets: Vec<usize>,
    /// Barycentric weight for each (point, simplex corner).
    weights: Vec<f32>,
    /// Neighbour slots (minus, plus) for each (axis, vertex).
    neighbours: Vec<(usize, usize)>,
}

impl Permutohedral {
    /// Build the lattice for `features`, a row-major `[n_points, d]` buffer.
    ///
    /// Features are expected to be pre-scaled by the kernel bandwidths, so the
    /// filter approximates `exp(-|f_i - f_j|² / 2)`.
    pub fn new(features: &[f32], d: usize) -> Result<Self> {
        if d == 0 {
            return Err(StegoError::precondition("lattice needs at least one feature"));
        }
        if features.len() % d != 0 {
            return Err(StegoError::precondition(format!(
                "{} feature values do not split into rows of {d}",
                features.len()
            )));
        }
        let n_points = features.len() / d;
        let d1 = d + 1;
        let d1i = d1 as i32;

        let inv_std_dev = (2.0f32 / 3.0).sqrt() * d1 as f32;
        let scale: Vec<f32> = (0..d)
            .map(|i| inv_std_dev / (((i + 1) * (i + 2)) as f32).sqrt())
            .collect();

        // Remainder-k vertex offsets of the canonical simplex
        let mut canonical = vec![0i32; d1 * d1];
        for i in 0..=d {
            for j in 0..=(d - i) {
                canonical[i * d1 + j] = i as i32;
            }
            for j in (d - i + 1)..=d {
                canonical[i * d1 + j] = i as i32 - d1i;
            }
        }

        let mut table: HashMap<Vec<i32>, usize> = HashMap::with_capacity(n_points * d1 / 4);
        let mut keys: Vec<Vec<i32>> = Vec::new();
        let mut offsets = Vec::with_capacity(n_points * d1);
        let mut weights = Vec::with_capacity(n_points * d1);

        let mut elevated = vec![0f32; d1];
        let mut rem0 = vec![0i32; d1];
        let mut rank = vec![0i32; d1];
        let mut barycentric = vec![0f32; d + 2];
        let mut key = vec![0i32; d];
        let down_factor = 1.0 / d1 as f32;

        for f in features.chunks_exact(d) {
            // Elevate onto the hyperplane x · 1 = 0
            let mut sm = 0f32;
            for j in (1..=d).rev() {
                let cf = f[j - 1] * scale[j - 1];
                elevated[j] = sm - j as f32 * cf;
                sm += cf;
            }
            elevated[0] = sm;

            // Closest remainder-0 point
            let mut sum = 0i32;
            for i in 0..=d {
                let v = down_factor * elevated[i];
                let up = v.ceil() * d1 as f32;
                let down = v.floor() * d1 as f32;
                rem0[i] = if up - elevated[i] < elevated[i] - down {
                    up as i32
                } else {
                    down as i32
                };
                sum += rem0[i];
            }
            sum /= d1i;

            rank.iter_mut().for_each(|r| *r = 0);
            for i in 0..d {
                let di = elevated[i] - rem0[i] as f32;
                for j in (i + 1)..=d {
                    if di < elevated[j] - rem0[j] as f32 {
                        rank[i] += 1;
                    } else {
                        rank[j] += 1;
                    }
                }
            }

            // Walk back onto the hyperplane if the rounding left it
            if sum > 0 {
                for i in 0..=d {
                    if rank[i] >= d1i - sum {
                        rem0[i] -= d1i;
                        rank[i] += sum - d1i;
                    } else {
                        rank[i] += sum;
                    }
                }
            } else if sum < 0 {
                for i in 0..=d {
                    if rank[i] < -sum {
                        rem0[i] += d1i;
                        rank[i] += d1i + sum;
                    } else {
                        rank[i] += sum;
                    }
                }
            }

            barycentric.iter_mut().for_each(|b| *b = 0.0);
            for i in 0..=d {
                let v = (elevated[i] - rem0[i] as f32) * down_factor;
                let r = rank[i] as usize;
                barycentric[d - r] += v;
                barycentric[d + 1 - r] -= v;
            }
            barycentric[0] += 1.0 + barycentric[d1];

            for remainder in 0..=d {
                for i in 0..d {
                    key[i] = rem0[i] + canonical[remainder * d1 + rank[i] as usize];
                }
                let index = match table.get(key.as_slice()) {
                    Some(&index) => index,
                    None => {
                        let index = keys.len();
                        table.insert(key.clone(), index);
                        keys.push(key.clone());
                        index
                    }
                };
                offsets.push(index + 1);
                weights.push(barycentric[remainder]);
            }
        }

        let n_vertices = keys.len();
        let mut neighbours = Vec::with_capacity(d1 * n_vertices);
        let mut n1 = vec![0i32; d];
        let mut n2 = vec![0i32; d];
        let slot = |k: &[i32]| table.get(k).map_or(0, |&i| i + 1);
        for axis in 0..=d {
            for key in &keys {
                for k in 0..d {
                    n1[k] = key[k] - 1;
                    n2[k] = key[k] + 1;
                }
                if axis < d {
                    n1[axis] = key[axis] + d as i32;
                    n2[axis] = key[axis] - d as i32;
                }
                neighbours.push((slot(n1.as_slice()), slot(n2.as_slice())));
            }
        }

        tracing::trace!(n_points, d, n_vertices, "permutohedral lattice built");
        Ok(Self {
            n_points,
            d,
            n_vertices,
            offsets,
            weights,
            neighbours,
        })
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Number of occupied lattice vertices.
    pub fn n_vertices(&self) -> usize {
        self.n_vertices
    }

    /// Filter `input`, a row-major `[n_points, value_dim]` buffer.
    pub fn compute(&self, input: &[f32], value_dim: usize) -> Result<Vec<f32>> {
        if input.len() != self.n_points * value_dim {
            return Err(StegoError::shape_mismatch(
                self.n_points * value_dim,
                input.len(),
            ));
        }
        let d1 = self.d + 1;
        let vd = value_dim;
        let slots = (self.n_vertices + 1) * vd;

        let mut values = vec![0f32; slots];
        for (i, row) in input.chunks_exact(vd).enumerate() {
            for j in 0..d1 {
                let o = self.offsets[i * d1 + j] * vd;
                let w = self.weights[i * d1 + j];
                for (v, x) in values[o..o + vd].iter_mut().zip(row) {
                    *v += w * x;
                }
            }
        }

        // Slot 0 is never written and stays zero in both buffers
        let mut scratch = vec![0f32; slots];
        for axis in 0..d1 {
            let pairs = &self.neighbours[axis * self.n_vertices..(axis + 1) * self.n_vertices];
            for (i, &(n1, n2)) in pairs.iter().enumerate() {
                let o = (i + 1) * vd;
                for k in 0..vd {
                    scratch[o + k] = values[o + k] + 0.5 * (values[n1 * vd + k] + values[n2 * vd + k]);
                }
            }
            std::mem::swap(&mut values, &mut scratch);
        }

        let alpha = 1.0 / (1.0 + 2f32.powi(-(self.d as i32)));
        let mut out = vec![0f32; self.n_points * vd];
        for (i, row) in out.chunks_exact_mut(vd).enumerate() {
            for j in 0..d1 {
                let o = self.offsets[i * d1 + j] * vd;
                let w = self.weights[i * d1 + j] * alpha;
                for (r, v) in row.iter_mut().zip(&values[o..o + vd]) {
                    *r += w * v;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_features(h: usize, w: usize, spacing: f32) -> Vec<f32> {
        let mut f = Vec::with_capacity(h * w * 2);
        for y in 0..h {
            for x in 0..w {
                f.push(x as f32 * spacing);
                f.push(y as f32 * spacing);
            }
        }
        f
    }

    #[test]
    fn test_barycentric_weights_sum_to_one() {
        let lattice = Permutohedral::new(&grid_features(5, 7, 0.37), 2).unwrap();
        for chunk in lattice.weights.chunks_exact(3) {
            let sum: f32 = chunk.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "sum {}", sum);
            assert!(chunk.iter().all(|&w| w >= -1e-6));
        }
    }

    #[test]
    fn test_normalized_filter_of_constant_is_constant() {
        let features = grid_features(6, 6, 0.5);
        let lattice = Permutohedral::new(&features, 2).unwrap();
        let mass = lattice.compute(&vec![1.0; 36], 1).unwrap();
        let filtered = lattice.compute(&vec![2.5; 36], 1).unwrap();
        for (f, m) in filtered.iter().zip(&mass) {
            assert!(*m > 0.0);
            assert!((f / m - 2.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_weighted_average_stays_in_range() {
        let features = grid_features(8, 8, 0.6);
        let lattice = Permutohedral::new(&features, 2).unwrap();
        let values: Vec<f32> = (0..64).map(|i| ((i * 37) % 11) as f32).collect();
        let mass = lattice.compute(&vec![1.0; 64], 1).unwrap();
        let filtered = lattice.compute(&values, 1).unwrap();
        for (f, m) in filtered.iter().zip(&mass) {
            let avg = f / m;
            assert!((-1e-4..=10.0 + 1e-4).contains(&avg));
        }
    }

    #[test]
    fn test_impulse_decays_with_distance() {
        let features: Vec<f32> = (0..20).map(|i| i as f32 * 0.5).collect();
        let lattice = Permutohedral::new(&features, 1).unwrap();
        let mut impulse = vec![0f32; 20];
        impulse[0] = 1.0;
        let out = lattice.compute(&impulse, 1).unwrap();
        assert!(out[0] > out[2]);
        assert!(out[2] > out[6]);
        assert_eq!(out[19], 0.0);
    }

    #[test]
    fn test_distant_groups_do_not_interact() {
        // Two 3x3 grids, far apart in feature space
        let mut features = grid_features(3, 3, 0.5);
        features.extend(grid_features(3, 3, 0.5).iter().map(|v| v + 100.0));
        let lattice = Permutohedral::new(&features, 2).unwrap();

        let mut values = vec![0f32; 18];
        values[..9].iter_mut().for_each(|v| *v = 1.0);
        let out = lattice.compute(&values, 1).unwrap();
        assert!(out[..9].iter().all(|&v| v > 0.0));
        assert!(out[9..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_multichannel_matches_per_channel() {
        let features = grid_features(4, 4, 0.8);
        let lattice = Permutohedral::new(&features, 2).unwrap();
        let a: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..16).map(|i| (16 - i) as f32).collect();
        let interleaved: Vec<f32> = a.iter().zip(&b).flat_map(|(x, y)| [*x, *y]).collect();

        let fa = lattice.compute(&a, 1).unwrap();
        let fb = lattice.compute(&b, 1).unwrap();
        let fab = lattice.compute(&interleaved, 2).unwrap();
        for i in 0..16 {
            assert!((fab[2 * i] - fa[i]).abs() < 1e-4);
            assert!((fab[2 * i + 1] - fb[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_input_length_checked() {
        let lattice = Permutohedral::new(&grid_features(2, 2, 1.0), 2).unwrap();
        assert!(lattice.compute(&[1.0; 3], 1).is_err());
        assert!(Permutohedral::new(&[1.0; 3], 2).is_err());
    }
}
