//! Correlation histogram accumulator
//!
//! Collects the distribution of code-correlation values across calls for
//! diagnostics. The loss never owns one; the caller decides when to reset.

use candle_core::{DType, Tensor};

use crate::error::{Result, StegoError};

pub const DEFAULT_BINS: usize = 40;

/// Fixed-range histogram with `torch.histc` binning: values outside
/// `[min, max]` are ignored and `max` itself falls in the last bin.
#[derive(Debug, Clone)]
pub struct CorrelationHistogram {
    min: f32,
    max: f32,
    counts: Vec<u64>,
}

impl Default for CorrelationHistogram {
    fn default() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
            counts: vec![0; DEFAULT_BINS],
        }
    }
}

impl CorrelationHistogram {
    pub fn new(bins: usize, min: f32, max: f32) -> Result<Self> {
        if bins == 0 || min >= max || !min.is_finite() || !max.is_finite() {
            return Err(StegoError::config(format!(
                "invalid histogram: {bins} bins over [{min}, {max}]"
            )));
        }
        Ok(Self {
            min,
            max,
            counts: vec![0; bins],
        })
    }

    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    /// Add every element of `values` (any shape).
    pub fn add(&mut self, values: &Tensor) -> Result<()> {
        let values: Vec<f32> = values.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        self.add_slice(&values);
        Ok(())
    }

    pub fn add_slice(&mut self, values: &[f32]) {
        let bins = self.counts.len();
        let width = self.max - self.min;
        for &v in values {
            if !(self.min..=self.max).contains(&v) {
                continue;
            }
            let bin = (((v - self.min) / width) * bins as f32) as usize;
            self.counts[bin.min(bins - 1)] += 1;
        }
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Counts divided by the total; all zeros when empty.
    pub fn normalized(&self) -> Vec<f32> {
        let total = self.total();
        if total == 0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts
            .iter()
            .map(|&c| c as f32 / total as f32)
            .collect()
    }

    pub fn bin_centers(&self) -> Vec<f32> {
        let width = (self.max - self.min) / self.counts.len() as f32;
        (0..self.counts.len())
            .map(|i| self.min + width * (i as f32 + 0.5))
            .collect()
    }
}
