//! Contrastive correlation loss
//!
//! Trains the code extractor by aligning code-space correlations with the
//! feature-space correlations of a frozen backbone. Three pair types are
//! evaluated per call:
//! 1. intra-image positive (an image against itself)
//! 2. inter-image positive (an image against its augmented partner)
//! 3. inter-image negative (an image against a deranged batch partner)

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::config::CorrelationLossConfig;
use crate::correlation::{code_correlation, feature_correlation};
use crate::error::{Result, StegoError};
use crate::perm::derangement_tensor;
use crate::sample::{random_coords, sample};

/// Upper clamp on code correlations when stabilization is enabled.
pub const STABILIZE_MAX: f64 = 0.8;

/// Loss terms and raw code correlations of one loss evaluation.
#[derive(Debug, Clone)]
pub struct CorrelationLosses {
    /// Mean intra-image positive loss (scalar)
    pub pos_intra_loss: Tensor,
    /// Raw intra-image code correlations [N, S, S, S, S]
    pub pos_intra_cd: Tensor,
    /// Mean inter-image positive loss (scalar)
    pub pos_inter_loss: Tensor,
    /// Raw inter-image positive code correlations [N, S, S, S, S]
    pub pos_inter_cd: Tensor,
    /// Unreduced negative losses, concatenated over negative samples [K*N, S, S, S, S]
    pub neg_inter_loss: Tensor,
    /// Raw negative code correlations, concatenated over negative samples [K*N, S, S, S, S]
    pub neg_inter_cd: Tensor,
}

/// STEGO's correlation loss. Holds configuration only.
#[derive(Debug, Clone)]
pub struct ContrastiveCorrelationLoss {
    config: CorrelationLossConfig,
}

impl ContrastiveCorrelationLoss {
    pub fn new(config: CorrelationLossConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CorrelationLossConfig {
        &self.config
    }

    /// Loss for one pair type.
    ///
    /// `fd` is derived from the features without gradient tracking; `cd` keeps
    /// the graph to the codes. Returns the unreduced elementwise loss
    /// `-clamp(cd) * (fd - shift)` and the raw `cd`.
    pub fn helper(
        &self,
        f1: &Tensor,
        f2: &Tensor,
        c1: &Tensor,
        c2: &Tensor,
        shift: f64,
    ) -> Result<(Tensor, Tensor)> {
        let mut fd = feature_correlation(f1, f2)?;
        if self.config.pointwise {
            fd = pointwise_center(&fd)?;
        }

        let cd = code_correlation(c1, c2)?;

        let min_val = self.config.min_clamp();
        let clamped = if self.config.stabilize {
            cd.clamp(min_val, STABILIZE_MAX)?
        } else {
            cd.maximum(min_val)?
        };

        let loss = clamped.mul(&(fd - shift)?)?.neg()?;
        Ok((loss, cd))
    }

    /// Evaluate all three pair types.
    ///
    /// # Arguments
    /// * `orig_feats` / `orig_feats_pos` - Feature maps [N, C, H, W] of the anchor and positive images
    /// * `orig_code` / `orig_code_pos` - Code maps [N, D, H', W'] of the anchor and positive images
    /// * `rng` - Source for coordinates and negative pairings
    pub fn forward<R: Rng + ?Sized>(
        &self,
        orig_feats: &Tensor,
        orig_feats_pos: &Tensor,
        orig_code: &Tensor,
        orig_code_pos: &Tensor,
        rng: &mut R,
    ) -> Result<CorrelationLosses> {
        let batch = orig_feats.dim(0)?;
        for t in [orig_feats_pos, orig_code, orig_code_pos] {
            let b = t.dim(0)?;
            if b != batch {
                return Err(StegoError::shape_mismatch(batch, b));
            }
        }
        let device = orig_feats.device();
        let samples = self.config.feature_samples;

        let coords1 = random_coords(batch, samples, device, rng)?;
        let coords2 = random_coords(batch, samples, device, rng)?;

        let feats = sample(orig_feats, &coords1)?;
        let code = sample(orig_code, &coords1)?;
        let feats_pos = sample(orig_feats_pos, &coords2)?;
        let code_pos = sample(orig_code_pos, &coords2)?;

        let (pos_intra_loss, pos_intra_cd) =
            self.helper(&feats, &feats, &code, &code, self.config.pos_intra_shift)?;
        let (pos_inter_loss, pos_inter_cd) = self.helper(
            &feats,
            &feats_pos,
            &code,
            &code_pos,
            self.config.pos_inter_shift,
        )?;

        let mut neg_losses = Vec::with_capacity(self.config.neg_samples);
        let mut neg_cds = Vec::with_capacity(self.config.neg_samples);
        for _ in 0..self.config.neg_samples {
            let perm_neg = derangement_tensor(batch, device, rng)?;
            let feats_neg = sample(&orig_feats.index_select(&perm_neg, 0)?, &coords2)?;
            let code_neg = sample(&orig_code.index_select(&perm_neg, 0)?, &coords2)?;
            let (neg_loss, neg_cd) = self.helper(
                &feats,
                &feats_neg,
                &code,
                &code_neg,
                self.config.neg_inter_shift,
            )?;
            neg_losses.push(neg_loss);
            neg_cds.push(neg_cd);
        }
        let neg_inter_loss = Tensor::cat(&neg_losses, 0)?;
        let neg_inter_cd = Tensor::cat(&neg_cds, 0)?;

        let pos_intra_loss = pos_intra_loss.mean_all()?;
        let pos_inter_loss = pos_inter_loss.mean_all()?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                pos_intra = pos_intra_loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
                pos_inter = pos_inter_loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
                neg_samples = self.config.neg_samples,
                "correlation loss evaluated"
            );
        }

        Ok(CorrelationLosses {
            pos_intra_loss,
            pos_intra_cd,
            pos_inter_loss,
            pos_inter_cd,
            neg_inter_loss,
            neg_inter_cd,
        })
    }
}

/// Subtract the mean over the target-side axes (3, 4), then restore the
/// global mean the tensor had before centering.
pub fn pointwise_center(fd: &Tensor) -> Result<Tensor> {
    let old_mean = fd.mean_all()?;
    let centered = fd.broadcast_sub(&fd.mean_keepdim((3, 4))?)?;
    let new_mean = centered.mean_all()?;
    Ok(centered
        .broadcast_sub(&new_mean)?
        .broadcast_add(&old_mean)?)
}
