//! STEGO Model Configuration
//!
//! This module defines the configuration structures for the backbone, the
//! correlation loss, the dense CRF and postprocessing. Defaults reproduce the
//! reference model configuration; any field may be overridden from a JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StegoError};

/// Correlation loss configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationLossConfig {
    /// Sampled coordinates per image side (feature_samples² points per image)
    pub feature_samples: usize,
    /// Number of deranged negative pairings per step
    pub neg_samples: usize,
    /// Recenter feature correlations per target location
    pub pointwise: bool,
    /// Clamp code correlations at 0.0 instead of effectively not at all
    pub zero_clamp: bool,
    /// Also clamp code correlations from above at 0.8
    pub stabilize: bool,
    /// Shift for the intra-image positive term
    pub pos_intra_shift: f64,
    /// Shift for the inter-image positive term
    pub pos_inter_shift: f64,
    /// Shift for the inter-image negative term
    pub neg_inter_shift: f64,
    /// Weight of the intra-image positive term in the total loss
    pub pos_intra_weight: f64,
    /// Weight of the inter-image positive term in the total loss
    pub pos_inter_weight: f64,
    /// Weight of the inter-image negative term in the total loss
    pub neg_inter_weight: f64,
}

impl Default for CorrelationLossConfig {
    fn default() -> Self {
        Self {
            feature_samples: 11,
            neg_samples: 5,
            pointwise: true,
            zero_clamp: true,
            stabilize: false,
            pos_intra_shift: 0.18,
            pos_inter_shift: 0.12,
            neg_inter_shift: 0.46,
            pos_intra_weight: 0.67,
            pos_inter_weight: 0.25,
            neg_inter_weight: 0.63,
        }
    }
}

impl CorrelationLossConfig {
    /// Lower clamp bound applied to code correlations
    pub fn min_clamp(&self) -> f64 {
        if self.zero_clamp {
            0.0
        } else {
            -9999.0
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.feature_samples == 0 {
            return Err(StegoError::config("feature_samples must be positive"));
        }
        if self.neg_samples == 0 {
            return Err(StegoError::config("neg_samples must be positive"));
        }
        Ok(())
    }
}

/// Dense CRF configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrfConfig {
    /// Number of mean-field iterations
    pub crf_max_iter: usize,
    /// Compatibility weight of the position-only kernel
    pub pos_w: f32,
    /// Spatial bandwidth of the position-only kernel
    pub pos_xy_std: f32,
    /// Compatibility weight of the bilateral kernel
    pub bi_w: f32,
    /// Spatial bandwidth of the bilateral kernel
    pub bi_xy_std: f32,
    /// Color bandwidth of the bilateral kernel
    pub bi_rgb_std: f32,
}

impl Default for CrfConfig {
    fn default() -> Self {
        Self {
            crf_max_iter: 10,
            pos_w: 3.0,
            pos_xy_std: 1.0,
            bi_w: 4.0,
            bi_xy_std: 67.0,
            bi_rgb_std: 3.0,
        }
    }
}

impl CrfConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("pos_xy_std", self.pos_xy_std),
            ("bi_xy_std", self.bi_xy_std),
            ("bi_rgb_std", self.bi_rgb_std),
        ] {
            if !(value > 0.0) {
                return Err(StegoError::config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Complete STEGO configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StegoConfig {
    // Backbone configuration
    /// Backbone family ("dino" or "dinov2")
    pub backbone: String,
    /// Backbone size ("vit_small" or "vit_base")
    pub backbone_type: String,
    /// Patch size (8 or 16 for DINO, 14 for DINOv2)
    pub patch_size: usize,
    /// Channel dropout applied to backbone features during training
    pub dropout_p: f64,
    /// Optional local path to backbone weights (safetensors)
    pub pretrained_weights: Option<String>,

    // Head configuration
    /// Code dimension produced by the segmentation head
    pub dim: usize,
    /// Prototypes added on top of the class count in the cluster probe
    pub extra_clusters: usize,

    /// Correlation loss configuration
    pub loss: CorrelationLossConfig,
    /// Dense CRF configuration
    pub crf: CrfConfig,

    /// Softmax scale applied to cosine similarities at inference
    pub cluster_temperature: f64,
}

impl Default for StegoConfig {
    fn default() -> Self {
        Self {
            backbone: "dino".to_string(),
            backbone_type: "vit_small".to_string(),
            patch_size: 8,
            dropout_p: 0.1,
            pretrained_weights: None,
            dim: 70,
            extra_clusters: 0,
            loss: CorrelationLossConfig::default(),
            crf: CrfConfig::default(),
            cluster_temperature: 2.0,
        }
    }
}

impl StegoConfig {
    /// Configuration for a DINOv2 backbone of the given size
    pub fn dinov2(backbone_type: &str) -> Self {
        Self {
            backbone: "dinov2".to_string(),
            backbone_type: backbone_type.to_string(),
            patch_size: 14,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file, filling missing fields with defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on values no component can work with.
    ///
    /// Backbone name/size/patch combinations are checked when the backbone is
    /// resolved, see [`crate::model::backbone::BackboneSpec::from_config`].
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(StegoError::config("dim must be positive"));
        }
        if !(0.0..=1.0).contains(&self.dropout_p) {
            return Err(StegoError::config(format!(
                "dropout_p must lie in [0, 1], got {}",
                self.dropout_p
            )));
        }
        self.loss.validate()?;
        self.crf.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StegoConfig::default();
        config.validate().unwrap();
        assert_eq!(config.loss.feature_samples, 11);
        assert_eq!(config.crf.crf_max_iter, 10);
        assert_eq!(config.loss.min_clamp(), 0.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "backbone": "dinov2", "patch_size": 14, "loss": { "neg_samples": 2 } }"#;
        let config: StegoConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.backbone, "dinov2");
        assert_eq!(config.loss.neg_samples, 2);
        assert_eq!(config.loss.feature_samples, 11);
        assert_eq!(config.dim, 70);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = StegoConfig::default();
        config.loss.feature_samples = 0;
        assert!(config.validate().is_err());

        let mut config = StegoConfig::default();
        config.crf.bi_rgb_std = 0.0;
        assert!(config.validate().is_err());

        let mut config = StegoConfig::default();
        config.dropout_p = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_neg_samples_rejected() {
        let config = CorrelationLossConfig {
            neg_samples: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StegoError::Config { .. })
        ));

        let json = r#"{ "loss": { "neg_samples": 0 } }"#;
        let config: StegoConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_zero_clamp() {
        let config = CorrelationLossConfig {
            zero_clamp: false,
            ..Default::default()
        };
        assert_eq!(config.min_clamp(), -9999.0);
    }
}
