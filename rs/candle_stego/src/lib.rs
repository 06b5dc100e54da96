//! STEGO unsupervised semantic segmentation with candle
//!
//! A segmentation head is trained to reproduce, in a low-dimensional code
//! space, the pairwise correlation structure of frozen self-supervised ViT
//! features. Codes are then clustered against learned prototypes and refined
//! with a fully connected CRF.

pub mod cluster;
pub mod config;
pub mod correlation;
pub mod crf;
pub mod error;
pub mod histogram;
pub mod kmeans;
pub mod loss;
pub mod model;
pub mod perm;
pub mod preprocess;
pub mod sample;

pub use cluster::ClusterLookup;
pub use config::{CorrelationLossConfig, CrfConfig, StegoConfig};
pub use crf::DenseCrf;
pub use error::{Result, StegoError};
pub use histogram::CorrelationHistogram;
pub use loss::{ContrastiveCorrelationLoss, CorrelationLosses};
pub use model::{PostprocessOptions, Stego, TrainingLosses};
