//! Backbone selection
//!
//! STEGO trains on frozen self-supervised ViT features. The backbone is picked
//! by name from the configuration; every backbone exposes the same small
//! interface so the rest of the model does not care which one runs.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::Rng;

use crate::config::StegoConfig;
use crate::error::{Result, StegoError};
use crate::model::vit::{Vit, VitConfig, VitFlavor};

/// Supported backbone families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneKind {
    Dino,
    Dinov2,
}

const BACKBONES: &[(&str, BackboneKind)] = &[
    ("dino", BackboneKind::Dino),
    ("dinov2", BackboneKind::Dinov2),
];

impl BackboneKind {
    /// Resolve a configured backbone name
    pub fn from_name(name: &str) -> Result<Self> {
        BACKBONES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| StegoError::config(format!("backbone {name} unavailable")))
    }

    fn label(&self) -> &'static str {
        match self {
            BackboneKind::Dino => "DINO",
            BackboneKind::Dinov2 => "DINOv2",
        }
    }
}

/// ViT size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VitSize {
    Small,
    Base,
}

impl VitSize {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "vit_small" => Ok(VitSize::Small),
            "vit_base" => Ok(VitSize::Base),
            other => Err(StegoError::config(format!("model type {other} unavailable"))),
        }
    }

    fn letter(&self) -> char {
        match self {
            VitSize::Small => 'S',
            VitSize::Base => 'B',
        }
    }
}

/// A validated backbone choice: family, size and patch size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneSpec {
    pub kind: BackboneKind,
    pub size: VitSize,
    pub patch_size: usize,
}

impl BackboneSpec {
    pub fn new(kind: BackboneKind, size: VitSize, patch_size: usize) -> Result<Self> {
        let supported = match kind {
            BackboneKind::Dino => patch_size == 8 || patch_size == 16,
            BackboneKind::Dinov2 => patch_size == 14,
        };
        if !supported {
            return Err(StegoError::config(format!(
                "{} {:?} unavailable with patch size {}",
                kind.label(),
                size,
                patch_size
            )));
        }
        Ok(Self {
            kind,
            size,
            patch_size,
        })
    }

    /// Backbone named by the configuration. DINOv2 always uses patch size 14.
    pub fn from_config(config: &StegoConfig) -> Result<Self> {
        let kind = BackboneKind::from_name(&config.backbone)?;
        let size = VitSize::from_name(&config.backbone_type)?;
        let patch_size = match kind {
            BackboneKind::Dino => config.patch_size,
            BackboneKind::Dinov2 => 14,
        };
        Self::new(kind, size, patch_size)
    }

    /// Identifier such as `DINO-S-8` or `DINOv2-B-14`
    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.kind.label(), self.size.letter(), self.patch_size)
    }

    pub fn output_dim(&self) -> usize {
        match self.size {
            VitSize::Small => 384,
            VitSize::Base => 768,
        }
    }

    /// Hugging Face repository holding pretrained weights
    pub fn hf_repo(&self) -> &'static str {
        match (self.kind, self.size, self.patch_size) {
            (BackboneKind::Dino, VitSize::Small, 8) => "facebook/dino-vits8",
            (BackboneKind::Dino, VitSize::Small, _) => "facebook/dino-vits16",
            (BackboneKind::Dino, VitSize::Base, 8) => "facebook/dino-vitb8",
            (BackboneKind::Dino, VitSize::Base, _) => "facebook/dino-vitb16",
            (BackboneKind::Dinov2, VitSize::Small, _) => "facebook/dinov2-small",
            (BackboneKind::Dinov2, VitSize::Base, _) => "facebook/dinov2-base",
        }
    }

    pub fn vit_config(&self) -> VitConfig {
        let flavor = match self.kind {
            BackboneKind::Dino => VitFlavor::Dino,
            BackboneKind::Dinov2 => VitFlavor::Dinov2,
        };
        match self.size {
            VitSize::Small => VitConfig::small(flavor, self.patch_size),
            VitSize::Base => VitConfig::base(flavor, self.patch_size),
        }
    }
}

/// Dense feature extractor used by STEGO
pub trait Backbone {
    /// Feature map [B, output_dim, H / patch, W / patch] for images [B, 3, H, W].
    ///
    /// Features carry no gradient.
    fn features(&self, img: &Tensor) -> Result<Tensor>;

    fn output_dim(&self) -> usize;

    fn name(&self) -> String;

    fn patch_size(&self) -> usize;
}

/// Zero whole channels with probability `p`, rescaling survivors by `1 / (1 - p)`.
pub fn channel_dropout<R: Rng + ?Sized>(xs: &Tensor, p: f64, rng: &mut R) -> Result<Tensor> {
    if p <= 0.0 {
        return Ok(xs.clone());
    }
    let (b, c, _, _) = xs.dims4()?;
    if p >= 1.0 {
        return Ok(xs.zeros_like()?);
    }
    let scale = (1.0 / (1.0 - p)) as f32;
    let keep: Vec<f32> = (0..b * c)
        .map(|_| if rng.gen::<f64>() >= p { scale } else { 0.0 })
        .collect();
    let keep = Tensor::from_vec(keep, (b, c, 1, 1), xs.device())?.to_dtype(xs.dtype())?;
    Ok(xs.broadcast_mul(&keep)?)
}

/// DINO / DINOv2 ViT backbone
pub struct VitBackbone {
    vit: Vit,
    spec: BackboneSpec,
}

impl VitBackbone {
    pub fn load(vb: VarBuilder, spec: BackboneSpec) -> Result<Self> {
        let vit = Vit::load(vb, &spec.vit_config())?;
        tracing::info!(backbone = %spec.name(), "backbone loaded");
        Ok(Self { vit, spec })
    }

    pub fn spec(&self) -> &BackboneSpec {
        &self.spec
    }
}

impl Backbone for VitBackbone {
    fn features(&self, img: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = img.dims4()?;
        let p = self.spec.patch_size;
        if h % p != 0 || w % p != 0 {
            return Err(StegoError::precondition(format!(
                "image size {h}x{w} is not divisible by patch size {p}"
            )));
        }
        Ok(self.vit.forward(&img.detach())?.detach())
    }

    fn output_dim(&self) -> usize {
        self.spec.output_dim()
    }

    fn name(&self) -> String {
        self.spec.name()
    }

    fn patch_size(&self) -> usize {
        self.spec.patch_size
    }
}

/// Build the configured backbone
pub fn load_backbone(vb: VarBuilder, config: &StegoConfig) -> Result<Box<dyn Backbone>> {
    let spec = BackboneSpec::from_config(config)?;
    Ok(Box::new(VitBackbone::load(vb, spec)?))
}
