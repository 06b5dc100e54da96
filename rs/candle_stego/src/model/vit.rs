//! Vision Transformer backbone (DINO and DINOv2)
//!
//! One ViT implementation covering both self-supervised families STEGO
//! distills from. The two differ only in their block layout and weight names:
//!
//! - DINO: `layernorm_before` / `layernorm_after`, MLP as
//!   `intermediate.dense` + `output.dense`, no layer scale
//! - DINOv2: `norm1` / `norm2`, MLP as `mlp.fc1` + `mlp.fc2`, per-channel
//!   layer scale after attention and MLP
//!
//! Weights use the Hugging Face `transformers` layout (`embeddings.*`,
//! `encoder.layer.{i}.*`, `layernorm.*`).

use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{layer_norm, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder};

/// Block layout of a ViT checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VitFlavor {
    /// Original DINO (plain pre-norm blocks)
    Dino,
    /// DINOv2 (pre-norm blocks with layer scale)
    Dinov2,
}

/// Configuration for the ViT backbone
#[derive(Debug, Clone)]
pub struct VitConfig {
    pub flavor: VitFlavor,
    /// Hidden dimension size (384 for small, 768 for base)
    pub hidden_size: usize,
    /// Number of transformer layers
    pub num_hidden_layers: usize,
    /// Number of attention heads
    pub num_attention_heads: usize,
    /// MLP intermediate size ratio
    pub mlp_ratio: usize,
    /// Layer normalization epsilon
    pub layer_norm_eps: f64,
    /// Pretraining image size; fixes the number of stored position embeddings
    pub image_size: usize,
    /// Patch size for the patch embedding convolution
    pub patch_size: usize,
    /// Number of input channels
    pub num_channels: usize,
}

impl VitConfig {
    fn new(flavor: VitFlavor, hidden_size: usize, num_heads: usize, patch_size: usize) -> Self {
        let image_size = match flavor {
            VitFlavor::Dino => 224,
            VitFlavor::Dinov2 => 518,
        };
        Self {
            flavor,
            hidden_size,
            num_hidden_layers: 12,
            num_attention_heads: num_heads,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
            image_size,
            patch_size,
            num_channels: 3,
        }
    }

    /// ViT-S: 384 channels, 6 heads
    pub fn small(flavor: VitFlavor, patch_size: usize) -> Self {
        Self::new(flavor, 384, 6, patch_size)
    }

    /// ViT-B: 768 channels, 12 heads
    pub fn base(flavor: VitFlavor, patch_size: usize) -> Self {
        Self::new(flavor, 768, 12, patch_size)
    }

    fn num_positions(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

/// Patch embeddings using a Conv2d projection
struct PatchEmbeddings {
    projection: Conv2d,
}

impl PatchEmbeddings {
    fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let projection = candle_nn::conv2d(
            config.num_channels,
            config.hidden_size,
            config.patch_size,
            conv_config,
            vb.pp("projection"),
        )?;
        Ok(Self { projection })
    }
}

impl Module for PatchEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        // [B, C, H, W] -> [B, hidden, h, w] -> [B, h*w, hidden]
        self.projection
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)
    }
}

/// CLS token, patch embeddings and position embeddings
struct Embeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    patch_embeddings: PatchEmbeddings,
    config: VitConfig,
}

impl Embeddings {
    fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let cls_token = vb.get((1, 1, config.hidden_size), "cls_token")?;
        let position_embeddings = vb.get_with_hints_dtype(
            (1, config.num_positions() + 1, config.hidden_size),
            "position_embeddings",
            Default::default(),
            DType::F32,
        )?;
        let patch_embeddings = PatchEmbeddings::load(vb.pp("patch_embeddings"), config)?;
        Ok(Self {
            cls_token,
            position_embeddings,
            patch_embeddings,
            config: config.clone(),
        })
    }

    /// Resample the stored position grid to the input's patch grid
    fn interpolate_pos_encoding(&self, height: usize, width: usize, dtype: DType) -> Result<Tensor> {
        let num_positions = self.position_embeddings.dim(1)? - 1;
        let target_h = height / self.config.patch_size;
        let target_w = width / self.config.patch_size;
        let side = (num_positions as f64).sqrt() as usize;

        let pos = if target_h == side && target_w == side {
            self.position_embeddings.clone()
        } else {
            let class_pos_embed = self.position_embeddings.i((.., ..1, ..))?;
            let dim = self.position_embeddings.dim(D::Minus1)?;

            // [1, n, dim] -> [1, dim, side, side] -> [1, dim, h, w] -> [1, h*w, dim]
            let patch_pos_embed = self
                .position_embeddings
                .i((.., 1.., ..))?
                .reshape((1, side, side, dim))?
                .permute((0, 3, 1, 2))?
                .upsample_bilinear2d(target_h, target_w, false)?
                .permute((0, 2, 3, 1))?
                .reshape((1, target_h * target_w, dim))?;
            Tensor::cat(&[&class_pos_embed, &patch_pos_embed], 1)?
        };
        pos.to_dtype(dtype)
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (batch_size, _, height, width) = pixel_values.dims4()?;
        let embeddings = self.patch_embeddings.forward(pixel_values)?;

        let cls_tokens = self
            .cls_token
            .broadcast_as((batch_size, 1, self.config.hidden_size))?;
        let embeddings = Tensor::cat(&[&cls_tokens, &embeddings], 1)?;

        let pos_embed = self.interpolate_pos_encoding(height, width, embeddings.dtype())?;
        embeddings.broadcast_add(&pos_embed)
    }
}

#[derive(Debug)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let dim = config.hidden_size;
        let num_heads = config.num_attention_heads;

        // Separate q/k/v projections fused into one matmul
        let attn_vb = vb.pp("attention");
        let q_weight = attn_vb.pp("query").get((dim, dim), "weight")?;
        let k_weight = attn_vb.pp("key").get((dim, dim), "weight")?;
        let v_weight = attn_vb.pp("value").get((dim, dim), "weight")?;
        let qkv_weight = Tensor::cat(&[&q_weight, &k_weight, &v_weight], 0)?;

        let q_bias = attn_vb.pp("query").get(dim, "bias")?;
        let k_bias = attn_vb.pp("key").get(dim, "bias")?;
        let v_bias = attn_vb.pp("value").get(dim, "bias")?;
        let qkv_bias = Tensor::cat(&[&q_bias, &k_bias, &v_bias], 0)?;

        let qkv = Linear::new(qkv_weight, Some(qkv_bias));
        let proj = candle_nn::linear(dim, dim, vb.pp("output.dense"))?;
        let scale = 1. / ((dim / num_heads) as f64).sqrt();

        Ok(Self {
            qkv,
            proj,
            num_heads,
            scale,
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?; // 3,b,h,n,d
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = candle_nn::ops::softmax_last_dim(&q.matmul(&k.t()?)?)?;
        let attn = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&attn)
    }
}

/// Two-layer GELU MLP; weight names depend on the flavor
#[derive(Debug)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let inner = hidden * config.mlp_ratio;
        let (fc1, fc2) = match config.flavor {
            VitFlavor::Dino => (
                candle_nn::linear(hidden, inner, vb.pp("intermediate.dense"))?,
                candle_nn::linear(inner, hidden, vb.pp("output.dense"))?,
            ),
            VitFlavor::Dinov2 => (
                candle_nn::linear(hidden, inner, vb.pp("mlp.fc1"))?,
                candle_nn::linear(inner, hidden, vb.pp("mlp.fc2"))?,
            ),
        };
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

/// Pre-norm transformer block
#[derive(Debug)]
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    ls1: Option<Tensor>,
    norm2: LayerNorm,
    mlp: Mlp,
    ls2: Option<Tensor>,
}

impl Block {
    fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let dim = config.hidden_size;
        let eps = config.layer_norm_eps;
        let (norm1, norm2, ls1, ls2) = match config.flavor {
            VitFlavor::Dino => (
                layer_norm(dim, eps, vb.pp("layernorm_before"))?,
                layer_norm(dim, eps, vb.pp("layernorm_after"))?,
                None,
                None,
            ),
            VitFlavor::Dinov2 => (
                layer_norm(dim, eps, vb.pp("norm1"))?,
                layer_norm(dim, eps, vb.pp("norm2"))?,
                Some(vb.pp("layer_scale1").get(dim, "lambda1")?),
                Some(vb.pp("layer_scale2").get(dim, "lambda1")?),
            ),
        };
        let attn = Attention::load(vb.pp("attention"), config)?;
        let mlp = Mlp::load(vb.clone(), config)?;

        Ok(Self {
            norm1,
            attn,
            ls1,
            norm2,
            mlp,
            ls2,
        })
    }

    fn scale(xs: Tensor, lambda: &Option<Tensor>) -> Result<Tensor> {
        match lambda {
            Some(lambda) => xs.broadcast_mul(lambda),
            None => Ok(xs),
        }
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attn = self.attn.forward(&self.norm1.forward(xs)?)?;
        let xs = (xs + Self::scale(attn, &self.ls1)?)?;

        let mlp = self.mlp.forward(&self.norm2.forward(&xs)?)?;
        &xs + Self::scale(mlp, &self.ls2)?
    }
}

/// Complete ViT returning the final-layer patch feature map
pub struct Vit {
    embeddings: Embeddings,
    layers: Vec<Block>,
    layernorm: LayerNorm,
    config: VitConfig,
}

impl Vit {
    pub fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let embeddings = Embeddings::load(vb.pp("embeddings"), config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| Block::load(vb.pp(format!("encoder.layer.{i}")), config))
            .collect::<Result<Vec<_>>>()?;
        let layernorm = layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("layernorm"))?;

        Ok(Self {
            embeddings,
            layers,
            layernorm,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    /// Last-layer features, layer-normed, special tokens dropped.
    ///
    /// # Arguments
    /// * `pixel_values` - [B, 3, H, W] with H and W multiples of the patch size
    ///
    /// # Returns
    /// Feature map [B, hidden, H / patch, W / patch]
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (batch_size, _, height, width) = pixel_values.dims4()?;

        let mut hidden_states = self.embeddings.forward(pixel_values)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states)?;
        }
        let hidden_states = self.layernorm.forward(&hidden_states)?;

        // Drop the CLS token
        let patch_tokens = hidden_states.i((.., 1.., ..))?;

        let h = height / self.config.patch_size;
        let w = width / self.config.patch_size;
        patch_tokens
            .reshape((batch_size, h, w, self.config.hidden_size))?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }
}
