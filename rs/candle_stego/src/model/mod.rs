pub mod backbone;
pub mod segmentation_head;
pub mod vit;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Conv2d, VarBuilder, VarMap};
use rand::Rng;

use crate::cluster::{assign_to_centers, ClusterLookup};
use crate::config::StegoConfig;
use crate::crf::DenseCrf;
use crate::error::{Result, StegoError};
use crate::kmeans::{kmeans_code_map, KMeansConfig};
use crate::loss::ContrastiveCorrelationLoss;
use crate::model::backbone::{channel_dropout, load_backbone, Backbone};
use crate::model::segmentation_head::{linear_probe, SegmentationHead};
use crate::preprocess::flip_horizontal;

/// Softmax scale used with per-image k-means centers
const IMAGE_CLUSTER_TEMPERATURE: f64 = 2.0;

/// Loss terms of one training step
///
/// `total` carries the graph for backpropagation; the scalar fields are
/// detached copies for logging.
#[derive(Debug)]
pub struct TrainingLosses {
    pub total: Tensor,
    pub pos_intra: f32,
    pub pos_inter: f32,
    pub neg_inter: f32,
    pub linear: f32,
    pub cluster: f32,
    /// Raw code correlations, for histograms
    pub pos_intra_cd: Tensor,
    pub pos_inter_cd: Tensor,
    pub neg_inter_cd: Tensor,
}

/// Postprocessing switches
#[derive(Debug, Clone, PartialEq)]
pub struct PostprocessOptions {
    /// Refine cluster-probe probabilities with the CRF
    pub use_crf_cluster: bool,
    /// Refine linear-probe probabilities with the CRF
    pub use_crf_linear: bool,
    /// Replace the learned prototypes with per-image k-means centers
    pub image_clustering: bool,
    /// Number of k-means clusters when `image_clustering` is set
    pub n_image_clusters: usize,
}

impl Default for PostprocessOptions {
    fn default() -> Self {
        Self {
            use_crf_cluster: true,
            use_crf_linear: true,
            image_clustering: false,
            n_image_clusters: 0,
        }
    }
}

/// STEGO: frozen backbone, trainable segmentation head and two probes
pub struct Stego {
    config: StegoConfig,
    n_classes: usize,
    backbone: Box<dyn Backbone>,
    segmentation_head: SegmentationHead,
    cluster_probe: ClusterLookup,
    linear_probe: Conv2d,
    /// Variables of a linear probe rebuilt by `reset_clusters`
    linear_vars: Option<VarMap>,
    loss: ContrastiveCorrelationLoss,
    crf: DenseCrf,
    device: Device,
}

impl Stego {
    /// Assemble the model around an already constructed backbone.
    ///
    /// `vb` holds `segmentation_head.*`, `cluster_probe.clusters` and
    /// `linear_probe.*`.
    pub fn new(
        backbone: Box<dyn Backbone>,
        vb: VarBuilder,
        config: StegoConfig,
        n_classes: usize,
    ) -> Result<Self> {
        config.validate()?;
        if n_classes == 0 {
            return Err(StegoError::config("n_classes must be positive"));
        }
        let device = vb.device().clone();
        let segmentation_head =
            SegmentationHead::load(vb.pp("segmentation_head"), backbone.output_dim(), config.dim)?;
        let cluster_probe = ClusterLookup::load(
            vb.pp("cluster_probe"),
            config.dim,
            n_classes + config.extra_clusters,
        )?;
        let linear_probe = linear_probe(vb.pp("linear_probe"), config.dim, n_classes)?;
        let loss = ContrastiveCorrelationLoss::new(config.loss.clone())?;
        let crf = DenseCrf::new(config.crf.clone())?;

        tracing::info!(
            backbone = %backbone.name(),
            dim = config.dim,
            n_classes,
            extra_clusters = config.extra_clusters,
            "STEGO model ready"
        );
        Ok(Self {
            config,
            n_classes,
            backbone,
            segmentation_head,
            cluster_probe,
            linear_probe,
            linear_vars: None,
            loss,
            crf,
            device,
        })
    }

    /// Load the configured backbone from `backbone_vb` and the STEGO heads from `vb`
    pub fn load(
        backbone_vb: VarBuilder,
        vb: VarBuilder,
        config: StegoConfig,
        n_classes: usize,
    ) -> Result<Self> {
        let backbone = load_backbone(backbone_vb, &config)?;
        Self::new(backbone, vb, config, n_classes)
    }

    pub fn config(&self) -> &StegoConfig {
        &self.config
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn cluster_probe(&self) -> &ClusterLookup {
        &self.cluster_probe
    }

    pub fn loss_fn(&self) -> &ContrastiveCorrelationLoss {
        &self.loss
    }

    pub fn crf(&self) -> &DenseCrf {
        &self.crf
    }

    /// Probe variables an optimizer may step: the cluster prototypes and,
    /// after [`Stego::reset_clusters`], the rebuilt linear probe.
    pub fn probe_vars(&self) -> Vec<Var> {
        let mut vars = vec![self.cluster_probe.var().clone()];
        if let Some(varmap) = &self.linear_vars {
            vars.extend(varmap.all_vars());
        }
        vars
    }

    /// Backbone features and segmentation code for images [B, 3, H, W]
    pub fn forward(&self, img: &Tensor) -> Result<(Tensor, Tensor)> {
        let feats = self.backbone.features(img)?;
        let code = self.segmentation_head.forward(&feats)?;
        Ok((feats, code))
    }

    /// As [`Stego::forward`], with channel dropout on the features
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        img: &Tensor,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let feats = self.backbone.features(img)?;
        let feats = channel_dropout(&feats, self.config.dropout_p, rng)?;
        let code = self.segmentation_head.forward(&feats)?;
        Ok((feats, code))
    }

    /// Code averaged over the image and its horizontal mirror
    pub fn get_code(&self, img: &Tensor) -> Result<Tensor> {
        let (_, code1) = self.forward(img)?;
        let (_, code2) = self.forward(&flip_horizontal(img)?)?;
        Ok(((code1 + flip_horizontal(&code2)?)? / 2.0)?)
    }

    /// Class logits of the linear probe for a code map
    pub fn linear_logits(&self, code: &Tensor) -> Result<Tensor> {
        Ok(self.linear_probe.forward(code)?)
    }

    /// Loss terms for one step on images and their positive pairs.
    ///
    /// # Arguments
    /// * `img` - Images [B, 3, H, W]
    /// * `img_pos` - Positive partners [B, 3, H, W]
    /// * `label` - Per-pixel class ids [B, H_l, W_l] (i64); ids outside
    ///   `[0, n_classes)` are ignored by the linear probe
    ///
    /// The probes train on the detached code, so their losses do not reach
    /// the segmentation head. No optimizer is stepped here.
    pub fn training_losses<R: Rng + ?Sized>(
        &self,
        img: &Tensor,
        img_pos: &Tensor,
        label: &Tensor,
        rng: &mut R,
    ) -> Result<TrainingLosses> {
        let (feats, code) = self.forward_train(img, rng)?;
        let (feats_pos, code_pos) = self.forward_train(img_pos, rng)?;

        let corr = self
            .loss
            .forward(&feats, &feats_pos, &code, &code_pos, rng)?;
        let pos_intra_loss = corr.pos_intra_loss.mean_all()?;
        let pos_inter_loss = corr.pos_inter_loss.mean_all()?;
        let neg_inter_loss = corr.neg_inter_loss.mean_all()?;

        let cfg = &self.config.loss;
        let corr_loss = ((&pos_intra_loss * cfg.pos_intra_weight)?
            + (&pos_inter_loss * cfg.pos_inter_weight)?)?
            .add(&(&neg_inter_loss * cfg.neg_inter_weight)?)?;

        let detached_code = code.detach();
        let linear_loss = self.linear_loss(&detached_code, label)?;
        let (cluster_loss, _) = self.cluster_probe.assign(&detached_code, None)?;

        let total = ((corr_loss + &linear_loss)? + &cluster_loss)?;

        let scalar = |t: &Tensor| -> Result<f32> { Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?) };
        let losses = TrainingLosses {
            total,
            pos_intra: scalar(&pos_intra_loss)?,
            pos_inter: scalar(&pos_inter_loss)?,
            neg_inter: scalar(&neg_inter_loss)?,
            linear: scalar(&linear_loss)?,
            cluster: scalar(&cluster_loss)?,
            pos_intra_cd: corr.pos_intra_cd,
            pos_inter_cd: corr.pos_inter_cd,
            neg_inter_cd: corr.neg_inter_cd,
        };
        tracing::debug!(
            pos_intra = losses.pos_intra,
            pos_inter = losses.pos_inter,
            neg_inter = losses.neg_inter,
            linear = losses.linear,
            cluster = losses.cluster,
            "training losses"
        );
        Ok(losses)
    }

    /// Cross-entropy of the linear probe on labelled pixels
    fn linear_loss(&self, code: &Tensor, label: &Tensor) -> Result<Tensor> {
        let (b, h, w) = label.dims3()?;
        let logits = self
            .linear_probe
            .forward(code)?
            .upsample_bilinear2d(h, w, false)?
            .permute((0, 2, 3, 1))?
            .reshape((b * h * w, self.n_classes))?;

        let flat_label: Vec<i64> = label.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
        let n_classes = self.n_classes as i64;
        let (keep, targets): (Vec<u32>, Vec<u32>) = flat_label
            .iter()
            .enumerate()
            .filter(|(_, l)| (0..n_classes).contains(*l))
            .map(|(i, l)| (i as u32, *l as u32))
            .unzip();

        if keep.is_empty() {
            tracing::warn!("no labelled pixels in batch, linear loss is zero");
            return Ok(Tensor::zeros((), logits.dtype(), logits.device())?);
        }
        let n = keep.len();
        let keep = Tensor::from_vec(keep, n, logits.device())?;
        let targets = Tensor::from_vec(targets, n, logits.device())?;
        let logits = logits.index_select(&keep, 0)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
    }

    /// Replace both probes with freshly initialised ones
    pub fn reset_clusters<R: Rng + ?Sized>(
        &mut self,
        n_classes: usize,
        extra_clusters: usize,
        rng: &mut R,
    ) -> Result<()> {
        if n_classes == 0 {
            return Err(StegoError::config("n_classes must be positive"));
        }
        self.cluster_probe.reset(n_classes, extra_clusters, rng)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        self.linear_probe = linear_probe(vb, self.config.dim, n_classes)?;
        self.linear_vars = Some(varmap);
        self.n_classes = n_classes;
        self.config.extra_clusters = extra_clusters;
        Ok(())
    }

    /// Cluster and linear predictions at image resolution.
    ///
    /// # Arguments
    /// * `code` - Code map [B, dim, h, w], typically from [`Stego::get_code`]
    /// * `img` - ImageNet-normalized images [B, 3, H, W]
    ///
    /// # Returns
    /// `(cluster_preds, linear_preds)`, both [B, H, W] u32 on the CPU
    pub fn postprocess(
        &self,
        code: &Tensor,
        img: &Tensor,
        options: &PostprocessOptions,
    ) -> Result<(Tensor, Tensor)> {
        let (b, _, h, w) = img.dims4()?;
        if code.dim(0)? != b {
            return Err(StegoError::precondition(format!(
                "{} code maps for {} images",
                code.dim(0)?,
                b
            )));
        }
        let code = code.upsample_bilinear2d(h, w, false)?;

        let cluster_probs = if options.image_clustering {
            self.image_cluster_probs(&code, options.n_image_clusters)?
        } else {
            self.cluster_probe
                .log_assign(&code, self.config.cluster_temperature)?
                .exp()?
        };
        let linear_probs = candle_nn::ops::softmax(&self.linear_probe.forward(&code)?, 1)?;

        let cpu = Device::Cpu;
        let img = img.to_device(&cpu)?;
        let predict = |probs: Tensor, use_crf: bool| -> Result<Tensor> {
            let probs = probs.to_dtype(DType::F32)?.to_device(&cpu)?;
            if use_crf {
                self.crf.refine_batch(&img, &probs)
            } else {
                Ok(probs.argmax(1)?)
            }
        };
        let cluster_preds = predict(cluster_probs, options.use_crf_cluster)?;
        let linear_preds = predict(linear_probs, options.use_crf_linear)?;
        Ok((cluster_preds, linear_preds))
    }

    /// Per-image k-means on the normalized code, softmax at temperature 2
    fn image_cluster_probs(&self, code: &Tensor, n_clusters: usize) -> Result<Tensor> {
        if n_clusters == 0 {
            return Err(StegoError::config(
                "image clustering needs n_image_clusters > 0",
            ));
        }
        let kmeans_config = KMeansConfig::new(n_clusters);
        let mut probs = Vec::with_capacity(code.dim(0)?);
        for j in 0..code.dim(0)? {
            let single = code.get(j)?;
            let fit = kmeans_code_map(&single, &kmeans_config)?;
            let centers = fit.normalized_centers(code.device())?;
            probs.push(assign_to_centers(
                &single.unsqueeze(0)?,
                &centers,
                IMAGE_CLUSTER_TEMPERATURE,
            )?);
        }
        Ok(Tensor::cat(&probs, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrfConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Patch-averaged pixels as 3-channel "features"
    struct PatchMean {
        patch: usize,
    }

    impl Backbone for PatchMean {
        fn features(&self, img: &Tensor) -> Result<Tensor> {
            Ok(img.avg_pool2d(self.patch)?.detach())
        }

        fn output_dim(&self) -> usize {
            3
        }

        fn name(&self) -> String {
            "patch-mean".to_string()
        }

        fn patch_size(&self) -> usize {
            self.patch
        }
    }

    fn small_config() -> StegoConfig {
        let mut config = StegoConfig {
            dim: 6,
            ..StegoConfig::default()
        };
        config.loss.feature_samples = 4;
        config.loss.neg_samples = 2;
        config.crf = CrfConfig {
            crf_max_iter: 2,
            ..CrfConfig::default()
        };
        config
    }

    fn model(n_classes: usize) -> (Stego, VarMap) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let stego = Stego::new(
            Box::new(PatchMean { patch: 4 }),
            vb,
            small_config(),
            n_classes,
        )
        .unwrap();
        (stego, varmap)
    }

    #[test]
    fn test_forward_shapes() {
        let (stego, _) = model(3);
        let img = Tensor::randn(0f32, 1.0, (2, 3, 16, 24), &Device::Cpu).unwrap();
        let (feats, code) = stego.forward(&img).unwrap();
        assert_eq!(feats.dims(), &[2, 3, 4, 6]);
        assert_eq!(code.dims(), &[2, 6, 4, 6]);
        assert_eq!(stego.get_code(&img).unwrap().dims(), &[2, 6, 4, 6]);
    }

    #[test]
    fn test_flip_averaged_code_is_mirror_symmetric() {
        let (stego, _) = model(3);
        let img = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &Device::Cpu).unwrap();
        let code = stego.get_code(&img).unwrap();
        let mirrored = stego.get_code(&flip_horizontal(&img).unwrap()).unwrap();
        let diff: f32 = (flip_horizontal(&mirrored).unwrap() - code)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_training_losses() {
        let (stego, varmap) = model(3);
        let device = Device::Cpu;
        let img = Tensor::randn(0f32, 1.0, (3, 3, 16, 16), &device).unwrap();
        let img_pos = Tensor::randn(0f32, 1.0, (3, 3, 16, 16), &device).unwrap();
        let mut labels = vec![0i64; 3 * 16 * 16];
        for (i, l) in labels.iter_mut().enumerate() {
            *l = (i % 5) as i64 - 1; // includes -1 and 3, both ignored
        }
        let label = Tensor::from_vec(labels, (3, 16, 16), &device).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let losses = stego.training_losses(&img, &img_pos, &label, &mut rng).unwrap();
        assert!(losses.total.dims().is_empty());
        assert!(losses.linear > 0.0);
        assert!((-1.0..=1.0).contains(&losses.cluster));
        assert_eq!(losses.neg_inter_cd.dims(), &[6, 4, 4, 4, 4]);

        let expected = 0.67 * losses.pos_intra
            + 0.25 * losses.pos_inter
            + 0.63 * losses.neg_inter
            + losses.linear
            + losses.cluster;
        let total: f32 = losses.total.to_scalar().unwrap();
        assert!((total - expected).abs() < 1e-4);

        // Gradients reach the head and both probes
        let grads = losses.total.backward().unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "segmentation_head.linear.0.weight",
            "linear_probe.weight",
            "cluster_probe.clusters",
        ] {
            assert!(grads.get(data[name].as_tensor()).is_some(), "{name}");
        }
    }

    #[test]
    fn test_training_losses_follow_the_seed() {
        let (stego, _) = model(3);
        let device = Device::Cpu;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
        let label = Tensor::zeros((2, 8, 8), DType::I64, &device).unwrap();
        let run = |seed: u64| -> Vec<f32> {
            let mut rng = StdRng::seed_from_u64(seed);
            let losses = stego.training_losses(&img, &img, &label, &mut rng).unwrap();
            vec![losses.pos_intra, losses.pos_inter, losses.neg_inter]
        };
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn test_unlabelled_batch_has_zero_linear_loss() {
        let (stego, _) = model(3);
        let device = Device::Cpu;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
        let label = Tensor::full(-1i64, (2, 8, 8), &device).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let losses = stego.training_losses(&img, &img, &label, &mut rng).unwrap();
        assert_eq!(losses.linear, 0.0);
    }

    #[test]
    fn test_reset_clusters() {
        let (mut stego, _) = model(3);
        stego.reset_clusters(5, 2, &mut StdRng::seed_from_u64(4)).unwrap();
        assert_eq!(stego.cluster_probe().n_clusters(), 7);
        assert_eq!(stego.n_classes(), 5);
        assert_eq!(stego.probe_vars().len(), 3);

        let code = Tensor::randn(0f32, 1.0, (1, 6, 2, 2), &Device::Cpu).unwrap();
        assert_eq!(stego.linear_logits(&code).unwrap().dim(1).unwrap(), 5);
    }

    #[test]
    fn test_postprocess() {
        let (stego, _) = model(3);
        let device = Device::Cpu;
        let img = Tensor::randn(0f32, 1.0, (2, 3, 12, 12), &device).unwrap();
        let code = stego.get_code(&img).unwrap();

        let (cluster, linear) = stego
            .postprocess(&code, &img, &PostprocessOptions::default())
            .unwrap();
        assert_eq!(cluster.dims(), &[2, 12, 12]);
        assert_eq!(linear.dims(), &[2, 12, 12]);
        let values: Vec<u32> = cluster.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v < 3));

        let options = PostprocessOptions {
            use_crf_cluster: false,
            use_crf_linear: false,
            image_clustering: true,
            n_image_clusters: 4,
        };
        let (cluster, _) = stego.postprocess(&code, &img, &options).unwrap();
        let values: Vec<u32> = cluster.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v < 4));

        let options = PostprocessOptions {
            image_clustering: true,
            n_image_clusters: 0,
            ..PostprocessOptions::default()
        };
        assert!(stego.postprocess(&code, &img, &options).is_err());
    }
}
