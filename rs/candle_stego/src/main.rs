//! STEGO unsupervised segmentation with Candle
//!
//! This binary runs a trained STEGO head on top of a DINO / DINOv2 backbone.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_inspect;
mod cmd_predict;

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use candle_stego::model::backbone::BackboneSpec;
use candle_stego::{Stego, StegoConfig};

/// Select the compute device
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Options shared by every subcommand that builds a model
#[derive(clap::Args, Debug)]
pub struct ModelArgs {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    pub cpu: bool,

    /// JSON configuration; missing fields take their defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// STEGO head weights (segmentation head and probes), in safetensors format.
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Backbone weights in safetensors format. Downloaded from the Hugging Face
    /// Hub when neither this nor `pretrained_weights` in the config is set.
    #[arg(long)]
    pub backbone_weights: Option<PathBuf>,

    /// Number of ground-truth classes the probes were trained for.
    #[arg(long, default_value_t = 27)]
    pub n_classes: usize,

    /// Short-side resolution the image is resized to.
    #[arg(long, default_value_t = 320)]
    pub resolution: usize,
}

impl ModelArgs {
    pub fn stego_config(&self) -> anyhow::Result<StegoConfig> {
        let config = match &self.config {
            Some(path) => StegoConfig::from_json_file(path)?,
            None => StegoConfig::default(),
        };
        Ok(config)
    }

    fn backbone_path(&self, config: &StegoConfig) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.backbone_weights {
            return Ok(path.clone());
        }
        if let Some(path) = &config.pretrained_weights {
            return Ok(PathBuf::from(path));
        }
        let spec = BackboneSpec::from_config(config)?;
        let filename = "model.safetensors";
        let api = hf_hub::api::sync::Api::new()?;
        let path = match api.model(spec.hf_repo().to_string()).get(filename) {
            Ok(path) => path,
            // Fall back to local file
            Err(_) => PathBuf::from(filename),
        };
        Ok(path)
    }

    /// Build the model on `device`.
    ///
    /// Without `--weights` the head and probes are freshly initialised, which
    /// is only useful for `inspect`.
    pub fn load_model(&self, device: &Device) -> anyhow::Result<Stego> {
        let config = self.stego_config()?;
        println!("Backbone: {} {}", config.backbone, config.backbone_type);
        println!("  Code dim: {}", config.dim);
        println!("  Classes: {} (+{} extra clusters)", self.n_classes, config.extra_clusters);

        let backbone_path = self.backbone_path(&config)?;
        if !backbone_path.exists() {
            anyhow::bail!(
                "Backbone weights not found at {:?}. Please provide a valid path with \
                --backbone-weights, or ensure the model file exists.",
                backbone_path
            );
        }
        println!("Loading backbone from: {:?}", backbone_path);
        let backbone_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[backbone_path], DType::F32, device)? };

        let model = match &self.weights {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("STEGO weights not found at {:?}", path);
                }
                println!("Loading STEGO weights from: {:?}", path);
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[path.clone()], DType::F32, device)?
                };
                Stego::load(backbone_vb, vb, config, self.n_classes)?
            }
            None => {
                println!("No STEGO weights given, using a randomly initialised head");
                let varmap = candle_nn::VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
                Stego::load(backbone_vb, vb, config, self.n_classes)?
            }
        };
        println!("Model loaded successfully");
        Ok(model)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment an image and write colour-coded label maps.
    Predict(cmd_predict::PredictArgs),
    /// Print correlation loss terms and histogram for an image and its mirror.
    Inspect(cmd_inspect::InspectArgs),
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Predict(args) => cmd_predict::run(&args),
        Command::Inspect(args) => cmd_inspect::run(&args),
    }
}
