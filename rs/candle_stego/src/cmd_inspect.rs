//! Inspect subcommand: correlation loss of an image against its mirror.

use candle_core::{DType, Tensor};
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;

use candle_stego::{preprocess, CorrelationHistogram};

use crate::ModelArgs;

/// Arguments for the inspect subcommand
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Input image to process.
    pub image: String,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Seed for coordinate sampling and negative pairings.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Width of the printed histogram bars.
    #[arg(long, default_value_t = 50)]
    pub bar_width: usize,
}

fn mean(t: &Tensor) -> anyhow::Result<f32> {
    Ok(t.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

fn print_histogram(name: &str, hist: &CorrelationHistogram, bar_width: usize) {
    println!("{} ({} values)", name, hist.total());
    let normalized = hist.normalized();
    let peak = normalized.iter().cloned().fold(0f32, f32::max);
    for (center, p) in hist.bin_centers().iter().zip(normalized.iter()) {
        let len = if peak > 0.0 {
            (p / peak * bar_width as f32).round() as usize
        } else {
            0
        };
        println!("  {:+.3} {:.4} {}", center, p, "#".repeat(len));
    }
}

pub fn run(args: &InspectArgs) -> anyhow::Result<()> {
    let device = crate::device(args.model.cpu)?;
    println!("Using device: {:?}", device);

    let model = args.model.load_model(&device)?;
    let patch_size = model.backbone().patch_size();

    let (img, h_orig, w_orig) =
        preprocess::preprocess_image(&args.image, args.model.resolution, patch_size, &device)?;
    println!("  Input tensor shape: {:?}", img.dims());
    println!("  Original image size: {}x{}", w_orig, h_orig);

    // The image and its mirror form a batch of two, each the other's partner
    let flipped = preprocess::flip_horizontal(&img)?;
    let batch = Tensor::cat(&[&img, &flipped], 0)?;
    let batch_pos = Tensor::cat(&[&flipped, &img], 0)?;

    let (feats, code) = model.forward(&batch)?;
    let (feats_pos, code_pos) = model.forward(&batch_pos)?;
    println!("  feats shape: {:?}", feats.dims());
    println!("  code shape: {:?}", code.dims());

    let mut rng = StdRng::seed_from_u64(args.seed);
    let losses = model
        .loss_fn()
        .forward(&feats, &feats_pos, &code, &code_pos, &mut rng)?;

    println!("Correlation loss terms:");
    println!("  pos_intra: {:.5}", mean(&losses.pos_intra_loss)?);
    println!("  pos_inter: {:.5}", mean(&losses.pos_inter_loss)?);
    println!("  neg_inter: {:.5}", mean(&losses.neg_inter_loss)?);

    for (name, cd) in [
        ("pos_intra_cd", &losses.pos_intra_cd),
        ("pos_inter_cd", &losses.pos_inter_cd),
        ("neg_inter_cd", &losses.neg_inter_cd),
    ] {
        let mut hist = CorrelationHistogram::default();
        hist.add(cd)?;
        print_histogram(name, &hist, args.bar_width);
    }

    Ok(())
}
