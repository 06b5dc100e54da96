//! Predict subcommand: cluster and linear-probe segmentation of one image.

use std::time::Instant;

use clap::Args;
use image::{imageops::FilterType, RgbImage};

use candle_core::Tensor;
use candle_stego::{preprocess, PostprocessOptions};

use crate::ModelArgs;

/// Arguments for the predict subcommand
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Input image to process.
    pub image: String,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Refine predictions with the dense CRF (default).
    #[arg(long, conflicts_with = "no_crf")]
    pub crf: bool,

    /// Skip CRF refinement.
    #[arg(long)]
    pub no_crf: bool,

    /// Cluster with per-image k-means into this many segments instead of the
    /// learned prototypes.
    #[arg(long)]
    pub image_clusters: Option<usize>,
}

impl PredictArgs {
    fn use_crf(&self) -> bool {
        self.crf || !self.no_crf
    }
}

/// Color palette for label ids
const LABEL_COLORS: [[u8; 3]; 20] = [
    [255, 64, 64],   // red
    [255, 161, 54],  // orange
    [255, 221, 51],  // yellow
    [170, 255, 50],  // lime
    [50, 255, 50],   // green
    [50, 255, 170],  // mint
    [50, 255, 255],  // cyan
    [50, 170, 255],  // sky blue
    [50, 50, 255],   // blue
    [161, 50, 255],  // purple
    [255, 50, 255],  // magenta
    [255, 50, 161],  // pink
    [128, 128, 255], // light blue
    [255, 128, 128], // light red
    [128, 255, 128], // light green
    [255, 255, 128], // light yellow
    [128, 255, 255], // light cyan
    [255, 128, 255], // light magenta
    [192, 192, 192], // silver
    [255, 200, 100], // peach
];

fn label_color(label: u32) -> image::Rgb<u8> {
    image::Rgb(LABEL_COLORS[label as usize % LABEL_COLORS.len()])
}

/// Paint a [H, W] u32 label map and scale it back to the original image size
fn colorize(labels: &Tensor, width: u32, height: u32) -> anyhow::Result<RgbImage> {
    let (h, w) = labels.dims2()?;
    let values: Vec<u32> = labels.flatten_all()?.to_vec1()?;
    let painted = RgbImage::from_fn(w as u32, h as u32, |x, y| {
        label_color(values[y as usize * w + x as usize])
    });
    Ok(image::imageops::resize(
        &painted,
        width,
        height,
        FilterType::Nearest,
    ))
}

fn count_segments(labels: &Tensor) -> anyhow::Result<usize> {
    let mut values: Vec<u32> = labels.flatten_all()?.to_vec1()?;
    values.sort_unstable();
    values.dedup();
    Ok(values.len())
}

pub fn run(args: &PredictArgs) -> anyhow::Result<()> {
    let device = crate::device(args.model.cpu)?;
    println!("Using device: {:?}", device);

    let model = args.model.load_model(&device)?;
    let patch_size = model.backbone().patch_size();

    println!("Preprocessing image...");
    let (img, h_orig, w_orig) =
        preprocess::preprocess_image(&args.image, args.model.resolution, patch_size, &device)?;
    println!("  Input tensor shape: {:?}", img.dims());
    println!("  Original image size: {}x{}", w_orig, h_orig);

    println!("Running model inference...");
    let start = Instant::now();
    let code = model.get_code(&img)?;
    println!("  code shape: {:?}", code.dims());

    let options = PostprocessOptions {
        use_crf_cluster: args.use_crf(),
        use_crf_linear: args.use_crf(),
        image_clustering: args.image_clusters.is_some(),
        n_image_clusters: args.image_clusters.unwrap_or(0),
    };
    println!("Post-processing (crf: {})...", options.use_crf_cluster);
    let (cluster_preds, linear_preds) = model.postprocess(&code, &img, &options)?;
    println!("  Done in {:.2?}", start.elapsed());

    for (suffix, preds) in [("clusters", cluster_preds), ("linear", linear_preds)] {
        let labels = preds.get(0)?;
        let painted = colorize(&labels, w_orig as u32, h_orig as u32)?;
        let output_path = format!("{}.{}.png", args.image, suffix);
        painted.save(&output_path)?;
        println!(
            "{} segments in {} map saved to: {}",
            count_segments(&labels)?,
            suffix,
            output_path
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_colorize_scales_with_nearest_labels() {
        let labels = Tensor::from_vec(vec![0u32, 1, 2, 21], (2, 2), &Device::Cpu).unwrap();
        let img = colorize(&labels, 4, 4).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(*img.get_pixel(0, 0), label_color(0));
        assert_eq!(*img.get_pixel(3, 0), label_color(1));
        assert_eq!(*img.get_pixel(0, 3), label_color(2));
        // Palette wraps around
        assert_eq!(*img.get_pixel(3, 3), label_color(1));
        assert_eq!(count_segments(&labels).unwrap(), 4);
    }
}
