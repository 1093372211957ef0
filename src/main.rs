use std::path::{Path, PathBuf};

use clap::Parser;
use image::GrayImage;
use ndarray::{Array2, ArrayView2};
use textgt::{
    raster::DistanceImage, util::distance_to_gray, DatasetConfig, Sample, SampleSource, Split, TextDatasetBuilder,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Builds the training targets of one sample and writes them out as PNGs.
#[derive(Parser)]
#[command(name = "textgt")]
struct Cli {
    /// Directory of .jpg/.png images
    #[arg(long)]
    images: PathBuf,

    /// Directory with one `<image stem>.json` annotation per image
    #[arg(long)]
    annotations: Option<PathBuf>,

    /// JSON dataset configuration; defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sample index
    #[arg(long, default_value_t = 0)]
    index: usize,

    /// Overrides the configured seed
    #[arg(long)]
    seed: Option<u64>,

    /// Prepare the sample in test mode
    #[arg(long)]
    test: bool,

    #[arg(short, long, default_value = "textgt_out")]
    output: PathBuf,
}

fn discover(images: &Path, annotations: Option<&Path>) -> std::io::Result<Vec<SampleSource>> {
    let mut image_paths = std::fs::read_dir(images)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("jpg" | "jpeg" | "png")
            )
        })
        .collect::<Vec<_>>();
    image_paths.sort();
    Ok(image_paths
        .into_iter()
        .map(|image_path| {
            let annotation_path = annotations.and_then(|dir| {
                let stem = image_path.file_stem()?.to_string_lossy();
                Some(dir.join(format!("{stem}.json")))
            });
            SampleSource {
                image_path,
                annotation_path,
            }
        })
        .collect())
}

fn save_gray(array: ArrayView2<u8>, scale: u8, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (height, width) = array.dim();
    let pixels = array.iter().map(|v| v.saturating_mul(scale)).collect();
    let image = GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or("raster does not match its shape")?;
    image.save(&path)?;
    log::debug!("Wrote {path:?}");
    Ok(())
}

fn save_distance(array: ArrayView2<f32>, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let (height, width) = array.dim();
    let pixels = array.iter().copied().collect();
    let raster = DistanceImage::from_raw(width as u32, height as u32, pixels)
        .ok_or("raster does not match its shape")?;
    distance_to_gray(&raster).save(&path)?;
    log::debug!("Wrote {path:?}");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => serde_json::from_str::<DatasetConfig>(&std::fs::read_to_string(path)?)?,
        None => DatasetConfig::default(),
    };
    if cli.test {
        config.split = Split::Test;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }

    let samples = discover(&cli.images, cli.annotations.as_deref())?;
    let dataset = TextDatasetBuilder::from_config(config).samples(samples).build()?;
    log::info!("{} samples found in {:?}", dataset.len(), cli.images);

    std::fs::create_dir_all(&cli.output)?;
    let mut rng = dataset.sample_rng(cli.index);
    let out = |name: &str| cli.output.join(format!("{}_{name}.png", cli.index));

    match dataset.get(cli.index, &mut rng)? {
        Sample::Train(sample) => {
            save_gray(sample.gt_text.view(), 255, out("text"))?;
            save_gray(sample.training_mask.view(), 255, out("training_mask"))?;
            save_gray(sample.gt_instance.view(), 37, out("instance"))?;
            for (i, kernel) in sample.gt_kernels.outer_iter().enumerate() {
                save_gray(kernel, 255, out(&format!("kernel_{i}")))?;
            }
            for (i, distance) in sample.gt_distances.outer_iter().enumerate() {
                save_distance(distance, out(&format!("distance_{i}")))?;
            }
            let instances = sample
                .gt_bboxes
                .outer_iter()
                .filter(|row| row.iter().any(|v| *v != 0))
                .count();
            log::info!("Image {:?}, {instances} instances", sample.image.dim());
            if let Some(words) = &sample.words {
                let valid: Array2<i32> = words.gt_words.select(
                    ndarray::Axis(0),
                    &words
                        .word_mask
                        .indexed_iter()
                        .filter(|(_, valid)| **valid == 1)
                        .map(|(i, _)| i)
                        .collect::<Vec<_>>(),
                );
                for row in valid.outer_iter() {
                    log::info!("Word: {}", dataset.vocabulary().decode(row.as_slice().unwrap_or(&[])));
                }
            }
        }
        Sample::Test(sample) => {
            log::info!(
                "Image {:?}, original size {:?}, resized to {:?}",
                sample.image.dim(),
                sample.meta.original_size,
                sample.meta.image_size
            );
        }
    }
    Ok(())
}
