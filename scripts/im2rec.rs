use anyhow::Result;
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use resnet_record::data::{collect_images, pack_images, Encoding, PackOptions};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Jpeg,
    Png,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Pack a class-per-directory image folder into .lst and .rec files")]
struct Args {
    /// Root directory; each sub-directory is one class
    #[arg(short, long)]
    input: PathBuf,

    /// Output prefix, producing `<prefix>.lst` and `<prefix>.rec`
    #[arg(short, long)]
    output: PathBuf,

    /// Shuffle the image order before packing
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    shuffle: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Resize so the shorter edge has this many pixels (0 keeps the original size)
    #[arg(long, default_value_t = 0)]
    resize: u32,

    #[arg(long, value_enum, default_value = "jpeg")]
    format: Format,

    /// JPEG quality
    #[arg(long, default_value_t = 95)]
    quality: u8,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Input directory: {:?}", args.input);
    info!("Output prefix: {:?}", args.output);

    let mut images = collect_images(&args.input)?;
    info!("Found {} images", images.len());

    if images.is_empty() {
        anyhow::bail!("No images found in {:?}", args.input);
    }

    if args.shuffle {
        images.shuffle(&mut StdRng::seed_from_u64(args.seed));
    }

    let options = PackOptions {
        resize: args.resize,
        encoding: match args.format {
            Format::Jpeg => Encoding::Jpeg(args.quality),
            Format::Png => Encoding::Png,
        },
    };
    let summary = pack_images(&images, &args.input, &args.output, &options)?;

    info!("Packing complete!");
    info!("  - Records: {} ({:?})", summary.packed, summary.rec_path);
    info!("  - Skipped: {}", summary.skipped);
    info!("  - List: {:?}", summary.lst_path);

    Ok(())
}
