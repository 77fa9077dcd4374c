//! Command-line front end for single-shot thumbnail extraction.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use video_thumb_common::{Position, SourceDescriptor, ThumbFormat, ThumbnailRequest};
use video_thumb_service::{ServiceConfig, ThumbnailService};

#[derive(Parser)]
#[command(name = "video-thumb", about = "Extract a thumbnail frame from a video file")]
struct Args {
    /// Input video file
    video: PathBuf,

    /// Position as an absolute offset in milliseconds
    #[arg(long, conflicts_with = "percent")]
    time_ms: Option<u64>,

    /// Position as a percentage of the duration (0-100)
    #[arg(long)]
    percent: Option<f64>,

    /// Maximum output width in pixels (0 = unbounded)
    #[arg(long, default_value_t = 320)]
    max_width: u32,

    /// Maximum output height in pixels (0 = unbounded)
    #[arg(long, default_value_t = 240)]
    max_height: u32,

    /// Output format: jpeg, png, or webp
    #[arg(long, default_value = "jpeg")]
    format: ThumbFormat,

    /// Encode quality (0-100, ignored for png)
    #[arg(long, default_value_t = 80)]
    quality: u8,

    /// Output file or directory; defaults to the input path with the
    /// format's extension
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Stretch to exactly max-width x max-height instead of fitting
    #[arg(long)]
    stretch: bool,

    /// Skip the in-memory thumbnail cache
    #[arg(long)]
    no_cache: bool,

    /// Print cache statistics as JSON after extraction
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let position = match (args.time_ms, args.percent) {
        (Some(t), _) => Position::TimeMs(t),
        (None, Some(p)) => Position::Percent(p),
        // Matches the common "poster frame" default of sampling early in
        // the clip rather than the black frame at t=0.
        (None, None) => Position::Percent(10.0),
    };

    let mut request = ThumbnailRequest::new(SourceDescriptor::Path(args.video.clone()), position);
    request.max_width = args.max_width;
    request.max_height = args.max_height;
    request.preserve_aspect = !args.stretch;
    request.format = args.format;
    request.quality = args.quality;
    request.use_cache = !args.no_cache;

    let service = ThumbnailService::new(ServiceConfig::default());
    let written = service
        .extract_to_file(&request, args.output.as_deref())
        .await
        .with_context(|| format!("failed to extract thumbnail from {}", args.video.display()))?;

    info!("thumbnail written to {}", written.display());
    println!("{}", written.display());
    if args.stats {
        println!("{}", serde_json::to_string(&service.cache_stats())?);
    }
    Ok(())
}
