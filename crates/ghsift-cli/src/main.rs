use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use ghsift_crawl::{profile_by_name, run_crawl, CrawlConfig, DEFAULT_MIN_STARS, DEFAULT_PROFILE};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ghsift")]
#[command(about = "Crawl GitHub repository search, classify what it finds and dump the bins to JSON")]
struct Cli {
    /// Only consider repositories with at least this many stars
    #[arg(long, default_value_t = DEFAULT_MIN_STARS)]
    stars: u32,

    /// Crawl profile to run: android or polymer
    #[arg(long = "type", default_value = DEFAULT_PROFILE)]
    repo_type: String,

    /// Root directory for bin files and metadata.json (env: GHSIFT_OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Directory for downloaded owner avatars (env: GHSIFT_IMAGES_DIR)
    #[arg(long)]
    images_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Reject unknown profiles before touching the network.
    profile_by_name(&cli.repo_type)?;

    let mut config = CrawlConfig::from_env();
    config.profile = cli.repo_type;
    config.min_stars = cli.stars;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(dir) = cli.images_dir {
        config.images_dir = dir;
    }

    let summary = run_crawl(config).await?;
    println!(
        "crawl complete: run_id={} profile={} pages={} seen={} kept={} gated={} calls={} metadata={}",
        summary.run_id,
        summary.profile,
        summary.pages_fetched,
        summary.candidates_seen,
        summary.candidates_retained,
        summary.gated_out,
        summary.remote_calls,
        summary.metadata_file
    );
    for (bin, count) in &summary.bins {
        println!("  {bin}: {count}");
    }

    Ok(())
}
