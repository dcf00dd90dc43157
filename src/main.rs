//! Segment Stitch CLI
//!
//! Stitches segmented tiles into the final segmentation, computes requested
//! statistics, uploads the result and removes the intermediates.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use segment_stitch::{build_runtime, peak_rss_kb, run_stitch, DocumentLocation, Settings, StitchConfig};

#[derive(Parser, Debug)]
#[command(name = "segment-stitch")]
#[command(about = "Stitch segmented tiles into one segmentation and publish it", long_about = None)]
struct Cli {
    /// Bucket to use
    #[arg(long)]
    bucket: String,

    /// Path in --bucket to use as input file
    #[arg(long)]
    infile: String,

    /// Path in --bucket to use as output file (.kea)
    #[arg(long)]
    outfile: String,

    /// Unique prefix the tiles were saved with
    #[arg(long)]
    tileprefix: String,

    /// Name of the preparation state in --bucket
    #[arg(long)]
    pickle: String,

    /// Tile overlap in pixels
    #[arg(long)]
    overlapsize: u32,

    /// Aggregate statistics request as bucket:path/in/bucket.json. Contents
    /// must be a list of [img, band, statsSelection] tuples
    #[arg(long)]
    stats: Option<DocumentLocation>,

    /// Spatial statistics request as bucket:path/in/bucket.json. Contents must
    /// be a list of [img, band, [[colName, colType], ...], userFunc, param]
    /// tuples
    #[arg(long)]
    spatialstats: Option<DocumentLocation>,

    /// Don't calculate raster statistics, colour table or overviews
    #[arg(long)]
    nogdalstats: bool,

    /// Don't remove tiles and documents from the bucket (for debugging)
    #[arg(long)]
    noremove: bool,

    /// Number of read workers used while calculating stats
    #[arg(long, default_value_t = 0)]
    statsreadworkers: usize,

    /// Timeout in seconds applied to all four statistics buffer operations
    #[arg(long)]
    readworkerstimeouts: Option<u64>,

    /// Settings file (YAML or JSON)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Tokio worker threads (default: number of cores)
    #[arg(long)]
    worker_threads: Option<usize>,
}

impl Cli {
    fn into_config(self) -> Result<(StitchConfig, Option<usize>)> {
        let settings = match &self.settings {
            Some(path) => Settings::from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };

        let config = StitchConfig {
            bucket: self.bucket,
            infile: self.infile,
            outfile: self.outfile,
            tile_prefix: self.tileprefix,
            state_key: self.pickle,
            overlap_size: self.overlapsize,
            stats: self.stats,
            spatial_stats: self.spatialstats,
            skip_default_stats: self.nogdalstats,
            keep_intermediates: self.noremove,
            stats_read_workers: self.statsreadworkers,
            read_worker_timeouts: self.readworkerstimeouts,
            settings,
        };
        Ok((config, self.worker_threads))
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let (config, worker_threads) = cli.into_config()?;

    let runtime = build_runtime(worker_threads)?;
    let outcome = runtime.block_on(async { run_stitch(config).await })?;
    tracing::debug!("Outcome: {:?}", outcome);

    println!("Max Mem Usage {}", peak_rss_kb());
    Ok(())
}
