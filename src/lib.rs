//! Segment Stitch
//!
//! Finalization stage of a tiled raster segmentation pipeline. Upstream
//! workers segment overlapping tiles of a large raster and save each tile and
//! a shared preparation state to an object store. This crate reassembles the
//! tiles into one segmentation with globally unique segment ids, computes
//! per-segment statistics, publishes the result and removes the
//! intermediates.
//!
//! # Architecture
//!
//! - **Tiles / State**: tile naming shared with the tiling stage, and the
//!   preparation state and statistics request documents
//! - **I/O**: blob store access using object_store and batched cleanup
//! - **Raster**: the finalization engine and the output raster handle (GDAL)
//! - **Stats**: concurrent tiled per-segment statistics
//! - **Callbacks**: registry of named spatial statistic functions
//! - **Pipeline**: the stage-by-stage run with metrics
//!
//! # Usage
//!
//! ```no_run
//! use segment_stitch::{run_stitch, Settings, StitchConfig};
//!
//! #[tokio::main]
//! async fn main() -> segment_stitch::Result<()> {
//!     let config = StitchConfig {
//!         bucket: "my-bucket".to_string(),
//!         infile: "input/image.tif".to_string(),
//!         outfile: "output/segs.kea".to_string(),
//!         tile_prefix: "run1".to_string(),
//!         state_key: "run1.json".to_string(),
//!         overlap_size: 1024,
//!         stats: None,
//!         spatial_stats: None,
//!         skip_default_stats: false,
//!         keep_intermediates: false,
//!         stats_read_workers: 4,
//!         read_worker_timeouts: None,
//!         settings: Settings::default(),
//!     };
//!     let outcome = run_stitch(config).await?;
//!     println!("max segment id {}", outcome.max_segment_id);
//!     Ok(())
//! }
//! ```

pub mod callbacks;
pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod raster;
pub mod state;
pub mod stats;
pub mod tiles;

pub use callbacks::{CallbackRegistry, SpatialPixel, SpatialStatFn};
pub use config::{ConcurrencyStyle, DocumentLocation, Settings, StitchConfig};
pub use error::{Result, StitchError};
pub use io::{BlobStore, CleanupSet, ObjectBlobStore};
pub use pipeline::{peak_rss_kb, StitchMetrics, StitchOutcome, Stitcher};
pub use raster::{CommandFinalizer, Finalizer, SegmentRaster};
pub use stats::{GdalStatsBackend, StatisticsEngine, TiledStatsEngine};
pub use tiles::{tile_key, TileCoord, TileSet};

use std::sync::Arc;

/// Build a [`Stitcher`] over S3 (or a local store root), the external
/// finalization program and the GDAL statistics engine.
pub fn production_stitcher(settings: &Settings) -> Stitcher {
    let store = Arc::new(ObjectBlobStore::from_config(&settings.store));
    let finalizer = Arc::new(CommandFinalizer::from_config(&settings.finalizer));
    let stats = Arc::new(TiledStatsEngine::new(
        GdalStatsBackend::new(),
        settings.stats.block_size,
    ));
    Stitcher::new(store, finalizer, stats, CallbackRegistry::with_builtins())
}

/// Run the finalization stage with the production collaborators.
pub async fn run_stitch(config: StitchConfig) -> Result<StitchOutcome> {
    tracing::info!("Starting segment stitch");
    let stitcher = production_stitcher(&config.settings);
    stitcher.run(&config).await
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
