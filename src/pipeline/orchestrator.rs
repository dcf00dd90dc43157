//! The finalization run, stage by stage.
//!
//! ```text
//! fetch state ─▶ open input ─▶ resolve tiles ─▶ finalize ─▶ tile cleanup
//!   ─▶ default stats ─▶ close ─▶ aggregate stats ─▶ spatial stats
//!   ─▶ publish ─▶ final cleanup ─▶ local cleanup
//! ```
//!
//! Stages run strictly one after another. Any error aborts the run; blobs
//! not yet deleted stay in the bucket and the temp directory is removed
//! when the [`RunContext`] drops.

use crate::callbacks::CallbackRegistry;
use crate::config::{DocumentLocation, StitchConfig};
use crate::error::{Result, StitchError};
use crate::io::{BlobStore, CleanupSet};
use crate::pipeline::metrics::StitchMetrics;
use crate::raster::{ClosedRaster, FinalizeRequest, Finalizer, SegmentRaster};
use crate::state::{parse_aggregate_request, parse_spatial_request, PreparationState};
use crate::stats::StatisticsEngine;
use crate::tiles::{TileCoord, TileSet};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchOutcome {
    /// Largest segment id assigned by the finalization engine
    pub max_segment_id: u64,
    /// Whether any segment ended up with no pixels
    pub has_empty_segments: bool,
    /// Tile blobs deleted after finalization
    pub tiles_deleted: usize,
    /// State and request documents deleted at the end
    pub documents_deleted: usize,
    /// Size of the published artifact
    pub uploaded_bytes: u64,
}

/// Per-run scratch space and metrics sink.
///
/// The temp directory is removed when the context is closed or dropped, so
/// every exit path cleans up.
pub struct RunContext {
    temp_dir: TempDir,
    metrics: Arc<StitchMetrics>,
}

impl RunContext {
    /// Create the run's temp directory under `temp_root`, or the system temp
    /// directory.
    pub fn new(temp_root: Option<&Path>, metrics: Arc<StitchMetrics>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("segstitch-");
        let temp_dir = match temp_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        tracing::debug!("Working in {}", temp_dir.path().display());
        Ok(Self { temp_dir, metrics })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn metrics(&self) -> &StitchMetrics {
        &self.metrics
    }

    /// Remove the temp directory, reporting failure.
    pub fn close(self) -> Result<()> {
        let path = self.temp_dir.path().to_path_buf();
        self.temp_dir.close()?;
        tracing::debug!("Removed {}", path.display());
        Ok(())
    }
}

/// Runs the finalization stage against its collaborators.
pub struct Stitcher {
    store: Arc<dyn BlobStore>,
    finalizer: Arc<dyn Finalizer>,
    stats: Arc<dyn StatisticsEngine>,
    callbacks: CallbackRegistry,
    metrics: Arc<StitchMetrics>,
}

impl Stitcher {
    pub fn new(
        store: Arc<dyn BlobStore>,
        finalizer: Arc<dyn Finalizer>,
        stats: Arc<dyn StatisticsEngine>,
        callbacks: CallbackRegistry,
    ) -> Self {
        Self {
            store,
            finalizer,
            stats,
            callbacks,
            metrics: StitchMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<StitchMetrics> {
        &self.metrics
    }

    /// Run every stage for `config`.
    pub async fn run(&self, config: &StitchConfig) -> Result<StitchOutcome> {
        config.validate()?;

        let ctx = RunContext::new(config.settings.temp_root.as_deref(), Arc::clone(&self.metrics))?;
        let outcome = self.run_stages(config, &ctx).await?;
        ctx.close()?;

        let snapshot = self.metrics.snapshot();
        tracing::info!("Stitch complete: {}", snapshot);
        if let Some(path) = &config.settings.metrics_output {
            snapshot.save_to_file(path)?;
        }
        Ok(outcome)
    }

    async fn run_stages(&self, config: &StitchConfig, ctx: &RunContext) -> Result<StitchOutcome> {
        let bucket = config.bucket.as_str();

        // 1. fetch state
        tracing::info!("Fetching preparation state {}:{}", bucket, config.state_key);
        let bytes = self.download(bucket, &config.state_key, ctx).await?;
        let state = PreparationState::from_slice(&bytes)?;

        // 2. open input
        let input_path = self.store.raster_path(bucket, &config.infile);
        let input = self.finalizer.open_input(&input_path).await?;
        tracing::info!(
            "Input {} is {}x{} with {} bands",
            input.path,
            input.width,
            input.height,
            input.band_count
        );

        // 3. resolve tiles
        let tiles = TileSet::resolve(&config.tile_prefix, &state.col_row_list);
        ctx.metrics().add_tiles_resolved(tiles.len() as u64);
        let tile_paths: BTreeMap<TileCoord, String> = tiles
            .iter()
            .map(|(coord, key)| (*coord, self.store.raster_path(bucket, key)))
            .collect();
        tracing::info!("Resolved {} tiles with prefix {}", tiles.len(), config.tile_prefix);

        // 4. finalize
        let file_name = config
            .output_file_name()
            .ok_or_else(|| StitchError::config(format!("--outfile '{}' has no file name", config.outfile)))?;
        let output_path = ctx.temp_path().join(file_name);
        let start = Instant::now();
        let request = FinalizeRequest {
            output_path: &output_path,
            tiles: &tile_paths,
            tile_info: &state.tile_info,
            overlap_size: config.overlap_size,
            temp_dir: ctx.temp_path(),
            write_histogram: true,
        };
        let result = self.finalizer.finalize(&input, request).await?;
        ctx.metrics().add_finalize_time(start.elapsed());
        tracing::info!(
            "Finalized {} (max segment id {}, empty segments: {})",
            output_path.display(),
            result.max_segment_id,
            result.has_empty_segments
        );

        // 5. tile cleanup
        let mut tiles_deleted = 0;
        if !config.keep_intermediates {
            let mut cleanup = CleanupSet::new();
            cleanup.extend(bucket, tiles.keys());
            tiles_deleted = self.purge(&mut cleanup, ctx).await?;
            tracing::info!("Deleted {} tiles", tiles_deleted);
        }

        // 6, 7. default stats, then release the handle
        let closed = default_stats_and_close(
            result.raster,
            result.max_segment_id,
            config.skip_default_stats,
            ctx,
        )
        .await?;

        // 8. aggregate stats
        let style = config.concurrency_style();
        if let Some(loc) = &config.stats {
            let bytes = self.download(&loc.bucket, &loc.key, ctx).await?;
            let tasks = parse_aggregate_request(&bytes)?;
            let start = Instant::now();
            for task in &tasks {
                tracing::info!(
                    "Per-segment stats: {} band {} ({} columns)",
                    task.image,
                    task.band,
                    task.selection.len()
                );
                self.stats.per_segment_stats(task, &closed, &style).await?;
                ctx.metrics().add_stats_task();
            }
            ctx.metrics().add_stats_time(start.elapsed());
        }

        // 9. spatial stats
        if let Some(loc) = &config.spatial_stats {
            let bytes = self.download(&loc.bucket, &loc.key, ctx).await?;
            let tasks = parse_spatial_request(&bytes)?;
            let start = Instant::now();
            for task in &tasks {
                tracing::info!(
                    "Per-segment spatial stats: {} band {} with {}",
                    task.image,
                    task.band,
                    task.callback
                );
                let func = self.callbacks.resolve(&task.callback)?;
                self.stats
                    .per_segment_spatial_stats(task, &closed, func, &style)
                    .await?;
                ctx.metrics().add_stats_task();
            }
            ctx.metrics().add_stats_time(start.elapsed());
        }

        // 10. publish
        let start = Instant::now();
        let uploaded_bytes = self
            .store
            .upload_file(closed.path(), bucket, &config.outfile)
            .await?;
        ctx.metrics().add_bytes_uploaded(uploaded_bytes);
        ctx.metrics().add_upload_time(start.elapsed());
        tracing::info!("Uploaded {} bytes to {}:{}", uploaded_bytes, bucket, config.outfile);

        // 11. final cleanup
        let mut documents_deleted = 0;
        if !config.keep_intermediates {
            let mut cleanup = CleanupSet::new();
            cleanup.add(bucket, config.state_key.as_str());
            for loc in [&config.stats, &config.spatial_stats].into_iter().flatten() {
                let DocumentLocation { bucket, key } = loc;
                cleanup.add(bucket, key.as_str());
            }
            documents_deleted = self.purge(&mut cleanup, ctx).await?;
        }

        Ok(StitchOutcome {
            max_segment_id: result.max_segment_id,
            has_empty_segments: result.has_empty_segments,
            tiles_deleted,
            documents_deleted,
            uploaded_bytes,
        })
    }

    async fn download(&self, bucket: &str, key: &str, ctx: &RunContext) -> Result<Bytes> {
        let bytes = self.store.download_to_buffer(bucket, key).await?;
        ctx.metrics().add_bytes_downloaded(bytes.len() as u64);
        Ok(bytes)
    }

    async fn purge(&self, cleanup: &mut CleanupSet, ctx: &RunContext) -> Result<usize> {
        let start = Instant::now();
        let report = cleanup.purge(self.store.as_ref()).await?;
        ctx.metrics()
            .add_deleted(report.batches as u64, report.keys as u64);
        ctx.metrics().add_cleanup_time(start.elapsed());
        Ok(report.keys)
    }
}

/// Write raster statistics, colour table and overviews unless `skip`, then
/// close the handle. Runs on the blocking pool, which takes the handle.
async fn default_stats_and_close(
    raster: Box<dyn SegmentRaster>,
    max_segment_id: u64,
    skip: bool,
    ctx: &RunContext,
) -> Result<ClosedRaster> {
    let start = Instant::now();
    let path: PathBuf = raster.path().to_path_buf();

    let closed = tokio::task::spawn_blocking(move || {
        let mut raster = raster;
        if !skip {
            let num_segments = max_segment_id.checked_add(1).ok_or_else(|| {
                StitchError::raster(format!("max segment id {} leaves no room for a colour table", max_segment_id))
            })?;
            // written by the finalizer
            let histogram = raster.pixel_counts()?;
            raster.estimate_stats_from_histogram(&histogram)?;
            raster.write_random_colour_table(num_segments)?;
            raster.add_overviews()?;
        }
        raster.close()
    })
    .await
    .map_err(|e| StitchError::raster(format!("default statistics task for {} failed: {}", path.display(), e)))??;

    if !skip {
        ctx.metrics().add_default_stats_time(start.elapsed());
        tracing::info!("Default statistics written in {:.1}s", start.elapsed().as_secs_f64());
    }
    Ok(closed)
}
