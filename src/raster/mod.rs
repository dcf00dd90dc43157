//! The finalized output raster and the engine that produces it.
//!
//! The finalization engine hands back an open [`SegmentRaster`]. Only one
//! handle to the output path may exist at a time, so the statistics engine
//! never takes the open handle: it takes a [`ClosedRaster`], which can only be
//! obtained by consuming the handle through [`SegmentRaster::close`].

mod command;
mod gdal_raster;
pub(crate) mod rat;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_rasters;

pub use command::CommandFinalizer;
pub use gdal_raster::GdalSegmentRaster;

use crate::error::Result;
use crate::tiles::TileCoord;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The source raster the tiles were cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRaster {
    /// Storage-backed path the raster was opened from
    pub path: String,
    pub width: usize,
    pub height: usize,
    pub band_count: usize,
}

/// Everything the finalization engine needs besides the source raster.
#[derive(Debug, Clone, Copy)]
pub struct FinalizeRequest<'a> {
    /// Local path the stitched raster is written to
    pub output_path: &'a Path,
    /// Storage path of each tile
    pub tiles: &'a BTreeMap<TileCoord, String>,
    /// Opaque tiling metadata from the preparation state
    pub tile_info: &'a Value,
    pub overlap_size: u32,
    /// Scratch space, removed after the run
    pub temp_dir: &'a Path,
    /// Write the pixel-count column of the attribute table
    pub write_histogram: bool,
}

/// Output of the finalization engine.
pub struct FinalizationResult {
    /// Largest segment id assigned
    pub max_segment_id: u64,
    /// Whether any segment ended up with no pixels
    pub has_empty_segments: bool,
    /// Open handle to the stitched raster
    pub raster: Box<dyn SegmentRaster>,
}

/// Reassembles segmented tiles into one raster with globally unique ids.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Open the source raster at its storage-backed path.
    async fn open_input(&self, path: &str) -> Result<SourceRaster>;

    /// Stitch the tiles into `request.output_path`.
    async fn finalize(
        &self,
        input: &SourceRaster,
        request: FinalizeRequest<'_>,
    ) -> Result<FinalizationResult>;
}

/// Open handle to the stitched segmentation.
///
/// Methods apply to band 1. All of them are blocking.
pub trait SegmentRaster: Send {
    fn path(&self) -> &Path;

    /// Pixel-count column of the default attribute table, indexed by segment id.
    fn pixel_counts(&self) -> Result<Vec<f64>>;

    /// Store raster statistics derived from `histogram`.
    fn estimate_stats_from_histogram(&mut self, histogram: &[f64]) -> Result<()>;

    /// Give each of `num_segments` rows a random colour.
    fn write_random_colour_table(&mut self, num_segments: u64) -> Result<()>;

    fn add_overviews(&mut self) -> Result<()>;

    /// Flush and release the handle.
    fn close(self: Box<Self>) -> Result<ClosedRaster>;
}

/// Proof that the output raster's handle was released.
#[derive(Debug, PartialEq, Eq)]
pub struct ClosedRaster {
    path: PathBuf,
}

impl ClosedRaster {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
