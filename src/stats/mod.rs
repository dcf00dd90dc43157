//! Per-segment statistics over the stitched segmentation.
//!
//! The segmentation and the image are read block by block, each block is
//! reduced to a per-segment partial, and the partials are merged into the
//! result columns, which are written back into the segmentation's attribute
//! table. A segment's row is computed and its state dropped as soon as the
//! blocks read so far hold all of its pixels.
//!
//! With read workers configured the stages run concurrently:
//!
//! ```text
//! work queue ──▶ readers ──▶ read buffer ──▶ compute ──▶ compute buffer ──▶ merge
//! ```
//!
//! Every buffer insert and pop is then bounded by a timeout from the
//! [`ConcurrencyStyle`]; exceeding one fails the whole task. With zero read
//! workers the blocks are read and reduced one after another on a single
//! blocking task, and no timeouts apply.

mod accumulate;
mod engine;
mod gdal_backend;

pub use engine::TiledStatsEngine;
pub use gdal_backend::GdalStatsBackend;

use crate::callbacks::SpatialStatFn;
use crate::config::ConcurrencyStyle;
use crate::error::Result;
use crate::raster::ClosedRaster;
use crate::state::{AggregateStatsTask, ColumnType, SpatialStatsTask};
use async_trait::async_trait;
use std::path::Path;

/// Computes per-segment statistics and stores them on the segmentation.
///
/// Both operations take a [`ClosedRaster`], so they can only run once the
/// open output handle has been released.
#[async_trait]
pub trait StatisticsEngine: Send + Sync {
    /// Aggregate statistics of `task.image` per segment, one column per
    /// selection entry.
    async fn per_segment_stats(
        &self,
        task: &AggregateStatsTask,
        segments: &ClosedRaster,
        style: &ConcurrencyStyle,
    ) -> Result<StatsReport>;

    /// Values of `func` over each segment's pixels, one column per declared
    /// output column.
    async fn per_segment_spatial_stats(
        &self,
        task: &SpatialStatsTask,
        segments: &ClosedRaster,
        func: SpatialStatFn,
        style: &ConcurrencyStyle,
    ) -> Result<StatsReport>;
}

/// What a statistics task wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    /// Segments with at least one counted pixel
    pub segments: usize,
    /// Names of the columns written
    pub columns: Vec<String>,
    /// Blocks read
    pub blocks: usize,
}

/// A rectangular window of the raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub xoff: usize,
    pub yoff: usize,
    pub width: usize,
    pub height: usize,
}

impl Block {
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Blocks of at most `block_size` x `block_size` pixels covering the raster,
/// in row-major order.
pub fn block_grid(width: usize, height: usize, block_size: usize) -> Vec<Block> {
    let size = block_size.max(1);
    let mut blocks = Vec::with_capacity(width.div_ceil(size) * height.div_ceil(size));
    for yoff in (0..height).step_by(size) {
        for xoff in (0..width).step_by(size) {
            blocks.push(Block {
                xoff,
                yoff,
                width: size.min(width - xoff),
                height: size.min(height - yoff),
            });
        }
    }
    blocks
}

/// Segment ids and image values of one block, row-major.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Block,
    pub segments: Vec<u64>,
    pub values: Vec<f64>,
    /// Image no-data value
    pub nodata: Option<f64>,
}

impl BlockData {
    /// Full-raster (x, y) of the pixel at `index` within the block.
    pub fn coords(&self, index: usize) -> (i64, i64) {
        let x = self.block.xoff + index % self.block.width;
        let y = self.block.yoff + index / self.block.width;
        (x as i64, y as i64)
    }

    /// True if `value` is the image no-data value.
    pub fn is_nodata(&self, value: f64) -> bool {
        match self.nodata {
            Some(nd) if nd.is_nan() => value.is_nan(),
            Some(nd) => value == nd,
            None => false,
        }
    }
}

/// One result column, indexed by segment id.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub kind: ColumnType,
    pub values: Vec<f64>,
}

/// Reads aligned segment and image blocks. Blocking.
pub trait BlockReader: Send {
    fn read_block(&mut self, block: Block) -> Result<BlockData>;
}

/// Raster access used by [`TiledStatsEngine`]. All methods are blocking.
pub trait StatsBackend: Send + Sync + 'static {
    /// (width, height) of the segmentation.
    fn segment_dimensions(&self, segments: &Path) -> Result<(usize, usize)>;

    /// Pixels per segment id from the segmentation's histogram, or `None` if
    /// it has none.
    fn pixel_counts(&self, segments: &Path) -> Result<Option<Vec<u64>>>;

    /// Reader over the segmentation and band `band` of `image`.
    fn open_reader(&self, segments: &Path, image: &str, band: usize) -> Result<Box<dyn BlockReader>>;

    /// Store `columns` in the segmentation's attribute table.
    fn write_columns(&self, segments: &Path, columns: &[OutputColumn]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_grid_covers_raster() {
        let blocks = block_grid(10, 7, 4);
        assert_eq!(blocks.len(), 6);
        assert_eq!(blocks[0], Block { xoff: 0, yoff: 0, width: 4, height: 4 });
        assert_eq!(blocks[2], Block { xoff: 8, yoff: 0, width: 2, height: 4 });
        assert_eq!(blocks[5], Block { xoff: 8, yoff: 4, width: 2, height: 3 });

        let total: usize = blocks.iter().map(Block::pixel_count).sum();
        assert_eq!(total, 70);
    }

    #[test]
    fn test_block_grid_empty() {
        assert!(block_grid(0, 10, 4).is_empty());
    }

    #[test]
    fn test_block_coords_and_nodata() {
        let data = BlockData {
            block: Block { xoff: 8, yoff: 4, width: 2, height: 3 },
            segments: vec![1; 6],
            values: vec![0.0; 6],
            nodata: Some(f64::NAN),
        };
        assert_eq!(data.coords(0), (8, 4));
        assert_eq!(data.coords(3), (9, 5));
        assert!(data.is_nodata(f64::NAN));
        assert!(!data.is_nodata(0.0));
    }
}
