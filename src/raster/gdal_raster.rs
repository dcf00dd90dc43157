use crate::error::{Result, StitchError};
use crate::raster::rat::{self, AttributeTable};
use crate::raster::{utils, ClosedRaster, SegmentRaster};
use gdal::{Dataset, DatasetOptions, GdalOpenFlags};
use std::path::{Path, PathBuf};

/// Band holding segment ids.
const SEGMENT_BAND: usize = 1;

/// GDAL dataset opened for update on the stitched output.
pub struct GdalSegmentRaster {
    dataset: Dataset,
    path: PathBuf,
}

impl GdalSegmentRaster {
    pub fn open_for_update(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
            ..Default::default()
        };
        let dataset = Dataset::open_ex(path, options).map_err(|e| {
            StitchError::raster(format!("failed to open {} for update: {}", path.display(), e))
        })?;
        Ok(Self {
            dataset,
            path: path.to_path_buf(),
        })
    }
}

impl SegmentRaster for GdalSegmentRaster {
    fn path(&self) -> &Path {
        &self.path
    }

    fn pixel_counts(&self) -> Result<Vec<f64>> {
        let band = self.dataset.rasterband(SEGMENT_BAND)?;
        let table = AttributeTable::existing(&band)?;
        let col = table.column_of_usage(rat::GFU_PIXEL_COUNT).ok_or_else(|| {
            StitchError::raster(format!(
                "{} has no pixel count column in its attribute table",
                self.path.display()
            ))
        })?;
        table.read_f64(col)
    }

    fn estimate_stats_from_histogram(&mut self, histogram: &[f64]) -> Result<()> {
        let mut band = self.dataset.rasterband(SEGMENT_BAND)?;
        utils::estimate_stats_from_histogram(&mut band, histogram)
    }

    fn write_random_colour_table(&mut self, num_segments: u64) -> Result<()> {
        let rows = usize::try_from(num_segments)
            .map_err(|_| StitchError::raster(format!("{} segments is too many", num_segments)))?;
        let band = self.dataset.rasterband(SEGMENT_BAND)?;
        utils::write_random_colour_table(&band, rows)
    }

    fn add_overviews(&mut self) -> Result<()> {
        utils::add_overviews(&mut self.dataset)
    }

    fn close(self: Box<Self>) -> Result<ClosedRaster> {
        let GdalSegmentRaster { dataset, path } = *self;
        // dropping the dataset flushes it and releases the handle
        drop(dataset);
        tracing::debug!("Closed {}", path.display());
        Ok(ClosedRaster::new(path))
    }
}
