use crate::error::{Result, StitchError};
use crate::raster::rat::{self, AttributeTable};
use crate::state::ColumnType;
use crate::stats::{Block, BlockData, BlockReader, OutputColumn, StatsBackend};
use gdal::{Dataset, DatasetOptions, GdalOpenFlags};
use std::path::Path;

const SEGMENT_BAND: usize = 1;

/// Reads and updates rasters through GDAL.
///
/// Images are opened by the path given in the request, so storage-backed
/// paths such as `/vsis3/...` work as long as GDAL is configured for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct GdalStatsBackend;

impl GdalStatsBackend {
    pub fn new() -> Self {
        Self
    }
}

struct GdalBlockReader {
    segments: Dataset,
    image: Dataset,
    band: usize,
    nodata: Option<f64>,
}

impl BlockReader for GdalBlockReader {
    fn read_block(&mut self, block: Block) -> Result<BlockData> {
        let window = (block.xoff as isize, block.yoff as isize);
        let size = (block.width, block.height);

        let mut ids = vec![0u32; block.pixel_count()];
        self.segments
            .rasterband(SEGMENT_BAND)?
            .read_into_slice(window, size, size, &mut ids, None)?;

        let mut values = vec![0f64; block.pixel_count()];
        self.image
            .rasterband(self.band)?
            .read_into_slice(window, size, size, &mut values, None)?;

        Ok(BlockData {
            block,
            segments: ids.into_iter().map(u64::from).collect(),
            values,
            nodata: self.nodata,
        })
    }
}

impl StatsBackend for GdalStatsBackend {
    fn segment_dimensions(&self, segments: &Path) -> Result<(usize, usize)> {
        Ok(Dataset::open(segments)?.raster_size())
    }

    fn open_reader(&self, segments: &Path, image: &str, band: usize) -> Result<Box<dyn BlockReader>> {
        let segments = Dataset::open(segments)?;
        let image = Dataset::open(image)
            .map_err(|e| StitchError::stats(format!("failed to open image {}: {}", image, e)))?;

        if segments.raster_size() != image.raster_size() {
            return Err(StitchError::stats(format!(
                "image is {:?} but segmentation is {:?}",
                image.raster_size(),
                segments.raster_size()
            )));
        }
        if band == 0 || band > image.raster_count() as usize {
            return Err(StitchError::stats(format!(
                "band {} out of range, image has {} bands",
                band,
                image.raster_count()
            )));
        }

        let nodata = image.rasterband(band)?.no_data_value();
        Ok(Box::new(GdalBlockReader {
            segments,
            image,
            band,
            nodata,
        }))
    }

    fn pixel_counts(&self, segments: &Path) -> Result<Option<Vec<u64>>> {
        let dataset = Dataset::open(segments)?;
        let band = dataset.rasterband(SEGMENT_BAND)?;
        let Ok(table) = AttributeTable::existing(&band) else {
            return Ok(None);
        };
        let Some(col) = table.column_of_usage(rat::GFU_PIXEL_COUNT) else {
            return Ok(None);
        };
        let counts = table.read_f64(col)?;
        Ok(Some(counts.into_iter().map(|c| c.max(0.0) as u64).collect()))
    }

    fn write_columns(&self, segments: &Path, columns: &[OutputColumn]) -> Result<()> {
        let options = DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
            ..Default::default()
        };
        let dataset = Dataset::open_ex(segments, options)?;
        let band = dataset.rasterband(SEGMENT_BAND)?;
        let mut table = AttributeTable::for_update(&band)?;

        for column in columns {
            let field_type = match column.kind {
                ColumnType::Integer => rat::GFT_INTEGER,
                ColumnType::Real => rat::GFT_REAL,
            };
            let idx = table.ensure_column(&column.name, field_type, rat::GFU_GENERIC)?;
            table.write_f64(idx, &column.values)?;
        }
        table.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyStyle;
    use crate::raster::test_rasters;
    use crate::raster::ClosedRaster;
    use crate::state::{AggregateStatsTask, StatKind, StatSelection};
    use crate::stats::{StatisticsEngine, TiledStatsEngine};
    use tempfile::TempDir;

    /// 3x2: row 0 is `0 1 1`, row 1 is `2 2 1`.
    fn small_segments(dir: &Path) -> std::path::PathBuf {
        test_rasters::segments_tif(dir, (3, 2), vec![0, 1, 1, 2, 2, 1])
    }

    #[test]
    fn test_read_block_window() {
        let dir = TempDir::new().unwrap();
        let segs = small_segments(dir.path());
        let image = test_rasters::image_tif(
            dir.path(),
            "image.tif",
            (3, 2),
            vec![1.0, 2.0, 3.0, 4.0, -1.0, 6.0],
            Some(-1.0),
        );
        let backend = GdalStatsBackend::new();
        assert_eq!(backend.segment_dimensions(&segs).unwrap(), (3, 2));

        let mut reader = backend.open_reader(&segs, image.to_str().unwrap(), 1).unwrap();
        let data = reader
            .read_block(Block {
                xoff: 1,
                yoff: 0,
                width: 2,
                height: 2,
            })
            .unwrap();
        assert_eq!(data.segments, vec![1, 1, 2, 1]);
        assert_eq!(data.values, vec![2.0, 3.0, -1.0, 6.0]);
        assert_eq!(data.nodata, Some(-1.0));
    }

    #[test]
    fn test_open_reader_rejects_mismatch() {
        let dir = TempDir::new().unwrap();
        let segs = small_segments(dir.path());
        let image = test_rasters::image_tif(dir.path(), "image.tif", (3, 2), vec![0.0; 6], None);
        let other = test_rasters::image_tif(dir.path(), "other.tif", (2, 2), vec![0.0; 4], None);
        let backend = GdalStatsBackend::new();

        let err = backend.open_reader(&segs, other.to_str().unwrap(), 1).err().unwrap();
        assert!(matches!(err, StitchError::Statistics { .. }));
        let err = backend.open_reader(&segs, image.to_str().unwrap(), 2).err().unwrap();
        assert!(matches!(err, StitchError::Statistics { .. }));
        let err = backend.open_reader(&segs, image.to_str().unwrap(), 0).err().unwrap();
        assert!(matches!(err, StitchError::Statistics { .. }));
        assert!(backend
            .open_reader(&segs, dir.path().join("missing.tif").to_str().unwrap(), 1)
            .is_err());
    }

    #[test]
    fn test_pixel_counts_from_histogram_column() {
        let dir = TempDir::new().unwrap();
        let segs = small_segments(dir.path());
        let backend = GdalStatsBackend::new();
        assert_eq!(backend.pixel_counts(&segs).unwrap(), None);

        test_rasters::write_histogram(&segs, &[1.0, 3.0, 2.0]);
        assert_eq!(backend.pixel_counts(&segs).unwrap(), Some(vec![1, 3, 2]));
    }

    #[test]
    fn test_write_columns_persist() {
        let dir = TempDir::new().unwrap();
        let segs = small_segments(dir.path());
        let backend = GdalStatsBackend::new();
        let columns = vec![
            OutputColumn {
                name: "count".to_string(),
                kind: ColumnType::Integer,
                values: vec![0.0, 3.0, 2.0],
            },
            OutputColumn {
                name: "mean".to_string(),
                kind: ColumnType::Real,
                values: vec![0.0, 2.5, 4.25],
            },
        ];
        backend.write_columns(&segs, &columns).unwrap();

        let dataset = Dataset::open(&segs).unwrap();
        let band = dataset.rasterband(SEGMENT_BAND).unwrap();
        let table = AttributeTable::existing(&band).unwrap();
        assert_eq!(table.row_count(), 3);
        let count = table.column_by_name("count").unwrap();
        assert_eq!(table.read_f64(count).unwrap(), vec![0.0, 3.0, 2.0]);
        let mean = table.column_by_name("mean").unwrap();
        assert_eq!(table.read_f64(mean).unwrap(), vec![0.0, 2.5, 4.25]);
    }

    #[tokio::test]
    async fn test_engine_on_gdal_rasters() {
        let dir = TempDir::new().unwrap();
        let segs = small_segments(dir.path());
        let image = test_rasters::image_tif(
            dir.path(),
            "image.tif",
            (3, 2),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            None,
        );
        let task = AggregateStatsTask {
            image: image.to_str().unwrap().to_string(),
            band: 1,
            selection: vec![
                StatSelection {
                    column: "count".to_string(),
                    kind: StatKind::PixCount,
                },
                StatSelection {
                    column: "mean".to_string(),
                    kind: StatKind::Mean,
                },
            ],
        };
        let engine = TiledStatsEngine::new(GdalStatsBackend::new(), 2);
        let closed = ClosedRaster::new(segs.clone());

        for workers in [0, 2] {
            let report = engine
                .per_segment_stats(&task, &closed, &ConcurrencyStyle::new(workers))
                .await
                .unwrap();
            assert_eq!(report.segments, 2);
            assert_eq!(report.blocks, 2);
        }

        let dataset = Dataset::open(&segs).unwrap();
        let band = dataset.rasterband(SEGMENT_BAND).unwrap();
        let table = AttributeTable::existing(&band).unwrap();
        let mean = table.column_by_name("mean").unwrap();
        // segment 1 holds 2, 3 and 6, segment 2 holds 4 and 5
        assert_eq!(table.read_f64(mean).unwrap(), vec![0.0, 11.0 / 3.0, 4.5]);
    }
}
