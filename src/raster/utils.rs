//! Raster utilities applied to a freshly stitched segmentation: statistics
//! estimated from the pixel-count histogram, a random colour table and
//! overviews.

use crate::error::Result;
use crate::raster::rat::{self, AttributeTable};
use gdal::raster::RasterBand;
use gdal::{Dataset, Metadata};
use rand::Rng;

/// Segment id of pixels not in any segment.
pub const NULL_SEGMENT: usize = 0;

/// Overviews stop once the reduced raster's smaller side would be this small.
const MIN_OVERVIEW_DIM: usize = 33;

/// Summary statistics of a segment-id histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub mode: f64,
}

/// Statistics of the values described by `histogram`, where bin `i` counts
/// the pixels with value `i`. The null segment is not counted.
///
/// Returns `None` if no non-null pixel is counted.
pub fn histogram_stats(histogram: &[f64]) -> Option<HistogramStats> {
    let bins = || {
        histogram
            .iter()
            .enumerate()
            .filter(|&(i, &c)| i != NULL_SEGMENT && c > 0.0)
    };

    let total: f64 = bins().map(|(_, c)| c).sum();
    if total <= 0.0 {
        return None;
    }

    let min = bins().next().map(|(i, _)| i)? as f64;
    let max = bins().last().map(|(i, _)| i)? as f64;
    let mean = bins().map(|(i, c)| i as f64 * c).sum::<f64>() / total;
    let variance = bins()
        .map(|(i, c)| {
            let d = i as f64 - mean;
            d * d * c
        })
        .sum::<f64>()
        / total;

    let half = total / 2.0;
    let mut cumulative = 0.0;
    let mut median = max;
    for (i, c) in bins() {
        cumulative += c;
        if cumulative >= half {
            median = i as f64;
            break;
        }
    }

    // first of the most frequent bins
    let mut mode = min;
    let mut best = 0.0;
    for (i, &c) in bins() {
        if c > best {
            best = c;
            mode = i as f64;
        }
    }

    Some(HistogramStats {
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
        mode,
    })
}

/// Write statistics derived from `histogram` as band metadata, the way GDAL
/// itself stores computed statistics.
pub fn estimate_stats_from_histogram(band: &mut RasterBand, histogram: &[f64]) -> Result<()> {
    band.set_metadata_item("LAYER_TYPE", "thematic", "")?;

    let Some(stats) = histogram_stats(histogram) else {
        tracing::warn!("Histogram has no counted pixels, not writing statistics");
        return Ok(());
    };

    let items = [
        ("STATISTICS_MINIMUM", stats.min.to_string()),
        ("STATISTICS_MAXIMUM", stats.max.to_string()),
        ("STATISTICS_MEAN", stats.mean.to_string()),
        ("STATISTICS_STDDEV", stats.stddev.to_string()),
        ("STATISTICS_MEDIAN", stats.median.to_string()),
        ("STATISTICS_MODE", stats.mode.to_string()),
        ("STATISTICS_HISTOMIN", "0".to_string()),
        ("STATISTICS_HISTOMAX", (histogram.len().saturating_sub(1)).to_string()),
        ("STATISTICS_HISTONUMBINS", histogram.len().to_string()),
        ("STATISTICS_HISTOBINFUNCTION", "direct".to_string()),
    ];
    for (key, value) in items {
        band.set_metadata_item(key, &value, "")?;
    }
    Ok(())
}

/// Random RGBA rows for `num_segments` segments. The null segment is
/// transparent black.
pub fn random_colour_rows<R: Rng>(num_segments: usize, rng: &mut R) -> Vec<[i32; 4]> {
    (0..num_segments)
        .map(|i| {
            if i == NULL_SEGMENT {
                [0, 0, 0, 0]
            } else {
                [
                    rng.random_range(0..=255),
                    rng.random_range(0..=255),
                    rng.random_range(0..=255),
                    255,
                ]
            }
        })
        .collect()
}

/// Write a random colour table into the Red/Green/Blue/Alpha columns of the
/// band's attribute table.
pub fn write_random_colour_table(band: &RasterBand, num_segments: usize) -> Result<()> {
    let rows = random_colour_rows(num_segments, &mut rand::rng());

    let mut table = AttributeTable::for_update(band)?;
    table.ensure_rows(num_segments)?;

    let columns = [
        ("Red", rat::GFU_RED),
        ("Green", rat::GFU_GREEN),
        ("Blue", rat::GFU_BLUE),
        ("Alpha", rat::GFU_ALPHA),
    ];
    for (channel, (name, usage)) in columns.into_iter().enumerate() {
        let col = match table.column_of_usage(usage) {
            Some(col) => col,
            None => table.ensure_column(name, rat::GFT_INTEGER, usage)?,
        };
        let values: Vec<i32> = rows.iter().map(|rgba| rgba[channel]).collect();
        table.write_i32(col, &values)?;
    }
    table.commit()
}

/// Overview decimation factors for a raster of the given size.
pub fn overview_levels(width: usize, height: usize) -> Vec<i32> {
    let min_dim = width.min(height);
    let mut levels = Vec::new();
    let mut factor = 4usize;
    while min_dim / factor > MIN_OVERVIEW_DIM {
        levels.push(factor as i32);
        factor *= 2;
    }
    levels
}

/// Build nearest-neighbour overviews, which keep segment ids intact.
pub fn add_overviews(dataset: &mut Dataset) -> Result<()> {
    let (width, height) = dataset.raster_size();
    let levels = overview_levels(width, height);
    if levels.is_empty() {
        tracing::debug!("Raster {}x{} too small for overviews", width, height);
        return Ok(());
    }
    tracing::debug!("Building overviews {:?}", levels);
    dataset.build_overviews("NEAREST", &levels, &[])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_rasters;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    #[test]
    fn test_histogram_stats() {
        // segment 0 (null) ignored; segments 1..=3 with counts 1, 2, 1
        let stats = histogram_stats(&[100.0, 1.0, 2.0, 1.0]).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.mean, 2.0);
        assert!((stats.stddev - 0.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.median, 2.0);
        assert_eq!(stats.mode, 2.0);
    }

    #[test]
    fn test_histogram_stats_skips_empty_bins() {
        let stats = histogram_stats(&[0.0, 0.0, 5.0, 0.0, 5.0]).unwrap();
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.mode, 2.0);
    }

    #[test]
    fn test_histogram_stats_empty() {
        assert!(histogram_stats(&[]).is_none());
        assert!(histogram_stats(&[10.0, 0.0]).is_none());
    }

    #[test]
    fn test_random_colour_rows() {
        let mut rng = StdRng::seed_from_u64(7);
        let rows = random_colour_rows(5, &mut rng);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], [0, 0, 0, 0]);
        for row in &rows[1..] {
            assert_eq!(row[3], 255);
            assert!(row[..3].iter().all(|v| (0..=255).contains(v)));
        }
    }

    #[test]
    fn test_overview_levels() {
        assert!(overview_levels(100, 100).is_empty());
        assert_eq!(overview_levels(1000, 140), vec![4]);
        assert_eq!(overview_levels(10000, 10000), vec![4, 8, 16, 32, 64, 128, 256]);
    }

    #[test]
    fn test_stats_metadata_written() {
        let dir = TempDir::new().unwrap();
        let path = test_rasters::segments_tif(dir.path(), (2, 2), vec![1, 2, 2, 3]);
        {
            let dataset = test_rasters::open_update(&path);
            let mut band = dataset.rasterband(1).unwrap();
            estimate_stats_from_histogram(&mut band, &[100.0, 1.0, 2.0, 1.0]).unwrap();
        }

        let dataset = Dataset::open(&path).unwrap();
        let band = dataset.rasterband(1).unwrap();
        let item = |key: &str| band.metadata_item(key, "");
        assert_eq!(item("LAYER_TYPE").as_deref(), Some("thematic"));
        assert_eq!(item("STATISTICS_MINIMUM").as_deref(), Some("1"));
        assert_eq!(item("STATISTICS_MAXIMUM").as_deref(), Some("3"));
        assert_eq!(item("STATISTICS_MEAN").as_deref(), Some("2"));
        assert_eq!(item("STATISTICS_MEDIAN").as_deref(), Some("2"));
        assert_eq!(item("STATISTICS_HISTOMAX").as_deref(), Some("3"));
        assert_eq!(item("STATISTICS_HISTONUMBINS").as_deref(), Some("4"));
        assert_eq!(item("STATISTICS_HISTOBINFUNCTION").as_deref(), Some("direct"));
    }

    #[test]
    fn test_empty_histogram_marks_thematic_only() {
        let dir = TempDir::new().unwrap();
        let path = test_rasters::segments_tif(dir.path(), (2, 2), vec![0; 4]);
        let dataset = test_rasters::open_update(&path);
        let mut band = dataset.rasterband(1).unwrap();
        estimate_stats_from_histogram(&mut band, &[4.0]).unwrap();
        assert_eq!(band.metadata_item("LAYER_TYPE", "").as_deref(), Some("thematic"));
        assert!(band.metadata_item("STATISTICS_MEAN", "").is_none());
    }

    #[test]
    fn test_colour_table_attached() {
        let dir = TempDir::new().unwrap();
        let path = test_rasters::segments_tif(dir.path(), (2, 2), vec![0, 1, 2, 2]);
        {
            let dataset = test_rasters::open_update(&path);
            let band = dataset.rasterband(1).unwrap();
            write_random_colour_table(&band, 3).unwrap();
        }

        let dataset = Dataset::open(&path).unwrap();
        let band = dataset.rasterband(1).unwrap();
        let table = AttributeTable::existing(&band).unwrap();
        assert_eq!(table.row_count(), 3);
        let alpha = table.column_of_usage(rat::GFU_ALPHA).unwrap();
        assert_eq!(table.read_f64(alpha).unwrap(), vec![0.0, 255.0, 255.0]);
        let red = table.column_by_name("Red").unwrap();
        let reds = table.read_f64(red).unwrap();
        assert_eq!(reds[0], 0.0);
        assert!(reds.iter().all(|v| (0.0..=255.0).contains(v)));
    }

    #[test]
    fn test_colour_table_keeps_histogram() {
        let dir = TempDir::new().unwrap();
        let path = test_rasters::segments_tif(dir.path(), (2, 2), vec![0, 1, 1, 1]);
        let dataset = test_rasters::open_update(&path);
        let band = dataset.rasterband(1).unwrap();
        let mut table = AttributeTable::for_update(&band).unwrap();
        let hist = table
            .ensure_column("Histogram", rat::GFT_REAL, rat::GFU_PIXEL_COUNT)
            .unwrap();
        table.write_f64(hist, &[1.0, 3.0]).unwrap();
        table.commit().unwrap();

        // existing table is edited in place
        write_random_colour_table(&band, 2).unwrap();
        let table = AttributeTable::existing(&band).unwrap();
        let hist = table.column_of_usage(rat::GFU_PIXEL_COUNT).unwrap();
        assert_eq!(table.read_f64(hist).unwrap(), vec![1.0, 3.0]);
        let alpha = table.column_of_usage(rat::GFU_ALPHA).unwrap();
        assert_eq!(table.read_f64(alpha).unwrap(), vec![0.0, 255.0]);
    }

    #[test]
    fn test_add_overviews() {
        let dir = TempDir::new().unwrap();
        let path = test_rasters::segments_tif(dir.path(), (160, 160), vec![1; 160 * 160]);
        {
            let mut dataset = test_rasters::open_update(&path);
            add_overviews(&mut dataset).unwrap();
        }
        let dataset = Dataset::open(&path).unwrap();
        assert_eq!(dataset.rasterband(1).unwrap().overview_count().unwrap(), 1);

        let small = dir.path().join("small");
        std::fs::create_dir(&small).unwrap();
        let path = test_rasters::segments_tif(&small, (40, 40), vec![1; 1600]);
        let mut dataset = test_rasters::open_update(&path);
        add_overviews(&mut dataset).unwrap();
        assert_eq!(dataset.rasterband(1).unwrap().overview_count().unwrap(), 0);
    }
}
