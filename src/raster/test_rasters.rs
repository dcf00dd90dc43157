//! GTiff fixtures for tests of the GDAL-backed code.

use crate::raster::rat::{self, AttributeTable};
use gdal::raster::Buffer;
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags};
use std::path::{Path, PathBuf};

/// Single-band u32 segmentation `segs.tif` in `dir`, row-major ids.
pub(crate) fn segments_tif(dir: &Path, size: (usize, usize), ids: Vec<u32>) -> PathBuf {
    let path = dir.join("segs.tif");
    let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
    let dataset = driver
        .create_with_band_type::<u32, _>(&path, size.0, size.1, 1)
        .unwrap();
    let mut band = dataset.rasterband(1).unwrap();
    band.write((0, 0), size, &mut Buffer::new(size, ids)).unwrap();
    path
}

/// Single-band f64 image `name` in `dir`.
pub(crate) fn image_tif(
    dir: &Path,
    name: &str,
    size: (usize, usize),
    values: Vec<f64>,
    nodata: Option<f64>,
) -> PathBuf {
    let path = dir.join(name);
    let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
    let dataset = driver
        .create_with_band_type::<f64, _>(&path, size.0, size.1, 1)
        .unwrap();
    let mut band = dataset.rasterband(1).unwrap();
    band.set_no_data_value(nodata).unwrap();
    band.write((0, 0), size, &mut Buffer::new(size, values)).unwrap();
    path
}

pub(crate) fn open_update(path: &Path) -> Dataset {
    let options = DatasetOptions {
        open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
        ..Default::default()
    };
    Dataset::open_ex(path, options).unwrap()
}

/// Store `counts` as the pixel-count column of band 1, the way the
/// finalization engine leaves it.
pub(crate) fn write_histogram(path: &Path, counts: &[f64]) {
    let dataset = open_update(path);
    let band = dataset.rasterband(1).unwrap();
    let mut table = AttributeTable::for_update(&band).unwrap();
    let col = table
        .ensure_column("Histogram", rat::GFT_REAL, rat::GFU_PIXEL_COUNT)
        .unwrap();
    table.write_f64(col, counts).unwrap();
    table.commit().unwrap();
}
