//! Thin wrapper over GDAL's raster attribute table C API.
//!
//! The `gdal` crate does not expose attribute tables, so this goes through
//! `gdal-sys` directly. Row and column indices are `c_int` on the C side.

use crate::error::{Result, StitchError};
use gdal::raster::RasterBand;
use gdal_sys::{
    CPLErr, GDALRATFieldType, GDALRATFieldUsage, GDALRWFlag, GDALRasterAttributeTableH,
};
use std::ffi::{CStr, CString};
use std::os::raw::c_int;

pub(crate) use gdal_sys::GDALRATFieldType::Type as FieldType;
pub(crate) use gdal_sys::GDALRATFieldUsage::Type as FieldUsage;

pub(crate) const GFT_INTEGER: FieldType = GDALRATFieldType::GFT_Integer;
pub(crate) const GFT_REAL: FieldType = GDALRATFieldType::GFT_Real;
pub(crate) const GFU_GENERIC: FieldUsage = GDALRATFieldUsage::GFU_Generic;
pub(crate) const GFU_PIXEL_COUNT: FieldUsage = GDALRATFieldUsage::GFU_PixelCount;
pub(crate) const GFU_RED: FieldUsage = GDALRATFieldUsage::GFU_Red;
pub(crate) const GFU_GREEN: FieldUsage = GDALRATFieldUsage::GFU_Green;
pub(crate) const GFU_BLUE: FieldUsage = GDALRATFieldUsage::GFU_Blue;
pub(crate) const GFU_ALPHA: FieldUsage = GDALRATFieldUsage::GFU_Alpha;

/// Attribute table of one band.
///
/// Tables created here (the band had none) are attached to the band by
/// [`AttributeTable::commit`]. Tables the band already had are edited in
/// place.
pub(crate) struct AttributeTable<'a> {
    handle: GDALRasterAttributeTableH,
    owned: bool,
    band: &'a RasterBand<'a>,
}

impl<'a> AttributeTable<'a> {
    /// The band's default table. Fails if it has none.
    pub fn existing(band: &'a RasterBand<'a>) -> Result<Self> {
        let handle = unsafe { gdal_sys::GDALGetDefaultRAT(band.c_rasterband()) };
        if handle.is_null() {
            return Err(StitchError::raster("band has no raster attribute table"));
        }
        Ok(Self {
            handle,
            owned: false,
            band,
        })
    }

    /// The band's default table, or a new empty one.
    pub fn for_update(band: &'a RasterBand<'a>) -> Result<Self> {
        match Self::existing(band) {
            Ok(table) => Ok(table),
            Err(_) => {
                let handle = unsafe { gdal_sys::GDALCreateRasterAttributeTable() };
                if handle.is_null() {
                    return Err(StitchError::raster("failed to create raster attribute table"));
                }
                Ok(Self {
                    handle,
                    owned: true,
                    band,
                })
            }
        }
    }

    pub fn row_count(&self) -> usize {
        let rows = unsafe { gdal_sys::GDALRATGetRowCount(self.handle) };
        rows.max(0) as usize
    }

    pub fn set_row_count(&mut self, rows: usize) -> Result<()> {
        let rows = to_c_int(rows)?;
        unsafe { gdal_sys::GDALRATSetRowCount(self.handle, rows) };
        Ok(())
    }

    /// Grow the table to at least `rows` rows.
    pub fn ensure_rows(&mut self, rows: usize) -> Result<()> {
        if self.row_count() < rows {
            self.set_row_count(rows)?;
        }
        Ok(())
    }

    pub fn column_of_usage(&self, usage: FieldUsage) -> Option<usize> {
        let idx = unsafe { gdal_sys::GDALRATGetColOfUsage(self.handle, usage) };
        (idx >= 0).then_some(idx as usize)
    }

    pub fn column_by_name(&self, name: &str) -> Option<usize> {
        let count = unsafe { gdal_sys::GDALRATGetColumnCount(self.handle) };
        (0..count).find_map(|idx| {
            let ptr = unsafe { gdal_sys::GDALRATGetNameOfCol(self.handle, idx) };
            if ptr.is_null() {
                return None;
            }
            let col_name = unsafe { CStr::from_ptr(ptr) };
            (col_name.to_bytes() == name.as_bytes()).then_some(idx as usize)
        })
    }

    /// Index of the column called `name`, creating it if missing.
    pub fn ensure_column(&mut self, name: &str, kind: FieldType, usage: FieldUsage) -> Result<usize> {
        if let Some(idx) = self.column_by_name(name) {
            return Ok(idx);
        }
        let c_name = CString::new(name)
            .map_err(|_| StitchError::raster(format!("invalid column name '{}'", name)))?;
        let rv = unsafe { gdal_sys::GDALRATCreateColumn(self.handle, c_name.as_ptr(), kind, usage) };
        check(rv, || format!("create column '{}'", name))?;
        self.column_by_name(name)
            .ok_or_else(|| StitchError::raster(format!("column '{}' missing after create", name)))
    }

    pub fn read_f64(&self, column: usize) -> Result<Vec<f64>> {
        let rows = self.row_count();
        let mut values = vec![0.0f64; rows];
        if rows == 0 {
            return Ok(values);
        }
        let rv = unsafe {
            gdal_sys::GDALRATValuesIOAsDouble(
                self.handle,
                GDALRWFlag::GF_Read,
                to_c_int(column)?,
                0,
                to_c_int(rows)?,
                values.as_mut_ptr(),
            )
        };
        check(rv, || format!("read column {}", column))?;
        Ok(values)
    }

    /// Write `values` into rows `0..values.len()` of `column`.
    pub fn write_f64(&mut self, column: usize, values: &[f64]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.ensure_rows(values.len())?;
        // the C API takes a mutable pointer even for writes
        let mut buf = values.to_vec();
        let rv = unsafe {
            gdal_sys::GDALRATValuesIOAsDouble(
                self.handle,
                GDALRWFlag::GF_Write,
                to_c_int(column)?,
                0,
                to_c_int(buf.len())?,
                buf.as_mut_ptr(),
            )
        };
        check(rv, || format!("write column {}", column))
    }

    pub fn write_i32(&mut self, column: usize, values: &[i32]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.ensure_rows(values.len())?;
        let mut buf: Vec<c_int> = values.to_vec();
        let rv = unsafe {
            gdal_sys::GDALRATValuesIOAsInteger(
                self.handle,
                GDALRWFlag::GF_Write,
                to_c_int(column)?,
                0,
                to_c_int(buf.len())?,
                buf.as_mut_ptr(),
            )
        };
        check(rv, || format!("write column {}", column))
    }

    /// Attach a newly created table to the band. No-op for existing tables.
    pub fn commit(self) -> Result<()> {
        if !self.owned {
            return Ok(());
        }
        let rv = unsafe { gdal_sys::GDALSetDefaultRAT(self.band.c_rasterband(), self.handle) };
        check(rv, || "attach raster attribute table".to_string())
    }
}

impl Drop for AttributeTable<'_> {
    fn drop(&mut self) {
        // GDALSetDefaultRAT copies, so owned tables are always ours to free
        if self.owned {
            unsafe { gdal_sys::GDALDestroyRasterAttributeTable(self.handle) };
        }
    }
}

fn to_c_int(value: usize) -> Result<c_int> {
    c_int::try_from(value)
        .map_err(|_| StitchError::raster(format!("{} exceeds the attribute table row limit", value)))
}

fn check(rv: CPLErr::Type, what: impl FnOnce() -> String) -> Result<()> {
    if rv == CPLErr::CE_None {
        Ok(())
    } else {
        Err(StitchError::raster(format!("GDAL failed to {}", what())))
    }
}
