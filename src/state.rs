//! Documents read from the bucket: the preparation state written by the
//! tiling stage and the two statistics request documents.

use crate::error::{Result, StitchError};
use crate::tiles::TileCoord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shared state produced by the preparation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparationState {
    /// Tile coordinates, in the order the tiling stage produced them.
    #[serde(rename = "colRowList")]
    pub col_row_list: Vec<TileCoord>,

    /// Tiling metadata, only interpreted by the finalization engine.
    #[serde(rename = "tileInfo")]
    pub tile_info: Value,
}

impl PreparationState {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StitchError::deserialization(format!("preparation state: {}", e)))
    }
}

/// A per-segment statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatKind {
    Min,
    Max,
    Mean,
    Stddev,
    Median,
    Mode,
    PixCount,
    /// Percentile in [0, 100].
    Percentile(f64),
}

impl StatKind {
    /// True if the statistic needs every pixel value, not just running sums.
    pub fn needs_values(&self) -> bool {
        matches!(self, Self::Median | Self::Mode | Self::Percentile(_))
    }

    fn parse(name: &str, param: Option<f64>) -> std::result::Result<Self, String> {
        let kind = match (name, param) {
            ("min", None) => Self::Min,
            ("max", None) => Self::Max,
            ("mean", None) => Self::Mean,
            ("stddev", None) => Self::Stddev,
            ("median", None) => Self::Median,
            ("mode", None) => Self::Mode,
            ("pixcount", None) => Self::PixCount,
            ("percentile", Some(p)) if (0.0..=100.0).contains(&p) => Self::Percentile(p),
            ("percentile", Some(p)) => return Err(format!("percentile {} outside 0-100", p)),
            ("percentile", None) => return Err("percentile needs a parameter".to_string()),
            (other, Some(_)) => return Err(format!("statistic '{}' takes no parameter", other)),
            (other, None) => return Err(format!("unknown statistic '{}'", other)),
        };
        Ok(kind)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SelectionRow {
    WithParam(String, String, f64),
    Plain(String, String),
}

/// One output column of an aggregate request: `[column, stat]` or
/// `[column, "percentile", p]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "SelectionRow")]
pub struct StatSelection {
    pub column: String,
    pub kind: StatKind,
}

impl TryFrom<SelectionRow> for StatSelection {
    type Error = String;

    fn try_from(row: SelectionRow) -> std::result::Result<Self, Self::Error> {
        let (column, name, param) = match row {
            SelectionRow::WithParam(column, name, p) => (column, name, Some(p)),
            SelectionRow::Plain(column, name) => (column, name, None),
        };
        let kind = StatKind::parse(&name, param)?;
        Ok(Self { column, kind })
    }
}

/// One entry of the aggregate statistics request: `[image, band, selection]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "(String, usize, Vec<StatSelection>)")]
pub struct AggregateStatsTask {
    /// Raster the values are read from.
    pub image: String,
    /// 1-based band number.
    pub band: usize,
    pub selection: Vec<StatSelection>,
}

impl From<(String, usize, Vec<StatSelection>)> for AggregateStatsTask {
    fn from((image, band, selection): (String, usize, Vec<StatSelection>)) -> Self {
        Self {
            image,
            band,
            selection,
        }
    }
}

/// Attribute table field type of an output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Integer,
    Real,
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // GDAL field type codes: 0 = integer, 1 = real, 2 = string
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Number(n) if n.as_u64() == Some(0) => Ok(Self::Integer),
            Value::Number(n) if n.as_u64() == Some(1) => Ok(Self::Real),
            Value::String(s) if s.eq_ignore_ascii_case("integer") => Ok(Self::Integer),
            Value::String(s) if s.eq_ignore_ascii_case("real") => Ok(Self::Real),
            _ => Err(serde::de::Error::custom(format!(
                "unsupported column type {} (expected 0/integer or 1/real)",
                value
            ))),
        }
    }
}

/// Declared output column of a spatial statistic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "(String, ColumnType)")]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnType,
}

impl From<(String, ColumnType)> for ColumnSpec {
    fn from((name, kind): (String, ColumnType)) -> Self {
        Self { name, kind }
    }
}

/// One entry of the spatial statistics request:
/// `[image, band, [[col, type], ...], callback, param]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "(String, usize, Vec<ColumnSpec>, String, Value)")]
pub struct SpatialStatsTask {
    pub image: String,
    pub band: usize,
    pub columns: Vec<ColumnSpec>,
    /// Fully qualified callback name, `module.function`.
    pub callback: String,
    /// Passed through to the callback untouched.
    pub param: Value,
}

impl From<(String, usize, Vec<ColumnSpec>, String, Value)> for SpatialStatsTask {
    fn from(
        (image, band, columns, callback, param): (String, usize, Vec<ColumnSpec>, String, Value),
    ) -> Self {
        Self {
            image,
            band,
            columns,
            callback,
            param,
        }
    }
}

/// Parse the aggregate statistics request document.
pub fn parse_aggregate_request(bytes: &[u8]) -> Result<Vec<AggregateStatsTask>> {
    serde_json::from_slice(bytes)
        .map_err(|e| StitchError::deserialization(format!("stats request: {}", e)))
}

/// Parse the spatial statistics request document.
pub fn parse_spatial_request(bytes: &[u8]) -> Result<Vec<SpatialStatsTask>> {
    serde_json::from_slice(bytes)
        .map_err(|e| StitchError::deserialization(format!("spatial stats request: {}", e)))
}
