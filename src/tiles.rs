//! Tile naming shared with the tiling stage.
//!
//! Tiles are written by the upstream workers as `{prefix}_{col}_{row}.tif`.
//! The finalization stage never lists the bucket, it recomputes the names
//! from the coordinate list in the preparation state, so the format here
//! must stay byte-identical to the producer's.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// File extension of the segmented tiles.
pub const TILE_EXTENSION: &str = "tif";

/// Column/row position of a tile in the tiling grid.
///
/// Serialized as a `[col, row]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(i64, i64)", into = "(i64, i64)")]
pub struct TileCoord {
    pub col: i64,
    pub row: i64,
}

impl TileCoord {
    pub fn new(col: i64, row: i64) -> Self {
        Self { col, row }
    }
}

impl From<(i64, i64)> for TileCoord {
    fn from((col, row): (i64, i64)) -> Self {
        Self { col, row }
    }
}

impl From<TileCoord> for (i64, i64) {
    fn from(coord: TileCoord) -> Self {
        (coord.col, coord.row)
    }
}

/// Blob key of the tile at (`col`, `row`).
///
/// Coordinates are passed through unchecked.
pub fn tile_key(prefix: &str, col: i64, row: i64) -> String {
    format!("{}_{}_{}.{}", prefix, col, row, TILE_EXTENSION)
}

/// The tiles of one run, keyed by coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileSet {
    keys: BTreeMap<TileCoord, String>,
}

impl TileSet {
    /// Resolve the blob key of every coordinate.
    pub fn resolve<'a, I>(prefix: &str, coords: I) -> Self
    where
        I: IntoIterator<Item = &'a TileCoord>,
    {
        let keys = coords
            .into_iter()
            .map(|c| (*c, tile_key(prefix, c.col, c.row)))
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Blob key of the tile at `coord`.
    pub fn key(&self, coord: &TileCoord) -> Option<&str> {
        self.keys.get(coord).map(String::as_str)
    }

    /// Iterate over (coordinate, key) in coordinate order.
    pub fn iter(&self) -> impl Iterator<Item = (&TileCoord, &str)> {
        self.keys.iter().map(|(c, k)| (c, k.as_str()))
    }

    /// All blob keys, in coordinate order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.values().map(String::as_str)
    }
}
