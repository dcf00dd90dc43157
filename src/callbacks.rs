//! Registry of user functions for spatial statistics.
//!
//! Spatial statistics requests name their reduction function with a dotted,
//! fully qualified name such as `segstitch.spatial.variogram`. Names resolve
//! against an explicit registry filled at startup rather than loading code at
//! run time. Everything before the last `.` is the module, the rest is the
//! function name.

use crate::error::{Result, StitchError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// One pixel of a segment, as handed to a spatial statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialPixel {
    /// Column in the full raster.
    pub x: i64,
    /// Row in the full raster.
    pub y: i64,
    /// Image value at (x, y).
    pub value: f64,
}

/// Spatial statistic: reduces one segment's pixels to one value per declared
/// output column.
pub type SpatialStatFn = Arc<dyn Fn(&[SpatialPixel], &Value) -> Result<Vec<f64>> + Send + Sync>;

/// Functions registered by [`CallbackRegistry::with_builtins`].
const BUILTINS: &[(&str, fn(&[SpatialPixel], &Value) -> Result<Vec<f64>>)] = &[
    ("segstitch.spatial.mean_coord", mean_coord),
    ("segstitch.spatial.variogram", variogram),
];

/// Maps fully qualified names to spatial statistic functions.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    modules: HashMap<String, BTreeMap<String, SpatialStatFn>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in spatial statistics.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, func) in BUILTINS {
            // builtin names are well formed
            let _ = registry.register(name, Arc::new(*func));
        }
        registry
    }

    /// Register `func` under `qualified_name`, replacing any previous entry.
    pub fn register(&mut self, qualified_name: &str, func: SpatialStatFn) -> Result<()> {
        let (module, function) = split_qualified(qualified_name)?;
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(function.to_string(), func);
        Ok(())
    }

    /// Look up the function named by `qualified_name`.
    pub fn resolve(&self, qualified_name: &str) -> Result<SpatialStatFn> {
        let (module, function) = split_qualified(qualified_name)?;
        let functions = self
            .modules
            .get(module)
            .ok_or_else(|| StitchError::config(format!("Cannot find module {}", module)))?;
        functions.get(function).cloned().ok_or_else(|| {
            StitchError::config(format!(
                "Cannot find function {} in module {}",
                function, module
            ))
        })
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modules
            .iter()
            .flat_map(|(module, functions)| {
                functions.keys().map(move |f| format!("{}.{}", module, f))
            })
            .collect();
        names.sort();
        names
    }
}

fn split_qualified(name: &str) -> Result<(&str, &str)> {
    match name.rsplit_once('.') {
        Some((module, function)) if !module.is_empty() && !function.is_empty() => {
            Ok((module, function))
        }
        _ => Err(StitchError::config(format!(
            "'{}' is not valid: the callback must be a fully qualified function name, \
             ie. modulename.function_name, eg. segstitch.spatial.variogram",
            name
        ))),
    }
}

/// Mean column and row of the segment.
fn mean_coord(pixels: &[SpatialPixel], _param: &Value) -> Result<Vec<f64>> {
    if pixels.is_empty() {
        return Ok(vec![0.0, 0.0]);
    }
    let n = pixels.len() as f64;
    let (sx, sy) = pixels
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
    Ok(vec![sx / n, sy / n])
}

/// Semivariance of horizontally separated pixel pairs within the segment,
/// for lags `1..=param`. Lags without a pair give 0.
fn variogram(pixels: &[SpatialPixel], param: &Value) -> Result<Vec<f64>> {
    let max_lag = param.as_u64().filter(|&n| n > 0).ok_or_else(|| {
        StitchError::stats(format!(
            "variogram parameter must be a positive integer lag count, got {}",
            param
        ))
    })?;

    let lookup: HashMap<(i64, i64), f64> = pixels.iter().map(|p| ((p.x, p.y), p.value)).collect();

    let mut values = Vec::with_capacity(max_lag as usize);
    for lag in 1..=max_lag as i64 {
        let mut sum = 0.0;
        let mut pairs = 0usize;
        for p in pixels {
            if let Some(other) = lookup.get(&(p.x + lag, p.y)) {
                let diff = p.value - other;
                sum += diff * diff;
                pairs += 1;
            }
        }
        values.push(if pairs > 0 { sum / (2.0 * pairs as f64) } else { 0.0 });
    }
    Ok(values)
}
