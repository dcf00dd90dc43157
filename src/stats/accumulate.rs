//! Per-segment reductions.
//!
//! A block is reduced to a [`Partial`] holding the running state of each
//! segment it touches. Partials are folded into an [`Accumulator`], which
//! finishes a segment as soon as every one of its pixels has been seen
//! (according to the segmentation's pixel-count histogram), writes its row
//! and drops its state. Only segments straddling the blocks read so far are
//! held in memory.

use crate::callbacks::{SpatialPixel, SpatialStatFn};
use crate::error::{Result, StitchError};
use crate::state::{ColumnSpec, ColumnType, StatKind, StatSelection};
use crate::stats::{BlockData, OutputColumn};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Segment id of pixels outside every segment.
const NULL_SEGMENT: u64 = 0;

/// A per-segment statistic built up pixel by pixel.
pub(crate) trait Reduction: Send + Sync + 'static {
    /// Running state of one segment.
    type State: Send + 'static;

    fn new_state(&self) -> Self::State;

    /// Add one valid pixel at full-raster (x, y).
    fn add(&self, state: &mut Self::State, x: i64, y: i64, value: f64);

    fn combine(&self, state: &mut Self::State, other: Self::State);

    /// Row of a finished segment, one value per column.
    fn finish(&self, id: u64, state: Self::State) -> Result<Vec<f64>>;

    fn columns(&self) -> &[ColumnSpec];
}

struct Tracked<S> {
    /// Pixels of the segment seen, no-data included
    seen: u64,
    /// Pixels added to `state`
    counted: u64,
    state: S,
}

/// Per-segment state of one block, or of several merged blocks.
pub(crate) struct Partial<S> {
    segments: HashMap<u64, Tracked<S>>,
}

impl<S: Send + 'static> Partial<S> {
    pub fn from_block<R: Reduction<State = S>>(reduction: &R, block: &BlockData) -> Self {
        let mut segments: HashMap<u64, Tracked<S>> = HashMap::new();
        for (i, (&id, &value)) in block.segments.iter().zip(&block.values).enumerate() {
            if id == NULL_SEGMENT {
                continue;
            }
            let tracked = segments.entry(id).or_insert_with(|| Tracked {
                seen: 0,
                counted: 0,
                state: reduction.new_state(),
            });
            tracked.seen += 1;
            if block.is_nodata(value) {
                continue;
            }
            let (x, y) = block.coords(i);
            reduction.add(&mut tracked.state, x, y, value);
            tracked.counted += 1;
        }
        Self { segments }
    }
}

/// Folds partials into result columns.
pub(crate) struct Accumulator<R: Reduction> {
    reduction: Arc<R>,
    /// Pixels per segment id; without it segments finish at the end
    expected: Option<Arc<Vec<u64>>>,
    open: HashMap<u64, Tracked<R::State>>,
    finished: HashSet<u64>,
    columns: Vec<OutputColumn>,
    written: usize,
    peak_open: usize,
}

impl<R: Reduction> Accumulator<R> {
    pub fn new(reduction: Arc<R>, expected: Option<Vec<u64>>) -> Self {
        let columns = reduction
            .columns()
            .iter()
            .map(|spec| OutputColumn {
                name: spec.name.clone(),
                kind: spec.kind,
                values: Vec::new(),
            })
            .collect();
        Self {
            reduction,
            expected: expected.map(Arc::new),
            open: HashMap::new(),
            finished: HashSet::new(),
            columns,
            written: 0,
            peak_open: 0,
        }
    }

    pub fn reduction(&self) -> Arc<R> {
        Arc::clone(&self.reduction)
    }

    pub fn merge(&mut self, partial: Partial<R::State>) -> Result<()> {
        let expected = self.expected.clone();
        for (id, tracked) in partial.segments {
            if self.finished.contains(&id) {
                return Err(StitchError::stats(format!(
                    "segment {} has more pixels than its histogram count",
                    id
                )));
            }
            let seen = match self.open.entry(id) {
                Entry::Occupied(mut entry) => {
                    let open = entry.get_mut();
                    open.seen += tracked.seen;
                    open.counted += tracked.counted;
                    self.reduction.combine(&mut open.state, tracked.state);
                    open.seen
                }
                Entry::Vacant(entry) => entry.insert(tracked).seen,
            };

            let complete = expected
                .as_deref()
                .and_then(|counts| counts.get(id as usize))
                .is_some_and(|&count| seen >= count);
            if complete {
                if let Some(done) = self.open.remove(&id) {
                    self.finish(id, done)?;
                }
            }
        }
        self.peak_open = self.peak_open.max(self.open.len());
        Ok(())
    }

    fn finish(&mut self, id: u64, tracked: Tracked<R::State>) -> Result<()> {
        self.finished.insert(id);
        // every pixel was no-data
        if tracked.counted == 0 {
            return Ok(());
        }
        let values = self.reduction.finish(id, tracked.state)?;
        if values.len() != self.columns.len() {
            return Err(StitchError::stats(format!(
                "statistic returned {} values for segment {}, expected {}",
                values.len(),
                id,
                self.columns.len()
            )));
        }
        let row = usize::try_from(id)
            .map_err(|_| StitchError::stats(format!("segment id {} out of range", id)))?;
        for (column, value) in self.columns.iter_mut().zip(values) {
            if column.values.len() <= row {
                column.values.resize(row + 1, 0.0);
            }
            column.values[row] = value;
        }
        self.written += 1;
        Ok(())
    }

    /// Segments still waiting for pixels.
    pub fn open_segments(&self) -> usize {
        self.open.len()
    }

    pub fn peak_open(&self) -> usize {
        self.peak_open
    }

    /// Finish the remaining segments. Returns the columns, indexed by segment
    /// id up to the largest id written, and the number of segments written.
    pub fn finish_all(mut self) -> Result<(Vec<OutputColumn>, usize)> {
        if self.expected.is_some() && !self.open.is_empty() {
            tracing::warn!(
                "{} segments have fewer pixels than their histogram count",
                self.open.len()
            );
        }
        let mut remaining: Vec<_> = std::mem::take(&mut self.open).into_iter().collect();
        remaining.sort_by_key(|(id, _)| *id);
        for (id, tracked) in remaining {
            self.finish(id, tracked)?;
        }

        Ok((self.columns, self.written))
    }
}

/// Running statistics of one segment.
#[derive(Debug, Clone)]
pub(crate) struct SegmentStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    values: Vec<f64>,
}

impl SegmentStats {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            values: Vec::new(),
        }
    }

    fn add(&mut self, value: f64, keep_value: bool) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if keep_value {
            self.values.push(value);
        }
    }

    fn merge(&mut self, other: SegmentStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.values.extend(other.values);
    }

    /// `sorted` must hold this segment's values in ascending order if `kind`
    /// needs values.
    fn value(&self, kind: StatKind, sorted: &[f64]) -> f64 {
        let n = self.count as f64;
        match kind {
            StatKind::Min => self.min,
            StatKind::Max => self.max,
            StatKind::Mean => self.sum / n,
            StatKind::Stddev => {
                let mean = self.sum / n;
                (self.sum_sq / n - mean * mean).max(0.0).sqrt()
            }
            StatKind::PixCount => n,
            StatKind::Median => percentile(sorted, 50.0),
            StatKind::Percentile(p) => percentile(sorted, p),
            StatKind::Mode => mode(sorted),
        }
    }
}

/// Nearest-rank percentile of ascending `sorted`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Most frequent value of ascending `sorted`; the smallest wins ties.
fn mode(sorted: &[f64]) -> f64 {
    let mut best = (0.0, 0usize);
    let mut i = 0;
    while i < sorted.len() {
        let run = sorted[i..].iter().take_while(|&&v| v == sorted[i]).count();
        if run > best.1 {
            best = (sorted[i], run);
        }
        i += run;
    }
    best.0
}

/// Aggregate statistics, one column per selection entry.
pub(crate) struct AggregateReduction {
    selection: Vec<StatSelection>,
    columns: Vec<ColumnSpec>,
    keep_values: bool,
}

impl AggregateReduction {
    pub fn new(selection: &[StatSelection]) -> Self {
        Self {
            selection: selection.to_vec(),
            columns: selection
                .iter()
                .map(|s| ColumnSpec {
                    name: s.column.clone(),
                    kind: column_type(s.kind),
                })
                .collect(),
            keep_values: selection.iter().any(|s| s.kind.needs_values()),
        }
    }
}

fn column_type(kind: StatKind) -> ColumnType {
    match kind {
        StatKind::PixCount => ColumnType::Integer,
        _ => ColumnType::Real,
    }
}

impl Reduction for AggregateReduction {
    type State = SegmentStats;

    fn new_state(&self) -> SegmentStats {
        SegmentStats::new()
    }

    fn add(&self, state: &mut SegmentStats, _x: i64, _y: i64, value: f64) {
        state.add(value, self.keep_values);
    }

    fn combine(&self, state: &mut SegmentStats, other: SegmentStats) {
        state.merge(other);
    }

    fn finish(&self, _id: u64, mut state: SegmentStats) -> Result<Vec<f64>> {
        state.values.sort_by(f64::total_cmp);
        Ok(self
            .selection
            .iter()
            .map(|s| state.value(s.kind, &state.values))
            .collect())
    }

    fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }
}

/// A spatial statistic callback applied to each segment's pixels.
pub(crate) struct SpatialReduction {
    columns: Vec<ColumnSpec>,
    func: SpatialStatFn,
    param: serde_json::Value,
}

impl SpatialReduction {
    pub fn new(columns: Vec<ColumnSpec>, func: SpatialStatFn, param: serde_json::Value) -> Self {
        Self {
            columns,
            func,
            param,
        }
    }
}

impl Reduction for SpatialReduction {
    type State = Vec<SpatialPixel>;

    fn new_state(&self) -> Vec<SpatialPixel> {
        Vec::new()
    }

    fn add(&self, state: &mut Vec<SpatialPixel>, x: i64, y: i64, value: f64) {
        state.push(SpatialPixel { x, y, value });
    }

    fn combine(&self, state: &mut Vec<SpatialPixel>, other: Vec<SpatialPixel>) {
        state.extend(other);
    }

    fn finish(&self, _id: u64, mut pixels: Vec<SpatialPixel>) -> Result<Vec<f64>> {
        // blocks arrive in any order
        pixels.sort_by_key(|p| (p.y, p.x));
        (self.func)(&pixels, &self.param)
    }

    fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }
}
