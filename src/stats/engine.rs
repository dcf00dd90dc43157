//! Concurrent tiled read/compute engine.

use crate::callbacks::SpatialStatFn;
use crate::config::ConcurrencyStyle;
use crate::error::{Result, StitchError};
use crate::raster::ClosedRaster;
use crate::state::{AggregateStatsTask, SpatialStatsTask};
use crate::stats::accumulate::{Accumulator, AggregateReduction, Partial, Reduction, SpatialReduction};
use crate::stats::{
    block_grid, Block, BlockData, OutputColumn, StatisticsEngine, StatsBackend, StatsReport,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::timeout;

/// Statistics engine reading the rasters in square blocks.
pub struct TiledStatsEngine<B> {
    backend: Arc<B>,
    block_size: usize,
}

impl<B: StatsBackend> TiledStatsEngine<B> {
    pub fn new(backend: B, block_size: usize) -> Self {
        Self {
            backend: Arc::new(backend),
            block_size: block_size.max(1),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `f` against the backend on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&B) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || f(&backend))
            .await
            .map_err(join_error)?
    }

    /// Read every block of `image` against the segmentation, reduce it per
    /// segment and write the resulting columns.
    async fn compute<R: Reduction>(
        &self,
        segments: &Path,
        image: &str,
        band: usize,
        style: &ConcurrencyStyle,
        reduction: R,
    ) -> Result<StatsReport> {
        let path = segments.to_path_buf();
        let (width, height, expected) = self
            .blocking(move |b| {
                let (width, height) = b.segment_dimensions(&path)?;
                Ok((width, height, b.pixel_counts(&path)?))
            })
            .await?;
        if expected.is_none() {
            tracing::warn!(
                "{} has no pixel counts, segments are held until every block is read",
                segments.display()
            );
        }

        let blocks = block_grid(width, height, self.block_size);
        let num_blocks = blocks.len();
        let acc = Accumulator::new(Arc::new(reduction), expected);

        let acc = if style.reads_inline() {
            tracing::debug!("Reading {}x{} in {} blocks inline", width, height, num_blocks);
            self.reduce_inline(segments, image, band, blocks, acc).await?
        } else {
            tracing::debug!(
                "Reading {}x{} in {} blocks with {} readers",
                width,
                height,
                num_blocks,
                style.num_read_workers
            );
            self.reduce_pipelined(segments, image, band, blocks, style, acc).await?
        };
        tracing::debug!("At most {} segments were open at once", acc.peak_open());

        let (columns, count) = tokio::task::spawn_blocking(move || acc.finish_all())
            .await
            .map_err(join_error)??;
        let names = self.write(segments, columns).await?;
        Ok(StatsReport {
            segments: count,
            columns: names,
            blocks: num_blocks,
        })
    }

    /// Read and reduce each block in turn on one blocking task. No buffers,
    /// so no buffer timeouts apply.
    async fn reduce_inline<R: Reduction>(
        &self,
        segments: &Path,
        image: &str,
        band: usize,
        blocks: Vec<Block>,
        mut acc: Accumulator<R>,
    ) -> Result<Accumulator<R>> {
        let backend = Arc::clone(&self.backend);
        let segments = segments.to_path_buf();
        let image = image.to_string();

        tokio::task::spawn_blocking(move || -> Result<Accumulator<R>> {
            let mut reader = backend.open_reader(&segments, &image, band)?;
            let reduction = acc.reduction();
            for block in blocks {
                let data = reader.read_block(block)?;
                acc.merge(Partial::from_block(reduction.as_ref(), &data))?;
            }
            Ok(acc)
        })
        .await
        .map_err(join_error)?
    }

    /// Readers feed the read buffer, one compute stage reduces blocks into
    /// the compute buffer and the merge stage folds partials into `acc`.
    async fn reduce_pipelined<R: Reduction>(
        &self,
        segments: &Path,
        image: &str,
        band: usize,
        blocks: Vec<Block>,
        style: &ConcurrencyStyle,
        acc: Accumulator<R>,
    ) -> Result<Accumulator<R>> {
        let readers = style.num_read_workers;

        // Pre-filled shared work queue
        let (work_tx, work_rx) = async_channel::bounded::<Block>(blocks.len().max(1));
        for block in blocks {
            let _ = work_tx.send(block).await;
        }
        work_tx.close();

        let (read_tx, read_rx) = mpsc::channel::<BlockData>(readers * 2);
        let (compute_tx, compute_rx) = mpsc::channel::<Partial<R::State>>(readers * 2);

        let mut reader_handles = Vec::with_capacity(readers);
        for _ in 0..readers {
            let backend = Arc::clone(&self.backend);
            let work_rx = work_rx.clone();
            let read_tx = read_tx.clone();
            let segments = segments.to_path_buf();
            let image = image.to_string();
            let insert_timeout = style.read_buffer_insert_timeout;

            reader_handles.push(tokio::spawn(async move {
                let result =
                    run_reader(backend, segments, image, band, &work_rx, read_tx, insert_timeout).await;
                if result.is_err() {
                    // stop the other readers picking up more work
                    work_rx.close();
                }
                result
            }));
        }
        drop(read_tx);

        let compute_handle = tokio::spawn(run_compute(
            acc.reduction(),
            read_rx,
            compute_tx,
            style.read_buffer_pop_timeout,
            style.compute_buffer_insert_timeout,
        ));
        let merge_handle = tokio::spawn(run_merge(acc, compute_rx, style.compute_buffer_pop_timeout));

        // A failed stage drops its channel ends, so the stages around it end
        // quietly and the first error in pipeline order is the cause.
        let mut reader_error = None;
        for handle in reader_handles {
            if let Err(e) = flatten(handle.await) {
                reader_error.get_or_insert(e);
            }
        }
        let compute_result = flatten(compute_handle.await);
        let merge_result = flatten(merge_handle.await);

        if let Some(e) = reader_error {
            return Err(e);
        }
        compute_result?;
        merge_result
    }

    async fn write(&self, segments: &Path, columns: Vec<OutputColumn>) -> Result<Vec<String>> {
        let names = columns.iter().map(|c| c.name.clone()).collect();
        let path = segments.to_path_buf();
        self.blocking(move |b| b.write_columns(&path, &columns)).await?;
        Ok(names)
    }
}

#[async_trait]
impl<B: StatsBackend> StatisticsEngine for TiledStatsEngine<B> {
    async fn per_segment_stats(
        &self,
        task: &AggregateStatsTask,
        segments: &ClosedRaster,
        style: &ConcurrencyStyle,
    ) -> Result<StatsReport> {
        let start = Instant::now();
        let reduction = AggregateReduction::new(&task.selection);
        let report = self
            .compute(segments.path(), &task.image, task.band, style, reduction)
            .await?;

        tracing::info!(
            "Stats for {} band {}: {} segments, {} columns in {:.1}s",
            task.image,
            task.band,
            report.segments,
            report.columns.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    async fn per_segment_spatial_stats(
        &self,
        task: &SpatialStatsTask,
        segments: &ClosedRaster,
        func: SpatialStatFn,
        style: &ConcurrencyStyle,
    ) -> Result<StatsReport> {
        let start = Instant::now();
        let reduction = SpatialReduction::new(task.columns.clone(), func, task.param.clone());
        let report = self
            .compute(segments.path(), &task.image, task.band, style, reduction)
            .await?;

        tracing::info!(
            "Spatial stats {} for {} band {}: {} segments in {:.1}s",
            task.callback,
            task.image,
            task.band,
            report.segments,
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }
}

/// Reader worker: pulls blocks off the queue until it is empty or the read
/// buffer goes away.
async fn run_reader<B: StatsBackend>(
    backend: Arc<B>,
    segments: PathBuf,
    image: String,
    band: usize,
    work_rx: &async_channel::Receiver<Block>,
    read_tx: mpsc::Sender<BlockData>,
    insert_timeout: Duration,
) -> Result<()> {
    let mut reader = tokio::task::spawn_blocking(move || backend.open_reader(&segments, &image, band))
        .await
        .map_err(join_error)??;

    while let Ok(block) = work_rx.recv().await {
        // the reader moves onto the blocking pool and back for each block
        let (returned, data) = tokio::task::spawn_blocking(move || {
            let data = reader.read_block(block);
            (reader, data)
        })
        .await
        .map_err(join_error)?;
        reader = returned;

        match timeout(insert_timeout, read_tx.send(data?)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!("Read buffer closed, stopping reader");
                break;
            }
            Err(_) => {
                return Err(StitchError::stats_timeout(format!(
                    "read buffer insert timed out after {:?}",
                    insert_timeout
                )))
            }
        }
    }
    Ok(())
}

/// Compute stage: reduces each block on the blocking pool.
async fn run_compute<R: Reduction>(
    reduction: Arc<R>,
    mut read_rx: mpsc::Receiver<BlockData>,
    compute_tx: mpsc::Sender<Partial<R::State>>,
    pop_timeout: Duration,
    insert_timeout: Duration,
) -> Result<()> {
    loop {
        let data = match timeout(pop_timeout, read_rx.recv()).await {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(_) => {
                return Err(StitchError::stats_timeout(format!(
                    "read buffer pop timed out after {:?}",
                    pop_timeout
                )))
            }
        };

        let reduction = Arc::clone(&reduction);
        let partial = tokio::task::spawn_blocking(move || Partial::from_block(reduction.as_ref(), &data))
            .await
            .map_err(join_error)?;

        match timeout(insert_timeout, compute_tx.send(partial)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!("Compute buffer closed, stopping compute stage");
                break;
            }
            Err(_) => {
                return Err(StitchError::stats_timeout(format!(
                    "compute buffer insert timed out after {:?}",
                    insert_timeout
                )))
            }
        }
    }
    Ok(())
}

/// Merge stage: folds partials into the accumulator on the blocking pool,
/// finishing segments as they complete.
async fn run_merge<R: Reduction>(
    mut acc: Accumulator<R>,
    mut compute_rx: mpsc::Receiver<Partial<R::State>>,
    pop_timeout: Duration,
) -> Result<Accumulator<R>> {
    loop {
        let partial = match timeout(pop_timeout, compute_rx.recv()).await {
            Ok(Some(partial)) => partial,
            Ok(None) => return Ok(acc),
            Err(_) => {
                return Err(StitchError::stats_timeout(format!(
                    "compute buffer pop timed out after {:?}",
                    pop_timeout
                )))
            }
        };

        let (returned, merged) = tokio::task::spawn_blocking(move || {
            let merged = acc.merge(partial);
            (acc, merged)
        })
        .await
        .map_err(join_error)?;
        acc = returned;
        merged?;
    }
}

fn join_error(err: JoinError) -> StitchError {
    StitchError::stats(format!("statistics task failed: {}", err))
}

fn flatten<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    joined.map_err(join_error)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::SpatialPixel;
    use crate::state::{ColumnSpec, ColumnType, StatKind, StatSelection};
    use crate::stats::BlockReader;
    use std::sync::Mutex;

    /// In-memory rasters. Segments and values are row-major.
    struct MemoryBackend {
        width: usize,
        height: usize,
        segments: Arc<Vec<u64>>,
        values: Arc<Vec<f64>>,
        nodata: Option<f64>,
        read_delay: Duration,
        fail_reads: bool,
        histogram: bool,
        written: Mutex<Vec<OutputColumn>>,
    }

    impl MemoryBackend {
        fn new(width: usize, height: usize, segments: Vec<u64>, values: Vec<f64>) -> Self {
            Self {
                width,
                height,
                segments: Arc::new(segments),
                values: Arc::new(values),
                nodata: None,
                read_delay: Duration::ZERO,
                fail_reads: false,
                histogram: true,
                written: Mutex::new(Vec::new()),
            }
        }

        fn column(&self, name: &str) -> Vec<f64> {
            let written = self.written.lock().unwrap();
            written.iter().find(|c| c.name == name).unwrap().values.clone()
        }
    }

    struct MemoryReader {
        width: usize,
        segments: Arc<Vec<u64>>,
        values: Arc<Vec<f64>>,
        nodata: Option<f64>,
        delay: Duration,
        fail: bool,
    }

    impl BlockReader for MemoryReader {
        fn read_block(&mut self, block: Block) -> Result<BlockData> {
            if self.fail {
                return Err(StitchError::raster("injected read failure"));
            }
            std::thread::sleep(self.delay);
            let mut segments = Vec::with_capacity(block.pixel_count());
            let mut values = Vec::with_capacity(block.pixel_count());
            for y in block.yoff..block.yoff + block.height {
                for x in block.xoff..block.xoff + block.width {
                    segments.push(self.segments[y * self.width + x]);
                    values.push(self.values[y * self.width + x]);
                }
            }
            Ok(BlockData {
                block,
                segments,
                values,
                nodata: self.nodata,
            })
        }
    }

    impl StatsBackend for MemoryBackend {
        fn segment_dimensions(&self, _segments: &Path) -> Result<(usize, usize)> {
            Ok((self.width, self.height))
        }

        fn pixel_counts(&self, _segments: &Path) -> Result<Option<Vec<u64>>> {
            if !self.histogram {
                return Ok(None);
            }
            let rows = self.segments.iter().max().map_or(0, |&m| m as usize + 1);
            let mut counts = vec![0u64; rows];
            for &id in self.segments.iter() {
                counts[id as usize] += 1;
            }
            Ok(Some(counts))
        }

        fn open_reader(&self, _segments: &Path, _image: &str, _band: usize) -> Result<Box<dyn BlockReader>> {
            Ok(Box::new(MemoryReader {
                width: self.width,
                segments: Arc::clone(&self.segments),
                values: Arc::clone(&self.values),
                nodata: self.nodata,
                delay: self.read_delay,
                fail: self.fail_reads,
            }))
        }

        fn write_columns(&self, _segments: &Path, columns: &[OutputColumn]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(columns);
            Ok(())
        }
    }

    /// 6x4 raster: left half segment 1, right half segment 2, top row null.
    fn two_segment_backend() -> MemoryBackend {
        let (w, h) = (6, 4);
        let mut segments = Vec::new();
        let mut values = Vec::new();
        for y in 0..h {
            for x in 0..w {
                segments.push(if y == 0 { 0 } else if x < 3 { 1 } else { 2 });
                values.push((y * w + x) as f64);
            }
        }
        MemoryBackend::new(w, h, segments, values)
    }

    fn aggregate_task(kinds: &[(&str, StatKind)]) -> AggregateStatsTask {
        AggregateStatsTask {
            image: "image.tif".to_string(),
            band: 1,
            selection: kinds
                .iter()
                .map(|(c, k)| StatSelection {
                    column: c.to_string(),
                    kind: *k,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_aggregate_stats_across_blocks() {
        // block size smaller than the raster so segments span blocks
        let engine = TiledStatsEngine::new(two_segment_backend(), 2);
        let task = aggregate_task(&[
            ("count", StatKind::PixCount),
            ("mean", StatKind::Mean),
            ("max", StatKind::Max),
        ]);
        let closed = ClosedRaster::new("segs.kea");

        let report = engine
            .per_segment_stats(&task, &closed, &ConcurrencyStyle::new(3))
            .await
            .unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(report.blocks, 6);
        assert_eq!(report.columns, vec!["count", "mean", "max"]);

        let backend = engine.backend();
        assert_eq!(backend.column("count"), vec![0.0, 9.0, 9.0]);
        // segment 1 covers x 0..3 of rows 1..4: values 6,7,8,12,13,14,18,19,20
        assert_eq!(backend.column("mean"), vec![0.0, 13.0, 16.0]);
        assert_eq!(backend.column("max"), vec![0.0, 20.0, 23.0]);
    }

    #[tokio::test]
    async fn test_zero_workers_reads_inline() {
        let engine = TiledStatsEngine::new(two_segment_backend(), 2);
        let task = aggregate_task(&[("count", StatKind::PixCount), ("mean", StatKind::Mean)]);
        let closed = ClosedRaster::new("segs.kea");

        let report = engine
            .per_segment_stats(&task, &closed, &ConcurrencyStyle::new(0))
            .await
            .unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(report.blocks, 6);
        assert_eq!(engine.backend().column("count"), vec![0.0, 9.0, 9.0]);
        assert_eq!(engine.backend().column("mean"), vec![0.0, 13.0, 16.0]);
    }

    #[tokio::test]
    async fn test_zero_workers_ignore_buffer_timeouts() {
        let mut backend = two_segment_backend();
        backend.read_delay = Duration::from_millis(150);
        let engine = TiledStatsEngine::new(backend, 4);
        let task = aggregate_task(&[("count", StatKind::PixCount)]);
        // every block read outlasts the timeout
        let style = ConcurrencyStyle::with_uniform_timeout(0, Duration::from_millis(20));

        let report = engine
            .per_segment_stats(&task, &ClosedRaster::new("s.kea"), &style)
            .await
            .unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(engine.backend().column("count"), vec![0.0, 9.0, 9.0]);
    }

    #[tokio::test]
    async fn test_zero_workers_read_failure() {
        let mut backend = two_segment_backend();
        backend.fail_reads = true;
        let engine = TiledStatsEngine::new(backend, 2);
        let task = aggregate_task(&[("count", StatKind::PixCount)]);

        let err = engine
            .per_segment_stats(&task, &ClosedRaster::new("s.kea"), &ConcurrencyStyle::new(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StitchError::Raster { .. }));
        assert!(engine.backend().written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_without_histogram_matches() {
        let mut backend = two_segment_backend();
        backend.histogram = false;
        let engine = TiledStatsEngine::new(backend, 2);
        let task = aggregate_task(&[("median", StatKind::Median), ("max", StatKind::Max)]);

        let report = engine
            .per_segment_stats(&task, &ClosedRaster::new("s.kea"), &ConcurrencyStyle::new(2))
            .await
            .unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(engine.backend().column("median"), vec![0.0, 13.0, 16.0]);
        assert_eq!(engine.backend().column("max"), vec![0.0, 20.0, 23.0]);
    }

    #[tokio::test]
    async fn test_nodata_excluded() {
        let mut backend = MemoryBackend::new(3, 1, vec![1, 1, 1], vec![5.0, -1.0, 7.0]);
        backend.nodata = Some(-1.0);
        let engine = TiledStatsEngine::new(backend, 8);
        let task = aggregate_task(&[("count", StatKind::PixCount), ("min", StatKind::Min)]);

        engine
            .per_segment_stats(&task, &ClosedRaster::new("s.kea"), &ConcurrencyStyle::new(1))
            .await
            .unwrap();
        assert_eq!(engine.backend().column("count"), vec![0.0, 2.0]);
        assert_eq!(engine.backend().column("min"), vec![0.0, 5.0]);
    }

    #[tokio::test]
    async fn test_slow_reader_times_out() {
        let mut backend = two_segment_backend();
        backend.read_delay = Duration::from_millis(300);
        let engine = TiledStatsEngine::new(backend, 2);
        let task = aggregate_task(&[("count", StatKind::PixCount)]);
        let style = ConcurrencyStyle::with_uniform_timeout(1, Duration::from_millis(50));

        let err = engine
            .per_segment_stats(&task, &ClosedRaster::new("s.kea"), &style)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // nothing written on failure
        assert!(engine.backend().written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let mut backend = two_segment_backend();
        backend.fail_reads = true;
        let engine = TiledStatsEngine::new(backend, 2);
        let task = aggregate_task(&[("count", StatKind::PixCount)]);

        let err = engine
            .per_segment_stats(&task, &ClosedRaster::new("s.kea"), &ConcurrencyStyle::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StitchError::Raster { .. }));
        assert!(engine.backend().written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spatial_stats() {
        let engine = TiledStatsEngine::new(two_segment_backend(), 4);
        let task = SpatialStatsTask {
            image: "image.tif".to_string(),
            band: 1,
            columns: vec![
                ColumnSpec {
                    name: "minx".to_string(),
                    kind: ColumnType::Integer,
                },
                ColumnSpec {
                    name: "miny".to_string(),
                    kind: ColumnType::Integer,
                },
            ],
            callback: "test.bbox".to_string(),
            param: serde_json::Value::Null,
        };
        let func: SpatialStatFn = Arc::new(|pixels: &[SpatialPixel], _: &serde_json::Value| -> Result<Vec<f64>> {
            let minx = pixels.iter().map(|p| p.x).min().unwrap_or(0);
            let miny = pixels.iter().map(|p| p.y).min().unwrap_or(0);
            Ok(vec![minx as f64, miny as f64])
        });

        let report = engine
            .per_segment_spatial_stats(&task, &ClosedRaster::new("s.kea"), func, &ConcurrencyStyle::new(2))
            .await
            .unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(engine.backend().column("minx"), vec![0.0, 0.0, 3.0]);
        assert_eq!(engine.backend().column("miny"), vec![0.0, 1.0, 1.0]);
    }
}
