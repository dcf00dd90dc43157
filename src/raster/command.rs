//! Finalization through an external program.
//!
//! The program receives a single argument, the path of a JSON job file, and
//! must write a JSON result to the job's `resultPath` before exiting with
//! status 0.

use crate::config::FinalizerConfig;
use crate::error::{Result, StitchError};
use crate::raster::{FinalizationResult, FinalizeRequest, Finalizer, GdalSegmentRaster, SourceRaster};
use async_trait::async_trait;
use gdal::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const JOB_FILE: &str = "finalize_job.json";
const RESULT_FILE: &str = "finalize_result.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeJob<'a> {
    input: &'a str,
    output: &'a Path,
    tiles: Vec<JobTile<'a>>,
    tile_info: &'a Value,
    overlap_size: u32,
    temp_dir: &'a Path,
    write_histogram: bool,
    result_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct JobTile<'a> {
    col: i64,
    row: i64,
    path: &'a str,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct FinalizeOutput {
    max_seg_id: u64,
    has_empty_segments: bool,
}

/// Runs the configured finalization program.
#[derive(Debug, Clone)]
pub struct CommandFinalizer {
    program: String,
    args: Vec<String>,
}

impl CommandFinalizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &FinalizerConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn job<'a>(input: &'a SourceRaster, request: &FinalizeRequest<'a>) -> FinalizeJob<'a> {
        FinalizeJob {
            input: &input.path,
            output: request.output_path,
            tiles: request
                .tiles
                .iter()
                .map(|(coord, path)| JobTile {
                    col: coord.col,
                    row: coord.row,
                    path,
                })
                .collect(),
            tile_info: request.tile_info,
            overlap_size: request.overlap_size,
            temp_dir: request.temp_dir,
            write_histogram: request.write_histogram,
            result_path: request.temp_dir.join(RESULT_FILE),
        }
    }
}

#[async_trait]
impl Finalizer for CommandFinalizer {
    async fn open_input(&self, path: &str) -> Result<SourceRaster> {
        let owned = path.to_string();
        tokio::task::spawn_blocking(move || {
            let dataset = Dataset::open(&owned)?;
            let (width, height) = dataset.raster_size();
            Ok(SourceRaster {
                width,
                height,
                band_count: dataset.raster_count() as usize,
                path: owned,
            })
        })
        .await
        .map_err(|e| StitchError::raster(format!("input open task failed: {}", e)))?
    }

    async fn finalize(
        &self,
        input: &SourceRaster,
        request: FinalizeRequest<'_>,
    ) -> Result<FinalizationResult> {
        let job = Self::job(input, &request);
        let job_path = request.temp_dir.join(JOB_FILE);
        let body = serde_json::to_vec_pretty(&job)
            .map_err(|e| StitchError::finalization(format!("failed to encode job: {}", e)))?;
        tokio::fs::write(&job_path, body).await?;

        tracing::info!(
            "Running {} on {} tiles -> {}",
            self.program,
            job.tiles.len(),
            request.output_path.display()
        );
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&job_path)
            .status()
            .await
            .map_err(|e| StitchError::finalization(format!("failed to run {}: {}", self.program, e)))?;
        if !status.success() {
            return Err(StitchError::finalization(format!(
                "{} exited with {}",
                self.program, status
            )));
        }

        let output = read_output(&job.result_path).await?;
        let raster = GdalSegmentRaster::open_for_update(request.output_path)?;
        Ok(FinalizationResult {
            max_segment_id: output.max_seg_id,
            has_empty_segments: output.has_empty_segments,
            raster: Box::new(raster),
        })
    }
}

async fn read_output(path: &Path) -> Result<FinalizeOutput> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        StitchError::finalization(format!("missing result {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StitchError::finalization(format!("malformed result {}: {}", path.display(), e)))
}
