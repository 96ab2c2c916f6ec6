//! Task execution: folds per-chunk results into a finished task
//!
//! Chunk outputs are computed independently (in parallel with the `parallel`
//! feature) and absorbed one at a time at a single reduce barrier. Chunks of the
//! same geographic window are merged; distinct windows are stitched into the
//! output grid when the task finishes. Dropping a [`TaskExecution`] discards all
//! partial state.

use crate::core::accumulator::{ClearPixelAccumulator, ClearPixelState};
use crate::core::anomaly::{AnomalyDetector, AnomalyProduct};
use crate::core::clean_mask::CleanMaskEvaluator;
use crate::core::compositing::Composite;
use crate::core::metadata::{FinalSummary, RunningMetadata};
use crate::task::config::{ProcessingMethod, TaskConfig, TaskKind};
use crate::task::record::{TaskId, TaskMetadata};
use crate::task::store::TaskStore;
use crate::types::{GeoWindow, MosaicError, MosaicResult, QaStack, RasterChunk, TimeRange};
use ndarray::{s, Axis};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Everything computed from one chunk
#[derive(Debug, Clone)]
pub struct ChunkOutput {
    pub window: GeoWindow,
    pub composite: Composite,
    pub clear: Option<ClearPixelState>,
    pub metadata: RunningMetadata,
}

#[derive(Debug)]
struct WindowState {
    composite: Composite,
    clear: Option<ClearPixelState>,
}

/// Stitched products of a finished task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub composite: Composite,
    pub clear: Option<ClearPixelState>,
    pub metadata: TaskMetadata,
}

impl TaskOutcome {
    pub fn summary(&self) -> Option<&FinalSummary> {
        self.metadata.summary.as_ref()
    }
}

/// Running state of one task
pub struct TaskExecution {
    config: TaskConfig,
    method: ProcessingMethod,
    evaluator: CleanMaskEvaluator,
    windows: BTreeMap<GeoWindow, WindowState>,
    metadata: RunningMetadata,
    chunks_absorbed: usize,
}

impl TaskExecution {
    /// Execution evaluating Landsat pixel QA
    pub fn new(config: TaskConfig) -> Self {
        Self::with_evaluator(config, CleanMaskEvaluator::new())
    }

    pub fn with_evaluator(config: TaskConfig, evaluator: CleanMaskEvaluator) -> Self {
        let method = config.processing_method();
        log::info!(
            "Starting {} task with {} compositor (iterative={}, reverse_time={})",
            config.kind,
            method.mode,
            config.is_iterative(),
            config.reverse_time()
        );
        Self {
            config,
            method,
            evaluator,
            windows: BTreeMap::new(),
            metadata: RunningMetadata::new(),
            chunks_absorbed: 0,
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn metadata(&self) -> &RunningMetadata {
        &self.metadata
    }

    pub fn chunks_absorbed(&self) -> usize {
        self.chunks_absorbed
    }

    /// Mask, composite and tally one chunk; touches no shared state
    pub fn process_chunk(&self, chunk: &RasterChunk, qa: &QaStack) -> MosaicResult<ChunkOutput> {
        let mask = self.evaluator.evaluate_with_data(qa, &chunk.data)?;
        let (chunk, mask) = chunk.ordered(&mask, self.config.time_order());

        let composite = (self.method.composite)(&chunk, &mask)?;
        let clear = if self.method.clear_percentage {
            Some(ClearPixelAccumulator::update(&chunk, &mask, None)?)
        } else {
            None
        };
        let metadata = RunningMetadata::from_chunk(&chunk, &mask)?;

        Ok(ChunkOutput {
            window: chunk.window,
            composite,
            clear,
            metadata,
        })
    }

    /// Fold one chunk output into the running task state
    pub fn absorb(&mut self, output: ChunkOutput) -> MosaicResult<()> {
        let ChunkOutput {
            window,
            composite,
            clear,
            metadata,
        } = output;

        match self.windows.entry(window) {
            Entry::Vacant(entry) => {
                entry.insert(WindowState { composite, clear });
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                let merged_composite = state.composite.merge(&composite)?;
                let merged_clear = match (&state.clear, clear) {
                    (Some(current), Some(incoming)) => Some(current.merge(&incoming)?),
                    (Some(current), None) => Some(current.clone()),
                    (None, incoming) => incoming,
                };
                state.composite = merged_composite;
                state.clear = merged_clear;
            }
        }

        self.metadata = RunningMetadata::combine(std::mem::take(&mut self.metadata), metadata);
        self.chunks_absorbed += 1;
        log::debug!(
            "Absorbed chunk at {:?} ({} chunks, {} windows)",
            window,
            self.chunks_absorbed,
            self.windows.len()
        );
        Ok(())
    }

    /// Process every chunk, then absorb the outputs in load order
    pub fn process_all(&mut self, chunks: &[(RasterChunk, QaStack)]) -> MosaicResult<()> {
        log::info!("Processing {} chunks", chunks.len());

        #[cfg(feature = "parallel")]
        let outputs: Vec<ChunkOutput> = {
            use rayon::prelude::*;
            chunks
                .par_iter()
                .map(|(chunk, qa)| self.process_chunk(chunk, qa))
                .collect::<MosaicResult<Vec<_>>>()?
        };

        #[cfg(not(feature = "parallel"))]
        let outputs: Vec<ChunkOutput> = chunks
            .iter()
            .map(|(chunk, qa)| self.process_chunk(chunk, qa))
            .collect::<MosaicResult<Vec<_>>>()?;

        for output in outputs {
            self.absorb(output)?;
        }
        Ok(())
    }

    /// Persist the running tallies without finalizing
    pub fn checkpoint<S: TaskStore>(&self, store: &mut S, id: TaskId) -> MosaicResult<()> {
        log::debug!("Checkpointing task {} after {} chunks", id, self.chunks_absorbed);
        store.save_metadata(
            id,
            TaskMetadata {
                running: self.metadata.clone(),
                summary: None,
            },
        )
    }

    /// Stitch every window into a `(rows, cols)` grid and finalize the summary
    pub fn finish(self, grid_shape: (usize, usize)) -> MosaicResult<TaskOutcome> {
        let (rows, cols) = grid_shape;
        let bands = match self.windows.values().next() {
            Some(state) => state.composite.bands.clone(),
            None => return Err(MosaicError::Processing("No chunks were processed".to_string())),
        };

        let mut composite = Composite::empty(self.method.mode, grid_shape, bands);
        let mut clear = self
            .method
            .clear_percentage
            .then(|| ClearPixelState::empty(grid_shape));

        for (window, state) in &self.windows {
            if !window.fits_within(rows, cols) {
                return Err(MosaicError::ShapeMismatch(format!(
                    "Window {:?} falls outside the {}x{} grid",
                    window, rows, cols
                )));
            }
            if state.composite.bands != composite.bands {
                return Err(MosaicError::ShapeMismatch(format!(
                    "Window {:?} has bands {:?}, expected {:?}",
                    window, state.composite.bands, composite.bands
                )));
            }

            let r = window.row_offset..window.row_end();
            let c = window.col_offset..window.col_end();
            composite
                .data
                .slice_mut(s![r.clone(), c.clone(), ..])
                .assign(&state.composite.data);
            composite
                .acquisition
                .slice_mut(s![r.clone(), c.clone()])
                .assign(&state.composite.acquisition);
            composite
                .score
                .slice_mut(s![r.clone(), c.clone()])
                .assign(&state.composite.score);

            if let (Some(target), Some(part)) = (clear.as_mut(), state.clear.as_ref()) {
                target
                    .total_pixels
                    .slice_mut(s![r.clone(), c.clone()])
                    .assign(&part.total_pixels);
                target
                    .total_clear
                    .slice_mut(s![r.clone(), c.clone()])
                    .assign(&part.total_clear);
                target
                    .clear_percentage
                    .slice_mut(s![r, c])
                    .assign(&part.clear_percentage);
            }
        }

        let summary = FinalSummary::finalize(&composite.data, &self.metadata);
        log::info!(
            "Finished {} task: {} chunks over {} windows, {:.2}% clean",
            self.config.kind,
            self.chunks_absorbed,
            self.windows.len(),
            summary.percentage_clean_pixels
        );

        Ok(TaskOutcome {
            composite,
            clear,
            metadata: TaskMetadata {
                running: self.metadata,
                summary: Some(summary),
            },
        })
    }
}

/// Run a task end to end, checkpointing tallies and storing the final metadata
pub fn execute<S: TaskStore>(
    store: &mut S,
    id: TaskId,
    config: TaskConfig,
    chunks: &[(RasterChunk, QaStack)],
    grid_shape: (usize, usize),
) -> MosaicResult<TaskOutcome> {
    let mut execution = TaskExecution::new(config);
    execution.process_all(chunks)?;
    execution.checkpoint(store, id)?;

    let outcome = execution.finish(grid_shape)?;
    store.save_metadata(id, outcome.metadata.clone())?;
    Ok(outcome)
}

/// Spectral anomaly products of one task
#[derive(Debug, Clone)]
pub struct AnomalyOutcome {
    pub baseline: TaskOutcome,
    pub analysis: TaskOutcome,
    pub anomaly: AnomalyProduct,
    /// Analysis composite summary over baseline and analysis acquisitions
    pub metadata: TaskMetadata,
}

/// Composite the baseline and analysis windows separately and compare them
pub fn detect_anomalies(
    config: &TaskConfig,
    chunks: &[(RasterChunk, QaStack)],
    grid_shape: (usize, usize),
) -> MosaicResult<AnomalyOutcome> {
    if config.kind != TaskKind::SpectralAnomaly {
        return Err(MosaicError::InvalidConfig(format!(
            "Anomaly detection needs a spectral anomaly task, got {}",
            config.kind
        )));
    }
    let params = config
        .anomaly
        .as_ref()
        .ok_or_else(|| MosaicError::InvalidConfig("Missing spectral anomaly parameters".to_string()))?;

    let run_window = |range: &TimeRange| -> MosaicResult<TaskOutcome> {
        let subset = chunks
            .iter()
            .map(|(chunk, qa)| select_time_range(chunk, qa, range))
            .collect::<MosaicResult<Vec<_>>>()?;
        let mut execution = TaskExecution::new(config.clone());
        execution.process_all(&subset)?;
        execution.finish(grid_shape)
    };

    log::info!(
        "Spectral anomaly: baseline {}, analysis {}",
        params.baseline,
        params.analysis
    );
    let baseline = run_window(&params.baseline)?;
    let analysis = run_window(&params.analysis)?;

    let detector = AnomalyDetector::new(params.query_type, params.thresholds());
    let anomaly = detector.detect(&baseline.composite, &analysis.composite)?;

    let running = RunningMetadata::combine(
        baseline.metadata.running.clone(),
        analysis.metadata.running.clone(),
    );
    let summary = FinalSummary::finalize(&analysis.composite.data, &running);

    Ok(AnomalyOutcome {
        baseline,
        analysis,
        anomaly,
        metadata: TaskMetadata {
            running,
            summary: Some(summary),
        },
    })
}

fn select_time_range(chunk: &RasterChunk, qa: &QaStack, range: &TimeRange) -> MosaicResult<(RasterChunk, QaStack)> {
    let indices: Vec<usize> = chunk
        .times
        .iter()
        .enumerate()
        .filter(|(_, time)| range.contains(time))
        .map(|(i, _)| i)
        .collect();

    let subset = RasterChunk::with_window(
        indices.iter().map(|&i| chunk.times[i]).collect(),
        chunk.data.select(Axis(0), &indices),
        chunk.bands.clone(),
        chunk.window,
    )?;
    Ok((subset, qa.select(Axis(0), &indices)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compositing::CompositingMode;
    use crate::task::store::MemoryTaskStore;
    use crate::types::{AcquisitionKey, RasterStack, NO_DATA};
    use ndarray::Array3;

    const CLEAR: i32 = 322;
    const CLOUD: i32 = 352;

    fn key(day: i64) -> AcquisitionKey {
        AcquisitionKey::from_millis(day * 86_400_000).unwrap()
    }

    fn chunk(days: &[i64], window: GeoWindow, value: f32) -> RasterChunk {
        let data = RasterStack::from_shape_fn((days.len(), window.rows, window.cols, 1), |(t, _, _, _)| {
            value + t as f32
        });
        RasterChunk::with_window(days.iter().map(|&d| key(d)).collect(), data, vec!["red".to_string()], window)
            .unwrap()
    }

    #[test]
    fn test_windows_are_stitched() {
        let config = TaskConfig::new(TaskKind::CloudCoverage);
        let left = GeoWindow::new(0, 0, 2, 2);
        let right = GeoWindow::new(0, 2, 2, 1);
        let chunks = vec![
            (chunk(&[0, 1], left, 10.0), Array3::from_elem((2, 2, 2), CLEAR)),
            (chunk(&[0, 1], right, 20.0), Array3::from_elem((2, 2, 1), CLOUD)),
        ];

        let mut execution = TaskExecution::new(config);
        execution.process_all(&chunks).unwrap();
        let outcome = execution.finish((2, 3)).unwrap();

        // Most recent clear slice on the left, nothing clear on the right
        assert_eq!(outcome.composite.data[[0, 0, 0]], 11.0);
        assert_eq!(outcome.composite.data[[1, 2, 0]], NO_DATA);

        let summary = outcome.summary().unwrap();
        assert_eq!(summary.pixel_count, 6);
        assert_eq!(summary.clean_pixel_count, 4);
        assert_eq!(summary.clean_pixels_per_acquisition, "4,4");

        let clear = outcome.clear.unwrap();
        assert_eq!(clear.total_pixels[[0, 2]], 2);
        assert_eq!(clear.total_clear[[0, 2]], 0);
        assert_eq!(clear.clear_percentage[[0, 0]], 1.0);
    }

    #[test]
    fn test_time_chunks_of_one_window_merge() {
        let window = GeoWindow::origin(1, 1);
        let mut qa_late = Array3::from_elem((2, 1, 1), CLEAR);
        qa_late[[1, 0, 0]] = CLOUD;
        let chunks = vec![
            (chunk(&[4, 5], window, 50.0), qa_late),
            (chunk(&[0, 1], window, 1.0), Array3::from_elem((2, 1, 1), CLEAR)),
        ];

        let mut execution = TaskExecution::new(TaskConfig::new(TaskKind::CloudCoverage));
        execution.process_all(&chunks).unwrap();
        let outcome = execution.finish((1, 1)).unwrap();

        // Day 4 is the latest clear acquisition
        assert_eq!(outcome.composite.data[[0, 0, 0]], 50.0);
        assert_eq!(outcome.composite.acquisition[[0, 0]], Some(key(4)));
        let clear = outcome.clear.unwrap();
        assert_eq!(clear.total_pixels[[0, 0]], 4);
        assert_eq!(clear.total_clear[[0, 0]], 3);
        assert_eq!(outcome.metadata.running.len(), 4);
    }

    #[test]
    fn test_median_rejects_time_chunking() {
        let mut config = TaskConfig::new(TaskKind::SpectralAnomaly);
        config.compositor = CompositingMode::MedianPixel;
        let window = GeoWindow::origin(1, 1);
        let chunks = vec![
            (chunk(&[0], window, 1.0), Array3::from_elem((1, 1, 1), CLEAR)),
            (chunk(&[1], window, 2.0), Array3::from_elem((1, 1, 1), CLEAR)),
        ];

        let mut execution = TaskExecution::new(config);
        assert!(execution.process_all(&chunks).is_err());
    }

    #[test]
    fn test_finish_without_chunks_fails() {
        let execution = TaskExecution::new(TaskConfig::new(TaskKind::CloudCoverage));
        assert!(execution.finish((1, 1)).is_err());
    }

    #[test]
    fn test_window_outside_grid_fails() {
        let window = GeoWindow::new(1, 1, 1, 1);
        let mut execution = TaskExecution::new(TaskConfig::new(TaskKind::CloudCoverage));
        execution
            .process_all(&[(chunk(&[0], window, 1.0), Array3::from_elem((1, 1, 1), CLEAR))])
            .unwrap();
        assert!(execution.finish((1, 1)).is_err());
    }

    #[test]
    fn test_execute_persists_metadata() {
        let mut store = MemoryTaskStore::new();
        let config = TaskConfig::new(TaskKind::CloudCoverage);
        let record = store.insert(config.clone()).unwrap();
        let window = GeoWindow::origin(1, 2);
        let chunks = vec![(chunk(&[0, 1], window, 1.0), Array3::from_elem((2, 1, 2), CLEAR))];

        let outcome = execute(&mut store, record.id, config, &chunks, (1, 2)).unwrap();
        let stored = store.get(record.id).unwrap().unwrap();
        assert!(stored.metadata.is_finalized());
        assert_eq!(stored.metadata, outcome.metadata);
    }
}
