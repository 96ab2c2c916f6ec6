//! dcmosaic: clear-pixel accounting and mosaic compositing for data-cube tools
//!
//! This library implements the numeric core behind the cloud coverage and spectral
//! anomaly tools: clean-mask evaluation, incremental clear-pixel accounting across
//! chunks, pixel compositing strategies, and the per-acquisition metadata summary
//! stored with each task.

pub mod types;
pub mod core;
pub mod task;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    AcquisitionKey, BoundingBox, CleanMask, GeoWindow, MosaicError, MosaicResult, QaStack, Raster, RasterChunk,
    RasterStack, TimeOrder, TimeRange, NO_DATA, NO_DATA_QA,
};

pub use crate::core::{
    AnomalyDetector, CleanMaskEvaluator, ClearPixelAccumulator, ClearPixelState, Composite, CompositingMode,
    FinalSummary, RunningMetadata, SpectralIndex,
};
pub use task::{resolve, MemoryTaskStore, TaskConfig, TaskKind, TaskRecord, TaskStore};
pub use pipeline::{detect_anomalies, execute, TaskExecution, TaskOutcome};

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::{IntoPyArray, PyArray2, PyArray3, PyReadonlyArray2, PyReadonlyArray3, PyReadonlyArray4};
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    fn to_py_err(err: MosaicError) -> PyErr {
        match err {
            MosaicError::ShapeMismatch(_) | MosaicError::MissingBand(_) | MosaicError::InvalidConfig(_) => {
                PyErr::new::<PyValueError, _>(format!("{}", err))
            }
            _ => PyErr::new::<PyRuntimeError, _>(format!("{}", err)),
        }
    }

    /// Composite a (time, lat, lon, band) stack with the named compositor
    #[pyfunction]
    #[pyo3(signature = (data, clean_mask, times_ms, bands, compositor = "most_recent"))]
    fn create_mosaic<'py>(
        py: Python<'py>,
        data: PyReadonlyArray4<f32>,
        clean_mask: PyReadonlyArray3<bool>,
        times_ms: Vec<i64>,
        bands: Vec<String>,
        compositor: &str,
    ) -> PyResult<&'py PyArray3<f32>> {
        let times = times_ms
            .into_iter()
            .map(AcquisitionKey::from_millis)
            .collect::<MosaicResult<Vec<_>>>()
            .map_err(to_py_err)?;
        let chunk = RasterChunk::new(times, data.as_array().to_owned(), bands).map_err(to_py_err)?;
        let mask = clean_mask.as_array().to_owned();

        let composite = CompositingMode::from_id(compositor)
            .composite(&chunk, &mask)
            .map_err(to_py_err)?;
        Ok(composite.data.into_pyarray(py))
    }

    /// Fold a clean mask into running (total_pixels, total_clear, clear_percentage)
    #[pyfunction]
    #[pyo3(signature = (clean_mask, total_pixels = None, total_clear = None))]
    fn clear_percentage<'py>(
        py: Python<'py>,
        clean_mask: PyReadonlyArray3<bool>,
        total_pixels: Option<PyReadonlyArray2<u32>>,
        total_clear: Option<PyReadonlyArray2<u32>>,
    ) -> PyResult<(&'py PyArray2<u32>, &'py PyArray2<u32>, &'py PyArray2<f64>)> {
        let prior = match (total_pixels, total_clear) {
            (Some(pixels), Some(clear)) => {
                let mut state = ClearPixelState::empty(pixels.as_array().dim());
                state.total_pixels.assign(&pixels.as_array());
                if clear.as_array().dim() != state.dim() {
                    return Err(PyValueError::new_err("total_pixels and total_clear shapes differ"));
                }
                state.total_clear.assign(&clear.as_array());
                Some(state)
            }
            (None, None) => None,
            _ => return Err(PyValueError::new_err("total_pixels and total_clear must be given together")),
        };

        let state = ClearPixelAccumulator::update_from_mask(&clean_mask.as_array().to_owned(), prior)
            .map_err(to_py_err)?;
        Ok((
            state.total_pixels.into_pyarray(py),
            state.total_clear.into_pyarray(py),
            state.clear_percentage.into_pyarray(py),
        ))
    }

    /// Python module definition
    #[pymodule]
    fn _dcmosaic(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(create_mosaic, m)?)?;
        m.add_function(wrap_pyfunction!(clear_percentage, m)?)?;
        m.add("NO_DATA", NO_DATA)?;
        Ok(())
    }
}
