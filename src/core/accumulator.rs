use crate::types::{CleanMask, MosaicError, MosaicResult, RasterChunk};
use ndarray::{Array2, Axis, Zip};

/// Per-pixel clear observation totals for one geographic window
#[derive(Debug, Clone, PartialEq)]
pub struct ClearPixelState {
    /// Observations seen per pixel
    pub total_pixels: Array2<u32>,
    /// Clear observations seen per pixel
    pub total_clear: Array2<u32>,
    /// `total_clear / total_pixels`, 0 where no observations were seen
    pub clear_percentage: Array2<f64>,
}

impl ClearPixelState {
    /// State with no observations over a `(rows, cols)` window
    pub fn empty(shape: (usize, usize)) -> Self {
        Self {
            total_pixels: Array2::zeros(shape),
            total_clear: Array2::zeros(shape),
            clear_percentage: Array2::zeros(shape),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.total_pixels.dim()
    }

    /// Sum two states over the same window
    pub fn merge(&self, other: &ClearPixelState) -> MosaicResult<ClearPixelState> {
        if self.dim() != other.dim() {
            return Err(MosaicError::ShapeMismatch(format!(
                "Cannot merge clear-pixel states {:?} and {:?}",
                self.dim(),
                other.dim()
            )));
        }

        let mut merged = ClearPixelState {
            total_pixels: &self.total_pixels + &other.total_pixels,
            total_clear: &self.total_clear + &other.total_clear,
            clear_percentage: Array2::zeros(self.dim()),
        };
        merged.recompute_percentage();
        Ok(merged)
    }

    fn recompute_percentage(&mut self) {
        let zip = Zip::from(&mut self.clear_percentage)
            .and(&self.total_clear)
            .and(&self.total_pixels);

        #[cfg(feature = "parallel")]
        zip.par_for_each(|pct, &clear, &total| *pct = clear_fraction(clear, total));

        #[cfg(not(feature = "parallel"))]
        zip.for_each(|pct, &clear, &total| *pct = clear_fraction(clear, total));
    }
}

#[inline]
fn clear_fraction(clear: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        clear as f64 / total as f64
    }
}

/// Incremental clear-pixel accounting across chunks
pub struct ClearPixelAccumulator;

impl ClearPixelAccumulator {
    /// Fold one chunk into the running per-pixel totals.
    ///
    /// Without `prior_state` the totals start from this chunk. Chunks folded into the
    /// same state must cover the same geographic window.
    pub fn update(
        dataset: &RasterChunk,
        clean_mask: &CleanMask,
        prior_state: Option<ClearPixelState>,
    ) -> MosaicResult<ClearPixelState> {
        dataset.check_mask(clean_mask)?;
        Self::update_from_mask(clean_mask, prior_state)
    }

    /// Same as [`update`](Self::update), taking the acquisition count from the mask's time axis
    pub fn update_from_mask(
        clean_mask: &CleanMask,
        prior_state: Option<ClearPixelState>,
    ) -> MosaicResult<ClearPixelState> {
        let (num_acquisitions, rows, cols) = clean_mask.dim();
        let num_acquisitions = u32::try_from(num_acquisitions)
            .map_err(|_| MosaicError::Processing(format!("Too many acquisitions in chunk: {}", num_acquisitions)))?;

        let mut num_clear = Array2::<u32>::zeros((rows, cols));
        for slice in clean_mask.axis_iter(Axis(0)) {
            Zip::from(&mut num_clear).and(&slice).for_each(|count, &clear| {
                if clear {
                    *count += 1;
                }
            });
        }

        let mut state = match prior_state {
            None => ClearPixelState {
                total_pixels: Array2::from_elem((rows, cols), num_acquisitions),
                total_clear: num_clear,
                clear_percentage: Array2::zeros((rows, cols)),
            },
            Some(mut state) => {
                if state.dim() != (rows, cols) {
                    return Err(MosaicError::ShapeMismatch(format!(
                        "Prior clear-pixel state {:?} does not match chunk {:?}",
                        state.dim(),
                        (rows, cols)
                    )));
                }
                state.total_pixels += num_acquisitions;
                state.total_clear += &num_clear;
                state
            }
        };

        state.recompute_percentage();
        log::debug!(
            "Clear-pixel state updated with {} acquisitions over {}x{} pixels",
            num_acquisitions,
            rows,
            cols
        );
        Ok(state)
    }
}
