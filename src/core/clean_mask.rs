use crate::types::{is_no_data, CleanMask, MosaicError, MosaicResult, QaStack, RasterStack, NO_DATA_QA};
use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

/// Landsat Collection 1 `pixel_qa` bit flags
pub mod pixel_qa {
    pub const FILL: i32 = 1 << 0;
    pub const CLEAR: i32 = 1 << 1;
    pub const WATER: i32 = 1 << 2;
    pub const CLOUD_SHADOW: i32 = 1 << 3;
    pub const SNOW: i32 = 1 << 4;
    pub const CLOUD: i32 = 1 << 5;
}

/// How QA values in a chunk encode usability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaEncoding {
    /// Non-zero marks a clear observation
    Indicator,
    /// Landsat `pixel_qa` bit field
    LandsatPixelQa,
}

/// Clean mask parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanMaskParams {
    pub encoding: QaEncoding,
    /// Accept water observations as clear (pixel QA only)
    pub include_water: bool,
}

impl Default for CleanMaskParams {
    fn default() -> Self {
        Self {
            encoding: QaEncoding::LandsatPixelQa,
            include_water: true,
        }
    }
}

/// Decides which observations in a chunk are usable for compositing
#[derive(Debug, Clone, Default)]
pub struct CleanMaskEvaluator {
    params: CleanMaskParams,
}

impl CleanMaskEvaluator {
    /// Create an evaluator for Landsat pixel QA
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(params: CleanMaskParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CleanMaskParams {
        &self.params
    }

    /// Whether a single QA value marks a clear observation
    pub fn is_clear(&self, qa: i32) -> bool {
        if qa == NO_DATA_QA {
            return false;
        }

        match self.params.encoding {
            QaEncoding::Indicator => qa != 0,
            QaEncoding::LandsatPixelQa => {
                if qa < 0 || qa & pixel_qa::FILL != 0 {
                    return false;
                }
                let mut accepted = pixel_qa::CLEAR;
                if self.params.include_water {
                    accepted |= pixel_qa::WATER;
                }
                qa & accepted != 0
            }
        }
    }

    /// Evaluate a QA stack into a clean mask of the same shape
    pub fn evaluate(&self, chunk_masks: &QaStack) -> CleanMask {
        log::debug!(
            "Evaluating clean mask for {:?} QA stack ({:?})",
            chunk_masks.dim(),
            self.params.encoding
        );
        chunk_masks.mapv(|qa| self.is_clear(qa))
    }

    /// Evaluate QA values and additionally reject observations carrying
    /// no-data or non-finite band values
    pub fn evaluate_with_data(&self, chunk_masks: &QaStack, stack: &RasterStack) -> MosaicResult<CleanMask> {
        let (n_times, rows, cols, _) = stack.dim();
        if chunk_masks.dim() != (n_times, rows, cols) {
            return Err(MosaicError::ShapeMismatch(format!(
                "QA stack {:?} does not match raster stack {:?}",
                chunk_masks.dim(),
                stack.dim()
            )));
        }

        let mut mask = self.evaluate(chunk_masks);
        Zip::from(&mut mask)
            .and(stack.lanes(Axis(3)))
            .for_each(|clear, bands| {
                if *clear && bands.iter().any(|&v| is_no_data(v) || !v.is_finite()) {
                    *clear = false;
                }
            });

        let clear = mask.iter().filter(|&&c| c).count();
        log::debug!("Clean mask: {}/{} observations clear", clear, mask.len());
        Ok(mask)
    }
}
