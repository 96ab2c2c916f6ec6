//! Spectral anomaly detection between a baseline and an analysis composite

use crate::core::compositing::{normalized_difference, Composite};
use crate::types::{band_position, is_no_data, MosaicError, MosaicResult, PixelMask, NO_DATA};
use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Band-ratio index used to compare composites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectralIndex {
    /// Normalized difference vegetation index (nir, red)
    Ndvi,
    /// Normalized difference water index (green, nir)
    Ndwi,
    /// Normalized difference built-up index (swir1, nir)
    Ndbi,
}

impl SpectralIndex {
    /// (positive, negative) band names of the normalized difference
    pub fn bands(&self) -> (&'static str, &'static str) {
        match self {
            SpectralIndex::Ndvi => ("nir", "red"),
            SpectralIndex::Ndwi => ("green", "nir"),
            SpectralIndex::Ndbi => ("swir1", "nir"),
        }
    }

    /// Index per pixel of a composite, NO_DATA where it cannot be computed
    pub fn compute(&self, composite: &Composite) -> MosaicResult<Array2<f32>> {
        let (a_name, b_name) = self.bands();
        let a = band_position(&composite.bands, a_name)?;
        let b = band_position(&composite.bands, b_name)?;

        Ok(composite
            .data
            .map_axis(Axis(2), |px| normalized_difference(px[a], px[b]).unwrap_or(NO_DATA)))
    }
}

impl Default for SpectralIndex {
    fn default() -> Self {
        SpectralIndex::Ndvi
    }
}

/// Value ranges an anomaly must fall in
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    /// Index range accepted on both composites
    pub composite_min: f32,
    pub composite_max: f32,
    /// Optional bounds on `analysis - baseline`
    pub change_min: Option<f32>,
    pub change_max: Option<f32>,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            composite_min: -1.0,
            composite_max: 1.0,
            change_min: None,
            change_max: None,
        }
    }
}

impl AnomalyThresholds {
    fn accepts_composite(&self, value: f32) -> bool {
        !is_no_data(value) && value >= self.composite_min && value <= self.composite_max
    }

    fn accepts_change(&self, change: f32) -> bool {
        self.change_min.map_or(true, |min| change >= min) && self.change_max.map_or(true, |max| change <= max)
    }
}

/// Per-pixel change between two composites
#[derive(Debug, Clone)]
pub struct AnomalyProduct {
    pub index: SpectralIndex,
    pub baseline_index: Array2<f32>,
    pub analysis_index: Array2<f32>,
    /// `analysis - baseline`, NO_DATA outside the accepted ranges
    pub change: Array2<f32>,
    pub valid_mask: PixelMask,
    pub valid_pixels: usize,
}

/// Compares baseline and analysis composites
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    index: SpectralIndex,
    thresholds: AnomalyThresholds,
}

impl AnomalyDetector {
    pub fn new(index: SpectralIndex, thresholds: AnomalyThresholds) -> Self {
        Self { index, thresholds }
    }

    pub fn detect(&self, baseline: &Composite, analysis: &Composite) -> MosaicResult<AnomalyProduct> {
        if baseline.spatial_shape() != analysis.spatial_shape() {
            return Err(MosaicError::ShapeMismatch(format!(
                "Baseline composite {:?} does not match analysis composite {:?}",
                baseline.spatial_shape(),
                analysis.spatial_shape()
            )));
        }
        if self.thresholds.composite_min > self.thresholds.composite_max {
            return Err(MosaicError::InvalidConfig(format!(
                "Composite threshold min {} exceeds max {}",
                self.thresholds.composite_min, self.thresholds.composite_max
            )));
        }

        log::info!("Detecting {:?} anomalies over {:?}", self.index, baseline.spatial_shape());
        log::debug!("Anomaly thresholds: {:?}", self.thresholds);

        let baseline_index = self.index.compute(baseline)?;
        let analysis_index = self.index.compute(analysis)?;

        let shape = baseline_index.dim();
        let mut change = Array2::from_elem(shape, NO_DATA);
        let mut valid_mask = PixelMask::from_elem(shape, false);
        let thresholds = self.thresholds;

        Zip::from(&mut change)
            .and(&mut valid_mask)
            .and(&baseline_index)
            .and(&analysis_index)
            .for_each(|change, valid, &base, &current| {
                if !thresholds.accepts_composite(base) || !thresholds.accepts_composite(current) {
                    return;
                }
                let delta = current - base;
                if thresholds.accepts_change(delta) {
                    *change = delta;
                    *valid = true;
                }
            });

        let valid_pixels = valid_mask.iter().filter(|&&v| v).count();
        log::info!("Anomaly detection: {}/{} valid pixels", valid_pixels, valid_mask.len());

        Ok(AnomalyProduct {
            index: self.index,
            baseline_index,
            analysis_index,
            change,
            valid_mask,
            valid_pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compositing::CompositingMode;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    /// 1 x n composite of (red, nir) pairs
    fn composite(pairs: &[(f32, f32)]) -> Composite {
        let mut c = Composite::empty(
            CompositingMode::MostRecent,
            (1, pairs.len()),
            vec!["red".to_string(), "nir".to_string()],
        );
        let flat: Vec<f32> = pairs.iter().flat_map(|&(r, n)| [r, n]).collect();
        c.data = Array3::from_shape_vec((1, pairs.len(), 2), flat).unwrap();
        c
    }

    #[test]
    fn test_ndvi_change() {
        let baseline = composite(&[(0.1, 0.3), (0.2, 0.2)]);
        let analysis = composite(&[(0.1, 0.9), (0.2, 0.2)]);

        let product = AnomalyDetector::default().detect(&baseline, &analysis).unwrap();
        assert_eq!(product.valid_pixels, 2);
        assert_relative_eq!(product.change[[0, 0]], 0.8 - 0.5, epsilon = 1e-6);
        assert_relative_eq!(product.change[[0, 1]], 0.0);
    }

    #[test]
    fn test_no_data_and_thresholds_mask_pixels() {
        let baseline = composite(&[(NO_DATA, NO_DATA), (0.1, 0.3), (0.1, 0.3)]);
        let analysis = composite(&[(0.1, 0.9), (0.1, 0.9), (0.1, 0.35)]);
        let thresholds = AnomalyThresholds {
            change_min: Some(0.1),
            ..AnomalyThresholds::default()
        };

        let product = AnomalyDetector::new(SpectralIndex::Ndvi, thresholds)
            .detect(&baseline, &analysis)
            .unwrap();
        assert_eq!(product.valid_mask.iter().copied().collect::<Vec<_>>(), vec![false, true, false]);
        assert_eq!(product.change[[0, 0]], NO_DATA);
        assert_eq!(product.change[[0, 2]], NO_DATA);
    }

    #[test]
    fn test_missing_band() {
        let baseline = composite(&[(0.1, 0.3)]);
        let detector = AnomalyDetector::new(SpectralIndex::Ndwi, AnomalyThresholds::default());
        assert!(matches!(detector.detect(&baseline, &baseline), Err(MosaicError::MissingBand(_))));
    }

    #[test]
    fn test_inverted_composite_thresholds_are_rejected() {
        let c = composite(&[(0.1, 0.3)]);
        let thresholds = AnomalyThresholds {
            composite_min: 0.5,
            composite_max: -0.5,
            ..AnomalyThresholds::default()
        };
        assert!(AnomalyDetector::new(SpectralIndex::Ndvi, thresholds).detect(&c, &c).is_err());
    }
}
