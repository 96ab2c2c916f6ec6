//! Pixel compositing strategies
//!
//! Every strategy reduces a time-stacked chunk (time x lat x lon x band) and its
//! clean mask (time x lat x lon) into a single composite (lat x lon x band).
//! Pixels without a usable observation are filled with [`NO_DATA`].
//!
//! Selection strategies remember which acquisition (and which NDVI score) every
//! output pixel came from, so composites built from separate time chunks of the
//! same window can be merged in any order.

use crate::types::{
    band_position, is_no_data, AcquisitionKey, CleanMask, MosaicError, MosaicResult, Raster, RasterChunk,
    NO_DATA,
};
use ndarray::{s, Array2, Array3, ArrayView1, ArrayViewMut1, Axis, Zip};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Named compositing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CompositingMode {
    MostRecent,
    LeastRecent,
    MaxNdvi,
    MinNdvi,
    MedianPixel,
}

/// Reduction from a chunk and its clean mask to a composite
pub type CompositeFn = fn(&RasterChunk, &CleanMask) -> MosaicResult<Composite>;

const REDUCTIONS: [(CompositingMode, CompositeFn); 5] = [
    (CompositingMode::MostRecent, most_recent_mosaic),
    (CompositingMode::LeastRecent, least_recent_mosaic),
    (CompositingMode::MaxNdvi, max_ndvi_mosaic),
    (CompositingMode::MinNdvi, min_ndvi_mosaic),
    (CompositingMode::MedianPixel, median_mosaic),
];

impl CompositingMode {
    pub const ALL: [CompositingMode; 5] = [
        CompositingMode::MostRecent,
        CompositingMode::LeastRecent,
        CompositingMode::MaxNdvi,
        CompositingMode::MinNdvi,
        CompositingMode::MedianPixel,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            CompositingMode::MostRecent => "most_recent",
            CompositingMode::LeastRecent => "least_recent",
            CompositingMode::MaxNdvi => "max_ndvi",
            CompositingMode::MinNdvi => "min_ndvi",
            CompositingMode::MedianPixel => "median_pixel",
        }
    }

    /// Strict lookup by compositor id
    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|mode| mode.id() == id)
    }

    /// Lookup by compositor id, falling back to `most_recent` for unknown ids
    pub fn from_id(id: &str) -> Self {
        Self::parse(id).unwrap_or_else(|| {
            log::warn!("Unknown compositor '{}', falling back to most_recent", id);
            CompositingMode::MostRecent
        })
    }

    /// Whether partial composites over time chunks can be merged
    pub fn is_iterative(&self) -> bool {
        *self != CompositingMode::MedianPixel
    }

    /// Whether the driver should load time slices most recent first
    pub fn reverse_time(&self) -> bool {
        *self == CompositingMode::MostRecent
    }

    /// Reduction function for this mode
    pub fn reduction(&self) -> CompositeFn {
        REDUCTIONS
            .iter()
            .find(|(mode, _)| mode == self)
            .map(|(_, reduce)| *reduce)
            .unwrap_or(most_recent_mosaic)
    }

    /// Composite a chunk with this mode
    pub fn composite(&self, chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Composite> {
        log::info!(
            "Compositing {} acquisitions over {:?} with {}",
            chunk.num_acquisitions(),
            chunk.spatial_shape(),
            self.id()
        );
        (self.reduction())(chunk, clean_mask)
    }

    fn selection(&self, bands: &[String]) -> MosaicResult<Option<Selection>> {
        let ndvi_bands = || -> MosaicResult<(usize, usize)> {
            Ok((band_position(bands, "nir")?, band_position(bands, "red")?))
        };

        Ok(match self {
            CompositingMode::MostRecent => Some(Selection::Latest),
            CompositingMode::LeastRecent => Some(Selection::Earliest),
            CompositingMode::MaxNdvi => {
                let (nir, red) = ndvi_bands()?;
                Some(Selection::MaxNdvi { nir, red })
            }
            CompositingMode::MinNdvi => {
                let (nir, red) = ndvi_bands()?;
                Some(Selection::MinNdvi { nir, red })
            }
            CompositingMode::MedianPixel => None,
        })
    }
}

impl From<String> for CompositingMode {
    fn from(id: String) -> Self {
        CompositingMode::from_id(&id)
    }
}

impl From<CompositingMode> for String {
    fn from(mode: CompositingMode) -> Self {
        mode.id().to_string()
    }
}

impl std::fmt::Display for CompositingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Composited raster with per-pixel provenance
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub mode: CompositingMode,
    /// Band values (latitude x longitude x band)
    pub data: Raster,
    pub bands: Vec<String>,
    /// Acquisition each pixel was taken from (selection modes only)
    pub acquisition: Array2<Option<AcquisitionKey>>,
    /// NDVI of the selected observation (NDVI modes only)
    pub score: Array2<Option<f32>>,
}

impl Composite {
    /// All-no-data composite over a `(rows, cols)` window
    pub fn empty(mode: CompositingMode, shape: (usize, usize), bands: Vec<String>) -> Self {
        let (rows, cols) = shape;
        Self {
            mode,
            data: Array3::from_elem((rows, cols, bands.len()), NO_DATA),
            bands,
            acquisition: Array2::from_elem(shape, None),
            score: Array2::from_elem(shape, None),
        }
    }

    /// (latitude, longitude) extent
    pub fn spatial_shape(&self) -> (usize, usize) {
        self.acquisition.dim()
    }

    /// Number of pixels whose first band holds a value
    pub fn clean_pixel_count(&self) -> usize {
        count_clean_pixels(&self.data)
    }

    /// Merge a composite built from another time chunk of the same window.
    ///
    /// Median composites need the whole time series at once and cannot be merged.
    pub fn merge(&self, other: &Composite) -> MosaicResult<Composite> {
        if self.mode != other.mode {
            return Err(MosaicError::Processing(format!(
                "Cannot merge {} composite with {} composite",
                self.mode, other.mode
            )));
        }
        if self.data.dim() != other.data.dim() || self.bands != other.bands {
            return Err(MosaicError::ShapeMismatch(format!(
                "Cannot merge composites {:?} and {:?}",
                self.data.dim(),
                other.data.dim()
            )));
        }
        let selection = match self.mode.selection(&self.bands)? {
            Some(selection) => selection,
            None => {
                return Err(MosaicError::Processing(format!(
                    "{} compositing is not iterative; load the full time series per window",
                    self.mode
                )))
            }
        };

        let mut merged = self.clone();
        for ((i, j), incoming) in other.acquisition.indexed_iter() {
            let incoming = match incoming {
                Some(acquired) => Candidate {
                    acquired: *acquired,
                    score: other.score[[i, j]],
                },
                None => continue,
            };
            let replace = match merged.acquisition[[i, j]] {
                None => true,
                Some(acquired) => {
                    let current = Candidate {
                        acquired,
                        score: merged.score[[i, j]],
                    };
                    selection.prefers(&incoming, &current)
                }
            };
            if replace {
                merged.data.slice_mut(s![i, j, ..]).assign(&other.data.slice(s![i, j, ..]));
                merged.acquisition[[i, j]] = other.acquisition[[i, j]];
                merged.score[[i, j]] = other.score[[i, j]];
            }
        }

        Ok(merged)
    }
}

/// Count pixels whose first band is not the no-data sentinel
pub fn count_clean_pixels(raster: &Raster) -> usize {
    if raster.len_of(Axis(2)) == 0 {
        return 0;
    }
    raster
        .index_axis(Axis(2), 0)
        .iter()
        .filter(|&&v| !is_no_data(v))
        .count()
}

/// Normalized difference `(a - b) / (a + b)`, `None` for no-data or degenerate input
pub fn normalized_difference(a: f32, b: f32) -> Option<f32> {
    if is_no_data(a) || is_no_data(b) {
        return None;
    }
    let sum = a + b;
    if sum == 0.0 {
        return None;
    }
    let value = (a - b) / sum;
    value.is_finite().then_some(value)
}

/// Median of the values; mean of the middle two for even counts
pub fn median<T: Float>(values: &mut [T]) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / (T::one() + T::one()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    acquired: AcquisitionKey,
    /// NDVI, `None` when it cannot be computed (or the mode is unscored)
    score: Option<f32>,
}

#[derive(Debug, Clone, Copy)]
enum Selection {
    Latest,
    Earliest,
    MaxNdvi { nir: usize, red: usize },
    MinNdvi { nir: usize, red: usize },
}

impl Selection {
    /// Score for one observation.
    ///
    /// `None` rules the observation out (no-data red or nir). `Some(None)` keeps it
    /// with an NDVI that cannot be computed, ranked below every scored observation.
    fn score(&self, bands: ArrayView1<f32>) -> Option<Option<f32>> {
        match *self {
            Selection::Latest | Selection::Earliest => Some(None),
            Selection::MaxNdvi { nir, red } | Selection::MinNdvi { nir, red } => {
                if is_no_data(bands[nir]) || is_no_data(bands[red]) {
                    None
                } else {
                    Some(normalized_difference(bands[nir], bands[red]))
                }
            }
        }
    }

    /// Whether `a` should replace `b`; equal scores go to the later acquisition
    fn prefers(&self, a: &Candidate, b: &Candidate) -> bool {
        let later = a.acquired > b.acquired;
        match self {
            Selection::Latest => later,
            Selection::Earliest => a.acquired < b.acquired,
            Selection::MaxNdvi { .. } | Selection::MinNdvi { .. } => match (a.score, b.score) {
                (Some(x), Some(y)) if x == y => later,
                (Some(x), Some(y)) => match self {
                    Selection::MaxNdvi { .. } => x > y,
                    _ => x < y,
                },
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => later,
            },
        }
    }
}

/// Last clear acquisition in chronological order wins
pub fn most_recent_mosaic(chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Composite> {
    select_observations(chunk, clean_mask, CompositingMode::MostRecent)
}

/// First clear acquisition in chronological order wins
pub fn least_recent_mosaic(chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Composite> {
    select_observations(chunk, clean_mask, CompositingMode::LeastRecent)
}

/// Clear observation with the highest NDVI wins.
///
/// Observations whose NDVI is undefined (`nir + red == 0`) only win when no clear
/// observation of the pixel has a defined NDVI; the latest of them is taken.
pub fn max_ndvi_mosaic(chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Composite> {
    select_observations(chunk, clean_mask, CompositingMode::MaxNdvi)
}

/// Clear observation with the lowest NDVI wins; undefined NDVI ranks last as in [`max_ndvi_mosaic`]
pub fn min_ndvi_mosaic(chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Composite> {
    select_observations(chunk, clean_mask, CompositingMode::MinNdvi)
}

/// Per-pixel, per-band median over clear observations
pub fn median_mosaic(chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Composite> {
    chunk.check_mask(clean_mask)?;

    let mut composite = Composite::empty(CompositingMode::MedianPixel, chunk.spatial_shape(), chunk.bands.clone());
    let n_times = chunk.num_acquisitions();

    let reduce = |(i, j): (usize, usize), mut out: ArrayViewMut1<f32>| {
        let mut values = Vec::with_capacity(n_times);
        for (band, value) in out.iter_mut().enumerate() {
            values.clear();
            values.extend(
                (0..n_times)
                    .filter(|&t| clean_mask[[t, i, j]])
                    .map(|t| chunk.data[[t, i, j, band]])
                    .filter(|&v| !is_no_data(v) && v.is_finite()),
            );
            *value = median(&mut values).unwrap_or(NO_DATA);
        }
    };

    let zip = Zip::indexed(composite.data.lanes_mut(Axis(2)));

    #[cfg(feature = "parallel")]
    zip.par_for_each(reduce);

    #[cfg(not(feature = "parallel"))]
    zip.for_each(reduce);

    log::debug!(
        "Median composite: {} clean pixels",
        composite.clean_pixel_count()
    );
    Ok(composite)
}

fn select_observations(
    chunk: &RasterChunk,
    clean_mask: &CleanMask,
    mode: CompositingMode,
) -> MosaicResult<Composite> {
    chunk.check_mask(clean_mask)?;
    let selection = mode
        .selection(&chunk.bands)?
        .ok_or_else(|| MosaicError::Processing(format!("{} is not a selection strategy", mode)))?;

    let mut composite = Composite::empty(mode, chunk.spatial_shape(), chunk.bands.clone());

    let select = |(i, j): (usize, usize),
                  acquisition: &mut Option<AcquisitionKey>,
                  score: &mut Option<f32>,
                  mut out: ArrayViewMut1<f32>| {
        let mut best: Option<(usize, Candidate)> = None;
        for (t, acquired) in chunk.times.iter().enumerate() {
            if !clean_mask[[t, i, j]] {
                continue;
            }
            let bands = chunk.data.slice(s![t, i, j, ..]);
            let candidate = match selection.score(bands) {
                Some(score) => Candidate { acquired: *acquired, score },
                None => continue,
            };
            let replace = match &best {
                None => true,
                Some((_, current)) => selection.prefers(&candidate, current),
            };
            if replace {
                best = Some((t, candidate));
            }
        }

        if let Some((t, candidate)) = best {
            out.assign(&chunk.data.slice(s![t, i, j, ..]));
            *acquisition = Some(candidate.acquired);
            *score = candidate.score;
        }
    };

    let zip = Zip::indexed(&mut composite.acquisition)
        .and(&mut composite.score)
        .and(composite.data.lanes_mut(Axis(2)));

    #[cfg(feature = "parallel")]
    zip.par_for_each(select);

    #[cfg(not(feature = "parallel"))]
    zip.for_each(select);

    log::debug!(
        "{} composite: {} clean pixels",
        mode,
        composite.clean_pixel_count()
    );
    Ok(composite)
}
