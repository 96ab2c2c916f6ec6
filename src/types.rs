use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use ndarray::{Array2, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

/// Sentinel marking an invalid or unavailable band value
pub const NO_DATA: f32 = -9999.0;

/// Sentinel marking an invalid or unavailable QA value
pub const NO_DATA_QA: i32 = -9999;

/// Composited raster (latitude x longitude x band)
pub type Raster = Array3<f32>;

/// Time-stacked raster (time x latitude x longitude x band)
pub type RasterStack = Array4<f32>;

/// Per-pixel QA / cloud indicator stack (time x latitude x longitude)
pub type QaStack = Array3<i32>;

/// Per-pixel usability mask (time x latitude x longitude), `true` = clear
pub type CleanMask = Array3<bool>;

/// Per-pixel boolean map over a single time slice (latitude x longitude)
pub type PixelMask = Array2<bool>;

/// Returns true for the no-data sentinel
#[inline]
pub fn is_no_data(value: f32) -> bool {
    value == NO_DATA
}

/// Timestamp identifying one acquisition (scene / time slice), millisecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AcquisitionKey(DateTime<Utc>);

impl AcquisitionKey {
    /// Build a key from milliseconds since the Unix epoch
    pub fn from_millis(millis: i64) -> MosaicResult<Self> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or_else(|| MosaicError::InvalidConfig(format!("Timestamp out of range: {} ms", millis)))
    }

    /// Build a key from a timestamp, dropping sub-millisecond precision
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let sub_millis = (time.timestamp_subsec_nanos() % 1_000_000) as i64;
        Self(time - Duration::nanoseconds(sub_millis))
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Calendar date as `MM/DD/YYYY`
    pub fn format_date(&self) -> String {
        self.0.format("%m/%d/%Y").to_string()
    }
}

impl std::fmt::Display for AcquisitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

/// Order in which time slices are presented to the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeOrder {
    /// Least recent (earliest) first
    Ascending,
    /// Most recent (latest) first
    Descending,
}

impl TimeOrder {
    pub fn from_reverse(reverse_time: bool) -> Self {
        if reverse_time {
            TimeOrder::Descending
        } else {
            TimeOrder::Ascending
        }
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

/// Inclusive calendar date range; a missing bound is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl TimeRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Range accepting every acquisition
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &AcquisitionKey) -> bool {
        let date = key.datetime().date_naive();
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.start {
            Some(start) => write!(f, "{}", start)?,
            None => f.write_str("..")?,
        }
        f.write_str(" to ")?;
        match self.end {
            Some(end) => write!(f, "{}", end),
            None => f.write_str(".."),
        }
    }
}

/// Placement of a chunk inside the full output grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GeoWindow {
    pub row_offset: usize,
    pub col_offset: usize,
    pub rows: usize,
    pub cols: usize,
}

impl GeoWindow {
    pub fn new(row_offset: usize, col_offset: usize, rows: usize, cols: usize) -> Self {
        Self { row_offset, col_offset, rows, cols }
    }

    /// Window anchored at the grid origin
    pub fn origin(rows: usize, cols: usize) -> Self {
        Self::new(0, 0, rows, cols)
    }

    pub fn row_end(&self) -> usize {
        self.row_offset + self.rows
    }

    pub fn col_end(&self) -> usize {
        self.col_offset + self.cols
    }

    pub fn fits_within(&self, rows: usize, cols: usize) -> bool {
        self.row_end() <= rows && self.col_end() <= cols
    }
}

/// One loaded chunk of the requested raster
#[derive(Debug, Clone)]
pub struct RasterChunk {
    /// Acquisition per time slice, parallel to axis 0 of `data`
    pub times: Vec<AcquisitionKey>,
    /// Band values (time x latitude x longitude x band)
    pub data: RasterStack,
    /// Band names, parallel to axis 3 of `data`
    pub bands: Vec<String>,
    /// Placement in the output grid
    pub window: GeoWindow,
}

impl RasterChunk {
    /// Create a chunk anchored at the grid origin
    pub fn new(times: Vec<AcquisitionKey>, data: RasterStack, bands: Vec<String>) -> MosaicResult<Self> {
        let (_, rows, cols, _) = data.dim();
        Self::with_window(times, data, bands, GeoWindow::origin(rows, cols))
    }

    /// Create a chunk placed at `window` in the output grid
    pub fn with_window(
        times: Vec<AcquisitionKey>,
        data: RasterStack,
        bands: Vec<String>,
        window: GeoWindow,
    ) -> MosaicResult<Self> {
        let (n_times, rows, cols, n_bands) = data.dim();
        if times.len() != n_times {
            return Err(MosaicError::ShapeMismatch(format!(
                "{} acquisition keys for {} time slices",
                times.len(),
                n_times
            )));
        }
        if bands.len() != n_bands {
            return Err(MosaicError::ShapeMismatch(format!(
                "{} band names for {} bands",
                bands.len(),
                n_bands
            )));
        }
        if window.rows != rows || window.cols != cols {
            return Err(MosaicError::ShapeMismatch(format!(
                "Window {}x{} does not match chunk extent {}x{}",
                window.rows, window.cols, rows, cols
            )));
        }

        Ok(Self { times, data, bands, window })
    }

    pub fn num_acquisitions(&self) -> usize {
        self.times.len()
    }

    /// (latitude, longitude) extent
    pub fn spatial_shape(&self) -> (usize, usize) {
        let (_, rows, cols, _) = self.data.dim();
        (rows, cols)
    }

    pub fn band_index(&self, name: &str) -> MosaicResult<usize> {
        band_position(&self.bands, name)
    }

    /// Verify a clean mask covers exactly this chunk's time x lat x lon extent
    pub fn check_mask(&self, clean_mask: &CleanMask) -> MosaicResult<()> {
        let (n_times, rows, cols, _) = self.data.dim();
        if clean_mask.dim() != (n_times, rows, cols) {
            return Err(MosaicError::ShapeMismatch(format!(
                "Clean mask {:?} does not match chunk {:?}",
                clean_mask.dim(),
                (n_times, rows, cols)
            )));
        }
        Ok(())
    }

    /// Reorder time slices (and their masks) into `order`
    pub fn ordered(&self, clean_mask: &CleanMask, order: TimeOrder) -> (RasterChunk, CleanMask) {
        let mut indices: Vec<usize> = (0..self.times.len()).collect();
        indices.sort_by_key(|&i| self.times[i]);
        if order == TimeOrder::Descending {
            indices.reverse();
        }

        let chunk = RasterChunk {
            times: indices.iter().map(|&i| self.times[i]).collect(),
            data: self.data.select(Axis(0), &indices),
            bands: self.bands.clone(),
            window: self.window,
        };
        (chunk, clean_mask.select(Axis(0), &indices))
    }
}

pub(crate) fn band_position(bands: &[String], name: &str) -> MosaicResult<usize> {
    bands
        .iter()
        .position(|b| b.eq_ignore_ascii_case(name))
        .ok_or_else(|| MosaicError::MissingBand(name.to_string()))
}

/// Error types for clear-pixel accounting and compositing
#[derive(Debug, thiserror::Error)]
pub enum MosaicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Missing band: {0}")]
    MissingBand(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for compositing operations
pub type MosaicResult<T> = Result<T, MosaicError>;
