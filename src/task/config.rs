//! Task parameters for the cloud coverage and spectral anomaly tools
//!
//! A [`TaskConfig`] is built from a flat parameter map (the shape the web form
//! posts). Unknown keys and values that fail to parse are dropped, leaving the
//! per-tool default in place; validation belongs to the form layer.

use crate::core::anomaly::{AnomalyThresholds, SpectralIndex};
use crate::core::compositing::{CompositeFn, CompositingMode};
use crate::types::{BoundingBox, MosaicError, MosaicResult, TimeOrder, TimeRange};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Which analysis tool a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CloudCoverage,
    SpectralAnomaly,
}

impl TaskKind {
    pub fn default_title(&self) -> &'static str {
        match self {
            TaskKind::CloudCoverage => "Cloud Coverage Query",
            TaskKind::SpectralAnomaly => "Spectral Anomaly Query",
        }
    }

    pub fn default_chunking(&self) -> ChunkingPolicy {
        match self {
            TaskKind::CloudCoverage => ChunkingPolicy { time: None, geographic: 0.10 },
            // No time chunking: baseline and analysis windows are loaded whole
            TaskKind::SpectralAnomaly => ChunkingPolicy { time: None, geographic: 0.005 },
        }
    }

    /// Parameter names accepted for this kind of task
    pub fn known_fields(&self) -> Vec<&'static str> {
        let mut fields = COMMON_FIELDS.to_vec();
        if *self == TaskKind::SpectralAnomaly {
            fields.extend_from_slice(&ANOMALY_FIELDS);
        }
        fields
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::CloudCoverage => write!(f, "cloud_coverage"),
            TaskKind::SpectralAnomaly => write!(f, "spectral_anomaly"),
        }
    }
}

const COMMON_FIELDS: [&str; 14] = [
    "satellite",
    "area_id",
    "time_start",
    "time_end",
    "latitude_min",
    "latitude_max",
    "longitude_min",
    "longitude_max",
    "title",
    "description",
    "pixel_drill_task",
    "time_chunk_size",
    "geographic_chunk_degrees",
    "iterate_in_reverse",
];

const ANOMALY_FIELDS: [&str; 10] = [
    "compositor",
    "query_type",
    "baseline_time_start",
    "baseline_time_end",
    "analysis_time_start",
    "analysis_time_end",
    "composite_threshold_min",
    "composite_threshold_max",
    "change_threshold_min",
    "change_threshold_max",
];

/// Source platform of the data cube product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Satellite {
    #[serde(rename = "LANDSAT_5")]
    Landsat5,
    #[serde(rename = "LANDSAT_7")]
    Landsat7,
    #[serde(rename = "LANDSAT_8")]
    Landsat8,
    #[serde(rename = "SENTINEL_2")]
    Sentinel2,
}

impl std::fmt::Display for Satellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Satellite::Landsat5 => write!(f, "LANDSAT_5"),
            Satellite::Landsat7 => write!(f, "LANDSAT_7"),
            Satellite::Landsat8 => write!(f, "LANDSAT_8"),
            Satellite::Sentinel2 => write!(f, "SENTINEL_2"),
        }
    }
}

/// How the driver splits the request into chunks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    /// Time slices per chunk, `None` for unbounded
    pub time: Option<usize>,
    /// Chunk edge length in degrees
    pub geographic: f64,
}

/// Spectral anomaly parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyParams {
    pub query_type: SpectralIndex,
    pub baseline: TimeRange,
    pub analysis: TimeRange,
    pub composite_threshold_min: f64,
    pub composite_threshold_max: f64,
    pub change_threshold_min: Option<f64>,
    pub change_threshold_max: Option<f64>,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            query_type: SpectralIndex::default(),
            baseline: TimeRange::unbounded(),
            analysis: TimeRange::unbounded(),
            composite_threshold_min: -1.0,
            composite_threshold_max: 1.0,
            change_threshold_min: None,
            change_threshold_max: None,
        }
    }
}

impl AnomalyParams {
    pub fn thresholds(&self) -> AnomalyThresholds {
        AnomalyThresholds {
            composite_min: self.composite_threshold_min as f32,
            composite_max: self.composite_threshold_max as f32,
            change_min: self.change_threshold_min.map(|v| v as f32),
            change_max: self.change_threshold_max.map(|v| v as f32),
        }
    }
}

/// Compositing routine selected for a task
#[derive(Debug, Clone, Copy)]
pub struct ProcessingMethod {
    pub mode: CompositingMode,
    pub composite: CompositeFn,
    /// Track per-pixel clear percentages alongside the mosaic
    pub clear_percentage: bool,
}

/// Immutable parameters of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub kind: TaskKind,
    pub satellite: Satellite,
    pub area_id: String,
    pub bounds: BoundingBox,
    pub time_range: TimeRange,
    pub compositor: CompositingMode,
    pub title: String,
    pub description: String,
    pub pixel_drill_task: bool,
    pub chunking: ChunkingPolicy,
    pub iterate_in_reverse: bool,
    pub anomaly: Option<AnomalyParams>,
}

impl TaskConfig {
    /// Defaults for a new task of `kind`
    pub fn new(kind: TaskKind) -> Self {
        let compositor = CompositingMode::MostRecent;
        Self {
            kind,
            satellite: Satellite::Landsat8,
            area_id: String::new(),
            bounds: BoundingBox::default(),
            time_range: TimeRange::unbounded(),
            compositor,
            title: kind.default_title().to_string(),
            description: "None".to_string(),
            pixel_drill_task: false,
            chunking: kind.default_chunking(),
            iterate_in_reverse: default_reverse_time(kind, compositor),
            anomaly: match kind {
                TaskKind::CloudCoverage => None,
                TaskKind::SpectralAnomaly => Some(AnomalyParams::default()),
            },
        }
    }

    /// Build a config from a flat parameter map, dropping unknown or malformed entries
    pub fn from_params(kind: TaskKind, params: &Map<String, Value>) -> Self {
        let mut config = Self::new(kind);
        let mut reverse_override = None;

        for (key, value) in params {
            match key.as_str() {
                "satellite" => assign(key, value, &mut config.satellite),
                "area_id" => assign(key, value, &mut config.area_id),
                "time_start" => assign(key, value, &mut config.time_range.start),
                "time_end" => assign(key, value, &mut config.time_range.end),
                "latitude_min" => assign(key, value, &mut config.bounds.min_lat),
                "latitude_max" => assign(key, value, &mut config.bounds.max_lat),
                "longitude_min" => assign(key, value, &mut config.bounds.min_lon),
                "longitude_max" => assign(key, value, &mut config.bounds.max_lon),
                "title" => assign(key, value, &mut config.title),
                "description" => assign(key, value, &mut config.description),
                "pixel_drill_task" => assign(key, value, &mut config.pixel_drill_task),
                "time_chunk_size" => assign(key, value, &mut config.chunking.time),
                "geographic_chunk_degrees" => assign(key, value, &mut config.chunking.geographic),
                "iterate_in_reverse" => {
                    let mut reverse = config.iterate_in_reverse;
                    let parsed = assign(key, value, &mut reverse);
                    if parsed {
                        reverse_override = Some(reverse);
                    }
                    parsed
                }
                _ => match config.anomaly.as_mut() {
                    Some(anomaly) if ANOMALY_FIELDS.contains(&key.as_str()) => match key.as_str() {
                        "compositor" => assign(key, value, &mut config.compositor),
                        "query_type" => assign(key, value, &mut anomaly.query_type),
                        "baseline_time_start" => assign(key, value, &mut anomaly.baseline.start),
                        "baseline_time_end" => assign(key, value, &mut anomaly.baseline.end),
                        "analysis_time_start" => assign(key, value, &mut anomaly.analysis.start),
                        "analysis_time_end" => assign(key, value, &mut anomaly.analysis.end),
                        "composite_threshold_min" => assign(key, value, &mut anomaly.composite_threshold_min),
                        "composite_threshold_max" => assign(key, value, &mut anomaly.composite_threshold_max),
                        "change_threshold_min" => assign(key, value, &mut anomaly.change_threshold_min),
                        _ => assign(key, value, &mut anomaly.change_threshold_max),
                    },
                    _ => {
                        log::debug!("Dropping unknown {} parameter '{}'", kind, key);
                        false
                    }
                },
            };
        }

        if config.title.trim().is_empty() {
            config.title = kind.default_title().to_string();
        }
        if config.description.trim().is_empty() {
            config.description = "None".to_string();
        }

        let derived = default_reverse_time(kind, config.compositor);
        config.iterate_in_reverse = reverse_override.unwrap_or(derived);
        if config.iterate_in_reverse != derived {
            log::warn!(
                "Iteration order (reverse={}) differs from the {} default; composites still select chronologically",
                config.iterate_in_reverse,
                config.compositor
            );
        }

        config
    }

    /// Parse a JSON object of parameters
    pub fn from_json_str(kind: TaskKind, json: &str) -> MosaicResult<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(params) => Ok(Self::from_params(kind, &params)),
            other => Err(MosaicError::InvalidConfig(format!(
                "Task parameters must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Load a JSON object of parameters from disk
    pub fn from_json_file<P: AsRef<Path>>(kind: TaskKind, path: P) -> MosaicResult<Self> {
        let path = path.as_ref();
        log::info!("Loading {} task parameters from {}", kind, path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(kind, &json)
    }

    pub fn chunk_size(&self) -> ChunkingPolicy {
        self.chunking
    }

    /// Whether partial composites can be carried across time chunks
    pub fn is_iterative(&self) -> bool {
        match self.kind {
            TaskKind::CloudCoverage => true,
            TaskKind::SpectralAnomaly => self.compositor.is_iterative(),
        }
    }

    pub fn reverse_time(&self) -> bool {
        self.iterate_in_reverse
    }

    pub fn time_order(&self) -> TimeOrder {
        TimeOrder::from_reverse(self.iterate_in_reverse)
    }

    pub fn processing_method(&self) -> ProcessingMethod {
        ProcessingMethod {
            mode: self.compositor,
            composite: self.compositor.reduction(),
            clear_percentage: self.kind == TaskKind::CloudCoverage,
        }
    }
}

fn default_reverse_time(kind: TaskKind, compositor: CompositingMode) -> bool {
    match kind {
        TaskKind::CloudCoverage => true,
        TaskKind::SpectralAnomaly => compositor.reverse_time(),
    }
}

/// Overwrite `slot` when `value` parses; returns whether it did
fn assign<T: DeserializeOwned>(key: &str, value: &Value, slot: &mut T) -> bool {
    match T::deserialize(value) {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(e) => {
            log::debug!("Dropping malformed parameter '{}': {}", key, e);
            false
        }
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(date: &str) -> MosaicResult<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| MosaicError::InvalidConfig(format!("Invalid date '{}': {}", date, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_cloud_coverage_defaults() {
        let config = TaskConfig::from_params(TaskKind::CloudCoverage, &Map::new());
        assert_eq!(config.title, "Cloud Coverage Query");
        assert_eq!(config.description, "None");
        assert_eq!(config.chunk_size(), ChunkingPolicy { time: None, geographic: 0.10 });
        assert!(config.is_iterative());
        assert!(config.reverse_time());
        assert!(config.processing_method().clear_percentage);
        assert!(config.anomaly.is_none());
    }

    #[test]
    fn test_spectral_anomaly_flags_follow_compositor() {
        let median = TaskConfig::from_params(
            TaskKind::SpectralAnomaly,
            &params(json!({ "compositor": "median_pixel" })),
        );
        assert!(!median.is_iterative());
        assert!(!median.reverse_time());
        assert!(!median.processing_method().clear_percentage);

        let recent = TaskConfig::from_params(
            TaskKind::SpectralAnomaly,
            &params(json!({ "compositor": "most_recent" })),
        );
        assert!(recent.is_iterative());
        assert!(recent.reverse_time());
        assert_eq!(recent.chunk_size().geographic, 0.005);
    }

    #[test]
    fn test_blank_title_gets_placeholder() {
        let config = TaskConfig::from_params(
            TaskKind::SpectralAnomaly,
            &params(json!({ "title": "", "description": "  " })),
        );
        assert_eq!(config.title, "Spectral Anomaly Query");
        assert_eq!(config.description, "None");
    }

    #[test]
    fn test_unknown_and_malformed_fields_are_dropped() {
        let config = TaskConfig::from_params(
            TaskKind::CloudCoverage,
            &params(json!({
                "satellite": "LANDSAT_7",
                "latitude_min": "not a number",
                "latitude_max": 1.5,
                "compositor": "max_ndvi",
                "csrf_token": "abc",
                "time_start": "2016-01-01",
                "time_end": "01/02/2016",
            })),
        );
        assert_eq!(config.satellite, Satellite::Landsat7);
        assert_eq!(config.bounds.min_lat, 0.0);
        assert_eq!(config.bounds.max_lat, 1.5);
        // Cloud coverage has no compositor field
        assert_eq!(config.compositor, CompositingMode::MostRecent);
        assert_eq!(config.time_range.start, Some(parse_date("2016-01-01").unwrap()));
        assert_eq!(config.time_range.end, None);
    }

    #[test]
    fn test_unknown_compositor_falls_back() {
        let config = TaskConfig::from_params(
            TaskKind::SpectralAnomaly,
            &params(json!({ "compositor": "geomedian" })),
        );
        assert_eq!(config.compositor, CompositingMode::MostRecent);
    }

    #[test]
    fn test_chunking_overrides() {
        let config = TaskConfig::from_params(
            TaskKind::CloudCoverage,
            &params(json!({ "time_chunk_size": 5, "geographic_chunk_degrees": 0.5, "iterate_in_reverse": false })),
        );
        assert_eq!(config.chunk_size(), ChunkingPolicy { time: Some(5), geographic: 0.5 });
        assert_eq!(config.time_order(), TimeOrder::Ascending);
    }

    #[test]
    fn test_anomaly_thresholds() {
        let config = TaskConfig::from_params(
            TaskKind::SpectralAnomaly,
            &params(json!({
                "query_type": "ndwi",
                "composite_threshold_min": -0.5,
                "change_threshold_max": 0.25,
                "baseline_time_start": "2015-01-01",
            })),
        );
        let anomaly = config.anomaly.as_ref().unwrap();
        assert_eq!(anomaly.query_type, SpectralIndex::Ndwi);
        assert_eq!(anomaly.baseline.start, Some(parse_date("2015-01-01").unwrap()));

        let thresholds = anomaly.thresholds();
        assert_eq!(thresholds.composite_min, -0.5);
        assert_eq!(thresholds.composite_max, 1.0);
        assert_eq!(thresholds.change_min, None);
        assert_eq!(thresholds.change_max, Some(0.25));
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        assert!(TaskConfig::from_json_str(TaskKind::CloudCoverage, "[1, 2]").is_err());
    }
}
