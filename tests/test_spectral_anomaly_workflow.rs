use approx::assert_relative_eq;
use chrono::NaiveDate;
use dcmosaic::core::compositing::median;
use dcmosaic::types::{AcquisitionKey, GeoWindow, RasterChunk, RasterStack, NO_DATA};
use dcmosaic::{detect_anomalies, CompositingMode, SpectralIndex, TaskConfig, TaskKind};
use ndarray::Array3;
use serde_json::json;

fn key(year: i32, month: u32, day: u32) -> AcquisitionKey {
    let time = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(10, 30, 0)
        .unwrap()
        .and_utc();
    AcquisitionKey::from_datetime(time)
}

/// 1x2 chunk of (red, nir) per slice
fn chunk(times: Vec<AcquisitionKey>, pixels: &[[(f32, f32); 2]]) -> RasterChunk {
    let flat: Vec<f32> = pixels
        .iter()
        .flat_map(|slice| slice.iter().flat_map(|&(red, nir)| [red, nir]))
        .collect();
    let data = RasterStack::from_shape_vec((pixels.len(), 1, 2, 2), flat).unwrap();
    RasterChunk::with_window(times, data, vec!["red".to_string(), "nir".to_string()], GeoWindow::origin(1, 2)).unwrap()
}

fn config(compositor: &str) -> TaskConfig {
    let params = json!({
        "compositor": compositor,
        "query_type": "ndvi",
        "baseline_time_start": "2015-01-01",
        "baseline_time_end": "2015-12-31",
        "analysis_time_start": "2016-01-01",
        "analysis_time_end": "2016-12-31",
        "change_threshold_max": 0.0,
    });
    TaskConfig::from_params(TaskKind::SpectralAnomaly, params.as_object().unwrap())
}

#[test]
fn test_vegetation_loss_is_detected() {
    let _ = env_logger::builder().is_test(true).try_init();

    let times = vec![key(2015, 3, 1), key(2015, 6, 1), key(2016, 3, 1), key(2016, 6, 1)];
    let chunk = chunk(
        times,
        &[
            [(0.1, 0.5), (0.1, 0.5)],
            [(0.1, 0.9), (0.2, 0.2)],
            [(0.3, 0.3), (0.1, 0.5)],
            [(0.2, 0.6), (0.1, 0.9)],
        ],
    );
    let qa = Array3::from_elem((4, 1, 2), 322);

    let outcome = detect_anomalies(&config("max_ndvi"), &[(chunk, qa)], (1, 2)).unwrap();

    // Pixel 0: max NDVI 0.8 (2015) vs 0.5 (2016) -> loss kept by change <= 0
    // Pixel 1: max NDVI 0.667 (2015) vs 0.8 (2016) -> gain filtered out
    assert_eq!(outcome.anomaly.index, SpectralIndex::Ndvi);
    assert_relative_eq!(outcome.anomaly.baseline_index[[0, 0]], 0.8, epsilon = 1e-6);
    assert_relative_eq!(outcome.anomaly.analysis_index[[0, 0]], 0.5, epsilon = 1e-6);
    assert_relative_eq!(outcome.anomaly.change[[0, 0]], -0.3, epsilon = 1e-6);
    assert_eq!(outcome.anomaly.change[[0, 1]], NO_DATA);
    assert_eq!(outcome.anomaly.valid_pixels, 1);

    let summary = outcome.metadata.summary.unwrap();
    assert_eq!(summary.total_scenes, 4);
    assert_eq!(summary.acquisition_list, "06/01/2016,03/01/2016,06/01/2015,03/01/2015");
}

#[test]
fn test_median_compositor_per_window() {
    let times = vec![key(2015, 1, 10), key(2015, 2, 10), key(2015, 3, 10), key(2016, 1, 10)];
    let chunk = chunk(
        times,
        &[
            [(0.2, 0.4), (0.1, 0.1)],
            [(0.4, 0.6), (0.1, 0.1)],
            [(0.6, 0.8), (0.1, 0.1)],
            [(0.5, 0.5), (0.1, 0.1)],
        ],
    );
    let qa = Array3::from_elem((4, 1, 2), 322);

    let config = config("median_pixel");
    assert_eq!(config.compositor, CompositingMode::MedianPixel);
    assert!(!config.is_iterative());

    let outcome = detect_anomalies(&config, &[(chunk, qa)], (1, 2)).unwrap();
    assert_relative_eq!(outcome.baseline.composite.data[[0, 0, 0]], 0.4);
    assert_relative_eq!(outcome.baseline.composite.data[[0, 0, 1]], 0.6);
    assert_relative_eq!(outcome.analysis.composite.data[[0, 0, 0]], 0.5);
}

#[test]
fn test_median_of_even_count() {
    let mut values = vec![8.0f64, 2.0, 6.0, 4.0];
    assert_eq!(median(&mut values), Some(5.0));
    let mut values = vec![6.0f64, 2.0, 4.0];
    assert_eq!(median(&mut values), Some(4.0));
    assert_eq!(median::<f64>(&mut []), None);
}

#[test]
fn test_cloud_coverage_task_is_rejected() {
    let config = TaskConfig::new(TaskKind::CloudCoverage);
    let chunk = chunk(vec![key(2016, 1, 1)], &[[(0.1, 0.2), (0.1, 0.2)]]);
    let qa = Array3::from_elem((1, 1, 2), 322);
    assert!(detect_anomalies(&config, &[(chunk, qa)], (1, 2)).is_err());
}
