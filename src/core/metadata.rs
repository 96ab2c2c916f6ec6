use crate::core::compositing::count_clean_pixels;
use crate::types::{AcquisitionKey, CleanMask, MosaicResult, Raster, RasterChunk};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pixel counts for one acquisition, summed over every chunk that touched it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AcquisitionTally {
    pub total_pixels: u64,
    pub clear_pixels: u64,
}

impl AcquisitionTally {
    pub fn new(total_pixels: u64, clear_pixels: u64) -> Self {
        debug_assert!(clear_pixels <= total_pixels);
        Self {
            total_pixels,
            clear_pixels: clear_pixels.min(total_pixels),
        }
    }

    pub fn add(&mut self, other: &AcquisitionTally) {
        self.total_pixels += other.total_pixels;
        self.clear_pixels += other.clear_pixels;
    }
}

/// Per-acquisition tallies for one task execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMetadata {
    acquisitions: BTreeMap<AcquisitionKey, AcquisitionTally>,
}

impl RunningMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally clear pixels per acquisition in one chunk
    pub fn from_chunk(chunk: &RasterChunk, clean_mask: &CleanMask) -> MosaicResult<Self> {
        chunk.check_mask(clean_mask)?;
        let (rows, cols) = chunk.spatial_shape();
        let slice_pixels = (rows * cols) as u64;

        let mut metadata = Self::new();
        for (time, slice) in chunk.times.iter().zip(clean_mask.axis_iter(Axis(0))) {
            let clear = slice.iter().filter(|&&c| c).count() as u64;
            metadata.record(*time, AcquisitionTally::new(slice_pixels, clear));
        }
        Ok(metadata)
    }

    /// Add a tally for one acquisition
    pub fn record(&mut self, key: AcquisitionKey, tally: AcquisitionTally) {
        self.acquisitions.entry(key).or_default().add(&tally);
    }

    /// Merge `new` into `old`, summing tallies for shared acquisitions
    pub fn combine(mut old: RunningMetadata, new: RunningMetadata) -> RunningMetadata {
        for (key, tally) in new.acquisitions {
            old.record(key, tally);
        }
        old
    }

    pub fn get(&self, key: &AcquisitionKey) -> Option<&AcquisitionTally> {
        self.acquisitions.get(key)
    }

    pub fn len(&self) -> usize {
        self.acquisitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquisitions.is_empty()
    }

    /// Acquisitions in ascending time order
    pub fn iter(&self) -> impl Iterator<Item = (&AcquisitionKey, &AcquisitionTally)> {
        self.acquisitions.iter()
    }

    /// Acquisitions, most recent first
    pub fn iter_descending(&self) -> impl Iterator<Item = (&AcquisitionKey, &AcquisitionTally)> {
        self.acquisitions.iter().rev()
    }
}

/// Summary fields stored with a finished task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    /// Spatial size of the output raster
    pub pixel_count: u64,
    /// Output pixels holding a value
    pub clean_pixel_count: u64,
    pub percentage_clean_pixels: f64,
    pub total_scenes: usize,
    pub scenes_processed: usize,
    /// `MM/DD/YYYY` dates, most recent first
    pub acquisition_list: String,
    pub clean_pixels_per_acquisition: String,
    pub clean_pixel_percentages_per_acquisition: String,
}

impl FinalSummary {
    /// Names of the comma-joined, index-aligned fields
    pub const ZIPPED_METADATA_FIELDS: [&'static str; 3] = [
        "acquisition_list",
        "clean_pixels_per_acquisition",
        "clean_pixel_percentages_per_acquisition",
    ];

    /// Summarize the final composite and the running per-acquisition tallies
    pub fn finalize(final_composite: &Raster, running_metadata: &RunningMetadata) -> Self {
        let (rows, cols, _) = final_composite.dim();
        let pixel_count = (rows * cols) as u64;
        let clean_pixel_count = count_clean_pixels(final_composite) as u64;
        let percentage_clean_pixels = clean_fraction_percentage(clean_pixel_count, pixel_count);

        let mut dates = Vec::with_capacity(running_metadata.len());
        let mut counts = Vec::with_capacity(running_metadata.len());
        let mut percentages = Vec::with_capacity(running_metadata.len());
        for (key, tally) in running_metadata.iter_descending() {
            dates.push(key.format_date());
            counts.push(tally.clear_pixels.to_string());
            percentages.push(format_float(percentage(tally.clear_pixels, pixel_count)));
        }

        log::info!(
            "Final summary: {}/{} clean pixels over {} acquisitions",
            clean_pixel_count,
            pixel_count,
            running_metadata.len()
        );

        Self {
            pixel_count,
            clean_pixel_count,
            percentage_clean_pixels,
            total_scenes: running_metadata.len(),
            scenes_processed: running_metadata.len(),
            acquisition_list: dates.join(","),
            clean_pixels_per_acquisition: counts.join(","),
            clean_pixel_percentages_per_acquisition: percentages.join(","),
        }
    }

    /// Rows of (date, clean pixels, clean percentage), most recent first
    pub fn zipped_metadata(&self) -> Vec<[&str; 3]> {
        let dates = split_field(&self.acquisition_list);
        let counts = split_field(&self.clean_pixels_per_acquisition);
        let percentages = split_field(&self.clean_pixel_percentages_per_acquisition);

        dates
            .into_iter()
            .zip(counts)
            .zip(percentages)
            .map(|((date, count), pct)| [date, count, pct])
            .collect()
    }
}

fn split_field(field: &str) -> Vec<&str> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split(',').collect()
    }
}

// `part / whole * 100`
fn clean_fraction_percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

// Whole numbers keep one decimal place ("80.0"), everything else prints shortest round-trip form
fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RasterStack, NO_DATA};
    use ndarray::Array3;

    fn key(day: i64) -> AcquisitionKey {
        AcquisitionKey::from_millis(day * 86_400_000).unwrap()
    }

    fn metadata(entries: &[(i64, u64, u64)]) -> RunningMetadata {
        let mut m = RunningMetadata::new();
        for &(day, total, clear) in entries {
            m.record(key(day), AcquisitionTally::new(total, clear));
        }
        m
    }

    #[test]
    fn test_from_chunk_counts_per_slice() {
        let chunk = RasterChunk::new(
            vec![key(0), key(1)],
            RasterStack::zeros((2, 2, 2, 1)),
            vec!["red".to_string()],
        )
        .unwrap();
        let mask = Array3::from_shape_vec((2, 2, 2), vec![true, true, false, true, false, false, false, true]).unwrap();

        let m = RunningMetadata::from_chunk(&chunk, &mask).unwrap();
        assert_eq!(m.get(&key(0)), Some(&AcquisitionTally::new(4, 3)));
        assert_eq!(m.get(&key(1)), Some(&AcquisitionTally::new(4, 1)));
    }

    #[test]
    fn test_combine_is_commutative() {
        let a = metadata(&[(0, 4, 2), (1, 4, 4)]);
        let b = metadata(&[(1, 4, 1), (2, 4, 3)]);

        let ab = RunningMetadata::combine(a.clone(), b.clone());
        let ba = RunningMetadata::combine(b, a);
        assert_eq!(ab, ba);
        assert_eq!(ab.get(&key(1)), Some(&AcquisitionTally::new(8, 5)));
        assert_eq!(ab.len(), 3);
    }

    #[test]
    fn test_combine_with_empty_is_identity() {
        let a = metadata(&[(0, 4, 2)]);
        assert_eq!(RunningMetadata::combine(a.clone(), RunningMetadata::new()), a);
    }

    #[test]
    fn test_finalize_all_no_data() {
        let raster = Array3::from_elem((3, 4, 2), NO_DATA);
        let summary = FinalSummary::finalize(&raster, &RunningMetadata::new());
        assert_eq!(summary.pixel_count, 12);
        assert_eq!(summary.clean_pixel_count, 0);
        assert_eq!(summary.percentage_clean_pixels, 0.0);
        assert!(summary.zipped_metadata().is_empty());
    }

    #[test]
    fn test_finalize_lists_are_descending_and_aligned() {
        let mut raster = Array3::from_elem((2, 2, 1), 0.5);
        raster[[1, 1, 0]] = NO_DATA;
        let m = metadata(&[(0, 4, 1), (40, 4, 2), (20, 4, 4)]);

        let summary = FinalSummary::finalize(&raster, &m);
        assert_eq!(summary.clean_pixel_count, 3);
        assert_eq!(summary.percentage_clean_pixels, 75.0);
        assert_eq!(summary.total_scenes, 3);
        assert_eq!(summary.acquisition_list, "02/10/1970,01/21/1970,01/01/1970");
        assert_eq!(summary.clean_pixels_per_acquisition, "2,4,1");
        assert_eq!(summary.clean_pixel_percentages_per_acquisition, "50.0,100.0,25.0");

        let rows = summary.zipped_metadata();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ["02/10/1970", "2", "50.0"]);
    }

    #[test]
    fn test_percentages_use_overall_pixel_count() {
        let raster = Array3::from_elem((1, 3, 1), 1.0);
        let m = metadata(&[(0, 6, 1)]);
        let summary = FinalSummary::finalize(&raster, &m);
        assert_eq!(summary.clean_pixel_percentages_per_acquisition, "33.333333333333336");
    }

    #[test]
    fn test_overall_percentage_divides_before_scaling() {
        let mut raster = Array3::from_elem((1, 3, 1), NO_DATA);
        raster[[0, 1, 0]] = 0.5;
        let m = metadata(&[(0, 3, 1)]);

        let summary = FinalSummary::finalize(&raster, &m);
        assert_eq!(summary.clean_pixel_count, 1);
        assert_eq!(summary.percentage_clean_pixels, 33.33333333333333);
        // Per-acquisition list keeps clear * 100 / pixel_count
        assert_eq!(summary.clean_pixel_percentages_per_acquisition, "33.333333333333336");
    }
}
