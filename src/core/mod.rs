//! Core clear-pixel accounting and compositing modules

pub mod clean_mask;
pub mod accumulator;
pub mod compositing;
pub mod metadata;
pub mod anomaly;

// Re-export main types
pub use clean_mask::{CleanMaskEvaluator, CleanMaskParams, QaEncoding};
pub use accumulator::{ClearPixelAccumulator, ClearPixelState};
pub use compositing::{Composite, CompositeFn, CompositingMode};
pub use metadata::{AcquisitionTally, FinalSummary, RunningMetadata};
pub use anomaly::{AnomalyDetector, AnomalyProduct, AnomalyThresholds, SpectralIndex};
