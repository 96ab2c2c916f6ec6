use crate::core::metadata::{FinalSummary, RunningMetadata};
use crate::task::config::TaskConfig;
use serde::{Deserialize, Serialize};

pub type TaskId = u64;

/// Output file locations recorded for a finished task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPaths {
    pub mosaic_path: String,
    pub plot_path: String,
    pub data_path: String,
    pub data_netcdf_path: String,
}

/// Accounting state of a task: running tallies until finalized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub running: RunningMetadata,
    pub summary: Option<FinalSummary>,
}

impl TaskMetadata {
    pub fn is_finalized(&self) -> bool {
        self.summary.is_some()
    }
}

/// Stored task: parameters, metadata and results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub config: TaskConfig,
    pub metadata: TaskMetadata,
    pub result: ResultPaths,
}

impl TaskRecord {
    pub fn new(id: TaskId, config: TaskConfig) -> Self {
        Self {
            id,
            config,
            metadata: TaskMetadata::default(),
            result: ResultPaths::default(),
        }
    }
}
