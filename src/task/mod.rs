//! Task parameters, records and storage

pub mod config;
pub mod record;
pub mod store;

pub use config::{AnomalyParams, ChunkingPolicy, ProcessingMethod, Satellite, TaskConfig, TaskKind};
pub use record::{ResultPaths, TaskId, TaskMetadata, TaskRecord};
pub use store::{resolve, MemoryTaskStore, TaskStore};
