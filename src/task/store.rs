use crate::task::config::{TaskConfig, TaskKind};
use crate::task::record::{ResultPaths, TaskId, TaskMetadata, TaskRecord};
use crate::types::{MosaicError, MosaicResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Persistence for task records
pub trait TaskStore {
    /// Record whose parameters exactly match `config`
    fn find(&self, config: &TaskConfig) -> MosaicResult<Option<TaskRecord>>;

    fn get(&self, id: TaskId) -> MosaicResult<Option<TaskRecord>>;

    /// Persist a new record for `config`
    fn insert(&mut self, config: TaskConfig) -> MosaicResult<TaskRecord>;

    fn save_metadata(&mut self, id: TaskId, metadata: TaskMetadata) -> MosaicResult<()>;

    fn save_result(&mut self, id: TaskId, result: ResultPaths) -> MosaicResult<()>;
}

/// In-process store, one record per distinct parameter set
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: BTreeMap<TaskId, TaskRecord>,
    next_id: TaskId,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_mut(&mut self, id: TaskId) -> MosaicResult<&mut TaskRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| MosaicError::Storage(format!("No task with id {}", id)))
    }
}

impl TaskStore for MemoryTaskStore {
    fn find(&self, config: &TaskConfig) -> MosaicResult<Option<TaskRecord>> {
        Ok(self.records.values().find(|r| &r.config == config).cloned())
    }

    fn get(&self, id: TaskId) -> MosaicResult<Option<TaskRecord>> {
        Ok(self.records.get(&id).cloned())
    }

    fn insert(&mut self, config: TaskConfig) -> MosaicResult<TaskRecord> {
        self.next_id += 1;
        let record = TaskRecord::new(self.next_id, config);
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn save_metadata(&mut self, id: TaskId, metadata: TaskMetadata) -> MosaicResult<()> {
        self.record_mut(id)?.metadata = metadata;
        Ok(())
    }

    fn save_result(&mut self, id: TaskId, result: ResultPaths) -> MosaicResult<()> {
        self.record_mut(id)?.result = result;
        Ok(())
    }
}

/// Get or create the task matching `candidate_params`.
///
/// Returns the record and whether it was newly created.
pub fn resolve<S: TaskStore>(
    store: &mut S,
    kind: TaskKind,
    candidate_params: &Map<String, Value>,
) -> MosaicResult<(TaskRecord, bool)> {
    let config = TaskConfig::from_params(kind, candidate_params);

    if let Some(existing) = store.find(&config)? {
        log::info!("Resolved existing {} task {}", kind, existing.id);
        return Ok((existing, false));
    }

    let record = store.insert(config)?;
    log::info!("Created {} task {}", kind, record.id);
    Ok((record, true))
}
