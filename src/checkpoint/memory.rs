use super::codec::{decode_state, encode_state, state_digest, CHECKPOINT_SCHEMA_VERSION};
use super::{ensure_thread_matches, CheckpointError, CheckpointMeta, CheckpointStore};
use crate::shared::ids::ThreadId;
use crate::state::WorkflowState;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    meta: CheckpointMeta,
    body: String,
}

/// Process-local store; one mutex serializes every write.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    threads: Mutex<BTreeMap<ThreadId, Vec<StoredCheckpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ThreadId, Vec<StoredCheckpoint>>> {
        // Writes either fully push a record or do nothing, so a poisoned map is still consistent.
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decode_verified(stored: &StoredCheckpoint) -> Result<WorkflowState, CheckpointError> {
        if state_digest(&stored.body) != stored.meta.digest {
            return Err(CheckpointError::Corrupt {
                thread_id: stored.meta.thread_id.clone(),
                version: stored.meta.version,
            });
        }
        decode_state(&stored.body)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, thread_id: &ThreadId, state: &WorkflowState) -> Result<u64, CheckpointError> {
        ensure_thread_matches(thread_id, state)?;
        let mut threads = self.lock();
        let records = threads.entry(thread_id.clone()).or_default();
        let latest = records.last().map(|record| record.meta.version).unwrap_or(0);
        if latest != state.version() {
            return Err(CheckpointError::Conflict {
                thread_id: thread_id.clone(),
                expected: state.version(),
                actual: latest,
            });
        }

        let next = latest + 1;
        let mut persisted = state.clone();
        persisted.set_version(next);
        let body = encode_state(&persisted)?;
        records.push(StoredCheckpoint {
            meta: CheckpointMeta {
                thread_id: thread_id.clone(),
                version: next,
                written_at: persisted.updated_at(),
                schema_version: CHECKPOINT_SCHEMA_VERSION,
                digest: state_digest(&body),
                step: persisted.current_step().clone(),
                status: persisted.status(),
            },
            body,
        });
        Ok(next)
    }

    fn load(&self, thread_id: &ThreadId) -> Result<(WorkflowState, u64), CheckpointError> {
        let threads = self.lock();
        let stored = threads
            .get(thread_id)
            .and_then(|records| records.last())
            .ok_or_else(|| CheckpointError::NotFound {
                thread_id: thread_id.clone(),
            })?;
        let state = Self::decode_verified(stored)?;
        Ok((state, stored.meta.version))
    }

    fn load_version(
        &self,
        thread_id: &ThreadId,
        version: u64,
    ) -> Result<WorkflowState, CheckpointError> {
        let threads = self.lock();
        let records = threads
            .get(thread_id)
            .ok_or_else(|| CheckpointError::NotFound {
                thread_id: thread_id.clone(),
            })?;
        let stored = records
            .iter()
            .find(|record| record.meta.version == version)
            .ok_or_else(|| CheckpointError::VersionNotFound {
                thread_id: thread_id.clone(),
                version,
            })?;
        Self::decode_verified(stored)
    }

    fn history(
        &self,
        thread_id: &ThreadId,
        limit: usize,
    ) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let threads = self.lock();
        Ok(threads
            .get(thread_id)
            .map(|records| {
                records
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|record| record.meta.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        Ok(self
            .lock()
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(thread_id, _)| thread_id.clone())
            .collect())
    }
}
