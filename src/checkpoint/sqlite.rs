use super::codec::{decode_state, encode_state, state_digest, CHECKPOINT_SCHEMA_VERSION};
use super::{ensure_thread_matches, CheckpointError, CheckpointMeta, CheckpointStore};
use crate::shared::ids::{StepId, ThreadId};
use crate::state::{WorkflowState, WorkflowStatus};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store. Every record keeps the serialized state and a
/// SHA-256 digest so checkpoints can be inspected and verified offline.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    db_path: PathBuf,
}

impl SqliteCheckpointStore {
    pub fn open(db_path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<(), CheckpointError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                PRAGMA journal_mode=WAL;

                CREATE TABLE IF NOT EXISTS checkpoints (
                    thread_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    written_at INTEGER NOT NULL,
                    schema_version INTEGER NOT NULL,
                    digest TEXT NOT NULL,
                    step TEXT NOT NULL,
                    status TEXT NOT NULL,
                    state_json TEXT NOT NULL,
                    PRIMARY KEY (thread_id, version)
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_version
                    ON checkpoints(thread_id, version DESC);
                ",
            )
            .map_err(|source| CheckpointError::Sql { source })
    }

    fn connect(&self) -> Result<Connection, CheckpointError> {
        let connection =
            Connection::open(&self.db_path).map_err(|source| CheckpointError::Open {
                path: self.db_path.display().to_string(),
                source,
            })?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| CheckpointError::Sql { source })?;
        Ok(connection)
    }

    fn load_row(
        &self,
        thread_id: &ThreadId,
        version: Option<u64>,
    ) -> Result<Option<(u64, String, String)>, CheckpointError> {
        let connection = self.connect()?;
        let row = match version {
            Some(version) => connection
                .query_row(
                    "SELECT version, digest, state_json FROM checkpoints
                     WHERE thread_id = ?1 AND version = ?2",
                    params![thread_id.as_str(), version as i64],
                    |row| Ok((row.get::<_, i64>(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional(),
            None => connection
                .query_row(
                    "SELECT version, digest, state_json FROM checkpoints
                     WHERE thread_id = ?1 ORDER BY version DESC LIMIT 1",
                    params![thread_id.as_str()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional(),
        }
        .map_err(|source| CheckpointError::Sql { source })?;
        Ok(row.map(|(version, digest, body)| (version as u64, digest, body)))
    }

    fn decode_verified(
        thread_id: &ThreadId,
        version: u64,
        digest: &str,
        body: &str,
    ) -> Result<WorkflowState, CheckpointError> {
        if state_digest(body) != digest {
            return Err(CheckpointError::Corrupt {
                thread_id: thread_id.clone(),
                version,
            });
        }
        decode_state(body)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, thread_id: &ThreadId, state: &WorkflowState) -> Result<u64, CheckpointError> {
        ensure_thread_matches(thread_id, state)?;
        let mut connection = self.connect()?;
        // IMMEDIATE takes the write lock up front so the version check and insert are atomic.
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| CheckpointError::Sql { source })?;

        let latest = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM checkpoints WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|source| CheckpointError::Sql { source })? as u64;
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
        let inserted = tx.execute(
            "INSERT INTO checkpoints (
                thread_id, version, written_at, schema_version, digest, step, status, state_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                thread_id.as_str(),
                next as i64,
                persisted.updated_at(),
                CHECKPOINT_SCHEMA_VERSION,
                state_digest(&body),
                persisted.current_step().as_str(),
                status_to_db(persisted.status()),
                body,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(CheckpointError::Conflict {
                    thread_id: thread_id.clone(),
                    expected: state.version(),
                    actual: next,
                });
            }
            Err(source) => return Err(CheckpointError::Sql { source }),
        }

        tx.commit()
            .map_err(|source| CheckpointError::Sql { source })?;
        Ok(next)
    }

    fn load(&self, thread_id: &ThreadId) -> Result<(WorkflowState, u64), CheckpointError> {
        let (version, digest, body) =
            self.load_row(thread_id, None)?
                .ok_or_else(|| CheckpointError::NotFound {
                    thread_id: thread_id.clone(),
                })?;
        let state = Self::decode_verified(thread_id, version, &digest, &body)?;
        Ok((state, version))
    }

    fn load_version(
        &self,
        thread_id: &ThreadId,
        version: u64,
    ) -> Result<WorkflowState, CheckpointError> {
        let (version, digest, body) =
            self.load_row(thread_id, Some(version))?
                .ok_or_else(|| CheckpointError::VersionNotFound {
                    thread_id: thread_id.clone(),
                    version,
                })?;
        Self::decode_verified(thread_id, version, &digest, &body)
    }

    fn history(
        &self,
        thread_id: &ThreadId,
        limit: usize,
    ) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT version, written_at, schema_version, digest, step, status
                 FROM checkpoints WHERE thread_id = ?1
                 ORDER BY version DESC LIMIT ?2",
            )
            .map_err(|source| CheckpointError::Sql { source })?;
        let rows = statement
            .query_map(
                params![thread_id.as_str(), limit.min(i64::MAX as usize) as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .map_err(|source| CheckpointError::Sql { source })?;

        let mut metas = Vec::new();
        for row in rows {
            let (version, written_at, schema_version, digest, step, status) =
                row.map_err(|source| CheckpointError::Sql { source })?;
            metas.push(CheckpointMeta {
                thread_id: thread_id.clone(),
                version: version as u64,
                written_at,
                schema_version,
                digest,
                step: StepId::parse(&step).map_err(|_| CheckpointError::InvalidColumn {
                    column: "step",
                    value: step.clone(),
                })?,
                status: status_from_db(&status)?,
            });
        }
        Ok(metas)
    }

    fn threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")
            .map_err(|source| CheckpointError::Sql { source })?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|source| CheckpointError::Sql { source })?;
        let mut threads = Vec::new();
        for row in rows {
            let raw = row.map_err(|source| CheckpointError::Sql { source })?;
            threads.push(
                ThreadId::parse(&raw).map_err(|_| CheckpointError::InvalidColumn {
                    column: "thread_id",
                    value: raw.clone(),
                })?,
            );
        }
        Ok(threads)
    }
}

fn status_to_db(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::InProgress => "in_progress",
        WorkflowStatus::AwaitingApproval => "awaiting_approval",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

fn status_from_db(value: &str) -> Result<WorkflowStatus, CheckpointError> {
    match value {
        "in_progress" => Ok(WorkflowStatus::InProgress),
        "awaiting_approval" => Ok(WorkflowStatus::AwaitingApproval),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => Err(CheckpointError::InvalidColumn {
            column: "status",
            value: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::{UserId, WorkflowType};
    use tempfile::tempdir;

    #[test]
    fn status_column_round_trips() {
        for status in [
            WorkflowStatus::InProgress,
            WorkflowStatus::AwaitingApproval,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(
                status_from_db(status_to_db(status)).expect("status"),
                status
            );
        }
        assert!(status_from_db("paused").is_err());
    }

    #[test]
    fn tampered_rows_fail_integrity_check() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteCheckpointStore::open(&dir.path().join("checkpoints.db"))
            .expect("open store");
        let thread = ThreadId::parse("t-1").expect("thread");
        let state = WorkflowState::new(
            thread.clone(),
            UserId::parse("u-1").expect("user"),
            WorkflowType::parse("assessment").expect("type"),
            StepId::parse("intake").expect("step"),
            serde_json::Value::Null,
            1,
        );
        store.save(&thread, &state).expect("save");

        let connection = store.connect().expect("connect");
        connection
            .execute(
                "UPDATE checkpoints SET state_json = replace(state_json, 'intake', 'review')",
                [],
            )
            .expect("tamper");

        let err = store.load(&thread).expect_err("corrupt");
        assert!(matches!(err, CheckpointError::Corrupt { version: 1, .. }));
    }
}
