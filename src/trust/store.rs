use super::{TrustError, TrustLevel, TrustMetrics};
use crate::shared::ids::UserId;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub trait TrustMetricsStore: Send + Sync {
    fn load(&self, user_id: &UserId) -> Result<Option<TrustMetrics>, TrustError>;
    fn store(&self, metrics: &TrustMetrics) -> Result<(), TrustError>;
    fn users(&self) -> Result<Vec<UserId>, TrustError>;
}

#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    metrics: Mutex<BTreeMap<UserId, TrustMetrics>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustMetricsStore for MemoryTrustStore {
    fn load(&self, user_id: &UserId) -> Result<Option<TrustMetrics>, TrustError> {
        let metrics = self.metrics.lock().map_err(|_| TrustError::LockPoisoned)?;
        Ok(metrics.get(user_id).cloned())
    }

    fn store(&self, metrics: &TrustMetrics) -> Result<(), TrustError> {
        let mut stored = self.metrics.lock().map_err(|_| TrustError::LockPoisoned)?;
        stored.insert(metrics.user_id.clone(), metrics.clone());
        Ok(())
    }

    fn users(&self) -> Result<Vec<UserId>, TrustError> {
        let metrics = self.metrics.lock().map_err(|_| TrustError::LockPoisoned)?;
        Ok(metrics.keys().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteTrustStore {
    db_path: PathBuf,
}

impl SqliteTrustStore {
    pub fn open(db_path: &Path) -> Result<Self, TrustError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| TrustError::CreateParent {
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

    fn ensure_schema(&self) -> Result<(), TrustError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS trust_metrics (
                    user_id TEXT PRIMARY KEY,
                    total_interactions INTEGER NOT NULL,
                    successful_interactions INTEGER NOT NULL,
                    average_feedback_score REAL,
                    feedback_count INTEGER NOT NULL,
                    current_level TEXT NOT NULL,
                    last_calculated INTEGER NOT NULL,
                    interactions_by_type TEXT NOT NULL
                );
                ",
            )
            .map_err(|source| TrustError::Sql { source })
    }

    fn connect(&self) -> Result<Connection, TrustError> {
        let connection = Connection::open(&self.db_path).map_err(|source| TrustError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(|source| TrustError::Sql { source })?;
        Ok(connection)
    }
}

impl TrustMetricsStore for SqliteTrustStore {
    fn load(&self, user_id: &UserId) -> Result<Option<TrustMetrics>, TrustError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT total_interactions, successful_interactions, average_feedback_score,
                        feedback_count, current_level, last_calculated, interactions_by_type
                 FROM trust_metrics WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|source| TrustError::Sql { source })?;

        let Some((total, successful, average, feedback_count, level, last, by_type)) = row else {
            return Ok(None);
        };
        let current_level =
            TrustLevel::parse(&level).map_err(|_| TrustError::InvalidColumn {
                column: "current_level",
                value: level.clone(),
            })?;
        let interactions_by_type =
            serde_json::from_str(&by_type).map_err(|_| TrustError::InvalidColumn {
                column: "interactions_by_type",
                value: by_type.clone(),
            })?;
        Ok(Some(TrustMetrics {
            user_id: user_id.clone(),
            total_interactions: total as u64,
            successful_interactions: successful as u64,
            average_feedback_score: average,
            feedback_count: feedback_count as u64,
            current_level,
            last_calculated: last,
            interactions_by_type,
        }))
    }

    fn store(&self, metrics: &TrustMetrics) -> Result<(), TrustError> {
        let by_type = serde_json::to_string(&metrics.interactions_by_type)
            .map_err(|source| TrustError::Encode { source })?;
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO trust_metrics (
                    user_id, total_interactions, successful_interactions, average_feedback_score,
                    feedback_count, current_level, last_calculated, interactions_by_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(user_id) DO UPDATE SET
                    total_interactions = excluded.total_interactions,
                    successful_interactions = excluded.successful_interactions,
                    average_feedback_score = excluded.average_feedback_score,
                    feedback_count = excluded.feedback_count,
                    current_level = excluded.current_level,
                    last_calculated = excluded.last_calculated,
                    interactions_by_type = excluded.interactions_by_type",
                params![
                    metrics.user_id.as_str(),
                    metrics.total_interactions as i64,
                    metrics.successful_interactions as i64,
                    metrics.average_feedback_score,
                    metrics.feedback_count as i64,
                    metrics.current_level.as_str(),
                    metrics.last_calculated,
                    by_type,
                ],
            )
            .map_err(|source| TrustError::Sql { source })?;
        Ok(())
    }

    fn users(&self) -> Result<Vec<UserId>, TrustError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare("SELECT user_id FROM trust_metrics ORDER BY user_id")
            .map_err(|source| TrustError::Sql { source })?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|source| TrustError::Sql { source })?;
        let mut users = Vec::new();
        for row in rows {
            let raw = row.map_err(|source| TrustError::Sql { source })?;
            users.push(
                UserId::parse(&raw).map_err(|_| TrustError::InvalidColumn {
                    column: "user_id",
                    value: raw.clone(),
                })?,
            );
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sqlite_store_upserts_and_reloads_metrics() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteTrustStore::open(&dir.path().join("state/trust.db")).expect("open");
        let user = UserId::parse("u-1").expect("user");
        assert!(store.load(&user).expect("load").is_none());

        let mut metrics = TrustMetrics::new(user.clone(), 10);
        metrics.apply_outcome(true, Some(4.5), "assessment", 11);
        store.store(&metrics).expect("store");
        metrics.apply_outcome(false, None, "policy", 12);
        metrics.current_level = TrustLevel::Suggestive;
        store.store(&metrics).expect("store update");

        let loaded = store.load(&user).expect("load").expect("metrics");
        assert_eq!(loaded, metrics);
        assert_eq!(store.users().expect("users"), vec![user]);
    }

    #[test]
    fn memory_store_keeps_latest_metrics_per_user() {
        let store = MemoryTrustStore::new();
        let user = UserId::parse("u-2").expect("user");
        let mut metrics = TrustMetrics::new(user.clone(), 0);
        store.store(&metrics).expect("store");
        metrics.apply_outcome(true, None, "assessment", 1);
        store.store(&metrics).expect("store");
        assert_eq!(
            store
                .load(&user)
                .expect("load")
                .expect("metrics")
                .total_interactions,
            1
        );
    }
}
