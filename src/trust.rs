//! Per-user autonomy calibration.
//!
//! The level is always recomputed from [`TrustMetrics`]; there is no
//! explicit promote or demote operation.

pub mod calibrator;
pub mod level;
pub mod metrics;
pub mod notify;
pub mod store;

pub use calibrator::{OutcomeRecord, TrustCalibrator};
pub use level::TrustLevel;
pub use metrics::{compute_level, InteractionTally, TrustMetrics};
pub use notify::{EventLogNotifier, MemoryNotifier, NoopNotifier, TrustNotification, TrustNotifier};
pub use store::{MemoryTrustStore, SqliteTrustStore, TrustMetricsStore};

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("feedback score {score} is outside [1, 5]")]
    InvalidFeedback { score: f64 },
    #[error("interaction type must be non-empty")]
    EmptyInteractionType,
    #[error("trust store lock poisoned")]
    LockPoisoned,
    #[error("trust metrics encode failed: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create trust database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid trust column `{column}` value `{value}`")]
    InvalidColumn { column: &'static str, value: String },
}
