use std::path::{Path, PathBuf};

pub const CHECKPOINT_DB_FILE_NAME: &str = "checkpoints.db";
pub const TRUST_DB_FILE_NAME: &str = "trust.db";

pub fn checkpoint_db_path(state_root: &Path) -> PathBuf {
    state_root.join("db").join(CHECKPOINT_DB_FILE_NAME)
}

pub fn trust_db_path(state_root: &Path) -> PathBuf {
    state_root.join("db").join(TRUST_DB_FILE_NAME)
}
