#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("workflow `{workflow}` is invalid: {message}")]
    Workflow { workflow: String, message: String },
    #[error("workflow `{workflow}` step `{step}` uses capability `{capability}` with no registered agent")]
    MissingCapability {
        workflow: String,
        step: String,
        capability: String,
    },
}

impl ConfigError {
    pub(crate) fn workflow(workflow: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Workflow {
            workflow: workflow.into(),
            message: message.into(),
        }
    }
}
