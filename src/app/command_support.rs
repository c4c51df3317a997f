use crate::agents::{AgentRegistry, HttpAgentAdapter};
use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use crate::config::{
    checkpoint_db_path, load_settings, trust_db_path, ConfigError, Settings, StorageBackend,
};
use crate::orchestration::{Orchestrator, OrchestratorError, WorkflowService};
use crate::resilience::ResilienceLayer;
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::ids::CapabilityId;
use crate::shared::logging::EventLog;
use crate::trust::{
    EventLogNotifier, MemoryTrustStore, SqliteTrustStore, TrustCalibrator, TrustMetricsStore,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    pub settings: Settings,
    pub state_root: PathBuf,
    pub service: WorkflowService,
}

pub fn map_config_err(err: ConfigError) -> String {
    err.to_string()
}

pub fn map_orchestrator_err(err: OrchestratorError) -> String {
    err.to_string()
}

pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode output: {e}"))
}

pub fn parse_json_arg(raw: &str, name: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("{name} must be valid json: {e}"))
}

/// One HTTP adapter per configured capability.
pub fn agent_registry(settings: &Settings) -> Result<AgentRegistry, String> {
    let default_timeout = Duration::from_millis(settings.resilience.call_timeout_ms);
    let mut registry = AgentRegistry::new();
    for (capability, config) in &settings.capabilities {
        let capability = CapabilityId::parse(capability)?;
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        let adapter = HttpAgentAdapter::new(capability.clone(), config.endpoint.clone(), timeout);
        registry.register(capability, Arc::new(adapter));
    }
    Ok(registry)
}

/// Wire stores, trust, resilience and compiled workflows into a service.
pub fn assemble_service(
    settings: &Settings,
    state_root: &Path,
    agents: AgentRegistry,
    clock: Arc<dyn Clock>,
) -> Result<WorkflowService, String> {
    let (checkpoints, trust_store): (Arc<dyn CheckpointStore>, Arc<dyn TrustMetricsStore>) =
        match settings.storage.backend {
            StorageBackend::Sqlite => (
                Arc::new(
                    SqliteCheckpointStore::open(&checkpoint_db_path(state_root))
                        .map_err(|e| e.to_string())?,
                ),
                Arc::new(
                    SqliteTrustStore::open(&trust_db_path(state_root))
                        .map_err(|e| e.to_string())?,
                ),
            ),
            StorageBackend::Memory => (
                Arc::new(MemoryCheckpointStore::new()),
                Arc::new(MemoryTrustStore::new()),
            ),
        };

    let event_log = Arc::new(EventLog::for_state_root(state_root));
    let trust = TrustCalibrator::new(
        trust_store,
        Arc::new(EventLogNotifier::new(event_log.clone())),
        clock.clone(),
    );
    let resilience = ResilienceLayer::new(
        settings.resilience_config().map_err(map_config_err)?,
        clock.clone(),
    );

    let mut graphs = Vec::with_capacity(settings.workflows.len());
    for workflow in &settings.workflows {
        graphs.push(
            workflow
                .compile(&agents, settings.recovery_policy())
                .map_err(map_config_err)?,
        );
    }

    let mut orchestrator = Orchestrator::new(
        checkpoints,
        Arc::new(trust),
        Arc::new(resilience),
        agents,
        clock,
    )
    .with_limits(settings.execution_limits())
    .with_event_log(event_log);
    for graph in graphs {
        orchestrator = orchestrator.with_graph(graph);
    }

    Ok(WorkflowService::new(Arc::new(orchestrator))
        .with_conflict_retries(settings.orchestration.conflict_retries))
}

pub fn build_runtime(settings_path: &Path) -> Result<Runtime, String> {
    let settings = load_settings(settings_path).map_err(map_config_err)?;
    let state_root = settings.resolve_state_root(settings_path);
    let agents = agent_registry(&settings)?;
    let service = assemble_service(&settings, &state_root, agents, Arc::new(SystemClock))?;
    tracing::debug!(
        state_root = %state_root.display(),
        workflows = settings.workflows.len(),
        "runtime assembled"
    );
    Ok(Runtime {
        settings,
        state_root,
        service,
    })
}
