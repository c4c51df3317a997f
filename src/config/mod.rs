pub mod error;
pub mod load;
pub mod paths;
pub mod settings;
pub mod workflow_file;

pub use error::ConfigError;
pub use load::load_settings;
pub use paths::{checkpoint_db_path, trust_db_path, CHECKPOINT_DB_FILE_NAME, TRUST_DB_FILE_NAME};
pub use settings::{
    CapabilityConfig, OrchestrationSettings, ResilienceSettings, Settings, StorageBackend,
    StorageSettings,
};
pub use workflow_file::{BranchDefinition, StepDefinition, WorkflowDefinition, END_STEP};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRegistry, AgentResponse, FnAgentAdapter};
    use crate::orchestration::graph::{NextStep, Transition};
    use crate::orchestration::steps::RecoveryPolicy;
    use crate::shared::ids::{CapabilityId, StepId};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    const ASSESSMENT_YAML: &str = r#"
state_root: /tmp/complyflow
orchestration:
  max_iterations_per_invocation: 20
resilience:
  failure_threshold: 3
  call_timeout_ms: 1000
storage:
  backend: memory
capabilities:
  risk-scorer:
    endpoint: http://127.0.0.1:9100/score
    timeout_ms: 250
workflows:
  - id: assessment
    entry: score
    context:
      findings: append
    steps:
      - id: score
        capability: risk-scorer
        output_key: risk
        branch:
          key: risk.level
          cases:
            high: escalate
          default: summarize
      - id: escalate
        capability: risk-scorer
        output_key: findings
        next: summarize
      - id: summarize
        capability: risk-scorer
        output_key: summary
        fallback: { text: "summary unavailable" }
        next: end
"#;

    fn id(raw: &str) -> StepId {
        StepId::parse(raw).expect("step id")
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new().with(
            CapabilityId::parse("risk-scorer").expect("capability"),
            Arc::new(FnAgentAdapter::new(|_| {
                Ok(AgentResponse::success(json!({}), 1.0))
            })),
        )
    }

    #[test]
    fn empty_settings_take_documented_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").expect("parse settings");
        assert_eq!(settings.state_root, PathBuf::from(".complyflow"));
        assert_eq!(settings.orchestration.max_iterations_per_invocation, 50);
        assert_eq!(settings.orchestration.max_step_retries, 2);
        assert!(settings.orchestration.escalate_validation_errors);
        assert_eq!(settings.orchestration.conflict_retries, 3);
        assert_eq!(settings.resilience.failure_threshold, 5);
        assert_eq!(settings.resilience.recovery_timeout_ms, 60_000);
        assert_eq!(settings.resilience.max_attempts, 3);
        assert_eq!(settings.storage.backend, StorageBackend::Sqlite);
        settings.validate().expect("defaults are valid");
    }

    #[test]
    fn sections_map_onto_runtime_configuration() {
        let settings: Settings = serde_yaml::from_str(ASSESSMENT_YAML).expect("parse settings");
        settings.validate().expect("valid");

        let resilience = settings.resilience_config().expect("resilience config");
        assert_eq!(resilience.breaker.failure_threshold, 3);
        assert_eq!(resilience.call_timeout, Duration::from_millis(1000));
        assert_eq!(
            resilience
                .call_timeouts
                .get(&CapabilityId::parse("risk-scorer").expect("capability")),
            Some(&Duration::from_millis(250))
        );
        assert_eq!(settings.execution_limits().max_iterations_per_invocation, 20);
        assert_eq!(settings.recovery_policy(), RecoveryPolicy::default());
    }

    #[test]
    fn workflow_definition_compiles_into_a_closed_graph() {
        let settings: Settings = serde_yaml::from_str(ASSESSMENT_YAML).expect("parse settings");
        let graph = settings.workflows[0]
            .compile(&registry(), settings.recovery_policy())
            .expect("compile");

        assert_eq!(graph.entry(), &id("score"));
        assert_eq!(graph.error_step().as_str(), "handle_error");
        assert_eq!(
            graph.step_ids().map(StepId::as_str).collect::<Vec<_>>(),
            vec!["escalate", "handle_error", "score", "summarize"]
        );
        assert!(graph.context().declares("findings"));
        assert!(graph.context().declares("risk"));
        assert!(matches!(
            graph.transition(&id("summarize")).expect("transition"),
            Transition::Terminal
        ));
        match graph.transition(&id("score")).expect("transition") {
            Transition::Conditional { targets, .. } => {
                assert_eq!(
                    targets.iter().cloned().collect::<Vec<_>>(),
                    vec![id("escalate"), id("summarize")]
                );
            }
            other => panic!("unexpected transition: {other:?}"),
        }
    }

    #[test]
    fn branch_reads_nested_context_values() {
        let settings: Settings = serde_yaml::from_str(ASSESSMENT_YAML).expect("parse settings");
        let graph = settings.workflows[0]
            .compile(&registry(), RecoveryPolicy::default())
            .expect("compile");
        let mut state = crate::state::WorkflowState::new(
            crate::shared::ids::ThreadId::parse("t-1").expect("thread"),
            crate::shared::ids::UserId::parse("u-1").expect("user"),
            crate::shared::ids::WorkflowType::parse("assessment").expect("type"),
            id("score"),
            serde_json::Value::Null,
            0,
        );
        state
            .context_mut()
            .insert("risk".to_string(), json!({"level": "high"}));
        assert_eq!(
            graph.resolve_next(&id("score"), &state).expect("route"),
            NextStep::Step(id("escalate"))
        );

        state
            .context_mut()
            .insert("risk".to_string(), json!({"level": "low"}));
        assert_eq!(
            graph.resolve_next(&id("score"), &state).expect("route"),
            NextStep::Step(id("summarize"))
        );
    }

    #[test]
    fn unknown_route_targets_fail_validation() {
        let err = serde_yaml::from_str::<Settings>(
            r#"
workflows:
  - id: assessment
    entry: score
    steps:
      - id: score
        capability: risk-scorer
        next: sumarize
      - id: summarize
        capability: risk-scorer
        next: end
"#,
        )
        .expect("parse settings")
        .validate()
        .expect_err("typo target");
        match err {
            ConfigError::Workflow { workflow, message } => {
                assert_eq!(workflow, "assessment");
                assert!(message.contains("sumarize"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn steps_need_exactly_one_route() {
        let err = serde_yaml::from_str::<Settings>(
            r#"
workflows:
  - id: assessment
    entry: score
    steps:
      - id: score
        capability: risk-scorer
"#,
        )
        .expect("parse settings")
        .validate()
        .expect_err("missing route");
        assert!(err.to_string().contains("exactly one of `next` or `branch`"));
    }

    #[test]
    fn unknown_merge_policy_and_fields_are_rejected() {
        let err = serde_yaml::from_str::<Settings>(
            r#"
workflows:
  - id: assessment
    entry: score
    context:
      findings: concat
    steps:
      - id: score
        capability: risk-scorer
        next: end
"#,
        )
        .expect("parse settings")
        .validate()
        .expect_err("unknown policy");
        assert!(err.to_string().contains("concat"));

        let err = serde_yaml::from_str::<Settings>("orchestration:\n  max_loops: 3\n")
            .expect_err("unknown field");
        assert!(err.to_string().contains("max_loops"));
    }

    #[test]
    fn compile_requires_registered_capabilities() {
        let settings: Settings = serde_yaml::from_str(ASSESSMENT_YAML).expect("parse settings");
        let err = settings.workflows[0]
            .compile(&AgentRegistry::new(), RecoveryPolicy::default())
            .expect_err("no agents");
        assert!(matches!(err, ConfigError::MissingCapability { .. }));
    }

    #[test]
    fn relative_state_root_resolves_next_to_settings_file() {
        let settings: Settings = serde_yaml::from_str("state_root: state\n").expect("parse");
        assert_eq!(
            settings.resolve_state_root(std::path::Path::new("/etc/complyflow/settings.yaml")),
            PathBuf::from("/etc/complyflow/state")
        );
    }
}
