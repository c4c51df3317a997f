use complyflow::agents::{AgentError, AgentRegistry, AgentRequest, AgentResponse, FnAgentAdapter};
use complyflow::app::command_support::assemble_service;
use complyflow::config::Settings;
use complyflow::orchestration::{
    ApprovalRequest, FeedbackRequest, OrchestratorError, StartWorkflowRequest, WorkflowService,
};
use complyflow::shared::clock::ManualClock;
use complyflow::shared::ids::{CapabilityId, ThreadId, UserId, WorkflowType};
use complyflow::shared::logging::EventLog;
use complyflow::state::{HistoryOutcome, WorkflowStatus};
use complyflow::trust::TrustLevel;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

const SETTINGS_YAML: &str = r#"
orchestration:
  max_iterations_per_invocation: 25
resilience:
  max_attempts: 1
  base_delay_ms: 0
  max_delay_ms: 0
storage:
  backend: memory
workflows:
  - id: gap_analysis
    entry: collect
    context:
      notes: append
    steps:
      - id: collect
        capability: evidence-collector
        output_key: evidence
        next: assess
      - id: assess
        capability: risk-scorer
        output_key: risk
        branch:
          key: risk.level
          cases:
            high: review
          default: report
      - id: review
        capability: policy-reviewer
        output_key: notes
        next: end
      - id: report
        capability: report-writer
        output_key: notes
        fallback: "report deferred"
        next: end
"#;

fn capability(raw: &str) -> CapabilityId {
    CapabilityId::parse(raw).expect("capability")
}

fn agents() -> AgentRegistry {
    AgentRegistry::new()
        .with(
            capability("evidence-collector"),
            Arc::new(FnAgentAdapter::new(|_| {
                Ok(AgentResponse::success(json!({"controls": 12}), 0.95))
            })),
        )
        .with(
            capability("risk-scorer"),
            Arc::new(FnAgentAdapter::new(|request: &AgentRequest| {
                let level = match request.snapshot["input"]["scope"].as_str() {
                    Some("payroll") => "high",
                    _ => "low",
                };
                Ok(AgentResponse::success(json!({"level": level}), 0.8))
            })),
        )
        .with(
            capability("policy-reviewer"),
            Arc::new(FnAgentAdapter::new(|_| {
                Ok(AgentResponse::success(json!("payroll controls need sign-off"), 0.5)
                    .with_review("high risk scope"))
            })),
        )
        .with(
            capability("report-writer"),
            Arc::new(FnAgentAdapter::new(|request: &AgentRequest| {
                if request.snapshot["input"]["scope"] == "outage" {
                    return Err(AgentError::Unavailable {
                        capability: request.capability_id.clone(),
                        message: "503".to_string(),
                    });
                }
                Ok(AgentResponse::success(json!("report ready"), 0.9))
            })),
        )
}

fn service() -> (WorkflowService, TempDir) {
    let dir = tempdir().expect("tempdir");
    let settings: Settings = serde_yaml::from_str(SETTINGS_YAML).expect("settings");
    settings.validate().expect("valid settings");
    let service = assemble_service(
        &settings,
        dir.path(),
        agents(),
        Arc::new(ManualClock::new(1_700_000_000_000)),
    )
    .expect("assemble");
    (service, dir)
}

fn start(service: &WorkflowService, thread: &str, scope: &str) -> ThreadId {
    let thread_id = ThreadId::parse(thread).expect("thread id");
    service
        .start_workflow(StartWorkflowRequest {
            thread_id: Some(thread_id.clone()),
            workflow_type: WorkflowType::parse("gap_analysis").expect("type"),
            user_id: UserId::parse("analyst-3").expect("user"),
            input: json!({"scope": scope}),
        })
        .expect("start");
    thread_id
}

#[test]
fn low_risk_workflow_runs_to_completion() {
    let (service, _dir) = service();
    let thread_id = start(&service, "t-low", "vendor");

    let status = service.get_status(&thread_id).expect("status");
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.current_step.as_str(), "report");
    assert_eq!(status.history.steps_executed, 3);
    assert_eq!(status.history.errors, 0);
    assert_eq!(status.history.last_outcome, Some(HistoryOutcome::Succeeded));
    assert_eq!(status.trust_level, TrustLevel::Observational);
    assert!(status.failure_reason.is_none());

    let resumed = service
        .resume_workflow(&thread_id, None)
        .expect("resume is a no-op");
    assert_eq!(resumed.version, status.version);
    assert_eq!(resumed.partial_result["evidence"], json!({"controls": 12}));
    assert_eq!(resumed.partial_result["risk"], json!({"level": "low"}));
    assert_eq!(resumed.partial_result["notes"], json!(["report ready"]));

    let history = service.checkpoint_history(&thread_id, 2).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].version, status.version);
    assert_eq!(history[1].version, status.version - 1);
    assert_eq!(history[0].status, WorkflowStatus::Completed);
}

#[test]
fn unavailable_report_writer_degrades_to_the_fallback() {
    let (service, _dir) = service();
    let thread_id = start(&service, "t-outage", "outage");

    let status = service.get_status(&thread_id).expect("status");
    assert_eq!(status.status, WorkflowStatus::Completed);
    assert_eq!(status.history.errors, 1);
    assert_eq!(status.history.last_outcome, Some(HistoryOutcome::Degraded));

    let response = service.resume_workflow(&thread_id, None).expect("resume");
    assert_eq!(response.partial_result["notes"], json!(["report deferred"]));
}

#[test]
fn high_risk_workflow_waits_for_approval() {
    let (service, _dir) = service();
    let thread_id = start(&service, "t-high", "payroll");

    let status = service.get_status(&thread_id).expect("status");
    assert_eq!(status.status, WorkflowStatus::AwaitingApproval);
    let pending = status.pending_approval.expect("pending");
    assert_eq!(pending.step.as_str(), "review");
    assert_eq!(pending.resume_at, None);
    assert_eq!(pending.reasoning, "high risk scope");

    let request: ApprovalRequest =
        serde_json::from_value(json!({"decision": "approve"})).expect("approval json");
    let approved = service
        .submit_approval(&thread_id, request)
        .expect("approve");
    assert_eq!(approved.status, WorkflowStatus::Completed);
    assert_eq!(
        approved.partial_result["notes"],
        json!(["payroll controls need sign-off"])
    );

    let err = service
        .submit_approval(&thread_id, ApprovalRequest::Approve { input: None })
        .expect_err("nothing pending");
    assert!(matches!(err, OrchestratorError::NoPendingApproval { .. }));
}

#[test]
fn rejection_and_cancellation_end_suspended_workflows() {
    let (service, _dir) = service();
    let rejected = start(&service, "t-reject", "payroll");
    let request: ApprovalRequest = serde_json::from_value(json!({
        "decision": "reject",
        "reason": "evidence is stale"
    }))
    .expect("rejection json");
    let response = service.submit_approval(&rejected, request).expect("reject");
    assert_eq!(response.status, WorkflowStatus::Failed);
    assert!(response
        .failure_reason
        .expect("reason")
        .contains("evidence is stale"));

    let cancelled = start(&service, "t-cancel", "payroll");
    let response = service.cancel_workflow(&cancelled).expect("cancel");
    assert_eq!(response.status, WorkflowStatus::Cancelled);
    assert!(response.pending_approval.is_none());
    let again = service.cancel_workflow(&cancelled).expect("cancel twice");
    assert_eq!(again.version, response.version);
}

#[test]
fn feedback_calibrates_the_workflow_owner() {
    let (service, dir) = service();
    let thread_id = start(&service, "t-feedback", "vendor");
    let user = UserId::parse("analyst-3").expect("user");

    for n in 1..=5_u64 {
        let response = service
            .submit_feedback(
                &thread_id,
                FeedbackRequest {
                    success: true,
                    feedback_score: Some(4.0),
                    interaction_type: None,
                },
            )
            .expect("feedback");
        assert_eq!(response.total_interactions, n);
        assert_eq!(response.level_changed, n == 5);
    }
    assert_eq!(
        service.trust_level(&user).expect("level"),
        TrustLevel::Suggestive
    );
    let metrics = service
        .orchestrator()
        .trust()
        .metrics(&user)
        .expect("metrics")
        .expect("present");
    assert_eq!(metrics.interactions_by_type["gap_analysis"].total, 5);

    let err = service
        .submit_feedback(
            &thread_id,
            FeedbackRequest {
                success: true,
                feedback_score: Some(7.0),
                interaction_type: None,
            },
        )
        .expect_err("score out of range");
    assert!(matches!(err, OrchestratorError::Trust(_)));

    let events = EventLog::for_state_root(dir.path())
        .read_events()
        .expect("events");
    assert!(events
        .iter()
        .any(|event| event["event"] == "trust_notification"));
}

#[test]
fn generated_thread_ids_and_unknown_threads() {
    let (service, _dir) = service();
    let response = service
        .start_workflow(StartWorkflowRequest {
            thread_id: None,
            workflow_type: WorkflowType::parse("gap_analysis").expect("type"),
            user_id: UserId::parse("analyst-3").expect("user"),
            input: Value::Null,
        })
        .expect("start");
    assert!(response.thread_id.as_str().starts_with("thr-"));
    assert_eq!(response.status, WorkflowStatus::Completed);

    let missing = ThreadId::parse("t-missing").expect("thread id");
    assert!(matches!(
        service.get_status(&missing),
        Err(OrchestratorError::NotFound { .. })
    ));
    assert!(matches!(
        service.start_workflow(StartWorkflowRequest {
            thread_id: Some(missing),
            workflow_type: WorkflowType::parse("unknown").expect("type"),
            user_id: UserId::parse("analyst-3").expect("user"),
            input: Value::Null,
        }),
        Err(OrchestratorError::UnknownWorkflowType { .. })
    ));
}
