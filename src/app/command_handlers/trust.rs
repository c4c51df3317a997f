use crate::app::command_support::{map_orchestrator_err, to_pretty_json};
use crate::orchestration::service::{FeedbackRequest, WorkflowService};
use crate::shared::ids::{ThreadId, UserId};
use serde_json::json;

pub fn cmd_feedback(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    if args.len() < 2 || args.len() > 4 {
        return Err("usage: feedback <thread> <success|failure> [score] [type]".to_string());
    }
    let thread_id = ThreadId::parse(&args[0])?;
    let success = match args[1].as_str() {
        "success" => true,
        "failure" => false,
        other => return Err(format!("outcome must be `success` or `failure`, got `{other}`")),
    };
    let feedback_score = args
        .get(2)
        .map(|raw| {
            raw.parse::<f64>()
                .map_err(|_| format!("score must be a number between 1 and 5, got `{raw}`"))
        })
        .transpose()?;
    let response = service
        .submit_feedback(
            &thread_id,
            FeedbackRequest {
                success,
                feedback_score,
                interaction_type: args.get(3).cloned(),
            },
        )
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_trust(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    if args.len() != 1 {
        return Err("usage: trust <user>".to_string());
    }
    let user_id = UserId::parse(&args[0])?;
    let trust = service.orchestrator().trust();
    let metrics = trust
        .metrics(&user_id)
        .map_err(|e| map_orchestrator_err(e.into()))?;
    let level = service.trust_level(&user_id).map_err(map_orchestrator_err)?;
    to_pretty_json(&json!({
        "userId": user_id,
        "currentLevel": level,
        "metrics": metrics,
    }))
}
