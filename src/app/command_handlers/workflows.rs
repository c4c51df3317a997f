use crate::app::command_support::{map_orchestrator_err, parse_json_arg, to_pretty_json};
use crate::orchestration::service::{ApprovalRequest, StartWorkflowRequest, WorkflowService};
use crate::shared::ids::{ThreadId, UserId, WorkflowType};
use serde_json::Value;

const DEFAULT_HISTORY_LIMIT: usize = 20;

fn thread_arg(args: &[String], usage: &str) -> Result<ThreadId, String> {
    let raw = args.first().ok_or_else(|| usage.to_string())?;
    ThreadId::parse(raw)
}

pub fn cmd_start(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: start <workflow> <user> [input-json] [thread-id]";
    if args.len() < 2 || args.len() > 4 {
        return Err(USAGE.to_string());
    }
    let input = match args.get(2) {
        Some(raw) => parse_json_arg(raw, "input")?,
        None => Value::Null,
    };
    let thread_id = args.get(3).map(|raw| ThreadId::parse(raw)).transpose()?;
    let response = service
        .start_workflow(StartWorkflowRequest {
            thread_id,
            workflow_type: WorkflowType::parse(&args[0])?,
            user_id: UserId::parse(&args[1])?,
            input,
        })
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_resume(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: resume <thread> [input-json]";
    if args.is_empty() || args.len() > 2 {
        return Err(USAGE.to_string());
    }
    let thread_id = thread_arg(args, USAGE)?;
    let input = args
        .get(1)
        .map(|raw| parse_json_arg(raw, "input"))
        .transpose()?;
    let response = service
        .resume_workflow(&thread_id, input)
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_status(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: status <thread>";
    if args.len() != 1 {
        return Err(USAGE.to_string());
    }
    let thread_id = thread_arg(args, USAGE)?;
    let response = service.get_status(&thread_id).map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_approve(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: approve <thread> [input-json]";
    if args.is_empty() || args.len() > 2 {
        return Err(USAGE.to_string());
    }
    let thread_id = thread_arg(args, USAGE)?;
    let input = args
        .get(1)
        .map(|raw| parse_json_arg(raw, "input"))
        .transpose()?;
    let response = service
        .submit_approval(&thread_id, ApprovalRequest::Approve { input })
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_reject(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: reject <thread> <reason>";
    if args.len() < 2 {
        return Err(USAGE.to_string());
    }
    let thread_id = thread_arg(args, USAGE)?;
    let reason = args[1..].join(" ");
    if reason.trim().is_empty() {
        return Err("rejection reason must be non-empty".to_string());
    }
    let response = service
        .submit_approval(&thread_id, ApprovalRequest::Reject { reason })
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_cancel(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: cancel <thread>";
    if args.len() != 1 {
        return Err(USAGE.to_string());
    }
    let thread_id = thread_arg(args, USAGE)?;
    let response = service
        .cancel_workflow(&thread_id)
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&response)
}

pub fn cmd_history(service: &WorkflowService, args: &[String]) -> Result<String, String> {
    const USAGE: &str = "usage: history <thread> [limit]";
    if args.is_empty() || args.len() > 2 {
        return Err(USAGE.to_string());
    }
    let thread_id = thread_arg(args, USAGE)?;
    let limit = match args.get(1) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| format!("limit must be a positive integer, got `{raw}`"))?,
        None => DEFAULT_HISTORY_LIMIT,
    };
    let history = service
        .checkpoint_history(&thread_id, limit)
        .map_err(map_orchestrator_err)?;
    to_pretty_json(&history)
}
