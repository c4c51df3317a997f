use crate::app::cli::{help_text, parse_cli_verb, CliVerb};
use crate::app::command_support::build_runtime;
use std::path::Path;

pub mod trust;
pub mod workflows;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.len() < 2 || matches!(args[0].as_str(), "help" | "--help" | "-h") {
        return Ok(help_text());
    }

    let verb = parse_cli_verb(args[1].as_str());
    if verb == CliVerb::Unknown {
        return Err(format!("unknown command `{}`", args[1]));
    }
    let runtime = build_runtime(Path::new(&args[0]))?;
    let service = &runtime.service;
    let rest = &args[2..];

    match verb {
        CliVerb::Start => workflows::cmd_start(service, rest),
        CliVerb::Resume => workflows::cmd_resume(service, rest),
        CliVerb::Status => workflows::cmd_status(service, rest),
        CliVerb::Approve => workflows::cmd_approve(service, rest),
        CliVerb::Reject => workflows::cmd_reject(service, rest),
        CliVerb::Cancel => workflows::cmd_cancel(service, rest),
        CliVerb::History => workflows::cmd_history(service, rest),
        CliVerb::Feedback => trust::cmd_feedback(service, rest),
        CliVerb::Trust => trust::cmd_trust(service, rest),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[1])),
    }
}
