#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Start,
    Resume,
    Status,
    Approve,
    Reject,
    Feedback,
    Cancel,
    History,
    Trust,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "start" => CliVerb::Start,
        "resume" => CliVerb::Resume,
        "status" => CliVerb::Status,
        "approve" => CliVerb::Approve,
        "reject" => CliVerb::Reject,
        "feedback" => CliVerb::Feedback,
        "cancel" => CliVerb::Cancel,
        "history" => CliVerb::History,
        "trust" => CliVerb::Trust,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: complyflow <settings.yaml> <command> [args]".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  start <workflow> <user> [input-json] [thread-id]   Start a workflow run".to_string(),
        "  resume <thread> [input-json]                       Continue an in-progress run"
            .to_string(),
        "  status <thread>                                    Show run status".to_string(),
        "  approve <thread> [input-json]                      Approve a pending review"
            .to_string(),
        "  reject <thread> <reason>                           Reject a pending review".to_string(),
        "  feedback <thread> <success|failure> [score] [type] Record an outcome for trust"
            .to_string(),
        "  cancel <thread>                                    Cancel a run".to_string(),
        "  history <thread> [limit]                           List checkpoint records".to_string(),
        "  trust <user>                                       Show trust metrics for a user"
            .to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_command_parses_to_a_verb() {
        for line in cli_help_lines().iter().filter(|line| line.starts_with("  ")) {
            let command = line.split_whitespace().next().expect("command");
            assert_ne!(parse_cli_verb(command), CliVerb::Unknown, "{command}");
        }
        assert_eq!(parse_cli_verb("setup"), CliVerb::Unknown);
    }
}
