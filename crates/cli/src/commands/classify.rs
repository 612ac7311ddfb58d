use std::path::Path;

use cadence_core::config::LoadOptions;
use cadence_core::domain::message::InboundMessage;
use cadence_core::rules::Classification;

use crate::commands::{load_config, load_playbook, read_json, to_data, CommandResult};

/// Dry-runs the trigger rules. No lead store is consulted, so every match
/// reports a create or skip directive.
pub fn run(options: &LoadOptions, message_path: &Path) -> CommandResult {
    classify(options, message_path).unwrap_or_else(|failure| failure)
}

fn classify(options: &LoadOptions, message_path: &Path) -> Result<CommandResult, CommandResult> {
    let config = load_config("classify", options)?;
    let playbook = load_playbook("classify", &config)?;
    let message: InboundMessage = read_json("classify", message_path)?;

    if message.is_reply() {
        return Ok(CommandResult::success(
            "classify",
            format!("`{}` is a reply; replies continue a conversation and skip the rules", message.message_id),
        ));
    }

    let classification = playbook.matcher.classify(&message, |_| None);
    let summary = match &classification {
        Classification::Matched(matched) => format!("matched rule `{}`", matched.rule_id),
        Classification::NoMatch => "no rule matched".to_string(),
        Classification::Unparseable { failure } => format!("message could not be parsed: {failure}"),
    };
    Ok(CommandResult::success_with_data("classify", summary, to_data(&classification)))
}
