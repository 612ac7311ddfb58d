use chrono::{DateTime, Utc};

use cadence_core::config::LoadOptions;
use cadence_core::domain::campaign::CampaignId;
use cadence_core::scheduler;

use crate::commands::{load_config, load_playbook, to_data, CommandResult};

pub fn run(
    options: &LoadOptions,
    campaign_id: &str,
    start: &str,
    revision: Option<u32>,
) -> CommandResult {
    let started_at = match DateTime::parse_from_rfc3339(start) {
        Ok(value) => value.with_timezone(&Utc),
        Err(error) => {
            return CommandResult::failure("schedule", "input", format!("invalid --start `{start}`: {error}"), 4);
        }
    };
    let config = match load_config("schedule", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let playbook = match load_playbook("schedule", &config) {
        Ok(playbook) => playbook,
        Err(failure) => return failure,
    };

    let id = CampaignId(campaign_id.to_string());
    let campaign = match revision {
        Some(revision) => playbook.campaigns.get(&id, revision),
        None => playbook.campaigns.latest(&id),
    };
    let Some(campaign) = campaign else {
        return CommandResult::failure(
            "schedule",
            "unknown_campaign",
            format!("campaign `{campaign_id}` (revision {revision:?}) is not in the playbook"),
            5,
        );
    };

    let timeline = scheduler::timeline(campaign, started_at);
    CommandResult::success_with_data(
        "schedule",
        format!(
            "{} touch(es) for `{}` revision {}",
            timeline.len(),
            campaign.id.0,
            campaign.revision
        ),
        to_data(&timeline),
    )
}
