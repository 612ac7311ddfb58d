use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::config::LoadOptions;
use cadence_core::domain::campaign::{CampaignId, Channel};
use cadence_core::domain::conversation::{ConversationContext, ConversationMessage, Direction};
use cadence_core::domain::lead::{Lead, LeadId};
use cadence_core::dossier::{Dossier, DossierBuilder};
use cadence_core::handover::{HandoverCriteria, HandoverDecision, HandoverEvaluator};

use crate::commands::{load_config, load_playbook, read_json, to_data, CommandResult};

/// Lead snapshot accepted by `cadence evaluate`.
#[derive(Debug, Deserialize)]
struct EvaluateInput {
    lead_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    qualification_score: u8,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    goal_progress: BTreeMap<String, bool>,
    #[serde(default)]
    conversation: Vec<ConversationEntry>,
    /// Campaign whose criteria apply; ignored when `criteria` is given.
    #[serde(default)]
    campaign: Option<String>,
    #[serde(default)]
    revision: Option<u32>,
    #[serde(default)]
    criteria: Option<HandoverCriteria>,
    #[serde(default)]
    enrolled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    now: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ConversationEntry {
    direction: Direction,
    #[serde(default = "default_channel")]
    channel: Channel,
    body: String,
    sent_at: DateTime<Utc>,
}

fn default_channel() -> Channel {
    Channel::Email
}

#[derive(Debug, Serialize)]
struct Evaluation {
    decision: HandoverDecision,
    dossier: Option<Dossier>,
    rendered: Option<String>,
    dossier_error: Option<String>,
}

pub fn run(options: &LoadOptions, input_path: &Path) -> CommandResult {
    evaluate(options, input_path).unwrap_or_else(|failure| failure)
}

fn evaluate(options: &LoadOptions, input_path: &Path) -> Result<CommandResult, CommandResult> {
    let input: EvaluateInput = read_json("evaluate", input_path)?;
    let now = input.now.unwrap_or_else(Utc::now);
    let criteria = match &input.criteria {
        Some(criteria) => criteria.clone(),
        None => {
            let config = load_config("evaluate", options)?;
            let playbook = load_playbook("evaluate", &config)?;
            criteria_from_playbook(&playbook, input.campaign.as_deref(), input.revision)
        }
    };
    criteria
        .validate()
        .map_err(|error| CommandResult::failure("evaluate", "validation", error.to_string(), 4))?;

    let lead_id = LeadId(input.lead_id.clone());
    let mut lead = Lead::new(lead_id.clone(), input.email.clone(), input.phone.clone(), now)
        .map_err(|error| CommandResult::failure("evaluate", "validation", error.to_string(), 4))?;
    lead.name = input.name.clone();
    lead.notes = input.notes.clone();
    lead.add_tags(&input.tags);
    lead.goal_progress = input.goal_progress.clone();
    lead.set_qualification_score(input.qualification_score, now)
        .map_err(|error| CommandResult::failure("evaluate", "validation", error.to_string(), 4))?;

    let history: Vec<ConversationMessage> = input
        .conversation
        .iter()
        .map(|entry| ConversationMessage {
            lead_id: lead_id.clone(),
            direction: entry.direction,
            channel: entry.channel,
            body: entry.body.clone(),
            sent_at: entry.sent_at,
        })
        .collect();
    let mut context = ConversationContext::from_history(&history);
    if let Some(enrolled_at) = input.enrolled_at {
        context = context.anchored_at(enrolled_at);
    }

    let decision = HandoverEvaluator::new().evaluate(&lead, &context, &criteria, now);
    let mut evaluation =
        Evaluation { decision: decision.clone(), dossier: None, rendered: None, dossier_error: None };
    if decision.should_handover {
        match DossierBuilder::new().build(&lead, &decision, &history, now) {
            Ok(dossier) => {
                let dossier = dossier.with_recipients(criteria.recipients_by_priority());
                evaluation.rendered = Some(dossier.render_text());
                evaluation.dossier = Some(dossier);
            }
            Err(error) => evaluation.dossier_error = Some(error.to_string()),
        }
    }

    Ok(CommandResult::success_with_data("evaluate", decision.reason, to_data(&evaluation)))
}

fn criteria_from_playbook(
    playbook: &cadence_core::playbook::Playbook,
    campaign: Option<&str>,
    revision: Option<u32>,
) -> HandoverCriteria {
    let Some(campaign) = campaign else {
        return playbook.default_handover.clone();
    };
    let id = CampaignId(campaign.to_string());
    let found = match revision {
        Some(revision) => playbook.campaigns.get(&id, revision),
        None => playbook.campaigns.latest(&id),
    };
    found.map(|campaign| campaign.handover.clone()).unwrap_or_else(|| playbook.default_handover.clone())
}
