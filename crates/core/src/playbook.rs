//! Campaign definitions, trigger rules and default handover criteria, loaded
//! from a TOML playbook.
//!
//! ```toml
//! [handover]
//! qualification_score = 7
//!
//! [[campaigns]]
//! id = "new-inquiry"
//! name = "New inquiry follow-up"
//! channel = "email"
//! steps = [
//!   { template = "intro", delay = "0" },
//!   { template = "check-in", delay = "3 days" },
//! ]
//!
//! [[rules]]
//! id = "web-form"
//! name = "Website form"
//! conditions = { subject = "new inquiry" }
//! actions = { create_lead = true, campaign = "new-inquiry", tags = ["web"] }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::domain::campaign::{Campaign, CampaignId, Channel, TemplateId, TouchDelay, TouchStep};
use crate::errors::ValidationError;
use crate::handover::HandoverCriteria;
use crate::rules::{MatchMode, RuleActions, RuleConditions, RuleMatcher, TextPattern, TriggerRule};

#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("could not read playbook `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse playbook: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Every revision of every campaign, keyed by `(id, revision)`.
#[derive(Clone, Debug, Default)]
pub struct CampaignCatalog {
    campaigns: BTreeMap<(CampaignId, u32), Campaign>,
}

impl CampaignCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revisions are immutable: re-inserting an existing `(id, revision)` fails.
    pub fn insert(&mut self, campaign: Campaign) -> Result<(), ValidationError> {
        let key = (campaign.id.clone(), campaign.revision);
        if self.campaigns.contains_key(&key) {
            return Err(ValidationError::new(
                "campaigns",
                format!("campaign `{}` revision {} is defined twice", campaign.id.0, campaign.revision),
            ));
        }
        self.campaigns.insert(key, campaign);
        Ok(())
    }

    pub fn get(&self, id: &CampaignId, revision: u32) -> Option<&Campaign> {
        self.campaigns.get(&(id.clone(), revision))
    }

    pub fn latest(&self, id: &CampaignId) -> Option<&Campaign> {
        self.campaigns
            .range((id.clone(), 0)..=(id.clone(), u32::MAX))
            .next_back()
            .map(|(_, campaign)| campaign)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Campaign> {
        self.campaigns.values()
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Playbook {
    pub campaigns: CampaignCatalog,
    pub matcher: RuleMatcher,
    /// Used for leads with no enrollment to take criteria from.
    pub default_handover: HandoverCriteria,
}

impl Playbook {
    pub fn load(path: &Path) -> Result<Self, PlaybookError> {
        Self::load_with_channel(path, Channel::Email)
    }

    /// Campaigns that name no channel of their own use `default_channel`.
    pub fn load_with_channel(path: &Path, default_channel: Channel) -> Result<Self, PlaybookError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| PlaybookError::Read { path: path.to_path_buf(), source })?;
        let playbook = Self::parse(&raw, default_channel)?;
        info!(
            event_name = "playbook.loaded",
            path = %path.display(),
            campaigns = playbook.campaigns.len(),
            rules = playbook.matcher.rules().len(),
            "playbook loaded"
        );
        Ok(playbook)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, PlaybookError> {
        Self::parse(raw, Channel::Email)
    }

    pub fn parse(raw: &str, default_channel: Channel) -> Result<Self, PlaybookError> {
        let document: PlaybookDocument = toml::from_str(raw)?;
        Ok(document.into_playbook(default_channel)?)
    }

    /// Criteria for a campaign revision, falling back to the playbook default.
    pub fn criteria_for(&self, id: &CampaignId, revision: u32) -> &HandoverCriteria {
        self.campaigns
            .get(id, revision)
            .map(|campaign| &campaign.handover)
            .unwrap_or(&self.default_handover)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PlaybookDocument {
    #[serde(default)]
    handover: Option<HandoverCriteria>,
    #[serde(default)]
    campaigns: Vec<CampaignDocument>,
    #[serde(default)]
    rules: Vec<RuleDocument>,
}

#[derive(Debug, Deserialize)]
struct CampaignDocument {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_revision")]
    revision: u32,
    #[serde(default)]
    channel: Option<Channel>,
    #[serde(default)]
    steps: Vec<StepDocument>,
    #[serde(default)]
    handover: Option<HandoverCriteria>,
}

#[derive(Debug, Deserialize)]
struct StepDocument {
    template: String,
    #[serde(default = "immediate")]
    delay: DelayDocument,
    #[serde(default)]
    channel: Option<Channel>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DelayDocument {
    Minutes(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "enabled")]
    enabled: bool,
    #[serde(default)]
    conditions: ConditionsDocument,
    #[serde(default)]
    actions: ActionsDocument,
}

#[derive(Debug, Default, Deserialize)]
struct ConditionsDocument {
    #[serde(default)]
    senders: Vec<PatternDocument>,
    #[serde(default)]
    subject: Option<PatternDocument>,
    #[serde(default)]
    body: Option<PatternDocument>,
    #[serde(default)]
    has_attachment: Option<bool>,
}

/// A bare string is a case-insensitive substring; `{ regex = "..." }` opts into regex.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatternDocument {
    Contains(String),
    Explicit {
        #[serde(default)]
        regex: Option<String>,
        #[serde(default)]
        contains: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct ActionsDocument {
    #[serde(default)]
    create_lead: bool,
    #[serde(default)]
    campaign: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

fn default_revision() -> u32 {
    1
}

fn immediate() -> DelayDocument {
    DelayDocument::Minutes(0)
}

fn enabled() -> bool {
    true
}

impl PlaybookDocument {
    fn into_playbook(self, default_channel: Channel) -> Result<Playbook, ValidationError> {
        let default_handover = self.handover.unwrap_or_else(HandoverCriteria::recommended);
        default_handover.validate()?;

        let mut campaigns = CampaignCatalog::new();
        for document in self.campaigns {
            campaigns.insert(document.into_campaign(&default_handover, default_channel)?)?;
        }

        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for document in self.rules {
            if !seen.insert(document.id.clone()) {
                return Err(ValidationError::new(
                    "rules.id",
                    format!("rule id `{}` is used more than once", document.id),
                ));
            }
            let rule = document.into_rule()?;
            if let Some(campaign) = &rule.actions.campaign {
                if campaigns.latest(campaign).is_none() {
                    return Err(ValidationError::new(
                        "rules.actions.campaign",
                        format!("rule `{}` assigns unknown campaign `{}`", rule.id, campaign.0),
                    ));
                }
            }
            rules.push(rule);
        }

        Ok(Playbook { campaigns, matcher: RuleMatcher::new(rules), default_handover })
    }
}

impl CampaignDocument {
    fn into_campaign(
        self,
        default_handover: &HandoverCriteria,
        default_channel: Channel,
    ) -> Result<Campaign, ValidationError> {
        let steps = self
            .steps
            .into_iter()
            .map(|step| {
                Ok(TouchStep {
                    template: TemplateId(step.template),
                    delay: step.delay.into_delay()?,
                    channel: step.channel,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        let name = self.name.unwrap_or_else(|| self.id.clone());

        Campaign::new(
            CampaignId(self.id),
            name,
            self.revision,
            self.channel.unwrap_or(default_channel),
            steps,
            self.handover.unwrap_or_else(|| default_handover.clone()),
        )
    }
}

impl DelayDocument {
    fn into_delay(self) -> Result<TouchDelay, ValidationError> {
        match self {
            Self::Minutes(minutes) => {
                let minutes = u64::try_from(minutes).map_err(|_| {
                    ValidationError::new(
                        "touch.delay",
                        format!("`{minutes}` is negative; delays must be non-negative"),
                    )
                })?;
                TouchDelay::from_minutes(minutes)
            }
            Self::Text(raw) => TouchDelay::parse(&raw),
        }
    }
}

impl RuleDocument {
    fn into_rule(self) -> Result<TriggerRule, ValidationError> {
        let conditions = RuleConditions {
            senders: self
                .conditions
                .senders
                .into_iter()
                .map(PatternDocument::into_pattern)
                .collect::<Result<Vec<_>, _>>()?,
            subject: self.conditions.subject.map(PatternDocument::into_pattern).transpose()?,
            body: self.conditions.body.map(PatternDocument::into_pattern).transpose()?,
            has_attachment: self.conditions.has_attachment,
        };
        let actions = RuleActions {
            create_lead: self.actions.create_lead,
            campaign: self.actions.campaign.map(CampaignId),
            tags: self.actions.tags,
            source: self.actions.source,
            priority: self.actions.priority,
        };
        let name = self.name.unwrap_or_else(|| self.id.clone());

        Ok(TriggerRule { id: self.id, name, enabled: self.enabled, conditions, actions })
    }
}

impl PatternDocument {
    fn into_pattern(self) -> Result<TextPattern, ValidationError> {
        match self {
            Self::Contains(needle) => TextPattern::new(MatchMode::Contains, needle),
            Self::Explicit { regex: Some(pattern), contains: None } => {
                TextPattern::new(MatchMode::Regex, pattern)
            }
            Self::Explicit { regex: None, contains: Some(needle) } => {
                TextPattern::new(MatchMode::Contains, needle)
            }
            Self::Explicit { .. } => Err(ValidationError::new(
                "rules.conditions",
                "a pattern needs exactly one of `regex` or `contains`",
            )),
        }
    }
}
