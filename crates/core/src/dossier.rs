use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::campaign::Channel;
use crate::domain::conversation::{ConversationMessage, Direction};
use crate::domain::lead::{Lead, LeadId, LeadStatus};
use crate::errors::DossierBuildError;
use crate::handover::{HandoverDecision, HandoverRecipient, UrgencyTier};

const TOPIC_CATEGORIES: &[(&str, &[&str])] = &[
    ("pricing", &["price", "pricing", "cost", "quote", "discount", "msrp"]),
    ("financing", &["financing", "finance", "loan", "monthly payment", "apr", "lease", "credit"]),
    ("trade_in", &["trade-in", "trade in", "trading in"]),
    ("test_drive", &["test drive", "test-drive"]),
    ("availability", &["available", "availability", "in stock", "inventory"]),
    ("features", &["feature", "options", "package", "specs", "trim"]),
    ("warranty", &["warranty", "coverage", "service plan"]),
];

const POSITIVE_WORDS: &[&str] = &[
    "great", "interested", "love", "excellent", "thanks", "thank", "perfect", "ready", "excited",
    "good", "yes",
];

const NEGATIVE_WORDS: &[&str] = &[
    "expensive", "disappointed", "unhappy", "problem", "cancel", "frustrated", "bad", "worse",
    "unfortunately", "no", "not",
];

const FALLBACK_NEXT_STEPS: &[&str] = &[
    "Review the lead profile and full conversation",
    "Contact the lead within one business day",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub id: LeadId,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub qualification_score: u8,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub priority: Option<String>,
    pub notes: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerExplanation {
    pub reason: String,
    pub triggered_criteria: Vec<String>,
    pub matched_keywords: Vec<String>,
    pub score: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub message_count: usize,
    pub inbound_count: usize,
    pub outbound_count: usize,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub topics: Vec<String>,
    pub sentiment: Sentiment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: UrgencyTier,
    pub next_steps: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChannelContext {
    pub channels: Vec<Channel>,
    pub goal_progress: BTreeMap<String, bool>,
}

/// Structured handoff artifact for the human who takes over a lead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dossier {
    pub lead: LeadSnapshot,
    pub trigger: TriggerExplanation,
    pub conversation: ConversationSummary,
    pub recommendation: Recommendation,
    pub cross_channel: CrossChannelContext,
    pub recipients: Vec<HandoverRecipient>,
    pub generated_at: DateTime<Utc>,
}

impl Dossier {
    pub fn with_recipients(mut self, recipients: Vec<HandoverRecipient>) -> Self {
        self.recipients = recipients;
        self
    }

    /// Plain-text rendering; identical dossiers render identically.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let lead = &self.lead;
        let _ = writeln!(out, "HANDOVER DOSSIER: {}", lead.name.as_deref().unwrap_or(&lead.id.0));
        let _ = writeln!(out, "Generated: {}", timestamp(self.generated_at));
        let _ = writeln!(out, "Priority: {}", self.recommendation.priority.as_str());
        out.push('\n');

        let _ = writeln!(out, "Lead");
        let _ = writeln!(out, "  id: {}", lead.id.0);
        if let Some(email) = &lead.email {
            let _ = writeln!(out, "  email: {email}");
        }
        if let Some(phone) = &lead.phone {
            let _ = writeln!(out, "  phone: {phone}");
        }
        let _ = writeln!(out, "  status: {}", lead.status.as_str());
        let _ = writeln!(out, "  qualification: {}/10", lead.qualification_score);
        if !lead.tags.is_empty() {
            let _ = writeln!(out, "  tags: {}", lead.tags.join(", "));
        }
        if let Some(source) = &lead.source {
            let _ = writeln!(out, "  source: {source}");
        }
        if !lead.notes.is_empty() {
            let _ = writeln!(out, "  notes: {}", lead.notes.replace('\n', " / "));
        }
        out.push('\n');

        let _ = writeln!(out, "Why now");
        let _ = writeln!(out, "  {}", self.trigger.reason);
        let _ = writeln!(out, "  checks: {}", self.trigger.triggered_criteria.join(", "));
        if !self.trigger.matched_keywords.is_empty() {
            let _ = writeln!(out, "  keywords: {}", self.trigger.matched_keywords.join(", "));
        }
        out.push('\n');

        let conversation = &self.conversation;
        let _ = writeln!(out, "Conversation");
        let _ = writeln!(
            out,
            "  messages: {} ({} inbound, {} outbound)",
            conversation.message_count, conversation.inbound_count, conversation.outbound_count
        );
        let _ = writeln!(
            out,
            "  last activity: {}",
            conversation.last_activity_at.map(timestamp).unwrap_or_else(|| "none".to_string())
        );
        let topics =
            if conversation.topics.is_empty() { "none".to_string() } else { conversation.topics.join(", ") };
        let _ = writeln!(out, "  topics: {topics}");
        let _ = writeln!(out, "  sentiment: {}", conversation.sentiment.as_str());
        let channels: Vec<&str> = self.cross_channel.channels.iter().map(Channel::as_str).collect();
        let channels = if channels.is_empty() { "none".to_string() } else { channels.join(", ") };
        let _ = writeln!(out, "  channels: {channels}");
        if !self.cross_channel.goal_progress.is_empty() {
            let goals: Vec<String> = self
                .cross_channel
                .goal_progress
                .iter()
                .map(|(goal, done)| format!("{goal}={}", if *done { "done" } else { "open" }))
                .collect();
            let _ = writeln!(out, "  goals: {}", goals.join(", "));
        }
        out.push('\n');

        let _ = writeln!(out, "Next steps");
        for (index, step) in self.recommendation.next_steps.iter().enumerate() {
            let _ = writeln!(out, "  {}. {step}", index + 1);
        }

        if !self.recipients.is_empty() {
            out.push('\n');
            let _ = writeln!(out, "Recipients");
            for recipient in &self.recipients {
                let _ = writeln!(
                    out,
                    "  [{}] {} <{}>",
                    recipient.priority, recipient.name, recipient.contact
                );
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DossierBuilder;

impl DossierBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Builds the artifact or fails as a whole; no partial dossier is returned.
    pub fn build(
        &self,
        lead: &Lead,
        decision: &HandoverDecision,
        history: &[ConversationMessage],
        now: DateTime<Utc>,
    ) -> Result<Dossier, DossierBuildError> {
        if !decision.should_handover {
            return Err(DossierBuildError::NotEscalated(lead.id.clone()));
        }
        if lead.contact().is_none() {
            return Err(DossierBuildError::LeadIncomplete { lead_id: lead.id.clone() });
        }
        if let Some(foreign) = history.iter().find(|message| message.lead_id != lead.id) {
            return Err(DossierBuildError::ConversationMismatch {
                expected: lead.id.clone(),
                found: foreign.lead_id.clone(),
            });
        }

        let mut ordered: Vec<&ConversationMessage> = history.iter().collect();
        ordered.sort_by_key(|message| message.sent_at);
        let text = ordered
            .iter()
            .map(|message| message.body.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");

        let inbound_count =
            history.iter().filter(|message| message.direction == Direction::Inbound).count();
        let mut channels: Vec<Channel> = Vec::new();
        for message in &ordered {
            if !channels.contains(&message.channel) {
                channels.push(message.channel);
            }
        }

        let next_steps = if decision.next_actions.is_empty() {
            FALLBACK_NEXT_STEPS.iter().map(|step| step.to_string()).collect()
        } else {
            decision.next_actions.clone()
        };

        Ok(Dossier {
            lead: LeadSnapshot {
                id: lead.id.clone(),
                name: lead.name.clone(),
                email: lead.email.clone(),
                phone: lead.phone.clone(),
                status: lead.status,
                qualification_score: lead.qualification_score,
                tags: lead.tags.iter().cloned().collect(),
                source: lead.source.clone(),
                priority: lead.priority.clone(),
                notes: lead.notes.clone(),
            },
            trigger: TriggerExplanation {
                reason: decision.reason.clone(),
                triggered_criteria: decision
                    .triggered_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                matched_keywords: decision.matched_keywords.clone(),
                score: decision.score,
            },
            conversation: ConversationSummary {
                message_count: history.len(),
                inbound_count,
                outbound_count: history.len() - inbound_count,
                last_activity_at: ordered.last().map(|message| message.sent_at),
                topics: extract_topics(&text),
                sentiment: score_sentiment(&text),
            },
            recommendation: Recommendation { priority: decision.urgency, next_steps },
            cross_channel: CrossChannelContext { channels, goal_progress: lead.goal_progress.clone() },
            recipients: Vec::new(),
            generated_at: now,
        })
    }
}

/// Topic categories mentioned anywhere in `text`, in category order.
pub fn extract_topics(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    TOPIC_CATEGORIES
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|keyword| text.contains(keyword)))
        .map(|(topic, _)| topic.to_string())
        .collect()
}

/// Word-count sentiment; a tie (including no signal at all) is neutral.
pub fn score_sentiment(text: &str) -> Sentiment {
    let text = text.to_lowercase();
    let words: Vec<&str> =
        text.split(|ch: char| !ch.is_alphanumeric()).filter(|word| !word.is_empty()).collect();
    let positive: BTreeSet<&str> = POSITIVE_WORDS.iter().copied().collect();
    let negative: BTreeSet<&str> = NEGATIVE_WORDS.iter().copied().collect();

    let positives = words.iter().filter(|word| positive.contains(*word)).count();
    let negatives = words.iter().filter(|word| negative.contains(*word)).count();
    match positives.cmp(&negatives) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}
