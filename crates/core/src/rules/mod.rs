//! Trigger rules for inbound email.
//!
//! Rules are evaluated in list order and the first enabled rule whose every
//! specified condition matches wins. The matcher never reorders rules, so a
//! rule with no conditions acts as a catch-all and belongs at the end.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::campaign::CampaignId;
use crate::domain::lead::LeadId;
use crate::domain::message::{InboundMessage, NormalizedMessage};
use crate::errors::{ParseFailure, ValidationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Case-insensitive substring.
    Contains,
    /// Regular expression, compiled as written.
    Regex,
}

#[derive(Clone, Debug)]
pub struct TextPattern {
    mode: MatchMode,
    pattern: String,
    needle: String,
    regex: Option<Regex>,
}

impl TextPattern {
    pub fn contains(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let needle = pattern.to_lowercase();
        Self { mode: MatchMode::Contains, pattern, needle, regex: None }
    }

    pub fn regex(pattern: impl Into<String>) -> Result<Self, ValidationError> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern).map_err(|error| {
            ValidationError::new("rule.pattern", format!("`{pattern}` is not a valid regex: {error}"))
        })?;
        Ok(Self { mode: MatchMode::Regex, needle: String::new(), pattern, regex: Some(regex) })
    }

    pub fn new(mode: MatchMode, pattern: impl Into<String>) -> Result<Self, ValidationError> {
        match mode {
            MatchMode::Contains => Ok(Self::contains(pattern)),
            MatchMode::Regex => Self::regex(pattern),
        }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, value: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(value),
            None => value.to_lowercase().contains(&self.needle),
        }
    }
}

impl PartialEq for TextPattern {
    fn eq(&self, other: &Self) -> bool {
        self.mode == other.mode && self.pattern == other.pattern
    }
}

impl Eq for TextPattern {}

/// Unset conditions are always satisfied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleConditions {
    /// Any one sender pattern matching is enough.
    pub senders: Vec<TextPattern>,
    pub subject: Option<TextPattern>,
    pub body: Option<TextPattern>,
    pub has_attachment: Option<bool>,
}

impl RuleConditions {
    pub fn is_catch_all(&self) -> bool {
        self.senders.is_empty()
            && self.subject.is_none()
            && self.body.is_none()
            && self.has_attachment.is_none()
    }

    pub fn matches(&self, message: &NormalizedMessage) -> bool {
        let sender_ok = self.senders.is_empty()
            || self.senders.iter().any(|pattern| pattern.is_match(&message.sender));
        let subject_ok =
            self.subject.as_ref().map_or(true, |pattern| pattern.is_match(&message.subject));
        let body_ok = self.body.as_ref().map_or(true, |pattern| pattern.is_match(&message.body));
        let attachment_ok =
            self.has_attachment.map_or(true, |expected| expected == message.has_attachment);

        sender_ok && subject_ok && body_ok && attachment_ok
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleActions {
    pub create_lead: bool,
    pub campaign: Option<CampaignId>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub priority: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
}

/// Whether the matched message should create a new lead or update an existing one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "lead_id", rename_all = "snake_case")]
pub enum LeadDirective {
    Create,
    Update(LeadId),
    /// No existing lead and the rule does not create one.
    Skip,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub directive: LeadDirective,
    pub actions: RuleActions,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Classification {
    Matched(RuleMatch),
    NoMatch,
    /// Treated as no match; carries the reason for the caller to report.
    Unparseable { failure: ParseFailure },
}

impl Classification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched(_))
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleMatcher {
    rules: Vec<TriggerRule>,
}

impl RuleMatcher {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        let matcher = Self { rules };
        if let Some(position) = matcher.rules.iter().position(|rule| {
            rule.enabled && rule.conditions.is_catch_all()
        }) {
            if position + 1 < matcher.rules.len() {
                warn!(
                    event_name = "rules.catch_all_not_last",
                    rule_id = %matcher.rules[position].id,
                    shadowed = matcher.rules.len() - position - 1,
                    "catch-all rule shadows the rules after it"
                );
            }
        }
        matcher
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    pub fn first_match(&self, message: &NormalizedMessage) -> Option<&TriggerRule> {
        self.rules.iter().filter(|rule| rule.enabled).find(|rule| rule.conditions.matches(message))
    }

    /// Classifies `message`; `existing_lead` resolves a sender address to a stored lead.
    pub fn classify<F>(&self, message: &InboundMessage, existing_lead: F) -> Classification
    where
        F: FnOnce(&str) -> Option<LeadId>,
    {
        let normalized = match message.normalize() {
            Ok(normalized) => normalized,
            Err(failure) => {
                warn!(
                    event_name = "rules.parse_failure",
                    message_id = %message.message_id,
                    error_class = failure.error_class(),
                    error = %failure,
                    "inbound message could not be parsed; treating as no match"
                );
                return Classification::Unparseable { failure };
            }
        };

        let Some(rule) = self.first_match(&normalized) else {
            debug!(
                event_name = "rules.no_match",
                message_id = %message.message_id,
                sender = %normalized.sender,
                "no trigger rule matched"
            );
            return Classification::NoMatch;
        };

        let directive = match existing_lead(&normalized.sender) {
            Some(lead_id) => LeadDirective::Update(lead_id),
            None if rule.actions.create_lead => LeadDirective::Create,
            None => LeadDirective::Skip,
        };

        debug!(
            event_name = "rules.matched",
            message_id = %message.message_id,
            sender = %normalized.sender,
            rule_id = %rule.id,
            directive = ?directive,
            "trigger rule matched"
        );

        Classification::Matched(RuleMatch {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            sender: normalized.sender,
            sender_name: normalized.sender_name,
            directive,
            actions: rule.actions.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        Classification, LeadDirective, RuleActions, RuleConditions, RuleMatcher, TextPattern,
        TriggerRule,
    };
    use crate::domain::campaign::CampaignId;
    use crate::domain::lead::LeadId;
    use crate::domain::message::InboundMessage;

    fn message(from: &str, subject: &str, body: &str, has_attachment: bool) -> InboundMessage {
        InboundMessage {
            message_id: "<m-1@mail.test>".to_string(),
            from: from.to_string(),
            to: Vec::new(),
            subject: subject.to_string(),
            body_text: body.to_string(),
            has_attachment,
            in_reply_to: None,
            references: Vec::new(),
            received_at: Utc::now(),
        }
    }

    fn rule(id: &str, conditions: RuleConditions, campaign: &str) -> TriggerRule {
        TriggerRule {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            conditions,
            actions: RuleActions {
                create_lead: true,
                campaign: Some(CampaignId(campaign.to_string())),
                ..RuleActions::default()
            },
        }
    }

    fn matched_rule(classification: Classification) -> String {
        match classification {
            Classification::Matched(found) => found.rule_id,
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn first_matching_rule_wins_over_catch_all() {
        let matcher = RuleMatcher::new(vec![
            rule(
                "autotrader",
                RuleConditions {
                    senders: vec![TextPattern::contains("@autotrader.")],
                    ..RuleConditions::default()
                },
                "marketplace",
            ),
            rule("catch-all", RuleConditions::default(), "general"),
        ]);

        let hit = matcher.classify(&message("leads@autotrader.com", "New lead", "Hi", false), |_| None);
        assert_eq!(matched_rule(hit), "autotrader");

        let fallback = matcher.classify(&message("bob@gmail.com", "Question", "Hi", false), |_| None);
        assert_eq!(matched_rule(fallback), "catch-all");
    }

    #[test]
    fn every_specified_condition_must_match() {
        let matcher = RuleMatcher::new(vec![rule(
            "credit-app",
            RuleConditions {
                subject: Some(TextPattern::contains("credit application")),
                has_attachment: Some(true),
                ..RuleConditions::default()
            },
            "finance",
        )]);

        let without_attachment =
            matcher.classify(&message("a@b.io", "Credit Application", "attached", false), |_| None);
        assert_eq!(without_attachment, Classification::NoMatch);

        let with_attachment =
            matcher.classify(&message("a@b.io", "Credit Application", "attached", true), |_| None);
        assert_eq!(matched_rule(with_attachment), "credit-app");
    }

    #[test]
    fn regex_and_literal_patterns_are_supported() {
        let matcher = RuleMatcher::new(vec![rule(
            "vin",
            RuleConditions {
                body: Some(TextPattern::regex(r"(?i)\bvin[:#]?\s*[A-HJ-NPR-Z0-9]{17}\b").expect("regex")),
                ..RuleConditions::default()
            },
            "inventory",
        )]);

        let hit = matcher.classify(
            &message("a@b.io", "Interested", "VIN: 1HGCM82633A004352 please", false),
            |_| None,
        );
        assert_eq!(matched_rule(hit), "vin");

        let miss = matcher.classify(&message("a@b.io", "Interested", "no vehicle id", false), |_| None);
        assert_eq!(miss, Classification::NoMatch);
        assert!(TextPattern::regex("(unclosed").is_err());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut disabled = rule("disabled", RuleConditions::default(), "never");
        disabled.enabled = false;
        let matcher =
            RuleMatcher::new(vec![disabled, rule("enabled", RuleConditions::default(), "general")]);

        let result = matcher.classify(&message("a@b.io", "s", "b", false), |_| None);
        assert_eq!(matched_rule(result), "enabled");
    }

    #[test]
    fn directive_reflects_existing_lead_lookup() {
        let mut no_create = rule("watch", RuleConditions::default(), "general");
        no_create.actions.create_lead = false;
        let matcher = RuleMatcher::new(vec![no_create]);

        let existing = matcher.classify(&message("Known@B.io", "s", "b", false), |sender| {
            (sender == "known@b.io").then(|| LeadId("L-7".to_string()))
        });
        match existing {
            Classification::Matched(found) => {
                assert_eq!(found.directive, LeadDirective::Update(LeadId("L-7".to_string())))
            }
            other => panic!("unexpected {other:?}"),
        }

        let unknown = matcher.classify(&message("new@b.io", "s", "b", false), |_| None);
        match unknown {
            Classification::Matched(found) => assert_eq!(found.directive, LeadDirective::Skip),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unparseable_messages_are_reported_not_thrown() {
        let matcher = RuleMatcher::new(vec![rule("catch-all", RuleConditions::default(), "general")]);
        let result = matcher.classify(&message("not an address", "s", "b", false), |_| None);
        assert!(matches!(result, Classification::Unparseable { .. }));
        assert!(!result.is_match());
    }
}
