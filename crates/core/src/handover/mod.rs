pub mod evaluator;

pub use evaluator::{HandoverEvaluator, HIGH_URGENCY_SCORE, MEDIUM_URGENCY_SCORE};

use serde::{Deserialize, Serialize};

use crate::domain::lead::MAX_QUALIFICATION_SCORE;
use crate::errors::ValidationError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverRecipient {
    pub name: String,
    pub contact: String,
    /// Lower numbers are notified first.
    #[serde(default)]
    pub priority: u8,
}

/// Thresholds that escalate a lead to a human. `None` disables a numeric
/// check, and an empty keyword or goal list disables that check. The score
/// threshold is capped at the top score, so `None` is the only way to turn the
/// score check off.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverCriteria {
    #[serde(default)]
    pub qualification_score: Option<u8>,
    #[serde(default)]
    pub conversation_length: Option<u32>,
    #[serde(default)]
    pub time_threshold_minutes: Option<u32>,
    #[serde(default)]
    pub keyword_triggers: Vec<String>,
    #[serde(default)]
    pub goal_completion_required: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<HandoverRecipient>,
}

impl HandoverCriteria {
    /// Every check disabled; handover only happens when a person asks for it.
    pub fn manual_only() -> Self {
        Self::default()
    }

    /// Defaults used when a campaign carries no criteria of its own.
    pub fn recommended() -> Self {
        Self {
            qualification_score: Some(7),
            conversation_length: Some(5),
            time_threshold_minutes: Some(30 * 24 * 60),
            keyword_triggers: vec![
                "speak to a human".to_string(),
                "call me".to_string(),
                "test drive".to_string(),
                "ready to buy".to_string(),
            ],
            goal_completion_required: Vec::new(),
            recipients: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(score) = self.qualification_score {
            if score > MAX_QUALIFICATION_SCORE {
                return Err(ValidationError::new(
                    "handover.qualification_score",
                    format!("{score} is outside 0..={MAX_QUALIFICATION_SCORE}"),
                ));
            }
        }
        if self.keyword_triggers.iter().any(|keyword| keyword.trim().is_empty()) {
            return Err(ValidationError::new(
                "handover.keyword_triggers",
                "keywords must not be blank",
            ));
        }
        if self.goal_completion_required.iter().any(|goal| goal.trim().is_empty()) {
            return Err(ValidationError::new(
                "handover.goal_completion_required",
                "goal names must not be blank",
            ));
        }
        if let Some(recipient) =
            self.recipients.iter().find(|recipient| recipient.contact.trim().is_empty())
        {
            return Err(ValidationError::new(
                "handover.recipients",
                format!("recipient `{}` has no contact", recipient.name),
            ));
        }
        Ok(())
    }

    pub fn recipients_by_priority(&self) -> Vec<HandoverRecipient> {
        let mut recipients = self.recipients.clone();
        recipients.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        recipients
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverCheck {
    Score,
    Length,
    Time,
    Keyword,
    Goal,
}

impl HandoverCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::Length => "length",
            Self::Time => "time",
            Self::Keyword => "keyword",
            Self::Goal => "goal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
    Low,
    Medium,
    High,
}

impl UrgencyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Outcome of one evaluation. Not persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverDecision {
    pub should_handover: bool,
    pub reason: String,
    pub score: u8,
    pub triggered_criteria: Vec<HandoverCheck>,
    pub matched_keywords: Vec<String>,
    pub urgency: UrgencyTier,
    pub next_actions: Vec<String>,
}

impl HandoverDecision {
    pub fn triggered_names(&self) -> Vec<&'static str> {
        self.triggered_criteria.iter().map(HandoverCheck::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{HandoverCriteria, HandoverRecipient};

    #[test]
    fn rejects_out_of_range_score_threshold() {
        let criteria =
            HandoverCriteria { qualification_score: Some(11), ..HandoverCriteria::default() };
        assert_eq!(
            criteria.validate().expect_err("score above 10").field,
            "handover.qualification_score"
        );
    }

    #[test]
    fn rejects_blank_keywords_and_contactless_recipients() {
        let blank = HandoverCriteria {
            keyword_triggers: vec!["  ".to_string()],
            ..HandoverCriteria::default()
        };
        assert!(blank.validate().is_err());

        let recipient = HandoverCriteria {
            recipients: vec![HandoverRecipient {
                name: "Sales desk".to_string(),
                contact: String::new(),
                priority: 1,
            }],
            ..HandoverCriteria::default()
        };
        assert!(recipient.validate().is_err());
        assert!(HandoverCriteria::recommended().validate().is_ok());
    }

    #[test]
    fn recipients_sort_by_priority_then_name() {
        let criteria = HandoverCriteria {
            recipients: vec![
                HandoverRecipient { name: "Zed".into(), contact: "z@d.io".into(), priority: 2 },
                HandoverRecipient { name: "Bea".into(), contact: "b@d.io".into(), priority: 1 },
                HandoverRecipient { name: "Al".into(), contact: "a@d.io".into(), priority: 2 },
            ],
            ..HandoverCriteria::default()
        };
        let names: Vec<_> =
            criteria.recipients_by_priority().into_iter().map(|recipient| recipient.name).collect();
        assert_eq!(names, vec!["Bea", "Al", "Zed"]);
    }
}
