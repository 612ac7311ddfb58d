use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::campaign::Channel;
use crate::domain::lead::LeadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub lead_id: LeadId,
    pub direction: Direction,
    pub channel: Channel,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn inbound(
        lead_id: LeadId,
        channel: Channel,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self { lead_id, direction: Direction::Inbound, channel, body: body.into(), sent_at }
    }

    pub fn outbound(
        lead_id: LeadId,
        channel: Channel,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self { lead_id, direction: Direction::Outbound, channel, body: body.into(), sent_at }
    }
}

/// Aggregate view of a lead's conversation used by the handover checks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub message_count: u32,
    pub first_contact_at: Option<DateTime<Utc>>,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Every message body joined with newlines, oldest first.
    pub text: String,
}

impl ConversationContext {
    pub fn from_history(history: &[ConversationMessage]) -> Self {
        let message_count = u32::try_from(history.len()).unwrap_or(u32::MAX);
        let first_contact_at = history.iter().map(|message| message.sent_at).min();
        let last_activity_at = history.iter().map(|message| message.sent_at).max();
        let last_inbound_at = history
            .iter()
            .filter(|message| message.direction == Direction::Inbound)
            .map(|message| message.sent_at)
            .max();

        let mut ordered: Vec<&ConversationMessage> = history.iter().collect();
        ordered.sort_by_key(|message| message.sent_at);
        let text = ordered.iter().map(|message| message.body.as_str()).collect::<Vec<_>>().join("\n");

        Self { message_count, first_contact_at, last_inbound_at, last_activity_at, text }
    }

    /// Moves the first-contact anchor earlier, e.g. to the enrollment start.
    pub fn anchored_at(mut self, anchor: DateTime<Utc>) -> Self {
        self.first_contact_at = Some(match self.first_contact_at {
            Some(existing) => existing.min(anchor),
            None => anchor,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{ConversationContext, ConversationMessage};
    use crate::domain::campaign::Channel;
    use crate::domain::lead::LeadId;

    #[test]
    fn context_summarizes_history_in_time_order() {
        let t0 = Utc::now();
        let lead = LeadId("L-1".to_string());
        let history = vec![
            ConversationMessage::inbound(lead.clone(), Channel::Email, "second", t0 + Duration::minutes(5)),
            ConversationMessage::outbound(lead.clone(), Channel::Email, "first", t0),
            ConversationMessage::outbound(lead, Channel::Sms, "third", t0 + Duration::minutes(9)),
        ];

        let context = ConversationContext::from_history(&history);

        assert_eq!(context.message_count, 3);
        assert_eq!(context.first_contact_at, Some(t0));
        assert_eq!(context.last_inbound_at, Some(t0 + Duration::minutes(5)));
        assert_eq!(context.last_activity_at, Some(t0 + Duration::minutes(9)));
        assert_eq!(context.text, "first\nsecond\nthird");
    }

    #[test]
    fn anchor_only_moves_first_contact_earlier() {
        let t0 = Utc::now();
        let context = ConversationContext::from_history(&[ConversationMessage::inbound(
            LeadId("L-1".to_string()),
            Channel::Email,
            "hi",
            t0,
        )]);

        let earlier = context.clone().anchored_at(t0 - Duration::hours(1));
        assert_eq!(earlier.first_contact_at, Some(t0 - Duration::hours(1)));

        let later = context.anchored_at(t0 + Duration::hours(1));
        assert_eq!(later.first_contact_at, Some(t0));
    }

    #[test]
    fn empty_history_has_no_anchor() {
        let context = ConversationContext::from_history(&[]);
        assert_eq!(context.message_count, 0);
        assert_eq!(context.first_contact_at, None);
        assert!(context.text.is_empty());
    }
}
