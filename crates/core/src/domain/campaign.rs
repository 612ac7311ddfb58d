use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::handover::HandoverCriteria;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CampaignId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Chat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Chat => "chat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }
}

/// Wait between the previous touch and this one, stored in whole minutes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TouchDelay {
    minutes: u64,
}

const MINUTES_PER_HOUR: u64 = 60;
const MINUTES_PER_DAY: u64 = 24 * MINUTES_PER_HOUR;
// chrono::Duration panics past i64 milliseconds; cap well below that.
const MAX_DELAY_MINUTES: u64 = 100 * 365 * MINUTES_PER_DAY;

impl TouchDelay {
    pub const IMMEDIATE: Self = Self { minutes: 0 };

    pub fn from_minutes(minutes: u64) -> Result<Self, ValidationError> {
        if minutes > MAX_DELAY_MINUTES {
            return Err(ValidationError::new(
                "touch.delay",
                format!("{minutes} minutes exceeds the supported maximum"),
            ));
        }
        Ok(Self { minutes })
    }

    pub fn hours(hours: u64) -> Result<Self, ValidationError> {
        Self::from_minutes(hours.saturating_mul(MINUTES_PER_HOUR))
    }

    pub fn days(days: u64) -> Result<Self, ValidationError> {
        Self::from_minutes(days.saturating_mul(MINUTES_PER_DAY))
    }

    pub fn minutes(&self) -> u64 {
        self.minutes
    }

    pub fn as_duration(&self) -> Duration {
        // bounded by MAX_DELAY_MINUTES
        Duration::minutes(self.minutes as i64)
    }

    /// Accepts `"0"`, `"90"` (minutes), `"3 days"`, `"2h"`, `"45 minutes"`, `"1 day"`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let value = raw.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(ValidationError::new("touch.delay", "delay must not be empty"));
        }
        if value.starts_with('-') {
            return Err(ValidationError::new(
                "touch.delay",
                format!("`{raw}` is negative; delays must be non-negative"),
            ));
        }

        let digits_end = value.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(value.len());
        let (number, unit) = value.split_at(digits_end);
        let amount = number.parse::<u64>().map_err(|_| {
            ValidationError::new("touch.delay", format!("`{raw}` does not start with a number"))
        })?;

        match unit.trim() {
            "" | "m" | "min" | "mins" | "minute" | "minutes" => Self::from_minutes(amount),
            "h" | "hr" | "hrs" | "hour" | "hours" => Self::hours(amount),
            "d" | "day" | "days" => Self::days(amount),
            other => Err(ValidationError::new(
                "touch.delay",
                format!("unsupported unit `{other}` in `{raw}` (expected minutes|hours|days)"),
            )),
        }
    }
}

impl fmt::Display for TouchDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = self.minutes;
        if minutes > 0 && minutes % MINUTES_PER_DAY == 0 {
            write!(f, "{} days", minutes / MINUTES_PER_DAY)
        } else if minutes > 0 && minutes % MINUTES_PER_HOUR == 0 {
            write!(f, "{} hours", minutes / MINUTES_PER_HOUR)
        } else {
            write!(f, "{minutes} minutes")
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchStep {
    pub template: TemplateId,
    pub delay: TouchDelay,
    /// Overrides the campaign channel for this step.
    pub channel: Option<Channel>,
}

impl TouchStep {
    pub fn new(template: impl Into<String>, delay: TouchDelay) -> Self {
        Self { template: TemplateId(template.into()), delay, channel: None }
    }
}

/// A touch sequence definition. Immutable per revision: edits produce a new
/// revision and in-flight enrollments stay pinned to the one they started on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub revision: u32,
    pub channel: Channel,
    pub steps: Vec<TouchStep>,
    pub handover: HandoverCriteria,
}

impl Campaign {
    pub fn new(
        id: CampaignId,
        name: impl Into<String>,
        revision: u32,
        channel: Channel,
        steps: Vec<TouchStep>,
        handover: HandoverCriteria,
    ) -> Result<Self, ValidationError> {
        let campaign = Self { id, name: name.into(), revision, channel, steps, handover };
        campaign.validate()?;
        Ok(campaign)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.0.trim().is_empty() {
            return Err(ValidationError::new("campaign.id", "must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(ValidationError::new(
                "campaign.steps",
                format!("campaign `{}` must define at least one touch step", self.id.0),
            ));
        }
        if let Some(index) = self.steps.iter().position(|step| step.template.0.trim().is_empty()) {
            return Err(ValidationError::new(
                "campaign.steps.template",
                format!("step {index} of campaign `{}` has no template", self.id.0),
            ));
        }
        self.handover.validate()?;
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, index: usize) -> Option<&TouchStep> {
        self.steps.get(index)
    }

    pub fn channel_for(&self, index: usize) -> Option<Channel> {
        self.step(index).map(|step| step.channel.unwrap_or(self.channel))
    }
}

#[cfg(test)]
mod tests {
    use super::{Campaign, CampaignId, Channel, TouchDelay, TouchStep};
    use crate::handover::HandoverCriteria;

    #[test]
    fn parses_common_delay_spellings() {
        let cases = [
            ("0", 0),
            ("90", 90),
            ("45 minutes", 45),
            ("2h", 120),
            ("1 hour", 60),
            ("3 days", 3 * 1440),
            ("1d", 1440),
            (" 2 Days ", 2 * 1440),
        ];
        for (raw, minutes) in cases {
            let delay = TouchDelay::parse(raw).unwrap_or_else(|error| panic!("{raw}: {error}"));
            assert_eq!(delay.minutes(), minutes, "delay `{raw}`");
        }
    }

    #[test]
    fn rejects_negative_and_unknown_delays() {
        assert!(TouchDelay::parse("-1 day").is_err());
        assert!(TouchDelay::parse("soon").is_err());
        assert!(TouchDelay::parse("3 fortnights").is_err());
        assert!(TouchDelay::parse("").is_err());
    }

    #[test]
    fn delay_display_prefers_largest_whole_unit() {
        assert_eq!(TouchDelay::parse("3 days").expect("delay").to_string(), "3 days");
        assert_eq!(TouchDelay::parse("120").expect("delay").to_string(), "2 hours");
        assert_eq!(TouchDelay::IMMEDIATE.to_string(), "0 minutes");
    }

    #[test]
    fn campaign_requires_steps() {
        let error = Campaign::new(
            CampaignId("empty".to_string()),
            "Empty",
            1,
            Channel::Email,
            Vec::new(),
            HandoverCriteria::default(),
        )
        .expect_err("campaign without steps is invalid");
        assert_eq!(error.field, "campaign.steps");
    }

    #[test]
    fn step_channel_falls_back_to_campaign_channel() {
        let mut sms_step = TouchStep::new("sms-nudge", TouchDelay::IMMEDIATE);
        sms_step.channel = Some(Channel::Sms);
        let campaign = Campaign::new(
            CampaignId("mixed".to_string()),
            "Mixed",
            1,
            Channel::Email,
            vec![TouchStep::new("intro", TouchDelay::IMMEDIATE), sms_step],
            HandoverCriteria::default(),
        )
        .expect("valid campaign");

        assert_eq!(campaign.channel_for(0), Some(Channel::Email));
        assert_eq!(campaign.channel_for(1), Some(Channel::Sms));
        assert_eq!(campaign.channel_for(2), None);
    }
}
