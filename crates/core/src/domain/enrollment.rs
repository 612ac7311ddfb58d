use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::campaign::CampaignId;
use crate::domain::lead::LeadId;
use crate::errors::EnrollmentError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnrollmentId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    HandedOver,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::HandedOver => "handed_over",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "handed_over" => Some(Self::HandedOver),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::HandedOver)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub lead_id: LeadId,
    pub campaign_id: CampaignId,
    pub campaign_revision: u32,
    /// Index of the next step to send; equals the step count once exhausted.
    pub current_step: usize,
    pub status: EnrollmentStatus,
    /// Anchor for every due-time computation.
    pub started_at: DateTime<Utc>,
    pub last_touch_at: Option<DateTime<Utc>>,
    pub next_touch_due: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn can_transition_to(&self, next: EnrollmentStatus) -> bool {
        matches!(
            (self.status, next),
            (EnrollmentStatus::Active, EnrollmentStatus::Paused)
                | (EnrollmentStatus::Paused, EnrollmentStatus::Active)
                | (EnrollmentStatus::Active, EnrollmentStatus::Completed)
                | (EnrollmentStatus::Active, EnrollmentStatus::HandedOver)
        )
    }

    pub fn transition_to(
        &mut self,
        next: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EnrollmentError> {
        if !self.can_transition_to(next) {
            return Err(EnrollmentError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.next_touch_due = None;
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.next_touch_due.is_some_and(|due| due <= now)
    }
}
