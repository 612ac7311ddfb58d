use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::enrollment::EnrollmentId;
use crate::errors::ValidationError;

pub const MAX_QUALIFICATION_SCORE: u8 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeadId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Rejected,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Qualified => "qualified",
            Self::Converted => "converted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "contacted" => Some(Self::Contacted),
            "qualified" => Some(Self::Qualified),
            "converted" => Some(Self::Converted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: String,
    pub qualification_score: u8,
    /// Metadata tags and interests, kept lowercase.
    pub tags: BTreeSet<String>,
    pub status: LeadStatus,
    pub source: Option<String>,
    pub priority: Option<String>,
    pub goal_progress: BTreeMap<String, bool>,
    /// Most recent enrollment; only one of a lead's enrollments may be active.
    pub enrollment_id: Option<EnrollmentId>,
    pub handed_over_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(
        id: LeadId,
        email: Option<String>,
        phone: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let lead = Self {
            id,
            name: None,
            email: email.map(|value| value.trim().to_ascii_lowercase()),
            phone: phone.map(|value| value.trim().to_string()),
            notes: String::new(),
            qualification_score: 0,
            tags: BTreeSet::new(),
            status: LeadStatus::New,
            source: None,
            priority: None,
            goal_progress: BTreeMap::new(),
            enrollment_id: None,
            handed_over_at: None,
            created_at: now,
            updated_at: now,
        };
        lead.validate()?;
        Ok(lead)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.0.trim().is_empty() {
            return Err(ValidationError::new("lead.id", "must not be empty"));
        }
        if self.contact().is_none() {
            return Err(ValidationError::new(
                "lead.contact",
                "at least one of email or phone is required",
            ));
        }
        if let Some(email) = self.email.as_deref().filter(|value| !value.is_empty()) {
            if !looks_like_email(email) {
                return Err(ValidationError::new(
                    "lead.email",
                    format!("`{email}` is not an email address"),
                ));
            }
        }
        if self.qualification_score > MAX_QUALIFICATION_SCORE {
            return Err(ValidationError::new(
                "lead.qualification_score",
                format!("must be in range 0..={MAX_QUALIFICATION_SCORE}"),
            ));
        }
        Ok(())
    }

    /// Preferred contact: email first, then phone.
    pub fn contact(&self) -> Option<&str> {
        self.email
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.phone.as_deref().filter(|value| !value.trim().is_empty()))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().or_else(|| self.contact()).unwrap_or(self.id.0.as_str())
    }

    pub fn set_qualification_score(
        &mut self,
        score: u8,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if score > MAX_QUALIFICATION_SCORE {
            return Err(ValidationError::new(
                "lead.qualification_score",
                format!("{score} is outside 0..={MAX_QUALIFICATION_SCORE}"),
            ));
        }
        self.qualification_score = score;
        self.updated_at = now;
        Ok(())
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for tag in tags {
            let tag = tag.as_ref().trim().to_ascii_lowercase();
            if !tag.is_empty() {
                self.tags.insert(tag);
            }
        }
    }

    pub fn append_note(&mut self, note: &str) {
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    pub fn is_handed_over(&self) -> bool {
        self.handed_over_at.is_some()
    }
}

pub(crate) fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Lead, LeadId, LeadStatus};

    #[test]
    fn lead_requires_email_or_phone() {
        let error = Lead::new(LeadId("L-1".to_string()), None, None, Utc::now())
            .expect_err("lead without contact should be rejected");
        assert_eq!(error.field, "lead.contact");

        let by_phone =
            Lead::new(LeadId("L-2".to_string()), None, Some("+1 555 0100".to_string()), Utc::now())
                .expect("phone-only lead");
        assert_eq!(by_phone.contact(), Some("+1 555 0100"));
    }

    #[test]
    fn email_is_normalized_and_checked() {
        let lead = Lead::new(
            LeadId("L-3".to_string()),
            Some("  Jane.Doe@Example.COM ".to_string()),
            None,
            Utc::now(),
        )
        .expect("valid lead");
        assert_eq!(lead.email.as_deref(), Some("jane.doe@example.com"));

        let error = Lead::new(LeadId("L-4".to_string()), Some("not-an-email".to_string()), None, Utc::now())
            .expect_err("invalid email");
        assert_eq!(error.field, "lead.email");
    }

    #[test]
    fn qualification_score_is_bounded() {
        let mut lead =
            Lead::new(LeadId("L-5".to_string()), Some("a@b.io".to_string()), None, Utc::now())
                .expect("valid lead");
        lead.set_qualification_score(10, Utc::now()).expect("10 is allowed");
        assert!(lead.set_qualification_score(11, Utc::now()).is_err());
        assert_eq!(lead.qualification_score, 10);
    }

    #[test]
    fn tags_are_lowercased_and_deduplicated() {
        let mut lead =
            Lead::new(LeadId("L-6".to_string()), Some("a@b.io".to_string()), None, Utc::now())
                .expect("valid lead");
        lead.add_tags(["SUV", "suv", " ", "Financing"]);
        assert_eq!(lead.tags.iter().cloned().collect::<Vec<_>>(), vec!["financing", "suv"]);
    }

    #[test]
    fn status_round_trips_from_storage_encoding() {
        for status in [
            LeadStatus::New,
            LeadStatus::Contacted,
            LeadStatus::Qualified,
            LeadStatus::Converted,
            LeadStatus::Rejected,
        ] {
            assert_eq!(LeadStatus::parse(status.as_str()), Some(status));
        }
    }
}
