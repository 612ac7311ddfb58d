use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use cadence_core::domain::conversation::ConversationMessage;
use cadence_core::domain::enrollment::{Enrollment, EnrollmentId};
use cadence_core::domain::lead::{Lead, LeadId};

pub mod changes;
pub mod conversation;
pub mod enrollment;
pub mod lead;
pub mod memory;

pub use changes::{ChangeWriter, RepositoryChangeWriter, SqlChangeWriter};
pub use conversation::SqlConversationRepository;
pub use enrollment::SqlEnrollmentRepository;
pub use lead::SqlLeadRepository;
pub use memory::{
    InMemoryConversationRepository, InMemoryEnrollmentRepository, InMemoryLeadRepository,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, RepositoryError>;
    async fn list(&self) -> Result<Vec<Lead>, RepositoryError>;
    async fn save(&self, lead: Lead) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait EnrollmentRepository: Send + Sync {
    async fn find_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError>;
    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Enrollment>, RepositoryError>;
    /// Every enrollment, oldest first.
    async fn list(&self) -> Result<Vec<Enrollment>, RepositoryError>;
    async fn save(&self, enrollment: Enrollment) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn append(&self, message: ConversationMessage) -> Result<(), RepositoryError>;
    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<ConversationMessage>, RepositoryError>;
    async fn list(&self) -> Result<Vec<ConversationMessage>, RepositoryError>;
}

pub(crate) fn decode_error(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.as_deref().map(|value| parse_timestamp(column, value)).transpose()
}
