use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::enrollment::{EnrollmentId, EnrollmentStatus};
use crate::domain::lead::LeadId;

/// Malformed input shape: a lead without contact details, a negative delay,
/// an uncompilable rule pattern, an out-of-range threshold.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

/// An inbound message that cannot be classified at all.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ParseFailure {
    #[error("message has no sender address")]
    MissingSender,
    #[error("sender `{0}` is not a valid email address")]
    InvalidSender(String),
    #[error("message `{message_id}` has neither subject nor body text")]
    EmptyContent { message_id: String },
}

impl ParseFailure {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::MissingSender => "missing_sender",
            Self::InvalidSender(_) => "invalid_sender",
            Self::EmptyContent { .. } => "empty_content",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnrollmentError {
    #[error("lead {lead_id:?} already holds active enrollment {existing:?}")]
    AlreadyEnrolled { lead_id: LeadId, existing: EnrollmentId },
    #[error("invalid enrollment transition from {from:?} to {to:?}")]
    InvalidTransition { from: EnrollmentStatus, to: EnrollmentStatus },
    #[error("out-of-order advance for {enrollment_id:?}: expected step {expected}, got {requested}")]
    OutOfOrderAdvance { enrollment_id: EnrollmentId, expected: usize, requested: usize },
    #[error("enrollment {enrollment_id:?} is {status:?}; only active enrollments advance")]
    NotActive { enrollment_id: EnrollmentId, status: EnrollmentStatus },
    #[error("unknown enrollment {0:?}")]
    UnknownEnrollment(EnrollmentId),
    #[error("lead {lead_id:?} was handed over to a human; automated touches are closed")]
    LeadHandedOver { lead_id: LeadId },
    #[error("enrollment {enrollment_id:?} references unknown campaign `{campaign_id}` revision {revision}")]
    UnknownCampaign { enrollment_id: EnrollmentId, campaign_id: String, revision: u32 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DossierBuildError {
    #[error("lead {lead_id:?} has no usable contact details")]
    LeadIncomplete { lead_id: LeadId },
    #[error("conversation message belongs to lead {found:?}, expected {expected:?}")]
    ConversationMismatch { expected: LeadId, found: LeadId },
    #[error("handover decision for lead {0:?} is negative; nothing to hand off")]
    NotEscalated(LeadId),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Dossier(#[from] DossierBuildError),
    #[error(transparent)]
    Parse(#[from] ParseFailure),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<ValidationError> for ApplicationError {
    fn from(value: ValidationError) -> Self {
        Self::Domain(DomainError::Validation(value))
    }
}

impl From<EnrollmentError> for ApplicationError {
    fn from(value: EnrollmentError) -> Self {
        Self::Domain(DomainError::Enrollment(value))
    }
}

impl From<DossierBuildError> for ApplicationError {
    fn from(value: DossierBuildError) -> Self {
        Self::Domain(DomainError::Dossier(value))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => {
                "The lead or enrollment is not in a state that allows this operation."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(DomainError::Enrollment(error)) => {
                Self::Conflict { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(DomainError::Dossier(error)) => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(
                DomainError::Validation(_)
                | DomainError::Parse(_)
                | DomainError::InvariantViolation(_),
            ) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}
