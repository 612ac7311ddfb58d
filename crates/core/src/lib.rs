pub mod audit;
pub mod config;
pub mod domain;
pub mod dossier;
pub mod engine;
pub mod errors;
pub mod handover;
pub mod playbook;
pub mod rules;
pub mod scheduler;
pub mod tracker;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use domain::campaign::{Campaign, CampaignId, Channel, TemplateId, TouchDelay, TouchStep};
pub use domain::conversation::{ConversationContext, ConversationMessage, Direction};
pub use domain::enrollment::{Enrollment, EnrollmentId, EnrollmentStatus};
pub use domain::lead::{Lead, LeadId, LeadStatus};
pub use domain::message::InboundMessage;
pub use dossier::{Dossier, DossierBuilder};
pub use engine::{
    ChangeSet, Collaborators, DeliveryDispatcher, HandoverOutcome, HandoverStatus, HumanNotifier,
    Ingestion, LeadStore, OutreachEngine, TickReport,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use handover::{HandoverCriteria, HandoverDecision, HandoverEvaluator, UrgencyTier};
pub use playbook::{CampaignCatalog, Playbook, PlaybookError};
pub use rules::{Classification, RuleMatcher, TriggerRule};
pub use scheduler::TouchInstruction;
pub use tracker::EnrollmentTracker;
