//! Orchestrates the matcher, tracker, scheduler, evaluator and dossier builder.
//!
//! The engine owns no clock and no listeners. Callers hand it inbound
//! messages and periodic ticks; it answers with what it did and pushes work to
//! the injected collaborators. All mutation goes through `&mut self`, so a
//! single owner serialises access to every enrollment.

pub mod ports;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use ports::{
    CollaboratorError, DeliveryDispatcher, HumanNotifier, InMemoryLeadStore, LeadStore,
    RecordingDispatcher, RecordingNotifier,
};

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::domain::campaign::{CampaignId, Channel};
use crate::domain::conversation::{ConversationContext, ConversationMessage};
use crate::domain::enrollment::{Enrollment, EnrollmentId, EnrollmentStatus};
use crate::domain::lead::{Lead, LeadId, LeadStatus};
use crate::domain::message::InboundMessage;
use crate::dossier::{Dossier, DossierBuilder};
use crate::errors::{ApplicationError, EnrollmentError, ParseFailure, ValidationError};
use crate::handover::{HandoverDecision, HandoverEvaluator};
use crate::playbook::Playbook;
use crate::rules::{Classification, LeadDirective, RuleMatch};
use crate::scheduler::{self, TouchInstruction};
use crate::tracker::EnrollmentTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverStatus {
    NotTriggered,
    HandedOver,
    /// The lead was handed over earlier; nothing was re-applied.
    AlreadyHandedOver,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HandoverOutcome {
    pub decision: HandoverDecision,
    pub status: HandoverStatus,
    pub dossier: Option<Dossier>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ingestion {
    Classified {
        rule_id: String,
        directive: LeadDirective,
        lead_id: Option<LeadId>,
        enrollment_id: Option<EnrollmentId>,
        handover: Option<HandoverOutcome>,
    },
    Reply {
        lead_id: LeadId,
        handover: HandoverOutcome,
    },
    /// A reply whose sender matches no stored lead.
    UnknownReply {
        sender: String,
    },
    NoMatch,
    Unparseable {
        failure: ParseFailure,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedTouch {
    pub enrollment_id: EnrollmentId,
    pub step_index: usize,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    /// Due enrollments left for the next tick by the per-tick touch limit.
    pub deferred: usize,
    pub sent: Vec<TouchInstruction>,
    pub failed: Vec<FailedTouch>,
    pub completed: Vec<EnrollmentId>,
    pub handed_over: Vec<LeadId>,
    pub errors: Vec<String>,
}

/// Records changed since the last drain, for the caller to persist.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub leads: Vec<Lead>,
    pub enrollments: Vec<Enrollment>,
    pub messages: Vec<ConversationMessage>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.leads.is_empty() && self.enrollments.is_empty() && self.messages.is_empty()
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub leads: Arc<dyn LeadStore>,
    pub dispatcher: Arc<dyn DeliveryDispatcher>,
    pub notifier: Arc<dyn HumanNotifier>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct OutreachEngine {
    playbook: Playbook,
    tracker: EnrollmentTracker,
    conversations: HashMap<LeadId, Vec<ConversationMessage>>,
    collaborators: Collaborators,
    evaluator: HandoverEvaluator,
    dossiers: DossierBuilder,
    max_touches_per_tick: usize,
    dirty_leads: BTreeSet<LeadId>,
    dirty_enrollments: BTreeSet<EnrollmentId>,
    new_messages: Vec<ConversationMessage>,
}

impl OutreachEngine {
    pub fn new(playbook: Playbook, collaborators: Collaborators) -> Self {
        Self {
            playbook,
            tracker: EnrollmentTracker::new(),
            conversations: HashMap::new(),
            collaborators,
            evaluator: HandoverEvaluator::new(),
            dossiers: DossierBuilder::new(),
            max_touches_per_tick: usize::MAX,
            dirty_leads: BTreeSet::new(),
            dirty_enrollments: BTreeSet::new(),
            new_messages: Vec::new(),
        }
    }

    pub fn with_touch_limit(mut self, max_touches_per_tick: usize) -> Self {
        self.max_touches_per_tick = max_touches_per_tick.max(1);
        self
    }

    pub fn playbook(&self) -> &Playbook {
        &self.playbook
    }

    pub fn tracker(&self) -> &EnrollmentTracker {
        &self.tracker
    }

    pub fn conversation(&self, lead_id: &LeadId) -> &[ConversationMessage] {
        self.conversations.get(lead_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Loads persisted state without marking it dirty.
    pub fn restore_enrollment(&mut self, enrollment: Enrollment) -> Result<(), ApplicationError> {
        self.tracker.restore(enrollment)?;
        Ok(())
    }

    pub fn restore_conversation(&mut self, messages: impl IntoIterator<Item = ConversationMessage>) {
        for message in messages {
            self.conversations.entry(message.lead_id.clone()).or_default().push(message);
        }
        for history in self.conversations.values_mut() {
            history.sort_by_key(|message| message.sent_at);
        }
    }

    /// Collects every record changed since the last drain. Nothing is cleared
    /// unless the whole set could be read.
    pub fn drain_changes(&mut self) -> Result<ChangeSet, ApplicationError> {
        let mut changes = ChangeSet::default();
        for lead_id in &self.dirty_leads {
            if let Some(lead) = self.collaborators.leads.get(lead_id)? {
                changes.leads.push(lead);
            }
        }
        for enrollment_id in &self.dirty_enrollments {
            if let Some(enrollment) = self.tracker.get(enrollment_id) {
                changes.enrollments.push(enrollment.clone());
            }
        }
        self.dirty_leads.clear();
        self.dirty_enrollments.clear();
        changes.messages = std::mem::take(&mut self.new_messages);
        Ok(changes)
    }

    /// Returns a drained change set that could not be stored. Leads and
    /// enrollments are re-read at the next drain, so later edits win; messages
    /// keep their order ahead of anything appended since.
    pub fn requeue(&mut self, changes: ChangeSet) {
        self.dirty_leads.extend(changes.leads.into_iter().map(|lead| lead.id));
        self.dirty_enrollments.extend(changes.enrollments.into_iter().map(|enrollment| enrollment.id));
        let mut messages = changes.messages;
        messages.append(&mut self.new_messages);
        self.new_messages = messages;
    }

    /// Enrolls a lead in the latest revision of a campaign.
    pub fn enroll(
        &mut self,
        lead_id: &LeadId,
        campaign_id: &CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, ApplicationError> {
        let mut lead = self.require_lead(lead_id)?;
        if lead.is_handed_over() {
            return Err(EnrollmentError::LeadHandedOver { lead_id: lead_id.clone() }.into());
        }
        let campaign = self.playbook.campaigns.latest(campaign_id).cloned().ok_or_else(|| {
            ValidationError::new("campaign_id", format!("unknown campaign `{}`", campaign_id.0))
        })?;
        let audit = AuditContext::new(format!("enroll-{}", lead_id.0), "engine").for_lead(lead_id);

        let enrollment =
            self.audited(&audit, "enroll", now, |tracker| tracker.enroll(lead_id, &campaign, now))?;
        lead.enrollment_id = Some(enrollment.id.clone());
        lead.updated_at = now;
        self.save_lead(lead, false)?;
        Ok(enrollment)
    }

    pub fn pause_enrollment(
        &mut self,
        id: &EnrollmentId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, ApplicationError> {
        let audit = AuditContext::new(format!("pause-{}", id.0), "operator");
        Ok(self.audited(&audit, "pause", now, |tracker| tracker.pause(id, now))?)
    }

    /// Fails with `LeadHandedOver` once a human owns the lead, even when the
    /// enrollment was paused at the moment the handover fired.
    pub fn resume_enrollment(
        &mut self,
        id: &EnrollmentId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, ApplicationError> {
        let audit = AuditContext::new(format!("resume-{}", id.0), "operator");
        let handed_over = match self.tracker.get(id) {
            Some(enrollment) => self
                .collaborators
                .leads
                .get(&enrollment.lead_id)?
                .filter(Lead::is_handed_over)
                .map(|lead| lead.id),
            None => None,
        };
        Ok(self.audited(&audit, "resume", now, |tracker| match handed_over {
            Some(lead_id) => Err(EnrollmentError::LeadHandedOver { lead_id }),
            None => tracker.resume(id, now),
        })?)
    }

    pub fn complete_enrollment(
        &mut self,
        id: &EnrollmentId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, ApplicationError> {
        let audit = AuditContext::new(format!("complete-{}", id.0), "operator");
        Ok(self.audited(&audit, "complete", now, |tracker| tracker.complete(id, now))?)
    }

    /// Feeds one inbound message through reply routing or rule classification.
    /// Parse failures are reported in the result, never as an `Err`.
    pub fn ingest(
        &mut self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<Ingestion, ApplicationError> {
        let audit = AuditContext::new(message.message_id.clone(), "ingest");

        if message.is_reply() {
            return self.ingest_reply(message, now, &audit);
        }

        let mut lookup_error = None;
        let leads = Arc::clone(&self.collaborators.leads);
        let classification = self.playbook.matcher.classify(message, |sender| {
            match leads.find_by_email(sender) {
                Ok(found) => found.map(|lead| lead.id),
                Err(error) => {
                    lookup_error = Some(error);
                    None
                }
            }
        });
        if let Some(error) = lookup_error {
            return Err(error.into());
        }

        match classification {
            Classification::Matched(matched) => self.apply_match(matched, message, now, &audit),
            Classification::NoMatch => {
                self.collaborators.audit.emit(
                    audit
                        .event("inbound.classified", AuditCategory::Ingress, AuditOutcome::Success, now)
                        .with_metadata("outcome", "no_match"),
                );
                Ok(Ingestion::NoMatch)
            }
            Classification::Unparseable { failure } => {
                self.collaborators.audit.emit(
                    audit
                        .event("inbound.classified", AuditCategory::Ingress, AuditOutcome::Rejected, now)
                        .with_metadata("outcome", "unparseable")
                        .with_metadata("error_class", failure.error_class()),
                );
                Ok(Ingestion::Unparseable { failure })
            }
        }
    }

    /// Sends every due touch (up to the per-tick limit) and re-evaluates the
    /// affected leads. Failures are collected in the report; the tick always finishes.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let audit = AuditContext::new(format!("tick-{}", now.timestamp()), "scheduler");
        let due = self.tracker.due(now);
        let mut report = TickReport { due: due.len(), ..TickReport::default() };
        report.deferred = due.len().saturating_sub(self.max_touches_per_tick);

        for id in due.into_iter().take(self.max_touches_per_tick) {
            if let Err(error) = self.process_due(&id, now, &audit, &mut report) {
                warn!(
                    event_name = "scheduler.touch_error",
                    correlation_id = %audit.correlation_id,
                    enrollment_id = %id.0,
                    error = %error,
                    "failed to process due enrollment"
                );
                report.errors.push(format!("{}: {error}", id.0));
            }
        }

        info!(
            event_name = "scheduler.tick",
            correlation_id = %audit.correlation_id,
            due = report.due,
            sent = report.sent.len(),
            failed = report.failed.len(),
            deferred = report.deferred,
            handed_over = report.handed_over.len(),
            "tick complete"
        );
        report
    }

    /// Appends an interaction to the lead's conversation and re-evaluates handover.
    pub fn record_interaction(
        &mut self,
        lead_id: &LeadId,
        message: ConversationMessage,
        now: DateTime<Utc>,
    ) -> Result<HandoverOutcome, ApplicationError> {
        if &message.lead_id != lead_id {
            return Err(ValidationError::new(
                "message.lead_id",
                format!("message belongs to {}, not {}", message.lead_id.0, lead_id.0),
            )
            .into());
        }
        self.require_lead(lead_id)?;
        self.append_message(message);
        let audit = AuditContext::new(format!("interaction-{}", lead_id.0), "engine").for_lead(lead_id);
        self.evaluate_and_apply(lead_id, now, &audit)
    }

    /// Applies an externally computed qualification score and re-evaluates.
    pub fn update_score(
        &mut self,
        lead_id: &LeadId,
        score: u8,
        now: DateTime<Utc>,
    ) -> Result<HandoverOutcome, ApplicationError> {
        let mut lead = self.require_lead(lead_id)?;
        lead.set_qualification_score(score, now)?;
        self.save_lead(lead, false)?;
        let audit = AuditContext::new(format!("score-{}", lead_id.0), "engine").for_lead(lead_id);
        self.evaluate_and_apply(lead_id, now, &audit)
    }

    pub fn record_goal(
        &mut self,
        lead_id: &LeadId,
        goal: &str,
        achieved: bool,
        now: DateTime<Utc>,
    ) -> Result<HandoverOutcome, ApplicationError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(ValidationError::new("goal", "goal name must not be blank").into());
        }
        let mut lead = self.require_lead(lead_id)?;
        lead.goal_progress.insert(goal.to_string(), achieved);
        lead.updated_at = now;
        self.save_lead(lead, false)?;
        let audit = AuditContext::new(format!("goal-{}", lead_id.0), "engine").for_lead(lead_id);
        self.evaluate_and_apply(lead_id, now, &audit)
    }

    pub fn evaluate_lead(
        &mut self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
    ) -> Result<HandoverOutcome, ApplicationError> {
        let audit = AuditContext::new(format!("evaluate-{}", lead_id.0), "engine").for_lead(lead_id);
        self.evaluate_and_apply(lead_id, now, &audit)
    }

    fn ingest_reply(
        &mut self,
        message: &InboundMessage,
        now: DateTime<Utc>,
        audit: &AuditContext,
    ) -> Result<Ingestion, ApplicationError> {
        let sender = match message.sender_address() {
            Ok(sender) => sender,
            Err(failure) => {
                warn!(
                    event_name = "ingest.reply_unparseable",
                    message_id = %message.message_id,
                    error_class = failure.error_class(),
                    "reply has no usable sender"
                );
                return Ok(Ingestion::Unparseable { failure });
            }
        };

        let Some(lead) = self.collaborators.leads.find_by_email(&sender)? else {
            warn!(
                event_name = "ingest.reply_unknown_sender",
                message_id = %message.message_id,
                sender = %sender,
                "reply from an address with no lead; not classified"
            );
            return Ok(Ingestion::UnknownReply { sender });
        };

        let body = if message.body_text.trim().is_empty() { &message.subject } else { &message.body_text };
        self.append_message(ConversationMessage::inbound(
            lead.id.clone(),
            Channel::Email,
            body.trim(),
            message.received_at,
        ));
        debug!(
            event_name = "ingest.reply",
            message_id = %message.message_id,
            lead_id = %lead.id.0,
            "reply routed to conversation"
        );

        let audit = audit.clone().for_lead(&lead.id);
        let handover = self.evaluate_and_apply(&lead.id, now, &audit)?;
        Ok(Ingestion::Reply { lead_id: lead.id, handover })
    }

    fn apply_match(
        &mut self,
        matched: RuleMatch,
        message: &InboundMessage,
        now: DateTime<Utc>,
        audit: &AuditContext,
    ) -> Result<Ingestion, ApplicationError> {
        let (mut lead, created) = match &matched.directive {
            LeadDirective::Skip => {
                self.emit_classified(audit, &matched, now);
                return Ok(Ingestion::Classified {
                    rule_id: matched.rule_id.clone(),
                    directive: LeadDirective::Skip,
                    lead_id: None,
                    enrollment_id: None,
                    handover: None,
                });
            }
            LeadDirective::Create => {
                let id = LeadId(format!("lead_{}", Uuid::new_v4().simple()));
                let mut lead = Lead::new(id, Some(matched.sender.clone()), None, now)?;
                lead.name = matched.sender_name.clone();
                (lead, true)
            }
            LeadDirective::Update(lead_id) => (self.require_lead(lead_id)?, false),
        };

        lead.add_tags(&matched.actions.tags);
        if lead.source.is_none() {
            lead.source = matched.actions.source.clone();
        }
        if matched.actions.priority.is_some() {
            lead.priority = matched.actions.priority.clone();
        }
        lead.updated_at = now;

        // Resolve everything that can fail before the first write.
        let enrollment_plan = match &matched.actions.campaign {
            Some(_) if lead.is_handed_over() => {
                debug!(
                    event_name = "ingest.enrollment_skipped",
                    lead_id = %lead.id.0,
                    "lead is owned by a human after handover"
                );
                None
            }
            Some(campaign_id) => match self.tracker.active_for_lead(&lead.id) {
                Some(active) => {
                    debug!(
                        event_name = "ingest.enrollment_skipped",
                        lead_id = %lead.id.0,
                        enrollment_id = %active.id.0,
                        "lead already holds an active enrollment"
                    );
                    None
                }
                None => {
                    let campaign =
                        self.playbook.campaigns.latest(campaign_id).cloned().ok_or_else(|| {
                            ValidationError::new(
                                "rules.actions.campaign",
                                format!("unknown campaign `{}`", campaign_id.0),
                            )
                        })?;
                    let id = EnrollmentId(format!("enr_{}", Uuid::new_v4().simple()));
                    lead.enrollment_id = Some(id.clone());
                    Some((id, campaign))
                }
            },
            None => None,
        };

        let lead_id = lead.id.clone();
        self.save_lead(lead, created)?;

        let audit = audit.clone().for_lead(&lead_id);
        let enrollment_id = match enrollment_plan {
            Some((id, campaign)) => {
                let enrollment = self.audited(&audit, "enroll", now, |tracker| {
                    tracker.enroll_with_id(id, &lead_id, &campaign, now)
                })?;
                Some(enrollment.id)
            }
            None => None,
        };

        self.append_message(ConversationMessage::inbound(
            lead_id.clone(),
            Channel::Email,
            inbound_text(message),
            message.received_at,
        ));
        self.emit_classified(&audit, &matched, now);

        let handover = self.evaluate_and_apply(&lead_id, now, &audit)?;
        Ok(Ingestion::Classified {
            rule_id: matched.rule_id,
            directive: matched.directive,
            lead_id: Some(lead_id),
            enrollment_id,
            handover: Some(handover),
        })
    }

    fn process_due(
        &mut self,
        id: &EnrollmentId,
        now: DateTime<Utc>,
        audit: &AuditContext,
        report: &mut TickReport,
    ) -> Result<(), ApplicationError> {
        let Some(enrollment) = self.tracker.get(id).cloned() else {
            return Ok(());
        };
        let campaign = self
            .playbook
            .campaigns
            .get(&enrollment.campaign_id, enrollment.campaign_revision)
            .cloned()
            .ok_or_else(|| EnrollmentError::UnknownCampaign {
                enrollment_id: id.clone(),
                campaign_id: enrollment.campaign_id.0.clone(),
                revision: enrollment.campaign_revision,
            })?;
        let Some(touch) = scheduler::touch_for(&enrollment, &campaign) else {
            return Ok(());
        };
        let audit = audit.clone().for_lead(&enrollment.lead_id).for_enrollment(id);

        // A handed-over lead never receives another automated touch.
        let lead = self.require_lead(&enrollment.lead_id)?;
        if lead.is_handed_over() {
            warn!(
                event_name = "scheduler.touch_suppressed",
                correlation_id = %audit.correlation_id,
                enrollment_id = %id.0,
                lead_id = %lead.id.0,
                "due enrollment belongs to a handed-over lead; freezing it"
            );
            self.audited(&audit, "handover", now, |tracker| tracker.handover(id, now))?;
            return Ok(());
        }

        if let Err(error) = self.collaborators.dispatcher.dispatch(&touch) {
            warn!(
                event_name = "scheduler.touch_failed",
                correlation_id = %audit.correlation_id,
                enrollment_id = %id.0,
                step = touch.step_index,
                error = %error,
                "touch dispatch failed; enrollment stays on this step"
            );
            self.collaborators.audit.emit(
                audit
                    .event("scheduler.touch_failed", AuditCategory::Scheduling, AuditOutcome::Failed, now)
                    .with_metadata("step", touch.step_index.to_string())
                    .with_metadata("error", error.to_string()),
            );
            report.failed.push(FailedTouch {
                enrollment_id: id.clone(),
                step_index: touch.step_index,
                error: error.to_string(),
            });
            return Ok(());
        }

        let advanced = self.audited(&audit, "advance", now, |tracker| {
            tracker.advance(id, &campaign, touch.step_index, now)
        })?;
        self.collaborators.audit.emit(
            audit
                .event("scheduler.touch_sent", AuditCategory::Scheduling, AuditOutcome::Success, now)
                .with_metadata("step", touch.step_index.to_string())
                .with_metadata("template", touch.template_id.0.clone())
                .with_metadata("channel", touch.channel.as_str()),
        );
        self.append_message(ConversationMessage::outbound(
            enrollment.lead_id.clone(),
            touch.channel,
            format!(
                "[{}] touch {} of {}",
                touch.template_id.0,
                touch.step_index + 1,
                campaign.step_count()
            ),
            now,
        ));
        if advanced.status == EnrollmentStatus::Completed {
            report.completed.push(id.clone());
        }
        report.sent.push(touch);

        if let Some(mut lead) = self.collaborators.leads.get(&enrollment.lead_id)? {
            if lead.status == LeadStatus::New {
                lead.status = LeadStatus::Contacted;
                lead.updated_at = now;
                self.save_lead(lead, false)?;
            }
        }

        let outcome = self.evaluate_and_apply(&enrollment.lead_id, now, &audit)?;
        if outcome.status == HandoverStatus::HandedOver {
            report.handed_over.push(enrollment.lead_id);
        }
        Ok(())
    }

    /// Evaluates the lead and, on a positive decision, builds the dossier,
    /// notifies, and only then freezes the enrollment. A failed build or
    /// notification leaves the enrollment untouched so the next interaction retries.
    /// A paused enrollment has no edge to `handed_over`; it stays paused and
    /// `resume_enrollment` refuses it from then on.
    fn evaluate_and_apply(
        &mut self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
        audit: &AuditContext,
    ) -> Result<HandoverOutcome, ApplicationError> {
        let lead = self.require_lead(lead_id)?;
        let enrollment = self
            .tracker
            .active_for_lead(lead_id)
            .or_else(|| self.tracker.latest_for_lead(lead_id))
            .cloned();
        let criteria = match &enrollment {
            Some(enrollment) => {
                self.playbook.criteria_for(&enrollment.campaign_id, enrollment.campaign_revision).clone()
            }
            None => self.playbook.default_handover.clone(),
        };
        let history = self.conversation(lead_id).to_vec();
        let mut context = ConversationContext::from_history(&history);
        if let Some(enrollment) = &enrollment {
            context = context.anchored_at(enrollment.started_at);
        }

        let decision = self.evaluator.evaluate(&lead, &context, &criteria, now);
        self.collaborators.audit.emit(
            audit
                .event("handover.evaluated", AuditCategory::Handover, AuditOutcome::Success, now)
                .with_metadata("should_handover", decision.should_handover.to_string())
                .with_metadata("triggered", decision.triggered_names().join(","))
                .with_metadata("urgency", decision.urgency.as_str()),
        );

        if lead.is_handed_over() {
            return Ok(HandoverOutcome { decision, status: HandoverStatus::AlreadyHandedOver, dossier: None });
        }
        if !decision.should_handover {
            return Ok(HandoverOutcome { decision, status: HandoverStatus::NotTriggered, dossier: None });
        }

        let dossier = match self.dossiers.build(&lead, &decision, &history, now) {
            Ok(dossier) => dossier.with_recipients(criteria.recipients_by_priority()),
            Err(error) => {
                warn!(
                    event_name = "handover.dossier_failed",
                    correlation_id = %audit.correlation_id,
                    lead_id = %lead_id.0,
                    error = %error,
                    "dossier build failed; handover will be retried"
                );
                self.collaborators.audit.emit(
                    audit
                        .event("handover.dossier_failed", AuditCategory::Handover, AuditOutcome::Failed, now)
                        .with_metadata("error", error.to_string()),
                );
                return Err(error.into());
            }
        };
        self.collaborators.notifier.notify(&lead, &dossier)?;

        if let Some(active) = enrollment.filter(Enrollment::is_active) {
            self.audited(audit, "handover", now, |tracker| tracker.handover(&active.id, now))?;
        }

        let mut lead = lead;
        lead.handed_over_at = Some(now);
        if matches!(lead.status, LeadStatus::New | LeadStatus::Contacted) {
            lead.status = LeadStatus::Qualified;
        }
        lead.updated_at = now;
        self.save_lead(lead, false)?;

        info!(
            event_name = "handover.fired",
            correlation_id = %audit.correlation_id,
            lead_id = %lead_id.0,
            urgency = decision.urgency.as_str(),
            triggered = ?decision.triggered_names(),
            "lead handed over to a human"
        );
        self.collaborators.audit.emit(
            audit
                .event("handover.fired", AuditCategory::Handover, AuditOutcome::Success, now)
                .with_metadata("urgency", decision.urgency.as_str())
                .with_metadata("recipients", dossier.recipients.len().to_string()),
        );

        Ok(HandoverOutcome { decision, status: HandoverStatus::HandedOver, dossier: Some(dossier) })
    }

    fn audited<F>(
        &mut self,
        audit: &AuditContext,
        action: &str,
        now: DateTime<Utc>,
        operation: F,
    ) -> Result<Enrollment, EnrollmentError>
    where
        F: FnOnce(&mut EnrollmentTracker) -> Result<Enrollment, EnrollmentError>,
    {
        let result = operation(&mut self.tracker);
        match &result {
            Ok(enrollment) => {
                self.dirty_enrollments.insert(enrollment.id.clone());
                self.collaborators.audit.emit(
                    audit
                        .clone()
                        .for_lead(&enrollment.lead_id)
                        .for_enrollment(&enrollment.id)
                        .event(
                            "enrollment.transition_applied",
                            AuditCategory::Enrollment,
                            AuditOutcome::Success,
                            now,
                        )
                        .with_metadata("action", action)
                        .with_metadata("status", enrollment.status.as_str())
                        .with_metadata("step", enrollment.current_step.to_string()),
                );
            }
            Err(error) => {
                self.collaborators.audit.emit(
                    audit
                        .event(
                            "enrollment.transition_rejected",
                            AuditCategory::Enrollment,
                            AuditOutcome::Rejected,
                            now,
                        )
                        .with_metadata("action", action)
                        .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }

    fn emit_classified(&self, audit: &AuditContext, matched: &RuleMatch, now: DateTime<Utc>) {
        let directive = match &matched.directive {
            LeadDirective::Create => "create",
            LeadDirective::Update(_) => "update",
            LeadDirective::Skip => "skip",
        };
        self.collaborators.audit.emit(
            audit
                .event("inbound.classified", AuditCategory::Ingress, AuditOutcome::Success, now)
                .with_metadata("outcome", "matched")
                .with_metadata("rule_id", matched.rule_id.clone())
                .with_metadata("directive", directive),
        );
    }

    fn require_lead(&self, lead_id: &LeadId) -> Result<Lead, ApplicationError> {
        self.collaborators.leads.get(lead_id)?.ok_or_else(|| {
            ValidationError::new("lead_id", format!("unknown lead `{}`", lead_id.0)).into()
        })
    }

    fn save_lead(&mut self, lead: Lead, created: bool) -> Result<(), ApplicationError> {
        let lead_id = lead.id.clone();
        if created {
            self.collaborators.leads.create(lead)?;
        } else {
            self.collaborators.leads.update(lead)?;
        }
        self.dirty_leads.insert(lead_id);
        Ok(())
    }

    fn append_message(&mut self, message: ConversationMessage) {
        let history = self.conversations.entry(message.lead_id.clone()).or_default();
        let position = history.partition_point(|existing| existing.sent_at <= message.sent_at);
        history.insert(position, message.clone());
        self.new_messages.push(message);
    }
}

fn inbound_text(message: &InboundMessage) -> String {
    let subject = message.subject.trim();
    let body = message.body_text.trim();
    match (subject.is_empty(), body.is_empty()) {
        (false, false) => format!("{subject}\n\n{body}"),
        (true, _) => body.to_string(),
        (false, true) => subject.to_string(),
    }
}
