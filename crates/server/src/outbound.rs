//! Outbound collaborators for the engine. Actual channel delivery and human
//! acknowledgement live outside this service, so both adapters hand their work
//! to the log stream as structured events.

use cadence_core::domain::lead::Lead;
use cadence_core::dossier::Dossier;
use cadence_core::engine::{CollaboratorError, DeliveryDispatcher, HumanNotifier};
use cadence_core::scheduler::TouchInstruction;
use tracing::info;

#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDispatcher;

impl DeliveryDispatcher for LoggingDispatcher {
    fn dispatch(&self, touch: &TouchInstruction) -> Result<(), CollaboratorError> {
        info!(
            event_name = "delivery.touch_dispatched",
            correlation_id = %touch.enrollment_id.0,
            lead_id = %touch.lead_id.0,
            enrollment_id = %touch.enrollment_id.0,
            template_id = %touch.template_id.0,
            channel = touch.channel.as_str(),
            step_index = touch.step_index,
            due_at = %touch.due_at.to_rfc3339(),
            "send touch"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingNotifier;

impl HumanNotifier for LoggingNotifier {
    fn notify(&self, lead: &Lead, dossier: &Dossier) -> Result<(), CollaboratorError> {
        let recipients =
            dossier.recipients.iter().map(|recipient| recipient.contact.as_str()).collect::<Vec<_>>();
        let recipients = if recipients.is_empty() { "unassigned".to_string() } else { recipients.join(",") };
        info!(
            event_name = "handover.dossier_delivered",
            correlation_id = %lead.id.0,
            lead_id = %lead.id.0,
            recipients = %recipients,
            urgency = dossier.recommendation.priority.as_str(),
            dossier = %dossier.render_text(),
            "handover dossier delivered"
        );
        Ok(())
    }
}
