//! Due-time arithmetic for campaign touch sequences.
//!
//! Every due time is anchored to the enrollment start: step `i` is due at
//! `started_at + delay[0] + ... + delay[i]`. Polling frequency never shifts the
//! schedule, and nothing in this module performs I/O.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::campaign::{Campaign, Channel, TemplateId};
use crate::domain::enrollment::{Enrollment, EnrollmentId};
use crate::domain::lead::LeadId;

/// "Send touch N" work item handed to the delivery collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchInstruction {
    pub enrollment_id: EnrollmentId,
    pub lead_id: LeadId,
    pub template_id: TemplateId,
    pub channel: Channel,
    pub step_index: usize,
    pub due_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTouch {
    pub step_index: usize,
    pub template_id: TemplateId,
    pub channel: Channel,
    pub due_at: DateTime<Utc>,
}

/// Cumulative due time of `step_index`, or `None` past the last step.
pub fn due_time_for_step(
    campaign: &Campaign,
    started_at: DateTime<Utc>,
    step_index: usize,
) -> Option<DateTime<Utc>> {
    if step_index >= campaign.step_count() {
        return None;
    }
    let total_minutes = campaign.steps[..=step_index]
        .iter()
        .fold(0_u64, |total, step| total.saturating_add(step.delay.minutes()));
    Some(offset(started_at, total_minutes))
}

/// Due time of the enrollment's next unsent step.
pub fn next_due_time(enrollment: &Enrollment, campaign: &Campaign) -> Option<DateTime<Utc>> {
    due_time_for_step(campaign, enrollment.started_at, enrollment.current_step)
}

pub fn touch_for(enrollment: &Enrollment, campaign: &Campaign) -> Option<TouchInstruction> {
    let step = campaign.step(enrollment.current_step)?;
    let due_at = next_due_time(enrollment, campaign)?;
    Some(TouchInstruction {
        enrollment_id: enrollment.id.clone(),
        lead_id: enrollment.lead_id.clone(),
        template_id: step.template.clone(),
        channel: step.channel.unwrap_or(campaign.channel),
        step_index: enrollment.current_step,
        due_at,
    })
}

/// Full schedule of a campaign for an enrollment starting at `started_at`.
pub fn timeline(campaign: &Campaign, started_at: DateTime<Utc>) -> Vec<ScheduledTouch> {
    let mut total_minutes = 0_u64;
    campaign
        .steps
        .iter()
        .enumerate()
        .map(|(step_index, step)| {
            total_minutes = total_minutes.saturating_add(step.delay.minutes());
            ScheduledTouch {
                step_index,
                template_id: step.template.clone(),
                channel: step.channel.unwrap_or(campaign.channel),
                due_at: offset(started_at, total_minutes),
            }
        })
        .collect()
}

fn offset(anchor: DateTime<Utc>, minutes: u64) -> DateTime<Utc> {
    i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .and_then(|delta| anchor.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
