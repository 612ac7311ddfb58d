use chrono::{DateTime, Utc};

use crate::domain::conversation::ConversationContext;
use crate::domain::lead::Lead;
use crate::handover::{HandoverCheck, HandoverCriteria, HandoverDecision, UrgencyTier};

pub const HIGH_URGENCY_SCORE: u8 = 8;
pub const MEDIUM_URGENCY_SCORE: u8 = 6;

/// Scores a lead against handover criteria.
///
/// Score, length, time and keyword checks are OR-combined; the goal check
/// fires only when every required goal is recorded as complete. The result
/// depends on nothing but the arguments, so repeated evaluation of unchanged
/// inputs yields the same decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct HandoverEvaluator;

impl HandoverEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        lead: &Lead,
        context: &ConversationContext,
        criteria: &HandoverCriteria,
        now: DateTime<Utc>,
    ) -> HandoverDecision {
        let mut triggered = Vec::new();
        let mut reasons = Vec::new();

        if let Some(threshold) = criteria.qualification_score {
            if lead.qualification_score >= threshold {
                triggered.push(HandoverCheck::Score);
                reasons.push(format!(
                    "qualification score {} reached threshold {threshold}",
                    lead.qualification_score
                ));
            }
        }

        if let Some(threshold) = criteria.conversation_length {
            if context.message_count >= threshold {
                triggered.push(HandoverCheck::Length);
                reasons.push(format!(
                    "conversation reached {} messages (threshold {threshold})",
                    context.message_count
                ));
            }
        }

        let elapsed = elapsed_minutes(context, now);
        if let (Some(threshold), Some(elapsed)) = (criteria.time_threshold_minutes, elapsed) {
            if elapsed >= i64::from(threshold) {
                triggered.push(HandoverCheck::Time);
                reasons.push(format!(
                    "{elapsed} minutes since first contact (threshold {threshold})"
                ));
            }
        }

        let matched_keywords = matched_keywords(lead, context, &criteria.keyword_triggers);
        if !matched_keywords.is_empty() {
            triggered.push(HandoverCheck::Keyword);
            reasons.push(format!("keywords mentioned: {}", matched_keywords.join(", ")));
        }

        if goals_complete(lead, &criteria.goal_completion_required) {
            triggered.push(HandoverCheck::Goal);
            reasons.push(format!(
                "all required goals complete: {}",
                criteria.goal_completion_required.join(", ")
            ));
        }

        let should_handover = !triggered.is_empty();
        let score = lead.qualification_score;
        // A decision that escalates nothing carries no urgency.
        let urgency =
            if should_handover { urgency_tier(score, triggered.len()) } else { UrgencyTier::Low };
        let reason = if should_handover {
            format!("handover triggered: {}", reasons.join("; "))
        } else {
            "no handover criteria met".to_string()
        };
        let next_actions = if should_handover {
            next_actions(&triggered, lead, elapsed, &matched_keywords)
        } else {
            Vec::new()
        };

        HandoverDecision {
            should_handover,
            reason,
            score,
            triggered_criteria: triggered,
            matched_keywords,
            urgency,
            next_actions,
        }
    }
}

pub fn urgency_tier(score: u8, fired_checks: usize) -> UrgencyTier {
    if score >= HIGH_URGENCY_SCORE || fired_checks >= 3 {
        UrgencyTier::High
    } else if score >= MEDIUM_URGENCY_SCORE || fired_checks >= 2 {
        UrgencyTier::Medium
    } else {
        UrgencyTier::Low
    }
}

fn elapsed_minutes(context: &ConversationContext, now: DateTime<Utc>) -> Option<i64> {
    context.first_contact_at.map(|first| (now - first).num_minutes().max(0))
}

fn matched_keywords(lead: &Lead, context: &ConversationContext, keywords: &[String]) -> Vec<String> {
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut haystack = lead.notes.to_lowercase();
    for tag in &lead.tags {
        haystack.push('\n');
        haystack.push_str(&tag.to_lowercase());
    }
    haystack.push('\n');
    haystack.push_str(&context.text.to_lowercase());

    let mut matched: Vec<String> = Vec::new();
    for keyword in keywords {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() || matched.iter().any(|existing| existing == &needle) {
            continue;
        }
        if haystack.contains(&needle) {
            matched.push(needle);
        }
    }
    matched
}

fn goals_complete(lead: &Lead, required: &[String]) -> bool {
    !required.is_empty()
        && required.iter().all(|goal| lead.goal_progress.get(goal.as_str()).copied().unwrap_or(false))
}

fn next_actions(
    triggered: &[HandoverCheck],
    lead: &Lead,
    elapsed: Option<i64>,
    keywords: &[String],
) -> Vec<String> {
    triggered
        .iter()
        .map(|check| match check {
            HandoverCheck::Score => format!(
                "Call {} while interest is high (qualification {}/10)",
                lead.display_name(),
                lead.qualification_score
            ),
            HandoverCheck::Length => {
                "Read the full conversation before reaching out".to_string()
            }
            HandoverCheck::Time => format!(
                "Follow up personally; automated outreach has run for {} minutes",
                elapsed.unwrap_or_default()
            ),
            HandoverCheck::Keyword => {
                format!("Address the topics the lead raised: {}", keywords.join(", "))
            }
            HandoverCheck::Goal => {
                "Qualification goals are complete; move the lead to closing".to_string()
            }
        })
        .collect()
}
