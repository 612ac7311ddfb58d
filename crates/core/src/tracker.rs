use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::campaign::Campaign;
use crate::domain::enrollment::{Enrollment, EnrollmentId, EnrollmentStatus};
use crate::domain::lead::LeadId;
use crate::errors::EnrollmentError;
use crate::scheduler;

/// Owns every enrollment record, addressed by id.
///
/// `active_by_lead` indexes the single active enrollment a lead may hold. It
/// is updated in the same call that changes an enrollment's status, so the
/// two maps never disagree.
#[derive(Clone, Debug, Default)]
pub struct EnrollmentTracker {
    enrollments: HashMap<EnrollmentId, Enrollment>,
    active_by_lead: HashMap<LeadId, EnrollmentId>,
}

impl EnrollmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(
        &mut self,
        lead_id: &LeadId,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        let id = EnrollmentId(format!("enr_{}", Uuid::new_v4().simple()));
        self.enroll_with_id(id, lead_id, campaign, now)
    }

    pub fn enroll_with_id(
        &mut self,
        id: EnrollmentId,
        lead_id: &LeadId,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        self.ensure_no_active(lead_id)?;

        let mut enrollment = Enrollment {
            id: id.clone(),
            lead_id: lead_id.clone(),
            campaign_id: campaign.id.clone(),
            campaign_revision: campaign.revision,
            current_step: 0,
            status: EnrollmentStatus::Active,
            started_at: now,
            last_touch_at: None,
            next_touch_due: None,
            updated_at: now,
        };
        enrollment.next_touch_due = scheduler::next_due_time(&enrollment, campaign);

        info!(
            event_name = "enrollment.created",
            lead_id = %lead_id.0,
            enrollment_id = %id.0,
            campaign_id = %campaign.id.0,
            revision = campaign.revision,
            "lead enrolled"
        );
        self.active_by_lead.insert(lead_id.clone(), id.clone());
        self.enrollments.insert(id, enrollment.clone());
        Ok(enrollment)
    }

    /// Records that step `expected_step` was sent and schedules the next one.
    /// Advancing past the final step completes the enrollment.
    pub fn advance(
        &mut self,
        id: &EnrollmentId,
        campaign: &Campaign,
        expected_step: usize,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        let enrollment = self.enrollments.get_mut(id).ok_or_else(|| unknown(id))?;
        if enrollment.campaign_id != campaign.id
            || enrollment.campaign_revision != campaign.revision
        {
            return Err(EnrollmentError::UnknownCampaign {
                enrollment_id: id.clone(),
                campaign_id: campaign.id.0.clone(),
                revision: campaign.revision,
            });
        }
        if !enrollment.is_active() {
            return Err(EnrollmentError::NotActive {
                enrollment_id: id.clone(),
                status: enrollment.status,
            });
        }
        if enrollment.current_step != expected_step {
            return Err(EnrollmentError::OutOfOrderAdvance {
                enrollment_id: id.clone(),
                expected: enrollment.current_step,
                requested: expected_step,
            });
        }

        enrollment.current_step += 1;
        enrollment.last_touch_at = Some(now);
        enrollment.updated_at = now;

        if enrollment.current_step >= campaign.step_count() {
            enrollment.transition_to(EnrollmentStatus::Completed, now)?;
            self.active_by_lead.remove(&enrollment.lead_id);
            info!(
                event_name = "enrollment.completed",
                enrollment_id = %id.0,
                steps = campaign.step_count(),
                "touch sequence exhausted"
            );
        } else {
            enrollment.next_touch_due = scheduler::next_due_time(enrollment, campaign);
            debug!(
                event_name = "enrollment.advanced",
                enrollment_id = %id.0,
                step = enrollment.current_step,
                next_touch_due = ?enrollment.next_touch_due,
                "enrollment advanced"
            );
        }
        Ok(enrollment.clone())
    }

    pub fn pause(&mut self, id: &EnrollmentId, now: DateTime<Utc>) -> Result<Enrollment, EnrollmentError> {
        self.apply(id, EnrollmentStatus::Paused, now)
    }

    /// Fails with `AlreadyEnrolled` if the lead was enrolled elsewhere while paused.
    pub fn resume(&mut self, id: &EnrollmentId, now: DateTime<Utc>) -> Result<Enrollment, EnrollmentError> {
        let lead_id = self.enrollments.get(id).ok_or_else(|| unknown(id))?.lead_id.clone();
        if let Some(existing) = self.active_by_lead.get(&lead_id).filter(|existing| *existing != id) {
            return Err(EnrollmentError::AlreadyEnrolled { lead_id, existing: existing.clone() });
        }
        self.apply(id, EnrollmentStatus::Active, now)
    }

    pub fn complete(&mut self, id: &EnrollmentId, now: DateTime<Utc>) -> Result<Enrollment, EnrollmentError> {
        self.apply(id, EnrollmentStatus::Completed, now)
    }

    pub fn handover(&mut self, id: &EnrollmentId, now: DateTime<Utc>) -> Result<Enrollment, EnrollmentError> {
        self.apply(id, EnrollmentStatus::HandedOver, now)
    }

    pub fn get(&self, id: &EnrollmentId) -> Option<&Enrollment> {
        self.enrollments.get(id)
    }

    pub fn active_for_lead(&self, lead_id: &LeadId) -> Option<&Enrollment> {
        self.active_by_lead.get(lead_id).and_then(|id| self.enrollments.get(id))
    }

    pub fn latest_for_lead(&self, lead_id: &LeadId) -> Option<&Enrollment> {
        self.enrollments
            .values()
            .filter(|enrollment| &enrollment.lead_id == lead_id)
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)))
    }

    /// Active enrollments with `next_touch_due <= now`, oldest due first.
    /// Past-due enrollments are included no matter how stale.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<EnrollmentId> {
        let mut due: Vec<&Enrollment> =
            self.enrollments.values().filter(|enrollment| enrollment.is_due(now)).collect();
        due.sort_by(|a, b| a.next_touch_due.cmp(&b.next_touch_due).then_with(|| a.id.cmp(&b.id)));
        due.into_iter().map(|enrollment| enrollment.id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Enrollment> {
        self.enrollments.values()
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }

    /// Loads a persisted enrollment, rejecting a second active record for the same lead.
    pub fn restore(&mut self, enrollment: Enrollment) -> Result<(), EnrollmentError> {
        if enrollment.is_active() {
            if let Some(existing) = self
                .active_by_lead
                .get(&enrollment.lead_id)
                .filter(|existing| **existing != enrollment.id)
            {
                return Err(EnrollmentError::AlreadyEnrolled {
                    lead_id: enrollment.lead_id.clone(),
                    existing: existing.clone(),
                });
            }
            self.active_by_lead.insert(enrollment.lead_id.clone(), enrollment.id.clone());
        }
        self.enrollments.insert(enrollment.id.clone(), enrollment);
        Ok(())
    }

    fn ensure_no_active(&self, lead_id: &LeadId) -> Result<(), EnrollmentError> {
        match self.active_by_lead.get(lead_id) {
            Some(existing) => Err(EnrollmentError::AlreadyEnrolled {
                lead_id: lead_id.clone(),
                existing: existing.clone(),
            }),
            None => Ok(()),
        }
    }

    fn apply(
        &mut self,
        id: &EnrollmentId,
        next: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentError> {
        let enrollment = self.enrollments.get_mut(id).ok_or_else(|| unknown(id))?;
        let from = enrollment.status;
        enrollment.transition_to(next, now)?;

        if next == EnrollmentStatus::Active {
            self.active_by_lead.insert(enrollment.lead_id.clone(), id.clone());
        } else {
            self.active_by_lead.remove(&enrollment.lead_id);
        }
        info!(
            event_name = "enrollment.transition",
            enrollment_id = %id.0,
            lead_id = %enrollment.lead_id.0,
            from = from.as_str(),
            to = next.as_str(),
            "enrollment status changed"
        );
        Ok(enrollment.clone())
    }
}

fn unknown(id: &EnrollmentId) -> EnrollmentError {
    EnrollmentError::UnknownEnrollment(id.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{DateTime, Duration, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::EnrollmentTracker;
    use crate::domain::campaign::{Campaign, CampaignId, Channel, TouchDelay, TouchStep};
    use crate::domain::enrollment::{EnrollmentId, EnrollmentStatus};
    use crate::domain::lead::LeadId;
    use crate::errors::EnrollmentError;
    use crate::handover::HandoverCriteria;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T10:00:00Z").expect("valid ts").with_timezone(&Utc)
    }

    fn campaign(id: &str, delays: &[&str]) -> Campaign {
        let steps = delays
            .iter()
            .enumerate()
            .map(|(index, raw)| TouchStep::new(format!("{id}-{index}"), TouchDelay::parse(raw).expect("delay")))
            .collect();
        Campaign::new(CampaignId(id.to_string()), id, 1, Channel::Email, steps, HandoverCriteria::default())
            .expect("valid campaign")
    }

    fn lead(id: &str) -> LeadId {
        LeadId(id.to_string())
    }

    #[test]
    fn enroll_schedules_first_touch_at_start() {
        let mut tracker = EnrollmentTracker::new();
        let enrollment = tracker
            .enroll(&lead("L-1"), &campaign("welcome", &["0", "3 days"]), t0())
            .expect("enroll");

        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.current_step, 0);
        assert_eq!(enrollment.next_touch_due, Some(t0()));
        assert_eq!(tracker.active_for_lead(&lead("L-1")).map(|e| &e.id), Some(&enrollment.id));
    }

    #[test]
    fn second_active_enrollment_is_rejected() {
        let mut tracker = EnrollmentTracker::new();
        let first = tracker.enroll(&lead("L-1"), &campaign("a", &["0"]), t0()).expect("enroll");

        let error = tracker
            .enroll(&lead("L-1"), &campaign("b", &["0"]), t0())
            .expect_err("double enrollment");
        assert_eq!(error, EnrollmentError::AlreadyEnrolled { lead_id: lead("L-1"), existing: first.id.clone() });

        tracker.pause(&first.id, t0()).expect("pause");
        tracker.enroll(&lead("L-1"), &campaign("b", &["0"]), t0()).expect("enroll after pause");

        let error = tracker.resume(&first.id, t0()).expect_err("resume would double-enroll");
        assert!(matches!(error, EnrollmentError::AlreadyEnrolled { .. }));
    }

    #[test]
    fn advance_walks_the_sequence_and_completes() {
        let campaign = campaign("welcome", &["0", "3 days", "2 days"]);
        let mut tracker = EnrollmentTracker::new();
        let id = tracker.enroll(&lead("L-1"), &campaign, t0()).expect("enroll").id;

        let after_first = tracker.advance(&id, &campaign, 0, t0()).expect("step 0");
        assert_eq!(after_first.next_touch_due, Some(t0() + Duration::days(3)));
        assert_eq!(after_first.last_touch_at, Some(t0()));

        let sent_late = t0() + Duration::days(4);
        let after_second = tracker.advance(&id, &campaign, 1, sent_late).expect("step 1");
        assert_eq!(after_second.next_touch_due, Some(t0() + Duration::days(5)));

        let done = tracker.advance(&id, &campaign, 2, t0() + Duration::days(5)).expect("step 2");
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert_eq!(done.next_touch_due, None);
        assert!(tracker.active_for_lead(&lead("L-1")).is_none());
    }

    #[test]
    fn out_of_order_advance_is_rejected() {
        let campaign = campaign("welcome", &["0", "1 day"]);
        let mut tracker = EnrollmentTracker::new();
        let id = tracker.enroll(&lead("L-1"), &campaign, t0()).expect("enroll").id;
        tracker.advance(&id, &campaign, 0, t0()).expect("step 0");

        let error = tracker.advance(&id, &campaign, 0, t0()).expect_err("replayed step");
        assert_eq!(
            error,
            EnrollmentError::OutOfOrderAdvance { enrollment_id: id.clone(), expected: 1, requested: 0 }
        );
        assert_eq!(tracker.get(&id).map(|e| e.current_step), Some(1));
    }

    #[test]
    fn paused_and_terminal_enrollments_do_not_advance() {
        let campaign = campaign("welcome", &["0", "1 day"]);
        let mut tracker = EnrollmentTracker::new();
        let id = tracker.enroll(&lead("L-1"), &campaign, t0()).expect("enroll").id;

        tracker.pause(&id, t0()).expect("pause");
        assert!(matches!(
            tracker.advance(&id, &campaign, 0, t0()),
            Err(EnrollmentError::NotActive { status: EnrollmentStatus::Paused, .. })
        ));
        assert!(tracker.due(t0() + Duration::days(10)).is_empty());

        tracker.resume(&id, t0()).expect("resume");
        tracker.handover(&id, t0()).expect("handover");
        assert!(matches!(
            tracker.pause(&id, t0()),
            Err(EnrollmentError::InvalidTransition { from: EnrollmentStatus::HandedOver, .. })
        ));
    }

    #[test]
    fn advance_rejects_a_different_campaign_revision() {
        let original = campaign("welcome", &["0", "1 day"]);
        let mut revised = original.clone();
        revised.revision = 2;

        let mut tracker = EnrollmentTracker::new();
        let id = tracker.enroll(&lead("L-1"), &original, t0()).expect("enroll").id;
        assert!(matches!(
            tracker.advance(&id, &revised, 0, t0()),
            Err(EnrollmentError::UnknownCampaign { revision: 2, .. })
        ));
    }

    #[test]
    fn due_lists_stale_enrollments_oldest_first() {
        let mut tracker = EnrollmentTracker::new();
        let early = tracker
            .enroll_with_id(EnrollmentId("E-early".into()), &lead("L-1"), &campaign("a", &["0"]), t0())
            .expect("enroll");
        let late = tracker
            .enroll_with_id(
                EnrollmentId("E-late".into()),
                &lead("L-2"),
                &campaign("b", &["1h"]),
                t0(),
            )
            .expect("enroll");

        assert_eq!(tracker.due(t0()), vec![early.id.clone()]);
        assert_eq!(tracker.due(t0() + Duration::days(30)), vec![early.id, late.id]);
    }

    #[test]
    fn restore_refuses_conflicting_active_records() {
        let mut tracker = EnrollmentTracker::new();
        let existing = tracker.enroll(&lead("L-1"), &campaign("a", &["0"]), t0()).expect("enroll");

        let mut duplicate = existing.clone();
        duplicate.id = EnrollmentId("E-dup".into());
        assert!(tracker.restore(duplicate.clone()).is_err());

        duplicate.status = EnrollmentStatus::Completed;
        tracker.restore(duplicate).expect("terminal record restores");
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn random_operations_never_double_enroll() {
        let campaigns = [campaign("a", &["0", "1 day"]), campaign("b", &["0"]), campaign("c", &["2h", "1h"])];
        let leads = [lead("L-1"), lead("L-2"), lead("L-3")];

        for seed in 0..32_u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut tracker = EnrollmentTracker::new();
            let mut now = t0();

            for _ in 0..200 {
                now += Duration::minutes(rng.gen_range(0..240));
                let ids: Vec<EnrollmentId> = tracker.iter().map(|e| e.id.clone()).collect();
                match rng.gen_range(0..5) {
                    0 | 1 => {
                        let lead = &leads[rng.gen_range(0..leads.len())];
                        let campaign = &campaigns[rng.gen_range(0..campaigns.len())];
                        let _ = tracker.enroll(lead, campaign, now);
                    }
                    2 if !ids.is_empty() => {
                        let _ = tracker.pause(&ids[rng.gen_range(0..ids.len())], now);
                    }
                    3 if !ids.is_empty() => {
                        let _ = tracker.resume(&ids[rng.gen_range(0..ids.len())], now);
                    }
                    4 if !ids.is_empty() => {
                        let id = &ids[rng.gen_range(0..ids.len())];
                        if let Some(enrollment) = tracker.get(id).cloned() {
                            let campaign = campaigns
                                .iter()
                                .find(|campaign| campaign.id == enrollment.campaign_id)
                                .expect("known campaign");
                            let _ = tracker.advance(id, campaign, enrollment.current_step, now);
                        }
                    }
                    _ => {}
                }

                let mut active: HashMap<&LeadId, usize> = HashMap::new();
                for enrollment in tracker.iter().filter(|e| e.is_active()) {
                    *active.entry(&enrollment.lead_id).or_default() += 1;
                }
                assert!(active.values().all(|count| *count <= 1), "seed {seed}: {active:?}");
                for lead in &leads {
                    let indexed = tracker.active_for_lead(lead).map(|e| e.id.clone());
                    let scanned = tracker
                        .iter()
                        .find(|e| e.is_active() && &e.lead_id == lead)
                        .map(|e| e.id.clone());
                    assert_eq!(indexed, scanned, "seed {seed}: index out of sync for {lead:?}");
                }
            }
        }
    }

    #[test]
    fn due_times_never_decrease_across_advances() {
        for seed in 0..16_u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let delays: Vec<String> =
                (0..rng.gen_range(1..8)).map(|_| rng.gen_range(0..5000).to_string()).collect();
            let delays: Vec<&str> = delays.iter().map(String::as_str).collect();
            let campaign = campaign("random", &delays);

            let mut tracker = EnrollmentTracker::new();
            let mut enrollment = tracker.enroll(&lead("L-1"), &campaign, t0()).expect("enroll");
            let mut previous = enrollment.next_touch_due;
            let mut now = t0();

            while enrollment.is_active() {
                now += Duration::minutes(rng.gen_range(0..10_000));
                enrollment = tracker
                    .advance(&enrollment.id, &campaign, enrollment.current_step, now)
                    .expect("in-order advance");
                if let (Some(before), Some(after)) = (previous, enrollment.next_touch_due) {
                    assert!(after >= before, "seed {seed}: {after} < {before}");
                }
                previous = enrollment.next_touch_due.or(previous);
            }
            assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        }
    }
}
