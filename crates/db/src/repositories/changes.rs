use std::sync::Arc;

use async_trait::async_trait;

use cadence_core::domain::enrollment::EnrollmentStatus;
use cadence_core::engine::ChangeSet;

use super::conversation::insert_message;
use super::enrollment::upsert_enrollment;
use super::lead::upsert_lead;
use super::{ConversationRepository, EnrollmentRepository, LeadRepository, RepositoryError};
use crate::DbPool;

/// Persists one drained engine change set.
#[async_trait]
pub trait ChangeWriter: Send + Sync {
    async fn write(&self, changes: ChangeSet) -> Result<(), RepositoryError>;
}

/// Leads first, then enrollments leaving `active` before the ones entering it,
/// so the one-active-per-lead index never sees two at once. Messages go last.
fn in_write_order(mut changes: ChangeSet) -> ChangeSet {
    changes.enrollments.sort_by_key(|enrollment| enrollment.status == EnrollmentStatus::Active);
    changes
}

/// Writes the whole change set in a single transaction; any failure rolls it all back.
pub struct SqlChangeWriter {
    pool: DbPool,
}

impl SqlChangeWriter {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeWriter for SqlChangeWriter {
    async fn write(&self, changes: ChangeSet) -> Result<(), RepositoryError> {
        if changes.is_empty() {
            return Ok(());
        }
        let ChangeSet { leads, enrollments, messages } = in_write_order(changes);
        let mut tx = self.pool.begin().await?;

        for lead in leads {
            upsert_lead(&mut *tx, lead).await?;
        }
        for enrollment in enrollments {
            upsert_enrollment(&mut *tx, enrollment).await?;
        }
        for message in messages {
            insert_message(&mut *tx, message).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Writes through the individual repositories, one record at a time.
/// Upserts make a retried set safe; only a failure among messages can repeat one.
pub struct RepositoryChangeWriter {
    leads: Arc<dyn LeadRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

impl RepositoryChangeWriter {
    pub fn new(
        leads: Arc<dyn LeadRepository>,
        enrollments: Arc<dyn EnrollmentRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self { leads, enrollments, conversations }
    }
}

#[async_trait]
impl ChangeWriter for RepositoryChangeWriter {
    async fn write(&self, changes: ChangeSet) -> Result<(), RepositoryError> {
        let ChangeSet { leads, enrollments, messages } = in_write_order(changes);
        for lead in leads {
            self.leads.save(lead).await?;
        }
        for enrollment in enrollments {
            self.enrollments.save(enrollment).await?;
        }
        for message in messages {
            self.conversations.append(message).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use cadence_core::domain::campaign::{CampaignId, Channel};
    use cadence_core::domain::conversation::ConversationMessage;
    use cadence_core::domain::enrollment::{Enrollment, EnrollmentId, EnrollmentStatus};
    use cadence_core::domain::lead::{Lead, LeadId};
    use cadence_core::engine::ChangeSet;

    use super::{ChangeWriter, SqlChangeWriter};
    use crate::repositories::{
        ConversationRepository, EnrollmentRepository, LeadRepository, SqlConversationRepository,
        SqlEnrollmentRepository, SqlLeadRepository,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp").with_timezone(&Utc)
    }

    fn enrollment(id: &str, status: EnrollmentStatus, at: DateTime<Utc>) -> Enrollment {
        Enrollment {
            id: EnrollmentId(id.into()),
            lead_id: LeadId("lead_1".into()),
            campaign_id: CampaignId("new-inquiry".into()),
            campaign_revision: 1,
            current_step: 1,
            status,
            started_at: at,
            last_touch_at: Some(at),
            next_touch_due: (status == EnrollmentStatus::Active).then(|| at + Duration::days(2)),
            updated_at: at,
        }
    }

    fn change_set(at: DateTime<Utc>, enrollments: Vec<Enrollment>) -> ChangeSet {
        ChangeSet {
            leads: vec![Lead::new(LeadId("lead_1".into()), Some("a@example.com".into()), None, at)
                .expect("lead")],
            enrollments,
            messages: vec![ConversationMessage::inbound(
                LeadId("lead_1".into()),
                Channel::Email,
                "hello",
                at,
            )],
        }
    }

    async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn commits_every_record_of_a_change_set() {
        let pool = pool().await;
        let at = ts("2026-04-01T10:00:00Z");
        let writer = SqlChangeWriter::new(pool.clone());

        writer
            .write(change_set(
                at,
                vec![
                    enrollment("enr_new", EnrollmentStatus::Active, at),
                    enrollment("enr_old", EnrollmentStatus::Completed, at),
                ],
            ))
            .await
            .expect("write");

        assert_eq!(SqlLeadRepository::new(pool.clone()).list().await.expect("leads").len(), 1);
        assert_eq!(SqlEnrollmentRepository::new(pool.clone()).list().await.expect("enrollments").len(), 2);
        assert_eq!(SqlConversationRepository::new(pool).list().await.expect("messages").len(), 1);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_the_whole_set() {
        let pool = pool().await;
        let at = ts("2026-04-01T10:00:00Z");
        let writer = SqlChangeWriter::new(pool.clone());

        // two active enrollments for one lead trip the unique index
        let result = writer
            .write(change_set(
                at,
                vec![
                    enrollment("enr_a", EnrollmentStatus::Active, at),
                    enrollment("enr_b", EnrollmentStatus::Active, at),
                ],
            ))
            .await;

        assert!(result.is_err());
        assert!(SqlLeadRepository::new(pool.clone()).list().await.expect("leads").is_empty());
        assert!(SqlEnrollmentRepository::new(pool.clone()).list().await.expect("enrollments").is_empty());
        assert!(SqlConversationRepository::new(pool).list().await.expect("messages").is_empty());
    }
}
