use std::sync::Arc;

use cadence_core::audit::AuditSink;
use cadence_core::engine::{
    ChangeSet, Collaborators, DeliveryDispatcher, HumanNotifier, InMemoryLeadStore, OutreachEngine,
};
use cadence_core::playbook::Playbook;
use cadence_db::repositories::{
    ChangeWriter, ConversationRepository, EnrollmentRepository, LeadRepository,
    RepositoryChangeWriter, RepositoryError, SqlChangeWriter, SqlConversationRepository,
    SqlEnrollmentRepository, SqlLeadRepository,
};
use cadence_db::DbPool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("stored state rejected by the engine: {0}")]
    Restore(String),
}

/// Engine collaborators other than the lead store, which is rebuilt from the database.
#[derive(Clone)]
pub struct EngineParts {
    pub dispatcher: Arc<dyn DeliveryDispatcher>,
    pub notifier: Arc<dyn HumanNotifier>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Clone)]
pub struct Persistence {
    leads: Arc<dyn LeadRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    conversations: Arc<dyn ConversationRepository>,
    writer: Arc<dyn ChangeWriter>,
}

impl Persistence {
    /// Writes go through the same repositories, one record at a time.
    pub fn new(
        leads: Arc<dyn LeadRepository>,
        enrollments: Arc<dyn EnrollmentRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        let writer = Arc::new(RepositoryChangeWriter::new(
            Arc::clone(&leads),
            Arc::clone(&enrollments),
            Arc::clone(&conversations),
        ));
        Self { leads, enrollments, conversations, writer }
    }

    /// Each saved change set is one SQLite transaction.
    pub fn sql(pool: DbPool) -> Self {
        Self {
            leads: Arc::new(SqlLeadRepository::new(pool.clone())),
            enrollments: Arc::new(SqlEnrollmentRepository::new(pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(pool.clone())),
            writer: Arc::new(SqlChangeWriter::new(pool)),
        }
    }

    /// Builds an engine whose lead store, enrollments and conversations come from storage.
    pub async fn restore_engine(
        &self,
        playbook: Playbook,
        parts: EngineParts,
        max_touches_per_tick: usize,
    ) -> Result<OutreachEngine, PersistenceError> {
        let leads = self.leads.list().await?;
        let lead_count = leads.len();
        let collaborators = Collaborators {
            leads: Arc::new(InMemoryLeadStore::with_leads(leads)),
            dispatcher: parts.dispatcher,
            notifier: parts.notifier,
            audit: parts.audit,
        };
        let mut engine =
            OutreachEngine::new(playbook, collaborators).with_touch_limit(max_touches_per_tick);

        let enrollments = self.enrollments.list().await?;
        let enrollment_count = enrollments.len();
        for enrollment in enrollments {
            engine
                .restore_enrollment(enrollment)
                .map_err(|error| PersistenceError::Restore(error.to_string()))?;
        }
        let messages = self.conversations.list().await?;
        let message_count = messages.len();
        engine.restore_conversation(messages);

        info!(
            event_name = "system.bootstrap.state_restored",
            correlation_id = "bootstrap",
            leads = lead_count,
            enrollments = enrollment_count,
            messages = message_count,
            "engine state restored from storage"
        );
        Ok(engine)
    }

    pub async fn save(&self, changes: ChangeSet) -> Result<(), PersistenceError> {
        self.writer.write(changes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};

    use cadence_core::audit::InMemoryAuditSink;
    use cadence_core::domain::campaign::CampaignId;
    use cadence_core::domain::enrollment::EnrollmentStatus;
    use cadence_core::domain::lead::{Lead, LeadId};
    use cadence_core::engine::{RecordingDispatcher, RecordingNotifier};
    use cadence_core::playbook::Playbook;
    use cadence_db::repositories::{
        EnrollmentRepository, InMemoryConversationRepository, InMemoryEnrollmentRepository,
        InMemoryLeadRepository, LeadRepository,
    };
    use cadence_db::{connect_with_settings, migrations};

    use super::{EngineParts, Persistence};

    const PLAYBOOK: &str = r#"
[[campaigns]]
id = "welcome"
steps = [{ template = "hello" }, { template = "follow-up", delay = "1 day" }]

[[campaigns]]
id = "winback"
steps = [{ template = "miss-you" }]
"#;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp").with_timezone(&Utc)
    }

    fn parts() -> EngineParts {
        EngineParts {
            dispatcher: Arc::new(RecordingDispatcher::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            audit: Arc::new(InMemoryAuditSink::default()),
        }
    }

    #[tokio::test]
    async fn restores_engine_from_memory_repositories() {
        let leads = Arc::new(InMemoryLeadRepository::default());
        let enrollments = Arc::new(InMemoryEnrollmentRepository::default());
        let persistence = Persistence::new(
            leads.clone(),
            enrollments.clone(),
            Arc::new(InMemoryConversationRepository::default()),
        );
        let now = ts("2026-05-04T09:00:00Z");
        let lead = Lead::new(LeadId("lead_1".into()), Some("a@example.com".into()), None, now)
            .expect("lead");
        leads.save(lead).await.expect("save lead");

        let playbook = Playbook::from_toml_str(PLAYBOOK).expect("playbook");
        let mut engine = persistence.restore_engine(playbook, parts(), 10).await.expect("engine");
        engine
            .enroll(&LeadId("lead_1".into()), &CampaignId("welcome".into()), now)
            .expect("enroll restored lead");

        persistence.save(engine.drain_changes().expect("changes")).await.expect("save changes");
        let stored = enrollments.list().await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, EnrollmentStatus::Active);
    }

    #[tokio::test]
    async fn saves_released_enrollment_before_new_active_one() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        let persistence = Persistence::sql(pool.clone());
        let now = ts("2026-05-04T09:00:00Z");

        let lead_id = LeadId("lead_1".into());
        let lead = Lead::new(lead_id.clone(), Some("a@example.com".into()), None, now).expect("lead");
        persistence.leads.save(lead).await.expect("save lead");

        let playbook = Playbook::from_toml_str(PLAYBOOK).expect("playbook");
        let mut engine = persistence.restore_engine(playbook, parts(), 10).await.expect("engine");
        let first = engine.enroll(&lead_id, &CampaignId("welcome".into()), now).expect("enroll");
        persistence.save(engine.drain_changes().expect("changes")).await.expect("first save");

        engine.complete_enrollment(&first.id, now).expect("complete");
        engine.enroll(&lead_id, &CampaignId("winback".into()), now).expect("re-enroll");
        persistence.save(engine.drain_changes().expect("changes")).await.expect("second save");

        let stored = persistence.enrollments.list_for_lead(&lead_id).await.expect("list");
        assert_eq!(stored.len(), 2);
        let active = stored.iter().filter(|e| e.status == EnrollmentStatus::Active).count();
        assert_eq!(active, 1);

        pool.close().await;
    }
}
