use std::sync::Arc;
use std::time::Duration;

use cadence_core::engine::{Ingestion, OutreachEngine, TickReport};
use cadence_core::errors::ApplicationError;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::mailbox::MailboxPoller;
use crate::persistence::{Persistence, PersistenceError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("tick runner is already started")]
    AlreadyStarted,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Engine(#[from] ApplicationError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunnerSettings {
    pub tick_interval: Duration,
    /// `None` leaves the mailbox unpolled.
    pub poll_interval: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub classified: usize,
    pub replies: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct RunnerCore {
    engine: Mutex<OutreachEngine>,
    persistence: Persistence,
    mailbox: MailboxPoller,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Drives the engine from a timer. Every engine call goes through one mutex,
/// so no enrollment is ever advanced by two callers at once.
pub struct TickRunner {
    core: Arc<RunnerCore>,
    settings: RunnerSettings,
    running: Option<Running>,
}

impl TickRunner {
    pub fn new(
        engine: OutreachEngine,
        persistence: Persistence,
        mailbox: MailboxPoller,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            core: Arc::new(RunnerCore { engine: Mutex::new(engine), persistence, mailbox }),
            settings,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_noop_mailbox(&self) -> bool {
        self.core.mailbox.is_noop_transport()
    }

    /// Runs `f` with exclusive access to the engine, then persists whatever it changed.
    pub async fn with_engine<T>(
        &self,
        f: impl FnOnce(&mut OutreachEngine) -> T,
    ) -> Result<T, RunnerError> {
        self.core.with_engine(f).await
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RunnerError> {
        self.core.tick(now).await
    }

    pub async fn poll_mailbox(&self, now: DateTime<Utc>) -> Result<PollReport, RunnerError> {
        self.core.poll_mailbox(now).await
    }

    pub fn start(&mut self) -> Result<(), RunnerError> {
        if self.running.is_some() {
            return Err(RunnerError::AlreadyStarted);
        }

        let (shutdown, mut stop) = watch::channel(false);
        let core = Arc::clone(&self.core);
        let settings = self.settings;
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(settings.tick_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut polls = tokio::time::interval(settings.poll_interval.unwrap_or(settings.tick_interval));
            polls.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticks.tick() => {
                        if let Err(error) = core.tick(Utc::now()).await {
                            error!(
                                event_name = "scheduler.runner.tick_failed",
                                correlation_id = "runner",
                                error = %error,
                                "tick failed; will retry on the next interval"
                            );
                        }
                    }
                    _ = polls.tick(), if settings.poll_interval.is_some() => {
                        if let Err(error) = core.poll_mailbox(Utc::now()).await {
                            error!(
                                event_name = "ingress.mailbox.poll_failed",
                                correlation_id = "runner",
                                error = %error,
                                "mailbox poll failed; will retry on the next interval"
                            );
                        }
                    }
                }
            }
        });

        info!(
            event_name = "scheduler.runner.started",
            correlation_id = "runner",
            tick_interval_ms = self.settings.tick_interval.as_millis() as u64,
            mailbox_polling = self.settings.poll_interval.is_some(),
            "tick runner started"
        );
        self.running = Some(Running { shutdown, task });
        Ok(())
    }

    /// Signals the loop and waits for the in-flight cycle to finish.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(error) = running.task.await {
            warn!(
                event_name = "scheduler.runner.join_failed",
                correlation_id = "runner",
                error = %error,
                "tick runner task ended abnormally"
            );
        }
        info!(event_name = "scheduler.runner.stopped", correlation_id = "runner", "tick runner stopped");
    }
}

impl RunnerCore {
    async fn with_engine<T>(
        &self,
        f: impl FnOnce(&mut OutreachEngine) -> T,
    ) -> Result<T, RunnerError> {
        let mut engine = self.engine.lock().await;
        let value = f(&mut engine);
        let changes = engine.drain_changes()?;
        if let Err(error) = self.persistence.save(changes.clone()).await {
            warn!(
                event_name = "scheduler.runner.save_failed",
                correlation_id = "runner",
                leads = changes.leads.len(),
                enrollments = changes.enrollments.len(),
                messages = changes.messages.len(),
                error = %error,
                "change set not stored; kept for the next cycle"
            );
            engine.requeue(changes);
            return Err(error.into());
        }
        Ok(value)
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RunnerError> {
        self.with_engine(|engine| engine.tick(now)).await
    }

    async fn poll_mailbox(&self, now: DateTime<Utc>) -> Result<PollReport, RunnerError> {
        let messages = self.mailbox.poll().await;
        let mut report = PollReport { fetched: messages.len(), ..PollReport::default() };
        if messages.is_empty() {
            return Ok(report);
        }

        let mut processed = Vec::with_capacity(messages.len());
        self.with_engine(|engine| {
            for message in &messages {
                match engine.ingest(message, now) {
                    Ok(Ingestion::Classified { .. }) => report.classified += 1,
                    Ok(Ingestion::Reply { .. }) => report.replies += 1,
                    Ok(Ingestion::UnknownReply { .. } | Ingestion::NoMatch | Ingestion::Unparseable { .. }) => {
                        report.skipped += 1
                    }
                    Err(ApplicationError::Persistence(reason)) => {
                        report.failed += 1;
                        warn!(
                            event_name = "ingress.mailbox.ingest_failed",
                            correlation_id = %message.message_id,
                            error = %reason,
                            "lead store unavailable; message left unseen"
                        );
                        continue;
                    }
                    Err(error) => {
                        report.failed += 1;
                        warn!(
                            event_name = "ingress.mailbox.ingest_failed",
                            correlation_id = %message.message_id,
                            error = %error,
                            "inbound message rejected"
                        );
                    }
                }
                processed.push(message.message_id.clone());
            }
        })
        .await?;

        for message_id in &processed {
            self.mailbox.acknowledge(message_id).await;
        }
        info!(
            event_name = "ingress.mailbox.poll_complete",
            correlation_id = "runner",
            fetched = report.fetched,
            classified = report.classified,
            replies = report.replies,
            skipped = report.skipped,
            failed = report.failed,
            "mailbox poll complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use cadence_core::audit::InMemoryAuditSink;
    use cadence_core::domain::enrollment::{Enrollment, EnrollmentId};
    use cadence_core::domain::lead::LeadId;
    use cadence_core::domain::message::InboundMessage;
    use cadence_core::engine::{RecordingDispatcher, RecordingNotifier};
    use cadence_core::playbook::Playbook;
    use cadence_db::repositories::{
        ConversationRepository, EnrollmentRepository, InMemoryConversationRepository,
        InMemoryEnrollmentRepository, InMemoryLeadRepository, LeadRepository, RepositoryError,
    };
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::{RunnerError, RunnerSettings, TickRunner};
    use crate::mailbox::tests::{no_delay, ScriptedMailbox};
    use crate::mailbox::{MailboxError, MailboxPoller};
    use crate::persistence::{EngineParts, Persistence};

    const PLAYBOOK: &str = r#"
[[campaigns]]
id = "welcome"
steps = [{ template = "hello" }, { template = "follow-up", delay = "1 day" }]

[[rules]]
id = "inquiry"
conditions = { subject = "inquiry" }
actions = { create_lead = true, campaign = "welcome" }
"#;

    struct Fixture {
        runner: TickRunner,
        mailbox: Arc<ScriptedMailbox>,
        dispatcher: RecordingDispatcher,
        leads: Arc<InMemoryLeadRepository>,
        enrollments: Arc<InMemoryEnrollmentRepository>,
        conversations: Arc<InMemoryConversationRepository>,
    }

    async fn fixture(
        batches: Vec<Result<Vec<InboundMessage>, MailboxError>>,
        settings: RunnerSettings,
    ) -> Fixture {
        let leads = Arc::new(InMemoryLeadRepository::default());
        let enrollments = Arc::new(InMemoryEnrollmentRepository::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let persistence = Persistence::new(leads.clone(), enrollments.clone(), conversations.clone());
        let dispatcher = RecordingDispatcher::default();
        let parts = EngineParts {
            dispatcher: Arc::new(dispatcher.clone()),
            notifier: Arc::new(RecordingNotifier::default()),
            audit: Arc::new(InMemoryAuditSink::default()),
        };
        let playbook = Playbook::from_toml_str(PLAYBOOK).expect("playbook");
        let engine = persistence.restore_engine(playbook, parts, 10).await.expect("engine");
        let mailbox = Arc::new(ScriptedMailbox::with_batches(batches));
        let runner = TickRunner::new(
            engine,
            persistence,
            MailboxPoller::new(mailbox.clone(), no_delay()),
            settings,
        );
        Fixture { runner, mailbox, dispatcher, leads, enrollments, conversations }
    }

    fn manual() -> RunnerSettings {
        RunnerSettings { tick_interval: Duration::from_secs(3_600), poll_interval: None }
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).expect("timestamp").with_timezone(&Utc)
    }

    fn message(id: &str, subject: &str, from: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            from: from.to_string(),
            to: Vec::new(),
            subject: subject.to_string(),
            body_text: "Hello there".to_string(),
            has_attachment: false,
            in_reply_to: None,
            references: Vec::new(),
            received_at: ts("2026-05-04T09:00:00Z"),
        }
    }

    #[tokio::test]
    async fn poll_ingests_acknowledges_and_persists() {
        let fixture = fixture(
            vec![Ok(vec![
                message("<m-1>", "Inquiry about a van", "Lee <lee@example.com>"),
                message("<m-2>", "Lunch?", "pat@example.com"),
                message("<m-3>", "Inquiry", ""),
            ])],
            manual(),
        )
        .await;
        let now = ts("2026-05-04T09:00:00Z");

        let report = fixture.runner.poll_mailbox(now).await.expect("poll");

        assert_eq!(report.fetched, 3);
        assert_eq!(report.classified, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(fixture.mailbox.seen().await, vec!["<m-1>", "<m-2>", "<m-3>"]);
        assert_eq!(fixture.leads.list().await.expect("leads").len(), 1);
        assert_eq!(fixture.enrollments.list().await.expect("enrollments").len(), 1);
    }

    #[tokio::test]
    async fn tick_sends_due_touch_and_persists_progress() {
        let fixture = fixture(
            vec![Ok(vec![message("<m-1>", "Inquiry", "lee@example.com")])],
            manual(),
        )
        .await;
        let now = ts("2026-05-04T09:00:00Z");
        fixture.runner.poll_mailbox(now).await.expect("poll");

        let report = fixture.runner.tick(now).await.expect("tick");
        assert_eq!(report.sent.len(), 1);
        assert_eq!(fixture.dispatcher.sent().len(), 1);

        let enrollment = fixture.enrollments.list().await.expect("list").remove(0);
        assert_eq!(enrollment.current_step, 1);
        assert_eq!(enrollment.next_touch_due, Some(now + ChronoDuration::days(1)));
        assert_eq!(fixture.conversations.list().await.expect("messages").len(), 2);

        let early = fixture.runner.tick(now + ChronoDuration::hours(2)).await.expect("tick");
        assert!(early.sent.is_empty());
    }

    #[tokio::test]
    async fn with_engine_persists_operator_changes() {
        let fixture = fixture(
            vec![Ok(vec![message("<m-1>", "Inquiry", "lee@example.com")])],
            manual(),
        )
        .await;
        let now = ts("2026-05-04T09:00:00Z");
        fixture.runner.poll_mailbox(now).await.expect("poll");

        let enrollment_id = fixture.enrollments.list().await.expect("list").remove(0).id;
        fixture
            .runner
            .with_engine(|engine| engine.pause_enrollment(&enrollment_id, now))
            .await
            .expect("runner")
            .expect("pause");

        let stored = fixture.enrollments.list().await.expect("list").remove(0);
        assert_eq!(stored.status.as_str(), "paused");
        assert!(fixture.runner.tick(now).await.expect("tick").sent.is_empty());
    }

    /// Fails the next `save` once when armed.
    #[derive(Default)]
    struct FlakyEnrollments {
        inner: InMemoryEnrollmentRepository,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl EnrollmentRepository for FlakyEnrollments {
        async fn find_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Enrollment>, RepositoryError> {
            self.inner.list_for_lead(lead_id).await
        }

        async fn list(&self) -> Result<Vec<Enrollment>, RepositoryError> {
            self.inner.list().await
        }

        async fn save(&self, enrollment: Enrollment) -> Result<(), RepositoryError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RepositoryError::Decode("disk full".to_string()));
            }
            self.inner.save(enrollment).await
        }
    }

    #[tokio::test]
    async fn failed_save_keeps_changes_for_the_next_cycle() {
        let enrollments = Arc::new(FlakyEnrollments::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let persistence = Persistence::new(
            Arc::new(InMemoryLeadRepository::default()),
            enrollments.clone(),
            conversations.clone(),
        );
        let dispatcher = RecordingDispatcher::default();
        let parts = EngineParts {
            dispatcher: Arc::new(dispatcher.clone()),
            notifier: Arc::new(RecordingNotifier::default()),
            audit: Arc::new(InMemoryAuditSink::default()),
        };
        let playbook = Playbook::from_toml_str(PLAYBOOK).expect("playbook");
        let engine = persistence.restore_engine(playbook, parts, 10).await.expect("engine");
        let mailbox = Arc::new(ScriptedMailbox::with_batches(vec![Ok(vec![message(
            "<m-1>",
            "Inquiry",
            "lee@example.com",
        )])]));
        let runner = TickRunner::new(engine, persistence, MailboxPoller::new(mailbox, no_delay()), manual());
        let now = ts("2026-05-04T09:00:00Z");
        runner.poll_mailbox(now).await.expect("poll");

        enrollments.fail_next.store(true, Ordering::SeqCst);
        let failed = runner.tick(now).await;
        assert!(matches!(failed, Err(RunnerError::Persistence(_))));
        assert_eq!(dispatcher.sent().len(), 1);
        assert_eq!(enrollments.list().await.expect("list").remove(0).current_step, 0);

        // nothing is due, but the retained set is written on the next cycle
        let retried = runner.tick(now + ChronoDuration::minutes(1)).await.expect("tick");
        assert!(retried.sent.is_empty());
        assert_eq!(dispatcher.sent().len(), 1);
        assert_eq!(enrollments.list().await.expect("list").remove(0).current_step, 1);
        assert_eq!(conversations.list().await.expect("messages").len(), 2);
    }

    #[tokio::test]
    async fn start_and_stop_drive_the_loop() {
        let mut fixture = fixture(
            vec![Ok(vec![message("<m-1>", "Inquiry", "lee@example.com")])],
            RunnerSettings {
                tick_interval: Duration::from_millis(10),
                poll_interval: Some(Duration::from_millis(10)),
            },
        )
        .await;

        fixture.runner.start().expect("start");
        assert!(fixture.runner.is_running());
        assert!(matches!(fixture.runner.start(), Err(RunnerError::AlreadyStarted)));

        let mut sent = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sent = fixture.dispatcher.sent().len();
            if sent > 0 {
                break;
            }
        }
        fixture.runner.stop().await;

        assert!(!fixture.runner.is_running());
        assert_eq!(sent, 1, "first touch should go out once the lead is enrolled");
        assert!(fixture.mailbox.fetch_calls().await >= 1);
    }
}
