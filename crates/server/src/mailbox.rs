use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use cadence_core::domain::message::InboundMessage;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox connection failed: {0}")]
    Connect(String),
    #[error("mailbox fetch failed: {0}")]
    Fetch(String),
    #[error("mailbox could not mark message seen: {0}")]
    MarkSeen(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Source of normalized inbound messages. Implementations own the protocol
/// (IMAP or otherwise); the engine only ever sees `InboundMessage` values.
#[async_trait]
pub trait MailboxTransport: Send + Sync {
    async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, MailboxError>;
    async fn mark_seen(&self, message_id: &str) -> Result<(), MailboxError>;
}

#[derive(Default)]
pub struct NoopMailboxTransport;

#[async_trait]
impl MailboxTransport for NoopMailboxTransport {
    async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, MailboxError> {
        Ok(Vec::new())
    }

    async fn mark_seen(&self, _message_id: &str) -> Result<(), MailboxError> {
        Ok(())
    }
}

pub struct MailboxPoller {
    transport: Arc<dyn MailboxTransport>,
    retry_policy: RetryPolicy,
    noop: bool,
}

impl Default for MailboxPoller {
    fn default() -> Self {
        Self { transport: Arc::new(NoopMailboxTransport), retry_policy: RetryPolicy::default(), noop: true }
    }
}

impl MailboxPoller {
    pub fn new(transport: Arc<dyn MailboxTransport>, retry_policy: RetryPolicy) -> Self {
        Self { transport, retry_policy, noop: false }
    }

    pub fn is_noop_transport(&self) -> bool {
        self.noop
    }

    /// Fetches unseen messages, retrying with backoff. Exhausted retries yield
    /// an empty batch so the caller's loop keeps running.
    pub async fn poll(&self) -> Vec<InboundMessage> {
        for attempt in 0..=self.retry_policy.max_retries {
            match self.transport.fetch_unseen().await {
                Ok(messages) => {
                    if !messages.is_empty() {
                        info!(
                            event_name = "ingress.mailbox.fetched",
                            correlation_id = "mailbox",
                            attempt,
                            count = messages.len(),
                            "fetched unseen messages"
                        );
                    }
                    return messages;
                }
                Err(error) => {
                    warn!(
                        event_name = "ingress.mailbox.fetch_failed",
                        correlation_id = "mailbox",
                        attempt,
                        max_retries = self.retry_policy.max_retries,
                        error = %error,
                        "mailbox fetch failed"
                    );
                    if attempt >= self.retry_policy.max_retries {
                        warn!(
                            max_retries = self.retry_policy.max_retries,
                            "mailbox retries exhausted; skipping this poll"
                        );
                        return Vec::new();
                    }

                    let delay = self.retry_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Vec::new()
    }

    pub async fn acknowledge(&self, message_id: &str) {
        match self.transport.mark_seen(message_id).await {
            Ok(()) => debug!(
                event_name = "ingress.mailbox.marked_seen",
                correlation_id = %message_id,
                "marked message seen"
            ),
            Err(error) => warn!(
                event_name = "ingress.mailbox.marked_seen",
                correlation_id = %message_id,
                error = %error,
                "failed to mark message seen; it may be fetched again"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use cadence_core::domain::message::InboundMessage;
    use tokio::sync::Mutex;

    use super::{MailboxError, MailboxPoller, MailboxTransport, RetryPolicy};

    #[derive(Default)]
    pub(crate) struct ScriptedMailbox {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        batches: VecDeque<Result<Vec<InboundMessage>, MailboxError>>,
        fetch_calls: usize,
        seen: Vec<String>,
    }

    impl ScriptedMailbox {
        pub(crate) fn with_batches(batches: Vec<Result<Vec<InboundMessage>, MailboxError>>) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    batches: batches.into(),
                    fetch_calls: 0,
                    seen: Vec::new(),
                }),
            }
        }

        pub(crate) async fn fetch_calls(&self) -> usize {
            self.state.lock().await.fetch_calls
        }

        pub(crate) async fn seen(&self) -> Vec<String> {
            self.state.lock().await.seen.clone()
        }
    }

    #[async_trait]
    impl MailboxTransport for ScriptedMailbox {
        async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, MailboxError> {
            let mut state = self.state.lock().await;
            state.fetch_calls += 1;
            state.batches.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn mark_seen(&self, message_id: &str) -> Result<(), MailboxError> {
            self.state.lock().await.seen.push(message_id.to_owned());
            Ok(())
        }
    }

    pub(crate) fn no_delay() -> RetryPolicy {
        RetryPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 }
    }

    fn message(id: &str) -> InboundMessage {
        serde_json::from_value(serde_json::json!({
            "message_id": id,
            "from": "lee@example.com",
            "subject": "Inquiry",
            "received_at": "2026-05-04T09:00:00Z"
        }))
        .expect("message fixture")
    }

    #[tokio::test]
    async fn retries_after_fetch_failure() {
        let mailbox = Arc::new(ScriptedMailbox::with_batches(vec![
            Err(MailboxError::Connect("imap down".to_owned())),
            Ok(vec![message("<m-1>")]),
        ]));
        let poller = MailboxPoller::new(mailbox.clone(), no_delay());

        let messages = poller.poll().await;

        assert_eq!(messages.len(), 1);
        assert_eq!(mailbox.fetch_calls().await, 2);
    }

    #[tokio::test]
    async fn exhausts_retries_without_failing() {
        let mailbox = Arc::new(ScriptedMailbox::with_batches(vec![
            Err(MailboxError::Fetch("fail-1".to_owned())),
            Err(MailboxError::Fetch("fail-2".to_owned())),
            Err(MailboxError::Fetch("fail-3".to_owned())),
            Ok(vec![message("<never>")]),
        ]));
        let poller = MailboxPoller::new(mailbox.clone(), no_delay());

        assert!(poller.poll().await.is_empty());
        assert_eq!(mailbox.fetch_calls().await, 3);
    }

    #[tokio::test]
    async fn default_poller_uses_noop_transport() {
        let poller = MailboxPoller::default();
        assert!(poller.is_noop_transport());
        assert!(poller.poll().await.is_empty());
        poller.acknowledge("<m-1>").await;
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy { max_retries: 10, base_delay_ms: 100, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0).as_millis(), 100);
        assert_eq!(policy.backoff(2).as_millis(), 400);
        assert_eq!(policy.backoff(9).as_millis(), 1_000);
    }
}
