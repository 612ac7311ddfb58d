use sqlx::Row;

use cadence_core::domain::campaign::Channel;
use cadence_core::domain::conversation::{ConversationMessage, Direction};
use cadence_core::domain::lead::LeadId;

use super::{decode_error, parse_timestamp, ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationMessage, RepositoryError> {
    let direction: String = row.try_get("direction").map_err(decode_error)?;
    let channel: String = row.try_get("channel").map_err(decode_error)?;
    let sent_at: String = row.try_get("sent_at").map_err(decode_error)?;

    Ok(ConversationMessage {
        lead_id: LeadId(row.try_get("lead_id").map_err(decode_error)?),
        direction: Direction::parse(&direction)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown direction `{direction}`")))?,
        channel: Channel::parse(&channel)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown channel `{channel}`")))?,
        body: row.try_get("body").map_err(decode_error)?,
        sent_at: parse_timestamp("sent_at", &sent_at)?,
    })
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn append(&self, message: ConversationMessage) -> Result<(), RepositoryError> {
        insert_message(&self.pool, message).await
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT lead_id, direction, channel, body, sent_at
             FROM conversation_message WHERE lead_id = ? ORDER BY sent_at, id",
        )
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn list(&self) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT lead_id, direction, channel, body, sent_at
             FROM conversation_message ORDER BY sent_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }
}

pub(crate) async fn insert_message<'e, E>(
    executor: E,
    message: ConversationMessage,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO conversation_message (lead_id, direction, channel, body, sent_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(message.lead_id.0)
    .bind(message.direction.as_str())
    .bind(message.channel.as_str())
    .bind(message.body)
    .bind(message.sent_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use cadence_core::domain::campaign::Channel;
    use cadence_core::domain::conversation::ConversationMessage;
    use cadence_core::domain::lead::{Lead, LeadId};

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, LeadRepository, SqlLeadRepository};
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn history_comes_back_in_send_order() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let at = DateTime::parse_from_rfc3339("2026-04-01T10:00:00Z").expect("ts").with_timezone(&Utc);
        let lead_id = LeadId("lead_1".into());
        SqlLeadRepository::new(pool.clone())
            .save(Lead::new(lead_id.clone(), Some("a@example.com".into()), None, at).expect("lead"))
            .await
            .expect("lead");

        let repo = SqlConversationRepository::new(pool);
        let reply = ConversationMessage::inbound(lead_id.clone(), Channel::Sms, "yes please", at + Duration::hours(2));
        let touch = ConversationMessage::outbound(lead_id.clone(), Channel::Email, "[intro] touch 1 of 3", at);
        repo.append(reply.clone()).await.expect("append");
        repo.append(touch.clone()).await.expect("append");

        assert_eq!(repo.list_for_lead(&lead_id).await.expect("list"), vec![touch, reply]);
        assert!(repo.list_for_lead(&LeadId("lead_other".into())).await.expect("list").is_empty());
    }
}
