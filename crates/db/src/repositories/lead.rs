use std::collections::{BTreeMap, BTreeSet};

use sqlx::Row;

use cadence_core::domain::enrollment::EnrollmentId;
use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};

use super::{decode_error, parse_optional_timestamp, parse_timestamp, LeadRepository, RepositoryError};
use crate::DbPool;

const LEAD_COLUMNS: &str = "id, name, email, phone, notes, qualification_score, tags_json, status,
                            source, priority, goal_progress_json, enrollment_id, handed_over_at,
                            created_at, updated_at";

pub struct SqlLeadRepository {
    pool: DbPool,
}

impl SqlLeadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_lead(row: &sqlx::sqlite::SqliteRow) -> Result<Lead, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let score: i64 = row.try_get("qualification_score").map_err(decode_error)?;
    let tags_json: String = row.try_get("tags_json").map_err(decode_error)?;
    let goals_json: String = row.try_get("goal_progress_json").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).map_err(decode_error)?;
    let goal_progress: BTreeMap<String, bool> =
        serde_json::from_str(&goals_json).map_err(decode_error)?;

    Ok(Lead {
        id: LeadId(row.try_get("id").map_err(decode_error)?),
        name: row.try_get("name").map_err(decode_error)?,
        email: row.try_get("email").map_err(decode_error)?,
        phone: row.try_get("phone").map_err(decode_error)?,
        notes: row.try_get("notes").map_err(decode_error)?,
        qualification_score: u8::try_from(score)
            .map_err(|_| RepositoryError::Decode(format!("qualification_score out of range: {score}")))?,
        tags,
        status: LeadStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown lead status `{status}`")))?,
        source: row.try_get("source").map_err(decode_error)?,
        priority: row.try_get("priority").map_err(decode_error)?,
        goal_progress,
        enrollment_id: row
            .try_get::<Option<String>, _>("enrollment_id")
            .map_err(decode_error)?
            .map(EnrollmentId),
        handed_over_at: parse_optional_timestamp(
            "handed_over_at",
            row.try_get("handed_over_at").map_err(decode_error)?,
        )?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl LeadRepository for SqlLeadRepository {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lead).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE email = ?"))
            .bind(email.trim().to_ascii_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lead).transpose()
    }

    async fn list(&self) -> Result<Vec<Lead>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead ORDER BY created_at, id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_lead).collect()
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        upsert_lead(&self.pool, lead).await
    }
}

/// Shared by the repository and the transactional change writer.
pub(crate) async fn upsert_lead<'e, E>(executor: E, lead: Lead) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let tags_json = serde_json::to_string(&lead.tags).map_err(decode_error)?;
    let goals_json = serde_json::to_string(&lead.goal_progress).map_err(decode_error)?;

    sqlx::query(
        "INSERT INTO lead (id, name, email, phone, notes, qualification_score, tags_json, status,
                           source, priority, goal_progress_json, enrollment_id, handed_over_at,
                           created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             email = excluded.email,
             phone = excluded.phone,
             notes = excluded.notes,
             qualification_score = excluded.qualification_score,
             tags_json = excluded.tags_json,
             status = excluded.status,
             source = excluded.source,
             priority = excluded.priority,
             goal_progress_json = excluded.goal_progress_json,
             enrollment_id = excluded.enrollment_id,
             handed_over_at = excluded.handed_over_at,
             updated_at = excluded.updated_at",
    )
    .bind(lead.id.0)
    .bind(lead.name)
    .bind(lead.email)
    .bind(lead.phone)
    .bind(lead.notes)
    .bind(i64::from(lead.qualification_score))
    .bind(tags_json)
    .bind(lead.status.as_str())
    .bind(lead.source)
    .bind(lead.priority)
    .bind(goals_json)
    .bind(lead.enrollment_id.map(|id| id.0))
    .bind(lead.handed_over_at.map(|at| at.to_rfc3339()))
    .bind(lead.created_at.to_rfc3339())
    .bind(lead.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}
