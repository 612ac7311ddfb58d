use sqlx::Row;

use cadence_core::domain::campaign::CampaignId;
use cadence_core::domain::enrollment::{Enrollment, EnrollmentId, EnrollmentStatus};
use cadence_core::domain::lead::LeadId;

use super::{
    decode_error, parse_optional_timestamp, parse_timestamp, EnrollmentRepository, RepositoryError,
};
use crate::DbPool;

const ENROLLMENT_COLUMNS: &str = "id, lead_id, campaign_id, campaign_revision, current_step, status,
                                  started_at, last_touch_at, next_touch_due, updated_at";

pub struct SqlEnrollmentRepository {
    pool: DbPool,
}

impl SqlEnrollmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_enrollment(row: &sqlx::sqlite::SqliteRow) -> Result<Enrollment, RepositoryError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let revision: i64 = row.try_get("campaign_revision").map_err(decode_error)?;
    let step: i64 = row.try_get("current_step").map_err(decode_error)?;
    let started_at: String = row.try_get("started_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(Enrollment {
        id: EnrollmentId(row.try_get("id").map_err(decode_error)?),
        lead_id: LeadId(row.try_get("lead_id").map_err(decode_error)?),
        campaign_id: CampaignId(row.try_get("campaign_id").map_err(decode_error)?),
        campaign_revision: u32::try_from(revision).map_err(decode_error)?,
        current_step: usize::try_from(step).map_err(decode_error)?,
        status: EnrollmentStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown enrollment status `{status}`")))?,
        started_at: parse_timestamp("started_at", &started_at)?,
        last_touch_at: parse_optional_timestamp(
            "last_touch_at",
            row.try_get("last_touch_at").map_err(decode_error)?,
        )?,
        next_touch_due: parse_optional_timestamp(
            "next_touch_due",
            row.try_get("next_touch_due").map_err(decode_error)?,
        )?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl EnrollmentRepository for SqlEnrollmentRepository {
    async fn find_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollment WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_enrollment).transpose()
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<Enrollment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollment WHERE lead_id = ? ORDER BY started_at, id"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_enrollment).collect()
    }

    async fn list(&self) -> Result<Vec<Enrollment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollment ORDER BY started_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_enrollment).collect()
    }

    async fn save(&self, enrollment: Enrollment) -> Result<(), RepositoryError> {
        upsert_enrollment(&self.pool, enrollment).await
    }
}

pub(crate) async fn upsert_enrollment<'e, E>(
    executor: E,
    enrollment: Enrollment,
) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let step = i64::try_from(enrollment.current_step).map_err(decode_error)?;

    sqlx::query(
        "INSERT INTO enrollment (id, lead_id, campaign_id, campaign_revision, current_step, status,
                                 started_at, last_touch_at, next_touch_due, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             current_step = excluded.current_step,
             status = excluded.status,
             last_touch_at = excluded.last_touch_at,
             next_touch_due = excluded.next_touch_due,
             updated_at = excluded.updated_at",
    )
    .bind(enrollment.id.0)
    .bind(enrollment.lead_id.0)
    .bind(enrollment.campaign_id.0)
    .bind(i64::from(enrollment.campaign_revision))
    .bind(step)
    .bind(enrollment.status.as_str())
    .bind(enrollment.started_at.to_rfc3339())
    .bind(enrollment.last_touch_at.map(|at| at.to_rfc3339()))
    .bind(enrollment.next_touch_due.map(|at| at.to_rfc3339()))
    .bind(enrollment.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}
