use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use cadence_db::DbPool;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub status: Readiness,
    pub detail: String,
}

/// Enrollment counts by lifecycle status, read from storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub leads: i64,
    pub enrollments: BTreeMap<String, i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: Readiness,
    pub service: ComponentStatus,
    pub database: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineSnapshot>,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn spawn(bind_address: &str, port: u16, db_pool: DbPool) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint listening"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint stopped unexpectedly"
            );
        }
    });
    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let (database, pipeline) = match pipeline_snapshot(&state.db_pool).await {
        Ok(snapshot) => (
            ComponentStatus {
                status: Readiness::Ready,
                detail: format!("{} lead(s) on record", snapshot.leads),
            },
            Some(snapshot),
        ),
        Err(error) => (
            ComponentStatus {
                status: Readiness::Degraded,
                detail: format!("pipeline query failed: {error}"),
            },
            None,
        ),
    };

    let status = database.status;
    let report = HealthReport {
        status,
        service: ComponentStatus {
            status: Readiness::Ready,
            detail: "cadence-server runtime initialized".to_string(),
        },
        database,
        pipeline,
        checked_at: Utc::now().to_rfc3339(),
    };
    let code = match status {
        Readiness::Ready => StatusCode::OK,
        Readiness::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn pipeline_snapshot(pool: &DbPool) -> Result<PipelineSnapshot, sqlx::Error> {
    let leads = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM lead").fetch_one(pool).await?;
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM enrollment GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;
    Ok(PipelineSnapshot { leads, enrollments: rows.into_iter().collect() })
}
