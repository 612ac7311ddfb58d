use std::sync::Arc;
use std::time::Duration;

use cadence_core::audit::TracingAuditSink;
use cadence_core::config::{AppConfig, ConfigError, LoadOptions};
use cadence_core::playbook::{Playbook, PlaybookError};
use cadence_db::{connect_with_config, migrations, DbPool};
use thiserror::Error;
use tracing::{info, warn};

use crate::mailbox::MailboxPoller;
use crate::outbound::{LoggingDispatcher, LoggingNotifier};
use crate::persistence::{EngineParts, Persistence, PersistenceError};
use crate::runner::{RunnerSettings, TickRunner};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runner: TickRunner,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("playbook failed to load: {0}")]
    Playbook(#[from] PlaybookError),
    #[error("engine state could not be restored: {0}")]
    Restore(#[from] PersistenceError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let playbook =
        Playbook::load_with_channel(&config.playbook.path, config.scheduler.default_channel)?;

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let persistence = Persistence::sql(db_pool.clone());
    let parts = EngineParts {
        dispatcher: Arc::new(LoggingDispatcher),
        notifier: Arc::new(LoggingNotifier),
        audit: Arc::new(TracingAuditSink),
    };
    let engine = persistence
        .restore_engine(playbook, parts, config.scheduler.max_touches_per_tick)
        .await?;

    let poll_interval = if config.mailbox.enabled {
        warn!(
            event_name = "system.bootstrap.mailbox_transport",
            correlation_id = "bootstrap",
            host = config.mailbox.host.as_deref().unwrap_or("unknown"),
            "no mailbox transport is linked into this build; polling the no-op transport"
        );
        Some(Duration::from_secs(config.mailbox.poll_interval_secs))
    } else {
        None
    };
    let runner = TickRunner::new(
        engine,
        persistence,
        MailboxPoller::default(),
        RunnerSettings {
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs),
            poll_interval,
        },
    );

    Ok(Application { config, db_pool, runner })
}
