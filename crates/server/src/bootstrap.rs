use std::sync::Arc;

use nsmr_core::audit::TracingAuditSink;
use nsmr_core::config::{AppConfig, ConfigError, LoadOptions};
use nsmr_core::errors::WorkflowError;
use nsmr_db::{connect_with_config, migrations, DbPool};
use nsmr_workflow::WorkflowService;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<WorkflowService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("admin bootstrap failed: {0}")]
    AdminBootstrap(#[source] WorkflowError),
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

    let service = WorkflowService::sqlite(db_pool.clone(), Arc::new(TracingAuditSink));
    let admins = config.workflow.bootstrap_principals();
    let granted =
        service.bootstrap_admins(&admins).await.map_err(BootstrapError::AdminBootstrap)?;
    info!(
        event_name = "system.bootstrap.admins_provisioned",
        correlation_id = "bootstrap",
        configured = admins.len(),
        granted,
        "bootstrap admins provisioned"
    );

    Ok(Application { config, db_pool, service: Arc::new(service) })
}
