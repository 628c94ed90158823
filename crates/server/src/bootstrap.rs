use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use bookline_core::config::{AppConfig, ConfigError, LoadOptions};
use bookline_core::errors::MirrorSyncError;
use bookline_db::{connect_with_settings, migrations, DbPool};
use bookline_engine::processor::{EchoTurnProcessor, NoopDelivery};
use bookline_engine::{
    HttpMirrorStore, MessageCoordinator, MirrorReconciler, MirrorStore, NoopMirrorStore,
    SlotAllocator, TurnDriver,
};

/// The turn driver this binary wires up. Replies travel back in the webhook
/// response, so delivery is a no-op; the processor is the built-in echo
/// stand-in until a language-model integration is plugged in.
pub type InboundDriver = TurnDriver<EchoTurnProcessor, NoopDelivery>;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub driver: Arc<InboundDriver>,
    pub allocator: Arc<SlotAllocator>,
    pub reconciler: Arc<MirrorReconciler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("mirror client initialization failed: {0}")]
    Mirror(#[source] MirrorSyncError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let grid = config.slot_grid()?;
    let mirror: Arc<dyn MirrorStore> = if config.mirror.enabled {
        Arc::new(HttpMirrorStore::from_config(&config.mirror).map_err(BootstrapError::Mirror)?)
    } else {
        Arc::new(NoopMirrorStore)
    };
    info!(
        event_name = "system.bootstrap.mirror_mode",
        mirror_enabled = config.mirror.enabled,
        "mirror store initialized"
    );

    let allocator = Arc::new(SlotAllocator::new(db_pool.clone(), grid, Arc::clone(&mirror)));
    let reconciler = Arc::new(MirrorReconciler::new(db_pool.clone(), grid, mirror));
    let driver = Arc::new(TurnDriver::new(
        MessageCoordinator::new(db_pool.clone()),
        EchoTurnProcessor,
        NoopDelivery,
    ));

    Ok(Application { config, db_pool, driver, allocator, reconciler })
}
