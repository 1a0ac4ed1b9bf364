use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use upsell_core::affinity::AffinitySource;
use upsell_core::catalog::CatalogAdapter;
use upsell_core::config::{AppConfig, ConfigError, EngineConfig, LoadOptions};
use upsell_db::{
    connect_with_config, migrations, DbPool, RuleIndexRepository, RuleRepository,
    SqlRuleIndexRepository, SqlRuleRepository,
};

use crate::admin::RuleAdmin;
use crate::coupons::CouponAutoApply;
use crate::executor::ActionExecutor;
use crate::index_builder::IndexBuilder;
use crate::matcher::Matcher;
use crate::recommendations::RecommendationService;

/// The engine's services, wired over shared stores and collaborators.
pub struct UpsellEngine {
    pub admin: RuleAdmin,
    pub recommendations: RecommendationService,
    pub coupons: CouponAutoApply,
}

impl UpsellEngine {
    pub fn new(
        config: &EngineConfig,
        rules: Arc<dyn RuleRepository>,
        index: Arc<dyn RuleIndexRepository>,
        catalog: Arc<dyn CatalogAdapter>,
        affinity: Arc<dyn AffinitySource>,
    ) -> Self {
        let builder = IndexBuilder::new(rules.clone(), index.clone(), catalog.clone(), config);
        let matcher = Matcher::new(rules.clone(), index.clone(), catalog.clone());
        let executor = ActionExecutor::new(catalog.clone(), affinity, config.clone());

        Self {
            admin: RuleAdmin::new(rules.clone(), index, builder),
            recommendations: RecommendationService::new(matcher, executor, rules.clone(), config),
            coupons: CouponAutoApply::new(rules, catalog),
        }
    }
}

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: UpsellEngine,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

/// Loads configuration, opens and migrates the rule database, and wires the
/// engine over the SQL stores and the given catalog collaborators.
pub async fn bootstrap(
    options: LoadOptions,
    catalog: Arc<dyn CatalogAdapter>,
    affinity: Arc<dyn AffinitySource>,
) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting engine bootstrap");
    let config = AppConfig::load(options)?;

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let engine = UpsellEngine::new(
        &config.engine,
        Arc::new(SqlRuleRepository::new(db_pool.clone())),
        Arc::new(SqlRuleIndexRepository::new(db_pool.clone())),
        catalog,
        affinity,
    );
    Ok(Application { config, db_pool, engine })
}
