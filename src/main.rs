use std::sync::Arc;

use haulage::config::AppConfig;
use haulage::db::{init_pool, migrate};
use haulage::error::AppError;
use haulage::routes::create_router;
use haulage::services::{settlement::OutboxLedger, verification::SqliteDriverDirectory};
use haulage::state::AppState;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url, config.db_max_connections).await?;

    if let Err(err) = migrate(&db).await {
        error!("migration failed: {err:?}");
        return Err(err);
    }

    let drivers = Arc::new(SqliteDriverDirectory::new(db.clone()));
    let ledger = Arc::new(OutboxLedger::new(db.clone()));
    let (state, _fanout) = AppState::start(config.clone(), db.clone(), drivers, ledger);

    let _retry = state
        .settlement
        .clone()
        .spawn_retry_loop(config.settlement_retry_interval);

    let app = create_router(state.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,haulage=debug,tower_http=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
