use std::sync::Arc;

use margin_engine::api::router::create_router;
use margin_engine::config::AppConfig;
use margin_engine::db::{self, MemoryStore, PgStore, Store};
use margin_engine::ingestion::WsTickerFeed;
use margin_engine::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // rustls needs an explicit process-wide crypto provider for wss://
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = margin_engine::metrics::init_metrics();

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = db::init_pool(url).await?;
            db::run_migrations(&pool).await?;
            tracing::info!("Database connected, migrations applied");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; positions and balances are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::build(store, config.clone(), metrics_handle);
    if state.notifier.is_some() {
        tracing::info!("Telegram notifications enabled");
    }

    if config.price_feed_enabled {
        let feed = WsTickerFeed::new(config.price_feed_url.clone(), config.price_feed_stream.clone());
        state.monitor.start(Box::new(feed)).await?;
        tracing::info!(
            url = %config.price_feed_url,
            stream = %config.price_feed_stream,
            "Liquidation monitor started"
        );
    } else {
        tracing::info!("Price feed disabled (PRICE_FEED_ENABLED=false); monitor not started");
    }

    let monitor = state.monitor.clone();
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}
