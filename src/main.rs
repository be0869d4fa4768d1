//! Application entry point for the `sla-engine` backend service.
//!
//! This binary orchestrates the full startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool and creating the schema
//! - Connecting the aggregate cache (Redis, or disabled)
//! - Wiring the registry client, bulk loader, aggregator and NMS sync
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! See [`sla_engine::config::load_from_env`] for the full list. Logging is
//! controlled by `RUST_LOG` / `AXUM_LOG_LEVEL`, `AXUM_SPAN_EVENTS` and
//! `FORCE_COLOR`.
use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use sla_engine::aggregator::SlaAggregator;
use sla_engine::cache::{RedisBackend, SlaCache};
use sla_engine::loader::BulkLoader;
use sla_engine::nms::{NmsClient, NmsSource};
use sla_engine::reconcile::ReconcileService;
use sla_engine::registry::{RegistryClient, SiteRegistry};
use sla_engine::routes::{self, AppState};
use sla_engine::store::{CatalogStore, PgStore, SiteStatusStore, SlaStore};
use sla_engine::{config, schema, Config};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database");

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let cache = connect_cache(&cfg).await;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let pg = Arc::new(PgStore::new(pool));
    let store: Arc<dyn SlaStore> = pg.clone();
    let catalog: Arc<dyn CatalogStore> = pg.clone();
    let status_store: Arc<dyn SiteStatusStore> = pg;

    let registry: Arc<dyn SiteRegistry> = Arc::new(RegistryClient::new(
        http.clone(),
        cfg.sites_api_url.clone(),
        cfg.sites_page_size,
        Duration::from_secs(u64::from(cfg.registry_cache_ttl_secs)),
    ));

    let nms: Option<Arc<dyn NmsSource>> = cfg
        .nms
        .clone()
        .map(|nms| Arc::new(NmsClient::new(http.clone(), nms)) as Arc<dyn NmsSource>);

    let reconcile = Arc::new(ReconcileService::new(nms, registry.clone(), status_store));
    if reconcile.is_enabled() {
        reconcile
            .clone()
            .spawn_periodic(Duration::from_secs(u64::from(cfg.sync_interval_secs)));
        tracing::info!("Site status sync every {}s", cfg.sync_interval_secs);
    } else {
        tracing::info!("NMS not configured, site status sync disabled");
    }

    let state = AppState {
        store: store.clone(),
        catalog,
        registry: registry.clone(),
        cache: cache.clone(),
        aggregator: Arc::new(SlaAggregator::new(store.clone(), registry.clone(), cache.clone())),
        loader: Arc::new(BulkLoader::new(store, registry, cache)),
        reconcile,
    };

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.bind_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Redis when configured and reachable; otherwise every request computes.
async fn connect_cache(cfg: &Config) -> SlaCache {
    // ---
    let Some(url) = cfg.redis_url.as_deref() else {
        tracing::info!("REDIS_URL not set, aggregate cache disabled");
        return SlaCache::disabled();
    };

    match RedisBackend::connect(url).await {
        Ok(backend) => {
            tracing::info!("Aggregate cache connected");
            SlaCache::new(Arc::new(backend))
        }
        Err(e) => {
            tracing::warn!("Redis unavailable, aggregate cache disabled: {}", e);
            SlaCache::disabled()
        }
    }
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,hyper=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
