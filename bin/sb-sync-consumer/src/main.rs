//! SyncBridge Acknowledgment Consumer
//!
//! Drains the downstream application's acknowledgment stream into the
//! tracking store and expires events that never get acknowledged. Exposes
//! the tracking query surface for operational tooling.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SB_CONSUMER_APP` | `crm` | Downstream application whose acks to drain |
//! | `SB_RETRY_BUDGET` | `3` | Negative acks before a record goes FAILED |
//! | `SB_STREAM_BACKEND` | `memory` | Stream backend: `memory`, `redis` |
//! | `SB_REDIS_URL` | - | Redis URL (required for the redis backend) |
//! | `SB_TRACKING_BACKEND` | `memory` | Tracking backend: `memory`, `sqlite`, `postgres` |
//! | `SB_TRACKING_DB_URL` | - | Database URL (required for sqlite/postgres) |
//! | `SB_ACK_WINDOW_SECS` | `900` | Ack window before a PUBLISHED record expires |
//! | `SB_SWEEP_INTERVAL_SECS` | `60` | Expiry sweep interval |
//! | `SB_HEALTH_WINDOW_SECS` | `3600` | Rolling window for health metrics |
//! | `SB_HTTP_PORT` | `8090` | Ops HTTP port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sb_common::{AckConsumerConfig, SweeperConfig};
use sb_stream::{CursorStore, InMemoryCursorStore, InMemoryStreamTransport, StreamTransport};
use sb_sync::{AckConsumer, ExpirySweeper, SyncHealthService};
use sb_tracking::TrackingRepository;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[derive(Clone)]
struct AppState {
    tracking: Arc<dyn TrackingRepository>,
    health: Arc<SyncHealthService>,
    prometheus: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting SyncBridge Acknowledgment Consumer");

    let consumer_application = env_or("SB_CONSUMER_APP", "crm");
    let retry_budget: u32 = env_or_parse("SB_RETRY_BUDGET", 3);
    let ack_window_secs: u64 = env_or_parse("SB_ACK_WINDOW_SECS", 900);
    let sweep_interval_secs: u64 = env_or_parse("SB_SWEEP_INTERVAL_SECS", 60);
    let health_window_secs: u64 = env_or_parse("SB_HEALTH_WINDOW_SECS", 3600);
    let http_port: u16 = env_or_parse("SB_HTTP_PORT", 8090);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (transport, cursors) = create_stream_backend().await?;
    let tracking = create_tracking_backend().await?;

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let consumer = AckConsumer::new(
        transport,
        cursors,
        tracking.clone(),
        AckConsumerConfig {
            consumer_application: consumer_application.clone(),
            retry_budget,
            ..Default::default()
        },
    );
    info!(consumer_application = %consumer_application, "Acknowledgment consumer initialized");

    let sweeper = ExpirySweeper::new(
        tracking.clone(),
        SweeperConfig {
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            ack_window: Duration::from_secs(ack_window_secs),
        },
    );

    let consumer_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };
    let sweeper_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { sweeper.run(shutdown_rx).await })
    };

    let state = AppState {
        tracking: tracking.clone(),
        health: Arc::new(SyncHealthService::new(
            tracking,
            Duration::from_secs(health_window_secs),
        )),
        prometheus,
    };

    let app = axum::Router::new()
        .route(
            "/api/sync/events/:event_id",
            axum::routing::get(get_event_status),
        )
        .route(
            "/api/sync/health/:tenant_id",
            axum::routing::get(get_sync_health),
        )
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    info!("Ops server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("SyncBridge Acknowledgment Consumer started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = consumer_handle.await;
        let _ = sweeper_handle.await;
        let _ = server_handle.await;
    })
    .await;

    info!("SyncBridge Acknowledgment Consumer shutdown complete");
    Ok(())
}

async fn create_stream_backend(
) -> Result<(Arc<dyn StreamTransport>, Arc<dyn CursorStore>)> {
    match env_or("SB_STREAM_BACKEND", "memory").as_str() {
        "memory" => {
            info!("Using in-memory stream backend");
            Ok((
                Arc::new(InMemoryStreamTransport::new()),
                Arc::new(InMemoryCursorStore::new()),
            ))
        }
        "redis" => {
            let url = env_required("SB_REDIS_URL")?;
            let transport = sb_stream::redis::RedisStreamTransport::connect(&url).await?;
            let cursors = sb_stream::redis::RedisCursorStore::connect(&url).await?;
            info!("Using Redis stream backend");
            Ok((Arc::new(transport), Arc::new(cursors)))
        }
        other => Err(anyhow::anyhow!(
            "Unknown stream backend: {}. Use memory or redis",
            other
        )),
    }
}

async fn create_tracking_backend() -> Result<Arc<dyn TrackingRepository>> {
    match env_or("SB_TRACKING_BACKEND", "memory").as_str() {
        "memory" => {
            info!("Using in-memory tracking store");
            Ok(Arc::new(sb_tracking::InMemoryTrackingRepository::new()))
        }
        "sqlite" => {
            let url = env_required("SB_TRACKING_DB_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let repo = sb_tracking::sqlite::SqliteTrackingRepository::new(pool);
            repo.init_schema().await?;
            info!("Using SQLite tracking store: {}", url);
            Ok(Arc::new(repo))
        }
        "postgres" => {
            let url = env_required("SB_TRACKING_DB_URL")?;
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let repo = sb_tracking::postgres::PostgresTrackingRepository::new(pool);
            repo.init_schema().await?;
            info!("Using PostgreSQL tracking store");
            Ok(Arc::new(repo))
        }
        other => Err(anyhow::anyhow!(
            "Unknown tracking backend: {}. Use memory, sqlite, or postgres",
            other
        )),
    }
}

async fn get_event_status(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> impl IntoResponse {
    match state.tracking.get(&event_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(serde_json::json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "event not found" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn get_sync_health(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.health.health_metrics(&tenant_id).await {
        Ok(metrics) => (StatusCode::OK, Json(serde_json::json!(metrics))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "READY" }))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.prometheus.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
