//! SyncBridge Workflow Worker
//!
//! Hosts the workflow orchestrator and the activity worker pool, resumes
//! RUNNING workflows on boot, and exposes the workflow submission surface.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SB_CONSUMER_APPS` | `crm` | Comma-separated consumer applications |
//! | `SB_WORKER_CONCURRENCY` | `8` | Worker pool concurrency |
//! | `SB_QUEUE_CAPACITY` | `256` | Task queue capacity |
//! | `SB_TASK_TIMEOUT_SECS` | `30` | Per-activity timeout |
//! | `SB_RATE_LIMIT_PER_MINUTE` | - | Optional activity dispatch rate limit |
//! | `SB_STREAM_BACKEND` | `memory` | Stream backend: `memory`, `redis` |
//! | `SB_REDIS_URL` | - | Redis URL (required for the redis backend) |
//! | `SB_TRACKING_BACKEND` | `memory` | Tracking backend: `memory`, `sqlite`, `postgres` |
//! | `SB_TRACKING_DB_URL` | - | Database URL (required for sqlite/postgres) |
//! | `SB_WORKFLOW_BACKEND` | `memory` | Workflow store: `memory`, `sqlite` |
//! | `SB_WORKFLOW_DB_URL` | - | Database URL (required for sqlite) |
//! | `SB_DIRECTORY_URL` | `http://localhost:8080` | Downstream provisioning API |
//! | `SB_DIRECTORY_TOKEN` | - | Optional bearer token for the directory API |
//! | `SB_HTTP_PORT` | `8091` | Ops HTTP port |
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
use serde::Deserialize;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sb_common::{RetryPolicy, WorkerPoolConfig};
use sb_provision::{
    AllocateCreditsActivity, CreateOrganizationActivity, HttpDirectoryGateway,
    HttpDirectoryGatewayConfig, InMemoryCreditLedger, OrganizationProvisioningWorkflow,
    SyncUsersActivity,
};
use sb_stream::{InMemoryStreamTransport, StreamTransport};
use sb_sync::EventPublisher;
use sb_tracking::TrackingRepository;
use sb_workflow::{
    ActivityRegistry, TaskQueue, WorkerPool, WorkflowOrchestrator, WorkflowRegistry,
    WorkflowStore,
};

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
    orchestrator: WorkflowOrchestrator,
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

    info!("Starting SyncBridge Workflow Worker");

    let concurrency: u32 = env_or_parse("SB_WORKER_CONCURRENCY", 8);
    let queue_capacity: usize = env_or_parse("SB_QUEUE_CAPACITY", 256);
    let task_timeout_secs: u64 = env_or_parse("SB_TASK_TIMEOUT_SECS", 30);
    let rate_limit_per_minute: Option<u32> = std::env::var("SB_RATE_LIMIT_PER_MINUTE")
        .ok()
        .and_then(|v| v.parse().ok());
    let http_port: u16 = env_or_parse("SB_HTTP_PORT", 8091);
    let consumer_applications: Vec<String> = env_or("SB_CONSUMER_APPS", "crm")
        .split(',')
        .map(|app| app.trim().to_string())
        .filter(|app| !app.is_empty())
        .collect();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let transport = create_stream_backend().await?;
    let tracking = create_tracking_backend().await?;
    let workflow_store = create_workflow_backend().await?;

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let publisher = Arc::new(EventPublisher::new(
        transport,
        tracking,
        consumer_applications.clone(),
    ));
    info!(consumer_applications = ?consumer_applications, "Event publisher initialized");

    let gateway = Arc::new(HttpDirectoryGateway::new(HttpDirectoryGatewayConfig {
        base_url: env_or("SB_DIRECTORY_URL", "http://localhost:8080"),
        api_token: std::env::var("SB_DIRECTORY_TOKEN").ok(),
        ..Default::default()
    })?);
    let ledger = Arc::new(InMemoryCreditLedger::new());

    let mut activities = ActivityRegistry::new();
    activities.register(Arc::new(CreateOrganizationActivity::new(
        gateway.clone(),
        publisher.clone(),
    )));
    activities.register(Arc::new(AllocateCreditsActivity::new(
        ledger,
        publisher.clone(),
    )));
    activities.register(Arc::new(SyncUsersActivity::new(gateway, publisher)));
    let activities = Arc::new(activities);
    info!(activities = ?activities.names(), "Activity registry initialized");

    let mut definitions = WorkflowRegistry::new();
    definitions.register(Arc::new(OrganizationProvisioningWorkflow::new(
        RetryPolicy::default(),
    )));
    let definitions = Arc::new(definitions);

    let queue = Arc::new(TaskQueue::new(queue_capacity, Duration::from_secs(60)));
    let (completion_tx, completion_rx) = mpsc::channel(queue_capacity.max(16));

    let pool = WorkerPool::new(
        queue.clone(),
        activities,
        WorkerPoolConfig {
            concurrency,
            queue_capacity,
            task_timeout: Duration::from_secs(task_timeout_secs),
            rate_limit_per_minute,
            ..Default::default()
        },
        completion_tx,
    );
    let pool_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { pool.run(shutdown_rx).await })
    };

    let orchestrator = WorkflowOrchestrator::new(workflow_store, definitions, queue);
    let router_handle = orchestrator.start_completion_router(completion_rx);

    let resumed = orchestrator.resume_all().await?;
    info!(resumed, "Workflow recovery complete");

    let state = AppState {
        orchestrator: orchestrator.clone(),
        prometheus,
    };

    let app = axum::Router::new()
        .route("/api/workflows", axum::routing::post(submit_workflow))
        .route(
            "/api/workflows/:workflow_id",
            axum::routing::get(get_workflow),
        )
        .route(
            "/api/workflows/:workflow_id/cancel",
            axum::routing::post(cancel_workflow),
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

    info!("SyncBridge Workflow Worker started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    // Abort in-flight drives; RUNNING executions resume on next boot.
    orchestrator.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = pool_handle.await;
        let _ = router_handle.await;
        let _ = server_handle.await;
    })
    .await;

    info!("SyncBridge Workflow Worker shutdown complete");
    Ok(())
}

async fn create_stream_backend() -> Result<Arc<dyn StreamTransport>> {
    match env_or("SB_STREAM_BACKEND", "memory").as_str() {
        "memory" => {
            info!("Using in-memory stream backend");
            Ok(Arc::new(InMemoryStreamTransport::new()))
        }
        "redis" => {
            let url = env_required("SB_REDIS_URL")?;
            let transport = sb_stream::redis::RedisStreamTransport::connect(&url).await?;
            info!("Using Redis stream backend");
            Ok(Arc::new(transport))
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

async fn create_workflow_backend() -> Result<Arc<dyn WorkflowStore>> {
    match env_or("SB_WORKFLOW_BACKEND", "memory").as_str() {
        "memory" => {
            info!("Using in-memory workflow store");
            Ok(Arc::new(sb_workflow::InMemoryWorkflowStore::new()))
        }
        "sqlite" => {
            let url = env_required("SB_WORKFLOW_DB_URL")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await?;
            let store = sb_workflow::sqlite::SqliteWorkflowStore::new(pool);
            store.init_schema().await?;
            info!("Using SQLite workflow store: {}", url);
            Ok(Arc::new(store))
        }
        other => Err(anyhow::anyhow!(
            "Unknown workflow backend: {}. Use memory or sqlite",
            other
        )),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitWorkflowRequest {
    workflow_type: String,
    tenant_id: String,
    #[serde(default)]
    input: serde_json::Value,
}

async fn submit_workflow(
    State(state): State<AppState>,
    Json(request): Json<SubmitWorkflowRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .submit(&request.workflow_type, &request.tenant_id, request.input)
        .await
    {
        Ok(workflow_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "workflowId": workflow_id })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.status(&workflow_id).await {
        Ok(Some(execution)) => (StatusCode::OK, Json(serde_json::json!(execution))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "workflow not found" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.cancel(&workflow_id).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "cancelled": cancelled })),
        ),
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
