use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_api::{IdentityApi, MigrateResult, API_CONTRACT_VERSION};
use identity_core::{ErrorKind, IdentifyResponse, IdentityError};
use identity_store_sqlite::{IntegrityReport, SchemaStatus, StoreConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod validation;

use validation::RequestValidator;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
    validator: RequestValidator,
}

impl ServiceState {
    fn new(api: IdentityApi) -> Result<Self> {
        Ok(Self { api, validator: RequestValidator::new()? })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
enum ServiceError {
    BadRequest(String),
    Unavailable(String),
    Internal,
}

impl ServiceError {
    /// Log `err` and hide it behind the generic 500 body.
    fn internal(err: impl Display) -> Self {
        tracing::error!(error = %err, "request failed with internal error");
        Self::Internal
    }
}

impl From<IdentityError> for ServiceError {
    fn from(err: IdentityError) -> Self {
        match err.kind() {
            ErrorKind::Validation => Self::BadRequest(match err {
                IdentityError::Validation(message) => message,
                other => other.to_string(),
            }),
            ErrorKind::Transient => {
                tracing::warn!(error = %err, "store busy; request can be retried");
                Self::Unavailable("Service temporarily unavailable, please retry".to_string())
            }
            ErrorKind::Internal => Self::internal(err),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Unavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            Self::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE.to_string())
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "identity-service")]
#[command(about = "HTTP service for contact identity reconciliation")]
struct Args {
    #[arg(long, env = "IDENTITY_DB_PATH", default_value = "./identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Milliseconds a transaction waits on a busy database before the request fails with 503.
    #[arg(long, env = "IDENTITY_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
    #[arg(long, env = "IDENTITY_MAX_IDLE_CONNECTIONS", default_value_t = 8)]
    max_idle_connections: usize,
}

impl Args {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            max_idle_connections: self.max_idle_connections,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let api = IdentityApi::open(&args.db, args.store_config())?;
    let migration = api.migrate(false)?;
    tracing::info!(
        db = %args.db.display(),
        applied = ?migration.would_apply_versions,
        schema_version = ?migration.after_version,
        "database ready"
    );

    let state = ServiceState::new(api)?;
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "identity service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("identity service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Run blocking store work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(ServiceError::internal)?
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let Json(body) = payload.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    let fragment = state.validator.fragment(&body).map_err(ServiceError::BadRequest)?;

    let api = state.api;
    let response = blocking(move || Ok(api.identify_fragment(&fragment)?)).await?;
    Ok(Json(response))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let api = state.api;
    let status = blocking(move || api.schema_status().map_err(ServiceError::internal)).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let api = state.api;
    let result =
        blocking(move || api.migrate(request.dry_run).map_err(ServiceError::internal)).await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let api = state.api;
    let report = blocking(move || api.integrity_check().map_err(ServiceError::internal)).await?;
    Ok(Json(envelope(report)))
}
