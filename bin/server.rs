// GP System Index - Web Server
// Read-only REST API over the active snapshot, plus an update trigger

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gp_system_index::{CancelToken, Config, IndexError, Month, MonthSource, Orchestrator};

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Error carried out of a handler
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        let status = match &err {
            IndexError::DataNotFound { .. } => StatusCode::NOT_FOUND,
            IndexError::Query(_) => StatusCode::BAD_REQUEST,
            IndexError::Cancelled { .. } | IndexError::TimedOut { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IndexError::Download { .. } => StatusCode::BAD_GATEWAY,
            IndexError::Parse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
        }
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::failure(self.message))).into_response()
    }
}

type ApiResult = std::result::Result<Json<ApiResponse<Value>>, ApiError>;

#[derive(Debug, Deserialize)]
struct MonthParams {
    month: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    name: String,
    #[serde(default)]
    exact: bool,
    month: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateRequest {
    month: Option<String>,
    source: Option<String>,
}

fn parse_month(raw: Option<String>) -> std::result::Result<Option<Month>, ApiError> {
    raw.filter(|m| !m.trim().is_empty())
        .map(|m| m.trim().parse::<Month>())
        .transpose()
        .map_err(ApiError::from)
}

/// Run index work off the async executor; SQLite loads and snapshot builds block
async fn blocking<F>(state: AppState, work: F) -> ApiResult
where
    F: FnOnce(&Orchestrator) -> std::result::Result<Value, ApiError> + Send + 'static,
{
    let data = tokio::task::spawn_blocking(move || work(&state.orchestrator))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(ApiResponse::ok(data)))
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::from(IndexError::from(e)))
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(json!({
        "status": "OK",
        "version": gp_system_index::VERSION,
        "index": state.orchestrator.index_state(),
    })))
}

/// GET /api/months - Months with a stored dataset
async fn get_months(State(state): State<AppState>) -> ApiResult {
    blocking(state, |orchestrator| {
        let months = orchestrator.available_months()?;
        let mut summaries = Vec::with_capacity(months.len());
        for month in &months {
            if let Some(summary) = orchestrator.dataset_summary(month)? {
                summaries.push(summary);
            }
        }
        to_value(&summaries)
    })
    .await
}

/// GET /api/practices/:code - One practice by code
async fn get_practice(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(params): Query<MonthParams>,
) -> ApiResult {
    let month = parse_month(params.month)?;
    blocking(state, move |orchestrator| {
        let index = orchestrator.index_for(month.as_ref())?;
        match index.lookup_exact(&code) {
            Some(record) => to_value(record),
            None => Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("no practice with code {} in {}", code.trim().to_uppercase(), index.month()),
            )),
        }
    })
    .await
}

/// GET /api/search?name=&exact= - Practices by name
async fn search_practices(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult {
    let month = parse_month(params.month)?;
    blocking(state, move |orchestrator| {
        let index = orchestrator.index_for(month.as_ref())?;
        let results = index.search_by_name(&params.name, params.exact)?;
        to_value(&results)
    })
    .await
}

/// GET /api/systems/:system - Practices on one system, grouped by commissioner
async fn filter_by_system(
    State(state): State<AppState>,
    Path(system): Path<String>,
    Query(params): Query<MonthParams>,
) -> ApiResult {
    let month = parse_month(params.month)?;
    blocking(state, move |orchestrator| {
        let index = orchestrator.index_for(month.as_ref())?;
        let filter = index.filter_by_system(&system)?;
        to_value(&filter)
    })
    .await
}

/// GET /api/stats - System distribution
async fn get_stats(State(state): State<AppState>, Query(params): Query<MonthParams>) -> ApiResult {
    let month = parse_month(params.month)?;
    blocking(state, move |orchestrator| {
        let index = orchestrator.index_for(month.as_ref())?;
        to_value(&index.statistics())
    })
    .await
}

/// POST /api/update - Run the pipeline; queries keep serving the previous snapshot meanwhile
async fn run_update(State(state): State<AppState>, body: Option<Json<UpdateRequest>>) -> ApiResult {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let month = parse_month(request.month)?.unwrap_or_else(Month::previous);

    blocking(state, move |orchestrator| {
        let source = match request.source {
            Some(location) => MonthSource::parse(&location),
            None => MonthSource::Publication(orchestrator.config().publication_base_url.clone()),
        };
        let report = orchestrator.run_pipeline(&month, &source, &CancelToken::new())?;
        to_value(&report)
    })
    .await
}

// ============================================================================
// Main Server
// ============================================================================

fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = std::env::var("GP_INDEX_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    // The directory client is blocking; build it before the runtime starts
    let orchestrator = Arc::new(Orchestrator::from_config(config).context("failed to open index database")?);
    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(serve(state, &addr))?;

    drop(orchestrator);
    Ok(())
}

async fn serve(state: AppState, addr: &str) -> Result<()> {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/months", get(get_months))
        .route("/practices/:code", get(get_practice))
        .route("/search", get(search_practices))
        .route("/systems/:system", get(filter_by_system))
        .route("/stats", get(get_stats))
        .route("/update", post(run_update))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(addr, "GP system index API listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
