//! API Service - sales records dashboard backend
//!
//! Endpoints:
//! - GET /             - Liveness message
//! - GET /health       - Health check
//! - POST /api/upload  - Replace all records with an uploaded CSV/Excel file
//! - GET /api/filters  - Distinct category, branch and supplier values
//! - GET /api/data     - Filtered, paginated records
//! - GET /api/totals   - Measure sums over the filtered records
//! - DELETE /api/data  - Remove every record
//! - POST /api/consolidate - Merge duplicate records

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use records::query::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use records::store::clear_all;
use records::{
    import_records, ingest, ConsolidationSummary, Consolidator, FilterOptions, ImportMode,
    IngestError, MeasureTotals, PageRequest, QueryError, QueryService, RecordFilter, RecordPage,
    RecordStore, StoreConfig, StoreError, UploadFormat,
};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

// ============================================================================
// State
// ============================================================================

struct AppState {
    store: Arc<dyn RecordStore>,
    query: QueryService,
    consolidator: Consolidator,
    batch_size: usize,
}

impl AppState {
    fn new(store: Arc<dyn RecordStore>, batch_size: usize) -> Self {
        Self {
            query: QueryService::new(store.clone()),
            consolidator: Consolidator::new(store.clone(), batch_size),
            store,
            batch_size,
        }
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    message: &'static str,
    records_count: usize,
    failed_count: usize,
    content_hash: String,
}

#[derive(Serialize)]
struct FiltersResponse {
    success: bool,
    filters: FilterOptions,
}

#[derive(Serialize)]
struct DataResponse {
    success: bool,
    #[serde(flatten)]
    page: RecordPage,
}

#[derive(Serialize)]
struct TotalsResponse {
    success: bool,
    totals: MeasureTotals,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearResponse {
    message: &'static str,
    deleted_count: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// A failed request: status plus the `{ message, error }` body
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    error: Option<String>,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
            error: None,
        }
    }

    fn invalid(message: &str, err: impl Display) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::bad_request(message)
        }
    }

    fn internal(message: &str, err: impl Display) -> Self {
        error!(error = %err, "{}", message);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
            error: Some(err.to_string()),
        }
    }

    fn store(message: &str, err: StoreError) -> Self {
        match err {
            StoreError::Busy => {
                warn!("{}: replace already in progress", message);
                Self {
                    status: StatusCode::CONFLICT,
                    message: message.to_string(),
                    error: Some(err.to_string()),
                }
            }
            other => Self::internal(message, other),
        }
    }

    fn query(message: &str, err: QueryError) -> Self {
        match err {
            QueryError::InvalidFilter { .. } => Self::invalid("Invalid filter parameter", err),
            QueryError::Store(e) => Self::store(message, e),
        }
    }

    fn ingest(err: IngestError) -> Self {
        match err {
            IngestError::Empty => Self::invalid("Uploaded file is empty", err),
            IngestError::UnsupportedFormat(_) => {
                Self::invalid("Invalid file type. Only CSV and Excel files are allowed.", err)
            }
            other => Self::invalid("Error parsing file", other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                message: self.message,
                error: self.error,
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Query params
// ============================================================================

/// Filter params are JSON arrays, e.g. `categories=["Dairy","Bakery"]`
#[derive(Deserialize, Default)]
struct FilterQuery {
    categories: Option<String>,
    branches: Option<String>,
    suppliers: Option<String>,
}

impl FilterQuery {
    fn filter(&self) -> Result<RecordFilter, QueryError> {
        RecordFilter::from_params(
            self.categories.as_deref(),
            self.branches.as_deref(),
            self.suppliers.as_deref(),
        )
    }
}

#[derive(Deserialize, Default)]
struct DataQuery {
    page: Option<String>,
    limit: Option<String>,
    #[serde(flatten)]
    filters: FilterQuery,
}

impl DataQuery {
    /// Unparseable values fall back to the defaults; page and limit are
    /// clamped to at least 1 and limit to at most `MAX_PAGE_SIZE`
    fn page_request(&self) -> PageRequest {
        let parse = |raw: &Option<String>| raw.as_deref().and_then(|s| s.trim().parse::<i64>().ok());
        let page = parse(&self.page).unwrap_or(1).max(1) as u64;
        let limit = match parse(&self.limit) {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(n) => n.clamp(1, MAX_PAGE_SIZE as i64) as u64,
        };
        PageRequest::new(page, limit)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn root_handler() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "DataCollections API is running",
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid("Error reading upload", e))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::invalid("Error reading upload", e))?;
        file = Some((file_name, content_type, bytes));
        break;
    }

    let Some((file_name, content_type, bytes)) = file else {
        return Err(ApiError::bad_request("No file uploaded"));
    };
    info!(file = %file_name, size = bytes.len(), "received upload");

    let format =
        UploadFormat::detect(&file_name, content_type.as_deref()).map_err(ApiError::ingest)?;
    let upload = tokio::task::spawn_blocking(move || ingest(format, &bytes))
        .await
        .map_err(|e| ApiError::internal("Error uploading file", e))?
        .map_err(ApiError::ingest)?;

    let summary = import_records(
        state.store.as_ref(),
        &upload,
        ImportMode::Replace,
        state.batch_size,
    )
    .await
    .map_err(|e| ApiError::store("Error uploading file", e))?;

    Ok(Json(UploadResponse {
        message: "File uploaded successfully and data replaced",
        records_count: summary.inserted,
        failed_count: summary.failures.len(),
        content_hash: summary.content_hash,
    }))
}

async fn filters_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FiltersResponse>, ApiError> {
    let filters = state
        .query
        .filter_options()
        .await
        .map_err(|e| ApiError::store("Error fetching filters", e))?;
    Ok(Json(FiltersResponse {
        success: true,
        filters,
    }))
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DataQuery>,
) -> Result<Json<DataResponse>, ApiError> {
    let filter = params
        .filters
        .filter()
        .map_err(|e| ApiError::query("Error fetching data", e))?;
    let page = state
        .query
        .query_page(&filter, params.page_request())
        .await
        .map_err(|e| ApiError::store("Error fetching data", e))?;
    Ok(Json(DataResponse {
        success: true,
        page,
    }))
}

async fn totals_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FilterQuery>,
) -> Result<Json<TotalsResponse>, ApiError> {
    let filter = params
        .filter()
        .map_err(|e| ApiError::query("Error calculating totals", e))?;
    let totals = state
        .query
        .query_totals(&filter)
        .await
        .map_err(|e| ApiError::store("Error calculating totals", e))?;
    Ok(Json(TotalsResponse {
        success: true,
        totals,
    }))
}

async fn clear_handler(State(state): State<Arc<AppState>>) -> Result<Json<ClearResponse>, ApiError> {
    let deleted_count = clear_all(state.store.as_ref())
        .await
        .map_err(|e| ApiError::store("Error clearing data", e))?;
    info!(deleted_count, "all data cleared");
    Ok(Json(ClearResponse {
        message: "All data cleared successfully",
        deleted_count,
    }))
}

async fn consolidate_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConsolidationSummary>, ApiError> {
    let summary = state
        .consolidator
        .run()
        .await
        .map_err(|e| ApiError::store("Error consolidating data", e))?;
    Ok(Json(summary))
}

fn app(state: Arc<AppState>) -> Router {
    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route(
            "/api/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/filters", get(filters_handler))
        .route("/api/data", get(data_handler).delete(clear_handler))
        .route("/api/totals", get(totals_handler))
        .route("/api/consolidate", post(consolidate_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    records::init_tracing();

    let config = StoreConfig::from_env().context("Invalid store configuration")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:5000".to_string());

    let store = config
        .connect()
        .await
        .context("Failed to connect to record store")?;
    let state = Arc::new(AppState::new(store, config.batch_size));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(address = %bind, "API listening");

    axum::serve(listener, app(state)).await?;

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
