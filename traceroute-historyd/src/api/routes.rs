use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use shared::protocol::API_PREFIX;
use shared::types::{Decision, Destination, Group, HistoryEntry, Ingestion, RawCapture};
use crate::error::HistoryError;
use crate::ingest::Ingestor;
use crate::store::{timestamp_now, HistoryFilter, Key, Page};
use super::extract::{ApiJson, ApiPath, ApiQuery};

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    /// Cap applied to every paginated listing
    pub max_page_size: u32,
    /// Kept between requests so CPU usage is measured since the previous call
    pub system: Arc<Mutex<System>>,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>, max_page_size: u32) -> Self {
        Self {
            ingestor,
            max_page_size,
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateDestination {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub group_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateGroup {
    pub name: String,
}

#[derive(Deserialize, Default)]
pub struct PageQuery {
    #[serde(default)]
    pub skip: u32,
    pub limit: Option<u32>,
}

impl PageQuery {
    /// Absent or oversized limits are clamped to the configured cap
    fn page(&self, max_page_size: u32) -> Page {
        let limit = self.limit.unwrap_or(max_page_size).min(max_page_size);
        Page::new(self.skip, Some(limit))
    }
}

#[derive(Serialize)]
pub struct SystemResponse {
    /// Percent of total CPU, -1 when unavailable
    pub cpu: f32,
    /// Percent of physical memory in use, -1 when unavailable
    pub memory: f32,
    pub version: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum ApiError {
    History(HistoryError),
    /// Request rejected by an extractor before reaching a handler
    Rejected(StatusCode, String),
    Task(tokio::task::JoinError),
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        ApiError::History(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::History(HistoryError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::History(HistoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::History(HistoryError::OutOfOrder { .. }) => StatusCode::CONFLICT,
            ApiError::History(HistoryError::MalformedCapture(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::History(HistoryError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            ApiError::Rejected(status, _) => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            match &self {
                ApiError::History(e) => tracing::error!("Request failed: {}", e),
                ApiError::Rejected(_, message) => tracing::error!("Request rejected: {}", message),
                ApiError::Task(e) => tracing::error!("Request task failed: {}", e),
            }
            "internal error".to_string()
        } else {
            match &self {
                ApiError::History(e) => e.to_string(),
                ApiError::Rejected(_, message) => message.clone(),
                ApiError::Task(e) => e.to_string(),
            }
        };

        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/system", get(get_system))
        .route("/destinations", get(list_destinations).post(create_destination))
        .route("/destinations/name/:name", get(get_destination_by_name))
        .route("/destinations/:id", get(get_destination).delete(delete_destination))
        .route("/destinations/:id/captures", post(ingest_capture))
        .route("/destinations/:id/history", get(list_destination_history))
        .route("/destinations/:id/history/latest", get(latest_history))
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/name/:name", get(get_group_by_name))
        .route("/groups/:id", get(get_group).delete(delete_group))
        .route("/groups/:id/history", get(list_group_history))
        .route("/history", get(list_history));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

/// Run a store operation off the async runtime
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Ingestor) -> crate::error::Result<T> + Send + 'static,
{
    let ingestor = state.ingestor.clone();
    tokio::task::spawn_blocking(move || op(ingestor.as_ref()))
        .await
        .map_err(ApiError::Task)?
        .map_err(ApiError::from)
}

async fn get_system(State(state): State<AppState>) -> Result<Json<SystemResponse>, ApiError> {
    let system = state.system.clone();
    let (cpu, memory) = tokio::task::spawn_blocking(move || sample_usage(&mut system.lock()))
        .await
        .map_err(ApiError::Task)?;

    Ok(Json(SystemResponse {
        cpu,
        memory,
        version: env!("CARGO_PKG_VERSION"),
    }))
}

fn sample_usage(system: &mut System) -> (f32, f32) {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu = system.global_cpu_info().cpu_usage();
    let cpu = if system.cpus().is_empty() || !cpu.is_finite() {
        -1.0
    } else {
        cpu
    };

    let total = system.total_memory() as f32;
    let memory = if total > 0.0 {
        system.used_memory() as f32 / total * 100.0
    } else {
        -1.0
    };

    (cpu, memory)
}

async fn create_destination(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateDestination>,
) -> Result<(StatusCode, Json<Destination>), ApiError> {
    let destination = blocking(&state, move |i| {
        i.db()
            .create_destination(&body.name, &body.address, body.group_id, timestamp_now())
    })
    .await?;

    tracing::info!("Registered destination {} ({})", destination.name, destination.address);
    Ok((StatusCode::CREATED, Json(destination)))
}

async fn list_destinations(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<Vec<Destination>>, ApiError> {
    let page = query.page(state.max_page_size);
    blocking(&state, move |i| i.db().list_destinations(page)).await.map(Json)
}

async fn get_destination(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Destination>, ApiError> {
    blocking(&state, move |i| i.db().get_destination(Key::Id(id))).await.map(Json)
}

async fn get_destination_by_name(
    State(state): State<AppState>,
    ApiPath(name): ApiPath<String>,
) -> Result<Json<Destination>, ApiError> {
    blocking(&state, move |i| i.db().get_destination(Key::Name(&name))).await.map(Json)
}

async fn delete_destination(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, ApiError> {
    let removed = blocking(&state, move |i| i.delete_destination(id)).await?;
    tracing::info!("Deleted destination {} with {} history entries", id, removed);
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_capture(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(capture): ApiJson<RawCapture>,
) -> Result<(StatusCode, Json<Ingestion>), ApiError> {
    let ingestion = blocking(&state, move |i| i.ingest(id, &capture)).await?;

    let status = match ingestion.decision {
        Decision::Stored => StatusCode::CREATED,
        Decision::Skipped => StatusCode::OK,
    };
    Ok((status, Json(ingestion)))
}

async fn list_destination_history(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let page = query.page(state.max_page_size);
    let filter = HistoryFilter {
        destination_id: Some(id),
        group_id: None,
    };
    blocking(&state, move |i| i.db().list_history(filter, page)).await.map(Json)
}

async fn latest_history(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Option<HistoryEntry>>, ApiError> {
    blocking(&state, move |i| {
        i.db().get_destination(Key::Id(id))?;
        i.db().latest(id)
    })
    .await
    .map(Json)
}

async fn create_group(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateGroup>,
) -> Result<(StatusCode, Json<Group>), ApiError> {
    let group = blocking(&state, move |i| i.db().create_group(&body.name, timestamp_now())).await?;
    tracing::info!("Registered group {}", group.name);
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_groups(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<Vec<Group>>, ApiError> {
    let page = query.page(state.max_page_size);
    blocking(&state, move |i| i.db().list_groups(page)).await.map(Json)
}

async fn get_group(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<Json<Group>, ApiError> {
    blocking(&state, move |i| i.db().get_group(Key::Id(id))).await.map(Json)
}

async fn get_group_by_name(
    State(state): State<AppState>,
    ApiPath(name): ApiPath<String>,
) -> Result<Json<Group>, ApiError> {
    blocking(&state, move |i| i.db().get_group(Key::Name(&name))).await.map(Json)
}

async fn delete_group(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> Result<StatusCode, ApiError> {
    let released = blocking(&state, move |i| i.db().delete_group(id)).await?;
    tracing::info!("Deleted group {}, released {} destinations", id, released);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_group_history(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let page = query.page(state.max_page_size);
    let filter = HistoryFilter {
        destination_id: None,
        group_id: Some(id),
    };
    blocking(&state, move |i| i.db().list_history(filter, page)).await.map(Json)
}

async fn list_history(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PageQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let page = query.page(state.max_page_size);
    blocking(&state, move |i| i.db().list_history(HistoryFilter::default(), page))
        .await
        .map(Json)
}
