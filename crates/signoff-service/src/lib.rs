#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use signoff_adapters::{InMemoryDirectory, RecordingLifecycleManager, TokioJobQueue};
use signoff_core::{
    ActionRequest, ApprovalAction, ApprovalEngine, ApprovalError, ApproverResolver,
    CreateInstanceOutcome, CreateInstanceRequest, Decision, EngineConfig, MemoryCache,
    NewTemplate, SlaTimerService, StorageConfig, TemplateStore, TemplateUpdate,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<ApprovalEngine>,
    pub templates: Arc<TemplateStore>,
    pub sla: Arc<SlaTimerService>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = signoff_core::bootstrap_store(config.storage).await?;

        let directory = Arc::new(InMemoryDirectory::new());
        let cache = Arc::new(MemoryCache::new());
        let resolver = ApproverResolver::new(directory, cache);

        let queue = Arc::new(TokioJobQueue::new());
        let sla = Arc::new(SlaTimerService::new(store.clone(), queue.clone()));
        queue.register_handler(sla.clone()).await;

        let lifecycle = Arc::new(RecordingLifecycleManager::new());
        let templates = Arc::new(TemplateStore::new(store.clone(), lifecycle.clone()));
        let engine = Arc::new(ApprovalEngine::new(
            store,
            resolver,
            sla.clone(),
            lifecycle,
            EngineConfig::default(),
        ));

        Ok(Self {
            engine,
            templates,
            sla,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/templates", post(create_template).get(list_templates))
        .route(
            "/v1/templates/:id_or_code",
            get(get_template)
                .put(update_template)
                .delete(delete_template),
        )
        .route("/v1/templates/:id_or_code/validate", post(validate_template))
        .route("/v1/templates/:id_or_code/compile", post(compile_template))
        .route("/v1/templates/:id_or_code/versions", get(list_versions))
        .route("/v1/templates/:id_or_code/rollback", post(rollback_template))
        .route("/v1/templates/:id_or_code/diff", get(diff_template))
        .route("/v1/templates/:id_or_code/impact", get(impact_analysis))
        .route("/v1/instances", post(create_instance))
        .route("/v1/instances/:id", get(get_instance))
        .route("/v1/instances/:id/actions", post(execute_action))
        .route("/v1/instances/:id/events", get(list_instance_events))
        .route("/v1/timers/rehydrate", post(rehydrate_timers))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] ApprovalError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] ApprovalError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Http { status, message } => (status, message),
            ApiError::Core(err) => {
                let status = match &err {
                    ApprovalError::TemplateNotFound(_)
                    | ApprovalError::InstanceNotFound(_)
                    | ApprovalError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                    ApprovalError::TaskNotPending(_)
                    | ApprovalError::ConcurrencyConflict { .. }
                    | ApprovalError::DuplicateInstance { .. } => StatusCode::CONFLICT,
                    ApprovalError::ActionNotAllowed(_) => StatusCode::FORBIDDEN,
                    ApprovalError::UnknownAction(_) => StatusCode::BAD_REQUEST,
                    ApprovalError::LockUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TenantQuery {
    tenant: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "signoff-service",
        storage_backend: state.engine.backend_label(),
    })
}

// ── Templates ────────────────────────────────────────────────────────

async fn create_template(
    State(state): State<ServiceState>,
    Json(input): Json<NewTemplate>,
) -> Result<Json<signoff_core::ApprovalTemplate>, ApiError> {
    Ok(Json(state.templates.create(input).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ListTemplatesQuery {
    tenant: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct TemplateListResponse {
    total: usize,
    items: Vec<signoff_core::ApprovalTemplate>,
}

async fn list_templates(
    State(state): State<ServiceState>,
    Query(query): Query<ListTemplatesQuery>,
) -> Result<Json<TemplateListResponse>, ApiError> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50).min(500);
    let (items, total) = state.templates.list(&query.tenant, offset, limit).await?;
    Ok(Json(TemplateListResponse { total, items }))
}

async fn get_template(
    Path(id_or_code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<signoff_core::ApprovalTemplate>, ApiError> {
    state
        .templates
        .get(&query.tenant, &id_or_code)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("template '{id_or_code}' not found")))
}

async fn update_template(
    Path(code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
    Json(update): Json<TemplateUpdate>,
) -> Result<Json<signoff_core::ApprovalTemplate>, ApiError> {
    Ok(Json(
        state.templates.update(&query.tenant, &code, update).await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct DeleteResponse {
    removed: u64,
}

async fn delete_template(
    Path(code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let removed = state.templates.delete(&query.tenant, &code).await?;
    if removed == 0 {
        return Err(ApiError::not_found(format!("template '{code}' not found")));
    }
    Ok(Json(DeleteResponse { removed }))
}

async fn validate_template(
    Path(id_or_code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<signoff_core::ValidationReport>, ApiError> {
    Ok(Json(
        state.templates.validate(&query.tenant, &id_or_code).await?,
    ))
}

async fn compile_template(
    Path(id_or_code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<signoff_core::CompiledTemplate>, ApiError> {
    Ok(Json(
        state.templates.compile(&query.tenant, &id_or_code).await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct VersionListResponse {
    items: Vec<signoff_core::ApprovalTemplate>,
}

async fn list_versions(
    Path(code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<VersionListResponse>, ApiError> {
    Ok(Json(VersionListResponse {
        items: state.templates.list_versions(&query.tenant, &code).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct RollbackRequest {
    target_version: u32,
}

async fn rollback_template(
    Path(code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<signoff_core::ApprovalTemplate>, ApiError> {
    Ok(Json(
        state
            .templates
            .rollback(&query.tenant, &code, request.target_version)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct DiffQuery {
    tenant: String,
    from: u32,
    to: u32,
}

async fn diff_template(
    Path(code): Path<String>,
    Query(query): Query<DiffQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<signoff_core::TemplateDiff>, ApiError> {
    Ok(Json(
        state
            .templates
            .diff(&query.tenant, &code, query.from, query.to)
            .await?,
    ))
}

async fn impact_analysis(
    Path(code): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<signoff_core::ImpactReport>, ApiError> {
    Ok(Json(
        state.templates.impact_analysis(&query.tenant, &code).await?,
    ))
}

// ── Instances ────────────────────────────────────────────────────────

async fn create_instance(
    State(state): State<ServiceState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Json<CreateInstanceOutcome> {
    Json(state.engine.create_instance(request).await)
}

#[derive(Debug, Clone, Serialize)]
struct InstanceDetailResponse {
    instance: signoff_core::ApprovalInstance,
    stages: Vec<signoff_core::InstanceStage>,
    tasks: Vec<signoff_core::ApprovalTask>,
}

async fn get_instance(
    Path(id): Path<String>,
    Query(query): Query<TenantQuery>,
    State(state): State<ServiceState>,
) -> Result<Json<InstanceDetailResponse>, ApiError> {
    let instance = state
        .engine
        .instance(&query.tenant, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("instance '{id}' not found")))?;
    let stages = state.engine.instance_stages(&id).await?;
    let tasks = state.engine.instance_tasks(&id).await?;
    Ok(Json(InstanceDetailResponse {
        instance,
        stages,
        tasks,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ActionBody {
    tenant_id: String,
    #[serde(default)]
    task_id: Option<String>,
    actor: String,
    action: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    decision: Option<Decision>,
    #[serde(default)]
    expected_version: Option<u64>,
}

async fn execute_action(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<ActionBody>,
) -> Result<Json<signoff_core::ActionOutcome>, ApiError> {
    let action: ApprovalAction = body
        .action
        .parse()
        .map_err(|err: ApprovalError| ApiError::bad_request(err.to_string()))?;

    let request = ActionRequest {
        tenant_id: body.tenant_id,
        instance_id: id,
        task_id: body.task_id,
        actor: body.actor,
        action,
        reason: body.reason,
        note: body.note,
        target: body.target,
        decision: body.decision,
        expected_version: body.expected_version,
    };

    Ok(Json(state.engine.execute_action(request).await?))
}

#[derive(Debug, Clone, Serialize)]
struct EventListResponse {
    items: Vec<signoff_core::ApprovalEvent>,
}

async fn list_instance_events(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<EventListResponse>, ApiError> {
    Ok(Json(EventListResponse {
        items: state.engine.instance_events(&id).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct RehydrateRequest {
    tenant_id: String,
}

async fn rehydrate_timers(
    State(state): State<ServiceState>,
    Json(request): Json<RehydrateRequest>,
) -> Result<Json<signoff_core::RehydrationSummary>, ApiError> {
    Ok(Json(
        state.sla.rehydrate_pending_timers(&request.tenant_id).await?,
    ))
}
