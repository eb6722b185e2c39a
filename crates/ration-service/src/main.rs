use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use ration_api::{
    RationApi, RegenerationHandle, RegenerationStatus, Regenerator, API_CONTRACT_VERSION,
};
use ration_core::{
    AllocationError, Attribution, AttributionOutcome, BundleKind, EngineConfig, InventoryItem,
    PreferenceTag, RecipientId, SizeTier,
};
use ration_store_sqlite::{PlanLineRow, RecipientRecord, StoredPlan};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const LOG_ENV: &str = "RATION_LOG";

#[derive(Debug, Clone)]
struct ServiceState {
    api: RationApi,
    regenerations: RegenerationHandle,
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
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct MutationResponse<T>
where
    T: Serialize,
{
    #[serde(flatten)]
    result: T,
    regeneration_queued: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ItemMutation {
    item: InventoryItem,
}

#[derive(Debug, Clone, Serialize)]
struct RecipientMutation {
    recipient: RecipientRecord,
}

#[derive(Debug, Clone, Serialize)]
struct ConfigMutation {
    config: EngineConfig,
}

#[derive(Debug, Clone, Serialize)]
struct Removal {
    key: String,
    removed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RecipientRequest {
    id: RecipientId,
    size_tier: Option<SizeTier>,
    household_size: Option<u32>,
    preference_tag: Option<PreferenceTag>,
    #[serde(default = "default_eligible")]
    eligible: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PlanLinesQuery {
    bundle: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "ration-service")]
#[command(about = "Local HTTP service for the charity allocation engine")]
struct Args {
    #[arg(long, default_value = "./ration.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    /// Engine rejections are client errors about the submitted data; anything
    /// else is a bad request.
    fn from_anyhow(err: &anyhow::Error) -> Self {
        let status = if err.downcast_ref::<AllocationError>().is_some() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            StatusCode::BAD_REQUEST
        };
        Self::new(status, format!("{err:#}"))
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl RecipientRequest {
    fn into_record(self) -> RecipientRecord {
        RecipientRecord {
            id: self.id,
            size_tier: self.size_tier,
            household_size: self.household_size,
            preference_tag: self.preference_tag,
            eligible: self.eligible,
        }
    }
}

fn default_eligible() -> bool {
    true
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
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/inventory", get(inventory_list).post(inventory_upsert))
        .route("/v1/inventory/:name", delete(inventory_remove))
        .route("/v1/recipients", get(recipient_list).post(recipient_upsert))
        .route("/v1/recipients/:id", delete(recipient_remove))
        .route("/v1/config", get(config_show).post(config_set))
        .route("/v1/plan", get(plan_show))
        .route("/v1/plan/lines", get(plan_lines))
        .route("/v1/attributions", get(attribution_list))
        .route("/v1/attribute", post(attribute_now))
        .route("/v1/regenerate", post(regenerate))
        .route("/v1/regeneration/status", get(regeneration_status))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = RationApi::new(args.db);
    api.migrate(false)?;
    let regenerations = Regenerator::spawn(api.clone());
    let state = ServiceState { api, regenerations };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "ration service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn queue_regeneration(state: &ServiceState, reason: String) -> Result<bool, ServiceError> {
    state
        .regenerations
        .trigger(reason)
        .map_err(|err| ServiceError::new(StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}")))?;
    Ok(true)
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn inventory_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<InventoryItem>>>, ServiceError> {
    let items = state.api.list_items().map_err(|err| ServiceError::from_anyhow(&err))?;
    Ok(Json(envelope(items)))
}

async fn inventory_upsert(
    State(state): State<ServiceState>,
    Json(request): Json<InventoryItem>,
) -> Result<Json<ServiceEnvelope<MutationResponse<ItemMutation>>>, ServiceError> {
    let item = state.api.upsert_item(request).map_err(|err| ServiceError::from_anyhow(&err))?;
    let regeneration_queued = queue_regeneration(&state, format!("inventory upsert: {}", item.name))?;
    Ok(Json(envelope(MutationResponse { result: ItemMutation { item }, regeneration_queued })))
}

async fn inventory_remove(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceEnvelope<MutationResponse<Removal>>>, ServiceError> {
    let removed = state.api.remove_item(&name).map_err(|err| ServiceError::from_anyhow(&err))?;
    if !removed {
        return Err(ServiceError::not_found(format!("inventory item not found: {name}")));
    }
    let regeneration_queued = queue_regeneration(&state, format!("inventory remove: {name}"))?;
    Ok(Json(envelope(MutationResponse {
        result: Removal { key: name, removed },
        regeneration_queued,
    })))
}

async fn recipient_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<RecipientRecord>>>, ServiceError> {
    let recipients = state.api.list_recipients().map_err(|err| ServiceError::from_anyhow(&err))?;
    Ok(Json(envelope(recipients)))
}

async fn recipient_upsert(
    State(state): State<ServiceState>,
    Json(request): Json<RecipientRequest>,
) -> Result<Json<ServiceEnvelope<MutationResponse<RecipientMutation>>>, ServiceError> {
    let recipient = state
        .api
        .upsert_recipient(request.into_record())
        .map_err(|err| ServiceError::from_anyhow(&err))?;
    let regeneration_queued =
        queue_regeneration(&state, format!("recipient upsert: {}", recipient.id))?;
    Ok(Json(envelope(MutationResponse {
        result: RecipientMutation { recipient },
        regeneration_queued,
    })))
}

async fn recipient_remove(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<MutationResponse<Removal>>>, ServiceError> {
    let removed = state
        .api
        .remove_recipient(&RecipientId::new(id.clone()))
        .map_err(|err| ServiceError::from_anyhow(&err))?;
    if !removed {
        return Err(ServiceError::not_found(format!("recipient not found: {id}")));
    }
    let regeneration_queued = queue_regeneration(&state, format!("recipient remove: {id}"))?;
    Ok(Json(envelope(MutationResponse { result: Removal { key: id, removed }, regeneration_queued })))
}

async fn config_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<EngineConfig>>, ServiceError> {
    let config = state.api.config().map_err(|err| ServiceError::from_anyhow(&err))?;
    Ok(Json(envelope(config)))
}

async fn config_set(
    State(state): State<ServiceState>,
    Json(request): Json<EngineConfig>,
) -> Result<Json<ServiceEnvelope<MutationResponse<ConfigMutation>>>, ServiceError> {
    let config = state.api.set_config(request).map_err(|err| {
        ServiceError::new(StatusCode::UNPROCESSABLE_ENTITY, format!("{err:#}"))
    })?;
    let regeneration_queued = queue_regeneration(&state, "config update".to_string())?;
    Ok(Json(envelope(MutationResponse { result: ConfigMutation { config }, regeneration_queued })))
}

async fn plan_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StoredPlan>>, ServiceError> {
    let stored = state
        .api
        .current_plan()
        .map_err(|err| ServiceError::from_anyhow(&err))?
        .ok_or_else(|| ServiceError::not_found("no allocation plan has been generated yet"))?;
    Ok(Json(envelope(stored)))
}

async fn plan_lines(
    State(state): State<ServiceState>,
    Query(query): Query<PlanLinesQuery>,
) -> Result<Json<ServiceEnvelope<Vec<PlanLineRow>>>, ServiceError> {
    let bundle = query
        .bundle
        .as_deref()
        .map(|key| {
            BundleKind::parse_key(key).ok_or_else(|| {
                ServiceError::new(StatusCode::BAD_REQUEST, format!("unknown bundle key: {key}"))
            })
        })
        .transpose()?;
    let lines = state.api.plan_lines(bundle).map_err(|err| ServiceError::from_anyhow(&err))?;
    Ok(Json(envelope(lines)))
}

async fn attribution_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Attribution>>>, ServiceError> {
    let attributions =
        state.api.list_attributions().map_err(|err| ServiceError::from_anyhow(&err))?;
    Ok(Json(envelope(attributions)))
}

async fn attribute_now(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<AttributionOutcome>>, ServiceError> {
    let outcome =
        state.regenerations.attribute().await.map_err(|err| ServiceError::from_anyhow(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn regenerate(
    State(state): State<ServiceState>,
) -> Result<(StatusCode, Json<ServiceEnvelope<RegenerationStatus>>), ServiceError> {
    queue_regeneration(&state, "explicit request".to_string())?;
    Ok((StatusCode::ACCEPTED, Json(envelope(state.regenerations.status()))))
}

async fn regeneration_status(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<RegenerationStatus>> {
    Json(envelope(state.regenerations.status()))
}
