use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use prospector_config::Config;
use prospector_contracts::{
    Campaign, CampaignUpdate, ChatRequest, ChatResponse, ContractsMetadata, ConversationTurn,
    DraftCreated,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

pub mod conversation;
pub mod engine;
pub mod store;

use conversation::{ChatError, ChatService, ChatSettings};
use engine::{EngineError, ExtractionEngine, OpenAiGenerator, TextGenerator};
use store::{CampaignStore, SqliteStore, StoreError};

pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let generator = OpenAiGenerator::new(&cfg.engine).map_err(|e| e.to_string())?;
    build_app_with_generator(cfg, Arc::new(generator)).await
}

/// Same as [`build_app`] with the text-generation client supplied by the caller.
pub async fn build_app_with_generator(
    cfg: Config,
    generator: Arc<dyn TextGenerator>,
) -> Result<Router, String> {
    let state = AppState::new(&cfg, generator)?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/drafts", post(drafts))
        .route("/v1/chat", post(chat_submit).get(chat_history))
        .route("/v1/campaigns", get(campaigns_list))
        .route("/v1/campaigns/{id}", get(campaign_get))
        .route("/v1/webhooks/campaign-update", post(campaign_update))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    chat: Arc<ChatService>,
    campaigns: Arc<dyn CampaignStore>,
}

impl AppState {
    fn new(cfg: &Config, generator: Arc<dyn TextGenerator>) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .as_deref()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            SqliteStore::open(sqlite_path)
        } else {
            SqliteStore::open_in_memory()
        }
        .map_err(|e| e.to_string())?;
        let store = Arc::new(store);

        let engine = ExtractionEngine::new(generator).map_err(|e| e.to_string())?;
        let chat = ChatService::new(
            store.clone(),
            store.clone(),
            engine,
            ChatSettings {
                turn_timeout: Duration::from_millis(cfg.chat.turn_timeout_ms),
                max_message_chars: cfg.chat.max_message_chars,
            },
        );
        Ok(Self {
            chat: Arc::new(chat),
            campaigns: store,
        })
    }
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({"error": {"code": code, "message": message.into()}})),
    )
}

fn chat_error(e: ChatError) -> ApiError {
    match e {
        ChatError::InvalidInput(message) => {
            api_error(StatusCode::BAD_REQUEST, "validation_error", message)
        }
        ChatError::Engine(EngineError::Timeout(limit)) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": {
                "code": "engine.timeout",
                "message": format!("text generation did not answer within {limit:?}"),
                "details": {"retryable": true}
            }})),
        ),
        ChatError::Engine(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": {
                "code": "engine.failure",
                "message": e.to_string(),
                "details": {"retryable": true}
            }})),
        ),
        ChatError::Store(e) => store_error(e),
    }
}

fn store_error(e: StoreError) -> ApiError {
    error!(error = %e, "store failure");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "store.failure", e.to_string())
}

/// Malformed or incomplete JSON bodies are input errors like any other.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v).map_err(|rejection| {
        api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
        )
    })
}

fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("{USER_ID_HEADER} header is required"),
            )
        })
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<ContractsMetadata> {
    Json(ContractsMetadata::current())
}

async fn drafts() -> Json<DraftCreated> {
    Json(DraftCreated {
        campaign_draft_id: format!("draft_{}", uuid::Uuid::new_v4().as_simple()),
    })
}

async fn chat_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let input = json_body(body)?;
    state
        .chat
        .submit_message(&user_id, input.campaign_draft_id.as_deref(), &input.message)
        .await
        .map(Json)
        .map_err(chat_error)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    campaign_draft_id: Option<String>,
}

async fn chat_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    let user_id = user_id(&headers)?;
    state
        .chat
        .history(&user_id, query.campaign_draft_id.as_deref())
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn campaigns_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Campaign>>, ApiError> {
    let user_id = user_id(&headers)?;
    state
        .campaigns
        .campaigns_for_user(&user_id)
        .await
        .map(Json)
        .map_err(store_error)
}

async fn campaign_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    let user_id = user_id(&headers)?;
    match state.campaigns.campaign(&user_id, &id).await {
        Ok(Some(campaign)) => Ok(Json(campaign)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("campaign {id} not found"),
        )),
        Err(e) => Err(store_error(e)),
    }
}

async fn campaign_update(
    State(state): State<AppState>,
    body: Result<Json<CampaignUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(body)?;
    if input.user_id.trim().is_empty() || input.campaign_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "user_id and campaign_id are required",
        ));
    }
    if input.lead_count.is_some_and(|v| v < 0) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "lead_count must be >= 0",
        ));
    }
    match state.campaigns.apply_update(&input).await {
        Ok(Some(campaign)) => {
            info!(
                campaign_id = %campaign.id,
                status = campaign.status.as_str(),
                progress = campaign.progress,
                "campaign updated by automation"
            );
            Ok(Json(json!({"success": true, "campaign": campaign})))
        }
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("campaign {} not found", input.campaign_id),
        )),
        Err(e) => Err(store_error(e)),
    }
}
