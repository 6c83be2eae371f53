use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use slackbot_config::Config;
use slackbot_contracts::{
    ErrorBody, ErrorResponse, EventEnvelope, InteractionForm, InteractionPayload, MenuOptionsQuery,
    SlashCommandParams, ViewsReply,
};
use slackbot_kernel::signature::{self, SignatureError, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use slackbot_kernel::{
    Args, BotConfig, Callback, CallbackError, CallbackStorage, CallbackStore, CommandContext,
    EventContext, HandlerError, HandlerNotFound, InteractionContext, MemoryStorage,
    MenuOptionsContext, NewCallback, Principal, Reply, StorageError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod api_client;

use api_client::{ApiResponse, SlackApiClient, SlackApiError};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const DIRECT_MESSAGE_CHANNEL: &str = "directmessage";

pub async fn serve(cfg: Config, bot: BotConfig) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg, bot).await?;

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
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub async fn build_app(cfg: Config, bot: BotConfig) -> Result<Router, String> {
    let state = AppState::new(cfg, bot)?;
    let slack_routes = Router::new()
        .route("/v1/commands/{url_token}", post(commands))
        .route("/v1/interactions", post(interactions))
        .route("/v1/events", post(events))
        .route("/v1/menu_options", get(menu_options))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            verify_slack_signature,
        ));
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .merge(slack_routes)
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    bot: Arc<BotConfig>,
    callbacks: CallbackStore,
    slack: Option<Arc<SlackApiClient>>,
    signing_secret: Option<String>,
}

/// Where a handler's [`Reply`] lands: who asked, from where, and the callback
/// the request was correlated with, if any.
struct ReplyTarget {
    handler_name: String,
    user: Option<Principal>,
    trigger_id: Option<String>,
    channel_id: Option<String>,
    args: Args,
    view_id: Option<String>,
    callback: Option<Callback>,
}

impl ReplyTarget {
    fn new(handler_name: &str, user: Option<Principal>) -> Self {
        Self {
            handler_name: handler_name.to_string(),
            user,
            trigger_id: None,
            channel_id: None,
            args: Args::new(),
            view_id: None,
            callback: None,
        }
    }
}

impl AppState {
    fn new(cfg: Config, bot: BotConfig) -> Result<Self, String> {
        bot.validate()
            .map_err(|e| format!("invalid bot config: {e}; registered: {:?}", e.known))?;

        let storage: Arc<dyn CallbackStorage> = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            Arc::new(SqliteStorage::new(&sqlite_path)?)
        } else {
            Arc::new(MemoryStorage::new())
        };
        let callbacks = CallbackStore::new(storage)
            .with_key_prefix(cfg.callback.key_prefix.clone())
            .with_expires_in(Duration::from_secs(cfg.callback.expires_in_secs))
            .with_user_scope(cfg.callback.user_scope);

        let signing_secret = if cfg.slack.verify_signature {
            Some(cfg.slack.resolve_signing_secret().ok_or_else(|| {
                format!(
                    "slack signing secret is not set (slack.signing_secret or ${})",
                    cfg.slack.signing_secret_env
                )
            })?)
        } else {
            warn!("slack request signature verification is disabled");
            None
        };

        let slack = match cfg.slack.resolve_bot_token() {
            Some(token) => Some(Arc::new(
                SlackApiClient::new(&cfg.slack.api_base_url, &token).map_err(|e| e.to_string())?,
            )),
            None => {
                warn!(
                    env = %cfg.slack.bot_token_env,
                    "slack bot token is not set; replies that call the Web API will fail"
                );
                None
            }
        };

        Ok(Self {
            cfg: Arc::new(cfg),
            bot: Arc::new(bot),
            callbacks,
            slack,
            signing_secret,
        })
    }

    fn slack(&self) -> Result<&SlackApiClient, ApiError> {
        self.slack.as_deref().ok_or(ApiError::SlackUnconfigured)
    }

    fn verify_team(&self, team_id: Option<&str>) -> Result<(), ApiError> {
        match self.cfg.slack.team_id.as_deref() {
            Some(expected) if Some(expected) != team_id => Err(ApiError::Team),
            _ => Ok(()),
        }
    }

    fn find_user(&self, user_id: Option<&str>) -> Option<Principal> {
        user_id
            .filter(|v| !v.trim().is_empty())
            .and_then(|id| self.bot.find_user(id))
    }

    /// Looks the callback up by `view.callback_id`, then through the view index.
    fn find_interaction_callback(
        &self,
        payload: &InteractionPayload,
        user: &Principal,
    ) -> Result<Option<Callback>, ApiError> {
        let Some(view) = payload.view.as_ref() else {
            return Ok(None);
        };
        if let Some(callback_id) = view.callback_id.as_deref() {
            if let Some(callback) = self.callbacks.find(callback_id, Some(user))? {
                return Ok(Some(callback));
            }
        }
        match view.id.as_deref() {
            Some(view_id) => Ok(self.callbacks.find_by_view_id(view_id, Some(user))?),
            None => Ok(None),
        }
    }

    async fn execute(&self, reply: Reply, target: ReplyTarget) -> Result<Response, ApiError> {
        match reply {
            Reply::Nothing => Ok(StatusCode::OK.into_response()),
            Reply::Respond(body) => Ok(Json(body).into_response()),
            Reply::OpenModal { view, payload } => {
                let views = self.open_modal(view, payload, target).await?;
                info!(callback_id = %views.callback_id, view_id = ?views.view_id, "modal opened");
                Ok(StatusCode::OK.into_response())
            }
            Reply::UpdateModal { view } => {
                let views = self.update_modal(view, target).await?;
                info!(callback_id = %views.callback_id, view_id = ?views.view_id, "modal updated");
                Ok(StatusCode::OK.into_response())
            }
            Reply::PublishView { user_id, view } => {
                let response = self.slack()?.views_publish(&user_id, &view).await?;
                ensure_ok("views.publish", &response)?;
                Ok(StatusCode::OK.into_response())
            }
            Reply::PostMessage {
                channel,
                text,
                blocks,
            } => {
                let channel = channel.or(target.channel_id).ok_or_else(|| {
                    ApiError::Validation("post_message needs a channel".to_string())
                })?;
                let response = self
                    .slack()?
                    .chat_post_message(&channel, &text, blocks.as_ref())
                    .await?;
                ensure_ok("chat.postMessage", &response)?;
                Ok(StatusCode::OK.into_response())
            }
        }
    }

    async fn open_modal(
        &self,
        view: Value,
        payload: Option<Value>,
        target: ReplyTarget,
    ) -> Result<ViewsReply, ApiError> {
        let slack = self.slack()?;
        let trigger_id = target
            .trigger_id
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ApiError::Validation("trigger_id is required to open a modal".to_string()))?;
        let user = target.user.ok_or(ApiError::User)?;

        let mut new = NewCallback::new(target.handler_name, user).with_args(target.args);
        if let Some(channel_id) = target.channel_id {
            new = new.with_channel_id(channel_id);
        }
        if let Some(payload) = payload {
            new = new.with_payload(payload);
        }
        let mut callback = self.callbacks.create(new)?;
        let callback_id = callback.id().unwrap_or_default().to_string();

        let view = stamp_modal(view, &callback_id)?;
        let response = slack.views_open(&trigger_id, &view).await?;
        ensure_ok("views.open", &response)?;

        let view_id = response.view_id();
        if view_id.is_some() {
            callback.set_view_id(view_id.clone());
            callback.save()?;
        }
        Ok(ViewsReply {
            callback_id,
            view_id,
        })
    }

    async fn update_modal(&self, view: Value, target: ReplyTarget) -> Result<ViewsReply, ApiError> {
        let slack = self.slack()?;
        let mut callback = target.callback.ok_or_else(|| {
            ApiError::Validation("update_modal is only available to interactions".to_string())
        })?;
        let view_id = target
            .view_id
            .ok_or_else(|| ApiError::Validation("interaction payload has no view id".to_string()))?;
        let callback_id = callback.id().unwrap_or_default().to_string();

        let view = stamp_modal(view, &callback_id)?;
        let response = slack.views_update(&view_id, &view).await?;
        ensure_ok("views.update", &response)?;

        let view_id = response.view_id();
        if view_id.is_some() {
            callback.set_view_id(view_id.clone());
            callback.save()?;
        }
        Ok(ViewsReply {
            callback_id,
            view_id,
        })
    }
}

fn stamp_modal(view: Value, callback_id: &str) -> Result<Value, ApiError> {
    match view {
        Value::Object(mut map) => {
            map.insert("type".to_string(), Value::String("modal".to_string()));
            map.insert(
                "callback_id".to_string(),
                Value::String(callback_id.to_string()),
            );
            Ok(Value::Object(map))
        }
        _ => Err(ApiError::Validation(
            "modal view must be a JSON object".to_string(),
        )),
    }
}

fn ensure_ok(method: &'static str, response: &ApiResponse) -> Result<(), ApiError> {
    if response.ok() {
        return Ok(());
    }
    let error = response.error().unwrap_or("unknown_error").to_string();
    warn!(method, status = response.status(), error = %error, "slack API call failed");
    Err(ApiError::SlackResponse {
        method,
        error,
        data: response.data().clone(),
    })
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn verify_slack_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(secret) = state.signing_secret.as_deref() else {
        return Ok(next.run(request).await);
    };
    let (parts, body) = request.into_parts();
    let bytes: Bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read request body: {e}")))?;

    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    if let Err(err) = signature::verify(
        secret,
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        &bytes,
        Utc::now().timestamp(),
        state.cfg.slack.signature_max_age_secs,
    ) {
        warn!(path = %parts.uri.path(), error = %err, "rejected slack request signature");
        return Err(ApiError::Signature(err));
    }
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

async fn commands(
    State(state): State<AppState>,
    Path(url_token): Path<String>,
    Form(params): Form<SlashCommandParams>,
) -> Result<Response, ApiError> {
    let command = state
        .bot
        .find_slash_command(&url_token, &params.text)
        .ok_or(ApiError::SlashCommandNotImplemented)?;
    let handler = state.bot.find_handler(&command.handler)?;
    info!(
        url_token = %url_token,
        full_token = %command.full_token,
        handler = %command.handler,
        "slash command"
    );

    if handler.only_slack_team() {
        state.verify_team(Some(params.team_id.as_str()))?;
    }
    if handler.only_direct_message() && params.channel_name != DIRECT_MESSAGE_CHANNEL {
        return Err(ApiError::Channel);
    }
    let current_user = state.find_user(Some(params.user_id.as_str()));
    if handler.only_user() && current_user.is_none() {
        return Err(ApiError::User);
    }

    let (reply, args) = {
        let mut ctx = CommandContext {
            current_user: current_user.as_ref(),
            params: &params,
            route: &command,
            args: Args::parse(&command.args),
        };
        let reply = handler.command(&mut ctx)?;
        (reply, ctx.args)
    };

    let mut target = ReplyTarget::new(&command.handler, current_user);
    target.trigger_id = params.trigger_id.clone();
    target.channel_id = Some(params.channel_id.clone()).filter(|v| !v.is_empty());
    target.args = args;
    state.execute(reply, target).await
}

async fn interactions(
    State(state): State<AppState>,
    Form(form): Form<InteractionForm>,
) -> Result<Response, ApiError> {
    let payload: InteractionPayload = serde_json::from_str(&form.payload)
        .map_err(|e| ApiError::Validation(format!("invalid interaction payload: {e}")))?;
    if payload.kind != "block_actions" && payload.kind != "view_submission" {
        return Err(ApiError::UnknownActionType(payload.kind));
    }

    let user = state
        .find_user(Some(payload.user.id.as_str()))
        .ok_or(ApiError::User)?;
    let mut callback = state
        .find_interaction_callback(&payload, &user)?
        .ok_or(ApiError::CallbackNotFound)?;
    debug!(
        callback_id = ?callback.id(),
        callback_user = ?callback.user_id(),
        user = %user.id,
        "interaction callback loaded"
    );
    if callback.user_id() != Some(user.id.as_str()) {
        return Err(ApiError::CallbackUserMismatch);
    }

    let Some(handler) = callback.handler(state.bot.registry())? else {
        return Ok(StatusCode::OK.into_response());
    };
    let handler_name = callback.class_name().unwrap_or_default().to_string();
    info!(kind = %payload.kind, handler = %handler_name, "interaction");

    let reply = {
        let mut ctx = InteractionContext {
            current_user: &user,
            payload: &payload,
            callback: &mut callback,
        };
        handler.interaction(&mut ctx)?
    };

    let mut target = ReplyTarget::new(&handler_name, Some(user));
    target.trigger_id = payload.trigger_id.clone();
    target.channel_id = callback.channel_id().map(|v| v.to_string());
    target.args = callback.args().clone();
    target.view_id = payload.view.as_ref().and_then(|v| v.id.clone());
    target.callback = Some(callback);
    state.execute(reply, target).await
}

async fn events(
    State(state): State<AppState>,
    Json(envelope): Json<EventEnvelope>,
) -> Result<Response, ApiError> {
    match envelope.kind.as_str() {
        "url_verification" => Ok(Json(json!({ "challenge": envelope.challenge })).into_response()),
        "event_callback" => {
            state.verify_team(envelope.team_id.as_deref())?;
            let event = envelope
                .event
                .as_ref()
                .ok_or_else(|| ApiError::Validation("event_callback without event".to_string()))?;
            let Some(handler) = state.bot.find_event_handler(&event.kind)? else {
                debug!(event_type = %event.kind, "no handler bound to event");
                return Ok(StatusCode::OK.into_response());
            };
            info!(event_type = %event.kind, "event");

            let current_user = state.find_user(event.user.as_deref());
            let reply = handler.event(&EventContext {
                current_user: current_user.as_ref(),
                envelope: &envelope,
                event,
            })?;

            let handler_name = state.bot.event_handler_name(&event.kind).unwrap_or_default();
            let mut target = ReplyTarget::new(handler_name, current_user);
            target.channel_id = event.channel.clone();
            state.execute(reply, target).await
        }
        _ => Ok(StatusCode::OK.into_response()),
    }
}

async fn menu_options(
    State(state): State<AppState>,
    Query(query): Query<MenuOptionsQuery>,
) -> Result<Response, ApiError> {
    let handler = state
        .bot
        .find_menu_options(&query.action_id)?
        .ok_or(ApiError::MenuOptionsNotImplemented)?;
    info!(action_id = %query.action_id, "menu options");

    let current_user = state.find_user(query.user_id.as_deref());
    let reply = handler.menu_options(&MenuOptionsContext {
        current_user: current_user.as_ref(),
        query: &query,
    })?;
    let handler_name = state
        .bot
        .menu_options_handler_name(&query.action_id)
        .unwrap_or_default();
    state
        .execute(reply, ReplyTarget::new(handler_name, current_user))
        .await
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("unknown action type: {0}")]
    UnknownActionType(String),
    #[error(transparent)]
    Signature(SignatureError),
    #[error("team is not authorized")]
    Team,
    #[error("this command is only available in direct messages")]
    Channel,
    #[error("user is not authorized")]
    User,
    #[error("callback user is not equal to action user")]
    CallbackUserMismatch,
    #[error("callback not found")]
    CallbackNotFound,
    #[error("slash command is not implemented")]
    SlashCommandNotImplemented,
    #[error("menu options are not implemented")]
    MenuOptionsNotImplemented,
    #[error(transparent)]
    HandlerNotFound(#[from] HandlerNotFound),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error("slack bot API token is not configured")]
    SlackUnconfigured,
    #[error(transparent)]
    SlackApi(#[from] SlackApiError),
    #[error("{method} failed: {error}")]
    SlackResponse {
        method: &'static str,
        error: String,
        data: Value,
    },
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::UnknownActionType(_) => (StatusCode::BAD_REQUEST, "unknown_action_type"),
            ApiError::Signature(_) => (StatusCode::UNAUTHORIZED, "signature_invalid"),
            ApiError::Team => (StatusCode::FORBIDDEN, "team_unauthorized"),
            ApiError::Channel => (StatusCode::FORBIDDEN, "channel_unauthorized"),
            ApiError::User => (StatusCode::FORBIDDEN, "user_unauthorized"),
            ApiError::CallbackUserMismatch => (StatusCode::FORBIDDEN, "callback_user_mismatch"),
            ApiError::CallbackNotFound => (StatusCode::NOT_FOUND, "callback_not_found"),
            ApiError::SlashCommandNotImplemented => {
                (StatusCode::NOT_FOUND, "slash_command_not_implemented")
            }
            ApiError::MenuOptionsNotImplemented => {
                (StatusCode::NOT_FOUND, "menu_options_not_implemented")
            }
            ApiError::Handler(HandlerError::NotImplemented(_)) => {
                (StatusCode::NOT_FOUND, "not_implemented")
            }
            ApiError::HandlerNotFound(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "handler_class_not_found")
            }
            ApiError::Handler(HandlerError::Callback(_)) | ApiError::Callback(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "callback_error")
            }
            ApiError::Handler(HandlerError::Failed(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "handler_error")
            }
            ApiError::SlackUnconfigured | ApiError::SlackApi(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "slack_api_error")
            }
            ApiError::SlackResponse { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "slack_response_error")
            }
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::HandlerNotFound(err) => Some(json!({
                "class_name": err.name,
                "handler_classes": err.known,
            })),
            ApiError::SlackResponse { method, data, .. } => {
                Some(json!({ "method": method, "response": data }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(code, error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Callback records in a SQLite table, with expiry checked on read.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS callbacks (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".to_string()))
    }
}

impl CallbackStorage for SqliteStorage {
    fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let conn = self.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value_json, expires_at FROM callbacks WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let Some((value_json, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= Utc::now().timestamp_millis() {
            conn.execute("DELETE FROM callbacks WHERE key = ?1", params![key])
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            return Ok(None);
        }
        serde_json::from_str(&value_json)
            .map(Some)
            .map_err(|e| StorageError::Decode(e.to_string()))
    }

    fn write(&self, key: &str, value: &Value, expires_in: Duration) -> Result<(), StorageError> {
        let value_json =
            serde_json::to_string(value).map_err(|e| StorageError::Decode(e.to_string()))?;
        let ttl_ms = i64::try_from(expires_in.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);
        self.conn()?
            .execute(
                "INSERT INTO callbacks(key, value_json, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, expires_at = excluded.expires_at",
                params![key, value_json, expires_at],
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.conn()?
            .execute("DELETE FROM callbacks WHERE key = ?1", params![key])
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
