//! HTTP and WebSocket surface.
//!
//! `/ws` carries the live protocol. The REST routes mirror it for clients
//! without a live connection and share the same routing, read-state and
//! fanout code, so both paths behave identically.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::db::{Message, Notification, SupportThreadSummary};
use crate::error::{AuthError, ChatError};
use crate::identity::Principal;
use crate::notify::{self, NewNotification};
use crate::read_state::{self, UnreadCounts};
use crate::routing::{self, SendRequest};
use crate::server::SharedState;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 500;

pub fn router(state: Arc<SharedState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state.config.cors_origins.iter().filter_map(|o| o.parse().ok()),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/messages", get(api_history).post(api_send))
        .route("/messages/unread", get(api_unread))
        .route("/messages/read", post(api_mark_read))
        .route("/messages/since", get(api_since))
        .route("/messages/threads", get(api_support_threads))
        .route("/notifications", get(api_notifications).post(api_notify))
        .route("/notifications/read-all", post(api_notifications_read_all))
        .route("/notifications/{id}/read", post(api_notification_read))
        .route("/api/v1/health", get(api_health))
        .layer(cors)
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::connection::serve(socket, state))
}

// ── Auth ───────────────────────────────────────────────────────────────

/// Principal resolved from `Authorization: Bearer <token>`.
pub struct AuthUser(pub Principal);

impl FromRequestParts<Arc<SharedState>> for AuthUser {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<SharedState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?;
        let principal = {
            let db = state.db.lock();
            state.tokens.resolve(token, &db)
        };
        principal.map(AuthUser).map_err(|e| {
            tracing::debug!(error = %e, "bearer token rejected");
            ChatError::Auth(e)
        })
    }
}

impl AuthUser {
    fn require_admin(&self) -> Result<&Principal, ChatError> {
        if self.0.is_admin() {
            Ok(&self.0)
        } else {
            Err(ChatError::Forbidden("admin only".to_string()))
        }
    }
}

/// Query flags accept `?flag`, `?flag=true` and `?flag=1`.
fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("" | "true" | "1"))
}

fn page(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

// ── Messages ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(rename = "isSupport")]
    is_support: Option<String>,
    #[serde(rename = "threadUserId")]
    thread_user_id: Option<String>,
    limit: Option<usize>,
    /// Only messages with a smaller id (paging back).
    before: Option<i64>,
}

async fn api_history(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let thread = routing::thread_for(&principal, flag(q.is_support.as_deref()), q.thread_user_id.as_deref())?;
    let messages = state.with_db(|db| db.thread_messages(&thread, Some(page(q.limit)), q.before))?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct SendBody {
    #[serde(default)]
    receiver_id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(rename = "isSupport", default)]
    is_support: bool,
    #[serde(default)]
    client_msg_id: Option<String>,
}

async fn api_send(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
    Json(body): Json<SendBody>,
) -> Result<(StatusCode, Json<Message>), ChatError> {
    let req = SendRequest {
        receiver_id: body.receiver_id,
        content: body.content,
        is_support: body.is_support,
        client_msg_id: body.client_msg_id,
    };
    let message = routing::send(&state, &principal, req, None)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn api_unread(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<UnreadCounts>, ChatError> {
    Ok(Json(state.with_db(|db| read_state::unread_counts(db, &principal))?))
}

#[derive(Deserialize)]
struct ReadBody {
    #[serde(rename = "isSupport", default)]
    is_support: bool,
    #[serde(rename = "threadUserId", default)]
    thread_user_id: Option<String>,
}

async fn api_mark_read(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
    Json(body): Json<ReadBody>,
) -> Result<Json<UnreadCounts>, ChatError> {
    let counts = read_state::mark_read(&state, &principal, body.is_support, body.thread_user_id.as_deref())?;
    Ok(Json(counts))
}

#[derive(Deserialize)]
struct SinceQuery {
    #[serde(default)]
    after_id: i64,
    limit: Option<usize>,
}

async fn api_since(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
    Query(q): Query<SinceQuery>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let messages = state.with_db(|db| {
        db.messages_after(&principal.user_id, principal.is_admin(), q.after_id, page(q.limit))
    })?;
    Ok(Json(messages))
}

async fn api_support_threads(
    user: AuthUser,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<SupportThreadSummary>>, ChatError> {
    user.require_admin()?;
    Ok(Json(state.with_db(|db| db.support_threads())?))
}

// ── Notifications ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NotificationQuery {
    unread: Option<String>,
    limit: Option<usize>,
}

async fn api_notifications(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
    Query(q): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, ChatError> {
    let unread_only = flag(q.unread.as_deref());
    let rows = state.with_db(|db| db.notifications_for(&principal.user_id, unread_only, page(q.limit)))?;
    Ok(Json(rows))
}

async fn api_notify(
    user: AuthUser,
    State(state): State<Arc<SharedState>>,
    Json(event): Json<NewNotification>,
) -> Result<(StatusCode, Json<Vec<Notification>>), ChatError> {
    let admin = user.require_admin()?;
    tracing::info!(admin = %admin.user_id, kind = %event.kind, "notification submitted");
    let rows = notify::notify(&state, event)?;
    Ok((StatusCode::CREATED, Json(rows)))
}

async fn api_notification_read(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ChatError> {
    if state.with_db(|db| db.mark_notification_read(id, &principal.user_id))? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ChatError::routing(format!("no notification {id}")))
    }
}

#[derive(Serialize)]
struct ReadAllResponse {
    updated: usize,
}

async fn api_notifications_read_all(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<ReadAllResponse>, ChatError> {
    let updated = state.with_db(|db| db.mark_all_notifications_read(&principal.user_id))?;
    Ok(Json(ReadAllResponse { updated }))
}

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    connections: usize,
    online_users: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: state.registry.connection_count(),
        online_users: state.registry.online_users(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
