//! REST facade over the chat service and the producer, plus health and
//! metrics endpoints. Session traffic shares the same listener on `/ws`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_auth::TokenVerifier;
use relay_chat::{ChatService, ChatError, CreateConversationRequest, HistoryRequest};
use relay_core::{ConversationId, ConversationKind, MemberRole, MessageId, UserId};
use relay_dal::{BreakerState, DbPools, ReplicaLagMonitor, SharedDatastore};
use relay_gateway::SessionRegistry;
use relay_pipeline::{Producer, ProducerError, SendRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub producer: Arc<Producer>,
    pub store: SharedDatastore,
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<SessionRegistry>,
    pub prometheus: Option<PrometheusHandle>,
    pub pools: Option<DbPools>,
    pub lag_monitor: Option<Arc<ReplicaLagMonitor>>,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
    code: String,
}

struct ApiFailure(StatusCode, ApiError);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<ChatError> for ApiFailure {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::NotMember | ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::LastOwner => StatusCode::CONFLICT,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiFailure(
            status,
            ApiError {
                error: err.to_string(),
                code: err.code().into(),
            },
        )
    }
}

impl From<ProducerError> for ApiFailure {
    fn from(err: ProducerError) -> Self {
        let status = match &err {
            ProducerError::InvalidSchema(_) => StatusCode::BAD_REQUEST,
            ProducerError::ConversationNotFound => StatusCode::NOT_FOUND,
            ProducerError::ConversationInactive => StatusCode::CONFLICT,
            ProducerError::NotMember | ProducerError::UserBlocked => StatusCode::FORBIDDEN,
            ProducerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProducerError::EnqueueThrottled => StatusCode::TOO_MANY_REQUESTS,
            ProducerError::EnqueueFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProducerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiFailure(
            status,
            ApiError {
                error: err.to_string(),
                code: err.code().into(),
            },
        )
    }
}

fn bad_request(message: impl Into<String>) -> ApiFailure {
    ApiFailure(
        StatusCode::BAD_REQUEST,
        ApiError {
            error: message.into(),
            code: "invalid_request".into(),
        },
    )
}

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/conversations", post(create_conversation).get(list_conversations))
        .route("/conversations/{id}", get(conversation_details))
        .route(
            "/conversations/{id}/messages",
            post(send_message).get(get_messages),
        )
        .route("/conversations/{id}/messages/read", put(mark_read))
        .route(
            "/conversations/{id}/messages/{mid}",
            put(edit_message).delete(delete_message),
        )
        .route("/conversations/{id}/messages/{mid}/pin", put(pin_message).delete(unpin_message))
        .route("/conversations/{id}/participants", post(add_participants))
        .route(
            "/conversations/{id}/participants/{uid}",
            delete(remove_participant),
        )
        .route("/conversations/{id}/participants/{uid}/role", put(update_role))
        .route("/conversations/{id}/archive", put(archive).delete(unarchive))
        .route("/conversations/{id}/search", get(search))
        .route("/unread-count", get(unread_count))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/health", get(health))
        .route("/health/database", get(health_database))
        .route("/metrics", get(metrics_endpoint))
        .route("/ws", get(relay_gateway::ws_handler))
        .merge(authed)
        .with_state(state)
}

async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(token) = token else {
        return ApiFailure(
            StatusCode::UNAUTHORIZED,
            ApiError {
                error: "missing token".into(),
                code: "missing_token".into(),
            },
        )
        .into_response();
    };
    match tokio::time::timeout(Duration::from_secs(5), state.verifier.verify(&token)).await {
        Ok(Ok(verified)) => {
            request.extensions_mut().insert(verified.user_id);
            next.run(request).await
        }
        Ok(Err(err)) => ApiFailure(
            StatusCode::UNAUTHORIZED,
            ApiError {
                error: err.to_string(),
                code: err.code().into(),
            },
        )
        .into_response(),
        Err(_) => ApiFailure(
            StatusCode::UNAUTHORIZED,
            ApiError {
                error: "token verification timed out".into(),
                code: "internal".into(),
            },
        )
        .into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationBody {
    kind: ConversationKind,
    #[serde(default)]
    participant_ids: Vec<UserId>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Json(body): Json<CreateConversationBody>,
) -> Result<Response, ApiFailure> {
    let (conversation, created) = state
        .chat
        .create_conversation(
            &user,
            CreateConversationRequest {
                kind: body.kind,
                participant_ids: body.participant_ids,
                title: body.title,
                description: body.description,
            },
        )
        .await?;
    if created {
        // Tell each non-creator participant's live sessions about the new
        // conversation.
        let notification = json!({
            "conversation": conversation,
            "createdBy": user.as_str(),
        });
        if let Ok(members) = state.store.members(&conversation.id).await {
            for member in members.iter().filter(|m| m.user_id != user) {
                for session in state.registry.sessions_of_user(&member.user_id) {
                    session.emit("conversation_created", notification.clone());
                }
            }
        }
    }
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "conversation": conversation, "created": created }))).into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let page = state
        .chat
        .list_conversations(&user, query.limit, query.cursor.as_deref())
        .await?;
    let items: Vec<serde_json::Value> = page
        .items
        .iter()
        .map(|row| {
            json!({
                "conversation": row.conversation,
                "role": row.role,
                "unreadCount": row.unread_count,
                "participantCount": row.participant_count,
            })
        })
        .collect();
    Ok(Json(json!({ "items": items, "nextCursor": page.next_cursor })))
}

async fn conversation_details(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let details = state
        .chat
        .conversation_details(&ConversationId::from(id.as_str()), &user)
        .await?;
    Ok(Json(json!({
        "conversation": details.conversation,
        "members": details.members,
        "archived": details.archived,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message_type: Option<relay_core::MessageType>,
    #[serde(default)]
    attachments: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    client_message_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    reply_to_id: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Response, ApiFailure> {
    let reply_to_id = match &body.reply_to_id {
        Some(raw) => Some(MessageId::parse(raw).ok_or_else(|| bad_request("malformed replyToId"))?),
        None => None,
    };
    let ack = state
        .producer
        .send(SendRequest {
            conversation_id: ConversationId::from(id.as_str()),
            sender_id: user,
            content: body.content,
            message_type: body.message_type.unwrap_or(relay_core::MessageType::Text),
            attachments: body.attachments.unwrap_or_default(),
            media_url: body.media_url,
            client_message_id: body.client_message_id,
            client: None,
            correlation_id: None,
            reply_to_id,
            thread_id: body.thread_id,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ack)).into_response())
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    after: Option<String>,
}

fn parse_timestamp(raw: &Option<String>, name: &str) -> Result<Option<OffsetDateTime>, ApiFailure> {
    match raw {
        None => Ok(None),
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .map(Some)
            .map_err(|_| bad_request(format!("{name} must be an RFC 3339 timestamp"))),
    }
}

async fn get_messages(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let page = state
        .chat
        .get_messages(
            &ConversationId::from(id.as_str()),
            &user,
            HistoryRequest {
                limit: query.limit,
                cursor: query.cursor,
                before: parse_timestamp(&query.before, "before")?,
                after: parse_timestamp(&query.after, "after")?,
            },
        )
        .await?;
    Ok(Json(json!({
        "messages": page.messages,
        "nextCursor": page.next_cursor,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadBody {
    message_ids: Vec<String>,
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    Json(body): Json<MarkReadBody>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let mut ids = Vec::with_capacity(body.message_ids.len());
    for raw in &body.message_ids {
        ids.push(MessageId::parse(raw).ok_or_else(|| bad_request("malformed messageIds"))?);
    }
    let newly_read = state
        .chat
        .mark_read(&ConversationId::from(id.as_str()), &user, &ids)
        .await?;
    let ids: Vec<String> = newly_read.iter().map(|id| id.to_string()).collect();
    Ok(Json(json!({ "read": ids })))
}

#[derive(Deserialize)]
struct EditMessageBody {
    content: String,
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path((id, mid)): Path<(String, String)>,
    Json(body): Json<EditMessageBody>,
) -> Result<StatusCode, ApiFailure> {
    let message = MessageId::parse(&mid).ok_or_else(|| bad_request("malformed message id"))?;
    state
        .chat
        .edit_message(&ConversationId::from(id.as_str()), &user, &message, body.content)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path((id, mid)): Path<(String, String)>,
) -> Result<StatusCode, ApiFailure> {
    let message = MessageId::parse(&mid).ok_or_else(|| bad_request("malformed message id"))?;
    state
        .chat
        .delete_message(&ConversationId::from(id.as_str()), &user, &message)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pin_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path((id, mid)): Path<(String, String)>,
) -> Result<StatusCode, ApiFailure> {
    set_pin(&state, &user, &id, &mid, true).await
}

async fn unpin_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path((id, mid)): Path<(String, String)>,
) -> Result<StatusCode, ApiFailure> {
    set_pin(&state, &user, &id, &mid, false).await
}

async fn set_pin(
    state: &AppState,
    user: &UserId,
    id: &str,
    mid: &str,
    pinned: bool,
) -> Result<StatusCode, ApiFailure> {
    let message = MessageId::parse(mid).ok_or_else(|| bad_request("malformed message id"))?;
    state
        .chat
        .set_message_pinned(&ConversationId::from(id), user, &message, pinned)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParticipantsBody {
    user_ids: Vec<UserId>,
}

async fn add_participants(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    Json(body): Json<AddParticipantsBody>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let added = state
        .chat
        .add_participants(&ConversationId::from(id.as_str()), &user, &body.user_ids)
        .await?;
    Ok(Json(json!({ "added": added })))
}

async fn remove_participant(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path((id, uid)): Path<(String, String)>,
) -> Result<StatusCode, ApiFailure> {
    state
        .chat
        .remove_participant(
            &ConversationId::from(id.as_str()),
            &user,
            &UserId::from(uid.as_str()),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct UpdateRoleBody {
    role: MemberRole,
}

async fn update_role(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path((id, uid)): Path<(String, String)>,
    Json(body): Json<UpdateRoleBody>,
) -> Result<StatusCode, ApiFailure> {
    state
        .chat
        .update_role(
            &ConversationId::from(id.as_str()),
            &user,
            &UserId::from(uid.as_str()),
            body.role,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    state
        .chat
        .set_archived(&ConversationId::from(id.as_str()), &user, true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unarchive(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    state
        .chat
        .set_archived(&ConversationId::from(id.as_str()), &user, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let hits = state
        .chat
        .search_in_conversation(
            &ConversationId::from(id.as_str()),
            &user,
            &query.q,
            query.limit,
        )
        .await?;
    Ok(Json(json!({ "messages": hits })))
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let unread = state.chat.unread_count(&user).await?;
    Ok(Json(json!({ "unreadCount": unread })))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.session_count(),
    }))
}

async fn health_database(State(state): State<AppState>) -> Response {
    let Some(pools) = &state.pools else {
        return Json(json!({ "status": "ok", "database": "mock" })).into_response();
    };
    let primary_ok = sqlx::query("SELECT 1")
        .execute(pools.primary())
        .await
        .is_ok();
    let breaker = match pools.breaker().state() {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    };
    let mut body = json!({
        "status": if primary_ok { "ok" } else { "degraded" },
        "database": { "primary": primary_ok, "replicaBreaker": breaker },
    });
    if let Some(monitor) = &state.lag_monitor {
        let status = monitor.status();
        body["database"]["replicaLagSeconds"] = json!(status.lag_seconds);
        body["database"]["replicaHealthy"] = json!(status.healthy);
    }
    let code = if primary_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use relay_dal::ConversationStore;
    use relay_dal::MemoryDatastore;
    use relay_idempotency::AckCache;
    use relay_pipeline::ProducerConfig;
    use relay_stream::MemoryLog;
    use tower::ServiceExt;

    const SECRET: &str = "rest-secret";
    const ISSUER: &str = "https://issuer.example";
    const AUDIENCE: &str = "relay";

    fn test_state() -> (AppState, Arc<MemoryDatastore>) {
        let store = Arc::new(MemoryDatastore::new());
        store.add_user(relay_core::UserId::from("u-1"));
        store.add_user(relay_core::UserId::from("u-2"));
        let log = Arc::new(MemoryLog::new(16, Duration::from_secs(30)));
        let producer = Producer::new(
            store.clone(),
            log,
            AckCache::new(Duration::from_secs(60)),
            None,
            ProducerConfig::default(),
        );
        let verifier = Arc::new(
            TokenVerifier::from_config(&relay_config::AuthConfig {
                issuer: ISSUER.into(),
                audience: AUDIENCE.into(),
                jwks_url: None,
                static_keys: vec![SECRET.into()],
                leeway: Duration::from_secs(30),
            })
            .unwrap(),
        );
        let state = AppState {
            chat: Arc::new(ChatService::new(store.clone())),
            producer,
            store: store.clone(),
            verifier,
            registry: Arc::new(SessionRegistry::new()),
            prometheus: None,
            pools: None,
            lag_monitor: None,
        };
        (state, store)
    }

    fn token(sub: &str) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = json!({
            "sub": sub,
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now + 600,
        });
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let (state, _) = test_state();
        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_requires_a_token() {
        let (state, _) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/unread-count")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_tokens_are_rejected_with_a_code() {
        let (state, _) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/unread-count")
                    .header("authorization", "Bearer nonsense")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["code"], "malformed");
    }

    #[tokio::test]
    async fn conversations_can_be_created_and_listed() {
        let (state, _) = test_state();
        let app = router(state);
        let auth = format!("Bearer {}", token("u-1"));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/conversations")
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"kind": "direct", "participantIds": ["u-2"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/conversations?limit=10")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["items"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["items"][0]["participantCount"], 2);
    }

    #[tokio::test]
    async fn rest_send_returns_a_pending_ack() {
        let (state, store) = test_state();
        let app = router(state);
        let auth = format!("Bearer {}", token("u-1"));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/conversations")
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"kind": "direct", "participantIds": ["u-2"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let conversation = created["conversation"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/conversations/{conversation}/messages"))
                    .header("authorization", &auth)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"content": "hello", "messageType": "TEXT"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let ack: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ack["state"], "pending");
        assert_eq!(ack["idempotentHit"], false);
        assert!(ack["messageId"].as_str().is_some());
        drop(store);
    }

    #[tokio::test]
    async fn history_limit_101_is_rejected() {
        let (state, store) = test_state();
        let app = router(state);
        let auth = format!("Bearer {}", token("u-1"));
        store
            .create_conversation(
                relay_core::Conversation {
                    id: ConversationId::from("c-1"),
                    kind: ConversationKind::Direct,
                    title: None,
                    description: None,
                    is_active: true,
                    created_at: OffsetDateTime::now_utc(),
                    last_message_id: None,
                    last_message_at: None,
                },
                vec![relay_core::ConversationMember {
                    conversation_id: ConversationId::from("c-1"),
                    user_id: relay_core::UserId::from("u-1"),
                    role: MemberRole::Owner,
                    is_active: true,
                    joined_at: OffsetDateTime::now_utc(),
                }],
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/conversations/c-1/messages?limit=101")
                    .header("authorization", &auth)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
