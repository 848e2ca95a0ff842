use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::AgentDirectory;
use crate::broadcast::EventBroadcaster;
use crate::client::ClientTunables;
use crate::config::Config;
use crate::error::ChatError;
use crate::events::Topic;
use crate::persist::Persistence;
use crate::service::{ChatService, Draft};
use crate::store::ChatStateStore;
use crate::types::*;

pub struct AppState {
    pub service: ChatService,
    pub agents: AgentDirectory,
    pub config: Config,
}

impl AppState {
    /// Wires an in-memory state, optionally hydrated from Postgres.
    pub async fn build(config: Config, agents: AgentDirectory) -> Result<Self, ChatError> {
        let persistence = match &config.database_url {
            Some(url) => Persistence::connect(url).await?,
            None => {
                tracing::warn!("no database configured, chats are kept in memory only");
                Persistence::disabled()
            }
        };

        let store = Arc::new(
            ChatStateStore::new(persistence.clone()).with_closed_retention(config.closed_retention),
        );
        if persistence.is_enabled() {
            let (records, next_id) = persistence.load_active().await?;
            let restored = records.len();
            for record in records {
                store.insert(record).await;
            }
            store.reserve_ids_from(next_id);
            tracing::info!(chats = restored, "active chats restored");
        }

        let broadcaster = Arc::new(EventBroadcaster::new());
        let service = ChatService::new(store, broadcaster, &config);
        Ok(Self {
            service,
            agents,
            config,
        })
    }
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

fn error_payload(err: &ChatError) -> Option<String> {
    event_payload("error", err.body())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/widget/bootstrap", get(widget_bootstrap))
        .route("/api/session", post(post_session))
        .route("/api/sessions", get(get_sessions))
        .route("/api/session/{session_id}/messages", get(get_messages))
        .route("/api/session/{session_id}/assignment", get(get_assignment))
        .route(
            "/api/session/{session_id}/assignment/history",
            get(get_assignment_history),
        )
        .route("/api/session/{session_id}/message", post(post_message))
        .route("/api/session/{session_id}/agent-message", post(post_agent_message))
        .route("/api/session/{session_id}/request-human", post(post_request_human))
        .route("/api/session/{session_id}/escalation", post(post_escalation))
        .route(
            "/api/session/{session_id}/escalation/{prompt_id}/respond",
            post(post_escalation_response),
        )
        .route("/api/session/{session_id}/assign", post(post_assign))
        .route("/api/session/{session_id}/transfer", post(post_transfer))
        .route("/api/session/{session_id}/unassign", post(post_unassign))
        .route("/api/session/{session_id}/close", post(post_close))
        .route("/api/session/{session_id}/end", post(post_end))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn widget_bootstrap(State(state): State<Arc<AppState>>) -> Json<ClientTunables> {
    Json(ClientTunables::from(&state.config.client))
}

async fn post_session(State(state): State<Arc<AppState>>, body: Bytes) -> Json<OperationResult> {
    let body = serde_json::from_slice::<CreateSessionBody>(&body).unwrap_or_default();
    let result = state
        .service
        .create_session(body.visitor_id, body.channel.unwrap_or_default())
        .await;
    Json(result)
}

async fn get_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionSummary>>, ChatError> {
    state.agents.from_headers(&headers).await?;
    Ok(Json(state.service.active_chats().await))
}

async fn get_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ChatHistory>, ChatError> {
    Ok(Json(state.service.get_chat_history(&session_id).await?))
}

async fn get_assignment(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<AssignmentStatus>, ChatError> {
    Ok(Json(state.service.get_assignment_status(&session_id).await?))
}

async fn get_assignment_history(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AssignmentEvent>>, ChatError> {
    state.agents.from_headers(&headers).await?;
    Ok(Json(state.service.assignment_log(&session_id).await?))
}

async fn post_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<OperationResult>, ChatError> {
    let result = state
        .service
        .send_message(&session_id, Draft::from(body), Utc::now())
        .await?;
    Ok(Json(result))
}

async fn post_agent_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AgentMessageBody>,
) -> Result<Json<OperationResult>, ChatError> {
    let agent = state.agents.from_headers(&headers).await?;
    let result = state
        .service
        .send_agent_message(&session_id, &agent, body, Utc::now())
        .await?;
    Ok(Json(result))
}

async fn post_request_human(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<OperationResult>, ChatError> {
    Ok(Json(state.service.request_human(&session_id, Utc::now()).await?))
}

async fn post_escalation(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<OperationResult>, ChatError> {
    let agent = state.agents.from_headers(&headers).await?;
    Ok(Json(state.service.send_prompt(&session_id, &agent, Utc::now()).await?))
}

async fn post_escalation_response(
    Path((session_id, prompt_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<RespondBody>,
) -> Result<Json<OperationResult>, ChatError> {
    let result = state
        .service
        .respond_to_prompt(&session_id, &prompt_id, body.answer, Utc::now())
        .await?;
    Ok(Json(result))
}

async fn post_assign(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OperationResult>, ChatError> {
    let actor = state.agents.from_headers(&headers).await?;
    let body = serde_json::from_slice::<AssignBody>(&body).unwrap_or_default();
    let agent = match body.agent_id.as_deref() {
        Some(agent_id) if agent_id != actor.id => state
            .agents
            .agent(agent_id)
            .await
            .ok_or_else(|| ChatError::AgentNotFound(agent_id.to_string()))?,
        _ => actor.clone(),
    };
    Ok(Json(state.service.assign(&session_id, &agent, &actor, Utc::now()).await?))
}

async fn post_transfer(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> Result<Json<OperationResult>, ChatError> {
    let actor = state.agents.from_headers(&headers).await?;
    let to = state
        .agents
        .agent(&body.to_agent_id)
        .await
        .ok_or_else(|| ChatError::AgentNotFound(body.to_agent_id.clone()))?;
    let result = state
        .service
        .transfer(
            &session_id,
            body.from_agent_id.as_deref(),
            &to,
            &actor,
            &body.reason,
            Utc::now(),
        )
        .await?;
    Ok(Json(result))
}

async fn post_unassign(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<OperationResult>, ChatError> {
    let actor = state.agents.from_headers(&headers).await?;
    Ok(Json(state.service.unassign(&session_id, &actor, Utc::now()).await?))
}

async fn post_close(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<OperationResult>, ChatError> {
    let body = serde_json::from_slice::<CloseBody>(&body).unwrap_or_default();
    let result = state
        .service
        .close(&session_id, ClosedBy::Visitor, None, body.reason, Utc::now())
        .await?;
    Ok(Json(result))
}

async fn post_end(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OperationResult>, ChatError> {
    let actor = state.agents.from_headers(&headers).await?;
    let body = serde_json::from_slice::<CloseBody>(&body).unwrap_or_default();
    let result = state
        .service
        .close(&session_id, ClosedBy::Agent, Some(&actor), body.reason, Utc::now())
        .await?;
    Ok(Json(result))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Default)]
struct Connection {
    agent: Option<AgentProfile>,
    watched: Option<String>,
}

impl Connection {
    /// Visitors may only follow chats; the global list and agent topics need
    /// an authenticated agent, and an agent topic must be one's own.
    fn may_subscribe(&self, topic: &Topic) -> bool {
        match (topic, &self.agent) {
            (Topic::Chat(_), _) => true,
            (Topic::ActiveChats, Some(_)) => true,
            (Topic::Agent(agent_id), Some(agent)) => agent.id == *agent_id || agent.is_admin(),
            _ => false,
        }
    }
}

fn topic_list(data: &Value) -> Vec<Topic> {
    data.get("topics")
        .and_then(Value::as_array)
        .map(|topics| {
            topics
                .iter()
                .filter_map(Value::as_str)
                .filter_map(Topic::parse)
                .collect()
        })
        .unwrap_or_default()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let broadcaster = state.service.broadcaster().clone();
    let mut subscription = broadcaster.register().await;
    let client_id = subscription.id;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                Some(delivery) = subscription.receiver.recv() => event_payload("broadcast", &delivery),
                Some(reply) = reply_rx.recv() => Some(reply),
                else => break,
            };
            let Some(payload) = payload else {
                continue;
            };
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::default();
    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        if let Err(err) = handle_frame(&state, client_id, &mut connection, &reply_tx, envelope).await {
            tracing::debug!(client_id, error = %err, "websocket frame rejected");
            if let Some(payload) = error_payload(&err) {
                let _ = reply_tx.send(payload);
            }
        }
    }

    broadcaster.remove(client_id).await;
    send_task.abort();
    tracing::debug!(client_id, "websocket closed");
}

async fn send_history(
    state: &Arc<AppState>,
    reply_tx: &mpsc::UnboundedSender<String>,
    session_id: &str,
) -> Result<(), ChatError> {
    let history = state.service.get_chat_history(session_id).await?;
    if let Some(payload) = event_payload("session:history", history) {
        let _ = reply_tx.send(payload);
    }
    Ok(())
}

async fn handle_frame(
    state: &Arc<AppState>,
    client_id: usize,
    connection: &mut Connection,
    reply_tx: &mpsc::UnboundedSender<String>,
    envelope: EventEnvelopeIn,
) -> Result<(), ChatError> {
    let broadcaster = state.service.broadcaster();
    let session_id = envelope.data.get("sessionId").and_then(Value::as_str);

    match envelope.event.as_str() {
        "widget:join" => {
            let session_id = session_id.ok_or_else(|| ChatError::SessionNotFound(String::new()))?;
            // Subscribe first so nothing committed after the history read is missed.
            broadcaster.subscribe(client_id, Topic::chat(session_id)).await;
            send_history(state, reply_tx, session_id).await?;
        }
        "agent:join" => {
            let token = envelope
                .data
                .get("token")
                .and_then(Value::as_str)
                .ok_or(ChatError::Unauthorized("missing token"))?;
            let agent = state
                .agents
                .authenticate(token)
                .await
                .ok_or(ChatError::Unauthorized("invalid token"))?;
            broadcaster.subscribe(client_id, Topic::ActiveChats).await;
            broadcaster.subscribe(client_id, Topic::agent(agent.id.as_str())).await;
            tracing::info!(client_id, agent_id = %agent.id, "agent connected");
            if let Some(payload) = event_payload("sessions", state.service.active_chats().await) {
                let _ = reply_tx.send(payload);
            }
            connection.agent = Some(agent);
        }
        "agent:watch-session" => {
            if connection.agent.is_none() {
                return Err(ChatError::Unauthorized("agent:join first"));
            }
            let session_id = session_id.ok_or_else(|| ChatError::SessionNotFound(String::new()))?;
            if let Some(previous) = connection.watched.replace(session_id.to_string()) {
                if previous != session_id {
                    broadcaster.unsubscribe(client_id, &Topic::chat(previous)).await;
                }
            }
            broadcaster.subscribe(client_id, Topic::chat(session_id)).await;
            send_history(state, reply_tx, session_id).await?;
        }
        "subscribe" => {
            for topic in topic_list(&envelope.data) {
                if !connection.may_subscribe(&topic) {
                    return Err(ChatError::Forbidden("topic not allowed"));
                }
                broadcaster.subscribe(client_id, topic).await;
            }
        }
        "unsubscribe" => {
            for topic in topic_list(&envelope.data) {
                broadcaster.unsubscribe(client_id, &topic).await;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Retires escalation prompts nobody answered in time and evicts old closed chats.
pub fn spawn_prompt_sweeper(state: Arc<AppState>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = state.service.sweep_expired_prompts(Utc::now()).await;
            if expired > 0 {
                tracing::info!(expired, "stale escalation prompts retired");
            }
            state.service.store().evict_closed().await;
        }
    })
}

pub async fn run() -> Result<(), ChatError> {
    let _ = dotenvy::dotenv();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_handover=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::from_env();
    let agents = match &config.agents_file {
        Some(path) => AgentDirectory::load(path).await?,
        None => {
            tracing::warn!("AGENTS_FILE not set, every agent token will be rejected");
            AgentDirectory::new()
        }
    };
    let sweep_interval = config.sweep_interval;
    let port = config.port;
    let state = Arc::new(AppState::build(config, agents).await?);
    spawn_prompt_sweeper(state.clone(), sweep_interval);

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "chat-handover listening");
    axum::serve(listener, app).await?;
    Ok(())
}
