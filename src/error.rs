use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::{AssignmentStatus, ChatStatus};

#[derive(Debug, Error)]
pub enum ChatError {
    /// Lost the race on `assign`; carries the winner so the UI can refresh.
    #[error("chat already taken by another agent")]
    AlreadyAssigned { current: AssignmentStatus },

    #[error("agent does not own this chat")]
    NotOwner { current: AssignmentStatus },

    #[error("no outstanding escalation prompt")]
    NoOutstandingPrompt,

    /// A prompt is already `sent`. Callers suppress this silently.
    #[error("an escalation prompt is already outstanding")]
    PromptOutstanding,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Never surfaced to users.
    #[error("duplicate event")]
    DuplicateEvent,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("cannot {transition} a chat in status {from}")]
    InvalidTransition {
        from: ChatStatus,
        transition: &'static str,
    },

    #[error("session is closed")]
    SessionClosed,

    #[error("text is required")]
    EmptyMessage,

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote error {status}: {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::AlreadyAssigned { .. } => "already_assigned",
            ChatError::NotOwner { .. } => "not_owner",
            ChatError::NoOutstandingPrompt => "no_outstanding_prompt",
            ChatError::PromptOutstanding => "prompt_outstanding",
            ChatError::TransportFailure(_) => "transport_failure",
            ChatError::DuplicateEvent => "duplicate_event",
            ChatError::SessionNotFound(_) => "session_not_found",
            ChatError::AgentNotFound(_) => "agent_not_found",
            ChatError::InvalidTransition { .. } => "invalid_transition",
            ChatError::SessionClosed => "session_closed",
            ChatError::EmptyMessage => "empty_message",
            ChatError::Unauthorized(_) => "unauthorized",
            ChatError::Forbidden(_) => "forbidden",
            ChatError::Config(_) => "config",
            ChatError::Remote { .. } => "remote",
            ChatError::Storage(_) | ChatError::Migrate(_) | ChatError::Io(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::AlreadyAssigned { .. }
            | ChatError::NotOwner { .. }
            | ChatError::NoOutstandingPrompt
            | ChatError::PromptOutstanding
            | ChatError::InvalidTransition { .. }
            | ChatError::SessionClosed
            | ChatError::DuplicateEvent => StatusCode::CONFLICT,
            ChatError::SessionNotFound(_) | ChatError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
            ChatError::Remote { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ChatError::Config(_)
            | ChatError::Storage(_)
            | ChatError::Migrate(_)
            | ChatError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Ownership conflicts and stale prompts are answered with a refresh, not a retry.
    pub fn requires_refresh(&self) -> bool {
        matches!(
            self,
            ChatError::AlreadyAssigned { .. }
                | ChatError::NotOwner { .. }
                | ChatError::NoOutstandingPrompt
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::TransportFailure(_))
    }

    /// The assignment a conflict was decided against.
    pub fn current_assignment(&self) -> Option<&AssignmentStatus> {
        match self {
            ChatError::AlreadyAssigned { current } | ChatError::NotOwner { current } => Some(current),
            _ => None,
        }
    }

    pub fn body(&self) -> Value {
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        if let Some(current) = self.current_assignment() {
            body["current"] = serde_json::to_value(current).unwrap_or(Value::Null);
        }
        body
    }

    /// Rebuilds an error from a `{ error, code, current? }` response body.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let code = body.get("code").and_then(Value::as_str).unwrap_or("");
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        let current = body
            .get("current")
            .cloned()
            .and_then(|value| serde_json::from_value::<AssignmentStatus>(value).ok());

        match (code, current) {
            ("already_assigned", Some(current)) => ChatError::AlreadyAssigned { current },
            ("not_owner", Some(current)) => ChatError::NotOwner { current },
            ("no_outstanding_prompt", _) => ChatError::NoOutstandingPrompt,
            ("session_closed", _) => ChatError::SessionClosed,
            ("empty_message", _) => ChatError::EmptyMessage,
            _ => ChatError::Remote {
                status,
                code: code.to_string(),
                message,
            },
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        match &self {
            ChatError::Storage(_) | ChatError::Migrate(_) | ChatError::Io(_) => {
                tracing::error!(error = %self, "internal error");
            }
            _ => tracing::debug!(error = %self, code = self.code(), "request rejected"),
        }
        (self.status_code(), Json(self.body())).into_response()
    }
}
