use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::broadcast::Delivery;
use crate::client::gate::Visibility;
use crate::client::reconciler::{
    CachedView, Change, ClientReconciler, ClientTunables, PendingSend, Reconciled, Surface,
};
use crate::error::ChatError;
use crate::types::*;

/// The calls a widget or dashboard makes against the server.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, session_id: &str, body: &SendMessageBody) -> Result<OperationResult, ChatError>;

    async fn send_agent_message(
        &self,
        session_id: &str,
        body: &AgentMessageBody,
    ) -> Result<OperationResult, ChatError>;

    async fn request_human(&self, session_id: &str) -> Result<OperationResult, ChatError>;

    async fn respond_to_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
    ) -> Result<OperationResult, ChatError>;

    async fn fetch_history(&self, session_id: &str) -> Result<ChatHistory, ChatError>;

    async fn assignment_status(&self, session_id: &str) -> Result<AssignmentStatus, ChatError>;

    async fn assign_chat(&self, session_id: &str, body: &AssignBody) -> Result<OperationResult, ChatError>;

    async fn transfer_chat(&self, session_id: &str, body: &TransferBody) -> Result<OperationResult, ChatError>;

    async fn unassign_chat(&self, session_id: &str) -> Result<OperationResult, ChatError>;

    /// Visitors close, agents end; the transport knows which one it is.
    async fn close_chat(&self, session_id: &str, body: &CloseBody) -> Result<OperationResult, ChatError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn visitor(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn agent(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::visitor(base_url)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<R: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<R, ChatError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|err| ChatError::TransportFailure(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ChatError::TransportFailure(err.to_string()))?;
        if status.is_success() {
            return serde_json::from_str::<R>(&body)
                .map_err(|err| ChatError::TransportFailure(format!("invalid response body: {err}")));
        }
        let parsed = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        Err(ChatError::from_response(status.as_u16(), &parsed))
    }

    pub async fn fetch_tunables(&self) -> Result<ClientTunables, ChatError> {
        self.execute(self.client.get(self.url("/api/widget/bootstrap"))).await
    }

    pub async fn create_session(&self, body: &CreateSessionBody) -> Result<OperationResult, ChatError> {
        self.execute(self.client.post(self.url("/api/session")).json(body)).await
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send_message(&self, session_id: &str, body: &SendMessageBody) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/message"));
        self.execute(self.client.post(url).json(body)).await
    }

    async fn send_agent_message(
        &self,
        session_id: &str,
        body: &AgentMessageBody,
    ) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/agent-message"));
        self.execute(self.client.post(url).json(body)).await
    }

    async fn request_human(&self, session_id: &str) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/request-human"));
        self.execute(self.client.post(url)).await
    }

    async fn respond_to_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
    ) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/escalation/{prompt_id}/respond"));
        self.execute(self.client.post(url).json(&RespondBody { answer })).await
    }

    async fn fetch_history(&self, session_id: &str) -> Result<ChatHistory, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/messages"));
        self.execute(self.client.get(url)).await
    }

    async fn assignment_status(&self, session_id: &str) -> Result<AssignmentStatus, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/assignment"));
        self.execute(self.client.get(url)).await
    }

    async fn assign_chat(&self, session_id: &str, body: &AssignBody) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/assign"));
        self.execute(self.client.post(url).json(body)).await
    }

    async fn transfer_chat(&self, session_id: &str, body: &TransferBody) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/transfer"));
        self.execute(self.client.post(url).json(body)).await
    }

    async fn unassign_chat(&self, session_id: &str) -> Result<OperationResult, ChatError> {
        let url = self.url(&format!("/api/session/{session_id}/unassign"));
        self.execute(self.client.post(url)).await
    }

    async fn close_chat(&self, session_id: &str, body: &CloseBody) -> Result<OperationResult, ChatError> {
        let action = if self.token.is_some() { "end" } else { "close" };
        let url = self.url(&format!("/api/session/{session_id}/{action}"));
        self.execute(self.client.post(url).json(body)).await
    }
}

/// A send that never reached the server. The unconfirmed entry is already
/// gone from the view; `draft` goes back into the input box.
#[derive(Debug, thiserror::Error)]
#[error("message not sent: {error}")]
pub struct SendFailure {
    pub error: ChatError,
    pub draft: String,
}

/// Runs the network half of an optimistic send. Needs no access to the
/// session, so deliveries can keep flowing into the reconciler while it is in
/// flight.
pub async fn submit_send<T: ChatTransport + ?Sized>(
    transport: &T,
    pending: &PendingSend,
) -> Result<OperationResult, ChatError> {
    match pending.sender_role {
        SenderRole::Agent => {
            let body = AgentMessageBody {
                text: pending.text.clone(),
                attachment: None,
            };
            transport.send_agent_message(&pending.session_id, &body).await
        }
        role => {
            let body = SendMessageBody {
                sender: Some(role),
                text: pending.text.clone(),
                escalation_hint: None,
                attachment: None,
            };
            transport.send_message(&pending.session_id, &body).await
        }
    }
}

/// Drives a [`ClientReconciler`] from a transport: optimistic sends, prompt
/// answers, assignment actions and reconnect resync. Ownership conflicts and
/// stale prompts refresh the view before the error is handed back.
pub struct ClientSession<T> {
    transport: Arc<T>,
    reconciler: ClientReconciler,
}

impl<T: ChatTransport> ClientSession<T> {
    pub fn new(transport: T, reconciler: ClientReconciler) -> Self {
        Self {
            transport: Arc::new(transport),
            reconciler,
        }
    }

    pub fn reconciler(&self) -> &ClientReconciler {
        &self.reconciler
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Shared handle for calls made while the session keeps applying deliveries.
    pub fn transport_handle(&self) -> Arc<T> {
        self.transport.clone()
    }

    fn sender_role(&self) -> SenderRole {
        match self.reconciler.surface() {
            Surface::Visitor { .. } => SenderRole::Visitor,
            Surface::Agent { .. } | Surface::Admin => SenderRole::Agent,
        }
    }

    /// Shows the draft at once. Pair with [`submit_send`] and
    /// [`complete_send`](Self::complete_send).
    pub fn begin_send(&mut self, session_id: &str, draft: &str, now: DateTime<Utc>) -> PendingSend {
        let role = self.sender_role();
        self.reconciler.begin_send(session_id, role, draft, now)
    }

    pub async fn complete_send(
        &mut self,
        pending: PendingSend,
        result: Result<OperationResult, ChatError>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, SendFailure> {
        match result {
            Ok(result) => Ok(self.reconciler.confirm_send(&pending.local_id, &result, now)),
            Err(error) => {
                tracing::warn!(session_id = %pending.session_id, error = %error, "send failed, restoring draft");
                let draft = match self.reconciler.fail_send(&pending.local_id) {
                    Some(Change::RolledBack { draft, .. }) => draft,
                    _ => pending.draft,
                };
                self.refresh_after(&pending.session_id, &error, now).await;
                Err(SendFailure { error, draft })
            }
        }
    }

    pub async fn send(&mut self, session_id: &str, draft: &str, now: DateTime<Utc>) -> Result<Vec<Change>, SendFailure> {
        let pending = self.begin_send(session_id, draft, now);
        let result = submit_send(&*self.transport, &pending).await;
        self.complete_send(pending, result, Utc::now().max(now)).await
    }

    /// Replaces the view with the server's history.
    pub async fn refresh(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<Change>, ChatError> {
        let history = self.transport.fetch_history(session_id).await?;
        Ok(self.reconciler.complete_resync(&history, now))
    }

    /// Skips the round trip when the view already shows the assignment a
    /// conflict was decided against.
    async fn refresh_after(&mut self, session_id: &str, error: &ChatError, now: DateTime<Utc>) {
        if !error.requires_refresh() {
            return;
        }
        let known = self
            .reconciler
            .view(session_id)
            .and_then(|view| view.chat.as_ref())
            .map(|chat| chat.session.revision);
        if let (Some(current), Some(known)) = (error.current_assignment(), known) {
            if known >= current.revision {
                return;
            }
        }
        if let Err(err) = self.refresh(session_id, now).await {
            tracing::warn!(session_id, error = %err, "refresh after conflict failed");
        }
    }

    async fn apply(
        &mut self,
        session_id: &str,
        result: Result<OperationResult, ChatError>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChatError> {
        match result {
            Ok(result) => Ok(self.reconciler.apply_operation_result(&result, now)),
            Err(err) => {
                self.refresh_after(session_id, &err, now).await;
                Err(err)
            }
        }
    }

    pub async fn request_human(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<Change>, ChatError> {
        let result = self.transport.request_human(session_id).await;
        self.apply(session_id, result, now).await
    }

    pub async fn respond(
        &mut self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChatError> {
        let result = self.transport.respond_to_prompt(session_id, prompt_id, answer).await;
        self.apply(session_id, result, now).await
    }

    /// Takes the chat for the signed-in agent.
    pub async fn claim(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<Change>, ChatError> {
        let result = self
            .transport
            .assign_chat(session_id, &AssignBody { agent_id: None })
            .await;
        self.apply(session_id, result, now).await
    }

    pub async fn assign_to(
        &mut self,
        session_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChatError> {
        let body = AssignBody {
            agent_id: Some(agent_id.to_string()),
        };
        let result = self.transport.assign_chat(session_id, &body).await;
        self.apply(session_id, result, now).await
    }

    pub async fn transfer(
        &mut self,
        session_id: &str,
        to_agent_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChatError> {
        let body = TransferBody {
            to_agent_id: to_agent_id.to_string(),
            from_agent_id: None,
            reason: reason.to_string(),
        };
        let result = self.transport.transfer_chat(session_id, &body).await;
        self.apply(session_id, result, now).await
    }

    pub async fn unassign(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<Vec<Change>, ChatError> {
        let result = self.transport.unassign_chat(session_id).await;
        self.apply(session_id, result, now).await
    }

    pub async fn close(
        &mut self,
        session_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChatError> {
        let result = self.transport.close_chat(session_id, &CloseBody { reason }).await;
        self.apply(session_id, result, now).await
    }

    /// Current owner as the server sees it, for claim buttons and headers.
    pub async fn assignment(&self, session_id: &str) -> Result<AssignmentStatus, ChatError> {
        self.transport.assignment_status(session_id).await
    }

    /// Shows the cached view at once, then merges authoritative history.
    pub async fn reconnect(
        &mut self,
        session_id: &str,
        cached: Option<CachedView>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, ChatError> {
        let mut changes = Vec::new();
        if let Some(cached) = cached {
            changes.push(self.reconciler.restore_cached(cached));
        }
        self.reconciler.begin_resync(session_id);
        let history = self.transport.fetch_history(session_id).await?;
        changes.extend(self.reconciler.complete_resync(&history, now));
        Ok(changes)
    }

    /// Duplicates are swallowed here.
    pub fn on_delivery(&mut self, delivery: &Delivery, visibility: Visibility, now: DateTime<Utc>) -> Option<Reconciled> {
        match self.reconciler.apply_delivery(delivery, visibility, now) {
            Ok(reconciled) => Some(reconciled),
            Err(ChatError::DuplicateEvent) => None,
            Err(err) => {
                tracing::debug!(error = %err, "delivery rejected");
                None
            }
        }
    }
}
