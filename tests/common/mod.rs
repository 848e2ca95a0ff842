#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chat_handover::{
    broadcast::{Delivery, EventBroadcaster, Subscription},
    client::ChatTransport,
    config::Config,
    error::ChatError,
    events::Topic,
    service::{ChatService, Draft},
    store::ChatStateStore,
    types::*,
};
use chrono::Utc;

pub fn agent(id: &str) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        name: format!("Agent {}", id.to_uppercase()),
        role: AgentRole::Agent,
    }
}

pub fn admin(id: &str) -> AgentProfile {
    AgentProfile {
        role: AgentRole::Admin,
        ..agent(id)
    }
}

pub fn service() -> Arc<ChatService> {
    service_with(Config::default())
}

pub fn service_with(config: Config) -> Arc<ChatService> {
    Arc::new(ChatService::new(
        Arc::new(ChatStateStore::in_memory()),
        Arc::new(EventBroadcaster::new()),
        &config,
    ))
}

pub async fn subscribe(broadcaster: &EventBroadcaster, topics: &[Topic]) -> Subscription {
    let subscription = broadcaster.register().await;
    for topic in topics {
        broadcaster.subscribe(subscription.id, topic.clone()).await;
    }
    subscription
}

/// Everything queued so far. Publishing is awaited inside each call, so
/// deliveries for a finished call are already in the channel.
pub fn drain(subscription: &mut Subscription) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    while let Ok(delivery) = subscription.receiver.try_recv() {
        deliveries.push(delivery);
    }
    deliveries
}

/// Calls the service directly, standing in for the HTTP hop.
pub struct InProcess {
    pub service: Arc<ChatService>,
    pub agent: Option<AgentProfile>,
}

#[async_trait]
impl ChatTransport for InProcess {
    async fn send_message(&self, session_id: &str, body: &SendMessageBody) -> Result<OperationResult, ChatError> {
        self.service
            .send_message(session_id, Draft::from(body.clone()), Utc::now())
            .await
    }

    async fn send_agent_message(
        &self,
        session_id: &str,
        body: &AgentMessageBody,
    ) -> Result<OperationResult, ChatError> {
        let agent = self.agent.as_ref().ok_or(ChatError::Unauthorized("no agent"))?;
        self.service
            .send_agent_message(session_id, agent, body.clone(), Utc::now())
            .await
    }

    async fn request_human(&self, session_id: &str) -> Result<OperationResult, ChatError> {
        self.service.request_human(session_id, Utc::now()).await
    }

    async fn respond_to_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
    ) -> Result<OperationResult, ChatError> {
        self.service
            .respond_to_prompt(session_id, prompt_id, answer, Utc::now())
            .await
    }

    async fn fetch_history(&self, session_id: &str) -> Result<ChatHistory, ChatError> {
        self.service.get_chat_history(session_id).await
    }

    async fn assignment_status(&self, session_id: &str) -> Result<AssignmentStatus, ChatError> {
        self.service.get_assignment_status(session_id).await
    }

    async fn assign_chat(&self, session_id: &str, body: &AssignBody) -> Result<OperationResult, ChatError> {
        let actor = self.signed_in()?;
        let target = body.agent_id.as_deref().map_or_else(|| actor.clone(), agent);
        self.service.assign(session_id, &target, actor, Utc::now()).await
    }

    async fn transfer_chat(&self, session_id: &str, body: &TransferBody) -> Result<OperationResult, ChatError> {
        let actor = self.signed_in()?;
        self.service
            .transfer(
                session_id,
                body.from_agent_id.as_deref(),
                &agent(&body.to_agent_id),
                actor,
                &body.reason,
                Utc::now(),
            )
            .await
    }

    async fn unassign_chat(&self, session_id: &str) -> Result<OperationResult, ChatError> {
        let actor = self.signed_in()?;
        self.service.unassign(session_id, actor, Utc::now()).await
    }

    async fn close_chat(&self, session_id: &str, body: &CloseBody) -> Result<OperationResult, ChatError> {
        let by = if self.agent.is_some() { ClosedBy::Agent } else { ClosedBy::Visitor };
        self.service
            .close(session_id, by, self.agent.as_ref(), body.reason.clone(), Utc::now())
            .await
    }
}

impl InProcess {
    fn signed_in(&self) -> Result<&AgentProfile, ChatError> {
        self.agent.as_ref().ok_or(ChatError::Unauthorized("no agent"))
    }
}
