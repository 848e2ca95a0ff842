use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::assignment::{AssignmentCoordinator, AssignmentOutcome};
use crate::broadcast::EventBroadcaster;
use crate::config::{ClosedSessionPolicy, Config};
use crate::error::ChatError;
use crate::escalation::{
    trigger_record, EscalationClassifier, EscalationOutcome, EscalationProtocol, KeywordClassifier,
};
use crate::events::{
    AssignmentPayload, ChatEvent, EventEnvelope, MessagePayload, PromptPayload, StatusPayload,
};
use crate::lifecycle::{self, Transition};
use crate::notices::{self, Notice};
use crate::notifier::{self, AgentNotification, AgentNotifier, NotificationKind};
use crate::store::{ChatRecord, ChatStateStore};
use crate::types::*;

/// Content of one send-message call.
#[derive(Debug, Clone)]
pub struct Draft {
    pub role: SenderRole,
    pub text: String,
    pub attachment: Option<AttachmentDescriptor>,
    /// Reason code attached by the bot to its own reply.
    pub escalation_hint: Option<EscalationReason>,
}

impl Draft {
    pub fn visitor(text: impl Into<String>) -> Self {
        Self {
            role: SenderRole::Visitor,
            text: text.into(),
            attachment: None,
            escalation_hint: None,
        }
    }

    pub fn bot(text: impl Into<String>, hint: Option<EscalationReason>) -> Self {
        Self {
            role: SenderRole::Bot,
            text: text.into(),
            attachment: None,
            escalation_hint: hint,
        }
    }

    fn validate(&self) -> Result<(), ChatError> {
        if self.text.trim().is_empty() && self.attachment.is_none() {
            return Err(ChatError::EmptyMessage);
        }
        Ok(())
    }

    fn kind_and_metadata(&self) -> (MessageKind, MessageMetadata) {
        match &self.attachment {
            Some(attachment) => (
                MessageKind::Attachment,
                MessageMetadata {
                    attachment: Some(attachment.clone()),
                    ..MessageMetadata::default()
                },
            ),
            None => (MessageKind::Plain, MessageMetadata::default()),
        }
    }
}

impl From<SendMessageBody> for Draft {
    fn from(body: SendMessageBody) -> Self {
        Self {
            role: body.sender.unwrap_or(SenderRole::Visitor),
            text: body.text,
            attachment: body.attachment,
            escalation_hint: body.escalation_hint,
        }
    }
}

struct Posted {
    chat: ChatSnapshot,
    previous_status: ChatStatus,
    messages: Vec<Message>,
    prompt: Option<EscalationPrompt>,
}

/// Events announcing `messages`. A prompt message travels as
/// `escalation.prompt.sent` so consumers get the prompt alongside it.
fn message_events(
    chat: &ChatSnapshot,
    messages: &[Message],
    prompt: Option<&EscalationPrompt>,
) -> Vec<EventEnvelope> {
    messages
        .iter()
        .map(|message| {
            let is_prompt = message.kind == MessageKind::EscalationPrompt
                && prompt.is_some_and(|p| message.metadata.prompt_id.as_deref() == Some(p.id.as_str()));
            match (is_prompt, prompt) {
                (true, Some(prompt)) => EventEnvelope::new(ChatEvent::PromptSent(PromptPayload {
                    chat: chat.clone(),
                    prompt: prompt.clone(),
                    message: message.clone(),
                })),
                _ => EventEnvelope::new(ChatEvent::MessageReceived(MessagePayload {
                    message: message.clone(),
                    chat: chat.clone(),
                })),
            }
        })
        .collect()
}

fn status_event(chat: &ChatSnapshot, previous_status: ChatStatus) -> EventEnvelope {
    EventEnvelope::new(ChatEvent::StatusChanged(StatusPayload {
        chat: chat.clone(),
        previous_status,
        previous_agent: None,
    }))
}

/// The synchronous operations. Each validates and mutates under the chat's
/// lock, then publishes full-state events and returns the post-mutation
/// fields the caller reconciles against.
pub struct ChatService {
    store: Arc<ChatStateStore>,
    assignments: AssignmentCoordinator,
    escalation: EscalationProtocol,
    broadcaster: Arc<EventBroadcaster>,
    classifier: Arc<dyn EscalationClassifier>,
    notifier: Arc<dyn AgentNotifier>,
    policy: ClosedSessionPolicy,
}

impl ChatService {
    pub fn new(store: Arc<ChatStateStore>, broadcaster: Arc<EventBroadcaster>, config: &Config) -> Self {
        Self {
            assignments: AssignmentCoordinator::new(store.clone()),
            escalation: EscalationProtocol::new(store.clone(), config.prompt_timeout),
            store,
            broadcaster,
            classifier: Arc::new(KeywordClassifier::new()),
            notifier: notifier::notifier_from_config(config.notify_webhook.as_ref()),
            policy: config.closed_session_policy,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn EscalationClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AgentNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<ChatStateStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub async fn create_session(
        &self,
        visitor_id: Option<String>,
        channel: Channel,
    ) -> OperationResult {
        let chat = self.store.create_session(visitor_id, channel).await;
        self.broadcaster
            .publish(status_event(&chat, ChatStatus::Bot))
            .await;
        OperationResult::new(chat, Vec::new())
    }

    /// Visitor or bot message. Returns the effective session id, which differs
    /// from `session_id` when a closed chat made way for a new one.
    pub async fn send_message(
        &self,
        session_id: &str,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        draft.validate()?;
        if !matches!(draft.role, SenderRole::Visitor | SenderRole::Bot) {
            return Err(ChatError::Forbidden("only visitor or bot may post here"));
        }

        let posted = match self.post(session_id, &draft, now).await {
            Err(ChatError::SessionClosed)
                if draft.role == SenderRole::Visitor
                    && self.policy == ClosedSessionPolicy::NewSession =>
            {
                let closed = self.store.snapshot(session_id).await?;
                let fresh = self
                    .create_session(Some(closed.session.visitor_id), closed.session.channel)
                    .await;
                tracing::info!(
                    closed_session = %session_id,
                    session_id = %fresh.session_id,
                    "visitor returned to a closed chat; new session issued"
                );
                self.post(&fresh.session_id, &draft, now).await?
            }
            other => other?,
        };

        let mut envelopes = Vec::new();
        if posted.previous_status != posted.chat.session.status {
            envelopes.push(status_event(&posted.chat, posted.previous_status));
        }
        envelopes.extend(message_events(&posted.chat, &posted.messages, posted.prompt.as_ref()));
        self.broadcaster.publish_all(envelopes).await;

        Ok(OperationResult::new(posted.chat, posted.messages))
    }

    async fn post(&self, session_id: &str, draft: &Draft, now: DateTime<Utc>) -> Result<Posted, ChatError> {
        self.store
            .with_chat(session_id, |record| self.post_record(record, draft, now))
            .await
    }

    fn post_record(&self, record: &mut ChatRecord, draft: &Draft, now: DateTime<Utc>) -> Result<Posted, ChatError> {
        let previous_status = record.session.status;
        let mut messages = Vec::new();

        if previous_status == ChatStatus::Closed {
            if draft.role != SenderRole::Visitor || self.policy != ClosedSessionPolicy::Reactivate {
                return Err(ChatError::SessionClosed);
            }
            lifecycle::apply(&mut record.session, Transition::Reactivate)?;
            messages.push(record.push_notice(notices::render(&Notice::Resumed), now));
            tracing::info!(session_id = %record.session.session_id, "closed session reactivated");
        }

        let reason = match draft.role {
            SenderRole::Visitor if record.session.status == ChatStatus::Bot => {
                self.classifier.classify(&draft.text, &record.messages)
            }
            SenderRole::Bot => draft.escalation_hint,
            _ => None,
        };

        let (kind, metadata) = draft.kind_and_metadata();
        messages.push(record.push_message(draft.role, draft.text.trim(), kind, metadata, now));

        let mut prompt = None;
        if let Some(reason) = reason {
            match trigger_record(
                record,
                PromptTrigger::Automatic,
                reason,
                None,
                self.escalation.timeout(),
                now,
            ) {
                Ok(outcome) => {
                    messages.extend(outcome.messages);
                    prompt = outcome.prompt;
                }
                Err(ChatError::PromptOutstanding) => tracing::debug!(
                    session_id = %record.session.session_id,
                    reason = reason.as_str(),
                    "escalation trigger suppressed"
                ),
                Err(err) => tracing::debug!(
                    session_id = %record.session.session_id,
                    error = %err,
                    "escalation trigger skipped"
                ),
            }
        }

        Ok(Posted {
            chat: record.snapshot(),
            previous_status,
            messages,
            prompt,
        })
    }

    /// Message from the owning agent (or an admin).
    pub async fn send_agent_message(
        &self,
        session_id: &str,
        agent: &AgentProfile,
        body: AgentMessageBody,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        let draft = Draft {
            role: SenderRole::Agent,
            text: body.text,
            attachment: body.attachment,
            escalation_hint: None,
        };
        draft.validate()?;

        let (chat, message) = self
            .store
            .with_chat(session_id, |record| {
                if record.session.status == ChatStatus::Closed {
                    return Err(ChatError::SessionClosed);
                }
                if record.session.assigned_agent.as_deref() != Some(agent.id.as_str()) && !agent.is_admin() {
                    return Err(ChatError::NotOwner {
                        current: AssignmentStatus::from(&record.session),
                    });
                }
                let (kind, mut metadata) = draft.kind_and_metadata();
                metadata.agent_id = Some(agent.id.clone());
                metadata.agent_name = Some(agent.name.clone());
                let message = record.push_message(SenderRole::Agent, draft.text.trim(), kind, metadata, now);
                Ok((record.snapshot(), message))
            })
            .await?;

        let messages = vec![message];
        self.broadcaster
            .publish_all(message_events(&chat, &messages, None))
            .await;
        Ok(OperationResult::new(chat, messages))
    }

    async fn publish_escalation(&self, outcome: &EscalationOutcome, announce_prompt: bool) {
        let mut envelopes = Vec::new();
        let changed = outcome.previous_status != outcome.chat.session.status;
        if changed || (outcome.prompt.is_some() && !announce_prompt) {
            envelopes.push(status_event(&outcome.chat, outcome.previous_status));
        }
        let prompt = if announce_prompt { outcome.prompt.as_ref() } else { None };
        envelopes.extend(message_events(&outcome.chat, &outcome.messages, prompt));
        self.broadcaster.publish_all(envelopes).await;
    }

    pub async fn request_human(&self, session_id: &str, now: DateTime<Utc>) -> Result<OperationResult, ChatError> {
        let outcome = self.escalation.request_human(session_id, now).await?;
        self.publish_escalation(&outcome, false).await;
        Ok(OperationResult::new(outcome.chat, outcome.messages))
    }

    /// Agent-initiated offer. A suppressed trigger returns the unchanged chat.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        agent: &AgentProfile,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        let outcome = self
            .escalation
            .trigger(
                session_id,
                PromptTrigger::Manual,
                EscalationReason::AgentInitiated,
                Some(agent),
                now,
            )
            .await?;
        match outcome {
            Some(outcome) => {
                self.publish_escalation(&outcome, true).await;
                Ok(OperationResult::new(outcome.chat, outcome.messages))
            }
            None => Ok(OperationResult::new(self.store.snapshot(session_id).await?, Vec::new())),
        }
    }

    pub async fn respond_to_prompt(
        &self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        let response = self.escalation.answer(session_id, prompt_id, answer, now).await?;
        let outcome = match response.outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(chat) = response.retired {
                    self.broadcaster
                        .publish(status_event(&chat, chat.session.status))
                        .await;
                }
                return Err(err);
            }
        };
        self.publish_escalation(&outcome, false).await;
        Ok(OperationResult::new(outcome.chat, outcome.messages))
    }

    async fn publish_assignment(&self, outcome: &AssignmentOutcome) {
        let payload = AssignmentPayload {
            chat: outcome.chat.clone(),
            assignment: outcome.event.clone(),
        };
        let event = match outcome.event.kind {
            AssignmentKind::Assigned => ChatEvent::ChatAssigned(payload),
            AssignmentKind::Transferred => ChatEvent::ChatTransferred(payload),
            AssignmentKind::Unassigned => ChatEvent::ChatUnassigned(payload),
        };
        let mut envelopes = vec![EventEnvelope::new(event)];
        envelopes.extend(message_events(
            &outcome.chat,
            std::slice::from_ref(&outcome.notice),
            None,
        ));
        self.broadcaster.publish_all(envelopes).await;
    }

    fn notify(&self, agent_id: &str, session_id: &str, kind: NotificationKind, title: String, body: String, now: DateTime<Utc>) {
        notifier::spawn_notify(
            self.notifier.clone(),
            AgentNotification {
                agent_id: agent_id.to_string(),
                session_id: session_id.to_string(),
                kind,
                title,
                body,
                occurred_at: now,
            },
        );
    }

    /// Assigns `agent`. Agents may claim chats for themselves; assigning
    /// someone else takes an admin.
    pub async fn assign(
        &self,
        session_id: &str,
        agent: &AgentProfile,
        actor: &AgentProfile,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        if agent.id != actor.id && !actor.is_admin() {
            return Err(ChatError::Forbidden("only admins can assign other agents"));
        }
        let outcome = self.assignments.assign(session_id, agent, actor, now).await?;
        self.publish_assignment(&outcome).await;
        if agent.id != actor.id {
            self.notify(
                &agent.id,
                session_id,
                NotificationKind::Assigned,
                "New chat assigned".to_string(),
                format!("{} assigned a conversation to you", actor.name),
                now,
            );
        }
        Ok(OperationResult::new(outcome.chat, vec![outcome.notice]))
    }

    /// Transfers from `from_agent` (the actor by default) to `to`.
    pub async fn transfer(
        &self,
        session_id: &str,
        from_agent: Option<&str>,
        to: &AgentProfile,
        actor: &AgentProfile,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        let from_agent = from_agent.unwrap_or(actor.id.as_str());
        if from_agent != actor.id && !actor.is_admin() {
            return Err(ChatError::Forbidden("only admins can transfer chats they do not own"));
        }
        let outcome = self
            .assignments
            .transfer(session_id, from_agent, to, actor, reason, now)
            .await?;
        self.publish_assignment(&outcome).await;

        let detail = if reason.trim().is_empty() {
            format!("From {}", actor.name)
        } else {
            reason.trim().to_string()
        };
        self.notify(
            &to.id,
            session_id,
            NotificationKind::TransferredIn,
            "Chat transferred to you".to_string(),
            detail,
            now,
        );
        if from_agent != actor.id {
            self.notify(
                from_agent,
                session_id,
                NotificationKind::TransferredOut,
                format!("Chat transferred to {}", to.name),
                reason.trim().to_string(),
                now,
            );
        }
        Ok(OperationResult::new(outcome.chat, vec![outcome.notice]))
    }

    pub async fn unassign(
        &self,
        session_id: &str,
        actor: &AgentProfile,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        let outcome = self.assignments.unassign(session_id, actor, now).await?;
        self.publish_assignment(&outcome).await;
        Ok(OperationResult::new(outcome.chat, vec![outcome.notice]))
    }

    /// Closes the chat. Closing an already closed chat is a no-op. An agent
    /// may only close a chat someone else owns when they are an admin.
    pub async fn close(
        &self,
        session_id: &str,
        by: ClosedBy,
        actor: Option<&AgentProfile>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<OperationResult, ChatError> {
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let closed = self
            .store
            .with_chat(session_id, |record| {
                if record.session.status == ChatStatus::Closed {
                    return Ok(None);
                }
                if let (Some(actor), Some(owner)) = (actor, record.session.assigned_agent.as_deref()) {
                    if owner != actor.id && !actor.is_admin() {
                        return Err(ChatError::NotOwner {
                            current: AssignmentStatus::from(&record.session),
                        });
                    }
                }
                let previous_agent = record.session.assigned_agent.clone();
                let previous_status = lifecycle::apply(&mut record.session, Transition::Close(by))?;
                record.session.close_reason = reason.clone();
                let notice = record.push_notice(
                    notices::render(&Notice::Closed {
                        by,
                        reason: reason.as_deref(),
                    }),
                    now,
                );
                tracing::info!(
                    session_id = %record.session.session_id,
                    closed_by = ?by,
                    previous_status = %previous_status,
                    "chat closed"
                );
                Ok(Some((record.snapshot(), previous_status, previous_agent, notice)))
            })
            .await?;

        let Some((chat, previous_status, previous_agent, notice)) = closed else {
            return Ok(OperationResult::new(self.store.snapshot(session_id).await?, Vec::new()));
        };

        let messages = vec![notice];
        let mut envelopes = vec![EventEnvelope::new(ChatEvent::ChatEnded(StatusPayload {
            chat: chat.clone(),
            previous_status,
            previous_agent,
        }))];
        envelopes.extend(message_events(&chat, &messages, None));
        self.broadcaster.publish_all(envelopes).await;
        Ok(OperationResult::new(chat, messages))
    }

    pub async fn get_chat_history(&self, session_id: &str) -> Result<ChatHistory, ChatError> {
        self.store.history(session_id).await
    }

    pub async fn get_assignment_status(&self, session_id: &str) -> Result<AssignmentStatus, ChatError> {
        self.assignments.status(session_id).await
    }

    pub async fn assignment_log(&self, session_id: &str) -> Result<Vec<AssignmentEvent>, ChatError> {
        self.assignments.history(session_id).await
    }

    pub async fn active_chats(&self) -> Vec<SessionSummary> {
        self.store.active_summaries().await
    }

    /// Retires overdue prompts and announces the new escalation sub-state.
    pub async fn sweep_expired_prompts(&self, now: DateTime<Utc>) -> usize {
        let changed = self.escalation.expire_stale(now).await;
        let count = changed.len();
        let envelopes = changed
            .iter()
            .map(|chat| status_event(chat, chat.session.status))
            .collect::<Vec<_>>();
        self.broadcaster.publish_all(envelopes).await;
        count
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::events::{EventKind, Topic};

    fn agent(id: &str, role: AgentRole) -> AgentProfile {
        AgentProfile {
            id: id.to_string(),
            name: id.to_uppercase(),
            role,
        }
    }

    fn service(policy: ClosedSessionPolicy) -> ChatService {
        let config = Config {
            closed_session_policy: policy,
            ..Config::default()
        };
        ChatService::new(
            Arc::new(ChatStateStore::in_memory()),
            Arc::new(EventBroadcaster::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        let err = service
            .send_message(&chat.session_id, Draft::visitor("   "), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
    }

    #[tokio::test]
    async fn visitor_after_close_gets_a_new_session() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(Some("visitor-1".into()), Channel::Web).await;
        service
            .close(&chat.session_id, ClosedBy::Visitor, None, None, Utc::now())
            .await
            .unwrap();

        let result = service
            .send_message(&chat.session_id, Draft::visitor("hello again"), Utc::now())
            .await
            .unwrap();
        assert_ne!(result.session_id, chat.session_id);
        assert_eq!(result.status, ChatStatus::Bot);
        assert_eq!(result.chat.session.visitor_id, "visitor-1");

        let old = service.get_chat_history(&chat.session_id).await.unwrap();
        assert_eq!(old.chat.session.status, ChatStatus::Closed);
    }

    #[tokio::test]
    async fn reactivate_policy_reopens_with_notice() {
        let service = service(ClosedSessionPolicy::Reactivate);
        let chat = service.create_session(None, Channel::Web).await;
        service
            .close(&chat.session_id, ClosedBy::Visitor, None, None, Utc::now())
            .await
            .unwrap();

        let result = service
            .send_message(&chat.session_id, Draft::visitor("back"), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.session_id, chat.session_id);
        assert_eq!(result.status, ChatStatus::Bot);
        assert_eq!(result.messages[0].text, "Conversation resumed.");
        assert_eq!(result.messages[1].text, "back");
    }

    #[tokio::test]
    async fn bot_hint_raises_automatic_prompt_once() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        let first = service
            .send_message(
                &chat.session_id,
                Draft::bot("I don't know that.", Some(EscalationReason::Unanswerable)),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.messages[1].kind, MessageKind::EscalationPrompt);
        let prompt = first.chat.escalation.clone().unwrap();
        assert_eq!(prompt.trigger, PromptTrigger::Automatic);

        let second = service
            .send_message(
                &chat.session_id,
                Draft::bot("Still unsure.", Some(EscalationReason::RiskUncertainty)),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.chat.escalation.unwrap().id, prompt.id);
    }

    #[tokio::test]
    async fn agent_message_requires_ownership() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        let anna = agent("anna", AgentRole::Agent);
        let ben = agent("ben", AgentRole::Agent);
        service.assign(&chat.session_id, &anna, &anna, Utc::now()).await.unwrap();

        let body = || AgentMessageBody {
            text: "Hi, I'm here".into(),
            attachment: None,
        };
        let err = service
            .send_agent_message(&chat.session_id, &ben, body(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotOwner { .. }));

        let ok = service
            .send_agent_message(&chat.session_id, &anna, body(), Utc::now())
            .await
            .unwrap();
        assert_eq!(ok.messages[0].metadata.agent_name.as_deref(), Some("ANNA"));
    }

    #[tokio::test]
    async fn non_admin_cannot_assign_others() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        let anna = agent("anna", AgentRole::Agent);
        let ben = agent("ben", AgentRole::Agent);
        let err = service
            .assign(&chat.session_id, &ben, &anna, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[tokio::test]
    async fn close_notifies_last_owner_and_is_idempotent() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        let anna = agent("anna", AgentRole::Agent);
        service.assign(&chat.session_id, &anna, &anna, Utc::now()).await.unwrap();

        let mut sub = service.broadcaster().register().await;
        service.broadcaster().subscribe(sub.id, Topic::agent("anna")).await;

        let closed = service
            .close(&chat.session_id, ClosedBy::Agent, Some(&anna), Some("resolved".into()), Utc::now())
            .await
            .unwrap();
        assert_eq!(closed.status, ChatStatus::Closed);
        assert!(closed.assigned_agent.is_none());
        assert_eq!(closed.chat.session.close_reason.as_deref(), Some("resolved"));

        let delivery = sub.receiver.recv().await.unwrap();
        assert_eq!(delivery.envelope.kind(), EventKind::ChatEnded);

        let again = service
            .close(&chat.session_id, ClosedBy::Visitor, None, None, Utc::now())
            .await
            .unwrap();
        assert!(again.messages.is_empty());
        assert_eq!(again.chat.session.closed_by, Some(ClosedBy::Agent));
    }

    #[tokio::test]
    async fn sweeper_announces_ignored_prompts() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        service
            .send_message(
                &chat.session_id,
                Draft::bot("Hmm.", Some(EscalationReason::Unanswerable)),
                Utc::now(),
            )
            .await
            .unwrap();

        let mut sub = service.broadcaster().register().await;
        service
            .broadcaster()
            .subscribe(sub.id, Topic::chat(chat.session_id.clone()))
            .await;

        let swept = service
            .sweep_expired_prompts(Utc::now() + ChronoDuration::seconds(600))
            .await;
        assert_eq!(swept, 1);
        let delivery = sub.receiver.recv().await.unwrap();
        assert_eq!(delivery.envelope.kind(), EventKind::StatusChanged);
        assert_eq!(
            delivery.envelope.event.chat().escalation.as_ref().unwrap().status,
            PromptStatus::Ignored
        );
    }

    #[tokio::test]
    async fn late_answer_announces_the_ignored_prompt() {
        let service = service(ClosedSessionPolicy::NewSession);
        let chat = service.create_session(None, Channel::Web).await;
        let t0 = Utc::now();
        let offered = service
            .send_message(
                &chat.session_id,
                Draft::bot("Hmm.", Some(EscalationReason::Unanswerable)),
                t0,
            )
            .await
            .unwrap();
        let prompt = offered.chat.escalation.unwrap();

        let mut sub = service.broadcaster().register().await;
        service
            .broadcaster()
            .subscribe(sub.id, Topic::chat(chat.session_id.clone()))
            .await;

        let late = t0 + ChronoDuration::seconds(121);
        let err = service
            .respond_to_prompt(&chat.session_id, &prompt.id, PromptAnswer::Accept, late)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NoOutstandingPrompt));

        let delivery = sub.receiver.try_recv().unwrap();
        assert_eq!(delivery.envelope.kind(), EventKind::StatusChanged);
        let announced = delivery.envelope.event.chat();
        assert_eq!(announced.session.status, ChatStatus::Bot);
        assert_eq!(announced.escalation.as_ref().unwrap().status, PromptStatus::Ignored);
        assert!(sub.receiver.try_recv().is_err());

        let stored = service.get_chat_history(&chat.session_id).await.unwrap();
        assert_eq!(&stored.chat, announced);
        assert_eq!(service.sweep_expired_prompts(late).await, 0);
    }
}
