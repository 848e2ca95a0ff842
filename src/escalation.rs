use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::ChatError;
use crate::lifecycle::{self, Transition};
use crate::notices::{self, Notice};
use crate::store::{ChatRecord, ChatStateStore};
use crate::types::*;

/// Bot-side reason detection. Implementations must be cheap; they run under
/// the chat lock.
pub trait EscalationClassifier: Send + Sync {
    fn classify(&self, text: &str, history: &[Message]) -> Option<EscalationReason>;
}

pub struct KeywordClassifier {
    explicit: Option<Regex>,
    frustration: Option<Regex>,
    repeat_lookback: usize,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            explicit: Regex::new(
                r"(?i)\b(human|real person|representative|live agent|operator|handover|(talk|speak|chat) (to|with) (an? |the )?(agent|person|someone|support)|mitarbeiter(in)?|menschen?|berater(in)?|kundendienst|ansprechpartner)\b",
            )
            .ok(),
            frustration: Regex::new(
                r"(?i)(useless|not helpful|doesn'?t help|does not help|ridiculous|frustrat|annoying|waste of time|nutzlos|hilft nicht|bringt nichts|ärgerlich|sinnlos)",
            )
            .ok(),
            repeat_lookback: 5,
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl EscalationClassifier for KeywordClassifier {
    fn classify(&self, text: &str, history: &[Message]) -> Option<EscalationReason> {
        if self.explicit.as_ref().is_some_and(|re| re.is_match(text)) {
            return Some(EscalationReason::ExplicitRequest);
        }
        if self.frustration.as_ref().is_some_and(|re| re.is_match(text)) {
            return Some(EscalationReason::Frustration);
        }

        let needle = normalize(text);
        if needle.split(' ').count() < 3 {
            return None;
        }
        let repeated = history
            .iter()
            .rev()
            .filter(|m| m.sender_role == SenderRole::Visitor)
            .take(self.repeat_lookback)
            .any(|m| normalize(&m.text) == needle);
        repeated.then_some(EscalationReason::RepeatedQuestion)
    }
}

#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    pub chat: ChatSnapshot,
    pub previous_status: ChatStatus,
    /// Prompt created or answered by the operation, if any.
    pub prompt: Option<EscalationPrompt>,
    pub messages: Vec<Message>,
}

/// Result of answering a prompt under the chat lock.
#[derive(Debug)]
pub struct PromptResponse {
    /// Chat after an overdue prompt was moved to `ignored` by this call.
    pub retired: Option<ChatSnapshot>,
    pub outcome: Result<EscalationOutcome, ChatError>,
}

fn is_expired(prompt: &EscalationPrompt, timeout: ChronoDuration, now: DateTime<Utc>) -> bool {
    prompt.status == PromptStatus::Sent
        && prompt
            .sent_at
            .checked_add_signed(timeout)
            .is_some_and(|deadline| deadline <= now)
}

/// Moves an outstanding prompt past its deadline to `ignored`. Returns the
/// retired prompt.
pub fn retire_expired(
    record: &mut ChatRecord,
    timeout: ChronoDuration,
    now: DateTime<Utc>,
) -> Option<EscalationPrompt> {
    let index = record
        .prompts
        .iter()
        .position(|p| is_expired(p, timeout, now))?;
    record.touch(now);
    let prompt = &mut record.prompts[index];
    prompt.status = PromptStatus::Ignored;
    tracing::debug!(session_id = %prompt.session_id, prompt_id = %prompt.id, "escalation prompt ignored");
    Some(prompt.clone())
}

/// Offers a human. Only chats still with the bot can be offered one, and only
/// when no prompt is outstanding.
pub fn trigger_record(
    record: &mut ChatRecord,
    trigger: PromptTrigger,
    reason: EscalationReason,
    sent_by: Option<&AgentProfile>,
    timeout: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<EscalationOutcome, ChatError> {
    let status = record.session.status;
    if status == ChatStatus::Closed {
        return Err(ChatError::SessionClosed);
    }
    if status != ChatStatus::Bot {
        return Err(ChatError::InvalidTransition {
            from: status,
            transition: "offer a human in",
        });
    }
    retire_expired(record, timeout, now);
    if record.outstanding_prompt().is_some() {
        return Err(ChatError::PromptOutstanding);
    }

    let prompt_id = Uuid::new_v4().to_string();
    let metadata = MessageMetadata {
        prompt_id: Some(prompt_id.clone()),
        agent_id: sent_by.map(|agent| agent.id.clone()),
        agent_name: sent_by.map(|agent| agent.name.clone()),
        ..MessageMetadata::default()
    };
    let (role, text) = match sent_by {
        Some(_) => (
            SenderRole::Agent,
            notices::render(&Notice::EscalationOffer {
                reason: EscalationReason::AgentInitiated,
            }),
        ),
        None => (SenderRole::Bot, notices::render(&Notice::EscalationOffer { reason })),
    };
    let message = record.push_message(role, text, MessageKind::EscalationPrompt, metadata, now);
    let prompt = EscalationPrompt {
        id: prompt_id,
        session_id: record.session.session_id.clone(),
        status: PromptStatus::Sent,
        trigger,
        reason,
        sent_by: sent_by.map(|agent| agent.id.clone()),
        sent_at: message.created_at,
        responded_at: None,
    };
    record.prompts.push(prompt.clone());

    tracing::info!(
        session_id = %prompt.session_id,
        prompt_id = %prompt.id,
        trigger = ?trigger,
        reason = reason.as_str(),
        "escalation prompt sent"
    );

    Ok(EscalationOutcome {
        chat: record.snapshot(),
        previous_status: status,
        prompt: Some(prompt),
        messages: vec![message],
    })
}

/// Bot to waiting_human with a single "please wait" notice. Chats that are
/// already waiting or owned are left alone.
fn escalate(record: &mut ChatRecord, now: DateTime<Utc>) -> Result<Option<Message>, ChatError> {
    if record.session.status != ChatStatus::Bot {
        return Ok(None);
    }
    lifecycle::apply(&mut record.session, Transition::Escalate)?;
    Ok(Some(record.push_notice(notices::render(&Notice::PleaseWait), now)))
}

pub fn respond_record(
    record: &mut ChatRecord,
    prompt_id: &str,
    answer: PromptAnswer,
    timeout: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<EscalationOutcome, ChatError> {
    if record.session.status == ChatStatus::Closed {
        return Err(ChatError::SessionClosed);
    }
    retire_expired(record, timeout, now);
    let Some(index) = record
        .prompts
        .iter()
        .position(|p| p.id == prompt_id && p.status == PromptStatus::Sent)
    else {
        return Err(ChatError::NoOutstandingPrompt);
    };

    let previous_status = record.session.status;
    let text = match answer {
        PromptAnswer::Accept => "Yes, please connect me with a person.",
        PromptAnswer::Decline => "No, thanks.",
    };
    let response = record.push_message(
        SenderRole::Visitor,
        text,
        MessageKind::EscalationResponse,
        MessageMetadata {
            prompt_id: Some(prompt_id.to_string()),
            ..MessageMetadata::default()
        },
        now,
    );
    let prompt = &mut record.prompts[index];
    prompt.status = match answer {
        PromptAnswer::Accept => PromptStatus::Accepted,
        PromptAnswer::Decline => PromptStatus::Declined,
    };
    prompt.responded_at = Some(response.created_at);
    let prompt = prompt.clone();

    let mut messages = vec![response];
    if answer == PromptAnswer::Accept {
        messages.extend(escalate(record, now)?);
    }

    tracing::info!(
        session_id = %prompt.session_id,
        prompt_id = %prompt.id,
        answer = ?answer,
        status = %record.session.status,
        "escalation prompt answered"
    );

    Ok(EscalationOutcome {
        chat: record.snapshot(),
        previous_status,
        prompt: Some(prompt),
        messages,
    })
}

/// Explicit "talk to a human" action. Accepts an outstanding prompt if there
/// is one; otherwise escalates directly. Idempotent once a human is involved.
pub fn request_human_record(
    record: &mut ChatRecord,
    timeout: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<EscalationOutcome, ChatError> {
    if record.session.status == ChatStatus::Closed {
        return Err(ChatError::SessionClosed);
    }
    retire_expired(record, timeout, now);
    if let Some(prompt_id) = record.outstanding_prompt().map(|p| p.id.clone()) {
        return respond_record(record, &prompt_id, PromptAnswer::Accept, timeout, now);
    }

    let previous_status = record.session.status;
    let messages = escalate(record, now)?.into_iter().collect::<Vec<_>>();
    if !messages.is_empty() {
        tracing::info!(session_id = %record.session.session_id, "human requested");
    }
    Ok(EscalationOutcome {
        chat: record.snapshot(),
        previous_status,
        prompt: None,
        messages,
    })
}

/// The escalation handshake of every chat. Operations serialize on the chat's
/// lock, which keeps at most one prompt `sent` per chat.
#[derive(Clone)]
pub struct EscalationProtocol {
    store: Arc<ChatStateStore>,
    timeout: ChronoDuration,
}

impl EscalationProtocol {
    pub fn new(store: Arc<ChatStateStore>, timeout: ChronoDuration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> ChronoDuration {
        self.timeout
    }

    /// `Ok(None)` when the trigger was suppressed because a prompt is
    /// already outstanding.
    pub async fn trigger(
        &self,
        session_id: &str,
        trigger: PromptTrigger,
        reason: EscalationReason,
        sent_by: Option<&AgentProfile>,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationOutcome>, ChatError> {
        let result = self
            .store
            .with_chat(session_id, |record| {
                trigger_record(record, trigger, reason, sent_by, self.timeout, now)
            })
            .await;
        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(ChatError::PromptOutstanding) => {
                tracing::debug!(session_id, reason = reason.as_str(), "escalation trigger suppressed");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn respond(
        &self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, ChatError> {
        self.answer(session_id, prompt_id, answer, now).await?.outcome
    }

    /// Like [`respond`](Self::respond), but also reports a prompt that the
    /// late answer retired, so the caller can announce it even when the
    /// answer itself is rejected.
    pub async fn answer(
        &self,
        session_id: &str,
        prompt_id: &str,
        answer: PromptAnswer,
        now: DateTime<Utc>,
    ) -> Result<PromptResponse, ChatError> {
        self.store
            .with_chat(session_id, |record| {
                let retired = retire_expired(record, self.timeout, now).map(|_| record.snapshot());
                let outcome = respond_record(record, prompt_id, answer, self.timeout, now);
                Ok(PromptResponse { retired, outcome })
            })
            .await
    }

    pub async fn request_human(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, ChatError> {
        self.store
            .with_chat(session_id, |record| request_human_record(record, self.timeout, now))
            .await
    }

    /// Retires every overdue prompt and returns the chats that changed.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<ChatSnapshot> {
        let mut changed = Vec::new();
        for session_id in self.store.session_ids().await {
            let result = self
                .store
                .with_chat(&session_id, |record| {
                    Ok(retire_expired(record, self.timeout, now).map(|_| record.snapshot()))
                })
                .await;
            if let Ok(Some(chat)) = result {
                changed.push(chat);
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> (EscalationProtocol, Arc<ChatStateStore>) {
        let store = Arc::new(ChatStateStore::in_memory());
        (
            EscalationProtocol::new(store.clone(), ChronoDuration::seconds(120)),
            store,
        )
    }

    fn visitor_message(text: &str) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            session_id: "s".into(),
            sender_role: SenderRole::Visitor,
            text: text.into(),
            created_at: Utc::now(),
            kind: MessageKind::Plain,
            metadata: MessageMetadata::default(),
        }
    }

    #[test]
    fn classifier_understands_german_request() {
        let classifier = KeywordClassifier::new();
        assert_eq!(
            classifier.classify("Ich möchte mit einem Mitarbeiter sprechen", &[]),
            Some(EscalationReason::ExplicitRequest)
        );
        assert_eq!(
            classifier.classify("Can I talk to a person please?", &[]),
            Some(EscalationReason::ExplicitRequest)
        );
        assert_eq!(
            classifier.classify("this is useless", &[]),
            Some(EscalationReason::Frustration)
        );
        assert_eq!(classifier.classify("What are your opening hours?", &[]), None);
    }

    #[test]
    fn classifier_flags_repeated_questions() {
        let classifier = KeywordClassifier::new();
        let history = vec![visitor_message("What are your opening hours?")];
        assert_eq!(
            classifier.classify("what are your opening hours", &history),
            Some(EscalationReason::RepeatedQuestion)
        );
        let short = vec![visitor_message("ok")];
        assert_eq!(classifier.classify("ok", &short), None);
    }

    #[tokio::test]
    async fn second_trigger_is_suppressed() {
        let (protocol, store) = protocol();
        let chat = store.create_session(None, Channel::Web).await;
        let id = chat.session_id();
        let now = Utc::now();

        let first = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Frustration, None, now)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Unanswerable, None, now)
            .await
            .unwrap();
        assert!(second.is_none());

        let prompts = store.read(id, |r| r.prompts.clone()).await.unwrap();
        assert_eq!(prompts.len(), 1);
    }

    #[tokio::test]
    async fn accept_moves_to_waiting_with_one_notice() {
        let (protocol, store) = protocol();
        let chat = store.create_session(None, Channel::Web).await;
        let id = chat.session_id();
        let offered = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::ExplicitRequest, None, Utc::now())
            .await
            .unwrap()
            .unwrap();
        let prompt_id = offered.prompt.unwrap().id;

        let outcome = protocol
            .respond(id, &prompt_id, PromptAnswer::Accept, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.chat.session.status, ChatStatus::WaitingHuman);
        assert_eq!(outcome.prompt.as_ref().unwrap().status, PromptStatus::Accepted);
        assert!(outcome.prompt.unwrap().responded_at.is_some());
        let notices = outcome
            .messages
            .iter()
            .filter(|m| m.kind == MessageKind::SystemNotice)
            .count();
        assert_eq!(notices, 1);

        let again = protocol
            .respond(id, &prompt_id, PromptAnswer::Accept, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(again, ChatError::NoOutstandingPrompt));
    }

    #[tokio::test]
    async fn decline_keeps_bot() {
        let (protocol, store) = protocol();
        let chat = store.create_session(None, Channel::Web).await;
        let id = chat.session_id();
        let offered = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Unanswerable, None, Utc::now())
            .await
            .unwrap()
            .unwrap();
        let outcome = protocol
            .respond(id, &offered.prompt.unwrap().id, PromptAnswer::Decline, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.chat.session.status, ChatStatus::Bot);
        assert_eq!(outcome.chat.escalation.unwrap().status, PromptStatus::Declined);
    }

    #[tokio::test]
    async fn expired_prompt_is_ignored_and_unblocks_triggers() {
        let (protocol, store) = protocol();
        let chat = store.create_session(None, Channel::Web).await;
        let id = chat.session_id();
        let sent = Utc::now();
        let offered = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Frustration, None, sent)
            .await
            .unwrap()
            .unwrap();

        let later = sent + ChronoDuration::seconds(121);
        let changed = protocol.expire_stale(later).await;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].escalation.as_ref().unwrap().status, PromptStatus::Ignored);

        let err = protocol
            .respond(id, &offered.prompt.unwrap().id, PromptAnswer::Accept, later)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NoOutstandingPrompt));

        let next = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Frustration, None, later)
            .await
            .unwrap();
        assert!(next.is_some());
        assert!(protocol.expire_stale(later).await.is_empty());
    }

    #[tokio::test]
    async fn unbounded_timeout_never_expires() {
        let store = Arc::new(ChatStateStore::in_memory());
        let protocol = EscalationProtocol::new(store.clone(), ChronoDuration::MAX);
        let chat = store.create_session(None, Channel::Web).await;
        let id = chat.session_id();
        protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Frustration, None, Utc::now())
            .await
            .unwrap()
            .unwrap();

        assert!(protocol.expire_stale(DateTime::<Utc>::MAX_UTC).await.is_empty());
        let suppressed = protocol
            .trigger(id, PromptTrigger::Automatic, EscalationReason::Frustration, None, Utc::now())
            .await
            .unwrap();
        assert!(suppressed.is_none());
    }

    #[tokio::test]
    async fn request_human_accepts_outstanding_prompt() {
        let (protocol, store) = protocol();
        let chat = store.create_session(None, Channel::Web).await;
        let id = chat.session_id();
        let anna = AgentProfile {
            id: "a".into(),
            name: "Anna".into(),
            role: AgentRole::Agent,
        };
        protocol
            .trigger(id, PromptTrigger::Manual, EscalationReason::AgentInitiated, Some(&anna), Utc::now())
            .await
            .unwrap();

        let outcome = protocol.request_human(id, Utc::now()).await.unwrap();
        assert_eq!(outcome.chat.session.status, ChatStatus::WaitingHuman);
        assert_eq!(outcome.prompt.unwrap().status, PromptStatus::Accepted);

        let repeat = protocol.request_human(id, Utc::now()).await.unwrap();
        assert!(repeat.messages.is_empty());
        assert_eq!(repeat.chat.session.status, ChatStatus::WaitingHuman);
    }
}
