use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::ChatError;
use crate::persist::{Persistence, RecordChange};
use crate::types::*;

/// Everything the server knows about one conversation.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub session: ChatSession,
    pub messages: Vec<Message>,
    pub prompts: Vec<EscalationPrompt>,
    pub assignments: Vec<AssignmentEvent>,
}

#[derive(Debug, Clone, Copy)]
struct Marks {
    revision: u64,
    messages: usize,
    assignments: usize,
}

impl ChatRecord {
    pub fn new(session: ChatSession) -> Self {
        Self {
            session,
            messages: Vec::new(),
            prompts: Vec::new(),
            assignments: Vec::new(),
        }
    }

    /// Commits a mutation: advances the per-chat clock (strictly increasing
    /// even when the wall clock stalls) and bumps the revision.
    pub fn touch(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = if now > self.session.updated_at {
            now
        } else {
            self.session.updated_at + ChronoDuration::microseconds(1)
        };
        self.session.updated_at = stamp;
        self.session.revision += 1;
        stamp
    }

    pub fn push_message(
        &mut self,
        sender_role: SenderRole,
        text: impl Into<String>,
        kind: MessageKind,
        metadata: MessageMetadata,
        now: DateTime<Utc>,
    ) -> Message {
        let created_at = self.touch(now);
        self.session.last_activity = created_at;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: self.session.session_id.clone(),
            sender_role,
            text: text.into(),
            created_at,
            kind,
            metadata,
        };
        self.messages.push(message.clone());
        message
    }

    pub fn push_notice(&mut self, text: impl Into<String>, now: DateTime<Utc>) -> Message {
        self.push_message(
            SenderRole::System,
            text,
            MessageKind::SystemNotice,
            MessageMetadata::default(),
            now,
        )
    }

    pub fn record_assignment(
        &mut self,
        kind: AssignmentKind,
        from_agent: Option<String>,
        to_agent: Option<String>,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AssignmentEvent {
        let occurred_at = self.touch(now);
        let event = AssignmentEvent {
            id: Uuid::new_v4().to_string(),
            session_id: self.session.session_id.clone(),
            kind,
            from_agent,
            to_agent,
            actor: actor.to_string(),
            reason: reason.to_string(),
            occurred_at,
        };
        self.assignments.push(event.clone());
        event
    }

    pub fn outstanding_prompt(&self) -> Option<&EscalationPrompt> {
        self.prompts
            .iter()
            .rev()
            .find(|prompt| prompt.status == PromptStatus::Sent)
    }

    pub fn latest_prompt(&self) -> Option<&EscalationPrompt> {
        self.prompts.last()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            session: self.session.clone(),
            escalation: self.latest_prompt().cloned(),
        }
    }

    pub fn history(&self) -> ChatHistory {
        ChatHistory {
            chat: self.snapshot(),
            messages: self.messages.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            chat: self.snapshot(),
            last_message: self.messages.last().cloned(),
            message_count: self.messages.len(),
        }
    }

    fn marks(&self) -> Marks {
        Marks {
            revision: self.session.revision,
            messages: self.messages.len(),
            assignments: self.assignments.len(),
        }
    }

    fn change_since(&self, marks: Marks) -> RecordChange {
        RecordChange {
            session: self.session.clone(),
            messages: self.messages[marks.messages.min(self.messages.len())..].to_vec(),
            prompts: self.prompts.clone(),
            assignments: self.assignments[marks.assignments.min(self.assignments.len())..]
                .to_vec(),
        }
    }
}

/// Authoritative chat state. Each chat sits behind its own mutex so that
/// mutations of one chat are serialized while different chats never contend.
pub struct ChatStateStore {
    chats: RwLock<HashMap<String, Arc<Mutex<ChatRecord>>>>,
    next_id: AtomicI64,
    persistence: Persistence,
    closed_retention: usize,
}

/// Closed chats kept in memory before the oldest are evicted.
pub const DEFAULT_CLOSED_RETENTION: usize = 1000;

impl ChatStateStore {
    pub fn new(persistence: Persistence) -> Self {
        Self {
            chats: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            persistence,
            closed_retention: DEFAULT_CLOSED_RETENTION,
        }
    }

    pub fn with_closed_retention(mut self, retention: usize) -> Self {
        self.closed_retention = retention;
        self
    }

    pub fn in_memory() -> Self {
        Self::new(Persistence::disabled())
    }

    pub async fn create_session(&self, visitor_id: Option<String>, channel: Channel) -> ChatSnapshot {
        let session_id = Uuid::new_v4().to_string();
        let visitor_id = visitor_id
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = ChatRecord::new(ChatSession::new(
            id,
            session_id.clone(),
            visitor_id,
            channel,
            Utc::now(),
        ));
        let snapshot = record.snapshot();

        self.persistence.mirror(record.change_since(Marks {
            revision: 0,
            messages: 0,
            assignments: 0,
        }));
        self.chats
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(record)));

        tracing::info!(session_id = %snapshot.session_id(), chat_id = id, "session created");
        snapshot
    }

    /// Adds a record loaded from durable storage.
    pub async fn insert(&self, record: ChatRecord) {
        self.next_id
            .fetch_max(record.session.id + 1, Ordering::Relaxed);
        let session_id = record.session.session_id.clone();
        self.chats
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(record)));
    }

    pub fn reserve_ids_from(&self, next_id: i64) {
        self.next_id.fetch_max(next_id, Ordering::Relaxed);
    }

    async fn handle(&self, session_id: &str) -> Result<Arc<Mutex<ChatRecord>>, ChatError> {
        if let Some(handle) = self.chats.read().await.get(session_id).cloned() {
            return Ok(handle);
        }
        // Evicted chats come back from the mirror on first use.
        let Some(record) = self.persistence.load_session(session_id).await? else {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        };
        tracing::debug!(session_id, "chat reloaded from storage");
        let handle = self
            .chats
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(record)))
            .clone();
        Ok(handle)
    }

    /// Drops the oldest closed chats beyond the retention limit. Chats whose
    /// lock is held are skipped this round. Returns how many were evicted.
    pub async fn evict_closed(&self) -> usize {
        let handles = self
            .chats
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect::<Vec<_>>();
        let mut closed = handles
            .iter()
            .filter_map(|(id, handle)| {
                let record = handle.try_lock().ok()?;
                (record.session.status == ChatStatus::Closed)
                    .then(|| (record.session.updated_at, id.clone()))
            })
            .collect::<Vec<_>>();
        if closed.len() <= self.closed_retention {
            return 0;
        }
        closed.sort();
        let excess = closed.len() - self.closed_retention;

        let mut chats = self.chats.write().await;
        let mut evicted = 0;
        for (_, session_id) in closed.into_iter().take(excess) {
            let still_closed = chats
                .get(&session_id)
                .and_then(|handle| handle.try_lock().ok())
                .is_some_and(|record| record.session.status == ChatStatus::Closed);
            if still_closed {
                chats.remove(&session_id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, retained = self.closed_retention, "closed chats evicted");
        }
        evicted
    }

    /// Runs `f` under the chat's lock. Whatever `f` committed (revision moved)
    /// is mirrored to durable storage even when `f` returns an error.
    pub async fn with_chat<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ChatRecord) -> Result<T, ChatError>,
    ) -> Result<T, ChatError> {
        let handle = self.handle(session_id).await?;
        let mut record = handle.lock().await;
        let marks = record.marks();
        let result = f(&mut *record);
        if record.session.revision != marks.revision {
            self.persistence.mirror(record.change_since(marks));
        }
        result
    }

    pub async fn read<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&ChatRecord) -> T,
    ) -> Result<T, ChatError> {
        let handle = self.handle(session_id).await?;
        let record = handle.lock().await;
        Ok(f(&*record))
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<ChatSnapshot, ChatError> {
        self.read(session_id, ChatRecord::snapshot).await
    }

    pub async fn history(&self, session_id: &str) -> Result<ChatHistory, ChatError> {
        self.read(session_id, ChatRecord::history).await
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.chats.read().await.keys().cloned().collect()
    }

    /// Non-closed chats, most recently updated first.
    pub async fn active_summaries(&self) -> Vec<SessionSummary> {
        let handles = self.chats.read().await.values().cloned().collect::<Vec<_>>();
        let mut list = Vec::with_capacity(handles.len());
        for handle in handles {
            let record = handle.lock().await;
            if record.session.status.is_active() {
                list.push(record.summary());
            }
        }
        list.sort_by(|a, b| b.chat.session.updated_at.cmp(&a.chat.session.updated_at));
        list
    }
}
