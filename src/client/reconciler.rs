//! Client-side view reconciliation.
//!
//! A surface merges three racing inputs into one view per chat: results of
//! its own calls, broadcast deliveries, and a locally cached view restored at
//! connect time. Every input goes through the same merge rules:
//!
//! * a message whose id is already in the view is a no-op;
//! * a message matching an unconfirmed local entry (same role and text, close
//!   enough in time) replaces that entry in place;
//! * a broadcast message whose fingerprint was seen inside the dedup window
//!   is dropped;
//! * a chat snapshot replaces the held one only when strictly newer by
//!   `(updated_at, revision)`;
//! * messages are kept sorted by `(created_at, id)`.
//!
//! Applying the same input twice, or inputs in any order, converges to the
//! same view.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::Delivery;
use crate::client::dedup::{message_fingerprint, FingerprintCache};
use crate::client::gate::{Alert, NotificationGate, Visibility};
use crate::error::ChatError;
use crate::events::{ChatEvent, EventKind, Topic};
use crate::types::*;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub dedup_window: ChronoDuration,
    /// How far apart a local entry and its authoritative echo may be stamped.
    pub match_tolerance: ChronoDuration,
    /// Local entries this recent survive a resync that does not contain them.
    pub resync_grace: ChronoDuration,
    pub cache_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            dedup_window: ChronoDuration::milliseconds(3000),
            match_tolerance: ChronoDuration::milliseconds(10_000),
            resync_grace: ChronoDuration::seconds(30),
            cache_limit: 200,
        }
    }
}

/// Wire form of [`ReconcilerConfig`] served to widgets and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTunables {
    pub dedup_window_ms: i64,
    pub match_tolerance_ms: i64,
    pub resync_grace_secs: i64,
    pub cache_limit: usize,
}

impl From<&ReconcilerConfig> for ClientTunables {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            dedup_window_ms: config.dedup_window.num_milliseconds(),
            match_tolerance_ms: config.match_tolerance.num_milliseconds(),
            resync_grace_secs: config.resync_grace.num_seconds(),
            cache_limit: config.cache_limit,
        }
    }
}

impl From<ClientTunables> for ReconcilerConfig {
    fn from(tunables: ClientTunables) -> Self {
        let defaults = ReconcilerConfig::default();
        Self {
            dedup_window: ChronoDuration::try_milliseconds(tunables.dedup_window_ms.max(0))
                .unwrap_or(defaults.dedup_window),
            match_tolerance: ChronoDuration::try_milliseconds(tunables.match_tolerance_ms.max(0))
                .unwrap_or(defaults.match_tolerance),
            resync_grace: ChronoDuration::try_seconds(tunables.resync_grace_secs.max(0))
                .unwrap_or(defaults.resync_grace),
            cache_limit: tunables.cache_limit,
        }
    }
}

/// Start of a window ending at `now`, clamped to the earliest representable time.
fn window_start(now: DateTime<Utc>, window: ChronoDuration) -> DateTime<Utc> {
    now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Who is looking at the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Surface {
    Visitor { session_id: String },
    Agent { agent_id: String },
    Admin,
}

impl Surface {
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Surface::Visitor { session_id } => vec![Topic::chat(session_id.as_str())],
            Surface::Agent { agent_id } => vec![Topic::ActiveChats, Topic::agent(agent_id.as_str())],
            Surface::Admin => vec![Topic::ActiveChats],
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Surface::Agent { agent_id } => Some(agent_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewMessage {
    pub message: Message,
    /// Shown locally, not yet confirmed by the server.
    pub provisional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

impl ViewMessage {
    fn confirmed(message: Message) -> Self {
        Self {
            message,
            provisional: false,
            local_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub session_id: String,
    pub messages: Vec<ViewMessage>,
    pub chat: Option<ChatSnapshot>,
    /// Restored from cache, authoritative history not merged yet.
    pub syncing: bool,
}

impl ChatView {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            messages: Vec::new(),
            chat: None,
            syncing: false,
        }
    }

    pub fn status(&self) -> Option<ChatStatus> {
        self.chat.as_ref().map(|chat| chat.session.status)
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|entry| !entry.provisional)
            .map(|entry| &entry.message)
    }

    pub fn texts(&self) -> Vec<&str> {
        self.messages.iter().map(|entry| entry.message.text.as_str()).collect()
    }

    fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|entry| entry.message.id == id)
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| {
            (a.message.created_at, &a.message.id).cmp(&(b.message.created_at, &b.message.id))
        });
    }

    fn find_provisional(&self, message: &Message, tolerance: ChronoDuration) -> Option<usize> {
        self.messages.iter().position(|entry| {
            let delta = entry.message.created_at - message.created_at;
            entry.provisional
                && entry.message.sender_role == message.sender_role
                && entry.message.text.trim() == message.text.trim()
                && delta <= tolerance
                && delta >= -tolerance
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub local_id: String,
    pub session_id: String,
    pub sender_role: SenderRole,
    pub text: String,
    /// Raw input to restore on failure.
    pub draft: String,
    pub sent_at: DateTime<Utc>,
}

/// Bounded, serialisable copy of a view for fast reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedView {
    pub session_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub chat: Option<ChatSnapshot>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    MessageAdded(Message),
    MessageConfirmed {
        local_id: String,
        message: Message,
    },
    ChatUpdated {
        kind: Option<EventKind>,
        chat: ChatSnapshot,
        previous: Option<ChatSnapshot>,
        assignment: Option<AssignmentEvent>,
    },
    /// The server answered on a different session (closed chat replaced).
    SessionChanged {
        from: String,
        to: String,
    },
    RolledBack {
        local_id: String,
        draft: String,
    },
    Restored {
        session_id: String,
    },
    Resynced {
        session_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub changes: Vec<Change>,
    pub alerts: Vec<Alert>,
}

pub struct ClientReconciler {
    surface: Surface,
    config: ReconcilerConfig,
    views: HashMap<String, ChatView>,
    pending: Vec<PendingSend>,
    seen: FingerprintCache,
    gate: NotificationGate,
}

impl ClientReconciler {
    pub fn new(surface: Surface, config: ReconcilerConfig) -> Self {
        Self {
            seen: FingerprintCache::new(config.dedup_window),
            gate: NotificationGate::new(config.dedup_window),
            surface,
            config,
            views: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.surface.topics()
    }

    pub fn view(&self, session_id: &str) -> Option<&ChatView> {
        self.views.get(session_id)
    }

    pub fn views(&self) -> impl Iterator<Item = &ChatView> {
        self.views.values()
    }

    pub fn pending(&self) -> &[PendingSend] {
        &self.pending
    }

    fn view_mut(&mut self, session_id: &str) -> &mut ChatView {
        self.views
            .entry(session_id.to_string())
            .or_insert_with(|| ChatView::new(session_id))
    }

    /// Bounds client-local state. Fingerprints live one dedup window; pending
    /// sends live as long as an echo could still match them.
    fn prune(&mut self, now: DateTime<Utc>) {
        self.seen.prune(now);
        let horizon = window_start(now, self.config.match_tolerance);
        self.pending.retain(|pending| pending.sent_at >= horizon);
    }

    /// Shows `text` immediately as an unconfirmed entry.
    pub fn begin_send(
        &mut self,
        session_id: &str,
        sender_role: SenderRole,
        draft: &str,
        now: DateTime<Utc>,
    ) -> PendingSend {
        self.prune(now);
        let local_id = format!("local-{}", Uuid::new_v4());
        let text = draft.trim().to_string();
        let view = self.view_mut(session_id);
        view.messages.push(ViewMessage {
            message: Message {
                id: local_id.clone(),
                session_id: session_id.to_string(),
                sender_role,
                text: text.clone(),
                created_at: now,
                kind: MessageKind::Plain,
                metadata: MessageMetadata::default(),
            },
            provisional: true,
            local_id: Some(local_id.clone()),
        });
        view.sort();

        let pending = PendingSend {
            local_id,
            session_id: session_id.to_string(),
            sender_role,
            text,
            draft: draft.to_string(),
            sent_at: now,
        };
        self.pending.push(pending.clone());
        pending
    }

    fn locate_provisional(&self, local_id: &str) -> Option<(String, usize)> {
        self.views.iter().find_map(|(session_id, view)| {
            view.messages
                .iter()
                .position(|entry| entry.local_id.as_deref() == Some(local_id))
                .map(|index| (session_id.clone(), index))
        })
    }

    /// Applies the synchronous result of the send started as `local_id`.
    pub fn confirm_send(&mut self, local_id: &str, result: &OperationResult, now: DateTime<Utc>) -> Vec<Change> {
        self.prune(now);
        let mut changes = Vec::new();

        if let Some((from, index)) = self.locate_provisional(local_id) {
            if from != result.session_id {
                let entry = self.view_mut(&from).messages.remove(index);
                let target = self.view_mut(&result.session_id);
                target.messages.push(entry);
                target.sort();
                if let Surface::Visitor { session_id } = &mut self.surface {
                    if *session_id == from {
                        *session_id = result.session_id.clone();
                    }
                }
                changes.push(Change::SessionChanged {
                    from,
                    to: result.session_id.clone(),
                });
            }
        }

        changes.extend(self.merge_result(result, now));

        // The server may have normalised the text beyond what matching tolerates.
        if let Some((session_id, index)) = self.locate_provisional(local_id) {
            self.view_mut(&session_id).messages.remove(index);
        }
        self.pending.retain(|pending| pending.local_id != local_id);
        changes
    }

    /// Drops the unconfirmed entry and hands the draft back to the input box.
    pub fn fail_send(&mut self, local_id: &str) -> Option<Change> {
        let pending = self
            .pending
            .iter()
            .position(|pending| pending.local_id == local_id)
            .map(|index| self.pending.remove(index));
        let provisional = self
            .locate_provisional(local_id)
            .map(|(session_id, index)| self.view_mut(&session_id).messages.remove(index));

        let draft = match (pending, provisional) {
            (Some(pending), _) => pending.draft,
            (None, Some(entry)) => entry.message.text,
            (None, None) => return None,
        };
        Some(Change::RolledBack {
            local_id: local_id.to_string(),
            draft,
        })
    }

    fn merge_message(&mut self, message: Message, now: DateTime<Utc>) -> Option<Change> {
        let tolerance = self.config.match_tolerance;
        let fingerprint = message_fingerprint(&message);
        let view = self
            .views
            .entry(message.session_id.clone())
            .or_insert_with(|| ChatView::new(&message.session_id));

        if view.contains_id(&message.id) {
            return None;
        }

        if let Some(index) = view.find_provisional(&message, tolerance) {
            let local_id = view.messages[index].local_id.clone().unwrap_or_default();
            view.messages[index] = ViewMessage::confirmed(message.clone());
            view.sort();
            self.seen.check_and_insert(&fingerprint, now);
            self.pending.retain(|pending| pending.local_id != local_id);
            return Some(Change::MessageConfirmed { local_id, message });
        }

        if !self.seen.check_and_insert(&fingerprint, now) {
            tracing::trace!(message_id = %message.id, "duplicate message fingerprint dropped");
            return None;
        }

        view.messages.push(ViewMessage::confirmed(message.clone()));
        view.sort();
        Some(Change::MessageAdded(message))
    }

    fn apply_chat(
        &mut self,
        chat: &ChatSnapshot,
        kind: Option<EventKind>,
        assignment: Option<AssignmentEvent>,
    ) -> Option<Change> {
        let view = self.view_mut(chat.session_id());
        let newer = view
            .chat
            .as_ref()
            .map_or(true, |current| chat.is_newer_than(current));
        if !newer {
            return None;
        }
        let previous = view.chat.replace(chat.clone());
        Some(Change::ChatUpdated {
            kind,
            chat: chat.clone(),
            previous,
            assignment,
        })
    }

    fn merge_result(&mut self, result: &OperationResult, now: DateTime<Utc>) -> Vec<Change> {
        let mut changes = result
            .messages
            .iter()
            .filter_map(|message| self.merge_message(message.clone(), now))
            .collect::<Vec<_>>();
        changes.extend(self.apply_chat(&result.chat, None, None));
        changes
    }

    /// Applies the result of any synchronous call made by this surface.
    pub fn apply_operation_result(&mut self, result: &OperationResult, now: DateTime<Utc>) -> Vec<Change> {
        self.prune(now);
        self.merge_result(result, now)
    }

    /// Merges one broadcast delivery. Nothing changing is reported as
    /// `DuplicateEvent`, which callers drop silently.
    pub fn apply_delivery(
        &mut self,
        delivery: &Delivery,
        visibility: Visibility,
        now: DateTime<Utc>,
    ) -> Result<Reconciled, ChatError> {
        self.prune(now);
        let envelope = &delivery.envelope;
        let mut changes = Vec::new();

        if let Some(message) = envelope.event.message() {
            changes.extend(self.merge_message(message.clone(), now));
        }
        let assignment = match &envelope.event {
            ChatEvent::ChatAssigned(p) | ChatEvent::ChatTransferred(p) | ChatEvent::ChatUnassigned(p) => {
                Some(p.assignment.clone())
            }
            _ => None,
        };
        changes.extend(self.apply_chat(envelope.event.chat(), Some(envelope.kind()), assignment));

        if changes.is_empty() {
            tracing::trace!(
                kind = envelope.kind().as_str(),
                topic = %delivery.topic,
                session_id = %envelope.session_id,
                "duplicate delivery"
            );
            return Err(ChatError::DuplicateEvent);
        }

        let chat = self
            .views
            .get(&envelope.session_id)
            .and_then(|view| view.chat.as_ref());
        let mut alerts = Vec::new();
        for change in &changes {
            if let Some(alert) = self.gate.evaluate(&self.surface, change, chat, visibility, now) {
                alerts.push(alert);
            }
        }
        Ok(Reconciled { changes, alerts })
    }

    /// Reconnect begins: keep showing what we have, flagged as syncing.
    pub fn begin_resync(&mut self, session_id: &str) {
        self.view_mut(session_id).syncing = true;
    }

    /// Merges an authoritative history with the local view. Local entries
    /// missing from the history are kept only while recent enough to still be
    /// in flight.
    pub fn complete_resync(&mut self, history: &ChatHistory, now: DateTime<Utc>) -> Vec<Change> {
        self.prune(now);
        let session_id = history.chat.session_id().to_string();
        let grace_start = window_start(now, self.config.resync_grace);
        let tolerance = self.config.match_tolerance;
        let pending_ids = self
            .pending
            .iter()
            .map(|pending| pending.local_id.clone())
            .collect::<HashSet<_>>();

        let view = self
            .views
            .entry(session_id.clone())
            .or_insert_with(|| ChatView::new(&session_id));
        let authoritative = history
            .messages
            .iter()
            .map(|message| message.id.as_str())
            .collect::<HashSet<_>>();

        let mut changes = Vec::new();
        let mut merged = history
            .messages
            .iter()
            .cloned()
            .map(ViewMessage::confirmed)
            .collect::<Vec<_>>();
        let mut claimed = HashSet::new();

        for local in view.messages.drain(..) {
            if authoritative.contains(local.message.id.as_str()) {
                continue;
            }
            if local.provisional {
                let echo = history.messages.iter().find(|message| {
                    let delta = local.message.created_at - message.created_at;
                    !claimed.contains(&message.id)
                        && message.sender_role == local.message.sender_role
                        && message.text.trim() == local.message.text.trim()
                        && delta <= tolerance
                        && delta >= -tolerance
                });
                if let Some(echo) = echo {
                    claimed.insert(echo.id.clone());
                    changes.push(Change::MessageConfirmed {
                        local_id: local.local_id.clone().unwrap_or_default(),
                        message: echo.clone(),
                    });
                    continue;
                }
                let in_flight = local
                    .local_id
                    .as_ref()
                    .is_some_and(|id| pending_ids.contains(id));
                if in_flight || local.message.created_at >= grace_start {
                    merged.push(local);
                }
            } else if local.message.created_at >= grace_start {
                merged.push(local);
            }
        }

        view.messages = merged;
        view.sort();
        view.syncing = false;

        for change in &changes {
            if let Change::MessageConfirmed { local_id, .. } = change {
                self.pending.retain(|pending| &pending.local_id != local_id);
            }
        }
        changes.extend(self.apply_chat(&history.chat, None, None));
        changes.push(Change::Resynced { session_id });
        changes
    }

    /// Seeds a view from the local cache. The view stays `syncing` until an
    /// authoritative history is merged.
    pub fn restore_cached(&mut self, cached: CachedView) -> Change {
        let view = self.view_mut(&cached.session_id);
        for message in cached.messages {
            if !view.contains_id(&message.id) {
                view.messages.push(ViewMessage::confirmed(message));
            }
        }
        view.sort();
        view.syncing = true;
        if let Some(chat) = cached.chat {
            let newer = view
                .chat
                .as_ref()
                .map_or(true, |current| chat.is_newer_than(current));
            if newer {
                view.chat = Some(chat);
            }
        }
        Change::Restored {
            session_id: cached.session_id,
        }
    }

    /// Confirmed messages only, most recent `cache_limit`.
    pub fn cache(&self, session_id: &str, now: DateTime<Utc>) -> Option<CachedView> {
        let view = self.views.get(session_id)?;
        let confirmed = view.confirmed().cloned().collect::<Vec<_>>();
        let skip = confirmed.len().saturating_sub(self.config.cache_limit);
        Some(CachedView {
            session_id: session_id.to_string(),
            messages: confirmed.into_iter().skip(skip).collect(),
            chat: view.chat.clone(),
            saved_at: now,
        })
    }
}
