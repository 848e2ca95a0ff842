use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::client::dedup::{message_fingerprint, FingerprintCache};
use crate::client::reconciler::{Change, Surface};
use crate::events::EventKind;
use crate::types::*;

const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NewMessage,
    AgentJoined,
    AssignedToYou,
    TransferredIn,
    TransferredOut,
    WaitingHuman,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::NewMessage => "new_message",
            AlertKind::AgentJoined => "agent_joined",
            AlertKind::AssignedToYou => "assigned_to_you",
            AlertKind::TransferredIn => "transferred_in",
            AlertKind::TransferredOut => "transferred_out",
            AlertKind::WaitingHuman => "waiting_human",
        }
    }

    /// A transfer needs a different agent to act, so it alerts even on a
    /// focused surface.
    pub fn always_alert(&self) -> bool {
        matches!(self, AlertKind::TransferredIn | AlertKind::TransferredOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub session_id: String,
    pub title: String,
    pub body: String,
    pub sound: bool,
    /// Show an OS-level notification, not just an in-page badge.
    pub system: bool,
}

struct Candidate {
    kind: AlertKind,
    discriminator: String,
    title: String,
    body: String,
}

/// Decides whether a reconciled change should make noise.
pub struct NotificationGate {
    recent: FingerprintCache,
}

impl NotificationGate {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            recent: FingerprintCache::new(window),
        }
    }

    pub fn evaluate(
        &mut self,
        surface: &Surface,
        change: &Change,
        chat: Option<&ChatSnapshot>,
        visibility: Visibility,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let (session_id, candidate) = classify(surface, change, chat)?;
        let always = candidate.kind.always_alert();
        if visibility == Visibility::Visible && !always {
            return None;
        }

        let fingerprint = format!(
            "{}|{}|{}",
            candidate.kind.as_str(),
            session_id,
            candidate.discriminator
        );
        if !self.recent.check_and_insert(&fingerprint, now) {
            tracing::trace!(%fingerprint, "alert collapsed");
            return None;
        }

        Some(Alert {
            kind: candidate.kind,
            session_id,
            title: candidate.title,
            body: candidate.body,
            sound: true,
            system: visibility == Visibility::Hidden || always,
        })
    }
}

fn classify(surface: &Surface, change: &Change, chat: Option<&ChatSnapshot>) -> Option<(String, Candidate)> {
    match change {
        Change::MessageAdded(message) => {
            let candidate = message_alert(surface, message, chat)?;
            Some((message.session_id.clone(), candidate))
        }
        Change::ChatUpdated {
            kind,
            chat,
            previous,
            assignment,
        } => {
            let candidate = chat_alert(surface, *kind, chat, previous.as_ref(), assignment.as_ref())?;
            Some((chat.session_id().to_string(), candidate))
        }
        _ => None,
    }
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn message_alert(surface: &Surface, message: &Message, chat: Option<&ChatSnapshot>) -> Option<Candidate> {
    let status = chat.map(|chat| chat.session.status);
    let owner = chat.and_then(|chat| chat.session.assigned_agent.as_deref());

    let wanted = match surface {
        Surface::Visitor { .. } => matches!(message.sender_role, SenderRole::Agent | SenderRole::Bot),
        Surface::Agent { agent_id } => {
            message.sender_role == SenderRole::Visitor
                && (owner == Some(agent_id.as_str()) || status == Some(ChatStatus::WaitingHuman))
        }
        Surface::Admin => {
            message.sender_role == SenderRole::Visitor && status == Some(ChatStatus::WaitingHuman)
        }
    };
    if !wanted {
        return None;
    }

    let title = match (message.sender_role, message.metadata.agent_name.as_deref()) {
        (SenderRole::Agent, Some(name)) => name.to_string(),
        (SenderRole::Visitor, _) => "New visitor message".to_string(),
        _ => "New message".to_string(),
    };
    Some(Candidate {
        kind: AlertKind::NewMessage,
        discriminator: message_fingerprint(message),
        title,
        body: preview(&message.text),
    })
}

fn chat_alert(
    surface: &Surface,
    kind: Option<EventKind>,
    chat: &ChatSnapshot,
    previous: Option<&ChatSnapshot>,
    assignment: Option<&AssignmentEvent>,
) -> Option<Candidate> {
    let session = &chat.session;
    let previous_owner = previous.and_then(|prev| prev.session.assigned_agent.as_deref());
    let owner = session.assigned_agent.as_deref();

    match surface {
        Surface::Visitor { .. } => {
            let joined = session.status == ChatStatus::Assigned
                && owner.is_some()
                && owner != previous_owner
                && (previous.is_some() || matches!(kind, Some(EventKind::ChatAssigned | EventKind::ChatTransferred)));
            joined.then(|| Candidate {
                kind: AlertKind::AgentJoined,
                discriminator: owner.unwrap_or_default().to_string(),
                title: format!(
                    "{} joined the conversation",
                    session.assigned_agent_name.as_deref().unwrap_or("An agent")
                ),
                body: String::new(),
            })
        }
        Surface::Agent { agent_id } => {
            let me = agent_id.as_str();
            if let Some(candidate) = transfer_alert(me, kind, chat, previous, assignment) {
                return Some(candidate);
            }

            let self_assigned = assignment.is_some_and(|event| event.actor == me);
            let assigned_to_me = owner == Some(me)
                && previous_owner != Some(me)
                && !self_assigned
                && (previous.is_some() || kind == Some(EventKind::ChatAssigned));
            if assigned_to_me {
                return Some(Candidate {
                    kind: AlertKind::AssignedToYou,
                    discriminator: session.assigned_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
                    title: "Chat assigned to you".to_string(),
                    body: format!("Conversation {}", session.session_id),
                });
            }
            waiting_alert(kind, chat, previous)
        }
        Surface::Admin => waiting_alert(kind, chat, previous),
    }
}

/// A transfer involving `me` is spotted either from the assignment payload or
/// from `transfer_count` moving between two held snapshots.
fn transfer_alert(
    me: &str,
    kind: Option<EventKind>,
    chat: &ChatSnapshot,
    previous: Option<&ChatSnapshot>,
    assignment: Option<&AssignmentEvent>,
) -> Option<Candidate> {
    let session = &chat.session;
    let (from, to) = match assignment {
        Some(event) if kind == Some(EventKind::ChatTransferred) => {
            (event.from_agent.as_deref(), event.to_agent.as_deref())
        }
        _ => {
            let prev = previous?;
            if session.transfer_count <= prev.session.transfer_count {
                return None;
            }
            (prev.session.assigned_agent.as_deref(), session.assigned_agent.as_deref())
        }
    };

    let (alert_kind, title) = if to == Some(me) {
        (AlertKind::TransferredIn, "Chat transferred to you")
    } else if from == Some(me) {
        (AlertKind::TransferredOut, "Chat transferred away")
    } else {
        return None;
    };
    let body = match assignment.map(|event| event.reason.trim()).filter(|reason| !reason.is_empty()) {
        Some(reason) => reason.to_string(),
        None => format!("Conversation {}", session.session_id),
    };
    Some(Candidate {
        kind: alert_kind,
        discriminator: session.transfer_count.to_string(),
        title: title.to_string(),
        body,
    })
}

fn waiting_alert(kind: Option<EventKind>, chat: &ChatSnapshot, previous: Option<&ChatSnapshot>) -> Option<Candidate> {
    let session = &chat.session;
    if session.status != ChatStatus::WaitingHuman {
        return None;
    }
    let entered = match previous {
        Some(prev) => prev.session.status != ChatStatus::WaitingHuman,
        None => matches!(kind, Some(EventKind::StatusChanged | EventKind::ChatUnassigned)),
    };
    entered.then(|| Candidate {
        kind: AlertKind::WaitingHuman,
        discriminator: String::new(),
        title: "Visitor waiting for an agent".to_string(),
        body: format!("Conversation {}", session.session_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: ChatStatus, owner: Option<&str>, transfers: u32, revision: u64) -> ChatSnapshot {
        let mut session = ChatSession::new(1, "s".into(), "v".into(), Channel::Web, Utc::now());
        session.status = status;
        session.assigned_agent = owner.map(str::to_string);
        session.assigned_agent_name = owner.map(|id| id.to_uppercase());
        session.transfer_count = transfers;
        session.revision = revision;
        ChatSnapshot {
            session,
            escalation: None,
        }
    }

    fn visitor_message(text: &str) -> Message {
        Message {
            id: "m1".into(),
            session_id: "s".into(),
            sender_role: SenderRole::Visitor,
            text: text.into(),
            created_at: Utc::now(),
            kind: MessageKind::Plain,
            metadata: MessageMetadata::default(),
        }
    }

    fn agent(id: &str) -> Surface {
        Surface::Agent { agent_id: id.into() }
    }

    #[test]
    fn visible_surface_is_silent_except_for_transfers() {
        let mut gate = NotificationGate::new(ChronoDuration::seconds(3));
        let now = Utc::now();
        let chat = snapshot(ChatStatus::Assigned, Some("a"), 0, 3);
        let message = Change::MessageAdded(visitor_message("hello?"));
        assert!(gate
            .evaluate(&agent("a"), &message, Some(&chat), Visibility::Visible, now)
            .is_none());

        let transfer = Change::ChatUpdated {
            kind: Some(EventKind::ChatTransferred),
            chat: snapshot(ChatStatus::Assigned, Some("b"), 1, 4),
            previous: Some(chat),
            assignment: None,
        };
        let alert = gate
            .evaluate(&agent("b"), &transfer, None, Visibility::Visible, now)
            .unwrap();
        assert_eq!(alert.kind, AlertKind::TransferredIn);
        assert!(alert.system);

        let alert = gate
            .evaluate(&agent("a"), &transfer, None, Visibility::Visible, now)
            .unwrap();
        assert_eq!(alert.kind, AlertKind::TransferredOut);
    }

    #[test]
    fn repeats_inside_window_collapse() {
        let mut gate = NotificationGate::new(ChronoDuration::seconds(3));
        let now = Utc::now();
        let chat = snapshot(ChatStatus::Assigned, Some("a"), 0, 3);
        let message = Change::MessageAdded(visitor_message("anyone there"));

        assert!(gate
            .evaluate(&agent("a"), &message, Some(&chat), Visibility::Hidden, now)
            .is_some());
        assert!(gate
            .evaluate(&agent("a"), &message, Some(&chat), Visibility::Hidden, now)
            .is_none());
        assert!(gate
            .evaluate(
                &agent("a"),
                &message,
                Some(&chat),
                Visibility::Hidden,
                now + ChronoDuration::seconds(4)
            )
            .is_some());
    }

    #[test]
    fn agents_only_hear_their_own_or_waiting_chats() {
        let mut gate = NotificationGate::new(ChronoDuration::seconds(3));
        let now = Utc::now();
        let owned_by_a = snapshot(ChatStatus::Assigned, Some("a"), 0, 3);
        let message = Change::MessageAdded(visitor_message("hi"));
        assert!(gate
            .evaluate(&agent("b"), &message, Some(&owned_by_a), Visibility::Hidden, now)
            .is_none());
        assert!(gate
            .evaluate(&Surface::Admin, &message, Some(&owned_by_a), Visibility::Hidden, now)
            .is_none());

        let waiting = snapshot(ChatStatus::WaitingHuman, None, 0, 3);
        assert!(gate
            .evaluate(&agent("b"), &message, Some(&waiting), Visibility::Hidden, now)
            .is_some());
    }

    #[test]
    fn entering_waiting_alerts_admins_once() {
        let mut gate = NotificationGate::new(ChronoDuration::seconds(3));
        let now = Utc::now();
        let change = Change::ChatUpdated {
            kind: Some(EventKind::StatusChanged),
            chat: snapshot(ChatStatus::WaitingHuman, None, 0, 3),
            previous: Some(snapshot(ChatStatus::Bot, None, 0, 2)),
            assignment: None,
        };
        let alert = gate
            .evaluate(&Surface::Admin, &change, None, Visibility::Hidden, now)
            .unwrap();
        assert_eq!(alert.kind, AlertKind::WaitingHuman);

        let again = Change::ChatUpdated {
            kind: Some(EventKind::MessageReceived),
            chat: snapshot(ChatStatus::WaitingHuman, None, 0, 4),
            previous: Some(snapshot(ChatStatus::WaitingHuman, None, 0, 3)),
            assignment: None,
        };
        assert!(gate
            .evaluate(&Surface::Admin, &again, None, Visibility::Hidden, now)
            .is_none());
    }

    #[test]
    fn visitor_hears_agent_join() {
        let mut gate = NotificationGate::new(ChronoDuration::seconds(3));
        let change = Change::ChatUpdated {
            kind: Some(EventKind::ChatAssigned),
            chat: snapshot(ChatStatus::Assigned, Some("a"), 0, 3),
            previous: Some(snapshot(ChatStatus::WaitingHuman, None, 0, 2)),
            assignment: None,
        };
        let surface = Surface::Visitor {
            session_id: "s".into(),
        };
        let alert = gate
            .evaluate(&surface, &change, None, Visibility::Hidden, Utc::now())
            .unwrap();
        assert_eq!(alert.kind, AlertKind::AgentJoined);
        assert_eq!(alert.title, "A joined the conversation");
    }

    #[test]
    fn long_messages_are_previewed() {
        let text = "x".repeat(300);
        let body = preview(&text);
        assert_eq!(body.chars().count(), PREVIEW_CHARS + 1);
        assert!(body.ends_with('…'));
    }
}
