//! Broadcast topics and the typed event envelope.
//!
//! Every payload carries the full chat snapshot it applies to, so a consumer
//! can replace its local sub-state instead of patching it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{AssignmentEvent, ChatSnapshot, ChatStatus, EscalationPrompt, Message};

const ACTIVE_CHATS: &str = "chats:active";

/// Named publish/subscribe channel. Names are a pure function of ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Visitor and owning agent of one chat.
    Chat(String),
    /// Every agent and admin dashboard.
    ActiveChats,
    /// Direct notifications for one agent.
    Agent(String),
}

impl Topic {
    pub fn chat(session_id: impl Into<String>) -> Self {
        Topic::Chat(session_id.into())
    }

    pub fn agent(agent_id: impl Into<String>) -> Self {
        Topic::Agent(agent_id.into())
    }

    pub fn name(&self) -> String {
        match self {
            Topic::Chat(id) => format!("chat:{id}"),
            Topic::ActiveChats => ACTIVE_CHATS.to_string(),
            Topic::Agent(id) => format!("agent:{id}"),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        if name == ACTIVE_CHATS {
            return Some(Topic::ActiveChats);
        }
        let (prefix, id) = name.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match prefix {
            "chat" => Some(Topic::Chat(id.to_string())),
            "agent" => Some(Topic::Agent(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown topic {raw}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "message.received")]
    MessageReceived,
    #[serde(rename = "chat.assigned")]
    ChatAssigned,
    #[serde(rename = "chat.transferred")]
    ChatTransferred,
    #[serde(rename = "chat.unassigned")]
    ChatUnassigned,
    #[serde(rename = "chat.status.changed")]
    StatusChanged,
    #[serde(rename = "chat.ended")]
    ChatEnded,
    #[serde(rename = "escalation.prompt.sent")]
    PromptSent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message.received",
            EventKind::ChatAssigned => "chat.assigned",
            EventKind::ChatTransferred => "chat.transferred",
            EventKind::ChatUnassigned => "chat.unassigned",
            EventKind::StatusChanged => "chat.status.changed",
            EventKind::ChatEnded => "chat.ended",
            EventKind::PromptSent => "escalation.prompt.sent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message: Message,
    pub chat: ChatSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPayload {
    pub chat: ChatSnapshot,
    pub assignment: AssignmentEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub chat: ChatSnapshot,
    pub previous_status: ChatStatus,
    /// Owner right before the change, when the change released it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    pub chat: ChatSnapshot,
    pub prompt: EscalationPrompt,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum ChatEvent {
    #[serde(rename = "message.received")]
    MessageReceived(MessagePayload),
    #[serde(rename = "chat.assigned")]
    ChatAssigned(AssignmentPayload),
    #[serde(rename = "chat.transferred")]
    ChatTransferred(AssignmentPayload),
    #[serde(rename = "chat.unassigned")]
    ChatUnassigned(AssignmentPayload),
    #[serde(rename = "chat.status.changed")]
    StatusChanged(StatusPayload),
    #[serde(rename = "chat.ended")]
    ChatEnded(StatusPayload),
    #[serde(rename = "escalation.prompt.sent")]
    PromptSent(PromptPayload),
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::MessageReceived(_) => EventKind::MessageReceived,
            ChatEvent::ChatAssigned(_) => EventKind::ChatAssigned,
            ChatEvent::ChatTransferred(_) => EventKind::ChatTransferred,
            ChatEvent::ChatUnassigned(_) => EventKind::ChatUnassigned,
            ChatEvent::StatusChanged(_) => EventKind::StatusChanged,
            ChatEvent::ChatEnded(_) => EventKind::ChatEnded,
            ChatEvent::PromptSent(_) => EventKind::PromptSent,
        }
    }

    pub fn chat(&self) -> &ChatSnapshot {
        match self {
            ChatEvent::MessageReceived(p) => &p.chat,
            ChatEvent::ChatAssigned(p) | ChatEvent::ChatTransferred(p) | ChatEvent::ChatUnassigned(p) => {
                &p.chat
            }
            ChatEvent::StatusChanged(p) | ChatEvent::ChatEnded(p) => &p.chat,
            ChatEvent::PromptSent(p) => &p.chat,
        }
    }

    /// The message this event introduces into the stream, if any.
    pub fn message(&self) -> Option<&Message> {
        match self {
            ChatEvent::MessageReceived(p) => Some(&p.message),
            ChatEvent::PromptSent(p) => Some(&p.message),
            _ => None,
        }
    }
}

/// `{ kind, chatId, sessionId, occurredAt, revision, payload }` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub chat_id: i64,
    pub session_id: String,
    pub occurred_at: DateTime<Utc>,
    pub revision: u64,
    #[serde(flatten)]
    pub event: ChatEvent,
}

impl EventEnvelope {
    pub fn new(event: ChatEvent) -> Self {
        let session = &event.chat().session;
        Self {
            chat_id: session.id,
            session_id: session.session_id.clone(),
            occurred_at: session.updated_at,
            revision: session.revision,
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Every topic this envelope is published to.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::chat(&self.session_id), Topic::ActiveChats];
        let mut push_agent = |agent: Option<&String>| {
            if let Some(agent) = agent {
                let topic = Topic::agent(agent.as_str());
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        };
        match &self.event {
            ChatEvent::ChatAssigned(p) => push_agent(p.assignment.to_agent.as_ref()),
            ChatEvent::ChatTransferred(p) => {
                push_agent(p.assignment.from_agent.as_ref());
                push_agent(p.assignment.to_agent.as_ref());
            }
            ChatEvent::ChatUnassigned(p) => push_agent(p.assignment.from_agent.as_ref()),
            ChatEvent::ChatEnded(p) => push_agent(p.previous_agent.as_ref()),
            _ => {}
        }
        topics
    }
}
