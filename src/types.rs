use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Bot,
    WaitingHuman,
    Assigned,
    Closed,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Bot => "bot",
            ChatStatus::WaitingHuman => "waiting_human",
            ChatStatus::Assigned => "assigned",
            ChatStatus::Closed => "closed",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, ChatStatus::Closed)
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedBy {
    Visitor,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Web,
    Messaging,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Messaging => "messaging",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: i64,
    pub session_id: String,
    pub visitor_id: String,
    pub status: ChatStatus,
    #[serde(default)]
    pub closed_by: Option<ClosedBy>,
    #[serde(default)]
    pub close_reason: Option<String>,
    pub channel: Channel,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub assigned_agent_name: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    pub transfer_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Bumped on every committed mutation; orders snapshots sharing a timestamp.
    pub revision: u64,
}

impl ChatSession {
    pub fn new(id: i64, session_id: String, visitor_id: String, channel: Channel, now: DateTime<Utc>) -> Self {
        Self {
            id,
            session_id,
            visitor_id,
            status: ChatStatus::Bot,
            closed_by: None,
            close_reason: None,
            channel,
            assigned_agent: None,
            assigned_agent_name: None,
            assigned_at: None,
            transfer_count: 0,
            created_at: now,
            updated_at: now,
            last_activity: now,
            revision: 1,
        }
    }

    pub fn version(&self) -> (DateTime<Utc>, u64) {
        (self.updated_at, self.revision)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Visitor,
    Bot,
    Agent,
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Visitor => "visitor",
            SenderRole::Bot => "bot",
            SenderRole::Agent => "agent",
            SenderRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Plain,
    EscalationPrompt,
    EscalationResponse,
    SystemNotice,
    Attachment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    pub url: String,
    pub file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentDescriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender_role: SenderRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Sent,
    Accepted,
    Declined,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTrigger {
    Automatic,
    Manual,
}

/// Why a human was offered. The first five come from bot-side classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Unanswerable,
    Frustration,
    ExplicitRequest,
    RepeatedQuestion,
    RiskUncertainty,
    AgentInitiated,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::Unanswerable => "unanswerable",
            EscalationReason::Frustration => "frustration",
            EscalationReason::ExplicitRequest => "explicit_request",
            EscalationReason::RepeatedQuestion => "repeated_question",
            EscalationReason::RiskUncertainty => "risk_uncertainty",
            EscalationReason::AgentInitiated => "agent_initiated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationPrompt {
    pub id: String,
    pub session_id: String,
    pub status: PromptStatus,
    pub trigger: PromptTrigger,
    pub reason: EscalationReason,
    #[serde(default)]
    pub sent_by: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptAnswer {
    Accept,
    Decline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    Assigned,
    Transferred,
    Unassigned,
}

/// Append-only ownership log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEvent {
    pub id: String,
    pub session_id: String,
    pub kind: AssignmentKind,
    #[serde(default)]
    pub from_agent: Option<String>,
    #[serde(default)]
    pub to_agent: Option<String>,
    pub actor: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Full client-replaceable state of one chat: session fields plus escalation sub-state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub session: ChatSession,
    #[serde(default)]
    pub escalation: Option<EscalationPrompt>,
}

impl ChatSnapshot {
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn is_newer_than(&self, other: &ChatSnapshot) -> bool {
        self.session.version() > other.session.version()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub chat: ChatSnapshot,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentStatus {
    pub session_id: String,
    pub status: ChatStatus,
    pub assigned_agent: Option<String>,
    pub assigned_agent_name: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub transfer_count: u32,
    pub revision: u64,
}

impl From<&ChatSession> for AssignmentStatus {
    fn from(session: &ChatSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            assigned_agent: session.assigned_agent.clone(),
            assigned_agent_name: session.assigned_agent_name.clone(),
            assigned_at: session.assigned_at,
            transfer_count: session.transfer_count,
            revision: session.revision,
        }
    }
}

/// Post-mutation fields returned by every synchronous operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub session_id: String,
    pub status: ChatStatus,
    pub assigned_agent: Option<String>,
    pub assigned_agent_name: Option<String>,
    pub messages: Vec<Message>,
    pub chat: ChatSnapshot,
}

impl OperationResult {
    pub fn new(chat: ChatSnapshot, messages: Vec<Message>) -> Self {
        Self {
            session_id: chat.session.session_id.clone(),
            status: chat.session.status,
            assigned_agent: chat.session.assigned_agent.clone(),
            assigned_agent_name: chat.session.assigned_agent_name.clone(),
            messages,
            chat,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub chat: ChatSnapshot,
    pub last_message: Option<Message>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[default]
    Agent,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: AgentRole,
}

impl AgentProfile {
    pub fn is_admin(&self) -> bool {
        self.role == AgentRole::Admin
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub sender: Option<SenderRole>,
    pub text: String,
    #[serde(default)]
    pub escalation_hint: Option<EscalationReason>,
    #[serde(default)]
    pub attachment: Option<AttachmentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageBody {
    pub text: String,
    #[serde(default)]
    pub attachment: Option<AttachmentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondBody {
    pub answer: PromptAnswer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub to_agent_id: String,
    #[serde(default)]
    pub from_agent_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
