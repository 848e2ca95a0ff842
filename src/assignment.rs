use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::ChatError;
use crate::lifecycle::{self, Transition};
use crate::notices::{self, Notice};
use crate::store::{ChatRecord, ChatStateStore};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct AssignmentOutcome {
    pub chat: ChatSnapshot,
    pub event: AssignmentEvent,
    pub notice: Message,
    pub previous_status: ChatStatus,
    /// Owner before the change; kept for routing notifications only.
    pub previous_agent: Option<String>,
}

fn ensure_open(record: &ChatRecord) -> Result<(), ChatError> {
    if record.session.status == ChatStatus::Closed {
        return Err(ChatError::SessionClosed);
    }
    Ok(())
}

fn current(record: &ChatRecord) -> AssignmentStatus {
    AssignmentStatus::from(&record.session)
}

/// Check-and-set under the chat lock: only an unowned chat can be assigned.
pub fn assign_record(
    record: &mut ChatRecord,
    agent: &AgentProfile,
    actor: &AgentProfile,
    now: DateTime<Utc>,
) -> Result<AssignmentOutcome, ChatError> {
    ensure_open(record)?;
    if record.session.assigned_agent.is_some() {
        return Err(ChatError::AlreadyAssigned {
            current: current(record),
        });
    }

    let previous_status = lifecycle::apply(&mut record.session, Transition::Assign)?;
    let event = record.record_assignment(
        AssignmentKind::Assigned,
        None,
        Some(agent.id.clone()),
        &actor.id,
        "",
        now,
    );
    record.session.assigned_agent = Some(agent.id.clone());
    record.session.assigned_agent_name = Some(agent.name.clone());
    record.session.assigned_at = Some(event.occurred_at);

    let notice = record.push_notice(
        notices::render(&Notice::Assigned {
            actor: &actor.name,
            agent: &agent.name,
        }),
        now,
    );

    tracing::info!(
        session_id = %record.session.session_id,
        agent_id = %agent.id,
        actor = %actor.id,
        "chat assigned"
    );

    Ok(AssignmentOutcome {
        chat: record.snapshot(),
        event,
        notice,
        previous_status,
        previous_agent: None,
    })
}

/// Moves ownership from `from_agent` to `to`. Fails with `NotOwner` when the
/// chat has changed hands since the caller last looked.
pub fn transfer_record(
    record: &mut ChatRecord,
    from_agent: &str,
    to: &AgentProfile,
    actor: &AgentProfile,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<AssignmentOutcome, ChatError> {
    ensure_open(record)?;
    if record.session.assigned_agent.as_deref() != Some(from_agent) {
        return Err(ChatError::NotOwner {
            current: current(record),
        });
    }
    if from_agent == to.id {
        return Err(ChatError::InvalidTransition {
            from: record.session.status,
            transition: "self-transfer",
        });
    }

    let from_name = record
        .session
        .assigned_agent_name
        .clone()
        .unwrap_or_else(|| from_agent.to_string());
    let previous_status = lifecycle::apply(&mut record.session, Transition::Transfer)?;
    let event = record.record_assignment(
        AssignmentKind::Transferred,
        Some(from_agent.to_string()),
        Some(to.id.clone()),
        &actor.id,
        reason.trim(),
        now,
    );
    record.session.assigned_agent = Some(to.id.clone());
    record.session.assigned_agent_name = Some(to.name.clone());
    record.session.assigned_at = Some(event.occurred_at);
    record.session.transfer_count += 1;

    let notice = record.push_notice(
        notices::render(&Notice::Transferred {
            from: &from_name,
            to: &to.name,
            reason,
        }),
        now,
    );

    tracing::info!(
        session_id = %record.session.session_id,
        from_agent = %from_agent,
        to_agent = %to.id,
        transfer_count = record.session.transfer_count,
        "chat transferred"
    );

    Ok(AssignmentOutcome {
        chat: record.snapshot(),
        event,
        notice,
        previous_status,
        previous_agent: Some(from_agent.to_string()),
    })
}

/// Returns the chat to the waiting queue. The owner or an admin may do this.
pub fn unassign_record(
    record: &mut ChatRecord,
    actor: &AgentProfile,
    now: DateTime<Utc>,
) -> Result<AssignmentOutcome, ChatError> {
    ensure_open(record)?;
    let previous_agent = record.session.assigned_agent.clone();
    let previous_name = record.session.assigned_agent_name.clone();

    let previous_status = lifecycle::apply(&mut record.session, Transition::Unassign)?;
    let event = record.record_assignment(
        AssignmentKind::Unassigned,
        previous_agent.clone(),
        None,
        &actor.id,
        "",
        now,
    );
    let notice = record.push_notice(
        notices::render(&Notice::Unassigned {
            actor: &actor.name,
            previous: previous_name.as_deref().filter(|name| *name != actor.name),
        }),
        now,
    );

    tracing::info!(
        session_id = %record.session.session_id,
        previous_agent = ?previous_agent,
        actor = %actor.id,
        "chat unassigned"
    );

    Ok(AssignmentOutcome {
        chat: record.snapshot(),
        event,
        notice,
        previous_status,
        previous_agent,
    })
}

/// Enforces the single-owner invariant. Every operation runs inside the
/// chat's lock, so operations on one chat are atomic with respect to each
/// other while different chats proceed in parallel.
#[derive(Clone)]
pub struct AssignmentCoordinator {
    store: Arc<ChatStateStore>,
}

impl AssignmentCoordinator {
    pub fn new(store: Arc<ChatStateStore>) -> Self {
        Self { store }
    }

    pub async fn assign(
        &self,
        session_id: &str,
        agent: &AgentProfile,
        actor: &AgentProfile,
        now: DateTime<Utc>,
    ) -> Result<AssignmentOutcome, ChatError> {
        self.store
            .with_chat(session_id, |record| assign_record(record, agent, actor, now))
            .await
    }

    pub async fn transfer(
        &self,
        session_id: &str,
        from_agent: &str,
        to: &AgentProfile,
        actor: &AgentProfile,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignmentOutcome, ChatError> {
        self.store
            .with_chat(session_id, |record| {
                transfer_record(record, from_agent, to, actor, reason, now)
            })
            .await
    }

    pub async fn unassign(
        &self,
        session_id: &str,
        actor: &AgentProfile,
        now: DateTime<Utc>,
    ) -> Result<AssignmentOutcome, ChatError> {
        self.store
            .with_chat(session_id, |record| unassign_record(record, actor, now))
            .await
    }

    pub async fn status(&self, session_id: &str) -> Result<AssignmentStatus, ChatError> {
        self.store
            .read(session_id, |record| AssignmentStatus::from(&record.session))
            .await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<AssignmentEvent>, ChatError> {
        self.store
            .read(session_id, |record| record.assignments.clone())
            .await
    }
}
