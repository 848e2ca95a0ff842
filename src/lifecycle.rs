//! Conversation status graph.
//!
//! ```text
//! bot ──escalate──▶ waiting_human ──assign──▶ assigned ──close──▶ closed
//!  │                      ▲                    │  ▲ │               │
//!  └──────assign──────────┼────────────────────┘  └─┘ transfer      │
//!                         └──────unassign──────┘                    │
//! bot ◀──────────────────────reactivate─────────────────────────────┘
//! ```
//!
//! Every status change goes through [`apply`]; there is no other writer of
//! `ChatSession::status`.

use crate::error::ChatError;
use crate::types::{ChatSession, ChatStatus, ClosedBy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Escalate,
    Assign,
    Transfer,
    Unassign,
    Close(ClosedBy),
    Reactivate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Escalate => "escalate",
            Transition::Assign => "assign",
            Transition::Transfer => "transfer",
            Transition::Unassign => "unassign",
            Transition::Close(_) => "close",
            Transition::Reactivate => "reactivate",
        }
    }

    /// Target status when applied from `from`, or `None` if the edge does not exist.
    pub fn target(&self, from: ChatStatus) -> Option<ChatStatus> {
        use ChatStatus::*;
        match (self, from) {
            (Transition::Escalate, Bot) => Some(WaitingHuman),
            (Transition::Assign, Bot | WaitingHuman) => Some(Assigned),
            (Transition::Transfer, Assigned) => Some(Assigned),
            (Transition::Unassign, Assigned) => Some(WaitingHuman),
            (Transition::Close(_), Bot | WaitingHuman | Assigned) => Some(Closed),
            (Transition::Reactivate, Closed) => Some(Bot),
            _ => None,
        }
    }
}

pub fn can_transition(from: ChatStatus, to: ChatStatus) -> bool {
    use ChatStatus::*;
    matches!(
        (from, to),
        (Bot, WaitingHuman)
            | (Bot, Assigned)
            | (Bot, Closed)
            | (WaitingHuman, Assigned)
            | (WaitingHuman, Closed)
            | (Assigned, Assigned)
            | (Assigned, WaitingHuman)
            | (Assigned, Closed)
            | (Closed, Bot)
    )
}

/// Applies `transition` and returns the previous status. Ownership fields are
/// cleared whenever the target status cannot carry an owner.
pub fn apply(session: &mut ChatSession, transition: Transition) -> Result<ChatStatus, ChatError> {
    let from = session.status;
    let to = transition
        .target(from)
        .ok_or(ChatError::InvalidTransition {
            from,
            transition: transition.name(),
        })?;
    debug_assert!(can_transition(from, to));

    session.status = to;
    if to != ChatStatus::Assigned {
        session.assigned_agent = None;
        session.assigned_agent_name = None;
        session.assigned_at = None;
    }
    match transition {
        Transition::Close(by) => session.closed_by = Some(by),
        Transition::Reactivate => {
            session.closed_by = None;
            session.close_reason = None;
        }
        _ => {}
    }

    Ok(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;
    use chrono::Utc;

    fn session(status: ChatStatus) -> ChatSession {
        let mut session = ChatSession::new(1, "s-1".into(), "v-1".into(), Channel::Web, Utc::now());
        session.status = status;
        session
    }

    #[test]
    fn closed_cannot_jump_to_assigned() {
        let mut s = session(ChatStatus::Closed);
        let err = apply(&mut s, Transition::Assign).unwrap_err();
        assert!(matches!(
            err,
            ChatError::InvalidTransition {
                from: ChatStatus::Closed,
                transition: "assign"
            }
        ));
        assert_eq!(s.status, ChatStatus::Closed);
        assert!(!can_transition(ChatStatus::Closed, ChatStatus::Assigned));
    }

    #[test]
    fn unassign_clears_owner() {
        let mut s = session(ChatStatus::Assigned);
        s.assigned_agent = Some("a".into());
        s.assigned_agent_name = Some("Anna".into());
        s.assigned_at = Some(Utc::now());

        let previous = apply(&mut s, Transition::Unassign).unwrap();
        assert_eq!(previous, ChatStatus::Assigned);
        assert_eq!(s.status, ChatStatus::WaitingHuman);
        assert!(s.assigned_agent.is_none());
        assert!(s.assigned_at.is_none());
    }

    #[test]
    fn close_then_reactivate_returns_to_bot() {
        let mut s = session(ChatStatus::Bot);
        apply(&mut s, Transition::Close(ClosedBy::Visitor)).unwrap();
        assert_eq!(s.closed_by, Some(ClosedBy::Visitor));

        apply(&mut s, Transition::Reactivate).unwrap();
        assert_eq!(s.status, ChatStatus::Bot);
        assert!(s.closed_by.is_none());
    }

    #[test]
    fn every_declared_edge_is_reachable_by_some_transition() {
        use ChatStatus::*;
        let transitions = [
            Transition::Escalate,
            Transition::Assign,
            Transition::Transfer,
            Transition::Unassign,
            Transition::Close(ClosedBy::Agent),
            Transition::Reactivate,
        ];
        for from in [Bot, WaitingHuman, Assigned, Closed] {
            for to in [Bot, WaitingHuman, Assigned, Closed] {
                let reachable = transitions.iter().any(|t| t.target(from) == Some(to));
                assert_eq!(reachable, can_transition(from, to), "{from} -> {to}");
            }
        }
    }
}
