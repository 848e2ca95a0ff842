use minijinja::{context, Environment};

use crate::types::{ClosedBy, EscalationReason};

const SYSTEM_NOTICE_TEMPLATE: &str = include_str!("notices/system_notice.j2");

/// System-authored lines appended to a conversation.
#[derive(Debug, Clone, Copy)]
pub enum Notice<'a> {
    PleaseWait,
    Resumed,
    Assigned {
        actor: &'a str,
        agent: &'a str,
    },
    Transferred {
        from: &'a str,
        to: &'a str,
        reason: &'a str,
    },
    Unassigned {
        actor: &'a str,
        previous: Option<&'a str>,
    },
    Closed {
        by: ClosedBy,
        reason: Option<&'a str>,
    },
    EscalationOffer {
        reason: EscalationReason,
    },
}

impl Notice<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Notice::PleaseWait => "please_wait",
            Notice::Resumed => "resumed",
            Notice::Assigned { .. } => "assigned",
            Notice::Transferred { .. } => "transferred",
            Notice::Unassigned { .. } => "unassigned",
            Notice::Closed { .. } => "closed",
            Notice::EscalationOffer { .. } => "escalation_offer",
        }
    }
}

pub fn render(notice: &Notice<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_notice", SYSTEM_NOTICE_TEMPLATE)
        .is_err()
    {
        return fallback(notice);
    }
    let Ok(template) = env.get_template("system_notice") else {
        return fallback(notice);
    };

    let kind = notice.kind();
    let rendered = match *notice {
        Notice::PleaseWait | Notice::Resumed => template.render(context! { kind }),
        Notice::Assigned { actor, agent } => template.render(context! { kind, actor, agent }),
        Notice::Transferred { from, to, reason } => {
            template.render(context! { kind, from, to, reason => reason.trim() })
        }
        Notice::Unassigned { actor, previous } => {
            template.render(context! { kind, actor, previous })
        }
        Notice::Closed { by, reason } => template.render(context! {
            kind,
            closed_by => closed_by_str(by),
            reason => reason.map(str::trim).filter(|r| !r.is_empty()),
        }),
        Notice::EscalationOffer { reason } => {
            template.render(context! { kind, reason => reason.as_str() })
        }
    };

    match rendered {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => fallback(notice),
    }
}

fn closed_by_str(by: ClosedBy) -> &'static str {
    match by {
        ClosedBy::Visitor => "visitor",
        ClosedBy::Agent => "agent",
    }
}

fn fallback(notice: &Notice<'_>) -> String {
    match *notice {
        Notice::PleaseWait => "Please wait, a member of our team will be with you shortly.".to_string(),
        Notice::Resumed => "Conversation resumed.".to_string(),
        Notice::Assigned { actor, agent } => format!("{actor} assigned conversation to {agent}"),
        Notice::Transferred { from, to, .. } => format!("{from} transferred conversation to {to}"),
        Notice::Unassigned { .. } => "Waiting for the next available agent.".to_string(),
        Notice::Closed { by: ClosedBy::Visitor, .. } => "User has ended the chat".to_string(),
        Notice::Closed { by: ClosedBy::Agent, .. } => "Conversation closed by the agent".to_string(),
        Notice::EscalationOffer { .. } => {
            "Would you like to talk to a member of our team?".to_string()
        }
    }
}
