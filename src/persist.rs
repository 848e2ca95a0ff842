use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};

use crate::error::ChatError;
use crate::store::ChatRecord;
use crate::types::*;

/// Rows touched by one committed mutation of a chat.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub session: ChatSession,
    pub messages: Vec<Message>,
    pub prompts: Vec<EscalationPrompt>,
    pub assignments: Vec<AssignmentEvent>,
}

/// Write-behind Postgres mirror of the in-memory store. Disabled when no
/// database is configured.
#[derive(Clone, Default)]
pub struct Persistence {
    pool: Option<PgPool>,
}

impl Persistence {
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub async fn connect(database_url: &str) -> Result<Self, ChatError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Fire-and-forget: the mutation that produced `change` has already committed.
    pub fn mirror(&self, change: RecordChange) {
        let Some(pool) = self.pool.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = write_change(&pool, &change).await {
                tracing::warn!(
                    session_id = %change.session.session_id,
                    revision = change.session.revision,
                    error = %err,
                    "failed to mirror chat change"
                );
            }
        });
    }

    /// Loads every non-closed chat plus the next free internal id.
    pub async fn load_active(&self) -> Result<(Vec<ChatRecord>, i64), ChatError> {
        let Some(pool) = &self.pool else {
            return Ok((Vec::new(), 1));
        };

        let next_id = sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(id), 0) + 1 FROM sessions")
            .fetch_one(pool)
            .await?;

        let rows = sqlx::query(
            "SELECT session_id, id, visitor_id, status, closed_by, close_reason, channel, assigned_agent, \
                    assigned_agent_name, assigned_at, transfer_count, created_at, updated_at, last_activity, revision \
             FROM sessions WHERE status <> 'closed' ORDER BY updated_at ASC",
        )
        .fetch_all(pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let session = session_from_row(&row)?;
            let messages = load_messages(pool, &session.session_id).await?;
            let prompts = load_prompts(pool, &session.session_id).await?;
            let assignments = load_assignments(pool, &session.session_id).await?;
            records.push(ChatRecord {
                session,
                messages,
                prompts,
                assignments,
            });
        }

        tracing::info!(chats = records.len(), "hydrated active chats");
        Ok((records, next_id))
    }

    /// Loads one chat, closed or not. Used to bring back records the store
    /// has evicted from memory.
    pub async fn load_session(&self, session_id: &str) -> Result<Option<ChatRecord>, ChatError> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT session_id, id, visitor_id, status, closed_by, close_reason, channel, assigned_agent, \
                    assigned_agent_name, assigned_at, transfer_count, created_at, updated_at, last_activity, revision \
             FROM sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let session = session_from_row(&row)?;
        Ok(Some(ChatRecord {
            messages: load_messages(pool, session_id).await?,
            prompts: load_prompts(pool, session_id).await?,
            assignments: load_assignments(pool, session_id).await?,
            session,
        }))
    }
}

async fn write_change(pool: &PgPool, change: &RecordChange) -> Result<(), sqlx::Error> {
    persist_session(pool, &change.session).await?;
    for message in &change.messages {
        persist_message(pool, message).await?;
    }
    for prompt in &change.prompts {
        persist_prompt(pool, prompt).await?;
    }
    for event in &change.assignments {
        persist_assignment(pool, event).await?;
    }
    Ok(())
}

async fn persist_session(pool: &PgPool, session: &ChatSession) -> Result<(), sqlx::Error> {
    // Mirrors run concurrently; a stale revision must never overwrite a newer one.
    sqlx::query(
        r#"
        INSERT INTO sessions (
            session_id, id, visitor_id, status, closed_by, close_reason, channel, assigned_agent,
            assigned_agent_name, assigned_at, transfer_count, created_at, updated_at, last_activity, revision
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
        ON CONFLICT (session_id) DO UPDATE SET
            status = EXCLUDED.status,
            closed_by = EXCLUDED.closed_by,
            close_reason = EXCLUDED.close_reason,
            assigned_agent = EXCLUDED.assigned_agent,
            assigned_agent_name = EXCLUDED.assigned_agent_name,
            assigned_at = EXCLUDED.assigned_at,
            transfer_count = EXCLUDED.transfer_count,
            updated_at = EXCLUDED.updated_at,
            last_activity = EXCLUDED.last_activity,
            revision = EXCLUDED.revision
        WHERE sessions.revision < EXCLUDED.revision
        "#,
    )
    .bind(&session.session_id)
    .bind(session.id)
    .bind(&session.visitor_id)
    .bind(session.status.as_str())
    .bind(session.closed_by.as_ref().map(enum_text))
    .bind(&session.close_reason)
    .bind(session.channel.as_str())
    .bind(&session.assigned_agent)
    .bind(&session.assigned_agent_name)
    .bind(session.assigned_at.map(|t| t.to_rfc3339()))
    .bind(session.transfer_count as i32)
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .bind(session.last_activity.to_rfc3339())
    .bind(session.revision as i64)
    .execute(pool)
    .await?;
    Ok(())
}

async fn persist_message(pool: &PgPool, message: &Message) -> Result<(), sqlx::Error> {
    let metadata = serde_json::to_string(&message.metadata).unwrap_or_else(|_| "{}".to_string());
    sqlx::query(
        r#"
        INSERT INTO messages (id, session_id, sender_role, text, kind, metadata, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(message.sender_role.as_str())
    .bind(&message.text)
    .bind(enum_text(&message.kind))
    .bind(metadata)
    .bind(message.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

async fn persist_prompt(pool: &PgPool, prompt: &EscalationPrompt) -> Result<(), sqlx::Error> {
    // Only a still-`sent` row may move; resolved prompts are final.
    sqlx::query(
        r#"
        INSERT INTO escalation_prompts (id, session_id, status, prompt_trigger, reason, sent_by, sent_at, responded_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            responded_at = EXCLUDED.responded_at
        WHERE escalation_prompts.status = 'sent'
        "#,
    )
    .bind(&prompt.id)
    .bind(&prompt.session_id)
    .bind(enum_text(&prompt.status))
    .bind(enum_text(&prompt.trigger))
    .bind(prompt.reason.as_str())
    .bind(&prompt.sent_by)
    .bind(prompt.sent_at.to_rfc3339())
    .bind(prompt.responded_at.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;
    Ok(())
}

async fn persist_assignment(pool: &PgPool, event: &AssignmentEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO assignment_events (id, session_id, kind, from_agent, to_agent, actor, reason, occurred_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(&event.id)
    .bind(&event.session_id)
    .bind(enum_text(&event.kind))
    .bind(&event.from_agent)
    .bind(&event.to_agent)
    .bind(&event.actor)
    .bind(&event.reason)
    .bind(event.occurred_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

async fn load_messages(pool: &PgPool, session_id: &str) -> Result<Vec<Message>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, session_id, sender_role, text, kind, metadata, created_at \
         FROM messages WHERE session_id = $1 ORDER BY created_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let metadata_text: String = row.try_get("metadata")?;
            Ok(Message {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                sender_role: parse_enum(&row.try_get::<String, _>("sender_role")?)?,
                text: row.try_get("text")?,
                kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
                metadata: serde_json::from_str(&metadata_text).unwrap_or_default(),
                created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .collect()
}

async fn load_prompts(pool: &PgPool, session_id: &str) -> Result<Vec<EscalationPrompt>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, session_id, status, prompt_trigger, reason, sent_by, sent_at, responded_at \
         FROM escalation_prompts WHERE session_id = $1 ORDER BY sent_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(EscalationPrompt {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                status: parse_enum(&row.try_get::<String, _>("status")?)?,
                trigger: parse_enum(&row.try_get::<String, _>("prompt_trigger")?)?,
                reason: parse_enum(&row.try_get::<String, _>("reason")?)?,
                sent_by: row.try_get("sent_by")?,
                sent_at: parse_time(&row.try_get::<String, _>("sent_at")?)?,
                responded_at: parse_optional_time(row.try_get("responded_at")?)?,
            })
        })
        .collect()
}

async fn load_assignments(pool: &PgPool, session_id: &str) -> Result<Vec<AssignmentEvent>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, session_id, kind, from_agent, to_agent, actor, reason, occurred_at \
         FROM assignment_events WHERE session_id = $1 ORDER BY occurred_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(AssignmentEvent {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
                from_agent: row.try_get("from_agent")?,
                to_agent: row.try_get("to_agent")?,
                actor: row.try_get("actor")?,
                reason: row.try_get("reason")?,
                occurred_at: parse_time(&row.try_get::<String, _>("occurred_at")?)?,
            })
        })
        .collect()
}

fn session_from_row(row: &PgRow) -> Result<ChatSession, sqlx::Error> {
    let closed_by: Option<String> = row.try_get("closed_by")?;
    Ok(ChatSession {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        visitor_id: row.try_get("visitor_id")?,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        closed_by: closed_by.as_deref().map(parse_enum).transpose()?,
        close_reason: row.try_get("close_reason")?,
        channel: parse_enum(&row.try_get::<String, _>("channel")?)?,
        assigned_agent: row.try_get("assigned_agent")?,
        assigned_agent_name: row.try_get("assigned_agent_name")?,
        assigned_at: parse_optional_time(row.try_get("assigned_at")?)?,
        transfer_count: row.try_get::<i32, _>("transfer_count")?.max(0) as u32,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
        last_activity: parse_time(&row.try_get::<String, _>("last_activity")?)?,
        revision: row.try_get::<i64, _>("revision")?.max(0) as u64,
    })
}

fn enum_text<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(text)) => text,
        _ => String::new(),
    }
}

fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T, sqlx::Error> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

fn parse_optional_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    raw.as_deref().map(parse_time).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_column_text() {
        assert_eq!(enum_text(&ChatStatus::WaitingHuman), "waiting_human");
        assert_eq!(enum_text(&MessageKind::EscalationPrompt), "escalation_prompt");
        let status: ChatStatus = parse_enum("waiting_human").unwrap();
        assert_eq!(status, ChatStatus::WaitingHuman);
        assert!(parse_enum::<ChatStatus>("pending").is_err());
    }

    #[test]
    fn timestamps_parse_back_to_utc() {
        let now = Utc::now();
        assert_eq!(parse_time(&now.to_rfc3339()).unwrap(), now);
        assert_eq!(parse_optional_time(None).unwrap(), None);
    }

    #[tokio::test]
    async fn disabled_persistence_loads_nothing() {
        let persistence = Persistence::disabled();
        assert!(!persistence.is_enabled());
        let (records, next_id) = persistence.load_active().await.unwrap();
        assert!(records.is_empty());
        assert_eq!(next_id, 1);
    }
}
