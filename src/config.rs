use std::{env, path::PathBuf, time::Duration};

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};

use crate::client::ReconcilerConfig;
use crate::store::DEFAULT_CLOSED_RETENTION;

/// What a visitor message addressed to a closed session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedSessionPolicy {
    /// Mint a fresh session id for the same visitor.
    #[default]
    NewSession,
    /// Reopen the closed session with a "conversation resumed" notice.
    Reactivate,
}

impl ClosedSessionPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new_session" | "new" => Some(ClosedSessionPolicy::NewSession),
            "reactivate" | "resume" => Some(ClosedSessionPolicy::Reactivate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub prompt_timeout: ChronoDuration,
    pub sweep_interval: Duration,
    pub closed_session_policy: ClosedSessionPolicy,
    /// Closed chats kept in memory; older ones are reloaded from Postgres on demand.
    pub closed_retention: usize,
    pub agents_file: Option<PathBuf>,
    pub notify_webhook: Option<WebhookConfig>,
    pub client: ReconcilerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            prompt_timeout: ChronoDuration::seconds(120),
            sweep_interval: Duration::from_secs(5),
            closed_session_policy: ClosedSessionPolicy::NewSession,
            closed_retention: DEFAULT_CLOSED_RETENTION,
            agents_file: None,
            notify_webhook: None,
            client: ReconcilerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let number = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|v| *v >= 0)
        };

        let port = lookup("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(defaults.port);

        let millis = |key: &str| number(key).and_then(ChronoDuration::try_milliseconds);
        let seconds = |key: &str| number(key).and_then(ChronoDuration::try_seconds);

        let mut client = defaults.client.clone();
        if let Some(window) = millis("DEDUP_WINDOW_MS") {
            client.dedup_window = window;
        }
        if let Some(tolerance) = millis("OPTIMISTIC_MATCH_TOLERANCE_MS") {
            client.match_tolerance = tolerance;
        }
        if let Some(grace) = seconds("RESYNC_GRACE_SECS") {
            client.resync_grace = grace;
        }
        if let Some(limit) = number("CLIENT_CACHE_LIMIT") {
            client.cache_limit = limit as usize;
        }

        let notify_webhook = lookup("NOTIFY_WEBHOOK_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| WebhookConfig {
                url: url.trim().to_string(),
                secret: lookup("NOTIFY_WEBHOOK_SECRET").unwrap_or_default(),
            });

        Self {
            port,
            database_url: resolve_database_url(&lookup),
            prompt_timeout: seconds("PROMPT_TIMEOUT_SECS").unwrap_or(defaults.prompt_timeout),
            sweep_interval: number("SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(defaults.sweep_interval),
            closed_session_policy: lookup("CLOSED_SESSION_POLICY")
                .and_then(|v| ClosedSessionPolicy::parse(&v))
                .unwrap_or(defaults.closed_session_policy),
            closed_retention: number("CLOSED_CHAT_RETENTION")
                .map(|n| n as usize)
                .unwrap_or(defaults.closed_retention),
            agents_file: lookup("AGENTS_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            notify_webhook,
            client,
        }
    }
}

/// `DATABASE_URL` wins; otherwise a URL is assembled only when a Postgres host is configured.
fn resolve_database_url(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
        return Some(url);
    }
    let host = lookup("POSTGRES_HOST").or_else(|| lookup("PGHOST"))?;
    let port = lookup("POSTGRES_PORT")
        .or_else(|| lookup("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = lookup("POSTGRES_USER")
        .or_else(|| lookup("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = lookup("POSTGRES_PASSWORD")
        .or_else(|| lookup("PGPASSWORD"))
        .unwrap_or_default();
    let db = lookup("POSTGRES_DB")
        .or_else(|| lookup("PGDATABASE"))
        .unwrap_or_else(|| "chat_handover".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.port, 4000);
        assert!(config.database_url.is_none());
        assert_eq!(config.closed_session_policy, ClosedSessionPolicy::NewSession);
        assert_eq!(config.client.dedup_window, ChronoDuration::milliseconds(3000));
    }

    #[test]
    fn tunable_windows_are_read() {
        let config = Config::from_lookup(lookup(&[
            ("DEDUP_WINDOW_MS", "1500"),
            ("PROMPT_TIMEOUT_SECS", "30"),
            ("CLOSED_SESSION_POLICY", "reactivate"),
            ("SWEEP_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(config.client.dedup_window, ChronoDuration::milliseconds(1500));
        assert_eq!(config.prompt_timeout, ChronoDuration::seconds(30));
        assert_eq!(config.closed_session_policy, ClosedSessionPolicy::Reactivate);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn out_of_range_windows_fall_back_to_defaults() {
        let huge = i64::MAX.to_string();
        let config = Config::from_lookup(lookup(&[
            ("PROMPT_TIMEOUT_SECS", huge.as_str()),
            ("RESYNC_GRACE_SECS", huge.as_str()),
            ("DEDUP_WINDOW_MS", huge.as_str()),
        ]));
        assert_eq!(config.prompt_timeout, ChronoDuration::seconds(120));
        assert_eq!(config.client.resync_grace, ChronoDuration::seconds(30));
        assert_eq!(config.client.dedup_window.num_milliseconds(), i64::MAX);
    }

    #[test]
    fn database_url_assembled_from_postgres_parts() {
        let config = Config::from_lookup(lookup(&[
            ("PGHOST", "db"),
            ("POSTGRES_USER", "chat"),
            ("POSTGRES_PASSWORD", "pw"),
        ]));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://chat:pw@db:5432/chat_handover")
        );
    }
}
