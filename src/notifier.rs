use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::WebhookConfig;
use crate::error::ChatError;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Assigned,
    TransferredIn,
    TransferredOut,
}

/// "Notify this agent" request handed to the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNotification {
    pub agent_id: String,
    pub session_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub occurred_at: DateTime<Utc>,
}

/// Notification-delivery collaborator. Retries and backoff belong to the
/// implementation behind it.
#[async_trait]
pub trait AgentNotifier: Send + Sync {
    async fn notify(&self, notification: AgentNotification) -> Result<(), ChatError>;
}

/// Used when no delivery service is configured.
pub struct LogNotifier;

#[async_trait]
impl AgentNotifier for LogNotifier {
    async fn notify(&self, notification: AgentNotification) -> Result<(), ChatError> {
        tracing::info!(
            agent_id = %notification.agent_id,
            session_id = %notification.session_id,
            kind = ?notification.kind,
            "{}",
            notification.title
        );
        Ok(())
    }
}

/// POSTs JSON to a webhook, signed as `sha256=<hex hmac>` when a secret is set.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

pub fn sign_payload(secret: &str, body: &[u8]) -> Option<String> {
    if secret.is_empty() {
        return None;
    }
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn verify_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[async_trait]
impl AgentNotifier for WebhookNotifier {
    async fn notify(&self, notification: AgentNotification) -> Result<(), ChatError> {
        let body = serde_json::to_vec(&notification)
            .map_err(|err| ChatError::TransportFailure(err.to_string()))?;
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json");
        if let Some(signature) = sign_payload(&self.config.secret, &body) {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| ChatError::TransportFailure(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(ChatError::Remote {
            status: status.as_u16(),
            code: "notify_failed".to_string(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

pub fn notifier_from_config(webhook: Option<&WebhookConfig>) -> Arc<dyn AgentNotifier> {
    match webhook {
        Some(config) => Arc::new(WebhookNotifier::new(config.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Fire-and-forget; a failed delivery is logged and never reaches the caller.
pub fn spawn_notify(notifier: Arc<dyn AgentNotifier>, notification: AgentNotification) {
    tokio::spawn(async move {
        let agent_id = notification.agent_id.clone();
        if let Err(err) = notifier.notify(notification).await {
            tracing::warn!(agent_id = %agent_id, error = %err, "agent notification failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let body = br#"{"agentId":"b"}"#;
        let signature = sign_payload("secret", body).unwrap();
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("secret", Some(&signature), body));
        assert!(!verify_signature("other", Some(&signature), body));
        assert!(!verify_signature("secret", None, body));
    }

    #[test]
    fn no_secret_means_unsigned() {
        assert_eq!(sign_payload("", b"{}"), None);
        assert!(verify_signature("", None, b"{}"));
    }

    #[test]
    fn notification_uses_camel_case() {
        let value = serde_json::to_value(AgentNotification {
            agent_id: "b".into(),
            session_id: "s".into(),
            kind: NotificationKind::TransferredIn,
            title: "Chat transferred to you".into(),
            body: "specialist needed".into(),
            occurred_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(value["agentId"], "b");
        assert_eq!(value["kind"], "transferred_in");
    }
}
