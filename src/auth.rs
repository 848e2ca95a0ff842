use std::{collections::HashMap, path::Path};

use axum::http::HeaderMap;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::types::AgentProfile;

/// One entry of the `AGENTS_FILE` JSON list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub token: String,
    #[serde(flatten)]
    pub profile: AgentProfile,
}

/// Token to agent lookup standing in for the external identity service.
#[derive(Default)]
pub struct AgentDirectory {
    by_token: RwLock<HashMap<String, AgentProfile>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> Result<Self, ChatError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let entries = serde_json::from_str::<Vec<AgentEntry>>(&raw)
            .map_err(|err| ChatError::Config(format!("{}: {err}", path.display())))?;
        let directory = Self::new();
        for entry in entries {
            directory.register(entry.token, entry.profile).await;
        }
        tracing::info!(path = %path.display(), agents = directory.len().await, "agent directory loaded");
        Ok(directory)
    }

    pub async fn register(&self, token: impl Into<String>, profile: AgentProfile) {
        self.by_token.write().await.insert(token.into(), profile);
    }

    pub async fn len(&self) -> usize {
        self.by_token.read().await.len()
    }

    pub async fn authenticate(&self, token: &str) -> Option<AgentProfile> {
        self.by_token.read().await.get(token.trim()).cloned()
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentProfile> {
        self.by_token
            .read()
            .await
            .values()
            .find(|profile| profile.id == agent_id)
            .cloned()
    }

    pub async fn from_headers(&self, headers: &HeaderMap) -> Result<AgentProfile, ChatError> {
        let token = bearer_token(headers).ok_or(ChatError::Unauthorized("missing bearer token"))?;
        self.authenticate(&token)
            .await
            .ok_or(ChatError::Unauthorized("invalid token"))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}
