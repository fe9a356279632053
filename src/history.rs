use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::query::types::{QueryCompletion, SelectedPage, TraceStep};

/// One finished question/answer exchange, as kept between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTurn {
    pub question: String,
    pub answer: String,
    pub title: Option<String>,
    pub trace: Vec<TraceStep>,
    pub pages: Vec<SelectedPage>,
    pub recorded_at: DateTime<Utc>,
}

impl PersistedTurn {
    pub fn from_completion(completion: &QueryCompletion) -> Self {
        Self {
            question: completion.question.clone(),
            answer: completion.answer.clone(),
            title: completion.title.clone(),
            trace: completion.trace.clone(),
            pages: completion.pages.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Completed turns grouped by conversation, stored as one JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    conversations: BTreeMap<String, Vec<PersistedTurn>>,
}

impl ConversationHistory {
    /// Read the history file. A missing file is an empty history.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("read history {}", path.display()))
            }
        };
        let history: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse history {}", path.display()))?;
        debug!(path = %path.display(), conversations = history.conversations.len(), "history loaded");
        Ok(history)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serialize history")?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("write history {}", path.display()))?;
        debug!(path = %path.display(), "history saved");
        Ok(())
    }

    /// Append a completed query to its conversation. Queries asked outside a
    /// conversation are not kept.
    pub fn record(&mut self, completion: &QueryCompletion) -> bool {
        let Some(conversation_id) = &completion.conversation_id else {
            return false;
        };
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
            .push(PersistedTurn::from_completion(completion));
        true
    }

    pub fn turns(&self, conversation_id: &str) -> &[PersistedTurn] {
        self.conversations
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &str> {
        self.conversations.keys().map(String::as_str)
    }
}
