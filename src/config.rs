use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Orchestrator limits.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Streaming queries allowed at once. Submissions past this are dropped.
    pub max_concurrent: usize,
    /// Per-query deadline, measured from submission.
    pub query_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            query_timeout: Duration::from_secs(90),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = dotenv::var("MAX_CONCURRENT_QUERIES") {
            config.max_concurrent = raw
                .trim()
                .parse()
                .context("MAX_CONCURRENT_QUERIES must be a positive integer")?;
        }
        if let Ok(raw) = dotenv::var("QUERY_TIMEOUT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .context("QUERY_TIMEOUT_SECS must be a number of seconds")?;
            config.query_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Where the agent lives and how to authenticate to it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub base_url: String,
    pub project_id: String,
    /// Opaque bearer token; requests go out unauthenticated without one.
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl AgentConfig {
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project_id: project_id.into(),
            token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_env() -> Result<Self> {
        let base_url = dotenv::var("AGENT_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        let project_id =
            dotenv::var("AGENT_PROJECT_ID").context("AGENT_PROJECT_ID required")?;
        let token = dotenv::var("AGENT_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Self {
            token,
            ..Self::new(base_url, project_id)
        })
    }

    /// Streaming query endpoint for the configured project.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/api/projects/{}/query/stream",
            self.base_url.trim_end_matches('/'),
            self.project_id
        )
    }
}

/// Location of the caller-side conversation history file.
pub fn history_path() -> PathBuf {
    dotenv::var("HISTORY_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/history.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.query_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = AgentConfig::new("https://agent.example.com/", "proj-7");
        assert_eq!(
            config.endpoint(),
            "https://agent.example.com/api/projects/proj-7/query/stream"
        );
        assert!(config.token.is_none());
    }
}
