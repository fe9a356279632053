use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AgentConfig;

/// Raw response body of a streaming query.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Body of a streaming query request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewing_page_id: Option<String>,
}

/// Opens the agent's event stream for one question.
///
/// The returned future resolves once the response headers are in; the body
/// is then consumed chunk by chunk. Dropping either cancels the request.
pub trait AgentTransport: Send + Sync + 'static {
    fn open(&self, request: QueryRequest) -> BoxFuture<'static, Result<ByteStream>>;
}

/// HTTP transport for the agent service.
pub struct AgentClient {
    client: reqwest::Client,
    config: AgentConfig,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Result<Self> {
        // No overall timeout: answers stream for a long time and the
        // orchestrator enforces its own per-query deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(AgentConfig::from_env()?)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

impl AgentTransport for AgentClient {
    fn open(&self, request: QueryRequest) -> BoxFuture<'static, Result<ByteStream>> {
        let mut req = self
            .client
            .post(self.config.endpoint())
            .header("Accept", "text/event-stream")
            .json(&request);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }

        async move {
            let resp = req.send().await.context("Agent request failed")?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("Agent request failed with status {}: {}", status, body.trim());
            }
            debug!(%status, "agent stream opened");

            let body = resp
                .bytes_stream()
                .map_err(|e| anyhow::Error::new(e).context("Agent stream read failed"))
                .boxed();
            Ok(body)
        }
        .boxed()
    }
}

/// Transport for sessions that only replay history. Every open fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disconnected;

impl AgentTransport for Disconnected {
    fn open(&self, _request: QueryRequest) -> BoxFuture<'static, Result<ByteStream>> {
        let result: Result<ByteStream> = Err(anyhow::anyhow!("No agent configured for this session"));
        futures::future::ready(result).boxed()
    }
}
