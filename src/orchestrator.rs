use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentTransport, QueryRequest};
use crate::config::OrchestratorConfig;
use crate::history::PersistedTurn;
use crate::notify::QueryObserver;
use crate::query::answer::latest_thinking;
use crate::query::reducer::{merge_pages, Accumulator, Finished, Outcome};
use crate::query::types::{
    Query, QueryId, QueryResponse, QueryStatus, SelectedPage, TraceStep,
};
use crate::query::{MetadataCache, QueryRegistry};
use crate::stream::{event_stream, AgentEvent};

const STREAM_CLOSED: &str = "Agent stream closed before the answer completed";
const GENERIC_FAILURE: &str = "Query failed";

struct Inner {
    config: OrchestratorConfig,
    transport: Arc<dyn AgentTransport>,
    registry: QueryRegistry,
    observer: Arc<dyn QueryObserver>,
    runtime: Handle,
}

/// Runs streamed agent queries side by side.
///
/// Each admitted query gets one task that reads its event stream and folds
/// it into the registry. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

enum RunEnd {
    Cancelled,
    TimedOut,
    Finished,
    Failed(anyhow::Error),
}

impl Orchestrator {
    /// Must be called from within a Tokio runtime; stream tasks are spawned
    /// onto it.
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn AgentTransport>,
        observer: Arc<dyn QueryObserver>,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().context("Orchestrator must be created inside a Tokio runtime")?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                registry: QueryRegistry::new(),
                observer,
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Start a query. Returns `None`, changing nothing, when the concurrency
    /// ceiling is already reached. Never waits on the network.
    pub fn submit(
        &self,
        question: impl Into<String>,
        conversation_id: Option<String>,
        viewing_page_id: Option<String>,
    ) -> Option<QueryId> {
        let question = question.into();
        let id: QueryId = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let query = Query::streaming(
            id.clone(),
            question.clone(),
            conversation_id.clone(),
            viewing_page_id.clone(),
        );

        let ceiling = self.inner.config.max_concurrent;
        if !self.inner.registry.admit(query, token.clone(), ceiling) {
            info!(ceiling, "submission rejected, too many queries in flight");
            return None;
        }

        info!(query_id = %id, question, "query submitted");
        self.inner.observer.toast_added(&id, &question);

        let request = QueryRequest {
            query: question,
            conversation_id,
            viewing_page_id,
        };
        self.inner
            .runtime
            .spawn(drive(self.inner.clone(), id.clone(), request, token));
        Some(id)
    }

    /// Cancel a query and forget it. Silent and idempotent.
    pub fn abort(&self, id: &str) {
        if let Some(query) = self.inner.registry.remove(id) {
            info!(query_id = %id, status = ?query.status, "query aborted");
            self.inner.observer.toast_dismissed(&query.id);
        }
    }

    /// Abort everything and forget all queries and page metadata.
    pub fn reset(&self) {
        let streaming = self.inner.registry.clear();
        info!(aborted = streaming.len(), "session reset");
        for id in &streaming {
            self.inner.observer.toast_dismissed(id);
        }
    }

    /// Put a finished query back on display from stored data. No request is
    /// made; the supplied answer is used as is.
    pub fn restore(
        &self,
        trace: Vec<TraceStep>,
        answer: impl Into<String>,
        title: impl Into<String>,
        pages: Option<Vec<SelectedPage>>,
    ) -> QueryId {
        let title = title.into();
        self.insert_restored(
            title.clone(),
            None,
            trace,
            answer.into(),
            Some(title),
            pages.unwrap_or_default(),
        )
    }

    /// Restore one turn of a stored conversation.
    pub fn restore_turn(&self, conversation_id: &str, turn: &PersistedTurn) -> QueryId {
        self.insert_restored(
            turn.question.clone(),
            Some(conversation_id.to_string()),
            turn.trace.clone(),
            turn.answer.clone(),
            turn.title.clone(),
            turn.pages.clone(),
        )
    }

    fn insert_restored(
        &self,
        question: String,
        conversation_id: Option<String>,
        trace: Vec<TraceStep>,
        answer: String,
        title: Option<String>,
        pages: Vec<SelectedPage>,
    ) -> QueryId {
        let id: QueryId = Uuid::new_v4().to_string();
        self.remember_pages(&pages);

        let mut query = Query::streaming(id.clone(), question, conversation_id, None);
        query.status = QueryStatus::Complete;
        query.restored = true;
        query.thinking = latest_thinking(&trace).unwrap_or_default();
        query.response = Some(QueryResponse {
            answer: answer.clone(),
            pages: pages.clone(),
            trace: trace.clone(),
            display_title: title.clone(),
            conversation_title: None,
            elapsed_ms: 0,
        });
        query.trace = trace;
        query.answer = answer;
        query.pages = pages;
        query.display_title = title;

        info!(query_id = %id, steps = query.trace.len(), "query restored");
        self.inner.registry.insert_restored(query);
        id
    }

    /// Merge fully described pages (usually from history) into a query's
    /// page list and remember their metadata for later select calls.
    /// Returns false when the query is unknown.
    pub fn load_pages(&self, id: &str, pages: Vec<SelectedPage>) -> bool {
        self.remember_pages(&pages);
        match self.inner.registry.update(id, |q| merge_pages(&mut q.pages, pages)) {
            Some(added) => {
                debug!(query_id = %id, added, "pages loaded");
                true
            }
            None => false,
        }
    }

    fn remember_pages(&self, pages: &[SelectedPage]) {
        if pages.is_empty() {
            return;
        }
        self.inner
            .registry
            .cache()
            .extend(pages.iter().map(|p| (p.page_id.clone(), p.meta())));
    }

    pub fn queries(&self) -> Vec<Query> {
        self.inner.registry.all()
    }

    pub fn query(&self, id: &str) -> Option<Query> {
        self.inner.registry.get(id)
    }

    pub fn active_query(&self) -> Option<Query> {
        self.inner.registry.active()
    }

    pub fn active_query_id(&self) -> Option<QueryId> {
        self.inner.registry.active_id()
    }

    pub fn set_active(&self, id: &str) -> bool {
        self.inner.registry.set_active(id)
    }

    /// Queries currently streaming.
    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.streaming_count()
    }

    pub fn metadata_cache(&self) -> &MetadataCache {
        self.inner.registry.cache()
    }
}

impl Inner {
    fn finish(&self, id: &str, token: &CancellationToken, finished: Finished) {
        let Some(completion) = self.registry.complete(id, token, finished) else {
            return;
        };
        info!(
            query_id = %id,
            elapsed_ms = completion.elapsed_ms,
            answer_len = completion.answer.len(),
            pages = completion.pages.len(),
            "query complete"
        );
        self.observer
            .toast_completed(&completion.query_id, completion.title.as_deref());
        self.observer.query_completed(&completion);
    }

    fn fail(&self, id: &str, token: &CancellationToken, message: &str) {
        if !self.registry.fail(id, token, message) {
            return;
        }
        warn!(query_id = %id, message, "query failed");
        let id = id.to_string();
        self.observer.query_failed(&id, message);
        self.observer.toast_dismissed(&id);
    }
}

/// One query's task: stream, deadline and cancellation raced together.
async fn drive(inner: Arc<Inner>, id: QueryId, request: QueryRequest, token: CancellationToken) {
    let timeout = inner.config.query_timeout;

    let end = tokio::select! {
        biased;
        _ = token.cancelled() => RunEnd::Cancelled,
        _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
        result = run_stream(&inner, &id, request, &token) => match result {
            Ok(()) => RunEnd::Finished,
            Err(e) => RunEnd::Failed(e),
        },
    };

    match end {
        RunEnd::Cancelled => debug!(query_id = %id, "stream cancelled"),
        RunEnd::Finished => debug!(query_id = %id, "stream finished"),
        RunEnd::TimedOut => {
            let message = format!("Query timed out after {} seconds", timeout.as_secs_f64());
            inner.fail(&id, &token, &message);
            token.cancel();
        }
        RunEnd::Failed(e) => {
            let message = format!("{:#}", e);
            let message = if message.trim().is_empty() {
                GENERIC_FAILURE.to_string()
            } else {
                message
            };
            inner.fail(&id, &token, &message);
        }
    }
    inner.registry.release(&id);
}

/// Read events until a terminal one. Every registry write goes through the
/// token check, so nothing lands after an abort.
async fn run_stream(
    inner: &Inner,
    id: &str,
    request: QueryRequest,
    token: &CancellationToken,
) -> Result<()> {
    let body = inner.transport.open(request).await?;
    let mut frames = Box::pin(event_stream(body));
    let mut acc = Accumulator::new(id);

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if token.is_cancelled() {
            return Ok(());
        }
        let Some(event) = AgentEvent::from_value(frame) else {
            continue;
        };
        match acc.apply(event, inner.registry.cache()) {
            Outcome::Progress(snapshot) => {
                debug!(
                    query_id = %id,
                    tool = snapshot.current_tool.as_deref(),
                    thinking = snapshot.thinking.as_deref(),
                    "progress"
                );
                inner.registry.publish(id, token, snapshot);
            }
            Outcome::Complete(finished) => {
                inner.finish(id, token, finished);
                return Ok(());
            }
            Outcome::Failed(message) => {
                inner.fail(id, token, &message);
                return Ok(());
            }
            Outcome::Ignored => {}
        }
    }

    anyhow::bail!(STREAM_CLOSED)
}
