use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cache::MetadataCache;
use super::reducer::{Finished, Snapshot};
use super::types::{Query, QueryCompletion, QueryId, QueryResponse, QueryStatus};

#[derive(Default)]
struct RegistryState {
    queries: HashMap<QueryId, Query>,
    /// Cancellation handles of queries whose stream task is still running.
    handles: HashMap<QueryId, CancellationToken>,
    active: Option<QueryId>,
}

impl RegistryState {
    fn streaming_count(&self) -> usize {
        self.queries
            .values()
            .filter(|q| !q.status.is_terminal())
            .count()
    }

    /// A streaming query that may still be written by its task: present,
    /// not terminal, and not cancelled.
    fn writable(&mut self, id: &str, token: &CancellationToken) -> Option<&mut Query> {
        if token.is_cancelled() {
            return None;
        }
        self.queries
            .get_mut(id)
            .filter(|q| !q.status.is_terminal())
    }
}

/// Every query of a session, plus which one is on display, plus the page
/// metadata cache they share.
///
/// Each method is a single critical section with no suspension point inside,
/// so writes from different query tasks never interleave. Writes made on
/// behalf of a stream task carry its cancellation token and are dropped once
/// the token is cancelled, which is checked under the same lock that abort
/// and clear take. Cache writes from a stream ride along with its snapshots
/// and go through that check too.
#[derive(Default)]
pub struct QueryRegistry {
    state: Mutex<RegistryState>,
    cache: MetadataCache,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared page metadata. Readers may use it freely; stream tasks write
    /// to it only through `publish`.
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Insert a new streaming query unless `ceiling` queries are already
    /// streaming. The admitted query becomes active.
    pub fn admit(&self, query: Query, token: CancellationToken, ceiling: usize) -> bool {
        let mut state = self.lock();
        let streaming = state.streaming_count();
        if streaming >= ceiling {
            debug!(streaming, ceiling, "admission rejected");
            return false;
        }
        let id = query.id.clone();
        state.handles.insert(id.clone(), token);
        state.queries.insert(id.clone(), query);
        state.active = Some(id);
        true
    }

    pub fn streaming_count(&self) -> usize {
        self.lock().streaming_count()
    }

    /// Apply a stream snapshot, cache writes included, unless the query was
    /// cancelled or already ended.
    pub fn publish(&self, id: &str, token: &CancellationToken, mut snapshot: Snapshot) -> bool {
        let mut state = self.lock();
        match state.writable(id, token) {
            Some(query) => {
                let writes = std::mem::take(&mut snapshot.cache_writes);
                snapshot.apply_to(query);
                if !writes.is_empty() {
                    self.cache.extend(writes);
                }
                true
            }
            None => false,
        }
    }

    /// Freeze a streaming query as complete. Returns the completion payload
    /// only for the call that performed the transition.
    pub fn complete(
        &self,
        id: &str,
        token: &CancellationToken,
        finished: Finished,
    ) -> Option<QueryCompletion> {
        let mut state = self.lock();
        let query = state.writable(id, token)?;

        let elapsed_ms = query.elapsed_ms();
        let response = QueryResponse {
            answer: finished.answer.clone(),
            pages: finished.pages.clone(),
            trace: finished.trace.clone(),
            display_title: finished.display_title.clone(),
            conversation_title: finished.conversation_title.clone(),
            elapsed_ms,
        };

        query.status = QueryStatus::Complete;
        query.current_tool = None;
        query.answer = finished.answer;
        query.pages = finished.pages;
        query.trace = finished.trace;
        query.display_title = finished.display_title;
        query.conversation_title = finished.conversation_title;
        query.response = Some(response);

        Some(QueryCompletion {
            query_id: query.id.clone(),
            question: query.question.clone(),
            conversation_id: query.conversation_id.clone(),
            title: query.display_title.clone(),
            pages: query.pages.clone(),
            answer: query.answer.clone(),
            trace: query.trace.clone(),
            elapsed_ms,
        })
    }

    /// Move a streaming query to error. Returns true only for the call that
    /// performed the transition.
    pub fn fail(&self, id: &str, token: &CancellationToken, message: impl Into<String>) -> bool {
        let mut state = self.lock();
        match state.writable(id, token) {
            Some(query) => {
                query.status = QueryStatus::Error;
                query.current_tool = None;
                query.error = Some(message.into());
                true
            }
            None => false,
        }
    }

    /// Drop the cancellation handle of a finished stream task.
    pub fn release(&self, id: &str) {
        self.lock().handles.remove(id);
    }

    /// Cancel a query's stream (if still running) and forget the query.
    pub fn remove(&self, id: &str) -> Option<Query> {
        let mut state = self.lock();
        if let Some(token) = state.handles.remove(id) {
            token.cancel();
        }
        if state.active.as_deref() == Some(id) {
            state.active = None;
        }
        state.queries.remove(id)
    }

    /// Cancel every running stream, empty the registry and the cache. Returns
    /// the queries that were still streaming.
    pub fn clear(&self) -> Vec<QueryId> {
        let mut state = self.lock();
        for (_, token) in state.handles.drain() {
            token.cancel();
        }
        let streaming = state
            .queries
            .values()
            .filter(|q| !q.status.is_terminal())
            .map(|q| q.id.clone())
            .collect();
        state.queries.clear();
        state.active = None;
        self.cache.clear();
        streaming
    }

    /// Insert a query rebuilt from history, replacing any earlier restored
    /// entry, and put it on display.
    pub fn insert_restored(&self, query: Query) {
        let mut state = self.lock();
        state.queries.retain(|_, q| !q.restored);
        let id = query.id.clone();
        state.queries.insert(id.clone(), query);
        state.active = Some(id);
    }

    /// Apply `f` to a query regardless of status.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Query) -> R) -> Option<R> {
        self.lock().queries.get_mut(id).map(f)
    }

    pub fn get(&self, id: &str) -> Option<Query> {
        self.lock().queries.get(id).cloned()
    }

    /// Every query, oldest first.
    pub fn all(&self) -> Vec<Query> {
        let mut queries: Vec<Query> = self.lock().queries.values().cloned().collect();
        queries.sort_by_key(|q| q.submitted);
        queries
    }

    pub fn active_id(&self) -> Option<QueryId> {
        self.lock().active.clone()
    }

    pub fn active(&self) -> Option<Query> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .and_then(|id| state.queries.get(id))
            .cloned()
    }

    /// Put a known query on display. Unknown ids are ignored.
    pub fn set_active(&self, id: &str) -> bool {
        let mut state = self.lock();
        if state.queries.contains_key(id) {
            state.active = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queries.is_empty()
    }
}
