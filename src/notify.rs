use std::sync::Arc;

use tracing::{debug, info};

use crate::query::types::{QueryCompletion, QueryId};

/// Side effects the orchestrator triggers but does not render.
///
/// Hooks run on the query's stream task (or the caller's thread for submit,
/// abort and reset) and must not block. All of them default to no-ops.
pub trait QueryObserver: Send + Sync {
    /// A query finished with an answer.
    fn query_completed(&self, _completion: &QueryCompletion) {}

    /// A query ended in error (agent error, transport failure or timeout).
    fn query_failed(&self, _query_id: &QueryId, _message: &str) {}

    /// A submission was accepted and a progress toast should appear.
    fn toast_added(&self, _query_id: &QueryId, _question: &str) {}

    /// The query behind a toast completed.
    fn toast_completed(&self, _query_id: &QueryId, _title: Option<&str>) {}

    /// The toast for a query should go away (abort, reset or failure).
    fn toast_dismissed(&self, _query_id: &QueryId) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl QueryObserver for NoopObserver {}

/// Observer that reports lifecycle events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl QueryObserver for LogObserver {
    fn query_completed(&self, completion: &QueryCompletion) {
        info!(
            query_id = %completion.query_id,
            elapsed_ms = completion.elapsed_ms,
            answer_len = completion.answer.len(),
            pages = completion.pages.len(),
            "query complete"
        );
    }

    fn query_failed(&self, query_id: &QueryId, message: &str) {
        info!(query_id = %query_id, message, "query failed");
    }

    fn toast_added(&self, query_id: &QueryId, question: &str) {
        debug!(query_id = %query_id, question, "toast added");
    }

    fn toast_completed(&self, query_id: &QueryId, title: Option<&str>) {
        debug!(query_id = %query_id, title, "toast completed");
    }

    fn toast_dismissed(&self, query_id: &QueryId) {
        debug!(query_id = %query_id, "toast dismissed");
    }
}

/// Fans every hook out to several observers in order.
#[derive(Default, Clone)]
pub struct Observers {
    observers: Vec<Arc<dyn QueryObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn QueryObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl QueryObserver for Observers {
    fn query_completed(&self, completion: &QueryCompletion) {
        for o in &self.observers {
            o.query_completed(completion);
        }
    }

    fn query_failed(&self, query_id: &QueryId, message: &str) {
        for o in &self.observers {
            o.query_failed(query_id, message);
        }
    }

    fn toast_added(&self, query_id: &QueryId, question: &str) {
        for o in &self.observers {
            o.toast_added(query_id, question);
        }
    }

    fn toast_completed(&self, query_id: &QueryId, title: Option<&str>) {
        for o in &self.observers {
            o.toast_completed(query_id, title);
        }
    }

    fn toast_dismissed(&self, query_id: &QueryId) {
        for o in &self.observers {
            o.toast_dismissed(query_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl QueryObserver for Recorder {
        fn toast_added(&self, query_id: &QueryId, _question: &str) {
            self.events.lock().unwrap().push(format!("add:{}", query_id));
        }

        fn toast_dismissed(&self, query_id: &QueryId) {
            self.events.lock().unwrap().push(format!("dismiss:{}", query_id));
        }
    }

    #[test]
    fn test_fan_out_reaches_every_observer() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let observers = Observers::new()
            .with(a.clone())
            .with(Arc::new(NoopObserver))
            .with(b.clone());

        let id: QueryId = "q1".to_string();
        observers.toast_added(&id, "why?");
        observers.toast_dismissed(&id);
        observers.query_failed(&id, "ignored by recorders");

        assert_eq!(*a.events.lock().unwrap(), vec!["add:q1", "dismiss:q1"]);
        assert_eq!(*b.events.lock().unwrap(), vec!["add:q1", "dismiss:q1"]);
    }
}
