use serde_json::Value;
use tracing::{debug, warn};

use super::answer::{extract_final_answer, last_tool_result_index, latest_thinking};
use super::cache::MetadataCache;
use super::tools::{self, ToolKind};
use super::types::{PageId, PageMeta, Pointer, Query, QueryId, SelectedPage, TraceStep};
use crate::stream::AgentEvent;

const GENERIC_AGENT_ERROR: &str = "The agent reported an error";

/// UI-facing projection of an in-flight query.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub trace: Vec<TraceStep>,
    pub pages: Vec<SelectedPage>,
    pub thinking: Option<String>,
    pub current_tool: Option<String>,
    pub answer: String,
    /// Page metadata discovered since the previous snapshot. Written to the
    /// shared cache by whoever accepts the snapshot, not by the reducer.
    pub cache_writes: Vec<(PageId, PageMeta)>,
}

impl Snapshot {
    /// Copy the projection onto the query record. `cache_writes` is left for
    /// the caller.
    pub fn apply_to(self, query: &mut Query) {
        query.trace = self.trace;
        query.pages = self.pages;
        if let Some(thinking) = self.thinking {
            query.thinking = thinking;
        }
        query.current_tool = self.current_tool;
        query.answer = self.answer;
    }
}

/// Everything the stream produced, frozen at `done`.
#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub answer: String,
    pub pages: Vec<SelectedPage>,
    pub trace: Vec<TraceStep>,
    pub display_title: Option<String>,
    pub conversation_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Progress(Snapshot),
    Complete(Finished),
    Failed(String),
    /// The event arrived after a terminal event and was dropped.
    Ignored,
}

/// Scratch state for one in-flight query. Owned by the query's stream task
/// and never shared; the registry only ever sees snapshots of it.
///
/// The shared metadata cache is only read here. Metadata found by search
/// results is staged and handed out with the next snapshot.
#[derive(Debug)]
pub struct Accumulator {
    query_id: QueryId,
    reasoning: Vec<String>,
    trace: Vec<TraceStep>,
    pages: Vec<SelectedPage>,
    current_tool: Option<String>,
    staged: Vec<(PageId, PageMeta)>,
    complete: bool,
}

impl Accumulator {
    pub fn new(query_id: impl Into<QueryId>) -> Self {
        Self {
            query_id: query_id.into(),
            reasoning: Vec::new(),
            trace: Vec::new(),
            pages: Vec::new(),
            current_tool: None,
            staged: Vec::new(),
            complete: false,
        }
    }

    pub fn trace(&self) -> &[TraceStep] {
        &self.trace
    }

    pub fn pages(&self) -> &[SelectedPage] {
        &self.pages
    }

    /// Fold one event into the accumulator.
    pub fn apply(&mut self, event: AgentEvent, cache: &MetadataCache) -> Outcome {
        if self.complete {
            debug!(query_id = %self.query_id, ?event, "event after terminal, dropped");
            return Outcome::Ignored;
        }
        if event.is_terminal() {
            self.complete = true;
            self.current_tool = None;
        }

        match event {
            AgentEvent::Text { content } => {
                self.on_text(content);
                Outcome::Progress(self.snapshot())
            }
            AgentEvent::ToolCall { tool, input } => {
                self.on_tool_call(tool, input, cache);
                Outcome::Progress(self.snapshot())
            }
            AgentEvent::ToolResult { tool, result } => {
                self.on_tool_result(tool, result, cache);
                Outcome::Progress(self.snapshot())
            }
            AgentEvent::Done {
                display_title,
                conversation_title,
            } => Outcome::Complete(Finished {
                answer: self.final_answer(),
                pages: std::mem::take(&mut self.pages),
                trace: std::mem::take(&mut self.trace),
                display_title,
                conversation_title,
            }),
            AgentEvent::Error { message } => {
                let message = message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_AGENT_ERROR.to_string());
                Outcome::Failed(message)
            }
        }
    }

    /// Projection of the current state. Takes the staged cache writes.
    pub fn snapshot(&mut self) -> Snapshot {
        Snapshot {
            trace: self.trace.clone(),
            pages: self.pages.clone(),
            thinking: latest_thinking(&self.trace),
            current_tool: self.current_tool.clone(),
            answer: self.final_answer(),
            cache_writes: std::mem::take(&mut self.staged),
        }
    }

    /// Metadata staged by this query wins over the shared cache.
    fn lookup(&self, page_id: &str, cache: &MetadataCache) -> Option<PageMeta> {
        self.staged
            .iter()
            .rev()
            .find(|(id, _)| id == page_id)
            .map(|(_, meta)| meta.clone())
            .or_else(|| cache.get(page_id))
    }

    /// Reasoning after the last tool result; all reasoning when no tool has
    /// answered yet.
    pub fn final_answer(&self) -> String {
        match last_tool_result_index(&self.trace) {
            Some(_) => extract_final_answer(&self.trace),
            None => self.reasoning.concat(),
        }
    }

    fn on_text(&mut self, content: String) {
        if content.is_empty() {
            return;
        }
        self.reasoning.push(content.clone());
        match self.trace.last_mut() {
            Some(TraceStep::Reasoning { content: last }) => last.push_str(&content),
            _ => self.trace.push(TraceStep::Reasoning { content }),
        }
    }

    fn on_tool_call(&mut self, tool: String, input: Value, cache: &MetadataCache) {
        debug!(query_id = %self.query_id, tool, "tool call");

        // Resolve from what is already known so pages can load before the
        // result round-trip; the result pass skips anything added here.
        if ToolKind::classify(&tool) == ToolKind::SelectPages {
            let requested = tools::requested_page_ids(&input);
            let (resolved, missing) = cache.resolve(requested.iter().map(String::as_str), &self.staged);
            if !missing.is_empty() {
                debug!(query_id = %self.query_id, ?missing, "pages not cached yet");
            }
            merge_pages(&mut self.pages, resolved);
        }

        self.current_tool = Some(tool.clone());
        self.trace.push(TraceStep::ToolCall { tool, input });
    }

    fn on_tool_result(&mut self, tool: String, result: Value, cache: &MetadataCache) {
        let call_input = self.originating_input(&tool);

        match ToolKind::classify(&tool) {
            ToolKind::PageSearch => {
                let entries = tools::page_records(&result)
                    .into_iter()
                    .map(tools::PageRecord::into_entry);
                self.staged.extend(entries);
            }
            ToolKind::SelectPages => self.select_pages(&result, call_input.as_ref(), cache),
            ToolKind::SelectPointers => self.select_pointers(&result, call_input.as_ref(), cache),
            ToolKind::Other => {}
        }

        if self.current_tool.as_deref() == Some(tool.as_str()) {
            self.current_tool = None;
        }
        self.trace.push(TraceStep::ToolResult { tool, result });
    }

    /// Input of the latest call to `tool`. Calls and results are normally
    /// adjacent but nothing here relies on it.
    fn originating_input(&self, tool: &str) -> Option<Value> {
        self.trace.iter().rev().find_map(|step| match step {
            TraceStep::ToolCall { tool: t, input } if t == tool => Some(input.clone()),
            _ => None,
        })
    }

    fn select_pages(&mut self, result: &Value, call_input: Option<&Value>, cache: &MetadataCache) {
        let records = tools::page_records(result);
        let mut requested = call_input.map(tools::requested_page_ids).unwrap_or_default();
        if requested.is_empty() {
            requested = records.iter().map(|r| r.page_id.clone()).collect();
        }
        self.staged
            .extend(records.into_iter().map(tools::PageRecord::into_entry));

        let fresh = requested
            .iter()
            .filter(|id| !self.pages.iter().any(|p| &p.page_id == *id))
            .map(String::as_str);
        let (resolved, missing) = cache.resolve(fresh, &self.staged);
        if !missing.is_empty() {
            warn!(
                query_id = %self.query_id,
                ?missing,
                "selected pages missing from metadata cache, dropped"
            );
        }
        merge_pages(&mut self.pages, resolved);
    }

    fn select_pointers(&mut self, result: &Value, call_input: Option<&Value>, cache: &MetadataCache) {
        let requested = call_input.map(tools::requested_pointer_ids).unwrap_or_default();
        let mut records = tools::pointer_records(result);

        // Requested pointers first, in request order; anything extra the
        // result carried follows in payload order.
        if !requested.is_empty() {
            let mut ordered = Vec::with_capacity(records.len());
            for id in &requested {
                if let Some(pos) = records.iter().position(|r| &r.pointer_id == id) {
                    ordered.push(records.remove(pos));
                }
            }
            ordered.append(&mut records);
            records = ordered;
        }

        let mut groups: Vec<(PageId, Vec<Pointer>)> = Vec::new();
        for record in records {
            let (page_id, pointer) = record.into_pointer();
            match groups.iter_mut().find(|(id, _)| *id == page_id) {
                Some((_, pointers)) => pointers.push(pointer),
                None => groups.push((page_id, vec![pointer])),
            }
        }

        let mut unresolved = Vec::new();
        for (page_id, pointers) in groups {
            if let Some(page) = self.pages.iter_mut().find(|p| p.page_id == page_id) {
                merge_pointers(&mut page.pointers, pointers);
                continue;
            }
            match self.lookup(&page_id, cache) {
                Some(meta) => {
                    let mut page = SelectedPage::from_meta(page_id, &meta);
                    merge_pointers(&mut page.pointers, pointers);
                    self.pages.push(page);
                }
                None => unresolved.push(page_id),
            }
        }
        if !unresolved.is_empty() {
            warn!(
                query_id = %self.query_id,
                ?unresolved,
                "pointers reference pages missing from metadata cache, dropped"
            );
        }
    }
}

/// Merge pages into a list. Known pages keep their position and gain any new
/// pointers; unknown pages are appended in the order given. Returns how many
/// pages were appended.
pub fn merge_pages(existing: &mut Vec<SelectedPage>, incoming: Vec<SelectedPage>) -> usize {
    let mut added = 0;
    for page in incoming {
        match existing.iter_mut().find(|p| p.page_id == page.page_id) {
            Some(current) => {
                merge_pointers(&mut current.pointers, page.pointers);
            }
            None => {
                let mut page = page;
                let pointers = std::mem::take(&mut page.pointers);
                merge_pointers(&mut page.pointers, pointers);
                existing.push(page);
                added += 1;
            }
        }
    }
    added
}

/// Append pointers whose id is not present yet. The first pointer seen for
/// an id wins.
pub fn merge_pointers(existing: &mut Vec<Pointer>, incoming: Vec<Pointer>) -> usize {
    let mut added = 0;
    for pointer in incoming {
        if existing.iter().any(|p| p.pointer_id == pointer.pointer_id) {
            continue;
        }
        existing.push(pointer);
        added += 1;
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::{BoundingBox, PageMeta};
    use serde_json::json;

    fn cache_with(ids: &[&str]) -> MetadataCache {
        let cache = MetadataCache::new();
        for id in ids {
            cache.insert(
                *id,
                PageMeta {
                    file_path: format!("{}.pdf", id),
                    page_name: id.to_uppercase(),
                    discipline_id: None,
                },
            );
        }
        cache
    }

    fn text(content: &str) -> AgentEvent {
        AgentEvent::Text {
            content: content.to_string(),
        }
    }

    fn call(tool: &str, input: Value) -> AgentEvent {
        AgentEvent::ToolCall {
            tool: tool.to_string(),
            input,
        }
    }

    fn result(tool: &str, result: Value) -> AgentEvent {
        AgentEvent::ToolResult {
            tool: tool.to_string(),
            result,
        }
    }

    fn done() -> AgentEvent {
        AgentEvent::Done {
            display_title: Some("Title".to_string()),
            conversation_title: None,
        }
    }

    fn page_ids(pages: &[SelectedPage]) -> Vec<&str> {
        pages.iter().map(|p| p.page_id.as_str()).collect()
    }

    fn pointer(id: &str, page: &str, label: &str) -> Value {
        json!({"pointer_id": id, "page_id": page, "label": label, "bbox": [0.1, 0.2, 0.3, 0.4]})
    }

    #[test]
    fn test_text_fragments_coalesce() {
        let cache = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        acc.apply(text("Looking at "), &cache);
        let outcome = acc.apply(text("the plans. Next"), &cache);

        assert_eq!(acc.trace().len(), 1);
        assert_eq!(acc.trace()[0], TraceStep::reasoning("Looking at the plans. Next"));
        match outcome {
            Outcome::Progress(snapshot) => {
                assert_eq!(snapshot.thinking.as_deref(), Some("Looking at the plans."));
                assert_eq!(snapshot.answer, "Looking at the plans. Next");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_current_tool_tracks_call_and_result() {
        let cache = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        let Outcome::Progress(snap) = acc.apply(call("search_pages", json!({"q": "door"})), &cache) else {
            panic!("expected progress");
        };
        assert_eq!(snap.current_tool.as_deref(), Some("search_pages"));
        let Outcome::Progress(snap) = acc.apply(result("search_pages", json!([])), &cache) else {
            panic!("expected progress");
        };
        assert_eq!(snap.current_tool, None);
    }

    #[test]
    fn test_search_result_staged_for_cache() {
        let cache = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        acc.apply(call("search_pages", json!({"query": "stairs"})), &cache);
        let outcome = acc.apply(
            result(
                "search_pages",
                json!({"pages": [{"page_id": "p1", "page_name": "A101", "file_path": "a.pdf", "discipline_id": "arch"}]}),
            ),
            &cache,
        );

        // The reducer never writes the shared cache itself.
        assert!(cache.is_empty());
        let Outcome::Progress(snapshot) = outcome else {
            panic!("expected progress");
        };
        assert_eq!(snapshot.cache_writes.len(), 1);
        let (id, meta) = &snapshot.cache_writes[0];
        assert_eq!(id, "p1");
        assert_eq!(meta.page_name, "A101");
        assert_eq!(meta.discipline_id.as_deref(), Some("arch"));

        let Outcome::Progress(next) = acc.apply(text("ok"), &cache) else {
            panic!("expected progress");
        };
        assert!(next.cache_writes.is_empty());
    }

    #[test]
    fn test_select_pages_resolves_records_in_same_result() {
        let cache = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        acc.apply(call("select_pages", json!({"page_ids": ["p7"]})), &cache);
        acc.apply(
            result(
                "select_pages",
                json!([{"page_id": "p7", "page_name": "E701", "file_path": "e.pdf"}]),
            ),
            &cache,
        );
        assert_eq!(page_ids(acc.pages()), vec!["p7"]);
        assert_eq!(acc.pages()[0].page_name, "E701");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_select_pages_follows_request_order_and_drops_unknown() {
        let empty = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        acc.apply(call("select_pages", json!({"page_ids": ["p3", "missing", "p1", "p2"]})), &empty);
        assert!(acc.pages().is_empty());

        let cache = cache_with(&["p1", "p2", "p3"]);
        acc.apply(
            result("select_pages", json!({"selected": ["p2", "p1", "missing", "p3"]})),
            &cache,
        );
        assert_eq!(page_ids(acc.pages()), vec!["p3", "p1", "p2"]);
    }

    #[test]
    fn test_select_pages_optimistic_then_result_no_duplicates() {
        let cache = cache_with(&["p1", "p2"]);
        let mut acc = Accumulator::new("q1");
        acc.apply(call("select_pages", json!({"page_ids": ["p2", "p1"]})), &cache);
        assert_eq!(page_ids(acc.pages()), vec!["p2", "p1"]);

        acc.apply(result("select_pages", json!({"ok": true})), &cache);
        assert_eq!(page_ids(acc.pages()), vec!["p2", "p1"]);
    }

    #[test]
    fn test_select_pages_across_calls_appends() {
        let cache = cache_with(&["p1", "p2", "p3"]);
        let mut acc = Accumulator::new("q1");
        acc.apply(call("select_pages", json!({"page_ids": ["p2"]})), &cache);
        acc.apply(result("select_pages", json!({})), &cache);
        acc.apply(call("select_pages", json!({"page_ids": ["p3", "p2", "p1"]})), &cache);
        acc.apply(result("select_pages", json!({})), &cache);
        assert_eq!(page_ids(acc.pages()), vec!["p2", "p3", "p1"]);
    }

    #[test]
    fn test_select_pointers_groups_by_page_in_request_order() {
        let cache = cache_with(&["p1", "p2"]);
        let mut acc = Accumulator::new("q1");
        acc.apply(
            call("select_pointers", json!({"pointer_ids": ["r3", "r1", "r2", "r9"]})),
            &cache,
        );
        acc.apply(
            result(
                "select_pointers",
                json!({"pointers": [
                    pointer("r1", "p1", "Door"),
                    pointer("r2", "p2", "Stair"),
                    pointer("r3", "p2", "Ramp"),
                    pointer("r4", "p404", "Lost")
                ]}),
            ),
            &cache,
        );

        assert_eq!(page_ids(acc.pages()), vec!["p2", "p1"]);
        let p2: Vec<&str> = acc.pages()[0].pointers.iter().map(|p| p.pointer_id.as_str()).collect();
        assert_eq!(p2, vec!["r3", "r2"]);
        assert_eq!(acc.pages()[1].pointers[0].label, "Door");
    }

    #[test]
    fn test_select_pointers_dedup_keeps_first_seen() {
        let cache = cache_with(&["p1"]);
        let mut acc = Accumulator::new("q1");
        acc.apply(call("select_pointers", json!({"pointer_ids": ["r1", "r2"]})), &cache);
        acc.apply(
            result("select_pointers", json!([pointer("r1", "p1", "first"), pointer("r2", "p1", "B")])),
            &cache,
        );
        acc.apply(call("select_pointers", json!({"pointer_ids": ["r2", "r1", "r3"]})), &cache);
        acc.apply(
            result(
                "select_pointers",
                json!([pointer("r1", "p1", "second"), pointer("r3", "p1", "C"), pointer("r2", "p1", "B2")]),
            ),
            &cache,
        );

        let page = &acc.pages()[0];
        let ids: Vec<&str> = page.pointers.iter().map(|p| p.pointer_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert_eq!(page.pointers[0].label, "first");
        assert_eq!(page.pointers[1].label, "B");
    }

    #[test]
    fn test_done_extracts_answer_after_last_tool_result() {
        let cache = cache_with(&["p1"]);
        let mut acc = Accumulator::new("q1");
        acc.apply(text("Let me search."), &cache);
        acc.apply(call("select_pages", json!({"page_ids": ["p1"]})), &cache);
        acc.apply(result("select_pages", json!({})), &cache);
        acc.apply(text("The door "), &cache);
        acc.apply(text("is 36 inches."), &cache);

        match acc.apply(done(), &cache) {
            Outcome::Complete(finished) => {
                assert_eq!(finished.answer, "The door is 36 inches.");
                assert_eq!(finished.display_title.as_deref(), Some("Title"));
                assert_eq!(page_ids(&finished.pages), vec!["p1"]);
                assert_eq!(finished.trace.len(), 4);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(acc.apply(text("late"), &cache), Outcome::Ignored);
    }

    #[test]
    fn test_done_without_tool_result_uses_all_reasoning() {
        let cache = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        acc.apply(text("Hello "), &cache);
        acc.apply(call("search_pages", json!({})), &cache);
        acc.apply(text("world"), &cache);
        let Outcome::Complete(finished) = acc.apply(done(), &cache) else {
            panic!("expected completion");
        };
        assert_eq!(finished.answer, "Hello world");
    }

    #[test]
    fn test_error_event_message() {
        let cache = MetadataCache::new();
        let mut acc = Accumulator::new("q1");
        assert_eq!(
            acc.apply(AgentEvent::Error { message: Some("quota".into()) }, &cache),
            Outcome::Failed("quota".to_string())
        );

        let mut acc = Accumulator::new("q2");
        assert_eq!(
            acc.apply(AgentEvent::Error { message: None }, &cache),
            Outcome::Failed(GENERIC_AGENT_ERROR.to_string())
        );
    }

    #[test]
    fn test_merge_pages_merges_pointers_of_known_page() {
        let bbox = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        };
        let page = |pointers: Vec<Pointer>| SelectedPage {
            page_id: "p1".to_string(),
            page_name: "A101".to_string(),
            file_path: "a.pdf".to_string(),
            discipline_id: None,
            pointers,
        };
        let ptr = |id: &str| Pointer {
            pointer_id: id.to_string(),
            label: id.to_string(),
            bbox,
        };

        let mut pages = vec![page(vec![ptr("r1")])];
        let added = merge_pages(&mut pages, vec![page(vec![ptr("r1"), ptr("r2")])]);
        assert_eq!(added, 0);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].pointers.len(), 2);
    }
}
