use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque query identifier (uuid v4 for submitted queries).
pub type QueryId = String;

/// Page identifier as issued by the agent's search tools.
pub type PageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Streaming,
    Complete,
    Error,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, QueryStatus::Streaming)
    }
}

/// One entry of a query's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceStep {
    Reasoning {
        content: String,
    },
    ToolCall {
        tool: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool: String,
        #[serde(default)]
        result: Value,
    },
}

impl TraceStep {
    pub fn reasoning(content: impl Into<String>) -> Self {
        TraceStep::Reasoning {
            content: content.into(),
        }
    }

    pub fn tool_call(tool: impl Into<String>, input: Value) -> Self {
        TraceStep::ToolCall {
            tool: tool.into(),
            input,
        }
    }

    pub fn tool_result(tool: impl Into<String>, result: Value) -> Self {
        TraceStep::ToolResult {
            tool: tool.into(),
            result,
        }
    }

    pub fn as_reasoning(&self) -> Option<&str> {
        match self {
            TraceStep::Reasoning { content } => Some(content),
            _ => None,
        }
    }
}

/// Normalized region on a page, every component in the 0..1 page space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "BoundingBoxRepr")]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Agents send boxes either as `[x, y, w, h]` or as an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum BoundingBoxRepr {
    Array([f64; 4]),
    Object {
        x: f64,
        y: f64,
        #[serde(alias = "w")]
        width: f64,
        #[serde(alias = "h")]
        height: f64,
    },
}

impl From<BoundingBoxRepr> for BoundingBox {
    fn from(repr: BoundingBoxRepr) -> Self {
        match repr {
            BoundingBoxRepr::Array([x, y, width, height]) => Self {
                x,
                y,
                width,
                height,
            },
            BoundingBoxRepr::Object {
                x,
                y,
                width,
                height,
            } => Self {
                x,
                y,
                width,
                height,
            },
        }
    }
}

/// A labeled region highlighted on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub pointer_id: String,
    pub label: String,
    pub bbox: BoundingBox,
}

/// Descriptive metadata for a page, as discovered by search tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    pub file_path: String,
    pub page_name: String,
    #[serde(default)]
    pub discipline_id: Option<String>,
}

/// A page selected for display, with the pointers highlighted on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedPage {
    pub page_id: PageId,
    pub page_name: String,
    pub file_path: String,
    #[serde(default)]
    pub discipline_id: Option<String>,
    #[serde(default)]
    pub pointers: Vec<Pointer>,
}

impl SelectedPage {
    pub fn from_meta(page_id: impl Into<PageId>, meta: &PageMeta) -> Self {
        Self {
            page_id: page_id.into(),
            page_name: meta.page_name.clone(),
            file_path: meta.file_path.clone(),
            discipline_id: meta.discipline_id.clone(),
            pointers: Vec::new(),
        }
    }

    pub fn meta(&self) -> PageMeta {
        PageMeta {
            file_path: self.file_path.clone(),
            page_name: self.page_name.clone(),
            discipline_id: self.discipline_id.clone(),
        }
    }
}

/// Structured response attached to a query once it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub pages: Vec<SelectedPage>,
    pub trace: Vec<TraceStep>,
    pub display_title: Option<String>,
    pub conversation_title: Option<String>,
    pub elapsed_ms: i64,
}

/// One user question and everything the agent produced for it so far.
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub id: QueryId,
    pub question: String,
    pub conversation_id: Option<String>,
    pub viewing_page_id: Option<PageId>,
    pub status: QueryStatus,
    pub trace: Vec<TraceStep>,
    pub pages: Vec<SelectedPage>,
    pub thinking: String,
    pub answer: String,
    pub display_title: Option<String>,
    pub conversation_title: Option<String>,
    pub current_tool: Option<String>,
    pub error: Option<String>,
    /// Wall-clock submission time, for display.
    pub started_at: DateTime<Utc>,
    /// Monotonic submission time; elapsed durations are measured from here.
    #[serde(skip)]
    pub submitted: Instant,
    pub response: Option<QueryResponse>,
    /// Rebuilt from history rather than streamed.
    pub restored: bool,
}

impl Query {
    pub fn streaming(
        id: QueryId,
        question: impl Into<String>,
        conversation_id: Option<String>,
        viewing_page_id: Option<PageId>,
    ) -> Self {
        Self {
            id,
            question: question.into(),
            conversation_id,
            viewing_page_id,
            status: QueryStatus::Streaming,
            trace: Vec::new(),
            pages: Vec::new(),
            thinking: String::new(),
            answer: String::new(),
            display_title: None,
            conversation_title: None,
            current_tool: None,
            error: None,
            started_at: Utc::now(),
            submitted: Instant::now(),
            response: None,
            restored: false,
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.submitted.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Payload handed to the completion hook when a query finishes.
#[derive(Debug, Clone, Serialize)]
pub struct QueryCompletion {
    pub query_id: QueryId,
    pub question: String,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub pages: Vec<SelectedPage>,
    pub answer: String,
    pub trace: Vec<TraceStep>,
    pub elapsed_ms: i64,
}
