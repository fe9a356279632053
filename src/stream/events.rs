use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One event emitted by the agent, decoded from a `data:` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        #[serde(default)]
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
    Done {
        #[serde(default, rename = "displayTitle")]
        display_title: Option<String>,
        #[serde(default, rename = "conversationTitle")]
        conversation_title: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl AgentEvent {
    /// Decode a parsed frame. Frames with an unknown `type`, or missing the
    /// fields their type requires, are ignored.
    pub fn from_value(value: Value) -> Option<Self> {
        match serde_json::from_value::<AgentEvent>(value.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or("<none>");
                debug!(kind, error = %e, "ignoring unrecognized agent event");
                None
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done { .. } | AgentEvent::Error { .. })
    }
}
