use super::types::TraceStep;

/// Longest thinking summary shown when a thought has no sentence break.
const THINKING_MAX_CHARS: usize = 100;

/// Position of the last tool result in the trace.
///
/// Scanned on demand instead of tracked: the trace is the only record of
/// ordering, so the answer boundary is always derived from it.
pub fn last_tool_result_index(trace: &[TraceStep]) -> Option<usize> {
    trace
        .iter()
        .rposition(|step| matches!(step, TraceStep::ToolResult { .. }))
}

/// The answer is the reasoning after the last tool result. Reasoning before
/// it was scratch work. With no tool result at all, everything the agent
/// said is the answer.
pub fn extract_final_answer(trace: &[TraceStep]) -> String {
    let start = last_tool_result_index(trace).map(|i| i + 1).unwrap_or(0);
    trace[start..]
        .iter()
        .filter_map(TraceStep::as_reasoning)
        .collect()
}

/// One-line summary of the most recent reasoning entry, if any.
pub fn latest_thinking(trace: &[TraceStep]) -> Option<String> {
    let content = trace.iter().rev().find_map(TraceStep::as_reasoning)?;
    let summary = summarize_thought(content);
    if summary.is_empty() {
        None
    } else {
        Some(summary)
    }
}

/// Strip markdown markers and cut to the first sentence, or to
/// `THINKING_MAX_CHARS` with an ellipsis when no sentence ends.
pub fn summarize_thought(content: &str) -> String {
    let plain = strip_markdown(content);

    if let Some(end) = plain.find(['.', '!', '?']) {
        return plain[..=end].trim().to_string();
    }

    if plain.chars().count() > THINKING_MAX_CHARS {
        let cut: String = plain.chars().take(THINKING_MAX_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        plain
    }
}

/// Flatten markdown headings, list markers and emphasis into one line.
fn strip_markdown(content: &str) -> String {
    let mut words: Vec<&str> = Vec::new();
    for line in content.lines() {
        let line = strip_line_marker(line.trim());
        words.extend(line.split_whitespace());
    }
    words.join(" ").replace("**", "").replace("__", "")
}

fn strip_line_marker(line: &str) -> &str {
    let line = line.trim_start_matches('#').trim_start();
    for marker in ["- ", "* ", "+ ", "> "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    // Numbered list: "12. item"
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ") {
            return rest.trim_start();
        }
    }
    line
}
