use burnish_core::agent::{ScoutReport, SectorReclassification};
use burnish_core::types::{Proposal, TicketOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by Claude Code (`--output-format stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message, emitted once at the very end.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },

    ToolUse { id: String, name: String, input: Value },

    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<AssistantMessage>,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
}

/// Parse a full NDJSON stream and extract the final output text.
pub fn parse_stream(data: &str) -> (String, Option<String>) {
    let mut output = String::new();
    let mut assistant_text = String::new();
    let mut session_id: Option<String> = None;

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => continue,
        };
        match event {
            AgentEvent::System(e) => {
                if let Some(sid) = e.session_id {
                    session_id = Some(sid);
                }
            }
            AgentEvent::Assistant(e) => {
                if let Some(msg) = e.message {
                    if let Some(blocks) = msg.content {
                        for block in blocks {
                            if let ContentBlock::Text { text } = block {
                                if !assistant_text.is_empty() {
                                    assistant_text.push('\n');
                                }
                                assistant_text.push_str(&text);
                            }
                        }
                    }
                }
            }
            AgentEvent::Result(e) => {
                if let Some(sid) = e.session_id {
                    session_id = Some(sid);
                }
                if let Some(text) = e.result {
                    output = text;
                }
            }
            _ => {}
        }
    }

    // Fall back to collected assistant text if result was empty
    if output.is_empty() && !assistant_text.is_empty() {
        output = assistant_text;
    }

    (output, session_id)
}

// ── Structured output extraction ─────────────────────────────────────────

/// Pull the last JSON value out of agent text: a fenced ```json block if
/// present, otherwise the last balanced `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(start) = text.rfind("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str(rest[..end].trim()) {
                return Some(v);
            }
        }
    }
    for open in ['{', '['] {
        let close = if open == '{' { '}' } else { ']' };
        if let Some(start) = text.find(open) {
            if let Some(end) = text.rfind(close) {
                if end > start {
                    if let Ok(v) = serde_json::from_str(text[start..=end].trim()) {
                        return Some(v);
                    }
                }
            }
        }
    }
    None
}

fn clamp_proposal(mut p: Proposal) -> Proposal {
    p.confidence = p.confidence.min(100);
    p.impact_score = p.impact_score.clamp(1, 10);
    p
}

/// Parse a scout's text output into a report. Accepts either a bare proposal
/// array or an object `{scanned_files, proposals, sector_reclassification}`.
/// Invalid elements are skipped rather than failing the scan.
pub fn parse_scout_output(text: &str) -> ScoutReport {
    let Some(value) = extract_json(text) else {
        return ScoutReport::default();
    };

    let (proposal_values, scanned_files, reclassification) = match &value {
        Value::Array(items) => (items.clone(), None, None),
        Value::Object(map) => {
            let proposals = map
                .get("proposals")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let scanned = map.get("scanned_files").and_then(Value::as_u64);
            let reclass = map
                .get("sector_reclassification")
                .and_then(|v| serde_json::from_value::<SectorReclassification>(v.clone()).ok());
            (proposals, scanned, reclass)
        }
        _ => (Vec::new(), None, None),
    };

    let proposals: Vec<Proposal> = proposal_values
        .into_iter()
        .filter_map(|v| serde_json::from_value::<Proposal>(v).ok())
        .map(clamp_proposal)
        .collect();

    // A scout that produced output did examine something; only an explicit
    // zero marks the sector as empty.
    let scanned_files = scanned_files.unwrap_or(1) as u32;

    ScoutReport {
        proposals,
        scanned_files,
        reclassification,
    }
}

/// Parse an execution result. A structured outcome object wins; otherwise
/// fall back to the subprocess exit status.
pub fn parse_outcome(text: &str, exit_success: bool) -> TicketOutcome {
    if let Some(value) = extract_json(text) {
        if value.get("success").is_some() {
            if let Ok(outcome) = serde_json::from_value::<TicketOutcome>(value) {
                return outcome;
            }
        }
    }
    TicketOutcome {
        success: exit_success,
        ..TicketOutcome::default()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
