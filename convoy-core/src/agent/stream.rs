//! Agent event-stream parsing
//!
//! Agents write one JSON object per line on stdout. Several schemas are in
//! the wild: the claude stream-json format (content-block arrays), older
//! direct-message variants, and the item events emitted by codex-style
//! tools. Every line is normalized into [`AgentMessage`]; a line that is not
//! JSON at all becomes a single assistant message carrying the raw text, so
//! nothing an agent prints is ever lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    Assistant,
    ToolUse,
    ToolResult,
    Result,
}

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    Claude,
    Codex,
    Gemini,
    /// The orchestrator itself (fallback notices, bookkeeping)
    System,
}

/// One normalized event from an agent's output stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    /// Original line for output that matched no known schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl AgentMessage {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            agent: None,
            content: None,
            tool_name: None,
            tool_input: None,
            tool_result: None,
            raw: None,
        }
    }

    /// A message originating from the orchestrator rather than an agent
    pub fn system(content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::System);
        msg.agent = Some(AgentId::System);
        msg.content = Some(content.into());
        msg
    }

    /// A plain assistant text message
    pub fn assistant_text(content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Assistant);
        msg.content = Some(content.into());
        msg
    }

    fn with_agent(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }
}

/// Parse one stdout line into zero or more normalized messages
///
/// A single claude `assistant` event can carry several content blocks (text
/// plus tool uses), so one line may yield several messages.
pub fn parse_line(line: &str, agent: AgentId) -> Vec<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            let mut msg = AgentMessage::assistant_text(trimmed).with_agent(agent);
            msg.raw = Some(trimmed.to_string());
            return vec![msg];
        }
    };

    match parse_value(&value, agent) {
        Some(messages) if !messages.is_empty() => messages,
        _ => {
            // Valid JSON, unknown schema: keep it raw
            let mut msg = AgentMessage::new(MessageKind::Assistant).with_agent(agent);
            msg.raw = Some(trimmed.to_string());
            vec![msg]
        }
    }
}

fn parse_value(value: &Value, agent: AgentId) -> Option<Vec<AgentMessage>> {
    let kind = value.get("type")?.as_str()?;

    match kind {
        "system" => {
            let mut msg = AgentMessage::new(MessageKind::System).with_agent(agent);
            msg.content = value
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(vec![msg])
        }

        "assistant" => Some(parse_assistant(value, agent)),

        // claude wraps tool results in user messages
        "user" => Some(parse_tool_results(value, agent)),

        // Legacy direct variants
        "tool_use" => {
            let mut msg = AgentMessage::new(MessageKind::ToolUse).with_agent(agent);
            msg.tool_name = value
                .get("tool")
                .or_else(|| value.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            msg.tool_input = value.get("input").cloned();
            Some(vec![msg])
        }
        "tool_result" => {
            let mut msg = AgentMessage::new(MessageKind::ToolResult).with_agent(agent);
            msg.tool_result = value
                .get("output")
                .or_else(|| value.get("content"))
                .map(value_text);
            Some(vec![msg])
        }

        "result" => {
            let mut msg = AgentMessage::new(MessageKind::Result).with_agent(agent);
            msg.content = value
                .get("result")
                .map(value_text)
                .or_else(|| value.get("subtype").and_then(Value::as_str).map(str::to_string));
            Some(vec![msg])
        }

        // codex-style item events
        "item.started" | "item.updated" | "item.completed" => {
            parse_item_event(kind, value, agent)
        }
        "turn.completed" => {
            let mut msg = AgentMessage::new(MessageKind::Result).with_agent(agent);
            msg.content = Some("turn completed".to_string());
            Some(vec![msg])
        }

        _ => None,
    }
}

fn parse_assistant(value: &Value, agent: AgentId) -> Vec<AgentMessage> {
    let message = value.get("message");

    // Legacy form: message.content is a plain string
    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return vec![AgentMessage::assistant_text(text).with_agent(agent)];
    }

    // stream-json form: message.content is an array of blocks
    let Some(blocks) = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut messages = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    messages.push(AgentMessage::assistant_text(text).with_agent(agent));
                }
            }
            Some("tool_use") => {
                let mut msg = AgentMessage::new(MessageKind::ToolUse).with_agent(agent);
                msg.tool_name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                msg.tool_input = block.get("input").cloned();
                messages.push(msg);
            }
            _ => {}
        }
    }
    messages
}

fn parse_tool_results(value: &Value, agent: AgentId) -> Vec<AgentMessage> {
    let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut messages = Vec::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            let mut msg = AgentMessage::new(MessageKind::ToolResult).with_agent(agent);
            msg.tool_result = block.get("content").map(value_text);
            messages.push(msg);
        }
    }
    messages
}

fn parse_item_event(kind: &str, value: &Value, agent: AgentId) -> Option<Vec<AgentMessage>> {
    // Only completed items carry final payloads worth recording
    if kind != "item.completed" {
        return Some(Vec::new());
    }

    let item = value.get("item")?;
    let item_type = item.get("type").and_then(Value::as_str)?;

    let msg = match item_type {
        "agent_message" | "reasoning" => {
            let text = item
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut msg = AgentMessage::assistant_text(text).with_agent(agent);
            msg.timestamp = Utc::now();
            msg
        }
        "command_execution" => {
            let mut msg = AgentMessage::new(MessageKind::ToolUse).with_agent(agent);
            msg.tool_name = Some("command".to_string());
            msg.tool_input = item.get("command").cloned();
            msg.tool_result = item
                .get("aggregated_output")
                .and_then(Value::as_str)
                .map(str::to_string);
            msg
        }
        _ => {
            let mut msg = AgentMessage::new(MessageKind::Assistant).with_agent(agent);
            msg.raw = Some(item.to_string());
            msg
        }
    };

    Some(vec![msg])
}

/// Flatten a JSON value into display text
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                b.get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| b.as_str().map(str::to_string))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Extract the plain text of every assistant message, in order
pub fn assistant_text(messages: &[AgentMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.kind == MessageKind::Assistant)
        .filter_map(|m| m.content.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_json_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let messages = parse_line(line, AgentId::Claude);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Assistant);
        assert_eq!(messages[0].content.as_deref(), Some("working on it"));
        assert_eq!(messages[1].kind, MessageKind::ToolUse);
        assert_eq!(messages[1].tool_name.as_deref(), Some("Bash"));
        assert_eq!(messages[1].tool_input.as_ref().unwrap()["command"], "ls");
    }

    #[test]
    fn test_parse_legacy_assistant_string() {
        let line = r#"{"type":"assistant","message":{"content":"plain text"}}"#;
        let messages = parse_line(line, AgentId::Claude);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.as_deref(), Some("plain text"));
    }

    #[test]
    fn test_parse_user_tool_result() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"file contents here"}]}}"#;
        let messages = parse_line(line, AgentId::Claude);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::ToolResult);
        assert_eq!(
            messages[0].tool_result.as_deref(),
            Some("file contents here")
        );
    }

    #[test]
    fn test_parse_legacy_direct_tool_use() {
        let line = r#"{"type":"tool_use","tool":"Read","input":{"file":"/x"}}"#;
        let messages = parse_line(line, AgentId::Claude);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tool_name.as_deref(), Some("Read"));
    }

    #[test]
    fn test_parse_result() {
        let line = r#"{"type":"result","result":"All steps implemented"}"#;
        let messages = parse_line(line, AgentId::Claude);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Result);
        assert_eq!(messages[0].content.as_deref(), Some("All steps implemented"));
    }

    #[test]
    fn test_parse_item_completed_agent_message() {
        let line = r#"{"type":"item.completed","item":{"type":"agent_message","text":"done"}}"#;
        let messages = parse_line(line, AgentId::Codex);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Assistant);
        assert_eq!(messages[0].content.as_deref(), Some("done"));
        assert_eq!(messages[0].agent, Some(AgentId::Codex));
    }

    #[test]
    fn test_parse_item_completed_command() {
        let line = r#"{"type":"item.completed","item":{"type":"command_execution","command":"cargo check","aggregated_output":"ok"}}"#;
        let messages = parse_line(line, AgentId::Codex);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::ToolUse);
        assert_eq!(messages[0].tool_result.as_deref(), Some("ok"));
    }

    #[test]
    fn test_unparseable_line_kept_raw() {
        let messages = parse_line("Compiling convoy v0.3.1", AgentId::Gemini);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Assistant);
        assert_eq!(messages[0].raw.as_deref(), Some("Compiling convoy v0.3.1"));
        assert_eq!(
            messages[0].content.as_deref(),
            Some("Compiling convoy v0.3.1")
        );
    }

    #[test]
    fn test_unknown_json_schema_kept_raw() {
        let messages = parse_line(r#"{"event":"heartbeat"}"#, AgentId::Claude);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].raw.is_some());
    }

    #[test]
    fn test_blank_line_skipped() {
        assert!(parse_line("   ", AgentId::Claude).is_empty());
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let lines = [
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"a"}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#,
            r#"{"type":"result","result":"ok"}"#,
        ];

        let mut messages = Vec::new();
        for line in lines {
            messages.extend(parse_line(line, AgentId::Claude));
        }

        let json = serde_json::to_string(&messages).unwrap();
        let parsed: Vec<AgentMessage> = serde_json::from_str(&json).unwrap();

        let kinds: Vec<MessageKind> = parsed.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::System,
                MessageKind::Assistant,
                MessageKind::ToolUse,
                MessageKind::Result
            ]
        );
    }

    #[test]
    fn test_assistant_text_helper() {
        let messages = vec![
            AgentMessage::assistant_text("one"),
            AgentMessage::system("ignored"),
            AgentMessage::assistant_text("two"),
        ];
        assert_eq!(assistant_text(&messages), "one\ntwo");
    }
}
