// Internal request/response representation shared by every pipeline stage.
//
// The three wire dialects disagree on every concrete detail, so the types
// here are a union of their capabilities rather than a copy of any one of
// them. Translators are total functions between a dialect and this model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    ChatCompletions,
    Messages,
    Responses,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::ChatCompletions => "chat-completions",
            Dialect::Messages => "messages",
            Dialect::Responses => "responses",
        }
    }

    pub fn parse(value: &str) -> Option<Dialect> {
        match value {
            "chat-completions" | "openai" | "chat" => Some(Dialect::ChatCompletions),
            "messages" | "anthropic" => Some(Dialect::Messages),
            "responses" => Some(Dialect::Responses),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" | "model" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A single tool invocation as recorded on an assistant turn. Arguments are
/// kept as a parsed object; dialects that carry them as a JSON string
/// re-serialize at the wire boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRec {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Image { media_type: String, data: String },
    ToolCall { call: ToolCallRec },
    ToolResult { tool_call_id: String, content: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<Part>),
}

impl TurnContent {
    pub fn empty() -> TurnContent {
        TurnContent::Text(String::new())
    }

    /// Concatenated text of all textual parts. Images and tool records are
    /// skipped, matching how every dialect renders mixed content as text.
    pub fn flat_text(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Parts(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    match part {
                        Part::Text { text } => out.push(text.clone()),
                        Part::ToolResult { content, .. } => out.push(content.clone()),
                        _ => {}
                    }
                }
                out.join("")
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TurnContent::Text(text) => text.is_empty(),
            TurnContent::Parts(parts) => parts.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    /// Structured calls made by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRec>,
    /// Binding of a `tool` turn back to the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    pub fn text(role: Role, text: impl Into<String>) -> Turn {
        Turn {
            role,
            content: TurnContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Turn {
        Turn {
            role: Role::Tool,
            content: TurnContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Parsed inbound request, dialect-independent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Caller identity used for routing preferences, when supplied.
    pub user: Option<String>,
}

impl ChatRequest {
    /// Text of the most recent user turn, empty string if there is none.
    pub fn last_user_text(&self) -> String {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.flat_text())
            .unwrap_or_default()
    }

    pub fn has_client_tools(&self) -> bool {
        !self.tools.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Error,
}

impl Default for StopReason {
    fn default() -> Self {
        StopReason::EndTurn
    }
}

/// Monotonic token counters. Streams report usage incrementally and some
/// upstreams repeat totals, so updates keep the maximum seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn record(&mut self, input: u64, output: u64) {
        self.input = self.input.max(input);
        self.output = self.output.max(output);
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Normalized upstream response: what the model said, regardless of dialect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelReply {
    pub model: Option<String>,
    pub text: String,
    /// Chain-of-thought emitted out-of-band (`reasoning_content` and kin).
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRec>,
    #[serde(default)]
    pub stop: StopReason,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Rough token estimate for routing decisions when the client supplies no
/// counts. Four characters per token, plus a small per-message overhead.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as u64) / 4 + 1
}

pub fn estimate_request_tokens(request: &ChatRequest) -> u64 {
    let mut total = 0u64;
    for turn in &request.turns {
        total += 4;
        total += estimate_tokens(&turn.content.flat_text());
        for call in &turn.tool_calls {
            total += estimate_tokens(&call.name);
            total += estimate_tokens(&call.arguments.to_string());
        }
    }
    for tool in &request.tools {
        total += estimate_tokens(&tool.description);
        total += estimate_tokens(&tool.parameters.to_string());
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_text_joins_text_parts() {
        let content = TurnContent::Parts(vec![
            Part::Text { text: "Hello ".into() },
            Part::Image { media_type: "image/png".into(), data: "AAAA".into() },
            Part::Text { text: "world".into() },
        ]);
        assert_eq!(content.flat_text(), "Hello world");
    }

    #[test]
    fn last_user_text_skips_assistant_turns() {
        let request = ChatRequest {
            turns: vec![
                Turn::text(Role::User, "first"),
                Turn::text(Role::Assistant, "reply"),
                Turn::text(Role::User, "second"),
                Turn::text(Role::Assistant, "another"),
            ],
            ..Default::default()
        };
        assert_eq!(request.last_user_text(), "second");
    }

    #[test]
    fn usage_never_decrements() {
        let mut usage = TokenUsage::default();
        usage.record(10, 5);
        usage.record(4, 2);
        assert_eq!(usage, TokenUsage { input: 10, output: 5 });
        usage.record(12, 20);
        assert_eq!(usage.total(), 32);
    }

    #[test]
    fn token_estimate_scales_with_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 2);
        let request = ChatRequest {
            turns: vec![Turn::text(Role::User, "what is the weather like today")],
            ..Default::default()
        };
        assert!(estimate_request_tokens(&request) > 4);
    }

    #[test]
    fn role_parse_accepts_developer_alias() {
        assert_eq!(Role::parse("developer"), Some(Role::System));
        assert_eq!(Role::parse("tool"), Some(Role::Tool));
        assert_eq!(Role::parse("critic"), None);
    }

    #[test]
    fn tool_call_roundtrips_through_serde() {
        let call = ToolCallRec {
            id: "call_1".into(),
            name: "web_search".into(),
            arguments: json!({"query": "BTC price"}),
        };
        let encoded = serde_json::to_string(&call).unwrap();
        let decoded: ToolCallRec = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, call);
    }
}
