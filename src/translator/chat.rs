// The chat-completions dialect: `messages[]` with an inline system role,
// tool calls under `choices[0].message.tool_calls` with JSON-string
// arguments, usage as prompt/completion tokens, streaming as
// `chat.completion.chunk` frames terminated by `[DONE]`.

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};

use super::StreamEvent;
use crate::envelope::{
    ChatRequest, ModelReply, Part, Role, StopReason, TokenUsage, ToolCallRec, ToolDef, Turn,
    TurnContent,
};

pub fn parse_request(body: &Value) -> Result<ChatRequest> {
    let messages = body
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("Missing messages array"))?;

    let mut turns = Vec::new();
    for msg in messages {
        let role = msg
            .get("role")
            .and_then(|v| v.as_str())
            .and_then(Role::parse)
            .ok_or_else(|| anyhow::anyhow!("Message without a valid role"))?;

        let content = parse_content(msg.get("content").unwrap_or(&Value::Null));
        let tool_calls = parse_tool_calls(msg.get("tool_calls"));
        let tool_call_id = msg
            .get("tool_call_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        turns.push(Turn { role, content, tool_calls, tool_call_id });
    }

    Ok(ChatRequest {
        model: body.get("model").and_then(|v| v.as_str()).map(|s| s.to_string()),
        turns,
        tools: parse_tools(body.get("tools")),
        stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        temperature: body
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32),
        max_tokens: body
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        user: body.get("user").and_then(|v| v.as_str()).map(|s| s.to_string()),
    })
}

fn parse_content(content: &Value) -> TurnContent {
    match content {
        Value::String(text) => TurnContent::Text(text.clone()),
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match item_type {
                    "text" => {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                            parts.push(Part::Text { text: text.to_string() });
                        }
                    }
                    "image_url" => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if let Some((media_type, data)) = parse_data_url(url) {
                            parts.push(Part::Image { media_type, data });
                        }
                    }
                    _ => {}
                }
            }
            TurnContent::Parts(parts)
        }
        _ => TurnContent::empty(),
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let mut pieces = rest.splitn(2, ',');
    let header = pieces.next()?;
    let data = pieces.next()?;
    let media_type = header.split(';').next().unwrap_or("").to_string();
    Some((media_type, data.to_string()))
}

fn parse_tool_calls(raw: Option<&Value>) -> Vec<ToolCallRec> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut calls = Vec::new();
    for item in items {
        let function = item.get("function").unwrap_or(&Value::Null);
        let name = function.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let arguments = function
            .get("arguments")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .unwrap_or_else(|| json!({}));
        calls.push(ToolCallRec {
            id: item
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            name: name.to_string(),
            arguments,
        });
    }
    calls
}

fn parse_tools(raw: Option<&Value>) -> Vec<ToolDef> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut tools = Vec::new();
    for item in items {
        if item.get("type").and_then(|v| v.as_str()).unwrap_or("function") != "function" {
            continue;
        }
        let Some(function) = item.get("function") else { continue };
        let Some(name) = function.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        tools.push(ToolDef {
            name: name.to_string(),
            description: function
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            parameters: function.get("parameters").cloned().unwrap_or_else(|| json!({})),
        });
    }
    tools
}

pub fn build_request(request: &ChatRequest) -> Value {
    let mut messages = Vec::new();
    for turn in &request.turns {
        let mut msg = json!({
            "role": turn.role.as_str(),
            "content": build_content(&turn.content),
        });
        if !turn.tool_calls.is_empty() {
            msg["tool_calls"] = Value::Array(
                turn.tool_calls.iter().map(tool_call_to_wire).collect(),
            );
        }
        if let Some(ref id) = turn.tool_call_id {
            msg["tool_call_id"] = json!(id);
        }
        messages.push(msg);
    }

    let mut body = json!({ "messages": messages });
    if let Some(ref model) = request.model {
        body["model"] = json!(model);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if request.stream {
        body["stream"] = json!(true);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(ref user) = request.user {
        body["user"] = json!(user);
    }
    body
}

fn build_content(content: &TurnContent) -> Value {
    match content {
        TurnContent::Text(text) => json!(text),
        TurnContent::Parts(parts) => {
            let mut items = Vec::new();
            for part in parts {
                match part {
                    Part::Text { text } => items.push(json!({"type": "text", "text": text})),
                    Part::Image { media_type, data } => items.push(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
                    })),
                    // Tool records travel on dedicated fields in this dialect.
                    Part::ToolCall { .. } | Part::ToolResult { .. } => {}
                }
            }
            Value::Array(items)
        }
    }
}

fn tool_call_to_wire(call: &ToolCallRec) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": call.arguments.to_string(),
        }
    })
}

pub fn parse_reply(body: &Value) -> ModelReply {
    let message = body
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|v| v.get("message"))
        .cloned()
        .unwrap_or(Value::Null);

    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let reasoning = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let finish = body
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|v| v.get("finish_reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop");

    let mut usage = TokenUsage::default();
    if let Some(u) = body.get("usage") {
        usage.record(
            u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        );
    }

    let tool_calls = parse_tool_calls(message.get("tool_calls"));

    ModelReply {
        model: body.get("model").and_then(|v| v.as_str()).map(|s| s.to_string()),
        text,
        reasoning,
        stop: match finish {
            "length" => StopReason::MaxTokens,
            "tool_calls" => StopReason::ToolUse,
            _ if !tool_calls.is_empty() => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        },
        tool_calls,
        usage,
    }
}

fn finish_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        _ => "stop",
    }
}

pub fn build_reply(reply: &ModelReply, request_id: &str) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": reply.text,
    });
    if !reply.tool_calls.is_empty() {
        message["tool_calls"] =
            Value::Array(reply.tool_calls.iter().map(tool_call_to_wire).collect());
    }

    json!({
        "id": format!("chatcmpl-{}", request_id),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": reply.model.clone().unwrap_or_default(),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason(reply.stop),
        }],
        "usage": {
            "prompt_tokens": reply.usage.input,
            "completion_tokens": reply.usage.output,
            "total_tokens": reply.usage.total(),
        }
    })
}

pub fn parse_stream_data(data: &str) -> Vec<StreamEvent> {
    if data == "[DONE]" {
        return vec![StreamEvent::Done { stop: StopReason::EndTurn }];
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first());

    if let Some(choice) = choice {
        let delta = choice.get("delta").unwrap_or(&Value::Null);
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }
        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(StreamEvent::ReasoningDelta(text.to_string()));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let function = call.get("function").unwrap_or(&Value::Null);
                if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                    events.push(StreamEvent::ToolCallStart {
                        index,
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(fragment) = function.get("arguments").and_then(|v| v.as_str()) {
                    if !fragment.is_empty() {
                        events.push(StreamEvent::ToolCallArguments {
                            index,
                            fragment: fragment.to_string(),
                        });
                    }
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            events.push(StreamEvent::Done {
                stop: match reason {
                    "length" => StopReason::MaxTokens,
                    "tool_calls" => StopReason::ToolUse,
                    _ => StopReason::EndTurn,
                },
            });
        }
    }

    if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
        let mut usage = TokenUsage::default();
        usage.record(
            u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        );
        events.push(StreamEvent::Usage(usage));
    }

    events
}

/// Client-bound chunk emitter for this dialect.
pub struct StreamEmitter {
    id: String,
    model: String,
    created: i64,
    first: bool,
}

impl StreamEmitter {
    pub fn new(request_id: &str, model: &str) -> StreamEmitter {
        StreamEmitter {
            id: format!("chatcmpl-{}", request_id),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            first: true,
        }
    }

    fn chunk(&self, delta: Value, finish: Option<&str>) -> String {
        let frame = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }]
        });
        format!("data: {}\n\n", frame)
    }

    pub fn open(&mut self) -> Vec<String> {
        Vec::new()
    }

    pub fn text_delta(&mut self, text: &str) -> Vec<String> {
        let mut delta = json!({"content": text});
        if self.first {
            delta["role"] = json!("assistant");
            self.first = false;
        }
        vec![self.chunk(delta, None)]
    }

    pub fn tool_calls(&mut self, calls: &[ToolCallRec]) -> Vec<String> {
        if calls.is_empty() {
            return Vec::new();
        }
        let wire: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let mut v = tool_call_to_wire(call);
                v["index"] = json!(index);
                v
            })
            .collect();
        vec![self.chunk(json!({"tool_calls": wire}), None)]
    }

    pub fn finish(&mut self, stop: StopReason, usage: TokenUsage) -> Vec<String> {
        let final_chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": finish_reason(stop),
            }],
            "usage": {
                "prompt_tokens": usage.input,
                "completion_tokens": usage.output,
                "total_tokens": usage.total(),
            }
        });
        vec![
            format!("data: {}\n\n", final_chunk),
            "data: [DONE]\n\n".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_tools() {
        let body = json!({
            "model": "test-model",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "what's the BTC price?"}
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "web_search",
                    "description": "search the web",
                    "parameters": {"type": "object", "properties": {"query": {"type": "string"}}}
                }
            }]
        });
        let request = parse_request(&body).unwrap();
        assert!(request.stream);
        assert_eq!(request.turns.len(), 2);
        assert_eq!(request.turns[0].role, Role::System);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, "web_search");
    }

    #[test]
    fn tool_call_arguments_decode_from_string() {
        let body = json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "web_search", "arguments": "{\"query\":\"rain in Paris\"}"}
                }]
            }]
        });
        let request = parse_request(&body).unwrap();
        assert_eq!(request.turns[0].tool_calls.len(), 1);
        assert_eq!(
            request.turns[0].tool_calls[0].arguments["query"],
            json!("rain in Paris")
        );
    }

    #[test]
    fn reply_parse_reads_reasoning_content() {
        let body = json!({
            "model": "deepseek-r1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "", "reasoning_content": "thinking..."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        });
        let reply = parse_reply(&body);
        assert_eq!(reply.text, "");
        assert_eq!(reply.reasoning.as_deref(), Some("thinking..."));
        assert_eq!(reply.usage.input, 7);
    }

    #[test]
    fn stream_data_yields_text_and_done() {
        let events = parse_stream_data(
            r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        );
        assert_eq!(events, vec![StreamEvent::TextDelta("Hi".into())]);

        let events = parse_stream_data(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        );
        assert_eq!(events, vec![StreamEvent::Done { stop: StopReason::EndTurn }]);

        let events = parse_stream_data("[DONE]");
        assert!(matches!(events[0], StreamEvent::Done { .. }));
    }

    #[test]
    fn emitter_sets_role_on_first_delta_only() {
        let mut emitter = StreamEmitter::new("req-1", "test-model");
        let first = emitter.text_delta("Hello");
        assert!(first[0].contains("\"role\":\"assistant\""));
        let second = emitter.text_delta(" world");
        assert!(!second[0].contains("\"role\""));
        let end = emitter.finish(StopReason::EndTurn, TokenUsage { input: 1, output: 2 });
        assert_eq!(end.len(), 2);
        assert!(end[1].contains("[DONE]"));
    }
}
