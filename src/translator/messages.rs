// The messages dialect: system prompt as a sibling `system` field, content as
// typed blocks, tool use/results as content blocks, usage as
// input/output tokens, streaming as typed message/content-block events.

use anyhow::Result;
use serde_json::{json, Value};
use uuid::Uuid;

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

    // The sibling system field becomes an ordinary system turn.
    if let Some(system) = body.get("system") {
        let text = match system {
            Value::String(text) => text.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            turns.push(Turn::text(Role::System, text));
        }
    }

    for msg in messages {
        let role = msg
            .get("role")
            .and_then(|v| v.as_str())
            .and_then(Role::parse)
            .ok_or_else(|| anyhow::anyhow!("Message without a valid role"))?;
        turns.extend(parse_message(role, msg.get("content").unwrap_or(&Value::Null)));
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
        user: body
            .get("metadata")
            .and_then(|v| v.get("user_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

/// One wire message can fan out into several turns: tool_result blocks become
/// their own `tool` turns so the envelope matches the other dialects.
fn parse_message(role: Role, content: &Value) -> Vec<Turn> {
    match content {
        Value::String(text) => vec![Turn::text(role, text.clone())],
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_turns = Vec::new();
            for block in blocks {
                let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match block_type {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                            parts.push(Part::Text { text: text.to_string() });
                        }
                    }
                    "image" => {
                        let source = block.get("source").unwrap_or(&Value::Null);
                        if source.get("type").and_then(|v| v.as_str()) == Some("base64") {
                            parts.push(Part::Image {
                                media_type: source
                                    .get("media_type")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("image/jpeg")
                                    .to_string(),
                                data: source
                                    .get("data")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("")
                                    .to_string(),
                            });
                        }
                    }
                    "tool_use" => {
                        tool_calls.push(ToolCallRec {
                            id: block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                        });
                    }
                    "tool_result" => {
                        let id = block
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        let text = match block.get("content") {
                            Some(Value::String(text)) => text.clone(),
                            Some(Value::Array(items)) => items
                                .iter()
                                .filter_map(|i| i.get("text").and_then(|v| v.as_str()))
                                .collect::<Vec<_>>()
                                .join(""),
                            _ => String::new(),
                        };
                        tool_turns.push(Turn::tool_result(id, text));
                    }
                    _ => {}
                }
            }

            let mut turns = Vec::new();
            if !parts.is_empty() || !tool_calls.is_empty() {
                let content = if parts.len() == 1 {
                    if let Part::Text { text } = &parts[0] {
                        TurnContent::Text(text.clone())
                    } else {
                        TurnContent::Parts(parts)
                    }
                } else if parts.is_empty() {
                    TurnContent::empty()
                } else {
                    TurnContent::Parts(parts)
                };
                turns.push(Turn { role, content, tool_calls, tool_call_id: None });
            }
            turns.extend(tool_turns);
            turns
        }
        _ => vec![Turn::text(role, String::new())],
    }
}

fn parse_tools(raw: Option<&Value>) -> Vec<ToolDef> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(|v| v.as_str())?;
            Some(ToolDef {
                name: name.to_string(),
                description: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                parameters: item
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            })
        })
        .collect()
}

pub fn build_request(request: &ChatRequest) -> Value {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for turn in &request.turns {
        match turn.role {
            Role::System => system_parts.push(turn.content.flat_text()),
            Role::Tool => {
                // Tool results ride on a user message as tool_result blocks.
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": turn.tool_call_id.clone().unwrap_or_default(),
                        "content": turn.content.flat_text(),
                    }]
                }));
            }
            Role::User | Role::Assistant => {
                let mut blocks = content_blocks(&turn.content);
                for call in &turn.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                let content = if blocks.is_empty() {
                    json!("")
                } else if blocks.len() == 1
                    && blocks[0].get("type").and_then(|v| v.as_str()) == Some("text")
                {
                    blocks[0]
                        .get("text")
                        .cloned()
                        .unwrap_or_else(|| json!(""))
                } else {
                    Value::Array(blocks)
                };
                messages.push(json!({"role": turn.role.as_str(), "content": content}));
            }
        }
    }

    let mut body = json!({
        "messages": messages,
        // The dialect requires max_tokens; fall back to a roomy default.
        "max_tokens": request.max_tokens.unwrap_or(4096),
    });
    if let Some(ref model) = request.model {
        body["model"] = json!(model);
    }
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n"));
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
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
    if let Some(ref user) = request.user {
        body["metadata"] = json!({"user_id": user});
    }
    body
}

fn content_blocks(content: &TurnContent) -> Vec<Value> {
    match content {
        TurnContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"type": "text", "text": text})]
            }
        }
        TurnContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(json!({"type": "text", "text": text})),
                Part::Image { media_type, data } => Some(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data}
                })),
                Part::ToolCall { .. } | Part::ToolResult { .. } => None,
            })
            .collect(),
    }
}

fn map_stop_reason(raw: &str) -> StopReason {
    match raw {
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn stop_reason_str(stop: StopReason) -> &'static str {
    match stop {
        StopReason::MaxTokens => "max_tokens",
        StopReason::ToolUse => "tool_use",
        _ => "end_turn",
    }
}

pub fn parse_reply(body: &Value) -> ModelReply {
    let mut text_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut tool_calls = Vec::new();

    if let Some(blocks) = body.get("content").and_then(|v| v.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text" => {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        text_parts.push(text.to_string());
                    }
                }
                "thinking" => {
                    if let Some(text) = block.get("thinking").and_then(|v| v.as_str()) {
                        reasoning_parts.push(text.to_string());
                    }
                }
                "tool_use" => {
                    tool_calls.push(ToolCallRec {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                    });
                }
                _ => {}
            }
        }
    }

    let mut usage = TokenUsage::default();
    if let Some(u) = body.get("usage") {
        usage.record(
            u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        );
    }

    ModelReply {
        model: body.get("model").and_then(|v| v.as_str()).map(|s| s.to_string()),
        text: text_parts.join(""),
        reasoning: if reasoning_parts.is_empty() {
            None
        } else {
            Some(reasoning_parts.join(""))
        },
        stop: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(map_stop_reason)
            .unwrap_or(StopReason::EndTurn),
        tool_calls,
        usage,
    }
}

pub fn build_reply(reply: &ModelReply, request_id: &str) -> Value {
    let mut content = Vec::new();
    if !reply.text.is_empty() {
        content.push(json!({"type": "text", "text": reply.text}));
    }
    for call in &reply.tool_calls {
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }));
    }

    json!({
        "id": format!("msg_{}", request_id),
        "type": "message",
        "role": "assistant",
        "model": reply.model.clone().unwrap_or_default(),
        "content": content,
        "stop_reason": stop_reason_str(reply.stop),
        "stop_sequence": null,
        "usage": {
            "input_tokens": reply.usage.input,
            "output_tokens": reply.usage.output,
        }
    })
}

pub fn parse_stream_data(data: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            let mut usage = TokenUsage::default();
            if let Some(u) = value
                .get("message")
                .and_then(|m| m.get("usage"))
            {
                usage.record(
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                );
            }
            vec![StreamEvent::Usage(usage)]
        }
        "content_block_start" => {
            let block = value.get("content_block").unwrap_or(&Value::Null);
            if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                let index =
                    value.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                vec![StreamEvent::ToolCallStart {
                    index,
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                }]
            } else {
                Vec::new()
            }
        }
        "content_block_delta" => {
            let delta = value.get("delta").unwrap_or(&Value::Null);
            let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text_delta" => delta
                    .get("text")
                    .and_then(|v| v.as_str())
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![StreamEvent::TextDelta(t.to_string())])
                    .unwrap_or_default(),
                "thinking_delta" => delta
                    .get("thinking")
                    .and_then(|v| v.as_str())
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![StreamEvent::ReasoningDelta(t.to_string())])
                    .unwrap_or_default(),
                "input_json_delta" => delta
                    .get("partial_json")
                    .and_then(|v| v.as_str())
                    .map(|f| {
                        vec![StreamEvent::ToolCallArguments {
                            index,
                            fragment: f.to_string(),
                        }]
                    })
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(u) = value.get("usage") {
                let mut usage = TokenUsage::default();
                usage.record(
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                );
                events.push(StreamEvent::Usage(usage));
            }
            if let Some(reason) = value
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
            {
                events.push(StreamEvent::Done { stop: map_stop_reason(reason) });
            }
            events
        }
        "message_stop" => vec![StreamEvent::Done { stop: StopReason::EndTurn }],
        _ => Vec::new(),
    }
}

/// Client-bound event emitter for this dialect. Frames carry both the SSE
/// `event:` line and the `data:` payload, as the dialect requires.
pub struct StreamEmitter {
    message_id: String,
    model: String,
    opened_block: bool,
    next_block: usize,
}

impl StreamEmitter {
    pub fn new(request_id: &str, model: &str) -> StreamEmitter {
        StreamEmitter {
            message_id: format!("msg_{}", request_id),
            model: model.to_string(),
            opened_block: false,
            next_block: 0,
        }
    }

    fn frame(event: &str, data: Value) -> String {
        format!("event: {}\ndata: {}\n\n", event, data)
    }

    pub fn open(&mut self) -> Vec<String> {
        vec![Self::frame(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }
            }),
        )]
    }

    pub fn text_delta(&mut self, text: &str) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.opened_block {
            frames.push(Self::frame(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": self.next_block,
                    "content_block": {"type": "text", "text": ""},
                }),
            ));
            self.opened_block = true;
        }
        frames.push(Self::frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.next_block,
                "delta": {"type": "text_delta", "text": text},
            }),
        ));
        frames
    }

    pub fn tool_calls(&mut self, calls: &[ToolCallRec]) -> Vec<String> {
        let mut frames = self.close_block();
        for call in calls {
            let id = if call.id.is_empty() {
                format!("toolu_{}", Uuid::new_v4().simple())
            } else {
                call.id.clone()
            };
            frames.push(Self::frame(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": self.next_block,
                    "content_block": {"type": "tool_use", "id": id, "name": call.name, "input": {}},
                }),
            ));
            frames.push(Self::frame(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": self.next_block,
                    "delta": {"type": "input_json_delta", "partial_json": call.arguments.to_string()},
                }),
            ));
            frames.push(Self::frame(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.next_block}),
            ));
            self.next_block += 1;
        }
        frames
    }

    fn close_block(&mut self) -> Vec<String> {
        if !self.opened_block {
            return Vec::new();
        }
        self.opened_block = false;
        let frame = Self::frame(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.next_block}),
        );
        self.next_block += 1;
        vec![frame]
    }

    pub fn finish(&mut self, stop: StopReason, usage: TokenUsage) -> Vec<String> {
        let mut frames = self.close_block();
        frames.push(Self::frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason_str(stop), "stop_sequence": null},
                "usage": {"input_tokens": usage.input, "output_tokens": usage.output},
            }),
        ));
        frames.push(Self::frame(
            "message_stop",
            json!({"type": "message_stop"}),
        ));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_field_becomes_system_turn() {
        let body = json!({
            "model": "m",
            "system": "You are terse.",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let request = parse_request(&body).unwrap();
        assert_eq!(request.turns[0].role, Role::System);
        assert_eq!(request.turns[0].content.flat_text(), "You are terse.");
        assert_eq!(request.turns[1].role, Role::User);
    }

    #[test]
    fn tool_result_block_becomes_tool_turn() {
        let body = json!({
            "model": "m",
            "max_tokens": 100,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "web_search", "input": {"query": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "result text"}
                ]}
            ]
        });
        let request = parse_request(&body).unwrap();
        assert_eq!(request.turns.len(), 2);
        assert_eq!(request.turns[0].tool_calls.len(), 1);
        assert_eq!(request.turns[1].role, Role::Tool);
        assert_eq!(request.turns[1].tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn build_request_lifts_system_out_of_messages() {
        let request = ChatRequest {
            model: Some("m".into()),
            turns: vec![
                Turn::text(Role::System, "be brief"),
                Turn::text(Role::User, "hello"),
            ],
            ..Default::default()
        };
        let wire = build_request(&request);
        assert_eq!(wire["system"], json!("be brief"));
        assert_eq!(wire["messages"].as_array().unwrap().len(), 1);
        assert_eq!(wire["max_tokens"], json!(4096));
    }

    #[test]
    fn reply_roundtrip_preserves_tool_use() {
        let reply = ModelReply {
            model: Some("m".into()),
            text: "let me check".into(),
            tool_calls: vec![ToolCallRec {
                id: "toolu_9".into(),
                name: "web_search".into(),
                arguments: json!({"query": "gold price"}),
            }],
            stop: StopReason::ToolUse,
            ..Default::default()
        };
        let wire = build_reply(&reply, "r1");
        assert_eq!(wire["stop_reason"], json!("tool_use"));
        let parsed = parse_reply(&wire);
        assert_eq!(parsed.tool_calls, reply.tool_calls);
        assert_eq!(parsed.stop, StopReason::ToolUse);
    }

    #[test]
    fn stream_events_parse_lifecycle() {
        let events = parse_stream_data(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hey"}}"#,
        );
        assert_eq!(events, vec![StreamEvent::TextDelta("Hey".into())]);

        let events = parse_stream_data(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Done { stop: StopReason::EndTurn }));
    }

    #[test]
    fn emitter_produces_full_lifecycle() {
        let mut emitter = StreamEmitter::new("r1", "m");
        let mut frames = emitter.open();
        frames.extend(emitter.text_delta("Hello"));
        frames.extend(emitter.finish(StopReason::EndTurn, TokenUsage::default()));
        let joined = frames.join("");
        assert!(joined.contains("event: message_start"));
        assert!(joined.contains("event: content_block_start"));
        assert!(joined.contains("event: content_block_delta"));
        assert!(joined.contains("event: content_block_stop"));
        assert!(joined.contains("event: message_stop"));
    }
}
