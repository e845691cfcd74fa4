// The responses dialect: `input` (string or item array) plus `instructions`,
// tool invocations as `function_call` items in `output[]`, usage with an
// explicit total, streaming as a typed lifecycle event stream.

use anyhow::Result;
use serde_json::{json, Value};

use super::StreamEvent;
use crate::envelope::{
    ChatRequest, ModelReply, Part, Role, StopReason, TokenUsage, ToolCallRec, ToolDef, Turn,
    TurnContent,
};

pub fn parse_request(body: &Value) -> Result<ChatRequest> {
    let mut turns = Vec::new();

    if let Some(instructions) = body.get("instructions").and_then(|v| v.as_str()) {
        if !instructions.is_empty() {
            turns.push(Turn::text(Role::System, instructions));
        }
    }

    match body.get("input") {
        Some(Value::String(text)) => turns.push(Turn::text(Role::User, text.clone())),
        Some(Value::Array(items)) => {
            for item in items {
                turns.extend(parse_input_item(item)?);
            }
        }
        Some(_) | None => anyhow::bail!("Missing input"),
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
            .get("max_output_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        user: body.get("user").and_then(|v| v.as_str()).map(|s| s.to_string()),
    })
}

fn parse_input_item(item: &Value) -> Result<Vec<Turn>> {
    let item_type = item
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("message");
    match item_type {
        "message" => {
            let role = item
                .get("role")
                .and_then(|v| v.as_str())
                .and_then(Role::parse)
                .ok_or_else(|| anyhow::anyhow!("Input message without a valid role"))?;
            Ok(vec![Turn {
                role,
                content: parse_item_content(item.get("content").unwrap_or(&Value::Null)),
                tool_calls: Vec::new(),
                tool_call_id: None,
            }])
        }
        "function_call" => {
            let arguments = item
                .get("arguments")
                .and_then(|v| v.as_str())
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .unwrap_or_else(|| json!({}));
            Ok(vec![Turn {
                role: Role::Assistant,
                content: TurnContent::empty(),
                tool_calls: vec![ToolCallRec {
                    id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    arguments,
                }],
                tool_call_id: None,
            }])
        }
        "function_call_output" => Ok(vec![Turn::tool_result(
            item.get("call_id").and_then(|v| v.as_str()).unwrap_or(""),
            item.get("output").and_then(|v| v.as_str()).unwrap_or(""),
        )]),
        _ => Ok(Vec::new()),
    }
}

fn parse_item_content(content: &Value) -> TurnContent {
    match content {
        Value::String(text) => TurnContent::Text(text.clone()),
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                match item.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "input_text" | "output_text" | "text" => {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                            parts.push(Part::Text { text: text.to_string() });
                        }
                    }
                    "input_image" => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        if let Some(rest) = url.strip_prefix("data:") {
                            let mut pieces = rest.splitn(2, ',');
                            let header = pieces.next().unwrap_or("");
                            if let Some(data) = pieces.next() {
                                parts.push(Part::Image {
                                    media_type: header
                                        .split(';')
                                        .next()
                                        .unwrap_or("")
                                        .to_string(),
                                    data: data.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            if parts.len() == 1 {
                if let Part::Text { text } = &parts[0] {
                    return TurnContent::Text(text.clone());
                }
            }
            TurnContent::Parts(parts)
        }
        _ => TurnContent::empty(),
    }
}

fn parse_tools(raw: Option<&Value>) -> Vec<ToolDef> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            if item.get("type").and_then(|v| v.as_str()).unwrap_or("function") != "function" {
                return None;
            }
            // Tools are flattened in this dialect: name at the top level.
            let name = item.get("name").and_then(|v| v.as_str())?;
            Some(ToolDef {
                name: name.to_string(),
                description: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                parameters: item
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            })
        })
        .collect()
}

pub fn build_request(request: &ChatRequest) -> Value {
    let mut instructions = Vec::new();
    let mut input = Vec::new();

    for turn in &request.turns {
        match turn.role {
            Role::System => instructions.push(turn.content.flat_text()),
            Role::Tool => input.push(json!({
                "type": "function_call_output",
                "call_id": turn.tool_call_id.clone().unwrap_or_default(),
                "output": turn.content.flat_text(),
            })),
            Role::User | Role::Assistant => {
                if !turn.content.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": turn.role.as_str(),
                        "content": build_item_content(turn),
                    }));
                }
                for call in &turn.tool_calls {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }));
                }
            }
        }
    }

    let mut body = json!({ "input": input });
    if let Some(ref model) = request.model {
        body["model"] = json!(model);
    }
    if !instructions.is_empty() {
        body["instructions"] = json!(instructions.join("\n"));
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
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
        body["max_output_tokens"] = json!(max_tokens);
    }
    if let Some(ref user) = request.user {
        body["user"] = json!(user);
    }
    body
}

fn build_item_content(turn: &Turn) -> Value {
    let text_type = if turn.role == Role::Assistant {
        "output_text"
    } else {
        "input_text"
    };
    match &turn.content {
        TurnContent::Text(text) => json!([{ "type": text_type, "text": text }]),
        TurnContent::Parts(parts) => Value::Array(
            parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } => Some(json!({"type": text_type, "text": text})),
                    Part::Image { media_type, data } => Some(json!({
                        "type": "input_image",
                        "image_url": format!("data:{};base64,{}", media_type, data),
                    })),
                    _ => None,
                })
                .collect(),
        ),
    }
}

pub fn parse_reply(body: &Value) -> ModelReply {
    let mut text_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut tool_calls = Vec::new();

    if let Some(output) = body.get("output").and_then(|v| v.as_array()) {
        for item in output {
            match item.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "message" => {
                    if let Some(content) = item.get("content").and_then(|v| v.as_array()) {
                        for block in content {
                            if block.get("type").and_then(|v| v.as_str()) == Some("output_text") {
                                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                                    text_parts.push(text.to_string());
                                }
                            }
                        }
                    }
                }
                "reasoning" => {
                    if let Some(summary) = item.get("summary").and_then(|v| v.as_array()) {
                        for block in summary {
                            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                                reasoning_parts.push(text.to_string());
                            }
                        }
                    }
                }
                "function_call" => {
                    let arguments = item
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str::<Value>(s).ok())
                        .unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCallRec {
                        id: item
                            .get("call_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: item
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        arguments,
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

    let status = body
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("completed");

    ModelReply {
        model: body.get("model").and_then(|v| v.as_str()).map(|s| s.to_string()),
        text: text_parts.join(""),
        reasoning: if reasoning_parts.is_empty() {
            None
        } else {
            Some(reasoning_parts.join(""))
        },
        stop: if !tool_calls.is_empty() {
            StopReason::ToolUse
        } else if status == "incomplete" {
            StopReason::MaxTokens
        } else {
            StopReason::EndTurn
        },
        tool_calls,
        usage,
    }
}

pub fn build_reply(reply: &ModelReply, request_id: &str) -> Value {
    let mut output = Vec::new();
    if !reply.text.is_empty() {
        output.push(json!({
            "type": "message",
            "id": format!("msg_{}", request_id),
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": reply.text, "annotations": []}],
        }));
    }
    for call in &reply.tool_calls {
        output.push(json!({
            "type": "function_call",
            "id": format!("fc_{}", call.id),
            "call_id": call.id,
            "name": call.name,
            "arguments": call.arguments.to_string(),
            "status": "completed",
        }));
    }

    json!({
        "id": format!("resp_{}", request_id),
        "object": "response",
        "status": if reply.stop == StopReason::MaxTokens { "incomplete" } else { "completed" },
        "model": reply.model.clone().unwrap_or_default(),
        "output": output,
        "usage": {
            "input_tokens": reply.usage.input,
            "output_tokens": reply.usage.output,
            "total_tokens": reply.usage.total(),
        }
    })
}

pub fn parse_stream_data(data: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "response.output_text.delta" => value
            .get("delta")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| vec![StreamEvent::TextDelta(t.to_string())])
            .unwrap_or_default(),
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => value
            .get("delta")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| vec![StreamEvent::ReasoningDelta(t.to_string())])
            .unwrap_or_default(),
        "response.output_item.added" => {
            let item = value.get("item").unwrap_or(&Value::Null);
            if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                let index = value
                    .get("output_index")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                vec![StreamEvent::ToolCallStart {
                    index,
                    id: item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                }]
            } else {
                Vec::new()
            }
        }
        "response.function_call_arguments.delta" => {
            let index = value
                .get("output_index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            value
                .get("delta")
                .and_then(|v| v.as_str())
                .map(|f| vec![StreamEvent::ToolCallArguments { index, fragment: f.to_string() }])
                .unwrap_or_default()
        }
        "response.completed" | "response.done" | "response.incomplete" => {
            let mut events = Vec::new();
            if let Some(u) = value.get("response").and_then(|r| r.get("usage")) {
                let mut usage = TokenUsage::default();
                usage.record(
                    u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                    u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                );
                events.push(StreamEvent::Usage(usage));
            }
            events.push(StreamEvent::Done {
                stop: if event_type == "response.incomplete" {
                    StopReason::MaxTokens
                } else {
                    StopReason::EndTurn
                },
            });
            events
        }
        "response.failed" => vec![StreamEvent::Done { stop: StopReason::Error }],
        _ => Vec::new(),
    }
}

/// Client-bound lifecycle emitter for this dialect.
pub struct StreamEmitter {
    response_id: String,
    item_id: String,
    model: String,
    opened: bool,
    text: String,
    next_output: usize,
}

impl StreamEmitter {
    pub fn new(request_id: &str, model: &str) -> StreamEmitter {
        StreamEmitter {
            response_id: format!("resp_{}", request_id),
            item_id: format!("msg_{}", request_id),
            model: model.to_string(),
            opened: false,
            text: String::new(),
            next_output: 0,
        }
    }

    fn frame(event: &str, data: Value) -> String {
        format!("event: {}\ndata: {}\n\n", event, data)
    }

    pub fn open(&mut self) -> Vec<String> {
        vec![Self::frame(
            "response.created",
            json!({
                "type": "response.created",
                "response": {
                    "id": self.response_id,
                    "object": "response",
                    "status": "in_progress",
                    "model": self.model,
                    "output": [],
                }
            }),
        )]
    }

    fn open_message_item(&mut self) -> Vec<String> {
        if self.opened {
            return Vec::new();
        }
        self.opened = true;
        vec![Self::frame(
            "response.output_item.added",
            json!({
                "type": "response.output_item.added",
                "output_index": self.next_output,
                "item": {"type": "message", "id": self.item_id, "role": "assistant", "status": "in_progress", "content": []},
            }),
        )]
    }

    pub fn text_delta(&mut self, text: &str) -> Vec<String> {
        let mut frames = self.open_message_item();
        self.text.push_str(text);
        frames.push(Self::frame(
            "response.output_text.delta",
            json!({
                "type": "response.output_text.delta",
                "item_id": self.item_id,
                "output_index": self.next_output,
                "content_index": 0,
                "delta": text,
            }),
        ));
        frames
    }

    pub fn tool_calls(&mut self, calls: &[ToolCallRec]) -> Vec<String> {
        let mut frames = self.close_message_item();
        for call in calls {
            frames.push(Self::frame(
                "response.output_item.added",
                json!({
                    "type": "response.output_item.added",
                    "output_index": self.next_output,
                    "item": {
                        "type": "function_call",
                        "id": format!("fc_{}", call.id),
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": "",
                        "status": "in_progress",
                    },
                }),
            ));
            frames.push(Self::frame(
                "response.output_item.done",
                json!({
                    "type": "response.output_item.done",
                    "output_index": self.next_output,
                    "item": {
                        "type": "function_call",
                        "id": format!("fc_{}", call.id),
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                        "status": "completed",
                    },
                }),
            ));
            self.next_output += 1;
        }
        frames
    }

    fn close_message_item(&mut self) -> Vec<String> {
        if !self.opened {
            return Vec::new();
        }
        self.opened = false;
        let frames = vec![
            Self::frame(
                "response.output_text.done",
                json!({
                    "type": "response.output_text.done",
                    "item_id": self.item_id,
                    "output_index": self.next_output,
                    "content_index": 0,
                    "text": self.text,
                }),
            ),
            Self::frame(
                "response.output_item.done",
                json!({
                    "type": "response.output_item.done",
                    "output_index": self.next_output,
                    "item": {
                        "type": "message",
                        "id": self.item_id,
                        "role": "assistant",
                        "status": "completed",
                        "content": [{"type": "output_text", "text": self.text, "annotations": []}],
                    },
                }),
            ),
        ];
        self.next_output += 1;
        frames
    }

    pub fn finish(&mut self, stop: StopReason, usage: TokenUsage) -> Vec<String> {
        let mut frames = self.close_message_item();
        frames.push(Self::frame(
            "response.done",
            json!({
                "type": "response.done",
                "response": {
                    "id": self.response_id,
                    "object": "response",
                    "status": if stop == StopReason::MaxTokens { "incomplete" } else { "completed" },
                    "model": self.model,
                    "usage": {
                        "input_tokens": usage.input,
                        "output_tokens": usage.output,
                        "total_tokens": usage.total(),
                    },
                }
            }),
        ));
        frames
    }
}
