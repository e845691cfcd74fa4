// Dialect translation. Each wire dialect gets a total pair of functions
// between its request/response shapes and the internal envelope, plus an SSE
// parser for upstream chunks and an emitter for client-bound chunks. The
// per-request streaming coroutine lives in `stream`.

pub mod chat;
pub mod messages;
pub mod responses;
pub mod stream;
pub mod thinking;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::envelope::{ChatRequest, Dialect, ModelReply, StopReason, TokenUsage};

/// One normalized event from an upstream stream, dialect-independent.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallArguments { index: usize, fragment: String },
    Usage(TokenUsage),
    Done { stop: StopReason },
}

pub fn parse_request(dialect: Dialect, body: &Value) -> Result<ChatRequest> {
    match dialect {
        Dialect::ChatCompletions => chat::parse_request(body),
        Dialect::Messages => messages::parse_request(body),
        Dialect::Responses => responses::parse_request(body),
    }
}

pub fn build_request(dialect: Dialect, request: &ChatRequest) -> Value {
    match dialect {
        Dialect::ChatCompletions => chat::build_request(request),
        Dialect::Messages => messages::build_request(request),
        Dialect::Responses => responses::build_request(request),
    }
}

pub fn parse_reply(dialect: Dialect, body: &Value) -> ModelReply {
    match dialect {
        Dialect::ChatCompletions => chat::parse_reply(body),
        Dialect::Messages => messages::parse_reply(body),
        Dialect::Responses => responses::parse_reply(body),
    }
}

pub fn build_reply(dialect: Dialect, reply: &ModelReply, request_id: &str) -> Value {
    match dialect {
        Dialect::ChatCompletions => chat::build_reply(reply, request_id),
        Dialect::Messages => messages::build_reply(reply, request_id),
        Dialect::Responses => responses::build_reply(reply, request_id),
    }
}

/// Parse one upstream SSE `data:` payload in the given dialect.
pub fn parse_stream_data(dialect: Dialect, data: &str) -> Vec<StreamEvent> {
    match dialect {
        Dialect::ChatCompletions => chat::parse_stream_data(data),
        Dialect::Messages => messages::parse_stream_data(data),
        Dialect::Responses => responses::parse_stream_data(data),
    }
}

static QUANT_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[-._:](q\d(_[a-z0-9]+)*|gguf|awq|gptq|exl2|mlx|fp16|bf16|int[48]|[1-8]bit|latest)$")
        .expect("quant suffix pattern")
});

/// Model id with trailing quantization/format suffixes removed, for the
/// user-visible attribution footer.
pub fn short_model_name(model: &str) -> String {
    // Ollama-style tags first, then packaging suffixes.
    let base = model.split('/').last().unwrap_or(model);
    let mut name = base.to_string();
    loop {
        let stripped = QUANT_SUFFIX.replace(&name, "").into_owned();
        if stripped == name || stripped.is_empty() {
            break;
        }
        name = stripped;
    }
    name
}

pub fn attribution_footer(model: &str) -> String {
    format!("\n\n_[via {}]_", short_model_name(model))
}
