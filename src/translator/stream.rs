// Per-request streaming coroutine: consumes upstream SSE bytes in the
// backend's dialect and produces client-dialect frames, preserving chunk
// order. Holds the thinking gate for reasoning models and accumulates the
// full text, tool calls, and usage so the pipeline can log the request after
// the stream ends, even on abort.

use std::collections::BTreeMap;

use serde_json::Value;

use super::thinking::{is_reasoning_model, ThinkingGate};
use super::{chat, messages, responses, StreamEvent};
use crate::envelope::{estimate_tokens, Dialect, StopReason, TokenUsage, ToolCallRec};

enum Emitter {
    Chat(chat::StreamEmitter),
    Messages(messages::StreamEmitter),
    Responses(responses::StreamEmitter),
}

impl Emitter {
    fn new(dialect: Dialect, request_id: &str, model: &str) -> Emitter {
        match dialect {
            Dialect::ChatCompletions => Emitter::Chat(chat::StreamEmitter::new(request_id, model)),
            Dialect::Messages => Emitter::Messages(messages::StreamEmitter::new(request_id, model)),
            Dialect::Responses => {
                Emitter::Responses(responses::StreamEmitter::new(request_id, model))
            }
        }
    }

    fn open(&mut self) -> Vec<String> {
        match self {
            Emitter::Chat(e) => e.open(),
            Emitter::Messages(e) => e.open(),
            Emitter::Responses(e) => e.open(),
        }
    }

    fn text_delta(&mut self, text: &str) -> Vec<String> {
        match self {
            Emitter::Chat(e) => e.text_delta(text),
            Emitter::Messages(e) => e.text_delta(text),
            Emitter::Responses(e) => e.text_delta(text),
        }
    }

    fn tool_calls(&mut self, calls: &[ToolCallRec]) -> Vec<String> {
        match self {
            Emitter::Chat(e) => e.tool_calls(calls),
            Emitter::Messages(e) => e.tool_calls(calls),
            Emitter::Responses(e) => e.tool_calls(calls),
        }
    }

    fn finish(&mut self, stop: StopReason, usage: TokenUsage) -> Vec<String> {
        match self {
            Emitter::Chat(e) => e.finish(stop, usage),
            Emitter::Messages(e) => e.finish(stop, usage),
            Emitter::Responses(e) => e.finish(stop, usage),
        }
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

pub struct StreamTranslator {
    upstream: Dialect,
    emitter: Emitter,
    gate: Option<ThinkingGate>,
    model: String,
    line_buffer: String,
    text: String,
    tool_parts: BTreeMap<usize, PartialToolCall>,
    usage: TokenUsage,
    stop: StopReason,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(client: Dialect, upstream: Dialect, request_id: &str, model: &str) -> Self {
        StreamTranslator {
            upstream,
            emitter: Emitter::new(client, request_id, model),
            gate: is_reasoning_model(model).then(ThinkingGate::new),
            model: model.to_string(),
            line_buffer: String::new(),
            text: String::new(),
            tool_parts: BTreeMap::new(),
            usage: TokenUsage::default(),
            stop: StopReason::EndTurn,
            finished: false,
        }
    }

    /// Lifecycle events the client dialect requires before any delta.
    pub fn open(&mut self) -> Vec<String> {
        self.emitter.open()
    }

    /// Feed raw upstream bytes; returns client-bound frames.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut frames = Vec::new();
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            frames.extend(self.process_line(line.trim_end()));
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Vec<String> {
        // Only data lines carry payloads; event/id/comment lines are dropped
        // because the payloads are self-describing in every dialect.
        let Some(payload) = line.strip_prefix("data:") else {
            return Vec::new();
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Vec::new();
        }
        let mut frames = Vec::new();
        for event in super::parse_stream_data(self.upstream, payload) {
            frames.extend(self.handle_event(event));
        }
        frames
    }

    fn handle_event(&mut self, event: StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::TextDelta(delta) => {
                let visible = match self.gate.as_mut() {
                    Some(gate) => gate.feed(&delta),
                    None => Some(delta),
                };
                match visible {
                    Some(text) if !text.is_empty() => {
                        self.text.push_str(&text);
                        self.emitter.text_delta(&text)
                    }
                    _ => Vec::new(),
                }
            }
            // Out-of-band reasoning never reaches the client.
            StreamEvent::ReasoningDelta(_) => Vec::new(),
            StreamEvent::ToolCallStart { index, id, name } => {
                let part = self.tool_parts.entry(index).or_default();
                part.id = id;
                part.name = name;
                Vec::new()
            }
            StreamEvent::ToolCallArguments { index, fragment } => {
                self.tool_parts.entry(index).or_default().arguments.push_str(&fragment);
                Vec::new()
            }
            StreamEvent::Usage(usage) => {
                self.usage.record(usage.input, usage.output);
                Vec::new()
            }
            StreamEvent::Done { stop } => {
                if stop != StopReason::EndTurn || self.stop == StopReason::EndTurn {
                    self.stop = stop;
                }
                Vec::new()
            }
        }
    }

    /// Terminal events: flush the gate, append the attribution footer, emit
    /// accumulated tool calls, close the stream. Idempotent, so the abort
    /// path can call it unconditionally.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        if let Some(gate) = self.gate.as_mut() {
            if let Some(text) = gate.finish() {
                if !text.is_empty() {
                    self.text.push_str(&text);
                    frames.extend(self.emitter.text_delta(&text));
                }
            }
        }

        if !self.text.is_empty() {
            let footer = super::attribution_footer(&self.model);
            self.text.push_str(&footer);
            frames.extend(self.emitter.text_delta(&footer));
        }

        let calls = self.tool_calls();
        if !calls.is_empty() {
            frames.extend(self.emitter.tool_calls(&calls));
            if self.stop == StopReason::EndTurn {
                self.stop = StopReason::ToolUse;
            }
        }

        if self.usage.output == 0 && !self.text.is_empty() {
            let estimate = estimate_tokens(&self.text);
            self.usage.record(self.usage.input, estimate);
        }

        frames.extend(self.emitter.finish(self.stop, self.usage));
        frames
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRec> {
        self.tool_parts
            .values()
            .filter(|part| !part.name.is_empty())
            .map(|part| ToolCallRec {
                id: part.id.clone(),
                name: part.name.clone(),
                arguments: serde_json::from_str::<Value>(&part.arguments)
                    .unwrap_or_else(|_| serde_json::json!({})),
            })
            .collect()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(payload: &str) -> String {
        format!("data: {}\n\n", payload)
    }

    #[test]
    fn chat_to_chat_passthrough_with_footer() {
        let mut translator = StreamTranslator::new(
            Dialect::ChatCompletions,
            Dialect::ChatCompletions,
            "r1",
            "llama3.1",
        );
        let mut frames = translator.open();
        frames.extend(translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#)
                .as_bytes(),
        ));
        frames.extend(translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#).as_bytes(),
        ));
        frames.extend(translator.feed_bytes(sse("[DONE]").as_bytes()));
        frames.extend(translator.finish());

        let joined = frames.join("");
        assert!(joined.contains("Hello"));
        assert!(joined.contains("_[via llama3.1]_"));
        assert!(joined.ends_with("data: [DONE]\n\n"));
        assert_eq!(translator.text(), format!("Hello{}", super::super::attribution_footer("llama3.1")));
    }

    #[test]
    fn chat_upstream_to_messages_client() {
        let mut translator =
            StreamTranslator::new(Dialect::Messages, Dialect::ChatCompletions, "r2", "m");
        let mut frames = translator.open();
        frames.extend(translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#)
                .as_bytes(),
        ));
        frames.extend(translator.finish());
        let joined = frames.join("");
        assert!(joined.contains("event: message_start"));
        assert!(joined.contains("text_delta"));
        assert!(joined.contains("event: message_stop"));
    }

    #[test]
    fn messages_upstream_to_responses_client() {
        let mut translator =
            StreamTranslator::new(Dialect::Responses, Dialect::Messages, "r3", "m");
        let mut frames = translator.open();
        frames.extend(translator.feed_bytes(
            sse(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hey"}}"#)
                .as_bytes(),
        ));
        frames.extend(translator.feed_bytes(
            sse(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":3,"output_tokens":9}}"#)
                .as_bytes(),
        ));
        frames.extend(translator.finish());
        let joined = frames.join("");
        assert!(joined.contains("response.created"));
        assert!(joined.contains("response.output_text.delta"));
        assert!(joined.contains("\"type\":\"response.done\""));
        assert_eq!(translator.usage().output, 9);
    }

    #[test]
    fn reasoning_model_buffers_until_transition() {
        let mut translator = StreamTranslator::new(
            Dialect::ChatCompletions,
            Dialect::ChatCompletions,
            "r4",
            "deepseek-r1:7b",
        );
        let mut frames = translator.open();
        frames.extend(translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"content":"The user wants a forecast. "},"finish_reason":null}]}"#)
                .as_bytes(),
        ));
        // Nothing visible yet.
        assert!(frames.iter().all(|f| !f.contains("The user wants")));
        frames.extend(translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"content":"Let me provide the forecast. Sunny all day."},"finish_reason":null}]}"#)
                .as_bytes(),
        ));
        let joined = frames.join("");
        assert!(joined.contains("Sunny all day."));
        assert!(!joined.contains("The user wants"));
    }

    #[test]
    fn tool_call_fragments_assemble() {
        let mut translator = StreamTranslator::new(
            Dialect::ChatCompletions,
            Dialect::ChatCompletions,
            "r5",
            "m",
        );
        translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"web_search","arguments":""}}]},"finish_reason":null}]}"#)
                .as_bytes(),
        );
        translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":"}}]},"finish_reason":null}]}"#)
                .as_bytes(),
        );
        translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"btc\"}"}}]},"finish_reason":null}]}"#)
                .as_bytes(),
        );
        let frames = translator.finish();
        let calls = translator.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments["query"], serde_json::json!("btc"));
        assert!(frames.iter().any(|f| f.contains("tool_calls")));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut translator = StreamTranslator::new(
            Dialect::ChatCompletions,
            Dialect::ChatCompletions,
            "r6",
            "m",
        );
        translator.feed_bytes(
            sse(r#"{"choices":[{"index":0,"delta":{"content":"x"},"finish_reason":null}]}"#)
                .as_bytes(),
        );
        let first = translator.finish();
        assert!(!first.is_empty());
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn split_lines_across_chunks() {
        let mut translator = StreamTranslator::new(
            Dialect::ChatCompletions,
            Dialect::ChatCompletions,
            "r7",
            "m",
        );
        let frame = sse(r#"{"choices":[{"index":0,"delta":{"content":"AB"},"finish_reason":null}]}"#);
        let (left, right) = frame.split_at(frame.len() / 2);
        let mut frames = translator.feed_bytes(left.as_bytes());
        frames.extend(translator.feed_bytes(right.as_bytes()));
        assert!(frames.join("").contains("AB"));
    }
}
