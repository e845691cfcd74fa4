// The request pipeline: classify -> route -> translate -> dispatch ->
// tool loop -> translate -> emit, with streaming preserved end to end.
// Every path out of here records exactly one ring-buffer entry; streaming
// transfers that obligation into the response stream via a drop guard.

pub mod cli;

use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::classifier::Verdict;
use crate::envelope::{estimate_request_tokens, estimate_tokens, ChatRequest, Dialect, ModelReply, Role, StopReason, Turn};
use crate::observe::LogEntry;
use crate::router::RouteDecision;
use crate::tools::MAX_TOOL_ROUNDS;
use crate::translator::stream::StreamTranslator;

/// Ring-buffer obligation carrier. Completing it records the entry; dropping
/// it un-completed (client disconnect, panic unwind) records a cancellation.
struct LogGuard {
    entry: Option<LogEntry>,
}

impl LogGuard {
    fn new(entry: LogEntry) -> LogGuard {
        LogGuard { entry: Some(entry) }
    }

    fn entry_mut(&mut self) -> &mut LogEntry {
        self.entry.as_mut().expect("log entry already taken")
    }

    fn complete(mut self) {
        if let Some(entry) = self.entry.take() {
            crate::observe::record(entry);
        }
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            if entry.error.is_none() {
                entry.error = Some("client-cancelled".to_string());
            }
            crate::observe::record(entry);
        }
    }
}

fn base_entry(request_id: &str, dialect: Dialect, started: chrono::DateTime<Utc>) -> LogEntry {
    LogEntry {
        id: request_id.to_string(),
        timestamp: started,
        backend: String::new(),
        dialect: dialect.as_str().to_string(),
        status: 0,
        duration_ms: 0,
        input_tokens: 0,
        output_tokens: 0,
        user_id: None,
        category: None,
        routing_reason: None,
        request_body: None,
        response_body: None,
        error: None,
        streamed: false,
        tool_rounds: 0,
    }
}

// Only bodies are captured. Inbound headers (x-api-key, authorization) never
// enter the envelope, so key material cannot reach a log sink.
fn capture_body(value: &Value) -> Option<String> {
    let config = crate::config::get_config()?;
    if !config.logging.capture_bodies {
        return None;
    }
    Some(crate::observe::truncate_body(
        &value.to_string(),
        config.logging.max_body_bytes,
    ))
}

fn capture_text(text: &str) -> Option<String> {
    let config = crate::config::get_config()?;
    if !config.logging.capture_bodies {
        return None;
    }
    Some(crate::observe::truncate_body(text, config.logging.max_body_bytes))
}

fn proxy_headers(
    request_id: &str,
    backend: &str,
    started: Instant,
    reason: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(backend) {
        headers.insert("x-backend", value);
    }
    let elapsed = started.elapsed().as_millis().to_string();
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        headers.insert("x-timing-ms", value);
    }
    if let Some(reason) = reason {
        // Header values cannot carry arbitrary text; drop on failure.
        if let Ok(value) = HeaderValue::from_str(reason) {
            headers.insert("x-routing-reason", value);
        }
    }
    headers
}

fn json_response(status: StatusCode, headers: HeaderMap, body: Value) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    response.headers_mut().extend(headers);
    response
}

fn sse_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

fn proxy_error_body(message: &str, request_id: &str) -> Value {
    json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    })
}

/// Entry point for all three proxy endpoints.
pub async fn handle(
    client_dialect: Dialect,
    raw: Value,
    forced_backend: Option<String>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let started_at = Utc::now();

    let request = match crate::translator::parse_request(client_dialect, &raw) {
        Ok(request) => request,
        Err(e) => {
            let headers = proxy_headers(&request_id, "-", started, None);
            let mut guard = LogGuard::new(base_entry(&request_id, client_dialect, started_at));
            {
                let entry = guard.entry_mut();
                entry.backend = "-".to_string();
                entry.status = 400;
                entry.duration_ms = started.elapsed().as_millis() as i64;
                entry.error = Some(format!("invalid request: {}", e));
            }
            guard.complete();
            return json_response(
                StatusCode::BAD_REQUEST,
                headers,
                json!({
                    "error": {
                        "type": "invalid_request_error",
                        "message": format!("Invalid request: {}", e),
                        "request_id": request_id,
                    }
                }),
            );
        }
    };

    let mut guard = LogGuard::new(base_entry(&request_id, client_dialect, started_at));
    guard.entry_mut().user_id = request.user.clone();
    guard.entry_mut().request_body = capture_body(&raw);

    // In-band CLI short-circuits before any classification or dispatch.
    if let Some(output) = cli::try_execute(&request.last_user_text()) {
        let reply = ModelReply {
            model: Some(cli::CLI_BACKEND_LABEL.to_string()),
            text: output,
            ..Default::default()
        };
        let body = crate::translator::build_reply(client_dialect, &reply, &request_id);
        let headers = proxy_headers(&request_id, cli::CLI_BACKEND_LABEL, started, None);
        {
            let entry = guard.entry_mut();
            entry.backend = cli::CLI_BACKEND_LABEL.to_string();
            entry.status = 200;
            entry.duration_ms = started.elapsed().as_millis() as i64;
            entry.response_body = capture_text(&reply.text);
        }
        guard.complete();
        return json_response(StatusCode::OK, headers, body);
    }

    // Classification. Forced routing and disabled smart routing skip it.
    let verdict: Option<Verdict> =
        if forced_backend.is_none() && crate::router::smart_routing_enabled() {
            crate::classifier::classify(&request, request.user.as_deref()).await
        } else {
            None
        };
    guard.entry_mut().category = verdict.as_ref().map(|v| v.category.as_str().to_string());

    // Routing.
    let decision: RouteDecision = match &forced_backend {
        Some(name) => RouteDecision {
            primary: name.clone(),
            all_backends: vec![name.clone()],
            reason: "forced by path".to_string(),
            confidence: 1.0,
            candidates: Vec::new(),
            tools_routed: false,
            multi_model: false,
        },
        None => crate::router::route(
            verdict.as_ref(),
            estimate_request_tokens(&request),
            request.user.as_deref(),
            request.has_client_tools(),
        ),
    };
    guard.entry_mut().backend = decision.primary.clone();
    guard.entry_mut().routing_reason = Some(decision.reason.clone());

    let Some(backend) = crate::config::get_backend(&decision.primary) else {
        let headers = proxy_headers(&request_id, &decision.primary, started, Some(&decision.reason));
        {
            let entry = guard.entry_mut();
            entry.status = 502;
            entry.duration_ms = started.elapsed().as_millis() as i64;
            entry.error = Some(format!("backend '{}' not configured", decision.primary));
        }
        guard.complete();
        return json_response(
            StatusCode::BAD_GATEWAY,
            headers,
            proxy_error_body(
                &format!("Backend '{}' is not configured", decision.primary),
                &request_id,
            ),
        );
    };

    // Fan-out runs buffered regardless of the client's streaming flag.
    if decision.multi_model && decision.all_backends.len() > 1 {
        return fan_out_response(request, client_dialect, decision, guard, request_id, started)
            .await;
    }

    // Tool injection; a tooled dispatch must be unary so the loop can parse
    // a complete reply.
    let mut work = request.clone();
    let tools_injected = crate::tools::should_inject(verdict.as_ref(), &decision, &request);
    if tools_injected {
        crate::tools::inject_web_search(&mut work);
        tracing::debug!("{}: web_search injected, streaming disabled", request_id);
    }
    let force_unary = tools_injected;

    if work.stream && !force_unary {
        return stream_response(work, backend, client_dialect, decision, guard, request_id, started)
            .await;
    }

    buffered_response(
        work,
        backend,
        client_dialect,
        decision,
        verdict.as_ref(),
        tools_injected,
        guard,
        request_id,
        started,
    )
    .await
}

/// Buffered dispatch with the bounded tool loop, thinking strip, footer, and
/// optional synthetic streaming envelope.
#[allow(clippy::too_many_arguments)]
async fn buffered_response(
    request: ChatRequest,
    backend: crate::config::BackendDesc,
    client_dialect: Dialect,
    decision: RouteDecision,
    verdict: Option<&Verdict>,
    tools_injected: bool,
    mut guard: LogGuard,
    request_id: String,
    started: Instant,
) -> Response {
    let client_wants_stream = request.stream;
    let mut work = request;
    work.stream = false;

    let mut rounds = 0usize;
    let mut executed_calls: Vec<crate::envelope::ToolCallRec> = Vec::new();
    let mut reply: ModelReply;

    loop {
        let body = crate::translator::build_request(backend.dialect, &work);
        let upstream =
            match crate::dispatch::dispatch_unary(&backend, &body, crate::dispatch::REQUEST_TIMEOUT)
                .await
            {
                Ok(upstream) => upstream,
                Err(e) => {
                    let headers =
                        proxy_headers(&request_id, &backend.name, started, Some(&decision.reason));
                    {
                        let entry = guard.entry_mut();
                        entry.status = 502;
                        entry.duration_ms = started.elapsed().as_millis() as i64;
                        entry.error = Some(e.to_string());
                    }
                    guard.complete();
                    return json_response(
                        StatusCode::BAD_GATEWAY,
                        headers,
                        proxy_error_body(&e.to_string(), &request_id),
                    );
                }
            };

        // Upstream errors pass through verbatim, status preserved.
        if upstream.status >= 300 {
            let headers =
                proxy_headers(&request_id, &backend.name, started, Some(&decision.reason));
            {
                let entry = guard.entry_mut();
                entry.status = upstream.status;
                entry.duration_ms = started.elapsed().as_millis() as i64;
                entry.response_body = capture_body(&upstream.body);
            }
            guard.complete();
            let status =
                StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            return json_response(status, headers, upstream.body);
        }

        reply = crate::translator::parse_reply(backend.dialect, &upstream.body);
        crate::translator::thinking::resolve_reply(&mut reply);

        let client_tools = !work.tools.is_empty() && !tools_injected;
        let detected =
            crate::tools::detect::detect_tool_calls(&reply, tools_injected);

        if detected.calls.is_empty() || client_tools {
            // Client-declared tools are the client's to execute.
            break;
        }
        if rounds >= MAX_TOOL_ROUNDS {
            tracing::warn!(
                "{}: tool calls after round {} ignored ({} residual)",
                request_id,
                MAX_TOOL_ROUNDS,
                detected.calls.len()
            );
            break;
        }

        rounds += 1;
        guard.entry_mut().tool_rounds = rounds as u32;
        let mut results = Vec::new();
        for call in &detected.calls {
            let result = crate::tools::execute(call).await;
            results.push((call.id.clone(), result));
        }
        executed_calls.extend(detected.calls.clone());
        crate::tools::append_round(&mut work, &detected.cleaned_text, &detected.calls, &results);
    }

    // The executed calls stay visible on the final reply so clients can see
    // what the gateway ran on their behalf.
    if reply.tool_calls.is_empty() && !executed_calls.is_empty() {
        reply.tool_calls = executed_calls;
    }

    // Auto-search salvage: a refusal with no tools in play gets one retry
    // with search results appended. Best effort, silent on failure.
    let auto_search = crate::config::get_config()
        .map(|c| c.router.auto_search)
        .unwrap_or(false);
    if auto_search
        && !tools_injected
        && rounds == 0
        && crate::tools::detect::looks_like_refusal(&reply.text)
    {
        if let Some(topic) = crate::tools::detect::salvage_topic(&work.last_user_text()) {
            if let Ok(results) = crate::tools::web_search::run(&topic).await {
                let mut salvage = work.clone();
                salvage.turns.push(Turn::text(
                    Role::User,
                    format!(
                        "Here is current information from a live search:\n\n{}\n\n\
                         Please answer the previous question again using it.",
                        results
                    ),
                ));
                salvage.tools.clear();
                if let Ok(mut salvaged) =
                    crate::dispatch::dispatch_simple(&backend, &salvage).await
                {
                    crate::translator::thinking::resolve_reply(&mut salvaged);
                    if !salvaged.text.is_empty() {
                        salvaged.usage.record(reply.usage.input, reply.usage.output);
                        reply = salvaged;
                    }
                }
            }
        }
    }

    finish_buffered(
        reply,
        &backend,
        client_dialect,
        decision,
        verdict,
        client_wants_stream,
        guard,
        request_id,
        started,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish_buffered(
    mut reply: ModelReply,
    backend: &crate::config::BackendDesc,
    client_dialect: Dialect,
    decision: RouteDecision,
    verdict: Option<&Verdict>,
    client_wants_stream: bool,
    mut guard: LogGuard,
    request_id: String,
    started: Instant,
) -> Response {
    let model_label = reply
        .model
        .clone()
        .unwrap_or_else(|| backend.name.clone());

    if !reply.text.is_empty() {
        reply.text.push_str(&crate::translator::attribution_footer(&model_label));
    }
    if reply.usage.output == 0 && !reply.text.is_empty() {
        reply.usage.record(reply.usage.input, estimate_tokens(&reply.text));
    }
    if reply.model.is_none() {
        reply.model = Some(model_label.clone());
    }

    crate::router::history::record_success(
        &backend.name,
        verdict.map(|v| v.category.as_str()),
    );

    let headers = proxy_headers(&request_id, &backend.name, started, Some(&decision.reason));
    {
        let entry = guard.entry_mut();
        entry.status = 200;
        entry.duration_ms = started.elapsed().as_millis() as i64;
        entry.input_tokens = reply.usage.input;
        entry.output_tokens = reply.usage.output;
        entry.response_body = capture_text(&reply.text);
        entry.streamed = client_wants_stream;
    }
    guard.complete();

    if client_wants_stream {
        // The client asked for streaming; replay the buffered reply through
        // its dialect's streaming envelope. The footer is already on the
        // text, so it goes out as a single delta.
        let frames = replay_frames(
            client_dialect,
            &request_id,
            &model_label,
            &reply.text,
            &reply.tool_calls,
            reply.stop,
            reply.usage,
        );
        let mut response = Response::new(Body::from(frames.concat()));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().extend(sse_headers());
        response.headers_mut().extend(headers);
        return response;
    }

    let body = crate::translator::build_reply(client_dialect, &reply, &request_id);
    json_response(StatusCode::OK, headers, body)
}

/// Synthetic streaming envelope for a buffered reply: one big delta plus the
/// dialect's lifecycle events.
fn replay_frames(
    dialect: Dialect,
    request_id: &str,
    model: &str,
    text: &str,
    calls: &[crate::envelope::ToolCallRec],
    stop: StopReason,
    usage: crate::envelope::TokenUsage,
) -> Vec<String> {
    match dialect {
        Dialect::ChatCompletions => {
            let mut emitter = crate::translator::chat::StreamEmitter::new(request_id, model);
            let mut frames = emitter.open();
            if !text.is_empty() {
                frames.extend(emitter.text_delta(text));
            }
            frames.extend(emitter.tool_calls(calls));
            frames.extend(emitter.finish(stop, usage));
            frames
        }
        Dialect::Messages => {
            let mut emitter = crate::translator::messages::StreamEmitter::new(request_id, model);
            let mut frames = emitter.open();
            if !text.is_empty() {
                frames.extend(emitter.text_delta(text));
            }
            frames.extend(emitter.tool_calls(calls));
            frames.extend(emitter.finish(stop, usage));
            frames
        }
        Dialect::Responses => {
            let mut emitter = crate::translator::responses::StreamEmitter::new(request_id, model);
            let mut frames = emitter.open();
            if !text.is_empty() {
                frames.extend(emitter.text_delta(text));
            }
            frames.extend(emitter.tool_calls(calls));
            frames.extend(emitter.finish(stop, usage));
            frames
        }
    }
}

/// True end-to-end streaming: upstream chunks flow through the translator
/// coroutine into the client connection. The log guard rides inside the
/// stream so the ring entry is written on completion, error, or disconnect.
#[allow(clippy::too_many_arguments)]
async fn stream_response(
    request: ChatRequest,
    backend: crate::config::BackendDesc,
    client_dialect: Dialect,
    decision: RouteDecision,
    mut guard: LogGuard,
    request_id: String,
    started: Instant,
) -> Response {
    let mut upstream_request = request.clone();
    upstream_request.stream = true;
    let body = crate::translator::build_request(backend.dialect, &upstream_request);

    let upstream = match crate::dispatch::dispatch_stream(
        &backend,
        &body,
        crate::dispatch::REQUEST_TIMEOUT,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            let headers = proxy_headers(&request_id, &backend.name, started, Some(&decision.reason));
            {
                let entry = guard.entry_mut();
                entry.status = 502;
                entry.duration_ms = started.elapsed().as_millis() as i64;
                entry.error = Some(e.to_string());
            }
            guard.complete();
            return json_response(
                StatusCode::BAD_GATEWAY,
                headers,
                proxy_error_body(&e.to_string(), &request_id),
            );
        }
    };

    let model_label = request
        .model
        .clone()
        .unwrap_or_else(|| backend.name.clone());
    let mut translator =
        StreamTranslator::new(client_dialect, backend.dialect, &request_id, &model_label);
    let headers = proxy_headers(&request_id, &backend.name, started, Some(&decision.reason));
    {
        let entry = guard.entry_mut();
        entry.status = 200;
        entry.streamed = true;
    }

    let backend_name = backend.name.clone();
    let category = guard
        .entry
        .as_ref()
        .and_then(|e| e.category.clone());

    let sse = async_stream::stream! {
        for frame in translator.open() {
            yield Ok::<_, std::convert::Infallible>(frame);
        }

        let mut byte_stream = upstream.bytes_stream();
        let mut transport_error: Option<String> = None;
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in translator.feed_bytes(&bytes) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    transport_error = Some(e.to_string());
                    break;
                }
            }
        }

        // Terminal events are still owed on abort; finish() is idempotent
        // and reconstructs the done event from partial state.
        for frame in translator.finish() {
            yield Ok(frame);
        }

        {
            let entry = guard.entry_mut();
            entry.duration_ms = started.elapsed().as_millis() as i64;
            entry.input_tokens = translator.usage().input;
            entry.output_tokens = translator.usage().output;
            entry.response_body = capture_text(translator.text());
            entry.error = transport_error;
        }
        if guard.entry.as_ref().map(|e| e.error.is_none()).unwrap_or(false) {
            crate::router::history::record_success(&backend_name, category.as_deref());
        }
        guard.complete();
    };

    let body = Body::from_stream(sse.map(|frame: Result<String, std::convert::Infallible>| {
        frame.map(axum::body::Bytes::from)
    }));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().extend(sse_headers());
    response.headers_mut().extend(headers);
    response
}

/// Parallel dispatch for multi-model decisions; the combined body carries one
/// labeled section per contributing backend.
#[allow(clippy::too_many_arguments)]
async fn fan_out_response(
    request: ChatRequest,
    client_dialect: Dialect,
    decision: RouteDecision,
    mut guard: LogGuard,
    request_id: String,
    started: Instant,
) -> Response {
    let backends: Vec<crate::config::BackendDesc> = decision
        .all_backends
        .iter()
        .filter_map(|name| crate::config::get_backend(name))
        .collect();

    if backends.is_empty() {
        let headers = proxy_headers(&request_id, &decision.primary, started, Some(&decision.reason));
        {
            let entry = guard.entry_mut();
            entry.status = 502;
            entry.duration_ms = started.elapsed().as_millis() as i64;
            entry.error = Some("no fan-out backends configured".to_string());
        }
        guard.complete();
        return json_response(
            StatusCode::BAD_GATEWAY,
            headers,
            proxy_error_body("No fan-out backends configured", &request_id),
        );
    }

    match crate::dispatch::fan_out(&backends, &request).await {
        Ok(result) => {
            let reply = ModelReply {
                model: Some(result.succeeded.join("+")),
                text: result.combined_text,
                ..Default::default()
            };
            let backend_label = result.succeeded.join(",");
            let headers =
                proxy_headers(&request_id, &backend_label, started, Some(&decision.reason));
            {
                let entry = guard.entry_mut();
                entry.backend = decision.primary.clone();
                entry.status = 200;
                entry.duration_ms = started.elapsed().as_millis() as i64;
                entry.output_tokens = estimate_tokens(&reply.text);
                entry.response_body = capture_text(&reply.text);
            }
            guard.complete();

            if request.stream {
                let frames = replay_frames(
                    client_dialect,
                    &request_id,
                    reply.model.as_deref().unwrap_or("fan-out"),
                    &reply.text,
                    &[],
                    StopReason::EndTurn,
                    reply.usage,
                );
                let mut response = Response::new(Body::from(frames.concat()));
                *response.status_mut() = StatusCode::OK;
                response.headers_mut().extend(sse_headers());
                response.headers_mut().extend(headers);
                return response;
            }

            let body = crate::translator::build_reply(client_dialect, &reply, &request_id);
            json_response(StatusCode::OK, headers, body)
        }
        Err(e) => {
            let headers =
                proxy_headers(&request_id, &decision.primary, started, Some(&decision.reason));
            {
                let entry = guard.entry_mut();
                entry.status = 502;
                entry.duration_ms = started.elapsed().as_millis() as i64;
                entry.error = Some(e.to_string());
            }
            guard.complete();
            json_response(
                StatusCode::BAD_GATEWAY,
                headers,
                proxy_error_body(&e.to_string(), &request_id),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::config::init_for_tests(crate::config::test_config());
        crate::router::init();
    }

    #[tokio::test]
    async fn cli_short_circuit_never_dispatches() {
        setup();
        let raw = json!({
            "model": "anything",
            "messages": [{"role": "user", "content": "proxy-cli status"}]
        });
        let response = handle(Dialect::ChatCompletions, raw, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-backend").unwrap(),
            cli::CLI_BACKEND_LABEL
        );
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn invalid_body_is_bad_request() {
        setup();
        let response = handle(Dialect::ChatCompletions, json!({"model": "x"}), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_forced_backend_is_proxy_error() {
        setup();
        let raw = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hello, how are you doing today my friend?"}]
        });
        let response = handle(Dialect::ChatCompletions, raw, Some("ghost".into())).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], json!("proxy_error"));
    }

    #[test]
    fn log_guard_records_cancellation_on_drop() {
        setup();
        let mut entry = base_entry("guard-test-1", Dialect::ChatCompletions, Utc::now());
        entry.backend = "general".into();
        let guard = LogGuard::new(entry);
        drop(guard);
        let logged = crate::observe::find("guard-test-1").unwrap();
        assert_eq!(logged.error.as_deref(), Some("client-cancelled"));
    }

    #[test]
    fn log_guard_complete_keeps_fields() {
        setup();
        let mut entry = base_entry("guard-test-2", Dialect::Messages, Utc::now());
        entry.backend = "coder".into();
        entry.status = 200;
        let guard = LogGuard::new(entry);
        guard.complete();
        let logged = crate::observe::find("guard-test-2").unwrap();
        assert!(logged.error.is_none());
        assert_eq!(logged.dialect, "messages");
    }

    #[test]
    fn replay_frames_cover_all_dialects() {
        for dialect in [Dialect::ChatCompletions, Dialect::Messages, Dialect::Responses] {
            let frames = replay_frames(
                dialect,
                "r1",
                "m",
                "buffered text",
                &[],
                StopReason::EndTurn,
                crate::envelope::TokenUsage { input: 1, output: 2 },
            );
            let joined = frames.join("");
            assert!(joined.contains("buffered text"), "dialect {}", dialect);
        }
    }
}
