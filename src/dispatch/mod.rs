// Upstream HTTP client: unary, streaming, and fan-out dispatch. One reqwest
// client per process; deadlines ride on the request builder so a hung
// upstream surfaces as a transport error.

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::time::timeout;

use crate::config::BackendDesc;
use crate::envelope::{ChatRequest, Dialect, ModelReply};

/// Per-request deadline for a single upstream call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Wall-clock budget for the whole fan-out join.
pub const FAN_OUT_BUDGET: Duration = Duration::from_secs(90);

static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("reqwest client")
});

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

fn endpoint_path(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::ChatCompletions => "/chat/completions",
        Dialect::Messages => "/messages",
        Dialect::Responses => "/responses",
    }
}

pub fn endpoint_url(backend: &BackendDesc) -> String {
    format!(
        "{}{}",
        backend.url.trim_end_matches('/'),
        endpoint_path(backend.dialect)
    )
}

fn request_builder(backend: &BackendDesc, url: &str) -> reqwest::RequestBuilder {
    let builder = CLIENT.post(url).header("content-type", "application/json");
    if backend.premium {
        let key = crate::config::get_config()
            .map(|c| c.premium_api_key)
            .unwrap_or_default();
        builder
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
    } else {
        // Local inference servers expect a bearer header but ignore the value.
        builder.header("authorization", "Bearer not-needed")
    }
}

/// One buffered upstream call. Non-2xx responses are returned, not errors —
/// the pipeline passes them through verbatim.
pub async fn dispatch_unary(
    backend: &BackendDesc,
    body: &Value,
    deadline: Duration,
) -> Result<UpstreamResponse> {
    let url = endpoint_url(backend);
    tracing::debug!("Dispatching to {} ({})", backend.name, url);

    let response = request_builder(backend, &url)
        .timeout(deadline)
        .json(body)
        .send()
        .await
        .map_err(|e| anyhow!("upstream {} unreachable: {}", backend.name, e))?;

    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text)
        .unwrap_or_else(|_| Value::String(text));
    Ok(UpstreamResponse { status, body })
}

/// Open a streaming upstream call; the caller drives `bytes_stream()`.
pub async fn dispatch_stream(
    backend: &BackendDesc,
    body: &Value,
    deadline: Duration,
) -> Result<reqwest::Response> {
    let url = endpoint_url(backend);
    let response = request_builder(backend, &url)
        .timeout(deadline)
        .json(body)
        .send()
        .await
        .map_err(|e| anyhow!("upstream {} unreachable: {}", backend.name, e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(anyhow!("upstream {} returned {}: {}", backend.name, status, text));
    }
    Ok(response)
}

/// Buffered request/normalized reply helper for internal calls (classifier
/// probes, tool-loop rounds). Always unary.
pub async fn dispatch_simple(backend: &BackendDesc, request: &ChatRequest) -> Result<ModelReply> {
    let mut request = request.clone();
    request.stream = false;
    let body = crate::translator::build_request(backend.dialect, &request);
    let response = dispatch_unary(backend, &body, REQUEST_TIMEOUT).await?;
    if response.status >= 300 {
        return Err(anyhow!(
            "upstream {} returned {}: {}",
            backend.name,
            response.status,
            response.body
        ));
    }
    Ok(crate::translator::parse_reply(backend.dialect, &response.body))
}

#[derive(Debug)]
pub struct FanOutResult {
    pub combined_text: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Dispatch the same request to several backends in parallel and combine the
/// successes into one labeled body. Partial failure is fine; total failure
/// is an error.
pub async fn fan_out(backends: &[BackendDesc], request: &ChatRequest) -> Result<FanOutResult> {
    let futures = backends.iter().map(|backend| {
        let backend = backend.clone();
        let request = request.clone();
        async move {
            let result = timeout(FAN_OUT_BUDGET, dispatch_simple(&backend, &request)).await;
            let reply = match result {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(anyhow!("fan-out deadline exceeded")),
            };
            (backend.name, reply)
        }
    });

    let results = join_all(futures).await;

    let mut sections = Vec::new();
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for (name, result) in results {
        match result {
            Ok(mut reply) => {
                crate::translator::thinking::resolve_reply(&mut reply);
                sections.push(format!("### {}\n\n{}", name, reply.text.trim()));
                succeeded.push(name);
            }
            Err(e) => {
                tracing::warn!("Fan-out branch {} failed: {}", name, e);
                failed.push(name);
            }
        }
    }

    if succeeded.is_empty() {
        return Err(anyhow!("all fan-out backends failed"));
    }

    let combined_text = format!(
        "{}\n\n_[responses from {}]_",
        sections.join("\n\n"),
        succeeded.join(", ")
    );
    Ok(FanOutResult { combined_text, succeeded, failed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_follow_dialect() {
        crate::config::init_for_tests(crate::config::test_config());
        let chat = crate::config::get_backend("general").unwrap();
        assert_eq!(endpoint_url(&chat), "http://localhost:11434/chat/completions");
        let msgs = crate::config::get_backend("premium").unwrap();
        assert_eq!(endpoint_url(&msgs), "https://api.example.com/v1/messages");
        let resp = crate::config::get_backend("archivist").unwrap();
        assert!(endpoint_url(&resp).ends_with("/responses"));
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        crate::config::init_for_tests(crate::config::test_config());
        let backend = BackendDesc {
            name: "void".into(),
            // Reserved port on localhost that nothing listens on.
            url: "http://127.0.0.1:9".into(),
            dialect: Dialect::ChatCompletions,
            specialties: vec![],
            context_window: 1024,
            speed: "fast".into(),
            premium: false,
        };
        let err = dispatch_unary(&backend, &serde_json::json!({}), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[tokio::test]
    async fn fan_out_total_failure_is_error() {
        crate::config::init_for_tests(crate::config::test_config());
        let dead = BackendDesc {
            name: "dead".into(),
            url: "http://127.0.0.1:9".into(),
            dialect: Dialect::ChatCompletions,
            specialties: vec![],
            context_window: 1024,
            speed: "fast".into(),
            premium: false,
        };
        let request = ChatRequest::default();
        let result = fan_out(&[dead], &request).await;
        assert!(result.is_err());
    }
}
