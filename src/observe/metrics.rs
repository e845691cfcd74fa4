//! Prometheus mirror of the gateway counters, exposed in text format on a
//! dedicated listener so scrapes never contend with proxy traffic.

use anyhow::Result;
use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, Encoder, Gauge, IntCounter,
    IntCounterVec, TextEncoder,
};

pub static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("llm_proxy_requests_total", "Total proxied requests")
        .expect("register llm_proxy_requests_total")
});

pub static ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("llm_proxy_errors_total", "Total failed requests")
        .expect("register llm_proxy_errors_total")
});

pub static LATENCY_AVG_MS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "llm_proxy_latency_avg_ms",
        "Mean request latency in milliseconds"
    )
    .expect("register llm_proxy_latency_avg_ms")
});

pub static REQUESTS_BY_BACKEND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "llm_proxy_requests_by_backend",
        "Requests per upstream backend",
        &["backend"]
    )
    .expect("register llm_proxy_requests_by_backend")
});

pub static REQUESTS_BY_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "llm_proxy_requests_by_status",
        "Requests per response status",
        &["status"]
    )
    .expect("register llm_proxy_requests_by_status")
});

pub static TOKENS_INPUT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("llm_proxy_tokens_input_total", "Total input tokens")
        .expect("register llm_proxy_tokens_input_total")
});

pub static TOKENS_OUTPUT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("llm_proxy_tokens_output_total", "Total output tokens")
        .expect("register llm_proxy_tokens_output_total")
});

pub static TOKENS_BY_BACKEND_INPUT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "llm_proxy_tokens_by_backend_input",
        "Input tokens per backend",
        &["backend"]
    )
    .expect("register llm_proxy_tokens_by_backend_input")
});

pub static TOKENS_BY_BACKEND_OUTPUT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "llm_proxy_tokens_by_backend_output",
        "Output tokens per backend",
        &["backend"]
    )
    .expect("register llm_proxy_tokens_by_backend_output")
});

async fn render_metrics() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub async fn serve(host: &str, port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(render_metrics));
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Metrics listener on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exposition_contains_registered_names() {
        REQUESTS_TOTAL.inc();
        TOKENS_INPUT_TOTAL.inc_by(3);
        REQUESTS_BY_BACKEND.with_label_values(&["general"]).inc();
        let body = render_metrics().await;
        assert!(body.contains("llm_proxy_requests_total"));
        assert!(body.contains("llm_proxy_tokens_input_total"));
        assert!(body.contains("llm_proxy_requests_by_backend"));
        assert!(body.contains("backend=\"general\""));
    }
}
