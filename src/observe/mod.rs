// Observability sink: a bounded ring of recent requests plus aggregate
// counters. Insertion is synchronous at pipeline completion and happens
// exactly once per request; the optional archive write is spawned from here.

pub mod metrics;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const RING_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub backend: String,
    pub dialect: String,
    pub status: u16,
    pub duration_ms: i64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_reason: Option<String>,
    /// Captured bodies, truncated to the configured byte budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub streamed: bool,
    pub tool_rounds: u32,
}

#[derive(Debug, Default)]
struct Stats {
    requests_total: u64,
    errors_total: u64,
    latency_sum_ms: i64,
    latency_count: u64,
    by_backend: HashMap<String, u64>,
    by_status: HashMap<u16, u64>,
    tokens_input: u64,
    tokens_output: u64,
    tokens_by_backend: HashMap<String, (u64, u64)>,
}

static RING: Lazy<Mutex<VecDeque<LogEntry>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(RING_CAPACITY)));
static STATS: Lazy<Mutex<Stats>> = Lazy::new(|| Mutex::new(Stats::default()));

/// Record a completed request. The single entry point for the ring buffer,
/// the counters, the prometheus mirror, and the archive.
pub fn record(entry: LogEntry) {
    {
        let mut stats = STATS.lock();
        stats.requests_total += 1;
        if entry.error.is_some() || entry.status >= 500 {
            stats.errors_total += 1;
            metrics::ERRORS_TOTAL.inc();
        }
        stats.latency_sum_ms += entry.duration_ms;
        stats.latency_count += 1;
        *stats.by_backend.entry(entry.backend.clone()).or_insert(0) += 1;
        *stats.by_status.entry(entry.status).or_insert(0) += 1;
        stats.tokens_input += entry.input_tokens;
        stats.tokens_output += entry.output_tokens;
        let per_backend = stats
            .tokens_by_backend
            .entry(entry.backend.clone())
            .or_insert((0, 0));
        per_backend.0 += entry.input_tokens;
        per_backend.1 += entry.output_tokens;

        let status_label = entry.status.to_string();
        metrics::REQUESTS_TOTAL.inc();
        metrics::REQUESTS_BY_BACKEND
            .with_label_values(&[entry.backend.as_str()])
            .inc();
        metrics::REQUESTS_BY_STATUS
            .with_label_values(&[status_label.as_str()])
            .inc();
        metrics::TOKENS_INPUT_TOTAL.inc_by(entry.input_tokens);
        metrics::TOKENS_OUTPUT_TOTAL.inc_by(entry.output_tokens);
        metrics::TOKENS_BY_BACKEND_INPUT
            .with_label_values(&[entry.backend.as_str()])
            .inc_by(entry.input_tokens);
        metrics::TOKENS_BY_BACKEND_OUTPUT
            .with_label_values(&[entry.backend.as_str()])
            .inc_by(entry.output_tokens);
        if stats.latency_count > 0 {
            metrics::LATENCY_AVG_MS
                .set(stats.latency_sum_ms as f64 / stats.latency_count as f64);
        }
    }

    crate::archive::submit(&entry);

    let mut ring = RING.lock();
    push_bounded(&mut ring, entry);
}

fn push_bounded(ring: &mut VecDeque<LogEntry>, entry: LogEntry) {
    if ring.len() >= RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(entry);
}

/// Most recent entries, newest first, optionally filtered.
pub fn recent(
    limit: usize,
    backend: Option<&str>,
    status: Option<u16>,
) -> Vec<LogEntry> {
    let ring = RING.lock();
    ring.iter()
        .rev()
        .filter(|e| backend.map(|b| e.backend == b).unwrap_or(true))
        .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
        .take(limit)
        .cloned()
        .collect()
}

pub fn find(id: &str) -> Option<LogEntry> {
    RING.lock().iter().find(|e| e.id == id).cloned()
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub latency_avg_ms: f64,
    pub by_backend: HashMap<String, u64>,
    pub by_status: HashMap<u16, u64>,
}

#[derive(Debug, Serialize)]
pub struct TokenSnapshot {
    pub input_total: u64,
    pub output_total: u64,
    pub by_backend: HashMap<String, TokenPair>,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub input: u64,
    pub output: u64,
}

pub fn stats_snapshot() -> StatsSnapshot {
    let stats = STATS.lock();
    StatsSnapshot {
        requests_total: stats.requests_total,
        errors_total: stats.errors_total,
        latency_avg_ms: if stats.latency_count == 0 {
            0.0
        } else {
            stats.latency_sum_ms as f64 / stats.latency_count as f64
        },
        by_backend: stats.by_backend.clone(),
        by_status: stats.by_status.clone(),
    }
}

pub fn token_snapshot() -> TokenSnapshot {
    let stats = STATS.lock();
    TokenSnapshot {
        input_total: stats.tokens_input,
        output_total: stats.tokens_output,
        by_backend: stats
            .tokens_by_backend
            .iter()
            .map(|(k, (input, output))| {
                (k.clone(), TokenPair { input: *input, output: *output })
            })
            .collect(),
    }
}

/// Truncate a captured body to the configured budget, marking the cut.
pub fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated]", &body[..cut])
}

#[cfg(test)]
pub fn entry_for_tests(id: &str, backend: &str, status: u16) -> LogEntry {
    LogEntry {
        id: id.to_string(),
        timestamp: Utc::now(),
        backend: backend.to_string(),
        dialect: "chat-completions".to_string(),
        status,
        duration_ms: 12,
        input_tokens: 10,
        output_tokens: 5,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let mut ring = VecDeque::new();
        for i in 0..(RING_CAPACITY + 7) {
            push_bounded(&mut ring, entry_for_tests(&format!("ring-{}", i), "general", 200));
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        assert!(ring.iter().all(|e| e.id != "ring-0"));
        assert_eq!(ring.back().unwrap().id, format!("ring-{}", RING_CAPACITY + 6));
    }

    #[test]
    fn totals_match_breakdowns() {
        record(entry_for_tests("sum-1", "alpha", 200));
        record(entry_for_tests("sum-2", "beta", 502));
        let snapshot = stats_snapshot();
        let by_backend: u64 = snapshot.by_backend.values().sum();
        let by_status: u64 = snapshot.by_status.values().sum();
        assert_eq!(snapshot.requests_total, by_backend);
        assert_eq!(snapshot.requests_total, by_status);

        let tokens = token_snapshot();
        let input_sum: u64 = tokens.by_backend.values().map(|p| p.input).sum();
        let output_sum: u64 = tokens.by_backend.values().map(|p| p.output).sum();
        assert_eq!(tokens.input_total, input_sum);
        assert_eq!(tokens.output_total, output_sum);
    }

    #[test]
    fn recent_filters_by_backend_and_status() {
        record(entry_for_tests("f-1", "gamma", 200));
        record(entry_for_tests("f-2", "gamma", 404));
        record(entry_for_tests("f-3", "delta", 200));
        let gamma = recent(50, Some("gamma"), None);
        assert!(gamma.iter().all(|e| e.backend == "gamma"));
        let not_found = recent(50, Some("gamma"), Some(404));
        assert!(not_found.iter().all(|e| e.status == 404));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let body = "héllo wörld";
        let cut = truncate_body(body, 2);
        assert!(cut.starts_with('h'));
        assert!(cut.ends_with("[truncated]"));
        assert_eq!(truncate_body("short", 100), "short");
    }
}
