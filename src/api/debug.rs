// Control plane: read-only introspection plus the live mutations (default
// backend, smart routing, user preferences). JSON in, JSON out; mutations go
// through the router's short-held locks so pipeline reads never stall.

use std::time::Instant;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::{ChatRequest, Role, Turn};

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

/// Pin the start instant; called once at boot.
pub fn mark_started() {
    Lazy::force(&STARTED);
}

pub async fn health() -> Json<Value> {
    let backends = crate::config::backend_names();
    Json(json!({
        "status": "ok",
        "uptime_seconds": STARTED.elapsed().as_secs(),
        "backends": backends.len(),
        "default_backend": crate::router::default_backend(),
        "smart_routing": crate::router::smart_routing_enabled(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub backend: Option<String>,
    pub status: Option<u16>,
}

pub async fn logs(Query(query): Query<LogsQuery>) -> Json<Value> {
    let entries = crate::observe::recent(
        query.limit.unwrap_or(50).min(crate::observe::RING_CAPACITY),
        query.backend.as_deref(),
        query.status,
    );
    Json(json!({ "count": entries.len(), "logs": entries }))
}

pub async fn stats() -> Json<crate::observe::StatsSnapshot> {
    Json(crate::observe::stats_snapshot())
}

pub async fn tokens() -> Json<crate::observe::TokenSnapshot> {
    Json(crate::observe::token_snapshot())
}

pub async fn models() -> Json<Value> {
    let backends = crate::config::get_config()
        .map(|c| c.backends)
        .unwrap_or_default();
    Json(json!({
        "default": crate::router::default_backend(),
        "backends": backends,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub backend: String,
}

pub async fn switch(Json(request): Json<SwitchRequest>) -> Response {
    match crate::router::set_default_backend(&request.backend) {
        Ok(()) => Json(json!({
            "ok": true,
            "default_backend": crate::router::default_backend(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn router_state() -> Json<Value> {
    let snapshot = crate::router::history::snapshot();
    Json(json!({
        "enabled": crate::router::smart_routing_enabled(),
        "default_backend": crate::router::default_backend(),
        "history": snapshot,
        "recent_decisions": crate::router::history::recent_decisions(20),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RouterAction {
    pub action: String,
    pub text: Option<String>,
    pub user_id: Option<String>,
    pub preferences: Option<crate::router::history::UserPreferences>,
}

pub async fn router_action(Json(request): Json<RouterAction>) -> Response {
    match request.action.as_str() {
        "classify" => {
            let Some(text) = request.text else {
                return bad_request("classify requires text");
            };
            let chat = ChatRequest {
                turns: vec![Turn::text(Role::User, text)],
                ..Default::default()
            };
            let verdict = crate::classifier::classify(&chat, request.user_id.as_deref()).await;
            Json(json!({"verdict": verdict})).into_response()
        }
        "setPreference" => {
            let (Some(user_id), Some(preferences)) = (request.user_id, request.preferences)
            else {
                return bad_request("setPreference requires user_id and preferences");
            };
            crate::router::history::set_preferences(&user_id, preferences);
            Json(json!({"ok": true})).into_response()
        }
        "clearHistory" => {
            crate::router::history::clear();
            Json(json!({"ok": true})).into_response()
        }
        "enable" => {
            crate::router::set_smart_routing(true);
            Json(json!({"ok": true, "enabled": true})).into_response()
        }
        "disable" => {
            crate::router::set_smart_routing(false);
            Json(json!({"ok": true, "enabled": false})).into_response()
        }
        other => bad_request(&format!("unknown action '{}'", other)),
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "error": message})),
    )
        .into_response()
}

/// Run the same payload against every configured backend and report each
/// outcome side by side.
pub async fn compare(Json(raw): Json<Value>) -> Response {
    let request = match crate::translator::parse_request(
        crate::envelope::Dialect::ChatCompletions,
        &raw,
    ) {
        Ok(request) => request,
        Err(e) => return bad_request(&format!("invalid request: {}", e)),
    };

    let backends = crate::config::get_config()
        .map(|c| c.backends)
        .unwrap_or_default();

    let futures = backends.into_iter().map(|backend| {
        let request = request.clone();
        async move {
            let started = Instant::now();
            let result = crate::dispatch::dispatch_simple(&backend, &request).await;
            let elapsed = started.elapsed().as_millis() as i64;
            match result {
                Ok(reply) => json!({
                    "backend": backend.name,
                    "ok": true,
                    "latency_ms": elapsed,
                    "text": reply.text,
                    "usage": reply.usage,
                }),
                Err(e) => json!({
                    "backend": backend.name,
                    "ok": false,
                    "latency_ms": elapsed,
                    "error": e.to_string(),
                }),
            }
        }
    });

    let results = futures::future::join_all(futures).await;
    Json(json!({"comparisons": results})).into_response()
}

pub async fn history(
    Query(filter): Query<crate::archive::HistoryFilter>,
) -> Response {
    match crate::archive::query_history(&filter) {
        Ok(rows) => Json(json!({"count": rows.len(), "requests": rows})).into_response(),
        Err(e) => archive_unavailable(e),
    }
}

pub async fn history_entry(Path(id): Path<String>) -> Response {
    match crate::archive::get_request(&id) {
        Ok(Some(row)) => Json(json!(row)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no archived request '{}'", id)})),
        )
            .into_response(),
        Err(e) => archive_unavailable(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub days: Option<i64>,
}

pub async fn analytics(Query(query): Query<AnalyticsQuery>) -> Response {
    match crate::archive::analytics(query.days.unwrap_or(7).clamp(1, 365)) {
        Ok(report) => Json(json!(report)).into_response(),
        Err(e) => archive_unavailable(e),
    }
}

fn archive_unavailable(e: anyhow::Error) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": format!("archive unavailable: {}", e)})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::config::init_for_tests(crate::config::test_config());
        crate::router::init();
    }

    #[tokio::test]
    async fn health_reports_backend_count() {
        setup();
        let Json(body) = health().await;
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["backends"], json!(5));
    }

    #[tokio::test]
    async fn switch_validates_backend() {
        let _control = crate::router::CONTROL_TEST_LOCK.lock();
        setup();
        let response = switch(Json(SwitchRequest { backend: "ghost".into() })).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = switch(Json(SwitchRequest { backend: "coder".into() })).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(crate::router::default_backend(), "coder");
        crate::router::set_default_backend("general").unwrap();
    }

    #[tokio::test]
    async fn router_action_toggles_flag() {
        let _control = crate::router::CONTROL_TEST_LOCK.lock();
        setup();
        let response = router_action(Json(RouterAction {
            action: "disable".into(),
            text: None,
            user_id: None,
            preferences: None,
        }))
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!crate::router::smart_routing_enabled());
        router_action(Json(RouterAction {
            action: "enable".into(),
            text: None,
            user_id: None,
            preferences: None,
        }))
        .await;
        assert!(crate::router::smart_routing_enabled());
    }

    #[tokio::test]
    async fn router_action_rejects_unknown() {
        setup();
        let response = router_action(Json(RouterAction {
            action: "explode".into(),
            text: None,
            user_id: None,
            preferences: None,
        }))
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
