// Inbound proxy handlers: the three dialect endpoints, the backend-forced
// path form, the model list, and the root banner.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::{json, Value};

use crate::envelope::Dialect;

pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "llm-proxy gateway",
        "endpoints": [
            "POST /v1/chat/completions",
            "POST /v1/messages",
            "POST /v1/responses",
            "POST /{backend}/v1/chat/completions",
            "GET /v1/models",
            "GET /debug/health"
        ]
    }))
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// Backends presented as models, chat-completions style.
pub async fn models() -> Json<ModelsResponse> {
    let backends = crate::config::get_config()
        .map(|c| c.backends)
        .unwrap_or_default();
    let data = backends
        .into_iter()
        .map(|b| ModelInfo {
            id: b.name,
            object: "model".to_string(),
            created: 0,
            owned_by: "llm-proxy".to_string(),
        })
        .collect();
    Json(ModelsResponse { object: "list".to_string(), data })
}

pub async fn chat_completions(Json(raw): Json<Value>) -> Response {
    crate::pipeline::handle(Dialect::ChatCompletions, raw, None).await
}

pub async fn messages(Json(raw): Json<Value>) -> Response {
    crate::pipeline::handle(Dialect::Messages, raw, None).await
}

pub async fn responses(Json(raw): Json<Value>) -> Response {
    crate::pipeline::handle(Dialect::Responses, raw, None).await
}

/// `/{backend}/…` forces routing to the named backend; the rest of the path
/// picks the dialect by substring.
pub async fn forced_proxy(Path(path): Path<String>, Json(raw): Json<Value>) -> Response {
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let backend = segments.next().unwrap_or("").to_string();
    let rest = segments.next().unwrap_or("");

    if crate::config::get_backend(&backend).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "type": "invalid_request_error",
                    "message": format!("Unknown path or backend '{}'", backend),
                }
            })),
        )
            .into_response();
    }

    let Some(dialect) = dialect_from_path(rest) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "type": "invalid_request_error",
                    "message": format!("No proxy endpoint under '/{}'", path),
                }
            })),
        )
            .into_response();
    };

    crate::pipeline::handle(dialect, raw, Some(backend)).await
}

fn dialect_from_path(path: &str) -> Option<Dialect> {
    if path.contains("chat/completions") {
        Some(Dialect::ChatCompletions)
    } else if path.contains("messages") {
        Some(Dialect::Messages)
    } else if path.contains("responses") {
        Some(Dialect::Responses)
    } else {
        None
    }
}
