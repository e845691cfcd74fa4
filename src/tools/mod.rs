// Server-side tool registry and the helpers the pipeline uses around it:
// injection into outgoing requests, execution with error capture, and the
// follow-up request shaping for the bounded tool loop.

pub mod detect;
pub mod web_search;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::classifier::{Category, Verdict};
use crate::envelope::{ChatRequest, Role, ToolCallRec, ToolDef, Turn};
use crate::router::RouteDecision;

/// Hard cap on tool-execution rounds per request.
pub const MAX_TOOL_ROUNDS: usize = 3;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;
pub type Handler = fn(Value) -> HandlerFuture;

struct RegisteredTool {
    def: ToolDef,
    handler: Handler,
}

static REGISTRY: Lazy<RwLock<HashMap<String, RegisteredTool>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "web_search".to_string(),
        RegisteredTool { def: web_search_def(), handler: web_search_handler },
    );
    RwLock::new(map)
});

pub fn web_search_def() -> ToolDef {
    ToolDef {
        name: "web_search".to_string(),
        description: "Search for current information: weather conditions and forecasts, \
                      news, cryptocurrency and commodity prices, and website status. \
                      Use this whenever the user asks about something happening now."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query, e.g. 'weather in Paris' or 'BTC price'",
                }
            },
            "required": ["query"],
        }),
    }
}

fn web_search_handler(arguments: Value) -> HandlerFuture {
    Box::pin(async move {
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("web_search requires a query string"))?
            .to_string();
        web_search::run(&query).await
    })
}

/// Register (or replace) a tool handler.
pub fn register(def: ToolDef, handler: Handler) {
    REGISTRY
        .write()
        .insert(def.name.clone(), RegisteredTool { def, handler });
}

pub fn registered_defs() -> Vec<ToolDef> {
    REGISTRY.read().values().map(|t| t.def.clone()).collect()
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.read().contains_key(name)
}

/// Execute one call. Failures become error-string results so the loop keeps
/// going; an unknown tool is just another error result.
pub async fn execute(call: &ToolCallRec) -> String {
    let handler = {
        let registry = REGISTRY.read();
        registry.get(&call.name).map(|t| t.handler)
    };
    let Some(handler) = handler else {
        tracing::warn!("Tool '{}' is not registered", call.name);
        return format!("Error: tool '{}' is not available", call.name);
    };
    match handler(call.arguments.clone()).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("Tool '{}' failed: {}", call.name, e);
            format!("Error: {} failed: {}", call.name, e)
        }
    }
}

// Spelled out in the system prompt as well, for backends whose models do not
// honor a native tools array and only follow instructions.
const INJECTION_PROMPT: &str = "You can call the web_search tool for live data \
(weather, news, prices, service status).\n\
Tool definition: web_search(query: string) - fetches current information.\n\
When the user's question needs current information, respond with exactly this \
and nothing else:\n\
<tool_call>{\"name\": \"web_search\", \"arguments\": {\"query\": \"...\"}}</tool_call>\n\
Otherwise answer directly. After receiving tool results, answer in plain language.";

/// Whether this request gets the server-side web_search injected: realtime
/// classification, non-premium routing, and the client brought no tools.
pub fn should_inject(
    verdict: Option<&Verdict>,
    decision: &RouteDecision,
    request: &ChatRequest,
) -> bool {
    if request.has_client_tools() {
        return false;
    }
    let realtime = verdict
        .map(|v| v.category == Category::Realtime)
        .unwrap_or(false);
    if !realtime {
        return false;
    }
    let premium = crate::config::premium_backend()
        .map(|b| b.name == decision.primary)
        .unwrap_or(false);
    !premium
}

/// Append the tool definition and the instruction paragraph. The caller also
/// disables streaming on the dispatch so the loop can parse a full reply.
pub fn inject_web_search(request: &mut ChatRequest) {
    request.tools.push(web_search_def());

    let paragraph = INJECTION_PROMPT.to_string();
    if let Some(turn) = request
        .turns
        .iter_mut()
        .find(|t| t.role == Role::System)
    {
        let existing = turn.content.flat_text();
        *turn = Turn::text(Role::System, format!("{}\n\n{}", existing, paragraph));
    } else {
        request.turns.insert(0, Turn::text(Role::System, paragraph));
    }
}

/// Shape the follow-up request for the next loop round: the assistant's call
/// turn, one tool turn per result, and the definitions removed so the model
/// answers from the results instead of iterating.
pub fn append_round(
    request: &mut ChatRequest,
    assistant_text: &str,
    calls: &[ToolCallRec],
    results: &[(String, String)],
) {
    request.turns.push(Turn {
        role: Role::Assistant,
        content: crate::envelope::TurnContent::Text(assistant_text.to_string()),
        tool_calls: calls.to_vec(),
        tool_call_id: None,
    });
    for (call_id, result) in results {
        request.turns.push(Turn::tool_result(call_id.clone(), result.clone()));
    }
    request.tools.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Complexity, VerdictSource};

    fn realtime_verdict() -> Verdict {
        Verdict {
            category: Category::Realtime,
            confidence: 0.95,
            complexity: Complexity::Simple,
            keywords: vec!["weather".into()],
            suggested_backends: vec!["scout".into()],
            reasoning: String::new(),
            source: VerdictSource::QuickRegex,
            retry_with_search: false,
        }
    }

    fn decision(primary: &str) -> RouteDecision {
        RouteDecision {
            primary: primary.into(),
            all_backends: vec![primary.into()],
            reason: String::new(),
            confidence: 0.95,
            candidates: Vec::new(),
            tools_routed: false,
            multi_model: false,
        }
    }

    #[test]
    fn injection_requires_realtime_non_premium_no_client_tools() {
        crate::config::init_for_tests(crate::config::test_config());
        let verdict = realtime_verdict();
        let request = ChatRequest::default();

        assert!(should_inject(Some(&verdict), &decision("scout"), &request));
        assert!(!should_inject(Some(&verdict), &decision("premium"), &request));
        assert!(!should_inject(None, &decision("scout"), &request));

        let mut with_tools = ChatRequest::default();
        with_tools.tools.push(web_search_def());
        assert!(!should_inject(Some(&verdict), &decision("scout"), &with_tools));
    }

    #[test]
    fn inject_adds_tool_and_system_paragraph() {
        let mut request = ChatRequest {
            turns: vec![Turn::text(Role::User, "umbrella in Paris?")],
            ..Default::default()
        };
        inject_web_search(&mut request);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.turns[0].role, Role::System);
        assert!(request.turns[0].content.flat_text().contains("web_search"));

        // An existing system prompt is extended, not replaced.
        let mut request = ChatRequest {
            turns: vec![
                Turn::text(Role::System, "Be concise."),
                Turn::text(Role::User, "umbrella?"),
            ],
            ..Default::default()
        };
        inject_web_search(&mut request);
        let system = request.turns[0].content.flat_text();
        assert!(system.starts_with("Be concise."));
        assert!(system.contains("web_search"));
    }

    #[test]
    fn append_round_strips_tool_definitions() {
        let mut request = ChatRequest {
            turns: vec![Turn::text(Role::User, "btc?")],
            tools: vec![web_search_def()],
            ..Default::default()
        };
        let call = ToolCallRec {
            id: "call_1".into(),
            name: "web_search".into(),
            arguments: json!({"query": "btc"}),
        };
        append_round(
            &mut request,
            "",
            &[call],
            &[("call_1".to_string(), "BTC: $60k".to_string())],
        );
        assert!(request.tools.is_empty());
        assert_eq!(request.turns.len(), 3);
        assert_eq!(request.turns[1].role, Role::Assistant);
        assert_eq!(request.turns[2].role, Role::Tool);
        assert_eq!(request.turns[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let call = ToolCallRec {
            id: "call_x".into(),
            name: "no_such_tool".into(),
            arguments: json!({}),
        };
        let result = execute(&call).await;
        assert!(result.starts_with("Error:"));
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        fn echo(arguments: Value) -> HandlerFuture {
            Box::pin(async move {
                Ok(format!("echo: {}", arguments.get("text").and_then(|v| v.as_str()).unwrap_or("")))
            })
        }
        register(
            ToolDef {
                name: "echo".into(),
                description: "echo".into(),
                parameters: json!({"type": "object"}),
            },
            echo,
        );
        let call = ToolCallRec {
            id: "call_e".into(),
            name: "echo".into(),
            arguments: json!({"text": "hi"}),
        };
        assert_eq!(execute(&call).await, "echo: hi");
        assert!(is_registered("web_search"));
    }
}
