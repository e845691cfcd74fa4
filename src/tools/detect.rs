// Tool-invocation detection across the three formats models actually emit:
// structured tool calls, XML-tagged calls embedded in content, and a bare
// JSON object standing in for the whole reply. Checked in that order.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{ModelReply, ToolCallRec};

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Index of the brace closing the object that starts at `start_pos`,
/// respecting strings and escapes.
pub fn find_matching_brace(text: &str, start_pos: usize) -> Option<usize> {
    if start_pos >= text.len() || text.as_bytes()[start_pos] != b'{' {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (i, ch) in text[start_pos..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == '{' {
                depth += 1;
            } else if ch == '}' {
                depth -= 1;
                if depth == 0 {
                    return Some(start_pos + i);
                }
            }
        }
    }
    None
}

/// First complete `{…}` block in the text, parsed.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = find_matching_brace(text, start)?;
    serde_json::from_str(&text[start..=end]).ok()
}

fn generate_call_id() -> String {
    let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("call_{}", id)
}

fn call_from_value(value: &Value) -> Option<ToolCallRec> {
    let name = value.get("name").and_then(|v| v.as_str())?;
    let arguments = value.get("arguments")?;
    if !arguments.is_object() {
        return None;
    }
    Some(ToolCallRec {
        id: generate_call_id(),
        name: name.to_string(),
        arguments: arguments.clone(),
    })
}

/// Hermes-style calls embedded in content. Returns the parsed calls and the
/// content with the tagged regions removed.
fn extract_tagged_calls(text: &str) -> (Vec<ToolCallRec>, String) {
    if !text.contains(TOOL_CALL_OPEN) {
        return (Vec::new(), text.to_string());
    }

    let mut calls = Vec::new();
    let mut cleaned = String::new();
    let mut rest = text;

    while let Some(open) = rest.find(TOOL_CALL_OPEN) {
        cleaned.push_str(&rest[..open]);
        let after_open = &rest[open + TOOL_CALL_OPEN.len()..];
        let Some(close) = after_open.find(TOOL_CALL_CLOSE) else {
            // Unterminated tag: keep the raw text.
            cleaned.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let body = after_open[..close].trim();
        match serde_json::from_str::<Value>(body).ok().as_ref().and_then(call_from_value) {
            Some(call) => calls.push(call),
            None => tracing::warn!("Unparseable tool_call body: {}", body),
        }
        rest = &after_open[close + TOOL_CALL_CLOSE.len()..];
    }
    cleaned.push_str(rest);

    (calls, cleaned.trim().to_string())
}

static DEDUP_SEPARATOR: &str = "\u{1}";

fn deduplicate(calls: Vec<ToolCallRec>) -> Vec<ToolCallRec> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for call in calls {
        let key = format!("{}{}{}", call.name, DEDUP_SEPARATOR, call.arguments);
        if seen.insert(key) {
            out.push(call);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct DetectedCalls {
    pub calls: Vec<ToolCallRec>,
    /// User-visible content after call markup is removed.
    pub cleaned_text: String,
}

/// Run the three detection tiers against a buffered reply. The bare-JSON
/// tier is heuristic, so it only applies when this gateway injected tools
/// into the request.
pub fn detect_tool_calls(reply: &ModelReply, tools_injected: bool) -> DetectedCalls {
    if !reply.tool_calls.is_empty() {
        let calls = reply
            .tool_calls
            .iter()
            .cloned()
            .map(|mut call| {
                if call.id.is_empty() {
                    call.id = generate_call_id();
                }
                call
            })
            .collect();
        return DetectedCalls {
            calls: deduplicate(calls),
            cleaned_text: reply.text.clone(),
        };
    }

    let (tagged, cleaned) = extract_tagged_calls(&reply.text);
    if !tagged.is_empty() {
        return DetectedCalls { calls: deduplicate(tagged), cleaned_text: cleaned };
    }

    if tools_injected {
        let trimmed = reply.text.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                if let Some(call) = call_from_value(&value) {
                    return DetectedCalls { calls: vec![call], cleaned_text: String::new() };
                }
            }
        }
    }

    DetectedCalls { calls: Vec::new(), cleaned_text: reply.text.clone() }
}

/// Phrases that mean the model declined for lack of live data. Drives the
/// auto-search salvage pass.
static NO_REALTIME_ACCESS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)don'?t have (access to )?real[- ]?time",
        r"(?i)do not have (access to )?real[- ]?time",
        r"(?i)can'?t (access|browse) the (internet|web)",
        r"(?i)cannot (access|browse) the (internet|web)",
        r"(?i)check a weather (site|website|app|service)",
        r"(?i)check (a|your) (news|financial) (site|source)",
        r"(?i)my (knowledge|training) (data )?(was )?(cut ?off|ends)",
        r"(?i)as of my last (update|training)",
        r"(?i)i recommend checking",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("refusal pattern"))
    .collect()
});

pub fn looks_like_refusal(text: &str) -> bool {
    NO_REALTIME_ACCESS.iter().any(|r| r.is_match(text))
}

/// Best-effort topic for a salvage search: the latest user question, cut to
/// something an upstream search can digest.
pub fn salvage_topic(user_text: &str) -> Option<String> {
    let topic: String = user_text
        .trim()
        .trim_end_matches(['?', '!', '.'])
        .chars()
        .take(120)
        .collect();
    if topic.len() < 3 {
        None
    } else {
        Some(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(text: &str) -> ModelReply {
        ModelReply { text: text.to_string(), ..Default::default() }
    }

    #[test]
    fn native_calls_win_over_content() {
        let mut r = reply("<tool_call>{\"name\":\"other\",\"arguments\":{}}</tool_call>");
        r.tool_calls = vec![ToolCallRec {
            id: "call_native".into(),
            name: "web_search".into(),
            arguments: json!({"query": "x"}),
        }];
        let detected = detect_tool_calls(&r, false);
        assert_eq!(detected.calls.len(), 1);
        assert_eq!(detected.calls[0].id, "call_native");
    }

    #[test]
    fn tagged_call_is_parsed_and_stripped() {
        let r = reply(
            "Let me check.\n<tool_call>{\"name\":\"web_search\",\"arguments\":{\"query\":\"BTC price\"}}</tool_call>",
        );
        let detected = detect_tool_calls(&r, false);
        assert_eq!(detected.calls.len(), 1);
        assert_eq!(detected.calls[0].name, "web_search");
        assert_eq!(detected.calls[0].arguments["query"], json!("BTC price"));
        assert_eq!(detected.cleaned_text, "Let me check.");
        assert!(detected.calls[0].id.starts_with("call_"));
    }

    #[test]
    fn bare_json_requires_injected_tools() {
        let r = reply(r#"{"name":"web_search","arguments":{"query":"gold price"}}"#);
        let without = detect_tool_calls(&r, false);
        assert!(without.calls.is_empty());

        let with = detect_tool_calls(&r, true);
        assert_eq!(with.calls.len(), 1);
        assert!(with.cleaned_text.is_empty());
    }

    #[test]
    fn bare_json_needs_both_keys() {
        let r = reply(r#"{"name":"web_search"}"#);
        assert!(detect_tool_calls(&r, true).calls.is_empty());
        let r = reply(r#"{"name":"web_search","arguments":"not an object"}"#);
        assert!(detect_tool_calls(&r, true).calls.is_empty());
        // Plain JSON data that merely looks structured is not a call.
        let r = reply(r#"{"temperature": 21, "city": "Paris"}"#);
        assert!(detect_tool_calls(&r, true).calls.is_empty());
    }

    #[test]
    fn duplicate_calls_collapse() {
        let r = reply(
            "<tool_call>{\"name\":\"web_search\",\"arguments\":{\"query\":\"x\"}}</tool_call>\
             <tool_call>{\"name\":\"web_search\",\"arguments\":{\"query\":\"x\"}}</tool_call>",
        );
        let detected = detect_tool_calls(&r, false);
        assert_eq!(detected.calls.len(), 1);
    }

    #[test]
    fn unterminated_tag_left_alone() {
        let r = reply("text <tool_call>{\"name\":\"web_search\"");
        let detected = detect_tool_calls(&r, false);
        assert!(detected.calls.is_empty());
        assert!(detected.cleaned_text.contains("<tool_call>"));
    }

    #[test]
    fn matching_brace_handles_nested_strings() {
        let text = r#"prefix {"a": "va{lue", "b": {"c": 1}} suffix"#;
        let start = text.find('{').unwrap();
        let end = find_matching_brace(text, start).unwrap();
        assert_eq!(&text[start..=end], r#"{"a": "va{lue", "b": {"c": 1}}"#);
        let value = extract_first_json(text).unwrap();
        assert_eq!(value["b"]["c"], json!(1));
    }

    #[test]
    fn refusal_phrases_match() {
        assert!(looks_like_refusal(
            "I don't have real-time access to weather data. I recommend checking a weather site."
        ));
        assert!(looks_like_refusal("As of my last update, BTC traded around $40k."));
        assert!(!looks_like_refusal("The weather in Paris is sunny."));
    }

    #[test]
    fn salvage_topic_trims_punctuation() {
        assert_eq!(
            salvage_topic("What's the weather in Paris today?").as_deref(),
            Some("What's the weather in Paris today")
        );
        assert!(salvage_topic("??").is_none());
    }
}
