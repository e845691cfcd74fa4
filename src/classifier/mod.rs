// Three-tier request classification. Tiers run in order and the first one
// confident enough (>= 0.9) wins; anything that fails is downgraded, never
// fatal. A null result means "defer to the default backend".

pub mod rules;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{ChatRequest, Role};

pub const CONFIDENCE_GATE: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Greetings,
    Conversation,
    Code,
    Research,
    Complex,
    Realtime,
    Multi,
    Unclassified,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Greetings => "greetings",
            Category::Conversation => "conversation",
            Category::Code => "code",
            Category::Research => "research",
            Category::Complex => "complex",
            Category::Realtime => "realtime",
            Category::Multi => "multi",
            Category::Unclassified => "unclassified",
        }
    }

    pub fn parse(value: &str) -> Option<Category> {
        match value.trim().to_lowercase().as_str() {
            "greetings" | "greeting" => Some(Category::Greetings),
            "conversation" | "chat" => Some(Category::Conversation),
            "code" | "coding" => Some(Category::Code),
            "research" => Some(Category::Research),
            "complex" => Some(Category::Complex),
            "realtime" | "real-time" | "current" => Some(Category::Realtime),
            "multi" => Some(Category::Multi),
            "unclassified" => Some(Category::Unclassified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
            Complexity::Expert => "expert",
        }
    }

    pub fn parse(value: &str) -> Option<Complexity> {
        match value.trim().to_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "moderate" | "medium" => Some(Complexity::Moderate),
            "complex" | "hard" => Some(Complexity::Complex),
            "expert" => Some(Complexity::Expert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictSource {
    QuickRegex,
    FastModel,
    Llm,
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub category: Category,
    pub confidence: f32,
    pub complexity: Complexity,
    pub keywords: Vec<String>,
    pub suggested_backends: Vec<String>,
    pub reasoning: String,
    pub source: VerdictSource,
    #[serde(default)]
    pub retry_with_search: bool,
}

/// Classify the latest user turn. Network tiers are skipped or downgraded on
/// failure; the pipeline never aborts on a classification error.
pub async fn classify(request: &ChatRequest, user_id: Option<&str>) -> Option<Verdict> {
    let text = request.last_user_text();
    let mut best: Option<Verdict> = None;

    if let Some(mut verdict) = rules::quick_classify(&text) {
        fill_suggestions(&mut verdict);
        if verdict.confidence >= CONFIDENCE_GATE {
            return Some(apply_preferences(verdict, user_id));
        }
        best = Some(verdict);
    }

    // Realtime probe: one cheap yes/no call. Pointless when the client
    // brought its own tools, and redundant when the rules already said so.
    let regex_said_realtime = best
        .as_ref()
        .map(|v| v.category == Category::Realtime)
        .unwrap_or(false);
    if !request.has_client_tools() && !regex_said_realtime {
        match probe_realtime(&text).await {
            Ok(true) => {
                let mut verdict = Verdict {
                    category: Category::Realtime,
                    confidence: 0.9,
                    complexity: Complexity::Simple,
                    keywords: Vec::new(),
                    suggested_backends: Vec::new(),
                    reasoning: "fast-model says current information is required".to_string(),
                    source: VerdictSource::FastModel,
                    retry_with_search: false,
                };
                fill_suggestions(&mut verdict);
                return Some(apply_preferences(verdict, user_id));
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("Realtime probe failed: {}", e),
        }
    }

    match llm_classify(&text).await {
        Ok(Some(mut verdict)) => {
            if verdict.suggested_backends.is_empty() {
                fill_suggestions(&mut verdict);
            }
            return Some(apply_preferences(verdict, user_id));
        }
        Ok(None) => {}
        Err(e) => tracing::debug!("LLM classification failed: {}", e),
    }

    best.map(|v| apply_preferences(v, user_id))
}

/// Suggested backends from declared specialties matching the category.
fn fill_suggestions(verdict: &mut Verdict) {
    let Some(config) = crate::config::get_config() else { return };
    let tag = verdict.category.as_str();
    verdict.suggested_backends = config
        .backends
        .iter()
        .filter(|b| b.has_specialty(tag))
        .map(|b| b.name.clone())
        .collect();
}

fn apply_preferences(mut verdict: Verdict, user_id: Option<&str>) -> Verdict {
    let Some(user_id) = user_id else { return verdict };
    let Some(prefs) = crate::router::history::preferences_for(user_id) else {
        return verdict;
    };

    if let Some(backend) = prefs.category_overrides.get(verdict.category.as_str()) {
        verdict.suggested_backends = vec![backend.clone()];
        verdict.source = VerdictSource::Override;
    }

    if prefs.quality_preference == crate::router::history::QualityPreference::High
        && verdict.complexity != Complexity::Simple
    {
        if let Some(premium) = crate::config::premium_backend() {
            if !verdict.suggested_backends.contains(&premium.name) {
                verdict.suggested_backends.push(premium.name);
            }
        }
    }

    verdict
}

async fn probe_realtime(text: &str) -> anyhow::Result<bool> {
    let backend = crate::config::smallest_backend()
        .ok_or_else(|| anyhow::anyhow!("No backend for realtime probe"))?;

    let mut request = ChatRequest::default();
    request.turns.push(crate::envelope::Turn::text(
        Role::System,
        "Answer with a single word: YES or NO.",
    ));
    request.turns.push(crate::envelope::Turn::text(
        Role::User,
        format!(
            "Does answering this require current, real-time information such as live weather, \
             news, prices, or service status? Query: {}",
            text.chars().take(500).collect::<String>()
        ),
    ));
    request.max_tokens = Some(8);
    request.temperature = Some(0.0);

    let reply = crate::dispatch::dispatch_simple(&backend, &request).await?;
    Ok(reply.text.trim().to_uppercase().starts_with("YES"))
}

async fn llm_classify(text: &str) -> anyhow::Result<Option<Verdict>> {
    let config =
        crate::config::get_config().ok_or_else(|| anyhow::anyhow!("Config not loaded"))?;
    if config.router.classifier_backend.is_empty() {
        return Ok(None);
    }
    let backend = crate::config::get_backend(&config.router.classifier_backend)
        .ok_or_else(|| anyhow::anyhow!("Classifier backend not configured"))?;

    let mut catalog = String::new();
    for b in &config.backends {
        catalog.push_str(&format!("- {}: {}\n", b.name, b.specialties.join(", ")));
    }

    let mut request = ChatRequest::default();
    request.turns.push(crate::envelope::Turn::text(
        Role::System,
        "You classify chat requests for a model gateway. Respond with JSON only.",
    ));
    request.turns.push(crate::envelope::Turn::text(
        Role::User,
        format!(
            "Classify this request into one category of: greetings, conversation, code, \
             research, complex, realtime, multi.\n\nAvailable backends:\n{}\n\
             Request: {}\n\n\
             Reply with JSON: {{\"category\": ..., \"confidence\": 0.0-1.0, \
             \"complexity\": \"simple|moderate|complex|expert\", \"keywords\": [...], \
             \"suggested_backends\": [...], \"reasoning\": \"...\"}}",
            catalog,
            text.chars().take(2000).collect::<String>()
        ),
    ));
    request.temperature = Some(0.1);
    request.max_tokens = Some(300);

    let reply = crate::dispatch::dispatch_simple(&backend, &request).await?;
    Ok(parse_llm_verdict(&reply.text))
}

/// Extract and validate the first JSON object in a classification reply.
/// A malformed reply is a null verdict, not an error.
pub fn parse_llm_verdict(text: &str) -> Option<Verdict> {
    let value = crate::tools::detect::extract_first_json(text)?;
    let category = value
        .get("category")
        .and_then(|v| v.as_str())
        .and_then(Category::parse)?;
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|v| (v as f32).clamp(0.0, 1.0))
        .unwrap_or(0.5);
    let complexity = value
        .get("complexity")
        .and_then(|v| v.as_str())
        .and_then(Complexity::parse)
        .unwrap_or(Complexity::Moderate);

    let string_list = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    };

    Some(Verdict {
        category,
        confidence,
        complexity,
        keywords: string_list("keywords"),
        suggested_backends: string_list("suggested_backends"),
        reasoning: value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        source: VerdictSource::Llm,
        retry_with_search: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_verdict_parses_json_in_prose() {
        let text = r#"Sure, here is the classification:
{"category": "code", "confidence": 0.87, "complexity": "complex",
 "keywords": ["rust", "lifetime"], "suggested_backends": ["coder"],
 "reasoning": "lifetime question"}
Hope that helps!"#;
        let verdict = parse_llm_verdict(text).unwrap();
        assert_eq!(verdict.category, Category::Code);
        assert!((verdict.confidence - 0.87).abs() < 1e-6);
        assert_eq!(verdict.complexity, Complexity::Complex);
        assert_eq!(verdict.suggested_backends, vec!["coder".to_string()]);
        assert_eq!(verdict.source, VerdictSource::Llm);
    }

    #[test]
    fn llm_verdict_rejects_garbage() {
        assert!(parse_llm_verdict("no json here").is_none());
        assert!(parse_llm_verdict("{\"category\": \"nonsense\"}").is_none());
    }

    #[test]
    fn llm_verdict_clamps_confidence() {
        let verdict =
            parse_llm_verdict(r#"{"category": "research", "confidence": 3.5}"#).unwrap();
        assert!(verdict.confidence <= 1.0);
    }

    #[test]
    fn categories_are_a_closed_set() {
        for raw in [
            "greetings",
            "conversation",
            "code",
            "research",
            "complex",
            "realtime",
            "multi",
            "unclassified",
        ] {
            let category = Category::parse(raw).unwrap();
            assert_eq!(category.as_str(), raw);
        }
    }

    #[tokio::test]
    async fn quick_tier_wins_without_network() {
        crate::config::init_for_tests(crate::config::test_config());
        let request = ChatRequest {
            turns: vec![crate::envelope::Turn::text(Role::User, "Hi!")],
            ..Default::default()
        };
        let verdict = classify(&request, None).await.unwrap();
        assert_eq!(verdict.category, Category::Greetings);
        assert_eq!(verdict.source, VerdictSource::QuickRegex);
        // Suggestions come from backend specialties.
        assert!(verdict.suggested_backends.contains(&"general".to_string()));
    }
}
