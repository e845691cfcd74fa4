// Backend selection. Scores every configured backend against the verdict,
// then applies the ordered adjustments: multi-model expansion, context-window
// forcing, user preference, and finally the tools override. The live default
// backend and the smart-routing flag are the control plane's two mutable
// slots and live here behind short-held locks.

pub mod history;

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::classifier::{Category, Complexity, Verdict};
use crate::config::BackendDesc;

/// Context length above which the window check kicks in.
const LARGE_CONTEXT_TOKENS: u64 = 30_000;

static DEFAULT_BACKEND: Lazy<RwLock<String>> = Lazy::new(|| RwLock::new(String::new()));
static SMART_ROUTING: AtomicBool = AtomicBool::new(true);

/// Serializes tests that touch the process-global control-plane slots.
#[cfg(test)]
pub static CONTROL_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Seed the mutable slots from config at startup.
pub fn init() {
    *DEFAULT_BACKEND.write() = crate::config::configured_default();
    let enabled = crate::config::get_config()
        .map(|c| c.router.enabled)
        .unwrap_or(true);
    SMART_ROUTING.store(enabled, Ordering::SeqCst);
    history::load();
}

pub fn default_backend() -> String {
    let current = DEFAULT_BACKEND.read().clone();
    if current.is_empty() {
        crate::config::configured_default()
    } else {
        current
    }
}

pub fn set_default_backend(name: &str) -> anyhow::Result<()> {
    if crate::config::get_backend(name).is_none() {
        anyhow::bail!("Unknown backend '{}'", name);
    }
    *DEFAULT_BACKEND.write() = name.to_string();
    tracing::info!("Default backend switched to {}", name);
    Ok(())
}

pub fn smart_routing_enabled() -> bool {
    SMART_ROUTING.load(Ordering::SeqCst)
}

pub fn set_smart_routing(enabled: bool) {
    SMART_ROUTING.store(enabled, Ordering::SeqCst);
    tracing::info!("Smart routing {}", if enabled { "enabled" } else { "disabled" });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub backend: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub primary: String,
    pub all_backends: Vec<String>,
    pub reason: String,
    pub confidence: f32,
    pub candidates: Vec<Candidate>,
    pub tools_routed: bool,
    pub multi_model: bool,
}

impl RouteDecision {
    fn single(primary: String, reason: &str, confidence: f32) -> RouteDecision {
        RouteDecision {
            all_backends: vec![primary.clone()],
            primary,
            reason: reason.to_string(),
            confidence,
            candidates: Vec::new(),
            tools_routed: false,
            multi_model: false,
        }
    }
}

fn score_backend(backend: &BackendDesc, verdict: &Verdict, suggested: &[String]) -> f32 {
    let mut score = 0.0f32;
    if backend.has_specialty(verdict.category.as_str()) {
        score += 0.5;
    }
    if complexity_matches(backend, verdict.complexity) {
        score += 0.2;
    }
    for keyword in &verdict.keywords {
        if backend.has_specialty(keyword) {
            score += 0.1;
        }
    }
    if suggested.iter().any(|s| s == &backend.name) {
        score += 0.3 * verdict.confidence;
    }
    score.min(1.0)
}

fn complexity_matches(backend: &BackendDesc, complexity: Complexity) -> bool {
    match complexity {
        Complexity::Simple | Complexity::Moderate => backend.speed == "fast",
        Complexity::Complex => backend.has_specialty("complex"),
        Complexity::Expert => backend.has_specialty("complex") || backend.premium,
    }
}

/// Compute a routing decision. Records it in the history; never fails — an
/// unroutable name surfaces later as a dispatch error, per the error design.
pub fn route(
    verdict: Option<&Verdict>,
    context_tokens: u64,
    user_id: Option<&str>,
    has_client_tools: bool,
) -> RouteDecision {
    let decision = compute_route(verdict, context_tokens, user_id, has_client_tools);
    history::record_decision(history::DecisionRecord {
        timestamp: chrono::Utc::now(),
        category: verdict.map(|v| v.category.as_str().to_string()),
        primary: decision.primary.clone(),
        reason: decision.reason.clone(),
        confidence: decision.confidence,
        multi_model: decision.multi_model,
    });
    decision
}

fn compute_route(
    verdict: Option<&Verdict>,
    context_tokens: u64,
    user_id: Option<&str>,
    has_client_tools: bool,
) -> RouteDecision {
    let Some(config) = crate::config::get_config() else {
        return RouteDecision::single(default_backend(), "config unavailable", 0.0);
    };

    let Some(verdict) = verdict else {
        let mut decision =
            RouteDecision::single(default_backend(), "no classification", 0.0);
        decision = apply_tools_override(decision, has_client_tools);
        if !decision.all_backends.contains(&decision.primary) {
            decision.all_backends.insert(0, decision.primary.clone());
        }
        return decision;
    };

    // Keep only suggestions that name a configured backend.
    let mut suggested: Vec<String> = Vec::new();
    for name in &verdict.suggested_backends {
        if config.backends.iter().any(|b| &b.name == name) {
            suggested.push(name.clone());
        } else {
            tracing::debug!("Dropping unknown suggested backend '{}'", name);
        }
    }
    if suggested.is_empty() {
        suggested.push(default_backend());
    }

    let mut scored: Vec<Candidate> = config
        .backends
        .iter()
        .map(|b| Candidate {
            backend: b.name.clone(),
            score: score_backend(b, verdict, &suggested),
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let candidates: Vec<Candidate> = scored.iter().take(4).cloned().collect();

    // Best-scoring backend among the suggestions wins by default.
    let primary = scored
        .iter()
        .find(|c| suggested.contains(&c.backend))
        .map(|c| c.backend.clone())
        .unwrap_or_else(default_backend);

    let mut decision = RouteDecision {
        primary,
        all_backends: Vec::new(),
        reason: format!("category {} via {:?}", verdict.category.as_str(), verdict.source),
        confidence: verdict.confidence,
        candidates,
        tools_routed: false,
        multi_model: false,
    };

    // Multi-model expansion before capacity and preference adjustments.
    if verdict.category == Category::Multi
        || (verdict.complexity == Complexity::Expert && verdict.confidence < 0.8)
    {
        decision.multi_model = true;
        let mut fan_out: Vec<String> = scored
            .iter()
            .filter(|c| suggested.contains(&c.backend))
            .take(3)
            .map(|c| c.backend.clone())
            .collect();
        if fan_out.is_empty() {
            fan_out.push(decision.primary.clone());
        }
        decision.all_backends = fan_out;
        decision.reason = format!("{}, fan-out", decision.reason);
    }

    // Context-window forcing trumps taste: an overflowing request must land
    // on a backend that can hold it.
    if context_tokens > LARGE_CONTEXT_TOKENS {
        let fits = crate::config::get_backend(&decision.primary)
            .map(|b| b.context_window >= context_tokens)
            .unwrap_or(false);
        if !fits {
            if let Some(big) = config
                .backends
                .iter()
                .find(|b| b.context_window >= context_tokens)
            {
                decision.reason =
                    format!("{}, context {} forced {}", decision.reason, context_tokens, big.name);
                decision.primary = big.name.clone();
            } else {
                tracing::warn!(
                    "No backend window fits {} tokens, keeping {}",
                    context_tokens,
                    decision.primary
                );
            }
        }
    }

    // Historical per-category preference, only within the suggestion set and
    // only when the preferred backend can actually hold the context.
    if let Some(user_id) = user_id {
        if let Some(preferred) = history::preferred_model(user_id, verdict.category.as_str()) {
            let fits = context_tokens <= LARGE_CONTEXT_TOKENS
                || crate::config::get_backend(&preferred)
                    .map(|b| b.context_window >= context_tokens)
                    .unwrap_or(false);
            if suggested.contains(&preferred) && fits {
                decision.reason = format!("{}, user preference", decision.reason);
                decision.primary = preferred;
            }
        }
    }

    decision = apply_tools_override(decision, has_client_tools);

    if !decision.all_backends.contains(&decision.primary) {
        decision.all_backends.insert(0, decision.primary.clone());
    }
    decision
}

/// Smaller models do not reliably honor foreign tool schemas, so requests
/// that bring their own tools land on the premium backend.
fn apply_tools_override(mut decision: RouteDecision, has_client_tools: bool) -> RouteDecision {
    if !has_client_tools {
        return decision;
    }
    let Some(premium) = crate::config::premium_backend() else {
        return decision;
    };
    if decision.primary != premium.name {
        decision.reason = format!("{}, tools -> {}", decision.reason, premium.name);
        decision.primary = premium.name;
        decision.tools_routed = true;
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::VerdictSource;

    fn setup() {
        crate::config::init_for_tests(crate::config::test_config());
        init();
    }

    fn verdict(category: Category, confidence: f32, complexity: Complexity) -> Verdict {
        Verdict {
            category,
            confidence,
            complexity,
            keywords: Vec::new(),
            suggested_backends: Vec::new(),
            reasoning: String::new(),
            source: VerdictSource::QuickRegex,
            retry_with_search: false,
        }
    }

    #[test]
    fn null_verdict_routes_to_default() {
        let _control = crate::router::CONTROL_TEST_LOCK.lock();
        setup();
        let decision = compute_route(None, 0, None, false);
        assert_eq!(decision.primary, "general");
        assert_eq!(decision.reason, "no classification");
        assert!(decision.all_backends.contains(&decision.primary));
    }

    #[test]
    fn conversation_lands_on_specialty_backend() {
        setup();
        let mut v = verdict(Category::Conversation, 0.99, Complexity::Simple);
        v.suggested_backends = vec!["general".into()];
        let decision = compute_route(Some(&v), 0, None, false);
        assert_eq!(decision.primary, "general");
        assert!(!decision.multi_model);
        assert!(decision.candidates.len() <= 4);
    }

    #[test]
    fn unknown_suggestions_fall_back_to_default() {
        let _control = crate::router::CONTROL_TEST_LOCK.lock();
        setup();
        let mut v = verdict(Category::Conversation, 0.9, Complexity::Simple);
        v.suggested_backends = vec!["ghost-backend".into()];
        let decision = compute_route(Some(&v), 0, None, false);
        assert_eq!(decision.primary, "general");
    }

    #[test]
    fn multi_category_fans_out_to_top_three() {
        setup();
        let mut v = verdict(Category::Multi, 0.9, Complexity::Complex);
        v.suggested_backends =
            vec!["general".into(), "coder".into(), "scout".into(), "archivist".into()];
        let decision = compute_route(Some(&v), 0, None, false);
        assert!(decision.multi_model);
        assert!(decision.all_backends.len() <= 4);
        assert!(decision.all_backends.contains(&decision.primary));
    }

    #[test]
    fn uncertain_expert_triggers_fan_out() {
        setup();
        let mut v = verdict(Category::Complex, 0.6, Complexity::Expert);
        v.suggested_backends = vec!["premium".into(), "archivist".into()];
        let decision = compute_route(Some(&v), 0, None, false);
        assert!(decision.multi_model);
    }

    #[test]
    fn large_context_forces_bigger_window() {
        setup();
        let mut v = verdict(Category::Realtime, 0.95, Complexity::Simple);
        // scout has an 8k window.
        v.suggested_backends = vec!["scout".into()];
        let decision = compute_route(Some(&v), 40_000, None, false);
        let window = crate::config::get_backend(&decision.primary)
            .unwrap()
            .context_window;
        assert!(window >= 40_000, "got {} ({})", decision.primary, window);
    }

    #[test]
    fn small_context_keeps_choice() {
        setup();
        let mut v = verdict(Category::Realtime, 0.95, Complexity::Simple);
        v.suggested_backends = vec!["scout".into()];
        let decision = compute_route(Some(&v), 500, None, false);
        assert_eq!(decision.primary, "scout");
    }

    #[test]
    fn user_preference_applies_within_suggestions() {
        setup();
        let mut prefs = history::UserPreferences::default();
        prefs
            .preferred_models
            .insert("research".into(), "archivist".into());
        history::set_preferences("router-test-user", prefs);

        let mut v = verdict(Category::Research, 0.9, Complexity::Complex);
        v.suggested_backends = vec!["scout".into(), "archivist".into()];
        let decision = compute_route(Some(&v), 0, Some("router-test-user"), false);
        assert_eq!(decision.primary, "archivist");
        assert!(decision.reason.contains("user preference"));
    }

    #[test]
    fn client_tools_force_premium() {
        setup();
        let mut v = verdict(Category::Conversation, 0.99, Complexity::Simple);
        v.suggested_backends = vec!["general".into()];
        let decision = compute_route(Some(&v), 0, None, true);
        assert_eq!(decision.primary, "premium");
        assert!(decision.tools_routed);
        assert!(decision.all_backends.contains(&"premium".to_string()));
    }

    #[test]
    fn preference_loses_to_tools_override() {
        setup();
        let mut prefs = history::UserPreferences::default();
        prefs
            .preferred_models
            .insert("conversation".into(), "general".into());
        history::set_preferences("router-test-user-2", prefs);

        let mut v = verdict(Category::Conversation, 0.99, Complexity::Simple);
        v.suggested_backends = vec!["general".into()];
        let decision = compute_route(Some(&v), 0, Some("router-test-user-2"), true);
        assert_eq!(decision.primary, "premium");
    }

    #[test]
    fn window_forcing_beats_preference() {
        setup();
        let mut prefs = history::UserPreferences::default();
        prefs
            .preferred_models
            .insert("realtime".into(), "scout".into());
        history::set_preferences("router-test-user-3", prefs);

        let mut v = verdict(Category::Realtime, 0.95, Complexity::Simple);
        v.suggested_backends = vec!["scout".into()];
        let decision = compute_route(Some(&v), 40_000, Some("router-test-user-3"), false);
        // Preference would pick scout, but scout cannot hold the context...
        // unless the preference reinstates it; the documented order applies
        // preference after forcing only when it still fits.
        assert_ne!(decision.primary, "scout");
    }

    #[test]
    fn default_switch_is_visible_immediately() {
        let _control = crate::router::CONTROL_TEST_LOCK.lock();
        setup();
        set_default_backend("coder").unwrap();
        let decision = compute_route(None, 0, None, false);
        assert_eq!(decision.primary, "coder");
        set_default_backend("general").unwrap();
        assert!(set_default_backend("missing").is_err());
    }

    #[test]
    fn scores_cap_at_one() {
        setup();
        let backend = crate::config::get_backend("premium").unwrap();
        let mut v = verdict(Category::Complex, 1.0, Complexity::Expert);
        v.keywords = vec!["complex".into(), "code".into(), "research".into()];
        v.suggested_backends = vec!["premium".into()];
        let score = score_backend(&backend, &v, &v.suggested_backends.clone());
        assert!(score <= 1.0);
    }
}
