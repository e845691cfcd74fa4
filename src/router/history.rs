// Router history: recent decisions, per-user preferences, and per
// (backend, category) success counters. Persisted as a single JSON document
// on a decision-count cadence and at shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const MAX_DECISIONS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub category: Option<String>,
    pub primary: String,
    pub reason: String,
    pub confidence: f32,
    pub multi_model: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    Low,
    Normal,
    High,
}

impl Default for QualityPreference {
    fn default() -> Self {
        QualityPreference::Normal
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    /// category -> backend, hard override of the suggestion set.
    #[serde(default)]
    pub category_overrides: HashMap<String, String>,
    #[serde(default)]
    pub quality_preference: QualityPreference,
    /// category -> backend the user historically ends up on.
    #[serde(default)]
    pub preferred_models: HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RouterHistory {
    decisions: VecDeque<DecisionRecord>,
    users: HashMap<String, UserPreferences>,
    /// "backend/category" -> successful completions.
    success: HashMap<String, u64>,
}

static HISTORY: Lazy<Mutex<RouterHistory>> = Lazy::new(|| Mutex::new(RouterHistory::default()));
static UNSAVED_DECISIONS: AtomicUsize = AtomicUsize::new(0);

pub fn record_decision(record: DecisionRecord) {
    {
        let mut history = HISTORY.lock();
        if history.decisions.len() >= MAX_DECISIONS {
            history.decisions.pop_front();
        }
        history.decisions.push_back(record);
    }

    let persist_every = crate::config::get_config()
        .map(|c| c.router.persist_every)
        .unwrap_or(10)
        .max(1);
    let pending = UNSAVED_DECISIONS.fetch_add(1, Ordering::Relaxed) + 1;
    if pending >= persist_every {
        UNSAVED_DECISIONS.store(0, Ordering::Relaxed);
        persist_in_background();
    }
}

/// Persist without blocking the pipeline when a runtime is available.
fn persist_in_background() {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(|| {
                if let Err(e) = persist() {
                    tracing::warn!("Router history persist failed: {}", e);
                }
            });
        }
        Err(_) => {
            if let Err(e) = persist() {
                tracing::warn!("Router history persist failed: {}", e);
            }
        }
    }
}

pub fn record_success(backend: &str, category: Option<&str>) {
    let key = format!("{}/{}", backend, category.unwrap_or("unclassified"));
    let mut history = HISTORY.lock();
    *history.success.entry(key).or_insert(0) += 1;
}

pub fn success_count(backend: &str, category: &str) -> u64 {
    let key = format!("{}/{}", backend, category);
    HISTORY.lock().success.get(&key).copied().unwrap_or(0)
}

pub fn preferences_for(user_id: &str) -> Option<UserPreferences> {
    HISTORY.lock().users.get(user_id).cloned()
}

pub fn set_preferences(user_id: &str, preferences: UserPreferences) {
    HISTORY.lock().users.insert(user_id.to_string(), preferences);
    persist_in_background();
}

pub fn preferred_model(user_id: &str, category: &str) -> Option<String> {
    HISTORY
        .lock()
        .users
        .get(user_id)
        .and_then(|p| p.preferred_models.get(category))
        .cloned()
}

pub fn recent_decisions(limit: usize) -> Vec<DecisionRecord> {
    let history = HISTORY.lock();
    history.decisions.iter().rev().take(limit).cloned().collect()
}

pub fn clear() {
    let mut history = HISTORY.lock();
    history.decisions.clear();
    history.success.clear();
}

#[derive(Debug, Serialize)]
pub struct HistorySnapshot {
    pub decision_count: usize,
    pub user_count: usize,
    pub success: HashMap<String, u64>,
}

pub fn snapshot() -> HistorySnapshot {
    let history = HISTORY.lock();
    HistorySnapshot {
        decision_count: history.decisions.len(),
        user_count: history.users.len(),
        success: history.success.clone(),
    }
}

fn history_path() -> Option<std::path::PathBuf> {
    crate::config::get_config().map(|c| crate::config::resolve_path(&c.router.history_file))
}

pub fn load() {
    let Some(path) = history_path() else { return };
    if !path.exists() {
        return;
    }
    match std::fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<RouterHistory>(&content) {
            Ok(loaded) => {
                *HISTORY.lock() = loaded;
                tracing::info!("Router history loaded from {:?}", path);
            }
            Err(e) => tracing::warn!("Router history file unreadable: {}", e),
        },
        Err(e) => tracing::warn!("Router history read failed: {}", e),
    }
}

pub fn persist() -> anyhow::Result<()> {
    let Some(path) = history_path() else { return Ok(()) };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = {
        let history = HISTORY.lock();
        serde_json::to_string_pretty(&*history)?
    };
    std::fs::write(&path, content)?;
    tracing::debug!("Router history persisted to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(primary: &str) -> DecisionRecord {
        DecisionRecord {
            timestamp: Utc::now(),
            category: Some("code".into()),
            primary: primary.into(),
            reason: "test".into(),
            confidence: 0.9,
            multi_model: false,
        }
    }

    #[test]
    fn decisions_cap_at_limit() {
        {
            let mut history = HISTORY.lock();
            history.decisions.clear();
            for i in 0..(MAX_DECISIONS + 5) {
                if history.decisions.len() >= MAX_DECISIONS {
                    history.decisions.pop_front();
                }
                history.decisions.push_back(decision(&format!("b{}", i)));
            }
            assert_eq!(history.decisions.len(), MAX_DECISIONS);
            assert_eq!(history.decisions.front().unwrap().primary, "b5");
        }
    }

    #[test]
    fn success_counters_accumulate() {
        record_success("coder", Some("code"));
        record_success("coder", Some("code"));
        assert!(success_count("coder", "code") >= 2);
    }

    #[test]
    fn preferences_roundtrip() {
        let mut prefs = UserPreferences::default();
        prefs
            .category_overrides
            .insert("code".into(), "coder".into());
        prefs.quality_preference = QualityPreference::High;
        prefs
            .preferred_models
            .insert("research".into(), "archivist".into());

        HISTORY.lock().users.insert("u1".into(), prefs);

        let loaded = preferences_for("u1").unwrap();
        assert_eq!(loaded.category_overrides["code"], "coder");
        assert_eq!(loaded.quality_preference, QualityPreference::High);
        assert_eq!(preferred_model("u1", "research").as_deref(), Some("archivist"));
        assert!(preferred_model("u1", "code").is_none());
    }

    #[test]
    fn history_serializes_as_one_document() {
        let history = RouterHistory {
            decisions: VecDeque::from(vec![decision("x")]),
            users: HashMap::new(),
            success: HashMap::from([("x/code".into(), 3u64)]),
        };
        let encoded = serde_json::to_string(&history).unwrap();
        let decoded: RouterHistory = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.decisions.len(), 1);
        assert_eq!(decoded.success["x/code"], 3);
    }
}
