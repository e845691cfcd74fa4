// Quick-classification rule table. Each rule matches the latest user turn
// and yields a category with a fixed confidence; the first match wins. Kept
// as data so the table can grow without touching the tier logic.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Category, Complexity, Verdict, VerdictSource};

const SHORT_MESSAGE_LIMIT: usize = 30;

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(hi|hiya|hello|hey|yo|sup|howdy|good (morning|afternoon|evening)|how are you|what's up|thanks|thank you|bye|goodbye|see you)\b",
    )
    .expect("greeting pattern")
});

static RETRY_WITH_SEARCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(look it up|search (for it|the web|online)|google it|check (online|the internet)|that's (wrong|outdated|not right)|use the internet|can you search)",
    )
    .expect("retry pattern")
});

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```").expect("fence pattern"));

static CODE_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?ix)
        (\bfn\s+\w+|\bdef\s+\w+|\bclass\s+\w+|\bimport\s+\w+|\bfunction\s*\(|=>|;\s*$
        |\bSELECT\b.+\bFROM\b|println!|console\.log|\#include
        |\b(compile|refactor|debug|stack\s*trace|segfault|borrow checker|unit test)\b
        |\b(python|rust|javascript|typescript|golang|java|c\+\+|sql|bash)\b.*\b(code|script|function|error|bug|snippet|program)\b
        |\b(code|script|function|error|bug|snippet|program)\b.*\b(python|rust|javascript|typescript|golang|java|c\+\+|sql|bash)\b)
    "#,
    )
    .expect("code pattern")
});

static SERVICE_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bis\s+([a-z0-9.-]+)\s+(down|up|offline|working)\b|\b(outage|status of)\b",
    )
    .expect("status pattern")
});

static WEATHER_EXPLICIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(weather|forecast|temperature|humidity|windy|heatwave)\b")
        .expect("weather pattern")
});

static WEATHER_IMPLICIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(umbrella|raincoat|need a (jacket|coat)|is it (raining|snowing|sunny|cold|hot))\b|\braining in\b",
    )
    .expect("implicit weather pattern")
});

static CRYPTO_PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(bitcoin|btc|ethereum|eth|solana|sol|dogecoin|doge|crypto(currency)?)\b.*\b(price|worth|value|cost|trading|rate)\b|\b(price|value)\s+of\s+(bitcoin|btc|ethereum|eth|solana|dogecoin)\b",
    )
    .expect("crypto pattern")
});

static COMMODITY_PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(gold|silver|crude oil|oil|natural gas)\b.*\b(price|ounce|barrel|trading|worth|cost)\b",
    )
    .expect("commodity pattern")
});

static NEWS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(news|headlines?|current events|what('s| is) happening|what happened (today|this week)|latest on)\b",
    )
    .expect("news pattern")
});

static RESEARCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(research|in[- ]depth|detailed analysis|comprehensive|literature|thorough(ly)?|deep dive|pros and cons|compare .+ (and|with|to|vs\.?) )\b",
    )
    .expect("research pattern")
});

fn verdict(
    category: Category,
    confidence: f32,
    complexity: Complexity,
    keywords: Vec<&str>,
    reasoning: &str,
) -> Verdict {
    Verdict {
        category,
        confidence,
        complexity,
        keywords: keywords.into_iter().map(|s| s.to_string()).collect(),
        suggested_backends: Vec::new(),
        reasoning: reasoning.to_string(),
        source: VerdictSource::QuickRegex,
        retry_with_search: false,
    }
}

/// Rule-table tier. Returns `None` when no rule is confident about the text.
pub fn quick_classify(text: &str) -> Option<Verdict> {
    let trimmed = text.trim();

    if GREETING.is_match(trimmed) && trimmed.len() < 40 {
        return Some(verdict(
            Category::Greetings,
            0.99,
            Complexity::Simple,
            vec!["greeting"],
            "greeting or casual opener",
        ));
    }

    if RETRY_WITH_SEARCH.is_match(trimmed) {
        let mut v = verdict(
            Category::Realtime,
            0.95,
            Complexity::Simple,
            vec!["search"],
            "user asked to look it up",
        );
        v.retry_with_search = true;
        return Some(v);
    }

    if FENCED_CODE.is_match(trimmed) {
        return Some(verdict(
            Category::Code,
            0.97,
            Complexity::Moderate,
            vec!["code"],
            "fenced code block present",
        ));
    }

    if CODE_MARKERS.is_match(trimmed) {
        return Some(verdict(
            Category::Code,
            0.92,
            Complexity::Moderate,
            vec!["code"],
            "code markers or language keywords",
        ));
    }

    if let Some(caps) = SERVICE_STATUS.captures(trimmed) {
        let mut keywords = vec!["service-status".to_string()];
        if let Some(domain) = caps.get(1) {
            keywords.push(domain.as_str().to_string());
        }
        let mut v = verdict(
            Category::Realtime,
            0.93,
            Complexity::Simple,
            vec![],
            "service status query",
        );
        v.keywords = keywords;
        return Some(v);
    }

    if WEATHER_EXPLICIT.is_match(trimmed) {
        return Some(verdict(
            Category::Realtime,
            0.95,
            Complexity::Simple,
            vec!["weather"],
            "explicit weather query",
        ));
    }

    if WEATHER_IMPLICIT.is_match(trimmed) {
        return Some(verdict(
            Category::Realtime,
            0.95,
            Complexity::Simple,
            vec!["weather"],
            "implicit weather query",
        ));
    }

    if CRYPTO_PRICE.is_match(trimmed) {
        return Some(verdict(
            Category::Realtime,
            0.94,
            Complexity::Simple,
            vec!["crypto", "price"],
            "crypto price query",
        ));
    }

    if COMMODITY_PRICE.is_match(trimmed) {
        return Some(verdict(
            Category::Realtime,
            0.94,
            Complexity::Simple,
            vec!["commodity", "price"],
            "commodity price query",
        ));
    }

    if NEWS.is_match(trimmed) {
        return Some(verdict(
            Category::Realtime,
            0.90,
            Complexity::Simple,
            vec!["news"],
            "news or current events",
        ));
    }

    if RESEARCH.is_match(trimmed) {
        return Some(verdict(
            Category::Research,
            0.90,
            Complexity::Complex,
            vec!["research"],
            "research framing",
        ));
    }

    if trimmed.len() < SHORT_MESSAGE_LIMIT {
        return Some(verdict(
            Category::Conversation,
            0.85,
            Complexity::Simple,
            vec![],
            "short casual message",
        ));
    }

    None
}
