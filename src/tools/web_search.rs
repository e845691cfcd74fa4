// Built-in web_search handler. The query is matched against an intent table
// and routed to a free upstream per intent; intents with no free upstream get
// a static guidance message. Results are formatted as labeled text with an
// observation timestamp, never raw JSON.

use anyhow::{anyhow, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum SearchIntent {
    Weather { location: String },
    Crypto { coins: Vec<String> },
    Metals { metal: String },
    ServiceStatus { domain: String },
    Oil,
    NaturalGas,
    General,
}

static LOCATION_IN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:in|for|at)\s+([A-Za-zÀ-ÿ][A-Za-zÀ-ÿ .'-]{1,40}?)(?:\s+(?:today|tomorrow|tonight|now|this week|right now))?\s*$").expect("location pattern"));

static WEATHER_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(weather|forecast|temperature|umbrella|raining|rain|snowing|snow|sunny|humidity|windy)\b")
        .expect("weather words")
});

static STATUS_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bis\s+([a-z0-9.-]+\.[a-z]{2,})\s+(down|up|offline|working)\b").expect("status words")
});

static KNOWN_COINS: &[(&str, &str)] = &[
    ("btc", "bitcoin"),
    ("bitcoin", "bitcoin"),
    ("eth", "ethereum"),
    ("ethereum", "ethereum"),
    ("sol", "solana"),
    ("solana", "solana"),
    ("doge", "dogecoin"),
    ("dogecoin", "dogecoin"),
    ("xrp", "ripple"),
    ("ada", "cardano"),
    ("cardano", "cardano"),
];

pub fn parse_intent(query: &str) -> SearchIntent {
    let lower = query.to_lowercase();

    if let Some(caps) = STATUS_WORDS.captures(query) {
        return SearchIntent::ServiceStatus {
            domain: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        };
    }

    if WEATHER_WORDS.is_match(query) {
        let location = LOCATION_IN
            .captures(query)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        return SearchIntent::Weather { location };
    }

    let mut coins: Vec<String> = Vec::new();
    for (token, id) in KNOWN_COINS {
        let pattern = format!(r"\b{}\b", token);
        if Regex::new(&pattern).map(|r| r.is_match(&lower)).unwrap_or(false)
            && !coins.iter().any(|c| c == id)
        {
            coins.push(id.to_string());
        }
    }
    if !coins.is_empty() {
        return SearchIntent::Crypto { coins };
    }

    if lower.contains("gold") {
        return SearchIntent::Metals { metal: "gold".into() };
    }
    if lower.contains("silver") {
        return SearchIntent::Metals { metal: "silver".into() };
    }
    if lower.contains("natural gas") {
        return SearchIntent::NaturalGas;
    }
    if lower.contains("oil") || lower.contains("crude") {
        return SearchIntent::Oil;
    }

    SearchIntent::General
}

fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build()?)
}

async fn fetch_weather(location: &str) -> Result<String> {
    let place = if location.is_empty() { "" } else { location };
    let url = format!("https://wttr.in/{}?format=j1", urlencode(place));
    let response = client()?.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("wttr.in returned {}", response.status()));
    }
    let data: Value = response.json().await?;

    let current = data
        .get("current_condition")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .ok_or_else(|| anyhow!("wttr.in response missing current_condition"))?;

    let pick = |key: &str| -> String {
        current
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    let description = current
        .get("weatherDesc")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or("?");
    let area = data
        .get("nearest_area")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|v| v.get("areaName"))
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .unwrap_or(place);

    Ok(format!(
        "Current weather for {}:\n\
         - Conditions: {}\n\
         - Temperature: {}°C (feels like {}°C)\n\
         - Humidity: {}%\n\
         - Wind: {} km/h\n\
         - Precipitation: {} mm\n\
         - Observation time: {} UTC",
        area,
        description,
        pick("temp_C"),
        pick("FeelsLikeC"),
        pick("humidity"),
        pick("windspeedKmph"),
        pick("precipMM"),
        pick("observation_time"),
    ))
}

async fn fetch_crypto(coins: &[String]) -> Result<String> {
    let ids = coins.join(",");
    let url = format!(
        "https://api.coingecko.com/api/v3/simple/price?ids={}&vs_currencies=usd&include_24hr_change=true",
        ids
    );
    let response = client()?.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("CoinGecko returned {}", response.status()));
    }
    let data: Value = response.json().await?;

    let mut lines = vec!["Current cryptocurrency prices:".to_string()];
    for coin in coins {
        let Some(entry) = data.get(coin) else { continue };
        let price = entry.get("usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let change = entry
            .get("usd_24h_change")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        lines.push(format!("- {}: ${:.2} ({:+.2}% 24h)", coin, price, change));
    }
    if lines.len() == 1 {
        return Err(anyhow!("CoinGecko returned no prices for {}", ids));
    }
    lines.push(format!("- Timestamp: {}", Utc::now().to_rfc3339()));
    Ok(lines.join("\n"))
}

async fn fetch_metals(metal: &str) -> Result<String> {
    let response = client()?.get("https://api.metals.live/v1/spot").send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("metals.live returned {}", response.status()));
    }
    let data: Value = response.json().await?;
    let entries = data
        .as_array()
        .ok_or_else(|| anyhow!("metals.live response not an array"))?;

    for entry in entries {
        if let Some(price) = entry.get(metal).and_then(|v| v.as_f64()) {
            return Ok(format!(
                "Current spot price:\n- {}: ${:.2} per troy ounce\n- Timestamp: {}",
                metal,
                price,
                Utc::now().to_rfc3339()
            ));
        }
    }
    Err(anyhow!("metals.live has no entry for {}", metal))
}

async fn fetch_service_status(domain: &str) -> Result<String> {
    let url = format!(
        "https://www.isitdownrightnow.com/check.php?domain={}",
        urlencode(domain)
    );
    let response = client()?.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("isitdownrightnow returned {}", response.status()));
    }
    let html = response.text().await?;

    // The check endpoint returns a small HTML fragment with an up/down verdict.
    let lower = html.to_lowercase();
    let state = if lower.contains("is up") {
        "up and reachable"
    } else if lower.contains("is down") {
        "down"
    } else {
        "in an unknown state"
    };
    Ok(format!(
        "Service status:\n- Domain: {}\n- Status: {}\n- Checked at: {}",
        domain,
        state,
        Utc::now().to_rfc3339()
    ))
}

fn guidance(topic: &str, sources: &str) -> String {
    format!(
        "No free live data source is wired up for {}. Suggest that the user check {}. \
         Do not invent a number.",
        topic, sources
    )
}

/// Execute a web search query. Errors become error strings at the registry
/// layer, so this returns the formatted result or a hard failure.
pub async fn run(query: &str) -> Result<String> {
    let intent = parse_intent(query);
    tracing::debug!("web_search intent for {:?}: {:?}", query, intent);
    match intent {
        SearchIntent::Weather { location } => fetch_weather(&location).await,
        SearchIntent::Crypto { coins } => fetch_crypto(&coins).await,
        SearchIntent::Metals { metal } => fetch_metals(&metal).await,
        SearchIntent::ServiceStatus { domain } => fetch_service_status(&domain).await,
        SearchIntent::Oil => Ok(guidance("oil prices", "a financial data provider such as Bloomberg or MarketWatch")),
        SearchIntent::NaturalGas => Ok(guidance(
            "natural gas prices",
            "a financial data provider such as Bloomberg or MarketWatch",
        )),
        SearchIntent::General => Ok(guidance("general web search", "a search engine directly")),
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weather_intent_extracts_location() {
        let intent = parse_intent("do I need an umbrella in Paris today");
        assert_eq!(intent, SearchIntent::Weather { location: "Paris".into() });
        let intent = parse_intent("weather forecast for New York tomorrow");
        assert_eq!(intent, SearchIntent::Weather { location: "New York".into() });
    }

    #[test]
    fn weather_without_location_still_weather() {
        let intent = parse_intent("is it raining");
        assert!(matches!(intent, SearchIntent::Weather { .. }));
    }

    #[test]
    fn crypto_intent_maps_tickers() {
        let intent = parse_intent("BTC price");
        assert_eq!(intent, SearchIntent::Crypto { coins: vec!["bitcoin".into()] });
        let intent = parse_intent("price of eth and solana");
        assert_eq!(
            intent,
            SearchIntent::Crypto { coins: vec!["ethereum".into(), "solana".into()] }
        );
    }

    #[test]
    fn metals_and_fuels_route_by_keyword() {
        assert_eq!(parse_intent("gold price per ounce"), SearchIntent::Metals { metal: "gold".into() });
        assert_eq!(parse_intent("silver spot"), SearchIntent::Metals { metal: "silver".into() });
        assert_eq!(parse_intent("crude oil barrel cost"), SearchIntent::Oil);
        assert_eq!(parse_intent("natural gas futures"), SearchIntent::NaturalGas);
    }

    #[test]
    fn service_status_needs_domain_shape() {
        let intent = parse_intent("is github.com down");
        assert_eq!(intent, SearchIntent::ServiceStatus { domain: "github.com".into() });
        // A bare word is not a domain; falls to general.
        assert_eq!(parse_intent("is everything down"), SearchIntent::General);
    }

    #[test]
    fn unknown_queries_fall_back_to_general() {
        assert_eq!(parse_intent("latest research on fusion"), SearchIntent::General);
    }

    #[test]
    fn guidance_never_fabricates() {
        let text = guidance("oil prices", "somewhere");
        assert!(text.contains("Do not invent a number"));
    }

    #[test]
    fn urlencode_escapes_spaces_and_unicode() {
        assert_eq!(urlencode("New York"), "New%20York");
        assert_eq!(urlencode("Zürich"), "Z%C3%BCrich");
    }
}
