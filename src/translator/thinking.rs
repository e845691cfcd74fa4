// Stripping of model-emitted chain-of-thought from user-visible output.
//
// Some models put their reasoning in `reasoning_content` and leave `content`
// empty; others write it as a preamble before the actual answer. Both cases
// are recognized against data tables, and unknown models are passed through
// untouched. The streaming side is a small state machine: buffer deltas until
// a transition phrase appears (or the buffer overflows), emit everything
// after the transition as one delta, then switch to passthrough.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::envelope::ModelReply;

const THINKING_BUFFER_LIMIT: usize = 3000;

/// Where the visible answer starts relative to a transition match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transition {
    /// Answer begins after the matched phrase ("Let me provide ...").
    After,
    /// The match itself is the start of the answer (section header, list).
    At,
}

static TRANSITIONS: Lazy<Vec<(Regex, Transition)>> = Lazy::new(|| {
    let table: &[(&str, Transition)] = &[
        (r"(?i)let me provide[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?i)let me give you[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?i)here'?s my recommendation[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?i)here'?s (?:my|the) (?:answer|response|summary)[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?i)here is (?:my|the) (?:answer|recommendation|response)[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?i)to summarize[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?i)my final answer[^.!:\n]*[.!:]\s*", Transition::After),
        (r"(?m)^#{1,4} \S", Transition::At),
        (r"(?m)^\*\*[^*\n]+\*\*", Transition::At),
        (r"(?m)^1[.)] \S", Transition::At),
        (r"(?m)^- \S", Transition::At),
    ];
    table
        .iter()
        .map(|(pattern, kind)| (Regex::new(pattern).expect("transition pattern"), *kind))
        .collect()
});

/// Line prefixes that are self-narration rather than answer text.
static NARRATION_PREFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^the user is asking",
        r"(?i)^the user wants",
        r"(?i)^i should ",
        r"(?i)^i need to ",
        r"(?i)^i'll start by",
        r"(?i)^first,? i ",
        r"(?i)^let me think",
        r"(?i)^okay, so ",
        r"(?i)^thinking about ",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("narration pattern"))
    .collect()
});

static REASONING_MODEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(deepseek-r1|\br1\b|qwq|reason|think|-cot\b)").expect("reasoning model pattern")
});

pub fn is_reasoning_model(model: &str) -> bool {
    REASONING_MODEL.is_match(model)
}

/// Answer start for the transition that appears earliest in the text.
fn find_transition(text: &str) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (regex, kind) in TRANSITIONS.iter() {
        if let Some(m) = regex.find(text) {
            let answer_start = match kind {
                Transition::After => m.end(),
                Transition::At => m.start(),
            };
            if best.map(|(anchor, _)| m.start() < anchor).unwrap_or(true) {
                best = Some((m.start(), answer_start));
            }
        }
    }
    best.map(|(_, start)| start)
}

/// Drop lines that read as self-narration. Keeps everything once a
/// non-narration line has been seen, so answers are never gutted mid-way.
fn drop_narration_lines(text: &str) -> String {
    let mut kept = Vec::new();
    let mut answer_started = false;
    for line in text.lines() {
        let is_narration =
            !answer_started && NARRATION_PREFIXES.iter().any(|r| r.is_match(line.trim()));
        if is_narration {
            continue;
        }
        if !line.trim().is_empty() {
            answer_started = true;
        }
        kept.push(line);
    }
    kept.join("\n").trim_start().to_string()
}

/// Filter a complete reasoning blob down to the visible answer.
pub fn filter_reasoning(text: &str) -> String {
    if let Some(start) = find_transition(text) {
        let rest = text[start..].trim_start();
        if !rest.is_empty() {
            return rest.to_string();
        }
    }
    let fallback = drop_narration_lines(text);
    if fallback.is_empty() {
        text.trim().to_string()
    } else {
        fallback
    }
}

/// Buffered-mode entry point: rewrite a reply in place so its `text` holds
/// the visible answer.
pub fn resolve_reply(reply: &mut ModelReply) {
    if reply.text.is_empty() {
        if let Some(reasoning) = reply.reasoning.take() {
            reply.text = filter_reasoning(&reasoning);
        }
        return;
    }
    let model = reply.model.as_deref().unwrap_or("");
    if is_reasoning_model(model) {
        if let Some(start) = find_transition(&reply.text) {
            if start > 0 {
                reply.text = reply.text[start..].trim_start().to_string();
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateState {
    Buffering,
    Passthrough,
}

/// Streaming filter. Created only for models matching the reasoning
/// heuristic; other streams bypass it entirely.
pub struct ThinkingGate {
    state: GateState,
    buffer: String,
}

impl ThinkingGate {
    pub fn new() -> ThinkingGate {
        ThinkingGate { state: GateState::Buffering, buffer: String::new() }
    }

    /// Feed one delta; returns the text to forward downstream, if any.
    pub fn feed(&mut self, delta: &str) -> Option<String> {
        match self.state {
            GateState::Passthrough => Some(delta.to_string()),
            GateState::Buffering => {
                self.buffer.push_str(delta);
                if let Some(start) = find_transition(&self.buffer) {
                    let out = self.buffer[start..].trim_start().to_string();
                    self.buffer.clear();
                    self.state = GateState::Passthrough;
                    if out.is_empty() { None } else { Some(out) }
                } else if self.buffer.len() > THINKING_BUFFER_LIMIT {
                    let out = drop_narration_lines(&self.buffer);
                    let out = if out.is_empty() { self.buffer.clone() } else { out };
                    self.buffer.clear();
                    self.state = GateState::Passthrough;
                    Some(out)
                } else {
                    None
                }
            }
        }
    }

    /// Flush whatever is still buffered at end-of-stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let out = filter_reasoning(&self.buffer);
        self.buffer.clear();
        self.state = GateState::Passthrough;
        if out.is_empty() { None } else { Some(out) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_phrase_strips_preamble() {
        let text = "The user is asking about aquarium heaters. \
                    Let me provide a recommendation. For a 50-gallon tank, \
                    a 200W heater is appropriate.";
        let filtered = filter_reasoning(text);
        assert!(filtered.starts_with("For a 50-gallon tank"), "got: {}", filtered);
    }

    #[test]
    fn section_header_starts_answer() {
        let text = "I need to structure this well.\n## Heater sizing\nUse 3-5W per gallon.";
        let filtered = filter_reasoning(text);
        assert!(filtered.starts_with("## Heater sizing"), "got: {}", filtered);
    }

    #[test]
    fn narration_fallback_drops_leading_lines() {
        let text = "The user is asking about prices.\nI should check the context.\nGold closed at $2400.";
        let filtered = filter_reasoning(text);
        assert_eq!(filtered, "Gold closed at $2400.");
    }

    #[test]
    fn resolve_reply_uses_reasoning_when_content_empty() {
        let mut reply = ModelReply {
            text: String::new(),
            reasoning: Some(
                "The user is asking about tanks. Let me provide a recommendation. \
                 For a 50-gallon tank, pick a 200W heater."
                    .into(),
            ),
            ..Default::default()
        };
        resolve_reply(&mut reply);
        assert!(reply.text.starts_with("For a 50-gallon tank"));
        assert!(reply.reasoning.is_none());
    }

    #[test]
    fn unknown_model_with_content_is_untouched() {
        let mut reply = ModelReply {
            model: Some("llama3.1".into()),
            text: "Let me provide a quick overview. Rust is fast.".into(),
            ..Default::default()
        };
        resolve_reply(&mut reply);
        assert_eq!(reply.text, "Let me provide a quick overview. Rust is fast.");
    }

    #[test]
    fn reasoning_model_heuristic() {
        assert!(is_reasoning_model("deepseek-r1:7b"));
        assert!(is_reasoning_model("qwq-32b-preview"));
        assert!(!is_reasoning_model("llama3.1:8b"));
        assert!(!is_reasoning_model("gpt-4o"));
    }

    #[test]
    fn gate_holds_until_transition_then_passes_through() {
        let mut gate = ThinkingGate::new();
        assert_eq!(gate.feed("The user wants the weather. "), None);
        let out = gate.feed("Let me provide the forecast. Sunny, 22C ");
        assert_eq!(out.as_deref(), Some("Sunny, 22C "));
        // Subsequent deltas flow directly.
        assert_eq!(gate.feed("all day.").as_deref(), Some("all day."));
        assert_eq!(gate.finish(), None);
    }

    #[test]
    fn gate_spills_on_overflow() {
        let mut gate = ThinkingGate::new();
        let filler = "x".repeat(THINKING_BUFFER_LIMIT + 10);
        let out = gate.feed(&filler);
        assert!(out.is_some());
        assert_eq!(gate.feed("more").as_deref(), Some("more"));
    }

    #[test]
    fn gate_finish_flushes_buffered_text() {
        let mut gate = ThinkingGate::new();
        assert_eq!(gate.feed("Short answer without transition"), None);
        let out = gate.finish().unwrap();
        assert_eq!(out, "Short answer without transition");
    }
}
