use serde_json::Value;

/// One way of locating reply text inside a raw completion payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// `{"text": "..."}`
    DirectText,
    /// `{"content": "..."}` or `{"content": {"parts": [{"text": "..."}]}}`
    Content,
    /// `{"candidates": [{"content": ...}]}` or `{"candidates": [{"text": "..."}]}`
    FirstCandidate,
    /// Any of `text`, `content`, `output`, one object level deep.
    Keyed,
}

impl ExtractionStrategy {
    pub const ORDERED: [ExtractionStrategy; 4] =
        [Self::DirectText, Self::Content, Self::FirstCandidate, Self::Keyed];

    pub fn label(&self) -> &'static str {
        match self {
            Self::DirectText => "direct_text",
            Self::Content => "content",
            Self::FirstCandidate => "first_candidate",
            Self::Keyed => "keyed",
        }
    }
}

const KEYED_FIELDS: [&str; 3] = ["text", "content", "output"];

/// Pulls reply text out of completion payloads whose shape varies between
/// model versions. Never fails on shape mismatch; blank text counts as absent.
#[derive(Clone, Debug)]
pub struct ResponseExtractor {
    strategies: Vec<ExtractionStrategy>,
}

impl Default for ResponseExtractor {
    fn default() -> Self {
        Self { strategies: ExtractionStrategy::ORDERED.to_vec() }
    }
}

impl ResponseExtractor {
    pub fn with_strategies(strategies: Vec<ExtractionStrategy>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, raw: &Value) -> Option<String> {
        self.extract_with_strategy(raw).map(|(text, _)| text)
    }

    pub fn extract_with_strategy(&self, raw: &Value) -> Option<(String, ExtractionStrategy)> {
        self.strategies
            .iter()
            .find_map(|strategy| apply(*strategy, raw).map(|text| (text, *strategy)))
    }
}

fn apply(strategy: ExtractionStrategy, raw: &Value) -> Option<String> {
    match strategy {
        ExtractionStrategy::DirectText => raw.get("text").and_then(non_blank),
        ExtractionStrategy::Content => raw.get("content").and_then(content_text),
        ExtractionStrategy::FirstCandidate => {
            let candidate = raw.get("candidates")?.as_array()?.first()?;
            candidate
                .get("content")
                .and_then(content_text)
                .or_else(|| candidate.get("text").and_then(non_blank))
        }
        ExtractionStrategy::Keyed => {
            let object = raw.as_object()?;
            KEYED_FIELDS.iter().filter_map(|key| object.get(*key)).find_map(|value| {
                non_blank(value).or_else(|| {
                    let nested = value.as_object()?;
                    KEYED_FIELDS.iter().filter_map(|key| nested.get(*key)).find_map(non_blank)
                })
            })
        }
    }
}

/// A content value is either a plain string or a `parts` list; every text
/// part is concatenated in order.
fn content_text(content: &Value) -> Option<String> {
    if let Some(text) = non_blank(content) {
        return Some(text);
    }

    let parts = content.get("parts")?.as_array()?;
    let joined: String =
        parts.iter().filter_map(|part| part.get("text").and_then(Value::as_str)).collect();
    (!joined.trim().is_empty()).then_some(joined)
}

fn non_blank(value: &Value) -> Option<String> {
    value.as_str().filter(|text| !text.trim().is_empty()).map(str::to_string)
}
