//! Prompt text, structured-output schema and reply parsing for batch
//! sentiment requests.

use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tickerpulse_core::{LlmError, PostAnalysis, RawPost, SentimentLabel};

/// Longest post body forwarded to the model, in characters.
pub const MAX_BODY_CHARS: usize = 2000;

pub const SCHEMA_NAME: &str = "sentiment_batch";

pub const SYSTEM_PROMPT: &str = "You are a financial sentiment analyst. For every social media \
post you receive, identify the single stock ticker it is mainly about and rate the author's \
sentiment toward it. Map company names to their exchange symbol (for example \"Apple\" -> \
AAPL, \"Nvidia\" -> NVDA). Use null for the ticker when no specific company is discussed. \
sentiment_score ranges from -1 (very bearish) to 1 (very bullish); confidence and \
actionability_score range from 0 to 1. has_catalyst is true when the post cites a concrete \
upcoming event such as earnings, a product launch or a regulatory decision. key_themes holds \
at most five short phrases. Return exactly one analysis per post, in the order given.";

pub fn user_prompt(posts: &[RawPost]) -> String {
    let mut prompt = format!("Analyze these {} posts:\n", posts.len());
    for (i, post) in posts.iter().enumerate() {
        let body: String = post.body.chars().take(MAX_BODY_CHARS).collect();
        prompt.push_str(&format!("\nPost {} ({}):\n{}\n", i + 1, post.source, body));
    }
    prompt
}

/// JSON schema for the reply, pinned to exactly `batch_len` analyses.
pub fn response_schema(batch_len: usize) -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["analyses"],
        "properties": {
            "analyses": {
                "type": "array",
                "minItems": batch_len,
                "maxItems": batch_len,
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": [
                        "ticker", "sentiment_score", "sentiment_label", "confidence",
                        "key_themes", "actionability_score", "has_catalyst", "reasoning"
                    ],
                    "properties": {
                        "ticker": { "type": ["string", "null"] },
                        "sentiment_score": { "type": "number" },
                        "sentiment_label": {
                            "type": "string",
                            "enum": ["positive", "negative", "neutral"]
                        },
                        "confidence": { "type": "number" },
                        "key_themes": { "type": "array", "items": { "type": "string" } },
                        "actionability_score": { "type": "number" },
                        "has_catalyst": { "type": "boolean" },
                        "reasoning": { "type": "string" }
                    }
                }
            }
        }
    })
}

pub fn response_format(batch_len: usize) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": SCHEMA_NAME,
            "strict": true,
            "schema": response_schema(batch_len)
        }
    })
}

#[derive(Debug, Deserialize)]
struct BatchReply {
    analyses: Vec<RemoteAnalysis>,
}

#[derive(Debug, Deserialize)]
struct RemoteAnalysis {
    ticker: Option<String>,
    sentiment_score: f64,
    #[serde(default)]
    sentiment_label: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    key_themes: Vec<String>,
    #[serde(default)]
    actionability_score: f64,
    #[serde(default)]
    has_catalyst: bool,
    #[serde(default)]
    reasoning: String,
}

impl From<RemoteAnalysis> for PostAnalysis {
    fn from(remote: RemoteAnalysis) -> Self {
        let label = remote
            .sentiment_label
            .as_deref()
            .and_then(|l| SentimentLabel::from_str(l).ok())
            .unwrap_or_else(|| SentimentLabel::from_score(remote.sentiment_score));

        PostAnalysis {
            ticker: remote.ticker,
            sentiment_score: remote.sentiment_score,
            sentiment_label: label,
            confidence: remote.confidence,
            key_themes: remote.key_themes,
            actionability_score: remote.actionability_score,
            has_catalyst: remote.has_catalyst,
            reasoning: remote.reasoning,
        }
        .sanitized()
    }
}

/// Parses the model's JSON reply into sanitized analyses. The array length
/// is returned as-is.
pub fn parse_reply(provider: &str, content: &str) -> Result<Vec<PostAnalysis>, LlmError> {
    let reply: BatchReply =
        serde_json::from_str(content).map_err(|e| LlmError::InvalidResponseFormat {
            provider: provider.to_string(),
            details: e.to_string(),
        })?;
    Ok(reply.analyses.into_iter().map(PostAnalysis::from).collect())
}
