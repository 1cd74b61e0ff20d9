use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Maximum number of key themes kept on an analysis or aggregate.
pub const MAX_KEY_THEMES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Reddit,
    Twitter,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Reddit, Source::Twitter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Reddit => "reddit",
            Source::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reddit" => Ok(Source::Reddit),
            "twitter" | "x" => Ok(Source::Twitter),
            other => Err(CoreError::InvalidInput {
                message: format!("unknown source '{}'", other),
            }),
        }
    }
}

/// A social post or comment as fetched. Never modified after it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    pub id: String,
    pub source: Source,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub score: i64,
    pub comment_count: i64,
    /// Set on comments; points at the post (or comment) replied to.
    pub parent_id: Option<String>,
    /// Subreddit or account the post was collected from.
    pub channel: Option<String>,
    pub permalink: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn from_score(score: f64) -> Self {
        if score > 0.0 {
            SentimentLabel::Positive
        } else if score < 0.0 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positive" | "bullish" => Ok(SentimentLabel::Positive),
            "negative" | "bearish" => Ok(SentimentLabel::Negative),
            "neutral" => Ok(SentimentLabel::Neutral),
            other => Err(CoreError::InvalidInput {
                message: format!("unknown sentiment label '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAnalysis {
    pub ticker: Option<String>,
    pub sentiment_score: f64,
    pub sentiment_label: SentimentLabel,
    pub confidence: f64,
    pub key_themes: Vec<String>,
    pub actionability_score: f64,
    pub has_catalyst: bool,
    pub reasoning: String,
}

impl PostAnalysis {
    /// Clamps scores into their ranges, normalizes the ticker and caps themes.
    pub fn sanitized(mut self) -> Self {
        self.sentiment_score = clamp_or(self.sentiment_score, -1.0, 1.0, 0.0);
        self.confidence = clamp_or(self.confidence, 0.0, 1.0, 0.0);
        self.actionability_score = clamp_or(self.actionability_score, 0.0, 1.0, 0.0);
        self.ticker = self.ticker.as_deref().and_then(normalize_ticker);
        self.key_themes = self
            .key_themes
            .into_iter()
            .map(|theme| theme.trim().to_string())
            .filter(|theme| !theme.is_empty())
            .take(MAX_KEY_THEMES)
            .collect();
        self
    }
}

fn clamp_or(value: f64, min: f64, max: f64, default: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}

/// Normalizes a symbol such as `$aapl` or `BRK.B`. Returns `None` for
/// anything that cannot be an exchange symbol.
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let symbol = raw.trim().trim_start_matches('$').to_uppercase();
    let (base, class) = match symbol.split_once('.') {
        Some((base, class)) => (base, Some(class)),
        None => (symbol.as_str(), None),
    };

    let base_ok = (1..=5).contains(&base.len()) && base.chars().all(|c| c.is_ascii_uppercase());
    let class_ok = class.map_or(true, |c| c.len() == 1 && c.chars().all(|c| c.is_ascii_uppercase()));

    if base_ok && class_ok {
        Some(symbol)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    NoCredential,
    CircuitOpen,
    RemoteError { message: String },
    MissingEntry,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::NoCredential => "no_credential",
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::RemoteError { .. } => "remote_error",
            FallbackReason::MissingEntry => "missing_entry",
        }
    }
}

/// Classifier outcome tagged with where the analysis came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provenance", rename_all = "snake_case")]
pub enum Classification {
    Remote(PostAnalysis),
    Fallback {
        analysis: PostAnalysis,
        reason: FallbackReason,
    },
}

impl Classification {
    pub fn analysis(&self) -> &PostAnalysis {
        match self {
            Classification::Remote(analysis) => analysis,
            Classification::Fallback { analysis, .. } => analysis,
        }
    }

    pub fn into_analysis(self) -> PostAnalysis {
        match self {
            Classification::Remote(analysis) => analysis,
            Classification::Fallback { analysis, .. } => analysis,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Classification::Fallback { .. })
    }

    pub fn provenance(&self) -> &'static str {
        match self {
            Classification::Remote(_) => "remote",
            Classification::Fallback { .. } => "fallback",
        }
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            Classification::Remote(_) => None,
            Classification::Fallback { reason, .. } => Some(reason),
        }
    }
}

/// A stored post joined with its analysis, as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedPost {
    #[serde(flatten)]
    pub post: RawPost,
    pub analysis: Option<PostAnalysis>,
    pub provenance: Option<String>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    pub mentions: i64,
    pub avg_sentiment: f64,
}

impl SourceBreakdown {
    pub fn record(&mut self, score: f64) {
        let n = self.mentions as f64;
        self.avg_sentiment = (self.avg_sentiment * n + score) / (n + 1.0);
        self.mentions += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerAggregate {
    pub ticker: String,
    pub mention_count: i64,
    pub avg_sentiment: f64,
    pub reddit: SourceBreakdown,
    pub twitter: SourceBreakdown,
    pub last_updated: DateTime<Utc>,
    pub summary: Option<String>,
    pub key_themes: Vec<String>,
}

impl TickerAggregate {
    pub fn new(ticker: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            ticker: ticker.into(),
            mention_count: 0,
            avg_sentiment: 0.0,
            reddit: SourceBreakdown::default(),
            twitter: SourceBreakdown::default(),
            last_updated: now,
            summary: None,
            key_themes: Vec::new(),
        }
    }

    pub fn breakdown(&self, source: Source) -> &SourceBreakdown {
        match source {
            Source::Reddit => &self.reddit,
            Source::Twitter => &self.twitter,
        }
    }

    fn breakdown_mut(&mut self, source: Source) -> &mut SourceBreakdown {
        match source {
            Source::Reddit => &mut self.reddit,
            Source::Twitter => &mut self.twitter,
        }
    }

    /// Folds one mention into the rollup. Every mention carries unit weight,
    /// so `avg_sentiment` stays the arithmetic mean of all folded scores.
    pub fn fold(&mut self, source: Source, analysis: &PostAnalysis, now: DateTime<Utc>) {
        let score = analysis.sentiment_score;
        let n = self.mention_count as f64;
        self.avg_sentiment = (self.avg_sentiment * n + score) / (n + 1.0);
        self.mention_count += 1;
        self.breakdown_mut(source).record(score);

        let mut themes: Vec<String> = analysis.key_themes.clone();
        for theme in self.key_themes.drain(..) {
            if !themes.iter().any(|t| t.eq_ignore_ascii_case(&theme)) {
                themes.push(theme);
            }
        }
        themes.truncate(MAX_KEY_THEMES);
        self.key_themes = themes;

        if now > self.last_updated {
            self.last_updated = now;
        }
        self.summary = Some(self.describe());
    }

    pub fn sentiment_label(&self) -> SentimentLabel {
        SentimentLabel::from_score(self.avg_sentiment)
    }

    fn describe(&self) -> String {
        format!(
            "{} mention{} ({} reddit, {} twitter), average sentiment {:+.2} ({})",
            self.mention_count,
            if self.mention_count == 1 { "" } else { "s" },
            self.reddit.mentions,
            self.twitter.mentions,
            self.avg_sentiment,
            self.sentiment_label()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub ticker: String,
    pub name: String,
    pub sector: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistItem {
    pub ticker: String,
    pub note: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// Admin-editable ingestion sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub subreddits: Vec<String>,
    pub post_limit: u32,
    pub comments_per_post: u32,
}

impl SourceSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.post_limit == 0 || self.post_limit > 100 {
            return Err(CoreError::InvalidInput {
                message: "post_limit must be between 1 and 100".to_string(),
            });
        }
        if self.comments_per_post > 100 {
            return Err(CoreError::InvalidInput {
                message: "comments_per_post must be at most 100".to_string(),
            });
        }
        if let Some(bad) = self
            .subreddits
            .iter()
            .find(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        {
            return Err(CoreError::InvalidInput {
                message: format!("invalid subreddit name '{}'", bad),
            });
        }
        Ok(())
    }
}
