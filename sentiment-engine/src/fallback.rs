//! Keyword sentiment used whenever the language model cannot be reached.
//!
//! Everything here is pure: the same text (and the same resolver) always
//! yields the same analysis.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tickerpulse_core::{normalize_ticker, Company, PostAnalysis, RawPost, SentimentLabel};

pub const FALLBACK_SCORE: f64 = 0.3;
pub const FALLBACK_CONFIDENCE: f64 = 0.3;
pub const FALLBACK_REASONING: &str =
    "Keyword-based estimate; language model analysis was unavailable for this post.";

const POSITIVE_WORDS: &[&str] = &[
    "buy", "bull", "moon", "calls", "long", "gain", "growth", "beat", "strong", "rally",
    "breakout", "undervalued", "rocket", "green", "profit", "upgrade", "soar", "surge",
];

const NEGATIVE_WORDS: &[&str] = &[
    "sell", "bear", "crash", "puts", "short", "down", "loss", "drop", "dump", "weak", "miss",
    "overvalued", "bankrupt", "downgrade", "fear", "plunge", "tank",
];

static SYMBOL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$([A-Z]{1,5}(?:\.[A-Z])?)\b").expect("valid cashtag pattern")
});

/// Maps post text to the ticker it is about, if any.
pub trait TickerResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, text: &str) -> Option<String>;
}

/// Recognizes explicit cashtags such as `$AAPL`, `$aapl` or `$BRK.B`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolResolver;

impl TickerResolver for SymbolResolver {
    fn resolve(&self, text: &str) -> Option<String> {
        SYMBOL_PATTERN
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .find_map(|m| normalize_ticker(m.as_str()))
    }
}

/// Cashtags first, then whole-word company names from a fixed snapshot of
/// the companies table.
#[derive(Debug, Clone, Default)]
pub struct CompanyNameResolver {
    names: Vec<(String, String)>,
}

impl CompanyNameResolver {
    /// Names shorter than this are too ambiguous to match on.
    const MIN_NAME_LEN: usize = 3;

    pub fn new(companies: &[Company]) -> Self {
        let mut names: Vec<(String, String)> = companies
            .iter()
            .filter(|c| c.name.trim().len() >= Self::MIN_NAME_LEN)
            .filter_map(|c| {
                normalize_ticker(&c.ticker).map(|t| (c.name.trim().to_lowercase(), t))
            })
            .collect();
        // Longest names first so "Meta Platforms" wins over "Meta".
        names.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl TickerResolver for CompanyNameResolver {
    fn resolve(&self, text: &str) -> Option<String> {
        if let Some(symbol) = SymbolResolver.resolve(text) {
            return Some(symbol);
        }
        let lowered = text.to_lowercase();
        self.names
            .iter()
            .find(|(name, _)| contains_word(&lowered, name))
            .map(|(_, ticker)| ticker.clone())
    }
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

#[derive(Debug, Clone)]
pub struct FallbackHeuristic {
    resolver: Arc<dyn TickerResolver>,
}

impl Default for FallbackHeuristic {
    fn default() -> Self {
        Self::new(Arc::new(SymbolResolver))
    }
}

impl FallbackHeuristic {
    pub fn new(resolver: Arc<dyn TickerResolver>) -> Self {
        Self { resolver }
    }

    pub fn analyze(&self, post: &RawPost) -> PostAnalysis {
        self.analyze_text(&post.body)
    }

    pub fn analyze_text(&self, text: &str) -> PostAnalysis {
        let sentiment_score = keyword_score(text);
        PostAnalysis {
            ticker: self.resolver.resolve(text),
            sentiment_score,
            sentiment_label: SentimentLabel::from_score(sentiment_score),
            confidence: FALLBACK_CONFIDENCE,
            key_themes: Vec::new(),
            actionability_score: 0.0,
            has_catalyst: false,
            reasoning: FALLBACK_REASONING.to_string(),
        }
    }
}

/// Analysis with the default cashtag-only resolver.
pub fn fallback_analysis(post: &RawPost) -> PostAnalysis {
    FallbackHeuristic::default().analyze(post)
}

fn count_hits(text: &str, words: &[&str]) -> usize {
    words.iter().map(|w| text.matches(w).count()).sum()
}

pub fn keyword_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let positive = count_hits(&lowered, POSITIVE_WORDS);
    let negative = count_hits(&lowered, NEGATIVE_WORDS);

    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => FALLBACK_SCORE,
        std::cmp::Ordering::Less => -FALLBACK_SCORE,
        std::cmp::Ordering::Equal => 0.0,
    }
}
