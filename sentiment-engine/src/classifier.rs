use crate::fallback::FallbackHeuristic;
use llm_interface::LlmProvider;
use std::sync::Arc;
use tickerpulse_core::retry::{CircuitBreakerState, RetryConfig, RetryExecutor, RetryMetrics};
use tickerpulse_core::{Classification, CoreError, FallbackReason, LlmConfig, PostAnalysis, RawPost};
use tracing::{debug, info, warn};

/// Turns ordered batches of posts into one [`Classification`] per post.
///
/// The remote provider is called through a retry executor whose circuit
/// breaker is shared across batches. Every failure path degrades to the
/// keyword heuristic; `classify` itself never fails.
#[derive(Debug)]
pub struct BatchClassifier {
    provider: Option<Arc<dyn LlmProvider>>,
    retry: RetryExecutor,
    fallback: FallbackHeuristic,
}

impl BatchClassifier {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, retry_config: RetryConfig) -> Self {
        if provider.is_none() {
            warn!("No LLM credential configured, classifying with keyword fallback only");
        }
        Self {
            provider,
            retry: RetryExecutor::new(retry_config),
            fallback: FallbackHeuristic::default(),
        }
    }

    /// Retry policy derived from the `[llm]` config section.
    pub fn retry_config(config: &LlmConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: config.max_attempts,
            failure_threshold: config.failure_threshold,
            recovery_timeout_s: config.recovery_timeout_secs,
            ..RetryConfig::llm()
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackHeuristic) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn circuit_state(&self) -> CircuitBreakerState {
        self.retry.get_circuit_breaker_state()
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        self.retry.get_metrics()
    }

    pub async fn classify(&self, posts: &[RawPost]) -> Vec<Classification> {
        self.classify_with(posts, &self.fallback).await
    }

    /// Like [`classify`](Self::classify), with a caller-supplied heuristic
    /// for posts that fall back.
    pub async fn classify_with(
        &self,
        posts: &[RawPost],
        fallback: &FallbackHeuristic,
    ) -> Vec<Classification> {
        if posts.is_empty() {
            return Vec::new();
        }

        let Some(provider) = &self.provider else {
            return degrade(posts, fallback, FallbackReason::NoCredential);
        };

        let result = self
            .retry
            .execute("llm_classify", || provider.analyze_batch(posts))
            .await;

        match result {
            Ok(analyses) => {
                debug!(
                    "{} classified {} of {} posts",
                    provider.name(),
                    analyses.len().min(posts.len()),
                    posts.len()
                );
                reconcile(posts, analyses, fallback)
            }
            Err(CoreError::CircuitOpen { .. }) => {
                warn!(
                    "Circuit open for {}, {} posts classified by fallback",
                    provider.name(),
                    posts.len()
                );
                degrade(posts, fallback, FallbackReason::CircuitOpen)
            }
            Err(e) => {
                warn!(
                    "{} failed, {} posts classified by fallback: {}",
                    provider.name(),
                    posts.len(),
                    e
                );
                degrade(
                    posts,
                    fallback,
                    FallbackReason::RemoteError {
                        message: e.to_string(),
                    },
                )
            }
        }
    }
}

fn degrade(
    posts: &[RawPost],
    fallback: &FallbackHeuristic,
    reason: FallbackReason,
) -> Vec<Classification> {
    posts
        .iter()
        .map(|post| Classification::Fallback {
            analysis: fallback.analyze(post),
            reason: reason.clone(),
        })
        .collect()
}

/// Pairs remote analyses with posts by position. Missing entries are filled
/// from the heuristic and surplus entries are dropped.
fn reconcile(
    posts: &[RawPost],
    analyses: Vec<PostAnalysis>,
    fallback: &FallbackHeuristic,
) -> Vec<Classification> {
    if analyses.len() > posts.len() {
        info!(
            "Dropping {} surplus analyses",
            analyses.len() - posts.len()
        );
    }

    let mut remote = analyses.into_iter();
    posts
        .iter()
        .map(|post| match remote.next() {
            Some(analysis) => Classification::Remote(analysis),
            None => Classification::Fallback {
                analysis: fallback.analyze(post),
                reason: FallbackReason::MissingEntry,
            },
        })
        .collect()
}
