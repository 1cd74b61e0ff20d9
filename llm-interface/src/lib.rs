//! Remote sentiment classification through hosted language models.

use async_trait::async_trait;
use std::fmt;
use tickerpulse_core::{CoreError, PostAnalysis, RawPost};

pub mod openai;
pub mod prompt;

pub use openai::OpenAiProvider;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Classifies `posts` in one request. The returned list follows the
    /// input order but may be shorter or longer than `posts` if the model
    /// misbehaves; callers reconcile the length.
    async fn analyze_batch(&self, posts: &[RawPost]) -> Result<Vec<PostAnalysis>, CoreError>;
}

impl fmt::Debug for dyn LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LlmProvider({})", self.name())
    }
}
