//! Social platform fetchers.

use async_trait::async_trait;
use tickerpulse_core::{CoreError, RawPost, Source, SourceSettings};

pub mod auth;
pub mod rate_limiter;
pub mod reddit;


pub use reddit::RedditFetcher;

/// A source of raw posts for the ingestion pipeline.
#[async_trait]
pub trait PostFetcher: Send + Sync {
    fn source(&self) -> Source;

    /// Fetches the current posts for every channel in `settings`.
    async fn fetch(&self, settings: &SourceSettings) -> Result<Vec<RawPost>, CoreError>;
}
