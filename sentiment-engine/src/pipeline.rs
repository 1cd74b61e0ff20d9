use crate::aggregator::{AggregationSummary, Aggregator};
use crate::classifier::BatchClassifier;
use crate::fallback::{CompanyNameResolver, FallbackHeuristic};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use database::Database;
use serde::Serialize;
use social_client::PostFetcher;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickerpulse_core::{
    AppConfig, Classification, CoreError, ErrorReporter, PostAnalysis, RawPost, SourceSettings,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub resolve_company_names: bool,
    /// Used until an admin saves source settings.
    pub default_sources: SourceSettings,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.pipeline.batch_size.max(1),
            batch_delay: Duration::from_millis(config.pipeline.batch_delay_ms),
            resolve_company_names: config.fallback.resolve_company_names,
            default_sources: config.reddit.source_settings(),
        }
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub posts_fetched: usize,
    pub posts_new: usize,
    pub batches: usize,
    pub remote: usize,
    pub fallback: usize,
    pub tickers_updated: usize,
    pub duplicates_skipped: usize,
    /// Ticker rollups stored after the run.
    pub data_points: usize,
    /// Newly stored top-level posts (comments excluded).
    pub top_posts: usize,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Fetch, classify and aggregate. At most one run is in flight at a time.
pub struct IngestionPipeline {
    db: Database,
    fetchers: Vec<Arc<dyn PostFetcher>>,
    classifier: BatchClassifier,
    aggregator: Aggregator,
    settings: PipelineSettings,
    reporter: ErrorReporter,
    run_guard: Mutex<()>,
}

impl fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: Vec<_> = self.fetchers.iter().map(|f| f.source()).collect();
        f.debug_struct("IngestionPipeline")
            .field("fetchers", &sources)
            .field("classifier", &self.classifier)
            .field("settings", &self.settings)
            .finish()
    }
}

impl IngestionPipeline {
    pub fn new(
        db: Database,
        fetchers: Vec<Arc<dyn PostFetcher>>,
        classifier: BatchClassifier,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(db.clone()),
            db,
            fetchers,
            classifier,
            settings,
            reporter: ErrorReporter::new("ingestion"),
            run_guard: Mutex::new(()),
        }
    }

    pub fn classifier(&self) -> &BatchClassifier {
        &self.classifier
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    pub async fn run(&self) -> Result<RunReport, CoreError> {
        let _guard = self.run_guard.try_lock().map_err(|_| CoreError::Conflict {
            message: "an ingestion run is already in progress".to_string(),
        })?;

        let started = Instant::now();
        let mut report = RunReport::default();

        let sources = match self
            .db
            .get_source_settings(&self.settings.default_sources)
            .await
        {
            Ok(sources) => sources,
            Err(e) => {
                self.reporter.report_warning(&e);
                self.settings.default_sources.clone()
            }
        };
        let heuristic = self.fallback_heuristic().await;

        let fetched = self.fetch_all(&sources).await;
        report.posts_fetched = fetched.len();

        let mut pending = Vec::with_capacity(fetched.len());
        for post in fetched {
            match self.db.save_post(&post).await {
                Ok(true) => {
                    report.posts_new += 1;
                    if post.parent_id.is_none() {
                        report.top_posts += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    self.reporter.report_error(&e);
                    continue;
                }
            }

            match self.db.is_analyzed(&post.id).await {
                Ok(true) => report.duplicates_skipped += 1,
                Ok(false) => pending.push(post),
                Err(e) => self.reporter.report_error(&e),
            }
        }

        info!(
            "Fetched {} posts ({} new), {} awaiting analysis",
            report.posts_fetched,
            report.posts_new,
            pending.len()
        );

        let mut aggregation = AggregationSummary::default();
        let batches: Vec<&[RawPost]> = pending.chunks(self.settings.batch_size).collect();
        report.batches = batches.len();

        for (index, batch) in batches.iter().enumerate() {
            let classifications = self.classifier.classify_with(batch, &heuristic).await;
            let fallbacks = classifications.iter().filter(|c| c.is_fallback()).count();
            report.fallback += fallbacks;
            report.remote += classifications.len() - fallbacks;

            let stored = self.store_analyses(batch, &classifications, &mut report).await;
            aggregation.merge(self.aggregator.aggregate_batch(&stored).await);

            debug!("Batch {}/{} done", index + 1, report.batches);
            if index + 1 < batches.len() && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        report.tickers_updated = aggregation.tickers.len();
        report.duplicates_skipped += aggregation.duplicates;
        report.data_points = match self.db.list_aggregates().await {
            Ok(aggregates) => aggregates.len(),
            Err(e) => {
                self.reporter.report_error(&e);
                0
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;
        report.timestamp = Utc::now();

        if report.fallback > 0 {
            warn!(
                "{} of {} posts classified by keyword fallback",
                report.fallback,
                report.remote + report.fallback
            );
        }
        info!(
            "Ingestion run complete in {} ms: {} batches, {} tickers updated, {} rollups",
            report.duration_ms, report.batches, report.tickers_updated, report.data_points
        );
        Ok(report)
    }

    /// Recomputes rollups from stored analyses of posts created within the
    /// last `days` days, or all of them. Refused while a run is in flight.
    pub async fn rebuild(&self, days: Option<i64>) -> Result<AggregationSummary, CoreError> {
        let _guard = self.run_guard.try_lock().map_err(|_| CoreError::Conflict {
            message: "an ingestion run is already in progress".to_string(),
        })?;
        let since = days.map(|d| Utc::now() - ChronoDuration::days(d));
        self.aggregator.rebuild(since).await
    }

    async fn fallback_heuristic(&self) -> FallbackHeuristic {
        if !self.settings.resolve_company_names {
            return FallbackHeuristic::default();
        }
        match self.db.list_companies().await {
            Ok(companies) => {
                let resolver = CompanyNameResolver::new(&companies);
                debug!("Fallback resolves {} company names", resolver.len());
                FallbackHeuristic::new(Arc::new(resolver))
            }
            Err(e) => {
                self.reporter.report_warning(&e);
                FallbackHeuristic::default()
            }
        }
    }

    async fn fetch_all(&self, sources: &SourceSettings) -> Vec<RawPost> {
        let mut seen = HashSet::new();
        let mut posts = Vec::new();

        for fetcher in &self.fetchers {
            match fetcher.fetch(sources).await {
                Ok(fetched) => {
                    debug!("{} returned {} posts", fetcher.source(), fetched.len());
                    posts.extend(fetched.into_iter().filter(|p| seen.insert(p.id.clone())));
                }
                Err(e) => {
                    warn!("Fetching from {} failed", fetcher.source());
                    self.reporter.report_warning(&e);
                }
            }
        }
        posts
    }

    /// Persists each classification and returns the pairs that were newly
    /// written, which are the only ones safe to aggregate.
    async fn store_analyses<'a>(
        &self,
        batch: &'a [RawPost],
        classifications: &'a [Classification],
        report: &mut RunReport,
    ) -> Vec<(&'a RawPost, &'a PostAnalysis)> {
        let now = Utc::now();
        let mut stored = Vec::with_capacity(batch.len());

        for (post, classification) in batch.iter().zip(classifications) {
            match self.db.save_analysis(&post.id, classification, now).await {
                Ok(true) => stored.push((post, classification.analysis())),
                Ok(false) => report.duplicates_skipped += 1,
                Err(e) => self.reporter.report_error(&e),
            }
        }
        stored
    }
}
