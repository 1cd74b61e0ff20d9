use chrono::{DateTime, Utc};
use database::{Database, MentionOutcome};
use serde::Serialize;
use std::collections::BTreeSet;
use tickerpulse_core::{CoreError, ErrorReporter, PostAnalysis, RawPost};
use tracing::{debug, info};

/// Counts from folding one batch of analyses into ticker rollups.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub without_ticker: usize,
    pub failed: usize,
    pub tickers: BTreeSet<String>,
}

impl AggregationSummary {
    fn record(&mut self, outcome: MentionOutcome) {
        match outcome {
            MentionOutcome::Applied(aggregate) => {
                debug!(
                    "{} now at {} mentions, avg {:.3}",
                    aggregate.ticker, aggregate.mention_count, aggregate.avg_sentiment
                );
                self.applied += 1;
                self.tickers.insert(aggregate.ticker);
            }
            MentionOutcome::Duplicate => self.duplicates += 1,
            MentionOutcome::NoTicker => self.without_ticker += 1,
        }
    }

    pub fn merge(&mut self, other: AggregationSummary) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.without_ticker += other.without_ticker;
        self.failed += other.failed;
        self.tickers.extend(other.tickers);
    }
}

/// Folds post analyses into per-ticker rollups, at most once per post.
#[derive(Debug, Clone)]
pub struct Aggregator {
    db: Database,
    reporter: ErrorReporter,
}

impl Aggregator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            reporter: ErrorReporter::new("aggregation"),
        }
    }

    /// Never fails: a mention that cannot be persisted is reported and
    /// counted in `failed`, and the rest of the batch still goes through.
    pub async fn aggregate_batch(&self, batch: &[(&RawPost, &PostAnalysis)]) -> AggregationSummary {
        let mut summary = AggregationSummary::default();

        for (post, analysis) in batch {
            match self
                .db
                .record_mention(&post.id, post.source, analysis, Utc::now())
                .await
            {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    self.reporter.report_error(&e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Recomputes every rollup from stored analyses, optionally only those
    /// created at or after `since`. All or nothing: on error the previous
    /// rollups are kept.
    pub async fn rebuild(&self, since: Option<DateTime<Utc>>) -> Result<AggregationSummary, CoreError> {
        info!("Rebuilding aggregates");
        let outcomes = self.db.rebuild_aggregates(since, Utc::now()).await?;

        let mut summary = AggregationSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }

        info!(
            "Rebuild complete: {} mentions across {} tickers",
            summary.applied,
            summary.tickers.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::env;
    use tickerpulse_core::{Classification, SentimentLabel, Source};

    async fn setup_test_db() -> Database {
        let db_path = env::temp_dir().join(format!("test_aggregator_{}.db", uuid::Uuid::new_v4()));
        let db = Database::connect(&format!("sqlite://{}", db_path.display()), 2)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");
        db
    }

    fn post(id: &str, source: Source) -> RawPost {
        RawPost {
            id: id.to_string(),
            source,
            author: "a".to_string(),
            body: "body".to_string(),
            created_at: Utc::now(),
            score: 0,
            comment_count: 0,
            parent_id: None,
            channel: None,
            permalink: None,
        }
    }

    fn analysis(ticker: Option<&str>, score: f64) -> PostAnalysis {
        PostAnalysis {
            ticker: ticker.map(str::to_string),
            sentiment_score: score,
            sentiment_label: SentimentLabel::from_score(score),
            confidence: 0.8,
            key_themes: Vec::new(),
            actionability_score: 0.0,
            has_catalyst: false,
            reasoning: String::new(),
        }
    }

    #[tokio::test]
    async fn test_aapl_running_mean() {
        let db = setup_test_db().await;
        let aggregator = Aggregator::new(db.clone());

        let posts: Vec<RawPost> = (0..3).map(|i| post(&format!("p{}", i), Source::Reddit)).collect();
        let analyses: Vec<PostAnalysis> = [0.5, 0.3, -0.1]
            .into_iter()
            .map(|s| analysis(Some("AAPL"), s))
            .collect();
        let batch: Vec<_> = posts.iter().zip(analyses.iter()).collect();

        let summary = aggregator.aggregate_batch(&batch).await;
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.tickers.len(), 1);

        let aapl = db.get_aggregate("AAPL").await.unwrap().unwrap();
        assert_eq!(aapl.mention_count, 3);
        assert!((aapl.avg_sentiment - 0.7 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_repeated_batch_is_a_no_op() {
        let db = setup_test_db().await;
        let aggregator = Aggregator::new(db.clone());

        let p = post("p1", Source::Twitter);
        let a = analysis(Some("TSLA"), 0.4);
        let batch = vec![(&p, &a)];

        aggregator.aggregate_batch(&batch).await;
        let second = aggregator.aggregate_batch(&batch).await;
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 1);

        let tsla = db.get_aggregate("TSLA").await.unwrap().unwrap();
        assert_eq!(tsla.mention_count, 1);
        assert_eq!(tsla.twitter.mentions, 1);
    }

    #[tokio::test]
    async fn test_posts_without_ticker_are_skipped() {
        let db = setup_test_db().await;
        let aggregator = Aggregator::new(db.clone());

        let p = post("p1", Source::Reddit);
        let a = analysis(None, 0.3);
        let summary = aggregator.aggregate_batch(&[(&p, &a)]).await;

        assert_eq!(summary.without_ticker, 1);
        assert!(db.list_aggregates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_recomputes_from_stored_analyses() {
        let db = setup_test_db().await;
        let aggregator = Aggregator::new(db.clone());

        let mut old = post("old", Source::Reddit);
        old.created_at = Utc::now() - Duration::days(40);
        let fresh = post("fresh", Source::Reddit);
        db.save_posts(&[old.clone(), fresh.clone()]).await.unwrap();

        for (p, score) in [(&old, -0.8), (&fresh, 0.4)] {
            let classification = Classification::Remote(analysis(Some("AMD"), score));
            db.save_analysis(&p.id, &classification, Utc::now())
                .await
                .unwrap();
        }

        let full = aggregator.rebuild(None).await.unwrap();
        assert_eq!(full.applied, 2);
        let amd = db.get_aggregate("AMD").await.unwrap().unwrap();
        assert_eq!(amd.mention_count, 2);

        let recent = aggregator
            .rebuild(Some(Utc::now() - Duration::days(7)))
            .await
            .unwrap();
        assert_eq!(recent.applied, 1);
        let amd = db.get_aggregate("AMD").await.unwrap().unwrap();
        assert_eq!(amd.mention_count, 1);
        assert!((amd.avg_sentiment - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_rebuild_reports_error_and_keeps_rollups() {
        let db = setup_test_db().await;
        let aggregator = Aggregator::new(db.clone());

        let first = post("first", Source::Reddit);
        let mut second = post("second", Source::Reddit);
        second.created_at = first.created_at + Duration::minutes(5);
        db.save_posts(&[first.clone(), second.clone()]).await.unwrap();

        let a = analysis(Some("AMD"), 0.5);
        let b = analysis(Some("INTC"), -0.3);
        for (p, an) in [(&first, &a), (&second, &b)] {
            db.save_analysis(&p.id, &Classification::Remote(an.clone()), Utc::now())
                .await
                .unwrap();
        }
        aggregator.aggregate_batch(&[(&first, &a), (&second, &b)]).await;

        sqlx::query(
            "CREATE TRIGGER reject_intc BEFORE INSERT ON ticker_aggregates \
             WHEN NEW.ticker = 'INTC' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(aggregator.rebuild(None).await.is_err());

        let amd = db.get_aggregate("AMD").await.unwrap().unwrap();
        assert_eq!(amd.mention_count, 1);
        let intc = db.get_aggregate("INTC").await.unwrap().unwrap();
        assert!((intc.avg_sentiment + 0.3).abs() < 1e-9);
        let replay = aggregator.aggregate_batch(&[(&first, &a)]).await;
        assert_eq!(replay.duplicates, 1);
    }
}
