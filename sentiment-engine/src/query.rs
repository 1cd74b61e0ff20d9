//! Filtering, sorting and pagination over rollups and analyzed posts.
//!
//! Raw query-string parameters are validated into typed queries first. Post
//! queries are pushed down to storage; rollup queries run in memory over the
//! full rollup table, which holds one row per ticker.

use chrono::{DateTime, Duration, Utc};
use database::{Database, PostFilter};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use tickerpulse_core::{
    normalize_ticker, AnalyzedPost, CoreError, SentimentLabel, Source, SourceBreakdown,
    TickerAggregate,
};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

fn invalid(field: &str, value: &str) -> CoreError {
    CoreError::InvalidInput {
        message: format!("invalid {} '{}'", field, value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    #[serde(rename = "1d")]
    Day,
    #[default]
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    All,
}

impl Timeframe {
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timeframe::Day => Some(now - Duration::days(1)),
            Timeframe::Week => Some(now - Duration::days(7)),
            Timeframe::Month => Some(now - Duration::days(30)),
            Timeframe::All => None,
        }
    }
}

impl FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1d" | "24h" | "day" => Ok(Timeframe::Day),
            "7d" | "week" => Ok(Timeframe::Week),
            "30d" | "month" => Ok(Timeframe::Month),
            "all" => Ok(Timeframe::All),
            other => Err(invalid("timeframe", other)),
        }
    }
}

/// `None` means every source.
fn parse_source(raw: Option<&str>) -> Result<Option<Source>, CoreError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(None),
        Some(s) => Source::from_str(s).map(Some),
    }
}

fn parse_opt<T: FromStr<Err = CoreError>>(raw: Option<&str>) -> Result<Option<T>, CoreError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}

fn parse_ticker(raw: Option<&str>) -> Result<Option<String>, CoreError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => normalize_ticker(s)
            .map(Some)
            .ok_or_else(|| invalid("ticker", s)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(invalid("order", other)),
        }
    }
}

impl SortOrder {
    fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Pagination {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Result<Self, CoreError> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page == 0 {
            return Err(invalid("page", "0"));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(invalid("limit", &limit.to_string()));
        }
        Ok(Self { page, limit })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: usize,
    pub total_pages: u32,
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl<T> Page<T> {
    /// Wraps one already-selected page of `total` matching rows.
    pub fn new(items: Vec<T>, pagination: Pagination, total: usize) -> Self {
        Self {
            items,
            page: pagination.page,
            limit: pagination.limit,
            total,
            total_pages: total.div_ceil(pagination.limit as usize) as u32,
        }
    }
}

pub fn paginate<T>(items: Vec<T>, pagination: Pagination) -> Page<T> {
    let total = items.len();
    let start = usize::try_from(pagination.offset()).unwrap_or(usize::MAX);
    let items = items
        .into_iter()
        .skip(start)
        .take(pagination.limit as usize)
        .collect();
    Page::new(items, pagination, total)
}

/// A rollup projected onto one source (or all of them).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerSentiment {
    pub ticker: String,
    pub source: String,
    pub mention_count: i64,
    pub avg_sentiment: f64,
    pub sentiment_label: SentimentLabel,
    pub reddit: SourceBreakdown,
    pub twitter: SourceBreakdown,
    pub last_updated: DateTime<Utc>,
    pub summary: Option<String>,
    pub key_themes: Vec<String>,
}

impl TickerSentiment {
    /// Returns `None` when the rollup has no mentions from `source`.
    pub fn project(aggregate: &TickerAggregate, source: Option<Source>) -> Option<Self> {
        let (mentions, avg, label) = match source {
            Some(source) => {
                let breakdown = aggregate.breakdown(source);
                (breakdown.mentions, breakdown.avg_sentiment, source.as_str())
            }
            None => (aggregate.mention_count, aggregate.avg_sentiment, "all"),
        };
        if mentions == 0 {
            return None;
        }

        Some(Self {
            ticker: aggregate.ticker.clone(),
            source: label.to_string(),
            mention_count: mentions,
            avg_sentiment: avg,
            sentiment_label: SentimentLabel::from_score(avg),
            reddit: aggregate.reddit,
            twitter: aggregate.twitter,
            last_updated: aggregate.last_updated,
            summary: aggregate.summary.clone(),
            key_themes: aggregate.key_themes.clone(),
        })
    }
}

/// Query string of `GET /api/sentiment-analysis`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateParams {
    pub ticker: Option<String>,
    pub source: Option<String>,
    pub sentiment: Option<String>,
    pub min_mentions: Option<i64>,
    pub timeframe: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregateSort {
    #[default]
    Mentions,
    Sentiment,
    Updated,
    Ticker,
}

impl FromStr for AggregateSort {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mentions" | "mention_count" => Ok(AggregateSort::Mentions),
            "sentiment" | "avg_sentiment" => Ok(AggregateSort::Sentiment),
            "updated" | "last_updated" => Ok(AggregateSort::Updated),
            "ticker" => Ok(AggregateSort::Ticker),
            other => Err(invalid("sort", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregateQuery {
    pub ticker: Option<String>,
    pub source: Option<Source>,
    pub sentiment: Option<SentimentLabel>,
    pub min_mentions: i64,
    pub timeframe: Timeframe,
    pub sort: AggregateSort,
    pub order: SortOrder,
    pub pagination: Pagination,
}

impl AggregateQuery {
    pub fn from_params(params: &AggregateParams) -> Result<Self, CoreError> {
        let min_mentions = params.min_mentions.unwrap_or(0);
        if min_mentions < 0 {
            return Err(invalid("min_mentions", &min_mentions.to_string()));
        }

        Ok(Self {
            ticker: parse_ticker(params.ticker.as_deref())?,
            source: parse_source(params.source.as_deref())?,
            sentiment: parse_opt(params.sentiment.as_deref())?,
            min_mentions,
            timeframe: parse_opt(params.timeframe.as_deref())?.unwrap_or_default(),
            sort: parse_opt(params.sort.as_deref())?.unwrap_or_default(),
            order: parse_opt(params.order.as_deref())?.unwrap_or_default(),
            pagination: Pagination::new(params.page, params.limit)?,
        })
    }

    pub fn run(&self, aggregates: &[TickerAggregate], now: DateTime<Utc>) -> Page<TickerSentiment> {
        let since = self.timeframe.since(now);

        let mut rows: Vec<TickerSentiment> = aggregates
            .iter()
            .filter(|a| since.map_or(true, |s| a.last_updated >= s))
            .filter(|a| self.ticker.as_ref().map_or(true, |t| &a.ticker == t))
            .filter_map(|a| TickerSentiment::project(a, self.source))
            .filter(|row| row.mention_count >= self.min_mentions)
            .filter(|row| self.sentiment.map_or(true, |l| row.sentiment_label == l))
            .collect();

        rows.sort_by(|a, b| {
            let primary = match self.sort {
                AggregateSort::Mentions => a.mention_count.cmp(&b.mention_count),
                AggregateSort::Sentiment => a.avg_sentiment.total_cmp(&b.avg_sentiment),
                AggregateSort::Updated => a.last_updated.cmp(&b.last_updated),
                AggregateSort::Ticker => a.ticker.cmp(&b.ticker),
            };
            self.order.apply(primary).then_with(|| a.ticker.cmp(&b.ticker))
        });

        paginate(rows, self.pagination)
    }
}

/// Query string of `GET /api/sentiment-data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SentimentDataParams {
    pub source: Option<String>,
    pub timeframe: Option<String>,
}

/// Every ticker with mentions in the window, most mentioned first.
pub fn sentiment_data(
    params: &SentimentDataParams,
    aggregates: &[TickerAggregate],
    now: DateTime<Utc>,
) -> Result<Vec<TickerSentiment>, CoreError> {
    let query = AggregateQuery {
        source: parse_source(params.source.as_deref())?,
        timeframe: parse_opt(params.timeframe.as_deref())?.unwrap_or_default(),
        pagination: Pagination {
            page: 1,
            limit: u32::MAX,
        },
        ..AggregateQuery::default()
    };
    Ok(query.run(aggregates, now).items)
}

/// Query string of `GET /api/social-posts`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostParams {
    pub ticker: Option<String>,
    pub source: Option<String>,
    pub sentiment: Option<String>,
    pub min_confidence: Option<f64>,
    pub provenance: Option<String>,
    pub timeframe: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub use database::PostSort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Remote,
    Fallback,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Remote => "remote",
            Provenance::Fallback => "fallback",
        }
    }
}

impl FromStr for Provenance {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remote" | "llm" => Ok(Provenance::Remote),
            "fallback" => Ok(Provenance::Fallback),
            other => Err(invalid("provenance", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostQuery {
    pub ticker: Option<String>,
    pub source: Option<Source>,
    pub sentiment: Option<SentimentLabel>,
    pub min_confidence: Option<f64>,
    pub provenance: Option<Provenance>,
    pub timeframe: Timeframe,
    pub sort: PostSort,
    pub order: SortOrder,
    pub pagination: Pagination,
}

impl PostQuery {
    pub fn from_params(params: &PostParams) -> Result<Self, CoreError> {
        if let Some(c) = params.min_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(invalid("min_confidence", &c.to_string()));
            }
        }

        Ok(Self {
            ticker: parse_ticker(params.ticker.as_deref())?,
            source: parse_source(params.source.as_deref())?,
            sentiment: parse_opt(params.sentiment.as_deref())?,
            min_confidence: params.min_confidence,
            provenance: parse_opt(params.provenance.as_deref())?,
            timeframe: parse_opt(params.timeframe.as_deref())?.unwrap_or_default(),
            sort: parse_opt(params.sort.as_deref())?.unwrap_or_default(),
            order: parse_opt(params.order.as_deref())?.unwrap_or_default(),
            pagination: Pagination::new(params.page, params.limit)?,
        })
    }

    pub fn filter(&self, now: DateTime<Utc>) -> PostFilter {
        PostFilter {
            since: self.timeframe.since(now),
            source: self.source,
            ticker: self.ticker.clone(),
            sentiment: self.sentiment,
            min_confidence: self.min_confidence,
            provenance: self.provenance.map(|p| p.as_str().to_string()),
            sort: self.sort,
            descending: self.order == SortOrder::Desc,
        }
    }

    pub async fn fetch(&self, db: &Database, now: DateTime<Utc>) -> Result<Page<AnalyzedPost>, CoreError> {
        let slice = db
            .query_posts(&self.filter(now), self.pagination.limit, self.pagination.offset())
            .await?;
        let total = usize::try_from(slice.total).unwrap_or(usize::MAX);
        Ok(Page::new(slice.posts, self.pagination, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tickerpulse_core::{Classification, FallbackReason, PostAnalysis, RawPost};

    fn aggregate(ticker: &str, reddit: (i64, f64), twitter: (i64, f64), age_days: i64) -> TickerAggregate {
        let now = Utc::now();
        let mentions = reddit.0 + twitter.0;
        let avg = (reddit.0 as f64 * reddit.1 + twitter.0 as f64 * twitter.1) / mentions as f64;
        TickerAggregate {
            ticker: ticker.to_string(),
            mention_count: mentions,
            avg_sentiment: avg,
            reddit: SourceBreakdown {
                mentions: reddit.0,
                avg_sentiment: reddit.1,
            },
            twitter: SourceBreakdown {
                mentions: twitter.0,
                avg_sentiment: twitter.1,
            },
            last_updated: now - Duration::days(age_days),
            summary: None,
            key_themes: Vec::new(),
        }
    }

    fn fixtures() -> Vec<TickerAggregate> {
        vec![
            aggregate("AAPL", (10, 0.4), (2, -0.5), 0),
            aggregate("TSLA", (4, -0.6), (0, 0.0), 2),
            aggregate("NVDA", (0, 0.0), (7, 0.8), 0),
            aggregate("GME", (30, 0.9), (0, 0.0), 45),
        ]
    }

    fn tickers<T>(page: &Page<T>, f: impl Fn(&T) -> &str) -> Vec<String> {
        page.items.iter().map(|i| f(i).to_string()).collect()
    }

    #[test]
    fn test_default_query_sorts_by_mentions_within_week() {
        let query = AggregateQuery::from_params(&AggregateParams::default()).unwrap();
        let page = query.run(&fixtures(), Utc::now());

        assert_eq!(tickers(&page, |t| &t.ticker), vec!["AAPL", "NVDA", "TSLA"]);
        assert_eq!(page.total, 3);
        assert_eq!(page.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn test_source_projection_and_sentiment_filter() {
        let params = AggregateParams {
            source: Some("twitter".to_string()),
            sentiment: Some("negative".to_string()),
            ..Default::default()
        };
        let page = AggregateQuery::from_params(&params)
            .unwrap()
            .run(&fixtures(), Utc::now());

        assert_eq!(page.items.len(), 1);
        let aapl = &page.items[0];
        assert_eq!(aapl.ticker, "AAPL");
        assert_eq!(aapl.source, "twitter");
        assert_eq!(aapl.mention_count, 2);
        assert_eq!(aapl.sentiment_label, SentimentLabel::Negative);
    }

    #[test]
    fn test_min_mentions_sort_and_order() {
        let params = AggregateParams {
            min_mentions: Some(5),
            timeframe: Some("all".to_string()),
            sort: Some("sentiment".to_string()),
            order: Some("asc".to_string()),
            ..Default::default()
        };
        let page = AggregateQuery::from_params(&params)
            .unwrap()
            .run(&fixtures(), Utc::now());

        assert_eq!(tickers(&page, |t| &t.ticker), vec!["AAPL", "NVDA", "GME"]);
    }

    #[test]
    fn test_pagination() {
        let params = AggregateParams {
            timeframe: Some("all".to_string()),
            page: Some(2),
            limit: Some(3),
            ..Default::default()
        };
        let page = AggregateQuery::from_params(&params)
            .unwrap()
            .run(&fixtures(), Utc::now());

        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 2);
        assert_eq!(tickers(&page, |t| &t.ticker), vec!["TSLA"]);

        let beyond = paginate(vec![1, 2, 3], Pagination { page: 5, limit: 2 });
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total_pages, 2);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = [
            AggregateParams {
                limit: Some(0),
                ..Default::default()
            },
            AggregateParams {
                limit: Some(101),
                ..Default::default()
            },
            AggregateParams {
                page: Some(0),
                ..Default::default()
            },
            AggregateParams {
                timeframe: Some("1y".to_string()),
                ..Default::default()
            },
            AggregateParams {
                source: Some("facebook".to_string()),
                ..Default::default()
            },
            AggregateParams {
                ticker: Some("not a ticker".to_string()),
                ..Default::default()
            },
        ];
        for params in &bad {
            assert!(
                matches!(
                    AggregateQuery::from_params(params),
                    Err(CoreError::InvalidInput { .. })
                ),
                "accepted {:?}",
                params
            );
        }
    }

    #[test]
    fn test_sentiment_data_is_unpaginated() {
        let params = SentimentDataParams {
            source: Some("reddit".to_string()),
            timeframe: Some("30d".to_string()),
        };
        let rows = sentiment_data(&params, &fixtures(), Utc::now()).unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(names, vec!["AAPL", "TSLA"]);
    }

    async fn setup_test_db() -> Database {
        let db_path = env::temp_dir().join(format!("test_query_{}.db", uuid::Uuid::new_v4()));
        let db = Database::connect(&format!("sqlite://{}", db_path.display()), 2)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");
        db
    }

    fn raw(id: &str, hours_ago: i64) -> RawPost {
        RawPost {
            id: id.to_string(),
            source: Source::Reddit,
            author: "a".to_string(),
            body: "b".to_string(),
            created_at: Utc::now() - Duration::hours(hours_ago),
            score: hours_ago,
            comment_count: 0,
            parent_id: None,
            channel: None,
            permalink: None,
        }
    }

    async fn store(db: &Database, id: &str, ticker: &str, confidence: f64, fallback: bool, hours_ago: i64) {
        db.save_post(&raw(id, hours_ago)).await.unwrap();
        let analysis = PostAnalysis {
            ticker: Some(ticker.to_string()),
            sentiment_score: 0.3,
            sentiment_label: SentimentLabel::Positive,
            confidence,
            key_themes: Vec::new(),
            actionability_score: 0.0,
            has_catalyst: false,
            reasoning: String::new(),
        };
        let classification = if fallback {
            Classification::Fallback {
                analysis,
                reason: FallbackReason::CircuitOpen,
            }
        } else {
            Classification::Remote(analysis)
        };
        db.save_analysis(id, &classification, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn test_post_query_filters() {
        let db = setup_test_db().await;
        store(&db, "p1", "AAPL", 0.9, false, 1).await;
        store(&db, "p2", "AAPL", 0.3, true, 2).await;
        store(&db, "p3", "TSLA", 0.8, false, 3).await;
        db.save_post(&raw("p4", 4)).await.unwrap();
        let now = Utc::now();

        let all = PostQuery::from_params(&PostParams::default()).unwrap();
        let page = all.fetch(&db, now).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(tickers(&page, |p| &p.post.id), vec!["p1", "p2", "p3", "p4"]);

        let params = PostParams {
            ticker: Some("aapl".to_string()),
            min_confidence: Some(0.5),
            ..Default::default()
        };
        let page = PostQuery::from_params(&params).unwrap().fetch(&db, now).await.unwrap();
        assert_eq!(tickers(&page, |p| &p.post.id), vec!["p1"]);

        let params = PostParams {
            provenance: Some("fallback".to_string()),
            ..Default::default()
        };
        let page = PostQuery::from_params(&params).unwrap().fetch(&db, now).await.unwrap();
        assert_eq!(tickers(&page, |p| &p.post.id), vec!["p2"]);

        let params = PostParams {
            sort: Some("score".to_string()),
            order: Some("asc".to_string()),
            limit: Some(2),
            page: Some(2),
            ..Default::default()
        };
        let page = PostQuery::from_params(&params).unwrap().fetch(&db, now).await.unwrap();
        assert_eq!(tickers(&page, |p| &p.post.id), vec!["p3", "p4"]);
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 2);
    }

    #[test]
    fn test_post_query_maps_to_storage_filter() {
        let params = PostParams {
            ticker: Some("nvda".to_string()),
            provenance: Some("llm".to_string()),
            timeframe: Some("all".to_string()),
            sort: Some("confidence".to_string()),
            order: Some("asc".to_string()),
            ..Default::default()
        };
        let filter = PostQuery::from_params(&params).unwrap().filter(Utc::now());

        assert_eq!(filter.ticker.as_deref(), Some("NVDA"));
        assert_eq!(filter.provenance.as_deref(), Some("remote"));
        assert_eq!(filter.since, None);
        assert_eq!(filter.sort, PostSort::Confidence);
        assert!(!filter.descending);
    }

    #[test]
    fn test_post_query_rejects_bad_confidence() {
        let params = PostParams {
            min_confidence: Some(1.5),
            ..Default::default()
        };
        assert!(PostQuery::from_params(&params).is_err());
    }
}
