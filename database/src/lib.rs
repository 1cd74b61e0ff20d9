//! SQLite persistence for posts, analyses, ticker rollups and dashboard
//! reference data.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tickerpulse_core::{
    AnalyzedPost, Classification, Company, CoreError, DatabaseError, PostAnalysis, RawPost,
    SentimentLabel, Source, SourceBreakdown, SourceSettings, TickerAggregate, WatchlistItem,
};
use tracing::{debug, info};

mod tests;

const SOURCE_SETTINGS_KEY: &str = "source_settings";

const POST_COLUMNS: &str = "id, source, author, body, created_utc, score, comment_count, \
     parent_id, channel, permalink, ticker, sentiment_score, sentiment_label, confidence, \
     key_themes, actionability_score, has_catalyst, reasoning, analysis_source, analyzed_at";

const AGGREGATE_COLUMNS: &str = "ticker, mention_count, avg_sentiment, reddit_mentions, \
     reddit_sentiment, twitter_mentions, twitter_sentiment, summary, key_themes, last_updated";

/// Result of folding one post into its ticker rollup.
#[derive(Debug, Clone, PartialEq)]
pub enum MentionOutcome {
    Applied(TickerAggregate),
    /// The post was already folded in earlier.
    Duplicate,
    NoTicker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostSort {
    #[default]
    Created,
    Score,
    Confidence,
}

impl PostSort {
    // Unanalyzed posts rank below any analyzed one.
    fn column(&self) -> &'static str {
        match self {
            PostSort::Created => "created_utc",
            PostSort::Score => "score",
            PostSort::Confidence => "COALESCE(confidence, -1.0)",
        }
    }
}

impl FromStr for PostSort {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" | "created_at" | "date" => Ok(PostSort::Created),
            "score" => Ok(PostSort::Score),
            "confidence" => Ok(PostSort::Confidence),
            other => Err(CoreError::InvalidInput {
                message: format!("invalid sort '{}'", other),
            }),
        }
    }
}

/// Row selection for [`Database::query_posts`]. Any analysis-based filter
/// excludes posts that have not been classified yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostFilter {
    pub since: Option<DateTime<Utc>>,
    pub source: Option<Source>,
    pub ticker: Option<String>,
    pub sentiment: Option<SentimentLabel>,
    pub min_confidence: Option<f64>,
    pub provenance: Option<String>,
    pub sort: PostSort,
    pub descending: bool,
}

impl PostFilter {
    fn needs_analysis(&self) -> bool {
        self.ticker.is_some()
            || self.sentiment.is_some()
            || self.min_confidence.is_some()
            || self.provenance.is_some()
    }

    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(" WHERE 1=1");
        if let Some(since) = self.since {
            builder.push(" AND created_utc >= ").push_bind(since.timestamp());
        }
        if let Some(source) = self.source {
            builder.push(" AND source = ").push_bind(source.as_str().to_string());
        }
        if self.needs_analysis() {
            builder.push(" AND analyzed_at IS NOT NULL");
        }
        if let Some(ticker) = &self.ticker {
            builder.push(" AND ticker = ").push_bind(ticker.clone());
        }
        if let Some(label) = self.sentiment {
            builder.push(" AND sentiment_label = ").push_bind(label.as_str().to_string());
        }
        if let Some(confidence) = self.min_confidence {
            builder.push(" AND confidence >= ").push_bind(confidence);
        }
        if let Some(provenance) = &self.provenance {
            builder
                .push(" AND analysis_source = ")
                .push_bind(provenance.clone());
        }
    }
}

/// One page of posts plus the number of rows matching the filter overall.
#[derive(Debug, Clone, PartialEq)]
pub struct PostSlice {
    pub posts: Vec<AnalyzedPost>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        info!("Connected to database {}", connection_string);
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed {
                migration: e.to_string(),
            })?;
        debug!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- raw posts -------------------------------------------------------

    /// Stores a post unless one with the same id exists. Returns whether a
    /// row was written.
    pub async fn save_post(&self, post: &RawPost) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO raw_posts \
             (id, source, author, body, created_utc, score, comment_count, parent_id, channel, \
              permalink, fetched_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&post.id)
        .bind(post.source.as_str())
        .bind(&post.author)
        .bind(&post.body)
        .bind(post.created_at.timestamp())
        .bind(post.score)
        .bind(post.comment_count)
        .bind(&post.parent_id)
        .bind(&post.channel)
        .bind(&post.permalink)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn save_posts(&self, posts: &[RawPost]) -> Result<usize, CoreError> {
        let mut written = 0;
        for post in posts {
            if self.save_post(post).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub async fn is_analyzed(&self, post_id: &str) -> Result<bool, CoreError> {
        let analyzed =
            sqlx::query_scalar::<_, Option<i64>>("SELECT analyzed_at FROM raw_posts WHERE id = ?")
                .bind(post_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        Ok(analyzed.is_some())
    }

    /// Writes the analysis columns of a stored post. Analyses are write-once:
    /// returns `false` if the post is unknown or already analyzed.
    pub async fn save_analysis(
        &self,
        post_id: &str,
        classification: &Classification,
        analyzed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let analysis = classification.analysis();
        let themes = serde_json::to_string(&analysis.key_themes)?;

        let result = sqlx::query(
            "UPDATE raw_posts SET ticker = ?, sentiment_score = ?, sentiment_label = ?, \
             confidence = ?, key_themes = ?, actionability_score = ?, has_catalyst = ?, \
             reasoning = ?, analysis_source = ?, fallback_reason = ?, analyzed_at = ? \
             WHERE id = ? AND analyzed_at IS NULL",
        )
        .bind(&analysis.ticker)
        .bind(analysis.sentiment_score)
        .bind(analysis.sentiment_label.as_str())
        .bind(analysis.confidence)
        .bind(themes)
        .bind(analysis.actionability_score)
        .bind(analysis.has_catalyst)
        .bind(&analysis.reasoning)
        .bind(classification.provenance())
        .bind(classification.fallback_reason().map(|r| r.as_str()))
        .bind(analyzed_at.timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<AnalyzedPost>, CoreError> {
        let query = format!("SELECT {} FROM raw_posts WHERE id = ?", POST_COLUMNS);
        let row = sqlx::query(&query)
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    /// Filters, orders and pages posts in SQL. Ties on the sort key are
    /// broken by id, ascending.
    pub async fn query_posts(
        &self,
        filter: &PostFilter,
        limit: u32,
        offset: u64,
    ) -> Result<PostSlice, CoreError> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM raw_posts");
        filter.push_where(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM raw_posts", POST_COLUMNS));
        filter.push_where(&mut select);
        select
            .push(" ORDER BY ")
            .push(filter.sort.column())
            .push(if filter.descending { " DESC" } else { " ASC" })
            .push(", id ASC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
        let rows = select.build().fetch_all(&self.pool).await?;

        Ok(PostSlice {
            posts: rows.iter().map(post_from_row).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    // ---- ticker aggregates -----------------------------------------------

    /// Folds `analysis` into its ticker's rollup exactly once per post.
    ///
    /// The ledger insert and the aggregate upsert share one transaction, so a
    /// post is either fully counted or not counted at all.
    pub async fn record_mention(
        &self,
        post_id: &str,
        source: Source,
        analysis: &PostAnalysis,
        now: DateTime<Utc>,
    ) -> Result<MentionOutcome, CoreError> {
        if analysis.ticker.is_none() {
            return Ok(MentionOutcome::NoTicker);
        }

        let mut tx = self.pool.begin().await?;
        let outcome = fold_mention(&mut tx, post_id, source, analysis, now).await?;
        if outcome == MentionOutcome::Duplicate {
            tx.rollback().await?;
            debug!("Post {} already aggregated, skipping", post_id);
        } else {
            tx.commit().await?;
        }
        Ok(outcome)
    }

    /// Replaces every rollup and the ledger with ones recomputed from stored
    /// analyses of posts created at or after `since`, oldest first.
    ///
    /// Runs as one transaction: if any post fails to fold, the previous
    /// rollups stay in place and the error is returned.
    pub async fn rebuild_aggregates(
        &self,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<MentionOutcome>, CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM aggregated_posts")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ticker_aggregates")
            .execute(&mut *tx)
            .await?;

        let query = format!(
            "SELECT {} FROM raw_posts \
             WHERE ticker IS NOT NULL AND analyzed_at IS NOT NULL AND created_utc >= ? \
             ORDER BY created_utc ASC, id ASC",
            POST_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(since.map(|s| s.timestamp()).unwrap_or(i64::MIN))
            .fetch_all(&mut *tx)
            .await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in &rows {
            let stored = post_from_row(row)?;
            if let Some(analysis) = &stored.analysis {
                let outcome =
                    fold_mention(&mut tx, &stored.post.id, stored.post.source, analysis, now).await?;
                outcomes.push(outcome);
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    pub async fn get_aggregate(&self, ticker: &str) -> Result<Option<TickerAggregate>, CoreError> {
        let query = format!(
            "SELECT {} FROM ticker_aggregates WHERE ticker = ?",
            AGGREGATE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(aggregate_from_row).transpose()
    }

    pub async fn list_aggregates(&self) -> Result<Vec<TickerAggregate>, CoreError> {
        let query = format!(
            "SELECT {} FROM ticker_aggregates ORDER BY mention_count DESC, ticker ASC",
            AGGREGATE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(aggregate_from_row).collect()
    }

    // ---- companies & watchlist -------------------------------------------

    pub async fn upsert_company(&self, company: &Company) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO companies (ticker, name, sector, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(ticker) DO UPDATE SET name = excluded.name, sector = excluded.sector",
        )
        .bind(&company.ticker)
        .bind(&company.name)
        .bind(&company.sector)
        .bind(company.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_companies(&self) -> Result<Vec<Company>, CoreError> {
        let rows = sqlx::query(
            "SELECT ticker, name, sector, created_at FROM companies ORDER BY ticker ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Company {
                    ticker: row.try_get("ticker")?,
                    name: row.try_get("name")?,
                    sector: row.try_get("sector")?,
                    created_at: from_timestamp(row.try_get("created_at")?),
                })
            })
            .collect()
    }

    pub async fn delete_company(&self, ticker: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM companies WHERE ticker = ?")
            .bind(ticker)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns `false` when the ticker is already on the watchlist.
    pub async fn add_watchlist_item(&self, item: &WatchlistItem) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO watchlist_items (ticker, note, added_at) VALUES (?, ?, ?)",
        )
        .bind(&item.ticker)
        .bind(&item.note)
        .bind(item.added_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_watchlist(&self) -> Result<Vec<WatchlistItem>, CoreError> {
        let rows =
            sqlx::query("SELECT ticker, note, added_at FROM watchlist_items ORDER BY added_at ASC, ticker ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|row| {
                Ok(WatchlistItem {
                    ticker: row.try_get("ticker")?,
                    note: row.try_get("note")?,
                    added_at: from_timestamp(row.try_get("added_at")?),
                })
            })
            .collect()
    }

    pub async fn remove_watchlist_item(&self, ticker: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM watchlist_items WHERE ticker = ?")
            .bind(ticker)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- settings --------------------------------------------------------

    pub async fn save_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Stored source settings, or `defaults` if an admin never saved any.
    pub async fn get_source_settings(
        &self,
        defaults: &SourceSettings,
    ) -> Result<SourceSettings, CoreError> {
        match self.get_setting(SOURCE_SETTINGS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(defaults.clone()),
        }
    }

    pub async fn save_source_settings(&self, settings: &SourceSettings) -> Result<(), CoreError> {
        settings.validate()?;
        let raw = serde_json::to_string(settings)?;
        self.save_setting(SOURCE_SETTINGS_KEY, &raw).await
    }
}

async fn fold_mention(
    conn: &mut SqliteConnection,
    post_id: &str,
    source: Source,
    analysis: &PostAnalysis,
    now: DateTime<Utc>,
) -> Result<MentionOutcome, CoreError> {
    let Some(ticker) = analysis.ticker.as_deref() else {
        return Ok(MentionOutcome::NoTicker);
    };

    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO aggregated_posts (post_id, ticker, aggregated_at) \
         VALUES (?, ?, ?)",
    )
    .bind(post_id)
    .bind(ticker)
    .bind(now.timestamp())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Ok(MentionOutcome::Duplicate);
    }

    let query = format!(
        "SELECT {} FROM ticker_aggregates WHERE ticker = ?",
        AGGREGATE_COLUMNS
    );
    let existing = sqlx::query(&query)
        .bind(ticker)
        .fetch_optional(&mut *conn)
        .await?;

    let mut aggregate = match existing {
        Some(row) => aggregate_from_row(&row)?,
        None => TickerAggregate::new(ticker, now),
    };
    aggregate.fold(source, analysis, now);

    sqlx::query(
        "INSERT INTO ticker_aggregates \
         (ticker, mention_count, avg_sentiment, reddit_mentions, reddit_sentiment, \
          twitter_mentions, twitter_sentiment, summary, key_themes, last_updated, \
          last_calculated) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(ticker) DO UPDATE SET \
          mention_count = excluded.mention_count, \
          avg_sentiment = excluded.avg_sentiment, \
          reddit_mentions = excluded.reddit_mentions, \
          reddit_sentiment = excluded.reddit_sentiment, \
          twitter_mentions = excluded.twitter_mentions, \
          twitter_sentiment = excluded.twitter_sentiment, \
          summary = excluded.summary, \
          key_themes = excluded.key_themes, \
          last_updated = excluded.last_updated, \
          last_calculated = excluded.last_calculated",
    )
    .bind(&aggregate.ticker)
    .bind(aggregate.mention_count)
    .bind(aggregate.avg_sentiment)
    .bind(aggregate.reddit.mentions)
    .bind(aggregate.reddit.avg_sentiment)
    .bind(aggregate.twitter.mentions)
    .bind(aggregate.twitter.avg_sentiment)
    .bind(&aggregate.summary)
    .bind(serde_json::to_string(&aggregate.key_themes)?)
    .bind(aggregate.last_updated.timestamp())
    .bind(now.timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(MentionOutcome::Applied(aggregate))
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_themes(raw: Option<String>) -> Result<Vec<String>, CoreError> {
    match raw {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(Vec::new()),
    }
}

fn post_from_row(row: &SqliteRow) -> Result<AnalyzedPost, CoreError> {
    let source: String = row.try_get("source")?;
    let post = RawPost {
        id: row.try_get("id")?,
        source: Source::from_str(&source)?,
        author: row.try_get("author")?,
        body: row.try_get("body")?,
        created_at: from_timestamp(row.try_get("created_utc")?),
        score: row.try_get("score")?,
        comment_count: row.try_get("comment_count")?,
        parent_id: row.try_get("parent_id")?,
        channel: row.try_get("channel")?,
        permalink: row.try_get("permalink")?,
    };

    let analyzed_at: Option<i64> = row.try_get("analyzed_at")?;
    let analysis = match analyzed_at {
        Some(_) => {
            let label: Option<String> = row.try_get("sentiment_label")?;
            let score: f64 = row.try_get::<Option<f64>, _>("sentiment_score")?.unwrap_or(0.0);
            Some(PostAnalysis {
                ticker: row.try_get("ticker")?,
                sentiment_score: score,
                sentiment_label: match label {
                    Some(label) => SentimentLabel::from_str(&label)?,
                    None => SentimentLabel::from_score(score),
                },
                confidence: row.try_get::<Option<f64>, _>("confidence")?.unwrap_or(0.0),
                key_themes: parse_themes(row.try_get("key_themes")?)?,
                actionability_score: row
                    .try_get::<Option<f64>, _>("actionability_score")?
                    .unwrap_or(0.0),
                has_catalyst: row.try_get::<Option<bool>, _>("has_catalyst")?.unwrap_or(false),
                reasoning: row.try_get::<Option<String>, _>("reasoning")?.unwrap_or_default(),
            })
        }
        None => None,
    };

    Ok(AnalyzedPost {
        post,
        analysis,
        provenance: row.try_get("analysis_source")?,
        analyzed_at: analyzed_at.map(from_timestamp),
    })
}

fn aggregate_from_row(row: &SqliteRow) -> Result<TickerAggregate, CoreError> {
    Ok(TickerAggregate {
        ticker: row.try_get("ticker")?,
        mention_count: row.try_get("mention_count")?,
        avg_sentiment: row.try_get("avg_sentiment")?,
        reddit: SourceBreakdown {
            mentions: row.try_get("reddit_mentions")?,
            avg_sentiment: row.try_get("reddit_sentiment")?,
        },
        twitter: SourceBreakdown {
            mentions: row.try_get("twitter_mentions")?,
            avg_sentiment: row.try_get("twitter_sentiment")?,
        },
        last_updated: from_timestamp(row.try_get("last_updated")?),
        summary: row.try_get("summary")?,
        key_themes: parse_themes(row.try_get("key_themes")?)?,
    })
}
