#[cfg(test)]
mod tests {
    use crate::{Database, MentionOutcome, PostFilter, PostSort};
    use chrono::{Duration, TimeZone, Utc};
    use std::env;
    use tickerpulse_core::{
        Classification, Company, FallbackReason, PostAnalysis, RawPost, SentimentLabel, Source,
        SourceSettings, WatchlistItem,
    };

    async fn setup_test_db() -> Database {
        let db_path =
            env::temp_dir().join(format!("test_tickerpulse_{}.db", uuid::Uuid::new_v4()));
        let db_url = format!("sqlite://{}", db_path.display());

        let db = Database::connect(&db_url, 2)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");

        db
    }

    fn post(id: &str, body: &str) -> RawPost {
        RawPost {
            id: id.to_string(),
            source: Source::Reddit,
            author: "trader42".to_string(),
            body: body.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            score: 10,
            comment_count: 2,
            parent_id: None,
            channel: Some("stocks".to_string()),
            permalink: None,
        }
    }

    fn analysis(ticker: &str, score: f64) -> PostAnalysis {
        PostAnalysis {
            ticker: Some(ticker.to_string()),
            sentiment_score: score,
            sentiment_label: SentimentLabel::from_score(score),
            confidence: 0.8,
            key_themes: vec!["earnings".to_string()],
            actionability_score: 0.4,
            has_catalyst: true,
            reasoning: "beat estimates".to_string(),
        }
    }

    #[tokio::test]
    async fn test_database_connection_and_migrations() {
        let db = setup_test_db().await;
        // Running twice must be a no-op.
        db.run_migrations().await.expect("Failed to re-run migrations");
    }

    #[tokio::test]
    async fn test_save_post_is_write_once() {
        let db = setup_test_db().await;
        let original = post("t3_abc", "first body");

        assert!(db.save_post(&original).await.unwrap());
        assert!(!db.save_post(&post("t3_abc", "edited body")).await.unwrap());

        let stored = db.get_post("t3_abc").await.unwrap().unwrap();
        assert_eq!(stored.post.body, "first body");
        assert_eq!(stored.post.created_at, original.created_at);
        assert!(stored.analysis.is_none());
    }

    #[tokio::test]
    async fn test_save_posts_counts_only_new_rows() {
        let db = setup_test_db().await;
        let batch = vec![post("t3_a", "a"), post("t3_b", "b")];
        assert_eq!(db.save_posts(&batch).await.unwrap(), 2);
        assert_eq!(
            db.save_posts(&[post("t3_b", "b"), post("t3_c", "c")]).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_analysis_is_written_once() {
        let db = setup_test_db().await;
        db.save_post(&post("t3_abc", "$AAPL to the moon")).await.unwrap();
        let now = Utc::now();

        let remote = Classification::Remote(analysis("AAPL", 0.7));
        assert!(db.save_analysis("t3_abc", &remote, now).await.unwrap());

        let fallback = Classification::Fallback {
            analysis: analysis("AAPL", -0.3),
            reason: FallbackReason::CircuitOpen,
        };
        assert!(!db.save_analysis("t3_abc", &fallback, now).await.unwrap());

        let stored = db.get_post("t3_abc").await.unwrap().unwrap();
        let stored_analysis = stored.analysis.unwrap();
        assert_eq!(stored_analysis.sentiment_score, 0.7);
        assert_eq!(stored_analysis.key_themes, vec!["earnings"]);
        assert!(stored_analysis.has_catalyst);
        assert_eq!(stored.provenance.as_deref(), Some("remote"));
        assert!(db.is_analyzed("t3_abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_analysis_for_unknown_post() {
        let db = setup_test_db().await;
        let remote = Classification::Remote(analysis("AAPL", 0.7));
        assert!(!db.save_analysis("missing", &remote, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_mention_running_mean() {
        let db = setup_test_db().await;
        let now = Utc::now();

        for (i, score) in [0.5, 0.3, -0.1].into_iter().enumerate() {
            let outcome = db
                .record_mention(&format!("p{}", i), Source::Reddit, &analysis("AAPL", score), now)
                .await
                .unwrap();
            assert!(matches!(outcome, MentionOutcome::Applied(_)));
        }

        let aggregate = db.get_aggregate("AAPL").await.unwrap().unwrap();
        assert_eq!(aggregate.mention_count, 3);
        assert!((aggregate.avg_sentiment - 0.7 / 3.0).abs() < 1e-9);
        assert_eq!(aggregate.reddit.mentions, 3);
        assert_eq!(aggregate.key_themes, vec!["earnings"]);
    }

    #[tokio::test]
    async fn test_record_mention_is_idempotent() {
        let db = setup_test_db().await;
        let now = Utc::now();

        db.record_mention("p1", Source::Reddit, &analysis("TSLA", 0.4), now)
            .await
            .unwrap();
        let second = db
            .record_mention("p1", Source::Reddit, &analysis("TSLA", 0.4), now)
            .await
            .unwrap();
        assert_eq!(second, MentionOutcome::Duplicate);

        let aggregate = db.get_aggregate("TSLA").await.unwrap().unwrap();
        assert_eq!(aggregate.mention_count, 1);
    }

    #[tokio::test]
    async fn test_record_mention_without_ticker() {
        let db = setup_test_db().await;
        let mut untagged = analysis("AAPL", 0.1);
        untagged.ticker = None;

        let outcome = db
            .record_mention("p1", Source::Reddit, &untagged, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, MentionOutcome::NoTicker);
        assert!(db.list_aggregates().await.unwrap().is_empty());
    }

    async fn analyzed_post(db: &Database, id: &str, ticker: &str, score: f64, age: Duration) {
        let mut p = post(id, "body");
        p.created_at = Utc::now() - age;
        db.save_post(&p).await.unwrap();
        db.save_analysis(id, &Classification::Remote(analysis(ticker, score)), Utc::now())
            .await
            .unwrap();
    }

    // Inserts `count` unanalyzed posts newer than anything else in the store.
    async fn seed_filler_posts(db: &Database, count: i64) {
        sqlx::query(
            "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < ?) \
             INSERT INTO raw_posts (id, source, author, body, created_utc, fetched_at) \
             SELECT 'filler_' || n, 'reddit', 'bot', 'no tickers here', ? + n, ? FROM seq",
        )
        .bind(count)
        .bind(Utc::now().timestamp())
        .bind(Utc::now().timestamp())
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_aggregates_resets_ledger() {
        let db = setup_test_db().await;
        let now = Utc::now();
        db.record_mention("p1", Source::Twitter, &analysis("NVDA", 0.2), now)
            .await
            .unwrap();

        // No stored analysis backs p1, so the rebuild drops it.
        assert!(db.rebuild_aggregates(None, now).await.unwrap().is_empty());
        assert!(db.get_aggregate("NVDA").await.unwrap().is_none());

        let again = db
            .record_mention("p1", Source::Twitter, &analysis("NVDA", 0.2), now)
            .await
            .unwrap();
        assert!(matches!(again, MentionOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn test_rebuild_aggregates_refolds_stored_analyses() {
        let db = setup_test_db().await;
        analyzed_post(&db, "t3_old", "AMD", -0.8, Duration::days(40)).await;
        analyzed_post(&db, "t3_new", "AMD", 0.4, Duration::hours(1)).await;
        db.save_post(&post("t3_pending", "unanalyzed")).await.unwrap();

        let outcomes = db
            .rebuild_aggregates(Some(Utc::now() - Duration::days(7)), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);

        let amd = db.get_aggregate("AMD").await.unwrap().unwrap();
        assert_eq!(amd.mention_count, 1);
        assert!((amd.avg_sentiment - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_rollups() {
        let db = setup_test_db().await;
        analyzed_post(&db, "t3_a", "AMD", 0.6, Duration::hours(3)).await;
        analyzed_post(&db, "t3_b", "ZZZ", -0.2, Duration::hours(1)).await;
        for id in ["t3_a", "t3_b"] {
            let stored = db.get_post(id).await.unwrap().unwrap();
            db.record_mention(id, Source::Reddit, stored.analysis.as_ref().unwrap(), Utc::now())
                .await
                .unwrap();
        }

        // AMD refolds first, then ZZZ aborts the rebuild halfway.
        sqlx::query(
            "CREATE TRIGGER reject_zzz BEFORE INSERT ON ticker_aggregates \
             WHEN NEW.ticker = 'ZZZ' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(db.rebuild_aggregates(None, Utc::now()).await.is_err());

        let amd = db.get_aggregate("AMD").await.unwrap().unwrap();
        assert_eq!(amd.mention_count, 1);
        assert!(db.get_aggregate("ZZZ").await.unwrap().is_some());
        let again = db
            .record_mention("t3_a", Source::Reddit, &analysis("AMD", 0.6), Utc::now())
            .await
            .unwrap();
        assert_eq!(again, MentionOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_query_posts_since() {
        let db = setup_test_db().await;
        let mut old = post("t3_old", "old");
        old.created_at = Utc::now() - Duration::days(10);
        let mut fresh = post("t3_new", "new");
        fresh.created_at = Utc::now() - Duration::hours(1);
        db.save_posts(&[old, fresh]).await.unwrap();

        let recent = PostFilter {
            since: Some(Utc::now() - Duration::days(1)),
            descending: true,
            ..PostFilter::default()
        };
        let slice = db.query_posts(&recent, 20, 0).await.unwrap();
        assert_eq!(slice.total, 1);
        assert_eq!(slice.posts[0].post.id, "t3_new");

        let all = PostFilter {
            descending: true,
            ..PostFilter::default()
        };
        let slice = db.query_posts(&all, 20, 0).await.unwrap();
        assert_eq!(slice.total, 2);
        assert_eq!(slice.posts[0].post.id, "t3_new");
    }

    #[tokio::test]
    async fn test_query_posts_filters_and_pages_in_sql() {
        let db = setup_test_db().await;
        analyzed_post(&db, "t3_a", "AAPL", 0.6, Duration::hours(3)).await;
        analyzed_post(&db, "t3_b", "AAPL", -0.5, Duration::hours(2)).await;
        analyzed_post(&db, "t3_c", "TSLA", 0.6, Duration::hours(1)).await;
        db.save_post(&post("t3_pending", "no analysis yet")).await.unwrap();

        let aapl = PostFilter {
            ticker: Some("AAPL".to_string()),
            sort: PostSort::Created,
            descending: true,
            ..PostFilter::default()
        };
        let first = db.query_posts(&aapl, 1, 0).await.unwrap();
        assert_eq!(first.total, 2);
        assert_eq!(first.posts[0].post.id, "t3_b");
        let second = db.query_posts(&aapl, 1, 1).await.unwrap();
        assert_eq!(second.posts[0].post.id, "t3_a");

        let negative = PostFilter {
            sentiment: Some(SentimentLabel::Negative),
            ..PostFilter::default()
        };
        let slice = db.query_posts(&negative, 20, 0).await.unwrap();
        assert_eq!(slice.total, 1);
        assert_eq!(slice.posts[0].post.id, "t3_b");

        let confident = PostFilter {
            min_confidence: Some(0.9),
            ..PostFilter::default()
        };
        assert_eq!(db.query_posts(&confident, 20, 0).await.unwrap().total, 0);

        let by_confidence = PostFilter {
            sort: PostSort::Confidence,
            ..PostFilter::default()
        };
        let slice = db.query_posts(&by_confidence, 20, 0).await.unwrap();
        assert_eq!(slice.total, 4);
        assert_eq!(slice.posts[0].post.id, "t3_pending");
    }

    #[tokio::test]
    async fn test_query_posts_beyond_five_thousand_rows() {
        let db = setup_test_db().await;
        analyzed_post(&db, "t3_aapl", "AAPL", 0.5, Duration::days(3)).await;
        seed_filler_posts(&db, 5_000).await;

        let aapl = PostFilter {
            ticker: Some("AAPL".to_string()),
            descending: true,
            ..PostFilter::default()
        };
        let slice = db.query_posts(&aapl, 20, 0).await.unwrap();
        assert_eq!(slice.total, 1);
        assert_eq!(slice.posts[0].post.id, "t3_aapl");

        let everything = db.query_posts(&PostFilter::default(), 100, 5_000).await.unwrap();
        assert_eq!(everything.total, 5_001);
        assert_eq!(everything.posts.len(), 1);
    }

    #[tokio::test]
    async fn test_companies_crud() {
        let db = setup_test_db().await;
        let company = Company {
            ticker: "AAPL".to_string(),
            name: "Apple".to_string(),
            sector: Some("Technology".to_string()),
            created_at: Utc::now(),
        };
        db.upsert_company(&company).await.unwrap();
        db.upsert_company(&Company {
            name: "Apple Inc".to_string(),
            ..company.clone()
        })
        .await
        .unwrap();

        let companies = db.list_companies().await.unwrap();
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].name, "Apple Inc");

        assert!(db.delete_company("AAPL").await.unwrap());
        assert!(!db.delete_company("AAPL").await.unwrap());
    }

    #[tokio::test]
    async fn test_watchlist_crud() {
        let db = setup_test_db().await;
        let item = WatchlistItem {
            ticker: "MSFT".to_string(),
            note: Some("cloud".to_string()),
            added_at: Utc::now(),
        };

        assert!(db.add_watchlist_item(&item).await.unwrap());
        assert!(!db.add_watchlist_item(&item).await.unwrap());
        assert_eq!(db.list_watchlist().await.unwrap().len(), 1);

        assert!(db.remove_watchlist_item("MSFT").await.unwrap());
        assert!(db.list_watchlist().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_basic_functionality() {
        let db = setup_test_db().await;

        db.save_setting("test_key", "test_value")
            .await
            .expect("Failed to save setting");
        db.save_setting("test_key", "updated")
            .await
            .expect("Failed to overwrite setting");
        let value = db
            .get_setting("test_key")
            .await
            .expect("Failed to get setting");
        assert_eq!(value.as_deref(), Some("updated"));
        assert!(db.get_setting("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_source_settings_round_trip() {
        let db = setup_test_db().await;
        let defaults = SourceSettings {
            subreddits: vec!["stocks".to_string()],
            post_limit: 25,
            comments_per_post: 5,
        };
        assert_eq!(db.get_source_settings(&defaults).await.unwrap(), defaults);

        let custom = SourceSettings {
            subreddits: vec!["investing".to_string(), "options".to_string()],
            post_limit: 50,
            comments_per_post: 0,
        };
        db.save_source_settings(&custom).await.unwrap();
        assert_eq!(db.get_source_settings(&defaults).await.unwrap(), custom);

        let invalid = SourceSettings {
            post_limit: 0,
            ..custom
        };
        assert!(db.save_source_settings(&invalid).await.is_err());
    }
}
