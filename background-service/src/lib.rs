//! Daily in-process scheduler and the external cron trigger.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use sentiment_engine::IngestionPipeline;
use std::future::Future;
use std::sync::Arc;
use tickerpulse_core::{CoreError, ErrorExt};
use tracing::{info, warn};

pub mod trigger;

/// Next occurrence of `hour_utc:00:00` strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, hour_utc: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour_utc.min(23), 0, 0).unwrap_or_default();
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// Runs the ingestion pipeline once a day at a fixed UTC hour.
#[derive(Debug)]
pub struct DailyScheduler {
    pipeline: Arc<IngestionPipeline>,
    hour_utc: u32,
}

impl DailyScheduler {
    pub fn new(pipeline: Arc<IngestionPipeline>, hour_utc: u32) -> Self {
        Self { pipeline, hour_utc }
    }

    /// Loops until `shutdown` resolves. A run that overlaps an HTTP-triggered
    /// one is skipped.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.hour_utc);
            let wait = (next - now).to_std().unwrap_or_default();
            info!("Next scheduled ingestion at {}", next.to_rfc3339());

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.pipeline.run().await {
                Ok(report) => info!(
                    "Scheduled ingestion done: {} data points, {} top posts",
                    report.data_points, report.top_posts
                ),
                Err(CoreError::Conflict { .. }) => {
                    warn!("Scheduled ingestion skipped, a run is already in progress")
                }
                Err(e) => {
                    e.log_error();
                }
            }
        }
    }
}
