use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tickerpulse_core::CoreError;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub time_window: Duration,
    pub burst_allowance: u32,
}

impl RateLimitConfig {
    pub fn reddit_oauth() -> Self {
        Self {
            max_requests: 100, // OAuth clients get 100 requests per minute
            time_window: Duration::from_secs(60),
            burst_allowance: 10,
        }
    }

    /// Unauthenticated `.json` listings are throttled far more aggressively.
    pub fn reddit_public() -> Self {
        Self {
            max_requests: 10,
            time_window: Duration::from_secs(60),
            burst_allowance: 3,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.burst_allowance as f64;
        let refill_rate = config.max_requests as f64 / config.time_window.as_secs_f64();

        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes `tokens_needed` tokens, or returns how long to wait for them.
    pub async fn acquire(&self, tokens_needed: f64) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= tokens_needed {
            state.tokens -= tokens_needed;
            Ok(())
        } else {
            let missing = tokens_needed - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    pub async fn get_available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    token_bucket: TokenBucket,
    semaphore: Arc<Semaphore>,
    config: RateLimitConfig,
    window_tracker: Mutex<WindowTracker>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.burst_allowance as usize));
        let token_bucket = TokenBucket::new(&config);
        let window_tracker = Mutex::new(WindowTracker::new(config.time_window));

        Self {
            token_bucket,
            semaphore,
            config,
            window_tracker,
        }
    }

    pub async fn acquire_permit(&self) -> Result<RateLimitPermit, CoreError> {
        let start_time = Instant::now();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Internal {
                message: "rate limiter semaphore closed".to_string(),
            })?;

        loop {
            match self.token_bucket.acquire(1.0).await {
                Ok(()) => break,
                Err(wait_time) => {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    sleep(wait_time).await;
                }
            }
        }

        self.window_tracker.lock().await.record_request();

        Ok(RateLimitPermit {
            _permit: permit,
            queue_wait_time: start_time.elapsed(),
        })
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        let available_tokens = self.token_bucket.get_available_tokens().await;
        let window_stats = self.window_tracker.lock().await.get_current_window_stats();

        RateLimitStatus {
            available_tokens: available_tokens as u32,
            max_tokens: self.config.burst_allowance,
            requests_per_window: self.config.max_requests,
            current_window_requests: window_stats.request_count,
            window_start_time: window_stats.window_start,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    pub queue_wait_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub available_tokens: u32,
    pub max_tokens: u32,
    pub requests_per_window: u32,
    pub current_window_requests: u32,
    pub window_start_time: SystemTime,
}

impl RateLimitStatus {
    pub fn requests_remaining_in_window(&self) -> u32 {
        self.requests_per_window
            .saturating_sub(self.current_window_requests)
    }
}

#[derive(Debug)]
pub struct WindowTracker {
    window_duration: Duration,
    current_window: WindowStats,
}

#[derive(Debug, Clone)]
pub struct WindowStats {
    pub window_start: SystemTime,
    pub request_count: u32,
}

impl WindowTracker {
    pub fn new(window_duration: Duration) -> Self {
        Self {
            window_duration,
            current_window: WindowStats {
                window_start: SystemTime::now(),
                request_count: 0,
            },
        }
    }

    pub fn record_request(&mut self) {
        self.ensure_current_window();
        self.current_window.request_count += 1;
    }

    pub fn get_current_window_stats(&self) -> WindowStats {
        self.current_window.clone()
    }

    fn ensure_current_window(&mut self) {
        let now = SystemTime::now();
        let window_age = now
            .duration_since(self.current_window.window_start)
            .unwrap_or_default();

        if window_age >= self.window_duration {
            self.current_window = WindowStats {
                window_start: now,
                request_count: 0,
            };
        }
    }
}
