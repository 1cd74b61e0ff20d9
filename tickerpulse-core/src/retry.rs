use crate::{CoreError, ErrorExt, LlmError, SocialApiError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per operation, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Consecutive failed operations before the circuit opens
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a trial request
    pub recovery_timeout_s: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            failure_threshold: 5,
            recovery_timeout_s: 60,
        }
    }
}

impl RetryConfig {
    /// Retry config for the LLM classifier. Fails over to the keyword
    /// fallback quickly, so attempts are few and the breaker trips early.
    pub fn llm() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            failure_threshold: 3,
            recovery_timeout_s: 300,
        }
    }

    /// Retry config for social platform listing endpoints
    pub fn social() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            failure_threshold: 3,
            recovery_timeout_s: 120,
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerState {
    Closed,   // Normal operation
    Open,     // Blocking requests
    HalfOpen, // Testing recovery
}

/// Circuit breaker for preventing cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    config: RetryConfig,
}

impl CircuitBreaker {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            config,
        }
    }

    /// Check if a request should be allowed
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                let recovery_duration = Duration::from_secs(self.config.recovery_timeout_s);
                match self.last_failure_time {
                    Some(last_failure) if last_failure.elapsed() >= recovery_duration => {
                        debug!("Circuit breaker transitioning to half-open for recovery test");
                        self.state = CircuitBreakerState::HalfOpen;
                        true
                    }
                    _ => false,
                }
            }
            CircuitBreakerState::HalfOpen => true,
        }
    }

    /// Record a successful request
    pub fn record_success(&mut self) {
        if self.state == CircuitBreakerState::HalfOpen {
            info!("Circuit breaker recovery successful, returning to closed state");
            self.state = CircuitBreakerState::Closed;
            self.last_failure_time = None;
        }
        self.failure_count = 0;
    }

    /// Record a failed request
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        match self.state {
            CircuitBreakerState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker opening due to {} consecutive failures",
                        self.failure_count
                    );
                    self.state = CircuitBreakerState::Open;
                }
            }
            CircuitBreakerState::HalfOpen => {
                warn!("Circuit breaker recovery failed, returning to open state");
                self.state = CircuitBreakerState::Open;
            }
            CircuitBreakerState::Open => {}
        }
    }

    pub fn get_state(&self) -> CircuitBreakerState {
        self.state.clone()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Retry strategy based on error type
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff
    Retry,
    /// Retry after a delay dictated by the remote side
    RetryWithDelay(Duration),
    /// Don't retry (for permanent failures)
    NoRetry,
}

/// Determine retry strategy based on error type
pub fn get_retry_strategy(error: &CoreError) -> RetryStrategy {
    match error {
        CoreError::SocialApi(SocialApiError::RateLimitExceeded { retry_after })
        | CoreError::Llm(LlmError::RateLimitExceeded { retry_after, .. }) => {
            RetryStrategy::RetryWithDelay(Duration::from_secs(*retry_after))
        }
        _ if error.is_retryable() => RetryStrategy::Retry,
        _ => RetryStrategy::NoRetry,
    }
}

/// Calculate delay with exponential backoff and jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_delay = Duration::from_millis(config.base_delay_ms);
    let max_delay = Duration::from_millis(config.max_delay_ms);

    let exponential_delay = if attempt == 0 {
        base_delay
    } else {
        let multiplier = config.backoff_multiplier.powi(attempt as i32);
        let delay_ms = (config.base_delay_ms as f64 * multiplier) as u64;
        Duration::from_millis(delay_ms.min(config.max_delay_ms))
    };

    let jitter_range = (exponential_delay.as_millis() as f64 * config.jitter_factor) as u64;
    let jitter = fastrand::u64(0..=jitter_range);
    let final_delay = exponential_delay + Duration::from_millis(jitter);

    final_delay.min(max_delay)
}

/// Retry metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct RetryMetrics {
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
    pub circuit_breaker_trips: u64,
    pub average_retry_delay_ms: f64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wraps operations with bounded retries and a shared circuit breaker
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    metrics: Arc<Mutex<RetryMetrics>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        let circuit_breaker = Arc::new(Mutex::new(CircuitBreaker::new(config.clone())));
        let metrics = Arc::new(Mutex::new(RetryMetrics::default()));

        Self {
            config,
            circuit_breaker,
            metrics,
        }
    }

    /// Execute an operation with retry logic.
    ///
    /// Returns `CoreError::CircuitOpen` without calling `operation` while the
    /// breaker is open; otherwise the last error once attempts run out.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        if !lock(&self.circuit_breaker).allow_request() {
            lock(&self.metrics).circuit_breaker_trips += 1;
            warn!(
                "Circuit breaker is open, blocking request for {}",
                operation_name
            );
            return Err(CoreError::CircuitOpen {
                operation: operation_name.to_string(),
            });
        }

        let mut total_delay_ms = 0u64;
        let mut attempt = 0u32;

        let last_error = loop {
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt, operation_name);
            }

            let start_time = Instant::now();
            let error = match operation().await {
                Ok(result) => {
                    lock(&self.circuit_breaker).record_success();

                    if attempt > 0 {
                        let mut metrics = lock(&self.metrics);
                        metrics.successful_retries += 1;
                        metrics.average_retry_delay_ms = (metrics.average_retry_delay_ms
                            * (metrics.successful_retries - 1) as f64
                            + total_delay_ms as f64)
                            / metrics.successful_retries as f64;

                        info!(
                            "Operation {} succeeded after {} retries (total delay: {}ms)",
                            operation_name, attempt, total_delay_ms
                        );
                    }

                    return Ok(result);
                }
                Err(error) => error,
            };

            debug!(
                "Attempt {} failed for {} after {:?}: {}",
                attempt + 1,
                operation_name,
                start_time.elapsed(),
                error
            );

            let has_attempts_left = attempt + 1 < self.config.max_attempts;
            let delay = match get_retry_strategy(&error) {
                RetryStrategy::Retry if has_attempts_left => calculate_delay(attempt, &self.config),
                RetryStrategy::RetryWithDelay(delay) if has_attempts_left => {
                    delay.min(Duration::from_millis(self.config.max_delay_ms))
                }
                RetryStrategy::NoRetry => {
                    debug!(
                        "Not retrying {} due to error type: {}",
                        operation_name, error
                    );
                    break error;
                }
                _ => {
                    debug!("Max retry attempts reached for {}", operation_name);
                    break error;
                }
            };

            info!(
                "Retrying {} in {:?} due to: {}",
                operation_name, delay, error
            );
            total_delay_ms += delay.as_millis() as u64;
            lock(&self.metrics).total_retries += 1;
            sleep(delay).await;
            attempt += 1;
        };

        lock(&self.circuit_breaker).record_failure();
        lock(&self.metrics).failed_operations += 1;

        error!(
            "Operation {} failed after {} attempt(s) with total delay of {}ms: {}",
            operation_name,
            attempt + 1,
            total_delay_ms,
            last_error
        );

        Err(last_error)
    }

    /// Get current retry metrics
    pub fn get_metrics(&self) -> RetryMetrics {
        lock(&self.metrics).clone()
    }

    /// Get current circuit breaker state
    pub fn get_circuit_breaker_state(&self) -> CircuitBreakerState {
        lock(&self.circuit_breaker).get_state()
    }

    pub fn reset_metrics(&self) {
        *lock(&self.metrics) = RetryMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> CoreError {
        CoreError::Llm(LlmError::ServerError {
            provider: "openai".to_string(),
            status_code: 500,
        })
    }

    #[test]
    fn test_retry_config_llm() {
        let config = RetryConfig::llm();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.failure_threshold, 3);
        assert!(config.jitter_factor <= 1.0);
    }

    #[test]
    fn test_circuit_breaker_failure_threshold() {
        let config = RetryConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let config = RetryConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn test_circuit_breaker_recovery() {
        let config = RetryConfig {
            failure_threshold: 1,
            recovery_timeout_s: 0,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(config);

        breaker.record_failure();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Open);

        std::thread::sleep(Duration::from_millis(1));
        assert!(breaker.allow_request());
        assert_eq!(breaker.get_state(), CircuitBreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.get_state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_retry_strategy_for_errors() {
        let rate_limit = CoreError::Llm(LlmError::RateLimitExceeded {
            provider: "openai".to_string(),
            retry_after: 20,
        });
        assert_eq!(
            get_retry_strategy(&rate_limit),
            RetryStrategy::RetryWithDelay(Duration::from_secs(20))
        );

        let bad_key = CoreError::Llm(LlmError::InvalidApiKey {
            provider: "openai".to_string(),
        });
        assert_eq!(get_retry_strategy(&bad_key), RetryStrategy::NoRetry);

        assert_eq!(get_retry_strategy(&server_error()), RetryStrategy::Retry);

        let social = CoreError::SocialApi(SocialApiError::ServerError { status_code: 502 });
        assert_eq!(get_retry_strategy(&social), RetryStrategy::Retry);
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(calculate_delay(0, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(4000));
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(10000));
    }

    #[tokio::test]
    async fn test_retry_executor_success_after_retries() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        });

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = executor
            .execute("classify", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(server_error())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let metrics = executor.get_metrics();
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.successful_retries, 1);
    }

    #[tokio::test]
    async fn test_retry_executor_returns_last_error() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..Default::default()
        });

        let result: Result<i32, CoreError> =
            executor.execute("classify", || async { Err(server_error()) }).await;

        assert!(matches!(
            result,
            Err(CoreError::Llm(LlmError::ServerError {
                status_code: 500,
                ..
            }))
        ));
        assert_eq!(executor.get_metrics().failed_operations, 1);
    }

    #[tokio::test]
    async fn test_retry_executor_no_retry_on_auth_error() {
        let executor = RetryExecutor::new(RetryConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = executor
            .execute("classify", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, CoreError>(CoreError::Llm(LlmError::AuthenticationFailed {
                        provider: "openai".to_string(),
                    }))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_executor_circuit_breaker() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 1,
            failure_threshold: 2,
            base_delay_ms: 1,
            ..Default::default()
        });

        for _ in 0..2 {
            let result: Result<i32, CoreError> =
                executor.execute("classify", || async { Err(server_error()) }).await;
            assert!(result.is_err());
        }

        assert_eq!(
            executor.get_circuit_breaker_state(),
            CircuitBreakerState::Open
        );

        let blocked = executor
            .execute("classify", || async { Ok::<i32, CoreError>(42) })
            .await;
        assert!(matches!(blocked, Err(CoreError::CircuitOpen { .. })));
        assert_eq!(executor.get_metrics().circuit_breaker_trips, 1);
    }
}
