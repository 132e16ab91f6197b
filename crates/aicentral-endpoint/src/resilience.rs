use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::client::{TransportError, UpstreamClient, UpstreamRequest, UpstreamResponse};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Fraction of sampled calls that must fail before the breaker opens.
    pub failure_ratio: f64,
    /// Rolling window over which samples are kept.
    pub sampling_window: Duration,
    /// Minimum samples in the window before the ratio is evaluated.
    pub min_throughput: usize,
    /// How long the breaker stays open before a half-open probe.
    pub break_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(5),
            min_throughput: 10,
            break_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    samples: VecDeque<(Instant, bool)>,
}

/// Failure-ratio circuit breaker over a rolling sample window.
///
/// Open means fail fast: callers get an immediate rejection and the selector
/// treats it as retryable, moving on to the next candidate.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Whether a call may proceed right now. In half-open state only a single
    /// probe is admitted.
    pub fn try_pass(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    info!(event = "breaker_half_open", endpoint = %self.name);
                    inner.state = BreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen {
                ref mut probe_in_flight,
            } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record(&self, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();

        while let Some((at, _)) = inner.samples.front().copied()
            && now.duration_since(at) > self.config.sampling_window
        {
            inner.samples.pop_front();
        }
        inner.samples.push_back((now, success));

        match inner.state {
            BreakerState::HalfOpen { .. } => {
                if success {
                    info!(event = "breaker_closed", endpoint = %self.name);
                    inner.state = BreakerState::Closed;
                    inner.samples.clear();
                } else {
                    info!(event = "breaker_reopened", endpoint = %self.name);
                    inner.state = BreakerState::Open {
                        until: now + self.config.break_duration,
                    };
                }
            }
            BreakerState::Closed => {
                let total = inner.samples.len();
                if total < self.config.min_throughput {
                    return;
                }
                let failures = inner.samples.iter().filter(|(_, ok)| !ok).count();
                if failures as f64 / total as f64 >= self.config.failure_ratio {
                    info!(
                        event = "breaker_opened",
                        endpoint = %self.name,
                        failures = failures,
                        sampled = total
                    );
                    inner.state = BreakerState::Open {
                        until: now + self.config.break_duration,
                    };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.lock().state, BreakerState::Open { until } if Instant::now() < until)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Bounded-concurrency gate: up to `max_concurrency` calls in flight, up to
/// `max_queue` more waiting, everything beyond rejected immediately.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    max_queue: usize,
}

impl Bulkhead {
    pub fn new(max_concurrency: usize, max_queue: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            waiting: AtomicUsize::new(0),
            max_queue,
        }
    }

    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Some(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_queue {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        let permit = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.ok()
    }
}

#[derive(Debug, Clone)]
pub struct ResiliencyConfig {
    /// Ceiling for a single attempt, not the whole retried call.
    pub attempt_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub breaker: BreakerConfig,
    /// Bulkhead; absent means unbounded concurrency.
    pub max_concurrency: Option<usize>,
    pub max_queue: usize,
}

impl Default for ResiliencyConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            breaker: BreakerConfig::default(),
            max_concurrency: None,
            max_queue: 16,
        }
    }
}

#[derive(Debug)]
pub enum ResilienceError {
    BreakerOpen,
    BulkheadFull,
    Transport(TransportError),
}

/// Per-endpoint wrapper around the physical call: bulkhead, then circuit
/// breaker, then retry with exponential backoff, then a per-attempt timeout.
pub struct ResiliencyStrategy {
    config: ResiliencyConfig,
    breaker: CircuitBreaker,
    bulkhead: Option<Bulkhead>,
}

impl ResiliencyStrategy {
    pub fn new(endpoint: &str, config: ResiliencyConfig) -> Self {
        let breaker = CircuitBreaker::new(endpoint, config.breaker.clone());
        let bulkhead = config
            .max_concurrency
            .map(|limit| Bulkhead::new(limit, config.max_queue));
        Self {
            config,
            breaker,
            bulkhead,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn execute(
        &self,
        client: &dyn UpstreamClient,
        req: UpstreamRequest,
    ) -> Result<UpstreamResponse, ResilienceError> {
        let _permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.acquire().await {
                Some(permit) => Some(permit),
                None => return Err(ResilienceError::BulkheadFull),
            },
            None => None,
        };

        if !self.breaker.try_pass() {
            return Err(ResilienceError::BreakerOpen);
        }

        let mut attempt = 1u32;
        let outcome = loop {
            let result =
                tokio::time::timeout(self.config.attempt_timeout, client.send(req.clone())).await;
            let result = match result {
                Ok(inner) => inner,
                Err(_) => Err(TransportError::timeout("attempt timed out")),
            };

            match result {
                Ok(resp) if resp.status != 429 => break Ok(resp),
                Ok(resp) => {
                    if attempt >= self.config.retry_max_attempts {
                        break Ok(resp);
                    }
                    debug!(event = "retrying_after_429", attempt = attempt);
                }
                Err(err) => {
                    if attempt >= self.config.retry_max_attempts {
                        break Err(err);
                    }
                    debug!(event = "retrying_after_transport_error", attempt = attempt, error = %err);
                }
            }

            let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        let success = match &outcome {
            Ok(resp) => resp.status < 500 && resp.status != 429 && resp.status != 408,
            Err(_) => false,
        };
        self.breaker.record(success);

        outcome.map_err(ResilienceError::Transport)
    }
}

impl std::fmt::Debug for ResiliencyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencyStrategy")
            .field("config", &self.config)
            .finish()
    }
}
