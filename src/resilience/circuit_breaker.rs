//! Rolling-window circuit breaker with single-trial HALF_OPEN recovery.
//!
//! Three states: Closed (normal operation, outcomes feed a rolling 60s
//! window), Open (fail fast), HalfOpen (exactly one trial call in flight,
//! admitted by compare-and-swap so no lock is ever held across the call).
//! Re-opening after a failed trial backs off exponentially (1s, 2s, 4s,
//! capped); the ladder resets once a trial succeeds and the circuit closes.

use crate::config::BreakerSettings;
use crate::error::{DbAccessError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // default to the safest state
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub window: Duration,
    pub failure_rate_threshold: f64,
    pub minimum_samples: u32,
    pub open_cooldown: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            window: Duration::from_millis(settings.window_ms),
            failure_rate_threshold: settings.failure_rate_threshold,
            minimum_samples: settings.minimum_samples,
            open_cooldown: Duration::from_millis(settings.open_cooldown_ms),
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

/// Point-in-time view for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub window_failures: u32,
    pub window_total: u32,
    pub backoff_exponent: u32,
    pub retry_in_ms: Option<u64>,
}

struct BreakerInner {
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    next_retry_at: Option<Instant>,
    backoff_exponent: u32,
}

enum Admission {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    trial_in_flight: AtomicBool,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        debug!(
            breaker = %name,
            window_ms = config.window.as_millis() as u64,
            failure_rate_threshold = config.failure_rate_threshold,
            "circuit breaker initialized"
        );
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            trial_in_flight: AtomicBool::new(false),
            inner: Mutex::new(BreakerInner {
                outcomes: VecDeque::new(),
                opened_at: None,
                next_retry_at: None,
                backoff_exponent: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Execute an operation under breaker protection. Returns the
    /// operation's own error on failure, or `CircuitOpen` when rejected
    /// without running it.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (result, _) = self.call_with_transition(operation).await;
        result
    }

    /// Like [`CircuitBreaker::call`], additionally reporting an alert
    /// message when this call transitioned the breaker to Open.
    pub async fn call_with_transition<F, Fut, T>(&self, operation: F) -> (Result<T>, Option<String>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = match self.try_admit() {
            Ok(admission) => admission,
            Err(e) => return (Err(e), None),
        };

        let result = operation().await;
        let opened_message = match &result {
            Ok(_) => {
                self.record_success(&admission);
                None
            }
            Err(_) => self.record_failure(&admission),
        };
        (result, opened_message)
    }

    fn rejection(&self) -> DbAccessError {
        DbAccessError::CircuitOpen {
            role: self.name.clone(),
        }
    }

    fn try_admit(&self) -> Result<Admission> {
        match self.state() {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let cooled_down = {
                    let inner = self.inner.lock();
                    inner
                        .next_retry_at
                        .is_some_and(|at| Instant::now() >= at)
                };
                if !cooled_down {
                    return Err(self.rejection());
                }
                // Cooldown elapsed: move to HalfOpen and race for the trial
                // slot. Losers keep failing fast.
                self.state
                    .store(CircuitState::HalfOpen as u8, Ordering::Release);
                info!(breaker = %self.name, "circuit breaker half-open, admitting one trial call");
                self.claim_trial()
            }
            CircuitState::HalfOpen => self.claim_trial(),
        }
    }

    fn claim_trial(&self) -> Result<Admission> {
        if self
            .trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.rejection());
        }
        // The previous trial may have resolved between our state read and
        // the CAS: a failed one re-opened the circuit (its backoff must not
        // be skipped), a successful one closed it.
        match self.state() {
            CircuitState::HalfOpen => Ok(Admission::Trial),
            CircuitState::Closed => {
                self.trial_in_flight.store(false, Ordering::Release);
                Ok(Admission::Normal)
            }
            CircuitState::Open => {
                self.trial_in_flight.store(false, Ordering::Release);
                Err(self.rejection())
            }
        }
    }

    fn record_success(&self, admission: &Admission) {
        match admission {
            Admission::Trial => {
                let mut inner = self.inner.lock();
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.next_retry_at = None;
                inner.backoff_exponent = 0;
                drop(inner);
                self.state
                    .store(CircuitState::Closed as u8, Ordering::Release);
                self.trial_in_flight.store(false, Ordering::Release);
                info!(breaker = %self.name, "circuit breaker closed after successful trial");
            }
            Admission::Normal => {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                inner.outcomes.push_back((now, true));
                Self::prune(&mut inner.outcomes, now, self.config.window);
            }
        }
    }

    /// Returns the alert message when this failure opened the circuit.
    fn record_failure(&self, admission: &Admission) -> Option<String> {
        match admission {
            Admission::Trial => {
                let mut inner = self.inner.lock();
                inner.backoff_exponent += 1;
                let delay = self.backoff_delay(inner.backoff_exponent);
                let now = Instant::now();
                inner.opened_at = Some(now);
                inner.next_retry_at = Some(now + delay);
                drop(inner);
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                self.trial_in_flight.store(false, Ordering::Release);
                warn!(
                    breaker = %self.name,
                    retry_in_ms = delay.as_millis() as u64,
                    "trial call failed, circuit breaker re-opened"
                );
                None
            }
            Admission::Normal => {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                inner.outcomes.push_back((now, false));
                Self::prune(&mut inner.outcomes, now, self.config.window);

                let total = inner.outcomes.len() as u32;
                let failures =
                    inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                let rate = f64::from(failures) / f64::from(total.max(1));
                if total >= self.config.minimum_samples
                    && rate >= self.config.failure_rate_threshold
                    && self.state() == CircuitState::Closed
                {
                    inner.opened_at = Some(now);
                    inner.next_retry_at = Some(now + self.config.open_cooldown);
                    inner.backoff_exponent = 0;
                    drop(inner);
                    self.state.store(CircuitState::Open as u8, Ordering::Release);
                    error!(
                        breaker = %self.name,
                        failures,
                        total,
                        "failure rate over threshold, circuit breaker opened"
                    );
                    Some(format!(
                        "circuit breaker opened for {}: {failures}/{total} calls failed in window",
                        self.name
                    ))
                } else {
                    None
                }
            }
        }
    }

    fn backoff_delay(&self, exponent: u32) -> Duration {
        let base_ms = self.config.base_backoff.as_millis() as u64;
        let shifted = base_ms.saturating_mul(1_u64 << exponent.saturating_sub(1).min(16));
        Duration::from_millis(shifted).min(self.config.max_backoff)
    }

    fn prune(outcomes: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
        while let Some((at, _)) = outcomes.front() {
            if now.duration_since(*at) >= window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            window_failures: inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32,
            window_total: inner.outcomes.len() as u32,
            backoff_exponent: inner.backoff_exponent,
            retry_in_ms: inner.next_retry_at.map(|at| {
                at.saturating_duration_since(now).as_millis() as u64
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::sleep;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window: Duration::from_secs(5),
            failure_rate_threshold: 0.5,
            minimum_samples: 4,
            open_cooldown: Duration::from_millis(60),
            base_backoff: Duration::from_millis(40),
            max_backoff: Duration::from_millis(200),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<&'static str> {
        breaker
            .call(|| async { Err::<&'static str, _>(DbAccessError::Database("boom".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<&'static str> {
        breaker.call(|| async { Ok("ok") }).await
    }

    #[tokio::test]
    async fn stays_closed_under_low_volume_failures() {
        let breaker = CircuitBreaker::new("primary".into(), fast_config());
        // Below minimum samples: 100% failure rate but no trip.
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_at_half_failure_rate() {
        let breaker = CircuitBreaker::new("primary".into(), fast_config());
        let _ = succeed(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker).await; // 2 failures / 4 calls = 50%
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fails fast without executing.
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(DbAccessError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn open_transition_reports_alert_message() {
        let breaker = CircuitBreaker::new("replica:r1".into(), fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        let (result, opened) = breaker
            .call_with_transition(|| async {
                Err::<(), _>(DbAccessError::Database("boom".into()))
            })
            .await;
        assert!(result.is_err());
        let message = opened.expect("fourth failure must trip the breaker");
        assert!(message.contains("replica:r1"));
    }

    #[tokio::test]
    async fn recovers_through_successful_trial() {
        let breaker = CircuitBreaker::new("primary".into(), fast_config());
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await; // past open_cooldown
        let result = succeed(&breaker).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        // Window was reset; a single failure cannot re-trip.
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_reopens_with_backoff_ladder() {
        let breaker = CircuitBreaker::new("primary".into(), fast_config());
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        let _ = fail(&breaker).await; // trial fails
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().backoff_exponent, 1);
        // Not yet past the 40ms backoff.
        assert!(matches!(
            succeed(&breaker).await,
            Err(DbAccessError::CircuitOpen { .. })
        ));

        sleep(Duration::from_millis(60)).await;
        let _ = fail(&breaker).await; // second trial fails, backoff doubles
        assert_eq!(breaker.snapshot().backoff_exponent, 2);

        sleep(Duration::from_millis(100)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().backoff_exponent, 0);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_trial() {
        let mut config = fast_config();
        config.open_cooldown = Duration::from_millis(20);
        let breaker = Arc::new(CircuitBreaker::new("primary".into(), config));
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        sleep(Duration::from_millis(40)).await;

        // Many concurrent callers race for the single trial slot; the trial
        // itself is slow so the others must all be rejected.
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            tasks.push(tokio::spawn(async move {
                breaker
                    .call(|| async {
                        sleep(Duration::from_millis(50)).await;
                        Ok::<_, DbAccessError>("ok")
                    })
                    .await
            }));
        }
        let mut admitted = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(DbAccessError::CircuitOpen { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(rejected, 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_backoff_blocks_racing_callers() {
        let mut config = fast_config();
        config.open_cooldown = Duration::from_millis(20);
        config.base_backoff = Duration::from_millis(500);
        config.max_backoff = Duration::from_millis(500);
        let breaker = Arc::new(CircuitBreaker::new("primary".into(), config));
        let executions = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        sleep(Duration::from_millis(40)).await;

        // Callers hammer the breaker while the single failing trial runs
        // and re-opens it. Only the trial itself may execute; the 500ms
        // backoff covers the rest of the test, so a second execution means
        // a racer slipped past the re-opened circuit.
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            let executions = Arc::clone(&executions);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let executions = Arc::clone(&executions);
                    let _ = breaker
                        .call(move || async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(10)).await;
                            Err::<(), _>(DbAccessError::Database("boom".into()))
                        })
                        .await;
                    sleep(Duration::from_millis(2)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn backoff_ladder_doubles_and_caps() {
        let breaker = CircuitBreaker::new("primary".into(), fast_config());
        assert_eq!(breaker.backoff_delay(1), Duration::from_millis(40));
        assert_eq!(breaker.backoff_delay(2), Duration::from_millis(80));
        assert_eq!(breaker.backoff_delay(3), Duration::from_millis(160));
        assert_eq!(breaker.backoff_delay(4), Duration::from_millis(200));
        assert_eq!(breaker.backoff_delay(30), Duration::from_millis(200));
    }
}
