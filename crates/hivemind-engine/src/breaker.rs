//! Circuit breaker around agent steps and tool calls.
//!
//! Three states: closed (calls pass), open (calls fail fast until the
//! recovery timeout elapses), half-open (exactly one trial call decides).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use hivemind_core::config::CircuitConfig;
use hivemind_core::error::{HivemindError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_time: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_secs),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, promoting open to half-open once the window elapsed.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.window_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// Fails fast with [`HivemindError::CircuitOpen`] without invoking the
    /// operation while the circuit is open, or while another caller holds
    /// the half-open trial. `Cancelled` results are not counted.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire()?;
        let result = operation().await;
        if matches!(result, Err(HivemindError::Cancelled)) {
            // Left unsettled: the permit hands the trial slot back on drop.
            return result;
        }
        match &result {
            Ok(_) => self.on_success(),
            Err(e) => self.on_failure(permit.trial, e),
        }
        permit.settled = true;
        result
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                if self.window_elapsed(&inner) {
                    info!(circuit = %self.name, "Circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                } else {
                    Err(self.open_error(&inner))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(HivemindError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after_ms: 0,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, "Circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self, trial: bool, error: &HivemindError) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Utc::now());
        inner.trial_in_flight = false;

        let trip = trial
            || inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.failure_threshold;
        if trip {
            if inner.state != CircuitState::Open {
                warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    error = %error,
                    "Circuit opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn window_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.recovery_timeout)
    }

    fn open_error(&self, inner: &BreakerState) -> HivemindError {
        let remaining = inner
            .opened_at
            .map(|at| self.recovery_timeout.saturating_sub(at.elapsed()))
            .unwrap_or_default();
        HivemindError::CircuitOpen {
            name: self.name.clone(),
            retry_after_ms: remaining.as_millis() as u64,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the half-open trial slot if the operation is dropped mid-flight.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

/// Named breakers, one per protected operation (`agent:<id>`, `tool:<name>`).
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created on first use.
    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(name, &self.config)))
            .clone()
    }

    pub async fn for_agent(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        self.get(&format!("agent:{}", agent_id)).await
    }

    pub async fn for_tool(&self, tool: &str) -> Arc<CircuitBreaker> {
        self.get(&format!("tool:{}", tool)).await
    }

    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .breakers
            .read()
            .await
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
