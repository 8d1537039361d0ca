//! Circuit breakers and graceful degradation
//!
//! A breaker guards calls to one named dependency (e.g. "database",
//! "external-api"). State lives in the shared store so every process sees the
//! same open/closed decision.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  N consecutive failures  ┌─────────┐  recovery timeout  ┌──────────┐
//! │ Closed  │ ───────────────────────► │  Open   │ ─────────────────► │ HalfOpen │
//! └─────────┘                          └─────────┘                    └──────────┘
//!      ▲                                    ▲                               │
//!      │            probe success           │        probe failure          │
//!      └────────────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! In HALF_OPEN exactly one probe is admitted; everyone else keeps failing
//! fast until the probe reports back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::store::{BreakerRow, StoreError, TaskStore};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,

    /// Failure threshold exceeded, calls fail fast
    Open,

    /// Recovery timeout elapsed, one probe allowed through
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

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(format!("unknown circuit state: {other}")),
        }
    }
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use taskflow_core::breaker::BreakerConfig;
/// use std::time::Duration;
///
/// let config = BreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_recovery_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before admitting a half-open probe
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Error types for breaker operations
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    /// Circuit is open; fail fast without calling the dependency
    #[error("circuit breaker open: {0}")]
    Open(String),

    /// Half-open with the probe already in flight
    #[error("circuit breaker half-open, probe in flight: {0}")]
    ProbeInFlight(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Permit that must report the outcome of the guarded call
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,

    /// This permit is the half-open probe
    probing: bool,
}

impl BreakerPermit<'_> {
    /// Report the call succeeded
    pub async fn success(self) -> Result<(), BreakerError> {
        self.breaker.record_success(self.probing).await
    }

    /// Report the call failed
    pub async fn failure(self) -> Result<(), BreakerError> {
        self.breaker.record_failure(self.probing).await
    }
}

/// Store-backed circuit breaker for one named dependency
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new("external-api", BreakerConfig::default(), store);
///
/// match breaker.acquire().await {
///     Ok(permit) => match call_external().await {
///         Ok(out) => { permit.success().await?; out }
///         Err(e) => { permit.failure().await?; return Err(e.into()) }
///     },
///     Err(BreakerError::Open(_)) => return Err(CoreError::BreakerOpen("external-api".into())),
///     Err(e) => return Err(e.into()),
/// }
/// ```
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    store: Arc<dyn TaskStore>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, initializing the row on first use
    pub async fn state(&self) -> Result<CircuitState, BreakerError> {
        Ok(self.load().await?.state)
    }

    /// Ask to make a call through the breaker
    ///
    /// Returns a permit that must be resolved with `success` or `failure`.
    pub async fn acquire(&self) -> Result<BreakerPermit<'_>, BreakerError> {
        let row = self.load().await?;

        match row.state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                probing: false,
            }),
            CircuitState::Open => {
                // The claim is atomic: one caller wins the probe.
                if self
                    .store
                    .claim_probe(&self.name, self.config.recovery_timeout)
                    .await?
                {
                    debug!(breaker = %self.name, "admitting half-open probe");
                    Ok(BreakerPermit {
                        breaker: self,
                        probing: true,
                    })
                } else {
                    Err(BreakerError::Open(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if row.probe_in_flight {
                    Err(BreakerError::ProbeInFlight(self.name.clone()))
                } else {
                    // Previous probe resolved without closing (shouldn't
                    // normally happen); admit a fresh one.
                    Ok(BreakerPermit {
                        breaker: self,
                        probing: true,
                    })
                }
            }
        }
    }

    async fn load(&self) -> Result<BreakerRow, BreakerError> {
        match self.store.get_breaker(&self.name).await? {
            Some(row) => Ok(row),
            None => {
                let row = BreakerRow::closed(&self.name);
                self.store.put_breaker(&row).await?;
                Ok(row)
            }
        }
    }

    async fn record_success(&self, probing: bool) -> Result<(), BreakerError> {
        let mut row = self.load().await?;

        if probing || row.state != CircuitState::Closed {
            info!(breaker = %self.name, "probe succeeded, closing circuit");
        }
        row.state = CircuitState::Closed;
        row.failure_count = 0;
        row.opened_at = None;
        row.probe_in_flight = false;
        row.updated_at = Utc::now();
        self.store.put_breaker(&row).await?;
        Ok(())
    }

    async fn record_failure(&self, probing: bool) -> Result<(), BreakerError> {
        let mut row = self.load().await?;

        if probing || row.state == CircuitState::HalfOpen {
            warn!(breaker = %self.name, "probe failed, reopening circuit");
            row.state = CircuitState::Open;
            row.opened_at = Some(Utc::now());
            row.failure_count = 0;
            row.probe_in_flight = false;
        } else {
            row.failure_count += 1;
            if row.failure_count >= self.config.failure_threshold {
                warn!(
                    breaker = %self.name,
                    failures = row.failure_count,
                    "failure threshold reached, opening circuit"
                );
                row.state = CircuitState::Open;
                row.opened_at = Some(Utc::now());
                row.failure_count = 0;
            }
        }
        row.updated_at = Utc::now();
        self.store.put_breaker(&row).await?;
        Ok(())
    }

    /// Force the breaker closed (admin operation)
    pub async fn reset(&self) -> Result<(), BreakerError> {
        let row = BreakerRow::closed(&self.name);
        self.store.put_breaker(&row).await?;
        Ok(())
    }
}

/// Degradation strategy options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationStrategy {
    /// Serve the last known good result
    ReturnCached,

    /// Serve a default value without calling the dependency
    DefaultValue,

    /// Skip non-critical enrichment steps
    SkipEnrichment,

    /// Cap the task admission rate at the submit boundary
    ReduceThroughput,

    /// Process asynchronously instead of inline
    AsyncFallback,

    /// Route work to the low-priority fallback queue
    QueueToFallback,
}

/// Degradation signals shared through the broker fabric
///
/// The dispatch loop consults these flags before calling a dependency; a
/// reduce-throughput flag installs an admission cap that the submit boundary
/// enforces.
pub struct GracefulDegradation {
    broker: Arc<dyn Broker>,
}

impl GracefulDegradation {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Flag a dependency as degraded for `ttl`
    pub async fn mark_degraded(
        &self,
        dependency: &str,
        strategy: DegradationStrategy,
        ttl: Duration,
    ) -> Result<(), crate::broker::BrokerError> {
        info!(%dependency, ?strategy, ttl_secs = ttl.as_secs(), "dependency marked degraded");
        self.broker.mark_degraded(dependency, strategy, ttl).await
    }

    /// Active strategy for a dependency, if any
    pub async fn strategy_for(
        &self,
        dependency: &str,
    ) -> Result<Option<DegradationStrategy>, crate::broker::BrokerError> {
        self.broker.degradation(dependency).await
    }

    /// Clear a degradation flag
    pub async fn clear(&self, dependency: &str) -> Result<(), crate::broker::BrokerError> {
        self.broker.clear_degraded(dependency).await
    }

    /// Install a tasks-per-minute admission cap
    pub async fn reduce_throughput(
        &self,
        per_minute: u32,
        ttl: Duration,
    ) -> Result<(), crate::broker::BrokerError> {
        info!(per_minute, "throughput cap installed");
        self.broker.set_throughput_cap(per_minute, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn breaker_with(threshold: u32, recovery: Duration) -> CircuitBreaker {
        let store = Arc::new(MemoryStore::new());
        CircuitBreaker::new(
            "test-dep",
            BreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(recovery),
            store,
        )
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = breaker_with(3, Duration::from_millis(100));
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let breaker = breaker_with(3, Duration::from_millis(100));
        let permit = breaker.acquire().await.unwrap();
        permit.success().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = breaker_with(3, Duration::from_millis(100));

        for _ in 0..3 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure().await.unwrap();
        }

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(matches!(
            breaker.acquire().await,
            Err(BreakerError::Open(_))
        ));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker_with(3, Duration::from_millis(100));

        for _ in 0..2 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure().await.unwrap();
        }
        let permit = breaker.acquire().await.unwrap();
        permit.success().await.unwrap();

        // Two more failures stay below the consecutive threshold
        for _ in 0..2 {
            let permit = breaker.acquire().await.unwrap();
            permit.failure().await.unwrap();
        }
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_probe_after_recovery() {
        let breaker = breaker_with(1, Duration::from_millis(20));

        let permit = breaker.acquire().await.unwrap();
        permit.failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // First caller wins the probe; second fails fast
        let probe = breaker.acquire().await.unwrap();
        assert!(matches!(
            breaker.acquire().await,
            Err(BreakerError::ProbeInFlight(_))
        ));

        probe.success().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = breaker_with(1, Duration::from_millis(20));

        let permit = breaker.acquire().await.unwrap();
        permit.failure().await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let probe = breaker.acquire().await.unwrap();
        probe.failure().await.unwrap();

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(matches!(
            breaker.acquire().await,
            Err(BreakerError::Open(_))
        ));
    }

    #[tokio::test]
    async fn test_no_call_before_recovery_timeout() {
        let breaker = breaker_with(1, Duration::from_secs(60));

        let permit = breaker.acquire().await.unwrap();
        permit.failure().await.unwrap();

        assert!(matches!(
            breaker.acquire().await,
            Err(BreakerError::Open(_))
        ));
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = breaker_with(1, Duration::from_secs(60));
        let permit = breaker.acquire().await.unwrap();
        permit.failure().await.unwrap();

        breaker.reset().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_degradation_signals() {
        let broker = Arc::new(crate::broker::MemoryBroker::new());
        let degradation = GracefulDegradation::new(broker.clone());

        degradation
            .mark_degraded(
                "email",
                DegradationStrategy::SkipEnrichment,
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        assert_eq!(
            degradation.strategy_for("email").await.unwrap(),
            Some(DegradationStrategy::SkipEnrichment)
        );

        degradation.clear("email").await.unwrap();
        assert_eq!(degradation.strategy_for("email").await.unwrap(), None);
    }
}
