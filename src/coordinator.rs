//! # Market Data Coordinator
//!
//! Presents a single request surface over N registered information
//! providers. Each call is routed to one provider chosen by the configured
//! load-balancing policy, dispatched with retry and per-attempt timeouts,
//! and, when the primary path is exhausted, failed over once to another
//! capable provider. Provider health (EMA response time, weight,
//! consecutive errors) and per-provider circuit breakers gate selection;
//! a background task probes every provider on a fixed interval.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::config::{Config, DataProviderConfig};
use crate::errors::CoordinatorError;
use crate::metrics;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

//================================================================================================//
//                                         CONSTANTS                                             //
//================================================================================================//

/// First retry backoff; doubles per attempt up to the cap.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const BACKOFF_JITTER: f64 = 0.1;

/// Probe failures before a provider is marked unhealthy.
const UNHEALTHY_PROBE_THRESHOLD: u32 = 3;

/// EMA smoothing factor for response times.
const EMA_ALPHA: f64 = 0.2;

const WEIGHT_FLOOR: f64 = 0.1;
const WEIGHT_CEIL: f64 = 2.0;
const WEIGHT_UP: f64 = 1.1;
const WEIGHT_DOWN: f64 = 0.8;

//================================================================================================//
//                                       PUBLIC TYPES                                             //
//================================================================================================//

/// What a provider can answer. Capabilities are advertised at registration
/// and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Pricing,
    MarketData,
    Trending,
    BlockchainRead,
    Bridges,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Pricing => "pricing",
            Capability::MarketData => "market-data",
            Capability::Trending => "trending",
            Capability::BlockchainRead => "blockchain-read",
            Capability::Bridges => "bridges",
        }
    }
}

/// Priority tier: lower is more preferred.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderTier {
    Critical,
    #[default]
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Fastest,
    Priority,
    Weighted,
}

/// Per-call overrides; `None` falls back to the coordinator defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteOptions {
    pub retries: Option<u32>,
    pub failover: Option<bool>,
}

/// The seam every external information provider implements.
#[async_trait]
pub trait DataProvider: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn capabilities(&self) -> &[Capability];
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoordinatorError>;
    /// Lightweight liveness check used by the health monitor.
    async fn probe(&self) -> Result<(), CoordinatorError>;
}

/// Mutable health record per provider. Weight moves multiplicatively:
/// ×1.1 on success (capped), ×0.8 on failure (floored); recovery resets it.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub ema_response_ms: f64,
    pub last_probe: Option<Instant>,
    pub weight: f64,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_errors: 0,
            ema_response_ms: 0.0,
            last_probe: None,
            weight: 1.0,
        }
    }
}

impl ProviderHealth {
    fn record_success(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000.0;
        self.ema_response_ms = if self.ema_response_ms == 0.0 {
            sample
        } else {
            (1.0 - EMA_ALPHA) * self.ema_response_ms + EMA_ALPHA * sample
        };
        self.weight = (self.weight * WEIGHT_UP).min(WEIGHT_CEIL);
    }

    fn record_failure(&mut self) {
        self.weight = (self.weight * WEIGHT_DOWN).max(WEIGHT_FLOOR);
    }
}

/// Snapshot for the operator status surface.
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub name: String,
    pub tier: ProviderTier,
    pub healthy: bool,
    pub breaker_open: bool,
    pub ema_response_ms: f64,
    pub weight: f64,
    pub in_flight: usize,
}

//================================================================================================//
//                                     REGISTERED PROVIDER                                        //
//================================================================================================//

struct RegisteredProvider {
    provider: Arc<dyn DataProvider>,
    tier: ProviderTier,
    call_timeout: Duration,
    concurrency: Semaphore,
    in_flight: AtomicUsize,
    health: RwLock<ProviderHealth>,
    breaker: CircuitBreaker,
}

impl Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("name", &self.provider.name())
            .field("tier", &self.tier)
            .finish()
    }
}

impl RegisteredProvider {
    fn supports(&self, capability: Capability) -> bool {
        self.provider.capabilities().contains(&capability)
    }
}

//================================================================================================//
//                                        COORDINATOR                                             //
//================================================================================================//

pub struct DataCoordinator {
    providers: Vec<Arc<RegisteredProvider>>,
    policy: LoadBalancingPolicy,
    default_retries: u32,
    failover_enabled: bool,
    probe_interval: Duration,
    /// Per-capability rotation cursor for the round-robin policy.
    cursors: Mutex<HashMap<Capability, usize>>,
    /// Monotonic cursor for deterministic weighted sampling.
    weighted_cursor: AtomicU64,
    telemetry: Arc<TelemetrySink>,
}

impl Debug for DataCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCoordinator")
            .field("providers", &self.providers.len())
            .field("policy", &self.policy)
            .finish()
    }
}

pub struct DataCoordinatorBuilder {
    policy: LoadBalancingPolicy,
    default_retries: u32,
    failover_enabled: bool,
    breaker_threshold: u64,
    breaker_cooldown: Duration,
    probe_interval: Duration,
    telemetry: Arc<TelemetrySink>,
    providers: Vec<Arc<RegisteredProvider>>,
}

impl DataCoordinatorBuilder {
    pub fn new(telemetry: Arc<TelemetrySink>) -> Self {
        Self {
            policy: LoadBalancingPolicy::default(),
            default_retries: 3,
            failover_enabled: true,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            telemetry,
            providers: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, telemetry: Arc<TelemetrySink>) -> Self {
        Self {
            policy: config.load_balancing,
            default_retries: config.route_retries,
            failover_enabled: config.failover,
            breaker_threshold: config.circuit_breaker_threshold,
            breaker_cooldown: Duration::from_millis(config.circuit_breaker_cooldown_ms),
            probe_interval: Duration::from_millis(config.health_probe_interval_ms),
            telemetry,
            providers: Vec::new(),
        }
    }

    pub fn policy(mut self, policy: LoadBalancingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn failover(mut self, enabled: bool) -> Self {
        self.failover_enabled = enabled;
        self
    }

    pub fn breaker(mut self, threshold: u64, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn register(
        mut self,
        provider: Arc<dyn DataProvider>,
        tier: ProviderTier,
        call_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        let name = provider.name().to_string();
        self.providers.push(Arc::new(RegisteredProvider {
            provider,
            tier,
            call_timeout,
            concurrency: Semaphore::new(max_concurrency.max(1)),
            in_flight: AtomicUsize::new(0),
            health: RwLock::new(ProviderHealth::default()),
            breaker: CircuitBreaker::new(name, self.breaker_threshold, self.breaker_cooldown),
        }));
        self
    }

    pub fn register_http(self, config: &DataProviderConfig) -> Self {
        let tier = config.priority;
        let call_timeout = Duration::from_millis(config.timeout_ms);
        let max_concurrency = config.max_concurrency;
        let provider: Arc<dyn DataProvider> = Arc::new(HttpDataProvider::new(config));
        self.register(provider, tier, call_timeout, max_concurrency)
    }

    pub fn build(self) -> DataCoordinator {
        info!(
            providers = self.providers.len(),
            policy = ?self.policy,
            "market data coordinator ready"
        );
        DataCoordinator {
            providers: self.providers,
            policy: self.policy,
            default_retries: self.default_retries,
            failover_enabled: self.failover_enabled,
            probe_interval: self.probe_interval,
            cursors: Mutex::new(HashMap::new()),
            weighted_cursor: AtomicU64::new(0),
            telemetry: self.telemetry,
        }
    }
}

impl DataCoordinator {
    /// Route a single request to one capable provider and return its reply.
    ///
    /// Terminal errors are returned only once both the primary path (with
    /// retries) and, when enabled, a single failover provider are exhausted.
    #[instrument(skip(self, params, options), fields(capability = capability.as_str(), method = %method))]
    pub async fn route(
        &self,
        capability: Capability,
        method: &str,
        params: Value,
        options: RouteOptions,
    ) -> Result<Value, CoordinatorError> {
        if !self.providers.iter().any(|p| p.supports(capability)) {
            return Err(CoordinatorError::UnsupportedCapability(capability));
        }

        let retries = options.retries.unwrap_or(self.default_retries);
        let failover = options.failover.unwrap_or(self.failover_enabled);

        let candidates = self.eligible(capability).await;
        let Some(primary) = self.select(capability, &candidates).await else {
            return Err(CoordinatorError::Exhausted {
                capability,
                attempts: 0,
            });
        };

        let mut attempts = 0u32;
        match self
            .dispatch_with_retry(&primary, capability, method, &params, retries, &mut attempts)
            .await
        {
            Ok(value) => return Ok(value),
            Err(primary_err) => {
                if !failover {
                    debug!(provider = primary.provider.name(), error = %primary_err, "primary path exhausted, failover disabled");
                    return Err(CoordinatorError::Exhausted {
                        capability,
                        attempts,
                    });
                }
                // One alternative provider, one attempt; failover never
                // recurses into another failover.
                let candidates = self.eligible(capability).await;
                let alternative = candidates
                    .into_iter()
                    .find(|p| !Arc::ptr_eq(p, &primary));
                match alternative {
                    Some(alt) => {
                        warn!(
                            from = primary.provider.name(),
                            to = alt.provider.name(),
                            error = %primary_err,
                            "failing over"
                        );
                        self.dispatch_with_retry(&alt, capability, method, &params, 0, &mut attempts)
                            .await
                            .map_err(|_| CoordinatorError::Exhausted {
                                capability,
                                attempts,
                            })
                    }
                    None => Err(CoordinatorError::Exhausted {
                        capability,
                        attempts,
                    }),
                }
            }
        }
    }

    /// Providers able to take traffic: capability match, healthy, and either
    /// breaker closed or past its retry gate.
    async fn eligible(&self, capability: Capability) -> Vec<Arc<RegisteredProvider>> {
        let mut out = Vec::new();
        for p in self.providers.iter().filter(|p| p.supports(capability)) {
            if !p.health.read().await.healthy {
                continue;
            }
            if !p.breaker.allows_request().await {
                continue;
            }
            out.push(p.clone());
        }
        out
    }

    /// Pick one provider from the (registration-ordered) candidate set.
    /// All policies break ties by registration order, keeping selection
    /// deterministic for a given state.
    async fn select(
        &self,
        capability: Capability,
        candidates: &[Arc<RegisteredProvider>],
    ) -> Option<Arc<RegisteredProvider>> {
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self.policy {
            LoadBalancingPolicy::RoundRobin => {
                let mut cursors = self.cursors.lock().await;
                let cursor = cursors.entry(capability).or_insert(0);
                let pick = candidates[*cursor % candidates.len()].clone();
                *cursor = cursor.wrapping_add(1);
                pick
            }
            LoadBalancingPolicy::LeastLoaded => candidates
                .iter()
                .min_by_key(|p| p.in_flight.load(Ordering::Relaxed))?
                .clone(),
            LoadBalancingPolicy::Fastest => {
                let mut best: Option<(f64, &Arc<RegisteredProvider>)> = None;
                for p in candidates {
                    let ema = p.health.read().await.ema_response_ms;
                    match best {
                        Some((current, _)) if ema >= current => {}
                        _ => best = Some((ema, p)),
                    }
                }
                best?.1.clone()
            }
            LoadBalancingPolicy::Priority => candidates.iter().min_by_key(|p| p.tier)?.clone(),
            LoadBalancingPolicy::Weighted => {
                // Deterministic rotation through the cumulative weight
                // table: over W requests a provider with weight w receives
                // ~w/W of them, with no RNG on the request path.
                let mut scaled = Vec::with_capacity(candidates.len());
                let mut total = 0u64;
                for p in candidates {
                    let w = (p.health.read().await.weight * 1_000.0) as u64;
                    let w = w.max(1);
                    total += w;
                    scaled.push((total, p));
                }
                let point = self.weighted_cursor.fetch_add(1, Ordering::Relaxed) % total.max(1);
                scaled
                    .iter()
                    .find(|(cum, _)| point < *cum)
                    .map(|(_, p)| (*p).clone())?
            }
        };
        Some(chosen)
    }

    async fn dispatch_with_retry(
        &self,
        registered: &Arc<RegisteredProvider>,
        capability: Capability,
        method: &str,
        params: &Value,
        retries: u32,
        attempts: &mut u32,
    ) -> Result<Value, CoordinatorError> {
        let mut last_err: Option<CoordinatorError> = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                let exp = BACKOFF_BASE.as_millis() as u64 * (1u64 << (attempt - 1).min(20));
                let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
                let jitter = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0.0..BACKOFF_JITTER) * capped as f64
                };
                tokio::time::sleep(Duration::from_millis(capped + jitter as u64)).await;
            }

            if !registered.breaker.allows_request().await {
                last_err = Some(CoordinatorError::BreakerOpen {
                    provider: registered.provider.name().to_string(),
                });
                break;
            }

            *attempts += 1;
            match self.dispatch_once(registered, capability, method, params).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(
                        provider = registered.provider.name(),
                        attempt,
                        error = %e,
                        "provider call failed"
                    );
                    let tripped = self.record_failure(registered, &e).await;
                    last_err = Some(e);
                    if tripped {
                        // The breaker just opened; further retries against
                        // this provider cannot proceed.
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(CoordinatorError::Exhausted {
            capability,
            attempts: *attempts,
        }))
    }

    async fn dispatch_once(
        &self,
        registered: &Arc<RegisteredProvider>,
        capability: Capability,
        method: &str,
        params: &Value,
    ) -> Result<Value, CoordinatorError> {
        let _permit = registered.concurrency.acquire().await.map_err(|_| {
            CoordinatorError::Transient {
                provider: registered.provider.name().to_string(),
                message: "concurrency limiter closed".to_string(),
            }
        })?;

        registered.in_flight.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = timeout(
            registered.call_timeout,
            registered.provider.call(method, params.clone()),
        )
        .await;
        registered.in_flight.fetch_sub(1, Ordering::Relaxed);

        let elapsed = started.elapsed();
        metrics::ROUTE_LATENCY_MS
            .with_label_values(&[registered.provider.name(), capability.as_str()])
            .observe(elapsed.as_secs_f64() * 1_000.0);

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(registered, elapsed).await;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoordinatorError::Timeout {
                provider: registered.provider.name().to_string(),
                timeout_ms: registered.call_timeout.as_millis() as u64,
            }),
        }
    }

    async fn record_success(&self, registered: &Arc<RegisteredProvider>, elapsed: Duration) {
        registered.health.write().await.record_success(elapsed);
        if registered.breaker.record_success().await {
            self.telemetry.emit(TelemetryEvent::BreakerClosed {
                subject: registered.provider.name().to_string(),
            });
        }
    }

    /// Returns true when this failure tripped the provider's breaker open.
    async fn record_failure(
        &self,
        registered: &Arc<RegisteredProvider>,
        error: &CoordinatorError,
    ) -> bool {
        metrics::ROUTE_FAILURES
            .with_label_values(&[
                registered.provider.name(),
                match error {
                    CoordinatorError::Timeout { .. } => "timeout",
                    CoordinatorError::RateLimited { .. } => "rate_limited",
                    CoordinatorError::ProviderConfig { .. } => "config",
                    _ => "transient",
                },
            ])
            .inc();

        registered.health.write().await.record_failure();
        if error.counts_against_provider() && registered.breaker.record_failure().await {
            self.telemetry.emit(TelemetryEvent::BreakerOpened {
                subject: registered.provider.name().to_string(),
            });
            return true;
        }
        false
    }

    /// Background probe loop. A provider is marked unhealthy after three
    /// consecutive probe failures and recovers (weight reset to 1.0) on the
    /// first success; a probe success also closes the provider's breaker.
    pub fn spawn_health_monitor(self: Arc<Self>, cancel: CancellationToken) {
        for registered in self.providers.iter().cloned() {
            let coordinator = self.clone();
            let cancel = cancel.clone();
            let interval = self.probe_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    coordinator.probe_one(&registered).await;
                }
                debug!(provider = registered.provider.name(), "health monitor stopped");
            });
        }
    }

    async fn probe_one(&self, registered: &Arc<RegisteredProvider>) {
        let result = timeout(registered.call_timeout, registered.provider.probe()).await;
        let ok = matches!(result, Ok(Ok(())));
        let mut health = registered.health.write().await;
        health.last_probe = Some(Instant::now());
        if ok {
            health.consecutive_errors = 0;
            if !health.healthy {
                health.healthy = true;
                health.weight = 1.0;
                info!(provider = registered.provider.name(), "provider recovered");
                self.telemetry.emit(TelemetryEvent::ProviderHealthChanged {
                    provider: registered.provider.name().to_string(),
                    healthy: true,
                });
            }
            drop(health);
            if registered.breaker.record_success().await {
                self.telemetry.emit(TelemetryEvent::BreakerClosed {
                    subject: registered.provider.name().to_string(),
                });
            }
        } else {
            health.consecutive_errors = health.consecutive_errors.saturating_add(1);
            if health.healthy && health.consecutive_errors >= UNHEALTHY_PROBE_THRESHOLD {
                health.healthy = false;
                warn!(
                    provider = registered.provider.name(),
                    errors = health.consecutive_errors,
                    "provider marked unhealthy"
                );
                self.telemetry.emit(TelemetryEvent::ProviderHealthChanged {
                    provider: registered.provider.name().to_string(),
                    healthy: false,
                });
            }
        }
    }

    pub async fn provider_stats(&self) -> Vec<ProviderStats> {
        let mut out = Vec::with_capacity(self.providers.len());
        for p in &self.providers {
            let health = p.health.read().await.clone();
            out.push(ProviderStats {
                name: p.provider.name().to_string(),
                tier: p.tier,
                healthy: health.healthy,
                breaker_open: p.breaker.is_open().await,
                ema_response_ms: health.ema_response_ms,
                weight: health.weight,
                in_flight: p.in_flight.load(Ordering::Relaxed),
            });
        }
        out
    }
}

//================================================================================================//
//                                     HTTP PROVIDER                                              //
//================================================================================================//

/// A JSON-over-HTTP information provider. Methods map to path segments
/// under the configured base URL; parameters travel as the POST body.
#[derive(Debug)]
pub struct HttpDataProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    capabilities: Vec<Capability>,
    client: reqwest::Client,
}

impl HttpDataProvider {
    pub fn new(config: &DataProviderConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|env| std::env::var(env).ok());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent("flasharb/0.4")
            .build()
            .unwrap_or_default();
        Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            capabilities: config.capabilities.clone(),
            client,
        }
    }
}

#[async_trait]
impl DataProvider for HttpDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, CoordinatorError> {
        let url = format!("{}/{}", self.base_url, method);
        let mut request = self.client.post(&url).json(&params);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| CoordinatorError::Transient {
            provider: self.name.clone(),
            message: format!("request failed: {}", e),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CoordinatorError::RateLimited {
                provider: self.name.clone(),
            });
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::ProviderConfig {
                provider: self.name.clone(),
                message: format!("{}: {}", status, body),
            });
        }
        if !status.is_success() {
            return Err(CoordinatorError::Transient {
                provider: self.name.clone(),
                message: format!("server error {}", status),
            });
        }

        response.json().await.map_err(|e| CoordinatorError::Transient {
            provider: self.name.clone(),
            message: format!("malformed response: {}", e),
        })
    }

    async fn probe(&self) -> Result<(), CoordinatorError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            CoordinatorError::Transient {
                provider: self.name.clone(),
                message: format!("probe failed: {}", e),
            }
        })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CoordinatorError::Transient {
                provider: self.name.clone(),
                message: format!("probe status {}", response.status()),
            })
        }
    }
}

//================================================================================================//
//                                           TESTS                                                //
//================================================================================================//

#[cfg(test)]
pub mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Scriptable in-memory provider: fails the first `fail_first` calls,
    /// then succeeds, echoing its own name.
    #[derive(Debug)]
    pub struct ScriptedProvider {
        name: String,
        capabilities: Vec<Capability>,
        pub calls: AtomicU32,
        pub probes: AtomicU32,
        fail_first: u32,
        probe_ok: std::sync::atomic::AtomicBool,
    }

    impl ScriptedProvider {
        pub fn new(name: &str, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                capabilities: vec![Capability::Pricing],
                calls: AtomicU32::new(0),
                probes: AtomicU32::new(0),
                fail_first,
                probe_ok: std::sync::atomic::AtomicBool::new(true),
            })
        }

        pub fn set_probe_ok(&self, ok: bool) {
            self.probe_ok.store(ok, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DataProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }

        async fn call(&self, _method: &str, _params: Value) -> Result<Value, CoordinatorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(CoordinatorError::Transient {
                    provider: self.name.clone(),
                    message: "scripted failure".to_string(),
                })
            } else {
                Ok(json!({ "provider": self.name }))
            }
        }

        async fn probe(&self) -> Result<(), CoordinatorError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CoordinatorError::Transient {
                    provider: self.name.clone(),
                    message: "probe down".to_string(),
                })
            }
        }
    }

    fn coordinator_with(
        providers: Vec<Arc<ScriptedProvider>>,
        policy: LoadBalancingPolicy,
        retries: u32,
        failover: bool,
    ) -> Arc<DataCoordinator> {
        let telemetry = Arc::new(TelemetrySink::new());
        let mut builder = DataCoordinatorBuilder::new(telemetry)
            .policy(policy)
            .retries(retries)
            .failover(failover)
            .breaker(5, Duration::from_secs(60));
        for p in providers {
            builder = builder.register(p, ProviderTier::High, Duration::from_millis(500), 4);
        }
        Arc::new(builder.build())
    }

    #[tokio::test]
    async fn round_robin_rotates_deterministically() {
        let p1 = ScriptedProvider::new("p1", 0);
        let p2 = ScriptedProvider::new("p2", 0);
        let coordinator = coordinator_with(
            vec![p1.clone(), p2.clone()],
            LoadBalancingPolicy::RoundRobin,
            0,
            false,
        );

        for _ in 0..4 {
            coordinator
                .route(Capability::Pricing, "prices", json!({}), RouteOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(p1.calls.load(Ordering::SeqCst), 2);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsupported_capability_is_terminal() {
        let coordinator =
            coordinator_with(vec![ScriptedProvider::new("p1", 0)], LoadBalancingPolicy::RoundRobin, 0, true);
        let err = coordinator
            .route(
                Capability::Bridges,
                "routes",
                json!({}),
                RouteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnsupportedCapability(_)));
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_traffic_fails_over() {
        // p1 always fails; threshold 5 means its breaker opens during the
        // first routed call's retry ladder (retries are immediate siblings
        // here because attempt backoff starts at 1s; keep retries at 0 and
        // issue calls in a loop instead).
        let p1 = ScriptedProvider::new("p1", u32::MAX);
        let p2 = ScriptedProvider::new("p2", 0);
        let coordinator = coordinator_with(
            vec![p1.clone(), p2.clone()],
            LoadBalancingPolicy::Priority,
            0,
            true,
        );

        // Priority policy always picks p1 (registration order tie-break)
        // until its breaker opens; failover keeps every call answered.
        for _ in 0..6 {
            let value = coordinator
                .route(Capability::Pricing, "prices", json!({}), RouteOptions::default())
                .await
                .unwrap();
            assert_eq!(value["provider"], "p2");
        }
        // Five failures opened p1's breaker; the sixth call skipped it.
        assert_eq!(p1.calls.load(Ordering::SeqCst), 5);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn least_loaded_prefers_registration_order_on_ties() {
        let p1 = ScriptedProvider::new("p1", 0);
        let p2 = ScriptedProvider::new("p2", 0);
        let coordinator = coordinator_with(
            vec![p1.clone(), p2.clone()],
            LoadBalancingPolicy::LeastLoaded,
            0,
            false,
        );
        coordinator
            .route(Capability::Pricing, "prices", json!({}), RouteOptions::default())
            .await
            .unwrap();
        assert_eq!(p1.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn weight_moves_with_outcomes() {
        let p1 = ScriptedProvider::new("p1", 1);
        let coordinator = coordinator_with(vec![p1], LoadBalancingPolicy::RoundRobin, 0, false);

        // First call fails: weight 1.0 -> 0.8.
        let _ = coordinator
            .route(Capability::Pricing, "prices", json!({}), RouteOptions::default())
            .await;
        let stats = coordinator.provider_stats().await;
        assert!((stats[0].weight - 0.8).abs() < 1e-9);

        // Next call succeeds: 0.8 * 1.1 = 0.88.
        coordinator
            .route(Capability::Pricing, "prices", json!({}), RouteOptions::default())
            .await
            .unwrap();
        let stats = coordinator.provider_stats().await;
        assert!((stats[0].weight - 0.88).abs() < 1e-9);
    }
}
