//! # Engine Wiring & Lifecycle
//!
//! Builds the process-wide singletons (coordinator, telemetry, risk
//! supervisor, queue) once at startup, wires per-chain infrastructure
//! (client, scanner, executor), and owns the shutdown sequence: scanners
//! stop emitting first, the queue stops admitting, in-flight executions run
//! to their own terminal state, then tasks are joined in reverse order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blockchain::{ChainClient, EvmChainClient};
use crate::config::Config;
use crate::coordinator::{DataCoordinator, DataCoordinatorBuilder};
use crate::errors::{ConfigError, EngineError};
use crate::executor::{ExecutorSettings, FlashLoanExecutor};
use crate::flash_loan::FlashLoanRegistry;
use crate::price_oracle::PriceOracle;
use crate::queue::ExecutionQueue;
use crate::risk::RiskSupervisor;
use crate::scanner::{OpportunityScanner, ScannerSettings};
use crate::telemetry::TelemetrySink;
use crate::types::ChainRegistry;
use crate::venues::VenueRegistry;

struct ChainInfra {
    scanner: Arc<OpportunityScanner>,
    executor: Arc<FlashLoanExecutor>,
}

pub struct ArbEngine {
    config: Arc<Config>,
    registry: Arc<ChainRegistry>,
    coordinator: Arc<DataCoordinator>,
    oracle: Arc<PriceOracle>,
    queue: Arc<ExecutionQueue>,
    risk: Arc<RiskSupervisor>,
    telemetry: Arc<TelemetrySink>,
    simulation_mode: Arc<AtomicBool>,
    cancel: CancellationToken,
    infras: HashMap<u64, ChainInfra>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ArbEngine {
    /// Production construction: chain clients from RPC endpoints and the
    /// operator wallet, data providers from config.
    pub fn new(config: Arc<Config>) -> Result<Self, EngineError> {
        let registry = Arc::new(ChainRegistry::from_config(&config)?);
        let telemetry = Arc::new(TelemetrySink::new());

        let mut builder = DataCoordinatorBuilder::from_config(&config, telemetry.clone());
        for provider in config.data_providers.iter().filter(|p| p.enabled) {
            builder = builder.register_http(provider);
        }
        let coordinator = Arc::new(builder.build());

        let wallet_key = std::env::var(&config.operator.wallet_key_env).map_err(|_| {
            ConfigError::Invalid(format!(
                "operator wallet key env `{}` is not set",
                config.operator.wallet_key_env
            ))
        })?;

        let mut clients: HashMap<u64, Arc<dyn ChainClient>> = HashMap::new();
        for chain in registry.chains() {
            let client = EvmChainClient::new(
                chain,
                &wallet_key,
                config.operator.private_relay_url.as_deref(),
            )?;
            clients.insert(chain.chain_id, Arc::new(client));
        }

        Self::with_components(config, registry, coordinator, telemetry, clients)
    }

    /// Wiring entry shared by production and the test harness, which
    /// injects in-memory chain clients and scripted data providers.
    pub fn with_components(
        config: Arc<Config>,
        registry: Arc<ChainRegistry>,
        coordinator: Arc<DataCoordinator>,
        telemetry: Arc<TelemetrySink>,
        clients: HashMap<u64, Arc<dyn ChainClient>>,
    ) -> Result<Self, EngineError> {
        let venues = Arc::new(VenueRegistry::from_registry(&registry));
        let flash_loans = Arc::new(FlashLoanRegistry::from_registry(
            &registry,
            config.circuit_breaker_threshold,
            Duration::from_millis(config.circuit_breaker_cooldown_ms),
        ));
        let oracle = Arc::new(PriceOracle::new(
            coordinator.clone(),
            venues.clone(),
            clients.clone(),
            registry.clone(),
            Duration::from_millis(config.price_ttl_ms),
            config.sanity_bound_bps,
        ));
        let queue = Arc::new(ExecutionQueue::new(
            &registry,
            config.queue_capacity,
            telemetry.clone(),
        ));
        let risk = Arc::new(RiskSupervisor::new(&config, &registry, telemetry.clone()));
        let simulation_mode = Arc::new(AtomicBool::new(config.simulation_mode));

        let scanner_settings = ScannerSettings::from_config(&config);
        let mut infras = HashMap::new();
        for chain in registry.chains() {
            let client = clients
                .get(&chain.chain_id)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Infrastructure(format!(
                        "no chain client wired for chain {}",
                        chain.name
                    ))
                })?;
            let scanner = Arc::new(OpportunityScanner::new(
                chain.clone(),
                registry.clone(),
                oracle.clone(),
                venues.clone(),
                flash_loans.clone(),
                client.clone(),
                queue.clone(),
                risk.clone(),
                telemetry.clone(),
                scanner_settings.clone(),
            ));
            let executor = Arc::new(FlashLoanExecutor::new(
                chain.clone(),
                registry.clone(),
                oracle.clone(),
                venues.clone(),
                flash_loans.clone(),
                client,
                risk.clone(),
                telemetry.clone(),
                ExecutorSettings::from_config(&config, chain.block_time_ms),
                simulation_mode.clone(),
            ));
            infras.insert(chain.chain_id, ChainInfra { scanner, executor });
        }

        Ok(Self {
            config,
            registry,
            coordinator,
            oracle,
            queue,
            risk,
            telemetry,
            simulation_mode,
            cancel: CancellationToken::new(),
            infras,
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn telemetry(&self) -> Arc<TelemetrySink> {
        self.telemetry.clone()
    }

    pub fn risk(&self) -> Arc<RiskSupervisor> {
        self.risk.clone()
    }

    pub fn oracle(&self) -> Arc<PriceOracle> {
        self.oracle.clone()
    }

    pub fn queue(&self) -> Arc<ExecutionQueue> {
        self.queue.clone()
    }

    /// Force simulation mode for roughly `ticks` scan periods, then restore
    /// the configured value.
    pub fn simulate_for_ticks(&self, ticks: u64) {
        self.simulation_mode.store(true, Ordering::SeqCst);
        let mode = self.simulation_mode.clone();
        let configured = self.config.simulation_mode;
        let window = Duration::from_millis(self.config.scan_period_ms.saturating_mul(ticks));
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            mode.store(configured, Ordering::SeqCst);
            info!("simulation window over, restoring configured mode");
        });
    }

    /// Spawn every background task: oracle refresh, provider health
    /// probes, one scanner and one executor worker per chain.
    pub async fn start(&self) {
        info!(
            chains = self.infras.len(),
            simulation = self.simulation_mode.load(Ordering::SeqCst),
            "engine starting"
        );
        let mut handles = self.handles.lock().await;

        self.coordinator
            .clone()
            .spawn_health_monitor(self.cancel.clone());

        // Price refresh loop.
        {
            let oracle = self.oracle.clone();
            let cancel = self.cancel.clone();
            let period = Duration::from_millis(self.config.price_refresh_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let tokens = oracle.watched_tokens();
                    if let Err(e) = oracle.refresh(&tokens).await {
                        warn!(error = %e, "price refresh failed, scanners will skip stale pairs");
                    }
                }
            }));
        }

        for infra in self.infras.values() {
            handles.push(tokio::spawn(
                infra.scanner.clone().run(self.cancel.clone()),
            ));
            handles.push(tokio::spawn(infra.executor.clone().run(self.queue.clone())));
        }
    }

    /// Graceful shutdown: the kill-switch stops admissions, scanners stop
    /// emitting, the queue drains, and in-flight executions record their
    /// true outcome before the tasks are joined. Nothing on chain is ever
    /// aborted.
    pub async fn stop(&self) {
        info!("engine stopping");
        self.risk.engage_kill_switch();
        self.cancel.cancel();
        self.queue.close();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "task ended abnormally during shutdown");
            }
        }
        info!(summary = %self.telemetry.summary(), "engine stopped");
    }

    /// Operator `status` surface: budgets, breakers, provider health.
    pub async fn status(&self) -> String {
        let mut lines = vec![format!("pipeline: {}", self.telemetry.summary())];
        for stat in self.risk.stats().await {
            lines.push(format!(
                "chain {} ({}): reverts_1h={} paused={} gas_spent_wei={} trades={} margin_sum={:.4}",
                stat.chain_name,
                stat.chain_id,
                stat.reverts_in_window,
                stat.paused,
                stat.budget.gas_spent_wei,
                stat.budget.trades_submitted,
                stat.budget.realized_margin_sum,
            ));
        }
        for provider in self.coordinator.provider_stats().await {
            lines.push(format!(
                "provider {}: healthy={} breaker_open={} ema_ms={:.1} weight={:.2} in_flight={}",
                provider.name,
                provider.healthy,
                provider.breaker_open,
                provider.ema_response_ms,
                provider.weight,
                provider.in_flight,
            ));
        }
        for chain in self.registry.chains() {
            lines.push(format!(
                "lane {}: depth={}",
                chain.name,
                self.queue.depth(chain.chain_id).await
            ));
        }
        lines.join("\n")
    }
}
