//! # Opportunity Scanner
//!
//! One periodic loop per chain so a slow RPC on one chain never stalls
//! another. Each tick walks the watched pairs, compares the two venues'
//! implied pair prices, sizes a candidate trade from 24h volume, selects a
//! flash-loan provider, prices the candidate through the estimator, and,
//! after the mandatory off-chain/on-chain cross-check, pushes the top-K
//! survivors into the execution queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::U256;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::blockchain::ChainClient;
use crate::config::Config;
use crate::estimator::{estimate, EstimatorInput, EstimatorParams};
use crate::flash_loan::{FlashLoanAdapter, FlashLoanRegistry};
use crate::precision::{PreciseDecimal, NOTIONAL_PRECISION};
use crate::price_oracle::PriceOracle;
use crate::queue::ExecutionQueue;
use crate::risk::RiskSupervisor;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{ChainDescriptor, ChainRegistry, Opportunity, TokenInfo, WatchedPair};
use crate::venues::VenueRegistry;

/// Scan-loop tunables lifted out of the full config.
#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub scan_period: Duration,
    pub min_delta_bps: u32,
    pub volume_fraction_bps: u32,
    pub max_trade_size: u64,
    pub min_confidence: f64,
    pub top_k: usize,
    pub borrow_fraction_bps: u32,
    pub min_native_reserve_wei: U256,
    pub estimator: EstimatorParams,
}

impl ScannerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scan_period: Duration::from_millis(config.scan_period_ms),
            min_delta_bps: config.min_delta_bps,
            volume_fraction_bps: config.volume_fraction_bps,
            max_trade_size: config.max_trade_size,
            min_confidence: config.min_confidence,
            top_k: config.top_k,
            borrow_fraction_bps: config.borrow_fraction_bps,
            min_native_reserve_wei: config.operator.min_native_reserve_wei(),
            estimator: config.estimator_params(),
        }
    }
}

pub struct OpportunityScanner {
    chain: ChainDescriptor,
    registry: Arc<ChainRegistry>,
    oracle: Arc<PriceOracle>,
    venues: Arc<VenueRegistry>,
    flash_loans: Arc<FlashLoanRegistry>,
    client: Arc<dyn ChainClient>,
    queue: Arc<ExecutionQueue>,
    risk: Arc<RiskSupervisor>,
    telemetry: Arc<TelemetrySink>,
    settings: ScannerSettings,
}

impl OpportunityScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ChainDescriptor,
        registry: Arc<ChainRegistry>,
        oracle: Arc<PriceOracle>,
        venues: Arc<VenueRegistry>,
        flash_loans: Arc<FlashLoanRegistry>,
        client: Arc<dyn ChainClient>,
        queue: Arc<ExecutionQueue>,
        risk: Arc<RiskSupervisor>,
        telemetry: Arc<TelemetrySink>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            chain,
            registry,
            oracle,
            venues,
            flash_loans,
            client,
            queue,
            risk,
            telemetry,
            settings,
        }
    }

    /// The scan loop. Exits when cancelled or when the kill-switch engages;
    /// a failed tick is logged and the next tick proceeds.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(chain = %self.chain.name, period_ms = self.settings.scan_period.as_millis() as u64, "scanner started");
        let mut ticker = tokio::time::interval(self.settings.scan_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.risk.kill_switch_engaged() {
                break;
            }
            if let Err(e) = self.tick().await {
                warn!(chain = %self.chain.name, error = %e, "scan tick skipped");
            }
        }
        info!(chain = %self.chain.name, "scanner stopped");
    }

    /// One pass over the chain's watched pairs.
    #[instrument(skip(self), fields(chain = %self.chain.name))]
    pub async fn tick(&self) -> Result<usize, crate::errors::EngineError> {
        let gas = self.client.gas_price().await?;
        if gas.effective_price() > self.chain.gas_ceiling_wei {
            debug!(
                chain = %self.chain.name,
                gas_wei = %gas.effective_price(),
                ceiling_wei = %self.chain.gas_ceiling_wei,
                "gas above ceiling, chain excluded this tick"
            );
            return Ok(0);
        }

        let Some(native_token) = self.registry.token(self.chain.chain_id, &self.chain.native_symbol)
        else {
            warn!(chain = %self.chain.name, "no native pricing token configured");
            return Ok(0);
        };
        let native_price = match self.oracle.price(native_token.address) {
            Ok(point) => point.price,
            Err(_) => {
                debug!(chain = %self.chain.name, "native price unavailable, skipping tick");
                return Ok(0);
            }
        };

        let mut candidates: Vec<Opportunity> = Vec::new();
        for pair in self.registry.pairs_on(self.chain.chain_id) {
            match self
                .scan_pair(pair, gas.effective_price(), native_price)
                .await
            {
                Ok(mut found) => candidates.append(&mut found),
                Err(e) => debug!(
                    chain = %self.chain.name,
                    pair = %format!("{}/{}", pair.token_a, pair.token_b),
                    error = %e,
                    "pair skipped"
                ),
            }
        }

        // Rank: net profit desc, confidence desc, detection asc.
        candidates.sort_by(|a, b| {
            b.estimate
                .net_profit
                .raw()
                .cmp(&a.estimate.net_profit.raw())
                .then_with(|| {
                    b.estimate
                        .confidence
                        .partial_cmp(&a.estimate.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.detected_at.cmp(&b.detected_at))
        });

        let mut enqueued = 0usize;
        for opportunity in candidates.into_iter().take(self.settings.top_k) {
            if self.queue.enqueue(Arc::new(opportunity)).await {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Evaluate one watched pair across every venue combination on the
    /// chain, emitting at most one candidate per venue pair.
    async fn scan_pair(
        &self,
        pair: &WatchedPair,
        gas_price_wei: U256,
        native_price: PreciseDecimal,
    ) -> Result<Vec<Opportunity>, crate::errors::EngineError> {
        let chain_id = self.chain.chain_id;
        let token_a = self
            .registry
            .token(chain_id, &pair.token_a)
            .cloned()
            .ok_or_else(|| crate::errors::EngineError::Infrastructure(format!(
                "token {} missing from registry",
                pair.token_a
            )))?;
        let token_b = self
            .registry
            .token(chain_id, &pair.token_b)
            .cloned()
            .ok_or_else(|| crate::errors::EngineError::Infrastructure(format!(
                "token {} missing from registry",
                pair.token_b
            )))?;

        if self
            .oracle
            .is_pair_flagged(chain_id, token_a.address, token_b.address)
        {
            debug!(pair = %format!("{}/{}", token_a.symbol, token_b.symbol), "pair flagged stale");
            return Ok(Vec::new());
        }

        let point_a = match self.oracle.price(token_a.address) {
            Ok(p) => p,
            Err(_) => return Ok(Vec::new()),
        };
        let point_b = match self.oracle.price(token_b.address) {
            Ok(p) => p,
            Err(_) => return Ok(Vec::new()),
        };

        // Size from volume before quoting so probe impact matches intent:
        // a fraction of the thinner side's 24h volume, capped, floored.
        let min_volume = point_a.volume_24h.min(point_b.volume_24h);
        let sized = (min_volume * self.settings.volume_fraction_bps as f64 / 10_000.0)
            .min(self.settings.max_trade_size as f64);
        let notional_units = (sized.max(pair.min_trade_notional as f64)).floor() as u64;
        if notional_units == 0 {
            return Ok(Vec::new());
        }
        let trade_size = PreciseDecimal::from_integer(notional_units, NOTIONAL_PRECISION);

        // Borrow-token amount corresponding to the notional.
        let amount_in_units = trade_size
            .checked_div(&point_a.price)
            .map_err(|e| crate::errors::EngineError::Infrastructure(e.to_string()))?;
        let amount_in = amount_in_units.to_token_amount(token_a.decimals);
        if amount_in.is_zero() {
            return Ok(Vec::new());
        }

        let venues = self.venues.on_chain(chain_id);
        let mut out = Vec::new();
        for (i, first) in venues.iter().enumerate() {
            for second in venues.iter().skip(i + 1) {
                match self
                    .scan_venue_pair(
                        pair,
                        &token_a,
                        &token_b,
                        &point_a,
                        &point_b,
                        first.info().key.as_str(),
                        second.info().key.as_str(),
                        trade_size,
                        amount_in,
                        gas_price_wei,
                        native_price,
                    )
                    .await
                {
                    Ok(Some(opportunity)) => out.push(opportunity),
                    Ok(None) => {}
                    Err(e) => debug!(
                        venue_a = first.info().key.as_str(),
                        venue_b = second.info().key.as_str(),
                        error = %e,
                        "venue pair skipped"
                    ),
                }
            }
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn scan_venue_pair(
        &self,
        pair: &WatchedPair,
        token_a: &TokenInfo,
        token_b: &TokenInfo,
        point_a: &crate::types::PricePoint,
        point_b: &crate::types::PricePoint,
        first: &str,
        second: &str,
        trade_size: PreciseDecimal,
        amount_in: U256,
        gas_price_wei: U256,
        native_price: PreciseDecimal,
    ) -> Result<Option<Opportunity>, crate::errors::EngineError> {
        let chain_id = self.chain.chain_id;

        // Implied pair price per venue for the probe amount.
        let quote_first = self
            .oracle
            .quote(chain_id, first, token_a.address, token_b.address, pair.probe_amount)
            .await?;
        let quote_second = self
            .oracle
            .quote(chain_id, second, token_a.address, token_b.address, pair.probe_amount)
            .await?;

        if quote_first.amount_out.is_zero() || quote_second.amount_out.is_zero() {
            return Ok(None);
        }

        // Direction: swap A->B where output is best, close B->A on the
        // other venue. The relative output spread is the price delta.
        let (buy_venue, sell_venue, best_out, other_out) =
            if quote_first.amount_out >= quote_second.amount_out {
                (first, second, quote_first.amount_out, quote_second.amount_out)
            } else {
                (second, first, quote_second.amount_out, quote_first.amount_out)
            };

        let best = PreciseDecimal::from_token_amount(best_out, token_b.decimals, NOTIONAL_PRECISION);
        let other =
            PreciseDecimal::from_token_amount(other_out, token_b.decimals, NOTIONAL_PRECISION);
        let spread = best
            .checked_sub(&other)
            .and_then(|d| d.checked_div(&other))
            .map_err(|e| crate::errors::EngineError::Infrastructure(e.to_string()))?;
        let spread_bps = spread
            .ratio_bps(&PreciseDecimal::from_integer(1, NOTIONAL_PRECISION))
            .unwrap_or(0);
        if spread_bps < self.settings.min_delta_bps as u64 {
            return Ok(None);
        }

        let Some(provider) = self.select_provider(token_a, amount_in).await else {
            debug!(
                token = %token_a.symbol,
                "no flash-loan provider can fund the trade"
            );
            return Ok(None);
        };

        let buy_fee = self
            .venues
            .get(chain_id, buy_venue)
            .map(|v| v.fee_bps())
            .unwrap_or_default();
        let sell_fee = self
            .venues
            .get(chain_id, sell_venue)
            .map(|v| v.fee_bps())
            .unwrap_or_default();

        // Depth proxy: each token's 24h USD volume. Coarse, but the
        // modeled slippage is capped by maxSlippage anyway.
        let depth_buy = PreciseDecimal::from_integer(point_a.volume_24h.max(1.0) as u64, NOTIONAL_PRECISION);
        let depth_sell =
            PreciseDecimal::from_integer(point_b.volume_24h.max(1.0) as u64, NOTIONAL_PRECISION);

        let input = EstimatorInput {
            price_delta: spread,
            trade_size,
            gas_units: provider.info().gas_limit_hint,
            gas_price_wei,
            gas_ceiling_wei: self.chain.gas_ceiling_wei,
            native_price,
            provider_fee_bps: provider.fee_bps(),
            buy_venue_fee_bps: buy_fee,
            sell_venue_fee_bps: sell_fee,
            depth_buy,
            depth_sell,
            params: self.settings.estimator,
        };
        let estimate = estimate(&input)
            .map_err(|e| crate::errors::EngineError::Infrastructure(e.to_string()))?;

        if !estimate.profitable || estimate.confidence < self.settings.min_confidence {
            return Ok(None);
        }

        // Mandatory reconciliation before anything reaches the queue.
        if self
            .oracle
            .crosscheck(chain_id, buy_venue, token_a, token_b, pair.probe_amount)
            .await
            .is_err()
        {
            return Ok(None);
        }

        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            chain_id,
            token_in: token_a.clone(),
            token_out: token_b.clone(),
            buy_venue: buy_venue.to_string(),
            sell_venue: sell_venue.to_string(),
            amount_in,
            provider: provider.key().to_string(),
            estimate,
            detected_at: Instant::now(),
        };
        self.telemetry.emit(TelemetryEvent::OpportunityDetected {
            chain: self.chain.name.clone(),
            id: opportunity.id,
            net_margin_bps: opportunity.estimate.net_margin_bps,
            recommendation: opportunity.estimate.recommendation.as_str(),
        });
        Ok(Some(opportunity))
    }

    /// First provider on the chain that supports the borrow token, has a
    /// closed breaker, passes its health check, and can lend the size.
    async fn select_provider(
        &self,
        token: &TokenInfo,
        amount_in: U256,
    ) -> Option<Arc<FlashLoanAdapter>> {
        for adapter in self.flash_loans.on_chain(self.chain.chain_id) {
            if !adapter.info().supports(token.address) {
                continue;
            }
            if let Some(breaker) = self
                .flash_loans
                .breaker(self.chain.chain_id, adapter.key())
            {
                if breaker.is_open().await {
                    continue;
                }
            }
            if adapter
                .is_healthy(self.client.as_ref(), self.settings.min_native_reserve_wei)
                .await
                .is_err()
            {
                continue;
            }
            match adapter
                .max_borrow(
                    self.client.as_ref(),
                    token.address,
                    self.settings.borrow_fraction_bps,
                )
                .await
            {
                Ok(ceiling) if ceiling >= amount_in => return Some(adapter),
                Ok(_) | Err(_) => continue,
            }
        }
        None
    }
}
