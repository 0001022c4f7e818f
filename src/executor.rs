//! # Flash-Loan Executor
//!
//! Drives one execution at a time through the state machine:
//!
//! ```text
//! Created -> Admitting -> Building -> Simulating -> Submitting -> Pending
//!                |            |            |             |          |
//!                v            v            v             v          v
//!            Abandoned    Abandoned    Abandoned     Abandoned  Succeeded/Reverted
//! ```
//!
//! Building re-quotes both legs on chain and re-runs the estimator with the
//! freshest numbers; a collapsed margin abandons with no cost. The borrow,
//! both swaps, and repayment ride a single transaction whose callback
//! contract reverts unless repayment plus the minimum profit is covered.
//! That is the entire atomicity claim, and it never spans chains.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::{
    abi::Token,
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, H256, U256},
    utils::keccak256,
};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::blockchain::{ChainClient, GasPrice};
use crate::config::Config;
use crate::errors::ExecutionError;
use crate::estimator::{estimate, EstimatorInput, EstimatorParams, ProfitEstimate};
use crate::flash_loan::FlashLoanRegistry;
use crate::metrics;
use crate::precision::{PreciseDecimal, SignedDecimal, NOTIONAL_PRECISION};
use crate::price_oracle::PriceOracle;
use crate::queue::ExecutionQueue;
use crate::risk::{AdmissionDecision, RiskSupervisor};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{
    AbandonReason, ChainDescriptor, ChainRegistry, Execution, ExecutionState, Opportunity,
};
use crate::venues::{SwapCall, VenueRegistry};

const SIM_CACHE_CAPACITY: usize = 256;
/// Swap deadline placed into router calldata, seconds from wall clock.
const SWAP_DEADLINE_SECS: i64 = 120;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub receiver: Address,
    pub submission_timeout: Duration,
    pub submission_retries: u32,
    pub pending_deadline: Duration,
    pub receipt_poll_interval: Duration,
    pub borrow_fraction_bps: u32,
    pub min_native_reserve_wei: U256,
    pub estimator: EstimatorParams,
    pub max_slippage_bps: u32,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config, block_time_ms: u64) -> Self {
        Self {
            receiver: config.operator.receiver,
            submission_timeout: Duration::from_millis(config.submission_timeout_ms),
            submission_retries: config.submission_retries,
            pending_deadline: Duration::from_millis(config.pending_deadline_ms),
            receipt_poll_interval: Duration::from_millis(block_time_ms.max(500)),
            borrow_fraction_bps: config.borrow_fraction_bps,
            min_native_reserve_wei: config.operator.min_native_reserve_wei(),
            estimator: config.estimator_params(),
            max_slippage_bps: config.max_slippage_bps,
        }
    }
}

/// Everything Building produced, handed to Simulating and Submitting.
struct BuiltTransaction {
    tx: TypedTransaction,
    estimate: ProfitEstimate,
    min_profit: U256,
}

pub struct FlashLoanExecutor {
    chain: ChainDescriptor,
    registry: Arc<ChainRegistry>,
    oracle: Arc<PriceOracle>,
    venues: Arc<VenueRegistry>,
    flash_loans: Arc<FlashLoanRegistry>,
    client: Arc<dyn ChainClient>,
    risk: Arc<RiskSupervisor>,
    telemetry: Arc<TelemetrySink>,
    settings: ExecutorSettings,
    simulation_mode: Arc<AtomicBool>,
    /// eth_call results keyed by (calldata hash, block), so Submitting
    /// retries do not re-pay for an identical simulation.
    sim_cache: Mutex<LruCache<(H256, u64), bool>>,
}

impl FlashLoanExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ChainDescriptor,
        registry: Arc<ChainRegistry>,
        oracle: Arc<PriceOracle>,
        venues: Arc<VenueRegistry>,
        flash_loans: Arc<FlashLoanRegistry>,
        client: Arc<dyn ChainClient>,
        risk: Arc<RiskSupervisor>,
        telemetry: Arc<TelemetrySink>,
        settings: ExecutorSettings,
        simulation_mode: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain,
            registry,
            oracle,
            venues,
            flash_loans,
            client,
            risk,
            telemetry,
            settings,
            simulation_mode,
            sim_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(SIM_CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        }
    }

    /// Worker loop: drain the chain's lane until the queue closes. One
    /// execution in flight at a time: this loop IS the per-chain
    /// serialization.
    pub async fn run(self: Arc<Self>, queue: Arc<ExecutionQueue>) {
        info!(chain = %self.chain.name, "executor worker started");
        while let Some(opportunity) = queue.dequeue(self.chain.chain_id).await {
            let execution = self.execute(opportunity).await;
            debug!(
                chain = %self.chain.name,
                execution = %execution.id,
                state = execution.state.as_str(),
                "execution finished"
            );
        }
        info!(chain = %self.chain.name, "executor worker stopped");
    }

    /// Run one opportunity to a terminal state.
    #[instrument(skip(self, opportunity), fields(chain = %self.chain.name, opportunity = %opportunity.id))]
    pub async fn execute(&self, opportunity: Arc<Opportunity>) -> Execution {
        let mut execution = Execution::new(opportunity.clone());

        // Admitting.
        self.transition(&mut execution, ExecutionState::Admitting, None);
        let stage = Instant::now();
        let decision = self
            .risk
            .admit(self.chain.chain_id, opportunity.estimate.gas_cost_native_wei)
            .await;
        self.stage_done("admitting", stage);
        if let AdmissionDecision::Denied(reason) = decision {
            return self
                .abandon(execution, AbandonReason::AdmissionDenied(reason))
                .await;
        }

        // Building.
        self.transition(&mut execution, ExecutionState::Building, None);
        let stage = Instant::now();
        let built = match self.build(&opportunity).await {
            Ok(Some(built)) => built,
            Ok(None) => {
                self.stage_done("building", stage);
                return self.abandon(execution, AbandonReason::EconomicReject).await;
            }
            Err(e) => {
                self.stage_done("building", stage);
                return self.abandon_build_failure(execution, e).await;
            }
        };
        self.stage_done("building", stage);

        // Simulating.
        self.transition(&mut execution, ExecutionState::Simulating, None);
        let stage = Instant::now();
        let simulated = self.simulate(&built.tx).await;
        self.stage_done("simulating", stage);
        match simulated {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                return self
                    .abandon(execution, AbandonReason::SimulationFailure)
                    .await;
            }
        }

        if self.simulation_mode.load(Ordering::SeqCst) {
            // Live-chain dry run: everything up to and including simulation
            // ran against real state; no transaction leaves the process.
            return self.abandon(execution, AbandonReason::SimulationMode).await;
        }

        // Submitting.
        self.transition(&mut execution, ExecutionState::Submitting, None);
        let stage = Instant::now();
        let pre_balance = self
            .client
            .token_balance(opportunity.token_in.address, self.client.operator())
            .await
            .unwrap_or_default();
        let submitted = self.submit_with_retry(built).await;
        self.stage_done("submitting", stage);
        let tx_hash = match submitted {
            Ok(hash) => hash,
            Err(e) => {
                warn!(chain = %self.chain.name, error = %e, "submission exhausted");
                return self
                    .abandon(execution, AbandonReason::SubmissionFailure)
                    .await;
            }
        };
        execution.tx_hash = Some(tx_hash);

        // Pending.
        self.transition(&mut execution, ExecutionState::Pending, None);
        let stage = Instant::now();
        let outcome = self.await_inclusion(tx_hash).await;
        self.stage_done("pending", stage);

        match outcome {
            InclusionOutcome::Succeeded(receipt) => {
                let gas_spent = receipt
                    .gas_used
                    .unwrap_or_default()
                    .saturating_mul(receipt.effective_gas_price.unwrap_or_default());
                execution.gas_used = receipt.gas_used;
                execution.receipt = Some(*receipt);
                execution.realized_margin = self
                    .realized_margin(opportunity.token_in.address, opportunity.token_in.decimals, pre_balance)
                    .await;
                self.transition(&mut execution, ExecutionState::Succeeded, None);
                self.finish(execution, gas_spent).await
            }
            InclusionOutcome::Reverted(receipt) => {
                let gas_spent = receipt
                    .gas_used
                    .unwrap_or_default()
                    .saturating_mul(receipt.effective_gas_price.unwrap_or_default());
                execution.gas_used = receipt.gas_used;
                execution.receipt = Some(*receipt);
                self.transition(
                    &mut execution,
                    ExecutionState::Reverted,
                    Some("transaction reverted on chain".to_string()),
                );
                self.finish(execution, gas_spent).await
            }
            InclusionOutcome::DeadlineExpired => {
                // Accounted as a revert exactly once; the transaction may
                // still be mined later and is then tracked by telemetry
                // without reopening this execution.
                self.spawn_late_inclusion_watch(tx_hash);
                self.transition(
                    &mut execution,
                    ExecutionState::Reverted,
                    Some("pending deadline expired".to_string()),
                );
                self.finish(execution, U256::zero()).await
            }
        }
    }

    //============================================================================================//
    //                                        BUILDING                                            //
    //============================================================================================//

    /// Re-quote both legs against latest chain state, re-run the estimator,
    /// and compose the borrow transaction. `Ok(None)` means the margin
    /// collapsed, which is an economic rejection, not an error.
    async fn build(
        &self,
        opportunity: &Opportunity,
    ) -> Result<Option<BuiltTransaction>, ExecutionError> {
        let chain_id = self.chain.chain_id;
        let token_in = &opportunity.token_in;
        let token_out = &opportunity.token_out;
        let amount_in = opportunity.amount_in;

        // Fresh quotes: the buy leg, the same direction on the sell venue
        // (for the spread), and the closing leg for sizing the second swap.
        let buy_quote = self
            .oracle
            .fresh_quote(chain_id, &opportunity.buy_venue, token_in.address, token_out.address, amount_in)
            .await?;
        let reference_quote = self
            .oracle
            .fresh_quote(chain_id, &opportunity.sell_venue, token_in.address, token_out.address, amount_in)
            .await?;
        if buy_quote.amount_out.is_zero() || reference_quote.amount_out.is_zero() {
            return Err(ExecutionError::Build("zero-output quote".to_string()));
        }

        // Direction must still hold; a flipped market is a collapse.
        if buy_quote.amount_out <= reference_quote.amount_out {
            debug!(chain = %self.chain.name, "spread flipped between detection and building");
            return Ok(None);
        }

        let best = PreciseDecimal::from_token_amount(
            buy_quote.amount_out,
            token_out.decimals,
            NOTIONAL_PRECISION,
        );
        let other = PreciseDecimal::from_token_amount(
            reference_quote.amount_out,
            token_out.decimals,
            NOTIONAL_PRECISION,
        );
        let spread = best
            .checked_sub(&other)
            .and_then(|d| d.checked_div(&other))
            .map_err(|e| ExecutionError::Build(e.to_string()))?;

        let gas = self.client.gas_price().await?;
        let native_price = self.native_price().unwrap_or_else(|| {
            PreciseDecimal::from_integer(1, NOTIONAL_PRECISION)
        });

        let previous = &opportunity.estimate;
        let input = EstimatorInput {
            price_delta: spread,
            trade_size: previous.trade_size,
            gas_units: previous.gas_units,
            gas_price_wei: gas.effective_price(),
            gas_ceiling_wei: self.chain.gas_ceiling_wei,
            native_price,
            provider_fee_bps: self
                .flash_loans
                .get(chain_id, &opportunity.provider)
                .map(|p| p.fee_bps())
                .unwrap_or_default(),
            buy_venue_fee_bps: self
                .venues
                .get(chain_id, &opportunity.buy_venue)
                .map(|v| v.fee_bps())
                .unwrap_or_default(),
            sell_venue_fee_bps: self
                .venues
                .get(chain_id, &opportunity.sell_venue)
                .map(|v| v.fee_bps())
                .unwrap_or_default(),
            // The fresh quotes already embed realized venue impact, so the
            // re-estimate models no additional depth risk.
            depth_buy: deep_depth(previous.trade_size),
            depth_sell: deep_depth(previous.trade_size),
            params: self.settings.estimator,
        };
        let fresh = estimate(&input).map_err(|e| ExecutionError::Build(e.to_string()))?;
        if !fresh.profitable {
            debug!(
                chain = %self.chain.name,
                margin_bps = fresh.net_margin_bps,
                "re-estimated margin below threshold"
            );
            return Ok(None);
        }

        // Second leg sizing from the closing quote.
        let sell_quote = self
            .oracle
            .fresh_quote(
                chain_id,
                &opportunity.sell_venue,
                token_out.address,
                token_in.address,
                buy_quote.amount_out,
            )
            .await?;

        let slippage_keep = U256::from(10_000u64 - self.settings.max_slippage_bps as u64);
        let min_out_leg1 = buy_quote.amount_out * slippage_keep / U256::from(10_000u64);
        let min_out_leg2 = sell_quote.amount_out * slippage_keep / U256::from(10_000u64);

        let provider = self
            .flash_loans
            .get(chain_id, &opportunity.provider)
            .ok_or_else(|| {
                ExecutionError::Build(format!("unknown provider {}", opportunity.provider))
            })?;

        // Liquidity may have moved since detection.
        let ceiling = provider
            .max_borrow(
                self.client.as_ref(),
                token_in.address,
                self.settings.borrow_fraction_bps,
            )
            .await?;
        if ceiling < amount_in {
            return Err(ExecutionError::FlashLoan(
                crate::errors::FlashLoanError::BorrowTooLarge {
                    token: token_in.address,
                    requested: amount_in,
                    max: ceiling,
                },
            ));
        }
        provider
            .is_healthy(self.client.as_ref(), self.settings.min_native_reserve_wei)
            .await?;

        let deadline = U256::from((chrono::Utc::now().timestamp() + SWAP_DEADLINE_SECS) as u64);
        let buy_venue = self
            .venues
            .get(chain_id, &opportunity.buy_venue)
            .ok_or_else(|| ExecutionError::Build(format!("unknown venue {}", opportunity.buy_venue)))?;
        let sell_venue = self
            .venues
            .get(chain_id, &opportunity.sell_venue)
            .ok_or_else(|| {
                ExecutionError::Build(format!("unknown venue {}", opportunity.sell_venue))
            })?;

        let swap_a = buy_venue.build_swap_call(
            token_in.address,
            token_out.address,
            amount_in,
            min_out_leg1,
            self.settings.receiver,
            deadline,
        )?;
        let swap_b = sell_venue.build_swap_call(
            token_out.address,
            token_in.address,
            buy_quote.amount_out,
            min_out_leg2,
            self.settings.receiver,
            deadline,
        )?;

        // The callback contract enforces: balance >= loan + premium +
        // min_profit, or the whole transaction reverts.
        let min_profit =
            amount_in * U256::from(self.settings.estimator.min_margin_bps) / U256::from(10_000u64);
        let payload = Self::encode_callback_payload(&swap_a, &swap_b, min_profit);

        let mut tx = provider.build_borrow_tx(
            self.settings.receiver,
            token_in.address,
            amount_in,
            payload,
        )?;
        self.prepare_fees(&mut tx, &gas).await?;

        Ok(Some(BuiltTransaction {
            tx,
            estimate: fresh,
            min_profit,
        }))
    }

    /// Payload decoded by the receiver inside the flash-loan callback:
    /// `(venueA, venueB, swapCallA, swapCallB, minProfit)`.
    fn encode_callback_payload(swap_a: &SwapCall, swap_b: &SwapCall, min_profit: U256) -> Bytes {
        Bytes::from(ethers::abi::encode(&[
            Token::Address(swap_a.target),
            Token::Address(swap_b.target),
            Token::Bytes(swap_a.calldata.to_vec()),
            Token::Bytes(swap_b.calldata.to_vec()),
            Token::Uint(min_profit),
        ]))
    }

    async fn prepare_fees(
        &self,
        tx: &mut TypedTransaction,
        gas: &GasPrice,
    ) -> Result<(), ExecutionError> {
        let nonce = self.client.next_nonce().await?;
        if let TypedTransaction::Eip1559(request) = tx {
            request.chain_id = Some(self.chain.chain_id.into());
            request.nonce = Some(nonce);
            request.max_priority_fee_per_gas = Some(gas.priority_fee);
            request.max_fee_per_gas = Some(
                gas.base_fee
                    .saturating_mul(U256::from(2u64))
                    .saturating_add(gas.priority_fee),
            );
        }
        Ok(())
    }

    //============================================================================================//
    //                                   SIMULATING & SUBMITTING                                  //
    //============================================================================================//

    /// Read-only execution against latest state, cached per (calldata,
    /// block).
    async fn simulate(&self, tx: &TypedTransaction) -> Result<bool, ExecutionError> {
        let block = self.client.block_number().await.unwrap_or_default();
        let key = (
            H256::from(keccak256(tx.data().map(|d| d.to_vec()).unwrap_or_default())),
            block,
        );
        if let Some(cached) = self.sim_cache.lock().await.get(&key).copied() {
            return Ok(cached);
        }
        let ok = match self.client.call(tx).await {
            Ok(_) => true,
            Err(e) => {
                debug!(chain = %self.chain.name, error = %e, "simulation reverted");
                false
            }
        };
        self.sim_cache.lock().await.put(key, ok);
        Ok(ok)
    }

    /// Submission with a bounded retry ladder. Each retry refreshes nonce
    /// and fees and re-simulates before sending again.
    async fn submit_with_retry(&self, mut built: BuiltTransaction) -> Result<H256, ExecutionError> {
        let private = self.client.supports_private_relay();
        let attempts = 1 + self.settings.submission_retries;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let gas = self.client.gas_price().await?;
                self.prepare_fees(&mut built.tx, &gas).await?;
                match self.simulate(&built.tx).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        return Err(ExecutionError::Submission(
                            "re-simulation failed before retry".to_string(),
                        ))
                    }
                }
            }
            match tokio::time::timeout(
                self.settings.submission_timeout,
                self.client.submit(built.tx.clone(), private),
            )
            .await
            {
                Ok(Ok(hash)) => {
                    info!(
                        chain = %self.chain.name,
                        %hash,
                        attempt,
                        min_profit = %built.min_profit,
                        margin_bps = built.estimate.net_margin_bps,
                        private,
                        "transaction submitted"
                    );
                    return Ok(hash);
                }
                Ok(Err(e)) => {
                    warn!(chain = %self.chain.name, attempt, error = %e, "submission attempt failed");
                    last_error = Some(ExecutionError::Blockchain(e));
                }
                Err(_) => {
                    warn!(chain = %self.chain.name, attempt, "submission attempt timed out");
                    last_error = Some(ExecutionError::Submission("submission timeout".to_string()));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ExecutionError::Submission("submission exhausted".to_string())))
    }

    //============================================================================================//
    //                                         PENDING                                            //
    //============================================================================================//

    async fn await_inclusion(&self, tx_hash: H256) -> InclusionOutcome {
        let deadline = Instant::now() + self.settings.pending_deadline;
        loop {
            match self.client.receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let succeeded = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                    return if succeeded {
                        InclusionOutcome::Succeeded(Box::new(receipt))
                    } else {
                        InclusionOutcome::Reverted(Box::new(receipt))
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(chain = %self.chain.name, error = %e, "receipt poll failed");
                }
            }
            if Instant::now() >= deadline {
                return InclusionOutcome::DeadlineExpired;
            }
            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }

    /// After a deadline expiry, keep watching quietly: a late inclusion is
    /// a telemetry fact, not a state transition.
    fn spawn_late_inclusion_watch(&self, tx_hash: H256) {
        let client = self.client.clone();
        let telemetry = self.telemetry.clone();
        let chain = self.chain.name.clone();
        let poll = self.settings.receipt_poll_interval;
        let window = self.settings.pending_deadline;
        tokio::spawn(async move {
            let deadline = Instant::now() + window;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = client.receipt(tx_hash).await {
                    telemetry.emit(TelemetryEvent::LatePendingInclusion { chain, tx_hash });
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        });
    }

    async fn realized_margin(
        &self,
        token: Address,
        decimals: u8,
        pre_balance: U256,
    ) -> SignedDecimal {
        let post_balance = self
            .client
            .token_balance(token, self.client.operator())
            .await
            .unwrap_or(pre_balance);
        let pre = PreciseDecimal::from_token_amount(pre_balance, decimals, NOTIONAL_PRECISION);
        let post = PreciseDecimal::from_token_amount(post_balance, decimals, NOTIONAL_PRECISION);
        let delta_tokens = match SignedDecimal::sub_unsigned(post, pre) {
            Ok(d) => d,
            Err(_) => return SignedDecimal::zero(NOTIONAL_PRECISION),
        };
        // Convert to reference units when a fresh price exists; token units
        // otherwise (stablecoin borrow legs make the two identical).
        match self.oracle.price(token) {
            Ok(point) => {
                let magnitude = PreciseDecimal::new(
                    delta_tokens.raw().unsigned_abs(),
                    NOTIONAL_PRECISION,
                );
                match magnitude.checked_mul(&point.price) {
                    Ok(converted) if delta_tokens.is_negative() => {
                        SignedDecimal::sub_unsigned(PreciseDecimal::zero(NOTIONAL_PRECISION), converted)
                            .unwrap_or(delta_tokens)
                    }
                    Ok(converted) => SignedDecimal::from_unsigned(converted).unwrap_or(delta_tokens),
                    Err(_) => delta_tokens,
                }
            }
            Err(_) => delta_tokens,
        }
    }

    //============================================================================================//
    //                                    TERMINAL HANDLING                                       //
    //============================================================================================//

    fn transition(&self, execution: &mut Execution, next: ExecutionState, reason: Option<String>) {
        let from = execution.state.as_str();
        let to = next.as_str();
        if execution.advance(next) {
            self.telemetry.emit(TelemetryEvent::ExecutionStateChanged {
                chain: self.chain.name.clone(),
                execution: execution.id,
                from,
                to,
                reason,
            });
        }
    }

    fn stage_done(&self, stage: &str, started: Instant) {
        metrics::EXECUTION_STAGE_DURATION_MS
            .with_label_values(&[stage])
            .observe(started.elapsed().as_secs_f64() * 1_000.0);
    }

    async fn abandon_build_failure(
        &self,
        execution: Execution,
        error: ExecutionError,
    ) -> Execution {
        warn!(
            chain = %self.chain.name,
            opportunity = %execution.opportunity.id,
            provider = %execution.opportunity.provider,
            error = %error,
            "build failed"
        );
        // A failed build may indicate a sick provider; tick its breaker so
        // the scanner stops selecting it.
        let reason = match &error {
            ExecutionError::FlashLoan(crate::errors::FlashLoanError::BorrowTooLarge {
                ..
            }) => AbandonReason::InsufficientLiquidity,
            _ => AbandonReason::BuildFailure,
        };
        if let Some(breaker) = self
            .flash_loans
            .breaker(self.chain.chain_id, &execution.opportunity.provider)
        {
            if breaker.record_failure().await {
                self.telemetry.emit(TelemetryEvent::BreakerOpened {
                    subject: breaker.subject().to_string(),
                });
            }
        }
        self.abandon(execution, reason).await
    }

    async fn abandon(&self, mut execution: Execution, reason: AbandonReason) -> Execution {
        metrics::EXECUTIONS_ABANDONED
            .with_label_values(&[self.chain.name.as_str(), reason.as_str()])
            .inc();
        self.transition(
            &mut execution,
            ExecutionState::Abandoned(reason.clone()),
            Some(reason.as_str().to_string()),
        );
        self.finish(execution, U256::zero()).await
    }

    async fn finish(&self, execution: Execution, gas_spent_wei: U256) -> Execution {
        let realized = execution.realized_margin.to_f64_lossy();
        let gas_native = crate::types::normalize_units(gas_spent_wei, self.chain.native_decimals);
        self.risk
            .record_terminal(self.chain.chain_id, &execution.state, gas_spent_wei, realized)
            .await;
        self.telemetry.emit(TelemetryEvent::ExecutionCompleted {
            chain: self.chain.name.clone(),
            execution: execution.id,
            outcome: execution.state.as_str(),
            realized_margin: realized,
            gas_spent_native: gas_native,
        });
        execution
    }

    fn native_price(&self) -> Option<PreciseDecimal> {
        let native = self
            .registry
            .token(self.chain.chain_id, &self.chain.native_symbol)?;
        self.oracle.price(native.address).ok().map(|p| p.price)
    }
}

/// A depth large enough that size-over-depth slippage is negligible.
fn deep_depth(trade_size: PreciseDecimal) -> PreciseDecimal {
    trade_size
        .checked_mul(&PreciseDecimal::from_integer(10_000, NOTIONAL_PRECISION))
        .unwrap_or(trade_size)
}

enum InclusionOutcome {
    Succeeded(Box<ethers::types::TransactionReceipt>),
    Reverted(Box<ethers::types::TransactionReceipt>),
    DeadlineExpired,
}
