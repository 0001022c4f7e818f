//! # Core Type Definitions
//!
//! Single source of truth for the shared data model: immutable descriptors
//! created at startup, transient market data owned by the oracle, and the
//! opportunity/execution lifecycle types that flow through the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use ethers::types::{Address, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::ConfigError;
use crate::estimator::ProfitEstimate;

//================================================================================================//
//                                   STATIC DESCRIPTORS                                           //
//================================================================================================//

/// Static chain descriptor. Immutable after startup.
#[derive(Debug, Clone)]
pub struct ChainDescriptor {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub native_symbol: String,
    pub native_decimals: u8,
    pub block_time_ms: u64,
    pub gas_ceiling_wei: U256,
    pub provider_keys: Vec<String>,
    pub venue_keys: Vec<String>,
    pub token_symbols: Vec<String>,
}

/// Per-chain token descriptor. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

/// Exchange venue kinds: a closed set; adapters dispatch exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VenueKind {
    /// Constant-product router (`getAmountsOut` / `swapExactTokensForTokens`).
    V2Router,
    /// Concentrated-liquidity router with an external quoter contract.
    V3Router,
}

/// Exchange descriptor bound to a chain. Immutable.
#[derive(Debug, Clone)]
pub struct VenueInfo {
    pub key: String,
    pub chain_id: u64,
    pub kind: VenueKind,
    pub router: Address,
    pub factory: Address,
    /// For V3-style venues, the quoter contract used for view quotes.
    pub quoter: Option<Address>,
    pub fee_bps: u32,
}

/// Supported lending protocols: a closed set whose ids must match the on-chain
/// receiver's enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashLoanKind {
    AaveV3,
    BalancerV2,
    MakerDss,
}

impl FlashLoanKind {
    /// Wire id understood by the callback receiver contract.
    pub fn wire_id(&self) -> u8 {
        match self {
            FlashLoanKind::AaveV3 => 0,
            FlashLoanKind::BalancerV2 => 1,
            FlashLoanKind::MakerDss => 2,
        }
    }

    /// Protocol fee charged on the borrowed principal.
    pub fn fee_bps(&self) -> u32 {
        match self {
            FlashLoanKind::AaveV3 => 5,
            FlashLoanKind::BalancerV2 => 0,
            FlashLoanKind::MakerDss => 0,
        }
    }
}

/// Flash-loan provider descriptor bound to a chain. Immutable.
#[derive(Debug, Clone)]
pub struct FlashLoanProviderInfo {
    pub key: String,
    pub chain_id: u64,
    pub kind: FlashLoanKind,
    pub pool: Address,
    pub fee_bps: u32,
    /// Tokens the provider can lend, with optional configured caps.
    pub supported_tokens: HashMap<Address, Option<U256>>,
    pub gas_limit_hint: u64,
}

impl FlashLoanProviderInfo {
    pub fn supports(&self, token: Address) -> bool {
        self.supported_tokens.contains_key(&token)
    }
}

/// A watched token pair on a chain.
#[derive(Debug, Clone)]
pub struct WatchedPair {
    pub chain_id: u64,
    pub token_a: String,
    pub token_b: String,
    /// Floor on trade size in reference-currency units.
    pub min_trade_notional: u64,
    /// Probe amount (token-a units, native decimals) for on-chain cross-checks.
    pub probe_amount: U256,
}

//================================================================================================//
//                                   TRANSIENT MARKET DATA                                        //
//================================================================================================//

/// Off-chain price observation for one token, owned by the oracle and
/// evicted by age. Unit price is fixed-point in the reference currency.
#[derive(Debug, Clone)]
pub struct PricePoint {
    pub token: Address,
    pub price: crate::precision::PreciseDecimal,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub origin: String,
    pub observed_at: Instant,
    /// Provider-side sequence used to discard out-of-order snapshots.
    pub sequence: u64,
}

/// On-chain quote observation, cache-owned and age-bounded.
#[derive(Debug, Clone)]
pub struct VenueQuote {
    pub chain_id: u64,
    pub venue: String,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
    pub block_number: u64,
    pub observed_at: Instant,
}

//================================================================================================//
//                                  OPPORTUNITY & EXECUTION                                       //
//================================================================================================//

/// A candidate trade. All fields are read-only once enqueued; `id` is unique
/// for the process lifetime.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub id: Uuid,
    pub chain_id: u64,
    pub token_in: TokenInfo,
    pub token_out: TokenInfo,
    pub buy_venue: String,
    pub sell_venue: String,
    pub amount_in: U256,
    pub provider: String,
    pub estimate: ProfitEstimate,
    pub detected_at: Instant,
}

/// Why admission was denied. These are outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    KillSwitch,
    RevertThreshold,
    BudgetExhausted,
    Cooldown,
    ChainPaused,
}

/// Why an execution was abandoned. With the exception of
/// `SubmissionFailure` (which burned RPC attempts but no gas), abandonment
/// carries no on-chain cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    AdmissionDenied(DenialReason),
    EconomicReject,
    BuildFailure,
    SimulationFailure,
    SimulationMode,
    SubmissionFailure,
    InsufficientLiquidity,
    BreakerOpen,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::AdmissionDenied(DenialReason::KillSwitch) => "admission_kill_switch",
            AbandonReason::AdmissionDenied(DenialReason::RevertThreshold) => {
                "admission_revert_threshold"
            }
            AbandonReason::AdmissionDenied(DenialReason::BudgetExhausted) => {
                "admission_budget_exhausted"
            }
            AbandonReason::AdmissionDenied(DenialReason::Cooldown) => "admission_cooldown",
            AbandonReason::AdmissionDenied(DenialReason::ChainPaused) => "admission_chain_paused",
            AbandonReason::EconomicReject => "economic_reject",
            AbandonReason::BuildFailure => "build_failure",
            AbandonReason::SimulationFailure => "simulation_failure",
            AbandonReason::SimulationMode => "simulation_mode",
            AbandonReason::SubmissionFailure => "submission_failure",
            AbandonReason::InsufficientLiquidity => "insufficient_liquidity",
            AbandonReason::BreakerOpen => "breaker_open",
        }
    }
}

/// Execution lifecycle. Transitions are monotone forward; terminal states
/// are `Succeeded`, `Reverted`, and `Abandoned`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Created,
    Admitting,
    Building,
    Simulating,
    Submitting,
    Pending,
    Succeeded,
    Reverted,
    Abandoned(AbandonReason),
}

impl ExecutionState {
    /// Forward-progress rank; terminal states share the top rank so no
    /// terminal state can transition into another.
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionState::Created => 0,
            ExecutionState::Admitting => 1,
            ExecutionState::Building => 2,
            ExecutionState::Simulating => 3,
            ExecutionState::Submitting => 4,
            ExecutionState::Pending => 5,
            ExecutionState::Succeeded
            | ExecutionState::Reverted
            | ExecutionState::Abandoned(_) => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 6
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Created => "created",
            ExecutionState::Admitting => "admitting",
            ExecutionState::Building => "building",
            ExecutionState::Simulating => "simulating",
            ExecutionState::Submitting => "submitting",
            ExecutionState::Pending => "pending",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Reverted => "reverted",
            ExecutionState::Abandoned(_) => "abandoned",
        }
    }
}

/// An `Opportunity` promoted to action.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: Uuid,
    pub opportunity: Arc<Opportunity>,
    pub state: ExecutionState,
    pub tx_hash: Option<H256>,
    pub receipt: Option<TransactionReceipt>,
    pub gas_used: Option<U256>,
    pub realized_margin: crate::precision::SignedDecimal,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(opportunity: Arc<Opportunity>) -> Self {
        Self {
            id: Uuid::new_v4(),
            opportunity,
            state: ExecutionState::Created,
            tx_hash: None,
            receipt: None,
            gas_used: None,
            realized_margin: crate::precision::SignedDecimal::zero(
                crate::precision::NOTIONAL_PRECISION,
            ),
            finalized_at: None,
        }
    }

    /// Advance the state machine. Backward transitions are a programming
    /// error and are rejected, preserving the monotonicity invariant.
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return false;
        }
        if next.is_terminal() {
            self.finalized_at = Some(Utc::now());
        }
        self.state = next;
        true
    }
}

//================================================================================================//
//                                        REGISTRY                                                //
//================================================================================================//

/// Pre-allocated descriptor tables indexed by `(chain_id, key)`, built once
/// from config and shared read-only across components.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    chains: HashMap<u64, ChainDescriptor>,
    tokens: HashMap<(u64, String), TokenInfo>,
    tokens_by_address: HashMap<(u64, Address), TokenInfo>,
    venues: HashMap<(u64, String), VenueInfo>,
    providers: HashMap<(u64, String), FlashLoanProviderInfo>,
    pairs: Vec<WatchedPair>,
}

impl ChainRegistry {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut registry = ChainRegistry::default();

        for chain in &config.chains {
            registry.chains.insert(chain.chain_id, chain.descriptor());
        }

        for token in &config.tokens {
            if !registry.chains.contains_key(&token.chain_id) {
                return Err(ConfigError::UnknownReference {
                    kind: "chain",
                    key: token.symbol.clone(),
                    chain_id: token.chain_id,
                });
            }
            let info = TokenInfo {
                address: token.address,
                symbol: token.symbol.clone(),
                decimals: token.decimals,
            };
            registry
                .tokens_by_address
                .insert((token.chain_id, token.address), info.clone());
            registry
                .tokens
                .insert((token.chain_id, token.symbol.clone()), info);
        }

        for venue in &config.venues {
            if !registry.chains.contains_key(&venue.chain_id) {
                return Err(ConfigError::UnknownReference {
                    kind: "chain",
                    key: venue.key.clone(),
                    chain_id: venue.chain_id,
                });
            }
            registry
                .venues
                .insert((venue.chain_id, venue.key.clone()), venue.info());
        }

        for provider in &config.providers {
            let info = provider.info(&registry)?;
            registry
                .providers
                .insert((provider.chain_id, provider.key.clone()), info);
        }

        for pair in &config.pairs {
            for symbol in [&pair.token_a, &pair.token_b] {
                if !registry.tokens.contains_key(&(pair.chain_id, symbol.clone())) {
                    return Err(ConfigError::UnknownReference {
                        kind: "token",
                        key: symbol.clone(),
                        chain_id: pair.chain_id,
                    });
                }
            }
            registry.pairs.push(pair.watched());
        }

        // Back-fill each chain's key lists now that every table is loaded.
        for token in &config.tokens {
            if let Some(chain) = registry.chains.get_mut(&token.chain_id) {
                chain.token_symbols.push(token.symbol.clone());
            }
        }
        for venue in &config.venues {
            if let Some(chain) = registry.chains.get_mut(&venue.chain_id) {
                chain.venue_keys.push(venue.key.clone());
            }
        }
        for provider in &config.providers {
            if let Some(chain) = registry.chains.get_mut(&provider.chain_id) {
                chain.provider_keys.push(provider.key.clone());
            }
        }

        Ok(registry)
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainDescriptor> {
        self.chains.get(&chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainDescriptor> {
        self.chains.values()
    }

    pub fn token(&self, chain_id: u64, symbol: &str) -> Option<&TokenInfo> {
        self.tokens.get(&(chain_id, symbol.to_string()))
    }

    pub fn token_by_address(&self, chain_id: u64, address: Address) -> Option<&TokenInfo> {
        self.tokens_by_address.get(&(chain_id, address))
    }

    pub fn venue(&self, chain_id: u64, key: &str) -> Option<&VenueInfo> {
        self.venues.get(&(chain_id, key.to_string()))
    }

    pub fn venues_on(&self, chain_id: u64) -> Vec<&VenueInfo> {
        self.venues
            .values()
            .filter(|v| v.chain_id == chain_id)
            .collect()
    }

    pub fn provider(&self, chain_id: u64, key: &str) -> Option<&FlashLoanProviderInfo> {
        self.providers.get(&(chain_id, key.to_string()))
    }

    pub fn providers_on(&self, chain_id: u64) -> Vec<&FlashLoanProviderInfo> {
        self.providers
            .values()
            .filter(|p| p.chain_id == chain_id)
            .collect()
    }

    pub fn pairs_on(&self, chain_id: u64) -> Vec<&WatchedPair> {
        self.pairs.iter().filter(|p| p.chain_id == chain_id).collect()
    }
}

/// Convert a raw token amount to display units. Lossy; logging only.
pub fn normalize_units(amount: U256, decimals: u8) -> f64 {
    let divisor = 10_f64.powi(decimals as i32);
    amount.to_string().parse::<f64>().unwrap_or(0.0) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_state_is_monotone() {
        let states = [
            ExecutionState::Created,
            ExecutionState::Admitting,
            ExecutionState::Building,
            ExecutionState::Simulating,
            ExecutionState::Submitting,
            ExecutionState::Pending,
            ExecutionState::Succeeded,
        ];
        for pair in states.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
        assert!(ExecutionState::Abandoned(AbandonReason::EconomicReject).is_terminal());
    }

    #[test]
    fn terminal_states_do_not_advance() {
        let opp = crate::estimator::tests::sample_opportunity(1);
        let mut exec = Execution::new(Arc::new(opp));
        assert!(exec.advance(ExecutionState::Admitting));
        assert!(exec.advance(ExecutionState::Building));
        // Backward transition rejected.
        assert!(!exec.advance(ExecutionState::Admitting));
        assert!(exec.advance(ExecutionState::Abandoned(AbandonReason::EconomicReject)));
        assert!(exec.finalized_at.is_some());
        assert!(!exec.advance(ExecutionState::Succeeded));
    }
}
