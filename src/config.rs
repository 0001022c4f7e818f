// src/config.rs

//! # Configuration
//!
//! A single JSON document loaded at startup is the source of truth for all
//! system parameters. Defaults are supplied through serde so a minimal config
//! stays minimal; validation fails closed before any task is spawned.

use std::collections::HashMap;
use std::path::Path;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::coordinator::{Capability, LoadBalancingPolicy, ProviderTier};
use crate::errors::ConfigError;
use crate::estimator::EstimatorParams;
use crate::precision::PreciseDecimal;
use crate::types::{
    ChainDescriptor, ChainRegistry, FlashLoanKind, FlashLoanProviderInfo, VenueInfo, VenueKind,
    WatchedPair,
};

//================================================================================================//
//                                       Top-Level Config                                         //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub venues: Vec<VenueConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub data_providers: Vec<DataProviderConfig>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,

    #[serde(default = "defaults::min_margin_bps")]
    pub min_margin_bps: u32,
    #[serde(default = "defaults::max_slippage_bps", alias = "maxSlippage")]
    pub max_slippage_bps: u32,
    #[serde(default)]
    pub reserve_fraction_bps: u32,
    /// Hard cap on trade notional in reference-currency units.
    #[serde(default = "defaults::max_trade_size")]
    pub max_trade_size: u64,
    /// Fraction of min-24h-volume used for sizing, in bps.
    #[serde(default = "defaults::volume_fraction_bps")]
    pub volume_fraction_bps: u32,
    /// Floor on the relative price difference worth pursuing, in bps.
    #[serde(default = "defaults::min_delta_bps")]
    pub min_delta_bps: u32,
    #[serde(default = "defaults::min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "defaults::scan_period_ms")]
    pub scan_period_ms: u64,
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "defaults::top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,
    #[serde(default = "defaults::route_retries")]
    pub route_retries: u32,
    #[serde(default = "defaults::enabled")]
    pub failover: bool,
    #[serde(default = "defaults::circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u64,
    #[serde(default = "defaults::circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,
    #[serde(default = "defaults::health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,

    #[serde(default = "defaults::price_ttl_ms")]
    pub price_ttl_ms: u64,
    #[serde(default = "defaults::price_refresh_ms")]
    pub price_refresh_ms: u64,
    /// Maximum tolerated off-chain vs on-chain divergence, in bps.
    #[serde(default = "defaults::sanity_bound_bps")]
    pub sanity_bound_bps: u64,

    #[serde(default = "defaults::submission_timeout_ms")]
    pub submission_timeout_ms: u64,
    #[serde(default = "defaults::submission_retries")]
    pub submission_retries: u32,
    #[serde(default = "defaults::pending_deadline_ms")]
    pub pending_deadline_ms: u64,

    /// Per-chain daily gas budget in native units, keyed by chain name.
    #[serde(default)]
    pub daily_gas_budget_native: HashMap<String, String>,
    #[serde(default = "defaults::revert_window_secs")]
    pub revert_window_secs: u64,
    #[serde(default = "defaults::revert_threshold")]
    pub revert_threshold: usize,
    #[serde(default = "defaults::admission_cooldown_ms")]
    pub admission_cooldown_ms: u64,
    #[serde(default = "defaults::pause_duration_ms")]
    pub pause_duration_ms: u64,

    /// Conservative fraction of provider liquidity considered borrowable.
    #[serde(default = "defaults::borrow_fraction_bps")]
    pub borrow_fraction_bps: u32,

    #[serde(default)]
    pub simulation_mode: bool,
    #[serde(default)]
    pub kill_switch: bool,

    pub operator: OperatorConfig,
}

mod defaults {
    pub fn min_margin_bps() -> u32 {
        25
    }
    pub fn max_slippage_bps() -> u32 {
        10
    }
    pub fn max_trade_size() -> u64 {
        50_000
    }
    pub fn volume_fraction_bps() -> u32 {
        100
    }
    pub fn min_delta_bps() -> u32 {
        10
    }
    pub fn min_confidence() -> f64 {
        0.5
    }
    pub fn scan_period_ms() -> u64 {
        5_000
    }
    pub fn queue_capacity() -> usize {
        64
    }
    pub fn top_k() -> usize {
        3
    }
    pub fn route_retries() -> u32 {
        3
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn circuit_breaker_threshold() -> u64 {
        5
    }
    pub fn circuit_breaker_cooldown_ms() -> u64 {
        60_000
    }
    pub fn health_probe_interval_ms() -> u64 {
        30_000
    }
    pub fn price_ttl_ms() -> u64 {
        30_000
    }
    pub fn price_refresh_ms() -> u64 {
        30_000
    }
    pub fn sanity_bound_bps() -> u64 {
        200
    }
    pub fn submission_timeout_ms() -> u64 {
        30_000
    }
    pub fn submission_retries() -> u32 {
        2
    }
    pub fn pending_deadline_ms() -> u64 {
        90_000
    }
    pub fn revert_window_secs() -> u64 {
        3_600
    }
    pub fn revert_threshold() -> usize {
        3
    }
    pub fn admission_cooldown_ms() -> u64 {
        500
    }
    pub fn pause_duration_ms() -> u64 {
        300_000
    }
    pub fn borrow_fraction_bps() -> u32 {
        8_000
    }
    pub fn gas_ceiling_gwei() -> u64 {
        300
    }
    pub fn provider_timeout_ms() -> u64 {
        10_000
    }
    pub fn provider_max_concurrency() -> usize {
        8
    }
    pub fn block_time_ms() -> u64 {
        12_000
    }
    pub fn native_decimals() -> u8 {
        18
    }
    pub fn min_native_reserve() -> String {
        "0.05".to_string()
    }
    pub fn metrics_port() -> u16 {
        9_090
    }
    pub fn metrics_host() -> String {
        "127.0.0.1".to_string()
    }
}

//================================================================================================//
//                                       Section structs                                          //
//================================================================================================//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub native_symbol: String,
    #[serde(default = "defaults::native_decimals")]
    pub native_decimals: u8,
    #[serde(default = "defaults::block_time_ms")]
    pub block_time_ms: u64,
    #[serde(default = "defaults::gas_ceiling_gwei")]
    pub gas_ceiling_gwei: u64,
}

impl ChainConfig {
    pub fn descriptor(&self) -> ChainDescriptor {
        ChainDescriptor {
            chain_id: self.chain_id,
            name: self.name.clone(),
            rpc_url: self.rpc_url.clone(),
            native_symbol: self.native_symbol.clone(),
            native_decimals: self.native_decimals,
            block_time_ms: self.block_time_ms,
            gas_ceiling_wei: U256::from(self.gas_ceiling_gwei) * U256::exp10(9),
            provider_keys: Vec::new(),
            venue_keys: Vec::new(),
            token_symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    pub chain_id: u64,
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueConfig {
    pub chain_id: u64,
    pub key: String,
    pub kind: VenueKind,
    pub router: Address,
    pub factory: Address,
    #[serde(default)]
    pub quoter: Option<Address>,
    pub fee_bps: u32,
}

impl VenueConfig {
    pub fn info(&self) -> VenueInfo {
        VenueInfo {
            key: self.key.clone(),
            chain_id: self.chain_id,
            kind: self.kind,
            router: self.router,
            factory: self.factory,
            quoter: self.quoter,
            fee_bps: self.fee_bps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTokenConfig {
    pub symbol: String,
    /// Optional cap on the borrowable amount, token units as a decimal string.
    #[serde(default)]
    pub max_borrow: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub chain_id: u64,
    pub key: String,
    pub kind: FlashLoanKind,
    pub pool: Address,
    #[serde(default)]
    pub fee_bps: Option<u32>,
    pub tokens: Vec<ProviderTokenConfig>,
    #[serde(default)]
    pub gas_limit_hint: Option<u64>,
}

impl ProviderConfig {
    pub fn info(&self, registry: &ChainRegistry) -> Result<FlashLoanProviderInfo, ConfigError> {
        let mut supported = HashMap::new();
        for t in &self.tokens {
            let token = registry
                .token(self.chain_id, &t.symbol)
                .ok_or_else(|| ConfigError::UnknownReference {
                    kind: "token",
                    key: t.symbol.clone(),
                    chain_id: self.chain_id,
                })?;
            let cap = match &t.max_borrow {
                Some(raw) => Some(
                    PreciseDecimal::from_str_exact(raw, token.decimals as u32)
                        .map_err(|e| ConfigError::Invalid(format!("maxBorrow `{}`: {}", raw, e)))?
                        .raw(),
                ),
                None => None,
            };
            supported.insert(token.address, cap);
        }
        Ok(FlashLoanProviderInfo {
            key: self.key.clone(),
            chain_id: self.chain_id,
            kind: self.kind,
            pool: self.pool,
            fee_bps: self.fee_bps.unwrap_or_else(|| self.kind.fee_bps()),
            supported_tokens: supported,
            gas_limit_hint: self.gas_limit_hint.unwrap_or(900_000),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProviderConfig {
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the bearer token, if the API needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub priority: ProviderTier,
    #[serde(default = "defaults::provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::provider_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConfig {
    pub chain_id: u64,
    pub token_a: String,
    pub token_b: String,
    #[serde(default)]
    pub min_trade_notional: u64,
    /// Probe amount for on-chain cross-checks, token-a units, decimal string.
    pub probe_amount: String,
    #[serde(default)]
    pub probe_decimals: Option<u8>,
}

impl PairConfig {
    pub fn watched(&self) -> WatchedPair {
        let decimals = self.probe_decimals.unwrap_or(18) as u32;
        let probe = PreciseDecimal::from_str_exact(&self.probe_amount, decimals)
            .map(|d| d.raw())
            .unwrap_or_else(|_| U256::exp10(decimals as usize));
        WatchedPair {
            chain_id: self.chain_id,
            token_a: self.token_a.clone(),
            token_b: self.token_b.clone(),
            min_trade_notional: self.min_trade_notional,
            probe_amount: probe,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Callback receiver contract that hosts the borrow-swap-repay sequence.
    pub receiver: Address,
    /// Environment variable holding the operator wallet key.
    pub wallet_key_env: String,
    /// Minimum native balance the operator must hold, native units.
    #[serde(default = "defaults::min_native_reserve")]
    pub min_native_reserve: String,
    #[serde(default)]
    pub private_relay_url: Option<String>,
    #[serde(default = "defaults::metrics_host")]
    pub metrics_host: String,
    #[serde(default = "defaults::metrics_port")]
    pub metrics_port: u16,
}

impl OperatorConfig {
    pub fn min_native_reserve_wei(&self) -> U256 {
        PreciseDecimal::from_str_exact(&self.min_native_reserve, 18)
            .map(|d| d.raw())
            .unwrap_or_else(|_| U256::exp10(16))
    }
}

//================================================================================================//
//                                     Loading & validation                                       //
//================================================================================================//

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn estimator_params(&self) -> EstimatorParams {
        EstimatorParams {
            min_margin_bps: self.min_margin_bps,
            max_slippage_bps: self.max_slippage_bps,
            reserve_fraction_bps: self.reserve_fraction_bps,
        }
    }

    /// Daily gas budget for a chain, parsed into wei. `None` means untracked.
    pub fn daily_gas_budget_wei(&self, chain_name: &str) -> Option<U256> {
        self.daily_gas_budget_native
            .get(chain_name)
            .and_then(|raw| PreciseDecimal::from_str_exact(raw, 18).ok())
            .map(|d| d.raw())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::Invalid("at least one chain required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate chain id {}",
                    chain.chain_id
                )));
            }
            if chain.rpc_url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "chain {} has an empty rpc url",
                    chain.name
                )));
            }
        }
        for venue in &self.venues {
            if venue.fee_bps > 10_000 {
                return Err(ConfigError::Invalid(format!(
                    "venue {} fee {} bps out of range",
                    venue.key, venue.fee_bps
                )));
            }
        }
        for provider in &self.providers {
            if provider.fee_bps.unwrap_or(0) > 10_000 {
                return Err(ConfigError::Invalid(format!(
                    "provider {} fee out of range",
                    provider.key
                )));
            }
            if provider.tokens.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider {} supports no tokens",
                    provider.key
                )));
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queueCapacity must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid(
                "minConfidence must be within [0, 1]".into(),
            ));
        }
        if self.borrow_fraction_bps == 0 || self.borrow_fraction_bps > 10_000 {
            return Err(ConfigError::Invalid(
                "borrowFractionBps must be within (0, 10000]".into(),
            ));
        }
        for budget in self.daily_gas_budget_native.values() {
            PreciseDecimal::from_str_exact(budget, 18)
                .map_err(|e| ConfigError::Invalid(format!("gas budget `{}`: {}", budget, e)))?;
        }
        for dp in self.data_providers.iter().filter(|dp| dp.enabled) {
            if dp.capabilities.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "data provider {} declares no capabilities",
                    dp.name
                )));
            }
            if dp.max_concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "data provider {} maxConcurrency must be positive",
                    dp.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "chains": [{
                "chainId": 1,
                "name": "mainnet",
                "rpcUrl": "http://localhost:8545",
                "nativeSymbol": "ETH"
            }],
            "operator": {
                "receiver": "0x00000000000000000000000000000000000000aa",
                "walletKeyEnv": "OPERATOR_KEY"
            }
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_json::from_value(minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.min_margin_bps, 25);
        assert_eq!(config.scan_period_ms, 5_000);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.pending_deadline_ms, 90_000);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert!(!config.simulation_mode);
    }

    #[test]
    fn duplicate_chain_ids_rejected() {
        let mut value = minimal_json();
        let chain = value["chains"][0].clone();
        value["chains"].as_array_mut().unwrap().push(chain);
        let config: Config = serde_json::from_value(value).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn gas_budget_parses_to_wei() {
        let mut value = minimal_json();
        value["dailyGasBudgetNative"] = serde_json::json!({"mainnet": "0.5"});
        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(
            config.daily_gas_budget_wei("mainnet").unwrap(),
            U256::exp10(18) / 2
        );
        assert!(config.daily_gas_budget_wei("arbitrum").is_none());
    }
}
