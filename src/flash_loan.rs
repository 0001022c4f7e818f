//! # Flash-Loan Provider Adapters
//!
//! Closed set of lending protocols the engine can borrow from within a
//! single transaction. Each variant reports its fee, a conservative
//! max-borrow, and a health verdict, and builds the outer borrow
//! transaction targeting the callback receiver contract. Variant wire ids
//! must exactly match the receiver's on-chain enum values.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use ethers::{
    abi::{Function, HumanReadableParser, Token},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, U256},
};
use once_cell::sync::Lazy;
use tracing::{debug, instrument};

use crate::blockchain::ChainClient;
use crate::errors::FlashLoanError;
use crate::types::{ChainRegistry, FlashLoanKind, FlashLoanProviderInfo};

static EXECUTE_FLASH_LOAN_ABI: Lazy<DashMap<&'static str, Arc<Function>>> = Lazy::new(DashMap::new);

fn execute_flash_loan_abi() -> Result<Arc<Function>, FlashLoanError> {
    if let Some(f) = EXECUTE_FLASH_LOAN_ABI.get("executeFlashLoan") {
        return Ok(f.value().clone());
    }
    let function = HumanReadableParser::parse_function(
        "function executeFlashLoan(address asset, uint256 amount, bytes calldata params) external",
    )
    .map_err(|e| FlashLoanError::Calldata(format!("failed to parse receiver ABI: {}", e)))?;
    let function = Arc::new(function);
    EXECUTE_FLASH_LOAN_ABI.insert("executeFlashLoan", function.clone());
    Ok(function)
}

#[derive(Debug, Clone)]
pub enum FlashLoanAdapter {
    AaveV3(FlashLoanProviderInfo),
    BalancerV2(FlashLoanProviderInfo),
    MakerDss(FlashLoanProviderInfo),
}

impl FlashLoanAdapter {
    pub fn new(info: FlashLoanProviderInfo) -> Self {
        match info.kind {
            FlashLoanKind::AaveV3 => FlashLoanAdapter::AaveV3(info),
            FlashLoanKind::BalancerV2 => FlashLoanAdapter::BalancerV2(info),
            FlashLoanKind::MakerDss => FlashLoanAdapter::MakerDss(info),
        }
    }

    pub fn info(&self) -> &FlashLoanProviderInfo {
        match self {
            FlashLoanAdapter::AaveV3(info)
            | FlashLoanAdapter::BalancerV2(info)
            | FlashLoanAdapter::MakerDss(info) => info,
        }
    }

    pub fn key(&self) -> &str {
        &self.info().key
    }

    pub fn fee_bps(&self) -> u32 {
        self.info().fee_bps
    }

    /// Fee owed on top of the principal for a given borrow.
    pub fn fee_for(&self, amount: U256) -> U256 {
        amount * U256::from(self.fee_bps()) / U256::from(10_000u64)
    }

    /// Conservative borrow ceiling: a configured fraction of the provider
    /// pool's on-hand liquidity, further capped by any per-token limit.
    #[instrument(skip(self, client), fields(provider = self.key()))]
    pub async fn max_borrow(
        &self,
        client: &dyn ChainClient,
        token: Address,
        borrow_fraction_bps: u32,
    ) -> Result<U256, FlashLoanError> {
        let info = self.info();
        let cap = match info.supported_tokens.get(&token) {
            Some(cap) => *cap,
            None => {
                return Err(FlashLoanError::UnsupportedToken {
                    provider: info.key.clone(),
                    token,
                })
            }
        };

        let liquidity = client.token_balance(token, info.pool).await?;
        let available = liquidity * U256::from(borrow_fraction_bps) / U256::from(10_000u64);
        let ceiling = match cap {
            Some(cap) => available.min(cap),
            None => available,
        };
        debug!(token = %token, %liquidity, %ceiling, "computed max borrow");
        Ok(ceiling)
    }

    /// Provider health: the pool contract must be readable and the operator
    /// wallet must hold enough native balance to pay for the transaction.
    pub async fn is_healthy(
        &self,
        client: &dyn ChainClient,
        min_native_reserve: U256,
    ) -> Result<(), FlashLoanError> {
        let info = self.info();
        let has_code = client.has_code(info.pool).await?;
        if !has_code {
            return Err(FlashLoanError::ProviderUnhealthy {
                provider: info.key.clone(),
                reason: "pool contract has no code".to_string(),
            });
        }
        let reserve = client.native_balance(client.operator()).await?;
        if reserve < min_native_reserve {
            return Err(FlashLoanError::ProviderUnhealthy {
                provider: info.key.clone(),
                reason: format!(
                    "operator native reserve {} below minimum {}",
                    reserve, min_native_reserve
                ),
            });
        }
        Ok(())
    }

    /// Build the outer borrow transaction: a call to the receiver's
    /// `executeFlashLoan(asset, amount, params)` where `params` carries the
    /// provider wire id, its pool address, and the opaque callback payload.
    /// The receiver borrows from the identified pool, runs the payload, and
    /// reverts the whole transaction unless repayment plus minimum profit
    /// is covered.
    pub fn build_borrow_tx(
        &self,
        receiver: Address,
        token: Address,
        amount: U256,
        callback_payload: Bytes,
    ) -> Result<TypedTransaction, FlashLoanError> {
        let info = self.info();
        if !info.supports(token) {
            return Err(FlashLoanError::UnsupportedToken {
                provider: info.key.clone(),
                token,
            });
        }
        if amount.is_zero() {
            return Err(FlashLoanError::Calldata("zero borrow amount".to_string()));
        }

        let params = ethers::abi::encode(&[
            Token::Uint(U256::from(info.kind.wire_id())),
            Token::Address(info.pool),
            Token::Bytes(callback_payload.to_vec()),
        ]);

        let calldata = execute_flash_loan_abi()?
            .encode_input(&[
                Token::Address(token),
                Token::Uint(amount),
                Token::Bytes(params),
            ])
            .map(Bytes::from)
            .map_err(|e| FlashLoanError::Calldata(format!("executeFlashLoan encode: {}", e)))?;

        let request = ethers::types::Eip1559TransactionRequest::new()
            .to(receiver)
            .data(calldata)
            .gas(U256::from(info.gas_limit_hint));

        Ok(TypedTransaction::Eip1559(request))
    }
}

/// Pre-allocated adapter table indexed by `(chain_id, key)`, each entry
/// paired with a breaker that build failures tick and the scanner consults.
#[derive(Debug, Default)]
pub struct FlashLoanRegistry {
    adapters: HashMap<(u64, String), Arc<FlashLoanAdapter>>,
    breakers: HashMap<(u64, String), Arc<crate::breaker::CircuitBreaker>>,
}

impl FlashLoanRegistry {
    pub fn from_registry(
        registry: &ChainRegistry,
        breaker_threshold: u64,
        breaker_cooldown: std::time::Duration,
    ) -> Self {
        let mut adapters = HashMap::new();
        let mut breakers = HashMap::new();
        for chain in registry.chains() {
            for provider in registry.providers_on(chain.chain_id) {
                let key = (chain.chain_id, provider.key.clone());
                adapters.insert(key.clone(), Arc::new(FlashLoanAdapter::new(provider.clone())));
                breakers.insert(
                    key,
                    Arc::new(crate::breaker::CircuitBreaker::new(
                        format!("flash-loan:{}:{}", chain.name, provider.key),
                        breaker_threshold,
                        breaker_cooldown,
                    )),
                );
            }
        }
        Self { adapters, breakers }
    }

    pub fn get(&self, chain_id: u64, key: &str) -> Option<Arc<FlashLoanAdapter>> {
        self.adapters.get(&(chain_id, key.to_string())).cloned()
    }

    pub fn breaker(&self, chain_id: u64, key: &str) -> Option<Arc<crate::breaker::CircuitBreaker>> {
        self.breakers.get(&(chain_id, key.to_string())).cloned()
    }

    /// Adapters on a chain, sorted by key for deterministic selection.
    pub fn on_chain(&self, chain_id: u64) -> Vec<Arc<FlashLoanAdapter>> {
        let mut out: Vec<_> = self
            .adapters
            .iter()
            .filter(|((id, _), _)| *id == chain_id)
            .map(|(_, adapter)| adapter.clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }
}
