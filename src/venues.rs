//! # Venue Adapters
//!
//! A closed, exhaustively-matched abstraction over the supported exchange
//! kinds. Each variant knows how to produce a view quote and how to encode
//! the swap call consumed by the on-chain callback receiver. This is the
//! only place that encodes router calldata.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use ethers::{
    abi::{Function, HumanReadableParser, ParamType, Token},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, U256},
};
use once_cell::sync::Lazy;
use tracing::instrument;

use crate::blockchain::ChainClient;
use crate::errors::VenueError;
use crate::types::{ChainRegistry, VenueInfo, VenueKind};

/// Function ABIs are parsed once and shared process-wide.
static FUNCTION_ABI_CACHE: Lazy<DashMap<&'static str, Arc<Function>>> = Lazy::new(DashMap::new);

fn function_abi(name: &'static str) -> Result<Arc<Function>, VenueError> {
    if let Some(f) = FUNCTION_ABI_CACHE.get(name) {
        return Ok(f.value().clone());
    }
    let signature = match name {
        "getAmountsOut" => {
            "function getAmountsOut(uint256 amountIn, address[] calldata path) external view returns (uint256[] memory amounts)"
        }
        "swapExactTokensForTokens" => {
            "function swapExactTokensForTokens(uint256 amountIn, uint256 amountOutMin, address[] calldata path, address to, uint256 deadline) external returns (uint256[] memory amounts)"
        }
        "quoteExactInputSingle" => {
            "function quoteExactInputSingle(address tokenIn, address tokenOut, uint24 fee, uint256 amountIn, uint160 sqrtPriceLimitX96) external returns (uint256 amountOut)"
        }
        "exactInputSingle" => {
            "function exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160) params) external payable returns (uint256 amountOut)"
        }
        _ => {
            return Err(VenueError::Calldata(format!(
                "unknown function signature for {}",
                name
            )))
        }
    };
    let function = HumanReadableParser::parse_function(signature)
        .map_err(|e| VenueError::Calldata(format!("failed to parse ABI for {}: {}", name, e)))?;
    let function = Arc::new(function);
    FUNCTION_ABI_CACHE.insert(name, function.clone());
    Ok(function)
}

fn encode_call(name: &'static str, tokens: &[Token]) -> Result<Bytes, VenueError> {
    function_abi(name)?
        .encode_input(tokens)
        .map(Bytes::from)
        .map_err(|e| VenueError::Calldata(format!("failed to encode {}: {}", name, e)))
}

/// A fully-encoded swap leg, ready to embed into the callback payload.
/// If executed, the call reverts unless the realized output covers
/// `min_amount_out` (router semantics enforce the invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapCall {
    pub venue: String,
    pub target: Address,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub min_amount_out: U256,
    pub calldata: Bytes,
}

#[derive(Debug, Clone)]
pub enum VenueAdapter {
    V2Router(VenueInfo),
    V3Router(VenueInfo),
}

impl VenueAdapter {
    pub fn new(info: VenueInfo) -> Self {
        match info.kind {
            VenueKind::V2Router => VenueAdapter::V2Router(info),
            VenueKind::V3Router => VenueAdapter::V3Router(info),
        }
    }

    pub fn info(&self) -> &VenueInfo {
        match self {
            VenueAdapter::V2Router(info) | VenueAdapter::V3Router(info) => info,
        }
    }

    pub fn fee_bps(&self) -> u32 {
        self.info().fee_bps
    }

    /// Pure view quote against latest chain state.
    #[instrument(skip(self, client), fields(venue = %self.info().key))]
    pub async fn quote(
        &self,
        client: &dyn ChainClient,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<U256, VenueError> {
        match self {
            VenueAdapter::V2Router(info) => {
                let calldata = encode_call(
                    "getAmountsOut",
                    &[
                        Token::Uint(amount_in),
                        Token::Array(vec![Token::Address(token_in), Token::Address(token_out)]),
                    ],
                )?;
                let tx = TypedTransaction::Eip1559(
                    ethers::types::Eip1559TransactionRequest::new()
                        .to(info.router)
                        .data(calldata),
                );
                let raw = client.call(&tx).await.map_err(|e| VenueError::Quote {
                    venue: info.key.clone(),
                    message: e.to_string(),
                })?;
                let decoded = ethers::abi::decode(
                    &[ParamType::Array(Box::new(ParamType::Uint(256)))],
                    &raw,
                )
                .map_err(|e| VenueError::Quote {
                    venue: info.key.clone(),
                    message: format!("decode: {}", e),
                })?;
                decoded
                    .first()
                    .and_then(|t| t.clone().into_array())
                    .and_then(|amounts| amounts.last().cloned())
                    .and_then(|t| t.into_uint())
                    .ok_or_else(|| VenueError::EmptyQuote {
                        venue: info.key.clone(),
                    })
            }
            VenueAdapter::V3Router(info) => {
                let quoter = info.quoter.ok_or_else(|| VenueError::Quote {
                    venue: info.key.clone(),
                    message: "no quoter configured".to_string(),
                })?;
                let calldata = encode_call(
                    "quoteExactInputSingle",
                    &[
                        Token::Address(token_in),
                        Token::Address(token_out),
                        Token::Uint(U256::from(info.fee_bps) * U256::from(100u64)),
                        Token::Uint(amount_in),
                        Token::Uint(U256::zero()),
                    ],
                )?;
                let tx = TypedTransaction::Eip1559(
                    ethers::types::Eip1559TransactionRequest::new()
                        .to(quoter)
                        .data(calldata),
                );
                let raw = client.call(&tx).await.map_err(|e| VenueError::Quote {
                    venue: info.key.clone(),
                    message: e.to_string(),
                })?;
                let decoded = ethers::abi::decode(&[ParamType::Uint(256)], &raw).map_err(|e| {
                    VenueError::Quote {
                        venue: info.key.clone(),
                        message: format!("decode: {}", e),
                    }
                })?;
                decoded
                    .first()
                    .and_then(|t| t.clone().into_uint())
                    .ok_or_else(|| VenueError::EmptyQuote {
                        venue: info.key.clone(),
                    })
            }
        }
    }

    /// Encode the swap leg. `min_amount_out` must come from the estimator's
    /// slippage-adjusted expectation, never zero.
    pub fn build_swap_call(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        min_amount_out: U256,
        recipient: Address,
        deadline: U256,
    ) -> Result<SwapCall, VenueError> {
        if min_amount_out.is_zero() {
            return Err(VenueError::Calldata(
                "min_amount_out must be positive".to_string(),
            ));
        }
        if recipient == Address::zero() {
            return Err(VenueError::Calldata("zero recipient".to_string()));
        }

        let calldata = match self {
            VenueAdapter::V2Router(_) => encode_call(
                "swapExactTokensForTokens",
                &[
                    Token::Uint(amount_in),
                    Token::Uint(min_amount_out),
                    Token::Array(vec![Token::Address(token_in), Token::Address(token_out)]),
                    Token::Address(recipient),
                    Token::Uint(deadline),
                ],
            )?,
            VenueAdapter::V3Router(info) => encode_call(
                "exactInputSingle",
                &[Token::Tuple(vec![
                    Token::Address(token_in),
                    Token::Address(token_out),
                    Token::Uint(U256::from(info.fee_bps) * U256::from(100u64)),
                    Token::Address(recipient),
                    Token::Uint(deadline),
                    Token::Uint(amount_in),
                    Token::Uint(min_amount_out),
                    Token::Uint(U256::zero()),
                ])],
            )?,
        };

        Ok(SwapCall {
            venue: self.info().key.clone(),
            target: self.info().router,
            token_in,
            token_out,
            amount_in,
            min_amount_out,
            calldata,
        })
    }
}

/// Pre-allocated adapter table indexed by `(chain_id, key)`.
#[derive(Debug, Default)]
pub struct VenueRegistry {
    adapters: HashMap<(u64, String), Arc<VenueAdapter>>,
}

impl VenueRegistry {
    pub fn from_registry(registry: &ChainRegistry) -> Self {
        let mut adapters = HashMap::new();
        for chain in registry.chains() {
            for venue in registry.venues_on(chain.chain_id) {
                adapters.insert(
                    (chain.chain_id, venue.key.clone()),
                    Arc::new(VenueAdapter::new(venue.clone())),
                );
            }
        }
        Self { adapters }
    }

    pub fn get(&self, chain_id: u64, key: &str) -> Option<Arc<VenueAdapter>> {
        self.adapters.get(&(chain_id, key.to_string())).cloned()
    }

    /// Adapters on a chain, sorted by key for deterministic iteration.
    pub fn on_chain(&self, chain_id: u64) -> Vec<Arc<VenueAdapter>> {
        let mut out: Vec<_> = self
            .adapters
            .iter()
            .filter(|((id, _), _)| *id == chain_id)
            .map(|(_, adapter)| adapter.clone())
            .collect();
        out.sort_by(|a, b| a.info().key.cmp(&b.info().key));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_info() -> VenueInfo {
        VenueInfo {
            key: "uniswap-v2".into(),
            chain_id: 1,
            kind: VenueKind::V2Router,
            router: Address::from_low_u64_be(0x11),
            factory: Address::from_low_u64_be(0x12),
            quoter: None,
            fee_bps: 30,
        }
    }

    fn v3_info() -> VenueInfo {
        VenueInfo {
            key: "uniswap-v3".into(),
            chain_id: 1,
            kind: VenueKind::V3Router,
            router: Address::from_low_u64_be(0x21),
            factory: Address::from_low_u64_be(0x22),
            quoter: Some(Address::from_low_u64_be(0x23)),
            fee_bps: 30,
        }
    }

    #[test]
    fn v2_swap_call_carries_min_out_and_deadline() {
        let adapter = VenueAdapter::new(v2_info());
        let call = adapter
            .build_swap_call(
                Address::from_low_u64_be(0xA),
                Address::from_low_u64_be(0xB),
                U256::from(1_000u64),
                U256::from(990u64),
                Address::from_low_u64_be(0xCC),
                U256::from(1_999_999u64),
            )
            .unwrap();
        assert_eq!(call.target, v2_info().router);
        // Selector for swapExactTokensForTokens.
        assert_eq!(&call.calldata[..4], &[0x38, 0xed, 0x17, 0x39]);
        assert_eq!(call.min_amount_out, U256::from(990u64));
    }

    #[test]
    fn v3_swap_call_uses_pool_fee_units() {
        let adapter = VenueAdapter::new(v3_info());
        let call = adapter
            .build_swap_call(
                Address::from_low_u64_be(0xA),
                Address::from_low_u64_be(0xB),
                U256::from(1_000u64),
                U256::from(990u64),
                Address::from_low_u64_be(0xCC),
                U256::from(1_999_999u64),
            )
            .unwrap();
        // 30 bps venue fee encodes as the 3000 pool-fee tier.
        let fee_word = U256::from_big_endian(&call.calldata[4 + 64..4 + 96]);
        assert_eq!(fee_word, U256::from(3_000u64));
    }

    #[test]
    fn zero_min_out_is_rejected() {
        let adapter = VenueAdapter::new(v2_info());
        let err = adapter
            .build_swap_call(
                Address::from_low_u64_be(0xA),
                Address::from_low_u64_be(0xB),
                U256::from(1_000u64),
                U256::zero(),
                Address::from_low_u64_be(0xCC),
                U256::from(1_999_999u64),
            )
            .unwrap_err();
        assert!(matches!(err, VenueError::Calldata(_)));
    }

    #[test]
    fn swap_call_encoding_is_deterministic() {
        let adapter = VenueAdapter::new(v2_info());
        let build = || {
            adapter
                .build_swap_call(
                    Address::from_low_u64_be(0xA),
                    Address::from_low_u64_be(0xB),
                    U256::from(1_000u64),
                    U256::from(990u64),
                    Address::from_low_u64_be(0xCC),
                    U256::from(1_999_999u64),
                )
                .unwrap()
        };
        assert_eq!(build(), build());
    }
}
