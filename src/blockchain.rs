//! # Chain RPC Surface
//!
//! A clean, low-level abstraction over an EVM chain's JSON-RPC API: view
//! calls, gas pricing, signing and submission (public mempool or private
//! relay), receipt polling. Application-level logic (quoting, pricing,
//! risk) lives above this seam, which also makes the executor fully
//! testable against an in-memory implementation.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::{
    abi::{ParamType, Token},
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, TransactionReceipt,
        H256, U256,
    },
    utils::keccak256,
};
use ethers_flashbots::{BundleRequest, FlashbotsMiddleware};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::BlockchainError;
use crate::types::ChainDescriptor;

/// EIP-1559 fee structure: base fee plus priority tip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GasPrice {
    pub base_fee: U256,
    pub priority_fee: U256,
}

impl GasPrice {
    pub fn effective_price(&self) -> U256 {
        self.base_fee.saturating_add(self.priority_fee)
    }
}

/// The uniform chain surface the engine depends on. One instance per chain;
/// the single-executor-per-chain rule makes the nonce sequence owned by one
/// task at a time.
#[async_trait]
pub trait ChainClient: Send + Sync + Debug {
    fn chain_id(&self) -> u64;
    fn chain_name(&self) -> &str;
    fn operator(&self) -> Address;
    fn supports_private_relay(&self) -> bool;

    async fn block_number(&self) -> Result<u64, BlockchainError>;
    async fn gas_price(&self) -> Result<GasPrice, BlockchainError>;
    /// Read-only execution against latest state.
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, BlockchainError>;
    async fn native_balance(&self, address: Address) -> Result<U256, BlockchainError>;
    async fn has_code(&self, address: Address) -> Result<bool, BlockchainError>;
    async fn next_nonce(&self) -> Result<U256, BlockchainError>;
    /// Sign and submit; `private` routes through the relay when available.
    async fn submit(&self, tx: TypedTransaction, private: bool) -> Result<H256, BlockchainError>;
    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, BlockchainError>;

    /// ERC-20 `balanceOf` via eth_call. Default implementation encodes the
    /// selector by hand so in-memory test clients get it for free.
    async fn token_balance(
        &self,
        token: Address,
        owner: Address,
    ) -> Result<U256, BlockchainError> {
        let mut data = keccak256(b"balanceOf(address)")[..4].to_vec();
        data.extend_from_slice(&ethers::abi::encode(&[Token::Address(owner)]));
        let tx = TypedTransaction::Eip1559(
            ethers::types::Eip1559TransactionRequest::new()
                .to(token)
                .data(Bytes::from(data)),
        );
        let out = self.call(&tx).await?;
        let tokens = ethers::abi::decode(&[ParamType::Uint(256)], &out)
            .map_err(|e| BlockchainError::Rpc(format!("balanceOf decode: {}", e)))?;
        tokens
            .first()
            .and_then(|t| t.clone().into_uint())
            .ok_or_else(|| BlockchainError::Rpc("balanceOf returned no value".to_string()))
    }
}

/// Production client over an HTTP provider, with an optional private-relay
/// middleware for front-running-sensitive submissions.
pub struct EvmChainClient {
    chain_id: u64,
    chain_name: String,
    provider: Arc<Provider<Http>>,
    wallet: LocalWallet,
    relay: Option<FlashbotsMiddleware<Arc<Provider<Http>>, LocalWallet>>,
}

impl Debug for EvmChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChainClient")
            .field("chain_id", &self.chain_id)
            .field("chain_name", &self.chain_name)
            .field("operator", &self.wallet.address())
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

impl EvmChainClient {
    pub fn new(
        descriptor: &ChainDescriptor,
        wallet_key: &str,
        relay_url: Option<&str>,
    ) -> Result<Self, BlockchainError> {
        let provider = Provider::<Http>::try_from(descriptor.rpc_url.as_str())
            .map_err(|e| BlockchainError::Connection(e.to_string()))?;
        let provider = Arc::new(provider);

        let wallet: LocalWallet = wallet_key
            .parse::<LocalWallet>()
            .map_err(|e| BlockchainError::Signing(format!("invalid operator key: {}", e)))?
            .with_chain_id(descriptor.chain_id);

        let relay = match relay_url {
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| BlockchainError::Connection(format!("relay url: {}", e)))?;
                info!(chain = %descriptor.name, relay = %url, "private relay enabled");
                Some(FlashbotsMiddleware::new(
                    provider.clone(),
                    url,
                    wallet.clone(),
                ))
            }
            None => None,
        };

        Ok(Self {
            chain_id: descriptor.chain_id,
            chain_name: descriptor.name.clone(),
            provider,
            wallet,
            relay,
        })
    }

    async fn sign_raw(&self, tx: &TypedTransaction) -> Result<(Bytes, H256), BlockchainError> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| BlockchainError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Ok((raw, hash))
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    fn operator(&self) -> Address {
        self.wallet.address()
    }

    fn supports_private_relay(&self) -> bool {
        self.relay.is_some()
    }

    async fn block_number(&self) -> Result<u64, BlockchainError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| BlockchainError::Rpc(e.to_string()))
    }

    async fn gas_price(&self) -> Result<GasPrice, BlockchainError> {
        match self.provider.estimate_eip1559_fees(None).await {
            Ok((max_fee, priority_fee)) => Ok(GasPrice {
                base_fee: max_fee.saturating_sub(priority_fee),
                priority_fee,
            }),
            Err(e) => {
                debug!(
                    chain = %self.chain_name,
                    error = %e,
                    "eip1559 estimate unavailable, falling back to legacy gas price"
                );
                let legacy = self
                    .provider
                    .get_gas_price()
                    .await
                    .map_err(|e| BlockchainError::Rpc(e.to_string()))?;
                Ok(GasPrice {
                    base_fee: legacy,
                    priority_fee: U256::zero(),
                })
            }
        }
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, BlockchainError> {
        self.provider
            .call(tx, None)
            .await
            .map_err(|e| BlockchainError::Rpc(e.to_string()))
    }

    async fn native_balance(&self, address: Address) -> Result<U256, BlockchainError> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| BlockchainError::Rpc(e.to_string()))
    }

    async fn has_code(&self, address: Address) -> Result<bool, BlockchainError> {
        let code = self
            .provider
            .get_code(address, None)
            .await
            .map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        Ok(!code.is_empty())
    }

    async fn next_nonce(&self) -> Result<U256, BlockchainError> {
        self.provider
            .get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| BlockchainError::Rpc(e.to_string()))
    }

    async fn submit(&self, tx: TypedTransaction, private: bool) -> Result<H256, BlockchainError> {
        let (raw, hash) = self.sign_raw(&tx).await?;

        if private {
            if let Some(relay) = &self.relay {
                let target_block = self.block_number().await? + 1;
                let bundle = BundleRequest::new()
                    .set_block(target_block.into())
                    .push_transaction(raw);
                relay
                    .send_bundle(&bundle)
                    .await
                    .map_err(|e| BlockchainError::Submission(format!("relay: {}", e)))?;
                debug!(chain = %self.chain_name, %hash, target_block, "submitted via private relay");
                return Ok(hash);
            }
            warn!(
                chain = %self.chain_name,
                "private submission requested without a relay, using public mempool"
            );
        }

        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| BlockchainError::Submission(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, BlockchainError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| BlockchainError::Rpc(e.to_string()))
    }
}
