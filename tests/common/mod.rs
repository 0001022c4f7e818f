//! Shared test harness: an in-memory chain client with scriptable quotes,
//! balances, submissions and receipts, plus a scripted pricing provider, so
//! the full scanner -> queue -> executor pipeline runs without a node.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::{
    abi::{ParamType, Token},
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionReceipt, H256, U256},
    utils::keccak256,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use flasharb::blockchain::{ChainClient, GasPrice};
use flasharb::config::Config;
use flasharb::coordinator::{
    Capability, DataCoordinator, DataCoordinatorBuilder, DataProvider, ProviderTier,
};
use flasharb::errors::{BlockchainError, CoordinatorError};
use flasharb::executor::{ExecutorSettings, FlashLoanExecutor};
use flasharb::flash_loan::FlashLoanRegistry;
use flasharb::precision::{PreciseDecimal, NOTIONAL_PRECISION};
use flasharb::price_oracle::PriceOracle;
use flasharb::queue::ExecutionQueue;
use flasharb::risk::RiskSupervisor;
use flasharb::scanner::{OpportunityScanner, ScannerSettings};
use flasharb::telemetry::TelemetrySink;
use flasharb::types::{ChainRegistry, PricePoint, TokenInfo};
use flasharb::venues::VenueRegistry;

pub const CHAIN_ID: u64 = 31337;

pub fn addr(low: u64) -> Address {
    Address::from_low_u64_be(low)
}

pub const TOKEN_A: u64 = 0xA1;
pub const TOKEN_B: u64 = 0xB1;
pub const TOKEN_NATIVE: u64 = 0xE1;
pub const ROUTER_1: u64 = 0x101;
pub const ROUTER_2: u64 = 0x102;
pub const POOL_AAVE: u64 = 0x201;
pub const RECEIVER: u64 = 0x301;
pub const OPERATOR: u64 = 0x401;

//================================================================================================//
//                                     MOCK CHAIN CLIENT                                          //
//================================================================================================//

/// How the mock answers the next submission.
#[derive(Debug, Clone)]
pub enum SubmitScript {
    /// Accept and later deliver a receipt with the given status after
    /// `delay_polls` receipt polls.
    Accept {
        status: u64,
        delay_polls: u32,
        gas_used: u64,
        effective_gas_price: u64,
    },
    /// Reject the submission at the node.
    Reject,
}

struct PendingReceipt {
    polls_left: u32,
    receipt: TransactionReceipt,
    bump_on_delivery: Option<(Address, U256)>,
}

pub struct MockChainClient {
    chain_id: u64,
    name: String,
    operator: Address,
    gas: Mutex<GasPrice>,
    block: AtomicU64,
    /// (router, token_in, token_out) -> rate numerator over 1e18.
    rates: Mutex<HashMap<(Address, Address, Address), U256>>,
    token_balances: Mutex<HashMap<(Address, Address), U256>>,
    native_balances: Mutex<HashMap<Address, U256>>,
    contracts: Mutex<HashSet<Address>>,
    simulate_revert: AtomicBool,
    submit_scripts: Mutex<VecDeque<SubmitScript>>,
    pending: Mutex<HashMap<H256, PendingReceipt>>,
    pub submissions: Mutex<Vec<TypedTransaction>>,
    /// Applied to the operator's balance when a success receipt lands.
    success_bump: Mutex<Option<(Address, U256)>>,
    nonce: AtomicU64,
}

impl Debug for MockChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChainClient")
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl MockChainClient {
    pub fn new() -> Arc<Self> {
        let client = Arc::new(Self {
            chain_id: CHAIN_ID,
            name: "testnet".to_string(),
            operator: addr(OPERATOR),
            gas: Mutex::new(GasPrice {
                base_fee: U256::from(15_000_000_000u64),
                priority_fee: U256::from(5_000_000_000u64),
            }),
            block: AtomicU64::new(100),
            rates: Mutex::new(HashMap::new()),
            token_balances: Mutex::new(HashMap::new()),
            native_balances: Mutex::new(HashMap::new()),
            contracts: Mutex::new(HashSet::new()),
            simulate_revert: AtomicBool::new(false),
            submit_scripts: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            success_bump: Mutex::new(None),
            nonce: AtomicU64::new(0),
        });
        client
    }

    pub async fn set_rate(&self, router: Address, token_in: Address, token_out: Address, rate: &str) {
        let rate = PreciseDecimal::from_str_exact(rate, 18).unwrap().raw();
        self.rates
            .lock()
            .await
            .insert((router, token_in, token_out), rate);
    }

    pub async fn set_token_balance(&self, token: Address, owner: Address, amount: U256) {
        self.token_balances.lock().await.insert((token, owner), amount);
    }

    pub async fn set_native_balance(&self, owner: Address, amount: U256) {
        self.native_balances.lock().await.insert(owner, amount);
    }

    pub async fn deploy(&self, address: Address) {
        self.contracts.lock().await.insert(address);
    }

    pub fn set_simulation_revert(&self, revert: bool) {
        self.simulate_revert.store(revert, Ordering::SeqCst);
    }

    pub async fn script_submission(&self, script: SubmitScript) {
        self.submit_scripts.lock().await.push_back(script);
    }

    pub async fn bump_on_success(&self, token: Address, amount: U256) {
        *self.success_bump.lock().await = Some((token, amount));
    }

    async fn answer_get_amounts_out(
        &self,
        router: Address,
        data: &[u8],
    ) -> Result<Bytes, BlockchainError> {
        let tokens = ethers::abi::decode(
            &[
                ParamType::Uint(256),
                ParamType::Array(Box::new(ParamType::Address)),
            ],
            data,
        )
        .map_err(|e| BlockchainError::Rpc(format!("decode getAmountsOut: {}", e)))?;
        let amount_in = tokens[0].clone().into_uint().unwrap_or_default();
        let path: Vec<Address> = tokens[1]
            .clone()
            .into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| t.into_address())
            .collect();
        if path.len() != 2 {
            return Err(BlockchainError::Rpc("unexpected path length".to_string()));
        }
        let rates = self.rates.lock().await;
        let rate = rates
            .get(&(router, path[0], path[1]))
            .copied()
            .ok_or_else(|| BlockchainError::Rpc("no rate configured".to_string()))?;
        let amount_out = amount_in * rate / U256::exp10(18);
        let encoded = ethers::abi::encode(&[Token::Array(vec![
            Token::Uint(amount_in),
            Token::Uint(amount_out),
        ])]);
        Ok(Bytes::from(encoded))
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn chain_name(&self) -> &str {
        &self.name
    }

    fn operator(&self) -> Address {
        self.operator
    }

    fn supports_private_relay(&self) -> bool {
        false
    }

    async fn block_number(&self) -> Result<u64, BlockchainError> {
        Ok(self.block.fetch_add(1, Ordering::SeqCst))
    }

    async fn gas_price(&self) -> Result<GasPrice, BlockchainError> {
        Ok(self.gas.lock().await.clone())
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, BlockchainError> {
        let to = match tx.to() {
            Some(ethers::types::NameOrAddress::Address(a)) => *a,
            _ => return Err(BlockchainError::Rpc("missing call target".to_string())),
        };
        let data = tx.data().cloned().unwrap_or_default();
        if data.len() < 4 {
            return Ok(Bytes::default());
        }
        let selector = &data[..4];

        if selector == &keccak256(b"getAmountsOut(uint256,address[])")[..4] {
            return self.answer_get_amounts_out(to, &data[4..]).await;
        }
        if selector == &keccak256(b"balanceOf(address)")[..4] {
            let owner = ethers::abi::decode(&[ParamType::Address], &data[4..])
                .ok()
                .and_then(|t| t.first().cloned())
                .and_then(|t| t.into_address())
                .unwrap_or_default();
            let balance = self
                .token_balances
                .lock()
                .await
                .get(&(to, owner))
                .copied()
                .unwrap_or_default();
            return Ok(Bytes::from(ethers::abi::encode(&[Token::Uint(balance)])));
        }
        if selector == &keccak256(b"executeFlashLoan(address,uint256,bytes)")[..4] {
            if self.simulate_revert.load(Ordering::SeqCst) {
                return Err(BlockchainError::Rpc("execution reverted".to_string()));
            }
            return Ok(Bytes::default());
        }
        Ok(Bytes::default())
    }

    async fn native_balance(&self, address: Address) -> Result<U256, BlockchainError> {
        Ok(self
            .native_balances
            .lock()
            .await
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn has_code(&self, address: Address) -> Result<bool, BlockchainError> {
        Ok(self.contracts.lock().await.contains(&address))
    }

    async fn next_nonce(&self) -> Result<U256, BlockchainError> {
        Ok(U256::from(self.nonce.load(Ordering::SeqCst)))
    }

    async fn submit(&self, tx: TypedTransaction, _private: bool) -> Result<H256, BlockchainError> {
        let script = self
            .submit_scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or(SubmitScript::Accept {
                status: 1,
                delay_polls: 0,
                gas_used: 420_000,
                effective_gas_price: 20_000_000_000,
            });
        match script {
            SubmitScript::Reject => Err(BlockchainError::Submission(
                "nonce conflict: replacement underpriced".to_string(),
            )),
            SubmitScript::Accept {
                status,
                delay_polls,
                gas_used,
                effective_gas_price,
            } => {
                let n = self.nonce.fetch_add(1, Ordering::SeqCst);
                let mut raw = tx.data().map(|d| d.to_vec()).unwrap_or_default();
                raw.extend_from_slice(&n.to_be_bytes());
                let hash = H256::from(keccak256(&raw));

                let mut receipt = TransactionReceipt::default();
                receipt.transaction_hash = hash;
                receipt.status = Some(status.into());
                receipt.gas_used = Some(U256::from(gas_used));
                receipt.effective_gas_price = Some(U256::from(effective_gas_price));

                let bump = if status == 1 {
                    self.success_bump.lock().await.clone()
                } else {
                    None
                };
                self.pending.lock().await.insert(
                    hash,
                    PendingReceipt {
                        polls_left: delay_polls,
                        receipt,
                        bump_on_delivery: bump,
                    },
                );
                self.submissions.lock().await.push(tx);
                Ok(hash)
            }
        }
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, BlockchainError> {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&hash) else {
            return Ok(None);
        };
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(None);
        }
        let receipt = entry.receipt.clone();
        if let Some((token, amount)) = entry.bump_on_delivery.take() {
            let mut balances = self.token_balances.lock().await;
            let entry = balances.entry((token, self.operator)).or_insert_with(U256::zero);
            *entry += amount;
        }
        Ok(Some(receipt))
    }
}

//================================================================================================//
//                                    MOCK PRICING PROVIDER                                       //
//================================================================================================//

#[derive(Debug)]
pub struct MockPricingProvider {
    name: String,
    capabilities: Vec<Capability>,
    prices: Mutex<HashMap<Address, (String, f64)>>,
    sequence: AtomicU64,
}

impl MockPricingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            name: "mock-pricing".to_string(),
            capabilities: vec![Capability::Pricing, Capability::MarketData],
            prices: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        })
    }

    pub async fn set_price(&self, token: Address, price: &str, volume_24h: f64) {
        self.prices
            .lock()
            .await
            .insert(token, (price.to_string(), volume_24h));
    }
}

#[async_trait]
impl DataProvider for MockPricingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn call(&self, method: &str, _params: Value) -> Result<Value, CoordinatorError> {
        if method != "prices" {
            return Err(CoordinatorError::ProviderConfig {
                provider: self.name.clone(),
                message: format!("unknown method {}", method),
            });
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let prices: Vec<Value> = self
            .prices
            .lock()
            .await
            .iter()
            .map(|(token, (price, volume))| {
                json!({
                    "token": format!("{:#x}", token),
                    "priceUsd": price,
                    "volume24h": volume,
                    "change24h": 0.0,
                    "provider": self.name,
                    "sequence": sequence,
                })
            })
            .collect();
        Ok(json!({ "prices": prices }))
    }

    async fn probe(&self) -> Result<(), CoordinatorError> {
        Ok(())
    }
}

//================================================================================================//
//                                         HARNESS                                                //
//================================================================================================//

pub fn harness_config(simulation_mode: bool) -> Config {
    let value = json!({
        "chains": [{
            "chainId": CHAIN_ID,
            "name": "testnet",
            "rpcUrl": "http://localhost:8545",
            "nativeSymbol": "ETH",
            "blockTimeMs": 10
        }],
        "tokens": [
            { "chainId": CHAIN_ID, "symbol": "AAA", "address": format!("{:#x}", addr(TOKEN_A)), "decimals": 18 },
            { "chainId": CHAIN_ID, "symbol": "BBB", "address": format!("{:#x}", addr(TOKEN_B)), "decimals": 18 },
            { "chainId": CHAIN_ID, "symbol": "ETH", "address": format!("{:#x}", addr(TOKEN_NATIVE)), "decimals": 18 }
        ],
        "venues": [
            {
                "chainId": CHAIN_ID, "key": "vex-one", "kind": "v2-router",
                "router": format!("{:#x}", addr(ROUTER_1)),
                "factory": format!("{:#x}", addr(ROUTER_1 + 1)),
                "feeBps": 5
            },
            {
                "chainId": CHAIN_ID, "key": "vex-two", "kind": "v2-router",
                "router": format!("{:#x}", addr(ROUTER_2)),
                "factory": format!("{:#x}", addr(ROUTER_2 + 1)),
                "feeBps": 5
            }
        ],
        "providers": [{
            "chainId": CHAIN_ID, "key": "aave-v3", "kind": "aave-v3",
            "pool": format!("{:#x}", addr(POOL_AAVE)),
            "tokens": [{ "symbol": "AAA" }],
            "gasLimitHint": 900000
        }],
        "pairs": [{
            "chainId": CHAIN_ID, "tokenA": "AAA", "tokenB": "BBB",
            "minTradeNotional": 1000, "probeAmount": "1", "probeDecimals": 18
        }],
        "operator": {
            "receiver": format!("{:#x}", addr(RECEIVER)),
            "walletKeyEnv": "FLASHARB_TEST_KEY",
            "minNativeReserve": "0.05"
        },
        "simulationMode": simulation_mode,
        "admissionCooldownMs": 0,
        "pendingDeadlineMs": 2000,
        "submissionTimeoutMs": 1000
    });
    serde_json::from_value(value).expect("harness config is valid")
}

pub struct Harness {
    pub config: Arc<Config>,
    pub registry: Arc<ChainRegistry>,
    pub client: Arc<MockChainClient>,
    pub provider: Arc<MockPricingProvider>,
    pub coordinator: Arc<DataCoordinator>,
    pub oracle: Arc<PriceOracle>,
    pub queue: Arc<ExecutionQueue>,
    pub risk: Arc<RiskSupervisor>,
    pub telemetry: Arc<TelemetrySink>,
    pub scanner: Arc<OpportunityScanner>,
    pub executor: Arc<FlashLoanExecutor>,
    pub simulation_mode: Arc<AtomicBool>,
}

impl Harness {
    pub async fn new(simulation_mode: bool) -> Self {
        let config = Arc::new(harness_config(simulation_mode));
        config.validate().expect("valid harness config");
        let registry = Arc::new(ChainRegistry::from_config(&config).unwrap());
        let telemetry = Arc::new(TelemetrySink::new());

        let provider = MockPricingProvider::new();
        let coordinator = Arc::new(
            DataCoordinatorBuilder::from_config(&config, telemetry.clone())
                .register(
                    provider.clone(),
                    ProviderTier::High,
                    Duration::from_millis(500),
                    4,
                )
                .build(),
        );

        let client = MockChainClient::new();
        let mut clients: HashMap<u64, Arc<dyn ChainClient>> = HashMap::new();
        clients.insert(CHAIN_ID, client.clone());

        let venues = Arc::new(VenueRegistry::from_registry(&registry));
        let flash_loans = Arc::new(FlashLoanRegistry::from_registry(
            &registry,
            config.circuit_breaker_threshold,
            Duration::from_millis(config.circuit_breaker_cooldown_ms),
        ));
        let oracle = Arc::new(PriceOracle::new(
            coordinator.clone(),
            venues.clone(),
            clients,
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
        let simulation = Arc::new(AtomicBool::new(simulation_mode));

        let chain = registry.chain(CHAIN_ID).unwrap().clone();
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
            ScannerSettings::from_config(&config),
        ));
        let executor = Arc::new(FlashLoanExecutor::new(
            chain.clone(),
            registry.clone(),
            oracle.clone(),
            venues,
            flash_loans,
            client.clone(),
            risk.clone(),
            telemetry.clone(),
            ExecutorSettings::from_config(&config, chain.block_time_ms),
            simulation.clone(),
        ));

        let harness = Self {
            config,
            registry,
            client,
            provider,
            coordinator,
            oracle,
            queue,
            risk,
            telemetry,
            scanner,
            executor,
            simulation_mode: simulation,
        };
        harness.seed_defaults().await;
        harness
    }

    /// A healthy world: fresh prices, deep pool, funded operator, deployed
    /// contracts, and a profitable 80 bps spread between the venues.
    async fn seed_defaults(&self) {
        self.seed_price(addr(TOKEN_A), "1.0", 5_000_000.0);
        self.seed_price(addr(TOKEN_B), "1.0", 5_000_000.0);
        self.seed_price(addr(TOKEN_NATIVE), "2000", 0.0);

        self.client
            .set_rate(addr(ROUTER_1), addr(TOKEN_A), addr(TOKEN_B), "1.0")
            .await;
        self.client
            .set_rate(addr(ROUTER_2), addr(TOKEN_A), addr(TOKEN_B), "1.008")
            .await;
        self.client
            .set_rate(addr(ROUTER_1), addr(TOKEN_B), addr(TOKEN_A), "0.999")
            .await;
        self.client
            .set_rate(addr(ROUTER_2), addr(TOKEN_B), addr(TOKEN_A), "0.992")
            .await;

        // Pool liquidity, operator gas reserve, deployed contracts.
        self.client
            .set_token_balance(addr(TOKEN_A), addr(POOL_AAVE), U256::exp10(24))
            .await;
        self.client
            .set_native_balance(addr(OPERATOR), U256::exp10(18))
            .await;
        self.client.deploy(addr(POOL_AAVE)).await;
        self.client.deploy(addr(RECEIVER)).await;
    }

    pub fn seed_price(&self, token: Address, price: &str, volume: f64) {
        self.oracle.seed_price(PricePoint {
            token,
            price: PreciseDecimal::from_str_exact(price, NOTIONAL_PRECISION).unwrap(),
            volume_24h: volume,
            change_24h: 0.0,
            origin: "seed".to_string(),
            observed_at: std::time::Instant::now(),
            sequence: 1,
        });
    }

    pub fn token_a(&self) -> TokenInfo {
        self.registry.token(CHAIN_ID, "AAA").unwrap().clone()
    }

    /// A hand-rolled profitable opportunity for queue-level tests that do
    /// not need the scanner.
    pub fn sample_opportunity(&self) -> flasharb::types::Opportunity {
        let input = flasharb::estimator::EstimatorInput {
            price_delta: PreciseDecimal::from_str_exact("0.008", NOTIONAL_PRECISION).unwrap(),
            trade_size: PreciseDecimal::from_integer(50_000, NOTIONAL_PRECISION),
            gas_units: 900_000,
            gas_price_wei: U256::from(20_000_000_000u64),
            gas_ceiling_wei: U256::from(300_000_000_000u64),
            native_price: PreciseDecimal::from_integer(2_000, NOTIONAL_PRECISION),
            provider_fee_bps: 5,
            buy_venue_fee_bps: 5,
            sell_venue_fee_bps: 5,
            depth_buy: PreciseDecimal::from_integer(5_000_000, NOTIONAL_PRECISION),
            depth_sell: PreciseDecimal::from_integer(5_000_000, NOTIONAL_PRECISION),
            params: self.config.estimator_params(),
        };
        flasharb::types::Opportunity {
            id: uuid::Uuid::new_v4(),
            chain_id: CHAIN_ID,
            token_in: self.token_a(),
            token_out: self.registry.token(CHAIN_ID, "BBB").unwrap().clone(),
            buy_venue: "vex-two".to_string(),
            sell_venue: "vex-one".to_string(),
            amount_in: U256::exp10(18) * U256::from(50_000u64),
            provider: "aave-v3".to_string(),
            estimate: flasharb::estimator::estimate(&input).unwrap(),
            detected_at: std::time::Instant::now(),
        }
    }
}
