//! # Price Oracle
//!
//! Fuses off-chain provider snapshots with on-chain venue quotes. Off-chain
//! prices are refreshed in one batched coordinator call and cached with a
//! TTL; per-token observation is monotonic (an out-of-order snapshot is
//! discarded). Before any opportunity may be enqueued, the off-chain view
//! is cross-checked against an on-chain probe quote; a divergence beyond
//! the sanity bound flags the pair stale until a later check agrees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ethers::types::{Address, U256};
use moka::future::Cache;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::blockchain::ChainClient;
use crate::coordinator::{Capability, DataCoordinator, RouteOptions};
use crate::errors::OracleError;
use crate::precision::{PreciseDecimal, NOTIONAL_PRECISION};
use crate::types::{ChainRegistry, PricePoint, TokenInfo, VenueQuote};
use crate::venues::VenueRegistry;

const QUOTE_CACHE_CAPACITY: u64 = 10_000;

pub struct PriceOracle {
    coordinator: Arc<DataCoordinator>,
    venues: Arc<VenueRegistry>,
    clients: HashMap<u64, Arc<dyn ChainClient>>,
    registry: Arc<ChainRegistry>,
    ttl: Duration,
    sanity_bound_bps: u64,
    /// Latest accepted snapshot per token address.
    prices: DashMap<Address, PricePoint>,
    /// Pairs failing the off-chain/on-chain cross-check, keyed with the
    /// token addresses in sorted order so both directions share a flag.
    stale_pairs: DashMap<(u64, Address, Address), Instant>,
    quote_cache: Cache<(u64, String, Address, Address, U256), VenueQuote>,
}

impl std::fmt::Debug for PriceOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceOracle")
            .field("ttl", &self.ttl)
            .field("sanity_bound_bps", &self.sanity_bound_bps)
            .field("tracked_tokens", &self.prices.len())
            .field("flagged_pairs", &self.stale_pairs.len())
            .finish()
    }
}

impl PriceOracle {
    pub fn new(
        coordinator: Arc<DataCoordinator>,
        venues: Arc<VenueRegistry>,
        clients: HashMap<u64, Arc<dyn ChainClient>>,
        registry: Arc<ChainRegistry>,
        ttl: Duration,
        sanity_bound_bps: u64,
    ) -> Self {
        Self {
            coordinator,
            venues,
            clients,
            registry,
            ttl,
            sanity_bound_bps,
            prices: DashMap::new(),
            stale_pairs: DashMap::new(),
            quote_cache: Cache::builder()
                .max_capacity(QUOTE_CACHE_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    fn pair_key(chain_id: u64, a: Address, b: Address) -> (u64, Address, Address) {
        if a <= b {
            (chain_id, a, b)
        } else {
            (chain_id, b, a)
        }
    }

    /// One batched snapshot for every watched token. Returns how many
    /// snapshots were accepted.
    #[instrument(skip(self, tokens))]
    pub async fn refresh(&self, tokens: &[TokenInfo]) -> Result<usize, OracleError> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let addresses: Vec<String> = tokens
            .iter()
            .map(|t| format!("{:#x}", t.address))
            .collect();
        let reply = self
            .coordinator
            .route(
                Capability::Pricing,
                "prices",
                json!({ "tokens": addresses }),
                RouteOptions::default(),
            )
            .await?;

        let entries = reply
            .get("prices")
            .and_then(Value::as_array)
            .ok_or_else(|| OracleError::Malformed("missing `prices` array".to_string()))?;

        let mut accepted = 0usize;
        for entry in entries {
            match self.parse_entry(entry) {
                Ok(point) => {
                    // Monotonic per-token observation: an older or replayed
                    // snapshot never overwrites the last accepted one.
                    let insert = match self.prices.get(&point.token) {
                        Some(current) => point.sequence > current.sequence,
                        None => true,
                    };
                    if insert {
                        self.prices.insert(point.token, point);
                        accepted += 1;
                    }
                }
                Err(e) => warn!(error = %e, "discarding malformed price entry"),
            }
        }
        debug!(accepted, total = entries.len(), "price refresh complete");
        Ok(accepted)
    }

    fn parse_entry(&self, entry: &Value) -> Result<PricePoint, OracleError> {
        let token: Address = entry
            .get("token")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| OracleError::Malformed("bad token address".to_string()))?;
        let price_raw = match entry.get("priceUsd") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(OracleError::Malformed("missing priceUsd".to_string())),
        };
        let price = PreciseDecimal::from_str_exact(&price_raw, NOTIONAL_PRECISION)
            .map_err(|e| OracleError::Malformed(format!("priceUsd `{}`: {}", price_raw, e)))?;
        Ok(PricePoint {
            token,
            price,
            volume_24h: entry.get("volume24h").and_then(Value::as_f64).unwrap_or(0.0),
            change_24h: entry.get("change24h").and_then(Value::as_f64).unwrap_or(0.0),
            origin: entry
                .get("provider")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            observed_at: Instant::now(),
            sequence: entry.get("sequence").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    /// The fused price point, never older than the TTL. A stale point is
    /// reported as unavailable, not returned.
    pub fn price(&self, token: Address) -> Result<PricePoint, OracleError> {
        match self.prices.get(&token) {
            Some(point) if point.observed_at.elapsed() <= self.ttl => Ok(point.clone()),
            _ => Err(OracleError::Stale { token }),
        }
    }

    pub fn is_pair_flagged(&self, chain_id: u64, a: Address, b: Address) -> bool {
        self.stale_pairs
            .contains_key(&Self::pair_key(chain_id, a, b))
    }

    /// A fresh on-chain quote from the named venue, bypassing the cache.
    pub async fn fresh_quote(
        &self,
        chain_id: u64,
        venue: &str,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<VenueQuote, OracleError> {
        let adapter = self.venues.get(chain_id, venue).ok_or_else(|| {
            OracleError::Malformed(format!("unknown venue {} on chain {}", venue, chain_id))
        })?;
        let client = self.clients.get(&chain_id).ok_or_else(|| {
            OracleError::Malformed(format!("no chain client for chain {}", chain_id))
        })?;
        let amount_out = adapter
            .quote(client.as_ref(), token_in, token_out, amount_in)
            .await?;
        let block_number = client.block_number().await.unwrap_or_default();
        let quote = VenueQuote {
            chain_id,
            venue: venue.to_string(),
            token_in,
            token_out,
            amount_in,
            amount_out,
            block_number,
            observed_at: Instant::now(),
        };
        self.quote_cache
            .insert(
                (chain_id, venue.to_string(), token_in, token_out, amount_in),
                quote.clone(),
            )
            .await;
        Ok(quote)
    }

    /// Cached quote lookup with TTL, falling back to a fresh call.
    pub async fn quote(
        &self,
        chain_id: u64,
        venue: &str,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<VenueQuote, OracleError> {
        let key = (chain_id, venue.to_string(), token_in, token_out, amount_in);
        if let Some(cached) = self.quote_cache.get(&key).await {
            if cached.observed_at.elapsed() <= self.ttl {
                return Ok(cached);
            }
        }
        self.fresh_quote(chain_id, venue, token_in, token_out, amount_in)
            .await
    }

    /// Mandatory pre-enqueue reconciliation of the off-chain view against
    /// an on-chain probe quote. On divergence beyond the sanity bound the
    /// pair is flagged and excluded until a later check agrees.
    #[instrument(skip(self, token_in, token_out), fields(token_in = %token_in.symbol, token_out = %token_out.symbol))]
    pub async fn crosscheck(
        &self,
        chain_id: u64,
        venue: &str,
        token_in: &TokenInfo,
        token_out: &TokenInfo,
        probe_amount: U256,
    ) -> Result<VenueQuote, OracleError> {
        let off_in = self.price(token_in.address)?;
        let off_out = self.price(token_out.address)?;

        let quote = self
            .fresh_quote(chain_id, venue, token_in.address, token_out.address, probe_amount)
            .await?;

        // Implied on-chain ratio out/in, normalized by decimals.
        let in_units =
            PreciseDecimal::from_token_amount(quote.amount_in, token_in.decimals, NOTIONAL_PRECISION);
        let out_units = PreciseDecimal::from_token_amount(
            quote.amount_out,
            token_out.decimals,
            NOTIONAL_PRECISION,
        );
        let on_chain_ratio = out_units
            .checked_div(&in_units)
            .map_err(|e| OracleError::Malformed(format!("probe ratio: {}", e)))?;
        let off_chain_ratio = off_in
            .price
            .checked_div(&off_out.price)
            .map_err(|e| OracleError::Malformed(format!("price ratio: {}", e)))?;

        let (larger, smaller) = if on_chain_ratio >= off_chain_ratio {
            (on_chain_ratio, off_chain_ratio)
        } else {
            (off_chain_ratio, on_chain_ratio)
        };
        let diff = larger
            .checked_sub(&smaller)
            .map_err(|e| OracleError::Malformed(format!("ratio diff: {}", e)))?;
        let diff_bps = diff
            .ratio_bps(&smaller)
            .map_err(|e| OracleError::Malformed(format!("ratio diff bps: {}", e)))?;

        let key = Self::pair_key(chain_id, token_in.address, token_out.address);
        if diff_bps > self.sanity_bound_bps {
            warn!(
                diff_bps,
                bound_bps = self.sanity_bound_bps,
                token_in = %token_in.symbol,
                token_out = %token_out.symbol,
                "off-chain/on-chain divergence, flagging pair stale"
            );
            self.stale_pairs.insert(key, Instant::now());
            return Err(OracleError::CrossCheckDiverged {
                token_a: token_in.address,
                token_b: token_out.address,
                diff_bps,
            });
        }

        // Agreement clears any earlier flag.
        self.stale_pairs.remove(&key);
        Ok(quote)
    }

    /// All token descriptors referenced by watched pairs on any chain,
    /// including each chain's native-pricing token.
    pub fn watched_tokens(&self) -> Vec<TokenInfo> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for chain in self.registry.chains() {
            for pair in self.registry.pairs_on(chain.chain_id) {
                for symbol in [&pair.token_a, &pair.token_b] {
                    if let Some(token) = self.registry.token(chain.chain_id, symbol) {
                        if seen.insert((chain.chain_id, token.address)) {
                            out.push(token.clone());
                        }
                    }
                }
            }
            if let Some(native) = self.registry.token(chain.chain_id, &chain.native_symbol) {
                if seen.insert((chain.chain_id, native.address)) {
                    out.push(native.clone());
                }
            }
        }
        out
    }

    /// Test- and tooling-facing: seed a price point directly.
    #[doc(hidden)]
    pub fn seed_price(&self, point: PricePoint) {
        self.prices.insert(point.token, point);
    }
}
