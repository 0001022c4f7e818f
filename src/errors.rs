//! # Centralized Error Handling
//!
//! Hierarchical, typed errors for the whole engine. Each subsystem owns its
//! error enum; `EngineError` is the roll-up used at task boundaries and in
//! `main`. Expected outcomes (economic rejection, admission denial, breaker
//! open on an alternative path, abandonment) are NOT errors: they travel in
//! normal return types (`AdmissionDecision`, `AbandonReason`).

use ethers::types::{Address, H256};
use thiserror::Error;

use crate::coordinator::Capability;

/// The top-level error type, encapsulating all failures within the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Market data coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("Price oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("Venue adapter error: {0}")]
    Venue(#[from] VenueError),
    #[error("Flash-loan provider error: {0}")]
    FlashLoan(#[from] FlashLoanError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("System shut down")]
    Shutdown,
}

/// Errors related to configuration loading and validation. All are fatal at
/// startup (exit code 1).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Config references unknown {kind} `{key}` on chain {chain_id}")]
    UnknownReference {
        kind: &'static str,
        key: String,
        chain_id: u64,
    },
}

/// Errors surfaced by the market data coordinator.
///
/// `Transient` and `Timeout` are retried inside the coordinator and count
/// toward the provider's circuit breaker; `Exhausted` is what callers see
/// when both the primary and failover paths are spent.
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("Transient provider error from {provider}: {message}")]
    Transient { provider: String, message: String },
    #[error("Provider {provider} rate-limited the request")]
    RateLimited { provider: String },
    #[error("Provider {provider} rejected the request as misconfigured: {message}")]
    ProviderConfig { provider: String, message: String },
    #[error("No registered provider supports capability {0:?}")]
    UnsupportedCapability(Capability),
    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
    #[error("Circuit breaker open for provider {provider}")]
    BreakerOpen { provider: String },
    #[error("All providers exhausted for capability {capability:?} after {attempts} attempts")]
    Exhausted {
        capability: Capability,
        attempts: u32,
    },
}

impl CoordinatorError {
    /// Whether the failure should tick the originating provider's breaker.
    /// Capability mismatches and exhaustion are routing outcomes, not
    /// provider faults.
    pub fn counts_against_provider(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Transient { .. }
                | CoordinatorError::RateLimited { .. }
                | CoordinatorError::Timeout { .. }
        )
    }
}

/// Errors from the price oracle. A stale pair is reported as
/// unavailable rather than returning a stale value.
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("No fresh price for token {token} (last update beyond TTL)")]
    Stale { token: Address },
    #[error("Pair {token_a}/{token_b} flagged stale: off-chain/on-chain divergence {diff_bps} bps")]
    CrossCheckDiverged {
        token_a: Address,
        token_b: Address,
        diff_bps: u64,
    },
    #[error("Price snapshot malformed: {0}")]
    Malformed(String),
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("Venue error: {0}")]
    Venue(#[from] VenueError),
}

/// Errors from venue adapters.
#[derive(Error, Debug)]
pub enum VenueError {
    #[error("Failed to encode calldata: {0}")]
    Calldata(String),
    #[error("Quote call failed on venue {venue}: {message}")]
    Quote { venue: String, message: String },
    #[error("Quote returned no output amount for venue {venue}")]
    EmptyQuote { venue: String },
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
}

/// Errors from flash-loan provider adapters. These propagate to the
/// executor without retry.
#[derive(Error, Debug)]
pub enum FlashLoanError {
    #[error("Provider {provider} does not support token {token}")]
    UnsupportedToken { provider: String, token: Address },
    #[error("Provider {provider} unhealthy: {reason}")]
    ProviderUnhealthy { provider: String, reason: String },
    #[error("Requested borrow {requested} exceeds max borrow {max} for token {token}")]
    BorrowTooLarge {
        token: Address,
        requested: ethers::types::U256,
        max: ethers::types::U256,
    },
    #[error("Failed to encode borrow transaction: {0}")]
    Calldata(String),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
}

/// Errors from the chain RPC surface.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Provider connection error: {0}")]
    Connection(String),
    #[error("RPC call failed: {0}")]
    Rpc(String),
    #[error("RPC call timed out: {0}")]
    Timeout(String),
    #[error("Transaction signing failed: {0}")]
    Signing(String),
    #[error("Transaction submission failed: {0}")]
    Submission(String),
    #[error("Receipt not yet available for {0}")]
    ReceiptUnavailable(H256),
    #[error("Chain {0} is not configured")]
    NotConfigured(u64),
}

/// Errors inside the execution state machine. These are internal
/// propagation types; the terminal outcome seen by callers is always an
/// `ExecutionState` with an `AbandonReason` where applicable.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Build failed: {0}")]
    Build(String),
    #[error("Simulation failed: {0}")]
    Simulation(String),
    #[error("Submission failed: {0}")]
    Submission(String),
    #[error("Venue error: {0}")]
    Venue(#[from] VenueError),
    #[error("Flash-loan error: {0}")]
    FlashLoan(#[from] FlashLoanError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),
}
