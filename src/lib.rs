//! Flash-loan funded cross-venue arbitrage engine for EVM chains.
//!
//! The pipeline: per-chain [`scanner::OpportunityScanner`]s fuse off-chain
//! prices from the [`coordinator::DataCoordinator`] with on-chain quotes
//! through the [`price_oracle::PriceOracle`], price candidates with the pure
//! [`estimator`], and push ranked survivors into the per-chain
//! [`queue::ExecutionQueue`]. One [`executor::FlashLoanExecutor`] worker per
//! chain drains its lane under [`risk::RiskSupervisor`] admission and drives
//! the atomic borrow-swap-repay transaction to a terminal state, reporting
//! through the [`telemetry::TelemetrySink`].

pub mod blockchain;
pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod estimator;
pub mod executor;
pub mod flash_loan;
pub mod metrics;
pub mod precision;
pub mod price_oracle;
pub mod queue;
pub mod risk;
pub mod scanner;
pub mod telemetry;
pub mod types;
pub mod venues;
