// src/risk.rs

//! # Risk Supervisor
//!
//! Conjunctive admission control in front of every execution: global
//! kill-switch, per-chain revert pressure, per-UTC-day gas budgets, and an
//! admission cooldown against bursty thrashing. Denials are outcomes, not
//! errors. The supervisor also owns the kill-switch consulted by scanners
//! and the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use ethers::types::U256;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{ChainRegistry, DenialReason, ExecutionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    Denied(DenialReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

/// Per-chain, per-UTC-day accounting. Resets at day rollover.
#[derive(Debug, Clone)]
pub struct ChainBudget {
    pub day: NaiveDate,
    pub gas_spent_wei: U256,
    pub trades_submitted: u64,
    pub realized_margin_sum: f64,
}

impl ChainBudget {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            day,
            gas_spent_wei: U256::zero(),
            trades_submitted: 0,
            realized_margin_sum: 0.0,
        }
    }
}

#[derive(Debug)]
struct ChainRiskState {
    reverts: VecDeque<Instant>,
    last_admission: Option<Instant>,
    paused_until: Option<Instant>,
    budget: ChainBudget,
}

impl ChainRiskState {
    fn new() -> Self {
        Self {
            reverts: VecDeque::new(),
            last_admission: None,
            paused_until: None,
            budget: ChainBudget::fresh(Utc::now().date_naive()),
        }
    }

    fn roll_over_if_needed(&mut self, today: NaiveDate) {
        if self.budget.day != today {
            self.budget = ChainBudget::fresh(today);
        }
    }

    fn prune_reverts(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.reverts.front() {
            if now.duration_since(*front) > window {
                self.reverts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot for the operator status surface.
#[derive(Debug, Clone)]
pub struct ChainRiskStats {
    pub chain_id: u64,
    pub chain_name: String,
    pub reverts_in_window: usize,
    pub paused: bool,
    pub budget: ChainBudget,
    pub budget_cap_wei: Option<U256>,
}

pub struct RiskSupervisor {
    kill_switch: AtomicBool,
    chains: DashMap<u64, Mutex<ChainRiskState>>,
    chain_names: DashMap<u64, String>,
    budget_caps: DashMap<u64, U256>,
    revert_window: Duration,
    revert_threshold: usize,
    admission_cooldown: Duration,
    pause_duration: Duration,
    gas_headroom_factor: u64,
    telemetry: Arc<TelemetrySink>,
}

impl std::fmt::Debug for RiskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskSupervisor")
            .field("kill_switch", &self.kill_switch.load(Ordering::SeqCst))
            .field("chains", &self.chains.len())
            .finish()
    }
}

impl RiskSupervisor {
    pub fn new(
        config: &Config,
        registry: &ChainRegistry,
        telemetry: Arc<TelemetrySink>,
    ) -> Self {
        let supervisor = Self {
            kill_switch: AtomicBool::new(config.kill_switch),
            chains: DashMap::new(),
            chain_names: DashMap::new(),
            budget_caps: DashMap::new(),
            revert_window: Duration::from_secs(config.revert_window_secs),
            revert_threshold: config.revert_threshold,
            admission_cooldown: Duration::from_millis(config.admission_cooldown_ms),
            pause_duration: Duration::from_millis(config.pause_duration_ms),
            gas_headroom_factor: 2,
            telemetry,
        };
        for chain in registry.chains() {
            supervisor
                .chains
                .insert(chain.chain_id, Mutex::new(ChainRiskState::new()));
            supervisor
                .chain_names
                .insert(chain.chain_id, chain.name.clone());
            if let Some(cap) = config.daily_gas_budget_wei(&chain.name) {
                supervisor.budget_caps.insert(chain.chain_id, cap);
            }
        }
        supervisor
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn engage_kill_switch(&self) {
        if !self.kill_switch.swap(true, Ordering::SeqCst) {
            warn!("kill-switch engaged: no further admissions");
        }
    }

    fn chain_label(&self, chain_id: u64) -> String {
        self.chain_names
            .get(&chain_id)
            .map(|n| n.clone())
            .unwrap_or_else(|| chain_id.to_string())
    }

    /// Evaluate admission for a prospective execution. All rules must pass.
    pub async fn admit(&self, chain_id: u64, gas_estimate_wei: U256) -> AdmissionDecision {
        if self.kill_switch_engaged() {
            return AdmissionDecision::Denied(DenialReason::KillSwitch);
        }

        let Some(state) = self.chains.get(&chain_id) else {
            // Unknown chain: treat as paused rather than panicking the lane.
            return AdmissionDecision::Denied(DenialReason::ChainPaused);
        };
        let mut state = state.lock().await;
        let now = Instant::now();
        state.roll_over_if_needed(Utc::now().date_naive());

        if let Some(until) = state.paused_until {
            if now < until {
                return AdmissionDecision::Denied(DenialReason::ChainPaused);
            }
            state.paused_until = None;
        }

        state.prune_reverts(self.revert_window);
        if state.reverts.len() >= self.revert_threshold {
            return AdmissionDecision::Denied(DenialReason::RevertThreshold);
        }

        if let Some(cap) = self.budget_caps.get(&chain_id) {
            let headroom = cap.saturating_sub(state.budget.gas_spent_wei);
            let required = gas_estimate_wei.saturating_mul(U256::from(self.gas_headroom_factor));
            if headroom <= required {
                return AdmissionDecision::Denied(DenialReason::BudgetExhausted);
            }
        }

        if let Some(last) = state.last_admission {
            if now.duration_since(last) < self.admission_cooldown {
                return AdmissionDecision::Denied(DenialReason::Cooldown);
            }
        }

        state.last_admission = Some(now);
        AdmissionDecision::Admitted
    }

    /// Account a terminal execution. A revert beyond the threshold pauses
    /// the chain for the cooldown window and emits a breaker event.
    pub async fn record_terminal(
        &self,
        chain_id: u64,
        state_reached: &ExecutionState,
        gas_spent_wei: U256,
        realized_margin: f64,
    ) {
        let Some(state) = self.chains.get(&chain_id) else {
            return;
        };
        let mut state = state.lock().await;
        state.roll_over_if_needed(Utc::now().date_naive());

        state.budget.gas_spent_wei = state.budget.gas_spent_wei.saturating_add(gas_spent_wei);
        state.budget.realized_margin_sum += realized_margin;
        if matches!(
            state_reached,
            ExecutionState::Succeeded | ExecutionState::Reverted
        ) {
            state.budget.trades_submitted += 1;
        }

        if matches!(state_reached, ExecutionState::Reverted) {
            state.reverts.push_back(Instant::now());
            state.prune_reverts(self.revert_window);
            if state.reverts.len() >= self.revert_threshold {
                let until = Instant::now() + self.pause_duration;
                state.paused_until = Some(until);
                let chain = self.chain_label(chain_id);
                warn!(
                    chain = %chain,
                    reverts = state.reverts.len(),
                    pause_secs = self.pause_duration.as_secs(),
                    "revert threshold breached, pausing chain"
                );
                self.telemetry.emit(TelemetryEvent::BreakerOpened {
                    subject: format!("chain:{}", chain),
                });
            }
        }
    }

    pub async fn stats(&self) -> Vec<ChainRiskStats> {
        let mut out = Vec::new();
        for entry in self.chains.iter() {
            let chain_id = *entry.key();
            let mut state = entry.value().lock().await;
            state.roll_over_if_needed(Utc::now().date_naive());
            state.prune_reverts(self.revert_window);
            out.push(ChainRiskStats {
                chain_id,
                chain_name: self.chain_label(chain_id),
                reverts_in_window: state.reverts.len(),
                paused: state
                    .paused_until
                    .map(|until| Instant::now() < until)
                    .unwrap_or(false),
                budget: state.budget.clone(),
                budget_cap_wei: self.budget_caps.get(&chain_id).map(|c| *c),
            });
        }
        out
    }
}
