//! End-to-end pipeline scenarios over the in-memory harness: detection,
//! simulation-mode dry runs, economic collapse at re-check, on-chain
//! reverts feeding the risk supervisor, submission retry exhaustion, the
//! pending deadline, and kill-switch behavior mid-flight.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ethers::types::U256;

use common::{addr, Harness, SubmitScript, ROUTER_2, TOKEN_A, TOKEN_B};
use flasharb::types::{AbandonReason, DenialReason, ExecutionState};

/// Happy path in simulation mode: the opportunity is detected, queued,
/// simulated against live state, and halted before submission with no gas
/// spent.
#[tokio::test]
async fn simulation_mode_halts_before_submitting() {
    let harness = Harness::new(true).await;

    let enqueued = harness.scanner.tick().await.unwrap();
    assert_eq!(enqueued, 1);
    assert_eq!(
        harness.telemetry.totals().detected.load(Ordering::Relaxed),
        1
    );

    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();
    assert_eq!(opportunity.buy_venue, "vex-two");
    assert_eq!(opportunity.sell_venue, "vex-one");
    assert!(opportunity.estimate.profitable);
    assert!(opportunity.estimate.confidence >= 0.5);

    let execution = harness.executor.execute(opportunity).await;
    assert_eq!(
        execution.state,
        ExecutionState::Abandoned(AbandonReason::SimulationMode)
    );
    assert!(execution.tx_hash.is_none());
    assert!(harness.client.submissions.lock().await.is_empty());

    // Telemetry records a completed execution with zero gas.
    assert_eq!(
        harness.telemetry.totals().abandoned.load(Ordering::Relaxed),
        1
    );
    let stats = harness.risk.stats().await;
    assert_eq!(stats[0].budget.gas_spent_wei, U256::zero());
    assert_eq!(stats[0].budget.trades_submitted, 0);
}

/// The market moves between detection and building: the re-estimated
/// margin collapses and the execution abandons with no transaction built.
#[tokio::test]
async fn economic_collapse_at_recheck_abandons() {
    let harness = Harness::new(false).await;

    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();

    // Spread collapses from 80 bps to 5 bps before the executor re-checks.
    harness
        .client
        .set_rate(addr(ROUTER_2), addr(TOKEN_A), addr(TOKEN_B), "1.0005")
        .await;

    let execution = harness.executor.execute(opportunity).await;
    assert_eq!(
        execution.state,
        ExecutionState::Abandoned(AbandonReason::EconomicReject)
    );
    assert!(harness.client.submissions.lock().await.is_empty());
    assert_eq!(
        harness.telemetry.totals().detected.load(Ordering::Relaxed),
        1
    );
    assert_eq!(
        harness.telemetry.totals().abandoned.load(Ordering::Relaxed),
        1
    );
}

/// A successful inclusion records realized margin from the operator's
/// balance difference and measured gas from the receipt.
#[tokio::test]
async fn successful_execution_records_margin_and_gas() {
    let harness = Harness::new(false).await;
    harness
        .client
        .bump_on_success(addr(TOKEN_A), U256::exp10(18) * U256::from(200u64))
        .await;

    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();
    let execution = harness.executor.execute(opportunity).await;

    assert_eq!(execution.state, ExecutionState::Succeeded);
    assert!(execution.tx_hash.is_some());
    assert_eq!(execution.gas_used, Some(U256::from(420_000u64)));
    assert!((execution.realized_margin.to_f64_lossy() - 200.0).abs() < 1e-6);

    let stats = harness.risk.stats().await;
    assert_eq!(stats[0].budget.trades_submitted, 1);
    assert!(stats[0].budget.gas_spent_wei > U256::zero());
}

/// An on-chain revert is terminal, spends gas, and feeds the chain's
/// consecutive-failure accounting; the third revert pauses the chain.
#[tokio::test]
async fn reverts_accumulate_and_pause_the_chain() {
    let harness = Harness::new(false).await;

    for round in 0..3 {
        harness
            .client
            .script_submission(SubmitScript::Accept {
                status: 0,
                delay_polls: 0,
                gas_used: 380_000,
                effective_gas_price: 20_000_000_000,
            })
            .await;
        assert_eq!(harness.scanner.tick().await.unwrap(), 1, "round {}", round);
        let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();
        let execution = harness.executor.execute(opportunity).await;
        assert_eq!(execution.state, ExecutionState::Reverted);
    }

    let stats = harness.risk.stats().await;
    assert_eq!(stats[0].reverts_in_window, 3);
    assert!(stats[0].paused);
    assert_eq!(
        harness.risk.admit(common::CHAIN_ID, U256::zero()).await,
        flasharb::risk::AdmissionDecision::Denied(DenialReason::ChainPaused)
    );
    assert_eq!(
        harness.telemetry.totals().reverted.load(Ordering::Relaxed),
        3
    );
}

/// Node-side rejections are retried a bounded number of times with fresh
/// parameters, then the execution abandons with no gas spent.
#[tokio::test]
async fn submission_failures_are_bounded() {
    let harness = Harness::new(false).await;
    // Default submissionRetries = 2 -> three attempts total.
    for _ in 0..3 {
        harness.client.script_submission(SubmitScript::Reject).await;
    }

    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();
    let execution = harness.executor.execute(opportunity).await;

    assert_eq!(
        execution.state,
        ExecutionState::Abandoned(AbandonReason::SubmissionFailure)
    );
    let stats = harness.risk.stats().await;
    assert_eq!(stats[0].budget.gas_spent_wei, U256::zero());
}

/// A retry after a node rejection succeeds: the ladder recovers without
/// abandoning.
#[tokio::test]
async fn submission_retry_recovers() {
    let harness = Harness::new(false).await;
    harness.client.script_submission(SubmitScript::Reject).await;

    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();
    let execution = harness.executor.execute(opportunity).await;
    assert_eq!(execution.state, ExecutionState::Succeeded);
}

/// Inclusion past the pending deadline is accounted as a revert exactly
/// once; the execution does not wait for the late transaction.
#[tokio::test]
async fn pending_deadline_expiry_is_reverted_accounting() {
    let harness = Harness::new(false).await;
    harness
        .client
        .script_submission(SubmitScript::Accept {
            status: 1,
            delay_polls: u32::MAX,
            gas_used: 420_000,
            effective_gas_price: 20_000_000_000,
        })
        .await;

    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();
    let execution = harness.executor.execute(opportunity).await;

    assert_eq!(execution.state, ExecutionState::Reverted);
    // No receipt: the deadline path records zero gas.
    let stats = harness.risk.stats().await;
    assert_eq!(stats[0].reverts_in_window, 1);
    assert_eq!(stats[0].budget.gas_spent_wei, U256::zero());
}

/// Kill-switch mid-flight: no new work is admitted, but the in-flight
/// execution continues to its true outcome.
#[tokio::test]
async fn kill_switch_lets_pending_work_finish() {
    let harness = Harness::new(false).await;
    harness
        .client
        .script_submission(SubmitScript::Accept {
            status: 1,
            delay_polls: 2,
            gas_used: 420_000,
            effective_gas_price: 20_000_000_000,
        })
        .await;

    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
    let opportunity = harness.queue.dequeue(common::CHAIN_ID).await.unwrap();

    let executor = harness.executor.clone();
    let in_flight = tokio::spawn(async move { executor.execute(opportunity).await });

    // Engage the kill-switch while the transaction is pending.
    harness.risk.engage_kill_switch();
    harness.queue.close();
    assert!(
        !harness
            .queue
            .enqueue(Arc::new(harness.sample_opportunity()))
            .await
    );

    let execution = in_flight.await.unwrap();
    assert_eq!(execution.state, ExecutionState::Succeeded);
}

/// The oracle cross-check gates enqueue: a diverged pair is flagged and
/// nothing reaches the queue until the feeds agree again.
#[tokio::test]
async fn diverged_crosscheck_excludes_the_pair() {
    let harness = Harness::new(true).await;

    // Off-chain says parity while the buy venue quotes +8%: far beyond the
    // 2% sanity bound.
    harness
        .client
        .set_rate(addr(ROUTER_2), addr(TOKEN_A), addr(TOKEN_B), "1.08")
        .await;

    assert_eq!(harness.scanner.tick().await.unwrap(), 0);
    assert!(harness
        .oracle
        .is_pair_flagged(common::CHAIN_ID, addr(TOKEN_A), addr(TOKEN_B)));

    // The next tick skips the flagged pair outright.
    assert_eq!(harness.scanner.tick().await.unwrap(), 0);

    // Feeds re-converge; the crosscheck clears the flag and the pair
    // trades again.
    harness
        .client
        .set_rate(addr(ROUTER_2), addr(TOKEN_A), addr(TOKEN_B), "1.008")
        .await;
    let token_a = harness.token_a();
    let token_b = harness.registry.token(common::CHAIN_ID, "BBB").unwrap().clone();
    harness
        .oracle
        .crosscheck(common::CHAIN_ID, "vex-two", &token_a, &token_b, U256::exp10(18))
        .await
        .unwrap();
    assert_eq!(harness.scanner.tick().await.unwrap(), 1);
}

/// Oracle refresh flows through the coordinator and honors per-token
/// sequence monotonicity.
#[tokio::test]
async fn refresh_accepts_monotonic_snapshots() {
    let harness = Harness::new(true).await;
    harness
        .provider
        .set_price(addr(TOKEN_A), "1.25", 1_000_000.0)
        .await;

    let tokens = vec![harness.token_a()];
    let accepted = harness.oracle.refresh(&tokens).await.unwrap();
    assert_eq!(accepted, 1);
    let point = harness.oracle.price(addr(TOKEN_A)).unwrap();
    assert_eq!(
        point.price,
        flasharb::precision::PreciseDecimal::from_str_exact("1.25", 18).unwrap()
    );

    // The same sequence arriving again is discarded.
    let accepted_again = harness.oracle.refresh(&tokens).await.unwrap();
    assert_eq!(accepted_again, 1); // provider bumps its sequence each call
}
