//! # Telemetry Sink
//!
//! Structured events for every key transition in the pipeline. Emission is
//! non-blocking: events are mirrored into the Prometheus series and fanned
//! out on a broadcast channel for external consumers; a lagging subscriber
//! never stalls the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use ethers::types::H256;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::metrics;

const EVENT_CHANNEL_CAPACITY: usize = 4_096;

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    OpportunityDetected {
        chain: String,
        id: Uuid,
        net_margin_bps: i64,
        recommendation: &'static str,
    },
    OpportunityEnqueued {
        chain: String,
        id: Uuid,
    },
    OpportunityDropped {
        chain: String,
        id: Uuid,
    },
    ExecutionStateChanged {
        chain: String,
        execution: Uuid,
        from: &'static str,
        to: &'static str,
        reason: Option<String>,
    },
    ExecutionCompleted {
        chain: String,
        execution: Uuid,
        outcome: &'static str,
        realized_margin: f64,
        gas_spent_native: f64,
    },
    BreakerOpened {
        subject: String,
    },
    BreakerClosed {
        subject: String,
    },
    ProviderHealthChanged {
        provider: String,
        healthy: bool,
    },
    /// A transaction whose execution already timed out was mined afterwards.
    /// Tracked for reconciliation only; the execution does not wait for it.
    LatePendingInclusion {
        chain: String,
        tx_hash: H256,
    },
}

/// Running totals used for the shutdown status summary.
#[derive(Debug, Default)]
pub struct TelemetryTotals {
    pub detected: AtomicU64,
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub succeeded: AtomicU64,
    pub reverted: AtomicU64,
    pub abandoned: AtomicU64,
}

#[derive(Debug)]
pub struct TelemetrySink {
    events: broadcast::Sender<TelemetryEvent>,
    totals: TelemetryTotals,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            totals: TelemetryTotals::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    /// Record an event. Never blocks and never fails: a send error only
    /// means there is currently no subscriber.
    pub fn emit(&self, event: TelemetryEvent) {
        self.mirror_to_metrics(&event);
        debug!(target: "telemetry", event = ?event, "telemetry event");
        let _ = self.events.send(event);
    }

    pub fn totals(&self) -> &TelemetryTotals {
        &self.totals
    }

    pub fn summary(&self) -> String {
        format!(
            "detected={} enqueued={} dropped={} succeeded={} reverted={} abandoned={}",
            self.totals.detected.load(Ordering::Relaxed),
            self.totals.enqueued.load(Ordering::Relaxed),
            self.totals.dropped.load(Ordering::Relaxed),
            self.totals.succeeded.load(Ordering::Relaxed),
            self.totals.reverted.load(Ordering::Relaxed),
            self.totals.abandoned.load(Ordering::Relaxed),
        )
    }

    fn mirror_to_metrics(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::OpportunityDetected { chain, .. } => {
                self.totals.detected.fetch_add(1, Ordering::Relaxed);
                metrics::OPPORTUNITIES_DETECTED
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            TelemetryEvent::OpportunityEnqueued { chain, .. } => {
                self.totals.enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::OPPORTUNITIES_ENQUEUED
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            TelemetryEvent::OpportunityDropped { chain, .. } => {
                self.totals.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::OPPORTUNITIES_DROPPED
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            TelemetryEvent::ExecutionStateChanged { .. } => {}
            TelemetryEvent::ExecutionCompleted {
                chain,
                outcome,
                realized_margin,
                gas_spent_native,
                ..
            } => {
                match *outcome {
                    "succeeded" => self.totals.succeeded.fetch_add(1, Ordering::Relaxed),
                    "reverted" => self.totals.reverted.fetch_add(1, Ordering::Relaxed),
                    _ => self.totals.abandoned.fetch_add(1, Ordering::Relaxed),
                };
                metrics::EXECUTIONS_COMPLETED
                    .with_label_values(&[chain.as_str(), outcome])
                    .inc();
                metrics::REALIZED_MARGIN
                    .with_label_values(&[chain.as_str()])
                    .observe(*realized_margin);
                metrics::GAS_SPENT_NATIVE
                    .with_label_values(&[chain.as_str()])
                    .observe(*gas_spent_native);
            }
            TelemetryEvent::BreakerOpened { subject } => {
                metrics::BREAKER_EVENTS
                    .with_label_values(&[subject.as_str(), "opened"])
                    .inc();
            }
            TelemetryEvent::BreakerClosed { subject } => {
                metrics::BREAKER_EVENTS
                    .with_label_values(&[subject.as_str(), "closed"])
                    .inc();
            }
            TelemetryEvent::ProviderHealthChanged { provider, healthy } => {
                metrics::PROVIDER_HEALTHY
                    .with_label_values(&[provider.as_str()])
                    .set(if *healthy { 1 } else { 0 });
            }
            TelemetryEvent::LatePendingInclusion { chain, .. } => {
                metrics::LATE_INCLUSIONS.with_label_values(&[chain.as_str()]).inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_is_lossless_for_an_attached_subscriber() {
        let sink = TelemetrySink::new();
        let mut rx = sink.subscribe();
        for _ in 0..10 {
            sink.emit(TelemetryEvent::BreakerOpened {
                subject: "p1".into(),
            });
        }
        let mut seen = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, TelemetryEvent::BreakerOpened { .. }));
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn emit_without_subscribers_does_not_fail() {
        let sink = TelemetrySink::new();
        sink.emit(TelemetryEvent::OpportunityDropped {
            chain: "mainnet".into(),
            id: Uuid::new_v4(),
        });
        assert_eq!(sink.totals().dropped.load(Ordering::Relaxed), 1);
    }
}
