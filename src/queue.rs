//! # Execution Queue
//!
//! Bounded, rank-ordered lane per chain. Enqueue never blocks: when a lane
//! is full the lowest-ranked element is evicted (telemetry records the
//! drop), so the lane always retains the top-N by rank rather than the
//! first-N by arrival. Each lane has exactly one consumer, the chain's
//! executor worker, giving at-most-once dequeue and per-chain ordering.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::metrics;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{ChainRegistry, Opportunity};

/// Rank: higher net profit first, then higher confidence, then earlier
/// detection. Returns `Less` when `a` outranks `b`.
fn rank(a: &Opportunity, b: &Opportunity) -> CmpOrdering {
    b.estimate
        .net_profit
        .raw()
        .cmp(&a.estimate.net_profit.raw())
        .then_with(|| {
            b.estimate
                .confidence
                .partial_cmp(&a.estimate.confidence)
                .unwrap_or(CmpOrdering::Equal)
        })
        .then_with(|| a.detected_at.cmp(&b.detected_at))
}

struct Lane {
    chain_id: u64,
    chain_name: String,
    /// Kept sorted best-first; eviction takes the back.
    items: Mutex<VecDeque<Arc<Opportunity>>>,
    notify: Notify,
}

pub struct ExecutionQueue {
    lanes: HashMap<u64, Arc<Lane>>,
    capacity: usize,
    closed: AtomicBool,
    telemetry: Arc<TelemetrySink>,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("lanes", &self.lanes.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ExecutionQueue {
    pub fn new(registry: &ChainRegistry, capacity: usize, telemetry: Arc<TelemetrySink>) -> Self {
        let mut lanes = HashMap::new();
        for chain in registry.chains() {
            lanes.insert(
                chain.chain_id,
                Arc::new(Lane {
                    chain_id: chain.chain_id,
                    chain_name: chain.name.clone(),
                    items: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                }),
            );
        }
        Self {
            lanes,
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            telemetry,
        }
    }

    /// Stop admitting. Consumers drain what is already queued, then see
    /// `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for lane in self.lanes.values() {
            lane.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Non-blocking admit. Returns whether the opportunity is now queued.
    pub async fn enqueue(&self, opportunity: Arc<Opportunity>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(lane) = self.lanes.get(&opportunity.chain_id) else {
            debug!(chain_id = opportunity.chain_id, "no lane for chain, dropping");
            return false;
        };

        let mut items = lane.items.lock().await;

        // Full lane and the newcomer ranks below the current tail: the
        // newcomer is the drop.
        if items.len() >= self.capacity {
            if let Some(tail) = items.back() {
                if rank(&opportunity, tail) != CmpOrdering::Less {
                    self.telemetry.emit(TelemetryEvent::OpportunityDropped {
                        chain: lane.chain_name.clone(),
                        id: opportunity.id,
                    });
                    return false;
                }
            }
        }

        let at = items
            .iter()
            .position(|queued| rank(&opportunity, queued) == CmpOrdering::Less)
            .unwrap_or(items.len());
        items.insert(at, opportunity.clone());

        if items.len() > self.capacity {
            if let Some(evicted) = items.pop_back() {
                self.telemetry.emit(TelemetryEvent::OpportunityDropped {
                    chain: lane.chain_name.clone(),
                    id: evicted.id,
                });
            }
        }

        metrics::QUEUE_DEPTH
            .with_label_values(&[lane.chain_name.as_str()])
            .set(items.len() as i64);
        drop(items);

        self.telemetry.emit(TelemetryEvent::OpportunityEnqueued {
            chain: lane.chain_name.clone(),
            id: opportunity.id,
        });
        lane.notify.notify_one();
        true
    }

    /// Blocking dequeue for the lane's single consumer. Returns `None` only
    /// after the queue is closed and the lane is drained.
    pub async fn dequeue(&self, chain_id: u64) -> Option<Arc<Opportunity>> {
        let lane = self.lanes.get(&chain_id)?.clone();
        loop {
            {
                let mut items = lane.items.lock().await;
                if let Some(next) = items.pop_front() {
                    metrics::QUEUE_DEPTH
                        .with_label_values(&[lane.chain_name.as_str()])
                        .set(items.len() as i64);
                    return Some(next);
                }
                if self.is_closed() {
                    return None;
                }
            }
            lane.notify.notified().await;
        }
    }

    pub async fn depth(&self, chain_id: u64) -> usize {
        match self.lanes.get(&chain_id) {
            Some(lane) => lane.items.lock().await.len(),
            None => 0,
        }
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.lanes.values().map(|l| l.chain_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::tests::sample_opportunity;
    use crate::estimator::{estimate, tests::sample_input};
    use crate::precision::{PreciseDecimal, NOTIONAL_PRECISION};

    fn registry() -> ChainRegistry {
        let config: crate::config::Config = serde_json::from_value(serde_json::json!({
            "chains": [{
                "chainId": 1,
                "name": "mainnet",
                "rpcUrl": "http://localhost:8545",
                "nativeSymbol": "ETH"
            }],
            "operator": {
                "receiver": "0x00000000000000000000000000000000000000aa",
                "walletKeyEnv": "OPERATOR_KEY"
            }
        }))
        .unwrap();
        ChainRegistry::from_config(&config).unwrap()
    }

    /// An opportunity whose net profit is pinned by adjusting the spread.
    fn opportunity_with_delta(delta: &str) -> Arc<Opportunity> {
        let mut opp = sample_opportunity(1);
        let mut input = sample_input();
        input.price_delta = PreciseDecimal::from_str_exact(delta, NOTIONAL_PRECISION).unwrap();
        opp.estimate = estimate(&input).unwrap();
        Arc::new(opp)
    }

    #[tokio::test]
    async fn retains_top_n_by_rank_not_arrival() {
        let telemetry = Arc::new(TelemetrySink::new());
        let queue = ExecutionQueue::new(&registry(), 2, telemetry.clone());

        // Worst-first arrival order.
        let o3 = opportunity_with_delta("0.0051"); // lowest net
        let o2 = opportunity_with_delta("0.0061");
        let o1 = opportunity_with_delta("0.0071"); // highest net
        assert!(queue.enqueue(o3.clone()).await);
        assert!(queue.enqueue(o2.clone()).await);
        assert!(queue.enqueue(o1.clone()).await);

        // o3 was evicted; best dequeues first.
        assert_eq!(queue.dequeue(1).await.unwrap().id, o1.id);
        assert_eq!(queue.dequeue(1).await.unwrap().id, o2.id);
        assert_eq!(queue.depth(1).await, 0);
        assert_eq!(
            telemetry
                .totals()
                .dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn full_lane_rejects_a_low_ranked_newcomer() {
        let telemetry = Arc::new(TelemetrySink::new());
        let queue = ExecutionQueue::new(&registry(), 2, telemetry.clone());

        assert!(queue.enqueue(opportunity_with_delta("0.0071")).await);
        assert!(queue.enqueue(opportunity_with_delta("0.0061")).await);
        // Newcomer ranks below the tail of a full lane: dropped on arrival.
        assert!(!queue.enqueue(opportunity_with_delta("0.0051")).await);
        assert_eq!(queue.depth(1).await, 2);
    }

    #[tokio::test]
    async fn dequeue_is_at_most_once() {
        let telemetry = Arc::new(TelemetrySink::new());
        let queue = Arc::new(ExecutionQueue::new(&registry(), 8, telemetry));
        for _ in 0..8 {
            queue.enqueue(Arc::new(sample_opportunity(1))).await;
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let opp = queue.dequeue(1).await.unwrap();
            assert!(seen.insert(opp.id));
        }
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let telemetry = Arc::new(TelemetrySink::new());
        let queue = ExecutionQueue::new(&registry(), 8, telemetry);
        queue.enqueue(Arc::new(sample_opportunity(1))).await;
        queue.close();
        assert!(!queue.enqueue(Arc::new(sample_opportunity(1))).await);
        assert!(queue.dequeue(1).await.is_some());
        assert!(queue.dequeue(1).await.is_none());
    }
}
