//! Load balancing strategies for operations without an affinity key.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rand::Rng;

use crate::{config::BalancerKind, node::{NodeDescriptor, NodeId}};

/// Chooses one node among eligible candidates.
///
/// Callers always pass a non-empty slice sorted by node id.
pub trait LoadBalancer: Send + Sync {
    fn select_node(&self, candidates: &[&NodeDescriptor]) -> NodeId;
}

pub fn from_kind(kind: BalancerKind) -> Arc<dyn LoadBalancer> {
    match kind {
        BalancerKind::RoundRobin => Arc::new(RoundRobin::default()),
        BalancerKind::Random => Arc::new(RandomBalancer),
        BalancerKind::ResponseTime => Arc::new(ResponseTimeWeighted),
    }
}

/// Visits candidates in id order, one per call.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn select_node(&self, candidates: &[&NodeDescriptor]) -> NodeId {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index].id
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select_node(&self, candidates: &[&NodeDescriptor]) -> NodeId {
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates[index].id
    }
}

/// Weighted random choice favouring nodes that report lower processing time.
///
/// Weight is `1 / (1 + load)` with load taken from
/// [`NodeMetrics::processing_load`](crate::node::NodeMetrics::processing_load);
/// nodes without metrics count as idle.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseTimeWeighted;

impl ResponseTimeWeighted {
    fn weight(node: &NodeDescriptor) -> f64 {
        let load = node
            .metrics
            .as_ref()
            .map(|metrics| metrics.processing_load())
            .unwrap_or(0.0);
        1.0 / (1.0 + load)
    }
}

impl LoadBalancer for ResponseTimeWeighted {
    fn select_node(&self, candidates: &[&NodeDescriptor]) -> NodeId {
        let weights: Vec<f64> = candidates.iter().map(|node| Self::weight(node)).collect();
        let total: f64 = weights.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return candidates[0].id;
        }

        let mut point = rand::thread_rng().gen_range(0.0..total);
        for (node, weight) in candidates.iter().zip(&weights) {
            if point < *weight {
                return node.id;
            }
            point -= weight;
        }
        // Floating point leftovers land on the last candidate.
        candidates[candidates.len() - 1].id
    }
}
