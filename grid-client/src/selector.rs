//! Node selection: affinity routing for keyed operations, load balancing for the rest.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tracing::trace;

use crate::{
    balancer::LoadBalancer,
    codec::Opcode,
    error::{GridClientError, Result},
    hasher::Hasher,
    node::{NodeDescriptor, NodeId},
    topology::TopologySnapshot,
};

/// Caller-supplied bytes pinning an operation to the node that owns them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffinityKey(Bytes);

impl AffinityKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Affinity key derived from the canonical JSON encoding of `key`.
    ///
    /// The key goes through [`serde_json::Value`] first so object fields are
    /// ordered by name. A key serialized directly or after conversion to a
    /// `Value` yields the same bytes and so the same owner.
    pub fn of<K>(key: &K) -> Result<Self>
    where
        K: Serialize + ?Sized,
    {
        let canonical = serde_json::to_value(key)?;
        Ok(Self(Bytes::from(serde_json::to_vec(&canonical)?)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for AffinityKey {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<Vec<u8>> for AffinityKey {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&[u8]> for AffinityKey {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

/// Maps affinity keys onto a node set with rendezvous hashing.
///
/// Each node scores `hash(node id ++ key)`; the highest score owns the key and
/// equal scores go to the smallest node id. Adding or removing a node only
/// moves the keys that node wins or owned.
#[derive(Clone)]
pub struct AffinityFunction {
    hasher: Arc<dyn Hasher>,
}

impl AffinityFunction {
    pub fn new(hasher: Arc<dyn Hasher>) -> Self {
        Self { hasher }
    }

    /// `candidates` must be sorted by node id.
    pub fn owner(&self, key: &AffinityKey, candidates: &[&NodeDescriptor]) -> Option<NodeId> {
        let mut scratch = BytesMut::with_capacity(16 + key.as_bytes().len());
        let mut best: Option<(NodeId, i32)> = None;

        for node in candidates {
            scratch.clear();
            scratch.put_slice(node.id.as_bytes());
            scratch.put_slice(key.as_bytes());
            let score = self.hasher.hash(&scratch);

            match best {
                // Strictly greater: on ties the earlier, smaller id stays.
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((node.id, score)),
            }
        }
        best.map(|(id, _)| id)
    }
}

/// Chooses the destination node for an operation from a topology snapshot.
#[derive(Clone)]
pub struct NodeSelector {
    balancer: Arc<dyn LoadBalancer>,
    affinity: AffinityFunction,
}

impl NodeSelector {
    pub fn new(balancer: Arc<dyn LoadBalancer>, hasher: Arc<dyn Hasher>) -> Self {
        Self {
            balancer,
            affinity: AffinityFunction::new(hasher),
        }
    }

    pub fn select_node(
        &self,
        snapshot: &TopologySnapshot,
        operation: Opcode,
        affinity_key: Option<&AffinityKey>,
    ) -> Result<NodeId> {
        self.select_node_where(snapshot, operation, affinity_key, |_| true)
    }

    /// Like [`select_node`](Self::select_node) but only over nodes accepted by `eligible`.
    ///
    /// Fails with [`GridClientError::NoAvailableNodes`] when nothing is eligible.
    pub fn select_node_where<F>(
        &self,
        snapshot: &TopologySnapshot,
        operation: Opcode,
        affinity_key: Option<&AffinityKey>,
        eligible: F,
    ) -> Result<NodeId>
    where
        F: Fn(&NodeDescriptor) -> bool,
    {
        // Snapshot iteration is already ordered by node id.
        let candidates: Vec<&NodeDescriptor> =
            snapshot.nodes().filter(|node| eligible(node)).collect();
        if candidates.is_empty() {
            return Err(GridClientError::NoAvailableNodes);
        }

        let selected = match affinity_key {
            Some(key) => self
                .affinity
                .owner(key, &candidates)
                .ok_or(GridClientError::NoAvailableNodes)?,
            None => self.balancer.select_node(&candidates),
        };

        trace!(
            ?operation,
            node = %selected,
            affinity = affinity_key.is_some(),
            version = snapshot.version(),
            "selected node"
        );
        Ok(selected)
    }

    pub fn affinity(&self) -> &AffinityFunction {
        &self.affinity
    }
}
