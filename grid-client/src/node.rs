//! Identity and descriptor types for cluster members and clients.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a cluster node.
///
/// Ordering is byte-wise over the UUID, which matches the lexicographic order
/// of the canonical string form. Selection ties are broken with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier generated once per client instance and presented in every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Runtime metrics reported by a node alongside its topology entry.
///
/// Times are in milliseconds. Only the subset the client acts on is carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub last_update_time: u64,
    pub current_active_jobs: u32,
    pub current_waiting_jobs: u32,
    pub average_job_execute_time: f64,
    pub average_job_wait_time: f64,
    pub current_job_execute_time: f64,
    pub current_job_wait_time: f64,
    pub current_cpu_load: f64,
    pub heap_memory_used: u64,
}

impl NodeMetrics {
    /// Processing-time load: average execute plus wait time, falling back to
    /// the current values when no averages have been collected yet.
    pub fn processing_load(&self) -> f64 {
        let average = self.average_job_execute_time + self.average_job_wait_time;
        if average > 0.0 {
            return average;
        }
        let current = self.current_job_execute_time + self.current_job_wait_time;
        current.max(0.0)
    }
}

/// A cluster member as seen in a topology snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub addresses: Vec<SocketAddr>,
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Unix time in milliseconds at which the client last saw this node in a
    /// successful topology fetch.
    #[serde(default)]
    pub last_seen: u64,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, addresses: Vec<SocketAddr>) -> Self {
        Self {
            id,
            addresses,
            metrics: None,
            attributes: BTreeMap::new(),
            last_seen: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: NodeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
