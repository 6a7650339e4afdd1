//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use grid_client::{
    testing::MockCluster, CacheConfig, ClientConfig, ConnectionConfig, NodeDescriptor, NodeId,
    TopologyConfig, TopologyListener,
};
use parking_lot::Mutex;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a test-friendly subscriber once; `RUST_LOG=grid_client=debug` shows client logs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Configuration with short timers so background behavior shows up quickly.
pub fn config(cluster: &MockCluster) -> ClientConfig {
    ClientConfig::new(cluster.seeds())
        .with_topology(TopologyConfig {
            refresh_interval: Duration::from_millis(50),
            grace_cycles: 1,
            degraded_after: 2,
            retry_attempts: 1,
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
        })
        .with_connection(ConnectionConfig {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            health_check_interval: None,
            idle_timeout: None,
            tls: None,
        })
        .with_cache(CacheConfig::partitioned("orders"))
        .with_cache(CacheConfig::replicated("sessions"))
}

/// Polls `condition` until it holds or three seconds pass.
pub async fn eventually<F>(what: &str, condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    for _ in 0..150 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timed out waiting for {what}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Joined(NodeId),
    Left(NodeId),
    Degraded,
}

/// Listener that records every callback in order.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Seen> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &Seen) -> usize {
        self.events.lock().iter().filter(|seen| *seen == event).count()
    }
}

impl TopologyListener for Recorder {
    fn on_node_joined(&self, node: &NodeDescriptor) {
        self.events.lock().push(Seen::Joined(node.id));
    }

    fn on_node_left(&self, node_id: NodeId) {
        self.events.lock().push(Seen::Left(node_id));
    }

    fn on_topology_degraded(&self) {
        self.events.lock().push(Seen::Degraded);
    }
}
