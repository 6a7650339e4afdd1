use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    codec::{Flags, Opcode},
    connection::Connection,
    error::{GridClientError, Result},
    message::{decode_body, encode_body, TopologyRequest},
    node::NodeDescriptor,
    pool::ConnectionPool,
};

use super::TopologySnapshot;

/// Where the member list comes from.
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Fetches the full member list. `known` is the last published snapshot
    /// and may be used to pick contact points.
    async fn fetch(&self, known: &TopologySnapshot) -> Result<Vec<NodeDescriptor>>;
}

/// Asks the cluster itself: known members first over pooled connections, then
/// the seed addresses over short-lived ones.
pub struct ClusterTopologySource {
    seeds: Vec<SocketAddr>,
    pool: Arc<ConnectionPool>,
    flags: Flags,
    request_timeout: Duration,
}

impl ClusterTopologySource {
    pub fn new(seeds: Vec<SocketAddr>, pool: Arc<ConnectionPool>) -> Self {
        let request_timeout = pool.config().request_timeout;
        Self {
            seeds,
            pool,
            flags: Flags::INCLUDE_METRICS | Flags::INCLUDE_ATTRIBUTES,
            request_timeout,
        }
    }

    pub fn with_metrics(mut self, include: bool) -> Self {
        self.flags = toggle(self.flags, Flags::INCLUDE_METRICS, include);
        self
    }

    pub fn with_attributes(mut self, include: bool) -> Self {
        self.flags = toggle(self.flags, Flags::INCLUDE_ATTRIBUTES, include);
        self
    }

    async fn ask(&self, connection: &Connection) -> Result<Vec<NodeDescriptor>> {
        let payload = encode_body(&TopologyRequest::default())?;
        let body = connection
            .request(Opcode::Topology, self.flags, payload, self.request_timeout)
            .await?;
        decode_body(&body)
    }
}

fn toggle(flags: Flags, flag: Flags, on: bool) -> Flags {
    if on {
        flags | flag
    } else {
        flags.without(flag)
    }
}

#[async_trait]
impl TopologySource for ClusterTopologySource {
    async fn fetch(&self, known: &TopologySnapshot) -> Result<Vec<NodeDescriptor>> {
        let mut last_error = None;

        for node in known.nodes() {
            let connection = match self.pool.acquire(node).await {
                Ok(connection) => connection,
                Err(GridClientError::ClientClosed) => return Err(GridClientError::ClientClosed),
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            match self.ask(&connection).await {
                Ok(nodes) => return Ok(nodes),
                Err(err) => {
                    debug!(node = %node.id, error = %err, "topology request to known node failed");
                    if err.is_connectivity() {
                        self.pool.evict(&node.id, &connection);
                    }
                    last_error = Some(err);
                }
            }
        }

        for seed in &self.seeds {
            let connection = match self.pool.connect_transient(*seed).await {
                Ok(connection) => connection,
                Err(GridClientError::ClientClosed) => return Err(GridClientError::ClientClosed),
                Err(err) => {
                    debug!(%seed, error = %err, "seed unreachable");
                    last_error = Some(err);
                    continue;
                }
            };
            let result = self.ask(&connection).await;
            connection.close().await;
            match result {
                Ok(nodes) => return Ok(nodes),
                Err(err) => {
                    debug!(%seed, error = %err, "topology request to seed failed");
                    last_error = Some(err);
                }
            }
        }

        let reason = match last_error {
            Some(err) => format!("no seed or known node answered: {err}"),
            None => "no seed or known node to contact".to_string(),
        };
        Err(GridClientError::unreachable(reason))
    }
}
