//! Per-node connection cache.
//!
//! At most one live [`Connection`] is kept per node. Connections are opened on
//! first use, shared by every caller targeting that node, and dropped from the
//! pool once they break, go idle or fail a health ping.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    codec::{Flags, Opcode},
    config::ConnectionConfig,
    connection::Connection,
    error::{Delivery, GridClientError, Result},
    node::{ClientId, NodeDescriptor, NodeId},
    topology::TopologyListener,
};

pub struct ConnectionPool {
    client_id: ClientId,
    config: ConnectionConfig,
    connections: Mutex<HashMap<NodeId, Arc<Connection>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(client_id: ClientId, config: ConnectionConfig) -> Self {
        Self {
            client_id,
            config,
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the live connection to `node`, connecting if there is none.
    ///
    /// The map lock is never held across the connect; if two callers race,
    /// the first connection stored wins and the other is closed.
    pub async fn acquire(&self, node: &NodeDescriptor) -> Result<Arc<Connection>> {
        if let Some(existing) = self.live(&node.id)? {
            return Ok(existing);
        }

        let connection = Arc::new(self.connect(node).await?);

        let (winner, loser) = {
            let mut connections = self.connections.lock();
            if self.closed.load(Ordering::SeqCst) {
                (None, Some(Arc::clone(&connection)))
            } else {
                match connections.get(&node.id) {
                    Some(current) if !current.is_closed() => {
                        (Some(Arc::clone(current)), Some(Arc::clone(&connection)))
                    }
                    _ => {
                        connections.insert(node.id, Arc::clone(&connection));
                        (Some(connection), None)
                    }
                }
            }
        };

        if let Some(loser) = loser {
            loser.close().await;
        }
        winner.ok_or(GridClientError::ClientClosed)
    }

    fn live(&self, node: &NodeId) -> Result<Option<Arc<Connection>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GridClientError::ClientClosed);
        }
        let mut connections = self.connections.lock();
        match connections.get(node) {
            Some(connection) if !connection.is_closed() => Ok(Some(Arc::clone(connection))),
            Some(_) => {
                debug!(%node, "evicting dead connection");
                connections.remove(node);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Tries each advertised address in order.
    async fn connect(&self, node: &NodeDescriptor) -> Result<Connection> {
        let mut last_error = None;
        for addr in &node.addresses {
            match Connection::open(*addr, Some(node.id), self.client_id, &self.config).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    debug!(node = %node.id, %addr, error = %err, "address unreachable");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            GridClientError::connection(
                Some(node.id),
                Delivery::NotSent,
                "node advertises no addresses",
            )
        }))
    }

    /// Opens a connection that is not pooled, for bootstrap contact with seeds.
    pub async fn connect_transient(&self, addr: SocketAddr) -> Result<Connection> {
        if self.is_closed() {
            return Err(GridClientError::ClientClosed);
        }
        Connection::open(addr, None, self.client_id, &self.config).await
    }

    /// Removes `connection` if it is still the pooled one for `node`.
    pub fn evict(&self, node: &NodeId, connection: &Arc<Connection>) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(node) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                connections.remove(node);
                debug!(%node, "evicted connection");
                true
            }
            _ => false,
        }
    }

    /// Pings every pooled connection and evicts the broken or idle ones.
    ///
    /// Returns the number of connections evicted.
    pub async fn health_check(&self) -> usize {
        let connections: Vec<(NodeId, Arc<Connection>)> = self
            .connections
            .lock()
            .iter()
            .map(|(node, connection)| (*node, Arc::clone(connection)))
            .collect();

        let mut doomed = Vec::new();
        let mut pings = Vec::new();
        for (node, connection) in connections {
            if connection.is_closed() {
                doomed.push((node, connection));
                continue;
            }
            let idle = self
                .config
                .idle_timeout
                .is_some_and(|limit| connection.in_flight() == 0 && connection.idle_for() >= limit);
            if idle {
                debug!(%node, "connection idle; evicting");
                doomed.push((node, connection));
            } else {
                pings.push((node, connection));
            }
        }

        let deadline = self.config.request_timeout;
        let results = join_all(pings.iter().map(|(_, connection)| {
            connection.request(Opcode::Noop, Flags::EMPTY, Bytes::new(), deadline)
        }))
        .await;
        for ((node, connection), result) in pings.into_iter().zip(results) {
            if let Err(err) = result {
                warn!(%node, error = %err, "health ping failed; evicting connection");
                doomed.push((node, connection));
            }
        }

        let mut evicted = 0;
        for (node, connection) in doomed {
            if self.evict(&node, &connection) {
                evicted += 1;
            }
            connection.close().await;
        }
        evicted
    }

    /// Runs [`health_check`](Self::health_check) every `health_check_interval`
    /// until `stop` flips to true. Returns `None` when health checks are disabled.
    pub fn spawn_health_checks(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let interval = self.config.health_check_interval?;
        let pool = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = pool.health_check().await;
                        if evicted > 0 {
                            debug!(evicted, "health check evicted connections");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health check task stopped");
        }))
    }

    /// Closes every pooled connection. Later acquires fail with
    /// [`GridClientError::ClientClosed`].
    pub async fn close(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            self.closed.store(true, Ordering::SeqCst);
            connections.drain().map(|(_, connection)| connection).collect()
        };
        let count = drained.len();
        join_all(drained.iter().map(|connection| connection.close())).await;
        info!(connections = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of pooled connections that are still open.
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|connection| !connection.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.connections.lock().keys().copied().collect();
        nodes.sort();
        nodes
    }
}

/// Drops connections to nodes that left the topology.
impl TopologyListener for ConnectionPool {
    fn on_node_joined(&self, _node: &NodeDescriptor) {}

    fn on_node_left(&self, node_id: NodeId) {
        let removed = self.connections.lock().remove(&node_id);
        if let Some(connection) = removed {
            debug!(node = %node_id, "node left; dropping its connection");
            // Without a runtime, dropping the last handle still aborts the reader.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { connection.close().await });
            }
        }
    }
}
