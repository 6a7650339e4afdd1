//! Request routing with failover.
//!
//! Picks a node for each request from the current snapshot, sends over the
//! pooled connection and, on a retryable connection fault, reselects among the
//! nodes not yet tried.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    codec::{Flags, Opcode},
    error::{GridClientError, Result},
    node::{NodeDescriptor, NodeId},
    pool::ConnectionPool,
    selector::{AffinityKey, NodeSelector},
    topology::{TopologyManager, TopologySnapshot},
};

/// Restricts which nodes a projection may route to.
pub type NodeFilter = Arc<dyn Fn(&NodeDescriptor) -> bool + Send + Sync>;

pub(crate) struct Router {
    topology: Arc<TopologyManager>,
    pool: Arc<ConnectionPool>,
    selector: NodeSelector,
    max_retries: u32,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl Router {
    pub(crate) fn new(
        topology: Arc<TopologyManager>,
        pool: Arc<ConnectionPool>,
        selector: NodeSelector,
        max_retries: u32,
        request_timeout: Duration,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            topology,
            pool,
            selector,
            max_retries,
            request_timeout,
            closed,
        }
    }

    pub(crate) fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub(crate) fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.topology.current_snapshot()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GridClientError::ClientClosed);
        }
        Ok(())
    }

    /// Node owning `key` in the current snapshot among nodes passing `filter`.
    pub(crate) fn owner(&self, key: &AffinityKey, filter: Option<&NodeFilter>) -> Result<NodeId> {
        let snapshot = self.snapshot();
        self.selector
            .select_node_where(&snapshot, Opcode::CacheGet, Some(key), |node| admits(filter, node))
    }

    /// Sends one request and returns the successful response body.
    ///
    /// Connection faults are retried on other nodes up to `max_retries` times
    /// when [`GridClientError::is_retryable`] allows it for `opcode`.
    pub(crate) async fn call(
        &self,
        opcode: Opcode,
        payload: Bytes,
        affinity: Option<&AffinityKey>,
        filter: Option<&NodeFilter>,
    ) -> Result<Bytes> {
        let idempotent = opcode.is_idempotent();
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut last_error: Option<GridClientError> = None;
        let mut attempt = 0;

        loop {
            self.ensure_open()?;
            let snapshot = self.snapshot();
            let selected = self.selector.select_node_where(&snapshot, opcode, affinity, |node| {
                !tried.contains(&node.id) && admits(filter, node)
            });
            let node = match selected {
                Ok(id) => snapshot.node(&id).ok_or(GridClientError::NoAvailableNodes)?,
                // Every candidate already failed: report the fault, not an empty topology.
                Err(GridClientError::NoAvailableNodes) if last_error.is_some() => {
                    return Err(last_error.unwrap_or(GridClientError::NoAvailableNodes));
                }
                Err(err) => return Err(err),
            };

            match self.send_to(node, opcode, payload.clone()).await {
                Ok(body) => {
                    if attempt > 0 {
                        debug!(
                            node = %node.id,
                            attempt,
                            ?opcode,
                            "request succeeded after failover"
                        );
                    }
                    return Ok(body);
                }
                Err(_) if self.closed.load(Ordering::SeqCst) => {
                    return Err(GridClientError::ClientClosed)
                }
                Err(err) if err.is_retryable(idempotent) && attempt < self.max_retries => {
                    warn!(
                        node = %node.id,
                        attempt,
                        ?opcode,
                        error = %err,
                        "request failed; retrying on another node"
                    );
                    tried.insert(node.id);
                    last_error = Some(err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_to(
        &self,
        node: &NodeDescriptor,
        opcode: Opcode,
        payload: Bytes,
    ) -> Result<Bytes> {
        let connection = self.pool.acquire(node).await?;
        let result = connection
            .request(opcode, Flags::EMPTY, payload, self.request_timeout)
            .await;
        if let Err(err) = &result {
            if err.is_connectivity() && self.pool.evict(&node.id, &connection) {
                debug!(node = %node.id, "evicted connection after fault");
            }
        }
        result
    }
}

fn admits(filter: Option<&NodeFilter>, node: &NodeDescriptor) -> bool {
    filter.map_or(true, |filter| filter(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        balancer::RoundRobin,
        config::{ConnectionConfig, TopologyConfig},
        hasher::SipHash,
        message::{decode_body, encode_body, TaskRequest},
        node::ClientId,
        testing::MockCluster,
        topology::ClusterTopologySource,
    };

    struct Fixture {
        router: Router,
        closed: Arc<AtomicBool>,
    }

    async fn fixture(cluster: &MockCluster, max_retries: u32) -> Fixture {
        let pool = Arc::new(ConnectionPool::new(
            ClientId::generate(),
            ConnectionConfig {
                request_timeout: Duration::from_millis(500),
                ..ConnectionConfig::default()
            },
        ));
        let source = Arc::new(ClusterTopologySource::new(cluster.seeds(), Arc::clone(&pool)));
        let topology = Arc::new(TopologyManager::new(TopologyConfig::default(), source));
        topology.refresh().await.expect("initial refresh");
        let closed = Arc::new(AtomicBool::new(false));
        let router = Router::new(
            topology,
            pool,
            NodeSelector::new(Arc::new(RoundRobin::default()), Arc::new(SipHash)),
            max_retries,
            Duration::from_millis(500),
            Arc::clone(&closed),
        );
        Fixture { router, closed }
    }

    fn task(name: &str) -> Bytes {
        encode_body(&TaskRequest {
            task_name: name.to_string(),
            argument: serde_json::Value::Null,
        })
        .expect("encode")
    }

    #[tokio::test]
    async fn connection_fault_retries_once_on_another_node() {
        let cluster = MockCluster::start(3).await.expect("cluster");
        let Fixture { router, .. } = fixture(&cluster, 2).await;

        // Round robin starts at the smallest id.
        cluster.node(0).drop_next(1);
        // Get is idempotent, so an unanswered send may be replayed.
        let payload = Bytes::from_static(br#"{"cache":null,"command":{"op":"get","key":"k"}}"#);
        router
            .call(Opcode::CacheGet, payload, None, None)
            .await
            .expect("failover succeeds");

        // Dropped requests are never answered, so only the retry counts.
        assert_eq!(cluster.node(0).served(), 0);
        assert_eq!(cluster.node(1).served() + cluster.node(2).served(), 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn unacknowledged_task_is_not_replayed() {
        let cluster = MockCluster::start(2).await.expect("cluster");
        let Fixture { router, .. } = fixture(&cluster, 2).await;

        cluster.node(0).drop_next(1);
        let result = router.call(Opcode::Task, task("echo"), None, None).await;
        assert!(matches!(result, Err(GridClientError::Connectivity { .. })));
        assert_eq!(cluster.served(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_nodes_surface_connectivity_error() {
        let cluster = MockCluster::start(2).await.expect("cluster");
        let Fixture { router, .. } = fixture(&cluster, 5).await;

        cluster.node(0).drop_next(1);
        cluster.node(1).drop_next(1);
        let payload = Bytes::from_static(br#"{"cache":null,"command":{"op":"get","key":"k"}}"#);
        let result = router.call(Opcode::CacheGet, payload, None, None).await;
        assert!(matches!(result, Err(GridClientError::Connectivity { .. })));
        assert_eq!(cluster.served(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn zero_retries_reports_the_first_fault() {
        let cluster = MockCluster::start(2).await.expect("cluster");
        let Fixture { router, .. } = fixture(&cluster, 0).await;

        cluster.node(0).drop_next(1);
        let payload = Bytes::from_static(br#"{"cache":null,"command":{"op":"get","key":"k"}}"#);
        let result = router.call(Opcode::CacheGet, payload, None, None).await;
        assert!(matches!(result, Err(GridClientError::Connectivity { .. })));
        assert_eq!(cluster.served(), 0);
        assert_eq!(cluster.node(1).handshakes(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn remote_failure_is_not_retried() {
        let cluster = MockCluster::start(2).await.expect("cluster");
        let Fixture { router, .. } = fixture(&cluster, 2).await;

        let result = router.call(Opcode::Task, task("fail"), None, None).await;
        match result {
            Err(GridClientError::RemoteExecution { diagnostic }) => {
                assert!(diagnostic.contains("on purpose"), "{diagnostic}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(cluster.served(), 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn filter_limits_candidates() {
        let cluster = MockCluster::start(3).await.expect("cluster");
        let Fixture { router, closed } = fixture(&cluster, 0).await;
        let only = cluster.node(2).id();
        let filter: NodeFilter = Arc::new(move |node: &NodeDescriptor| node.id == only);

        for _ in 0..3 {
            let body = router
                .call(Opcode::Task, task("node_id"), None, Some(&filter))
                .await
                .expect("task");
            let id: String = decode_body(&body).expect("decode");
            assert_eq!(id, only.to_string());
        }

        let nothing: NodeFilter = Arc::new(|_: &NodeDescriptor| false);
        assert!(matches!(
            router.call(Opcode::Task, task("echo"), None, Some(&nothing)).await,
            Err(GridClientError::NoAvailableNodes)
        ));

        closed.store(true, Ordering::SeqCst);
        assert!(matches!(
            router.call(Opcode::Task, task("echo"), None, None).await,
            Err(GridClientError::ClientClosed)
        ));
        cluster.shutdown().await;
    }
}
