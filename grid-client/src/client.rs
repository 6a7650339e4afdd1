//! The top-level client object.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    balancer::{self, LoadBalancer},
    compute::ComputeProjection,
    config::ClientConfig,
    data::DataProjection,
    error::{GridClientError, Result},
    hasher::{Hasher, SipHash},
    node::ClientId,
    pool::ConnectionPool,
    router::Router,
    selector::NodeSelector,
    topology::{
        ClusterTopologySource, ListenerHandle, TopologyListener, TopologyManager, TopologySnapshot,
        TopologySource,
    },
};

/// Connected client. Every instance owns its own pool, topology view and
/// background tasks; nothing is shared between clients.
pub struct GridClient {
    id: ClientId,
    config: ClientConfig,
    topology: Arc<TopologyManager>,
    pool: Arc<ConnectionPool>,
    router: Arc<Router>,
    data: Mutex<HashMap<Option<String>, DataProjection>>,
    compute: OnceLock<ComputeProjection>,
    closed: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl GridClient {
    /// Connects with the default balancer, hasher and topology source.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        GridClientBuilder::new(config).connect().await
    }

    pub fn builder(config: ClientConfig) -> GridClientBuilder {
        GridClientBuilder::new(config)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Projection over the default cache.
    pub fn data(&self) -> Result<DataProjection> {
        self.projection_for(None)
    }

    /// Projection over the cache called `name`, which must be configured.
    pub fn cache(&self, name: &str) -> Result<DataProjection> {
        self.projection_for(Some(name))
    }

    fn projection_for(&self, name: Option<&str>) -> Result<DataProjection> {
        self.ensure_open()?;
        let mut data = self.data.lock();
        if let Some(projection) = data.get(&name.map(str::to_string)) {
            return Ok(projection.clone());
        }
        let config = self
            .config
            .cache(name)
            .ok_or_else(|| GridClientError::UnknownCache(name.unwrap_or("<default>").to_string()))?;
        let projection = DataProjection::new(Arc::clone(&self.router), config);
        data.insert(config.name.clone(), projection.clone());
        Ok(projection)
    }

    pub fn compute(&self) -> Result<ComputeProjection> {
        self.ensure_open()?;
        Ok(self
            .compute
            .get_or_init(|| ComputeProjection::new(Arc::clone(&self.router)))
            .clone())
    }

    /// Latest topology snapshot.
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.topology.current_snapshot()
    }

    pub async fn refresh_topology(&self) -> Result<Arc<TopologySnapshot>> {
        self.ensure_open()?;
        self.topology.refresh().await
    }

    pub fn add_topology_listener(&self, listener: Arc<dyn TopologyListener>) -> ListenerHandle {
        self.topology.add_listener(listener)
    }

    pub fn remove_topology_listener(&self, handle: ListenerHandle) -> bool {
        self.topology.remove_listener(handle)
    }

    /// Copy of the registered listeners in registration order.
    pub fn topology_listeners(&self) -> Vec<Arc<dyn TopologyListener>> {
        self.topology.listeners().listeners()
    }

    /// Number of open pooled connections.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops background work and closes every pooled connection. Operations
    /// issued afterwards, including through projections obtained earlier, fail
    /// with [`GridClientError::ClientClosed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        self.topology.stop().await;
        let health = self.health.lock().take();
        if let Some(health) = health {
            let _ = health.await;
        }
        self.pool.close().await;
        info!(client = %self.id, "client closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(GridClientError::ClientClosed);
        }
        Ok(())
    }
}

impl Drop for GridClient {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(client = %self.id, "client dropped without close; stopping background tasks");
            self.stop_tx.send_replace(true);
            self.topology.signal_stop();
        }
    }
}

/// Configures pluggable parts before connecting.
pub struct GridClientBuilder {
    config: ClientConfig,
    balancer: Option<Arc<dyn LoadBalancer>>,
    hasher: Option<Arc<dyn Hasher>>,
    source: Option<Arc<dyn TopologySource>>,
}

impl GridClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            balancer: None,
            hasher: None,
            source: None,
        }
    }

    /// Overrides the balancer named in the configuration.
    pub fn load_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Replaces cluster-based discovery.
    pub fn topology_source(mut self, source: Arc<dyn TopologySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Fetches the initial topology and starts background refresh and health checks.
    ///
    /// Fails with [`GridClientError::Connectivity`] when no seed answers.
    pub async fn connect(self) -> Result<GridClient> {
        let GridClientBuilder {
            config,
            balancer,
            hasher,
            source,
        } = self;
        config.validate()?;

        let id = ClientId::generate();
        let pool = Arc::new(ConnectionPool::new(id, config.connection.clone()));
        let source = source.unwrap_or_else(|| {
            Arc::new(
                ClusterTopologySource::new(config.seeds.clone(), Arc::clone(&pool))
                    .with_metrics(config.include_metrics)
                    .with_attributes(config.include_attributes),
            )
        });
        let topology = Arc::new(
            TopologyManager::new(config.topology.clone(), source).with_hook(pool.clone()),
        );

        if let Err(err) = topology.refresh().await {
            pool.close().await;
            return Err(err);
        }
        topology.start();

        let (stop_tx, stop_rx) = watch::channel(false);
        let health = pool.spawn_health_checks(stop_rx);

        let selector = NodeSelector::new(
            balancer.unwrap_or_else(|| balancer::from_kind(config.balancer)),
            hasher.unwrap_or_else(|| Arc::new(SipHash)),
        );
        let closed = Arc::new(AtomicBool::new(false));
        let router = Arc::new(Router::new(
            Arc::clone(&topology),
            Arc::clone(&pool),
            selector,
            config.max_retries,
            config.connection.request_timeout,
            Arc::clone(&closed),
        ));

        let snapshot = topology.current_snapshot();
        info!(
            client = %id,
            nodes = snapshot.len(),
            version = snapshot.version(),
            "client connected"
        );

        Ok(GridClient {
            id,
            config,
            topology,
            pool,
            router,
            data: Mutex::new(HashMap::new()),
            compute: OnceLock::new(),
            closed,
            stop_tx,
            health: Mutex::new(health),
        })
    }
}
