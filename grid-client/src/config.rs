//! Client configuration.
//!
//! The types deserialize with serde so an embedding application can load them
//! from whatever format it prefers. Durations are encoded as milliseconds.
//! TLS settings hold live rustls objects and are supplied in code.

use std::{collections::HashSet, fmt, net::SocketAddr, sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};

use crate::error::{GridClientError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bootstrap addresses used to discover the cluster.
    pub seeds: Vec<SocketAddr>,
    pub topology: TopologyConfig,
    pub connection: ConnectionConfig,
    /// Extra attempts on other nodes after a connection fault.
    pub max_retries: u32,
    pub balancer: BalancerKind,
    pub caches: Vec<CacheConfig>,
    pub include_metrics: bool,
    pub include_attributes: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            topology: TopologyConfig::default(),
            connection: ConnectionConfig::default(),
            max_retries: 2,
            balancer: BalancerKind::RoundRobin,
            caches: vec![CacheConfig::default()],
            include_metrics: true,
            include_attributes: true,
        }
    }
}

impl ClientConfig {
    pub fn new(seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_balancer(mut self, balancer: BalancerKind) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.caches.retain(|existing| existing.name != cache.name);
        self.caches.push(cache);
        self
    }

    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn cache(&self, name: Option<&str>) -> Option<&CacheConfig> {
        self.caches.iter().find(|cache| cache.name.as_deref() == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(GridClientError::Config(
                "at least one seed address is required".into(),
            ));
        }
        if self.topology.refresh_interval.is_zero() {
            return Err(GridClientError::Config(
                "topology refresh interval must be non-zero".into(),
            ));
        }
        if self.connection.request_timeout.is_zero() || self.connection.connect_timeout.is_zero() {
            return Err(GridClientError::Config("timeouts must be non-zero".into()));
        }
        if self.topology.retry_attempts == 0 {
            return Err(GridClientError::Config(
                "topology retry attempts must be at least 1".into(),
            ));
        }
        if let Some(tls) = &self.connection.tls {
            tls.validate()?;
        }

        let mut names = HashSet::new();
        for cache in &self.caches {
            if !names.insert(cache.name.as_deref()) {
                return Err(GridClientError::Config(format!(
                    "cache {:?} configured more than once",
                    cache.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    #[serde(with = "millis")]
    pub refresh_interval: Duration,
    /// Consecutive refreshes a node may be missing before it is declared left.
    pub grace_cycles: u32,
    /// Consecutive failed refreshes before listeners hear about degradation.
    pub degraded_after: u32,
    /// Fetch attempts within one refresh before it counts as failed.
    pub retry_attempts: u32,
    #[serde(with = "millis")]
    pub backoff_initial: Duration,
    #[serde(with = "millis")]
    pub backoff_max: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(2),
            grace_cycles: 2,
            degraded_after: 3,
            retry_attempts: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    #[serde(with = "millis_opt")]
    pub health_check_interval: Option<Duration>,
    #[serde(with = "millis_opt")]
    pub idle_timeout: Option<Duration>,
    /// Wraps every node connection in TLS when set.
    #[serde(skip)]
    pub tls: Option<TlsConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            health_check_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(300)),
            tls: None,
        }
    }
}

/// Client-side TLS for node connections.
///
/// Certificates are checked against `server_name`, or against the address
/// being dialed when no name is set.
#[derive(Clone)]
pub struct TlsConfig {
    pub client: Arc<rustls::ClientConfig>,
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new(client: Arc<rustls::ClientConfig>) -> Self {
        Self {
            client,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Name presented for SNI and certificate verification when dialing `addr`.
    pub fn server_name_for(&self, addr: SocketAddr) -> Result<ServerName<'static>> {
        match &self.server_name {
            Some(name) => ServerName::try_from(name.clone()).map_err(|err| {
                GridClientError::Config(format!("invalid TLS server name {name:?}: {err}"))
            }),
            None => Ok(ServerName::from(addr.ip())),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.server_name {
            ServerName::try_from(name.as_str()).map_err(|err| {
                GridClientError::Config(format!("invalid TLS server name {name:?}: {err}"))
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .field("alpn_protocols", &self.client.alpn_protocols.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    RoundRobin,
    Random,
    ResponseTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Each key lives on one owner node; operations follow the key's affinity.
    Partitioned,
    /// Every node holds every key; operations go through the load balancer.
    Replicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// `None` names the default cache.
    #[serde(default)]
    pub name: Option<String>,
    pub mode: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: None,
            mode: CacheMode::Partitioned,
        }
    }
}

impl CacheConfig {
    pub fn partitioned(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            mode: CacheMode::Partitioned,
        }
    }

    pub fn replicated(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            mode: CacheMode::Replicated,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
