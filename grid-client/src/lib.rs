//! Topology-aware client for a distributed compute and cache cluster.
//!
//! A [`GridClient`] keeps a live view of cluster membership, routes every
//! operation to a node chosen by affinity or load balancing, and talks to each
//! node over one multiplexed, length-prefixed binary connection. Each module
//! focuses on a concrete responsibility:
//!
//! - [`codec`] frames requests and responses on the wire; [`message`] holds the
//!   JSON bodies carried inside frames.
//! - [`connection`] multiplexes concurrent requests over one stream and matches
//!   responses by correlation id; [`pool`] keeps at most one of them per node.
//! - [`topology`] refreshes membership in the background, publishes immutable
//!   snapshots and notifies listeners of joins, departures and degradation.
//! - [`selector`], [`balancer`] and [`hasher`] pick the destination node.
//! - [`data`] and [`compute`] are the cache and task projections handed out by
//!   [`client`].
//! - `testing`, behind the `testing` feature, runs an in-process mock cluster
//!   over loopback TCP.
//!
//! ```no_run
//! # async fn demo() -> grid_client::Result<()> {
//! use grid_client::{ClientConfig, GridClient};
//!
//! let seed = "127.0.0.1:11211".parse().unwrap();
//! let client = GridClient::connect(ClientConfig::new([seed])).await?;
//! let cache = client.data()?;
//! cache.put("answer", &42).await?;
//! let answer: Option<u32> = cache.get("answer").await?;
//! let greeting: String = client.compute()?.execute("echo", "hello").await?;
//! client.close().await;
//! # let _ = (answer, greeting);
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod client;
pub mod codec;
pub mod compute;
pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod hasher;
pub mod message;
pub mod node;
pub mod pool;
mod router;
pub mod selector;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topology;

pub use balancer::{LoadBalancer, RandomBalancer, ResponseTimeWeighted, RoundRobin};
pub use client::{GridClient, GridClientBuilder};
pub use compute::ComputeProjection;
pub use config::{
    BalancerKind, CacheConfig, CacheMode, ClientConfig, ConnectionConfig, TlsConfig, TopologyConfig,
};
pub use data::DataProjection;
pub use error::{Delivery, GridClientError, Result};
pub use hasher::{Hasher, SipHash};
pub use node::{ClientId, NodeDescriptor, NodeId, NodeMetrics};
pub use router::NodeFilter;
pub use selector::{AffinityFunction, AffinityKey, NodeSelector};
pub use topology::{
    ClusterTopologySource, ListenerHandle, TopologyEvent, TopologyListener, TopologyManager,
    TopologySnapshot, TopologySource,
};
