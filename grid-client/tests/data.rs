//! Cache operations against an in-process mock cluster.

mod common;

use std::collections::HashMap;

use anyhow::Result;
use grid_client::{testing::MockCluster, AffinityKey, GridClient, GridClientError};
use serde::{Deserialize, Serialize};

#[tokio::test]
async fn put_get_remove_on_default_cache() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let cache = client.data()?;
    assert_eq!(cache.cache_name(), None);

    assert!(cache.put("user:1", "alice").await?);
    let name: Option<String> = cache.get("user:1").await?;
    assert_eq!(name.as_deref(), Some("alice"));

    assert!(cache.remove("user:1").await?);
    assert!(!cache.remove("user:1").await?);
    let gone: Option<String> = cache.get("user:1").await?;
    assert_eq!(gone, None);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn keys_land_on_their_affinity_owner() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let cache = client.cache("orders")?;

    let mut expected: HashMap<_, usize> = HashMap::new();
    for order in 0..30u32 {
        cache.put(&order, &format!("order-{order}")).await?;
        *expected.entry(cache.affinity(&order)?).or_default() += 1;
    }

    for node in cluster.nodes() {
        let owned = expected.get(&node.id()).copied().unwrap_or_default();
        assert_eq!(node.cache_len(Some("orders")), owned, "node {}", node.id());
    }

    // Same key, same owner: every read finds the value.
    for order in 0..30u32 {
        let value: Option<String> = cache.get(&order).await?;
        assert_eq!(value, Some(format!("order-{order}")));
    }

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn explicit_affinity_key_overrides_the_key() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let cache = client.cache("orders")?;

    let customer = AffinityKey::of("customer:7")?;
    let owner = cache.affinity("customer:7")?;
    for line in 0..5u32 {
        cache.put_with_affinity(&customer, &("line", line), &line).await?;
    }
    let holder = cluster.node_by_id(owner).expect("owner is a cluster node");
    assert_eq!(holder.cache_len(Some("orders")), 5);

    let line: Option<u32> = cache.get_with_affinity(&customer, &("line", 3u32)).await?;
    assert_eq!(line, Some(3));

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn replace_and_compare_and_set() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(2).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let cache = client.data()?;

    assert!(!cache.replace("counter", &1).await?);
    assert!(cache.compare_and_set("counter", None, Some(&1)).await?);
    assert!(!cache.compare_and_set("counter", None, Some(&5)).await?);
    assert!(cache.replace("counter", &2).await?);
    assert!(!cache.compare_and_set("counter", Some(&1), Some(&3)).await?);
    assert!(cache.compare_and_set("counter", Some(&2), Some(&3)).await?);
    assert_eq!(cache.get::<_, i32>("counter").await?, Some(3));

    assert!(cache.compare_and_set::<_, i32>("counter", Some(&3), None).await?);
    assert_eq!(cache.get::<_, i32>("counter").await?, None);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bulk_operations_split_by_owner() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let cache = client.cache("orders")?;

    let entries: Vec<(u32, String)> = (0..24).map(|id| (id, format!("v{id}"))).collect();
    cache.put_all(entries.clone()).await?;

    let owners: std::collections::HashSet<_> = entries
        .iter()
        .map(|(key, _)| cache.affinity(key))
        .collect::<Result<_, _>>()?;
    // One request per owning node, not per key.
    assert_eq!(cluster.served() as usize, owners.len());
    for node in cluster.nodes() {
        let owned = entries
            .iter()
            .filter(|(key, _)| cache.affinity(key).ok() == Some(node.id()))
            .count();
        assert_eq!(node.cache_len(Some("orders")), owned);
    }

    let found: HashMap<u32, String> = cache.get_all(vec![1, 2, 3, 1000]).await?;
    assert_eq!(found.len(), 3);
    assert_eq!(found.get(&2).map(String::as_str), Some("v2"));
    assert!(!found.contains_key(&1000));

    cache.remove_all((0..24).collect::<Vec<u32>>()).await?;
    let none: HashMap<u32, String> = cache.get_all(0..24u32).await?;
    assert!(none.is_empty());

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn replicated_cache_spreads_with_the_balancer() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(2).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let sessions = client.cache("sessions")?;

    for session in ["a", "b", "c", "d"] {
        sessions.put(session, &true).await?;
    }
    assert_eq!(cluster.node(0).cache_len(Some("sessions")), 2);
    assert_eq!(cluster.node(1).cache_len(Some("sessions")), 2);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_cache_is_rejected_and_projections_are_cached() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(1).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;

    assert!(matches!(
        client.cache("nope"),
        Err(GridClientError::UnknownCache(name)) if name == "nope"
    ));

    let first = client.cache("orders")?;
    first.put("k", &1).await?;
    let second = client.cache("orders")?;
    assert_eq!(second.get::<_, i32>("k").await?, Some(1));
    assert_eq!(client.data()?.get::<_, i32>("k").await?, None);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

/// Fields deliberately out of alphabetical order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct OrderKey {
    zone: String,
    account: u32,
}

fn order_keys() -> Vec<OrderKey> {
    (0..40)
        .map(|account| OrderKey {
            zone: format!("zone-{}", account % 4),
            account,
        })
        .collect()
}

#[tokio::test]
async fn struct_keys_route_the_same_for_single_and_bulk_operations() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(5).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let cache = client.cache("orders")?;
    let keys = order_keys();

    cache.put_all(keys.iter().cloned().zip(0u32..)).await?;
    for (key, expected) in keys.iter().zip(0u32..) {
        let value: Option<u32> = cache.get(key).await?;
        assert_eq!(value, Some(expected), "get after put_all for {key:?}");
    }

    cache.remove_all(keys.iter().cloned()).await?;
    for (key, value) in keys.iter().zip(100u32..) {
        assert!(cache.put(key, &value).await?);
    }
    let found: HashMap<OrderKey, u32> = cache.get_all(keys.iter().cloned()).await?;
    assert_eq!(found.len(), keys.len());
    for (key, value) in keys.iter().zip(100u32..) {
        assert_eq!(found.get(key), Some(&value));
    }

    // Every entry sits on the node the projection reports as its owner.
    let mut owned: HashMap<_, usize> = HashMap::new();
    for key in &keys {
        *owned.entry(cache.affinity(key)?).or_default() += 1;
    }
    for node in cluster.nodes() {
        let expected = owned.get(&node.id()).copied().unwrap_or_default();
        assert_eq!(node.cache_len(Some("orders")), expected, "node {}", node.id());
    }

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}
