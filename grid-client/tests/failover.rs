//! Behavior when nodes drop connections, stall or disappear mid-operation.

mod common;

use std::time::Duration;

use anyhow::Result;
use grid_client::{testing::MockCluster, Delivery, GridClient, GridClientError};
use serde_json::Value;

#[tokio::test]
async fn dropped_connection_is_retried_once_on_another_node() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let sessions = client.cache("sessions")?;

    // Round robin starts with the smallest id.
    cluster.node(0).drop_next(1);
    let value: Option<String> = sessions.get("session-1").await?;
    assert_eq!(value, None);

    assert_eq!(cluster.node(0).served(), 0);
    assert_eq!(cluster.served(), 1);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn every_node_failing_surfaces_connectivity() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(2).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let sessions = client.cache("sessions")?;

    cluster.node(0).drop_next(1);
    cluster.node(1).drop_next(1);
    let result = sessions.get::<_, String>("session-1").await;
    assert!(matches!(result, Err(GridClientError::Connectivity { .. })), "{result:?}");
    assert_eq!(cluster.served(), 0);

    // Both nodes answer again once their faults are spent.
    assert!(sessions.put("session-1", "alive").await?);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn non_idempotent_write_is_not_replayed_after_unknown_delivery() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let orders = client.cache("orders")?;

    let owner = orders.affinity("order-9")?;
    let node = cluster.node_by_id(owner).expect("owner is a mock node");
    node.drop_next(1);

    match orders.compare_and_set("order-9", None, Some(&"placed")).await {
        Err(GridClientError::Connectivity { delivery, node, .. }) => {
            assert_eq!(delivery, Delivery::Unknown);
            assert_eq!(node, Some(owner));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(cluster.served(), 0);

    // An idempotent put on the same key goes through after reconnecting.
    assert!(orders.put("order-9", "placed").await?);
    assert_eq!(node.served(), 1);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn slow_node_times_out_and_connection_stays_usable() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(2).await?;
    let mut config = common::config(&cluster);
    config.connection.request_timeout = Duration::from_millis(100);
    // Keep background topology traffic off the stalled connection.
    config.topology.refresh_interval = Duration::from_secs(60);
    let client = GridClient::connect(config).await?;
    let slow = cluster.node(0);
    let compute = client.compute()?.for_nodes([slow.id()])?;

    slow.set_delay(Duration::from_millis(300));
    match compute.execute::<_, Value>("echo", "late").await {
        Err(GridClientError::Timeout { node, after }) => {
            assert_eq!(node, slow.id());
            assert_eq!(after, Duration::from_millis(100));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(client.connection_count(), 1);

    slow.set_delay(Duration::ZERO);
    // The late answer arrives on the same connection and is discarded.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let echoed: String = compute.execute("echo", "on time").await?;
    assert_eq!(echoed, "on time");
    assert_eq!(slow.handshakes(), 1);

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stopped_owner_fails_over_and_ownership_moves() -> Result<()> {
    common::init_tracing();
    let cluster = MockCluster::start(3).await?;
    let client = GridClient::connect(common::config(&cluster)).await?;
    let orders = client.cache("orders")?;

    let before = orders.affinity("order-42")?;
    cluster.node_by_id(before).expect("owner is a mock node").stop().await;

    assert!(orders.put("order-42", "shipped").await?);

    client.refresh_topology().await?;
    let after = orders.affinity("order-42")?;
    assert_ne!(after, before);
    assert!(!client.topology().contains(&before));
    let status: Option<String> = orders.get("order-42").await?;
    assert_eq!(status.as_deref(), Some("shipped"));

    client.close().await;
    cluster.shutdown().await;
    Ok(())
}
