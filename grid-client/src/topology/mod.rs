//! Live view of cluster membership.
//!
//! [`TopologyManager`] refreshes the member list on a fixed schedule and
//! publishes immutable [`TopologySnapshot`]s through an atomic pointer swap, so
//! readers never block and never see a half-updated node set. Membership
//! changes are diffed against the previous snapshot and delivered to
//! [`TopologyListener`]s on the refresh path:
//!
//! - a node present in a fetch but not in the previous snapshot has joined;
//! - a node missing from `grace_cycles` consecutive fetches has left, and stays
//!   in the snapshot until then;
//! - metric-only changes update the snapshot silently.
//!
//! When every contact point is unreachable a refresh retries with capped
//! exponential backoff. After `degraded_after` failed refreshes in a row the
//! listeners hear `on_topology_degraded` once, and the last good snapshot keeps
//! serving.

mod listener;
mod source;

pub use listener::{ListenerHandle, ListenerRegistry, TopologyEvent, TopologyListener};
use listener::deliver;
pub use source::{ClusterTopologySource, TopologySource};

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex as SyncMutex;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::TopologyConfig,
    error::Result,
    node::{now_millis, NodeDescriptor, NodeId},
};

/// Immutable, versioned set of cluster members ordered by node id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    version: u64,
    nodes: BTreeMap<NodeId, NodeDescriptor>,
}

impl TopologySnapshot {
    pub fn new(version: u64, nodes: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        Self {
            version,
            nodes: nodes.into_iter().map(|node| (node.id, node)).collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> + '_ {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Bookkeeping carried between refreshes.
#[derive(Debug, Default)]
struct RefreshState {
    /// Consecutive fetches each retained node has been missing from.
    missed: HashMap<NodeId, u32>,
    consecutive_failures: u32,
    degraded: bool,
}

/// Computes the successor of `current` from a fresh fetch.
///
/// Returns the next snapshot and the membership events separating the two.
fn next_snapshot(
    current: &TopologySnapshot,
    fetched: Vec<NodeDescriptor>,
    missed: &mut HashMap<NodeId, u32>,
    grace_cycles: u32,
) -> (TopologySnapshot, Vec<TopologyEvent>) {
    let grace_cycles = grace_cycles.max(1);
    let seen_at = now_millis();
    let mut nodes: BTreeMap<NodeId, NodeDescriptor> = fetched
        .into_iter()
        .map(|mut node| {
            node.last_seen = seen_at;
            (node.id, node)
        })
        .collect();

    let mut events = Vec::new();
    for node in nodes.values() {
        missed.remove(&node.id);
        if !current.contains(&node.id) {
            events.push(TopologyEvent::NodeJoined(node.clone()));
        }
    }

    for previous in current.nodes() {
        if nodes.contains_key(&previous.id) {
            continue;
        }
        let count = missed.entry(previous.id).or_insert(0);
        *count += 1;
        if *count >= grace_cycles {
            missed.remove(&previous.id);
            events.push(TopologyEvent::NodeLeft(previous.id));
        } else {
            nodes.insert(previous.id, previous.clone());
        }
    }
    missed.retain(|id, _| nodes.contains_key(id));

    let next = TopologySnapshot {
        version: current.version + 1,
        nodes,
    };
    (next, events)
}

pub struct TopologyManager {
    config: TopologyConfig,
    source: Arc<dyn TopologySource>,
    snapshot: ArcSwap<TopologySnapshot>,
    listeners: ListenerRegistry,
    // Internal subscriber notified ahead of user listeners; not part of the registry.
    hook: Option<Arc<dyn TopologyListener>>,
    // Serializes refreshes, which also makes listener dispatch single-file.
    state: Mutex<RefreshState>,
    stop_tx: watch::Sender<bool>,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig, source: Arc<dyn TopologySource>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            source,
            snapshot: ArcSwap::from_pointee(TopologySnapshot::default()),
            listeners: ListenerRegistry::default(),
            hook: None,
            state: Mutex::new(RefreshState::default()),
            stop_tx,
            task: SyncMutex::new(None),
        }
    }

    pub(crate) fn with_hook(mut self, hook: Arc<dyn TopologyListener>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Latest published snapshot; never blocks.
    pub fn current_snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.load_full()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Fetches the member list once and publishes the resulting snapshot.
    ///
    /// On failure the previous snapshot stays published and the error is returned.
    pub async fn refresh(&self) -> Result<Arc<TopologySnapshot>> {
        let mut state = self.state.lock().await;
        let current = self.snapshot.load_full();

        match self.fetch_with_backoff(&current).await {
            Ok(fetched) => {
                if state.degraded {
                    info!(version = current.version(), "topology refresh recovered");
                }
                state.consecutive_failures = 0;
                state.degraded = false;

                let (next, events) =
                    next_snapshot(&current, fetched, &mut state.missed, self.config.grace_cycles);
                let next = Arc::new(next);
                self.snapshot.store(Arc::clone(&next));

                for event in &events {
                    match event {
                        TopologyEvent::NodeJoined(node) => info!(node = %node.id, "node joined"),
                        TopologyEvent::NodeLeft(id) => info!(node = %id, "node left"),
                        TopologyEvent::Degraded => {}
                    }
                }
                debug!(version = next.version(), nodes = next.len(), "published topology snapshot");
                self.notify(&events);
                Ok(next)
            }
            Err(err) => {
                state.consecutive_failures += 1;
                warn!(
                    error = %err,
                    failures = state.consecutive_failures,
                    version = current.version(),
                    "topology refresh failed; keeping last snapshot"
                );
                let threshold = self.config.degraded_after.max(1);
                if state.consecutive_failures >= threshold && !state.degraded {
                    state.degraded = true;
                    warn!(failures = state.consecutive_failures, "topology degraded");
                    self.notify(&[TopologyEvent::Degraded]);
                }
                Err(err)
            }
        }
    }

    fn notify(&self, events: &[TopologyEvent]) {
        if let Some(hook) = &self.hook {
            for event in events {
                deliver(hook.as_ref(), event);
            }
        }
        self.listeners.dispatch(events);
    }

    async fn fetch_with_backoff(&self, current: &TopologySnapshot) -> Result<Vec<NodeDescriptor>> {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = self.config.backoff_initial;
        let mut attempt = 1;

        loop {
            match self.source.fetch(current).await {
                Ok(nodes) => return Ok(nodes),
                Err(err) if attempt < attempts => {
                    debug!(attempt, ?delay, error = %err, "topology fetch failed; backing off");
                    time::sleep(delay).await;
                    delay = next_delay(delay, self.config.backoff_max);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Starts the periodic refresh task. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let manager = Arc::clone(self);
        let interval = self.config.refresh_interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A refresh in progress always completes; stop is
                        // observed at the next tick.
                        let _ = manager.refresh().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("topology refresh task stopped");
        }));
    }

    /// Signals the refresh task to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stops the refresh task and waits for it to finish its current cycle.
    pub async fn stop(&self) {
        self.signal_stop();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }
}

fn next_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}
