use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::node::{NodeDescriptor, NodeId};

/// Receives membership changes. Callbacks run on the refresh path, one at a
/// time and in registration order, so they should return quickly.
pub trait TopologyListener: Send + Sync {
    fn on_node_joined(&self, node: &NodeDescriptor);

    fn on_node_left(&self, node_id: NodeId);

    fn on_topology_degraded(&self) {}
}

/// Opaque token returned on registration and used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    NodeJoined(NodeDescriptor),
    NodeLeft(NodeId),
    Degraded,
}

#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<(ListenerHandle, Arc<dyn TopologyListener>)>>,
    next_handle: AtomicU64,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn TopologyListener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((handle, listener));
        handle
    }

    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != handle);
        entries.len() != before
    }

    /// Copy of the current subscribers, in registration order.
    pub fn listeners(&self) -> Vec<Arc<dyn TopologyListener>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers events in order to the subscribers registered when dispatch
    /// starts. The lock is not held while callbacks run, so a listener may
    /// remove itself or others; removals apply from the next dispatch.
    pub(crate) fn dispatch(&self, events: &[TopologyEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners();
        debug!(events = events.len(), listeners = listeners.len(), "dispatching topology events");

        for event in events {
            for listener in &listeners {
                deliver(listener.as_ref(), event);
            }
        }
    }
}

pub(crate) fn deliver(listener: &dyn TopologyListener, event: &TopologyEvent) {
    match event {
        TopologyEvent::NodeJoined(node) => listener.on_node_joined(node),
        TopologyEvent::NodeLeft(id) => listener.on_node_left(*id),
        TopologyEvent::Degraded => listener.on_topology_degraded(),
    }
}
