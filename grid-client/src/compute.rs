//! Task execution and topology inspection.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    codec::Opcode,
    error::{GridClientError, Result},
    message::{decode_body, encode_body, to_value, TaskRequest},
    node::{NodeDescriptor, NodeId},
    router::{NodeFilter, Router},
};

/// Runs tasks on cluster nodes chosen by the load balancer, optionally
/// restricted to a subset of nodes.
#[derive(Clone)]
pub struct ComputeProjection {
    router: Arc<Router>,
    filter: Option<NodeFilter>,
}

impl ComputeProjection {
    pub(crate) fn new(router: Arc<Router>) -> Self {
        Self { router, filter: None }
    }

    /// Executes `task` with `argument` and decodes its result.
    ///
    /// A failure reported by the node surfaces as
    /// [`GridClientError::RemoteExecution`] with the node's diagnostic.
    pub async fn execute<A, R>(&self, task: &str, argument: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.router.ensure_open()?;
        let request = TaskRequest {
            task_name: task.to_string(),
            argument: to_value(argument)?,
        };
        let body = self
            .router
            .call(Opcode::Task, encode_body(&request)?, None, self.filter.as_ref())
            .await?;
        debug!(task, "task completed");
        decode_body(&body)
    }

    /// Nodes of the current topology this projection may use, in id order.
    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        self.router
            .snapshot()
            .nodes()
            .filter(|node| self.admits(node))
            .cloned()
            .collect()
    }

    pub fn node(&self, id: &NodeId) -> Option<NodeDescriptor> {
        self.router
            .snapshot()
            .node(id)
            .filter(|node| self.admits(node))
            .cloned()
    }

    /// Forces a topology refresh and returns the nodes visible to this projection.
    pub async fn refresh_topology(&self) -> Result<Vec<NodeDescriptor>> {
        self.router.ensure_open()?;
        self.router.topology().refresh().await?;
        Ok(self.nodes())
    }

    /// Narrows this projection to nodes that also satisfy `filter`.
    ///
    /// Fails with [`GridClientError::NoAvailableNodes`] when no current node
    /// qualifies.
    pub fn projection<F>(&self, filter: F) -> Result<ComputeProjection>
    where
        F: Fn(&NodeDescriptor) -> bool + Send + Sync + 'static,
    {
        self.router.ensure_open()?;
        let combined: NodeFilter = match self.filter.clone() {
            Some(outer) => Arc::new(move |node: &NodeDescriptor| outer(node) && filter(node)),
            None => Arc::new(filter),
        };
        let narrowed = ComputeProjection {
            router: Arc::clone(&self.router),
            filter: Some(combined),
        };
        if narrowed.nodes().is_empty() {
            return Err(GridClientError::NoAvailableNodes);
        }
        Ok(narrowed)
    }

    /// Projection over the given node ids only.
    pub fn for_nodes(&self, ids: impl IntoIterator<Item = NodeId>) -> Result<ComputeProjection> {
        let ids: Vec<NodeId> = ids.into_iter().collect();
        self.projection(move |node| ids.contains(&node.id))
    }

    fn admits(&self, node: &NodeDescriptor) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(node))
    }
}
