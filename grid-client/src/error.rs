//! Error taxonomy shared by every layer of the client.

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::node::NodeId;

pub type Result<T, E = GridClientError> = std::result::Result<T, E>;

/// Whether a request reached the server before a connection fault.
///
/// Frames are length-prefixed, so a frame that was not completely written is
/// discarded by the node and the request is known not to have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The request frame never left the client in full.
    NotSent,
    /// The frame was written but no response arrived.
    Unknown,
}

#[derive(Debug, Error)]
pub enum GridClientError {
    #[error("connectivity failure{}: {reason}", NodeSuffix(.node))]
    Connectivity {
        node: Option<NodeId>,
        delivery: Delivery,
        reason: String,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request to node {node} timed out after {after:?}")]
    Timeout { node: NodeId, after: Duration },

    #[error("no available nodes in topology")]
    NoAvailableNodes,

    #[error("remote execution failed: {diagnostic}")]
    RemoteExecution { diagnostic: String },

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("client is closed")]
    ClientClosed,

    #[error("no configuration for cache {0:?}")]
    UnknownCache(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GridClientError {
    pub(crate) fn unreachable(reason: impl Into<String>) -> Self {
        Self::Connectivity {
            node: None,
            delivery: Delivery::NotSent,
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(
        node: Option<NodeId>,
        delivery: Delivery,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Connectivity {
            node,
            delivery,
            reason: reason.to_string(),
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Returns true when the failed attempt may be replayed on another node.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            Self::Connectivity { delivery, .. } => match delivery {
                Delivery::NotSent => true,
                Delivery::Unknown => idempotent,
            },
            _ => false,
        }
    }
}

struct NodeSuffix<'a>(&'a Option<NodeId>);

impl fmt::Display for NodeSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(node) => write!(f, " on node {node}"),
            None => Ok(()),
        }
    }
}
