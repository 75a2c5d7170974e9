//! Edge types for workflow graphs.
//!
//! Edges connect a source node's output port to a target node's input port.
//! Routers decide which ports fire; an edge whose source port did not fire
//! carries nothing.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// Port an edge leaves from when none is given.
pub const DEFAULT_SOURCE_PORT: &str = "output";

/// Port an edge arrives at when none is given.
pub const DEFAULT_TARGET_PORT: &str = "input";

fn default_source_port() -> String {
    DEFAULT_SOURCE_PORT.to_string()
}

fn default_target_port() -> String {
    DEFAULT_TARGET_PORT.to_string()
}

/// An edge connecting two ports in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Identifier of the edge, unique within the graph.
    #[serde(default)]
    pub id: String,
    /// The node the edge leaves.
    pub source_node_id: NodeId,
    /// The output port on the source node.
    #[serde(default = "default_source_port")]
    pub source_port_id: String,
    /// The node the edge enters.
    pub target_node_id: NodeId,
    /// The input port on the target node.
    #[serde(default = "default_target_port")]
    pub target_port_id: String,
}

impl Edge {
    /// Creates an edge between the default ports.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source_node_id: impl Into<NodeId>,
        target_node_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source_node_id.into(),
            source_port_id: default_source_port(),
            target_node_id: target_node_id.into(),
            target_port_id: default_target_port(),
        }
    }

    /// Sets the source port.
    #[must_use]
    pub fn with_source_port(mut self, port: impl Into<String>) -> Self {
        self.source_port_id = port.into();
        self
    }

    /// Sets the target port.
    #[must_use]
    pub fn with_target_port(mut self, port: impl Into<String>) -> Self {
        self.target_port_id = port.into();
        self
    }
}
