//! Workflow definition types.
//!
//! A workflow definition consists of:
//! - Identity and metadata (id, owner, name, description)
//! - The graph data (nodes and edges) as edited by the author
//! - Run-level settings that override the engine defaults
//! - Workflow variables visible to every node

use crate::edge::Edge;
use crate::node::Node;
use chainweave_core::{UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// The nodes and edges of a workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowData {
    /// The nodes in the graph.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// The edges between them.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowData {
    /// Creates graph data.
    #[must_use]
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Returns true if there are no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Run-level overrides stored with a workflow.
///
/// Unset fields fall back to the engine's scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Default failure policy for every node in the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    /// Maximum nodes executing at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Default per-node timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_ms: Option<u64>,
    /// Default retry budget for transient node errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// A stored workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique identifier.
    pub id: WorkflowId,
    /// Owner of the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Human-readable name.
    pub name: String,
    /// What the workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inline graph data. When absent the engine loads it from its workflow source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WorkflowData>,
    /// Run-level overrides.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Values available to every node through the execution context.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
}

impl WorkflowDefinition {
    /// Creates a definition with a fresh id and no graph data.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            user_id: None,
            name: name.into(),
            description: None,
            data: None,
            settings: WorkflowSettings::default(),
            variables: Map::new(),
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets inline graph data.
    #[must_use]
    pub fn with_data(mut self, data: WorkflowData) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets run-level overrides.
    #[must_use]
    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Adds a workflow variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}
