//! Workflow graph implementation using petgraph.
//!
//! Workflows are directed acyclic graphs where:
//! - Nodes are workflow steps dispatched to a handler by type
//! - Edges connect a source port to a target node; routers pick which ports fire
//!
//! A run only covers the part of the graph reachable from its trigger.

use crate::definition::WorkflowData;
use crate::edge::Edge;
use crate::error::GraphValidationError;
use crate::node::{Node, NodeId};
use crate::registry::NodeRegistry;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from nodes and edges.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate node ids or edges naming unknown nodes.
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self, GraphValidationError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node)?;
        }
        for edge in edges {
            graph.add_edge(edge)?;
        }
        Ok(graph)
    }

    /// Builds a graph from stored workflow data.
    ///
    /// # Errors
    ///
    /// See [`WorkflowGraph::from_parts`].
    pub fn from_data(data: &WorkflowData) -> Result<Self, GraphValidationError> {
        Self::from_parts(data.nodes.clone(), data.edges.clone())
    }

    /// Adds a node to the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if a node with the same id exists.
    pub fn add_node(&mut self, node: Node) -> Result<(), GraphValidationError> {
        if self.node_index_map.contains_key(&node.id) {
            return Err(GraphValidationError::DuplicateNode { node_id: node.id });
        }
        let node_id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        Ok(())
    }

    /// Adds an edge between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint is missing.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphValidationError> {
        let source = self.index_of(&edge.id, &edge.source_node_id)?;
        let target = self.index_of(&edge.id, &edge.target_node_id)?;
        self.graph.add_edge(source, target, edge);
        Ok(())
    }

    fn index_of(&self, edge_id: &str, node_id: &NodeId) -> Result<NodeIndex, GraphValidationError> {
        self.node_index_map
            .get(node_id)
            .copied()
            .ok_or_else(|| GraphValidationError::DanglingEdge {
                edge_id: edge_id.to_string(),
                node_id: node_id.clone(),
            })
    }

    /// Returns a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns true if the graph contains the node.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_index_map.contains_key(node_id)
    }

    /// Returns all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns all edges.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.graph.edge_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns nodes that have no incoming edges.
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.nodes_without(Direction::Incoming)
    }

    /// Returns nodes that have no outgoing edges.
    pub fn terminal_nodes(&self) -> Vec<&Node> {
        self.nodes_without(Direction::Outgoing)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, direction).next().is_none())
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Returns the trigger nodes.
    pub fn trigger_nodes(&self) -> Vec<&Node> {
        self.nodes().filter(|node| node.is_trigger_node()).collect()
    }

    /// Returns the downstream nodes of a node with the connecting edges.
    pub fn successors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// Returns the upstream nodes of a node with the connecting edges.
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        self.neighbors(node_id, Direction::Incoming)
    }

    fn neighbors(&self, node_id: &NodeId, direction: Direction) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        let mut neighbors: Vec<(&Node, &Edge)> = self
            .graph
            .edges_directed(index, direction)
            .filter_map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                Some((self.graph.node_weight(other)?, edge.weight()))
            })
            .collect();
        // petgraph yields the newest edge first
        neighbors.reverse();
        neighbors
    }

    /// The distinct source ports a node's outgoing edges leave from.
    #[must_use]
    pub fn outgoing_ports(&self, node_id: &NodeId) -> BTreeSet<String> {
        self.successors(node_id)
            .into_iter()
            .map(|(_, edge)| edge.source_port_id.clone())
            .collect()
    }

    /// Node ids in a dependency-respecting order.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphValidationError> {
        let order = petgraph::algo::toposort(&self.graph, None).map_err(|cycle| {
            GraphValidationError::CycleDetected {
                node_id: self.graph[cycle.node_id()].id.clone(),
            }
        })?;
        Ok(order
            .into_iter()
            .map(|idx| self.graph[idx].id.clone())
            .collect())
    }

    /// Checks that the graph is acyclic and every node can be dispatched.
    ///
    /// This is the check for any graph the scheduler runs, triggered or not.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn validate_dispatchable(&self, registry: &NodeRegistry) -> Result<(), GraphValidationError> {
        self.topological_order()?;

        for node in self.nodes() {
            let Some(handler) = registry.get(node.node_type) else {
                return Err(GraphValidationError::UnregisteredNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type,
                });
            };
            handler
                .validate_config(&node.config, registry)
                .map_err(|reason| GraphValidationError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    reason,
                })?;
        }

        Ok(())
    }

    /// Validates a workflow graph before a run.
    ///
    /// Checks:
    /// - No cycles (DAG validation)
    /// - Every node type has a registered handler that accepts its config
    /// - At least one trigger exists
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<(), GraphValidationError> {
        self.validate_dispatchable(registry)?;
        if self.trigger_nodes().is_empty() {
            return Err(GraphValidationError::MissingTrigger);
        }
        Ok(())
    }

    /// Picks the trigger a run starts from.
    ///
    /// # Errors
    ///
    /// Returns an error if the named node is not a trigger, if there is no
    /// trigger, or if there are several and none was named.
    pub fn select_trigger(&self, requested: Option<&NodeId>) -> Result<NodeId, GraphValidationError> {
        if let Some(node_id) = requested {
            return match self.get_node(node_id) {
                Some(node) if node.is_trigger_node() => Ok(node.id.clone()),
                _ => Err(GraphValidationError::UnknownTrigger {
                    node_id: node_id.clone(),
                }),
            };
        }

        let triggers = self.trigger_nodes();
        match triggers.as_slice() {
            [] => Err(GraphValidationError::MissingTrigger),
            [only] => Ok(only.id.clone()),
            many => Err(GraphValidationError::AmbiguousTrigger {
                candidates: many.iter().map(|node| node.id.clone()).collect(),
            }),
        }
    }

    /// The subgraph reachable from `start`, including `start`.
    ///
    /// Other triggers and anything only they reach are left out.
    #[must_use]
    pub fn reachable_from(&self, start: &NodeId) -> Self {
        let Some(&start_idx) = self.node_index_map.get(start) else {
            return Self::new();
        };

        let mut reached = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start_idx);
        while let Some(idx) = bfs.next(&self.graph) {
            reached.insert(idx);
        }

        let mut subgraph = Self::new();
        let mut remap = HashMap::new();
        for idx in self.graph.node_indices().filter(|idx| reached.contains(idx)) {
            let node = self.graph[idx].clone();
            let node_id = node.id.clone();
            let new_idx = subgraph.graph.add_node(node);
            subgraph.node_index_map.insert(node_id, new_idx);
            remap.insert(idx, new_idx);
        }
        for edge in self.graph.edge_references() {
            if let (Some(&source), Some(&target)) = (remap.get(&edge.source()), remap.get(&edge.target())) {
                subgraph.graph.add_edge(source, target, edge.weight().clone());
            }
        }
        subgraph
    }
}
