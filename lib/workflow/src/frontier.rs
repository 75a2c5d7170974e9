//! Ready-set tracking for a run.
//!
//! The frontier holds the graph logic of a run and nothing else; dispatch
//! lives in the scheduler. Each node moves through
//! `waiting -> queued -> running -> succeeded | failed | skipped`.
//!
//! A waiting node is decided once every upstream node is terminal:
//! - any upstream failure that was not bypassed skips it
//! - otherwise at least one active inbound edge makes it ready
//! - otherwise it is skipped
//!
//! Because a node is decided only once, a join with several active inbound
//! edges is dispatched exactly once, after all of them have finished.

use crate::error::GraphValidationError;
use crate::execution::{NodeStatus, RunStatus};
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use crate::routing::Activation;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Why a node was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No route reached the node.
    NoActiveInbound,
    /// An upstream node failed and its failure policy stops the branch.
    UpstreamFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveInbound => f.write_str("no active inbound edge"),
            Self::UpstreamFailed => f.write_str("upstream node failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Waiting,
    Queued,
    Running,
    Succeeded(Activation),
    Failed { bypassed: bool },
    Skipped,
}

impl Slot {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed { .. } | Self::Skipped)
    }
}

/// Nodes decided by one call to [`Frontier::advance`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advance {
    /// Nodes that may now be dispatched, in dependency order.
    pub ready: Vec<NodeId>,
    /// Nodes that will never run.
    pub skipped: Vec<(NodeId, SkipReason)>,
}

impl Advance {
    /// Returns true if nothing was decided.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skipped.is_empty()
    }
}

/// Tracks which nodes of a run are ready, running, or decided.
#[derive(Debug, Clone)]
pub struct Frontier {
    /// Node weights are NodeIds, edge weights are source ports.
    graph: DiGraph<NodeId, String>,
    node_to_index: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeIndex>,
    outgoing_ports: HashMap<NodeId, BTreeSet<String>>,
    slots: HashMap<NodeId, Slot>,
}

impl Frontier {
    /// Builds a frontier with every node waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle.
    pub fn from_graph(workflow_graph: &WorkflowGraph) -> Result<Self, GraphValidationError> {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();

        for node in workflow_graph.nodes() {
            let idx = graph.add_node(node.id.clone());
            node_to_index.insert(node.id.clone(), idx);
        }
        for edge in workflow_graph.edges() {
            if let (Some(&source), Some(&target)) = (
                node_to_index.get(&edge.source_node_id),
                node_to_index.get(&edge.target_node_id),
            ) {
                graph.add_edge(source, target, edge.source_port_id.clone());
            }
        }

        let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
            GraphValidationError::CycleDetected {
                node_id: graph[cycle.node_id()].clone(),
            }
        })?;

        let outgoing_ports = workflow_graph
            .nodes()
            .map(|node| (node.id.clone(), workflow_graph.outgoing_ports(&node.id)))
            .collect();
        let slots = node_to_index
            .keys()
            .map(|id| (id.clone(), Slot::Waiting))
            .collect();

        Ok(Self {
            graph,
            node_to_index,
            order,
            outgoing_ports,
            slots,
        })
    }

    fn set(&mut self, node_id: &NodeId, slot: Slot) {
        if let Some(current) = self.slots.get_mut(node_id)
            && !current.is_terminal()
        {
            *current = slot;
        }
    }

    /// Marks a queued node as dispatched.
    pub fn mark_running(&mut self, node_id: &NodeId) {
        self.set(node_id, Slot::Running);
    }

    /// Marks a node as succeeded; its output decides which edges fire.
    pub fn mark_succeeded(&mut self, node_id: &NodeId, output: &JsonValue) {
        let ports = self.outgoing_ports.get(node_id).cloned().unwrap_or_default();
        let activation = Activation::from_output(output).resolve(&ports);
        self.set(node_id, Slot::Succeeded(activation));
    }

    /// Marks a node as failed.
    ///
    /// A bypassed failure fires every outgoing edge as if the node had
    /// succeeded; otherwise everything downstream that depends on it is skipped.
    pub fn mark_failed(&mut self, node_id: &NodeId, bypassed: bool) {
        self.set(node_id, Slot::Failed { bypassed });
    }

    /// Marks a node as skipped.
    pub fn mark_skipped(&mut self, node_id: &NodeId) {
        self.set(node_id, Slot::Skipped);
    }

    /// Replays a persisted terminal status, used when resuming a run.
    pub fn restore(
        &mut self,
        node_id: &NodeId,
        status: NodeStatus,
        output: Option<&JsonValue>,
        bypassed: bool,
    ) {
        match status {
            NodeStatus::Success => {
                self.mark_succeeded(node_id, output.unwrap_or(&JsonValue::Null));
            }
            NodeStatus::Failed => self.mark_failed(node_id, bypassed),
            NodeStatus::Skipped => self.mark_skipped(node_id),
            NodeStatus::Pending | NodeStatus::Running => {}
        }
    }

    /// Decides every waiting node whose upstream nodes are all terminal.
    ///
    /// Skips cascade within one call, so a skipped branch is fully resolved
    /// before it returns.
    pub fn advance(&mut self) -> Advance {
        let mut advance = Advance::default();

        for idx in self.order.clone() {
            let node_id = self.graph[idx].clone();
            if self.slots.get(&node_id) != Some(&Slot::Waiting) {
                continue;
            }

            let mut inbound = 0;
            let mut undecided = false;
            let mut blocked = false;
            let mut active = false;
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                inbound += 1;
                let source = &self.graph[edge.source()];
                match self.slots.get(source) {
                    Some(Slot::Succeeded(activation)) => {
                        active |= activation.activates(edge.weight());
                    }
                    Some(Slot::Failed { bypassed: true }) => active = true,
                    Some(Slot::Failed { bypassed: false }) => blocked = true,
                    Some(Slot::Skipped) => {}
                    _ => undecided = true,
                }
            }

            if undecided {
                continue;
            }
            if inbound == 0 || (active && !blocked) {
                self.slots.insert(node_id.clone(), Slot::Queued);
                advance.ready.push(node_id);
            } else {
                let reason = if blocked {
                    SkipReason::UpstreamFailed
                } else {
                    SkipReason::NoActiveInbound
                };
                self.slots.insert(node_id.clone(), Slot::Skipped);
                advance.skipped.push((node_id, reason));
            }
        }

        advance
    }

    /// Upstream nodes whose edge into `node_id` fired.
    #[must_use]
    pub fn active_sources(&self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(&idx) = self.node_to_index.get(node_id) else {
            return Vec::new();
        };
        let mut sources: Vec<NodeId> = Vec::new();
        for edge in self.graph.edges_directed(idx, Direction::Incoming) {
            let source = &self.graph[edge.source()];
            let fired = match self.slots.get(source) {
                Some(Slot::Succeeded(activation)) => activation.activates(edge.weight()),
                Some(Slot::Failed { bypassed: true }) => true,
                _ => false,
            };
            if fired && !sources.contains(source) {
                sources.push(source.clone());
            }
        }
        sources.reverse();
        sources
    }

    /// Returns true when every node is decided and nothing is running.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slots.values().all(Slot::is_terminal)
    }

    /// The status of a node as the frontier sees it.
    #[must_use]
    pub fn status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.slots.get(node_id).map(|slot| match slot {
            Slot::Waiting | Slot::Queued => NodeStatus::Pending,
            Slot::Running => NodeStatus::Running,
            Slot::Succeeded(_) => NodeStatus::Success,
            Slot::Failed { .. } => NodeStatus::Failed,
            Slot::Skipped => NodeStatus::Skipped,
        })
    }

    /// The run status implied by the decided nodes.
    #[must_use]
    pub fn outcome(&self) -> RunStatus {
        let mut bypassed_failure = false;
        for slot in self.slots.values() {
            match slot {
                Slot::Failed { bypassed: false } => return RunStatus::Failed,
                Slot::Failed { bypassed: true } => bypassed_failure = true,
                _ => {}
            }
        }
        if bypassed_failure {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::{Node, NodeType};
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn graph(nodes: &[&str], edges: &[(&str, &str, &str)]) -> WorkflowGraph {
        let nodes = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let node_type = if i == 0 { NodeType::ManualTrigger } else { NodeType::Log };
                Node::new(*n, node_type)
            })
            .collect();
        let edges = edges
            .iter()
            .map(|(s, port, t)| Edge::new(format!("{s}->{t}"), *s, *t).with_source_port(*port))
            .collect();
        WorkflowGraph::from_parts(nodes, edges).expect("graph")
    }

    #[test]
    fn empty_graph_is_immediately_complete() {
        let frontier = Frontier::from_graph(&WorkflowGraph::new()).expect("frontier");
        assert!(frontier.is_complete());
        assert_eq!(frontier.outcome(), RunStatus::Success);
    }

    #[test]
    fn linear_graph_releases_one_node_at_a_time() {
        let g = graph(&["t", "a", "b"], &[("t", "output", "a"), ("a", "output", "b")]);
        let mut frontier = Frontier::from_graph(&g).expect("frontier");

        assert_eq!(frontier.advance().ready, vec![id("t")]);
        frontier.mark_running(&id("t"));
        assert!(frontier.advance().is_empty());

        frontier.mark_succeeded(&id("t"), &json!({}));
        assert_eq!(frontier.advance().ready, vec![id("a")]);
        frontier.mark_succeeded(&id("a"), &json!({}));
        assert_eq!(frontier.advance().ready, vec![id("b")]);
        frontier.mark_succeeded(&id("b"), &json!({}));

        assert!(frontier.is_complete());
        assert_eq!(frontier.outcome(), RunStatus::Success);
    }

    #[test]
    fn join_waits_for_every_branch() {
        let g = graph(
            &["t", "a", "c", "b"],
            &[
                ("t", "output", "a"),
                ("t", "output", "c"),
                ("a", "output", "b"),
                ("c", "output", "b"),
            ],
        );
        let mut frontier = Frontier::from_graph(&g).expect("frontier");
        frontier.advance();
        frontier.mark_succeeded(&id("t"), &json!({}));

        let mut ready = frontier.advance().ready;
        ready.sort();
        assert_eq!(ready, vec![id("a"), id("c")]);

        frontier.mark_succeeded(&id("a"), &json!({}));
        assert!(frontier.advance().is_empty());

        frontier.mark_succeeded(&id("c"), &json!({}));
        assert_eq!(frontier.advance().ready, vec![id("b")]);
        assert!(frontier.advance().is_empty());
        assert_eq!(frontier.active_sources(&id("b")), vec![id("a"), id("c")]);
    }

    #[test]
    fn failure_skips_downstream() {
        let g = graph(&["t", "a", "b", "c"], &[
            ("t", "output", "a"),
            ("a", "output", "b"),
            ("b", "output", "c"),
        ]);
        let mut frontier = Frontier::from_graph(&g).expect("frontier");
        frontier.advance();
        frontier.mark_succeeded(&id("t"), &json!({}));
        frontier.advance();
        frontier.mark_failed(&id("a"), false);

        let advance = frontier.advance();
        assert!(advance.ready.is_empty());
        assert_eq!(
            advance.skipped,
            vec![
                (id("b"), SkipReason::UpstreamFailed),
                (id("c"), SkipReason::NoActiveInbound),
            ]
        );
        assert!(frontier.is_complete());
        assert_eq!(frontier.outcome(), RunStatus::Failed);
    }

    #[test]
    fn bypassed_failure_lets_downstream_run() {
        let g = graph(&["t", "a", "b"], &[("t", "output", "a"), ("a", "output", "b")]);
        let mut frontier = Frontier::from_graph(&g).expect("frontier");
        frontier.advance();
        frontier.mark_succeeded(&id("t"), &json!({}));
        frontier.advance();
        frontier.mark_failed(&id("a"), true);

        assert_eq!(frontier.advance().ready, vec![id("b")]);
        frontier.mark_succeeded(&id("b"), &json!({}));
        assert_eq!(frontier.outcome(), RunStatus::PartialSuccess);
    }

    #[test]
    fn untaken_branch_is_pruned_but_join_survives() {
        // t -> route -(yes)-> a -> join
        //           \-(no)--> b -> join
        let g = graph(&["t", "route", "a", "b", "join"], &[
            ("t", "output", "route"),
            ("route", "yes", "a"),
            ("route", "no", "b"),
            ("a", "output", "join"),
            ("b", "output", "join"),
        ]);
        let mut frontier = Frontier::from_graph(&g).expect("frontier");
        frontier.advance();
        frontier.mark_succeeded(&id("t"), &json!({}));
        frontier.advance();
        frontier.mark_succeeded(&id("route"), &json!({"selectedPort": "yes"}));

        let advance = frontier.advance();
        assert_eq!(advance.ready, vec![id("a")]);
        assert_eq!(advance.skipped, vec![(id("b"), SkipReason::NoActiveInbound)]);

        frontier.mark_succeeded(&id("a"), &json!({}));
        assert_eq!(frontier.advance().ready, vec![id("join")]);
        assert_eq!(frontier.active_sources(&id("join")), vec![id("a")]);
    }

    #[test]
    fn restore_replays_persisted_state() {
        let g = graph(&["t", "a", "b"], &[("t", "output", "a"), ("a", "output", "b")]);
        let mut frontier = Frontier::from_graph(&g).expect("frontier");
        frontier.restore(&id("t"), NodeStatus::Success, Some(&json!({})), false);
        frontier.restore(&id("a"), NodeStatus::Running, None, false);

        assert_eq!(frontier.advance().ready, vec![id("a")]);
        assert_eq!(frontier.status(&id("t")), Some(NodeStatus::Success));
    }

    #[test]
    fn terminal_slots_are_final() {
        let g = graph(&["t"], &[]);
        let mut frontier = Frontier::from_graph(&g).expect("frontier");
        frontier.advance();
        frontier.mark_failed(&id("t"), false);
        frontier.mark_succeeded(&id("t"), &json!({}));
        assert_eq!(frontier.status(&id("t")), Some(NodeStatus::Failed));
    }
}
