//! Workflow graph: a DAG of task and control nodes.
//!
//! `WorkflowGraph` wraps petgraph's `DiGraph`. Nodes carry a
//! [`WorkflowNode`]; edges say why one node must wait for another.

use crate::error::{Error, Result};
use crate::workflow::types::{NodeId, NodeKind, WorkflowNode};
use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Why an edge exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EdgeKind {
    /// Declared ordering (`after`).
    Order,
    /// The target consumes an output of the source task.
    Data { output: String },
}

impl Default for EdgeKind {
    fn default() -> Self {
        Self::Order
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Order => write!(f, "order"),
            EdgeKind::Data { output } => write!(f, "data: {}", output),
        }
    }
}

pub struct WorkflowGraph {
    graph: DiGraph<WorkflowNode, EdgeKind>,
    index: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a node; re-declaring an id is an error.
    pub fn add_node(&mut self, node: WorkflowNode) -> Result<NodeIndex> {
        if self.index.contains_key(&node.id) {
            return Err(Error::InvalidGraph(format!("node '{}' declared twice", node.id)));
        }
        let id = node.id.clone();
        let index = self.graph.add_node(node);
        self.index.insert(id, index);
        Ok(index)
    }

    /// Add an edge `from -> to`, rejecting edges that would close a cycle.
    ///
    /// An existing edge between the same pair is kept; a data edge
    /// replaces an order edge so the data reason is recorded.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId, kind: EdgeKind) -> Result<()> {
        let from_index = self.require(from)?;
        let to_index = self.require(to)?;

        if let Some(existing) = self.graph.find_edge(from_index, to_index) {
            if matches!(kind, EdgeKind::Data { .. }) {
                if let Some(weight) = self.graph.edge_weight_mut(existing) {
                    *weight = kind;
                }
            }
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, kind);
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::InvalidGraph(format!(
                "edge {} -> {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    fn require(&self, id: &NodeId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("node '{}'", id)))
    }

    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.index.get(id).and_then(|&i| self.graph.node_weight(i))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    pub fn edge(&self, from: &NodeId, to: &NodeId) -> Option<&EdgeKind> {
        let f = self.index.get(from)?;
        let t = self.index.get(to)?;
        let e = self.graph.find_edge(*f, *t)?;
        self.graph.edge_weight(e)
    }

    /// Every edge as `(from, to, kind)`, sorted by endpoints.
    pub fn edges(&self) -> Vec<(NodeId, NodeId, EdgeKind)> {
        let mut edges: Vec<(NodeId, NodeId, EdgeKind)> = self
            .graph
            .edge_references()
            .filter_map(|e| {
                let from = self.graph.node_weight(e.source())?;
                let to = self.graph.node_weight(e.target())?;
                Some((from.id.clone(), to.id.clone(), e.weight().clone()))
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        edges
    }

    fn neighbors(&self, id: &NodeId, dir: Direction) -> Vec<NodeId> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(index, dir)
            .filter_map(|n| self.graph.node_weight(n))
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Nodes `id` waits on.
    pub fn predecessors(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes waiting on `id`.
    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Nodes with no successors; their outcome decides the run.
    pub fn sinks(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .filter_map(|i| self.graph.node_weight(i).map(|n| n.id.clone()))
            .collect();
        ids.sort();
        ids
    }

    pub fn reaches(&self, from: &NodeId, to: &NodeId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&f), Some(&t)) => has_path_connecting(&self.graph, f, t, None),
            _ => false,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.graph.node_weights()
    }

    /// Nodes in an order where every node follows its predecessors.
    pub fn topological_order(&self) -> Result<Vec<&WorkflowNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.id.to_string())
                .unwrap_or_else(|| "unknown".into());
            Error::InvalidGraph(format!("cycle through node '{}'", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect())
    }

    /// Branches between a fork and its join.
    ///
    /// Each entry is the set of nodes reachable from one fork successor
    /// that also reach the join, keyed by that successor.
    pub fn branches(&self, fork: &NodeId, join: &NodeId) -> Vec<(NodeId, BTreeSet<NodeId>)> {
        self.successors(fork)
            .into_iter()
            .filter(|head| head == join || self.reaches(head, join))
            .map(|head| {
                let members: BTreeSet<NodeId> = if &head == join {
                    BTreeSet::new()
                } else {
                    self.nodes()
                        .map(|n| &n.id)
                        .filter(|id| {
                            *id != join
                                && (*id == &head || self.reaches(&head, id))
                                && self.reaches(id, join)
                        })
                        .cloned()
                        .collect()
                };
                (head, members)
            })
            .collect()
    }

    /// Join nodes paired with their fork, outer forks first.
    pub fn fork_join_pairs(&self) -> Result<Vec<(NodeId, NodeId)>> {
        let order = self.topological_order()?;
        let position: HashMap<&NodeId, usize> =
            order.iter().enumerate().map(|(i, n)| (&n.id, i)).collect();
        let mut pairs: Vec<(NodeId, NodeId)> = self
            .nodes()
            .filter_map(|n| match &n.kind {
                NodeKind::Join(spec) => Some((spec.fork.clone(), n.id.clone())),
                _ => None,
            })
            .collect();
        pairs.sort_by_key(|(fork, _)| position.get(fork).copied().unwrap_or(usize::MAX));
        Ok(pairs)
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
