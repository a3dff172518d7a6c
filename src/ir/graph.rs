//! The graph arena.
//!
//! Nodes live in a vector indexed by [`NodeId`]; removed nodes leave a tombstone so handles
//! stay stable. Control edges are stored separately with adjacency lists in both
//! directions, the way [`Graph::successors`] and [`Graph::predecessors`] walk them.

use std::{collections::HashMap, fmt::Write, sync::Arc};

use crate::{
    frame::FrameSnapshot,
    ir::{Node, NodeClass, NodeId, NodeKind},
    utils::escape_dot,
    Result,
};

/// Unique identifier of a control edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);

impl EdgeId {
    /// Returns the raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Role of a control edge at its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// The only successor of a non-split node.
    Next,
    /// Taken branch of an [`NodeKind::If`].
    True,
    /// Not-taken branch of an [`NodeKind::If`].
    False,
    /// The n-th case of a [`NodeKind::Switch`].
    Case(usize),
    /// Default successor of a [`NodeKind::Switch`].
    Default,
    /// Exceptional successor of an [`NodeKind::InvokeWithException`].
    Exception,
}

impl EdgeKind {
    fn label(self) -> String {
        match self {
            EdgeKind::Next => String::new(),
            EdgeKind::True => "T".to_string(),
            EdgeKind::False => "F".to_string(),
            EdgeKind::Case(n) => format!("case {n}"),
            EdgeKind::Default => "default".to_string(),
            EdgeKind::Exception => "exc".to_string(),
        }
    }
}

/// A control edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Source node
    pub source: NodeId,
    /// Target node
    pub target: NodeId,
    /// Role of the edge at its source
    pub kind: EdgeKind,
    /// Probability of taking this edge when control reaches `source`
    pub probability: f64,
}

/// Arena of IR nodes and control edges for one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    edges: Vec<Option<Edge>>,
    outgoing: Vec<Vec<EdgeId>>,
    incoming: Vec<Vec<EdgeId>>,
    start: Option<NodeId>,
    loop_frequencies: HashMap<NodeId, f64>,
    live: usize,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its handle.
    pub fn add_node(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId::new(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(Some(Node::new(kind, inputs)));
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        self.live += 1;
        id
    }

    /// Returns the node behind `id`, or `None` if it never existed or was removed.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| malformed_error!("Node {} does not exist", id))
    }

    /// Returns the kind of a live node.
    #[must_use]
    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.node(id).map(|n| &n.kind)
    }

    /// Returns the data inputs of a live node (empty for removed nodes).
    #[must_use]
    pub fn inputs(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map_or(&[], |n| n.inputs.as_slice())
    }

    /// Returns `true` if `id` refers to a live node.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Appends an input to a phi.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if `phi` is not a live phi.
    pub fn add_phi_input(&mut self, phi: NodeId, value: NodeId) -> Result<()> {
        let node = self.node_mut(phi)?;
        if !matches!(node.kind, NodeKind::Phi { .. }) {
            return Err(malformed_error!("Node {} is not a phi", phi));
        }
        node.inputs.push(value);
        Ok(())
    }

    /// Attaches a frame snapshot to a node, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the node does not exist.
    pub fn set_snapshot(&mut self, id: NodeId, snapshot: Arc<FrameSnapshot>) -> Result<()> {
        self.node_mut(id)?.snapshot = Some(snapshot);
        Ok(())
    }

    /// Returns the snapshot attached to a node.
    #[must_use]
    pub fn snapshot(&self, id: NodeId) -> Option<&Arc<FrameSnapshot>> {
        self.node(id).and_then(|n| n.snapshot.as_ref())
    }

    /// Adds a control edge.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if either endpoint is not a live node.
    pub fn add_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        kind: EdgeKind,
        probability: f64,
    ) -> Result<EdgeId> {
        if !self.contains(source) {
            return Err(malformed_error!("Edge source {} does not exist", source));
        }
        if !self.contains(target) {
            return Err(malformed_error!("Edge target {} does not exist", target));
        }

        let id = EdgeId(self.edges.len());
        self.edges.push(Some(Edge {
            source,
            target,
            kind,
            probability,
        }));
        self.outgoing[source.index()].push(id);
        self.incoming[target.index()].push(id);
        Ok(id)
    }

    /// Returns an edge.
    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.index()).and_then(Option::as_ref)
    }

    /// Moves the target end of an edge to `new_target`, keeping its source, kind and
    /// probability.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the edge or the new target does not exist.
    pub fn retarget_edge(&mut self, id: EdgeId, new_target: NodeId) -> Result<()> {
        if !self.contains(new_target) {
            return Err(malformed_error!("Edge target {} does not exist", new_target));
        }
        let edge = self
            .edges
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| malformed_error!("Edge {:?} does not exist", id))?;

        let old_target = edge.target;
        edge.target = new_target;
        self.incoming[old_target.index()].retain(|e| *e != id);
        self.incoming[new_target.index()].push(id);
        Ok(())
    }

    /// Removes a node and every edge touching it. The handle is never reused.
    pub fn remove_node(&mut self, id: NodeId) {
        let Some(slot) = self.nodes.get_mut(id.index()) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        self.live -= 1;
        self.loop_frequencies.remove(&id);

        let touching: Vec<EdgeId> = self.outgoing[id.index()]
            .drain(..)
            .chain(self.incoming[id.index()].drain(..))
            .collect();
        for edge_id in touching {
            if let Some(edge) = self.edges[edge_id.index()].take() {
                self.outgoing[edge.source.index()].retain(|e| *e != edge_id);
                self.incoming[edge.target.index()].retain(|e| *e != edge_id);
            }
        }
    }

    /// Outgoing edges of a node, in insertion order.
    pub fn successor_edges(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.outgoing
            .get(id.index())
            .into_iter()
            .flatten()
            .filter_map(|e| self.edge(*e).map(|edge| (*e, edge)))
    }

    /// Incoming edges of a node, in insertion order.
    pub fn predecessor_edges(&self, id: NodeId) -> impl Iterator<Item = (EdgeId, &Edge)> + '_ {
        self.incoming
            .get(id.index())
            .into_iter()
            .flatten()
            .filter_map(|e| self.edge(*e).map(|edge| (*e, edge)))
    }

    /// Control successors of a node.
    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.successor_edges(id).map(|(_, e)| e.target)
    }

    /// Control predecessors of a node.
    pub fn predecessors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.predecessor_edges(id).map(|(_, e)| e.source)
    }

    /// Number of incoming control edges.
    #[must_use]
    pub fn in_degree(&self, id: NodeId) -> usize {
        self.incoming.get(id.index()).map_or(0, Vec::len)
    }

    /// Number of outgoing control edges.
    #[must_use]
    pub fn out_degree(&self, id: NodeId) -> usize {
        self.outgoing.get(id.index()).map_or(0, Vec::len)
    }

    /// Number of handles ever allocated, removed nodes included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn live_node_count(&self) -> usize {
        self.live
    }

    /// Number of live control edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().flatten().count()
    }

    /// Iterates live nodes in allocation order.
    pub fn live_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes.iter().enumerate().filter_map(|(idx, n)| {
            n.as_ref()
                .map(|n| (NodeId::new(u32::try_from(idx).unwrap_or(u32::MAX)), n))
        })
    }

    /// Number of live nodes of a class.
    #[must_use]
    pub fn count(&self, class: NodeClass) -> usize {
        self.live_nodes().filter(|(_, n)| n.class() == class).count()
    }

    /// Handles of the live nodes of a class.
    #[must_use]
    pub fn nodes_of(&self, class: NodeClass) -> Vec<NodeId> {
        self.live_nodes()
            .filter(|(_, n)| n.class() == class)
            .map(|(id, _)| id)
            .collect()
    }

    /// Marks the unit's entry node.
    pub fn set_start(&mut self, id: NodeId) {
        self.start = Some(id);
    }

    /// Returns the unit's entry node.
    #[must_use]
    pub fn start(&self) -> Option<NodeId> {
        self.start
    }

    /// Records the estimated trip-count multiplier of a loop.
    pub fn set_loop_frequency(&mut self, header: NodeId, frequency: f64) {
        self.loop_frequencies.insert(header, frequency);
    }

    /// Returns the estimated trip-count multiplier of a loop.
    #[must_use]
    pub fn loop_frequency(&self, header: NodeId) -> Option<f64> {
        self.loop_frequencies.get(&header).copied()
    }

    /// Renders the graph in Graphviz DOT format.
    ///
    /// Control edges are solid, data inputs dashed.
    #[must_use]
    pub fn to_dot(&self, title: &str) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph \"{}\" {{", escape_dot(title));
        let _ = writeln!(dot, "  node [shape=box, fontname=\"monospace\"];");

        for (id, node) in self.live_nodes() {
            let shape = if node.kind.is_control() {
                "box"
            } else {
                "ellipse"
            };
            let _ = writeln!(
                dot,
                "  {} [label=\"{} {}\", shape={}];",
                id,
                id,
                escape_dot(&node.kind.to_string()),
                shape
            );
        }

        for edge in self.edges.iter().flatten() {
            let _ = writeln!(
                dot,
                "  {} -> {} [label=\"{}\"];",
                edge.source,
                edge.target,
                escape_dot(&edge.kind.label())
            );
        }

        for (id, node) in self.live_nodes() {
            for input in &node.inputs {
                let _ = writeln!(dot, "  {input} -> {id} [style=dashed, color=gray];");
            }
        }

        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() -> Result<()> {
        let mut graph = Graph::new();
        let begin = graph.add_node(NodeKind::Begin, vec![]);
        let ret = graph.add_node(NodeKind::Return, vec![]);
        graph.add_edge(begin, ret, EdgeKind::Next, 1.0)?;

        assert_eq!(graph.successors(begin).collect::<Vec<_>>(), vec![ret]);
        assert_eq!(graph.predecessors(ret).collect::<Vec<_>>(), vec![begin]);
        assert_eq!(graph.count(NodeClass::Begin), 1);
        assert_eq!(graph.edge_count(), 1);
        Ok(())
    }

    #[test]
    fn test_retarget_edge() -> Result<()> {
        let mut graph = Graph::new();
        let a = graph.add_node(NodeKind::Begin, vec![]);
        let b = graph.add_node(NodeKind::Begin, vec![]);
        let c = graph.add_node(NodeKind::End, vec![]);
        let edge = graph.add_edge(a, b, EdgeKind::Next, 1.0)?;

        graph.retarget_edge(edge, c)?;
        assert_eq!(graph.in_degree(b), 0);
        assert_eq!(graph.predecessors(c).collect::<Vec<_>>(), vec![a]);
        Ok(())
    }

    #[test]
    fn test_remove_node_keeps_handles() -> Result<()> {
        let mut graph = Graph::new();
        let a = graph.add_node(NodeKind::Begin, vec![]);
        let b = graph.add_node(NodeKind::Begin, vec![]);
        graph.add_edge(a, b, EdgeKind::Next, 1.0)?;

        graph.remove_node(b);
        assert!(!graph.contains(b));
        assert_eq!(graph.out_degree(a), 0);
        assert_eq!(graph.live_node_count(), 1);

        let c = graph.add_node(NodeKind::Return, vec![]);
        assert_eq!(c, NodeId::new(2));
        assert!(graph.add_edge(a, b, EdgeKind::Next, 1.0).is_err());
        Ok(())
    }

    #[test]
    fn test_phi_inputs() -> Result<()> {
        let mut graph = Graph::new();
        let merge = graph.add_node(NodeKind::Merge, vec![]);
        let one = graph.add_node(NodeKind::Constant(1), vec![]);
        let phi = graph.add_node(NodeKind::Phi { merge }, vec![one]);

        graph.add_phi_input(phi, one)?;
        assert_eq!(graph.inputs(phi).len(), 2);
        assert!(graph.add_phi_input(merge, one).is_err());
        Ok(())
    }

    #[test]
    fn test_to_dot() -> Result<()> {
        let mut graph = Graph::new();
        let begin = graph.add_node(NodeKind::Begin, vec![]);
        let c = graph.add_node(NodeKind::Constant(7), vec![]);
        let ret = graph.add_node(NodeKind::Return, vec![c]);
        graph.add_edge(begin, ret, EdgeKind::Next, 1.0)?;

        let dot = graph.to_dot("test");
        assert!(dot.starts_with("digraph \"test\" {"));
        assert!(dot.contains("n0 -> n2"));
        assert!(dot.contains("Constant(7)"));
        assert!(dot.contains("n1 -> n2 [style=dashed"));
        Ok(())
    }
}
