//! Removal of control nodes the parse left without purpose.

use tracing::trace;

use crate::{
    ir::{Graph, NodeId, NodeKind},
    Result,
};

/// Deletes unreachable entry nodes and folds `Begin`s that separate nothing.
///
/// Entry nodes become unreachable when a `Begin` is replaced by a `Merge`, or when no
/// edge ever reaches a loop header. A `Begin` is only needed directly after a control
/// split or as the start node.
pub(crate) fn run(graph: &mut Graph) -> Result<()> {
    let start = graph.start();
    let orphans: Vec<NodeId> = graph
        .live_nodes()
        .filter(|(id, node)| {
            matches!(node.kind, NodeKind::Begin | NodeKind::LoopHeader { .. })
                && Some(*id) != start
                && graph.in_degree(*id) == 0
        })
        .map(|(id, _)| id)
        .collect();
    for id in &orphans {
        graph.remove_node(*id);
    }

    let begins: Vec<NodeId> = graph
        .live_nodes()
        .filter(|(id, node)| node.kind == NodeKind::Begin && Some(*id) != start)
        .map(|(id, _)| id)
        .collect();
    let mut folded = 0usize;
    for id in begins {
        if graph.in_degree(id) != 1 || graph.out_degree(id) != 1 {
            continue;
        }
        let Some((edge, source)) = graph.predecessor_edges(id).next().map(|(e, d)| (e, d.source))
        else {
            continue;
        };
        if graph.kind(source).is_some_and(NodeKind::is_control_split) {
            continue;
        }
        let Some(successor) = graph.successors(id).next() else {
            continue;
        };
        graph.retarget_edge(edge, successor)?;
        graph.remove_node(id);
        folded += 1;
    }

    trace!(orphans = orphans.len(), folded, "cleanup");
    Ok(())
}
