//! Structural checks run on a finished graph before it is handed out.

use crate::{
    bytecode::Position,
    ir::{Graph, NodeId, NodeKind},
    Result,
};

fn position_of(graph: &Graph, id: NodeId) -> Position {
    graph
        .snapshot(id)
        .map_or_else(Position::default, |s| s.position())
}

/// Verifies the invariants every built graph must satisfy.
///
/// - a single live start node exists and carries a snapshot
/// - every live state-effecting node carries a snapshot
/// - every live phi has one input per incoming edge of its merge
/// - every live proxy refers to a live loop exit
/// - every live control node other than the start has a predecessor
///
/// # Errors
///
/// Returns [`crate::Error::Verification`] for the first violated invariant.
pub fn verify(graph: &Graph) -> Result<()> {
    let start = graph
        .start()
        .filter(|s| graph.contains(*s))
        .ok_or_else(|| verification_error!(Position::default(), "graph has no start node"))?;

    if graph.snapshot(start).is_none() {
        return Err(verification_error!(
            Position::default(),
            "start node {} has no frame snapshot",
            start
        ));
    }

    for (id, node) in graph.live_nodes() {
        if node.kind.is_state_effecting() && node.snapshot.is_none() {
            return Err(verification_error!(
                Position::default(),
                "{} {} has no frame snapshot",
                node.kind,
                id
            ));
        }

        match &node.kind {
            NodeKind::Phi { merge } => {
                let expected = graph.in_degree(*merge);
                if !graph.kind(*merge).is_some_and(NodeKind::is_merge) {
                    return Err(verification_error!(
                        Position::default(),
                        "phi {} is attached to {} which is not a merge",
                        id,
                        merge
                    ));
                }
                if node.inputs.len() != expected {
                    return Err(verification_error!(
                        position_of(graph, *merge),
                        "phi {} has {} inputs but {} has {} predecessors",
                        id,
                        node.inputs.len(),
                        merge,
                        expected
                    ));
                }
            }
            NodeKind::Proxy { exit } => {
                if !matches!(graph.kind(*exit), Some(NodeKind::LoopExit { .. })) {
                    return Err(verification_error!(
                        Position::default(),
                        "proxy {} refers to {} which is not a loop exit",
                        id,
                        exit
                    ));
                }
            }
            _ => {}
        }

        if node.kind.is_control() && id != start && graph.in_degree(id) == 0 {
            return Err(verification_error!(
                position_of(graph, id),
                "control node {} {} is unreachable",
                node.kind,
                id
            ));
        }
    }

    Ok(())
}
