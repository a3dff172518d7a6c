//! Loop frequency estimation from branch probabilities.
//!
//! Reach probabilities flow from the start along control edges. A loop header starts a
//! nested walk at probability 1.0 over the loop body; the probability that reaches the
//! loop's exits during one iteration gives the expected iteration count.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::{
    builder::LoopFrequency,
    ir::{Graph, NodeId, NodeKind},
};

/// Smallest exit probability; bounds the frequency of loops that never exit.
const MIN_EXIT_PROBABILITY: f64 = 1e-4;

/// Frequency of a loop whose exits are reached with at most the minimal exit probability.
pub const MAX_LOOP_FREQUENCY: f64 = 10_000.0;

struct Estimator<'g> {
    graph: &'g Graph,
    /// Forward predecessor counts of merges, computed once per merge
    forward_preds: HashMap<NodeId, usize>,
    loops: Vec<LoopFrequency>,
}

impl<'g> Estimator<'g> {
    fn forward_preds(&mut self, merge: NodeId) -> usize {
        let graph = self.graph;
        *self.forward_preds.entry(merge).or_insert_with(|| {
            graph
                .predecessors(merge)
                .filter(|p| !matches!(graph.kind(*p), Some(NodeKind::LoopEnd { .. })))
                .count()
        })
    }

    /// Walks from `seeds` and returns the exits of loop `within` with their reach
    /// probabilities. Back edges and, inside a loop, its exits end the walk.
    fn walk(&mut self, seeds: Vec<(NodeId, f64)>, within: Option<NodeId>) -> Vec<(NodeId, f64)> {
        let graph = self.graph;
        let mut worklist = seeds;
        let mut pending: BTreeMap<NodeId, (f64, usize)> = BTreeMap::new();
        let mut exits = Vec::new();

        loop {
            while let Some((node, p)) = worklist.pop() {
                match graph.kind(node) {
                    None | Some(NodeKind::LoopEnd { .. }) => {}
                    Some(NodeKind::LoopExit { header }) if Some(*header) == within => {
                        exits.push((node, p));
                    }
                    Some(kind) if kind.is_merge() => {
                        let expected = self.forward_preds(node);
                        let arrived = pending.entry(node).or_insert((0.0, 0));
                        arrived.0 += p;
                        arrived.1 += 1;
                        if arrived.1 >= expected {
                            let (p, _) = arrived.to_owned();
                            pending.remove(&node);
                            self.enter(node, p, &mut worklist);
                        }
                    }
                    Some(_) => self.enter(node, p, &mut worklist),
                }
            }

            // Merges some of whose predecessors were never reached.
            match pending.pop_first() {
                Some((node, (p, _))) => self.enter(node, p, &mut worklist),
                None => break,
            }
        }
        exits
    }

    fn enter(&mut self, node: NodeId, p: f64, worklist: &mut Vec<(NodeId, f64)>) {
        let graph = self.graph;
        if !matches!(graph.kind(node), Some(NodeKind::LoopHeader { .. })) {
            worklist.extend(
                graph
                    .successor_edges(node)
                    .map(|(_, e)| (e.target, p * e.probability)),
            );
            return;
        }

        let body = graph
            .successor_edges(node)
            .map(|(_, e)| (e.target, e.probability))
            .collect();
        let exits = self.walk(body, Some(node));
        let exit_probability: f64 = exits.iter().map(|(_, q)| q).sum();
        let frequency = (1.0 / exit_probability.max(MIN_EXIT_PROBABILITY)).min(MAX_LOOP_FREQUENCY);
        trace!(header = %node, exit_probability, frequency, "loop frequency");
        self.loops.push(LoopFrequency {
            header: node,
            frequency,
        });

        for (exit, q) in exits {
            worklist.extend(
                graph
                    .successor_edges(exit)
                    .map(|(_, e)| (e.target, q * p * frequency * e.probability)),
            );
        }
    }
}

/// Computes the frequency of every reachable loop and stores it on the graph.
///
/// Loops are returned in the order their headers were reached.
pub(crate) fn estimate(graph: &mut Graph) -> Vec<LoopFrequency> {
    let Some(start) = graph.start() else {
        return Vec::new();
    };
    let mut estimator = Estimator {
        graph: &*graph,
        forward_preds: HashMap::new(),
        loops: Vec::new(),
    };
    estimator.walk(vec![(start, 1.0)], None);
    let loops = estimator.loops;

    for l in &loops {
        graph.set_loop_frequency(l.header, l.frequency);
    }
    loops
}
