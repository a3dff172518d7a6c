//! Per-build and per-method state of the graph builder.

use std::{sync::Arc, time::Instant};

use crate::{
    analysis::{AllLive, BlockId, BlockMap, LivenessOracle, LocalLiveness},
    builder::{BuildEnv, BuildReport},
    bytecode::{MethodBody, Position},
    config::BuilderConfig,
    error::BudgetKind,
    frame::{FrameSnapshot, FrameState},
    ir::{Graph, NodeId},
    metadata::{MethodId, MethodInfo},
    profile::ProfileView,
    Error, Result,
};

/// State shared by the root method and every method inlined into it.
pub(crate) struct BuildContext<'env> {
    pub(crate) env: &'env BuildEnv,
    pub(crate) config: &'env BuilderConfig,
    pub(crate) graph: Graph,
    pub(crate) report: BuildReport,
    deadline: Option<Instant>,
}

impl<'env> BuildContext<'env> {
    pub(crate) fn new(env: &'env BuildEnv, config: &'env BuilderConfig) -> Self {
        Self {
            env,
            config,
            graph: Graph::new(),
            report: BuildReport::default(),
            deadline: config.timeout.map(|t| Instant::now() + t),
        }
    }

    /// Fails once the node budget or the deadline is exhausted.
    pub(crate) fn check_budget(&self, position: Position) -> Result<()> {
        let live = self.graph.live_node_count();
        if live > self.config.max_node_count {
            tracing::debug!(live, limit = self.config.max_node_count, "node budget exhausted");
            return Err(Error::BudgetExceeded {
                position,
                kind: BudgetKind::NodeCount {
                    limit: self.config.max_node_count,
                },
            });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::debug!(%position, "build deadline passed");
            return Err(Error::BudgetExceeded {
                position,
                kind: BudgetKind::Deadline,
            });
        }
        Ok(())
    }
}

/// Graph node standing for a block plus the state flowing into it.
#[derive(Debug, Clone)]
pub(crate) struct BlockEntry {
    /// `Begin`, `Merge` or `LoopHeader`
    pub(crate) node: NodeId,
    /// Merged entry state; `None` until the first edge arrives
    pub(crate) state: Option<FrameState>,
    pub(crate) processed: bool,
}

/// Where control leaves an inlined method.
#[derive(Debug, Clone)]
pub(crate) struct ScopeExit {
    pub(crate) node: NodeId,
    pub(crate) state: FrameState,
}

/// Normal and exceptional exits of an inlined method.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScopeExits {
    pub(crate) returned: Option<ScopeExit>,
    pub(crate) unwound: Option<ScopeExit>,
}

/// One method being parsed, either the root or an inlined callee.
pub(crate) struct MethodScope {
    pub(crate) method: Arc<MethodInfo>,
    pub(crate) body: Arc<MethodBody>,
    pub(crate) blocks: BlockMap,
    pub(crate) liveness: Box<dyn LivenessOracle>,
    /// 0 for the root
    pub(crate) depth: usize,
    /// Methods from the root down to this one
    pub(crate) chain: Vec<MethodId>,
    /// Caller frames, innermost first
    pub(crate) outer: Option<Arc<FrameSnapshot>>,
    /// A handler in some caller frame covers the call that led here
    pub(crate) caller_handles_exceptions: bool,
    pub(crate) entries: Vec<Option<BlockEntry>>,
    /// Header node per loop index
    pub(crate) loop_headers: Vec<NodeId>,
    /// Allocation mark taken when each loop header was processed
    pub(crate) loop_marks: Vec<usize>,
    pub(crate) exits: ScopeExits,
}

impl MethodScope {
    /// Analyzes `body` and prepares an empty entry table.
    pub(crate) fn new(
        method: Arc<MethodInfo>,
        body: Arc<MethodBody>,
        config: &BuilderConfig,
        chain: Vec<MethodId>,
        outer: Option<Arc<FrameSnapshot>>,
        caller_handles_exceptions: bool,
    ) -> Result<Self> {
        let blocks = BlockMap::build(&body)?;
        let liveness: Box<dyn LivenessOracle> = if config.liveness_pruning {
            Box::new(LocalLiveness::compute(&body, &blocks))
        } else {
            Box::new(AllLive)
        };
        let entries = vec![None; blocks.len()];
        Ok(Self {
            depth: chain.len().saturating_sub(1),
            method,
            body,
            blocks,
            liveness,
            chain,
            outer,
            caller_handles_exceptions,
            entries,
            loop_headers: Vec::new(),
            loop_marks: Vec::new(),
            exits: ScopeExits::default(),
        })
    }

    pub(crate) fn id(&self) -> MethodId {
        self.method.id
    }

    pub(crate) fn entry(&self, block: BlockId) -> Option<&BlockEntry> {
        self.entries.get(block.index()).and_then(Option::as_ref)
    }

    pub(crate) fn entry_mut(&mut self, block: BlockId) -> Result<&mut BlockEntry> {
        self.entries
            .get_mut(block.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| malformed_error!("Block {} has no entry", block))
    }

    /// Freezes `state` as a frame of this method, chained to the caller frames.
    pub(crate) fn snapshot(&self, state: &FrameState, position: Position) -> Arc<FrameSnapshot> {
        state.snapshot(self.method.id, position, self.outer.clone())
    }

    /// An exception raised at `position` is observed by a handler here or in a caller.
    pub(crate) fn exception_observable(&self, position: Position) -> bool {
        self.caller_handles_exceptions
            || self.blocks.exception_dispatch_block_of(position).is_some()
    }

    /// First block an exception raised at `position` flows to.
    pub(crate) fn exception_target(&self, position: Position) -> BlockId {
        self.blocks
            .exception_dispatch_block_of(position)
            .unwrap_or_else(|| self.blocks.unwind_block())
    }

    pub(crate) fn profile<'p>(&self, env: &'p BuildEnv) -> ProfileView<'p> {
        ProfileView::new(env.profile.as_ref(), self.method.id)
    }
}
