//! Graph construction from method bytecode.
//!
//! [`GraphBuilder`] turns one root method, together with every method it decides to
//! inline, into a single [`Graph`]. The work is split by concern:
//!
//! - the block parser walks blocks in reverse postorder and translates instructions
//! - the stitcher connects blocks: merges, loop headers, loop exits and phis
//! - the dispatch builder lowers exception handler tables into type tests
//! - the invocation resolver devirtualizes, consults plugins and inlines
//! - the frequency estimator annotates loops once the graph is complete
//!
//! # Examples
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bytegraph::prelude::*;
//!
//! let env = BuildEnv::new(Arc::new(hierarchy));
//! let config = BuilderConfig::default();
//! let built = GraphBuilder::new(&env, &config).build(MethodId::new(1))?;
//! println!("{}", built.graph.to_dot("main"));
//! ```

mod cleanup;
mod dispatch;
mod frequency;
mod invoke;
mod parser;
mod plugins;
mod report;
mod scope;
mod stitcher;

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

pub use frequency::MAX_LOOP_FREQUENCY;
pub use invoke::InvocationDescriptor;
pub use plugins::{
    InlineDecision, InlineDecisionPlugin, IntrinsicFn, IntrinsicPlugin, InvocationPlugin,
    PluginContext, PluginRegistry, PluginScope,
};
pub use report::{
    BuildReport, CallSiteOutcome, CallSiteRecord, Devirtualization, DevirtualizationKind,
    InlinedMethod, UnresolvedKind, UnresolvedReference,
};

use crate::{
    config::BuilderConfig,
    frame::{FrameState, FrameValue},
    ir::{verify, Graph, NodeId, NodeKind},
    metadata::{MetadataProvider, MethodId, Resolution},
    profile::{NoProfile, ProfileOracle},
    Error, Result,
};
use parser::BlockParser;
use scope::{BuildContext, MethodScope};

/// Probability of the exceptional successor of a call or implicit check.
pub(crate) const EXCEPTION_EDGE_PROBABILITY: f64 = 1e-3;

/// The read-only inputs shared by every build.
#[derive(Clone)]
pub struct BuildEnv {
    /// Method and type lookups
    pub metadata: Arc<dyn MetadataProvider>,
    /// Branch, switch and exception profiles
    pub profile: Arc<dyn ProfileOracle>,
    /// Call site plugins
    pub plugins: PluginRegistry,
}

impl BuildEnv {
    /// Creates an environment without profile data or plugins.
    #[must_use]
    pub fn new(metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            metadata,
            profile: Arc::new(NoProfile),
            plugins: PluginRegistry::new(),
        }
    }

    /// Replaces the profile oracle.
    #[must_use]
    pub fn with_profile(mut self, profile: Arc<dyn ProfileOracle>) -> Self {
        self.profile = profile;
        self
    }

    /// Replaces the plugin registry.
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }
}

impl std::fmt::Debug for BuildEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEnv")
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Estimated iteration count of one loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopFrequency {
    /// The loop's header node
    pub header: NodeId,
    /// Expected iterations per entry, in `[1, MAX_LOOP_FREQUENCY]` for loops that exit
    pub frequency: f64,
}

/// A finished compilation unit.
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    /// The graph, verified
    pub graph: Graph,
    /// The root method
    pub method: MethodId,
    /// Every reachable loop, in walk order
    pub loops: Vec<LoopFrequency>,
    /// Call sites, inlined methods and unresolved references
    pub report: BuildReport,
}

/// Builds graphs for root methods.
#[derive(Debug, Clone, Copy)]
pub struct GraphBuilder<'env> {
    env: &'env BuildEnv,
    config: &'env BuilderConfig,
}

impl<'env> GraphBuilder<'env> {
    /// Creates a builder over shared inputs.
    #[must_use]
    pub fn new(env: &'env BuildEnv, config: &'env BuilderConfig) -> Self {
        Self { env, config }
    }

    /// Builds the graph of `method`.
    ///
    /// # Arguments
    ///
    /// * `method` - The compilation root, resolved through the environment's metadata
    ///
    /// # Returns
    ///
    /// The cleaned and verified graph together with the frequency of every loop and a
    /// report of call sites, inlined methods and unresolved references.
    ///
    /// # Errors
    ///
    /// - [`Error::UnresolvedRoot`] if `method` cannot be resolved or has no body
    /// - [`Error::Verification`] for invalid bytecode
    /// - [`Error::BudgetExceeded`] when a node, time or inlining budget runs out
    /// - [`Error::Malformed`] or [`Error::NotSupported`] for inputs the builder rejects
    ///
    /// No partial graph is returned on failure.
    pub fn build(&self, method: MethodId) -> Result<BuiltGraph> {
        let info = match self.env.metadata.method(method) {
            Resolution::Resolved(info) => info,
            Resolution::Unresolved(reason) => return Err(Error::UnresolvedRoot(reason)),
        };
        let body = info
            .body
            .clone()
            .ok_or_else(|| Error::UnresolvedRoot(format!("{method} has no body")))?;

        let mut ctx = BuildContext::new(self.env, self.config);
        let args: Vec<FrameValue> = info
            .arg_kinds()
            .into_iter()
            .enumerate()
            .map(|(index, kind)| {
                let node = ctx.graph.add_node(NodeKind::Parameter { index }, vec![]);
                FrameValue::new(node, kind)
            })
            .collect();
        let state = FrameState::with_args(body.max_locals, &args)?;

        let scope = MethodScope::new(info, body, self.config, vec![method], None, false)?;
        BlockParser::new(&mut ctx, scope).parse(state, None)?;

        let BuildContext {
            mut graph, report, ..
        } = ctx;
        cleanup::run(&mut graph)?;
        verify(&graph)?;
        let loops = frequency::estimate(&mut graph);

        debug!(
            %method,
            nodes = graph.live_node_count(),
            loops = loops.len(),
            inlined = report.inlined.len(),
            "graph built"
        );
        Ok(BuiltGraph {
            graph,
            method,
            loops,
            report,
        })
    }
}

/// Builds independent units in parallel.
///
/// Units share only `env` and `config`; results are returned in input order.
pub fn build_all(
    env: &BuildEnv,
    config: &BuilderConfig,
    methods: &[MethodId],
) -> Vec<(MethodId, Result<BuiltGraph>)> {
    let builder = GraphBuilder::new(env, config);
    methods
        .par_iter()
        .map(|method| (*method, builder.build(*method)))
        .collect()
}
