//! Configuration for the graph builder.
//!
//! One immutable [`BuilderConfig`] value is threaded by reference through every stage of a
//! build, inlined callees included. There is no global toggle.

use std::{collections::HashSet, time::Duration};

use crate::metadata::TypeId;

/// Configuration for building graphs.
///
/// Controls pruning, inlining limits, resource budgets and diagnostic knobs.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Replace branches with profile probability 0 by an unreached-code trap (default: true).
    pub dead_code_elimination: bool,

    /// Clear locals that are dead at block entry (default: true).
    pub liveness_pruning: bool,

    /// Enable inlining of direct calls (default: true).
    pub enable_inlining: bool,

    /// Maximum instruction count of an inlining candidate (default: 35).
    pub inline_size_threshold: usize,

    /// Nesting depth at which an accepted inlining decision fails the build (default: 8).
    pub max_inlining_depth: usize,

    /// How often a method may appear in one inline chain before it stops being inlined
    /// (default: 1, i.e. no recursive inlining).
    pub max_recursive_inlining: usize,

    /// Maximum number of live nodes in the graph (default: 100 000).
    pub max_node_count: usize,

    /// Wall-clock budget of one build (default: none).
    pub timeout: Option<Duration>,

    /// Lower every call site to a forced deoptimization (default: false).
    pub deopt_all_invokes: bool,

    /// Exception types whose handlers are known to be unreachable.
    pub skipped_exception_types: HashSet<TypeId>,

    /// Drop the exception edge of calls whose profile shows no exception (default: true).
    pub use_profile_for_exception_edges: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            dead_code_elimination: true,
            liveness_pruning: true,
            enable_inlining: true,
            inline_size_threshold: 35,
            max_inlining_depth: 8,
            max_recursive_inlining: 1,
            max_node_count: 100_000,
            timeout: None,
            deopt_all_invokes: false,
            skipped_exception_types: HashSet::new(),
            use_profile_for_exception_edges: true,
        }
    }
}

impl BuilderConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables inlining and sets the candidate size threshold.
    #[must_use]
    pub fn with_inlining(mut self, enable: bool, size_threshold: usize) -> Self {
        self.enable_inlining = enable;
        self.inline_size_threshold = size_threshold;
        self
    }

    /// Sets the hard inlining depth limit and the soft self-recursion budget.
    #[must_use]
    pub fn with_inlining_limits(mut self, max_depth: usize, max_recursive: usize) -> Self {
        self.max_inlining_depth = max_depth;
        self.max_recursive_inlining = max_recursive;
        self
    }

    /// Enables or disables profile-driven dead-code elimination.
    #[must_use]
    pub fn with_dead_code_elimination(mut self, enable: bool) -> Self {
        self.dead_code_elimination = enable;
        self
    }

    /// Enables or disables liveness pruning of locals.
    #[must_use]
    pub fn with_liveness_pruning(mut self, enable: bool) -> Self {
        self.liveness_pruning = enable;
        self
    }

    /// Sets the node budget.
    #[must_use]
    pub fn with_max_node_count(mut self, max: usize) -> Self {
        self.max_node_count = max;
        self
    }

    /// Sets the wall-clock budget of one build.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Forces every call site to deoptimize.
    #[must_use]
    pub fn with_deopt_all_invokes(mut self, enable: bool) -> Self {
        self.deopt_all_invokes = enable;
        self
    }

    /// Marks an exception type whose handlers are never reached.
    #[must_use]
    pub fn with_skipped_exception_type(mut self, ty: TypeId) -> Self {
        self.skipped_exception_types.insert(ty);
        self
    }

    /// Chooses whether profiles may remove exception edges from calls.
    #[must_use]
    pub fn with_profiled_exception_edges(mut self, enable: bool) -> Self {
        self.use_profile_for_exception_edges = enable;
        self
    }
}
