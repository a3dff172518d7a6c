//! Method-level analyses the graph builder consumes.
//!
//! - [`BlockMap`]: basic blocks in reverse postorder, exception dispatch chains, loops
//! - [`LocalLiveness`]: live locals at block entry, behind the [`LivenessOracle`] trait
//!
//! Both are computed once per method (root or inlined) and are read-only afterwards.

mod blockmap;
mod liveness;

pub use blockmap::{Block, BlockId, BlockKind, BlockMap};
pub use liveness::{AllLive, LivenessOracle, LocalLiveness};
