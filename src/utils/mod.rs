//! Shared helpers used across the builder.

mod bitset;
mod dot;

pub use bitset::{BitSet, BitSetIter};
pub use dot::escape_dot;
