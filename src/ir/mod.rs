//! Graph intermediate representation.
//!
//! A [`Graph`] is an arena of [`Node`]s addressed by stable [`NodeId`] handles. Control
//! flow is carried by [`Edge`]s between control nodes; data dependencies are node inputs.
//! Nodes are never mutated into another kind: when the builder needs a different kind of
//! node at a join it allocates a new one and rewires edges.
//!
//! # Key Types
//! - [`NodeKind`]: the tagged node variant, [`NodeClass`] its payload-free discriminant
//! - [`Graph`]: the arena with edge storage, snapshots and loop frequencies
//! - [`verify`]: the structural checks every finished graph passes

mod graph;
mod node;
mod verify;

pub use graph::{Edge, EdgeId, EdgeKind, Graph};
pub use node::{DeoptReason, Node, NodeClass, NodeId, NodeKind};
pub use verify::verify;
