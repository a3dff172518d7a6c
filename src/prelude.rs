//! # bytegraph Prelude
//!
//! The types needed to assemble methods, describe their metadata and build graphs.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

pub use crate::{BudgetKind, Error, Result};

// ================================================================================================
// Building
// ================================================================================================

pub use crate::builder::{
    build_all, BuildEnv, BuildReport, BuiltGraph, CallSiteOutcome, Devirtualization,
    GraphBuilder, InlineDecision, InlineDecisionPlugin, IntrinsicPlugin, InvocationDescriptor,
    InvocationPlugin, LoopFrequency, PluginContext, PluginRegistry, PluginScope,
};
pub use crate::config::BuilderConfig;

// ================================================================================================
// Input
// ================================================================================================

pub use crate::bytecode::{
    ArithOp, Condition, InvokeKind, MethodAssembler, MethodBody, Opcode, Position,
};
pub use crate::metadata::{
    ClassHierarchy, MetadataProvider, MethodFlags, MethodId, MethodInfo, Resolution, TypeFlags,
    TypeId, TypeInfo,
};
pub use crate::profile::{NoProfile, ProfileOracle, RecordedProfile};

// ================================================================================================
// Output
// ================================================================================================

pub use crate::frame::{FrameSnapshot, FrameValue, ValueKind};
pub use crate::ir::{DeoptReason, EdgeKind, Graph, NodeClass, NodeId, NodeKind};
