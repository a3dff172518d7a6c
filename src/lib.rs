// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! # bytegraph
//!
//! Builds a control-flow-graph intermediate representation from the stack bytecode of a
//! method in a single pass. The graph is ready for optimization: blocks are joined by
//! explicit merges with phis, loops are delimited by headers, back edges and exits, every
//! point that may deoptimize carries a snapshot of the interpreter frame, exception
//! handlers are lowered into type tests, and call sites are devirtualized and inlined.
//!
//! ## Features
//!
//! - **Single pass** - blocks are parsed in reverse postorder; merges and loop phis are
//!   created on the fly
//! - **Frame snapshots** - every state-effecting node records locals, stack and monitors,
//!   chained through inlined frames
//! - **Exception dispatch** - handler tables become `InstanceOf` chains ending in `Unwind`
//! - **Inlining** - class hierarchy devirtualization, plugins and recursive inlining with
//!   depth and node budgets
//! - **Profile guided** - branch probabilities prune dead paths and drive loop frequency
//!   estimation
//! - **Parallel** - independent units are built concurrently
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use bytegraph::prelude::*;
//!
//! let body = MethodAssembler::new()
//!     .locals(1)
//!     .load(0)
//!     .iconst(1)
//!     .add()
//!     .ret_value()
//!     .finish()?;
//!
//! let mut hierarchy = ClassHierarchy::new();
//! hierarchy.add_type(TypeInfo::new(TypeId::new(1), "Main"));
//! hierarchy.add_method(
//!     MethodInfo::new(MethodId::new(1), "inc", TypeId::new(1))
//!         .with_flags(MethodFlags::STATIC)
//!         .with_params(&[ValueKind::Int])
//!         .returns(ValueKind::Int)
//!         .with_body(body),
//! );
//!
//! let env = BuildEnv::new(Arc::new(hierarchy));
//! let config = BuilderConfig::default();
//! let built = GraphBuilder::new(&env, &config).build(MethodId::new(1))?;
//! assert_eq!(built.graph.count(NodeClass::Return), 1);
//! # Ok::<(), bytegraph::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Invalid bytecode and exhausted budgets abort the unit with an [`Error`]; no partial
//! graph is returned. Unresolved methods and types and gaps in profile data are recovered
//! locally: the former become deoptimizing traps listed in the [`builder::BuildReport`],
//! the latter fall back to neutral probabilities.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
pub mod prelude;

/// Block structure and liveness of method bodies.
///
/// # Key Types
///
/// - [`analysis::BlockMap`] - basic blocks in reverse postorder, loops, dispatch chains
/// - [`analysis::LocalLiveness`] - live locals at block entry
pub mod analysis;

/// The graph builder and everything it reports.
///
/// # Key Types
///
/// - [`builder::GraphBuilder`] - builds one unit
/// - [`builder::BuildEnv`] - metadata, profile and plugins shared between builds
/// - [`builder::BuiltGraph`] - a verified graph with loop frequencies and a report
pub mod builder;

/// Bytecode instructions, method bodies and an assembler for writing them.
pub mod bytecode;

/// Builder configuration.
pub mod config;

/// Abstract interpreter frames and their snapshots.
pub mod frame;

/// The graph intermediate representation.
pub mod ir;

/// Method and type metadata, and the provider interface the builder resolves through.
pub mod metadata;

/// Profile data and its recovery rules.
pub mod profile;

/// Small shared data structures.
pub mod utils;

/// `bytegraph` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `bytegraph` Error type
///
/// # Examples
///
/// ```rust
/// use bytegraph::Error;
///
/// fn describe(err: &Error) -> &'static str {
///     match err {
///         Error::Verification { .. } => "invalid bytecode",
///         Error::BudgetExceeded { .. } => "retry with a smaller budget",
///         _ => "rejected",
///     }
/// }
/// ```
pub use error::{BudgetKind, Error};

pub use builder::{build_all, BuildEnv, BuiltGraph, GraphBuilder};
pub use config::BuilderConfig;
