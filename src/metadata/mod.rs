//! Resolved-metadata access for the graph builder.
//!
//! The builder never loads classes itself. It asks a [`MetadataProvider`] for methods and
//! types by id, and the provider may answer [`Resolution::Unresolved`]. An unresolved
//! answer is a normal outcome: the builder lowers the affected operation to a deoptimizing
//! trap and keeps going.
//!
//! [`ClassHierarchy`] is an in-memory provider with class hierarchy analysis, used by
//! tests, benches and embedders without a runtime of their own.

use std::{fmt, sync::Arc};

mod hierarchy;
mod types;

pub use hierarchy::ClassHierarchy;
pub use types::{MethodFlags, MethodInfo, TypeFlags, TypeInfo};

/// Identity of a method.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(u32);

impl MethodId {
    /// Creates a method id from its raw value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        MethodId(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodId({})", self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// Identity of a type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

impl TypeId {
    /// Creates a type id from its raw value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        TypeId(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Outcome of a metadata lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// The entity is available.
    Resolved(T),
    /// The entity cannot be resolved at compile time; the string explains why.
    Unresolved(String),
}

impl<T> Resolution<T> {
    /// Returns the resolved value, discarding the reason otherwise.
    pub fn ok(self) -> Option<T> {
        match self {
            Resolution::Resolved(value) => Some(value),
            Resolution::Unresolved(_) => None,
        }
    }

    /// Returns `true` if the lookup succeeded.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

/// Source of resolved method and type information.
///
/// Providers are shared read-only between concurrently built units, hence `Send + Sync`.
pub trait MetadataProvider: Send + Sync {
    /// Looks up a method.
    fn method(&self, id: MethodId) -> Resolution<Arc<MethodInfo>>;

    /// Looks up a type.
    fn type_info(&self, id: TypeId) -> Resolution<Arc<TypeInfo>>;

    /// Returns `true` if `sub` is `sup` or one of its subclasses or implementors.
    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool;

    /// Returns the implementation of `method` selected by virtual dispatch on an exact
    /// receiver type.
    fn resolve_implementation(&self, method: MethodId, receiver: TypeId) -> Option<MethodId>;

    /// Returns the only concrete implementation of `method` across the loaded hierarchy.
    fn unique_concrete_method(&self, method: MethodId) -> Option<MethodId>;
}
