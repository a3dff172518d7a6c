//! In-memory class hierarchy with Class Hierarchy Analysis (CHA).
//!
//! Overriding is matched by name: a non-static method declared in a subtype with the same
//! name as a virtual method overrides it. CHA answers "which implementations can a call to
//! this method reach" by walking every transitive subtype of the declaring type.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::metadata::{MetadataProvider, MethodId, MethodInfo, Resolution, TypeId, TypeInfo};

/// A [`MetadataProvider`] backed by hash maps.
///
/// # Examples
///
/// ```rust
/// use bytegraph::metadata::{ClassHierarchy, MetadataProvider, MethodId, MethodInfo, TypeId, TypeInfo};
///
/// let mut hierarchy = ClassHierarchy::new();
/// hierarchy.add_type(TypeInfo::new(TypeId::new(1), "Shape"));
/// hierarchy.add_type(TypeInfo::new(TypeId::new(2), "Circle").extends(TypeId::new(1)));
/// hierarchy.add_method(MethodInfo::new(MethodId::new(10), "area", TypeId::new(2)));
///
/// assert!(hierarchy.is_subtype(TypeId::new(2), TypeId::new(1)));
/// assert_eq!(hierarchy.unique_concrete_method(MethodId::new(10)), Some(MethodId::new(10)));
/// ```
#[derive(Debug, Default, Clone)]
pub struct ClassHierarchy {
    types: HashMap<TypeId, Arc<TypeInfo>>,
    methods: HashMap<MethodId, Arc<MethodInfo>>,
    /// Declared methods per type, in insertion order.
    declared: HashMap<TypeId, Vec<MethodId>>,
    /// Type hierarchy: type -> direct subclasses and implementors.
    subtypes: HashMap<TypeId, Vec<TypeId>>,
    unresolved_methods: HashSet<MethodId>,
    unresolved_types: HashSet<TypeId>,
}

impl ClassHierarchy {
    /// Creates an empty hierarchy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type and links it below its superclass and interfaces.
    pub fn add_type(&mut self, info: TypeInfo) {
        let id = info.id;
        for parent in info.superclass.iter().chain(info.interfaces.iter()) {
            self.subtypes.entry(*parent).or_default().push(id);
        }
        self.types.insert(id, Arc::new(info));
    }

    /// Registers a method under its declaring type.
    pub fn add_method(&mut self, info: MethodInfo) {
        let id = info.id;
        self.declared.entry(info.holder).or_default().push(id);
        self.methods.insert(id, Arc::new(info));
    }

    /// Makes every lookup of `id` answer [`Resolution::Unresolved`].
    pub fn mark_unresolved_method(&mut self, id: MethodId) {
        self.unresolved_methods.insert(id);
    }

    /// Makes every lookup of `id` answer [`Resolution::Unresolved`].
    pub fn mark_unresolved_type(&mut self, id: TypeId) {
        self.unresolved_types.insert(id);
    }

    /// Returns the number of registered methods.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    fn resolved_method(&self, id: MethodId) -> Option<&Arc<MethodInfo>> {
        if self.unresolved_methods.contains(&id) {
            return None;
        }
        self.methods.get(&id)
    }

    /// Finds the method named `name` declared directly in `ty`.
    fn declared_method(&self, ty: TypeId, name: &str) -> Option<&Arc<MethodInfo>> {
        self.declared
            .get(&ty)?
            .iter()
            .filter_map(|m| self.resolved_method(*m))
            .find(|m| m.name == name && !m.is_static())
    }

    /// Collects every transitive subtype of `root`, `root` included.
    fn subtree(&self, root: TypeId) -> Vec<TypeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(ty) = stack.pop() {
            if !seen.insert(ty) {
                continue;
            }
            order.push(ty);
            if let Some(children) = self.subtypes.get(&ty) {
                stack.extend(children.iter().copied());
            }
        }
        order
    }
}

impl MetadataProvider for ClassHierarchy {
    fn method(&self, id: MethodId) -> Resolution<Arc<MethodInfo>> {
        if self.unresolved_methods.contains(&id) {
            return Resolution::Unresolved(format!("{id} is marked unresolved"));
        }
        match self.methods.get(&id) {
            Some(info) => Resolution::Resolved(info.clone()),
            None => Resolution::Unresolved(format!("{id} is not loaded")),
        }
    }

    fn type_info(&self, id: TypeId) -> Resolution<Arc<TypeInfo>> {
        if self.unresolved_types.contains(&id) {
            return Resolution::Unresolved(format!("{id} is marked unresolved"));
        }
        match self.types.get(&id) {
            Some(info) => Resolution::Resolved(info.clone()),
            None => Resolution::Unresolved(format!("{id} is not loaded")),
        }
    }

    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        let mut stack = vec![sub];
        let mut seen = HashSet::new();
        while let Some(ty) = stack.pop() {
            if ty == sup {
                return true;
            }
            if !seen.insert(ty) {
                continue;
            }
            if let Some(info) = self.types.get(&ty) {
                stack.extend(info.superclass.iter().copied());
                stack.extend(info.interfaces.iter().copied());
            }
        }
        false
    }

    /// Selects the override of `method` that a call on an exact `receiver` dispatches to.
    ///
    /// # Arguments
    ///
    /// * `method` - The declared method of the call site
    /// * `receiver` - The exact runtime type of the receiver
    ///
    /// # Returns
    ///
    /// The nearest declaration with the same name on `receiver` or its superclasses,
    /// `None` if that declaration is abstract, nothing matches, or `method` is unknown.
    /// Static methods resolve to themselves.
    fn resolve_implementation(&self, method: MethodId, receiver: TypeId) -> Option<MethodId> {
        let declared = self.resolved_method(method)?;
        if declared.is_static() {
            return Some(method);
        }

        // Walk up the superclass chain from the exact receiver type
        let mut current = Some(receiver);
        while let Some(ty) = current {
            if let Some(found) = self.declared_method(ty, &declared.name) {
                return found.is_concrete().then_some(found.id);
            }
            current = self.types.get(&ty).and_then(|t| t.superclass);
        }
        None
    }

    fn unique_concrete_method(&self, method: MethodId) -> Option<MethodId> {
        let declared = self.resolved_method(method)?;
        if declared.is_static() {
            return Some(method);
        }

        let mut implementations: Vec<MethodId> = Vec::new();
        if declared.is_concrete() {
            implementations.push(method);
        }
        for ty in self.subtree(declared.holder) {
            if ty == declared.holder {
                continue;
            }
            if let Some(found) = self.declared_method(ty, &declared.name) {
                if found.is_concrete() && !implementations.contains(&found.id) {
                    implementations.push(found.id);
                }
            }
        }

        match implementations.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MethodFlags, TypeFlags};

    fn shapes() -> ClassHierarchy {
        let mut h = ClassHierarchy::new();
        h.add_type(TypeInfo::new(TypeId::new(1), "Shape").with_flags(TypeFlags::ABSTRACT));
        h.add_type(TypeInfo::new(TypeId::new(2), "Circle").extends(TypeId::new(1)));
        h.add_type(TypeInfo::new(TypeId::new(3), "Square").extends(TypeId::new(1)));
        h.add_method(
            MethodInfo::new(MethodId::new(10), "area", TypeId::new(1))
                .with_flags(MethodFlags::ABSTRACT),
        );
        h.add_method(MethodInfo::new(MethodId::new(11), "area", TypeId::new(2)));
        h
    }

    #[test]
    fn test_unique_concrete_method() {
        let mut h = shapes();
        assert_eq!(
            h.unique_concrete_method(MethodId::new(10)),
            Some(MethodId::new(11))
        );

        h.add_method(MethodInfo::new(MethodId::new(12), "area", TypeId::new(3)));
        assert_eq!(h.unique_concrete_method(MethodId::new(10)), None);
    }

    #[test]
    fn test_resolve_implementation_walks_superclasses() {
        let mut h = shapes();
        h.add_type(TypeInfo::new(TypeId::new(4), "Unit").extends(TypeId::new(2)));

        assert_eq!(
            h.resolve_implementation(MethodId::new(10), TypeId::new(4)),
            Some(MethodId::new(11))
        );
        // Square inherits the abstract declaration only
        assert_eq!(
            h.resolve_implementation(MethodId::new(10), TypeId::new(3)),
            None
        );
    }

    #[test]
    fn test_interfaces_are_subtypes() {
        let mut h = ClassHierarchy::new();
        h.add_type(
            TypeInfo::new(TypeId::new(1), "Runnable").with_flags(TypeFlags::INTERFACE),
        );
        h.add_type(TypeInfo::new(TypeId::new(2), "Task").implements(TypeId::new(1)));

        assert!(h.is_subtype(TypeId::new(2), TypeId::new(1)));
        assert!(!h.is_subtype(TypeId::new(1), TypeId::new(2)));
        assert!(h.is_subtype(TypeId::new(2), TypeId::new(2)));
    }

    #[test]
    fn test_unresolved_lookups() {
        let mut h = shapes();
        h.mark_unresolved_method(MethodId::new(11));
        h.mark_unresolved_type(TypeId::new(3));

        assert!(!h.method(MethodId::new(11)).is_resolved());
        assert!(!h.method(MethodId::new(99)).is_resolved());
        assert!(!h.type_info(TypeId::new(3)).is_resolved());
        assert!(h.type_info(TypeId::new(2)).is_resolved());
        assert_eq!(h.unique_concrete_method(MethodId::new(10)), None);
    }
}
