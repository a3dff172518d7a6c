//! Resolved method and type descriptions.
//!
//! # Key Types
//! - [`MethodFlags`], [`TypeFlags`]: attribute bitflags
//! - [`MethodInfo`]: a resolved method, optionally with a body
//! - [`TypeInfo`]: a resolved class or interface

use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    bytecode::MethodBody,
    frame::ValueKind,
    metadata::{MethodId, TypeId},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Method attribute flags
    pub struct MethodFlags: u32 {
        /// Method has no receiver
        const STATIC = 0x0001;
        /// Method cannot be overridden
        const FINAL = 0x0002;
        /// Method has no implementation in its declaring type
        const ABSTRACT = 0x0004;
        /// Method is implemented outside of bytecode
        const NATIVE = 0x0008;
        /// Method must never be inlined
        const NEVER_INLINE = 0x0010;
        /// Method holds its receiver's monitor while running
        const SYNCHRONIZED = 0x0020;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Type attribute flags
    pub struct TypeFlags: u32 {
        /// Type cannot be subclassed
        const FINAL = 0x0001;
        /// Type is an interface
        const INTERFACE = 0x0002;
        /// Type cannot be instantiated
        const ABSTRACT = 0x0004;
    }
}

/// A resolved method.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// Method identity
    pub id: MethodId,
    /// Simple name, used to match overriding methods
    pub name: String,
    /// Declaring type
    pub holder: TypeId,
    /// Attribute flags
    pub flags: MethodFlags,
    /// Declared parameter kinds, receiver excluded
    pub params: Vec<ValueKind>,
    /// Declared return kind
    pub return_kind: ValueKind,
    /// Bytecode, if available
    pub body: Option<Arc<MethodBody>>,
}

impl MethodInfo {
    /// Creates a virtual `Void` method without parameters or body.
    #[must_use]
    pub fn new(id: MethodId, name: impl Into<String>, holder: TypeId) -> Self {
        Self {
            id,
            name: name.into(),
            holder,
            flags: MethodFlags::empty(),
            params: Vec::new(),
            return_kind: ValueKind::Void,
            body: None,
        }
    }

    /// Sets the attribute flags.
    #[must_use]
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the declared parameter kinds (receiver excluded).
    #[must_use]
    pub fn with_params(mut self, params: &[ValueKind]) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Sets the declared return kind.
    #[must_use]
    pub fn returns(mut self, kind: ValueKind) -> Self {
        self.return_kind = kind;
        self
    }

    /// Attaches a body.
    #[must_use]
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(Arc::new(body));
        self
    }

    /// Returns `true` for methods without a receiver.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Returns the kinds of all stack arguments, receiver first when present.
    #[must_use]
    pub fn arg_kinds(&self) -> Vec<ValueKind> {
        let mut kinds = Vec::with_capacity(self.params.len() + 1);
        if !self.is_static() {
            kinds.push(ValueKind::Object);
        }
        kinds.extend_from_slice(&self.params);
        kinds
    }

    /// Returns the number of instructions in the body, or `None` without a body.
    #[must_use]
    pub fn code_size(&self) -> Option<usize> {
        self.body.as_ref().map(|b| b.len())
    }

    /// Returns `true` if the method can have a concrete implementation.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        !self.flags.contains(MethodFlags::ABSTRACT)
    }
}

/// A resolved class or interface.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Type identity
    pub id: TypeId,
    /// Type name, for diagnostics
    pub name: String,
    /// Direct superclass
    pub superclass: Option<TypeId>,
    /// Directly implemented interfaces
    pub interfaces: Vec<TypeId>,
    /// Attribute flags
    pub flags: TypeFlags,
}

impl TypeInfo {
    /// Creates a root class without flags.
    #[must_use]
    pub fn new(id: TypeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            flags: TypeFlags::empty(),
        }
    }

    /// Sets the direct superclass.
    #[must_use]
    pub fn extends(mut self, superclass: TypeId) -> Self {
        self.superclass = Some(superclass);
        self
    }

    /// Adds a directly implemented interface.
    #[must_use]
    pub fn implements(mut self, interface: TypeId) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Sets the attribute flags.
    #[must_use]
    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns `true` if the type cannot be subclassed.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.flags.contains(TypeFlags::FINAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_kinds_include_receiver() {
        let m = MethodInfo::new(MethodId::new(1), "f", TypeId::new(1))
            .with_params(&[ValueKind::Int]);
        assert_eq!(m.arg_kinds(), vec![ValueKind::Object, ValueKind::Int]);

        let s = m.with_flags(MethodFlags::STATIC);
        assert_eq!(s.arg_kinds(), vec![ValueKind::Int]);
        assert!(s.code_size().is_none());
    }

    #[test]
    fn test_flags() {
        let flags = MethodFlags::FINAL | MethodFlags::NEVER_INLINE;
        assert!(flags.contains(MethodFlags::FINAL));
        assert!(!flags.contains(MethodFlags::ABSTRACT));

        let ty = TypeInfo::new(TypeId::new(2), "Leaf").with_flags(TypeFlags::FINAL);
        assert!(ty.is_final());
    }
}
