//! The instruction set understood by the graph builder.
//!
//! Operands are carried inline by each [`Opcode`] variant, so reading an operand is a
//! match on the current opcode rather than a separate decode step.

use strum::IntoStaticStr;

use crate::{
    bytecode::Position,
    metadata::{MethodId, TypeId},
};

/// Comparison used by conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Condition {
    /// `a == b`
    Eq,
    /// `a != b`
    Ne,
    /// `a < b`
    Lt,
    /// `a <= b`
    Le,
    /// `a > b`
    Gt,
    /// `a >= b`
    Ge,
}

impl Condition {
    /// Evaluates the condition on two concrete integers.
    #[must_use]
    pub fn evaluate(self, a: i64, b: i64) -> bool {
        match self {
            Condition::Eq => a == b,
            Condition::Ne => a != b,
            Condition::Lt => a < b,
            Condition::Le => a <= b,
            Condition::Gt => a > b,
            Condition::Ge => a >= b,
        }
    }
}

/// Dispatch kind of a call instruction.
///
/// `Static` and `Special` are direct: the target is known from the instruction alone.
/// `Virtual` and `Interface` are indirect until devirtualization proves a unique target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum InvokeKind {
    /// Static method, no receiver.
    Static,
    /// Direct call on a receiver (constructors, private and devirtualized methods).
    Special,
    /// Virtual dispatch on the receiver's class.
    Virtual,
    /// Dispatch through an interface.
    Interface,
}

impl InvokeKind {
    /// Returns `true` for kinds whose target is fixed by the instruction.
    #[must_use]
    pub fn is_direct(self) -> bool {
        matches!(self, InvokeKind::Static | InvokeKind::Special)
    }

    /// Returns `true` if the call passes a receiver as its first argument.
    #[must_use]
    pub fn has_receiver(self) -> bool {
        !matches!(self, InvokeKind::Static)
    }
}

/// Arithmetic and bitwise operations on two `Int` operands (or one for `Neg`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ArithOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division, may throw on a zero divisor
    Div,
    /// Remainder, may throw on a zero divisor
    Rem,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left
    Shl,
    /// Arithmetic shift right
    Shr,
    /// Negation (unary)
    Neg,
}

impl ArithOp {
    /// Returns `true` for operations that raise an arithmetic exception on a zero divisor.
    #[must_use]
    pub fn can_throw(self) -> bool {
        matches!(self, ArithOp::Div | ArithOp::Rem)
    }

    /// Returns `true` for the single-operand operations.
    #[must_use]
    pub fn is_unary(self) -> bool {
        matches!(self, ArithOp::Neg)
    }
}

/// A single bytecode instruction with its operands.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    /// Does nothing.
    Nop,
    /// Pushes an `Int` constant.
    Const(i64),
    /// Pushes the `null` object reference.
    ConstNull,
    /// Pushes the value of a local slot.
    Load(u16),
    /// Pops a value into a local slot.
    Store(u16),
    /// Discards the top of stack.
    Pop,
    /// Duplicates the top of stack.
    Dup,
    /// Swaps the two topmost stack values.
    Swap,
    /// Arithmetic on `Int` operands.
    Arith(ArithOp),
    /// Pops two `Int`s and branches to `target` if `cond` holds.
    If {
        /// Comparison applied to the operands (deeper operand on the left)
        cond: Condition,
        /// Branch target
        target: Position,
    },
    /// Pops one `Int` and branches to `target` if it compares to zero with `cond`.
    IfZero {
        /// Comparison against zero
        cond: Condition,
        /// Branch target
        target: Position,
    },
    /// Pops an object and branches to `target` if it is `null`.
    IfNull {
        /// Branch target
        target: Position,
    },
    /// Pops an object and branches to `target` if it is not `null`.
    IfNonNull {
        /// Branch target
        target: Position,
    },
    /// Unconditional branch.
    Goto(Position),
    /// Pops an `Int` key and branches to the matching target or to `default`.
    Switch {
        /// Case keys, parallel to `targets`
        keys: Vec<i64>,
        /// Case targets
        targets: Vec<Position>,
        /// Target when no key matches
        default: Position,
    },
    /// Calls a method. Arguments are popped (receiver first), the result pushed.
    Invoke {
        /// Dispatch kind
        kind: InvokeKind,
        /// Referenced method, resolved lazily through the metadata provider
        method: MethodId,
    },
    /// Allocates an instance of a type and pushes the reference.
    New(TypeId),
    /// Checks that the top of stack is an instance of the type.
    CheckCast(TypeId),
    /// Replaces the top of stack with `1` if it is an instance of the type, else `0`.
    InstanceOf(TypeId),
    /// Throws the object on top of the stack.
    Throw,
    /// Returns from a `Void` method.
    Return,
    /// Returns the top of stack.
    ReturnValue,
    /// Acquires the monitor of the object on top of the stack.
    MonitorEnter,
    /// Releases the monitor of the object on top of the stack.
    MonitorExit,
}

impl Opcode {
    /// Returns the lowercase mnemonic of this instruction.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        self.into()
    }

    /// Returns the explicit branch targets of this instruction (without fall-through).
    #[must_use]
    pub fn branch_targets(&self) -> Vec<Position> {
        match self {
            Opcode::If { target, .. }
            | Opcode::IfZero { target, .. }
            | Opcode::IfNull { target }
            | Opcode::IfNonNull { target }
            | Opcode::Goto(target) => vec![*target],
            Opcode::Switch {
                targets, default, ..
            } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Returns `true` if execution may continue at the next instruction.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Opcode::Goto(_)
                | Opcode::Switch { .. }
                | Opcode::Throw
                | Opcode::Return
                | Opcode::ReturnValue
        )
    }

    /// Returns `true` if this instruction ends a basic block.
    #[must_use]
    pub fn is_block_end(&self) -> bool {
        !self.branch_targets().is_empty() || !self.falls_through()
    }

    /// Returns `true` if this instruction can raise an exception that a handler may catch.
    #[must_use]
    pub fn can_throw(&self) -> bool {
        match self {
            Opcode::Invoke { .. } | Opcode::Throw => true,
            Opcode::Arith(op) => op.can_throw(),
            _ => false,
        }
    }

    /// Returns `true` for returns of either kind.
    #[must_use]
    pub fn is_return(&self) -> bool {
        matches!(self, Opcode::Return | Opcode::ReturnValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics() {
        assert_eq!(Opcode::Nop.mnemonic(), "nop");
        assert_eq!(Opcode::ReturnValue.mnemonic(), "return_value");
        assert_eq!(Opcode::Arith(ArithOp::Add).mnemonic(), "arith");
        let op: &'static str = ArithOp::Shl.into();
        assert_eq!(op, "shl");
    }

    #[test]
    fn test_block_ends() {
        let goto = Opcode::Goto(Position::new(3));
        assert!(goto.is_block_end());
        assert!(!goto.falls_through());

        let branch = Opcode::IfZero {
            cond: Condition::Eq,
            target: Position::new(5),
        };
        assert!(branch.is_block_end());
        assert!(branch.falls_through());
        assert_eq!(branch.branch_targets(), vec![Position::new(5)]);

        assert!(!Opcode::Arith(ArithOp::Add).is_block_end());
        assert!(Opcode::Return.is_block_end());
    }

    #[test]
    fn test_switch_targets_include_default() {
        let switch = Opcode::Switch {
            keys: vec![1, 2],
            targets: vec![Position::new(4), Position::new(6)],
            default: Position::new(8),
        };
        assert_eq!(
            switch.branch_targets(),
            vec![Position::new(4), Position::new(6), Position::new(8)]
        );
    }

    #[test]
    fn test_throwing_instructions() {
        assert!(Opcode::Throw.can_throw());
        assert!(Opcode::Arith(ArithOp::Rem).can_throw());
        assert!(!Opcode::Arith(ArithOp::Mul).can_throw());
        assert!(Opcode::Invoke {
            kind: InvokeKind::Virtual,
            method: MethodId::new(1)
        }
        .can_throw());
    }

    #[test]
    fn test_condition_evaluate() {
        assert!(Condition::Lt.evaluate(1, 2));
        assert!(!Condition::Ge.evaluate(1, 2));
        assert!(Condition::Ne.evaluate(0, 2));
    }
}
