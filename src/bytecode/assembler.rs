//! Label-based assembler for building [`MethodBody`] values by hand.
//!
//! Branches name their targets with string labels which are resolved when the body is
//! finished, so forward and backward branches are written the same way.
//!
//! # Examples
//!
//! ```rust
//! use bytegraph::bytecode::{Condition, MethodAssembler};
//!
//! // while (i < 10) { i = i + 1 } return i
//! let body = MethodAssembler::new()
//!     .iconst(0)
//!     .store(0)
//!     .label("head")
//!     .load(0)
//!     .iconst(10)
//!     .if_cmp(Condition::Ge, "exit")
//!     .load(0)
//!     .iconst(1)
//!     .add()
//!     .store(0)
//!     .goto("head")
//!     .label("exit")
//!     .load(0)
//!     .ret_value()
//!     .finish()?;
//! assert_eq!(body.max_locals, 1);
//! # Ok::<(), bytegraph::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    bytecode::{ArithOp, Condition, ExceptionHandler, InvokeKind, MethodBody, Opcode, Position},
    metadata::{MethodId, TypeId},
    Error, Result,
};

/// A branch operand waiting for its label to be defined.
#[derive(Debug, Clone)]
enum LabelFixup {
    Single {
        index: usize,
        label: String,
    },
    Switch {
        index: usize,
        labels: Vec<String>,
        default: String,
    },
}

#[derive(Debug, Clone)]
struct PendingHandler {
    start: String,
    end: String,
    handler: String,
    catch_type: Option<TypeId>,
}

/// Fluent builder for method bodies.
#[derive(Debug, Clone, Default)]
pub struct MethodAssembler {
    code: Vec<Opcode>,
    labels: HashMap<String, Position>,
    fixups: Vec<LabelFixup>,
    handlers: Vec<PendingHandler>,
    max_locals: u16,
    duplicate: Option<String>,
}

impl MethodAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves at least `count` local slots (arguments included).
    #[must_use]
    pub fn locals(mut self, count: u16) -> Self {
        self.max_locals = self.max_locals.max(count);
        self
    }

    /// Defines `name` at the position of the next emitted instruction.
    ///
    /// Defining the same label twice is reported by [`MethodAssembler::finish`].
    #[must_use]
    pub fn label(mut self, name: &str) -> Self {
        let position = self.current_position();
        if self.labels.insert(name.to_string(), position).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name.to_string());
        }
        self
    }

    /// Returns the position the next instruction will occupy.
    #[must_use]
    pub fn current_position(&self) -> Position {
        Position::new(u32::try_from(self.code.len()).unwrap_or(u32::MAX))
    }

    /// Appends a raw instruction.
    #[must_use]
    pub fn emit(mut self, opcode: Opcode) -> Self {
        match &opcode {
            Opcode::Load(slot) | Opcode::Store(slot) => {
                self.max_locals = self.max_locals.max(slot.saturating_add(1));
            }
            _ => {}
        }
        self.code.push(opcode);
        self
    }

    fn emit_branch(mut self, opcode: Opcode, label: &str) -> Self {
        self.fixups.push(LabelFixup::Single {
            index: self.code.len(),
            label: label.to_string(),
        });
        self.emit(opcode)
    }

    /// `nop`
    #[must_use]
    pub fn nop(self) -> Self {
        self.emit(Opcode::Nop)
    }

    /// Pushes an integer constant.
    #[must_use]
    pub fn iconst(self, value: i64) -> Self {
        self.emit(Opcode::Const(value))
    }

    /// Pushes `null`.
    #[must_use]
    pub fn null(self) -> Self {
        self.emit(Opcode::ConstNull)
    }

    /// Pushes local `slot`.
    #[must_use]
    pub fn load(self, slot: u16) -> Self {
        self.emit(Opcode::Load(slot))
    }

    /// Pops into local `slot`.
    #[must_use]
    pub fn store(self, slot: u16) -> Self {
        self.emit(Opcode::Store(slot))
    }

    /// `pop`
    #[must_use]
    pub fn pop(self) -> Self {
        self.emit(Opcode::Pop)
    }

    /// `dup`
    #[must_use]
    pub fn dup(self) -> Self {
        self.emit(Opcode::Dup)
    }

    /// `swap`
    #[must_use]
    pub fn swap(self) -> Self {
        self.emit(Opcode::Swap)
    }

    /// Emits an arithmetic instruction.
    #[must_use]
    pub fn arith(self, op: ArithOp) -> Self {
        self.emit(Opcode::Arith(op))
    }

    /// `add`
    #[must_use]
    pub fn add(self) -> Self {
        self.arith(ArithOp::Add)
    }

    /// `sub`
    #[must_use]
    pub fn sub(self) -> Self {
        self.arith(ArithOp::Sub)
    }

    /// `mul`
    #[must_use]
    pub fn mul(self) -> Self {
        self.arith(ArithOp::Mul)
    }

    /// `div`
    #[must_use]
    pub fn div(self) -> Self {
        self.arith(ArithOp::Div)
    }

    /// `rem`
    #[must_use]
    pub fn rem(self) -> Self {
        self.arith(ArithOp::Rem)
    }

    /// Branches to `label` if the two topmost integers satisfy `cond`.
    #[must_use]
    pub fn if_cmp(self, cond: Condition, label: &str) -> Self {
        self.emit_branch(
            Opcode::If {
                cond,
                target: Position::default(),
            },
            label,
        )
    }

    /// Branches to `label` if the top integer compares to zero with `cond`.
    #[must_use]
    pub fn if_zero(self, cond: Condition, label: &str) -> Self {
        self.emit_branch(
            Opcode::IfZero {
                cond,
                target: Position::default(),
            },
            label,
        )
    }

    /// Branches to `label` if the top reference is `null`.
    #[must_use]
    pub fn if_null(self, label: &str) -> Self {
        self.emit_branch(
            Opcode::IfNull {
                target: Position::default(),
            },
            label,
        )
    }

    /// Branches to `label` if the top reference is not `null`.
    #[must_use]
    pub fn if_non_null(self, label: &str) -> Self {
        self.emit_branch(
            Opcode::IfNonNull {
                target: Position::default(),
            },
            label,
        )
    }

    /// Unconditional branch to `label`.
    #[must_use]
    pub fn goto(self, label: &str) -> Self {
        self.emit_branch(Opcode::Goto(Position::default()), label)
    }

    /// Multi-way branch: `cases` pairs a key with its label.
    #[must_use]
    pub fn switch(mut self, cases: &[(i64, &str)], default: &str) -> Self {
        self.fixups.push(LabelFixup::Switch {
            index: self.code.len(),
            labels: cases.iter().map(|(_, l)| (*l).to_string()).collect(),
            default: default.to_string(),
        });
        self.emit(Opcode::Switch {
            keys: cases.iter().map(|(k, _)| *k).collect(),
            targets: vec![Position::default(); cases.len()],
            default: Position::default(),
        })
    }

    /// Calls `method` with the given dispatch kind.
    #[must_use]
    pub fn invoke(self, kind: InvokeKind, method: MethodId) -> Self {
        self.emit(Opcode::Invoke { kind, method })
    }

    /// `invoke static`
    #[must_use]
    pub fn invoke_static(self, method: MethodId) -> Self {
        self.invoke(InvokeKind::Static, method)
    }

    /// `invoke special`
    #[must_use]
    pub fn invoke_special(self, method: MethodId) -> Self {
        self.invoke(InvokeKind::Special, method)
    }

    /// `invoke virtual`
    #[must_use]
    pub fn invoke_virtual(self, method: MethodId) -> Self {
        self.invoke(InvokeKind::Virtual, method)
    }

    /// `invoke interface`
    #[must_use]
    pub fn invoke_interface(self, method: MethodId) -> Self {
        self.invoke(InvokeKind::Interface, method)
    }

    /// Allocates an instance of `ty`.
    #[must_use]
    pub fn new_object(self, ty: TypeId) -> Self {
        self.emit(Opcode::New(ty))
    }

    /// `checkcast`
    #[must_use]
    pub fn checkcast(self, ty: TypeId) -> Self {
        self.emit(Opcode::CheckCast(ty))
    }

    /// `instanceof`
    #[must_use]
    pub fn instance_of(self, ty: TypeId) -> Self {
        self.emit(Opcode::InstanceOf(ty))
    }

    /// `throw`
    #[must_use]
    pub fn throw(self) -> Self {
        self.emit(Opcode::Throw)
    }

    /// Returns from a `Void` method.
    #[must_use]
    pub fn ret(self) -> Self {
        self.emit(Opcode::Return)
    }

    /// Returns the top of stack.
    #[must_use]
    pub fn ret_value(self) -> Self {
        self.emit(Opcode::ReturnValue)
    }

    /// `monitorenter`
    #[must_use]
    pub fn monitor_enter(self) -> Self {
        self.emit(Opcode::MonitorEnter)
    }

    /// `monitorexit`
    #[must_use]
    pub fn monitor_exit(self) -> Self {
        self.emit(Opcode::MonitorExit)
    }

    /// Registers a handler covering `start..end` that continues at `handler`.
    ///
    /// Handlers are tested in the order they are registered.
    #[must_use]
    pub fn try_catch(
        mut self,
        start: &str,
        end: &str,
        handler: &str,
        catch_type: Option<TypeId>,
    ) -> Self {
        self.handlers.push(PendingHandler {
            start: start.to_string(),
            end: end.to_string(),
            handler: handler.to_string(),
            catch_type,
        });
        self
    }

    fn resolve(&self, label: &str) -> Result<Position> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| Error::UndefinedLabel(label.to_string()))
    }

    /// Resolves all labels and returns the finished body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UndefinedLabel`] for a reference to an unknown label, and
    /// [`Error::Malformed`] for duplicate labels or a body that fails
    /// [`MethodBody::validate`].
    pub fn finish(self) -> Result<MethodBody> {
        if let Some(name) = &self.duplicate {
            return Err(malformed_error!("Label '{}' defined more than once", name));
        }

        let mut code = self.code.clone();
        for fixup in &self.fixups {
            match fixup {
                LabelFixup::Single { index, label } => {
                    let resolved = self.resolve(label)?;
                    match &mut code[*index] {
                        Opcode::If { target, .. }
                        | Opcode::IfZero { target, .. }
                        | Opcode::IfNull { target }
                        | Opcode::IfNonNull { target }
                        | Opcode::Goto(target) => *target = resolved,
                        other => {
                            return Err(malformed_error!(
                                "Label fixup on non-branch instruction {:?}",
                                other
                            ))
                        }
                    }
                }
                LabelFixup::Switch {
                    index,
                    labels,
                    default,
                } => {
                    let resolved = labels
                        .iter()
                        .map(|l| self.resolve(l))
                        .collect::<Result<Vec<_>>>()?;
                    let resolved_default = self.resolve(default)?;
                    if let Opcode::Switch {
                        targets, default, ..
                    } = &mut code[*index]
                    {
                        *targets = resolved;
                        *default = resolved_default;
                    }
                }
            }
        }

        let handlers = self
            .handlers
            .iter()
            .map(|h| {
                Ok(ExceptionHandler {
                    start: self.resolve(&h.start)?,
                    end: self.resolve(&h.end)?,
                    handler: self.resolve(&h.handler)?,
                    catch_type: h.catch_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let body = MethodBody {
            code,
            max_locals: self.max_locals,
            handlers,
        };
        body.validate()?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_resolution() -> Result<()> {
        let body = MethodAssembler::new()
            .nop()
            .goto("target")
            .nop()
            .label("target")
            .ret()
            .finish()?;

        assert_eq!(body.code[1], Opcode::Goto(Position::new(3)));
        Ok(())
    }

    #[test]
    fn test_backward_branch() -> Result<()> {
        let body = MethodAssembler::new()
            .label("top")
            .iconst(1)
            .if_zero(Condition::Ne, "top")
            .ret()
            .finish()?;

        assert_eq!(
            body.code[1],
            Opcode::IfZero {
                cond: Condition::Ne,
                target: Position::new(0)
            }
        );
        Ok(())
    }

    #[test]
    fn test_switch_labels() -> Result<()> {
        let body = MethodAssembler::new()
            .iconst(2)
            .switch(&[(1, "one"), (2, "two")], "other")
            .label("one")
            .ret()
            .label("two")
            .ret()
            .label("other")
            .ret()
            .finish()?;

        assert_eq!(
            body.code[1],
            Opcode::Switch {
                keys: vec![1, 2],
                targets: vec![Position::new(2), Position::new(3)],
                default: Position::new(4),
            }
        );
        Ok(())
    }

    #[test]
    fn test_undefined_label() {
        let result = MethodAssembler::new().goto("nowhere").finish();
        assert!(matches!(result, Err(Error::UndefinedLabel(ref l)) if l == "nowhere"));
    }

    #[test]
    fn test_duplicate_label() {
        let result = MethodAssembler::new()
            .label("a")
            .nop()
            .label("a")
            .ret()
            .finish();
        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_handlers_and_locals() -> Result<()> {
        let body = MethodAssembler::new()
            .locals(2)
            .label("try")
            .load(4)
            .pop()
            .label("end")
            .ret()
            .label("catch")
            .pop()
            .ret()
            .try_catch("try", "end", "catch", None)
            .finish()?;

        assert_eq!(body.max_locals, 5);
        assert_eq!(body.handlers.len(), 1);
        assert_eq!(body.handlers[0].end, Position::new(2));
        assert_eq!(body.handlers[0].handler, Position::new(3));
        Ok(())
    }
}
