//! Method bodies: instruction vectors, positions and exception handler tables.

use std::fmt;

use crate::{bytecode::Opcode, metadata::TypeId, Result};

/// A program point: the index of an instruction within one method body.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position(u32);

impl Position {
    /// Creates a position from a raw instruction index.
    #[must_use]
    #[inline]
    pub const fn new(index: u32) -> Self {
        Position(index)
    }

    /// Returns the raw instruction index.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the position of the following instruction.
    #[must_use]
    #[inline]
    pub const fn next(self) -> Self {
        Position(self.0 + 1)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position({})", self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A try/catch region.
///
/// Instructions in `start..end` are covered; a caught exception continues at `handler`
/// with the exception as the only stack value. `catch_type == None` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionHandler {
    /// First covered instruction
    pub start: Position,
    /// First instruction after the covered range
    pub end: Position,
    /// Entry of the handler code
    pub handler: Position,
    /// Filter type, or `None` for a catch-all
    pub catch_type: Option<TypeId>,
}

impl ExceptionHandler {
    /// Returns `true` if the handler covers `position`.
    #[must_use]
    pub fn covers(&self, position: Position) -> bool {
        self.start <= position && position < self.end
    }

    /// Returns `true` if the handler catches every exception.
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.catch_type.is_none()
    }
}

/// The code of one method: its instructions, local count and handler table.
///
/// Handlers are kept in declaration order, which is also the order in which they are
/// tested when an exception is dispatched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    /// Instructions, indexed by [`Position`]
    pub code: Vec<Opcode>,
    /// Number of local slots (including argument slots)
    pub max_locals: u16,
    /// Exception handlers in declaration order
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Creates a body without exception handlers.
    #[must_use]
    pub fn new(code: Vec<Opcode>, max_locals: u16) -> Self {
        Self {
            code,
            max_locals,
            handlers: Vec::new(),
        }
    }

    /// Returns the number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns `true` if the body has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Returns the instruction at `position`.
    #[must_use]
    pub fn opcode(&self, position: Position) -> Option<&Opcode> {
        self.code.get(position.index())
    }

    /// Returns the handlers covering `position`, in declaration order.
    ///
    /// The list stops after the first catch-all since later handlers can never be reached.
    #[must_use]
    pub fn handlers_at(&self, position: Position) -> Vec<usize> {
        let mut covering = Vec::new();
        for (idx, handler) in self.handlers.iter().enumerate() {
            if handler.covers(position) {
                covering.push(idx);
                if handler.is_catch_all() {
                    break;
                }
            }
        }
        covering
    }

    /// Checks the structural sanity of the body.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the body is empty, a branch or handler points
    /// outside the code, a local index exceeds `max_locals`, a switch has mismatched key and
    /// target lists, or the last instruction can fall off the end of the code.
    pub fn validate(&self) -> Result<()> {
        if self.code.is_empty() {
            return Err(malformed_error!("Method body has no instructions"));
        }

        let len = self.code.len();
        for (idx, opcode) in self.code.iter().enumerate() {
            for target in opcode.branch_targets() {
                if target.index() >= len {
                    return Err(malformed_error!(
                        "Instruction @{} branches to {} outside of the body ({} instructions)",
                        idx,
                        target,
                        len
                    ));
                }
            }
            match opcode {
                Opcode::Load(slot) | Opcode::Store(slot) if *slot >= self.max_locals => {
                    return Err(malformed_error!(
                        "Instruction @{} accesses local {} but max_locals is {}",
                        idx,
                        slot,
                        self.max_locals
                    ));
                }
                Opcode::Switch { keys, targets, .. } if keys.len() != targets.len() => {
                    return Err(malformed_error!(
                        "Switch @{} has {} keys but {} targets",
                        idx,
                        keys.len(),
                        targets.len()
                    ));
                }
                _ => {}
            }
        }

        if self.code[len - 1].falls_through() {
            return Err(malformed_error!("Execution can fall off the end of the body"));
        }

        for handler in &self.handlers {
            if handler.start >= handler.end
                || handler.end.index() > len
                || handler.handler.index() >= len
            {
                return Err(malformed_error!(
                    "Exception handler {:?} has an invalid range",
                    handler
                ));
            }
        }

        Ok(())
    }
}
