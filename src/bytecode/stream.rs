//! Cursor over the instructions of a method body.

use crate::bytecode::{MethodBody, Opcode, Position};

/// The instruction-stream reader used while parsing one basic block.
///
/// The stream never decodes bytes; it walks the already-tokenized [`Opcode`] vector and
/// exposes the current instruction, its position and the position of its successor.
#[derive(Debug, Clone)]
pub struct BytecodeStream<'a> {
    body: &'a MethodBody,
    position: Position,
}

impl<'a> BytecodeStream<'a> {
    /// Creates a stream positioned at the first instruction.
    #[must_use]
    pub fn new(body: &'a MethodBody) -> Self {
        Self {
            body,
            position: Position::new(0),
        }
    }

    /// Returns the position of the current instruction.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Moves the cursor to `position`.
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// Returns the current instruction, or `None` past the end of the body.
    #[must_use]
    pub fn current_opcode(&self) -> Option<&'a Opcode> {
        self.body.opcode(self.position)
    }

    /// Returns the position of the instruction after the current one.
    #[must_use]
    pub fn next_position(&self) -> Position {
        self.position.next()
    }

    /// Advances to the next instruction.
    pub fn advance(&mut self) {
        self.position = self.position.next();
    }

    /// Returns `true` while the cursor points at an instruction.
    #[must_use]
    pub fn has_current(&self) -> bool {
        self.position.index() < self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_walk() {
        let body = MethodBody::new(vec![Opcode::Const(1), Opcode::Pop, Opcode::Return], 0);
        let mut stream = BytecodeStream::new(&body);

        assert_eq!(stream.current_opcode(), Some(&Opcode::Const(1)));
        assert_eq!(stream.next_position(), Position::new(1));
        stream.advance();
        assert_eq!(stream.current_opcode(), Some(&Opcode::Pop));
        stream.set_position(Position::new(2));
        assert_eq!(stream.current_opcode(), Some(&Opcode::Return));
        stream.advance();
        assert!(!stream.has_current());
        assert!(stream.current_opcode().is_none());
    }
}
