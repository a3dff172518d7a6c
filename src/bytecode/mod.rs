//! Bytecode input model: instructions, method bodies and the stream reader.
//!
//! The builder consumes an already tokenized instruction vector. Each [`Opcode`] carries
//! its operands inline, [`MethodBody`] adds the local count and the exception handler
//! table, and [`BytecodeStream`] is the cursor the graph builder walks while parsing a
//! block. [`MethodAssembler`] builds bodies from labelled instructions.

mod assembler;
mod body;
mod opcodes;
mod stream;

pub use assembler::MethodAssembler;
pub use body::{ExceptionHandler, MethodBody, Position};
pub use opcodes::{ArithOp, Condition, InvokeKind, Opcode};
pub use stream::BytecodeStream;
