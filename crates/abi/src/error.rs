use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Word;

/// Errors returned while building a [`crate::vm::Machine`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("memory size {requested} exceeds the maximum of {max} words")]
    MemoryTooLarge { requested: usize, max: usize },
    #[error("could not allocate {0} words of memory")]
    Allocation(usize),
}

/// Why an instruction could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FaultKind {
    /// The instruction pointer left the program.
    #[error("instruction pointer out of bounds")]
    ProgramBounds,
    /// The program ended before all operands of the current opcode.
    #[error("program ended inside the operands of an instruction")]
    OperandBounds,
    /// No entry in the bound instruction set for this opcode.
    #[error("invalid opcode {0}")]
    InvalidOpcode(Word),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    /// Load, store or argument access outside memory.
    #[error("memory address {0} out of bounds")]
    MemoryBounds(Word),
    /// Argument access or return with no call in progress.
    #[error("no active call frame")]
    NoActiveFrame,
    /// Saved frame bookkeeping does not describe a valid frame.
    #[error("corrupt call frame")]
    CorruptFrame,
    #[error("argument {index} out of range for a frame of {count} arguments")]
    ArgumentIndex { index: Word, count: Word },
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid shift count {0}")]
    InvalidShift(Word),
    /// The output or diagnostic sink failed.
    #[error("output error: {0}")]
    Output(String),
}

/// A fault together with the offset of the instruction that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} at ip {ip}")]
pub struct Fault {
    pub kind: FaultKind,
    pub ip: Word,
}

impl From<std::io::Error> for FaultKind {
    fn from(err: std::io::Error) -> Self {
        FaultKind::Output(err.to_string())
    }
}
