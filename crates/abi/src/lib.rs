//! Internal Application Binary Interface (ABI) of the word machine.
//!
//! Defines the execution contract: the [`Word`] value type, the instruction set
//! table, the flat [`program::Program`] encoding and the [`vm::Machine`] that runs it.
//! Code and data live in separate address spaces: a program is never addressable
//! through load/store.

pub mod error;
pub mod isa;
pub mod program;
pub mod vm;


/// The single value type of the machine. Opcodes, operands, addresses and stack
/// slots are all words.
pub type Word = i64;

/// Largest memory, in words, a machine may be constructed with.
pub const MAX_MEMORY_WORDS: usize = u32::MAX as usize;

pub use error::{ConstructionError, Fault, FaultKind};
pub use isa::{Instruction, InstructionSet, Opcode};
pub use program::Program;
pub use vm::{CancelToken, Machine, RunOptions, Termination};
