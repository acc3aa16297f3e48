use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::FaultKind;
use crate::vm::Machine;
use crate::Word;

/// Behavior of an instruction. Receives the machine with IP already advanced past
/// the instruction and its operands, plus the operand words themselves.
pub type Action = fn(&mut Machine, &[Word]) -> Result<(), FaultKind>;

/// Opcodes of the standard instruction set, numbered densely from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // --- Core Execution ---
    Halt = 0, // Stop execution

    // --- Memory ---
    Load,     // load <addr>: push mem[addr]
    Store,    // store <addr>: pop into mem[addr]
    LoadArg,  // loadarg <k>: push argument k of the active frame
    StoreArg, // storarg <k>: pop into argument k of the active frame

    // --- Arithmetic (pop b, pop a, push a op b) ---
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // --- Bitwise ---
    And,
    Or,
    Xor,
    Not,        // one operand
    ShiftLeft,  // a << b
    ShiftRight, // logical a >> b

    // --- Stack Manipulation ---
    Push, // push <val>
    Pop,  // pop and discard

    // --- Control Flow ---
    JumpIfZero,    // jz <addr>
    JumpIfNotZero, // jnz <addr>
    Call,          // call <addr> <argc>
    Return,

    // --- Output ---
    Print, // print <n>: pop n values onto the output sink
}

impl Opcode {
    pub const ALL: [Opcode; 23] = [
        Opcode::Halt,
        Opcode::Load,
        Opcode::Store,
        Opcode::LoadArg,
        Opcode::StoreArg,
        Opcode::Add,
        Opcode::Subtract,
        Opcode::Multiply,
        Opcode::Divide,
        Opcode::Modulo,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Not,
        Opcode::ShiftLeft,
        Opcode::ShiftRight,
        Opcode::Push,
        Opcode::Pop,
        Opcode::JumpIfZero,
        Opcode::JumpIfNotZero,
        Opcode::Call,
        Opcode::Return,
        Opcode::Print,
    ];

    pub const fn word(self) -> Word {
        self as Word
    }

    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Halt => "halt",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::LoadArg => "loadarg",
            Opcode::StoreArg => "storarg",
            Opcode::Add => "add",
            Opcode::Subtract => "sub",
            Opcode::Multiply => "mul",
            Opcode::Divide => "div",
            Opcode::Modulo => "mod",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Not => "not",
            Opcode::ShiftLeft => "shl",
            Opcode::ShiftRight => "shr",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::JumpIfZero => "jz",
            Opcode::JumpIfNotZero => "jnz",
            Opcode::Call => "call",
            Opcode::Return => "ret",
            Opcode::Print => "print",
        }
    }

    pub const fn arity(self) -> usize {
        match self {
            Opcode::Call => 2,
            Opcode::Load
            | Opcode::Store
            | Opcode::LoadArg
            | Opcode::StoreArg
            | Opcode::Push
            | Opcode::JumpIfZero
            | Opcode::JumpIfNotZero
            | Opcode::Print => 1,
            _ => 0,
        }
    }

    pub const fn halts(self) -> bool {
        matches!(self, Opcode::Halt)
    }

    pub fn action(self) -> Action {
        match self {
            Opcode::Halt => |_, _| Ok(()),
            Opcode::Load => load,
            Opcode::Store => store,
            Opcode::LoadArg => load_arg,
            Opcode::StoreArg => store_arg,
            Opcode::Add => |m, _| binary(m, |a, b| Ok(a.wrapping_add(b))),
            Opcode::Subtract => |m, _| binary(m, |a, b| Ok(a.wrapping_sub(b))),
            Opcode::Multiply => |m, _| binary(m, |a, b| Ok(a.wrapping_mul(b))),
            Opcode::Divide => |m, _| binary(m, divide),
            Opcode::Modulo => |m, _| binary(m, modulo),
            Opcode::And => |m, _| binary(m, |a, b| Ok(a & b)),
            Opcode::Or => |m, _| binary(m, |a, b| Ok(a | b)),
            Opcode::Xor => |m, _| binary(m, |a, b| Ok(a ^ b)),
            Opcode::Not => |m, _| {
                let val = m.pop()?;
                m.push(!val)
            },
            Opcode::ShiftLeft => |m, _| binary(m, shift_left),
            Opcode::ShiftRight => |m, _| binary(m, shift_right),
            Opcode::Push => |m, args| m.push(args[0]),
            Opcode::Pop => |m, _| m.pop().map(drop),
            Opcode::JumpIfZero => |m, args| {
                if m.pop()? == 0 {
                    m.jump(args[0]);
                }
                Ok(())
            },
            Opcode::JumpIfNotZero => |m, args| {
                if m.pop()? != 0 {
                    m.jump(args[0]);
                }
                Ok(())
            },
            Opcode::Call => call,
            Opcode::Return => ret,
            Opcode::Print => print,
        }
    }

    pub fn instruction(self) -> Instruction {
        Instruction {
            action: self.action(),
            name: self.name(),
            arity: self.arity(),
            halts: self.halts(),
        }
    }
}

impl TryFrom<Word> for Opcode {
    type Error = FaultKind;

    fn try_from(word: Word) -> Result<Self, Self::Error> {
        usize::try_from(word)
            .ok()
            .and_then(|index| Opcode::ALL.get(index).copied())
            .ok_or(FaultKind::InvalidOpcode(word))
    }
}

/// One entry of an [`InstructionSet`].
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub action: Action,
    pub name: &'static str,
    pub arity: usize, // operand words after the opcode
    pub halts: bool,
}

/// Dense table from opcode value to [`Instruction`].
///
/// Bound to a machine at construction. Supplying a different table changes what
/// every opcode means without touching the dispatch loop.
#[derive(Debug, Clone)]
pub struct InstructionSet {
    instructions: Vec<Instruction>,
}

impl InstructionSet {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn standard() -> Self {
        Opcode::ALL.iter().map(|op| op.instruction()).collect()
    }

    pub fn get(&self, opcode: Word) -> Option<&Instruction> {
        usize::try_from(opcode)
            .ok()
            .and_then(|index| self.instructions.get(index))
    }

    /// Appends an instruction and returns the opcode assigned to it.
    pub fn push(&mut self, instruction: Instruction) -> Word {
        self.instructions.push(instruction);
        (self.instructions.len() - 1) as Word
    }

    /// Replaces an existing entry, returning the previous one. Opcodes without an
    /// entry are left untouched and yield `None`.
    pub fn replace(&mut self, opcode: Word, instruction: Instruction) -> Option<Instruction> {
        let index = usize::try_from(opcode).ok()?;
        let slot = self.instructions.get_mut(index)?;
        Some(std::mem::replace(slot, instruction))
    }

    /// Looks an opcode up by display name, ignoring ASCII case.
    pub fn opcode_of(&self, name: &str) -> Option<Word> {
        self.instructions
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
            .map(|index| index as Word)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl Default for InstructionSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl FromIterator<Instruction> for InstructionSet {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Opcode words of the standard set, for building programs by hand.
pub mod op {
    use super::Opcode;
    use crate::Word;

    pub const HALT: Word = Opcode::Halt.word();
    pub const LOAD: Word = Opcode::Load.word();
    pub const STORE: Word = Opcode::Store.word();
    pub const LOADARG: Word = Opcode::LoadArg.word();
    pub const STOREARG: Word = Opcode::StoreArg.word();
    pub const ADD: Word = Opcode::Add.word();
    pub const SUB: Word = Opcode::Subtract.word();
    pub const MUL: Word = Opcode::Multiply.word();
    pub const DIV: Word = Opcode::Divide.word();
    pub const MOD: Word = Opcode::Modulo.word();
    pub const AND: Word = Opcode::And.word();
    pub const OR: Word = Opcode::Or.word();
    pub const XOR: Word = Opcode::Xor.word();
    pub const NOT: Word = Opcode::Not.word();
    pub const SHL: Word = Opcode::ShiftLeft.word();
    pub const SHR: Word = Opcode::ShiftRight.word();
    pub const PUSH: Word = Opcode::Push.word();
    pub const POP: Word = Opcode::Pop.word();
    pub const JZ: Word = Opcode::JumpIfZero.word();
    pub const JNZ: Word = Opcode::JumpIfNotZero.word();
    pub const CALL: Word = Opcode::Call.word();
    pub const RET: Word = Opcode::Return.word();
    pub const PRINT: Word = Opcode::Print.word();
}

// --- Behaviors ---

fn load(m: &mut Machine, args: &[Word]) -> Result<(), FaultKind> {
    let val = m.read(args[0])?;
    m.push(val)
}

fn store(m: &mut Machine, args: &[Word]) -> Result<(), FaultKind> {
    let [val] = m.top::<1>()?;
    m.write(args[0], val)?;
    m.discard(1)
}

fn load_arg(m: &mut Machine, args: &[Word]) -> Result<(), FaultKind> {
    let addr = m.argument_address(args[0])?;
    let val = m.memory[addr];
    m.push(val)
}

fn store_arg(m: &mut Machine, args: &[Word]) -> Result<(), FaultKind> {
    let addr = m.argument_address(args[0])?;
    let val = m.pop()?;
    m.memory[addr] = val;
    Ok(())
}

/// Replaces the two topmost words `a b` with `op(a, b)`. Nothing is popped when
/// `op` fails.
fn binary(
    m: &mut Machine,
    op: impl FnOnce(Word, Word) -> Result<Word, FaultKind>,
) -> Result<(), FaultKind> {
    let [lhs, rhs] = m.top::<2>()?;
    let result = op(lhs, rhs)?;
    m.discard(2)?;
    m.push(result)
}

fn divide(a: Word, b: Word) -> Result<Word, FaultKind> {
    if b == 0 {
        return Err(FaultKind::DivisionByZero);
    }
    Ok(a.wrapping_div(b))
}

fn modulo(a: Word, b: Word) -> Result<Word, FaultKind> {
    if b == 0 {
        return Err(FaultKind::DivisionByZero);
    }
    Ok(a.wrapping_rem(b))
}

fn shift_count(count: Word) -> Result<Option<u32>, FaultKind> {
    if count < 0 {
        return Err(FaultKind::InvalidShift(count));
    }
    Ok(u32::try_from(count).ok().filter(|&c| c < Word::BITS))
}

fn shift_left(a: Word, count: Word) -> Result<Word, FaultKind> {
    Ok(shift_count(count)?.map_or(0, |c| a << c))
}

fn shift_right(a: Word, count: Word) -> Result<Word, FaultKind> {
    Ok(shift_count(count)?.map_or(0, |c| ((a as u64) >> c) as Word))
}

fn call(m: &mut Machine, args: &[Word]) -> Result<(), FaultKind> {
    let (target, argc) = (args[0], args[1]);
    let argc_slots = usize::try_from(argc).map_err(|_| FaultKind::CorruptFrame)?;
    if m.sp < argc_slots {
        return Err(FaultKind::StackUnderflow);
    }
    if m.memory.len() - m.sp < 3 {
        return Err(FaultKind::StackOverflow);
    }
    let (fp, ip) = (m.fp as Word, m.ip);
    m.push(argc)?; // argument count, for unwinding
    m.push(fp)?; // caller's frame
    m.push(ip)?; // return address
    m.fp = m.sp;
    m.jump(target);
    Ok(())
}

fn ret(m: &mut Machine, _: &[Word]) -> Result<(), FaultKind> {
    let fp = m.fp;
    if fp < 3 {
        return Err(FaultKind::NoActiveFrame);
    }
    if m.sp <= fp {
        return Err(FaultKind::StackUnderflow);
    }
    let [result] = m.top::<1>()?;
    let return_addr = m.memory[fp - 1];
    let saved_fp = m.memory[fp - 2];
    let argc = usize::try_from(m.memory[fp - 3]).map_err(|_| FaultKind::CorruptFrame)?;
    let base = (fp - 3)
        .checked_sub(argc)
        .ok_or(FaultKind::CorruptFrame)?;
    let saved_fp = usize::try_from(saved_fp)
        .ok()
        .filter(|&saved| saved <= base)
        .ok_or(FaultKind::CorruptFrame)?;

    // The arguments' first slot receives the result.
    m.memory[base] = result;
    m.sp = base + 1;
    m.fp = saved_fp;
    m.jump(return_addr);
    Ok(())
}

fn print(m: &mut Machine, args: &[Word]) -> Result<(), FaultKind> {
    let count = usize::try_from(args[0]).unwrap_or(0);
    if count > m.sp {
        return Err(FaultKind::StackUnderflow);
    }
    let first = m.sp - count;
    for val in m.memory[first..m.sp].iter().rev() {
        write!(m.output, "{}", val)?;
    }
    writeln!(m.output)?;
    m.output.flush()?;
    m.sp = first;
    Ok(())
}
