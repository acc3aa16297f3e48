use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConstructionError, Fault, FaultKind};
use crate::isa::{Instruction, InstructionSet};
use crate::program::Program;
use crate::{Word, MAX_MEMORY_WORDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Halted,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// A halting instruction executed.
    Halted,
    /// The run's [`CancelToken`] fired before the instruction at `ip`.
    Cancelled { ip: Word },
    /// The fuel budget ran out before the instruction at `ip`.
    FuelExhausted { ip: Word },
    Fault(Fault),
}

impl Termination {
    pub fn is_halted(&self) -> bool {
        matches!(self, Termination::Halted)
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Termination::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Halted => write!(f, "halted"),
            Termination::Cancelled { ip } => write!(f, "cancelled at ip {}", ip),
            Termination::FuelExhausted { ip } => write!(f, "out of fuel at ip {}", ip),
            Termination::Fault(fault) => write!(f, "fault: {}", fault),
        }
    }
}

/// Cooperative cancellation flag, checked once per dispatched instruction.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Write one trace line per instruction to the diagnostic sink.
    pub trace: bool,
    /// Maximum number of instructions to dispatch.
    pub fuel: Option<u64>,
    #[serde(skip)]
    pub cancel: Option<CancelToken>,
}

impl RunOptions {
    pub fn traced() -> Self {
        Self {
            trace: true,
            ..Self::default()
        }
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// A stack machine over one flat word memory.
///
/// The operand stack grows upward from address 0; `sp` is the first free slot and
/// `fp` the base of the active call frame (0 at top level). `ip` indexes the
/// program being run, never memory.
pub struct Machine {
    pub(crate) memory: Vec<Word>,
    pub(crate) sp: usize,
    pub(crate) fp: usize,
    pub(crate) ip: Word,
    instructions: Arc<InstructionSet>,
    pub(crate) input: Box<dyn Read + Send>,
    pub(crate) output: Box<dyn Write + Send>,
    diagnostics: Box<dyn Write + Send>,
}

impl Machine {
    /// Builds a machine with `size` words of zeroed memory and the standard
    /// instruction set, attached to the process' standard streams.
    pub fn new(size: usize) -> Result<Self, ConstructionError> {
        Self::with_instructions(size, Arc::new(InstructionSet::standard()))
    }

    pub fn with_instructions(
        size: usize,
        instructions: Arc<InstructionSet>,
    ) -> Result<Self, ConstructionError> {
        if size > MAX_MEMORY_WORDS {
            return Err(ConstructionError::MemoryTooLarge {
                requested: size,
                max: MAX_MEMORY_WORDS,
            });
        }
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| ConstructionError::Allocation(size))?;
        memory.resize(size, 0);

        Ok(Self {
            memory,
            sp: 0,
            fp: 0,
            ip: 0,
            instructions,
            input: Box::new(io::stdin()),
            output: Box::new(io::stdout()),
            diagnostics: Box::new(io::stderr()),
        })
    }

    pub fn set_input(&mut self, input: impl Read + Send + 'static) {
        self.input = Box::new(input);
    }

    pub fn set_output(&mut self, output: impl Write + Send + 'static) {
        self.output = Box::new(output);
    }

    pub fn set_diagnostics(&mut self, diagnostics: impl Write + Send + 'static) {
        self.diagnostics = Box::new(diagnostics);
    }

    pub fn set_instructions(&mut self, instructions: Arc<InstructionSet>) {
        self.instructions = instructions;
    }

    pub fn instructions(&self) -> &Arc<InstructionSet> {
        &self.instructions
    }

    pub fn run(&mut self, program: &Program, start: Word) -> Termination {
        self.run_with(program, start, &RunOptions::default())
    }

    /// Runs `program` from `start` until it halts, faults, is cancelled or runs out
    /// of fuel. Registers are reset first; memory keeps its contents.
    pub fn run_with(&mut self, program: &Program, start: Word, options: &RunOptions) -> Termination {
        self.rewind(start);
        debug!(start, words = program.len(), memory = self.memory.len(), "run started");

        let mut dispatched: u64 = 0;
        let termination = loop {
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                break Termination::Cancelled { ip: self.ip };
            }
            if options.fuel.is_some_and(|fuel| dispatched >= fuel) {
                break Termination::FuelExhausted { ip: self.ip };
            }
            match self.step(program, options.trace) {
                Ok(Status::Running) => dispatched += 1,
                Ok(Status::Halted) => break Termination::Halted,
                Err(fault) => break Termination::Fault(fault),
            }
        };

        match &termination {
            Termination::Fault(fault) => warn!(%fault, dispatched, "run faulted"),
            other => debug!(termination = %other, dispatched, "run finished"),
        }
        termination
    }

    pub fn rewind(&mut self, start: Word) {
        self.ip = start;
        self.sp = 0;
        self.fp = 0;
    }

    // The heartbeat: one fetch/decode/execute. A fault leaves ip on the faulting instruction.
    pub fn step(&mut self, program: &Program, trace: bool) -> Result<Status, Fault> {
        let at = self.ip;
        let fault = |kind| Fault { kind, ip: at };
        let words = program.words();

        let offset = usize::try_from(at)
            .ok()
            .filter(|&offset| offset < words.len())
            .ok_or_else(|| fault(FaultKind::ProgramBounds))?;
        let opcode = words[offset];
        let instructions = Arc::clone(&self.instructions);
        let instruction = instructions
            .get(opcode)
            .ok_or_else(|| fault(FaultKind::InvalidOpcode(opcode)))?;
        // Arity comes from a caller-supplied table and may be arbitrarily large.
        let operands = (offset + 1)
            .checked_add(instruction.arity)
            .and_then(|end| words.get(offset + 1..end))
            .ok_or_else(|| fault(FaultKind::OperandBounds))?;
        let next = offset + 1 + operands.len();

        if trace {
            self.trace(offset, instruction, operands).map_err(fault)?;
        }

        self.ip = next as Word;
        if let Err(kind) = (instruction.action)(self, operands) {
            self.ip = at;
            return Err(fault(kind));
        }
        Ok(if instruction.halts {
            Status::Halted
        } else {
            Status::Running
        })
    }

    fn trace(
        &mut self,
        offset: usize,
        instruction: &Instruction,
        operands: &[Word],
    ) -> Result<(), FaultKind> {
        writeln!(
            self.diagnostics,
            "{}:\t{} {:?}\tstack:\t{:?}",
            offset,
            instruction.name,
            operands,
            &self.memory[..self.sp]
        )?;
        Ok(())
    }

    // --- Stack ---

    pub fn push(&mut self, val: Word) -> Result<(), FaultKind> {
        let slot = self
            .memory
            .get_mut(self.sp)
            .ok_or(FaultKind::StackOverflow)?;
        *slot = val;
        self.sp += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Word, FaultKind> {
        let sp = self.sp.checked_sub(1).ok_or(FaultKind::StackUnderflow)?;
        self.sp = sp;
        Ok(self.memory[sp])
    }

    /// The topmost `N` words in push order, without popping them.
    pub fn top<const N: usize>(&self) -> Result<[Word; N], FaultKind> {
        let first = self.sp.checked_sub(N).ok_or(FaultKind::StackUnderflow)?;
        let mut out = [0; N];
        out.copy_from_slice(&self.memory[first..self.sp]);
        Ok(out)
    }

    pub fn discard(&mut self, n: usize) -> Result<(), FaultKind> {
        self.sp = self.sp.checked_sub(n).ok_or(FaultKind::StackUnderflow)?;
        Ok(())
    }

    pub fn stack(&self) -> &[Word] {
        &self.memory[..self.sp]
    }

    // --- Memory ---

    pub fn address(&self, addr: Word) -> Result<usize, FaultKind> {
        usize::try_from(addr)
            .ok()
            .filter(|&index| index < self.memory.len())
            .ok_or(FaultKind::MemoryBounds(addr))
    }

    pub fn read(&self, addr: Word) -> Result<Word, FaultKind> {
        Ok(self.memory[self.address(addr)?])
    }

    pub fn write(&mut self, addr: Word, val: Word) -> Result<(), FaultKind> {
        let index = self.address(addr)?;
        self.memory[index] = val;
        Ok(())
    }

    /// Address of argument `index` in the active frame.
    pub fn argument_address(&self, index: Word) -> Result<usize, FaultKind> {
        let count_slot = self.fp.checked_sub(3).ok_or(FaultKind::NoActiveFrame)?;
        let count = self.memory[count_slot];
        let first = usize::try_from(count)
            .ok()
            .and_then(|argc| count_slot.checked_sub(argc))
            .ok_or(FaultKind::CorruptFrame)?;
        if !(0..count).contains(&index) {
            return Err(FaultKind::ArgumentIndex { index, count });
        }
        Ok(first + index as usize)
    }

    pub fn memory(&self) -> &[Word] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [Word] {
        &mut self.memory
    }

    /// Zeroes memory and registers.
    pub fn reset_memory(&mut self) {
        self.memory.fill(0);
        self.rewind(0);
    }

    // --- Registers ---

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn ip(&self) -> Word {
        self.ip
    }

    /// Sets the instruction pointer. Targets outside the program fault on the next
    /// fetch.
    pub fn jump(&mut self, addr: Word) {
        self.ip = addr;
    }

    pub fn input(&mut self) -> &mut dyn Read {
        &mut *self.input
    }

    pub fn output(&mut self) -> &mut dyn Write {
        &mut *self.output
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("memory", &self.memory.len())
            .field("sp", &self.sp)
            .field("fp", &self.fp)
            .field("ip", &self.ip)
            .field("instructions", &self.instructions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::op::*;
    use crate::isa::Opcode;
    use streams::SharedBuffer;

    fn machine() -> (Machine, SharedBuffer) {
        let out = SharedBuffer::new();
        let mut vm = Machine::new(1 << 10).unwrap();
        vm.set_output(out.clone());
        vm.set_diagnostics(io::sink());
        (vm, out)
    }

    fn run(words: Vec<Word>, start: Word) -> (Machine, Termination, String) {
        let (mut vm, out) = machine();
        let termination = vm.run(&Program::from(words), start);
        (vm, termination, out.contents_lossy())
    }

    fn fault_of(termination: &Termination) -> &FaultKind {
        &termination.fault().expect("expected a fault").kind
    }

    #[test]
    fn construction_bounds() {
        assert!(Machine::new(0).is_ok());
        assert_eq!(
            Machine::new(MAX_MEMORY_WORDS + 1).unwrap_err(),
            ConstructionError::MemoryTooLarge {
                requested: MAX_MEMORY_WORDS + 1,
                max: MAX_MEMORY_WORDS,
            }
        );
        let vm = Machine::new(16).unwrap();
        assert_eq!(vm.memory(), &[0; 16]);
        assert_eq!((vm.sp(), vm.fp(), vm.ip()), (0, 0, 0));
    }

    #[test]
    fn halt_smoke() {
        let (_, termination, out) = run(vec![HALT], 0);
        assert_eq!(termination, Termination::Halted);
        assert!(out.is_empty());
    }

    #[test]
    fn push_writes_memory() {
        let (vm, _, _) = run(vec![PUSH, 10, HALT], 0);
        assert_eq!(vm.memory()[0], 10);
        assert_eq!(vm.stack(), &[10]);
    }

    #[test]
    fn add_and_subtract() {
        let (_, termination, out) = run(vec![PUSH, 10, PUSH, 20, ADD, PRINT, 1, HALT], 0);
        assert!(termination.is_halted());
        assert_eq!(out, "30\n");

        let (_, _, out) = run(vec![PUSH, 10, PUSH, 20, SUB, PRINT, 1, HALT], 0);
        assert_eq!(out, "-10\n");
    }

    #[test]
    fn pop_discards_top() {
        let (_, _, out) = run(vec![PUSH, 10, PUSH, 20, POP, PRINT, 1, HALT], 0);
        assert_eq!(out, "10\n");
    }

    #[test]
    fn print_pops_in_reverse_push_order() {
        let (vm, _, out) = run(vec![PUSH, 1, PUSH, 2, PUSH, 3, PRINT, 2, HALT], 0);
        assert_eq!(out, "32\n");
        assert_eq!(vm.stack(), &[1]);

        let (_, _, out) = run(vec![PRINT, 0, HALT], 0);
        assert_eq!(out, "\n");
    }

    #[test]
    fn bitwise_and_shifts() {
        let (_, _, out) = run(
            vec![
                PUSH, 12, PUSH, 10, AND, PRINT, 1, //
                PUSH, 12, PUSH, 10, OR, PRINT, 1, //
                PUSH, 12, PUSH, 10, XOR, PRINT, 1, //
                PUSH, 0, NOT, PRINT, 1, //
                PUSH, 3, PUSH, 2, SHL, PRINT, 1, //
                PUSH, -8, PUSH, 62, SHR, PRINT, 1, //
                HALT,
            ],
            0,
        );
        assert_eq!(out, "8\n14\n6\n-1\n12\n3\n");
    }

    #[test]
    fn division_and_modulo() {
        let (_, _, out) = run(
            vec![
                PUSH, -7, PUSH, 2, DIV, PRINT, 1, PUSH, -7, PUSH, 2, MOD, PRINT, 1, HALT,
            ],
            0,
        );
        assert_eq!(out, "-3\n-1\n");
    }

    #[test]
    fn store_and_load() {
        let (vm, _, _) = run(vec![PUSH, 10, STORE, 100, HALT], 0);
        assert_eq!(vm.memory()[100], 10);

        let (mut vm, out) = machine();
        vm.memory_mut()[100] = 10;
        vm.run(&Program::from(vec![LOAD, 100, PRINT, 1, HALT]), 0);
        assert_eq!(out.contents_lossy(), "10\n");
    }

    #[test]
    fn memory_persists_between_runs() {
        let (mut vm, out) = machine();
        vm.run(&Program::from(vec![PUSH, 42, STORE, 7, PUSH, 1, HALT]), 0);
        assert_eq!(vm.sp(), 1);
        vm.run(&Program::from(vec![LOAD, 7, PRINT, 1, HALT]), 0);
        assert_eq!(out.contents_lossy(), "42\n");
        assert_eq!(vm.sp(), 0);

        vm.reset_memory();
        assert!(vm.memory().iter().all(|&w| w == 0));
    }

    #[test]
    fn jump_if_not_zero() {
        let taken = vec![PUSH, 10, JNZ, 9, PUSH, 10, PRINT, 1, HALT, PUSH, 20, PRINT, 1, HALT];
        let (_, _, out) = run(taken, 0);
        assert_eq!(out, "20\n");

        let fallthrough = vec![PUSH, 0, JNZ, 9, PUSH, 10, PRINT, 1, HALT, PUSH, 20, PRINT, 1, HALT];
        let (_, _, out) = run(fallthrough, 0);
        assert_eq!(out, "10\n");
    }

    #[test]
    fn jump_if_zero_from_offset() {
        let taken = vec![PUSH, 10, PRINT, 1, HALT, PUSH, 0, JZ, 0, PUSH, 20, PRINT, 1, HALT];
        let (_, _, out) = run(taken, 5);
        assert_eq!(out, "10\n");

        let fallthrough = vec![PUSH, 10, PRINT, 1, HALT, PUSH, 10, JZ, 0, PUSH, 20, PRINT, 1, HALT];
        let (_, _, out) = run(fallthrough, 5);
        assert_eq!(out, "20\n");
    }

    #[test]
    fn call_without_arguments() {
        let f = 6;
        let (vm, _, out) = run(vec![CALL, f, 0, PRINT, 1, HALT, PUSH, 2, PUSH, 2, ADD, RET], 0);
        assert_eq!(out, "4\n");
        assert_eq!((vm.sp(), vm.fp()), (0, 0));
    }

    #[test]
    fn load_arg_one_and_two_parameters() {
        let f = 8;
        let (_, _, out) = run(
            vec![PUSH, 2, CALL, f, 1, PRINT, 1, HALT, LOADARG, 0, PUSH, 3, ADD, RET],
            0,
        );
        assert_eq!(out, "5\n");

        let f = 10;
        let (_, _, out) = run(
            vec![
                PUSH, 2, PUSH, 3, CALL, f, 2, PRINT, 1, HALT, LOADARG, 0, LOADARG, 1, ADD, RET,
            ],
            0,
        );
        assert_eq!(out, "5\n");
    }

    #[test]
    fn store_arg_overwrites_argument() {
        let f = 8;
        let (_, _, out) = run(
            vec![PUSH, 2, CALL, f, 1, PRINT, 1, HALT, PUSH, 3, STOREARG, 0, LOADARG, 0, RET],
            0,
        );
        assert_eq!(out, "3\n");
    }

    #[test]
    fn call_lays_out_frame() {
        let f = 7;
        let program = Program::from(vec![PUSH, 4, PUSH, 5, CALL, f, 2, HALT]);
        let (mut vm, _) = machine();
        vm.rewind(0);
        for _ in 0..3 {
            vm.step(&program, false).unwrap();
        }
        assert_eq!(vm.fp(), 5);
        assert_eq!(vm.ip(), f);
        // args, argc, saved fp, return address
        assert_eq!(vm.stack(), &[4, 5, 2, 0, 7]);
    }

    #[test]
    fn recursive_factorial() {
        let (fact, recur) = (8, 15);
        let (_, termination, out) = run(
            vec![
                PUSH, 5, CALL, fact, 1, PRINT, 1, HALT, //
                LOADARG, 0, JNZ, recur, PUSH, 1, RET, //
                LOADARG, 0, LOADARG, 0, PUSH, 1, SUB, CALL, fact, 1, MUL, RET,
            ],
            0,
        );
        assert!(termination.is_halted());
        assert_eq!(out, "120\n");
    }

    #[test]
    fn tail_recursive_factorial() {
        let (fact, recur) = (10, 17);
        let (n, acc) = (0, 1);
        let (_, _, out) = run(
            vec![
                PUSH, 5, PUSH, 1, CALL, fact, 2, PRINT, 1, HALT, //
                LOADARG, n, JNZ, recur, LOADARG, acc, RET, //
                LOADARG, n, LOADARG, acc, MUL, STOREARG, acc, //
                LOADARG, n, PUSH, 1, SUB, STOREARG, n, PUSH, 0, JZ, fact,
            ],
            0,
        );
        assert_eq!(out, "120\n");
    }

    #[test]
    fn recursive_fibonacci() {
        let (fib, eq_one, recur) = (8, 15, 25);
        let (_, _, out) = run(
            vec![
                PUSH, 5, CALL, fib, 1, PRINT, 1, HALT, //
                LOADARG, 0, JNZ, eq_one, PUSH, 0, RET, //
                LOADARG, 0, PUSH, 1, SUB, JNZ, recur, PUSH, 1, RET, //
                LOADARG, 0, PUSH, 1, SUB, CALL, fib, 1, //
                LOADARG, 0, PUSH, 2, SUB, CALL, fib, 1, //
                ADD, RET,
            ],
            0,
        );
        assert_eq!(out, "5\n");
    }

    #[test]
    fn ip_past_end_is_program_bounds() {
        let (_, termination, out) = run(vec![PUSH, 1, PRINT, 1], 0);
        assert_eq!(out, "1\n");
        assert_eq!(
            termination,
            Termination::Fault(Fault {
                kind: FaultKind::ProgramBounds,
                ip: 4
            })
        );

        let (_, termination, _) = run(vec![HALT], -1);
        assert_eq!(fault_of(&termination), &FaultKind::ProgramBounds);
    }

    #[test]
    fn truncated_operands() {
        let (vm, termination, _) = run(vec![PUSH, 1, CALL, 0], 0);
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::OperandBounds,
                ip: 2
            })
        );
        assert_eq!(vm.stack(), &[1]);
    }

    #[test]
    fn unknown_opcode() {
        let (_, termination, _) = run(vec![PUSH, 1, 99], 0);
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::InvalidOpcode(99),
                ip: 2
            })
        );
    }

    #[test]
    fn stack_underflow_and_overflow() {
        let (_, termination, _) = run(vec![POP, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::StackUnderflow);

        let (_, termination, _) = run(vec![PUSH, 1, ADD, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::StackUnderflow);

        let mut vm = Machine::new(2).unwrap();
        let termination = vm.run(&Program::from(vec![PUSH, 1, PUSH, 2, PUSH, 3, HALT]), 0);
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::StackOverflow,
                ip: 4
            })
        );
        assert_eq!(vm.stack(), &[1, 2]);
        assert_eq!(vm.ip(), 4);
    }

    #[test]
    fn division_by_zero_leaves_operands() {
        let (vm, termination, _) = run(vec![PUSH, 1, PUSH, 0, DIV, HALT], 0);
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::DivisionByZero,
                ip: 4
            })
        );
        assert_eq!(vm.stack(), &[1, 0]);

        let (_, termination, _) = run(vec![PUSH, 1, PUSH, 0, MOD, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::DivisionByZero);
    }

    #[test]
    fn memory_bounds() {
        let (_, termination, _) = run(vec![LOAD, 1 << 10, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::MemoryBounds(1 << 10));

        let (vm, termination, _) = run(vec![PUSH, 5, STORE, -1, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::MemoryBounds(-1));
        assert_eq!(vm.stack(), &[5]);
    }

    #[test]
    fn frame_faults() {
        let (_, termination, _) = run(vec![LOADARG, 0, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::NoActiveFrame);

        let (_, termination, _) = run(vec![PUSH, 1, RET], 0);
        assert_eq!(fault_of(&termination), &FaultKind::NoActiveFrame);

        let (_, termination, _) = run(vec![PUSH, 1, CALL, 6, 1, HALT, LOADARG, 1, RET], 0);
        assert_eq!(
            fault_of(&termination),
            &FaultKind::ArgumentIndex { index: 1, count: 1 }
        );

        let (_, termination, _) = run(vec![CALL, 3, 2, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::StackUnderflow);

        let (_, termination, _) = run(vec![CALL, 4, -1, HALT], 0);
        assert_eq!(fault_of(&termination), &FaultKind::CorruptFrame);

        // Returning with nothing above the frame base.
        let (_, termination, _) = run(vec![CALL, 4, 0, HALT, RET], 0);
        assert_eq!(fault_of(&termination), &FaultKind::StackUnderflow);
    }

    #[test]
    fn clobbered_frame_is_corrupt() {
        // call with no arguments: argc at 0, saved fp at 1, return address at 2.
        let f = 4;

        // Saved frame pointer overwritten with an address above the frame.
        let (vm, termination, _) = run(
            vec![CALL, f, 0, HALT, PUSH, 1000, STORE, 1, PUSH, 0, RET],
            0,
        );
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::CorruptFrame,
                ip: 10
            })
        );
        assert_eq!((vm.fp(), vm.ip()), (3, 10));
        assert_eq!(vm.stack(), &[0, 1000, 3, 0]);

        // Argument count reaching below the bottom of memory.
        let (_, termination, _) = run(vec![CALL, f, 0, HALT, PUSH, 999, STORE, 0, LOADARG, 0], 0);
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::CorruptFrame,
                ip: 8
            })
        );

        // Negative argument count.
        let (vm, termination, _) = run(
            vec![CALL, f, 0, HALT, PUSH, -4, STORE, 0, PUSH, 0, RET],
            0,
        );
        assert_eq!(
            termination.fault(),
            Some(&Fault {
                kind: FaultKind::CorruptFrame,
                ip: 10
            })
        );
        assert_eq!(vm.fp(), 3);

        let (_, termination, _) = run(vec![CALL, f, 0, HALT, PUSH, -4, STORE, 0, LOADARG, 0], 0);
        assert_eq!(fault_of(&termination), &FaultKind::CorruptFrame);
    }

    #[test]
    fn oversized_arity_is_operand_bounds() {
        let mut set = InstructionSet::standard();
        let wide = set.push(Instruction {
            arity: usize::MAX,
            ..Opcode::Pop.instruction()
        });
        let mut vm = Machine::with_instructions(16, Arc::new(set)).unwrap();
        let termination = vm.run(&Program::from(vec![wide, HALT]), 0);
        assert_eq!(
            termination,
            Termination::Fault(Fault {
                kind: FaultKind::OperandBounds,
                ip: 0
            })
        );
        assert_eq!(vm.ip(), 0);
    }

    #[test]
    fn output_errors_fault() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut vm = Machine::new(8).unwrap();
        vm.set_output(Broken);
        let termination = vm.run(&Program::from(vec![PUSH, 1, PRINT, 1, HALT]), 0);
        assert!(matches!(fault_of(&termination), FaultKind::Output(_)));
        assert_eq!(vm.stack(), &[1]);
    }

    #[test]
    fn trace_lines_go_to_diagnostics() {
        let (mut vm, _) = machine();
        let diag = SharedBuffer::new();
        vm.set_diagnostics(diag.clone());
        vm.run_with(
            &Program::from(vec![PUSH, 10, PUSH, 20, ADD, HALT]),
            0,
            &RunOptions::traced(),
        );
        let lines: Vec<String> = diag.contents_lossy().lines().map(str::to_owned).collect();
        assert_eq!(
            lines,
            vec![
                "0:\tpush [10]\tstack:\t[]",
                "2:\tpush [20]\tstack:\t[10]",
                "4:\tadd []\tstack:\t[10, 20]",
                "5:\thalt []\tstack:\t[30]",
            ]
        );
    }

    #[test]
    fn untraced_runs_write_nothing_to_diagnostics() {
        let (mut vm, _) = machine();
        let diag = SharedBuffer::new();
        vm.set_diagnostics(diag.clone());
        vm.run(&Program::from(vec![PUSH, 1, HALT]), 0);
        assert!(diag.contents().is_empty());
    }

    #[test]
    fn fuel_bounds_infinite_loops() {
        let (mut vm, _) = machine();
        let spin = Program::from(vec![PUSH, 0, JZ, 0]);
        let termination = vm.run_with(&spin, 0, &RunOptions::default().with_fuel(101));
        assert_eq!(termination, Termination::FuelExhausted { ip: 2 });
    }

    #[test]
    fn cancelled_before_first_instruction() {
        let (mut vm, _) = machine();
        let cancel = CancelToken::new();
        cancel.cancel();
        let termination = vm.run_with(
            &Program::from(vec![PUSH, 0, JZ, 0]),
            0,
            &RunOptions::default().with_cancel(cancel),
        );
        assert_eq!(termination, Termination::Cancelled { ip: 0 });
    }

    #[test]
    fn cancel_from_another_thread() {
        let cancel = CancelToken::new();
        let options = RunOptions::default().with_cancel(cancel.clone());
        let worker = std::thread::spawn(move || {
            let mut vm = Machine::new(16).unwrap();
            vm.run_with(&Program::from(vec![PUSH, 0, JZ, 0]), 0, &options)
        });
        cancel.cancel();
        let termination = worker.join().unwrap();
        assert!(matches!(termination, Termination::Cancelled { .. }));
    }

    #[test]
    fn substituted_instruction_set() {
        fn shout(m: &mut Machine, _: &[Word]) -> Result<(), FaultKind> {
            writeln!(m.output(), "opcode zero")?;
            Ok(())
        }
        let mut set = InstructionSet::standard();
        set.replace(
            HALT,
            Instruction {
                action: shout,
                name: "shout",
                arity: 0,
                halts: false,
            },
        );
        let stop = set.push(Opcode::Halt.instruction());

        let out = SharedBuffer::new();
        let mut vm = Machine::with_instructions(16, Arc::new(set)).unwrap();
        vm.set_output(out.clone());
        let termination = vm.run(&Program::from(vec![0, 0, stop]), 0);
        assert!(termination.is_halted());
        assert_eq!(out.contents_lossy(), "opcode zero\nopcode zero\n");
    }

    #[test]
    fn custom_instruction_reads_input() {
        fn read_byte(m: &mut Machine, _: &[Word]) -> Result<(), FaultKind> {
            let mut byte = [0u8; 1];
            let read = m.input().read(&mut byte)?;
            m.push(if read == 0 { -1 } else { byte[0] as Word })
        }
        let mut set = InstructionSet::standard();
        let scan = set.push(Instruction {
            action: read_byte,
            name: "scan",
            arity: 0,
            halts: false,
        });

        let out = SharedBuffer::new();
        let mut vm = Machine::with_instructions(16, Arc::new(set)).unwrap();
        vm.set_input(io::Cursor::new(b"A".to_vec()));
        vm.set_output(out.clone());
        vm.run(&Program::from(vec![scan, scan, PRINT, 2, HALT]), 0);
        assert_eq!(out.contents_lossy(), "-165\n");
    }

    #[test]
    fn machines_share_one_table() {
        let set = Arc::new(InstructionSet::standard());
        let a = Machine::with_instructions(4, Arc::clone(&set)).unwrap();
        let b = Machine::with_instructions(4, Arc::clone(&set)).unwrap();
        assert!(Arc::ptr_eq(a.instructions(), b.instructions()));
    }
}
