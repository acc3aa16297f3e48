use std::io;
use std::sync::Arc;

use abi::isa::op::*;
use abi::{Fault, FaultKind, Instruction, InstructionSet, Machine, Program, Termination};
use colored::*;
use streams::SharedBuffer;
use wordvm::suite::SCENARIOS;

const MANIFESTO: &str = r#"
================================================================================
WORDVM // LIVING SPECIFICATION
================================================================================

[ CONTRACT ]
- One word type for opcodes, operands, addresses and stack slots.
- Code and data in disjoint address spaces.
- Call pushes (argc, fp, return ip); return unwinds exactly that frame.
- Every runtime fault ends the run with a typed termination, never a panic.

================================================================================
UNIT TEST SUITE
================================================================================
"#;

fn main() {
    println!("{}", MANIFESTO);
    let mut passed = 0;
    let mut failed = 0;

    for scenario in SCENARIOS {
        run_test(scenario.name, || scenario.run().map(drop).map_err(|e| e.to_string()), &mut passed, &mut failed);
    }
    run_test("FAULT_PROGRAM_BOUNDS", test_program_bounds, &mut passed, &mut failed);
    run_test("FAULT_DIVISION_BY_ZERO", test_division_by_zero, &mut passed, &mut failed);
    run_test("FAULT_STACK_OVERFLOW", test_stack_overflow, &mut passed, &mut failed);
    run_test("ISA_SUBSTITUTION", test_isa_substitution, &mut passed, &mut failed);

    println!("\n--------------------------------------------------------------------------------");
    println!("{} passed, {} failed", passed, failed);
    if failed == 0 {
        println!("{}", "ALL SYSTEMS NOMINAL.".green().bold());
    } else {
        std::process::exit(1);
    }
}

// --- TEST INFRASTRUCTURE ---

fn run_test<F>(name: &str, test_fn: F, passed: &mut i32, failed: &mut i32)
where F: Fn() -> Result<(), String> {
    print!("TEST: {:<30} ... ", name);
    match test_fn() {
        Ok(_) => { println!("{}", "PASS".green()); *passed += 1; }
        Err(e) => { println!("{}", "FAIL".red()); println!("  -> {}", e); *failed += 1; }
    }
}

fn run_words(vm: &mut Machine, words: Vec<i64>) -> Termination {
    vm.set_diagnostics(io::sink());
    vm.run(&Program::from(words), 0)
}

fn expect_fault(termination: Termination, kind: FaultKind, ip: i64) -> Result<(), String> {
    let expected = Termination::Fault(Fault { kind, ip });
    if termination != expected {
        return Err(format!("expected {}, got {}", expected, termination));
    }
    Ok(())
}

fn test_program_bounds() -> Result<(), String> {
    let mut vm = Machine::new(16).map_err(|e| e.to_string())?;
    vm.set_output(io::sink());
    expect_fault(run_words(&mut vm, vec![PUSH, 1, JNZ, 40]), FaultKind::ProgramBounds, 40)
}

fn test_division_by_zero() -> Result<(), String> {
    let mut vm = Machine::new(16).map_err(|e| e.to_string())?;
    let termination = run_words(&mut vm, vec![PUSH, 9, PUSH, 0, MOD, HALT]);
    expect_fault(termination, FaultKind::DivisionByZero, 4)?;
    if vm.stack() != [9, 0] {
        return Err(format!("operands consumed: {:?}", vm.stack()));
    }
    Ok(())
}

fn test_stack_overflow() -> Result<(), String> {
    // Unbounded recursion: f calls itself with no base case.
    let mut vm = Machine::new(64).map_err(|e| e.to_string())?;
    let termination = run_words(&mut vm, vec![CALL, 3, 0, CALL, 3, 0]);
    match termination.fault() {
        Some(Fault { kind: FaultKind::StackOverflow, .. }) => Ok(()),
        _ => Err(format!("expected stack overflow, got {}", termination)),
    }
}

fn test_isa_substitution() -> Result<(), String> {
    let mut set = InstructionSet::standard();
    set.replace(HALT, Instruction { name: "nop", halts: false, ..set.get(HALT).copied().ok_or("no halt")? });
    let stop = set.push(abi::Opcode::Halt.instruction());

    let out = SharedBuffer::new();
    let mut vm = Machine::with_instructions(16, Arc::new(set)).map_err(|e| e.to_string())?;
    vm.set_output(out.clone());
    let termination = run_words(&mut vm, vec![HALT, PUSH, 7, PRINT, 1, stop]);
    if !termination.is_halted() || out.contents_lossy() != "7\n" {
        return Err(format!("opcode 0 still halts: {} / {:?}", termination, out.contents_lossy()));
    }
    Ok(())
}
