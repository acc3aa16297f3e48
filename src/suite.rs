//! Conformance scenarios: small programs with known output, run end to end.

use std::io;

use abi::{Machine, Termination};
use serde::Serialize;
use streams::SharedBuffer;
use thiserror::Error;

use crate::asm::{assemble, AsmError};

/// Memory given to every scenario machine, in words.
pub const SCENARIO_MEMORY: usize = 1 << 10;

pub struct Scenario {
    pub name: &'static str,
    pub source: &'static str,
    pub expected: &'static str,
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Asm(#[from] AsmError),
    #[error(transparent)]
    Construction(#[from] abi::ConstructionError),
    #[error("terminated abnormally: {0}")]
    Terminated(Termination),
    #[error("expected {expected:?}, got {actual:?}")]
    Output { expected: String, actual: String },
}

impl Scenario {
    /// Assembles and runs the scenario, returning its output on success.
    pub fn run(&self) -> Result<String, ScenarioError> {
        let program = assemble(self.source)?;
        let out = SharedBuffer::new();
        let mut vm = Machine::new(SCENARIO_MEMORY)?;
        vm.set_output(out.clone());
        vm.set_diagnostics(io::sink());

        let termination = vm.run(&program, 0);
        if !termination.is_halted() {
            return Err(ScenarioError::Terminated(termination));
        }
        let actual = out.contents_lossy();
        if actual != self.expected {
            return Err(ScenarioError::Output {
                expected: self.expected.to_string(),
                actual,
            });
        }
        Ok(actual)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub name: &'static str,
    pub passed: bool,
    pub detail: Option<String>,
}

pub fn run_all() -> Vec<Outcome> {
    SCENARIOS
        .iter()
        .map(|s| match s.run() {
            Ok(_) => Outcome {
                name: s.name,
                passed: true,
                detail: None,
            },
            Err(e) => Outcome {
                name: s.name,
                passed: false,
                detail: Some(e.to_string()),
            },
        })
        .collect()
}

pub fn report(outcomes: &[Outcome]) -> String {
    let mut out = String::new();
    for o in outcomes {
        out.push_str(&format!("TEST: {:<30} ... ", o.name));
        match &o.detail {
            None => out.push_str("PASS\n"),
            Some(detail) => out.push_str(&format!("FAIL ({})\n", detail)),
        }
    }
    out
}

pub fn run_suite() -> String {
    report(&run_all())
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "ARITH_ADD",
        source: "push 10\npush 20\nadd\nprint 1\nhalt\n",
        expected: "30\n",
    },
    Scenario {
        name: "ARITH_SUB_ORDER",
        source: "push 10\npush 20\nsub\nprint 1\nhalt\n",
        expected: "-10\n",
    },
    Scenario {
        name: "CALL_TWO_ARGS",
        source: "
                push 2
                push 3
                call sum 2
                print 1
                halt
        sum:    loadarg 0
                loadarg 1
                add
                ret
        ",
        expected: "5\n",
    },
    Scenario {
        name: "FACTORIAL_RECURSIVE",
        source: "
                push 5
                call fact 1
                print 1
                halt
        fact:   loadarg 0
                jnz recur
                push 1
                ret
        recur:  loadarg 0
                loadarg 0
                push 1
                sub
                call fact 1
                mul
                ret
        ",
        expected: "120\n",
    },
    Scenario {
        name: "FACTORIAL_TAIL",
        source: "
                push 5          ; n
                push 1          ; acc
                call fact 2
                print 1
                halt
        fact:   loadarg 0
                jnz recur
                loadarg 1
                ret
        recur:  loadarg 0
                loadarg 1
                mul
                storarg 1
                loadarg 0
                push 1
                sub
                storarg 0
                push 0
                jz fact
        ",
        expected: "120\n",
    },
    Scenario {
        name: "FIBONACCI_RECURSIVE",
        source: "
                push 5
                call fib 1
                print 1
                halt
        fib:    loadarg 0       ; fib(0) = 0
                jnz one
                push 0
                ret
        one:    loadarg 0       ; fib(1) = 1
                push 1
                sub
                jnz recur
                push 1
                ret
        recur:  loadarg 0
                push 1
                sub
                call fib 1
                loadarg 0
                push 2
                sub
                call fib 1
                add
                ret
        ",
        expected: "5\n",
    },
    Scenario {
        name: "FIBONACCI_TAIL",
        source: "
                push 0          ; a
                push 1          ; b
                push 5          ; n
                call fib 3
                print 1
                halt
        fib:    loadarg 2
                jnz recur
                loadarg 0
                ret
        recur:  loadarg 2
                push 1
                sub
                loadarg 0
                loadarg 1
                add
                loadarg 1
                storarg 0
                storarg 1
                storarg 2
                push 0
                jz fib
        ",
        expected: "5\n",
    },
    Scenario {
        name: "ACKERMANN_PHI",
        source: "
                push 3          ; a
                push 3          ; b
                push 2          ; n
                call phi 3
                print 1
                halt
        phi:    loadarg 2       ; n = 0: a + b
                jnz case2
                loadarg 0
                loadarg 1
                add
                ret
        case2:  loadarg 1       ; b = 0, n = 1: 0
                jnz recur
                loadarg 2
                push 1
                sub
                jnz case3
                push 0
                ret
        case3:  loadarg 2       ; b = 0, n = 2: 1
                push 2
                sub
                jnz case4
                push 1
                ret
        case4:  loadarg 0       ; b = 0, n > 2: a
                ret
        recur:  loadarg 0       ; phi(a, phi(a, b - 1, n), n - 1)
                loadarg 0
                loadarg 1
                push 1
                sub
                loadarg 2
                call phi 3
                loadarg 2
                push 1
                sub
                call phi 3
                ret
        ",
        expected: "27\n",
    },
];
