use abi::{Machine, Program, RunOptions, Termination, Word};
use serde::Serialize;
use streams::SharedBuffer;
use wasm_bindgen::prelude::*;

// `init_shell` (the conformance report) is exported by the `wordvm` dependency.

/// Memory given to programs started from `run_source`, in words.
const DEFAULT_MEMORY: usize = 1 << 16;

/// Instruction budget for every run started from the page.
const FUEL: u64 = 10_000_000;

/// What a browser-side run produced, serialized to JSON for the page.
#[derive(Debug, Serialize)]
struct RunReport {
    output: String,
    trace: String,
    termination: Option<Termination>,
    error: Option<String>,
}

impl RunReport {
    fn failed(error: impl ToString) -> Self {
        Self {
            output: String::new(),
            trace: String::new(),
            termination: None,
            error: Some(error.to_string()),
        }
    }
}

fn execute(program: &Program, start: Word, memory: usize, trace: bool) -> RunReport {
    let mut vm = match Machine::new(memory) {
        Ok(vm) => vm,
        Err(e) => return RunReport::failed(e),
    };
    let (out, diag) = (SharedBuffer::new(), SharedBuffer::new());
    vm.set_input(std::io::empty());
    vm.set_output(out.clone());
    vm.set_diagnostics(diag.clone());

    let options = RunOptions {
        trace,
        ..RunOptions::default().with_fuel(FUEL)
    };
    let termination = vm.run_with(program, start, &options);
    RunReport {
        output: out.contents_lossy(),
        trace: diag.contents_lossy(),
        termination: Some(termination),
        error: None,
    }
}

fn to_json(report: &RunReport) -> String {
    serde_json::to_string(report).unwrap_or_else(|e| error_json(&e.to_string()))
}

fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// Runs raw program words and returns a JSON report.
#[wasm_bindgen]
pub fn run_words(words: Vec<i64>, start: i64, memory: usize, trace: bool) -> String {
    to_json(&execute(&Program::from(words), start, memory, trace))
}

/// Assembles and runs `source` from offset 0, returning a JSON report.
#[wasm_bindgen]
pub fn run_source(source: &str, trace: bool) -> String {
    let report = match wordvm::assemble(source) {
        Ok(program) => execute(&program, 0, DEFAULT_MEMORY, trace),
        Err(e) => RunReport::failed(e),
    };
    to_json(&report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::isa::op::*;

    #[test]
    fn words_run_and_report_output() {
        let json = run_words(vec![PUSH, 10, PUSH, 20, ADD, PRINT, 1, HALT], 0, 64, false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["output"], "30\n");
        assert_eq!(value["termination"], "Halted");
        assert_eq!(value["trace"], "");
    }

    #[test]
    fn faults_are_reported() {
        let report = execute(&Program::from(vec![PUSH, 1, PUSH, 0, DIV]), 0, 64, true);
        let fault = report.termination.as_ref().and_then(Termination::fault).unwrap();
        assert_eq!(fault.ip, 4);
        assert_eq!(report.trace.lines().count(), 3);
    }

    #[test]
    fn infinite_loops_run_out_of_fuel() {
        let report = execute(&Program::from(vec![PUSH, 0, JZ, 0]), 0, 64, false);
        assert!(matches!(
            report.termination,
            Some(Termination::FuelExhausted { .. })
        ));
    }

    #[test]
    fn source_errors_are_reported() {
        let json = run_source("bogus", false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"], "line 1: unknown instruction bogus");
        assert!(value["termination"].is_null());
    }

    #[test]
    fn error_fallback_escapes_message() {
        let json = error_json(r#"key "k" \ bad"#);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"], r#"key "k" \ bad"#);
    }

    #[test]
    fn oversized_memory_is_reported() {
        let report = execute(&Program::default(), 0, usize::MAX, false);
        assert!(report.error.is_some());
    }
}
