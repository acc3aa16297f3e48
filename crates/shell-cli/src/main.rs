use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use abi::{InstructionSet, Machine, Program, RunOptions, Termination, Word};
use clap::Parser;
use thiserror::Error;
use tracing::{info, Level};
use wordvm::{assemble, AsmError};

/// Runs a word machine program.
#[derive(Parser)]
#[command(name = "shell-cli", version)]
struct Args {
    /// Program file: a `.json` word array, or assembly source
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Offset of the first instruction
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    start: Word,

    /// Memory size in words
    #[arg(short, long, default_value_t = 1 << 16)]
    memory: usize,

    /// Trace every instruction to stderr
    #[arg(short, long)]
    trace: bool,

    /// Stop after this many instructions
    #[arg(short, long, value_name = "N")]
    fuel: Option<u64>,

    /// Print the disassembly instead of running
    #[arg(short, long)]
    disassemble: bool,

    /// Log run start and termination
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Error)]
enum LoadError {
    #[error("{}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{}: {source}", path.display())]
    Asm { path: PathBuf, source: AsmError },
}

fn load(path: &Path) -> Result<Program, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_owned(),
        source,
    })?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text).map_err(|source| LoadError::Json {
            path: path.to_owned(),
            source,
        })
    } else {
        assemble(&text).map_err(|source| LoadError::Asm {
            path: path.to_owned(),
            source,
        })
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .init();

    let program = match load(&args.file) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("shell-cli: {}", e);
            return ExitCode::from(2);
        }
    };
    info!(words = program.len(), file = %args.file.display(), "program loaded");

    if args.disassemble {
        print!("{}", program.disassemble(&InstructionSet::standard()));
        return ExitCode::SUCCESS;
    }

    let mut vm = match Machine::new(args.memory) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("shell-cli: {}", e);
            return ExitCode::from(2);
        }
    };
    let options = RunOptions {
        trace: args.trace,
        fuel: args.fuel,
        cancel: None,
    };
    match vm.run_with(&program, args.start, &options) {
        Termination::Halted => ExitCode::SUCCESS,
        other => {
            eprintln!("shell-cli: {}", other);
            ExitCode::from(1)
        }
    }
}
