//! Line assembler for the flat program encoding.
//!
//! One statement per line: any number of `label:` definitions followed by an
//! optional instruction (`mnemonic operand...`) or a `.word` directive emitting raw
//! words. Operands are integers or label references. `;` and `#` start comments.
//! Mnemonics are resolved against the instruction set the program is meant for.

use std::collections::HashMap;

use abi::{InstructionSet, Program, Word};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("line {line}: unknown instruction {name}")]
    UnknownMnemonic { line: usize, name: String },
    #[error("line {line}: {name} takes {expected} operand(s), got {found}")]
    ArityMismatch {
        line: usize,
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: invalid operand {operand}")]
    InvalidOperand { line: usize, operand: String },
    #[error("line {line}: invalid label {label}")]
    InvalidLabel { line: usize, label: String },
    #[error("line {line}: duplicate label {label}")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: undefined label {label}")]
    UndefinedLabel { line: usize, label: String },
}

const WORD_DIRECTIVE: &str = ".word";

struct Statement<'s> {
    line: usize,
    labels: Vec<&'s str>,
    mnemonic: Option<&'s str>,
    operands: Vec<&'s str>,
}

pub struct Assembler<'a> {
    set: &'a InstructionSet,
}

impl<'a> Assembler<'a> {
    pub fn new(set: &'a InstructionSet) -> Self {
        Self { set }
    }

    pub fn assemble(&self, source: &str) -> Result<Program, AsmError> {
        let statements = parse(source)?;

        // Pass 1: label addresses.
        let mut labels: HashMap<&str, Word> = HashMap::new();
        let mut addr: usize = 0;
        for stmt in &statements {
            for &label in &stmt.labels {
                if labels.insert(label, addr as Word).is_some() {
                    return Err(AsmError::DuplicateLabel {
                        line: stmt.line,
                        label: label.to_string(),
                    });
                }
            }
            addr += self.width(stmt)?;
        }

        // Pass 2: encoding.
        let mut words = Vec::with_capacity(addr);
        for stmt in &statements {
            let Some(mnemonic) = stmt.mnemonic else {
                continue;
            };
            if !mnemonic.eq_ignore_ascii_case(WORD_DIRECTIVE) {
                words.push(self.opcode(stmt.line, mnemonic)?);
            }
            for &operand in &stmt.operands {
                words.push(resolve(stmt.line, operand, &labels)?);
            }
        }

        debug!(words = words.len(), labels = labels.len(), "assembled program");
        Ok(Program::from(words))
    }

    /// Number of words a statement encodes to. Checks operand counts.
    fn width(&self, stmt: &Statement<'_>) -> Result<usize, AsmError> {
        let Some(mnemonic) = stmt.mnemonic else {
            return Ok(0);
        };
        if mnemonic.eq_ignore_ascii_case(WORD_DIRECTIVE) {
            return Ok(stmt.operands.len());
        }
        let opcode = self.opcode(stmt.line, mnemonic)?;
        let arity = self.set.get(opcode).map_or(0, |i| i.arity);
        if stmt.operands.len() != arity {
            return Err(AsmError::ArityMismatch {
                line: stmt.line,
                name: mnemonic.to_string(),
                expected: arity,
                found: stmt.operands.len(),
            });
        }
        Ok(1 + arity)
    }

    fn opcode(&self, line: usize, mnemonic: &str) -> Result<Word, AsmError> {
        self.set
            .opcode_of(mnemonic)
            .ok_or_else(|| AsmError::UnknownMnemonic {
                line,
                name: mnemonic.to_string(),
            })
    }
}

/// Assembles `source` for the standard instruction set.
pub fn assemble(source: &str) -> Result<Program, AsmError> {
    Assembler::new(&InstructionSet::standard()).assemble(source)
}

fn parse(source: &str) -> Result<Vec<Statement<'_>>, AsmError> {
    let mut statements = Vec::new();
    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let code = raw.split([';', '#']).next().unwrap_or_default();
        let mut tokens = code
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .peekable();

        let mut labels = Vec::new();
        while let Some(label) = tokens.next_if(|t| t.ends_with(':')) {
            let label = label.trim_end_matches(':');
            if !is_identifier(label) {
                return Err(AsmError::InvalidLabel {
                    line,
                    label: label.to_string(),
                });
            }
            labels.push(label);
        }
        let mnemonic = tokens.next();
        let operands: Vec<&str> = tokens.collect();
        if labels.is_empty() && mnemonic.is_none() {
            continue;
        }
        statements.push(Statement {
            line,
            labels,
            mnemonic,
            operands,
        });
    }
    Ok(statements)
}

fn resolve(line: usize, operand: &str, labels: &HashMap<&str, Word>) -> Result<Word, AsmError> {
    if let Ok(val) = operand.parse::<Word>() {
        return Ok(val);
    }
    if !is_identifier(operand) {
        return Err(AsmError::InvalidOperand {
            line,
            operand: operand.to_string(),
        });
    }
    labels
        .get(operand)
        .copied()
        .ok_or_else(|| AsmError::UndefinedLabel {
            line,
            label: operand.to_string(),
        })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
