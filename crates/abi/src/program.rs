use std::fmt;

use serde::{Deserialize, Serialize};

use crate::isa::InstructionSet;
use crate::Word;

/// Flat, immutable sequence of opcode and operand words.
///
/// Programs carry no header: decoding one requires the arities of the instruction
/// set it is meant to run on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program(Vec<Word>);

impl Program {
    pub fn new(words: Vec<Word>) -> Self {
        Self(words)
    }

    pub fn words(&self) -> &[Word] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the program into a listing using `set`'s arities. Words that do not
    /// decode (unknown opcodes, truncated operands) become raw lines.
    pub fn disassemble(&self, set: &InstructionSet) -> Listing {
        let words = self.words();
        let mut lines = Vec::new();
        let mut offset = 0;
        while offset < words.len() {
            let decoded = set.get(words[offset]).and_then(|instr| {
                let end = (offset + 1).checked_add(instr.arity)?;
                words.get(offset + 1..end).map(|operands| (instr.name, operands))
            });
            match decoded {
                Some((name, operands)) => {
                    lines.push(Line {
                        offset,
                        kind: LineKind::Instruction {
                            name,
                            operands: operands.to_vec(),
                        },
                    });
                    offset += 1 + operands.len();
                }
                None if set.get(words[offset]).is_some() => {
                    // Known opcode whose operands run past the end.
                    lines.push(Line {
                        offset,
                        kind: LineKind::Raw(words[offset..].to_vec()),
                    });
                    offset = words.len();
                }
                None => {
                    lines.push(Line {
                        offset,
                        kind: LineKind::Raw(vec![words[offset]]),
                    });
                    offset += 1;
                }
            }
        }
        Listing { lines }
    }
}

impl From<Vec<Word>> for Program {
    fn from(words: Vec<Word>) -> Self {
        Self(words)
    }
}

impl FromIterator<Word> for Program {
    fn from_iter<T: IntoIterator<Item = Word>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl AsRef<[Word]> for Program {
    fn as_ref(&self) -> &[Word] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Instruction {
        name: &'static str,
        operands: Vec<Word>,
    },
    Raw(Vec<Word>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub offset: usize,
    pub kind: LineKind,
}

/// Disassembled program, one line per instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub lines: Vec<Line>,
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            write!(f, "{:>5}: ", line.offset)?;
            let (head, words) = match &line.kind {
                LineKind::Instruction { name, operands } => (*name, operands),
                LineKind::Raw(words) => (".word", words),
            };
            write!(f, "{}", head)?;
            for word in words {
                write!(f, " {}", word)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
