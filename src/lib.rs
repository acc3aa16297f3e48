//! Word machine toolchain: a line assembler for the flat program encoding and the
//! conformance scenarios, exported to the WASM shell through [`init_shell`].

use wasm_bindgen::prelude::*;

pub mod asm;
pub mod suite;

pub use abi;
pub use asm::{assemble, AsmError, Assembler};

pub const SYSTEM_STATUS: &str = r#"
================================================================================
WORDVM // EMBEDDABLE STACK MACHINE
================================================================================
[ ARCHITECTURE ]
Flat word memory + swappable instruction table + frame-pointer calling convention.

CONFORMANCE SUITE:
"#;

#[wasm_bindgen]
pub fn init_shell() -> String {
    let mut out = String::from(SYSTEM_STATUS);
    out.push_str(&suite::run_suite());
    out
}
