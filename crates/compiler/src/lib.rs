//! Quill compiler: tokenized source in, P-code `Program` out.
//!
//! The pipeline mirrors the teacher's `seqc::compile_file_with_config`
//! shape (parse, then a sequence of whole-program passes, then emit) but
//! has four stages instead of one monolithic codegen pass, matching
//! spec.md §2's pipeline diagram: parse (builds Q-code directly, no
//! separate AST), resolve bindings, optimize, lower to P-code.

pub mod binding;
pub mod builder;
pub mod config;
pub mod disasm;
pub mod error;
pub mod lexfmt;
pub mod lowerer;
pub mod optimizer;
pub mod parser;
pub mod scope;

pub use config::CompilerConfig;
pub use error::{CompileError, SyntaxErrorTag};

use quillc_core::program::Program;
use quillc_core::token::LexOut;

/// Compile a lexed token stream into a P-code program, using default
/// configuration.
pub fn compile(lex: &LexOut) -> Result<Program, CompileError> {
    compile_with_config(lex, CompilerConfig::default())
}

/// Compile a lexed token stream into a P-code program with custom
/// configuration (§4.5's `extend_mode`, the too-deep nesting budget, and
/// the optimizer's dead-code fixed-point cap).
pub fn compile_with_config(lex: &LexOut, config: CompilerConfig) -> Result<Program, CompileError> {
    let mut qcode = parser::parse(lex, config.clone())?;
    optimizer::optimize(&mut qcode, config.dce_max_iterations);
    Ok(lowerer::lower(&qcode))
}
