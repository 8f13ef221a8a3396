//! Quill compiler core: the data model shared by every stage of the
//! compilation pipeline.
//!
//! This crate has no parsing or optimization logic of its own — it is the
//! vocabulary the parser, builder, binding resolver, optimizer, and P-code
//! lowerer (all in the `quillc` crate) speak to each other:
//!
//! - [`codec`]: the VLQ-size / VLQ-int / CLQ integer encodings used
//!   throughout the on-disk and in-memory formats.
//! - [`token`]: the shape of the token stream produced by the (external)
//!   lexer, consumed by the parser.
//! - [`operand`] / [`instr`] / [`qfunction`]: the three-address Q-code
//!   intermediate representation.
//! - [`program`]: the final P-code opcode enumeration and the `Program`
//!   value handed to the VM loader.

pub mod codec;
pub mod instr;
pub mod operand;
pub mod program;
pub mod qfunction;
pub mod token;

pub use instr::{QInstr, QOpcode};
pub use operand::QOperand;
pub use program::{POpcode, Program};
pub use qfunction::{QCode, QFunction, QFunctionFlags};
pub use token::{LexOut, Token, TokenStream, TokenTag};
