//! Compiler error type (§7, "Error handling design").
//!
//! Four kinds, matching the taxonomy: a malformed source construct
//! (`Syntax`), an exhausted nesting/buffer counter (`TooDeep`), an
//! allocator failure (`OutOfMemory` — surfaced here since Rust's
//! allocator reports failures via abort rather than `Result`, this
//! variant exists for the boundary contract and for embedders running
//! under a fallible-allocation harness), and an internal assertion
//! violation (`Internal`). There is no recovery: the parser stops at the
//! first error and returns it with a line number.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A malformed source construct, tagged per spec §4.5's error list
    /// (`tag`) plus a human-readable message and the source line.
    Syntax { tag: SyntaxErrorTag, message: String, line: u32 },
    /// An internal nesting/buffer counter exhausted (too-deep recursion
    /// or an oversized instruction buffer). Never recovered.
    TooDeep { message: String, line: u32 },
    /// Any allocator failure encountered while growing a compiler-owned
    /// buffer.
    OutOfMemory,
    /// An assertion violation. Not expected to fire in a correct build.
    Internal(String),
}

/// Tags a [`CompileError::Syntax`] by which malformed construct was
/// found, per spec §4.5. `AssignOp` is the internal-only backtracking
/// tag and is asserted never to escape the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorTag {
    UnexpectedToken,
    StrayEnd,
    UnterminatedConstruct,
    MissingElseInInlineIf,
    PublicOnLocalName,
    PublicWithMultipleTargets,
    CompoundAssignWithEllipsis,
    DuplicateEllipsisInUnpack,
    OptionalAfterRequired,
    TableLiteralUnnamedFunction,
    StrayBreakContinue,
    /// Internal-only: signals "this looked like an expression but it was
    /// followed by a compound-assign operator", caught locally by the
    /// statement parser and never surfaced to a caller.
    AssignOp,
}

impl CompileError {
    pub fn syntax(tag: SyntaxErrorTag, message: impl Into<String>, line: u32) -> Self {
        CompileError::Syntax { tag, message: message.into(), line }
    }

    pub fn too_deep(message: impl Into<String>, line: u32) -> Self {
        CompileError::TooDeep { message: message.into(), line }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }

    pub fn line(&self) -> Option<u32> {
        match self {
            CompileError::Syntax { line, .. } => Some(*line),
            CompileError::TooDeep { line, .. } => Some(*line),
            CompileError::OutOfMemory | CompileError::Internal(_) => None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Syntax { message, line, .. } => write!(f, "line {line}: {message}"),
            CompileError::TooDeep { message, line } => write!(f, "line {line}: {message}"),
            CompileError::OutOfMemory => write!(f, "out of memory"),
            CompileError::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<fmt::Error> for CompileError {
    fn from(e: fmt::Error) -> Self {
        CompileError::Internal(format!("formatting failure: {e}"))
    }
}

/// Leaf helpers that only ever produce a message (no line number worth
/// threading) return `Result<T, String>`, matching the teacher's
/// `resolver.rs`/`ast.rs` convention, and get converted at the boundary.
impl From<String> for CompileError {
    fn from(s: String) -> Self {
        CompileError::Internal(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_line_number() {
        let e = CompileError::syntax(SyntaxErrorTag::StrayEnd, "unexpected 'end'", 12);
        assert_eq!(e.to_string(), "line 12: unexpected 'end'");
    }

    #[test]
    fn out_of_memory_has_no_line() {
        assert_eq!(CompileError::OutOfMemory.line(), None);
    }
}
