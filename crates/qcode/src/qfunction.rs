//! Q-function and Q-code: the per-function and whole-program containers
//! for the Q-code IR (spec §3, "Q-function" / "Q-code").

use crate::instr::QInstr;
use crate::operand::QOperand;

/// Sentinel `name` value meaning "this function has no name" (top-level
/// script body, or an anonymous lambda).
pub const FUNC_NONAME: u32 = u32::MAX;

/// Sentinel `parent` value meaning "this function has no parent" (only
/// `functions[0]`, the top-level script body, uses this).
pub const FUNC_NOPARENT: u32 = u32::MAX;

/// Per-function flags. Kept as an explicit bitset (rather than a `bool`
/// per flag) because the lowerer serializes it verbatim into the function
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QFunctionFlags(u8);

impl QFunctionFlags {
    /// Function accepts a trailing `...` catch-all parameter.
    pub const VARARGS: QFunctionFlags = QFunctionFlags(0b0000_0001);
    /// Function body is the single-expression form (`function() = expr`)
    /// rather than a block.
    pub const EXPR_BODY: QFunctionFlags = QFunctionFlags(0b0000_0010);

    pub const fn empty() -> Self {
        QFunctionFlags(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for QFunctionFlags {
    type Output = QFunctionFlags;
    fn bitor(self, rhs: Self) -> Self {
        QFunctionFlags(self.0 | rhs.0)
    }
}

/// A single Q-level function (or the top-level script body, `functions[0]`).
#[derive(Debug, Clone)]
pub struct QFunction {
    /// Starting source line.
    pub line: u32,
    pub temp_count: u32,
    pub local_count: u32,
    pub exhale_count: u32,
    pub inhale_count: u32,
    /// Number of leading locals that are declared arguments, in
    /// declaration order. Invariant: `arg_count <= local_count`.
    pub arg_count: u32,
    /// Number of trailing arguments that are optional (have a default
    /// value supplied by the caller via `FMAKE`).
    pub optional_arg_count: u32,
    pub flags: QFunctionFlags,
    /// Identifier-pool offset of the function's name, or
    /// [`FUNC_NONAME`].
    pub name: u32,
    /// Index of the enclosing function in the program's function table,
    /// or [`FUNC_NOPARENT`] for the top-level script body.
    pub parent_index: u32,
    pub instructions: Vec<QInstr>,
    /// `inhale_source_operands[i]` identifies, in the parent's operand
    /// space, the value that fills this function's inhale slot `i`:
    /// either `QOperand::Exhale(_)` (a parent local promoted to exhale)
    /// or `QOperand::Inhale(_)` (a parent inhale forwarded further out).
    pub inhale_source_operands: Vec<QOperand>,
    /// Per-function label table: `labels[i]` is the instruction index
    /// the label currently resolves to, filled in by `SETLABEL` during
    /// building and finalized (instruction index, then byte offset) by
    /// later passes.
    pub labels: Vec<u32>,
}

impl QFunction {
    pub fn new(line: u32, parent_index: u32) -> Self {
        QFunction {
            line,
            temp_count: 1, // temp 0 is always reserved
            local_count: 0,
            exhale_count: 0,
            inhale_count: 0,
            arg_count: 0,
            optional_arg_count: 0,
            flags: QFunctionFlags::empty(),
            name: FUNC_NONAME,
            parent_index,
            instructions: Vec::new(),
            inhale_source_operands: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Allocate a fresh label, returning its index. The label does not
    /// resolve to an instruction index until [`QFunction::set_label`] is
    /// called on it.
    pub fn new_label(&mut self) -> u32 {
        self.labels.push(u32::MAX);
        (self.labels.len() - 1) as u32
    }

    /// Resolve `label` to the current end of the instruction stream (the
    /// index the *next* emitted instruction will occupy).
    pub fn set_label(&mut self, label: u32) {
        self.labels[label as usize] = self.instructions.len() as u32;
    }

    /// Number of live (non-deleted) instructions, used by the lowerer to
    /// size the output buffer.
    pub fn live_instruction_count(&self) -> usize {
        self.instructions.iter().filter(|i| !i.is_deleted()).count()
    }
}

/// Q-code: the top-level IR produced by the parser/builder and transformed
/// in place by the optimizer.
#[derive(Debug, Clone)]
pub struct QCode {
    pub first_line: u32,
    /// `functions[0]` is the top-level script body.
    pub functions: Vec<QFunction>,
    /// Raw NUL-terminated UTF-8 string-literal pool bytes, inherited from
    /// the lexer and pruned to only the ordinals referenced anywhere in
    /// source (§3, "Identifier and string pools"). `Str` operands index
    /// this pool.
    pub string_pool_bytes: Vec<u8>,
    /// Raw NUL-terminated UTF-8 identifier pool bytes, copied verbatim
    /// from the lexer. `Public`, `StrIdent`, and function-name operands
    /// index this pool. Unlike `string_pool_bytes` this is not pruned
    /// here — compaction and the merge into the output pool happen
    /// together at lowering (§4.7, "Pool emission").
    pub ident_pool_bytes: Vec<u8>,
}

impl QCode {
    pub fn new(first_line: u32) -> Self {
        QCode { first_line, functions: Vec::new(), string_pool_bytes: Vec::new(), ident_pool_bytes: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_function_reserves_temp_zero() {
        let f = QFunction::new(0, FUNC_NOPARENT);
        assert_eq!(f.temp_count, 1);
        assert_eq!(f.parent_index, FUNC_NOPARENT);
        assert_eq!(f.name, FUNC_NONAME);
    }

    #[test]
    fn labels_resolve_to_instruction_index() {
        use crate::instr::QOpcode;
        let mut f = QFunction::new(0, FUNC_NOPARENT);
        f.instructions.push(QInstr::bare(QOpcode::Nop, 1));
        let l = f.new_label();
        f.instructions.push(QInstr::bare(QOpcode::Nop, 2));
        f.set_label(l);
        assert_eq!(f.labels[l as usize], 2);
    }

    #[test]
    fn flags_combine() {
        let f = QFunctionFlags::VARARGS | QFunctionFlags::EXPR_BODY;
        assert!(f.contains(QFunctionFlags::VARARGS));
        assert!(f.contains(QFunctionFlags::EXPR_BODY));
        assert!(!QFunctionFlags::VARARGS.contains(QFunctionFlags::EXPR_BODY));
    }
}
