//! Q-code instructions: the three-address IR emitted by the builder,
//! transformed in place by the optimizer, and consumed by the P-code
//! lowerer.

use crate::operand::QOperand;

/// Q-code opcode. Operand counts and read/write conventions are given in
/// [`QOpcode::operand_count`] — a negative count denotes an instruction
/// that *reads* its destination operand rather than writing it
/// (store-like), matching spec §3's "Q-instruction" table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QOpcode {
    /// Sentinel for an instruction removed by the optimizer. Participates
    /// in no subsequent pass and is skipped by the lowerer.
    Delete,
    Mov,
    Add,
    Sub,
    Mul,
    Div,
    Idiv,
    Mod,
    Shl,
    Shr,
    Cat,
    And,
    Or,
    Xor,
    Ceq,
    Clt,
    Jmp,
    Ift,
    Iff,
    /// Push the single computed value described by the source operand
    /// onto the current frame-stack.
    Push,
    Upos,
    Uneg,
    Uxor,
    Lnot,
    /// Push an exception handler label (`try`).
    ExPush,
    /// Pop the current exception handler (`catch`/normal exit of `try`).
    ExPop,
    /// Attribute get.
    Gattr,
    /// Attribute get, "quiet" form used by `?.name` safe-navigation.
    GattrQ,
    /// Attribute set.
    Sattr,
    /// Attribute delete.
    Dattr,
    /// Index get.
    Gindx,
    /// Index get, quiet form.
    GindxQ,
    /// Index set.
    Sindx,
    /// Index delete.
    Dindx,
    /// Open a new frame-stack.
    Pushf,
    /// Close the current frame-stack.
    Popf,
    /// Call, destination frame-stack-sinked when multiple results are
    /// expected.
    Fcall,
    /// Direct call to a compile-time-known function (no runtime lookup).
    Dcall,
    /// Tail-call variant of [`QOpcode::Fcall`], installed by the optimizer.
    Ftail,
    /// Tail-call variant of [`QOpcode::Dcall`], installed by the optimizer.
    Dtail,
    /// Module-public get.
    Gpub,
    /// Module-public set.
    Spub,
    /// Module-public delete.
    Dpub,
    /// Initialize an iterator over the source operand.
    Iiter,
    /// Advance an iterator; jumps to the exit label when exhausted.
    Inext,
    /// Stack-based multi-value advance of [`QOpcode::Inext`], pushing onto
    /// the frame-stack.
    InextS,
    /// Construct a function value (closure) from a function-table entry,
    /// consuming any default-argument values pushed to the frame-stack.
    Fmake,
    /// Rebind a fetched attribute's receiver into its self-slot
    /// (`->name` method-bind).
    Fbind,
    /// Construct a list from frame-stack contents.
    Mlist,
    /// Construct a dict/table from frame-stack contents.
    Ndict,
    /// Construct a list from a middle range of the frame-stack (the
    /// ellipsis-unpack target of a multi-assignment).
    MlistP,
    /// Fetch the value backing an exhale/inhale slot into a temp
    /// (`GBIND`), emitted around a direct read of a promoted local.
    Gbind,
    /// Store a temp's value back into an exhale/inhale slot (`SBIND`),
    /// emitted around a direct write of a promoted local.
    Sbind,
    /// Spread a list/iterable's contents onto the frame-stack.
    Spread,
    /// Assert the current frame-stack holds exactly `n` values.
    StkEq,
    /// Assert the current frame-stack holds at least `n` values.
    StkGe,
    /// Push a with-scope marker / prior value for later `WPOP` cleanup.
    Wpush,
    /// Pop and run with-scope cleanup (reverse order) for the enclosing
    /// `with`, or for every with-scope crossed by a `break`/`continue`.
    Wpop,
    /// Exit the function, returning nothing.
    Exit0,
    /// Exit the function, returning the single value in the source
    /// operand.
    Exit1,
    /// Exit the function, returning every value on the current
    /// frame-stack.
    Exit,
    /// No-op, preserved across optimization (e.g. an explicit fence).
    Nop,
    /// Natural end-of-body marker; the emitter guarantees exactly one
    /// trailing `End` (or an explicit `Exit*`) per function body.
    End,
}

impl QOpcode {
    /// Operand count for this opcode: how many of `dst`/`src1`/`src2` are
    /// meaningful. A negative value means the instruction *reads* its
    /// destination operand (store-like) rather than writing it.
    pub fn operand_count(self) -> i8 {
        use QOpcode::*;
        match self {
            Delete | Nop | End | Exit0 | ExPop | Popf => 0,
            Mov | Upos | Uneg | Uxor | Lnot | Push | Jmp | Gpub | Spub | Dpub | Iiter | Fbind
            | Spread | Wpush | Exit1 | ExPush | Pushf | Mlist | Ndict | Gbind | Exit => 1,
            Add | Sub | Mul | Div | Idiv | Mod | Shl | Shr | Cat | And | Or | Xor | Ceq | Clt
            | Ift | Iff | Gattr | GattrQ | Gindx | GindxQ | Inext | InextS | Fmake | StkEq
            | StkGe | Fcall | Dcall | Ftail | Dtail => 2,
            Dattr | Dindx | Wpop => 1,
            // store-like: reads dst, writes through src operands
            Sattr => -3,
            Sindx => -3,
            Sbind => -1,
            MlistP => 3,
        }
    }

    /// True for conditional/unconditional jump opcodes.
    pub fn is_jump(self) -> bool {
        matches!(self, QOpcode::Jmp | QOpcode::Ift | QOpcode::Iff)
    }

    /// True for opcodes that unconditionally leave the function.
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            QOpcode::Exit0 | QOpcode::Exit1 | QOpcode::Exit | QOpcode::End
        )
    }

    /// For a jump opcode, which operand position (1 or 2) holds the
    /// target label. `Jmp` carries its target in `src1`; the conditional
    /// forms carry the condition in `src1` and the target in `src2`.
    pub fn jump_operand_index(self) -> Option<u8> {
        match self {
            QOpcode::Jmp => Some(1),
            QOpcode::Ift | QOpcode::Iff => Some(2),
            _ => None,
        }
    }

    /// Whether this opcode both reads and writes its destination operand
    /// in the usual sense (writes a register/local/exhale slot).
    pub fn writes_dst(self) -> bool {
        self.operand_count() >= 0 && self.operand_count() > 0
    }
}

/// A single Q-code instruction: `{ opcode, dst, src1, src2, source_line }`.
#[derive(Debug, Clone, PartialEq)]
pub struct QInstr {
    pub op: QOpcode,
    pub dst: QOperand,
    pub src1: QOperand,
    pub src2: QOperand,
    pub line: u32,
}

impl QInstr {
    pub fn new(op: QOpcode, dst: QOperand, src1: QOperand, src2: QOperand, line: u32) -> Self {
        QInstr { op, dst, src1, src2, line }
    }

    /// A bare marker instruction (`op` with no meaningful operands), used
    /// for `Delete`, `Nop`, `End`, `Popf`, `ExPop`, `Exit0`.
    pub fn bare(op: QOpcode, line: u32) -> Self {
        QInstr { op, dst: QOperand::None, src1: QOperand::None, src2: QOperand::None, line }
    }

    /// Replace this instruction with a `Delete` sentinel in place, as the
    /// optimizer's dead-code and tail-call passes do.
    pub fn delete(&mut self) {
        self.op = QOpcode::Delete;
        self.dst = QOperand::None;
        self.src1 = QOperand::None;
        self.src2 = QOperand::None;
    }

    pub fn is_deleted(&self) -> bool {
        self.op == QOpcode::Delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_operand_indices_match_opcode_shape() {
        assert_eq!(QOpcode::Jmp.jump_operand_index(), Some(1));
        assert_eq!(QOpcode::Ift.jump_operand_index(), Some(2));
        assert_eq!(QOpcode::Iff.jump_operand_index(), Some(2));
        assert_eq!(QOpcode::Add.jump_operand_index(), None);
    }

    #[test]
    fn exit_opcodes_are_flagged() {
        assert!(QOpcode::Exit0.is_exit());
        assert!(QOpcode::Exit1.is_exit());
        assert!(QOpcode::End.is_exit());
        assert!(!QOpcode::Mov.is_exit());
    }

    #[test]
    fn delete_clears_operands() {
        let mut i = QInstr::new(QOpcode::Add, QOperand::Temp(1), QOperand::Temp(2), QOperand::Int(3), 10);
        i.delete();
        assert!(i.is_deleted());
        assert_eq!(i.dst, QOperand::None);
    }
}
