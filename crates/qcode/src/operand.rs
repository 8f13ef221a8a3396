//! The Q-operand: a tagged union describing where a Q-instruction's value
//! lives, following the teacher's guidance in spec §9 ("Pointer-as-union
//! operand") to use an explicit sum type rather than aliasing a raw union.

/// A positional reference into a function's frame-stack, either counted
/// from the base of the current frame or, tagged separately, from its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRef {
    /// Position counted from the frame's base (`0` is the first value
    /// pushed after the matching `PUSHF`).
    FromBase(u32),
    /// Position counted from the frame's end (`0` is the most recently
    /// pushed value).
    FromEnd(u32),
}

/// Tagged union of everything a Q-instruction operand position can hold.
///
/// Most variants correspond 1:1 to a runtime/source value kind. Four
/// (`AttrSlot`, `IndexSlot`, `FuncStackResult`, `Bindable`) are
/// compile-time-only placeholders used while the builder is still
/// assembling a function and never survive past optimization (the
/// binding resolver retires `Bindable` before the optimizer ever sees
/// it). `StrIdent` is not one of these: it is a real, persistent operand
/// (an attribute/dict-key/public name sourced from the identifier pool)
/// that survives unchanged through the optimizer and is only resolved to
/// its final pool-index bytes at lowering, alongside `Str`.
#[derive(Debug, Clone, PartialEq)]
pub enum QOperand {
    /// No operand in this position.
    None,
    /// Temporary register. Index 0 is the reserved single-value scratch
    /// register and is never coalesced by the optimizer.
    Temp(u32),
    /// Local variable slot.
    Local(u32),
    /// Exhale slot: storage for a value captured by a nested function.
    Exhale(u32),
    /// Inhale slot: a reference to an enclosing frame's exhale (or
    /// further-out inhale), populated when the function value is made.
    Inhale(u32),
    /// Module-level public binding, addressed by identifier-pool index.
    Public(u32),
    /// Plain identifier reference, addressed by identifier-pool index.
    /// Used transiently during parsing before a name resolves to a
    /// concrete operand kind.
    Identifier(u32),
    /// String literal, addressed by string-pool index.
    Str(u32),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// The `null` literal.
    Null,
    /// The `false` literal.
    False,
    /// The `true` literal.
    True,
    /// Jump target: index into the function's label table.
    Label(u32),
    /// Frame-stack reference (source), see [`StackRef`].
    Stack(StackRef),
    /// Frame-stack sink: "push the computed value onto the current
    /// frame-stack" rather than a specific slot.
    StackPush,
    /// Reference to a function by index into the program's function table.
    Function(u32),
    /// Arbitrary unsigned immediate for instructions that need one (e.g.
    /// the base/end offsets of `MLISTP`, or a relational-operator tag).
    Unsigned(u32),
    /// With-stack sink: destination for a value entering with-scope
    /// bookkeeping.
    WithStack,

    // --- compile-time-only placeholders, retired before lowering ---
    /// Attribute slot: placeholder destination mid-way through compiling
    /// an attribute-chain assignment. Consumes the builder's auxiliary
    /// operand stack.
    AttrSlot,
    /// Index slot: the index-chain analogue of [`QOperand::AttrSlot`].
    IndexSlot,
    /// The result of a call still sitting on the frame-stack (source
    /// only), distinct from [`QOperand::Stack`] in that it hasn't been
    /// individually addressed yet.
    FuncStackResult,
    /// A name known to live in an enclosing scope, `depth` hops up, not
    /// yet resolved to a concrete inhale. Resolved into an
    /// [`QOperand::Inhale`] chain by the binding resolver on first
    /// reference (§4.4).
    Bindable { depth: u32 },
    /// An identifier-pool reference used where a name is needed rather
    /// than a value (attribute name, dict bareword key, delete target).
    /// Merged into the same output pool as [`QOperand::Str`] at lowering
    /// time, but unlike the placeholders below, this operand is real and
    /// persistent: it is emitted by the builder and lives unchanged
    /// through optimization.
    StrIdent(u32),
}

impl QOperand {
    /// Whether this operand reads from a register-like slot (temp, local,
    /// exhale, or inhale) — used by the lowerer to decide between `_R` and
    /// `_L` opcode forms.
    pub fn is_register(&self) -> bool {
        matches!(
            self,
            QOperand::Temp(_) | QOperand::Local(_) | QOperand::Exhale(_) | QOperand::Inhale(_)
        )
    }

    /// Whether this operand is a literal that, if it fits a 16-bit signed
    /// immediate, can be encoded directly as an `_L` operand by the
    /// lowerer.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            QOperand::Int(_)
                | QOperand::Float(_)
                | QOperand::Null
                | QOperand::True
                | QOperand::False
                | QOperand::Str(_)
        )
    }

    /// True for the compile-time-only placeholder variants that must never
    /// reach the optimizer or lowerer. `StrIdent` is deliberately excluded:
    /// it is a real operand that both of those stages handle.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, QOperand::AttrSlot | QOperand::IndexSlot | QOperand::FuncStackResult | QOperand::Bindable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_operands_are_recognized() {
        assert!(QOperand::Temp(0).is_register());
        assert!(QOperand::Local(3).is_register());
        assert!(QOperand::Exhale(1).is_register());
        assert!(QOperand::Inhale(2).is_register());
        assert!(!QOperand::Int(5).is_register());
        assert!(!QOperand::Stack(StackRef::FromBase(0)).is_register());
    }

    #[test]
    fn literal_operands_are_recognized() {
        assert!(QOperand::Int(1).is_literal());
        assert!(QOperand::Float(1.0).is_literal());
        assert!(QOperand::Null.is_literal());
        assert!(QOperand::True.is_literal());
        assert!(QOperand::False.is_literal());
        assert!(QOperand::Str(0).is_literal());
        assert!(!QOperand::Temp(0).is_literal());
    }

    #[test]
    fn placeholders_are_flagged() {
        assert!(QOperand::Bindable { depth: 2 }.is_placeholder());
        assert!(QOperand::AttrSlot.is_placeholder());
        assert!(!QOperand::Temp(0).is_placeholder());
    }
}
