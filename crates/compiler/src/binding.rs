//! Binding resolver (§4.4): promotes a local captured by a nested
//! function to an exhale slot in its owner, and threads an inhale chain
//! through every intermediate frame down to the referencing function.
//!
//! Operates over the live stack of [`crate::builder::FuncFrame`]s the
//! builder keeps while it is still inside nested function bodies — the
//! owner, every intermediate frame, and the referencing frame are all
//! still "open" (mid-construction) at the moment a capture is
//! discovered, since resolution happens eagerly on first reference
//! (per the glossary: "resolved into an inhale chain on first
//! reference").

use crate::builder::FuncFrame;
use crate::scope::BindKind;
use quillc_core::instr::{QInstr, QOpcode};
use quillc_core::operand::QOperand;

/// Resolve a name known (via the referencing frame's book) to be
/// `depth` hops up from `frames.last()`. Mutates every frame from the
/// owner down to the referencer and returns the `Inhale` operand the
/// referencing frame should use.
///
/// `frames[frames.len() - 1]` is the referencing function; `frames[frames.len()
/// - 1 - depth]` is the owner.
pub fn resolve_binding(frames: &mut [FuncFrame], ident: u32, depth: u32, line: u32) -> QOperand {
    let n = frames.len();
    assert!((depth as usize) < n, "binding depth exceeds live frame stack");
    let owner_idx = n - 1 - depth as usize;

    let owner_exhale = promote_owner(&mut frames[owner_idx], ident, line);

    let mut source = QOperand::Exhale(owner_exhale);
    for frame in frames.iter_mut().take(n - 1).skip(owner_idx + 1) {
        source = chain_inhale(frame, ident, source);
    }

    let referencer = &mut frames[n - 1];
    match referencer.book.lookup(ident) {
        Some(BindKind::Inhale(existing)) => QOperand::Inhale(existing),
        _ => {
            let idx = referencer.alloc_inhale();
            referencer.qf.inhale_source_operands.push(source);
            referencer.book.set_inhale(ident, idx);
            QOperand::Inhale(idx)
        }
    }
}

/// Step 2: in the owning frame, promote the local (if not already
/// promoted) to an exhale, rewriting every instruction emitted so far
/// that reads or writes it.
fn promote_owner(owner: &mut FuncFrame, ident: u32, line: u32) -> u32 {
    match owner.book.lookup(ident) {
        Some(BindKind::Exhale(e)) => e,
        Some(BindKind::Local(l)) => {
            let e = owner.alloc_exhale();
            owner.book.promote_to_exhale(ident, e);
            rewrite_local_references(owner, l, e, line);
            if l < owner.qf.arg_count {
                owner.arg_exh.insert(l, e);
            } else {
                owner.remove_local_slot(l);
            }
            e
        }
        other => unreachable!(
            "binding resolver: owner frame entry for a bindable name must be Local or Exhale, got {other:?}"
        ),
    }
}

/// Step 3: a frame strictly between owner and referencer either already
/// holds an inhale for this name (shared by an earlier capture through
/// the same frame) or gets a fresh one chained to `source`.
fn chain_inhale(frame: &mut FuncFrame, ident: u32, source: QOperand) -> QOperand {
    if let Some(BindKind::Inhale(existing)) = frame.book.lookup(ident) {
        return QOperand::Inhale(existing);
    }
    let idx = frame.alloc_inhale();
    frame.qf.inhale_source_operands.push(source);
    frame.book.set_inhale(ident, idx);
    QOperand::Inhale(idx)
}

/// Rewrite every already-emitted instruction in `owner` that references
/// local `local_idx` to instead go through a fresh temp plus a
/// `GBIND`/`SBIND` pair around the original instruction (§4.4 step 2).
/// Reads get a `GBIND` prefix; writes get an `SBIND` suffix. Label
/// targets (which still name instruction indices at this stage) are
/// adjusted so jumps continue to land on the start of the rewritten
/// group.
fn rewrite_local_references(owner: &mut FuncFrame, local_idx: u32, exhale_idx: u32, line: u32) {
    let old = std::mem::take(&mut owner.qf.instructions);
    let mut new_instrs = Vec::with_capacity(old.len() + 4);
    let mut index_map = vec![0u32; old.len() + 1];

    for (i, mut instr) in old.into_iter().enumerate() {
        index_map[i] = new_instrs.len() as u32;
        let reads_dst = instr.op.operand_count() < 0;

        let mut pres: Vec<QInstr> = Vec::new();
        let mut post = None;

        if operand_is_local(&instr.dst, local_idx) {
            let t = owner.alloc_temp();
            if reads_dst {
                pres.push(QInstr::new(QOpcode::Gbind, QOperand::Temp(t), QOperand::Exhale(exhale_idx), QOperand::None, line));
            } else {
                post = Some(QInstr::new(QOpcode::Sbind, QOperand::Exhale(exhale_idx), QOperand::Temp(t), QOperand::None, line));
            }
            instr.dst = QOperand::Temp(t);
        }
        if operand_is_local(&instr.src1, local_idx) {
            let t = owner.alloc_temp();
            pres.push(QInstr::new(QOpcode::Gbind, QOperand::Temp(t), QOperand::Exhale(exhale_idx), QOperand::None, line));
            instr.src1 = QOperand::Temp(t);
        }
        if operand_is_local(&instr.src2, local_idx) {
            let t = owner.alloc_temp();
            pres.push(QInstr::new(QOpcode::Gbind, QOperand::Temp(t), QOperand::Exhale(exhale_idx), QOperand::None, line));
            instr.src2 = QOperand::Temp(t);
        }

        new_instrs.extend(pres);
        new_instrs.push(instr);
        if let Some(p) = post {
            new_instrs.push(p);
        }
    }
    index_map[old.len()] = new_instrs.len() as u32;

    owner.qf.instructions = new_instrs;
    for label in owner.qf.labels.iter_mut() {
        if *label != u32::MAX {
            *label = index_map[*label as usize];
        }
    }
}

fn operand_is_local(op: &QOperand, local_idx: u32) -> bool {
    matches!(op, QOperand::Local(l) if *l == local_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FuncFrame;
    use quillc_core::qfunction::FUNC_NOPARENT;

    fn leaf_frame(parent: u32) -> FuncFrame {
        FuncFrame::new(0, parent)
    }

    #[test]
    fn two_level_capture_promotes_and_chains() {
        // outer() { i = 0; function inner() return i end }
        let mut outer = leaf_frame(FUNC_NOPARENT);
        let local_i = outer.alloc_local();
        outer.book.declare_local(42, local_i);
        outer.emit(QOpcode::Mov, QOperand::Local(local_i), QOperand::Int(0), QOperand::None, 1);

        let mut inner = FuncFrame::new(1, 0);
        inner.book = crate::scope::ScopeBook::child_of(&outer.book);

        let mut frames = vec![outer, inner];
        let result = resolve_binding(&mut frames, 42, 1, 2);
        assert!(matches!(result, QOperand::Inhale(0)));

        assert_eq!(frames[0].qf.exhale_count, 1);
        assert_eq!(frames[1].qf.inhale_count, 1);
        assert_eq!(frames[1].qf.inhale_source_operands, vec![QOperand::Exhale(0)]);

        // the outer Mov's destination was rewritten through a temp + SBIND.
        assert_eq!(frames[0].qf.instructions.len(), 2);
        assert!(matches!(frames[0].qf.instructions[0].dst, QOperand::Temp(_)));
        assert_eq!(frames[0].qf.instructions[1].op, QOpcode::Sbind);
    }

    #[test]
    fn three_level_capture_chains_through_intermediate() {
        let mut a = leaf_frame(FUNC_NOPARENT);
        let local_i = a.alloc_local();
        a.book.declare_local(7, local_i);

        let mut b = FuncFrame::new(1, 0);
        b.book = crate::scope::ScopeBook::child_of(&a.book);

        let mut c = FuncFrame::new(2, 1);
        c.book = crate::scope::ScopeBook::child_of(&b.book);

        let mut frames = vec![a, b, c];
        let result = resolve_binding(&mut frames, 7, 2, 3);
        assert!(matches!(result, QOperand::Inhale(0)));
        assert_eq!(frames[0].qf.exhale_count, 1);
        assert_eq!(frames[1].qf.inhale_count, 1);
        assert_eq!(frames[1].qf.inhale_source_operands, vec![QOperand::Exhale(0)]);
        assert_eq!(frames[2].qf.inhale_count, 1);
        assert_eq!(frames[2].qf.inhale_source_operands, vec![QOperand::Inhale(0)]);
    }
}
