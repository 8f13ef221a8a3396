//! Optimizer (§4.6): runs in-place over a function's Q-code after parsing,
//! before lowering. Fixed order: temp coalescing, tail-call rewrite,
//! jump-chain merge, dead-code elimination (the latter to a fixed point).
//!
//! Constant folding is not here — it happens as each operation is about to
//! be emitted, in [`crate::builder`] (§4.3), matching spec.md's own
//! component table (§2: folding is "embedded in builder").

use quillc_core::instr::{QInstr, QOpcode};
use quillc_core::operand::QOperand;
use quillc_core::qfunction::{QCode, QFunction};

/// Run every optimizer pass, in spec order, over every function in `code`.
pub fn optimize(code: &mut QCode, dce_max_iterations: usize) {
    for f in code.functions.iter_mut() {
        coalesce_temps(f);
        rewrite_tail_calls(f);
        merge_jump_chains(f);
        eliminate_dead_code(f, dce_max_iterations);
        clear_marker_bits(f);
    }
}

// ---- temp coalescing ---------------------------------------------------

/// For each temp, compute its live range — first write to last read — and
/// greedily assign it to the lowest-numbered output temp whose previous
/// live range has already ended. A backward jump whose target precedes
/// the temp's write extends the live range to that jump (§4.6).
///
/// Temp 0 is the reserved single-value scratch register and is never
/// remapped.
fn coalesce_temps(f: &mut QFunction) {
    let n = f.instructions.len();
    if n == 0 {
        return;
    }
    let max_temp = f.temp_count;
    let mut first_write = vec![usize::MAX; max_temp as usize];
    let mut last_read = vec![0usize; max_temp as usize];

    for (i, instr) in f.instructions.iter().enumerate() {
        if instr.is_deleted() {
            continue;
        }
        let reads_dst = instr.op.operand_count() < 0;
        if let QOperand::Temp(t) = instr.dst {
            if !reads_dst && first_write[t as usize] == usize::MAX {
                first_write[t as usize] = i;
            }
            if reads_dst {
                last_read[t as usize] = last_read[t as usize].max(i);
            }
        }
        for src in [&instr.src1, &instr.src2] {
            if let QOperand::Temp(t) = src {
                last_read[*t as usize] = last_read[*t as usize].max(i);
            }
        }
    }

    // Extend live ranges across backward jumps: any backward jump whose
    // target instruction precedes a temp's write, but whose source index
    // falls within [write, read], extends that temp's live range to the
    // jump's own index.
    for i in 0..n {
        let instr = &f.instructions[i];
        if instr.is_deleted() || !instr.op.is_jump() {
            continue;
        }
        let Some(target) = jump_target_index(f, instr) else { continue };
        if target >= i {
            continue;
        }
        for t in 1..max_temp {
            let w = first_write[t as usize];
            if w == usize::MAX {
                continue;
            }
            if target <= w && i >= w && i > last_read[t as usize] {
                last_read[t as usize] = i;
            }
        }
    }

    let mut live: Vec<(u32, usize, usize)> = (1..max_temp)
        .filter(|&t| first_write[t as usize] != usize::MAX)
        .map(|t| (t, first_write[t as usize], last_read[t as usize]))
        .collect();
    live.sort_by_key(|&(_, w, _)| w);

    // Greedy coalescing: maintain, per output temp, the instruction index
    // its current occupant's live range ends at.
    let mut slot_free_at: Vec<usize> = vec![0];
    let mut remap = vec![0u32; max_temp as usize];
    remap[0] = 0;
    let mut peak = 1u32;

    for (t, w, r) in live {
        let mut chosen = None;
        for (slot_idx, &free_at) in slot_free_at.iter().enumerate() {
            if slot_idx == 0 {
                continue; // temp 0 reserved
            }
            if free_at <= w {
                chosen = Some(slot_idx as u32);
                break;
            }
        }
        let out = match chosen {
            Some(s) => {
                slot_free_at[s as usize] = r;
                s
            }
            None => {
                slot_free_at.push(r);
                let s = (slot_free_at.len() - 1) as u32;
                peak = peak.max(s + 1);
                s
            }
        };
        remap[t as usize] = out;
    }

    for instr in f.instructions.iter_mut() {
        remap_temp(&mut instr.dst, &remap);
        remap_temp(&mut instr.src1, &remap);
        remap_temp(&mut instr.src2, &remap);
    }
    f.temp_count = peak.max(1);
}

fn remap_temp(op: &mut QOperand, remap: &[u32]) {
    if let QOperand::Temp(t) = op {
        *t = remap[*t as usize];
    }
}

fn jump_target_index(f: &QFunction, instr: &QInstr) -> Option<usize> {
    let idx = instr.op.jump_operand_index()?;
    let operand = if idx == 1 { &instr.src1 } else { &instr.src2 };
    match operand {
        QOperand::Label(l) => {
            let target = f.labels[*l as usize];
            if target == u32::MAX {
                None
            } else {
                Some(target as usize)
            }
        }
        _ => None,
    }
}

// ---- tail calls ---------------------------------------------------------

/// A call whose result feeds straight into the function's return, with
/// nothing else reading it, is rewritten to the tail-call opcode variant:
/// the pattern the builder actually emits for `return f(...)` is
///
/// ```text
/// Pushf
/// (Fcall|Dcall) Temp(t), callee, ...
/// Popf
/// Exit1 Temp(t)
/// ```
///
/// which collapses to `(Ftail|Dtail) StackPush, callee, ...` — the
/// surrounding frame-push/pop is elided (nothing else needs that frame)
/// and the `Exit1`/implicit `End` that followed is deleted, since the
/// tail call itself now transfers control (§4.6).
fn rewrite_tail_calls(f: &mut QFunction) {
    let n = f.instructions.len();
    for i in 0..n {
        let (is_call, dst_temp) = {
            let instr = &f.instructions[i];
            if instr.is_deleted() || !matches!(instr.op, QOpcode::Fcall | QOpcode::Dcall) {
                (false, None)
            } else {
                match instr.dst {
                    QOperand::Temp(t) => (true, Some(t)),
                    _ => (false, None),
                }
            }
        };
        if !is_call {
            continue;
        }
        let t = dst_temp.unwrap();

        let Some(j1) = next_live_index(f, i + 1) else { continue };
        if f.instructions[j1].op != QOpcode::Popf {
            continue;
        }
        let Some(j2) = next_live_index(f, j1 + 1) else { continue };
        let exit = &f.instructions[j2];
        if exit.op != QOpcode::Exit1 || exit.src1 != QOperand::Temp(t) {
            continue;
        }

        if let Some(p) = prev_live_index(f, i) {
            if f.instructions[p].op == QOpcode::Pushf {
                f.instructions[p].delete();
            }
        }
        f.instructions[i].op = match f.instructions[i].op {
            QOpcode::Fcall => QOpcode::Ftail,
            QOpcode::Dcall => QOpcode::Dtail,
            other => other,
        };
        f.instructions[i].dst = QOperand::StackPush;
        f.instructions[j1].delete();
        f.instructions[j2].delete();
    }
}

fn next_live_index(f: &QFunction, from: usize) -> Option<usize> {
    (from..f.instructions.len()).find(|&i| !f.instructions[i].is_deleted())
}

fn prev_live_index(f: &QFunction, before: usize) -> Option<usize> {
    (0..before).rev().find(|&i| !f.instructions[i].is_deleted())
}

// ---- jump-chain merge ----------------------------------------------------

/// Recursion depth bound for chasing a chain of unconditional jumps, to
/// terminate on pathological cycles (§4.6).
const JUMP_CHAIN_DEPTH_LIMIT: u32 = 256;

/// For any jump whose target label resolves to another unconditional
/// jump, rewrite the target to point directly at the final destination.
fn merge_jump_chains(f: &mut QFunction) {
    let n = f.instructions.len();
    for i in 0..n {
        if f.instructions[i].is_deleted() || f.instructions[i].op.jump_operand_index().is_none() {
            continue;
        }
        let idx = f.instructions[i].op.jump_operand_index().unwrap();
        let label = match (idx, &f.instructions[i].src1, &f.instructions[i].src2) {
            (1, QOperand::Label(l), _) => *l,
            (2, _, QOperand::Label(l)) => *l,
            _ => continue,
        };
        if let Some(final_label) = chase_chain(f, label, 0) {
            let slot = if idx == 1 { &mut f.instructions[i].src1 } else { &mut f.instructions[i].src2 };
            *slot = QOperand::Label(final_label);
        }
    }
}

/// Follow `label` through a chain of unconditional jumps, returning the
/// final label it should resolve to, or `None` if no merge applies.
fn chase_chain(f: &QFunction, label: u32, depth: u32) -> Option<u32> {
    if depth >= JUMP_CHAIN_DEPTH_LIMIT {
        return None;
    }
    let target_instr_idx = f.labels[label as usize];
    if target_instr_idx == u32::MAX {
        return None;
    }
    let instr = f.instructions.get(target_instr_idx as usize)?;
    if instr.is_deleted() || instr.op != QOpcode::Jmp {
        return None;
    }
    let QOperand::Label(next) = instr.src1 else { return None };
    if next == label {
        return None; // self-loop, do not chase further
    }
    match chase_chain(f, next, depth + 1) {
        Some(further) => Some(further),
        None => Some(next),
    }
}

// ---- dead-code elimination -----------------------------------------------

/// Mark every instruction reachable from entry via fall-through and jump
/// edges; everything else becomes `Delete`. Runs to a fixed point (an
/// earlier pass's deletions can make a later block's sole predecessor
/// disappear), bounded by `max_iterations` (§4.6).
fn eliminate_dead_code(f: &mut QFunction, max_iterations: usize) {
    for _ in 0..max_iterations.max(1) {
        let reachable = compute_reachable(f);
        let mut changed = false;
        for (i, instr) in f.instructions.iter_mut().enumerate() {
            if !instr.is_deleted() && !reachable[i] {
                instr.delete();
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn compute_reachable(f: &QFunction) -> Vec<bool> {
    let n = f.instructions.len();
    let mut reachable = vec![false; n];
    if n == 0 {
        return reachable;
    }
    let mut stack = vec![0usize];
    while let Some(i) = stack.pop() {
        if i >= n || reachable[i] {
            continue;
        }
        if f.instructions[i].is_deleted() {
            continue;
        }
        reachable[i] = true;
        let instr = &f.instructions[i];
        if let Some(target) = jump_target_index(f, instr) {
            stack.push(target);
        }
        // Conditional jumps (Ift/Iff) also fall through; only an
        // unconditional Jmp or an exit opcode does not.
        if instr.op != QOpcode::Jmp && !instr.op.is_exit() {
            stack.push(i + 1);
        }
    }
    reachable
}

/// After optimization, clear internal marker bits on placeholder operand
/// variants — any `Bindable`/`AttrSlot`/etc. surviving this late is a
/// builder bug, but cleanup happens here regardless so the lowerer never
/// has to special-case them (§4.6, "After optimization...").
fn clear_marker_bits(f: &mut QFunction) {
    for instr in f.instructions.iter_mut() {
        debug_assert!(!instr.dst.is_placeholder(), "placeholder operand survived to the optimizer");
        debug_assert!(!instr.src1.is_placeholder(), "placeholder operand survived to the optimizer");
        debug_assert!(!instr.src2.is_placeholder(), "placeholder operand survived to the optimizer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillc_core::qfunction::FUNC_NOPARENT;

    fn func_with(instrs: Vec<QInstr>, labels: Vec<u32>) -> QFunction {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions = instrs;
        f.labels = labels;
        f.temp_count = 8;
        f
    }

    #[test]
    fn tail_call_rewrite_collapses_pushf_popf_exit() {
        // Pushf; Dcall t0, f; Popf; Exit1 t0 -- the shape `return f(n)` emits.
        let mut f = func_with(
            vec![
                QInstr::bare(QOpcode::Pushf, 1),
                QInstr::new(QOpcode::Dcall, QOperand::Temp(0), QOperand::Function(0), QOperand::None, 1),
                QInstr::bare(QOpcode::Popf, 1),
                QInstr::new(QOpcode::Exit1, QOperand::None, QOperand::Temp(0), QOperand::None, 1),
            ],
            vec![],
        );
        rewrite_tail_calls(&mut f);
        assert!(f.instructions[0].is_deleted());
        assert_eq!(f.instructions[1].op, QOpcode::Dtail);
        assert_eq!(f.instructions[1].dst, QOperand::StackPush);
        assert!(f.instructions[2].is_deleted());
        assert!(f.instructions[3].is_deleted());
    }

    #[test]
    fn tail_call_not_rewritten_when_result_is_reused() {
        let mut f = func_with(
            vec![
                QInstr::bare(QOpcode::Pushf, 1),
                QInstr::new(QOpcode::Dcall, QOperand::Temp(0), QOperand::Function(0), QOperand::None, 1),
                QInstr::bare(QOpcode::Popf, 1),
                QInstr::new(QOpcode::Add, QOperand::Temp(1), QOperand::Temp(0), QOperand::Int(1), 1),
                QInstr::new(QOpcode::Exit1, QOperand::None, QOperand::Temp(1), QOperand::None, 1),
            ],
            vec![],
        );
        rewrite_tail_calls(&mut f);
        assert_eq!(f.instructions[1].op, QOpcode::Dcall);
    }

    #[test]
    fn jump_chain_merges_to_final_target() {
        // 0: jmp L0 (label 0 -> instr 1)
        // 1: jmp L1 (label 1 -> instr 2)
        // 2: end
        let mut f = func_with(
            vec![
                QInstr::new(QOpcode::Jmp, QOperand::None, QOperand::Label(0), QOperand::None, 1),
                QInstr::new(QOpcode::Jmp, QOperand::None, QOperand::Label(1), QOperand::None, 1),
                QInstr::bare(QOpcode::End, 1),
            ],
            vec![1, 2],
        );
        merge_jump_chains(&mut f);
        assert_eq!(f.instructions[0].src1, QOperand::Label(1));
    }

    #[test]
    fn dead_code_elimination_removes_unreachable_tail() {
        // 0: jmp L0 (-> instr 2)
        // 1: end          <- unreachable
        // 2: end (label 0)
        let mut f = func_with(
            vec![
                QInstr::new(QOpcode::Jmp, QOperand::None, QOperand::Label(0), QOperand::None, 1),
                QInstr::bare(QOpcode::End, 1),
                QInstr::bare(QOpcode::End, 1),
            ],
            vec![2],
        );
        eliminate_dead_code(&mut f, 8);
        assert!(!f.instructions[0].is_deleted());
        assert!(f.instructions[1].is_deleted());
        assert!(!f.instructions[2].is_deleted());
    }

    #[test]
    fn dead_code_elimination_is_idempotent() {
        let mut f = func_with(
            vec![
                QInstr::new(QOpcode::Jmp, QOperand::None, QOperand::Label(0), QOperand::None, 1),
                QInstr::bare(QOpcode::End, 1),
                QInstr::bare(QOpcode::End, 1),
            ],
            vec![2],
        );
        eliminate_dead_code(&mut f, 8);
        let once = f.instructions.clone();
        eliminate_dead_code(&mut f, 8);
        assert_eq!(once, f.instructions);
    }

    #[test]
    fn temp_coalescing_never_remaps_temp_zero() {
        let mut f = func_with(
            vec![
                QInstr::new(QOpcode::Mov, QOperand::Temp(0), QOperand::Int(1), QOperand::None, 1),
                QInstr::new(QOpcode::Mov, QOperand::Temp(1), QOperand::Temp(0), QOperand::None, 1),
                QInstr::bare(QOpcode::End, 1),
            ],
            vec![],
        );
        coalesce_temps(&mut f);
        assert_eq!(f.instructions[0].dst, QOperand::Temp(0));
    }

    #[test]
    fn disjoint_temps_coalesce_into_the_same_slot() {
        // t1 written and read, then dead; t2 written and read afterward.
        // Both should end up in output slot 1 (lowest free, non-zero).
        let mut f = func_with(
            vec![
                QInstr::new(QOpcode::Mov, QOperand::Temp(1), QOperand::Int(1), QOperand::None, 1),
                QInstr::new(QOpcode::Mov, QOperand::Temp(0), QOperand::Temp(1), QOperand::None, 1),
                QInstr::new(QOpcode::Mov, QOperand::Temp(2), QOperand::Int(2), QOperand::None, 1),
                QInstr::new(QOpcode::Mov, QOperand::Temp(0), QOperand::Temp(2), QOperand::None, 1),
                QInstr::bare(QOpcode::End, 1),
            ],
            vec![],
        );
        coalesce_temps(&mut f);
        assert_eq!(f.instructions[0].dst, f.instructions[2].dst);
        assert_eq!(f.temp_count, 2);
    }
}
