//! P-code lowerer (§4.7): converts each optimized Q-function's
//! instruction list into the compact bytecode stream the VM loader
//! consumes, choosing opcode variants, selecting a per-function jump
//! width, and compacting the string/identifier pool.
//!
//! Execution of the emitted bytecode is the VM's responsibility and out
//! of scope here (§1); this module only has to produce a deterministic,
//! internally-consistent `Program` whose jumps resolve within their own
//! function and whose register indices stay within their declared counts
//! (§8, testable properties 3 and 5).

use quillc_core::codec::{encode_clq, encode_vlq_int, encode_vlq_size, min_clq_width};
use quillc_core::instr::{QInstr, QOpcode};
use quillc_core::operand::{QOperand, StackRef};
use quillc_core::program::{FunctionHeader, POpcode, Program};
use quillc_core::qfunction::{QCode, QFunction, FUNC_NONAME, FUNC_NOPARENT};
use std::collections::HashMap;

/// Register-index width in bytes (§4.1: "a compile-time constant,
/// typically 1"). Register operands are encoded as a one-byte kind tag
/// (temp/local/exhale/inhale) followed by a [`REGW`]-byte CLQ index.
pub const REGW: u8 = 1;

/// Maximum number of jump-width fixed-point iterations before giving up
/// and using the largest width (mirrors the bounded iteration the
/// optimizer's dead-code pass uses, §4.6, applied here to §4.7's "Jump
/// width" selection).
const JUMP_WIDTH_MAX_TRIES: u8 = 4;

/// One piece of an instruction's operand bytes: either already-final
/// bytes (registers, immediates, stack refs, jump targets patched
/// separately) or a symbolic reference into one of the two source pools,
/// left unresolved until every function has been scanned and the merged
/// output pool's numbering is known (§4.7, "Pool emission").
enum Part {
    B(Vec<u8>),
    /// Ordinal into the original (lexer) string-literal pool.
    Str(u32),
    /// Ordinal into the original (lexer) identifier pool. Covers
    /// `StrIdent`, `Public`, and function-name references — per §3,
    /// "Identifiers and strings share the same pool", all of these are
    /// merged into the same output pool as string literals.
    Id(u32),
}

fn pb(bytes: Vec<u8>) -> Vec<Part> {
    vec![Part::B(bytes)]
}

fn pconcat(mut a: Vec<Part>, b: Vec<Part>) -> Vec<Part> {
    a.extend(b);
    a
}

fn pconcat3(a: Vec<Part>, b: Vec<Part>, c: Vec<Part>) -> Vec<Part> {
    pconcat(pconcat(a, b), c)
}

/// A P-code instruction mid-lowering: its opcode and operand parts,
/// except for an embedded jump target, which is recorded symbolically
/// (as the index, within this function's lowered stream, that the jump
/// must resolve to) until the function's jump width is chosen.
struct PendingInstr {
    op: POpcode,
    parts: Vec<Part>,
    jump_target: Option<usize>,
}

impl PendingInstr {
    fn fixed(op: POpcode, parts: Vec<Part>) -> Self {
        PendingInstr { op, parts, jump_target: None }
    }

    fn with_jump(op: POpcode, parts: Vec<Part>, target: usize) -> Self {
        PendingInstr { op, parts, jump_target: Some(target) }
    }
}

/// A P-code instruction whose operand bytes are fully resolved; only the
/// jump target (if any) remains to be patched once the function's jump
/// width is chosen.
struct LoweredInstr {
    op: POpcode,
    prefix: Vec<u8>,
    jump_target: Option<usize>,
}

impl LoweredInstr {
    fn len(&self, jump_width: u8) -> usize {
        1 + self.prefix.len() + if self.jump_target.is_some() { jump_width as usize } else { 0 }
    }
}

/// Lower an entire compiled, optimized [`QCode`] into the final
/// [`Program`] (§4.7, "Layout").
pub fn lower(code: &QCode) -> Program {
    let mut used_strings: Vec<bool> = vec![false; count_pool_entries(&code.string_pool_bytes)];
    let mut used_idents: Vec<bool> = vec![false; count_pool_entries(&code.ident_pool_bytes)];

    let pending_functions: Vec<(Vec<PendingInstr>, u32)> = code
        .functions
        .iter()
        .map(|f| lower_function_body(f, &mut used_strings, &mut used_idents))
        .collect();

    for f in &code.functions {
        if f.name != FUNC_NONAME {
            mark_used(&mut used_idents, f.name);
        }
    }

    let (str_remap, id_remap, pool_bytes) =
        merge_pools(&code.string_pool_bytes, &used_strings, &code.ident_pool_bytes, &used_idents);

    let mut code_bytes = Vec::new();
    let mut headers = Vec::new();

    for (f, (pending, temp_count)) in code.functions.iter().zip(pending_functions.into_iter()) {
        let instrs: Vec<LoweredInstr> = pending
            .into_iter()
            .map(|p| LoweredInstr { op: p.op, prefix: resolve_parts(&p.parts, &str_remap, &id_remap), jump_target: p.jump_target })
            .collect();

        let jump_width = choose_jump_width(&instrs);
        let entry_offset = code_bytes.len() as u32;
        emit_function_bytes(&instrs, jump_width, &mut code_bytes);

        let name_pool_offset = if f.name == FUNC_NONAME { FUNC_NONAME } else { *id_remap.get(&f.name).unwrap_or(&FUNC_NONAME) };
        let inhale_sources = f
            .inhale_source_operands
            .iter()
            .map(|op| match op {
                QOperand::Exhale(i) => (true, *i),
                QOperand::Inhale(i) => (false, *i),
                other => unreachable!("inhale source must be Exhale or Inhale, got {other:?}"),
            })
            .collect();

        headers.push(FunctionHeader {
            arg_count: f.arg_count,
            optional_arg_count: f.optional_arg_count,
            temp_count,
            local_count: f.local_count,
            exhale_count: f.exhale_count,
            inhale_count: f.inhale_count,
            entry_offset,
            name_pool_offset,
            jump_width,
            inhale_sources,
        });
    }

    let data_bytes = serialize_data(&pool_bytes, &headers);
    Program { code: code_bytes, data: data_bytes }
}

/// Replace every symbolic [`Part`] with its final bytes, now that the
/// merged pool's numbering is known.
fn resolve_parts(parts: &[Part], str_remap: &HashMap<u32, u32>, id_remap: &HashMap<u32, u32>) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            Part::B(b) => out.extend_from_slice(b),
            Part::Str(i) => encode_vlq_size(*str_remap.get(i).unwrap_or(&0) as u64, &mut out),
            Part::Id(i) => encode_vlq_size(*id_remap.get(i).unwrap_or(&0) as u64, &mut out),
        }
    }
    out
}

// ---- per-function lowering ------------------------------------------------

/// Lower one function's live instructions into [`PendingInstr`]s, tracking
/// the (possibly grown, from literal materialization) temp count. Returns
/// the pending stream and the final temp count.
fn lower_function_body(f: &QFunction, used_strings: &mut [bool], used_idents: &mut [bool]) -> (Vec<PendingInstr>, u32) {
    let live: Vec<(usize, &QInstr)> = f.instructions.iter().enumerate().filter(|(_, i)| !i.is_deleted()).collect();

    // Map from original Q-instruction index to the index of its first
    // lowered instruction, so label targets (which name Q-instruction
    // indices after `close_function`'s own patching) can be translated.
    let mut qidx_to_lowered_start = HashMap::with_capacity(live.len());
    let mut out = Vec::with_capacity(live.len());
    let mut next_temp = f.temp_count;

    for (qidx, instr) in &live {
        qidx_to_lowered_start.insert(*qidx, out.len());
        lower_one(instr, f, used_strings, used_idents, &mut next_temp, &mut out);
    }
    // A jump whose target label resolved to one-past-the-end (fallthrough
    // to the implicit end) maps to the lowered stream's length.
    qidx_to_lowered_start.insert(f.instructions.len(), out.len());

    // Resolve each lowered jump's Q-instruction-index target to a lowered
    // index via the map above (skipping forward past any instructions the
    // optimizer deleted).
    for lowered in out.iter_mut() {
        if let Some(target_qidx) = lowered.jump_target {
            let resolved = nearest_live_lowered_index(&qidx_to_lowered_start, target_qidx, f.instructions.len());
            lowered.jump_target = Some(resolved);
        }
    }

    (out, next_temp)
}

/// A jump target is a Q-instruction index; if that exact instruction was
/// deleted by the optimizer, walk forward to the next live one (dead-code
/// elimination guarantees the deleted run eventually reaches either a live
/// instruction or the function's end).
fn nearest_live_lowered_index(map: &HashMap<usize, usize>, mut qidx: usize, limit: usize) -> usize {
    while !map.contains_key(&qidx) && qidx < limit {
        qidx += 1;
    }
    *map.get(&qidx).unwrap_or(&map[&limit])
}

fn lower_one(instr: &QInstr, f: &QFunction, used_strings: &mut [bool], used_idents: &mut [bool], next_temp: &mut u32, out: &mut Vec<PendingInstr>) {
    if let Some(jump_idx) = instr.op.jump_operand_index() {
        return lower_jump(instr, jump_idx, f, out);
    }
    match instr.op {
        QOpcode::Delete | QOpcode::Nop => {}
        QOpcode::End => out.push(PendingInstr::fixed(POpcode::Exit0, Vec::new())),
        QOpcode::Exit0 => out.push(PendingInstr::fixed(POpcode::Exit0, Vec::new())),
        QOpcode::Exit1 => {
            let src = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::Exit1, src));
        }
        QOpcode::Exit => out.push(PendingInstr::fixed(POpcode::Exit, Vec::new())),
        QOpcode::Mov => {
            let src = encode_register_or_materialize(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::Mov, pconcat(pb(encode_register(&instr.dst)), src)));
        }
        op if is_binop(op) => lower_binop(instr, used_strings, used_idents, next_temp, out),
        op if is_unop(op) => lower_unop(instr, used_strings, used_idents, next_temp, out),
        QOpcode::Push => {
            let src = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::StStk, src));
        }
        QOpcode::Gattr | QOpcode::GattrQ => {
            let op = if instr.op == QOpcode::Gattr { POpcode::LdAttr } else { POpcode::LdAttrQ };
            let obj = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            let name = encode_str_ident(&instr.src2, used_idents);
            out.push(PendingInstr::fixed(op, pconcat3(pb(encode_register(&instr.dst)), obj, name)));
        }
        QOpcode::Sattr => {
            let obj = materialize_and_encode(&instr.dst, used_strings, used_idents, next_temp, out);
            let name = encode_str_ident(&instr.src1, used_idents);
            let value = materialize_and_encode(&instr.src2, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::StAttr, pconcat3(obj, name, value)));
        }
        QOpcode::Dattr => {
            let obj = materialize_and_encode(&instr.dst, used_strings, used_idents, next_temp, out);
            let name = encode_str_ident(&instr.src1, used_idents);
            out.push(PendingInstr::fixed(POpcode::DeAttr, pconcat(obj, name)));
        }
        QOpcode::Gindx | QOpcode::GindxQ => {
            let op = if instr.op == QOpcode::Gindx { POpcode::LdIndx } else { POpcode::LdIndxQ };
            let obj = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            let index = materialize_and_encode(&instr.src2, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(op, pconcat3(pb(encode_register(&instr.dst)), obj, index)));
        }
        QOpcode::Sindx => {
            let obj = materialize_and_encode(&instr.dst, used_strings, used_idents, next_temp, out);
            let index = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            let value = materialize_and_encode(&instr.src2, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::StIndx, pconcat3(obj, index, value)));
        }
        QOpcode::Dindx => {
            let obj = materialize_and_encode(&instr.dst, used_strings, used_idents, next_temp, out);
            let index = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::DeIndx, pconcat(obj, index)));
        }
        QOpcode::Pushf => out.push(PendingInstr::fixed(POpcode::Rpush, Vec::new())),
        QOpcode::Popf => out.push(PendingInstr::fixed(POpcode::Rpop, Vec::new())),
        QOpcode::ExPush => {
            let handler = jump_payload_placeholder(&instr.src1, f);
            out.push(PendingInstr::with_jump(POpcode::Xpush, Vec::new(), handler));
        }
        QOpcode::ExPop => out.push(PendingInstr::fixed(POpcode::Xpop, Vec::new())),
        QOpcode::Gpub => {
            let name = encode_public(&instr.src1, used_idents);
            out.push(PendingInstr::fixed(POpcode::LdPub, pconcat(pb(encode_register(&instr.dst)), name)));
        }
        QOpcode::Spub => {
            let name = encode_public(&instr.dst, used_idents);
            let value = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::StPub, pconcat(name, value)));
        }
        QOpcode::Dpub => {
            let name = encode_public(&instr.dst, used_idents);
            out.push(PendingInstr::fixed(POpcode::DePub, name));
        }
        QOpcode::Iiter => {
            let src = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::Iiter, pconcat(pb(encode_register(&instr.dst)), src)));
        }
        QOpcode::Fmake => {
            let func = encode_function_index(&instr.src1);
            out.push(PendingInstr::fixed(POpcode::Fmake, pconcat(pb(encode_register(&instr.dst)), pb(func))));
        }
        QOpcode::Fbind => {
            let attr = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            let recv = materialize_and_encode(&instr.src2, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::Fbind, pconcat3(pb(encode_register(&instr.dst)), attr, recv)));
        }
        QOpcode::Mlist => out.push(PendingInstr::fixed(POpcode::Mlist, pb(encode_register(&instr.dst)))),
        QOpcode::Ndict => out.push(PendingInstr::fixed(POpcode::Ndict, pb(encode_register(&instr.dst)))),
        QOpcode::MlistP => {
            let base = encode_stack_ref(&instr.src1);
            let end = encode_stack_ref(&instr.src2);
            out.push(PendingInstr::fixed(POpcode::MlistP, pconcat3(pb(encode_register(&instr.dst)), pb(base), pb(end))));
        }
        QOpcode::Gbind => {
            let src = encode_register(&instr.src1);
            out.push(PendingInstr::fixed(POpcode::LdBind, pb(concat(encode_register(&instr.dst), src))));
        }
        QOpcode::Sbind => {
            let dst = encode_register(&instr.dst);
            let src = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::StBind, pconcat(pb(dst), src)));
        }
        QOpcode::Spread => {
            let src = materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::Lspr, src));
        }
        QOpcode::StkEq => {
            let n = encode_unsigned(&instr.src1);
            out.push(PendingInstr::fixed(POpcode::Cstk, pb(n)));
        }
        QOpcode::StkGe => {
            let n = encode_unsigned(&instr.src1);
            out.push(PendingInstr::fixed(POpcode::CstkG, pb(n)));
        }
        QOpcode::Wpush => {
            let prior = materialize_and_encode(&instr.dst, used_strings, used_idents, next_temp, out);
            out.push(PendingInstr::fixed(POpcode::StWith, prior));
        }
        QOpcode::Wpop => {
            let n = encode_unsigned(&instr.dst);
            out.push(PendingInstr::fixed(POpcode::Wpop, pb(n)));
        }
        QOpcode::Inext | QOpcode::InextS => {
            let (op, has_dst) = if instr.op == QOpcode::Inext { (POpcode::Inext, true) } else { (POpcode::InextS, false) };
            let iter = pb(encode_register(&instr.src1));
            let exit = jump_payload_placeholder(&instr.src2, f);
            let prefix = if has_dst { pconcat(pb(encode_register(&instr.dst)), iter) } else { iter };
            out.push(PendingInstr::with_jump(op, prefix, exit));
        }
        QOpcode::Fcall | QOpcode::Dcall | QOpcode::Ftail | QOpcode::Dtail => lower_call(instr, used_strings, used_idents, next_temp, out),
        _ => unreachable!("lower_one: unhandled opcode {:?}", instr.op),
    }
}

fn lower_jump(instr: &QInstr, jump_idx: u8, f: &QFunction, out: &mut Vec<PendingInstr>) {
    let label_operand = if jump_idx == 1 { &instr.src1 } else { &instr.src2 };
    let target = jump_payload_placeholder(label_operand, f);
    match instr.op {
        QOpcode::Jmp => out.push(PendingInstr::with_jump(POpcode::Jmp, Vec::new(), target)),
        QOpcode::Ift => {
            let cond = pb(encode_register(&instr.src1));
            out.push(PendingInstr::with_jump(POpcode::Ift, cond, target));
        }
        QOpcode::Iff => {
            let cond = pb(encode_register(&instr.src1));
            out.push(PendingInstr::with_jump(POpcode::Iff, cond, target));
        }
        other => unreachable!("lower_jump called for non-jump opcode {other:?}"),
    }
}

/// Translate a `QOperand::Label` into the Q-instruction index it
/// resolves to (the per-function label table already holds instruction
/// indices by the time the optimizer hands off to the lowerer).
fn jump_payload_placeholder(op: &QOperand, f: &QFunction) -> usize {
    match op {
        QOperand::Label(l) => {
            let idx = f.labels[*l as usize];
            if idx == u32::MAX {
                f.instructions.len()
            } else {
                idx as usize
            }
        }
        other => unreachable!("expected a jump label operand, got {other:?}"),
    }
}

fn lower_call(instr: &QInstr, used_strings: &mut [bool], used_idents: &mut [bool], next_temp: &mut u32, out: &mut Vec<PendingInstr>) {
    let is_tail = matches!(instr.op, QOpcode::Ftail | QOpcode::Dtail);
    let is_direct = matches!(instr.op, QOpcode::Dcall | QOpcode::Dtail);
    let stack_sink = matches!(instr.dst, QOperand::StackPush);

    let callee = if is_direct {
        pb(encode_function_index(&instr.src1))
    } else {
        materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out)
    };

    let op = match (is_direct, is_tail, stack_sink) {
        (true, true, _) => POpcode::Dtail,
        (false, true, _) => POpcode::Ftail,
        (true, false, true) => POpcode::DcallS,
        (true, false, false) => POpcode::Dcall,
        (false, false, true) => POpcode::FcallS,
        (false, false, false) => POpcode::Fcall,
    };
    let prefix = if stack_sink || is_tail { callee } else { pconcat(pb(encode_register(&instr.dst)), callee) };
    out.push(PendingInstr::fixed(op, prefix));
}

// ---- binary / unary arithmetic opcode selection ---------------------------

fn is_binop(op: QOpcode) -> bool {
    use QOpcode::*;
    matches!(op, Add | Sub | Mul | Div | Idiv | Mod | Shl | Shr | Cat | And | Or | Xor | Ceq | Clt)
}

fn is_unop(op: QOpcode) -> bool {
    use QOpcode::*;
    matches!(op, Upos | Uneg | Uxor | Lnot)
}

/// Binary operations pick one of the `_RR`/`_RL`/`_LR`/`_LL` opcode forms
/// by whether each source is a register or fits a 16-bit signed
/// immediate (§4.7, "Opcode selection"); a literal that doesn't fit is
/// materialized into a temp first, so only the fitting case ever reaches
/// the `_L` forms.
fn lower_binop(instr: &QInstr, used_strings: &mut [bool], used_idents: &mut [bool], next_temp: &mut u32, out: &mut Vec<PendingInstr>) {
    let (op1, imm1) = classify_source(&instr.src1);
    let (op2, imm2) = classify_source(&instr.src2);
    let a = if let Some(i) = imm1 { pb(encode_imm16(i)) } else { materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out) };
    let b = if let Some(i) = imm2 { pb(encode_imm16(i)) } else { materialize_and_encode(&instr.src2, used_strings, used_idents, next_temp, out) };
    let _ = (op1, op2);
    let variant = binop_variant(instr.op, imm1.is_some(), imm2.is_some());
    out.push(PendingInstr::fixed(variant, pconcat3(pb(encode_register(&instr.dst)), a, b)));
}

fn lower_unop(instr: &QInstr, used_strings: &mut [bool], used_idents: &mut [bool], next_temp: &mut u32, out: &mut Vec<PendingInstr>) {
    let (_, imm) = classify_source(&instr.src1);
    let src = if let Some(i) = imm { pb(encode_imm16(i)) } else { materialize_and_encode(&instr.src1, used_strings, used_idents, next_temp, out) };
    let variant = unop_variant(instr.op, imm.is_some());
    out.push(PendingInstr::fixed(variant, pconcat(pb(encode_register(&instr.dst)), src)));
}

/// Whether `op` is a register (false) or a literal that fits a 16-bit
/// signed immediate (`Some(value)`); any other literal kind (float,
/// string, null, bool, or an out-of-range int) is reported as "not an
/// immediate" so the caller materializes it.
fn classify_source(op: &QOperand) -> (bool, Option<i16>) {
    match op {
        QOperand::Int(v) if i16::try_from(*v).is_ok() => (false, Some(*v as i16)),
        _ => (op.is_register(), None),
    }
}

fn binop_variant(op: QOpcode, imm1: bool, imm2: bool) -> POpcode {
    use QOpcode::*;
    let family: [POpcode; 4] = match op {
        Add => [POpcode::AddRR, POpcode::AddRL, POpcode::AddLR, POpcode::AddLL],
        Sub => [POpcode::SubRR, POpcode::SubRL, POpcode::SubLR, POpcode::SubLL],
        Mul => [POpcode::MulRR, POpcode::MulRL, POpcode::MulLR, POpcode::MulLL],
        Div => [POpcode::DivRR, POpcode::DivRL, POpcode::DivLR, POpcode::DivLL],
        Idiv => [POpcode::IdivRR, POpcode::IdivRL, POpcode::IdivLR, POpcode::IdivLL],
        Mod => [POpcode::ModRR, POpcode::ModRL, POpcode::ModLR, POpcode::ModLL],
        Shl => [POpcode::ShlRR, POpcode::ShlRL, POpcode::ShlLR, POpcode::ShlLL],
        Shr => [POpcode::ShrRR, POpcode::ShrRL, POpcode::ShrLR, POpcode::ShrLL],
        Cat => [POpcode::CatRR, POpcode::CatRL, POpcode::CatLR, POpcode::CatLL],
        And => [POpcode::AndRR, POpcode::AndRL, POpcode::AndLR, POpcode::AndLL],
        Or => [POpcode::BorRR, POpcode::BorRL, POpcode::BorLR, POpcode::BorLL],
        Xor => [POpcode::XorRR, POpcode::XorRL, POpcode::XorLR, POpcode::XorLL],
        Ceq => [POpcode::CeqRR, POpcode::CeqRL, POpcode::CeqLR, POpcode::CeqLL],
        Clt => [POpcode::CltRR, POpcode::CltRL, POpcode::CltLR, POpcode::CltLL],
        other => unreachable!("binop_variant: not a binary opcode {other:?}"),
    };
    match (imm1, imm2) {
        (false, false) => family[0],
        (false, true) => family[1],
        (true, false) => family[2],
        (true, true) => family[3],
    }
}

fn unop_variant(op: QOpcode, imm: bool) -> POpcode {
    use QOpcode::*;
    match (op, imm) {
        (Lnot, false) => POpcode::LnotR,
        (Lnot, true) => POpcode::LnotL,
        (Upos, false) => POpcode::UposR,
        (Upos, true) => POpcode::UposL,
        (Uneg, false) => POpcode::UnegR,
        (Uneg, true) => POpcode::UnegL,
        (Uxor, false) => POpcode::UxorR,
        (Uxor, true) => POpcode::UxorL,
        other => unreachable!("unop_variant: not a unary opcode {other:?}"),
    }
}

// ---- operand encoding ------------------------------------------------------

fn concat(mut a: Vec<u8>, b: Vec<u8>) -> Vec<u8> {
    a.extend(b);
    a
}

/// Register kind tag, prefixed before the [`REGW`]-byte CLQ index so a
/// single byte stream can distinguish the four register spaces (§3,
/// "Q-operand").
fn encode_register(op: &QOperand) -> Vec<u8> {
    let (kind, idx) = match op {
        QOperand::Temp(i) => (0u8, *i),
        QOperand::Local(i) => (1u8, *i),
        QOperand::Exhale(i) => (2u8, *i),
        QOperand::Inhale(i) => (3u8, *i),
        other => unreachable!("expected a register operand, got {other:?}"),
    };
    let mut out = vec![kind];
    encode_clq(idx as u64, REGW, &mut out);
    out
}

fn encode_register_or_materialize(op: &QOperand, used_strings: &mut [bool], used_idents: &mut [bool], next_temp: &mut u32, out: &mut Vec<PendingInstr>) -> Vec<Part> {
    if op.is_register() {
        pb(encode_register(op))
    } else {
        materialize_and_encode(op, used_strings, used_idents, next_temp, out)
    }
}

fn encode_imm16(v: i16) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

/// An attribute/dict-key name: always a `StrIdent`, i.e. an identifier
/// sourced from the identifier pool (§3, "str-ident").
fn encode_str_ident(op: &QOperand, used_idents: &mut [bool]) -> Vec<Part> {
    let idx = match op {
        QOperand::StrIdent(i) => *i,
        other => unreachable!("expected a str-ident operand, got {other:?}"),
    };
    mark_used(used_idents, idx);
    vec![Part::Id(idx)]
}

fn encode_public(op: &QOperand, used_idents: &mut [bool]) -> Vec<Part> {
    let idx = match op {
        QOperand::Public(i) => *i,
        other => unreachable!("expected a public-name operand, got {other:?}"),
    };
    mark_used(used_idents, idx);
    vec![Part::Id(idx)]
}

fn encode_function_index(op: &QOperand) -> Vec<u8> {
    let idx = match op {
        QOperand::Function(i) => *i,
        other => unreachable!("expected a function operand, got {other:?}"),
    };
    let mut out = Vec::new();
    encode_vlq_size(idx as u64, &mut out);
    out
}

fn encode_unsigned(op: &QOperand) -> Vec<u8> {
    let v = match op {
        QOperand::Unsigned(v) => *v,
        other => unreachable!("expected an unsigned-immediate operand, got {other:?}"),
    };
    let mut out = Vec::new();
    encode_vlq_size(v as u64, &mut out);
    out
}

fn encode_stack_ref(op: &QOperand) -> Vec<u8> {
    let (tag, n) = match op {
        QOperand::Stack(StackRef::FromBase(n)) => (0u8, *n),
        QOperand::Stack(StackRef::FromEnd(n)) => (1u8, *n),
        other => unreachable!("expected a stack-reference operand, got {other:?}"),
    };
    let mut out = vec![tag];
    encode_vlq_size(n as u64, &mut out);
    out
}

fn mark_used(used: &mut [bool], idx: u32) {
    if (idx as usize) < used.len() {
        used[idx as usize] = true;
    }
}

/// Materialize any non-register, non-immediate operand into a fresh temp
/// via the appropriate `LD*` opcode, emitting that load as a preceding
/// instruction, and return the register-encoded reference to it (§4.7,
/// "Opcode selection").
fn materialize_and_encode(op: &QOperand, used_strings: &mut [bool], used_idents: &mut [bool], next_temp: &mut u32, out: &mut Vec<PendingInstr>) -> Vec<Part> {
    if op.is_register() {
        return pb(encode_register(op));
    }
    let t = *next_temp;
    *next_temp += 1;
    let dst = encode_register(&QOperand::Temp(t));
    let load = match op {
        QOperand::Int(v) => {
            let mut payload = Vec::new();
            encode_vlq_int(*v, &mut payload);
            PendingInstr::fixed(POpcode::LdInt, pb(concat(dst.clone(), payload)))
        }
        QOperand::Float(v) => PendingInstr::fixed(POpcode::LdFlt, pb(concat(dst.clone(), v.to_le_bytes().to_vec()))),
        QOperand::Str(i) => {
            mark_used(used_strings, *i);
            PendingInstr::fixed(POpcode::LdStr, pconcat(pb(dst.clone()), vec![Part::Str(*i)]))
        }
        QOperand::StrIdent(i) => {
            mark_used(used_idents, *i);
            PendingInstr::fixed(POpcode::LdStr, pconcat(pb(dst.clone()), vec![Part::Id(*i)]))
        }
        QOperand::Null => PendingInstr::fixed(POpcode::LdNul, pb(dst.clone())),
        QOperand::True => PendingInstr::fixed(POpcode::LdBlT, pb(dst.clone())),
        QOperand::False => PendingInstr::fixed(POpcode::LdBlF, pb(dst.clone())),
        QOperand::Stack(_) => {
            let payload = encode_stack_ref(op);
            PendingInstr::fixed(POpcode::LdStkN, pb(concat(dst.clone(), payload)))
        }
        other => unreachable!("materialize_and_encode: cannot materialize {other:?}"),
    };
    out.push(load);
    pb(dst)
}

// ---- jump width selection & emission ---------------------------------------

/// Select the smallest `w in {1,2,3,4}` CLQ width that covers every jump
/// target in `instrs`, by fixed-point iteration: widening `w` can only
/// grow jump-carrying instructions, which can only push targets further
/// out, so the search is monotonic and converges within
/// [`JUMP_WIDTH_MAX_TRIES`] (§4.7, "Jump width").
fn choose_jump_width(instrs: &[LoweredInstr]) -> u8 {
    let mut w = 1u8;
    for _ in 0..JUMP_WIDTH_MAX_TRIES {
        let offsets = instruction_offsets(instrs, w);
        let max_target_offset = instrs
            .iter()
            .filter_map(|i| i.jump_target)
            .map(|t| *offsets.get(t).unwrap_or(&(*offsets.last().unwrap_or(&0))))
            .max()
            .unwrap_or(0);
        let needed = min_clq_width(max_target_offset as u64);
        if needed <= w {
            return w;
        }
        w = needed;
    }
    w
}

fn instruction_offsets(instrs: &[LoweredInstr], jump_width: u8) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(instrs.len() + 1);
    let mut pos = 0u32;
    for i in instrs {
        offsets.push(pos);
        pos += i.len(jump_width) as u32;
    }
    offsets.push(pos);
    offsets
}

fn emit_function_bytes(instrs: &[LoweredInstr], jump_width: u8, out: &mut Vec<u8>) {
    let offsets = instruction_offsets(instrs, jump_width);
    for instr in instrs {
        out.push(instr.op as u8);
        out.extend_from_slice(&instr.prefix);
        if let Some(target) = instr.jump_target {
            let target_offset = offsets[target];
            encode_clq(target_offset as u64, jump_width, out);
        }
    }
}

// ---- string/identifier pool merge -------------------------------------------

fn count_pool_entries(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == 0).count()
}

fn split_nul_terminated(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == 0 {
            out.push(&bytes[start..i]);
            start = i + 1;
        }
    }
    out
}

/// Merge the string-literal pool and the identifier pool into the single
/// output pool the bytecode's `Str`/`StrIdent`/`Public`/function-name
/// references all index into (§3, "Identifiers and strings share the
/// same pool"; §4.7, "Pool emission" and "Deletion of unused literals").
/// Entries not marked used anywhere (including by instructions the
/// optimizer later deleted — `used` reflects only surviving references)
/// are omitted. String-literal entries come first, keeping their
/// relative order, followed by identifier entries; both remap tables
/// translate original ordinals into this single numbering.
fn merge_pools(str_bytes: &[u8], used_strings: &[bool], id_bytes: &[u8], used_idents: &[bool]) -> (HashMap<u32, u32>, HashMap<u32, u32>, Vec<u8>) {
    let mut out = Vec::new();
    let mut next_idx = 0u32;

    let mut str_remap = HashMap::new();
    for (old_idx, entry) in split_nul_terminated(str_bytes).iter().enumerate() {
        if used_strings.get(old_idx).copied().unwrap_or(false) {
            str_remap.insert(old_idx as u32, next_idx);
            out.extend_from_slice(entry);
            out.push(0);
            next_idx += 1;
        }
    }

    let mut id_remap = HashMap::new();
    for (old_idx, entry) in split_nul_terminated(id_bytes).iter().enumerate() {
        if used_idents.get(old_idx).copied().unwrap_or(false) {
            id_remap.insert(old_idx as u32, next_idx);
            out.extend_from_slice(entry);
            out.push(0);
            next_idx += 1;
        }
    }

    (str_remap, id_remap, out)
}

// ---- data_bytes serialization -----------------------------------------------

fn serialize_data(pool: &[u8], headers: &[FunctionHeader]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(Program::VERSION);
    encode_vlq_size(pool.len() as u64, &mut out);
    out.extend_from_slice(pool);
    encode_vlq_size(headers.len() as u64, &mut out);
    for h in headers {
        encode_vlq_size(h.arg_count as u64, &mut out);
        encode_vlq_size(h.optional_arg_count as u64, &mut out);
        encode_vlq_size(h.temp_count as u64, &mut out);
        encode_vlq_size(h.local_count as u64, &mut out);
        encode_vlq_size(h.exhale_count as u64, &mut out);
        encode_vlq_size(h.inhale_count as u64, &mut out);
        encode_vlq_size(h.entry_offset as u64, &mut out);
        if h.name_pool_offset == FUNC_NONAME {
            out.push(0);
        } else {
            out.push(1);
            encode_vlq_size(h.name_pool_offset as u64, &mut out);
        }
        out.push(h.jump_width);
        encode_vlq_size(h.inhale_sources.len() as u64, &mut out);
        for (is_exhale, idx) in &h.inhale_sources {
            out.push(if *is_exhale { 1 } else { 0 });
            encode_vlq_size(*idx as u64, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillc_core::qfunction::QFunction;

    fn simple_function() -> QFunction {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions.push(QInstr::new(QOpcode::Mov, QOperand::Local(0), QOperand::Int(7), QOperand::None, 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.local_count = 1;
        f
    }

    #[test]
    fn lowering_a_trivial_function_produces_nonempty_code() {
        let mut code = QCode::new(1);
        code.functions.push(simple_function());
        let program = lower(&code);
        assert!(!program.code.is_empty());
        assert!(!program.data.is_empty());
        assert_eq!(program.data[0], Program::VERSION);
    }

    /// Every jump target decodes to the start offset of some instruction
    /// in the same function (§8, testable property 5).
    #[test]
    fn jump_targets_land_on_instruction_boundaries() {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        // jmp L0; end; end (label 0 -> last instr)
        f.instructions.push(QInstr::new(QOpcode::Jmp, QOperand::None, QOperand::Label(0), QOperand::None, 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.labels.push(1);

        let mut used_strings = vec![];
        let mut used_idents = vec![];
        let (pending, _) = lower_function_body(&f, &mut used_strings, &mut used_idents);
        let lowered: Vec<LoweredInstr> =
            pending.into_iter().map(|p| LoweredInstr { op: p.op, prefix: resolve_parts(&p.parts, &HashMap::new(), &HashMap::new()), jump_target: p.jump_target }).collect();
        let w = choose_jump_width(&lowered);
        let offsets = instruction_offsets(&lowered, w);
        let mut boundaries: std::collections::HashSet<u32> = offsets.iter().copied().collect();
        boundaries.insert(*offsets.last().unwrap());

        let mut code_bytes = Vec::new();
        emit_function_bytes(&lowered, w, &mut code_bytes);

        // The Jmp instruction is first; decode its target and confirm it
        // lands on a recorded instruction boundary.
        let target = quillc_core::codec::decode_clq(w, &code_bytes[1..]);
        assert!(boundaries.contains(&(target as u32)));
    }

    #[test]
    fn large_int_literal_is_materialized_not_embedded() {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions.push(QInstr::new(QOpcode::Mov, QOperand::Local(0), QOperand::Int(1_000_000), QOperand::None, 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.local_count = 1;
        let mut used_strings = vec![];
        let mut used_idents = vec![];
        let (pending, temp_count) = lower_function_body(&f, &mut used_strings, &mut used_idents);
        // One synthetic LdInt instruction plus the Mov plus Exit0.
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].op, POpcode::LdInt);
        assert!(temp_count > f.temp_count);
    }

    #[test]
    fn small_int_literal_embeds_as_immediate() {
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions.push(QInstr::new(QOpcode::Add, QOperand::Local(0), QOperand::Local(0), QOperand::Int(1), 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.local_count = 1;
        let mut used_strings = vec![];
        let mut used_idents = vec![];
        let (pending, _) = lower_function_body(&f, &mut used_strings, &mut used_idents);
        assert_eq!(pending[0].op, POpcode::AddRL);
    }

    #[test]
    fn string_pool_compacts_to_only_used_entries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"kept\0");
        bytes.extend_from_slice(b"dropped\0");
        let used = vec![true, false];
        let (remap, _, out) = merge_pools(&bytes, &used, &[], &[]);
        assert_eq!(remap.get(&0), Some(&0));
        assert_eq!(remap.get(&1), None);
        assert_eq!(out, b"kept\0");
    }

    #[test]
    fn identifier_pool_is_merged_after_strings() {
        let mut str_bytes = Vec::new();
        str_bytes.extend_from_slice(b"lit\0");
        let mut id_bytes = Vec::new();
        id_bytes.extend_from_slice(b"foo\0");
        id_bytes.extend_from_slice(b"bar\0");
        let (str_remap, id_remap, out) = merge_pools(&str_bytes, &[true], &id_bytes, &[true, true]);
        assert_eq!(str_remap.get(&0), Some(&0));
        assert_eq!(id_remap.get(&0), Some(&1));
        assert_eq!(id_remap.get(&1), Some(&2));
        assert_eq!(out, b"lit\0foo\0bar\0");
    }

    #[test]
    fn attribute_name_resolves_through_the_identifier_pool() {
        // A trivial function that loads attribute "bar" off local 0.
        let mut code = QCode::new(1);
        code.ident_pool_bytes = b"bar\0".to_vec();
        let mut f = QFunction::new(1, FUNC_NOPARENT);
        f.instructions.push(QInstr::new(QOpcode::Gattr, QOperand::Local(1), QOperand::Local(0), QOperand::StrIdent(0), 1));
        f.instructions.push(QInstr::bare(QOpcode::End, 1));
        f.local_count = 2;
        code.functions.push(f);

        let program = lower(&code);
        // data: version byte, pool length VLQ, pool bytes "bar\0", ...
        assert_eq!(program.data[0], Program::VERSION);
        let (pool_len, used) = quillc_core::codec::decode_vlq_size(&program.data[1..]);
        assert_eq!(pool_len, 4);
        assert_eq!(&program.data[1 + used..1 + used + 4], b"bar\0");
    }
}
