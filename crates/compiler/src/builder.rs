//! The Q-code builder (§4.3): allocates temp/local/exhale/inhale slots,
//! maintains the label table, and turns name references and literal
//! arithmetic straight into Q-instructions.
//!
//! This implementation takes the escape hatch spec.md's own design notes
//! offer (§9, "Peephole fusion through a one-instruction buffer"): rather
//! than a one-instruction lookahead buffer that fuses/retargets in place,
//! every sub-expression is emitted directly and temp-register reuse is
//! left entirely to the optimizer's coalescing pass (§4.6). Constant
//! folding still happens here, at the point an operation is about to be
//! emitted, exactly where spec.md's component table (§2) puts it ("embedded
//! in builder").

use crate::binding;
use crate::config::CompilerConfig;
use crate::error::{CompileError, SyntaxErrorTag};
use crate::scope::{BindKind, ScopeBook};
use quillc_core::instr::{QInstr, QOpcode};
use quillc_core::operand::{QOperand, StackRef};
use quillc_core::qfunction::{QCode, QFunction, FUNC_NOPARENT};
use quillc_core::token::LexOut;
use std::collections::{BTreeSet, HashMap};

/// Top/exit label pair for the loop currently being compiled, used by
/// `break`/`continue`.
#[derive(Debug, Clone, Copy)]
pub struct LoopLabels {
    pub top: u32,
    pub exit: u32,
    /// With-scope depth at loop entry, so `break`/`continue` know how
    /// many `WPOP`s to emit when unwinding across `with` scopes (§4.3,
    /// "break/continue").
    pub with_depth_at_entry: u32,
}

/// One function under construction: the Q-function it is building plus
/// the builder-local bookkeeping that doesn't belong in the IR itself.
pub struct FuncFrame {
    /// This function's own index in the program's function table, set by
    /// the builder once the frame is pushed. Frames built directly by
    /// tests (outside the builder) leave this at `0`.
    pub index: u32,
    pub qf: QFunction,
    pub book: ScopeBook,
    pub loop_labels: Vec<LoopLabels>,
    pub with_depth: u32,
    pub pushf_depth: u32,
    /// Arguments promoted to exhale, local index -> exhale index,
    /// consulted by `close_function` to emit the prologue (§4.4,
    /// "Argument promotion").
    pub arg_exh: HashMap<u32, u32>,
}

impl FuncFrame {
    pub fn new(line: u32, parent_index: u32) -> Self {
        FuncFrame {
            index: 0,
            qf: QFunction::new(line, parent_index),
            book: ScopeBook::new(),
            loop_labels: Vec::new(),
            with_depth: 0,
            pushf_depth: 0,
            arg_exh: HashMap::new(),
        }
    }

    pub fn alloc_temp(&mut self) -> u32 {
        let t = self.qf.temp_count;
        self.qf.temp_count += 1;
        t
    }

    pub fn alloc_local(&mut self) -> u32 {
        let l = self.qf.local_count;
        self.qf.local_count += 1;
        l
    }

    pub fn alloc_exhale(&mut self) -> u32 {
        let e = self.qf.exhale_count;
        self.qf.exhale_count += 1;
        e
    }

    pub fn alloc_inhale(&mut self) -> u32 {
        let i = self.qf.inhale_count;
        self.qf.inhale_count += 1;
        i
    }

    /// Remove a non-argument local's slot entirely after it has been
    /// promoted to exhale (§4.4 step 2): every later local shifts down
    /// by one, in both the function's count and the book.
    pub fn remove_local_slot(&mut self, local_idx: u32) {
        self.qf.local_count -= 1;
        self.book.shift_locals_down_from(local_idx);
        for instr in self.qf.instructions.iter_mut() {
            shift_operand(&mut instr.dst, local_idx);
            shift_operand(&mut instr.src1, local_idx);
            shift_operand(&mut instr.src2, local_idx);
        }
    }

    pub fn emit(&mut self, op: QOpcode, dst: QOperand, src1: QOperand, src2: QOperand, line: u32) {
        self.qf.instructions.push(QInstr::new(op, dst, src1, src2, line));
    }

    pub fn new_label(&mut self) -> u32 {
        self.qf.new_label()
    }

    pub fn set_label(&mut self, label: u32) {
        self.qf.set_label(label);
    }
}

fn shift_operand(op: &mut QOperand, removed_idx: u32) {
    if let QOperand::Local(l) = op {
        if *l > removed_idx {
            *l -= 1;
        }
    }
}

/// Where an expression's result currently lives, mirroring spec §4.3's
/// value-state machine — represented here as a return value threaded
/// through expression-compiling calls rather than mutable builder state,
/// per the same simplification permission as the peephole buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueState {
    /// No value (statement context).
    None,
    /// A concrete operand: register, literal, or public/bind reference.
    Value(QOperand),
    /// Value(s) already pushed onto the current frame-stack.
    Stack,
    /// Value(s) are a call's return sitting on the frame-stack, not yet
    /// individually addressed.
    FuncStack,
}

pub struct Builder {
    frames: Vec<FuncFrame>,
    finished: Vec<(u32, QFunction)>,
    next_index: u32,
    pub config: CompilerConfig,
    expr_depth: usize,
    /// String-pool ordinals referenced by an emitted `Str` operand so
    /// far, used to prune the pool at [`Builder::finish`] (§3,
    /// "Identifier and string pools").
    used_strings: BTreeSet<u32>,
}

impl Builder {
    pub fn new(config: CompilerConfig) -> Self {
        Builder {
            frames: Vec::new(),
            finished: Vec::new(),
            next_index: 0,
            config,
            expr_depth: 0,
            used_strings: BTreeSet::new(),
        }
    }

    /// Reference a string-literal pool entry, marking it used and
    /// returning the operand the parser should emit.
    pub fn string_literal(&mut self, pool_index: u32) -> QOperand {
        self.used_strings.insert(pool_index);
        QOperand::Str(pool_index)
    }

    pub fn open_function(&mut self, line: u32) -> u32 {
        let idx = self.next_index;
        self.next_index += 1;
        let parent = self.frames.last().map(|f| f.index).unwrap_or(FUNC_NOPARENT);
        let book = match self.frames.last() {
            Some(parent_frame) => ScopeBook::child_of(&parent_frame.book),
            None => ScopeBook::new(),
        };
        let mut frame = FuncFrame::new(line, parent);
        frame.index = idx;
        frame.book = book;
        self.frames.push(frame);
        idx
    }

    /// Index of the function currently being built.
    pub fn current_index(&self) -> u32 {
        self.frame_ref().index
    }

    pub fn enter_expr(&mut self, line: u32) -> Result<(), CompileError> {
        self.expr_depth += 1;
        if self.expr_depth > self.config.max_nesting {
            return Err(CompileError::too_deep("expression nesting exceeds the configured limit", line));
        }
        Ok(())
    }

    pub fn exit_expr(&mut self) {
        self.expr_depth -= 1;
    }

    pub fn frame(&mut self) -> &mut FuncFrame {
        self.frames.last_mut().expect("builder: no open function frame")
    }

    pub fn frame_ref(&self) -> &FuncFrame {
        self.frames.last().expect("builder: no open function frame")
    }

    pub fn alloc_temp(&mut self) -> u32 {
        self.frame().alloc_temp()
    }

    pub fn emit(&mut self, op: QOpcode, dst: QOperand, src1: QOperand, src2: QOperand, line: u32) {
        self.frame().emit(op, dst, src1, src2, line);
    }

    pub fn new_label(&mut self) -> u32 {
        self.frame().new_label()
    }

    pub fn set_label(&mut self, label: u32) {
        self.frame().set_label(label);
    }

    pub fn declare_local(&mut self, ident: u32) -> u32 {
        let idx = self.frame().alloc_local();
        self.frame().book.declare_local(ident, idx);
        idx
    }

    pub fn declare_argument(&mut self, ident: u32) -> u32 {
        let idx = self.declare_local(ident);
        self.frame().qf.arg_count += 1;
        idx
    }

    pub fn declare_public(&mut self, ident: u32) {
        self.frame().book.declare_public(ident);
    }

    pub fn is_local_name(&self, ident: u32) -> bool {
        matches!(self.frame_ref().book.lookup(ident), Some(BindKind::Local(_)))
    }

    /// Resolve `ident` to a concrete kind in the current frame, running
    /// the binding resolver if it is still a `Bindable` placeholder.
    fn resolve(&mut self, ident: u32, line: u32) -> Option<BindKind> {
        match self.frame_ref().book.lookup(ident) {
            Some(BindKind::Bindable { depth }) => {
                let operand = binding::resolve_binding(&mut self.frames, ident, depth, line);
                match operand {
                    QOperand::Inhale(i) => Some(BindKind::Inhale(i)),
                    other => unreachable!("binding resolver must return an Inhale operand, got {other:?}"),
                }
            }
            other => other,
        }
    }

    /// Compile a read of `ident`, returning an operand usable directly
    /// as a source (§4.3, assignment/expression semantics).
    pub fn read_name(&mut self, ident: u32, line: u32) -> Result<QOperand, CompileError> {
        match self.resolve(ident, line) {
            Some(BindKind::Local(i)) => Ok(QOperand::Local(i)),
            Some(BindKind::Public) => {
                let t = self.alloc_temp();
                self.emit(QOpcode::Gpub, QOperand::Temp(t), QOperand::Public(ident), QOperand::None, line);
                Ok(QOperand::Temp(t))
            }
            Some(BindKind::Exhale(i)) => {
                let t = self.alloc_temp();
                self.emit(QOpcode::Gbind, QOperand::Temp(t), QOperand::Exhale(i), QOperand::None, line);
                Ok(QOperand::Temp(t))
            }
            Some(BindKind::Inhale(i)) => {
                let t = self.alloc_temp();
                self.emit(QOpcode::Gbind, QOperand::Temp(t), QOperand::Inhale(i), QOperand::None, line);
                Ok(QOperand::Temp(t))
            }
            Some(BindKind::Bindable { .. }) => unreachable!("resolved above"),
            None => Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "reference to undefined name", line)),
        }
    }

    /// Compile an assignment of `value` to `ident`, declaring it as a
    /// fresh local if it is not yet known (implicit local declaration on
    /// first assignment, this implementation's resolution of an
    /// otherwise-silent spec gap — see DESIGN.md).
    pub fn assign_name(&mut self, ident: u32, value: QOperand, line: u32) -> Result<(), CompileError> {
        let kind = match self.resolve(ident, line) {
            Some(k) => k,
            None => BindKind::Local(self.declare_local(ident)),
        };
        match kind {
            BindKind::Local(i) => self.emit(QOpcode::Mov, QOperand::Local(i), value, QOperand::None, line),
            BindKind::Public => self.emit(QOpcode::Spub, QOperand::Public(ident), value, QOperand::None, line),
            BindKind::Exhale(i) => self.emit(QOpcode::Sbind, QOperand::Exhale(i), value, QOperand::None, line),
            BindKind::Inhale(i) => self.emit(QOpcode::Sbind, QOperand::Inhale(i), value, QOperand::None, line),
            BindKind::Bindable { .. } => unreachable!("resolved above"),
        }
        Ok(())
    }

    pub fn enter_loop(&mut self, top: u32, exit: u32) {
        let with_depth_at_entry = self.frame_ref().with_depth;
        self.frame().loop_labels.push(LoopLabels { top, exit, with_depth_at_entry });
    }

    pub fn exit_loop(&mut self) {
        self.frame().loop_labels.pop();
    }

    pub fn current_loop(&self) -> Option<LoopLabels> {
        self.frame_ref().loop_labels.last().copied()
    }

    pub fn enter_with(&mut self) {
        self.frame().with_depth += 1;
    }

    pub fn exit_with(&mut self, line: u32) {
        self.frame().with_depth -= 1;
        self.emit(QOpcode::Wpop, QOperand::Unsigned(1), QOperand::None, QOperand::None, line);
    }

    pub fn with_depth(&self) -> u32 {
        self.frame_ref().with_depth
    }

    /// Unwind every `with` scope a `break`/`continue` jumps out of, in one
    /// instruction carrying the count (§4.3, "break/continue").
    pub fn unwind_with_to(&mut self, target_depth: u32, line: u32) {
        let current = self.with_depth();
        if current > target_depth {
            self.emit(QOpcode::Wpop, QOperand::Unsigned(current - target_depth), QOperand::None, QOperand::None, line);
        }
    }

    pub fn push_frame_stack(&mut self, line: u32) {
        self.frame().pushf_depth += 1;
        self.emit(QOpcode::Pushf, QOperand::Unsigned(0), QOperand::None, QOperand::None, line);
    }

    pub fn pop_frame_stack(&mut self, line: u32) {
        self.frame().pushf_depth -= 1;
        self.emit(QOpcode::Popf, QOperand::None, QOperand::None, QOperand::None, line);
    }

    pub fn push_value(&mut self, value: QOperand, line: u32) {
        self.emit(QOpcode::Push, QOperand::None, value, QOperand::None, line);
    }

    /// Close the function currently on top of the frame stack: guarantee
    /// a trailing exit, prepend the argument-promotion prologue if any
    /// argument was captured, and move it into the finished table.
    pub fn close_function(&mut self) -> Result<(), CompileError> {
        let idx = self.current_index();
        let mut frame = self.frames.pop().expect("close_function: no open frame");

        let needs_trailing_end = match frame.qf.instructions.last() {
            Some(i) if i.op.is_exit() => false,
            _ => true,
        };
        if needs_trailing_end {
            let line = frame.qf.instructions.last().map(|i| i.line).unwrap_or(frame.qf.line);
            frame.qf.instructions.push(QInstr::bare(QOpcode::End, line));
        }

        if !frame.arg_exh.is_empty() {
            let line = frame.qf.line;
            let mut prologue = Vec::with_capacity(frame.arg_exh.len());
            let mut pairs: Vec<(u32, u32)> = frame.arg_exh.iter().map(|(&l, &e)| (l, e)).collect();
            pairs.sort_by_key(|(l, _)| *l);
            for (local_idx, exhale_idx) in pairs {
                prologue.push(QInstr::new(QOpcode::Sbind, QOperand::Exhale(exhale_idx), QOperand::Local(local_idx), QOperand::None, line));
            }
            let shift = prologue.len() as u32;
            for label in frame.qf.labels.iter_mut() {
                if *label != u32::MAX {
                    *label += shift;
                }
            }
            prologue.extend(frame.qf.instructions.drain(..));
            frame.qf.instructions = prologue;
        }

        self.finished.push((idx, frame.qf));
        Ok(())
    }

    /// Assemble every closed function into the final `QCode`, pruning
    /// the string-literal pool down to the ordinals this compilation
    /// actually referenced and remapping every `Str` operand to its
    /// compacted index. Identifier-pool compaction and `StrIdent` merge
    /// happen later, at lowering (§4.7).
    pub fn finish(mut self, first_line: u32, lex: &LexOut) -> QCode {
        assert!(self.frames.is_empty(), "finish called with open frames");
        self.finished.sort_by_key(|(idx, _)| *idx);
        let mut functions: Vec<QFunction> = self.finished.into_iter().map(|(_, f)| f).collect();

        let mut remap = HashMap::with_capacity(self.used_strings.len());
        let mut bytes = Vec::new();
        for (new_idx, old_idx) in self.used_strings.into_iter().enumerate() {
            remap.insert(old_idx, new_idx as u32);
            bytes.extend_from_slice(lex.string_pool.get(old_idx).as_bytes());
            bytes.push(0);
        }
        for f in functions.iter_mut() {
            for instr in f.instructions.iter_mut() {
                remap_str_operand(&mut instr.dst, &remap);
                remap_str_operand(&mut instr.src1, &remap);
                remap_str_operand(&mut instr.src2, &remap);
            }
        }

        let mut ident_bytes = Vec::new();
        for entry in lex.ident_pool.entries.iter() {
            ident_bytes.extend_from_slice(entry.as_bytes());
            ident_bytes.push(0);
        }

        let mut code = QCode::new(first_line);
        code.functions = functions;
        code.string_pool_bytes = bytes;
        code.ident_pool_bytes = ident_bytes;
        code
    }
}

fn remap_str_operand(op: &mut QOperand, remap: &HashMap<u32, u32>) {
    if let QOperand::Str(i) = op {
        *i = remap[i];
    }
}

/// Binary arithmetic/relational/bitwise operator, source level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Idiv,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Plus,
    Neg,
    BitNot,
    Not,
}

impl Builder {
    /// Compile a binary operation, folding it away entirely when both
    /// operands are literals and the fold doesn't require declining
    /// (overflow) — spec §4.3, "Literals and constant folding".
    pub fn binary_op(&mut self, op: BinOp, lhs: QOperand, rhs: QOperand, line: u32) -> QOperand {
        if let Some(folded) = fold_binary(op, &lhs, &rhs) {
            return folded;
        }
        let (qop, swapped) = match op {
            BinOp::Add => (QOpcode::Add, false),
            BinOp::Sub => (QOpcode::Sub, false),
            BinOp::Mul => (QOpcode::Mul, false),
            BinOp::Div => (QOpcode::Div, false),
            BinOp::Idiv => (QOpcode::Idiv, false),
            BinOp::Mod => (QOpcode::Mod, false),
            BinOp::Shl => (QOpcode::Shl, false),
            BinOp::Shr => (QOpcode::Shr, false),
            BinOp::BitAnd => (QOpcode::And, false),
            BinOp::BitOr => (QOpcode::Or, false),
            BinOp::BitXor => (QOpcode::Xor, false),
            BinOp::Concat => (QOpcode::Cat, false),
            BinOp::Eq => (QOpcode::Ceq, false),
            BinOp::Ne => (QOpcode::Ceq, false),
            BinOp::Lt => (QOpcode::Clt, false),
            BinOp::Gt => (QOpcode::Clt, true),
            BinOp::Le => (QOpcode::Clt, true),
            BinOp::Ge => (QOpcode::Clt, false),
        };
        let (a, b) = if swapped { (rhs, lhs) } else { (lhs, rhs) };
        let t = self.alloc_temp();
        self.emit(qop, QOperand::Temp(t), a, b, line);
        match op {
            BinOp::Ne | BinOp::Le | BinOp::Ge => {
                let t2 = self.alloc_temp();
                self.emit(QOpcode::Lnot, QOperand::Temp(t2), QOperand::Temp(t), QOperand::None, line);
                QOperand::Temp(t2)
            }
            _ => QOperand::Temp(t),
        }
    }

    pub fn unary_op(&mut self, op: UnOp, operand: QOperand, line: u32) -> QOperand {
        if let Some(folded) = fold_unary(op, &operand) {
            return folded;
        }
        let qop = match op {
            UnOp::Plus => QOpcode::Upos,
            UnOp::Neg => QOpcode::Uneg,
            UnOp::BitNot => QOpcode::Uxor,
            UnOp::Not => QOpcode::Lnot,
        };
        let t = self.alloc_temp();
        self.emit(qop, QOperand::Temp(t), operand, QOperand::None, line);
        QOperand::Temp(t)
    }

    /// Begin a short-circuit `and`: seed the shared result temp with
    /// `lhs` and jump to `end` if it is already falsy, skipping the RHS
    /// entirely. The caller compiles the RHS in between and finishes
    /// with [`Builder::finish_short_circuit`] — split in two phases
    /// because the RHS is source code the parser still has to consume,
    /// not a value the builder already has in hand.
    pub fn begin_short_circuit_and(&mut self, lhs: QOperand, line: u32) -> (u32, u32) {
        let result = self.alloc_temp();
        self.emit(QOpcode::Mov, QOperand::Temp(result), lhs, QOperand::None, line);
        let end = self.new_label();
        self.emit(QOpcode::Iff, QOperand::None, QOperand::Temp(result), QOperand::Label(end), line);
        (result, end)
    }

    /// Mirror image of [`Builder::begin_short_circuit_and`] for `or`.
    pub fn begin_short_circuit_or(&mut self, lhs: QOperand, line: u32) -> (u32, u32) {
        let result = self.alloc_temp();
        self.emit(QOpcode::Mov, QOperand::Temp(result), lhs, QOperand::None, line);
        let end = self.new_label();
        self.emit(QOpcode::Ift, QOperand::None, QOperand::Temp(result), QOperand::Label(end), line);
        (result, end)
    }

    pub fn finish_short_circuit(&mut self, result_temp: u32, rhs: QOperand, end_label: u32, line: u32) -> QOperand {
        self.emit(QOpcode::Mov, QOperand::Temp(result_temp), rhs, QOperand::None, line);
        self.set_label(end_label);
        QOperand::Temp(result_temp)
    }

    /// Move any operand into a fresh temp — used where the lowerer's
    /// opcode forms need a register in a position that currently holds a
    /// stack/label/placeholder operand.
    pub fn materialize(&mut self, value: QOperand, line: u32) -> QOperand {
        if value.is_register() {
            return value;
        }
        let t = self.alloc_temp();
        self.emit(QOpcode::Mov, QOperand::Temp(t), value, QOperand::None, line);
        QOperand::Temp(t)
    }

    pub fn stack_ref_from_base(n: u32) -> QOperand {
        QOperand::Stack(StackRef::FromBase(n))
    }

    pub fn stack_ref_from_end(n: u32) -> QOperand {
        QOperand::Stack(StackRef::FromEnd(n))
    }
}

/// Constant-fold a binary op when both sides are literals, declining
/// (returning `None`) when a signed integer overflow would occur rather
/// than silently truncating (§9, "Open question — integer overflow in
/// constant folding").
fn fold_binary(op: BinOp, lhs: &QOperand, rhs: &QOperand) -> Option<QOperand> {
    use QOperand::*;
    match (lhs, rhs) {
        (Int(a), Int(b)) => fold_int_binary(op, *a, *b),
        (Float(a), Float(b)) => fold_float_binary(op, *a, *b),
        (Int(a), Float(b)) => fold_float_binary(op, *a as f64, *b),
        (Float(a), Int(b)) => fold_float_binary(op, *a, *b as f64),
        _ => None,
    }
}

fn fold_int_binary(op: BinOp, a: i64, b: i64) -> Option<QOperand> {
    let v = match op {
        BinOp::Add => a.checked_add(b)?,
        BinOp::Sub => a.checked_sub(b)?,
        BinOp::Mul => a.checked_mul(b)?,
        BinOp::Shl => {
            if !(0..64).contains(&b) {
                return None;
            }
            a.checked_shl(b as u32)?
        }
        BinOp::Shr => {
            if !(0..64).contains(&b) {
                return None;
            }
            a.checked_shr(b as u32)?
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        BinOp::Eq => return Some(QOperand::from_bool(a == b)),
        BinOp::Ne => return Some(QOperand::from_bool(a != b)),
        BinOp::Lt => return Some(QOperand::from_bool(a < b)),
        BinOp::Le => return Some(QOperand::from_bool(a <= b)),
        BinOp::Gt => return Some(QOperand::from_bool(a > b)),
        BinOp::Ge => return Some(QOperand::from_bool(a >= b)),
        // Division/modulo folding is declined: divide-by-zero is a
        // runtime error in this language, not a compile error, and the
        // builder has no mandate to special-case it.
        BinOp::Div | BinOp::Idiv | BinOp::Mod | BinOp::Concat => return None,
    };
    Some(QOperand::Int(v))
}

fn fold_float_binary(op: BinOp, a: f64, b: f64) -> Option<QOperand> {
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Eq => return Some(QOperand::from_bool(a == b)),
        BinOp::Ne => return Some(QOperand::from_bool(a != b)),
        BinOp::Lt => return Some(QOperand::from_bool(a < b)),
        BinOp::Le => return Some(QOperand::from_bool(a <= b)),
        BinOp::Gt => return Some(QOperand::from_bool(a > b)),
        BinOp::Ge => return Some(QOperand::from_bool(a >= b)),
        _ => return None,
    };
    Some(QOperand::Float(v))
}

fn fold_unary(op: UnOp, operand: &QOperand) -> Option<QOperand> {
    match (op, operand) {
        (UnOp::Plus, QOperand::Int(_) | QOperand::Float(_)) => Some(operand.clone()),
        (UnOp::Neg, QOperand::Int(a)) => a.checked_neg().map(QOperand::Int),
        (UnOp::Neg, QOperand::Float(a)) => Some(QOperand::Float(-a)),
        (UnOp::BitNot, QOperand::Int(a)) => Some(QOperand::Int(!a)),
        (UnOp::Not, QOperand::True) => Some(QOperand::False),
        (UnOp::Not, QOperand::False) => Some(QOperand::True),
        (UnOp::Not, QOperand::Null) => Some(QOperand::True),
        _ => None,
    }
}

trait FromBool {
    fn from_bool(b: bool) -> Self;
}

impl FromBool for QOperand {
    fn from_bool(b: bool) -> Self {
        if b {
            QOperand::True
        } else {
            QOperand::False
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_builder() -> Builder {
        let mut b = Builder::new(CompilerConfig::default());
        b.open_function(1);
        b
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let mut b = new_builder();
        let v = b.binary_op(BinOp::Mul, QOperand::Int(2), QOperand::Int(3), 1);
        let v = b.binary_op(BinOp::Add, QOperand::Int(1), v, 1);
        assert_eq!(v, QOperand::Int(7));
        assert!(b.frame_ref().qf.instructions.is_empty());
    }

    #[test]
    fn overflow_declines_fold() {
        let mut b = new_builder();
        let v = b.binary_op(BinOp::Add, QOperand::Int(i64::MAX), QOperand::Int(1), 1);
        assert!(matches!(v, QOperand::Temp(_)));
        assert_eq!(b.frame_ref().qf.instructions.len(), 1);
    }

    #[test]
    fn local_declared_and_assigned() {
        let mut b = new_builder();
        let idx = b.declare_local(10);
        b.assign_name(10, QOperand::Int(5), 1).unwrap();
        assert_eq!(b.frame_ref().qf.instructions[0].dst, QOperand::Local(idx));
    }

    #[test]
    fn reading_undeclared_name_is_a_syntax_error() {
        let mut b = new_builder();
        let err = b.read_name(99, 3).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 3, .. }));
    }

    #[test]
    fn close_function_appends_trailing_end() {
        let mut b = new_builder();
        b.close_function().unwrap();
        let code = b.finish(1, &quillc_core::token::LexOut::default());
        assert_eq!(code.functions[0].instructions.last().unwrap().op, QOpcode::End);
    }

    #[test]
    fn relational_gt_swaps_operands_into_clt() {
        let mut b = new_builder();
        let lhs = QOperand::Local(b.declare_local(1));
        let rhs = QOperand::Local(b.declare_local(2));
        let v = b.binary_op(BinOp::Gt, lhs.clone(), rhs.clone(), 1);
        assert!(matches!(v, QOperand::Temp(_)));
        let instr = &b.frame_ref().qf.instructions[0];
        assert_eq!(instr.op, QOpcode::Clt);
        assert_eq!(instr.src1, rhs);
        assert_eq!(instr.src2, lhs);
    }
}
