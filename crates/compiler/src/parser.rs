//! Recursive-descent parser (§4.5): drives the [`crate::builder::Builder`]
//! directly from the token stream, one statement at a time. There is no
//! separate AST — every production either returns a [`QOperand`] (for
//! expressions) or emits directly and returns `()` (for statements),
//! matching how the builder's "emit as you parse" contract is described
//! in spec.md §2 ("calls the Q-code builder").

use crate::builder::{Builder, BinOp, LoopLabels, UnOp};
use crate::config::CompilerConfig;
use crate::error::{CompileError, SyntaxErrorTag};
use quillc_core::instr::QOpcode;
use quillc_core::operand::QOperand;
use quillc_core::qfunction::QFunctionFlags;
use quillc_core::token::{LexOut, Token, TokenStream, TokenTag};

/// Parse a complete token stream into optimizer-ready Q-code.
pub fn parse(lex: &LexOut, config: CompilerConfig) -> Result<quillc_core::qfunction::QCode, CompileError> {
    let mut parser = Parser {
        stream: TokenStream::new(lex.tokens.clone()),
        builder: Builder::new(config),
        depth: 0,
    };
    parser.parse_program()?;
    Ok(parser.builder.finish(lex.first_line, lex))
}

struct Parser {
    stream: TokenStream,
    builder: Builder,
    /// Recursive-descent depth, checked against `config.max_nesting`
    /// independent of the builder's own expression-depth counter so
    /// deeply nested statements (e.g. `if` inside `if` inside `while`)
    /// are caught too.
    depth: usize,
}

/// What a parsed postfix chain resolved to: a name/attribute/index that
/// can be an assignment target, or a plain value that cannot.
enum Place {
    Name(u32),
    Attr { obj: QOperand, name: u32, quiet: bool },
    Index { obj: QOperand, index: QOperand },
}

struct Parsed {
    place: Option<Place>,
    value: QOperand,
}

impl Parser {
    fn tok(&self) -> &Token {
        self.stream.peek()
    }

    fn line(&self) -> u32 {
        self.tok().line
    }

    fn is_sym(&self, s: &str) -> bool {
        self.tok().is_symbol(s)
    }

    fn eat_sym(&mut self, s: &str) -> bool {
        if self.is_sym(s) {
            self.stream.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, s: &str, tag: SyntaxErrorTag) -> Result<(), CompileError> {
        if self.eat_sym(s) {
            Ok(())
        } else {
            Err(CompileError::syntax(tag, format!("expected '{s}'"), self.line()))
        }
    }

    fn skip_newlines(&mut self) {
        while self.tok().tag == TokenTag::Newline {
            self.stream.advance();
        }
    }

    fn expect_identifier(&mut self) -> Result<u32, CompileError> {
        if self.tok().tag == TokenTag::Identifier {
            let idx = self.tok().pool_index;
            self.stream.advance();
            Ok(idx)
        } else {
            Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "expected an identifier", self.line()))
        }
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > self.builder.config.max_nesting {
            return Err(CompileError::too_deep("statement nesting exceeds the configured limit", self.line()));
        }
        Ok(())
    }

    fn exit(&mut self) {
        self.depth -= 1;
    }

    // ---- program / blocks --------------------------------------------

    fn parse_program(&mut self) -> Result<(), CompileError> {
        let first_line = self.line();
        self.builder.open_function(first_line);
        self.parse_block(&[])?;
        self.builder.close_function()
    }

    /// Parse statements until a token in `terminators` (checked as a
    /// keyword/symbol) or end-of-stream.
    fn parse_block(&mut self, terminators: &[&str]) -> Result<(), CompileError> {
        loop {
            self.skip_newlines();
            if self.stream.is_at_end() {
                return Ok(());
            }
            if terminators.iter().any(|t| self.is_sym(t)) {
                return Ok(());
            }
            self.parse_statement()?;
        }
    }

    // ---- statements ----------------------------------------------------

    fn parse_statement(&mut self) -> Result<(), CompileError> {
        self.enter()?;
        let result = self.parse_statement_inner();
        self.exit();
        result
    }

    fn parse_statement_inner(&mut self) -> Result<(), CompileError> {
        if self.is_sym("if") {
            return self.parse_if();
        }
        if self.is_sym("while") {
            return self.parse_while();
        }
        if self.is_sym("for") {
            return self.parse_for();
        }
        if self.is_sym("try") {
            return self.parse_try();
        }
        if self.is_sym("with") {
            return self.parse_with();
        }
        if self.is_sym("do") {
            self.stream.advance();
            self.parse_block(&["end"])?;
            return self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct);
        }
        if self.is_sym("function") {
            return self.parse_function_statement();
        }
        if self.is_sym("public") {
            return self.parse_public();
        }
        if self.is_sym("delete") {
            return self.parse_delete();
        }
        if self.is_sym("return") {
            return self.parse_return();
        }
        if self.is_sym("break") {
            let line = self.line();
            self.stream.advance();
            let loop_labels = self
                .builder
                .current_loop()
                .ok_or_else(|| CompileError::syntax(SyntaxErrorTag::StrayBreakContinue, "'break' outside a loop", line))?;
            self.builder.unwind_with_to(loop_labels.with_depth_at_entry, line);
            self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(loop_labels.exit), QOperand::None, line);
            return Ok(());
        }
        if self.is_sym("continue") {
            let line = self.line();
            self.stream.advance();
            let loop_labels = self.builder.current_loop().ok_or_else(|| {
                CompileError::syntax(SyntaxErrorTag::StrayBreakContinue, "'continue' outside a loop", line)
            })?;
            self.builder.unwind_with_to(loop_labels.with_depth_at_entry, line);
            self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(loop_labels.top), QOperand::None, line);
            return Ok(());
        }
        if self.is_sym("end") {
            return Err(CompileError::syntax(SyntaxErrorTag::StrayEnd, "unexpected 'end'", self.line()));
        }
        self.parse_expr_statement()
    }

    fn parse_if(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let end_label = self.builder.new_label();
        self.parse_if_arm(end_label)?;
        self.builder.set_label(end_label);
        let _ = line;
        Ok(())
    }

    fn parse_if_arm(&mut self, end_label: u32) -> Result<(), CompileError> {
        let line = self.line();
        let cond = self.parse_expr()?;
        let cond = self.builder.materialize(cond, line);
        self.eat_sym("then");
        let next_label = self.builder.new_label();
        self.builder.emit(QOpcode::Iff, QOperand::None, cond, QOperand::Label(next_label), line);
        self.parse_block(&["elseif", "else", "end"])?;
        self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(end_label), QOperand::None, line);
        self.builder.set_label(next_label);
        if self.eat_sym("elseif") {
            return self.parse_if_arm(end_label);
        }
        if self.eat_sym("else") {
            self.parse_block(&["end"])?;
        }
        self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)
    }

    fn parse_while(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let top = self.builder.new_label();
        let exit = self.builder.new_label();
        self.builder.set_label(top);
        let cond = self.parse_expr()?;
        let cond = self.builder.materialize(cond, line);
        self.builder.emit(QOpcode::Iff, QOperand::None, cond, QOperand::Label(exit), line);
        self.eat_sym("do");
        self.builder.enter_loop(top, exit);
        self.parse_block(&["end"])?;
        self.builder.exit_loop();
        self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(top), QOperand::None, line);
        self.builder.set_label(exit);
        self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)
    }

    fn parse_for(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        // Collect the LHS name list first; the arrow ('<<') forms and the
        // numeric form share this prefix.
        let mut names = vec![self.expect_identifier()?];
        let mut ellipsis_at: Option<usize> = None;
        while self.eat_sym(",") {
            if self.eat_sym("...") {
                if ellipsis_at.is_some() {
                    return Err(CompileError::syntax(SyntaxErrorTag::DuplicateEllipsisInUnpack, "at most one '...' target", self.line()));
                }
                ellipsis_at = Some(names.len());
            }
            names.push(self.expect_identifier()?);
        }

        if self.eat_sym("<<") {
            return self.parse_for_iterator(line, names, ellipsis_at);
        }

        if names.len() != 1 || ellipsis_at.is_some() {
            return Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "numeric 'for' takes a single loop variable", line));
        }
        self.expect_sym("=", SyntaxErrorTag::UnexpectedToken)?;
        self.parse_for_numeric(line, names[0])
    }

    fn parse_for_numeric(&mut self, line: u32, loop_ident: u32) -> Result<(), CompileError> {
        let start = self.parse_expr()?;
        let loop_local = self.builder.declare_local(loop_ident);
        self.builder.assign_name(loop_ident, start, line)?;

        self.expect_sym(",", SyntaxErrorTag::UnexpectedToken)?;
        let relop = self.parse_relop()?;
        let bound = self.parse_expr()?;
        let bound = self.builder.materialize(bound, line);

        let step = if self.eat_sym(",") { self.parse_expr()? } else { QOperand::Int(1) };
        let step = self.builder.materialize(step, line);

        let top = self.builder.new_label();
        let test = self.builder.new_label();
        let exit = self.builder.new_label();
        self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(test), QOperand::None, line);
        self.builder.set_label(top);
        self.eat_sym("do");
        self.builder.enter_loop(test, exit);
        self.parse_block(&["end"])?;
        self.builder.exit_loop();
        let loop_val = QOperand::Local(loop_local);
        let advanced = self.builder.binary_op(BinOp::Add, loop_val.clone(), step, line);
        self.builder.assign_name(loop_ident, advanced, line)?;
        self.builder.set_label(test);
        let cur = self.builder.read_name(loop_ident, line)?;
        let cmp = self.builder.binary_op(relop, cur, bound, line);
        let cmp = self.builder.materialize(cmp, line);
        self.builder.emit(QOpcode::Ift, QOperand::None, cmp, QOperand::Label(top), line);
        self.builder.set_label(exit);
        self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)
    }

    fn parse_relop(&mut self) -> Result<BinOp, CompileError> {
        for (sym, op) in [("==", BinOp::Eq), ("!=", BinOp::Ne), ("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)] {
            if self.eat_sym(sym) {
                return Ok(op);
            }
        }
        Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "expected a relational operator", self.line()))
    }

    fn parse_for_iterator(&mut self, line: u32, names: Vec<u32>, ellipsis_at: Option<usize>) -> Result<(), CompileError> {
        let source = self.parse_expr()?;
        let source = self.builder.materialize(source, line);
        let iter_temp = self.builder.alloc_temp();
        self.builder.emit(QOpcode::Iiter, QOperand::Temp(iter_temp), source, QOperand::None, line);

        let top = self.builder.new_label();
        let exit = self.builder.new_label();
        self.builder.set_label(top);

        if names.len() == 1 && ellipsis_at.is_none() {
            let local = self.builder.declare_local(names[0]);
            self.builder.emit(QOpcode::Inext, QOperand::Local(local), QOperand::Temp(iter_temp), QOperand::Label(exit), line);
        } else {
            self.builder.emit(QOpcode::InextS, QOperand::None, QOperand::Temp(iter_temp), QOperand::Label(exit), line);
            self.assign_unpack_from_stack(&names, ellipsis_at, line)?;
        }

        self.eat_sym("do");
        self.builder.enter_loop(top, exit);
        self.parse_block(&["end"])?;
        self.builder.exit_loop();
        self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(top), QOperand::None, line);
        self.builder.set_label(exit);
        self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)
    }

    fn parse_try(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let handler = self.builder.new_label();
        let end = self.builder.new_label();
        self.builder.emit(QOpcode::ExPush, QOperand::None, QOperand::Label(handler), QOperand::None, line);
        self.parse_block(&["catch", "end"])?;
        self.builder.emit(QOpcode::ExPop, QOperand::None, QOperand::None, QOperand::None, line);
        self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(end), QOperand::None, line);
        self.builder.set_label(handler);
        if self.eat_sym("catch") {
            if self.tok().tag == TokenTag::Identifier {
                let ident = self.expect_identifier()?;
                self.builder.assign_name(ident, QOperand::Temp(0), line)?;
            }
            self.parse_block(&["end"])?;
        }
        self.builder.set_label(end);
        self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)
    }

    fn parse_with(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let ident = self.expect_identifier()?;
        self.expect_sym("=", SyntaxErrorTag::UnexpectedToken)?;
        let value = self.parse_expr()?;

        let prior = self.builder.read_name(ident, line).unwrap_or(QOperand::Null);
        self.builder.emit(QOpcode::Wpush, prior, QOperand::None, QOperand::None, line);
        self.builder.assign_name(ident, value, line)?;
        self.builder.enter_with();

        self.eat_sym("do");
        self.parse_block(&["end"])?;
        self.builder.exit_with(line);
        self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)
    }

    fn parse_function_statement(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let name_ident = self.expect_identifier()?;
        // Declare the name in the enclosing scope before parsing the body,
        // not after, so a recursive self-reference inside the body (or a
        // capture of it by a further-nested function) resolves to this
        // function's own slot rather than failing as undefined.
        if self.builder.frame_ref().book.lookup(name_ident).is_none() {
            self.builder.declare_local(name_ident);
        }
        let value = self.parse_function_tail(line, Some(name_ident))?;
        self.builder.assign_name(name_ident, value, line)
    }

    /// Parses `(params) [= expr | block end]`. `name` is `Some` for the
    /// named statement form (used for the function's debug name), `None`
    /// for the anonymous expression form.
    fn parse_function_tail(&mut self, line: u32, name: Option<u32>) -> Result<QOperand, CompileError> {
        self.expect_sym("(", SyntaxErrorTag::UnexpectedToken)?;
        let mut param_defaults = Vec::new();
        let mut seen_optional = false;
        let mut varargs = false;
        let mut params = Vec::new();
        if !self.is_sym(")") {
            loop {
                if self.eat_sym("...") {
                    varargs = true;
                    break;
                }
                let pident = self.expect_identifier()?;
                if self.eat_sym("=") {
                    seen_optional = true;
                    let default = self.parse_expr()?;
                    param_defaults.push(default);
                } else if seen_optional {
                    return Err(CompileError::syntax(
                        SyntaxErrorTag::OptionalAfterRequired,
                        "required parameter follows an optional one",
                        self.line(),
                    ));
                }
                params.push(pident);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym(")", SyntaxErrorTag::UnexpectedToken)?;

        for default in param_defaults.iter().cloned() {
            self.builder.push_value(default, line);
        }

        let func_index = self.builder.open_function(line);
        if let Some(n) = name {
            self.builder.frame().qf.name = n;
        }
        for &p in &params {
            self.builder.declare_argument(p);
        }
        self.builder.frame().qf.optional_arg_count = param_defaults.len() as u32;
        if varargs {
            self.builder.frame().qf.flags.insert(QFunctionFlags::VARARGS);
        }

        if self.eat_sym("=") {
            self.builder.frame().qf.flags.insert(QFunctionFlags::EXPR_BODY);
            let body_line = self.line();
            let result = self.parse_expr()?;
            self.builder.emit(QOpcode::Exit1, QOperand::None, result, QOperand::None, body_line);
        } else {
            self.parse_block(&["end"])?;
            self.expect_sym("end", SyntaxErrorTag::UnterminatedConstruct)?;
        }
        self.builder.close_function()?;

        let t = self.builder.alloc_temp();
        self.builder.emit(QOpcode::Fmake, QOperand::Temp(t), QOperand::Function(func_index), QOperand::None, line);
        Ok(QOperand::Temp(t))
    }

    fn parse_public(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let mut names = vec![self.expect_identifier()?];
        while self.eat_sym(",") {
            names.push(self.expect_identifier()?);
        }
        for &n in &names {
            if self.builder.is_local_name(n) {
                return Err(CompileError::syntax(
                    SyntaxErrorTag::PublicOnLocalName,
                    "cannot declare a name 'public' that is already a local",
                    line,
                ));
            }
        }
        if self.eat_sym("=") {
            if names.len() > 1 {
                return Err(CompileError::syntax(
                    SyntaxErrorTag::PublicWithMultipleTargets,
                    "only the last name in a 'public' list may take an initializer",
                    line,
                ));
            }
            let value = self.parse_expr()?;
            self.builder.declare_public(names[0]);
            self.builder.emit(QOpcode::Spub, QOperand::Public(names[0]), value, QOperand::None, line);
        } else {
            for n in names {
                self.builder.declare_public(n);
            }
        }
        Ok(())
    }

    fn parse_delete(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        let parsed = self.parse_postfix()?;
        match parsed.place {
            Some(Place::Name(ident)) => {
                self.builder.declare_public(ident); // deleting a public unsets it; deleting a local is a no-op at this layer
                self.builder.emit(QOpcode::Dpub, QOperand::Public(ident), QOperand::None, QOperand::None, line);
            }
            Some(Place::Attr { obj, name, .. }) => {
                self.builder.emit(QOpcode::Dattr, obj, QOperand::StrIdent(name), QOperand::None, line);
            }
            Some(Place::Index { obj, index }) => {
                self.builder.emit(QOpcode::Dindx, obj, index, QOperand::None, line);
            }
            None => return Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "'delete' target must be a name, attribute, or index", line)),
        }
        Ok(())
    }

    fn parse_return(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        self.stream.advance();
        if self.tok().tag == TokenTag::Newline || self.stream.is_at_end() || self.is_sym("end") {
            self.builder.emit(QOpcode::Exit0, QOperand::None, QOperand::None, QOperand::None, line);
            return Ok(());
        }
        let first = self.parse_expr()?;
        if self.is_sym(",") {
            self.builder.push_frame_stack(line);
            self.builder.push_value(first, line);
            while self.eat_sym(",") {
                let v = self.parse_expr()?;
                self.builder.push_value(v, line);
            }
            self.builder.emit(QOpcode::Exit, QOperand::None, QOperand::None, QOperand::None, line);
        } else {
            self.builder.emit(QOpcode::Exit1, QOperand::None, first, QOperand::None, line);
        }
        Ok(())
    }

    /// Bare expression statement, assignment (single/multi/ellipsis), or
    /// compound assignment — disambiguated after parsing the first
    /// target/expression, per §4.5's note on assignment-vs-expression
    /// backtracking (simplified here to lookahead rather than the
    /// exception-based backtracking spec.md flags as a redesign
    /// candidate, §9).
    fn parse_expr_statement(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        let first = self.parse_postfix_expr()?;

        if let Some(op) = self.peek_compound_assign() {
            self.stream.advance();
            let rhs = self.parse_expr()?;
            return self.compound_assign(first, op, rhs, line);
        }

        if self.is_sym(",") || self.is_sym("=") {
            let mut targets = vec![first];
            let mut ellipsis_at = targets[0].place.as_ref().map(|_| None).unwrap_or(None);
            let _ = &mut ellipsis_at;
            let mut ellipsis_index: Option<usize> = None;
            while self.eat_sym(",") {
                if self.eat_sym("...") {
                    if ellipsis_index.is_some() {
                        return Err(CompileError::syntax(SyntaxErrorTag::DuplicateEllipsisInUnpack, "at most one '...' target", self.line()));
                    }
                    ellipsis_index = Some(targets.len());
                }
                targets.push(self.parse_postfix_expr()?);
            }
            if ellipsis_index.is_some() && self.peek_compound_assign().is_some() {
                return Err(CompileError::syntax(
                    SyntaxErrorTag::CompoundAssignWithEllipsis,
                    "compound assignment cannot be combined with a '...' unpack target",
                    self.line(),
                ));
            }
            self.expect_sym("=", SyntaxErrorTag::UnexpectedToken)?;
            return self.multi_assign(targets, ellipsis_index, line);
        }

        // Plain expression statement: value discarded, except at the top
        // level in extend mode where it is left on the frame-stack.
        if self.builder.config.extend_mode && self.builder.current_index() == 0 {
            self.builder.push_value(first.value, line);
        }
        Ok(())
    }

    fn peek_compound_assign(&self) -> Option<BinOp> {
        for (sym, op) in [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mul),
            ("/=", BinOp::Div),
            ("//=", BinOp::Idiv),
            ("%=", BinOp::Mod),
            ("&=", BinOp::BitAnd),
            ("|=", BinOp::BitOr),
            ("^=", BinOp::BitXor),
            ("<<=", BinOp::Shl),
            (">>=", BinOp::Shr),
            ("..=", BinOp::Concat),
        ] {
            if self.is_sym(sym) {
                return Some(op);
            }
        }
        None
    }

    fn compound_assign(&mut self, target: Parsed, op: BinOp, rhs: QOperand, line: u32) -> Result<(), CompileError> {
        match target.place {
            Some(Place::Name(ident)) => {
                let current = self.builder.read_name(ident, line)?;
                let combined = self.builder.binary_op(op, current, rhs, line);
                self.builder.assign_name(ident, combined, line)
            }
            Some(Place::Attr { obj, name, quiet }) => {
                let get_op = if quiet { QOpcode::GattrQ } else { QOpcode::Gattr };
                let t = self.builder.alloc_temp();
                self.builder.emit(get_op, QOperand::Temp(t), obj.clone(), QOperand::StrIdent(name), line);
                let combined = self.builder.binary_op(op, QOperand::Temp(t), rhs, line);
                self.builder.emit(QOpcode::Sattr, obj, QOperand::StrIdent(name), combined, line);
                Ok(())
            }
            Some(Place::Index { obj, index }) => {
                let t = self.builder.alloc_temp();
                self.builder.emit(QOpcode::Gindx, QOperand::Temp(t), obj.clone(), index.clone(), line);
                let combined = self.builder.binary_op(op, QOperand::Temp(t), rhs, line);
                self.builder.emit(QOpcode::Sindx, obj, index, combined, line);
                Ok(())
            }
            None => Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "compound assignment requires an assignable target", line)),
        }
    }

    fn multi_assign(&mut self, targets: Vec<Parsed>, ellipsis_index: Option<usize>, line: u32) -> Result<(), CompileError> {
        if targets.len() == 1 && ellipsis_index.is_none() {
            let rhs = self.parse_expr()?;
            return self.assign_one(targets.into_iter().next().unwrap(), rhs, line);
        }
        if ellipsis_index.is_some() && targets.len() == 1 {
            return Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "'...' unpack needs at least one other target", line));
        }

        self.builder.push_frame_stack(line);
        let rhs = self.parse_expr()?;
        self.builder.push_value(rhs, line);
        let min_count = targets.len() as u32;
        let assert_op = if ellipsis_index.is_some() { QOpcode::StkGe } else { QOpcode::StkEq };
        self.builder.emit(assert_op, QOperand::None, QOperand::Unsigned(min_count), QOperand::None, line);

        let idents: Vec<Option<u32>> = targets
            .iter()
            .map(|t| match &t.place {
                Some(Place::Name(i)) => Some(*i),
                _ => None,
            })
            .collect();
        // Non-name (attr/index) targets in a multi-assignment still read
        // from their stack position but write through their place.
        self.assign_unpack_from_stack_places(&targets, ellipsis_index, line)?;
        let _ = idents;
        self.builder.pop_frame_stack(line);
        Ok(())
    }

    fn assign_one(&mut self, target: Parsed, rhs: QOperand, line: u32) -> Result<(), CompileError> {
        match target.place {
            Some(Place::Name(ident)) => self.builder.assign_name(ident, rhs, line),
            Some(Place::Attr { obj, name, .. }) => {
                self.builder.emit(QOpcode::Sattr, obj, QOperand::StrIdent(name), rhs, line);
                Ok(())
            }
            Some(Place::Index { obj, index }) => {
                self.builder.emit(QOpcode::Sindx, obj, index, rhs, line);
                Ok(())
            }
            None => Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "assignment target is not assignable", line)),
        }
    }

    /// Read `names.len()` (or `targets.len()`) values off the current
    /// frame-stack into plain local targets, honoring at most one
    /// ellipsis target (§4.3, "Ellipsis target").
    fn assign_unpack_from_stack(&mut self, names: &[u32], ellipsis_at: Option<usize>, line: u32) -> Result<(), CompileError> {
        let n = names.len() as u32;
        let mut base = 0u32;
        for (i, &ident) in names.iter().enumerate() {
            if Some(i) == ellipsis_at {
                let local = self.builder.declare_local(ident);
                self.builder.emit(
                    QOpcode::MlistP,
                    QOperand::Local(local),
                    Builder::stack_ref_from_base(base),
                    Builder::stack_ref_from_end(n - i as u32 - 1),
                    line,
                );
            } else {
                let src = if ellipsis_at.map(|e| i > e).unwrap_or(false) {
                    Builder::stack_ref_from_end(n - i as u32 - 1)
                } else {
                    Builder::stack_ref_from_base(base)
                };
                self.builder.assign_name(ident, src, line)?;
                base += 1;
            }
        }
        Ok(())
    }

    fn assign_unpack_from_stack_places(&mut self, targets: &[Parsed], ellipsis_at: Option<usize>, line: u32) -> Result<(), CompileError> {
        let n = targets.len() as u32;
        let mut base = 0u32;
        for i in 0..targets.len() {
            if Some(i) == ellipsis_at {
                let local = self.builder.alloc_temp();
                self.builder.emit(
                    QOpcode::MlistP,
                    QOperand::Temp(local),
                    Builder::stack_ref_from_base(base),
                    Builder::stack_ref_from_end(n - i as u32 - 1),
                    line,
                );
                self.assign_place_clone(&targets[i], QOperand::Temp(local), line)?;
            } else {
                let src = if ellipsis_at.map(|e| i > e).unwrap_or(false) {
                    Builder::stack_ref_from_end(n - i as u32 - 1)
                } else {
                    Builder::stack_ref_from_base(base)
                };
                self.assign_place_clone(&targets[i], src, line)?;
                base += 1;
            }
        }
        Ok(())
    }

    fn assign_place_clone(&mut self, target: &Parsed, rhs: QOperand, line: u32) -> Result<(), CompileError> {
        match &target.place {
            Some(Place::Name(ident)) => self.builder.assign_name(*ident, rhs, line),
            Some(Place::Attr { obj, name, .. }) => {
                self.builder.emit(QOpcode::Sattr, obj.clone(), QOperand::StrIdent(*name), rhs, line);
                Ok(())
            }
            Some(Place::Index { obj, index }) => {
                self.builder.emit(QOpcode::Sindx, obj.clone(), index.clone(), rhs, line);
                Ok(())
            }
            None => Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "assignment target is not assignable", line)),
        }
    }

    // ---- expressions -----------------------------------------------------

    fn parse_expr(&mut self) -> Result<QOperand, CompileError> {
        self.enter()?;
        let v = self.parse_or();
        self.exit();
        v
    }

    /// Like [`Parser::parse_expr`] but preserves the `Place` of a bare
    /// name/attribute/index chain, for assignment-target disambiguation.
    fn parse_postfix_expr(&mut self) -> Result<Parsed, CompileError> {
        self.parse_postfix()
    }

    fn parse_or(&mut self) -> Result<QOperand, CompileError> {
        let mut left = self.parse_and()?;
        while self.is_sym("or") {
            let line = self.line();
            self.stream.advance();
            let (t, end) = self.builder.begin_short_circuit_or(left, line);
            let rhs = self.parse_and()?;
            left = self.builder.finish_short_circuit(t, rhs, end, line);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<QOperand, CompileError> {
        let mut left = self.parse_relational()?;
        while self.is_sym("and") {
            let line = self.line();
            self.stream.advance();
            let (t, end) = self.builder.begin_short_circuit_and(left, line);
            let rhs = self.parse_relational()?;
            left = self.builder.finish_short_circuit(t, rhs, end, line);
        }
        Ok(left)
    }

    /// Relational operators form an AND-chain at a single precedence
    /// level: `a < b < c` compiles as `a < b and b < c`, each operand
    /// evaluated exactly once (§4.5).
    fn parse_relational(&mut self) -> Result<QOperand, CompileError> {
        let line = self.line();
        let first = self.parse_bitor()?;
        if self.peek_relop_sym().is_none() {
            return Ok(first);
        }
        let mut operands = vec![self.builder.materialize(first, line)];
        let mut ops = Vec::new();
        while let Some(op) = self.peek_relop_sym() {
            self.stream.advance();
            ops.push(op);
            let rhs = self.parse_bitor()?;
            operands.push(self.builder.materialize(rhs, line));
        }
        let mut result: Option<QOperand> = None;
        for (i, &op) in ops.iter().enumerate() {
            let cmp = self.builder.binary_op(op, operands[i].clone(), operands[i + 1].clone(), line);
            result = Some(match result {
                None => cmp,
                Some(prev) => {
                    let (t, end) = self.builder.begin_short_circuit_and(prev, line);
                    self.builder.finish_short_circuit(t, cmp, end, line)
                }
            });
        }
        Ok(result.unwrap())
    }

    fn peek_relop_sym(&self) -> Option<BinOp> {
        for (sym, op) in [("==", BinOp::Eq), ("!=", BinOp::Ne), ("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)] {
            if self.is_sym(sym) {
                return Some(op);
            }
        }
        None
    }

    fn parse_binop_level<F>(&mut self, next: F, ops: &[(&str, BinOp)]) -> Result<QOperand, CompileError>
    where
        F: Fn(&mut Self) -> Result<QOperand, CompileError>,
    {
        let mut left = next(self)?;
        'outer: loop {
            for &(sym, op) in ops {
                if self.is_sym(sym) {
                    let line = self.line();
                    self.stream.advance();
                    let right = next(self)?;
                    left = self.builder.binary_op(op, left, right, line);
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_bitxor, &[("|", BinOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_bitand, &[("^", BinOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_shift, &[("&", BinOp::BitAnd)])
    }

    fn parse_shift(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_concat, &[("<<", BinOp::Shl), (">>", BinOp::Shr)])
    }

    fn parse_concat(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_additive, &[("..", BinOp::Concat)])
    }

    fn parse_additive(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_multiplicative, &[("+", BinOp::Add), ("-", BinOp::Sub)])
    }

    fn parse_multiplicative(&mut self) -> Result<QOperand, CompileError> {
        self.parse_binop_level(Self::parse_unary, &[("*", BinOp::Mul), ("/", BinOp::Div), ("//", BinOp::Idiv), ("%", BinOp::Mod)])
    }

    /// Prefix unary operators are collected left-to-right, so `- - x`
    /// recurses into itself before reaching the operand (§4.5).
    fn parse_unary(&mut self) -> Result<QOperand, CompileError> {
        let op = if self.eat_sym("-") {
            Some(UnOp::Neg)
        } else if self.eat_sym("+") {
            Some(UnOp::Plus)
        } else if self.eat_sym("~") {
            Some(UnOp::BitNot)
        } else if self.eat_sym("not") {
            Some(UnOp::Not)
        } else {
            None
        };
        match op {
            Some(op) => {
                let line = self.line();
                let operand = self.parse_unary()?;
                Ok(self.builder.unary_op(op, operand, line))
            }
            None => Ok(self.parse_postfix()?.value),
        }
    }

    fn parse_postfix(&mut self) -> Result<Parsed, CompileError> {
        let line = self.line();
        let (mut place, mut value) = if self.tok().tag == TokenTag::Identifier {
            let ident = self.tok().pool_index;
            self.stream.advance();
            (Some(Place::Name(ident)), None)
        } else {
            (None, Some(self.parse_atom()?))
        };

        // Postfix chain: attribute / safe-attribute / index / call / bind.
        loop {
            let chain_line = self.line();
            if self.eat_sym(".") {
                let name = self.expect_identifier()?;
                let obj = self.place_value(&mut place, &mut value, chain_line)?;
                place = Some(Place::Attr { obj, name, quiet: false });
                value = None;
            } else if self.eat_sym("?.") {
                let name = self.expect_identifier()?;
                let obj = self.place_value(&mut place, &mut value, chain_line)?;
                place = Some(Place::Attr { obj, name, quiet: true });
                value = None;
            } else if self.eat_sym("[") {
                let index = self.parse_expr()?;
                self.expect_sym("]", SyntaxErrorTag::UnexpectedToken)?;
                let obj = self.place_value(&mut place, &mut value, chain_line)?;
                place = Some(Place::Index { obj, index });
                value = None;
            } else if self.eat_sym("(") {
                let callee = self.place_value(&mut place, &mut value, chain_line)?;
                let args = self.parse_call_args()?;
                let t = self.emit_call(callee, args, chain_line);
                value = Some(t);
                place = None;
            } else if self.eat_sym("->") {
                let name = self.expect_identifier()?;
                let obj = self.place_value(&mut place, &mut value, chain_line)?;
                let t = self.builder.alloc_temp();
                self.builder.emit(QOpcode::Gattr, QOperand::Temp(t), obj.clone(), QOperand::StrIdent(name), chain_line);
                let bound = self.builder.alloc_temp();
                self.builder.emit(QOpcode::Fbind, QOperand::Temp(bound), QOperand::Temp(t), obj, chain_line);
                value = Some(QOperand::Temp(bound));
                place = None;
            } else {
                break;
            }
        }

        let value = self.place_value(&mut place, &mut value, line)?;
        Ok(Parsed { place, value })
    }

    /// Read the current place/value as a plain operand without
    /// discarding `place` (so an assignment target is still available
    /// after this call).
    fn place_value(&mut self, place: &mut Option<Place>, value: &mut Option<QOperand>, line: u32) -> Result<QOperand, CompileError> {
        if let Some(v) = value.take() {
            *value = Some(v.clone());
            return Ok(v);
        }
        match place {
            Some(Place::Name(ident)) => self.builder.read_name(*ident, line),
            Some(Place::Attr { obj, name, quiet }) => {
                let t = self.builder.alloc_temp();
                let op = if *quiet { QOpcode::GattrQ } else { QOpcode::Gattr };
                self.builder.emit(op, QOperand::Temp(t), obj.clone(), QOperand::StrIdent(*name), line);
                Ok(QOperand::Temp(t))
            }
            Some(Place::Index { obj, index }) => {
                let t = self.builder.alloc_temp();
                self.builder.emit(QOpcode::Gindx, QOperand::Temp(t), obj.clone(), index.clone(), line);
                Ok(QOperand::Temp(t))
            }
            None => unreachable!("place_value called with neither a place nor a value"),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<QOperand>, CompileError> {
        let mut args = Vec::new();
        if !self.is_sym(")") {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym(")", SyntaxErrorTag::UnexpectedToken)?;
        Ok(args)
    }

    fn emit_call(&mut self, callee: QOperand, args: Vec<QOperand>, line: u32) -> QOperand {
        self.builder.push_frame_stack(line);
        for a in args {
            self.builder.push_value(a, line);
        }
        let result = self.builder.alloc_temp();
        let op = if let QOperand::Function(_) = callee { QOpcode::Dcall } else { QOpcode::Fcall };
        self.builder.emit(op, QOperand::Temp(result), callee, QOperand::None, line);
        self.builder.pop_frame_stack(line);
        QOperand::Temp(result)
    }

    fn parse_atom(&mut self) -> Result<QOperand, CompileError> {
        let line = self.line();
        let tok = self.tok().clone();
        match tok.tag {
            TokenTag::IntLiteral => {
                self.stream.advance();
                Ok(QOperand::Int(tok.int_value))
            }
            TokenTag::FloatLiteral => {
                self.stream.advance();
                Ok(QOperand::Float(tok.float_value))
            }
            TokenTag::StringLiteral => {
                self.stream.advance();
                Ok(self.builder.string_literal(tok.pool_index))
            }
            TokenTag::Symbol => {
                if self.eat_sym("(") {
                    let v = self.parse_expr()?;
                    self.expect_sym(")", SyntaxErrorTag::UnexpectedToken)?;
                    Ok(v)
                } else if self.eat_sym("true") {
                    Ok(QOperand::True)
                } else if self.eat_sym("false") {
                    Ok(QOperand::False)
                } else if self.eat_sym("null") {
                    Ok(QOperand::Null)
                } else if self.eat_sym("function") {
                    self.parse_function_tail(line, None)
                } else if self.eat_sym("[") {
                    self.parse_list_literal(line)
                } else if self.eat_sym("{") {
                    self.parse_dict_literal(line)
                } else if self.is_sym("if") {
                    self.parse_inline_if()
                } else {
                    Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, format!("unexpected token '{}'", tok.text), line))
                }
            }
            TokenTag::Identifier | TokenTag::Newline | TokenTag::End => {
                Err(CompileError::syntax(SyntaxErrorTag::UnexpectedToken, "unexpected token", line))
            }
        }
    }

    /// `if cond then a else b` as an expression — requires the `else`
    /// arm (§4.5).
    fn parse_inline_if(&mut self) -> Result<QOperand, CompileError> {
        let line = self.line();
        self.stream.advance();
        let cond = self.parse_expr()?;
        self.eat_sym("then");
        let (t, end) = {
            let cond = self.builder.materialize(cond, line);
            let result = self.builder.alloc_temp();
            let else_label = self.builder.new_label();
            self.builder.emit(QOpcode::Iff, QOperand::None, cond, QOperand::Label(else_label), line);
            let then_val = self.parse_expr()?;
            self.builder.emit(QOpcode::Mov, QOperand::Temp(result), then_val, QOperand::None, line);
            let end = self.builder.new_label();
            self.builder.emit(QOpcode::Jmp, QOperand::None, QOperand::Label(end), QOperand::None, line);
            self.builder.set_label(else_label);
            if !self.eat_sym("else") {
                return Err(CompileError::syntax(SyntaxErrorTag::MissingElseInInlineIf, "inline 'if' requires an 'else'", line));
            }
            (result, end)
        };
        let else_val = self.parse_expr()?;
        Ok(self.builder.finish_short_circuit(t, else_val, end, line))
    }

    fn parse_list_literal(&mut self, line: u32) -> Result<QOperand, CompileError> {
        self.builder.push_frame_stack(line);
        if !self.is_sym("]") {
            loop {
                let v = self.parse_expr()?;
                self.builder.push_value(v, line);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym("]", SyntaxErrorTag::UnexpectedToken)?;
        let t = self.builder.alloc_temp();
        self.builder.emit(QOpcode::Mlist, QOperand::Temp(t), QOperand::None, QOperand::None, line);
        self.builder.pop_frame_stack(line);
        Ok(QOperand::Temp(t))
    }

    fn parse_dict_literal(&mut self, line: u32) -> Result<QOperand, CompileError> {
        self.builder.push_frame_stack(line);
        if !self.is_sym("}") {
            loop {
                // `function name() ... end` may stand directly as an entry,
                // sugar for `name: function name() ... end`; the entry's key
                // comes from the function's own name, so there is no `:`
                // here at all. An anonymous function in this position has no
                // name to key by, which is an error, not a plain expression.
                if self.eat_sym("function") {
                    let name_ident = match self.tok().tag {
                        TokenTag::Identifier => {
                            let i = self.tok().pool_index;
                            self.stream.advance();
                            i
                        }
                        _ => {
                            return Err(CompileError::syntax(
                                SyntaxErrorTag::TableLiteralUnnamedFunction,
                                "table literal function entries must be named",
                                self.line(),
                            ));
                        }
                    };
                    let value = self.parse_function_tail(line, Some(name_ident))?;
                    self.builder.push_value(QOperand::StrIdent(name_ident), line);
                    self.builder.push_value(value, line);
                } else {
                    let key = if self.tok().tag == TokenTag::Identifier {
                        let i = self.tok().pool_index;
                        self.stream.advance();
                        QOperand::StrIdent(i)
                    } else {
                        self.parse_expr()?
                    };
                    self.expect_sym(":", SyntaxErrorTag::UnexpectedToken)?;
                    let value = self.parse_expr()?;
                    self.builder.push_value(key, line);
                    self.builder.push_value(value, line);
                }
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym("}", SyntaxErrorTag::UnexpectedToken)?;
        let t = self.builder.alloc_temp();
        self.builder.emit(QOpcode::Ndict, QOperand::Temp(t), QOperand::None, QOperand::None, line);
        self.builder.pop_frame_stack(line);
        Ok(QOperand::Temp(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillc_core::token::Pool;

    fn lex_from(tokens: Vec<Token>) -> LexOut {
        LexOut { tokens, string_pool: Pool::default(), ident_pool: Pool::default(), first_line: 1 }
    }

    fn tok_id(name_ordinal: u32, line: u32) -> Token {
        Token::identifier(name_ordinal, line)
    }

    #[test]
    fn constant_fold_collapses_to_a_single_move() {
        // public x = 1 + 2 * 3
        let tokens = vec![
            Token::symbol("public", 1),
            tok_id(0, 1),
            Token::symbol("=", 1),
            Token::int_literal(1, 1),
            Token::symbol("+", 1),
            Token::int_literal(2, 1),
            Token::symbol("*", 1),
            Token::int_literal(3, 1),
            Token::end(1),
        ];
        let lex = lex_from(tokens);
        let code = parse(&lex, CompilerConfig::default()).expect("parses");
        let top = &code.functions[0];
        let live: Vec<_> = top.instructions.iter().filter(|i| !i.is_deleted()).collect();
        assert!(live.iter().any(|i| i.op == QOpcode::Spub && i.src1 == QOperand::Int(7)));
        assert!(!live.iter().any(|i| i.op == QOpcode::Add || i.op == QOpcode::Mul));
    }

    #[test]
    fn assignment_declares_a_fresh_local() {
        let tokens = vec![tok_id(5, 1), Token::symbol("=", 1), Token::int_literal(9, 1), Token::end(1)];
        let lex = lex_from(tokens);
        let code = parse(&lex, CompilerConfig::default()).expect("parses");
        assert_eq!(code.functions[0].local_count, 1);
    }

    #[test]
    fn stray_end_is_a_syntax_error() {
        let tokens = vec![Token::symbol("end", 1), Token::end(1)];
        let lex = lex_from(tokens);
        let err = parse(&lex, CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { tag: SyntaxErrorTag::StrayEnd, .. }));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let tokens = vec![Token::symbol("break", 1), Token::end(1)];
        let lex = lex_from(tokens);
        let err = parse(&lex, CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { tag: SyntaxErrorTag::StrayBreakContinue, .. }));
    }

    #[test]
    fn declaring_an_existing_local_public_is_rejected() {
        // x = 1; public x
        let tokens = vec![
            tok_id(0, 1),
            Token::symbol("=", 1),
            Token::int_literal(1, 1),
            Token::newline(1),
            Token::symbol("public", 2),
            tok_id(0, 2),
            Token::end(2),
        ];
        let lex = lex_from(tokens);
        let err = parse(&lex, CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { tag: SyntaxErrorTag::PublicOnLocalName, .. }));
    }

    #[test]
    fn compound_assign_combined_with_ellipsis_is_rejected() {
        // a, ...b += f()
        let tokens = vec![
            tok_id(0, 1),
            Token::symbol(",", 1),
            Token::symbol("...", 1),
            tok_id(1, 1),
            Token::symbol("+=", 1),
            tok_id(2, 1),
            Token::symbol("(", 1),
            Token::symbol(")", 1),
            Token::end(1),
        ];
        let lex = lex_from(tokens);
        let err = parse(&lex, CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { tag: SyntaxErrorTag::CompoundAssignWithEllipsis, .. }));
    }

    #[test]
    fn table_literal_accepts_a_bare_named_function_entry() {
        // x = { function f() end }
        let tokens = vec![
            tok_id(0, 1), // x
            Token::symbol("=", 1),
            Token::symbol("{", 1),
            Token::symbol("function", 1),
            tok_id(1, 1), // f
            Token::symbol("(", 1),
            Token::symbol(")", 1),
            Token::newline(1),
            Token::symbol("end", 2),
            Token::symbol("}", 2),
            Token::end(2),
        ];
        let lex = lex_from(tokens);
        let code = parse(&lex, CompilerConfig::default()).expect("parses");
        let top = &code.functions[0];
        let live: Vec<_> = top.instructions.iter().filter(|i| !i.is_deleted()).collect();
        assert!(live.iter().any(|i| i.op == QOpcode::Ndict));
        assert!(live.iter().any(|i| matches!(i.dst, QOperand::StrIdent(1)) || matches!(i.src1, QOperand::StrIdent(1))));
    }

    #[test]
    fn table_literal_rejects_an_unnamed_function_entry() {
        // x = { function() end }
        let tokens = vec![
            tok_id(0, 1), // x
            Token::symbol("=", 1),
            Token::symbol("{", 1),
            Token::symbol("function", 1),
            Token::symbol("(", 1),
            Token::symbol(")", 1),
            Token::newline(1),
            Token::symbol("end", 2),
            Token::symbol("}", 2),
            Token::end(2),
        ];
        let lex = lex_from(tokens);
        let err = parse(&lex, CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { tag: SyntaxErrorTag::TableLiteralUnnamedFunction, .. }));
    }
}
