//! End-to-end scenarios driving the pipeline from hand-built tokens through
//! to lowered `Program`s (and, where the scenario is about Q-code shape
//! rather than encoding, stopping at the optimized `QCode`). Lexing itself
//! is an external collaborator, so each scenario constructs its `LexOut`
//! directly rather than running a tokenizer over source text — the same
//! approach the parser's own unit tests use.

use quillc::config::CompilerConfig;
use quillc::error::CompileError;
use quillc::{optimizer, parser};
use quillc_core::operand::QOperand;
use quillc_core::qfunction::FUNC_NOPARENT;
use quillc_core::token::{LexOut, Pool, Token};
use quillc_core::QOpcode;

fn lex_from(tokens: Vec<Token>) -> LexOut {
    LexOut { tokens, string_pool: Pool::default(), ident_pool: Pool::default(), first_line: 1 }
}

fn id(ordinal: u32, line: u32) -> Token {
    Token::identifier(ordinal, line)
}

fn sym(text: &str, line: u32) -> Token {
    Token::symbol(text, line)
}

fn compile_optimized(lex: &LexOut) -> quillc_core::qfunction::QCode {
    let mut code = parser::parse(lex, CompilerConfig::default()).expect("parses");
    optimizer::optimize(&mut code, CompilerConfig::default().dce_max_iterations);
    code
}

/// S1 — `public x = 1 + 2 * 3` folds to a single move of 7 into public slot
/// `x`; no `Add`/`Mul` instruction survives optimization.
#[test]
fn s1_constant_folding_collapses_to_a_single_public_store() {
    let tokens = vec![
        sym("public", 1),
        id(0, 1),
        sym("=", 1),
        Token::int_literal(1, 1),
        sym("+", 1),
        Token::int_literal(2, 1),
        sym("*", 1),
        Token::int_literal(3, 1),
        Token::end(1),
    ];
    let code = compile_optimized(&lex_from(tokens));
    let top = &code.functions[0];
    let live: Vec<_> = top.instructions.iter().filter(|i| !i.is_deleted()).collect();

    assert!(live.iter().any(|i| i.op == QOpcode::Spub && i.src1 == QOperand::Int(7)));
    assert!(!live.iter().any(|i| matches!(i.op, QOpcode::Add | QOpcode::Mul)));
}

/// S2 — `function f(n) return f(n) end` rewrites the self-call to the
/// tail-call variant; no frame-push/pop or `Exit1` survives around it.
#[test]
fn s2_self_recursive_tail_call_is_rewritten() {
    // function f(n) return f(n) end
    let tokens = vec![
        sym("function", 1),
        id(0, 1), // f
        sym("(", 1),
        id(1, 1), // n
        sym(")", 1),
        Token::newline(1),
        sym("return", 2),
        id(0, 2), // f
        sym("(", 2),
        id(1, 2), // n
        sym(")", 2),
        Token::newline(2),
        sym("end", 3),
        Token::end(3),
    ];
    let code = compile_optimized(&lex_from(tokens));

    // functions[0] is the top-level script; f is the function it declares.
    let f = code.functions.iter().find(|qf| qf.arg_count == 1).expect("f is present");
    let live: Vec<_> = f.instructions.iter().filter(|i| !i.is_deleted()).collect();

    assert!(live.iter().any(|i| matches!(i.op, QOpcode::Ftail | QOpcode::Dtail)));
    assert!(!live.iter().any(|i| matches!(i.op, QOpcode::Pushf | QOpcode::Popf | QOpcode::Exit1)));
}

/// S3 — `function make(x) return function() return x end end`: `make`
/// promotes its one argument to an exhale with a prologue copy; the inner
/// function gets one inhale sourced from `make`'s exhale 0.
#[test]
fn s3_closure_capture_promotes_argument_to_exhale() {
    let tokens = vec![
        sym("function", 1),
        id(0, 1), // make
        sym("(", 1),
        id(1, 1), // x
        sym(")", 1),
        Token::newline(1),
        sym("return", 2),
        sym("function", 2),
        sym("(", 2),
        sym(")", 2),
        Token::newline(2),
        sym("return", 3),
        id(1, 3), // x, captured from enclosing `make`
        Token::newline(3),
        sym("end", 4),
        Token::newline(4),
        sym("end", 5),
        Token::end(5),
    ];
    let mut code = parser::parse(&lex_from(tokens), CompilerConfig::default()).expect("parses");
    optimizer::optimize(&mut code, CompilerConfig::default().dce_max_iterations);

    let make = code.functions.iter().find(|qf| qf.arg_count == 1).expect("make is present");
    assert_eq!(make.exhale_count, 1);
    let make_index = code.functions.iter().position(|qf| qf.arg_count == 1).expect("make present") as u32;

    let inner = code
        .functions
        .iter()
        .find(|qf| qf.parent_index == make_index && qf.inhale_count == 1)
        .expect("inner closure inhales x");
    assert_eq!(inner.inhale_count, 1);
    assert_eq!(inner.inhale_source_operands.len(), 1);
    assert!(matches!(inner.inhale_source_operands[0], QOperand::Exhale(0)));
}

/// S4 — `a, ...b, c = f()` asserts at least 2 stack values, binds the first
/// to `a`, the middle span to `b` via `MLISTP`, and the last to `c`.
#[test]
fn s4_multi_assign_with_ellipsis_unpack() {
    let tokens = vec![
        id(0, 1), // a
        sym(",", 1),
        sym("...", 1),
        id(1, 1), // b
        sym(",", 1),
        id(2, 1), // c
        sym("=", 1),
        id(3, 1), // f
        sym("(", 1),
        sym(")", 1),
        Token::end(1),
    ];
    let code = compile_optimized(&lex_from(tokens));
    let top = &code.functions[0];
    let live: Vec<_> = top.instructions.iter().filter(|i| !i.is_deleted()).collect();

    assert!(live.iter().any(|i| i.op == QOpcode::StkGe));
    assert!(live.iter().any(|i| i.op == QOpcode::MlistP));
    assert!(live.iter().any(|i| i.op == QOpcode::Fcall || i.op == QOpcode::Dcall));
}

/// S5 — two adjacent unconditional jumps, A -> B -> C with B reachable only
/// from A, merge into a single A -> C after optimization.
#[test]
fn s5_jump_chain_merges_through_an_intermediate_label() {
    use quillc_core::operand::QOperand as Op;
    use quillc_core::qfunction::QFunction;
    use quillc_core::QInstr;

    let mut f = QFunction::new(1, FUNC_NOPARENT);
    let b = f.new_label();
    let c = f.new_label();
    f.instructions.push(QInstr::new(QOpcode::Jmp, Op::None, Op::Label(b), Op::None, 1));
    f.set_label(b);
    f.instructions.push(QInstr::new(QOpcode::Jmp, Op::None, Op::Label(c), Op::None, 1));
    f.set_label(c);
    f.instructions.push(QInstr::bare(QOpcode::End, 2));

    let mut code = quillc_core::qfunction::QCode::new(1);
    code.functions.push(f);
    optimizer::optimize(&mut code, CompilerConfig::default().dce_max_iterations);

    let top = &code.functions[0];
    let live: Vec<_> = top.instructions.iter().filter(|i| !i.is_deleted()).collect();
    let jumps: Vec<_> = live.iter().filter(|i| i.op == QOpcode::Jmp).collect();
    assert_eq!(jumps.len(), 1, "the two jumps should collapse into one");
}

/// S6 — three-level nesting (`a`/`b`/`c`) where `c` references a name owned
/// two scopes up: `i` is an exhale in `a`, an inhale in `b`, and an inhale
/// in `c` sourced from `b`'s inhale.
#[test]
fn s6_inhale_chain_threads_through_an_intermediate_frame() {
    // function a() i = 1; function b() function c() return i end; return c end; return b end
    let tokens = vec![
        sym("function", 1),
        id(0, 1), // a
        sym("(", 1),
        sym(")", 1),
        Token::newline(1),
        id(1, 2), // i
        sym("=", 2),
        Token::int_literal(1, 2),
        Token::newline(2),
        sym("function", 3),
        id(2, 3), // b
        sym("(", 3),
        sym(")", 3),
        Token::newline(3),
        sym("function", 4),
        id(3, 4), // c
        sym("(", 4),
        sym(")", 4),
        Token::newline(4),
        sym("return", 5),
        id(1, 5), // i
        Token::newline(5),
        sym("end", 6),
        Token::newline(6),
        sym("return", 7),
        id(3, 7), // c
        Token::newline(7),
        sym("end", 8),
        Token::newline(8),
        sym("return", 9),
        id(2, 9), // b
        Token::newline(9),
        sym("end", 10),
        Token::end(10),
    ];
    let code = parser::parse(&lex_from(tokens), CompilerConfig::default()).expect("parses");

    let a = code.functions.iter().find(|qf| qf.exhale_count >= 1).expect("a promotes i to an exhale");
    assert_eq!(a.exhale_count, 1);

    let intermediates: Vec<_> = code.functions.iter().filter(|qf| qf.inhale_count >= 1).collect();
    assert!(intermediates.len() >= 2, "both b and c should carry an inhale for i");
    assert!(intermediates.iter().all(|qf| qf.inhale_source_operands.len() == qf.inhale_count as usize));
}

/// VLQ/CLQ round-trip and binding-resolution failure are covered in their
/// own modules; this just checks that a malformed lexer buffer surfaces as
/// an internal `CompileError` rather than panicking through the public
/// `quillc::compile` entry point.
#[test]
fn malformed_lexer_output_is_reported_not_panicked() {
    let err = quillc::lexfmt::decode(&[0xFF]).unwrap_err();
    assert!(matches!(err, CompileError::Internal(_)));
}
