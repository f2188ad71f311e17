//! End-to-end scenarios: source-level behaviors hand-assembled into
//! instruction vectors, asserted on consumer output.

use std::sync::Arc;

use phlox_asm::{
    AttrDecl, AttrKind, CatchClause, ClassDecl, ClassFlags, CodeBlock, ExceptionBlock,
    ForeachDesc, FormalArg, FunctionDecl, Literal, Opcode, P3, ProgramImage, StaticVar, TypeHint,
};

use super::test_helpers::{op, run_image, run_main};
use crate::state::ProgramState;

/// `print 1+2*3;`
#[test]
fn arithmetic_precedence() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::Load).literal(2),
        op(Opcode::Mul),
        op(Opcode::Add),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);

    let t = run_main(code);
    assert_eq!(t.text(), "7");
    assert_eq!(t.state, ProgramState::Return(crate::value::Value::null()));
}

/// `PHP_INT_MIN / -1` is not representable as an integer; like the other
/// overflowing integer operations it promotes to real instead of
/// faulting, and the matching modulo is zero.
#[test]
fn integer_division_overflow_promotes() {
    let code = CodeBlock::new(vec![
        op(Opcode::Loadc).name("PHP_INT_MIN"),
        op(Opcode::Load).literal(0),
        op(Opcode::Div),
        op(Opcode::Consume).p1(1),
        op(Opcode::Load).literal(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Loadc).name("PHP_INT_MIN"),
        op(Opcode::Load).literal(0),
        op(Opcode::Mod),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(-1), Literal::Str(Arc::from(" "))]);

    let t = run_main(code);
    assert_eq!(t.text(), "9223372036854775808 0");
}

/// `$a = 1; $b = &$a; $b = 5; print $a;`
#[test]
fn scalar_aliasing() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Store).name("a"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).name("a"),
        op(Opcode::StoreRef).name("b"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(1),
        op(Opcode::Store).name("b"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).p1(1).name("a"),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(1), Literal::Int(5)]);

    let t = run_main(code);
    assert_eq!(t.text(), "5");
    // Both names resolve to the identical slot.
    assert_eq!(t.vm.resolve_var("a"), t.vm.resolve_var("b"));
}

/// `$arr = [1, 2, 3]; foreach ($arr as &$v) { $v *= 2; } print $arr[2];`
#[test]
fn foreach_by_reference() {
    let desc = Arc::new(ForeachDesc {
        key_var: None,
        value_var: Arc::from("v"),
        by_ref: true,
    });
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(2),
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(3),
        op(Opcode::LoadMap).p1(6),
        op(Opcode::Store).name("arr"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).name("arr"),
        op(Opcode::ForeachInit).p2(17).p3(P3::Foreach(desc.clone())),
        op(Opcode::ForeachStep).p2(17),
        op(Opcode::Load).name("v"),
        op(Opcode::Load).literal(2),
        op(Opcode::MulStore),
        op(Opcode::Pop).p1(1),
        op(Opcode::Jmp).p2(11),
        op(Opcode::Load).p1(1).name("arr"),
        op(Opcode::Load).literal(2),
        op(Opcode::LoadIdx).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Null,
        Literal::Int(1),
        Literal::Int(2),
        Literal::Int(3),
    ]);

    let t = run_main(code);
    assert_eq!(t.text(), "6");
}

/// Two declarations `f(int $x)` and `f(string $x)`; `f(3); f("x");`
/// selects by call-site signature.
#[test]
fn overload_by_signature() {
    let body = |text: &str| {
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Done).p1(1),
            ])
            .with_literals(vec![Literal::Str(Arc::from(text))]),
        )
    };
    let f_int = Arc::new(FunctionDecl::new(
        "f",
        vec![FormalArg::untyped("x").with_hint(TypeHint::Int)],
        body("i"),
    ));
    let f_str = Arc::new(FunctionDecl::new(
        "f",
        vec![FormalArg::untyped("x").with_hint(TypeHint::Str)],
        body("s"),
    ));

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(2),
        op(Opcode::Call).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Load).literal(3),
        op(Opcode::Consume).p1(1),
        op(Opcode::Load).literal(1),
        op(Opcode::Load).literal(2),
        op(Opcode::Call).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Int(3),
        Literal::Str(Arc::from("x")),
        Literal::Str(Arc::from("f")),
        Literal::Str(Arc::from(" ")),
    ]);

    let t = run_image(
        ProgramImage::new(Arc::new(main)).with_functions(vec![f_int, f_str]),
    );
    assert_eq!(t.text(), "i s");
}

/// `try { throw new E("!"); } catch (E $e) { print $e->getMessage(); }`
#[test]
fn throw_and_catch() {
    let construct = phlox_asm::MethodDecl::new(
        "__construct",
        vec![FormalArg::untyped("m")],
        Arc::new(CodeBlock::new(vec![
            op(Opcode::Load).name("this"),
            op(Opcode::Member).name("message"),
            op(Opcode::Load).name("m"),
            op(Opcode::Store).p2(1),
            op(Opcode::Pop).p1(1),
            op(Opcode::Done),
        ])),
    );
    let get_message = phlox_asm::MethodDecl::new(
        "getMessage",
        vec![],
        Arc::new(CodeBlock::new(vec![
            op(Opcode::Load).name("this"),
            op(Opcode::Member).name("message"),
            op(Opcode::Done).p1(1),
        ])),
    );
    let class = Arc::new(
        ClassDecl::new("E")
            .attr(AttrDecl::new("message", AttrKind::Instance))
            .method(construct)
            .method(get_message)
            .with_flags(ClassFlags::THROWABLE),
    );

    let block = Arc::new(ExceptionBlock {
        catches: vec![CatchClause {
            class_name: Arc::from("E"),
            var_name: Arc::from("e"),
            target: 7,
        }],
    });
    let main = CodeBlock::new(vec![
        op(Opcode::LoadException).p2(7).p3(P3::Exception(block)),
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::New).p1(1),
        op(Opcode::Throw),
        op(Opcode::PopException),
        op(Opcode::Jmp).p2(11),
        op(Opcode::Load).name("e"),
        op(Opcode::Member).p2(1).name("getMessage"),
        op(Opcode::Call),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("!")),
        Literal::Str(Arc::from("E")),
    ]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_classes(vec![class]));
    assert_eq!(t.text(), "!");
    // No frame leaked past the main dispatch.
    assert_eq!(t.vm.frames_depth(), 1);
}

/// `$c = 2; $f = function() use ($c) { return $c + 1; }; print $f();`
/// with a mutation of `$c` between creation and call.
#[test]
fn closure_captures_by_value() {
    let template = Arc::new(
        FunctionDecl::new(
            "{closure}",
            vec![],
            Arc::new(
                CodeBlock::new(vec![
                    op(Opcode::Load).name("c"),
                    op(Opcode::Load).literal(0),
                    op(Opcode::Add),
                    op(Opcode::Done).p1(1),
                ])
                .with_literals(vec![Literal::Int(1)]),
            ),
        )
        .with_captures(vec![Arc::from("c")]),
    );

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Store).name("c"),
        op(Opcode::Pop).p1(1),
        op(Opcode::LoadClosure).p3(P3::Function(template)),
        op(Opcode::Store).name("f"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(1),
        op(Opcode::Store).name("c"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).name("f"),
        op(Opcode::Call),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(2), Literal::Int(9)]);

    let t = run_main(main);
    assert_eq!(t.text(), "3");
}

/// Shutdown callbacks run in registration order after a normal exit, and
/// not at all after `Halt`.
#[test]
fn shutdown_order() {
    let printer = |text: &str| {
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Consume).p1(1),
                op(Opcode::Done),
            ])
            .with_literals(vec![Literal::Str(Arc::from(text))]),
        )
    };
    let g1 = Arc::new(FunctionDecl::new("g1", vec![], printer("one ")));
    let g2 = Arc::new(FunctionDecl::new("g2", vec![], printer("two")));

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::Call).p1(1),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(2),
        op(Opcode::Load).literal(1),
        op(Opcode::Call).p1(1),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(3),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("g1")),
        Literal::Str(Arc::from("register_shutdown_function")),
        Literal::Str(Arc::from("g2")),
        Literal::Str(Arc::from("main ")),
    ]);

    let t = run_image(
        ProgramImage::new(Arc::new(main)).with_functions(vec![g1.clone(), g2.clone()]),
    );
    assert_eq!(t.text(), "main one two");

    // The same program exiting through Halt skips the callbacks.
    let halting = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::Call).p1(1),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(3),
        op(Opcode::Consume).p1(1),
        op(Opcode::Halt),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("g1")),
        Literal::Str(Arc::from("register_shutdown_function")),
        Literal::Str(Arc::from("g2")),
        Literal::Str(Arc::from("main ")),
    ]);
    let t = run_image(ProgramImage::new(Arc::new(halting)).with_functions(vec![g1, g2]));
    assert_eq!(t.text(), "main ");
    assert!(matches!(t.state, ProgramState::Halt(_)));
}

/// Static function variables persist across calls.
#[test]
fn static_variables_persist() {
    let f = Arc::new(
        FunctionDecl::new(
            "f",
            vec![],
            Arc::new(
                CodeBlock::new(vec![
                    op(Opcode::Load).name("n"),
                    op(Opcode::Load).literal(0),
                    op(Opcode::AddStore),
                    op(Opcode::Done).p1(1),
                ])
                .with_literals(vec![Literal::Int(1)]),
            ),
        )
        .with_statics(vec![StaticVar {
            name: Arc::from("n"),
            default: Some(Literal::Int(0)),
        }]),
    );

    let mut instrs = Vec::new();
    for _ in 0..3 {
        instrs.push(op(Opcode::Load).literal(0));
        instrs.push(op(Opcode::Call));
        instrs.push(op(Opcode::Consume).p1(1));
    }
    instrs.push(op(Opcode::Done));
    let main = CodeBlock::new(instrs)
        .with_literals(vec![Literal::Str(Arc::from("f"))]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_functions(vec![f]));
    assert_eq!(t.text(), "123");
}

/// A consumer abort propagates out of the dispatcher as an abort result,
/// with the operands cleaned up.
#[test]
fn consumer_abort_propagates() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Consume).p1(1),
        op(Opcode::Load).literal(0),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Str(Arc::from("chunk"))]);

    let mut vm = crate::interpreter::Vm::new();
    vm.set_consumer(Box::new(crate::output::AbortingConsumer::new(5)));
    vm.make_ready(ProgramImage::new(Arc::new(code)))
        .expect("image rejected");
    let state = vm.exec().expect("abort is not an error");
    assert_eq!(state, ProgramState::Abort);
    assert_eq!(vm.output_length(), 10);
}

/// A switch table evaluates case blocks in order and jumps to the match.
#[test]
fn switch_dispatch() {
    let case_block = |value: i64| {
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Done).p1(1),
            ])
            .with_literals(vec![Literal::Int(value)]),
        )
    };
    let table = Arc::new(phlox_asm::SwitchTable {
        cases: vec![
            phlox_asm::SwitchCase {
                code: case_block(1),
                target: 2,
            },
            phlox_asm::SwitchCase {
                code: case_block(2),
                target: 5,
            },
        ],
        default_target: Some(8),
        exit_target: 10,
    });

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Switch).p3(P3::Switch(table)),
        // case 1:
        op(Opcode::Load).literal(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Jmp).p2(10),
        // case 2:
        op(Opcode::Load).literal(2),
        op(Opcode::Consume).p1(1),
        op(Opcode::Jmp).p2(10),
        // default:
        op(Opcode::Load).literal(3),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Int(2),
        Literal::Str(Arc::from("one")),
        Literal::Str(Arc::from("two")),
        Literal::Str(Arc::from("other")),
    ]);

    let t = run_main(main);
    assert_eq!(t.text(), "two");
}
