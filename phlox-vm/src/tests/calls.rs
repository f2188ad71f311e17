//! Call and return behavior: frames, argument binding, recursion
//! ceiling, and stack balance across nested calls.

use std::sync::Arc;

use phlox_asm::{CodeBlock, FormalArg, FunctionDecl, Literal, Opcode, ProgramImage};

use super::test_helpers::{op, run_image};
use crate::interpreter::Vm;
use crate::output::MemoryConsumer;

/// `function inc(&$x) { $x = $x + 1; }  $a = 5; inc($a); print $a;`
#[test]
fn by_reference_parameter() {
    let inc = Arc::new(FunctionDecl::new(
        "inc",
        vec![FormalArg::untyped("x").by_ref()],
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).name("x"),
                op(Opcode::Load).literal(0),
                op(Opcode::AddStore),
                op(Opcode::Pop).p1(1),
                op(Opcode::Done),
            ])
            .with_literals(vec![Literal::Int(1)]),
        ),
    ));

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Store).name("a"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).name("a"),
        op(Opcode::Load).literal(1),
        op(Opcode::Call).p1(1),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).p1(1).name("a"),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(5), Literal::Str(Arc::from("inc"))]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_functions(vec![inc]));
    assert_eq!(t.text(), "6");
}

/// A missing argument picks up its default-value bytecode.
#[test]
fn default_argument() {
    let f = Arc::new(FunctionDecl::new(
        "f",
        vec![FormalArg::untyped("x").with_default(Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Done).p1(1),
            ])
            .with_literals(vec![Literal::Int(10)]),
        ))],
        Arc::new(CodeBlock::new(vec![
            op(Opcode::Load).name("x"),
            op(Opcode::Done).p1(1),
        ])),
    ));

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Call),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Str(Arc::from("f"))]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_functions(vec![f]));
    assert_eq!(t.text(), "10");
}

/// Stack balance under nested calls in one expression:
/// `print add(1, add(2, 3)) + add(4, 5);` → 15.
#[test]
fn nested_call_stack_balance() {
    let add = Arc::new(FunctionDecl::new(
        "add",
        vec![FormalArg::untyped("a"), FormalArg::untyped("b")],
        Arc::new(CodeBlock::new(vec![
            op(Opcode::Load).name("a"),
            op(Opcode::Load).name("b"),
            op(Opcode::Add),
            op(Opcode::Done).p1(1),
        ])),
    ));

    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(1),
        op(Opcode::Load).literal(2),
        op(Opcode::Load).literal(3),
        op(Opcode::Load).literal(0),
        op(Opcode::Call).p1(2),
        op(Opcode::Load).literal(0),
        op(Opcode::Call).p1(2),
        op(Opcode::Load).literal(4),
        op(Opcode::Load).literal(5),
        op(Opcode::Load).literal(0),
        op(Opcode::Call).p1(2),
        op(Opcode::Add),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("add")),
        Literal::Int(1),
        Literal::Int(2),
        Literal::Int(3),
        Literal::Int(4),
        Literal::Int(5),
    ]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_functions(vec![add]));
    assert_eq!(t.text(), "15");
    assert_eq!(t.vm.frames_depth(), 1);
}

/// Exceeding the recursion ceiling diagnoses and returns null instead of
/// overflowing.
#[test]
fn recursion_ceiling() {
    let f = Arc::new(FunctionDecl::new(
        "f",
        vec![],
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Call),
                op(Opcode::Done).p1(1),
            ])
            .with_literals(vec![Literal::Str(Arc::from("f"))]),
        ),
    ));
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Call),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("f")),
        Literal::Str(Arc::from("done")),
    ]);

    let mut vm = Vm::new();
    vm.set_recursion_limit(8);
    vm.set_error_reporting(false);
    let out = MemoryConsumer::new();
    vm.set_consumer(Box::new(out.clone()));
    vm.make_ready(ProgramImage::new(Arc::new(main)).with_functions(vec![f]))
        .expect("image rejected");
    vm.exec().expect("execution failed");
    assert_eq!(out.text(), "done");
    assert_eq!(vm.frames_depth(), 1);
}

/// `func_num_args` sees every supplied argument, extras included.
#[test]
fn variadic_arg_introspection() {
    let f = Arc::new(FunctionDecl::new(
        "f",
        vec![FormalArg::untyped("a")],
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Call),
                op(Opcode::Done).p1(1),
            ])
            .with_literals(vec![Literal::Str(Arc::from("func_num_args"))]),
        ),
    ));
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(1),
        op(Opcode::Load).literal(2),
        op(Opcode::Load).literal(3),
        op(Opcode::Load).literal(0),
        op(Opcode::Call).p1(3),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("f")),
        Literal::Int(7),
        Literal::Int(8),
        Literal::Int(9),
    ]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_functions(vec![f]));
    assert_eq!(t.text(), "3");
}

/// Type constraints: a scalar argument coerces to its hint.
#[test]
fn argument_coercion() {
    let f = Arc::new(FunctionDecl::new(
        "f",
        vec![FormalArg::untyped("x").with_hint(phlox_asm::TypeHint::Int)],
        Arc::new(CodeBlock::new(vec![
            op(Opcode::Load).name("x"),
            op(Opcode::Done).p1(1),
        ])),
    ));
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(1),
        op(Opcode::Load).literal(0),
        op(Opcode::Call).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("f")),
        Literal::Str(Arc::from("42 apples")),
    ]);

    let t = run_image(ProgramImage::new(Arc::new(main)).with_functions(vec![f]));
    assert_eq!(t.text(), "42");
}
