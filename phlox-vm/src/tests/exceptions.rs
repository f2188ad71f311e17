//! Exception unwinding across nested calls, the uncaught handler, and
//! non-throwable throws.

use std::sync::Arc;

use phlox_asm::{
    CatchClause, ClassDecl, ClassFlags, CodeBlock, ExceptionBlock, FunctionDecl, Literal, Opcode,
    P3, ProgramImage,
};

use super::test_helpers::{op, run_image};
use crate::error::VmError;
use crate::interpreter::Vm;
use crate::output::MemoryConsumer;
use crate::state::ProgramState;

fn throwable_class() -> Arc<ClassDecl> {
    Arc::new(ClassDecl::new("E").with_flags(ClassFlags::THROWABLE))
}

/// A throw from three nested calls transfers control to the matching
/// catch exactly once, and the intermediate frames are gone.
#[test]
fn unwinding_through_nested_calls() {
    // inner() throws; mid() and outer() just call down.
    let inner = Arc::new(FunctionDecl::new(
        "inner",
        vec![],
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Store).name("local"),
                op(Opcode::Pop).p1(1),
                op(Opcode::Load).literal(1),
                op(Opcode::New),
                op(Opcode::Throw),
                op(Opcode::Done),
            ])
            .with_literals(vec![Literal::Int(99), Literal::Str(Arc::from("E"))]),
        ),
    ));
    let forwarder = |name: &str, callee: &str| {
        Arc::new(FunctionDecl::new(
            name,
            vec![],
            Arc::new(
                CodeBlock::new(vec![
                    op(Opcode::Load).literal(0),
                    op(Opcode::Call),
                    op(Opcode::Done).p1(1),
                ])
                .with_literals(vec![Literal::Str(Arc::from(callee))]),
            ),
        ))
    };
    let mid = forwarder("mid", "inner");
    let outer = forwarder("outer", "mid");

    let block = Arc::new(ExceptionBlock {
        catches: vec![CatchClause {
            class_name: Arc::from("E"),
            var_name: Arc::from("e"),
            target: 6,
        }],
    });
    let main = CodeBlock::new(vec![
        op(Opcode::LoadException).p2(6).p3(P3::Exception(block)),
        op(Opcode::Load).literal(0),
        op(Opcode::Call),
        op(Opcode::Pop).p1(1),
        op(Opcode::PopException),
        op(Opcode::Jmp).p2(8),
        op(Opcode::Load).literal(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("outer")),
        Literal::Str(Arc::from("caught")),
    ]);

    let t = run_image(
        ProgramImage::new(Arc::new(main))
            .with_functions(vec![inner, mid, outer])
            .with_classes(vec![throwable_class()]),
    );
    assert_eq!(t.text(), "caught");
    assert_eq!(t.vm.frames_depth(), 1);
    // The intermediate frames' locals are gone; only slots reachable from
    // globals survive.
    assert_eq!(t.vm.reftable().live_count(), 0);
}

/// An uncaught throw with no handler is a fatal error.
#[test]
fn uncaught_without_handler_is_fatal() {
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::New),
        op(Opcode::Throw),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Str(Arc::from("E"))]);

    let mut vm = Vm::new();
    let out = MemoryConsumer::new();
    vm.set_consumer(Box::new(out.clone()));
    vm.make_ready(ProgramImage::new(Arc::new(main)).with_classes(vec![throwable_class()]))
        .expect("image rejected");
    let err = vm.exec().expect_err("uncaught exception must be fatal");
    assert!(matches!(err, VmError::UncaughtException(_)));
    assert!(out.text().contains("uncaught exception"));
}

/// The installed uncaught-exception handler receives the exception and
/// the program completes normally.
#[test]
fn uncaught_handler_runs() {
    let handler = Arc::new(FunctionDecl::new(
        "on_uncaught",
        vec![phlox_asm::FormalArg::untyped("e")],
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Consume).p1(1),
                op(Opcode::Done),
            ])
            .with_literals(vec![Literal::Str(Arc::from("handled"))]),
        ),
    ));
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::Call).p1(1),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(2),
        op(Opcode::New),
        op(Opcode::Throw),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("on_uncaught")),
        Literal::Str(Arc::from("set_exception_handler")),
        Literal::Str(Arc::from("E")),
    ]);

    let t = run_image(
        ProgramImage::new(Arc::new(main))
            .with_functions(vec![handler])
            .with_classes(vec![throwable_class()]),
    );
    assert_eq!(t.text(), "handled");
    assert!(matches!(t.state, ProgramState::Return(_)));
}

/// Throwing a value whose class lacks the Throwable marker diagnoses and
/// continues.
#[test]
fn non_throwable_throw_is_recoverable() {
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Throw),
        op(Opcode::Load).literal(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(5), Literal::Str(Arc::from("after"))]);

    let mut vm = Vm::new();
    vm.set_error_reporting(false);
    let out = MemoryConsumer::new();
    vm.set_consumer(Box::new(out.clone()));
    vm.make_ready(ProgramImage::new(Arc::new(main)))
        .expect("image rejected");
    vm.exec().expect("execution failed");
    assert_eq!(out.text(), "after");
}

/// The first matching clause wins; non-matching inner regions fall
/// through to enclosing ones.
#[test]
fn nested_try_regions() {
    let other = Arc::new(ClassDecl::new("Other").with_flags(ClassFlags::THROWABLE));
    let inner_block = Arc::new(ExceptionBlock {
        catches: vec![CatchClause {
            class_name: Arc::from("Other"),
            var_name: Arc::from("e"),
            target: 8,
        }],
    });
    let outer_block = Arc::new(ExceptionBlock {
        catches: vec![CatchClause {
            class_name: Arc::from("E"),
            var_name: Arc::from("e"),
            target: 11,
        }],
    });
    let main = CodeBlock::new(vec![
        op(Opcode::LoadException).p2(11).p3(P3::Exception(outer_block)),
        op(Opcode::LoadException).p2(8).p3(P3::Exception(inner_block)),
        op(Opcode::Load).literal(0),
        op(Opcode::New),
        op(Opcode::Throw),
        op(Opcode::PopException),
        op(Opcode::PopException),
        op(Opcode::Jmp).p2(13),
        // inner catch (Other): not taken
        op(Opcode::Load).literal(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Jmp).p2(13),
        // outer catch (E):
        op(Opcode::Load).literal(2),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Str(Arc::from("E")),
        Literal::Str(Arc::from("wrong")),
        Literal::Str(Arc::from("outer")),
    ]);

    let t = run_image(
        ProgramImage::new(Arc::new(main)).with_classes(vec![throwable_class(), other]),
    );
    assert_eq!(t.text(), "outer");
}
