//! Make-ready validation of program images.

use std::sync::Arc;

use phlox_asm::{ClassDecl, CodeBlock, Literal, Opcode, ProgramImage};

use super::test_helpers::op;
use crate::error::{ImageError, VmError};
use crate::interpreter::Vm;

#[test]
fn rejects_unterminated_block() {
    let main = CodeBlock::new(vec![op(Opcode::Noop)]);
    let mut vm = Vm::new();
    let err = vm
        .make_ready(ProgramImage::new(Arc::new(main)))
        .expect_err("must reject");
    assert!(matches!(
        err,
        VmError::InvalidImage(ImageError::MissingDone)
    ));
}

#[test]
fn rejects_out_of_bounds_jump() {
    let main = CodeBlock::new(vec![op(Opcode::Jmp).p2(99), op(Opcode::Done)]);
    let mut vm = Vm::new();
    let err = vm
        .make_ready(ProgramImage::new(Arc::new(main)))
        .expect_err("must reject");
    assert!(matches!(
        err,
        VmError::InvalidImage(ImageError::JumpOutOfBounds { at: 0, target: 99 })
    ));
}

#[test]
fn rejects_out_of_bounds_literal() {
    let main = CodeBlock::new(vec![op(Opcode::Load).literal(3), op(Opcode::Done)])
        .with_literals(vec![Literal::Int(1)]);
    let mut vm = Vm::new();
    let err = vm
        .make_ready(ProgramImage::new(Arc::new(main)))
        .expect_err("must reject");
    assert!(matches!(
        err,
        VmError::InvalidImage(ImageError::LiteralOutOfBounds { at: 0, index: 3 })
    ));
}

#[test]
fn rejects_unknown_base_class() {
    let class = Arc::new(ClassDecl::new("Child").extends("Missing"));
    let main = CodeBlock::new(vec![op(Opcode::Done)]);
    let mut vm = Vm::new();
    let err = vm
        .make_ready(ProgramImage::new(Arc::new(main)).with_classes(vec![class]))
        .expect_err("must reject");
    assert!(matches!(
        err,
        VmError::InvalidImage(ImageError::UnknownClassRef { .. })
    ));
}

#[test]
fn rejects_duplicate_class() {
    let a = Arc::new(ClassDecl::new("Twice"));
    let b = Arc::new(ClassDecl::new("Twice"));
    let main = CodeBlock::new(vec![op(Opcode::Done)]);
    let mut vm = Vm::new();
    let err = vm
        .make_ready(ProgramImage::new(Arc::new(main)).with_classes(vec![a, b]))
        .expect_err("must reject");
    assert!(matches!(
        err,
        VmError::InvalidImage(ImageError::DuplicateClass(_))
    ));
}

#[test]
fn exec_without_image_is_an_error() {
    let mut vm = Vm::new();
    assert!(matches!(vm.exec(), Err(VmError::NotReady)));
}
