//! Reference-table behavior observed from programs: alias coherence,
//! unset propagation, array-element references, and superglobals.

use std::sync::Arc;

use phlox_asm::{CodeBlock, Literal, Opcode, ProgramImage};

use super::test_helpers::{op, run_main};
use crate::interpreter::Vm;
use crate::output::MemoryConsumer;
use crate::value::Value;

/// `$a = 1; $b = &$a; unset($b);` reclaims the shared slot: both bindings
/// are gone.
#[test]
fn unset_propagates_through_aliases() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Store).name("a"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).name("a"),
        op(Opcode::StoreRef).name("b"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).name("b"),
        op(Opcode::Load).literal(1),
        op(Opcode::Call).p1(1),
        op(Opcode::Pop).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(1), Literal::Str(Arc::from("unset"))]);

    let t = run_main(code);
    assert_eq!(t.vm.resolve_var("a"), None);
    assert_eq!(t.vm.resolve_var("b"), None);
    assert_eq!(t.vm.reftable().live_count(), 0);
}

/// `$arr = [1]; $r = &$arr[0]; $r = 9; print $arr[0];`
#[test]
fn array_element_reference() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Load).literal(1),
        op(Opcode::LoadMap).p1(2),
        op(Opcode::Store).name("arr"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).p1(1).name("arr"),
        op(Opcode::Load).literal(2),
        op(Opcode::LoadIdx).p1(1),
        op(Opcode::StoreRef).name("r"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(3),
        op(Opcode::Store).name("r"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).p1(1).name("arr"),
        op(Opcode::Load).literal(2),
        op(Opcode::LoadIdx).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Null,
        Literal::Int(1),
        Literal::Int(0),
        Literal::Int(9),
    ]);

    let t = run_main(code);
    assert_eq!(t.text(), "9");
}

/// Reference markers alias array nodes: two entries sharing one slot
/// observe each other's writes.
#[test]
fn array_nodes_can_share_a_slot() {
    let code = CodeBlock::new(vec![
        // $v = 1;
        op(Opcode::Load).literal(1),
        op(Opcode::Store).name("v"),
        op(Opcode::Pop).p1(1),
        // $arr = [];
        op(Opcode::LoadMap),
        op(Opcode::Store).name("arr"),
        op(Opcode::Pop).p1(1),
        // $arr[0] = &$v;  (reference marker insert)
        op(Opcode::Load).p1(1).name("arr"),
        op(Opcode::Load).literal(2),
        op(Opcode::Load).name("v"),
        op(Opcode::LoadRef),
        op(Opcode::StoreIdxRef).p1(1),
        op(Opcode::Pop).p1(1),
        // $v = 7;
        op(Opcode::Load).literal(3),
        op(Opcode::Store).name("v"),
        op(Opcode::Pop).p1(1),
        // print $arr[0];
        op(Opcode::Load).p1(1).name("arr"),
        op(Opcode::Load).literal(2),
        op(Opcode::LoadIdx).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![
        Literal::Null,
        Literal::Int(1),
        Literal::Int(0),
        Literal::Int(7),
    ]);

    let t = run_main(code);
    assert_eq!(t.text(), "7");
}

/// Globals registered at global scope appear in `$GLOBALS`.
#[test]
fn globals_superglobal_aliases_globals() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Store).name("x"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).p1(1).name("GLOBALS"),
        op(Opcode::Load).literal(1),
        op(Opcode::LoadIdx).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(41), Literal::Str(Arc::from("x"))]);

    let mut vm = Vm::new();
    vm.create_superglobal("GLOBALS");
    let out = MemoryConsumer::new();
    vm.set_consumer(Box::new(out.clone()));
    vm.make_ready(ProgramImage::new(Arc::new(code)))
        .expect("image rejected");
    vm.exec().expect("execution failed");
    assert_eq!(out.text(), "41");
}

/// Superglobal entries fed by the embedder are visible to programs.
#[test]
fn superglobal_entries() {
    let code = CodeBlock::new(vec![
        op(Opcode::Load).p1(1).name("_GET"),
        op(Opcode::Load).literal(0),
        op(Opcode::LoadIdx).p1(1),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Str(Arc::from("q"))]);

    let mut vm = Vm::new();
    vm.set_superglobal_entry("_GET", &Value::str("q"), Value::str("phlox"));
    let out = MemoryConsumer::new();
    vm.set_consumer(Box::new(out.clone()));
    vm.make_ready(ProgramImage::new(Arc::new(code)))
        .expect("image rejected");
    vm.exec().expect("execution failed");
    assert_eq!(out.text(), "phlox");
}

/// The `global` statement links a name from the global frame into a
/// function frame.
#[test]
fn uplink_binds_global() {
    use phlox_asm::FunctionDecl;
    let f = Arc::new(FunctionDecl::new(
        "bump",
        vec![],
        Arc::new(
            CodeBlock::new(vec![
                op(Opcode::Load).literal(0),
                op(Opcode::Uplink).p1(1),
                op(Opcode::Load).name("g"),
                op(Opcode::Load).literal(1),
                op(Opcode::AddStore),
                op(Opcode::Pop).p1(1),
                op(Opcode::Done),
            ])
            .with_literals(vec![Literal::Str(Arc::from("g")), Literal::Int(1)]),
        ),
    ));
    let main = CodeBlock::new(vec![
        op(Opcode::Load).literal(0),
        op(Opcode::Store).name("g"),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).literal(1),
        op(Opcode::Call),
        op(Opcode::Pop).p1(1),
        op(Opcode::Load).p1(1).name("g"),
        op(Opcode::Consume).p1(1),
        op(Opcode::Done),
    ])
    .with_literals(vec![Literal::Int(10), Literal::Str(Arc::from("bump"))]);

    let t = super::test_helpers::run_image(
        ProgramImage::new(Arc::new(main)).with_functions(vec![f]),
    );
    assert_eq!(t.text(), "11");
}
