//! Universal properties of the value model and the reference table.

use quickcheck_macros::quickcheck;

use crate::frame::FrameStack;
use crate::reftable::RefTable;
use crate::value::{is_numeric_str, parse_numeric, Numeric, Value};

/// ToString ∘ ToString = ToString.
#[quickcheck]
fn string_coercion_idempotent(text: String) -> bool {
    let mut value = Value::str(&text);
    value.to_str();
    let first = value.str_bytes().to_vec();
    value.to_str();
    first == value.str_bytes()
}

/// ToInt ∘ ToInt = ToInt, starting from any real.
#[quickcheck]
fn int_coercion_idempotent(real: f64) -> bool {
    let mut value = Value::real(real);
    value.to_int();
    let first = value.cast_int();
    value.to_int();
    first == value.cast_int()
}

/// ToBool ∘ ToBool = ToBool.
#[quickcheck]
fn bool_coercion_idempotent(text: String) -> bool {
    let mut value = Value::str(&text);
    value.to_bool();
    let first = value.truthy();
    value.to_bool();
    first == value.truthy()
}

/// An integer survives the round trip through its string form.
#[quickcheck]
fn int_string_round_trip(int: i64) -> bool {
    let mut value = Value::int(int);
    value.to_str();
    parse_numeric(value.str_bytes()) == Numeric::Int(int)
}

/// Integer strings are detected as numeric.
#[quickcheck]
fn int_strings_are_numeric(int: i64) -> bool {
    is_numeric_str(int.to_string().as_bytes())
}

/// Loose comparison of plain integers is antisymmetric.
#[quickcheck]
fn compare_antisymmetric(a: i64, b: i64) -> bool {
    let rt = RefTable::new();
    let (x, y) = (Value::int(a), Value::int(b));
    x.compare(&y, false, &rt) == y.compare(&x, false, &rt).reverse()
}

/// Slot conservation: every slot reserved through name bindings comes
/// back to the free list once its bindings are removed.
#[quickcheck]
fn slot_conservation(names: Vec<u8>) -> bool {
    let mut rt = RefTable::new();
    let mut frames = FrameStack::new();
    let serial = frames.global().serial();

    let mut bound = Vec::new();
    for (index, _) in names.iter().enumerate() {
        let name: std::sync::Arc<str> = std::sync::Arc::from(format!("v{index}"));
        let slot = rt.reserve();
        frames.global_mut().bind(name.clone(), slot);
        rt.install_name_ref(slot, serial, name.clone());
        bound.push((name, slot));
    }
    let reserved = rt.reserved_total();
    assert_eq!(reserved, names.len() as u64);

    for (name, slot) in bound {
        frames.global_mut().vars.remove(&name);
        rt.remove_name_ref(slot, serial, &name);
    }
    rt.live_count() == 0 && rt.free_count() == names.len()
}

/// A pinned slot survives the loss of its last backref; a forced release
/// reclaims it.
#[test]
fn pinned_slots_survive_release() {
    let mut rt = RefTable::new();
    let mut frames = FrameStack::new();
    let slot = rt.reserve();
    rt.store(slot, &Value::int(7));
    rt.install_name_ref(slot, 0, std::sync::Arc::from("s"));
    rt.pin(slot);

    rt.release(slot, false, &mut frames);
    assert_eq!(rt.live_count(), 1);
    assert_eq!(rt.value(slot).cast_int(), 7);

    rt.release(slot, true, &mut frames);
    assert_eq!(rt.live_count(), 0);
}

/// Releasing a slot breaks array-node backrefs: the node vanishes from
/// the map.
#[test]
fn release_unlinks_array_nodes() {
    use crate::array::Hashmap;
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut rt = RefTable::new();
    let mut frames = FrameStack::new();
    let map = Rc::new(RefCell::new(Hashmap::new()));
    let slot = rt.reserve();
    rt.store(slot, &Value::int(3));
    let key = map.borrow_mut().insert(None, slot);
    rt.install_node_ref(slot, &map, key.clone());

    rt.release(slot, false, &mut frames);
    assert!(!map.borrow().contains(&key));
    assert_eq!(rt.live_count(), 0);
}
