use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Instruction opcodes of the Phlox VM.
///
/// Every instruction is a fixed-size record `(opcode, p1, p2, p3)`; the
/// per-variant documentation states which operands the dispatcher reads.
/// `p2` always holds an absolute instruction index when it encodes a jump
/// target. `p3` payloads are typed; see [`crate::P3`].
pub enum Opcode {
    /// No operation. Reserved alongside [`Opcode::ErrCtrl`] for source
    /// compatibility; the dispatcher only advances the program counter.
    Noop = 0x00,

    /// Terminate the current dispatch normally.
    ///
    /// | `p1` | when non-zero, the top of stack is consumed as the result |
    ///
    /// Every code block ends with a `Done`; make-ready rejects images
    /// without one.
    Done = 0x01,

    /// Terminate the whole program immediately.
    ///
    /// | `p1` | when non-zero, the top of stack is the exit status or message |
    ///
    /// Shutdown callbacks do **not** run after a `Halt`.
    Halt = 0x02,

    /// Unconditional jump. `p2` is the absolute target index.
    Jmp = 0x03,

    /// Coerce the top of stack to bool and jump to `p2` when false.
    ///
    /// | `p1` | when non-zero, keep the tested value on the stack |
    Jz = 0x04,

    /// Coerce the top of stack to bool and jump to `p2` when true.
    ///
    /// | `p1` | when non-zero, keep the tested value on the stack |
    Jnz = 0x05,

    /// Pop `p1` values, clamped to the current stack depth.
    Pop = 0x06,

    /// Coerce the top of stack to integer in place.
    CvtInt = 0x07,
    /// Coerce the top of stack to real in place.
    CvtReal = 0x08,
    /// Coerce the top of stack to string in place.
    CvtStr = 0x09,
    /// Coerce the top of stack to bool in place.
    CvtBool = 0x0a,
    /// Release the top of stack to null in place.
    CvtNull = 0x0b,
    /// Coerce the top of stack to its numeric form (int or real) in place.
    CvtNumc = 0x0c,
    /// Coerce the top of stack to an array in place.
    CvtArray = 0x0d,
    /// Coerce the top of stack to an object in place.
    CvtObj = 0x0e,

    /// Push a variable's value or a literal.
    ///
    /// | `p1` | when non-zero, lookup only; missing variables are not created |
    /// | `p3` | `Name`: resolve through superglobals then the active frame; `Literal`: push from the pool; `None`: the name is popped from the stack |
    ///
    /// A created variable at global scope is also registered in `$GLOBALS`.
    /// The pushed value carries its slot index for later by-reference use.
    Load = 0x0f,

    /// Push a registered built-in constant named by `p3`, invoking its
    /// expansion callback on each use. An unregistered name reads as
    /// itself (bareword semantics).
    Loadc = 0x10,

    /// Pop `p1` values (`p1 / 2` key-value pairs) and push a freshly built
    /// array. A null key selects the next automatic integer index.
    LoadMap = 0x11,

    /// Index read on an array, object, or string.
    ///
    /// | `p1` | when non-zero, a key is on top of the stack above the target |
    /// | `p2` | when non-zero, create the missing element instead of pushing null |
    ///
    /// Strings index by byte offset; objects route through `__get` /
    /// `offsetGet`; a missing element without create pushes null and emits a
    /// diagnostic.
    LoadIdx = 0x12,

    /// Destructure the array on top into the `p1` previously-pushed variable
    /// targets, consuming all of them, in numeric key order.
    LoadList = 0x13,

    /// Turn the top of stack into a reference marker carrying its slot
    /// index, for consumption by [`Opcode::StoreIdxRef`].
    LoadRef = 0x14,

    /// Instantiate the closure template in `p3`: clone the function under a
    /// fresh unique name, capture the current frame's values for each listed
    /// import, and push the generated name.
    LoadClosure = 0x15,

    /// Enter a try region: push the exception descriptor in `p3` onto the
    /// exception stack and open an Exception-marked helper frame whose jump
    /// target is `p2`.
    LoadException = 0x16,

    /// Leave a try region: pop the exception descriptor and its helper
    /// frame.
    PopException = 0x17,

    /// Assign the top of stack.
    ///
    /// | `p2` | when non-zero, the target slot index is carried by the next value on the stack (member/element assignment) |
    /// | `p3` | `Name`: assign to the named variable in the active frame |
    ///
    /// The assigned value remains on the stack.
    Store = 0x18,

    /// Insert or update an array element, a string byte, or an object
    /// attribute (`__set` / `offsetSet`).
    ///
    /// | `p1` | when non-zero, a key is on the stack between target and value |
    ///
    /// String writes are byte-level: a write past the end appends exactly
    /// one byte regardless of the written value's length.
    StoreIdx = 0x19,

    /// `StoreIdx` with aliasing: the element is made to share the slot of
    /// the reference marker produced by [`Opcode::LoadRef`] instead of
    /// receiving a copy.
    StoreIdxRef = 0x1a,

    /// Bind the name in `p3` as an alias of the slot carried by the top of
    /// stack (`$a = &$b`).
    StoreRef = 0x1b,

    /// Link `p1` names, popped from the stack, into the current frame from
    /// the nearest enclosing non-helper ancestor frame (the `global`
    /// statement).
    Uplink = 0x1c,

    /// Numeric increment of the slot carried by the top of stack.
    ///
    /// | `p1` | non-zero selects pre-increment, zero post-increment |
    Incr = 0x1d,

    /// Numeric decrement of the slot carried by the top of stack.
    ///
    /// | `p1` | non-zero selects pre-decrement, zero post-decrement |
    Decr = 0x1e,

    /// Arithmetic negation of the top of stack.
    Uminus = 0x1f,
    /// Numeric cast of the top of stack (unary plus).
    Uplus = 0x20,
    /// Bitwise complement of the top of stack.
    Bitnot = 0x21,
    /// Logical negation of the top of stack.
    Lnot = 0x22,

    /// Pop two values and push their sum; arrays unite (left keys win).
    Add = 0x23,
    /// Pop two values and push their difference.
    Sub = 0x24,
    /// Pop two values and push their product.
    Mul = 0x25,
    /// Pop two values and push their quotient. Division by zero raises a
    /// fault and pushes zero.
    Div = 0x26,
    /// Pop two values and push the remainder. A zero divisor raises a fault
    /// and pushes zero.
    Mod = 0x27,
    /// Integer shift left.
    Shl = 0x28,
    /// Integer shift right.
    Shr = 0x29,
    /// Integer bitwise and.
    Band = 0x2a,
    /// Integer bitwise or.
    Bor = 0x2b,
    /// Integer bitwise xor.
    Bxor = 0x2c,

    /// [`Opcode::Add`] that also writes the result back to the slot carried
    /// by the first operand.
    AddStore = 0x2d,
    /// [`Opcode::Sub`] with write-back.
    SubStore = 0x2e,
    /// [`Opcode::Mul`] with write-back.
    MulStore = 0x2f,
    /// [`Opcode::Div`] with write-back.
    DivStore = 0x30,
    /// [`Opcode::Mod`] with write-back.
    ModStore = 0x31,
    /// [`Opcode::Shl`] with write-back.
    ShlStore = 0x32,
    /// [`Opcode::Shr`] with write-back.
    ShrStore = 0x33,
    /// [`Opcode::Band`] with write-back.
    BandStore = 0x34,
    /// [`Opcode::Bor`] with write-back.
    BorStore = 0x35,
    /// [`Opcode::Bxor`] with write-back.
    BxorStore = 0x36,

    /// Concatenate the top `p1` values after string coercion and push the
    /// result.
    Cat = 0x37,
    /// Two-operand concatenation with write-back to the first operand's
    /// slot.
    CatStore = 0x38,

    /// Loose equality. When `p2` is zero the boolean result is pushed;
    /// otherwise the result is consumed and the dispatcher jumps to `p2` on
    /// truth.
    Eq = 0x39,
    /// Loose inequality; `p2` as for [`Opcode::Eq`].
    Neq = 0x3a,
    /// Less-than; `p2` as for [`Opcode::Eq`].
    Lt = 0x3b,
    /// Less-or-equal; `p2` as for [`Opcode::Eq`].
    Le = 0x3c,
    /// Greater-than; `p2` as for [`Opcode::Eq`].
    Gt = 0x3d,
    /// Greater-or-equal; `p2` as for [`Opcode::Eq`].
    Ge = 0x3e,

    /// Strict (type and value) equality; `p2` as for [`Opcode::Eq`].
    Teq = 0x3f,
    /// Strict inequality; `p2` as for [`Opcode::Eq`].
    Tne = 0x40,
    /// Strict string equality; `p2` as for [`Opcode::Eq`].
    Seq = 0x41,
    /// Strict string inequality; `p2` as for [`Opcode::Eq`].
    Sne = 0x42,

    /// Final boolean combiner for `&&`; short-circuiting is compiled with
    /// [`Opcode::Jz`] / [`Opcode::Jnz`].
    Land = 0x43,
    /// Final boolean combiner for `||`.
    Lor = 0x44,
    /// Boolean exclusive or.
    Lxor = 0x45,

    /// Pop a class-or-instance target and a value; push whether the value's
    /// class is the target, derives from it, or implements it.
    IsA = 0x46,

    /// Resolve `obj->member` or `Class::member`.
    ///
    /// | `p1` | non-zero for static (`::`) access |
    /// | `p2` | non-zero when the member is called as a method |
    /// | `p3` | `Name`: the member name; `None`: popped from the stack |
    ///
    /// Pushes the attribute value, or a bound-method callable for a
    /// subsequent [`Opcode::Call`]. Visibility is checked against the
    /// nearest enclosing method frame's class.
    Member = 0x47,

    /// Instantiate the class named on the stack with `p1` arguments,
    /// invoking `__construct` when present, and push the instance.
    New = 0x48,

    /// Deep-copy the instance on top of the stack, invoking `__clone` when
    /// defined.
    Clone = 0x49,

    /// Evaluate each case block of the table in `p3` against the top of
    /// stack in order; jump to the first match, else to the default or exit
    /// target.
    Switch = 0x4a,

    /// Call the callee on top of the stack with the `p1` values below it as
    /// arguments.
    ///
    /// A string callee names a user function (overload selection by
    /// signature), a foreign function, or a generated closure; an array
    /// callee is an `[instance, method]` pair; an object callee routes
    /// through `__invoke`.
    Call = 0x4b,

    /// Throw the value on top of the stack; see the exception unit for the
    /// unwinding contract.
    Throw = 0x4c,

    /// Create an iterator over the array or object on top of the stack,
    /// bound to the descriptor in `p3`. Jumps to `p2` when the subject is
    /// not iterable.
    ForeachInit = 0x4d,

    /// Advance the iterator: populate the descriptor's key/value variables
    /// (by reference when the descriptor says so) or jump to the exit target
    /// in `p2`.
    ForeachStep = 0x4e,

    /// No-op reserved for the error-control operator (`@`).
    ErrCtrl = 0x4f,

    /// Coerce the top `p1` values to strings and flush them, bottom-most
    /// first, to the output consumer.
    Consume = 0x50,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_discriminants_are_dense_and_unique() {
        let codes: Vec<u8> = Opcode::iter().map(|op| op as u8).collect();
        for (expected, code) in codes.iter().enumerate() {
            assert_eq!(expected as u8, *code);
        }
    }
}
