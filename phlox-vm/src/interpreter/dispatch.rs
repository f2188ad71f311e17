//! The bytecode dispatch loop.
//!
//! One call runs one code block to `Done`, `Halt`, an unhandled throw, or
//! a consumer abort. The program counter advances by one per iteration;
//! jumps set it directly. Stack growth is bounded by the program length,
//! so callers pre-allocate the operand stack at program size plus a small
//! guard.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use phlox_asm::{CodeBlock, Fault, Instr, Opcode, P3};

use crate::array::{ArrayKey, Hashmap};
use crate::consts::STACK_GUARD;
use crate::error::VmError;
use crate::interpreter::exception::ThrowOutcome;
use crate::interpreter::{ForeachState, IterSubject, Vm};
use crate::state::ExecuteState;
use crate::value::{Numeric, Value};

/// Outcome of an operation that may have run user code.
pub(crate) enum OpOut {
    /// A value to push.
    Value(Value),
    /// An exception is pending.
    Threw,
    /// A `Halt` ran inside.
    Halt(Value),
    /// The consumer aborted.
    Abort,
}

/// What the dispatcher does after one instruction.
enum Flow {
    Next,
    Jump(u32),
    Return(ExecuteState),
}

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().unwrap_or_else(Value::null)
}

/// Take the top `n` values, preserving bottom-to-top order.
fn drain_top(stack: &mut Vec<Value>, n: usize) -> Vec<Value> {
    let n = n.min(stack.len());
    stack.split_off(stack.len() - n)
}

impl Vm {
    /// Run a code block to completion.
    pub(crate) fn dispatch(
        &mut self,
        code: &CodeBlock,
        stack: &mut Vec<Value>,
        is_callback: bool,
    ) -> Result<ExecuteState, VmError> {
        self.dispatch_depth += 1;
        tracing::trace!(depth = self.dispatch_depth, is_callback, "dispatch");
        let result = self.dispatch_inner(code, stack);
        // Try regions abandoned by a return inside the block die with it.
        self.purge_exception_entries();
        self.dispatch_depth -= 1;
        result
    }

    fn dispatch_inner(
        &mut self,
        code: &CodeBlock,
        stack: &mut Vec<Value>,
    ) -> Result<ExecuteState, VmError> {
        let mut pc: usize = 0;
        loop {
            let Some(instr) = code.instrs.get(pc) else {
                // The image always carries a trailing Done; running off the
                // end means a jump table was wrong. Fail loudly.
                return Err(VmError::Bug("program counter ran past the code block"));
            };
            tracing::trace!(pc, op = ?instr.op, "step");
            match self.step(instr, code, stack)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target as usize,
                Flow::Return(state) => {
                    self.drain_stack(stack);
                    return Ok(state);
                }
            }
        }
    }

    fn drain_stack(&mut self, stack: &mut Vec<Value>) {
        while let Some(value) = stack.pop() {
            self.release_value(value);
        }
    }

    /// Map an operation outcome back into dispatch flow, resolving a
    /// pending throw at this site.
    fn finish_out(&mut self, out: OpOut, stack: &mut Vec<Value>) -> Result<Flow, VmError> {
        match out {
            OpOut::Value(value) => {
                stack.push(value);
                Ok(Flow::Next)
            }
            OpOut::Threw => match self.resolve_throw() {
                ThrowOutcome::Caught(target) => {
                    // The interrupted statement's operands are dead.
                    self.drain_stack(stack);
                    Ok(Flow::Jump(target))
                }
                ThrowOutcome::Propagate => Ok(Flow::Return(ExecuteState::Throwing)),
                ThrowOutcome::Ignored => {
                    stack.push(Value::null());
                    Ok(Flow::Next)
                }
            },
            OpOut::Halt(value) => Ok(Flow::Return(ExecuteState::Halt(value))),
            OpOut::Abort => Ok(Flow::Return(ExecuteState::Abort)),
        }
    }

    fn step(
        &mut self,
        instr: &Instr,
        code: &CodeBlock,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, VmError> {
        let flow = match instr.op {
            Opcode::Noop | Opcode::ErrCtrl => Flow::Next,

            Opcode::Done => {
                let value = if instr.p1 != 0 {
                    pop(stack)
                } else {
                    Value::null()
                };
                Flow::Return(ExecuteState::Done(value))
            }
            Opcode::Halt => {
                let value = if instr.p1 != 0 {
                    pop(stack)
                } else {
                    Value::null()
                };
                Flow::Return(ExecuteState::Halt(value))
            }

            Opcode::Jmp => Flow::Jump(instr.p2),
            Opcode::Jz | Opcode::Jnz => {
                let truthy = stack.last().map(Value::truthy).unwrap_or(false);
                if instr.p1 == 0 {
                    let value = pop(stack);
                    self.release_value(value);
                }
                let take = if instr.op == Opcode::Jz { !truthy } else { truthy };
                if take {
                    Flow::Jump(instr.p2)
                } else {
                    Flow::Next
                }
            }

            Opcode::Pop => {
                let n = (instr.p1.max(0) as usize).min(stack.len());
                for _ in 0..n {
                    let value = pop(stack);
                    self.release_value(value);
                }
                Flow::Next
            }

            Opcode::CvtInt => {
                if let Some(top) = stack.last_mut() {
                    top.to_int();
                }
                Flow::Next
            }
            Opcode::CvtReal => {
                if let Some(top) = stack.last_mut() {
                    top.to_real();
                }
                Flow::Next
            }
            Opcode::CvtBool => {
                if let Some(top) = stack.last_mut() {
                    top.to_bool();
                }
                Flow::Next
            }
            Opcode::CvtNumc => {
                if let Some(top) = stack.last_mut() {
                    top.to_numeric();
                }
                Flow::Next
            }
            Opcode::CvtNull => {
                if let Some(top) = stack.last_mut() {
                    top.clear();
                }
                Flow::Next
            }
            Opcode::CvtStr => {
                let is_object = stack.last().map(Value::is_object).unwrap_or(false);
                if is_object {
                    let top = pop(stack);
                    match self.coerce_str(&top)? {
                        Ok(bytes) => {
                            self.release_value(top);
                            stack.push(Value::bytes(bytes));
                            Flow::Next
                        }
                        Err(out) => {
                            self.release_value(top);
                            return self.finish_out(out, stack);
                        }
                    }
                } else {
                    if let Some(top) = stack.last_mut() {
                        top.to_str();
                    }
                    Flow::Next
                }
            }
            Opcode::CvtArray => {
                let top = pop(stack);
                let array = self.value_to_array(top);
                stack.push(array);
                Flow::Next
            }
            Opcode::CvtObj => {
                let top = pop(stack);
                let object = self.value_to_object(top);
                stack.push(object);
                Flow::Next
            }

            Opcode::Load => match &instr.p3 {
                P3::Literal(index) => {
                    let value = code
                        .literals
                        .get(*index)
                        .map(Value::from_literal)
                        .unwrap_or_else(Value::null);
                    stack.push(value);
                    Flow::Next
                }
                P3::Name(name) => {
                    let name = name.clone();
                    self.op_load_var(&name, instr.p1 != 0, stack)?
                }
                _ => {
                    let name_value = pop(stack);
                    let name: Arc<str> =
                        Arc::from(String::from_utf8_lossy(&name_value.cast_str()).as_ref());
                    self.release_value(name_value);
                    self.op_load_var(&name, instr.p1 != 0, stack)?
                }
            },

            Opcode::Loadc => {
                let name = match &instr.p3 {
                    P3::Name(name) => name.clone(),
                    _ => Arc::from(""),
                };
                match self.constants.resolve(&name) {
                    Some(value) => stack.push(value.detached()),
                    // Bareword: an unregistered constant reads as its own
                    // name.
                    None => stack.push(Value::str(&*name)),
                }
                Flow::Next
            }

            Opcode::LoadMap => {
                let n = instr.p1.max(0) as usize;
                let items = drain_top(stack, n);
                let map = Rc::new(RefCell::new(Hashmap::new()));
                let mut iter = items.into_iter();
                while let Some(key_value) = iter.next() {
                    let Some(value) = iter.next() else {
                        self.release_value(key_value);
                        break;
                    };
                    let key = if key_value.is_null() {
                        None
                    } else {
                        Some(ArrayKey::from_value(&key_value))
                    };
                    let slot = self.reftable.reserve();
                    self.reftable.store(slot, &value);
                    let used = map.borrow_mut().insert(key, slot);
                    self.reftable.install_node_ref(slot, &map, used);
                    self.release_value(key_value);
                    self.release_value(value);
                }
                stack.push(Value::array(map));
                Flow::Next
            }

            Opcode::LoadIdx => {
                let key = if instr.p1 != 0 { Some(pop(stack)) } else { None };
                let target = pop(stack);
                self.op_load_idx(target, key, instr.p2 != 0, stack)?
            }

            Opcode::LoadList => {
                let n = instr.p1.max(0) as usize;
                let array = pop(stack);
                let targets = drain_top(stack, n);
                if let Some(map) = array.as_array().cloned() {
                    for (index, target) in targets.iter().enumerate() {
                        if !target.slot().is_valid() {
                            continue;
                        }
                        let value = map
                            .borrow()
                            .get(&ArrayKey::Int(index as i64))
                            .map(|slot| self.reftable.value(slot).clone())
                            .unwrap_or_else(Value::null);
                        self.reftable.store(target.slot(), &value);
                    }
                }
                for target in targets {
                    self.release_value(target);
                }
                self.release_value(array);
                Flow::Next
            }

            Opcode::LoadRef => {
                let top = pop(stack);
                if top.slot().is_valid() {
                    stack.push(Value::ref_marker(top.slot()));
                } else {
                    self.diag(
                        Fault::InvalidOperands,
                        "cannot take a reference of a temporary",
                    )?;
                    stack.push(top);
                }
                Flow::Next
            }

            Opcode::LoadClosure => {
                if let P3::Function(template) = &instr.p3 {
                    let template = template.clone();
                    self.op_load_closure(&template, stack);
                }
                Flow::Next
            }

            Opcode::LoadException => {
                if let P3::Exception(block) = &instr.p3 {
                    self.op_load_exception(block.clone(), instr.p2);
                }
                Flow::Next
            }
            Opcode::PopException => {
                self.op_pop_exception();
                Flow::Next
            }

            Opcode::Store => {
                if instr.p2 != 0 {
                    let value = pop(stack);
                    let carrier = pop(stack);
                    if carrier.slot().is_valid() {
                        self.reftable.store(carrier.slot(), &value);
                        let mut pushed = value;
                        pushed.slot = carrier.slot();
                        stack.push(pushed);
                    } else {
                        self.diag(
                            Fault::ConstantAsVariable,
                            "store target is not addressable",
                        )?;
                        stack.push(value);
                    }
                    self.release_value(carrier);
                } else {
                    let name: Arc<str> = match &instr.p3 {
                        P3::Name(name) => name.clone(),
                        _ => {
                            let name_value = pop(stack);
                            let name =
                                Arc::from(String::from_utf8_lossy(&name_value.cast_str()).as_ref());
                            self.release_value(name_value);
                            name
                        }
                    };
                    let mut value = pop(stack);
                    let slot = self.store_var(&name, &value);
                    value.slot = slot;
                    stack.push(value);
                }
                Flow::Next
            }

            Opcode::StoreIdx => {
                let value = pop(stack);
                let key = if instr.p1 != 0 { Some(pop(stack)) } else { None };
                let target = pop(stack);
                self.op_store_idx(target, key, value, false, stack)?
            }
            Opcode::StoreIdxRef => {
                let value = pop(stack);
                let key = if instr.p1 != 0 { Some(pop(stack)) } else { None };
                let target = pop(stack);
                self.op_store_idx(target, key, value, true, stack)?
            }

            Opcode::StoreRef => {
                let name = match &instr.p3 {
                    P3::Name(name) => name.clone(),
                    _ => Arc::from(""),
                };
                let slot = stack.last().map(Value::slot).unwrap_or_default();
                if slot.is_valid() {
                    self.bind_ref(&name, slot);
                } else {
                    self.diag(
                        Fault::InvalidOperands,
                        format!("cannot bind {name} to a temporary"),
                    )?;
                }
                Flow::Next
            }

            Opcode::Uplink => {
                let n = instr.p1.max(0) as usize;
                for _ in 0..n {
                    let name_value = pop(stack);
                    let name: Arc<str> =
                        Arc::from(String::from_utf8_lossy(&name_value.cast_str()).as_ref());
                    self.release_value(name_value);
                    self.op_uplink(&name);
                }
                Flow::Next
            }

            Opcode::Incr | Opcode::Decr => {
                let top = pop(stack);
                let slot = top.slot();
                let delta = if instr.op == Opcode::Incr { 1 } else { -1 };
                let (old, new) = match top.cast_numeric() {
                    Numeric::Int(i) => (
                        Value::int(i),
                        match i.checked_add(delta) {
                            Some(next) => Value::int(next),
                            None => Value::real(i as f64 + delta as f64),
                        },
                    ),
                    Numeric::Real(r) => (Value::real(r), Value::real(r + delta as f64)),
                };
                if slot.is_valid() {
                    self.reftable.store(slot, &new);
                }
                let mut pushed = if instr.p1 != 0 { new } else { old };
                pushed.slot = slot;
                self.release_value(top);
                stack.push(pushed);
                Flow::Next
            }

            Opcode::Uminus => {
                let value = pop(stack);
                let result = match value.cast_numeric() {
                    Numeric::Int(i) => match i.checked_neg() {
                        Some(n) => Value::int(n),
                        None => Value::real(-(i as f64)),
                    },
                    Numeric::Real(r) => Value::real(-r),
                };
                self.release_value(value);
                stack.push(result);
                Flow::Next
            }
            Opcode::Uplus => {
                if let Some(top) = stack.last_mut() {
                    top.to_numeric();
                }
                Flow::Next
            }
            Opcode::Bitnot => {
                let value = pop(stack);
                let result = Value::int(!value.cast_int());
                self.release_value(value);
                stack.push(result);
                Flow::Next
            }
            Opcode::Lnot => {
                let value = pop(stack);
                let result = Value::bool(!value.truthy());
                self.release_value(value);
                stack.push(result);
                Flow::Next
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Band
            | Opcode::Bor
            | Opcode::Bxor => {
                let b = pop(stack);
                let a = pop(stack);
                let result = self.arith(instr.op, a, b)?;
                stack.push(result);
                Flow::Next
            }

            Opcode::AddStore
            | Opcode::SubStore
            | Opcode::MulStore
            | Opcode::DivStore
            | Opcode::ModStore
            | Opcode::ShlStore
            | Opcode::ShrStore
            | Opcode::BandStore
            | Opcode::BorStore
            | Opcode::BxorStore => {
                let b = pop(stack);
                let a = pop(stack);
                let slot = a.slot();
                let result = self.arith(base_op(instr.op), a, b)?;
                if slot.is_valid() {
                    self.reftable.store(slot, &result);
                }
                let mut pushed = result;
                pushed.slot = slot;
                stack.push(pushed);
                Flow::Next
            }

            Opcode::Cat => {
                let n = instr.p1.max(0) as usize;
                let items = drain_top(stack, n);
                let mut buffer = Vec::new();
                for value in items {
                    match self.coerce_str(&value)? {
                        Ok(bytes) => {
                            buffer.extend_from_slice(&bytes);
                            self.release_value(value);
                        }
                        Err(out) => {
                            self.release_value(value);
                            return self.finish_out(out, stack);
                        }
                    }
                }
                stack.push(Value::bytes(buffer));
                Flow::Next
            }
            Opcode::CatStore => {
                let b = pop(stack);
                let a = pop(stack);
                let slot = a.slot();
                let mut buffer = match self.coerce_str(&a)? {
                    Ok(bytes) => bytes,
                    Err(out) => {
                        self.release_value(a);
                        self.release_value(b);
                        return self.finish_out(out, stack);
                    }
                };
                match self.coerce_str(&b)? {
                    Ok(bytes) => buffer.extend_from_slice(&bytes),
                    Err(out) => {
                        self.release_value(a);
                        self.release_value(b);
                        return self.finish_out(out, stack);
                    }
                }
                self.release_value(a);
                self.release_value(b);
                let result = Value::bytes(buffer);
                if slot.is_valid() {
                    self.reftable.store(slot, &result);
                }
                let mut pushed = result;
                pushed.slot = slot;
                stack.push(pushed);
                Flow::Next
            }

            Opcode::Eq
            | Opcode::Neq
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Teq
            | Opcode::Tne
            | Opcode::Seq
            | Opcode::Sne => {
                let b = pop(stack);
                let a = pop(stack);
                let truth = self.compare_op(instr.op, &a, &b);
                self.release_value(a);
                self.release_value(b);
                if instr.p2 != 0 {
                    if truth {
                        Flow::Jump(instr.p2)
                    } else {
                        Flow::Next
                    }
                } else {
                    stack.push(Value::bool(truth));
                    Flow::Next
                }
            }

            Opcode::Land | Opcode::Lor | Opcode::Lxor => {
                let b = pop(stack);
                let a = pop(stack);
                let result = match instr.op {
                    Opcode::Land => a.truthy() && b.truthy(),
                    Opcode::Lor => a.truthy() || b.truthy(),
                    _ => a.truthy() ^ b.truthy(),
                };
                self.release_value(a);
                self.release_value(b);
                stack.push(Value::bool(result));
                Flow::Next
            }

            Opcode::IsA => {
                let target = pop(stack);
                let value = pop(stack);
                let out = self.op_isa(value, target)?;
                return self.finish_out(out, stack);
            }

            Opcode::Member => {
                let name: Arc<str> = match &instr.p3 {
                    P3::Name(name) => name.clone(),
                    _ => {
                        let name_value = pop(stack);
                        let name =
                            Arc::from(String::from_utf8_lossy(&name_value.cast_str()).as_ref());
                        self.release_value(name_value);
                        name
                    }
                };
                let target = pop(stack);
                let out = self.op_member(target, name, instr.p1 != 0, instr.p2 != 0)?;
                return self.finish_out(out, stack);
            }

            Opcode::New => {
                let class_name = pop(stack);
                let args = drain_top(stack, instr.p1.max(0) as usize);
                let out = self.op_new(class_name, args)?;
                return self.finish_out(out, stack);
            }

            Opcode::Clone => {
                let value = pop(stack);
                let out = self.op_clone(value)?;
                return self.finish_out(out, stack);
            }

            Opcode::Switch => {
                if let P3::Switch(table) = &instr.p3 {
                    let table = table.clone();
                    return self.op_switch(&table, stack);
                }
                Flow::Next
            }

            Opcode::Call => {
                let callee = pop(stack);
                let args = drain_top(stack, instr.p1.max(0) as usize);
                let out = self.route_call(callee, args)?;
                return self.finish_out(out, stack);
            }

            Opcode::Throw => {
                let value = pop(stack);
                match self.throw_value(value)? {
                    ThrowOutcome::Caught(target) => {
                        self.drain_stack(stack);
                        Flow::Jump(target)
                    }
                    ThrowOutcome::Propagate => Flow::Return(ExecuteState::Throwing),
                    ThrowOutcome::Ignored => Flow::Next,
                }
            }

            Opcode::ForeachInit => {
                if let P3::Foreach(desc) = &instr.p3 {
                    let desc = desc.clone();
                    let target = pop(stack);
                    if let Some(map) = target.as_array().cloned() {
                        let keys = map.borrow().keys();
                        self.iters.push(ForeachState {
                            desc,
                            subject: IterSubject::Array(map, keys),
                            pos: 0,
                        });
                        self.release_value(target);
                        Flow::Next
                    } else if let Some(instance) = target.as_object().cloned() {
                        let names: Vec<Arc<str>> =
                            instance.borrow().attrs().map(|(n, _)| n.clone()).collect();
                        self.iters.push(ForeachState {
                            desc,
                            subject: IterSubject::Object(instance, names),
                            pos: 0,
                        });
                        self.release_value(target);
                        Flow::Next
                    } else {
                        self.diag(
                            Fault::InvalidOperands,
                            format!("foreach over {}", target.type_name()),
                        )?;
                        self.release_value(target);
                        Flow::Jump(instr.p2)
                    }
                } else {
                    Flow::Next
                }
            }

            Opcode::ForeachStep => self.op_foreach_step(instr.p2)?,

            Opcode::Consume => {
                let n = instr.p1.max(0) as usize;
                let items = drain_top(stack, n);
                for value in items {
                    match self.coerce_str(&value)? {
                        Ok(bytes) => {
                            self.emit(&bytes)?;
                            self.release_value(value);
                        }
                        Err(out) => {
                            self.release_value(value);
                            return self.finish_out(out, stack);
                        }
                    }
                }
                Flow::Next
            }
        };
        Ok(flow)
    }

    fn op_load_var(
        &mut self,
        name: &Arc<str>,
        lookup_only: bool,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, VmError> {
        // `$this` resolves against the enclosing method frame, never the
        // variable table.
        if &**name == "this" {
            match self.frames.current_this() {
                Some(instance) => stack.push(Value::object(instance)),
                None => stack.push(Value::null()),
            }
            return Ok(Flow::Next);
        }
        match self.resolve_var(name) {
            Some(slot) => stack.push(self.reftable.value(slot).clone()),
            None if lookup_only => stack.push(Value::null()),
            None => {
                self.diag(Fault::UndefinedVariable, format!("undefined variable {name}"))?;
                let slot = self.create_var(name);
                stack.push(self.reftable.value(slot).clone());
            }
        }
        Ok(Flow::Next)
    }

    fn op_load_idx(
        &mut self,
        target: Value,
        key: Option<Value>,
        create: bool,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, VmError> {
        // Auto-vivification: a null variable indexed with create becomes an
        // array in place.
        let target = if target.is_null() && create && target.slot().is_valid() {
            let map = Rc::new(RefCell::new(Hashmap::new()));
            self.diag(Fault::AutoVivification, "implicit array creation")?;
            self.reftable.store(target.slot(), &Value::array(map));
            self.reftable.value(target.slot()).clone()
        } else {
            target
        };

        if let Some(map) = target.as_array().cloned() {
            let Some(key_value) = key else {
                self.diag(Fault::InvalidOperands, "index read without a key")?;
                self.release_value(target);
                stack.push(Value::null());
                return Ok(Flow::Next);
            };
            let array_key = ArrayKey::from_value(&key_value);
            self.release_value(key_value);
            let existing = map.borrow().get(&array_key);
            let temp_target = !target.slot().is_valid();
            match existing {
                Some(slot) => {
                    let mut value = self.reftable.value(slot).clone();
                    if temp_target {
                        // The element slot dies with the temporary array.
                        value = value.detached();
                    }
                    self.release_value(target);
                    stack.push(value);
                }
                None if create => {
                    self.diag(
                        Fault::AutoVivification,
                        format!("implicit element {array_key}"),
                    )?;
                    let slot = self.reftable.reserve();
                    map.borrow_mut().insert(Some(array_key.clone()), slot);
                    self.reftable.install_node_ref(slot, &map, array_key);
                    let mut value = self.reftable.value(slot).clone();
                    if temp_target {
                        value = value.detached();
                    }
                    self.release_value(target);
                    stack.push(value);
                }
                None => {
                    self.diag(Fault::MissingIndex, format!("undefined index {array_key}"))?;
                    self.release_value(target);
                    stack.push(Value::null());
                }
            }
            return Ok(Flow::Next);
        }

        if target.is_str() {
            let offset = key
                .map(|k| {
                    let i = k.cast_int();
                    self.release_value(k);
                    i
                })
                .unwrap_or(-1);
            let bytes = target.str_bytes();
            if offset >= 0 && (offset as usize) < bytes.len() {
                let byte = bytes[offset as usize];
                stack.push(Value::bytes(vec![byte]));
            } else {
                self.diag(Fault::MissingIndex, format!("string offset {offset}"))?;
                stack.push(Value::null());
            }
            self.release_value(target);
            return Ok(Flow::Next);
        }

        if let Some(instance) = target.as_object().cloned() {
            self.release_value(target);
            let key_value = key.unwrap_or_else(Value::null);
            let out = self.object_index_get(instance, key_value)?;
            return self.finish_out(out, stack);
        }

        if let Some(key_value) = key {
            self.release_value(key_value);
        }
        self.diag(
            Fault::InvalidOperands,
            format!("cannot index {}", target.type_name()),
        )?;
        self.release_value(target);
        stack.push(Value::null());
        Ok(Flow::Next)
    }

    fn op_store_idx(
        &mut self,
        target: Value,
        key: Option<Value>,
        value: Value,
        by_ref: bool,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, VmError> {
        // Auto-vivification on a null variable.
        let target = if target.is_null() && target.slot().is_valid() {
            let map = Rc::new(RefCell::new(Hashmap::new()));
            self.diag(Fault::AutoVivification, "implicit array creation")?;
            self.reftable.store(target.slot(), &Value::array(map));
            self.reftable.value(target.slot()).clone()
        } else {
            target
        };

        if let Some(map) = target.as_array().cloned() {
            let array_key = key.map(|key_value| {
                let array_key = ArrayKey::from_value(&key_value);
                self.release_value(key_value);
                array_key
            });
            self.release_value(target);

            if by_ref {
                if !value.is_ref_marker() {
                    self.diag(Fault::InvalidOperands, "expected a reference marker")?;
                    stack.push(value);
                    return Ok(Flow::Next);
                }
                let slot = value.marker_slot();
                let key_used = array_key.unwrap_or_else(|| map.borrow().auto_key());
                if let Some(old) = map.borrow().get(&key_used) {
                    if old != slot {
                        self.reftable.remove_node_ref(old, &map, &key_used);
                    }
                }
                map.borrow_mut().insert(Some(key_used.clone()), slot);
                self.reftable.install_node_ref(slot, &map, key_used);
                stack.push(self.reftable.value(slot).clone());
                return Ok(Flow::Next);
            }

            let existing = array_key.as_ref().and_then(|k| map.borrow().get(k));
            let slot = match existing {
                Some(slot) => {
                    self.reftable.store(slot, &value);
                    slot
                }
                None => {
                    let slot = self.reftable.reserve();
                    self.reftable.store(slot, &value);
                    let used = map.borrow_mut().insert(array_key, slot);
                    self.reftable.install_node_ref(slot, &map, used);
                    slot
                }
            };
            let mut pushed = value;
            pushed.slot = slot;
            stack.push(pushed);
            return Ok(Flow::Next);
        }

        if target.is_str() {
            let offset = key
                .map(|k| {
                    let i = k.cast_int();
                    self.release_value(k);
                    i
                })
                .unwrap_or(-1);
            let bytes = value.cast_str();
            let byte = bytes.first().copied();
            match (byte, target.slot().is_valid(), offset >= 0) {
                (Some(byte), true, true) => {
                    // Byte-level write; past-the-end appends exactly one
                    // byte.
                    let cell = self.reftable.value_mut(target.slot());
                    cell.to_str();
                    cell.str_byte_write(offset as usize, byte);
                }
                _ => {
                    self.diag(Fault::InvalidOperands, "invalid string index write")?;
                }
            }
            self.release_value(target);
            stack.push(value);
            return Ok(Flow::Next);
        }

        if let Some(instance) = target.as_object().cloned() {
            self.release_value(target);
            let key_value = key.unwrap_or_else(Value::null);
            let out = self.object_index_set(instance, key_value, value.clone())?;
            return match out {
                OpOut::Value(result) => {
                    self.release_value(result);
                    stack.push(value);
                    Ok(Flow::Next)
                }
                other => {
                    self.release_value(value);
                    self.finish_out(other, stack)
                }
            };
        }

        if let Some(key_value) = key {
            self.release_value(key_value);
        }
        self.diag(
            Fault::NotAnArray,
            format!("cannot write an element of {}", target.type_name()),
        )?;
        self.release_value(target);
        stack.push(value);
        Ok(Flow::Next)
    }

    fn op_uplink(&mut self, name: &Arc<str>) {
        let slot = match self.frames.uplink_source(name) {
            Some(slot) => slot,
            None => {
                let slot = self.reftable.reserve();
                self.frames.global_mut().bind(name.clone(), slot);
                self.reftable.install_name_ref(slot, 0, name.clone());
                self.register_in_globals(name, slot);
                slot
            }
        };
        self.bind_ref(name, slot);
    }

    fn op_load_closure(&mut self, template: &Arc<phlox_asm::FunctionDecl>, stack: &mut Vec<Value>) {
        self.closure_counter += 1;
        let name: Arc<str> = Arc::from(format!("{{closure:{}}}", self.closure_counter));
        let mut captures = Vec::new();
        for capture in &template.captures {
            // Captured by value at creation time; later writes to the
            // source variable do not reach the closure.
            let value = self
                .resolve_var(capture)
                .map(|slot| self.reftable.value(slot).clone().detached())
                .unwrap_or_else(Value::null);
            captures.push((capture.clone(), value));
        }
        let mut decl = (**template).clone();
        decl.name = name.clone();
        self.functions
            .register_with_captures(Arc::new(decl), captures);
        stack.push(Value::str(&*name));
    }

    fn op_switch(
        &mut self,
        table: &phlox_asm::SwitchTable,
        stack: &mut Vec<Value>,
    ) -> Result<Flow, VmError> {
        let subject = pop(stack);
        for case in &table.cases {
            let mut case_stack: Vec<Value> =
                Vec::with_capacity(case.code.instrs.len() + STACK_GUARD);
            let state = self.dispatch(&case.code, &mut case_stack, false)?;
            let case_value = match state {
                ExecuteState::Done(value) => value,
                other => {
                    self.release_value(subject);
                    let out = crate::interpreter::object::state_to_out(other);
                    return self.finish_out(out, stack);
                }
            };
            let matched = subject.loose_eq(&case_value, &self.reftable);
            self.release_value(case_value);
            if matched {
                self.release_value(subject);
                return Ok(Flow::Jump(case.target));
            }
        }
        self.release_value(subject);
        Ok(Flow::Jump(table.default_target.unwrap_or(table.exit_target)))
    }

    fn op_foreach_step(&mut self, exit: u32) -> Result<Flow, VmError> {
        loop {
            enum Binding {
                Done,
                Skip,
                Bind {
                    desc: Arc<phlox_asm::ForeachDesc>,
                    key: Value,
                    slot: crate::reftable::SlotId,
                },
            }

            let binding = match self.iters.last_mut() {
                None => Binding::Done,
                Some(state) => match &state.subject {
                    IterSubject::Array(map, keys) => {
                        if state.pos >= keys.len() {
                            Binding::Done
                        } else {
                            let key = keys[state.pos].clone();
                            state.pos += 1;
                            match map.borrow().get(&key) {
                                Some(slot) => Binding::Bind {
                                    desc: state.desc.clone(),
                                    key: key.to_value(),
                                    slot,
                                },
                                // Removed while iterating.
                                None => Binding::Skip,
                            }
                        }
                    }
                    IterSubject::Object(instance, names) => {
                        if state.pos >= names.len() {
                            Binding::Done
                        } else {
                            let name = names[state.pos].clone();
                            state.pos += 1;
                            match instance.borrow().attr_slot(&name) {
                                Some(slot) => Binding::Bind {
                                    desc: state.desc.clone(),
                                    key: Value::str(&*name),
                                    slot,
                                },
                                None => Binding::Skip,
                            }
                        }
                    }
                },
            };

            match binding {
                Binding::Done => {
                    self.iters.pop();
                    return Ok(Flow::Jump(exit));
                }
                Binding::Skip => continue,
                Binding::Bind { desc, key, slot } => {
                    if desc.by_ref {
                        self.bind_ref(&desc.value_var, slot);
                    } else {
                        let value = self.reftable.value(slot).clone();
                        self.store_var(&desc.value_var, &value);
                    }
                    if let Some(key_var) = &desc.key_var {
                        self.store_var(key_var, &key);
                    }
                    return Ok(Flow::Next);
                }
            }
        }
    }

    /// Binary arithmetic with real-promotion; arrays unite under `Add`.
    fn arith(&mut self, op: Opcode, a: Value, b: Value) -> Result<Value, VmError> {
        if op == Opcode::Add && (a.is_array() || b.is_array()) {
            return self.array_union(a, b);
        }

        let result = match op {
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let (x, y) = (a.cast_numeric(), b.cast_numeric());
                match (x, y) {
                    (Numeric::Int(x), Numeric::Int(y)) => {
                        let checked = match op {
                            Opcode::Add => x.checked_add(y),
                            Opcode::Sub => x.checked_sub(y),
                            _ => x.checked_mul(y),
                        };
                        match checked {
                            Some(i) => Value::int(i),
                            // Integer overflow promotes to real.
                            None => {
                                let (x, y) = (x as f64, y as f64);
                                Value::real(match op {
                                    Opcode::Add => x + y,
                                    Opcode::Sub => x - y,
                                    _ => x * y,
                                })
                            }
                        }
                    }
                    (x, y) => {
                        let (x, y) = (x.as_real(), y.as_real());
                        Value::real(match op {
                            Opcode::Add => x + y,
                            Opcode::Sub => x - y,
                            _ => x * y,
                        })
                    }
                }
            }
            Opcode::Div => {
                let (x, y) = (a.cast_numeric(), b.cast_numeric());
                if matches!(y, Numeric::Int(0)) || y.as_real() == 0.0 {
                    self.diag(Fault::DivisionByZero, "division by zero")?;
                    Value::int(0)
                } else {
                    match (x, y) {
                        (Numeric::Int(x), Numeric::Int(y)) => {
                            // Checked: i64::MIN / -1 is not representable
                            // and promotes to real like the other
                            // overflowing integer operations.
                            match (x.checked_div(y), x.checked_rem(y)) {
                                (Some(quotient), Some(0)) => Value::int(quotient),
                                _ => Value::real(x as f64 / y as f64),
                            }
                        }
                        (x, y) => Value::real(x.as_real() / y.as_real()),
                    }
                }
            }
            Opcode::Mod => {
                let (x, y) = (a.cast_int(), b.cast_int());
                if y == 0 {
                    self.diag(Fault::ModuloByZero, "modulo by zero")?;
                    Value::int(0)
                } else {
                    Value::int(x.wrapping_rem(y))
                }
            }
            Opcode::Shl => Value::int(a.cast_int().wrapping_shl(b.cast_int() as u32)),
            Opcode::Shr => Value::int(a.cast_int().wrapping_shr(b.cast_int() as u32)),
            Opcode::Band => Value::int(a.cast_int() & b.cast_int()),
            Opcode::Bor => Value::int(a.cast_int() | b.cast_int()),
            Opcode::Bxor => Value::int(a.cast_int() ^ b.cast_int()),
            _ => Value::null(),
        };
        self.release_value(a);
        self.release_value(b);
        Ok(result)
    }

    /// Array union: keys of the left operand win.
    fn array_union(&mut self, a: Value, b: Value) -> Result<Value, VmError> {
        let (Some(left), Some(right)) = (a.as_array().cloned(), b.as_array().cloned()) else {
            self.diag(Fault::InvalidOperands, "array union with a non-array")?;
            self.release_value(a);
            self.release_value(b);
            return Ok(Value::null());
        };
        let result = Rc::new(RefCell::new(Hashmap::new()));
        let mut pairs: Vec<(ArrayKey, crate::reftable::SlotId)> = left
            .borrow()
            .iter()
            .map(|(k, s)| (k.clone(), *s))
            .collect();
        for (key, slot) in right.borrow().iter() {
            if !left.borrow().contains(key) {
                pairs.push((key.clone(), *slot));
            }
        }
        for (key, source) in pairs {
            let value = self.reftable.value(source).clone();
            let slot = self.reftable.reserve();
            self.reftable.store(slot, &value);
            result.borrow_mut().insert(Some(key.clone()), slot);
            self.reftable.install_node_ref(slot, &result, key);
        }
        self.release_value(a);
        self.release_value(b);
        Ok(Value::array(result))
    }

    fn compare_op(&self, op: Opcode, a: &Value, b: &Value) -> bool {
        use std::cmp::Ordering;
        match op {
            Opcode::Eq => a.loose_eq(b, &self.reftable),
            Opcode::Neq => !a.loose_eq(b, &self.reftable),
            Opcode::Lt => a.compare(b, false, &self.reftable) == Ordering::Less,
            Opcode::Le => a.compare(b, false, &self.reftable) != Ordering::Greater,
            Opcode::Gt => a.compare(b, false, &self.reftable) == Ordering::Greater,
            Opcode::Ge => a.compare(b, false, &self.reftable) != Ordering::Less,
            Opcode::Teq => a.strict_eq(b, &self.reftable),
            Opcode::Tne => !a.strict_eq(b, &self.reftable),
            Opcode::Seq => a.cast_str() == b.cast_str(),
            Opcode::Sne => a.cast_str() != b.cast_str(),
            _ => false,
        }
    }

    /// `CvtArray`: wrap a non-array value into a fresh single-entry array.
    fn value_to_array(&mut self, value: Value) -> Value {
        if value.is_array() {
            return value;
        }
        let map = Rc::new(RefCell::new(Hashmap::new()));
        if !value.is_null() {
            let slot = self.reftable.reserve();
            self.reftable.store(slot, &value);
            let key = map.borrow_mut().insert(None, slot);
            self.reftable.install_node_ref(slot, &map, key);
        }
        self.release_value(value);
        Value::array(map).detached()
    }

    /// `CvtObj`: arrays become `stdClass` instances attribute-per-entry;
    /// scalars land in a `scalar` attribute.
    fn value_to_object(&mut self, value: Value) -> Value {
        if value.is_object() {
            return value;
        }
        let class = self
            .classes
            .resolve("stdClass")
            .expect("stdClass is registered at construction");
        let instance = self.classes.instantiate(class, &mut self.reftable);
        if let Some(map) = value.as_array().cloned() {
            let entries: Vec<(ArrayKey, crate::reftable::SlotId)> = map
                .borrow()
                .iter()
                .map(|(k, s)| (k.clone(), *s))
                .collect();
            for (key, source) in entries {
                let name: Arc<str> = Arc::from(key.to_string());
                let entry_value = self.reftable.value(source).clone();
                let slot = self.reftable.reserve();
                self.reftable.store(slot, &entry_value);
                instance.borrow_mut().bind_attr(name, slot);
            }
        } else if !value.is_null() {
            let slot = self.reftable.reserve();
            self.reftable.store(slot, &value);
            instance.borrow_mut().bind_attr(Arc::from("scalar"), slot);
        }
        self.release_value(value);
        Value::object(instance)
    }
}

fn base_op(op: Opcode) -> Opcode {
    match op {
        Opcode::AddStore => Opcode::Add,
        Opcode::SubStore => Opcode::Sub,
        Opcode::MulStore => Opcode::Mul,
        Opcode::DivStore => Opcode::Div,
        Opcode::ModStore => Opcode::Mod,
        Opcode::ShlStore => Opcode::Shl,
        Opcode::ShrStore => Opcode::Shr,
        Opcode::BandStore => Opcode::Band,
        Opcode::BorStore => Opcode::Bor,
        Opcode::BxorStore => Opcode::Bxor,
        other => other,
    }
}
