//! Call and return flow: callee routing, overload selection, argument
//! binding, and frame lifecycle around nested dispatcher invocations.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use phlox_asm::{Fault, FormalArg, MethodFlags, TypeHint};

use crate::array::ArrayKey;
use crate::class::{Instance, Method, INVOKE};
use crate::consts::STACK_GUARD;
use crate::error::VmError;
use crate::frame::FrameInit;
use crate::function::{FfiStatus, ForeignFunction, FunctionId};
use crate::interpreter::dispatch::OpOut;
use crate::interpreter::host::CallContext;
use crate::interpreter::object::state_to_out;
use crate::interpreter::Vm;
use crate::state::ExecuteState;
use crate::value::Value;

impl Vm {
    /// Route a `Call` by callee shape: a string names a user function,
    /// closure, or foreign function; a two-element array is a bound or
    /// static method; an object goes through `__invoke`.
    pub(crate) fn route_call(&mut self, callee: Value, args: Vec<Value>) -> Result<OpOut, VmError> {
        if callee.is_str() {
            let name = String::from_utf8_lossy(callee.str_bytes()).into_owned();
            self.release_value(callee);
            return self.call_named(&name, args);
        }
        if let Some(map) = callee.as_array().cloned() {
            let target = map
                .borrow()
                .get(&ArrayKey::Int(0))
                .map(|slot| self.reftable.value(slot).clone().detached());
            let method = map
                .borrow()
                .get(&ArrayKey::Int(1))
                .map(|slot| self.reftable.value(slot).cast_str());
            // Drop the pair itself before dispatching so a one-shot bound
            // method (the usual Member product) tears its entry slots down.
            self.release_value(callee);
            self.release_value(Value::array(map));
            let (Some(target), Some(method)) = (target, method) else {
                self.diag(Fault::NotCallable, "malformed callable array")?;
                self.release_args(args);
                return Ok(OpOut::Value(Value::null()));
            };
            let method = String::from_utf8_lossy(&method).into_owned();
            return self.call_member(target, &method, args);
        }
        if let Some(instance) = callee.as_object().cloned() {
            self.release_value(callee);
            let class = instance.borrow().class();
            if let Some(method) = self.classes.method(class, INVOKE).cloned() {
                let state = self.invoke_method(Some(instance), &method, args)?;
                return Ok(state_to_out(state));
            }
            self.diag(Fault::NotCallable, "object is not invokable")?;
            self.release_args(args);
            return Ok(OpOut::Value(Value::null()));
        }
        self.diag(
            Fault::NotCallable,
            format!("value of type {} is not callable", callee.type_name()),
        )?;
        self.release_value(callee);
        self.release_args(args);
        Ok(OpOut::Value(Value::null()))
    }

    /// Call a function by name: user overload set first, then the foreign
    /// table.
    pub(crate) fn call_named(&mut self, name: &str, args: Vec<Value>) -> Result<OpOut, VmError> {
        if self.functions.head(name).is_some() {
            let signature = self.call_signature(&args);
            let Some(id) = self
                .functions
                .select_overload(name, &signature, args.len())
            else {
                self.diag(Fault::UnknownFunction, format!("no viable overload of {name}"))?;
                self.release_args(args);
                return Ok(OpOut::Value(Value::null()));
            };
            let state = self.call_user(id, args)?;
            return Ok(state_to_out(state));
        }
        if let Some(foreign) = self.functions.foreign(name).cloned() {
            return self.call_foreign(foreign, args);
        }
        self.diag(Fault::UnknownFunction, format!("call to unknown function {name}"))?;
        self.release_args(args);
        Ok(OpOut::Value(Value::null()))
    }

    /// Call `target->method` or `Class::method` out of a callable pair.
    pub(crate) fn call_member(
        &mut self,
        target: Value,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<OpOut, VmError> {
        let (class, instance) = match target.as_object() {
            Some(instance) => (instance.borrow().class(), Some(instance.clone())),
            None => {
                let name = String::from_utf8_lossy(&target.cast_str()).into_owned();
                match self.classes.resolve(&name) {
                    Some(class) => (class, None),
                    None => {
                        self.diag(Fault::UnknownClass, format!("unknown class {name}"))?;
                        self.release_value(target);
                        self.release_args(args);
                        return Ok(OpOut::Value(Value::null()));
                    }
                }
            }
        };
        self.release_value(target);
        let Some(method) = self.classes.method(class, method_name).cloned() else {
            let class_name = self.classes.get(class).name().clone();
            self.diag(
                Fault::UnknownMethod,
                format!("class {class_name} has no method {method_name}"),
            )?;
            self.release_args(args);
            return Ok(OpOut::Value(Value::null()));
        };
        if !self.classes.can_access(
            method.visibility,
            method.owner,
            self.frames.visibility_scope(),
        ) {
            self.diag(
                Fault::Visibility,
                format!("method {method_name} is not accessible here"),
            )?;
            self.release_args(args);
            return Ok(OpOut::Value(Value::null()));
        }
        let state = self.invoke_method(instance, &method, args)?;
        Ok(state_to_out(state))
    }

    /// The call-site signature: one character per argument, objects
    /// contributing their class name.
    pub(crate) fn call_signature(&self, args: &[Value]) -> String {
        let mut signature = String::new();
        for arg in args {
            signature.push(arg.signature_char());
            if let Some(instance) = arg.as_object() {
                let class = instance.borrow().class();
                signature.push_str(self.classes.get(class).name());
                signature.push(';');
            }
        }
        signature
    }

    /// Execute a user function: fresh frame, statics and captures
    /// installed, arguments bound and type-checked, body dispatched.
    pub(crate) fn call_user(
        &mut self,
        id: FunctionId,
        args: Vec<Value>,
    ) -> Result<ExecuteState, VmError> {
        if self.depth >= self.params().recursion_limit {
            self.diag(Fault::RecursionLimit, "call depth ceiling exceeded")?;
            self.release_args(args);
            return Ok(ExecuteState::Done(Value::null()));
        }

        let decl = self.functions.get(id).decl.clone();

        // Static slots persist on the function across calls; created
        // pinned on first use.
        let mut statics: Vec<(Arc<str>, crate::reftable::SlotId)> = Vec::new();
        for static_var in &decl.statics {
            let existing = self.functions.get(id).statics.get(&static_var.name).copied();
            let slot = match existing {
                Some(slot) => slot,
                None => {
                    let slot = self.reftable.reserve();
                    let initial = static_var
                        .default
                        .as_ref()
                        .map(Value::from_literal)
                        .unwrap_or_else(Value::null);
                    self.reftable.store(slot, &initial);
                    self.reftable.pin(slot);
                    self.functions
                        .get_mut(id)
                        .statics
                        .insert(static_var.name.clone(), slot);
                    slot
                }
            };
            statics.push((static_var.name.clone(), slot));
        }
        let captures = self.functions.get(id).captures.clone();

        let serial = self.frames.push(FrameInit::default());
        for (name, slot) in statics {
            self.frames.top_mut().bind(name.clone(), slot);
            self.frames.top_mut().aliased.push(slot);
            self.reftable.install_name_ref(slot, serial, name);
        }
        for (name, value) in captures {
            let slot = self.reftable.reserve();
            self.reftable.store(slot, &value);
            self.frames.top_mut().bind(name.clone(), slot);
            self.frames.top_mut().owned.push(slot);
            self.reftable.install_name_ref(slot, serial, name);
        }

        if let Some(abnormal) = self.bind_args(&decl.args, args, serial)? {
            self.unwind_to(serial);
            return Ok(abnormal);
        }

        self.depth += 1;
        let body = decl.code.clone();
        let mut stack: Vec<Value> = Vec::with_capacity(body.instrs.len() + STACK_GUARD);
        let state = self.dispatch(&body, &mut stack, false);
        self.depth -= 1;
        self.unwind_to(serial);
        match state? {
            ExecuteState::Done(value) => Ok(ExecuteState::Done(value.detached())),
            other => Ok(other),
        }
    }

    /// Execute a method with `$this` and the owner class scope installed.
    pub(crate) fn invoke_method(
        &mut self,
        instance: Option<Rc<RefCell<Instance>>>,
        method: &Method,
        args: Vec<Value>,
    ) -> Result<ExecuteState, VmError> {
        if self.depth >= self.params().recursion_limit {
            self.diag(Fault::RecursionLimit, "call depth ceiling exceeded")?;
            self.release_args(args);
            return Ok(ExecuteState::Done(Value::null()));
        }
        let this = if method.flags.contains(MethodFlags::STATIC) {
            None
        } else {
            instance
        };
        let serial = self.frames.push(FrameInit {
            this,
            class_scope: Some(method.owner),
            ..FrameInit::default()
        });
        if let Some(abnormal) = self.bind_args(&method.args, args, serial)? {
            self.unwind_to(serial);
            return Ok(abnormal);
        }

        self.depth += 1;
        let body = method.code.clone();
        let mut stack: Vec<Value> = Vec::with_capacity(body.instrs.len() + STACK_GUARD);
        let state = self.dispatch(&body, &mut stack, false);
        self.depth -= 1;
        self.unwind_to(serial);
        match state? {
            ExecuteState::Done(value) => Ok(ExecuteState::Done(value.detached())),
            other => Ok(other),
        }
    }

    /// Bind call arguments to the formals of the frame with `serial`:
    /// by-reference formals alias the caller's slot, values are
    /// type-checked against their constraints, and missing or null
    /// arguments pick up defaults. Returns an abnormal state when a
    /// default-value block did not complete.
    fn bind_args(
        &mut self,
        formals: &[FormalArg],
        mut args: Vec<Value>,
        serial: u64,
    ) -> Result<Option<ExecuteState>, VmError> {
        let mut extras = Vec::new();
        if args.len() > formals.len() {
            extras = args.split_off(formals.len());
        }

        for (index, formal) in formals.iter().enumerate() {
            let arg = if index < args.len() {
                Some(std::mem::take(&mut args[index]))
            } else {
                None
            };

            // Aliasing parameter: share the caller's slot.
            if formal.by_ref {
                if let Some(value) = &arg {
                    if value.slot().is_valid() {
                        let slot = value.slot();
                        self.frames.top_mut().bind(formal.name.clone(), slot);
                        self.frames.top_mut().args.push(slot);
                        self.frames.top_mut().aliased.push(slot);
                        self.reftable
                            .install_name_ref(slot, serial, formal.name.clone());
                        continue;
                    }
                }
            }

            let mut value = match arg {
                Some(value) if value.is_null() && formal.default.is_some() => {
                    self.diag(
                        Fault::NullArgumentDefault,
                        format!("null argument {} replaced by its default", formal.name),
                    )?;
                    match self.eval_default(formal)? {
                        Ok(value) => value,
                        Err(abnormal) => return Ok(Some(abnormal)),
                    }
                }
                Some(value) => value,
                None => match formal.default.is_some() {
                    true => match self.eval_default(formal)? {
                        Ok(value) => value,
                        Err(abnormal) => return Ok(Some(abnormal)),
                    },
                    false => Value::null(),
                },
            };

            self.check_constraint(formal, &mut value)?;

            let slot = self.reftable.reserve();
            self.reftable.store(slot, &value);
            self.release_value(value);
            self.frames.top_mut().bind(formal.name.clone(), slot);
            self.frames.top_mut().args.push(slot);
            self.frames.top_mut().owned.push(slot);
            self.reftable
                .install_name_ref(slot, serial, formal.name.clone());
        }

        // Arguments beyond the formals stay reachable through
        // func_get_args; their slots are anonymous.
        for value in extras {
            let slot = self.reftable.reserve();
            self.reftable.store(slot, &value);
            self.release_value(value);
            self.frames.top_mut().args.push(slot);
            self.frames.top_mut().owned.push(slot);
        }
        Ok(None)
    }

    fn eval_default(
        &mut self,
        formal: &FormalArg,
    ) -> Result<Result<Value, ExecuteState>, VmError> {
        let Some(default) = formal.default.clone() else {
            return Ok(Ok(Value::null()));
        };
        let mut stack: Vec<Value> = Vec::with_capacity(default.instrs.len() + STACK_GUARD);
        match self.dispatch(&default, &mut stack, false)? {
            ExecuteState::Done(value) => Ok(Ok(value.detached())),
            other => Ok(Err(other)),
        }
    }

    /// Enforce a formal's type constraint: scalars coerce, aggregates must
    /// match, class constraints require instance-of. Violations diagnose
    /// and substitute null.
    fn check_constraint(&mut self, formal: &FormalArg, value: &mut Value) -> Result<(), VmError> {
        let Some(hint) = formal.hint else {
            return Ok(());
        };
        match hint {
            TypeHint::Bool => {
                if value.is_array() || value.is_object() {
                    return self.constraint_violation(formal, value);
                }
                value.to_bool();
            }
            TypeHint::Int => {
                if value.is_array() || value.is_object() {
                    return self.constraint_violation(formal, value);
                }
                value.to_int();
            }
            TypeHint::Real => {
                if value.is_array() || value.is_object() {
                    return self.constraint_violation(formal, value);
                }
                value.to_real();
            }
            TypeHint::Str => {
                if value.is_array() || value.is_object() {
                    return self.constraint_violation(formal, value);
                }
                value.to_str();
            }
            TypeHint::Array => {
                if !value.is_array() {
                    return self.constraint_violation(formal, value);
                }
            }
            TypeHint::Object => {
                let satisfied = match &formal.class {
                    Some(class) => self.value_instance_of_name(value, class),
                    None => value.is_object(),
                };
                if !satisfied {
                    return self.constraint_violation(formal, value);
                }
            }
        }
        Ok(())
    }

    fn constraint_violation(
        &mut self,
        formal: &FormalArg,
        value: &mut Value,
    ) -> Result<(), VmError> {
        self.diag(
            Fault::TypeConstraint,
            format!(
                "argument {} of type {} violates its constraint",
                formal.name,
                value.type_name()
            ),
        )?;
        let old = std::mem::replace(value, Value::null());
        self.release_value(old);
        Ok(())
    }

    /// Invoke a foreign function through a call context.
    pub(crate) fn call_foreign(
        &mut self,
        foreign: ForeignFunction,
        args: Vec<Value>,
    ) -> Result<OpOut, VmError> {
        tracing::debug!(name = %foreign.name, argc = args.len(), "foreign call");
        let status = {
            let mut ctx = CallContext::new(self, args, foreign.user_data.clone());
            let status = (foreign.imp)(&mut ctx);
            match status {
                FfiStatus::Ok => {
                    let result = ctx.finish();
                    Ok(result)
                }
                FfiStatus::Abort => Err(()),
            }
        };
        match status {
            Err(()) => Ok(OpOut::Halt(Value::null())),
            Ok(result) => {
                if self.exceptions.current.is_some() {
                    self.release_value(result);
                    Ok(OpOut::Threw)
                } else {
                    Ok(OpOut::Value(result.detached()))
                }
            }
        }
    }
}
