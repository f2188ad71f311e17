//! Object operations: member resolution, instantiation, cloning, and the
//! magic-method seams used by index reads and writes on instances.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use phlox_asm::{ClassFlags, Fault, Visibility};

use crate::array::Hashmap;
use crate::class::{
    Instance, CLONE, CONSTRUCT, MAGIC_GET, MAGIC_SET, OFFSET_GET, OFFSET_SET, TO_STRING,
};
use crate::error::VmError;
use crate::interpreter::dispatch::OpOut;
use crate::interpreter::Vm;
use crate::reftable::SlotId;
use crate::state::ExecuteState;
use crate::value::Value;

impl Vm {
    /// `Member`: resolve `obj->member` or `Class::member`.
    pub(crate) fn op_member(
        &mut self,
        target: Value,
        name: Arc<str>,
        is_static: bool,
        is_method: bool,
    ) -> Result<OpOut, VmError> {
        if is_static {
            return self.static_member(target, name, is_method);
        }

        let Some(instance) = target.as_object().cloned() else {
            self.diag(
                Fault::NotAnObject,
                format!("member access on {}", target.type_name()),
            )?;
            self.release_value(target);
            return Ok(OpOut::Value(Value::null()));
        };

        if is_method {
            // A bound-method callable: the `[instance, method]` pair the
            // subsequent Call routes on.
            return Ok(OpOut::Value(self.make_callable_pair(target, &name)));
        }

        let class = instance.borrow().class();
        if let Some(slot) = instance.borrow().attr_slot(&name) {
            if let Some(declared) = self.declared_attr_visibility(class, &name) {
                if !self
                    .classes
                    .can_access(declared.0, declared.1, self.frames.visibility_scope())
                {
                    self.diag(
                        Fault::Visibility,
                        format!("attribute {name} is not accessible here"),
                    )?;
                    return Ok(OpOut::Value(Value::null()));
                }
            }
            return Ok(OpOut::Value(self.reftable.value(slot).clone()));
        }

        // Missing attribute: route through __get when the class defines
        // it, create the attribute otherwise so assignment can target it.
        if let Some(method) = self.classes.method(class, MAGIC_GET).cloned() {
            let state = self.invoke_method(Some(instance), &method, vec![Value::str(&*name)])?;
            return Ok(state_to_out(state));
        }
        self.diag(
            Fault::UndefinedVariable,
            format!("undefined attribute {name}"),
        )?;
        let slot = self.reftable.reserve();
        instance.borrow_mut().bind_attr(name, slot);
        Ok(OpOut::Value(self.reftable.value(slot).clone()))
    }

    fn static_member(
        &mut self,
        target: Value,
        name: Arc<str>,
        is_method: bool,
    ) -> Result<OpOut, VmError> {
        let class_name: Arc<str> = match target.as_object() {
            Some(instance) => {
                let id = instance.borrow().class();
                self.classes.get(id).name().clone()
            }
            None => Arc::from(String::from_utf8_lossy(&target.cast_str()).as_ref()),
        };
        let Some(class) = self.classes.resolve(&class_name) else {
            self.diag(Fault::UnknownClass, format!("unknown class {class_name}"))?;
            self.release_value(target);
            return Ok(OpOut::Value(Value::null()));
        };
        self.release_value(target);

        if is_method {
            let pair = self.make_callable_pair(Value::str(&*class_name), &name);
            return Ok(OpOut::Value(pair));
        }

        if let Some((slot, visibility, owner)) = self.classes.static_attr(class, &name) {
            if !self
                .classes
                .can_access(visibility, owner, self.frames.visibility_scope())
            {
                self.diag(
                    Fault::Visibility,
                    format!("static attribute {name} is not accessible here"),
                )?;
                return Ok(OpOut::Value(Value::null()));
            }
            return Ok(OpOut::Value(self.reftable.value(slot).clone()));
        }
        if let Some(value) = self.classes.const_attr(class, &name) {
            // Constants push detached: a later store through them faults.
            return Ok(OpOut::Value(value.clone().detached()));
        }
        self.diag(
            Fault::UnknownAttribute,
            format!("class {class_name} has no member {name}"),
        )?;
        Ok(OpOut::Value(Value::null()))
    }

    /// The visibility and owner of a declared instance attribute, when the
    /// attribute was declared (dynamic attributes are public).
    fn declared_attr_visibility(
        &self,
        class: crate::class::ClassId,
        name: &str,
    ) -> Option<(Visibility, crate::class::ClassId)> {
        let mut current = Some(class);
        while let Some(id) = current {
            let c = self.classes.get(id);
            if let Some(attr) = c.own_attrs().iter().find(|a| &*a.name == name) {
                return Some((attr.visibility, id));
            }
            current = c.base();
        }
        None
    }

    /// Build the `[target, method]` callable pair.
    fn make_callable_pair(&mut self, target: Value, name: &str) -> Value {
        let map = Rc::new(RefCell::new(Hashmap::new()));
        let slot0 = self.reftable.reserve();
        self.reftable.store(slot0, &target);
        let key0 = map.borrow_mut().insert(None, slot0);
        self.reftable.install_node_ref(slot0, &map, key0);
        let slot1 = self.reftable.reserve();
        self.reftable.store(slot1, &Value::str(name));
        let key1 = map.borrow_mut().insert(None, slot1);
        self.reftable.install_node_ref(slot1, &map, key1);
        self.release_value(target);
        Value::array(map)
    }

    /// `New`: instantiate a class by name.
    pub(crate) fn op_new(&mut self, class_name: Value, args: Vec<Value>) -> Result<OpOut, VmError> {
        let name = String::from_utf8_lossy(&class_name.cast_str()).into_owned();
        self.release_value(class_name);
        let Some(class) = self.classes.resolve(&name) else {
            self.diag(Fault::UnknownClass, format!("unknown class {name}"))?;
            self.release_args(args);
            return Ok(OpOut::Value(Value::null()));
        };
        let flags = self.classes.get(class).flags();
        if flags.contains(ClassFlags::INTERFACE) {
            self.diag(
                Fault::InterfaceInstantiation,
                format!("cannot instantiate interface {name}"),
            )?;
            self.release_args(args);
            return Ok(OpOut::Value(Value::null()));
        }
        if flags.contains(ClassFlags::ABSTRACT) {
            self.diag(
                Fault::AbstractInstantiation,
                format!("cannot instantiate abstract class {name}"),
            )?;
            self.release_args(args);
            return Ok(OpOut::Value(Value::null()));
        }

        let instance = self.classes.instantiate(class, &mut self.reftable);
        if let Some(ctor) = self.classes.method(class, CONSTRUCT).cloned() {
            if !self.classes.can_access(
                ctor.visibility,
                ctor.owner,
                self.frames.visibility_scope(),
            ) {
                self.diag(
                    Fault::Visibility,
                    format!("constructor of {name} is not accessible here"),
                )?;
                self.release_args(args);
                return Ok(OpOut::Value(Value::null()));
            }
            let state = self.invoke_method(Some(instance.clone()), &ctor, args)?;
            match state {
                ExecuteState::Done(result) => self.release_value(result),
                other => return Ok(state_to_out(other)),
            }
        } else {
            self.release_args(args);
        }
        Ok(OpOut::Value(Value::object(instance)))
    }

    /// `Clone`: deep-copy an instance.
    pub(crate) fn op_clone(&mut self, value: Value) -> Result<OpOut, VmError> {
        let Some(instance) = value.as_object().cloned() else {
            self.diag(
                Fault::CloneNonObject,
                format!("clone of {}", value.type_name()),
            )?;
            self.release_value(value);
            return Ok(OpOut::Value(Value::null()));
        };
        let class = instance.borrow().class();
        let attrs: Vec<(Arc<str>, SlotId)> = instance
            .borrow()
            .attrs()
            .map(|(n, s)| (n.clone(), *s))
            .collect();
        let copy = self.classes.instantiate(class, &mut self.reftable);
        for (name, source) in attrs {
            let slot = match copy.borrow().attr_slot(&name) {
                Some(slot) => slot,
                None => {
                    let slot = self.reftable.reserve();
                    copy.borrow_mut().bind_attr(name.clone(), slot);
                    slot
                }
            };
            let source_value = self.reftable.value(source).clone();
            self.reftable.store(slot, &source_value);
        }
        if let Some(magic) = self.classes.method(class, CLONE).cloned() {
            let state = self.invoke_method(Some(copy.clone()), &magic, Vec::new())?;
            match state {
                ExecuteState::Done(result) => self.release_value(result),
                other => return Ok(state_to_out(other)),
            }
        }
        Ok(OpOut::Value(Value::object(copy)))
    }

    /// `IsA`: class-or-instance membership test.
    pub(crate) fn op_isa(&mut self, value: Value, target: Value) -> Result<OpOut, VmError> {
        let result = match value.as_object() {
            Some(instance) => {
                let class = instance.borrow().class();
                let target_id = match target.as_object() {
                    Some(t) => Some(t.borrow().class()),
                    None => {
                        let name = String::from_utf8_lossy(&target.cast_str()).into_owned();
                        self.classes.resolve(&name)
                    }
                };
                target_id.is_some_and(|t| self.classes.is_instance_of(class, t))
            }
            None => false,
        };
        self.release_value(value);
        self.release_value(target);
        Ok(OpOut::Value(Value::bool(result)))
    }

    /// Index read on an instance: `offsetGet` for array-access classes,
    /// `__get` otherwise.
    pub(crate) fn object_index_get(
        &mut self,
        instance: Rc<RefCell<Instance>>,
        key: Value,
    ) -> Result<OpOut, VmError> {
        let class = instance.borrow().class();
        let flags = self.classes.get(class).flags();
        let method = if flags.contains(ClassFlags::ARRAY_ACCESS) {
            self.classes.method(class, OFFSET_GET).cloned()
        } else {
            self.classes.method(class, MAGIC_GET).cloned()
        };
        match method {
            Some(method) => {
                let state = self.invoke_method(Some(instance), &method, vec![key])?;
                Ok(state_to_out(state))
            }
            None => {
                self.diag(Fault::NotAnArray, "object does not support index reads")?;
                self.release_value(key);
                Ok(OpOut::Value(Value::null()))
            }
        }
    }

    /// Index write on an instance: `offsetSet` for array-access classes,
    /// `__set` otherwise.
    pub(crate) fn object_index_set(
        &mut self,
        instance: Rc<RefCell<Instance>>,
        key: Value,
        value: Value,
    ) -> Result<OpOut, VmError> {
        let class = instance.borrow().class();
        let flags = self.classes.get(class).flags();
        let method = if flags.contains(ClassFlags::ARRAY_ACCESS) {
            self.classes.method(class, OFFSET_SET).cloned()
        } else {
            self.classes.method(class, MAGIC_SET).cloned()
        };
        match method {
            Some(method) => {
                let state = self.invoke_method(Some(instance), &method, vec![key, value])?;
                Ok(state_to_out(state))
            }
            None => {
                self.diag(Fault::NotAnArray, "object does not support index writes")?;
                self.release_value(key);
                self.release_value(value);
                Ok(OpOut::Value(Value::null()))
            }
        }
    }

    /// String coercion that honors `__toString`.
    pub(crate) fn coerce_str(&mut self, value: &Value) -> Result<Result<Vec<u8>, OpOut>, VmError> {
        let Some(instance) = value.as_object().cloned() else {
            return Ok(Ok(value.cast_str()));
        };
        let class = instance.borrow().class();
        let Some(method) = self.classes.method(class, TO_STRING).cloned() else {
            return Ok(Ok(value.cast_str()));
        };
        match self.invoke_method(Some(instance), &method, Vec::new())? {
            ExecuteState::Done(result) => {
                let bytes = result.cast_str();
                self.release_value(result);
                Ok(Ok(bytes))
            }
            other => Ok(Err(state_to_out(other))),
        }
    }

    pub(crate) fn release_args(&mut self, args: Vec<Value>) {
        for arg in args {
            self.release_value(arg);
        }
    }
}

/// Map a nested dispatch state onto an operation outcome.
pub(crate) fn state_to_out(state: ExecuteState) -> OpOut {
    match state {
        ExecuteState::Done(value) => OpOut::Value(value.detached()),
        ExecuteState::Throwing => OpOut::Threw,
        ExecuteState::Halt(value) => OpOut::Halt(value),
        ExecuteState::Abort => OpOut::Abort,
    }
}
