//! The host-call API: invoking user code from foreign code and vice
//! versa, the foreign-function call context, and the VM-intrinsic
//! built-ins.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use phlox_asm::{CodeBlock, Instr, Opcode, Severity};

use crate::array::{ArrayKey, Hashmap};
use crate::class::INVOKE;
use crate::consts::HOST_STACK_GUARD;
use crate::error::VmError;
use crate::function::{FfiStatus, ForeignImpl};
use crate::interpreter::Vm;
use crate::output::Diagnostic;
use crate::state::ExecuteState;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
/// Outcome of a host-initiated call into user code.
pub enum HostOutcome {
    /// The callee returned a value.
    Completed(Value),
    /// The callee threw and nothing caught; the exception stays pending in
    /// the VM so an enclosing dispatcher can re-raise it.
    Threw,
    /// A `Halt` instruction ran inside the callee.
    Halted(Value),
    /// The output consumer aborted.
    Aborted,
}

impl Vm {
    /// Invoke a callable from outside the dispatcher: a scratch code
    /// buffer of `Call n / Done 1` runs on a scratch stack holding the
    /// argument copies (representation and slot index, so by-reference
    /// parameters still alias) and the callee.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<HostOutcome, VmError> {
        let code = Arc::new(CodeBlock::new(vec![
            Instr::new(Opcode::Call).p1(args.len() as i32),
            Instr::new(Opcode::Done).p1(1),
        ]));
        let mut stack: Vec<Value> = Vec::with_capacity(args.len() + HOST_STACK_GUARD);
        for arg in args {
            stack.push(arg.clone());
        }
        stack.push(callee.clone());
        // The callback flag keeps an uncaught exception propagating to the
        // enclosing dispatcher instead of aborting the process.
        let state = self.dispatch(&code, &mut stack, true)?;
        Ok(match state {
            ExecuteState::Done(value) => HostOutcome::Completed(value),
            ExecuteState::Throwing => HostOutcome::Threw,
            ExecuteState::Halt(value) => HostOutcome::Halted(value),
            ExecuteState::Abort => HostOutcome::Aborted,
        })
    }

    /// Run the registered shutdown callbacks in registration order.
    pub(crate) fn run_shutdown(&mut self) -> Result<(), VmError> {
        let callbacks = std::mem::take(&mut self.shutdown);
        for (callee, args) in callbacks {
            tracing::debug!("shutdown callback");
            match self.call_value(&callee, &args)? {
                HostOutcome::Completed(value) => self.release_value(value),
                HostOutcome::Threw => self.handle_uncaught()?,
                HostOutcome::Halted(_) | HostOutcome::Aborted => break,
            }
        }
        Ok(())
    }
}

/// The context a foreign function receives: the argument array, a result
/// cell, a private scratch allocator freed at teardown, the user data
/// captured at registration, and diagnostic facilities. Implementations
/// must not retain argument values past return.
pub struct CallContext<'vm> {
    pub(crate) vm: &'vm mut Vm,
    args: Vec<Value>,
    result: Value,
    user_data: Rc<dyn Any>,
    scratch: Vec<Box<[u8]>>,
}

impl<'vm> CallContext<'vm> {
    pub(crate) fn new(vm: &'vm mut Vm, args: Vec<Value>, user_data: Rc<dyn Any>) -> Self {
        Self {
            vm,
            args,
            result: Value::null(),
            user_data,
            scratch: Vec::new(),
        }
    }

    /// Number of arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// One argument.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// The whole argument array.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Set the call result.
    pub fn set_result(&mut self, value: Value) {
        self.result = value;
    }

    /// The registration user data.
    pub fn user_data(&self) -> &Rc<dyn Any> {
        &self.user_data
    }

    /// Allocate a scratch chunk, freed automatically at context teardown.
    pub fn scratch_alloc(&mut self, len: usize) -> &mut [u8] {
        self.scratch.push(vec![0u8; len].into_boxed_slice());
        self.scratch
            .last_mut()
            .expect("chunk was just pushed")
    }

    /// Emit a notice diagnostic.
    pub fn notice(&mut self, message: impl Into<String>) -> Result<(), VmError> {
        self.vm.diag_raw(Severity::Notice, message.into())
    }

    /// Emit a warning diagnostic.
    pub fn warning(&mut self, message: impl Into<String>) -> Result<(), VmError> {
        self.vm.diag_raw(Severity::Warning, message.into())
    }

    /// Emit an error diagnostic.
    pub fn error(&mut self, message: impl Into<String>) -> Result<(), VmError> {
        self.vm.diag_raw(Severity::Error, message.into())
    }

    /// Throw from foreign code; the dispatcher re-raises at the call site.
    pub fn throw(&mut self, value: Value) {
        self.vm.exceptions.current = Some(value.detached());
    }

    /// Call back into user code.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> Result<HostOutcome, VmError> {
        self.vm.call_value(callee, args)
    }

    pub(crate) fn finish(&mut self) -> Value {
        self.scratch.clear();
        std::mem::take(&mut self.result)
    }
}

impl Vm {
    /// Diagnostic without a fault code, for foreign functions.
    pub(crate) fn diag_raw(&mut self, severity: Severity, message: String) -> Result<(), VmError> {
        let diagnostic = Diagnostic {
            severity,
            fault: None,
            message,
            file: self.current_file(),
        };
        self.emit_diagnostic(diagnostic)
    }
}

// --- VM-intrinsic built-ins -------------------------------------------------

/// Register the built-ins the dispatcher itself depends on. They use the
/// same foreign-function protocol as embedder functions.
pub(crate) fn install_intrinsics(vm: &mut Vm) {
    let table: &[(&str, fn(&mut CallContext<'_>) -> FfiStatus)] = &[
        ("compact", intrinsic_compact),
        ("extract", intrinsic_extract),
        ("unset", intrinsic_unset),
        ("register_shutdown_function", intrinsic_register_shutdown),
        ("set_exception_handler", intrinsic_set_exception_handler),
        ("set_error_handler", intrinsic_set_error_handler),
        ("func_num_args", intrinsic_func_num_args),
        ("func_get_args", intrinsic_func_get_args),
        ("call_user_func", intrinsic_call_user_func),
        ("call_user_func_array", intrinsic_call_user_func_array),
        ("is_callable", intrinsic_is_callable),
        ("get_class", intrinsic_get_class),
        ("eval", intrinsic_eval),
        ("include", intrinsic_include),
        ("getopt", intrinsic_getopt),
    ];
    for (name, imp) in table {
        let imp: ForeignImpl = Rc::new(*imp);
        vm.functions.register_foreign(*name, imp, Rc::new(()));
    }
}

/// `compact(name, ...)`: build an array from current-scope variables.
fn intrinsic_compact(ctx: &mut CallContext<'_>) -> FfiStatus {
    let map = Rc::new(RefCell::new(Hashmap::new()));
    let names: Vec<String> = ctx
        .args()
        .iter()
        .flat_map(|arg| match arg.as_array() {
            Some(inner) => inner
                .borrow()
                .slots()
                .iter()
                .map(|slot| {
                    String::from_utf8_lossy(&ctx.vm.reftable.value(*slot).cast_str()).into_owned()
                })
                .collect::<Vec<_>>(),
            None => vec![String::from_utf8_lossy(&arg.cast_str()).into_owned()],
        })
        .collect();
    for name in names {
        let Some(slot) = ctx.vm.resolve_var(&name) else {
            continue;
        };
        let value = ctx.vm.reftable.value(slot).clone();
        let entry = ctx.vm.reftable.reserve();
        ctx.vm.reftable.store(entry, &value);
        let key = ArrayKey::from_bytes(name.as_bytes());
        map.borrow_mut().insert(Some(key.clone()), entry);
        ctx.vm.reftable.install_node_ref(entry, &map, key);
    }
    ctx.set_result(Value::array(map));
    FfiStatus::Ok
}

/// `extract(array)`: create current-scope variables from string keys;
/// returns how many were extracted.
fn intrinsic_extract(ctx: &mut CallContext<'_>) -> FfiStatus {
    let Some(map) = ctx.arg(0).and_then(|a| a.as_array()).cloned() else {
        ctx.set_result(Value::int(0));
        return FfiStatus::Ok;
    };
    let entries: Vec<(ArrayKey, crate::reftable::SlotId)> = map
        .borrow()
        .iter()
        .map(|(k, s)| (k.clone(), *s))
        .collect();
    let mut count = 0i64;
    for (key, slot) in entries {
        let ArrayKey::Str(name) = key else { continue };
        let name: Arc<str> = Arc::from(String::from_utf8_lossy(&name).as_ref());
        let value = ctx.vm.reftable.value(slot).clone();
        ctx.vm.store_var(&name, &value);
        count += 1;
    }
    ctx.set_result(Value::int(count));
    FfiStatus::Ok
}

/// `unset(var, ...)`: break every backref of each argument's slot and
/// reclaim it unless pinned. Arguments must have been loaded from
/// variables so they carry their slot index.
fn intrinsic_unset(ctx: &mut CallContext<'_>) -> FfiStatus {
    let slots: Vec<crate::reftable::SlotId> =
        ctx.args().iter().map(Value::slot).collect();
    let vm = &mut *ctx.vm;
    for slot in slots {
        if slot.is_valid() {
            vm.reftable.release(slot, false, &mut vm.frames);
        }
    }
    FfiStatus::Ok
}

/// `register_shutdown_function(callable, args...)`.
fn intrinsic_register_shutdown(ctx: &mut CallContext<'_>) -> FfiStatus {
    let Some(callee) = ctx.arg(0).cloned() else {
        return FfiStatus::Ok;
    };
    let extra: Vec<Value> = ctx.args()[1..].iter().map(|v| v.clone().detached()).collect();
    ctx.vm.shutdown.push((callee.detached(), extra));
    FfiStatus::Ok
}

/// `set_exception_handler(callable)`: returns the previous handler.
fn intrinsic_set_exception_handler(ctx: &mut CallContext<'_>) -> FfiStatus {
    let new = ctx.arg(0).map(|v| v.clone().detached());
    let old = match new {
        Some(handler) => ctx.vm.exceptions.handler.replace(handler),
        None => ctx.vm.exceptions.handler.take(),
    };
    ctx.set_result(old.unwrap_or_else(Value::null));
    FfiStatus::Ok
}

/// `set_error_handler(callable)`: returns the previous handler.
fn intrinsic_set_error_handler(ctx: &mut CallContext<'_>) -> FfiStatus {
    let new = ctx.arg(0).map(|v| v.clone().detached());
    let old = ctx.vm.swap_error_handler(new);
    ctx.set_result(old.unwrap_or_else(Value::null));
    FfiStatus::Ok
}

impl Vm {
    pub(crate) fn swap_error_handler(&mut self, handler: Option<Value>) -> Option<Value> {
        std::mem::replace(&mut self.error_handler, handler)
    }
}

fn intrinsic_func_num_args(ctx: &mut CallContext<'_>) -> FfiStatus {
    let count = ctx.vm.frames.active().args.len() as i64;
    ctx.set_result(Value::int(count));
    FfiStatus::Ok
}

fn intrinsic_func_get_args(ctx: &mut CallContext<'_>) -> FfiStatus {
    let slots = ctx.vm.frames.active().args.clone();
    let map = Rc::new(RefCell::new(Hashmap::new()));
    for slot in slots {
        let value = ctx.vm.reftable.value(slot).clone();
        let entry = ctx.vm.reftable.reserve();
        ctx.vm.reftable.store(entry, &value);
        let key = map.borrow_mut().insert(None, entry);
        ctx.vm.reftable.install_node_ref(entry, &map, key);
    }
    ctx.set_result(Value::array(map));
    FfiStatus::Ok
}

fn intrinsic_call_user_func(ctx: &mut CallContext<'_>) -> FfiStatus {
    let Some(callee) = ctx.arg(0).cloned() else {
        ctx.set_result(Value::bool(false));
        return FfiStatus::Ok;
    };
    let args: Vec<Value> = ctx.args()[1..].to_vec();
    dispatch_host_call(ctx, &callee, &args)
}

fn intrinsic_call_user_func_array(ctx: &mut CallContext<'_>) -> FfiStatus {
    let Some(callee) = ctx.arg(0).cloned() else {
        ctx.set_result(Value::bool(false));
        return FfiStatus::Ok;
    };
    let args: Vec<Value> = match ctx.arg(1).and_then(|a| a.as_array()).cloned() {
        Some(map) => {
            let slots = map.borrow().slots();
            slots
                .iter()
                .map(|slot| ctx.vm.reftable.value(*slot).clone())
                .collect()
        }
        None => Vec::new(),
    };
    dispatch_host_call(ctx, &callee, &args)
}

fn dispatch_host_call(ctx: &mut CallContext<'_>, callee: &Value, args: &[Value]) -> FfiStatus {
    match ctx.vm.call_value(callee, args) {
        Ok(HostOutcome::Completed(value)) => {
            ctx.set_result(value);
            FfiStatus::Ok
        }
        // Pending exception: the dispatcher re-raises at the foreign call
        // site.
        Ok(HostOutcome::Threw) => FfiStatus::Ok,
        Ok(HostOutcome::Halted(_)) | Ok(HostOutcome::Aborted) => FfiStatus::Abort,
        Err(_) => FfiStatus::Abort,
    }
}

fn intrinsic_is_callable(ctx: &mut CallContext<'_>) -> FfiStatus {
    let callable = match ctx.arg(0) {
        Some(value) if value.is_str() => {
            let name = String::from_utf8_lossy(value.str_bytes()).into_owned();
            ctx.vm.functions.head(&name).is_some() || ctx.vm.functions.foreign(&name).is_some()
        }
        Some(value) if value.is_array() => value
            .as_array()
            .is_some_and(|map| map.borrow().len() == 2),
        Some(value) => value
            .as_object()
            .map(|instance| {
                let class = instance.borrow().class();
                ctx.vm.classes.method(class, INVOKE).is_some()
            })
            .unwrap_or(false),
        None => false,
    };
    ctx.set_result(Value::bool(callable));
    FfiStatus::Ok
}

fn intrinsic_get_class(ctx: &mut CallContext<'_>) -> FfiStatus {
    let result = match ctx.arg(0).and_then(|v| v.as_object()).cloned() {
        Some(instance) => {
            let class = instance.borrow().class();
            Value::str(ctx.vm.classes.get(class).name().as_ref())
        }
        None => Value::bool(false),
    };
    ctx.set_result(result);
    FfiStatus::Ok
}

/// `eval(source)`: compile through the host hook and run in the current
/// scope.
fn intrinsic_eval(ctx: &mut CallContext<'_>) -> FfiStatus {
    let source = match ctx.arg(0) {
        Some(value) => String::from_utf8_lossy(&value.cast_str()).into_owned(),
        None => return FfiStatus::Ok,
    };
    run_compiled(ctx, &source, None)
}

/// `include(path)`: locate through the import paths, compile, run; the
/// file joins the files stack for the duration.
fn intrinsic_include(ctx: &mut CallContext<'_>) -> FfiStatus {
    let path = match ctx.arg(0) {
        Some(value) => String::from_utf8_lossy(&value.cast_str()).into_owned(),
        None => return FfiStatus::Ok,
    };
    let mut candidates = vec![std::path::PathBuf::from(&path)];
    for dir in ctx.vm.import_paths() {
        candidates.push(dir.join(&path));
    }
    let Some(source) = candidates
        .iter()
        .find_map(|candidate| std::fs::read_to_string(candidate).ok())
    else {
        let _ = ctx.warning(format!("include: cannot open {path}"));
        ctx.set_result(Value::bool(false));
        return FfiStatus::Ok;
    };
    run_compiled(ctx, &source, Some(Arc::from(path.as_str())))
}

fn run_compiled(ctx: &mut CallContext<'_>, source: &str, file: Option<Arc<str>>) -> FfiStatus {
    let Some(mut hook) = ctx.vm.take_compile_hook() else {
        let _ = ctx.warning("no compile hook installed");
        ctx.set_result(Value::bool(false));
        return FfiStatus::Ok;
    };
    let compiled = hook(source);
    ctx.vm.put_compile_hook(Some(hook));
    let code = match compiled {
        Ok(code) => code,
        Err(message) => {
            let _ = ctx.error(format!("compile error: {message}"));
            ctx.set_result(Value::bool(false));
            return FfiStatus::Ok;
        }
    };
    if let Some(file) = file {
        ctx.vm.push_file(file);
    }
    let mut stack: Vec<Value> = Vec::with_capacity(code.instrs.len() + HOST_STACK_GUARD);
    let state = ctx.vm.dispatch(&code, &mut stack, true);
    ctx.vm.pop_file();
    match state {
        Ok(ExecuteState::Done(value)) => {
            ctx.set_result(value);
            FfiStatus::Ok
        }
        Ok(ExecuteState::Throwing) => FfiStatus::Ok,
        Ok(ExecuteState::Halt(_)) | Ok(ExecuteState::Abort) | Err(_) => FfiStatus::Abort,
    }
}

/// `getopt(optstring)`: parse short options out of the `argv` superglobal.
/// A `:` suffix marks an option as taking a value.
fn intrinsic_getopt(ctx: &mut CallContext<'_>) -> FfiStatus {
    let optstring = match ctx.arg(0) {
        Some(value) => String::from_utf8_lossy(&value.cast_str()).into_owned(),
        None => String::new(),
    };
    let argv: Vec<String> = match ctx
        .vm
        .resolve_var("argv")
        .map(|slot| ctx.vm.reftable.value(slot).clone())
        .and_then(|v| v.as_array().cloned())
    {
        Some(map) => map
            .borrow()
            .slots()
            .iter()
            .map(|slot| {
                String::from_utf8_lossy(&ctx.vm.reftable.value(*slot).cast_str()).into_owned()
            })
            .collect(),
        None => Vec::new(),
    };

    let mut takes_value = std::collections::HashMap::new();
    let mut chars = optstring.chars().peekable();
    while let Some(c) = chars.next() {
        let with_value = chars.peek() == Some(&':');
        if with_value {
            chars.next();
        }
        takes_value.insert(c, with_value);
    }

    let map = Rc::new(RefCell::new(Hashmap::new()));
    let mut index = 0;
    while index < argv.len() {
        let word = &argv[index];
        if let Some(opt) = word.strip_prefix('-').and_then(|rest| rest.chars().next()) {
            if let Some(with_value) = takes_value.get(&opt) {
                let value = if *with_value {
                    index += 1;
                    argv.get(index)
                        .map(|v| Value::str(v))
                        .unwrap_or_else(|| Value::bool(false))
                } else {
                    Value::bool(false)
                };
                let entry = ctx.vm.reftable.reserve();
                ctx.vm.reftable.store(entry, &value);
                let key = ArrayKey::from_bytes(opt.to_string().as_bytes());
                map.borrow_mut().insert(Some(key.clone()), entry);
                ctx.vm.reftable.install_node_ref(entry, &map, key);
            }
        }
        index += 1;
    }
    ctx.set_result(Value::array(map));
    FfiStatus::Ok
}
