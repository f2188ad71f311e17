//! [`Vm`] implementation.
//!
//! One `Vm` instance is strictly single-threaded; the dispatcher is
//! re-entrant within the thread (host calls run nested dispatcher
//! invocations sharing the same reference table and frame stack). All
//! configuration flows through the verb methods here; the VM reads no
//! process-wide state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use phlox_asm::{ClassDecl, CodeBlock, Fault, Opcode, P3, ProgramImage};

use crate::array::Hashmap;
use crate::class::ClassRegistry;
use crate::consts::{DEFAULT_RECURSION_LIMIT, MAIN_SCRIPT, STACK_GUARD};
use crate::error::{ImageError, VmError};
use crate::frame::FrameStack;
use crate::function::{ConstantRegistry, ForeignImpl, FunctionRegistry};
use crate::output::{Consumer, ConsumerStatus, Diagnostic, StreamDevice};
use crate::reftable::{RefTable, SlotId};
use crate::state::{ExecuteState, ProgramState};
use crate::value::Value;

pub(crate) mod dispatch;
pub(crate) mod exception;
pub(crate) mod flow;
pub mod host;
pub(crate) mod object;

use exception::ExceptionUnit;

/// Hook that turns source text into a code block; installed by the
/// embedder so `eval` and `include` can reach the out-of-tree compiler.
pub type CompileHook = Box<dyn FnMut(&str) -> Result<Arc<CodeBlock>, String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Interpreter parameters.
pub struct VmParams {
    /// Ceiling for nested user-function calls.
    pub recursion_limit: usize,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }
}

/// A live foreach iteration.
pub(crate) struct ForeachState {
    pub(crate) desc: Arc<phlox_asm::ForeachDesc>,
    pub(crate) subject: IterSubject,
    pub(crate) pos: usize,
}

pub(crate) enum IterSubject {
    /// Snapshot of an array's keys at init time.
    Array(std::rc::Rc<std::cell::RefCell<Hashmap>>, Vec<crate::array::ArrayKey>),
    /// Snapshot of an instance's attribute names at init time.
    Object(std::rc::Rc<std::cell::RefCell<crate::class::Instance>>, Vec<Arc<str>>),
}

/// The virtual machine.
///
/// Built empty, configured through verbs, loaded with a program image via
/// [`Vm::make_ready`], and run with [`Vm::exec`]. Dropping the VM releases
/// every slot, frame, and registration in one step.
pub struct Vm {
    pub(crate) reftable: RefTable,
    pub(crate) frames: FrameStack,
    pub(crate) classes: ClassRegistry,
    pub(crate) functions: FunctionRegistry,
    pub(crate) constants: ConstantRegistry,
    pub(crate) superglobals: HashMap<Arc<str>, SlotId>,
    pub(crate) exceptions: ExceptionUnit,
    pub(crate) iters: Vec<ForeachState>,
    pub(crate) shutdown: Vec<(Value, Vec<Value>)>,
    consumer: Option<Box<dyn Consumer>>,
    error_callback: Option<Box<dyn FnMut(&Diagnostic)>>,
    error_handler: Option<Value>,
    in_error_handler: bool,
    error_reporting: bool,
    output_len: u64,
    params: VmParams,
    /// User-call depth, bounded by the recursion ceiling.
    pub(crate) depth: usize,
    /// Dispatcher nesting, used to attribute exception blocks to their
    /// dispatcher invocation.
    pub(crate) dispatch_depth: usize,
    files: Vec<Arc<str>>,
    import_paths: Vec<PathBuf>,
    streams: HashMap<Arc<str>, Box<dyn StreamDevice>>,
    compile_hook: Option<CompileHook>,
    main: Option<Arc<CodeBlock>>,
    pub(crate) closure_counter: u64,
    script_result: Option<Value>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A fresh VM with the core constants and the VM-intrinsic built-ins
    /// registered.
    pub fn new() -> Self {
        let mut vm = Self {
            reftable: RefTable::new(),
            frames: FrameStack::new(),
            classes: ClassRegistry::new(),
            functions: FunctionRegistry::new(),
            constants: ConstantRegistry::with_core(),
            superglobals: HashMap::new(),
            exceptions: ExceptionUnit::default(),
            iters: Vec::new(),
            shutdown: Vec::new(),
            consumer: None,
            error_callback: None,
            error_handler: None,
            in_error_handler: false,
            error_reporting: true,
            output_len: 0,
            params: VmParams::default(),
            depth: 0,
            dispatch_depth: 0,
            files: Vec::new(),
            import_paths: Vec::new(),
            streams: HashMap::new(),
            compile_hook: None,
            main: None,
            closure_counter: 0,
            script_result: None,
        };
        // The implicit class scalar casts and bare `new` sites rely on.
        let _ = vm
            .classes
            .register(&ClassDecl::new("stdClass"), &mut vm.reftable);
        host::install_intrinsics(&mut vm);
        vm
    }

    // --- configuration verbs ----------------------------------------------

    /// Install the output consumer.
    pub fn set_consumer(&mut self, consumer: Box<dyn Consumer>) {
        self.consumer = Some(consumer);
    }

    /// Append a directory to the include search path.
    pub fn append_import_path(&mut self, path: impl Into<PathBuf>) {
        self.import_paths.push(path.into());
    }

    /// Set the user-call recursion ceiling.
    pub fn set_recursion_limit(&mut self, limit: usize) {
        self.params.recursion_limit = limit.max(1);
    }

    /// Bytes emitted to the consumer so far.
    pub fn output_length(&self) -> u64 {
        self.output_len
    }

    /// Toggle diagnostic routing to the consumer.
    pub fn set_error_reporting(&mut self, enabled: bool) {
        self.error_reporting = enabled;
    }

    /// Install the structured-diagnostic callback.
    pub fn set_error_callback(&mut self, callback: Box<dyn FnMut(&Diagnostic)>) {
        self.error_callback = Some(callback);
    }

    /// Install the compile hook `eval` and `include` route through.
    pub fn set_compile_hook(&mut self, hook: CompileHook) {
        self.compile_hook = Some(hook);
    }

    /// Register a stream device under its scheme name.
    pub fn register_stream_device(
        &mut self,
        scheme: impl Into<Arc<str>>,
        device: Box<dyn StreamDevice>,
    ) {
        self.streams.insert(scheme.into(), device);
    }

    /// The registered stream device for a scheme.
    pub fn stream_device(&mut self, scheme: &str) -> Option<&mut Box<dyn StreamDevice>> {
        self.streams.get_mut(scheme)
    }

    /// Register a foreign function; re-registration overwrites.
    pub fn register_foreign(
        &mut self,
        name: impl Into<Arc<str>>,
        imp: ForeignImpl,
        user_data: std::rc::Rc<dyn std::any::Any>,
    ) {
        self.functions.register_foreign(name, imp, user_data);
    }

    /// Register a built-in constant with its expansion callback.
    pub fn register_constant(
        &mut self,
        name: impl Into<Arc<str>>,
        expand: impl Fn() -> Value + 'static,
    ) {
        self.constants.register(name, expand);
    }

    /// Install the uncaught-exception handler.
    pub fn set_uncaught_handler(&mut self, handler: Value) {
        self.exceptions.handler = Some(handler);
    }

    /// Create a superglobal holding an empty array, pinned for the VM's
    /// lifetime. Creating one that exists is a no-op.
    pub fn create_superglobal(&mut self, name: impl Into<Arc<str>>) -> SlotId {
        let name = name.into();
        if let Some(slot) = self.superglobals.get(&name) {
            return *slot;
        }
        let slot = self.reftable.reserve();
        let map = std::rc::Rc::new(std::cell::RefCell::new(Hashmap::new()));
        self.reftable.store(slot, &Value::array(map));
        self.reftable.pin(slot);
        self.superglobals.insert(name, slot);
        slot
    }

    /// Insert an entry into a superglobal array, creating the superglobal
    /// when missing. This is how the embedder feeds `$_GET`, `$_SERVER`,
    /// `argv`, and friends.
    pub fn set_superglobal_entry(
        &mut self,
        name: impl Into<Arc<str>>,
        key: &Value,
        value: Value,
    ) {
        let slot = self.create_superglobal(name);
        let Some(map) = self.reftable.value(slot).as_array().cloned() else {
            return;
        };
        let key = crate::array::ArrayKey::from_value(key);
        let existing = map.borrow().get(&key);
        match existing {
            Some(entry) => self.reftable.store(entry, &value),
            None => {
                let entry = self.reftable.reserve();
                self.reftable.store(entry, &value);
                map.borrow_mut().insert(Some(key.clone()), entry);
                self.reftable.install_node_ref(entry, &map, key);
            }
        }
        self.release_value(value);
    }

    /// Create (or overwrite) a global-frame variable.
    pub fn create_global(&mut self, name: impl Into<Arc<str>>, value: Value) -> SlotId {
        let name = name.into();
        let slot = match self.frames.global().lookup(&name) {
            Some(slot) => slot,
            None => {
                let slot = self.reftable.reserve();
                self.frames.global_mut().bind(name.clone(), slot);
                self.reftable.install_name_ref(slot, 0, name.clone());
                self.register_in_globals(&name, slot);
                slot
            }
        };
        self.reftable.store(slot, &value);
        self.release_value(value);
        slot
    }

    /// The value the script returned through `Done`, when it has run.
    pub fn script_return_value(&self) -> Option<&Value> {
        self.script_result.as_ref()
    }

    /// Interpreter parameters.
    pub fn params(&self) -> &VmParams {
        &self.params
    }

    /// The reference table, for embedders inspecting alias state.
    pub fn reftable(&self) -> &RefTable {
        &self.reftable
    }

    /// Current frame-stack depth, the global frame included.
    pub fn frames_depth(&self) -> usize {
        self.frames.depth()
    }

    // --- make-ready and execution -----------------------------------------

    /// Validate and load a program image: register its classes and
    /// functions and store the main block.
    pub fn make_ready(&mut self, image: ProgramImage) -> Result<(), VmError> {
        validate_block(&image.main)?;
        for decl in &image.functions {
            validate_block(&decl.code)?;
            for arg in &decl.args {
                if let Some(default) = &arg.default {
                    validate_block(default)?;
                }
            }
        }
        for decl in &image.classes {
            for method in &decl.methods {
                validate_block(&method.code)?;
            }
        }

        for decl in &image.classes {
            self.classes.register(decl, &mut self.reftable)?;
        }
        for decl in &image.functions {
            self.functions.register(decl.clone());
        }
        self.main = Some(image.main);
        tracing::debug!("program image made ready");
        Ok(())
    }

    /// Run the loaded program to completion.
    ///
    /// Normal termination runs the shutdown callbacks in registration
    /// order; `Halt` and consumer aborts skip them.
    pub fn exec(&mut self) -> Result<ProgramState, VmError> {
        let main = self.main.clone().ok_or(VmError::NotReady)?;
        if let Some(file) = &main.file {
            self.files.push(file.clone());
        }

        let mut stack: Vec<Value> = Vec::with_capacity(main.instrs.len() + STACK_GUARD);
        let state = match self.dispatch(&main, &mut stack, false) {
            Ok(state) => state,
            Err(VmError::ConsumerAbort) => return Ok(ProgramState::Abort),
            Err(err) => return Err(err),
        };
        // Helper frames opened at global scope (caught exceptions, abandoned
        // try regions) die with the main dispatch.
        while self.frames.depth() > 1 {
            if let Some(frame) = self.frames.pop() {
                self.teardown_frame(frame);
            }
        }

        match state {
            ExecuteState::Done(value) => {
                self.script_result = Some(value.clone().detached());
                self.run_shutdown()?;
                Ok(ProgramState::Return(value))
            }
            ExecuteState::Halt(value) => Ok(ProgramState::Halt(value)),
            ExecuteState::Throwing => {
                self.handle_uncaught()?;
                self.run_shutdown()?;
                Ok(ProgramState::Return(Value::null()))
            }
            ExecuteState::Abort => Ok(ProgramState::Abort),
        }
    }

    // --- output and diagnostics -------------------------------------------

    /// Push bytes to the output consumer, honoring its abort signal.
    pub(crate) fn emit(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.output_len += bytes.len() as u64;
        if let Some(consumer) = &mut self.consumer {
            if consumer.consume(bytes) == ConsumerStatus::Abort {
                return Err(VmError::ConsumerAbort);
            }
        }
        Ok(())
    }

    /// Emit a diagnostic for a recoverable fault.
    pub(crate) fn diag(&mut self, fault: Fault, message: impl Into<String>) -> Result<(), VmError> {
        let diagnostic = Diagnostic {
            severity: fault.severity(),
            fault: Some(fault),
            message: message.into(),
            file: self.current_file(),
        };
        self.emit_diagnostic(diagnostic)
    }

    /// Route a diagnostic: structured callback first, then the user error
    /// handler, then the consumer unless reporting is disabled.
    pub(crate) fn emit_diagnostic(&mut self, diagnostic: Diagnostic) -> Result<(), VmError> {
        tracing::debug!(%diagnostic, "diagnostic");
        if let Some(callback) = &mut self.error_callback {
            callback(&diagnostic);
        }
        if let Some(handler) = self.error_handler.clone() {
            if !self.in_error_handler {
                self.in_error_handler = true;
                let args = [
                    Value::int(diagnostic.severity as i64),
                    Value::str(&diagnostic.message),
                ];
                let outcome = self.call_value(&handler, &args);
                self.in_error_handler = false;
                outcome?;
                return Ok(());
            }
        }
        if self.error_reporting {
            let line = format!("{diagnostic}\n");
            self.emit(line.as_bytes())?;
        }
        Ok(())
    }

    /// The script path diagnostics name: the last entry of the files stack.
    pub(crate) fn current_file(&self) -> Arc<str> {
        self.files
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::from(MAIN_SCRIPT))
    }

    pub(crate) fn push_file(&mut self, file: Arc<str>) {
        self.files.push(file);
    }

    pub(crate) fn pop_file(&mut self) {
        self.files.pop();
    }

    pub(crate) fn import_paths(&self) -> &[PathBuf] {
        &self.import_paths
    }

    pub(crate) fn take_compile_hook(&mut self) -> Option<CompileHook> {
        self.compile_hook.take()
    }

    pub(crate) fn put_compile_hook(&mut self, hook: Option<CompileHook>) {
        if self.compile_hook.is_none() {
            self.compile_hook = hook;
        }
    }

    // --- variable plumbing ------------------------------------------------

    /// Resolve a variable by name through the superglobal table, then the
    /// frame stack.
    pub(crate) fn resolve_var(&self, name: &str) -> Option<SlotId> {
        if let Some(slot) = self.superglobals.get(name) {
            return Some(*slot);
        }
        self.frames.lookup(name)
    }

    /// Create a variable in the active frame; at global scope the name is
    /// also registered in `$GLOBALS`.
    pub(crate) fn create_var(&mut self, name: &Arc<str>) -> SlotId {
        let slot = self.reftable.reserve();
        let at_global = self.frames.at_global();
        let frame = self.frames.active_mut();
        let serial = frame.serial();
        frame.bind(name.clone(), slot);
        frame.owned.push(slot);
        self.reftable.install_name_ref(slot, serial, name.clone());
        if at_global {
            self.register_in_globals(name, slot);
        }
        slot
    }

    /// Alias `$GLOBALS[name]` to a global variable's slot.
    fn register_in_globals(&mut self, name: &Arc<str>, slot: SlotId) {
        let Some(globals) = self.superglobals.get("GLOBALS").copied() else {
            return;
        };
        let Some(map) = self.reftable.value(globals).as_array().cloned() else {
            return;
        };
        let key = crate::array::ArrayKey::from_bytes(name.as_bytes());
        map.borrow_mut().insert(Some(key.clone()), slot);
        self.reftable.install_node_ref(slot, &map, key);
    }

    /// Assign into a variable, resolving or creating the binding.
    pub(crate) fn store_var(&mut self, name: &Arc<str>, value: &Value) -> SlotId {
        let slot = match self.resolve_var(name) {
            Some(slot) => slot,
            None => self.create_var(name),
        };
        self.reftable.store(slot, value);
        slot
    }

    /// Rebind a name as an alias of `slot` in the active frame.
    pub(crate) fn bind_ref(&mut self, name: &Arc<str>, slot: SlotId) {
        let serial = self.frames.active().serial();
        if let Some(old) = self.frames.active_mut().bind(name.clone(), slot) {
            if old != slot {
                self.reftable.remove_name_ref(old, serial, name);
            }
        }
        self.reftable.install_name_ref(slot, serial, name.clone());
        self.frames.active_mut().aliased.push(slot);
    }

    /// Drop a frame's claims on its slots: every binding loses this frame's
    /// backref, and anonymous owned slots (unnamed arguments) free when
    /// nothing else aliases them.
    pub(crate) fn teardown_frame(&mut self, frame: crate::frame::Frame) {
        let serial = frame.serial();
        for (name, slot) in &frame.vars {
            self.reftable.remove_name_ref(*slot, serial, name);
        }
        for slot in &frame.owned {
            self.reftable.free_unreferenced(*slot);
        }
    }

    /// Drop an operand that never got bound to a slot, cascading aggregate
    /// teardown when this was the last holder.
    pub(crate) fn release_value(&mut self, value: Value) {
        if !value.slot().is_valid() {
            self.reftable.release_payload(value);
        }
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("reftable", &self.reftable)
            .field("frames", &self.frames.depth())
            .field("depth", &self.depth)
            .field("output_len", &self.output_len)
            .finish()
    }
}

/// Structural validation of one code block, recursing into payloads.
fn validate_block(code: &CodeBlock) -> Result<(), ImageError> {
    if !code.is_terminated() {
        return Err(ImageError::MissingDone);
    }
    let len = code.instrs.len() as u32;
    for (at, instr) in code.instrs.iter().enumerate() {
        let jump_target = match instr.op {
            Opcode::Jmp
            | Opcode::Jz
            | Opcode::Jnz
            | Opcode::LoadException
            | Opcode::ForeachInit
            | Opcode::ForeachStep => Some(instr.p2),
            // Comparison jumps only when a target is encoded.
            Opcode::Eq
            | Opcode::Neq
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Teq
            | Opcode::Tne
            | Opcode::Seq
            | Opcode::Sne
                if instr.p2 != 0 =>
            {
                Some(instr.p2)
            }
            _ => None,
        };
        if let Some(target) = jump_target {
            if target >= len {
                return Err(ImageError::JumpOutOfBounds { at, target });
            }
        }
        match &instr.p3 {
            P3::Literal(index) => {
                if *index >= code.literals.len() {
                    return Err(ImageError::LiteralOutOfBounds { at, index: *index });
                }
            }
            P3::Function(decl) => validate_block(&decl.code)?,
            P3::Switch(table) => {
                for case in &table.cases {
                    validate_block(&case.code)?;
                    if case.target >= len {
                        return Err(ImageError::JumpOutOfBounds {
                            at,
                            target: case.target,
                        });
                    }
                }
                for target in table.default_target.iter().chain([&table.exit_target]) {
                    if *target >= len {
                        return Err(ImageError::JumpOutOfBounds {
                            at,
                            target: *target,
                        });
                    }
                }
            }
            P3::Exception(block) => {
                for clause in &block.catches {
                    if clause.target >= len {
                        return Err(ImageError::JumpOutOfBounds {
                            at,
                            target: clause.target,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}
