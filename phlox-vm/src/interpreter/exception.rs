//! The exception unit: the try-region stack, throw/catch resolution, and
//! uncaught-handler dispatch.

use std::sync::Arc;

use phlox_asm::{ClassFlags, ExceptionBlock, Fault};

use crate::error::VmError;
use crate::frame::{FrameFlags, FrameInit};
use crate::interpreter::host::HostOutcome;
use crate::interpreter::Vm;
use crate::value::Value;

/// One try region, pushed by `LoadException`.
pub(crate) struct ExcEntry {
    /// The catch clauses.
    pub block: Arc<ExceptionBlock>,
    /// Serial of the Exception helper frame opened for the region.
    pub frame_serial: u64,
    /// The dispatcher invocation the region belongs to; an unwind never
    /// crosses it.
    pub dispatch_depth: usize,
}

#[derive(Default)]
/// VM-wide exception state.
pub(crate) struct ExceptionUnit {
    /// Open try regions, innermost last.
    pub stack: Vec<ExcEntry>,
    /// The value in flight between throw and catch.
    pub current: Option<Value>,
    /// The installed uncaught-exception handler.
    pub handler: Option<Value>,
}

/// What a throw resolved to inside the current dispatcher invocation.
pub(crate) enum ThrowOutcome {
    /// A catch clause matched; jump to its target.
    Caught(u32),
    /// No handler here; the caller dispatcher re-raises.
    Propagate,
    /// The thrown value was not throwable; a diagnostic was emitted and
    /// execution continues.
    Ignored,
}

impl Vm {
    /// Enter a try region: push its descriptor and open an
    /// Exception-marked helper frame whose jump target is the catch
    /// dispatcher.
    pub(crate) fn op_load_exception(&mut self, block: Arc<ExceptionBlock>, target: u32) {
        let serial = self.frames.push(FrameInit {
            flags: FrameFlags::EXCEPTION,
            catch_target: target,
            ..FrameInit::default()
        });
        self.exceptions.stack.push(ExcEntry {
            block,
            frame_serial: serial,
            dispatch_depth: self.dispatch_depth,
        });
    }

    /// Leave a try region that completed without a throw.
    pub(crate) fn op_pop_exception(&mut self) {
        if let Some(entry) = self.exceptions.stack.pop() {
            self.unwind_to(entry.frame_serial);
        }
    }

    /// Throw a value from user code.
    pub(crate) fn throw_value(&mut self, value: Value) -> Result<ThrowOutcome, VmError> {
        let throwable = value
            .as_object()
            .map(|inst| {
                let class = inst.borrow().class();
                self.classes.get(class).flags().contains(ClassFlags::THROWABLE)
            })
            .unwrap_or(false);
        if !throwable {
            self.diag(
                Fault::ThrowNotThrowable,
                format!("thrown value of type {} is not throwable", value.type_name()),
            )?;
            self.release_value(value);
            return Ok(ThrowOutcome::Ignored);
        }
        self.exceptions.current = Some(value.detached());
        Ok(self.resolve_throw())
    }

    /// Walk the try regions belonging to the current dispatcher invocation
    /// looking for a matching catch clause. Used both at the `Throw` site
    /// and when a nested call re-raises.
    pub(crate) fn resolve_throw(&mut self) -> ThrowOutcome {
        let Some(thrown) = self.exceptions.current.clone() else {
            return ThrowOutcome::Ignored;
        };
        loop {
            let here = self
                .exceptions
                .stack
                .last()
                .map(|entry| entry.dispatch_depth == self.dispatch_depth)
                .unwrap_or(false);
            if !here {
                // The unwinding signal for the caller dispatcher.
                self.frames.active_mut().set_throw();
                return ThrowOutcome::Propagate;
            }
            let Some(entry) = self.exceptions.stack.pop() else {
                return ThrowOutcome::Propagate;
            };
            let clause = entry
                .block
                .catches
                .iter()
                .find(|clause| self.value_instance_of_name(&thrown, &clause.class_name))
                .cloned();
            // Leaving the try region either way: frames above and including
            // its helper frame are released.
            self.unwind_to(entry.frame_serial);
            if let Some(clause) = clause {
                let serial = self.frames.push(FrameInit {
                    flags: FrameFlags::CATCH,
                    ..FrameInit::default()
                });
                let slot = self.reftable.reserve();
                self.reftable.store(slot, &thrown);
                let frame = self.frames.top_mut();
                frame.bind(clause.var_name.clone(), slot);
                frame.owned.push(slot);
                self.reftable
                    .install_name_ref(slot, serial, clause.var_name.clone());
                self.exceptions.current = None;
                return ThrowOutcome::Caught(clause.target);
            }
        }
    }

    /// Pop and tear down frames until the one with `serial` has been
    /// popped. The global frame never pops.
    pub(crate) fn unwind_to(&mut self, serial: u64) {
        while let Some(frame) = self.frames.pop() {
            let popped = frame.serial();
            self.teardown_frame(frame);
            if popped == serial {
                break;
            }
        }
    }

    /// Drop try regions abandoned by a dispatch that is returning (a
    /// `return` inside a try block leaves its descriptor behind).
    pub(crate) fn purge_exception_entries(&mut self) {
        let depth = self.dispatch_depth;
        while let Some(entry) = self.exceptions.stack.last() {
            if entry.dispatch_depth < depth {
                break;
            }
            let serial = entry.frame_serial;
            self.exceptions.stack.pop();
            self.unwind_to(serial);
        }
    }

    /// Whether a value is an instance of the named class or interface.
    pub(crate) fn value_instance_of_name(&self, value: &Value, name: &str) -> bool {
        let Some(instance) = value.as_object() else {
            return false;
        };
        let Some(target) = self.classes.resolve(name) else {
            return false;
        };
        let class = instance.borrow().class();
        self.classes.is_instance_of(class, target)
    }

    /// Uncaught-exception handling at the outermost dispatcher: invoke the
    /// installed handler, or fail fatally.
    pub(crate) fn handle_uncaught(&mut self) -> Result<(), VmError> {
        let Some(exception) = self.exceptions.current.take() else {
            return Ok(());
        };
        if let Some(handler) = self.exceptions.handler.clone() {
            match self.call_value(&handler, &[exception])? {
                HostOutcome::Threw => {
                    // The handler itself failed; fall through to the fatal
                    // path with the handler's exception.
                    let message = self.describe_exception();
                    self.exceptions.current = None;
                    let line = format!("Fatal error: uncaught exception: {message}\n");
                    self.emit(line.as_bytes())?;
                    return Err(VmError::UncaughtException(message));
                }
                _ => return Ok(()),
            }
        }
        let message = describe(&exception, self);
        let line = format!("Fatal error: uncaught exception: {message}\n");
        self.emit(line.as_bytes())?;
        Err(VmError::UncaughtException(message))
    }

    fn describe_exception(&mut self) -> String {
        match self.exceptions.current.take() {
            Some(exception) => describe(&exception, self),
            None => "unknown".into(),
        }
    }
}

/// Best-effort description: the `message` attribute when the exception
/// carries one, the class name otherwise.
fn describe(exception: &Value, vm: &Vm) -> String {
    let Some(instance) = exception.as_object() else {
        return exception.type_name().into();
    };
    let instance = instance.borrow();
    if let Some(slot) = instance.attr_slot("message") {
        let message = vm.reftable.value(slot).cast_str();
        return String::from_utf8_lossy(&message).into_owned();
    }
    vm.classes.get(instance.class()).name().to_string()
}
