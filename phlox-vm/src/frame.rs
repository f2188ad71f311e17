//! Activation records and the frame stack.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::class::{ClassId, Instance};
use crate::reftable::SlotId;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Frame role bits.
    pub struct FrameFlags: u8 {
        /// A helper frame opened by `LoadException`; transparent to
        /// variable lookup.
        const EXCEPTION = 0x01;
        /// An exception is unwinding through this frame.
        const THROW = 0x02;
        /// A helper frame executing a catch block.
        const CATCH = 0x04;
    }
}

#[derive(Debug)]
/// One activation record.
///
/// The parent link is the stack position below; helper frames thread
/// exception state without disturbing user scope.
pub struct Frame {
    serial: u64,
    flags: FrameFlags,
    /// Local variable bindings: name → slot.
    pub(crate) vars: HashMap<Arc<str>, SlotId>,
    /// Argument slots in declaration order.
    pub(crate) args: Vec<SlotId>,
    /// Slots this frame reserved and must drop its binding of on exit.
    pub(crate) owned: Vec<SlotId>,
    /// Slots this frame aliases but does not own (references, statics,
    /// uplinked globals).
    pub(crate) aliased: Vec<SlotId>,
    /// The enclosing `$this`, for method frames.
    pub(crate) this: Option<Rc<RefCell<Instance>>>,
    /// The class whose method this frame executes; decides visibility.
    pub(crate) class_scope: Option<ClassId>,
    /// Jump target of the catch dispatcher, for Exception helper frames.
    pub(crate) catch_target: u32,
}

impl Frame {
    fn new(serial: u64, flags: FrameFlags) -> Self {
        Self {
            serial,
            flags,
            vars: HashMap::new(),
            args: Vec::new(),
            owned: Vec::new(),
            aliased: Vec::new(),
            this: None,
            class_scope: None,
            catch_target: 0,
        }
    }

    /// The frame's stable serial; backrefs identify frames by it.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The frame's role bits.
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// Whether variable lookup traverses through this frame instead of
    /// stopping at it.
    pub fn is_helper(&self) -> bool {
        self.flags.intersects(FrameFlags::EXCEPTION | FrameFlags::CATCH)
    }

    /// Mark the frame as a point an exception is propagating through.
    pub fn set_throw(&mut self) {
        self.flags |= FrameFlags::THROW;
    }

    /// The enclosing instance, for method frames.
    pub fn this(&self) -> Option<&Rc<RefCell<Instance>>> {
        self.this.as_ref()
    }

    /// The visibility context of this frame.
    pub fn class_scope(&self) -> Option<ClassId> {
        self.class_scope
    }

    /// The catch dispatcher target of an Exception helper frame.
    pub fn catch_target(&self) -> u32 {
        self.catch_target
    }

    /// Bind `name` to `slot`, returning a previously bound slot when the
    /// name was already taken.
    pub fn bind(&mut self, name: Arc<str>, slot: SlotId) -> Option<SlotId> {
        self.vars.insert(name, slot)
    }

    /// The slot bound to `name`.
    pub fn lookup(&self, name: &str) -> Option<SlotId> {
        self.vars.get(name).copied()
    }
}

/// Builder for the fields a new frame starts with.
#[derive(Default)]
pub struct FrameInit {
    /// Role bits.
    pub flags: FrameFlags,
    /// The enclosing instance.
    pub this: Option<Rc<RefCell<Instance>>>,
    /// The visibility context.
    pub class_scope: Option<ClassId>,
    /// Catch dispatcher target, for Exception helper frames.
    pub catch_target: u32,
}

#[derive(Debug)]
/// The frame stack. The bottom frame is the global frame and lives as long
/// as the VM.
pub struct FrameStack {
    frames: Vec<Frame>,
    next_serial: u64,
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameStack {
    /// A stack holding only the global frame.
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::new(0, FrameFlags::empty())],
            next_serial: 1,
        }
    }

    /// Number of frames, the global frame included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push a frame and return its serial.
    pub fn push(&mut self, init: FrameInit) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        let mut frame = Frame::new(serial, init.flags);
        frame.this = init.this;
        frame.class_scope = init.class_scope;
        frame.catch_target = init.catch_target;
        self.frames.push(frame);
        serial
    }

    /// Pop the top frame. The global frame never pops.
    pub fn pop(&mut self) -> Option<Frame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// The top frame.
    pub fn top(&self) -> &Frame {
        self.frames.last().expect("frame stack holds the global frame")
    }

    /// The top frame, mutably.
    pub fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack holds the global frame")
    }

    /// The global frame.
    pub fn global(&self) -> &Frame {
        &self.frames[0]
    }

    /// The global frame, mutably.
    pub fn global_mut(&mut self) -> &mut Frame {
        &mut self.frames[0]
    }

    /// Whether the active frame is the global frame.
    pub fn at_global(&self) -> bool {
        self.active_index() == 0
    }

    /// Index of the frame new bindings land in: the topmost frame that is
    /// not a helper.
    fn active_index(&self) -> usize {
        self.frames
            .iter()
            .rposition(|f| !f.is_helper())
            .unwrap_or(0)
    }

    /// The frame new bindings land in.
    pub fn active(&self) -> &Frame {
        &self.frames[self.active_index()]
    }

    /// The frame new bindings land in, mutably.
    pub fn active_mut(&mut self) -> &mut Frame {
        let index = self.active_index();
        &mut self.frames[index]
    }

    /// Resolve a variable: walk down from the top, checking helper frames
    /// crossed on the way, and stop after the first non-helper frame.
    pub fn lookup(&self, name: &str) -> Option<SlotId> {
        for frame in self.frames.iter().rev() {
            if let Some(slot) = frame.lookup(name) {
                return Some(slot);
            }
            if !frame.is_helper() {
                break;
            }
        }
        None
    }

    /// The visibility context: the class scope of the nearest enclosing
    /// frame that is neither an Exception nor a Catch helper.
    pub fn visibility_scope(&self) -> Option<ClassId> {
        self.frames
            .iter()
            .rev()
            .find(|f| !f.is_helper())
            .and_then(|f| f.class_scope)
    }

    /// The `$this` of the nearest non-helper frame.
    pub fn current_this(&self) -> Option<Rc<RefCell<Instance>>> {
        self.frames
            .iter()
            .rev()
            .find(|f| !f.is_helper())
            .and_then(|f| f.this.clone())
    }

    /// Find a frame by serial.
    pub fn by_serial_mut(&mut self, serial: u64) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|f| f.serial == serial)
    }

    /// Find a frame by serial.
    pub fn by_serial(&self, serial: u64) -> Option<&Frame> {
        self.frames.iter().find(|f| f.serial == serial)
    }

    /// Remove the binding `name` from the frame with the given serial, when
    /// both still exist. Called by the reference table while breaking
    /// backrefs.
    pub fn unbind(&mut self, serial: u64, name: &str) {
        if let Some(frame) = self.by_serial_mut(serial) {
            frame.vars.remove(name);
        }
    }

    /// Walk ancestor frames of the active frame, skipping helpers, and
    /// resolve `name`: the `global`-statement lookup. Returns the slot and
    /// whether it was found (as opposed to needing creation in the global
    /// frame).
    pub fn uplink_source(&self, name: &str) -> Option<SlotId> {
        let active = self.active_index();
        for frame in self.frames[..active].iter().rev() {
            if frame.is_helper() {
                continue;
            }
            if let Some(slot) = frame.lookup(name) {
                return Some(slot);
            }
        }
        None
    }
}
