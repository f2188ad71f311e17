//! The reference table: an indexed pool of value slots plus the alias
//! graph that implements `&`-style aliasing across scalars, arrays, and
//! objects.
//!
//! Slot indices decouple identity from storage address: the backing vector
//! may relocate freely, and cyclic alias graphs (arrays of references,
//! `$GLOBALS` pointing back at itself) reduce to bookkeeping on unset and
//! release instead of a pointer graph.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::array::{ArrayKey, Hashmap};
use crate::frame::FrameStack;
use crate::value::{Aux, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A stable index into the reference table.
pub struct SlotId(u32);

impl SlotId {
    /// The sentinel marking a value as non-addressable for aliasing.
    pub const INVALID: SlotId = SlotId(u32::MAX);

    /// Wrap a raw index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw index.
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Whether this is a real slot rather than the sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "slot#{}", self.0)
        } else {
            write!(f, "slot#-")
        }
    }
}

#[derive(Debug, Clone)]
/// A variable-name binding that aliases a slot.
pub struct NameRef {
    /// Serial of the frame holding the binding.
    pub frame: u64,
    /// The variable name.
    pub name: Arc<str>,
}

#[derive(Debug, Clone)]
/// An array node that aliases a slot.
pub struct NodeRef {
    /// The map holding the node. Weak: a map dropped wholesale leaves a
    /// dead backref that is skipped when encountered.
    pub map: Weak<RefCell<Hashmap>>,
    /// The node's key.
    pub key: ArrayKey,
}

#[derive(Debug, Default)]
/// Every live binding that aliases one slot.
pub struct AliasSet {
    /// Variable-name backrefs.
    pub names: Vec<NameRef>,
    /// Array-node backrefs.
    pub nodes: Vec<NodeRef>,
    /// When set, the slot survives the loss of its last backref (static
    /// attributes, superglobals).
    pub pinned: bool,
}

impl AliasSet {
    /// Number of live backrefs.
    pub fn backref_count(&self) -> usize {
        self.names.len() + self.nodes.len()
    }

    fn is_empty(&self) -> bool {
        self.names.is_empty() && self.nodes.is_empty()
    }
}

#[derive(Default)]
/// The slot pool and alias index.
pub struct RefTable {
    slots: Vec<Value>,
    free: Vec<SlotId>,
    aliases: HashMap<u32, AliasSet>,
    reserved_total: u64,
    null: Value,
}

impl RefTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot, recycling the free list first.
    pub fn reserve(&mut self) -> SlotId {
        self.reserved_total += 1;
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        let slot = SlotId::new(self.slots.len() as u32);
        let mut value = Value::null();
        value.slot = slot;
        self.slots.push(value);
        slot
    }

    /// Read a slot. The sentinel and freed slots read as null.
    pub fn value(&self, slot: SlotId) -> &Value {
        self.slots.get(slot.index() as usize).unwrap_or(&self.null)
    }

    /// Write access to a slot. The sentinel degrades to a scratch cell.
    pub fn value_mut(&mut self, slot: SlotId) -> &mut Value {
        let index = slot.index() as usize;
        if index < self.slots.len() {
            &mut self.slots[index]
        } else {
            self.null.clear();
            &mut self.null
        }
    }

    /// Deep-assign `src` into the slot.
    pub fn store(&mut self, slot: SlotId, src: &Value) {
        let old = self.value(slot).clone();
        self.value_mut(slot).assign(src);
        self.release_payload(old);
    }

    // --- alias bookkeeping ------------------------------------------------

    /// Record a variable-name backref.
    pub fn install_name_ref(&mut self, slot: SlotId, frame: u64, name: Arc<str>) {
        if !slot.is_valid() {
            return;
        }
        let set = self.aliases.entry(slot.index()).or_default();
        set.names.push(NameRef { frame, name });
    }

    /// Record an array-node backref.
    pub fn install_node_ref(&mut self, slot: SlotId, map: &Rc<RefCell<Hashmap>>, key: ArrayKey) {
        if !slot.is_valid() {
            return;
        }
        let set = self.aliases.entry(slot.index()).or_default();
        set.nodes.push(NodeRef {
            map: Rc::downgrade(map),
            key,
        });
    }

    /// Remove the matching variable-name backref. Freeing the last backref
    /// returns the slot to the free list unless it is pinned.
    pub fn remove_name_ref(&mut self, slot: SlotId, frame: u64, name: &str) {
        if let Some(set) = self.aliases.get_mut(&slot.index()) {
            if let Some(pos) = set
                .names
                .iter()
                .position(|r| r.frame == frame && &*r.name == name)
            {
                set.names.remove(pos);
            }
        }
        self.maybe_free(slot);
    }

    /// Remove the matching array-node backref, freeing as for
    /// [`RefTable::remove_name_ref`].
    pub fn remove_node_ref(&mut self, slot: SlotId, map: &Rc<RefCell<Hashmap>>, key: &ArrayKey) {
        if let Some(set) = self.aliases.get_mut(&slot.index()) {
            if let Some(pos) = set.nodes.iter().position(|r| {
                r.key == *key && r.map.upgrade().is_some_and(|m| Rc::ptr_eq(&m, map))
            }) {
                set.nodes.remove(pos);
            }
        }
        self.maybe_free(slot);
    }

    /// Pin the slot so it survives the loss of its last backref.
    pub fn pin(&mut self, slot: SlotId) {
        if slot.is_valid() {
            self.aliases.entry(slot.index()).or_default().pinned = true;
        }
    }

    /// Whether the slot is pinned.
    pub fn is_pinned(&self, slot: SlotId) -> bool {
        self.aliases
            .get(&slot.index())
            .is_some_and(|set| set.pinned)
    }

    /// The slot's alias record, when it has one.
    pub fn extract(&self, slot: SlotId) -> Option<&AliasSet> {
        self.aliases.get(&slot.index())
    }

    /// Number of live backrefs of the slot.
    pub fn backref_count(&self, slot: SlotId) -> usize {
        self.aliases
            .get(&slot.index())
            .map(AliasSet::backref_count)
            .unwrap_or(0)
    }

    // --- release ----------------------------------------------------------

    /// The unset path: break every backref of the slot (every
    /// variable-binding hash entry and every array node pointing at it is
    /// unlinked), then return the slot to the free list unless it is pinned
    /// and `force` is unset.
    pub fn release(&mut self, slot: SlotId, force: bool, frames: &mut FrameStack) {
        if !slot.is_valid() {
            return;
        }
        let Some(set) = self.aliases.remove(&slot.index()) else {
            self.free_slot(slot);
            return;
        };
        for name_ref in &set.names {
            frames.unbind(name_ref.frame, &name_ref.name);
        }
        for node_ref in &set.nodes {
            if let Some(map) = node_ref.map.upgrade() {
                map.borrow_mut().remove(&node_ref.key);
            }
        }
        if set.pinned && !force {
            // Keep the slot alive but pinned-only.
            self.aliases.insert(
                slot.index(),
                AliasSet {
                    pinned: true,
                    ..AliasSet::default()
                },
            );
            return;
        }
        self.free_slot(slot);
    }

    /// Free the slot when its last backref is gone and it is not pinned.
    fn maybe_free(&mut self, slot: SlotId) {
        if !slot.is_valid() {
            return;
        }
        match self.aliases.get(&slot.index()) {
            Some(set) if set.pinned || !set.is_empty() => return,
            Some(_) => {
                self.aliases.remove(&slot.index());
            }
            None => {}
        }
        self.free_slot(slot);
    }

    fn free_slot(&mut self, slot: SlotId) {
        let index = slot.index() as usize;
        if index >= self.slots.len() {
            return;
        }
        if self.free.contains(&slot) {
            return;
        }
        let old = std::mem::take(&mut self.slots[index]);
        self.slots[index].slot = slot;
        self.free.push(slot);
        self.release_payload(old);
    }

    /// Tear down an aggregate payload that is about to lose its last
    /// holder: every entry slot loses this container's node backref, which
    /// cascades into frees for entries nothing else aliases.
    pub fn release_payload(&mut self, value: Value) {
        match value.aux() {
            Aux::Array(map) => {
                if Rc::strong_count(map) != 1 {
                    return;
                }
                let entries: Vec<(ArrayKey, SlotId)> = map
                    .borrow()
                    .iter()
                    .map(|(k, s)| (k.clone(), *s))
                    .collect();
                for (key, slot) in entries {
                    self.remove_node_ref(slot, map, &key);
                }
            }
            Aux::Object(instance) => {
                if Rc::strong_count(instance) != 1 {
                    return;
                }
                let slots: Vec<SlotId> =
                    instance.borrow().attrs().map(|(_, s)| *s).collect();
                for slot in slots {
                    self.free_unreferenced(slot);
                }
            }
            Aux::None => {}
        }
    }

    /// Free a slot that holds no backrefs and no pin: anonymous argument
    /// slots and instance attributes, whose owner is a structure rather
    /// than a binding.
    pub(crate) fn free_unreferenced(&mut self, slot: SlotId) {
        if !slot.is_valid() {
            return;
        }
        if self.backref_count(slot) == 0 && !self.is_pinned(slot) {
            self.aliases.remove(&slot.index());
            self.free_slot(slot);
        }
    }

    // --- accounting -------------------------------------------------------

    /// Slots reserved over the table's lifetime.
    pub fn reserved_total(&self) -> u64 {
        self.reserved_total
    }

    /// Currently allocated (not free-listed) slots.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Free-listed slots.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

impl fmt::Debug for RefTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefTable")
            .field("slots", &self.slots.len())
            .field("free", &self.free.len())
            .field("aliased", &self.aliases.len())
            .finish()
    }
}
