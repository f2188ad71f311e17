//! Class, interface, and instance metadata.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use phlox_asm::{
    AttrKind, ClassDecl, ClassFlags, CodeBlock, FormalArg, MethodFlags, Visibility,
};

use crate::error::ImageError;
use crate::reftable::{RefTable, SlotId};
use crate::value::Value;

/// Magic method invoked on instantiation.
pub const CONSTRUCT: &str = "__construct";
/// Magic method invoked on `Clone`.
pub const CLONE: &str = "__clone";
/// Magic attribute-read hook.
pub const MAGIC_GET: &str = "__get";
/// Magic attribute-write hook.
pub const MAGIC_SET: &str = "__set";
/// Magic call hook for object callees.
pub const INVOKE: &str = "__invoke";
/// Magic string-coercion hook.
pub const TO_STRING: &str = "__toString";
/// Element-read hook of array-access classes.
pub const OFFSET_GET: &str = "offsetGet";
/// Element-write hook of array-access classes.
pub const OFFSET_SET: &str = "offsetSet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A registered class's identifier.
pub struct ClassId(u32);

impl ClassId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
/// A resolved method.
pub struct Method {
    /// The method name.
    pub name: Arc<str>,
    /// The method body.
    pub code: Arc<CodeBlock>,
    /// Formal arguments.
    pub args: Vec<FormalArg>,
    /// Declared visibility.
    pub visibility: Visibility,
    /// Modifiers.
    pub flags: MethodFlags,
    /// The class that declared the method; decides private visibility.
    pub owner: ClassId,
}

#[derive(Debug, Clone)]
/// An instance-attribute declaration, carried per class.
pub struct AttrInfo {
    /// The attribute name.
    pub name: Arc<str>,
    /// Declared visibility.
    pub visibility: Visibility,
    /// Initial value.
    pub default: Value,
}

#[derive(Debug)]
/// A registered class.
pub struct Class {
    name: Arc<str>,
    base: Option<ClassId>,
    interfaces: Vec<ClassId>,
    consts: HashMap<Arc<str>, Value>,
    statics: HashMap<Arc<str>, (SlotId, Visibility)>,
    attrs: Vec<AttrInfo>,
    methods: HashMap<Arc<str>, Method>,
    derived: Vec<ClassId>,
    flags: ClassFlags,
}

impl Class {
    /// The class name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// The effective modifier bits, inherited markers included.
    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// The base class.
    pub fn base(&self) -> Option<ClassId> {
        self.base
    }

    /// Classes deriving directly from this one.
    pub fn derived(&self) -> &[ClassId] {
        &self.derived
    }

    /// The class constant `name`, declared on this class itself.
    pub fn own_const(&self, name: &str) -> Option<&Value> {
        self.consts.get(name)
    }

    /// The static attribute `name`, declared on this class itself.
    pub fn own_static(&self, name: &str) -> Option<(SlotId, Visibility)> {
        self.statics.get(name).copied()
    }

    /// The method `name`, declared on this class itself.
    pub fn own_method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Instance-attribute declarations of this class itself.
    pub fn own_attrs(&self) -> &[AttrInfo] {
        &self.attrs
    }
}

#[derive(Debug, Default)]
/// The class registry.
pub struct ClassRegistry {
    classes: Vec<Class>,
    by_name: HashMap<Arc<str>, ClassId>,
}

impl ClassRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. Base classes and interfaces must already be
    /// registered; static and constant attributes receive their pinned
    /// slots here.
    pub fn register(
        &mut self,
        decl: &ClassDecl,
        rt: &mut RefTable,
    ) -> Result<ClassId, ImageError> {
        if self.by_name.contains_key(&decl.name) {
            return Err(ImageError::DuplicateClass(decl.name.to_string()));
        }
        let resolve = |name: &Arc<str>| -> Result<ClassId, ImageError> {
            self.by_name
                .get(name)
                .copied()
                .ok_or_else(|| ImageError::UnknownClassRef {
                    class: decl.name.to_string(),
                    name: name.to_string(),
                })
        };
        let base = decl.base.as_ref().map(&resolve).transpose()?;
        let interfaces = decl
            .interfaces
            .iter()
            .map(&resolve)
            .collect::<Result<Vec<_>, _>>()?;

        // Throwable and ArrayAccess markers propagate down the hierarchy.
        let mut flags = decl.flags;
        let inherited = ClassFlags::THROWABLE | ClassFlags::ARRAY_ACCESS;
        if let Some(base) = base {
            flags |= self.get(base).flags & inherited;
        }
        for interface in &interfaces {
            flags |= self.get(*interface).flags & inherited;
        }

        let id = ClassId(self.classes.len() as u32);

        let mut consts = HashMap::new();
        let mut statics = HashMap::new();
        let mut attrs = Vec::new();
        for attr in &decl.attrs {
            let default = attr
                .default
                .as_ref()
                .map(Value::from_literal)
                .unwrap_or_else(Value::null);
            match attr.kind {
                AttrKind::Const => {
                    consts.insert(attr.name.clone(), default);
                }
                AttrKind::Static => {
                    let slot = rt.reserve();
                    rt.store(slot, &default);
                    rt.pin(slot);
                    statics.insert(attr.name.clone(), (slot, attr.visibility));
                }
                AttrKind::Instance => attrs.push(AttrInfo {
                    name: attr.name.clone(),
                    visibility: attr.visibility,
                    default,
                }),
            }
        }

        let methods = decl
            .methods
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    Method {
                        name: m.name.clone(),
                        code: m.code.clone(),
                        args: m.args.clone(),
                        visibility: m.visibility,
                        flags: m.flags,
                        owner: id,
                    },
                )
            })
            .collect();

        self.classes.push(Class {
            name: decl.name.clone(),
            base,
            interfaces,
            consts,
            statics,
            attrs,
            methods,
            derived: Vec::new(),
            flags,
        });
        self.by_name.insert(decl.name.clone(), id);
        if let Some(base) = base {
            self.classes[base.index()].derived.push(id);
        }
        Ok(id)
    }

    /// The class with the given id.
    pub fn get(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    /// Resolve a class by name, case-sensitively.
    pub fn resolve(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Walk the inheritance chain for a method.
    pub fn method(&self, id: ClassId, name: &str) -> Option<&Method> {
        let mut current = Some(id);
        while let Some(class_id) = current {
            let class = self.get(class_id);
            if let Some(method) = class.own_method(name) {
                return Some(method);
            }
            current = class.base;
        }
        None
    }

    /// Walk the inheritance chain for a static attribute.
    pub fn static_attr(&self, id: ClassId, name: &str) -> Option<(SlotId, Visibility, ClassId)> {
        let mut current = Some(id);
        while let Some(class_id) = current {
            let class = self.get(class_id);
            if let Some((slot, visibility)) = class.own_static(name) {
                return Some((slot, visibility, class_id));
            }
            current = class.base;
        }
        None
    }

    /// Walk the inheritance chain for a class constant.
    pub fn const_attr(&self, id: ClassId, name: &str) -> Option<&Value> {
        let mut current = Some(id);
        while let Some(class_id) = current {
            let class = self.get(class_id);
            if let Some(value) = class.own_const(name) {
                return Some(value);
            }
            current = class.base;
        }
        None
    }

    /// Instance-attribute declarations of the whole chain, base-first so
    /// derived declarations shadow.
    pub fn instance_attrs(&self, id: ClassId) -> Vec<AttrInfo> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(class_id) = current {
            chain.push(class_id);
            current = self.get(class_id).base;
        }
        let mut attrs: Vec<AttrInfo> = Vec::new();
        for class_id in chain.into_iter().rev() {
            for attr in &self.get(class_id).attrs {
                match attrs.iter_mut().find(|a| a.name == attr.name) {
                    Some(existing) => *existing = attr.clone(),
                    None => attrs.push(attr.clone()),
                }
            }
        }
        attrs
    }

    /// Whether `id` is `target`, derives from it, or implements it.
    pub fn is_instance_of(&self, id: ClassId, target: ClassId) -> bool {
        if id == target {
            return true;
        }
        let class = self.get(id);
        if let Some(base) = class.base {
            if self.is_instance_of(base, target) {
                return true;
            }
        }
        class
            .interfaces
            .iter()
            .any(|i| self.is_instance_of(*i, target))
    }

    /// Whether one class derives from the other, in either direction.
    pub fn related(&self, a: ClassId, b: ClassId) -> bool {
        self.is_instance_of(a, b) || self.is_instance_of(b, a)
    }

    /// The visibility rule: public always; private requires the identical
    /// class; protected requires derivation (either direction) or identity.
    pub fn can_access(
        &self,
        visibility: Visibility,
        owner: ClassId,
        context: Option<ClassId>,
    ) -> bool {
        match visibility {
            Visibility::Public => true,
            Visibility::Private => context == Some(owner),
            Visibility::Protected => context.is_some_and(|ctx| self.related(ctx, owner)),
        }
    }

    /// Allocate an instance: one fresh slot per instance attribute,
    /// initialized from the declarations of the whole chain.
    pub fn instantiate(&self, id: ClassId, rt: &mut RefTable) -> Rc<RefCell<Instance>> {
        let mut attrs = IndexMap::new();
        for attr in self.instance_attrs(id) {
            let slot = rt.reserve();
            rt.store(slot, &attr.default);
            attrs.insert(attr.name.clone(), slot);
        }
        Rc::new(RefCell::new(Instance { class: id, attrs }))
    }
}

#[derive(Debug)]
/// One object instance. The reference count is the `Rc` holding it;
/// attribute slots die with the instance unless something else aliases
/// them.
pub struct Instance {
    class: ClassId,
    attrs: IndexMap<Arc<str>, SlotId>,
}

impl Instance {
    /// The instance's class.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// The slot of an attribute.
    pub fn attr_slot(&self, name: &str) -> Option<SlotId> {
        self.attrs.get(name).copied()
    }

    /// Bind an attribute to a slot (auto-vivification and `__set`-less
    /// dynamic attributes).
    pub fn bind_attr(&mut self, name: Arc<str>, slot: SlotId) {
        self.attrs.insert(name, slot);
    }

    /// Attributes in declaration order.
    pub fn attrs(&self) -> impl Iterator<Item = (&Arc<str>, &SlotId)> {
        self.attrs.iter()
    }

    /// Number of attributes.
    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }
}
