//! Program-image types: code blocks, declarations, and the auxiliary
//! descriptors referenced by instruction payloads.

use std::sync::Arc;

use crate::{Instr, Opcode};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A compile-time constant in a code block's literal pool.
pub enum Literal {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A real.
    Real(f64),
    /// A string.
    Str(Arc<str>),
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A bytecode vector with its literal pool.
///
/// The generator guarantees a trailing [`Opcode::Done`]; the VM's
/// make-ready step re-checks it along with jump-target bounds.
pub struct CodeBlock {
    /// The instruction vector.
    pub instrs: Vec<Instr>,
    /// Literals referenced by [`crate::P3::Literal`] payloads.
    pub literals: Vec<Literal>,
    /// Source path of the script this block was generated from, when known.
    pub file: Option<Arc<str>>,
}

impl CodeBlock {
    /// Create a code block from an instruction vector.
    pub fn new(instrs: Vec<Instr>) -> Self {
        Self {
            instrs,
            literals: Vec::new(),
            file: None,
        }
    }

    /// Attach a literal pool.
    pub fn with_literals(mut self, literals: Vec<Literal>) -> Self {
        self.literals = literals;
        self
    }

    /// Attach the source path.
    pub fn with_file(mut self, file: impl Into<Arc<str>>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Whether the block ends with a [`Opcode::Done`] instruction.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.instrs.last(),
            Some(Instr {
                op: Opcode::Done,
                ..
            })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A formal-argument type constraint.
pub enum TypeHint {
    /// Must coerce to bool.
    Bool,
    /// Must coerce to int.
    Int,
    /// Must coerce to real.
    Real,
    /// Must coerce to string.
    Str,
    /// Must be an array.
    Array,
    /// Must be an instance of the named class.
    Object,
}

impl TypeHint {
    /// The signature character this hint contributes (spec: one fixed
    /// character per type; object arguments append their class name at the
    /// call site).
    pub const fn signature_char(&self) -> char {
        match self {
            Self::Bool => 'b',
            Self::Int => 'i',
            Self::Real => 'f',
            Self::Str => 's',
            Self::Array => 'a',
            Self::Object => 'o',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A formal argument of a user function or method.
pub struct FormalArg {
    /// The parameter name, without the `$` sigil.
    pub name: Arc<str>,
    /// The declared type constraint, when any.
    pub hint: Option<TypeHint>,
    /// For object hints, the required class name.
    pub class: Option<Arc<str>>,
    /// Whether the argument binds by reference.
    pub by_ref: bool,
    /// Default-value bytecode, evaluated when the caller omits the argument
    /// or passes null.
    pub default: Option<Arc<CodeBlock>>,
}

impl FormalArg {
    /// A plain by-value argument without constraint or default.
    pub fn untyped(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            hint: None,
            class: None,
            by_ref: false,
            default: None,
        }
    }

    /// Attach a type constraint.
    pub fn with_hint(mut self, hint: TypeHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Constrain to instances of a class.
    pub fn with_class(mut self, class: impl Into<Arc<str>>) -> Self {
        self.hint = Some(TypeHint::Object);
        self.class = Some(class.into());
        self
    }

    /// Mark as binding by reference.
    pub fn by_ref(mut self) -> Self {
        self.by_ref = true;
        self
    }

    /// Attach default-value bytecode.
    pub fn with_default(mut self, default: Arc<CodeBlock>) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A `static` variable of a user function; its slot persists across calls.
pub struct StaticVar {
    /// The variable name.
    pub name: Arc<str>,
    /// The value the slot starts with.
    pub default: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A user-function declaration.
///
/// A second declaration under the same name does not overwrite the first;
/// the VM chains them into an overload set consulted at call time.
pub struct FunctionDecl {
    /// The function name.
    pub name: Arc<str>,
    /// The function body.
    pub code: Arc<CodeBlock>,
    /// Formal arguments in declaration order.
    pub args: Vec<FormalArg>,
    /// Names captured from the defining frame (closure `use` imports).
    pub captures: Vec<Arc<str>>,
    /// Static variables, persistent across calls.
    pub statics: Vec<StaticVar>,
}

impl FunctionDecl {
    /// Create a declaration without captures or statics.
    pub fn new(name: impl Into<Arc<str>>, args: Vec<FormalArg>, code: Arc<CodeBlock>) -> Self {
        Self {
            name: name.into(),
            code,
            args,
            captures: Vec::new(),
            statics: Vec::new(),
        }
    }

    /// Attach closure captures.
    pub fn with_captures(mut self, captures: Vec<Arc<str>>) -> Self {
        self.captures = captures;
        self
    }

    /// Attach static variables.
    pub fn with_statics(mut self, statics: Vec<StaticVar>) -> Self {
        self.statics = statics;
        self
    }

    /// The declared signature string used for overload dispatch: one
    /// character per constrained argument, object constraints contributing
    /// `o<class>;`. Unconstrained arguments contribute nothing, ending the
    /// comparable prefix.
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        for arg in &self.args {
            let Some(hint) = arg.hint else { break };
            sig.push(hint.signature_char());
            if let Some(class) = &arg.class {
                sig.push_str(class);
                sig.push(';');
            }
        }
        sig
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Member visibility.
pub enum Visibility {
    /// Accessible from anywhere.
    #[default]
    Public,
    /// Accessible from the declaring class and classes related by
    /// derivation.
    Protected,
    /// Accessible from the declaring class only.
    Private,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Method modifiers.
    pub struct MethodFlags: u8 {
        /// Callable without an instance.
        const STATIC = 0x01;
        /// Declared without a body; the class must be abstract.
        const ABSTRACT = 0x02;
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A method declaration.
pub struct MethodDecl {
    /// The method name.
    pub name: Arc<str>,
    /// The method body; empty for abstract methods.
    pub code: Arc<CodeBlock>,
    /// Formal arguments.
    pub args: Vec<FormalArg>,
    /// Visibility.
    pub visibility: Visibility,
    /// Modifiers.
    pub flags: MethodFlags,
}

impl MethodDecl {
    /// Create a public non-static method.
    pub fn new(name: impl Into<Arc<str>>, args: Vec<FormalArg>, code: Arc<CodeBlock>) -> Self {
        Self {
            name: name.into(),
            code,
            args,
            visibility: Visibility::Public,
            flags: MethodFlags::empty(),
        }
    }

    /// Set the visibility.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Set the modifiers.
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Attribute storage kind.
pub enum AttrKind {
    /// A class constant; immutable after declaration.
    Const,
    /// One shared slot across all instances; survives VM-wide.
    Static,
    /// One slot per instance.
    Instance,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// An attribute declaration.
pub struct AttrDecl {
    /// The attribute name.
    pub name: Arc<str>,
    /// Storage kind.
    pub kind: AttrKind,
    /// Visibility.
    pub visibility: Visibility,
    /// Initial value.
    pub default: Option<Literal>,
}

impl AttrDecl {
    /// Create a public attribute of the given kind.
    pub fn new(name: impl Into<Arc<str>>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            visibility: Visibility::Public,
            default: None,
        }
    }

    /// Set the visibility.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Set the initial value.
    pub fn with_default(mut self, default: Literal) -> Self {
        self.default = Some(default);
        self
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// Class modifiers.
    pub struct ClassFlags: u8 {
        /// The declaration is an interface.
        const INTERFACE = 0x01;
        /// The class cannot be instantiated directly.
        const ABSTRACT = 0x02;
        /// Instances may be thrown and caught.
        const THROWABLE = 0x04;
        /// Instances support index reads and writes through
        /// `offsetGet` / `offsetSet`.
        const ARRAY_ACCESS = 0x08;
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A class or interface declaration.
pub struct ClassDecl {
    /// The class name.
    pub name: Arc<str>,
    /// The base class, when any.
    pub base: Option<Arc<str>>,
    /// Implemented interfaces.
    pub interfaces: Vec<Arc<str>>,
    /// Attribute declarations.
    pub attrs: Vec<AttrDecl>,
    /// Method declarations.
    pub methods: Vec<MethodDecl>,
    /// Modifiers.
    pub flags: ClassFlags,
}

impl ClassDecl {
    /// Create an empty concrete class.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            base: None,
            interfaces: Vec::new(),
            attrs: Vec::new(),
            methods: Vec::new(),
            flags: ClassFlags::empty(),
        }
    }

    /// Set the base class.
    pub fn extends(mut self, base: impl Into<Arc<str>>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Add an implemented interface.
    pub fn implements(mut self, interface: impl Into<Arc<str>>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Add an attribute.
    pub fn attr(mut self, attr: AttrDecl) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Add a method.
    pub fn method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    /// Set the modifiers.
    pub fn with_flags(mut self, flags: ClassFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// One arm of a switch table.
pub struct SwitchCase {
    /// Bytecode of the case expression, compared loose-equal against the
    /// switched value.
    pub code: Arc<CodeBlock>,
    /// Absolute index of the case body's first instruction.
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A switch dispatch table.
pub struct SwitchTable {
    /// Cases in source order.
    pub cases: Vec<SwitchCase>,
    /// Target of the `default` arm, when present.
    pub default_target: Option<u32>,
    /// Target of the first instruction after the switch.
    pub exit_target: u32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A foreach loop descriptor.
pub struct ForeachDesc {
    /// Variable receiving each key, when the loop binds one.
    pub key_var: Option<Arc<str>>,
    /// Variable receiving each value.
    pub value_var: Arc<str>,
    /// Whether the value variable aliases the element slot instead of
    /// copying.
    pub by_ref: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Everything the code generator hands the VM at make-ready: the main
/// instruction vector plus the function and class tables. Every constant,
/// function, class, and descriptor referenced by an instruction payload is
/// registered here before execution.
pub struct ProgramImage {
    /// The global code block, ending in `Done`.
    pub main: Arc<CodeBlock>,
    /// Function declarations, in declaration order (overloads chain in
    /// this order).
    pub functions: Vec<Arc<FunctionDecl>>,
    /// Class declarations, base classes before derived ones.
    pub classes: Vec<Arc<ClassDecl>>,
}

impl ProgramImage {
    /// An image holding only a main block.
    pub fn new(main: Arc<CodeBlock>) -> Self {
        Self {
            main,
            ..Self::default()
        }
    }

    /// Attach function declarations.
    pub fn with_functions(mut self, functions: Vec<Arc<FunctionDecl>>) -> Self {
        self.functions = functions;
        self
    }

    /// Attach class declarations.
    pub fn with_classes(mut self, classes: Vec<Arc<ClassDecl>>) -> Self {
        self.classes = classes;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// One catch clause of an exception block.
pub struct CatchClause {
    /// The caught class or interface name.
    pub class_name: Arc<str>,
    /// The variable the exception binds to inside the handler.
    pub var_name: Arc<str>,
    /// Absolute index of the handler's first instruction.
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// The descriptor pushed by `LoadException` for one try region.
pub struct ExceptionBlock {
    /// Catch clauses in source order; the first matching clause wins.
    pub catches: Vec<CatchClause>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec![], "")]
    #[case(vec![FormalArg::untyped("x").with_hint(TypeHint::Int)], "i")]
    #[case(
        vec![
            FormalArg::untyped("x").with_hint(TypeHint::Int),
            FormalArg::untyped("y").with_hint(TypeHint::Str),
        ],
        "is"
    )]
    #[case(
        vec![
            FormalArg::untyped("x").with_class("Point"),
            FormalArg::untyped("y").with_hint(TypeHint::Real),
        ],
        "oPoint;f"
    )]
    #[case(
        vec![
            FormalArg::untyped("x").with_hint(TypeHint::Int),
            FormalArg::untyped("y"),
            FormalArg::untyped("z").with_hint(TypeHint::Str),
        ],
        "i"
    )]
    fn signature_assembly(#[case] args: Vec<FormalArg>, #[case] expected: &str) {
        let decl = FunctionDecl::new("f", args, Arc::new(CodeBlock::default()));
        assert_eq!(decl.signature(), expected);
    }
}
