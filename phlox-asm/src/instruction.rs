use std::sync::Arc;

use crate::{
    program::{ClassDecl, ExceptionBlock, ForeachDesc, FunctionDecl, SwitchTable},
    Opcode,
};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// One dispatch unit: an opcode plus its three operands.
///
/// `p1` is a small signed scalar (a count, a flag, a pre/post selector),
/// `p2` is an absolute jump target or a count, and `p3` is a typed payload
/// replacing the source design's opaque auxiliary pointer.
pub struct Instr {
    /// The opcode.
    pub op: Opcode,
    /// Signed scalar operand.
    pub p1: i32,
    /// Jump target or count operand.
    pub p2: u32,
    /// Typed auxiliary payload.
    pub p3: P3,
}

impl Instr {
    /// Create an instruction with zeroed operands.
    pub const fn new(op: Opcode) -> Self {
        Self {
            op,
            p1: 0,
            p2: 0,
            p3: P3::None,
        }
    }

    /// Set the `p1` operand.
    pub const fn p1(mut self, p1: i32) -> Self {
        self.p1 = p1;
        self
    }

    /// Set the `p2` operand.
    pub const fn p2(mut self, p2: u32) -> Self {
        self.p2 = p2;
        self
    }

    /// Set the `p3` payload.
    pub fn p3(mut self, p3: P3) -> Self {
        self.p3 = p3;
        self
    }

    /// Set a name payload.
    pub fn name(self, name: impl Into<Arc<str>>) -> Self {
        self.p3(P3::Name(name.into()))
    }

    /// Set a literal-pool payload.
    pub fn literal(self, index: usize) -> Self {
        self.p3(P3::Literal(index))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Typed `p3` payload.
///
/// The code generator registers every declaration and descriptor it
/// references here before handing the image to the VM; make-ready only has
/// to validate reachability, never existence.
pub enum P3 {
    /// No payload.
    #[default]
    None,
    /// A variable, constant, or member name.
    Name(Arc<str>),
    /// An index into the enclosing code block's literal pool.
    Literal(usize),
    /// A function declaration (closure templates).
    Function(Arc<FunctionDecl>),
    /// A class declaration.
    Class(Arc<ClassDecl>),
    /// An exception-block descriptor for a try region.
    Exception(Arc<ExceptionBlock>),
    /// A switch table.
    Switch(Arc<SwitchTable>),
    /// A foreach descriptor.
    Foreach(Arc<ForeachDesc>),
}

impl P3 {
    /// The payload's name, when it is a [`P3::Name`].
    pub fn as_name(&self) -> Option<&Arc<str>> {
        match self {
            Self::Name(name) => Some(name),
            _ => None,
        }
    }
}
