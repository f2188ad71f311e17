//! Instruction set and program-image types of the Phlox VM.
//!
//! Everything that crosses the code-generator → VM boundary is defined in
//! this crate: the opcode enumeration, the instruction record, code blocks
//! with their literal pools, function and class declarations, the auxiliary
//! descriptors referenced by instruction payloads, and the recoverable fault
//! reasons the VM reports back.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod fault;
mod instruction;
mod opcode;
mod program;

pub use fault::{Fault, Severity};
pub use instruction::{Instr, P3};
pub use opcode::Opcode;
pub use program::{
    AttrDecl, AttrKind, CatchClause, ClassDecl, ClassFlags, CodeBlock, ExceptionBlock,
    ForeachDesc, FormalArg, FunctionDecl, Literal, MethodDecl, MethodFlags, ProgramImage,
    StaticVar, SwitchCase, SwitchTable, TypeHint, Visibility,
};
