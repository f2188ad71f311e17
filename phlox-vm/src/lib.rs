//! Phlox VM implementation.
//!
//! A stack-based bytecode interpreter for a dynamically typed, PHP-like
//! scripting language: activation frames, exception unwinding, closures,
//! class-method dispatch, and a slot-indexed reference table implementing
//! aliasing across scalars, arrays, and objects.
//!
//! The lexer, parser, and code generator live outside this crate; they
//! speak to the VM through the [`phlox_asm`] program-image types and the
//! configuration verbs on [`interpreter::Vm`].

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod array;
pub mod class;
pub mod consts;
pub mod error;
pub mod frame;
pub mod function;
pub mod interpreter;
pub mod output;
pub mod reftable;
pub mod state;
pub mod value;

#[cfg(test)]
mod tests;

#[doc(no_inline)]
pub use phlox_asm;

pub mod prelude {
    //! Required implementations for full functionality.

    #[doc(no_inline)]
    pub use phlox_asm::{
        ClassDecl, ClassFlags, CodeBlock, ExceptionBlock, Fault, ForeachDesc, FormalArg,
        FunctionDecl, Instr, Literal, MethodDecl, Opcode, ProgramImage, Severity, SwitchTable,
        TypeHint, Visibility, P3,
    };

    pub use crate::{
        array::{ArrayKey, Hashmap},
        class::{Class, ClassId, ClassRegistry, Instance},
        error::{ImageError, VmError},
        frame::{Frame, FrameFlags, FrameStack},
        function::{FfiStatus, ForeignImpl, FunctionId, FunctionRegistry},
        interpreter::{host::CallContext, host::HostOutcome, Vm, VmParams},
        output::{Consumer, ConsumerStatus, Diagnostic, MemoryConsumer, StreamDevice},
        reftable::{RefTable, SlotId},
        state::{ExecuteState, ProgramState},
        value::{Rep, Tag, Value},
    };
}
