//! Shared assembly helpers for the scenario tests: tiny programs built
//! instruction-by-instruction, executed against a buffering consumer.

use std::sync::Arc;

use phlox_asm::{CodeBlock, Instr, Opcode, ProgramImage};

use crate::interpreter::Vm;
use crate::output::MemoryConsumer;
use crate::state::ProgramState;

pub(crate) fn op(opcode: Opcode) -> Instr {
    Instr::new(opcode)
}

pub(crate) struct Executed {
    pub vm: Vm,
    pub out: MemoryConsumer,
    pub state: ProgramState,
}

impl Executed {
    pub fn text(&self) -> String {
        self.out.text()
    }
}

/// Make a fresh VM ready with the image and run it to completion.
pub(crate) fn run_image(image: ProgramImage) -> Executed {
    let mut vm = Vm::new();
    let out = MemoryConsumer::new();
    vm.set_consumer(Box::new(out.clone()));
    vm.make_ready(image).expect("image rejected");
    let state = vm.exec().expect("execution failed");
    Executed { vm, out, state }
}

/// Run a bare main block.
pub(crate) fn run_main(code: CodeBlock) -> Executed {
    run_image(ProgramImage::new(Arc::new(code)))
}
