//! Runtime interpreter error implementation.

use phlox_asm::Fault;

/// Fatal interpreter error variants.
///
/// Recoverable conditions never surface here: they are diagnosed through
/// the output consumer as [`Fault`]s and execution continues with a
/// substitute value. `VmError` is reserved for conditions that terminate
/// the dispatch.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The program image failed make-ready validation.
    #[error("program image rejected: {0}")]
    InvalidImage(ImageError),
    /// The output consumer requested an abort; operands have been cleaned
    /// up.
    #[error("output consumer aborted execution")]
    ConsumerAbort,
    /// An exception reached the outermost dispatcher with no handler and no
    /// installed uncaught-exception callback.
    #[error("uncaught exception: {0}")]
    UncaughtException(String),
    /// No program image was made ready before execution.
    #[error("no program image is ready")]
    NotReady,
    /// An internal invariant was violated. Always a bug in the VM or the
    /// code generator, never in user code.
    #[error("vm invariant violated: {0}")]
    Bug(&'static str),
}

/// Make-ready validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// A code block does not end with `Done`.
    #[error("code block is not terminated by Done")]
    MissingDone,
    /// A jump target points outside its code block.
    #[error("jump target {target} out of bounds at instruction {at}")]
    JumpOutOfBounds {
        /// Offending instruction index.
        at: usize,
        /// The out-of-range target.
        target: u32,
    },
    /// A literal payload indexes past the block's literal pool.
    #[error("literal index {index} out of bounds at instruction {at}")]
    LiteralOutOfBounds {
        /// Offending instruction index.
        at: usize,
        /// The out-of-range pool index.
        index: usize,
    },
    /// A class declaration names an unregistered base or interface.
    #[error("class {class} references unknown name {name}")]
    UnknownClassRef {
        /// The declaring class.
        class: String,
        /// The unresolved base or interface name.
        name: String,
    },
    /// A class was declared twice.
    #[error("duplicate class {0}")]
    DuplicateClass(String),
}

impl From<ImageError> for VmError {
    fn from(err: ImageError) -> Self {
        Self::InvalidImage(err)
    }
}

/// Result of an operation that can only fail with a recoverable fault.
pub type FaultResult<T> = Result<T, Fault>;
