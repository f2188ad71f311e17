//! VM-wide constants.

/// Extra operand-stack headroom beyond the program length.
pub const STACK_GUARD: usize = 8;

/// Default ceiling for nested user-function calls.
pub const DEFAULT_RECURSION_LIMIT: usize = 32;

/// Operand-stack size of a host-call scratch stack beyond the argument
/// count (the callee name and one guard cell).
pub const HOST_STACK_GUARD: usize = 2;

/// Script path reported in diagnostics when no file was attached to the
/// executing code block.
pub const MAIN_SCRIPT: &str = "[main]";

/// The names the superglobal-creation verb accepts.
pub const SUPERGLOBALS: &[&str] = &[
    "GLOBALS", "_SERVER", "_GET", "_POST", "_COOKIE", "_SESSION", "_ENV", "_HEADER", "argv",
];
