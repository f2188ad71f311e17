//! User-function, foreign-function, and built-in-constant registries.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use phlox_asm::FunctionDecl;

use crate::interpreter::host::CallContext;
use crate::reftable::SlotId;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A registered user function's identifier.
pub struct FunctionId(u32);

impl FunctionId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
/// A registered user function: the declaration plus the runtime state that
/// survives across calls.
pub struct UserFunction {
    /// The declaration.
    pub decl: Arc<FunctionDecl>,
    /// The declared signature string, precomputed for overload dispatch.
    pub signature: String,
    /// Static-variable slots, created pinned on first call.
    pub statics: HashMap<Arc<str>, SlotId>,
    /// Captured values of a closure instance, in declaration order.
    pub captures: Vec<(Arc<str>, Value)>,
    /// The next older function of the same name.
    pub next: Option<FunctionId>,
}

/// Status returned by a foreign-function implementation. The distinguished
/// [`FfiStatus::Abort`] value halts the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiStatus {
    /// Normal completion; the call context's result is pushed.
    Ok,
    /// Halt the VM.
    Abort,
}

/// A foreign-function implementation. It must not retain argument values
/// past its return.
pub type ForeignImpl = Rc<dyn Fn(&mut CallContext<'_>) -> FfiStatus>;

#[derive(Clone)]
/// A registered foreign (host) function.
pub struct ForeignFunction {
    /// The registered name; resolution is case-sensitive.
    pub name: Arc<str>,
    /// The implementation.
    pub imp: ForeignImpl,
    /// Opaque registration data handed back through the call context.
    pub user_data: Rc<dyn Any>,
}

impl std::fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Default)]
/// The function registry.
pub struct FunctionRegistry {
    funcs: Vec<UserFunction>,
    heads: HashMap<Arc<str>, FunctionId>,
    foreign: HashMap<Arc<str>, ForeignFunction>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user function. A same-name function is prepended to the
    /// existing chain, forming an overload set.
    pub fn register(&mut self, decl: Arc<FunctionDecl>) -> FunctionId {
        self.register_with_captures(decl, Vec::new())
    }

    /// Register a closure instance with its captured environment.
    pub fn register_with_captures(
        &mut self,
        decl: Arc<FunctionDecl>,
        captures: Vec<(Arc<str>, Value)>,
    ) -> FunctionId {
        let id = FunctionId(self.funcs.len() as u32);
        let next = self.heads.get(&decl.name).copied();
        self.funcs.push(UserFunction {
            signature: decl.signature(),
            statics: HashMap::new(),
            captures,
            next,
            decl: decl.clone(),
        });
        self.heads.insert(decl.name.clone(), id);
        id
    }

    /// The newest function registered under `name`.
    pub fn head(&self, name: &str) -> Option<FunctionId> {
        self.heads.get(name).copied()
    }

    /// The function with the given id.
    pub fn get(&self, id: FunctionId) -> &UserFunction {
        &self.funcs[id.index()]
    }

    /// The function with the given id, mutably.
    pub fn get_mut(&mut self, id: FunctionId) -> &mut UserFunction {
        &mut self.funcs[id.index()]
    }

    /// Walk a same-name chain, newest first.
    fn chain(&self, head: FunctionId) -> Vec<FunctionId> {
        let mut ids = Vec::new();
        let mut current = Some(head);
        while let Some(id) = current {
            ids.push(id);
            current = self.get(id).next;
        }
        ids
    }

    /// Overload selection: drop arity mismatches, then pick the declared
    /// signature sharing the longest common prefix with the call-site
    /// signature. Ties break to the earliest-registered candidate.
    pub fn select_overload(&self, name: &str, call_sig: &str, argc: usize) -> Option<FunctionId> {
        let head = self.head(name)?;
        let chain = self.chain(head);
        if chain.len() == 1 {
            return Some(head);
        }

        let exact: Vec<FunctionId> = chain
            .iter()
            .copied()
            .filter(|id| self.get(*id).decl.args.len() == argc)
            .collect();
        let candidates = if exact.is_empty() {
            // No candidate of matching arity: accept those whose missing
            // trailing arguments can default.
            let defaulting: Vec<FunctionId> = chain
                .iter()
                .copied()
                .filter(|id| self.get(*id).decl.args.len() >= argc)
                .collect();
            if defaulting.is_empty() {
                chain
            } else {
                defaulting
            }
        } else {
            exact
        };

        // The chain is newest-first; iterate oldest-first so that ties go
        // to the earliest-registered candidate.
        let mut best: Option<(usize, FunctionId)> = None;
        for id in candidates.into_iter().rev() {
            let lcp = common_prefix(call_sig, &self.get(id).signature);
            match best {
                Some((best_lcp, _)) if lcp <= best_lcp => {}
                _ => best = Some((lcp, id)),
            }
        }
        best.map(|(_, id)| id)
    }

    // --- foreign functions ------------------------------------------------

    /// Register a foreign function; re-registration overwrites.
    pub fn register_foreign(
        &mut self,
        name: impl Into<Arc<str>>,
        imp: ForeignImpl,
        user_data: Rc<dyn Any>,
    ) {
        let name = name.into();
        self.foreign.insert(
            name.clone(),
            ForeignFunction {
                name,
                imp,
                user_data,
            },
        );
    }

    /// Resolve a foreign function, case-sensitively.
    pub fn foreign(&self, name: &str) -> Option<&ForeignFunction> {
        self.foreign.get(name)
    }
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[derive(Default)]
/// Built-in constants, each expanded lazily by its registered callback on
/// every `Loadc`.
pub struct ConstantRegistry {
    map: HashMap<Arc<str>, Rc<dyn Fn() -> Value>>,
}

impl ConstantRegistry {
    /// A registry seeded with the core constants.
    pub fn with_core() -> Self {
        let mut this = Self::default();
        this.register("PHP_EOL", || Value::str("\n"));
        this.register("PHP_INT_MAX", || Value::int(i64::MAX));
        this.register("PHP_INT_MIN", || Value::int(i64::MIN));
        this.register("PHP_INT_SIZE", || Value::int(8));
        this.register("M_PI", || Value::real(std::f64::consts::PI));
        this.register("TRUE", || Value::bool(true));
        this.register("FALSE", || Value::bool(false));
        this.register("NULL", Value::null);
        this
    }

    /// Register an expansion callback; re-registration overwrites.
    pub fn register(&mut self, name: impl Into<Arc<str>>, expand: impl Fn() -> Value + 'static) {
        self.map.insert(name.into(), Rc::new(expand));
    }

    /// Expand a constant.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        self.map.get(name).map(|expand| expand())
    }
}

impl std::fmt::Debug for ConstantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstantRegistry")
            .field("registered", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phlox_asm::{CodeBlock, FormalArg, TypeHint};

    fn decl(name: &str, hints: &[TypeHint]) -> Arc<FunctionDecl> {
        let args = hints
            .iter()
            .enumerate()
            .map(|(i, hint)| FormalArg::untyped(format!("a{i}")).with_hint(*hint))
            .collect();
        Arc::new(FunctionDecl::new(name, args, Arc::new(CodeBlock::default())))
    }

    #[test]
    fn single_function_needs_no_selection() {
        let mut reg = FunctionRegistry::new();
        let id = reg.register(decl("f", &[TypeHint::Int]));
        assert_eq!(reg.select_overload("f", "s", 1), Some(id));
    }

    #[test]
    fn overload_selection_prefers_longest_prefix() {
        let mut reg = FunctionRegistry::new();
        let int_id = reg.register(decl("f", &[TypeHint::Int]));
        let str_id = reg.register(decl("f", &[TypeHint::Str]));

        assert_eq!(reg.select_overload("f", "i", 1), Some(int_id));
        assert_eq!(reg.select_overload("f", "s", 1), Some(str_id));
        // Stability: the same inputs select the same overload every time.
        for _ in 0..8 {
            assert_eq!(reg.select_overload("f", "i", 1), Some(int_id));
        }
    }

    #[test]
    fn overload_arity_filter_runs_first() {
        let mut reg = FunctionRegistry::new();
        let unary = reg.register(decl("f", &[TypeHint::Int]));
        let binary = reg.register(decl("f", &[TypeHint::Int, TypeHint::Int]));

        assert_eq!(reg.select_overload("f", "ii", 2), Some(binary));
        assert_eq!(reg.select_overload("f", "i", 1), Some(unary));
    }

    #[test]
    fn overload_tie_breaks_to_earliest_registered() {
        let mut reg = FunctionRegistry::new();
        let first = reg.register(decl("f", &[TypeHint::Int]));
        let _second = reg.register(decl("f", &[TypeHint::Int]));

        assert_eq!(reg.select_overload("f", "i", 1), Some(first));
    }
}
