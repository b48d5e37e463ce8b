// Function Runtime Module
// Runs block guards and actions through pluggable runtime families

pub mod native;
pub mod script;

pub use native::{NativeFunction, NativeRuntime};
pub use script::ScriptRuntime;

use crate::model::{FunctionDef, RuntimeKind, Value};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised by a runtime; controls attach block and function context
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    #[error("{0}")]
    Compilation(String),

    #[error("{0}")]
    Runtime(String),

    #[error("cancelled")]
    Cancelled,
}

/// Everything a runtime needs to run one function
pub struct ScriptInvocation<'a> {
    /// Label of the calling block, for diagnostics
    pub block: &'a str,
    pub function: &'a FunctionDef,
    /// Snapshot of the block's variables at call time
    pub bindings: HashMap<String, Value>,
    /// Functions the script may call by id (own and imported)
    pub imports: Vec<FunctionDef>,
    pub object_types: Vec<String>,
    pub optimization_scope_id: Option<&'a str>,
    pub cancellation: CancellationToken,
}

/// What a function did: its value plus side effects for the control to apply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutcome {
    pub result: Value,
    /// Variable writes in the order the script made them
    pub writes: Vec<(String, Value)>,
    pub events: Vec<String>,
    pub termination: Option<String>,
}

/// Mutable view of a block's variables handed to running functions
#[derive(Debug, Clone, Default)]
pub struct ScriptScope {
    variables: HashMap<String, Value>,
    writes: Vec<(String, Value)>,
    events: Vec<String>,
    termination: Option<String>,
}

impl ScriptScope {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_number)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Write a variable; later reads in the same function see the new value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        self.variables.insert(name.clone(), value.clone());
        self.writes.push((name, value));
    }

    pub fn emit(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    pub fn terminate(&mut self, reason: impl Into<String>) {
        self.termination = Some(reason.into());
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    pub fn into_outcome(self, result: Value) -> ScriptOutcome {
        ScriptOutcome {
            result,
            writes: self.writes,
            events: self.events,
            termination: self.termination,
        }
    }
}

/// Handle keeping a runtime's per-scope caches alive. Released on
/// `dispose` or drop, whichever comes first.
pub struct OptimizationScope {
    id: Option<String>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl OptimizationScope {
    /// A scope that holds nothing
    pub fn none() -> Self {
        Self {
            id: None,
            release: None,
        }
    }

    pub fn new(id: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: Some(id.into()),
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn dispose(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!(scope = ?self.id, "disposing optimization scope");
            release();
        }
    }
}

impl Drop for OptimizationScope {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for OptimizationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationScope")
            .field("id", &self.id)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// A family of executable functions
#[async_trait::async_trait]
pub trait FunctionRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Run one function. The returned scope must be disposed by the caller
    /// once the enclosing block execution ends.
    async fn run(
        &self,
        invocation: ScriptInvocation<'_>,
    ) -> Result<(ScriptOutcome, OptimizationScope), ScriptError>;

    /// Pre-open a scope so repeated requests sharing `id` reuse caches
    fn open_scope(&self, id: &str) -> OptimizationScope;
}

/// Runtimes keyed by family
#[derive(Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<RuntimeKind, Arc<dyn FunctionRuntime>>,
}

impl RuntimeRegistry {
    /// Registry with the script runtime installed
    pub fn new() -> Self {
        Self::empty().with_runtime(Arc::new(ScriptRuntime::new()))
    }

    pub fn empty() -> Self {
        Self {
            runtimes: HashMap::new(),
        }
    }

    /// Install a runtime, replacing any runtime of the same kind
    pub fn with_runtime(mut self, runtime: Arc<dyn FunctionRuntime>) -> Self {
        self.runtimes.insert(runtime.kind(), runtime);
        self
    }

    pub fn with_native(self, native: NativeRuntime) -> Self {
        self.with_runtime(Arc::new(native))
    }

    pub fn get(&self, kind: RuntimeKind) -> Option<Arc<dyn FunctionRuntime>> {
        self.runtimes.get(&kind).cloned()
    }

    /// Open `id` on every runtime
    pub fn open_scope(&self, id: &str) -> Vec<OptimizationScope> {
        self.runtimes
            .values()
            .map(|runtime| runtime.open_scope(id))
            .collect()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("kinds", &self.runtimes.keys().collect::<Vec<_>>())
            .finish()
    }
}
