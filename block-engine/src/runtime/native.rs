// Native Runtime
// Host-compiled functions registered by name

use crate::model::{RuntimeKind, Value};
use crate::runtime::{
    FunctionRuntime, OptimizationScope, ScriptError, ScriptInvocation, ScriptOutcome, ScriptScope,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A native function: reads and writes the scope, returns its result
pub type NativeFunction = Arc<dyn Fn(&mut ScriptScope) -> Result<Value, String> + Send + Sync>;

/// Runs functions whose `source` names a registered closure
#[derive(Clone, Default)]
pub struct NativeRuntime {
    functions: HashMap<String, NativeFunction>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut ScriptScope) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl fmt::Debug for NativeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRuntime")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait::async_trait]
impl FunctionRuntime for NativeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    async fn run(
        &self,
        invocation: ScriptInvocation<'_>,
    ) -> Result<(ScriptOutcome, OptimizationScope), ScriptError> {
        let name = invocation.function.source.as_str();
        let function = self.functions.get(name).ok_or_else(|| {
            ScriptError::Compilation(format!("native function '{}' is not registered", name))
        })?;

        if invocation.cancellation.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }

        let mut scope = ScriptScope::new(invocation.bindings);
        let result = function(&mut scope).map_err(ScriptError::Runtime)?;
        Ok((scope.into_outcome(result), OptimizationScope::none()))
    }

    /// Native functions are compiled ahead of time; nothing to cache
    fn open_scope(&self, _id: &str) -> OptimizationScope {
        OptimizationScope::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionDef;
    use tokio_util::sync::CancellationToken;

    fn invocation<'a>(function: &'a FunctionDef, x: f64) -> ScriptInvocation<'a> {
        ScriptInvocation {
            block: "Area",
            function,
            bindings: HashMap::from([("Width".to_string(), Value::from(x))]),
            imports: vec![],
            object_types: vec![],
            optimization_scope_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_registered_function_writes_scope() {
        let runtime = NativeRuntime::new().register("square", |scope| {
            let w = scope.get_number("Width").ok_or("Width is not a number")?;
            scope.set("Area", w * w);
            Ok(Value::from(w * w))
        });
        let function = FunctionDef::native("area", "square");

        let (outcome, _scope) = runtime.run(invocation(&function, 3.0)).await.unwrap();
        assert_eq!(outcome.result, Value::Number(9.0));
        assert_eq!(outcome.writes, vec![("Area".to_string(), Value::Number(9.0))]);
    }

    #[tokio::test]
    async fn test_unknown_function_is_compilation_error() {
        let runtime = NativeRuntime::new();
        let function = FunctionDef::native("area", "missing");

        let err = runtime.run(invocation(&function, 1.0)).await.unwrap_err();
        assert!(matches!(err, ScriptError::Compilation(msg) if msg.contains("missing")));
    }

    #[tokio::test]
    async fn test_function_error_is_runtime_error() {
        let runtime = NativeRuntime::new().register("fail", |_| Err("boom".to_string()));
        let function = FunctionDef::native("f", "fail");

        let err = runtime.run(invocation(&function, 1.0)).await.unwrap_err();
        assert_eq!(err, ScriptError::Runtime("boom".to_string()));
    }
}
