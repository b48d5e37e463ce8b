// Script Runtime
// Interprets block scripts, caching parsed programs per optimization scope

use crate::model::{FunctionDef, RuntimeKind, Value};
use crate::runtime::{
    FunctionRuntime, OptimizationScope, ScriptError, ScriptInvocation, ScriptOutcome, ScriptScope,
};
use crate::script::{Evaluator, Expr, Program, ScriptParser, Statement};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Nesting limit for scripts calling imported functions
const MAX_CALL_DEPTH: usize = 32;

type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ScriptError>> + Send + 'a>>;

/// Parsed programs for one scope id, alive while any handle holds the id
#[derive(Default)]
struct ScopeCache {
    holders: usize,
    programs: HashMap<String, Arc<Program>>,
}

type ScopeCaches = Arc<Mutex<HashMap<String, ScopeCache>>>;

/// Interpreter for the block-script language
#[derive(Clone, Default)]
pub struct ScriptRuntime {
    caches: ScopeCaches,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of programs cached under `scope_id`
    pub fn cached_programs(&self, scope_id: &str) -> usize {
        self.caches
            .lock()
            .get(scope_id)
            .map(|cache| cache.programs.len())
            .unwrap_or(0)
    }

    fn hold(&self, scope_id: &str) -> OptimizationScope {
        self.caches
            .lock()
            .entry(scope_id.to_string())
            .or_default()
            .holders += 1;

        let caches = Arc::clone(&self.caches);
        let id = scope_id.to_string();
        OptimizationScope::new(scope_id, move || {
            let mut caches = caches.lock();
            if let Some(cache) = caches.get_mut(&id) {
                cache.holders = cache.holders.saturating_sub(1);
                if cache.holders == 0 {
                    caches.remove(&id);
                }
            }
        })
    }

    /// Parse `source`, reusing the scope's cached program when present
    fn program(&self, source: &str, scope_id: Option<&str>) -> Result<Arc<Program>, ScriptError> {
        if let Some(id) = scope_id {
            if let Some(program) = self
                .caches
                .lock()
                .get(id)
                .and_then(|cache| cache.programs.get(source))
            {
                return Ok(Arc::clone(program));
            }
        }

        let program = Arc::new(
            ScriptParser::parse_program(source)
                .map_err(|e| ScriptError::Compilation(e.to_string()))?,
        );

        if let Some(id) = scope_id {
            if let Some(cache) = self.caches.lock().get_mut(id) {
                cache
                    .programs
                    .insert(source.to_string(), Arc::clone(&program));
            }
        }

        Ok(program)
    }

    fn execute<'a>(
        &'a self,
        program: Arc<Program>,
        scope: &'a mut ScriptScope,
        context: &'a CallContext<'a>,
        depth: usize,
    ) -> ExecFuture<'a> {
        Box::pin(async move {
            let mut result = Value::Null;

            for statement in &program.statements {
                if context.cancellation.is_cancelled() {
                    return Err(ScriptError::Cancelled);
                }

                match statement {
                    Statement::Assign { target, value } => {
                        let value = eval(scope, value)?;
                        scope.set(target.clone(), value);
                    }
                    Statement::Emit(expr) => {
                        let event = eval(scope, expr)?.as_string();
                        scope.emit(event);
                    }
                    Statement::Terminate(expr) => {
                        let reason = eval(scope, expr)?.as_string();
                        scope.terminate(reason);
                    }
                    Statement::Delay(expr) => {
                        let millis = eval(scope, expr)?.as_number().ok_or_else(|| {
                            ScriptError::Runtime("delay() requires a number of milliseconds".into())
                        })?;
                        sleep_or_cancel(millis, &context.cancellation).await?;
                    }
                    Statement::Expr(call @ Expr::Call { name, args }) if args.is_empty() => {
                        result = match context.import(name) {
                            Some(function) => {
                                self.call_import(function, scope, context, depth).await?
                            }
                            None => eval(scope, call)?,
                        };
                    }
                    Statement::Expr(expr) => {
                        result = eval(scope, expr)?;
                    }
                }

                if scope.is_terminated() {
                    break;
                }
            }

            Ok(result)
        })
    }

    async fn call_import(
        &self,
        function: &FunctionDef,
        scope: &mut ScriptScope,
        context: &CallContext<'_>,
        depth: usize,
    ) -> Result<Value, ScriptError> {
        if function.runtime != RuntimeKind::Script {
            return Err(ScriptError::Runtime(format!(
                "function '{}' is not a script and cannot be called from one",
                function.id
            )));
        }
        if depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::Runtime(format!(
                "call depth exceeded calling '{}'",
                function.id
            )));
        }

        let program = self.program(&function.source, context.scope_id)?;
        self.execute(program, scope, context, depth + 1).await
    }
}

/// Per-invocation state shared by nested calls
struct CallContext<'a> {
    imports: &'a [FunctionDef],
    scope_id: Option<&'a str>,
    cancellation: CancellationToken,
}

impl CallContext<'_> {
    fn import(&self, id: &str) -> Option<&FunctionDef> {
        self.imports.iter().find(|f| f.id == id)
    }
}

fn eval(scope: &ScriptScope, expr: &Expr) -> Result<Value, ScriptError> {
    Evaluator::new(scope.variables())
        .eval(expr)
        .map_err(|e| ScriptError::Runtime(e.message))
}

async fn sleep_or_cancel(millis: f64, token: &CancellationToken) -> Result<(), ScriptError> {
    let duration = Duration::from_millis(millis.max(0.0) as u64);
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = token.cancelled() => Err(ScriptError::Cancelled),
    }
}

#[async_trait::async_trait]
impl FunctionRuntime for ScriptRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Script
    }

    async fn run(
        &self,
        invocation: ScriptInvocation<'_>,
    ) -> Result<(ScriptOutcome, OptimizationScope), ScriptError> {
        let held = match invocation.optimization_scope_id {
            Some(id) => self.hold(id),
            None => OptimizationScope::none(),
        };

        let program = self.program(
            &invocation.function.source,
            invocation.optimization_scope_id,
        )?;

        let context = CallContext {
            imports: &invocation.imports,
            scope_id: invocation.optimization_scope_id,
            cancellation: invocation.cancellation.clone(),
        };
        let mut scope = ScriptScope::new(invocation.bindings);
        let result = self.execute(program, &mut scope, &context, 0).await?;

        Ok((scope.into_outcome(result), held))
    }

    fn open_scope(&self, id: &str) -> OptimizationScope {
        self.hold(id)
    }
}
