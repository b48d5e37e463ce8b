// Basic Execution Control
// Drives a basic block's state machine through the function runtimes

use crate::error::{EngineError, EngineResult};
use crate::execution::context::RunBlockRequest;
use crate::execution::control::{BlockResult, ControlCore};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::model::{BasicBlockDef, BlockDefinition, BlockStateTransition, FunctionDef, DIRECT_EVENT};
use crate::runtime::{OptimizationScope, ScriptError, ScriptInvocation, ScriptOutcome};

use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

enum ChartOutcome {
    Finished(BlockResult),
    /// A script asked to stop; carries the partial result and the reason
    Terminated(BlockResult, String),
}

pub struct BasicControl {
    core: ControlCore,
    /// Survives across runs of this control
    current_state: Mutex<String>,
}

impl BasicControl {
    pub fn new(core: ControlCore) -> Self {
        let initial = match core.definition().as_ref() {
            BlockDefinition::Basic(def) => def.execution_control_chart.initial_state.clone(),
            BlockDefinition::Composite(_) => String::new(),
        };
        Self {
            core,
            current_state: Mutex::new(initial),
        }
    }

    pub fn core(&self) -> &ControlCore {
        &self.core
    }

    pub fn current_state(&self) -> String {
        self.current_state.lock().clone()
    }

    pub async fn execute(
        &self,
        request: &RunBlockRequest,
        optimization_scope_id: Option<&str>,
    ) -> EngineResult<BlockResult> {
        let _idle = self
            .core
            .try_acquire()
            .ok_or_else(|| EngineError::ConcurrencyViolation {
                block: self.core.label().to_string(),
            })?;

        self.core.begin_run(request);

        let mut held = Vec::new();
        let outcome = self
            .run_chart(request, optimization_scope_id, &mut held)
            .await;
        for scope in held {
            scope.dispose();
        }

        match outcome {
            Ok(ChartOutcome::Finished(result)) => {
                self.core.finish_success(result.clone());
                Ok(result)
            }
            Ok(ChartOutcome::Terminated(partial, reason)) => {
                let error = EngineError::GracefulTermination {
                    block: self.core.label().to_string(),
                    reason,
                };
                self.core.finish_terminated(partial, error.clone());
                Err(error)
            }
            Err(error) => {
                self.core.finish_failure(error.clone());
                Err(error)
            }
        }
    }

    fn basic_def(&self) -> EngineResult<&BasicBlockDef> {
        match self.core.definition().as_ref() {
            BlockDefinition::Basic(def) => Ok(def),
            BlockDefinition::Composite(def) => Err(EngineError::definition(format!(
                "'{}' is a composite block",
                def.id
            ))),
        }
    }

    async fn run_chart(
        &self,
        request: &RunBlockRequest,
        scope_id: Option<&str>,
        held: &mut Vec<OptimizationScope>,
    ) -> EngineResult<ChartOutcome> {
        let def = self.basic_def()?;
        let core = &self.core;

        core.apply_bindings(&request.bindings)?;

        let trigger = core
            .definition()
            .resolve_trigger(request.trigger_event.as_deref())
            .ok_or_else(|| EngineError::routing(core.label(), "no trigger event to run"))?;

        // A transition never fires on an event whose data has not arrived
        if let Some(event) = core.definition().event(&trigger) {
            for variable in &event.variables {
                if !core.cell(variable)?.is_set() {
                    return Err(EngineError::definition(format!(
                        "variable '{}' carried by event '{}' of block '{}' has no value",
                        variable,
                        trigger,
                        core.label()
                    )));
                }
            }
        }

        let from_state = self.current_state();
        let mut output_events: Vec<String> = Vec::new();
        let mut event = trigger;
        let mut fired = false;

        loop {
            if request.cancellation.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let current = self.current_state();
            let Some(transition) = self
                .find_transition(def, &current, &event, request, scope_id, held)
                .await?
            else {
                if fired {
                    break;
                }
                return Err(EngineError::routing(
                    core.label(),
                    format!(
                        "transition not found from state '{}' on event '{}'",
                        current, event
                    ),
                ));
            };
            fired = true;

            *self.current_state.lock() = transition.to_state.clone();
            debug!(
                block = %core.label(),
                from = %transition.from_state,
                to = %transition.to_state,
                event = %event,
                "transition fired"
            );
            core.env().progress.send_event(ExecutionEvent::transition_fired(
                core.label(),
                &transition.from_state,
                &transition.to_state,
                &event,
            ));

            for name in &transition.default_output_events {
                push_unique(&mut output_events, name);
            }

            for action in &transition.actions {
                let outcome = self
                    .invoke(def, action, transition, request, scope_id, held)
                    .await?;

                for (name, value) in outcome.writes {
                    core.cell(&name)?.set(value);
                }
                for published in outcome.events {
                    core.env()
                        .progress
                        .send_event(ExecutionEvent::event_published(core.label(), &published));
                    push_unique(&mut output_events, &published);
                }

                if let Some(reason) = outcome.termination {
                    debug!(block = %core.label(), %reason, "block terminated by script");
                    let partial = BlockResult {
                        from_state: Some(from_state),
                        final_state: Some(self.current_state()),
                        output_events,
                    };
                    return Ok(ChartOutcome::Terminated(partial, reason));
                }
            }

            event = DIRECT_EVENT.to_string();
            tokio::task::yield_now().await;
        }

        Ok(ChartOutcome::Finished(BlockResult {
            from_state: Some(from_state),
            final_state: Some(self.current_state()),
            output_events,
        }))
    }

    /// First transition in declaration order whose guard passes
    async fn find_transition<'d>(
        &self,
        def: &'d BasicBlockDef,
        current: &str,
        event: &str,
        request: &RunBlockRequest,
        scope_id: Option<&str>,
        held: &mut Vec<OptimizationScope>,
    ) -> EngineResult<Option<&'d BlockStateTransition>> {
        let candidates = def
            .execution_control_chart
            .transitions
            .iter()
            .filter(|t| t.from_state == current && t.trigger_event == event);

        for transition in candidates {
            let Some(condition) = &transition.condition else {
                return Ok(Some(transition));
            };

            // Guard writes and events are discarded
            let outcome = self
                .invoke(def, condition, transition, request, scope_id, held)
                .await?;
            if outcome.result.is_truthy() {
                return Ok(Some(transition));
            }
        }

        Ok(None)
    }

    async fn invoke(
        &self,
        def: &BasicBlockDef,
        function_id: &str,
        transition: &BlockStateTransition,
        request: &RunBlockRequest,
        scope_id: Option<&str>,
        held: &mut Vec<OptimizationScope>,
    ) -> EngineResult<ScriptOutcome> {
        let core = &self.core;
        let compilation = |message: String| EngineError::Compilation {
            block: core.label().to_string(),
            function: function_id.to_string(),
            message,
        };

        let function = def
            .function(function_id)
            .ok_or_else(|| compilation("function not found".to_string()))?;
        let runtime = core
            .env()
            .runtimes
            .get(function.runtime)
            .ok_or_else(|| compilation(format!("no {:?} runtime registered", function.runtime)))?;

        let imports: Vec<FunctionDef> = def
            .functions
            .iter()
            .chain(def.imported_functions.iter())
            .cloned()
            .collect();

        let invocation = ScriptInvocation {
            block: core.label(),
            function,
            bindings: core.script_bindings()?,
            imports,
            object_types: def.object_types(),
            optimization_scope_id: scope_id,
            cancellation: request.cancellation.clone(),
        };

        match runtime.run(invocation).await {
            Ok((outcome, scope)) => {
                held.push(scope);
                Ok(outcome)
            }
            Err(ScriptError::Compilation(message)) => Err(compilation(message)),
            Err(ScriptError::Runtime(message)) => Err(EngineError::Runtime {
                block: core.label().to_string(),
                context: format!(
                    "{} -> {} / {}",
                    transition.from_state, transition.to_state, function_id
                ),
                message,
            }),
            Err(ScriptError::Cancelled) => Err(EngineError::Cancelled),
        }
    }
}

impl fmt::Debug for BasicControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicControl")
            .field("core", &self.core)
            .field("current_state", &self.current_state())
            .finish()
    }
}

pub(crate) fn push_unique(events: &mut Vec<String>, name: &str) {
    if !events.iter().any(|e| e == name) {
        events.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ControlEnv;
    use crate::execution::control::ExecutionStatus;
    use crate::model::Value;
    use crate::runtime::{RuntimeRegistry, ScriptRuntime};
    use std::sync::Arc;

    fn control(yaml: &str) -> BasicControl {
        let definition: BlockDefinition = serde_yaml::from_str(yaml).unwrap();
        let env = ControlEnv::new(Arc::new(RuntimeRegistry::new()));
        BasicControl::new(ControlCore::new(Arc::new(definition), "Test", env))
    }

    const TOGGLE: &str = r#"
kind: basic
id: Toggle
variables:
  - name: Count
    dataType: int32
    variableType: inOut
    defaultValue: 0
events:
  - name: Flip
    isInput: true
  - name: Flipped
functions:
  - id: bump
    source: "Count = Count + 1"
executionControlChart:
  initialState: Off
  states:
    - name: Off
    - name: On
  transitions:
    - fromState: Off
      toState: On
      triggerEvent: Flip
      actions: [bump]
      defaultOutputEvents: [Flipped]
    - fromState: On
      toState: Off
      triggerEvent: Flip
      actions: [bump]
      defaultOutputEvents: [Flipped]
"#;

    #[tokio::test]
    async fn test_state_persists_across_runs() {
        let control = control(TOGGLE);
        let request = RunBlockRequest::new();

        let first = control.execute(&request, None).await.unwrap();
        assert_eq!(first.from_state.as_deref(), Some("Off"));
        assert_eq!(first.final_state.as_deref(), Some("On"));
        assert_eq!(first.output_events, vec!["Flipped".to_string()]);

        let second = control.execute(&request, None).await.unwrap();
        assert_eq!(second.final_state.as_deref(), Some("Off"));
        assert_eq!(control.core().cell("Count").unwrap().as_i64(), Some(2));
        assert_eq!(control.core().status(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_routing_error() {
        let control = control(TOGGLE);
        let request = RunBlockRequest::new().with_trigger("Nope");

        let err = control.execute(&request, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Routing { ref message, .. } if message.contains("transition not found")));
        assert_eq!(control.core().status(), ExecutionStatus::Failed);
        assert_eq!(control.core().last_exception(), Some(err));
        assert!(control.core().is_idle());
    }

    #[tokio::test]
    async fn test_terminate_keeps_partial_result() {
        let control = control(
            r#"
kind: basic
id: Stopper
variables:
  - name: Out
    dataType: string
    variableType: output
events:
  - name: Go
    isInput: true
functions:
  - id: stop
    source: "Out = 'partial'; emit('Halted'); terminate('enough'); Out = 'never'"
executionControlChart:
  initialState: A
  states:
    - name: A
    - name: B
  transitions:
    - fromState: A
      toState: B
      triggerEvent: Go
      actions: [stop]
"#,
        );

        let err = control
            .execute(&RunBlockRequest::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_graceful_termination());

        let partial = control.core().last_result().unwrap();
        assert_eq!(partial.final_state.as_deref(), Some("B"));
        assert_eq!(partial.output_events, vec!["Halted".to_string()]);
        assert_eq!(control.core().cell("Out").unwrap().get(), Value::from("partial"));
        assert_eq!(control.core().status(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_runtime_error_names_transition() {
        let control = control(
            r#"
kind: basic
id: Broken
events:
  - name: Go
    isInput: true
functions:
  - id: fail
    source: "1 / 0"
executionControlChart:
  initialState: A
  states:
    - name: A
  transitions:
    - fromState: A
      toState: A
      triggerEvent: Go
      actions: [fail]
"#,
        );

        let err = control
            .execute(&RunBlockRequest::new(), None)
            .await
            .unwrap_err();
        match err {
            EngineError::Runtime { block, context, .. } => {
                assert_eq!(block, "Test");
                assert_eq!(context, "A -> A / fail");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_push_unique() {
        let mut events = vec!["A".to_string()];
        push_unique(&mut events, "A");
        push_unique(&mut events, "B");
        assert_eq!(events, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn test_scopes_released_when_action_fails() {
        let runtime = ScriptRuntime::new();
        let registry = RuntimeRegistry::empty().with_runtime(Arc::new(runtime.clone()));
        let definition: BlockDefinition = serde_yaml::from_str(
            r#"
kind: basic
id: HalfBroken
variables:
  - name: Count
    dataType: int32
    variableType: output
events:
  - name: Go
    isInput: true
functions:
  - id: count
    source: "Count = 1"
  - id: fail
    source: "Count / 0"
executionControlChart:
  initialState: A
  states:
    - name: A
  transitions:
    - fromState: A
      toState: A
      triggerEvent: Go
      actions: [count, fail]
"#,
        )
        .unwrap();
        let control = BasicControl::new(ControlCore::new(
            Arc::new(definition),
            "HalfBroken",
            ControlEnv::new(Arc::new(registry)),
        ));

        let err = control
            .execute(&RunBlockRequest::new(), Some("warm"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime { .. }));
        assert_eq!(control.core().cell("Count").unwrap().as_i64(), Some(1));
        assert_eq!(runtime.cached_programs("warm"), 0);
    }
}
