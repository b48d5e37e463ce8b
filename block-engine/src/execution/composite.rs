// Composite Execution Control
// Runs a graph of sub-blocks wave by wave as their events fire

use crate::cell::ValueCell;
use crate::error::{EngineError, EngineResult};
use crate::execution::basic::push_unique;
use crate::execution::context::RunBlockRequest;
use crate::execution::control::{BlockResult, ControlCore, ExecutionControl, ExecutionStatus};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::runner::BlockRunner;
use crate::model::{BlockDefinition, CompositeBlockDef, EventConnection, Value};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where a sub-block input comes from
enum InputSource {
    /// Output cell of another sub-block
    Upstream {
        control: Arc<ExecutionControl>,
        cell: Arc<ValueCell>,
    },
    /// Composite's own variable, read at launch
    Boundary(Value),
    /// No data connection; the child's own value (usually a default)
    Unconnected,
}

struct BranchInput {
    variable: String,
    source: InputSource,
}

/// Sent by a finished branch task
struct BranchReport {
    instance: String,
    outcome: EngineResult<Vec<String>>,
}

pub struct CompositeControl {
    core: ControlCore,
    /// Sub-block controls by instance id, kept for the life of the composite
    children: Mutex<HashMap<String, Arc<ExecutionControl>>>,
}

impl CompositeControl {
    pub fn new(core: ControlCore) -> Self {
        Self {
            core,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn core(&self) -> &ControlCore {
        &self.core
    }

    /// Control of a sub-block that has been triggered or waited on
    pub fn child(&self, instance: &str) -> Option<Arc<ExecutionControl>> {
        self.children.lock().get(instance).cloned()
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

        match self.run_graph(request, optimization_scope_id).await {
            Ok(result) => {
                self.core.finish_success(result.clone());
                Ok(result)
            }
            Err(error) => {
                self.core.finish_failure(error.clone());
                Err(error)
            }
        }
    }

    fn composite_def(&self) -> EngineResult<&CompositeBlockDef> {
        match self.core.definition().as_ref() {
            BlockDefinition::Composite(def) => Ok(def),
            BlockDefinition::Basic(def) => Err(EngineError::definition(format!(
                "'{}' is a basic block",
                def.id
            ))),
        }
    }

    async fn run_graph(
        &self,
        request: &RunBlockRequest,
        scope_id: Option<&str>,
    ) -> EngineResult<BlockResult> {
        let def = self.composite_def()?;
        let core = &self.core;

        core.apply_bindings(&request.bindings)?;

        let trigger = core
            .definition()
            .resolve_trigger(request.trigger_event.as_deref())
            .ok_or_else(|| EngineError::routing(core.label(), "no trigger event to run"))?;

        let initial: Vec<EventConnection> = def.connections_from(None, &trigger).cloned().collect();
        if initial.is_empty() {
            return Err(EngineError::routing(
                core.label(),
                format!("no connection from boundary event '{}'", trigger),
            ));
        }

        let (reports, mut inbox) = mpsc::unbounded_channel();
        let mut outstanding = 0usize;
        let mut output_events = Vec::new();

        outstanding += self.launch_wave(def, &initial, request, scope_id, &reports, &mut output_events)?;

        while outstanding > 0 {
            let report = tokio::select! {
                report = inbox.recv() => report,
                _ = request.cancellation.cancelled() => return Err(EngineError::Cancelled),
            };
            let Some(BranchReport { instance, outcome }) = report else {
                return Err(EngineError::Cancelled);
            };
            outstanding -= 1;

            match outcome {
                Ok(events) => {
                    for event in events {
                        let next: Vec<EventConnection> = def
                            .connections_from(Some(&instance), &event)
                            .cloned()
                            .collect();
                        outstanding += self.launch_wave(
                            def,
                            &next,
                            request,
                            scope_id,
                            &reports,
                            &mut output_events,
                        )?;
                    }
                }
                Err(error) => {
                    // In-flight siblings keep running until done or cancelled
                    warn!(
                        composite = %core.label(),
                        instance = %instance,
                        error = %error,
                        "sub-block failed"
                    );
                    core.env().progress.send_event(ExecutionEvent::warning(
                        format!("sub-block '{}' failed: {}", instance, error),
                        Some(core.label().to_string()),
                    ));
                    return Err(error);
                }
            }
        }

        self.commit_boundary_outputs(def)?;

        Ok(BlockResult {
            from_state: None,
            final_state: None,
            output_events,
        })
    }

    /// Start one task per sub-block target; returns how many were started
    fn launch_wave(
        &self,
        def: &CompositeBlockDef,
        connections: &[EventConnection],
        request: &RunBlockRequest,
        scope_id: Option<&str>,
        reports: &mpsc::UnboundedSender<BranchReport>,
        output_events: &mut Vec<String>,
    ) -> EngineResult<usize> {
        let mut launched = 0;

        for connection in connections {
            let Some(instance) = &connection.target_block_id else {
                push_unique(output_events, &connection.target_event);
                continue;
            };

            let child = self.child_or_create(def, instance)?;
            let inputs = self.resolve_inputs(def, instance, &child, &connection.target_event)?;

            debug!(
                composite = %self.core.label(),
                instance = %instance,
                event = %connection.target_event,
                "launching sub-block"
            );
            self.core.env().progress.send_event(ExecutionEvent::sub_block_launched(
                self.core.label(),
                instance,
                &connection.target_event,
            ));

            let child_request = request.for_child(&connection.target_event);
            let scope_id = scope_id.map(str::to_string);
            let instance = instance.clone();
            let reports = reports.clone();

            tokio::spawn(async move {
                let outcome = run_branch(&child, inputs, &child_request, scope_id.as_deref()).await;
                let _ = reports.send(BranchReport { instance, outcome });
            });
            launched += 1;
        }

        Ok(launched)
    }

    fn child_or_create(
        &self,
        def: &CompositeBlockDef,
        instance: &str,
    ) -> EngineResult<Arc<ExecutionControl>> {
        let mut children = self.children.lock();
        if let Some(control) = children.get(instance) {
            return Ok(Arc::clone(control));
        }

        let definition = def.child_definitions.get(instance).cloned().ok_or_else(|| {
            EngineError::definition(format!(
                "composite '{}' has no resolved sub-block '{}'",
                def.id, instance
            ))
        })?;

        let control = Arc::new(ExecutionControl::new(
            definition,
            instance,
            self.core.env().clone(),
        ));
        children.insert(instance.to_string(), Arc::clone(&control));
        Ok(control)
    }

    fn resolve_inputs(
        &self,
        def: &CompositeBlockDef,
        instance: &str,
        child: &ExecutionControl,
        event: &str,
    ) -> EngineResult<Vec<BranchInput>> {
        let Some(block_event) = child.definition().event(event) else {
            return Ok(Vec::new());
        };

        let mut inputs = Vec::with_capacity(block_event.variables.len());
        for variable in &block_event.variables {
            let source = match def.data_source(Some(instance), variable) {
                Some(connection) => match &connection.source_block_id {
                    Some(upstream) => {
                        let control = self.child_or_create(def, upstream)?;
                        let cell = control.core().cell(&connection.source_variable)?;
                        InputSource::Upstream { control, cell }
                    }
                    None => {
                        let cell = self.core.cell(&connection.source_variable)?;
                        let value = cell.value_if_set().ok_or_else(|| {
                            EngineError::definition(format!(
                                "composite '{}' variable '{}' has no value for '{}.{}'",
                                self.core.label(),
                                connection.source_variable,
                                instance,
                                variable
                            ))
                        })?;
                        InputSource::Boundary(value)
                    }
                },
                None => InputSource::Unconnected,
            };
            inputs.push(BranchInput {
                variable: variable.clone(),
                source,
            });
        }
        Ok(inputs)
    }

    /// Copy sub-block results onto the composite's outputs in one commit
    fn commit_boundary_outputs(&self, def: &CompositeBlockDef) -> EngineResult<()> {
        let mut staged = Vec::new();

        for connection in def.boundary_outputs() {
            let value = match &connection.source_block_id {
                None => self.core.cell(&connection.source_variable)?.value_if_set(),
                Some(instance) => {
                    let child = self.child(instance);
                    match child {
                        Some(child) => child.core().cell(&connection.source_variable)?.value_if_set(),
                        None => None,
                    }
                }
            };

            if let Some(value) = value {
                staged.push((connection.target_variable.clone(), value));
            }
        }

        self.core.commit_outputs(staged)
    }
}

impl fmt::Debug for CompositeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeControl")
            .field("core", &self.core)
            .field("children", &self.children.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Gather a sub-block's inputs, then run it; yields the events it published
async fn run_branch(
    child: &ExecutionControl,
    inputs: Vec<BranchInput>,
    request: &RunBlockRequest,
    scope_id: Option<&str>,
) -> EngineResult<Vec<String>> {
    let token = &request.cancellation;

    for input in inputs {
        let target = child.core().cell(&input.variable)?;
        let value = match input.source {
            InputSource::Upstream { control, cell } => loop {
                // Only a value produced during this run counts
                let upstream = control.core();
                let signal = upstream.wait_run_finished(request.run_id, token).await?;
                if signal.status == ExecutionStatus::Failed {
                    return Err(upstream.last_exception().unwrap_or(EngineError::Cancelled));
                }
                let value = cell.wait_set(token).await?;
                if upstream.is_idle() {
                    break value;
                }
            },
            InputSource::Boundary(value) => value,
            InputSource::Unconnected => match target.value_if_set() {
                Some(_) => continue,
                None => {
                    return Err(EngineError::definition(format!(
                        "input '{}' of sub-block '{}' is not connected and has no value",
                        input.variable,
                        child.core().label()
                    )))
                }
            },
        };
        target.set(value);
    }

    match BlockRunner::run(request, child, scope_id).await {
        Ok(result) => Ok(result.output_events),
        Err(error) if error.is_graceful_termination() => Ok(child
            .core()
            .last_result()
            .map(|result| result.output_events)
            .unwrap_or_default()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ControlEnv;
    use crate::model::BlockDefinitionCatalog;
    use crate::runtime::RuntimeRegistry;

    const CATALOG: &str = r#"
- kind: basic
  id: Double
  variables:
    - name: In
      dataType: int32
    - name: Out
      dataType: int32
      variableType: output
  events:
    - name: Go
      isInput: true
      variables: [In]
    - name: Done
  functions:
    - id: run
      source: "Out = In * 2"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Go
        actions: [run]
        defaultOutputEvents: [Done]
- kind: composite
  id: Quadruple
  variables:
    - name: X
      dataType: int32
    - name: Y
      dataType: int32
      variableType: output
  events:
    - name: Start
      isInput: true
      variables: [X]
    - name: Bypass
      isInput: true
    - name: Finished
    - name: Skipped
  blocks:
    - id: First
      definitionId: Double
    - id: Second
      definitionId: Double
  eventConnections:
    - sourceEvent: Start
      targetBlockId: First
      targetEvent: Go
    - sourceBlockId: First
      sourceEvent: Done
      targetBlockId: Second
      targetEvent: Go
    - sourceBlockId: Second
      sourceEvent: Done
      targetEvent: Finished
    - sourceEvent: Bypass
      targetEvent: Skipped
  dataConnections:
    - sourceVariable: X
      targetBlockId: First
      targetVariable: In
    - sourceBlockId: First
      sourceVariable: Out
      targetBlockId: Second
      targetVariable: In
    - sourceBlockId: Second
      sourceVariable: Out
      targetVariable: Y
- kind: composite
  id: Outer
  variables:
    - name: X
      dataType: int32
    - name: Y
      dataType: int32
      variableType: output
  events:
    - name: Start
      isInput: true
      variables: [X]
    - name: Finished
  blocks:
    - id: I1
      definitionId: Quadruple
    - id: I2
      definitionId: Quadruple
  eventConnections:
    - { sourceEvent: Start, targetBlockId: I1, targetEvent: Start }
    - { sourceBlockId: I1, sourceEvent: Finished, targetBlockId: I2, targetEvent: Start }
    - { sourceBlockId: I2, sourceEvent: Finished, targetEvent: Finished }
  dataConnections:
    - { sourceVariable: X, targetBlockId: I1, targetVariable: X }
    - { sourceBlockId: I1, sourceVariable: Y, targetBlockId: I2, targetVariable: X }
    - { sourceBlockId: I2, sourceVariable: Y, targetVariable: Y }
- kind: basic
  id: Slow
  variables:
    - name: Out
      dataType: int32
      variableType: output
  events:
    - name: Go
      isInput: true
    - name: Done
  functions:
    - id: run
      source: "delay(80); Out = 7"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Go
        actions: [run]
        defaultOutputEvents: [Done]
- kind: basic
  id: Broken
  events:
    - name: Go
      isInput: true
    - name: Done
  functions:
    - id: fail
      source: "1 / 0"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Go
        actions: [fail]
        defaultOutputEvents: [Done]
- kind: basic
  id: Stopper
  events:
    - name: Go
      isInput: true
    - name: Halted
  functions:
    - id: stop
      source: "emit('Halted'); terminate('enough')"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Go
        actions: [stop]
- kind: composite
  id: Siblings
  events:
    - name: Start
      isInput: true
    - name: Finished
  blocks:
    - id: S
      definitionId: Slow
    - id: B
      definitionId: Broken
  eventConnections:
    - { sourceEvent: Start, targetBlockId: S, targetEvent: Go }
    - { sourceEvent: Start, targetBlockId: B, targetEvent: Go }
    - { sourceBlockId: S, sourceEvent: Done, targetEvent: Finished }
- kind: composite
  id: Halting
  events:
    - name: Start
      isInput: true
    - name: Finished
  blocks:
    - id: T
      definitionId: Stopper
    - id: S
      definitionId: Slow
  eventConnections:
    - { sourceEvent: Start, targetBlockId: T, targetEvent: Go }
    - { sourceBlockId: T, sourceEvent: Halted, targetBlockId: S, targetEvent: Go }
    - { sourceBlockId: S, sourceEvent: Done, targetEvent: Finished }
"#;

    fn control_for(id: &str) -> ExecutionControl {
        let mut catalog = BlockDefinitionCatalog::from_yaml_str(CATALOG).unwrap();
        catalog.map_definitions().unwrap();
        let env = ControlEnv::new(Arc::new(RuntimeRegistry::new()));
        ExecutionControl::new(catalog.get(id).unwrap(), id, env)
    }

    fn control() -> ExecutionControl {
        control_for("Quadruple")
    }

    fn composite(control: &ExecutionControl) -> &CompositeControl {
        match control {
            ExecutionControl::Composite(composite) => composite,
            ExecutionControl::Basic(_) => panic!("expected composite control"),
        }
    }

    #[tokio::test]
    async fn test_chain_commits_boundary_output() {
        let control = control();
        let request = RunBlockRequest::new().with_input("X", 3);

        let result = control.execute(&request, None).await.unwrap();
        assert_eq!(result.output_events, vec!["Finished".to_string()]);
        assert_eq!(control.core().cell("Y").unwrap().as_i64(), Some(12));
        assert_eq!(control.core().status(), ExecutionStatus::Completed);

        assert!(composite(&control).child("First").is_some());
        assert!(composite(&control).child("Second").is_some());
    }

    #[tokio::test]
    async fn test_boundary_passthrough() {
        let control = control();
        let request = RunBlockRequest::new().with_trigger("Bypass");

        let result = control.execute(&request, None).await.unwrap();
        assert_eq!(result.output_events, vec!["Skipped".to_string()]);
        assert!(!control.core().cell("Y").unwrap().is_set());
    }

    #[tokio::test]
    async fn test_missing_boundary_input_fails() {
        let control = control();
        let err = control
            .execute(&RunBlockRequest::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
        assert_eq!(control.core().status(), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unconnected_trigger_is_routing_error() {
        let control = control();
        let request = RunBlockRequest::new().with_trigger("Finished");
        let err = control.execute(&request, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Routing { .. }));
    }

    #[tokio::test]
    async fn test_nested_composites_chain_through_boundaries() {
        let control = control_for("Outer");

        let request = RunBlockRequest::new().with_input("X", 3);
        let result = control.execute(&request, None).await.unwrap();
        assert_eq!(result.output_events, vec!["Finished".to_string()]);
        assert_eq!(control.core().cell("Y").unwrap().as_i64(), Some(48));

        let inner = composite(&control).child("I2").unwrap();
        let second = composite(&inner).child("Second").unwrap();
        assert_eq!(second.core().cell("Out").unwrap().as_i64(), Some(48));

        // Reused controls pick up the new run's values
        let request = RunBlockRequest::new().with_input("X", 1);
        control.execute(&request, None).await.unwrap();
        assert_eq!(control.core().cell("Y").unwrap().as_i64(), Some(16));
    }

    #[tokio::test]
    async fn test_sibling_failure_lets_in_flight_branch_finish() {
        let control = control_for("Siblings");
        let request = RunBlockRequest::new();

        let err = control.execute(&request, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Runtime { ref block, .. } if block == "B"));
        assert_eq!(control.core().status(), ExecutionStatus::Failed);

        let slow = composite(&control).child("S").unwrap();
        assert!(!slow.core().cell("Out").unwrap().is_set());

        let token = tokio_util::sync::CancellationToken::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            slow.core().wait_run_finished(request.run_id, &token),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(slow.core().status(), ExecutionStatus::Completed);
        assert_eq!(slow.core().cell("Out").unwrap().as_i64(), Some(7));
    }

    #[tokio::test]
    async fn test_terminated_sub_block_continues_with_partial_events() {
        let control = control_for("Halting");

        let result = control.execute(&RunBlockRequest::new(), None).await.unwrap();
        assert_eq!(result.output_events, vec!["Finished".to_string()]);
        assert_eq!(control.core().status(), ExecutionStatus::Completed);

        let stopper = composite(&control).child("T").unwrap();
        assert!(stopper
            .core()
            .last_exception()
            .is_some_and(|e| e.is_graceful_termination()));
        let slow = composite(&control).child("S").unwrap();
        assert_eq!(slow.core().cell("Out").unwrap().as_i64(), Some(7));
    }
}
