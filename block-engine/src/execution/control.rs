// Execution Control
// Per-occurrence run state shared by basic and composite controls

use crate::cell::ValueCell;
use crate::error::{EngineError, EngineResult};
use crate::execution::activity::ActivityRecord;
use crate::execution::basic::BasicControl;
use crate::execution::composite::CompositeControl;
use crate::execution::context::{BindingDirection, ControlEnv, RunBlockRequest, VariableBinding};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::model::{BlockDefinition, Value};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a finished run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockResult {
    /// State the FSM started in; `None` for composites
    pub from_state: Option<String>,
    pub final_state: Option<String>,
    pub output_events: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExecutionStatus::Idle => "Idle",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
        };
        f.write_str(text)
    }
}

/// Terminal signal; `generation` increments once per finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSignal {
    pub generation: u64,
    pub status: ExecutionStatus,
    /// Run id of the execution that finished last
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct ControlState {
    status: ExecutionStatus,
    exception: Option<EngineError>,
    result: Option<BlockResult>,
    activity: Option<ActivityRecord>,
    run_id: Uuid,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
}

/// Held while a control executes; marks it idle again on drop
pub(crate) struct IdleGuard<'a> {
    idle: &'a watch::Sender<bool>,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.idle.send_modify(|idle| *idle = true);
    }
}

/// State common to both control kinds
pub struct ControlCore {
    definition: Arc<BlockDefinition>,
    label: String,
    env: ControlEnv,
    cells: RwLock<HashMap<String, Arc<ValueCell>>>,
    idle: watch::Sender<bool>,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<ControlState>,
    signal: watch::Sender<RunSignal>,
}

impl ControlCore {
    pub fn new(definition: Arc<BlockDefinition>, label: impl Into<String>, env: ControlEnv) -> Self {
        Self {
            definition,
            label: label.into(),
            env,
            cells: RwLock::new(HashMap::new()),
            idle: watch::channel(true).0,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(ControlState::default()),
            signal: watch::channel(RunSignal::default()).0,
        }
    }

    pub fn definition(&self) -> &Arc<BlockDefinition> {
        &self.definition
    }

    /// Instance id inside a composite, definition id at top level
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn env(&self) -> &ControlEnv {
        &self.env
    }

    /// Cell for a declared variable, created on first access
    pub fn cell(&self, name: &str) -> EngineResult<Arc<ValueCell>> {
        if let Some(cell) = self.cells.read().get(name) {
            return Ok(Arc::clone(cell));
        }

        let variable = self.definition.variable(name).ok_or_else(|| {
            EngineError::definition(format!(
                "block '{}' has no variable '{}'",
                self.label, name
            ))
        })?;

        let mut cells = self.cells.write();
        let cell = cells
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ValueCell::new(variable.clone())));
        Ok(Arc::clone(cell))
    }

    /// Committed values of `names`, read together. Unset cells read as `Null`.
    pub fn snapshot(&self, names: &[&str]) -> EngineResult<HashMap<String, Value>> {
        for name in names {
            self.cell(name)?;
        }

        let cells = self.cells.read();
        Ok(names
            .iter()
            .filter_map(|name| cells.get(*name).map(|cell| (name.to_string(), cell.get())))
            .collect())
    }

    /// Every declared variable as a script sees it
    pub fn script_bindings(&self) -> EngineResult<HashMap<String, Value>> {
        let mut bindings = HashMap::new();
        for variable in self.definition.variables() {
            let cell = self.cell(&variable.name)?;
            let value = if cell.is_set() {
                cell.typed_value()
            } else {
                Value::Null
            };
            bindings.insert(variable.name.clone(), value);
        }
        Ok(bindings)
    }

    /// Stage every value, then commit them all under the map write lock
    pub fn commit_outputs(&self, staged: Vec<(String, Value)>) -> EngineResult<()> {
        let mut targets = Vec::with_capacity(staged.len());
        for (name, value) in staged {
            targets.push((self.cell(&name)?, value));
        }

        let _cells = self.cells.write();
        for (cell, value) in &targets {
            cell.stage(value.clone());
        }
        for (cell, _) in &targets {
            cell.commit();
        }
        Ok(())
    }

    /// Set input-direction bindings; output bindings only need to be declared
    pub fn apply_bindings(&self, bindings: &[VariableBinding]) -> EngineResult<()> {
        for binding in bindings {
            let cell = self.cell(&binding.name)?;
            if let (true, Some(value)) = (binding.direction.is_input(), &binding.value) {
                cell.set(value.clone());
            }
        }
        Ok(())
    }

    /// Values for requested output bindings, or every set output variable
    /// when none were requested
    pub fn output_values(&self, bindings: &[VariableBinding]) -> HashMap<String, Value> {
        let requested: Vec<&str> = bindings
            .iter()
            .filter(|b| matches!(b.direction, BindingDirection::Output | BindingDirection::InOut))
            .map(|b| b.name.as_str())
            .collect();

        let names: Vec<&str> = if requested.is_empty() {
            self.definition
                .variables()
                .iter()
                .filter(|v| v.variable_type.is_output())
                .map(|v| v.name.as_str())
                .collect()
        } else {
            requested
        };

        names
            .into_iter()
            .filter_map(|name| {
                let cell = self.cell(name).ok()?;
                cell.value_if_set()
                    .map(|_| (name.to_string(), cell.typed_value()))
            })
            .collect()
    }

    /// Atomically claim the idle flag
    pub(crate) fn try_acquire(&self) -> Option<IdleGuard<'_>> {
        let mut acquired = false;
        self.idle.send_modify(|idle| {
            if *idle {
                *idle = false;
                acquired = true;
            }
        });
        // Lazily built: dropping an unused guard would mark the control idle
        acquired.then(|| IdleGuard { idle: &self.idle })
    }

    pub fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }

    pub async fn wait_idle(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let mut changes = self.idle.subscribe();
        loop {
            if *changes.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Cancelled);
                    }
                }
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Wait until this control is idle after an execution belonging to
    /// `run_id` has finished. Values left by earlier runs never satisfy it.
    pub async fn wait_run_finished(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> EngineResult<RunSignal> {
        let mut signals = self.signal.subscribe();
        let mut idle = self.idle.subscribe();
        loop {
            let signal = *signals.borrow_and_update();
            let is_idle = *idle.borrow_and_update();
            if is_idle && signal.run_id == Some(run_id) {
                return Ok(signal);
            }
            tokio::select! {
                changed = signals.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Cancelled);
                    }
                }
                changed = idle.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Cancelled);
                    }
                }
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Mutex serializing runners on this control
    pub(crate) fn gate(&self) -> &tokio::sync::Mutex<()> {
        &self.gate
    }

    pub(crate) fn begin_run(&self, request: &RunBlockRequest) {
        {
            let mut state = self.state.lock();
            state.status = ExecutionStatus::Running;
            state.exception = None;
            state.run_id = request.run_id;
            state.started_at = Some(Utc::now());
            state.started = Some(Instant::now());
        }

        tracing::debug!(block = %self.label, run_id = %request.run_id, "block started");
        self.env.progress.send_event(ExecutionEvent::block_started(
            self.label.clone(),
            self.definition.kind_label(),
            request.run_id,
            request.trigger_event.clone(),
        ));
    }

    pub(crate) fn finish_success(&self, result: BlockResult) {
        let events = result.output_events.clone();
        let elapsed = self.record(ExecutionStatus::Completed, Some(result), None);
        self.env
            .progress
            .send_event(ExecutionEvent::block_completed(self.label.clone(), events, elapsed));
    }

    /// Graceful termination keeps the partial result and counts as completed
    pub(crate) fn finish_terminated(&self, partial: BlockResult, error: EngineError) {
        let events = partial.output_events.clone();
        let elapsed = self.record(ExecutionStatus::Completed, Some(partial), Some(error));
        self.env
            .progress
            .send_event(ExecutionEvent::block_completed(self.label.clone(), events, elapsed));
    }

    pub(crate) fn finish_failure(&self, error: EngineError) {
        let message = error.to_string();
        let elapsed = self.record(ExecutionStatus::Failed, None, Some(error));
        self.env
            .progress
            .send_event(ExecutionEvent::block_failed(self.label.clone(), message, elapsed));
    }

    fn record(
        &self,
        status: ExecutionStatus,
        result: Option<BlockResult>,
        exception: Option<EngineError>,
    ) -> std::time::Duration {
        let (elapsed, run_id) = {
            let mut state = self.state.lock();
            let elapsed = state.started.map(|s| s.elapsed()).unwrap_or_default();

            state.activity = Some(ActivityRecord {
                kind_label: self.definition.kind_label(),
                block_id: self.definition.id().to_string(),
                run_id: state.run_id,
                time: state.started_at.unwrap_or_else(Utc::now),
                status,
                run_time_ms: state.started.map(|_| elapsed.as_millis()),
                exception_block: exception
                    .as_ref()
                    .and_then(|e| e.origin_block())
                    .map(str::to_string),
            });
            state.status = status;
            if result.is_some() {
                state.result = result;
            }
            state.exception = exception;
            (elapsed, state.run_id)
        };

        self.signal.send_modify(|signal| {
            signal.generation += 1;
            signal.status = status;
            signal.run_id = Some(run_id);
        });
        elapsed
    }

    /// Record the cancellation of run `run_id` as a timeout instead
    pub(crate) fn mark_timed_out(&self, run_id: Uuid) {
        let mut state = self.state.lock();
        if state.run_id == run_id && state.exception == Some(EngineError::Cancelled) {
            state.exception = Some(EngineError::Timeout);
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    pub fn last_exception(&self) -> Option<EngineError> {
        self.state.lock().exception.clone()
    }

    pub fn last_result(&self) -> Option<BlockResult> {
        self.state.lock().result.clone()
    }

    pub fn last_activity(&self) -> Option<ActivityRecord> {
        self.state.lock().activity.clone()
    }

    /// Receiver that changes exactly once per finished run
    pub fn subscribe(&self) -> watch::Receiver<RunSignal> {
        self.signal.subscribe()
    }
}

impl fmt::Debug for ControlCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlCore")
            .field("block", &self.definition.id())
            .field("label", &self.label)
            .field("status", &self.status())
            .finish()
    }
}

pub type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = EngineResult<BlockResult>> + Send + 'a>>;

/// A runnable occurrence of a block
#[derive(Debug)]
pub enum ExecutionControl {
    Basic(BasicControl),
    Composite(CompositeControl),
}

impl ExecutionControl {
    pub fn new(definition: Arc<BlockDefinition>, label: impl Into<String>, env: ControlEnv) -> Self {
        let is_basic = matches!(definition.as_ref(), BlockDefinition::Basic(_));
        let core = ControlCore::new(definition, label, env);
        if is_basic {
            ExecutionControl::Basic(BasicControl::new(core))
        } else {
            ExecutionControl::Composite(CompositeControl::new(core))
        }
    }

    pub fn core(&self) -> &ControlCore {
        match self {
            ExecutionControl::Basic(control) => control.core(),
            ExecutionControl::Composite(control) => control.core(),
        }
    }

    pub fn definition(&self) -> &Arc<BlockDefinition> {
        self.core().definition()
    }

    /// Run once. Fails with `ConcurrencyViolation` if already running; use
    /// `BlockRunner` to queue behind a running execution instead.
    pub fn execute<'a>(
        &'a self,
        request: &'a RunBlockRequest,
        optimization_scope_id: Option<&'a str>,
    ) -> ExecuteFuture<'a> {
        match self {
            ExecutionControl::Basic(control) => {
                Box::pin(control.execute(request, optimization_scope_id))
            }
            ExecutionControl::Composite(control) => {
                Box::pin(control.execute(request, optimization_scope_id))
            }
        }
    }
}
