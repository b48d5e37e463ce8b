// Execution Context
// Run requests, variable bindings and the environment shared by controls

use crate::execution::events::ProgressSender;
use crate::model::Value;
use crate::runtime::{OptimizationScope, RuntimeRegistry};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingDirection {
    Input,
    Output,
    InOut,
}

impl BindingDirection {
    pub fn is_input(&self) -> bool {
        matches!(self, BindingDirection::Input | BindingDirection::InOut)
    }
}

/// A caller-supplied value for one block variable
#[derive(Debug, Clone, PartialEq)]
pub struct VariableBinding {
    pub name: String,
    pub value: Option<Value>,
    pub direction: BindingDirection,
}

impl VariableBinding {
    pub fn input(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            direction: BindingDirection::Input,
        }
    }

    /// Request an output back in `RunOutcome::outputs`
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            direction: BindingDirection::Output,
        }
    }
}

/// One request to run a block
#[derive(Debug, Clone)]
pub struct RunBlockRequest {
    pub run_id: Uuid,
    pub bindings: Vec<VariableBinding>,
    pub trigger_event: Option<String>,
    pub cancellation: CancellationToken,
    /// Scopes pre-opened by the caller, kept alive for the request
    pub optimization_scopes: Arc<Vec<OptimizationScope>>,
    pub optimization_scope_id: Option<String>,
}

impl RunBlockRequest {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            bindings: Vec::new(),
            trigger_event: None,
            cancellation: CancellationToken::new(),
            optimization_scopes: Arc::new(Vec::new()),
            optimization_scope_id: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.push(VariableBinding::input(name, value));
        self
    }

    pub fn with_binding(mut self, binding: VariableBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_trigger(mut self, event: impl Into<String>) -> Self {
        self.trigger_event = Some(event.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Reuse runtime caches under `id`, holding them open via `registry`
    pub fn with_optimization_scope(mut self, id: impl Into<String>, registry: &RuntimeRegistry) -> Self {
        let id = id.into();
        self.optimization_scopes = Arc::new(registry.open_scope(&id));
        self.optimization_scope_id = Some(id);
        self
    }

    /// Request for a sub-block: same run, token and scopes, new trigger
    pub fn for_child(&self, trigger_event: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id,
            bindings: Vec::new(),
            trigger_event: Some(trigger_event.into()),
            cancellation: self.cancellation.clone(),
            optimization_scopes: Arc::clone(&self.optimization_scopes),
            optimization_scope_id: self.optimization_scope_id.clone(),
        }
    }
}

impl Default for RunBlockRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Services every control needs while executing
#[derive(Debug, Clone)]
pub struct ControlEnv {
    pub runtimes: Arc<RuntimeRegistry>,
    pub progress: Option<ProgressSender>,
}

impl ControlEnv {
    pub fn new(runtimes: Arc<RuntimeRegistry>) -> Self {
        Self {
            runtimes,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }
}
