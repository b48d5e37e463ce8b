// Block Engine
// Entry point tying the catalog, runtimes and runner together

use crate::error::{EngineError, EngineResult};
use crate::execution::{
    ActivityRecord, BlockResult, BlockRunner, ControlEnv, ExecutionControl, ProgressSender,
    RunBlockRequest,
};
use crate::model::{BlockDefinitionCatalog, Value};
use crate::runtime::{OptimizationScope, RuntimeRegistry};

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum top-level runs in flight (0 = unlimited)
    pub max_concurrent_runs: usize,
    /// Applied to every run on top of the request's own token
    pub default_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 0,
            default_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> EngineResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| EngineError::Catalog(e.to_string()))
    }

    fn timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Everything one top-level run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub result: EngineResult<BlockResult>,
    /// Output variable values after the run
    pub outputs: HashMap<String, Value>,
    pub activity: Option<ActivityRecord>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

/// Runs blocks from a mapped catalog
pub struct BlockEngine {
    catalog: Arc<BlockDefinitionCatalog>,
    runtimes: Arc<RuntimeRegistry>,
    config: EngineConfig,
    progress: Option<ProgressSender>,
    admission: Option<Arc<Semaphore>>,
}

impl BlockEngine {
    /// `catalog` must already have been through `map_definitions`
    pub fn new(catalog: BlockDefinitionCatalog, runtimes: RuntimeRegistry) -> Self {
        Self {
            catalog: Arc::new(catalog),
            runtimes: Arc::new(runtimes),
            config: EngineConfig::default(),
            progress: None,
            admission: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.admission = match config.max_concurrent_runs {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };
        self.config = config;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn catalog(&self) -> &BlockDefinitionCatalog {
        &self.catalog
    }

    pub fn runtimes(&self) -> &RuntimeRegistry {
        &self.runtimes
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Top-level control for a mapped definition
    pub fn create_control(&self, block_id: &str) -> EngineResult<Arc<ExecutionControl>> {
        let definition = self.catalog.get(block_id).ok_or_else(|| {
            EngineError::definition(format!("block '{}' is not mapped in the catalog", block_id))
        })?;

        let mut env = ControlEnv::new(Arc::clone(&self.runtimes));
        if let Some(progress) = &self.progress {
            env = env.with_progress(progress.clone());
        }
        Ok(Arc::new(ExecutionControl::new(definition, block_id, env)))
    }

    /// Pre-open an optimization scope on every runtime
    pub fn optimization_scopes(&self, id: &str) -> Vec<OptimizationScope> {
        self.runtimes.open_scope(id)
    }

    /// Run `control` to completion, queueing behind any run in progress
    pub async fn run(&self, control: &ExecutionControl, request: RunBlockRequest) -> RunOutcome {
        let run_id = request.run_id;
        let block = control.core().label().to_string();

        let _permit = match &self.admission {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
                    _ = request.cancellation.cancelled() => None,
                };
                match acquired {
                    Some(permit) => Some(permit),
                    None => return self.outcome(control, &request, Err(EngineError::Cancelled)),
                }
            }
            None => None,
        };

        // Child token so a timeout never cancels the caller's own token
        let token = request.cancellation.child_token();
        let request = RunBlockRequest {
            cancellation: token.clone(),
            ..request
        };

        info!(block = %block, run_id = %run_id, "run started");

        let scope_id = request.optimization_scope_id.as_deref();
        let result = match self.config.timeout() {
            Some(limit) => {
                let run = BlockRunner::run(&request, control, scope_id);
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::time::sleep(limit) => {
                        token.cancel();
                        match run.await {
                            Err(EngineError::Cancelled) => {
                                control.core().mark_timed_out(run_id);
                                Err(EngineError::Timeout)
                            }
                            other => other,
                        }
                    }
                }
            }
            None => BlockRunner::run(&request, control, scope_id).await,
        };

        match &result {
            Ok(done) => info!(
                block = %block,
                run_id = %run_id,
                events = ?done.output_events,
                "run completed"
            ),
            Err(error) if error.is_graceful_termination() => {
                info!(block = %block, run_id = %run_id, %error, "run terminated")
            }
            Err(error) => warn!(block = %block, run_id = %run_id, %error, "run failed"),
        }

        self.outcome(control, &request, result)
    }

    fn outcome(
        &self,
        control: &ExecutionControl,
        request: &RunBlockRequest,
        result: EngineResult<BlockResult>,
    ) -> RunOutcome {
        RunOutcome {
            run_id: request.run_id,
            result,
            outputs: control.core().output_values(&request.bindings),
            activity: control.core().last_activity(),
        }
    }
}
