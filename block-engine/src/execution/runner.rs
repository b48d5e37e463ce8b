// Block Runner
// Queues a run behind any execution already in progress on a control

use crate::error::{EngineError, EngineResult};
use crate::execution::context::RunBlockRequest;
use crate::execution::control::{BlockResult, ExecutionControl};

pub struct BlockRunner;

impl BlockRunner {
    /// Wait until the control is idle, then execute it. Every wait observes
    /// the request's cancellation token.
    pub async fn run(
        request: &RunBlockRequest,
        control: &ExecutionControl,
        optimization_scope_id: Option<&str>,
    ) -> EngineResult<BlockResult> {
        let core = control.core();
        let token = &request.cancellation;

        loop {
            core.wait_idle(token).await?;

            let _gate = tokio::select! {
                guard = core.gate().lock() => guard,
                _ = token.cancelled() => return Err(EngineError::Cancelled),
            };

            // A direct `execute` may have claimed the control meanwhile
            if core.is_idle() {
                return control.execute(request, optimization_scope_id).await;
            }
        }
    }
}
