// Block Engine Library
// Executes basic (state machine) and composite (graph) function blocks

pub mod cell;
pub mod engine;
pub mod error;
pub mod execution;
pub mod model;
pub mod runtime;
pub mod script;

// Re-export commonly used types
pub use cell::ValueCell;
pub use engine::{BlockEngine, EngineConfig, RunOutcome};
pub use error::{EngineError, EngineResult};

// Re-export model types
pub use model::{
    BasicBlockDef, BlockDefinition, BlockDefinitionCatalog, BlockEvent, CompositeBlockDef,
    DataType, DefinitionError, DefinitionErrorKind, FunctionDef, RuntimeKind, Value, Variable,
    VariableType, DIRECT_EVENT,
};

// Re-export execution types
pub use execution::{
    progress_channel, ActivityRecord, BindingDirection, BlockResult, BlockRunner,
    ExecutionControl, ExecutionEvent, ExecutionStatus, ProgressReceiver, ProgressSender,
    RunBlockRequest, VariableBinding,
};

// Re-export runtime types
pub use runtime::{
    FunctionRuntime, NativeRuntime, OptimizationScope, RuntimeRegistry, ScriptError, ScriptScope,
    ScriptRuntime,
};
