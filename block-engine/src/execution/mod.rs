// Execution Module
// Controls, runner and progress reporting for running blocks

pub mod activity;
pub mod basic;
pub mod composite;
pub mod context;
pub mod control;
pub mod events;
pub mod runner;

// Re-export key types
pub use activity::ActivityRecord;
pub use basic::BasicControl;
pub use composite::CompositeControl;
pub use context::{BindingDirection, ControlEnv, RunBlockRequest, VariableBinding};
pub use control::{BlockResult, ControlCore, ExecutionControl, ExecutionStatus, RunSignal};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use runner::BlockRunner;
