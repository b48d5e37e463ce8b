// Execution Events
// Progress reporting for block executions

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while blocks execute
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    BlockStarted {
        block: String,
        kind: &'static str,
        run_id: Uuid,
        trigger: Option<String>,
    },

    /// A basic block moved between states
    TransitionFired {
        block: String,
        from_state: String,
        to_state: String,
        event: String,
    },

    /// A script published an event
    EventPublished { block: String, event: String },

    /// A composite started a sub-block branch
    SubBlockLaunched {
        composite: String,
        instance: String,
        event: String,
    },

    BlockCompleted {
        block: String,
        output_events: Vec<String>,
        duration: Duration,
    },

    BlockFailed {
        block: String,
        error: String,
        duration: Duration,
    },

    /// Diagnostic raised while a run is in progress
    Warning {
        message: String,
        block: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn block_started(
        block: impl Into<String>,
        kind: &'static str,
        run_id: Uuid,
        trigger: Option<String>,
    ) -> Self {
        Self::BlockStarted {
            block: block.into(),
            kind,
            run_id,
            trigger,
        }
    }

    pub fn transition_fired(
        block: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self::TransitionFired {
            block: block.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            event: event.into(),
        }
    }

    pub fn event_published(block: impl Into<String>, event: impl Into<String>) -> Self {
        Self::EventPublished {
            block: block.into(),
            event: event.into(),
        }
    }

    pub fn sub_block_launched(
        composite: impl Into<String>,
        instance: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self::SubBlockLaunched {
            composite: composite.into(),
            instance: instance.into(),
            event: event.into(),
        }
    }

    pub fn block_completed(
        block: impl Into<String>,
        output_events: Vec<String>,
        duration: Duration,
    ) -> Self {
        Self::BlockCompleted {
            block: block.into(),
            output_events,
            duration,
        }
    }

    pub fn block_failed(block: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self::BlockFailed {
            block: block.into(),
            error: error.into(),
            duration,
        }
    }

    pub fn warning(message: impl Into<String>, block: Option<String>) -> Self {
        Self::Warning {
            message: message.into(),
            block,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();
        let run_id = Uuid::new_v4();

        tx.send_event(ExecutionEvent::block_started("Add", "BasicBlock", run_id, None));
        tx.send_event(ExecutionEvent::transition_fired("Add", "Idle", "Idle", "Start"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::BlockStarted { run_id: id, .. } if id == run_id));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ExecutionEvent::TransitionFired { .. }));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        // Should not panic
        tx.send_event(ExecutionEvent::warning("late", None));

        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::warning("nobody listening", None));
    }

    #[test]
    fn test_warning_carries_block() {
        let event = ExecutionEvent::warning("sub-block 'A' failed", Some("Outer".to_string()));
        assert_eq!(
            event,
            ExecutionEvent::Warning {
                message: "sub-block 'A' failed".to_string(),
                block: Some("Outer".to_string()),
            }
        );
    }
}
