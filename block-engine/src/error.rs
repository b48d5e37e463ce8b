// Engine Errors
// Failure taxonomy shared by controls, runners and runtimes

use crate::model::DefinitionError;

use thiserror::Error;

/// Errors raised while defining or executing blocks.
///
/// `Clone` so a control can keep the last failure as its stored exception
/// while also returning it to the caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// A script could not be parsed or a native function is not registered
    #[error("Compilation error in block '{block}', function '{function}': {message}")]
    Compilation {
        block: String,
        function: String,
        message: String,
    },

    /// A script failed while running
    #[error("Runtime error in block '{block}' ({context}): {message}")]
    Runtime {
        block: String,
        context: String,
        message: String,
    },

    /// No transition or connection matched the trigger
    #[error("Routing error in block '{block}': {message}")]
    Routing { block: String, message: String },

    /// A script asked the block to stop; the partial result is kept
    #[error("Block '{block}' terminated: {reason}")]
    GracefulTermination { block: String, reason: String },

    /// `execute` was entered while the control was already running
    #[error("Block '{block}' is already executing")]
    ConcurrencyViolation { block: String },

    #[error("Invalid definition: {0}")]
    Definition(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution timed out")]
    Timeout,

    /// Definition document could not be decoded
    #[error("Catalog error: {0}")]
    Catalog(String),
}

impl EngineError {
    pub fn routing(block: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Routing {
            block: block.into(),
            message: message.into(),
        }
    }

    pub fn definition(message: impl Into<String>) -> Self {
        EngineError::Definition(message.into())
    }

    /// Label of the block the failure originated in, if it has one
    pub fn origin_block(&self) -> Option<&str> {
        match self {
            EngineError::Compilation { block, .. }
            | EngineError::Runtime { block, .. }
            | EngineError::Routing { block, .. }
            | EngineError::GracefulTermination { block, .. }
            | EngineError::ConcurrencyViolation { block } => Some(block),
            _ => None,
        }
    }

    pub fn is_graceful_termination(&self) -> bool {
        matches!(self, EngineError::GracefulTermination { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled | EngineError::Timeout)
    }
}

impl From<DefinitionError> for EngineError {
    fn from(err: DefinitionError) -> Self {
        EngineError::Definition(err.message)
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DefinitionErrorKind;

    #[test]
    fn test_origin_block() {
        let err = EngineError::routing("Add", "transition not found");
        assert_eq!(err.origin_block(), Some("Add"));
        assert_eq!(
            err.to_string(),
            "Routing error in block 'Add': transition not found"
        );

        assert_eq!(EngineError::Cancelled.origin_block(), None);
    }

    #[test]
    fn test_graceful_termination_flag() {
        let err = EngineError::GracefulTermination {
            block: "Loop".to_string(),
            reason: "limit reached".to_string(),
        };
        assert!(err.is_graceful_termination());
        assert!(!EngineError::Timeout.is_graceful_termination());
    }

    #[test]
    fn test_from_definition_error() {
        let err: EngineError =
            DefinitionError::new(DefinitionErrorKind::UnknownDefinition, "no such block").into();
        assert_eq!(err, EngineError::Definition("no such block".to_string()));
    }
}
