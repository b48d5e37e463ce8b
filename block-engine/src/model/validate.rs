// Definition Validation
// Structural checks run by the catalog before definitions are shared

use crate::model::definition::{BasicBlockDef, BlockDefinition, CompositeBlockDef};

use std::collections::HashSet;
use std::fmt;

/// Error type for invalid block definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionError {
    pub message: String,
    pub kind: DefinitionErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionErrorKind {
    /// Two definitions share an id
    DuplicateDefinition,
    /// Reference to a definition id the catalog does not hold
    UnknownDefinition,
    /// Chart references an undeclared state or has no initial state
    InvalidChart,
    /// Guard or action names a function that cannot be resolved
    UnknownFunction,
    /// Event or connection names an undeclared variable
    UnknownVariable,
    /// Connection names an undeclared event
    UnknownEvent,
    /// Connection names a block instance the composite does not declare
    UnknownInstance,
    /// Two instances of one composite share an id
    DuplicateInstance,
    /// A composite contains itself, directly or transitively
    CyclicComposition,
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "definition error: {}", self.message)
    }
}

impl std::error::Error for DefinitionError {}

impl DefinitionError {
    pub fn new(kind: DefinitionErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn unknown_definition(message: impl Into<String>) -> Self {
        Self::new(DefinitionErrorKind::UnknownDefinition, message)
    }

    pub fn cyclic(message: impl Into<String>) -> Self {
        Self::new(DefinitionErrorKind::CyclicComposition, message)
    }
}

/// Validate the events of any definition: carried variables must be declared
pub fn validate_events(def: &BlockDefinition) -> Result<(), DefinitionError> {
    for event in def.events() {
        for variable in &event.variables {
            if def.variable(variable).is_none() {
                return Err(DefinitionError::new(
                    DefinitionErrorKind::UnknownVariable,
                    format!(
                        "event '{}' of block '{}' carries undeclared variable '{}'",
                        event.name,
                        def.id(),
                        variable
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Validate a basic block's chart. Imports must already be mapped.
pub fn validate_basic(def: &BasicBlockDef) -> Result<(), DefinitionError> {
    let chart = &def.execution_control_chart;
    let invalid = |message: String| DefinitionError::new(DefinitionErrorKind::InvalidChart, message);

    if chart.initial_state.is_empty() {
        return Err(invalid(format!("block '{}' has no initial state", def.id)));
    }
    if !chart.has_state(&chart.initial_state) {
        return Err(invalid(format!(
            "initial state '{}' of block '{}' is not declared",
            chart.initial_state, def.id
        )));
    }

    let mut seen = HashSet::new();
    for state in &chart.states {
        if !seen.insert(state.name.as_str()) {
            return Err(invalid(format!(
                "state '{}' is declared twice in block '{}'",
                state.name, def.id
            )));
        }
    }

    for (index, transition) in chart.transitions.iter().enumerate() {
        for state in [&transition.from_state, &transition.to_state] {
            if !chart.has_state(state) {
                return Err(invalid(format!(
                    "transition #{} of block '{}' references undeclared state '{}'",
                    index, def.id, state
                )));
            }
        }

        let function_ids = transition
            .condition
            .iter()
            .chain(transition.actions.iter());
        for id in function_ids {
            if def.function(id).is_none() {
                return Err(DefinitionError::new(
                    DefinitionErrorKind::UnknownFunction,
                    format!(
                        "transition '{}' -> '{}' of block '{}' references unknown function '{}'",
                        transition.from_state, transition.to_state, def.id, id
                    ),
                ));
            }
        }
    }

    Ok(())
}

/// Validate a composite's wiring. Children must already be mapped.
pub fn validate_composite(def: &CompositeBlockDef) -> Result<(), DefinitionError> {
    let mut ids = HashSet::new();
    for instance in &def.blocks {
        if !ids.insert(instance.id.as_str()) {
            return Err(DefinitionError::new(
                DefinitionErrorKind::DuplicateInstance,
                format!(
                    "block instance '{}' is declared twice in composite '{}'",
                    instance.id, def.id
                ),
            ));
        }
    }

    let unknown_instance = |id: &str| {
        DefinitionError::new(
            DefinitionErrorKind::UnknownInstance,
            format!(
                "composite '{}' wires unknown block instance '{}'",
                def.id, id
            ),
        )
    };

    let has_own_event = |name: &str| def.events.iter().any(|e| e.name == name);
    let has_own_variable = |name: &str| def.variables.iter().any(|v| v.name == name);

    for connection in &def.event_connections {
        let ends = [
            (&connection.source_block_id, &connection.source_event),
            (&connection.target_block_id, &connection.target_event),
        ];
        for (block, event) in ends {
            let declared = match block {
                None => has_own_event(event),
                Some(id) => {
                    let child = def
                        .child_definitions
                        .get(id)
                        .ok_or_else(|| unknown_instance(id))?;
                    child.event(event).is_some()
                }
            };
            if !declared {
                return Err(DefinitionError::new(
                    DefinitionErrorKind::UnknownEvent,
                    format!(
                        "composite '{}' wires undeclared event '{}' on '{}'",
                        def.id,
                        event,
                        block.as_deref().unwrap_or("<boundary>")
                    ),
                ));
            }
        }
    }

    for connection in &def.data_connections {
        let ends = [
            (&connection.source_block_id, &connection.source_variable),
            (&connection.target_block_id, &connection.target_variable),
        ];
        for (block, variable) in ends {
            let declared = match block {
                None => has_own_variable(variable),
                Some(id) => {
                    let child = def
                        .child_definitions
                        .get(id)
                        .ok_or_else(|| unknown_instance(id))?;
                    child.variable(variable).is_some()
                }
            };
            if !declared {
                return Err(DefinitionError::new(
                    DefinitionErrorKind::UnknownVariable,
                    format!(
                        "composite '{}' wires undeclared variable '{}' on '{}'",
                        def.id,
                        variable,
                        block.as_deref().unwrap_or("<boundary>")
                    ),
                ));
            }
        }
    }

    Ok(())
}
