// Block Definition Models
// Static schema for basic (FSM) blocks and composite (graph) blocks

use crate::model::value::{DataType, Value};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Reserved trigger name for transitions that need no external event
pub const DIRECT_EVENT: &str = "$direct";

fn direct_event() -> String {
    DIRECT_EVENT.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum VariableType {
    #[default]
    Input,
    Output,
    InOut,
    Internal,
}

impl VariableType {
    pub fn is_input(&self) -> bool {
        matches!(self, VariableType::Input | VariableType::InOut)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, VariableType::Output | VariableType::InOut)
    }
}

/// A named, typed slot declared by a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,

    #[serde(default)]
    pub data_type: DataType,

    #[serde(default)]
    pub variable_type: VariableType,

    #[serde(default)]
    pub default_value: Option<Value>,

    /// Type name for reference-typed (object) bindings
    #[serde(default)]
    pub object_type: Option<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>, data_type: DataType, variable_type: VariableType) -> Self {
        Self {
            name: name.into(),
            data_type,
            variable_type,
            default_value: None,
            object_type: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Named event a block consumes or publishes, with the variables it carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEvent {
    pub name: String,

    #[serde(default)]
    pub is_input: bool,

    #[serde(default)]
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStateTransition {
    pub from_state: String,
    pub to_state: String,

    /// Event that fires this transition; defaults to the direct sentinel
    #[serde(default = "direct_event")]
    pub trigger_event: String,

    /// Function id of a boolean guard script
    #[serde(default)]
    pub condition: Option<String>,

    /// Function ids run in order when the transition is taken
    #[serde(default)]
    pub actions: Vec<String>,

    #[serde(default)]
    pub default_output_events: Vec<String>,
}

impl BlockStateTransition {
    pub fn is_direct(&self) -> bool {
        self.trigger_event == DIRECT_EVENT
    }
}

/// Execution Control Chart: the FSM of a basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionControlChart {
    #[serde(default)]
    pub states: Vec<BlockState>,

    #[serde(default)]
    pub transitions: Vec<BlockStateTransition>,

    pub initial_state: String,
}

impl ExecutionControlChart {
    pub fn has_state(&self, name: &str) -> bool {
        self.states.iter().any(|s| s.name == name)
    }
}

/// Which runtime family executes a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Interpreted block-script
    #[default]
    Script,
    /// Host-compiled function registered by name
    Native,
}

/// A named script owned by a basic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDef {
    pub id: String,

    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Script text, or the registered name for native functions
    pub source: String,
}

impl FunctionDef {
    pub fn script(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runtime: RuntimeKind::Script,
            source: source.into(),
        }
    }

    pub fn native(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runtime: RuntimeKind::Native,
            source: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicBlockDef {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub variables: Vec<Variable>,

    #[serde(default)]
    pub events: Vec<BlockEvent>,

    #[serde(default)]
    pub functions: Vec<FunctionDef>,

    pub execution_control_chart: ExecutionControlChart,

    /// Blocks whose functions this block may call
    #[serde(default)]
    pub import_block_ids: Vec<String>,

    #[serde(default)]
    pub default_trigger_event: Option<String>,

    /// Functions exported by imported blocks, filled in by `map_definitions`
    #[serde(skip)]
    pub imported_functions: Vec<FunctionDef>,
}

impl BasicBlockDef {
    /// Own functions shadow imported ones
    pub fn function(&self, id: &str) -> Option<&FunctionDef> {
        self.functions
            .iter()
            .chain(self.imported_functions.iter())
            .find(|f| f.id == id)
    }

    pub fn object_types(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter_map(|v| v.object_type.clone())
            .collect()
    }
}

/// A sub-block placed inside a composite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInstance {
    pub id: String,
    pub definition_id: String,

    #[serde(default)]
    pub display_name: Option<String>,
}

/// Event wiring; a `None` block id is the composite boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventConnection {
    #[serde(default)]
    pub source_block_id: Option<String>,
    pub source_event: String,

    #[serde(default)]
    pub target_block_id: Option<String>,
    pub target_event: String,
}

/// Data wiring; a `None` block id is the composite boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConnection {
    #[serde(default)]
    pub source_block_id: Option<String>,
    pub source_variable: String,

    #[serde(default)]
    pub target_block_id: Option<String>,
    pub target_variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeBlockDef {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub variables: Vec<Variable>,

    #[serde(default)]
    pub events: Vec<BlockEvent>,

    #[serde(default)]
    pub blocks: Vec<BlockInstance>,

    #[serde(default)]
    pub event_connections: Vec<EventConnection>,

    #[serde(default)]
    pub data_connections: Vec<DataConnection>,

    /// Additional definition ids this composite depends on
    #[serde(default)]
    pub references: Vec<String>,

    #[serde(default)]
    pub default_trigger_event: Option<String>,

    /// Resolved definitions keyed by instance id, filled in by `map_definitions`
    #[serde(skip)]
    pub child_definitions: HashMap<String, Arc<BlockDefinition>>,
}

impl CompositeBlockDef {
    pub fn instance(&self, id: &str) -> Option<&BlockInstance> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Event connections leaving `source` (None = boundary) on `event`
    pub fn connections_from<'a>(
        &'a self,
        source: Option<&'a str>,
        event: &'a str,
    ) -> impl Iterator<Item = &'a EventConnection> + 'a {
        self.event_connections
            .iter()
            .filter(move |c| c.source_block_id.as_deref() == source && c.source_event == event)
    }

    /// The data connection feeding `variable` of `target` (None = boundary)
    pub fn data_source(&self, target: Option<&str>, variable: &str) -> Option<&DataConnection> {
        self.data_connections
            .iter()
            .find(|c| c.target_block_id.as_deref() == target && c.target_variable == variable)
    }

    /// Data connections terminating at the composite's own outputs
    pub fn boundary_outputs(&self) -> impl Iterator<Item = &DataConnection> {
        self.data_connections
            .iter()
            .filter(|c| c.target_block_id.is_none())
    }
}

/// Either kind of block definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockDefinition {
    Basic(BasicBlockDef),
    Composite(CompositeBlockDef),
}

impl BlockDefinition {
    pub fn id(&self) -> &str {
        match self {
            BlockDefinition::Basic(def) => &def.id,
            BlockDefinition::Composite(def) => &def.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BlockDefinition::Basic(def) => &def.name,
            BlockDefinition::Composite(def) => &def.name,
        }
    }

    pub fn variables(&self) -> &[Variable] {
        match self {
            BlockDefinition::Basic(def) => &def.variables,
            BlockDefinition::Composite(def) => &def.variables,
        }
    }

    pub fn events(&self) -> &[BlockEvent] {
        match self {
            BlockDefinition::Basic(def) => &def.events,
            BlockDefinition::Composite(def) => &def.events,
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables().iter().find(|v| v.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&BlockEvent> {
        self.events().iter().find(|e| e.name == name)
    }

    /// Explicit trigger, else the declared default, else the first input event
    pub fn resolve_trigger(&self, explicit: Option<&str>) -> Option<String> {
        if let Some(event) = explicit {
            return Some(event.to_string());
        }
        let declared = match self {
            BlockDefinition::Basic(def) => def.default_trigger_event.as_ref(),
            BlockDefinition::Composite(def) => def.default_trigger_event.as_ref(),
        };
        declared.cloned().or_else(|| {
            self.events()
                .iter()
                .find(|e| e.is_input)
                .map(|e| e.name.clone())
        })
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            BlockDefinition::Basic(_) => "BasicBlock",
            BlockDefinition::Composite(_) => "CompositeBlock",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_block() -> BlockDefinition {
        let yaml = r#"
kind: basic
id: Add
variables:
  - name: X
    dataType: int32
  - name: Y
    dataType: int32
  - name: Result
    dataType: int32
    variableType: output
events:
  - name: Start
    isInput: true
    variables: [X, Y]
  - name: Completed
functions:
  - id: compute
    source: "Result = X + Y"
executionControlChart:
  initialState: Idle
  states:
    - name: Idle
  transitions:
    - fromState: Idle
      toState: Idle
      triggerEvent: Start
      actions: [compute]
      defaultOutputEvents: [Completed]
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_deserialize_basic_block() {
        let def = add_block();
        assert_eq!(def.id(), "Add");
        assert_eq!(def.kind_label(), "BasicBlock");
        assert_eq!(def.variables().len(), 3);
        assert_eq!(def.variable("Result").unwrap().variable_type, VariableType::Output);
        assert_eq!(def.variable("X").unwrap().data_type, DataType::Int32);

        let BlockDefinition::Basic(basic) = &def else {
            panic!("expected basic block");
        };
        assert_eq!(basic.execution_control_chart.transitions[0].trigger_event, "Start");
        assert!(basic.function("compute").is_some());
        assert!(basic.function("missing").is_none());
    }

    #[test]
    fn test_transition_defaults_to_direct() {
        let yaml = "fromState: A\ntoState: B\n";
        let transition: BlockStateTransition = serde_yaml::from_str(yaml).unwrap();
        assert!(transition.is_direct());
        assert!(transition.actions.is_empty());
    }

    #[test]
    fn test_resolve_trigger() {
        let def = add_block();
        assert_eq!(def.resolve_trigger(Some("Other")).as_deref(), Some("Other"));
        // No declared default: first input event
        assert_eq!(def.resolve_trigger(None).as_deref(), Some("Start"));
    }

    #[test]
    fn test_composite_connection_lookup() {
        let yaml = r#"
kind: composite
id: Pair
blocks:
  - id: A
    definitionId: Add
eventConnections:
  - sourceEvent: Start
    targetBlockId: A
    targetEvent: Start
  - sourceBlockId: A
    sourceEvent: Completed
    targetEvent: Completed
dataConnections:
  - sourceVariable: X
    targetBlockId: A
    targetVariable: X
  - sourceBlockId: A
    sourceVariable: Result
    targetVariable: Result
"#;
        let def: BlockDefinition = serde_yaml::from_str(yaml).unwrap();
        let BlockDefinition::Composite(composite) = def else {
            panic!("expected composite block");
        };

        let initial: Vec<_> = composite.connections_from(None, "Start").collect();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].target_block_id.as_deref(), Some("A"));

        let source = composite.data_source(Some("A"), "X").unwrap();
        assert!(source.source_block_id.is_none());
        assert_eq!(composite.boundary_outputs().count(), 1);
    }
}
