// Block Definition Catalog
// Explicit registry of block definitions, resolved in dependency order

use crate::error::{EngineError, EngineResult};
use crate::model::definition::{BlockDefinition, FunctionDef};
use crate::model::validate::{
    validate_basic, validate_composite, validate_events, DefinitionError, DefinitionErrorKind,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Holds raw definitions until `map_definitions` resolves them into shared,
/// read-only `Arc`s. Only mapped definitions are visible through `get`.
#[derive(Debug, Default)]
pub struct BlockDefinitionCatalog {
    pending: Vec<BlockDefinition>,
    resolved: HashMap<String, Arc<BlockDefinition>>,
}

impl BlockDefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML list of definitions, then map them
    pub fn from_yaml_str(yaml: &str) -> EngineResult<Self> {
        let definitions: Vec<BlockDefinition> =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Catalog(e.to_string()))?;

        let mut catalog = Self::new();
        for definition in definitions {
            catalog.insert(definition)?;
        }
        catalog.map_definitions()?;
        Ok(catalog)
    }

    pub fn insert(&mut self, definition: BlockDefinition) -> Result<(), DefinitionError> {
        if self.contains(definition.id()) {
            return Err(DefinitionError::new(
                DefinitionErrorKind::DuplicateDefinition,
                format!("definition '{}' is already registered", definition.id()),
            ));
        }
        self.pending.push(definition);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resolved.contains_key(id) || self.pending.iter().any(|d| d.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<BlockDefinition>> {
        self.resolved.get(id).cloned()
    }

    /// Ids of every mapped definition
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resolved.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Resolve child definitions and imported functions of every pending
    /// definition, then validate them. Pending definitions are kept if any
    /// of them fails, so the caller can fix the catalog and retry.
    pub fn map_definitions(&mut self) -> Result<(), DefinitionError> {
        let raw: HashMap<String, BlockDefinition> = self
            .pending
            .iter()
            .map(|d| (d.id().to_string(), d.clone()))
            .collect();

        let mut resolver = Resolver {
            raw: &raw,
            resolved: self.resolved.clone(),
            in_progress: HashSet::new(),
        };

        for definition in &self.pending {
            resolver.resolve(definition.id())?;
        }

        self.resolved = resolver.resolved;
        self.pending.clear();
        Ok(())
    }
}

struct Resolver<'a> {
    raw: &'a HashMap<String, BlockDefinition>,
    resolved: HashMap<String, Arc<BlockDefinition>>,
    in_progress: HashSet<String>,
}

impl Resolver<'_> {
    /// Depth-first resolution; a definition met again while still on the
    /// stack means the composition is cyclic.
    fn resolve(&mut self, id: &str) -> Result<Arc<BlockDefinition>, DefinitionError> {
        if let Some(done) = self.resolved.get(id) {
            return Ok(Arc::clone(done));
        }

        let raw_definitions = self.raw;
        let raw = raw_definitions.get(id).ok_or_else(|| {
            DefinitionError::unknown_definition(format!("definition '{}' is not registered", id))
        })?;

        if !self.in_progress.insert(id.to_string()) {
            return Err(DefinitionError::cyclic(format!(
                "definition '{}' contains itself",
                id
            )));
        }

        let mut definition = raw.clone();
        match &mut definition {
            BlockDefinition::Basic(basic) => {
                for import_id in &basic.import_block_ids {
                    let functions = self.exported_functions(import_id, &basic.id)?;
                    basic.imported_functions.extend(functions);
                }
                validate_basic(basic)?;
            }
            BlockDefinition::Composite(composite) => {
                for instance in &composite.blocks {
                    let child = self.resolve(&instance.definition_id)?;
                    composite
                        .child_definitions
                        .insert(instance.id.clone(), child);
                }
                for reference in &composite.references {
                    self.resolve(reference)?;
                }
                validate_composite(composite)?;
            }
        }
        validate_events(&definition)?;

        self.in_progress.remove(id);
        let shared = Arc::new(definition);
        self.resolved.insert(id.to_string(), Arc::clone(&shared));
        Ok(shared)
    }

    /// Functions an imported basic block exports. Imports are not
    /// transitive, so mutual imports between two blocks are fine.
    fn exported_functions(
        &self,
        import_id: &str,
        importer: &str,
    ) -> Result<Vec<FunctionDef>, DefinitionError> {
        let imported = self
            .resolved
            .get(import_id)
            .map(|d| d.as_ref())
            .or_else(|| self.raw.get(import_id))
            .ok_or_else(|| {
                DefinitionError::unknown_definition(format!(
                    "block '{}' imports unknown block '{}'",
                    importer, import_id
                ))
            })?;

        match imported {
            BlockDefinition::Basic(def) => Ok(def.functions.clone()),
            BlockDefinition::Composite(_) => Err(DefinitionError::unknown_definition(format!(
                "block '{}' imports composite '{}', only basic blocks export functions",
                importer, import_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_AND_PAIR: &str = r#"
- kind: composite
  id: Pair
  events:
    - name: Start
      isInput: true
  blocks:
    - id: First
      definitionId: Add
  eventConnections:
    - sourceEvent: Start
      targetBlockId: First
      targetEvent: Start
- kind: basic
  id: Add
  importBlockIds: [MathLib]
  variables:
    - name: X
      dataType: int32
  events:
    - name: Start
      isInput: true
      variables: [X]
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
    transitions:
      - fromState: Idle
        toState: Idle
        triggerEvent: Start
        actions: [double]
- kind: basic
  id: MathLib
  functions:
    - id: double
      source: "X = X * 2"
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
"#;

    #[test]
    fn test_from_yaml_resolves_children_and_imports() {
        let catalog = BlockDefinitionCatalog::from_yaml_str(ADD_AND_PAIR).unwrap();
        assert_eq!(catalog.len(), 3);

        let pair = catalog.get("Pair").unwrap();
        let BlockDefinition::Composite(composite) = pair.as_ref() else {
            panic!("expected composite");
        };
        let child = composite.child_definitions.get("First").unwrap();
        assert_eq!(child.id(), "Add");

        let add = catalog.get("Add").unwrap();
        let BlockDefinition::Basic(basic) = add.as_ref() else {
            panic!("expected basic");
        };
        assert_eq!(basic.function("double").unwrap().source, "X = X * 2");
    }

    #[test]
    fn test_unknown_child_definition() {
        let yaml = r#"
- kind: composite
  id: Broken
  blocks:
    - id: A
      definitionId: Missing
"#;
        let err = BlockDefinitionCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_cyclic_composition_detected() {
        let yaml = r#"
- kind: composite
  id: Outer
  blocks:
    - id: I
      definitionId: Inner
- kind: composite
  id: Inner
  blocks:
    - id: O
      definitionId: Outer
"#;
        let definitions: Vec<BlockDefinition> = serde_yaml::from_str(yaml).unwrap();
        let mut catalog = BlockDefinitionCatalog::new();
        for definition in definitions {
            catalog.insert(definition).unwrap();
        }
        let err = catalog.map_definitions().unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::CyclicComposition);
        assert!(catalog.get("Outer").is_none());
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let definitions: Vec<BlockDefinition> = serde_yaml::from_str(ADD_AND_PAIR).unwrap();
        let mut catalog = BlockDefinitionCatalog::new();
        catalog.insert(definitions[1].clone()).unwrap();
        let err = catalog.insert(definitions[1].clone()).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::DuplicateDefinition);
    }

    #[test]
    fn test_event_with_undeclared_variable() {
        let yaml = r#"
- kind: basic
  id: Sloppy
  events:
    - name: Start
      isInput: true
      variables: [Ghost]
  executionControlChart:
    initialState: Idle
    states:
      - name: Idle
"#;
        let err = BlockDefinitionCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }

    #[test]
    fn test_malformed_yaml_is_catalog_error() {
        let err = BlockDefinitionCatalog::from_yaml_str("- kind: [").unwrap_err();
        assert!(matches!(err, EngineError::Catalog(_)));
    }
}
