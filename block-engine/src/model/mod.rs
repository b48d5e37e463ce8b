// Block Model
// Definitions, values and the catalog that resolves them

pub mod catalog;
pub mod definition;
pub mod validate;
pub mod value;

pub use catalog::BlockDefinitionCatalog;
pub use definition::*;
pub use validate::{DefinitionError, DefinitionErrorKind};
pub use value::{DataType, Value};
