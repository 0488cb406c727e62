//! Schema grammars, configuration values, paths, and the data codec.
//!
//! The YANG front end is an external collaborator: it compiles schema text
//! into the [`Grammar`] trees registered here. Everything downstream works
//! against this module's types only.

pub mod grammar;
pub mod parse;
pub mod path;
pub mod print;
pub mod value;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

pub use grammar::{
    ArrayGrammar, Grammar, GrammarError, PackedField, PackedLayout, ScalarType, TableGrammar,
    TableVariant,
};
pub use parse::{parse_data, DataError};
pub use path::{normalize_ident, Path, PathError, Segment};
pub use print::print_data;
pub use value::{
    ArrayValue, CompactTable, PackedArray, ScalarValue, TableValue, Value, ValueError,
};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown schema `{name}`")]
    Unknown { name: String },

    #[error("schema `{name}` already registered")]
    AlreadyRegistered { name: String },

    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

/// A named schema: the output contract of the external schema loader.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub grammar: Grammar,
}

impl Schema {
    pub fn new(name: &str, grammar: Grammar) -> Result<Self, SchemaError> {
        validate(&grammar)?;
        Ok(Schema {
            name: name.to_string(),
            grammar,
        })
    }
}

fn validate(grammar: &Grammar) -> Result<(), GrammarError> {
    match grammar {
        Grammar::Scalar(_) => Ok(()),
        Grammar::Struct { fields } => {
            for sub in fields.values() {
                validate(sub)?;
            }
            Ok(())
        }
        Grammar::Array(array) => validate(&array.element),
        Grammar::Table(table) => {
            table.validate()?;
            validate(&table.value)
        }
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Schema>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Schema>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a compiled schema under its name.
///
/// Re-registering the same name replaces the entry; the loader owns name
/// uniqueness.
pub fn register(schema: Schema) -> Arc<Schema> {
    let schema = Arc::new(schema);
    registry()
        .lock()
        .expect("schema registry poisoned")
        .insert(schema.name.clone(), Arc::clone(&schema));
    schema
}

/// Look up a schema by name (the `schema-loader` contract).
pub fn load(name: &str) -> Result<Arc<Schema>, SchemaError> {
    registry()
        .lock()
        .expect("schema registry poisoned")
        .get(name)
        .cloned()
        .ok_or_else(|| SchemaError::Unknown {
            name: name.to_string(),
        })
}
