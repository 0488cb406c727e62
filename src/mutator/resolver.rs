//! Path resolution: compile a `(grammar, path)` pair into typed traversal
//! steps plus the sub-grammar reached.
//!
//! Queries are validated here (collections only, key fields drawn from the
//! schema's key tuple) and projected into the key form the node's storage
//! variant uses: packed key records, projected strings, or structural keys.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::schema::grammar::{Grammar, GrammarError, PackedLayout, TableGrammar, TableVariant};
use crate::schema::path::{normalize_ident, Path};
use crate::schema::value::{
    generic_lookup, ArrayValue, ScalarValue, TableValue, Value,
};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no such node `{name}`")]
    NotFound { name: String },

    #[error("query on non-collection node `{name}`")]
    QueryOnNonCollection { name: String },

    #[error("`{field}` is not a key field of `{name}`")]
    NotAKeyField { name: String, field: String },

    #[error("query on `{name}` is missing key field `{field}`")]
    MissingKeyField { name: String, field: String },

    #[error("array query must be `position=<1-based index>`")]
    BadPosition,

    #[error("entry not found")]
    EntryNotFound,

    #[error("value does not match its grammar's storage variant")]
    StorageMismatch,

    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

/// One compiled traversal step. Steps carry the layouts they need so they
/// can be applied without consulting the grammar again.
#[derive(Debug, Clone)]
pub enum Step {
    /// Descend into a struct field.
    Field(String),
    /// Index into a generic array (0-based, validated at apply time).
    Index(usize),
    /// Index into a packed array; elements decode through `layout`.
    PackedIndex {
        index: usize,
        layout: PackedLayout,
        bare: bool,
    },
    /// Select a compact-table entry; values decode through `value_layout`.
    CompactKey {
        key: Box<[u8]>,
        value_layout: PackedLayout,
    },
    /// Select a keyed-table entry by its packed key record.
    KeyedKey(Box<[u8]>),
    /// Select a string-keyed entry by its projected string.
    StrKey(String),
    /// Select a generic-table entry by structural key equality.
    StructuralKey(Value),
}

/// A compiled path: traversal steps and the sub-grammar they reach.
#[derive(Debug)]
pub struct Resolved<'g> {
    pub steps: Vec<Step>,
    pub grammar: &'g Grammar,
}

/// Compile `path` against `grammar`.
pub fn resolve<'g>(grammar: &'g Grammar, path: &Path) -> Result<Resolved<'g>, ResolveError> {
    let mut steps = Vec::new();
    let mut current = grammar;

    for segment in &path.segments {
        let Grammar::Struct { fields } = current else {
            return Err(ResolveError::NotFound {
                name: segment.name.clone(),
            });
        };
        current = fields
            .get(&segment.name)
            .ok_or_else(|| ResolveError::NotFound {
                name: segment.name.clone(),
            })?;
        steps.push(Step::Field(segment.name.clone()));

        if let Some(query) = &segment.query {
            let (step, sub) = compile_query(current, &segment.name, query)?;
            steps.push(step);
            current = sub;
        }
    }

    Ok(Resolved {
        steps,
        grammar: current,
    })
}

fn compile_query<'g>(
    node: &'g Grammar,
    name: &str,
    query: &BTreeMap<String, String>,
) -> Result<(Step, &'g Grammar), ResolveError> {
    match node {
        Grammar::Array(array) => {
            let step = compile_position(array.layout.as_ref(), &array.element, query)?;
            Ok((step, &*array.element))
        }
        Grammar::Table(table) => {
            let step = compile_table_key(table, name, query)?;
            Ok((step, &*table.value))
        }
        _ => Err(ResolveError::QueryOnNonCollection {
            name: name.to_string(),
        }),
    }
}

fn compile_position(
    layout: Option<&PackedLayout>,
    element: &Grammar,
    query: &BTreeMap<String, String>,
) -> Result<Step, ResolveError> {
    if query.len() != 1 {
        return Err(ResolveError::BadPosition);
    }
    let position = query.get("position").ok_or(ResolveError::BadPosition)?;
    let position: usize = position.parse().map_err(|_| ResolveError::BadPosition)?;
    if position == 0 {
        return Err(ResolveError::BadPosition);
    }
    // Positions are 1-based on the wire, 0-based from here on.
    let index = position - 1;
    Ok(match layout {
        Some(layout) => Step::PackedIndex {
            index,
            layout: layout.clone(),
            bare: matches!(element, Grammar::Scalar(_)),
        },
        None => Step::Index(index),
    })
}

/// Project a query onto the table's key form by storage variant.
pub(crate) fn compile_table_key(
    table: &TableGrammar,
    name: &str,
    query: &BTreeMap<String, String>,
) -> Result<Step, ResolveError> {
    for field in query.keys() {
        if table.key_type(field).is_none() {
            return Err(ResolveError::NotAKeyField {
                name: name.to_string(),
                field: field.clone(),
            });
        }
    }

    let mut scalars: BTreeMap<String, ScalarValue> = BTreeMap::new();
    for (field, ty) in &table.keys {
        let literal = query
            .get(field)
            .ok_or_else(|| ResolveError::MissingKeyField {
                name: name.to_string(),
                field: field.clone(),
            })?;
        scalars.insert(field.clone(), ty.parse_literal(literal)?);
    }

    Ok(match table.variant() {
        TableVariant::Compact => {
            let key_layout = table.key_layout.as_ref().expect("compact key layout");
            let value_layout = table.value_layout.as_ref().expect("compact value layout");
            Step::CompactKey {
                key: key_layout.encode(&scalars)?.into_boxed_slice(),
                value_layout: value_layout.clone(),
            }
        }
        TableVariant::Keyed => {
            let key_layout = table.key_layout.as_ref().expect("keyed key layout");
            Step::KeyedKey(key_layout.encode(&scalars)?.into_boxed_slice())
        }
        TableVariant::StringKeyed => {
            let field = normalize_ident(table.string_key.as_deref().expect("string key"));
            match &scalars[&field] {
                ScalarValue::String(s) => Step::StrKey(s.clone()),
                _ => unreachable!("validated string column"),
            }
        }
        TableVariant::Generic => Step::StructuralKey(Value::Struct(
            scalars
                .into_iter()
                .map(|(field, scalar)| (field, Value::Scalar(scalar)))
                .collect(),
        )),
    })
}

/// Pure read along compiled steps, decoding packed storage as needed.
pub fn lookup(config: &Value, steps: &[Step]) -> Result<Value, ResolveError> {
    let Some((step, rest)) = steps.split_first() else {
        return Ok(config.clone());
    };
    match (step, config) {
        (Step::Field(name), Value::Struct(fields)) => {
            let child = fields.get(name).ok_or(ResolveError::EntryNotFound)?;
            lookup(child, rest)
        }
        (Step::Index(index), Value::Array(ArrayValue::Generic(elements))) => {
            let child = elements.get(*index).ok_or(ResolveError::EntryNotFound)?;
            lookup(child, rest)
        }
        (
            Step::PackedIndex {
                index,
                layout,
                bare,
            },
            Value::Array(ArrayValue::Packed(packed)),
        ) => {
            let bytes = packed.get(*index).ok_or(ResolveError::EntryNotFound)?;
            let decoded = decode_packed(layout, bytes, *bare)?;
            lookup(&decoded, rest)
        }
        (
            Step::CompactKey { key, value_layout },
            Value::Table(TableValue::Compact(compact)),
        ) => {
            let bytes = compact.lookup(key).ok_or(ResolveError::EntryNotFound)?;
            let decoded = decode_packed(value_layout, bytes, false)?;
            lookup(&decoded, rest)
        }
        (Step::KeyedKey(key), Value::Table(TableValue::Keyed(entries))) => {
            let child = entries.get(key).ok_or(ResolveError::EntryNotFound)?;
            lookup(child, rest)
        }
        (Step::StrKey(key), Value::Table(TableValue::StringKeyed(entries))) => {
            let child = entries.get(key).ok_or(ResolveError::EntryNotFound)?;
            lookup(child, rest)
        }
        (Step::StructuralKey(key), Value::Table(TableValue::Generic(entries))) => {
            let child = generic_lookup(entries, key).ok_or(ResolveError::EntryNotFound)?;
            lookup(child, rest)
        }
        _ => Err(ResolveError::StorageMismatch),
    }
}

pub(crate) fn decode_packed(
    layout: &PackedLayout,
    bytes: &[u8],
    bare: bool,
) -> Result<Value, ResolveError> {
    let scalars = layout.decode(bytes)?;
    if bare && layout.fields().len() == 1 {
        let only = scalars.into_values().next().expect("single field");
        return Ok(Value::Scalar(only));
    }
    Ok(Value::Struct(
        scalars
            .into_iter()
            .map(|(name, scalar)| (name, Value::Scalar(scalar)))
            .collect(),
    ))
}
