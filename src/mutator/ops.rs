//! Compiled configuration mutators.
//!
//! `get`, `set`, `add`, and `remove` compile a `(schema, path)` pair into an
//! operation that validates its payload under the sub-grammar and applies it
//! while preserving each node's storage variant. Apply is pure with respect
//! to the input configuration: operations clone, mutate the clone, and
//! return it, so a failed apply leaves the caller's value untouched.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::schema::grammar::{Grammar, PackedLayout};
use crate::schema::parse::{parse_data, DataError};
use crate::schema::path::{self, PathError};
use crate::schema::print::print_data;
use crate::schema::value::{
    generic_lookup, generic_position, ArrayValue, PackedArray, ScalarValue, TableValue, Value,
};
use crate::schema::Schema;

use super::resolver::{self, resolve, ResolveError, Step};

#[derive(Debug, Error)]
pub enum MutatorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad path: {0}")]
    BadPath(String),

    #[error("already-existing entry")]
    AlreadyExists,

    #[error("type mismatch: {0}")]
    TypeMismatch(#[source] DataError),

    #[error(transparent)]
    Path(#[from] PathError),
}

impl MutatorError {
    /// Stable code string carried in RPC error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            MutatorError::NotFound(_) => "not_found",
            MutatorError::BadPath(_) => "bad_path",
            MutatorError::AlreadyExists => "already_existing_entry",
            MutatorError::TypeMismatch(_) => "type_mismatch",
            MutatorError::Path(_) => "bad_path",
        }
    }
}

impl From<ResolveError> for MutatorError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound { .. } | ResolveError::EntryNotFound => {
                MutatorError::NotFound(e.to_string())
            }
            other => MutatorError::BadPath(other.to_string()),
        }
    }
}

impl From<DataError> for MutatorError {
    fn from(e: DataError) -> Self {
        MutatorError::TypeMismatch(e)
    }
}

/// Compiled pure read: resolver composed with the grammar-directed printer.
pub struct GetOp {
    steps: Vec<Step>,
    grammar: Grammar,
}

/// Compile a getter for `(schema, path)`.
pub fn get(schema: &Schema, path_text: &str) -> Result<GetOp, MutatorError> {
    let path = path::parse(path_text)?;
    let resolved = resolve(&schema.grammar, &path)?;
    Ok(GetOp {
        grammar: resolved.grammar.clone(),
        steps: resolved.steps,
    })
}

impl GetOp {
    pub fn apply(&self, config: &Value) -> Result<String, MutatorError> {
        let value = resolver::lookup(config, &self.steps)?;
        Ok(print_data(&self.grammar, &value)?)
    }
}

/// Compiled overwrite at a path.
pub struct SetOp {
    steps: Vec<Step>,
    grammar: Grammar,
}

/// Compile a setter for `(schema, path)`.
///
/// The path either is the root, names a struct child, or selects into a
/// collection with a query; anything else is a bad path.
pub fn set(schema: &Schema, path_text: &str) -> Result<SetOp, MutatorError> {
    let path = path::parse(path_text)?;
    let resolved = resolve(&schema.grammar, &path)?;
    Ok(SetOp {
        grammar: resolved.grammar.clone(),
        steps: resolved.steps,
    })
}

impl SetOp {
    pub fn apply(&self, config: &Value, payload: &str) -> Result<Value, MutatorError> {
        let value = parse_data(&self.grammar, payload)?;
        if self.steps.is_empty() {
            return Ok(value);
        }
        let mut new_config = config.clone();
        let (last, parents) = self.steps.split_last().expect("non-root path");
        mutate_at(&mut new_config, parents, &mut |parent| {
            overwrite(parent, last, &value)
        })?;
        Ok(new_config)
    }
}

/// Compiled collection extension.
#[derive(Debug)]
pub struct AddOp {
    steps: Vec<Step>,
    grammar: Grammar,
}

/// Compile an adder for `(schema, path)`; the path must name an array or
/// table node without a trailing query.
pub fn add(schema: &Schema, path_text: &str) -> Result<AddOp, MutatorError> {
    let path = path::parse(path_text)?;
    if path
        .segments
        .last()
        .is_some_and(|segment| segment.query.is_some())
    {
        return Err(MutatorError::BadPath(
            "add path must name a collection, not an entry".to_string(),
        ));
    }
    let resolved = resolve(&schema.grammar, &path)?;
    if !matches!(resolved.grammar, Grammar::Array(_) | Grammar::Table(_)) {
        return Err(MutatorError::BadPath(format!(
            "add path must name a collection, found {}",
            resolved.grammar.kind()
        )));
    }
    Ok(AddOp {
        grammar: resolved.grammar.clone(),
        steps: resolved.steps,
    })
}

impl AddOp {
    pub fn apply(&self, config: &Value, payload: &str) -> Result<Value, MutatorError> {
        // The payload is a collection of elements parsed under the
        // collection's own grammar, so it arrives in the same storage
        // variant as the target.
        let incoming = parse_data(&self.grammar, payload)?;
        let mut new_config = config.clone();
        mutate_at(&mut new_config, &self.steps, &mut |collection| {
            extend(collection, &incoming)
        })?;
        Ok(new_config)
    }
}

/// Compiled entry removal.
#[derive(Debug)]
pub struct RemoveOp {
    steps: Vec<Step>,
}

/// Compile a remover for `(schema, path)`; the path must end in a query.
pub fn remove(schema: &Schema, path_text: &str) -> Result<RemoveOp, MutatorError> {
    let path = path::parse(path_text)?;
    if !path
        .segments
        .last()
        .is_some_and(|segment| segment.query.is_some())
    {
        return Err(MutatorError::BadPath(
            "remove path must select an entry with a query".to_string(),
        ));
    }
    let resolved = resolve(&schema.grammar, &path)?;
    Ok(RemoveOp {
        steps: resolved.steps,
    })
}

impl RemoveOp {
    pub fn apply(&self, config: &Value) -> Result<Value, MutatorError> {
        let mut new_config = config.clone();
        let (last, parents) = self.steps.split_last().expect("query-terminated path");
        mutate_at(&mut new_config, parents, &mut |collection| {
            delete(collection, last)
        })?;
        Ok(new_config)
    }
}

/// Navigate `steps` mutably and run `f` on the reached node.
///
/// Packed interiors (compact-table values, packed-array elements) are
/// decoded, mutated as structs, and re-encoded into their slot on the way
/// back out.
fn mutate_at(
    value: &mut Value,
    steps: &[Step],
    f: &mut dyn FnMut(&mut Value) -> Result<(), MutatorError>,
) -> Result<(), MutatorError> {
    let Some((step, rest)) = steps.split_first() else {
        return f(value);
    };
    match (step, &mut *value) {
        (Step::Field(name), Value::Struct(fields)) => {
            let child = fields
                .get_mut(name)
                .ok_or_else(|| MutatorError::NotFound(format!("no field `{name}`")))?;
            mutate_at(child, rest, f)
        }
        (Step::Index(index), Value::Array(ArrayValue::Generic(elements))) => {
            let len = elements.len();
            let child = elements
                .get_mut(*index)
                .ok_or_else(|| index_error(*index, len))?;
            mutate_at(child, rest, f)
        }
        (
            Step::PackedIndex { index, layout, bare },
            Value::Array(ArrayValue::Packed(packed)),
        ) => {
            let bytes = packed
                .get(*index)
                .ok_or_else(|| index_error(*index, packed.len()))?;
            let mut decoded = resolver::decode_packed(layout, bytes, *bare)?;
            mutate_at(&mut decoded, rest, f)?;
            let encoded = encode_packed(layout, &decoded, *bare)?;
            packed
                .set(*index, &encoded)
                .map_err(|e| MutatorError::BadPath(e.to_string()))
        }
        (
            Step::CompactKey { key, value_layout },
            Value::Table(TableValue::Compact(compact)),
        ) => {
            let bytes = compact
                .lookup(key)
                .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string()))?;
            let mut decoded = resolver::decode_packed(value_layout, bytes, false)?;
            mutate_at(&mut decoded, rest, f)?;
            let encoded = encode_packed(value_layout, &decoded, false)?;
            compact
                .update(key, &encoded)
                .map_err(|e| MutatorError::BadPath(e.to_string()))
        }
        (Step::KeyedKey(key), Value::Table(TableValue::Keyed(entries))) => {
            let child = entries
                .get_mut(key)
                .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string()))?;
            mutate_at(child, rest, f)
        }
        (Step::StrKey(key), Value::Table(TableValue::StringKeyed(entries))) => {
            let child = entries
                .get_mut(key)
                .ok_or_else(|| MutatorError::NotFound(format!("no entry `{key}`")))?;
            mutate_at(child, rest, f)
        }
        (Step::StructuralKey(key), Value::Table(TableValue::Generic(entries))) => {
            let index = generic_position(entries, key)
                .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string()))?;
            mutate_at(&mut entries[index].1, rest, f)
        }
        _ => Err(MutatorError::BadPath(
            "value does not match its grammar's storage variant".to_string(),
        )),
    }
}

fn index_error(index: usize, len: usize) -> MutatorError {
    MutatorError::NotFound(format!("position {} out of range (length {len})", index + 1))
}

fn encode_packed(
    layout: &PackedLayout,
    value: &Value,
    bare: bool,
) -> Result<Vec<u8>, MutatorError> {
    let scalars = packed_scalars(layout, value, bare)?;
    layout
        .encode(&scalars)
        .map_err(|e| MutatorError::TypeMismatch(DataError::Grammar(e)))
}

fn packed_scalars(
    layout: &PackedLayout,
    value: &Value,
    bare: bool,
) -> Result<BTreeMap<String, ScalarValue>, MutatorError> {
    if bare && layout.fields().len() == 1 {
        let Value::Scalar(scalar) = value else {
            return Err(MutatorError::TypeMismatch(DataError::TypeMismatch {
                expected: "scalar",
                got: value.kind().to_string(),
            }));
        };
        let name = layout.fields()[0].name.clone();
        return Ok(BTreeMap::from([(name, scalar.clone())]));
    }
    let Value::Struct(fields) = value else {
        return Err(MutatorError::TypeMismatch(DataError::TypeMismatch {
            expected: "struct",
            got: value.kind().to_string(),
        }));
    };
    let mut scalars = BTreeMap::new();
    for (name, field) in fields {
        let Value::Scalar(scalar) = field else {
            return Err(MutatorError::TypeMismatch(DataError::TypeMismatch {
                expected: "scalar",
                got: field.kind().to_string(),
            }));
        };
        scalars.insert(name.clone(), scalar.clone());
    }
    Ok(scalars)
}

/// Apply the final step of a set: overwrite a struct child, an array slot,
/// or a table value, asserting the target exists.
fn overwrite(parent: &mut Value, last: &Step, value: &Value) -> Result<(), MutatorError> {
    match (last, parent) {
        (Step::Field(name), Value::Struct(fields)) => {
            fields.insert(name.clone(), value.clone());
            Ok(())
        }
        (Step::Index(index), Value::Array(ArrayValue::Generic(elements))) => {
            let len = elements.len();
            let slot = elements
                .get_mut(*index)
                .ok_or_else(|| index_error(*index, len))?;
            *slot = value.clone();
            Ok(())
        }
        (
            Step::PackedIndex { index, layout, bare },
            Value::Array(ArrayValue::Packed(packed)),
        ) => {
            if packed.get(*index).is_none() {
                return Err(index_error(*index, packed.len()));
            }
            let encoded = encode_packed(layout, value, *bare)?;
            packed
                .set(*index, &encoded)
                .map_err(|e| MutatorError::TypeMismatch(DataError::Value(e)))
        }
        (
            Step::CompactKey { key, value_layout },
            Value::Table(TableValue::Compact(compact)),
        ) => {
            let encoded = encode_packed(value_layout, value, false)?;
            compact
                .update(key, &encoded)
                .map_err(|_| MutatorError::NotFound("no such table entry".to_string()))
        }
        (Step::KeyedKey(key), Value::Table(TableValue::Keyed(entries))) => {
            let slot = entries
                .get_mut(key)
                .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string()))?;
            *slot = value.clone();
            Ok(())
        }
        (Step::StrKey(key), Value::Table(TableValue::StringKeyed(entries))) => {
            let slot = entries
                .get_mut(key)
                .ok_or_else(|| MutatorError::NotFound(format!("no entry `{key}`")))?;
            *slot = value.clone();
            Ok(())
        }
        (Step::StructuralKey(key), Value::Table(TableValue::Generic(entries))) => {
            let index = generic_position(entries, key)
                .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string()))?;
            entries[index].1 = value.clone();
            Ok(())
        }
        _ => Err(MutatorError::BadPath(
            "value does not match its grammar's storage variant".to_string(),
        )),
    }
}

/// Extend a collection with a parsed batch of the same storage variant.
///
/// Tables use two passes (verify no incoming key exists, then insert) so
/// either every element lands or none does. Packed arrays rebuild into a
/// freshly allocated buffer; generic arrays append in place.
fn extend(collection: &mut Value, incoming: &Value) -> Result<(), MutatorError> {
    match (collection, incoming) {
        (Value::Array(ArrayValue::Packed(current)), Value::Array(ArrayValue::Packed(new))) => {
            let mut elements: Vec<Vec<u8>> = current.iter().map(<[u8]>::to_vec).collect();
            elements.extend(new.iter().map(<[u8]>::to_vec));
            let rebuilt = PackedArray::from_elements(current.elem_size(), elements)
                .map_err(|e| MutatorError::TypeMismatch(DataError::Value(e)))?;
            *current = rebuilt;
            Ok(())
        }
        (
            Value::Array(ArrayValue::Generic(current)),
            Value::Array(ArrayValue::Generic(new)),
        ) => {
            current.extend(new.iter().cloned());
            Ok(())
        }
        (
            Value::Table(TableValue::Compact(current)),
            Value::Table(TableValue::Compact(new)),
        ) => {
            for (key, _) in new.iter() {
                if current.lookup(key).is_some() {
                    return Err(MutatorError::AlreadyExists);
                }
            }
            for (key, value) in new.iter() {
                current
                    .add(key, value)
                    .map_err(|e| MutatorError::TypeMismatch(DataError::Value(e)))?;
            }
            Ok(())
        }
        (Value::Table(TableValue::Keyed(current)), Value::Table(TableValue::Keyed(new))) => {
            for key in new.keys() {
                if current.contains_key(key) {
                    return Err(MutatorError::AlreadyExists);
                }
            }
            for (key, value) in new {
                current.insert(key.clone(), value.clone());
            }
            Ok(())
        }
        (
            Value::Table(TableValue::StringKeyed(current)),
            Value::Table(TableValue::StringKeyed(new)),
        ) => {
            for key in new.keys() {
                if current.contains_key(key) {
                    return Err(MutatorError::AlreadyExists);
                }
            }
            for (key, value) in new {
                current.insert(key.clone(), value.clone());
            }
            Ok(())
        }
        (
            Value::Table(TableValue::Generic(current)),
            Value::Table(TableValue::Generic(new)),
        ) => {
            for (key, _) in new {
                if generic_lookup(current, key).is_some() {
                    return Err(MutatorError::AlreadyExists);
                }
            }
            current.extend(new.iter().cloned());
            Ok(())
        }
        _ => Err(MutatorError::BadPath(
            "value does not match its grammar's storage variant".to_string(),
        )),
    }
}

/// Apply the final step of a remove: delete the selected entry.
fn delete(collection: &mut Value, last: &Step) -> Result<(), MutatorError> {
    match (last, collection) {
        (Step::Index(index), Value::Array(ArrayValue::Generic(elements))) => {
            if *index >= elements.len() {
                return Err(index_error(*index, elements.len()));
            }
            elements.remove(*index);
            Ok(())
        }
        (Step::PackedIndex { index, .. }, Value::Array(ArrayValue::Packed(packed))) => {
            let idx = *index;
            let len = packed.len();
            if idx >= len {
                return Err(index_error(idx, len));
            }
            // Rebuild into a fresh buffer, copying around the removed slot.
            let mut elements = Vec::with_capacity(len - 1);
            for (i, element) in packed.iter().enumerate() {
                if i != idx {
                    elements.push(element.to_vec());
                }
            }
            let rebuilt = PackedArray::from_elements(packed.elem_size(), elements)
                .map_err(|e| MutatorError::TypeMismatch(DataError::Value(e)))?;
            *packed = rebuilt;
            Ok(())
        }
        (Step::CompactKey { key, .. }, Value::Table(TableValue::Compact(compact))) => compact
            .remove(key)
            .map_err(|_| MutatorError::NotFound("no such table entry".to_string())),
        (Step::KeyedKey(key), Value::Table(TableValue::Keyed(entries))) => entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string())),
        (Step::StrKey(key), Value::Table(TableValue::StringKeyed(entries))) => entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| MutatorError::NotFound(format!("no entry `{key}`"))),
        (Step::StructuralKey(key), Value::Table(TableValue::Generic(entries))) => {
            let index = generic_position(entries, key)
                .ok_or_else(|| MutatorError::NotFound("no such table entry".to_string()))?;
            entries.remove(index);
            Ok(())
        }
        (Step::Field(_), _) => Err(MutatorError::BadPath(
            "remove path must select an entry with a query".to_string(),
        )),
        _ => Err(MutatorError::BadPath(
            "value does not match its grammar's storage variant".to_string(),
        )),
    }
}
