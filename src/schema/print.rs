//! Grammar-directed printer: typed `Value` in, canonical JSON text out.
//!
//! Object keys are emitted in sorted order and table rows in key order, so
//! printing the same configuration twice yields identical bytes.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use super::grammar::{ArrayGrammar, Grammar, PackedLayout, TableGrammar, TableVariant};
use super::parse::DataError;
use super::value::{ArrayValue, ScalarValue, TableValue, Value};

/// Print `value` under `grammar` as canonical JSON.
pub fn print_data(grammar: &Grammar, value: &Value) -> Result<String, DataError> {
    let json = to_json(grammar, value)?;
    Ok(serde_json::to_string(&json)?)
}

/// Convert a typed value back to JSON under `grammar`.
pub fn to_json(grammar: &Grammar, value: &Value) -> Result<Json, DataError> {
    match (grammar, value) {
        (Grammar::Scalar(_), Value::Scalar(scalar)) => Ok(scalar_to_json(scalar)),
        (Grammar::Struct { fields }, Value::Struct(values)) => {
            let mut out = Map::new();
            for (name, sub) in fields {
                let value = values.get(name).ok_or_else(|| DataError::MissingField {
                    field: name.clone(),
                })?;
                out.insert(name.clone(), to_json(sub, value)?);
            }
            Ok(Json::Object(out))
        }
        (Grammar::Array(array), Value::Array(storage)) => array_to_json(array, storage),
        (Grammar::Table(table), Value::Table(storage)) => table_to_json(table, storage),
        (grammar, value) => Err(DataError::TypeMismatch {
            expected: grammar.kind(),
            got: value.kind().to_string(),
        }),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Json {
    match scalar {
        ScalarValue::String(s) => Json::String(s.clone()),
        ScalarValue::Bool(b) => Json::Bool(*b),
        ScalarValue::Int(v) => Json::from(*v),
        ScalarValue::Uint(v) => Json::from(*v),
    }
}

/// Decode one packed record to JSON: an object, or a bare scalar for
/// single-field layouts over a scalar element grammar.
fn packed_record_to_json(
    layout: &PackedLayout,
    bytes: &[u8],
    bare_scalar: bool,
) -> Result<Json, DataError> {
    let scalars = layout.decode(bytes)?;
    if bare_scalar && layout.fields().len() == 1 {
        let only = scalars.values().next().expect("single field");
        return Ok(scalar_to_json(only));
    }
    Ok(scalars_to_object(&scalars))
}

fn scalars_to_object(scalars: &BTreeMap<String, ScalarValue>) -> Json {
    let mut out = Map::new();
    for (name, scalar) in scalars {
        out.insert(name.clone(), scalar_to_json(scalar));
    }
    Json::Object(out)
}

fn array_to_json(array: &ArrayGrammar, storage: &ArrayValue) -> Result<Json, DataError> {
    match (&array.layout, storage) {
        (Some(layout), ArrayValue::Packed(packed)) => {
            let bare = matches!(*array.element, Grammar::Scalar(_));
            let mut out = Vec::with_capacity(packed.len());
            for element in packed.iter() {
                out.push(packed_record_to_json(layout, element, bare)?);
            }
            Ok(Json::Array(out))
        }
        (None, ArrayValue::Generic(elements)) => {
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                out.push(to_json(&array.element, element)?);
            }
            Ok(Json::Array(out))
        }
        (_, storage) => Err(DataError::TypeMismatch {
            expected: "array storage matching grammar",
            got: match storage {
                ArrayValue::Packed(_) => "packed array".to_string(),
                ArrayValue::Generic(_) => "generic array".to_string(),
            },
        }),
    }
}

fn merge_into(row: &mut Map<String, Json>, json: Json) -> Result<(), DataError> {
    match json {
        Json::Object(fields) => {
            for (name, value) in fields {
                row.insert(name, value);
            }
            Ok(())
        }
        other => Err(DataError::TypeMismatch {
            expected: "object",
            got: other.to_string(),
        }),
    }
}

fn table_to_json(table: &TableGrammar, storage: &TableValue) -> Result<Json, DataError> {
    let mut rows = Vec::new();
    match (table.variant(), storage) {
        (TableVariant::Compact, TableValue::Compact(compact)) => {
            let key_layout = table.key_layout.as_ref().expect("compact key layout");
            let value_layout = table.value_layout.as_ref().expect("compact value layout");
            for (key, value) in compact.sorted_entries() {
                let mut row = Map::new();
                merge_into(&mut row, packed_record_to_json(key_layout, key, false)?)?;
                merge_into(&mut row, packed_record_to_json(value_layout, value, false)?)?;
                rows.push(Json::Object(row));
            }
        }
        (TableVariant::Keyed, TableValue::Keyed(entries)) => {
            let key_layout = table.key_layout.as_ref().expect("keyed key layout");
            for (key, value) in entries {
                let mut row = Map::new();
                merge_into(&mut row, packed_record_to_json(key_layout, key, false)?)?;
                merge_into(&mut row, to_json(&table.value, value)?)?;
                rows.push(Json::Object(row));
            }
        }
        (TableVariant::StringKeyed, TableValue::StringKeyed(entries)) => {
            let string_key = table.string_key.as_deref().expect("string key");
            for (key, value) in entries {
                let mut row = Map::new();
                row.insert(string_key.to_string(), Json::String(key.clone()));
                merge_into(&mut row, string_keyed_entry_to_json(table, value)?)?;
                rows.push(Json::Object(row));
            }
        }
        (TableVariant::Generic, TableValue::Generic(entries)) => {
            for (key, value) in entries {
                let mut row = Map::new();
                let Value::Struct(key_fields) = key else {
                    return Err(DataError::TypeMismatch {
                        expected: "struct key",
                        got: key.kind().to_string(),
                    });
                };
                for (name, scalar) in key_fields {
                    let Value::Scalar(scalar) = scalar else {
                        return Err(DataError::TypeMismatch {
                            expected: "scalar key field",
                            got: scalar.kind().to_string(),
                        });
                    };
                    row.insert(name.clone(), scalar_to_json(scalar));
                }
                merge_into(&mut row, to_json(&table.value, value)?)?;
                rows.push(Json::Object(row));
            }
        }
        (_, storage) => {
            return Err(DataError::TypeMismatch {
                expected: "table storage matching grammar",
                got: format!("{storage:?}"),
            })
        }
    }
    Ok(Json::Array(rows))
}

/// A string-keyed entry holds the non-projected key columns inline; print
/// them with their key types, the rest under the value grammar.
fn string_keyed_entry_to_json(table: &TableGrammar, value: &Value) -> Result<Json, DataError> {
    let Value::Struct(fields) = value else {
        return Err(DataError::TypeMismatch {
            expected: "struct",
            got: value.kind().to_string(),
        });
    };
    let mut row = Map::new();
    let mut rest = BTreeMap::new();
    for (name, field) in fields {
        if table.key_type(name).is_some() {
            let Value::Scalar(scalar) = field else {
                return Err(DataError::TypeMismatch {
                    expected: "scalar key field",
                    got: field.kind().to_string(),
                });
            };
            row.insert(name.clone(), scalar_to_json(scalar));
        } else {
            rest.insert(name.clone(), field.clone());
        }
    }
    merge_into(&mut row, to_json(&table.value, &Value::Struct(rest))?)?;
    Ok(Json::Object(row))
}
