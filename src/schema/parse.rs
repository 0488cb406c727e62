//! Grammar-directed data parser: JSON text in, typed `Value` out.
//!
//! The grammar decides the storage variant of every collection node, so a
//! parsed value always lands in the representation the dataplane expects.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use thiserror::Error;

use super::grammar::{
    ArrayGrammar, Grammar, GrammarError, PackedLayout, ScalarType, TableGrammar, TableVariant,
};
use super::path::normalize_ident;
use super::value::{
    generic_lookup, ArrayValue, CompactTable, PackedArray, ScalarValue, TableValue, Value,
    ValueError,
};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("malformed data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },

    #[error("missing field `{field}`")]
    MissingField { field: String },

    #[error("unknown field `{field}`")]
    UnknownField { field: String },

    #[error("duplicate entry in collection")]
    DuplicateEntry,

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Parse `text` as a value conforming to `grammar`.
pub fn parse_data(grammar: &Grammar, text: &str) -> Result<Value, DataError> {
    let json: Json = serde_json::from_str(text)?;
    from_json(grammar, &json)
}

/// Convert decoded JSON into a typed value under `grammar`.
pub fn from_json(grammar: &Grammar, json: &Json) -> Result<Value, DataError> {
    match grammar {
        Grammar::Scalar(ty) => Ok(Value::Scalar(scalar_from_json(*ty, json)?)),
        Grammar::Struct { fields } => Ok(Value::Struct(struct_from_json(fields, json)?)),
        Grammar::Array(array) => array_from_json(array, json),
        Grammar::Table(table) => table_from_json(table, json),
    }
}

fn json_kind(json: &Json) -> String {
    match json {
        Json::Null => "null".to_string(),
        Json::Bool(_) => "bool".to_string(),
        Json::Number(_) => "number".to_string(),
        Json::String(_) => "string".to_string(),
        Json::Array(_) => "array".to_string(),
        Json::Object(_) => "object".to_string(),
    }
}

pub(super) fn scalar_from_json(ty: ScalarType, json: &Json) -> Result<ScalarValue, DataError> {
    let mismatch = |expected: &'static str| DataError::TypeMismatch {
        expected,
        got: json_kind(json),
    };
    match ty {
        ScalarType::String => json
            .as_str()
            .map(|s| ScalarValue::String(s.to_string()))
            .ok_or_else(|| mismatch("string")),
        ScalarType::Bool => json
            .as_bool()
            .map(ScalarValue::Bool)
            .ok_or_else(|| mismatch("bool")),
        ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64 => {
            let v = json.as_i64().ok_or_else(|| mismatch("integer"))?;
            // Reuse the literal path for range checking.
            ty.parse_literal(&v.to_string())
                .map_err(DataError::Grammar)
        }
        ScalarType::Uint8 | ScalarType::Uint16 | ScalarType::Uint32 | ScalarType::Uint64 => {
            let v = json.as_u64().ok_or_else(|| mismatch("unsigned integer"))?;
            ty.parse_literal(&v.to_string())
                .map_err(DataError::Grammar)
        }
    }
}

fn as_object(json: &Json) -> Result<&serde_json::Map<String, Json>, DataError> {
    json.as_object().ok_or_else(|| DataError::TypeMismatch {
        expected: "object",
        got: json_kind(json),
    })
}

fn as_array(json: &Json) -> Result<&[Json], DataError> {
    json.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| DataError::TypeMismatch {
            expected: "array",
            got: json_kind(json),
        })
}

fn struct_from_json(
    fields: &BTreeMap<String, Grammar>,
    json: &Json,
) -> Result<BTreeMap<String, Value>, DataError> {
    let object = as_object(json)?;
    let mut normalized: BTreeMap<String, &Json> = BTreeMap::new();
    for (key, value) in object {
        let key = normalize_ident(key);
        if !fields.contains_key(&key) {
            return Err(DataError::UnknownField { field: key });
        }
        normalized.insert(key, value);
    }

    let mut out = BTreeMap::new();
    for (name, sub) in fields {
        let json = normalized
            .get(name)
            .ok_or_else(|| DataError::MissingField {
                field: name.clone(),
            })?;
        out.insert(name.clone(), from_json(sub, json)?);
    }
    Ok(out)
}

/// Encode one packed record from a JSON object (or bare scalar for
/// single-field layouts).
fn packed_record_from_json(layout: &PackedLayout, json: &Json) -> Result<Vec<u8>, DataError> {
    if layout.fields().len() == 1 && !json.is_object() {
        let field = &layout.fields()[0];
        let mut scalars = BTreeMap::new();
        scalars.insert(field.name.clone(), scalar_from_json(field.ty, json)?);
        return Ok(layout.encode(&scalars)?);
    }

    let object = as_object(json)?;
    let mut scalars = BTreeMap::new();
    for (key, value) in object {
        let key = normalize_ident(key);
        let field = layout
            .field(&key)
            .ok_or_else(|| DataError::UnknownField { field: key.clone() })?;
        scalars.insert(key, scalar_from_json(field.ty, value)?);
    }
    Ok(layout.encode(&scalars)?)
}

fn array_from_json(array: &ArrayGrammar, json: &Json) -> Result<Value, DataError> {
    let elements = as_array(json)?;
    match &array.layout {
        Some(layout) => {
            let mut packed = Vec::with_capacity(elements.len());
            for element in elements {
                packed.push(packed_record_from_json(layout, element)?);
            }
            Ok(Value::Array(ArrayValue::Packed(PackedArray::from_elements(
                layout.size(),
                packed,
            )?)))
        }
        None => {
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                out.push(from_json(&array.element, element)?);
            }
            Ok(Value::Array(ArrayValue::Generic(out)))
        }
    }
}

/// Split a row object into (key fields, non-key fields), both ident-normalized.
fn split_row<'j>(
    table: &TableGrammar,
    row: &'j Json,
) -> Result<(BTreeMap<String, &'j Json>, Json), DataError> {
    let object = as_object(row)?;
    let mut keys = BTreeMap::new();
    let mut rest = serde_json::Map::new();
    for (name, value) in object {
        let name = normalize_ident(name);
        if table.key_type(&name).is_some() {
            keys.insert(name, value);
        } else {
            rest.insert(name, value.clone());
        }
    }
    for (name, _) in &table.keys {
        if !keys.contains_key(name) {
            return Err(DataError::MissingField { field: name.clone() });
        }
    }
    Ok((keys, Json::Object(rest)))
}

fn key_scalars(
    table: &TableGrammar,
    keys: &BTreeMap<String, &Json>,
) -> Result<BTreeMap<String, ScalarValue>, DataError> {
    let mut out = BTreeMap::new();
    for (name, ty) in &table.keys {
        let json = keys[name];
        out.insert(name.clone(), scalar_from_json(*ty, json)?);
    }
    Ok(out)
}

fn table_from_json(table: &TableGrammar, json: &Json) -> Result<Value, DataError> {
    let rows = as_array(json)?;
    match table.variant() {
        TableVariant::Compact => {
            let key_layout = table.key_layout.as_ref().expect("compact key layout");
            let value_layout = table.value_layout.as_ref().expect("compact value layout");
            let mut out = CompactTable::new(key_layout.size(), value_layout.size());
            for row in rows {
                let (keys, rest) = split_row(table, row)?;
                let key = key_layout.encode(&key_scalars(table, &keys)?)?;
                let value = packed_record_from_json(value_layout, &rest)?;
                out.add(&key, &value)
                    .map_err(|_| DataError::DuplicateEntry)?;
            }
            Ok(Value::Table(TableValue::Compact(out)))
        }
        TableVariant::Keyed => {
            let key_layout = table.key_layout.as_ref().expect("keyed key layout");
            let mut out: BTreeMap<Box<[u8]>, Value> = BTreeMap::new();
            for row in rows {
                let (keys, rest) = split_row(table, row)?;
                let key = key_layout
                    .encode(&key_scalars(table, &keys)?)?
                    .into_boxed_slice();
                let value = from_json(&table.value, &rest)?;
                if out.insert(key, value).is_some() {
                    return Err(DataError::DuplicateEntry);
                }
            }
            Ok(Value::Table(TableValue::Keyed(out)))
        }
        TableVariant::StringKeyed => {
            let string_key = table.string_key.as_deref().expect("string key");
            let mut out: BTreeMap<String, Value> = BTreeMap::new();
            for row in rows {
                let (keys, rest) = split_row(table, row)?;
                let scalars = key_scalars(table, &keys)?;
                let key = match &scalars[string_key] {
                    ScalarValue::String(s) => s.clone(),
                    _ => unreachable!("validated string column"),
                };
                let value = string_keyed_value(table, string_key, &scalars, &rest)?;
                if out.insert(key, value).is_some() {
                    return Err(DataError::DuplicateEntry);
                }
            }
            Ok(Value::Table(TableValue::StringKeyed(out)))
        }
        TableVariant::Generic => {
            let mut out: Vec<(Value, Value)> = Vec::with_capacity(rows.len());
            for row in rows {
                let (keys, rest) = split_row(table, row)?;
                let scalars = key_scalars(table, &keys)?;
                let key = Value::Struct(
                    scalars
                        .into_iter()
                        .map(|(name, scalar)| (name, Value::Scalar(scalar)))
                        .collect(),
                );
                if generic_lookup(&out, &key).is_some() {
                    return Err(DataError::DuplicateEntry);
                }
                let value = from_json(&table.value, &rest)?;
                out.push((key, value));
            }
            Ok(Value::Table(TableValue::Generic(out)))
        }
    }
}

/// A string-keyed entry stores the remaining key columns alongside the value
/// columns; the projected string itself lives only in the map key.
fn string_keyed_value(
    table: &TableGrammar,
    string_key: &str,
    key_scalars: &BTreeMap<String, ScalarValue>,
    rest: &Json,
) -> Result<Value, DataError> {
    let mut fields = match from_json(&table.value, rest)? {
        Value::Struct(fields) => fields,
        other => {
            return Err(DataError::TypeMismatch {
                expected: "struct",
                got: other.kind().to_string(),
            })
        }
    };
    for (name, scalar) in key_scalars {
        if name != string_key {
            fields.insert(name.clone(), Value::Scalar(scalar.clone()));
        }
    }
    Ok(Value::Struct(fields))
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::{routes_grammar, routes_json};
    use super::*;

    #[test]
    fn parses_into_mandated_variants() {
        let grammar = routes_grammar();
        let value = parse_data(&grammar, &routes_json()).expect("parse");
        let Value::Struct(fields) = &value else {
            panic!("expected struct root");
        };
        assert!(matches!(
            fields["nexthops"],
            Value::Table(TableValue::Compact(_))
        ));
        assert!(matches!(
            fields["filters"],
            Value::Table(TableValue::StringKeyed(_))
        ));
        assert!(matches!(
            fields["weights"],
            Value::Array(ArrayValue::Packed(_))
        ));
        assert!(matches!(
            fields["zones"],
            Value::Table(TableValue::Generic(_))
        ));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let grammar = routes_grammar();
        let mut json: serde_json::Value = serde_json::from_str(&routes_json()).unwrap();
        json.as_object_mut()
            .unwrap()
            .insert("bogus".to_string(), Json::Bool(true));
        let err = from_json(&grammar, &json).unwrap_err();
        assert!(matches!(err, DataError::UnknownField { .. }));
    }

    #[test]
    fn missing_key_field_is_rejected() {
        let grammar = routes_grammar();
        let mut json: serde_json::Value = serde_json::from_str(&routes_json()).unwrap();
        json["nexthops"][0]
            .as_object_mut()
            .unwrap()
            .remove("addr");
        let err = from_json(&grammar, &json).unwrap_err();
        assert!(matches!(err, DataError::MissingField { .. }));
    }

    #[test]
    fn duplicate_table_key_is_rejected() {
        let grammar = routes_grammar();
        let mut json: serde_json::Value = serde_json::from_str(&routes_json()).unwrap();
        let row = json["nexthops"][0].clone();
        json["nexthops"].as_array_mut().unwrap().push(row);
        let err = from_json(&grammar, &json).unwrap_err();
        assert!(matches!(err, DataError::DuplicateEntry));
    }

    #[test]
    fn out_of_range_uint_is_rejected() {
        let grammar = Grammar::Scalar(ScalarType::Uint8);
        assert!(parse_data(&grammar, "300").is_err());
        assert!(parse_data(&grammar, "250").is_ok());
    }
}
