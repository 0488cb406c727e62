//! Schema grammar: the structural shape of a configuration node.
//!
//! Each node is a scalar, struct, array, or table. Arrays and tables carry
//! optional packed-record layouts (fixed-size, contiguously laid out
//! key/value records) that select the storage variant the dataplane relies
//! on. The YANG front end that produces these grammars is an external
//! collaborator; this module is its output contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::value::ScalarValue;

#[derive(Debug, Error)]
pub enum GrammarError {
    #[error("packed layouts cannot carry variable-width field `{field}`")]
    VariableWidthPackedField { field: String },

    #[error("packed record field `{field}` missing from value")]
    MissingPackedField { field: String },

    #[error("packed record is {got} bytes, layout expects {expected}")]
    PackedSizeMismatch { expected: usize, got: usize },

    #[error("field `{field}`: {reason}")]
    BadPackedValue { field: String, reason: String },

    #[error("table declares no key columns")]
    EmptyKeyTuple,

    #[error("string_key `{field}` is not in the key tuple")]
    StringKeyNotAKey { field: String },

    #[error("string_key `{field}` must be a string column")]
    StringKeyNotString { field: String },
}

/// Leaf value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarType {
    String,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

impl ScalarType {
    /// Fixed encoded width in bytes, if this type can live in a packed record.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ScalarType::String => None,
            ScalarType::Bool | ScalarType::Int8 | ScalarType::Uint8 => Some(1),
            ScalarType::Int16 | ScalarType::Uint16 => Some(2),
            ScalarType::Int32 | ScalarType::Uint32 => Some(4),
            ScalarType::Int64 | ScalarType::Uint64 => Some(8),
        }
    }

    /// Parse a literal (path query or data text) into a typed scalar.
    pub fn parse_literal(self, text: &str) -> Result<ScalarValue, GrammarError> {
        let bad = |reason: String| GrammarError::BadPackedValue {
            field: String::new(),
            reason,
        };
        match self {
            ScalarType::String => Ok(ScalarValue::String(text.to_string())),
            ScalarType::Bool => match text {
                "true" => Ok(ScalarValue::Bool(true)),
                "false" => Ok(ScalarValue::Bool(false)),
                other => Err(bad(format!("`{other}` is not a boolean"))),
            },
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64 => {
                let v: i64 = text
                    .parse()
                    .map_err(|_| bad(format!("`{text}` is not an integer")))?;
                self.check_signed_range(v).map_err(|r| bad(r))?;
                Ok(ScalarValue::Int(v))
            }
            ScalarType::Uint8 | ScalarType::Uint16 | ScalarType::Uint32 | ScalarType::Uint64 => {
                let v: u64 = text
                    .parse()
                    .map_err(|_| bad(format!("`{text}` is not an unsigned integer")))?;
                self.check_unsigned_range(v).map_err(|r| bad(r))?;
                Ok(ScalarValue::Uint(v))
            }
        }
    }

    fn check_signed_range(self, v: i64) -> Result<(), String> {
        let ok = match self {
            ScalarType::Int8 => i8::try_from(v).is_ok(),
            ScalarType::Int16 => i16::try_from(v).is_ok(),
            ScalarType::Int32 => i32::try_from(v).is_ok(),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("{v} out of range for {self:?}"))
        }
    }

    fn check_unsigned_range(self, v: u64) -> Result<(), String> {
        let ok = match self {
            ScalarType::Uint8 => u8::try_from(v).is_ok(),
            ScalarType::Uint16 => u16::try_from(v).is_ok(),
            ScalarType::Uint32 => u32::try_from(v).is_ok(),
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("{v} out of range for {self:?}"))
        }
    }
}

/// One fixed-width field of a packed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedField {
    pub name: String,
    pub ty: ScalarType,
    pub offset: usize,
}

/// Layout of a fixed-size packed record (a `ctype` storage hint).
///
/// Fields are laid out in declaration order, little-endian, no padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedLayout {
    fields: Vec<PackedField>,
    size: usize,
}

impl PackedLayout {
    pub fn new(fields: &[(&str, ScalarType)]) -> Result<Self, GrammarError> {
        let mut laid_out = Vec::with_capacity(fields.len());
        let mut offset = 0;
        for (name, ty) in fields {
            let width = ty
                .fixed_width()
                .ok_or_else(|| GrammarError::VariableWidthPackedField {
                    field: (*name).to_string(),
                })?;
            laid_out.push(PackedField {
                name: (*name).to_string(),
                ty: *ty,
                offset,
            });
            offset += width;
        }
        Ok(PackedLayout {
            fields: laid_out,
            size: offset,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> &[PackedField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&PackedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Encode named scalars into a packed record.
    pub fn encode(
        &self,
        values: &BTreeMap<String, ScalarValue>,
    ) -> Result<Vec<u8>, GrammarError> {
        let mut buf = vec![0u8; self.size];
        for field in &self.fields {
            let value =
                values
                    .get(&field.name)
                    .ok_or_else(|| GrammarError::MissingPackedField {
                        field: field.name.clone(),
                    })?;
            let width = field.ty.fixed_width().unwrap_or(0);
            let slot = &mut buf[field.offset..field.offset + width];
            encode_scalar(field, value, slot)?;
        }
        Ok(buf)
    }

    /// Decode a packed record back into named scalars.
    pub fn decode(&self, bytes: &[u8]) -> Result<BTreeMap<String, ScalarValue>, GrammarError> {
        if bytes.len() != self.size {
            return Err(GrammarError::PackedSizeMismatch {
                expected: self.size,
                got: bytes.len(),
            });
        }
        let mut out = BTreeMap::new();
        for field in &self.fields {
            let width = field.ty.fixed_width().unwrap_or(0);
            let slot = &bytes[field.offset..field.offset + width];
            out.insert(field.name.clone(), decode_scalar(field.ty, slot));
        }
        Ok(out)
    }
}

fn encode_scalar(
    field: &PackedField,
    value: &ScalarValue,
    slot: &mut [u8],
) -> Result<(), GrammarError> {
    let mismatch = |got: &str| GrammarError::BadPackedValue {
        field: field.name.clone(),
        reason: format!("expected {:?}, got {got}", field.ty),
    };
    match (field.ty, value) {
        (ScalarType::Bool, ScalarValue::Bool(b)) => slot[0] = u8::from(*b),
        (ScalarType::Int8, ScalarValue::Int(v)) => {
            slot.copy_from_slice(&int_checked::<i8>(field, *v)?.to_le_bytes())
        }
        (ScalarType::Int16, ScalarValue::Int(v)) => {
            slot.copy_from_slice(&int_checked::<i16>(field, *v)?.to_le_bytes())
        }
        (ScalarType::Int32, ScalarValue::Int(v)) => {
            slot.copy_from_slice(&int_checked::<i32>(field, *v)?.to_le_bytes())
        }
        (ScalarType::Int64, ScalarValue::Int(v)) => slot.copy_from_slice(&v.to_le_bytes()),
        (ScalarType::Uint8, ScalarValue::Uint(v)) => {
            slot.copy_from_slice(&uint_checked::<u8>(field, *v)?.to_le_bytes())
        }
        (ScalarType::Uint16, ScalarValue::Uint(v)) => {
            slot.copy_from_slice(&uint_checked::<u16>(field, *v)?.to_le_bytes())
        }
        (ScalarType::Uint32, ScalarValue::Uint(v)) => {
            slot.copy_from_slice(&uint_checked::<u32>(field, *v)?.to_le_bytes())
        }
        (ScalarType::Uint64, ScalarValue::Uint(v)) => slot.copy_from_slice(&v.to_le_bytes()),
        (_, ScalarValue::String(_)) => return Err(mismatch("string")),
        (_, ScalarValue::Bool(_)) => return Err(mismatch("bool")),
        (_, ScalarValue::Int(_)) => return Err(mismatch("int")),
        (_, ScalarValue::Uint(_)) => return Err(mismatch("uint")),
    }
    Ok(())
}

fn int_checked<T: TryFrom<i64>>(field: &PackedField, v: i64) -> Result<T, GrammarError> {
    T::try_from(v).map_err(|_| GrammarError::BadPackedValue {
        field: field.name.clone(),
        reason: format!("{v} out of range for {:?}", field.ty),
    })
}

fn uint_checked<T: TryFrom<u64>>(field: &PackedField, v: u64) -> Result<T, GrammarError> {
    T::try_from(v).map_err(|_| GrammarError::BadPackedValue {
        field: field.name.clone(),
        reason: format!("{v} out of range for {:?}", field.ty),
    })
}

fn decode_scalar(ty: ScalarType, slot: &[u8]) -> ScalarValue {
    match ty {
        ScalarType::String => unreachable!("strings are never packed"),
        ScalarType::Bool => ScalarValue::Bool(slot[0] != 0),
        ScalarType::Int8 => ScalarValue::Int(i8::from_le_bytes([slot[0]]) as i64),
        ScalarType::Int16 => ScalarValue::Int(i16::from_le_bytes([slot[0], slot[1]]) as i64),
        ScalarType::Int32 => {
            ScalarValue::Int(i32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as i64)
        }
        ScalarType::Int64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(slot);
            ScalarValue::Int(i64::from_le_bytes(b))
        }
        ScalarType::Uint8 => ScalarValue::Uint(slot[0] as u64),
        ScalarType::Uint16 => ScalarValue::Uint(u16::from_le_bytes([slot[0], slot[1]]) as u64),
        ScalarType::Uint32 => {
            ScalarValue::Uint(u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as u64)
        }
        ScalarType::Uint64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(slot);
            ScalarValue::Uint(u64::from_le_bytes(b))
        }
    }
}

/// Grammar of an array node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayGrammar {
    pub element: Box<Grammar>,
    /// Packed element layout; `Some` selects the contiguous packed variant.
    pub layout: Option<PackedLayout>,
}

/// Grammar of a table node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableGrammar {
    /// Key tuple, in declaration order.
    pub keys: Vec<(String, ScalarType)>,
    /// Struct grammar of the non-key columns.
    pub value: Box<Grammar>,
    /// Packed key layout (`key_ctype`).
    pub key_layout: Option<PackedLayout>,
    /// Packed value layout (`value_ctype`).
    pub value_layout: Option<PackedLayout>,
    /// Name of the key column whose string value keys the table.
    pub string_key: Option<String>,
}

/// The four table storage variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableVariant {
    /// Packed keys and packed values in a specialized hash table.
    Compact,
    /// Packed keys, arbitrary values, keyed by the packed key record.
    Keyed,
    /// Keyed by a string field projected from the key tuple.
    StringKeyed,
    /// Unordered mapping with structural key equality.
    Generic,
}

impl TableGrammar {
    pub fn validate(&self) -> Result<(), GrammarError> {
        if self.keys.is_empty() {
            return Err(GrammarError::EmptyKeyTuple);
        }
        if let Some(name) = &self.string_key {
            let ty = self
                .keys
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, ty)| *ty)
                .ok_or_else(|| GrammarError::StringKeyNotAKey {
                    field: name.clone(),
                })?;
            if ty != ScalarType::String {
                return Err(GrammarError::StringKeyNotString {
                    field: name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn variant(&self) -> TableVariant {
        if self.key_layout.is_some() && self.value_layout.is_some() {
            TableVariant::Compact
        } else if self.string_key.is_some() {
            TableVariant::StringKeyed
        } else if self.key_layout.is_some() {
            TableVariant::Keyed
        } else {
            TableVariant::Generic
        }
    }

    pub fn key_type(&self, name: &str) -> Option<ScalarType> {
        self.keys.iter().find(|(k, _)| k == name).map(|(_, ty)| *ty)
    }
}

/// Structural schema of a configuration node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Grammar {
    Scalar(ScalarType),
    Struct { fields: BTreeMap<String, Grammar> },
    Array(ArrayGrammar),
    Table(TableGrammar),
}

impl Grammar {
    pub fn kind(&self) -> &'static str {
        match self {
            Grammar::Scalar(_) => "scalar",
            Grammar::Struct { .. } => "struct",
            Grammar::Array(_) => "array",
            Grammar::Table(_) => "table",
        }
    }
}
