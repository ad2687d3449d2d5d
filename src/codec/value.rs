//! Explicit per-service argument schemas
//!
//! Every service declares the ordered list of typed fields it takes and the
//! type it returns. Arguments travel as [`Value`]s and are checked against the
//! schema on both sides, so the wire contract is visible in one place.

use super::{Codec, CodecError, Wire};
use serde::{Deserialize, Serialize};

/// Wire type of a single field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Str,
    Bytes,
    /// Fixed tuple, encoded as the concatenation of its members
    Tuple(Vec<FieldType>),
}

/// A dynamically typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
}

impl Value {
    /// The field type this value encodes as
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::I8(_) => FieldType::I8,
            Value::U8(_) => FieldType::U8,
            Value::I16(_) => FieldType::I16,
            Value::U16(_) => FieldType::U16,
            Value::I32(_) => FieldType::I32,
            Value::U32(_) => FieldType::U32,
            Value::I64(_) => FieldType::I64,
            Value::U64(_) => FieldType::U64,
            Value::F32(_) => FieldType::F32,
            Value::F64(_) => FieldType::F64,
            Value::Str(_) => FieldType::Str,
            Value::Bytes(_) => FieldType::Bytes,
            Value::Tuple(items) => FieldType::Tuple(items.iter().map(Value::field_type).collect()),
        }
    }

    pub fn encode(&self, codec: &mut Codec) -> Result<(), CodecError> {
        match self {
            Value::Bool(v) => v.encode(codec),
            Value::I8(v) => v.encode(codec),
            Value::U8(v) => v.encode(codec),
            Value::I16(v) => v.encode(codec),
            Value::U16(v) => v.encode(codec),
            Value::I32(v) => v.encode(codec),
            Value::U32(v) => v.encode(codec),
            Value::I64(v) => v.encode(codec),
            Value::U64(v) => v.encode(codec),
            Value::F32(v) => v.encode(codec),
            Value::F64(v) => v.encode(codec),
            Value::Str(v) => v.encode(codec),
            Value::Bytes(v) => v.encode(codec),
            Value::Tuple(items) => items.iter().try_for_each(|item| item.encode(codec)),
        }
    }

    /// Decode one value of the given type
    pub fn decode(codec: &mut Codec, ty: &FieldType) -> Result<Value, CodecError> {
        Ok(match ty {
            FieldType::Bool => Value::Bool(codec.read()?),
            FieldType::I8 => Value::I8(codec.read()?),
            FieldType::U8 => Value::U8(codec.read()?),
            FieldType::I16 => Value::I16(codec.read()?),
            FieldType::U16 => Value::U16(codec.read()?),
            FieldType::I32 => Value::I32(codec.read()?),
            FieldType::U32 => Value::U32(codec.read()?),
            FieldType::I64 => Value::I64(codec.read()?),
            FieldType::U64 => Value::U64(codec.read()?),
            FieldType::F32 => Value::F32(codec.read()?),
            FieldType::F64 => Value::F64(codec.read()?),
            FieldType::Str => Value::Str(codec.read()?),
            FieldType::Bytes => Value::Bytes(codec.read()?),
            FieldType::Tuple(members) => Value::Tuple(
                members
                    .iter()
                    .map(|member| Value::decode(codec, member))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_tuple(self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

/// Ordered argument list of a service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldType>,
}

impl Schema {
    pub fn new(fields: Vec<FieldType>) -> Self {
        Self { fields }
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Check arity and field types of an argument list
    pub fn check(&self, values: &[Value]) -> Result<(), CodecError> {
        if values.len() != self.fields.len() {
            return Err(CodecError::SchemaMismatch(format!(
                "expected {} arguments, got {}",
                self.fields.len(),
                values.len()
            )));
        }
        for (idx, (value, field)) in values.iter().zip(&self.fields).enumerate() {
            let actual = value.field_type();
            if &actual != field {
                return Err(CodecError::SchemaMismatch(format!(
                    "argument {} is {:?}, expected {:?}",
                    idx, actual, field
                )));
            }
        }
        Ok(())
    }

    /// Encode an argument list after checking it against the schema
    pub fn encode(&self, values: &[Value], codec: &mut Codec) -> Result<(), CodecError> {
        self.check(values)?;
        values.iter().try_for_each(|value| value.encode(codec))
    }

    /// Decode exactly `arity` values from the cursor
    pub fn decode(&self, codec: &mut Codec) -> Result<Vec<Value>, CodecError> {
        self.fields
            .iter()
            .map(|field| Value::decode(codec, field))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            FieldType::Str,
            FieldType::U32,
            FieldType::Bytes,
            FieldType::Tuple(vec![FieldType::I32, FieldType::Bytes]),
        ])
    }

    fn sample_values() -> Vec<Value> {
        vec![
            Value::Str("enclave".into()),
            Value::U32(7),
            Value::Bytes(vec![1, 2, 3]),
            Value::Tuple(vec![Value::I32(-1), Value::Bytes(Vec::new())]),
        ]
    }

    #[test]
    fn test_schema_roundtrip() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let schema = sample_schema();
            let mut codec = Codec::with_order(order);
            schema.encode(&sample_values(), &mut codec).unwrap();

            let mut reader = Codec::from_bytes(codec.into_bytes(), order);
            assert_eq!(schema.decode(&mut reader).unwrap(), sample_values());
            assert!(reader.is_eof());
        }
    }

    #[test]
    fn test_schema_matches_static_encoding() {
        let mut dynamic = Codec::new();
        Schema::new(vec![FieldType::I32, FieldType::Str])
            .encode(&[Value::I32(42), Value::Str("hi".into())], &mut dynamic)
            .unwrap();

        let mut fixed = Codec::new();
        fixed.write(&(42i32, String::from("hi"))).unwrap();

        assert_eq!(dynamic.as_bytes(), fixed.as_bytes());
    }

    #[test]
    fn test_arity_mismatch() {
        let schema = Schema::new(vec![FieldType::I32]);
        let mut codec = Codec::new();
        let err = schema.encode(&[], &mut codec).unwrap_err();
        assert!(matches!(err, CodecError::SchemaMismatch(_)));
    }

    #[test]
    fn test_type_mismatch() {
        let schema = Schema::new(vec![FieldType::I32]);
        let mut codec = Codec::new();
        assert!(schema.encode(&[Value::U32(1)], &mut codec).is_err());
        assert!(codec.is_empty());
    }

    #[test]
    fn test_decode_short_buffer() {
        let schema = Schema::new(vec![FieldType::I32, FieldType::I32]);
        let mut codec = Codec::from_bytes(vec![1, 0, 0, 0], ByteOrder::Little);
        assert!(matches!(
            schema.decode(&mut codec),
            Err(CodecError::Truncated { .. })
        ));
    }
}
