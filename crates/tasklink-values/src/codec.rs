//! Record encoding for value lists.
//!
//! Every value is a record:
//! ```text
//! ┌─────────┬──────────┬──────────────┐
//! │ Tag     │ Length   │ Body         │
//! │ u16 LE  │ u32 LE   │ Length bytes │
//! └─────────┴──────────┴──────────────┘
//! ```
//! Null is a record with [`NULL_TAG`] and an empty body. An array is a
//! record with [`ARRAY_TAG`] whose 4-byte body is the element count as an
//! `i32`, immediately followed by that many records.

use bytes::{Buf, BufMut};

use crate::error::{CodecError, Result};
use crate::schema::{ARRAY_TAG, NULL_TAG, ScalarKind, Schema, Tag, TypeKey};
use crate::value::Value;

/// Tag plus length prefix.
pub const RECORD_HEADER_SIZE: usize = 6;

/// Arrays nested deeper than this are rejected by both encode and decode.
pub const MAX_NESTING: usize = 64;

/// Encode a list of values into a single byte sequence.
pub fn encode(schema: &Schema, values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for value in values {
        encode_value(schema, value, &mut out, 0)?;
    }
    Ok(out)
}

/// Decode records until the input is exhausted.
pub fn decode(schema: &Schema, mut input: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    while input.has_remaining() {
        values.push(decode_value(schema, &mut input, 0)?);
    }
    Ok(values)
}

fn put_header(out: &mut Vec<u8>, tag: Tag, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| CodecError::RecordTooLong(len))?;
    out.put_u16_le(tag);
    out.put_u32_le(len);
    Ok(())
}

fn encode_value(schema: &Schema, value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<()> {
    match value {
        Value::Null => put_header(out, NULL_TAG, 0),
        Value::Array(items) => {
            if depth >= MAX_NESTING {
                return Err(CodecError::NestingTooDeep(MAX_NESTING));
            }
            let count =
                i32::try_from(items.len()).map_err(|_| CodecError::ArrayTooLong(items.len()))?;
            put_header(out, ARRAY_TAG, 4)?;
            out.put_i32_le(count);
            for item in items {
                encode_value(schema, item, out, depth + 1)?;
            }
            Ok(())
        }
        Value::Opaque { type_name, data } => {
            let tag = schema
                .named_tag(type_name)
                .ok_or_else(|| CodecError::UnregisteredType(format!("named:{}", type_name)))?;
            put_header(out, tag, data.len())?;
            out.put_slice(data);
            Ok(())
        }
        scalar => {
            // Every remaining variant is a built-in scalar.
            let Some(kind) = scalar.scalar_kind() else {
                return Err(CodecError::UnregisteredType(format!("{:?}", scalar)));
            };
            let tag = schema
                .scalar_tag(kind)
                .ok_or_else(|| CodecError::UnregisteredType(kind.name().to_string()))?;
            encode_scalar(scalar, tag, out)
        }
    }
}

fn encode_scalar(value: &Value, tag: Tag, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Bool(v) => {
            put_header(out, tag, 1)?;
            out.put_u8(u8::from(*v));
        }
        Value::I8(v) => {
            put_header(out, tag, 1)?;
            out.put_i8(*v);
        }
        Value::U8(v) => {
            put_header(out, tag, 1)?;
            out.put_u8(*v);
        }
        Value::I16(v) => {
            put_header(out, tag, 2)?;
            out.put_i16_le(*v);
        }
        Value::U16(v) => {
            put_header(out, tag, 2)?;
            out.put_u16_le(*v);
        }
        Value::I32(v) => {
            put_header(out, tag, 4)?;
            out.put_i32_le(*v);
        }
        Value::U32(v) => {
            put_header(out, tag, 4)?;
            out.put_u32_le(*v);
        }
        Value::I64(v) => {
            put_header(out, tag, 8)?;
            out.put_i64_le(*v);
        }
        Value::U64(v) => {
            put_header(out, tag, 8)?;
            out.put_u64_le(*v);
        }
        Value::F32(v) => {
            put_header(out, tag, 4)?;
            out.put_f32_le(*v);
        }
        Value::F64(v) => {
            put_header(out, tag, 8)?;
            out.put_f64_le(*v);
        }
        Value::Char(v) => {
            put_header(out, tag, 4)?;
            out.put_u32_le(u32::from(*v));
        }
        Value::String(v) => {
            put_header(out, tag, v.len())?;
            out.put_slice(v.as_bytes());
        }
        Value::Bytes(v) => {
            put_header(out, tag, v.len())?;
            out.put_slice(v);
        }
        Value::Null | Value::Array(_) | Value::Opaque { .. } => {
            return Err(CodecError::UnregisteredType(format!("{:?}", value)));
        }
    }
    Ok(())
}

fn ensure(input: &[u8], needed: usize) -> Result<()> {
    if input.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: input.remaining(),
        });
    }
    Ok(())
}

fn decode_value<'a>(schema: &Schema, input: &mut &'a [u8], depth: usize) -> Result<Value> {
    ensure(input, RECORD_HEADER_SIZE)?;
    let tag = input.get_u16_le();
    let len = input.get_u32_le() as usize;
    ensure(input, len)?;
    let whole: &'a [u8] = *input;
    let (body, rest) = whole.split_at(len);
    *input = rest;

    match tag {
        NULL_TAG => {
            if !body.is_empty() {
                return Err(CodecError::malformed("null", "non-empty body"));
            }
            Ok(Value::Null)
        }
        ARRAY_TAG => {
            if depth >= MAX_NESTING {
                return Err(CodecError::TooDeep(MAX_NESTING));
            }
            let mut body = body;
            if body.len() != 4 {
                return Err(CodecError::malformed(
                    "array",
                    format!("count field is {} bytes", body.len()),
                ));
            }
            let count = body.get_i32_le();
            if count < 0 {
                return Err(CodecError::NegativeArrayLength(count));
            }
            let count = count as usize;
            // Every element needs at least a header; don't trust the count for allocation.
            let mut items = Vec::with_capacity(count.min(input.remaining() / RECORD_HEADER_SIZE));
            for _ in 0..count {
                items.push(decode_value(schema, input, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        tag => match schema.type_of(tag) {
            Some(TypeKey::Scalar(kind)) => decode_scalar(*kind, body),
            Some(TypeKey::Named(name)) => Ok(Value::Opaque {
                type_name: name.clone(),
                data: body.to_vec(),
            }),
            None => Err(CodecError::UnknownTag(tag)),
        },
    }
}

fn decode_scalar(kind: ScalarKind, mut body: &[u8]) -> Result<Value> {
    if let Some(width) = kind.fixed_width()
        && body.len() != width
    {
        return Err(CodecError::malformed(
            kind.name(),
            format!("expected {} bytes, found {}", width, body.len()),
        ));
    }

    let value = match kind {
        ScalarKind::Bool => match body.get_u8() {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(CodecError::malformed("bool", format!("byte {:#04x}", other)));
            }
        },
        ScalarKind::I8 => Value::I8(body.get_i8()),
        ScalarKind::U8 => Value::U8(body.get_u8()),
        ScalarKind::I16 => Value::I16(body.get_i16_le()),
        ScalarKind::U16 => Value::U16(body.get_u16_le()),
        ScalarKind::I32 => Value::I32(body.get_i32_le()),
        ScalarKind::U32 => Value::U32(body.get_u32_le()),
        ScalarKind::I64 => Value::I64(body.get_i64_le()),
        ScalarKind::U64 => Value::U64(body.get_u64_le()),
        ScalarKind::F32 => Value::F32(body.get_f32_le()),
        ScalarKind::F64 => Value::F64(body.get_f64_le()),
        ScalarKind::Char => {
            let raw = body.get_u32_le();
            let c = char::from_u32(raw).ok_or_else(|| {
                CodecError::malformed("char", format!("{:#x} is not a scalar value", raw))
            })?;
            Value::Char(c)
        }
        ScalarKind::String => {
            let s = std::str::from_utf8(body)
                .map_err(|e| CodecError::malformed("string", e.to_string()))?;
            Value::String(s.to_string())
        }
        ScalarKind::Bytes => Value::Bytes(body.to_vec()),
    };
    Ok(value)
}
