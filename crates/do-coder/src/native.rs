//! Conversion between values and host memory
//!
//! Call-frame slots hold arguments in the host's C layout. These helpers
//! move plain data (numbers, booleans, structs and arrays of them) between
//! that layout and [`Value`]. References are handled by higher layers.

use do_signature::{struct_offsets, Layout, TypeEncoding};

use crate::error::{CoderError, Result};
use crate::value::Value;

fn unsupported(encoding: &TypeEncoding) -> CoderError {
    CoderError::Encoding(format!("type {} has no plain-data representation", encoding))
}

fn check_len(encoding: &TypeEncoding, len: usize) -> Result<usize> {
    let size = Layout::of(encoding)?.size;
    if size != len {
        return Err(CoderError::Encoding(format!(
            "type {} needs {} bytes, slot has {}",
            encoding, size, len
        )));
    }
    Ok(size)
}

/// Whether a type can be converted by this module
pub fn is_plain_data(encoding: &TypeEncoding) -> bool {
    match encoding {
        TypeEncoding::Struct { fields, .. } => fields.iter().all(is_plain_data),
        TypeEncoding::Array { element, .. } => is_plain_data(element),
        other => other.is_integer() || other.is_floating(),
    }
}

/// Store `value` into `out` using the host layout of `encoding`
pub fn write_native(encoding: &TypeEncoding, value: &Value, out: &mut [u8]) -> Result<()> {
    check_len(encoding, out.len())?;
    match (encoding, value) {
        (TypeEncoding::Char, Value::Char(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::UChar, Value::UChar(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::Short, Value::Short(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::UShort, Value::UShort(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::Int, Value::Int(v)) | (TypeEncoding::Long, Value::Long(v)) => {
            out.copy_from_slice(&v.to_ne_bytes())
        }
        (TypeEncoding::UInt, Value::UInt(v)) | (TypeEncoding::ULong, Value::ULong(v)) => {
            out.copy_from_slice(&v.to_ne_bytes())
        }
        (TypeEncoding::LongLong, Value::LongLong(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::ULongLong, Value::ULongLong(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::Float, Value::Float(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::Double, Value::Double(v)) => out.copy_from_slice(&v.to_ne_bytes()),
        (TypeEncoding::Bool, Value::Bool(v)) => out[0] = u8::from(*v),
        (TypeEncoding::Struct { fields, .. }, Value::Struct(values))
            if fields.len() == values.len() =>
        {
            for ((field, value), offset) in fields.iter().zip(values).zip(struct_offsets(fields)?) {
                let size = Layout::of(field)?.size;
                write_native(field, value, &mut out[offset..offset + size])?;
            }
        }
        (TypeEncoding::Array { len, element }, Value::Array(values)) if *len == values.len() => {
            let size = Layout::of(element)?.size;
            for (i, value) in values.iter().enumerate() {
                write_native(element, value, &mut out[i * size..(i + 1) * size])?;
            }
        }
        (encoding, value) if is_plain_data(encoding) => {
            return Err(CoderError::Encoding(format!(
                "value {} does not match type {}",
                value, encoding
            )))
        }
        (encoding, _) => return Err(unsupported(encoding)),
    }
    Ok(())
}

/// Load a value of type `encoding` from host-layout bytes
pub fn read_native(encoding: &TypeEncoding, bytes: &[u8]) -> Result<Value> {
    check_len(encoding, bytes.len())?;
    macro_rules! load {
        ($ty:ty) => {{
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            <$ty>::from_ne_bytes(raw)
        }};
    }
    let value = match encoding {
        TypeEncoding::Char => Value::Char(load!(i8)),
        TypeEncoding::UChar => Value::UChar(load!(u8)),
        TypeEncoding::Short => Value::Short(load!(i16)),
        TypeEncoding::UShort => Value::UShort(load!(u16)),
        TypeEncoding::Int => Value::Int(load!(i32)),
        TypeEncoding::UInt => Value::UInt(load!(u32)),
        TypeEncoding::Long => Value::Long(load!(i32)),
        TypeEncoding::ULong => Value::ULong(load!(u32)),
        TypeEncoding::LongLong => Value::LongLong(load!(i64)),
        TypeEncoding::ULongLong => Value::ULongLong(load!(u64)),
        TypeEncoding::Float => Value::Float(load!(f32)),
        TypeEncoding::Double => Value::Double(load!(f64)),
        TypeEncoding::Bool => Value::Bool(bytes[0] != 0),
        TypeEncoding::Struct { fields, .. } => {
            let mut values = Vec::with_capacity(fields.len());
            for (field, offset) in fields.iter().zip(struct_offsets(fields)?) {
                let size = Layout::of(field)?.size;
                values.push(read_native(field, &bytes[offset..offset + size])?);
            }
            Value::Struct(values)
        }
        TypeEncoding::Array { len, element } => {
            let size = Layout::of(element)?.size;
            let values = (0..*len)
                .map(|i| read_native(element, &bytes[i * size..(i + 1) * size]))
                .collect::<Result<Vec<_>>>()?;
            Value::Array(values)
        }
        other => return Err(unsupported(other)),
    };
    Ok(value)
}
