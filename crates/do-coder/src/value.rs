//! The value model
//!
//! A [`Value`] is one typed datum as it travels through a coder session.
//! Object and pointer values refer to nodes of an [`ObjectGraph`](crate::ObjectGraph).

use std::fmt;

use do_signature::TypeEncoding;

use crate::graph::NodeId;
use crate::tags::CONDITIONAL_OBJECT;

/// A typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i32),
    ULong(u32),
    LongLong(i64),
    ULongLong(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    CString(Option<String>),
    Selector(Option<String>),
    /// A class, by name
    Class(Option<String>),
    Struct(Vec<Value>),
    Array(Vec<Value>),
    /// A pointer to a pointee node
    ConstPointer(Option<NodeId>),
    Object(Option<NodeId>),
    /// A conditional reference: written as a forward reference until the
    /// object is written unconditionally in the same session
    WeakObject(Option<NodeId>),
}

impl Value {
    /// Convenience constructor for a C string
    pub fn string(s: impl Into<String>) -> Self {
        Value::CString(Some(s.into()))
    }

    /// Convenience constructor for a selector
    pub fn selector(s: impl Into<String>) -> Self {
        Value::Selector(Some(s.into()))
    }

    /// The type tag that introduces this value in a stream
    pub fn tag(&self) -> u8 {
        match self {
            Value::Char(_) => b'c',
            Value::UChar(_) => b'C',
            Value::Short(_) => b's',
            Value::UShort(_) => b'S',
            Value::Int(_) => b'i',
            Value::UInt(_) => b'I',
            Value::Long(_) => b'l',
            Value::ULong(_) => b'L',
            Value::LongLong(_) => b'q',
            Value::ULongLong(_) => b'Q',
            Value::Float(_) => b'f',
            Value::Double(_) => b'd',
            Value::Bool(_) => b'B',
            Value::CString(_) => b'*',
            Value::Selector(_) => b':',
            Value::Class(_) => b'#',
            Value::Struct(_) => b'{',
            Value::Array(_) => b'[',
            Value::ConstPointer(_) => b'^',
            Value::Object(_) => b'@',
            Value::WeakObject(_) => CONDITIONAL_OBJECT,
        }
    }

    /// Whether this value has the shape of `encoding`.
    ///
    /// Pointees are not checked here since they live in a graph.
    pub fn matches(&self, encoding: &TypeEncoding) -> bool {
        match (self, encoding) {
            (Value::Object(_) | Value::WeakObject(_), TypeEncoding::Object) => true,
            (Value::ConstPointer(_), TypeEncoding::Pointer(_)) => true,
            (Value::Struct(values), TypeEncoding::Struct { fields, .. }) => {
                values.len() == fields.len()
                    && values.iter().zip(fields).all(|(v, f)| v.matches(f))
            }
            (Value::Array(values), TypeEncoding::Array { len, element }) => {
                values.len() == *len && values.iter().all(|v| v.matches(element))
            }
            (value, encoding) => !encoding.is_aggregate() && value.tag() == encoding.tag(),
        }
    }

    /// The zero value of a type: numbers are 0, references are nil
    pub fn zeroed(encoding: &TypeEncoding) -> Option<Value> {
        let value = match encoding {
            TypeEncoding::Char => Value::Char(0),
            TypeEncoding::UChar => Value::UChar(0),
            TypeEncoding::Short => Value::Short(0),
            TypeEncoding::UShort => Value::UShort(0),
            TypeEncoding::Int => Value::Int(0),
            TypeEncoding::UInt => Value::UInt(0),
            TypeEncoding::Long => Value::Long(0),
            TypeEncoding::ULong => Value::ULong(0),
            TypeEncoding::LongLong => Value::LongLong(0),
            TypeEncoding::ULongLong => Value::ULongLong(0),
            TypeEncoding::Float => Value::Float(0.0),
            TypeEncoding::Double => Value::Double(0.0),
            TypeEncoding::Bool => Value::Bool(false),
            TypeEncoding::CString => Value::CString(None),
            TypeEncoding::Selector => Value::Selector(None),
            TypeEncoding::Class => Value::Class(None),
            TypeEncoding::Object => Value::Object(None),
            TypeEncoding::Pointer(_) => Value::ConstPointer(None),
            TypeEncoding::Struct { fields, .. } => Value::Struct(
                fields
                    .iter()
                    .map(Value::zeroed)
                    .collect::<Option<Vec<_>>>()?,
            ),
            TypeEncoding::Array { len, element } => {
                Value::Array(vec![Value::zeroed(element)?; *len])
            }
            TypeEncoding::Void => return None,
        };
        Some(value)
    }

    /// Integer value widened to i64, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Char(v) => Some(v.into()),
            Value::UChar(v) => Some(v.into()),
            Value::Short(v) => Some(v.into()),
            Value::UShort(v) => Some(v.into()),
            Value::Int(v) | Value::Long(v) => Some(v.into()),
            Value::UInt(v) | Value::ULong(v) => Some(v.into()),
            Value::LongLong(v) => Some(v),
            Value::ULongLong(v) => i64::try_from(v).ok(),
            Value::Bool(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v.into()),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::CString(Some(s)) | Value::Selector(Some(s)) | Value::Class(Some(s)) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::CString(Some(s)) => write!(f, "{:?}", s),
            Value::Selector(Some(s)) => write!(f, "@selector({})", s),
            Value::Class(Some(s)) => write!(f, "{}", s),
            Value::CString(None) | Value::Selector(None) | Value::Class(None) => write!(f, "NULL"),
            Value::Object(None) | Value::WeakObject(None) | Value::ConstPointer(None) => {
                write!(f, "nil")
            }
            Value::Object(Some(id)) | Value::WeakObject(Some(id)) => write!(f, "<object {}>", id),
            Value::ConstPointer(Some(id)) => write!(f, "<pointer {}>", id),
            Value::Struct(values) | Value::Array(values) => {
                let open = if matches!(self, Value::Struct(_)) { '{' } else { '[' };
                let close = if open == '{' { '}' } else { ']' };
                write!(f, "{}", open)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "{}", close)
            }
            other => match (other.as_i64(), other.as_f64()) {
                (Some(i), _) => write!(f, "{}", i),
                (_, Some(d)) => write!(f, "{}", d),
                _ => write!(f, "{:?}", other),
            },
        }
    }
}
