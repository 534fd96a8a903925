//! Type encodings
//!
//! Objective-C style type-encoding strings describe every argument and
//! return value of a remotely invocable method. This module holds the
//! parsed form.

use std::fmt;

/// A parsed type encoding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeEncoding {
    /// `c`
    Char,
    /// `C`
    UChar,
    /// `s`
    Short,
    /// `S`
    UShort,
    /// `i`
    Int,
    /// `I`
    UInt,
    /// `l` (always 32 bits)
    Long,
    /// `L` (always 32 bits)
    ULong,
    /// `q`
    LongLong,
    /// `Q`
    ULongLong,
    /// `f`
    Float,
    /// `d`
    Double,
    /// `B`
    Bool,
    /// `v`
    Void,
    /// `*` - NUL-terminated C string
    CString,
    /// `@` - object
    Object,
    /// `#` - class
    Class,
    /// `:` - selector
    Selector,
    /// `^T`
    Pointer(Box<TypeEncoding>),
    /// `[NT]`
    Array {
        len: usize,
        element: Box<TypeEncoding>,
    },
    /// `{name=T...}`
    Struct {
        name: String,
        fields: Vec<TypeEncoding>,
    },
}

impl TypeEncoding {
    /// The single-byte tag that introduces this type in an encoding string
    pub fn tag(&self) -> u8 {
        match self {
            TypeEncoding::Char => b'c',
            TypeEncoding::UChar => b'C',
            TypeEncoding::Short => b's',
            TypeEncoding::UShort => b'S',
            TypeEncoding::Int => b'i',
            TypeEncoding::UInt => b'I',
            TypeEncoding::Long => b'l',
            TypeEncoding::ULong => b'L',
            TypeEncoding::LongLong => b'q',
            TypeEncoding::ULongLong => b'Q',
            TypeEncoding::Float => b'f',
            TypeEncoding::Double => b'd',
            TypeEncoding::Bool => b'B',
            TypeEncoding::Void => b'v',
            TypeEncoding::CString => b'*',
            TypeEncoding::Object => b'@',
            TypeEncoding::Class => b'#',
            TypeEncoding::Selector => b':',
            TypeEncoding::Pointer(_) => b'^',
            TypeEncoding::Array { .. } => b'[',
            TypeEncoding::Struct { .. } => b'{',
        }
    }

    /// Whether this is a signed or unsigned integer type (including bool)
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeEncoding::Char
                | TypeEncoding::UChar
                | TypeEncoding::Short
                | TypeEncoding::UShort
                | TypeEncoding::Int
                | TypeEncoding::UInt
                | TypeEncoding::Long
                | TypeEncoding::ULong
                | TypeEncoding::LongLong
                | TypeEncoding::ULongLong
                | TypeEncoding::Bool
        )
    }

    /// Whether this is `f` or `d`
    pub fn is_floating(&self) -> bool {
        matches!(self, TypeEncoding::Float | TypeEncoding::Double)
    }

    /// Whether values of this type are passed as a machine pointer
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self,
            TypeEncoding::CString
                | TypeEncoding::Object
                | TypeEncoding::Class
                | TypeEncoding::Selector
                | TypeEncoding::Pointer(_)
        )
    }

    /// Whether this is a struct or array
    pub fn is_aggregate(&self) -> bool {
        matches!(self, TypeEncoding::Struct { .. } | TypeEncoding::Array { .. })
    }
}

impl fmt::Display for TypeEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeEncoding::Pointer(inner) => write!(f, "^{}", inner),
            TypeEncoding::Array { len, element } => write!(f, "[{}{}]", len, element),
            TypeEncoding::Struct { name, fields } => {
                write!(f, "{{{}=", name)?;
                for field in fields {
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
            other => write!(f, "{}", other.tag() as char),
        }
    }
}

/// Method type qualifiers (`r n N o O R V`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Qualifiers {
    pub is_const: bool,
    pub is_in: bool,
    pub is_inout: bool,
    pub is_out: bool,
    pub bycopy: bool,
    pub byref: bool,
    pub oneway: bool,
}

impl Qualifiers {
    /// Apply a qualifier character, returning false if it is not one
    pub fn apply(&mut self, c: u8) -> bool {
        match c {
            b'r' => self.is_const = true,
            b'n' => self.is_in = true,
            b'N' => self.is_inout = true,
            b'o' => self.is_out = true,
            b'O' => self.bycopy = true,
            b'R' => self.byref = true,
            b'V' => self.oneway = true,
            _ => return false,
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        *self == Qualifiers::default()
    }
}

impl fmt::Display for Qualifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.is_const, 'r'),
            (self.is_in, 'n'),
            (self.is_inout, 'N'),
            (self.is_out, 'o'),
            (self.bycopy, 'O'),
            (self.byref, 'R'),
            (self.oneway, 'V'),
        ];
        for (set, c) in flags {
            if set {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_nested() {
        let ty = TypeEncoding::Struct {
            name: "Pair".to_string(),
            fields: vec![
                TypeEncoding::Int,
                TypeEncoding::Array {
                    len: 4,
                    element: Box::new(TypeEncoding::Pointer(Box::new(TypeEncoding::Double))),
                },
            ],
        };
        assert_eq!(ty.to_string(), "{Pair=i[4^d]}");
    }

    #[test]
    fn test_qualifiers() {
        let mut q = Qualifiers::default();
        assert!(q.is_empty());
        assert!(q.apply(b'O'));
        assert!(q.apply(b'o'));
        assert!(!q.apply(b'i'));
        assert!(q.bycopy && q.is_out);
        assert_eq!(q.to_string(), "oO");
    }
}
