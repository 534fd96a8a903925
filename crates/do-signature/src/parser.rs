//! Type-encoding parser
//!
//! Turns encoding strings such as `i24@0:8{Point=dd}16` into
//! [`TypeEncoding`] values. Offset annotations are skipped.

use crate::error::{Result, SignatureError};
use crate::types::{Qualifiers, TypeEncoding};

/// Deepest nesting of pointers, arrays and structs accepted
const MAX_NESTING: usize = 64;

/// Recursive-descent parser over an encoding string
pub struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    /// Current byte position
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Parse qualifiers, one type, and the optional offset that follows it
    pub fn parse_qualified(&mut self) -> Result<(Qualifiers, TypeEncoding)> {
        let mut qualifiers = Qualifiers::default();
        while let Some(c) = self.peek() {
            if !qualifiers.apply(c) {
                break;
            }
            self.pos += 1;
        }
        let ty = self.parse_type()?;
        self.skip_offset();
        Ok((qualifiers, ty))
    }

    /// Parse a single type
    pub fn parse_type(&mut self) -> Result<TypeEncoding> {
        let start = self.pos;
        let c = self
            .peek()
            .ok_or_else(|| SignatureError::invalid(start, "unexpected end of encoding"))?;
        self.pos += 1;

        let ty = match c {
            b'c' => TypeEncoding::Char,
            b'C' => TypeEncoding::UChar,
            b's' => TypeEncoding::Short,
            b'S' => TypeEncoding::UShort,
            b'i' => TypeEncoding::Int,
            b'I' => TypeEncoding::UInt,
            b'l' => TypeEncoding::Long,
            b'L' => TypeEncoding::ULong,
            b'q' => TypeEncoding::LongLong,
            b'Q' => TypeEncoding::ULongLong,
            b'f' => TypeEncoding::Float,
            b'd' => TypeEncoding::Double,
            b'B' => TypeEncoding::Bool,
            b'v' => TypeEncoding::Void,
            b'*' => TypeEncoding::CString,
            b'@' => TypeEncoding::Object,
            b'#' => TypeEncoding::Class,
            b':' => TypeEncoding::Selector,
            b'^' => {
                let inner = self.nested(|p| p.parse_type())?;
                TypeEncoding::Pointer(Box::new(inner))
            }
            b'[' => self.nested(|p| p.parse_array(start))?,
            b'{' => self.nested(|p| p.parse_struct(start))?,
            b'(' => return Err(SignatureError::invalid(start, "unions are not supported")),
            b'b' => return Err(SignatureError::invalid(start, "bitfields are not supported")),
            b'D' => return Err(SignatureError::invalid(start, "long double is not supported")),
            b'?' => return Err(SignatureError::invalid(start, "unknown type '?'")),
            other => {
                return Err(SignatureError::invalid(
                    start,
                    format!("unexpected character '{}'", other as char),
                ))
            }
        };
        Ok(ty)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(SignatureError::invalid(self.pos, "type nesting too deep"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_array(&mut self, start: usize) -> Result<TypeEncoding> {
        let len = match self.parse_number() {
            Some(0) | None => {
                return Err(SignatureError::invalid(
                    start,
                    "unsized variable-length arrays are not supported",
                ))
            }
            Some(len) => len,
        };
        let element = self.parse_type()?;
        if matches!(element, TypeEncoding::Void) {
            return Err(SignatureError::invalid(start, "array of void"));
        }
        self.expect(b']')?;
        Ok(TypeEncoding::Array {
            len,
            element: Box::new(element),
        })
    }

    fn parse_struct(&mut self, start: usize) -> Result<TypeEncoding> {
        let name_start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'=' || c == b'}' {
                break;
            }
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.input[name_start..self.pos]).into_owned();

        match self.peek() {
            Some(b'}') => {
                return Err(SignatureError::invalid(
                    start,
                    format!("opaque struct '{}' has no layout", name),
                ))
            }
            Some(b'=') => self.pos += 1,
            _ => return Err(SignatureError::invalid(start, "unterminated struct")),
        }

        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(b'"') => {
                    // Field names emitted by some compilers: "name"T
                    self.pos += 1;
                    while let Some(c) = self.peek() {
                        self.pos += 1;
                        if c == b'"' {
                            break;
                        }
                    }
                }
                Some(_) => {
                    let field = self.parse_type()?;
                    if matches!(field, TypeEncoding::Void) {
                        return Err(SignatureError::invalid(self.pos - 1, "void struct field"));
                    }
                    fields.push(field);
                }
                None => return Err(SignatureError::invalid(start, "unterminated struct")),
            }
        }

        if fields.is_empty() {
            return Err(SignatureError::invalid(start, "empty struct"));
        }
        Ok(TypeEncoding::Struct { name, fields })
    }

    fn skip_offset(&mut self) {
        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn parse_number(&mut self) -> Option<usize> {
        let start = self.pos;
        let mut value: usize = 0;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            value = value.checked_mul(10)?.checked_add((c - b'0') as usize)?;
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            Some(value)
        }
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(SignatureError::invalid(
                self.pos,
                format!("expected '{}'", c as char),
            ))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }
}

/// Parse a string holding exactly one type
pub fn parse_type_encoding(input: &str) -> Result<TypeEncoding> {
    let mut parser = Parser::new(input);
    let ty = parser.parse_type()?;
    if !parser.at_end() {
        return Err(SignatureError::invalid(parser.position(), "trailing characters"));
    }
    Ok(ty)
}

/// Parse a method type string: the return type followed by every argument
pub fn parse_method_types(input: &str) -> Result<Vec<(Qualifiers, TypeEncoding)>> {
    let mut parser = Parser::new(input);
    let mut types = Vec::new();
    while !parser.at_end() {
        types.push(parser.parse_qualified()?);
    }
    if types.is_empty() {
        return Err(SignatureError::invalid(0, "empty method type string"));
    }
    Ok(types)
}
