//! Method signatures
//!
//! A [`MethodSignature`] is the parsed, immutable description of a method's
//! return type and arguments, with the host layout of every argument slot.

use std::fmt;

use crate::error::{Result, SignatureError};
use crate::layout::{align_up, Layout};
use crate::parser::Parser;
use crate::types::{Qualifiers, TypeEncoding};

/// Frame buffers are allocated in 8-byte words
pub const FRAME_ALIGNMENT: usize = 8;

/// Description of one argument (or the return value)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentInfo {
    /// Argument index; the return value has `None`
    pub index: Option<usize>,
    pub encoding: TypeEncoding,
    pub qualifiers: Qualifiers,
    pub size: usize,
    pub align: usize,
    /// Offset of the slot inside the argument buffer
    pub offset: usize,
}

impl ArgumentInfo {
    pub fn is_return(&self) -> bool {
        self.index.is_none()
    }

    /// Pointer arguments whose pointee travels back to the caller.
    /// Unqualified non-const pointers are treated as inout.
    pub fn is_out_param(&self) -> bool {
        if !matches!(self.encoding, TypeEncoding::Pointer(_)) || self.qualifiers.is_const {
            return false;
        }
        let q = &self.qualifiers;
        q.is_out || q.is_inout || !q.is_in
    }

    /// Whether the caller's value is sent with the request
    pub fn is_in_param(&self) -> bool {
        !(matches!(self.encoding, TypeEncoding::Pointer(_)) && self.qualifiers.is_out)
    }

    pub fn is_bycopy(&self) -> bool {
        self.qualifiers.bycopy
    }

    pub fn is_byref(&self) -> bool {
        self.qualifiers.byref
    }
}

/// Parsed method type signature
#[derive(Debug, Clone)]
pub struct MethodSignature {
    types: String,
    return_info: ArgumentInfo,
    arguments: Vec<ArgumentInfo>,
    frame_length: usize,
}

impl MethodSignature {
    /// Parse a method type string such as `I@:` or `v@:O@o^i`
    pub fn parse(types: &str) -> Result<Self> {
        let mut parser = Parser::new(types);
        if parser.at_end() {
            return Err(SignatureError::invalid(0, "empty method type string"));
        }

        let (ret_qualifiers, ret_encoding) = parser.parse_qualified()?;
        let ret_layout = Layout::of(&ret_encoding)?;
        if ret_qualifiers.oneway && ret_encoding != TypeEncoding::Void {
            return Err(SignatureError::invalid(0, "oneway methods must return void"));
        }
        let return_info = ArgumentInfo {
            index: None,
            encoding: ret_encoding,
            qualifiers: ret_qualifiers,
            size: ret_layout.size,
            align: ret_layout.align,
            offset: 0,
        };

        let mut arguments = Vec::new();
        let mut position = 0usize;
        while !parser.at_end() {
            let start = parser.position();
            let (qualifiers, encoding) = parser.parse_qualified()?;
            if encoding == TypeEncoding::Void {
                return Err(SignatureError::invalid(start, "void argument"));
            }
            let layout = Layout::of(&encoding)?;
            if layout.align > FRAME_ALIGNMENT {
                return Err(SignatureError::invalid(start, "over-aligned argument"));
            }
            let offset = align_up(position, layout.align)?;
            position = offset
                .checked_add(layout.size)
                .ok_or_else(|| SignatureError::invalid(start, "frame size overflows"))?;
            arguments.push(ArgumentInfo {
                index: Some(arguments.len()),
                encoding,
                qualifiers,
                size: layout.size,
                align: layout.align,
                offset,
            });
        }

        Ok(Self {
            types: types.to_string(),
            return_info,
            arguments,
            frame_length: align_up(position, FRAME_ALIGNMENT)?,
        })
    }

    /// The original type string
    pub fn type_string(&self) -> &str {
        &self.types
    }

    pub fn number_of_arguments(&self) -> usize {
        self.arguments.len()
    }

    pub fn argument_info(&self, index: usize) -> Result<&ArgumentInfo> {
        self.arguments
            .get(index)
            .ok_or(SignatureError::IndexOutOfRange {
                index,
                count: self.arguments.len(),
            })
    }

    pub fn arguments(&self) -> &[ArgumentInfo] {
        &self.arguments
    }

    pub fn return_info(&self) -> &ArgumentInfo {
        &self.return_info
    }

    /// Size in bytes of the argument buffer
    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn is_oneway(&self) -> bool {
        self.return_info.qualifiers.oneway
    }

    /// Whether the first two arguments are the receiver and selector
    pub fn is_method(&self) -> bool {
        self.arguments.len() >= 2
            && self.arguments[0].encoding == TypeEncoding::Object
            && self.arguments[1].encoding == TypeEncoding::Selector
    }

    /// Index of the first argument after the receiver and selector
    pub fn first_explicit(&self) -> usize {
        if self.is_method() {
            2
        } else {
            0
        }
    }

    /// Arguments after the receiver and selector
    pub fn explicit_arguments(&self) -> &[ArgumentInfo] {
        &self.arguments[self.first_explicit()..]
    }

    /// Same encodings and qualifiers, ignoring offset annotations
    pub fn is_compatible_with(&self, other: &MethodSignature) -> bool {
        let same = |a: &ArgumentInfo, b: &ArgumentInfo| {
            a.encoding == b.encoding && a.qualifiers == b.qualifiers
        };
        same(&self.return_info, &other.return_info)
            && self.arguments.len() == other.arguments.len()
            && self
                .arguments
                .iter()
                .zip(&other.arguments)
                .all(|(a, b)| same(a, b))
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.types)
    }
}
