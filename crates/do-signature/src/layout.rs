//! Host C-ABI layout calculations
//!
//! Computes in-memory sizes, alignments and struct field offsets for
//! type encodings, matching what a C compiler on the host would produce.

use crate::error::{Result, SignatureError};
use crate::types::TypeEncoding;

const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Size and alignment of a type in host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Size in bytes
    pub size: usize,
    /// Alignment requirement in bytes
    pub align: usize,
}

impl Layout {
    /// Get the layout for a type
    pub fn of(ty: &TypeEncoding) -> Result<Self> {
        let layout = match ty {
            TypeEncoding::Void => Self { size: 0, align: 1 },
            TypeEncoding::Char | TypeEncoding::UChar | TypeEncoding::Bool => {
                Self { size: 1, align: 1 }
            }
            TypeEncoding::Short | TypeEncoding::UShort => Self { size: 2, align: 2 },
            TypeEncoding::Int
            | TypeEncoding::UInt
            | TypeEncoding::Long
            | TypeEncoding::ULong
            | TypeEncoding::Float => Self { size: 4, align: 4 },
            TypeEncoding::LongLong | TypeEncoding::ULongLong | TypeEncoding::Double => {
                Self { size: 8, align: 8 }
            }
            TypeEncoding::CString
            | TypeEncoding::Object
            | TypeEncoding::Class
            | TypeEncoding::Selector
            | TypeEncoding::Pointer(_) => Self {
                size: POINTER_SIZE,
                align: POINTER_SIZE,
            },
            TypeEncoding::Array { len, element } => {
                let elem = Self::of(element)?;
                let size = elem.size.checked_mul(*len).ok_or_else(overflow)?;
                Self {
                    size,
                    align: elem.align,
                }
            }
            TypeEncoding::Struct { fields, .. } => struct_layout(fields)?.1,
        };
        Ok(layout)
    }

    /// Padding needed before this type at a given position
    pub fn padding_at(&self, position: usize) -> usize {
        align_padding(position, self.align)
    }
}

/// Padding needed to bring `position` up to `alignment`
#[inline]
pub fn align_padding(position: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return 0;
    }
    let remainder = position % alignment;
    if remainder == 0 {
        0
    } else {
        alignment - remainder
    }
}

/// Round `position` up to `alignment`, failing on overflow
pub fn align_up(position: usize, alignment: usize) -> Result<usize> {
    position
        .checked_add(align_padding(position, alignment))
        .ok_or_else(overflow)
}

/// Field offsets and overall layout of a struct
pub fn struct_layout(fields: &[TypeEncoding]) -> Result<(Vec<usize>, Layout)> {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut position = 0usize;
    let mut align = 1usize;

    for field in fields {
        let layout = Layout::of(field)?;
        position = align_up(position, layout.align)?;
        offsets.push(position);
        position = position.checked_add(layout.size).ok_or_else(overflow)?;
        align = align.max(layout.align);
    }

    let size = align_up(position, align)?;
    Ok((offsets, Layout { size, align }))
}

/// Field offsets of a struct
pub fn struct_offsets(fields: &[TypeEncoding]) -> Result<Vec<usize>> {
    struct_layout(fields).map(|(offsets, _)| offsets)
}

fn overflow() -> SignatureError {
    SignatureError::invalid(0, "frame size overflows")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_type_encoding;

    fn layout(s: &str) -> Layout {
        Layout::of(&parse_type_encoding(s).unwrap()).unwrap()
    }

    #[test]
    fn test_primitive_layouts() {
        assert_eq!(layout("c"), Layout { size: 1, align: 1 });
        assert_eq!(layout("s"), Layout { size: 2, align: 2 });
        assert_eq!(layout("l"), Layout { size: 4, align: 4 });
        assert_eq!(layout("q"), Layout { size: 8, align: 8 });
        assert_eq!(layout("@").size, std::mem::size_of::<usize>());
    }

    #[repr(C)]
    struct Mixed {
        a: u8,
        b: f64,
        c: u16,
    }

    #[test]
    fn test_struct_matches_repr_c() {
        let l = layout("{Mixed=CdS}");
        assert_eq!(l.size, std::mem::size_of::<Mixed>());
        assert_eq!(l.align, std::mem::align_of::<Mixed>());

        let offsets = struct_offsets(&[
            TypeEncoding::UChar,
            TypeEncoding::Double,
            TypeEncoding::UShort,
        ])
        .unwrap();
        assert_eq!(offsets, vec![0, 8, 16]);
    }

    #[test]
    fn test_array_layout() {
        assert_eq!(layout("[3s]"), Layout { size: 6, align: 2 });
        assert_eq!(layout("{P=c[3i]}"), Layout { size: 16, align: 4 });
    }

    #[test]
    fn test_overflow() {
        let ty = parse_type_encoding(&format!("[{}[{}q]]", usize::MAX / 2, 4)).unwrap();
        assert!(matches!(
            Layout::of(&ty),
            Err(SignatureError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_padding() {
        assert_eq!(align_padding(0, 8), 0);
        assert_eq!(align_padding(3, 4), 1);
        assert_eq!(align_padding(5, 1), 0);
        assert_eq!(layout("i").padding_at(6), 2);
    }
}
