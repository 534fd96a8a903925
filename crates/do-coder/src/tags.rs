//! One-byte record tags
//!
//! Object, class and pointer records start with one of these tags. Plain
//! values start with their type-encoding character instead (`i`, `d`, `{`...).

pub const OBJECT_NIL: u8 = 0;
pub const OBJECT: u8 = 1;
pub const OBJECT_ROOT: u8 = 2;
pub const OBJECT_REPEATED: u8 = 3;
pub const OBJECT_FORWARD_REFERENCE: u8 = 4;
pub const OBJECT_FORWARD_SATISFIER: u8 = 5;
pub const OBJECT_CLASS: u8 = 6;
pub const CLASS_NIL: u8 = 7;
pub const CLASS: u8 = 8;
pub const CLASS_REPEATED: u8 = 9;
pub const CONST_PTR_NULL: u8 = 10;
pub const CONST_PTR: u8 = 11;
pub const CONST_PTR_REPEATED: u8 = 12;

/// Value tag for a conditional object reference
pub const CONDITIONAL_OBJECT: u8 = b'w';

/// Human-readable tag name for diagnostics
pub fn tag_name(tag: u8) -> &'static str {
    match tag {
        OBJECT_NIL => "object-nil",
        OBJECT => "object",
        OBJECT_ROOT => "object-root",
        OBJECT_REPEATED => "object-repeated",
        OBJECT_FORWARD_REFERENCE => "forward-reference",
        OBJECT_FORWARD_SATISFIER => "forward-satisfier",
        OBJECT_CLASS => "object-class",
        CLASS_NIL => "class-nil",
        CLASS => "class",
        CLASS_REPEATED => "class-repeated",
        CONST_PTR_NULL => "const-pointer-null",
        CONST_PTR => "const-pointer",
        CONST_PTR_REPEATED => "const-pointer-repeated",
        _ => "unknown",
    }
}
