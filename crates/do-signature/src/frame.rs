//! Call frames
//!
//! A [`CallFrame`] is the materialized argument buffer of one call: one
//! aligned slot per argument as described by its [`MethodSignature`], plus
//! a buffer for the return value. The buffers are allocated once and never
//! move, so slot addresses stay valid for the life of the frame.

use std::sync::Arc;

use tracing::error;

use crate::error::{Result, SignatureError};
use crate::invoke::CallBackend;
use crate::signature::{ArgumentInfo, MethodSignature};
use crate::types::TypeEncoding;

/// Word-aligned byte buffer
#[derive(Debug, Clone)]
struct FrameBuffer {
    words: Box<[u64]>,
    len: usize,
}

impl FrameBuffer {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8)].into_boxed_slice(),
            len,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        // Safety: the word storage covers at least `len` bytes and u8 has no
        // alignment requirement.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and we hold the only reference.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }
}

/// Scalars that can be stored in a frame slot in host byte order
pub trait NativeScalar: Copy {
    const SIZE: usize;

    /// Whether a slot of this encoding can hold the scalar
    fn accepts(encoding: &TypeEncoding) -> bool;

    fn write_native(self, out: &mut [u8]);

    fn read_native(bytes: &[u8]) -> Self;
}

macro_rules! native_scalar {
    ($ty:ty, $($pat:pat_param)|+) => {
        impl NativeScalar for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn accepts(encoding: &TypeEncoding) -> bool {
                matches!(encoding, $($pat)|+)
            }

            fn write_native(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }

            fn read_native(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }
        }
    };
}

native_scalar!(i8, TypeEncoding::Char);
native_scalar!(u8, TypeEncoding::UChar);
native_scalar!(i16, TypeEncoding::Short);
native_scalar!(u16, TypeEncoding::UShort);
native_scalar!(i32, TypeEncoding::Int | TypeEncoding::Long);
native_scalar!(u32, TypeEncoding::UInt | TypeEncoding::ULong);
native_scalar!(i64, TypeEncoding::LongLong);
native_scalar!(u64, TypeEncoding::ULongLong);
native_scalar!(f32, TypeEncoding::Float);
native_scalar!(f64, TypeEncoding::Double);
native_scalar!(
    usize,
    TypeEncoding::CString
        | TypeEncoding::Object
        | TypeEncoding::Class
        | TypeEncoding::Selector
        | TypeEncoding::Pointer(_)
);

impl NativeScalar for bool {
    const SIZE: usize = 1;

    fn accepts(encoding: &TypeEncoding) -> bool {
        matches!(encoding, TypeEncoding::Bool)
    }

    fn write_native(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn read_native(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Argument buffer of a single call
#[derive(Debug, Clone)]
pub struct CallFrame {
    signature: Arc<MethodSignature>,
    args: FrameBuffer,
    ret: FrameBuffer,
}

impl CallFrame {
    /// Allocate a zeroed frame for a signature
    pub fn new(signature: Arc<MethodSignature>) -> Self {
        let args = FrameBuffer::zeroed(signature.frame_length());
        let ret = FrameBuffer::zeroed(signature.return_info().size);
        Self {
            signature,
            args,
            ret,
        }
    }

    /// Parse a type string and allocate a frame for it
    pub fn from_types(types: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(MethodSignature::parse(types)?)))
    }

    /// Rebuild a frame from the flat argument bytes produced by [`CallFrame::as_bytes`]
    pub fn from_bytes(signature: Arc<MethodSignature>, bytes: &[u8]) -> Result<Self> {
        let mut frame = Self::new(signature);
        if bytes.len() != frame.args.len {
            return Err(SignatureError::FrameLength {
                expected: frame.args.len,
                got: bytes.len(),
            });
        }
        frame.args.as_bytes_mut().copy_from_slice(bytes);
        Ok(frame)
    }

    pub fn signature(&self) -> &Arc<MethodSignature> {
        &self.signature
    }

    pub fn argument_count(&self) -> usize {
        self.signature.number_of_arguments()
    }

    /// Flat argument buffer
    pub fn as_bytes(&self) -> &[u8] {
        self.args.as_bytes()
    }

    fn slot(&self, index: usize) -> Result<&ArgumentInfo> {
        self.signature.argument_info(index).map_err(|e| {
            error!("call frame index {} out of range for {}", index, self.signature);
            e
        })
    }

    fn check_size(&self, index: usize, expected: usize, got: usize) -> Result<()> {
        if expected != got {
            error!(
                "call frame size mismatch for argument {} of {}: slot {} bytes, value {} bytes",
                index, self.signature, expected, got
            );
            return Err(SignatureError::SizeMismatch {
                index,
                expected,
                got,
            });
        }
        Ok(())
    }

    /// Copy `bytes` into argument slot `index`
    pub fn set_argument(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let (offset, size) = {
            let info = self.slot(index)?;
            (info.offset, info.size)
        };
        self.check_size(index, size, bytes.len())?;
        self.args.as_bytes_mut()[offset..offset + size].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy argument slot `index` into `out`
    pub fn get_argument(&self, index: usize, out: &mut [u8]) -> Result<()> {
        let info = self.slot(index)?;
        self.check_size(index, info.size, out.len())?;
        out.copy_from_slice(&self.args.as_bytes()[info.offset..info.offset + info.size]);
        Ok(())
    }

    /// Borrow argument slot `index`
    pub fn argument(&self, index: usize) -> Result<&[u8]> {
        let info = self.slot(index)?;
        Ok(&self.args.as_bytes()[info.offset..info.offset + info.size])
    }

    pub fn argument_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let (offset, size) = {
            let info = self.slot(index)?;
            (info.offset, info.size)
        };
        Ok(&mut self.args.as_bytes_mut()[offset..offset + size])
    }

    /// Address of argument slot `index`; valid while the frame lives
    pub fn address_of_argument(&mut self, index: usize) -> Result<*mut u8> {
        let offset = self.slot(index)?.offset;
        // Safety: offset lies inside the argument buffer.
        Ok(unsafe { self.args.as_mut_ptr().add(offset) })
    }

    pub fn set_return(&mut self, bytes: &[u8]) -> Result<()> {
        let size = self.signature.return_info().size;
        self.check_size(usize::MAX, size, bytes.len())?;
        self.ret.as_bytes_mut().copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_return(&self, out: &mut [u8]) -> Result<()> {
        let size = self.signature.return_info().size;
        self.check_size(usize::MAX, size, out.len())?;
        out.copy_from_slice(self.ret.as_bytes());
        Ok(())
    }

    pub fn return_bytes(&self) -> &[u8] {
        self.ret.as_bytes()
    }

    pub fn return_bytes_mut(&mut self) -> &mut [u8] {
        self.ret.as_bytes_mut()
    }

    /// Address of the return buffer; valid while the frame lives
    pub fn return_address(&mut self) -> *mut u8 {
        self.ret.as_mut_ptr()
    }

    /// Store a scalar in slot `index`
    pub fn set<T: NativeScalar>(&mut self, index: usize, value: T) -> Result<()> {
        self.check_scalar::<T>(self.slot(index)?)?;
        let mut raw = [0u8; 8];
        value.write_native(&mut raw[..T::SIZE]);
        self.set_argument(index, &raw[..T::SIZE])
    }

    /// Load a scalar from slot `index`
    pub fn get<T: NativeScalar>(&self, index: usize) -> Result<T> {
        let info = self.slot(index)?;
        self.check_scalar::<T>(info)?;
        Ok(T::read_native(self.argument(index)?))
    }

    pub fn set_return_value<T: NativeScalar>(&mut self, value: T) -> Result<()> {
        self.check_scalar::<T>(self.signature.return_info())?;
        let mut raw = [0u8; 8];
        value.write_native(&mut raw[..T::SIZE]);
        self.set_return(&raw[..T::SIZE])
    }

    pub fn return_value<T: NativeScalar>(&self) -> Result<T> {
        self.check_scalar::<T>(self.signature.return_info())?;
        Ok(T::read_native(self.ret.as_bytes()))
    }

    fn check_scalar<T: NativeScalar>(&self, info: &ArgumentInfo) -> Result<()> {
        if !T::accepts(&info.encoding) {
            return Err(SignatureError::TypeMismatch {
                expected: info.encoding.to_string(),
                got: std::any::type_name::<T>().to_string(),
            });
        }
        Ok(())
    }

    /// Call a native function with this frame's arguments, storing the
    /// result in the return buffer.
    ///
    /// # Safety
    ///
    /// `function` must point to an `extern "C"` function whose parameters
    /// and return type are exactly those described by the frame's signature,
    /// and every pointer stored in the frame must be valid for that function.
    pub unsafe fn invoke(&mut self, backend: &dyn CallBackend, function: *const ()) -> Result<()> {
        if function.is_null() {
            return Err(SignatureError::Invocation("null function pointer".to_string()));
        }
        backend.check(&self.signature)?;
        backend.call(self, function)
    }
}
