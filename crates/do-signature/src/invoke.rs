//! Native-call backends
//!
//! A [`CallBackend`] turns a populated [`CallFrame`] into a real machine
//! call. [`RegisterTrampoline`] covers calls whose arguments all fit in
//! registers on System V x86_64 (scalars and small aggregates) and AArch64
//! (scalars only). Integer-class and floating-class arguments are assigned
//! to independent register files on both, so the trampoline calls every
//! function through one fixed shape: six integer and eight floating
//! registers, filled in declaration order.

use tracing::trace;

use crate::error::{Result, SignatureError};
use crate::frame::CallFrame;
use crate::layout::{struct_offsets, Layout};
use crate::signature::MethodSignature;
use crate::types::TypeEncoding;

/// A strategy for calling native functions from a call frame
pub trait CallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fail if the backend cannot call functions of this signature
    fn check(&self, signature: &MethodSignature) -> Result<()>;

    /// Perform the call, writing the result into the frame's return buffer
    ///
    /// # Safety
    ///
    /// See [`CallFrame::invoke`].
    unsafe fn call(&self, frame: &mut CallFrame, function: *const ()) -> Result<()>;
}

const INT_REGISTERS: usize = 6;
const FLOAT_REGISTERS: usize = 8;

const SUPPORTED: bool = cfg!(all(
    target_endian = "little",
    any(all(target_arch = "x86_64", unix), target_arch = "aarch64")
));

/// Aggregates by value follow the System V eightbyte rules
const AGGREGATES: bool = cfg!(all(target_arch = "x86_64", unix));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegClass {
    Integer,
    Sse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Void,
    /// One class per eightbyte
    Registers(Vec<RegClass>),
    /// Passed or returned through memory
    Memory,
}

#[derive(Debug)]
struct CallPlan {
    ret: Placement,
    args: Vec<Placement>,
}

fn classify(ty: &TypeEncoding) -> Result<Placement> {
    match ty {
        TypeEncoding::Void => Ok(Placement::Void),
        t if t.is_floating() => Ok(Placement::Registers(vec![RegClass::Sse])),
        t if t.is_integer() || t.is_pointer_like() => {
            Ok(Placement::Registers(vec![RegClass::Integer]))
        }
        t if !AGGREGATES => Err(SignatureError::Invocation(format!(
            "aggregate {} by value is not supported on this platform",
            t
        ))),
        t => {
            let size = Layout::of(t)?.size;
            if size > 16 {
                return Ok(Placement::Memory);
            }
            let mut scalars = Vec::new();
            flatten(t, 0, &mut scalars)?;
            let eightbytes = size.div_ceil(8);
            let classes = (0..eightbytes)
                .map(|e| {
                    let all_float = scalars
                        .iter()
                        .filter(|(offset, _)| offset / 8 == e)
                        .all(|(_, floating)| *floating);
                    if all_float {
                        RegClass::Sse
                    } else {
                        RegClass::Integer
                    }
                })
                .collect();
            Ok(Placement::Registers(classes))
        }
    }
}

/// Collect (offset, is_floating) for every scalar inside an aggregate
fn flatten(ty: &TypeEncoding, base: usize, out: &mut Vec<(usize, bool)>) -> Result<()> {
    match ty {
        TypeEncoding::Struct { fields, .. } => {
            for (field, offset) in fields.iter().zip(struct_offsets(fields)?) {
                flatten(field, base + offset, out)?;
            }
        }
        TypeEncoding::Array { len, element } => {
            let size = Layout::of(element)?.size;
            for i in 0..*len {
                flatten(element, base + i * size, out)?;
            }
        }
        other => out.push((base, other.is_floating())),
    }
    Ok(())
}

fn plan(signature: &MethodSignature) -> Result<CallPlan> {
    if !SUPPORTED {
        return Err(SignatureError::Invocation(
            "native calls are not supported on this platform".to_string(),
        ));
    }

    let ret = classify(&signature.return_info().encoding)?;
    let mut ints = usize::from(ret == Placement::Memory);
    let mut floats = 0usize;

    let mut args = Vec::with_capacity(signature.number_of_arguments());
    for info in signature.arguments() {
        let placement = classify(&info.encoding)?;
        match &placement {
            Placement::Registers(classes) => {
                for class in classes {
                    match class {
                        RegClass::Integer => ints += 1,
                        RegClass::Sse => floats += 1,
                    }
                }
            }
            _ => {
                return Err(SignatureError::Invocation(format!(
                    "argument {} ({}) would be passed on the stack",
                    info.index.unwrap_or_default(),
                    info.encoding
                )))
            }
        }
        args.push(placement);
    }

    if ints > INT_REGISTERS || floats > FLOAT_REGISTERS {
        return Err(SignatureError::Invocation(format!(
            "{} needs {} integer and {} floating registers; only {} and {} are available",
            signature, ints, floats, INT_REGISTERS, FLOAT_REGISTERS
        )));
    }

    Ok(CallPlan { ret, args })
}

/// Sign- or zero-extend an integer-class slot to a full register
fn widen(ty: &TypeEncoding, bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    let unsigned = u64::from_le_bytes(raw);
    match ty {
        TypeEncoding::Char => unsigned as u8 as i8 as i64 as u64,
        TypeEncoding::Short => unsigned as u16 as i16 as i64 as u64,
        TypeEncoding::Int | TypeEncoding::Long => unsigned as u32 as i32 as i64 as u64,
        _ => unsigned,
    }
}

/// Read the eightbyte at `index` of a slot, zero-padded
fn eightbyte(bytes: &[u8], index: usize) -> u64 {
    let start = index * 8;
    let end = bytes.len().min(start + 8);
    let mut raw = [0u8; 8];
    raw[..end - start].copy_from_slice(&bytes[start..end]);
    u64::from_le_bytes(raw)
}

type RegisterFn<R> =
    unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, f64, f64, f64, f64, f64, f64, f64, f64) -> R;

#[repr(C)]
#[derive(Clone, Copy)]
struct IntInt(u64, u64);

#[repr(C)]
#[derive(Clone, Copy)]
struct SseSse(f64, f64);

#[repr(C)]
#[derive(Clone, Copy)]
struct IntSse(u64, f64);

#[repr(C)]
#[derive(Clone, Copy)]
struct SseInt(f64, u64);

unsafe fn call_registers<R: Copy>(function: *const (), i: &[u64; 6], f: &[f64; 8]) -> R {
    let target = std::mem::transmute::<*const (), RegisterFn<R>>(function);
    target(i[0], i[1], i[2], i[3], i[4], i[5], f[0], f[1], f[2], f[3], f[4], f[5], f[6], f[7])
}

/// Register-only native-call backend
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterTrampoline;

impl CallBackend for RegisterTrampoline {
    fn name(&self) -> &'static str {
        "register-trampoline"
    }

    fn check(&self, signature: &MethodSignature) -> Result<()> {
        plan(signature).map(|_| ())
    }

    unsafe fn call(&self, frame: &mut CallFrame, function: *const ()) -> Result<()> {
        let signature = frame.signature().clone();
        let plan = plan(&signature)?;

        let mut ints = [0u64; INT_REGISTERS];
        let mut floats = [0f64; FLOAT_REGISTERS];
        let mut ni = 0;
        let mut nf = 0;

        if plan.ret == Placement::Memory {
            ints[ni] = frame.return_address() as u64;
            ni += 1;
        }

        for (info, placement) in signature.arguments().iter().zip(&plan.args) {
            let index = info.index.unwrap_or_default();
            let bytes = frame.argument(index)?;
            let Placement::Registers(classes) = placement else {
                continue;
            };
            if info.encoding.is_aggregate() {
                for (e, class) in classes.iter().enumerate() {
                    let word = eightbyte(bytes, e);
                    match class {
                        RegClass::Integer => {
                            ints[ni] = word;
                            ni += 1;
                        }
                        RegClass::Sse => {
                            floats[nf] = f64::from_bits(word);
                            nf += 1;
                        }
                    }
                }
            } else if info.encoding.is_floating() {
                // A float travels in the low half of its vector register
                floats[nf] = f64::from_bits(eightbyte(bytes, 0));
                nf += 1;
            } else {
                ints[ni] = widen(&info.encoding, bytes);
                ni += 1;
            }
        }

        trace!(
            "{} calling {:p} as {} ({} int, {} float registers)",
            self.name(),
            function,
            signature,
            ni,
            nf
        );

        let words: Vec<u64> = match &plan.ret {
            Placement::Void | Placement::Memory => {
                call_registers::<u64>(function, &ints, &floats);
                Vec::new()
            }
            Placement::Registers(classes) => match classes.as_slice() {
                [RegClass::Integer] => vec![call_registers::<u64>(function, &ints, &floats)],
                [RegClass::Sse] => {
                    vec![call_registers::<f64>(function, &ints, &floats).to_bits()]
                }
                [RegClass::Integer, RegClass::Integer] => {
                    let r = call_registers::<IntInt>(function, &ints, &floats);
                    vec![r.0, r.1]
                }
                [RegClass::Sse, RegClass::Sse] => {
                    let r = call_registers::<SseSse>(function, &ints, &floats);
                    vec![r.0.to_bits(), r.1.to_bits()]
                }
                [RegClass::Integer, RegClass::Sse] => {
                    let r = call_registers::<IntSse>(function, &ints, &floats);
                    vec![r.0, r.1.to_bits()]
                }
                [RegClass::Sse, RegClass::Integer] => {
                    let r = call_registers::<SseInt>(function, &ints, &floats);
                    vec![r.0.to_bits(), r.1]
                }
                other => {
                    return Err(SignatureError::Invocation(format!(
                        "unsupported return classification {:?}",
                        other
                    )))
                }
            },
        };

        let ret = frame.return_bytes_mut();
        for (e, word) in words.iter().enumerate() {
            let start = e * 8;
            let end = ret.len().min(start + 8);
            ret[start..end].copy_from_slice(&word.to_le_bytes()[..end - start]);
        }
        Ok(())
    }
}
