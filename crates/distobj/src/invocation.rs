//! Invocations
//!
//! An [`Invocation`] is one method call in flight: the selector, its
//! signature, the argument and return values, and the [`CallFrame`] that
//! mirrors them in host layout. Method bodies read and write arguments
//! through it; native implementations are called with its frame.

use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::Arc;

use do_coder::{is_plain_data, read_native, write_native, ClassRef, NodeId, ObjectGraph, ObjectNode, Value};
use do_signature::{
    ArgumentInfo, CallFrame, Layout, MethodSignature, RegisterTrampoline, SignatureError, TypeEncoding,
};

use crate::error::{DoError, Result};
use crate::object::DoObject;
use crate::proxy::DistantObject;

/// Class name of string copies built by [`ObjectCopy::string`]
pub const STRING_CLASS: &str = "String";

/// An object value as seen by a method body
#[derive(Clone)]
pub enum ObjectHandle {
    /// An object living in this process
    Local(Arc<dyn DoObject>),
    /// A stand-in for an object owned by the peer
    Proxy(Arc<DistantObject>),
    /// An independent copy received by value
    Copy(ObjectCopy),
}

impl ObjectHandle {
    pub fn local<T: DoObject>(object: Arc<T>) -> Self {
        ObjectHandle::Local(object)
    }

    pub fn as_local(&self) -> Option<&Arc<dyn DoObject>> {
        match self {
            ObjectHandle::Local(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Arc<DistantObject>> {
        match self {
            ObjectHandle::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_copy(&self) -> Option<&ObjectCopy> {
        match self {
            ObjectHandle::Copy(copy) => Some(copy),
            _ => None,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, ObjectHandle::Proxy(_))
    }

    /// Whether both handles denote the same object
    pub fn same_object(&self, other: &ObjectHandle) -> bool {
        match (self, other) {
            (ObjectHandle::Local(a), ObjectHandle::Local(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            (ObjectHandle::Proxy(a), ObjectHandle::Proxy(b)) => Arc::ptr_eq(a, b),
            (ObjectHandle::Copy(a), ObjectHandle::Copy(b)) => {
                a.graph.id() == b.graph.id() && a.root == b.root
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectHandle::Local(object) => write!(f, "Local({})", object.class_name()),
            ObjectHandle::Proxy(proxy) => write!(f, "Proxy(target {})", proxy.target()),
            ObjectHandle::Copy(copy) => write!(f, "Copy({:?})", copy.class_name()),
        }
    }
}

/// An object received by value, owned by the decode session that built it
#[derive(Clone)]
pub struct ObjectCopy {
    graph: Arc<ObjectGraph>,
    root: NodeId,
}

impl ObjectCopy {
    pub fn new(graph: ObjectGraph, root: NodeId) -> Result<Self> {
        Self::shared(Arc::new(graph), root)
    }

    pub(crate) fn shared(graph: Arc<ObjectGraph>, root: NodeId) -> Result<Self> {
        if graph.object(root).is_none() {
            return Err(DoError::Protocol(format!("{} is not an object", root)));
        }
        Ok(Self { graph, root })
    }

    /// A string object holding `s`
    pub fn string(s: impl Into<String>) -> Self {
        let mut graph = ObjectGraph::new();
        let root = graph.add_object(ClassRef::new(STRING_CLASS), vec![Value::string(s)]);
        Self {
            graph: Arc::new(graph),
            root,
        }
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self) -> Option<&ObjectNode> {
        self.graph.object(self.root)
    }

    pub fn class_name(&self) -> Option<&str> {
        self.node().map(|node| node.class.name.as_str())
    }

    /// Contents of a string copy
    pub fn as_str(&self) -> Option<&str> {
        let node = self.node()?;
        if node.class.name != STRING_CLASS {
            return None;
        }
        node.fields.first()?.as_str()
    }

    /// Structural equality under object identity
    pub fn is_isomorphic(&self, other: &ObjectCopy) -> bool {
        self.graph.is_isomorphic(self.root, &other.graph, other.root)
    }
}

impl fmt::Debug for ObjectCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCopy")
            .field("class", &self.class_name())
            .field("root", &self.root)
            .finish()
    }
}

/// One argument or return value
#[derive(Debug, Clone)]
pub enum Argument {
    Void,
    /// Any value that is neither an object nor a pointer
    Scalar(Value),
    /// A pointer and its pointee; `None` is NULL
    Pointer(Option<Value>),
    Object(Option<ObjectHandle>),
}

impl Argument {
    pub fn string(s: impl Into<String>) -> Self {
        Argument::Scalar(Value::string(s))
    }

    pub fn object(handle: ObjectHandle) -> Self {
        Argument::Object(Some(handle))
    }

    pub fn nil() -> Self {
        Argument::Object(None)
    }

    /// The zero value for a slot: numbers are 0, references nil
    pub fn zeroed(info: &ArgumentInfo) -> Self {
        match &info.encoding {
            TypeEncoding::Void => Argument::Void,
            TypeEncoding::Object => Argument::Object(None),
            TypeEncoding::Pointer(_) => Argument::Pointer(None),
            other => Value::zeroed(other).map_or(Argument::Void, Argument::Scalar),
        }
    }

    /// Scalar value, or the pointee of a pointer
    pub fn value(&self) -> Option<&Value> {
        match self {
            Argument::Scalar(value) | Argument::Pointer(Some(value)) => Some(value),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&ObjectHandle> {
        match self {
            Argument::Object(Some(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value().and_then(Value::as_str)
    }

    /// Whether this argument can occupy a slot described by `info`
    pub fn matches(&self, info: &ArgumentInfo) -> bool {
        match (self, &info.encoding) {
            (Argument::Void, TypeEncoding::Void) => true,
            (Argument::Object(_), TypeEncoding::Object) => true,
            (Argument::Pointer(None), TypeEncoding::Pointer(_)) => true,
            (Argument::Pointer(Some(value)), TypeEncoding::Pointer(inner)) => {
                value.matches(inner) && !has_references(value)
            }
            (Argument::Scalar(value), encoding) => {
                !matches!(encoding, TypeEncoding::Object | TypeEncoding::Pointer(_))
                    && value.matches(encoding)
                    && !has_references(value)
            }
            _ => false,
        }
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Scalar(value)
    }
}

impl From<ObjectHandle> for Argument {
    fn from(handle: ObjectHandle) -> Self {
        Argument::Object(Some(handle))
    }
}

/// Whether a value embeds graph references
pub(crate) fn has_references(value: &Value) -> bool {
    match value {
        Value::Object(_) | Value::WeakObject(_) | Value::ConstPointer(_) => true,
        Value::Struct(values) | Value::Array(values) => values.iter().any(has_references),
        _ => false,
    }
}

/// Result of a forwarded call: the return value and the arguments as the
/// callee left them (out parameters updated)
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub return_value: Argument,
    pub arguments: Vec<Argument>,
}

/// One method call
pub struct Invocation {
    selector: String,
    frame: CallFrame,
    arguments: Vec<Argument>,
    return_value: Argument,
}

impl Invocation {
    pub fn new(selector: &str, signature: Arc<MethodSignature>) -> Result<Self> {
        let arguments: Vec<Argument> = signature.arguments().iter().map(Argument::zeroed).collect();
        let return_value = Argument::zeroed(signature.return_info());
        let mut invocation = Self {
            selector: selector.to_string(),
            frame: CallFrame::new(signature),
            arguments,
            return_value,
        };
        if invocation.signature().is_method() {
            invocation.set_at(1, Argument::Scalar(Value::selector(selector)))?;
        }
        Ok(invocation)
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn signature(&self) -> &Arc<MethodSignature> {
        self.frame.signature()
    }

    pub fn frame(&self) -> &CallFrame {
        &self.frame
    }

    /// The receiver, for method signatures
    pub fn target(&self) -> Option<&ObjectHandle> {
        if self.signature().is_method() {
            self.arguments[0].handle()
        } else {
            None
        }
    }

    pub fn set_target(&mut self, target: ObjectHandle) -> Result<()> {
        if !self.signature().is_method() {
            return Err(SignatureError::Invocation(format!(
                "{} has no receiver slot",
                self.signature()
            ))
            .into());
        }
        self.set_at(0, Argument::Object(Some(target)))
    }

    /// Number of explicit arguments
    pub fn argument_count(&self) -> usize {
        self.arguments.len() - self.signature().first_explicit()
    }

    /// Explicit arguments, after the receiver and selector
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments[self.signature().first_explicit()..]
    }

    pub fn argument(&self, index: usize) -> Result<&Argument> {
        let absolute = self.absolute(index)?;
        Ok(&self.arguments[absolute])
    }

    pub fn set_argument(&mut self, index: usize, argument: impl Into<Argument>) -> Result<()> {
        let absolute = self.absolute(index)?;
        self.set_at(absolute, argument.into())
    }

    /// Integer value of an explicit argument or its pointee
    pub fn integer(&self, index: usize) -> Result<i64> {
        let argument = self.argument(index)?;
        argument.as_i64().ok_or_else(|| self.mismatch(index, "integer", argument))
    }

    pub fn float(&self, index: usize) -> Result<f64> {
        let argument = self.argument(index)?;
        argument.as_f64().ok_or_else(|| self.mismatch(index, "floating point", argument))
    }

    /// String value of a `char *` argument; `None` for NULL
    pub fn string(&self, index: usize) -> Result<Option<&str>> {
        match self.argument(index)? {
            Argument::Scalar(Value::CString(s)) => Ok(s.as_deref()),
            other => Err(self.mismatch(index, "C string", other)),
        }
    }

    pub fn object(&self, index: usize) -> Result<Option<&ObjectHandle>> {
        match self.argument(index)? {
            Argument::Object(handle) => Ok(handle.as_ref()),
            other => Err(self.mismatch(index, "object", other)),
        }
    }

    pub fn return_value(&self) -> &Argument {
        &self.return_value
    }

    pub fn set_return_value(&mut self, value: impl Into<Argument>) -> Result<()> {
        let value = value.into();
        let info = self.signature().return_info().clone();
        if !value.matches(&info) {
            return Err(SignatureError::TypeMismatch {
                expected: info.encoding.to_string(),
                got: format!("{:?}", value),
            }
            .into());
        }
        if let Argument::Scalar(scalar) = &value {
            if is_plain_data(&info.encoding) {
                write_native(&info.encoding, scalar, self.frame.return_bytes_mut())?;
            }
        }
        self.return_value = value;
        Ok(())
    }

    /// Out and inout pointer arguments, by explicit index
    pub fn outputs(&self) -> impl Iterator<Item = (usize, &Argument)> {
        let first = self.signature().first_explicit();
        self.signature()
            .explicit_arguments()
            .iter()
            .zip(&self.arguments[first..])
            .enumerate()
            .filter(|(_, (info, _))| info.is_out_param())
            .map(|(i, (_, argument))| (i, argument))
    }

    pub fn into_outcome(self) -> CallOutcome {
        let first = self.signature().first_explicit();
        let mut arguments = self.arguments;
        CallOutcome {
            return_value: self.return_value,
            arguments: arguments.split_off(first),
        }
    }

    fn absolute(&self, index: usize) -> Result<usize> {
        let count = self.argument_count();
        if index >= count {
            return Err(SignatureError::IndexOutOfRange { index, count }.into());
        }
        Ok(index + self.signature().first_explicit())
    }

    fn mismatch(&self, index: usize, expected: &str, got: &Argument) -> DoError {
        SignatureError::TypeMismatch {
            expected: format!("{} for argument {} of {}", expected, index, self.selector),
            got: format!("{:?}", got),
        }
        .into()
    }

    /// Store an argument by absolute index, keeping the frame in sync
    pub(crate) fn set_at(&mut self, index: usize, argument: Argument) -> Result<()> {
        let info = self.signature().argument_info(index)?.clone();
        if !argument.matches(&info) {
            return Err(SignatureError::TypeMismatch {
                expected: info.encoding.to_string(),
                got: format!("{:?}", argument),
            }
            .into());
        }
        if let Argument::Scalar(value) = &argument {
            if is_plain_data(&info.encoding) {
                write_native(&info.encoding, value, self.frame.argument_mut(index)?)?;
            }
        }
        self.arguments[index] = argument;
        Ok(())
    }

    /// Call a native implementation with this invocation's arguments.
    ///
    /// Object slots carry a token (argument index + 1) rather than an
    /// address; an object return must be one of those tokens or 0.
    ///
    /// # Safety
    ///
    /// `function` must be an `extern "C"` function matching the signature
    /// exactly, and must not retain any pointer it receives.
    pub(crate) unsafe fn invoke_native(&mut self, function: *const ()) -> Result<()> {
        let signature = self.signature().clone();
        check_native_return(&signature.return_info().encoding)?;

        let mut strings: Vec<CString> = Vec::new();
        let mut buffers: Vec<(usize, Box<[u64]>)> = Vec::new();

        for (index, info) in signature.arguments().iter().enumerate() {
            match (&info.encoding, &self.arguments[index]) {
                (encoding, Argument::Scalar(value)) if is_plain_data(encoding) => {
                    write_native(encoding, value, self.frame.argument_mut(index)?)?;
                }
                (
                    TypeEncoding::CString | TypeEncoding::Selector | TypeEncoding::Class,
                    Argument::Scalar(value),
                ) => {
                    let address = match value.as_str() {
                        Some(s) => {
                            let c = CString::new(s).map_err(|_| {
                                SignatureError::Invocation(format!(
                                    "argument {} contains a NUL byte",
                                    index
                                ))
                            })?;
                            let address = c.as_ptr() as usize;
                            strings.push(c);
                            address
                        }
                        None => 0,
                    };
                    self.frame.set::<usize>(index, address)?;
                }
                (TypeEncoding::Object, Argument::Object(handle)) => {
                    let token = if handle.is_some() { index + 1 } else { 0 };
                    self.frame.set::<usize>(index, token)?;
                }
                (TypeEncoding::Pointer(_), Argument::Pointer(None)) => {
                    self.frame.set::<usize>(index, 0)?;
                }
                (TypeEncoding::Pointer(inner), Argument::Pointer(Some(value))) if is_plain_data(inner) => {
                    let size = Layout::of(inner)?.size;
                    let mut buffer = vec![0u64; size.div_ceil(8).max(1)].into_boxed_slice();
                    write_native(inner, value, &mut words_as_bytes(&mut buffer)[..size])?;
                    self.frame.set::<usize>(index, buffer.as_mut_ptr() as usize)?;
                    buffers.push((index, buffer));
                }
                (encoding, _) => {
                    return Err(SignatureError::Invocation(format!(
                        "native methods cannot take {} arguments",
                        encoding
                    ))
                    .into());
                }
            }
        }

        // SAFETY: every pointer slot refers to `strings` or `buffers`, which
        // outlive the call; the caller guarantees the function's signature.
        self.frame.invoke(&RegisterTrampoline, function)?;

        for (index, mut buffer) in buffers {
            if let TypeEncoding::Pointer(inner) = &signature.arguments()[index].encoding {
                let size = Layout::of(inner)?.size;
                let value = read_native(inner, &words_as_bytes(&mut buffer)[..size])?;
                self.arguments[index] = Argument::Pointer(Some(value));
            }
        }
        drop(strings);

        let encoding = &signature.return_info().encoding;
        self.return_value = match encoding {
            TypeEncoding::Void => Argument::Void,
            TypeEncoding::Object => {
                let token = self.frame.return_value::<usize>()?;
                if token == 0 {
                    Argument::Object(None)
                } else {
                    match self.arguments.get(token - 1) {
                        Some(Argument::Object(Some(handle))) => Argument::Object(Some(handle.clone())),
                        _ => {
                            return Err(SignatureError::Invocation(format!(
                                "native method returned unknown object token {}",
                                token
                            ))
                            .into())
                        }
                    }
                }
            }
            TypeEncoding::CString | TypeEncoding::Selector | TypeEncoding::Class => {
                let address = self.frame.return_value::<usize>()?;
                let text = if address == 0 {
                    None
                } else {
                    // SAFETY: a string return must point at a NUL-terminated
                    // string that stays valid after the call.
                    Some(CStr::from_ptr(address as *const std::ffi::c_char).to_string_lossy().into_owned())
                };
                Argument::Scalar(match encoding {
                    TypeEncoding::Selector => Value::Selector(text),
                    TypeEncoding::Class => Value::Class(text),
                    _ => Value::CString(text),
                })
            }
            other => Argument::Scalar(read_native(other, self.frame.return_bytes())?),
        };
        Ok(())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("selector", &self.selector)
            .field("signature", &self.signature().type_string())
            .field("arguments", &self.arguments)
            .field("return_value", &self.return_value)
            .finish()
    }
}

fn check_native_return(encoding: &TypeEncoding) -> Result<()> {
    match encoding {
        TypeEncoding::Void
        | TypeEncoding::Object
        | TypeEncoding::CString
        | TypeEncoding::Selector
        | TypeEncoding::Class => Ok(()),
        other if is_plain_data(other) => Ok(()),
        other => Err(SignatureError::Invocation(format!("native methods cannot return {}", other)).into()),
    }
}

fn words_as_bytes(words: &mut [u64]) -> &mut [u8] {
    // SAFETY: u8 has no alignment or validity requirements.
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8) }
}
