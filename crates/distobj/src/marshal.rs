//! Message payloads
//!
//! Every payload is one coder session. Objects passed by reference travel
//! as small reference records; everything else travels by value.
//!
//! Method request: `UInt target, Selector, CString types`, then each
//! explicit argument (out-only pointers are skipped).
//!
//! Method reply: `Bool raised`, then either an exception record or the
//! return value followed by every out and inout pointer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use do_coder::{ClassRef, Decoder, Encoder, NodeId, ObjectGraph, Value};
use do_signature::{ArgumentInfo, TypeEncoding};
use tracing::debug;

use crate::connection::ConnectionInner;
use crate::error::{DoError, Result};
use crate::invocation::{has_references, Argument, Invocation, ObjectCopy, ObjectHandle};
use crate::object::DoObject;
use crate::proxy::DistantObject;

/// Class of reference records: `[UInt target, Bool sender_owns]`
pub const REFERENCE_CLASS: &str = "DistantObject";

/// Class of exception records: `[CString name, CString reason]`
pub const EXCEPTION_CLASS: &str = "RemoteException";

fn protocol(message: impl Into<String>) -> DoError {
    DoError::Protocol(message.into())
}

fn identity<T: ?Sized>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// References one outgoing message added to the exporter.
///
/// They are given back on drop unless [`commit`](Self::commit) is called
/// once the message has been sent.
#[derive(Default)]
pub(crate) struct VendedRefs {
    conn: Weak<ConnectionInner>,
    targets: Vec<u32>,
}

impl VendedRefs {
    fn new(conn: &Arc<ConnectionInner>) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            targets: Vec::new(),
        }
    }

    /// The peer has the message and now owns the references
    pub(crate) fn commit(mut self) {
        self.targets.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.targets.len()
    }
}

impl Drop for VendedRefs {
    fn drop(&mut self) {
        if self.targets.is_empty() {
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        debug!("Returning {} references of an unsent message", self.targets.len());
        for target in self.targets.drain(..) {
            conn.exporter.release(target, 1);
        }
    }
}

/// An encoded payload together with the references it vends
pub(crate) struct Outgoing {
    pub(crate) payload: Bytes,
    pub(crate) refs: VendedRefs,
}

impl From<Bytes> for Outgoing {
    fn from(payload: Bytes) -> Self {
        Self {
            payload,
            refs: VendedRefs::default(),
        }
    }
}

/// Encodes one payload for a connection
pub(crate) struct MessageWriter<'a> {
    conn: &'a Arc<ConnectionInner>,
    encoder: Encoder,
    references: ObjectGraph,
    vended: HashMap<usize, NodeId>,
    refs: VendedRefs,
}

impl<'a> MessageWriter<'a> {
    pub(crate) fn new(conn: &'a Arc<ConnectionInner>) -> Self {
        Self {
            conn,
            encoder: Encoder::new(),
            references: ObjectGraph::new(),
            vended: HashMap::new(),
            refs: VendedRefs::new(conn),
        }
    }

    pub(crate) fn value(&mut self, encoding: &TypeEncoding, value: &Value) -> Result<()> {
        Ok(self.encoder.encode_typed(encoding, value)?)
    }

    /// Encode an argument in the slot described by `info`
    pub(crate) fn argument(&mut self, info: &ArgumentInfo, argument: &Argument) -> Result<()> {
        match (&info.encoding, argument) {
            (TypeEncoding::Object, Argument::Object(handle)) => self.object(handle.as_ref(), info.is_bycopy()),
            (TypeEncoding::Pointer(_), Argument::Pointer(pointee)) => {
                let mut graph = ObjectGraph::new();
                let pointer = Value::ConstPointer(pointee.clone().map(|value| graph.add_pointee(value)));
                Ok(self.encoder.encode_typed_in(&graph, &info.encoding, &pointer)?)
            }
            (encoding, Argument::Scalar(value)) => self.value(encoding, value),
            (encoding, other) => Err(protocol(format!("cannot send {:?} as {}", other, encoding))),
        }
    }

    pub(crate) fn object(&mut self, handle: Option<&ObjectHandle>, bycopy: bool) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(self.encoder.encode_object(&self.references, None)?);
        };
        match handle {
            ObjectHandle::Copy(copy) => Ok(self.encoder.encode_object(copy.graph(), Some(copy.root()))?),
            ObjectHandle::Proxy(proxy) => {
                if proxy.belongs_to(self.conn) {
                    self.reference(identity(proxy), proxy.target(), false)
                } else {
                    let object: Arc<dyn DoObject> = proxy.clone();
                    self.vend(object)
                }
            }
            ObjectHandle::Local(object) => match object.as_proxy() {
                Some(proxy) if proxy.belongs_to(self.conn) => {
                    self.reference(identity(object), proxy.target(), false)
                }
                _ => {
                    if bycopy {
                        let mut graph = ObjectGraph::new();
                        if let Some(root) = object.encode_copy(&mut graph) {
                            return Ok(self.encoder.encode_object(&graph, Some(root))?);
                        }
                    }
                    self.vend(object.clone())
                }
            },
        }
    }

    /// Export a local object, once per message
    fn vend(&mut self, object: Arc<dyn DoObject>) -> Result<()> {
        let key = identity(&object);
        if let Some(node) = self.vended.get(&key).copied() {
            return Ok(self.encoder.encode_object(&self.references, Some(node))?);
        }
        let target = self.conn.exporter.export(object);
        self.refs.targets.push(target);
        self.reference(key, target, true)
    }

    fn reference(&mut self, key: usize, target: u32, sender_owns: bool) -> Result<()> {
        let node = match self.vended.get(&key) {
            Some(node) => *node,
            None => {
                let node = self.references.add_object(
                    ClassRef::new(REFERENCE_CLASS),
                    vec![Value::UInt(target), Value::Bool(sender_owns)],
                );
                self.vended.insert(key, node);
                node
            }
        };
        Ok(self.encoder.encode_object(&self.references, Some(node))?)
    }

    /// On error the references vended so far are given back
    pub(crate) fn finish(self) -> Result<Outgoing> {
        let Self { encoder, refs, .. } = self;
        Ok(Outgoing {
            payload: encoder.finish()?,
            refs,
        })
    }
}

/// Turns decoded values back into arguments
pub(crate) struct Resolver<'a> {
    conn: &'a Arc<ConnectionInner>,
    graph: Arc<ObjectGraph>,
    resolved: HashMap<NodeId, ObjectHandle>,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(conn: &'a Arc<ConnectionInner>, graph: ObjectGraph) -> Self {
        Self {
            conn,
            graph: Arc::new(graph),
            resolved: HashMap::new(),
        }
    }

    /// `None` stands for an out-only pointer the sender did not transmit
    pub(crate) fn argument(&mut self, info: &ArgumentInfo, value: Option<Value>) -> Result<Argument> {
        let Some(value) = value else {
            let TypeEncoding::Pointer(inner) = &info.encoding else {
                return Err(protocol(format!("missing value for {}", info.encoding)));
            };
            return match Value::zeroed(inner) {
                Some(zero) if has_references(&zero) => {
                    Err(protocol(format!("unsupported out parameter type {}", info.encoding)))
                }
                zero => Ok(Argument::Pointer(zero)),
            };
        };
        match value {
            Value::Object(id) | Value::WeakObject(id) => Ok(Argument::Object(self.object(id)?)),
            Value::ConstPointer(None) => Ok(Argument::Pointer(None)),
            Value::ConstPointer(Some(id)) => {
                let pointee = self
                    .graph
                    .pointee(id)
                    .cloned()
                    .ok_or_else(|| protocol("dangling pointer"))?;
                if has_references(&pointee) {
                    return Err(protocol("pointee holds object references"));
                }
                Ok(Argument::Pointer(Some(pointee)))
            }
            scalar => {
                if has_references(&scalar) {
                    return Err(protocol(format!("unsupported argument type {}", info.encoding)));
                }
                Ok(Argument::Scalar(scalar))
            }
        }
    }

    pub(crate) fn object(&mut self, id: Option<NodeId>) -> Result<Option<ObjectHandle>> {
        let Some(id) = id else {
            return Ok(None);
        };
        if let Some(handle) = self.resolved.get(&id) {
            return Ok(Some(handle.clone()));
        }
        let node = self
            .graph
            .object(id)
            .ok_or_else(|| protocol("object reference to a non-object"))?;
        let handle = if node.class.name == REFERENCE_CLASS {
            let (target, sender_owns) = match node.fields.as_slice() {
                [Value::UInt(target), Value::Bool(owns)] => (*target, *owns),
                _ => return Err(protocol("malformed object reference")),
            };
            if sender_owns {
                ObjectHandle::Proxy(self.conn.proxy_for(target))
            } else {
                let object = self.conn.exporter.get(target).ok_or(DoError::ObjectNotFound(target))?;
                ObjectHandle::Local(object)
            }
        } else {
            ObjectHandle::Copy(ObjectCopy::shared(self.graph.clone(), id)?)
        };
        self.resolved.insert(id, handle.clone());
        Ok(Some(handle))
    }
}

fn decode_uint(decoder: &mut Decoder) -> Result<u32> {
    match decoder.decode_typed(&TypeEncoding::UInt)? {
        Value::UInt(value) => Ok(value),
        _ => Err(protocol("expected unsigned int")),
    }
}

/// Read the value for one explicit argument; out-only pointers are absent
fn read_argument(decoder: &mut Decoder, info: &ArgumentInfo) -> Result<Option<Value>> {
    if !info.is_in_param() {
        return Ok(None);
    }
    Ok(Some(decoder.decode_typed(&info.encoding)?))
}

pub(crate) fn encode_request(conn: &Arc<ConnectionInner>, target: u32, invocation: &Invocation) -> Result<Outgoing> {
    let signature = invocation.signature();
    let mut writer = MessageWriter::new(conn);
    writer.value(&TypeEncoding::UInt, &Value::UInt(target))?;
    writer.value(&TypeEncoding::Selector, &Value::selector(invocation.selector()))?;
    writer.value(&TypeEncoding::CString, &Value::string(signature.type_string()))?;
    for (info, argument) in signature.explicit_arguments().iter().zip(invocation.arguments()) {
        if info.is_in_param() {
            writer.argument(info, argument)?;
        }
    }
    writer.finish()
}

/// Decode and run one method request. Errors become exception replies.
pub(crate) fn serve_request(conn: &Arc<ConnectionInner>, payload: Bytes) -> Result<Outgoing> {
    let mut decoder = Decoder::new(payload);
    let target = decode_uint(&mut decoder)?;
    let selector = match decoder.decode_typed(&TypeEncoding::Selector)? {
        Value::Selector(Some(selector)) => selector,
        _ => return Err(protocol("request without selector")),
    };
    let types = match decoder.decode_typed(&TypeEncoding::CString)? {
        Value::CString(Some(types)) => types,
        _ => return Err(protocol("request without method types")),
    };
    let remote = conn.parse_signature(&types)?;
    let object = conn.exporter.get(target).ok_or(DoError::ObjectNotFound(target))?;
    let signature = object
        .method_signature(&selector)
        .ok_or_else(|| DoError::UnknownSelector {
            class: object.class_name().to_string(),
            selector: selector.clone(),
        })?;
    if !signature.is_compatible_with(&remote) {
        return Err(protocol(format!(
            "{} is {} here but {} at the caller",
            selector,
            signature.type_string(),
            remote.type_string()
        )));
    }

    let values = signature
        .explicit_arguments()
        .iter()
        .map(|info| read_argument(&mut decoder, info))
        .collect::<Result<Vec<_>>>()?;
    let mut resolver = Resolver::new(conn, decoder.finish()?);

    let mut invocation = Invocation::new(&selector, signature.clone())?;
    invocation.set_target(ObjectHandle::Local(object.clone()))?;
    for (index, (info, value)) in signature.explicit_arguments().iter().zip(values).enumerate() {
        let argument = resolver.argument(info, value)?;
        invocation.set_argument(index, argument)?;
    }
    drop(resolver);

    object.invoke(&selector, &mut invocation)?;
    encode_reply(conn, &invocation)
}

pub(crate) fn encode_reply(conn: &Arc<ConnectionInner>, invocation: &Invocation) -> Result<Outgoing> {
    let signature = invocation.signature();
    let mut writer = MessageWriter::new(conn);
    writer.value(&TypeEncoding::Bool, &Value::Bool(false))?;
    let returns = signature.return_info();
    if returns.encoding != TypeEncoding::Void {
        writer.argument(returns, invocation.return_value())?;
    }
    for (info, argument) in signature.explicit_arguments().iter().zip(invocation.arguments()) {
        if info.is_out_param() {
            writer.argument(info, argument)?;
        }
    }
    writer.finish()
}

pub(crate) fn encode_exception(error: &DoError) -> Result<Bytes> {
    let mut graph = ObjectGraph::new();
    let node = graph.add_object(
        ClassRef::new(EXCEPTION_CLASS),
        vec![
            Value::string(error.exception_name()),
            Value::string(error.exception_reason()),
        ],
    );
    let mut encoder = Encoder::new();
    encoder.encode_typed(&TypeEncoding::Bool, &Value::Bool(true))?;
    encoder.encode_object(&graph, Some(node))?;
    Ok(encoder.finish()?)
}

fn exception_from(graph: &ObjectGraph, id: Option<NodeId>) -> DoError {
    let node = id.and_then(|id| graph.object(id));
    match node {
        Some(node) if node.class.name == EXCEPTION_CLASS => {
            let field = |i: usize| {
                node.fields
                    .get(i)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            DoError::RemoteException {
                name: field(0),
                reason: field(1),
            }
        }
        _ => protocol("malformed exception record"),
    }
}

/// Apply a reply to the invocation that produced the request
pub(crate) fn decode_reply(conn: &Arc<ConnectionInner>, payload: Bytes, invocation: &mut Invocation) -> Result<()> {
    let mut decoder = Decoder::new(payload);
    let raised = match decoder.decode_typed(&TypeEncoding::Bool)? {
        Value::Bool(raised) => raised,
        _ => return Err(protocol("reply without status")),
    };
    if raised {
        let id = decoder.decode_object()?;
        let graph = decoder.finish()?;
        return Err(exception_from(&graph, id));
    }

    let signature = invocation.signature().clone();
    let returns = signature.return_info();
    let returned = if returns.encoding != TypeEncoding::Void {
        Some(decoder.decode_typed(&returns.encoding)?)
    } else {
        None
    };
    let mut outputs = Vec::new();
    for (index, info) in signature.explicit_arguments().iter().enumerate() {
        if info.is_out_param() {
            outputs.push((index, info, decoder.decode_typed(&info.encoding)?));
        }
    }

    let mut resolver = Resolver::new(conn, decoder.finish()?);
    if let Some(value) = returned {
        let argument = resolver.argument(returns, Some(value))?;
        invocation.set_return_value(argument)?;
    }
    for (index, info, value) in outputs {
        // A NULL out pointer stays NULL whatever the callee wrote.
        if matches!(invocation.argument(index)?, Argument::Pointer(None)) {
            continue;
        }
        let argument = resolver.argument(info, Some(value))?;
        invocation.set_argument(index, argument)?;
    }
    Ok(())
}

pub(crate) fn encode_root_reply(conn: &Arc<ConnectionInner>) -> Result<Outgoing> {
    let root = conn.exporter.root().map(ObjectHandle::Local);
    let mut writer = MessageWriter::new(conn);
    writer.object(root.as_ref(), false)?;
    writer.finish()
}

pub(crate) fn decode_root_reply(conn: &Arc<ConnectionInner>, payload: Bytes) -> Result<Arc<DistantObject>> {
    let mut decoder = Decoder::new(payload);
    let id = decoder.decode_object()?;
    let mut resolver = Resolver::new(conn, decoder.finish()?);
    match resolver.object(id)? {
        Some(ObjectHandle::Proxy(proxy)) => Ok(proxy),
        Some(_) => Err(protocol("root object was not sent by reference")),
        None => Err(DoError::NoRootObject),
    }
}

pub(crate) fn encode_method_type_request(target: u32, selector: &str) -> Result<Bytes> {
    let mut encoder = Encoder::new();
    encoder.encode_typed(&TypeEncoding::UInt, &Value::UInt(target))?;
    encoder.encode_typed(&TypeEncoding::Selector, &Value::selector(selector))?;
    Ok(encoder.finish()?)
}

/// Look up method types for a peer; unknown targets and selectors get NULL
pub(crate) fn serve_method_type_request(conn: &Arc<ConnectionInner>, payload: Bytes) -> Result<Bytes> {
    let mut decoder = Decoder::new(payload);
    let target = decode_uint(&mut decoder)?;
    let selector = match decoder.decode_typed(&TypeEncoding::Selector)? {
        Value::Selector(Some(selector)) => selector,
        _ => return Err(protocol("method type request without selector")),
    };
    decoder.finish()?;

    let types = conn
        .exporter
        .get(target)
        .and_then(|object| object.method_signature(&selector))
        .map(|signature| signature.type_string().to_string());
    let mut encoder = Encoder::new();
    encoder.encode_typed(&TypeEncoding::CString, &Value::CString(types))?;
    Ok(encoder.finish()?)
}

pub(crate) fn decode_method_type_reply(payload: Bytes) -> Result<Option<String>> {
    let mut decoder = Decoder::new(payload);
    let types = match decoder.decode_typed(&TypeEncoding::CString)? {
        Value::CString(types) => types,
        _ => return Err(protocol("method type reply without types")),
    };
    decoder.finish()?;
    Ok(types)
}

pub(crate) fn encode_release(target: u32, count: u32) -> Result<Bytes> {
    let mut encoder = Encoder::new();
    encoder.encode_typed(&TypeEncoding::UInt, &Value::UInt(target))?;
    encoder.encode_typed(&TypeEncoding::UInt, &Value::UInt(count))?;
    Ok(encoder.finish()?)
}

pub(crate) fn decode_release(payload: Bytes) -> Result<(u32, u32)> {
    let mut decoder = Decoder::new(payload);
    let target = decode_uint(&mut decoder)?;
    let count = decode_uint(&mut decoder)?;
    decoder.finish()?;
    Ok((target, count))
}
