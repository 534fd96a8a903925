//! Encoding sessions
//!
//! An [`Encoder`] writes values and object graphs to a byte stream. It keeps
//! an identity table so an object reached twice is written once and then
//! referenced by its cross-reference id, which also makes cycles finite.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use do_signature::TypeEncoding;
use tracing::trace;

use crate::error::{CoderError, Result};
use crate::graph::{ClassRef, NodeId, ObjectGraph};
use crate::tags::*;
use crate::value::Value;
use crate::wire::put_string;

/// Deepest nesting of objects, structs, arrays and pointers
pub const MAX_DEPTH: usize = 512;

type NodeKey = (u64, NodeId);

/// A single encoding session
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
    xrefs: HashMap<NodeKey, u32>,
    classes: HashMap<String, u32>,
    forwards: HashMap<NodeKey, u32>,
    next_xref: u32,
    next_forward: u32,
    depth: usize,
    root_written: bool,
    objects_written: usize,
    failed: bool,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            xrefs: HashMap::new(),
            classes: HashMap::new(),
            forwards: HashMap::new(),
            next_xref: 1,
            next_forward: 1,
            depth: 0,
            root_written: false,
            objects_written: 0,
            failed: false,
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of distinct object records written
    pub fn objects_written(&self) -> usize {
        self.objects_written
    }

    fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.failed {
            return Err(CoderError::SessionAborted);
        }
        let result = f(self);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Encode a value that refers to no graph nodes
    pub fn encode_value(&mut self, value: &Value) -> Result<()> {
        self.run(|enc| enc.write_value(None, value))
    }

    /// Encode a value whose references point into `graph`
    pub fn encode_value_in(&mut self, graph: &ObjectGraph, value: &Value) -> Result<()> {
        self.run(|enc| enc.write_value(Some(graph), value))
    }

    /// Encode a value after checking it against a declared type
    pub fn encode_typed(&mut self, encoding: &TypeEncoding, value: &Value) -> Result<()> {
        self.run(|enc| {
            check_typed(None, encoding, value)?;
            enc.write_value(None, value)
        })
    }

    pub fn encode_typed_in(
        &mut self,
        graph: &ObjectGraph,
        encoding: &TypeEncoding,
        value: &Value,
    ) -> Result<()> {
        self.run(|enc| {
            check_typed(Some(graph), encoding, value)?;
            enc.write_value(Some(graph), value)
        })
    }

    /// Encode an object reference unconditionally
    pub fn encode_object(&mut self, graph: &ObjectGraph, id: Option<NodeId>) -> Result<()> {
        self.encode_value_in(graph, &Value::Object(id))
    }

    /// Encode an object reference conditionally
    pub fn encode_conditional_object(
        &mut self,
        graph: &ObjectGraph,
        id: Option<NodeId>,
    ) -> Result<()> {
        self.encode_value_in(graph, &Value::WeakObject(id))
    }

    /// Close the session and return the stream
    pub fn finish(self) -> Result<Bytes> {
        if self.failed {
            return Err(CoderError::SessionAborted);
        }
        if let Some(forward) = self.forwards.values().min() {
            return Err(CoderError::UnsatisfiedForwardReference(*forward));
        }
        trace!(
            "encoder finished: {} bytes, {} objects",
            self.buf.len(),
            self.objects_written
        );
        Ok(self.buf.freeze())
    }

    fn alloc_xref(&mut self) -> u32 {
        let xref = self.next_xref;
        self.next_xref += 1;
        xref
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(CoderError::Encoding("nesting too deep".to_string()));
        }
        self.depth += 1;
        Ok(())
    }

    fn write_value(&mut self, graph: Option<&ObjectGraph>, value: &Value) -> Result<()> {
        self.buf.put_u8(value.tag());
        match value {
            Value::Char(v) => self.buf.put_i8(*v),
            Value::UChar(v) => self.buf.put_u8(*v),
            Value::Short(v) => self.buf.put_i16(*v),
            Value::UShort(v) => self.buf.put_u16(*v),
            Value::Int(v) | Value::Long(v) => self.buf.put_i32(*v),
            Value::UInt(v) | Value::ULong(v) => self.buf.put_u32(*v),
            Value::LongLong(v) => self.buf.put_i64(*v),
            Value::ULongLong(v) => self.buf.put_u64(*v),
            Value::Float(v) => self.buf.put_f32(*v),
            Value::Double(v) => self.buf.put_f64(*v),
            Value::Bool(v) => self.buf.put_u8(u8::from(*v)),
            Value::CString(s) | Value::Selector(s) => put_string(&mut self.buf, s.as_deref())?,
            Value::Class(name) => {
                let class = name.as_deref().map(ClassRef::new);
                self.write_class(class.as_ref())?;
            }
            Value::Struct(values) | Value::Array(values) => {
                self.buf.put_u32(count(values.len())?);
                self.descend()?;
                for v in values {
                    self.write_value(graph, v)?;
                }
                self.depth -= 1;
            }
            Value::ConstPointer(id) => self.write_pointer(graph, *id)?,
            Value::Object(id) => self.write_object(graph, *id)?,
            Value::WeakObject(id) => self.write_conditional(graph, *id)?,
        }
        Ok(())
    }

    fn write_class(&mut self, class: Option<&ClassRef>) -> Result<()> {
        let Some(class) = class else {
            self.buf.put_u8(CLASS_NIL);
            return Ok(());
        };
        if let Some(xref) = self.classes.get(&class.name) {
            self.buf.put_u8(CLASS_REPEATED);
            self.buf.put_u32(*xref);
            return Ok(());
        }
        let xref = self.alloc_xref();
        self.classes.insert(class.name.clone(), xref);
        self.buf.put_u8(CLASS);
        self.buf.put_u32(xref);
        put_string(&mut self.buf, Some(&class.name))?;
        self.buf.put_u32(class.version);
        Ok(())
    }

    fn write_object(&mut self, graph: Option<&ObjectGraph>, id: Option<NodeId>) -> Result<()> {
        let Some(id) = id else {
            self.buf.put_u8(OBJECT_NIL);
            return Ok(());
        };
        let graph = require_graph(graph)?;
        let key = (graph.id(), id);
        if let Some(xref) = self.xrefs.get(&key) {
            self.buf.put_u8(OBJECT_REPEATED);
            self.buf.put_u32(*xref);
            return Ok(());
        }
        let node = graph
            .object(id)
            .ok_or_else(|| CoderError::Encoding(format!("dangling object {}", id)))?;

        let xref = self.alloc_xref();
        self.xrefs.insert(key, xref);
        if let Some(forward) = self.forwards.remove(&key) {
            self.buf.put_u8(OBJECT_FORWARD_SATISFIER);
            self.buf.put_u32(forward);
        }

        let tag = if self.root_written {
            OBJECT
        } else {
            self.root_written = true;
            OBJECT_ROOT
        };
        self.buf.put_u8(tag);
        self.buf.put_u32(xref);
        self.buf.put_u8(OBJECT_CLASS);
        self.write_class(Some(&node.class))?;
        self.buf.put_u32(count(node.fields.len())?);

        self.descend()?;
        for field in &node.fields {
            self.write_value(Some(graph), field)?;
        }
        self.depth -= 1;
        self.objects_written += 1;
        Ok(())
    }

    fn write_conditional(&mut self, graph: Option<&ObjectGraph>, id: Option<NodeId>) -> Result<()> {
        let Some(id) = id else {
            self.buf.put_u8(OBJECT_NIL);
            return Ok(());
        };
        let graph = require_graph(graph)?;
        let key = (graph.id(), id);
        if let Some(xref) = self.xrefs.get(&key) {
            self.buf.put_u8(OBJECT_REPEATED);
            self.buf.put_u32(*xref);
            return Ok(());
        }
        if graph.object(id).is_none() {
            return Err(CoderError::Encoding(format!("dangling object {}", id)));
        }
        let forward = match self.forwards.get(&key) {
            Some(forward) => *forward,
            None => {
                let forward = self.next_forward;
                self.next_forward += 1;
                self.forwards.insert(key, forward);
                forward
            }
        };
        self.buf.put_u8(OBJECT_FORWARD_REFERENCE);
        self.buf.put_u32(forward);
        Ok(())
    }

    fn write_pointer(&mut self, graph: Option<&ObjectGraph>, id: Option<NodeId>) -> Result<()> {
        let Some(id) = id else {
            self.buf.put_u8(CONST_PTR_NULL);
            return Ok(());
        };
        let graph = require_graph(graph)?;
        let key = (graph.id(), id);
        if let Some(xref) = self.xrefs.get(&key) {
            self.buf.put_u8(CONST_PTR_REPEATED);
            self.buf.put_u32(*xref);
            return Ok(());
        }
        let pointee = graph
            .pointee(id)
            .ok_or_else(|| CoderError::Encoding(format!("dangling pointer {}", id)))?;
        let xref = self.alloc_xref();
        self.xrefs.insert(key, xref);
        self.buf.put_u8(CONST_PTR);
        self.buf.put_u32(xref);
        self.descend()?;
        self.write_value(Some(graph), pointee)?;
        self.depth -= 1;
        Ok(())
    }
}

fn require_graph(graph: Option<&ObjectGraph>) -> Result<&ObjectGraph> {
    graph.ok_or_else(|| CoderError::Encoding("object reference without a graph".to_string()))
}

fn count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| CoderError::Encoding(format!("{} elements", len)))
}

/// Check a value against a declared type, following pointers into `graph`
pub(crate) fn check_typed(
    graph: Option<&ObjectGraph>,
    encoding: &TypeEncoding,
    value: &Value,
) -> Result<()> {
    let mismatch = || CoderError::Encoding(format!("value {} does not match type {}", value, encoding));
    if !value.matches(encoding) {
        return Err(mismatch());
    }
    match (value, encoding) {
        (Value::ConstPointer(Some(id)), TypeEncoding::Pointer(inner)) => {
            let pointee = graph
                .and_then(|g| g.pointee(*id))
                .ok_or_else(|| CoderError::Encoding(format!("dangling pointer {}", id)))?;
            check_typed(graph, inner, pointee)
        }
        (Value::Struct(values), TypeEncoding::Struct { fields, .. }) => values
            .iter()
            .zip(fields)
            .try_for_each(|(v, f)| check_typed(graph, f, v)),
        (Value::Array(values), TypeEncoding::Array { element, .. }) => values
            .iter()
            .try_for_each(|v| check_typed(graph, element, v)),
        _ => Ok(()),
    }
}
