//! Decoding sessions
//!
//! A [`Decoder`] reads a stream produced by an [`Encoder`](crate::Encoder)
//! and rebuilds the values and object graph it describes. All objects land
//! in one arena that is only handed out by [`Decoder::finish`], once the
//! whole session has been validated.

use std::collections::HashMap;

use bytes::Bytes;
use do_signature::TypeEncoding;
use tracing::trace;

use crate::encoder::{check_typed, MAX_DEPTH};
use crate::error::{CoderError, Result};
use crate::graph::{ClassRef, NodeId, ObjectGraph, ObjectNode};
use crate::tags::*;
use crate::value::Value;
use crate::wire::Reader;

#[derive(Debug, Clone)]
enum Xref {
    Object(NodeId),
    Class(ClassRef),
    Pointer(NodeId),
}

/// A single decoding session
#[derive(Debug)]
pub struct Decoder {
    reader: Reader,
    graph: ObjectGraph,
    xrefs: HashMap<u32, Xref>,
    forwards: HashMap<u32, NodeId>,
    depth: usize,
    failed: bool,
}

impl Decoder {
    pub fn new(data: Bytes) -> Self {
        Self {
            reader: Reader::new(data),
            graph: ObjectGraph::new(),
            xrefs: HashMap::new(),
            forwards: HashMap::new(),
            depth: 0,
            failed: false,
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.reader.remaining()
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

    /// Decode the next value, whatever its type
    pub fn decode_value(&mut self) -> Result<Value> {
        self.run(|dec| dec.read_value())
    }

    /// Decode the next value and check it against a declared type
    pub fn decode_typed(&mut self, encoding: &TypeEncoding) -> Result<Value> {
        self.run(|dec| {
            let offset = dec.reader.offset();
            let value = dec.read_value()?;
            check_typed(Some(&dec.graph), encoding, &value).map_err(|_| {
                CoderError::decoding(
                    offset,
                    format!("expected {}, found {}", encoding, describe(&value)),
                )
            })?;
            Ok(value)
        })
    }

    /// Decode the next value, which must be an object reference
    pub fn decode_object(&mut self) -> Result<Option<NodeId>> {
        match self.decode_typed(&TypeEncoding::Object)? {
            Value::Object(id) | Value::WeakObject(id) => Ok(id),
            _ => Err(CoderError::SessionAborted),
        }
    }

    /// Close the session and take ownership of every decoded object
    pub fn finish(self) -> Result<ObjectGraph> {
        if self.failed {
            return Err(CoderError::SessionAborted);
        }
        let unsatisfied = self
            .forwards
            .iter()
            .filter(|(_, id)| self.graph.is_pending(**id))
            .map(|(forward, _)| *forward)
            .min();
        if let Some(forward) = unsatisfied {
            return Err(CoderError::UnsatisfiedForwardReference(forward));
        }
        if self.reader.remaining() > 0 {
            return Err(CoderError::decoding(
                self.reader.offset(),
                format!("{} trailing bytes", self.reader.remaining()),
            ));
        }
        trace!("decoder finished: {} nodes", self.graph.len());
        Ok(self.graph)
    }

    fn error(&self, message: impl Into<String>) -> CoderError {
        CoderError::decoding(self.reader.offset(), message)
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        Ok(())
    }

    fn register(&mut self, xref: u32, entry: Xref) -> Result<()> {
        if self.xrefs.insert(xref, entry).is_some() {
            return Err(self.error(format!("duplicate cross-reference {}", xref)));
        }
        Ok(())
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.reader.get_u8()?;
        let value = match tag {
            b'c' => Value::Char(self.reader.get_i8()?),
            b'C' => Value::UChar(self.reader.get_u8()?),
            b's' => Value::Short(self.reader.get_i16()?),
            b'S' => Value::UShort(self.reader.get_u16()?),
            b'i' => Value::Int(self.reader.get_i32()?),
            b'I' => Value::UInt(self.reader.get_u32()?),
            b'l' => Value::Long(self.reader.get_i32()?),
            b'L' => Value::ULong(self.reader.get_u32()?),
            b'q' => Value::LongLong(self.reader.get_i64()?),
            b'Q' => Value::ULongLong(self.reader.get_u64()?),
            b'f' => Value::Float(self.reader.get_f32()?),
            b'd' => Value::Double(self.reader.get_f64()?),
            b'B' => Value::Bool(self.reader.get_bool()?),
            b'*' => Value::CString(self.reader.get_string()?),
            b':' => Value::Selector(self.reader.get_string()?),
            b'#' => Value::Class(self.read_class()?.map(|c| c.name)),
            b'{' | b'[' => {
                let n = self.reader.get_count()?;
                self.descend()?;
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    values.push(self.read_value()?);
                }
                self.depth -= 1;
                if tag == b'{' {
                    Value::Struct(values)
                } else {
                    Value::Array(values)
                }
            }
            b'^' => Value::ConstPointer(self.read_pointer()?),
            b'@' => Value::Object(self.read_object()?),
            CONDITIONAL_OBJECT => Value::WeakObject(self.read_conditional()?),
            other => return Err(self.error(format!("unknown type tag 0x{:02x}", other))),
        };
        Ok(value)
    }

    fn read_class(&mut self) -> Result<Option<ClassRef>> {
        match self.reader.get_u8()? {
            CLASS_NIL => Ok(None),
            CLASS => {
                let xref = self.reader.get_u32()?;
                let name = self
                    .reader
                    .get_string()?
                    .ok_or_else(|| self.error("class record without a name"))?;
                let version = self.reader.get_u32()?;
                let class = ClassRef::with_version(name, version);
                self.register(xref, Xref::Class(class.clone()))?;
                Ok(Some(class))
            }
            CLASS_REPEATED => {
                let xref = self.reader.get_u32()?;
                match self.xrefs.get(&xref) {
                    Some(Xref::Class(class)) => Ok(Some(class.clone())),
                    _ => Err(self.error(format!("unknown class reference {}", xref))),
                }
            }
            other => Err(self.error(format!("expected class record, found {}", tag_name(other)))),
        }
    }

    fn repeated_object(&mut self) -> Result<NodeId> {
        let xref = self.reader.get_u32()?;
        match self.xrefs.get(&xref) {
            Some(Xref::Object(id)) => Ok(*id),
            _ => Err(self.error(format!("unknown object reference {}", xref))),
        }
    }

    fn read_object(&mut self) -> Result<Option<NodeId>> {
        match self.reader.get_u8()? {
            OBJECT_NIL => Ok(None),
            OBJECT_REPEATED => self.repeated_object().map(Some),
            OBJECT | OBJECT_ROOT => self.read_object_body(None).map(Some),
            OBJECT_FORWARD_SATISFIER => {
                let forward = self.reader.get_u32()?;
                let slot = match self.forwards.get(&forward) {
                    Some(id) => *id,
                    None => {
                        let id = self.graph.reserve();
                        self.forwards.insert(forward, id);
                        id
                    }
                };
                if !self.graph.is_pending(slot) {
                    return Err(self.error(format!("forward reference {} satisfied twice", forward)));
                }
                match self.reader.get_u8()? {
                    OBJECT | OBJECT_ROOT => self.read_object_body(Some(slot)).map(Some),
                    other => Err(self.error(format!(
                        "forward satisfier followed by {}",
                        tag_name(other)
                    ))),
                }
            }
            other => Err(self.error(format!("expected object record, found {}", tag_name(other)))),
        }
    }

    fn read_object_body(&mut self, slot: Option<NodeId>) -> Result<NodeId> {
        let xref = self.reader.get_u32()?;
        let id = match slot {
            Some(id) => id,
            None => self.graph.reserve(),
        };
        // Registered before the fields so that cycles back to this object resolve
        self.register(xref, Xref::Object(id))?;

        if self.reader.get_u8()? != OBJECT_CLASS {
            return Err(self.error("object record without class marker"));
        }
        let class = self
            .read_class()?
            .ok_or_else(|| self.error("object record with nil class"))?;

        let n = self.reader.get_count()?;
        self.descend()?;
        let mut fields = Vec::with_capacity(n);
        for _ in 0..n {
            fields.push(self.read_value()?);
        }
        self.depth -= 1;

        self.graph.fill_object(id, ObjectNode { class, fields });
        Ok(id)
    }

    fn read_conditional(&mut self) -> Result<Option<NodeId>> {
        match self.reader.get_u8()? {
            OBJECT_NIL => Ok(None),
            OBJECT_REPEATED => self.repeated_object().map(Some),
            OBJECT_FORWARD_REFERENCE => {
                let forward = self.reader.get_u32()?;
                let id = match self.forwards.get(&forward) {
                    Some(id) => *id,
                    None => {
                        let id = self.graph.reserve();
                        self.forwards.insert(forward, id);
                        id
                    }
                };
                Ok(Some(id))
            }
            other => Err(self.error(format!(
                "expected conditional object record, found {}",
                tag_name(other)
            ))),
        }
    }

    fn read_pointer(&mut self) -> Result<Option<NodeId>> {
        match self.reader.get_u8()? {
            CONST_PTR_NULL => Ok(None),
            CONST_PTR => {
                let xref = self.reader.get_u32()?;
                let id = self.graph.reserve();
                self.register(xref, Xref::Pointer(id))?;
                self.descend()?;
                let pointee = self.read_value()?;
                self.depth -= 1;
                self.graph.fill_pointee(id, pointee);
                Ok(Some(id))
            }
            CONST_PTR_REPEATED => {
                let xref = self.reader.get_u32()?;
                match self.xrefs.get(&xref) {
                    Some(Xref::Pointer(id)) => Ok(Some(*id)),
                    _ => Err(self.error(format!("unknown pointer reference {}", xref))),
                }
            }
            other => Err(self.error(format!("expected pointer record, found {}", tag_name(other)))),
        }
    }
}

fn describe(value: &Value) -> String {
    format!("'{}' value", value.tag() as char)
}
