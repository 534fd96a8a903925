//! Object graph arena
//!
//! Every object and const-pointer pointee lives in an [`ObjectGraph`] and is
//! addressed by a [`NodeId`]. Graphs may contain cycles and shared nodes.
//! A decode session builds exactly one graph, so everything it produced is
//! released together when the graph is dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Index of a node inside its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Class name and version of an encoded object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    pub name: String,
    pub version: u32,
}

impl ClassRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
        }
    }

    pub fn with_version(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// An encoded object: its class and its field values
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub class: ClassRef,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone)]
enum Slot {
    Object(ObjectNode),
    Pointee(Value),
    /// Reserved by a decoder; filled once the record arrives
    Pending,
}

/// Arena of objects and pointees
#[derive(Debug)]
pub struct ObjectGraph {
    id: u64,
    slots: Vec<Slot>,
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ObjectGraph {
    /// A clone is a distinct graph with its own identity
    fn clone(&self) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            slots: self.slots.clone(),
        }
    }
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
        }
    }

    /// Process-unique identity of this graph
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of nodes (objects and pointees)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn push(&mut self, slot: Slot) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(slot);
        id
    }

    pub fn add_object(&mut self, class: ClassRef, fields: Vec<Value>) -> NodeId {
        self.push(Slot::Object(ObjectNode { class, fields }))
    }

    pub fn object(&self, id: NodeId) -> Option<&ObjectNode> {
        match self.slots.get(id.index()) {
            Some(Slot::Object(node)) => Some(node),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, id: NodeId) -> Option<&mut ObjectNode> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Object(node)) => Some(node),
            _ => None,
        }
    }

    pub fn add_pointee(&mut self, value: Value) -> NodeId {
        self.push(Slot::Pointee(value))
    }

    pub fn pointee(&self, id: NodeId) -> Option<&Value> {
        match self.slots.get(id.index()) {
            Some(Slot::Pointee(value)) => Some(value),
            _ => None,
        }
    }

    /// All object nodes
    pub fn objects(&self) -> impl Iterator<Item = (NodeId, &ObjectNode)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Object(node) => Some((NodeId(i as u32), node)),
            _ => None,
        })
    }

    pub(crate) fn reserve(&mut self) -> NodeId {
        self.push(Slot::Pending)
    }

    pub(crate) fn is_pending(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.index()), Some(Slot::Pending))
    }

    pub(crate) fn fill_object(&mut self, id: NodeId, node: ObjectNode) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = Slot::Object(node);
        }
    }

    pub(crate) fn fill_pointee(&mut self, id: NodeId, value: Value) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = Slot::Pointee(value);
        }
    }

    /// Distinct objects reachable from `root`, in breadth-first order
    pub fn reachable_objects(&self, root: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.slots.len()];
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);

        while let Some(id) = queue.pop_front() {
            if id.index() >= seen.len() || std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            match &self.slots[id.index()] {
                Slot::Object(node) => {
                    order.push(id);
                    for field in &node.fields {
                        collect_refs(field, &mut queue);
                    }
                }
                Slot::Pointee(value) => collect_refs(value, &mut queue),
                Slot::Pending => {}
            }
        }
        order
    }

    /// Whether the subgraph at `a` has the same shape as the subgraph of
    /// `other` at `b`: a bijection between reachable nodes exists that
    /// preserves classes, field values, sharing and cycles.
    pub fn is_isomorphic(&self, a: NodeId, other: &ObjectGraph, b: NodeId) -> bool {
        let mut matcher = Matcher {
            left: self,
            right: other,
            forward: HashMap::new(),
            backward: HashMap::new(),
            queue: VecDeque::new(),
        };
        if !matcher.pair(a, b) {
            return false;
        }
        while let Some((x, y)) = matcher.queue.pop_front() {
            if !matcher.compare_nodes(x, y) {
                return false;
            }
        }
        true
    }
}

fn collect_refs(value: &Value, queue: &mut VecDeque<NodeId>) {
    match value {
        Value::Object(Some(id)) | Value::WeakObject(Some(id)) | Value::ConstPointer(Some(id)) => {
            queue.push_back(*id)
        }
        Value::Struct(values) | Value::Array(values) => {
            for v in values {
                collect_refs(v, queue);
            }
        }
        _ => {}
    }
}

struct Matcher<'a> {
    left: &'a ObjectGraph,
    right: &'a ObjectGraph,
    forward: HashMap<NodeId, NodeId>,
    backward: HashMap<NodeId, NodeId>,
    queue: VecDeque<(NodeId, NodeId)>,
}

impl Matcher<'_> {
    /// Record that `a` corresponds to `b`; false if that contradicts the mapping
    fn pair(&mut self, a: NodeId, b: NodeId) -> bool {
        match (self.forward.get(&a), self.backward.get(&b)) {
            (Some(x), Some(y)) => *x == b && *y == a,
            (None, None) => {
                self.forward.insert(a, b);
                self.backward.insert(b, a);
                self.queue.push_back((a, b));
                true
            }
            _ => false,
        }
    }

    fn compare_nodes(&mut self, a: NodeId, b: NodeId) -> bool {
        let (left, right) = (self.left, self.right);
        match (left.slots.get(a.index()), right.slots.get(b.index())) {
            (Some(Slot::Object(x)), Some(Slot::Object(y))) => {
                x.class == y.class
                    && x.fields.len() == y.fields.len()
                    && x.fields.iter().zip(&y.fields).all(|(f, g)| self.compare_values(f, g))
            }
            (Some(Slot::Pointee(x)), Some(Slot::Pointee(y))) => self.compare_values(x, y),
            _ => false,
        }
    }

    fn compare_values(&mut self, x: &Value, y: &Value) -> bool {
        match (x, y) {
            (Value::Object(p), Value::Object(q))
            | (Value::WeakObject(p), Value::WeakObject(q))
            | (Value::ConstPointer(p), Value::ConstPointer(q)) => match (p, q) {
                (None, None) => true,
                (Some(a), Some(b)) => self.pair(*a, *b),
                _ => false,
            },
            (Value::Struct(p), Value::Struct(q)) | (Value::Array(p), Value::Array(q)) => {
                p.len() == q.len() && p.iter().zip(q).all(|(a, b)| self.compare_values(a, b))
            }
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}
