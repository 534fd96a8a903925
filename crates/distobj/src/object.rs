//! Objects that can be vended over a connection
//!
//! Anything implementing [`DoObject`] can be a root object or travel as an
//! argument. Most objects are built from a [`MethodTable`]: a map from
//! selector to signature and implementation that many objects can share.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use do_coder::{NodeId, ObjectGraph};
use do_signature::{MethodSignature, SignatureError};

use crate::error::{DoError, Result};
use crate::invocation::Invocation;
use crate::proxy::DistantObject;

/// An object reachable through distributed-object messaging
pub trait DoObject: Send + Sync + 'static {
    fn class_name(&self) -> &str;

    /// Signature of `selector`, or `None` if the object does not respond to it
    fn method_signature(&self, selector: &str) -> Option<Arc<MethodSignature>>;

    /// Run `selector`. Runs on a blocking thread, so it may block.
    fn invoke(&self, selector: &str, invocation: &mut Invocation) -> Result<()>;

    /// Write a by-value copy of this object into `graph`.
    ///
    /// Objects that return `None` are passed by reference even where a
    /// signature asks for `bycopy`.
    fn encode_copy(&self, _graph: &mut ObjectGraph) -> Option<NodeId> {
        None
    }

    /// The proxy behind this object, if it is one
    fn as_proxy(&self) -> Option<&DistantObject> {
        None
    }
}

type Handler<T> = Arc<dyn Fn(&T, &mut Invocation) -> Result<()> + Send + Sync>;
type Copier<T> = Arc<dyn Fn(&T, &mut ObjectGraph) -> NodeId + Send + Sync>;

#[derive(Clone, Copy)]
struct NativeFn(*const ());

// SAFETY: a function pointer has no thread affinity.
unsafe impl Send for NativeFn {}
unsafe impl Sync for NativeFn {}

enum Implementation<T> {
    Handler(Handler<T>),
    Native(NativeFn),
}

struct Method<T> {
    signature: Arc<MethodSignature>,
    implementation: Implementation<T>,
}

/// Selector table shared by objects of one class
pub struct MethodTable<T> {
    class_name: String,
    methods: HashMap<String, Method<T>>,
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Register a method implemented by a closure
    pub fn add<F>(&mut self, selector: &str, types: &str, handler: F) -> Result<()>
    where
        F: Fn(&T, &mut Invocation) -> Result<()> + Send + Sync + 'static,
    {
        let signature = method_signature(selector, types)?;
        self.methods.insert(
            selector.to_string(),
            Method {
                signature,
                implementation: Implementation::Handler(Arc::new(handler)),
            },
        );
        Ok(())
    }

    /// Register a method implemented by a native function.
    ///
    /// The function receives an opaque token as `self` and the selector as a
    /// C string in `_cmd`, followed by the explicit arguments.
    ///
    /// # Safety
    ///
    /// `function` must be an `extern "C"` function whose parameter and return
    /// types match `types` exactly. It must not keep any pointer it is given
    /// past the call.
    pub unsafe fn add_native(&mut self, selector: &str, types: &str, function: *const ()) -> Result<()> {
        if function.is_null() {
            return Err(SignatureError::Invocation(format!("null implementation for {}", selector)).into());
        }
        let signature = method_signature(selector, types)?;
        self.methods.insert(
            selector.to_string(),
            Method {
                signature,
                implementation: Implementation::Native(NativeFn(function)),
            },
        );
        Ok(())
    }

    pub fn signature(&self, selector: &str) -> Option<Arc<MethodSignature>> {
        self.methods.get(selector).map(|m| m.signature.clone())
    }

    pub fn responds_to(&self, selector: &str) -> bool {
        self.methods.contains_key(selector)
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Run `selector` against `state`
    pub fn dispatch(&self, state: &T, selector: &str, invocation: &mut Invocation) -> Result<()> {
        let method = self.methods.get(selector).ok_or_else(|| DoError::UnknownSelector {
            class: self.class_name.clone(),
            selector: selector.to_string(),
        })?;
        match &method.implementation {
            Implementation::Handler(handler) => handler(state, invocation),
            // SAFETY: add_native's contract covers the call.
            Implementation::Native(function) => unsafe { invocation.invoke_native(function.0) },
        }
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut selectors: Vec<&String> = self.methods.keys().collect();
        selectors.sort();
        f.debug_struct("MethodTable")
            .field("class_name", &self.class_name)
            .field("selectors", &selectors)
            .finish()
    }
}

fn method_signature(selector: &str, types: &str) -> Result<Arc<MethodSignature>> {
    let signature = MethodSignature::parse(types)?;
    if !signature.is_method() {
        return Err(SignatureError::Invocation(format!(
            "{}: method types must start with a receiver and selector, got {}",
            selector, types
        ))
        .into());
    }
    Ok(Arc::new(signature))
}

/// An object whose behaviour comes from a shared [`MethodTable`]
pub struct TableObject<T> {
    state: T,
    table: Arc<MethodTable<T>>,
    copier: Option<Copier<T>>,
}

impl<T: Send + Sync + 'static> TableObject<T> {
    pub fn new(state: T, table: Arc<MethodTable<T>>) -> Self {
        Self {
            state,
            table,
            copier: None,
        }
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    pub fn table(&self) -> &Arc<MethodTable<T>> {
        &self.table
    }
}

impl<T: Send + Sync + 'static> DoObject for TableObject<T> {
    fn class_name(&self) -> &str {
        self.table.class_name()
    }

    fn method_signature(&self, selector: &str) -> Option<Arc<MethodSignature>> {
        self.table.signature(selector)
    }

    fn invoke(&self, selector: &str, invocation: &mut Invocation) -> Result<()> {
        self.table.dispatch(&self.state, selector, invocation)
    }

    fn encode_copy(&self, graph: &mut ObjectGraph) -> Option<NodeId> {
        self.copier.as_ref().map(|copier| copier(&self.state, graph))
    }
}

/// Fluent construction of [`TableObject`]s
pub struct ObjectBuilder<T> {
    table: MethodTable<T>,
    copier: Option<Copier<T>>,
}

impl<T: Send + Sync + 'static> ObjectBuilder<T> {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            table: MethodTable::new(class_name),
            copier: None,
        }
    }

    pub fn method<F>(mut self, selector: &str, types: &str, handler: F) -> Result<Self>
    where
        F: Fn(&T, &mut Invocation) -> Result<()> + Send + Sync + 'static,
    {
        self.table.add(selector, types, handler)?;
        Ok(self)
    }

    /// # Safety
    ///
    /// Same contract as [`MethodTable::add_native`].
    pub unsafe fn native_method(mut self, selector: &str, types: &str, function: *const ()) -> Result<Self> {
        self.table.add_native(selector, types, function)?;
        Ok(self)
    }

    /// Make the object copyable: `copier` writes its by-value form
    pub fn copy_with<F>(mut self, copier: F) -> Self
    where
        F: Fn(&T, &mut ObjectGraph) -> NodeId + Send + Sync + 'static,
    {
        self.copier = Some(Arc::new(copier));
        self
    }

    /// Finish the table so several objects can share it
    pub fn into_table(self) -> Arc<MethodTable<T>> {
        Arc::new(self.table)
    }

    pub fn build(self, state: T) -> Arc<TableObject<T>> {
        Arc::new(TableObject {
            state,
            table: Arc::new(self.table),
            copier: self.copier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Argument;
    use do_coder::{ClassRef, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> Arc<TableObject<AtomicU32>> {
        ObjectBuilder::new("Counter")
            .method("count", "I@:", |state: &AtomicU32, inv| {
                inv.set_return_value(Value::UInt(state.load(Ordering::SeqCst)))
            })
            .unwrap()
            .method("add:", "v@:I", |state: &AtomicU32, inv| {
                let amount = inv.integer(0)? as u32;
                state.fetch_add(amount, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
            .copy_with(|state, graph| {
                graph.add_object(
                    ClassRef::new("Counter"),
                    vec![Value::UInt(state.load(Ordering::SeqCst))],
                )
            })
            .build(AtomicU32::new(3))
    }

    fn call(object: &dyn DoObject, selector: &str, args: Vec<Argument>) -> Result<Invocation> {
        let signature = object
            .method_signature(selector)
            .ok_or_else(|| DoError::UnknownSelector {
                class: object.class_name().to_string(),
                selector: selector.to_string(),
            })?;
        let mut inv = Invocation::new(selector, signature)?;
        for (i, arg) in args.into_iter().enumerate() {
            inv.set_argument(i, arg)?;
        }
        object.invoke(selector, &mut inv)?;
        Ok(inv)
    }

    #[test]
    fn test_dispatch() {
        let object = counter();
        let inv = call(object.as_ref(), "count", vec![]).unwrap();
        assert_eq!(inv.return_value().as_i64(), Some(3));

        call(object.as_ref(), "add:", vec![Value::UInt(4).into()]).unwrap();
        assert_eq!(object.state().load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_unknown_selector() {
        let object = counter();
        assert!(object.method_signature("reset").is_none());
        let sig = Arc::new(MethodSignature::parse("v@:").unwrap());
        let mut inv = Invocation::new("reset", sig).unwrap();
        assert!(matches!(
            object.invoke("reset", &mut inv),
            Err(DoError::UnknownSelector { .. })
        ));
    }

    #[test]
    fn test_rejects_non_method_types() {
        let mut table: MethodTable<()> = MethodTable::new("Plain");
        assert!(table.add("f", "ii", |_, _| Ok(())).is_err());
        assert!(unsafe { table.add_native("h", "v@:", std::ptr::null()) }.is_err());
    }

    #[test]
    fn test_shared_table() {
        let table = ObjectBuilder::new("Counter")
            .method("count", "I@:", |state: &AtomicU32, inv| {
                inv.set_return_value(Value::UInt(state.load(Ordering::SeqCst)))
            })
            .unwrap()
            .into_table();
        let a = TableObject::new(AtomicU32::new(1), table.clone());
        let b = TableObject::new(AtomicU32::new(2), table);
        assert_eq!(call(&a, "count", vec![]).unwrap().return_value().as_i64(), Some(1));
        assert_eq!(call(&b, "count", vec![]).unwrap().return_value().as_i64(), Some(2));
    }

    #[test]
    fn test_copy() {
        let object = counter();
        let mut graph = ObjectGraph::new();
        let root = object.encode_copy(&mut graph).unwrap();
        assert_eq!(graph.object(root).unwrap().fields, vec![Value::UInt(3)]);
    }
}
