//! Proxies for objects owned by the peer
//!
//! A [`DistantObject`] stands for one remote target on one connection.
//! Calling through it encodes a method request, waits for the reply and
//! decodes the results back. There is at most one live proxy per target;
//! receiving the same target again returns the existing proxy and counts
//! one more remote reference, all of which are given back on release.
//!
//! A proxy does not keep its connection alive. Once every [`Connection`]
//! handle is gone the proxy is dead and calls fail with
//! [`DoError::ConnectionInvalid`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use do_signature::MethodSignature;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionInner};
use crate::error::{DoError, Result};
use crate::invocation::{Argument, CallOutcome, Invocation};
use crate::marshal;
use crate::object::DoObject;

/// Class name proxies report locally
pub const PROXY_CLASS: &str = "DistantObject";

pub struct DistantObject {
    target: u32,
    connection: Weak<ConnectionInner>,
    valid: AtomicBool,
    released: AtomicBool,
    /// References the peer counted for us and expects back
    refs: AtomicU32,
    fetched: Mutex<HashMap<String, Arc<MethodSignature>>>,
    declared: Mutex<HashMap<String, Arc<MethodSignature>>>,
    runtime: Handle,
}

impl DistantObject {
    pub(crate) fn new(target: u32, connection: Weak<ConnectionInner>, runtime: Handle) -> Self {
        Self {
            target,
            connection,
            valid: AtomicBool::new(true),
            released: AtomicBool::new(false),
            refs: AtomicU32::new(1),
            fetched: Mutex::new(HashMap::new()),
            declared: Mutex::new(HashMap::new()),
            runtime,
        }
    }

    /// Target id of the remote object on its connection
    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
            && self
                .connection
                .upgrade()
                .is_some_and(|conn| conn.is_valid())
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.upgrade().map(Connection::from_inner)
    }

    /// Remote references this proxy will hand back on release
    pub fn remote_references(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn belongs_to(&self, conn: &Arc<ConnectionInner>) -> bool {
        std::ptr::eq(self.connection.as_ptr(), Arc::as_ptr(conn))
    }

    pub(crate) fn add_reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_dead(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn live_connection(&self) -> Result<Arc<ConnectionInner>> {
        if self.released.load(Ordering::Acquire) {
            return Err(DoError::ProxyReleased(self.target));
        }
        let conn = self.connection.upgrade().ok_or(DoError::ConnectionInvalid)?;
        if !self.valid.load(Ordering::Acquire) || !conn.is_valid() {
            return Err(DoError::ConnectionInvalid);
        }
        Ok(conn)
    }

    /// Declare the types of `selector` so calls need not ask the peer
    pub fn declare_method(&self, selector: &str, types: &str) -> Result<()> {
        let signature = MethodSignature::parse(types)?;
        if !signature.is_method() {
            return Err(DoError::Protocol(format!(
                "{}: {} is not a method signature",
                selector, types
            )));
        }
        self.declared
            .lock()
            .insert(selector.to_string(), Arc::new(signature));
        Ok(())
    }

    fn known_signature(&self, selector: &str) -> Option<Arc<MethodSignature>> {
        if let Some(signature) = self.fetched.lock().get(selector) {
            return Some(signature.clone());
        }
        self.declared.lock().get(selector).cloned()
    }

    /// Signature of `selector`: cached, declared, or asked of the peer
    pub async fn method_signature(&self, selector: &str) -> Result<Arc<MethodSignature>> {
        if let Some(signature) = self.known_signature(selector) {
            return Ok(signature);
        }
        let conn = self.live_connection()?;
        let types = conn
            .fetch_method_types(self.target, selector)
            .await?
            .ok_or_else(|| DoError::UnknownSelector {
                class: PROXY_CLASS.to_string(),
                selector: selector.to_string(),
            })?;
        let signature = conn.parse_signature(&types)?;
        trace!("Target {} answers {} with {}", self.target, selector, types);
        self.fetched
            .lock()
            .insert(selector.to_string(), signature.clone());
        Ok(signature)
    }

    /// Call `selector` on the remote object and return its result
    pub async fn forward(&self, selector: &str, arguments: Vec<Argument>) -> Result<Argument> {
        Ok(self.forward_with_outputs(selector, arguments).await?.return_value)
    }

    /// Call `selector` and also return the arguments as the callee left them
    pub async fn forward_with_outputs(&self, selector: &str, arguments: Vec<Argument>) -> Result<CallOutcome> {
        let conn = self.live_connection()?;
        let signature = self.method_signature(selector).await?;
        let mut invocation = Invocation::new(selector, signature.clone())?;
        if arguments.len() != invocation.argument_count() {
            return Err(DoError::Protocol(format!(
                "{} takes {} arguments, got {}",
                selector,
                invocation.argument_count(),
                arguments.len()
            )));
        }
        for (index, argument) in arguments.into_iter().enumerate() {
            invocation.set_argument(index, argument)?;
        }

        let outgoing = marshal::encode_request(&conn, self.target, &invocation)?;
        if signature.is_oneway() {
            conn.invoke_oneway(selector, outgoing).await?;
            return Ok(invocation.into_outcome());
        }
        let reply = conn.invoke(selector, outgoing, None).await?;
        marshal::decode_reply(&conn, reply, &mut invocation)?;
        Ok(invocation.into_outcome())
    }

    /// [`forward`](Self::forward) for synchronous callers.
    ///
    /// Must run on a blocking thread, never inside an async task.
    pub fn forward_blocking(&self, selector: &str, arguments: Vec<Argument>) -> Result<Argument> {
        self.runtime.block_on(self.forward(selector, arguments))
    }

    /// Give every remote reference back and stop forwarding
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.valid.store(false, Ordering::Release);
        let count = self.refs.swap(0, Ordering::AcqRel);
        let Some(conn) = self.connection.upgrade() else {
            return Ok(());
        };
        conn.forget_proxy(self.target, self);
        if count == 0 || !conn.is_valid() {
            return Ok(());
        }
        conn.send_release(self.target, count).await
    }
}

impl DoObject for DistantObject {
    fn class_name(&self) -> &str {
        PROXY_CLASS
    }

    fn method_signature(&self, selector: &str) -> Option<Arc<MethodSignature>> {
        if let Some(signature) = self.known_signature(selector) {
            return Some(signature);
        }
        self.runtime
            .block_on(DistantObject::method_signature(self, selector))
            .ok()
    }

    /// Relay a call that arrived on another connection
    fn invoke(&self, selector: &str, invocation: &mut Invocation) -> Result<()> {
        let arguments = invocation.arguments().to_vec();
        let outcome = self
            .runtime
            .block_on(self.forward_with_outputs(selector, arguments))?;
        for (index, argument) in outcome.arguments.into_iter().enumerate() {
            if invocation.signature().explicit_arguments()[index].is_out_param() {
                invocation.set_argument(index, argument)?;
            }
        }
        if !matches!(outcome.return_value, Argument::Void) {
            invocation.set_return_value(outcome.return_value)?;
        }
        Ok(())
    }

    fn as_proxy(&self) -> Option<&DistantObject> {
        Some(self)
    }
}

impl Drop for DistantObject {
    fn drop(&mut self) {
        if *self.released.get_mut() {
            return;
        }
        let count = *self.refs.get_mut();
        let Some(conn) = self.connection.upgrade() else {
            return;
        };
        conn.forget_proxy(self.target, self);
        if count == 0 || !conn.is_valid() {
            return;
        }
        let target = self.target;
        conn.runtime().clone().spawn(async move {
            if let Err(e) = conn.send_release(target, count).await {
                debug!("Release of target {} failed: {}", target, e);
            }
        });
    }
}

impl fmt::Debug for DistantObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistantObject")
            .field("target", &self.target)
            .field("valid", &self.is_valid())
            .field("refs", &self.remote_references())
            .finish()
    }
}
