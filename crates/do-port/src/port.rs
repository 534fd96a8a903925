//! The port abstraction
//!
//! A port is one endpoint of a bidirectional message channel. It can be
//! invalidated at most once; after that every operation fails with
//! [`PortError::PortInvalid`] and the registered delegate hears about it
//! exactly once.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PortError, Result};
use crate::message::WireMessage;

/// Default maximum frame size (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default queue depth for in-process ports
pub const DEFAULT_LOCAL_QUEUE_DEPTH: usize = 64;

/// Port configuration
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Frames larger than this are rejected on send and on receive
    pub max_frame_size: usize,
    /// Messages buffered per direction by [`LocalPort`](crate::LocalPort)
    pub local_queue_depth: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            local_queue_depth: DEFAULT_LOCAL_QUEUE_DEPTH,
        }
    }
}

impl PortConfig {
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_local_queue_depth(mut self, depth: usize) -> Self {
        self.local_queue_depth = depth.max(1);
        self
    }
}

/// Unique port identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(Uuid);

impl PortId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PortId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observer told when a port becomes invalid
pub trait PortDelegate: Send + Sync {
    fn port_invalidated(&self, port: PortId);
}

/// Message channel endpoint
#[async_trait]
pub trait Port: Send + Sync {
    fn id(&self) -> PortId;

    /// Send one message.
    ///
    /// Returns `Ok(false)` when `timeout` elapses first. A stream port whose
    /// frame was partially written when the timeout hit is invalidated.
    async fn send(&self, message: &WireMessage, timeout: Option<Duration>) -> Result<bool>;

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when `deadline` passes without a message.
    async fn receive(&self, deadline: Option<Instant>) -> Result<Option<WireMessage>>;

    /// Invalidate the port. Idempotent.
    fn invalidate(&self);

    fn is_valid(&self) -> bool;

    /// Register the delegate notified on invalidation. Registering on an
    /// already invalid port notifies immediately.
    fn set_delegate(&self, delegate: Weak<dyn PortDelegate>);

    /// Human-readable endpoint description for logs
    fn description(&self) -> String {
        self.id().to_string()
    }
}

/// Validity bookkeeping shared by port implementations
pub struct PortState {
    id: PortId,
    valid: AtomicBool,
    signal: watch::Sender<bool>,
    delegate: Mutex<Option<Weak<dyn PortDelegate>>>,
}

impl PortState {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            id: PortId::new(),
            valid: AtomicBool::new(true),
            signal,
            delegate: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(PortError::PortInvalid)
        }
    }

    pub fn set_delegate(&self, delegate: Weak<dyn PortDelegate>) {
        if self.is_valid() {
            *self.delegate.lock() = Some(delegate.clone());
            // Raced with invalidate: it may have run before the store.
            if self.is_valid() {
                return;
            }
            if self.delegate.lock().take().is_none() {
                return;
            }
        }
        if let Some(delegate) = delegate.upgrade() {
            delegate.port_invalidated(self.id);
        }
    }

    /// Mark the port invalid. Returns true for the call that did the work.
    pub fn invalidate(&self) -> bool {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!("Port {} invalidated", self.id);
        self.signal.send_replace(true);
        let delegate = self.delegate.lock().take();
        if let Some(delegate) = delegate.and_then(|weak| weak.upgrade()) {
            delegate.port_invalidated(self.id);
        }
        true
    }

    /// Resolves once the port is invalid
    pub async fn invalidated(&self) {
        let mut rx = self.signal.subscribe();
        // Only fails if the sender is gone, which cannot happen while self lives.
        let _ = rx.wait_for(|invalid| *invalid).await;
    }
}

impl Default for PortState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortState")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Run `fut` until `deadline`; `None` means the deadline won
pub(crate) async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl PortDelegate for Counter {
        fn port_invalidated(&self, _port: PortId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_invalidate_notifies_once() {
        let state = PortState::new();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn PortDelegate> = Arc::downgrade(&(counter.clone() as Arc<dyn PortDelegate>));
        state.set_delegate(weak);

        assert!(state.check().is_ok());
        assert!(state.invalidate());
        assert!(!state.invalidate());
        assert!(matches!(state.check(), Err(PortError::PortInvalid)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_delegate_notified() {
        let state = PortState::new();
        state.invalidate();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn PortDelegate> = Arc::downgrade(&(counter.clone() as Arc<dyn PortDelegate>));
        state.set_delegate(weak);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidated_wakes_waiters() {
        let state = Arc::new(PortState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.invalidated().await })
        };
        tokio::task::yield_now().await;
        state.invalidate();
        waiter.await.unwrap();

        // Already invalid: resolves immediately
        state.invalidated().await;
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let past = Instant::now();
        assert!(with_deadline(Some(past), std::future::pending::<()>()).await.is_none());
        assert_eq!(with_deadline(None, async { 5 }).await, Some(5));
    }
}
