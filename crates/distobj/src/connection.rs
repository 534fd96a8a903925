//! Connections
//!
//! A [`Connection`] multiplexes method calls in both directions over a pair
//! of ports. Outgoing requests are numbered; replies are matched back to
//! their callers by sequence number alone, so a slow call never holds up a
//! fast one. Incoming requests each run on their own task, with the method
//! body on the blocking pool.
//!
//! # Scalability
//!
//! - One reader task per connection
//! - Pending calls are `oneshot` channels in a table guarded by one lock
//! - No state is shared between connections

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use do_port::{
    LocalPort, MessageKind, Port, PortDelegate, PortId, StreamPort, UdpPort, WireMessage, FLAG_ONEWAY,
};
use do_signature::MethodSignature;
use parking_lot::Mutex;
use tokio::net::ToSocketAddrs;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{DoError, Result};
use crate::exporter::Exporter;
use crate::marshal::{self, Outgoing};
use crate::object::DoObject;
use crate::proxy::DistantObject;

/// Parsed signatures kept per connection
const SIGNATURE_CACHE_LIMIT: usize = 1024;

/// Connection statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub requests_sent: AtomicU64,
    pub replies_received: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_failed: AtomicU64,
    pub timeouts: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub requests_sent: u64,
    pub replies_received: u64,
    pub requests_received: u64,
    pub requests_failed: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct CallTable {
    invalid: bool,
    pending: HashMap<u32, oneshot::Sender<WireMessage>>,
}

pub(crate) struct ConnectionInner {
    send_port: Arc<dyn Port>,
    receive_port: Arc<dyn Port>,
    config: ConnectionConfig,
    local_tag: u32,
    peer_tag: Mutex<Option<u32>>,
    sequence: AtomicU32,
    calls: Mutex<CallTable>,
    proxies: Mutex<HashMap<u32, Weak<DistantObject>>>,
    pub(crate) exporter: Exporter,
    signatures: Mutex<HashMap<String, Arc<MethodSignature>>>,
    closed: watch::Sender<bool>,
    stats: ConnectionStats,
    runtime: Handle,
}

/// Removes a pending call on every exit path
struct PendingGuard<'a> {
    inner: &'a ConnectionInner,
    sequence: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.calls.lock().pending.remove(&self.sequence);
    }
}

impl ConnectionInner {
    pub(crate) fn is_valid(&self) -> bool {
        !self.calls.lock().invalid
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a sequence number and its reply slot. Fails once the
    /// connection is invalid; checked under the lock invalidation drains.
    fn register_pending(&self) -> Result<(u32, oneshot::Receiver<WireMessage>, PendingGuard<'_>)> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.calls.lock();
        if calls.invalid {
            return Err(DoError::ConnectionInvalid);
        }
        let mut sequence = self.next_sequence();
        while calls.pending.contains_key(&sequence) {
            sequence = self.next_sequence();
        }
        calls.pending.insert(sequence, tx);
        drop(calls);
        Ok((
            sequence,
            rx,
            PendingGuard {
                inner: self,
                sequence,
            },
        ))
    }

    async fn send_message(&self, message: &WireMessage) -> Result<()> {
        if !self.send_port.send(message, Some(self.config.request_timeout)).await? {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(DoError::Timeout);
        }
        self.stats
            .bytes_sent
            .fetch_add(message.encoded_len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send a request and wait for the reply with the same sequence number.
    ///
    /// References vended by the request belong to the peer once it is sent.
    pub(crate) async fn request(
        &self,
        kind: MessageKind,
        outgoing: Outgoing,
        timeout: Option<Duration>,
    ) -> Result<WireMessage> {
        let Outgoing { payload, refs } = outgoing;
        let (sequence, rx, _guard) = self.register_pending()?;
        let message = WireMessage::new(kind, sequence, self.local_tag, payload);
        trace!("Sending {:?} #{} ({} bytes)", kind, sequence, message.payload.len());
        self.send_message(&message).await?;
        refs.commit();
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        let timeout = timeout.unwrap_or(self.config.reply_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                self.stats.replies_received.fetch_add(1, Ordering::Relaxed);
                Ok(reply)
            }
            // The sender is dropped only when invalidation drains the table.
            Ok(Err(_)) => Err(DoError::ConnectionInvalid),
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("{:?} #{} timed out after {:?}", kind, sequence, timeout);
                Err(DoError::Timeout)
            }
        }
    }

    /// Send a message that expects no reply
    pub(crate) async fn post(&self, kind: MessageKind, flags: u16, outgoing: Outgoing) -> Result<()> {
        let Outgoing { payload, refs } = outgoing;
        if !self.is_valid() {
            return Err(DoError::ConnectionInvalid);
        }
        let message =
            WireMessage::new(kind, self.next_sequence(), self.local_tag, payload).with_flags(flags);
        self.send_message(&message).await?;
        refs.commit();
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reply(&self, kind: MessageKind, sequence: u32, outgoing: Outgoing) {
        let Outgoing { payload, refs } = outgoing;
        let message = WireMessage::new(kind, sequence, self.local_tag, payload);
        match self.send_message(&message).await {
            Ok(()) => refs.commit(),
            Err(e) => debug!("Failed to send {:?} #{}: {}", kind, sequence, e),
        }
    }

    pub(crate) async fn invoke(&self, selector: &str, outgoing: Outgoing, timeout: Option<Duration>) -> Result<Bytes> {
        trace!("Invoking {} ({} bytes)", selector, outgoing.payload.len());
        let reply = self.request(MessageKind::MethodRequest, outgoing, timeout).await?;
        Ok(reply.payload)
    }

    pub(crate) async fn invoke_oneway(&self, selector: &str, outgoing: Outgoing) -> Result<()> {
        trace!("Invoking {} oneway ({} bytes)", selector, outgoing.payload.len());
        self.post(MessageKind::MethodRequest, FLAG_ONEWAY, outgoing).await
    }

    pub(crate) async fn fetch_method_types(&self, target: u32, selector: &str) -> Result<Option<String>> {
        let payload = marshal::encode_method_type_request(target, selector)?;
        let reply = self.request(MessageKind::MethodTypeRequest, payload.into(), None).await?;
        marshal::decode_method_type_reply(reply.payload)
    }

    pub(crate) async fn send_release(&self, target: u32, count: u32) -> Result<()> {
        debug!("Releasing {} references to remote target {}", count, target);
        let payload = marshal::encode_release(target, count)?;
        self.post(MessageKind::ProxyRelease, 0, payload.into()).await
    }

    /// Parse a type string, reusing earlier parses
    pub(crate) fn parse_signature(&self, types: &str) -> Result<Arc<MethodSignature>> {
        if let Some(signature) = self.signatures.lock().get(types) {
            return Ok(signature.clone());
        }
        let signature = Arc::new(MethodSignature::parse(types)?);
        let mut cache = self.signatures.lock();
        if cache.len() >= SIGNATURE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(types.to_string(), signature.clone());
        Ok(signature)
    }

    /// The proxy for a peer-owned target, counting one more reference to it
    pub(crate) fn proxy_for(self: &Arc<Self>, target: u32) -> Arc<DistantObject> {
        let mut proxies = self.proxies.lock();
        if let Some(proxy) = proxies.get(&target).and_then(Weak::upgrade) {
            proxy.add_reference();
            return proxy;
        }
        let proxy = Arc::new(DistantObject::new(target, Arc::downgrade(self), self.runtime.clone()));
        if !self.is_valid() {
            proxy.mark_dead();
        }
        proxies.insert(target, Arc::downgrade(&proxy));
        debug!("New proxy for remote target {}", target);
        proxy
    }

    /// Drop the registration of a proxy that no longer exists
    pub(crate) fn forget_proxy(&self, target: u32, proxy: *const DistantObject) {
        let mut proxies = self.proxies.lock();
        if let Some(weak) = proxies.get(&target) {
            if weak.as_ptr() == proxy || weak.strong_count() == 0 {
                proxies.remove(&target);
            }
        }
    }

    fn check_peer_tag(&self, message: &WireMessage) -> bool {
        let mut peer = self.peer_tag.lock();
        match *peer {
            None => {
                *peer = Some(message.connection_tag);
                true
            }
            Some(tag) => tag == message.connection_tag,
        }
    }

    fn complete(&self, message: WireMessage) {
        let sender = self.calls.lock().pending.remove(&message.sequence);
        match sender {
            Some(sender) => {
                // The caller may have given up in the meantime.
                let _ = sender.send(message);
            }
            None => warn!(
                "Dropping {:?} #{} with no pending call",
                message.kind, message.sequence
            ),
        }
    }

    pub(crate) fn dispatch_incoming(self: &Arc<Self>, message: WireMessage) {
        if !self.check_peer_tag(&message) {
            warn!(
                "Dropping {:?} #{} from unexpected connection tag {:#x}",
                message.kind, message.sequence, message.connection_tag
            );
            return;
        }
        self.stats
            .bytes_received
            .fetch_add(message.encoded_len() as u64, Ordering::Relaxed);
        trace!("Received {:?} #{}", message.kind, message.sequence);

        match message.kind {
            MessageKind::MethodReply | MessageKind::RootProxyReply | MessageKind::MethodTypeReply => {
                self.complete(message)
            }
            MessageKind::MethodRequest => self.spawn_method_request(message),
            MessageKind::RootProxyRequest => {
                let inner = self.clone();
                self.runtime.spawn(async move {
                    let payload = match marshal::encode_root_reply(&inner) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("Failed to encode root object: {}", e);
                            return;
                        }
                    };
                    inner
                        .reply(MessageKind::RootProxyReply, message.sequence, payload)
                        .await;
                });
            }
            MessageKind::MethodTypeRequest => {
                let inner = self.clone();
                self.runtime.spawn(async move {
                    let conn = inner.clone();
                    let payload = message.payload;
                    let served = tokio::task::spawn_blocking(move || {
                        marshal::serve_method_type_request(&conn, payload)
                    })
                    .await;
                    match served {
                        Ok(Ok(reply)) => {
                            inner
                                .reply(MessageKind::MethodTypeReply, message.sequence, reply.into())
                                .await
                        }
                        Ok(Err(e)) => warn!("Bad method type request #{}: {}", message.sequence, e),
                        Err(e) => error!("Method type lookup panicked: {}", e),
                    }
                });
            }
            MessageKind::ProxyRelease => match marshal::decode_release(message.payload) {
                Ok((target, count)) => {
                    self.exporter.release(target, count);
                }
                Err(e) => warn!("Bad proxy release: {}", e),
            },
            MessageKind::ConnectionShutdown => {
                info!("Peer shut down connection {:#x}", self.local_tag);
                self.invalidate();
            }
        }
    }

    fn spawn_method_request(self: &Arc<Self>, message: WireMessage) {
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);
        let inner = self.clone();
        self.runtime.spawn(async move {
            let sequence = message.sequence;
            let oneway = message.is_oneway();
            let conn = inner.clone();
            let payload = message.payload;
            let served =
                tokio::task::spawn_blocking(move || marshal::serve_request(&conn, payload)).await;

            let reply = match served {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    inner.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    debug!("Request #{} raised {}", sequence, e);
                    match marshal::encode_exception(&e) {
                        Ok(reply) => reply.into(),
                        Err(e) => {
                            error!("Failed to encode exception for #{}: {}", sequence, e);
                            return;
                        }
                    }
                }
                Err(e) => {
                    inner.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    error!("Request #{} panicked: {}", sequence, e);
                    match marshal::encode_exception(&DoError::exception(
                        "InternalInconsistency",
                        "method implementation panicked",
                    )) {
                        Ok(reply) => reply.into(),
                        Err(_) => return,
                    }
                }
            };
            if oneway {
                return;
            }
            inner.reply(MessageKind::MethodReply, sequence, reply).await;
        });
    }

    pub(crate) fn invalidate(&self) {
        let pending = {
            let mut calls = self.calls.lock();
            if calls.invalid {
                return;
            }
            calls.invalid = true;
            std::mem::take(&mut calls.pending)
        };
        let failed = pending.len();
        // Dropping the senders fails every waiter with ConnectionInvalid.
        drop(pending);

        self.send_port.invalidate();
        self.receive_port.invalidate();

        let proxies = std::mem::take(&mut *self.proxies.lock());
        for proxy in proxies.values().filter_map(Weak::upgrade) {
            proxy.mark_dead();
        }
        drop(proxies);
        self.exporter.clear();
        self.closed.send_replace(true);
        info!(
            "Connection {:#x} invalidated ({} pending calls failed)",
            self.local_tag, failed
        );
    }
}

impl PortDelegate for ConnectionInner {
    fn port_invalidated(&self, port: PortId) {
        debug!("Port {} of connection {:#x} invalidated", port, self.local_tag);
        self.invalidate();
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.send_port.invalidate();
        self.receive_port.invalidate();
    }
}

async fn run_reader(connection: Weak<ConnectionInner>, port: Arc<dyn Port>) {
    loop {
        let received = port.receive(None).await;
        let Some(inner) = connection.upgrade() else {
            break;
        };
        match received {
            Ok(Some(message)) => inner.dispatch_incoming(message),
            Ok(None) => continue,
            Err(e) => {
                debug!("Receive on {} ended: {}", port.description(), e);
                inner.invalidate();
                break;
            }
        }
    }
}

/// A distributed-objects connection
///
/// Cloning is cheap; all clones share one connection. The connection is torn
/// down when the last clone is dropped, which also kills its proxies.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Build a connection over a port pair and start its reader.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(send_port: Arc<dyn Port>, receive_port: Arc<dyn Port>, config: ConnectionConfig) -> Self {
        let (closed, _) = watch::channel(false);
        let local_tag = (Uuid::new_v4().as_u128() as u32).max(1);
        let inner = Arc::new(ConnectionInner {
            send_port: send_port.clone(),
            receive_port: receive_port.clone(),
            config,
            local_tag,
            peer_tag: Mutex::new(None),
            sequence: AtomicU32::new(1),
            calls: Mutex::new(CallTable::default()),
            proxies: Mutex::new(HashMap::new()),
            exporter: Exporter::new(),
            signatures: Mutex::new(HashMap::new()),
            closed,
            stats: ConnectionStats::default(),
            runtime: Handle::current(),
        });

        let delegate: Weak<ConnectionInner> = Arc::downgrade(&inner);
        send_port.set_delegate(delegate.clone());
        receive_port.set_delegate(delegate);

        inner
            .runtime
            .spawn(run_reader(Arc::downgrade(&inner), receive_port.clone()));
        debug!(
            "Connection {:#x} started on {}",
            local_tag,
            receive_port.description()
        );
        Self { inner }
    }

    /// A connection that sends and receives on one port
    pub fn with_port(port: Arc<dyn Port>, config: ConnectionConfig) -> Self {
        Self::new(port.clone(), port, config)
    }

    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A, config: ConnectionConfig) -> Result<Self> {
        let port = StreamPort::connect(addr, &config.port_config()).await?;
        Ok(Self::with_port(Arc::new(port), config))
    }

    pub async fn connect_udp(local: SocketAddr, remote: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let port = UdpPort::connect(local, remote, &config.port_config()).await?;
        Ok(Self::with_port(Arc::new(port), config))
    }

    /// Two connections joined by in-process ports
    pub fn local_pair(config: ConnectionConfig) -> (Self, Self) {
        let (a, b) = LocalPort::pair_with_config(&config.port_config());
        (
            Self::with_port(Arc::new(a), config.clone()),
            Self::with_port(Arc::new(b), config),
        )
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Vend `root` to the peer as this connection's root object
    pub fn set_root_object(&self, root: Arc<dyn DoObject>) {
        let target = self.inner.exporter.set_root(root);
        debug!("Connection {:#x} vends root target {}", self.inner.local_tag, target);
    }

    /// Ask the peer for its root object
    pub async fn root_proxy(&self) -> Result<Arc<DistantObject>> {
        let reply = self
            .inner
            .request(MessageKind::RootProxyRequest, Bytes::new().into(), None)
            .await?;
        marshal::decode_root_reply(&self.inner, reply.payload)
    }

    /// Send an encoded method request and wait for its encoded reply.
    ///
    /// `timeout` overrides the configured reply timeout.
    pub async fn send_invocation(&self, selector: &str, payload: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        self.inner.invoke(selector, payload.into(), timeout).await
    }

    /// Send an encoded method request without waiting for a reply
    pub async fn send_oneway(&self, selector: &str, payload: Bytes) -> Result<()> {
        self.inner.invoke_oneway(selector, payload.into()).await
    }

    /// Handle one incoming message as if the reader had received it
    pub fn dispatch_incoming(&self, message: WireMessage) {
        self.inner.dispatch_incoming(message);
    }

    /// Kill the connection: both ports, all pending calls and all proxies.
    /// Idempotent.
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    /// Tell the peer we are going away, then invalidate
    pub async fn close(&self) {
        if self.inner.is_valid() {
            let message = WireMessage::new(
                MessageKind::ConnectionShutdown,
                self.inner.next_sequence(),
                self.inner.local_tag,
                Bytes::new(),
            );
            if let Err(e) = self.inner.send_message(&message).await {
                debug!("Failed to send shutdown: {}", e);
            }
        }
        self.inner.invalidate();
    }

    /// Resolves once the connection is invalid
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// Calls waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.calls.lock().pending.len()
    }

    /// Live proxies for peer objects
    pub fn proxy_count(&self) -> usize {
        self.inner
            .proxies
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Objects this side has vended
    pub fn exported_count(&self) -> usize {
        self.inner.exporter.len()
    }

    /// Remote references held on an exported object
    pub fn exported_refs(&self, object: &Arc<dyn DoObject>) -> Option<u32> {
        let target = self.inner.exporter.target_of(object)?;
        self.inner.exporter.refs(target)
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Tag stamped on every message this side sends
    pub fn local_tag(&self) -> u32 {
        self.inner.local_tag
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_tag", &format_args!("{:#x}", self.inner.local_tag))
            .field("valid", &self.is_valid())
            .field("pending", &self.pending_requests())
            .finish()
    }
}
