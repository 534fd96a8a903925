//! TCP server vending one root object
//!
//! Every accepted socket becomes its own [`Connection`] with the server's
//! root object set. A semaphore caps concurrent connections; sockets over
//! the cap are closed immediately.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use do_port::StreamPort;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::object::DoObject;

/// Server statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of server statistics
#[derive(Debug, Clone)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
}

/// Distributed-objects server
///
/// # Scalability
///
/// - Each connection runs its own reader task
/// - A semaphore limits maximum concurrent connections
/// - The root object is shared by every connection
pub struct DoServer {
    root: Arc<dyn DoObject>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
}

impl DoServer {
    pub fn new(root: Arc<dyn DoObject>) -> Self {
        Self::with_config(root, ServerConfig::default())
    }

    pub fn with_config(root: Arc<dyn DoObject>, config: ServerConfig) -> Self {
        Self {
            root,
            config,
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind a listener; pass it to [`serve`](Self::serve)
    pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Run the server on the given address
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = Self::listen(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` forever
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F: Future<Output = ()>>(&self, addr: SocketAddr, shutdown: F) -> Result<()> {
        let listener = Self::listen(addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// connection and wait for them to finish
    pub async fn serve_until<F: Future<Output = ()>>(&self, listener: TcpListener, shutdown: F) -> Result<()> {
        info!(
            "Distributed objects server listening on {} (max_connections: {})",
            listener.local_addr()?,
            self.config.max_connections
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let (stop, _) = watch::channel(false);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Server shutting down gracefully");
                    stop.send_replace(true);
                    let _ = semaphore.acquire_many(self.config.max_connections as u32).await;
                    info!("All connections closed");
                    return Ok(());
                }

                result = listener.accept() => {
                    let (stream, peer_addr) = result?;

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!("Connection limit reached, rejecting connection from {}", peer_addr);
                            drop(stream);
                            continue;
                        }
                    };

                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                    debug!("Accepted connection from {}", peer_addr);

                    self.spawn_connection(stream, peer_addr, permit, stop.subscribe());
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        permit: OwnedSemaphorePermit,
        mut stop: watch::Receiver<bool>,
    ) {
        let port = StreamPort::from_tcp(stream, &self.config.connection.port_config());
        let connection = Connection::with_port(Arc::new(port), self.config.connection.clone());
        connection.set_root_object(self.root.clone());
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;

            let stopped = tokio::select! {
                _ = connection.closed() => false,
                _ = stop.wait_for(|stop| *stop) => true,
            };
            if stopped {
                connection.close().await;
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            let conn_stats = connection.stats();
            debug!(
                "Connection from {} closed after {} requests ({} failed)",
                peer_addr, conn_stats.requests_received, conn_stats.requests_failed
            );
        });
    }
}
