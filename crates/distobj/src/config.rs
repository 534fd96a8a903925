//! Connection and server configuration

use std::time::Duration;

use do_port::{PortConfig, DEFAULT_MAX_FRAME_SIZE};

/// Default time allowed for handing a request to the transport
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for a reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection limit for [`DoServer`](crate::DoServer)
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Send timeout for outgoing requests and replies
    pub request_timeout: Duration,
    /// How long a caller waits for a reply unless the call overrides it
    pub reply_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Settings for the ports a connection creates itself
    pub fn port_config(&self) -> PortConfig {
        PortConfig::default().with_max_frame_size(self.max_frame_size)
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: usize,
    /// Applied to every accepted connection
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}
