//! Distributed objects
//!
//! Objects in one process answer method calls made through proxies in
//! another. Calls are described by type-encoded method signatures, carried
//! as coder sessions inside port messages, and dispatched to a
//! [`DoObject`] on the far side.
//!
//! # Features
//!
//! - Concurrent calls on one connection, replies matched by sequence number
//! - Objects passed by reference (as proxies) or by copy
//! - Out and inout pointer arguments
//! - Oneway methods, remote exceptions, reference-counted proxy release
//! - TCP, UDP and in-process transports
//!
//! # Example
//!
//! ```no_run
//! use distobj::{ConnectionConfig, DoServer, ObjectBuilder, Connection};
//! use do_coder::Value;
//!
//! #[tokio::main]
//! async fn main() -> distobj::Result<()> {
//!     let counter = ObjectBuilder::new("Counter")
//!         .method("count", "i@:", |_: &(), inv| inv.set_return_value(Value::Int(3)))?
//!         .build(());
//!
//!     let server = DoServer::new(counter);
//!     tokio::spawn(async move { server.run("127.0.0.1:4710".parse().unwrap()).await });
//!
//!     let connection = Connection::connect_tcp("127.0.0.1:4710", ConnectionConfig::default()).await?;
//!     let root = connection.root_proxy().await?;
//!     let count = root.forward("count", vec![]).await?;
//!     assert_eq!(count.as_i64(), Some(3));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod exporter;
pub mod invocation;
pub mod object;
pub mod proxy;
pub mod server;

mod marshal;

pub use config::{
    ConnectionConfig, ConnectionConfigBuilder, ServerConfig, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_REPLY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use connection::{Connection, ConnectionStats, ConnectionStatsSnapshot};
pub use error::{DoError, Result};
pub use exporter::Exporter;
pub use invocation::{Argument, CallOutcome, Invocation, ObjectCopy, ObjectHandle, STRING_CLASS};
pub use marshal::{EXCEPTION_CLASS, REFERENCE_CLASS};
pub use object::{DoObject, MethodTable, ObjectBuilder, TableObject};
pub use proxy::{DistantObject, PROXY_CLASS};
pub use server::{DoServer, ServerStats, ServerStatsSnapshot};
