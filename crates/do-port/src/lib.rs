//! Message ports for distributed objects
//!
//! A [`Port`] moves framed [`WireMessage`]s between two endpoints. Three
//! transports are provided:
//! - [`StreamPort`]: any reliable byte stream, TCP included
//! - [`UdpPort`]: one frame per datagram
//! - [`LocalPort`]: an in-process pair backed by channels

pub mod error;
pub mod local;
pub mod message;
pub mod port;
pub mod stream;
pub mod udp;

pub use error::{PortError, Result};
pub use local::LocalPort;
pub use message::{MessageHeader, MessageKind, WireMessage, FLAG_ONEWAY, PROTOCOL_VERSION};
pub use port::{
    Port, PortConfig, PortDelegate, PortId, PortState, DEFAULT_LOCAL_QUEUE_DEPTH,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use stream::StreamPort;
pub use udp::{UdpPort, MAX_UDP_PAYLOAD};
