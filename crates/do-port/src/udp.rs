//! Datagram ports
//!
//! Each datagram carries exactly one frame, so a frame can never exceed
//! the UDP payload limit. Delivery is best effort: lost datagrams surface
//! to callers as timeouts.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PortError, Result};
use crate::message::WireMessage;
use crate::port::{with_deadline, Port, PortConfig, PortDelegate, PortId, PortState};

/// Maximum theoretical UDP payload size
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Port over a connected UDP socket
pub struct UdpPort {
    state: PortState,
    socket: UdpSocket,
    peer: SocketAddr,
    max_datagram: usize,
    recv_buf: Mutex<BytesMut>,
}

impl UdpPort {
    /// Bind `local` and connect it to `remote`
    pub async fn connect(local: SocketAddr, remote: SocketAddr, config: &PortConfig) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Self::from_socket(socket, remote, config).await
    }

    /// Connect an already bound socket to `remote`
    pub async fn from_socket(socket: UdpSocket, remote: SocketAddr, config: &PortConfig) -> Result<Self> {
        socket.connect(remote).await?;
        let max_datagram = config.max_frame_size.min(MAX_UDP_PAYLOAD);
        Ok(Self {
            state: PortState::new(),
            socket,
            peer: remote,
            max_datagram,
            recv_buf: Mutex::new(BytesMut::with_capacity(max_datagram)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Port for UdpPort {
    fn id(&self) -> PortId {
        self.state.id()
    }

    async fn send(&self, message: &WireMessage, timeout: Option<Duration>) -> Result<bool> {
        self.state.check()?;
        let frame = message.encode()?;
        if frame.len() > self.max_datagram {
            return Err(PortError::FrameTooLarge {
                size: frame.len(),
                max: self.max_datagram,
            });
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        match with_deadline(deadline, self.socket.send(&frame)).await {
            None => Ok(false),
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => {
                debug!("UDP send to {} failed: {}", self.peer, e);
                self.state.invalidate();
                Err(PortError::Io(e))
            }
        }
    }

    async fn receive(&self, deadline: Option<Instant>) -> Result<Option<WireMessage>> {
        self.state.check()?;
        let mut buf = self.recv_buf.lock().await;

        loop {
            buf.clear();
            buf.resize(self.max_datagram, 0);

            let received = tokio::select! {
                _ = self.state.invalidated() => return Err(PortError::PortInvalid),
                received = with_deadline(deadline, self.socket.recv(&mut buf[..])) => received,
            };
            let len = match received {
                None => return Ok(None),
                Some(Ok(len)) => len,
                Some(Err(e)) => {
                    debug!("UDP receive from {} failed: {}", self.peer, e);
                    self.state.invalidate();
                    return Err(PortError::Io(e));
                }
            };

            buf.truncate(len);
            // A bad datagram does not poison the channel.
            match WireMessage::decode(buf.split().freeze()) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!("Dropping malformed datagram from {}: {}", self.peer, e),
            }
        }
    }

    fn invalidate(&self) {
        self.state.invalidate();
    }

    fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    fn set_delegate(&self, delegate: Weak<dyn PortDelegate>) {
        self.state.set_delegate(delegate);
    }

    fn description(&self) -> String {
        format!("udp {} ({})", self.state.id(), self.peer)
    }
}
