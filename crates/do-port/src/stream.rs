//! Ports over byte streams
//!
//! Frames are self-delimiting through the length field of the header, so
//! any reliable ordered stream (TCP, Unix sockets, in-memory duplex) works.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PortError, Result};
use crate::message::{MessageHeader, WireMessage};
use crate::port::{with_deadline, Port, PortConfig, PortDelegate, PortId, PortState};

/// Accumulates stream bytes and cuts them into frames
struct FrameReader<R> {
    inner: R,
    read_buf: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Read one complete frame. Cancel safe: partial data stays buffered.
    async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < MessageHeader::SIZE {
            if self.fill_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Err(PortError::PortInvalid);
                }
                return Err(PortError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete frame header",
                )));
            }
        }

        let length = MessageHeader::peek_length(&self.read_buf).unwrap_or(0);
        if length < MessageHeader::SIZE {
            return Err(PortError::InvalidMessage(format!(
                "invalid frame length: {} < header size",
                length
            )));
        }
        if length > self.max_frame_size {
            return Err(PortError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        while self.read_buf.len() < length {
            if self.fill_buf().await? == 0 {
                return Err(PortError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete frame: expected {} bytes, got {}",
                        length,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        Ok(self.read_buf.split_to(length).freeze())
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

/// Port over any `AsyncRead + AsyncWrite` stream
pub struct StreamPort<T> {
    state: PortState,
    reader: Mutex<Option<FrameReader<ReadHalf<T>>>>,
    writer: Mutex<Option<WriteHalf<T>>>,
    max_frame_size: usize,
    peer: Option<SocketAddr>,
}

impl<T: AsyncRead + AsyncWrite> StreamPort<T> {
    pub fn new(io: T) -> Self {
        Self::with_config(io, &PortConfig::default())
    }

    pub fn with_config(io: T, config: &PortConfig) -> Self {
        let (read, write) = split(io);
        Self {
            state: PortState::new(),
            reader: Mutex::new(Some(FrameReader::new(read, config.max_frame_size))),
            writer: Mutex::new(Some(write)),
            max_frame_size: config.max_frame_size,
            peer: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Drop whichever stream halves are not in use. The stream closes once
    /// both halves are gone.
    fn release(&self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn fail(&self) {
        self.state.invalidate();
        self.release();
    }
}

impl StreamPort<TcpStream> {
    /// Connect to a listening peer
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: &PortConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream, config))
    }

    /// Wrap an accepted or connected TCP stream
    pub fn from_tcp(stream: TcpStream, config: &PortConfig) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream.peer_addr().ok();
        let mut port = Self::with_config(stream, config);
        port.peer = peer;
        port
    }
}

#[async_trait]
impl<T> Port for StreamPort<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    fn id(&self) -> PortId {
        self.state.id()
    }

    async fn send(&self, message: &WireMessage, timeout: Option<Duration>) -> Result<bool> {
        self.state.check()?;
        let frame = message.encode()?;
        if frame.len() > self.max_frame_size {
            return Err(PortError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = tokio::select! {
            _ = self.state.invalidated() => return Err(PortError::PortInvalid),
            guard = with_deadline(deadline, self.writer.lock()) => match guard {
                Some(guard) => guard,
                None => return Ok(false),
            },
        };
        let Some(writer) = guard.as_mut() else {
            return Err(PortError::PortInvalid);
        };

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let outcome = tokio::select! {
            _ = self.state.invalidated() => None,
            result = with_deadline(deadline, write) => Some(result),
        };

        match outcome {
            None => {
                guard.take();
                Err(PortError::PortInvalid)
            }
            Some(Some(Ok(()))) => Ok(true),
            Some(None) => {
                // Part of the frame may be on the wire; the stream is unusable.
                warn!("Send on port {} timed out mid-frame", self.state.id());
                guard.take();
                drop(guard);
                self.fail();
                Ok(false)
            }
            Some(Some(Err(e))) => {
                debug!("Send on port {} failed: {}", self.state.id(), e);
                guard.take();
                drop(guard);
                self.fail();
                Err(PortError::Io(e))
            }
        }
    }

    async fn receive(&self, deadline: Option<Instant>) -> Result<Option<WireMessage>> {
        self.state.check()?;
        let mut guard = tokio::select! {
            _ = self.state.invalidated() => return Err(PortError::PortInvalid),
            guard = with_deadline(deadline, self.reader.lock()) => match guard {
                Some(guard) => guard,
                None => return Ok(None),
            },
        };
        let Some(reader) = guard.as_mut() else {
            return Err(PortError::PortInvalid);
        };

        let outcome = tokio::select! {
            _ = self.state.invalidated() => None,
            result = with_deadline(deadline, reader.read_frame()) => Some(result),
        };

        let result = match outcome {
            None => Err(PortError::PortInvalid),
            Some(None) => return Ok(None),
            Some(Some(frame)) => frame.and_then(WireMessage::decode),
        };
        match result {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                if !matches!(e, PortError::PortInvalid) {
                    debug!("Receive on port {} failed: {}", self.state.id(), e);
                }
                guard.take();
                drop(guard);
                self.fail();
                Err(e)
            }
        }
    }

    fn invalidate(&self) {
        self.fail();
    }

    fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    fn set_delegate(&self, delegate: Weak<dyn PortDelegate>) {
        self.state.set_delegate(delegate);
    }

    fn description(&self) -> String {
        match self.peer {
            Some(peer) => format!("stream {} ({})", self.state.id(), peer),
            None => format!("stream {}", self.state.id()),
        }
    }
}
