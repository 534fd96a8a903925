//! In-process ports
//!
//! A connected pair of ports backed by bounded channels. Frames are still
//! encoded so both ends exercise the same wire path as a socket would.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::error::{PortError, Result};
use crate::message::WireMessage;
use crate::port::{with_deadline, Port, PortConfig, PortDelegate, PortId, PortState};

/// One end of an in-process channel
pub struct LocalPort {
    state: PortState,
    tx: SyncMutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    max_frame_size: usize,
}

impl LocalPort {
    /// Create two connected ports
    pub fn pair() -> (LocalPort, LocalPort) {
        Self::pair_with_config(&PortConfig::default())
    }

    pub fn pair_with_config(config: &PortConfig) -> (LocalPort, LocalPort) {
        let depth = config.local_queue_depth.max(1);
        let (a_tx, a_rx) = mpsc::channel(depth);
        let (b_tx, b_rx) = mpsc::channel(depth);
        (
            Self::new(a_tx, b_rx, config.max_frame_size),
            Self::new(b_tx, a_rx, config.max_frame_size),
        )
    }

    fn new(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>, max_frame_size: usize) -> Self {
        Self {
            state: PortState::new(),
            tx: SyncMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            max_frame_size,
        }
    }

    fn fail(&self) {
        self.state.invalidate();
        // Dropping our sender ends the peer's receive stream.
        self.tx.lock().take();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

#[async_trait]
impl Port for LocalPort {
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
        let tx = self.tx.lock().clone().ok_or(PortError::PortInvalid)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let sent = tokio::select! {
            _ = self.state.invalidated() => return Err(PortError::PortInvalid),
            sent = with_deadline(deadline, tx.send(frame)) => sent,
        };
        match sent {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(_)) => {
                self.fail();
                Err(PortError::PortInvalid)
            }
        }
    }

    async fn receive(&self, deadline: Option<Instant>) -> Result<Option<WireMessage>> {
        self.state.check()?;
        let mut rx = tokio::select! {
            _ = self.state.invalidated() => return Err(PortError::PortInvalid),
            rx = with_deadline(deadline, self.rx.lock()) => match rx {
                Some(rx) => rx,
                None => return Ok(None),
            },
        };

        let received = tokio::select! {
            _ = self.state.invalidated() => {
                rx.close();
                return Err(PortError::PortInvalid);
            }
            received = with_deadline(deadline, rx.recv()) => received,
        };
        match received {
            None => Ok(None),
            Some(Some(frame)) => WireMessage::decode(frame).map(Some),
            Some(None) => {
                drop(rx);
                self.fail();
                Err(PortError::PortInvalid)
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
        format!("local {}", self.state.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (a, b) = LocalPort::pair();
        let msg = WireMessage::new(MessageKind::MethodRequest, 1, 2, Bytes::from_static(b"ping"));
        assert!(a.send(&msg, None).await.unwrap());
        assert_eq!(b.receive(None).await.unwrap(), Some(msg.clone()));

        let reply = WireMessage::new(MessageKind::MethodReply, 1, 2, Bytes::from_static(b"pong"));
        b.send(&reply, None).await.unwrap();
        assert_eq!(a.receive(None).await.unwrap(), Some(reply));
    }

    #[tokio::test]
    async fn test_invalidate_reaches_peer() {
        let (a, b) = LocalPort::pair();
        a.invalidate();
        assert!(matches!(b.receive(None).await, Err(PortError::PortInvalid)));
        assert!(!b.is_valid());
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        let config = PortConfig::default().with_local_queue_depth(1);
        let (a, _b) = LocalPort::pair_with_config(&config);
        let msg = WireMessage::new(MessageKind::ProxyRelease, 0, 1, Bytes::new());
        assert!(a.send(&msg, Some(Duration::from_millis(10))).await.unwrap());
        assert!(!a.send(&msg, Some(Duration::from_millis(10))).await.unwrap());
        assert!(a.is_valid());
    }

    #[tokio::test]
    async fn test_receive_deadline() {
        let (a, _b) = LocalPort::pair();
        let got = a.receive(Some(Instant::now() + Duration::from_millis(10))).await.unwrap();
        assert!(got.is_none());
    }
}
