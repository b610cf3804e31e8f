//! # Channels
//!
//! A [`Channel`] is a logical duplex stream multiplexed over one
//! connection, identified inside that connection by its
//! `(local_port, remote_port)` pair. The handle is thin: sending routes
//! through the node's framer tagged as a data message, receiving drains
//! a single-consumer event queue fed by the connection's dispatch.
//!
//! Handles are cheap to clone and share one underlying stream; closing
//! any handle invalidates all of them. A channel never outlives its
//! connection: when the connection resets or closes, every channel on it
//! observes a closed error.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::identity::NodeId;

/// (local_port, remote_port) within one connection.
pub type ChannelKey = (u16, u16);

/// Queued deliveries per channel before the (unreliable) channel starts
/// shedding datagrams.
pub(crate) const CHANNEL_QUEUE_DEPTH: usize = 256;

/// Delivery from the connection's dispatch to a channel handle.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Data(Bytes),
    Closed,
}

/// Operations a channel handle marshals back onto the node's context.
#[derive(Debug)]
pub(crate) enum ChannelOp {
    Send {
        endpoint: SocketAddr,
        key: ChannelKey,
        payload: Bytes,
    },
    Close {
        endpoint: SocketAddr,
        key: ChannelKey,
    },
}

#[derive(Clone)]
pub struct Channel {
    endpoint: SocketAddr,
    peer: NodeId,
    key: ChannelKey,
    ops: mpsc::Sender<ChannelOp>,
    events: Arc<Mutex<mpsc::Receiver<ChannelEvent>>>,
    closed: Arc<AtomicBool>,
}

impl Channel {
    pub(crate) fn new(
        endpoint: SocketAddr,
        peer: NodeId,
        key: ChannelKey,
        ops: mpsc::Sender<ChannelOp>,
    ) -> (Self, mpsc::Sender<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let channel = Self {
            endpoint,
            peer,
            key,
            ops,
            events: Arc::new(Mutex::new(event_rx)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (channel, event_tx)
    }

    pub fn local_port(&self) -> u16 {
        self.key.0
    }

    pub fn remote_port(&self) -> u16 {
        self.key.1
    }

    pub fn peer_endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn peer_id(&self) -> NodeId {
        self.peer
    }

    /// Forward bytes to the peer, tagged with this channel's port pair.
    /// Delivery is unordered and unreliable; layer a reliable stream on
    /// top when that matters.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        self.ops
            .send(ChannelOp::Send {
                endpoint: self.endpoint,
                key: self.key,
                payload,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Wait for the next delivery. Returns [`Error::ChannelClosed`] once
    /// the channel or its connection is gone.
    pub async fn recv(&self) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(ChannelEvent::Data(bytes)) => Ok(bytes),
            Some(ChannelEvent::Closed) | None => {
                self.closed.store(true, Ordering::Release);
                Err(Error::ChannelClosed)
            }
        }
    }

    /// Detach from the connection and notify the peer. Every clone of
    /// this handle observes the close.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .ops
            .send(ChannelOp::Close {
                endpoint: self.endpoint,
                key: self.key,
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .field("local", &self.key.0)
            .field("remote", &self.key.1)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
