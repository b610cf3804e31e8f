//! Error taxonomy for the overlay core.
//!
//! Protocol errors (bad frame, checksum, signature) are recovered locally
//! by resetting the affected connection; they are never fatal to the node.
//! Liveness and resource errors surface to the caller as named failures.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Frame too short, bad padding, or unknown message type.
    #[error("malformed frame")]
    Frame,

    /// Frame checksum did not match the payload.
    #[error("frame checksum mismatch")]
    Checksum,

    /// Auth signature did not verify against the asserted public key.
    #[error("signature verification failed")]
    BadSignature,

    /// Proof-of-work nonce pair does not support the claimed rank.
    #[error("nonce pair does not meet claimed rank")]
    BadRank,

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    #[error("connection to {0} failed")]
    ConnectionFailed(SocketAddr),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    /// A data frame or open request named a local channel with no
    /// registered service.
    #[error("no service registered on channel {0}")]
    NoSuchService(u16),

    /// `start_service` on a channel number that already has a service.
    #[error("channel {0} already has a registered service")]
    ServiceInUse(u16),

    /// The named peer has no live connection and no known endpoint.
    #[error("no connection for peer")]
    NoSuchConnection,

    /// A pending route-lookup promise expired before a reply arrived.
    #[error("route lookup timed out")]
    LookupTimeout,

    #[error("operation canceled")]
    Canceled,

    /// All punch/relay rounds were exhausted without a reverse connect.
    #[error("NAT traversal via relay failed")]
    NatTraversalFailed,

    #[error("node is shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
