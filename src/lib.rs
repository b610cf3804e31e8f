//! # Veilmesh - Encrypted Peer-to-Peer Overlay
//!
//! Veilmesh is a secure overlay node built from raw UDP sockets:
//!
//! - **Identity**: Ed25519 keypair plus a proof-of-work nonce pair; the
//!   160-bit node id is the SHA-1 of the public key
//! - **Connection**: per-peer encrypted session (Diffie-Hellman key
//!   exchange, signature authentication, Blowfish-CBC framing)
//! - **Channel**: logical duplex streams multiplexed over a connection
//! - **ReliableStream**: ordered, reliable delivery with selective
//!   retransmission and a congestion window, layered over a channel
//! - **Routing**: Kademlia-style XOR-distance table and iterative lookup
//!   for locating nodes and resources
//! - **NAT traversal**: punch-and-relay reverse connection setup
//!
//! ## Architecture
//!
//! Each node runs one actor task that owns the socket, every connection,
//! the routing table and the service registry. Public handles are cheap
//! to clone and marshal every operation onto that task through command
//! channels, so callers get thread-safety without locks in the core.
//! Reliable streams follow the same pattern with one driver task per
//! stream.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Socket, actor run loop, connection table, service registry |
//! | `identity` | Keypair, node ids, rank proof-of-work, persistence |
//! | `connection` | Handshake/auth state machine and encrypted framing |
//! | `channel` | Multiplexed duplex stream handles |
//! | `stream` | Reliable ordered delivery over a channel |
//! | `routing` | 161-bucket XOR-distance peer table |
//! | `lookup` | Bounded-parallelism narrowing search |
//! | `crypto` | DH parameters, frame cipher, auth digests |
//! | `wire` | Frame header and typed message codecs |
//! | `seq` | Wrap-safe sequence numbers and gap sets |
//! | `peers` | Peer records and the persistence seam |

mod channel;
mod connection;
mod crypto;
mod error;
mod identity;
mod lookup;
mod node;
mod peers;
mod routing;
mod seq;
mod stream;
mod wire;

pub use channel::Channel;
pub use error::{Error, Result};
pub use identity::{bucket_index, rank_of, Identity, NodeId, ID_LEN};
pub use lookup::{
    FilterVerdict, LookupFilter, LookupHandle, LookupNetwork, LookupOptions,
    DEFAULT_PARALLELISM, DEFAULT_RESULT_COUNT,
};
pub use node::{Node, NodeConfig};
pub use peers::{Host, MemoryPeerStore, PeerRecord, PeerStore};
pub use seq::{GapSet, Seq};
pub use stream::{ReliableStream, DEAD_PEER_TIMEOUT, HEARTBEAT};
