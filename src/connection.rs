//! # Connections
//!
//! One [`Connection`] is an encrypted session with one remote endpoint:
//! the Diffie-Hellman handshake, the authentication exchange, the
//! encrypted framing and the per-connection books (channels, pending
//! route lookups).
//!
//! The connection is a pure state machine: it never touches the socket.
//! Feeding it an inbound datagram yields the datagrams to send back and
//! a list of [`ConnEvent`]s for the owning node to act on. All state
//! lives inside the node's single execution context.
//!
//! ## States
//!
//! `Uninit → GeneratedDh → ReceivedDh → Authenticated → Connected`, with
//! `Failed` terminal. State only moves forward except for the explicit
//! reset back to `Uninit`: any decrypt or validation failure resets the
//! session and restarts the handshake transparently. Ten consecutive
//! failed advances force `Failed`.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};

use bytes::Bytes;
use ed25519_dalek::Signature;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelEvent, ChannelKey};
use crate::crypto::{
    auth_digest, parse_handshake_datagram, DhExchange, FrameCipher, DH_LEN,
};
use crate::error::{Error, Result};
use crate::identity::{rank_of, verify_signature, Identity, NodeId};
use crate::peers::{now_ms, PeerRecord};
use crate::wire::{decode_frame, encode_frame, AuthPayload, HostEntry, Message};

/// Consecutive failed advances before a connection is written off.
const MAX_FAILED_ADVANCES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninit,
    GeneratedDh,
    ReceivedDh,
    Authenticated,
    Connected,
    Failed,
}

/// What the owning node must do after feeding a connection.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// The peer authenticated; persist the record and index the peer.
    Authenticated { record: PeerRecord },
    /// Steady state reached; connect waiters have been resolved.
    Connected,
    /// A data frame for `(dst, src)`; the node demultiplexes it.
    Data {
        src_channel: u16,
        dst_channel: u16,
        payload: Bytes,
    },
    /// The peer asks for hosts near a target.
    RouteLookup {
        target: NodeId,
        n: u32,
        limit: Option<NodeId>,
    },
    /// We are asked to relay: tell `endpoint` to connect to this peer.
    ReverseConnect { endpoint: SocketAddrV4 },
    /// A relay tells us someone at `endpoint` wants us to dial them.
    ConnectRequested { endpoint: SocketAddrV4 },
    /// The session was reset; flush the peer record if one is bound.
    Reset,
    /// Terminal failure.
    Failed,
}

type LookupWaiter = (oneshot::Sender<Result<Vec<HostEntry>>>, Instant);

pub(crate) struct Connection {
    endpoint: SocketAddr,
    state: ConnectionState,
    dh: Option<DhExchange>,
    cipher: Option<FrameCipher>,
    shared_secret: Option<[u8; DH_LEN]>,

    remote_id: Option<NodeId>,
    remote_public_key: Option<[u8; 32]>,
    remote_rank: u32,
    behind_nat: bool,

    sent_auth: bool,
    auth_confirmed: bool,
    failed_advances: u32,

    channels: HashMap<ChannelKey, mpsc::Sender<ChannelEvent>>,
    pending_lookups: HashMap<NodeId, Vec<LookupWaiter>>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,

    established_at: Option<Instant>,
    pub(crate) last_seen: Instant,
}

impl Connection {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            state: ConnectionState::Uninit,
            dh: None,
            cipher: None,
            shared_secret: None,
            remote_id: None,
            remote_public_key: None,
            remote_rank: 0,
            behind_nat: false,
            sent_auth: false,
            auth_confirmed: false,
            failed_advances: 0,
            channels: HashMap::new(),
            pending_lookups: HashMap::new(),
            connect_waiters: Vec::new(),
            established_at: None,
            last_seen: Instant::now(),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_id(&self) -> Option<NodeId> {
        self.remote_id
    }

    pub fn behind_nat(&self) -> bool {
        self.behind_nat
    }

    pub fn remote_rank(&self) -> u32 {
        self.remote_rank
    }

    pub fn uptime_secs(&self) -> u64 {
        self.established_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Register a caller waiting for this connection to reach steady
    /// state; resolved by the state machine.
    pub fn add_connect_waiter(&mut self, waiter: oneshot::Sender<Result<()>>) {
        match self.state {
            ConnectionState::Connected => {
                let _ = waiter.send(Ok(()));
            }
            ConnectionState::Failed => {
                let _ = waiter.send(Err(Error::ConnectionFailed(self.endpoint)));
            }
            _ => self.connect_waiters.push(waiter),
        }
    }

    /// Begin an outbound handshake. Returns the DH datagram to send.
    pub fn start_handshake(&mut self) -> Option<Vec<u8>> {
        if self.state != ConnectionState::Uninit {
            return None;
        }
        let dh = DhExchange::generate();
        let datagram = dh.handshake_datagram();
        self.dh = Some(dh);
        self.state = ConnectionState::GeneratedDh;
        trace!(endpoint = %self.endpoint, "handshake started");
        Some(datagram)
    }

    /// Re-encode the pending DH value for a stalled outbound handshake.
    pub fn handshake_retry(&self) -> Option<Vec<u8>> {
        if self.state != ConnectionState::GeneratedDh {
            return None;
        }
        self.dh.as_ref().map(|dh| dh.handshake_datagram())
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Feed one inbound datagram. Returns datagrams to send back to this
    /// endpoint plus events for the node.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        identity: &Identity,
        asserted_addr: SocketAddrV4,
    ) -> (Vec<Vec<u8>>, Vec<ConnEvent>) {
        self.last_seen = Instant::now();
        let mut out = Vec::new();
        let mut events = Vec::new();
        if self.state == ConnectionState::Failed {
            return (out, events);
        }

        match self.state {
            ConnectionState::Uninit | ConnectionState::GeneratedDh => {
                self.handle_handshake_datagram(datagram, identity, asserted_addr, &mut out, &mut events);
            }
            _ => {
                let cipher = self.cipher.clone().expect("keyed state has a cipher");
                match cipher.decrypt(datagram).and_then(|plain| {
                    decode_frame(&plain).and_then(|(t, p)| Message::decode(t, p))
                }) {
                    Ok(message) => {
                        self.handle_message(message, identity, asserted_addr, &mut out, &mut events)
                    }
                    Err(err) => {
                        debug!(endpoint = %self.endpoint, %err, "frame rejected, resetting session");
                        self.reset(&mut events);
                        // The failing datagram may itself be the peer
                        // restarting its handshake; try it as one.
                        if self.state != ConnectionState::Failed {
                            self.handle_handshake_datagram(
                                datagram,
                                identity,
                                asserted_addr,
                                &mut out,
                                &mut events,
                            );
                        }
                    }
                }
            }
        }
        (out, events)
    }

    fn handle_handshake_datagram(
        &mut self,
        datagram: &[u8],
        identity: &Identity,
        asserted_addr: SocketAddrV4,
        out: &mut Vec<Vec<u8>>,
        events: &mut Vec<ConnEvent>,
    ) {
        let Some(peer_public) = parse_handshake_datagram(datagram) else {
            // Too short for a DH value: a NAT punch or noise. Ignore.
            trace!(endpoint = %self.endpoint, len = datagram.len(), "ignoring short datagram");
            return;
        };

        if self.dh.is_none() {
            let dh = DhExchange::generate();
            out.push(dh.handshake_datagram());
            self.dh = Some(dh);
            self.state = ConnectionState::GeneratedDh;
        }

        let dh = self.dh.as_ref().expect("generated above");
        match dh.shared_secret(&peer_public) {
            Ok(secret) => {
                self.cipher = Some(FrameCipher::new(secret));
                self.shared_secret = Some(secret);
                self.dh = None;
                self.state = ConnectionState::ReceivedDh;
                trace!(endpoint = %self.endpoint, "shared secret derived");
                // Both sides authenticate immediately once keyed.
                if let Some(frame) = self.build_auth(identity, asserted_addr) {
                    out.push(frame);
                    self.sent_auth = true;
                }
            }
            Err(_) => {
                debug!(endpoint = %self.endpoint, "degenerate DH value, resetting");
                self.reset(events);
            }
        }
    }

    fn build_auth(&mut self, identity: &Identity, asserted_addr: SocketAddrV4) -> Option<Vec<u8>> {
        let secret = self.shared_secret.as_ref()?;
        let timestamp_ms = now_ms();
        let digest = auth_digest(secret, timestamp_ms);
        let signature = identity.sign(&digest);
        let auth = Message::Auth(AuthPayload {
            signature: signature.to_bytes(),
            public_key: identity.public_key_bytes(),
            timestamp_ms,
            nonce: identity.nonce(),
            asserted: asserted_addr,
        });
        self.seal(&auth).ok()
    }

    fn handle_message(
        &mut self,
        message: Message,
        identity: &Identity,
        asserted_addr: SocketAddrV4,
        out: &mut Vec<Vec<u8>>,
        events: &mut Vec<ConnEvent>,
    ) {
        match message {
            Message::Auth(auth) => self.handle_auth(auth, identity, asserted_addr, out, events),
            Message::AuthResponse { ok } => {
                if ok {
                    self.auth_confirmed = true;
                    self.try_advance_connected(events);
                } else {
                    debug!(endpoint = %self.endpoint, "peer rejected our authentication");
                    self.reset(events);
                }
            }
            Message::Data {
                src_channel,
                dst_channel,
                payload,
            } => {
                if self.state == ConnectionState::Connected
                    || self.state == ConnectionState::Authenticated
                {
                    events.push(ConnEvent::Data {
                        src_channel,
                        dst_channel,
                        payload,
                    });
                }
            }
            Message::RouteLookup { target, n, limit } => {
                events.push(ConnEvent::RouteLookup { target, n, limit });
            }
            Message::RouteReply { target, hosts } => {
                if let Some(waiters) = self.pending_lookups.remove(&target) {
                    for (waiter, _) in waiters {
                        let _ = waiter.send(Ok(hosts.clone()));
                    }
                } else {
                    trace!(endpoint = %self.endpoint, %target, "unsolicited route reply dropped");
                }
            }
            Message::Close { channel } => match channel {
                Some((their_src, their_dst)) => {
                    // Their (src, dst) is our (dst, src).
                    self.drop_channel((their_dst, their_src));
                }
                None => {
                    debug!(endpoint = %self.endpoint, "peer closed the connection");
                    self.teardown(events);
                }
            },
            Message::UpdateRank { nonce } => {
                if let Some(public_key) = &self.remote_public_key {
                    let rank = rank_of(nonce, public_key);
                    if rank > self.remote_rank {
                        self.remote_rank = rank;
                        if let Some(record) = self.make_record() {
                            events.push(ConnEvent::Authenticated { record });
                        }
                    } else {
                        trace!(endpoint = %self.endpoint, "ignoring non-improving rank update");
                    }
                }
            }
            Message::RequestReverseConnect { endpoint } => {
                if self.state == ConnectionState::Connected {
                    events.push(ConnEvent::ReverseConnect { endpoint });
                }
            }
            Message::RequestConnect { endpoint } => {
                events.push(ConnEvent::ConnectRequested { endpoint });
            }
        }
    }

    fn handle_auth(
        &mut self,
        auth: AuthPayload,
        identity: &Identity,
        asserted_addr: SocketAddrV4,
        out: &mut Vec<Vec<u8>>,
        events: &mut Vec<ConnEvent>,
    ) {
        let Some(secret) = self.shared_secret else {
            return;
        };
        let digest = auth_digest(&secret, auth.timestamp_ms);
        let signature = Signature::from_bytes(&auth.signature);
        if !verify_signature(&auth.public_key, &digest, &signature) {
            warn!(endpoint = %self.endpoint, "authentication signature invalid");
            if let Ok(frame) = self.seal(&Message::AuthResponse { ok: false }) {
                out.push(frame);
            }
            if let Ok(frame) = self.seal(&Message::Close { channel: None }) {
                out.push(frame);
            }
            self.reset(events);
            return;
        }

        // Identity is bound; NAT is inferred from the endpoint mismatch.
        let observed = match self.endpoint {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => auth.asserted,
        };
        self.remote_id = Some(NodeId::of_public_key(&auth.public_key));
        self.remote_public_key = Some(auth.public_key);
        self.remote_rank = rank_of(auth.nonce, &auth.public_key);
        self.behind_nat = auth.asserted != observed;

        if self.state == ConnectionState::ReceivedDh {
            self.state = ConnectionState::Authenticated;
        }

        // Our own auth may have been dropped in a reset race; it must
        // reach the peer before our confirmation does.
        if !self.sent_auth {
            if let Some(frame) = self.build_auth(identity, asserted_addr) {
                out.push(frame);
                self.sent_auth = true;
            }
        }
        if let Ok(frame) = self.seal(&Message::AuthResponse { ok: true }) {
            out.push(frame);
        }

        if let Some(record) = self.make_record() {
            events.push(ConnEvent::Authenticated { record });
        }
        self.try_advance_connected(events);
    }

    fn make_record(&self) -> Option<PeerRecord> {
        let id = self.remote_id?;
        let public_key = self.remote_public_key?;
        let mut record = PeerRecord::new(id, self.endpoint, public_key);
        record.session_key = self.shared_secret;
        record.behind_nat = self.behind_nat;
        record.rank = self.remote_rank;
        record.uptime_secs = self.uptime_secs();
        Some(record)
    }

    fn try_advance_connected(&mut self, events: &mut Vec<ConnEvent>) {
        if self.state == ConnectionState::Authenticated && self.auth_confirmed {
            self.state = ConnectionState::Connected;
            self.failed_advances = 0;
            self.established_at = Some(Instant::now());
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            events.push(ConnEvent::Connected);
            debug!(
                endpoint = %self.endpoint,
                id = %self.remote_id.expect("authenticated"),
                "connection established"
            );
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Encrypt and frame a message for this connection's endpoint.
    pub fn seal(&self, message: &Message) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(Error::ConnectionClosed)?;
        let frame = encode_frame(message.msg_type(), &message.encode_payload());
        cipher.encrypt(&frame)
    }

    /// Register a route-lookup promise; resolved by a route reply for
    /// the same target, failed by [`expire_lookups`](Self::expire_lookups).
    pub fn register_lookup(
        &mut self,
        target: NodeId,
        waiter: oneshot::Sender<Result<Vec<HostEntry>>>,
        deadline: Instant,
    ) {
        self.pending_lookups
            .entry(target)
            .or_default()
            .push((waiter, deadline));
    }

    /// Fail every lookup promise whose deadline has passed.
    pub fn expire_lookups(&mut self, now: Instant) {
        let mut kept: HashMap<NodeId, Vec<LookupWaiter>> = HashMap::new();
        for (target, waiters) in self.pending_lookups.drain() {
            let mut remaining = Vec::new();
            for (waiter, deadline) in waiters {
                if deadline <= now {
                    trace!(%target, "route lookup expired");
                    let _ = waiter.send(Err(Error::LookupTimeout));
                } else {
                    remaining.push((waiter, deadline));
                }
            }
            if !remaining.is_empty() {
                kept.insert(target, remaining);
            }
        }
        self.pending_lookups = kept;
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub fn insert_channel(&mut self, key: ChannelKey, events: mpsc::Sender<ChannelEvent>) {
        self.channels.insert(key, events);
    }

    pub fn channel(&self, key: &ChannelKey) -> Option<&mpsc::Sender<ChannelEvent>> {
        self.channels.get(key)
    }

    pub fn drop_channel(&mut self, key: ChannelKey) {
        if let Some(events) = self.channels.remove(&key) {
            let _ = events.try_send(ChannelEvent::Closed);
        }
    }

    // ------------------------------------------------------------------
    // Reset / teardown
    // ------------------------------------------------------------------

    /// Demote back to `Uninit`, invalidating all session state. Channels
    /// die with the session; the handshake may restart afterwards.
    fn reset(&mut self, events: &mut Vec<ConnEvent>) {
        self.failed_advances += 1;
        self.dh = None;
        self.cipher = None;
        self.shared_secret = None;
        self.sent_auth = false;
        self.auth_confirmed = false;
        self.established_at = None;
        for (_, channel) in self.channels.drain() {
            let _ = channel.try_send(ChannelEvent::Closed);
        }
        self.fail_lookups();
        events.push(ConnEvent::Reset);

        if self.failed_advances >= MAX_FAILED_ADVANCES {
            warn!(endpoint = %self.endpoint, "too many failed advances, giving up");
            self.state = ConnectionState::Failed;
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(Error::ConnectionFailed(self.endpoint)));
            }
            events.push(ConnEvent::Failed);
        } else {
            self.state = ConnectionState::Uninit;
        }
    }

    /// Orderly local close or remote close frame: everything is
    /// released and the connection is retired.
    pub fn teardown(&mut self, events: &mut Vec<ConnEvent>) {
        for (_, channel) in self.channels.drain() {
            let _ = channel.try_send(ChannelEvent::Closed);
        }
        self.fail_lookups();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        self.state = ConnectionState::Failed;
        events.push(ConnEvent::Failed);
    }

    fn fail_lookups(&mut self) {
        for (_, waiters) in self.pending_lookups.drain() {
            for (waiter, _) in waiters {
                let _ = waiter.send(Err(Error::ConnectionClosed));
            }
        }
    }
}
