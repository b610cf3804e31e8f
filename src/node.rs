//! # Node
//!
//! A [`Node`] is one running overlay peer: it owns the UDP socket, the
//! [`Identity`], the endpoint-to-connection table, the distance index
//! feeding the [`RoutingTable`], and the registry of local services.
//!
//! All of that state lives inside a single actor task. The public
//! [`Node`] handle is cheap to clone; every operation is marshaled onto
//! the actor through a command queue and the caller awaits a reply, so
//! external callers get thread-safety without any locking in the core.
//!
//! A separate reader task pulls datagrams off the socket and forwards
//! them to the actor, which finds or creates the [`Connection`] for the
//! source endpoint and feeds it.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelEvent, ChannelKey, ChannelOp};
use crate::connection::{ConnEvent, Connection};
use crate::error::{Error, Result};
use crate::identity::{Identity, NodeId};
use crate::lookup::{LookupHandle, LookupNetwork, LookupOptions};
use crate::peers::{Host, MemoryPeerStore, PeerRecord, PeerStore};
use crate::routing::{RouteEntry, RoutingTable, DEFAULT_BUCKET_WIDTH};
use crate::wire::{HostEntry, Message};

/// NAT punch datagram: a single byte, ignored by every handshake path.
const PUNCH_DATAGRAM: [u8; 1] = [0];

/// Rounds of punch-and-relay before NAT traversal is given up.
const NAT_TRAVERSAL_ROUNDS: u32 = 3;

/// First channel number used for locally opened (ephemeral) channels.
/// Service numbers live below this.
const EPHEMERAL_CHANNEL_BASE: u16 = 0x8000;

/// Actor maintenance cadence: expired lookups, handshake re-sends,
/// retired connections.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// A stalled outbound handshake re-sends its DH value after this long.
const HANDSHAKE_RESEND: Duration = Duration::from_secs(1);

/// A session that never reached steady state is retired after this long
/// without traffic.
const STALE_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    pub bucket_width: usize,
    pub lookup_result_count: usize,
    pub lookup_parallelism: usize,
    pub handshake_timeout: Duration,
    pub route_lookup_timeout: Duration,
    /// Persisted identity location; a fresh identity per run when unset.
    pub identity_path: Option<PathBuf>,
    /// Endpoint asserted during authentication. Defaults to the bound
    /// address; set it when the node knows its public mapping.
    pub external_addr: Option<SocketAddrV4>,
    /// Peer-record persistence collaborator; in-memory when unset.
    pub peer_store: Option<Arc<dyn PeerStore>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().expect("valid literal"),
            bucket_width: DEFAULT_BUCKET_WIDTH,
            lookup_result_count: crate::lookup::DEFAULT_RESULT_COUNT,
            lookup_parallelism: crate::lookup::DEFAULT_PARALLELISM,
            handshake_timeout: Duration::from_secs(10),
            route_lookup_timeout: Duration::from_secs(5),
            identity_path: None,
            external_addr: None,
            peer_store: None,
        }
    }
}

enum Command {
    Connect {
        endpoint: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    /// One punch-and-relay round of NAT traversal toward `endpoint`.
    TraversalRound {
        endpoint: SocketAddr,
        relay: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenChannel {
        remote_id: NodeId,
        remote_channel: u16,
        reply: oneshot::Sender<Result<Channel>>,
    },
    StartService {
        local_channel: u16,
        name: String,
        reply: oneshot::Sender<Result<mpsc::Receiver<Channel>>>,
    },
    CloseService {
        local_channel: u16,
        reply: oneshot::Sender<bool>,
    },
    FindNodesNear {
        target: NodeId,
        n: usize,
        limit: Option<NodeId>,
        reply: oneshot::Sender<Vec<Host>>,
    },
    RemoteNodesNear {
        endpoint: SocketAddr,
        target: NodeId,
        n: u32,
        limit: Option<NodeId>,
        reply: oneshot::Sender<Result<Vec<HostEntry>>>,
    },
    ResolveEndpoint {
        id: NodeId,
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    AdoptNonce {
        nonce: [u64; 2],
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// One running overlay peer. Clone freely; all clones drive the same
/// actor.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    rank: u32,
    local_addr: SocketAddr,
    config: NodeConfig,
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    /// Bind a node with a fresh (or configured, persisted) identity.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let identity = match &config.identity_path {
            Some(path) => Identity::load_or_generate(path)?,
            None => Identity::generate(),
        };
        Self::bind_with_identity(config, identity).await
    }

    pub async fn bind_with_identity(config: NodeConfig, identity: Identity) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let id = identity.id();
        let rank = identity.rank();

        let external_addr = config.external_addr.unwrap_or(match local_addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => SocketAddrV4::new([0, 0, 0, 0].into(), local_addr.port()),
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (chan_ops_tx, chan_ops_rx) = mpsc::channel(1024);
        let (net_tx, net_rx) = mpsc::channel::<(SocketAddr, Bytes)>(1024);

        // Reader task: socket to actor.
        {
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, src)) => {
                            let datagram = Bytes::copy_from_slice(&buf[..len]);
                            if net_tx.send((src, datagram)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "socket read failed, stopping reader");
                            return;
                        }
                    }
                }
            });
        }

        let store = config
            .peer_store
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryPeerStore::new()));
        let actor = NodeActor {
            socket,
            identity,
            external_addr,
            store,
            connections: HashMap::new(),
            by_id: HashMap::new(),
            routing: RoutingTable::new(id, config.bucket_width),
            services: HashMap::new(),
            next_ephemeral: EPHEMERAL_CHANNEL_BASE,
            chan_ops_tx,
            route_lookup_timeout: config.route_lookup_timeout,
        };
        tokio::spawn(actor.run(cmd_rx, chan_ops_rx, net_rx));

        info!(%local_addr, id = %id, rank, "node bound");
        Ok(Self {
            id,
            rank,
            local_addr,
            config,
            cmd_tx,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Drive a connection to `endpoint` to completion, optionally
    /// traversing NAT through `relay` (which must already be connected).
    pub async fn connect_to(
        &self,
        endpoint: SocketAddr,
        relay: Option<SocketAddr>,
    ) -> Result<()> {
        match relay {
            None => {
                let wait = self.command(|reply| Command::Connect { endpoint, reply });
                match tokio::time::timeout(self.config.handshake_timeout, wait).await {
                    Ok(result) => result?,
                    Err(_) => Err(Error::HandshakeTimeout(endpoint)),
                }
            }
            Some(relay) => {
                // Punch, ask the relay, wait; back off and repeat.
                let mut round_timeout = self.config.handshake_timeout / NAT_TRAVERSAL_ROUNDS.max(1);
                for round in 0..NAT_TRAVERSAL_ROUNDS {
                    let wait = self.command(|reply| Command::TraversalRound {
                        endpoint,
                        relay,
                        reply,
                    });
                    match tokio::time::timeout(round_timeout, wait).await {
                        Ok(result) => return result?,
                        Err(_) => {
                            debug!(%endpoint, round, "NAT traversal round timed out");
                            round_timeout *= 2;
                        }
                    }
                }
                Err(Error::NatTraversalFailed)
            }
        }
    }

    /// Open a channel to a service on a connected (or known) peer.
    pub async fn open_channel(&self, remote_id: NodeId, remote_channel: u16) -> Result<Channel> {
        let first = self
            .command(|reply| Command::OpenChannel {
                remote_id,
                remote_channel,
                reply,
            })
            .await?;
        match first {
            Ok(channel) => Ok(channel),
            Err(Error::NoSuchConnection) => {
                // Known from a peer record but not currently connected:
                // dial and retry once.
                let endpoint = self
                    .command(|reply| Command::ResolveEndpoint {
                        id: remote_id,
                        reply,
                    })
                    .await?
                    .ok_or(Error::NoSuchConnection)?;
                self.connect_to(endpoint, None).await?;
                self.command(|reply| Command::OpenChannel {
                    remote_id,
                    remote_channel,
                    reply,
                })
                .await?
            }
            Err(err) => Err(err),
        }
    }

    /// Register a service: inbound channels to `local_channel` arrive on
    /// the returned receiver.
    pub async fn start_service(
        &self,
        local_channel: u16,
        name: &str,
    ) -> Result<mpsc::Receiver<Channel>> {
        let name = name.to_string();
        self.command(|reply| Command::StartService {
            local_channel,
            name,
            reply,
        })
        .await?
    }

    /// Unregister a service. Channels already open stay open.
    pub async fn close_service(&self, local_channel: u16) -> Result<bool> {
        self.command(|reply| Command::CloseService {
            local_channel,
            reply,
        })
        .await
    }

    /// The `n` hosts nearest `target` in this node's own table,
    /// optionally bounded by a distance limit. Also the answer given to
    /// remote route-lookup requests.
    pub async fn find_nodes_near(
        &self,
        target: NodeId,
        n: usize,
        limit: Option<NodeId>,
    ) -> Result<Vec<Host>> {
        self.command(|reply| Command::FindNodesNear {
            target,
            n,
            limit,
            reply,
        })
        .await
    }

    /// Ask one connected peer for hosts near `target`.
    pub async fn remote_nodes_near(
        &self,
        endpoint: SocketAddr,
        target: NodeId,
        n: u32,
        limit: Option<NodeId>,
    ) -> Result<Vec<Host>> {
        let entries = self
            .command(|reply| Command::RemoteNodesNear {
                endpoint,
                target,
                n,
                limit,
                reply,
            })
            .await??;
        Ok(entries
            .into_iter()
            .map(|e| entry_to_host(e, endpoint))
            .collect())
    }

    /// Start an iterative lookup for the nodes closest to `target`.
    pub async fn lookup(&self, target: NodeId) -> Result<LookupHandle> {
        self.lookup_with(target, LookupOptions {
            result_count: self.config.lookup_result_count,
            parallelism: self.config.lookup_parallelism,
            ..LookupOptions::default()
        })
        .await
    }

    pub async fn lookup_with(
        &self,
        target: NodeId,
        options: LookupOptions,
    ) -> Result<LookupHandle> {
        let seeds = self
            .find_nodes_near(target, options.result_count.max(1), None)
            .await?;
        let network = Arc::new(NodeNetwork { node: self.clone() });
        Ok(LookupHandle::spawn(
            network,
            self.id,
            target,
            seeds,
            options,
        ))
    }

    /// Join the overlay through a known peer: connect, then look our own
    /// id up to populate the table.
    pub async fn bootstrap(&self, endpoint: SocketAddr) -> Result<()> {
        self.connect_to(endpoint, None).await?;
        let handle = self.lookup(self.id).await?;
        let _ = handle
            .wait_timeout(self.config.handshake_timeout)
            .await;
        Ok(())
    }

    /// Adopt a rank-improving nonce pair (found by the external rank
    /// search) and announce it to every connected peer.
    pub async fn adopt_nonce(&self, nonce: [u64; 2]) -> Result<bool> {
        self.command(|reply| Command::AdoptNonce { nonce, reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.command(|reply| Command::Shutdown { reply }).await;
    }
}

fn entry_to_host(entry: HostEntry, replier: SocketAddr) -> Host {
    let mut host = Host::new(entry.id, SocketAddr::V4(entry.addr));
    if entry.needs_relay {
        host.relays.push(replier);
    }
    host
}

/// The node's view of the lookup's remote-query seam: ensure a session
/// (relaying if the host is flagged), then ask it.
struct NodeNetwork {
    node: Node,
}

#[async_trait::async_trait]
impl LookupNetwork for NodeNetwork {
    async fn query(
        &self,
        host: &Host,
        target: NodeId,
        n: u32,
        limit: Option<NodeId>,
    ) -> Result<Vec<Host>> {
        match self.node.connect_to(host.endpoint, None).await {
            Ok(()) => {}
            Err(err) => {
                // Direct dial failed: fall back to a relay if the host
                // came flagged with one.
                let Some(relay) = host.relays.first().copied() else {
                    return Err(err);
                };
                self.node.connect_to(host.endpoint, Some(relay)).await?;
            }
        }
        self.node
            .remote_nodes_near(host.endpoint, target, n, limit)
            .await
    }
}

struct Service {
    name: String,
    new_channels: mpsc::Sender<Channel>,
}

struct NodeActor {
    socket: Arc<UdpSocket>,
    identity: Identity,
    external_addr: SocketAddrV4,
    store: Arc<dyn PeerStore>,
    connections: HashMap<SocketAddr, Connection>,
    /// Distance index: authenticated peer id to endpoint.
    by_id: HashMap<NodeId, SocketAddr>,
    routing: RoutingTable,
    services: HashMap<u16, Service>,
    next_ephemeral: u16,
    chan_ops_tx: mpsc::Sender<ChannelOp>,
    route_lookup_timeout: Duration,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut chan_ops_rx: mpsc::Receiver<ChannelOp>,
        mut net_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    ) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                datagram = net_rx.recv() => match datagram {
                    Some((src, bytes)) => self.handle_datagram(src, &bytes).await,
                    None => return,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                op = chan_ops_rx.recv() => if let Some(op) = op {
                    self.handle_channel_op(op).await;
                },
                _ = maintenance.tick() => self.maintenance().await,
            }
        }
    }

    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) {
        if let Err(err) = self.socket.send_to(datagram, dest).await {
            debug!(%dest, %err, "datagram send failed");
        }
    }

    async fn handle_datagram(&mut self, src: SocketAddr, datagram: &[u8]) {
        let conn = self
            .connections
            .entry(src)
            .or_insert_with(|| Connection::new(src));
        let (out, events) = conn.handle_datagram(datagram, &self.identity, self.external_addr);
        for dg in out {
            self.send_to(&dg, src).await;
        }
        for event in events {
            self.handle_conn_event(src, event).await;
        }
    }

    async fn handle_conn_event(&mut self, src: SocketAddr, event: ConnEvent) {
        match event {
            ConnEvent::Authenticated { record } => self.peer_authenticated(src, record).await,
            ConnEvent::Connected => {}
            ConnEvent::Data {
                src_channel,
                dst_channel,
                payload,
            } => self.demux_data(src, src_channel, dst_channel, payload).await,
            ConnEvent::RouteLookup { target, n, limit } => {
                let hosts = self.local_nodes_near(&target, n as usize, limit.as_ref());
                let reply = Message::RouteReply {
                    target,
                    hosts: hosts
                        .iter()
                        .filter_map(|h| match h.endpoint {
                            SocketAddr::V4(addr) => Some(HostEntry {
                                id: h.id,
                                addr,
                                needs_relay: !h.relays.is_empty(),
                            }),
                            SocketAddr::V6(_) => None,
                        })
                        .collect(),
                };
                if let Some(conn) = self.connections.get(&src) {
                    if let Ok(dg) = conn.seal(&reply) {
                        self.send_to(&dg, src).await;
                    }
                }
            }
            ConnEvent::ReverseConnect { endpoint } => {
                // We are the relay: tell the target that `src` wants a
                // connection back.
                let target = SocketAddr::V4(endpoint);
                let SocketAddr::V4(origin) = src else { return };
                match self.connections.get(&target) {
                    Some(conn) if conn.is_connected() => {
                        if let Ok(dg) = conn.seal(&Message::RequestConnect { endpoint: origin }) {
                            self.send_to(&dg, target).await;
                            trace!(%target, %origin, "relayed reverse-connect request");
                        }
                    }
                    _ => debug!(%target, "reverse-connect request for unknown peer dropped"),
                }
            }
            ConnEvent::ConnectRequested { endpoint } => {
                // A relay says this endpoint is waiting for us to dial.
                let dest = SocketAddr::V4(endpoint);
                let conn = self
                    .connections
                    .entry(dest)
                    .or_insert_with(|| Connection::new(dest));
                if let Some(dg) = conn.start_handshake() {
                    self.send_to(&dg, dest).await;
                }
            }
            ConnEvent::Reset => self.peer_detached(src, false).await,
            ConnEvent::Failed => self.peer_detached(src, true).await,
        }
    }

    /// Merge a freshly authenticated record with what the store already
    /// knows, persist it, and index the peer.
    async fn peer_authenticated(&mut self, src: SocketAddr, mut record: PeerRecord) {
        if let Some(previous) = self.store.fetch(&record.id).await {
            record.data_provided = previous.data_provided;
            record.payment_received = previous.payment_received;
            record.uptime_secs = previous.uptime_secs.max(record.uptime_secs);
            record.bandwidth = previous.bandwidth;
            record.latency_ms = previous.latency_ms;
            record.first_seen_ms = previous.first_seen_ms;
        }
        record.touch();
        self.store.store(record.clone()).await;
        self.by_id.insert(record.id, src);
        self.routing.insert(RouteEntry {
            id: record.id,
            endpoint: src,
            record,
        });
    }

    /// A session reset or died: flush the record, drop the peer from the
    /// routing table, and retire the connection if it is gone for good.
    async fn peer_detached(&mut self, src: SocketAddr, retire: bool) {
        let remote_id = self.connections.get(&src).and_then(|c| c.remote_id());
        if let Some(id) = remote_id {
            if let Some(mut record) = self.store.fetch(&id).await {
                record.touch();
                self.store.store(record).await;
            }
            self.routing.remove(&id);
            self.by_id.remove(&id);
        }
        if retire {
            self.connections.remove(&src);
        }
    }

    async fn demux_data(&mut self, src: SocketAddr, their_src: u16, their_dst: u16, payload: Bytes) {
        let key: ChannelKey = (their_dst, their_src);
        let Some(conn) = self.connections.get_mut(&src) else {
            return;
        };
        if let Some(events) = conn.channel(&key) {
            if events.try_send(ChannelEvent::Data(payload)).is_err() {
                trace!(%src, ?key, "channel queue full, datagram shed");
            }
            return;
        }

        // No channel yet: materialize one from the service registry.
        let Some(peer) = conn.remote_id() else { return };
        let Some(service) = self.services.get(&their_dst) else {
            debug!(%src, channel = their_dst, "data for unregistered service");
            if let Ok(dg) = conn.seal(&Message::Close {
                channel: Some((their_dst, their_src)),
            }) {
                self.send_to(&dg, src).await;
            }
            return;
        };

        let (channel, events) = Channel::new(src, peer, key, self.chan_ops_tx.clone());
        let _ = events.try_send(ChannelEvent::Data(payload));
        conn.insert_channel(key, events);
        if service.new_channels.try_send(channel).is_err() {
            warn!(
                service = %service.name,
                channel = their_dst,
                "service is not draining new channels"
            );
        }
    }

    async fn handle_channel_op(&mut self, op: ChannelOp) {
        match op {
            ChannelOp::Send {
                endpoint,
                key,
                payload,
            } => {
                let Some(conn) = self.connections.get(&endpoint) else {
                    return;
                };
                let message = Message::Data {
                    src_channel: key.0,
                    dst_channel: key.1,
                    payload,
                };
                if let Ok(dg) = conn.seal(&message) {
                    self.send_to(&dg, endpoint).await;
                }
            }
            ChannelOp::Close { endpoint, key } => {
                if let Some(conn) = self.connections.get_mut(&endpoint) {
                    conn.drop_channel(key);
                    if let Ok(dg) = conn.seal(&Message::Close { channel: Some(key) }) {
                        self.send_to(&dg, endpoint).await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { endpoint, reply } => {
                let conn = self
                    .connections
                    .entry(endpoint)
                    .or_insert_with(|| Connection::new(endpoint));
                if conn.state() == crate::connection::ConnectionState::Failed {
                    // A written-off session does not block a fresh dial.
                    *conn = Connection::new(endpoint);
                }
                let datagram = conn.start_handshake();
                conn.add_connect_waiter(reply);
                if let Some(dg) = datagram {
                    self.send_to(&dg, endpoint).await;
                }
            }
            Command::TraversalRound {
                endpoint,
                relay,
                reply,
            } => {
                // Open our NAT pinhole toward the target first.
                self.send_to(&PUNCH_DATAGRAM, endpoint).await;
                let SocketAddr::V4(target_v4) = endpoint else {
                    let _ = reply.send(Err(Error::NatTraversalFailed));
                    return;
                };
                let relay_request = match self.connections.get(&relay) {
                    Some(conn) if conn.is_connected() => {
                        conn.seal(&Message::RequestReverseConnect {
                            endpoint: target_v4,
                        })
                    }
                    _ => {
                        let _ = reply.send(Err(Error::NoSuchConnection));
                        return;
                    }
                };
                match relay_request {
                    Ok(dg) => self.send_to(&dg, relay).await,
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                }
                // Resolved when the target's reverse connection reaches
                // steady state.
                self.connections
                    .entry(endpoint)
                    .or_insert_with(|| Connection::new(endpoint))
                    .add_connect_waiter(reply);
            }
            Command::OpenChannel {
                remote_id,
                remote_channel,
                reply,
            } => {
                let result = self.open_channel(remote_id, remote_channel);
                let _ = reply.send(result);
            }
            Command::StartService {
                local_channel,
                name,
                reply,
            } => {
                let result = if self.services.contains_key(&local_channel) {
                    Err(Error::ServiceInUse(local_channel))
                } else {
                    let (tx, rx) = mpsc::channel(16);
                    info!(channel = local_channel, service = %name, "service registered");
                    self.services.insert(
                        local_channel,
                        Service {
                            name,
                            new_channels: tx,
                        },
                    );
                    Ok(rx)
                };
                let _ = reply.send(result);
            }
            Command::CloseService {
                local_channel,
                reply,
            } => {
                let removed = self.services.remove(&local_channel);
                if let Some(service) = &removed {
                    info!(channel = local_channel, service = %service.name, "service closed");
                }
                let _ = reply.send(removed.is_some());
            }
            Command::FindNodesNear {
                target,
                n,
                limit,
                reply,
            } => {
                let hosts = self.local_nodes_near(&target, n, limit.as_ref());
                let _ = reply.send(hosts);
            }
            Command::RemoteNodesNear {
                endpoint,
                target,
                n,
                limit,
                reply,
            } => {
                let Some(conn) = self.connections.get_mut(&endpoint) else {
                    let _ = reply.send(Err(Error::NoSuchConnection));
                    return;
                };
                if !conn.is_connected() {
                    let _ = reply.send(Err(Error::NoSuchConnection));
                    return;
                }
                let message = Message::RouteLookup { target, n, limit };
                match conn.seal(&message) {
                    Ok(dg) => {
                        conn.register_lookup(
                            target,
                            reply,
                            Instant::now() + self.route_lookup_timeout,
                        );
                        self.send_to(&dg, endpoint).await;
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::ResolveEndpoint { id, reply } => {
                let endpoint = match self.by_id.get(&id) {
                    Some(endpoint) => Some(*endpoint),
                    None => self.store.fetch(&id).await.map(|r| r.endpoint),
                };
                let _ = reply.send(endpoint);
            }
            Command::AdoptNonce { nonce, reply } => {
                let improved = self.identity.adopt_nonce(nonce);
                if improved {
                    let message = Message::UpdateRank { nonce };
                    let frames: Vec<(SocketAddr, Vec<u8>)> = self
                        .connections
                        .values()
                        .filter(|c| c.is_connected())
                        .filter_map(|c| c.seal(&message).ok().map(|dg| (c.endpoint(), dg)))
                        .collect();
                    for (endpoint, dg) in frames {
                        self.send_to(&dg, endpoint).await;
                    }
                }
                let _ = reply.send(improved);
            }
            Command::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    fn open_channel(&mut self, remote_id: NodeId, remote_channel: u16) -> Result<Channel> {
        let endpoint = *self.by_id.get(&remote_id).ok_or(Error::NoSuchConnection)?;
        let conn = self
            .connections
            .get_mut(&endpoint)
            .ok_or(Error::NoSuchConnection)?;
        if !conn.is_connected() {
            return Err(Error::NoSuchConnection);
        }
        // Allocate an unused ephemeral local number.
        let mut local = self.next_ephemeral;
        while conn.channel(&(local, remote_channel)).is_some() {
            local = local.wrapping_add(1).max(EPHEMERAL_CHANNEL_BASE);
        }
        self.next_ephemeral = local.wrapping_add(1).max(EPHEMERAL_CHANNEL_BASE);

        let key: ChannelKey = (local, remote_channel);
        let (channel, events) = Channel::new(endpoint, remote_id, key, self.chan_ops_tx.clone());
        conn.insert_channel(key, events);
        Ok(channel)
    }

    fn local_nodes_near(&mut self, target: &NodeId, n: usize, limit: Option<&NodeId>) -> Vec<Host> {
        self.routing
            .closest(target, n, limit)
            .into_iter()
            .map(|entry| {
                let mut host = Host::new(entry.id, entry.endpoint);
                if entry.record.behind_nat {
                    // We hold the live session; offer ourselves as relay.
                    host.relays.push(SocketAddr::V4(self.external_addr));
                }
                host
            })
            .collect()
    }

    async fn maintenance(&mut self) {
        use crate::connection::ConnectionState;

        let now = Instant::now();
        let mut resend: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut retired: Vec<SocketAddr> = Vec::new();
        for (endpoint, conn) in self.connections.iter_mut() {
            conn.expire_lookups(now);
            let idle = now.duration_since(conn.last_seen);
            match conn.state() {
                ConnectionState::Failed => retired.push(*endpoint),
                ConnectionState::Connected => {}
                _ if idle > STALE_SESSION_TIMEOUT => {
                    debug!(%endpoint, "retiring session that never became steady");
                    let mut events = Vec::new();
                    conn.teardown(&mut events);
                    retired.push(*endpoint);
                }
                ConnectionState::GeneratedDh if idle > HANDSHAKE_RESEND => {
                    if let Some(dg) = conn.handshake_retry() {
                        resend.push((*endpoint, dg));
                    }
                }
                _ => {}
            }
        }
        for (endpoint, dg) in resend {
            self.send_to(&dg, endpoint).await;
        }
        for endpoint in retired {
            self.peer_detached(endpoint, true).await;
        }
    }

    async fn shutdown(&mut self) {
        let frames: Vec<(SocketAddr, Vec<u8>)> = self
            .connections
            .values()
            .filter_map(|c| {
                c.seal(&Message::Close { channel: None })
                    .ok()
                    .map(|dg| (c.endpoint(), dg))
            })
            .collect();
        for (endpoint, dg) in frames {
            self.send_to(&dg, endpoint).await;
        }
        let mut events = Vec::new();
        for conn in self.connections.values_mut() {
            conn.teardown(&mut events);
        }
        self.connections.clear();
        debug!("node shut down");
    }
}
