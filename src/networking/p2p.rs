// Copyright (c) 2026 Meshline
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! P2P subsystem (libp2p): persistent identity, a gossipsub rendezvous
//! topic for bootstrap presence announcements, and two request-response
//! protocols: `/meshline/overlay/1` for the overlay's raw `cid`-prefixed
//! data frames, and `/meshline/sync/1` for the anti-entropy control plane
//! (`crate::core::sync::SyncMessage`: introduction requests/responses,
//! `missing-*` repair, and the double-member signature round trip).
//!
//! - Outbound data: [`Endpoint::send`] enqueues `(wan address, frame)`
//!   pairs; the swarm task resolves the address to a `PeerId` (learned via
//!   `identify`) and sends a request-response request.
//! - Inbound data: request-response requests are handed to the caller as
//!   [`P2pEvent::FrameReceived`]; the dispatcher/pipeline answer is sent
//!   back as the response.
//! - Outbound sync: [`P2pEndpoint::send_sync_request`] enqueues a request;
//!   inbound sync requests surface as [`P2pEvent::SyncRequestReceived`]
//!   carrying a `reply_token`, answered via [`P2pEndpoint::reply_sync`]
//!   (the underlying libp2p `ResponseChannel` never leaves this task).
//! - Allowlist: if `allow_peers` is non-empty, peers outside it are
//!   disconnected on connect.
//! - Metrics: peer count gauge, banned counter, invalid-frame counter,
//!   sync rounds initiated/answered.

use std::{
    collections::HashMap,
    io,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use libp2p::{
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity},
    identify, noise, ping,
    request_response::{self, ProtocolSupport},
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport,
};

use libp2p::futures::StreamExt;
use libp2p::swarm::Config as SwarmConfig;

use crate::core::endpoint::Endpoint;
use crate::core::sync::Candidate;
use crate::monitoring::metrics::Metrics;

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Events emitted by the P2P node.
#[derive(Clone, Debug)]
pub enum P2pEvent {
    /// Peer connected.
    PeerConnected(Vec<u8>),
    /// Peer disconnected.
    PeerDisconnected(Vec<u8>),
    /// An overlay frame arrived from a peer, for the dispatcher to demux.
    FrameReceived {
        /// The peer's id bytes.
        peer: Vec<u8>,
        /// Raw frame bytes (`cid` prefix still present).
        frame: Vec<u8>,
    },
    /// A sync control-plane request arrived, awaiting a reply via
    /// [`P2pEndpoint::reply_sync`] keyed by `reply_token`.
    SyncRequestReceived {
        /// The peer's id bytes.
        peer: Vec<u8>,
        /// Opaque token identifying the open response channel.
        reply_token: u64,
        /// Encoded [`crate::core::sync::SyncMessage`].
        frame: Vec<u8>,
    },
    /// A reply to a sync control-plane request this node sent arrived.
    SyncResponseReceived {
        /// The peer's id bytes.
        peer: Vec<u8>,
        /// Encoded [`crate::core::sync::SyncMessage`].
        frame: Vec<u8>,
    },
}

/// Receiver of P2P events.
pub type EventRx = mpsc::Receiver<P2pEvent>;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("io")]
    Io,
    #[error("config")]
    Config,
}

/// Runtime configuration for the P2P subsystem.
#[derive(Clone, Debug)]
pub struct P2pConfig {
    /// Listen address as string (e.g. "/ip4/0.0.0.0/tcp/7760").
    pub listen_addr: String,
    /// Gossipsub topic peers announce their presence on, for bootstrap
    /// rendezvous.
    pub rendezvous_topic: String,
    /// Data directory used for persistent identity.
    pub data_dir: String,
    /// Bootstrap multiaddrs to dial on startup.
    pub bootstrap: Vec<String>,
    /// Optional allowlist of peer ids (empty => allow all).
    pub allow_peers: Vec<String>,
}

/// Raw frame exchanged over the request-response protocol. The "request"
/// direction carries the `cid`-prefixed overlay packet; the "response"
/// direction carries whatever immediate answer the dispatcher/pipeline
/// produced (an empty vec if none).
#[derive(Clone, Debug, Default)]
pub struct Frame(pub Vec<u8>);

/// `request_response` codec for raw, length-prefixed [`Frame`]s.
#[derive(Clone, Default)]
pub struct FrameCodec;

async fn read_length_prefixed<T: AsyncRead + Unpin + Send>(
    io: &mut T,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_length_prefixed<T: AsyncWrite + Unpin + Send>(
    io: &mut T,
    data: &[u8],
) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    Ok(())
}

#[async_trait]
impl request_response::Codec for FrameCodec {
    type Protocol = StreamProtocol;
    type Request = Frame;
    type Response = Frame;

    async fn read_request<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request> {
        Ok(Frame(read_length_prefixed(io, MAX_FRAME_BYTES).await?))
    }

    async fn read_response<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response> {
        Ok(Frame(read_length_prefixed(io, MAX_FRAME_BYTES).await?))
    }

    async fn write_request<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        Frame(data): Self::Request,
    ) -> io::Result<()> {
        write_length_prefixed(io, &data).await
    }

    async fn write_response<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        Frame(data): Self::Response,
    ) -> io::Result<()> {
        write_length_prefixed(io, &data).await
    }
}

/// Raw frame exchanged over the sync control-plane protocol (encoded
/// [`crate::core::sync::SyncMessage`]s). A distinct type from [`Frame`] so
/// the two `request_response` behaviours produce distinguishable events.
#[derive(Clone, Debug, Default)]
pub struct SyncFrame(pub Vec<u8>);

/// `request_response` codec for length-prefixed [`SyncFrame`]s.
#[derive(Clone, Default)]
pub struct SyncFrameCodec;

#[async_trait]
impl request_response::Codec for SyncFrameCodec {
    type Protocol = StreamProtocol;
    type Request = SyncFrame;
    type Response = SyncFrame;

    async fn read_request<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request> {
        Ok(SyncFrame(read_length_prefixed(io, MAX_FRAME_BYTES).await?))
    }

    async fn read_response<T: AsyncRead + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response> {
        Ok(SyncFrame(read_length_prefixed(io, MAX_FRAME_BYTES).await?))
    }

    async fn write_request<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        SyncFrame(data): Self::Request,
    ) -> io::Result<()> {
        write_length_prefixed(io, &data).await
    }

    async fn write_response<T: AsyncWrite + Unpin + Send>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        SyncFrame(data): Self::Response,
    ) -> io::Result<()> {
        write_length_prefixed(io, &data).await
    }
}

/// One outbound frame queued by [`P2pEndpoint::send`], addressed by WAN
/// socket address (resolved to a `PeerId` by the swarm task).
struct OutboundFrame {
    target_wan: std::net::SocketAddr,
    packet: Vec<u8>,
}

/// One outbound sync control-plane request, addressed by WAN socket
/// address.
struct OutboundSyncRequest {
    target_wan: std::net::SocketAddr,
    frame: Vec<u8>,
}

/// A queued reply to an inbound sync request, keyed by the `reply_token`
/// handed out in [`P2pEvent::SyncRequestReceived`].
struct SyncReply {
    reply_token: u64,
    frame: Vec<u8>,
}

/// [`Endpoint`] implementation backed by the libp2p swarm task.
pub struct P2pEndpoint {
    tx: mpsc::Sender<OutboundFrame>,
    dial_tx: mpsc::Sender<std::net::SocketAddr>,
    sync_tx: mpsc::Sender<OutboundSyncRequest>,
    sync_reply_tx: mpsc::Sender<SyncReply>,
    peer_count: Arc<AtomicUsize>,
}

impl P2pEndpoint {
    /// Ask the swarm task to dial `addr` (e.g. a freshly re-resolved
    /// bootstrap address), best-effort.
    pub fn dial(&self, addr: std::net::SocketAddr) {
        let _ = self.dial_tx.try_send(addr);
    }

    /// Send an encoded [`crate::core::sync::SyncMessage`] as a sync
    /// control-plane request to `target_wan`, best-effort.
    pub fn send_sync_request(&self, target_wan: std::net::SocketAddr, frame: Vec<u8>) {
        let _ = self.sync_tx.try_send(OutboundSyncRequest { target_wan, frame });
    }

    /// Answer an inbound sync control-plane request previously delivered as
    /// [`P2pEvent::SyncRequestReceived`] with `reply_token`.
    pub fn reply_sync(&self, reply_token: u64, frame: Vec<u8>) {
        let _ = self.sync_reply_tx.try_send(SyncReply { reply_token, frame });
    }
}

impl Endpoint for P2pEndpoint {
    fn send(&self, candidates: &[Candidate], packets: &[Vec<u8>]) {
        for candidate in candidates {
            for packet in packets {
                let _ = self.tx.try_send(OutboundFrame {
                    target_wan: candidate.wan,
                    packet: packet.clone(),
                });
            }
        }
    }

    fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum BehaviourEvent {
    Gossipsub(gossipsub::Event),
    RequestResponse(request_response::Event<Frame, Frame>),
    SyncRequestResponse(request_response::Event<SyncFrame, SyncFrame>),
    Identify(identify::Event),
    Ping(()),
}
impl From<gossipsub::Event> for BehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}
impl From<request_response::Event<Frame, Frame>> for BehaviourEvent {
    fn from(e: request_response::Event<Frame, Frame>) -> Self {
        Self::RequestResponse(e)
    }
}
impl From<request_response::Event<SyncFrame, SyncFrame>> for BehaviourEvent {
    fn from(e: request_response::Event<SyncFrame, SyncFrame>) -> Self {
        Self::SyncRequestResponse(e)
    }
}
impl From<identify::Event> for BehaviourEvent {
    fn from(e: identify::Event) -> Self {
        Self::Identify(e)
    }
}
impl From<ping::Event> for BehaviourEvent {
    fn from(_e: ping::Event) -> Self {
        Self::Ping(())
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    request_response: request_response::Behaviour<FrameCodec>,
    sync_request_response: request_response::Behaviour<SyncFrameCodec>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

fn ensure_dir(path: &str) -> Result<(), P2pError> {
    let p = Path::new(path);
    if !p.exists() {
        std::fs::create_dir_all(p).map_err(|_| P2pError::Io)?;
    }
    Ok(())
}

/// Spawn the P2P task (real libp2p).
pub fn spawn_p2p(
    cfg: P2pConfig,
    metrics: Arc<Metrics>,
) -> Result<(P2pEndpoint, EventRx, tokio::task::JoinHandle<()>), P2pError> {
    ensure_dir(&cfg.data_dir)?;

    let (local_peer_id, id_keys) = crate::networking::p2p_identity::load_or_create_identity(&cfg.data_dir)
        .map_err(|_| P2pError::Io)?;

    let mut allow_set: std::collections::HashSet<PeerId> = std::collections::HashSet::new();
    for s in cfg.allow_peers.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
        match s.parse::<PeerId>() {
            Ok(pid) => {
                allow_set.insert(pid);
            }
            Err(_) => warn!(peer = %s, "invalid allow_peers entry; ignoring"),
        }
    }

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(1024);
    let (dial_tx, mut dial_rx) = mpsc::channel::<std::net::SocketAddr>(256);
    let (sync_tx, mut sync_rx) = mpsc::channel::<OutboundSyncRequest>(1024);
    let (sync_reply_tx, mut sync_reply_rx) = mpsc::channel::<SyncReply>(1024);
    let (ev_tx, ev_rx) = mpsc::channel::<P2pEvent>(1024);
    let peer_count = Arc::new(AtomicUsize::new(0));

    let listen_addr = cfg.listen_addr.clone();
    let rendezvous_topic_name = cfg.rendezvous_topic.clone();
    let bootstrap = cfg.bootstrap.clone();
    let peer_count_task = peer_count.clone();

    let join = tokio::spawn(async move {
        let noise_keys = match noise::Config::new(&id_keys) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to build noise config");
                return;
            }
        };

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_keys)
            .multiplex(yamux::Config::default())
            .boxed();

        let gcfg = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .unwrap_or_else(|_| gossipsub::Config::default());

        let mut gossipsub = match gossipsub::Behaviour::new(MessageAuthenticity::Signed(id_keys.clone()), gcfg) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to create gossipsub behaviour");
                return;
            }
        };

        let rendezvous_topic = IdentTopic::new(rendezvous_topic_name.clone());
        if let Err(e) = gossipsub.subscribe(&rendezvous_topic) {
            warn!(err = ?e, "failed to subscribe rendezvous topic");
        }

        let request_response = request_response::Behaviour::new(
            [(StreamProtocol::new("/meshline/overlay/1"), ProtocolSupport::Full)],
            request_response::Config::default(),
        );

        let sync_request_response = request_response::Behaviour::new(
            [(StreamProtocol::new("/meshline/sync/1"), ProtocolSupport::Full)],
            request_response::Config::default(),
        );

        let identify = identify::Behaviour::new(identify::Config::new(
            "meshline/1.0.0".to_string(),
            id_keys.public(),
        ));

        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(Duration::from_secs(10))
                .with_timeout(Duration::from_secs(20)),
        );

        let behaviour = Behaviour {
            gossipsub,
            request_response,
            sync_request_response,
            identify,
            ping,
        };

        let mut swarm = Swarm::new(transport, behaviour, local_peer_id, SwarmConfig::with_tokio_executor());

        let listen: Multiaddr = match listen_addr.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(addr = %listen_addr, "bad listen_addr");
                return;
            }
        };
        if let Err(e) = swarm.listen_on(listen) {
            warn!(err = ?e, "listen_on failed");
            return;
        }

        for b in bootstrap.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match b.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma.clone()) {
                        warn!(boot = %b, err = ?e, "dial bootstrap failed");
                    } else {
                        info!(boot = %b, "dialing bootstrap");
                    }
                }
                Err(_) => warn!(boot = %b, "bad bootstrap addr; skipping"),
            }
        }

        info!(%local_peer_id, topic = %rendezvous_topic_name, "p2p loop started");
        metrics.p2p_peers.set(0);

        // Address book: WAN socket address -> PeerId, learned via identify.
        let mut addr_book: HashMap<std::net::SocketAddr, PeerId> = HashMap::new();
        // Inbound sync requests awaiting a reply, keyed by a synthetic
        // token handed out in `P2pEvent::SyncRequestReceived` (libp2p's
        // `ResponseChannel` must be consumed on this task).
        let mut pending_sync_channels: HashMap<u64, request_response::ResponseChannel<SyncFrame>> = HashMap::new();
        let mut next_reply_token: u64 = 0;
        let mut announce = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = announce.tick() => {
                    let _ = swarm.behaviour_mut().gossipsub.publish(rendezvous_topic.clone(), local_peer_id.to_bytes());
                }

                maybe_addr = dial_rx.recv() => {
                    if let Some(addr) = maybe_addr {
                        let ma = socket_addr_to_multiaddr(addr);
                        if let Err(e) = swarm.dial(ma.clone()) {
                            warn!(%ma, err = ?e, "dial failed");
                        }
                    }
                }

                maybe_frame = out_rx.recv() => {
                    match maybe_frame {
                        Some(OutboundFrame { target_wan, packet }) => {
                            match addr_book.get(&target_wan) {
                                Some(peer_id) => {
                                    swarm.behaviour_mut().request_response.send_request(peer_id, Frame(packet));
                                }
                                None => {
                                    warn!(addr = %target_wan, "no known peer id for candidate; dropping frame");
                                }
                            }
                        }
                        None => {
                            warn!("outbound channel closed; stopping p2p task");
                            break;
                        }
                    }
                }

                maybe_sync = sync_rx.recv() => {
                    match maybe_sync {
                        Some(OutboundSyncRequest { target_wan, frame }) => {
                            match addr_book.get(&target_wan) {
                                Some(peer_id) => {
                                    swarm.behaviour_mut().sync_request_response.send_request(peer_id, SyncFrame(frame));
                                    metrics.sync_rounds_initiated_total.inc();
                                }
                                None => {
                                    warn!(addr = %target_wan, "no known peer id for sync candidate; dropping request");
                                }
                            }
                        }
                        None => {
                            warn!("sync outbound channel closed; stopping p2p task");
                            break;
                        }
                    }
                }

                maybe_reply = sync_reply_rx.recv() => {
                    if let Some(SyncReply { reply_token, frame }) = maybe_reply {
                        match pending_sync_channels.remove(&reply_token) {
                            Some(channel) => {
                                let _ = swarm.behaviour_mut().sync_request_response.send_response(channel, SyncFrame(frame));
                            }
                            None => warn!(reply_token, "sync reply arrived after its channel expired"),
                        }
                    }
                }

                ev = swarm.select_next_some() => {
                    match ev {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr=%address, "listening");
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            if !allow_set.is_empty() && !allow_set.contains(&peer_id) {
                                warn!(%peer_id, "peer not in allowlist; disconnecting");
                                metrics.p2p_banned_total.inc();
                                let _ = swarm.disconnect_peer_id(peer_id);
                                continue;
                            }
                            if let Ok(addr) = multiaddr_to_socket_addr(endpoint.get_remote_address()) {
                                addr_book.insert(addr, peer_id);
                            }
                            metrics.p2p_peers.inc();
                            peer_count_task.fetch_add(1, Ordering::Relaxed);
                            let _ = ev_tx.send(P2pEvent::PeerConnected(peer_id.to_bytes())).await;
                            info!(%peer_id, "peer connected");
                        }

                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            metrics.p2p_peers.dec();
                            peer_count_task.fetch_sub(1, Ordering::Relaxed);
                            let _ = ev_tx.send(P2pEvent::PeerDisconnected(peer_id.to_bytes())).await;
                            info!(%peer_id, "peer disconnected");
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(request_response::Event::Message { peer, message, .. })) => {
                            if !allow_set.is_empty() && !allow_set.contains(&peer) {
                                warn!(%peer, "frame from non-allowlisted peer; dropping");
                                metrics.p2p_banned_total.inc();
                                continue;
                            }
                            match message {
                                request_response::Message::Request { request, channel, .. } => {
                                    let _ = ev_tx.send(P2pEvent::FrameReceived { peer: peer.to_bytes(), frame: request.0 }).await;
                                    let _ = swarm.behaviour_mut().request_response.send_response(channel, Frame(Vec::new()));
                                }
                                request_response::Message::Response { response, .. } => {
                                    if !response.0.is_empty() {
                                        let _ = ev_tx.send(P2pEvent::FrameReceived { peer: peer.to_bytes(), frame: response.0 }).await;
                                    }
                                }
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(request_response::Event::OutboundFailure { peer, error, .. })) => {
                            warn!(%peer, err = ?error, "outbound frame delivery failed");
                            metrics.p2p_invalid_msg_total.inc();
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::SyncRequestResponse(request_response::Event::Message { peer, message, .. })) => {
                            if !allow_set.is_empty() && !allow_set.contains(&peer) {
                                warn!(%peer, "sync frame from non-allowlisted peer; dropping");
                                metrics.p2p_banned_total.inc();
                                continue;
                            }
                            match message {
                                request_response::Message::Request { request, channel, .. } => {
                                    let token = next_reply_token;
                                    next_reply_token = next_reply_token.wrapping_add(1);
                                    pending_sync_channels.insert(token, channel);
                                    metrics.sync_rounds_answered_total.inc();
                                    let _ = ev_tx.send(P2pEvent::SyncRequestReceived {
                                        peer: peer.to_bytes(),
                                        reply_token: token,
                                        frame: request.0,
                                    }).await;
                                }
                                request_response::Message::Response { response, .. } => {
                                    if !response.0.is_empty() {
                                        let _ = ev_tx.send(P2pEvent::SyncResponseReceived { peer: peer.to_bytes(), frame: response.0 }).await;
                                    }
                                }
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::SyncRequestResponse(request_response::Event::OutboundFailure { peer, error, .. })) => {
                            warn!(%peer, err = ?error, "outbound sync request delivery failed");
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::SyncRequestResponse(_)) => {}

                        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message { propagation_source, .. })) => {
                            // Rendezvous announcements only carry presence; dialing happens
                            // via the bootstrap list and subsequent identify/connect events.
                            let _ = propagation_source;
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, info })) => {
                            for addr in info.listen_addrs {
                                if let Ok(sock) = multiaddr_to_socket_addr(&addr) {
                                    addr_book.insert(sock, peer_id);
                                }
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Identify(_)) => {}
                        SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}

                        _ => {}
                    }
                }
            }
        }
    });

    Ok((
        P2pEndpoint {
            tx: out_tx,
            dial_tx,
            sync_tx,
            sync_reply_tx,
            peer_count,
        },
        ev_rx,
        join,
    ))
}

fn socket_addr_to_multiaddr(addr: std::net::SocketAddr) -> Multiaddr {
    use libp2p::core::multiaddr::Protocol;
    let mut ma = Multiaddr::empty();
    match addr.ip() {
        std::net::IpAddr::V4(v) => ma.push(Protocol::Ip4(v)),
        std::net::IpAddr::V6(v) => ma.push(Protocol::Ip6(v)),
    }
    ma.push(Protocol::Tcp(addr.port()));
    ma
}

fn multiaddr_to_socket_addr(addr: &Multiaddr) -> Result<std::net::SocketAddr, ()> {
    use libp2p::core::multiaddr::Protocol;
    let mut ip = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(v) => ip = Some(std::net::IpAddr::V4(v)),
            Protocol::Ip6(v) => ip = Some(std::net::IpAddr::V6(v)),
            Protocol::Tcp(v) => port = Some(v),
            _ => {}
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) => Ok(std::net::SocketAddr::new(ip, port)),
        _ => Err(()),
    }
}
