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

//! Pair-wise anti-entropy: introduction request/response, sync-window
//! answering, the `missing-*` repair sub-protocol, and the double-member
//! `dispersy-signature-request`/`-response` round trip.

pub mod bloom;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::core::community::Community;
use crate::core::store::{RowId, Store, StoreError};
use crate::core::types::{
    decode_canonical_limited, encode_canonical, CodecError, MemberId, MetaName, PublicKey,
    TimelineAction,
};
pub use bloom::BloomFilter;

/// Upper bound on a decoded [`SyncMessage`], matching the overlay's
/// UDP-datagram framing cap.
pub const MAX_SYNC_MESSAGE_BYTES: usize = 65_476;

/// The control-plane envelope carried over the sync transport: introduction
/// request/response, the `missing-*` repair sub-protocol, and the
/// double-member signature round trip. Distinct from [`crate::core::types::Message`],
/// which never leaves the overlay's data plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SyncMessage {
    /// `dispersy-introduction-request`, addressed to a specific community.
    Introduce {
        /// Community this request concerns.
        community: MemberId,
        /// The request body.
        request: IntroductionRequest,
    },
    /// `dispersy-introduction-response`.
    Introduced {
        /// Community this response concerns.
        community: MemberId,
        /// The response body.
        response: IntroductionResponse,
    },
    /// `missing-identity(mid)`.
    MissingIdentity {
        /// 24-bit request identifier, echoed in the reply.
        identifier: u32,
        /// The member whose identity is requested.
        mid: MemberId,
    },
    /// Reply to [`SyncMessage::MissingIdentity`].
    Identity {
        /// Echoes the request identifier.
        identifier: u32,
        /// The member's public key, if known.
        public_key: Option<PublicKey>,
    },
    /// `missing-message(member, [global_time])`.
    MissingMessage {
        /// 24-bit request identifier.
        identifier: u32,
        /// Community this request concerns.
        community: MemberId,
        /// The message author.
        member: MemberId,
        /// Requested global times.
        global_times: Vec<u64>,
    },
    /// `missing-sequence(member, meta, low, high)`.
    MissingSequence {
        /// 24-bit request identifier.
        identifier: u32,
        /// Community this request concerns.
        community: MemberId,
        /// The message author.
        member: MemberId,
        /// The meta the sequence numbers belong to.
        meta: MetaName,
        /// First requested sequence number.
        low: u64,
        /// Last requested sequence number.
        high: u64,
    },
    /// `missing-proof(member, meta, action, global_time)`.
    MissingProof {
        /// 24-bit request identifier.
        identifier: u32,
        /// Community this request concerns.
        community: MemberId,
        /// The member whose permission is being proven.
        member: MemberId,
        /// The meta the permission concerns.
        meta: MetaName,
        /// The action being proven.
        action: TimelineAction,
        /// The global time the permission must hold at.
        global_time: u64,
    },
    /// Reply to any of the `missing-*` requests above (except
    /// `missing-identity`): a batch of raw, still-encoded overlay packets,
    /// to be re-run through the ordinary pipeline.
    Messages {
        /// Echoes the request identifier.
        identifier: u32,
        /// Raw, still-signed overlay packets.
        packets: Vec<Vec<u8>>,
    },
    /// `dispersy-signature-request`.
    SignatureRequest {
        /// Community this request concerns.
        community: MemberId,
        /// The request body.
        request: SignatureRequest,
    },
    /// `dispersy-signature-response`.
    SignatureResponse {
        /// Community this response concerns.
        community: MemberId,
        /// The response body.
        response: SignatureResponse,
    },
}

/// Encode a [`SyncMessage`] for the wire.
pub fn encode_sync_message(msg: &SyncMessage) -> Result<Vec<u8>, CodecError> {
    encode_canonical(msg)
}

/// Decode a [`SyncMessage`] from the wire, capped at [`MAX_SYNC_MESSAGE_BYTES`].
pub fn decode_sync_message(bytes: &[u8]) -> Result<SyncMessage, CodecError> {
    decode_canonical_limited(bytes, MAX_SYNC_MESSAGE_BYTES)
}

/// Outstanding introduction requests expire after this long; expired
/// identifiers free their reservation in the candidate cache.
pub const T_INTRO: Duration = Duration::from_millis(10_500);

/// Signature request/response round trips time out after this long.
pub const T_SIG: Duration = Duration::from_secs(10);

/// Repair requests for the same `(peer, key)` are throttled to at most one
/// outstanding request per this window.
pub const T_DELAY: Duration = Duration::from_secs(10);

/// Mask a counter down to the 24-bit identifier space used for both
/// introduction and signature-request identifiers.
pub fn mask_24bit(v: u32) -> u32 {
    v & 0x00FF_FFFF
}

/// How a peer is reachable, carried in introduction request/response so the
/// receiving side can pick a sensible candidate to hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Reachability not yet determined.
    Unknown,
    /// Directly reachable (public address, or successful hole punch).
    Public,
    /// Behind a symmetric NAT; direct introductions are unreliable.
    Symmetric,
}

/// A peer's address pair plus how it is reachable, as tracked in the
/// candidate table and exchanged over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// LAN-local address.
    pub lan: SocketAddr,
    /// WAN-visible address.
    pub wan: SocketAddr,
    /// Whether this peer is reached via a tunnelled relay.
    pub tunnel: bool,
    /// Reachability classification.
    pub connection_type: ConnectionType,
}

/// The `(time_low, time_high, modulo, offset, bloom_filter)` tuple a peer
/// attaches to an introduction request to ask for a range of messages it
/// may be missing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncWindow {
    /// Lower bound (inclusive) on `global_time`.
    pub time_low: u64,
    /// Upper bound (inclusive) on `global_time`.
    pub time_high: u64,
    /// Only rows with `(global_time + offset) % modulo == 0` are offered;
    /// `0` disables the filter.
    pub modulo: u64,
    /// See `modulo`.
    pub offset: u64,
    /// Packets the requester already has; excluded from the answer modulo
    /// false positives.
    pub bloom: BloomFilter,
}

/// Request sent from P to Q to exchange candidates and, optionally, to ask
/// for a range of messages via an attached [`SyncWindow`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntroductionRequest {
    /// P's LAN address.
    pub lan_address: SocketAddr,
    /// P's WAN address.
    pub wan_address: SocketAddr,
    /// Whether P is reached via a tunnel.
    pub tunnel: bool,
    /// P's reachability classification.
    pub connection_type: ConnectionType,
    /// Monotonic 24-bit identifier, masked by [`mask_24bit`].
    pub identifier: u32,
    /// An optional request for Q's known messages in a time range.
    pub sync: Option<SyncWindow>,
}

/// Q's reply: a candidate picked from its live peer table (or none), plus
/// its own address pair so P can introduce itself back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntroductionResponse {
    /// Q's LAN address.
    pub lan_address: SocketAddr,
    /// Q's WAN address.
    pub wan_address: SocketAddr,
    /// Whether Q is reached via a tunnel.
    pub tunnel: bool,
    /// Q's reachability classification.
    pub connection_type: ConnectionType,
    /// Echoes the request's identifier.
    pub identifier: u32,
    /// The candidate Q is introducing P to, if any.
    pub introduced: Option<Candidate>,
}

/// Live-peer table a community consults when answering introduction
/// requests. Deliberately simple: callers (the networking layer) feed it
/// observed peers; it never performs I/O itself.
#[derive(Default, Debug)]
pub struct CandidateTable {
    peers: BTreeMap<SocketAddr, Candidate>,
    /// Outstanding introductions this node has sent, keyed by the 24-bit
    /// identifier, so expiry can release the reservation.
    outstanding: BTreeMap<u32, Instant>,
}

impl CandidateTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) a live peer.
    pub fn observe(&mut self, candidate: Candidate) {
        self.peers.insert(candidate.wan, candidate);
    }

    /// Drop a peer that has gone away.
    pub fn remove(&mut self, wan: SocketAddr) {
        self.peers.remove(&wan);
    }

    /// Pick a candidate to introduce `requester` to: prefer one matching
    /// `requester`'s tunnel flag when `requester` is not itself tunnelled,
    /// and never introduce a peer to itself.
    pub fn pick_for_introduction(&self, requester_wan: SocketAddr, requester_tunnelled: bool) -> Option<Candidate> {
        let others: Vec<&Candidate> = self
            .peers
            .values()
            .filter(|c| c.wan != requester_wan)
            .collect();
        if others.is_empty() {
            return None;
        }
        if !requester_tunnelled {
            if let Some(matching) = others.iter().find(|c| c.tunnel == requester_tunnelled) {
                return Some(**matching);
            }
        }
        let mut rng = rand::thread_rng();
        others.choose(&mut rng).map(|c| **c)
    }

    /// Record that an introduction with `identifier` was just sent, for
    /// [`CandidateTable::expire_outstanding`] to reap later.
    pub fn track_outstanding(&mut self, identifier: u32) {
        self.outstanding.insert(mask_24bit(identifier), Instant::now());
    }

    /// Resolve (and stop tracking) an outstanding introduction.
    pub fn resolve_outstanding(&mut self, identifier: u32) -> bool {
        self.outstanding.remove(&mask_24bit(identifier)).is_some()
    }

    /// Drop any outstanding introductions older than [`T_INTRO`].
    pub fn expire_outstanding(&mut self) {
        let now = Instant::now();
        self.outstanding.retain(|_, sent_at| now.duration_since(*sent_at) < T_INTRO);
    }
}

/// One candidate packet queued to answer a sync window, ordered so a
/// `BinaryHeap` pops highest meta priority first, and within a priority
/// preserves each meta's own direction-sorted order (the `order` field,
/// assigned in iteration order once per meta's already-directed rows).
#[derive(Clone, Debug, Eq, PartialEq)]
struct SyncCandidate {
    priority: u8,
    order: usize,
    packet: Vec<u8>,
}

impl Ord for SyncCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for SyncCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Answer a [`SyncWindow`] against a loaded community: only active,
/// community-wide messages are offered, excluding anything the bloom
/// filter already claims the requester has, ordered by meta priority
/// (high to low) and, within a priority, by each meta's own direction.
pub fn answer_sync_window(
    community: &Community,
    store: &Store,
    window: &SyncWindow,
) -> Result<Vec<Vec<u8>>, StoreError> {
    use crate::core::types::DestinationPolicy;
    use std::collections::BinaryHeap;

    let mut heap = BinaryHeap::new();
    let mut order = 0usize;
    for meta in community.metas() {
        if !matches!(meta.destination, DestinationPolicy::CommunityWide) {
            continue;
        }
        let ascending = matches!(meta.direction, crate::core::types::SyncDirection::Asc);
        let rows = store.range(
            meta.row_id,
            window.time_low,
            window.time_high,
            window.modulo,
            window.offset,
            ascending,
        )?;
        for row in rows {
            if row.undone != 0 {
                continue;
            }
            if let Some(state) = meta.distribution.prune_state(community.current_gt(), row.global_time) {
                if state != crate::core::distribution::PruneState::Active {
                    continue;
                }
            }
            if window.bloom.contains(&row.packet) {
                continue;
            }
            heap.push(SyncCandidate {
                priority: meta.priority,
                order,
                packet: row.packet,
            });
            order += 1;
        }
    }
    Ok(heap.into_sorted_vec().into_iter().rev().map(|c| c.packet).collect())
}

/// `missing-identity(mid)`: the member's public key, if known.
pub fn missing_identity(store: &Store, mid: MemberId) -> Result<Option<PublicKey>, StoreError> {
    Ok(store.get_member_by_mid(mid)?.map(|row| row.public_key))
}

/// `missing-message(member, [global_time])`: the requested messages this
/// node has stored, in the order requested.
pub fn missing_message(
    store: &Store,
    community: MemberId,
    member: MemberId,
    global_times: &[u64],
) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut out = Vec::with_capacity(global_times.len());
    for &gt in global_times {
        if let Some(row) = store.get_by_key(community, member, gt)? {
            out.push(row.packet);
        }
    }
    Ok(out)
}

/// `missing-sequence(member, meta, low, high)`: stored messages for that
/// member's sequence numbers in `[low, high]`, throttled by the caller.
pub fn missing_sequence(
    store: &Store,
    meta_row: RowId,
    member_row: RowId,
    low: u64,
    high: u64,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut rows = store.existing_for_key(meta_row, member_row)?;
    rows.retain(|r| r.sequence >= low && r.sequence <= high);
    rows.sort_by_key(|r| r.sequence);
    Ok(rows.into_iter().map(|r| r.packet).collect())
}

/// `missing-proof(member, meta, action, global_time)`: the chain of
/// authorize messages that grant `member` the right to perform `action`
/// on `meta` as of `global_time`, or an empty vector if no such chain
/// exists yet.
pub fn missing_proof(
    community: &Community,
    store: &Store,
    member: MemberId,
    meta: &MetaName,
    action: TimelineAction,
    global_time: u64,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let (allowed, chain) = community.timeline.check(member, meta, action, global_time);
    if !allowed {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(chain.len());
    for message_id in chain {
        if let Some(row) = store.get_by_id(message_id)? {
            out.push(row.packet);
        }
    }
    Ok(out)
}

/// Per-community repair throttling: at most one outstanding `missing-*`
/// request per `(kind, key)` per [`T_DELAY`] window.
#[derive(Default, Debug)]
pub struct RepairThrottle {
    last_requested: BTreeMap<Vec<u8>, Instant>,
}

impl RepairThrottle {
    /// An empty throttle for a freshly loaded community.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a repair request for `key` may be (re-)sent now; marks the
    /// key as just-requested if so.
    pub fn should_request(&mut self, key: Vec<u8>) -> bool {
        let now = Instant::now();
        match self.last_requested.get(&key) {
            Some(t) if now.duration_since(*t) < T_DELAY => false,
            _ => {
                self.last_requested.insert(key, now);
                true
            }
        }
    }
}

/// A `dispersy-signature-request` this node initiated, awaiting the
/// responder's (possibly modified) counter-signed submessage.
#[derive(Clone, Debug)]
pub struct PendingSignature {
    /// The meta the co-signed message instantiates.
    pub meta: MetaName,
    /// The partially-signed submessage bytes sent to the responder.
    pub submsg: Vec<u8>,
    /// When the request was sent, for [`T_SIG`] expiry.
    pub sent_at: Instant,
}

/// A `dispersy-signature-request`, as carried over the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// 24-bit request identifier.
    pub identifier: u32,
    /// The submessage with only the initiator's slot filled.
    pub submsg: Vec<u8>,
}

/// A `dispersy-signature-response`, as carried over the wire. `submsg` is
/// `None` when the responder refused to co-sign.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureResponse {
    /// Echoes the request's identifier.
    pub identifier: u32,
    /// The (possibly modified) co-signed submessage, or `None` on refusal.
    pub submsg: Option<Vec<u8>>,
}

/// Tracks this node's outstanding double-member signature requests.
#[derive(Default, Debug)]
pub struct SignatureTracker {
    outstanding: BTreeMap<u32, PendingSignature>,
    next_identifier: u32,
}

impl SignatureTracker {
    /// An empty tracker for a freshly loaded community.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh 24-bit identifier and record the outstanding
    /// request under it.
    pub fn begin(&mut self, meta: MetaName, submsg: Vec<u8>) -> u32 {
        let identifier = mask_24bit(self.next_identifier);
        self.next_identifier = self.next_identifier.wrapping_add(1);
        self.outstanding.insert(
            identifier,
            PendingSignature {
                meta,
                submsg,
                sent_at: Instant::now(),
            },
        );
        identifier
    }

    /// Resolve an outstanding request with the responder's answer,
    /// returning `(original_submsg, response_submsg, modified)` for the
    /// caller's response handler, per the overlay's
    /// `(request, response_or_null, modified_flag)` contract.
    pub fn resolve(&mut self, response: &SignatureResponse) -> Option<(Vec<u8>, Option<Vec<u8>>, bool)> {
        let pending = self.outstanding.remove(&mask_24bit(response.identifier))?;
        let modified = response
            .submsg
            .as_ref()
            .is_some_and(|s| *s != pending.submsg);
        Some((pending.submsg, response.submsg.clone(), modified))
    }

    /// Drop outstanding requests older than [`T_SIG`], returning the
    /// identifiers that timed out so the caller can invoke each response
    /// handler with `(request, None, false)`.
    pub fn expire(&mut self) -> Vec<u32> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= T_SIG)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.outstanding.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::community::Meta;
    use crate::core::distribution::DistributionPolicy;
    use crate::core::types::{AuthPolicy, DestinationPolicy, ResolutionPolicy, SyncDirection};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn candidate_table_never_introduces_peer_to_itself() {
        let mut table = CandidateTable::new();
        let only = Candidate {
            lan: addr(1),
            wan: addr(1),
            tunnel: false,
            connection_type: ConnectionType::Public,
        };
        table.observe(only);
        assert!(table.pick_for_introduction(addr(1), false).is_none());
    }

    #[test]
    fn candidate_table_prefers_matching_tunnel_flag() {
        let mut table = CandidateTable::new();
        table.observe(Candidate {
            lan: addr(2),
            wan: addr(2),
            tunnel: true,
            connection_type: ConnectionType::Public,
        });
        table.observe(Candidate {
            lan: addr(3),
            wan: addr(3),
            tunnel: false,
            connection_type: ConnectionType::Public,
        });
        let picked = table.pick_for_introduction(addr(1), false).unwrap();
        assert!(!picked.tunnel);
    }

    #[test]
    fn outstanding_introductions_expire() {
        let mut table = CandidateTable::new();
        table.track_outstanding(42);
        assert!(table.resolve_outstanding(42));
        assert!(!table.resolve_outstanding(42));
    }

    #[test]
    fn repair_throttle_limits_to_one_per_window() {
        let mut throttle = RepairThrottle::new();
        assert!(throttle.should_request(vec![1, 2, 3]));
        assert!(!throttle.should_request(vec![1, 2, 3]));
        assert!(throttle.should_request(vec![9]));
    }

    #[test]
    fn signature_tracker_resolves_unmodified_response() {
        let mut tracker = SignatureTracker::new();
        let id = tracker.begin("double".into(), vec![1, 2, 3]);
        let response = SignatureResponse {
            identifier: id,
            submsg: Some(vec![1, 2, 3]),
        };
        let (_orig, resp, modified) = tracker.resolve(&response).unwrap();
        assert_eq!(resp, Some(vec![1, 2, 3]));
        assert!(!modified);
    }

    #[test]
    fn signature_tracker_flags_modified_response() {
        let mut tracker = SignatureTracker::new();
        let id = tracker.begin("double".into(), vec![1, 2, 3]);
        let response = SignatureResponse {
            identifier: id,
            submsg: Some(vec![9, 9, 9]),
        };
        let (_orig, _resp, modified) = tracker.resolve(&response).unwrap();
        assert!(modified);
    }

    #[test]
    fn sync_message_roundtrips_through_canonical_encoding() {
        let msg = SyncMessage::MissingSequence {
            identifier: 7,
            community: MemberId([3u8; 20]),
            member: MemberId([4u8; 20]),
            meta: "log".into(),
            low: 2,
            high: 5,
        };
        let bytes = encode_sync_message(&msg).unwrap();
        let decoded = decode_sync_message(&bytes).unwrap();
        match decoded {
            SyncMessage::MissingSequence { identifier, low, high, .. } => {
                assert_eq!(identifier, 7);
                assert_eq!((low, high), (2, 5));
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn answer_sync_window_excludes_bloom_contained_packets() {
        let master = MemberId([1u8; 20]);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let master_row = store.put_member(PublicKey([1u8; 32]), None).unwrap();
        let community_row = store
            .put_community(master_row, master_row, "c".into(), true)
            .unwrap();
        let meta_row = store.put_meta(community_row, "m".into(), 200, 1).unwrap();

        let mut community = Community::new(master, community_row, master, "c".into(), true);
        community.add_meta(Meta {
            row_id: meta_row,
            name: "m".into(),
            auth: AuthPolicy::Single,
            resolution: ResolutionPolicy::Public,
            distribution: DistributionPolicy::FullSync,
            destination: DestinationPolicy::CommunityWide,
            priority: 200,
            direction: SyncDirection::Asc,
        });

        let p1 = store
            .put_message(master, community_row, master, master_row, 1, meta_row, vec![11], None)
            .unwrap();
        let p2 = store
            .put_message(master, community_row, master, master_row, 2, meta_row, vec![22], None)
            .unwrap();
        assert_ne!(p1, p2);

        let bloom = BloomFilter::from_items(std::iter::once(&[11u8][..]), 1);
        let window = SyncWindow {
            time_low: 0,
            time_high: 100,
            modulo: 0,
            offset: 0,
            bloom,
        };
        let packets = answer_sync_window(&community, &store, &window).unwrap();
        assert_eq!(packets, vec![vec![22]]);
    }
}
