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

//! The end-to-end path for an incoming packet, from decode through
//! persistence. Implements stages 2-9 of the pipeline; stage 1 (dispatch
//! by `cid`) lives in the networking dispatcher, which owns the
//! community-id -> `Community` routing table this module does not see.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::codec::{self, CodecError};
use crate::core::community::Community;
use crate::core::distribution::{Candidate, DistributionOutcome, PruneState};
use crate::core::store::{RowId, Store, StoreError};
use crate::core::types::{DestroyDegree, MemberId, MetaName, Payload, PublicKey};

/// Opaque handle for the peer a packet arrived from. The networking layer
/// maps this to its own `PeerId`/connection handle; the pipeline only
/// needs it to key suspension queues and direct repair requests.
pub type PeerRef = u64;

/// Reasons a packet is dropped outright (never retried).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Codec-level failure.
    Codec(CodecError),
    /// Exact `(community, member, global_time)` already stored with
    /// matching bytes.
    Duplicate,
    /// The distribution policy rejected the candidate outright (older
    /// than the accepted last-N member, duplicate global time, or pruned
    /// out of the sync window).
    DistributionConflict,
    /// The timeline could not prove permission for this message, and the
    /// creator was known to lack it (not merely "proof not yet seen").
    PermissionDenied,
}

/// Reasons a packet is suspended pending more information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelayKind {
    /// The creator's identity message has not been seen.
    MissingIdentity(MemberId),
    /// A gap exists in this member's sequence numbers for this meta.
    MissingSequence {
        /// Creator.
        member: MemberId,
        /// Meta name.
        meta: MetaName,
        /// First missing sequence number.
        low: u64,
        /// Last missing sequence number.
        high: u64,
    },
    /// The timeline cannot currently prove permission; may resolve once
    /// an authorize message arrives.
    MissingProof {
        /// Creator.
        member: MemberId,
        /// Meta name.
        meta: MetaName,
        /// Action the timeline could not prove.
        action: crate::core::types::TimelineAction,
        /// Global time the permission must hold at.
        global_time: u64,
    },
}

/// Reasons the *community* is torn down (never the whole node).
#[derive(Clone, Debug)]
pub enum FatalReason {
    /// The on-disk schema could not be opened under this build.
    Schema(String),
    /// A store I/O failure that isn't recoverable by retrying.
    Store(String),
}

/// The result of running a packet through the pipeline.
#[derive(Clone, Debug)]
pub enum StageOutcome {
    /// Stored (or already valid and duplicate-free); carries the row id.
    Accepted(RowId),
    /// Dropped outright; never retried.
    Dropped(DropReason),
    /// Suspended pending more information.
    Delayed(DelayKind),
    /// The owning community must be torn down.
    Fatal(FatalReason),
}

/// A packet parked awaiting resolution of what's missing, with enough
/// context to resume processing once it arrives.
#[derive(Clone, Debug)]
pub struct PendingContext {
    /// Peer the packet arrived from.
    pub origin: PeerRef,
    /// Raw packet bytes, to be re-run through the pipeline from stage 2.
    pub packet: Vec<u8>,
    /// When this context was queued, for `T_delay` expiry.
    pub queued_at: Instant,
}

/// Suspension queues for one community's pipeline. A packet in flight is
/// always exactly one of: processing (not represented here, it's on the
/// call stack), or parked under exactly one of these maps, keyed by what
/// it's missing.
#[derive(Default)]
pub struct Pipeline {
    pending_identity: BTreeMap<MemberId, Vec<PendingContext>>,
    pending_sequence: BTreeMap<(MemberId, MetaName), Vec<PendingContext>>,
    pending_proof: BTreeMap<(MemberId, MetaName), Vec<PendingContext>>,
    /// Last time a `missing-*` request was sent per key, to throttle to at
    /// most one outstanding request per `T_delay` window.
    last_requested: BTreeMap<Vec<u8>, Instant>,
}

/// Default repair-request throttle window.
pub const T_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

impl Pipeline {
    /// Construct an empty pipeline state for a newly loaded community.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a repair request for `key` may be (re-)sent now, given the
    /// `T_delay` throttle; marks the key as just-requested if so.
    fn should_request(&mut self, key: Vec<u8>) -> bool {
        let now = Instant::now();
        match self.last_requested.get(&key) {
            Some(t) if now.duration_since(*t) < T_DELAY => false,
            _ => {
                self.last_requested.insert(key, now);
                true
            }
        }
    }

    /// Run one packet through stages 2-9 for a community this packet's
    /// `cid` already resolved to.
    pub fn ingest(
        &mut self,
        community: &mut Community,
        store: &Store,
        origin: PeerRef,
        packet: Vec<u8>,
    ) -> StageOutcome {
        let resolve_meta = |tag: u16| -> Option<MetaName> {
            community
                .metas()
                .find(|m| meta_tag(&m.name) == tag)
                .map(|m| m.name.clone())
        };

        // Stage 2: decode & verify.
        let decoded = match codec::decode(community.cid, resolve_meta, &packet, 1 << 16) {
            Ok(d) => d,
            Err(e) => return StageOutcome::Dropped(DropReason::Codec(e)),
        };
        let creator = decoded.auth.creator();

        // Stage 3: duplicate check.
        match store.get_by_key(community.cid, creator, decoded.header.global_time) {
            Ok(Some(existing)) if existing.packet == packet => {
                return StageOutcome::Dropped(DropReason::Duplicate)
            }
            Ok(_) => {}
            Err(e) => return StageOutcome::Fatal(store_fatal(e)),
        }

        // Stage 4: identity resolution.
        let member_row = match store.get_member_by_mid(creator) {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.park_identity(creator, origin, packet.clone());
                return StageOutcome::Delayed(DelayKind::MissingIdentity(creator));
            }
            Err(e) => return StageOutcome::Fatal(store_fatal(e)),
        };

        let Some(meta) = community.meta(&decoded.header.meta) else {
            return StageOutcome::Dropped(DropReason::Codec(CodecError::UnknownMeta(meta_tag(
                &decoded.header.meta,
            ))));
        };
        let meta_row_id = meta.row_id;
        let meta_name = meta.name.clone();

        // Stage 5: sequence handling.
        if decoded.header.sequence_number.is_some() {
            let last = match store.last_sequence(meta_row_id, member_row.id) {
                Ok(v) => v,
                Err(e) => return StageOutcome::Fatal(store_fatal(e)),
            };
            let seq = decoded.header.sequence_number.unwrap();
            match last {
                None if seq > 1 => {
                    self.park_sequence(creator, meta_name.clone(), origin, packet.clone());
                    return StageOutcome::Delayed(DelayKind::MissingSequence {
                        member: creator,
                        meta: meta_name,
                        low: 1,
                        high: seq - 1,
                    });
                }
                Some(last) if seq > last + 1 => {
                    self.park_sequence(creator, meta_name.clone(), origin, packet.clone());
                    return StageOutcome::Delayed(DelayKind::MissingSequence {
                        member: creator,
                        meta: meta_name,
                        low: last + 1,
                        high: seq - 1,
                    });
                }
                // A same-or-lower sequence number usually means a
                // retransmitted duplicate, but it can also be a genuine
                // conflict (two members racing for the same slot); stage 7
                // resolves that by comparing global_time, so it must see
                // this candidate rather than have it dropped here.
                _ => {}
            }
        }

        // Stage 6: permission check. Public metas never consult the
        // timeline for their own ordinary payloads; Linear metas always
        // do; Dynamic metas consult whichever policy is currently in
        // effect. Authorize/Revoke/Undo/DestroyCommunity payloads are
        // permission-gated regardless of their own meta's resolution
        // policy, since granting, revoking, and undoing are inherently
        // privileged operations in the timeline model (the master member
        // always passes `Timeline::check`, so ordinary communities with
        // no delegation see no behavior change here).
        let effective_resolution = match meta.resolution {
            crate::core::types::ResolutionPolicy::Public => crate::core::types::ResolutionPolicy::Public,
            crate::core::types::ResolutionPolicy::Linear => crate::core::types::ResolutionPolicy::Linear,
            crate::core::types::ResolutionPolicy::Dynamic => community
                .timeline
                .get_resolution_policy(&meta_name, decoded.header.global_time)
                .map(|(p, _)| p)
                .unwrap_or(crate::core::types::ResolutionPolicy::Public),
        };
        let permission_required =
            action_for_payload(&decoded.payload, &meta_name, effective_resolution);
        let mut destroy_proof: Vec<RowId> = Vec::new();
        if let Some((perm_meta, action)) = permission_required {
            let (allowed, proof) =
                community
                    .timeline
                    .check(creator, &perm_meta, action, decoded.header.global_time);
            if !allowed {
                self.park_proof(creator, perm_meta.clone(), origin, packet.clone());
                return StageOutcome::Delayed(DelayKind::MissingProof {
                    member: creator,
                    meta: perm_meta,
                    action,
                    global_time: decoded.header.global_time,
                });
            }
            destroy_proof = proof;
        }

        // Stage 7: distribution accept/evict.
        let existing = match store.existing_for_key(meta_row_id, member_row.id) {
            Ok(v) => v,
            Err(e) => return StageOutcome::Fatal(store_fatal(e)),
        };
        let existing_view: Vec<_> = existing
            .iter()
            .map(|r| crate::core::distribution::Existing {
                id: r.id,
                global_time: r.global_time,
                sequence_number: (r.sequence > 0).then_some(r.sequence),
            })
            .collect();
        let last_seq = existing.iter().map(|r| r.sequence).filter(|s| *s > 0).max();
        let candidate = Candidate {
            member: creator,
            global_time: decoded.header.global_time,
            sequence_number: decoded.header.sequence_number,
        };
        match meta.distribution.accept(candidate, &existing_view, last_seq) {
            DistributionOutcome::Duplicate => return StageOutcome::Dropped(DropReason::Duplicate),
            DistributionOutcome::Evict(_) => {
                return StageOutcome::Dropped(DropReason::DistributionConflict)
            }
            DistributionOutcome::OutOfOrder => {
                self.park_sequence(creator, meta_name.clone(), origin, packet.clone());
                return StageOutcome::Delayed(DelayKind::MissingSequence {
                    member: creator,
                    meta: meta_name,
                    low: last_seq.unwrap_or(0) + 1,
                    high: decoded.header.sequence_number.unwrap_or(0).saturating_sub(1),
                });
            }
            DistributionOutcome::Superseded(old_id) => {
                if let Err(e) = store.delete_message(old_id) {
                    return StageOutcome::Fatal(store_fatal(e));
                }
            }
            DistributionOutcome::Accept => {}
        }

        // Stage 8: persist.
        let row_id = match store.put_message(
            community.cid,
            community.row_id,
            creator,
            member_row.id,
            decoded.header.global_time,
            meta_row_id,
            packet.clone(),
            decoded.header.sequence_number,
        ) {
            Ok(id) => id,
            Err(e) => return StageOutcome::Fatal(store_fatal(e)),
        };
        community.advance_gt(decoded.header.global_time);

        // Timeline fold for authorize/revoke/dynamic-settings payloads.
        let message = crate::core::types::Message {
            community: community.cid,
            meta: meta_name.clone(),
            global_time: decoded.header.global_time,
            sequence_number: decoded.header.sequence_number,
            auth: decoded.auth.clone(),
            payload: decoded.payload.clone(),
            packet: packet.clone(),
        };
        community.timeline.apply(&message, row_id);

        // Stage 9: undo fold.
        if let Err(e) = self.fold_undo(community, store, &message, row_id) {
            return StageOutcome::Fatal(store_fatal(e));
        }

        // Hard-kill destroy: wipe the community's log down to the destroy
        // message itself and the proof chain that authorized it (§4.7).
        if let Payload::DestroyCommunity { degree } = &message.payload {
            if matches!(degree, DestroyDegree::HardKill) {
                if let Err(e) = destroy_hard_kill(community, store, row_id, &destroy_proof) {
                    return StageOutcome::Fatal(store_fatal(e));
                }
            }
        }

        // Pruning sweep: `current_gt` just advanced for every meta in this
        // community, so any pruning-policy meta may now have rows that
        // cross `prune_threshold` and must be evicted (§4.3, §8 pruning
        // invariant).
        if let Err(e) = sweep_pruned(community, store) {
            return StageOutcome::Fatal(store_fatal(e));
        }

        StageOutcome::Accepted(row_id)
    }

    fn fold_undo(
        &mut self,
        community: &mut Community,
        store: &Store,
        message: &crate::core::types::Message,
        undo_row_id: RowId,
    ) -> Result<(), StoreError> {
        let target = match &message.payload {
            Payload::UndoOwn { target_global_time } => Some((message.member(), *target_global_time)),
            Payload::UndoOther {
                target_member,
                target_global_time,
            } => Some((*target_member, *target_global_time)),
            _ => None,
        };
        let Some((target_member, target_gt)) = target else {
            return Ok(());
        };
        let Some(target_row) = store.get_by_key(community.cid, target_member, target_gt)? else {
            return Ok(());
        };
        let newly_undone = if target_row.undone == 0 {
            store.mark_undone(target_row.id, undo_row_id)?;
            true
        } else {
            // Already undone by a previous undo message: the
            // lexicographically smaller packet wins, and the loser is
            // itself marked undone by the winner.
            let Some(incumbent) = store.get_by_id(target_row.undone)? else {
                store.mark_undone(target_row.id, undo_row_id)?;
                return Ok(());
            };
            if message.packet < incumbent.packet {
                store.mark_undone(target_row.id, undo_row_id)?;
                store.mark_undone(incumbent.id, undo_row_id)?;
                true
            } else {
                store.mark_undone(undo_row_id, target_row.undone)?;
                false
            }
        };
        // If the message just undone itself granted, revoked, or changed
        // policy, pull it back out of the timeline so future permission
        // checks stop honoring it. This does not retroactively re-run
        // acceptance on messages already stored under the old timeline
        // state; see DESIGN.md for that simplification.
        if newly_undone {
            let resolve_meta = |tag: u16| -> Option<MetaName> {
                community
                    .metas()
                    .find(|m| meta_tag(&m.name) == tag)
                    .map(|m| m.name.clone())
            };
            if let Ok(decoded) = codec::decode(community.cid, resolve_meta, &target_row.packet, 1 << 16) {
                let is_timeline_op = matches!(
                    decoded.payload,
                    Payload::Authorize { .. } | Payload::Revoke { .. } | Payload::DynamicSettings { .. }
                );
                if is_timeline_op {
                    let target_message = crate::core::types::Message {
                        community: community.cid,
                        meta: decoded.header.meta,
                        global_time: decoded.header.global_time,
                        sequence_number: decoded.header.sequence_number,
                        auth: decoded.auth,
                        payload: decoded.payload,
                        packet: target_row.packet.clone(),
                    };
                    community.timeline.unapply(&target_message, target_row.id);
                }
            }
        }
        Ok(())
    }

    fn park_identity(&mut self, mid: MemberId, origin: PeerRef, packet: Vec<u8>) {
        self.pending_identity.entry(mid).or_default().push(PendingContext {
            origin,
            packet,
            queued_at: Instant::now(),
        });
    }

    fn park_sequence(&mut self, member: MemberId, meta: MetaName, origin: PeerRef, packet: Vec<u8>) {
        self.pending_sequence
            .entry((member, meta))
            .or_default()
            .push(PendingContext {
                origin,
                packet,
                queued_at: Instant::now(),
            });
    }

    fn park_proof(&mut self, member: MemberId, meta: MetaName, origin: PeerRef, packet: Vec<u8>) {
        self.pending_proof
            .entry((member, meta))
            .or_default()
            .push(PendingContext {
                origin,
                packet,
                queued_at: Instant::now(),
            });
    }

    /// Drain and return packets parked waiting on `mid`'s identity, for
    /// the caller to re-run through [`Pipeline::ingest`].
    pub fn resolve_identity(&mut self, mid: MemberId) -> Vec<PendingContext> {
        self.pending_identity.remove(&mid).unwrap_or_default()
    }

    /// Drain and return packets parked waiting on a sequence gap for
    /// `(member, meta)`.
    pub fn resolve_sequence(&mut self, member: MemberId, meta: &MetaName) -> Vec<PendingContext> {
        self.pending_sequence
            .remove(&(member, meta.clone()))
            .unwrap_or_default()
    }

    /// Drain and return packets parked waiting on a permission proof for
    /// `(member, meta)`.
    pub fn resolve_proof(&mut self, member: MemberId, meta: &MetaName) -> Vec<PendingContext> {
        self.pending_proof
            .remove(&(member, meta.clone()))
            .unwrap_or_default()
    }

    /// Whether a `missing-identity(mid)` request may be sent now.
    pub fn should_request_identity(&mut self, mid: MemberId) -> bool {
        let mut key = vec![0u8];
        key.extend_from_slice(&mid.0);
        self.should_request(key)
    }
}

/// A stable per-community meta tag, derived deterministically from the
/// meta's name so both peers agree on the wire encoding without a
/// negotiation round trip.
pub fn meta_tag(name: &MetaName) -> u16 {
    let digest = ring::digest::digest(&ring::digest::SHA256, name.0.as_bytes());
    let b = digest.as_ref();
    u16::from_be_bytes([b[0], b[1]])
}

/// The `(meta, action)` the timeline must clear before `payload` may be
/// accepted, or `None` if no permission check applies.
///
/// Authorize/Revoke/DynamicSettings always gate on the granting/revoking
/// capability itself (`Authorize`/`Revoke`), independent of their own
/// meta's resolution policy — granting and revoking are inherently
/// privileged regardless of how the *meta being granted* resolves.
/// Undo payloads gate on `Undo` for the undo message's own meta, for both
/// undo-own and undo-other (see DESIGN.md for this Open-Question
/// resolution). Ordinary `Data` payloads only consult the timeline under
/// a `Linear` (or dynamically-Linear) resolution policy; `Public` metas
/// never gate on permission.
fn action_for_payload(
    payload: &Payload,
    meta: &MetaName,
    effective_resolution: crate::core::types::ResolutionPolicy,
) -> Option<(MetaName, crate::core::types::TimelineAction)> {
    use crate::core::types::{ResolutionPolicy, TimelineAction};
    match payload {
        Payload::Authorize { meta: target_meta, .. } => {
            Some((target_meta.clone(), TimelineAction::Authorize))
        }
        Payload::Revoke { meta: target_meta, .. } => {
            Some((target_meta.clone(), TimelineAction::Revoke))
        }
        Payload::DynamicSettings { meta: target_meta, .. } => {
            Some((target_meta.clone(), TimelineAction::Authorize))
        }
        Payload::UndoOwn { .. } | Payload::UndoOther { .. } | Payload::DestroyCommunity { .. } => {
            Some((meta.clone(), TimelineAction::Undo))
        }
        Payload::Data(_) => match effective_resolution {
            ResolutionPolicy::Public => None,
            ResolutionPolicy::Linear | ResolutionPolicy::Dynamic => {
                Some((meta.clone(), TimelineAction::Permit))
            }
        },
    }
}

/// Remove every row made `Pruned` by the community's pruning-policy metas,
/// now that `current_gt` has advanced. Non-pruning metas are untouched.
fn sweep_pruned(community: &Community, store: &Store) -> Result<(), StoreError> {
    let current_gt = community.current_gt();
    let pruning_metas: Vec<(RowId, crate::core::distribution::DistributionPolicy)> = community
        .metas()
        .filter_map(|m| {
            matches!(m.distribution, crate::core::distribution::DistributionPolicy::FullSyncWithPruning { .. })
                .then(|| (m.row_id, m.distribution.clone()))
        })
        .collect();
    for (meta_row_id, policy) in pruning_metas {
        let rows = store.range(meta_row_id, 0, u64::MAX, 0, 0, true)?;
        for row in rows {
            if policy.prune_state(current_gt, row.global_time) == Some(PruneState::Pruned) {
                store.delete_message(row.id)?;
            }
        }
    }
    Ok(())
}

/// Hard-kill destroy-community (§4.7): delete every row in the community's
/// log except `keep_id` (the destroy message itself) and `proof_chain` (the
/// authorize messages that granted permission to destroy it).
fn destroy_hard_kill(
    community: &Community,
    store: &Store,
    keep_id: RowId,
    proof_chain: &[RowId],
) -> Result<(), StoreError> {
    let all = store.all_rows_for_community(community.cid)?;
    for id in all {
        if id == keep_id || proof_chain.contains(&id) {
            continue;
        }
        store.delete_message(id)?;
    }
    Ok(())
}

fn store_fatal(e: StoreError) -> FatalReason {
    match e {
        StoreError::SchemaTooNew { .. } | StoreError::SchemaTooOld { .. } => {
            FatalReason::Schema(e.to_string())
        }
        other => FatalReason::Store(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::encode;
    use crate::core::types::{AuthBlock, Signature};
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn gen_key() -> (Ed25519KeyPair, PublicKey) {
        let rng = ring::rand::SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let kp = Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap();
        let mut pk = [0u8; 32];
        pk.copy_from_slice(kp.public_key().as_ref());
        (kp, PublicKey(pk))
    }

    #[test]
    fn accepts_well_formed_public_message() {
        let (master_kp, master_pk) = gen_key();
        let master = MemberId::from_public_key(&master_pk.0);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let master_row = store.put_member(master_pk, None).unwrap();
        let community_row = store
            .put_community(master_row, master_row, "test".into(), true)
            .unwrap();
        let mut community = Community::new(master, community_row, master, "test".into(), true);
        let meta_name: MetaName = "greeting".into();
        let meta_row = store.put_meta(community_row, meta_name.clone(), 128, 1).unwrap();
        community.add_meta(crate::core::community::Meta::full_sync(meta_row, meta_name.clone()));

        let payload = Payload::Data(vec![1, 2, 3]);
        let tag = meta_tag(&meta_name);
        let message = crate::core::codec::signing_message(master, tag, 1, None, false, &payload).unwrap();
        let sig = Signature(master_kp.sign(&message).as_ref().try_into().unwrap());
        let auth = AuthBlock::Single {
            member: master_pk,
            signature: sig,
        };
        let packet = encode(master, tag, 1, None, &auth, &payload).unwrap();

        let mut pipeline = Pipeline::new();
        let outcome = pipeline.ingest(&mut community, &store, 0, packet);
        assert!(matches!(outcome, StageOutcome::Accepted(_)));
    }

    fn signed_packet(
        kp: &Ed25519KeyPair,
        pk: PublicKey,
        community: MemberId,
        meta_name: &MetaName,
        global_time: u64,
        payload: Payload,
    ) -> Vec<u8> {
        let tag = meta_tag(meta_name);
        let message =
            crate::core::codec::signing_message(community, tag, global_time, None, false, &payload)
                .unwrap();
        let sig = Signature(kp.sign(&message).as_ref().try_into().unwrap());
        let auth = AuthBlock::Single {
            member: pk,
            signature: sig,
        };
        encode(community, tag, global_time, None, &auth, &payload).unwrap()
    }

    #[test]
    fn pruning_sweep_evicts_aged_out_messages() {
        let (master_kp, master_pk) = gen_key();
        let master = MemberId::from_public_key(&master_pk.0);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let master_row = store.put_member(master_pk, None).unwrap();
        let community_row = store
            .put_community(master_row, master_row, "test".into(), true)
            .unwrap();
        let mut community = Community::new(master, community_row, master, "test".into(), true);

        let pruning_name: MetaName = "pruned".into();
        let pruning_row = store.put_meta(community_row, pruning_name.clone(), 128, 1).unwrap();
        community.add_meta(crate::core::community::Meta {
            row_id: pruning_row,
            name: pruning_name.clone(),
            auth: crate::core::types::AuthPolicy::Single,
            resolution: crate::core::types::ResolutionPolicy::Public,
            distribution: crate::core::distribution::DistributionPolicy::FullSyncWithPruning {
                inactive_threshold: 10,
                prune_threshold: 20,
            },
            destination: crate::core::types::DestinationPolicy::CommunityWide,
            priority: 128,
            direction: crate::core::types::SyncDirection::Asc,
        });

        let plain_name: MetaName = "chat".into();
        let plain_row = store.put_meta(community_row, plain_name.clone(), 128, 1).unwrap();
        community.add_meta(crate::core::community::Meta::full_sync(plain_row, plain_name.clone()));

        let mut pipeline = Pipeline::new();
        for gt in 11u64..=30 {
            let packet = signed_packet(
                &master_kp,
                master_pk,
                master,
                &pruning_name,
                gt,
                Payload::Data(vec![gt as u8]),
            );
            let outcome = pipeline.ingest(&mut community, &store, 0, packet);
            assert!(matches!(outcome, StageOutcome::Accepted(_)), "gt={gt}");
        }
        for gt in 31u64..=35 {
            let packet = signed_packet(
                &master_kp,
                master_pk,
                master,
                &plain_name,
                gt,
                Payload::Data(vec![gt as u8]),
            );
            let outcome = pipeline.ingest(&mut community, &store, 0, packet);
            assert!(matches!(outcome, StageOutcome::Accepted(_)), "gt={gt}");
        }

        let remaining = store.range(pruning_row, 0, u64::MAX, 0, 0, true).unwrap();
        let gts: Vec<u64> = remaining.iter().map(|r| r.global_time).collect();
        assert_eq!(gts, (16u64..=30).collect::<Vec<_>>());
    }

    #[test]
    fn hard_kill_destroy_wipes_log_except_destroy_message() {
        let (master_kp, master_pk) = gen_key();
        let master = MemberId::from_public_key(&master_pk.0);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let master_row = store.put_member(master_pk, None).unwrap();
        let community_row = store
            .put_community(master_row, master_row, "test".into(), true)
            .unwrap();
        let mut community = Community::new(master, community_row, master, "test".into(), true);

        let chat_name: MetaName = "chat".into();
        let chat_row = store.put_meta(community_row, chat_name.clone(), 128, 1).unwrap();
        community.add_meta(crate::core::community::Meta::full_sync(chat_row, chat_name.clone()));

        let destroy_name: MetaName = "destroy-community".into();
        let destroy_row = store.put_meta(community_row, destroy_name.clone(), 128, 1).unwrap();
        community.add_meta(crate::core::community::Meta::full_sync(destroy_row, destroy_name.clone()));

        let mut pipeline = Pipeline::new();
        for gt in 1u64..=5 {
            let packet = signed_packet(
                &master_kp,
                master_pk,
                master,
                &chat_name,
                gt,
                Payload::Data(vec![gt as u8]),
            );
            let outcome = pipeline.ingest(&mut community, &store, 0, packet);
            assert!(matches!(outcome, StageOutcome::Accepted(_)));
        }

        let destroy_packet = signed_packet(
            &master_kp,
            master_pk,
            master,
            &destroy_name,
            6,
            Payload::DestroyCommunity {
                degree: crate::core::types::DestroyDegree::HardKill,
            },
        );
        let outcome = pipeline.ingest(&mut community, &store, 0, destroy_packet);
        let destroy_row_id = match outcome {
            StageOutcome::Accepted(id) => id,
            other => panic!("expected destroy message to be accepted, got {other:?}"),
        };

        let remaining = store.all_rows_for_community(master).unwrap();
        assert_eq!(remaining, vec![destroy_row_id]);
    }
}
