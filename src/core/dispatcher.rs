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

//! Stage 1 of the pipeline: demultiplex inbound frames by their leading
//! 20-byte `cid`, auto-loading a known-but-unloaded community from the
//! store, rate-limiting peers that keep sending frames for unknown
//! communities, and parking frames for a community that is still being
//! opened.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::core::community::{Community, MetaTemplate};
use crate::core::pipeline::PeerRef;
use crate::core::store::Store;
use crate::core::types::CommunityId;
use crate::networking::peer_score::{Decision, PeerScore};

const CID_LEN: usize = 20;

/// A frame parked because its `cid` resolved to a community that is known
/// (found in the store) but not yet loaded into memory.
#[derive(Clone, Debug)]
struct ParkedFrame {
    origin: PeerRef,
    packet: Vec<u8>,
    queued_at: Instant,
}

/// Outcome of routing one inbound frame to a community.
pub enum DispatchOutcome {
    /// The frame's `cid` resolved to a loaded community; hand `packet` to
    /// [`crate::core::pipeline::Pipeline::ingest`] for that community.
    Route {
        /// Community the frame belongs to.
        cid: CommunityId,
        /// The codec-encoded packet, unchanged from the wire frame: its own
        /// `cid` prefix (read again by [`crate::core::codec::decode`]) is
        /// left intact, since routing only peeks at it.
        packet: Vec<u8>,
    },
    /// The community exists in the store but was just loaded into
    /// `loaded`; the caller should register the actor for `cid` before the
    /// next frame for it arrives.
    Loaded {
        /// Newly loaded community.
        community: Box<Community>,
        /// The frame that triggered the load, to route immediately.
        packet: Vec<u8>,
    },
    /// The frame was too short to carry a `cid` prefix; dropped outright.
    Malformed,
    /// `cid` is unknown to this node and the peer has been rate-limited
    /// for repeated unknown-`cid` traffic; dropped outright.
    RateLimited,
    /// `cid` is unknown to this node, but the peer isn't (yet)
    /// rate-limited; the frame is dropped but nothing else happens.
    UnknownCommunity,
}

/// Demultiplexes frames across all communities this node has loaded or
/// might auto-load.
pub struct Dispatcher {
    /// Community classifications this node knows how to hydrate, keyed by
    /// the `classification` string stored on the community row. A node
    /// only auto-loads communities whose classification it recognizes.
    templates: BTreeMap<String, Vec<MetaTemplate>>,
    /// Frames waiting on a community that resolved in the store but whose
    /// load (sled tree opens, meta hydration) hasn't completed yet.
    pending: BTreeMap<CommunityId, Vec<ParkedFrame>>,
    /// Tracks "bad frame" behavior per peer, reusing the same decay/ban
    /// model as consensus-message scoring.
    scores: PeerScore,
}

impl Dispatcher {
    /// Construct a dispatcher that only auto-loads communities whose
    /// classification is a key of `templates`.
    pub fn new(templates: BTreeMap<String, Vec<MetaTemplate>>) -> Self {
        Dispatcher {
            templates,
            pending: BTreeMap::new(),
            scores: PeerScore::new(Default::default()),
        }
    }

    /// Route one inbound frame (cid prefix already known to be present).
    /// `is_loaded` reports whether the caller already has an actor running
    /// for `cid`; the dispatcher only touches the store on a miss.
    pub fn dispatch(
        &mut self,
        store: &Store,
        origin: PeerRef,
        peer_key: &[u8],
        frame: Vec<u8>,
        is_loaded: impl FnOnce(CommunityId) -> bool,
    ) -> DispatchOutcome {
        if frame.len() < CID_LEN {
            return DispatchOutcome::Malformed;
        }
        let mut cid_bytes = [0u8; CID_LEN];
        cid_bytes.copy_from_slice(&frame[..CID_LEN]);
        let cid = CommunityId(cid_bytes);
        // `codec::decode` re-reads `cid` from the front of `packet` itself
        // (it's how the signature binds the packet to its community), so
        // routing only peeks at the prefix rather than consuming it.
        let packet = frame;

        if is_loaded(cid) {
            return DispatchOutcome::Route { cid, packet };
        }

        let row = match store.get_community_by_cid(cid) {
            Ok(v) => v,
            Err(_) => None,
        };
        let Some(row) = row else {
            let now = Instant::now();
            let decision = self.scores.observe_bad(peer_key.to_vec(), now, 1);
            return match decision {
                Decision::Ban => DispatchOutcome::RateLimited,
                _ => DispatchOutcome::UnknownCommunity,
            };
        };

        let Some(templates) = self.templates.get(&row.classification) else {
            // Known row, but this node doesn't recognize the
            // classification well enough to hydrate its meta set; treat
            // it the same as unknown rather than load a community with no
            // metas.
            let now = Instant::now();
            let decision = self.scores.observe_bad(peer_key.to_vec(), now, 1);
            return match decision {
                Decision::Ban => DispatchOutcome::RateLimited,
                _ => DispatchOutcome::UnknownCommunity,
            };
        };

        match Community::load_by_cid(store, cid, templates) {
            Ok(Some(community)) => {
                self.park(cid, origin, packet.clone());
                DispatchOutcome::Loaded {
                    community: Box::new(community),
                    packet,
                }
            }
            _ => DispatchOutcome::UnknownCommunity,
        }
    }

    fn park(&mut self, cid: CommunityId, origin: PeerRef, packet: Vec<u8>) {
        self.pending.entry(cid).or_default().push(ParkedFrame {
            origin,
            packet,
            queued_at: Instant::now(),
        });
    }

    /// Drain every frame parked for `cid` once its community has finished
    /// loading, oldest first.
    pub fn drain_pending(&mut self, cid: CommunityId) -> Vec<(PeerRef, Vec<u8>)> {
        self.pending
            .remove(&cid)
            .unwrap_or_default()
            .into_iter()
            .map(|f| (f.origin, f.packet))
            .collect()
    }

    /// Count of frames still parked across all communities, for metrics.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Drop parked frames older than `max_age`, returning how many were
    /// dropped.
    pub fn expire_pending(&mut self, max_age: std::time::Duration) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        for frames in self.pending.values_mut() {
            let before = frames.len();
            frames.retain(|f| now.duration_since(f.queued_at) < max_age);
            dropped += before - frames.len();
        }
        self.pending.retain(|_, frames| !frames.is_empty());
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PublicKey;

    #[test]
    fn malformed_frame_shorter_than_cid_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut dispatcher = Dispatcher::new(BTreeMap::new());
        let outcome = dispatcher.dispatch(&store, 0, b"peer", vec![1, 2, 3], |_| false);
        assert!(matches!(outcome, DispatchOutcome::Malformed));
    }

    #[test]
    fn unknown_cid_is_dropped_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut dispatcher = Dispatcher::new(BTreeMap::new());
        let frame = vec![7u8; 25];
        let outcome = dispatcher.dispatch(&store, 0, b"peer", frame, |_| false);
        assert!(matches!(outcome, DispatchOutcome::UnknownCommunity));
    }

    #[test]
    fn known_community_with_recognized_classification_auto_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let pk = PublicKey([5u8; 32]);
        let templates = vec![MetaTemplate::full_sync("greeting")];
        let created =
            Community::load_or_create(&store, pk, "chat".into(), &templates, true).unwrap();

        let mut registry = BTreeMap::new();
        registry.insert("chat".to_string(), templates);
        let mut dispatcher = Dispatcher::new(registry);

        let mut frame = created.cid.0.to_vec();
        frame.extend_from_slice(&[1, 2, 3]);
        let outcome = dispatcher.dispatch(&store, 0, b"peer", frame.clone(), |_| false);
        match outcome {
            DispatchOutcome::Loaded { community, packet } => {
                assert_eq!(community.cid, created.cid);
                assert_eq!(packet, frame);
            }
            _ => panic!("expected Loaded outcome"),
        }
        assert_eq!(dispatcher.drain_pending(created.cid), vec![(0, frame)]);
    }

    #[test]
    fn repeated_unknown_cid_frames_eventually_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut dispatcher = Dispatcher::new(BTreeMap::new());
        let frame = vec![3u8; 25];
        let mut last = DispatchOutcome::Malformed;
        for _ in 0..500 {
            last = dispatcher.dispatch(&store, 0, b"bad-peer", frame.clone(), |_| false);
            if matches!(last, DispatchOutcome::RateLimited) {
                break;
            }
        }
        assert!(matches!(last, DispatchOutcome::RateLimited));
    }
}
