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

//! Distribution policies: accept/reject/evict decisions for incoming
//! messages, per meta.

use crate::core::types::MemberId;

/// Row identifier of a stored message, as assigned by the store.
pub type MessageId = u64;

/// A candidate message under evaluation by a distribution policy.
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    /// Creator (or, for double-member last-N, one element of the pair;
    /// callers pass the canonical sorted-pair key via [`last_n_key`]).
    pub member: MemberId,
    /// Global time of the candidate.
    pub global_time: u64,
    /// Sequence number, for sequence-numbered metas.
    pub sequence_number: Option<u64>,
}

/// An existing stored message, as seen by the policy.
#[derive(Clone, Copy, Debug)]
pub struct Existing {
    /// Row id.
    pub id: MessageId,
    /// Global time.
    pub global_time: u64,
    /// Sequence number.
    pub sequence_number: Option<u64>,
}

/// Decision returned by [`DistributionPolicy::accept`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionOutcome {
    /// Accept and store the candidate.
    Accept,
    /// Identical message already stored; drop silently.
    Duplicate,
    /// Candidate supersedes an existing row, which should be evicted.
    Superseded(MessageId),
    /// Candidate itself should be evicted (an existing row wins).
    Evict(MessageId),
    /// Sequence gap: candidate must be queued pending repair.
    OutOfOrder,
}

/// The four distribution policies named by the overlay.
#[derive(Clone, Debug)]
pub enum DistributionPolicy {
    /// Keep all messages; no eviction.
    FullSync,
    /// Full sync, plus a strict per-(member, meta) sequence successor
    /// property.
    FullSyncWithSequence,
    /// Keep at most `n` messages per key (creating member, or sorted pair
    /// for double-member auth).
    LastN {
        /// Maximum retained messages per key.
        n: usize,
    },
    /// Sliding window over global time: active / inactive / pruned.
    FullSyncWithPruning {
        /// Messages with `current_gt - global_time < inactive_threshold`
        /// are active.
        inactive_threshold: u64,
        /// Messages with `current_gt - global_time >= prune_threshold`
        /// are removed from the store.
        prune_threshold: u64,
    },
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        DistributionPolicy::FullSync
    }
}

impl DistributionPolicy {
    /// Default pruning thresholds, per the overlay's defaults.
    pub fn default_pruning() -> Self {
        DistributionPolicy::FullSyncWithPruning {
            inactive_threshold: 10,
            prune_threshold: 20,
        }
    }

    /// Decide the outcome for `candidate` given the messages already
    /// stored under its key (`existing`, most-recent-first is not
    /// required; callers pass whatever is relevant to the policy).
    pub fn accept(
        &self,
        candidate: Candidate,
        existing: &[Existing],
        last_known_sequence: Option<u64>,
    ) -> DistributionOutcome {
        match self {
            DistributionPolicy::FullSync => {
                if existing
                    .iter()
                    .any(|e| e.global_time == candidate.global_time)
                {
                    DistributionOutcome::Duplicate
                } else {
                    DistributionOutcome::Accept
                }
            }
            DistributionPolicy::FullSyncWithSequence => {
                self.accept_sequenced(candidate, existing, last_known_sequence)
            }
            DistributionPolicy::LastN { n } => self.accept_last_n(candidate, existing, *n),
            DistributionPolicy::FullSyncWithPruning { .. } => {
                if existing
                    .iter()
                    .any(|e| e.global_time == candidate.global_time)
                {
                    DistributionOutcome::Duplicate
                } else {
                    DistributionOutcome::Accept
                }
            }
        }
    }

    fn accept_sequenced(
        &self,
        candidate: Candidate,
        existing: &[Existing],
        last_known_sequence: Option<u64>,
    ) -> DistributionOutcome {
        let Some(seq) = candidate.sequence_number else {
            return DistributionOutcome::Accept;
        };
        match last_known_sequence {
            None if seq == 1 => DistributionOutcome::Accept,
            None => DistributionOutcome::OutOfOrder,
            Some(last) if seq <= last => {
                // A same-or-lower sequence number normally means a
                // retransmitted duplicate, but two members racing for the
                // same sequence slot can also land here with different
                // global_times. Keep whichever has the lower global_time:
                // if the stored row for this sequence loses that
                // comparison, supersede it instead of silently dropping
                // the candidate as a duplicate.
                match existing.iter().find(|e| e.sequence_number == Some(seq)) {
                    Some(e) if candidate.global_time < e.global_time => {
                        DistributionOutcome::Superseded(e.id)
                    }
                    _ => DistributionOutcome::Duplicate,
                }
            }
            Some(last) if seq == last + 1 => DistributionOutcome::Accept,
            Some(_) => DistributionOutcome::OutOfOrder,
        }
    }

    fn accept_last_n(
        &self,
        candidate: Candidate,
        existing: &[Existing],
        n: usize,
    ) -> DistributionOutcome {
        if existing
            .iter()
            .any(|e| e.global_time == candidate.global_time)
        {
            return DistributionOutcome::Duplicate;
        }
        if existing.len() < n {
            return DistributionOutcome::Accept;
        }
        // At capacity: evict the oldest if the candidate is newer, else
        // the candidate itself is evicted (never stored).
        let oldest = existing.iter().min_by_key(|e| e.global_time).expect("len>=1");
        if candidate.global_time > oldest.global_time {
            DistributionOutcome::Superseded(oldest.id)
        } else {
            // The candidate loses to `oldest`; its id rides along so the
            // caller can reply with a proof-of-supersession to the sender.
            DistributionOutcome::Evict(oldest.id)
        }
    }

    /// Classification of a message's age relative to `current_gt`, for the
    /// pruning policy. Returns `None` for non-pruning policies.
    pub fn prune_state(&self, current_gt: u64, global_time: u64) -> Option<PruneState> {
        match self {
            DistributionPolicy::FullSyncWithPruning {
                inactive_threshold,
                prune_threshold,
            } => {
                let age = current_gt.saturating_sub(global_time);
                Some(if age < *inactive_threshold {
                    PruneState::Active
                } else if age < *prune_threshold {
                    PruneState::Inactive
                } else {
                    PruneState::Pruned
                })
            }
            _ => None,
        }
    }
}

/// Age classification under a pruning policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruneState {
    /// `current_gt - global_time < inactive_threshold`.
    Active,
    /// `inactive_threshold <= current_gt - global_time < prune_threshold`.
    Inactive,
    /// `current_gt - global_time >= prune_threshold`: remove from store.
    Pruned,
}

/// The last-N key for double-member authentication with `n == 1`: the
/// unordered pair of signing members, canonicalised by sorting.
pub fn last_n_pair_key(a: MemberId, b: MemberId) -> (MemberId, MemberId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(seed: u8) -> MemberId {
        MemberId([seed; 20])
    }

    #[test]
    fn full_sync_duplicate_detection() {
        let policy = DistributionPolicy::FullSync;
        let existing = [Existing {
            id: 1,
            global_time: 5,
            sequence_number: None,
        }];
        let candidate = Candidate {
            member: m(1),
            global_time: 5,
            sequence_number: None,
        };
        assert_eq!(
            policy.accept(candidate, &existing, None),
            DistributionOutcome::Duplicate
        );
    }

    #[test]
    fn sequence_gap_is_out_of_order() {
        let policy = DistributionPolicy::FullSyncWithSequence;
        let candidate = Candidate {
            member: m(1),
            global_time: 10,
            sequence_number: Some(5),
        };
        assert_eq!(
            policy.accept(candidate, &[], Some(2)),
            DistributionOutcome::OutOfOrder
        );
    }

    #[test]
    fn sequence_successor_accepted() {
        let policy = DistributionPolicy::FullSyncWithSequence;
        let candidate = Candidate {
            member: m(1),
            global_time: 10,
            sequence_number: Some(3),
        };
        assert_eq!(
            policy.accept(candidate, &[], Some(2)),
            DistributionOutcome::Accept
        );
    }

    #[test]
    fn sequence_duplicate_with_no_matching_row_is_dropped() {
        let policy = DistributionPolicy::FullSyncWithSequence;
        let candidate = Candidate {
            member: m(1),
            global_time: 10,
            sequence_number: Some(2),
        };
        assert_eq!(
            policy.accept(candidate, &[], Some(2)),
            DistributionOutcome::Duplicate
        );
    }

    #[test]
    fn sequence_same_slot_lower_global_time_supersedes_stored_row() {
        let policy = DistributionPolicy::FullSyncWithSequence;
        let existing = [Existing {
            id: 42,
            global_time: 20,
            sequence_number: Some(2),
        }];
        let candidate = Candidate {
            member: m(1),
            global_time: 5,
            sequence_number: Some(2),
        };
        assert_eq!(
            policy.accept(candidate, &existing, Some(2)),
            DistributionOutcome::Superseded(42)
        );
    }

    #[test]
    fn sequence_same_slot_higher_global_time_is_duplicate() {
        let policy = DistributionPolicy::FullSyncWithSequence;
        let existing = [Existing {
            id: 42,
            global_time: 5,
            sequence_number: Some(2),
        }];
        let candidate = Candidate {
            member: m(1),
            global_time: 20,
            sequence_number: Some(2),
        };
        assert_eq!(
            policy.accept(candidate, &existing, Some(2)),
            DistributionOutcome::Duplicate
        );
    }

    #[test]
    fn last_n_evicts_oldest_when_newer_arrives() {
        let policy = DistributionPolicy::LastN { n: 1 };
        let existing = [Existing {
            id: 7,
            global_time: 3,
            sequence_number: None,
        }];
        let candidate = Candidate {
            member: m(1),
            global_time: 9,
            sequence_number: None,
        };
        assert_eq!(
            policy.accept(candidate, &existing, None),
            DistributionOutcome::Superseded(7)
        );
    }

    #[test]
    fn last_n_rejects_older_candidate() {
        let policy = DistributionPolicy::LastN { n: 1 };
        let existing = [Existing {
            id: 7,
            global_time: 9,
            sequence_number: None,
        }];
        let candidate = Candidate {
            member: m(1),
            global_time: 3,
            sequence_number: None,
        };
        assert_eq!(
            policy.accept(candidate, &existing, None),
            DistributionOutcome::Evict(7)
        );
    }

    #[test]
    fn pruning_classifies_by_age() {
        let policy = DistributionPolicy::default_pruning();
        assert_eq!(policy.prune_state(100, 95), Some(PruneState::Active));
        assert_eq!(policy.prune_state(100, 85), Some(PruneState::Inactive));
        assert_eq!(policy.prune_state(100, 70), Some(PruneState::Pruned));
    }
}
