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

//! The permission graph for a single community: folds authorize / revoke /
//! dynamic-settings messages into a function from `(member, meta, action,
//! global_time)` to a permission decision plus its proof chain.

use std::collections::BTreeMap;

use crate::core::types::{MemberId, MetaName, Message, Payload, ResolutionPolicy, TimelineAction};

/// A single grant or revoke entry, ordered by `(global_time, grantor.mid)`
/// as the deterministic tie-break when two entries share a global time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimelineEntry {
    global_time: u64,
    grantor: MemberId,
    granted: bool,
    /// Row identifier of the message that produced this entry, used to
    /// build proof chains without re-encoding.
    message_id: u64,
}

/// Identifier of a stored message row, as assigned by the store.
pub type MessageId = u64;

/// The full timeline state for one community.
#[derive(Default, Debug)]
pub struct Timeline {
    /// Grant/revoke history keyed by the permission triplet.
    grants: BTreeMap<(MemberId, MetaName, TimelineAction), Vec<TimelineEntry>>,
    /// Dynamic-settings history keyed by meta name.
    dynamic: BTreeMap<MetaName, Vec<(u64, MemberId, ResolutionPolicy, MessageId)>>,
    /// The community's master member: implicitly holds every permission.
    master: MemberId,
}

impl Timeline {
    /// Create a timeline rooted at `master`, the community's master member.
    pub fn new(master: MemberId) -> Self {
        Self {
            grants: BTreeMap::new(),
            dynamic: BTreeMap::new(),
            master,
        }
    }

    /// Whether `member` may perform `action` on `meta` at `global_time`,
    /// and the proof chain (message ids) from the master member down to
    /// `member` if so.
    pub fn check(
        &self,
        member: MemberId,
        meta: &MetaName,
        action: TimelineAction,
        global_time: u64,
    ) -> (bool, Vec<MessageId>) {
        if member == self.master {
            return (true, Vec::new());
        }
        let key = (member, meta.clone(), action);
        let Some(entries) = self.grants.get(&key) else {
            return (false, Vec::new());
        };
        // A grant/revoke at `global_time` takes effect from `global_time+1`
        // onward, per the overlay's ordering rule; strictly-less excludes
        // a grant dated exactly at the time being checked.
        let Some(latest) = entries
            .iter()
            .filter(|e| e.global_time < global_time)
            .max_by_key(|e| (e.global_time, e.grantor))
        else {
            return (false, Vec::new());
        };
        if !latest.granted {
            return (false, Vec::new());
        }
        // Walk the grantor chain back to the master member.
        let mut chain = vec![latest.message_id];
        let mut current = latest.grantor;
        let mut guard = 0;
        while current != self.master && guard < 64 {
            guard += 1;
            let ancestor_key = (current, meta.clone(), TimelineAction::Authorize);
            let Some(ancestor_entries) = self.grants.get(&ancestor_key) else {
                break;
            };
            let Some(ancestor) = ancestor_entries
                .iter()
                .filter(|e| e.global_time < global_time && e.granted)
                .max_by_key(|e| (e.global_time, e.grantor))
            else {
                break;
            };
            chain.push(ancestor.message_id);
            current = ancestor.grantor;
        }
        (true, chain)
    }

    /// The effective resolution policy for `meta` at `global_time`, for
    /// dynamic metas, plus its proof chain.
    pub fn get_resolution_policy(
        &self,
        meta: &MetaName,
        global_time: u64,
    ) -> Option<(ResolutionPolicy, Vec<MessageId>)> {
        let entries = self.dynamic.get(meta)?;
        entries
            .iter()
            .filter(|(gt, ..)| *gt < global_time)
            .max_by_key(|(gt, grantor, ..)| (*gt, *grantor))
            .map(|(_, _, policy, id)| (*policy, vec![*id]))
    }

    /// Fold an authorize/revoke/dynamic-settings message into the timeline.
    /// No-op for messages carrying any other payload.
    pub fn apply(&mut self, message: &Message, message_id: MessageId) {
        let grantor = message.member();
        match &message.payload {
            Payload::Authorize {
                target,
                meta,
                action,
            } => {
                self.grants
                    .entry((*target, meta.clone(), *action))
                    .or_default()
                    .push(TimelineEntry {
                        global_time: message.global_time,
                        grantor,
                        granted: true,
                        message_id,
                    });
            }
            Payload::Revoke {
                target,
                meta,
                action,
            } => {
                self.grants
                    .entry((*target, meta.clone(), *action))
                    .or_default()
                    .push(TimelineEntry {
                        global_time: message.global_time,
                        grantor,
                        granted: false,
                        message_id,
                    });
            }
            Payload::DynamicSettings { meta, policy } => {
                self.dynamic.entry(meta.clone()).or_default().push((
                    message.global_time,
                    grantor,
                    *policy,
                    message_id,
                ));
            }
            _ => {}
        }
    }

    /// Undo the effect of a previously applied message (e.g. because it
    /// was itself undone). Must be called with the same `message_id`
    /// passed to the matching [`Timeline::apply`].
    pub fn unapply(&mut self, message: &Message, message_id: MessageId) {
        match &message.payload {
            Payload::Authorize {
                target,
                meta,
                action,
            }
            | Payload::Revoke {
                target,
                meta,
                action,
            } => {
                if let Some(entries) = self.grants.get_mut(&(*target, meta.clone(), *action)) {
                    entries.retain(|e| e.message_id != message_id);
                }
            }
            Payload::DynamicSettings { meta, .. } => {
                if let Some(entries) = self.dynamic.get_mut(meta) {
                    entries.retain(|(.., id)| *id != message_id);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AuthBlock, PublicKey, Signature};

    fn member_with_pk(seed: u8) -> (PublicKey, MemberId) {
        let pk = PublicKey([seed; 32]);
        (pk, MemberId::from_public_key(&pk.0))
    }

    fn signed_by(pk: PublicKey, global_time: u64, payload: Payload) -> Message {
        Message {
            community: MemberId([0u8; 20]),
            meta: "x".into(),
            global_time,
            sequence_number: None,
            auth: AuthBlock::Single {
                member: pk,
                signature: Signature::ZERO,
            },
            payload,
            packet: Vec::new(),
        }
    }

    #[test]
    fn master_is_always_permitted() {
        let (_master_pk, master) = member_with_pk(1);
        let tl = Timeline::new(master);
        let (allowed, proof) = tl.check(master, &"x".into(), TimelineAction::Permit, 10);
        assert!(allowed);
        assert!(proof.is_empty());
    }

    #[test]
    fn grant_then_revoke_removes_permission() {
        let (master_pk, master) = member_with_pk(1);
        let (_alice_pk, alice) = member_with_pk(2);
        let mut tl = Timeline::new(master);

        let grant = signed_by(
            master_pk,
            5,
            Payload::Authorize {
                target: alice,
                meta: "x".into(),
                action: TimelineAction::Permit,
            },
        );
        tl.apply(&grant, 1);
        let (allowed, proof) = tl.check(alice, &"x".into(), TimelineAction::Permit, 10);
        assert!(allowed);
        assert_eq!(proof, vec![1]);

        let revoke = signed_by(
            master_pk,
            6,
            Payload::Revoke {
                target: alice,
                meta: "x".into(),
                action: TimelineAction::Permit,
            },
        );
        tl.apply(&revoke, 2);
        let (allowed, _) = tl.check(alice, &"x".into(), TimelineAction::Permit, 10);
        assert!(!allowed);

        // The grant at global_time=5 only takes effect from 6 onward.
        let (allowed_at_grant, _) = tl.check(alice, &"x".into(), TimelineAction::Permit, 5);
        assert!(!allowed_at_grant);
        let (allowed_after_grant, _) = tl.check(alice, &"x".into(), TimelineAction::Permit, 6);
        assert!(allowed_after_grant);
    }
}
