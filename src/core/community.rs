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

//! A loaded community: its members, meta-message templates, timeline, and
//! the monotonically advancing global time counter. `Community` owns this
//! state exclusively; nothing outside the owning task touches it, which is
//! what gives the single-writer guarantee its concurrency model relies on.

use std::collections::BTreeMap;

use crate::core::distribution::DistributionPolicy;
use crate::core::store::{RowId, Store, StoreError};
use crate::core::timeline::Timeline;
use crate::core::types::{
    AuthPolicy, CommunityId, DestinationPolicy, MemberId, MetaName, PublicKey, ResolutionPolicy,
    SyncDirection,
};

/// A meta-message template, as loaded into memory for fast lookup during
/// the pipeline's decode/permission/distribution stages.
#[derive(Clone, Debug)]
pub struct Meta {
    /// Row id in the store.
    pub row_id: RowId,
    /// Meta name.
    pub name: MetaName,
    /// Authentication policy.
    pub auth: AuthPolicy,
    /// Resolution policy.
    pub resolution: ResolutionPolicy,
    /// Distribution policy.
    pub distribution: DistributionPolicy,
    /// Destination policy.
    pub destination: DestinationPolicy,
    /// Sync priority, 0..255.
    pub priority: u8,
    /// Synchronisation direction.
    pub direction: SyncDirection,
}

impl Meta {
    /// A plain full-sync, community-wide, public meta with default priority.
    pub fn full_sync(row_id: RowId, name: impl Into<MetaName>) -> Self {
        Meta {
            row_id,
            name: name.into(),
            auth: AuthPolicy::Single,
            resolution: ResolutionPolicy::Public,
            distribution: DistributionPolicy::FullSync,
            destination: DestinationPolicy::CommunityWide,
            priority: 128,
            direction: SyncDirection::Asc,
        }
    }
}

/// A meta-message template as defined by a community's *classification*
/// (the application code that knows what metas a "chat-room" or
/// "file-share" community carries), before it has a store-assigned row id.
/// The persistent schema only records `(name, priority, direction)` per
/// `meta_message` row (see spec.md §6); the remaining policy fields are
/// part of the community's code-defined class, not its on-disk state, so
/// they are re-supplied here whenever a community is (re)loaded.
#[derive(Clone, Debug)]
pub struct MetaTemplate {
    /// Meta name.
    pub name: MetaName,
    /// Authentication policy.
    pub auth: AuthPolicy,
    /// Resolution policy.
    pub resolution: ResolutionPolicy,
    /// Distribution policy.
    pub distribution: DistributionPolicy,
    /// Destination policy.
    pub destination: DestinationPolicy,
    /// Sync priority, 0..255.
    pub priority: u8,
    /// Synchronisation direction.
    pub direction: SyncDirection,
}

impl MetaTemplate {
    /// A plain full-sync, community-wide, public meta with default priority.
    pub fn full_sync(name: impl Into<MetaName>) -> Self {
        MetaTemplate {
            name: name.into(),
            auth: AuthPolicy::Single,
            resolution: ResolutionPolicy::Public,
            distribution: DistributionPolicy::FullSync,
            destination: DestinationPolicy::CommunityWide,
            priority: 128,
            direction: SyncDirection::Asc,
        }
    }
}

fn direction_to_i32(direction: SyncDirection) -> i32 {
    match direction {
        SyncDirection::Asc => 1,
        SyncDirection::Desc => -1,
        SyncDirection::Random => 0,
    }
}

/// A loaded member, as cached in a community's arena for fast auth lookups.
#[derive(Clone, Copy, Debug)]
pub struct MemberHandle {
    /// Row id in the store.
    pub row_id: RowId,
    /// Derived identifier.
    pub mid: MemberId,
}

/// In-memory state for one loaded community.
pub struct Community {
    /// Community identifier (== master member's mid).
    pub cid: CommunityId,
    /// Row id in the store.
    pub row_id: RowId,
    /// Free-form classification tag.
    pub classification: String,
    /// Whether this community auto-loads on node start.
    pub auto_load: bool,
    /// Members known to this community, keyed by mid.
    members: BTreeMap<MemberId, MemberHandle>,
    /// Meta-message templates, keyed by name.
    metas: BTreeMap<MetaName, Meta>,
    /// Permission graph.
    pub timeline: Timeline,
    /// Local global time counter: advances with every accepted message of
    /// any meta in the community (also the pruning policy's `current_gt`).
    current_gt: u64,
}

impl Community {
    /// Construct a freshly loaded (or created) community.
    pub fn new(
        cid: CommunityId,
        row_id: RowId,
        master: MemberId,
        classification: String,
        auto_load: bool,
    ) -> Self {
        Community {
            cid,
            row_id,
            classification,
            auto_load,
            members: BTreeMap::new(),
            metas: BTreeMap::new(),
            timeline: Timeline::new(master),
            current_gt: 0,
        }
    }

    /// Register a member as known to this community.
    pub fn add_member(&mut self, handle: MemberHandle) {
        self.members.entry(handle.mid).or_insert(handle);
    }

    /// Look up a known member by mid.
    pub fn member(&self, mid: MemberId) -> Option<MemberHandle> {
        self.members.get(&mid).copied()
    }

    /// Register a meta-message template.
    pub fn add_meta(&mut self, meta: Meta) {
        self.metas.insert(meta.name.clone(), meta);
    }

    /// Look up a meta-message template by name.
    pub fn meta(&self, name: &MetaName) -> Option<&Meta> {
        self.metas.get(name)
    }

    /// All meta templates, for sync offering and CLI introspection.
    pub fn metas(&self) -> impl Iterator<Item = &Meta> {
        self.metas.values()
    }

    /// The current global time, advanced to `max(current, observed)` by
    /// every accepted message (local or remote).
    pub fn current_gt(&self) -> u64 {
        self.current_gt
    }

    /// Advance the local global time counter to at least `observed`, and
    /// return the new value.
    pub fn advance_gt(&mut self, observed: u64) -> u64 {
        self.current_gt = self.current_gt.max(observed);
        self.current_gt
    }

    /// Allocate the next strictly-increasing global time for a
    /// locally-created message.
    pub fn next_local_gt(&mut self) -> u64 {
        self.current_gt += 1;
        self.current_gt
    }

    /// Resolve (or create) each of `templates`' store rows and register
    /// them as this community's meta set, matching up `(community, name)`
    /// idempotently so reloading a community never duplicates rows.
    pub fn hydrate_metas(&mut self, store: &Store, templates: &[MetaTemplate]) -> Result<(), StoreError> {
        for template in templates {
            let row_id = match store.get_meta(self.row_id, &template.name)? {
                Some(row) => row.id,
                None => store.put_meta(
                    self.row_id,
                    template.name.clone(),
                    template.priority,
                    direction_to_i32(template.direction),
                )?,
            };
            self.add_meta(Meta {
                row_id,
                name: template.name.clone(),
                auth: template.auth,
                resolution: template.resolution,
                distribution: template.distribution.clone(),
                destination: template.destination,
                priority: template.priority,
                direction: template.direction,
            });
        }
        Ok(())
    }

    /// Load an existing community by its `cid`, or create it (as its own
    /// master) if no such row exists yet, hydrating its meta set from
    /// `templates`. This is the path both node startup (for configured
    /// auto-load communities) and the Dispatcher's unknown-`cid` auto-load
    /// lookup share.
    pub fn load_or_create(
        store: &Store,
        master_public_key: PublicKey,
        classification: String,
        templates: &[MetaTemplate],
        auto_load: bool,
    ) -> Result<Self, StoreError> {
        let master_row = store.put_member(master_public_key, None)?;
        let cid = MemberId::from_public_key(&master_public_key.0);
        let community_row = store.put_community(master_row, master_row, classification.clone(), auto_load)?;
        let mut community = Community::new(cid, community_row, cid, classification, auto_load);
        community.add_member(MemberHandle {
            row_id: master_row,
            mid: cid,
        });
        community.hydrate_metas(store, templates)?;
        Ok(community)
    }

    /// Load an already-created community purely by its `cid`, for the
    /// Dispatcher's auto-load path. Returns `None` if no community with
    /// this `cid` has ever been created.
    pub fn load_by_cid(
        store: &Store,
        cid: CommunityId,
        templates: &[MetaTemplate],
    ) -> Result<Option<Self>, StoreError> {
        let Some(row) = store.get_community_by_cid(cid)? else {
            return Ok(None);
        };
        let Some(master_row) = store.get_member_by_id(row.master)? else {
            return Err(StoreError::NotFound);
        };
        let mut community = Community::new(cid, row.id, master_row.mid, row.classification, row.auto_load);
        community.add_member(MemberHandle {
            row_id: master_row.id,
            mid: master_row.mid,
        });
        community.hydrate_metas(store, templates)?;
        Ok(Some(community))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gt_monotonically_advances() {
        let master = MemberId([1u8; 20]);
        let mut c = Community::new(master, 1, master, "test".into(), true);
        assert_eq!(c.next_local_gt(), 1);
        assert_eq!(c.advance_gt(10), 10);
        assert_eq!(c.next_local_gt(), 11);
        // Advancing to something lower than current is a no-op.
        assert_eq!(c.advance_gt(3), 11);
    }

    #[test]
    fn meta_lookup_roundtrip() {
        let master = MemberId([1u8; 20]);
        let mut c = Community::new(master, 1, master, "test".into(), true);
        c.add_meta(Meta::full_sync(1, "greeting"));
        assert!(c.meta(&"greeting".into()).is_some());
        assert!(c.meta(&"missing".into()).is_none());
    }

    #[test]
    fn load_or_create_then_load_by_cid_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let templates = vec![MetaTemplate::full_sync("greeting")];
        let pk = PublicKey([6u8; 32]);

        let created = Community::load_or_create(&store, pk, "test".into(), &templates, true).unwrap();
        assert!(created.meta(&"greeting".into()).is_some());

        let reloaded = Community::load_by_cid(&store, created.cid, &templates)
            .unwrap()
            .expect("community should exist");
        assert_eq!(reloaded.cid, created.cid);
        assert_eq!(reloaded.row_id, created.row_id);
        let greeting = reloaded.meta(&"greeting".into()).unwrap();
        assert_eq!(greeting.row_id, created.meta(&"greeting".into()).unwrap().row_id);

        assert!(Community::load_by_cid(&store, CommunityId([9u8; 20]), &templates)
            .unwrap()
            .is_none());
    }
}
