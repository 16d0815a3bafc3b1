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

//! Durable, queryable log of messages, keyed by `(community, member,
//! global_time)` with secondary indexes for `(meta, undone, global_time)`
//! and `(meta, member)`. Backed by `sled`, matching six sled trees onto
//! the schema's six logical tables (`member`, `community`, `meta_message`,
//! `sync`, `double_signed_sync`, `option`).

pub mod commit_guard;

use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use sled::Transactional;
use thiserror::Error;

use crate::core::types::{
    decode_canonical_limited, encode_canonical, CodecError, CommunityId, MemberId, MetaName,
    PublicKey,
};
use commit_guard::{CommitGuard, PendingDepth};

/// Current schema version this build understands. No migrations are
/// implemented; a database below [`OLDEST_SUPPORTED_VERSION`] or above
/// this constant is refused outright.
pub const LATEST_VERSION: u32 = 21;

/// Oldest on-disk schema version this build will open without migrating.
pub const OLDEST_SUPPORTED_VERSION: u32 = 21;

const MAX_PACKET_BYTES: usize = 1 << 20;

/// Row identifier type used across all tables (`sled`-generated monotonic
/// ids, matching `INTEGER PRIMARY KEY AUTOINCREMENT`).
pub type RowId = u64;

/// Store-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open the sled database at the configured path.
    #[error("database open failed")]
    DbOpen,
    /// A read, write, or flush against sled failed.
    #[error("database io error")]
    DbIo,
    /// A multi-tree transaction conflicted or aborted.
    #[error("transaction conflict")]
    TxConflict,
    /// Encoding or decoding a stored row failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// On-disk schema version is newer than this build understands.
    #[error("on-disk schema version {found} is newer than the latest supported {latest}")]
    SchemaTooNew {
        /// Version found on disk.
        found: u32,
        /// Latest version this build supports.
        latest: u32,
    },
    /// On-disk schema version is older than this build can open (no
    /// migration path is implemented).
    #[error("on-disk schema version {found} is older than the oldest supported {oldest}")]
    SchemaTooOld {
        /// Version found on disk.
        found: u32,
        /// Oldest version this build can open.
        oldest: u32,
    },
    /// The requested row does not exist.
    #[error("row not found")]
    NotFound,
}

fn be_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn db_err<T>(r: sled::Result<T>) -> Result<T, StoreError> {
    r.map_err(|_| StoreError::DbIo)
}

/// A durable member record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberRow {
    /// Row id.
    pub id: RowId,
    /// 20-byte derived identifier.
    pub mid: MemberId,
    /// Ed25519 public key.
    pub public_key: PublicKey,
    /// Private key, if this peer holds it.
    pub private_key: Option<[u8; 32]>,
}

/// A durable community record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommunityRow {
    /// Row id.
    pub id: RowId,
    /// Row id of the master member.
    pub master: RowId,
    /// Row id of the local member acting within this community.
    pub member: RowId,
    /// Free-form classification tag.
    pub classification: String,
    /// Whether this community auto-loads on node start.
    pub auto_load: bool,
    /// Schema version this community's rows were written under.
    pub database_version: u32,
}

/// A durable meta-message template record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaRow {
    /// Row id.
    pub id: RowId,
    /// Owning community row id.
    pub community: RowId,
    /// Meta name.
    pub name: MetaName,
    /// Sync priority, 0..255 (default 128).
    pub priority: u8,
    /// Synchronisation direction, encoded as the teacher's `direction: INT`.
    pub direction: i32,
}

/// A durable message row (the `sync` table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRow {
    /// Row id.
    pub id: RowId,
    /// Owning community row id.
    pub community: RowId,
    /// Owning community's derived identifier (kept alongside the row id
    /// so the `(community, member, global_time)` secondary index can be
    /// rebuilt on delete without a second lookup).
    pub community_mid: CommunityId,
    /// Creator member row id.
    pub member: RowId,
    /// Creator's derived identifier, for the same reason as `community_mid`.
    pub member_mid: MemberId,
    /// Global time.
    pub global_time: u64,
    /// Meta-message row id.
    pub meta_message: RowId,
    /// 0 if not undone, else the row id of the undoing message.
    pub undone: RowId,
    /// Encoded packet bytes.
    pub packet: Vec<u8>,
    /// Sequence number, 0 if the meta is not sequence-numbered.
    pub sequence: u64,
}

/// A durable double-signed-sync index row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoubleSignedRow {
    /// Row id of the underlying `sync` row.
    pub sync: RowId,
    /// First signing member row id (canonical order: member1 <= member2).
    pub member1: RowId,
    /// Second signing member row id.
    pub member2: RowId,
}

fn sync_key_bytes(community: CommunityId, member: MemberId, global_time: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(20 + 20 + 8);
    k.extend_from_slice(&community.0);
    k.extend_from_slice(&member.0);
    k.extend_from_slice(&be_u64(global_time));
    k
}

fn meta_undone_gt_key(meta: RowId, undone: RowId, global_time: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(24);
    k.extend_from_slice(&be_u64(meta));
    k.extend_from_slice(&be_u64(undone));
    k.extend_from_slice(&be_u64(global_time));
    k
}

fn meta_member_key(meta: RowId, member: RowId, global_time: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(24);
    k.extend_from_slice(&be_u64(meta));
    k.extend_from_slice(&be_u64(member));
    k.extend_from_slice(&be_u64(global_time));
    k
}

fn pair_key(member1: RowId, member2: RowId) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    k.extend_from_slice(&be_u64(member1));
    k.extend_from_slice(&be_u64(member2));
    k
}

/// The store: six sled trees mirroring the schema's six logical tables,
/// plus three auxiliary trees for the named secondary indexes.
pub struct Store {
    db: sled::Db,
    member: sled::Tree,
    community: sled::Tree,
    meta_message: sled::Tree,
    sync: sled::Tree,
    double_signed_sync: sled::Tree,
    option: sled::Tree,
    idx_member_by_mid: sled::Tree,
    idx_sync_by_key: sled::Tree,
    idx_sync_meta_undone_gt: sled::Tree,
    idx_sync_meta_member: sled::Tree,
    idx_double_signed_pair: sled::Tree,
    idx_community_by_master: sled::Tree,
    pub(crate) pending_commits: PendingDepth,
    pub(crate) ignore_pending: AtomicBool,
}

impl Store {
    /// Open (or create) a store at `path`, checking the on-disk schema
    /// version against [`LATEST_VERSION`].
    ///
    /// sled is opened in `Mode::HighThroughput`, the embedded-engine
    /// analogue of SQLite's WAL + `synchronous=NORMAL` combination: favor
    /// write throughput, with durability on explicit flush rather than on
    /// every write.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|_| StoreError::DbOpen)?;

        let member = db_err(db.open_tree(b"member"))?;
        let community = db_err(db.open_tree(b"community"))?;
        let meta_message = db_err(db.open_tree(b"meta_message"))?;
        let sync = db_err(db.open_tree(b"sync"))?;
        let double_signed_sync = db_err(db.open_tree(b"double_signed_sync"))?;
        let option = db_err(db.open_tree(b"option"))?;
        let idx_member_by_mid = db_err(db.open_tree(b"idx_member_by_mid"))?;
        let idx_sync_by_key = db_err(db.open_tree(b"idx_sync_by_key"))?;
        let idx_sync_meta_undone_gt = db_err(db.open_tree(b"idx_sync_meta_undone_gt"))?;
        let idx_sync_meta_member = db_err(db.open_tree(b"idx_sync_meta_member"))?;
        let idx_double_signed_pair = db_err(db.open_tree(b"idx_double_signed_pair"))?;
        let idx_community_by_master = db_err(db.open_tree(b"idx_community_by_master"))?;

        let store = Store {
            db,
            member,
            community,
            meta_message,
            sync,
            double_signed_sync,
            option,
            idx_member_by_mid,
            idx_sync_by_key,
            idx_sync_meta_undone_gt,
            idx_sync_meta_member,
            idx_double_signed_pair,
            idx_community_by_master,
            pending_commits: PendingDepth::new(0),
            ignore_pending: AtomicBool::new(false),
        };
        store.check_schema_version()?;
        Ok(store)
    }

    fn check_schema_version(&self) -> Result<(), StoreError> {
        match db_err(self.option.get(b"database_version"))? {
            None => {
                db_err(self
                    .option
                    .insert(b"database_version", &be_u64(LATEST_VERSION as u64)[..]))?;
                Ok(())
            }
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                let found = u64::from_be_bytes(buf) as u32;
                if found > LATEST_VERSION {
                    Err(StoreError::SchemaTooNew {
                        found,
                        latest: LATEST_VERSION,
                    })
                } else if found < OLDEST_SUPPORTED_VERSION {
                    Err(StoreError::SchemaTooOld {
                        found,
                        oldest: OLDEST_SUPPORTED_VERSION,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Enter a no-commit scope: batch mutations and flush once at the
    /// outermost scope's exit.
    pub fn commit_scope(&self) -> CommitGuard<'_> {
        CommitGuard::enter(self)
    }

    // -- member ------------------------------------------------------

    /// Insert or fetch the row for `mid`, keyed by the member's identifier.
    pub fn put_member(
        &self,
        public_key: PublicKey,
        private_key: Option<[u8; 32]>,
    ) -> Result<RowId, StoreError> {
        let mid = MemberId::from_public_key(&public_key.0);
        if let Some(existing) = db_err(self.idx_member_by_mid.get(mid.0))? {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&existing);
            return Ok(u64::from_be_bytes(buf));
        }
        let id = db_err(self.member.generate_id())?;
        let row = MemberRow {
            id,
            mid,
            public_key,
            private_key,
        };
        let bytes = encode_canonical(&row)?;
        (&self.member, &self.idx_member_by_mid)
            .transaction(|(member_tx, idx_tx)| {
                member_tx.insert(&be_u64(id)[..], bytes.as_slice())?;
                idx_tx.insert(&mid.0[..], &be_u64(id)[..])?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::TxConflict)?;
        Ok(id)
    }

    /// Fetch a member row by its derived identifier.
    pub fn get_member_by_mid(&self, mid: MemberId) -> Result<Option<MemberRow>, StoreError> {
        let Some(id_bytes) = db_err(self.idx_member_by_mid.get(mid.0))? else {
            return Ok(None);
        };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&id_bytes);
        let id = u64::from_be_bytes(buf);
        self.get_member_by_id(id)
    }

    /// Fetch a member row by its row id.
    pub fn get_member_by_id(&self, id: RowId) -> Result<Option<MemberRow>, StoreError> {
        match db_err(self.member.get(be_u64(id)))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_canonical_limited(&bytes, MAX_PACKET_BYTES)?)),
        }
    }

    // -- community ----------------------------------------------------

    /// Insert a new community row. `UNIQUE(master)` is enforced by the
    /// `idx_community_by_master` index: a second insert for the same
    /// master member row returns the existing row id unchanged, matching
    /// [`Store::put_member`]'s idempotent-insert style.
    pub fn put_community(
        &self,
        master: RowId,
        member: RowId,
        classification: String,
        auto_load: bool,
    ) -> Result<RowId, StoreError> {
        if let Some(existing) = db_err(self.idx_community_by_master.get(be_u64(master)))? {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&existing);
            return Ok(u64::from_be_bytes(buf));
        }
        let id = db_err(self.community.generate_id())?;
        let row = CommunityRow {
            id,
            master,
            member,
            classification,
            auto_load,
            database_version: LATEST_VERSION,
        };
        let bytes = encode_canonical(&row)?;
        (&self.community, &self.idx_community_by_master)
            .transaction(|(community_tx, idx_tx)| {
                community_tx.insert(&be_u64(id)[..], bytes.as_slice())?;
                idx_tx.insert(&be_u64(master)[..], &be_u64(id)[..])?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::TxConflict)?;
        Ok(id)
    }

    /// Fetch a community row by its row id.
    pub fn get_community(&self, id: RowId) -> Result<Option<CommunityRow>, StoreError> {
        match db_err(self.community.get(be_u64(id)))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_canonical_limited(&bytes, MAX_PACKET_BYTES)?)),
        }
    }

    /// Fetch a community row by its `cid` (the master member's derived
    /// identifier), for the Dispatcher's auto-load lookup.
    pub fn get_community_by_cid(
        &self,
        cid: CommunityId,
    ) -> Result<Option<CommunityRow>, StoreError> {
        let Some(master_row) = self.get_member_by_mid(cid)? else {
            return Ok(None);
        };
        let Some(id_bytes) = db_err(self.idx_community_by_master.get(be_u64(master_row.id)))? else {
            return Ok(None);
        };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&id_bytes);
        self.get_community(u64::from_be_bytes(buf))
    }

    // -- meta_message ---------------------------------------------------

    /// Insert a new meta-message row. `UNIQUE(community, name)` is
    /// enforced by the caller resolving via [`Store::get_meta`] first.
    pub fn put_meta(
        &self,
        community: RowId,
        name: MetaName,
        priority: u8,
        direction: i32,
    ) -> Result<RowId, StoreError> {
        let id = db_err(self.meta_message.generate_id())?;
        let row = MetaRow {
            id,
            community,
            name,
            priority,
            direction,
        };
        let bytes = encode_canonical(&row)?;
        db_err(self.meta_message.insert(be_u64(id), bytes))?;
        Ok(id)
    }

    /// Fetch a meta-message row by community and name.
    pub fn get_meta(
        &self,
        community: RowId,
        name: &MetaName,
    ) -> Result<Option<MetaRow>, StoreError> {
        for item in self.meta_message.iter() {
            let (_, bytes) = db_err(item)?;
            let row: MetaRow = decode_canonical_limited(&bytes, MAX_PACKET_BYTES)?;
            if row.community == community && &row.name == name {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    // -- sync -----------------------------------------------------------

    /// Idempotent insertion of a message row: if `(community, member,
    /// global_time)` already exists, its row id is returned unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn put_message(
        &self,
        community: CommunityId,
        community_row: RowId,
        member: MemberId,
        member_row: RowId,
        global_time: u64,
        meta_message: RowId,
        packet: Vec<u8>,
        sequence: Option<u64>,
    ) -> Result<RowId, StoreError> {
        let key = sync_key_bytes(community, member, global_time);
        if let Some(existing) = db_err(self.idx_sync_by_key.get(&key))? {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&existing);
            return Ok(u64::from_be_bytes(buf));
        }

        let id = db_err(self.sync.generate_id())?;
        let row = SyncRow {
            id,
            community: community_row,
            community_mid: community,
            member: member_row,
            member_mid: member,
            global_time,
            meta_message,
            undone: 0,
            packet,
            sequence: sequence.unwrap_or(0),
        };
        let bytes = encode_canonical(&row)?;
        let undone_gt_key = meta_undone_gt_key(meta_message, 0, global_time);
        let member_key = meta_member_key(meta_message, member_row, global_time);

        (
            &self.sync,
            &self.idx_sync_by_key,
            &self.idx_sync_meta_undone_gt,
            &self.idx_sync_meta_member,
        )
            .transaction(|(sync_tx, bykey_tx, undone_tx, member_tx)| {
                sync_tx.insert(&be_u64(id)[..], bytes.as_slice())?;
                bykey_tx.insert(key.as_slice(), &be_u64(id)[..])?;
                undone_tx.insert(undone_gt_key.as_slice(), &be_u64(id)[..])?;
                member_tx.insert(member_key.as_slice(), &be_u64(id)[..])?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::TxConflict)?;
        Ok(id)
    }

    /// Fetch a message row by `(community, member, global_time)`.
    pub fn get_by_key(
        &self,
        community: CommunityId,
        member: MemberId,
        global_time: u64,
    ) -> Result<Option<SyncRow>, StoreError> {
        let key = sync_key_bytes(community, member, global_time);
        let Some(id_bytes) = db_err(self.idx_sync_by_key.get(&key))? else {
            return Ok(None);
        };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&id_bytes);
        self.get_by_id(u64::from_be_bytes(buf))
    }

    /// Fetch a message row by its row id.
    pub fn get_by_id(&self, id: RowId) -> Result<Option<SyncRow>, StoreError> {
        match db_err(self.sync.get(be_u64(id)))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_canonical_limited(&bytes, MAX_PACKET_BYTES)?)),
        }
    }

    /// Ordered scan over a meta's messages within `[low, high]`, filtered
    /// by `(global_time + offset) mod modulo == 0`, consistent with the
    /// direction recorded on the meta row (ascending if `direction >= 0`).
    pub fn range(
        &self,
        meta: RowId,
        low: u64,
        high: u64,
        modulo: u64,
        offset: u64,
        direction_ascending: bool,
    ) -> Result<Vec<SyncRow>, StoreError> {
        let lo = meta_undone_gt_key(meta, 0, low);
        let hi = meta_undone_gt_key(meta, 0, high.saturating_add(1));
        let mut rows = Vec::new();
        for item in self.idx_sync_meta_undone_gt.range(lo..hi) {
            let (_, id_bytes) = db_err(item)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&id_bytes);
            let id = u64::from_be_bytes(buf);
            if let Some(row) = self.get_by_id(id)? {
                if modulo == 0 || (row.global_time + offset) % modulo == 0 {
                    rows.push(row);
                }
            }
        }
        if !direction_ascending {
            rows.reverse();
        }
        Ok(rows)
    }

    /// Mark `target_id` as undone by `undo_id`, updating the secondary
    /// index so future `range` calls reflect the new undone state.
    pub fn mark_undone(&self, target_id: RowId, undo_id: RowId) -> Result<(), StoreError> {
        self.rewrite_undone(target_id, undo_id)
    }

    /// Clear the undone marker on `target_id`.
    pub fn clear_undone(&self, target_id: RowId) -> Result<(), StoreError> {
        self.rewrite_undone(target_id, 0)
    }

    fn rewrite_undone(&self, target_id: RowId, undone: RowId) -> Result<(), StoreError> {
        let Some(mut row) = self.get_by_id(target_id)? else {
            return Err(StoreError::NotFound);
        };
        let old_key = meta_undone_gt_key(row.meta_message, row.undone, row.global_time);
        row.undone = undone;
        let new_key = meta_undone_gt_key(row.meta_message, row.undone, row.global_time);
        let bytes = encode_canonical(&row)?;

        (&self.sync, &self.idx_sync_meta_undone_gt)
            .transaction(|(sync_tx, undone_tx)| {
                sync_tx.insert(&be_u64(target_id)[..], bytes.as_slice())?;
                undone_tx.remove(old_key.as_slice())?;
                undone_tx.insert(new_key.as_slice(), &be_u64(target_id)[..])?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::TxConflict)?;
        Ok(())
    }

    /// The highest sequence number stored for `(meta, member)`, or `None`
    /// if this member has no sequence-numbered messages for this meta yet.
    pub fn last_sequence(&self, meta: RowId, member_row: RowId) -> Result<Option<u64>, StoreError> {
        let lo = meta_member_key(meta, member_row, 0);
        let hi = meta_member_key(meta, member_row, u64::MAX);
        let mut best: Option<u64> = None;
        for item in self.idx_sync_meta_member.range(lo..=hi) {
            let (_, id_bytes) = db_err(item)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&id_bytes);
            let id = u64::from_be_bytes(buf);
            if let Some(row) = self.get_by_id(id)? {
                if row.sequence > 0 {
                    best = Some(best.map_or(row.sequence, |b| b.max(row.sequence)));
                }
            }
        }
        Ok(best)
    }

    /// All existing rows for `(meta, member)`, used by the last-N
    /// distribution policy to decide eviction.
    pub fn existing_for_key(&self, meta: RowId, member_row: RowId) -> Result<Vec<SyncRow>, StoreError> {
        let lo = meta_member_key(meta, member_row, 0);
        let hi = meta_member_key(meta, member_row, u64::MAX);
        let mut rows = Vec::new();
        for item in self.idx_sync_meta_member.range(lo..=hi) {
            let (_, id_bytes) = db_err(item)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&id_bytes);
            let id = u64::from_be_bytes(buf);
            if let Some(row) = self.get_by_id(id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Count stored messages for `(community, meta)`. Community is not
    /// separately indexed here since a meta row id already implies its
    /// owning community.
    pub fn count(&self, meta: RowId) -> Result<u64, StoreError> {
        let lo = meta_undone_gt_key(meta, 0, 0);
        let hi = meta_undone_gt_key(meta, u64::MAX, u64::MAX);
        let mut n = 0u64;
        for item in self.idx_sync_meta_undone_gt.range(lo..=hi) {
            db_err(item)?;
            n += 1;
        }
        Ok(n)
    }

    /// Every stored row id belonging to `community`, for the hard-kill
    /// destroy-community sweep (the only caller that needs an unfiltered
    /// view of a whole community's log).
    pub fn all_rows_for_community(&self, community: CommunityId) -> Result<Vec<RowId>, StoreError> {
        let mut out = Vec::new();
        for item in self.idx_sync_by_key.scan_prefix(community.0) {
            let (_, id_bytes) = db_err(item)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&id_bytes);
            out.push(u64::from_be_bytes(buf));
        }
        Ok(out)
    }

    /// Remove a message row outright (used by pruning and hard-kill destroy).
    pub fn delete_message(&self, id: RowId) -> Result<(), StoreError> {
        let Some(row) = self.get_by_id(id)? else {
            return Ok(());
        };
        let undone_gt_key = meta_undone_gt_key(row.meta_message, row.undone, row.global_time);
        let member_key = meta_member_key(row.meta_message, row.member, row.global_time);
        let by_key = sync_key_bytes(row.community_mid, row.member_mid, row.global_time);
        (
            &self.sync,
            &self.idx_sync_meta_undone_gt,
            &self.idx_sync_meta_member,
            &self.idx_sync_by_key,
        )
            .transaction(|(sync_tx, undone_tx, member_tx, bykey_tx)| {
                sync_tx.remove(&be_u64(id)[..])?;
                undone_tx.remove(undone_gt_key.as_slice())?;
                member_tx.remove(member_key.as_slice())?;
                bykey_tx.remove(by_key.as_slice())?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::TxConflict)?;
        Ok(())
    }

    // -- double_signed_sync ----------------------------------------------

    /// Record the double-signed index for `sync_id`, keyed by the sorted
    /// member pair.
    pub fn put_double_signed(
        &self,
        sync_id: RowId,
        member1: RowId,
        member2: RowId,
    ) -> Result<(), StoreError> {
        let (m1, m2) = if member1 <= member2 {
            (member1, member2)
        } else {
            (member2, member1)
        };
        let row = DoubleSignedRow {
            sync: sync_id,
            member1: m1,
            member2: m2,
        };
        let bytes = encode_canonical(&row)?;
        let key = pair_key(m1, m2);
        (&self.double_signed_sync, &self.idx_double_signed_pair)
            .transaction(|(dsigned_tx, idx_tx)| {
                dsigned_tx.insert(&be_u64(sync_id)[..], bytes.as_slice())?;
                idx_tx.insert(key.as_slice(), &be_u64(sync_id)[..])?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|_| StoreError::TxConflict)?;
        Ok(())
    }

    /// Fetch the `sync` row id recorded for a double-signed member pair.
    pub fn get_double_signed_by_pair(
        &self,
        member1: RowId,
        member2: RowId,
    ) -> Result<Option<RowId>, StoreError> {
        let (m1, m2) = if member1 <= member2 {
            (member1, member2)
        } else {
            (member2, member1)
        };
        let key = pair_key(m1, m2);
        match db_err(self.idx_double_signed_pair.get(&key))? {
            None => Ok(None),
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(buf)))
            }
        }
    }

    /// Flush all pending sled writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        db_err(self.db.flush())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn schema_version_written_on_fresh_store() {
        let (_dir, store) = open_temp();
        let bytes = store.option.get(b"database_version").unwrap().unwrap();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        assert_eq!(u64::from_be_bytes(buf) as u32, LATEST_VERSION);
    }

    #[test]
    fn reopening_with_newer_schema_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store
                .option
                .insert(b"database_version", &be_u64((LATEST_VERSION + 1) as u64)[..])
                .unwrap();
            store.flush().unwrap();
        }
        let err = Store::open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::SchemaTooNew { .. }));
    }

    #[test]
    fn put_message_is_idempotent() {
        let (_dir, store) = open_temp();
        let pk = PublicKey([3u8; 32]);
        let member_row = store.put_member(pk, None).unwrap();
        let community = MemberId::from_public_key(&pk.0);
        let community_row = store.put_community(member_row, member_row, "c".into(), true).unwrap();
        let meta_row = store.put_meta(community_row, "m".into(), 128, 1).unwrap();
        let member = MemberId::from_public_key(&pk.0);

        let id1 = store
            .put_message(community, community_row, member, member_row, 5, meta_row, vec![1], None)
            .unwrap();
        let id2 = store
            .put_message(community, community_row, member, member_row, 5, meta_row, vec![2], None)
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn community_lookup_by_cid_resolves_master() {
        let (_dir, store) = open_temp();
        let pk = PublicKey([9u8; 32]);
        let member_row = store.put_member(pk, None).unwrap();
        let cid = MemberId::from_public_key(&pk.0);
        let community_row = store
            .put_community(member_row, member_row, "c".into(), true)
            .unwrap();

        let found = store.get_community_by_cid(cid).unwrap().unwrap();
        assert_eq!(found.id, community_row);
        assert_eq!(found.master, member_row);

        // Re-inserting the same master is idempotent, not a second row.
        let again = store
            .put_community(member_row, member_row, "c".into(), true)
            .unwrap();
        assert_eq!(again, community_row);

        let other_pk = PublicKey([10u8; 32]);
        let unknown_cid = MemberId::from_public_key(&other_pk.0);
        assert!(store.get_community_by_cid(unknown_cid).unwrap().is_none());
    }

    #[test]
    fn range_respects_modulo_and_direction() {
        let (_dir, store) = open_temp();
        let pk = PublicKey([4u8; 32]);
        let member_row = store.put_member(pk, None).unwrap();
        let community = MemberId::from_public_key(&pk.0);
        let community_row = store.put_community(member_row, member_row, "c".into(), true).unwrap();
        let meta_row = store.put_meta(community_row, "m".into(), 128, 1).unwrap();

        for gt in [10u64, 11, 12, 13, 14] {
            store
                .put_message(community, community_row, community, member_row, gt, meta_row, vec![gt as u8], None)
                .unwrap();
        }

        let rows = store.range(meta_row, 10, 14, 2, 0, true).unwrap();
        let gts: Vec<u64> = rows.iter().map(|r| r.global_time).collect();
        assert_eq!(gts, vec![10, 12, 14]);

        let desc = store.range(meta_row, 10, 14, 2, 0, false).unwrap();
        let gts_desc: Vec<u64> = desc.iter().map(|r| r.global_time).collect();
        assert_eq!(gts_desc, vec![14, 12, 10]);
    }

    #[test]
    fn mark_undone_updates_index() {
        let (_dir, store) = open_temp();
        let pk = PublicKey([5u8; 32]);
        let member_row = store.put_member(pk, None).unwrap();
        let community = MemberId::from_public_key(&pk.0);
        let community_row = store.put_community(member_row, member_row, "c".into(), true).unwrap();
        let meta_row = store.put_meta(community_row, "m".into(), 128, 1).unwrap();
        let id = store
            .put_message(community, community_row, community, member_row, 1, meta_row, vec![1], None)
            .unwrap();

        store.mark_undone(id, 999).unwrap();
        let row = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(row.undone, 999);
    }

    #[test]
    fn all_rows_for_community_ignores_other_communities() {
        let (_dir, store) = open_temp();
        let pk_a = PublicKey([1u8; 32]);
        let member_a = store.put_member(pk_a, None).unwrap();
        let community_a = MemberId::from_public_key(&pk_a.0);
        let row_a = store.put_community(member_a, member_a, "a".into(), true).unwrap();
        let meta_a = store.put_meta(row_a, "m".into(), 128, 1).unwrap();

        let pk_b = PublicKey([2u8; 32]);
        let member_b = store.put_member(pk_b, None).unwrap();
        let community_b = MemberId::from_public_key(&pk_b.0);
        let row_b = store.put_community(member_b, member_b, "b".into(), true).unwrap();
        let meta_b = store.put_meta(row_b, "m".into(), 128, 1).unwrap();

        for gt in [1u64, 2, 3] {
            store
                .put_message(community_a, row_a, community_a, member_a, gt, meta_a, vec![gt as u8], None)
                .unwrap();
        }
        store
            .put_message(community_b, row_b, community_b, member_b, 1, meta_b, vec![9], None)
            .unwrap();

        let rows = store.all_rows_for_community(community_a).unwrap();
        assert_eq!(rows.len(), 3);
    }
}
