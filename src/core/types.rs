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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Deterministic core data model: members, communities, meta-messages,
//! messages, and canonical encoding helpers.

use bincode::Options;
use ring::digest;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to serialize a value.
    #[error("serialization")]
    Serialize,
    /// Failed to deserialize bytes.
    #[error("deserialization")]
    Deserialize,
    /// Payload exceeded the configured size cap.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic, fixed-width integers).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation across builds.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use BTreeMap/BTreeSet).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts().serialize(v).map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap, both on the raw bytes and inside the decoder
/// (container-length bomb protection).
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// 20-byte member/community identifier: SHA-1 of the member's public key.
///
/// SHA-1 is used here only as a legacy, non-security-critical identifier
/// (a collision would at worst misname a member, not forge a signature);
/// every authentication signature in the system remains Ed25519.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub [u8; 20]);

impl MemberId {
    /// Derive a member id from raw Ed25519 public key bytes.
    pub fn from_public_key(pk: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, pk);
        let mut out = [0u8; 20];
        out.copy_from_slice(digest.as_ref());
        MemberId(out)
    }

    /// Hex representation, for logs.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A community is identified by its master member's [`MemberId`].
pub type CommunityId = MemberId;

/// Ed25519 public key bytes (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

/// Ed25519 signature bytes (64 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// The all-zero signature, used for an unfilled double-member auth slot.
    pub const ZERO: Signature = Signature([0u8; 64]);

    /// Whether this is the all-zero placeholder.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 64]
    }
}

/// A durable member record (as carried in the `member` table, see the store schema).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    /// Derived 20-byte identifier.
    pub mid: MemberId,
    /// Ed25519 public key.
    pub public_key: PublicKey,
    /// Private key material, present only when this peer holds it.
    pub private_key: Option<[u8; 32]>,
}

impl Member {
    /// Construct a public-only member record.
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            mid: MemberId::from_public_key(&public_key.0),
            public_key,
            private_key: None,
        }
    }
}

/// Name of a meta-message template within a community.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetaName(pub String);

impl std::fmt::Display for MetaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MetaName {
    fn from(s: &str) -> Self {
        MetaName(s.to_string())
    }
}

/// Authentication policy: how many members must co-sign an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthPolicy {
    /// Signed by a single member.
    Single,
    /// Signed by exactly two members (sequentially, via signature request/response).
    Double,
}

/// Resolution policy: how permission to create an instance is evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionPolicy {
    /// Anyone may create an instance.
    Public,
    /// Permission is linear: each (member, meta, action) triplet is granted
    /// or revoked explicitly, with a proof chain back to the master member.
    Linear,
    /// The effective policy (Public vs Linear) is itself determined at
    /// runtime by dynamic-settings messages.
    Dynamic,
}

/// Destination policy: who a message is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationPolicy {
    /// Broadcast to the whole community via anti-entropy sync.
    CommunityWide,
    /// Addressed to specific candidates; stored, but never offered by sync.
    Targeted,
}

/// Synchronisation direction used when ranging over a meta's messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Ascending global time.
    Asc,
    /// Descending global time.
    Desc,
    /// Unordered / random.
    Random,
}

/// Action evaluated by the timeline for a (member, meta) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimelineAction {
    /// May create an instance of the meta.
    Permit,
    /// May grant `Permit`/`Authorize`/`Revoke`/`Undo` to others.
    Authorize,
    /// May revoke a previously granted action from others.
    Revoke,
    /// May undo another member's message.
    Undo,
}

/// Degree of a destroy-community message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyDegree {
    /// Soft kill: stop synchronising, but keep local data.
    SoftKill,
    /// Hard kill: erase all messages except the destroy message and its proof chain.
    HardKill,
}

/// Typed payload carried by a message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    /// Grants `action` on `meta` to `target`.
    Authorize {
        /// Member receiving the grant.
        target: MemberId,
        /// Meta the grant applies to.
        meta: MetaName,
        /// Action granted.
        action: TimelineAction,
    },
    /// Revokes a previously granted action.
    Revoke {
        /// Member losing the grant.
        target: MemberId,
        /// Meta the revoke applies to.
        meta: MetaName,
        /// Action revoked.
        action: TimelineAction,
    },
    /// Changes the effective resolution policy of a dynamic meta.
    DynamicSettings {
        /// Meta whose policy changes.
        meta: MetaName,
        /// New effective policy.
        policy: ResolutionPolicy,
    },
    /// Invalidates one of the creator's own earlier messages.
    UndoOwn {
        /// Global time of the targeted message.
        target_global_time: u64,
    },
    /// Invalidates a third party's earlier message (requires `Undo` permission).
    UndoOther {
        /// Creator of the targeted message.
        target_member: MemberId,
        /// Global time of the targeted message.
        target_global_time: u64,
    },
    /// Destroys the community per `degree`.
    DestroyCommunity {
        /// Destruction degree.
        degree: DestroyDegree,
    },
    /// Opaque application-defined payload for ordinary metas.
    Data(Vec<u8>),
}

/// The authentication block of a message: one or two signing members.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuthBlock {
    /// Single-member authentication.
    Single {
        /// Signer's public key.
        member: PublicKey,
        /// Signature over the payload region.
        signature: Signature,
    },
    /// Double-member authentication. `second` is `None` for an "initial"
    /// signature request where only the first slot is filled.
    Double {
        /// First signer.
        first: (PublicKey, Signature),
        /// Second signer, once both have signed.
        second: Option<(PublicKey, Signature)>,
    },
}

impl AuthBlock {
    /// The set of members that have actually signed so far.
    pub fn signers(&self) -> Vec<MemberId> {
        match self {
            AuthBlock::Single { member, .. } => vec![MemberId::from_public_key(&member.0)],
            AuthBlock::Double { first, second } => {
                let mut v = vec![MemberId::from_public_key(&first.0 .0)];
                if let Some((pk, _)) = second {
                    v.push(MemberId::from_public_key(&pk.0));
                }
                v
            }
        }
    }

    /// The creator of record: the first signer.
    pub fn creator(&self) -> MemberId {
        match self {
            AuthBlock::Single { member, .. } => MemberId::from_public_key(&member.0),
            AuthBlock::Double { first, .. } => MemberId::from_public_key(&first.0 .0),
        }
    }

    /// Whether every required slot is filled.
    pub fn is_complete(&self) -> bool {
        match self {
            AuthBlock::Single { .. } => true,
            AuthBlock::Double { second, .. } => second.is_some(),
        }
    }
}

/// A decoded, signature-verified message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Owning community.
    pub community: CommunityId,
    /// Meta template this message instantiates.
    pub meta: MetaName,
    /// Global time: monotone per community.
    pub global_time: u64,
    /// Sequence number, for sequence-numbered metas.
    pub sequence_number: Option<u64>,
    /// Authentication block.
    pub auth: AuthBlock,
    /// Typed payload.
    pub payload: Payload,
    /// Raw encoded packet, as received or produced.
    pub packet: Vec<u8>,
}

impl Message {
    /// The message's creator (first/only signer).
    pub fn member(&self) -> MemberId {
        self.auth.creator()
    }

    /// The `(member, global_time)` uniqueness key.
    pub fn primary_key(&self) -> (MemberId, u64) {
        (self.member(), self.global_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_id_is_sha1_of_public_key() {
        let pk = PublicKey([7u8; 32]);
        let m = Member::from_public_key(pk);
        let expect = MemberId::from_public_key(&pk.0);
        assert_eq!(m.mid, expect);
        assert_eq!(m.mid.0.len(), 20);
    }

    #[test]
    fn canonical_roundtrip() {
        let payload = Payload::Data(vec![1, 2, 3]);
        let bytes = encode_canonical(&payload).unwrap();
        let back: Payload = decode_canonical_limited(&bytes, 1 << 16).unwrap();
        match back {
            Payload::Data(v) => assert_eq!(v, vec![1, 2, 3]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_rejects_oversized_input() {
        let payload = Payload::Data(vec![0u8; 128]);
        let bytes = encode_canonical(&payload).unwrap();
        let err = decode_canonical_limited::<Payload>(&bytes, 4).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge));
    }
}
