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

//! Wire encoding and decoding of messages: header, authentication block,
//! and signature verification over the header and payload.
//!
//! Layout: `cid(20) || meta_tag(u16 BE) || global_time(u64 BE) ||
//! dest_hints(u8) || [sequence_number(u64 BE)] || auth block ||
//! payload (bincode)`. The hints byte precedes the optional sequence
//! number so a decoder knows, before reading further, whether a
//! sequence number is present.
//!
//! Every signature in the auth block is computed over `header || payload`,
//! where `header` is everything up to (not including) the auth block
//! itself: cid, meta_tag, global_time, hints and the optional sequence
//! number. The auth block's own bytes (member pubkeys and signatures) are
//! never part of the signed message — see [`signing_message`]. This binds
//! a signature to the exact community, meta, global_time and sequence
//! number it was produced for, so a relay cannot re-wrap a validly-signed
//! payload under different header fields and still pass verification.

use ring::signature::{UnparsedPublicKey, ED25519};
use thiserror::Error;

use crate::core::types::{
    decode_canonical_limited, encode_canonical, AuthBlock, CommunityId, MemberId, MetaName,
    Payload, PublicKey, Signature,
};

/// Packets larger than this are rejected before any deserialization work
/// (matches the overlay's UDP-datagram-sized framing).
pub const MAX_PACKET_BYTES: usize = 65_476;

/// Decode/encode failures, matching the closed codec error taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The packet names a meta this community does not define.
    #[error("unknown meta tag {0}")]
    UnknownMeta(u16),
    /// At least one signature in the auth block failed to verify.
    #[error("bad signature")]
    BadSignature,
    /// The packet ended before all declared fields were read.
    #[error("truncated packet")]
    Truncated,
    /// The packet's `cid` prefix does not match the community it was
    /// decoded against.
    #[error("community mismatch")]
    CommunityMismatch,
}

/// A fully parsed wire header, prior to payload interpretation.
#[derive(Clone, Debug)]
pub struct Header {
    /// Community the packet belongs to.
    pub community: CommunityId,
    /// Resolved meta name.
    pub meta: MetaName,
    /// Monotone-per-community global time.
    pub global_time: u64,
    /// Sequence number, for sequence-numbered metas.
    pub sequence_number: Option<u64>,
}

/// Result of a successful decode.
#[derive(Clone, Debug)]
pub struct Decoded {
    /// Parsed header.
    pub header: Header,
    /// Authentication block (already signature-verified).
    pub auth: AuthBlock,
    /// Typed payload.
    pub payload: Payload,
}

fn read_exact<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    Ok(read_exact(buf, 1)?[0])
}

fn read_u16_be(buf: &mut &[u8]) -> Result<u16, CodecError> {
    let b = read_exact(buf, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn read_u64_be(buf: &mut &[u8]) -> Result<u64, CodecError> {
    let b = read_exact(buf, 8)?;
    Ok(u64::from_be_bytes(b.try_into().unwrap()))
}

fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], CodecError> {
    let s = read_exact(buf, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(s);
    Ok(out)
}

/// Destination hint flags carried in the header.
#[derive(Clone, Copy, Debug, Default)]
struct DestinationHints {
    has_sequence: bool,
    double_auth: bool,
}

impl DestinationHints {
    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.has_sequence {
            b |= 0b0000_0001;
        }
        if self.double_auth {
            b |= 0b0000_0010;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        DestinationHints {
            has_sequence: b & 0b0000_0001 != 0,
            double_auth: b & 0b0000_0010 != 0,
        }
    }
}

/// Write `cid || meta_tag || global_time || hints || [sequence_number]`
/// into `out`. Shared by [`encode`] and [`signing_message`] so the two
/// never drift apart.
fn write_header(
    out: &mut Vec<u8>,
    community: CommunityId,
    meta_tag: u16,
    global_time: u64,
    sequence_number: Option<u64>,
    double_auth: bool,
) {
    out.extend_from_slice(&community.0);
    out.extend_from_slice(&meta_tag.to_be_bytes());
    out.extend_from_slice(&global_time.to_be_bytes());

    let hints = DestinationHints {
        has_sequence: sequence_number.is_some(),
        double_auth,
    };
    out.push(hints.to_byte());
    if let Some(seq) = sequence_number {
        out.extend_from_slice(&seq.to_be_bytes());
    }
}

/// Build the exact byte string every auth-block signature is computed
/// over: the header (cid, meta_tag, global_time, hints, optional sequence
/// number) followed by the canonical payload encoding. Callers that sign
/// or verify a message by hand (outside of [`encode`]/[`decode`]) must use
/// this rather than signing the payload alone.
pub fn signing_message(
    community: CommunityId,
    meta_tag: u16,
    global_time: u64,
    sequence_number: Option<u64>,
    double_auth: bool,
    payload: &Payload,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(160);
    write_header(&mut out, community, meta_tag, global_time, sequence_number, double_auth);
    let payload_bytes = encode_canonical(payload).map_err(|_| CodecError::Truncated)?;
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Encode a message into its canonical wire form.
#[allow(clippy::too_many_arguments)]
pub fn encode(
    community: CommunityId,
    meta_tag: u16,
    global_time: u64,
    sequence_number: Option<u64>,
    auth: &AuthBlock,
    payload: &Payload,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(160);
    write_header(
        &mut out,
        community,
        meta_tag,
        global_time,
        sequence_number,
        matches!(auth, AuthBlock::Double { .. }),
    );

    match auth {
        AuthBlock::Single { member, signature } => {
            out.extend_from_slice(&member.0);
            out.extend_from_slice(&signature.0);
        }
        AuthBlock::Double { first, second } => {
            out.extend_from_slice(&first.0 .0);
            out.extend_from_slice(&first.1 .0);
            let (second_pk, second_sig) = second.unwrap_or((first.0, Signature::ZERO));
            out.extend_from_slice(&second_pk.0);
            out.extend_from_slice(&second_sig.0);
        }
    }

    let payload_bytes = encode_canonical(payload).map_err(|_| CodecError::Truncated)?;
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Decode a packet against a known community, verifying every signature
/// in the auth block against the reconstructed header-plus-payload
/// message (see [`signing_message`]).
///
/// `resolve_meta` maps a wire meta tag to its name, per the community's
/// schema; `max_payload` bounds the trailing bincode payload.
pub fn decode(
    expected_community: CommunityId,
    resolve_meta: impl Fn(u16) -> Option<MetaName>,
    bytes: &[u8],
    max_payload: usize,
) -> Result<Decoded, CodecError> {
    if bytes.len() > MAX_PACKET_BYTES {
        return Err(CodecError::Truncated);
    }
    let mut buf = bytes;

    let cid = MemberId(read_array::<20>(&mut buf)?);
    if cid != expected_community {
        return Err(CodecError::CommunityMismatch);
    }

    let meta_tag = read_u16_be(&mut buf)?;
    let meta = resolve_meta(meta_tag).ok_or(CodecError::UnknownMeta(meta_tag))?;

    let global_time = read_u64_be(&mut buf)?;
    let hints = DestinationHints::from_byte(read_u8(&mut buf)?);

    let sequence_number = if hints.has_sequence {
        Some(read_u64_be(&mut buf)?)
    } else {
        None
    };

    let auth = if hints.double_auth {
        let first_pk = PublicKey(read_array::<32>(&mut buf)?);
        let first_sig = Signature(read_array::<64>(&mut buf)?);
        let second_pk = PublicKey(read_array::<32>(&mut buf)?);
        let second_sig = Signature(read_array::<64>(&mut buf)?);
        let second = if second_sig.is_zero() {
            None
        } else {
            Some((second_pk, second_sig))
        };
        AuthBlock::Double {
            first: (first_pk, first_sig),
            second,
        }
    } else {
        let member = PublicKey(read_array::<32>(&mut buf)?);
        let signature = Signature(read_array::<64>(&mut buf)?);
        AuthBlock::Single { member, signature }
    };

    let payload_region = buf;

    let mut signed_message = Vec::with_capacity(bytes.len() - payload_region.len());
    write_header(
        &mut signed_message,
        cid,
        meta_tag,
        global_time,
        sequence_number,
        hints.double_auth,
    );
    signed_message.extend_from_slice(payload_region);
    verify_auth(&auth, &signed_message)?;

    let payload: Payload = decode_canonical_limited(payload_region, max_payload)
        .map_err(|_| CodecError::Truncated)?;

    Ok(Decoded {
        header: Header {
            community: cid,
            meta,
            global_time,
            sequence_number,
        },
        auth,
        payload,
    })
}

/// Splice a real public key and signature into the second slot of an
/// otherwise-encoded `Double`-auth packet, leaving everything else (first
/// signer's slot, header, payload) untouched.
///
/// Used by the responder side of a `dispersy-signature-request`: the
/// initiator sends a submessage with the second slot zeroed (per
/// [`encode`]'s convention), and the responder fills it in with its own
/// signature over the unchanged payload region before returning it.
pub fn complete_double_signature(
    packet: &[u8],
    second_pk: PublicKey,
    second_sig: Signature,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = packet;
    let _cid = read_array::<20>(&mut buf)?;
    let _meta_tag = read_u16_be(&mut buf)?;
    let _global_time = read_u64_be(&mut buf)?;
    let hints = DestinationHints::from_byte(read_u8(&mut buf)?);
    if !hints.double_auth {
        return Err(CodecError::Truncated);
    }
    if hints.has_sequence {
        let _ = read_u64_be(&mut buf)?;
    }
    let _first_pk = read_array::<32>(&mut buf)?;
    let _first_sig = read_array::<64>(&mut buf)?;
    let slot_offset = packet.len() - buf.len();
    if packet.len() < slot_offset + 32 + 64 {
        return Err(CodecError::Truncated);
    }
    let mut out = packet.to_vec();
    out[slot_offset..slot_offset + 32].copy_from_slice(&second_pk.0);
    out[slot_offset + 32..slot_offset + 96].copy_from_slice(&second_sig.0);
    Ok(out)
}

fn verify_one(pk: &PublicKey, sig: &Signature, message: &[u8]) -> Result<(), CodecError> {
    let key = UnparsedPublicKey::new(&ED25519, &pk.0[..]);
    key.verify(message, &sig.0[..])
        .map_err(|_| CodecError::BadSignature)
}

fn verify_auth(auth: &AuthBlock, payload: &[u8]) -> Result<(), CodecError> {
    match auth {
        AuthBlock::Single { member, signature } => verify_one(member, signature, payload),
        AuthBlock::Double { first, second } => {
            verify_one(&first.0, &first.1, payload)?;
            if let Some((pk, sig)) = second {
                verify_one(pk, sig, payload)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn roundtrip_single_auth() {
        let (kp, pk) = gen_key();
        let community = MemberId::from_public_key(&pk.0);
        let payload = Payload::Data(vec![9, 9, 9]);
        let message = signing_message(community, 7, 42, None, false, &payload).unwrap();
        let sig = Signature(kp.sign(&message).as_ref().try_into().unwrap());
        let auth = AuthBlock::Single {
            member: pk,
            signature: sig,
        };
        let bytes = encode(community, 7, 42, None, &auth, &payload).unwrap();
        let decoded = decode(community, |tag| (tag == 7).then(|| "test".into()), &bytes, 1 << 16)
            .unwrap();
        assert_eq!(decoded.header.global_time, 42);
        assert!(decoded.header.sequence_number.is_none());
    }

    #[test]
    fn bad_signature_rejected() {
        let (_kp, pk) = gen_key();
        let community = MemberId::from_public_key(&pk.0);
        let payload = Payload::Data(vec![1]);
        let auth = AuthBlock::Single {
            member: pk,
            signature: Signature::ZERO,
        };
        let bytes = encode(community, 1, 1, None, &auth, &payload).unwrap();
        let err = decode(community, |_| Some("test".into()), &bytes, 1 << 16).unwrap_err();
        assert_eq!(err, CodecError::BadSignature);
    }

    #[test]
    fn community_mismatch_rejected() {
        let (kp, pk) = gen_key();
        let community = MemberId::from_public_key(&pk.0);
        let other = MemberId([1u8; 20]);
        let payload = Payload::Data(vec![]);
        let message = signing_message(community, 1, 1, None, false, &payload).unwrap();
        let sig = Signature(kp.sign(&message).as_ref().try_into().unwrap());
        let auth = AuthBlock::Single {
            member: pk,
            signature: sig,
        };
        let bytes = encode(community, 1, 1, None, &auth, &payload).unwrap();
        let err = decode(other, |_| Some("test".into()), &bytes, 1 << 16).unwrap_err();
        assert_eq!(err, CodecError::CommunityMismatch);
    }

    #[test]
    fn complete_double_signature_fills_second_slot_and_verifies() {
        let (first_kp, first_pk) = gen_key();
        let (second_kp, second_pk) = gen_key();
        let community = MemberId::from_public_key(&first_pk.0);
        let payload = Payload::Data(vec![4, 2]);
        let message = signing_message(community, 3, 1, None, true, &payload).unwrap();
        let first_sig = Signature(first_kp.sign(&message).as_ref().try_into().unwrap());
        let auth = AuthBlock::Double {
            first: (first_pk, first_sig),
            second: None,
        };
        let unsigned = encode(community, 3, 1, None, &auth, &payload).unwrap();

        let second_sig = Signature(second_kp.sign(&message).as_ref().try_into().unwrap());
        let completed = complete_double_signature(&unsigned, second_pk, second_sig).unwrap();

        let decoded = decode(community, |tag| (tag == 3).then(|| "test".into()), &completed, 1 << 16)
            .unwrap();
        match decoded.auth {
            AuthBlock::Double { second: Some((pk, sig)), .. } => {
                assert_eq!(pk, second_pk);
                assert_eq!(sig, second_sig);
            }
            other => panic!("expected completed double auth, got {other:?}"),
        }
    }

    #[test]
    fn unknown_meta_rejected() {
        let (kp, pk) = gen_key();
        let community = MemberId::from_public_key(&pk.0);
        let payload = Payload::Data(vec![]);
        let message = signing_message(community, 5, 1, None, false, &payload).unwrap();
        let sig = Signature(kp.sign(&message).as_ref().try_into().unwrap());
        let auth = AuthBlock::Single {
            member: pk,
            signature: sig,
        };
        let bytes = encode(community, 5, 1, None, &auth, &payload).unwrap();
        let err = decode(community, |_| None, &bytes, 1 << 16).unwrap_err();
        assert_eq!(err, CodecError::UnknownMeta(5));
    }
}
