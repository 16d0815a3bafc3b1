#![forbid(unsafe_code)]

//! End-to-end pipeline scenarios: a single community, driven entirely
//! through `Pipeline::ingest`, covering the cross-stage interactions that
//! a single-module unit test can't exercise on its own.

use meshline::core::codec::encode;
use meshline::core::community::{Community, Meta, MetaTemplate};
use meshline::core::distribution::DistributionPolicy;
use meshline::core::pipeline::{DelayKind, DropReason, Pipeline, StageOutcome};
use meshline::core::store::Store;
use meshline::core::types::{
    AuthBlock, AuthPolicy, DestinationPolicy, MemberId, MetaName, Payload, PublicKey,
    ResolutionPolicy, Signature, SyncDirection, TimelineAction,
};
use ring::signature::{Ed25519KeyPair, KeyPair};

fn gen_key() -> (Ed25519KeyPair, PublicKey) {
    let rng = ring::rand::SystemRandom::new();
    let doc = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
    let kp = Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap();
    let mut pk = [0u8; 32];
    pk.copy_from_slice(kp.public_key().as_ref());
    (kp, PublicKey(pk))
}

fn tag(name: &MetaName) -> u16 {
    meshline::core::pipeline::meta_tag(name)
}

fn sign_packet(
    kp: &Ed25519KeyPair,
    pk: PublicKey,
    community: MemberId,
    meta_name: &MetaName,
    global_time: u64,
    sequence_number: Option<u64>,
    payload: Payload,
) -> Vec<u8> {
    let meta_tag = tag(meta_name);
    let message = meshline::core::codec::signing_message(
        community,
        meta_tag,
        global_time,
        sequence_number,
        false,
        &payload,
    )
    .unwrap();
    let sig = Signature(kp.sign(&message).as_ref().try_into().unwrap());
    let auth = AuthBlock::Single {
        member: pk,
        signature: sig,
    };
    encode(community, meta_tag, global_time, sequence_number, &auth, &payload).unwrap()
}

/// Builds a fresh community with one master member and, optionally, extra
/// members already registered (so identity resolution never has to park).
struct Harness {
    dir: tempfile::TempDir,
    store: Store,
    community: Community,
    master_kp: Ed25519KeyPair,
    master_pk: PublicKey,
    master: MemberId,
}

impl Harness {
    fn new() -> Self {
        let (master_kp, master_pk) = gen_key();
        let master = MemberId::from_public_key(&master_pk.0);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let master_row = store.put_member(master_pk, None).unwrap();
        let community_row = store
            .put_community(master_row, master_row, "test".into(), true)
            .unwrap();
        let community = Community::new(master, community_row, master, "test".into(), true);
        Harness {
            dir,
            store,
            community,
            master_kp,
            master_pk,
            master,
        }
    }

    fn add_meta(&mut self, name: &str, template: MetaTemplate) {
        let meta_name: MetaName = name.into();
        let row_id = self
            .store
            .put_meta(self.community.row_id, meta_name.clone(), template.priority, 1)
            .unwrap();
        self.community.add_meta(Meta {
            row_id,
            name: meta_name,
            auth: template.auth,
            resolution: template.resolution,
            distribution: template.distribution,
            destination: template.destination,
            priority: template.priority,
            direction: template.direction,
        });
    }
}

/// One batch of ten identical duplicate frames collapses to a single
/// accepted row; every repeat after the first is dropped as a duplicate.
#[test]
fn one_batch_ten_duplicates_collapses_to_single_accept() {
    let mut h = Harness::new();
    h.add_meta("chat", MetaTemplate::full_sync("chat"));
    let meta_name: MetaName = "chat".into();

    let packet = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &meta_name,
        1,
        None,
        Payload::Data(b"hello".to_vec()),
    );

    let mut pipeline = Pipeline::new();
    let first = pipeline.ingest(&mut h.community, &h.store, 0, packet.clone());
    let row_id = match first {
        StageOutcome::Accepted(id) => id,
        other => panic!("expected first copy accepted, got {other:?}"),
    };

    for _ in 0..9 {
        let outcome = pipeline.ingest(&mut h.community, &h.store, 0, packet.clone());
        assert!(
            matches!(outcome, StageOutcome::Dropped(DropReason::Duplicate)),
            "expected duplicate, got {outcome:?}"
        );
    }

    let stored = h.store.get_by_id(row_id).unwrap().expect("row persisted");
    assert_eq!(stored.packet, packet);
    drop(h.dir);
}

/// A sequence-numbered meta delays a message that arrives ahead of a gap,
/// then accepts the whole run once the missing sequence numbers land.
#[test]
fn sequence_gap_then_repair_drains_parked_packets() {
    let mut h = Harness::new();
    h.add_meta(
        "log",
        MetaTemplate {
            name: "log".into(),
            auth: AuthPolicy::Single,
            resolution: ResolutionPolicy::Public,
            distribution: DistributionPolicy::FullSyncWithSequence,
            destination: DestinationPolicy::CommunityWide,
            priority: 128,
            direction: SyncDirection::Asc,
        },
    );
    let meta_name: MetaName = "log".into();
    let mut pipeline = Pipeline::new();

    // seq=1 accepted normally.
    let seq1 = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &meta_name,
        1,
        Some(1),
        Payload::Data(vec![1]),
    );
    assert!(matches!(
        pipeline.ingest(&mut h.community, &h.store, 0, seq1),
        StageOutcome::Accepted(_)
    ));

    // seq=4 arrives ahead of a gap (2, 3 missing): delayed.
    let seq4 = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &meta_name,
        4,
        Some(4),
        Payload::Data(vec![4]),
    );
    let outcome = pipeline.ingest(&mut h.community, &h.store, 0, seq4.clone());
    match &outcome {
        StageOutcome::Delayed(DelayKind::MissingSequence { low, high, .. }) => {
            assert_eq!(*low, 2);
            assert_eq!(*high, 3);
        }
        other => panic!("expected a missing-sequence delay, got {other:?}"),
    }

    // The repair sub-protocol supplies seq=2 and seq=3.
    for seq in [2u64, 3u64] {
        let packet = sign_packet(
            &h.master_kp,
            h.master_pk,
            h.master,
            &meta_name,
            seq,
            Some(seq),
            Payload::Data(vec![seq as u8]),
        );
        assert!(matches!(
            pipeline.ingest(&mut h.community, &h.store, 0, packet),
            StageOutcome::Accepted(_)
        ));
    }

    // Once the gap is closed, re-running the parked seq=4 packet succeeds.
    let resumed = pipeline.resolve_sequence(h.master, &meta_name);
    assert_eq!(resumed.len(), 1);
    for ctx in resumed {
        assert!(matches!(
            pipeline.ingest(&mut h.community, &h.store, ctx.origin, ctx.packet),
            StageOutcome::Accepted(_)
        ));
    }

    let last = h.store.last_sequence(h.community.meta(&meta_name).unwrap().row_id, h
        .store
        .get_member_by_mid(h.master)
        .unwrap()
        .unwrap()
        .id)
        .unwrap();
    assert_eq!(last, Some(4));
}

/// A `Linear`-resolution meta gates on the timeline: a non-master member
/// is delayed for missing proof until an `Authorize` message grants them
/// `Permit`, at which point the parked message drains and is accepted.
#[test]
fn missing_proof_then_authorize_drains_parked_packet() {
    let mut h = Harness::new();
    h.add_meta(
        "decision",
        MetaTemplate {
            name: "decision".into(),
            auth: AuthPolicy::Single,
            resolution: ResolutionPolicy::Linear,
            distribution: DistributionPolicy::FullSync,
            destination: DestinationPolicy::CommunityWide,
            priority: 128,
            direction: SyncDirection::Asc,
        },
    );
    let decision_name: MetaName = "decision".into();

    let (alice_kp, alice_pk) = gen_key();
    let alice = MemberId::from_public_key(&alice_pk.0);
    h.store.put_member(alice_pk, None).unwrap();

    let mut pipeline = Pipeline::new();

    // Alice tries to post before being granted Permit: parked for proof.
    let alice_packet = sign_packet(
        &alice_kp,
        alice_pk,
        h.master,
        &decision_name,
        10,
        None,
        Payload::Data(b"vote".to_vec()),
    );
    let outcome = pipeline.ingest(&mut h.community, &h.store, 7, alice_packet.clone());
    assert!(matches!(
        outcome,
        StageOutcome::Delayed(DelayKind::MissingProof { member, .. }) if member == alice
    ));

    // The master authorizes Alice to Permit on "decision" at gt=11.
    let authorize_payload = Payload::Authorize {
        target: alice,
        meta: decision_name.clone(),
        action: TimelineAction::Permit,
    };
    let authorize_packet = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &decision_name,
        11,
        None,
        authorize_payload,
    );
    assert!(matches!(
        pipeline.ingest(&mut h.community, &h.store, 0, authorize_packet),
        StageOutcome::Accepted(_)
    ));

    // The parked packet, carrying global_time=10, still predates the
    // grant's effective global_time=12 (grants take effect from gt+1), so
    // draining it now must still delay it rather than accept it.
    let parked = pipeline.resolve_proof(alice, &decision_name);
    assert_eq!(parked.len(), 1);
    let retry = pipeline.ingest(&mut h.community, &h.store, 7, parked[0].packet.clone());
    assert!(matches!(retry, StageOutcome::Delayed(DelayKind::MissingProof { .. })));

    // A fresh message at a global_time after the grant takes effect is
    // accepted.
    let alice_packet_after = sign_packet(
        &alice_kp,
        alice_pk,
        h.master,
        &decision_name,
        12,
        None,
        Payload::Data(b"vote-again".to_vec()),
    );
    assert!(matches!(
        pipeline.ingest(&mut h.community, &h.store, 7, alice_packet_after),
        StageOutcome::Accepted(_)
    ));
}

/// Two different members each try to undo the same message; the
/// lexicographically smaller undo packet wins and the loser is itself
/// marked undone by the winner, deterministically regardless of arrival
/// order.
#[test]
fn undo_twice_lower_packet_wins_regardless_of_order() {
    let mut h = Harness::new();
    h.add_meta("chat", MetaTemplate::full_sync("chat"));
    let chat_name: MetaName = "chat".into();

    let mut pipeline = Pipeline::new();
    let target_packet = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &chat_name,
        1,
        None,
        Payload::Data(b"oops".to_vec()),
    );
    assert!(matches!(
        pipeline.ingest(&mut h.community, &h.store, 0, target_packet),
        StageOutcome::Accepted(_)
    ));

    // Two UndoOwn messages at different global times target the same
    // message; only their encoded bytes differ (global_time is part of
    // the signed wire form), so comparing `packet < packet` is
    // well-defined and deterministic.
    let undo_a = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &chat_name,
        2,
        None,
        Payload::UndoOwn {
            target_global_time: 1,
        },
    );
    let undo_b = sign_packet(
        &h.master_kp,
        h.master_pk,
        h.master,
        &chat_name,
        3,
        None,
        Payload::UndoOwn {
            target_global_time: 1,
        },
    );

    // Deliver the *larger* packet first, chronologically, then the
    // smaller one, so the test actually exercises "lower wins regardless
    // of arrival order" rather than just "lower wins when it arrives
    // first".
    let (smaller, larger) = if undo_a < undo_b {
        (undo_a.clone(), undo_b.clone())
    } else {
        (undo_b.clone(), undo_a.clone())
    };

    let larger_id = match pipeline.ingest(&mut h.community, &h.store, 0, larger) {
        StageOutcome::Accepted(id) => id,
        other => panic!("expected first-arriving undo accepted, got {other:?}"),
    };
    let smaller_id = match pipeline.ingest(&mut h.community, &h.store, 0, smaller.clone()) {
        StageOutcome::Accepted(id) => id,
        other => panic!("expected second-arriving undo accepted, got {other:?}"),
    };

    let target_row = h
        .store
        .get_by_key(h.community.cid, h.master, 1)
        .unwrap()
        .expect("target still stored");
    assert_eq!(target_row.undone, smaller_id);

    let loser_row = h.store.get_by_id(larger_id).unwrap().expect("loser stored");
    assert_eq!(loser_row.undone, smaller_id);
    assert_eq!(smaller, h.store.get_by_id(smaller_id).unwrap().unwrap().packet);
}
