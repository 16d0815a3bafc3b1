#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Meshline node entrypoint (systemd-friendly).
//!
//! Loads configuration, opens the keystore and store, loads (or creates)
//! every configured community, and spawns the dispatcher/pipeline actor,
//! P2P transport, bootstrap refresh loop, and Prometheus metrics server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info, warn};

use meshline::config::Config;
use meshline::core::codec;
use meshline::core::community::{Community, MetaTemplate};
use meshline::core::dispatcher::{DispatchOutcome, Dispatcher};
use meshline::core::endpoint::Endpoint;
use meshline::core::pipeline::{meta_tag, Pipeline, StageOutcome};
use meshline::core::security::keystore::{FileEd25519Backend, Keystore};
use meshline::core::store::Store;
use meshline::core::sync::{
    answer_sync_window, decode_sync_message, encode_sync_message, mask_24bit, missing_identity,
    missing_message, missing_proof, missing_sequence, BloomFilter, Candidate, CandidateTable,
    ConnectionType, IntroductionRequest, IntroductionResponse, RepairThrottle, SignatureRequest,
    SignatureResponse, SignatureTracker, SyncMessage, SyncWindow,
};
use meshline::core::types::{AuthPolicy, MetaName, PublicKey};
use meshline::monitoring::metrics::Metrics;
use meshline::networking::bootstrap::{self, BootstrapHost};
use meshline::networking::p2p::{self, P2pConfig, P2pEndpoint, P2pEvent};

/// How often this node initiates an introduction round with a known
/// candidate per loaded community.
const WALKER_TICK: Duration = Duration::from_secs(5);

/// The meta-message templates this build knows how to hydrate a "chat"
/// community with. Real deployments would grow this registry (or load it
/// from a plugin) as new community classifications are supported.
fn classification_registry() -> BTreeMap<String, Vec<MetaTemplate>> {
    let mut registry = BTreeMap::new();
    registry.insert("chat".to_string(), vec![MetaTemplate::full_sync("message")]);
    registry
}

async fn serve_metrics(metrics: Arc<Metrics>, addr: std::net::SocketAddr) {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move {
                let encoder = TextEncoder::new();
                let families = metrics.registry.gather();
                let mut buf = Vec::new();
                if encoder.encode(&families, &mut buf).is_err() {
                    return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, String::new());
                }
                (axum::http::StatusCode::OK, String::from_utf8_lossy(&buf).into_owned())
            }
        }),
    );
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                error!(err = %e, "metrics server exited");
            }
        }
        Err(e) => error!(err = %e, %addr, "failed to bind metrics listener"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("MESHLINE_CONFIG").unwrap_or_else(|_| "meshline.toml".to_string());
    let cfg = Config::load(&config_path)?;
    let data_dir = cfg.data_dir_path()?;

    let keystore = Keystore::open(&cfg.data_dir).map_err(|e| anyhow::anyhow!("keystore open failed: {e}"))?;
    let store = Store::open(&data_dir).map_err(|e| anyhow::anyhow!("store open failed: {e}"))?;
    let metrics = Arc::new(Metrics::new().map_err(|e| anyhow::anyhow!("metrics init failed: {e}"))?);

    let registry = classification_registry();

    let mut loaded: BTreeMap<[u8; 20], Community> = BTreeMap::new();
    for community_cfg in &cfg.communities {
        let Some(templates) = registry.get(&community_cfg.classification) else {
            warn!(classification = %community_cfg.classification, "unknown classification; skipping");
            continue;
        };
        let master_pk = match &community_cfg.master_public_key {
            Some(hex_pk) => {
                let bytes = hex::decode(hex_pk).map_err(|_| anyhow::anyhow!("bad master_public_key hex"))?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("master_public_key must be 32 bytes"))?;
                PublicKey(arr)
            }
            None => PublicKey(keystore.public_key()),
        };
        let community = Community::load_or_create(
            &store,
            master_pk,
            community_cfg.classification.clone(),
            templates,
            true,
        )
        .map_err(|e| anyhow::anyhow!("failed to load community: {e}"))?;
        info!(cid = %hex::encode(community.cid.0), classification = %community_cfg.classification, "community loaded");
        loaded.insert(community.cid.0, community);
    }

    let mut dispatcher = Dispatcher::new(registry);
    let mut pipelines: BTreeMap<[u8; 20], Pipeline> =
        loaded.keys().map(|cid| (*cid, Pipeline::new())).collect();
    let mut candidate_tables: BTreeMap<[u8; 20], CandidateTable> =
        loaded.keys().map(|cid| (*cid, CandidateTable::new())).collect();
    let mut repair_throttles: BTreeMap<[u8; 20], RepairThrottle> =
        loaded.keys().map(|cid| (*cid, RepairThrottle::new())).collect();
    let mut sig_trackers: BTreeMap<[u8; 20], SignatureTracker> =
        loaded.keys().map(|cid| (*cid, SignatureTracker::new())).collect();

    let bootstrap_hosts: Vec<BootstrapHost> = cfg
        .bootstrap
        .iter()
        .filter_map(|s| BootstrapHost::parse(s).ok())
        .collect();
    let initial_bootstrap_multiaddrs: Vec<String> = bootstrap_hosts
        .iter()
        .map(|h| format!("/dns4/{}/tcp/{}", h.host, h.port))
        .collect();

    let p2p_cfg = P2pConfig {
        listen_addr: cfg.listen_addr.clone(),
        rendezvous_topic: cfg.rendezvous_topic.clone(),
        data_dir: cfg.data_dir.clone(),
        bootstrap: initial_bootstrap_multiaddrs,
        allow_peers: cfg.allow_peers.clone(),
    };
    let (endpoint, mut p2p_events, p2p_join) =
        p2p::spawn_p2p(p2p_cfg, metrics.clone()).map_err(|e| anyhow::anyhow!("p2p start failed: {e}"))?;
    let endpoint = Arc::new(endpoint);
    // Kept alongside the `Arc<dyn Endpoint>` shadow below: `send_sync_request`/
    // `reply_sync` are inherent to the concrete transport, not part of the
    // data-plane `Endpoint` trait.
    let sync_endpoint = endpoint.clone();

    if !bootstrap_hosts.is_empty() {
        let redial_endpoint = endpoint.clone();
        tokio::spawn(async move {
            bootstrap::run_refresh_loop(bootstrap_hosts, bootstrap::DEFAULT_REFRESH_INTERVAL, move |addrs| {
                info!(count = addrs.len(), "bootstrap addresses refreshed");
                for addr in addrs {
                    redial_endpoint.dial(addr);
                }
            })
            .await;
        });
    }

    let endpoint: Arc<dyn Endpoint> = endpoint;

    // This build has no NAT/STUN discovery of its own reachable address;
    // introduction requests/responses report this placeholder rather than a
    // real LAN/WAN pair. See DESIGN.md.
    let self_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();

    let metrics_addr: std::net::SocketAddr = cfg
        .metrics_addr
        .parse()
        .map_err(|_| anyhow::anyhow!("bad metrics_addr"))?;
    tokio::spawn(serve_metrics(metrics.clone(), metrics_addr));

    info!("meshline node started");

    let mut walker_tick = tokio::time::interval(WALKER_TICK);

    loop {
        tokio::select! {
            maybe_ev = p2p_events.recv() => {
                match maybe_ev {
                    Some(P2pEvent::PeerConnected(peer)) => {
                        info!(peer = %hex::encode(&peer), "peer connected");
                    }
                    Some(P2pEvent::PeerDisconnected(peer)) => {
                        info!(peer = %hex::encode(&peer), "peer disconnected");
                    }
                    Some(P2pEvent::FrameReceived { peer, frame }) => {
                        handle_frame(
                            &store, &mut dispatcher, &mut pipelines, &mut loaded,
                            &mut candidate_tables, &mut repair_throttles, &sync_endpoint,
                            &metrics, &peer, frame,
                        );
                    }
                    Some(P2pEvent::SyncRequestReceived { reply_token, frame, .. }) => {
                        let response = handle_sync_request(
                            &store, &mut dispatcher, &mut pipelines, &mut loaded,
                            &mut candidate_tables, &mut repair_throttles,
                            &keystore, &sync_endpoint, &metrics, self_addr, frame,
                        );
                        sync_endpoint.reply_sync(reply_token, response);
                    }
                    Some(P2pEvent::SyncResponseReceived { frame, .. }) => {
                        handle_sync_response(
                            &store, &mut dispatcher, &mut loaded, &mut pipelines,
                            &mut candidate_tables, &mut repair_throttles, &mut sig_trackers,
                            &sync_endpoint, &metrics, frame,
                        );
                    }
                    None => {
                        warn!("p2p event channel closed; shutting down");
                        break;
                    }
                }
            }
            _ = walker_tick.tick() => {
                walk_candidates(&store, &loaded, &mut candidate_tables, &sync_endpoint, self_addr);
                for table in candidate_tables.values_mut() {
                    table.expire_outstanding();
                }
                for tracker in sig_trackers.values_mut() {
                    tracker.expire();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    drop(endpoint);
    p2p_join.abort();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_frame(
    store: &Store,
    dispatcher: &mut Dispatcher,
    pipelines: &mut BTreeMap<[u8; 20], Pipeline>,
    loaded: &mut BTreeMap<[u8; 20], Community>,
    candidate_tables: &mut BTreeMap<[u8; 20], CandidateTable>,
    repair_throttles: &mut BTreeMap<[u8; 20], RepairThrottle>,
    sync_endpoint: &Arc<P2pEndpoint>,
    metrics: &Arc<Metrics>,
    peer: &[u8],
    frame: Vec<u8>,
) {
    let outcome = dispatcher.dispatch(store, 0, peer, frame, |cid| loaded.contains_key(&cid.0));
    match outcome {
        DispatchOutcome::Route { cid, packet } => {
            let Some(community) = loaded.get_mut(&cid.0) else {
                return;
            };
            let pipeline = pipelines.entry(cid.0).or_insert_with(Pipeline::new);
            let result = pipeline.ingest(community, store, 0, packet);
            repair_on_delay(cid, &result, candidate_tables, repair_throttles, sync_endpoint);
            report_pipeline_outcome(metrics, result);
        }
        DispatchOutcome::Loaded { community, packet } => {
            let cid = community.cid;
            loaded.insert(cid.0, *community);
            let parked = dispatcher.drain_pending(cid);
            if let Some(community) = loaded.get_mut(&cid.0) {
                let pipeline = pipelines.entry(cid.0).or_insert_with(Pipeline::new);
                let result = pipeline.ingest(community, store, 0, packet);
                repair_on_delay(cid, &result, candidate_tables, repair_throttles, sync_endpoint);
                report_pipeline_outcome(metrics, result);
                for (origin, packet) in parked {
                    let result = pipeline.ingest(community, store, origin, packet);
                    repair_on_delay(cid, &result, candidate_tables, repair_throttles, sync_endpoint);
                    report_pipeline_outcome(metrics, result);
                }
            }
        }
        DispatchOutcome::Malformed | DispatchOutcome::UnknownCommunity => {
            metrics.p2p_invalid_msg_total.inc();
        }
        DispatchOutcome::RateLimited => {
            metrics.p2p_rate_limited_total.inc();
        }
    }
    metrics.dispatcher_pending_frames.set(dispatcher.pending_len() as i64);
}

/// When a packet is suspended pending more information, ask a known
/// candidate for the missing piece over the sync transport, throttled to at
/// most one outstanding request per key per repair window.
fn repair_on_delay(
    cid: meshline::core::types::CommunityId,
    outcome: &StageOutcome,
    candidate_tables: &mut BTreeMap<[u8; 20], CandidateTable>,
    repair_throttles: &mut BTreeMap<[u8; 20], RepairThrottle>,
    sync_endpoint: &Arc<P2pEndpoint>,
) {
    use meshline::core::pipeline::DelayKind;

    let StageOutcome::Delayed(kind) = outcome else {
        return;
    };
    let (key, msg): (Vec<u8>, SyncMessage) = match kind {
        DelayKind::MissingIdentity(mid) => {
            let mut key = b"identity:".to_vec();
            key.extend_from_slice(&mid.0);
            let msg = SyncMessage::MissingIdentity {
                identifier: mask_24bit(rand::random()),
                mid: *mid,
            };
            (key, msg)
        }
        DelayKind::MissingSequence { member, meta, low, high } => {
            let mut key = b"sequence:".to_vec();
            key.extend_from_slice(&member.0);
            key.extend_from_slice(meta.0.as_bytes());
            let msg = SyncMessage::MissingSequence {
                identifier: mask_24bit(rand::random()),
                community: cid,
                member: *member,
                meta: meta.clone(),
                low: *low,
                high: *high,
            };
            (key, msg)
        }
        DelayKind::MissingProof { member, meta, action, global_time } => {
            let mut key = b"proof:".to_vec();
            key.extend_from_slice(&member.0);
            key.extend_from_slice(meta.0.as_bytes());
            let msg = SyncMessage::MissingProof {
                identifier: mask_24bit(rand::random()),
                community: cid,
                member: *member,
                meta: meta.clone(),
                action: *action,
                global_time: *global_time,
            };
            (key, msg)
        }
    };

    let throttle = repair_throttles.entry(cid.0).or_insert_with(RepairThrottle::new);
    if !throttle.should_request(key) {
        return;
    }
    let Some(table) = candidate_tables.get(&cid.0) else {
        return;
    };
    let no_one: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let Some(candidate) = table.pick_for_introduction(no_one, false) else {
        return;
    };
    if let Ok(bytes) = encode_sync_message(&msg) {
        sync_endpoint.send_sync_request(candidate.wan, bytes);
    }
}

/// Send an introduction request (carrying a sync window built from this
/// node's locally known packets) to one known candidate per loaded
/// community.
fn walk_candidates(
    store: &Store,
    loaded: &BTreeMap<[u8; 20], Community>,
    candidate_tables: &mut BTreeMap<[u8; 20], CandidateTable>,
    sync_endpoint: &Arc<P2pEndpoint>,
    self_addr: SocketAddr,
) {
    for (cid_bytes, community) in loaded {
        let cid = community.cid;
        let table = candidate_tables.entry(*cid_bytes).or_insert_with(CandidateTable::new);
        let Some(candidate) = table.pick_for_introduction(self_addr, false) else {
            continue;
        };

        let rows = match store.all_rows_for_community(cid) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(err = %e, "failed to list community rows for sync window");
                continue;
            }
        };
        let mut packets = Vec::with_capacity(rows.len());
        for row_id in rows {
            if let Ok(Some(row)) = store.get_by_id(row_id) {
                if row.undone == 0 {
                    packets.push(row.packet);
                }
            }
        }
        let salt: u8 = rand::random();
        let bloom = BloomFilter::from_items(packets.iter().map(|p| p.as_slice()), salt);

        let identifier = mask_24bit(rand::random());
        table.track_outstanding(identifier);
        let request = IntroductionRequest {
            lan_address: self_addr,
            wan_address: self_addr,
            tunnel: false,
            connection_type: ConnectionType::Unknown,
            identifier,
            sync: Some(SyncWindow {
                time_low: 0,
                time_high: community.current_gt(),
                modulo: 0,
                offset: 0,
                bloom,
            }),
        };
        let msg = SyncMessage::Introduce { community: cid, request };
        if let Ok(bytes) = encode_sync_message(&msg) {
            // `send_sync_request` itself counts toward
            // `sync_rounds_initiated_total` once the swarm task actually
            // dispatches it; counting here too would double it.
            sync_endpoint.send_sync_request(candidate.wan, bytes);
        }
    }
}

/// Answer an inbound sync control-plane request, returning the encoded
/// response frame (empty if the request could not be decoded or answered).
#[allow(clippy::too_many_arguments)]
fn handle_sync_request(
    store: &Store,
    dispatcher: &mut Dispatcher,
    pipelines: &mut BTreeMap<[u8; 20], Pipeline>,
    loaded: &mut BTreeMap<[u8; 20], Community>,
    candidate_tables: &mut BTreeMap<[u8; 20], CandidateTable>,
    repair_throttles: &mut BTreeMap<[u8; 20], RepairThrottle>,
    keystore: &Keystore<FileEd25519Backend>,
    sync_endpoint: &Arc<P2pEndpoint>,
    metrics: &Arc<Metrics>,
    self_addr: SocketAddr,
    frame: Vec<u8>,
) -> Vec<u8> {
    let Ok(msg) = decode_sync_message(&frame) else {
        return Vec::new();
    };
    let response = match msg {
        SyncMessage::Introduce { community, request } => {
            let table = candidate_tables.entry(community.0).or_insert_with(CandidateTable::new);
            table.observe(Candidate {
                lan: request.lan_address,
                wan: request.wan_address,
                tunnel: request.tunnel,
                connection_type: request.connection_type,
            });
            let introduced = table.pick_for_introduction(request.wan_address, request.tunnel);
            // A request/response round trip only carries one reply, so the
            // sync window's packets (if any) ride a follow-up push sent
            // back at the requester's reported address rather than the
            // introduction response itself.
            if let (Some(window), Some(community_obj)) = (&request.sync, loaded.get(&community.0)) {
                if let Ok(packets) = answer_sync_window(community_obj, store, window) {
                    if !packets.is_empty() {
                        let push = SyncMessage::Messages { identifier: request.identifier, packets };
                        if let Ok(bytes) = encode_sync_message(&push) {
                            sync_endpoint.send_sync_request(request.wan_address, bytes);
                        }
                    }
                }
            }
            SyncMessage::Introduced {
                community,
                response: IntroductionResponse {
                    lan_address: self_addr,
                    wan_address: self_addr,
                    tunnel: false,
                    connection_type: ConnectionType::Unknown,
                    identifier: request.identifier,
                    introduced,
                },
            }
        }
        SyncMessage::MissingIdentity { identifier, mid } => {
            let public_key = missing_identity(store, mid).unwrap_or(None);
            SyncMessage::Identity { identifier, public_key }
        }
        SyncMessage::MissingMessage { identifier, community, member, global_times } => {
            let packets = missing_message(store, community, member, &global_times).unwrap_or_default();
            SyncMessage::Messages { identifier, packets }
        }
        SyncMessage::MissingSequence { identifier, community, member, meta, low, high } => {
            let packets = (|| -> Option<Vec<Vec<u8>>> {
                let community_obj = loaded.get(&community.0)?;
                let meta_row = community_obj.meta(&meta)?.row_id;
                let member_row = store.get_member_by_mid(member).ok()??.id;
                missing_sequence(store, meta_row, member_row, low, high).ok()
            })()
            .unwrap_or_default();
            SyncMessage::Messages { identifier, packets }
        }
        SyncMessage::MissingProof { identifier, community, member, meta, action, global_time } => {
            let packets = (|| -> Option<Vec<Vec<u8>>> {
                let community_obj = loaded.get(&community.0)?;
                missing_proof(community_obj, store, member, &meta, action, global_time).ok()
            })()
            .unwrap_or_default();
            SyncMessage::Messages { identifier, packets }
        }
        SyncMessage::SignatureRequest { community, request } => {
            let response_submsg = (|| -> Option<Vec<u8>> {
                let community_obj = loaded.get(&community.0)?;
                let resolve_meta = |tag: u16| -> Option<MetaName> {
                    community_obj.metas().find(|m| meta_tag(&m.name) == tag).map(|m| m.name.clone())
                };
                let decoded = codec::decode(community, resolve_meta, &request.submsg, 1 << 16).ok()?;
                let meta = community_obj.meta(&decoded.header.meta)?;
                if !matches!(meta.auth, AuthPolicy::Double) {
                    return None;
                }
                let tag = meta_tag(&decoded.header.meta);
                let message = codec::signing_message(
                    community,
                    tag,
                    decoded.header.global_time,
                    decoded.header.sequence_number,
                    true,
                    &decoded.payload,
                )
                .ok()?;
                let sig = keystore.sign(&message).ok()?;
                let my_pk = PublicKey(keystore.public_key());
                codec::complete_double_signature(&request.submsg, my_pk, sig).ok()
            })();
            SyncMessage::SignatureResponse {
                community,
                response: SignatureResponse { identifier: request.identifier, submsg: response_submsg },
            }
        }
        // A follow-up push from a peer that answered our own introduction
        // request (see the `Messages` push in the `Introduce` branch
        // above): run every packet through the ordinary pipeline, then ack
        // with nothing so the request/response channel closes.
        SyncMessage::Messages { packets, .. } => {
            for packet in packets {
                handle_frame(
                    store, dispatcher, pipelines, loaded, candidate_tables, repair_throttles,
                    sync_endpoint, metrics, b"sync-push", packet,
                );
            }
            return Vec::new();
        }
        // Responses arriving on the request side of the protocol shouldn't
        // happen; acknowledge with nothing rather than leak the channel.
        SyncMessage::Introduced { .. } | SyncMessage::Identity { .. } | SyncMessage::SignatureResponse { .. } => {
            return Vec::new()
        }
    };
    encode_sync_message(&response).unwrap_or_default()
}

/// Handle the answer to a sync control-plane request this node initiated.
#[allow(clippy::too_many_arguments)]
fn handle_sync_response(
    store: &Store,
    dispatcher: &mut Dispatcher,
    loaded: &mut BTreeMap<[u8; 20], Community>,
    pipelines: &mut BTreeMap<[u8; 20], Pipeline>,
    candidate_tables: &mut BTreeMap<[u8; 20], CandidateTable>,
    repair_throttles: &mut BTreeMap<[u8; 20], RepairThrottle>,
    sig_trackers: &mut BTreeMap<[u8; 20], SignatureTracker>,
    sync_endpoint: &Arc<P2pEndpoint>,
    metrics: &Arc<Metrics>,
    frame: Vec<u8>,
) {
    let Ok(msg) = decode_sync_message(&frame) else {
        return;
    };
    match msg {
        SyncMessage::Introduced { community, response } => {
            let table = candidate_tables.entry(community.0).or_insert_with(CandidateTable::new);
            table.resolve_outstanding(response.identifier);
            if let Some(candidate) = response.introduced {
                table.observe(candidate);
            }
        }
        SyncMessage::Identity { public_key, .. } => {
            if let Some(pk) = public_key {
                let _ = store.put_member(pk, None);
            }
        }
        SyncMessage::Messages { packets, .. } => {
            for packet in packets {
                handle_frame(
                    store, dispatcher, pipelines, loaded, candidate_tables, repair_throttles,
                    sync_endpoint, metrics, b"sync-repair", packet,
                );
            }
        }
        SyncMessage::SignatureResponse { community, response } => {
            if let Some(tracker) = sig_trackers.get_mut(&community.0) {
                if let Some((_orig, Some(completed), _modified)) = tracker.resolve(&response) {
                    handle_frame(
                        store, dispatcher, pipelines, loaded, candidate_tables, repair_throttles,
                        sync_endpoint, metrics, b"sync-cosign", completed,
                    );
                }
            }
        }
        SyncMessage::Introduce { .. }
        | SyncMessage::MissingIdentity { .. }
        | SyncMessage::MissingMessage { .. }
        | SyncMessage::MissingSequence { .. }
        | SyncMessage::MissingProof { .. }
        | SyncMessage::SignatureRequest { .. } => {
            // A peer addressed these as a response on this node's initiated
            // request; shouldn't happen over a well-formed request/response
            // round trip. Ignore rather than guess at a reply.
        }
    }
}

fn report_pipeline_outcome(metrics: &Arc<Metrics>, outcome: StageOutcome) {
    match outcome {
        StageOutcome::Accepted(_) => metrics.pipeline_accepted_total.inc(),
        StageOutcome::Dropped(reason) => metrics
            .pipeline_dropped_total
            .with_label_values(&[drop_reason_label(&reason)])
            .inc(),
        StageOutcome::Delayed(kind) => metrics
            .pipeline_delayed_total
            .with_label_values(&[delay_kind_label(&kind)])
            .inc(),
        StageOutcome::Fatal(reason) => {
            error!(?reason, "community pipeline hit a fatal error");
        }
    }
}

fn drop_reason_label(reason: &meshline::core::pipeline::DropReason) -> &'static str {
    use meshline::core::pipeline::DropReason;
    match reason {
        DropReason::Codec(_) => "codec",
        DropReason::Duplicate => "duplicate",
        DropReason::DistributionConflict => "distribution_conflict",
        DropReason::PermissionDenied => "permission_denied",
    }
}

fn delay_kind_label(kind: &meshline::core::pipeline::DelayKind) -> &'static str {
    use meshline::core::pipeline::DelayKind;
    match kind {
        DelayKind::MissingIdentity(_) => "missing_identity",
        DelayKind::MissingSequence { .. } => "missing_sequence",
        DelayKind::MissingProof { .. } => "missing_proof",
    }
}
