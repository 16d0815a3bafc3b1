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

//! Meshline - a gossip-style overlay for permissioned communities.
//!
//! This crate provides:
//! - A canonical wire codec and member/meta/message data model
//! - A permission timeline (authorize/revoke/undo chains with deterministic
//!   tie-breaking, rooted at a community's master member)
//! - Pluggable distribution policies (full sync, last-N, sequence-gap
//!   aware, pruned) enforced at message-acceptance time
//! - A sled-backed store emulating the overlay's relational schema
//! - A 9-stage ingress pipeline from raw packet to persisted message
//! - Bloom-filter anti-entropy sync and the `missing-*`/signature-request
//!   repair sub-protocols
//! - A `cid`-keyed dispatcher that demultiplexes inbound frames across
//!   loaded (and auto-loadable) communities
//! - Encrypted P2P transport (libp2p Noise + Yamux) with peer scoring and
//!   bootstrap discovery
//! - Monitoring via Prometheus metrics and structured logging

/// Node configuration (`meshline.toml` plus env var overrides).
pub mod config;
/// Core protocol primitives (data model, codec, timeline, distribution,
/// store, community context, pipeline, dispatcher, sync, security).
pub mod core;
/// Observability (Prometheus metrics).
pub mod monitoring;
/// P2P networking stack (libp2p transport, scoring, bootstrap, anti-abuse).
pub mod networking;
