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

//! Prometheus metrics for the overlay: pipeline accept/drop/delay counts,
//! sync round-trip counts, the dispatcher's delay-queue size, and p2p
//! transport health.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected peers gauge.
    pub p2p_peers: IntGauge,
    /// Invalid decoded frames.
    pub p2p_invalid_msg_total: IntCounter,
    /// Rate-limited frames.
    pub p2p_rate_limited_total: IntCounter,
    /// Banned peer events.
    pub p2p_banned_total: IntCounter,

    /// Packets accepted by the pipeline.
    pub pipeline_accepted_total: IntCounter,
    /// Packets dropped outright, by [`crate::core::pipeline::DropReason`] variant.
    pub pipeline_dropped_total: IntCounterVec,
    /// Packets delayed pending more information, by [`crate::core::pipeline::DelayKind`] variant.
    pub pipeline_delayed_total: IntCounterVec,

    /// Anti-entropy sync rounds this node initiated.
    pub sync_rounds_initiated_total: IntCounter,
    /// Anti-entropy sync rounds this node answered.
    pub sync_rounds_answered_total: IntCounter,
    /// Packets withheld from a sync answer because the requester's bloom
    /// filter already claimed to have them.
    pub sync_bloom_excluded_total: IntCounter,

    /// Frames currently parked in the dispatcher waiting on a community load.
    pub dispatcher_pending_frames: IntGauge,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let p2p_peers =
            IntGauge::new("meshline_p2p_peers", "Connected peers").map_err(|_| MetricsError::Prom)?;
        let p2p_invalid_msg_total = IntCounter::new(
            "meshline_p2p_invalid_msg_total",
            "Invalid decoded frames",
        )
        .map_err(|_| MetricsError::Prom)?;
        let p2p_rate_limited_total =
            IntCounter::new("meshline_p2p_rate_limited_total", "Rate-limited frames")
                .map_err(|_| MetricsError::Prom)?;
        let p2p_banned_total = IntCounter::new("meshline_p2p_banned_total", "Banned peer events")
            .map_err(|_| MetricsError::Prom)?;

        let pipeline_accepted_total = IntCounter::new(
            "meshline_pipeline_accepted_total",
            "Packets accepted by the pipeline",
        )
        .map_err(|_| MetricsError::Prom)?;
        let pipeline_dropped_total = IntCounterVec::new(
            Opts::new(
                "meshline_pipeline_dropped_total",
                "Packets dropped outright, by reason",
            ),
            &["reason"],
        )
        .map_err(|_| MetricsError::Prom)?;
        let pipeline_delayed_total = IntCounterVec::new(
            Opts::new(
                "meshline_pipeline_delayed_total",
                "Packets delayed pending more information, by kind",
            ),
            &["kind"],
        )
        .map_err(|_| MetricsError::Prom)?;

        let sync_rounds_initiated_total = IntCounter::new(
            "meshline_sync_rounds_initiated_total",
            "Anti-entropy sync rounds initiated",
        )
        .map_err(|_| MetricsError::Prom)?;
        let sync_rounds_answered_total = IntCounter::new(
            "meshline_sync_rounds_answered_total",
            "Anti-entropy sync rounds answered",
        )
        .map_err(|_| MetricsError::Prom)?;
        let sync_bloom_excluded_total = IntCounter::new(
            "meshline_sync_bloom_excluded_total",
            "Packets withheld from a sync answer due to the requester's bloom filter",
        )
        .map_err(|_| MetricsError::Prom)?;

        let dispatcher_pending_frames = IntGauge::new(
            "meshline_dispatcher_pending_frames",
            "Frames parked waiting on a community load",
        )
        .map_err(|_| MetricsError::Prom)?;

        registry.register(Box::new(p2p_peers.clone())).map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_invalid_msg_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_rate_limited_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_banned_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(pipeline_accepted_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(pipeline_dropped_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(pipeline_delayed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sync_rounds_initiated_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sync_rounds_answered_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(sync_bloom_excluded_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(dispatcher_pending_frames.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            p2p_peers,
            p2p_invalid_msg_total,
            p2p_rate_limited_total,
            p2p_banned_total,
            pipeline_accepted_total,
            pipeline_dropped_total,
            pipeline_delayed_total,
            sync_rounds_initiated_total,
            sync_rounds_answered_total,
            sync_bloom_excluded_total,
            dispatcher_pending_frames,
        })
    }
}
