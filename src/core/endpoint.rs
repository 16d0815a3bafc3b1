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

//! The `Endpoint` contract: datagram-style `send`/`on_data`, independent of
//! whichever transport carries the bytes. Production nodes wire this to the
//! libp2p request/response swarm (`networking::p2p`); tests use
//! [`NullEndpoint`] or [`ManualEndpoint`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::sync::Candidate;

/// Datagram-style transport contract a node hands its Dispatcher, matching
/// the overlay's `send(candidates, packets)` / `on_data(source, bytes)`
/// framing (20-byte `cid` prefix, optional 4-byte tunnel marker, packets
/// bounded to a single UDP datagram's worth of payload).
pub trait Endpoint: Send + Sync {
    /// Send `packets` to each of `candidates`.
    fn send(&self, candidates: &[Candidate], packets: &[Vec<u8>]);

    /// Number of distinct peers this endpoint currently considers live.
    fn peer_count(&self) -> usize {
        0
    }
}

/// Discards every send; counts them for assertions. Used by tests that
/// only care whether the pipeline *tried* to answer, not what was sent.
#[derive(Default)]
pub struct NullEndpoint {
    sent_packets: AtomicU64,
    sent_batches: AtomicU64,
}

impl NullEndpoint {
    /// A fresh, empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total packets handed to [`Endpoint::send`] so far.
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    /// Total [`Endpoint::send`] calls so far.
    pub fn sent_batches(&self) -> u64 {
        self.sent_batches.load(Ordering::Relaxed)
    }
}

impl Endpoint for NullEndpoint {
    fn send(&self, _candidates: &[Candidate], packets: &[Vec<u8>]) {
        self.sent_batches.fetch_add(1, Ordering::Relaxed);
        self.sent_packets
            .fetch_add(packets.len() as u64, Ordering::Relaxed);
    }
}

/// Exposes every send as `(candidates, packets)` on an in-process queue, for
/// tests that need to inspect exactly what was sent to whom.
#[derive(Default)]
pub struct ManualEndpoint {
    outbox: Mutex<Vec<(Vec<Candidate>, Vec<Vec<u8>>)>>,
}

impl ManualEndpoint {
    /// A fresh, empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every batch sent so far, oldest first.
    pub fn drain(&self) -> Vec<(Vec<Candidate>, Vec<Vec<u8>>)> {
        std::mem::take(&mut self.outbox.lock().expect("outbox mutex poisoned"))
    }
}

impl Endpoint for ManualEndpoint {
    fn send(&self, candidates: &[Candidate], packets: &[Vec<u8>]) {
        self.outbox
            .lock()
            .expect("outbox mutex poisoned")
            .push((candidates.to_vec(), packets.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sync::ConnectionType;

    fn candidate(port: u16) -> Candidate {
        Candidate {
            lan: format!("127.0.0.1:{port}").parse().unwrap(),
            wan: format!("127.0.0.1:{port}").parse().unwrap(),
            tunnel: false,
            connection_type: ConnectionType::Public,
        }
    }

    #[test]
    fn null_endpoint_counts_without_storing() {
        let ep = NullEndpoint::new();
        ep.send(&[candidate(1)], &[vec![1, 2], vec![3]]);
        ep.send(&[], &[vec![9]]);
        assert_eq!(ep.sent_batches(), 2);
        assert_eq!(ep.sent_packets(), 3);
    }

    #[test]
    fn manual_endpoint_drains_in_order() {
        let ep = ManualEndpoint::new();
        ep.send(&[candidate(1)], &[vec![1]]);
        ep.send(&[candidate(2)], &[vec![2]]);
        let drained = ep.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1, vec![vec![1]]);
        assert!(ep.drain().is_empty());
    }
}
