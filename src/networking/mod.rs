#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: libp2p transport and peer scoring.

pub mod bootstrap;
pub mod p2p;
pub mod p2p_identity;
pub mod peer_registry;
pub mod peer_score;
