//! Peer Module - WebRTC Peer Connection
//!
//! Kapselt Negotiation, Candidate-Puffer und Track-Lifecycle.

pub mod manager;

pub use manager::{PeerConnectionManager, PeerError, PeerEvent};
