//! Call Engine Module - WebRTC-Verhandlung und Recovery
//!
//! Dieses Modul verwaltet:
//! - WebRTC Peer Connections (Offer/Answer, ICE)
//! - Die Verbindungs-Zustandsmaschine pro Call-Versuch
//! - ICE-Watchdogs und automatische Restarts
//! - SDP-Shaping (Codec-Präferenz, Bitraten-Deckel)

mod config;
mod context;
mod engine;
mod events;
mod sdp;

pub use config::EngineConfig;
pub use engine::{CallEngine, CallEngineError};
pub use events::{CallEvent, ConnectionState, SdpKind};
