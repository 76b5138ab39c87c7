//! Typisierte Events der Verhandlungs-Engine
//!
//! Alle Callbacks der Media Engine (Verbindungs-/ICE-Zustand, Track,
//! Kandidat) und alle Watchdog-Timer werden in `EngineEvent`s übersetzt
//! und über eine Single-Consumer-Queue sequentiell verarbeitet. Damit
//! können ICE-Callback und Remote-Track-Callback nicht mehr um die
//! "connected"-Transition racen.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Internes Event auf der Dispatch-Queue der Engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// ICE-Transportzustand hat gewechselt
    IceState(RTCIceConnectionState),
    /// Gesamtzustand der Peer Connection hat gewechselt
    PeerState(RTCPeerConnectionState),
    /// Remote-Track eingetroffen (eingehende Medien sind der stärkste
    /// Konnektivitäts-Beweis)
    RemoteTrack { kind: RTPCodecType },
    /// Lokaler ICE-Kandidat entdeckt (JSON-serialisiert)
    LocalCandidate(String),
    /// Kurzer Watchdog abgelaufen; `attempt` zählt die Eskalationsstufe
    ProbeTimeout { attempt: u32 },
    /// Absolutes Zeitfenster abgelaufen: Call wird auf App-Ebene
    /// "connected" gezwungen
    ForceConnected,
}

// ============================================================================
// PUBLIC STATE / EVENTS
// ============================================================================

/// Richtung einer SDP Description im Signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Verbindungszustand eines Call-Versuchs.
///
/// `Disconnected`/`Failed` können über ICE-Restart zurück nach
/// `Connecting`; `Closed` ist terminal und verlangt einen frischen
/// `NegotiationContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events, die die Engine nach außen publiziert.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(ConnectionState),
    /// Lokal entdeckter ICE-Kandidat, vom Transport an die Gegenseite
    /// zu relayen
    IceCandidate { candidate: String },
    /// Nach einem ICE-Restart neu zu signalisierendes Offer
    IceRestartOffer { sdp: String },
    Error(String),
}
