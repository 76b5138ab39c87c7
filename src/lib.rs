//! FitCall - P2P Call-Session-Aufbau und Recovery
//!
//! Bibliothek für den Sprach-/Video-Call-Unterbau einer Mobile-App:
//! - TURN-Credential-Beschaffung mit Fallback-Kette
//! - Audio-Routing und Fokus-Verwaltung
//! - Mikrofon- und Kamera-Capture mit Auflösungs-Leiter
//! - WebRTC-Verhandlung mit ICE-Watchdogs und Auto-Restart
//! - Orchestrierung genau einer aktiven Call-Session
//!
//! UI und Signaling-Transport liegen außerhalb: die App ruft die
//! Methoden des [`CallOrchestrator`] und abonniert dessen Events.

pub mod audio;
pub mod call_engine;
pub mod capture;
pub mod ice;
pub mod orchestrator;
pub mod signaling;

pub use audio::FocusChange;
pub use call_engine::{CallEngine, CallEngineError, CallEvent, ConnectionState, EngineConfig, SdpKind};
pub use orchestrator::{
    CallOrchestrator, CallParticipant, CallSession, OrchestratorError, SessionEvent,
};
pub use signaling::CallStatus;

/// Initialisiert das Logging der Bibliothek. Einmal pro Prozess
/// aufrufen, bevor der erste Orchestrator gebaut wird.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("fitcall=debug".parse().expect("static directive"))
        .add_directive("webrtc=warn".parse().expect("static directive"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}
