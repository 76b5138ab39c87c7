//! Tunables der Verbindungs-Verhandlung
//!
//! Alle Zeitkonstanten sind injizierbar, damit Tests mit
//! Millisekunden-Skala laufen können statt echte Watchdog-Fenster
//! abzuwarten.

use std::time::Duration;

/// Bevorzugte Video-Codecs, in Reihenfolge. H264 zuerst wegen
/// Interoperabilität mit eingeschränkten Hardware-Decodern, VP8 als
/// dokumentierter Fallback.
pub const PREFERRED_VIDEO_CODECS: [&str; 2] = ["H264", "VP8"];

/// Bevorzugter Audio-Codec.
pub const PREFERRED_AUDIO_CODECS: [&str; 1] = ["opus"];

/// Konfiguration der Call Engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Kurzer Watchdog: steckt ICE nach dieser Zeit noch in
    /// checking/disconnected, wird ein ICE-Restart ausgelöst.
    pub ice_probe_delay: Duration,

    /// Wie oft der kurze Watchdog eskaliert (Restart + erneutes Probing).
    pub ice_probe_attempts: u32,

    /// Absolutes Zeitfenster: danach wird der Call auf App-Ebene
    /// unabhängig vom ICE-Status auf "connected" gezwungen. Bewusster
    /// Trade-off: lieber ein optimistischer Verbindungszustand als ein
    /// ewiges "connecting…" obwohl Audio längst fließt.
    pub connect_timeout: Duration,

    /// Intervall des Statistik-Pollings während aktiver Verbindung.
    pub stats_interval: Duration,

    /// Konservativer Deckel für ausgehendes Video (kbit/s).
    /// Stabilität vor Qualität.
    pub max_video_bitrate_kbps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_probe_delay: Duration::from_secs(2),
            ice_probe_attempts: 2,
            connect_timeout: Duration::from_secs(8),
            stats_interval: Duration::from_secs(5),
            max_video_bitrate_kbps: 800,
        }
    }
}

impl EngineConfig {
    /// Schnelle Variante für Tests (Millisekunden statt Sekunden).
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            ice_probe_delay: Duration::from_millis(30),
            ice_probe_attempts: 2,
            connect_timeout: Duration::from_millis(120),
            stats_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}
