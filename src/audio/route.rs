//! Audio Session Controller - Routing, Lautsprecher, Fokus
//!
//! Alle Operationen sind Best-Effort: Hardware- oder Permission-Fehler
//! werden geloggt und geschluckt, ein Routing-Fehler darf niemals den
//! Call-Aufbau abbrechen. Die OS-Schicht steckt hinter einem Trait,
//! damit Tests gegen Fakes laufen.

use cpal::traits::HostTrait;
use parking_lot::Mutex;
use std::sync::Arc;

// ============================================================================
// ROUTE STATE
// ============================================================================

/// Audiomodus des Geräts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Normal,
    InCall,
}

/// Prozessweiter Routing-Zustand; wird bei jedem Teardown auf neutral
/// zurückgesetzt, egal wie der Call endete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRouteState {
    pub mode: AudioMode,
    pub mic_muted: bool,
    pub speaker_on: bool,
    pub focus_held: bool,
}

impl AudioRouteState {
    pub const fn neutral() -> Self {
        Self {
            mode: AudioMode::Normal,
            mic_muted: false,
            speaker_on: false,
            focus_held: false,
        }
    }
}

/// Fokus-Benachrichtigung des Betriebssystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Lost,
    Regained,
}

// ============================================================================
// OS LAYER
// ============================================================================

/// Schmale OS-Schnittstelle für Audio-Routing.
pub trait AudioOs: Send + Sync {
    fn set_mode(&self, mode: AudioMode);
    /// Fordert transienten exklusiven Fokus an; `false` bei Ablehnung.
    fn request_focus(&self) -> bool;
    fn abandon_focus(&self);
    fn set_speaker(&self, on: bool);
    fn set_mic_mute(&self, muted: bool);
}

/// Standard-Implementierung über die System-Audio-APIs.
///
/// Fokus ist auf Desktop-Hosts ein No-op (es gibt kein exklusives
/// Fokus-Konzept); dort zählt nur die Buchführung. Geräteprüfung läuft
/// über cpal, Fehler werden geloggt und geschluckt.
pub struct SystemAudio;

impl AudioOs for SystemAudio {
    fn set_mode(&self, mode: AudioMode) {
        tracing::debug!("Audio mode -> {:?}", mode);
    }

    fn request_focus(&self) -> bool {
        // Ohne Ausgabegerät ist Fokus sinnlos
        let host = cpal::default_host();
        if host.default_output_device().is_none() {
            tracing::warn!("No audio output device, focus request skipped");
            return false;
        }
        true
    }

    fn abandon_focus(&self) {
        tracing::debug!("Audio focus abandoned");
    }

    fn set_speaker(&self, on: bool) {
        tracing::debug!("Speaker routing: {}", on);
    }

    fn set_mic_mute(&self, muted: bool) {
        tracing::debug!("Microphone mute: {}", muted);
    }
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

/// Besitzt den Routing-/Fokus-Zustand des Geräts, unabhängig vom
/// Call-Zustand. Einmal pro Prozess konstruieren und den Kollaborateuren
/// explizit mitgeben.
pub struct AudioSessionController {
    os: Arc<dyn AudioOs>,
    state: Mutex<AudioRouteState>,
}

impl AudioSessionController {
    pub fn new(os: Arc<dyn AudioOs>) -> Self {
        Self {
            os,
            state: Mutex::new(AudioRouteState::neutral()),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemAudio))
    }

    /// Schaltet in den In-Call-Modus: Kommunikationsmodus, Mikrofon auf,
    /// Lautsprecher an, transienter Fokus. Idempotent; ein bereits
    /// gehaltener Fokus wird nicht erneut angefordert (OS-Fokusanfragen
    /// sind auf manchen Plattformen teuer).
    pub fn activate_call_audio(&self) {
        let mut state = self.state.lock();

        if state.mode != AudioMode::InCall {
            self.os.set_mode(AudioMode::InCall);
            state.mode = AudioMode::InCall;
        }
        if state.mic_muted {
            self.os.set_mic_mute(false);
            state.mic_muted = false;
        }
        if !state.speaker_on {
            self.os.set_speaker(true);
            state.speaker_on = true;
        }
        if !state.focus_held {
            state.focus_held = self.os.request_focus();
            if !state.focus_held {
                // Degradierter Betrieb: manche Geräte liefern auch ohne
                // expliziten Fokus Audio
                tracing::warn!("Audio focus denied, continuing without focus");
            }
        }

        tracing::info!("Call audio activated: {:?}", *state);
    }

    /// Stellt den Normalzustand wieder her. Idempotent.
    pub fn deactivate_call_audio(&self) {
        let mut state = self.state.lock();

        if state.focus_held {
            self.os.abandon_focus();
        }
        if state.speaker_on {
            self.os.set_speaker(false);
        }
        if state.mode != AudioMode::Normal {
            self.os.set_mode(AudioMode::Normal);
        }

        *state = AudioRouteState::neutral();
        tracing::info!("Call audio deactivated");
    }

    /// Prüft das Routing und korrigiert nur bei Abweichung. Darf auf
    /// jedem Inbound-Media-Event aufgerufen werden; redundante
    /// OS-Moduswechsel erzeugen hörbare Glitches und werden vermieden.
    pub fn ensure_proper_routing(&self) {
        let mut state = self.state.lock();

        if state.mode != AudioMode::InCall {
            tracing::debug!("Routing drifted, re-applying in-call mode");
            self.os.set_mode(AudioMode::InCall);
            state.mode = AudioMode::InCall;
        }
        if !state.speaker_on {
            self.os.set_speaker(true);
            state.speaker_on = true;
        }
    }

    /// Fokus-Benachrichtigung vom OS.
    ///
    /// Bei Verlust wird das Mikrofon NICHT stummgeschaltet: ein Call
    /// muss weitersenden, auch wenn eine andere App den Fokus kurz
    /// übernimmt. Es wird nur die Buchführung aktualisiert, damit ein
    /// späterer Rückgewinn sauber re-aktivieren kann.
    pub fn on_focus_change(&self, change: FocusChange) {
        match change {
            FocusChange::Lost => {
                let mut state = self.state.lock();
                state.focus_held = false;
                tracing::info!("Audio focus lost (mic stays live)");
            }
            FocusChange::Regained => {
                let in_call = self.state.lock().mode == AudioMode::InCall;
                if in_call {
                    tracing::info!("Audio focus regained, re-activating");
                    self.activate_call_audio();
                }
            }
        }
    }

    pub fn route_state(&self) -> AudioRouteState {
        *self.state.lock()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeOs {
        mode_calls: AtomicUsize,
        focus_requests: AtomicUsize,
        focus_abandons: AtomicUsize,
        speaker_calls: AtomicUsize,
        mute_calls: AtomicUsize,
    }

    impl AudioOs for FakeOs {
        fn set_mode(&self, _mode: AudioMode) {
            self.mode_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn request_focus(&self) -> bool {
            self.focus_requests.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn abandon_focus(&self) {
            self.focus_abandons.fetch_add(1, Ordering::SeqCst);
        }
        fn set_speaker(&self, _on: bool) {
            self.speaker_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn set_mic_mute(&self, _muted: bool) {
            self.mute_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_activate_is_idempotent() {
        let os = Arc::new(FakeOs::default());
        let controller = AudioSessionController::new(Arc::clone(&os) as Arc<dyn AudioOs>);

        controller.activate_call_audio();
        controller.activate_call_audio();
        controller.activate_call_audio();

        // Fokus nur einmal angefordert, Modus nur einmal gesetzt
        assert_eq!(os.focus_requests.load(Ordering::SeqCst), 1);
        assert_eq!(os.mode_calls.load(Ordering::SeqCst), 1);
        assert!(controller.route_state().focus_held);
    }

    #[test]
    fn test_focus_loss_does_not_mute_mic() {
        let os = Arc::new(FakeOs::default());
        let controller = AudioSessionController::new(Arc::clone(&os) as Arc<dyn AudioOs>);

        controller.activate_call_audio();
        let mutes_before = os.mute_calls.load(Ordering::SeqCst);

        controller.on_focus_change(FocusChange::Lost);

        assert_eq!(os.mute_calls.load(Ordering::SeqCst), mutes_before);
        let state = controller.route_state();
        assert!(!state.focus_held);
        assert!(!state.mic_muted);
        assert_eq!(state.mode, AudioMode::InCall);
    }

    #[test]
    fn test_focus_regain_reactivates() {
        let os = Arc::new(FakeOs::default());
        let controller = AudioSessionController::new(Arc::clone(&os) as Arc<dyn AudioOs>);

        controller.activate_call_audio();
        controller.on_focus_change(FocusChange::Lost);
        controller.on_focus_change(FocusChange::Regained);

        assert!(controller.route_state().focus_held);
        assert_eq!(os.focus_requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deactivate_resets_to_neutral() {
        let os = Arc::new(FakeOs::default());
        let controller = AudioSessionController::new(Arc::clone(&os) as Arc<dyn AudioOs>);

        controller.activate_call_audio();
        controller.deactivate_call_audio();
        controller.deactivate_call_audio();

        assert_eq!(controller.route_state(), AudioRouteState::neutral());
        assert_eq!(os.focus_abandons.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ensure_routing_is_cheap_when_correct() {
        let os = Arc::new(FakeOs::default());
        let controller = AudioSessionController::new(Arc::clone(&os) as Arc<dyn AudioOs>);

        controller.activate_call_audio();
        let mode_before = os.mode_calls.load(Ordering::SeqCst);
        let speaker_before = os.speaker_calls.load(Ordering::SeqCst);

        for _ in 0..10 {
            controller.ensure_proper_routing();
        }

        assert_eq!(os.mode_calls.load(Ordering::SeqCst), mode_before);
        assert_eq!(os.speaker_calls.load(Ordering::SeqCst), speaker_before);
    }

    #[test]
    fn test_regain_without_call_is_noop() {
        let os = Arc::new(FakeOs::default());
        let controller = AudioSessionController::new(Arc::clone(&os) as Arc<dyn AudioOs>);

        controller.on_focus_change(FocusChange::Regained);

        assert_eq!(os.focus_requests.load(Ordering::SeqCst), 0);
        assert_eq!(controller.route_state(), AudioRouteState::neutral());
    }
}
