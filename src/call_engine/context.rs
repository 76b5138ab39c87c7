//! NegotiationContext - veränderlicher Zustand eines Call-Versuchs
//!
//! Lebensdauer = genau ein Call-Versuch; wird niemals wiederverwendet,
//! damit kein Zustand zwischen Calls durchsickert. Pro Gerät existiert
//! höchstens ein aktiver Kontext (durchgesetzt vom Orchestrator).

use super::events::EngineEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub struct NegotiationContext {
    pub id: Uuid,
    pub is_video: bool,
    pub is_caller: bool,
    pub pc: Arc<RTCPeerConnection>,

    /// Lokaler Audio-Track; Encoding liefert die Media Engine
    pub audio_track: Arc<TrackLocalStaticSample>,
    /// Lokaler Video-Track, nur bei Video-Calls
    pub video_track: Mutex<Option<Arc<TrackLocalStaticSample>>>,

    /// Kandidaten, die vor der Remote Description eintrafen; werden
    /// nach `set_remote_description` geflusht
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,

    /// One-Shot-Latch der "connected"-Transition: feuert genau einmal
    /// pro Kontext, egal wie viele Trigger (ICE-Event, Remote-Track,
    /// Timeout) eintreffen
    connected_fired: AtomicBool,

    /// Watchdogs werden nur beim ersten Eintritt in ICE-checking gestartet
    watchdogs_started: AtomicBool,

    /// Verhindert parallele ICE-Restarts
    pub restart_inflight: AtomicBool,

    /// Serialisiert Offer/Answer/Remote-Apply: pro Kontext darf immer
    /// nur eine SDP-Operation ausstehen
    pub sdp_op: tokio::sync::Mutex<()>,

    /// Hintergrund-Tasks (Watchdogs, Stats, Dispatch); werden beim
    /// Teardown synchron abgebrochen, bevor Geräte freigegeben werden
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Stats-Polling separat, damit es bei disconnected gezielt stoppt
    stats_task: Mutex<Option<JoinHandle<()>>>,
    /// Watchdog-Tasks separat, damit ein echtes ICE-connected sie sofort
    /// abräumen kann
    watchdog_tasks: Mutex<Vec<JoinHandle<()>>>,

    pub events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl NegotiationContext {
    pub fn new(
        is_video: bool,
        is_caller: bool,
        pc: Arc<RTCPeerConnection>,
        audio_track: Arc<TrackLocalStaticSample>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            is_video,
            is_caller,
            pc,
            audio_track,
            video_track: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            connected_fired: AtomicBool::new(false),
            watchdogs_started: AtomicBool::new(false),
            restart_inflight: AtomicBool::new(false),
            sdp_op: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            stats_task: Mutex::new(None),
            watchdog_tasks: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    /// Versucht die "connected"-Transition zu reservieren.
    /// `true` genau beim ersten Aufruf pro Kontext.
    pub fn mark_connected(&self) -> bool {
        !self.connected_fired.swap(true, Ordering::SeqCst)
    }

    pub fn connected_fired(&self) -> bool {
        self.connected_fired.load(Ordering::SeqCst)
    }

    /// `true` genau beim ersten Eintritt in ICE-checking.
    pub fn mark_watchdogs_started(&self) -> bool {
        !self.watchdogs_started.swap(true, Ordering::SeqCst)
    }

    pub fn set_remote_description_applied(&self) {
        self.remote_description_set.store(true, Ordering::SeqCst);
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_set.load(Ordering::SeqCst)
    }

    /// Kandidat puffern, solange die Remote Description fehlt.
    pub fn queue_candidate(&self, candidate: RTCIceCandidateInit) {
        self.pending_candidates.lock().push(candidate);
    }

    pub fn drain_pending_candidates(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    #[cfg(test)]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn add_watchdog(&self, handle: JoinHandle<()>) {
        self.watchdog_tasks.lock().push(handle);
    }

    pub fn set_stats_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.stats_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Bricht die Watchdogs ab (echtes ICE-connected/-completed).
    pub fn cancel_watchdogs(&self) {
        for handle in self.watchdog_tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn stop_stats(&self) {
        if let Some(handle) = self.stats_task.lock().take() {
            handle.abort();
        }
    }

    /// Bricht sämtliche Hintergrund-Tasks ab. Muss vor der Freigabe von
    /// Mikrofon/Kamera/Fokus laufen, damit kein Timer gegen einen
    /// entsorgten Kontext feuert.
    pub fn abort_all_tasks(&self) {
        self.cancel_watchdogs();
        self.stop_stats();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for NegotiationContext {
    fn drop(&mut self) {
        self.abort_all_tasks();
    }
}
