//! Verhandlungs-Engine: Peer Connection, Signaling-Zustandsmaschine,
//! ICE-Überwachung und automatische Recovery
//!
//! Die Engine besitzt pro Call-Versuch genau einen
//! `NegotiationContext`. Alle Callbacks der Media Engine landen als
//! typisierte Events auf einer Single-Consumer-Queue; zwei Watchdogs
//! überwachen die ICE-Verhandlung und erzwingen notfalls den
//! "connected"-Zustand auf App-Ebene (bewusster Trade-off, siehe
//! `EngineConfig::connect_timeout`).

use super::config::{EngineConfig, PREFERRED_AUDIO_CODECS, PREFERRED_VIDEO_CODECS};
use super::context::NegotiationContext;
use super::events::{CallEvent, ConnectionState, EngineEvent, SdpKind};
use super::sdp;
use crate::audio::AudioSessionController;
use crate::capture::{CaptureError, Facing, MediaCaptureManager};
use crate::ice::IceServerSlot;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Another SDP operation is still outstanding")]
    NegotiationBusy,

    #[error("No remote offer applied yet")]
    RemoteOfferMissing,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    config: EngineConfig,
    audio: Arc<AudioSessionController>,
    capture: Arc<MediaCaptureManager>,
    ice_servers: Arc<IceServerSlot>,
    state: Mutex<ConnectionState>,
    context: Mutex<Option<Arc<NegotiationContext>>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    pub fn new(
        config: EngineConfig,
        audio: Arc<AudioSessionController>,
        capture: Arc<MediaCaptureManager>,
        ice_servers: Arc<IceServerSlot>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(EngineShared {
                config,
                audio,
                capture,
                ice_servers,
                state: Mutex::new(ConnectionState::Idle),
                context: Mutex::new(None),
                event_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Baut den frischen `NegotiationContext` für einen Call-Versuch
    /// auf: Peer Connection, Audio-Track, bei Video-Anrufern proaktiv
    /// der Video-Transceiver (die Gegenseite bindet ihren Track erst
    /// nach Anwenden des Remote-Offers, siehe
    /// `prepare_local_video_after_remote_set`).
    pub async fn start_session(
        &self,
        is_video: bool,
        is_caller: bool,
    ) -> Result<(), CallEngineError> {
        if self.shared.context.lock().is_some() {
            return Err(CallEngineError::AlreadyInCall);
        }

        let pc = self.shared.create_peer_connection().await?;

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: crate::capture::SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "fitcall".to_string(),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(NegotiationContext::new(
            is_video,
            is_caller,
            Arc::clone(&pc),
            audio_track,
            events_tx.clone(),
        ));

        // Anrufer-Seite: Video-Transceiver proaktiv anlegen, damit die
        // Media-Line-Reihenfolge über Renegotiationen stabil bleibt
        if is_video && is_caller {
            let video_track = new_video_track();
            let transceiver = pc
                .add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

            let sender = transceiver.sender().await;
            if let Err(e) = sender
                .replace_track(Some(
                    Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>
                ))
                .await
            {
                tracing::warn!("Binding local video track failed: {}", e);
            }
            *ctx.video_track.lock() = Some(video_track);
        }

        self.shared.register_pc_handlers(&pc, events_tx);

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            Arc::clone(&ctx),
            events_rx,
        ));
        ctx.add_task(dispatcher);

        *self.shared.context.lock() = Some(Arc::clone(&ctx));

        // Audio-Seiteneffekte: Routing aktivieren, Mikrofon starten.
        // Fehler degradieren den Call, brechen ihn aber nie ab.
        self.shared.audio.activate_call_audio();
        if let Err(e) = self.shared.capture.start_audio_capture() {
            tracing::warn!("Audio capture unavailable, degraded call: {}", e);
        }

        self.shared.set_state(ConnectionState::Connecting);
        tracing::info!(
            call = %ctx.id,
            is_video,
            is_caller,
            "Negotiation context created"
        );
        Ok(())
    }

    /// Erstellt das SDP Offer und committet es als Local Description.
    ///
    /// Existiert noch kein Kontext (allererste Aktion des Calls), wird
    /// ein Audio-Kontext automatisch aufgebaut; Aufrufer müssen das
    /// Setup nicht manuell sequenzieren.
    pub async fn create_offer(&self) -> Result<String, CallEngineError> {
        if self.shared.context.lock().is_none() {
            self.start_session(false, true).await?;
        }
        let ctx = self.shared.current_context()?;

        let _guard = ctx
            .sdp_op
            .try_lock()
            .map_err(|_| CallEngineError::NegotiationBusy)?;

        let offer = ctx
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        ctx.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        // Codec-Präferenz und Bitraten-Deckel werden auf der
        // Wire-Kopie umgeschrieben; die Engine akzeptiert kein
        // gemungtes Local-SDP
        Ok(self.shared.shape_sdp(&offer.sdp, ctx.is_video))
    }

    /// Erstellt das SDP Answer; setzt ein bereits angewendetes Remote
    /// Offer voraus.
    pub async fn create_answer(&self) -> Result<String, CallEngineError> {
        let ctx = self.shared.current_context()?;
        if !ctx.remote_description_applied() {
            return Err(CallEngineError::RemoteOfferMissing);
        }

        let _guard = ctx
            .sdp_op
            .try_lock()
            .map_err(|_| CallEngineError::NegotiationBusy)?;

        let answer = ctx
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        ctx.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        Ok(self.shared.shape_sdp(&answer.sdp, ctx.is_video))
    }

    /// Wendet die Remote Description an und flusht danach gepufferte
    /// Kandidaten. Apply-Fehler werden geloggt und als Event gemeldet,
    /// nicht geworfen: der Call kann trotzdem teilweise funktionieren.
    pub async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), CallEngineError> {
        let ctx = self.shared.current_context()?;

        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;

        let _guard = ctx.sdp_op.lock().await;

        if let Err(e) = ctx.pc.set_remote_description(desc).await {
            tracing::error!("Applying remote description failed: {}", e);
            self.shared
                .emit(CallEvent::Error(format!("remote description: {}", e)));
            return Ok(());
        }
        ctx.set_remote_description_applied();

        // Verspätete/vorzeitige Kandidaten nachziehen
        for candidate in ctx.drain_pending_candidates() {
            if let Err(e) = ctx.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Queued ICE candidate rejected: {}", e);
            }
        }

        // Empfänger-Seite eines Video-Calls: Track an den vom Offer
        // erzeugten Transceiver binden
        if kind == SdpKind::Offer && ctx.is_video && !ctx.is_caller {
            self.shared.prepare_local_video_after_remote_set(&ctx).await;
        }

        Ok(())
    }

    /// Fügt einen ICE-Kandidaten hinzu. Vor der Remote Description wird
    /// gepuffert; ein einzelner kaputter Kandidat bricht niemals eine
    /// sonst gesunde Verhandlung ab.
    pub async fn add_ice_candidate(&self, candidate_json: String) -> Result<(), CallEngineError> {
        let ctx = self.shared.current_context()?;

        let candidate: RTCIceCandidateInit = match serde_json::from_str(&candidate_json) {
            Ok(c) => c,
            Err(_) => RTCIceCandidateInit {
                candidate: candidate_json,
                ..Default::default()
            },
        };

        if !ctx.remote_description_applied() {
            tracing::debug!("Queuing early ICE candidate");
            ctx.queue_candidate(candidate);
            return Ok(());
        }

        if let Err(e) = ctx.pc.add_ice_candidate(candidate).await {
            tracing::warn!("ICE candidate rejected: {}", e);
        }
        Ok(())
    }

    /// Mikrofon-Mute umschalten; gibt den neuen Mute-Status zurück.
    pub fn toggle_audio(&self) -> bool {
        let muted = !self.shared.capture.is_muted();
        self.shared.capture.set_muted(muted);
        muted
    }

    /// Video an/aus. Scheitert die Kamera, bleibt Video aus und der
    /// Call läuft audio-only weiter; gibt den neuen Video-Status zurück.
    pub fn toggle_video(&self) -> bool {
        if self.shared.capture.is_video_active() {
            self.shared.capture.stop_video_capture();
            false
        } else {
            let prefer_front = self.shared.capture.facing() == Facing::Front;
            match self.shared.capture.start_video_capture(prefer_front) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Video capture failed, staying audio-only: {}", e);
                    false
                }
            }
        }
    }

    pub fn switch_camera(&self) {
        if let Err(e) = self.shared.capture.switch_device() {
            tracing::warn!("Camera switch failed: {}", e);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.shared.capture.is_muted()
    }

    pub fn input_level(&self) -> f32 {
        self.shared.capture.input_level()
    }

    /// Meldet einen Audio-Fokus-Wechsel des Betriebssystems weiter.
    pub fn on_focus_change(&self, change: crate::audio::FocusChange) {
        self.shared.audio.on_focus_change(change);
    }

    /// Reißt den aktuellen Call-Versuch vollständig ab. Idempotent und
    /// aus jedem Zustand sicher: erst werden alle Hintergrund-Tasks
    /// synchron gestoppt, dann Geräte und Fokus freigegeben.
    pub async fn close(&self) {
        let ctx = self.shared.context.lock().take();

        let Some(ctx) = ctx else {
            return;
        };

        ctx.abort_all_tasks();

        if let Err(e) = ctx.pc.close().await {
            tracing::warn!("Peer connection close failed: {}", e);
        }

        self.shared.capture.stop_video_capture();
        self.shared.capture.stop_audio_capture();
        self.shared.audio.deactivate_call_audio();

        self.shared.set_state(ConnectionState::Closed);
        tracing::info!(call = %ctx.id, "Negotiation context released");
    }

    #[cfg(test)]
    pub(crate) fn test_context(&self) -> Arc<NegotiationContext> {
        self.shared.current_context().expect("no context")
    }

    #[cfg(test)]
    pub(crate) fn has_context(&self) -> bool {
        self.shared.context.lock().is_some()
    }
}

fn new_video_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_string(),
        "fitcall".to_string(),
    ))
}

// ============================================================================
// SHARED INTERNALS
// ============================================================================

impl EngineShared {
    fn current_context(&self) -> Result<Arc<NegotiationContext>, CallEngineError> {
        self.context
            .lock()
            .clone()
            .ok_or(CallEngineError::NoActiveCall)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Publiziert nur echte Zustandswechsel.
    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock();
        if *state != new_state {
            tracing::info!("Connection state: {:?} -> {:?}", *state, new_state);
            *state = new_state;
            drop(state);
            self.emit(CallEvent::StateChanged(new_state));
        }
    }

    fn shape_sdp(&self, raw: &str, is_video: bool) -> String {
        let mut shaped = sdp::prefer_codecs(raw, "audio", &PREFERRED_AUDIO_CODECS);
        if is_video {
            shaped = sdp::prefer_codecs(&shaped, "video", &PREFERRED_VIDEO_CODECS);
            shaped = sdp::cap_video_bandwidth(&shaped, self.config.max_video_bitrate_kbps);
        }
        shaped
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallEngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallEngineError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.snapshot().to_rtc(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| CallEngineError::WebRTC(e.to_string()))?,
        );

        Ok(pc)
    }

    /// Übersetzt alle Callbacks der Media Engine in Queue-Events.
    fn register_pc_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) {
        let tx = events_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::debug!("ICE connection state: {:?}", state);
            let _ = tx.send(EngineEvent::IceState(state));
            Box::pin(async {})
        }));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("Peer connection state: {:?}", state);
            let _ = tx.send(EngineEvent::PeerState(state));
            Box::pin(async {})
        }));

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(serialized) = serde_json::to_string(&json) {
                        let _ = tx.send(EngineEvent::LocalCandidate(serialized));
                    }
                }
            }
            Box::pin(async {})
        }));

        let tx = events_tx;
        pc.on_track(Box::new(move |track, _, _| {
            let kind = track.kind();
            tracing::info!("Remote track received: {:?}", kind);
            let _ = tx.send(EngineEvent::RemoteTrack { kind });
            Box::pin(async {})
        }));
    }

    /// Empfänger-Seite: den vom Remote Offer angelegten Video-Transceiver
    /// suchen und den lokalen Track daran binden. Ein neuer Transceiver
    /// wird nur als letzter Ausweg angelegt, weil die Anlage-Reihenfolge
    /// die Media-Line-Ordnung im SDP bestimmt.
    async fn prepare_local_video_after_remote_set(&self, ctx: &Arc<NegotiationContext>) {
        let video_track = {
            let mut slot = ctx.video_track.lock();
            slot.get_or_insert_with(new_video_track).clone()
        };

        for transceiver in ctx.pc.get_transceivers().await {
            if transceiver.kind() != RTPCodecType::Video {
                continue;
            }
            let sender = transceiver.sender().await;
            match sender
                .replace_track(Some(
                    Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>
                ))
                .await
            {
                Ok(()) => {
                    tracing::info!("Local video bound to offer-created transceiver");
                    return;
                }
                Err(e) => tracing::warn!("Video track bind failed: {}", e),
            }
        }

        // Letzter Ausweg: eigener Transceiver
        tracing::warn!("No video transceiver in remote offer, adding one");
        match ctx
            .pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
        {
            Ok(transceiver) => {
                let sender = transceiver.sender().await;
                if let Err(e) = sender
                    .replace_track(Some(
                        Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>
                    ))
                    .await
                {
                    tracing::warn!("Fallback video bind failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Fallback video transceiver failed: {}", e),
        }
    }

    /// ICE-Restart: neues Offer mit Restart-Flag, Local Description
    /// committen, Offer zum erneuten Signaling nach außen reichen.
    async fn restart_ice(&self, ctx: &Arc<NegotiationContext>) {
        use std::sync::atomic::Ordering;

        if ctx.restart_inflight.swap(true, Ordering::AcqRel) {
            tracing::debug!("ICE restart already in flight, skipping");
            return;
        }

        let result = async {
            let _guard = ctx.sdp_op.lock().await;
            let offer = ctx
                .pc
                .create_offer(Some(RTCOfferOptions {
                    ice_restart: true,
                    ..Default::default()
                }))
                .await?;
            ctx.pc.set_local_description(offer.clone()).await?;
            Ok::<String, webrtc::Error>(offer.sdp)
        }
        .await;

        ctx.restart_inflight.store(false, Ordering::Release);

        match result {
            Ok(raw) => {
                tracing::info!("ICE restart initiated");
                let shaped = self.shape_sdp(&raw, ctx.is_video);
                self.emit(CallEvent::IceRestartOffer { sdp: shaped });
            }
            Err(e) => tracing::warn!("ICE restart failed: {}", e),
        }
    }

    fn schedule_probe(&self, ctx: &Arc<NegotiationContext>, attempt: u32) {
        let tx = ctx.events_tx.clone();
        let delay = self.config.ice_probe_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::ProbeTimeout { attempt });
        });
        ctx.add_watchdog(handle);
    }

    /// Startet beide Watchdogs beim ersten Eintritt in ICE-checking:
    /// den kurzen Probe-Timer (Restart-Eskalation) und das absolute
    /// Zeitfenster (erzwungenes "connected").
    fn start_watchdogs(&self, ctx: &Arc<NegotiationContext>) {
        self.schedule_probe(ctx, 1);

        let tx = ctx.events_tx.clone();
        let timeout = self.config.connect_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(EngineEvent::ForceConnected);
        });
        ctx.add_watchdog(handle);
    }

    /// Die eine "connected"-Transition. Der Latch im Kontext stellt
    /// sicher, dass die Seiteneffekte genau einmal laufen, egal welcher
    /// Trigger zuerst kommt.
    fn on_connected_signal(&self, ctx: &Arc<NegotiationContext>, trigger: &str) {
        if ctx.mark_connected() {
            tracing::info!(trigger, call = %ctx.id, "Call connected");
            ctx.cancel_watchdogs();

            // Reihenfolge ist Vertrag: Audio-Kette sicherstellen,
            // Mute aufheben, Routing re-assertieren, dann Kamera
            if let Err(e) = self.capture.start_audio_capture() {
                tracing::warn!("Audio chain on connect: {}", e);
            }
            self.capture.set_muted(false);
            self.audio.ensure_proper_routing();

            if ctx.is_video {
                let prefer_front = self.capture.facing() == Facing::Front;
                if let Err(e) = self.capture.start_video_capture(prefer_front) {
                    tracing::warn!("Camera on connect failed, audio-only: {}", e);
                }
            }

            self.start_stats_polling(ctx);
        }
        self.set_state(ConnectionState::Connected);
    }

    /// Periodisches Statistik-Polling, an die Kontext-Lebensdauer
    /// gebunden; stoppt bei disconnected/terminal.
    fn start_stats_polling(&self, ctx: &Arc<NegotiationContext>) {
        let pc = Arc::clone(&ctx.pc);
        let interval = self.config.stats_interval;
        let call_id = ctx.id;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // erster Tick feuert sofort
            loop {
                ticker.tick().await;
                let report = pc.get_stats().await;
                tracing::debug!(call = %call_id, "{} stats reports", report.reports.len());
            }
        });
        ctx.set_stats_task(handle);
    }
}

// ============================================================================
// EVENT DISPATCH
// ============================================================================

/// Single-Consumer-Verarbeitung aller Engine-Events. Läuft als Task pro
/// Kontext und wird beim Teardown abgebrochen.
async fn dispatch_loop(
    shared: Arc<EngineShared>,
    ctx: Arc<NegotiationContext>,
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        handle_event(&shared, &ctx, event).await;
    }
}

async fn handle_event(
    shared: &Arc<EngineShared>,
    ctx: &Arc<NegotiationContext>,
    event: EngineEvent,
) {
    match event {
        EngineEvent::IceState(state) => match state {
            RTCIceConnectionState::Checking => {
                if ctx.mark_watchdogs_started() {
                    shared.start_watchdogs(ctx);
                }
                shared.set_state(ConnectionState::Connecting);
            }
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                // Echte Konnektivität: Watchdogs sofort abräumen
                ctx.cancel_watchdogs();
                shared.on_connected_signal(ctx, "ice");
            }
            RTCIceConnectionState::Failed => {
                // Failed (nicht bloß Disconnected): sofortiger Restart
                // ohne auf den Probe-Watchdog zu warten
                tracing::warn!("ICE failed, restarting immediately");
                ctx.stop_stats();
                shared.restart_ice(ctx).await;
            }
            RTCIceConnectionState::Disconnected => {
                ctx.stop_stats();
                shared.set_state(ConnectionState::Disconnected);
            }
            _ => {}
        },

        EngineEvent::PeerState(state) => match state {
            RTCPeerConnectionState::Connected => {
                shared.on_connected_signal(ctx, "peer-connection");
            }
            RTCPeerConnectionState::Failed => {
                ctx.stop_stats();
                ctx.cancel_watchdogs();
                shared.set_state(ConnectionState::Failed);
            }
            RTCPeerConnectionState::Closed => {
                ctx.stop_stats();
                ctx.cancel_watchdogs();
                shared.set_state(ConnectionState::Closed);
            }
            _ => {}
        },

        EngineEvent::RemoteTrack { kind } => {
            // Inbound-Media-Event: Routing billig re-assertieren
            shared.audio.ensure_proper_routing();
            if kind == RTPCodecType::Audio {
                // Eingehendes Audio ist der definitive Beweis, dass der
                // Pfad funktioniert, auch wenn ICE es noch nicht meldet
                shared.on_connected_signal(ctx, "remote-track");
            }
        }

        EngineEvent::LocalCandidate(candidate) => {
            shared.emit(CallEvent::IceCandidate { candidate });
        }

        EngineEvent::ProbeTimeout { attempt } => {
            if ctx.connected_fired() {
                return;
            }
            let state = *shared.state.lock();
            if matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Disconnected
            ) {
                tracing::warn!(attempt, "ICE still unsettled, restarting");
                shared.restart_ice(ctx).await;
                if attempt < shared.config.ice_probe_attempts {
                    shared.schedule_probe(ctx, attempt + 1);
                }
            }
        }

        EngineEvent::ForceConnected => {
            if !ctx.connected_fired() {
                // Absolutes Zeitfenster abgelaufen: App-Zustand wird
                // unabhängig vom ICE-Status auf "connected" gezwungen.
                // Lieber optimistisch als ein ewiges "connecting…",
                // während Audio womöglich längst fließt.
                tracing::warn!("Connect timeout reached, forcing connected state");
            }
            shared.on_connected_signal(ctx, "timeout");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioMode, AudioOs};
    use crate::capture::{CameraBackend, CameraDescriptor, CameraFormatStep, CameraSession};
    use std::time::Duration;

    struct QuietOs;
    impl AudioOs for QuietOs {
        fn set_mode(&self, _mode: AudioMode) {}
        fn request_focus(&self) -> bool {
            true
        }
        fn abandon_focus(&self) {}
        fn set_speaker(&self, _on: bool) {}
        fn set_mic_mute(&self, _muted: bool) {}
    }

    struct NoCameraBackend;
    impl CameraBackend for NoCameraBackend {
        fn enumerate(&self) -> Result<Vec<CameraDescriptor>, CaptureError> {
            Ok(vec![])
        }
        fn open(
            &self,
            _device: &CameraDescriptor,
            _format: CameraFormatStep,
        ) -> Result<Box<dyn CameraSession>, CaptureError> {
            Err(CaptureError::NoCamera)
        }
    }

    fn test_engine() -> CallEngine {
        CallEngine::new(
            EngineConfig::fast(),
            Arc::new(AudioSessionController::new(Arc::new(QuietOs))),
            Arc::new(MediaCaptureManager::new(Arc::new(NoCameraBackend))),
            Arc::new(IceServerSlot::new()),
        )
    }

    fn drain_connected_events(rx: &mut broadcast::Receiver<CallEvent>) -> usize {
        let mut connected = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CallEvent::StateChanged(ConnectionState::Connected)) {
                connected += 1;
            }
        }
        connected
    }

    #[tokio::test]
    async fn test_forced_timeout_reaches_connected() {
        let engine = test_engine();
        engine.start_session(false, true).await.unwrap();
        let _offer = engine.create_offer().await.unwrap();

        // ICE hängt in checking fest, kein Kandidatenpaar kommt durch
        let ctx = engine.test_context();
        ctx.events_tx
            .send(EngineEvent::IceState(RTCIceConnectionState::Checking))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.state(), ConnectionState::Connected);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_connected_transition_fires_once() {
        let engine = test_engine();
        let mut rx = engine.subscribe();
        engine.start_session(false, true).await.unwrap();

        let ctx = engine.test_context();
        ctx.events_tx
            .send(EngineEvent::IceState(RTCIceConnectionState::Checking))
            .unwrap();
        ctx.events_tx
            .send(EngineEvent::IceState(RTCIceConnectionState::Connected))
            .unwrap();
        ctx.events_tx
            .send(EngineEvent::RemoteTrack {
                kind: RTPCodecType::Audio,
            })
            .unwrap();
        ctx.events_tx.send(EngineEvent::ForceConnected).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(ctx.connected_fired());
        assert_eq!(drain_connected_events(&mut rx), 1);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_queued() {
        let caller = test_engine();
        let callee = test_engine();

        caller.start_session(false, true).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.start_session(false, false).await.unwrap();

        // Kandidat trifft vor der Remote Description ein
        let early = "{\"candidate\":\"candidate:1 1 udp 2130706431 127.0.0.1 54321 typ host\",\"sdpMid\":\"0\",\"sdpMLineIndex\":0}";
        callee.add_ice_candidate(early.to_string()).await.unwrap();
        assert_eq!(callee.test_context().pending_candidate_count(), 1);

        callee
            .set_remote_description(SdpKind::Offer, offer)
            .await
            .unwrap();

        // Queue geflusht, Call weiterhin gesund
        assert_eq!(callee.test_context().pending_candidate_count(), 0);
        assert_ne!(callee.state(), ConnectionState::Failed);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let caller = test_engine();
        let callee = test_engine();

        caller.start_session(false, true).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.start_session(false, false).await.unwrap();
        callee
            .set_remote_description(SdpKind::Offer, offer)
            .await
            .unwrap();
        let answer = callee.create_answer().await.unwrap();

        caller
            .set_remote_description(SdpKind::Answer, answer)
            .await
            .unwrap();

        assert!(caller.test_context().pc.remote_description().await.is_some());
        assert!(callee.test_context().pc.remote_description().await.is_some());
        assert!(caller.test_context().pc.local_description().await.is_some());

        // Beide Seiten hängen in checking fest (kein Kandidatenpaar im
        // Test-Netz); spätestens das absolute Zeitfenster bringt beide
        // auf Connected
        caller
            .test_context()
            .events_tx
            .send(EngineEvent::IceState(RTCIceConnectionState::Checking))
            .unwrap();
        callee
            .test_context()
            .events_tx
            .send(EngineEvent::IceState(RTCIceConnectionState::Checking))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(caller.state(), ConnectionState::Connected);
        assert_eq!(callee.state(), ConnectionState::Connected);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_video_offer_is_shaped() {
        let engine = test_engine();
        engine.start_session(true, true).await.unwrap();
        let offer = engine.create_offer().await.unwrap();

        assert!(offer.contains("m=video"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("b=AS:800"));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_answer_without_remote_offer_fails() {
        let engine = test_engine();
        engine.start_session(false, false).await.unwrap();

        let err = engine.create_answer().await.unwrap_err();
        assert!(matches!(err, CallEngineError::RemoteOfferMissing));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_second_offer_while_outstanding_is_rejected() {
        let engine = test_engine();
        engine.start_session(false, true).await.unwrap();

        let ctx = engine.test_context();
        let held = ctx.sdp_op.try_lock().unwrap();

        let err = engine.create_offer().await.unwrap_err();
        assert!(matches!(err, CallEngineError::NegotiationBusy));

        drop(held);
        engine.close().await;
    }

    #[tokio::test]
    async fn test_close_twice_is_safe() {
        let engine = test_engine();
        engine.start_session(false, true).await.unwrap();
        assert!(engine.has_context());

        engine.close().await;
        assert!(!engine.has_context());
        assert_eq!(engine.state(), ConnectionState::Closed);

        // Zweites close ist ein No-op
        engine.close().await;
        assert_eq!(engine.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let engine = test_engine();
        engine.start_session(false, true).await.unwrap();

        let err = engine.start_session(false, true).await.unwrap_err();
        assert!(matches!(err, CallEngineError::AlreadyInCall));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_callee_video_binds_to_remote_transceiver() {
        let caller = test_engine();
        let callee = test_engine();

        caller.start_session(true, true).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.start_session(true, false).await.unwrap();
        callee
            .set_remote_description(SdpKind::Offer, offer)
            .await
            .unwrap();

        // Track wurde an den vom Offer erzeugten Transceiver gebunden
        assert!(callee.test_context().video_track.lock().is_some());

        let answer = callee.create_answer().await.unwrap();
        assert!(answer.contains("m=video"));

        caller.close().await;
        callee.close().await;
    }
}
