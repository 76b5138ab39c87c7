//! Call Orchestrator - öffentliche Fassade der Bibliothek
//!
//! Bindet Credential Provider, Audio-Routing, Capture und die
//! Verhandlungs-Engine zu genau einer aktiven Call-Session zusammen.
//! Die UI- und Transport-Schicht der App redet ausschließlich mit
//! diesem Typ: Methoden rein, Events raus.

use crate::call_engine::{
    CallEngine, CallEngineError, CallEvent, ConnectionState, EngineConfig, SdpKind,
};
use crate::audio::AudioSessionController;
use crate::capture::MediaCaptureManager;
use crate::ice::{CredentialConfig, CredentialProvider, IceServerSlot};
use crate::signaling::{CallStatus, IncomingCallNotify};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Engine error: {0}")]
    Engine(#[from] CallEngineError),

    #[error("No active call session")]
    NoActiveSession,

    #[error("A call session already exists")]
    SessionExists,
}

// ============================================================================
// SESSION MODEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParticipant {
    pub user_id: String,
    pub display_name: String,
}

/// Snapshot der aktiven Call-Session.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: String,
    pub caller: CallParticipant,
    pub callee: CallParticipant,
    /// Teilnehmer-IDs in Beitrittsreihenfolge (Anrufer zuerst).
    pub participants: Vec<String>,
    pub status: CallStatus,
    pub is_video: bool,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    fn new(
        id: String,
        caller: CallParticipant,
        callee: CallParticipant,
        status: CallStatus,
        is_video: bool,
    ) -> Self {
        Self {
            participants: vec![caller.user_id.clone(), callee.user_id.clone()],
            id,
            caller,
            callee,
            status,
            is_video,
            started_at: Utc::now(),
        }
    }
}

/// Events, die der Orchestrator nach außen publiziert.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session-Status hat gewechselt (Ringing, Connected, Ended, ...)
    StatusChanged {
        session_id: String,
        status: CallStatus,
    },
    /// Durchgereichtes Engine-Event (Kandidaten, Restart-Offer, Fehler)
    Engine(CallEvent),
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct CallOrchestrator {
    engine: Arc<CallEngine>,
    credentials: CredentialProvider,
    ice_servers: Arc<IceServerSlot>,
    session: Arc<Mutex<Option<CallSession>>>,
    event_tx: broadcast::Sender<SessionEvent>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl CallOrchestrator {
    pub fn new(
        engine: Arc<CallEngine>,
        credentials: CredentialProvider,
        ice_servers: Arc<IceServerSlot>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            engine,
            credentials,
            ice_servers,
            session: Arc::new(Mutex::new(None)),
            event_tx,
            forward_task: Mutex::new(None),
        }
    }

    /// Produktiv-Aufbau mit echten Geräten und Credentials aus der
    /// Umgebung.
    pub fn system() -> Self {
        let ice_servers = Arc::new(IceServerSlot::new());
        let engine = Arc::new(CallEngine::new(
            EngineConfig::default(),
            Arc::new(AudioSessionController::system()),
            Arc::new(MediaCaptureManager::system()),
            Arc::clone(&ice_servers),
        ));
        Self::new(engine, CredentialProvider::new(CredentialConfig::from_env()), ice_servers)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn session(&self) -> Option<CallSession> {
        self.session.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Startet einen ausgehenden Anruf. Holt erst frische
    /// TURN-Credentials (Fallback-Kette, niemals fatal), dann wird der
    /// Verhandlungs-Kontext aufgebaut.
    pub async fn start_call(
        &self,
        caller: CallParticipant,
        callee: CallParticipant,
        is_video: bool,
    ) -> Result<CallSession, OrchestratorError> {
        if self.session.lock().is_some() {
            return Err(OrchestratorError::SessionExists);
        }

        self.refresh_ice_servers().await;
        self.engine.start_session(is_video, true).await?;

        let session = CallSession::new(
            Uuid::new_v4().to_string(),
            caller,
            callee,
            CallStatus::Initiating,
            is_video,
        );
        self.install_session(session.clone());

        tracing::info!(session = %session.id, is_video, "Outgoing call started");
        Ok(session)
    }

    /// Registriert einen eingehenden Anruf (Empfänger-Seite). Die
    /// Session steht danach auf `Ringing`; angenommen wird durch das
    /// Offer/Answer-Handling.
    pub async fn register_incoming_call(
        &self,
        notify: IncomingCallNotify,
        local: CallParticipant,
    ) -> Result<CallSession, OrchestratorError> {
        if self.session.lock().is_some() {
            return Err(OrchestratorError::SessionExists);
        }

        self.refresh_ice_servers().await;
        self.engine
            .start_session(notify.is_video_call, false)
            .await?;

        let session = CallSession::new(
            notify.session_id,
            CallParticipant {
                user_id: notify.caller_id,
                display_name: notify.caller_name,
            },
            local,
            CallStatus::Ringing,
            notify.is_video_call,
        );
        self.install_session(session.clone());

        tracing::info!(session = %session.id, "Incoming call registered");
        Ok(session)
    }

    pub async fn create_offer(&self) -> Result<String, OrchestratorError> {
        Ok(self.engine.create_offer().await?)
    }

    pub async fn create_answer(&self) -> Result<String, OrchestratorError> {
        Ok(self.engine.create_answer().await?)
    }

    pub async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), OrchestratorError> {
        Ok(self.engine.set_remote_description(kind, sdp).await?)
    }

    pub async fn add_ice_candidate(&self, candidate: String) -> Result<(), OrchestratorError> {
        Ok(self.engine.add_ice_candidate(candidate).await?)
    }

    /// Gibt den neuen Mute-Status zurück.
    pub fn toggle_audio(&self) -> bool {
        self.engine.toggle_audio()
    }

    /// Gibt den neuen Video-Status zurück.
    pub fn toggle_video(&self) -> bool {
        self.engine.toggle_video()
    }

    pub fn switch_camera(&self) {
        self.engine.switch_camera();
    }

    pub fn is_muted(&self) -> bool {
        self.engine.is_muted()
    }

    pub fn input_level(&self) -> f32 {
        self.engine.input_level()
    }

    /// Von der App bei OS-Audio-Fokus-Wechseln aufzurufen (z.B.
    /// Notification-Ton, anderer Player).
    pub fn on_focus_change(&self, change: crate::audio::FocusChange) {
        self.engine.on_focus_change(change);
    }

    /// Beendet den Anruf mit dem übergebenen Endstatus. Idempotent:
    /// ohne Session ein No-op. Reihenfolge des Teardowns: Tasks, Peer
    /// Connection, Geräte, Audio-Routing (übernimmt die Engine).
    pub async fn end_call(&self, status: CallStatus) {
        if let Some(handle) = self.forward_task.lock().take() {
            handle.abort();
        }

        self.engine.close().await;

        let ended = self.session.lock().take();
        if let Some(mut session) = ended {
            session.status = status;
            tracing::info!(session = %session.id, ?status, "Call ended");
            let _ = self.event_tx.send(SessionEvent::StatusChanged {
                session_id: session.id,
                status,
            });
        }
    }

    /// TURN-Credentials über die Fallback-Kette auffrischen; leere
    /// Ergebnisse lassen die letzte gute Konfiguration stehen.
    async fn refresh_ice_servers(&self) {
        let servers = self.credentials.fetch_turn_credentials().await;
        tracing::debug!("ICE server set refreshed ({} entries)", servers.len());
        self.ice_servers.replace(servers);
    }

    fn install_session(&self, session: CallSession) {
        *self.session.lock() = Some(session);
        self.spawn_event_forwarder();
    }

    /// Leitet Engine-Events an Abonnenten weiter und hält den
    /// Session-Status synchron zum Verbindungszustand.
    fn spawn_event_forwarder(&self) {
        let mut engine_rx = self.engine.subscribe();
        let session = Arc::clone(&self.session);
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Ok(event) = engine_rx.recv().await {
                if let CallEvent::StateChanged(state) = &event {
                    let status = match state {
                        ConnectionState::Connected => Some(CallStatus::Connected),
                        ConnectionState::Failed => Some(CallStatus::Ended),
                        _ => None,
                    };
                    if let Some(status) = status {
                        let session_id = {
                            let mut guard = session.lock();
                            guard.as_mut().map(|s| {
                                s.status = status;
                                s.id.clone()
                            })
                        };
                        if let Some(session_id) = session_id {
                            let _ = event_tx.send(SessionEvent::StatusChanged {
                                session_id,
                                status,
                            });
                        }
                    }
                }
                let _ = event_tx.send(SessionEvent::Engine(event));
            }
        });

        if let Some(previous) = self.forward_task.lock().replace(handle) {
            previous.abort();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
