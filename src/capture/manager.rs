//! Media Capture Manager - besitzt Mikrofon- und Kamera-Lebenszyklus
//!
//! Einmal pro Prozess konstruieren; Mikrofon und Kamera sind
//! prozessweit exklusive Ressourcen, die nur ein Call gleichzeitig
//! halten darf (durchgesetzt vom Orchestrator, nicht von der Hardware).

use super::camera::{pick_camera, CameraBackend, CameraSession, Facing, NokhwaBackend, FORMAT_LADDER};
use super::microphone::MicrophoneCapture;
use super::CaptureError;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct MediaCaptureManager {
    microphone: Mutex<MicrophoneCapture>,
    camera_backend: Arc<dyn CameraBackend>,
    camera_session: Mutex<Option<Box<dyn CameraSession>>>,
    /// Front/Back-Präferenz; überlebt Stop/Start
    facing: Mutex<Facing>,
}

impl MediaCaptureManager {
    pub fn new(camera_backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            microphone: Mutex::new(MicrophoneCapture::new()),
            camera_backend,
            camera_session: Mutex::new(None),
            facing: Mutex::new(Facing::Front),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(NokhwaBackend))
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    pub fn start_audio_capture(&self) -> Result<(), CaptureError> {
        self.microphone.lock().start()
    }

    pub fn stop_audio_capture(&self) {
        self.microphone.lock().stop();
    }

    pub fn is_audio_active(&self) -> bool {
        self.microphone.lock().is_active()
    }

    pub fn set_muted(&self, muted: bool) {
        self.microphone.lock().set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.microphone.lock().is_muted()
    }

    pub fn input_level(&self) -> f32 {
        self.microphone.lock().input_level()
    }

    /// Liest einen 20ms-PCM-Frame vom Mikrofon, falls verfügbar.
    pub fn read_audio_frame(&self) -> Option<Vec<f32>> {
        self.microphone.lock().read_frame()
    }

    // ========================================================================
    // VIDEO
    // ========================================================================

    /// Startet Kamera-Capture mit Auflösungs-Leiter.
    ///
    /// Eine bereits laufende Session wird vorher freigegeben, damit nie
    /// zwei aktive Capture-Sessions existieren. Scheitern alle Stufen,
    /// ist das ein nicht-fataler Fehler: Video bleibt aus.
    pub fn start_video_capture(&self, prefer_front: bool) -> Result<(), CaptureError> {
        *self.facing.lock() = if prefer_front {
            Facing::Front
        } else {
            Facing::Back
        };
        self.start_video_with_current_facing()
    }

    fn start_video_with_current_facing(&self) -> Result<(), CaptureError> {
        let facing = *self.facing.lock();

        let devices = self.camera_backend.enumerate()?;
        let device = pick_camera(&devices, facing).ok_or(CaptureError::NoCamera)?;

        // Alte Session zuerst freigeben (exklusive Ressource)
        self.camera_session.lock().take();

        for step in FORMAT_LADDER {
            match self.camera_backend.open(&device, step) {
                Ok(session) => {
                    *self.camera_session.lock() = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Camera format {}x{}/{}fps failed: {}, trying lower",
                        step.width,
                        step.height,
                        step.fps,
                        e
                    );
                }
            }
        }

        Err(CaptureError::FormatLadderExhausted)
    }

    /// Gibt Kamera und Rendering-Ressourcen vollständig frei.
    /// Safe wenn gerade nicht aufgenommen wird.
    pub fn stop_video_capture(&self) {
        self.camera_session.lock().take();
    }

    pub fn is_video_active(&self) -> bool {
        self.camera_session.lock().is_some()
    }

    /// Wechselt Front/Back. Läuft gerade eine Session, wird sie mit dem
    /// neuen Gerät neu gestartet; sonst wird nur die Präferenz für den
    /// nächsten Start gemerkt.
    pub fn switch_device(&self) -> Result<(), CaptureError> {
        let new_facing = {
            let mut facing = self.facing.lock();
            *facing = facing.toggled();
            *facing
        };
        tracing::info!("Camera preference switched to {:?}", new_facing);

        if self.is_video_active() {
            self.start_video_with_current_facing()
        } else {
            Ok(())
        }
    }

    pub fn facing(&self) -> Facing {
        *self.facing.lock()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::{CameraDescriptor, CameraFormatStep};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake-Backend: zählt offene Sessions, kann Stufen gezielt
    /// fehlschlagen lassen.
    struct FakeBackend {
        devices: Vec<CameraDescriptor>,
        /// Breiten, deren Öffnen fehlschlägt
        fail_widths: Vec<u32>,
        open_sessions: Arc<AtomicUsize>,
    }

    struct FakeSession {
        descriptor: CameraDescriptor,
        format: CameraFormatStep,
        open_sessions: Arc<AtomicUsize>,
    }

    impl CameraSession for FakeSession {
        fn descriptor(&self) -> &CameraDescriptor {
            &self.descriptor
        }
        fn format(&self) -> CameraFormatStep {
            self.format
        }
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl CameraBackend for FakeBackend {
        fn enumerate(&self) -> Result<Vec<CameraDescriptor>, CaptureError> {
            Ok(self.devices.clone())
        }

        fn open(
            &self,
            device: &CameraDescriptor,
            format: CameraFormatStep,
        ) -> Result<Box<dyn CameraSession>, CaptureError> {
            if self.fail_widths.contains(&format.width) {
                return Err(CaptureError::CameraOpen("format rejected".to_string()));
            }
            self.open_sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                descriptor: device.clone(),
                format,
                open_sessions: Arc::clone(&self.open_sessions),
            }))
        }
    }

    fn two_cameras() -> Vec<CameraDescriptor> {
        vec![
            CameraDescriptor {
                index: 0,
                name: "Back Camera".to_string(),
            },
            CameraDescriptor {
                index: 1,
                name: "Front Camera".to_string(),
            },
        ]
    }

    fn manager_with(fail_widths: Vec<u32>) -> (MediaCaptureManager, Arc<AtomicUsize>) {
        let open_sessions = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(FakeBackend {
            devices: two_cameras(),
            fail_widths,
            open_sessions: Arc::clone(&open_sessions),
        });
        (MediaCaptureManager::new(backend), open_sessions)
    }

    #[test]
    fn test_ladder_falls_through_to_lower_format() {
        let (manager, _) = manager_with(vec![1280, 960]);

        manager.start_video_capture(true).unwrap();
        assert!(manager.is_video_active());

        let session = manager.camera_session.lock();
        assert_eq!(session.as_ref().unwrap().format().width, 640);
    }

    #[test]
    fn test_exhausted_ladder_is_nonfatal_video_off() {
        let (manager, open) = manager_with(vec![1280, 960, 640]);

        let err = manager.start_video_capture(true).unwrap_err();
        assert!(matches!(err, CaptureError::FormatLadderExhausted));
        assert!(!manager.is_video_active());
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_toggle_video_does_not_leak_sessions() {
        let (manager, open) = manager_with(vec![]);

        manager.start_video_capture(true).unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 1);

        manager.stop_video_capture();
        assert_eq!(open.load(Ordering::SeqCst), 0);

        manager.start_video_capture(true).unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 1);

        // Restart ohne vorheriges Stop darf ebenfalls nicht leaken
        manager.start_video_capture(true).unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_switch_while_idle_only_records_preference() {
        let (manager, open) = manager_with(vec![]);

        assert_eq!(manager.facing(), Facing::Front);
        manager.switch_device().unwrap();
        assert_eq!(manager.facing(), Facing::Back);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(!manager.is_video_active());
    }

    #[test]
    fn test_switch_while_active_restarts_with_other_device() {
        let (manager, open) = manager_with(vec![]);

        manager.start_video_capture(true).unwrap();
        manager.switch_device().unwrap();

        assert_eq!(open.load(Ordering::SeqCst), 1);
        let session = manager.camera_session.lock();
        assert_eq!(session.as_ref().unwrap().descriptor().index, 0);
    }

    #[test]
    fn test_stop_when_idle_is_safe() {
        let (manager, _) = manager_with(vec![]);
        manager.stop_video_capture();
        manager.stop_video_capture();
        assert!(!manager.is_video_active());
    }
}
