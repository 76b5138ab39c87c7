//! Capture Module - Mikrofon- und Kamera-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Capture über cpal (Ring-Buffer, Level-Metering, Mute)
//! - Kamera-Auswahl und -Capture über nokhwa (Auflösungs-Leiter,
//!   Front/Back-Wechsel)
//!
//! Encoding und RTP-Versand sind Sache der Media Engine, nicht dieses
//! Moduls.

mod camera;
mod manager;
mod microphone;

pub use camera::{
    pick_camera, CameraBackend, CameraDescriptor, CameraFormatStep, CameraSession, Facing,
    NokhwaBackend, FORMAT_LADDER,
};
pub use manager::MediaCaptureManager;
pub use microphone::{MicrophoneCapture, FRAME_SIZE, SAMPLE_RATE};

use thiserror::Error;

/// Fehler der Capture-Schicht. Kamera-Fehler sind nie fatal für den
/// Call: Video bleibt einfach aus, Audio läuft weiter.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlay(String),

    #[error("No camera device found")]
    NoCamera,

    #[error("Camera enumeration failed: {0}")]
    CameraEnumeration(String),

    #[error("Camera open failed: {0}")]
    CameraOpen(String),

    #[error("All capture formats failed, video stays off")]
    FormatLadderExhausted,
}
