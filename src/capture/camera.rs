//! Kamera-Auswahl und -Capture über nokhwa
//!
//! Geräteauswahl per Enumeration (Front-Kamera über Namens-Heuristik,
//! sonst erstes Gerät), Formatwahl über eine absteigende Leiter:
//! schlägt die Wunschauflösung fehl, wird mit niedrigerer Auflösung
//! und Framerate erneut versucht. Die eigentliche nokhwa-Anbindung
//! steckt hinter `CameraBackend`, damit Tests ohne Hardware laufen.

use super::CaptureError;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::{query, Camera};

// ============================================================================
// FORMAT LADDER
// ============================================================================

/// Eine Stufe der Auflösungs-Leiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraFormatStep {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Absteigende Versuchsreihenfolge: hoch → mittel → niedrig.
pub const FORMAT_LADDER: [CameraFormatStep; 3] = [
    CameraFormatStep {
        width: 1280,
        height: 720,
        fps: 30,
    },
    CameraFormatStep {
        width: 960,
        height: 540,
        fps: 30,
    },
    CameraFormatStep {
        width: 640,
        height: 480,
        fps: 24,
    },
];

// ============================================================================
// DEVICE SELECTION
// ============================================================================

/// Aufgezählte Kamera, backend-neutral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub index: u32,
    pub name: String,
}

/// Gewünschte Blickrichtung.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Back,
}

impl Facing {
    pub fn toggled(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }
}

/// Wählt ein Gerät: Treffer über Namens-Heuristik für die gewünschte
/// Richtung, sonst das erste Gerät, sonst nichts. Pure Funktion, damit
/// die Auswahl ohne Hardware testbar ist.
pub fn pick_camera(devices: &[CameraDescriptor], facing: Facing) -> Option<CameraDescriptor> {
    let keywords: &[&str] = match facing {
        Facing::Front => &["front", "facetime", "user"],
        Facing::Back => &["back", "rear", "environment"],
    };

    devices
        .iter()
        .find(|d| {
            let name = d.name.to_lowercase();
            keywords.iter().any(|k| name.contains(k))
        })
        .or_else(|| devices.first())
        .cloned()
}

// ============================================================================
// BACKEND
// ============================================================================

/// Laufende Capture-Session; das Gerät wird bei Drop freigegeben.
pub trait CameraSession: Send {
    fn descriptor(&self) -> &CameraDescriptor;
    fn format(&self) -> CameraFormatStep;
}

/// Schmale Kamera-Schnittstelle für Enumeration und Öffnen.
pub trait CameraBackend: Send + Sync {
    fn enumerate(&self) -> Result<Vec<CameraDescriptor>, CaptureError>;
    fn open(
        &self,
        device: &CameraDescriptor,
        format: CameraFormatStep,
    ) -> Result<Box<dyn CameraSession>, CaptureError>;
}

/// Produktiv-Backend über nokhwa.
pub struct NokhwaBackend;

struct NokhwaSession {
    descriptor: CameraDescriptor,
    format: CameraFormatStep,
    camera: Camera,
}

// nokhwa::Camera ist nicht Send; die Session wird nur aus dem
// Capture-Besitzer-Thread bedient
unsafe impl Send for NokhwaSession {}

impl CameraSession for NokhwaSession {
    fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    fn format(&self) -> CameraFormatStep {
        self.format
    }
}

impl Drop for NokhwaSession {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Camera stream stop failed: {}", e);
        }
        tracing::info!("Camera released: {}", self.descriptor.name);
    }
}

impl CameraBackend for NokhwaBackend {
    fn enumerate(&self) -> Result<Vec<CameraDescriptor>, CaptureError> {
        let infos = query(ApiBackend::Auto)
            .map_err(|e| CaptureError::CameraEnumeration(e.to_string()))?;

        Ok(infos
            .iter()
            .enumerate()
            .map(|(i, info)| CameraDescriptor {
                index: i as u32,
                name: info.human_name(),
            })
            .collect())
    }

    fn open(
        &self,
        device: &CameraDescriptor,
        format: CameraFormatStep,
    ) -> Result<Box<dyn CameraSession>, CaptureError> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(format.width, format.height),
                FrameFormat::MJPEG,
                format.fps,
            ),
        ));

        let mut camera = Camera::new(CameraIndex::Index(device.index), requested)
            .map_err(|e| CaptureError::CameraOpen(e.to_string()))?;

        camera
            .open_stream()
            .map_err(|e| CaptureError::CameraOpen(e.to_string()))?;

        tracing::info!(
            "Camera capture started: {} @ {}x{}/{}fps",
            device.name,
            format.width,
            format.height,
            format.fps
        );

        Ok(Box::new(NokhwaSession {
            descriptor: device.clone(),
            format,
            camera,
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<CameraDescriptor> {
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

    #[test]
    fn test_front_camera_matched_by_name() {
        let picked = pick_camera(&devices(), Facing::Front).unwrap();
        assert_eq!(picked.index, 1);
    }

    #[test]
    fn test_back_camera_matched_by_name() {
        let picked = pick_camera(&devices(), Facing::Back).unwrap();
        assert_eq!(picked.index, 0);
    }

    #[test]
    fn test_fallback_to_first_device() {
        let only = vec![CameraDescriptor {
            index: 0,
            name: "USB Webcam".to_string(),
        }];
        let picked = pick_camera(&only, Facing::Front).unwrap();
        assert_eq!(picked.index, 0);
    }

    #[test]
    fn test_no_devices_yields_none() {
        assert!(pick_camera(&[], Facing::Front).is_none());
    }

    #[test]
    fn test_ladder_descends() {
        assert!(FORMAT_LADDER[0].width > FORMAT_LADDER[1].width);
        assert!(FORMAT_LADDER[1].width > FORMAT_LADDER[2].width);
        assert!(FORMAT_LADDER[0].fps >= FORMAT_LADDER[2].fps);
    }
}
