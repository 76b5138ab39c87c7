//! Mikrofon-Capture über cpal
//!
//! Rohes PCM landet in einem Ring-Buffer, aus dem die Engine Frames
//! zieht. Resampling auf 48kHz passiert direkt im Capture-Callback.

use super::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, Opus-Standard)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame-Größe in Samples (20ms @ 48kHz = 960 Samples)
pub const FRAME_SIZE: usize = 960;

/// Kapazität des Capture-Ring-Buffers
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Besitzt den Mikrofon-Stream.
///
/// Note: cpal-Streams sind nicht Send, daher wird der Container
/// manuell als Send markiert und der Stream nur aus einem Thread
/// bedient.
pub struct MicrophoneCapture {
    input_device: Option<Device>,
    input_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM, 48kHz mono)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Mute-Status; bleibt über Fokus-Verlust hinweg erhalten
    is_muted: Arc<Mutex<bool>>,

    /// Input-Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
}

unsafe impl Send for MicrophoneCapture {}

impl MicrophoneCapture {
    pub fn new() -> Self {
        let input_device = cpal::default_host().default_input_device();
        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }

        Self {
            input_device,
            input_stream: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Startet das Mikrofon. Idempotent: ein laufender Stream bleibt.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.input_stream.is_some() {
            return Ok(());
        }

        let device = self
            .input_device
            .as_ref()
            .ok_or(CaptureError::NoInputDevice)?;

        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting microphone capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let muted = *is_muted.lock();

                    // Level berechnen (RMS), auch im Mute-Fall
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if muted {
                        return;
                    }

                    // Lineares Resampling auf 48kHz falls nötig
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Microphone capture error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::StreamPlay(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Stoppt das Mikrofon und gibt das Gerät frei. Safe wenn inaktiv.
    pub fn stop(&mut self) {
        if self.input_stream.take().is_some() {
            tracing::info!("Microphone capture stopped");
        }
        *self.input_level.lock() = 0.0;
    }

    pub fn is_active(&self) -> bool {
        self.input_stream.is_some()
    }

    /// Liest einen vollen 20ms-Frame, falls genug Samples vorhanden sind.
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Microphone muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Wählt die beste Input-Konfiguration: 48kHz/F32 bevorzugt,
    /// sonst beste verfügbare F32-Rate, sonst irgendeine.
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, CaptureError> {
        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?
            .collect();

        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(CaptureError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

impl Default for MicrophoneCapture {
    fn default() -> Self {
        Self::new()
    }
}
