//! Audio Module - Geräte-Routing und Audio-Fokus
//!
//! Dieses Modul verwaltet:
//! - Den In-Call-Audiomodus (Routing, Lautsprecher, Mikrofon-Mute)
//! - Transienten exklusiven Audio-Fokus inkl. Verlust/Rückgewinn
//!
//! Unabhängig vom Call-Zustand; die Engine ruft nur hinein.

mod route;

pub use route::{
    AudioMode, AudioOs, AudioRouteState, AudioSessionController, FocusChange, SystemAudio,
};
