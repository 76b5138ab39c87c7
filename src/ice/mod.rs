//! ICE Module - TURN/STUN Server-Konfiguration
//!
//! Dieses Modul verwaltet:
//! - Beschaffung kurzlebiger TURN-Credentials (Backend → Relay-API → STUN-Fallback)
//! - Den prozessweiten, race-sicheren `IceServerSlot`

mod credentials;

pub use credentials::{
    default_stun_servers, CredentialConfig, CredentialProvider, IceServerEntry, IceServerSet,
    IceServerSlot,
};
