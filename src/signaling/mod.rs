//! Signaling Module - Wire-Format für den externen Transport
//!
//! Der eigentliche Transport (Push-Nachrichten bzw. der
//! App-WebSocket) liegt außerhalb dieser Bibliothek; hier leben nur
//! die typsicheren Payloads, die darüber relayt werden.

mod messages;

pub use messages::*;
