//! TURN-Credential-Beschaffung mit Fallback-Kette
//!
//! Reihenfolge: privater Backend-Token-Endpoint → Token-API des
//! Relay-Anbieters (API-Key/Secret) → statische STUN-Server. Jeder
//! Schritt hat sein eigenes Timeout; Fehler eines Schritts fallen
//! still zum nächsten durch. Die Funktion liefert daher immer eine
//! nicht-leere Server-Liste.

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// SERVER SET
// ============================================================================

/// Ein einzelner ICE-Server-Eintrag (STUN oder TURN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Geordnete Liste von ICE-Servern für eine Peer Connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServerSet {
    entries: Vec<IceServerEntry>,
}

impl IceServerSet {
    pub fn new(entries: Vec<IceServerEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[IceServerEntry] {
        &self.entries
    }

    /// Konvertiert in die webrtc-rs Konfigurationsform.
    pub fn to_rtc(&self) -> Vec<RTCIceServer> {
        self.entries
            .iter()
            .map(|e| RTCIceServer {
                urls: e.urls.clone(),
                username: e.username.clone().unwrap_or_default(),
                credential: e.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

/// Statische STUN-Server, die ohne Netzwerkzugriff konstruiert werden.
pub fn default_stun_servers() -> IceServerSet {
    IceServerSet::new(vec![IceServerEntry {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }])
}

/// Prozessweiter Slot für die aktuell gültige Server-Liste.
///
/// Single-Writer/Multi-Reader: der Orchestrator ersetzt die Liste vor
/// dem Wählen, die Engine liest sie beim Aufbau der Peer Connection.
pub struct IceServerSlot {
    inner: RwLock<IceServerSet>,
}

impl IceServerSlot {
    /// Startet mit den statischen STUN-Fallback-Einträgen.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(default_stun_servers()),
        }
    }

    pub fn replace(&self, set: IceServerSet) {
        if set.is_empty() {
            tracing::warn!("Ignoring empty ICE server set");
            return;
        }
        *self.inner.write() = set;
    }

    pub fn snapshot(&self) -> IceServerSet {
        self.inner.read().clone()
    }
}

impl Default for IceServerSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// `urls` kommt je nach Endpoint als String oder als Array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(u) => vec![u],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireIceServer {
    urls: OneOrMany,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

/// Antwortform: entweder `{"iceServers": [...]}` oder ein nacktes Array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<WireIceServer>,
    },
    Bare(Vec<WireIceServer>),
}

impl WireResponse {
    fn into_set(self) -> IceServerSet {
        let servers = match self {
            WireResponse::Wrapped { ice_servers } => ice_servers,
            WireResponse::Bare(servers) => servers,
        };
        IceServerSet::new(
            servers
                .into_iter()
                .map(|s| IceServerEntry {
                    urls: s.urls.into_vec(),
                    username: s.username,
                    credential: s.credential,
                })
                .filter(|e| !e.urls.is_empty())
                .collect(),
        )
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Timeout pro Beschaffungs-Schritt. Bewusst kurz: der Call-Aufbau
/// wartet auf das Ergebnis, und der STUN-Fallback greift immer.
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(4);

/// Endpunkte und Schlüssel für die Credential-Beschaffung.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Privater Backend-Endpoint (POST, liefert ICE-Server-JSON).
    pub backend_url: Option<String>,
    /// Token-API des Relay-Anbieters.
    pub relay_token_url: Option<String>,
    /// Eingebettete API-Credentials für die Relay-Token-API.
    pub relay_api_key: Option<String>,
    pub relay_api_secret: Option<String>,
    /// Timeout pro Schritt.
    pub step_timeout: Duration,
}

impl Default for CredentialConfig {
    /// Keine Endpunkte, aber ein brauchbarer Schritt-Timeout: ein
    /// Null-Timeout würde jeden konfigurierten Endpoint sofort
    /// scheitern lassen und still auf STUN degradieren.
    fn default() -> Self {
        Self {
            backend_url: None,
            relay_token_url: None,
            relay_api_key: None,
            relay_api_secret: None,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl CredentialConfig {
    /// Liest die Endpunkte aus Umgebungsvariablen.
    pub fn from_env() -> Self {
        Self {
            backend_url: std::env::var("FITCALL_CREDENTIAL_URL").ok(),
            relay_token_url: std::env::var("FITCALL_RELAY_TOKEN_URL").ok(),
            relay_api_key: std::env::var("FITCALL_RELAY_API_KEY").ok(),
            relay_api_secret: std::env::var("FITCALL_RELAY_API_SECRET").ok(),
            ..Self::default()
        }
    }
}

// ============================================================================
// CREDENTIAL PROVIDER
// ============================================================================

/// Beschafft kurzlebige Relay-Credentials für NAT-Traversal.
///
/// Mutiert selbst keine globale ICE-Konfiguration; das Eintragen in den
/// `IceServerSlot` ist Sache des Aufrufers.
pub struct CredentialProvider {
    http: reqwest::Client,
    config: CredentialConfig,
}

impl CredentialProvider {
    pub fn new(config: CredentialConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Holt eine frische Server-Liste. Schlägt nie fehl: spätestens die
    /// statischen STUN-Einträge greifen immer.
    pub async fn fetch_turn_credentials(&self) -> IceServerSet {
        match self.fetch_from_backend().await {
            Ok(set) if !set.is_empty() => {
                tracing::info!("TURN credentials from backend ({} entries)", set.len());
                return set;
            }
            Ok(_) => tracing::warn!("Backend returned empty ICE server list"),
            Err(e) => tracing::warn!("Backend credential fetch failed: {:#}", e),
        }

        match self.fetch_from_relay_api().await {
            Ok(set) if !set.is_empty() => {
                tracing::info!("TURN credentials from relay API ({} entries)", set.len());
                return set;
            }
            Ok(_) => tracing::warn!("Relay API returned empty ICE server list"),
            Err(e) => tracing::warn!("Relay API credential fetch failed: {:#}", e),
        }

        tracing::info!("Falling back to static STUN servers");
        default_stun_servers()
    }

    /// Schritt (a): privater Backend-Token-Endpoint.
    async fn fetch_from_backend(&self) -> Result<IceServerSet> {
        let url = self
            .config
            .backend_url
            .as_deref()
            .ok_or_else(|| anyhow!("no backend credential endpoint configured"))?;

        let response = self
            .http
            .post(url)
            .timeout(self.config.step_timeout)
            .send()
            .await
            .context("backend request failed")?
            .error_for_status()
            .context("backend returned error status")?;

        let wire: WireResponse = response
            .json()
            .await
            .context("backend response is not valid ICE server JSON")?;

        Ok(wire.into_set())
    }

    /// Schritt (b): Token-API des Relay-Anbieters mit eingebetteten Keys.
    async fn fetch_from_relay_api(&self) -> Result<IceServerSet> {
        let url = self
            .config
            .relay_token_url
            .as_deref()
            .ok_or_else(|| anyhow!("no relay token endpoint configured"))?;
        let key = self
            .config
            .relay_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("no relay API key configured"))?;
        let secret = self
            .config
            .relay_api_secret
            .as_deref()
            .ok_or_else(|| anyhow!("no relay API secret configured"))?;

        let response = self
            .http
            .post(url)
            .basic_auth(key, Some(secret))
            .timeout(self.config.step_timeout)
            .send()
            .await
            .context("relay API request failed")?
            .error_for_status()
            .context("relay API returned error status")?;

        let wire: WireResponse = response
            .json()
            .await
            .context("relay API response is not valid ICE server JSON")?;

        Ok(wire.into_set())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_usable_step_timeout() {
        // Ein Null-Timeout würde jeden HTTP-Schritt sofort abbrechen
        // und die Fallback-Kette immer auf STUN durchfallen lassen
        let config = CredentialConfig::default();
        assert_eq!(config.step_timeout, DEFAULT_STEP_TIMEOUT);
        assert!(config.step_timeout > Duration::ZERO);
        assert_eq!(CredentialConfig::from_env().step_timeout, config.step_timeout);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_falls_back_to_stun() {
        let provider = CredentialProvider::new(CredentialConfig {
            step_timeout: Duration::from_millis(100),
            ..Default::default()
        });

        let set = provider.fetch_turn_credentials().await;
        assert!(!set.is_empty());
        assert!(set.entries()[0].urls[0].starts_with("stun:"));
        assert!(set.entries()[0].username.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back_to_stun() {
        // Port 9 (discard) ist praktisch nie erreichbar
        let provider = CredentialProvider::new(CredentialConfig {
            backend_url: Some("http://127.0.0.1:9/turn".to_string()),
            step_timeout: Duration::from_millis(200),
            ..Default::default()
        });

        let set = provider.fetch_turn_credentials().await;
        assert!(!set.is_empty());
    }

    #[test]
    fn test_wire_urls_as_single_string() {
        let json = r#"[{"urls": "turn:relay.example.com:3478", "username": "u", "credential": "c"}]"#;
        let wire: WireResponse = serde_json::from_str(json).unwrap();
        let set = wire.into_set();
        assert_eq!(set.len(), 1);
        assert_eq!(set.entries()[0].urls, vec!["turn:relay.example.com:3478"]);
        assert_eq!(set.entries()[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_wire_wrapped_response() {
        let json = r#"{"iceServers": [{"urls": ["stun:s.example.com"]}, {"urls": []}]}"#;
        let wire: WireResponse = serde_json::from_str(json).unwrap();
        let set = wire.into_set();
        // Eintrag ohne URLs wird verworfen
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_slot_ignores_empty_set() {
        let slot = IceServerSlot::new();
        let before = slot.snapshot();
        slot.replace(IceServerSet::default());
        assert_eq!(slot.snapshot(), before);

        let fresh = IceServerSet::new(vec![IceServerEntry {
            urls: vec!["turn:r.example.com".to_string()],
            username: Some("u".to_string()),
            credential: Some("c".to_string()),
        }]);
        slot.replace(fresh.clone());
        assert_eq!(slot.snapshot(), fresh);
    }

    #[test]
    fn test_to_rtc_mapping() {
        let set = default_stun_servers();
        let rtc = set.to_rtc();
        assert_eq!(rtc.len(), 1);
        assert_eq!(rtc[0].urls.len(), 3);
        assert!(rtc[0].username.is_empty());
    }
}
