//! Gemeinsame Identifikations- und Zustandstypen fuer quizlink
//!
//! Verbindungs-IDs verwenden das Newtype-Pattern, damit sie nicht mit
//! Ports oder anderen Zahlen verwechselt werden koennen.

use serde::{Deserialize, Serialize};

/// Eindeutige Verbindungs-ID (nur Server-Rolle)
///
/// Wird beim Accept aus einem monoton steigenden Zaehler vergeben und
/// waehrend der Laufzeit eines Managers nie wiederverwendet. Nach aussen
/// ist die ID opak; intern dient der Rohwert zugleich als Poll-Token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Erstellt eine ConnectionId aus einem Rohwert
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Gibt den Rohwert zurueck
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Rolle eines Verbindungs-Managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rolle {
    /// Lauschender Manager, nimmt Teilnehmer an
    Server,
    /// Waehlender Manager, baut genau eine Verbindung auf
    Client,
}

/// Handshake-Stufe einer Verbindung
///
/// Die Reihenfolge der Zwischenstufen haengt von der Rolle ab:
///
/// ```text
/// Server: Init -> TokenReceived -> TokenSent -> Established
/// Client: Init -> TokenSent -> TokenReceived -> Established
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeStage {
    Init,
    TokenReceived,
    TokenSent,
    Established,
}

impl HandshakeStage {
    /// Position der Stufe im Ablauf der gegebenen Rolle (0..=3)
    pub fn rang(self, rolle: Rolle) -> u8 {
        match (self, rolle) {
            (Self::Init, _) => 0,
            (Self::TokenReceived, Rolle::Server) | (Self::TokenSent, Rolle::Client) => 1,
            (Self::TokenSent, Rolle::Server) | (Self::TokenReceived, Rolle::Client) => 2,
            (Self::Established, _) => 3,
        }
    }

    /// Kurzname fuer Logs und Event-Payloads
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::TokenReceived => "token-received",
            Self::TokenSent => "token-sent",
            Self::Established => "established",
        }
    }
}

impl std::fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
