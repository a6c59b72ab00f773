//! Fehlertypen fuer quizlink
//!
//! Zentraler Fehler-Enum fuer den Verbindungs-Manager. Fehler, die nur eine
//! Verbindung betreffen, duerfen die gemeinsame Event-Loop nie beenden.

use crate::types::ConnectionId;
use thiserror::Error;

/// Globaler Result-Alias fuer quizlink
pub type Result<T> = std::result::Result<T, QuizlinkError>;

/// Alle moeglichen Fehler im Verbindungs-Manager
#[derive(Debug, Error)]
pub enum QuizlinkError {
    // --- Adressierung ---
    /// Ziel von send/send_immediate/close ist nicht in der Verbindungstabelle
    #[error("Unbekannte Verbindung: {0}")]
    UnknownConnection(ConnectionId),

    /// Client-Manager hat keine aktive Verbindung
    #[error("Nicht verbunden")]
    NichtVerbunden,

    // --- Handshake ---
    /// Token-Vergleich fehlgeschlagen
    #[error("Handshake-Token stimmt nicht: erwartet={erwartet:?}, erhalten={erhalten:?}")]
    HandshakeMismatch { erwartet: Vec<u8>, erhalten: Vec<u8> },

    /// Innerhalb der Handshake-Frist kam kein vollstaendiges Token an
    #[error("Handshake-Frist abgelaufen nach {frist_ms} ms, erhalten={erhalten:?}")]
    HandshakeZeitueberschreitung { frist_ms: u64, erhalten: Vec<u8> },

    // --- Transport ---
    /// Lese-, Schreib-, Accept- oder Connect-Fehler
    #[error("Transportfehler: {0}")]
    Transport(#[from] std::io::Error),

    /// Fehler beim Abmelden/Schliessen einer Verbindung (wird nur geloggt)
    #[error("Aufraeumen fehlgeschlagen: {0}")]
    Cleanup(String),

    // --- Events ---
    /// Event-Name ist nicht bekannt
    #[error("Unbekanntes Event: {0}")]
    UnbekanntesEvent(String),

    /// Ein Abonnent ist waehrend der Zustellung in Panik geraten
    #[error("Abonnent fuer '{event}' fehlgeschlagen: {grund}")]
    Subscriber { event: &'static str, grund: String },

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),
}

impl QuizlinkError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Erstellt einen Konfigurationsfehler
    pub fn konfiguration(msg: impl Into<String>) -> Self {
        Self::Konfiguration(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler die Verbindung unbrauchbar macht
    ///
    /// Solche Fehler loesen das Aufraeumen der betroffenen Verbindung aus.
    pub fn trennt_verbindung(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Subscriber { .. })
    }
}
