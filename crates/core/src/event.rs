//! Event-Modell des Verbindungs-Managers
//!
//! Die Anwendungsschicht (Spielrunden, Oberflaeche) reagiert ausschliesslich
//! ueber diese Events auf den Verbindungs-Lebenszyklus und eingehende Daten.
//! Jedes Event hat einen festen Namen (`EventKind`), unter dem es abonniert
//! wird.

use crate::error::QuizlinkError;
use crate::types::{ConnectionId, HandshakeStage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Name eines Events (Schluessel fuer Abonnements)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewConnection,
    HandshakeFailed,
    HandshakeDone,
    HandshakeError,
    DataPacket,
    Data,
    Disconnected,
    Error,
}

impl EventKind {
    /// Alle Event-Namen in fester Reihenfolge
    pub const ALLE: [EventKind; 8] = [
        Self::NewConnection,
        Self::HandshakeFailed,
        Self::HandshakeDone,
        Self::HandshakeError,
        Self::DataPacket,
        Self::Data,
        Self::Disconnected,
        Self::Error,
    ];

    /// Gibt den Event-Namen als String zurueck
    pub fn name(self) -> &'static str {
        match self {
            Self::NewConnection => "new-connection",
            Self::HandshakeFailed => "handshake-failed",
            Self::HandshakeDone => "handshake-done",
            Self::HandshakeError => "handshake-error",
            Self::DataPacket => "data-packet",
            Self::Data => "data",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventKind {
    type Err = QuizlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALLE
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| QuizlinkError::UnbekanntesEvent(s.to_string()))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ein vom Verbindungs-Manager ausgeloestes Event
///
/// Payloads der Server-Rolle tragen `Some(id)`, die der Client-Rolle `None`,
/// da der Client genau eine Verbindung verwaltet.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// Teilnehmer angenommen, Handshake noch offen
    NewConnection { id: ConnectionId, peer: SocketAddr },
    /// Token des Teilnehmers stimmt nicht (nur Server)
    HandshakeFailed {
        id: ConnectionId,
        stage: HandshakeStage,
        peer_port: u16,
    },
    /// Handshake abgeschlossen
    HandshakeDone { id: Option<ConnectionId> },
    /// Token-Fehler oder IO-Fehler waehrend des Handshakes (Client)
    HandshakeError {
        id: Option<ConnectionId>,
        error: Arc<QuizlinkError>,
    },
    /// Sofort-Benachrichtigung pro Lesevorgang (nach dem Handshake)
    DataPacket {
        id: Option<ConnectionId>,
        data: Bytes,
    },
    /// Gesammelte Eingangsdaten, ausgeliefert bei Schreibbereitschaft
    Data {
        id: Option<ConnectionId>,
        data: Bytes,
    },
    /// Verbindung entfernt/geschlossen
    Disconnected { id: Option<ConnectionId> },
    /// Fataler Fehler der Client-Loop
    Error { error: Arc<QuizlinkError> },
}

impl NetEvent {
    /// Gibt den Event-Namen zurueck
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewConnection { .. } => EventKind::NewConnection,
            Self::HandshakeFailed { .. } => EventKind::HandshakeFailed,
            Self::HandshakeDone { .. } => EventKind::HandshakeDone,
            Self::HandshakeError { .. } => EventKind::HandshakeError,
            Self::DataPacket { .. } => EventKind::DataPacket,
            Self::Data { .. } => EventKind::Data,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Gibt die betroffene Verbindung zurueck, falls das Event eine traegt
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::NewConnection { id, .. } | Self::HandshakeFailed { id, .. } => Some(*id),
            Self::HandshakeDone { id }
            | Self::HandshakeError { id, .. }
            | Self::DataPacket { id, .. }
            | Self::Data { id, .. }
            | Self::Disconnected { id } => *id,
            Self::Error { .. } => None,
        }
    }

    /// Gibt die Nutzdaten von `data`/`data-packet` zurueck
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::DataPacket { data, .. } | Self::Data { data, .. } => Some(data),
            _ => None,
        }
    }
}
