//! Konfiguration der Verbindungs-Manager
//!
//! Token und Adressen werden beim Erstellen eines Managers uebergeben. Woher
//! sie stammen (TOML-Datei, Umgebung) entscheidet die Anwendung; alle Felder
//! haben Standardwerte, damit Teilkonfigurationen geladen werden koennen.

use bytes::Bytes;
use quizlink_core::{QuizlinkError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Standard-Token beider Rollen
pub const STANDARD_TOKEN: &str = "India";

/// Hoechstens so viele Bytes liest eine Verbindung pro Tick
pub const STANDARD_LESE_LIMIT: usize = 64 * 1024;

/// Zeit bis zum vollstaendigen Token-Austausch
pub const STANDARD_HANDSHAKE_FRIST_MS: u64 = 5_000;

/// Einstellungen der Server-Rolle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerKonfig {
    /// Bind-Adresse inklusive Port (Port 0 = vom System vergeben)
    pub bind_adresse: String,
    /// Gemeinsames Handshake-Token
    pub token: String,
    /// Groesse eines einzelnen Lesevorgangs in Bytes
    pub lese_puffer: usize,
    /// Obergrenze gelesener Bytes pro Verbindung und Tick
    pub lese_limit: usize,
    /// Frist fuer den Token-Austausch in Millisekunden
    pub handshake_frist_ms: u64,
    /// Maximale Bereitschaftsmeldungen pro Poll-Durchlauf
    pub poll_kapazitaet: usize,
}

impl Default for ServerKonfig {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0:5050".into(),
            token: STANDARD_TOKEN.into(),
            lese_puffer: 1024,
            lese_limit: STANDARD_LESE_LIMIT,
            handshake_frist_ms: STANDARD_HANDSHAKE_FRIST_MS,
            poll_kapazitaet: 128,
        }
    }
}

impl ServerKonfig {
    /// Standardwerte mit abweichender Bind-Adresse
    pub fn neu(bind_adresse: impl Into<String>) -> Self {
        Self {
            bind_adresse: bind_adresse.into(),
            ..Self::default()
        }
    }

    pub fn mit_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn mit_handshake_frist(mut self, frist: Duration) -> Self {
        self.handshake_frist_ms = u64::try_from(frist.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn token_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.token.as_bytes())
    }

    pub fn handshake_frist(&self) -> Duration {
        Duration::from_millis(self.handshake_frist_ms)
    }

    pub fn validieren(&self) -> Result<()> {
        if self.bind_adresse.trim().is_empty() {
            return Err(QuizlinkError::konfiguration("bind_adresse darf nicht leer sein"));
        }
        self.grenzen().validieren()
    }
}

/// Einstellungen der Client-Rolle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientKonfig {
    /// Adresse des Servers (`host:port`, wird beim Verbinden aufgeloest)
    pub server_adresse: String,
    pub token: String,
    pub lese_puffer: usize,
    pub lese_limit: usize,
    pub handshake_frist_ms: u64,
    pub poll_kapazitaet: usize,
}

impl Default for ClientKonfig {
    fn default() -> Self {
        Self {
            server_adresse: "127.0.0.1:5050".into(),
            token: STANDARD_TOKEN.into(),
            lese_puffer: 1024,
            lese_limit: STANDARD_LESE_LIMIT,
            handshake_frist_ms: STANDARD_HANDSHAKE_FRIST_MS,
            poll_kapazitaet: 16,
        }
    }
}

impl ClientKonfig {
    pub fn neu(server_adresse: impl Into<String>) -> Self {
        Self {
            server_adresse: server_adresse.into(),
            ..Self::default()
        }
    }

    pub fn mit_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn mit_handshake_frist(mut self, frist: Duration) -> Self {
        self.handshake_frist_ms = u64::try_from(frist.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn token_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.token.as_bytes())
    }

    pub fn handshake_frist(&self) -> Duration {
        Duration::from_millis(self.handshake_frist_ms)
    }

    pub fn validieren(&self) -> Result<()> {
        if self.server_adresse.trim().is_empty() {
            return Err(QuizlinkError::konfiguration("server_adresse darf nicht leer sein"));
        }
        self.grenzen().validieren()
    }
}

/// Gemeinsame Felder beider Rollen fuer die Validierung
struct Grenzen<'a> {
    token: &'a str,
    lese_puffer: usize,
    lese_limit: usize,
    handshake_frist_ms: u64,
    poll_kapazitaet: usize,
}

impl Grenzen<'_> {
    fn validieren(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(QuizlinkError::konfiguration("Handshake-Token darf nicht leer sein"));
        }
        if self.lese_puffer == 0 {
            return Err(QuizlinkError::konfiguration("lese_puffer muss groesser als 0 sein"));
        }
        if self.lese_limit < self.lese_puffer {
            return Err(QuizlinkError::konfiguration(
                "lese_limit darf nicht kleiner als lese_puffer sein",
            ));
        }
        if self.handshake_frist_ms == 0 {
            return Err(QuizlinkError::konfiguration("handshake_frist_ms muss groesser als 0 sein"));
        }
        if self.poll_kapazitaet == 0 {
            return Err(QuizlinkError::konfiguration("poll_kapazitaet muss groesser als 0 sein"));
        }
        Ok(())
    }
}

impl ServerKonfig {
    fn grenzen(&self) -> Grenzen<'_> {
        Grenzen {
            token: &self.token,
            lese_puffer: self.lese_puffer,
            lese_limit: self.lese_limit,
            handshake_frist_ms: self.handshake_frist_ms,
            poll_kapazitaet: self.poll_kapazitaet,
        }
    }
}

impl ClientKonfig {
    fn grenzen(&self) -> Grenzen<'_> {
        Grenzen {
            token: &self.token,
            lese_puffer: self.lese_puffer,
            lese_limit: self.lese_limit,
            handshake_frist_ms: self.handshake_frist_ms,
            poll_kapazitaet: self.poll_kapazitaet,
        }
    }
}
