//! quizlink-net – Readiness-gesteuerter TCP-Verbindungs-Manager
//!
//! Dieser Crate verwaltet viele gleichzeitige Teilnehmer-Verbindungen ohne
//! Thread pro Verbindung. Jede Verbindung durchlaeuft einen Token-Handshake,
//! bevor ihre Daten an die Anwendung gehen. Die Anwendung reagiert
//! ausschliesslich ueber Events und ruft `send`/`broadcast` auf.
//!
//! ## Architektur
//!
//! ```text
//! ListeningManager (Server)        DialingManager (Client)
//!     |  eigener Loop-Thread           |  eigener Loop-Thread
//!     v                                v
//! Multiplexer (mio Poll + Waker) <-----+
//!     |
//!     v
//! Verbindung (Ein-/Ausgangspuffer)
//!     |  Handshake: Init -> TokenReceived/TokenSent -> Established
//!     v
//! EventEmitter (Abonnenten + globaler Listener)
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod emitter;
pub mod handshake;
pub mod poller;
pub mod server;

// Bequeme Re-Exporte
pub use client::DialingManager;
pub use config::{
    ClientKonfig, ServerKonfig, STANDARD_HANDSHAKE_FRIST_MS, STANDARD_LESE_LIMIT, STANDARD_TOKEN,
};
pub use emitter::{EventEmitter, SubscriptionId};
pub use server::ListeningManager;

pub use quizlink_core::{
    ConnectionId, EventKind, HandshakeStage, NetEvent, QuizlinkError, Result, Rolle,
};
