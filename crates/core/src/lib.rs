//! quizlink-core – Gemeinsame Typen, Events und Fehlertypen
//!
//! Dieses Crate stellt die Bausteine bereit, die sowohl der
//! Verbindungs-Manager (`quizlink-net`) als auch die Anwendungsschicht
//! (Spiellogik, Oberflaeche) kennen muessen: Verbindungs-IDs, das
//! Event-Modell und die Fehlertaxonomie.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{QuizlinkError, Result};
pub use event::{EventKind, NetEvent};
pub use types::{ConnectionId, HandshakeStage, Rolle};
