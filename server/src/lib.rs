//! quizlink-server – Bibliotheks-Root
//!
//! Verbindet die Server-Konfiguration mit dem lauschenden
//! Verbindungs-Manager. Spiellogik und Oberflaeche haengen sich spaeter
//! ueber dieselben Events an; der Server selbst protokolliert nur und
//! spiegelt auf Wunsch empfangene Daten zurueck.

pub mod config;

use anyhow::Result;
use config::ServerConfig;
use quizlink_net::{EventKind, ListeningManager, NetEvent};
use std::net::SocketAddr;

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
    manager: ListeningManager,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Result<Self> {
        let manager = ListeningManager::neu(config.netzwerk.clone())?;
        Ok(Self { config, manager })
    }

    pub fn manager(&self) -> &ListeningManager {
        &self.manager
    }

    /// Registriert Protokollierung und optionales Echo, startet den Listener
    pub fn hochfahren(&self) -> Result<SocketAddr> {
        self.manager.attach_global_listener(|kind, event| {
            tracing::debug!(event = %kind, id = ?event.connection_id(), "Event");
        });

        if self.config.echo {
            let manager = self.manager.clone();
            self.manager.subscribe(EventKind::Data, move |event| {
                if let NetEvent::Data { id: Some(id), data } = event {
                    if let Err(e) = manager.send(*id, data) {
                        tracing::warn!(id = %id, fehler = %e, "Echo fehlgeschlagen");
                    }
                }
            });
        }

        let adresse = self.manager.start()?;
        Ok(adresse)
    }

    /// Startet den Listener und laeuft bis zum Shutdown-Signal
    pub async fn starten(self) -> Result<()> {
        let adresse = self.hochfahren()?;
        tracing::info!(
            adresse = %adresse,
            echo = self.config.echo,
            "Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)..."
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown-Signal empfangen, Server wird beendet");

        self.manager.stop();
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.join()).await?;
        self.manager.unsubscribe_all();

        Ok(())
    }
}
