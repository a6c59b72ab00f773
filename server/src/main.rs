//! quizlink Server – Binary fuer die Admin-Seite
//!
//! Pfad der TOML-Datei: erstes Argument, sonst `QUIZLINK_CONFIG`, sonst
//! `quizlink.toml` im Arbeitsverzeichnis. Beendet wird mit Ctrl-C.

use anyhow::{Context, Result};
use quizlink_server::{config::ServerConfig, Server};

const STANDARD_PFAD: &str = "quizlink.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_pfad = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QUIZLINK_CONFIG").ok())
        .unwrap_or_else(|| STANDARD_PFAD.into());

    let config = ServerConfig::laden(&config_pfad)?;
    logging_einrichten(&config.logging.level, &config.logging.format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        bind = %config.netzwerk.bind_adresse,
        handshake_frist_ms = config.netzwerk.handshake_frist_ms,
        echo = config.echo,
        "quizlink Server startet"
    );

    Server::neu(config)?.starten().await
}

/// Text- oder JSON-Ausgabe; `RUST_LOG` hat Vorrang vor dem Level aus der Datei
///
/// Die Event-Loops laufen auf benannten Threads (`quizlink-server`,
/// `quizlink-client`), deshalb stehen Thread-Namen in jeder Zeile.
fn logging_einrichten(level: &str, format: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let basis = fmt().with_env_filter(filter).with_thread_names(true);

    let ergebnis = if format == "json" {
        basis.json().try_init()
    } else {
        basis.with_target(false).try_init()
    };
    ergebnis
        .map_err(|e| anyhow::anyhow!(e))
        .context("Logging konnte nicht eingerichtet werden")
}
