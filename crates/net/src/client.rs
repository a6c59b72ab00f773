//! Dialing-Manager – Client-Rolle
//!
//! Oeffnet genau eine ausgehende Verbindung und betreibt dafuer eine eigene
//! Event-Loop. Der Handshake wird vom Client angestossen: beim ersten
//! Schreibtick geht das Token direkt auf den Transport, das Echo des
//! Servers schliesst den Handshake ab.
//!
//! Ein leerer Read (Server hat geschlossen) meldet nur `disconnected`.
//! Jeder andere Fehler der Loop ist fatal und meldet `error`, danach
//! `disconnected`. Ein vom Aufrufer ausgeloestes `disconnect()` meldet
//! nichts.

use mio::net::TcpStream;
use mio::{Interest, Registry, Waker};
use parking_lot::Mutex;
use quizlink_core::{EventKind, HandshakeStage, NetEvent, QuizlinkError, Result, Rolle};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ClientKonfig;
use crate::connection::{LeseStatus, Verbindung};
use crate::emitter::{EventEmitter, SubscriptionId};
use crate::handshake::Handshake;
use crate::poller::{Multiplexer, Quelle};

/// Verbindungs-Manager der Client-Rolle
#[derive(Clone)]
pub struct DialingManager {
    inner: Arc<Gemeinsam>,
}

struct Gemeinsam {
    konfig: ClientKonfig,
    emitter: EventEmitter,
    verbindung: Mutex<Option<Verbindung<TcpStream>>>,
    /// Registry-Klon, damit `disconnect()` vom Aufrufer-Thread abmelden kann
    registry: Mutex<Option<Registry>>,
    waker: Mutex<Option<Arc<Waker>>>,
    stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DialingManager {
    pub fn neu(konfig: ClientKonfig) -> Result<Self> {
        Self::mit_emitter(konfig, EventEmitter::neu())
    }

    pub fn mit_emitter(konfig: ClientKonfig, emitter: EventEmitter) -> Result<Self> {
        konfig.validieren()?;
        Ok(Self {
            inner: Arc::new(Gemeinsam {
                konfig,
                emitter,
                verbindung: Mutex::new(None),
                registry: Mutex::new(None),
                waker: Mutex::new(None),
                stop: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        })
    }

    /// Oeffnet die Verbindung und startet die Event-Loop
    ///
    /// Der TCP-Aufbau laeuft nicht-blockierend; ein Fehlschlag wird ueber
    /// `error` und `disconnected` gemeldet. Ist bereits eine Verbindung
    /// aktiv, passiert nichts.
    pub fn connect(&self) -> Result<()> {
        let mut thread = self.inner.thread.lock();

        if self.inner.verbindung.lock().is_some() {
            tracing::debug!("Client ist bereits verbunden");
            return Ok(());
        }

        if let Some(alt) = thread.take() {
            if alt.thread().id() != std::thread::current().id() && alt.join().is_err() {
                tracing::warn!("Vorherige Client-Loop ist in Panik geraten");
            }
        }

        let adresse = aufloesen(&self.inner.konfig.server_adresse)?;
        let mut stream = TcpStream::connect(adresse)?;

        let mux = Multiplexer::neu(self.inner.konfig.poll_kapazitaet)?;
        mux.registrieren(
            &mut stream,
            Quelle::Ausgehend,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        *self.inner.registry.lock() = Some(mux.registry().try_clone()?);
        *self.inner.waker.lock() = Some(mux.waker());
        let konfig = &self.inner.konfig;
        let handshake = Handshake::fuer_rolle(Rolle::Client, konfig.token_bytes());
        let verbindung = Verbindung::neu(None, stream, adresse, handshake, konfig.lese_puffer)
            .mit_lese_limit(konfig.lese_limit)
            .mit_handshake_frist(konfig.handshake_frist());
        *self.inner.verbindung.lock() = Some(verbindung);
        self.inner.stop.store(false, Ordering::SeqCst);

        let gemeinsam = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("quizlink-client".into())
            .spawn(move || gemeinsam.event_loop(mux));

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::info!(server = %adresse, "Verbindungsaufbau gestartet");
                Ok(())
            }
            Err(e) => {
                self.inner.verbindung.lock().take();
                Err(QuizlinkError::Transport(e))
            }
        }
    }

    /// Meldet die Verbindung ab, schliesst sie und beendet die Loop
    pub fn disconnect(&self) {
        let verbindung = self.inner.verbindung.lock().take();
        if let Some(mut verbindung) = verbindung {
            if let Some(registry) = self.inner.registry.lock().as_ref() {
                if let Err(e) = registry.deregister(verbindung.stream_mut()) {
                    let fehler = QuizlinkError::Cleanup(e.to_string());
                    tracing::warn!(fehler = %fehler, "Abmelden beim Trennen fehlgeschlagen");
                }
            }
            tracing::info!(server = %verbindung.peer_addr(), "Verbindung getrennt");
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wecken();
    }

    /// Haengt Bytes an den Ausgangspuffer an
    pub fn send(&self, daten: impl AsRef<[u8]>) -> Result<()> {
        {
            let mut sperre = self.inner.verbindung.lock();
            let verbindung = sperre.as_mut().ok_or(QuizlinkError::NichtVerbunden)?;
            verbindung.einreihen(daten.as_ref());
        }
        self.inner.wecken();
        Ok(())
    }

    /// Wartet, bis der Loop-Thread beendet ist
    pub fn join(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::warn!("Client-Loop ist in Panik geraten");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.verbindung.lock().is_some()
    }

    pub fn handshake_stage(&self) -> Option<HandshakeStage> {
        self.inner.verbindung.lock().as_ref().map(|v| v.stage())
    }

    /// Adresse des Servers, solange verbunden
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.verbindung.lock().as_ref().map(|v| v.peer_addr())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .verbindung
            .lock()
            .as_ref()
            .and_then(|v| v.stream().local_addr().ok())
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&NetEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.subscribe(kind, callback)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: Option<SubscriptionId>) -> usize {
        self.inner.emitter.unsubscribe(kind, id)
    }

    pub fn unsubscribe_all(&self) {
        self.inner.emitter.unsubscribe_all();
    }

    pub fn attach_global_listener<F>(&self, listener: F)
    where
        F: Fn(EventKind, &NetEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.attach_global_listener(listener);
    }
}

fn aufloesen(adresse: &str) -> Result<SocketAddr> {
    adresse
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| QuizlinkError::konfiguration(format!("Adresse '{adresse}' nicht aufloesbar")))
}

// ---------------------------------------------------------------------------
// Event-Loop
// ---------------------------------------------------------------------------

/// Ausgang eines Loop-Durchlaufs
enum Schritt {
    Weiter,
    /// Verbindung wurde von `disconnect()` entfernt
    Entfernt,
    Geschlossen,
    Fehler(QuizlinkError),
}

impl Gemeinsam {
    fn wecken(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(e) = waker.wake() {
                tracing::warn!(fehler = %e, "Client-Loop konnte nicht geweckt werden");
            }
        }
    }

    /// Nullzeit bei anstehender Arbeit, sonst bis zur Handshake-Frist
    fn poll_timeout(&self) -> Option<Duration> {
        let sperre = self.verbindung.lock();
        let verbindung = sperre.as_ref()?;
        if verbindung.braucht_tick() {
            Some(Duration::ZERO)
        } else {
            verbindung.frist_restzeit(Instant::now())
        }
    }

    fn event_loop(self: Arc<Self>, mut mux: Multiplexer) {
        tracing::info!("Client-Event-Loop gestartet");
        let mut aufgebaut = false;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let bereit = match mux.warten(self.poll_timeout()) {
                Ok(bereit) => bereit,
                Err(e) => {
                    self.abbrechen(&mux, e.into());
                    break;
                }
            };

            let mut lesbar = false;
            let mut schreibbar = false;
            for meldung in bereit.iter().filter(|m| m.quelle == Quelle::Ausgehend) {
                lesbar |= meldung.lesbar;
                schreibbar |= meldung.schreibbar;
            }

            let mut events = Vec::new();
            let schritt = {
                let mut sperre = self.verbindung.lock();
                match sperre.as_mut() {
                    None => Schritt::Entfernt,
                    Some(verbindung) => {
                        if lesbar {
                            verbindung.markiere_lesbar();
                        }
                        if schreibbar {
                            verbindung.markiere_schreibbar();
                        }
                        match tick(verbindung, &mut aufgebaut, &mut events) {
                            Ok(LeseStatus::Offen) => Schritt::Weiter,
                            Ok(LeseStatus::Geschlossen) => Schritt::Geschlossen,
                            Err(e) => Schritt::Fehler(e),
                        }
                    }
                }
            };

            let mut schritt = schritt;
            for event in &events {
                if let Err(e) = self.emitter.emit(event) {
                    if matches!(schritt, Schritt::Weiter) && e.trennt_verbindung() {
                        schritt = Schritt::Fehler(e);
                    }
                }
            }

            match schritt {
                Schritt::Weiter => {}
                Schritt::Entfernt => break,
                Schritt::Geschlossen => {
                    tracing::info!("Server hat die Verbindung geschlossen");
                    self.schliessen(&mux);
                    self.melden(&NetEvent::Disconnected { id: None });
                    break;
                }
                Schritt::Fehler(fehler) => {
                    self.abbrechen(&mux, fehler);
                    break;
                }
            }
        }

        tracing::info!("Client-Event-Loop beendet");
    }

    /// Fataler Fehler: aufraeumen, dann `error` und `disconnected`
    fn abbrechen(&self, mux: &Multiplexer, fehler: QuizlinkError) {
        tracing::error!(fehler = %fehler, "Client-Event-Loop abgebrochen");
        self.schliessen(mux);
        self.melden(&NetEvent::Error {
            error: Arc::new(fehler),
        });
        self.melden(&NetEvent::Disconnected { id: None });
    }

    fn schliessen(&self, mux: &Multiplexer) {
        let verbindung = self.verbindung.lock().take();
        if let Some(mut verbindung) = verbindung {
            if let Err(e) = mux.abmelden(verbindung.stream_mut()) {
                let fehler = QuizlinkError::Cleanup(e.to_string());
                tracing::warn!(fehler = %fehler, "Abmelden fehlgeschlagen");
            }
        }
    }

    fn melden(&self, event: &NetEvent) {
        if let Err(e) = self.emitter.emit(event) {
            tracing::warn!(event = %event.kind(), fehler = %e, "Abonnent fehlgeschlagen");
        }
    }
}

/// Ein Tick der Client-Verbindung; prueft zuerst den TCP-Aufbau, zuletzt
/// die Handshake-Frist
fn tick(
    verbindung: &mut Verbindung<TcpStream>,
    aufgebaut: &mut bool,
    events: &mut Vec<NetEvent>,
) -> Result<LeseStatus> {
    if !*aufgebaut && verbindung.ist_schreibbar() {
        if let Some(e) = verbindung.stream().take_error()? {
            return Err(e.into());
        }
        match verbindung.stream().peer_addr() {
            Ok(_) => {
                *aufgebaut = true;
                tracing::info!(server = %verbindung.peer_addr(), "TCP-Verbindung hergestellt");
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                verbindung.markiere_blockiert();
            }
            Err(e) => return Err(e.into()),
        }
    }

    if verbindung.ist_lesbar() && verbindung.bei_lesbar(events)? == LeseStatus::Geschlossen {
        verbindung.eingang_abgeben(events);
        return Ok(LeseStatus::Geschlossen);
    }

    if *aufgebaut && verbindung.ist_schreibbar() {
        verbindung.bei_schreibbar(events)?;
    }
    verbindung.frist_pruefen(Instant::now(), events);
    Ok(LeseStatus::Offen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn senden_ohne_verbindung() {
        let client = DialingManager::neu(ClientKonfig::neu("127.0.0.1:1")).unwrap();
        assert!(matches!(client.send(b"x"), Err(QuizlinkError::NichtVerbunden)));
        assert!(!client.is_connected());
        assert_eq!(client.handshake_stage(), None);
    }

    #[test]
    fn disconnect_ohne_verbindung_ist_harmlos() {
        let client = DialingManager::neu(ClientKonfig::default()).unwrap();
        client.disconnect();
        client.join();
        assert!(!client.is_connected());
    }

    #[test]
    fn unaufloesbare_adresse() {
        let client = DialingManager::neu(ClientKonfig::neu("kein-port")).unwrap();
        assert!(client.connect().is_err());
        assert!(!client.is_connected());
    }
}
