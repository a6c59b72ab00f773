//! Listening-Manager – Server-Rolle
//!
//! Besitzt den Listener, nimmt Teilnehmer an und betreibt die Event-Loop
//! auf einem eigenen Thread. Die Verbindungstabelle ist eine `DashMap`,
//! damit `send`/`send_immediate` von beliebigen Threads aus funktionieren.
//! Aufrufe aus anderen Threads wecken den blockierten Poll ueber den
//! `Waker`, ein Abbruch eines laufenden Ticks findet nie statt.
//!
//! ## Ablauf pro Tick
//! 1. Anfragen aus der Befehls-Queue abarbeiten (`close`)
//! 2. Pollen: Nullzeit wenn Arbeit ansteht, sonst bis zur naechsten
//!    Handshake-Frist oder unbegrenzt
//! 3. Listener-Meldung: alle wartenden Teilnehmer annehmen
//! 4. Verbindungen in Meldungsreihenfolge bedienen: erst Lesen, dann Schreiben
//! 5. Abgelaufene Handshake-Fristen melden
//!
//! Events werden gesammelt und erst nach Freigabe des Tabelleneintrags
//! zugestellt. Ein Fehler beim Bedienen einer Verbindung trennt nur diese.

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Waker};
use parking_lot::Mutex;
use quizlink_core::{
    ConnectionId, EventKind, HandshakeStage, NetEvent, QuizlinkError, Result, Rolle,
};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ServerKonfig;
use crate::connection::{LeseStatus, Verbindung};
use crate::emitter::{EventEmitter, SubscriptionId};
use crate::handshake::Handshake;
use crate::poller::{Bereitschaft, Multiplexer, Quelle, ERSTE_VERBINDUNG};

/// Anfragen an die Event-Loop
#[derive(Debug)]
enum Befehl {
    Schliessen(ConnectionId),
}

/// Verbindungs-Manager der Server-Rolle
///
/// Klone teilen denselben Zustand. Die Loop endet nur ueber `stop()`.
#[derive(Clone)]
pub struct ListeningManager {
    inner: Arc<Gemeinsam>,
}

struct Gemeinsam {
    konfig: ServerKonfig,
    emitter: EventEmitter,
    verbindungen: DashMap<ConnectionId, Verbindung<TcpStream>>,
    befehle_tx: Sender<Befehl>,
    befehle_rx: Receiver<Befehl>,
    waker: Mutex<Option<Arc<Waker>>>,
    lokale_adresse: Mutex<Option<SocketAddr>>,
    laeuft: AtomicBool,
    stop: AtomicBool,
    /// Sperrt auch die Start/Stop-Entscheidung
    thread: Mutex<Option<JoinHandle<()>>>,
    naechste_id: AtomicU64,
}

impl ListeningManager {
    /// Erstellt einen Manager mit eigenem Event-Dispatcher
    pub fn neu(konfig: ServerKonfig) -> Result<Self> {
        Self::mit_emitter(konfig, EventEmitter::neu())
    }

    /// Erstellt einen Manager mit einem vorhandenen Event-Dispatcher
    pub fn mit_emitter(konfig: ServerKonfig, emitter: EventEmitter) -> Result<Self> {
        konfig.validieren()?;
        let (befehle_tx, befehle_rx) = unbounded();
        Ok(Self {
            inner: Arc::new(Gemeinsam {
                konfig,
                emitter,
                verbindungen: DashMap::new(),
                befehle_tx,
                befehle_rx,
                waker: Mutex::new(None),
                lokale_adresse: Mutex::new(None),
                laeuft: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                thread: Mutex::new(None),
                naechste_id: AtomicU64::new(ERSTE_VERBINDUNG),
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Lebenszyklus
    // -----------------------------------------------------------------------

    /// Bindet den Listener und startet die Event-Loop
    ///
    /// Laeuft der Manager bereits, wird nur eine ausstehende Stop-Anfrage
    /// zurueckgenommen und die bestehende Adresse zurueckgegeben.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut thread = self.inner.thread.lock();

        if self.inner.laeuft.load(Ordering::SeqCst) {
            self.inner.stop.store(false, Ordering::SeqCst);
            if let Some(adresse) = *self.inner.lokale_adresse.lock() {
                tracing::debug!(adresse = %adresse, "Server laeuft bereits");
                return Ok(adresse);
            }
        }

        // Beendete Loop einsammeln, bevor der Zustand neu belegt wird
        if let Some(alt) = thread.take() {
            if alt.thread().id() != std::thread::current().id() && alt.join().is_err() {
                tracing::warn!("Vorherige Event-Loop ist in Panik geraten");
            }
        }

        let std_listener = std::net::TcpListener::bind(self.inner.konfig.bind_adresse.as_str())?;
        std_listener.set_nonblocking(true)?;
        let adresse = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let mux = Multiplexer::neu(self.inner.konfig.poll_kapazitaet)?;
        mux.registrieren(&mut listener, Quelle::Listener, Interest::READABLE)?;

        *self.inner.waker.lock() = Some(mux.waker());
        *self.inner.lokale_adresse.lock() = Some(adresse);
        self.inner.stop.store(false, Ordering::SeqCst);
        self.inner.laeuft.store(true, Ordering::SeqCst);

        let gemeinsam = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("quizlink-server".into())
            .spawn(move || gemeinsam.event_loop(mux, listener));

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::info!(adresse = %adresse, "Server lauscht");
                Ok(adresse)
            }
            Err(e) => {
                self.inner.laeuft.store(false, Ordering::SeqCst);
                *self.inner.waker.lock() = None;
                *self.inner.lokale_adresse.lock() = None;
                Err(QuizlinkError::Transport(e))
            }
        }
    }

    /// Fordert das Ende der Event-Loop nach dem aktuellen Tick an
    pub fn stop(&self) {
        tracing::info!("Server-Stop angefordert");
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wecken();
    }

    /// Wartet, bis der Loop-Thread beendet ist
    pub fn join(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("Event-Loop ist in Panik geraten");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.laeuft.load(Ordering::SeqCst)
    }

    /// Adresse des Listeners, solange der Manager laeuft
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.lokale_adresse.lock()
    }

    // -----------------------------------------------------------------------
    // Senden
    // -----------------------------------------------------------------------

    /// Haengt Bytes an den Ausgangspuffer der Verbindung an
    pub fn send(&self, id: ConnectionId, daten: impl AsRef<[u8]>) -> Result<()> {
        {
            let mut verbindung = self
                .inner
                .verbindungen
                .get_mut(&id)
                .ok_or(QuizlinkError::UnknownConnection(id))?;
            verbindung.einreihen(daten.as_ref());
        }
        self.inner.wecken();
        Ok(())
    }

    /// Schreibt direkt auf den Transport, am Ausgangspuffer vorbei
    ///
    /// Gibt die Anzahl angenommener Bytes zurueck. Ein Rest wird nicht
    /// erneut versucht.
    pub fn send_immediate(&self, id: ConnectionId, daten: impl AsRef<[u8]>) -> Result<usize> {
        let daten = daten.as_ref();
        let mut verbindung = self
            .inner
            .verbindungen
            .get_mut(&id)
            .ok_or(QuizlinkError::UnknownConnection(id))?;

        let geschrieben = verbindung.sofort_senden(daten)?;
        if geschrieben < daten.len() {
            tracing::warn!(
                id = %id,
                geschrieben,
                gesamt = daten.len(),
                "Direktes Senden unvollstaendig"
            );
        }
        Ok(geschrieben)
    }

    /// Sendet an alle Verbindungen der Tabelle per `send_immediate`
    ///
    /// Gibt zurueck, wie viele Verbindungen die Daten vollstaendig
    /// angenommen haben. Fehler einzelner Verbindungen werden geloggt.
    pub fn broadcast(&self, daten: impl AsRef<[u8]>) -> usize {
        let daten = daten.as_ref();
        let mut erreicht = 0;

        for id in self.connection_ids() {
            match self.send_immediate(id, daten) {
                Ok(n) if n == daten.len() => erreicht += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(id = %id, fehler = %e, "Broadcast an Verbindung fehlgeschlagen"),
            }
        }

        tracing::debug!(bytes = daten.len(), erreicht, "Broadcast gesendet");
        erreicht
    }

    /// Trennt eine Verbindung; das Aufraeumen laeuft auf dem Loop-Thread
    pub fn close(&self, id: ConnectionId) -> Result<()> {
        if !self.inner.verbindungen.contains_key(&id) {
            return Err(QuizlinkError::UnknownConnection(id));
        }
        self.inner
            .befehle_tx
            .send(Befehl::Schliessen(id))
            .map_err(|_| QuizlinkError::intern("Befehls-Queue geschlossen"))?;
        self.inner.wecken();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    /// IDs aller Verbindungen in Tabellenreihenfolge
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.verbindungen.iter().map(|e| *e.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.verbindungen.len()
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.inner.verbindungen.get(&id).map(|v| v.peer_addr())
    }

    pub fn handshake_stage(&self, id: ConnectionId) -> Option<HandshakeStage> {
        self.inner.verbindungen.get(&id).map(|v| v.stage())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

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

// ---------------------------------------------------------------------------
// Event-Loop
// ---------------------------------------------------------------------------

impl Gemeinsam {
    fn wecken(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(e) = waker.wake() {
                tracing::warn!(fehler = %e, "Event-Loop konnte nicht geweckt werden");
            }
        }
    }

    fn soll_stoppen(&self) -> bool {
        let _sperre = self.thread.lock();
        if self.stop.load(Ordering::SeqCst) {
            self.als_beendet_markieren();
            true
        } else {
            false
        }
    }

    /// Gibt Adresse und Waker frei; ein folgendes `start()` belegt sie neu
    fn als_beendet_markieren(&self) {
        self.laeuft.store(false, Ordering::SeqCst);
        *self.waker.lock() = None;
        *self.lokale_adresse.lock() = None;
    }

    fn event_loop(self: Arc<Self>, mut mux: Multiplexer, mut listener: TcpListener) {
        tracing::info!("Server-Event-Loop gestartet");

        loop {
            if self.soll_stoppen() {
                break;
            }

            self.befehle_verarbeiten(&mux);

            let bereit = match mux.warten(self.poll_timeout()) {
                Ok(bereit) => bereit,
                Err(e) => {
                    tracing::error!(fehler = %e, "Poll fehlgeschlagen, Event-Loop wird beendet");
                    let _sperre = self.thread.lock();
                    self.als_beendet_markieren();
                    break;
                }
            };

            self.tick(&mux, &mut listener, bereit);
        }

        self.alle_trennen(&mux);
        if let Err(e) = mux.abmelden(&mut listener) {
            tracing::debug!(fehler = %e, "Listener konnte nicht abgemeldet werden");
        }
        tracing::info!("Server-Event-Loop beendet");
    }

    /// Nullzeit bei anstehender Arbeit, sonst die kuerzeste Handshake-Frist
    fn poll_timeout(&self) -> Option<Duration> {
        if !self.befehle_rx.is_empty() {
            return Some(Duration::ZERO);
        }
        let jetzt = Instant::now();
        let mut timeout: Option<Duration> = None;
        for verbindung in self.verbindungen.iter() {
            if verbindung.braucht_tick() {
                return Some(Duration::ZERO);
            }
            if let Some(rest) = verbindung.frist_restzeit(jetzt) {
                timeout = Some(timeout.map_or(rest, |t| t.min(rest)));
            }
        }
        timeout
    }

    fn befehle_verarbeiten(&self, mux: &Multiplexer) {
        for befehl in self.befehle_rx.try_iter() {
            match befehl {
                Befehl::Schliessen(id) => {
                    tracing::info!(id = %id, "Verbindung wird auf Anfrage geschlossen");
                    self.trennen(mux, id);
                }
            }
        }
    }

    fn tick(&self, mux: &Multiplexer, listener: &mut TcpListener, bereit: Vec<Bereitschaft>) {
        let mut reihenfolge: Vec<ConnectionId> = Vec::new();
        let mut gesehen: HashSet<ConnectionId> = HashSet::new();

        for meldung in bereit {
            match meldung.quelle {
                Quelle::Listener => self.annehmen(mux, listener),
                Quelle::Waker | Quelle::Ausgehend => {}
                Quelle::Verbindung(id) => {
                    if let Some(mut v) = self.verbindungen.get_mut(&id) {
                        if meldung.lesbar {
                            v.markiere_lesbar();
                        }
                        if meldung.schreibbar {
                            v.markiere_schreibbar();
                        }
                    }
                    if gesehen.insert(id) {
                        reihenfolge.push(id);
                    }
                }
            }
        }

        // Bereitschaft gilt bis zum naechsten WouldBlock bzw. Leselimit
        for eintrag in self.verbindungen.iter() {
            if (eintrag.ist_lesbar() || eintrag.ist_schreibbar()) && gesehen.insert(*eintrag.key()) {
                reihenfolge.push(*eintrag.key());
            }
        }

        for id in reihenfolge {
            self.bedienen(mux, id);
        }

        self.fristen_pruefen(mux);
    }

    fn annehmen(&self, mux: &Multiplexer, listener: &mut TcpListener) {
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = ConnectionId::from_raw(self.naechste_id.fetch_add(1, Ordering::SeqCst));
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, fehler = %e, "TCP_NODELAY nicht gesetzt");
                    }
                    if let Err(e) = mux.registrieren(
                        &mut stream,
                        Quelle::Verbindung(id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        tracing::warn!(peer = %peer, fehler = %e, "Registrierung fehlgeschlagen, Verbindung verworfen");
                        continue;
                    }

                    let handshake = Handshake::fuer_rolle(Rolle::Server, self.konfig.token_bytes());
                    let verbindung =
                        Verbindung::neu(Some(id), stream, peer, handshake, self.konfig.lese_puffer)
                            .mit_lese_limit(self.konfig.lese_limit)
                            .mit_handshake_frist(self.konfig.handshake_frist());
                    self.verbindungen.insert(id, verbindung);
                    tracing::info!(id = %id, peer = %peer, "Neue Verbindung angenommen");

                    if let Err(e) = self.emitter.emit(&NetEvent::NewConnection { id, peer }) {
                        tracing::warn!(id = %id, fehler = %e, "Abonnent von new-connection fehlgeschlagen");
                        self.trennen(mux, id);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    tracing::warn!(fehler = %e, "Voruebergehender Accept-Fehler");
                    continue;
                }
                Err(e) => {
                    tracing::error!(fehler = %e, "Accept fehlgeschlagen");
                    break;
                }
            }
        }
    }

    /// Lese- und Schreibseite einer Verbindung in einem Tick
    fn bedienen(&self, mux: &Multiplexer, id: ConnectionId) {
        let mut events = Vec::new();

        let ergebnis = {
            let Some(mut verbindung) = self.verbindungen.get_mut(&id) else {
                return;
            };
            verbindung_verarbeiten(&mut verbindung, &mut events)
        };

        let mut trennen = match ergebnis {
            Ok(LeseStatus::Offen) => false,
            Ok(LeseStatus::Geschlossen) => {
                tracing::info!(id = %id, "Verbindung vom Teilnehmer geschlossen");
                true
            }
            Err(e) => {
                tracing::warn!(id = %id, fehler = %e, "Fehler beim Bedienen der Verbindung");
                e.trennt_verbindung()
            }
        };

        trennen |= self.zustellen(id, &events);
        if trennen {
            self.trennen(mux, id);
        }
    }

    /// Stellt gesammelte Events zu; true, wenn die Verbindung getrennt
    /// werden muss
    fn zustellen(&self, id: ConnectionId, events: &[NetEvent]) -> bool {
        let mut trennen = false;
        for event in events {
            if let Err(e) = self.emitter.emit(event) {
                tracing::warn!(id = %id, fehler = %e, "Abonnent fehlgeschlagen");
                trennen |= e.trennt_verbindung();
            }
        }
        trennen
    }

    fn fristen_pruefen(&self, mux: &Multiplexer) {
        let jetzt = Instant::now();
        let abgelaufen: Vec<ConnectionId> = self
            .verbindungen
            .iter()
            .filter(|v| v.frist_restzeit(jetzt) == Some(Duration::ZERO))
            .map(|v| *v.key())
            .collect();

        for id in abgelaufen {
            let mut events = Vec::new();
            if let Some(mut verbindung) = self.verbindungen.get_mut(&id) {
                verbindung.frist_pruefen(jetzt, &mut events);
            }
            if self.zustellen(id, &events) {
                self.trennen(mux, id);
            }
        }
    }

    /// Entfernt eine Verbindung, meldet sie ab und meldet `disconnected`
    fn trennen(&self, mux: &Multiplexer, id: ConnectionId) {
        let Some((_, mut verbindung)) = self.verbindungen.remove(&id) else {
            return;
        };

        if let Err(e) = mux.abmelden(verbindung.stream_mut()) {
            let fehler = QuizlinkError::Cleanup(e.to_string());
            tracing::warn!(id = %id, fehler = %fehler, "Abmelden beim Trennen fehlgeschlagen");
        }
        let peer = verbindung.peer_addr();
        drop(verbindung);

        tracing::info!(id = %id, peer = %peer, "Verbindung getrennt");
        if let Err(e) = self.emitter.emit(&NetEvent::Disconnected { id: Some(id) }) {
            tracing::warn!(id = %id, fehler = %e, "Abonnent von disconnected fehlgeschlagen");
        }
    }

    fn alle_trennen(&self, mux: &Multiplexer) {
        let ids: Vec<ConnectionId> = self.verbindungen.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.trennen(mux, id);
        }
        // Anfragen fuer bereits entfernte Verbindungen verwerfen
        for _ in self.befehle_rx.try_iter() {}
    }
}

fn verbindung_verarbeiten(
    verbindung: &mut Verbindung<TcpStream>,
    events: &mut Vec<NetEvent>,
) -> Result<LeseStatus> {
    if verbindung.ist_lesbar() && verbindung.bei_lesbar(events)? == LeseStatus::Geschlossen {
        verbindung.eingang_abgeben(events);
        return Ok(LeseStatus::Geschlossen);
    }
    if verbindung.ist_schreibbar() {
        verbindung.bei_schreibbar(events)?;
    }
    Ok(LeseStatus::Offen)
}
