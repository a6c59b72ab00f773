//! Verbindungs-Datensatz – Puffer, Handshake und Tick-Verarbeitung
//!
//! Eine `Verbindung` besitzt ihren Transport exklusiv und haelt je einen
//! unbegrenzten Eingangs- und Ausgangspuffer. Die Event-Loop ruft pro Tick
//! zuerst `bei_lesbar` und danach `bei_schreibbar` auf; beide sammeln die
//! ausgeloesten Events in einem Vec, den die Loop erst nach Freigabe aller
//! Sperren zustellt.
//!
//! ## Pufferdisziplin
//! - Eingang: waechst bei jedem Lesevorgang, wird beim Schreibtick als ein
//!   einziges `data`-Event abgegeben und geleert (erst ab `Established`).
//!   Pro Tick werden hoechstens `lese_limit` Bytes gelesen; der Rest bleibt
//!   ueber das Lese-Flag fuer den naechsten Tick vorgemerkt.
//! - Ausgang: `send` haengt an; nach jedem erfolgreichen Schreibvorgang
//!   wird genau der geschriebene Praefix entfernt. Vor `Established` gehen
//!   nur die vorne stehenden Handshake-Bytes auf den Transport.
//!
//! Der Transport ist generisch (`Read + Write`), damit die Logik ohne
//! echte Sockets getestet werden kann.

use bytes::{Buf, BytesMut};
use quizlink_core::{ConnectionId, HandshakeStage, NetEvent, QuizlinkError, Result, Rolle};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::STANDARD_LESE_LIMIT;
use crate::handshake::{EmpfangsErgebnis, Handshake, SchreibErgebnis};

/// Ergebnis eines Lesetakts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeseStatus {
    Offen,
    /// Gegenseite hat die Verbindung geschlossen (leerer Read)
    Geschlossen,
}

/// Zeitpunkt, bis zu dem der Handshake entschieden sein muss
#[derive(Debug, Clone, Copy)]
struct Frist {
    ende: Instant,
    dauer: Duration,
}

/// Zustand einer einzelnen Verbindung
#[derive(Debug)]
pub struct Verbindung<S> {
    id: Option<ConnectionId>,
    stream: S,
    peer_addr: SocketAddr,
    eingang: BytesMut,
    ausgang: BytesMut,
    /// Anzahl Handshake-Bytes am Anfang von `ausgang`
    vorrang: usize,
    handshake: Handshake,
    frist: Option<Frist>,
    /// Transport hat Lesebereitschaft gemeldet und seitdem kein
    /// `WouldBlock` geliefert
    lesbar: bool,
    /// Wie `lesbar`, fuer die Schreibseite
    schreibbar: bool,
    lese_puffer: usize,
    lese_limit: usize,
}

impl<S: Read + Write> Verbindung<S> {
    /// Erstellt den Datensatz fuer einen frisch angenommenen oder
    /// geoeffneten Transport
    pub fn neu(
        id: Option<ConnectionId>,
        stream: S,
        peer_addr: SocketAddr,
        handshake: Handshake,
        lese_puffer: usize,
    ) -> Self {
        let lese_puffer = lese_puffer.max(1);
        Self {
            id,
            stream,
            peer_addr,
            eingang: BytesMut::new(),
            ausgang: BytesMut::new(),
            vorrang: 0,
            handshake,
            frist: None,
            lesbar: false,
            schreibbar: false,
            lese_puffer,
            lese_limit: STANDARD_LESE_LIMIT.max(lese_puffer),
        }
    }

    pub fn mit_lese_limit(mut self, lese_limit: usize) -> Self {
        self.lese_limit = lese_limit.max(self.lese_puffer);
        self
    }

    /// Startet die Handshake-Frist ab jetzt
    pub fn mit_handshake_frist(mut self, dauer: Duration) -> Self {
        self.frist = Some(Frist {
            ende: Instant::now() + dauer,
            dauer,
        });
        self
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stage(&self) -> HandshakeStage {
        self.handshake.stage()
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn ist_lesbar(&self) -> bool {
        self.lesbar
    }

    pub fn ist_schreibbar(&self) -> bool {
        self.schreibbar
    }

    /// Vom Multiplexer gemeldete Lesebereitschaft uebernehmen
    pub fn markiere_lesbar(&mut self) {
        self.lesbar = true;
    }

    /// Vom Multiplexer gemeldete Schreibbereitschaft uebernehmen
    pub fn markiere_schreibbar(&mut self) {
        self.schreibbar = true;
    }

    /// Schreibbereitschaft verwerfen (z.B. Verbindungsaufbau noch offen)
    pub fn markiere_blockiert(&mut self) {
        self.schreibbar = false;
    }

    pub fn eingang_len(&self) -> usize {
        self.eingang.len()
    }

    pub fn ausgang_len(&self) -> usize {
        self.ausgang.len()
    }

    /// Haengt Bytes an den Ausgangspuffer an (unabhaengig vom Handshake)
    pub fn einreihen(&mut self, daten: &[u8]) {
        self.ausgang.extend_from_slice(daten);
        tracing::trace!(
            bytes = daten.len(),
            wartend = self.ausgang.len(),
            peer = %self.peer_addr,
            "Bytes eingereiht"
        );
    }

    /// Ob der naechste Tick auf der Schreibseite etwas zu tun hat
    pub fn braucht_schreibtick(&self) -> bool {
        self.schreibbar
            && (self.schreibbare_bytes() > 0
                || self.handshake.wartet_auf_schreibtick()
                || (self.handshake.ist_etabliert() && !self.eingang.is_empty()))
    }

    /// Ob der naechste Tick ohne neue Meldung etwas zu tun hat
    pub fn braucht_tick(&self) -> bool {
        self.lesbar || self.braucht_schreibtick()
    }

    /// Schreibt am Ausgangspuffer vorbei, so viel der Transport sofort annimmt
    ///
    /// Gibt die Anzahl geschriebener Bytes zurueck; ein Rest wird nicht
    /// erneut versucht.
    pub fn sofort_senden(&mut self, daten: &[u8]) -> io::Result<usize> {
        let mut geschrieben = 0;
        while geschrieben < daten.len() {
            match self.stream.write(&daten[geschrieben..]) {
                Ok(0) => break,
                Ok(n) => geschrieben += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.schreibbar = false;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::trace!(bytes = geschrieben, peer = %self.peer_addr, "Direkt geschrieben");
        Ok(geschrieben)
    }

    /// Lesebereitschaft verarbeiten
    ///
    /// Vor `Established` laufen alle Bytes durch den Handshake und loesen nie
    /// ein Daten-Event aus. Nach einem fehlgeschlagenen Handshake werden
    /// weitere Bytes verworfen. Ab `Established` wird jeder Lesevorgang
    /// sofort als `data-packet` gemeldet und zusaetzlich im Eingang
    /// gesammelt.
    pub fn bei_lesbar(&mut self, events: &mut Vec<NetEvent>) -> Result<LeseStatus> {
        let vorher = self.stage();
        let (gelesen, status) = self.lesen()?;

        if !gelesen.is_empty() {
            tracing::trace!(bytes = gelesen.len(), peer = %self.peer_addr, "Bytes empfangen");

            if self.handshake.ist_etabliert() {
                let paket = gelesen.freeze();
                self.eingang.extend_from_slice(&paket);
                events.push(NetEvent::DataPacket {
                    id: self.id,
                    data: paket,
                });
            } else if self.handshake.abgelehnt() {
                tracing::trace!(
                    bytes = gelesen.len(),
                    peer = %self.peer_addr,
                    "Bytes nach fehlgeschlagenem Handshake verworfen"
                );
            } else {
                self.eingang.extend_from_slice(&gelesen);
                match self.handshake.bei_empfang(&mut self.eingang) {
                    EmpfangsErgebnis::Wartend => {}
                    EmpfangsErgebnis::Verifiziert => {
                        tracing::debug!(peer = %self.peer_addr, "Handshake-Token empfangen");
                    }
                    EmpfangsErgebnis::Abgeschlossen => {
                        tracing::info!(peer = %self.peer_addr, "Handshake abgeschlossen");
                        events.push(NetEvent::HandshakeDone { id: self.id });
                    }
                    EmpfangsErgebnis::Fehlgeschlagen(fehler) => {
                        tracing::warn!(peer = %self.peer_addr, fehler = %fehler, "Handshake fehlgeschlagen");
                        events.push(self.handshake_fehler_event(fehler));
                    }
                }
            }
        }

        self.nur_vorwaerts(vorher);
        Ok(status)
    }

    /// Schreibbereitschaft verarbeiten
    ///
    /// Reihenfolge: Handshake weitertreiben, gesammelte Eingangsdaten als
    /// ein `data`-Event abgeben, dann so viel vom Ausgang schreiben wie der
    /// Transport annimmt.
    pub fn bei_schreibbar(&mut self, events: &mut Vec<NetEvent>) -> Result<()> {
        let vorher = self.stage();
        match self.handshake.bei_schreibbar() {
            SchreibErgebnis::Nichts => {}
            SchreibErgebnis::Abgeschlossen => {
                tracing::info!(peer = %self.peer_addr, "Handshake abgeschlossen");
                events.push(NetEvent::HandshakeDone { id: self.id });
            }
            SchreibErgebnis::DirektSenden(token) => match self.sofort_senden(&token) {
                Ok(n) if n < token.len() => {
                    // Rest vor die eingereihten Bytes stellen
                    let rest = &token[n..];
                    let mut neu = BytesMut::with_capacity(rest.len() + self.ausgang.len());
                    neu.extend_from_slice(rest);
                    neu.extend_from_slice(&self.ausgang);
                    self.ausgang = neu;
                    self.vorrang += rest.len();
                }
                Ok(_) => tracing::debug!(peer = %self.peer_addr, "Handshake-Token gesendet"),
                Err(e) => {
                    events.push(NetEvent::HandshakeError {
                        id: self.id,
                        error: Arc::new(QuizlinkError::Transport(io::Error::new(
                            e.kind(),
                            e.to_string(),
                        ))),
                    });
                    return Err(e.into());
                }
            },
        }
        self.nur_vorwaerts(vorher);

        self.eingang_abgeben(events);
        self.ausgang_schreiben()
    }

    /// Gibt gesammelte Eingangsdaten als `data`-Event ab (nur `Established`)
    pub fn eingang_abgeben(&mut self, events: &mut Vec<NetEvent>) {
        if self.handshake.ist_etabliert() && !self.eingang.is_empty() {
            events.push(NetEvent::Data {
                id: self.id,
                data: self.eingang.split().freeze(),
            });
        }
    }

    /// Verbleibende Handshake-Frist, solange der Handshake offen ist
    pub fn frist_restzeit(&self, jetzt: Instant) -> Option<Duration> {
        if !self.handshake.offen() {
            return None;
        }
        self.frist.map(|f| f.ende.saturating_duration_since(jetzt))
    }

    /// Meldet einen offenen Handshake nach Ablauf der Frist als fehlgeschlagen
    pub fn frist_pruefen(&mut self, jetzt: Instant, events: &mut Vec<NetEvent>) {
        let Some(frist) = self.frist else {
            return;
        };
        if jetzt < frist.ende || !self.handshake.offen() {
            return;
        }
        self.frist = None;

        let frist_ms = u64::try_from(frist.dauer.as_millis()).unwrap_or(u64::MAX);
        if let Some(fehler) = self.handshake.zeitueberschreitung(&self.eingang, frist_ms) {
            tracing::warn!(
                peer = %self.peer_addr,
                stage = %self.stage(),
                fehler = %fehler,
                "Handshake-Frist abgelaufen"
            );
            events.push(self.handshake_fehler_event(fehler));
        }
    }

    /// Liest bis `WouldBlock`, Verbindungsende oder Erreichen des Leselimits
    fn lesen(&mut self) -> Result<(BytesMut, LeseStatus)> {
        let mut gelesen = BytesMut::new();
        let mut block = vec![0u8; self.lese_puffer];

        loop {
            let frei = self.lese_limit - gelesen.len();
            if frei == 0 {
                // Lese-Flag bleibt gesetzt, der naechste Tick liest weiter
                tracing::trace!(bytes = gelesen.len(), peer = %self.peer_addr, "Leselimit erreicht");
                return Ok((gelesen, LeseStatus::Offen));
            }
            let ziel = &mut block[..frei.min(self.lese_puffer)];
            match self.stream.read(ziel) {
                Ok(0) => {
                    self.lesbar = false;
                    return Ok((gelesen, LeseStatus::Geschlossen));
                }
                Ok(n) => gelesen.extend_from_slice(&ziel[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.lesbar = false;
                    return Ok((gelesen, LeseStatus::Offen));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.lesbar = false;
                    return Err(e.into());
                }
            }
        }
    }

    /// Vor `Established` nur die Handshake-Bytes, danach den ganzen Ausgang
    fn schreibbare_bytes(&self) -> usize {
        if self.handshake.ausgang_freigegeben() {
            self.ausgang.len()
        } else {
            self.vorrang
        }
    }

    /// Schreibt den freigegebenen Ausgang, bis er leer ist oder der
    /// Transport blockiert
    fn ausgang_schreiben(&mut self) -> Result<()> {
        loop {
            let erlaubt = self.schreibbare_bytes();
            if erlaubt == 0 {
                return Ok(());
            }
            match self.stream.write(&self.ausgang[..erlaubt]) {
                Ok(0) => {
                    tracing::warn!(
                        wartend = self.ausgang.len(),
                        peer = %self.peer_addr,
                        "Schreiben lieferte 0 Bytes"
                    );
                    return Ok(());
                }
                Ok(n) => {
                    self.ausgang.advance(n);
                    self.vorrang = self.vorrang.saturating_sub(n);
                    tracing::trace!(
                        bytes = n,
                        wartend = self.ausgang.len(),
                        peer = %self.peer_addr,
                        "Bytes geschrieben"
                    );
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.schreibbar = false;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn nur_vorwaerts(&self, vorher: HandshakeStage) {
        let rolle = self.handshake.rolle();
        debug_assert!(
            self.stage().rang(rolle) >= vorher.rang(rolle),
            "Handshake-Stufe darf nicht zurueckfallen: {vorher} -> {}",
            self.stage()
        );
    }

    fn handshake_fehler_event(&self, fehler: QuizlinkError) -> NetEvent {
        match (self.handshake.rolle(), self.id) {
            (Rolle::Server, Some(id)) => NetEvent::HandshakeFailed {
                id,
                stage: self.handshake.stage(),
                peer_port: self.peer_addr.port(),
            },
            (_, id) => NetEvent::HandshakeError {
                id,
                error: Arc::new(fehler),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
