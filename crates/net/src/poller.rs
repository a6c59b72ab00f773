//! Multiplexer-Anbindung auf Basis von mio
//!
//! Ein `Multiplexer` buendelt `Poll`, den `Waker` fuer Anfragen aus anderen
//! Threads und die Zuordnung von mio-Tokens zu Quellen. Verbindungs-IDs
//! werden direkt als Token verwendet; die ersten Werte sind fuer Listener,
//! Waker und die ausgehende Client-Verbindung reserviert.

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use quizlink_core::ConnectionId;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const AUSGEHEND: Token = Token(2);

/// Erste an Verbindungen vergebene ID (darunter liegen reservierte Tokens)
pub const ERSTE_VERBINDUNG: u64 = 16;

/// Herkunft einer Bereitschaftsmeldung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quelle {
    Listener,
    Waker,
    /// Einzige Verbindung eines Client-Managers
    Ausgehend,
    Verbindung(ConnectionId),
}

impl Quelle {
    fn token(self) -> Token {
        match self {
            Self::Listener => LISTENER,
            Self::Waker => WAKER,
            Self::Ausgehend => AUSGEHEND,
            Self::Verbindung(id) => Token(id.raw() as usize),
        }
    }

    fn aus_token(token: Token) -> Self {
        match token {
            LISTENER => Self::Listener,
            WAKER => Self::Waker,
            AUSGEHEND => Self::Ausgehend,
            Token(raw) => Self::Verbindung(ConnectionId::from_raw(raw as u64)),
        }
    }
}

/// Eine Bereitschaftsmeldung aus einem Poll-Durchlauf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bereitschaft {
    pub quelle: Quelle,
    /// Lesen liefert Daten, EOF oder einen Fehler
    pub lesbar: bool,
    pub schreibbar: bool,
}

/// Poll-Instanz einer Event-Loop
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl Multiplexer {
    /// Erstellt Poll und Waker; `kapazitaet` begrenzt Meldungen pro Durchlauf
    pub fn neu(kapazitaet: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(kapazitaet.max(1)),
            waker,
        })
    }

    /// Waker, mit dem andere Threads einen blockierten Poll aufwecken
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn registrieren<S>(&self, source: &mut S, quelle: Quelle, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, quelle.token(), interest)
    }

    pub fn abmelden<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Wartet auf Bereitschaft (`None` = unbegrenzt, `Some(ZERO)` = nur pruefen)
    ///
    /// Meldungen derselben Quelle werden zusammengefasst; die Reihenfolge
    /// entspricht der ersten Meldung je Quelle.
    pub fn warten(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Bereitschaft>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e);
        }

        let mut bereit: Vec<Bereitschaft> = Vec::new();
        for event in self.events.iter() {
            let quelle = Quelle::aus_token(event.token());
            let lesbar = event.is_readable() || event.is_read_closed() || event.is_error();
            let schreibbar = event.is_writable() || event.is_write_closed();

            match bereit.iter_mut().find(|b| b.quelle == quelle) {
                Some(b) => {
                    b.lesbar |= lesbar;
                    b.schreibbar |= schreibbar;
                }
                None => bereit.push(Bereitschaft {
                    quelle,
                    lesbar,
                    schreibbar,
                }),
            }
        }
        Ok(bereit)
    }
}
