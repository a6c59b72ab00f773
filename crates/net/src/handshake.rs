//! Handshake-Zustandsmaschine – Token-Austausch vor dem ersten Nutzbyte
//!
//! Beide Seiten kennen ein statisches, geteiltes Token (z.B. die ASCII-Bytes
//! eines vereinbarten Wortes). Das ist keine kryptografische
//! Authentifizierung, sondern schuetzt nur vor versehentlichen oder
//! protokollfremden Verbindungen.
//!
//! ## Ablauf
//! ```text
//! Client                                   Server
//!   | Init --(schreibbar: Token direkt)-->   | Init --(lesbar)--> TokenReceived
//!   | TokenSent                            | Eingang == Token, Eingang geleert
//!   |                                      | (schreibbar) Token direkt -> TokenSent
//!   | <-------------- Token -------------- | (naechster Schreibtick) -> Established
//!   | (lesbar, Token passt) -> Established |
//! ```
//!
//! Der Client sendet bis `Established` nichts ausser seinem Token. Der
//! Server vergleicht deshalb den gesamten Eingang exakt mit dem Token. Der
//! Client vergleicht nur die ersten Bytes, weil hinter dem Echo bereits
//! Nutzdaten des Servers folgen koennen.
//!
//! Bei falschem Token sendet der Server trotzdem sein Token zurueck,
//! bleibt aber in `TokenSent` stehen. Laeuft die Handshake-Frist ab, bevor
//! ein vollstaendiges Token eingetroffen ist, gilt der Handshake als
//! fehlgeschlagen; der Server sendet dann kein Echo.
//!
//! Die Maschinen arbeiten nur auf den Puffern der Verbindung und fuehren
//! selbst kein IO aus.

use bytes::{Buf, Bytes, BytesMut};
use quizlink_core::{HandshakeStage, QuizlinkError, Rolle};

/// Ergebnis der Verarbeitung eingegangener Bytes
#[derive(Debug)]
pub enum EmpfangsErgebnis {
    /// Noch nicht genug Bytes oder nichts zu tun
    Wartend,
    /// Token korrekt empfangen (Server), Echo folgt beim naechsten Schreibtick
    Verifiziert,
    /// Handshake abgeschlossen (Client)
    Abgeschlossen,
    /// Token stimmt nicht; die Verbindung bleibt bestehen, erreicht aber nie
    /// `Established`
    Fehlgeschlagen(QuizlinkError),
}

/// Ergebnis eines Schreibticks
#[derive(Debug, PartialEq, Eq)]
pub enum SchreibErgebnis {
    Nichts,
    /// Handshake abgeschlossen (Server)
    Abgeschlossen,
    /// Diese Bytes muessen vor allen Nutzdaten auf den Transport
    DirektSenden(Bytes),
}

enum Pruefung {
    Passt,
    Unvollstaendig,
    Falsch(QuizlinkError),
}

fn abweichung(token: &[u8], erhalten: &[u8]) -> Pruefung {
    Pruefung::Falsch(QuizlinkError::HandshakeMismatch {
        erwartet: token.to_vec(),
        erhalten: erhalten.to_vec(),
    })
}

/// Server-Vergleich: der gesamte Eingang muss genau das Token sein
///
/// Ein echter Praefix des Tokens wartet auf weitere Bytes. Bei Erfolg wird
/// der Eingang geleert, bei Fehlschlag bleibt er unveraendert.
fn token_exakt(token: &[u8], eingang: &mut BytesMut) -> Pruefung {
    if eingang.len() < token.len() && token.starts_with(&eingang[..]) {
        Pruefung::Unvollstaendig
    } else if eingang[..] == *token {
        eingang.clear();
        Pruefung::Passt
    } else {
        abweichung(token, eingang)
    }
}

/// Client-Vergleich: die ersten `token.len()` Bytes muessen das Token sein
///
/// Der Rest hinter dem Token bleibt als Nutzdaten gepuffert.
fn token_am_anfang(token: &[u8], eingang: &mut BytesMut) -> Pruefung {
    if eingang.len() < token.len() {
        if token.starts_with(&eingang[..]) {
            Pruefung::Unvollstaendig
        } else {
            abweichung(token, eingang)
        }
    } else if eingang[..token.len()] == *token {
        eingang.advance(token.len());
        Pruefung::Passt
    } else {
        abweichung(token, &eingang[..token.len()])
    }
}

// ---------------------------------------------------------------------------
// Server-Seite
// ---------------------------------------------------------------------------

/// Stand der Token-Pruefung auf dem Server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pruefstand {
    Offen,
    Verifiziert,
    /// Falsches Token; das eigene Token geht trotzdem zurueck
    Abgelehnt,
    /// Frist ohne vollstaendiges Token abgelaufen; kein Echo
    Abgelaufen,
}

/// Handshake der lauschenden Seite: empfangen, pruefen, zuruecksenden
#[derive(Debug)]
pub struct ServerHandshake {
    token: Bytes,
    stage: HandshakeStage,
    stand: Pruefstand,
}

impl ServerHandshake {
    pub fn neu(token: Bytes) -> Self {
        Self {
            token,
            stage: HandshakeStage::Init,
            stand: Pruefstand::Offen,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Verarbeitet den Eingangspuffer nach einem Lesevorgang
    pub fn bei_empfang(&mut self, eingang: &mut BytesMut) -> EmpfangsErgebnis {
        match self.stage {
            HandshakeStage::Init => self.stage = HandshakeStage::TokenReceived,
            HandshakeStage::TokenReceived => {}
            // Nach der Pruefung eintreffende Bytes warten im Puffer
            _ => return EmpfangsErgebnis::Wartend,
        }

        if self.stand != Pruefstand::Offen {
            return EmpfangsErgebnis::Wartend;
        }

        match token_exakt(&self.token, eingang) {
            Pruefung::Passt => {
                self.stand = Pruefstand::Verifiziert;
                EmpfangsErgebnis::Verifiziert
            }
            Pruefung::Unvollstaendig => EmpfangsErgebnis::Wartend,
            Pruefung::Falsch(fehler) => {
                self.stand = Pruefstand::Abgelehnt;
                EmpfangsErgebnis::Fehlgeschlagen(fehler)
            }
        }
    }

    /// Treibt den Handshake bei Schreibbereitschaft weiter
    ///
    /// Das eigene Token geht auch nach einem falschen Token an die
    /// Gegenseite, damit diese den Fehler selbst erkennt. `Established` wird
    /// nur nach erfolgreicher Pruefung im Tick nach `TokenSent` erreicht,
    /// ohne zu pruefen, ob das Echo vollstaendig geschrieben wurde.
    pub fn bei_schreibbar(&mut self) -> SchreibErgebnis {
        match (self.stage, self.stand) {
            (HandshakeStage::TokenSent, Pruefstand::Verifiziert) => {
                self.stage = HandshakeStage::Established;
                SchreibErgebnis::Abgeschlossen
            }
            (HandshakeStage::TokenReceived, Pruefstand::Verifiziert | Pruefstand::Abgelehnt) => {
                self.stage = HandshakeStage::TokenSent;
                SchreibErgebnis::DirektSenden(self.token.clone())
            }
            _ => SchreibErgebnis::Nichts,
        }
    }

    /// Ob der naechste Schreibtick den Handshake weitertreibt
    pub fn wartet_auf_schreibtick(&self) -> bool {
        match self.stage {
            HandshakeStage::TokenReceived => {
                matches!(self.stand, Pruefstand::Verifiziert | Pruefstand::Abgelehnt)
            }
            HandshakeStage::TokenSent => self.stand == Pruefstand::Verifiziert,
            _ => false,
        }
    }

    /// Noch keine Entscheidung ueber das Token
    pub fn offen(&self) -> bool {
        self.stand == Pruefstand::Offen
    }

    pub fn abgelehnt(&self) -> bool {
        matches!(self.stand, Pruefstand::Abgelehnt | Pruefstand::Abgelaufen)
    }

    /// Frist abgelaufen: ein offener Handshake gilt als fehlgeschlagen
    pub fn zeitueberschreitung(&mut self, eingang: &[u8], frist_ms: u64) -> Option<QuizlinkError> {
        if !self.offen() {
            return None;
        }
        self.stand = Pruefstand::Abgelaufen;
        Some(QuizlinkError::HandshakeZeitueberschreitung {
            frist_ms,
            erhalten: eingang.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Client-Seite
// ---------------------------------------------------------------------------

/// Handshake der waehlenden Seite: senden, Echo pruefen
#[derive(Debug)]
pub struct ClientHandshake {
    token: Bytes,
    stage: HandshakeStage,
    abgelehnt: bool,
}

impl ClientHandshake {
    pub fn neu(token: Bytes) -> Self {
        Self {
            token,
            stage: HandshakeStage::Init,
            abgelehnt: false,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Erster Schreibtick: Token direkt senden
    pub fn bei_schreibbar(&mut self) -> SchreibErgebnis {
        if self.stage == HandshakeStage::Init {
            self.stage = HandshakeStage::TokenSent;
            SchreibErgebnis::DirektSenden(self.token.clone())
        } else {
            SchreibErgebnis::Nichts
        }
    }

    /// Prueft das Echo des Servers
    pub fn bei_empfang(&mut self, eingang: &mut BytesMut) -> EmpfangsErgebnis {
        if self.stage != HandshakeStage::TokenSent || self.abgelehnt {
            return EmpfangsErgebnis::Wartend;
        }

        match token_am_anfang(&self.token, eingang) {
            Pruefung::Passt => {
                // TokenReceived wird im selben Schritt durchlaufen
                self.stage = HandshakeStage::Established;
                EmpfangsErgebnis::Abgeschlossen
            }
            Pruefung::Unvollstaendig => EmpfangsErgebnis::Wartend,
            Pruefung::Falsch(fehler) => {
                self.abgelehnt = true;
                EmpfangsErgebnis::Fehlgeschlagen(fehler)
            }
        }
    }

    pub fn wartet_auf_schreibtick(&self) -> bool {
        self.stage == HandshakeStage::Init
    }

    pub fn offen(&self) -> bool {
        self.stage != HandshakeStage::Established && !self.abgelehnt
    }

    pub fn abgelehnt(&self) -> bool {
        self.abgelehnt
    }

    pub fn zeitueberschreitung(&mut self, eingang: &[u8], frist_ms: u64) -> Option<QuizlinkError> {
        if !self.offen() {
            return None;
        }
        self.abgelehnt = true;
        Some(QuizlinkError::HandshakeZeitueberschreitung {
            frist_ms,
            erhalten: eingang.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Rollen-unabhaengige Huelle
// ---------------------------------------------------------------------------

/// Handshake einer Verbindung, je nach Rolle
#[derive(Debug)]
pub enum Handshake {
    Server(ServerHandshake),
    Client(ClientHandshake),
}

impl Handshake {
    pub fn fuer_rolle(rolle: Rolle, token: Bytes) -> Self {
        match rolle {
            Rolle::Server => Self::Server(ServerHandshake::neu(token)),
            Rolle::Client => Self::Client(ClientHandshake::neu(token)),
        }
    }

    pub fn rolle(&self) -> Rolle {
        match self {
            Self::Server(_) => Rolle::Server,
            Self::Client(_) => Rolle::Client,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        match self {
            Self::Server(hs) => hs.stage(),
            Self::Client(hs) => hs.stage(),
        }
    }

    pub fn ist_etabliert(&self) -> bool {
        self.stage() == HandshakeStage::Established
    }

    /// Eingereihte Nutzdaten duerfen erst ab `Established` auf den Transport
    pub fn ausgang_freigegeben(&self) -> bool {
        self.ist_etabliert()
    }

    /// Weder abgeschlossen noch fehlgeschlagen; nur dann greift die Frist
    pub fn offen(&self) -> bool {
        match self {
            Self::Server(hs) => hs.offen(),
            Self::Client(hs) => hs.offen(),
        }
    }

    pub fn abgelehnt(&self) -> bool {
        match self {
            Self::Server(hs) => hs.abgelehnt(),
            Self::Client(hs) => hs.abgelehnt(),
        }
    }

    pub fn bei_empfang(&mut self, eingang: &mut BytesMut) -> EmpfangsErgebnis {
        match self {
            Self::Server(hs) => hs.bei_empfang(eingang),
            Self::Client(hs) => hs.bei_empfang(eingang),
        }
    }

    pub fn bei_schreibbar(&mut self) -> SchreibErgebnis {
        match self {
            Self::Server(hs) => hs.bei_schreibbar(),
            Self::Client(hs) => hs.bei_schreibbar(),
        }
    }

    pub fn wartet_auf_schreibtick(&self) -> bool {
        match self {
            Self::Server(hs) => hs.wartet_auf_schreibtick(),
            Self::Client(hs) => hs.wartet_auf_schreibtick(),
        }
    }

    pub fn zeitueberschreitung(&mut self, eingang: &[u8], frist_ms: u64) -> Option<QuizlinkError> {
        match self {
            Self::Server(hs) => hs.zeitueberschreitung(eingang, frist_ms),
            Self::Client(hs) => hs.zeitueberschreitung(eingang, frist_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &[u8] = b"India";

    fn puffer(inhalt: &[u8]) -> BytesMut {
        BytesMut::from(inhalt)
    }

    fn verifizierter_server() -> ServerHandshake {
        let mut hs = ServerHandshake::neu(Bytes::from_static(TOKEN));
        assert!(matches!(
            hs.bei_empfang(&mut puffer(TOKEN)),
            EmpfangsErgebnis::Verifiziert
        ));
        hs
    }

    #[test]
    fn server_ablauf_bis_established() {
        let mut hs = ServerHandshake::neu(Bytes::from_static(TOKEN));
        let mut eingang = puffer(b"India");

        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Verifiziert));
        assert_eq!(hs.stage(), HandshakeStage::TokenReceived);
        assert!(eingang.is_empty(), "Token muss aus dem Eingang entfernt werden");

        assert_eq!(
            hs.bei_schreibbar(),
            SchreibErgebnis::DirektSenden(Bytes::from_static(TOKEN))
        );
        assert_eq!(hs.stage(), HandshakeStage::TokenSent);

        assert_eq!(hs.bei_schreibbar(), SchreibErgebnis::Abgeschlossen);
        assert_eq!(hs.stage(), HandshakeStage::Established);
        assert!(!hs.wartet_auf_schreibtick());
        assert!(!hs.offen());
    }

    #[test]
    fn server_falsches_token_bleibt_stehen() {
        let mut hs = ServerHandshake::neu(Bytes::from_static(TOKEN));
        let mut eingang = puffer(b"Oscar");

        match hs.bei_empfang(&mut eingang) {
            EmpfangsErgebnis::Fehlgeschlagen(QuizlinkError::HandshakeMismatch { erhalten, .. }) => {
                assert_eq!(erhalten, b"Oscar".to_vec());
            }
            anders => panic!("Fehlschlag erwartet, erhalten: {anders:?}"),
        }
        // Puffer bleibt wie er ist
        assert_eq!(&eingang[..], b"Oscar");
        assert!(hs.abgelehnt());

        // Eigenes Token geht trotzdem raus, ein Abschluss folgt nie
        assert_eq!(
            hs.bei_schreibbar(),
            SchreibErgebnis::DirektSenden(Bytes::from_static(TOKEN))
        );
        for _ in 0..3 {
            assert_eq!(hs.bei_schreibbar(), SchreibErgebnis::Nichts);
        }
        assert_eq!(hs.stage(), HandshakeStage::TokenSent);
        assert!(!hs.wartet_auf_schreibtick());

        // Weitere Bytes loesen keinen zweiten Fehlschlag aus
        eingang.extend_from_slice(b"India");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Wartend));
    }

    #[test]
    fn server_laengeres_token_ist_falsch() {
        let mut hs = ServerHandshake::neu(Bytes::from_static(TOKEN));
        let mut eingang = puffer(b"IndiaX");

        assert!(matches!(
            hs.bei_empfang(&mut eingang),
            EmpfangsErgebnis::Fehlgeschlagen(QuizlinkError::HandshakeMismatch { .. })
        ));
        assert_eq!(&eingang[..], b"IndiaX");
        assert!(hs.wartet_auf_schreibtick(), "Echo folgt trotzdem");
    }

    #[test]
    fn server_token_in_teilen() {
        let mut hs = ServerHandshake::neu(Bytes::from_static(TOKEN));
        let mut eingang = puffer(b"Ind");

        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Wartend));
        assert!(!hs.wartet_auf_schreibtick());
        assert!(hs.offen());

        eingang.extend_from_slice(b"ia");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Verifiziert));
        assert!(hs.wartet_auf_schreibtick());
    }

    #[test]
    fn server_frist_ohne_echo() {
        let mut hs = ServerHandshake::neu(Bytes::from_static(TOKEN));
        let mut eingang = puffer(b"Ind");
        hs.bei_empfang(&mut eingang);

        match hs.zeitueberschreitung(&eingang, 250) {
            Some(QuizlinkError::HandshakeZeitueberschreitung { frist_ms, erhalten }) => {
                assert_eq!(frist_ms, 250);
                assert_eq!(erhalten, b"Ind".to_vec());
            }
            anders => panic!("Zeitueberschreitung erwartet, erhalten: {anders:?}"),
        }
        assert!(hs.abgelehnt());
        assert!(hs.zeitueberschreitung(&eingang, 250).is_none(), "nur einmal");

        // Kein Echo, damit ein Token-Praefix nie als gueltig durchgeht
        assert!(!hs.wartet_auf_schreibtick());
        assert_eq!(hs.bei_schreibbar(), SchreibErgebnis::Nichts);
        assert_eq!(hs.stage(), HandshakeStage::TokenReceived);

        eingang.extend_from_slice(b"ia");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Wartend));
    }

    #[test]
    fn frist_nach_entscheidung_wirkungslos() {
        let mut hs = verifizierter_server();
        assert!(hs.zeitueberschreitung(&[], 100).is_none());
        assert!(hs.wartet_auf_schreibtick());
    }

    #[test]
    fn client_ablauf_bis_established() {
        let mut hs = ClientHandshake::neu(Bytes::from_static(TOKEN));
        assert!(hs.wartet_auf_schreibtick());

        assert_eq!(
            hs.bei_schreibbar(),
            SchreibErgebnis::DirektSenden(Bytes::from_static(TOKEN))
        );
        assert_eq!(hs.stage(), HandshakeStage::TokenSent);
        assert_eq!(hs.bei_schreibbar(), SchreibErgebnis::Nichts);

        let mut eingang = puffer(b"India");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Abgeschlossen));
        assert_eq!(hs.stage(), HandshakeStage::Established);
    }

    #[test]
    fn client_echo_mit_nutzdaten_im_selben_segment() {
        let mut hs = ClientHandshake::neu(Bytes::from_static(TOKEN));
        hs.bei_schreibbar();

        let mut eingang = puffer(b"IndiaHallo");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Abgeschlossen));
        assert_eq!(&eingang[..], b"Hallo");
    }

    #[test]
    fn client_falsches_echo() {
        let mut hs = ClientHandshake::neu(Bytes::from_static(TOKEN));
        hs.bei_schreibbar();

        let mut eingang = puffer(b"Papa!");
        assert!(matches!(
            hs.bei_empfang(&mut eingang),
            EmpfangsErgebnis::Fehlgeschlagen(QuizlinkError::HandshakeMismatch { .. })
        ));
        assert_eq!(hs.stage(), HandshakeStage::TokenSent);
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Wartend));
    }

    #[test]
    fn client_kuerzeres_echo_wartet_bis_zur_frist() {
        let mut hs = ClientHandshake::neu(Bytes::from_static(b"IndiaX"));
        hs.bei_schreibbar();

        let mut eingang = puffer(b"India");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Wartend));
        assert!(hs.offen());

        assert!(matches!(
            hs.zeitueberschreitung(&eingang, 300),
            Some(QuizlinkError::HandshakeZeitueberschreitung { .. })
        ));
        assert!(hs.abgelehnt());
        assert_ne!(hs.stage(), HandshakeStage::Established);
    }

    #[test]
    fn client_ignoriert_bytes_vor_dem_senden() {
        let mut hs = ClientHandshake::neu(Bytes::from_static(TOKEN));
        let mut eingang = puffer(b"India");
        assert!(matches!(hs.bei_empfang(&mut eingang), EmpfangsErgebnis::Wartend));
        assert_eq!(hs.stage(), HandshakeStage::Init);
        assert_eq!(&eingang[..], b"India");
    }

    #[test]
    fn huelle_delegiert_nach_rolle() {
        let hs = Handshake::fuer_rolle(Rolle::Client, Bytes::from_static(TOKEN));
        assert_eq!(hs.rolle(), Rolle::Client);
        assert!(!hs.ist_etabliert());
        assert!(hs.wartet_auf_schreibtick());
        assert!(hs.offen());

        let hs = Handshake::fuer_rolle(Rolle::Server, Bytes::from_static(TOKEN));
        assert_eq!(hs.rolle(), Rolle::Server);
        assert!(!hs.wartet_auf_schreibtick());
        assert!(!hs.ausgang_freigegeben());
    }

    #[test]
    fn ausgang_erst_ab_established_frei() {
        let mut hs = Handshake::fuer_rolle(Rolle::Server, Bytes::from_static(TOKEN));
        hs.bei_empfang(&mut puffer(TOKEN));
        hs.bei_schreibbar();
        assert_eq!(hs.stage(), HandshakeStage::TokenSent);
        assert!(!hs.ausgang_freigegeben());
        hs.bei_schreibbar();
        assert!(hs.ausgang_freigegeben());
    }
}
