//! Integration-Tests fuer den Token-Handshake zwischen Server und Client

use crossbeam_channel::Receiver;
use quizlink_net::{
    ClientKonfig, DialingManager, EventKind, HandshakeStage, ListeningManager, NetEvent,
    ServerKonfig,
};
use std::time::Duration;

const WARTEZEIT: Duration = Duration::from_secs(5);
const RUHEZEIT: Duration = Duration::from_millis(300);

fn server(token: &str) -> ListeningManager {
    ListeningManager::neu(ServerKonfig::neu("127.0.0.1:0").mit_token(token))
        .expect("Server konnte nicht erstellt werden")
}

fn client(adresse: std::net::SocketAddr, token: &str) -> DialingManager {
    DialingManager::neu(ClientKonfig::neu(adresse.to_string()).mit_token(token))
        .expect("Client konnte nicht erstellt werden")
}

fn warten(rx: &Receiver<NetEvent>, was: &str) -> NetEvent {
    rx.recv_timeout(WARTEZEIT)
        .unwrap_or_else(|_| panic!("Event '{was}' nicht eingetroffen"))
}

fn daten_sammeln(rx: &Receiver<NetEvent>, laenge: usize) -> Vec<u8> {
    let mut gesammelt = Vec::new();
    while gesammelt.len() < laenge {
        let event = warten(rx, "data");
        gesammelt.extend_from_slice(event.payload().expect("Nutzdaten erwartet"));
    }
    gesammelt
}

#[test]
fn handshake_rundlauf_je_seite_ein_done() {
    let server = server("India");
    let (_, server_done) = server.events().subscribe_channel(EventKind::HandshakeDone, 8);
    let (_, server_neu) = server.events().subscribe_channel(EventKind::NewConnection, 8);
    let adresse = server.start().unwrap();

    let client = client(adresse, "India");
    let (_, client_done) = client.events().subscribe_channel(EventKind::HandshakeDone, 8);
    client.connect().unwrap();

    let id = match warten(&server_neu, "new-connection") {
        NetEvent::NewConnection { id, .. } => id,
        anders => panic!("new-connection erwartet, erhalten: {anders:?}"),
    };

    let done = warten(&server_done, "handshake-done (Server)");
    assert_eq!(done.connection_id(), Some(id));
    let done = warten(&client_done, "handshake-done (Client)");
    assert_eq!(done.connection_id(), None);

    // Genau ein handshake-done pro Seite
    assert!(server_done.recv_timeout(RUHEZEIT).is_err());
    assert!(client_done.try_recv().is_err());

    assert_eq!(server.handshake_stage(id), Some(HandshakeStage::Established));
    assert_eq!(client.handshake_stage(), Some(HandshakeStage::Established));

    client.disconnect();
    client.join();
    server.stop();
    server.join();
}

#[test]
fn nutzdaten_in_beide_richtungen() {
    let server = server("India");
    let (_, server_done) = server.events().subscribe_channel(EventKind::HandshakeDone, 8);
    let (_, server_daten) = server.events().subscribe_channel(EventKind::Data, 64);
    let adresse = server.start().unwrap();

    let client = client(adresse, "India");
    let (_, client_done) = client.events().subscribe_channel(EventKind::HandshakeDone, 8);
    let (_, client_daten) = client.events().subscribe_channel(EventKind::Data, 64);
    client.connect().unwrap();

    let id = warten(&server_done, "handshake-done").connection_id().unwrap();
    warten(&client_done, "handshake-done");

    client.send(b"Antwort B").unwrap();
    assert_eq!(daten_sammeln(&server_daten, 9), b"Antwort B");

    server.send(id, b"Frage 2").unwrap();
    assert_eq!(daten_sammeln(&client_daten, 7), b"Frage 2");

    client.disconnect();
    client.join();
    server.stop();
    server.join();
}

#[test]
fn senden_vor_handshake_wird_nachgeliefert() {
    let server = server("India");
    let (_, server_daten) = server.events().subscribe_channel(EventKind::Data, 64);
    let (_, server_pakete) = server.events().subscribe_channel(EventKind::DataPacket, 64);

    // Server reiht schon bei new-connection Bytes ein
    let sender = server.clone();
    server.subscribe(EventKind::NewConnection, move |event| {
        if let NetEvent::NewConnection { id, .. } = event {
            sender.send(*id, b"willkommen").unwrap();
        }
    });
    let adresse = server.start().unwrap();

    let client = client(adresse, "India");
    let (_, client_done) = client.events().subscribe_channel(EventKind::HandshakeDone, 8);
    let (_, client_daten) = client.events().subscribe_channel(EventKind::Data, 64);
    client.connect().unwrap();
    client.send(b"frueh").unwrap();

    warten(&client_done, "handshake-done");
    assert_eq!(daten_sammeln(&client_daten, 10), b"willkommen");
    assert_eq!(daten_sammeln(&server_daten, 5), b"frueh");

    // Handshake-Bytes tauchen nie als data-packet auf
    while let Ok(paket) = server_pakete.try_recv() {
        assert!(!paket.payload().unwrap().starts_with(b"India"));
    }

    client.disconnect();
    client.join();
    server.stop();
    server.join();
}

#[test]
fn falsches_token_auf_beiden_seiten_gemeldet() {
    let server = server("India");
    let (_, fehlgeschlagen) = server.events().subscribe_channel(EventKind::HandshakeFailed, 8);
    let (_, server_done) = server.events().subscribe_channel(EventKind::HandshakeDone, 8);
    let (_, server_daten) = server.events().subscribe_channel(EventKind::Data, 8);
    let adresse = server.start().unwrap();

    let client = client(adresse, "Oscar");
    let (_, client_fehler) = client.events().subscribe_channel(EventKind::HandshakeError, 8);
    let (_, client_done) = client.events().subscribe_channel(EventKind::HandshakeDone, 8);
    client.connect().unwrap();

    let (id, stage) = match warten(&fehlgeschlagen, "handshake-failed") {
        NetEvent::HandshakeFailed {
            id,
            stage,
            peer_port,
        } => {
            assert_eq!(Some(peer_port), client.local_addr().map(|a| a.port()));
            (id, stage)
        }
        anders => panic!("handshake-failed erwartet, erhalten: {anders:?}"),
    };
    assert_eq!(stage, HandshakeStage::TokenReceived);

    match warten(&client_fehler, "handshake-error") {
        NetEvent::HandshakeError { error, .. } => {
            assert!(matches!(
                *error,
                quizlink_net::QuizlinkError::HandshakeMismatch { .. }
            ));
        }
        anders => panic!("handshake-error erwartet, erhalten: {anders:?}"),
    }

    // Keine Seite erreicht Established, Nutzdaten werden nicht zugestellt
    client.send(b"trotzdem").unwrap();
    assert!(server_done.recv_timeout(RUHEZEIT).is_err());
    assert!(client_done.try_recv().is_err());
    assert!(server_daten.try_recv().is_err());
    assert_ne!(server.handshake_stage(id), Some(HandshakeStage::Established));
    assert_ne!(client.handshake_stage(), Some(HandshakeStage::Established));

    // Fehlschlag wird nur einmal gemeldet; die Verbindung bleibt bestehen
    assert!(fehlgeschlagen.try_recv().is_err());
    assert!(client_fehler.try_recv().is_err());
    assert!(server.connection_ids().contains(&id));

    client.disconnect();
    client.join();
    server.stop();
    server.join();
}

const KURZE_FRIST: Duration = Duration::from_millis(300);

struct Fehlversuch {
    server: ListeningManager,
    client: DialingManager,
    fehlgeschlagen: Receiver<NetEvent>,
    server_done: Receiver<NetEvent>,
    server_daten: Receiver<NetEvent>,
    client_fehler: Receiver<NetEvent>,
    client_done: Receiver<NetEvent>,
}

/// Server mit Token "India", Client mit abweichendem Token, beide mit kurzer Frist
fn fehlversuch(client_token: &str) -> Fehlversuch {
    let server = ListeningManager::neu(
        ServerKonfig::neu("127.0.0.1:0")
            .mit_token("India")
            .mit_handshake_frist(KURZE_FRIST),
    )
    .unwrap();
    let (_, fehlgeschlagen) = server.events().subscribe_channel(EventKind::HandshakeFailed, 8);
    let (_, server_done) = server.events().subscribe_channel(EventKind::HandshakeDone, 8);
    let (_, server_daten) = server.events().subscribe_channel(EventKind::Data, 8);
    let adresse = server.start().unwrap();

    let client = DialingManager::neu(
        ClientKonfig::neu(adresse.to_string())
            .mit_token(client_token)
            .mit_handshake_frist(KURZE_FRIST),
    )
    .unwrap();
    let (_, client_fehler) = client.events().subscribe_channel(EventKind::HandshakeError, 8);
    let (_, client_done) = client.events().subscribe_channel(EventKind::HandshakeDone, 8);
    client.connect().unwrap();

    Fehlversuch {
        server,
        client,
        fehlgeschlagen,
        server_done,
        server_daten,
        client_fehler,
        client_done,
    }
}

impl Fehlversuch {
    /// Beide Seiten melden den Fehlschlag genau einmal, keine erreicht Established
    fn pruefen(self) {
        let id = warten(&self.fehlgeschlagen, "handshake-failed")
            .connection_id()
            .unwrap();
        warten(&self.client_fehler, "handshake-error");

        assert!(self.server_done.recv_timeout(RUHEZEIT).is_err());
        assert!(self.client_done.try_recv().is_err());
        assert!(self.server_daten.try_recv().is_err(), "keine Token-Reste als data");
        assert_ne!(self.server.handshake_stage(id), Some(HandshakeStage::Established));
        assert_ne!(self.client.handshake_stage(), Some(HandshakeStage::Established));
        assert!(self.fehlgeschlagen.try_recv().is_err());
        assert!(self.client_fehler.try_recv().is_err());

        self.client.disconnect();
        self.client.join();
        self.server.stop();
        self.server.join();
    }
}

#[test]
fn laengeres_token_auf_beiden_seiten_gemeldet() {
    fehlversuch("IndiaX").pruefen();
}

#[test]
fn kuerzeres_token_auf_beiden_seiten_gemeldet() {
    fehlversuch("Ind").pruefen();
}

#[test]
fn kuerzeres_token_endet_mit_frist() {
    let versuch = fehlversuch("Ind");
    match warten(&versuch.fehlgeschlagen, "handshake-failed") {
        NetEvent::HandshakeFailed { stage, .. } => {
            assert_eq!(stage, HandshakeStage::TokenReceived);
        }
        anders => panic!("handshake-failed erwartet, erhalten: {anders:?}"),
    }
    match warten(&versuch.client_fehler, "handshake-error") {
        NetEvent::HandshakeError { error, .. } => assert!(matches!(
            *error,
            quizlink_net::QuizlinkError::HandshakeZeitueberschreitung { .. }
        )),
        anders => panic!("handshake-error erwartet, erhalten: {anders:?}"),
    }

    versuch.client.disconnect();
    versuch.client.join();
    versuch.server.stop();
    versuch.server.join();
}
