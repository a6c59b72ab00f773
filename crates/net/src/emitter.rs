//! Event-Dispatcher – Benannte Publish/Subscribe-Registry
//!
//! Jeder Verbindungs-Manager besitzt seinen eigenen `EventEmitter`. Die
//! Registry liegt hinter einem `RwLock`; `emit` kopiert die Abonnentenliste
//! heraus und ruft die Callbacks ohne gehaltenes Lock auf. Callbacks duerfen
//! daher selbst abonnieren, abbestellen oder `send` aufrufen.
//!
//! ## Vertrag fuer Abonnenten
//! Lebenszyklus- und Daten-Events laufen synchron auf dem Thread der
//! Event-Loop. Ein langsamer Callback haelt alle anderen Verbindungen auf.
//! Wer mehr Zeit braucht, abonniert ueber `subscribe_channel` und arbeitet
//! die Queue auf einem eigenen Thread ab.

use crossbeam_channel::{bounded, Receiver, TrySendError};
use parking_lot::RwLock;
use quizlink_core::{EventKind, NetEvent, QuizlinkError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Callback fuer ein einzelnes Event
pub type Callback = Arc<dyn Fn(&NetEvent) + Send + Sync>;

/// Globaler Listener, wird vor den Event-spezifischen Abonnenten aufgerufen
pub type GlobalListener = Arc<dyn Fn(EventKind, &NetEvent) + Send + Sync>;

/// Handle eines Abonnements
///
/// Bleibt gueltig, auch wenn andere Abonnements entfernt werden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    abos: HashMap<EventKind, Vec<(SubscriptionId, Callback)>>,
    global: Option<GlobalListener>,
    naechste_id: u64,
}

/// Benannte Publish/Subscribe-Registry
///
/// Clone teilt den inneren Zustand.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<RwLock<Registry>>,
}

impl EventEmitter {
    /// Erstellt einen leeren EventEmitter
    pub fn neu() -> Self {
        Self::default()
    }

    /// Registriert einen Callback fuer `kind`
    ///
    /// Callbacks werden in Registrierungsreihenfolge aufgerufen.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&NetEvent) + Send + Sync + 'static,
    {
        let mut reg = self.inner.write();
        reg.naechste_id += 1;
        let id = SubscriptionId(reg.naechste_id);
        reg.abos
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        tracing::trace!(event = kind.name(), "Abonnement registriert");
        id
    }

    /// Abonniert `kind` ueber eine begrenzte Queue
    ///
    /// Ist die Queue voll, wird das Event verworfen und geloggt; die
    /// Event-Loop blockiert nie auf einem langsamen Empfaenger.
    pub fn subscribe_channel(
        &self,
        kind: EventKind,
        kapazitaet: usize,
    ) -> (SubscriptionId, Receiver<NetEvent>) {
        let (tx, rx) = bounded(kapazitaet);
        let id = self.subscribe(kind, move |event| match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(event = kind.name(), "Event-Queue voll – Event verworfen");
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!(event = kind.name(), "Event-Queue geschlossen");
            }
        });
        (id, rx)
    }

    /// Entfernt ein einzelnes Abonnement oder alle Abonnements von `kind`
    ///
    /// Gibt die Anzahl entfernter Callbacks zurueck. Unbekannte Events oder
    /// IDs sind kein Fehler.
    pub fn unsubscribe(&self, kind: EventKind, id: Option<SubscriptionId>) -> usize {
        let mut reg = self.inner.write();
        let Some(liste) = reg.abos.get_mut(&kind) else {
            return 0;
        };
        let vorher = liste.len();
        match id {
            Some(id) => liste.retain(|(abo_id, _)| *abo_id != id),
            None => liste.clear(),
        }
        vorher - liste.len()
    }

    /// Entfernt die Abonnements aller Events
    ///
    /// Der globale Listener bleibt bestehen.
    pub fn unsubscribe_all(&self) {
        self.inner.write().abos.clear();
    }

    /// Setzt den globalen Listener (ersetzt einen vorhandenen)
    pub fn attach_global_listener<F>(&self, listener: F)
    where
        F: Fn(EventKind, &NetEvent) + Send + Sync + 'static,
    {
        self.inner.write().global = Some(Arc::new(listener));
    }

    /// Entfernt den globalen Listener
    pub fn detach_global_listener(&self) {
        self.inner.write().global = None;
    }

    /// Anzahl der Abonnenten fuer `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.read().abos.get(&kind).map_or(0, Vec::len)
    }

    /// Loest ein Event aus
    ///
    /// Ruft zuerst den globalen Listener, dann alle Abonnenten von
    /// `event.kind()` synchron auf dem aktuellen Thread auf. Ein Callback,
    /// der in Panik geraet, haelt die uebrigen nicht auf; der erste solche
    /// Fehler wird am Ende als `QuizlinkError::Subscriber` zurueckgegeben.
    pub fn emit(&self, event: &NetEvent) -> Result<()> {
        let kind = event.kind();
        let (global, abonnenten) = {
            let reg = self.inner.read();
            let abonnenten: Vec<Callback> = reg
                .abos
                .get(&kind)
                .map(|liste| liste.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default();
            (reg.global.clone(), abonnenten)
        };

        let mut erster_fehler = None;

        if let Some(global) = global {
            if let Err(grund) = abgesichert(|| global(kind, event)) {
                tracing::error!(event = kind.name(), grund = %grund, "Globaler Listener fehlgeschlagen");
                erster_fehler.get_or_insert(QuizlinkError::Subscriber {
                    event: kind.name(),
                    grund,
                });
            }
        }

        for callback in abonnenten {
            if let Err(grund) = abgesichert(|| callback(event)) {
                tracing::error!(event = kind.name(), grund = %grund, "Abonnent fehlgeschlagen");
                erster_fehler.get_or_insert(QuizlinkError::Subscriber {
                    event: kind.name(),
                    grund,
                });
            }
        }

        match erster_fehler {
            Some(fehler) => Err(fehler),
            None => Ok(()),
        }
    }
}

/// Fuehrt einen Callback aus und faengt eine Panik ab
fn abgesichert(f: impl FnOnce()) -> std::result::Result<(), String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panik| panik_text(panik.as_ref()))
}

fn panik_text(panik: &(dyn Any + Send)) -> String {
    if let Some(text) = panik.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panik.downcast_ref::<String>() {
        text.clone()
    } else {
        "unbekannte Panik".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
