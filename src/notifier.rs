//! Change detection and listener dispatch.
//!
//! [`ChangeTracker`] lives under the engine lock and turns table snapshots into
//! diffs. [`Notifier`] owns the listeners and delivers diffs from a dispatcher
//! task, so a slow listener never holds the fetch/set lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::params::ParamKey;
use crate::types::{Availability, SensorValue, SensorsChanged, StatusChanged};

pub type SensorsCallback = Box<dyn Fn(&SensorsChanged) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(&StatusChanged) + Send + Sync>;

/// Handle returned by [`crate::Engine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notification {
    Sensors(SensorsChanged),
    Status(StatusChanged),
}

#[derive(Debug)]
pub(crate) struct ChangeTracker {
    sensors: BTreeMap<ParamKey, SensorValue>,
    status: Availability,
}

impl ChangeTracker {
    pub fn new(sensors: BTreeMap<ParamKey, SensorValue>, status: Availability) -> Self {
        Self { sensors, status }
    }

    pub fn sensors_changed(
        &mut self,
        current: &BTreeMap<ParamKey, SensorValue>,
    ) -> Option<SensorsChanged> {
        let changes: BTreeMap<ParamKey, SensorValue> = current
            .iter()
            .filter(|(k, v)| self.sensors.get(k) != Some(v))
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        if changes.is_empty() {
            return None;
        }
        for (k, v) in &changes {
            self.sensors.insert(*k, v.clone());
        }
        Some(SensorsChanged { changes })
    }

    pub fn status_changed(&mut self, current: &Availability) -> Option<StatusChanged> {
        if *current == self.status {
            return None;
        }
        let previous = std::mem::replace(&mut self.status, current.clone());
        Some(StatusChanged {
            previous,
            current: current.clone(),
        })
    }
}

struct Listener {
    id: Option<SubscriptionId>,
    on_sensors: Option<SensorsCallback>,
    on_status: Option<StatusCallback>,
}

type Listeners = Arc<RwLock<Vec<Listener>>>;

pub(crate) struct Notifier {
    listeners: Listeners,
    tx: mpsc::UnboundedSender<Notification>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Listeners added here cannot be removed.
    pub fn add_permanent(&self, on_sensors: Option<SensorsCallback>, on_status: Option<StatusCallback>) {
        self.push(Listener {
            id: None,
            on_sensors,
            on_status,
        });
    }

    pub fn subscribe(
        &self,
        on_sensors: Option<SensorsCallback>,
        on_status: Option<StatusCallback>,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.push(Listener {
            id: Some(id),
            on_sensors,
            on_status,
        });
        debug!(subscription = %id, "listener subscribed");
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.id != Some(id));
        before != listeners.len()
    }

    pub fn publish(&self, notification: Notification) {
        self.ensure_dispatcher();
        if self.tx.send(notification).is_err() {
            trace!("notification dropped, dispatcher gone");
        }
    }

    fn push(&self, listener: Listener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// The dispatcher is spawned on first use from inside the runtime. It
    /// exits once the notifier, and with it the sender, is dropped.
    fn ensure_dispatcher(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut slot = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut rx) = slot.take() {
            let listeners = Arc::clone(&self.listeners);
            handle.spawn(async move {
                while let Some(notification) = rx.recv().await {
                    deliver(&listeners, &notification);
                }
                trace!("notification dispatcher finished");
            });
        }
    }
}

fn deliver(listeners: &Listeners, notification: &Notification) {
    let listeners = listeners.read().unwrap_or_else(PoisonError::into_inner);
    for listener in listeners.iter() {
        match notification {
            Notification::Sensors(change) => {
                if let Some(cb) = &listener.on_sensors {
                    cb(change);
                }
            }
            Notification::Status(change) => {
                if let Some(cb) = &listener.on_status {
                    cb(change);
                }
            }
        }
    }
}
