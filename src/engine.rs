//! The sync engine: a fetch loop and a write loop over one shared state.
//!
//! Every exchange with the device happens while holding the core lock, so at
//! most one request is in flight. Readers get copies of the last published
//! [`View`] and never wait on that lock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::availability::AvailabilityTracker;
use crate::config::EngineConfig;
use crate::error::{PartialFailure, ValidationError};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::notifier::{
    ChangeTracker, Notification, Notifier, SensorsCallback, StatusCallback, SubscriptionId,
};
use crate::params::{build_zone_key_map, BaseParam, ParamKey, ParamKind, WriteRoute};
use crate::protocol::{
    encode_wire, fetch_timeout, fetch_urls, main_set_bodies, main_set_url, menu_set_body,
    menu_set_url, parse_group, GroupPayload, WriteEntry, WriteTarget, ZoneState, SET_TIMEOUT,
};
use crate::sanitizer::{Sanitizer, ZERO_TOLERANCE};
use crate::scheduler::{FetchScheduler, TickInput};
use crate::session::Session;
use crate::transport::{Clock, SystemClock, Transport};
use crate::types::*;
use crate::writes::{route_write, validate, PendingWrite, WriteCoordinator};
use crate::{Error, Result};

pub struct EngineBuilder<T: Transport> {
    config: EngineConfig,
    transport: T,
    clock: Arc<dyn Clock>,
    sensors_callbacks: Vec<SensorsCallback>,
    status_callbacks: Vec<StatusCallback>,
    log: Option<(MessageLogMode, PathBuf)>,
}

impl<T: Transport> EngineBuilder<T> {
    pub fn new(config: EngineConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            clock: Arc::new(SystemClock),
            sensors_callbacks: Vec::new(),
            status_callbacks: Vec::new(),
            log: None,
        }
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn on_sensors_changed(
        mut self,
        f: impl Fn(&SensorsChanged) + Send + Sync + 'static,
    ) -> Self {
        self.sensors_callbacks.push(Box::new(f));
        self
    }

    pub fn on_status_changed(mut self, f: impl Fn(&StatusChanged) + Send + Sync + 'static) -> Self {
        self.status_callbacks.push(Box::new(f));
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<PathBuf>) -> Self {
        self.log = Some((mode, path.into()));
        self
    }

    pub fn build(self) -> Result<Engine<T>> {
        let config = self.config;
        config.validate()?;

        let logger = match self.log {
            Some((mode, path)) => Some(MessageLogger::new(mode, &path)?),
            None => None,
        };

        let keys = build_zone_key_map(&config.enabled_params(), config.zones);
        let menu_keys: Vec<ParamKey> = keys
            .values()
            .filter(|k| {
                let d = k.descriptor();
                d.read_group == RequestGroup::OtherParams && d.menu_id.is_some()
            })
            .copied()
            .collect();
        let menu_ids = menu_keys.iter().filter_map(ParamKey::menu_id).collect();

        let fixed_units = match config.units {
            UnitMode::Metric => Some(UnitSystem::Metric),
            UnitMode::Imperial => Some(UnitSystem::Imperial),
            UnitMode::Auto => None,
        };
        let mut server: BTreeMap<ParamKey, Option<ParamValue>> =
            keys.values().map(|k| (*k, None)).collect();
        if let Some(system) = fixed_units {
            server.insert(
                ParamKey::new(BaseParam::Units, 1),
                Some(ParamValue::Text(system.as_str().to_string())),
            );
        }

        let mut core = Core {
            session: Session::new(
                &config.base_url,
                &config.username,
                &config.password,
                config.gateway.as_deref(),
            ),
            scheduler: FetchScheduler::new(
                config.high_priority_groups(),
                config.low_priority_groups(),
                config.poll_interval(),
            ),
            sanitizer: Sanitizer::new(ZERO_TOLERANCE),
            writes: WriteCoordinator::new(config.max_retries),
            availability: AvailabilityTracker::new(config.zones, fixed_units.is_some()),
            tracker: ChangeTracker::new(BTreeMap::new(), Availability::default()),
            logger,
            server,
            capabilities: BTreeMap::new(),
            zones: BTreeMap::new(),
            units: fixed_units.unwrap_or_default(),
            fixed_units: fixed_units.is_some(),
            halted: None,
        };
        let view = core.view();
        core.tracker = ChangeTracker::new(view.sensors.clone(), view.availability.clone());

        let notifier = Notifier::new();
        for cb in self.sensors_callbacks {
            notifier.add_permanent(Some(cb), None);
        }
        for cb in self.status_callbacks {
            notifier.add_permanent(None, Some(cb));
        }

        debug!(
            keys = keys.len(),
            zones = config.zones,
            units = ?config.units,
            high = ?core.scheduler.high_priority(),
            low = ?core.scheduler.low_priority(),
            "engine built"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Engine {
            inner: Arc::new(Inner {
                config,
                transport: self.transport,
                clock: self.clock,
                keys,
                menu_keys,
                menu_ids,
                core: Mutex::new(core),
                view: RwLock::new(view),
                notifier,
                write_wake: Arc::new(Notify::new()),
                shutdown,
                started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// Handle to a running or stopped sync engine. Clones share the engine.
pub struct Engine<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Engine<T> {
    pub fn builder(config: EngineConfig, transport: T) -> EngineBuilder<T> {
        EngineBuilder::new(config, transport)
    }

    /// Spawns the fetch and write loops. Calling it on a running engine does
    /// nothing; calling it after a gateway mismatch clears the halt.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut core = inner.core.lock().await;
            core.halted = None;
            if inner.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.shutdown.send_replace(false);
        tokio::spawn(fetch_loop(
            Arc::downgrade(inner),
            generation,
            inner.shutdown.subscribe(),
        ));
        tokio::spawn(write_loop(
            Arc::downgrade(inner),
            Arc::clone(&inner.write_wake),
            generation,
            inner.shutdown.subscribe(),
        ));
        info!("engine started");
        Ok(())
    }

    /// Cancels both loops. A request already in flight completes but its
    /// result is discarded.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Runs one scheduler tick and returns the delay the fetch loop would
    /// sleep afterwards.
    pub async fn poll_once(&self) -> Result<Duration> {
        self.inner.tick(None).await
    }

    /// Runs one reconciliation pass. `None` means nothing is pending.
    pub async fn reconcile_once(&self) -> Result<Option<Duration>> {
        self.inner.reconcile(None).await
    }

    pub fn sensor_values(&self) -> BTreeMap<String, SensorValue> {
        self.inner
            .read_view()
            .sensors
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    pub fn sensor_value(&self, name: &str) -> Option<SensorValue> {
        let key = self.inner.keys.get(name)?;
        self.inner.read_view().sensors.get(key).cloned()
    }

    pub fn availability(&self) -> Availability {
        self.inner.read_view().availability.clone()
    }

    /// Writable keys with the values the device currently accepts.
    pub fn allowed_set_values(&self) -> BTreeMap<String, AllowedValues> {
        self.inner
            .read_view()
            .allowed
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.inner.read_view().pending.clone()
    }

    /// Names of every key this engine mirrors.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys.keys().map(String::as_str)
    }

    /// Validates and queues writes. Accepted values show up in
    /// [`Engine::sensor_values`] right away.
    ///
    /// The error carries this call's rejected values and any earlier writes
    /// that were given up on since the previous call.
    pub async fn request_changes<I, K, V>(
        &self,
        changes: I,
    ) -> std::result::Result<(), PartialFailure>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        let inner = &self.inner;
        let mut failure = PartialFailure::default();
        let mut queued = 0usize;
        {
            let mut guard = inner.core.lock().await;
            let core = &mut *guard;
            let now = inner.clock.now();
            for (name, value) in changes {
                let name = name.as_ref();
                let Some(&key) = inner.keys.get(name) else {
                    let reason = ValidationError::UnknownParameter(name.to_string());
                    failure.rejected.push((name.to_string(), reason));
                    continue;
                };
                match core.queue_write(key, value.into(), now) {
                    Ok(true) => queued += 1,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(key = %key, error = %e, "write rejected");
                        failure.rejected.push((name.to_string(), e));
                    }
                }
            }
            failure.unresolved = core.writes.take_unresolved();
            inner.refresh(core);
        }
        if queued > 0 {
            debug!(count = queued, "writes queued");
            inner.write_wake.notify_one();
        }
        if failure.is_empty() {
            Ok(())
        } else {
            Err(failure)
        }
    }

    pub fn subscribe(
        &self,
        on_sensors: impl Fn(&SensorsChanged) + Send + Sync + 'static,
        on_status: impl Fn(&StatusChanged) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner
            .notifier
            .subscribe(Some(Box::new(on_sensors)), Some(Box::new(on_status)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }
}

/// What readers see. Rebuilt after every mutation of [`Core`].
#[derive(Debug, Clone, Default)]
struct View {
    sensors: BTreeMap<ParamKey, SensorValue>,
    availability: Availability,
    allowed: BTreeMap<ParamKey, AllowedValues>,
    pending: Vec<PendingWrite>,
}

/// Mutable engine state, only touched under the fetch/set lock.
struct Core {
    session: Session,
    scheduler: FetchScheduler,
    sanitizer: Sanitizer,
    writes: WriteCoordinator,
    availability: AvailabilityTracker,
    tracker: ChangeTracker,
    logger: Option<MessageLogger>,
    /// Last accepted server value per mirrored key.
    server: BTreeMap<ParamKey, Option<ParamValue>>,
    capabilities: BTreeMap<ParamKey, AllowedValues>,
    zones: BTreeMap<u8, ZoneState>,
    units: UnitSystem,
    fixed_units: bool,
    /// Set on a gateway mismatch: (expected, found).
    halted: Option<(String, String)>,
}

impl Core {
    fn view(&self) -> View {
        View {
            sensors: self.sensor_table(),
            availability: self.availability.snapshot(!self.writes.is_empty()),
            allowed: self.allowed_table(),
            pending: self.writes.snapshot(),
        }
    }

    /// Server values with pending writes laid over them.
    fn sensor_table(&self) -> BTreeMap<ParamKey, SensorValue> {
        self.server
            .iter()
            .map(|(key, value)| {
                let shown = match self.writes.get(key) {
                    Some(write) => Some(write.desired.clone()),
                    None => value.clone(),
                };
                (*key, SensorValue::new(shown, key.unit(self.units)))
            })
            .collect()
    }

    fn allowed_for(&self, key: &ParamKey) -> Option<AllowedValues> {
        match key.descriptor().kind {
            ParamKind::Bool => Some(AllowedValues::Bool),
            _ => self.capabilities.get(key).cloned(),
        }
    }

    fn allowed_table(&self) -> BTreeMap<ParamKey, AllowedValues> {
        self.server
            .keys()
            .filter(|k| k.descriptor().write != WriteRoute::ReadOnly)
            .filter_map(|k| self.allowed_for(k).map(|a| (*k, a)))
            .collect()
    }

    /// Returns whether a write was queued. A value the device already holds
    /// with nothing pending for the key is accepted without a write.
    fn queue_write(
        &mut self,
        key: ParamKey,
        value: ParamValue,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, ValidationError> {
        let value = validate(key, &value, self.allowed_for(&key).as_ref())?;

        let current = self.server.get(&key).and_then(Option::as_ref);
        if self.writes.get(&key).is_none() && current.is_some_and(|v| v.matches(&value)) {
            debug!(key = %key, value = %value, "device already holds value, nothing to write");
            return Ok(false);
        }

        let (write_group, target) =
            route_write(key, self.zones.get(&key.zone)).ok_or(ValidationError::ReadOnly(key))?;
        self.writes.insert(PendingWrite {
            key,
            desired: value,
            write_group,
            read_group: key.descriptor().read_group,
            target,
            retry_count: 0,
            first_requested_at: now,
            submitted_at: None,
        });
        Ok(true)
    }

    /// Wire entries for a batch. A value the endpoint cannot carry fails the
    /// whole batch.
    fn write_entries(
        &self,
        keys: &[ParamKey],
    ) -> std::result::Result<Vec<WriteEntry>, ValidationError> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(write) = self.writes.get(key) else {
                continue;
            };
            let kind = key.descriptor().kind;
            let menu = matches!(write.target, WriteTarget::Menu(_));
            let new = encode_wire(kind, &write.desired, menu).ok_or(ValidationError::WrongType {
                key: *key,
                expected: kind_label(kind),
            })?;
            let old = self
                .overwritten_value(*key, &write.target)
                .and_then(|v| encode_wire(kind, &v, menu))
                .unwrap_or(Value::Null);
            entries.push(WriteEntry {
                key: *key,
                target: write.target.clone(),
                old,
                new,
            });
        }
        Ok(entries)
    }

    /// Current value of whatever the write replaces on the device. For a set
    /// temperature aliased onto a schedule slot that is the slot's value.
    fn overwritten_value(&self, key: ParamKey, target: &WriteTarget) -> Option<ParamValue> {
        if let WriteTarget::Menu(id) = target
            && key.param == BaseParam::ChSetTemperature
        {
            let zone = self.zones.get(&key.zone);
            let slots = [
                (BaseParam::ChComfortTemperature, zone.and_then(|z| z.comfort)),
                (BaseParam::ChEconomyTemperature, zone.and_then(|z| z.economy)),
            ];
            for (param, snapshot) in slots {
                let slot = ParamKey::new(param, key.zone);
                if slot.menu_id().as_deref() == Some(id.as_str()) {
                    return self
                        .server
                        .get(&slot)
                        .cloned()
                        .flatten()
                        .or(snapshot.map(ParamValue::Number));
                }
            }
        }
        self.server.get(&key).cloned().flatten()
    }
}

fn kind_label(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::Temperature { .. } | ParamKind::Number => "number",
        ParamKind::Bool => "boolean",
        ParamKind::Options(_) => "option",
        ParamKind::Text | ParamKind::Structured => "text",
    }
}

struct Inner<T: Transport> {
    config: EngineConfig,
    transport: T,
    clock: Arc<dyn Clock>,
    keys: BTreeMap<String, ParamKey>,
    menu_keys: Vec<ParamKey>,
    menu_ids: Vec<String>,
    core: Mutex<Core>,
    view: RwLock<View>,
    notifier: Notifier,
    write_wake: Arc<Notify>,
    /// Dropped with the last engine handle, which ends both loops.
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    /// Bumped by every start so loops from an earlier run retire.
    generation: AtomicU64,
}

impl<T: Transport> Inner<T> {
    fn read_view(&self) -> std::sync::RwLockReadGuard<'_, View> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
            info!("engine stopped");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.started.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// `generation` is `Some` for loop-driven calls, which bail out once
    /// their run has been stopped.
    fn check_running(&self, core: &Core, generation: Option<u64>) -> Result<()> {
        if let Some((expected, found)) = &core.halted {
            return Err(Error::GatewayMismatch {
                expected: expected.clone(),
                found: found.clone(),
            });
        }
        match generation {
            Some(g) if !self.is_current(g) => Err(Error::Stopped),
            _ => Ok(()),
        }
    }

    fn halt(&self, core: &mut Core, expected: String, found: String) -> Error {
        error!(expected = %expected, found = %found, "gateway mismatch, halting engine");
        core.halted = Some((expected.clone(), found.clone()));
        self.stop();
        Error::GatewayMismatch { expected, found }
    }

    async fn tick(&self, generation: Option<u64>) -> Result<Duration> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        self.check_running(core, generation)?;

        let awaiting = core.writes.awaiting_reads();
        let group = core.scheduler.next_group(TickInput {
            available: core.availability.is_available(),
            error_counter: core.availability.error_counter(),
            awaiting_reads: &awaiting,
        });
        let fetched_at = self.clock.now();
        trace!(group = %group, "tick");

        match self.fetch(core, group).await {
            Err(Error::GatewayMismatch { expected, found }) => {
                return Err(self.halt(core, expected, found));
            }
            _ if generation.is_some_and(|g| !self.is_current(g)) => {
                debug!(group = %group, "engine stopped during fetch, discarding result");
                return Err(Error::Stopped);
            }
            Ok(payload) => self.apply_fetch(core, group, &payload, fetched_at),
            Err(e) if !e.is_retryable() => {
                error!(group = %group, error = %e, "fetch failed, not counted against the device");
            }
            Err(e) => {
                warn!(group = %group, error = %e, "fetch failed");
                self.count_failure(core);
            }
        }

        self.refresh(core);
        Ok(core.scheduler.delay(core.availability.error_counter()))
    }

    async fn login(&self, core: &mut Core) -> Result<String> {
        if !core.session.is_logged_in() {
            trace!("no session, logging in before request");
        }
        let plant = core
            .session
            .ensure_logged_in(&self.transport, core.logger.as_mut())
            .await?;
        core.availability.set_session(true, true);
        Ok(plant)
    }

    async fn fetch(&self, core: &mut Core, group: RequestGroup) -> Result<GroupPayload> {
        let plant = self.login(core).await?;
        let urls = fetch_urls(
            core.session.base_url(),
            group,
            &plant,
            self.config.zones,
            core.units,
            &self.menu_ids,
        );
        let mut bodies = Vec::with_capacity(urls.len());
        for (zone, url) in urls {
            let resp = self.transport.get(&url, fetch_timeout(group)).await?;
            let body = resp.json()?;
            if let Some(logger) = core.logger.as_mut() {
                logger.log_fetch(group, zone, resp.status, &body);
            }
            bodies.push((zone, body));
        }
        parse_group(group, bodies)
    }

    /// Replaces the group's keys in one step, then confirms writes.
    fn apply_fetch(
        &self,
        core: &mut Core,
        group: RequestGroup,
        payload: &GroupPayload,
        fetched_at: DateTime<Utc>,
    ) {
        let mut readings = payload.readings(&self.menu_keys);
        readings.retain(|k, _| core.server.contains_key(k));
        if group == RequestGroup::Units && core.fixed_units {
            readings.clear();
        }

        let server = &core.server;
        core.sanitizer
            .sanitize(&mut readings, |k| server.get(k).and_then(Option::as_ref));

        let confirmed = core.writes.confirm(group, &readings, fetched_at);
        for key in &confirmed {
            debug!(key = %key, "write confirmed");
        }

        if group == RequestGroup::Units
            && let Some(Some(ParamValue::Text(label))) =
                readings.get(&ParamKey::new(BaseParam::Units, 1))
        {
            core.units = if label == UnitSystem::Imperial.as_str() {
                UnitSystem::Imperial
            } else {
                UnitSystem::Metric
            };
            core.availability.set_units_known(true);
        }

        core.server.extend(readings);
        core.capabilities.extend(payload.capabilities(&self.menu_keys));

        if group == RequestGroup::Main {
            for (zone, state) in payload.zone_states() {
                core.availability
                    .set_zone_modes_known(zone, !state.mode_options.is_empty());
                core.zones.insert(zone, state);
            }
            let dhw = ParamKey::new(BaseParam::DhwSetTemperature, 1);
            core.availability
                .set_dhw_range_known(core.capabilities.contains_key(&dhw));
        }
        core.availability.record_fetch_success(group);
        trace!(group = %group, confirmed = confirmed.len(), "fetch applied");
    }

    fn count_failure(&self, core: &mut Core) {
        if core.availability.record_failure() {
            self.purge(core);
        }
    }

    /// Drops everything learned from the device and forces a fresh login.
    fn purge(&self, core: &mut Core) {
        if let Some(plant) = core.session.plant() {
            info!(plant = %plant, "purging device state");
        }
        core.session.logout(&self.transport);
        core.availability.purge();
        for (key, value) in core.server.iter_mut() {
            if !key.descriptor().persistent {
                *value = None;
            }
        }
        core.capabilities.clear();
        core.zones.clear();
        core.sanitizer.reset();
        core.scheduler.reset();
        if let Some(logger) = core.logger.as_mut() {
            logger.reset();
        }
        let dropped = core.writes.drain();
        if !dropped.is_empty() {
            warn!("{}", Error::ReconciliationExhausted(dropped));
        }
    }

    async fn reconcile(&self, generation: Option<u64>) -> Result<Option<Duration>> {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        self.check_running(core, generation)?;

        let debounce = self.config.set_debounce();
        let retry_wait = self.config.set_retry_wait();
        core.writes.expire_unconfirmed(self.clock.now(), retry_wait);

        let Some((group, keys)) = core.writes.next_batch() else {
            self.refresh(core);
            return Ok(core.writes.next_delay(false, debounce, retry_wait));
        };
        debug!(group = %group, keys = keys.len(), "submitting writes");
        let result = match core.write_entries(&keys) {
            Ok(entries) => self.submit(core, group, &entries).await,
            Err(e) => Err(Error::from(e)),
        };

        let failed = match result {
            Err(Error::GatewayMismatch { expected, found }) => {
                return Err(self.halt(core, expected, found));
            }
            _ if generation.is_some_and(|g| !self.is_current(g)) => {
                debug!(group = %group, "engine stopped during set, discarding result");
                return Err(Error::Stopped);
            }
            Ok(()) => {
                core.writes.mark_submitted(&keys, self.clock.now());
                core.availability.record_set_success(group);
                false
            }
            Err(e) if !e.is_retryable() => {
                error!(group = %group, error = %e, "set cannot succeed, dropping writes");
                core.writes.abandon(&keys);
                false
            }
            Err(e) => {
                warn!(group = %group, error = %e, "set failed");
                core.writes.record_failure(&keys);
                self.count_failure(core);
                true
            }
        };

        self.refresh(core);
        Ok(core.writes.next_delay(failed, debounce, retry_wait))
    }

    async fn submit(
        &self,
        core: &mut Core,
        group: RequestGroup,
        entries: &[WriteEntry],
    ) -> Result<()> {
        let plant = self.login(core).await?;
        let base = core.session.base_url().to_string();
        match group {
            RequestGroup::Main => {
                for (zone, body) in main_set_bodies(entries) {
                    let url = main_set_url(&base, &plant, zone, core.units);
                    self.post_set(core, group, &url, &body).await?;
                }
            }
            RequestGroup::OtherParams => {
                let url = menu_set_url(&base, &plant, core.units);
                self.post_set(core, group, &url, &menu_set_body(entries)).await?;
            }
            other => return Err(Error::Config(format!("{other} does not accept writes"))),
        }
        Ok(())
    }

    async fn post_set(
        &self,
        core: &mut Core,
        group: RequestGroup,
        url: &str,
        body: &Value,
    ) -> Result<()> {
        let result = self.transport.post(url, SET_TIMEOUT, body).await;
        if let Some(logger) = core.logger.as_mut() {
            logger.log_set(group, url, result.as_ref().ok().map(|r| r.status), body);
        }
        result?.json()?;
        Ok(())
    }

    /// Publishes a fresh view and notifies listeners of what changed.
    fn refresh(&self, core: &mut Core) {
        let view = core.view();
        if let Some(change) = core.tracker.sensors_changed(&view.sensors) {
            self.notifier.publish(Notification::Sensors(change));
        }
        if let Some(change) = core.tracker.status_changed(&view.availability) {
            self.notifier.publish(Notification::Status(change));
        }
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = view;
    }
}

/// Each loop holds only a weak reference between passes, so dropping the last
/// [`Engine`] handle ends it.
async fn fetch_loop<T: Transport>(
    inner: Weak<Inner<T>>,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let result = strong.tick(Some(generation)).await;
        drop(strong);
        let delay = match result {
            Ok(delay) => delay,
            Err(e) => {
                debug!(error = %e, "fetch loop exiting");
                return;
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn write_loop<T: Transport>(
    inner: Weak<Inner<T>>,
    wake: Arc<Notify>,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let debounce = strong.config.set_debounce();
    let retry_wait = strong.config.set_retry_wait();
    let mut delay = strong
        .core
        .lock()
        .await
        .writes
        .next_delay(false, debounce, retry_wait);
    drop(strong);

    loop {
        let woken = match delay {
            Some(d) => tokio::select! {
                _ = tokio::time::sleep(d) => false,
                _ = wake.notified() => true,
                _ = shutdown.changed() => return,
            },
            None => tokio::select! {
                _ = wake.notified() => true,
                _ = shutdown.changed() => return,
            },
        };
        if woken {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {}
                _ = shutdown.changed() => return,
            }
        }
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let result = strong.reconcile(Some(generation)).await;
        drop(strong);
        delay = match result {
            Ok(delay) => delay,
            Err(e) => {
                debug!(error = %e, "write loop exiting");
                return;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    const BASE: &str = "http://device";

    /// Login always lands on plant PL1; GETs and POSTs answer from a table
    /// keyed by path fragment. `broken` makes every exchange fail with an
    /// error no retry can fix.
    struct Scripted {
        gets: StdMutex<Vec<(&'static str, u16, Value)>>,
        post_status: StdMutex<u16>,
        broken: StdMutex<bool>,
        posts: StdMutex<Vec<(String, Value)>>,
        resets: StdMutex<u32>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                gets: StdMutex::new(Vec::new()),
                post_status: StdMutex::new(200),
                broken: StdMutex::new(false),
                posts: StdMutex::new(Vec::new()),
                resets: StdMutex::new(0),
            }
        }

        fn answer(&self, fragment: &'static str, status: u16, body: Value) {
            let mut gets = self.gets.lock().unwrap();
            gets.retain(|(f, _, _)| *f != fragment);
            gets.push((fragment, status, body));
        }

        fn set_posts(&self) -> Vec<(String, Value)> {
            self.posts
                .lock()
                .unwrap()
                .iter()
                .filter(|(url, _)| !url.contains("/Account/Login"))
                .cloned()
                .collect()
        }

        fn check(&self) -> Result<()> {
            if *self.broken.lock().unwrap() {
                return Err(Error::Io(std::io::Error::other("client identity missing")));
            }
            Ok(())
        }
    }

    impl Transport for Scripted {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse> {
            self.check()?;
            let gets = self.gets.lock().unwrap();
            let (status, body) = gets
                .iter()
                .find(|(f, _, _)| url.contains(f))
                .map(|(_, s, b)| (*s, b.to_string()))
                .unwrap_or((404, String::new()));
            Ok(HttpResponse {
                status,
                url: url.to_string(),
                body,
            })
        }

        async fn post(&self, url: &str, _timeout: Duration, body: &Value) -> Result<HttpResponse> {
            self.check()?;
            self.posts.lock().unwrap().push((url.to_string(), body.clone()));
            if url.contains("/Account/Login") {
                return Ok(HttpResponse {
                    status: 200,
                    url: format!("{BASE}/R2/Plant/Index/PL1"),
                    body: String::new(),
                });
            }
            Ok(HttpResponse {
                status: *self.post_status.lock().unwrap(),
                url: url.to_string(),
                body: "{}".to_string(),
            })
        }

        fn reset(&self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    fn main_body(desired: f64, zone_mode: i64) -> Value {
        json!({
            "mode": 1,
            "allowedModes": [0, 1, 5],
            "outsideTemp": 6.0,
            "dhwTemp": {"value": 50.0, "min": 40.0, "max": 60.0, "step": 1.0},
            "zone": {
                "num": 1,
                "mode": {"value": zone_mode, "allowedOptions": [0, 1, 2]},
                "desiredTemp": {"value": desired, "min": 10.0, "max": 30.0, "step": 0.5},
                "comfortTemp": {"value": 21.0, "min": 10.0, "max": 30.0, "step": 0.5},
                "economyTemp": {"value": 17.0, "min": 10.0, "max": 30.0, "step": 0.5},
                "roomTemp": 20.0
            }
        })
    }

    fn engine(transport: Scripted) -> Engine<Scripted> {
        let mut config = EngineConfig::new("user@example.com", "secret");
        config.base_url = BASE.to_string();
        Engine::builder(config, transport).build().unwrap()
    }

    #[tokio::test]
    async fn unknown_and_invalid_values_are_rejected() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);

        let err = engine
            .request_changes([("ch_set_temperature", ParamValue::from(22.0))])
            .await
            .unwrap_err();
        assert!(matches!(
            err.rejected[0].1,
            ValidationError::CapabilitiesUnknown(_)
        ));

        engine.poll_once().await.unwrap();
        let err = engine
            .request_changes([
                ("ch_set_temperature", ParamValue::from(45.0)),
                ("ch_set_temperature_zone_2", ParamValue::from(20.0)),
                ("outside_temperature", ParamValue::from(3.0)),
            ])
            .await
            .unwrap_err();
        let names: Vec<&str> = err.rejected.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["ch_set_temperature", "ch_set_temperature_zone_2", "outside_temperature"]
        );
        assert!(engine.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn matching_value_is_not_written() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);
        engine.poll_once().await.unwrap();

        engine
            .request_changes([("ch_set_temperature", 21.5)])
            .await
            .unwrap();
        assert!(engine.pending_writes().is_empty());
        assert_eq!(engine.reconcile_once().await.unwrap(), None);
        assert!(engine.inner.transport.set_posts().is_empty());
    }

    #[tokio::test]
    async fn program_mode_writes_active_slot() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(17.2, 2));
        let engine = engine(t);
        engine.poll_once().await.unwrap();

        engine
            .request_changes([("ch_set_temperature", 18.0)])
            .await
            .unwrap();
        engine.reconcile_once().await.unwrap();

        let posts = engine.inner.transport.set_posts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].0.contains("/R2/PlantMenu/Submit/PL1"));
        assert_eq!(posts[0].1[0]["id"], "U6_9_1");
        assert_eq!(posts[0].1[0]["newValue"], 18.0);
        // The economy slot's value, not the set temperature's.
        assert_eq!(posts[0].1[0]["oldValue"], 17.0);

        // Confirmation still comes from Main.
        assert_eq!(engine.pending_writes()[0].read_group, RequestGroup::Main);
    }

    #[tokio::test]
    async fn aliased_and_direct_slot_writes_send_one_entry() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.0, 2));
        let engine = engine(t);
        engine.poll_once().await.unwrap();

        engine
            .request_changes([
                ("ch_set_temperature", 21.5),
                ("ch_comfort_temperature", 22.5),
            ])
            .await
            .unwrap();
        let pending = engine.pending_writes();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, ParamKey::new(BaseParam::ChComfortTemperature, 1));

        engine.reconcile_once().await.unwrap();
        let posts = engine.inner.transport.set_posts();
        assert_eq!(posts.len(), 1);
        let entries = posts[0].1.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], "U6_9_0");
        assert_eq!(entries[0]["newValue"], 22.5);
        assert_eq!(entries[0]["oldValue"], 21.0);
    }

    #[tokio::test]
    async fn unfixable_set_error_drops_write_without_retry() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);
        engine.poll_once().await.unwrap();
        engine
            .request_changes([("ch_set_temperature", 23.0)])
            .await
            .unwrap();

        *engine.inner.transport.broken.lock().unwrap() = true;
        assert_eq!(engine.reconcile_once().await.unwrap(), None);
        assert!(engine.pending_writes().is_empty());
        assert_eq!(engine.inner.core.lock().await.availability.error_counter(), 0);
        assert!(engine.availability().available);

        let err = engine
            .request_changes(Vec::<(&str, f64)>::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.unresolved,
            vec![ParamKey::new(BaseParam::ChSetTemperature, 1)]
        );
    }

    #[tokio::test]
    async fn unfixable_fetch_error_is_not_counted() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);
        engine.poll_once().await.unwrap();

        *engine.inner.transport.broken.lock().unwrap() = true;
        for _ in 0..=crate::scheduler::ERROR_BACKOFF_THRESHOLD {
            assert_eq!(engine.poll_once().await.unwrap(), crate::config::BASE_TICK);
        }
        assert_eq!(engine.inner.core.lock().await.availability.error_counter(), 0);
        assert!(engine.availability().available);
    }

    #[tokio::test]
    async fn purge_drops_pending_writes_as_unresolved() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);
        engine.poll_once().await.unwrap();
        engine
            .request_changes([("ch_set_temperature", 23.0)])
            .await
            .unwrap();

        engine.inner.transport.answer("GetData", 500, json!({}));
        for _ in 0..=crate::availability::MAX_ERRORS {
            engine.poll_once().await.unwrap();
        }
        assert!(!engine.availability().available);
        assert!(engine.pending_writes().is_empty());
        assert_eq!(engine.sensor_value("ch_set_temperature").unwrap().value, None);
        assert_eq!(*engine.inner.transport.resets.lock().unwrap(), 1);

        let err = engine
            .request_changes(Vec::<(&str, f64)>::new())
            .await
            .unwrap_err();
        assert!(err.rejected.is_empty());
        assert_eq!(
            err.unresolved,
            vec![ParamKey::new(BaseParam::ChSetTemperature, 1)]
        );
    }

    #[tokio::test]
    async fn sanitizer_holds_detected_temperature() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);
        engine.poll_once().await.unwrap();

        let mut zeroed = main_body(21.5, 1);
        zeroed["zone"]["roomTemp"] = json!(0.0);
        engine.inner.transport.answer("GetData", 200, zeroed);
        engine.poll_once().await.unwrap();
        assert_eq!(
            engine.sensor_value("ch_detected_temperature").unwrap().value,
            Some(ParamValue::Number(20.0))
        );
    }

    #[tokio::test]
    async fn allowed_values_come_from_device() {
        let t = Scripted::new();
        t.answer("GetData", 200, main_body(21.5, 1));
        let engine = engine(t);
        assert!(!engine.allowed_set_values().contains_key("mode"));
        engine.poll_once().await.unwrap();

        let allowed = engine.allowed_set_values();
        assert_eq!(
            allowed["mode"],
            AllowedValues::Options(vec!["summer".into(), "winter".into(), "off".into()])
        );
        assert_eq!(
            allowed["dhw_set_temperature"],
            AllowedValues::Range {
                min: 40.0,
                max: 60.0,
                step: 1.0
            }
        );
        assert_eq!(allowed["ch_auto_function"], AllowedValues::Bool);
        assert!(!allowed.contains_key("outside_temperature"));
    }
}
