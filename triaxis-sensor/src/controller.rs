//! Sensor controller: device state machine and client-facing API
//!
//! Owns the device across its three data update modes:
//!
//! ```text
//!   Off ──connect──▶ Polling ──subscribe / set interval──▶ Eventing
//!    ▲                  │  ▲                                   │
//!    └──last disconnect─┘  └────unsubscribe + interval cleared─┘
//! ```
//!
//! The controller pulls everything together: the client registry decides
//! the target mode and settings, the bus programs the device, the cache
//! holds the latest measurement, and the throttle paces event emission.
//! All register sequences run under one device lock so multi-step
//! transitions are never interleaved.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use triaxis_bus::registers::{bits, rate_for_interval, reg, threshold_code};
use triaxis_bus::sample::SAMPLE_BLOCK_LEN;
use triaxis_bus::{BoxedBus, RawSample};

use crate::clients::{ClientId, ClientRegistry, FieldResultMap};
use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::properties::{uniform_axis_map, FieldId, PropertyCache, PropertyKey, PropertyValue};
use crate::store::{PropertyStore, UNIQUE_ID_KEY};
use crate::throttle::{ReportSink, ReportThrottle};
use crate::types::{DataMap, Mode, ResultMap, SensorEvent, SensorEventKind, SensorState};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Device-side state guarded by the device lock
///
/// The lock is held across complete register sequences, so a mode
/// transition or rate reprogram is never observed half-done.
struct DeviceState {
    mode: Mode,
    /// Currently enabled interrupt mask (mirror of INT_ENABLE).
    interrupts_enabled: u8,
}

struct ControllerShared {
    bus: BoxedBus,
    config: SensorConfig,
    registry: ClientRegistry,
    cache: PropertyCache,
    /// Fields rejected by the most recent poll, with the reason.
    rejected: Mutex<BTreeMap<FieldId, SensorError>>,
    throttle: ReportThrottle,
    device: tokio::sync::Mutex<DeviceState>,
    events: broadcast::Sender<SensorEvent>,
    sample_pending: AtomicBool,
    sample_wake: Notify,
    worker_stop: AtomicBool,
    started: AtomicBool,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReportSink for ControllerShared {
    fn report_due(&self) {
        // State transition events go out before the data they gate
        if self.cache.take_state_changed() {
            let _ = self
                .events
                .send(SensorEvent::StateChanged(self.cache.state()));
        }
        let _ = self.events.send(SensorEvent::Data(self.cache.all_fields()));
    }
}

impl ControllerShared {
    /// Read one sample block, validate per axis, and publish it to the
    /// cache. Axes outside the measurement range are dropped individually
    /// and recorded so field reads report them as per-field errors; the
    /// read only fails when no axis survives.
    async fn poll_for_data(&self) -> Result<(), SensorError> {
        let bytes = {
            let _dev = self.device.lock().await;
            self.bus
                .read_registers(reg::DATA_X0, SAMPLE_BLOCK_LEN)
                .await?
        };

        let sample = RawSample::parse(&bytes)?;
        let [x, y, z] = sample.to_g();

        let mut updates = DataMap::new();
        let mut dropped = BTreeMap::new();
        for (field, value) in [
            (FieldId::AccelerationX, x),
            (FieldId::AccelerationY, y),
            (FieldId::AccelerationZ, z),
        ] {
            if value < self.config.min_acceleration_g || value > self.config.max_acceleration_g {
                warn!("Dropping out-of-range reading on {field}: {value} g");
                dropped.insert(
                    field,
                    SensorError::InvalidArgument(format!(
                        "reading {value} g on {field} is outside the supported range"
                    )),
                );
                continue;
            }
            updates.insert(field, PropertyValue::Double(value));
        }

        // Remember what this poll rejected so field reads can report it
        {
            let mut rejected = self.rejected.lock();
            for field in updates.keys() {
                rejected.remove(field);
            }
            rejected.extend(dropped);
        }

        if updates.is_empty() {
            return Err(SensorError::InvalidArgument(
                "every axis of the sample was out of range".into(),
            ));
        }

        self.cache.apply_sample(updates);

        if self.registry.subscriber_count() > 0 {
            self.throttle.notify_new_data();
        }

        Ok(())
    }

    /// Reprogram rate and threshold from the arbitrated settings and move
    /// the device to the mode the client population implies.
    async fn apply_updated_settings(&self) -> Result<(), SensorError> {
        if !self.started.load(Ordering::SeqCst) {
            // Settings are folded in the registry; hardware catches up on start
            return Ok(());
        }

        let arbitrated = self.registry.arbitrated();
        let target_mode = self.registry.data_update_mode();

        let mut dev = self.device.lock().await;

        // Rate and threshold writes are bracketed by an interrupt disable
        // so a half-programmed device never raises an interrupt.
        let rate = rate_for_interval(arbitrated.report_interval_ms);
        let threshold_g = arbitrated
            .sensitivity
            .values()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let threshold = threshold_code(threshold_g, self.config.sensitivity_resolution_g);

        if dev.interrupts_enabled != 0 {
            self.bus.write_registers(reg::INT_ENABLE, &[0]).await?;
        }
        self.bus
            .write_registers(reg::BW_RATE, &[rate.code])
            .await?;
        self.bus
            .write_registers(reg::THRESH_ACT, &[threshold])
            .await?;
        if dev.interrupts_enabled != 0 {
            self.bus
                .write_registers(reg::INT_ENABLE, &[dev.interrupts_enabled])
                .await?;
        }

        self.throttle
            .set_report_interval(Duration::from_millis(u64::from(
                arbitrated.report_interval_ms,
            )));

        if dev.mode != target_mode {
            self.set_device_mode_locked(&mut dev, target_mode).await?;
        }

        Ok(())
    }

    /// Program the register sequence for a mode transition.
    ///
    /// `dev.mode` is only committed once every register write succeeded, so
    /// a failed transition leaves the recorded mode at the last state the
    /// device was fully moved into.
    async fn set_device_mode_locked(
        &self,
        dev: &mut DeviceState,
        target: Mode,
    ) -> Result<(), SensorError> {
        match target {
            Mode::Off => {
                self.bus.write_registers(reg::INT_ENABLE, &[0]).await?;
                // Read-to-clear so no stale interrupt survives the shutdown
                let _ = self.bus.read_registers(reg::INT_SOURCE, 1).await?;
                self.bus
                    .write_registers(reg::POWER_CTL, &[bits::POWER_CTL_STANDBY])
                    .await?;
                dev.interrupts_enabled = 0;
                self.cache.set_state(SensorState::NoData);
                self.rejected.lock().clear();
            }
            Mode::Polling => {
                self.bus.write_registers(reg::INT_ENABLE, &[0]).await?;
                self.bus
                    .write_registers(reg::POWER_CTL, &[bits::POWER_CTL_MEASURE])
                    .await?;
                dev.interrupts_enabled = 0;
            }
            Mode::Eventing => {
                self.bus
                    .write_registers(reg::POWER_CTL, &[bits::POWER_CTL_MEASURE])
                    .await?;
                self.bus
                    .write_registers(reg::INT_ENABLE, &[bits::INT_ACTIVITY])
                    .await?;
                dev.interrupts_enabled = bits::INT_ACTIVITY;
            }
        }

        info!("Data update mode: {:?} -> {:?}", dev.mode, target);
        dev.mode = target;
        Ok(())
    }
}

/// Worker translating hardware interrupt signals into data polls.
///
/// Runs off the signal path: [`SensorController::sample_ready`] only flips
/// a flag, this task does the bus I/O.
async fn sample_worker(shared: Arc<ControllerShared>) {
    loop {
        shared.sample_wake.notified().await;
        if shared.worker_stop.load(Ordering::SeqCst) {
            break;
        }
        if !shared.sample_pending.swap(false, Ordering::SeqCst) {
            continue;
        }

        // Identify the interrupt before acting on it
        let recognized = {
            let dev = shared.device.lock().await;
            match shared.bus.read_registers(reg::INT_SOURCE, 1).await {
                Ok(bytes) => {
                    let source = bytes.first().copied().unwrap_or(0);
                    source & dev.interrupts_enabled != 0
                }
                Err(err) => {
                    warn!("Failed to read interrupt source: {err}");
                    false
                }
            }
        };

        if !recognized {
            debug!("Ignoring interrupt with no recognized source");
            continue;
        }

        if let Err(err) = shared.poll_for_data().await {
            warn!("Data poll after interrupt failed: {err}");
        }
    }
}

/// The sensor controller - client arbitration, mode control and data flow
#[derive(Clone)]
pub struct SensorController {
    shared: Arc<ControllerShared>,
}

impl SensorController {
    /// Build a controller over the given bus.
    ///
    /// The persistent unique id is loaded from `store`, minting and
    /// persisting a fresh one on first use.
    pub fn new(bus: BoxedBus, config: SensorConfig, store: Arc<dyn PropertyStore>) -> Self {
        let cache = PropertyCache::new();
        seed_identity(&cache, &config, store.as_ref());

        let throttle = ReportThrottle::new(Duration::from_millis(u64::from(
            config.default_report_interval_ms,
        )));
        let registry = ClientRegistry::new(config.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(ControllerShared {
                bus,
                config,
                registry,
                cache,
                rejected: Mutex::new(BTreeMap::new()),
                throttle,
                device: tokio::sync::Mutex::new(DeviceState {
                    mode: Mode::Off,
                    interrupts_enabled: 0,
                }),
                events,
                sample_pending: AtomicBool::new(false),
                sample_wake: Notify::new(),
                worker_stop: AtomicBool::new(false),
                started: AtomicBool::new(false),
                worker: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Bring the device up: program the startup table, start the workers,
    /// and catch the hardware up with any clients that connected early.
    pub async fn start(&self) -> Result<(), SensorError> {
        if self.shared.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.shared
            .bus
            .configure_registers(&self.shared.config.startup_settings())
            .await?;

        self.shared.worker_stop.store(false, Ordering::SeqCst);
        let mut worker = self.shared.worker.lock().await;
        if worker.is_none() {
            *worker = Some(tokio::spawn(sample_worker(Arc::clone(&self.shared))));
        }
        drop(worker);

        let sink: Weak<ControllerShared> = Arc::downgrade(&self.shared);
        let sink: Weak<dyn ReportSink> = sink;
        self.shared.throttle.start(sink).await;

        self.shared.started.store(true, Ordering::SeqCst);
        info!("Sensor controller started");

        if self.shared.registry.client_count() > 0 {
            self.shared.apply_updated_settings().await?;
            self.shared.poll_for_data().await?;
        }

        Ok(())
    }

    /// Shut the device down. Idempotent; no events are emitted after this
    /// returns.
    pub async fn stop(&self) -> Result<(), SensorError> {
        if !self.shared.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.throttle.stop().await;

        self.shared.worker_stop.store(true, Ordering::SeqCst);
        self.shared.sample_wake.notify_one();
        if let Some(handle) = self.shared.worker.lock().await.take() {
            let _ = handle.await;
        }

        let mut dev = self.shared.device.lock().await;
        if dev.mode != Mode::Off {
            self.shared
                .set_device_mode_locked(&mut dev, Mode::Off)
                .await?;
        }

        info!("Sensor controller stopped");
        Ok(())
    }

    /// Register a new client and bring the hardware in line with the new
    /// population. The first client moves the device out of `Off` and
    /// primes the cache with an initial measurement.
    pub async fn connect(&self, id: ClientId) -> Result<(), SensorError> {
        self.shared.registry.connect(id)?;
        self.shared.apply_updated_settings().await?;

        if self.shared.started.load(Ordering::SeqCst) && self.shared.registry.client_count() == 1 {
            self.shared.poll_for_data().await?;
        }
        Ok(())
    }

    /// Remove a client. The last client's departure turns the device off
    /// and resets the readiness state.
    pub async fn disconnect(&self, id: ClientId) -> Result<(), SensorError> {
        self.shared.registry.disconnect(id)?;
        self.shared.apply_updated_settings().await
    }

    /// Subscribe a client to event notifications.
    pub async fn subscribe(&self, id: ClientId) -> Result<(), SensorError> {
        self.shared.registry.subscribe(id)?;
        self.shared.apply_updated_settings().await
    }

    /// Drop a client's event subscription.
    pub async fn unsubscribe(&self, id: ClientId) -> Result<(), SensorError> {
        self.shared.registry.unsubscribe(id)?;
        self.shared.apply_updated_settings().await
    }

    /// Read a batch of properties. Every requested key gets an entry.
    pub fn get_properties(&self, keys: &[PropertyKey]) -> ResultMap<PropertyKey> {
        let arbitrated = self.shared.registry.arbitrated();
        let mut results = ResultMap::default();

        for key in keys {
            let value = match key {
                PropertyKey::CurrentReportInterval => {
                    PropertyValue::Unsigned(u64::from(arbitrated.report_interval_ms))
                }
                PropertyKey::ChangeSensitivity => {
                    let map = arbitrated
                        .sensitivity
                        .iter()
                        .map(|(f, g)| (*f, PropertyValue::Double(*g)))
                        .collect();
                    PropertyValue::FieldMap(map)
                }
                _ => self.shared.cache.property(*key),
            };
            results.insert_ok(*key, value);
        }

        results
    }

    /// Apply a batch of property writes on behalf of one client.
    ///
    /// Each key is attempted independently; read-only keys fail with
    /// `NotSupported` without blocking the rest. Valid settings reach the
    /// hardware even when other entries in the batch fail.
    pub async fn set_properties(
        &self,
        id: ClientId,
        entries: &BTreeMap<PropertyKey, PropertyValue>,
    ) -> Result<ResultMap<PropertyKey>, SensorError> {
        let mut results = ResultMap::default();

        for (key, value) in entries {
            if !key.is_settable() {
                results.insert_err(
                    *key,
                    SensorError::NotSupported(format!("{key:?} is read-only")),
                );
                continue;
            }

            match key {
                PropertyKey::CurrentReportInterval => {
                    let outcome = match value.as_unsigned() {
                        Some(ms) if ms <= u64::from(u32::MAX) => self
                            .shared
                            .registry
                            .set_desired_report_interval(id, ms as u32)
                            .map(|_| value.clone()),
                        _ => Err(SensorError::InvalidArgument(
                            "report interval must be an unsigned millisecond count".into(),
                        )),
                    };
                    match outcome {
                        Ok(v) => results.insert_ok(*key, v),
                        Err(e) => results.insert_err(*key, e),
                    }
                }
                PropertyKey::ChangeSensitivity => match sensitivity_request(value) {
                    Ok(wanted) => {
                        let field_results =
                            self.shared.registry.set_desired_sensitivity(id, &wanted)?;
                        if field_results.any_failed() {
                            results.insert_err(*key, SensorError::PartialFailure);
                        } else {
                            results.insert_ok(*key, value.clone());
                        }
                    }
                    Err(e) => results.insert_err(*key, e),
                },
                // is_settable admits no other keys
                _ => {}
            }
        }

        // Whatever subset applied becomes effective immediately
        self.shared.apply_updated_settings().await?;
        Ok(results)
    }

    /// Update one client's per-field change sensitivities directly, with
    /// per-field outcomes.
    pub async fn set_change_sensitivity(
        &self,
        id: ClientId,
        desired: &BTreeMap<FieldId, Option<f64>>,
    ) -> Result<FieldResultMap, SensorError> {
        let results = self.shared.registry.set_desired_sensitivity(id, desired)?;
        self.shared.apply_updated_settings().await?;
        Ok(results)
    }

    /// Read a batch of data fields from the cache.
    ///
    /// In polling mode, or while no valid measurement is cached yet, the
    /// device is polled first so the caller never sees stale or empty
    /// fields when fresh ones are obtainable.
    pub async fn get_data_fields(
        &self,
        fields: &[FieldId],
    ) -> Result<ResultMap<FieldId>, SensorError> {
        if !self.shared.started.load(Ordering::SeqCst) {
            return Err(SensorError::InvalidState(
                "the sensor has not been started".into(),
            ));
        }

        let mode = self.shared.device.lock().await.mode;
        if mode == Mode::Off {
            return Err(SensorError::InvalidState(
                "no client is connected".into(),
            ));
        }

        if mode == Mode::Polling || self.shared.cache.state() != SensorState::Ready {
            self.shared.poll_for_data().await?;
        }

        let rejected = self.shared.rejected.lock().clone();
        let mut results = ResultMap::default();
        for field in fields {
            match rejected.get(field) {
                Some(err) => results.insert_err(*field, err.clone()),
                None => results.insert_ok(*field, self.shared.cache.field(*field)),
            }
        }
        Ok(results)
    }

    /// Signal that the hardware raised its data interrupt.
    ///
    /// Non-blocking and safe to call from any context; the actual register
    /// I/O happens on the controller's worker task.
    pub fn sample_ready(&self) {
        self.shared.sample_pending.store(true, Ordering::SeqCst);
        self.shared.sample_wake.notify_one();
    }

    /// Subscribe to the sensor's event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SensorEvent> {
        self.events_sender().subscribe()
    }

    fn events_sender(&self) -> &broadcast::Sender<SensorEvent> {
        &self.shared.events
    }

    /// Current data update mode as recorded on the device side.
    pub async fn mode(&self) -> Mode {
        self.shared.device.lock().await.mode
    }

    /// Current readiness state.
    pub fn state(&self) -> SensorState {
        self.shared.cache.state()
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.client_count()
    }

    /// Every property key this sensor supports.
    pub fn supported_properties(&self) -> &'static [PropertyKey] {
        PropertyKey::ALL
    }

    /// Every data field this sensor supports.
    pub fn supported_data_fields(&self) -> &'static [FieldId] {
        FieldId::ALL
    }

    /// Every event kind this sensor can raise.
    pub fn supported_events(&self) -> &'static [SensorEventKind] {
        &[SensorEventKind::DataUpdated, SensorEventKind::StateChanged]
    }
}

/// Convert a `ChangeSensitivity` property value into a per-field request.
fn sensitivity_request(
    value: &PropertyValue,
) -> Result<BTreeMap<FieldId, Option<f64>>, SensorError> {
    let PropertyValue::FieldMap(map) = value else {
        return Err(SensorError::InvalidArgument(
            "change sensitivity must be a per-field map".into(),
        ));
    };

    let mut wanted = BTreeMap::new();
    for (field, entry) in map {
        let desired = match entry {
            PropertyValue::Double(g) => Some(*g),
            PropertyValue::Empty => None,
            _ => {
                return Err(SensorError::InvalidArgument(format!(
                    "change sensitivity for {field} must be a double"
                )))
            }
        };
        wanted.insert(*field, desired);
    }
    Ok(wanted)
}

/// Seed the cache with identity and capability properties.
fn seed_identity(cache: &PropertyCache, config: &SensorConfig, store: &dyn PropertyStore) {
    cache.set_property(
        PropertyKey::ObjectId,
        PropertyValue::Text("triaxis-accelerometer".into()),
    );
    cache.set_property(PropertyKey::Category, PropertyValue::Text("motion".into()));
    cache.set_property(
        PropertyKey::Type,
        PropertyValue::Text("accelerometer-3d".into()),
    );
    cache.set_property(
        PropertyKey::PersistentUniqueId,
        PropertyValue::Guid(persistent_unique_id(store)),
    );
    cache.set_property(
        PropertyKey::Manufacturer,
        PropertyValue::Text(config.manufacturer.clone()),
    );
    cache.set_property(PropertyKey::Model, PropertyValue::Text(config.model.clone()));
    cache.set_property(
        PropertyKey::SerialNumber,
        PropertyValue::Text(config.serial_number.clone()),
    );
    cache.set_property(
        PropertyKey::FriendlyName,
        PropertyValue::Text(config.friendly_name.clone()),
    );
    cache.set_property(
        PropertyKey::Description,
        PropertyValue::Text(config.description.clone()),
    );
    cache.set_property(
        PropertyKey::ConnectionType,
        PropertyValue::Unsigned(config.connection_type),
    );
    cache.set_property(
        PropertyKey::MinReportInterval,
        PropertyValue::Unsigned(u64::from(config.min_report_interval_ms)),
    );
    cache.set_property(
        PropertyKey::RangeMinimum,
        uniform_axis_map(config.min_acceleration_g),
    );
    cache.set_property(
        PropertyKey::RangeMaximum,
        uniform_axis_map(config.max_acceleration_g),
    );
    cache.set_property(PropertyKey::Resolution, uniform_axis_map(config.resolution_g));
}

/// Load the persistent unique id, minting one on first use.
fn persistent_unique_id(store: &dyn PropertyStore) -> Uuid {
    if let Some(stored) = store.get(UNIQUE_ID_KEY) {
        if let Ok(id) = Uuid::parse_str(&stored) {
            return id;
        }
        warn!("Stored unique id is not a valid UUID, minting a new one");
    }

    let id = Uuid::new_v4();
    store.set(UNIQUE_ID_KEY, &id.to_string());
    info!("Minted persistent unique id {id}");
    id
}
