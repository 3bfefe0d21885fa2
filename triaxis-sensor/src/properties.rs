//! Property and data field model, plus the shared cache
//!
//! A closed set of typed keys, a value enum, and one mutex-guarded cache
//! holding the current value of every supported property and data field.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::types::{DataMap, SensorState};

/// Supported sensor property keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropertyKey {
    ObjectId,
    Category,
    Type,
    PersistentUniqueId,
    Manufacturer,
    Model,
    SerialNumber,
    FriendlyName,
    Description,
    ConnectionType,
    State,
    MinReportInterval,
    /// Per-field minimum of the measurement range
    RangeMinimum,
    /// Per-field maximum of the measurement range
    RangeMaximum,
    /// Per-field measurement resolution
    Resolution,
    /// Settable: arbitrated across clients
    CurrentReportInterval,
    /// Settable: arbitrated across clients, per data field
    ChangeSensitivity,
}

impl PropertyKey {
    /// Every supported property key.
    pub const ALL: &'static [PropertyKey] = &[
        PropertyKey::ObjectId,
        PropertyKey::Category,
        PropertyKey::Type,
        PropertyKey::PersistentUniqueId,
        PropertyKey::Manufacturer,
        PropertyKey::Model,
        PropertyKey::SerialNumber,
        PropertyKey::FriendlyName,
        PropertyKey::Description,
        PropertyKey::ConnectionType,
        PropertyKey::State,
        PropertyKey::MinReportInterval,
        PropertyKey::RangeMinimum,
        PropertyKey::RangeMaximum,
        PropertyKey::Resolution,
        PropertyKey::CurrentReportInterval,
        PropertyKey::ChangeSensitivity,
    ];

    /// True for the keys clients may set per-connection.
    pub fn is_settable(self) -> bool {
        matches!(
            self,
            PropertyKey::CurrentReportInterval | PropertyKey::ChangeSensitivity
        )
    }
}

/// Supported data fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldId {
    Timestamp,
    AccelerationX,
    AccelerationY,
    AccelerationZ,
}

impl FieldId {
    /// Every supported data field.
    pub const ALL: &'static [FieldId] = &[
        FieldId::Timestamp,
        FieldId::AccelerationX,
        FieldId::AccelerationY,
        FieldId::AccelerationZ,
    ];

    /// The measurement axes (everything except the timestamp).
    pub const AXES: &'static [FieldId] = &[
        FieldId::AccelerationX,
        FieldId::AccelerationY,
        FieldId::AccelerationZ,
    ];

    /// True for fields that carry a change-sensitivity setting.
    pub fn is_sensitivity_bearing(self) -> bool {
        matches!(
            self,
            FieldId::AccelerationX | FieldId::AccelerationY | FieldId::AccelerationZ
        )
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldId::Timestamp => "timestamp",
            FieldId::AccelerationX => "acceleration-x",
            FieldId::AccelerationY => "acceleration-y",
            FieldId::AccelerationZ => "acceleration-z",
        };
        f.write_str(name)
    }
}

/// Typed property / data field value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Key is supported but has no value yet
    Empty,
    Unsigned(u64),
    Double(f64),
    Text(String),
    Guid(Uuid),
    /// Nested per-data-field values (ranges, resolutions, sensitivities)
    FieldMap(BTreeMap<FieldId, PropertyValue>),
}

impl PropertyValue {
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            PropertyValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            PropertyValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

/// Build a per-axis `FieldMap` with the same double value on every axis.
pub fn uniform_axis_map(value: f64) -> PropertyValue {
    let map = FieldId::AXES
        .iter()
        .map(|f| (*f, PropertyValue::Double(value)))
        .collect();
    PropertyValue::FieldMap(map)
}

struct CacheInner {
    properties: BTreeMap<PropertyKey, PropertyValue>,
    fields: BTreeMap<FieldId, PropertyValue>,
    state_changed: bool,
}

/// Thread-safe cache of property and data field values
///
/// Every supported key has an entry from construction on, `Empty` until
/// populated. Sample merges happen as one batch under a single lock
/// acquisition.
pub struct PropertyCache {
    inner: Mutex<CacheInner>,
}

impl Default for PropertyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyCache {
    pub fn new() -> Self {
        let properties = PropertyKey::ALL
            .iter()
            .map(|k| {
                let initial = match k {
                    PropertyKey::State => PropertyValue::Unsigned(SensorState::NoData as u64),
                    _ => PropertyValue::Empty,
                };
                (*k, initial)
            })
            .collect();

        let fields = FieldId::ALL
            .iter()
            .map(|f| (*f, PropertyValue::Empty))
            .collect();

        Self {
            inner: Mutex::new(CacheInner {
                properties,
                fields,
                state_changed: false,
            }),
        }
    }

    pub fn property(&self, key: PropertyKey) -> PropertyValue {
        self.inner
            .lock()
            .properties
            .get(&key)
            .cloned()
            .unwrap_or(PropertyValue::Empty)
    }

    pub fn set_property(&self, key: PropertyKey, value: PropertyValue) {
        self.inner.lock().properties.insert(key, value);
    }

    pub fn field(&self, id: FieldId) -> PropertyValue {
        self.inner
            .lock()
            .fields
            .get(&id)
            .cloned()
            .unwrap_or(PropertyValue::Empty)
    }

    /// Snapshot of every data field.
    pub fn all_fields(&self) -> DataMap {
        self.inner.lock().fields.clone()
    }

    /// Merge one read's worth of field values plus a fresh timestamp, as a
    /// single atomic batch, and mark the sensor ready.
    ///
    /// Returns true if the readiness state actually changed.
    pub fn apply_sample(&self, updates: DataMap) -> bool {
        let timestamp = unix_millis();
        let mut inner = self.inner.lock();

        for (field, value) in updates {
            inner.fields.insert(field, value);
        }
        inner
            .fields
            .insert(FieldId::Timestamp, PropertyValue::Unsigned(timestamp));

        set_state_locked(&mut inner, SensorState::Ready)
    }

    /// Current readiness state.
    pub fn state(&self) -> SensorState {
        let inner = self.inner.lock();
        state_locked(&inner)
    }

    /// Update the readiness state; marks the dirty flag when it changes.
    ///
    /// Returns true if the state actually changed.
    pub fn set_state(&self, new_state: SensorState) -> bool {
        let mut inner = self.inner.lock();
        set_state_locked(&mut inner, new_state)
    }

    /// Consume the state-changed dirty flag.
    ///
    /// Each state transition produces exactly one `true` here, however
    /// many times it is polled afterwards.
    pub fn take_state_changed(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.state_changed)
    }
}

fn state_locked(inner: &CacheInner) -> SensorState {
    inner
        .properties
        .get(&PropertyKey::State)
        .and_then(|v| v.as_unsigned())
        .and_then(|v| SensorState::from_u32(v as u32))
        .unwrap_or(SensorState::NoData)
}

fn set_state_locked(inner: &mut CacheInner, new_state: SensorState) -> bool {
    let current = state_locked(inner);
    if current == new_state {
        return false;
    }

    debug!("Sensor state changed: {:?} -> {:?}", current, new_state);
    inner
        .properties
        .insert(PropertyKey::State, PropertyValue::Unsigned(new_state as u64));
    inner.state_changed = true;
    true
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
