//! Shared core types: modes, states, result maps

use std::collections::BTreeMap;

use crate::error::SensorError;
use crate::properties::{FieldId, PropertyValue};

/// Data update mode of the sensor
///
/// `Off` iff no clients are connected. `Eventing` iff at least one client
/// subscribed to notifications or explicitly set a report interval.
/// `Polling` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    Polling,
    Eventing,
}

/// Readiness state surfaced through the state property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SensorState {
    /// No valid measurement cached yet
    NoData = 0,
    /// At least one valid measurement cached
    Ready = 1,
}

impl SensorState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SensorState::NoData),
            1 => Some(SensorState::Ready),
            _ => None,
        }
    }
}

/// Kinds of events the sensor can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEventKind {
    DataUpdated,
    StateChanged,
}

/// One data snapshot: field id → value
pub type DataMap = BTreeMap<FieldId, PropertyValue>;

/// Event published to subscribers
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// New throttled data report with all cached fields
    Data(DataMap),
    /// Readiness state transition (emitted once per transition)
    StateChanged(SensorState),
}

/// Per-key results of a batch operation.
///
/// Batch operations attempt every item; failing one key never discards the
/// others. [`ResultMap::status`] collapses the map to the overall verdict.
#[derive(Debug, Clone)]
pub struct ResultMap<K: Ord> {
    pub entries: BTreeMap<K, Result<PropertyValue, SensorError>>,
}

impl<K: Ord> Default for ResultMap<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord> ResultMap<K> {
    pub fn insert_ok(&mut self, key: K, value: PropertyValue) {
        self.entries.insert(key, Ok(value));
    }

    pub fn insert_err(&mut self, key: K, err: SensorError) {
        self.entries.insert(key, Err(err));
    }

    pub fn any_failed(&self) -> bool {
        self.entries.values().any(|r| r.is_err())
    }

    /// Overall verdict: `Ok` if every item succeeded, `PartialFailure`
    /// if at least one item failed.
    pub fn status(&self) -> Result<(), SensorError> {
        if self.any_failed() {
            Err(SensorError::PartialFailure)
        } else {
            Ok(())
        }
    }

    pub fn get(&self, key: &K) -> Option<&Result<PropertyValue, SensorError>> {
        self.entries.get(key)
    }
}
