//! Static sensor configuration
//!
//! All values are fixed at construction; nothing here changes at runtime.
//! The controller reads defaults and identity strings from this struct and
//! seeds the property cache with them.

use std::collections::BTreeMap;

use triaxis_bus::registers::{rate_for_interval, startup_settings, threshold_code, RegisterSetting};
use triaxis_bus::SCALE_G_PER_LSB;

use crate::properties::FieldId;

/// Default report interval when no client has set one, in milliseconds.
pub const DEFAULT_REPORT_INTERVAL_MS: u32 = 100;

/// Fastest report interval a client may request, in milliseconds.
pub const MIN_REPORT_INTERVAL_MS: u32 = 10;

/// Default per-axis change sensitivity, in g.
pub const DEFAULT_CHANGE_SENSITIVITY_G: f64 = 0.0625;

/// Granularity of the hardware activity threshold, in g.
pub const SENSITIVITY_RESOLUTION_G: f64 = 0.0625;

/// Measurement range, in g.
pub const MIN_ACCELERATION_G: f64 = -16.0;
pub const MAX_ACCELERATION_G: f64 = 16.0;

/// Immutable configuration of one sensor instance
#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub default_report_interval_ms: u32,
    pub min_report_interval_ms: u32,
    pub default_change_sensitivity_g: f64,
    pub sensitivity_resolution_g: f64,
    pub min_acceleration_g: f64,
    pub max_acceleration_g: f64,
    /// Measurement resolution per axis, in g.
    pub resolution_g: f64,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub friendly_name: String,
    pub description: String,
    /// 0 = integrated, 1 = attached, 2 = external.
    pub connection_type: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            default_report_interval_ms: DEFAULT_REPORT_INTERVAL_MS,
            min_report_interval_ms: MIN_REPORT_INTERVAL_MS,
            default_change_sensitivity_g: DEFAULT_CHANGE_SENSITIVITY_G,
            sensitivity_resolution_g: SENSITIVITY_RESOLUTION_G,
            min_acceleration_g: MIN_ACCELERATION_G,
            max_acceleration_g: MAX_ACCELERATION_G,
            resolution_g: SCALE_G_PER_LSB,
            manufacturer: "Analog Devices".into(),
            model: "ADXL345".into(),
            serial_number: "0000-0001".into(),
            friendly_name: "3-Axis Accelerometer".into(),
            description: "SPI/I2C 3-axis digital accelerometer".into(),
            connection_type: 0,
        }
    }
}

impl SensorConfig {
    /// Initial register table for device bring-up, derived from the
    /// configured defaults.
    pub fn startup_settings(&self) -> Vec<RegisterSetting> {
        let rate = rate_for_interval(self.default_report_interval_ms);
        let threshold = threshold_code(
            self.default_change_sensitivity_g,
            self.sensitivity_resolution_g,
        );
        startup_settings(rate.code, threshold)
    }

    /// Default change sensitivity for every sensitivity-bearing field.
    pub fn default_sensitivities(&self) -> BTreeMap<FieldId, f64> {
        FieldId::AXES
            .iter()
            .map(|f| (*f, self.default_change_sensitivity_g))
            .collect()
    }
}
