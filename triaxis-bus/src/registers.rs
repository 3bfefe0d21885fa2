//! Device register map and configuration tables
//!
//! Register layout of the ADXL345-class 3-axis accelerometer the core
//! drives. Only the registers the core touches are listed; the rest of the
//! register file exists but is never addressed.

/// Register addresses
pub mod reg {
    /// Device ID register (reads back [`super::DEVICE_ID`])
    pub const DEVID: u8 = 0x00;
    /// Activity detection threshold
    pub const THRESH_ACT: u8 = 0x24;
    /// Activity/inactivity detection control
    pub const ACT_INACT_CTL: u8 = 0x27;
    /// Output data rate
    pub const BW_RATE: u8 = 0x2C;
    /// Power / measurement mode control
    pub const POWER_CTL: u8 = 0x2D;
    /// Interrupt enable mask
    pub const INT_ENABLE: u8 = 0x2E;
    /// Interrupt pin mapping
    pub const INT_MAP: u8 = 0x2F;
    /// Interrupt source (read clears pending interrupts)
    pub const INT_SOURCE: u8 = 0x30;
    /// Data format (range, resolution, justification)
    pub const DATA_FORMAT: u8 = 0x31;
    /// First data register; x/y/z low/high bytes follow sequentially
    pub const DATA_X0: u8 = 0x32;
    /// FIFO mode control
    pub const FIFO_CTL: u8 = 0x38;
}

/// Register bit values
pub mod bits {
    /// POWER_CTL: standby (no measurement)
    pub const POWER_CTL_STANDBY: u8 = 0x00;
    /// POWER_CTL: measurement mode
    pub const POWER_CTL_MEASURE: u8 = 0x08;
    /// INT_ENABLE / INT_SOURCE / INT_MAP: activity detected
    pub const INT_ACTIVITY: u8 = 0x10;
    /// DATA_FORMAT: full 13-bit resolution
    pub const DATA_FORMAT_FULL_RES: u8 = 0x08;
    /// DATA_FORMAT: ±16 g range
    pub const DATA_FORMAT_RANGE_16G: u8 = 0x03;
    /// ACT_INACT_CTL: AC-coupled activity detection
    pub const ACT_INACT_CTL_ACT_ACDC: u8 = 0x80;
    /// ACT_INACT_CTL: activity detection on X
    pub const ACT_INACT_CTL_ACT_X: u8 = 0x40;
    /// ACT_INACT_CTL: activity detection on Y
    pub const ACT_INACT_CTL_ACT_Y: u8 = 0x20;
    /// ACT_INACT_CTL: activity detection on Z
    pub const ACT_INACT_CTL_ACT_Z: u8 = 0x10;
    /// FIFO_CTL: bypass (no FIFO buffering)
    pub const FIFO_CTL_MODE_BYPASS: u8 = 0x00;
}

/// Expected DEVID read-back value
pub const DEVICE_ID: u8 = 0xE5;

/// Size of the addressable register file
pub const REGISTER_FILE_LEN: usize = 0x40;

/// A single register/value pair in a configuration table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSetting {
    pub register: u8,
    pub value: u8,
}

impl RegisterSetting {
    pub const fn new(register: u8, value: u8) -> Self {
        Self { register, value }
    }
}

/// One entry of the supported output data rate table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRate {
    /// BW_RATE register code
    pub code: u8,
    /// Sampling interval at this rate, in milliseconds
    pub interval_ms: u32,
}

/// Supported output data rates, fastest first.
///
/// The device only supports this discrete set; requested report intervals
/// are mapped onto it with [`rate_for_interval`].
pub const DATA_RATES: &[DataRate] = &[
    DataRate { code: 0x0A, interval_ms: 10 },    // 100 Hz
    DataRate { code: 0x09, interval_ms: 20 },    // 50 Hz
    DataRate { code: 0x08, interval_ms: 40 },    // 25 Hz
    DataRate { code: 0x07, interval_ms: 80 },    // 12.5 Hz
    DataRate { code: 0x06, interval_ms: 160 },   // 6.25 Hz
    DataRate { code: 0x05, interval_ms: 320 },   // 3.13 Hz
    DataRate { code: 0x04, interval_ms: 640 },   // 1.56 Hz
    DataRate { code: 0x03, interval_ms: 1280 },  // 0.78 Hz
    DataRate { code: 0x02, interval_ms: 2560 },  // 0.39 Hz
    DataRate { code: 0x01, interval_ms: 5120 },  // 0.20 Hz
    DataRate { code: 0x00, interval_ms: 10240 }, // 0.10 Hz
];

/// Pick the data rate for a requested report interval.
///
/// Returns the slowest supported rate whose interval does not exceed the
/// request, so the device samples at least as often as asked. Requests
/// faster than the fastest supported rate clamp to the fastest.
pub fn rate_for_interval(interval_ms: u32) -> DataRate {
    let mut best = DATA_RATES[0];

    for rate in DATA_RATES {
        if rate.interval_ms <= interval_ms {
            best = *rate;
        } else {
            break;
        }
    }

    best
}

/// Quantize a change sensitivity (in g) to a THRESH_ACT register code.
///
/// The threshold register only supports increments of `resolution_g`, so
/// the value rounds down to the next representable step, toward more
/// sensitive rather than less.
pub fn threshold_code(sensitivity_g: f64, resolution_g: f64) -> u8 {
    let steps = sensitivity_g / resolution_g;
    if steps <= 0.0 {
        0
    } else if steps >= u8::MAX as f64 {
        u8::MAX
    } else {
        steps as u8
    }
}

/// Build the initial device configuration table.
///
/// Leaves the device in standby with full-resolution ±16 g format, no
/// FIFO, the given data rate and activity threshold, AC-coupled activity
/// detection on all three axes, and the activity interrupt mapped to pin 1.
pub fn startup_settings(rate_code: u8, threshold: u8) -> Vec<RegisterSetting> {
    vec![
        RegisterSetting::new(reg::POWER_CTL, bits::POWER_CTL_STANDBY),
        RegisterSetting::new(
            reg::DATA_FORMAT,
            bits::DATA_FORMAT_FULL_RES | bits::DATA_FORMAT_RANGE_16G,
        ),
        RegisterSetting::new(reg::FIFO_CTL, bits::FIFO_CTL_MODE_BYPASS),
        RegisterSetting::new(reg::BW_RATE, rate_code),
        RegisterSetting::new(reg::THRESH_ACT, threshold),
        RegisterSetting::new(
            reg::ACT_INACT_CTL,
            bits::ACT_INACT_CTL_ACT_ACDC
                | bits::ACT_INACT_CTL_ACT_X
                | bits::ACT_INACT_CTL_ACT_Y
                | bits::ACT_INACT_CTL_ACT_Z,
        ),
        RegisterSetting::new(reg::INT_MAP, bits::INT_ACTIVITY),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_floor_selection() {
        // Exact match
        assert_eq!(rate_for_interval(10).code, 0x0A);
        assert_eq!(rate_for_interval(160).code, 0x06);
        // Between table entries: round down to the faster rate
        assert_eq!(rate_for_interval(100).interval_ms, 80);
        assert_eq!(rate_for_interval(5000).interval_ms, 2560);
        // Faster than the hardware supports: clamp to fastest
        assert_eq!(rate_for_interval(1).code, 0x0A);
        // Slower than the slowest entry
        assert_eq!(rate_for_interval(60_000).interval_ms, 10240);
    }

    #[test]
    fn test_rate_never_exceeds_request_above_minimum() {
        for req in (10..=11_000).step_by(7) {
            let rate = rate_for_interval(req);
            assert!(
                rate.interval_ms <= req,
                "interval {} for request {} exceeds it",
                rate.interval_ms,
                req
            );
        }
    }

    #[test]
    fn test_threshold_rounds_down() {
        let res = 0.0625;
        assert_eq!(threshold_code(0.0625, res), 1);
        assert_eq!(threshold_code(0.5, res), 8);
        // Rounds toward more sensitive
        assert_eq!(threshold_code(0.07, res), 1);
        assert_eq!(threshold_code(0.05, res), 0);
        assert_eq!(threshold_code(0.0, res), 0);
        assert_eq!(threshold_code(1000.0, res), u8::MAX);
    }

    #[test]
    fn test_startup_table_shape() {
        let settings = startup_settings(0x07, 1);
        assert_eq!(settings[0].register, reg::POWER_CTL);
        assert_eq!(settings[0].value, bits::POWER_CTL_STANDBY);
        assert!(settings
            .iter()
            .any(|s| s.register == reg::BW_RATE && s.value == 0x07));
        assert!(settings
            .iter()
            .any(|s| s.register == reg::THRESH_ACT && s.value == 1));
        // INT_ENABLE is deliberately absent: interrupts stay off until the
        // controller enters eventing mode.
        assert!(!settings.iter().any(|s| s.register == reg::INT_ENABLE));
    }
}
