//! Core logic for a 3-axis accelerometer driver
//!
//! This crate holds everything between the raw register bus and the
//! embedder-facing API: multi-client settings arbitration, the data update
//! mode state machine, the property/data cache, and report interval
//! throttling.
//!
//! ```text
//!   clients ──▶ [ClientRegistry]        (min-fold of wishes)
//!                     │ arbitrated settings + target mode
//!                     ▼
//!              [SensorController] ◀──── sample_ready() from the IRQ path
//!                │           │
//!        [RegisterBus]   [PropertyCache] ──▶ get_properties / get_data_fields
//!                            │
//!                     [ReportThrottle] ──▶ broadcast events (data, state)
//! ```
//!
//! The controller is cheap to clone and fully thread-safe; every clone
//! shares the same device.

pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod properties;
pub mod store;
pub mod throttle;
pub mod types;

pub use clients::{ArbitratedSettings, ClientId, ClientRegistry, FieldResultMap};
pub use config::SensorConfig;
pub use controller::SensorController;
pub use error::SensorError;
pub use properties::{FieldId, PropertyCache, PropertyKey, PropertyValue};
pub use store::{MemoryStore, PropertyStore};
pub use throttle::{ReportSink, ReportThrottle};
pub use types::{DataMap, Mode, ResultMap, SensorEvent, SensorEventKind, SensorState};
