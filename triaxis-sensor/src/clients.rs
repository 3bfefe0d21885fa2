//! Client registry and settings arbitration
//!
//! Tracks every connected client's desired report interval and per-field
//! change sensitivities, and folds them into one arbitrated setting set:
//! the minimum interval and the minimum sensitivity per field across all
//! clients, with configured defaults backfilling anything no client has
//! expressed a wish about.
//!
//! Every mutation re-runs the fold before returning, so readers always see
//! settings consistent with the current client population.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::properties::{FieldId, PropertyValue};
use crate::types::{Mode, ResultMap};

/// Opaque client handle minted by the embedder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Per-field results of a sensitivity update
pub type FieldResultMap = ResultMap<FieldId>;

/// Interval value meaning "this client has not set an interval".
const INTERVAL_UNSET: u32 = 0;

#[derive(Debug, Default)]
struct ClientEntry {
    subscribed: bool,
    /// 0 means unset; any other value is an explicit request in ms.
    desired_interval: u32,
    /// Only fields the client explicitly set appear here.
    desired_sensitivity: BTreeMap<FieldId, f64>,
}

struct Clients {
    entries: BTreeMap<ClientId, ClientEntry>,
    /// Tracked redundantly with `entries.len()`; a mismatch indicates
    /// corrupted internal state and fails the operation.
    client_count: usize,
    subscriber_count: usize,
}

/// Arbitrated settings across all connected clients
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitratedSettings {
    /// Effective report interval in ms (default if no client set one).
    pub report_interval_ms: u32,
    /// True iff at least one client explicitly set an interval.
    pub interval_explicit: bool,
    /// Effective per-field change sensitivity in g.
    pub sensitivity: BTreeMap<FieldId, f64>,
}

/// Registry of connected clients with settings arbitration
pub struct ClientRegistry {
    config: SensorConfig,
    // Lock order: clients before arbitrated, never the reverse.
    clients: Mutex<Clients>,
    arbitrated: Mutex<ArbitratedSettings>,
}

impl ClientRegistry {
    pub fn new(config: SensorConfig) -> Self {
        let arbitrated = ArbitratedSettings {
            report_interval_ms: config.default_report_interval_ms,
            interval_explicit: false,
            sensitivity: config.default_sensitivities(),
        };

        Self {
            config,
            clients: Mutex::new(Clients {
                entries: BTreeMap::new(),
                client_count: 0,
                subscriber_count: 0,
            }),
            arbitrated: Mutex::new(arbitrated),
        }
    }

    /// Register a new client.
    pub fn connect(&self, id: ClientId) -> Result<(), SensorError> {
        let mut clients = self.clients.lock();

        if clients.entries.contains_key(&id) {
            return Err(SensorError::AlreadyExists(format!(
                "{id} is already connected"
            )));
        }

        clients.entries.insert(id, ClientEntry::default());
        clients.client_count += 1;
        self.check_counts(&clients)?;

        info!("Client connected: {id} ({} total)", clients.client_count);
        self.recalculate(&clients);
        Ok(())
    }

    /// Remove a client; its subscription and settings stop contributing.
    pub fn disconnect(&self, id: ClientId) -> Result<(), SensorError> {
        let mut clients = self.clients.lock();

        let entry = clients
            .entries
            .remove(&id)
            .ok_or_else(|| SensorError::NotFound(format!("{id} is not connected")))?;

        clients.client_count -= 1;
        if entry.subscribed {
            clients.subscriber_count -= 1;
        }
        self.check_counts(&clients)?;

        info!("Client disconnected: {id} ({} left)", clients.client_count);
        self.recalculate(&clients);
        Ok(())
    }

    /// Subscribe a connected client to event notifications.
    pub fn subscribe(&self, id: ClientId) -> Result<(), SensorError> {
        let mut clients = self.clients.lock();

        let entry = clients
            .entries
            .get_mut(&id)
            .ok_or_else(|| SensorError::NotFound(format!("{id} is not connected")))?;

        if entry.subscribed {
            return Err(SensorError::InvalidState(format!(
                "{id} is already subscribed"
            )));
        }

        entry.subscribed = true;
        clients.subscriber_count += 1;

        debug!("Client subscribed: {id}");
        self.recalculate(&clients);
        Ok(())
    }

    /// Drop a client's event subscription.
    pub fn unsubscribe(&self, id: ClientId) -> Result<(), SensorError> {
        let mut clients = self.clients.lock();

        let entry = clients
            .entries
            .get_mut(&id)
            .ok_or_else(|| SensorError::NotFound(format!("{id} is not connected")))?;

        if !entry.subscribed {
            return Err(SensorError::InvalidState(format!(
                "{id} is not subscribed"
            )));
        }

        entry.subscribed = false;
        clients.subscriber_count -= 1;

        debug!("Client unsubscribed: {id}");
        self.recalculate(&clients);
        Ok(())
    }

    /// Set (or clear, with 0) a client's desired report interval.
    pub fn set_desired_report_interval(
        &self,
        id: ClientId,
        interval_ms: u32,
    ) -> Result<(), SensorError> {
        if interval_ms != INTERVAL_UNSET && interval_ms < self.config.min_report_interval_ms {
            return Err(SensorError::InvalidArgument(format!(
                "report interval {interval_ms} ms is below the minimum of {} ms",
                self.config.min_report_interval_ms
            )));
        }

        let mut clients = self.clients.lock();

        let entry = clients
            .entries
            .get_mut(&id)
            .ok_or_else(|| SensorError::NotFound(format!("{id} is not connected")))?;

        entry.desired_interval = interval_ms;

        debug!("Client {id} desired report interval: {interval_ms} ms");
        self.recalculate(&clients);
        Ok(())
    }

    /// Update a client's desired per-field change sensitivities.
    ///
    /// Each field is validated independently; valid entries apply even when
    /// others fail. `None` clears a field back to the default. The returned
    /// map carries the per-field outcome.
    pub fn set_desired_sensitivity(
        &self,
        id: ClientId,
        desired: &BTreeMap<FieldId, Option<f64>>,
    ) -> Result<FieldResultMap, SensorError> {
        let mut clients = self.clients.lock();

        let entry = clients
            .entries
            .get_mut(&id)
            .ok_or_else(|| SensorError::NotFound(format!("{id} is not connected")))?;

        let mut results = FieldResultMap::default();

        for (field, value) in desired {
            if !field.is_sensitivity_bearing() {
                results.insert_err(
                    *field,
                    SensorError::NotSupported(format!(
                        "{field} does not carry a change sensitivity"
                    )),
                );
                continue;
            }

            match value {
                None => {
                    entry.desired_sensitivity.remove(field);
                    results.insert_ok(*field, PropertyValue::Empty);
                }
                Some(g) if g.is_finite() && *g >= 0.0 => {
                    entry.desired_sensitivity.insert(*field, *g);
                    results.insert_ok(*field, PropertyValue::Double(*g));
                }
                Some(g) => {
                    results.insert_err(
                        *field,
                        SensorError::InvalidArgument(format!(
                            "change sensitivity {g} for {field} is not a finite non-negative value"
                        )),
                    );
                }
            }
        }

        self.recalculate(&clients);
        Ok(results)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().client_count
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().subscriber_count
    }

    /// Data update mode implied by the current client population.
    pub fn data_update_mode(&self) -> Mode {
        let clients = self.clients.lock();

        if clients.client_count == 0 {
            return Mode::Off;
        }

        let explicit_interval = clients
            .entries
            .values()
            .any(|e| e.desired_interval != INTERVAL_UNSET);

        if clients.subscriber_count > 0 || explicit_interval {
            Mode::Eventing
        } else {
            Mode::Polling
        }
    }

    /// Snapshot of the current arbitrated settings.
    pub fn arbitrated(&self) -> ArbitratedSettings {
        self.arbitrated.lock().clone()
    }

    fn check_counts(&self, clients: &Clients) -> Result<(), SensorError> {
        if clients.client_count != clients.entries.len() {
            error!(
                "Client count mismatch: tracked {} but {} entries exist",
                clients.client_count,
                clients.entries.len()
            );
            return Err(SensorError::Internal(
                "client count does not match the registry".into(),
            ));
        }
        Ok(())
    }

    /// Re-fold every client's wishes into the arbitrated settings.
    ///
    /// Resets to "nothing requested", folds each client in with min(), then
    /// backfills defaults for anything still unset.
    fn recalculate(&self, clients: &Clients) {
        let mut interval = INTERVAL_UNSET;
        let mut sensitivity: BTreeMap<FieldId, f64> = BTreeMap::new();

        for entry in clients.entries.values() {
            if entry.desired_interval != INTERVAL_UNSET {
                interval = if interval == INTERVAL_UNSET {
                    entry.desired_interval
                } else {
                    interval.min(entry.desired_interval)
                };
            }

            for (field, g) in &entry.desired_sensitivity {
                sensitivity
                    .entry(*field)
                    .and_modify(|current| *current = current.min(*g))
                    .or_insert(*g);
            }
        }

        let interval_explicit = interval != INTERVAL_UNSET;
        let report_interval_ms = if interval_explicit {
            interval
        } else {
            self.config.default_report_interval_ms
        };

        for (field, default) in self.config.default_sensitivities() {
            sensitivity.entry(field).or_insert(default);
        }

        let mut arbitrated = self.arbitrated.lock();
        let next = ArbitratedSettings {
            report_interval_ms,
            interval_explicit,
            sensitivity,
        };
        if *arbitrated != next {
            debug!(
                "Arbitrated settings: interval {} ms (explicit: {})",
                next.report_interval_ms, next.interval_explicit
            );
        }
        *arbitrated = next;
    }
}
