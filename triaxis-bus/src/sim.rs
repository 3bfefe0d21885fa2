//! In-memory simulated bus backend
//!
//! `SimBus` models the device's register file well enough to drive the
//! sensor core without hardware: sequential register reads/writes,
//! read-to-clear interrupt source, and fault injection for exercising
//! failure paths. It also keeps a write log so tests can assert on the
//! exact register sequences the core produces.

use parking_lot::Mutex;

use async_trait::async_trait;

use crate::error::BusError;
use crate::registers::{bits, reg, DEVICE_ID, REGISTER_FILE_LEN};
use crate::sample::SCALE_G_PER_LSB;
use crate::RegisterBus;

struct SimState {
    file: [u8; REGISTER_FILE_LEN],
    write_log: Vec<(u8, u8)>,
    fail_writes: usize,
    fail_reads: usize,
    disconnected: bool,
}

/// Simulated register bus
pub struct SimBus {
    state: Mutex<SimState>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        let mut file = [0u8; REGISTER_FILE_LEN];
        file[reg::DEVID as usize] = DEVICE_ID;

        Self {
            state: Mutex::new(SimState {
                file,
                write_log: Vec::new(),
                fail_writes: 0,
                fail_reads: 0,
                disconnected: false,
            }),
        }
    }

    /// Load a measurement into the data registers, in g.
    pub fn set_sample(&self, x_g: f64, y_g: f64, z_g: f64) {
        let to_raw = |g: f64| (g / SCALE_G_PER_LSB) as i16;
        self.set_sample_raw(to_raw(x_g), to_raw(y_g), to_raw(z_g));
    }

    /// Load a raw measurement into the data registers.
    pub fn set_sample_raw(&self, x: i16, y: i16, z: i16) {
        let mut state = self.state.lock();
        let base = reg::DATA_X0 as usize;
        state.file[base..base + 2].copy_from_slice(&x.to_le_bytes());
        state.file[base + 2..base + 4].copy_from_slice(&y.to_le_bytes());
        state.file[base + 4..base + 6].copy_from_slice(&z.to_le_bytes());
    }

    /// Latch an activity interrupt in INT_SOURCE.
    pub fn raise_activity(&self) {
        let mut state = self.state.lock();
        state.file[reg::INT_SOURCE as usize] |= bits::INT_ACTIVITY;
    }

    /// Fail the next `count` writes with an I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_writes = count;
    }

    /// Fail the next `count` reads with an I/O error.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().fail_reads = count;
    }

    /// Simulate the device going away; all further I/O fails.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    /// Current value of a register, without read side effects.
    pub fn register(&self, register: u8) -> u8 {
        self.state.lock().file[register as usize]
    }

    /// All (register, value) writes seen so far, oldest first.
    pub fn write_log(&self) -> Vec<(u8, u8)> {
        self.state.lock().write_log.clone()
    }

    /// Clear the write log.
    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }
}

#[async_trait]
impl RegisterBus for SimBus {
    async fn read_registers(&self, start: u8, count: usize) -> Result<Vec<u8>, BusError> {
        let mut state = self.state.lock();

        if state.disconnected {
            return Err(BusError::Disconnected);
        }

        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(BusError::Io("simulated read failure".into()));
        }

        let start = start as usize;
        let end = start + count;
        if end > REGISTER_FILE_LEN {
            return Err(BusError::InvalidAddress {
                register: start as u8,
            });
        }

        let out = state.file[start..end].to_vec();

        // Reading INT_SOURCE acknowledges pending interrupts
        let int_source = reg::INT_SOURCE as usize;
        if (start..end).contains(&int_source) {
            state.file[int_source] = 0;
        }

        Ok(out)
    }

    async fn write_registers(&self, start: u8, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.lock();

        if state.disconnected {
            return Err(BusError::Disconnected);
        }

        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(BusError::Io("simulated write failure".into()));
        }

        let base = start as usize;
        if base + data.len() > REGISTER_FILE_LEN {
            return Err(BusError::InvalidAddress { register: start });
        }

        for (offset, value) in data.iter().enumerate() {
            let register = base + offset;
            state.file[register] = *value;
            state.write_log.push((register as u8, *value));
        }

        Ok(())
    }
}
