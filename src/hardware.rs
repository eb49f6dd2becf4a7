//! Hardware capabilities consumed by the supervisor
//!
//! The shared bus (multiplexer, voltage meter, relay expander) and the GPIO
//! outputs are abstract so the control logic runs unchanged against the
//! simulated rig or a Raspberry Pi.

use crate::error::Result;

pub mod sim;

#[cfg(feature = "hardware")]
pub mod rpi;

/// Register-level access to the shared local bus
///
/// Implementations are blocking; callers only reach them through
/// [`crate::bus::BusArbiter`], which serializes every access.
pub trait HardwareBus: Send {
    /// Send a single byte (no register)
    fn write_byte(&mut self, addr: u16, value: u8) -> Result<()>;

    /// Receive a single byte (no register)
    fn read_byte(&mut self, addr: u16) -> Result<u8>;

    /// Read a 16-bit register as transferred on the wire (low byte first)
    fn read_word(&mut self, addr: u16, reg: u8) -> Result<u16>;

    /// Write an 8-bit register
    fn write_byte_data(&mut self, addr: u16, reg: u8, value: u8) -> Result<()>;

    /// Write a 16-bit register
    fn write_word(&mut self, addr: u16, reg: u8, value: u16) -> Result<()>;

    /// Route the multiplexer to one downstream channel
    fn select_channel(&mut self, mux_addr: u16, channel: u8) -> Result<()> {
        self.write_byte(mux_addr, 1u8 << (channel & 0x07))
    }
}

/// Digital outputs: DC-DC converter enable and alarm
pub trait OutputPins: Send {
    fn set_converter(&mut self, enabled: bool) -> Result<()>;
    fn set_alarm(&mut self, enabled: bool) -> Result<()>;
}

/// Everything guarded by the bus lock
pub struct Hardware {
    pub bus: Box<dyn HardwareBus>,
    pub pins: Box<dyn OutputPins>,
}

impl Hardware {
    pub fn new(bus: Box<dyn HardwareBus>, pins: Box<dyn OutputPins>) -> Self {
        Self { bus, pins }
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware").finish_non_exhaustive()
    }
}
